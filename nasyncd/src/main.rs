use nasyncd::daemon::{DaemonConfig, DaemonRuntime, folder_status_lines};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CliMode {
    Run,
    Status,
    Help,
}

fn parse_cli_mode<I>(args: I) -> anyhow::Result<CliMode>
where
    I: IntoIterator<Item = String>,
{
    let mut mode = CliMode::Run;
    for arg in args.into_iter().skip(1) {
        match arg.as_str() {
            "--status" => mode = CliMode::Status,
            "--help" | "-h" => mode = CliMode::Help,
            other => anyhow::bail!("unknown argument: {other}"),
        }
    }
    Ok(mode)
}

fn init_tracing() {
    let filter = EnvFilter::try_from_env("NASYNC_LOG").unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let mode = parse_cli_mode(std::env::args())?;
    if mode == CliMode::Help {
        println!("Usage: nasyncd [--status]");
        println!("  --status   Print configured sync folders and exit");
        return Ok(());
    }
    init_tracing();
    let config = DaemonConfig::from_env()?;
    if mode == CliMode::Status {
        for line in folder_status_lines(&config).await? {
            println!("{line}");
        }
        return Ok(());
    }
    let daemon = DaemonRuntime::bootstrap(config).await?;
    daemon.run().await
}
