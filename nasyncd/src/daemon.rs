use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use nasync_core::NasClient;
use notify::RecommendedWatcher;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::service::SyncService;
use crate::sync::backoff::Backoff;
use crate::sync::local::{UriSourceResolver, filesystem_root};
use crate::sync::local_watcher::{LocalEvent, next_batch, start_notify_watcher};
use crate::sync::model::{SyncFolderConfig, SyncStatus};
use crate::sync::registry::SyncFolderRegistry;
use crate::sync::remote::{NasRemote, RemoteFs};
use crate::sync::store::SyncStore;
use crate::sync::transfer::TransferConfig;
use crate::sync::{EngineConfig, SyncError, SyncOrchestrator};

const DEFAULT_REMOTE_URL: &str = "http://nas.local:8080";
const DEFAULT_DEVICE_ID: &str = "nasync-device";
const DEFAULT_POLL_SECS: u64 = 300;
const DEFAULT_PROBE_SECS: u64 = 30;
const DEFAULT_MAX_ATTEMPTS: u64 = 3;
const DEFAULT_TRANSFER_CONCURRENCY: u64 = 2;
const DEFAULT_STALL_TIMEOUT_SECS: u64 = 60;
const DEFAULT_CHUNK_SIZE: u64 = 256 * 1024;
const LOCAL_EVENT_QUIET_MS: u64 = 750;

type EnvLookup<'a> = &'a dyn Fn(&str) -> Option<String>;

#[derive(Clone, Debug)]
pub struct DaemonConfig {
    pub remote_url: String,
    pub token: Option<String>,
    pub device_id: String,
    pub db_path: PathBuf,
    pub poll_interval: Duration,
    pub probe_interval: Duration,
    pub max_attempts: u32,
    pub transfer_concurrency: usize,
    pub stall_timeout: Duration,
    pub chunk_size: usize,
    pub enable_local_watcher: bool,
}

impl DaemonConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let home = dirs::home_dir().context("home directory is unavailable")?;
        Ok(Self::from_lookup(&|name| std::env::var(name).ok(), &home))
    }

    fn from_lookup(env: EnvLookup<'_>, home: &Path) -> Self {
        let remote_url = env("NASYNC_REMOTE_URL")
            .filter(|value| !value.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_REMOTE_URL.to_string());
        let token = env("NASYNC_TOKEN").filter(|value| !value.trim().is_empty());
        let device_id = env("NASYNC_DEVICE_ID")
            .or_else(|| env("HOSTNAME"))
            .filter(|value| !value.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_DEVICE_ID.to_string());
        let db_path = env("NASYNC_DB_PATH")
            .map(|value| expand_with_home(&value, home))
            .unwrap_or_else(default_db_path);

        Self {
            remote_url,
            token,
            device_id,
            db_path,
            poll_interval: Duration::from_secs(read_u64_env(env, "NASYNC_POLL_SECS", DEFAULT_POLL_SECS)),
            probe_interval: Duration::from_secs(read_u64_env(
                env,
                "NASYNC_PROBE_SECS",
                DEFAULT_PROBE_SECS,
            )),
            max_attempts: clamp_u32(read_u64_env(env, "NASYNC_MAX_ATTEMPTS", DEFAULT_MAX_ATTEMPTS)),
            transfer_concurrency: clamp_usize(read_u64_env(
                env,
                "NASYNC_TRANSFER_CONCURRENCY",
                DEFAULT_TRANSFER_CONCURRENCY,
            )),
            stall_timeout: Duration::from_secs(read_u64_env(
                env,
                "NASYNC_STALL_TIMEOUT_SECS",
                DEFAULT_STALL_TIMEOUT_SECS,
            )),
            chunk_size: clamp_usize(read_u64_env(env, "NASYNC_CHUNK_SIZE", DEFAULT_CHUNK_SIZE)),
            enable_local_watcher: read_bool_env(env, "NASYNC_ENABLE_LOCAL_WATCHER", true),
        }
    }

    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            max_attempts: self.max_attempts,
            backoff: Backoff::default(),
            concurrency: self.transfer_concurrency,
            transfer: TransferConfig {
                chunk_size: self.chunk_size,
                stall_timeout: self.stall_timeout,
            },
        }
    }
}

pub struct DaemonRuntime {
    config: DaemonConfig,
    service: SyncService,
    remote: Arc<dyn RemoteFs>,
}

impl DaemonRuntime {
    pub async fn bootstrap(config: DaemonConfig) -> anyhow::Result<Self> {
        let token = config
            .token
            .clone()
            .context("NASYNC_TOKEN is not set; the daemon needs a bearer token for the NAS")?;
        let client = NasClient::new(&config.remote_url, token)
            .with_context(|| format!("invalid NAS url {}", config.remote_url))?;
        let remote: Arc<dyn RemoteFs> = Arc::new(NasRemote::new(client));

        let store = SyncStore::open(&config.db_path)
            .await
            .with_context(|| format!("failed to open sync database at {:?}", config.db_path))?;
        let registry = SyncFolderRegistry::load(store.clone(), config.device_id.clone())
            .await
            .context("failed to load sync folders")?;
        let orchestrator = Arc::new(SyncOrchestrator::new(
            store,
            registry,
            Arc::clone(&remote),
            Arc::new(UriSourceResolver::new()),
            config.engine_config(),
        ));
        let service = SyncService::new(orchestrator);
        service
            .start()
            .await
            .context("failed to recover state from the previous run")?;

        Ok(Self {
            config,
            service,
            remote,
        })
    }

    pub fn service(&self) -> &SyncService {
        &self.service
    }

    pub async fn run(self) -> anyhow::Result<()> {
        info!(
            remote = %self.config.remote_url,
            device = %self.config.device_id,
            db = %self.config.db_path.display(),
            local_watcher = self.config.enable_local_watcher,
            "nasyncd started"
        );

        let poll_service = self.service.clone();
        let poll_interval = self.config.poll_interval;
        let poll_handle = tokio::spawn(async move {
            loop {
                match trigger_auto_folders(&poll_service).await {
                    Ok(0) => {}
                    Ok(started) => debug!(started, "periodic sync triggered"),
                    Err(err) => warn!(error = %err, "periodic sync could not list folders"),
                }
                tokio::time::sleep(poll_interval).await;
            }
        });

        let probe_service = self.service.clone();
        let probe_remote = Arc::clone(&self.remote);
        let probe_interval = self.config.probe_interval;
        let probe_handle = tokio::spawn(async move {
            let mut online = true;
            loop {
                tokio::time::sleep(probe_interval).await;
                let reachable = match probe_remote.probe().await {
                    Ok(()) => true,
                    Err(err) => {
                        debug!(error = %err, "connectivity probe failed");
                        false
                    }
                };
                if connectivity_restored(online, reachable) {
                    info!("NAS reachable again, resuming sync");
                    if let Err(err) = trigger_auto_folders(&probe_service).await {
                        warn!(error = %err, "could not trigger sync after reconnect");
                    }
                } else if online && !reachable {
                    warn!("NAS unreachable, queued operations wait for the connection");
                }
                online = reachable;
            }
        });

        let watcher_handle = self.config.enable_local_watcher.then(|| {
            let service = self.service.clone();
            tokio::spawn(run_local_watchers(
                service,
                Duration::from_millis(LOCAL_EVENT_QUIET_MS),
            ))
        });

        tokio::signal::ctrl_c()
            .await
            .context("failed waiting for shutdown signal")?;
        info!("shutting down");

        poll_handle.abort();
        probe_handle.abort();
        if let Some(handle) = watcher_handle {
            handle.abort();
        }
        for folder in self.service.list_folders().await.unwrap_or_default() {
            self.service.orchestrator().cancel_folder(&folder.id);
        }

        Ok(())
    }
}

/// A watched filesystem folder. Dropping it stops the watcher and its event task.
struct WatchedFolder {
    root: PathBuf,
    _watcher: RecommendedWatcher,
    task: JoinHandle<()>,
}

impl Drop for WatchedFolder {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Keeps one filesystem watcher per folder with a plain directory root, following
/// folder creation, edits and deletion.
async fn run_local_watchers(service: SyncService, quiet: Duration) {
    let mut folders = service.observe_folders();
    let mut active = HashMap::new();
    loop {
        let snapshot = folders.borrow_and_update().clone();
        reconcile_watchers(&service, &snapshot, &mut active, quiet);
        if folders.changed().await.is_err() {
            break;
        }
    }
}

fn reconcile_watchers(
    service: &SyncService,
    folders: &[SyncFolderConfig],
    active: &mut HashMap<String, WatchedFolder>,
    quiet: Duration,
) {
    active.retain(|id, watched| {
        folders.iter().any(|folder| {
            &folder.id == id
                && filesystem_root(&folder.local_root).as_deref() == Some(watched.root.as_path())
        })
    });
    for folder in folders {
        if active.contains_key(&folder.id) {
            continue;
        }
        let Some(root) = filesystem_root(&folder.local_root) else {
            continue;
        };
        match start_notify_watcher(&root) {
            Ok((watcher, rx)) => {
                let task = tokio::spawn(forward_local_events(
                    service.clone(),
                    folder.id.clone(),
                    rx,
                    quiet,
                ));
                debug!(folder = %folder.id, root = %root.display(), "watching local folder");
                active.insert(
                    folder.id.clone(),
                    WatchedFolder {
                        root,
                        _watcher: watcher,
                        task,
                    },
                );
            }
            Err(err) => {
                warn!(folder = %folder.id, root = %root.display(), error = %err, "failed to watch local folder");
            }
        }
    }
}

async fn forward_local_events(
    service: SyncService,
    folder_id: String,
    mut rx: mpsc::UnboundedReceiver<LocalEvent>,
    quiet: Duration,
) {
    while let Some(batch) = next_batch(&mut rx, quiet).await {
        debug!(folder = %folder_id, events = batch.len(), "local changes observed");
        match apply_local_batch(&service, &folder_id, &batch).await {
            Ok(true) => {
                service.trigger_sync(&folder_id);
            }
            Ok(false) => {}
            Err(err) => warn!(folder = %folder_id, error = %err, "failed to handle local changes"),
        }
    }
}

include!("daemon_helpers.rs");

#[cfg(test)]
#[path = "daemon_tests.rs"]
mod tests;
