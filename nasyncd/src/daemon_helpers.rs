fn expand_with_home(value: &str, home: &Path) -> PathBuf {
    if value == "~" {
        return home.to_path_buf();
    }
    if let Some(rest) = value.strip_prefix("~/") {
        return home.join(rest);
    }
    PathBuf::from(value)
}

fn default_db_path() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("nasync")
        .join("sync.db")
}

fn read_u64_env(env: EnvLookup<'_>, name: &str, default: u64) -> u64 {
    env(name)
        .and_then(|value| value.trim().parse::<u64>().ok())
        .filter(|value| *value > 0)
        .unwrap_or(default)
}

fn read_bool_env(env: EnvLookup<'_>, name: &str, default: bool) -> bool {
    env(name)
        .map(|value| {
            matches!(
                value.trim().to_ascii_lowercase().as_str(),
                "1" | "true" | "yes" | "on"
            )
        })
        .unwrap_or(default)
}

fn clamp_u32(value: u64) -> u32 {
    u32::try_from(value).unwrap_or(u32::MAX)
}

fn clamp_usize(value: u64) -> usize {
    usize::try_from(value).unwrap_or(usize::MAX)
}

fn should_auto_sync(folder: &SyncFolderConfig) -> bool {
    folder.auto_sync && folder.status != SyncStatus::Paused
}

fn connectivity_restored(was_online: bool, online: bool) -> bool {
    !was_online && online
}

/// Starts a pass for every auto-sync folder that is not paused. Returns how many started.
async fn trigger_auto_folders(service: &SyncService) -> Result<usize, SyncError> {
    let mut started = 0;
    for folder in service.list_folders().await? {
        if should_auto_sync(&folder) {
            service.trigger_sync(&folder.id);
            started += 1;
        }
    }
    Ok(started)
}

/// Queues the moves of a batch of local events. Returns whether the folder should
/// sync now; other changes are picked up by the pass.
async fn apply_local_batch(
    service: &SyncService,
    folder_id: &str,
    batch: &[LocalEvent],
) -> Result<bool, SyncError> {
    let orchestrator = service.orchestrator();
    let folder = orchestrator.registry().get(folder_id).await?;
    for event in batch {
        if let LocalEvent::Moved { from, to } = event
            && let Some(id) = orchestrator.record_local_move(folder_id, from, to).await?
        {
            debug!(folder = %folder_id, from = %from, to = %to, id, "local move queued");
        }
    }
    Ok(should_auto_sync(&folder))
}

fn format_millis(ms: i64) -> Option<String> {
    let at = time::OffsetDateTime::from_unix_timestamp_nanos(i128::from(ms) * 1_000_000).ok()?;
    at.format(&time::format_description::well_known::Rfc3339).ok()
}

fn format_folder_status(folder: &SyncFolderConfig) -> String {
    let last_sync = folder
        .last_sync
        .and_then(format_millis)
        .unwrap_or_else(|| "never".to_string());
    let mut line = format!(
        "{} {} -> {} [{}, {}] last_sync={}",
        folder.id,
        folder.local_root,
        folder.remote_path,
        folder.sync_type.as_str(),
        folder.status.as_str(),
        last_sync
    );
    if let Some(error) = &folder.last_error {
        line.push_str(&format!(" error={error}"));
    }
    line
}

/// One line per configured folder, read straight from the database.
pub async fn folder_status_lines(config: &DaemonConfig) -> anyhow::Result<Vec<String>> {
    let store = SyncStore::open(&config.db_path)
        .await
        .with_context(|| format!("failed to open sync database at {:?}", config.db_path))?;
    let folders = store.list_folders().await.context("failed to list folders")?;
    Ok(folders.iter().map(format_folder_status).collect())
}
