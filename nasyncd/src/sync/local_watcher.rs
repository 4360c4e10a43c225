use std::path::Path;
use std::time::Duration;

use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;

use super::local::PARTIAL_SUFFIX;
use super::paths::normalize_relative;

/// A filesystem change below a watched folder root, as a folder-relative path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LocalEvent {
    Changed { path: String },
    Removed { path: String },
    Moved { from: String, to: String },
}

pub fn start_notify_watcher(
    root: &Path,
) -> notify::Result<(RecommendedWatcher, mpsc::UnboundedReceiver<LocalEvent>)> {
    let (tx, rx) = mpsc::unbounded_channel();
    let root = root.to_path_buf();
    let watch_root = root.clone();
    let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| {
        if let Ok(event) = res {
            for local in map_event(&watch_root, event) {
                let _ = tx.send(local);
            }
        }
    })?;
    watcher.watch(root.as_path(), RecursiveMode::Recursive)?;
    Ok((watcher, rx))
}

/// Waits for the next event, then keeps collecting until `quiet` passes without one.
/// `None` once the watcher is gone.
pub async fn next_batch(
    rx: &mut mpsc::UnboundedReceiver<LocalEvent>,
    quiet: Duration,
) -> Option<Vec<LocalEvent>> {
    let mut batch = vec![rx.recv().await?];
    while let Ok(Some(event)) = tokio::time::timeout(quiet, rx.recv()).await {
        batch.push(event);
    }
    Some(batch)
}

fn map_event(root: &Path, event: Event) -> Vec<LocalEvent> {
    match event.kind {
        EventKind::Modify(notify::event::ModifyKind::Name(_)) if event.paths.len() >= 2 => {
            match (
                to_relative(root, &event.paths[0]),
                to_relative(root, &event.paths[1]),
            ) {
                (Some(from), Some(to)) => vec![LocalEvent::Moved { from, to }],
                // A finished download renames its partial file into place.
                (None, Some(path)) => vec![LocalEvent::Changed { path }],
                (Some(path), None) => vec![LocalEvent::Removed { path }],
                (None, None) => Vec::new(),
            }
        }
        EventKind::Create(_) | EventKind::Modify(_) => event
            .paths
            .into_iter()
            .filter_map(|path| to_relative(root, &path))
            .map(|path| LocalEvent::Changed { path })
            .collect(),
        EventKind::Remove(_) => event
            .paths
            .into_iter()
            .filter_map(|path| to_relative(root, &path))
            .map(|path| LocalEvent::Removed { path })
            .collect(),
        _ => Vec::new(),
    }
}

fn to_relative(root: &Path, path: &Path) -> Option<String> {
    let relative = path.strip_prefix(root).ok()?;
    let relative = relative.to_string_lossy();
    if relative.ends_with(PARTIAL_SUFFIX) {
        return None;
    }
    normalize_relative(&relative).ok()
}
