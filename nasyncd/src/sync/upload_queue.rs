use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};

use serde::Serialize;
use tokio::sync::{Semaphore, broadcast, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::error::SyncError;
use super::model::{
    OperationState, QueuedOperation, TransferDirection, UploadQueueItem, UploadStatus,
};
use super::observe::KeyedWatch;
use super::paths::{file_name, join_remote};

pub const DEFAULT_CONCURRENCY: usize = 2;
const PROGRESS_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ProgressEvent {
    pub id: i64,
    pub percent: u8,
}

struct Tracked {
    item: UploadQueueItem,
    token: Option<CancellationToken>,
    last_percent: Option<u8>,
}

#[derive(Default)]
struct Inner {
    items: BTreeMap<i64, Tracked>,
    limits: HashMap<String, Arc<Semaphore>>,
}

/// Per-item transfer state shown to the user. Item ids are queued operation ids.
pub struct UploadQueueManager {
    inner: Mutex<Inner>,
    watch: KeyedWatch<Vec<UploadQueueItem>>,
    progress: broadcast::Sender<ProgressEvent>,
    concurrency: usize,
}

impl UploadQueueManager {
    pub fn new(concurrency: usize) -> Self {
        let (progress, _) = broadcast::channel(PROGRESS_CAPACITY);
        Self {
            inner: Mutex::new(Inner::default()),
            watch: KeyedWatch::new(),
            progress,
            concurrency: concurrency.max(1),
        }
    }

    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    /// Adds a pending item; an existing item with the same id is returned untouched.
    pub fn submit(&self, item: UploadQueueItem) -> i64 {
        let id = item.id;
        let folder_id = item.folder_id.clone();
        {
            let mut inner = self.lock();
            if inner.items.contains_key(&id) {
                return id;
            }
            let item = UploadQueueItem {
                status: UploadStatus::Pending,
                transferred_bytes: 0,
                can_retry: false,
                error: None,
                ..item
            };
            inner.items.insert(
                id,
                Tracked {
                    item,
                    token: None,
                    last_percent: None,
                },
            );
        }
        self.publish(&folder_id);
        id
    }

    /// `pending -> uploading`; the returned token is cancelled by [`UploadQueueManager::cancel`].
    pub fn begin(&self, id: i64, parent: &CancellationToken) -> Result<CancellationToken, SyncError> {
        let (folder_id, token) = {
            let mut inner = self.lock();
            let tracked = inner
                .items
                .get_mut(&id)
                .ok_or_else(|| SyncError::NotFound(format!("upload item {id}")))?;
            if tracked.item.status != UploadStatus::Pending {
                return Err(SyncError::InvalidState(format!(
                    "upload item {id} is {}",
                    tracked.item.status
                )));
            }
            let token = parent.child_token();
            tracked.item.status = UploadStatus::Uploading;
            tracked.item.transferred_bytes = 0;
            tracked.item.error = None;
            tracked.last_percent = None;
            tracked.token = Some(token.clone());
            (tracked.item.folder_id.clone(), token)
        };
        self.publish(&folder_id);
        Ok(token)
    }

    pub fn set_total(&self, id: i64, total_bytes: u64) {
        let folder_id = {
            let mut inner = self.lock();
            let Some(tracked) = inner.items.get_mut(&id) else {
                return;
            };
            tracked.item.total_bytes = total_bytes;
            tracked.item.folder_id.clone()
        };
        self.publish(&folder_id);
    }

    /// Records cumulative bytes. Percentages only ever move forward within an attempt.
    pub fn report_progress(&self, id: i64, transferred: u64) {
        let (folder_id, percent) = {
            let mut inner = self.lock();
            let Some(tracked) = inner.items.get_mut(&id) else {
                return;
            };
            if tracked.item.status != UploadStatus::Uploading {
                return;
            }
            if transferred <= tracked.item.transferred_bytes {
                return;
            }
            // A body larger than announced grows the total so that transferred <= total.
            tracked.item.total_bytes = tracked.item.total_bytes.max(transferred);
            tracked.item.transferred_bytes = transferred;
            let percent = tracked.item.percent();
            let emitted = match tracked.last_percent {
                Some(last) if percent <= last => None,
                _ => {
                    tracked.last_percent = Some(percent);
                    Some(percent)
                }
            };
            (tracked.item.folder_id.clone(), emitted)
        };
        if let Some(percent) = percent {
            let _ = self.progress.send(ProgressEvent { id, percent });
        }
        self.publish(&folder_id);
    }

    pub fn complete(&self, id: i64) {
        let folder_id = {
            let mut inner = self.lock();
            let Some(tracked) = inner.items.get_mut(&id) else {
                return;
            };
            tracked.item.status = UploadStatus::Completed;
            tracked.item.transferred_bytes = tracked.item.total_bytes;
            tracked.item.can_retry = false;
            tracked.item.error = None;
            tracked.token = None;
            if tracked.last_percent != Some(100) {
                tracked.last_percent = Some(100);
                let _ = self.progress.send(ProgressEvent { id, percent: 100 });
            }
            tracked.item.folder_id.clone()
        };
        self.publish(&folder_id);
    }

    pub fn fail(&self, id: i64, error: &str, can_retry: bool) {
        let folder_id = {
            let mut inner = self.lock();
            let Some(tracked) = inner.items.get_mut(&id) else {
                return;
            };
            if tracked.item.status == UploadStatus::Cancelled {
                return;
            }
            tracked.item.status = UploadStatus::Failed;
            tracked.item.can_retry = can_retry;
            tracked.item.error = Some(error.to_string());
            tracked.token = None;
            tracked.item.folder_id.clone()
        };
        debug!(id, error, can_retry, "transfer item failed");
        self.publish(&folder_id);
    }

    /// Stops the item. Completed items cannot be cancelled; cancelling twice is a no-op.
    pub fn cancel(&self, id: i64) -> Result<UploadQueueItem, SyncError> {
        let item = {
            let mut inner = self.lock();
            let tracked = inner
                .items
                .get_mut(&id)
                .ok_or_else(|| SyncError::NotFound(format!("upload item {id}")))?;
            match tracked.item.status {
                UploadStatus::Completed => {
                    return Err(SyncError::InvalidState(format!(
                        "upload item {id} already completed"
                    )));
                }
                UploadStatus::Cancelled => return Ok(tracked.item.clone()),
                _ => {}
            }
            if let Some(token) = tracked.token.take() {
                token.cancel();
            }
            tracked.item.status = UploadStatus::Cancelled;
            tracked.item.can_retry = false;
            tracked.item.clone()
        };
        info!(id, folder = %item.folder_id, "transfer cancelled by user");
        self.publish(&item.folder_id);
        Ok(item)
    }

    /// `failed -> pending`; anything else is an invalid transition.
    pub fn retry(&self, id: i64) -> Result<UploadQueueItem, SyncError> {
        let item = {
            let mut inner = self.lock();
            let tracked = inner
                .items
                .get_mut(&id)
                .ok_or_else(|| SyncError::NotFound(format!("upload item {id}")))?;
            if tracked.item.status != UploadStatus::Failed {
                return Err(SyncError::InvalidState(format!(
                    "upload item {id} is {}, only failed items can be retried",
                    tracked.item.status
                )));
            }
            tracked.item.status = UploadStatus::Pending;
            tracked.item.transferred_bytes = 0;
            tracked.item.can_retry = false;
            tracked.item.error = None;
            tracked.last_percent = None;
            tracked.item.clone()
        };
        self.publish(&item.folder_id);
        Ok(item)
    }

    pub fn get(&self, id: i64) -> Option<UploadQueueItem> {
        self.lock().items.get(&id).map(|tracked| tracked.item.clone())
    }

    pub fn status(&self, id: i64) -> Option<UploadStatus> {
        self.lock().items.get(&id).map(|tracked| tracked.item.status)
    }

    pub fn snapshot(&self, folder_id: &str) -> Vec<UploadQueueItem> {
        self.lock()
            .items
            .values()
            .filter(|tracked| tracked.item.folder_id == folder_id)
            .map(|tracked| tracked.item.clone())
            .collect()
    }

    pub fn observe(&self, folder_id: &str) -> watch::Receiver<Vec<UploadQueueItem>> {
        let rx = self.watch.subscribe(folder_id);
        self.publish(folder_id);
        rx
    }

    pub fn subscribe_progress(&self) -> broadcast::Receiver<ProgressEvent> {
        self.progress.subscribe()
    }

    /// The folder's transfer slots; holders of a permit may transfer.
    pub fn semaphore(&self, folder_id: &str) -> Arc<Semaphore> {
        self.lock()
            .limits
            .entry(folder_id.to_string())
            .or_insert_with(|| Arc::new(Semaphore::new(self.concurrency)))
            .clone()
    }

    pub fn remove_folder(&self, folder_id: &str) {
        {
            let mut inner = self.lock();
            inner.items.retain(|_, tracked| {
                if tracked.item.folder_id != folder_id {
                    return true;
                }
                if let Some(token) = &tracked.token {
                    token.cancel();
                }
                false
            });
            inner.limits.remove(folder_id);
        }
        self.watch.remove(folder_id);
    }

    /// Drops completed and cancelled items so the next pass starts with a clean list.
    pub fn prune_finished(&self, folder_id: &str) {
        self.lock().items.retain(|_, tracked| {
            tracked.item.folder_id != folder_id || !tracked.item.status.is_terminal()
        });
        self.publish(folder_id);
    }

    /// Rebuilds items for queued operations, e.g. after a restart. Operations that
    /// exhausted their retries show up as failed and retryable.
    pub fn restore_from_queue(&self, ops: &[QueuedOperation], remote_root: &str) {
        let mut touched = BTreeSet::new();
        {
            let mut inner = self.lock();
            for op in ops {
                if inner.items.contains_key(&op.id) {
                    continue;
                }
                let mut item = item_for(op, remote_root);
                if op.state == OperationState::NeedsAttention {
                    item.status = UploadStatus::Failed;
                    item.can_retry = true;
                    item.error = op.last_error.clone();
                }
                inner.items.insert(
                    op.id,
                    Tracked {
                        item,
                        token: None,
                        last_percent: None,
                    },
                );
                touched.insert(op.folder_id.clone());
            }
        }
        for folder_id in touched {
            self.publish(&folder_id);
        }
    }

    fn publish(&self, folder_id: &str) {
        self.watch.publish(folder_id, self.snapshot(folder_id));
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// A pending item mirroring a queued operation. Only uploads and downloads carry a
/// byte total.
pub fn item_for(op: &QueuedOperation, remote_root: &str) -> UploadQueueItem {
    UploadQueueItem {
        id: op.id,
        folder_id: op.folder_id.clone(),
        file_name: file_name(op.target_path()).to_string(),
        remote_path: remote_path_for(remote_root, op),
        kind: op.kind,
        direction: op.kind.direction(),
        total_bytes: if op.kind.moves_bytes() { op.size.unwrap_or(0) } else { 0 },
        transferred_bytes: 0,
        status: UploadStatus::Pending,
        can_retry: false,
        error: None,
    }
}

/// Remote side of an operation: downloads and local deletes name `path`, everything
/// else its target.
pub fn remote_path_for(remote_root: &str, op: &QueuedOperation) -> String {
    let relative = match op.kind.direction() {
        TransferDirection::Download => op.path.as_str(),
        TransferDirection::Upload => op.target_path(),
    };
    join_remote(remote_root, relative)
}
