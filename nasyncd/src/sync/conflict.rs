use std::collections::BTreeSet;
use std::sync::Arc;

use futures_util::StreamExt;
use tracing::{info, warn};

use super::error::SyncError;
use super::local::{ByteStream, LocalSource};
use super::model::{
    ConflictResolution, ConflictType, FileConflict, FileEntry, NewOperation, OperationKind,
    VersionInfo,
};
use super::observe::KeyedWatch;
use super::queue::OfflineOperationQueue;
use super::remote::RemoteFs;
use super::store::SyncStore;

const PREVIEW_BYTES: usize = 512;

/// Conflict rule for one path. `checkpoint` is the modified time of the last version
/// both sides agreed on.
pub fn detect(
    local: Option<&FileEntry>,
    remote: Option<&FileEntry>,
    checkpoint: Option<i64>,
) -> Option<ConflictType> {
    if let (Some(local), Some(remote)) = (local, remote)
        && same_version(local, remote)
    {
        return None;
    }
    match (local, remote, checkpoint) {
        (Some(_), Some(_), None) => Some(ConflictType::BothModified),
        (Some(local), Some(remote), Some(base))
            if local.modified > base && remote.modified > base =>
        {
            Some(ConflictType::BothModified)
        }
        // The versions differ yet neither is newer than the checkpoint, e.g. an older
        // copy restored on one side.
        (Some(local), Some(remote), Some(base))
            if local.modified <= base && remote.modified <= base =>
        {
            Some(ConflictType::BothModified)
        }
        (Some(local), None, Some(base)) if local.modified > base => {
            Some(ConflictType::RemoteDeletedLocalModified)
        }
        (None, Some(remote), Some(base)) if remote.modified > base => {
            Some(ConflictType::LocalDeletedRemoteModified)
        }
        _ => None,
    }
}

pub fn same_version(local: &FileEntry, remote: &FileEntry) -> bool {
    local.size == remote.size && local.modified == remote.modified
}

/// Sibling name for the second copy kept by keep-both: `Docs/A (conflict N).txt`.
pub fn conflict_path(path: &str, stamp: i64) -> String {
    let (dir, name) = match path.rsplit_once('/') {
        Some((dir, name)) => (format!("{dir}/"), name),
        None => (String::new(), path),
    };

    if let Some((stem, ext)) = name.rsplit_once('.')
        && !stem.is_empty()
    {
        return format!("{dir}{stem} (conflict {stamp}).{ext}");
    }

    format!("{dir}{name} (conflict {stamp})")
}

/// Operations that carry out `resolution` for `conflict`, in execution order.
pub fn plan(conflict: &FileConflict, resolution: ConflictResolution) -> Vec<NewOperation> {
    let folder = conflict.folder_id.as_str();
    let path = conflict.path.as_str();
    match effective_resolution(conflict, resolution) {
        ConflictResolution::KeepLocal if conflict.local.exists => {
            vec![versioned(NewOperation::new(folder, OperationKind::Upload, path), &conflict.local)]
        }
        ConflictResolution::KeepLocal => vec![NewOperation::new(folder, OperationKind::Delete, path)],
        ConflictResolution::KeepRemote if conflict.remote.exists => {
            vec![versioned(NewOperation::new(folder, OperationKind::Download, path), &conflict.remote)]
        }
        ConflictResolution::KeepRemote => {
            vec![NewOperation::new(folder, OperationKind::LocalDelete, path)]
        }
        ConflictResolution::KeepBoth => match conflict.conflict_type {
            ConflictType::BothModified => {
                let stamp = conflict.remote.modified.unwrap_or(conflict.detected_at);
                let copy = conflict_path(path, stamp);
                vec![
                    versioned(
                        NewOperation::new(folder, OperationKind::Download, path).with_dest(&copy),
                        &conflict.remote,
                    ),
                    versioned(NewOperation::new(folder, OperationKind::Upload, &copy), &conflict.remote),
                    versioned(NewOperation::new(folder, OperationKind::Upload, path), &conflict.local),
                ]
            }
            ConflictType::RemoteDeletedLocalModified => {
                vec![versioned(NewOperation::new(folder, OperationKind::Upload, path), &conflict.local)]
            }
            ConflictType::LocalDeletedRemoteModified => {
                vec![versioned(NewOperation::new(folder, OperationKind::Download, path), &conflict.remote)]
            }
        },
        ConflictResolution::KeepNewest => Vec::new(),
    }
}

/// Maps keep-newest onto keep-local or keep-remote. Ties go to the remote; in a
/// deletion conflict the side that still has a modified file wins.
pub fn effective_resolution(
    conflict: &FileConflict,
    resolution: ConflictResolution,
) -> ConflictResolution {
    if resolution != ConflictResolution::KeepNewest {
        return resolution;
    }
    match conflict.conflict_type {
        ConflictType::RemoteDeletedLocalModified => ConflictResolution::KeepLocal,
        ConflictType::LocalDeletedRemoteModified => ConflictResolution::KeepRemote,
        ConflictType::BothModified => {
            let local = conflict.local.modified.unwrap_or(i64::MIN);
            let remote = conflict.remote.modified.unwrap_or(i64::MIN);
            if local > remote {
                ConflictResolution::KeepLocal
            } else {
                ConflictResolution::KeepRemote
            }
        }
    }
}

fn versioned(mut op: NewOperation, version: &VersionInfo) -> NewOperation {
    op.modified = version.modified;
    op.size = version.size;
    op
}

/// Leading text of a UTF-8 file, for showing both versions side by side.
pub async fn text_preview(source: &dyn LocalSource, path: &str) -> Option<String> {
    preview_stream(source.read(path).await.ok()?).await
}

pub async fn remote_preview(remote: &dyn RemoteFs, path: &str) -> Option<String> {
    preview_stream(remote.download(path).await.ok()?).await
}

async fn preview_stream(mut stream: ByteStream) -> Option<String> {
    let mut buffer = Vec::with_capacity(PREVIEW_BYTES);
    while buffer.len() < PREVIEW_BYTES {
        match stream.next().await {
            Some(Ok(chunk)) => buffer.extend_from_slice(&chunk),
            Some(Err(_)) => return None,
            None => break,
        }
    }
    buffer.truncate(PREVIEW_BYTES);
    preview_from_bytes(&buffer)
}

fn preview_from_bytes(bytes: &[u8]) -> Option<String> {
    if bytes.contains(&0) {
        return None;
    }
    match std::str::from_utf8(bytes) {
        Ok(text) => Some(text.to_string()),
        // A multi-byte character cut at the buffer boundary.
        Err(err) if err.error_len().is_none() => {
            Some(String::from_utf8_lossy(&bytes[..err.valid_up_to()]).into_owned())
        }
        Err(_) => None,
    }
}

/// Durable conflict records and the application of chosen resolutions.
pub struct ConflictResolver {
    store: SyncStore,
    queue: OfflineOperationQueue,
    watch: Arc<KeyedWatch<Vec<FileConflict>>>,
}

impl ConflictResolver {
    pub fn new(store: SyncStore, queue: OfflineOperationQueue) -> Self {
        Self {
            store,
            queue,
            watch: Arc::new(KeyedWatch::new()),
        }
    }

    pub fn observe(&self, folder_id: &str) -> tokio::sync::watch::Receiver<Vec<FileConflict>> {
        self.watch.subscribe(folder_id)
    }

    pub async fn list(&self, folder_id: &str) -> Result<Vec<FileConflict>, SyncError> {
        Ok(self.store.list_conflicts(folder_id).await?)
    }

    pub async fn record(&self, conflict: &FileConflict) -> Result<(), SyncError> {
        warn!(
            folder = %conflict.folder_id,
            path = %conflict.path,
            kind = conflict.conflict_type.as_str(),
            "conflict detected"
        );
        self.store.upsert_conflict(conflict).await?;
        self.publish(&conflict.folder_id).await
    }

    /// Records the choice, enqueues its operations, then clears the record. A crash in
    /// between is repaired by [`ConflictResolver::recover`].
    pub async fn resolve(
        &self,
        folder_id: &str,
        path: &str,
        resolution: ConflictResolution,
    ) -> Result<Vec<i64>, SyncError> {
        let Some(mut conflict) = self.store.get_conflict(folder_id, path).await? else {
            return Err(SyncError::NotFound(format!("conflict {folder_id}:{path}")));
        };
        self.store
            .set_conflict_resolution(folder_id, path, resolution)
            .await?;
        conflict.resolution = Some(resolution);
        let ids = self.apply(&conflict, resolution).await?;
        self.publish(folder_id).await?;
        Ok(ids)
    }

    /// Resolves several paths independently; one failure does not stop the others.
    pub async fn resolve_batch(
        &self,
        folder_id: &str,
        choices: &[(String, ConflictResolution)],
    ) -> Vec<Result<Vec<i64>, SyncError>> {
        let mut out = Vec::with_capacity(choices.len());
        for (path, resolution) in choices {
            out.push(self.resolve(folder_id, path, *resolution).await);
        }
        out
    }

    /// Forgets the record without touching either side.
    pub async fn dismiss(&self, folder_id: &str, path: &str) -> Result<bool, SyncError> {
        let removed = self.store.delete_conflict(folder_id, path).await?;
        self.publish(folder_id).await?;
        Ok(removed)
    }

    /// Re-applies resolutions recorded before a restart, then publishes the open
    /// conflicts of every folder. Enqueue deduplication makes repeating already queued
    /// steps harmless.
    pub async fn recover(&self) -> Result<usize, SyncError> {
        let pending = self.store.list_resolved_conflicts().await?;
        let mut folders: BTreeSet<String> = BTreeSet::new();
        for conflict in &pending {
            if let Some(resolution) = conflict.resolution {
                self.apply(conflict, resolution).await?;
                folders.insert(conflict.folder_id.clone());
            }
        }
        folders.extend(self.store.list_folders().await?.into_iter().map(|folder| folder.id));
        for folder_id in &folders {
            self.publish(folder_id).await?;
        }
        Ok(pending.len())
    }

    pub fn forget_folder(&self, folder_id: &str) {
        self.watch.remove(folder_id);
    }

    async fn apply(
        &self,
        conflict: &FileConflict,
        resolution: ConflictResolution,
    ) -> Result<Vec<i64>, SyncError> {
        let mut ids = Vec::new();
        for op in plan(conflict, resolution) {
            ids.push(self.queue.enqueue(op).await?);
        }
        self.store
            .delete_conflict(&conflict.folder_id, &conflict.path)
            .await?;
        info!(
            folder = %conflict.folder_id,
            path = %conflict.path,
            resolution = resolution.as_str(),
            ops = ids.len(),
            "conflict resolved"
        );
        Ok(ids)
    }

    async fn publish(&self, folder_id: &str) -> Result<(), SyncError> {
        let conflicts = self.store.list_conflicts(folder_id).await?;
        self.watch.publish(folder_id, conflicts);
        Ok(())
    }
}
