use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

use serde::Serialize;
use tokio::sync::watch;
use tokio::task::{JoinError, JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::backoff::Backoff;
use super::conflict::{ConflictResolver, remote_preview, text_preview};
use super::diff::{DiffAction, DiffInput, diff};
use super::error::{ErrorClass, SyncError};
use super::glob::ExcludeSet;
use super::local::{LocalSource, UriSourceResolver};
use super::model::{
    ConflictPolicy, ConflictType, FileConflict, FileEntry, NewOperation, OperationKind,
    OperationState, QueuedOperation, SyncFolderConfig, SyncStatus, UploadStatus, VersionInfo,
    now_millis,
};
use super::observe::KeyedWatch;
use super::paths::{join_remote, normalize_relative, parent_of};
use super::queue::{DEFAULT_MAX_ATTEMPTS, OfflineOperationQueue};
use super::registry::SyncFolderRegistry;
use super::remote::RemoteFs;
use super::store::SyncStore;
use super::transfer::{ProgressFn, TransferConfig, TransferEngine, TransferError};
use super::upload_queue::{DEFAULT_CONCURRENCY, UploadQueueManager, item_for};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncPhase {
    #[default]
    Idle,
    Listing,
    Diffing,
    Resolving,
    Transferring,
    Error,
}

#[derive(Debug, Clone, Copy)]
pub struct EngineConfig {
    pub max_attempts: u32,
    pub backoff: Backoff,
    /// Concurrent transfers per folder.
    pub concurrency: usize,
    pub transfer: TransferConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            backoff: Backoff::default(),
            concurrency: DEFAULT_CONCURRENCY,
            transfer: TransferConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PassReport {
    pub queued: usize,
    pub conflicts: usize,
    pub completed: usize,
    pub failed: usize,
    /// Storage failure seen while draining; the folder ends the pass in `error`.
    pub fatal: Option<String>,
}

impl PassReport {
    fn absorb(&mut self, joined: Result<OpResult, JoinError>) {
        match joined {
            Ok(OpResult::Done) => self.completed += 1,
            Ok(OpResult::Failed) => self.failed += 1,
            Ok(OpResult::Released) => {}
            Ok(OpResult::Fatal(message)) => {
                self.failed += 1;
                self.fatal.get_or_insert(message);
            }
            Err(err) => {
                self.failed += 1;
                self.fatal.get_or_insert(format!("transfer task aborted: {err}"));
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PassOutcome {
    Completed(PassReport),
    /// The folder is paused or another pass holds it.
    Skipped,
    Cancelled,
    Failed(String),
}

enum OpResult {
    Done,
    Failed,
    Released,
    Fatal(String),
}

enum CheckpointUpdate {
    Set { path: String, modified: i64 },
    Clear(String),
}

/// Runs sync passes: listing, diffing, resolving and transferring, one pass per folder
/// at a time.
pub struct SyncOrchestrator {
    store: SyncStore,
    registry: SyncFolderRegistry,
    queue: OfflineOperationQueue,
    resolver: ConflictResolver,
    uploads: Arc<UploadQueueManager>,
    remote: Arc<dyn RemoteFs>,
    sources: Arc<UriSourceResolver>,
    transfer: TransferEngine,
    phases: KeyedWatch<SyncPhase>,
    tokens: Mutex<HashMap<String, CancellationToken>>,
}

impl SyncOrchestrator {
    pub fn new(
        store: SyncStore,
        registry: SyncFolderRegistry,
        remote: Arc<dyn RemoteFs>,
        sources: Arc<UriSourceResolver>,
        config: EngineConfig,
    ) -> Self {
        let queue =
            OfflineOperationQueue::with_policy(store.clone(), config.backoff, config.max_attempts);
        Self {
            resolver: ConflictResolver::new(store.clone(), queue.clone()),
            uploads: Arc::new(UploadQueueManager::new(config.concurrency)),
            transfer: TransferEngine::new(config.transfer),
            phases: KeyedWatch::new(),
            tokens: Mutex::new(HashMap::new()),
            store,
            registry,
            queue,
            remote,
            sources,
        }
    }

    pub fn store(&self) -> &SyncStore {
        &self.store
    }

    pub fn registry(&self) -> &SyncFolderRegistry {
        &self.registry
    }

    pub fn queue(&self) -> &OfflineOperationQueue {
        &self.queue
    }

    pub fn resolver(&self) -> &ConflictResolver {
        &self.resolver
    }

    pub fn uploads(&self) -> &UploadQueueManager {
        &self.uploads
    }

    pub fn remote(&self) -> &dyn RemoteFs {
        self.remote.as_ref()
    }

    pub fn observe_phase(&self, folder_id: &str) -> watch::Receiver<SyncPhase> {
        self.phases.subscribe(folder_id)
    }

    pub fn phase(&self, folder_id: &str) -> SyncPhase {
        self.phases.current(folder_id)
    }

    /// Starts a pass in the background and returns immediately.
    pub fn trigger_sync(self: &Arc<Self>, folder_id: &str) -> JoinHandle<Result<PassOutcome, SyncError>> {
        let this = Arc::clone(self);
        let folder_id = folder_id.to_string();
        tokio::spawn(async move {
            let outcome = this.run_pass(&folder_id).await;
            if let Err(err) = &outcome {
                warn!(folder = %folder_id, error = %err, "sync pass could not run");
            }
            outcome
        })
    }

    pub async fn run_pass(self: &Arc<Self>, folder_id: &str) -> Result<PassOutcome, SyncError> {
        let folder = self.registry.get(folder_id).await?;
        if folder.status == SyncStatus::Paused {
            debug!(folder = %folder_id, "folder paused, pass skipped");
            return Ok(PassOutcome::Skipped);
        }
        if !self.registry.try_begin_pass(folder_id).await? {
            debug!(folder = %folder_id, "pass already running");
            return Ok(PassOutcome::Skipped);
        }
        let cancel = self.folder_token(folder_id);
        // Re-read under the claim so the pass sees the latest configuration.
        let folder = match self.registry.get(folder_id).await {
            Ok(folder) => folder,
            Err(err) => {
                self.registry.release_pass(folder_id).await?;
                return Err(err);
            }
        };
        info!(folder = %folder_id, remote = %folder.remote_path, "sync pass started");
        let result = self.run_claimed(&folder, &cancel).await;
        self.finish(folder_id, &cancel, result).await
    }

    /// Pauses the folder and stops its in-flight transfers.
    pub async fn pause_folder(&self, folder_id: &str) -> Result<(), SyncError> {
        self.registry.pause(folder_id).await?;
        self.cancel_folder(folder_id);
        info!(folder = %folder_id, "folder paused");
        Ok(())
    }

    pub async fn resume_folder(&self, folder_id: &str) -> Result<(), SyncError> {
        self.registry.resume(folder_id).await?;
        info!(folder = %folder_id, "folder resumed");
        Ok(())
    }

    /// Stops any running pass and removes the folder with everything keyed by it.
    pub async fn delete_folder(&self, folder_id: &str) -> Result<bool, SyncError> {
        self.cancel_folder(folder_id);
        let existing = self.store.get_folder(folder_id).await?;
        let removed = self.registry.delete(folder_id).await?;
        self.uploads.remove_folder(folder_id);
        self.resolver.forget_folder(folder_id);
        self.phases.remove(folder_id);
        if let Some(folder) = existing {
            self.sources.forget(&folder.local_root);
        }
        Ok(removed)
    }

    pub fn cancel_folder(&self, folder_id: &str) {
        if let Some(token) = self.tokens().remove(folder_id) {
            token.cancel();
        }
    }

    /// Queues a local move observed outside of a pass. Returns `None` when the folder
    /// does not push local changes or either side is excluded; the next diff covers those.
    pub async fn record_local_move(
        &self,
        folder_id: &str,
        from: &str,
        to: &str,
    ) -> Result<Option<i64>, SyncError> {
        let folder = self.registry.get(folder_id).await?;
        if !folder.sync_type.pushes() {
            return Ok(None);
        }
        let from = normalize_relative(from)?;
        let to = normalize_relative(to)?;
        let excludes = ExcludeSet::new(&folder.exclude_patterns);
        if from == to || excludes.is_excluded(&from) || excludes.is_excluded(&to) {
            return Ok(None);
        }
        let kind = if parent_of(&from) == parent_of(&to) {
            OperationKind::Rename
        } else {
            OperationKind::Move
        };
        let id = self
            .queue
            .enqueue(NewOperation::new(folder_id, kind, &from).with_dest(&to))
            .await?;
        Ok(Some(id))
    }

    /// Startup repair: clears stale `syncing`, returns leased operations to the queue,
    /// re-applies recorded resolutions and rebuilds transfer items.
    pub async fn recover(&self) -> Result<(), SyncError> {
        let folders = self.registry.recover_interrupted().await?;
        let released = self.queue.recover_in_flight().await?;
        let reapplied = self.resolver.recover().await?;
        let ops = self.queue.list_all().await?;
        for folder in self.registry.list().await? {
            let folder_ops: Vec<QueuedOperation> = ops
                .iter()
                .filter(|op| op.folder_id == folder.id)
                .cloned()
                .collect();
            self.uploads.restore_from_queue(&folder_ops, &folder.remote_path);
        }
        info!(folders, released, reapplied, queued = ops.len(), "startup recovery finished");
        Ok(())
    }

    async fn run_claimed(
        self: &Arc<Self>,
        folder: &SyncFolderConfig,
        cancel: &CancellationToken,
    ) -> Result<PassReport, SyncError> {
        let source = self.sources.resolve(&folder.local_root)?;
        let mut report = PassReport::default();

        self.set_phase(&folder.id, SyncPhase::Listing);
        let listing = async {
            let local = source.list().await?;
            let remote = self.remote.list(&folder.remote_path).await?;
            Ok::<_, SyncError>((local, remote))
        };
        let (local, remote) = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(TransferError::Cancelled.into()),
            listed = listing => listed?,
        };

        // Nothing is committed until the whole diff is known.
        self.set_phase(&folder.id, SyncPhase::Diffing);
        let checkpoints = self.store.list_checkpoints(&folder.id).await?;
        let busy = self.busy_paths(&folder.id).await?;
        let excludes = ExcludeSet::new(&folder.exclude_patterns);
        let actions = diff(&DiffInput {
            sync_type: folder.sync_type,
            local: &local,
            remote: &remote,
            checkpoints: &checkpoints,
            busy: &busy,
            excludes: &excludes,
        });
        debug!(
            folder = %folder.id,
            local = local.len(),
            remote = remote.len(),
            actions = actions.len(),
            "diff computed"
        );

        self.set_phase(&folder.id, SyncPhase::Resolving);
        for action in actions {
            if cancel.is_cancelled() {
                return Err(TransferError::Cancelled.into());
            }
            self.commit(folder, source.as_ref(), action, &mut report)
                .await?;
        }

        self.set_phase(&folder.id, SyncPhase::Transferring);
        self.drain(folder, source, cancel, &mut report).await?;
        Ok(report)
    }

    async fn finish(
        &self,
        folder_id: &str,
        cancel: &CancellationToken,
        result: Result<PassReport, SyncError>,
    ) -> Result<PassOutcome, SyncError> {
        if cancel.is_cancelled() || matches!(&result, Err(err) if err.class() == ErrorClass::Cancelled) {
            self.registry.release_pass(folder_id).await?;
            // A folder deleted mid-pass may have had rows written after the cascade.
            if self.store.get_folder(folder_id).await?.is_none() {
                self.store.delete_folder(folder_id).await?;
            } else {
                self.set_phase(folder_id, SyncPhase::Idle);
            }
            info!(folder = %folder_id, "sync pass cancelled");
            return Ok(PassOutcome::Cancelled);
        }
        match result {
            Ok(report) => match report.fatal.clone() {
                Some(message) => {
                    warn!(folder = %folder_id, error = %message, "sync pass hit a storage failure");
                    self.fail_pass(folder_id, &message).await?;
                    Ok(PassOutcome::Failed(message))
                }
                None => {
                    self.registry.finish_pass(folder_id, None).await?;
                    self.set_phase(folder_id, SyncPhase::Idle);
                    info!(
                        folder = %folder_id,
                        queued = report.queued,
                        conflicts = report.conflicts,
                        completed = report.completed,
                        failed = report.failed,
                        "sync pass finished"
                    );
                    Ok(PassOutcome::Completed(report))
                }
            },
            Err(err) => {
                let message = err.to_string();
                warn!(folder = %folder_id, error = %message, "sync pass failed");
                self.fail_pass(folder_id, &message).await?;
                Ok(PassOutcome::Failed(message))
            }
        }
    }

    async fn fail_pass(&self, folder_id: &str, message: &str) -> Result<(), SyncError> {
        self.registry.finish_pass(folder_id, Some(message)).await?;
        self.set_phase(folder_id, SyncPhase::Error);
        Ok(())
    }

    async fn busy_paths(&self, folder_id: &str) -> Result<HashSet<String>, SyncError> {
        let mut busy = HashSet::new();
        for op in self.queue.list_for_folder(folder_id).await? {
            busy.extend(op.dest_path);
            busy.insert(op.path);
        }
        for conflict in self.resolver.list(folder_id).await? {
            busy.insert(conflict.path);
        }
        Ok(busy)
    }

    async fn commit(
        &self,
        folder: &SyncFolderConfig,
        source: &dyn LocalSource,
        action: DiffAction,
        report: &mut PassReport,
    ) -> Result<(), SyncError> {
        let id = folder.id.as_str();
        let op = match action {
            DiffAction::Upload(entry) => {
                NewOperation::new(id, OperationKind::Upload, &entry.path).with_version(&entry)
            }
            DiffAction::Download(entry) => {
                NewOperation::new(id, OperationKind::Download, &entry.path).with_version(&entry)
            }
            DiffAction::DeleteRemote(path) => NewOperation::new(id, OperationKind::Delete, &path),
            DiffAction::DeleteLocal(path) => {
                NewOperation::new(id, OperationKind::LocalDelete, &path)
            }
            DiffAction::RecordCheckpoint { path, modified } => {
                self.store.upsert_checkpoint(id, &path, modified).await?;
                return Ok(());
            }
            DiffAction::DropCheckpoint(path) => {
                self.store.delete_checkpoint(id, &path).await?;
                return Ok(());
            }
            DiffAction::Conflict {
                path,
                conflict_type,
                local,
                remote,
            } => {
                report.conflicts += 1;
                report.queued += self
                    .surface_conflict(folder, source, &path, conflict_type, local, remote)
                    .await?;
                return Ok(());
            }
        };
        self.queue.enqueue(op).await?;
        report.queued += 1;
        Ok(())
    }

    /// Records the conflict and applies the folder policy. Returns the number of
    /// operations an automatic resolution queued.
    async fn surface_conflict(
        &self,
        folder: &SyncFolderConfig,
        source: &dyn LocalSource,
        path: &str,
        conflict_type: ConflictType,
        local: Option<FileEntry>,
        remote: Option<FileEntry>,
    ) -> Result<usize, SyncError> {
        let mut local_version = local
            .as_ref()
            .map(VersionInfo::from_entry)
            .unwrap_or_else(VersionInfo::missing);
        let mut remote_version = remote
            .as_ref()
            .map(VersionInfo::from_entry)
            .unwrap_or_else(VersionInfo::missing);
        if folder.conflict_policy == ConflictPolicy::Ask {
            if local_version.exists {
                local_version.preview = text_preview(source, path).await;
            }
            if remote_version.exists {
                let remote_path = join_remote(&folder.remote_path, path);
                remote_version.preview = remote_preview(self.remote.as_ref(), &remote_path).await;
            }
        }
        let conflict = FileConflict {
            folder_id: folder.id.clone(),
            path: path.to_string(),
            conflict_type,
            local: local_version,
            remote: remote_version,
            detected_at: now_millis(),
            resolution: None,
        };
        self.resolver.record(&conflict).await?;
        match folder.conflict_policy.auto_resolution() {
            Some(resolution) => Ok(self.resolver.resolve(&folder.id, path, resolution).await?.len()),
            None => Ok(0),
        }
    }

    async fn drain(
        self: &Arc<Self>,
        folder: &SyncFolderConfig,
        source: Arc<dyn LocalSource>,
        cancel: &CancellationToken,
        report: &mut PassReport,
    ) -> Result<(), SyncError> {
        let ops = self.queue.list_for_folder(&folder.id).await?;
        self.uploads.prune_finished(&folder.id);
        self.uploads.restore_from_queue(&ops, &folder.remote_path);

        let slots = self.uploads.semaphore(&folder.id);
        let shared = Arc::new(folder.clone());
        let mut tasks = JoinSet::new();
        loop {
            let permit = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                permit = Arc::clone(&slots).acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };
            let next = match self.queue.dequeue_next(&folder.id).await {
                Ok(next) => next,
                Err(err) => {
                    report.fatal.get_or_insert(err.to_string());
                    break;
                }
            };
            let Some(op) = next else {
                // Blocked or backing off; wait for a running operation to free its path.
                drop(permit);
                match tasks.join_next().await {
                    Some(joined) => {
                        report.absorb(joined);
                        continue;
                    }
                    None => break,
                }
            };
            let this = Arc::clone(self);
            let folder = Arc::clone(&shared);
            let source = Arc::clone(&source);
            let cancel = cancel.clone();
            tasks.spawn(async move {
                let _permit = permit;
                this.execute(&folder, source.as_ref(), op, &cancel).await
            });
        }
        while let Some(joined) = tasks.join_next().await {
            report.absorb(joined);
        }
        Ok(())
    }

    async fn execute(
        &self,
        folder: &SyncFolderConfig,
        source: &dyn LocalSource,
        op: QueuedOperation,
        cancel: &CancellationToken,
    ) -> OpResult {
        debug!(folder = %folder.id, path = %op.path, op = op.kind.as_str(), id = op.id, "operation started");
        let result = match self.prepare_item(folder, &op, cancel) {
            Ok(Some(token)) => self.apply(folder, source, &op, &token).await,
            Ok(None) => Err(TransferError::Cancelled.into()),
            Err(err) => Err(err),
        };
        match self.settle(folder, source, &op, result).await {
            Ok(outcome) => outcome,
            Err(err) => {
                warn!(folder = %folder.id, path = %op.path, error = %err, "could not record operation outcome");
                OpResult::Fatal(err.to_string())
            }
        }
    }

    /// Moves the operation's queue item to `uploading`. `None` when the user cancelled it.
    fn prepare_item(
        &self,
        folder: &SyncFolderConfig,
        op: &QueuedOperation,
        cancel: &CancellationToken,
    ) -> Result<Option<CancellationToken>, SyncError> {
        match self.uploads.status(op.id) {
            None => {
                self.uploads.submit(item_for(op, &folder.remote_path));
            }
            Some(UploadStatus::Cancelled) => return Ok(None),
            Some(UploadStatus::Failed) => {
                self.uploads.retry(op.id)?;
            }
            Some(_) => {}
        }
        self.uploads.begin(op.id, cancel).map(Some)
    }

    async fn apply(
        &self,
        folder: &SyncFolderConfig,
        source: &dyn LocalSource,
        op: &QueuedOperation,
        token: &CancellationToken,
    ) -> Result<CheckpointUpdate, SyncError> {
        let root = folder.remote_path.as_str();
        let remote = self.remote.as_ref();
        match op.kind {
            OperationKind::Upload => {
                let Some(entry) = source.stat(&op.path).await? else {
                    return Err(SyncError::NotFound(format!("local file {}", op.path)));
                };
                self.uploads.set_total(op.id, entry.size);
                let target = op.target_path();
                self.transfer
                    .upload(
                        source,
                        &op.path,
                        remote,
                        &join_remote(root, target),
                        entry.size,
                        entry.modified,
                        self.progress_for(op.id),
                        token,
                    )
                    .await?;
                Ok(CheckpointUpdate::Set {
                    path: target.to_string(),
                    modified: entry.modified,
                })
            }
            OperationKind::Download => {
                let modified = op.modified.unwrap_or_else(now_millis);
                let target = op.target_path();
                self.uploads.set_total(op.id, op.size.unwrap_or(0));
                self.transfer
                    .download(
                        remote,
                        &join_remote(root, &op.path),
                        source,
                        target,
                        None,
                        modified,
                        self.progress_for(op.id),
                        token,
                    )
                    .await?;
                Ok(CheckpointUpdate::Set {
                    path: target.to_string(),
                    modified,
                })
            }
            OperationKind::Delete => {
                self.transfer
                    .guarded(token, remote.delete(&join_remote(root, &op.path)))
                    .await?;
                Ok(CheckpointUpdate::Clear(op.path.clone()))
            }
            OperationKind::LocalDelete => {
                self.transfer.guarded(token, source.delete(&op.path)).await?;
                Ok(CheckpointUpdate::Clear(op.path.clone()))
            }
            OperationKind::Move | OperationKind::Rename => {
                let Some(dest) = op.dest_path.as_deref() else {
                    return Err(SyncError::Validation(format!(
                        "{} of {} has no destination",
                        op.kind.as_str(),
                        op.path
                    )));
                };
                self.transfer
                    .guarded(
                        token,
                        remote.move_to(&join_remote(root, &op.path), &join_remote(root, dest)),
                    )
                    .await?;
                Ok(CheckpointUpdate::Clear(op.path.clone()))
            }
        }
    }

    /// Persists the outcome of one operation. Failures stay contained to the operation.
    async fn settle(
        &self,
        folder: &SyncFolderConfig,
        source: &dyn LocalSource,
        op: &QueuedOperation,
        result: Result<CheckpointUpdate, SyncError>,
    ) -> Result<OpResult, SyncError> {
        let folder_id = folder.id.as_str();
        let err = match result {
            Ok(update) => {
                match update {
                    CheckpointUpdate::Set { path, modified } => {
                        self.store.upsert_checkpoint(folder_id, &path, modified).await?
                    }
                    CheckpointUpdate::Clear(path) => {
                        self.store.delete_checkpoint(folder_id, &path).await?
                    }
                }
                self.queue.mark_success(op.id).await?;
                self.uploads.complete(op.id);
                info!(folder = %folder_id, path = %op.path, op = op.kind.as_str(), "operation applied");
                return Ok(OpResult::Done);
            }
            Err(err) => err,
        };

        let message = err.to_string();
        match err.class() {
            ErrorClass::Cancelled => {
                if self.uploads.status(op.id) == Some(UploadStatus::Cancelled) {
                    self.queue.mark_success(op.id).await?;
                    info!(folder = %folder_id, path = %op.path, op = op.kind.as_str(), "operation cancelled by user");
                } else {
                    self.queue.release(op.id).await?;
                    self.uploads.fail(op.id, "paused", true);
                }
                Ok(OpResult::Released)
            }
            ErrorClass::TransientNetwork => {
                let after = self
                    .queue
                    .mark_failure_after(op.id, &message, err.retry_after_secs())
                    .await?;
                self.uploads.fail(op.id, &message, true);
                if after.is_some_and(|after| after.state == OperationState::NeedsAttention) {
                    warn!(folder = %folder_id, path = %op.path, op = op.kind.as_str(), error = %message, "operation gave up after retries");
                } else {
                    debug!(folder = %folder_id, path = %op.path, op = op.kind.as_str(), error = %message, "operation will be retried");
                }
                Ok(OpResult::Failed)
            }
            ErrorClass::RemoteConflict => {
                self.record_transfer_conflict(folder_id, source, op).await?;
                self.queue.mark_success(op.id).await?;
                self.uploads.fail(op.id, &message, false);
                Ok(OpResult::Failed)
            }
            ErrorClass::NotFound => {
                // The source vanished; the next diff decides what the path needs.
                self.queue.mark_success(op.id).await?;
                self.uploads.fail(op.id, &message, false);
                info!(folder = %folder_id, path = %op.path, op = op.kind.as_str(), "operation dropped, source is gone");
                Ok(OpResult::Failed)
            }
            ErrorClass::FatalStorage => {
                self.queue.mark_needs_attention(op.id, &message).await?;
                self.uploads.fail(op.id, &message, true);
                warn!(folder = %folder_id, path = %op.path, error = %message, "storage failure");
                Ok(OpResult::Fatal(message))
            }
            ErrorClass::Validation | ErrorClass::Permanent | ErrorClass::InvalidState => {
                self.queue.mark_needs_attention(op.id, &message).await?;
                self.uploads.fail(op.id, &message, true);
                warn!(folder = %folder_id, path = %op.path, op = op.kind.as_str(), error = %message, "operation needs attention");
                Ok(OpResult::Failed)
            }
        }
    }

    /// The remote refused the write because it changed underneath us. Always surfaced
    /// for the user; automatic policies could otherwise loop on the same path.
    async fn record_transfer_conflict(
        &self,
        folder_id: &str,
        source: &dyn LocalSource,
        op: &QueuedOperation,
    ) -> Result<(), SyncError> {
        let local = match source.stat(&op.path).await {
            Ok(local) => local,
            Err(err) => {
                warn!(folder = %folder_id, path = %op.path, error = %err, "could not stat local side of conflict");
                None
            }
        };
        let conflict = FileConflict {
            folder_id: folder_id.to_string(),
            path: op.path.clone(),
            conflict_type: ConflictType::BothModified,
            local: local
                .as_ref()
                .map(VersionInfo::from_entry)
                .unwrap_or_else(VersionInfo::missing),
            remote: VersionInfo {
                exists: true,
                ..VersionInfo::default()
            },
            detected_at: now_millis(),
            resolution: None,
        };
        self.resolver.record(&conflict).await
    }

    fn progress_for(&self, id: i64) -> ProgressFn {
        let uploads = Arc::clone(&self.uploads);
        Arc::new(move |bytes| uploads.report_progress(id, bytes))
    }

    fn set_phase(&self, folder_id: &str, phase: SyncPhase) {
        self.phases.publish(folder_id, phase);
    }

    fn folder_token(&self, folder_id: &str) -> CancellationToken {
        self.tokens()
            .entry(folder_id.to_string())
            .or_insert_with(CancellationToken::new)
            .clone()
    }

    fn tokens(&self) -> MutexGuard<'_, HashMap<String, CancellationToken>> {
        self.tokens
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
#[path = "orchestrator_tests.rs"]
mod tests;
