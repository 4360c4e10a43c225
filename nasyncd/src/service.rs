//! Operations exposed to UI clients. Every observation is a `watch` channel that
//! immediately yields the current value; progress is a `broadcast` stream.

use std::sync::Arc;

use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::info;

use crate::sync::model::{
    ConflictResolution, FileConflict, FolderPatch, NewSyncFolder, SyncFolderConfig,
    UploadQueueItem,
};
use crate::sync::upload_queue::ProgressEvent;
use crate::sync::{PassOutcome, SyncError, SyncOrchestrator, SyncPhase};

pub type PassHandle = JoinHandle<Result<PassOutcome, SyncError>>;

#[derive(Clone)]
pub struct SyncService {
    orchestrator: Arc<SyncOrchestrator>,
}

impl SyncService {
    pub fn new(orchestrator: Arc<SyncOrchestrator>) -> Self {
        Self { orchestrator }
    }

    pub fn orchestrator(&self) -> &Arc<SyncOrchestrator> {
        &self.orchestrator
    }

    /// Repairs state left behind by a previous run. Call once before serving clients.
    pub async fn start(&self) -> Result<(), SyncError> {
        self.orchestrator.recover().await
    }

    pub fn observe_folders(&self) -> watch::Receiver<Vec<SyncFolderConfig>> {
        self.orchestrator.registry().observe()
    }

    pub fn observe_conflicts(&self, folder_id: &str) -> watch::Receiver<Vec<FileConflict>> {
        self.orchestrator.resolver().observe(folder_id)
    }

    pub fn observe_upload_queue(&self, folder_id: &str) -> watch::Receiver<Vec<UploadQueueItem>> {
        self.orchestrator.uploads().observe(folder_id)
    }

    pub fn observe_phase(&self, folder_id: &str) -> watch::Receiver<SyncPhase> {
        self.orchestrator.observe_phase(folder_id)
    }

    pub fn subscribe_progress(&self) -> broadcast::Receiver<ProgressEvent> {
        self.orchestrator.uploads().subscribe_progress()
    }

    pub fn trigger_sync(&self, folder_id: &str) -> PassHandle {
        self.orchestrator.trigger_sync(folder_id)
    }

    pub async fn list_folders(&self) -> Result<Vec<SyncFolderConfig>, SyncError> {
        self.orchestrator.registry().list().await
    }

    pub async fn create_folder(&self, input: NewSyncFolder) -> Result<SyncFolderConfig, SyncError> {
        self.orchestrator.registry().create(input).await
    }

    pub async fn update_folder(
        &self,
        folder_id: &str,
        patch: FolderPatch,
    ) -> Result<SyncFolderConfig, SyncError> {
        self.orchestrator.registry().update(folder_id, patch).await
    }

    pub async fn delete_folder(&self, folder_id: &str) -> Result<bool, SyncError> {
        self.orchestrator.delete_folder(folder_id).await
    }

    pub async fn pause_folder(&self, folder_id: &str) -> Result<(), SyncError> {
        self.orchestrator.pause_folder(folder_id).await
    }

    /// Resumes the folder and starts a pass right away.
    pub async fn resume_folder(&self, folder_id: &str) -> Result<PassHandle, SyncError> {
        self.orchestrator.resume_folder(folder_id).await?;
        Ok(self.trigger_sync(folder_id))
    }

    /// Applies `resolution` and starts a pass to carry it out.
    pub async fn resolve_conflict(
        &self,
        folder_id: &str,
        path: &str,
        resolution: ConflictResolution,
    ) -> Result<Vec<i64>, SyncError> {
        let ids = self
            .orchestrator
            .resolver()
            .resolve(folder_id, path, resolution)
            .await?;
        self.trigger_sync(folder_id);
        Ok(ids)
    }

    /// Resolves each path on its own; the pass starts if at least one succeeded.
    pub async fn resolve_conflicts(
        &self,
        folder_id: &str,
        choices: &[(String, ConflictResolution)],
    ) -> Vec<Result<Vec<i64>, SyncError>> {
        let results = self
            .orchestrator
            .resolver()
            .resolve_batch(folder_id, choices)
            .await;
        if results.iter().any(Result::is_ok) {
            self.trigger_sync(folder_id);
        }
        results
    }

    pub async fn dismiss_conflict(&self, folder_id: &str, path: &str) -> Result<bool, SyncError> {
        self.orchestrator.resolver().dismiss(folder_id, path).await
    }

    /// Stops the operation and drops it from the queue. A running transfer drops its
    /// operation when it notices the cancellation.
    pub async fn cancel_upload(&self, id: i64) -> Result<UploadQueueItem, SyncError> {
        self.queue_item(id).await?;
        let item = self.orchestrator.uploads().cancel(id)?;
        self.orchestrator.queue().cancel(id).await?;
        Ok(item)
    }

    /// Puts a failed operation back in line with a fresh retry budget.
    pub async fn retry_upload(&self, id: i64) -> Result<UploadQueueItem, SyncError> {
        let current = self.queue_item(id).await?;
        if !current.can_retry {
            return Err(SyncError::InvalidState(format!(
                "upload item {id} cannot be retried"
            )));
        }
        let item = self.orchestrator.uploads().retry(id)?;
        self.orchestrator.queue().retry(id).await?;
        info!(id, folder = %item.folder_id, op = item.kind.as_str(), "retry requested");
        self.trigger_sync(&item.folder_id);
        Ok(item)
    }

    /// The item tracking queued operation `id`, rebuilt from the queue when no pass has
    /// picked the operation up since startup.
    async fn queue_item(&self, id: i64) -> Result<UploadQueueItem, SyncError> {
        let uploads = self.orchestrator.uploads();
        if let Some(item) = uploads.get(id) {
            return Ok(item);
        }
        let missing = || SyncError::NotFound(format!("upload item {id}"));
        let op = self.orchestrator.queue().get(id).await?.ok_or_else(missing)?;
        let folder = self.orchestrator.registry().get(&op.folder_id).await?;
        uploads.restore_from_queue(std::slice::from_ref(&op), &folder.remote_path);
        uploads.get(id).ok_or_else(missing)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use reqwest::StatusCode;

    use super::*;
    use crate::sync::backoff::Backoff;
    use crate::sync::error::ErrorClass;
    use crate::sync::local::{MemorySource, UriSourceResolver};
    use crate::sync::model::{ConflictPolicy, OperationKind, SyncType, UploadStatus};
    use crate::sync::registry::SyncFolderRegistry;
    use crate::sync::store::SyncStore;
    use crate::sync::testing::FakeRemote;
    use crate::sync::EngineConfig;

    struct Fixture {
        service: SyncService,
        local: MemorySource,
        remote: Arc<FakeRemote>,
        folder: SyncFolderConfig,
    }

    async fn fixture(sync_type: SyncType) -> Fixture {
        let store = SyncStore::in_memory().await.unwrap();
        let registry = SyncFolderRegistry::load(store.clone(), "phone").await.unwrap();
        let sources = Arc::new(UriSourceResolver::new());
        let local = MemorySource::new();
        sources.register("memory://phone", Arc::new(local.clone()));
        let remote = Arc::new(FakeRemote::new());
        let config = EngineConfig {
            backoff: Backoff::immediate(),
            ..EngineConfig::default()
        };
        let orchestrator = Arc::new(SyncOrchestrator::new(
            store,
            registry,
            remote.clone(),
            sources,
            config,
        ));
        let service = SyncService::new(orchestrator);
        service.start().await.unwrap();
        let folder = service
            .create_folder(NewSyncFolder {
                local_root: "memory://phone".into(),
                remote_path: "/Phone".into(),
                sync_type,
                auto_sync: true,
                conflict_policy: ConflictPolicy::Ask,
                exclude_patterns: Vec::new(),
            })
            .await
            .unwrap();
        Fixture {
            service,
            local,
            remote,
            folder,
        }
    }

    async fn wait_for_item(
        rx: &mut watch::Receiver<Vec<UploadQueueItem>>,
        id: i64,
        status: UploadStatus,
    ) {
        tokio::time::timeout(
            Duration::from_secs(5),
            rx.wait_for(|items| items.iter().any(|item| item.id == id && item.status == status)),
        )
        .await
        .unwrap()
        .unwrap();
    }

    async fn exhaust_retries(f: &Fixture) -> i64 {
        f.local.put("a.txt", "hello", 10);
        for _ in 0..3 {
            f.remote.fail_next("upload", StatusCode::SERVICE_UNAVAILABLE);
        }
        f.service.trigger_sync(&f.folder.id).await.unwrap().unwrap();
        let items = f.service.observe_upload_queue(&f.folder.id).borrow().clone();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].status, UploadStatus::Failed);
        items[0].id
    }

    #[tokio::test]
    async fn folder_changes_are_observable() {
        let f = fixture(SyncType::Bidirectional).await;
        let mut folders = f.service.observe_folders();
        assert_eq!(folders.borrow_and_update().len(), 1);

        f.service.pause_folder(&f.folder.id).await.unwrap();
        assert!(folders.has_changed().unwrap());
        assert_eq!(
            folders.borrow_and_update()[0].status,
            crate::sync::model::SyncStatus::Paused
        );

        let outcome = f
            .service
            .resume_folder(&f.folder.id)
            .await
            .unwrap()
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(outcome, PassOutcome::Completed(_)));

        assert!(f.service.delete_folder(&f.folder.id).await.unwrap());
        assert!(f.service.list_folders().await.unwrap().is_empty());
        assert_eq!(*f.service.observe_phase(&f.folder.id).borrow(), SyncPhase::Idle);
    }

    #[tokio::test]
    async fn retry_upload_requeues_and_syncs() {
        let f = fixture(SyncType::UploadOnly).await;
        let id = exhaust_retries(&f).await;
        let mut items = f.service.observe_upload_queue(&f.folder.id);
        let mut progress = f.service.subscribe_progress();

        let item = f.service.retry_upload(id).await.unwrap();
        assert_eq!(item.status, UploadStatus::Pending);
        wait_for_item(&mut items, id, UploadStatus::Completed).await;

        assert_eq!(f.remote.get("/Phone/a.txt").as_deref(), Some(&b"hello"[..]));
        let mut last = 0;
        while let Ok(event) = progress.try_recv() {
            assert_eq!(event.id, id);
            assert!(event.percent >= last);
            last = event.percent;
        }
        assert_eq!(last, 100);

        let err = f.service.retry_upload(id).await.unwrap_err();
        assert_eq!(err.class(), ErrorClass::InvalidState);
    }

    #[tokio::test]
    async fn cancel_upload_drops_the_operation() {
        let f = fixture(SyncType::UploadOnly).await;
        let id = exhaust_retries(&f).await;

        let item = f.service.cancel_upload(id).await.unwrap();
        assert_eq!(item.status, UploadStatus::Cancelled);
        assert!(f.service.orchestrator().queue().get(id).await.unwrap().is_none());
        // Cancelling again is a no-op.
        assert_eq!(
            f.service.cancel_upload(id).await.unwrap().status,
            UploadStatus::Cancelled
        );
        let err = f.service.retry_upload(id).await.unwrap_err();
        assert_eq!(err.class(), ErrorClass::InvalidState);
        let missing = f.service.cancel_upload(999).await.unwrap_err();
        assert_eq!(missing.class(), ErrorClass::NotFound);
    }

    #[tokio::test]
    async fn failed_remote_deletes_stay_visible_and_retryable() {
        let f = fixture(SyncType::Bidirectional).await;
        f.local.put("a.txt", "hello", 10);
        f.service.trigger_sync(&f.folder.id).await.unwrap().unwrap();
        assert!(f.remote.get("/Phone/a.txt").is_some());

        f.local.remove("a.txt");
        for _ in 0..3 {
            f.remote.fail_next("delete", StatusCode::SERVICE_UNAVAILABLE);
        }
        f.service.trigger_sync(&f.folder.id).await.unwrap().unwrap();
        let items = f.service.observe_upload_queue(&f.folder.id).borrow().clone();
        let failed = items
            .iter()
            .find(|item| item.kind == OperationKind::Delete)
            .unwrap();
        assert_eq!(failed.status, UploadStatus::Failed);
        assert!(failed.can_retry);
        assert_eq!(failed.remote_path, "/Phone/a.txt");
        assert!(f.remote.get("/Phone/a.txt").is_some());

        let id = failed.id;
        let mut items = f.service.observe_upload_queue(&f.folder.id);
        let item = f.service.retry_upload(id).await.unwrap();
        assert_eq!(item.status, UploadStatus::Pending);
        wait_for_item(&mut items, id, UploadStatus::Completed).await;
        assert!(f.remote.get("/Phone/a.txt").is_none());
        assert!(f.service.orchestrator().queue().get(id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn parked_operations_can_be_cancelled_before_any_pass() {
        let f = fixture(SyncType::Bidirectional).await;
        let queue = f.service.orchestrator().queue();
        let id = queue
            .enqueue(
                crate::sync::model::NewOperation::new(&f.folder.id, OperationKind::Move, "a.txt")
                    .with_dest("b.txt"),
            )
            .await
            .unwrap();
        queue.mark_needs_attention(id, "remote refused the move").await.unwrap();

        let item = f.service.cancel_upload(id).await.unwrap();
        assert_eq!(item.kind, OperationKind::Move);
        assert_eq!(item.status, UploadStatus::Cancelled);
        assert!(queue.get(id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn completed_uploads_cannot_be_cancelled() {
        let f = fixture(SyncType::UploadOnly).await;
        f.local.put("a.txt", "hello", 10);
        f.service.trigger_sync(&f.folder.id).await.unwrap().unwrap();
        let items = f.service.observe_upload_queue(&f.folder.id).borrow().clone();
        assert_eq!(items[0].status, UploadStatus::Completed);

        let err = f.service.cancel_upload(items[0].id).await.unwrap_err();
        assert_eq!(err.class(), ErrorClass::InvalidState);
    }

    #[tokio::test]
    async fn resolving_a_conflict_runs_the_plan() {
        let f = fixture(SyncType::Bidirectional).await;
        f.local.put("e.txt", "mine", 20);
        f.remote.put("/Phone/e.txt", "theirs", 30);
        f.service.trigger_sync(&f.folder.id).await.unwrap().unwrap();
        let mut conflicts = f.service.observe_conflicts(&f.folder.id);
        assert_eq!(conflicts.borrow_and_update().len(), 1);

        let mut items = f.service.observe_upload_queue(&f.folder.id);
        let ids = f
            .service
            .resolve_conflict(&f.folder.id, "e.txt", ConflictResolution::KeepRemote)
            .await
            .unwrap();
        assert_eq!(ids.len(), 1);
        assert!(conflicts.borrow_and_update().is_empty());
        wait_for_item(&mut items, ids[0], UploadStatus::Completed).await;
        assert_eq!(f.local.get("e.txt").as_deref(), Some(&b"theirs"[..]));
    }

    #[tokio::test]
    async fn dismissed_conflicts_leave_both_sides_alone() {
        let f = fixture(SyncType::Bidirectional).await;
        f.local.put("e.txt", "mine", 20);
        f.remote.put("/Phone/e.txt", "theirs", 30);
        f.service.trigger_sync(&f.folder.id).await.unwrap().unwrap();

        assert!(f.service.dismiss_conflict(&f.folder.id, "e.txt").await.unwrap());
        assert!(f.service.observe_conflicts(&f.folder.id).borrow().is_empty());
        assert_eq!(f.local.get("e.txt").as_deref(), Some(&b"mine"[..]));
        assert_eq!(f.remote.get("/Phone/e.txt").as_deref(), Some(&b"theirs"[..]));

        let results = f
            .service
            .resolve_conflicts(
                &f.folder.id,
                &[("e.txt".to_string(), ConflictResolution::KeepLocal)],
            )
            .await;
        assert_eq!(results[0].as_ref().unwrap_err().class(), ErrorClass::NotFound);
    }
}
