use tokio::sync::watch;
use tracing::info;
use uuid::Uuid;

use super::error::SyncError;
use super::local::validate_root;
use super::model::{FolderPatch, NewSyncFolder, SyncFolderConfig, SyncStatus, now_millis};
use super::paths::normalize_remote_root;
use super::store::SyncStore;

/// Durable catalog of sync folders. Every mutation is committed before it is published.
pub struct SyncFolderRegistry {
    store: SyncStore,
    device_id: String,
    tx: watch::Sender<Vec<SyncFolderConfig>>,
}

impl SyncFolderRegistry {
    pub async fn load(store: SyncStore, device_id: impl Into<String>) -> Result<Self, SyncError> {
        let folders = store.list_folders().await?;
        Ok(Self {
            store,
            device_id: device_id.into(),
            tx: watch::Sender::new(folders),
        })
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    pub fn observe(&self) -> watch::Receiver<Vec<SyncFolderConfig>> {
        self.tx.subscribe()
    }

    pub async fn list(&self) -> Result<Vec<SyncFolderConfig>, SyncError> {
        Ok(self.store.list_folders().await?)
    }

    pub async fn get(&self, id: &str) -> Result<SyncFolderConfig, SyncError> {
        self.store
            .get_folder(id)
            .await?
            .ok_or_else(|| SyncError::NotFound(format!("folder {id}")))
    }

    pub async fn create(&self, input: NewSyncFolder) -> Result<SyncFolderConfig, SyncError> {
        let mut folder = SyncFolderConfig {
            id: Uuid::new_v4().to_string(),
            device_id: self.device_id.clone(),
            local_root: input.local_root,
            remote_path: input.remote_path,
            sync_type: input.sync_type,
            auto_sync: input.auto_sync,
            conflict_policy: input.conflict_policy,
            exclude_patterns: input.exclude_patterns,
            last_sync: None,
            status: SyncStatus::Idle,
            last_error: None,
        };
        self.validate(&mut folder).await?;
        self.store.insert_folder(&folder).await?;
        info!(folder = %folder.id, remote = %folder.remote_path, "sync folder created");
        self.publish().await?;
        Ok(folder)
    }

    pub async fn update(&self, id: &str, patch: FolderPatch) -> Result<SyncFolderConfig, SyncError> {
        let mut folder = self.get(id).await?;
        patch.apply_to(&mut folder);
        self.validate(&mut folder).await?;
        if !self.store.update_folder(&folder).await? {
            return Err(SyncError::NotFound(format!("folder {id}")));
        }
        info!(folder = %id, "sync folder updated");
        self.publish().await?;
        Ok(folder)
    }

    /// Removes the folder with its queue, conflicts and checkpoints. Unknown ids are a no-op.
    pub async fn delete(&self, id: &str) -> Result<bool, SyncError> {
        let removed = self.store.delete_folder(id).await?;
        if removed {
            info!(folder = %id, "sync folder deleted");
        }
        self.publish().await?;
        Ok(removed)
    }

    pub async fn set_status(
        &self,
        id: &str,
        status: SyncStatus,
        last_error: Option<&str>,
    ) -> Result<(), SyncError> {
        if !self.store.set_folder_status(id, status, last_error).await? {
            return Err(SyncError::NotFound(format!("folder {id}")));
        }
        self.publish().await
    }

    /// Atomically claims the folder for one pass. `false` when it is busy or paused.
    pub async fn try_begin_pass(&self, id: &str) -> Result<bool, SyncError> {
        let claimed = self.store.try_begin_pass(id).await?;
        if claimed {
            self.publish().await?;
        }
        Ok(claimed)
    }

    pub async fn finish_pass(&self, id: &str, error: Option<&str>) -> Result<(), SyncError> {
        self.store.finish_pass(id, error, now_millis()).await?;
        self.publish().await
    }

    pub async fn release_pass(&self, id: &str) -> Result<(), SyncError> {
        self.store.release_pass(id).await?;
        self.publish().await
    }

    pub async fn pause(&self, id: &str) -> Result<(), SyncError> {
        self.set_status(id, SyncStatus::Paused, None).await
    }

    pub async fn resume(&self, id: &str) -> Result<(), SyncError> {
        let folder = self.get(id).await?;
        if folder.status != SyncStatus::Paused {
            return Err(SyncError::InvalidState(format!(
                "folder {id} is {}, not paused",
                folder.status.as_str()
            )));
        }
        self.set_status(id, SyncStatus::Idle, None).await
    }

    /// Clears `syncing` left behind by a crash.
    pub async fn recover_interrupted(&self) -> Result<u64, SyncError> {
        let recovered = self.store.recover_syncing_folders().await?;
        if recovered > 0 {
            info!(recovered, "reset interrupted sync passes");
        }
        self.publish().await?;
        Ok(recovered)
    }

    async fn validate(&self, folder: &mut SyncFolderConfig) -> Result<(), SyncError> {
        folder.local_root = folder.local_root.trim().to_string();
        if folder.local_root.is_empty() {
            return Err(SyncError::Validation("local root is empty".into()));
        }
        validate_root(&folder.local_root)
            .map_err(|err| SyncError::Validation(err.to_string()))?;
        if folder.remote_path.trim().is_empty() {
            return Err(SyncError::Validation("remote path is empty".into()));
        }
        folder.remote_path = normalize_remote_root(&folder.remote_path)
            .map_err(|err| SyncError::Validation(format!("remote path: {err}")))?;
        if folder.exclude_patterns.iter().any(|p| p.trim().is_empty()) {
            return Err(SyncError::Validation("exclude pattern is empty".into()));
        }
        if let Some(existing) = self
            .store
            .find_folder_by_remote(&folder.device_id, &folder.remote_path)
            .await?
            && existing.id != folder.id
        {
            return Err(SyncError::Validation(format!(
                "remote path {} is already synced by folder {}",
                folder.remote_path, existing.id
            )));
        }
        Ok(())
    }

    async fn publish(&self) -> Result<(), SyncError> {
        let folders = self.store.list_folders().await?;
        self.tx.send_if_modified(|current| {
            if *current == folders {
                return false;
            }
            *current = folders;
            true
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::error::ErrorClass;
    use crate::sync::model::{ConflictPolicy, SyncType};

    fn input(remote: &str) -> NewSyncFolder {
        NewSyncFolder {
            local_root: "memory://phone".into(),
            remote_path: remote.into(),
            sync_type: SyncType::Bidirectional,
            auto_sync: true,
            conflict_policy: ConflictPolicy::Ask,
            exclude_patterns: vec!["*.tmp".into()],
        }
    }

    async fn registry() -> SyncFolderRegistry {
        let store = SyncStore::in_memory().await.unwrap();
        SyncFolderRegistry::load(store, "device-1").await.unwrap()
    }

    #[tokio::test]
    async fn create_normalizes_and_publishes() {
        let registry = registry().await;
        let mut rx = registry.observe();
        let folder = registry.create(input("Photos/")).await.unwrap();

        assert_eq!(folder.remote_path, "/Photos");
        assert_eq!(folder.status, SyncStatus::Idle);
        assert!(rx.has_changed().unwrap());
        assert_eq!(rx.borrow_and_update().as_slice(), std::slice::from_ref(&folder));
    }

    #[tokio::test]
    async fn rejects_invalid_input() {
        let registry = registry().await;
        registry.create(input("/Photos")).await.unwrap();

        let mut empty_local = input("/Docs");
        empty_local.local_root = "  ".into();
        let mut bad_scheme = input("/Docs");
        bad_scheme.local_root = "content://com.android/tree/1".into();
        let mut bad_pattern = input("/Docs");
        bad_pattern.exclude_patterns.push(String::new());

        for candidate in [input("/Photos"), input(""), empty_local, bad_scheme, bad_pattern] {
            let err = registry.create(candidate).await.unwrap_err();
            assert_eq!(err.class(), ErrorClass::Validation, "{err}");
        }
        assert_eq!(registry.list().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn same_remote_path_is_allowed_on_other_devices() {
        let store = SyncStore::in_memory().await.unwrap();
        let phone = SyncFolderRegistry::load(store.clone(), "phone").await.unwrap();
        let laptop = SyncFolderRegistry::load(store, "laptop").await.unwrap();
        phone.create(input("/Shared")).await.unwrap();
        laptop.create(input("/Shared")).await.unwrap();
        assert_eq!(phone.list().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn update_and_delete() {
        let registry = registry().await;
        let folder = registry.create(input("/Photos")).await.unwrap();
        let other = registry.create(input("/Docs")).await.unwrap();

        let updated = registry
            .update(
                &folder.id,
                FolderPatch {
                    auto_sync: Some(false),
                    ..FolderPatch::default()
                },
            )
            .await
            .unwrap();
        assert!(!updated.auto_sync);

        let clash = registry
            .update(
                &other.id,
                FolderPatch {
                    remote_path: Some("/Photos".into()),
                    ..FolderPatch::default()
                },
            )
            .await
            .unwrap_err();
        assert_eq!(clash.class(), ErrorClass::Validation);

        let missing = registry.update("nope", FolderPatch::default()).await.unwrap_err();
        assert_eq!(missing.class(), ErrorClass::NotFound);

        assert!(registry.delete(&folder.id).await.unwrap());
        assert!(!registry.delete(&folder.id).await.unwrap());
        assert_eq!(registry.observe().borrow().len(), 1);
    }

    #[tokio::test]
    async fn pause_blocks_passes_until_resumed() {
        let registry = registry().await;
        let folder = registry.create(input("/Photos")).await.unwrap();

        registry.pause(&folder.id).await.unwrap();
        assert!(!registry.try_begin_pass(&folder.id).await.unwrap());
        registry.resume(&folder.id).await.unwrap();
        assert!(registry.try_begin_pass(&folder.id).await.unwrap());
        assert!(!registry.try_begin_pass(&folder.id).await.unwrap());

        let err = registry.resume(&folder.id).await.unwrap_err();
        assert_eq!(err.class(), ErrorClass::InvalidState);

        registry.finish_pass(&folder.id, Some("listing failed")).await.unwrap();
        let failed = registry.get(&folder.id).await.unwrap();
        assert_eq!(failed.status, SyncStatus::Error);
        assert_eq!(failed.last_error.as_deref(), Some("listing failed"));
    }
}
