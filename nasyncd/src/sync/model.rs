use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use time::OffsetDateTime;

#[derive(Debug, Error, PartialEq, Eq)]
#[error("unknown {kind} value: {value}")]
pub struct UnknownVariant {
    pub kind: &'static str,
    pub value: String,
}

impl UnknownVariant {
    fn new(kind: &'static str, value: &str) -> Self {
        Self {
            kind,
            value: value.to_string(),
        }
    }
}

/// Wall-clock time in unix milliseconds. All persisted timestamps use this unit.
pub fn now_millis() -> i64 {
    (OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000) as i64
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncType {
    UploadOnly,
    DownloadOnly,
    Bidirectional,
}

impl SyncType {
    pub fn as_str(self) -> &'static str {
        match self {
            SyncType::UploadOnly => "upload_only",
            SyncType::DownloadOnly => "download_only",
            SyncType::Bidirectional => "bidirectional",
        }
    }

    /// Whether local changes are pushed to the remote.
    pub fn pushes(self) -> bool {
        matches!(self, SyncType::UploadOnly | SyncType::Bidirectional)
    }

    /// Whether remote changes are pulled to the device.
    pub fn pulls(self) -> bool {
        matches!(self, SyncType::DownloadOnly | SyncType::Bidirectional)
    }
}

impl FromStr for SyncType {
    type Err = UnknownVariant;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "upload_only" => Ok(SyncType::UploadOnly),
            "download_only" => Ok(SyncType::DownloadOnly),
            "bidirectional" => Ok(SyncType::Bidirectional),
            other => Err(UnknownVariant::new("sync type", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    Idle,
    Syncing,
    Error,
    Paused,
}

impl SyncStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            SyncStatus::Idle => "idle",
            SyncStatus::Syncing => "syncing",
            SyncStatus::Error => "error",
            SyncStatus::Paused => "paused",
        }
    }
}

impl FromStr for SyncStatus {
    type Err = UnknownVariant;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "idle" => Ok(SyncStatus::Idle),
            "syncing" => Ok(SyncStatus::Syncing),
            "error" => Ok(SyncStatus::Error),
            "paused" => Ok(SyncStatus::Paused),
            other => Err(UnknownVariant::new("sync status", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictResolution {
    KeepLocal,
    KeepRemote,
    KeepBoth,
    KeepNewest,
}

impl ConflictResolution {
    pub fn as_str(self) -> &'static str {
        match self {
            ConflictResolution::KeepLocal => "keep_local",
            ConflictResolution::KeepRemote => "keep_remote",
            ConflictResolution::KeepBoth => "keep_both",
            ConflictResolution::KeepNewest => "keep_newest",
        }
    }
}

impl FromStr for ConflictResolution {
    type Err = UnknownVariant;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "keep_local" => Ok(ConflictResolution::KeepLocal),
            "keep_remote" => Ok(ConflictResolution::KeepRemote),
            "keep_both" => Ok(ConflictResolution::KeepBoth),
            "keep_newest" => Ok(ConflictResolution::KeepNewest),
            other => Err(UnknownVariant::new("conflict resolution", other)),
        }
    }
}

/// Folder default for newly detected conflicts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictPolicy {
    Ask,
    Auto(ConflictResolution),
}

impl ConflictPolicy {
    pub fn as_str(self) -> &'static str {
        match self {
            ConflictPolicy::Ask => "ask",
            ConflictPolicy::Auto(resolution) => resolution.as_str(),
        }
    }

    pub fn auto_resolution(self) -> Option<ConflictResolution> {
        match self {
            ConflictPolicy::Ask => None,
            ConflictPolicy::Auto(resolution) => Some(resolution),
        }
    }
}

impl FromStr for ConflictPolicy {
    type Err = UnknownVariant;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        if value == "ask" {
            return Ok(ConflictPolicy::Ask);
        }
        value
            .parse::<ConflictResolution>()
            .map(ConflictPolicy::Auto)
            .map_err(|_| UnknownVariant::new("conflict policy", value))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictType {
    BothModified,
    LocalDeletedRemoteModified,
    RemoteDeletedLocalModified,
}

impl ConflictType {
    pub fn as_str(self) -> &'static str {
        match self {
            ConflictType::BothModified => "both_modified",
            ConflictType::LocalDeletedRemoteModified => "local_deleted_remote_modified",
            ConflictType::RemoteDeletedLocalModified => "remote_deleted_local_modified",
        }
    }
}

impl FromStr for ConflictType {
    type Err = UnknownVariant;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "both_modified" => Ok(ConflictType::BothModified),
            "local_deleted_remote_modified" => Ok(ConflictType::LocalDeletedRemoteModified),
            "remote_deleted_local_modified" => Ok(ConflictType::RemoteDeletedLocalModified),
            other => Err(UnknownVariant::new("conflict type", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    Upload,
    Download,
    Delete,
    LocalDelete,
    Move,
    Rename,
}

impl OperationKind {
    pub fn as_str(self) -> &'static str {
        match self {
            OperationKind::Upload => "upload",
            OperationKind::Download => "download",
            OperationKind::Delete => "delete",
            OperationKind::LocalDelete => "local_delete",
            OperationKind::Move => "move",
            OperationKind::Rename => "rename",
        }
    }

    /// The side the operation changes: `Upload` writes to the remote, `Download` to the
    /// local root.
    pub fn direction(self) -> TransferDirection {
        match self {
            OperationKind::Upload
            | OperationKind::Delete
            | OperationKind::Move
            | OperationKind::Rename => TransferDirection::Upload,
            OperationKind::Download | OperationKind::LocalDelete => TransferDirection::Download,
        }
    }

    /// Whether the operation streams file content.
    pub fn moves_bytes(self) -> bool {
        matches!(self, OperationKind::Upload | OperationKind::Download)
    }
}

impl FromStr for OperationKind {
    type Err = UnknownVariant;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "upload" => Ok(OperationKind::Upload),
            "download" => Ok(OperationKind::Download),
            "delete" => Ok(OperationKind::Delete),
            "local_delete" => Ok(OperationKind::LocalDelete),
            "move" => Ok(OperationKind::Move),
            "rename" => Ok(OperationKind::Rename),
            other => Err(UnknownVariant::new("operation kind", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationState {
    Pending,
    InFlight,
    NeedsAttention,
}

impl OperationState {
    pub fn as_str(self) -> &'static str {
        match self {
            OperationState::Pending => "pending",
            OperationState::InFlight => "in_flight",
            OperationState::NeedsAttention => "needs_attention",
        }
    }
}

impl FromStr for OperationState {
    type Err = UnknownVariant;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "pending" => Ok(OperationState::Pending),
            "in_flight" => Ok(OperationState::InFlight),
            "needs_attention" => Ok(OperationState::NeedsAttention),
            other => Err(UnknownVariant::new("operation state", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UploadStatus {
    Pending,
    Uploading,
    Completed,
    Failed,
    Cancelled,
}

impl UploadStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, UploadStatus::Completed | UploadStatus::Cancelled)
    }
}

impl fmt::Display for UploadStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            UploadStatus::Pending => "pending",
            UploadStatus::Uploading => "uploading",
            UploadStatus::Completed => "completed",
            UploadStatus::Failed => "failed",
            UploadStatus::Cancelled => "cancelled",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferDirection {
    Upload,
    Download,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncFolderConfig {
    pub id: String,
    pub device_id: String,
    pub local_root: String,
    pub remote_path: String,
    pub sync_type: SyncType,
    pub auto_sync: bool,
    pub conflict_policy: ConflictPolicy,
    pub exclude_patterns: Vec<String>,
    pub last_sync: Option<i64>,
    pub status: SyncStatus,
    pub last_error: Option<String>,
}

/// User input for a new folder; the registry assigns id, device and status.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewSyncFolder {
    pub local_root: String,
    pub remote_path: String,
    pub sync_type: SyncType,
    pub auto_sync: bool,
    pub conflict_policy: ConflictPolicy,
    pub exclude_patterns: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FolderPatch {
    pub local_root: Option<String>,
    pub remote_path: Option<String>,
    pub sync_type: Option<SyncType>,
    pub auto_sync: Option<bool>,
    pub conflict_policy: Option<ConflictPolicy>,
    pub exclude_patterns: Option<Vec<String>>,
}

impl FolderPatch {
    pub fn apply_to(self, folder: &mut SyncFolderConfig) {
        if let Some(local_root) = self.local_root {
            folder.local_root = local_root;
        }
        if let Some(remote_path) = self.remote_path {
            folder.remote_path = remote_path;
        }
        if let Some(sync_type) = self.sync_type {
            folder.sync_type = sync_type;
        }
        if let Some(auto_sync) = self.auto_sync {
            folder.auto_sync = auto_sync;
        }
        if let Some(policy) = self.conflict_policy {
            folder.conflict_policy = policy;
        }
        if let Some(patterns) = self.exclude_patterns {
            folder.exclude_patterns = patterns;
        }
    }
}

/// One file or directory as seen by a listing. `path` is folder-relative with `/` separators.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileEntry {
    pub path: String,
    pub size: u64,
    pub modified: i64,
    pub is_dir: bool,
}

impl FileEntry {
    pub fn file(path: impl Into<String>, size: u64, modified: i64) -> Self {
        Self {
            path: path.into(),
            size,
            modified,
            is_dir: false,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionInfo {
    pub exists: bool,
    pub size: Option<u64>,
    pub modified: Option<i64>,
    pub preview: Option<String>,
}

impl VersionInfo {
    pub fn missing() -> Self {
        Self::default()
    }

    pub fn from_entry(entry: &FileEntry) -> Self {
        Self {
            exists: true,
            size: Some(entry.size),
            modified: Some(entry.modified),
            preview: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileConflict {
    pub folder_id: String,
    pub path: String,
    pub conflict_type: ConflictType,
    pub local: VersionInfo,
    pub remote: VersionInfo,
    pub detected_at: i64,
    pub resolution: Option<ConflictResolution>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueuedOperation {
    pub id: i64,
    pub folder_id: String,
    pub kind: OperationKind,
    pub path: String,
    pub dest_path: Option<String>,
    pub modified: Option<i64>,
    pub size: Option<u64>,
    pub attempt: u32,
    pub state: OperationState,
    pub retry_at: Option<i64>,
    pub last_error: Option<String>,
    pub enqueued_at: i64,
}

impl QueuedOperation {
    /// Path the operation writes to: the destination for moves and renamed downloads.
    pub fn target_path(&self) -> &str {
        self.dest_path.as_deref().unwrap_or(&self.path)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewOperation {
    pub folder_id: String,
    pub kind: OperationKind,
    pub path: String,
    pub dest_path: Option<String>,
    pub modified: Option<i64>,
    pub size: Option<u64>,
}

impl NewOperation {
    pub fn new(folder_id: &str, kind: OperationKind, path: &str) -> Self {
        Self {
            folder_id: folder_id.to_string(),
            kind,
            path: path.to_string(),
            dest_path: None,
            modified: None,
            size: None,
        }
    }

    pub fn with_dest(mut self, dest_path: &str) -> Self {
        self.dest_path = Some(dest_path.to_string());
        self
    }

    pub fn with_version(mut self, entry: &FileEntry) -> Self {
        self.modified = Some(entry.modified);
        self.size = Some(entry.size);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadQueueItem {
    pub id: i64,
    pub folder_id: String,
    pub file_name: String,
    pub remote_path: String,
    pub kind: OperationKind,
    pub direction: TransferDirection,
    pub total_bytes: u64,
    pub transferred_bytes: u64,
    pub status: UploadStatus,
    pub can_retry: bool,
    pub error: Option<String>,
}

impl UploadQueueItem {
    pub fn percent(&self) -> u8 {
        if self.total_bytes == 0 {
            return if self.status == UploadStatus::Completed {
                100
            } else {
                0
            };
        }
        ((self.transferred_bytes.min(self.total_bytes) * 100) / self.total_bytes) as u8
    }
}
