//! Pure reconciliation of a local listing, a remote listing and the checkpoints.

use std::collections::{BTreeSet, HashMap, HashSet};

use super::conflict::{detect, same_version};
use super::glob::ExcludeSet;
use super::model::{ConflictType, FileEntry, SyncType};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiffAction {
    Upload(FileEntry),
    Download(FileEntry),
    DeleteRemote(String),
    DeleteLocal(String),
    Conflict {
        path: String,
        conflict_type: ConflictType,
        local: Option<FileEntry>,
        remote: Option<FileEntry>,
    },
    RecordCheckpoint { path: String, modified: i64 },
    DropCheckpoint(String),
}

impl DiffAction {
    pub fn path(&self) -> &str {
        match self {
            DiffAction::Upload(entry) | DiffAction::Download(entry) => &entry.path,
            DiffAction::DeleteRemote(path)
            | DiffAction::DeleteLocal(path)
            | DiffAction::DropCheckpoint(path) => path,
            DiffAction::Conflict { path, .. } | DiffAction::RecordCheckpoint { path, .. } => path,
        }
    }
}

pub struct DiffInput<'a> {
    pub sync_type: SyncType,
    pub local: &'a [FileEntry],
    pub remote: &'a [FileEntry],
    pub checkpoints: &'a HashMap<String, i64>,
    /// Paths with queued operations or open conflicts; they are left alone.
    pub busy: &'a HashSet<String>,
    pub excludes: &'a ExcludeSet,
}

/// Classifies every path seen on either side or in the checkpoints, in path order.
pub fn diff(input: &DiffInput<'_>) -> Vec<DiffAction> {
    let local = index_files(input.local);
    let remote = index_files(input.remote);
    let paths: BTreeSet<&str> = local
        .keys()
        .chain(remote.keys())
        .copied()
        .chain(input.checkpoints.keys().map(String::as_str))
        .collect();

    paths
        .into_iter()
        .filter(|path| !input.busy.contains(*path) && !input.excludes.is_excluded(path))
        .filter_map(|path| {
            classify(
                input.sync_type,
                path,
                local.get(path).copied(),
                remote.get(path).copied(),
                input.checkpoints.get(path).copied(),
            )
        })
        .collect()
}

fn index_files(entries: &[FileEntry]) -> HashMap<&str, &FileEntry> {
    entries
        .iter()
        .filter(|entry| !entry.is_dir)
        .map(|entry| (entry.path.as_str(), entry))
        .collect()
}

fn classify(
    sync_type: SyncType,
    path: &str,
    local: Option<&FileEntry>,
    remote: Option<&FileEntry>,
    checkpoint: Option<i64>,
) -> Option<DiffAction> {
    if let (Some(l), Some(r)) = (local, remote)
        && same_version(l, r)
    {
        return match checkpoint {
            Some(base) if base >= l.modified => None,
            _ => Some(DiffAction::RecordCheckpoint {
                path: path.to_string(),
                modified: l.modified,
            }),
        };
    }
    match sync_type {
        SyncType::Bidirectional => classify_bidirectional(path, local, remote, checkpoint),
        SyncType::UploadOnly => mirror_local(path, local, remote, checkpoint),
        SyncType::DownloadOnly => mirror_remote(path, local, remote, checkpoint),
    }
}

fn classify_bidirectional(
    path: &str,
    local: Option<&FileEntry>,
    remote: Option<&FileEntry>,
    checkpoint: Option<i64>,
) -> Option<DiffAction> {
    if let Some(conflict_type) = detect(local, remote, checkpoint) {
        return Some(DiffAction::Conflict {
            path: path.to_string(),
            conflict_type,
            local: local.cloned(),
            remote: remote.cloned(),
        });
    }
    let changed = |entry: &FileEntry| checkpoint.is_none_or(|base| entry.modified > base);
    match (local, remote, checkpoint) {
        (Some(l), None, None) => Some(DiffAction::Upload(l.clone())),
        (None, Some(r), None) => Some(DiffAction::Download(r.clone())),
        (Some(l), Some(_), Some(_)) if changed(l) => Some(DiffAction::Upload(l.clone())),
        (Some(_), Some(r), Some(_)) if changed(r) => Some(DiffAction::Download(r.clone())),
        (Some(_), None, Some(_)) => Some(DiffAction::DeleteLocal(path.to_string())),
        (None, Some(_), Some(_)) => Some(DiffAction::DeleteRemote(path.to_string())),
        (None, None, Some(_)) => Some(DiffAction::DropCheckpoint(path.to_string())),
        _ => None,
    }
}

/// Upload-only: the remote follows the local tree for every path this folder owns.
fn mirror_local(
    path: &str,
    local: Option<&FileEntry>,
    remote: Option<&FileEntry>,
    checkpoint: Option<i64>,
) -> Option<DiffAction> {
    match (local, remote, checkpoint) {
        (Some(l), _, _) => Some(DiffAction::Upload(l.clone())),
        (None, Some(_), Some(_)) => Some(DiffAction::DeleteRemote(path.to_string())),
        (None, None, Some(_)) => Some(DiffAction::DropCheckpoint(path.to_string())),
        (None, _, None) => None,
    }
}

/// Download-only: the local tree follows the remote.
fn mirror_remote(
    path: &str,
    local: Option<&FileEntry>,
    remote: Option<&FileEntry>,
    checkpoint: Option<i64>,
) -> Option<DiffAction> {
    match (local, remote, checkpoint) {
        (_, Some(r), _) => Some(DiffAction::Download(r.clone())),
        (Some(_), None, Some(_)) => Some(DiffAction::DeleteLocal(path.to_string())),
        (None, None, Some(_)) => Some(DiffAction::DropCheckpoint(path.to_string())),
        (_, None, None) => None,
    }
}
