//! In-memory remote used by engine tests.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures_util::{StreamExt, stream};
use nasync_core::NasError;
use reqwest::StatusCode;

use super::local::ByteStream;
use super::model::FileEntry;
use super::paths::{parent_of, strip_remote_root};
use super::remote::{RemoteError, RemoteFs};

#[derive(Default)]
struct State {
    files: BTreeMap<String, (Bytes, i64)>,
    log: Vec<String>,
    failures: VecDeque<(String, StatusCode)>,
}

#[derive(Default)]
pub struct FakeRemote {
    state: Mutex<State>,
    offline: AtomicBool,
    stall: AtomicBool,
}

impl FakeRemote {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&self, path: &str, data: impl Into<Bytes>, modified: i64) {
        self.lock()
            .files
            .insert(path.to_string(), (data.into(), modified));
    }

    pub fn get(&self, path: &str) -> Option<Bytes> {
        self.lock().files.get(path).map(|(data, _)| data.clone())
    }

    pub fn modified(&self, path: &str) -> Option<i64> {
        self.lock().files.get(path).map(|(_, modified)| *modified)
    }

    pub fn paths(&self) -> Vec<String> {
        self.lock().files.keys().cloned().collect()
    }

    /// Calls in order, formatted as `"<op> <path>"`.
    pub fn log(&self) -> Vec<String> {
        self.lock().log.clone()
    }

    /// Makes the next call of `op` (`list`, `upload`, `download`, `delete`, `move`) fail.
    pub fn fail_next(&self, op: &str, status: StatusCode) {
        self.lock().failures.push_back((op.to_string(), status));
    }

    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    pub fn stall_downloads(&self, stall: bool) {
        self.stall.store(stall, Ordering::SeqCst);
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn check(&self, op: &str) -> Result<(), RemoteError> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(api_error(StatusCode::SERVICE_UNAVAILABLE));
        }
        let mut state = self.lock();
        if let Some(index) = state.failures.iter().position(|(name, _)| name == op)
            && let Some((_, status)) = state.failures.remove(index)
        {
            return Err(api_error(status));
        }
        Ok(())
    }

    fn record(&self, entry: String) {
        self.lock().log.push(entry);
    }
}

fn api_error(status: StatusCode) -> RemoteError {
    RemoteError::Api(NasError::Api {
        status,
        body: String::new(),
        retry_after: None,
    })
}

#[async_trait]
impl RemoteFs for FakeRemote {
    async fn list(&self, root: &str) -> Result<Vec<FileEntry>, RemoteError> {
        self.check("list")?;
        let state = self.lock();
        let mut dirs = BTreeSet::new();
        let mut out = Vec::new();
        for (path, (data, modified)) in &state.files {
            let Some(relative) = strip_remote_root(root, path) else {
                continue;
            };
            let mut parent = parent_of(&relative);
            while let Some(dir) = parent {
                dirs.insert(dir.to_string());
                parent = parent_of(dir);
            }
            out.push(FileEntry::file(relative, data.len() as u64, *modified));
        }
        out.extend(dirs.into_iter().map(|path| FileEntry {
            path,
            size: 0,
            modified: 0,
            is_dir: true,
        }));
        Ok(out)
    }

    async fn upload(
        &self,
        path: &str,
        mut body: ByteStream,
        _size: u64,
        modified: i64,
    ) -> Result<(), RemoteError> {
        self.check("upload")?;
        let mut buffer = BytesMut::new();
        while let Some(chunk) = body.next().await {
            let chunk = chunk.map_err(|_| api_error(StatusCode::BAD_GATEWAY))?;
            buffer.extend_from_slice(&chunk);
        }
        self.put(path, buffer.freeze(), modified);
        self.record(format!("upload {path}"));
        Ok(())
    }

    async fn download(&self, path: &str) -> Result<ByteStream, RemoteError> {
        self.check("download")?;
        let data = self
            .get(path)
            .ok_or_else(|| api_error(StatusCode::NOT_FOUND))?;
        self.record(format!("download {path}"));
        if self.stall.load(Ordering::SeqCst) {
            let first = data.slice(..data.len().min(1));
            return Ok(stream::iter(vec![Ok(first)]).chain(stream::pending()).boxed());
        }
        Ok(stream::iter(vec![Ok(data)]).boxed())
    }

    async fn delete(&self, path: &str) -> Result<(), RemoteError> {
        self.check("delete")?;
        self.lock().files.remove(path);
        self.record(format!("delete {path}"));
        Ok(())
    }

    async fn move_to(&self, from: &str, to: &str) -> Result<(), RemoteError> {
        self.check("move")?;
        let mut state = self.lock();
        let file = state
            .files
            .remove(from)
            .ok_or_else(|| api_error(StatusCode::NOT_FOUND))?;
        state.files.insert(to.to_string(), file);
        state.log.push(format!("move {from} -> {to}"));
        Ok(())
    }

    async fn probe(&self) -> Result<(), RemoteError> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(api_error(StatusCode::SERVICE_UNAVAILABLE));
        }
        Ok(())
    }
}
