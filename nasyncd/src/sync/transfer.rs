use std::future::Future;
use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use bytes::Bytes;
use futures_util::{StreamExt, stream};
use thiserror::Error;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::error::ErrorClass;
use super::local::{ByteStream, LocalError, LocalSource};
use super::remote::{RemoteError, RemoteFs};

pub const DEFAULT_CHUNK_SIZE: usize = 256 * 1024;
pub const DEFAULT_STALL_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Error)]
pub enum TransferError {
    #[error("local error: {0}")]
    Local(#[from] LocalError),
    #[error("remote error: {0}")]
    Remote(#[from] RemoteError),
    #[error("no progress for {0}s")]
    Stalled(u64),
    #[error("transfer cancelled")]
    Cancelled,
    #[error("expected {expected} bytes, transferred {actual}")]
    SizeMismatch { expected: u64, actual: u64 },
}

impl TransferError {
    pub fn class(&self) -> ErrorClass {
        match self {
            TransferError::Local(err) => err.class(),
            TransferError::Remote(err) => err.class(),
            TransferError::Stalled(_) | TransferError::SizeMismatch { .. } => {
                ErrorClass::TransientNetwork
            }
            TransferError::Cancelled => ErrorClass::Cancelled,
        }
    }
}

/// Cumulative byte count callback, invoked after every chunk.
pub type ProgressFn = Arc<dyn Fn(u64) + Send + Sync>;

#[derive(Debug, Clone, Copy)]
pub struct TransferConfig {
    pub chunk_size: usize,
    pub stall_timeout: Duration,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            stall_timeout: DEFAULT_STALL_TIMEOUT,
        }
    }
}

/// Streams file bodies between a local source and the remote in bounded chunks,
/// reporting progress and honoring cancellation and the stall timeout.
#[derive(Debug, Clone, Default)]
pub struct TransferEngine {
    config: TransferConfig,
}

impl TransferEngine {
    pub fn new(config: TransferConfig) -> Self {
        Self {
            config: TransferConfig {
                chunk_size: config.chunk_size.max(1),
                stall_timeout: config.stall_timeout,
            },
        }
    }

    pub fn config(&self) -> TransferConfig {
        self.config
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn upload(
        &self,
        local: &dyn LocalSource,
        relative: &str,
        remote: &dyn RemoteFs,
        remote_path: &str,
        size: u64,
        modified: i64,
        progress: ProgressFn,
        cancel: &CancellationToken,
    ) -> Result<u64, TransferError> {
        let counter = Arc::new(AtomicU64::new(0));
        let work = async {
            let source = local.read(relative).await?;
            let body = self.instrument(source, counter.clone(), progress, cancel.clone());
            remote.upload(remote_path, body, size, modified).await?;
            Ok::<_, TransferError>(counter.load(Ordering::Relaxed))
        };
        self.supervise(work, &counter, cancel).await
    }

    /// Downloads `remote_path` into `relative` on the local source. `expected_size` is
    /// checked when known.
    #[allow(clippy::too_many_arguments)]
    pub async fn download(
        &self,
        remote: &dyn RemoteFs,
        remote_path: &str,
        local: &dyn LocalSource,
        relative: &str,
        expected_size: Option<u64>,
        modified: i64,
        progress: ProgressFn,
        cancel: &CancellationToken,
    ) -> Result<u64, TransferError> {
        let counter = Arc::new(AtomicU64::new(0));
        let work = async {
            let source = remote
                .download(remote_path)
                .await?
                .map(|chunk| {
                    chunk.map_err(|err| io::Error::new(io::ErrorKind::ConnectionAborted, err))
                })
                .boxed();
            let body = self.instrument(source, counter.clone(), progress, cancel.clone());
            let written = local.write(relative, body, modified).await?;
            if let Some(expected) = expected_size
                && expected != written
            {
                return Err(TransferError::SizeMismatch {
                    expected,
                    actual: written,
                });
            }
            Ok::<_, TransferError>(written)
        };
        self.supervise(work, &counter, cancel).await
    }

    /// Runs a non-streaming step (delete, move) so that cancellation still interrupts it.
    pub async fn guarded<T, E>(
        &self,
        cancel: &CancellationToken,
        work: impl Future<Output = Result<T, E>>,
    ) -> Result<T, TransferError>
    where
        TransferError: From<E>,
    {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(TransferError::Cancelled),
            result = work => Ok(result?),
        }
    }

    fn instrument(
        &self,
        source: ByteStream,
        counter: Arc<AtomicU64>,
        progress: ProgressFn,
        cancel: CancellationToken,
    ) -> ByteStream {
        let chunk_size = self.config.chunk_size;
        source
            .flat_map(move |chunk| match chunk {
                Ok(bytes) => stream::iter(split_chunks(bytes, chunk_size).into_iter().map(Ok))
                    .left_stream(),
                Err(err) => stream::iter(vec![Err(err)]).right_stream(),
            })
            .map(move |chunk| {
                if cancel.is_cancelled() {
                    return Err(io::Error::new(io::ErrorKind::Interrupted, "transfer cancelled"));
                }
                if let Ok(bytes) = &chunk {
                    let total = counter.fetch_add(bytes.len() as u64, Ordering::Relaxed)
                        + bytes.len() as u64;
                    progress(total);
                }
                chunk
            })
            .boxed()
    }

    async fn supervise<T>(
        &self,
        work: impl Future<Output = Result<T, TransferError>>,
        counter: &AtomicU64,
        cancel: &CancellationToken,
    ) -> Result<T, TransferError> {
        let timeout = self.config.stall_timeout;
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(TransferError::Cancelled),
            _ = stalled(counter, timeout) => Err(TransferError::Stalled(timeout.as_secs())),
            result = work => result,
        }
    }
}

fn split_chunks(bytes: Bytes, chunk_size: usize) -> Vec<Bytes> {
    if bytes.len() <= chunk_size {
        return vec![bytes];
    }
    let mut out = Vec::with_capacity(bytes.len().div_ceil(chunk_size));
    let mut rest = bytes;
    while rest.len() > chunk_size {
        out.push(rest.split_to(chunk_size));
    }
    out.push(rest);
    out
}

/// Resolves once the counter has not moved for `timeout`.
async fn stalled(counter: &AtomicU64, timeout: Duration) {
    let tick = (timeout / 4).max(Duration::from_millis(10));
    let mut last = counter.load(Ordering::Relaxed);
    let mut since = Instant::now();
    loop {
        tokio::time::sleep(tick).await;
        let now = counter.load(Ordering::Relaxed);
        if now != last {
            last = now;
            since = Instant::now();
        } else if since.elapsed() >= timeout {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::local::MemorySource;
    use crate::sync::testing::FakeRemote;
    use std::sync::Mutex;

    fn recorder() -> (ProgressFn, Arc<Mutex<Vec<u64>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        (Arc::new(move |bytes| sink.lock().unwrap().push(bytes)), seen)
    }

    fn engine(chunk_size: usize, stall_ms: u64) -> TransferEngine {
        TransferEngine::new(TransferConfig {
            chunk_size,
            stall_timeout: Duration::from_millis(stall_ms),
        })
    }

    #[test]
    fn splits_large_chunks() {
        let parts = split_chunks(Bytes::from_static(b"abcdefg"), 3);
        assert_eq!(parts, vec![Bytes::from_static(b"abc"), Bytes::from_static(b"def"), Bytes::from_static(b"g")]);
        assert_eq!(split_chunks(Bytes::from_static(b"ab"), 3).len(), 1);
    }

    #[tokio::test]
    async fn upload_reports_monotonic_progress() {
        let local = MemorySource::new();
        local.put("a.txt", Bytes::from_static(b"0123456789"), 1_000);
        let remote = FakeRemote::new();
        let (progress, seen) = recorder();

        let sent = engine(4, 5_000)
            .upload(&local, "a.txt", &remote, "/r/a.txt", 10, 1_000, progress, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(sent, 10);
        assert_eq!(*seen.lock().unwrap(), vec![4, 8, 10]);
        assert_eq!(remote.get("/r/a.txt").unwrap(), Bytes::from_static(b"0123456789"));
        assert_eq!(remote.modified("/r/a.txt"), Some(1_000));
    }

    #[tokio::test]
    async fn download_writes_local_file_with_remote_time() {
        let local = MemorySource::new();
        let remote = FakeRemote::new();
        remote.put("/r/b.txt", b"remote".to_vec(), 2_000);
        let (progress, _) = recorder();

        let written = engine(2, 5_000)
            .download(&remote, "/r/b.txt", &local, "b.txt", Some(6), 2_000, progress, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(written, 6);
        assert_eq!(local.get("b.txt").unwrap(), Bytes::from_static(b"remote"));
        assert_eq!(local.modified("b.txt"), Some(2_000));
    }

    #[tokio::test]
    async fn download_size_mismatch_is_transient() {
        let local = MemorySource::new();
        let remote = FakeRemote::new();
        remote.put("/r/b.txt", b"remote".to_vec(), 2_000);
        let (progress, _) = recorder();

        let err = engine(2, 5_000)
            .download(&remote, "/r/b.txt", &local, "b.txt", Some(99), 2_000, progress, &CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err.class(), ErrorClass::TransientNetwork);
    }

    #[tokio::test]
    async fn cancelled_transfer_stops() {
        let local = MemorySource::new();
        local.put("a.txt", Bytes::from_static(b"data"), 1);
        let remote = FakeRemote::new();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let (progress, _) = recorder();

        let err = engine(2, 5_000)
            .upload(&local, "a.txt", &remote, "/r/a.txt", 4, 1, progress, &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, TransferError::Cancelled));
        assert!(remote.get("/r/a.txt").is_none());
    }

    #[tokio::test]
    async fn stalled_download_times_out() {
        let local = MemorySource::new();
        let remote = FakeRemote::new();
        remote.put("/r/slow.bin", b"abcdef".to_vec(), 1);
        remote.stall_downloads(true);
        let (progress, _) = recorder();

        let err = engine(2, 60)
            .download(&remote, "/r/slow.bin", &local, "slow.bin", None, 1, progress, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, TransferError::Stalled(_)));
        assert_eq!(err.class(), ErrorClass::TransientNetwork);
        assert!(local.get("slow.bin").is_none());
    }
}
