//! Local change sources: the device side of a sync folder, addressed by URI.

mod fs;
mod memory;
mod webdav;

use std::collections::HashMap;
use std::io;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::Stream;
use thiserror::Error;
use url::Url;

use super::error::ErrorClass;
use super::model::FileEntry;
use super::paths::PathError;

pub use fs::{FsSource, PARTIAL_SUFFIX};
pub use memory::MemorySource;
pub use webdav::WebDavSource;

pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes, io::Error>> + Send>>;

#[derive(Debug, Error)]
pub enum LocalError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("invalid path: {0}")]
    Path(#[from] PathError),
    #[error("unsupported local root: {0}")]
    Unsupported(String),
    #[error("invalid local root uri: {0}")]
    InvalidUri(String),
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("webdav server returned {status} for {path}")]
    Status { status: u16, path: String },
    #[error("malformed webdav response: {0}")]
    Xml(String),
    #[error("no such file: {0}")]
    NotFound(String),
}

impl LocalError {
    pub fn class(&self) -> ErrorClass {
        match self {
            LocalError::Io(err) => match err.kind() {
                io::ErrorKind::NotFound => ErrorClass::NotFound,
                io::ErrorKind::TimedOut
                | io::ErrorKind::Interrupted
                | io::ErrorKind::ConnectionReset
                | io::ErrorKind::ConnectionAborted
                | io::ErrorKind::UnexpectedEof => ErrorClass::TransientNetwork,
                io::ErrorKind::StorageFull
                | io::ErrorKind::QuotaExceeded
                | io::ErrorKind::PermissionDenied
                | io::ErrorKind::ReadOnlyFilesystem => ErrorClass::FatalStorage,
                _ => ErrorClass::Permanent,
            },
            LocalError::Path(_) | LocalError::Unsupported(_) | LocalError::InvalidUri(_) => {
                ErrorClass::Validation
            }
            LocalError::Http(err) if err.is_builder() => ErrorClass::Permanent,
            LocalError::Http(_) => ErrorClass::TransientNetwork,
            LocalError::Status { status, .. } => match *status {
                404 => ErrorClass::NotFound,
                408 | 429 | 500..=599 => ErrorClass::TransientNetwork,
                _ => ErrorClass::Permanent,
            },
            LocalError::Xml(_) => ErrorClass::Permanent,
            LocalError::NotFound(_) => ErrorClass::NotFound,
        }
    }
}

/// Uniform file access to a sync folder's local root. Paths are folder-relative.
#[async_trait]
pub trait LocalSource: Send + Sync {
    /// Every file and directory below the root.
    async fn list(&self) -> Result<Vec<FileEntry>, LocalError>;

    async fn stat(&self, path: &str) -> Result<Option<FileEntry>, LocalError>;

    async fn read(&self, path: &str) -> Result<ByteStream, LocalError>;

    /// Replaces `path` with the streamed body and stamps it with `modified`.
    /// Returns the number of bytes written.
    async fn write(&self, path: &str, body: ByteStream, modified: i64) -> Result<u64, LocalError>;

    /// Missing files are not an error.
    async fn delete(&self, path: &str) -> Result<(), LocalError>;

    async fn rename(&self, from: &str, to: &str) -> Result<(), LocalError>;
}

enum RootKind {
    Fs(PathBuf),
    WebDav(Url),
    Memory,
}

fn parse_root(uri: &str) -> Result<RootKind, LocalError> {
    let trimmed = uri.trim();
    if trimmed.is_empty() {
        return Err(LocalError::InvalidUri("empty local root".into()));
    }
    if trimmed.starts_with('/') {
        return Ok(RootKind::Fs(PathBuf::from(trimmed)));
    }
    let url = Url::parse(trimmed).map_err(|err| LocalError::InvalidUri(format!("{uri}: {err}")))?;
    match url.scheme() {
        "file" => url
            .to_file_path()
            .map(RootKind::Fs)
            .map_err(|_| LocalError::InvalidUri(uri.to_string())),
        "webdav" | "webdavs" => {
            let http_scheme = if url.scheme() == "webdavs" { "https" } else { "http" };
            let rest = &trimmed[url.scheme().len()..];
            let http = Url::parse(&format!("{http_scheme}{rest}"))
                .map_err(|err| LocalError::InvalidUri(format!("{uri}: {err}")))?;
            Ok(RootKind::WebDav(http))
        }
        "memory" => Ok(RootKind::Memory),
        "content" => Err(LocalError::Unsupported(format!(
            "{uri}: content provider roots cannot be opened by the daemon"
        ))),
        other => Err(LocalError::Unsupported(format!("{uri}: scheme {other}"))),
    }
}

/// Checks that a local root names a source this build can open.
pub fn validate_root(uri: &str) -> Result<(), LocalError> {
    parse_root(uri).map(|_| ())
}

/// The directory behind a plain filesystem root, for watching it.
pub fn filesystem_root(uri: &str) -> Option<PathBuf> {
    match parse_root(uri) {
        Ok(RootKind::Fs(path)) => Some(path),
        _ => None,
    }
}

/// Opens local sources by root URI and caches them for reuse across passes.
pub struct UriSourceResolver {
    http: reqwest::Client,
    sources: Mutex<HashMap<String, Arc<dyn LocalSource>>>,
}

impl UriSourceResolver {
    pub fn new() -> Self {
        Self::with_http(reqwest::Client::new())
    }

    pub fn with_http(http: reqwest::Client) -> Self {
        Self {
            http,
            sources: Mutex::new(HashMap::new()),
        }
    }

    /// Pins a source for a root, replacing whatever the URI would otherwise open.
    pub fn register(&self, uri: &str, source: Arc<dyn LocalSource>) {
        self.lock().insert(uri.to_string(), source);
    }

    pub fn resolve(&self, uri: &str) -> Result<Arc<dyn LocalSource>, LocalError> {
        let mut sources = self.lock();
        if let Some(source) = sources.get(uri) {
            return Ok(source.clone());
        }
        let source: Arc<dyn LocalSource> = match parse_root(uri)? {
            RootKind::Fs(root) => Arc::new(FsSource::new(root)),
            RootKind::WebDav(base) => Arc::new(WebDavSource::new(self.http.clone(), base)),
            RootKind::Memory => Arc::new(MemorySource::new()),
        };
        sources.insert(uri.to_string(), source.clone());
        Ok(source)
    }

    pub fn forget(&self, uri: &str) {
        self.lock().remove(uri);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Arc<dyn LocalSource>>> {
        self.sources
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Default for UriSourceResolver {
    fn default() -> Self {
        Self::new()
    }
}

fn system_time_millis(time: std::time::SystemTime) -> i64 {
    match time.duration_since(std::time::UNIX_EPOCH) {
        Ok(since) => since.as_millis().min(i64::MAX as u128) as i64,
        Err(before) => -(before.duration().as_millis().min(i64::MAX as u128) as i64),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validates_supported_roots() {
        assert!(validate_root("/home/user/Photos").is_ok());
        assert!(validate_root("file:///home/user/Photos").is_ok());
        assert!(validate_root("webdavs://nas.local/dav/photos").is_ok());
        assert!(validate_root("memory://scratch").is_ok());

        let err = validate_root("content://com.android.externalstorage/tree/primary").unwrap_err();
        assert_eq!(err.class(), ErrorClass::Validation);
        assert!(matches!(validate_root("ftp://host/x"), Err(LocalError::Unsupported(_))));
        assert!(matches!(validate_root("  "), Err(LocalError::InvalidUri(_))));

        assert_eq!(
            filesystem_root("file:///home/user/Photos"),
            Some(PathBuf::from("/home/user/Photos"))
        );
        assert_eq!(filesystem_root("memory://scratch"), None);
    }

    #[test]
    fn webdav_roots_map_to_http() {
        let Ok(RootKind::WebDav(url)) = parse_root("webdavs://user:pw@nas.local:8443/dav/") else {
            panic!("expected webdav root");
        };
        assert_eq!(url.scheme(), "https");
        assert_eq!(url.port(), Some(8443));
        assert_eq!(url.username(), "user");
        assert_eq!(url.path(), "/dav/");
    }

    #[test]
    fn resolver_caches_and_honors_registrations() {
        let resolver = UriSourceResolver::new();
        let first = resolver.resolve("memory://a").unwrap();
        let second = resolver.resolve("memory://a").unwrap();
        assert!(Arc::ptr_eq(&first, &second));

        let pinned: Arc<dyn LocalSource> = Arc::new(MemorySource::new());
        resolver.register("memory://b", pinned.clone());
        assert!(Arc::ptr_eq(&resolver.resolve("memory://b").unwrap(), &pinned));
    }

    #[test]
    fn io_errors_are_classified() {
        let missing = LocalError::Io(io::Error::new(io::ErrorKind::NotFound, "gone"));
        assert_eq!(missing.class(), ErrorClass::NotFound);
        for kind in [
            io::ErrorKind::StorageFull,
            io::ErrorKind::PermissionDenied,
            io::ErrorKind::ReadOnlyFilesystem,
        ] {
            let err = LocalError::Io(io::Error::new(kind, "write refused"));
            assert_eq!(err.class(), ErrorClass::FatalStorage, "{kind:?}");
        }
        let status = LocalError::Status {
            status: 503,
            path: "a".into(),
        };
        assert_eq!(status.class(), ErrorClass::TransientNetwork);
    }
}
