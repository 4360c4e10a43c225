use std::io;

use async_trait::async_trait;
use futures_util::{StreamExt, TryStreamExt};
use nasync_core::{ApiErrorClass, EntryType, NasClient, NasError};
use thiserror::Error;
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;

use super::error::ErrorClass;
use super::local::ByteStream;
use super::model::FileEntry;
use super::paths::strip_remote_root;

#[derive(Debug, Error)]
pub enum RemoteError {
    #[error("api error: {0}")]
    Api(#[from] NasError),
    #[error("invalid timestamp {value}: {reason}")]
    Timestamp { value: String, reason: String },
    #[error("remote path {0} is outside the folder root")]
    OutsideRoot(String),
}

impl RemoteError {
    pub fn class(&self) -> ErrorClass {
        match self {
            RemoteError::Api(err) => match err.classification() {
                ApiErrorClass::NotFound => ErrorClass::NotFound,
                ApiErrorClass::Conflict => ErrorClass::RemoteConflict,
                ApiErrorClass::RateLimit | ApiErrorClass::Transient => {
                    ErrorClass::TransientNetwork
                }
                ApiErrorClass::Auth | ApiErrorClass::Permanent => ErrorClass::Permanent,
            },
            RemoteError::Timestamp { .. } | RemoteError::OutsideRoot(_) => ErrorClass::Permanent,
        }
    }

    pub fn retry_after_secs(&self) -> Option<u64> {
        match self {
            RemoteError::Api(err) => err.retry_after_secs(),
            _ => None,
        }
    }
}

/// The remote file tree. Paths passed in are absolute remote paths; `list` returns
/// entries relative to the listed root.
#[async_trait]
pub trait RemoteFs: Send + Sync {
    async fn list(&self, root: &str) -> Result<Vec<FileEntry>, RemoteError>;

    /// Stores the body at `path`, stamping it with `modified` (unix ms).
    async fn upload(
        &self,
        path: &str,
        body: ByteStream,
        size: u64,
        modified: i64,
    ) -> Result<(), RemoteError>;

    async fn download(&self, path: &str) -> Result<ByteStream, RemoteError>;

    async fn delete(&self, path: &str) -> Result<(), RemoteError>;

    async fn move_to(&self, from: &str, to: &str) -> Result<(), RemoteError>;

    /// Cheap connectivity check.
    async fn probe(&self) -> Result<(), RemoteError>;
}

/// [`RemoteFs`] over the NAS REST API.
#[derive(Clone)]
pub struct NasRemote {
    client: NasClient,
}

impl NasRemote {
    pub fn new(client: NasClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl RemoteFs for NasRemote {
    async fn list(&self, root: &str) -> Result<Vec<FileEntry>, RemoteError> {
        let items = match self.client.list_all(root, true).await {
            Ok(items) => items,
            Err(err) if err.classification() == ApiErrorClass::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err.into()),
        };
        let mut out = Vec::with_capacity(items.len());
        for item in items {
            let Some(relative) = strip_remote_root(root, &item.path) else {
                continue;
            };
            out.push(FileEntry {
                path: relative,
                size: item.size.unwrap_or(0),
                modified: parse_modified(item.modified.as_deref())?,
                is_dir: item.entry_type == EntryType::Dir,
            });
        }
        Ok(out)
    }

    async fn upload(
        &self,
        path: &str,
        body: ByteStream,
        _size: u64,
        modified: i64,
    ) -> Result<(), RemoteError> {
        let modified = format_modified(modified)?;
        self.client
            .upload(path, reqwest::Body::wrap_stream(body), Some(&modified))
            .await?;
        Ok(())
    }

    async fn download(&self, path: &str) -> Result<ByteStream, RemoteError> {
        let stream = self.client.download(path).await?;
        Ok(stream.map_err(io::Error::other).boxed())
    }

    async fn delete(&self, path: &str) -> Result<(), RemoteError> {
        match self.client.delete(path).await {
            Ok(()) => Ok(()),
            Err(err) if err.classification() == ApiErrorClass::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    async fn move_to(&self, from: &str, to: &str) -> Result<(), RemoteError> {
        self.client.move_resource(from, to, true).await?;
        Ok(())
    }

    async fn probe(&self) -> Result<(), RemoteError> {
        self.client.ping().await?;
        Ok(())
    }
}

pub(crate) fn parse_modified(value: Option<&str>) -> Result<i64, RemoteError> {
    let Some(value) = value else {
        return Ok(0);
    };
    let parsed = OffsetDateTime::parse(value, &Rfc3339).map_err(|err| RemoteError::Timestamp {
        value: value.to_string(),
        reason: err.to_string(),
    })?;
    Ok((parsed.unix_timestamp_nanos() / 1_000_000) as i64)
}

pub(crate) fn format_modified(millis: i64) -> Result<String, RemoteError> {
    let stamp = OffsetDateTime::from_unix_timestamp_nanos(i128::from(millis) * 1_000_000)
        .map_err(|err| RemoteError::Timestamp {
            value: millis.to_string(),
            reason: err.to_string(),
        })?;
    stamp.format(&Rfc3339).map_err(|err| RemoteError::Timestamp {
        value: millis.to_string(),
        reason: err.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use futures_util::stream;
    use serde_json::json;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn remote_for(server: &MockServer) -> NasRemote {
        NasRemote::new(NasClient::new(&server.uri(), "token").unwrap())
    }

    #[test]
    fn timestamps_round_trip_with_millisecond_precision() {
        let formatted = format_modified(1_700_000_000_123).unwrap();
        assert_eq!(formatted, "2023-11-14T22:13:20.123Z");
        assert_eq!(parse_modified(Some(&formatted)).unwrap(), 1_700_000_000_123);
        assert_eq!(parse_modified(Some("2023-11-14T23:13:20+01:00")).unwrap(), 1_700_000_000_000);
        assert!(parse_modified(Some("yesterday")).is_err());
    }

    #[tokio::test]
    async fn list_returns_entries_relative_to_root() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v1/files/list"))
            .and(query_param("path", "/Photos"))
            .and(query_param("recursive", "true"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "items": [
                    {"path": "/Photos/2024", "name": "2024", "type": "dir"},
                    {"path": "/Photos/2024/a.jpg", "name": "a.jpg", "type": "file",
                     "size": 10, "modified": "2023-11-14T22:13:20Z"}
                ],
                "limit": 500, "offset": 0, "total": 2
            })))
            .mount(&server)
            .await;

        let entries = remote_for(&server).await.list("/Photos").await.unwrap();
        assert_eq!(
            entries,
            vec![
                FileEntry {
                    path: "2024".into(),
                    size: 0,
                    modified: 0,
                    is_dir: true
                },
                FileEntry::file("2024/a.jpg", 10, 1_700_000_000_000),
            ]
        );
    }

    #[tokio::test]
    async fn missing_root_lists_empty_and_missing_delete_succeeds() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v1/files/list"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;
        Mock::given(method("DELETE"))
            .and(path("/api/v1/files"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let remote = remote_for(&server).await;
        assert!(remote.list("/New").await.unwrap().is_empty());
        remote.delete("/New/a.txt").await.unwrap();
    }

    #[tokio::test]
    async fn upload_sends_modified_time() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .and(path("/api/v1/files/content"))
            .and(query_param("path", "/Docs/a.txt"))
            .and(query_param("modified", "2023-11-14T22:13:20Z"))
            .respond_with(ResponseTemplate::new(201))
            .expect(1)
            .mount(&server)
            .await;

        let body: ByteStream = stream::iter(vec![Ok(Bytes::from_static(b"abc"))]).boxed();
        remote_for(&server)
            .await
            .upload("/Docs/a.txt", body, 3, 1_700_000_000_000)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn conflict_status_is_classified() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/v1/files/move"))
            .respond_with(ResponseTemplate::new(412))
            .mount(&server)
            .await;

        let err = remote_for(&server)
            .await
            .move_to("/a.txt", "/b.txt")
            .await
            .unwrap_err();
        assert_eq!(err.class(), ErrorClass::RemoteConflict);
    }
}
