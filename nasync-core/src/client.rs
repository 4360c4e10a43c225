use std::time::SystemTime;

use bytes::Bytes;
use futures_util::{Stream, StreamExt};
use reqwest::header::{HeaderMap, RETRY_AFTER};
use reqwest::{Body, Client, StatusCode};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

const DEFAULT_PAGE_SIZE: u32 = 500;

#[derive(Debug, Error)]
pub enum NasError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("invalid url: {0}")]
    Url(#[from] url::ParseError),
    #[error("api returned {status}: {body}")]
    Api {
        status: StatusCode,
        body: String,
        retry_after: Option<u64>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApiErrorClass {
    Auth,
    NotFound,
    Conflict,
    RateLimit,
    Transient,
    Permanent,
}

#[derive(Clone)]
pub struct NasClient {
    http: Client,
    base_url: Url,
    token: String,
}

impl NasClient {
    pub fn new(base_url: &str, token: impl Into<String>) -> Result<Self, NasError> {
        Self::with_http(Client::new(), base_url, token)
    }

    pub fn with_http(
        http: Client,
        base_url: &str,
        token: impl Into<String>,
    ) -> Result<Self, NasError> {
        Ok(Self {
            http,
            base_url: Url::parse(base_url)?,
            token: token.into(),
        })
    }

    /// Cheap authenticated round trip used as a connectivity probe.
    pub async fn ping(&self) -> Result<(), NasError> {
        let url = self.endpoint("/api/v1/ping")?;
        let response = self
            .http
            .get(url)
            .header("Authorization", self.auth_header_value())
            .send()
            .await?;
        Self::expect_success(response).await?;
        Ok(())
    }

    pub async fn list_page(
        &self,
        path: &str,
        recursive: bool,
        limit: u32,
        offset: u32,
    ) -> Result<EntryList, NasError> {
        let mut url = self.endpoint("/api/v1/files/list")?;
        url.query_pairs_mut()
            .append_pair("path", path)
            .append_pair("recursive", if recursive { "true" } else { "false" })
            .append_pair("limit", &limit.to_string())
            .append_pair("offset", &offset.to_string());
        let response = self
            .http
            .get(url)
            .header("Authorization", self.auth_header_value())
            .send()
            .await?;
        Self::handle_response(response).await
    }

    /// Lists every entry below `path`, following pagination until `total` is reached.
    pub async fn list_all(&self, path: &str, recursive: bool) -> Result<Vec<RemoteEntry>, NasError> {
        let mut offset = 0u32;
        let mut items = Vec::new();
        loop {
            let page = self
                .list_page(path, recursive, DEFAULT_PAGE_SIZE, offset)
                .await?;
            let received = page.items.len() as u32;
            offset = offset.saturating_add(received);
            let total = page.total;
            items.extend(page.items);
            if offset >= total || received == 0 {
                break;
            }
        }
        Ok(items)
    }

    pub async fn download(
        &self,
        path: &str,
    ) -> Result<impl Stream<Item = Result<Bytes, NasError>> + Send + 'static, NasError> {
        let mut url = self.endpoint("/api/v1/files/content")?;
        url.query_pairs_mut().append_pair("path", path);
        let response = self
            .http
            .get(url)
            .header("Authorization", self.auth_header_value())
            .send()
            .await?;
        let response = Self::expect_success(response).await?;
        Ok(response
            .bytes_stream()
            .map(|chunk| chunk.map_err(NasError::from)))
    }

    /// Uploads `body` to `path`, overwriting. `modified` is an RFC 3339 timestamp the
    /// server stores as the file's modification time.
    pub async fn upload(
        &self,
        path: &str,
        body: impl Into<Body>,
        modified: Option<&str>,
    ) -> Result<(), NasError> {
        let mut url = self.endpoint("/api/v1/files/content")?;
        {
            let mut query = url.query_pairs_mut();
            query.append_pair("path", path).append_pair("overwrite", "true");
            if let Some(modified) = modified {
                query.append_pair("modified", modified);
            }
        }
        let response = self
            .http
            .put(url)
            .header("Authorization", self.auth_header_value())
            .body(body)
            .send()
            .await?;
        Self::expect_success(response).await?;
        Ok(())
    }

    pub async fn delete(&self, path: &str) -> Result<(), NasError> {
        let mut url = self.endpoint("/api/v1/files")?;
        url.query_pairs_mut().append_pair("path", path);
        let response = self
            .http
            .delete(url)
            .header("Authorization", self.auth_header_value())
            .send()
            .await?;
        Self::expect_success(response).await?;
        Ok(())
    }

    pub async fn move_resource(&self, from: &str, path: &str, overwrite: bool) -> Result<(), NasError> {
        let mut url = self.endpoint("/api/v1/files/move")?;
        url.query_pairs_mut()
            .append_pair("from", from)
            .append_pair("path", path)
            .append_pair("overwrite", if overwrite { "true" } else { "false" });
        let response = self
            .http
            .post(url)
            .header("Authorization", self.auth_header_value())
            .send()
            .await?;
        Self::expect_success(response).await?;
        Ok(())
    }

    fn auth_header_value(&self) -> String {
        format!("Bearer {}", self.token)
    }

    fn endpoint(&self, path: &str) -> Result<Url, NasError> {
        Ok(self.base_url.join(path)?)
    }

    async fn handle_response<T: serde::de::DeserializeOwned>(
        response: reqwest::Response,
    ) -> Result<T, NasError> {
        let response = Self::expect_success(response).await?;
        Ok(response.json::<T>().await?)
    }

    async fn expect_success(response: reqwest::Response) -> Result<reqwest::Response, NasError> {
        if response.status().is_success() {
            return Ok(response);
        }
        let status = response.status();
        let retry_after = retry_after_secs(response.headers(), SystemTime::now());
        let body = response.text().await.unwrap_or_default();
        Err(NasError::Api {
            status,
            body,
            retry_after,
        })
    }
}

impl NasError {
    pub fn classification(&self) -> ApiErrorClass {
        match self {
            NasError::Api { status, .. } => classify_api_status(*status),
            NasError::Request(err) if err.is_builder() => ApiErrorClass::Permanent,
            NasError::Request(_) => ApiErrorClass::Transient,
            NasError::Url(_) => ApiErrorClass::Permanent,
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(
            self.classification(),
            ApiErrorClass::RateLimit | ApiErrorClass::Transient
        )
    }

    pub fn retry_after_secs(&self) -> Option<u64> {
        match self {
            NasError::Api { retry_after, .. } => *retry_after,
            _ => None,
        }
    }
}

fn classify_api_status(status: StatusCode) -> ApiErrorClass {
    if matches!(status, StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN) {
        ApiErrorClass::Auth
    } else if status == StatusCode::NOT_FOUND {
        ApiErrorClass::NotFound
    } else if matches!(
        status,
        StatusCode::CONFLICT | StatusCode::PRECONDITION_FAILED
    ) {
        ApiErrorClass::Conflict
    } else if status == StatusCode::TOO_MANY_REQUESTS {
        ApiErrorClass::RateLimit
    } else if status.is_server_error()
        || matches!(status, StatusCode::REQUEST_TIMEOUT | StatusCode::TOO_EARLY)
    {
        ApiErrorClass::Transient
    } else {
        ApiErrorClass::Permanent
    }
}

fn retry_after_secs(headers: &HeaderMap, now: SystemTime) -> Option<u64> {
    let value = headers.get(RETRY_AFTER)?.to_str().ok()?.trim();
    if let Ok(seconds) = value.parse::<u64>() {
        return Some(seconds);
    }
    let at = httpdate::parse_http_date(value).ok()?;
    Some(at.duration_since(now).map(|d| d.as_secs()).unwrap_or(0))
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct RemoteEntry {
    pub path: String,
    pub name: String,
    #[serde(rename = "type")]
    pub entry_type: EntryType,
    #[serde(default)]
    pub size: Option<u64>,
    #[serde(default)]
    pub modified: Option<String>,
}

#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum EntryType {
    File,
    Dir,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct EntryList {
    pub items: Vec<RemoteEntry>,
    pub limit: u32,
    pub offset: u32,
    pub total: u32,
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::HeaderValue;
    use std::time::Duration;

    #[test]
    fn classifies_statuses() {
        assert_eq!(
            classify_api_status(StatusCode::UNAUTHORIZED),
            ApiErrorClass::Auth
        );
        assert_eq!(
            classify_api_status(StatusCode::PRECONDITION_FAILED),
            ApiErrorClass::Conflict
        );
        assert_eq!(
            classify_api_status(StatusCode::BAD_GATEWAY),
            ApiErrorClass::Transient
        );
        assert_eq!(
            classify_api_status(StatusCode::PAYLOAD_TOO_LARGE),
            ApiErrorClass::Permanent
        );
    }

    #[test]
    fn parses_retry_after_seconds_and_dates() {
        let now = SystemTime::UNIX_EPOCH + Duration::from_secs(1_700_000_000);
        let mut headers = HeaderMap::new();
        headers.insert(RETRY_AFTER, HeaderValue::from_static("7"));
        assert_eq!(retry_after_secs(&headers, now), Some(7));

        let later = httpdate::fmt_http_date(now + Duration::from_secs(30));
        headers.insert(RETRY_AFTER, HeaderValue::from_str(&later).unwrap());
        assert_eq!(retry_after_secs(&headers, now), Some(30));
    }
}
