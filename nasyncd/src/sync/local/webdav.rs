use std::collections::VecDeque;
use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use futures_util::StreamExt;
use quick_xml::Reader;
use quick_xml::events::Event;
use reqwest::{Client, Method, RequestBuilder, StatusCode};
use url::Url;

use super::{ByteStream, LocalError, LocalSource, system_time_millis};
use crate::sync::model::FileEntry;

const PROPFIND_BODY: &str = r#"<?xml version="1.0" encoding="utf-8"?>
<d:propfind xmlns:d="DAV:">
  <d:prop><d:resourcetype/><d:getcontentlength/><d:getlastmodified/></d:prop>
</d:propfind>"#;

/// A folder exposed over WebDAV (`webdav://` or `webdavs://` roots).
pub struct WebDavSource {
    http: Client,
    base: Url,
    credentials: Option<(String, Option<String>)>,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
struct DavEntry {
    href: String,
    is_dir: bool,
    size: u64,
    modified: i64,
}

impl WebDavSource {
    pub fn new(http: Client, mut base: Url) -> Self {
        let credentials = if base.username().is_empty() {
            None
        } else {
            let user = urlencoding::decode(base.username())
                .map(|user| user.into_owned())
                .unwrap_or_else(|_| base.username().to_string());
            let password = base.password().map(|password| {
                urlencoding::decode(password)
                    .map(|password| password.into_owned())
                    .unwrap_or_else(|_| password.to_string())
            });
            Some((user, password))
        };
        let _ = base.set_username("");
        let _ = base.set_password(None);
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }
        Self {
            http,
            base,
            credentials,
        }
    }

    fn url_for(&self, relative: &str) -> Result<Url, LocalError> {
        let encoded: Vec<String> = relative
            .split('/')
            .filter(|segment| !segment.is_empty())
            .map(|segment| urlencoding::encode(segment).into_owned())
            .collect();
        self.base
            .join(&encoded.join("/"))
            .map_err(|err| LocalError::InvalidUri(format!("{relative}: {err}")))
    }

    fn request(&self, method: Method, url: Url) -> RequestBuilder {
        let builder = self.http.request(method, url);
        match &self.credentials {
            Some((user, password)) => builder.basic_auth(user, password.as_ref()),
            None => builder,
        }
    }

    async fn propfind(&self, relative: &str, depth: &str) -> Result<Option<Vec<DavEntry>>, LocalError> {
        let mut url = self.url_for(relative)?;
        if depth != "0" && !url.path().ends_with('/') {
            let path = format!("{}/", url.path());
            url.set_path(&path);
        }
        let method = Method::from_bytes(b"PROPFIND")
            .map_err(|err| LocalError::Unsupported(err.to_string()))?;
        let response = self
            .request(method, url)
            .header("Depth", depth)
            .header("Content-Type", "application/xml")
            .body(PROPFIND_BODY)
            .send()
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let response = check_status(response, relative)?;
        let text = response.text().await?;
        parse_multistatus(&text).map(Some)
    }

    fn relative_from_href(&self, href: &str) -> Option<String> {
        let path = if href.starts_with("http://") || href.starts_with("https://") {
            Url::parse(href).ok()?.path().to_string()
        } else {
            href.to_string()
        };
        let decoded = urlencoding::decode(&path).ok()?.into_owned();
        let base = urlencoding::decode(self.base.path()).ok()?.into_owned();
        let rest = decoded.strip_prefix(base.trim_end_matches('/'))?;
        Some(rest.trim_matches('/').to_string())
    }
}

#[async_trait]
impl LocalSource for WebDavSource {
    async fn list(&self) -> Result<Vec<FileEntry>, LocalError> {
        let mut out = Vec::new();
        let mut pending = VecDeque::from([String::new()]);
        while let Some(dir) = pending.pop_front() {
            let Some(entries) = self.propfind(&dir, "1").await? else {
                continue;
            };
            for entry in entries {
                let Some(relative) = self.relative_from_href(&entry.href) else {
                    continue;
                };
                if relative.is_empty() || relative == dir {
                    continue;
                }
                if entry.is_dir {
                    pending.push_back(relative.clone());
                }
                out.push(FileEntry {
                    path: relative,
                    size: entry.size,
                    modified: entry.modified,
                    is_dir: entry.is_dir,
                });
            }
        }
        out.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(out)
    }

    async fn stat(&self, path: &str) -> Result<Option<FileEntry>, LocalError> {
        let Some(entries) = self.propfind(path, "0").await? else {
            return Ok(None);
        };
        Ok(entries.into_iter().next().map(|entry| FileEntry {
            path: path.to_string(),
            size: entry.size,
            modified: entry.modified,
            is_dir: entry.is_dir,
        }))
    }

    async fn read(&self, path: &str) -> Result<ByteStream, LocalError> {
        let response = self
            .request(Method::GET, self.url_for(path)?)
            .send()
            .await?;
        let response = check_status(response, path)?;
        Ok(response.bytes_stream().map(|chunk| chunk.map_err(io::Error::other)).boxed())
    }

    async fn write(&self, path: &str, body: ByteStream, modified: i64) -> Result<u64, LocalError> {
        let counter = Arc::new(AtomicU64::new(0));
        let counting = {
            let counter = counter.clone();
            body.map(move |chunk| {
                if let Ok(bytes) = &chunk {
                    counter.fetch_add(bytes.len() as u64, Ordering::Relaxed);
                }
                chunk
            })
        };
        let response = self
            .request(Method::PUT, self.url_for(path)?)
            .header("X-OC-Mtime", modified.div_euclid(1000).to_string())
            .body(reqwest::Body::wrap_stream(counting))
            .send()
            .await?;
        check_status(response, path)?;
        Ok(counter.load(Ordering::Relaxed))
    }

    async fn delete(&self, path: &str) -> Result<(), LocalError> {
        let response = self
            .request(Method::DELETE, self.url_for(path)?)
            .send()
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(());
        }
        check_status(response, path)?;
        Ok(())
    }

    async fn rename(&self, from: &str, to: &str) -> Result<(), LocalError> {
        let method = Method::from_bytes(b"MOVE")
            .map_err(|err| LocalError::Unsupported(err.to_string()))?;
        let destination = self.url_for(to)?;
        let response = self
            .request(method, self.url_for(from)?)
            .header("Destination", destination.as_str())
            .header("Overwrite", "T")
            .send()
            .await?;
        check_status(response, from)?;
        Ok(())
    }
}

fn check_status(response: reqwest::Response, path: &str) -> Result<reqwest::Response, LocalError> {
    if response.status().is_success() {
        return Ok(response);
    }
    Err(LocalError::Status {
        status: response.status().as_u16(),
        path: path.to_string(),
    })
}

fn parse_multistatus(xml: &str) -> Result<Vec<DavEntry>, LocalError> {
    let mut reader = Reader::from_str(xml);
    reader.trim_text(true);

    let mut entries = Vec::new();
    let mut current: Option<DavEntry> = None;
    let mut stack: Vec<String> = Vec::new();

    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) => {
                let name = String::from_utf8_lossy(e.local_name().as_ref()).to_string();
                match name.as_str() {
                    "response" => current = Some(DavEntry::default()),
                    "collection" => {
                        if let Some(entry) = current.as_mut() {
                            entry.is_dir = true;
                        }
                    }
                    _ => {}
                }
                stack.push(name);
            }
            Ok(Event::Empty(e)) => {
                if e.local_name().as_ref() == b"collection"
                    && let Some(entry) = current.as_mut()
                {
                    entry.is_dir = true;
                }
            }
            Ok(Event::Text(e)) => {
                let text = e
                    .unescape()
                    .map_err(|err| LocalError::Xml(err.to_string()))?
                    .to_string();
                if let (Some(entry), Some(element)) = (current.as_mut(), stack.last()) {
                    match element.as_str() {
                        "href" => entry.href = text,
                        "getcontentlength" => entry.size = text.trim().parse().unwrap_or(0),
                        "getlastmodified" => {
                            entry.modified = httpdate::parse_http_date(text.trim())
                                .map(system_time_millis)
                                .unwrap_or(0);
                        }
                        _ => {}
                    }
                }
            }
            Ok(Event::End(e)) => {
                if e.local_name().as_ref() == b"response"
                    && let Some(entry) = current.take()
                {
                    entries.push(entry);
                }
                stack.pop();
            }
            Ok(Event::Eof) => break,
            Err(err) => return Err(LocalError::Xml(err.to_string())),
            _ => {}
        }
    }
    Ok(entries)
}
