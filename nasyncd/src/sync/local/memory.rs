use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures_util::{StreamExt, stream};

use super::{ByteStream, LocalError, LocalSource};
use crate::sync::model::FileEntry;

#[derive(Debug, Clone)]
struct StoredFile {
    data: Bytes,
    modified: i64,
}

/// Volatile source for `memory://` roots. Clones share the same files.
#[derive(Clone, Default)]
pub struct MemorySource {
    files: Arc<Mutex<BTreeMap<String, StoredFile>>>,
}

impl MemorySource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&self, path: &str, data: impl Into<Bytes>, modified: i64) {
        self.lock().insert(
            path.to_string(),
            StoredFile {
                data: data.into(),
                modified,
            },
        );
    }

    pub fn get(&self, path: &str) -> Option<Bytes> {
        self.lock().get(path).map(|file| file.data.clone())
    }

    pub fn modified(&self, path: &str) -> Option<i64> {
        self.lock().get(path).map(|file| file.modified)
    }

    pub fn remove(&self, path: &str) {
        self.lock().remove(path);
    }

    pub fn paths(&self) -> Vec<String> {
        self.lock().keys().cloned().collect()
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<String, StoredFile>> {
        self.files
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl LocalSource for MemorySource {
    async fn list(&self) -> Result<Vec<FileEntry>, LocalError> {
        Ok(self
            .lock()
            .iter()
            .map(|(path, file)| FileEntry::file(path.clone(), file.data.len() as u64, file.modified))
            .collect())
    }

    async fn stat(&self, path: &str) -> Result<Option<FileEntry>, LocalError> {
        Ok(self
            .lock()
            .get(path)
            .map(|file| FileEntry::file(path, file.data.len() as u64, file.modified)))
    }

    async fn read(&self, path: &str) -> Result<ByteStream, LocalError> {
        let data = self
            .get(path)
            .ok_or_else(|| LocalError::NotFound(path.to_string()))?;
        Ok(stream::iter(vec![Ok(data)]).boxed())
    }

    async fn write(
        &self,
        path: &str,
        mut body: ByteStream,
        modified: i64,
    ) -> Result<u64, LocalError> {
        let mut buffer = BytesMut::new();
        while let Some(chunk) = body.next().await {
            buffer.extend_from_slice(&chunk?);
        }
        let written = buffer.len() as u64;
        self.put(path, buffer.freeze(), modified);
        Ok(written)
    }

    async fn delete(&self, path: &str) -> Result<(), LocalError> {
        self.remove(path);
        Ok(())
    }

    async fn rename(&self, from: &str, to: &str) -> Result<(), LocalError> {
        let mut files = self.lock();
        let file = files
            .remove(from)
            .ok_or_else(|| LocalError::NotFound(from.to_string()))?;
        files.insert(to.to_string(), file);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn clones_share_files() {
        let source = MemorySource::new();
        let handle = source.clone();
        source
            .write(
                "a.txt",
                stream::iter(vec![Ok(Bytes::from_static(b"ab")), Ok(Bytes::from_static(b"c"))])
                    .boxed(),
                42,
            )
            .await
            .unwrap();

        assert_eq!(handle.get("a.txt").unwrap(), Bytes::from_static(b"abc"));
        assert_eq!(handle.stat("a.txt").await.unwrap().unwrap().modified, 42);

        handle.rename("a.txt", "b.txt").await.unwrap();
        assert_eq!(source.paths(), vec!["b.txt".to_string()]);
        assert!(matches!(
            source.read("a.txt").await,
            Err(LocalError::NotFound(_))
        ));
    }
}
