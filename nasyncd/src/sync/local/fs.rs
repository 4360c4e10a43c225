use std::io;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use filetime::FileTime;
use futures_util::StreamExt;
use tokio::io::AsyncWriteExt;
use tokio_util::io::ReaderStream;

use super::{ByteStream, LocalError, LocalSource, system_time_millis};
use crate::sync::model::FileEntry;
use crate::sync::paths::local_path_for;

/// Suffix of the temporary file a download writes before renaming it into place.
pub const PARTIAL_SUFFIX: &str = "nasync-partial";

/// A plain directory on the device's filesystem.
pub struct FsSource {
    root: PathBuf,
}

impl FsSource {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

#[async_trait]
impl LocalSource for FsSource {
    async fn list(&self) -> Result<Vec<FileEntry>, LocalError> {
        let mut out = Vec::new();
        let mut pending = vec![(self.root.clone(), String::new())];
        while let Some((dir, prefix)) = pending.pop() {
            let mut entries = match tokio::fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(err) if err.kind() == io::ErrorKind::NotFound && prefix.is_empty() => {
                    return Ok(out);
                }
                Err(err) => return Err(err.into()),
            };
            while let Some(entry) = entries.next_entry().await? {
                let name = entry.file_name().to_string_lossy().into_owned();
                if name.ends_with(PARTIAL_SUFFIX) {
                    continue;
                }
                let relative = if prefix.is_empty() {
                    name
                } else {
                    format!("{prefix}/{name}")
                };
                let metadata = entry.metadata().await?;
                let modified = metadata.modified().map(system_time_millis).unwrap_or(0);
                if metadata.is_dir() {
                    pending.push((entry.path(), relative.clone()));
                    out.push(FileEntry {
                        path: relative,
                        size: 0,
                        modified,
                        is_dir: true,
                    });
                } else if metadata.is_file() {
                    out.push(FileEntry::file(relative, metadata.len(), modified));
                }
            }
        }
        out.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(out)
    }

    async fn stat(&self, path: &str) -> Result<Option<FileEntry>, LocalError> {
        let target = local_path_for(&self.root, path)?;
        let metadata = match tokio::fs::metadata(&target).await {
            Ok(metadata) => metadata,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        let modified = metadata.modified().map(system_time_millis).unwrap_or(0);
        Ok(Some(FileEntry {
            path: path.to_string(),
            size: if metadata.is_dir() { 0 } else { metadata.len() },
            modified,
            is_dir: metadata.is_dir(),
        }))
    }

    async fn read(&self, path: &str) -> Result<ByteStream, LocalError> {
        let source = local_path_for(&self.root, path)?;
        let file = tokio::fs::File::open(&source).await?;
        Ok(ReaderStream::new(file).boxed())
    }

    async fn write(
        &self,
        path: &str,
        mut body: ByteStream,
        modified: i64,
    ) -> Result<u64, LocalError> {
        let target = local_path_for(&self.root, path)?;
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let partial = partial_path(&target);
        let mut file = tokio::fs::File::create(&partial).await?;
        let mut written = 0u64;
        let copied: Result<(), io::Error> = async {
            while let Some(chunk) = body.next().await {
                let chunk = chunk?;
                file.write_all(&chunk).await?;
                written += chunk.len() as u64;
            }
            file.flush().await?;
            file.sync_all().await
        }
        .await;
        drop(file);
        if let Err(err) = copied {
            let _ = tokio::fs::remove_file(&partial).await;
            return Err(err.into());
        }

        tokio::fs::rename(&partial, &target).await?;
        let mtime = FileTime::from_unix_time(
            modified.div_euclid(1000),
            (modified.rem_euclid(1000) * 1_000_000) as u32,
        );
        let stamped = target.clone();
        tokio::task::spawn_blocking(move || filetime::set_file_mtime(stamped, mtime))
            .await
            .map_err(io::Error::other)??;
        Ok(written)
    }

    async fn delete(&self, path: &str) -> Result<(), LocalError> {
        let target = local_path_for(&self.root, path)?;
        match tokio::fs::remove_file(&target).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    async fn rename(&self, from: &str, to: &str) -> Result<(), LocalError> {
        let source = local_path_for(&self.root, from)?;
        let target = local_path_for(&self.root, to)?;
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::rename(source, target).await?;
        Ok(())
    }
}

fn partial_path(target: &Path) -> PathBuf {
    target.with_extension(format!(
        "{}{PARTIAL_SUFFIX}",
        target
            .extension()
            .map(|ext| format!("{}.", ext.to_string_lossy()))
            .unwrap_or_default()
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use futures_util::stream;
    use tempfile::tempdir;

    fn body(data: &'static [u8]) -> ByteStream {
        stream::iter(vec![Ok(Bytes::from_static(data))]).boxed()
    }

    async fn collect(mut stream: ByteStream) -> Vec<u8> {
        let mut out = Vec::new();
        while let Some(chunk) = stream.next().await {
            out.extend_from_slice(&chunk.unwrap());
        }
        out
    }

    #[tokio::test]
    async fn write_stamps_modified_time_and_lists_relative_paths() {
        let dir = tempdir().unwrap();
        let source = FsSource::new(dir.path().to_path_buf());

        let written = source
            .write("Docs/A.txt", body(b"hello"), 1_700_000_000_123)
            .await
            .unwrap();
        assert_eq!(written, 5);

        let listed = source.list().await.unwrap();
        let files: Vec<&FileEntry> = listed.iter().filter(|e| !e.is_dir).collect();
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].path, "Docs/A.txt");
        assert_eq!(files[0].size, 5);
        assert_eq!(files[0].modified, 1_700_000_000_123);
        assert!(listed.iter().any(|e| e.is_dir && e.path == "Docs"));

        assert_eq!(collect(source.read("Docs/A.txt").await.unwrap()).await, b"hello");
    }

    #[tokio::test]
    async fn failed_write_leaves_no_partial_file() {
        let dir = tempdir().unwrap();
        let source = FsSource::new(dir.path().to_path_buf());
        let broken: ByteStream = stream::iter(vec![
            Ok(Bytes::from_static(b"half")),
            Err(io::Error::new(io::ErrorKind::ConnectionReset, "dropped")),
        ])
        .boxed();

        assert!(source.write("a.bin", broken, 0).await.is_err());
        assert!(source.list().await.unwrap().is_empty());
        assert!(source.stat("a.bin").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn delete_and_rename() {
        let dir = tempdir().unwrap();
        let source = FsSource::new(dir.path().to_path_buf());
        source.write("a.txt", body(b"x"), 1_000).await.unwrap();

        source.rename("a.txt", "sub/b.txt").await.unwrap();
        assert!(source.stat("a.txt").await.unwrap().is_none());
        assert!(source.stat("sub/b.txt").await.unwrap().is_some());

        source.delete("sub/b.txt").await.unwrap();
        source.delete("sub/b.txt").await.unwrap();
        assert!(source.stat("sub/b.txt").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn missing_root_lists_empty() {
        let dir = tempdir().unwrap();
        let source = FsSource::new(dir.path().join("not-yet"));
        assert!(source.list().await.unwrap().is_empty());
    }

    #[test]
    fn partial_path_keeps_extension() {
        assert_eq!(
            partial_path(Path::new("/tmp/a.txt")),
            PathBuf::from("/tmp/a.txt.nasync-partial")
        );
        assert_eq!(
            partial_path(Path::new("/tmp/noext")),
            PathBuf::from("/tmp/noext.nasync-partial")
        );
    }
}
