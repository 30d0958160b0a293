//! I/O managers for different storage backends

use crate::error::{IngestError, Result};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

/// Storage backend types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageBackend {
    /// Local file system
    FileSystem,
    /// Process-local memory
    Memory,
    /// AWS S3
    S3,
    /// Azure Blob Storage
    Azure,
    /// Google Cloud Storage
    GCS,
}

impl StorageBackend {
    /// Parse storage backend from URL scheme
    pub fn from_url(url: &str) -> Result<Self> {
        if let Some(scheme_end) = url.find("://") {
            let scheme = &url[..scheme_end];
            match scheme {
                "file" => Ok(StorageBackend::FileSystem),
                "memory" => Ok(StorageBackend::Memory),
                "s3" => Ok(StorageBackend::S3),
                "azure" | "az" | "abfs" => Ok(StorageBackend::Azure),
                "gs" | "gcs" => Ok(StorageBackend::GCS),
                _ => Err(IngestError::InvalidUrl(format!("Unknown scheme: {}", scheme))),
            }
        } else {
            // Assume file system if no scheme
            Ok(StorageBackend::FileSystem)
        }
    }
}

/// Key/value blob storage used by the array store.
///
/// Implementations must make `write` atomic per key: a concurrent reader sees
/// either the previous value or the complete new one, never a prefix.
#[async_trait]
pub trait IOManager: Send + Sync {
    /// Read data from a path
    async fn read(&self, path: &str) -> Result<Bytes>;

    /// Write data to a path, replacing any previous value
    async fn write(&self, path: &str, data: &[u8]) -> Result<()>;

    /// Check if a path exists
    async fn exists(&self, path: &str) -> Result<bool>;

    /// Delete data at a path
    async fn delete(&self, path: &str) -> Result<()>;

    /// List items with a given prefix
    async fn list(&self, prefix: &str) -> Result<Vec<String>>;

    /// Get the size of data at a path
    async fn size(&self, path: &str) -> Result<usize>;

    /// Get the backend type
    fn backend(&self) -> StorageBackend;
}

fn write_error(path: &str, err: std::io::Error) -> IngestError {
    use std::io::ErrorKind;
    let transient = matches!(
        err.kind(),
        ErrorKind::Interrupted | ErrorKind::TimedOut | ErrorKind::WouldBlock
    );
    IngestError::StoreWrite {
        key: path.to_string(),
        reason: err.to_string(),
        transient,
    }
}

fn read_error(path: &str, err: std::io::Error) -> IngestError {
    if err.kind() == std::io::ErrorKind::NotFound {
        IngestError::NotFound(path.to_string())
    } else {
        IngestError::Io(err)
    }
}

/// File system I/O manager
pub struct FileSystemIOManager {
    base_path: PathBuf,
}

impl FileSystemIOManager {
    /// Create a new file system I/O manager
    pub fn new(base_path: impl AsRef<Path>) -> Self {
        Self {
            base_path: base_path.as_ref().to_path_buf(),
        }
    }

    /// Get the full path for a relative path
    fn full_path(&self, path: &str) -> PathBuf {
        self.base_path.join(path)
    }
}

#[async_trait]
impl IOManager for FileSystemIOManager {
    async fn read(&self, path: &str) -> Result<Bytes> {
        let full_path = self.full_path(path);
        let data = fs::read(&full_path)
            .await
            .map_err(|e| read_error(path, e))?;
        Ok(Bytes::from(data))
    }

    async fn write(&self, path: &str, data: &[u8]) -> Result<()> {
        let full_path = self.full_path(path);

        if let Some(parent) = full_path.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| write_error(path, e))?;
        }

        // Write a sibling temp file and rename it into place
        let file_name = full_path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| IngestError::InvalidUrl(format!("Invalid store key: {}", path)))?;
        let tmp_path = full_path.with_file_name(format!(".{}.{}.tmp", file_name, Uuid::new_v4()));

        let result = async {
            let mut file = fs::File::create(&tmp_path).await?;
            file.write_all(data).await?;
            file.sync_all().await?;
            drop(file);
            fs::rename(&tmp_path, &full_path).await
        }
        .await;

        if let Err(e) = result {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(write_error(path, e));
        }
        Ok(())
    }

    async fn exists(&self, path: &str) -> Result<bool> {
        let full_path = self.full_path(path);
        Ok(fs::try_exists(&full_path).await?)
    }

    async fn delete(&self, path: &str) -> Result<()> {
        let full_path = self.full_path(path);
        fs::remove_file(&full_path)
            .await
            .map_err(|e| read_error(path, e))?;
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let full_path = self.full_path(prefix);
        let mut entries = Vec::new();

        if full_path.is_dir() {
            let mut read_dir = fs::read_dir(&full_path).await?;

            while let Some(entry) = read_dir.next_entry().await? {
                if let Some(name) = entry.file_name().to_str() {
                    if !name.ends_with(".tmp") {
                        entries.push(name.to_string());
                    }
                }
            }
        }

        entries.sort();
        Ok(entries)
    }

    async fn size(&self, path: &str) -> Result<usize> {
        let full_path = self.full_path(path);
        let metadata = fs::metadata(&full_path)
            .await
            .map_err(|e| read_error(path, e))?;
        Ok(metadata.len() as usize)
    }

    fn backend(&self) -> StorageBackend {
        StorageBackend::FileSystem
    }
}

/// In-memory I/O manager, mostly for tests and dry runs
#[derive(Default)]
pub struct MemoryIOManager {
    objects: RwLock<BTreeMap<String, Bytes>>,
}

impl MemoryIOManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of every stored key and value
    pub fn snapshot(&self) -> BTreeMap<String, Bytes> {
        self.objects.read().clone()
    }
}

#[async_trait]
impl IOManager for MemoryIOManager {
    async fn read(&self, path: &str) -> Result<Bytes> {
        self.objects
            .read()
            .get(path)
            .cloned()
            .ok_or_else(|| IngestError::NotFound(path.to_string()))
    }

    async fn write(&self, path: &str, data: &[u8]) -> Result<()> {
        self.objects
            .write()
            .insert(path.to_string(), Bytes::copy_from_slice(data));
        Ok(())
    }

    async fn exists(&self, path: &str) -> Result<bool> {
        Ok(self.objects.read().contains_key(path))
    }

    async fn delete(&self, path: &str) -> Result<()> {
        self.objects
            .write()
            .remove(path)
            .map(|_| ())
            .ok_or_else(|| IngestError::NotFound(path.to_string()))
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let dir = if prefix.is_empty() || prefix.ends_with('/') {
            prefix.to_string()
        } else {
            format!("{}/", prefix)
        };
        let objects = self.objects.read();
        let mut names: Vec<String> = objects
            .keys()
            .filter_map(|k| k.strip_prefix(dir.as_str()))
            .map(|rest| rest.split('/').next().unwrap_or(rest).to_string())
            .collect();
        names.sort();
        names.dedup();
        Ok(names)
    }

    async fn size(&self, path: &str) -> Result<usize> {
        self.objects
            .read()
            .get(path)
            .map(|b| b.len())
            .ok_or_else(|| IngestError::NotFound(path.to_string()))
    }

    fn backend(&self) -> StorageBackend {
        StorageBackend::Memory
    }
}

/// Parse URL and create appropriate I/O manager
///
/// Filesystem and memory URLs are supported here. For cloud storage (S3, Azure, GCS),
/// implement the `IOManager` trait in your application.
pub async fn create_io_manager(url: &str) -> Result<Box<dyn IOManager>> {
    let backend = StorageBackend::from_url(url)?;

    match backend {
        StorageBackend::FileSystem => {
            let path = url.strip_prefix("file://").unwrap_or(url);
            Ok(Box::new(FileSystemIOManager::new(path)))
        }
        StorageBackend::Memory => Ok(Box::new(MemoryIOManager::new())),
        StorageBackend::S3 | StorageBackend::Azure | StorageBackend::GCS => {
            Err(IngestError::Configuration(format!(
                "Cloud backend {:?} must be provided by the application \
                 as an IOManager implementation",
                backend
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_file_system_io() {
        let temp_dir = TempDir::new().unwrap();
        let io = FileSystemIOManager::new(temp_dir.path());

        let data = b"Hello, store!";
        io.write("nested/test.dat", data).await.unwrap();

        let read_data = io.read("nested/test.dat").await.unwrap();
        assert_eq!(&read_data[..], data);

        assert!(io.exists("nested/test.dat").await.unwrap());
        assert!(!io.exists("nonexistent.dat").await.unwrap());
        assert_eq!(io.size("nested/test.dat").await.unwrap(), data.len());

        // Overwrite replaces and leaves no temp files behind
        io.write("nested/test.dat", b"v2").await.unwrap();
        assert_eq!(&io.read("nested/test.dat").await.unwrap()[..], b"v2");
        assert_eq!(io.list("nested").await.unwrap(), vec!["test.dat"]);

        io.delete("nested/test.dat").await.unwrap();
        assert!(!io.exists("nested/test.dat").await.unwrap());
        assert!(matches!(
            io.read("nested/test.dat").await,
            Err(IngestError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_memory_io() {
        let io = MemoryIOManager::new();
        io.write("a/c/0/0", b"x").await.unwrap();
        io.write("a/c/0/1", b"yy").await.unwrap();
        io.write("descriptor.json", b"{}").await.unwrap();

        assert_eq!(io.size("a/c/0/1").await.unwrap(), 2);
        assert_eq!(io.list("a/c/0").await.unwrap(), vec!["0", "1"]);
        assert_eq!(io.list("").await.unwrap(), vec!["a", "descriptor.json"]);
        io.delete("a/c/0/0").await.unwrap();
        assert!(io.delete("a/c/0/0").await.is_err());
    }

    #[test]
    fn test_backend_from_url() {
        assert_eq!(
            StorageBackend::from_url("file:///data/volume").unwrap(),
            StorageBackend::FileSystem
        );
        assert_eq!(
            StorageBackend::from_url("memory://scratch").unwrap(),
            StorageBackend::Memory
        );
        assert_eq!(
            StorageBackend::from_url("s3://bucket/volume").unwrap(),
            StorageBackend::S3
        );
        assert_eq!(
            StorageBackend::from_url("gs://bucket/volume").unwrap(),
            StorageBackend::GCS
        );
        assert!(StorageBackend::from_url("ftp://host/x").is_err());
    }
}
