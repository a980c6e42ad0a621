//! Durable byte storage for cached artifacts

use super::disk::available_space;
use crate::error::{Error, Result};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tracing::debug;

/// Byte storage keyed by name
#[async_trait]
pub trait LocalStorage: Send + Sync {
    /// Size of the stored entry, or `None` if there is none
    async fn size(&self, name: &str) -> Result<Option<u64>>;

    /// Start writing an entry. It only becomes visible under `name` once committed.
    async fn create(&self, name: &str) -> Result<Box<dyn StorageWriter>>;

    /// Open an entry for reading
    async fn open(&self, name: &str) -> Result<tokio::fs::File>;

    /// Remove an entry; removing a missing entry is not an error
    async fn delete(&self, name: &str) -> Result<()>;

    /// Filesystem path of an entry, for random-access readers
    fn path(&self, name: &str) -> PathBuf;

    /// Free space in bytes, when the backend can tell
    fn available_space(&self) -> Result<Option<u64>> {
        Ok(None)
    }
}

/// Streamed append-write into storage
#[async_trait]
pub trait StorageWriter: Send {
    /// Append a chunk
    async fn append(&mut self, chunk: &[u8]) -> Result<()>;

    /// Make the entry visible; returns its size
    async fn commit(self: Box<Self>) -> Result<u64>;

    /// Throw away what was written
    async fn discard(self: Box<Self>) -> Result<()>;
}

/// Storage in a directory on the local filesystem
#[derive(Clone, Debug)]
pub struct FsStorage {
    root: PathBuf,
}

impl FsStorage {
    /// Storage rooted at `root`; the directory is created on first write
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Root directory
    pub fn root(&self) -> &Path {
        &self.root
    }
}

#[async_trait]
impl LocalStorage for FsStorage {
    async fn size(&self, name: &str) -> Result<Option<u64>> {
        match tokio::fs::metadata(self.path(name)).await {
            Ok(meta) if meta.is_file() => Ok(Some(meta.len())),
            Ok(_) => Ok(None),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn create(&self, name: &str) -> Result<Box<dyn StorageWriter>> {
        tokio::fs::create_dir_all(&self.root).await?;
        let final_path = self.path(name);
        let part_path = self.root.join(format!("{name}.part"));
        let file = tokio::fs::File::create(&part_path).await?;
        Ok(Box::new(FsWriter {
            file,
            part_path,
            final_path,
            written: 0,
        }))
    }

    async fn open(&self, name: &str) -> Result<tokio::fs::File> {
        Ok(tokio::fs::File::open(self.path(name)).await?)
    }

    async fn delete(&self, name: &str) -> Result<()> {
        match tokio::fs::remove_file(self.path(name)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn path(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }

    fn available_space(&self) -> Result<Option<u64>> {
        // Before the first download the directory may not exist yet
        let probe = if self.root.exists() {
            self.root.as_path()
        } else {
            match self.root.parent() {
                Some(parent) if parent.as_os_str().is_empty() => Path::new("."),
                Some(parent) => parent,
                None => Path::new("."),
            }
        };
        available_space(probe).map(Some).map_err(|e| {
            Error::DiskSpaceCheckFailed(format!(
                "failed to check disk space for '{}': {}",
                probe.display(),
                e
            ))
        })
    }
}

struct FsWriter {
    file: tokio::fs::File,
    part_path: PathBuf,
    final_path: PathBuf,
    written: u64,
}

#[async_trait]
impl StorageWriter for FsWriter {
    async fn append(&mut self, chunk: &[u8]) -> Result<()> {
        self.file.write_all(chunk).await?;
        self.written += chunk.len() as u64;
        Ok(())
    }

    async fn commit(mut self: Box<Self>) -> Result<u64> {
        self.file.flush().await?;
        self.file.sync_all().await?;
        tokio::fs::rename(&self.part_path, &self.final_path).await?;
        debug!(path = ?self.final_path, bytes = self.written, "stored artifact");
        Ok(self.written)
    }

    async fn discard(self: Box<Self>) -> Result<()> {
        let FsWriter { file, part_path, .. } = *self;
        drop(file);
        match tokio::fs::remove_file(&part_path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
