//! Capability contract and backend adapters
//!
//! Every storage kind implements [`StorageAdapter`]. Paths are always
//! backend-relative (`/a/b.txt`) and resolved against the adapter's own
//! configured root; each adapter owns its connection/session state and must
//! be safe for concurrent use.
//!
//! ```text
//! registry / orchestrator / archive engine
//!         │
//!         ▼
//!   dyn StorageAdapter ──► local | nfs | s3 | gdrive | sftp | redis
//! ```

pub mod factory;
pub mod gdrive;
pub mod kv;
pub mod local;
pub mod nfs;
pub mod object;
pub mod sftp;

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::AsyncRead;
use tracing::debug;

use crate::error::{StorageError, StorageResult};
use crate::path_utils::join;
use crate::transfer::stream::MeteredReader;
use crate::types::{BackendKind, EntryDescriptor, SpaceInfo};

pub use factory::AdapterFactory;
pub use gdrive::DriveAdapter;
pub use kv::{KvAdapter, KvStore, MemoryKv, RedisKv};
pub use local::LocalAdapter;
pub use nfs::NfsAdapter;
pub use object::ObjectAdapter;
pub use sftp::SftpAdapter;

/// Owned byte stream handed out by `read` and consumed by `write`.
pub type ByteReader = Box<dyn AsyncRead + Send + Unpin>;

/// Progress callback, invoked with the number of bytes just moved.
pub type ProgressFn = Arc<dyn Fn(u64) + Send + Sync>;

/// Boxed, Send future used by the recursive helpers below.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Uniform operation set over one storage backend.
#[async_trait]
pub trait StorageAdapter: Send + Sync {
    /// Storage kind this adapter talks to.
    fn kind(&self) -> BackendKind;

    /// Human-readable description of the configured root.
    fn root_path(&self) -> String;

    /// List the direct children of a directory.
    async fn list(&self, path: &str) -> StorageResult<Vec<EntryDescriptor>>;

    /// Describe one entry. `NotFound` if it does not exist.
    async fn stat(&self, path: &str) -> StorageResult<EntryDescriptor>;

    /// Open a file for streaming reads.
    async fn read(&self, path: &str) -> StorageResult<ByteReader>;

    /// Create or overwrite a file from a byte stream, creating missing parent
    /// containers where the backend models them. Returns bytes written.
    async fn write(&self, path: &str, data: ByteReader) -> StorageResult<u64>;

    /// Delete a file, or a directory together with everything beneath it.
    async fn delete(&self, path: &str) -> StorageResult<()>;

    /// Create a directory and any missing parents.
    async fn make_container(&self, path: &str) -> StorageResult<()>;

    /// Move an entry within this backend.
    async fn rename(&self, src: &str, dst: &str) -> StorageResult<()> {
        copy_within(self, src, dst, None).await?;
        self.delete(src).await
    }

    /// Copy an entry within this backend. Returns bytes copied.
    async fn copy(&self, src: &str, dst: &str, progress: Option<ProgressFn>) -> StorageResult<u64> {
        copy_within(self, src, dst, progress).await
    }

    /// Total bytes held by the files at or beneath `path`.
    async fn usage(&self, path: &str) -> StorageResult<u64> {
        total_size(self, path).await
    }

    /// Available and total capacity; unknown values stay `None`.
    async fn space(&self) -> StorageResult<SpaceInfo> {
        Ok(SpaceInfo::UNKNOWN)
    }

    /// Release connections, sessions or mounts held by this adapter.
    async fn close(&self) -> StorageResult<()> {
        Ok(())
    }
}

/// Generic same-backend copy: streams files through `read`/`write` and
/// recreates directory trees. Adapters without a native copy use this.
pub fn copy_within<'a, A>(
    adapter: &'a A,
    src: &'a str,
    dst: &'a str,
    progress: Option<ProgressFn>,
) -> BoxFuture<'a, StorageResult<u64>>
where
    A: StorageAdapter + ?Sized,
{
    Box::pin(async move {
        let entry = adapter.stat(src).await?;
        if entry.is_dir() {
            if crate::path_utils::is_within(&entry.path, &crate::path_utils::normalize(dst)?) {
                return Err(StorageError::Conflict(format!(
                    "cannot copy {} into itself",
                    entry.path
                )));
            }
            adapter.make_container(dst).await?;
            let mut total = 0;
            for child in adapter.list(src).await? {
                let child_dst = join(dst, &child.name);
                total += copy_within(adapter, &child.path, &child_dst, progress.clone()).await?;
            }
            Ok(total)
        } else {
            debug!("Copying {} -> {} within {}", src, dst, adapter.kind());
            let reader = adapter.read(src).await?;
            let reader: ByteReader = match progress {
                Some(cb) => Box::new(MeteredReader::new(reader).with_progress(cb)),
                None => reader,
            };
            adapter.write(dst, reader).await
        }
    })
}

/// Sum the sizes of every file at or beneath `path` by walking `list`.
pub fn total_size<'a, A>(adapter: &'a A, path: &'a str) -> BoxFuture<'a, StorageResult<u64>>
where
    A: StorageAdapter + ?Sized,
{
    Box::pin(async move {
        let entry = adapter.stat(path).await?;
        if !entry.is_dir() {
            return Ok(entry.size);
        }
        let mut total = 0;
        for child in adapter.list(path).await? {
            total += if child.is_dir() {
                total_size(adapter, &child.path).await?
            } else {
                child.size
            };
        }
        Ok(total)
    })
}

/// Read a whole file into memory. Test and small-payload helper.
pub async fn read_to_vec(adapter: &dyn StorageAdapter, path: &str) -> StorageResult<Vec<u8>> {
    use tokio::io::AsyncReadExt;

    let mut reader = adapter.read(path).await?;
    let mut buf = Vec::new();
    reader
        .read_to_end(&mut buf)
        .await
        .map_err(|e| StorageError::from_io(e, path))?;
    Ok(buf)
}

/// Write an in-memory buffer as a file.
pub async fn write_bytes(
    adapter: &dyn StorageAdapter,
    path: &str,
    data: impl Into<Vec<u8>>,
) -> StorageResult<u64> {
    let reader: ByteReader = Box::new(std::io::Cursor::new(data.into()));
    adapter.write(path, reader).await
}
