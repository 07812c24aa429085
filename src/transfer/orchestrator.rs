//! Cross-backend copy and move
//!
//! Same-backend requests are delegated to the adapter's native operation.
//! Across backends, directories are recreated container-first and every file
//! is streamed from the source `read` straight into the destination `write`
//! through a [`MeteredReader`], so nothing is buffered whole and every byte
//! is both counted and cancellable.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::retry::{with_retry, RetryConfig};
use super::stream::MeteredReader;
use crate::adapter::{BoxFuture, ByteReader, ProgressFn, StorageAdapter};
use crate::error::{StorageError, StorageResult};
use crate::path_utils::{join, normalize};
use crate::registry::StorageRegistry;
use crate::types::EntryKind;

/// Result of a completed copy or move
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferOutcome {
    /// File bytes written to the destination
    pub bytes: u64,
    /// Non-fatal problems, e.g. a source left behind after a move
    pub warnings: Vec<String>,
}

pub struct TransferOrchestrator {
    registry: Arc<StorageRegistry>,
    retry: RetryConfig,
}

impl TransferOrchestrator {
    pub fn new(registry: Arc<StorageRegistry>) -> Self {
        Self {
            registry,
            retry: RetryConfig::default(),
        }
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Bytes a copy of `path` would move.
    pub async fn total_bytes(&self, backend_id: &str, path: &str) -> StorageResult<u64> {
        self.registry.get(backend_id)?.usage(path).await
    }

    /// Copy an entry, possibly between two backends.
    pub async fn copy(
        &self,
        src_id: &str,
        src_path: &str,
        dst_id: &str,
        dst_path: &str,
        progress: Option<ProgressFn>,
        cancel: &CancellationToken,
    ) -> StorageResult<TransferOutcome> {
        let src = self.registry.get(src_id)?;
        if cancel.is_cancelled() {
            return Err(StorageError::Cancelled);
        }

        let mut warnings = Vec::new();
        let result = if src_id == dst_id {
            debug!("Native copy {} -> {} on {}", src_path, dst_path, src_id);
            native_copy(src.as_ref(), src_path, dst_path, progress).await
        } else {
            let dst = self.registry.get(dst_id)?;
            info!("Copying {}:{} -> {}:{}", src_id, src_path, dst_id, dst_path);
            self.copy_tree(
                src.as_ref(),
                dst.as_ref(),
                src_path,
                dst_path,
                progress,
                cancel,
                &mut warnings,
            )
            .await
        };

        match result {
            Ok(bytes) => Ok(TransferOutcome { bytes, warnings }),
            Err(_) if cancel.is_cancelled() => Err(StorageError::Cancelled),
            Err(e) => Err(e),
        }
    }

    /// Move an entry. Across backends this is copy then delete-source; a
    /// failed delete leaves the source in place and is reported as a warning.
    pub async fn move_entry(
        &self,
        src_id: &str,
        src_path: &str,
        dst_id: &str,
        dst_path: &str,
        progress: Option<ProgressFn>,
        cancel: &CancellationToken,
    ) -> StorageResult<TransferOutcome> {
        if src_id == dst_id {
            let adapter = self.registry.get(src_id)?;
            if cancel.is_cancelled() {
                return Err(StorageError::Cancelled);
            }
            let bytes = adapter.usage(src_path).await.unwrap_or(0);
            debug!("Native rename {} -> {} on {}", src_path, dst_path, src_id);
            adapter.rename(src_path, dst_path).await?;
            if let Some(cb) = &progress {
                cb(bytes);
            }
            return Ok(TransferOutcome {
                bytes,
                warnings: Vec::new(),
            });
        }

        let mut outcome = self
            .copy(src_id, src_path, dst_id, dst_path, progress, cancel)
            .await?;

        let src = self.registry.get(src_id)?;
        if let Err(e) = src.delete(src_path).await {
            warn!(
                "Moved {}:{} to {}:{} but could not delete the source: {}",
                src_id, src_path, dst_id, dst_path, e
            );
            outcome
                .warnings
                .push(format!("source {}:{} was not deleted: {}", src_id, src_path, e));
        }
        Ok(outcome)
    }

    fn copy_tree<'a>(
        &'a self,
        src: &'a dyn StorageAdapter,
        dst: &'a dyn StorageAdapter,
        src_path: &'a str,
        dst_path: &'a str,
        progress: Option<ProgressFn>,
        cancel: &'a CancellationToken,
        warnings: &'a mut Vec<String>,
    ) -> BoxFuture<'a, StorageResult<u64>> {
        Box::pin(async move {
            if cancel.is_cancelled() {
                return Err(StorageError::Cancelled);
            }

            let entry = src.stat(src_path).await?;
            if entry.kind == EntryKind::Symlink {
                warn!("Skipping symlink {} during cross-backend copy", entry.path);
                warnings.push(format!("symlink {} was not copied", entry.path));
                return Ok(0);
            }
            if !entry.is_dir() {
                return self.copy_file(src, dst, &entry.path, dst_path, progress, cancel).await;
            }

            dst.make_container(dst_path).await?;
            let mut children = src.list(&entry.path).await?;
            // Directories first
            children.sort_by_key(|child| !child.is_dir());

            let mut total = 0;
            for child in children {
                if cancel.is_cancelled() {
                    return Err(StorageError::Cancelled);
                }
                let child_dst = join(dst_path, &child.name);
                total += self
                    .copy_tree(
                        src,
                        dst,
                        &child.path,
                        &child_dst,
                        progress.clone(),
                        cancel,
                        warnings,
                    )
                    .await?;
            }
            Ok(total)
        })
    }

    /// Stream one file with retry. Bytes re-sent by a retried attempt are
    /// not reported twice.
    async fn copy_file(
        &self,
        src: &dyn StorageAdapter,
        dst: &dyn StorageAdapter,
        src_path: &str,
        dst_path: &str,
        progress: Option<ProgressFn>,
        cancel: &CancellationToken,
    ) -> StorageResult<u64> {
        let dst_path = normalize(dst_path)?;
        let reported = Arc::new(AtomicU64::new(0));
        let label = format!("copy {}", src_path);

        with_retry(&label, &self.retry, cancel, || {
            let progress = progress.clone();
            let reported = reported.clone();
            let dst_path = dst_path.clone();
            async move {
                let reader = src.read(src_path).await?;
                let mut metered = MeteredReader::new(reader).with_cancel(cancel.clone());
                if let Some(cb) = progress {
                    let attempt = Arc::new(AtomicU64::new(0));
                    metered = metered.with_progress(Arc::new(move |n| {
                        let sent = attempt.fetch_add(n, Ordering::SeqCst) + n;
                        let before = reported.fetch_max(sent, Ordering::SeqCst);
                        if sent > before {
                            cb(sent - before);
                        }
                    }));
                }
                let reader: ByteReader = Box::new(metered);
                dst.write(&dst_path, reader).await
            }
        })
        .await
    }
}

/// Same-backend copy through the adapter. Bytes the adapter did not report
/// through the callback are reported once it returns, so progress always
/// ends at the copied total.
async fn native_copy(
    adapter: &dyn StorageAdapter,
    src_path: &str,
    dst_path: &str,
    progress: Option<ProgressFn>,
) -> StorageResult<u64> {
    let Some(cb) = progress else {
        return adapter.copy(src_path, dst_path, None).await;
    };
    let seen = Arc::new(AtomicU64::new(0));
    let counting: ProgressFn = {
        let seen = seen.clone();
        let cb = cb.clone();
        Arc::new(move |n| {
            seen.fetch_add(n, Ordering::SeqCst);
            cb(n);
        })
    };
    let bytes = adapter.copy(src_path, dst_path, Some(counting)).await?;
    let reported = seen.load(Ordering::SeqCst);
    if bytes > reported {
        cb(bytes - reported);
    }
    Ok(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::{read_to_vec, write_bytes, KvAdapter, LocalAdapter, ObjectAdapter};
    use tempfile::tempdir;

    async fn registry_with(temp: &std::path::Path) -> Arc<StorageRegistry> {
        let registry = Arc::new(StorageRegistry::new());
        registry
            .register("disk", Arc::new(LocalAdapter::open(temp).await.unwrap()))
            .unwrap();
        registry
            .register("bucket", Arc::new(ObjectAdapter::in_memory()))
            .unwrap();
        registry.register("cache", Arc::new(KvAdapter::in_memory())).unwrap();
        registry
    }

    #[tokio::test]
    async fn test_cross_backend_tree_copy() {
        let temp = tempdir().unwrap();
        let registry = registry_with(temp.path()).await;
        let disk = registry.get("disk").unwrap();
        write_bytes(disk.as_ref(), "/tree/a.txt", "alpha").await.unwrap();
        write_bytes(disk.as_ref(), "/tree/sub/b.txt", "beta").await.unwrap();

        let orchestrator = TransferOrchestrator::new(registry.clone());
        let seen = Arc::new(AtomicU64::new(0));
        let cb: ProgressFn = {
            let seen = seen.clone();
            Arc::new(move |n| {
                seen.fetch_add(n, Ordering::SeqCst);
            })
        };
        let outcome = orchestrator
            .copy("disk", "/tree", "bucket", "/copy", Some(cb), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(outcome.bytes, 9);
        assert_eq!(seen.load(Ordering::SeqCst), 9);
        let bucket = registry.get("bucket").unwrap();
        assert_eq!(read_to_vec(bucket.as_ref(), "/copy/a.txt").await.unwrap(), b"alpha");
        assert_eq!(read_to_vec(bucket.as_ref(), "/copy/sub/b.txt").await.unwrap(), b"beta");
    }

    #[tokio::test]
    async fn test_cross_backend_move_deletes_source() {
        let temp = tempdir().unwrap();
        let registry = registry_with(temp.path()).await;
        let cache = registry.get("cache").unwrap();
        write_bytes(cache.as_ref(), "/a.txt", "payload").await.unwrap();

        let orchestrator = TransferOrchestrator::new(registry.clone());
        let outcome = orchestrator
            .move_entry("cache", "/a.txt", "disk", "/a.txt", None, &CancellationToken::new())
            .await
            .unwrap();

        assert!(outcome.warnings.is_empty());
        assert!(matches!(cache.stat("/a.txt").await, Err(StorageError::NotFound(_))));
        let disk = registry.get("disk").unwrap();
        assert_eq!(read_to_vec(disk.as_ref(), "/a.txt").await.unwrap(), b"payload");
    }

    #[tokio::test]
    async fn test_same_backend_uses_native_ops() {
        let temp = tempdir().unwrap();
        let registry = registry_with(temp.path()).await;
        let disk = registry.get("disk").unwrap();
        write_bytes(disk.as_ref(), "/x.bin", vec![1u8; 64]).await.unwrap();

        let orchestrator = TransferOrchestrator::new(registry.clone());
        let token = CancellationToken::new();
        orchestrator.copy("disk", "/x.bin", "disk", "/y.bin", None, &token).await.unwrap();
        orchestrator.move_entry("disk", "/y.bin", "disk", "/z.bin", None, &token).await.unwrap();

        assert!(disk.stat("/x.bin").await.is_ok());
        assert!(disk.stat("/y.bin").await.is_err());
        assert_eq!(disk.stat("/z.bin").await.unwrap().size, 64);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_tree_copy_skips_symlinks() {
        let temp = tempdir().unwrap();
        let registry = registry_with(temp.path()).await;
        let disk = registry.get("disk").unwrap();
        write_bytes(disk.as_ref(), "/tree/sub/b.txt", "beta").await.unwrap();
        write_bytes(disk.as_ref(), "/tree/a.txt", "alpha").await.unwrap();
        std::os::unix::fs::symlink(temp.path().join("tree/sub"), temp.path().join("tree/dirlink"))
            .unwrap();
        std::os::unix::fs::symlink(temp.path().join("tree/gone"), temp.path().join("tree/dangling"))
            .unwrap();

        let outcome = TransferOrchestrator::new(registry.clone())
            .copy("disk", "/tree", "cache", "/tree", None, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(outcome.bytes, 9);
        assert_eq!(outcome.warnings.len(), 2);
        let cache = registry.get("cache").unwrap();
        assert_eq!(read_to_vec(cache.as_ref(), "/tree/sub/b.txt").await.unwrap(), b"beta");
        assert!(cache.stat("/tree/dirlink").await.is_err());
        assert!(cache.stat("/tree/dangling").await.is_err());
    }

    #[tokio::test]
    async fn test_native_copy_reports_every_byte() {
        let temp = tempdir().unwrap();
        let registry = registry_with(temp.path()).await;
        let disk = registry.get("disk").unwrap();
        write_bytes(disk.as_ref(), "/x.bin", vec![3u8; 500]).await.unwrap();

        let seen = Arc::new(AtomicU64::new(0));
        let cb: ProgressFn = {
            let seen = seen.clone();
            Arc::new(move |n| {
                seen.fetch_add(n, Ordering::SeqCst);
            })
        };
        let outcome = TransferOrchestrator::new(registry)
            .copy("disk", "/x.bin", "disk", "/y.bin", Some(cb), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(outcome.bytes, 500);
        assert_eq!(seen.load(Ordering::SeqCst), 500);
    }

    #[tokio::test]
    async fn test_cancelled_copy() {
        let temp = tempdir().unwrap();
        let registry = registry_with(temp.path()).await;
        let disk = registry.get("disk").unwrap();
        write_bytes(disk.as_ref(), "/big.bin", vec![0u8; 1024]).await.unwrap();

        let token = CancellationToken::new();
        token.cancel();
        let result = TransferOrchestrator::new(registry)
            .copy("disk", "/big.bin", "bucket", "/big.bin", None, &token)
            .await;
        assert!(matches!(result, Err(StorageError::Cancelled)));
    }

    #[tokio::test]
    async fn test_unknown_backend() {
        let temp = tempdir().unwrap();
        let registry = registry_with(temp.path()).await;
        let result = TransferOrchestrator::new(registry)
            .copy("nope", "/a", "disk", "/a", None, &CancellationToken::new())
            .await;
        assert!(matches!(result, Err(StorageError::NotFound(_))));
    }
}
