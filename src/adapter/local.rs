//! Local disk adapter
//!
//! Maps backend paths onto a directory on this machine. Every resolved path
//! is checked against the canonical root, including through symlinks, so no
//! request can reach outside the configured directory.

use std::fs::Metadata;
use std::io;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use async_trait::async_trait;
use tokio::fs;
use tokio::io::{AsyncWriteExt, BufReader};
use tracing::{debug, info, warn};

use super::{copy_within, ByteReader, ProgressFn, StorageAdapter};
use crate::error::{StorageError, StorageResult};
use crate::path_utils::{is_root, join, normalize};
use crate::types::constants::STREAM_BUFFER_SIZE;
use crate::types::{guess_content_type, BackendKind, EntryDescriptor, EntryKind, SpaceInfo};

/// Marker embedded in the names of in-flight write files
const TEMP_MARKER: &str = ".polystore-tmp-";

/// Local filesystem adapter rooted at one directory
pub struct LocalAdapter {
    /// Canonical root directory
    root: PathBuf,
}

impl LocalAdapter {
    /// Open an adapter rooted at `root`. The directory must exist.
    pub async fn open(root: impl AsRef<Path>) -> StorageResult<Self> {
        let root_ref = root.as_ref();
        let root = fs::canonicalize(root_ref)
            .await
            .map_err(|e| StorageError::from_io(e, &root_ref.to_string_lossy()))?;

        let meta = fs::metadata(&root)
            .await
            .map_err(|e| StorageError::from_io(e, &root.to_string_lossy()))?;
        if !meta.is_dir() {
            return Err(StorageError::InvalidConfig(format!(
                "local root is not a directory: {}",
                root.display()
            )));
        }

        info!("Local adapter rooted at {}", root.display());
        Ok(Self { root })
    }

    /// Canonical root directory
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve a backend path to an OS path without following the final
    /// component. Every existing ancestor must stay inside the root.
    pub async fn resolve(&self, path: &str) -> StorageResult<(String, PathBuf)> {
        let normalized = normalize(path)?;
        let full = self.root.join(normalized.trim_start_matches('/'));

        if let Some(parent) = full.parent() {
            if full != self.root {
                self.ensure_contained(parent, &normalized).await?;
            }
        }
        Ok((normalized, full))
    }

    /// Like [`resolve`](Self::resolve), but also follows the final component
    /// when it exists (symlink targets must stay inside the root too).
    pub async fn resolve_follow(&self, path: &str) -> StorageResult<(String, PathBuf)> {
        let (normalized, full) = self.resolve(path).await?;
        self.ensure_contained(&full, &normalized).await?;
        Ok((normalized, full))
    }

    /// Canonicalize the deepest existing ancestor of `candidate` and check
    /// it lies under the root.
    async fn ensure_contained(&self, candidate: &Path, shown: &str) -> StorageResult<()> {
        let mut probe = candidate.to_path_buf();
        loop {
            match fs::canonicalize(&probe).await {
                Ok(real) => {
                    if real.starts_with(&self.root) {
                        return Ok(());
                    }
                    warn!(
                        "Rejected path {} resolving outside root {}",
                        shown,
                        self.root.display()
                    );
                    return Err(StorageError::PermissionDenied(format!(
                        "path escapes storage root: {}",
                        shown
                    )));
                }
                Err(e) if e.kind() == io::ErrorKind::NotFound => {
                    if !probe.pop() {
                        return Ok(());
                    }
                }
                Err(e) => return Err(StorageError::from_io(e, shown)),
            }
        }
    }

    async fn describe(&self, normalized: &str, full: &Path) -> StorageResult<EntryDescriptor> {
        let meta = fs::symlink_metadata(full)
            .await
            .map_err(|e| StorageError::from_io(e, normalized))?;
        let link_target = if meta.file_type().is_symlink() {
            fs::read_link(full)
                .await
                .ok()
                .map(|p| p.to_string_lossy().to_string())
        } else {
            None
        };
        Ok(descriptor_from_metadata(normalized, &meta, link_target))
    }
}

/// Get mtime as unix timestamp (seconds since epoch), 0 when unavailable.
pub(crate) fn mtime_secs(metadata: &Metadata) -> i64 {
    metadata
        .modified()
        .ok()
        .and_then(|t| t.duration_since(SystemTime::UNIX_EPOCH).ok())
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// Get permissions as text (octal on Unix, e.g. "755").
#[cfg(unix)]
fn permissions_text(metadata: &Metadata) -> String {
    use std::os::unix::fs::PermissionsExt;
    format!("{:o}", metadata.permissions().mode() & 0o7777)
}

#[cfg(not(unix))]
fn permissions_text(metadata: &Metadata) -> String {
    if metadata.permissions().readonly() {
        "r".to_string()
    } else {
        "rw".to_string()
    }
}

pub(crate) fn descriptor_from_metadata(
    path: &str,
    metadata: &Metadata,
    link_target: Option<String>,
) -> EntryDescriptor {
    let file_type = metadata.file_type();
    let kind = if file_type.is_symlink() {
        EntryKind::Symlink
    } else if file_type.is_dir() {
        EntryKind::Directory
    } else {
        EntryKind::File
    };

    EntryDescriptor {
        name: crate::path_utils::file_name(path).to_string(),
        path: path.to_string(),
        size: if kind == EntryKind::Directory { 0 } else { metadata.len() },
        modified_at: mtime_secs(metadata),
        kind,
        permissions_text: permissions_text(metadata),
        content_type: if kind == EntryKind::File {
            guess_content_type(path)
        } else {
            None
        },
        link_target,
    }
}

fn temp_path_for(target: &Path) -> PathBuf {
    let name = target
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "file".into());
    let temp_name = format!(".{}{}{}", name, TEMP_MARKER, uuid::Uuid::new_v4().simple());
    target.with_file_name(temp_name)
}

#[async_trait]
impl StorageAdapter for LocalAdapter {
    fn kind(&self) -> BackendKind {
        BackendKind::Local
    }

    fn root_path(&self) -> String {
        self.root.to_string_lossy().to_string()
    }

    async fn list(&self, path: &str) -> StorageResult<Vec<EntryDescriptor>> {
        let (normalized, full) = self.resolve_follow(path).await?;
        debug!("Listing directory: {}", full.display());

        let mut read_dir = fs::read_dir(&full)
            .await
            .map_err(|e| StorageError::from_io(e, &normalized))?;

        let mut entries = Vec::new();
        while let Some(entry) = read_dir
            .next_entry()
            .await
            .map_err(|e| StorageError::from_io(e, &normalized))?
        {
            let name = entry.file_name().to_string_lossy().to_string();
            if name.contains(TEMP_MARKER) {
                continue;
            }
            let child = join(&normalized, &name);
            match self.describe(&child, &entry.path()).await {
                Ok(desc) => entries.push(desc),
                // Raced with a concurrent delete
                Err(StorageError::NotFound(_)) => continue,
                Err(e) => return Err(e),
            }
        }

        debug!("Listed {} entries in {}", entries.len(), normalized);
        Ok(entries)
    }

    async fn stat(&self, path: &str) -> StorageResult<EntryDescriptor> {
        let (normalized, full) = self.resolve(path).await?;
        self.describe(&normalized, &full).await
    }

    async fn read(&self, path: &str) -> StorageResult<ByteReader> {
        let (normalized, full) = self.resolve_follow(path).await?;
        let meta = fs::metadata(&full)
            .await
            .map_err(|e| StorageError::from_io(e, &normalized))?;
        if meta.is_dir() {
            return Err(StorageError::Unsupported(format!(
                "cannot read a directory: {}",
                normalized
            )));
        }

        let file = fs::File::open(&full)
            .await
            .map_err(|e| StorageError::from_io(e, &normalized))?;
        Ok(Box::new(file))
    }

    async fn write(&self, path: &str, data: ByteReader) -> StorageResult<u64> {
        let (normalized, full) = self.resolve_follow(path).await?;
        if is_root(&normalized) {
            return Err(StorageError::Conflict("cannot overwrite the root".into()));
        }
        if let Ok(meta) = fs::metadata(&full).await {
            if meta.is_dir() {
                return Err(StorageError::Conflict(format!(
                    "a directory exists at {}",
                    normalized
                )));
            }
        }

        if let Some(parent) = full.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| StorageError::from_io(e, &normalized))?;
        }

        // Stream into a sibling temp file, then rename over the target
        let temp_path = temp_path_for(&full);
        let result: io::Result<u64> = async {
            let mut file = fs::File::create(&temp_path).await?;
            let mut reader = BufReader::with_capacity(STREAM_BUFFER_SIZE, data);
            let written = tokio::io::copy_buf(&mut reader, &mut file).await?;
            file.flush().await?;
            file.sync_all().await?;
            Ok(written)
        }
        .await;

        let written = match result {
            Ok(n) => n,
            Err(e) => {
                let _ = fs::remove_file(&temp_path).await;
                return Err(StorageError::from_io(e, &normalized));
            }
        };

        if let Err(e) = fs::rename(&temp_path, &full).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(StorageError::from_io(e, &normalized));
        }

        debug!("Wrote {} bytes to {}", written, full.display());
        Ok(written)
    }

    async fn delete(&self, path: &str) -> StorageResult<()> {
        let (normalized, full) = self.resolve(path).await?;
        if is_root(&normalized) {
            return Err(StorageError::PermissionDenied(
                "refusing to delete the storage root".into(),
            ));
        }

        let meta = fs::symlink_metadata(&full)
            .await
            .map_err(|e| StorageError::from_io(e, &normalized))?;
        if meta.is_dir() {
            fs::remove_dir_all(&full).await
        } else {
            fs::remove_file(&full).await
        }
        .map_err(|e| StorageError::from_io(e, &normalized))?;

        info!("Deleted {}", full.display());
        Ok(())
    }

    async fn make_container(&self, path: &str) -> StorageResult<()> {
        let (normalized, full) = self.resolve_follow(path).await?;
        if let Ok(meta) = fs::metadata(&full).await {
            if !meta.is_dir() {
                return Err(StorageError::Conflict(format!(
                    "a file exists at {}",
                    normalized
                )));
            }
            return Ok(());
        }
        fs::create_dir_all(&full)
            .await
            .map_err(|e| StorageError::from_io(e, &normalized))
    }

    async fn rename(&self, src: &str, dst: &str) -> StorageResult<()> {
        let (src_norm, src_full) = self.resolve(src).await?;
        let (dst_norm, dst_full) = self.resolve_follow(dst).await?;
        if is_root(&src_norm) || is_root(&dst_norm) {
            return Err(StorageError::PermissionDenied("cannot move the storage root".into()));
        }
        fs::symlink_metadata(&src_full)
            .await
            .map_err(|e| StorageError::from_io(e, &src_norm))?;

        if let Some(parent) = dst_full.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| StorageError::from_io(e, &dst_norm))?;
        }

        match fs::rename(&src_full, &dst_full).await {
            Ok(()) => {
                info!("Renamed {} -> {}", src_norm, dst_norm);
                Ok(())
            }
            Err(e) if matches!(e.kind(), io::ErrorKind::NotFound | io::ErrorKind::PermissionDenied) => {
                Err(StorageError::from_io(e, &src_norm))
            }
            Err(e) => {
                // Different filesystems under one root (mount points): copy instead
                debug!("rename failed ({}), falling back to copy+delete", e);
                copy_within(self, &src_norm, &dst_norm, None).await?;
                self.delete(&src_norm).await
            }
        }
    }

    async fn copy(&self, src: &str, dst: &str, progress: Option<ProgressFn>) -> StorageResult<u64> {
        let (src_norm, src_full) = self.resolve_follow(src).await?;
        let meta = fs::metadata(&src_full)
            .await
            .map_err(|e| StorageError::from_io(e, &src_norm))?;

        if meta.is_file() && progress.is_none() {
            let (dst_norm, dst_full) = self.resolve_follow(dst).await?;
            if let Some(parent) = dst_full.parent() {
                fs::create_dir_all(parent)
                    .await
                    .map_err(|e| StorageError::from_io(e, &dst_norm))?;
            }
            return fs::copy(&src_full, &dst_full)
                .await
                .map_err(|e| StorageError::from_io(e, &src_norm));
        }

        copy_within(self, &src_norm, dst, progress).await
    }

    async fn usage(&self, path: &str) -> StorageResult<u64> {
        let (normalized, full) = self.resolve_follow(path).await?;
        let meta = fs::metadata(&full)
            .await
            .map_err(|e| StorageError::from_io(e, &normalized))?;
        if meta.is_dir() {
            dir_total_size(full).await
        } else {
            Ok(meta.len())
        }
    }

    async fn space(&self) -> StorageResult<SpaceInfo> {
        let root = self.root.clone();
        let space = tokio::task::spawn_blocking(move || {
            let disks = sysinfo::Disks::new_with_refreshed_list();
            disks
                .list()
                .iter()
                .filter(|d| root.starts_with(d.mount_point()))
                .max_by_key(|d| d.mount_point().as_os_str().len())
                .map(|d| SpaceInfo::known(d.available_space(), d.total_space()))
                .unwrap_or(SpaceInfo::UNKNOWN)
        })
        .await?;
        Ok(space)
    }
}

/// Calculate total size of a local directory tree without following symlinks.
pub(crate) async fn dir_total_size(path: PathBuf) -> StorageResult<u64> {
    tokio::task::spawn_blocking(move || {
        let mut total: u64 = 0;
        for entry in walkdir::WalkDir::new(&path).follow_links(false) {
            let entry = entry.map_err(|e| StorageError::Transient(e.to_string()))?;
            if entry.file_type().is_file() {
                total += entry.metadata().map(|m| m.len()).unwrap_or(0);
            }
        }
        Ok(total)
    })
    .await?
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::{read_to_vec, write_bytes};
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Arc;
    use tempfile::tempdir;

    async fn adapter() -> (tempfile::TempDir, LocalAdapter) {
        let temp = tempdir().unwrap();
        let adapter = LocalAdapter::open(temp.path()).await.unwrap();
        (temp, adapter)
    }

    #[tokio::test]
    async fn test_write_read_stat() {
        let (_temp, local) = adapter().await;
        let payload = b"hello local".to_vec();

        let written = write_bytes(&local, "/docs/a.txt", payload.clone()).await.unwrap();
        assert_eq!(written, payload.len() as u64);

        assert_eq!(read_to_vec(&local, "/docs/a.txt").await.unwrap(), payload);
        let entry = local.stat("/docs/a.txt").await.unwrap();
        assert_eq!(entry.size, payload.len() as u64);
        assert_eq!(entry.kind, EntryKind::File);
        assert_eq!(entry.path, "/docs/a.txt");
        assert_eq!(entry.content_type.as_deref(), Some("text/plain"));
    }

    #[tokio::test]
    async fn test_overwrite_is_idempotent() {
        let (_temp, local) = adapter().await;
        write_bytes(&local, "/f.bin", vec![1u8; 100]).await.unwrap();
        write_bytes(&local, "/f.bin", vec![2u8; 10]).await.unwrap();
        assert_eq!(read_to_vec(&local, "/f.bin").await.unwrap(), vec![2u8; 10]);
    }

    #[tokio::test]
    async fn test_list_returns_children_with_prefix() {
        let (_temp, local) = adapter().await;
        for name in ["a.txt", "b.txt", "c.txt"] {
            write_bytes(&local, &format!("/dir/{}", name), b"x".to_vec()).await.unwrap();
        }
        local.make_container("/dir/sub").await.unwrap();

        let entries = local.list("/dir").await.unwrap();
        assert_eq!(entries.len(), 4);
        assert!(entries.iter().all(|e| e.path.starts_with("/dir/")));
        assert!(entries.iter().any(|e| e.name == "sub" && e.is_dir()));
    }

    #[tokio::test]
    async fn test_traversal_is_contained() {
        let (_temp, local) = adapter().await;
        let err = local.read("../../etc/passwd").await.err().unwrap();
        assert!(matches!(err, StorageError::PermissionDenied(_)));

        let err = local.stat("/a/../../etc/passwd").await.unwrap_err();
        assert!(matches!(err, StorageError::PermissionDenied(_)));

        // Backslash form too
        let err = local.stat("..\\..\\etc\\passwd").await.unwrap_err();
        assert!(matches!(err, StorageError::PermissionDenied(_)));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_symlink_escape_rejected() {
        let outside = tempdir().unwrap();
        std::fs::write(outside.path().join("secret.txt"), b"secret").unwrap();

        let (temp, local) = adapter().await;
        std::os::unix::fs::symlink(outside.path(), temp.path().join("escape")).unwrap();

        let err = local.read("/escape/secret.txt").await.err().unwrap();
        assert!(matches!(err, StorageError::PermissionDenied(_)));
        let err = write_bytes(&local, "/escape/new.txt", b"x".to_vec()).await.unwrap_err();
        assert!(matches!(err, StorageError::PermissionDenied(_)));
        assert!(!outside.path().join("new.txt").exists());

        // The link itself is still visible
        let entry = local.stat("/escape").await.unwrap();
        assert_eq!(entry.kind, EntryKind::Symlink);
        assert!(entry.link_target.is_some());
    }

    #[tokio::test]
    async fn test_stat_missing_is_not_found() {
        let (_temp, local) = adapter().await;
        assert!(matches!(
            local.stat("/nope").await,
            Err(StorageError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_delete_recursive() {
        let (_temp, local) = adapter().await;
        write_bytes(&local, "/tree/a/b/c.txt", b"c".to_vec()).await.unwrap();
        local.delete("/tree").await.unwrap();
        assert!(matches!(local.stat("/tree").await, Err(StorageError::NotFound(_))));
        assert!(local.delete("/").await.is_err());
    }

    #[tokio::test]
    async fn test_rename_and_copy() {
        let (_temp, local) = adapter().await;
        write_bytes(&local, "/src/one.txt", b"one".to_vec()).await.unwrap();

        local.rename("/src/one.txt", "/dst/one.txt").await.unwrap();
        assert!(local.stat("/src/one.txt").await.is_err());
        assert_eq!(read_to_vec(&local, "/dst/one.txt").await.unwrap(), b"one");

        let seen = Arc::new(AtomicU64::new(0));
        let cb: ProgressFn = {
            let seen = seen.clone();
            Arc::new(move |n| {
                seen.fetch_add(n, Ordering::SeqCst);
            })
        };
        let copied = local.copy("/dst", "/copy", Some(cb)).await.unwrap();
        assert_eq!(copied, 3);
        assert_eq!(seen.load(Ordering::SeqCst), 3);
        assert_eq!(read_to_vec(&local, "/copy/one.txt").await.unwrap(), b"one");
    }

    #[tokio::test]
    async fn test_copy_into_itself_rejected() {
        let (_temp, local) = adapter().await;
        write_bytes(&local, "/d/f.txt", b"f".to_vec()).await.unwrap();
        let err = local.copy("/d", "/d/inner", None).await.unwrap_err();
        assert!(matches!(err, StorageError::Conflict(_)));
    }

    #[tokio::test]
    async fn test_temp_files_hidden_from_listing() {
        let (temp, local) = adapter().await;
        std::fs::write(temp.path().join(".x.polystore-tmp-abc"), b"partial").unwrap();
        assert!(local.list("/").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_dir_total_size() {
        let (temp, local) = adapter().await;
        write_bytes(&local, "/s/a", vec![0u8; 10]).await.unwrap();
        write_bytes(&local, "/s/b/c", vec![0u8; 5]).await.unwrap();
        assert_eq!(dir_total_size(temp.path().join("s")).await.unwrap(), 15);
    }
}
