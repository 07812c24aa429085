//! NFS adapter
//!
//! Mounts `server:export` on a local mount point (unless something is already
//! mounted there) and serves it through [`LocalAdapter`]. A read-only
//! configuration refuses every mutation before it reaches the mount.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{info, warn};

use super::local::LocalAdapter;
use super::{ByteReader, ProgressFn, StorageAdapter};
use crate::error::{StorageError, StorageResult};
use crate::types::{BackendKind, EntryDescriptor, SpaceInfo};

/// NFS mount parameters
#[derive(Debug, Clone)]
pub struct NfsSettings {
    pub server: String,
    pub export: String,
    pub mount_point: PathBuf,
    pub read_only: bool,
    /// Extra `-o` mount options
    pub options: Option<String>,
}

impl NfsSettings {
    /// `server:/export` source string for mount(8)
    pub fn source(&self) -> String {
        let server = if self.server.contains(':') && !self.server.starts_with('[') {
            format!("[{}]", self.server)
        } else {
            self.server.clone()
        };
        format!("{}:{}", server, self.export)
    }

    fn mount_options(&self) -> Option<String> {
        let mut opts: Vec<&str> = Vec::new();
        if self.read_only {
            opts.push("ro");
        }
        if let Some(extra) = &self.options {
            opts.extend(extra.split(',').map(str::trim).filter(|o| !o.is_empty()));
        }
        if opts.is_empty() {
            None
        } else {
            Some(opts.join(","))
        }
    }
}

/// Adapter over an NFS export mounted locally
pub struct NfsAdapter {
    local: LocalAdapter,
    source: String,
    mount_point: PathBuf,
    read_only: bool,
    /// Whether this adapter performed the mount (and must unmount)
    mounted_here: AtomicBool,
}

impl NfsAdapter {
    /// Mount the export if needed and open it.
    pub async fn mount(settings: &NfsSettings) -> StorageResult<Self> {
        tokio::fs::create_dir_all(&settings.mount_point)
            .await
            .map_err(|e| StorageError::from_io(e, &settings.mount_point.to_string_lossy()))?;

        let source = settings.source();
        let mounted_here = if is_mounted(&settings.mount_point).await {
            info!("{} already mounted at {:?}", source, settings.mount_point);
            false
        } else {
            let mut cmd = Command::new("mount");
            cmd.arg("-t").arg("nfs");
            if let Some(opts) = settings.mount_options() {
                cmd.arg("-o").arg(opts);
            }
            cmd.arg(&source).arg(&settings.mount_point);

            let output = cmd
                .output()
                .await
                .map_err(|e| StorageError::Unsupported(format!("cannot run mount: {}", e)))?;
            if !output.status.success() {
                let stderr = String::from_utf8_lossy(&output.stderr);
                return Err(mount_error(&source, stderr.trim()));
            }
            info!("Mounted {} at {:?}", source, settings.mount_point);
            true
        };

        let local = LocalAdapter::open(&settings.mount_point).await?;
        Ok(Self {
            local,
            source,
            mount_point: settings.mount_point.clone(),
            read_only: settings.read_only,
            mounted_here: AtomicBool::new(mounted_here),
        })
    }

    /// Wrap a directory that is already mounted (or a plain directory).
    pub async fn from_mounted(
        mount_point: impl AsRef<Path>,
        source: impl Into<String>,
        read_only: bool,
    ) -> StorageResult<Self> {
        let mount_point = mount_point.as_ref().to_path_buf();
        let local = LocalAdapter::open(&mount_point).await?;
        Ok(Self {
            local,
            source: source.into(),
            mount_point,
            read_only,
            mounted_here: AtomicBool::new(false),
        })
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    fn check_writable(&self, path: &str) -> StorageResult<()> {
        if self.read_only {
            return Err(StorageError::PermissionDenied(format!(
                "{} is mounted read-only: {}",
                self.source, path
            )));
        }
        Ok(())
    }
}

fn mount_error(source: &str, stderr: &str) -> StorageError {
    let lower = stderr.to_ascii_lowercase();
    if lower.contains("permission denied") || lower.contains("only root") {
        StorageError::PermissionDenied(format!("mount {}: {}", source, stderr))
    } else if lower.contains("no such file") || lower.contains("does not exist") {
        StorageError::NotFound(format!("mount {}: {}", source, stderr))
    } else {
        StorageError::Transient(format!("mount {}: {}", source, stderr))
    }
}

/// Check `/proc/mounts` for an existing mount on `mount_point`.
async fn is_mounted(mount_point: &Path) -> bool {
    let Ok(canonical) = tokio::fs::canonicalize(mount_point).await else {
        return false;
    };
    match tokio::fs::read_to_string("/proc/mounts").await {
        Ok(mounts) => mounts
            .lines()
            .filter_map(|line| line.split_whitespace().nth(1))
            .any(|target| Path::new(target) == canonical),
        Err(_) => false,
    }
}

#[async_trait]
impl StorageAdapter for NfsAdapter {
    fn kind(&self) -> BackendKind {
        BackendKind::Nfs
    }

    fn root_path(&self) -> String {
        format!("{} ({})", self.source, self.mount_point.display())
    }

    async fn list(&self, path: &str) -> StorageResult<Vec<EntryDescriptor>> {
        self.local.list(path).await
    }

    async fn stat(&self, path: &str) -> StorageResult<EntryDescriptor> {
        self.local.stat(path).await
    }

    async fn read(&self, path: &str) -> StorageResult<ByteReader> {
        self.local.read(path).await
    }

    async fn write(&self, path: &str, data: ByteReader) -> StorageResult<u64> {
        self.check_writable(path)?;
        self.local.write(path, data).await
    }

    async fn delete(&self, path: &str) -> StorageResult<()> {
        self.check_writable(path)?;
        self.local.delete(path).await
    }

    async fn make_container(&self, path: &str) -> StorageResult<()> {
        self.check_writable(path)?;
        self.local.make_container(path).await
    }

    async fn rename(&self, src: &str, dst: &str) -> StorageResult<()> {
        self.check_writable(src)?;
        self.local.rename(src, dst).await
    }

    async fn copy(&self, src: &str, dst: &str, progress: Option<ProgressFn>) -> StorageResult<u64> {
        self.check_writable(dst)?;
        self.local.copy(src, dst, progress).await
    }

    async fn usage(&self, path: &str) -> StorageResult<u64> {
        self.local.usage(path).await
    }

    async fn space(&self) -> StorageResult<SpaceInfo> {
        self.local.space().await
    }

    async fn close(&self) -> StorageResult<()> {
        if !self.mounted_here.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        let output = Command::new("umount")
            .arg(&self.mount_point)
            .output()
            .await
            .map_err(|e| StorageError::Transient(format!("cannot run umount: {}", e)))?;
        if output.status.success() {
            info!("Unmounted {}", self.mount_point.display());
            Ok(())
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr);
            warn!("umount {} failed: {}", self.mount_point.display(), stderr.trim());
            Err(StorageError::Transient(format!(
                "umount {}: {}",
                self.mount_point.display(),
                stderr.trim()
            )))
        }
    }
}
