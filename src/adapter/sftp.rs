//! SFTP adapter
//!
//! One SSH connection and one SFTP subsystem channel per adapter, shared by
//! every operation (the russh-sftp session multiplexes requests). The server
//! host key can be pinned by SHA256 fingerprint. Without a pin, the key seen
//! on first contact is recorded in a known-hosts file and required from then on.

use std::collections::HashMap;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use parking_lot::RwLock;
use russh::client;
use russh::keys::key::PrivateKeyWithHashAlg;
use russh::keys::{PublicKey, PublicKeyBase64};
use russh_sftp::client::error::Error as SftpErrorInner;
use russh_sftp::client::fs::Metadata;
use russh_sftp::client::SftpSession;
use russh_sftp::protocol::OpenFlags;
use sha2::{Digest, Sha256};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::{BoxFuture, ByteReader, StorageAdapter};
use crate::error::{StorageError, StorageResult};
use crate::path_utils::{ancestors, is_root, join, normalize};
use crate::types::{guess_content_type, BackendKind, EntryDescriptor, EntryKind};

/// Connection timeout for the TCP connect + SSH handshake
const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// SFTP authentication
#[derive(Debug, Clone)]
pub enum SftpAuth {
    Password(String),
    Key {
        path: String,
        passphrase: Option<String>,
    },
}

/// SFTP connection parameters
#[derive(Debug, Clone)]
pub struct SftpSettings {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub auth: SftpAuth,
    /// Remote directory acting as the root; the login directory when unset
    pub root: Option<String>,
    /// Expected `SHA256:...` host key fingerprint
    pub host_key_fingerprint: Option<String>,
    /// Where first-seen host keys are recorded; unpinned hosts are refused
    /// when neither a pin nor this file is available
    pub known_hosts: Option<PathBuf>,
}

/// Known-hosts file name inside the config directory
pub const KNOWN_HOSTS_FILE: &str = "known_hosts";

/// Outcome of checking a host key against the known-hosts file
#[derive(Debug, Clone, PartialEq)]
pub enum HostKeyVerification {
    Verified,
    /// First contact; the key has been recorded
    Learned,
    Changed { expected: String },
}

/// Trust-on-first-use host key store. One line per host:
/// `[host]:port SHA256:<base64>`.
pub struct KnownHosts {
    hosts: RwLock<HashMap<String, String>>,
    path: PathBuf,
}

impl KnownHosts {
    /// Load the file at `path`; a missing file is an empty store.
    pub fn open(path: PathBuf) -> StorageResult<Self> {
        let mut hosts = HashMap::new();
        match fs::read_to_string(&path) {
            Ok(contents) => {
                for line in contents.lines() {
                    let line = line.trim();
                    if line.is_empty() || line.starts_with('#') {
                        continue;
                    }
                    if let Some((host, fp)) = line.split_once(char::is_whitespace) {
                        hosts.insert(host.to_string(), fp.trim().to_string());
                    }
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(StorageError::from_io(e, &path.to_string_lossy())),
        }
        debug!("Loaded {} known host key(s) from {:?}", hosts.len(), path);
        Ok(Self {
            hosts: RwLock::new(hosts),
            path,
        })
    }

    fn host_key(host: &str, port: u16) -> String {
        format!("[{}]:{}", host.to_lowercase(), port)
    }

    /// Check `fingerprint` for `host:port`, recording it on first contact.
    pub fn verify(&self, host: &str, port: u16, fingerprint: &str) -> StorageResult<HostKeyVerification> {
        let key = Self::host_key(host, port);
        if let Some(expected) = self.hosts.read().get(&key) {
            return Ok(if fingerprint_matches(expected, fingerprint) {
                HostKeyVerification::Verified
            } else {
                HostKeyVerification::Changed {
                    expected: expected.clone(),
                }
            });
        }

        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(|e| StorageError::from_io(e, &key))?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|e| StorageError::from_io(e, &key))?;
        writeln!(file, "{} {}", key, fingerprint).map_err(|e| StorageError::from_io(e, &key))?;
        self.hosts.write().insert(key.clone(), fingerprint.to_string());
        info!("Recorded host key {} for {}", fingerprint, key);
        Ok(HostKeyVerification::Learned)
    }
}

/// SHA256 fingerprint of a host key, OpenSSH style (`SHA256:<base64>`)
pub fn fingerprint(key: &PublicKey) -> String {
    let key_bytes = key.public_key_bytes();
    let mut hasher = Sha256::new();
    hasher.update(&key_bytes);
    let hash = hasher.finalize();
    format!("SHA256:{}", BASE64.encode(hash).trim_end_matches('='))
}

/// Compare a configured pin with an observed fingerprint. The `SHA256:`
/// prefix and base64 padding are optional in the pin.
fn fingerprint_matches(expected: &str, actual: &str) -> bool {
    let strip = |s: &str| {
        s.trim()
            .trim_start_matches("SHA256:")
            .trim_end_matches('=')
            .to_string()
    };
    strip(expected) == strip(actual)
}

/// Client handler for russh callbacks
struct PinnedHostHandler {
    host: String,
    port: u16,
    expected: Option<String>,
    known_hosts: Option<PathBuf>,
}

impl client::Handler for PinnedHostHandler {
    type Error = russh::Error;

    async fn check_server_key(&mut self, server_public_key: &PublicKey) -> Result<bool, Self::Error> {
        let actual = fingerprint(server_public_key);
        match &self.expected {
            Some(expected) if fingerprint_matches(expected, &actual) => {
                debug!("Host key for {} matches pinned fingerprint", self.host);
                Ok(true)
            }
            Some(expected) => {
                warn!(
                    "Host key mismatch for {}: expected {}, got {}",
                    self.host, expected, actual
                );
                Ok(false)
            }
            None => {
                let Some(path) = &self.known_hosts else {
                    warn!("No pin or known-hosts file for {}, refusing {}", self.host, actual);
                    return Ok(false);
                };
                let verification = KnownHosts::open(path.clone())
                    .and_then(|store| store.verify(&self.host, self.port, &actual));
                match verification {
                    Ok(HostKeyVerification::Verified) | Ok(HostKeyVerification::Learned) => Ok(true),
                    Ok(HostKeyVerification::Changed { expected }) => {
                        warn!(
                            "Host key changed for {}: expected {}, got {}",
                            self.host, expected, actual
                        );
                        Ok(false)
                    }
                    Err(e) => {
                        warn!("Cannot check host key for {}: {}", self.host, e);
                        Ok(false)
                    }
                }
            }
        }
    }
}

/// Map SFTP errors to the storage taxonomy
fn map_sftp_error(err: SftpErrorInner, path: &str) -> StorageError {
    let err_str = err.to_string();
    if err_str.contains("No such file") || err_str.contains("not found") {
        StorageError::NotFound(path.to_string())
    } else if err_str.contains("Permission denied") {
        StorageError::PermissionDenied(path.to_string())
    } else if err_str.contains("Op unsupported") {
        StorageError::Unsupported(format!("{}: {}", path, err_str))
    } else {
        StorageError::Transient(format!("{}: {}", path, err_str))
    }
}

/// Remote path for a normalized backend path under `root`
fn remote_join(root: &str, normalized: &str) -> String {
    let root = root.trim_end_matches('/');
    if is_root(normalized) {
        if root.is_empty() {
            "/".to_string()
        } else {
            root.to_string()
        }
    } else {
        format!("{}{}", root, normalized)
    }
}

fn descriptor(path: &str, metadata: &Metadata, link_target: Option<String>) -> EntryDescriptor {
    let kind = if metadata.is_symlink() {
        EntryKind::Symlink
    } else if metadata.is_dir() {
        EntryKind::Directory
    } else {
        EntryKind::File
    };
    EntryDescriptor {
        name: crate::path_utils::file_name(path).to_string(),
        path: path.to_string(),
        size: if kind == EntryKind::Directory {
            0
        } else {
            metadata.size.unwrap_or(0)
        },
        modified_at: metadata.mtime.map(|t| t as i64).unwrap_or(0),
        kind,
        permissions_text: metadata
            .permissions
            .map(|p| format!("{:o}", p & 0o777))
            .unwrap_or_else(|| "000".to_string()),
        content_type: if kind == EntryKind::File {
            guess_content_type(path)
        } else {
            None
        },
        link_target,
    }
}

/// SFTP adapter
pub struct SftpAdapter {
    sftp: SftpSession,
    handle: Mutex<Option<client::Handle<PinnedHostHandler>>>,
    root: String,
    label: String,
}

impl SftpAdapter {
    /// Connect, authenticate and open the SFTP subsystem.
    pub async fn connect(settings: &SftpSettings) -> StorageResult<Self> {
        let addr = format!("{}:{}", settings.host, settings.port);
        info!("Connecting to SFTP server at {}", addr);

        let ssh_config = client::Config {
            inactivity_timeout: None,
            keepalive_interval: Some(Duration::from_secs(30)),
            keepalive_max: 3,
            ..Default::default()
        };
        let handler = PinnedHostHandler {
            host: settings.host.clone(),
            port: settings.port,
            expected: settings.host_key_fingerprint.clone(),
            known_hosts: settings.known_hosts.clone(),
        };

        let mut handle = tokio::time::timeout(
            CONNECT_TIMEOUT,
            client::connect(
                Arc::new(ssh_config),
                (settings.host.as_str(), settings.port),
                handler,
            ),
        )
        .await
        .map_err(|_| StorageError::Transient(format!("connection to {} timed out", addr)))?
        .map_err(|e| match e {
            russh::Error::UnknownKey => {
                StorageError::PermissionDenied(format!("host key rejected for {}", addr))
            }
            other => StorageError::Transient(format!("{}: {}", addr, other)),
        })?;

        debug!("SSH handshake completed");

        let authenticated = match &settings.auth {
            SftpAuth::Password(password) => handle
                .authenticate_password(&settings.username, password)
                .await
                .map_err(|e| StorageError::PermissionDenied(e.to_string()))?,
            SftpAuth::Key { path, passphrase } => {
                let key = russh::keys::load_secret_key(path, passphrase.as_deref())
                    .map_err(|e| StorageError::InvalidConfig(format!("private key: {}", e)))?;
                let key_with_hash = PrivateKeyWithHashAlg::new(Arc::new(key), None);
                handle
                    .authenticate_publickey(&settings.username, key_with_hash)
                    .await
                    .map_err(|e| StorageError::PermissionDenied(e.to_string()))?
            }
        };

        if !authenticated.success() {
            return Err(StorageError::PermissionDenied(format!(
                "authentication rejected by {} for {}",
                addr, settings.username
            )));
        }

        let channel = handle
            .channel_open_session()
            .await
            .map_err(|e| StorageError::Transient(e.to_string()))?;
        channel.request_subsystem(true, "sftp").await.map_err(|e| {
            StorageError::Unsupported(format!("Failed to request SFTP subsystem: {}", e))
        })?;
        let sftp = SftpSession::new(channel.into_stream())
            .await
            .map_err(|e| StorageError::Unsupported(e.to_string()))?;

        let root = match &settings.root {
            Some(root) if !root.trim().is_empty() => root.trim().to_string(),
            _ => sftp
                .canonicalize(".")
                .await
                .map_err(|e| map_sftp_error(e, "."))?,
        };

        info!("SFTP session open on {} (root {})", addr, root);
        Ok(Self {
            sftp,
            handle: Mutex::new(Some(handle)),
            label: format!("sftp://{}@{}{}", settings.username, addr, root),
            root,
        })
    }

    fn resolve(&self, path: &str) -> StorageResult<(String, String)> {
        let normalized = normalize(path)?;
        let remote = remote_join(&self.root, &normalized);
        Ok((normalized, remote))
    }

    async fn lstat(&self, normalized: &str, remote: &str) -> StorageResult<EntryDescriptor> {
        let metadata = self
            .sftp
            .symlink_metadata(remote)
            .await
            .map_err(|e| map_sftp_error(e, normalized))?;
        let link_target = if metadata.is_symlink() {
            self.sftp.read_link(remote).await.ok()
        } else {
            None
        };
        Ok(descriptor(normalized, &metadata, link_target))
    }

    /// Create `normalized` as a directory unless it already is one.
    async fn ensure_dir(&self, normalized: &str) -> StorageResult<()> {
        let remote = remote_join(&self.root, normalized);
        match self.sftp.metadata(&remote).await {
            Ok(meta) if meta.is_dir() => Ok(()),
            Ok(_) => Err(StorageError::Conflict(format!("a file exists at {}", normalized))),
            Err(_) => self
                .sftp
                .create_dir(&remote)
                .await
                .map_err(|e| map_sftp_error(e, normalized)),
        }
    }

    fn delete_tree<'a>(&'a self, normalized: &'a str) -> BoxFuture<'a, StorageResult<()>> {
        Box::pin(async move {
            let remote = remote_join(&self.root, normalized);
            let entry = self.lstat(normalized, &remote).await?;
            if entry.kind == EntryKind::Directory {
                for child in self.list(normalized).await? {
                    self.delete_tree(&child.path).await?;
                }
                self.sftp
                    .remove_dir(&remote)
                    .await
                    .map_err(|e| map_sftp_error(e, normalized))
            } else {
                self.sftp
                    .remove_file(&remote)
                    .await
                    .map_err(|e| map_sftp_error(e, normalized))
            }
        })
    }
}

#[async_trait]
impl StorageAdapter for SftpAdapter {
    fn kind(&self) -> BackendKind {
        BackendKind::Sftp
    }

    fn root_path(&self) -> String {
        self.label.clone()
    }

    async fn list(&self, path: &str) -> StorageResult<Vec<EntryDescriptor>> {
        let (normalized, remote) = self.resolve(path)?;
        debug!("Listing directory: {}", remote);

        let read_dir = self
            .sftp
            .read_dir(&remote)
            .await
            .map_err(|e| map_sftp_error(e, &normalized))?;

        let mut entries = Vec::new();
        for entry in read_dir {
            let name = entry.file_name();
            if name == "." || name == ".." {
                continue;
            }
            let child = join(&normalized, &name);
            let metadata = entry.metadata();
            let link_target = if metadata.is_symlink() {
                self.sftp.read_link(&remote_join(&self.root, &child)).await.ok()
            } else {
                None
            };
            entries.push(descriptor(&child, &metadata, link_target));
        }
        Ok(entries)
    }

    async fn stat(&self, path: &str) -> StorageResult<EntryDescriptor> {
        let (normalized, remote) = self.resolve(path)?;
        self.lstat(&normalized, &remote).await
    }

    async fn read(&self, path: &str) -> StorageResult<ByteReader> {
        let (normalized, remote) = self.resolve(path)?;
        let file = self
            .sftp
            .open(&remote)
            .await
            .map_err(|e| map_sftp_error(e, &normalized))?;
        Ok(Box::new(file))
    }

    async fn write(&self, path: &str, mut data: ByteReader) -> StorageResult<u64> {
        let (normalized, remote) = self.resolve(path)?;
        if is_root(&normalized) {
            return Err(StorageError::Conflict("cannot overwrite the root".into()));
        }
        for dir in ancestors(&normalized) {
            self.ensure_dir(&dir).await?;
        }

        let mut file = self
            .sftp
            .open_with_flags(
                &remote,
                OpenFlags::CREATE | OpenFlags::TRUNCATE | OpenFlags::WRITE,
            )
            .await
            .map_err(|e| map_sftp_error(e, &normalized))?;
        let written = tokio::io::copy(&mut data, &mut file)
            .await
            .map_err(|e| StorageError::from_io(e, &normalized))?;
        file.shutdown()
            .await
            .map_err(|e| StorageError::from_io(e, &normalized))?;

        debug!("Uploaded {} bytes to {}", written, remote);
        Ok(written)
    }

    async fn delete(&self, path: &str) -> StorageResult<()> {
        let (normalized, _) = self.resolve(path)?;
        if is_root(&normalized) {
            return Err(StorageError::PermissionDenied(
                "refusing to delete the storage root".into(),
            ));
        }
        self.delete_tree(&normalized).await?;
        info!("Deleted {}", normalized);
        Ok(())
    }

    async fn make_container(&self, path: &str) -> StorageResult<()> {
        let (normalized, _) = self.resolve(path)?;
        if is_root(&normalized) {
            return Ok(());
        }
        for dir in ancestors(&normalized) {
            self.ensure_dir(&dir).await?;
        }
        self.ensure_dir(&normalized).await
    }

    async fn rename(&self, src: &str, dst: &str) -> StorageResult<()> {
        let (src_norm, src_remote) = self.resolve(src)?;
        let (dst_norm, dst_remote) = self.resolve(dst)?;
        for dir in ancestors(&dst_norm) {
            self.ensure_dir(&dir).await?;
        }
        self.sftp
            .rename(&src_remote, &dst_remote)
            .await
            .map_err(|e| map_sftp_error(e, &src_norm))
    }

    async fn close(&self) -> StorageResult<()> {
        if let Err(e) = self.sftp.close().await {
            debug!("SFTP close: {}", e);
        }
        if let Some(handle) = self.handle.lock().await.take() {
            handle
                .disconnect(russh::Disconnect::ByApplication, "", "English")
                .await
                .map_err(|e| StorageError::Transient(e.to_string()))?;
            info!("Disconnected {}", self.label);
        }
        Ok(())
    }
}
