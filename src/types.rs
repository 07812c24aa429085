//! Shared storage data types

use serde::{Deserialize, Serialize};

use crate::path_utils::file_name;

/// Entry kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryKind {
    File,
    Directory,
    Symlink,
}

impl EntryKind {
    /// Get icon name for UI
    pub fn icon(&self) -> &'static str {
        match self {
            EntryKind::File => "file",
            EntryKind::Directory => "folder",
            EntryKind::Symlink => "link",
        }
    }

    pub fn is_dir(&self) -> bool {
        matches!(self, EntryKind::Directory)
    }
}

/// Snapshot of one filesystem entry, as produced by every adapter.
///
/// Built fresh on each `list`/`stat`; the core never caches or mutates these.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntryDescriptor {
    /// File name (last path segment, empty for the root)
    pub name: String,
    /// Backend-relative path: forward slashes, always rooted (`/a/b.txt`)
    pub path: String,
    /// Size in bytes (0 for directories on most backends)
    pub size: u64,
    /// Last modified time, Unix seconds. 0 means unknown.
    pub modified_at: i64,
    pub kind: EntryKind,
    /// Advisory permission text (octal on POSIX-like backends)
    pub permissions_text: String,
    /// Best-effort MIME type
    pub content_type: Option<String>,
    /// Symlink target when `kind == Symlink`
    pub link_target: Option<String>,
}

impl EntryDescriptor {
    /// Descriptor for a regular file; content type guessed from the name.
    pub fn file(path: &str, size: u64, modified_at: i64) -> Self {
        Self {
            name: file_name(path).to_string(),
            path: path.to_string(),
            size,
            modified_at,
            kind: EntryKind::File,
            permissions_text: String::new(),
            content_type: guess_content_type(path),
            link_target: None,
        }
    }

    pub fn directory(path: &str, modified_at: i64) -> Self {
        Self {
            name: file_name(path).to_string(),
            path: path.to_string(),
            size: 0,
            modified_at,
            kind: EntryKind::Directory,
            permissions_text: String::new(),
            content_type: None,
            link_target: None,
        }
    }

    pub fn with_permissions(mut self, permissions: impl Into<String>) -> Self {
        self.permissions_text = permissions.into();
        self
    }

    pub fn is_dir(&self) -> bool {
        self.kind.is_dir()
    }
}

/// Best-effort MIME type from the file extension.
pub fn guess_content_type(path: &str) -> Option<String> {
    mime_guess::from_path(path).first().map(|m| m.to_string())
}

/// Free/total capacity of a backend. `None` means the backend cannot tell.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SpaceInfo {
    pub available: Option<u64>,
    pub total: Option<u64>,
}

impl SpaceInfo {
    pub const UNKNOWN: SpaceInfo = SpaceInfo {
        available: None,
        total: None,
    };

    pub fn known(available: u64, total: u64) -> Self {
        Self {
            available: Some(available),
            total: Some(total),
        }
    }
}

/// Storage kinds with a registered adapter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    Local,
    S3,
    Gdrive,
    Sftp,
    Nfs,
    Redis,
}

impl BackendKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackendKind::Local => "local",
            BackendKind::S3 => "s3",
            BackendKind::Gdrive => "gdrive",
            BackendKind::Sftp => "sftp",
            BackendKind::Nfs => "nfs",
            BackendKind::Redis => "redis",
        }
    }

    /// Icon name shown when a configuration does not set one
    pub fn default_icon(&self) -> &'static str {
        match self {
            BackendKind::Local => "hard-drive",
            BackendKind::S3 => "bucket",
            BackendKind::Gdrive => "cloud",
            BackendKind::Sftp => "server",
            BackendKind::Nfs => "network",
            BackendKind::Redis => "database",
        }
    }

    /// Parameter key holding the operator-supplied network endpoint, if the
    /// kind reaches a host chosen by configuration.
    pub fn endpoint_parameter(&self) -> Option<&'static str> {
        match self {
            BackendKind::Local | BackendKind::Gdrive => None,
            BackendKind::S3 => Some("endpoint"),
            BackendKind::Sftp => Some("host"),
            BackendKind::Nfs => Some("server"),
            BackendKind::Redis => Some("address"),
        }
    }
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for BackendKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "local" => Ok(BackendKind::Local),
            "s3" => Ok(BackendKind::S3),
            "gdrive" | "googledrive" => Ok(BackendKind::Gdrive),
            "sftp" => Ok(BackendKind::Sftp),
            "nfs" => Ok(BackendKind::Nfs),
            "redis" => Ok(BackendKind::Redis),
            other => Err(format!("unknown backend kind '{}'", other)),
        }
    }
}

/// Constants for streaming operations
pub mod constants {
    /// Buffer size for streaming copies (256 KB)
    pub const STREAM_BUFFER_SIZE: usize = 256 * 1024;

    /// Chunk size for archive entry pipes (64 KB)
    pub const ARCHIVE_CHUNK_SIZE: usize = 64 * 1024;

    /// Number of chunks buffered per archive entry pipe
    pub const ARCHIVE_PIPE_DEPTH: usize = 8;

    /// Maximum concurrent background operations
    pub const MAX_CONCURRENT_OPERATIONS: usize = 3;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backend_kind_parse() {
        assert_eq!("local".parse::<BackendKind>().unwrap(), BackendKind::Local);
        assert_eq!("S3".parse::<BackendKind>().unwrap(), BackendKind::S3);
        assert!("ftp-ish".parse::<BackendKind>().is_err());
    }

    #[test]
    fn test_file_descriptor_fields() {
        let entry = EntryDescriptor::file("/docs/report.pdf", 42, 0);
        assert_eq!(entry.name, "report.pdf");
        assert_eq!(entry.kind, EntryKind::File);
        assert_eq!(entry.content_type.as_deref(), Some("application/pdf"));
        assert_eq!(entry.modified_at, 0);
    }

    #[test]
    fn test_descriptor_serializes_camel_case() {
        let entry = EntryDescriptor::directory("/a", 10);
        let json = serde_json::to_value(&entry).unwrap();
        assert_eq!(json["modifiedAt"], 10);
        assert_eq!(json["kind"], "directory");
        assert!(json.get("permissionsText").is_some());
    }

    #[test]
    fn test_unknown_space_is_not_zero() {
        let space = SpaceInfo::UNKNOWN;
        assert_eq!(space.available, None);
        assert_ne!(space, SpaceInfo::known(0, 0));
    }
}
