//! Archive format detection

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{StorageError, StorageResult};

/// Recognized name suffixes, compound ones before ".tar"
const SUFFIXES: &[(&str, ArchiveFormat)] = &[
    (".tar.gz", ArchiveFormat::TarGz),
    (".tgz", ArchiveFormat::TarGz),
    (".tar.zst", ArchiveFormat::TarZst),
    (".tzst", ArchiveFormat::TarZst),
    (".tar", ArchiveFormat::Tar),
    (".zip", ArchiveFormat::Zip),
];

/// Supported container formats
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ArchiveFormat {
    #[serde(rename = "zip")]
    Zip,
    #[serde(rename = "tar")]
    Tar,
    #[serde(rename = "tar.gz", alias = "tgz")]
    TarGz,
    #[serde(rename = "tar.zst", alias = "tzst")]
    TarZst,
}

impl ArchiveFormat {
    pub const ALL: [ArchiveFormat; 4] = [
        ArchiveFormat::Zip,
        ArchiveFormat::Tar,
        ArchiveFormat::TarGz,
        ArchiveFormat::TarZst,
    ];

    /// Canonical file extension, without the leading dot
    pub fn extension(&self) -> &'static str {
        match self {
            ArchiveFormat::Zip => "zip",
            ArchiveFormat::Tar => "tar",
            ArchiveFormat::TarGz => "tar.gz",
            ArchiveFormat::TarZst => "tar.zst",
        }
    }

    pub fn is_tar(&self) -> bool {
        !matches!(self, ArchiveFormat::Zip)
    }

    /// Detect the format from a file name.
    pub fn from_path(path: &str) -> StorageResult<Self> {
        let name = crate::path_utils::file_name(path).to_lowercase();
        SUFFIXES
            .iter()
            .find(|(suffix, _)| name.ends_with(suffix) && name.len() > suffix.len())
            .map(|(_, format)| *format)
            .ok_or_else(|| {
                StorageError::Unsupported(format!(
                    "archive format '{}'",
                    detected_extension(&name)
                ))
            })
    }

    /// `name` with this format's extension removed.
    pub fn strip_extension<'a>(&self, name: &'a str) -> &'a str {
        let lower = name.to_ascii_lowercase();
        SUFFIXES
            .iter()
            .filter(|(_, format)| format == self)
            .find(|(suffix, _)| lower.ends_with(suffix) && name.len() > suffix.len())
            .map(|(suffix, _)| &name[..name.len() - suffix.len()])
            .unwrap_or(name)
    }
}

impl fmt::Display for ArchiveFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.extension())
    }
}

impl FromStr for ArchiveFormat {
    type Err = StorageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim_start_matches('.').to_lowercase().as_str() {
            "zip" => Ok(ArchiveFormat::Zip),
            "tar" => Ok(ArchiveFormat::Tar),
            "tar.gz" | "tgz" | "gzip" => Ok(ArchiveFormat::TarGz),
            "tar.zst" | "tzst" | "zstd" => Ok(ArchiveFormat::TarZst),
            other => Err(StorageError::Unsupported(format!("archive format '{}'", other))),
        }
    }
}

/// Extension as it appears in the name, for error messages
fn detected_extension(name: &str) -> String {
    match name.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() => format!(".{}", ext),
        _ => "(none)".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_detect_from_path() {
        assert_eq!(ArchiveFormat::from_path("/out/a.zip").unwrap(), ArchiveFormat::Zip);
        assert_eq!(ArchiveFormat::from_path("/b.TAR").unwrap(), ArchiveFormat::Tar);
        assert_eq!(ArchiveFormat::from_path("c.tar.gz").unwrap(), ArchiveFormat::TarGz);
        assert_eq!(ArchiveFormat::from_path("c.tgz").unwrap(), ArchiveFormat::TarGz);
        assert_eq!(ArchiveFormat::from_path("d.tar.zst").unwrap(), ArchiveFormat::TarZst);
    }

    #[test]
    fn test_unsupported_names_extension() {
        match ArchiveFormat::from_path("/files/e.rar") {
            Err(StorageError::Unsupported(msg)) => assert!(msg.contains(".rar")),
            other => panic!("unexpected: {:?}", other),
        }
        assert!(ArchiveFormat::from_path("/files/noext").is_err());
        assert!(ArchiveFormat::from_path("f.gz").is_err());
    }

    #[test]
    fn test_strip_extension() {
        assert_eq!(ArchiveFormat::TarGz.strip_extension("photos.tar.gz"), "photos");
        assert_eq!(ArchiveFormat::TarGz.strip_extension("photos.TGZ"), "photos");
        assert_eq!(ArchiveFormat::Zip.strip_extension("notes"), "notes");
    }

    #[test]
    fn test_parse_and_serde() {
        assert_eq!("tgz".parse::<ArchiveFormat>().unwrap(), ArchiveFormat::TarGz);
        assert!("7z".parse::<ArchiveFormat>().is_err());
        assert_eq!(serde_json::to_string(&ArchiveFormat::TarZst).unwrap(), "\"tar.zst\"");
        let parsed: ArchiveFormat = serde_json::from_str("\"tgz\"").unwrap();
        assert_eq!(parsed, ArchiveFormat::TarGz);
    }
}
