//! Configuration Storage
//!
//! Handles reading/writing configuration files to disk.
//! Config location: ~/.polystore on macOS/Linux, %APPDATA%\Polystore on Windows

use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use tokio::fs;
use tokio::io::AsyncWriteExt;

use super::types::{BackendConfig, DEFAULT_LOCAL_ID};
use crate::error::StorageError;
use crate::types::BackendKind;
use crate::security::SecurityPolicy;

/// Configuration storage errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to determine config directory")]
    NoConfigDir,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl From<ConfigError> for StorageError {
    fn from(err: ConfigError) -> Self {
        match err {
            ConfigError::Io(e) => StorageError::from(e),
            other => StorageError::InvalidConfig(other.to_string()),
        }
    }
}

/// Backend definitions file name inside the config directory
pub const STORAGES_FILE: &str = "storages.json";

/// Security policy file name inside the config directory
pub const SECURITY_FILE: &str = "security.json";

/// Get the Polystore configuration directory
/// Returns %APPDATA%\Polystore on Windows, ~/.polystore on macOS/Linux
pub fn config_dir() -> Result<PathBuf, ConfigError> {
    #[cfg(windows)]
    {
        if let Some(app_data) = dirs::config_dir() {
            return Ok(app_data.join("Polystore"));
        }
        dirs::home_dir()
            .map(|home| home.join(".polystore"))
            .ok_or(ConfigError::NoConfigDir)
    }

    #[cfg(not(windows))]
    {
        dirs::home_dir()
            .map(|home| home.join(".polystore"))
            .ok_or(ConfigError::NoConfigDir)
    }
}

/// Get the backend configurations file path
pub fn storages_file() -> Result<PathBuf, ConfigError> {
    Ok(config_dir()?.join(STORAGES_FILE))
}

/// Get the security policy file path
pub fn security_file() -> Result<PathBuf, ConfigError> {
    Ok(config_dir()?.join(SECURITY_FILE))
}

/// Write to a temp file first, then rename (atomic write)
async fn write_json_atomic<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<(), ConfigError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).await?;
    }

    let temp_path = path.with_extension("json.tmp");
    let json = serde_json::to_string_pretty(value)?;

    let mut file = fs::File::create(&temp_path).await?;
    file.write_all(json.as_bytes()).await?;
    file.sync_all().await?;

    fs::rename(&temp_path, path).await?;
    Ok(())
}

/// Copy a file aside with a timestamp suffix
async fn backup_file(path: &Path) -> Result<PathBuf, ConfigError> {
    let backup_path = path.with_extension(format!(
        "json.backup.{}",
        chrono::Utc::now().format("%Y%m%d_%H%M%S")
    ));
    if fs::metadata(path).await.is_ok() {
        fs::copy(path, &backup_path).await?;
    }
    Ok(backup_path)
}

async fn backup_and_warn(path: &Path, reason: &str) {
    match backup_file(path).await {
        Ok(backup_path) => {
            tracing::warn!("{}; original backed up to {:?}", reason, backup_path);
        }
        Err(backup_err) => {
            tracing::error!("{}; failed to back up original: {}", reason, backup_err);
        }
    }
}

/// Read a JSON document, `None` when the file does not exist.
async fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<Result<T, serde_json::Error>>, ConfigError> {
    match fs::read_to_string(path).await {
        Ok(contents) => Ok(Some(serde_json::from_str::<T>(&contents))),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(ConfigError::Io(e)),
    }
}

/// The local backend rooted at the user's home directory
fn default_local() -> Result<BackendConfig, ConfigError> {
    let home = dirs::home_dir().ok_or(ConfigError::NoConfigDir)?;
    Ok(BackendConfig::local(DEFAULT_LOCAL_ID, home.to_string_lossy())
        .with_display_name("Local")
        .as_default())
}

/// Backend configuration storage (`storages.json`)
pub struct ConfigStorage {
    path: PathBuf,
    /// Entries from the last load that did not parse; written back verbatim
    unparsed: Mutex<Vec<Value>>,
}

impl ConfigStorage {
    /// Create a new storage manager with default path
    pub fn new() -> Result<Self, ConfigError> {
        Ok(Self::with_path(storages_file()?))
    }

    /// Create storage manager with custom path (for testing)
    pub fn with_path(path: PathBuf) -> Self {
        Self {
            path,
            unparsed: Mutex::new(Vec::new()),
        }
    }

    /// Load backend configurations from disk.
    ///
    /// - missing file: generate, persist and return one default local backend
    /// - not a JSON array: back up the file and treat it as missing
    /// - individual malformed entries are skipped but kept for the next save
    /// - no local backend left: the default local backend is added back
    pub async fn load(&self) -> Result<Vec<BackendConfig>, ConfigError> {
        let values = match read_json::<Vec<Value>>(&self.path).await? {
            Some(Ok(values)) => values,
            Some(Err(e)) => {
                backup_and_warn(&self.path, &format!("Storage config corrupted: {}", e)).await;
                return self.generate_default().await;
            }
            None => return self.generate_default().await,
        };

        let mut configs = Vec::with_capacity(values.len());
        let mut rejected = Vec::new();
        for (index, value) in values.into_iter().enumerate() {
            match serde_json::from_value::<BackendConfig>(value.clone()) {
                Ok(config) => configs.push(config),
                Err(e) => {
                    tracing::warn!("Skipping malformed backend definition #{}: {}", index, e);
                    rejected.push(value);
                }
            }
        }
        if !rejected.is_empty() {
            backup_and_warn(
                &self.path,
                &format!("{} backend definition(s) could not be parsed", rejected.len()),
            )
            .await;
        }
        *self.unparsed.lock() = rejected;

        if !configs.iter().any(|c| c.backend_kind().ok() == Some(BackendKind::Local)) {
            let mut fallback = default_local()?;
            if configs.iter().any(|c| c.is_default) {
                fallback.is_default = false;
            }
            tracing::warn!("No local backend configured, adding '{}'", fallback.id);
            configs.push(fallback);
            self.save(&configs).await?;
        }

        tracing::info!("Loaded {} backend definition(s) from {:?}", configs.len(), self.path);
        Ok(configs)
    }

    async fn generate_default(&self) -> Result<Vec<BackendConfig>, ConfigError> {
        self.unparsed.lock().clear();
        let configs = vec![default_local()?];
        self.save(&configs).await?;
        tracing::info!("Generated default local backend at {:?}", self.path);
        Ok(configs)
    }

    /// Save backend configurations to disk, followed by any entries the
    /// last load could not parse.
    pub async fn save(&self, configs: &[BackendConfig]) -> Result<(), ConfigError> {
        let mut values = configs
            .iter()
            .map(serde_json::to_value)
            .collect::<Result<Vec<_>, _>>()?;
        values.extend(self.unparsed.lock().iter().cloned());
        write_json_atomic(&self.path, &values).await
    }

    /// Check if config file exists
    pub async fn exists(&self) -> bool {
        fs::metadata(&self.path).await.is_ok()
    }

    /// Get config file path
    pub fn path(&self) -> &PathBuf {
        &self.path
    }

    /// Create a backup of the current config
    pub async fn backup(&self) -> Result<PathBuf, ConfigError> {
        backup_file(&self.path).await
    }
}

/// Blocked-range policy storage (`security.json`)
pub struct PolicyStorage {
    path: PathBuf,
}

impl PolicyStorage {
    pub fn new() -> Result<Self, ConfigError> {
        Ok(Self {
            path: security_file()?,
        })
    }

    pub fn with_path(path: PathBuf) -> Self {
        Self { path }
    }

    /// Load the policy; missing or corrupted files yield the blocking default.
    pub async fn load(&self) -> Result<SecurityPolicy, ConfigError> {
        match read_json::<SecurityPolicy>(&self.path).await? {
            Some(Ok(policy)) => Ok(policy),
            Some(Err(e)) => {
                backup_and_warn(&self.path, &format!("Security policy corrupted: {}", e)).await;
                Ok(SecurityPolicy::default())
            }
            None => Ok(SecurityPolicy::default()),
        }
    }

    pub async fn save(&self, policy: &SecurityPolicy) -> Result<(), ConfigError> {
        write_json_atomic(&self.path, policy).await
    }

    pub fn path(&self) -> &PathBuf {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::BackendKind;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_load_nonexistent_generates_local() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("storages.json");
        let storage = ConfigStorage::with_path(path.clone());

        let configs = storage.load().await.unwrap();
        assert_eq!(configs.len(), 1);
        assert_eq!(configs[0].id, DEFAULT_LOCAL_ID);
        assert_eq!(configs[0].backend_kind().unwrap(), BackendKind::Local);
        assert!(configs[0].is_default);
        // Persisted on first run
        assert!(path.exists());
    }

    #[tokio::test]
    async fn test_save_and_load() {
        let temp = tempdir().unwrap();
        let storage = ConfigStorage::with_path(temp.path().join("storages.json"));

        let configs = vec![
            BackendConfig::local("a", "/tmp"),
            BackendConfig::new("b", BackendKind::Redis).with_param("address", "redis.example.com:6379"),
        ];
        storage.save(&configs).await.unwrap();

        let loaded = storage.load().await.unwrap();
        assert_eq!(loaded, configs);
    }

    #[tokio::test]
    async fn test_malformed_entry_skipped() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("storages.json");
        std::fs::write(
            &path,
            r#"[{"id":"a","kind":"local","parameters":{"root":"/tmp"}},{"kind":"s3"},{"id":"c","kind":"ftp"}]"#,
        )
        .unwrap();

        let loaded = ConfigStorage::with_path(path).load().await.unwrap();
        let ids: Vec<_> = loaded.iter().map(|c| c.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "c"]);
    }

    #[tokio::test]
    async fn test_malformed_entry_survives_save() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("storages.json");
        std::fs::write(
            &path,
            r#"[{"id":"a","kind":"local","parameters":{"root":"/tmp"}},{"kind":"s3","parameters":{"bucket":"keep-me"}}]"#,
        )
        .unwrap();

        let storage = ConfigStorage::with_path(path.clone());
        let mut configs = storage.load().await.unwrap();
        configs.push(BackendConfig::local("b", "/srv"));
        storage.save(&configs).await.unwrap();

        let raw: Vec<Value> = serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(raw.len(), 3);
        assert_eq!(raw[2]["parameters"]["bucket"], "keep-me");

        let ids: Vec<_> = storage
            .load()
            .await
            .unwrap()
            .into_iter()
            .map(|c| c.id)
            .collect();
        assert_eq!(ids, vec!["a".to_string(), "b".to_string()]);
    }

    #[tokio::test]
    async fn test_empty_file_gets_local_backend() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("storages.json");
        std::fs::write(&path, "[]").unwrap();

        let loaded = ConfigStorage::with_path(path.clone()).load().await.unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].id, DEFAULT_LOCAL_ID);
        assert!(loaded[0].is_default);
        assert!(std::fs::read_to_string(&path).unwrap().contains(DEFAULT_LOCAL_ID));
    }

    #[tokio::test]
    async fn test_local_backend_added_beside_remote_default() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("storages.json");
        std::fs::write(
            &path,
            r#"[{"id":"cache","kind":"redis","isDefault":true,"parameters":{"address":"localhost:6379"}}]"#,
        )
        .unwrap();

        let loaded = ConfigStorage::with_path(path).load().await.unwrap();
        let ids: Vec<_> = loaded.iter().map(|c| c.id.as_str()).collect();
        assert_eq!(ids, vec!["cache", DEFAULT_LOCAL_ID]);
        assert!(loaded[0].is_default);
        assert!(!loaded[1].is_default);
    }

    #[tokio::test]
    async fn test_corrupted_file_backed_up() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("storages.json");
        std::fs::write(&path, "{not json").unwrap();

        let loaded = ConfigStorage::with_path(path).load().await.unwrap();
        assert_eq!(loaded.len(), 1);

        let backups = std::fs::read_dir(temp.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().contains("backup"))
            .count();
        assert_eq!(backups, 1);
    }

    #[tokio::test]
    async fn test_policy_default_and_round_trip() {
        let temp = tempdir().unwrap();
        let storage = PolicyStorage::with_path(temp.path().join("security.json"));

        assert!(!storage.load().await.unwrap().allow_local_addresses);

        storage
            .save(&SecurityPolicy {
                allow_local_addresses: true,
            })
            .await
            .unwrap();
        assert!(storage.load().await.unwrap().allow_local_addresses);

        let raw = std::fs::read_to_string(storage.path()).unwrap();
        assert!(raw.contains("allowLocalAddresses"));
    }
}
