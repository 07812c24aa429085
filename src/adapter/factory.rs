//! Adapter construction keyed by backend kind
//!
//! Network-addressable kinds have their endpoint checked by the
//! [`EndpointValidator`] before any connection is attempted.

use std::path::PathBuf;
use std::sync::Arc;

use tracing::{debug, info};

use super::gdrive::{DriveAdapter, DriveCredentials};
use super::kv::{KvAdapter, RedisKv, DEFAULT_NAMESPACE};
use super::local::LocalAdapter;
use super::nfs::{NfsAdapter, NfsSettings};
use super::object::{ObjectAdapter, S3Settings};
use super::sftp::{SftpAdapter, SftpAuth, SftpSettings, KNOWN_HOSTS_FILE};
use super::StorageAdapter;
use crate::config::{config_dir, BackendConfig};
use crate::error::{StorageError, StorageResult};
use crate::security::EndpointValidator;
use crate::types::BackendKind;

/// Builds live adapters from declarative configurations
pub struct AdapterFactory;

impl AdapterFactory {
    /// Validate the endpoint (if any) and construct the adapter.
    pub async fn build(
        config: &BackendConfig,
        validator: &EndpointValidator,
    ) -> StorageResult<Arc<dyn StorageAdapter>> {
        let kind = config.backend_kind()?;

        if let Some(endpoint) = config.endpoint() {
            debug!("Validating endpoint {} for backend {}", endpoint, config.id);
            validator.validate(&endpoint).await?;
        }

        let adapter: Arc<dyn StorageAdapter> = match kind {
            BackendKind::Local => Arc::new(Self::local(config).await?),
            BackendKind::S3 => Arc::new(Self::s3(config)?),
            BackendKind::Gdrive => Arc::new(Self::gdrive(config).await?),
            BackendKind::Sftp => Arc::new(Self::sftp(config).await?),
            BackendKind::Nfs => Arc::new(Self::nfs(config).await?),
            BackendKind::Redis => Arc::new(Self::redis(config).await?),
        };

        info!("Constructed {} adapter '{}' ({})", kind, config.id, adapter.root_path());
        Ok(adapter)
    }

    async fn local(config: &BackendConfig) -> StorageResult<LocalAdapter> {
        let root = expand_home(&config.require("root")?);
        LocalAdapter::open(root).await
    }

    fn s3(config: &BackendConfig) -> StorageResult<ObjectAdapter> {
        let settings = S3Settings {
            bucket: config.require("bucket")?,
            region: config.param_str("region").unwrap_or_else(|| "us-east-1".to_string()),
            access_key_id: config.require("accessKeyId")?,
            secret_access_key: config.require("secretAccessKey")?,
            endpoint: config.param_str("endpoint"),
            allow_http: config.param_bool("allowHttp"),
        };
        let prefix = config.param_str("prefix").unwrap_or_default();
        ObjectAdapter::s3(&settings, &prefix)
    }

    async fn gdrive(config: &BackendConfig) -> StorageResult<DriveAdapter> {
        let credentials = DriveCredentials {
            client_id: config.require("clientId")?,
            client_secret: config.require("clientSecret")?,
            refresh_token: config.require("refreshToken")?,
        };
        DriveAdapter::connect(credentials, config.param_str("rootFolderId")).await
    }

    async fn sftp(config: &BackendConfig) -> StorageResult<SftpAdapter> {
        let auth = match (config.param_str("password"), config.param_str("privateKeyPath")) {
            (_, Some(path)) => SftpAuth::Key {
                path: expand_home(&path).to_string_lossy().to_string(),
                passphrase: config.param_str("passphrase"),
            },
            (Some(password), None) => SftpAuth::Password(password),
            (None, None) => {
                return Err(StorageError::InvalidConfig(format!(
                    "backend '{}' needs 'password' or 'privateKeyPath'",
                    config.id
                )))
            }
        };
        let settings = SftpSettings {
            host: config.require("host")?,
            port: config.param_u16("port")?.unwrap_or(22),
            username: config.require("username")?,
            auth,
            root: config.param_str("root"),
            host_key_fingerprint: config.param_str("hostKeyFingerprint"),
            known_hosts: config_dir().ok().map(|dir| dir.join(KNOWN_HOSTS_FILE)),
        };
        SftpAdapter::connect(&settings).await
    }

    async fn nfs(config: &BackendConfig) -> StorageResult<NfsAdapter> {
        let settings = NfsSettings {
            server: config.require("server")?,
            export: config.require("export")?,
            mount_point: expand_home(&config.require("mountPoint")?),
            read_only: config.param_bool("readOnly"),
            options: config.param_str("options"),
        };
        NfsAdapter::mount(&settings).await
    }

    async fn redis(config: &BackendConfig) -> StorageResult<KvAdapter> {
        let address = config.require("address")?;
        let username = config.param_str("username");
        let password = config.param_str("password");
        let store = RedisKv::connect(&address, username.as_deref(), password.as_deref()).await?;
        let namespace = config
            .param_str("namespace")
            .unwrap_or_else(|| DEFAULT_NAMESPACE.to_string());
        Ok(KvAdapter::new(Arc::new(store), namespace))
    }
}

/// Expand a leading `~` to the user's home directory.
fn expand_home(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix('~') {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest.trim_start_matches(['/', '\\']));
        }
    }
    PathBuf::from(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_builds_local() {
        let temp = tempdir().unwrap();
        let config = BackendConfig::local("disk", temp.path().to_string_lossy());
        let adapter = AdapterFactory::build(&config, &EndpointValidator::default())
            .await
            .unwrap();
        assert_eq!(adapter.kind(), BackendKind::Local);
    }

    #[tokio::test]
    async fn test_unknown_kind_unsupported() {
        let mut config = BackendConfig::local("x", "/tmp");
        config.kind = "ftp".into();
        let result = AdapterFactory::build(&config, &EndpointValidator::default()).await;
        assert!(matches!(result, Err(StorageError::Unsupported(_))));
    }

    #[tokio::test]
    async fn test_blocked_endpoint_never_connects() {
        let config = BackendConfig::new("cache", BackendKind::Redis).with_param("address", "127.0.0.1:6379");
        let result = AdapterFactory::build(&config, &EndpointValidator::new(false)).await;
        assert!(matches!(result, Err(StorageError::EndpointBlocked { .. })));
    }

    #[tokio::test]
    async fn test_missing_parameter_is_invalid_config() {
        let config = BackendConfig::new("bucket", BackendKind::S3).with_param("bucket", "b");
        let result = AdapterFactory::build(&config, &EndpointValidator::default()).await;
        assert!(matches!(result, Err(StorageError::InvalidConfig(_))));
    }

    #[test]
    fn test_expand_home() {
        assert_eq!(expand_home("/srv/data"), PathBuf::from("/srv/data"));
        if let Some(home) = dirs::home_dir() {
            assert_eq!(expand_home("~/files"), home.join("files"));
        }
    }
}
