//! Storage registry
//!
//! Sole owner of live adapters, keyed by backend id. Declarative
//! configurations are kept separately from the adapters built from them, so
//! a definition that failed to load (unknown kind, blocked endpoint,
//! unreachable server) is still listed and still persisted, it just has no
//! live adapter.

use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::RwLock;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::adapter::{AdapterFactory, StorageAdapter};
use crate::config::{BackendConfig, ConfigStorage};
use crate::error::{StorageError, StorageResult};
use crate::security::EndpointValidator;
use crate::types::BackendKind;

struct Registration {
    config: BackendConfig,
    /// Registered directly with an adapter instance, never written to disk
    ephemeral: bool,
    /// Why the adapter could not be constructed
    error: Option<String>,
}

/// Snapshot of one backend as returned by [`StorageRegistry::list_all`]
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BackendStatus {
    #[serde(flatten)]
    pub config: BackendConfig,
    pub active: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Outcome of a best-effort configuration load
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LoadReport {
    pub loaded: Vec<String>,
    /// (id, reason) for every entry that got no live adapter
    pub skipped: Vec<(String, String)>,
}

pub struct StorageRegistry {
    registrations: RwLock<Vec<Registration>>,
    adapters: DashMap<String, Arc<dyn StorageAdapter>>,
    validator: RwLock<EndpointValidator>,
    storage: Option<ConfigStorage>,
}

impl Default for StorageRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl StorageRegistry {
    /// In-memory registry; `persist` is a no-op.
    pub fn new() -> Self {
        Self {
            registrations: RwLock::new(Vec::new()),
            adapters: DashMap::new(),
            validator: RwLock::new(EndpointValidator::default()),
            storage: None,
        }
    }

    /// Registry persisting to `storage`.
    pub fn with_storage(storage: ConfigStorage) -> Self {
        Self {
            storage: Some(storage),
            ..Self::new()
        }
    }

    pub fn with_validator(self, validator: EndpointValidator) -> Self {
        *self.validator.write() = validator;
        self
    }

    pub fn validator(&self) -> EndpointValidator {
        *self.validator.read()
    }

    /// Replace the validator used for future constructions.
    pub fn set_validator(&self, validator: EndpointValidator) {
        *self.validator.write() = validator;
        info!(
            "Endpoint validator updated (allow local addresses: {})",
            validator.allows_local()
        );
    }

    /// Register an already-constructed adapter under `id`.
    pub fn register(&self, id: &str, adapter: Arc<dyn StorageAdapter>) -> StorageResult<()> {
        let mut registrations = self.registrations.write();
        if registrations.iter().any(|r| r.config.id == id) {
            return Err(StorageError::Conflict(format!("backend '{}' already exists", id)));
        }
        registrations.push(Registration {
            config: BackendConfig::new(id, adapter.kind()),
            ephemeral: true,
            error: None,
        });
        self.adapters.insert(id.to_string(), adapter);
        debug!("Registered adapter '{}'", id);
        Ok(())
    }

    /// Live adapter for `id`.
    pub fn get(&self, id: &str) -> StorageResult<Arc<dyn StorageAdapter>> {
        self.adapters
            .get(id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| StorageError::NotFound(format!("backend '{}'", id)))
    }

    pub fn contains(&self, id: &str) -> bool {
        self.adapters.contains_key(id)
    }

    /// Point-in-time snapshot of every known backend, in definition order.
    pub fn list_all(&self) -> Vec<BackendStatus> {
        self.registrations
            .read()
            .iter()
            .map(|r| BackendStatus {
                config: r.config.clone(),
                active: self.adapters.contains_key(&r.config.id),
                error: r.error.clone(),
            })
            .collect()
    }

    pub fn configs(&self) -> Vec<BackendConfig> {
        self.registrations
            .read()
            .iter()
            .map(|r| r.config.clone())
            .collect()
    }

    /// Make `id` the only default backend.
    pub fn set_default(&self, id: &str) -> StorageResult<()> {
        let mut registrations = self.registrations.write();
        if !registrations.iter().any(|r| r.config.id == id) {
            return Err(StorageError::NotFound(format!("backend '{}'", id)));
        }
        for r in registrations.iter_mut() {
            r.config.is_default = r.config.id == id;
        }
        info!("Default backend set to '{}'", id);
        Ok(())
    }

    /// Id of the default backend, falling back to the first live local one.
    pub fn default_id(&self) -> Option<String> {
        let registrations = self.registrations.read();
        registrations
            .iter()
            .find(|r| r.config.is_default && self.adapters.contains_key(&r.config.id))
            .or_else(|| {
                registrations.iter().find(|r| {
                    r.config.kind == BackendKind::Local.as_str()
                        && self.adapters.contains_key(&r.config.id)
                })
            })
            .map(|r| r.config.id.clone())
    }

    pub fn default_adapter(&self) -> StorageResult<Arc<dyn StorageAdapter>> {
        let id = self
            .default_id()
            .ok_or_else(|| StorageError::NotFound("no default backend".to_string()))?;
        self.get(&id)
    }

    /// Best-effort load: every entry is validated and constructed on its own,
    /// and a bad entry is logged and skipped without affecting the rest.
    pub async fn load_configuration(&self, configs: Vec<BackendConfig>) -> LoadReport {
        let mut report = LoadReport::default();
        let mut seen_default = self.registrations.read().iter().any(|r| r.config.is_default);

        for mut config in configs {
            if self.registrations.read().iter().any(|r| r.config.id == config.id) {
                warn!("Skipping duplicate backend id '{}'", config.id);
                report
                    .skipped
                    .push((config.id.clone(), "duplicate id".to_string()));
                continue;
            }

            if config.is_default {
                if seen_default {
                    warn!(
                        "Backend '{}' is also marked default, keeping the first one",
                        config.id
                    );
                    config.is_default = false;
                }
                seen_default = true;
            }

            let validator = self.validator();
            let error = match AdapterFactory::build(&config, &validator).await {
                Ok(adapter) => {
                    self.adapters.insert(config.id.clone(), adapter);
                    report.loaded.push(config.id.clone());
                    None
                }
                Err(e) => {
                    warn!("Skipping backend '{}' ({}): {}", config.id, config.kind, e);
                    report.skipped.push((config.id.clone(), e.to_string()));
                    Some(e.to_string())
                }
            };

            self.registrations.write().push(Registration {
                config,
                ephemeral: false,
                error,
            });
        }

        info!(
            "Loaded {} backend(s), skipped {}",
            report.loaded.len(),
            report.skipped.len()
        );
        report
    }

    /// Load from the attached config file.
    pub async fn load_from_storage(&self) -> StorageResult<LoadReport> {
        let storage = self.storage.as_ref().ok_or_else(|| {
            StorageError::InvalidConfig("registry has no configuration file".to_string())
        })?;
        let configs = storage.load().await?;
        Ok(self.load_configuration(configs).await)
    }

    /// Add one backend. Unlike loading, failures are returned to the caller
    /// and nothing is recorded.
    pub async fn add_configuration(&self, config: BackendConfig) -> StorageResult<()> {
        if self.registrations.read().iter().any(|r| r.config.id == config.id) {
            return Err(StorageError::Conflict(format!(
                "backend '{}' already exists",
                config.id
            )));
        }

        let validator = self.validator();
        let adapter = AdapterFactory::build(&config, &validator).await?;

        let id = config.id.clone();
        let rejected = {
            let mut registrations = self.registrations.write();
            // Another add may have raced the construction above
            if registrations.iter().any(|r| r.config.id == id) {
                Some(adapter)
            } else {
                if config.is_default {
                    for r in registrations.iter_mut() {
                        r.config.is_default = false;
                    }
                }
                info!("Added backend '{}' ({})", id, config.kind);
                self.adapters.insert(id.clone(), adapter);
                registrations.push(Registration {
                    config,
                    ephemeral: false,
                    error: None,
                });
                None
            }
        };

        if let Some(adapter) = rejected {
            if let Err(e) = adapter.close().await {
                warn!("Failed to close discarded adapter '{}': {}", id, e);
            }
            return Err(StorageError::Conflict(format!("backend '{}' already exists", id)));
        }
        Ok(())
    }

    /// Remove a backend and release its adapter. The default backend and
    /// the last local backend cannot be removed.
    pub async fn remove_configuration(&self, id: &str) -> StorageResult<()> {
        {
            let mut registrations = self.registrations.write();
            let index = registrations
                .iter()
                .position(|r| r.config.id == id)
                .ok_or_else(|| StorageError::NotFound(format!("backend '{}'", id)))?;

            let target = &registrations[index].config;
            if target.is_default {
                return Err(StorageError::Conflict(format!(
                    "backend '{}' is the default and cannot be removed",
                    id
                )));
            }
            let local = BackendKind::Local.as_str();
            if target.kind == local
                && registrations.iter().filter(|r| r.config.kind == local).count() == 1
            {
                return Err(StorageError::Conflict(format!(
                    "backend '{}' is the last local backend and cannot be removed",
                    id
                )));
            }
            registrations.remove(index);
        }

        if let Some((_, adapter)) = self.adapters.remove(id) {
            if let Err(e) = adapter.close().await {
                warn!("Failed to close adapter '{}': {}", id, e);
            }
        }
        info!("Removed backend '{}'", id);
        Ok(())
    }

    /// Write every non-ephemeral configuration to the attached file.
    pub async fn persist(&self) -> StorageResult<()> {
        let Some(storage) = &self.storage else {
            debug!("Registry has no configuration file, skipping persist");
            return Ok(());
        };
        let configs: Vec<BackendConfig> = self
            .registrations
            .read()
            .iter()
            .filter(|r| !r.ephemeral)
            .map(|r| r.config.clone())
            .collect();
        storage.save(&configs).await?;
        debug!("Persisted {} backend definition(s)", configs.len());
        Ok(())
    }

    /// Release every adapter. Used at teardown.
    pub async fn close_all(&self) {
        let ids: Vec<String> = self.adapters.iter().map(|e| e.key().clone()).collect();
        for id in ids {
            if let Some((_, adapter)) = self.adapters.remove(&id) {
                if let Err(e) = adapter.close().await {
                    warn!("Failed to close adapter '{}': {}", id, e);
                }
            }
        }
        info!("Closed all adapters");
    }
}
