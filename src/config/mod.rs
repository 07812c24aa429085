//! Configuration Management Module
//!
//! Persistent backend definitions (`storages.json`) and the blocked-range
//! security policy (`security.json`).

pub mod storage;
pub mod types;

pub use storage::{
    config_dir, security_file, storages_file, ConfigError, ConfigStorage, PolicyStorage,
    SECURITY_FILE, STORAGES_FILE,
};
pub use types::{BackendConfig, DEFAULT_LOCAL_ID};
