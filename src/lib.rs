//! Polystore - storage abstraction and transfer engine
//!
//! One adapter contract over local disk, NFS mounts, S3-compatible object
//! stores, Google Drive, SFTP and Redis, plus the machinery built on top of
//! it: a registry of configured backends, cross-backend transfers, archive
//! compression/extraction, and a progress broadcast hub.

pub mod adapter;
pub mod archive;
pub mod config;
pub mod error;
pub mod path_utils;
pub mod progress;
pub mod registry;
pub mod security;
pub mod service;
pub mod transfer;
pub mod types;

pub use adapter::{StorageAdapter, ByteReader, ProgressFn};
pub use error::{StorageError, StorageResult};
pub use registry::StorageRegistry;
pub use service::StorageService;
pub use types::{BackendKind, EntryDescriptor, EntryKind, SpaceInfo};

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Install the global tracing subscriber (`RUST_LOG` overrides, default `info`).
///
/// Safe to call more than once; later calls are ignored.
pub fn init_tracing() {
    let _ = tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .try_init();
}
