//! Storage backend capability interface.
//!
//! The pipeline never talks to the network directly. Everything it needs
//! from a content-addressed storage service is expressed by [`Backend`]:
//! - `store`: put a file's bytes, get back an identifier URL
//! - `size_of`: stored size lookup for an identifier URL
//! - `fetch_raw`: the undecoded block behind an identifier URL
//! - `publish_container`: upload a whole CAR, get back one URL per root
//!
//! Retries, timeouts and authentication belong to the implementation.
//! [`MemoryBackend`] is an in-memory fake for tests; [`FsBackend`] keeps
//! blocks in a local directory.

pub mod fs;
pub mod memory;

use async_trait::async_trait;
use thiserror::Error;

pub use fs::FsBackend;
pub use memory::MemoryBackend;

/// Errors reported by a storage backend.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("not found: {url}")]
    NotFound { url: String },

    #[error("invalid identifier from backend: {0}")]
    InvalidIdentifier(String),

    #[error("rejected by backend: {0}")]
    Rejected(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for backend operations.
pub type StorageResult<T> = std::result::Result<T, StorageError>;

/// Capability interface for a content-addressed storage service.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Store `data` (named `name` for diagnostics and filename hints) and
    /// return an `ipfs://<cid>[...]` URL for it.
    async fn store(&self, name: &str, data: &[u8]) -> StorageResult<String>;

    /// Stored size of the content behind `url`, in bytes.
    async fn size_of(&self, url: &str) -> StorageResult<u64>;

    /// Undecoded bytes of the block behind `url`.
    async fn fetch_raw(&self, url: &str) -> StorageResult<Vec<u8>>;

    /// Upload a CAR container; returns one identifier URL per declared root.
    async fn publish_container(&self, car: &[u8]) -> StorageResult<Vec<String>>;
}
