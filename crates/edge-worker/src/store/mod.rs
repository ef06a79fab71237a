//! Durable response store.
//!
//! Besides cached responses the store keeps a few sentinel entries: fixed,
//! unroutable request identities whose status text carries serialized worker
//! state. They let a restarted worker rebuild itself from the store alone.

pub mod file;
pub mod memory;

use async_trait::async_trait;
use axum::http::HeaderMap;
use thiserror::Error;

use crate::message::{RequestIdentity, StoredResponse};

pub use file::FileStore;
pub use memory::MemoryStore;

/// Holds the serialized configuration handshake.
pub const CONFIG_SENTINEL_URL: &str = "https://config.sentinel.invalid/";
/// Holds the base path learned by relative-mode rewriting.
pub const BASE_PATH_SENTINEL_URL: &str = "https://base-path.sentinel.invalid/";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store i/o failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("stored entry is corrupt: {0}")]
    Corrupt(#[from] serde_json::Error),
    #[error("store rejected entry: {0}")]
    Rejected(String),
}

#[async_trait]
pub trait ResponseStore: Send + Sync {
    async fn get(&self, identity: &RequestIdentity) -> Result<Option<StoredResponse>, StoreError>;
    /// Writes are all-or-nothing: a concurrent reader sees the previous entry
    /// or the new one.
    async fn put(&self, identity: &RequestIdentity, response: &StoredResponse) -> Result<(), StoreError>;
    async fn delete(&self, identity: &RequestIdentity) -> Result<bool, StoreError>;
}

/// Sentinel URLs are never intercepted; their entries are worker state, not
/// responses.
pub fn is_sentinel(url: &str) -> bool {
    [CONFIG_SENTINEL_URL, BASE_PATH_SENTINEL_URL]
        .iter()
        .any(|sentinel| url.starts_with(sentinel))
}

pub async fn read_sentinel(store: &dyn ResponseStore, url: &str) -> Result<Option<String>, StoreError> {
    let entry = store.get(&RequestIdentity::get(url)).await?;
    Ok(entry
        .map(|response| response.status_text)
        .filter(|value| !value.is_empty()))
}

pub async fn write_sentinel(store: &dyn ResponseStore, url: &str, value: &str) -> Result<(), StoreError> {
    let mut entry = StoredResponse::new(200, HeaderMap::new(), Vec::new());
    entry.status_text = value.to_string();
    store.put(&RequestIdentity::get(url), &entry).await
}
