//! Encrypted payload storage.
//!
//! Payloads are opaque ciphertext addressed by a [`PayloadRef`] issued by the
//! store that holds them. Record metadata lives elsewhere, so the payload
//! backend can change without touching capsule records.

mod fs;
mod sqlite;

use async_trait::async_trait;
use capsule_shared::PayloadRef;
use thiserror::Error;

pub use fs::FsPayloadStore;
pub use sqlite::SqlitePayloadStore;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PayloadError {
    #[error("payload not found: {0}")]
    NotFound(PayloadRef),

    #[error("payload storage error: {0}")]
    Storage(String),
}

#[async_trait]
pub trait PayloadStore: Send + Sync {
    /// Store ciphertext and return a reference to it. Size limits are the
    /// uploader's concern, not the store's.
    async fn put(&self, data: &[u8]) -> Result<PayloadRef, PayloadError>;

    async fn get(&self, payload: &PayloadRef) -> Result<Vec<u8>, PayloadError>;

    async fn delete(&self, payload: &PayloadRef) -> Result<(), PayloadError>;
}

/// Delete a payload, logging instead of failing. Used where an orphaned blob
/// must not block the owning operation.
pub async fn delete_best_effort(store: &dyn PayloadStore, payload: &PayloadRef) {
    if let Err(e) = store.delete(payload).await {
        tracing::warn!(payload = %payload, error = %e, "failed to delete payload");
    }
}
