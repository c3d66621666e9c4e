//! Shared access to the synchronous [`Database`] from async code.
//!
//! rusqlite is blocking, so every call is moved onto the blocking pool while
//! holding the connection mutex.

use std::sync::{Arc, Mutex};

use capsule_store::{Database, StoreError};
use thiserror::Error;

/// Shared database connection.
pub type SharedDb = Arc<Mutex<Database>>;

pub fn shared(db: Database) -> SharedDb {
    Arc::new(Mutex::new(db))
}

#[derive(Debug, Error)]
pub enum DbError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("database lock poisoned")]
    Poisoned,

    #[error("blocking task failed: {0}")]
    Join(String),
}

pub(crate) async fn run_blocking<T, F>(db: &SharedDb, f: F) -> Result<T, DbError>
where
    T: Send + 'static,
    F: FnOnce(&Database) -> capsule_store::Result<T> + Send + 'static,
{
    let db = db.clone();
    tokio::task::spawn_blocking(move || {
        let guard = db.lock().map_err(|_| DbError::Poisoned)?;
        f(&guard).map_err(DbError::from)
    })
    .await
    .map_err(|e| DbError::Join(e.to_string()))?
}
