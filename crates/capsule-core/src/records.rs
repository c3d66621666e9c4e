//! Capsule record store seam.
//!
//! The record store is the single source of truth for capsule state. Its
//! [`CapsuleRecords::transition_to_unlocked`] must be a conditional write so
//! that two unlockers (in this process or another) cannot both win.

use async_trait::async_trait;
use capsule_shared::{CapsuleId, UserId};
use capsule_store::{Capsule, CapsuleUpdate, DueCursor, StoreError, Transition};
use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::db::{run_blocking, DbError, SharedDb};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RecordError {
    #[error("capsule not found")]
    NotFound,

    #[error("capsule is already unlocked")]
    InvalidState,

    #[error("record store error: {0}")]
    Backend(String),
}

impl From<DbError> for RecordError {
    fn from(e: DbError) -> Self {
        match e {
            DbError::Store(StoreError::NotFound) => Self::NotFound,
            DbError::Store(StoreError::InvalidState) => Self::InvalidState,
            other => Self::Backend(other.to_string()),
        }
    }
}

#[async_trait]
pub trait CapsuleRecords: Send + Sync {
    async fn insert(&self, capsule: &Capsule) -> Result<(), RecordError>;

    async fn get(&self, id: CapsuleId) -> Result<Capsule, RecordError>;

    /// One page of the finite snapshot of locked capsules due at `now`.
    /// Passing the last capsule's cursor back resumes after it.
    async fn list_locked_due(
        &self,
        now: DateTime<Utc>,
        after: Option<DueCursor>,
        limit: usize,
    ) -> Result<Vec<Capsule>, RecordError>;

    /// Conditional `Locked -> Unlocked`. Returns [`Transition::Conflict`]
    /// without writing when the capsule is already unlocked.
    async fn transition_to_unlocked(
        &self,
        id: CapsuleId,
        unlocked_at: DateTime<Utc>,
    ) -> Result<Transition, RecordError>;

    /// Fails with [`RecordError::InvalidState`] once the capsule is unlocked.
    async fn update(&self, id: CapsuleId, update: &CapsuleUpdate) -> Result<Capsule, RecordError>;

    async fn delete(&self, id: CapsuleId) -> Result<bool, RecordError>;

    async fn list_for_user(
        &self,
        user: &UserId,
        unlocked_only: bool,
    ) -> Result<Vec<Capsule>, RecordError>;
}

/// [`CapsuleRecords`] backed by the SQLite capsule table.
#[derive(Clone)]
pub struct SqliteRecords {
    db: SharedDb,
}

impl SqliteRecords {
    pub fn new(db: SharedDb) -> Self {
        Self { db }
    }
}

#[async_trait]
impl CapsuleRecords for SqliteRecords {
    async fn insert(&self, capsule: &Capsule) -> Result<(), RecordError> {
        let capsule = capsule.clone();
        Ok(run_blocking(&self.db, move |db| db.insert_capsule(&capsule)).await?)
    }

    async fn get(&self, id: CapsuleId) -> Result<Capsule, RecordError> {
        Ok(run_blocking(&self.db, move |db| db.get_capsule(id)).await?)
    }

    async fn list_locked_due(
        &self,
        now: DateTime<Utc>,
        after: Option<DueCursor>,
        limit: usize,
    ) -> Result<Vec<Capsule>, RecordError> {
        Ok(run_blocking(&self.db, move |db| db.list_locked_due(now, after.as_ref(), limit)).await?)
    }

    async fn transition_to_unlocked(
        &self,
        id: CapsuleId,
        unlocked_at: DateTime<Utc>,
    ) -> Result<Transition, RecordError> {
        Ok(run_blocking(&self.db, move |db| {
            db.transition_capsule_to_unlocked(id, unlocked_at)
        })
        .await?)
    }

    async fn update(&self, id: CapsuleId, update: &CapsuleUpdate) -> Result<Capsule, RecordError> {
        let update = update.clone();
        Ok(run_blocking(&self.db, move |db| db.update_capsule(id, &update)).await?)
    }

    async fn delete(&self, id: CapsuleId) -> Result<bool, RecordError> {
        Ok(run_blocking(&self.db, move |db| db.delete_capsule(id)).await?)
    }

    async fn list_for_user(
        &self,
        user: &UserId,
        unlocked_only: bool,
    ) -> Result<Vec<Capsule>, RecordError> {
        let user = user.clone();
        Ok(run_blocking(&self.db, move |db| {
            db.list_capsules_for_user(&user, unlocked_only)
        })
        .await?)
    }
}
