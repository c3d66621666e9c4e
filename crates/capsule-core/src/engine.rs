//! The unlock state machine.
//!
//! A capsule moves `Locked -> Unlocked` exactly once. The engine opens the
//! payload first and only then commits the transition through the record
//! store's compare-and-swap, so a capsule whose ciphertext cannot be
//! recovered stays locked and is retried on the next scan instead of being
//! reported as released.

use std::sync::Arc;
use std::time::Duration;

use capsule_shared::constants::{DEFAULT_ITEM_TIMEOUT_SECS, DEFAULT_SCAN_CONCURRENCY, DUE_PAGE_SIZE};
use capsule_shared::crypto::{self, SymmetricKey};
use capsule_shared::CapsuleId;
use capsule_store::{Capsule, DueCursor, Transition};
use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::notify::UnlockListener;
use crate::payload::{PayloadError, PayloadStore};
use crate::records::{CapsuleRecords, RecordError};

/// Result of a single unlock attempt. None of these are errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UnlockOutcome {
    /// This call performed the transition.
    Unlocked { capsule: Capsule, plaintext: Vec<u8> },
    /// Someone else already did.
    AlreadyUnlocked { capsule: Capsule },
    NotYetDue { unlock_at: DateTime<Utc> },
}

#[derive(Debug, Error, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum UnlockError {
    #[error("capsule {0} not found")]
    NotFound(CapsuleId),

    #[error("payload for capsule {0} is missing")]
    PayloadMissing(CapsuleId),

    #[error("payload for capsule {0} could not be decrypted")]
    DecryptionFailed(CapsuleId),

    #[error("storage timed out for capsule {0}")]
    Timeout(CapsuleId),

    #[error("storage error for capsule {capsule}: {message}")]
    Storage { capsule: CapsuleId, message: String },
}

impl UnlockError {
    fn from_record(capsule: CapsuleId, e: RecordError) -> Self {
        match e {
            RecordError::NotFound => Self::NotFound(capsule),
            other => Self::Storage {
                capsule,
                message: other.to_string(),
            },
        }
    }

    fn from_payload(capsule: CapsuleId, e: PayloadError) -> Self {
        match e {
            PayloadError::NotFound(_) => Self::PayloadMissing(capsule),
            PayloadError::Storage(message) => Self::Storage { capsule, message },
        }
    }
}

/// A capsule the scan could not unlock, and why.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ScanFailure {
    pub capsule: CapsuleId,
    pub error: UnlockError,
}

/// Per-capsule outcomes of one scan.
#[derive(Debug, Clone, Serialize)]
pub struct ScanReport {
    pub now: DateTime<Utc>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub unlocked: Vec<CapsuleId>,
    pub already_unlocked: Vec<CapsuleId>,
    /// Rescheduled between being listed and being committed.
    pub not_yet_due: Vec<CapsuleId>,
    pub failed: Vec<ScanFailure>,
    /// Set when listing due capsules failed; the scan stops at that page.
    pub listing_error: Option<String>,
}

impl ScanReport {
    fn begin(now: DateTime<Utc>) -> Self {
        let started_at = Utc::now();
        Self {
            now,
            started_at,
            finished_at: started_at,
            unlocked: Vec::new(),
            already_unlocked: Vec::new(),
            not_yet_due: Vec::new(),
            failed: Vec::new(),
            listing_error: None,
        }
    }

    fn record(&mut self, capsule: CapsuleId, result: Result<UnlockOutcome, UnlockError>) {
        match result {
            Ok(UnlockOutcome::Unlocked { .. }) => self.unlocked.push(capsule),
            Ok(UnlockOutcome::AlreadyUnlocked { .. }) => self.already_unlocked.push(capsule),
            Ok(UnlockOutcome::NotYetDue { .. }) => self.not_yet_due.push(capsule),
            Err(error) => self.failed.push(ScanFailure { capsule, error }),
        }
    }

    pub fn total(&self) -> usize {
        self.unlocked.len() + self.already_unlocked.len() + self.not_yet_due.len() + self.failed.len()
    }

    pub fn is_clean(&self) -> bool {
        self.failed.is_empty() && self.listing_error.is_none()
    }

    pub fn failure_for(&self, capsule: CapsuleId) -> Option<&UnlockError> {
        self.failed
            .iter()
            .find(|f| f.capsule == capsule)
            .map(|f| &f.error)
    }

    fn log(&self) {
        let elapsed_ms = (self.finished_at - self.started_at).num_milliseconds();
        if self.total() == 0 && self.listing_error.is_none() {
            debug!(elapsed_ms, "Unlock scan found nothing due");
            return;
        }
        info!(
            unlocked = self.unlocked.len(),
            already_unlocked = self.already_unlocked.len(),
            not_yet_due = self.not_yet_due.len(),
            failed = self.failed.len(),
            listing_error = self.listing_error.as_deref(),
            elapsed_ms,
            "Unlock scan finished"
        );
        if !self.is_clean() {
            warn!(
                failed = self.failed.len(),
                listing_error = self.listing_error.as_deref(),
                "Unlock scan left capsules locked; they are retried on the next scan"
            );
        }
    }
}

/// Drives capsules from `Locked` to `Unlocked`.
pub struct UnlockEngine {
    records: Arc<dyn CapsuleRecords>,
    payloads: Arc<dyn PayloadStore>,
    key: SymmetricKey,
    listener: Option<Arc<dyn UnlockListener>>,
    item_timeout: Duration,
    concurrency: usize,
    page_size: usize,
}

impl UnlockEngine {
    pub fn new(
        records: Arc<dyn CapsuleRecords>,
        payloads: Arc<dyn PayloadStore>,
        key: SymmetricKey,
    ) -> Self {
        Self {
            records,
            payloads,
            key,
            listener: None,
            item_timeout: Duration::from_secs(DEFAULT_ITEM_TIMEOUT_SECS),
            concurrency: DEFAULT_SCAN_CONCURRENCY,
            page_size: DUE_PAGE_SIZE,
        }
    }

    /// Called once per capsule, by whichever caller wins the transition.
    pub fn with_listener(mut self, listener: Arc<dyn UnlockListener>) -> Self {
        self.listener = Some(listener);
        self
    }

    /// Bound on each storage call made while unlocking one capsule.
    pub fn with_item_timeout(mut self, timeout: Duration) -> Self {
        self.item_timeout = timeout;
        self
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    pub fn records(&self) -> &Arc<dyn CapsuleRecords> {
        &self.records
    }

    pub fn payloads(&self) -> &Arc<dyn PayloadStore> {
        &self.payloads
    }

    /// Unlock `capsule` if it is due at `now`.
    ///
    /// Decrypts first, then commits with the record store's conditional
    /// write. Losing the race yields [`UnlockOutcome::AlreadyUnlocked`] with
    /// the winner's record.
    pub async fn try_unlock(
        &self,
        capsule: &Capsule,
        now: DateTime<Utc>,
    ) -> Result<UnlockOutcome, UnlockError> {
        if !capsule.is_due(now) {
            return Ok(UnlockOutcome::NotYetDue {
                unlock_at: capsule.unlock_at,
            });
        }
        if capsule.is_unlocked() {
            return Ok(UnlockOutcome::AlreadyUnlocked {
                capsule: capsule.clone(),
            });
        }

        let plaintext = self.read_payload(capsule).await?;

        // No timeout here: abandoning a commit that still lands would unlock
        // the capsule without anyone seeing the result.
        let transition = self
            .records
            .transition_to_unlocked(capsule.id, now)
            .await
            .map_err(|e| UnlockError::from_record(capsule.id, e))?;

        match transition {
            Transition::Unlocked(unlocked) => {
                info!(capsule = %unlocked.id, owner = %unlocked.owner_id, "Capsule unlocked");
                if let Some(listener) = &self.listener {
                    listener.on_unlocked(&unlocked).await;
                }
                Ok(UnlockOutcome::Unlocked {
                    capsule: unlocked,
                    plaintext,
                })
            }
            Transition::Conflict => {
                debug!(capsule = %capsule.id, "Capsule already unlocked by another caller");
                let current = self
                    .records
                    .get(capsule.id)
                    .await
                    .map_err(|e| UnlockError::from_record(capsule.id, e))?;
                Ok(UnlockOutcome::AlreadyUnlocked { capsule: current })
            }
            Transition::NotDue(unlock_at) => {
                debug!(capsule = %capsule.id, %unlock_at, "Capsule rescheduled before commit");
                Ok(UnlockOutcome::NotYetDue { unlock_at })
            }
        }
    }

    /// Look the capsule up and run [`Self::try_unlock`] on it.
    pub async fn unlock_by_id(
        &self,
        id: CapsuleId,
        now: DateTime<Utc>,
    ) -> Result<UnlockOutcome, UnlockError> {
        let capsule = self
            .bounded(id, self.records.get(id))
            .await?
            .map_err(|e| UnlockError::from_record(id, e))?;
        self.try_unlock(&capsule, now).await
    }

    /// Fetch and decrypt a capsule's payload without looking at its state.
    /// Callers decide whether the reader may see it.
    pub async fn read_payload(&self, capsule: &Capsule) -> Result<Vec<u8>, UnlockError> {
        let ciphertext = self
            .bounded(capsule.id, self.payloads.get(&capsule.ciphertext_ref))
            .await?
            .map_err(|e| UnlockError::from_payload(capsule.id, e))?;

        crypto::decrypt(&self.key, &ciphertext, &capsule.nonce).map_err(|e| {
            error!(
                capsule = %capsule.id,
                payload = %capsule.ciphertext_ref,
                error = %e,
                "Capsule payload failed to decrypt"
            );
            UnlockError::DecryptionFailed(capsule.id)
        })
    }

    /// Unlock every capsule that is locked and due at `now`.
    ///
    /// Walks the due listing page by page with up to `concurrency` capsules
    /// in flight. A failing capsule is recorded and skipped; it stays locked
    /// and shows up again on the next scan.
    pub async fn scan_and_unlock_due(&self, now: DateTime<Utc>) -> ScanReport {
        let mut report = ScanReport::begin(now);
        let mut cursor: Option<DueCursor> = None;

        loop {
            let page = match self.records.list_locked_due(now, cursor, self.page_size).await {
                Ok(page) => page,
                Err(e) => {
                    error!(error = %e, "Failed to list due capsules");
                    report.listing_error = Some(e.to_string());
                    break;
                }
            };

            let last_page = page.len() < self.page_size;
            cursor = page.last().map(Capsule::due_cursor);

            let results: Vec<(CapsuleId, Result<UnlockOutcome, UnlockError>)> =
                stream::iter(page)
                    .map(|capsule| async move {
                        let result = self.try_unlock(&capsule, now).await;
                        (capsule.id, result)
                    })
                    .buffer_unordered(self.concurrency)
                    .collect()
                    .await;

            for (id, result) in results {
                if let Err(e) = &result {
                    warn!(capsule = %id, error = %e, "Capsule unlock failed; will retry next scan");
                }
                report.record(id, result);
            }

            if last_page || cursor.is_none() {
                break;
            }
        }

        report.finished_at = Utc::now();
        report.log();
        report
    }

    async fn bounded<T>(
        &self,
        capsule: CapsuleId,
        fut: impl std::future::Future<Output = T>,
    ) -> Result<T, UnlockError> {
        tokio::time::timeout(self.item_timeout, fut)
            .await
            .map_err(|_| UnlockError::Timeout(capsule))
    }
}
