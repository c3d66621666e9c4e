//! Capsule operations behind the HTTP routes: create, read, update, delete,
//! manual unlock, download and owner preview.
//!
//! Access rules: owner and registered recipient can see, unlock and download
//! a capsule; only the owner may update it, delete it or preview it while it
//! is still locked. Capsules a user cannot see are reported as not found.

use std::sync::Arc;

use capsule_shared::constants::{MAX_PAYLOAD_SIZE, MESSAGE_FILENAME};
use capsule_shared::crypto::{self, SymmetricKey};
use capsule_shared::types::{content_type_for, is_allowed_file};
use capsule_shared::{CapsuleId, ContentKind, CryptoError, PayloadRef, Recipient, UserId, ValidationError};
use capsule_store::{Capsule, CapsuleState, CapsuleUpdate, PayloadSwap};
use chrono::{DateTime, Utc};
use thiserror::Error;
use tracing::{debug, info};

use crate::dashboard::Dashboard;
use crate::engine::{UnlockEngine, UnlockError, UnlockOutcome};
use crate::payload::{delete_best_effort, PayloadError, PayloadStore};
use crate::records::{CapsuleRecords, RecordError};

#[derive(Debug, Error)]
pub enum CapsuleError {
    #[error("capsule {0} not found")]
    NotFound(CapsuleId),

    #[error("only the owner can do this to capsule {0}")]
    Forbidden(CapsuleId),

    #[error("capsule {0} is still locked")]
    Locked(CapsuleId),

    #[error("capsule {0} is already unlocked")]
    InvalidState(CapsuleId),

    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Unlock(#[from] UnlockError),

    #[error(transparent)]
    Crypto(#[from] CryptoError),

    #[error("storage error: {0}")]
    Storage(String),
}

pub type Result<T> = std::result::Result<T, CapsuleError>;

fn record_err(id: CapsuleId) -> impl FnOnce(RecordError) -> CapsuleError {
    move |e| match e {
        RecordError::NotFound => CapsuleError::NotFound(id),
        RecordError::InvalidState => CapsuleError::InvalidState(id),
        RecordError::Backend(msg) => CapsuleError::Storage(msg),
    }
}

impl From<PayloadError> for CapsuleError {
    fn from(e: PayloadError) -> Self {
        Self::Storage(e.to_string())
    }
}

/// What the capsule holds.
#[derive(Debug, Clone)]
pub enum CapsuleContent {
    File { filename: String, bytes: Vec<u8> },
    /// Stored as a text file named `message.txt`.
    Message(String),
}

impl CapsuleContent {
    fn into_parts(self) -> (String, Vec<u8>) {
        match self {
            Self::File { filename, bytes } => (filename, bytes),
            Self::Message(text) => (MESSAGE_FILENAME.to_string(), text.into_bytes()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct NewCapsule {
    pub recipient: Option<Recipient>,
    pub unlock_at: DateTime<Utc>,
    pub description: Option<String>,
    pub content: Option<CapsuleContent>,
}

/// Owner edits to a locked capsule. `description: Some(None)` clears it.
#[derive(Debug, Clone, Default)]
pub struct CapsuleChanges {
    pub description: Option<Option<String>>,
    pub unlock_at: Option<DateTime<Utc>>,
    pub content: Option<CapsuleContent>,
}

/// Decrypted payload ready to hand to a reader.
#[derive(Debug, Clone)]
pub struct OpenedCapsule {
    pub capsule: Capsule,
    pub plaintext: Vec<u8>,
    pub content_type: &'static str,
}

pub struct CapsuleService {
    engine: Arc<UnlockEngine>,
    key: SymmetricKey,
    max_payload_size: usize,
}

impl CapsuleService {
    pub fn new(engine: Arc<UnlockEngine>, key: SymmetricKey) -> Self {
        Self {
            engine,
            key,
            max_payload_size: MAX_PAYLOAD_SIZE,
        }
    }

    pub fn with_max_payload_size(mut self, max: usize) -> Self {
        self.max_payload_size = max;
        self
    }

    pub fn engine(&self) -> &Arc<UnlockEngine> {
        &self.engine
    }

    fn records(&self) -> &dyn CapsuleRecords {
        self.engine.records().as_ref()
    }

    fn payloads(&self) -> &dyn PayloadStore {
        self.engine.payloads().as_ref()
    }

    /// Validate, encrypt and store a new locked capsule.
    pub async fn create(&self, owner: &UserId, new: NewCapsule, now: DateTime<Utc>) -> Result<Capsule> {
        let recipient = new.recipient.ok_or(ValidationError::MissingRecipient)?;
        let content = new.content.ok_or(ValidationError::EmptyCapsule)?;
        if new.unlock_at <= now {
            return Err(ValidationError::UnlockNotInFuture.into());
        }

        let (filename, plaintext) = self.check_content(content)?;
        let (ciphertext_ref, nonce) = self.seal_and_store(&plaintext).await?;

        let capsule = Capsule {
            id: CapsuleId::new(),
            owner_id: owner.clone(),
            recipient,
            unlock_at: new.unlock_at,
            state: CapsuleState::Locked,
            unlocked_at: None,
            ciphertext_ref,
            nonce,
            description: new.description,
            content_kind: ContentKind::from_filename(&filename),
            filename,
            original_size: plaintext.len() as i64,
            created_at: now,
        };

        if let Err(e) = self.records().insert(&capsule).await {
            delete_best_effort(self.payloads(), &capsule.ciphertext_ref).await;
            return Err(record_err(capsule.id)(e));
        }

        info!(capsule = %capsule.id, owner = %owner, unlock_at = %capsule.unlock_at, "Capsule created");
        Ok(capsule)
    }

    pub async fn get(&self, user: &UserId, id: CapsuleId) -> Result<Capsule> {
        let capsule = self.records().get(id).await.map_err(record_err(id))?;
        if !capsule.is_visible_to(user) {
            return Err(CapsuleError::NotFound(id));
        }
        Ok(capsule)
    }

    /// Capsules the user sent or received, newest first.
    pub async fn list(&self, user: &UserId, unlocked_only: bool) -> Result<Vec<Capsule>> {
        self.records()
            .list_for_user(user, unlocked_only)
            .await
            .map_err(|e| CapsuleError::Storage(e.to_string()))
    }

    /// Counts and upcoming unlocks across everything the user sent or
    /// received.
    pub async fn dashboard(&self, user: &UserId, now: DateTime<Utc>) -> Result<Dashboard> {
        let capsules = self.list(user, false).await?;
        Ok(Dashboard::build(capsules, now))
    }

    /// Apply owner edits to a locked capsule. A replaced payload is sealed
    /// under a fresh nonce and the old blob is removed once the record
    /// points at the new one.
    pub async fn update(
        &self,
        user: &UserId,
        id: CapsuleId,
        changes: CapsuleChanges,
        now: DateTime<Utc>,
    ) -> Result<Capsule> {
        let current = self.owned(user, id).await?;
        if current.is_unlocked() {
            return Err(CapsuleError::InvalidState(id));
        }
        if changes.description.is_none() && changes.unlock_at.is_none() && changes.content.is_none() {
            return Err(ValidationError::EmptyUpdate.into());
        }
        if changes.unlock_at.is_some_and(|at| at <= now) {
            return Err(ValidationError::UnlockNotInFuture.into());
        }

        let payload = match changes.content {
            Some(content) => {
                let (filename, plaintext) = self.check_content(content)?;
                let (ciphertext_ref, nonce) = self.seal_and_store(&plaintext).await?;
                Some(PayloadSwap {
                    ciphertext_ref,
                    nonce,
                    content_kind: ContentKind::from_filename(&filename),
                    filename,
                    original_size: plaintext.len() as i64,
                })
            }
            None => None,
        };
        let new_ref = payload.as_ref().map(|p| p.ciphertext_ref.clone());

        let update = CapsuleUpdate {
            description: changes.description,
            unlock_at: changes.unlock_at,
            payload,
        };

        let updated = match self.records().update(id, &update).await {
            Ok(updated) => updated,
            Err(e) => {
                if let Some(new_ref) = &new_ref {
                    delete_best_effort(self.payloads(), new_ref).await;
                }
                return Err(record_err(id)(e));
            }
        };

        if new_ref.is_some() {
            delete_best_effort(self.payloads(), &current.ciphertext_ref).await;
        }

        debug!(capsule = %id, "Capsule updated");
        Ok(updated)
    }

    /// Remove the record, then its payload. A payload that cannot be deleted
    /// is logged and left behind.
    pub async fn delete(&self, user: &UserId, id: CapsuleId) -> Result<()> {
        let capsule = self.owned(user, id).await?;
        if !self.records().delete(id).await.map_err(record_err(id))? {
            return Err(CapsuleError::NotFound(id));
        }
        delete_best_effort(self.payloads(), &capsule.ciphertext_ref).await;

        info!(capsule = %id, "Capsule deleted");
        Ok(())
    }

    /// Manual unlock by the owner or recipient, under the same time gate as
    /// the scheduler.
    pub async fn unlock(&self, user: &UserId, id: CapsuleId, now: DateTime<Utc>) -> Result<UnlockOutcome> {
        let capsule = self.get(user, id).await?;
        Ok(self.engine.try_unlock(&capsule, now).await?)
    }

    /// Decrypted contents of an unlocked capsule.
    pub async fn download(&self, user: &UserId, id: CapsuleId) -> Result<OpenedCapsule> {
        let capsule = self.get(user, id).await?;
        if !capsule.is_unlocked() {
            return Err(CapsuleError::Locked(id));
        }
        self.open(capsule).await
    }

    /// Like [`Self::download`], except the owner may also read their own
    /// capsule before it unlocks.
    pub async fn preview(&self, user: &UserId, id: CapsuleId) -> Result<OpenedCapsule> {
        let capsule = self.get(user, id).await?;
        if !capsule.is_unlocked() && &capsule.owner_id != user {
            return Err(CapsuleError::Locked(id));
        }
        self.open(capsule).await
    }

    async fn open(&self, capsule: Capsule) -> Result<OpenedCapsule> {
        let plaintext = self.engine.read_payload(&capsule).await?;
        let content_type = content_type_for(&capsule.filename);
        Ok(OpenedCapsule {
            capsule,
            plaintext,
            content_type,
        })
    }

    async fn owned(&self, user: &UserId, id: CapsuleId) -> Result<Capsule> {
        let capsule = self.get(user, id).await?;
        if &capsule.owner_id != user {
            return Err(CapsuleError::Forbidden(id));
        }
        Ok(capsule)
    }

    fn check_content(&self, content: CapsuleContent) -> Result<(String, Vec<u8>)> {
        let (filename, plaintext) = content.into_parts();
        if plaintext.is_empty() {
            return Err(ValidationError::EmptyCapsule.into());
        }
        if !is_allowed_file(&filename) {
            return Err(ValidationError::FileTypeNotAllowed(filename).into());
        }
        if plaintext.len() > self.max_payload_size {
            return Err(ValidationError::PayloadTooLarge {
                size: plaintext.len(),
                max: self.max_payload_size,
            }
            .into());
        }
        Ok((filename, plaintext))
    }

    async fn seal_and_store(&self, plaintext: &[u8]) -> Result<(PayloadRef, crypto::Nonce)> {
        let sealed = crypto::encrypt(&self.key, plaintext)?;
        let payload = self.payloads().put(&sealed.ciphertext).await?;
        Ok((payload, sealed.nonce))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::shared;
    use crate::payload::SqlitePayloadStore;
    use crate::records::SqliteRecords;
    use capsule_store::Database;
    use chrono::Duration;

    fn service() -> CapsuleService {
        let db = shared(Database::open_in_memory().unwrap());
        let key = crypto::generate_symmetric_key();
        let engine = UnlockEngine::new(
            Arc::new(SqliteRecords::new(db.clone())),
            Arc::new(SqlitePayloadStore::new(db)),
            key,
        );
        CapsuleService::new(Arc::new(engine), key)
    }

    fn alice() -> UserId {
        UserId::from("alice")
    }

    fn bob() -> UserId {
        UserId::from("bob")
    }

    fn message_to_bob(text: &str, unlock_at: DateTime<Utc>) -> NewCapsule {
        NewCapsule {
            recipient: Some(Recipient::User(bob())),
            unlock_at,
            description: Some("open me".into()),
            content: Some(CapsuleContent::Message(text.into())),
        }
    }

    #[tokio::test]
    async fn create_message_capsule() {
        let svc = service();
        let now = Utc::now();
        let capsule = svc
            .create(&alice(), message_to_bob("hi bob", now + Duration::days(1)), now)
            .await
            .unwrap();

        assert_eq!(capsule.state, CapsuleState::Locked);
        assert_eq!(capsule.filename, MESSAGE_FILENAME);
        assert_eq!(capsule.content_kind, ContentKind::Text);
        assert_eq!(capsule.original_size, 6);
        assert_eq!(svc.get(&bob(), capsule.id).await.unwrap(), capsule);
    }

    #[tokio::test]
    async fn create_rejects_bad_input() {
        let svc = service();
        let now = Utc::now();

        let mut no_recipient = message_to_bob("x", now + Duration::days(1));
        no_recipient.recipient = None;
        assert!(matches!(
            svc.create(&alice(), no_recipient, now).await,
            Err(CapsuleError::Validation(ValidationError::MissingRecipient))
        ));

        let mut empty = message_to_bob("x", now + Duration::days(1));
        empty.content = None;
        assert!(matches!(
            svc.create(&alice(), empty, now).await,
            Err(CapsuleError::Validation(ValidationError::EmptyCapsule))
        ));

        assert!(matches!(
            svc.create(&alice(), message_to_bob("x", now), now).await,
            Err(CapsuleError::Validation(ValidationError::UnlockNotInFuture))
        ));

        let mut exe = message_to_bob("x", now + Duration::days(1));
        exe.content = Some(CapsuleContent::File {
            filename: "setup.exe".into(),
            bytes: vec![1, 2, 3],
        });
        assert!(matches!(
            svc.create(&alice(), exe, now).await,
            Err(CapsuleError::Validation(ValidationError::FileTypeNotAllowed(_)))
        ));
    }

    #[tokio::test]
    async fn create_enforces_size_limit() {
        let svc = service().with_max_payload_size(8);
        let now = Utc::now();
        let result = svc
            .create(&alice(), message_to_bob("123456789", now + Duration::days(1)), now)
            .await;
        assert!(matches!(
            result,
            Err(CapsuleError::Validation(ValidationError::PayloadTooLarge { size: 9, max: 8 }))
        ));
    }

    #[tokio::test]
    async fn strangers_see_nothing() {
        let svc = service();
        let now = Utc::now();
        let capsule = svc
            .create(&alice(), message_to_bob("private", now + Duration::days(1)), now)
            .await
            .unwrap();

        let mallory = UserId::from("mallory");
        assert!(matches!(
            svc.get(&mallory, capsule.id).await,
            Err(CapsuleError::NotFound(_))
        ));
        assert!(svc.list(&mallory, false).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn locked_capsule_is_preview_only_for_owner() {
        let svc = service();
        let now = Utc::now();
        let capsule = svc
            .create(&alice(), message_to_bob("surprise", now + Duration::days(1)), now)
            .await
            .unwrap();

        let preview = svc.preview(&alice(), capsule.id).await.unwrap();
        assert_eq!(preview.plaintext, b"surprise");
        assert_eq!(preview.content_type, "text/plain");

        assert!(matches!(
            svc.preview(&bob(), capsule.id).await,
            Err(CapsuleError::Locked(_))
        ));
        assert!(matches!(
            svc.download(&alice(), capsule.id).await,
            Err(CapsuleError::Locked(_))
        ));
    }

    #[tokio::test]
    async fn recipient_unlocks_and_downloads() {
        let svc = service();
        let created_at = Utc::now() - Duration::days(2);
        let capsule = svc
            .create(
                &alice(),
                message_to_bob("happy birthday", created_at + Duration::days(1)),
                created_at,
            )
            .await
            .unwrap();

        let now = Utc::now();
        let outcome = svc.unlock(&bob(), capsule.id, now).await.unwrap();
        assert!(matches!(outcome, UnlockOutcome::Unlocked { .. }));

        let opened = svc.download(&bob(), capsule.id).await.unwrap();
        assert_eq!(opened.plaintext, b"happy birthday");
        assert_eq!(opened.capsule.unlocked_at, Some(now));
    }

    #[tokio::test]
    async fn update_swaps_payload_and_reschedules() {
        let svc = service();
        let now = Utc::now();
        let capsule = svc
            .create(&alice(), message_to_bob("draft", now + Duration::days(1)), now)
            .await
            .unwrap();

        let later = now + Duration::days(10);
        let updated = svc
            .update(
                &alice(),
                capsule.id,
                CapsuleChanges {
                    description: Some(None),
                    unlock_at: Some(later),
                    content: Some(CapsuleContent::File {
                        filename: "Photo.PNG".into(),
                        bytes: vec![0x89, b'P', b'N', b'G'],
                    }),
                },
                now,
            )
            .await
            .unwrap();

        assert_eq!(updated.unlock_at, later);
        assert_eq!(updated.description, None);
        assert_eq!(updated.content_kind, ContentKind::Image);
        assert_ne!(updated.ciphertext_ref, capsule.ciphertext_ref);
        assert_ne!(updated.nonce, capsule.nonce);

        assert!(matches!(
            svc.engine().payloads().get(&capsule.ciphertext_ref).await,
            Err(PayloadError::NotFound(_))
        ));
        let preview = svc.preview(&alice(), capsule.id).await.unwrap();
        assert_eq!(preview.plaintext, vec![0x89, b'P', b'N', b'G']);
        assert_eq!(preview.content_type, "image/png");
    }

    #[tokio::test]
    async fn update_rules() {
        let svc = service();
        let now = Utc::now();
        let capsule = svc
            .create(&alice(), message_to_bob("draft", now + Duration::days(1)), now)
            .await
            .unwrap();

        assert!(matches!(
            svc.update(&alice(), capsule.id, CapsuleChanges::default(), now).await,
            Err(CapsuleError::Validation(ValidationError::EmptyUpdate))
        ));
        assert!(matches!(
            svc.update(
                &bob(),
                capsule.id,
                CapsuleChanges {
                    description: Some(Some("hijack".into())),
                    ..Default::default()
                },
                now
            )
            .await,
            Err(CapsuleError::Forbidden(_))
        ));
        assert!(matches!(
            svc.update(
                &alice(),
                capsule.id,
                CapsuleChanges {
                    unlock_at: Some(now - Duration::seconds(1)),
                    ..Default::default()
                },
                now
            )
            .await,
            Err(CapsuleError::Validation(ValidationError::UnlockNotInFuture))
        ));
    }

    #[tokio::test]
    async fn delete_is_owner_only_and_removes_payload() {
        let svc = service();
        let now = Utc::now();
        let capsule = svc
            .create(&alice(), message_to_bob("bye", now + Duration::days(1)), now)
            .await
            .unwrap();

        assert!(matches!(
            svc.delete(&bob(), capsule.id).await,
            Err(CapsuleError::Forbidden(_))
        ));

        svc.delete(&alice(), capsule.id).await.unwrap();
        assert!(matches!(
            svc.get(&alice(), capsule.id).await,
            Err(CapsuleError::NotFound(_))
        ));
        assert!(svc.engine().payloads().get(&capsule.ciphertext_ref).await.is_err());
    }

    #[tokio::test]
    async fn dashboard_covers_sent_and_received() {
        let svc = service();
        let now = Utc::now();
        let soon = svc
            .create(&alice(), message_to_bob("soon", now + Duration::days(2)), now)
            .await
            .unwrap();
        svc.create(&alice(), message_to_bob("later", now + Duration::days(60)), now)
            .await
            .unwrap();
        let mut photo = message_to_bob("", now + Duration::days(5));
        photo.recipient = Some(Recipient::User(alice()));
        photo.content = Some(CapsuleContent::File {
            filename: "beach.png".into(),
            bytes: vec![0x89, 0x50, 0x4e, 0x47],
        });
        let received = svc.create(&bob(), photo, now).await.unwrap();

        let dashboard = svc.dashboard(&alice(), now).await.unwrap();
        assert_eq!(dashboard.stats.total_capsules, 3);
        assert_eq!(dashboard.stats.locked_capsules, 3);
        assert_eq!(dashboard.stats.unlocked_capsules, 0);
        assert_eq!(
            dashboard.upcoming.iter().map(|c| c.id).collect::<Vec<_>>(),
            vec![soon.id, received.id]
        );
        assert_eq!(dashboard.stats.type_breakdown[&ContentKind::Text], 2);
        assert_eq!(dashboard.stats.type_breakdown[&ContentKind::Image], 1);

        let outsider = svc.dashboard(&UserId::from("mallory"), now).await.unwrap();
        assert_eq!(outsider.stats.total_capsules, 0);
        assert!(outsider.upcoming.is_empty());
    }
}
