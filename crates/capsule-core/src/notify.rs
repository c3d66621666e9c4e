//! Release notifications.
//!
//! The engine calls [`UnlockListener::on_unlocked`] only for the caller that
//! won the unlock transition, and the notification table is unique on
//! `(user, capsule, kind)`, so a capsule produces at most one release
//! notification per user no matter how many unlockers race.

use async_trait::async_trait;
use capsule_shared::constants::NOTIFICATION_CAPSULE_RELEASE;
use capsule_shared::{Recipient, UserId};
use capsule_store::{Capsule, Notification};
use chrono::Utc;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::db::{run_blocking, DbError, SharedDb};

/// Side effects of a fresh unlock. Implementations must not fail the unlock;
/// errors are theirs to log.
#[async_trait]
pub trait UnlockListener: Send + Sync {
    async fn on_unlocked(&self, capsule: &Capsule);
}

/// In-app notifications stored next to the capsules.
#[derive(Clone)]
pub struct NotificationCenter {
    db: SharedDb,
}

impl NotificationCenter {
    pub fn new(db: SharedDb) -> Self {
        Self { db }
    }

    pub async fn list(&self, user: &UserId, unread_only: bool) -> Result<Vec<Notification>, DbError> {
        let user = user.clone();
        run_blocking(&self.db, move |db| db.list_notifications(&user, unread_only)).await
    }

    /// Returns `false` when the notification does not exist or belongs to
    /// someone else.
    pub async fn mark_read(&self, id: Uuid, user: &UserId) -> Result<bool, DbError> {
        let user = user.clone();
        let now = Utc::now();
        run_blocking(&self.db, move |db| db.mark_notification_read(id, &user, now)).await
    }
}

/// Who gets told about a release, and what they are told.
///
/// A registered recipient hears that a capsule arrived. An email-only
/// recipient has no inbox here, so the owner is told the capsule is out.
pub fn release_notification(capsule: &Capsule) -> Notification {
    let (user_id, message) = match &capsule.recipient {
        Recipient::User(recipient) => (
            recipient.clone(),
            "You received a capsule released today".to_string(),
        ),
        Recipient::Email(_) => (
            capsule.owner_id.clone(),
            "Your capsule is now available".to_string(),
        ),
    };

    Notification {
        id: Uuid::new_v4(),
        user_id,
        kind: NOTIFICATION_CAPSULE_RELEASE.to_string(),
        capsule_id: capsule.id,
        sender_id: capsule.owner_id.clone(),
        message,
        created_at: capsule.unlocked_at.unwrap_or_else(Utc::now),
        read: false,
        read_at: None,
    }
}

#[async_trait]
impl UnlockListener for NotificationCenter {
    async fn on_unlocked(&self, capsule: &Capsule) {
        let notification = release_notification(capsule);
        let capsule_id = capsule.id;
        let user = notification.user_id.clone();

        match run_blocking(&self.db, move |db| db.insert_notification(&notification)).await {
            Ok(true) => debug!(capsule = %capsule_id, user = %user, "Release notification created"),
            Ok(false) => debug!(capsule = %capsule_id, user = %user, "Release notification already exists"),
            Err(e) => warn!(capsule = %capsule_id, error = %e, "Failed to create release notification"),
        }
    }
}
