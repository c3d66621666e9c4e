//! Domain model structs persisted in the SQLite database.

use capsule_shared::crypto::Nonce;
use capsule_shared::{CapsuleId, ContentKind, PayloadRef, Recipient, UserId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Capsule
// ---------------------------------------------------------------------------

/// Lifecycle state of a capsule. `Unlocked` is terminal.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CapsuleState {
    Locked,
    Unlocked,
}

impl CapsuleState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Locked => "locked",
            Self::Unlocked => "unlocked",
        }
    }
}

/// A time capsule: metadata plus a pointer to its encrypted payload.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Capsule {
    /// Unique capsule identifier, assigned at creation.
    pub id: CapsuleId,
    /// Account that created the capsule.
    pub owner_id: UserId,
    /// Registered user or raw email address the capsule is released to.
    pub recipient: Recipient,
    /// Earliest moment the capsule may be unlocked.
    pub unlock_at: DateTime<Utc>,
    pub state: CapsuleState,
    /// Set exactly once, by the first successful transition to `Unlocked`.
    pub unlocked_at: Option<DateTime<Utc>>,
    /// Where the ciphertext lives in the payload store.
    pub ciphertext_ref: PayloadRef,
    /// Nonce the payload was sealed with. Losing it loses the payload.
    pub nonce: Nonce,
    /// Plaintext note shown before unlock; never encrypted.
    pub description: Option<String>,
    /// Original file name (or `message.txt` for message capsules).
    pub filename: String,
    pub content_kind: ContentKind,
    /// Plaintext size in bytes.
    pub original_size: i64,
    pub created_at: DateTime<Utc>,
}

impl Capsule {
    pub fn is_unlocked(&self) -> bool {
        self.state == CapsuleState::Unlocked
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        now >= self.unlock_at
    }

    /// Owners and registered recipients can see a capsule.
    pub fn is_visible_to(&self, user: &UserId) -> bool {
        &self.owner_id == user || self.recipient.user_id() == Some(user)
    }

    /// Resume point for the due listing after this capsule.
    pub fn due_cursor(&self) -> DueCursor {
        DueCursor {
            unlock_at: self.unlock_at,
            id: self.id,
        }
    }
}

/// Keyset position in the `(unlock_at, id)` ordering of due capsules.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DueCursor {
    pub unlock_at: DateTime<Utc>,
    pub id: CapsuleId,
}

/// Result of the conditional `Locked -> Unlocked` write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transition {
    /// This caller performed the transition.
    Unlocked(Capsule),
    /// The capsule was no longer locked; nothing was written.
    Conflict,
    /// Still locked, but `unlock_at` is later than the requested time.
    NotDue(DateTime<Utc>),
}

/// Replacement payload for a still-locked capsule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PayloadSwap {
    pub ciphertext_ref: PayloadRef,
    pub nonce: Nonce,
    pub filename: String,
    pub content_kind: ContentKind,
    pub original_size: i64,
}

/// Fields to change on a locked capsule. `None` leaves a field untouched;
/// `description: Some(None)` clears the description.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CapsuleUpdate {
    pub description: Option<Option<String>>,
    pub unlock_at: Option<DateTime<Utc>>,
    pub payload: Option<PayloadSwap>,
}

impl CapsuleUpdate {
    pub fn is_empty(&self) -> bool {
        self.description.is_none() && self.unlock_at.is_none() && self.payload.is_none()
    }
}

// ---------------------------------------------------------------------------
// Notification
// ---------------------------------------------------------------------------

/// An in-app notification shown to a registered user.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Notification {
    pub id: Uuid,
    /// The user who sees the notification.
    pub user_id: UserId,
    /// Notification kind, e.g. `capsule_release`.
    pub kind: String,
    pub capsule_id: CapsuleId,
    /// Owner of the capsule that triggered the notification.
    pub sender_id: UserId,
    pub message: String,
    pub created_at: DateTime<Utc>,
    pub read: bool,
    pub read_at: Option<DateTime<Utc>>,
}
