use capsule_shared::{CapsuleId, ContentKind, PayloadRef, Recipient, UserId};
use chrono::{DateTime, Utc};
use rusqlite::params;

use crate::convert::{array_from_sql, invalid_text, ts_from_sql, ts_to_sql, uuid_from_sql};
use crate::database::Database;
use crate::error::{not_found, Result, StoreError};
use crate::models::{Capsule, CapsuleState, CapsuleUpdate, DueCursor, Transition};

const CAPSULE_COLUMNS: &str = "id, owner_id, recipient_id, recipient_email, unlock_at, state, \
     unlocked_at, ciphertext_ref, nonce, description, filename, content_kind, original_size, \
     created_at";

impl Database {
    pub fn insert_capsule(&self, capsule: &Capsule) -> Result<()> {
        self.conn().execute(
            &format!(
                "INSERT INTO capsules ({CAPSULE_COLUMNS})
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)"
            ),
            params![
                capsule.id.to_string(),
                capsule.owner_id.as_str(),
                capsule.recipient.user_id().map(UserId::as_str),
                capsule.recipient.email(),
                ts_to_sql(&capsule.unlock_at),
                capsule.state.as_str(),
                capsule.unlocked_at.as_ref().map(ts_to_sql),
                capsule.ciphertext_ref.as_str(),
                capsule.nonce.as_slice(),
                capsule.description,
                capsule.filename,
                capsule.content_kind.as_str(),
                capsule.original_size,
                ts_to_sql(&capsule.created_at),
            ],
        )?;
        Ok(())
    }

    pub fn get_capsule(&self, id: CapsuleId) -> Result<Capsule> {
        self.conn()
            .query_row(
                &format!("SELECT {CAPSULE_COLUMNS} FROM capsules WHERE id = ?1"),
                params![id.to_string()],
                row_to_capsule,
            )
            .map_err(not_found)
    }

    /// One page of locked capsules with `unlock_at <= now`, ordered by
    /// `(unlock_at, id)` and strictly after `after` when given.
    ///
    /// Walking pages with the last capsule's [`DueCursor`] visits every due
    /// capsule once even while other writers unlock rows mid-walk.
    pub fn list_locked_due(
        &self,
        now: DateTime<Utc>,
        after: Option<&DueCursor>,
        limit: usize,
    ) -> Result<Vec<Capsule>> {
        let mut stmt = self.conn().prepare(&format!(
            "SELECT {CAPSULE_COLUMNS}
             FROM capsules
             WHERE state = 'locked'
               AND unlock_at <= ?1
               AND (?2 IS NULL OR unlock_at > ?2 OR (unlock_at = ?2 AND id > ?3))
             ORDER BY unlock_at ASC, id ASC
             LIMIT ?4"
        ))?;

        let rows = stmt.query_map(
            params![
                ts_to_sql(&now),
                after.map(|c| ts_to_sql(&c.unlock_at)),
                after.map(|c| c.id.to_string()),
                limit as i64,
            ],
            row_to_capsule,
        )?;

        let mut capsules = Vec::new();
        for row in rows {
            capsules.push(row?);
        }
        Ok(capsules)
    }

    /// Compare-and-swap `Locked -> Unlocked`.
    ///
    /// Only the caller whose update matches a still-locked, due row sees
    /// [`Transition::Unlocked`]; everyone else gets [`Transition::Conflict`]
    /// (already unlocked) or [`Transition::NotDue`] (rescheduled past
    /// `unlocked_at` since it was read), and nothing is written.
    pub fn transition_capsule_to_unlocked(
        &self,
        id: CapsuleId,
        unlocked_at: DateTime<Utc>,
    ) -> Result<Transition> {
        let at = ts_to_sql(&unlocked_at);
        let affected = self.conn().execute(
            "UPDATE capsules
             SET state = 'unlocked', unlocked_at = ?2
             WHERE id = ?1 AND state = 'locked' AND unlock_at <= ?2",
            params![id.to_string(), at],
        )?;

        if affected == 1 {
            return self.get_capsule(id).map(Transition::Unlocked);
        }

        // Distinguish "someone else won" from "moved" from "no such capsule".
        let current = self.get_capsule(id)?;
        if current.is_unlocked() {
            Ok(Transition::Conflict)
        } else {
            Ok(Transition::NotDue(current.unlock_at))
        }
    }

    /// Apply `update` to a capsule that is still locked.
    ///
    /// The state check and the write are one statement, so an update racing
    /// an unlock either lands before it or fails with
    /// [`StoreError::InvalidState`].
    pub fn update_capsule(&self, id: CapsuleId, update: &CapsuleUpdate) -> Result<Capsule> {
        let payload = update.payload.as_ref();
        let affected = self.conn().execute(
            "UPDATE capsules SET
                 description    = CASE WHEN ?2 THEN ?3 ELSE description END,
                 unlock_at      = COALESCE(?4, unlock_at),
                 ciphertext_ref = COALESCE(?5, ciphertext_ref),
                 nonce          = COALESCE(?6, nonce),
                 filename       = COALESCE(?7, filename),
                 content_kind   = COALESCE(?8, content_kind),
                 original_size  = COALESCE(?9, original_size)
             WHERE id = ?1 AND state = 'locked'",
            params![
                id.to_string(),
                update.description.is_some(),
                update.description.clone().flatten(),
                update.unlock_at.as_ref().map(ts_to_sql),
                payload.map(|p| p.ciphertext_ref.as_str()),
                payload.map(|p| p.nonce.as_slice()),
                payload.map(|p| p.filename.as_str()),
                payload.map(|p| p.content_kind.as_str()),
                payload.map(|p| p.original_size),
            ],
        )?;

        if affected == 0 {
            self.get_capsule(id)?;
            return Err(StoreError::InvalidState);
        }

        self.get_capsule(id)
    }

    pub fn delete_capsule(&self, id: CapsuleId) -> Result<bool> {
        let affected = self
            .conn()
            .execute("DELETE FROM capsules WHERE id = ?1", params![id.to_string()])?;
        Ok(affected > 0)
    }

    /// Capsules the user sent or received, newest first.
    pub fn list_capsules_for_user(&self, user: &UserId, unlocked_only: bool) -> Result<Vec<Capsule>> {
        let mut stmt = self.conn().prepare(&format!(
            "SELECT {CAPSULE_COLUMNS}
             FROM capsules
             WHERE (owner_id = ?1 OR recipient_id = ?1)
               AND (?2 = 0 OR state = 'unlocked')
             ORDER BY created_at DESC"
        ))?;

        let rows = stmt.query_map(params![user.as_str(), unlocked_only], row_to_capsule)?;

        let mut capsules = Vec::new();
        for row in rows {
            capsules.push(row?);
        }
        Ok(capsules)
    }
}

fn row_to_capsule(row: &rusqlite::Row<'_>) -> rusqlite::Result<Capsule> {
    let id_str: String = row.get(0)?;
    let owner_id: String = row.get(1)?;
    let recipient_id: Option<String> = row.get(2)?;
    let recipient_email: Option<String> = row.get(3)?;
    let unlock_str: String = row.get(4)?;
    let state_str: String = row.get(5)?;
    let unlocked_str: Option<String> = row.get(6)?;
    let ciphertext_ref: String = row.get(7)?;
    let nonce_bytes: Vec<u8> = row.get(8)?;
    let description: Option<String> = row.get(9)?;
    let filename: String = row.get(10)?;
    let kind_str: String = row.get(11)?;
    let original_size: i64 = row.get(12)?;
    let created_str: String = row.get(13)?;

    let recipient = match (recipient_id, recipient_email) {
        (Some(id), None) => Recipient::User(UserId(id)),
        (None, Some(email)) => Recipient::Email(email),
        _ => return Err(invalid_text(2, "capsule must have exactly one recipient".into())),
    };

    let state = match state_str.as_str() {
        "locked" => CapsuleState::Locked,
        "unlocked" => CapsuleState::Unlocked,
        other => return Err(invalid_text(5, format!("unknown capsule state '{other}'"))),
    };

    Ok(Capsule {
        id: CapsuleId(uuid_from_sql(0, &id_str)?),
        owner_id: UserId(owner_id),
        recipient,
        unlock_at: ts_from_sql(4, &unlock_str)?,
        state,
        unlocked_at: unlocked_str.map(|s| ts_from_sql(6, &s)).transpose()?,
        ciphertext_ref: PayloadRef(ciphertext_ref),
        nonce: array_from_sql(8, &nonce_bytes)?,
        description,
        filename,
        content_kind: ContentKind::from_db(&kind_str),
        original_size,
        created_at: ts_from_sql(13, &created_str)?,
    })
}
