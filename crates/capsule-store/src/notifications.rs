use capsule_shared::{CapsuleId, UserId};
use chrono::{DateTime, Utc};
use rusqlite::params;
use uuid::Uuid;

use crate::convert::{ts_from_sql, ts_to_sql, uuid_from_sql};
use crate::database::Database;
use crate::error::Result;
use crate::models::Notification;

impl Database {
    /// Insert a notification unless one with the same user, capsule and kind
    /// already exists. Returns whether a row was written.
    pub fn insert_notification(&self, n: &Notification) -> Result<bool> {
        let affected = self.conn().execute(
            "INSERT OR IGNORE INTO notifications
                 (id, user_id, kind, capsule_id, sender_id, message, created_at, read, read_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                n.id.to_string(),
                n.user_id.as_str(),
                n.kind,
                n.capsule_id.to_string(),
                n.sender_id.as_str(),
                n.message,
                ts_to_sql(&n.created_at),
                n.read,
                n.read_at.as_ref().map(ts_to_sql),
            ],
        )?;
        Ok(affected > 0)
    }

    pub fn list_notifications(&self, user: &UserId, unread_only: bool) -> Result<Vec<Notification>> {
        let mut stmt = self.conn().prepare(
            "SELECT id, user_id, kind, capsule_id, sender_id, message, created_at, read, read_at
             FROM notifications
             WHERE user_id = ?1 AND (?2 = 0 OR read = 0)
             ORDER BY created_at DESC",
        )?;

        let rows = stmt.query_map(params![user.as_str(), unread_only], row_to_notification)?;

        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    /// Mark one of `user`'s notifications read. Returns `false` if no such
    /// notification belongs to the user.
    pub fn mark_notification_read(&self, id: Uuid, user: &UserId, at: DateTime<Utc>) -> Result<bool> {
        let affected = self.conn().execute(
            "UPDATE notifications SET read = 1, read_at = COALESCE(read_at, ?3)
             WHERE id = ?1 AND user_id = ?2",
            params![id.to_string(), user.as_str(), ts_to_sql(&at)],
        )?;
        Ok(affected > 0)
    }
}

fn row_to_notification(row: &rusqlite::Row<'_>) -> rusqlite::Result<Notification> {
    let id_str: String = row.get(0)?;
    let user_id: String = row.get(1)?;
    let kind: String = row.get(2)?;
    let capsule_str: String = row.get(3)?;
    let sender_id: String = row.get(4)?;
    let message: String = row.get(5)?;
    let created_str: String = row.get(6)?;
    let read: bool = row.get(7)?;
    let read_at_str: Option<String> = row.get(8)?;

    Ok(Notification {
        id: uuid_from_sql(0, &id_str)?,
        user_id: UserId(user_id),
        kind,
        capsule_id: CapsuleId(uuid_from_sql(3, &capsule_str)?),
        sender_id: UserId(sender_id),
        message,
        created_at: ts_from_sql(6, &created_str)?,
        read,
        read_at: read_at_str.map(|s| ts_from_sql(8, &s)).transpose()?,
    })
}
