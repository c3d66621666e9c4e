//! Encrypted payload blobs kept inside the database itself.
//!
//! This is the single-file alternative to storing ciphertext on disk: the
//! blob lives in the `payloads` table and is addressed by a UUID.

use chrono::Utc;
use rusqlite::params;
use uuid::Uuid;

use crate::convert::ts_to_sql;
use crate::database::Database;
use crate::error::{not_found, Result};

impl Database {
    pub fn insert_payload(&self, data: &[u8]) -> Result<Uuid> {
        let id = Uuid::new_v4();
        self.conn().execute(
            "INSERT INTO payloads (id, data, size, created_at) VALUES (?1, ?2, ?3, ?4)",
            params![id.to_string(), data, data.len() as i64, ts_to_sql(&Utc::now())],
        )?;
        Ok(id)
    }

    pub fn get_payload(&self, id: Uuid) -> Result<Vec<u8>> {
        self.conn()
            .query_row(
                "SELECT data FROM payloads WHERE id = ?1",
                params![id.to_string()],
                |row| row.get(0),
            )
            .map_err(not_found)
    }

    pub fn delete_payload(&self, id: Uuid) -> Result<bool> {
        let affected = self
            .conn()
            .execute("DELETE FROM payloads WHERE id = ?1", params![id.to_string()])?;
        Ok(affected > 0)
    }
}
