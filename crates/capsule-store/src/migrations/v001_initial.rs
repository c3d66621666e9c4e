//! v001 -- Initial schema creation.
//!
//! Creates the `capsules` table and the `payloads` blob table.

use rusqlite::Connection;

/// SQL executed when upgrading from version 0 to version 1.
const UP_SQL: &str = r#"
-- ----------------------------------------------------------------
-- Capsules
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS capsules (
    id              TEXT PRIMARY KEY NOT NULL,   -- UUID v4
    owner_id        TEXT NOT NULL,
    recipient_id    TEXT,                        -- registered recipient
    recipient_email TEXT,                        -- external recipient
    unlock_at       TEXT NOT NULL,               -- RFC-3339, fixed width UTC
    state           TEXT NOT NULL DEFAULT 'locked',
    unlocked_at     TEXT,
    ciphertext_ref  TEXT NOT NULL,               -- opaque payload store ref
    nonce           BLOB NOT NULL,               -- 24-byte XChaCha20 nonce
    description     TEXT,
    filename        TEXT NOT NULL,
    content_kind    TEXT NOT NULL,
    original_size   INTEGER NOT NULL,
    created_at      TEXT NOT NULL,

    CHECK (state IN ('locked', 'unlocked')),
    CHECK ((state = 'locked') = (unlocked_at IS NULL)),
    CHECK ((recipient_id IS NULL) <> (recipient_email IS NULL))
);

CREATE INDEX IF NOT EXISTS idx_capsules_due
    ON capsules(state, unlock_at, id);
CREATE INDEX IF NOT EXISTS idx_capsules_owner ON capsules(owner_id);
CREATE INDEX IF NOT EXISTS idx_capsules_recipient ON capsules(recipient_id);

-- ----------------------------------------------------------------
-- Payloads (encrypted blobs, used by the sqlite payload backend)
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS payloads (
    id         TEXT PRIMARY KEY NOT NULL,        -- UUID v4
    data       BLOB NOT NULL,                    -- opaque ciphertext
    size       INTEGER NOT NULL,
    created_at TEXT NOT NULL
);
"#;

/// Apply the initial migration.
pub fn up(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(UP_SQL)
}
