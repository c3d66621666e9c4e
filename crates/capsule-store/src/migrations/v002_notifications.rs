use rusqlite::Connection;

const UP_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS notifications (
    id         TEXT PRIMARY KEY NOT NULL,   -- UUID v4
    user_id    TEXT NOT NULL,
    kind       TEXT NOT NULL,               -- e.g. capsule_release
    capsule_id TEXT NOT NULL,
    sender_id  TEXT NOT NULL,
    message    TEXT NOT NULL,
    created_at TEXT NOT NULL,
    read       INTEGER NOT NULL DEFAULT 0,  -- boolean 0/1
    read_at    TEXT
);

CREATE INDEX IF NOT EXISTS idx_notifications_user
    ON notifications(user_id, created_at DESC);
-- One release notification per user and capsule, however often it is emitted.
CREATE UNIQUE INDEX IF NOT EXISTS idx_notifications_unique
    ON notifications(user_id, capsule_id, kind);
"#;

pub fn up(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(UP_SQL)
}
