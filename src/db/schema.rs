//! Table definitions

use crate::Result;
use crate::db::DbConn;

/// Apply the schema. Safe to run on every startup.
///
/// # Errors
///
/// Returns error if a statement fails.
pub fn apply(conn: &DbConn) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS users (
            id          INTEGER PRIMARY KEY AUTOINCREMENT,
            username    TEXT NOT NULL UNIQUE,
            created_at  TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE TABLE IF NOT EXISTS machines (
            id                  INTEGER PRIMARY KEY AUTOINCREMENT,
            user_id             INTEGER NOT NULL REFERENCES users(id),
            name                TEXT NOT NULL,
            public_key          BLOB NOT NULL,
            key_type            TEXT NOT NULL,
            encapsulation_key   BLOB,
            created_at          TEXT NOT NULL DEFAULT (datetime('now')),
            UNIQUE(user_id, name)
        );

        CREATE INDEX IF NOT EXISTS idx_machines_user ON machines(user_id);
        ",
    )?;
    Ok(())
}
