//! Enrolled machines and their public keys

use rusqlite::OptionalExtension as _;

use crate::Result;
use crate::crypto::KeyType;
use crate::db::{DbPool, get_conn};

/// One enrolled machine
#[derive(Debug, Clone)]
pub struct Machine {
    pub id: i64,
    pub user_id: i64,
    pub name: String,
    /// PEM-encoded signing key
    pub public_key: Vec<u8>,
    pub key_type: KeyType,
    /// ML-KEM-768 encapsulation key PEM, hybrid devices only
    pub encapsulation_key: Option<Vec<u8>>,
}

/// Queries over the `machines` table
#[derive(Clone)]
pub struct MachineRepo {
    pool: DbPool,
}

impl MachineRepo {
    /// Repository over `pool`
    #[must_use]
    pub const fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    /// Whether `name` is already taken under this account.
    ///
    /// # Errors
    ///
    /// Returns error on pool or query failure.
    pub fn exists(&self, user_id: i64, name: &str) -> Result<bool> {
        let conn = get_conn(&self.pool)?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM machines WHERE user_id = ?1 AND name = ?2",
            rusqlite::params![user_id, name],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    /// Enroll a machine.
    ///
    /// # Errors
    ///
    /// Returns error on pool or query failure, including a duplicate name
    /// under the same account.
    pub fn create(
        &self,
        user_id: i64,
        name: &str,
        public_key: &[u8],
        key_type: KeyType,
        encapsulation_key: Option<&[u8]>,
    ) -> Result<Machine> {
        let conn = get_conn(&self.pool)?;
        conn.execute(
            "INSERT INTO machines (user_id, name, public_key, key_type, encapsulation_key)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            rusqlite::params![user_id, name, public_key, key_type.as_str(), encapsulation_key],
        )?;
        Ok(Machine {
            id: conn.last_insert_rowid(),
            user_id,
            name: name.to_string(),
            public_key: public_key.to_vec(),
            key_type,
            encapsulation_key: encapsulation_key.map(<[u8]>::to_vec),
        })
    }

    /// Look up a machine by account and name. Used by request
    /// authentication to fetch the stored verification key.
    ///
    /// # Errors
    ///
    /// Returns error on pool or query failure.
    pub fn find(&self, username: &str, machine_name: &str) -> Result<Option<Machine>> {
        let conn = get_conn(&self.pool)?;
        let machine = conn
            .query_row(
                "SELECT m.id, m.user_id, m.name, m.public_key, m.key_type, m.encapsulation_key
                 FROM machines m JOIN users u ON u.id = m.user_id
                 WHERE u.username = ?1 AND m.name = ?2",
                [username, machine_name],
                |row| {
                    let key_type: String = row.get(4)?;
                    Ok(Machine {
                        id: row.get(0)?,
                        user_id: row.get(1)?,
                        name: row.get(2)?,
                        public_key: row.get(3)?,
                        key_type: KeyType::parse(&key_type),
                        encapsulation_key: row.get(5)?,
                    })
                },
            )
            .optional()?;
        Ok(machine)
    }
}
