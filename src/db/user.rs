//! User accounts

use rusqlite::OptionalExtension as _;

use crate::Result;
use crate::db::{DbPool, get_conn};

/// A registered account
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct User {
    pub id: i64,
    pub username: String,
}

/// Queries over the `users` table
#[derive(Clone)]
pub struct UserRepo {
    pool: DbPool,
}

impl UserRepo {
    /// Repository over `pool`
    #[must_use]
    pub const fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    /// Look up an account by username.
    ///
    /// # Errors
    ///
    /// Returns error on pool or query failure.
    pub fn find_by_username(&self, username: &str) -> Result<Option<User>> {
        let conn = get_conn(&self.pool)?;
        let user = conn
            .query_row(
                "SELECT id, username FROM users WHERE username = ?1",
                [username],
                |row| {
                    Ok(User {
                        id: row.get(0)?,
                        username: row.get(1)?,
                    })
                },
            )
            .optional()?;
        Ok(user)
    }

    /// Create an account.
    ///
    /// # Errors
    ///
    /// Returns error on pool or query failure, including a duplicate
    /// username.
    pub fn create(&self, username: &str) -> Result<User> {
        let conn = get_conn(&self.pool)?;
        conn.execute("INSERT INTO users (username) VALUES (?1)", [username])?;
        Ok(User {
            id: conn.last_insert_rowid(),
            username: username.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;

    #[test]
    fn create_and_find() {
        let repo = UserRepo::new(db::init_memory().unwrap());
        assert!(repo.find_by_username("alice").unwrap().is_none());

        let created = repo.create("alice").unwrap();
        let found = repo.find_by_username("alice").unwrap().unwrap();
        assert_eq!(created, found);
    }

    #[test]
    fn duplicate_username_rejected() {
        let repo = UserRepo::new(db::init_memory().unwrap());
        repo.create("alice").unwrap();
        assert!(repo.create("alice").is_err());
    }
}
