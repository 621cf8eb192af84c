//! `SQLite` persistence
//!
//! Connections come from an r2d2 pool over rusqlite. Repositories own a
//! pool handle and expose the narrow set of queries the server needs.

pub mod machine;
pub mod schema;
pub mod user;

use std::path::Path;

use r2d2_sqlite::SqliteConnectionManager;

pub use machine::{Machine, MachineRepo};
pub use user::{User, UserRepo};

use crate::{Error, Result};

/// Connection pool
pub type DbPool = r2d2::Pool<SqliteConnectionManager>;

/// One checked-out connection
pub type DbConn = r2d2::PooledConnection<SqliteConnectionManager>;

/// Open (creating if needed) the database at `path` and apply the schema.
///
/// # Errors
///
/// Returns error if the pool cannot be built or the schema fails to apply.
pub fn init(path: &Path) -> Result<DbPool> {
    let manager = SqliteConnectionManager::file(path);
    let pool = r2d2::Pool::new(manager).map_err(|e| Error::Database(e.to_string()))?;
    schema::apply(&get_conn(&pool)?)?;
    Ok(pool)
}

/// In-memory database for tests.
///
/// The pool is capped at one connection; separate connections to `:memory:`
/// would each get their own empty database.
///
/// # Errors
///
/// Returns error if the pool cannot be built or the schema fails to apply.
pub fn init_memory() -> Result<DbPool> {
    let manager = SqliteConnectionManager::memory();
    let pool = r2d2::Pool::builder()
        .max_size(1)
        .build(manager)
        .map_err(|e| Error::Database(e.to_string()))?;
    schema::apply(&get_conn(&pool)?)?;
    Ok(pool)
}

/// Check a connection out of the pool.
///
/// # Errors
///
/// Returns [`Error::Database`] if the pool is exhausted or broken.
pub fn get_conn(pool: &DbPool) -> Result<DbConn> {
    pool.get().map_err(|e| Error::Database(e.to_string()))
}
