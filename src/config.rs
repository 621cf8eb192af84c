//! Server configuration
//!
//! Configuration is assembled from CLI flags and environment variables in
//! `main.rs`. The broker section is optional; without it the server runs in
//! single-node mode and cross-node pairing is unavailable.

use std::path::PathBuf;

use crate::{Error, Result};

/// Default listen port
pub const DEFAULT_PORT: u16 = 18799;

/// Seconds a responder has to answer a challenge
pub const HANDSHAKE_TIMEOUT_SECS: u64 = 30;

/// Server configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Port to listen on
    pub port: u16,

    /// Path to the `SQLite` database file
    pub db_path: PathBuf,

    /// Coordination broker, if configured
    pub broker: Option<BrokerConfig>,

    /// This node's identity on the bus
    pub node_id: String,
}

/// Connection settings for the shared coordination broker
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    /// Broker address as `host:port`
    pub addr: String,

    /// Optional password
    pub password: Option<String>,

    /// Logical database index
    pub db: u32,
}

impl BrokerConfig {
    /// Build the connection URL for the broker client
    #[must_use]
    pub fn url(&self) -> String {
        match &self.password {
            Some(pw) => format!("redis://:{pw}@{}/{}", self.addr, self.db),
            None => format!("redis://{}/{}", self.addr, self.db),
        }
    }
}

impl Config {
    /// Build a configuration, resolving the node identity.
    ///
    /// The node identity comes from `node_id` when given, otherwise from the
    /// machine's hostname.
    ///
    /// # Errors
    ///
    /// Returns error if no node identity was given and the hostname cannot
    /// be resolved.
    pub fn new(
        port: u16,
        db_path: PathBuf,
        broker: Option<BrokerConfig>,
        node_id: Option<String>,
    ) -> Result<Self> {
        let node_id = match node_id {
            Some(id) => id,
            None => hostname::get()
                .map_err(|e| Error::Config(format!("cannot resolve hostname: {e}")))?
                .to_string_lossy()
                .into_owned(),
        };

        Ok(Self {
            port,
            db_path,
            broker,
            node_id,
        })
    }
}
