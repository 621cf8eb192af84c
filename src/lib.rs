//! ssh-sync server - backend for synchronizing SSH credentials across machines
//!
//! The core of this crate is the device-pairing handshake: a short-lived
//! challenge/response protocol that lets an already-trusted machine vouch for
//! a new one and hand it the encrypted master key, without the server ever
//! seeing the secret in the clear.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────┐
//! │                     Connections                      │
//! │   new machine (no credentials)  │  responder (auth)  │
//! └────────────────────┬─────────────────────────────────┘
//!                      │
//! ┌────────────────────▼─────────────────────────────────┐
//! │                Handshake Handlers                    │
//! │   session table  │  rendezvous channels  │  timeout  │
//! └────────────────────┬─────────────────────────────────┘
//!                      │
//! ┌────────────────────▼─────────────────────────────────┐
//! │           Coordination Bus (optional)                │
//! │   per-node pub/sub  │  challenge ownership metadata  │
//! └──────────────────────────────────────────────────────┘
//! ```

pub mod api;
pub mod auth;
pub mod bus;
pub mod config;
pub mod crypto;
pub mod db;
pub mod error;
pub mod pairing;
pub mod transport;

pub use auth::{AuthedMachine, Authenticator};
pub use bus::{Broker, CoordinationBus, MemoryBroker, RedisBroker};
pub use config::Config;
pub use crypto::{KeyType, ParsedKeys};
pub use db::{DbConn, DbPool};
pub use error::{Error, Result};
pub use pairing::{
    HandshakeContext, KeyMaterial, PairingSession, Rendezvous, SessionTable,
};
pub use transport::TypedStream;
