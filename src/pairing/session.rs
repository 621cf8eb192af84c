//! In-memory table of pairing attempts on this node
//!
//! A [`PairingSession`] exists from the moment a challenge phrase is issued
//! until the handshake finishes or dies. The session owns the rendezvous
//! points the two connection handlers (and the coordination bus dispatcher)
//! use to hand values to each other. The table is keyed by challenge phrase.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::pairing::rendezvous::Rendezvous;
use crate::pairing::state::{HandshakeEvent, HandshakeState};
use crate::{Error, Result};

/// Public key material uploaded by the machine being enrolled
#[derive(Debug, Clone)]
pub struct KeyMaterial {
    /// PEM-encoded signing key
    pub public_key: Vec<u8>,

    /// Optional ML-KEM-768 encapsulation key PEM
    pub encapsulation_key: Option<Vec<u8>>,
}

/// One in-flight pairing attempt
#[derive(Debug)]
pub struct PairingSession {
    /// Challenge phrase, also the table key
    pub challenge: String,

    /// Account being paired into
    pub username: String,

    /// Name the new machine will be stored under
    pub machine_name: String,

    /// `true` when a trusted device accepted in time, `false` on timeout
    pub accepted: Rendezvous<bool>,

    /// New machine's key material, headed to the responder
    pub machine_key: Rendezvous<KeyMaterial>,

    /// Encrypted master key, headed back to the new machine
    pub encrypted_key: Rendezvous<Vec<u8>>,

    state: Mutex<HandshakeState>,

    /// Node the responder is connected to, when acceptance arrived over the
    /// bus. Empty for same-node acceptance.
    owner_node: Mutex<Option<String>>,
}

impl PairingSession {
    /// Create a session in the [`HandshakeState::Issued`] state
    #[must_use]
    pub fn new(challenge: String, username: String, machine_name: String) -> Arc<Self> {
        Arc::new(Self {
            challenge,
            username,
            machine_name,
            accepted: Rendezvous::new(),
            machine_key: Rendezvous::new(),
            encrypted_key: Rendezvous::new(),
            state: Mutex::new(HandshakeState::Issued),
            owner_node: Mutex::new(None),
        })
    }

    /// Current lifecycle state
    pub fn state(&self) -> HandshakeState {
        *self.state.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Drive the state machine forward.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Protocol`] on an illegal transition; the stored
    /// state is left untouched.
    pub fn advance(&self, event: HandshakeEvent) -> Result<HandshakeState> {
        let mut state = self
            .state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let next = state.apply(event)?;
        *state = next;
        Ok(next)
    }

    /// Record which node the responder is on
    pub fn set_owner_node(&self, node: String) {
        *self
            .owner_node
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = Some(node);
    }

    /// Node the responder is on, if acceptance came over the bus
    pub fn owner_node(&self) -> Option<String> {
        self.owner_node
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }

    /// Close every rendezvous, waking anything still parked on the session
    pub fn close(&self) {
        self.accepted.close();
        self.machine_key.close();
        self.encrypted_key.close();
    }
}

/// Challenge-phrase-keyed table of live sessions
#[derive(Debug, Default)]
pub struct SessionTable {
    sessions: Mutex<HashMap<String, Arc<PairingSession>>>,
}

impl SessionTable {
    /// Create an empty table
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a new session.
    ///
    /// Deliberately never overwrites: replacing a live entry would strand
    /// the earlier attempt's handler on channels nobody can reach, so a
    /// duplicate phrase is rejected and the issuer draws a fresh one.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Protocol`] if a session with the same challenge
    /// phrase is already live.
    pub fn insert(&self, session: Arc<PairingSession>) -> Result<()> {
        let mut sessions = self
            .sessions
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if sessions.contains_key(&session.challenge) {
            return Err(Error::Protocol(format!(
                "challenge {:?} already in flight",
                session.challenge
            )));
        }
        sessions.insert(session.challenge.clone(), session);
        Ok(())
    }

    /// Look up a live session by challenge phrase
    pub fn get(&self, challenge: &str) -> Option<Arc<PairingSession>> {
        self.sessions
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .get(challenge)
            .cloned()
    }

    /// Remove a session, returning it if it was present
    pub fn remove(&self, challenge: &str) -> Option<Arc<PairingSession>> {
        self.sessions
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .remove(challenge)
    }

    /// Number of live sessions
    pub fn len(&self) -> usize {
        self.sessions
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .len()
    }

    /// Whether any session is live
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
