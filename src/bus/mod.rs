//! Cross-node challenge coordination
//!
//! When a deployment runs more than one server node, the new machine and the
//! responding trusted device may land on different nodes. The bus advertises
//! live challenges in a shared broker and relays handshake material between
//! the two nodes over per-node event channels. Without a configured broker
//! the bus is disabled and pairing works on a single node only.

pub mod broker;
pub mod events;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

pub use broker::{Broker, MemoryBroker, RedisBroker};
pub use events::{
    AcceptedPayload, ChallengeEvent, ChallengerKeyPayload, EncryptedKeyPayload, EventKind,
    SessionMeta,
};

use crate::config::HANDSHAKE_TIMEOUT_SECS;
use crate::pairing::{KeyMaterial, Rendezvous, SessionTable};
use crate::{Error, Result};

/// Waiting slot for a responder whose new machine is on another node
#[derive(Debug)]
pub struct RemoteWait {
    /// Relayed key material from the remote node
    pub machine_key: Rendezvous<KeyMaterial>,

    /// Relayed encrypted master key, for the rare case where the secret
    /// event lands on a node holding only the wait
    pub encrypted_key: Rendezvous<Vec<u8>>,
}

/// Handle to the coordination layer
pub struct CoordinationBus {
    node_id: String,
    broker: Option<Arc<dyn Broker>>,
    remote_waits: Mutex<HashMap<String, Arc<RemoteWait>>>,
}

impl CoordinationBus {
    /// Bus for a node with no broker configured
    #[must_use]
    pub fn disabled(node_id: String) -> Arc<Self> {
        Arc::new(Self {
            node_id,
            broker: None,
            remote_waits: Mutex::new(HashMap::new()),
        })
    }

    /// Bus backed by a broker
    #[must_use]
    pub fn new(broker: Arc<dyn Broker>, node_id: String) -> Arc<Self> {
        Arc::new(Self {
            node_id,
            broker: Some(broker),
            remote_waits: Mutex::new(HashMap::new()),
        })
    }

    /// Whether cross-node coordination is available
    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.broker.is_some()
    }

    /// This node's identity on the bus
    #[must_use]
    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// Subscribe to this node's event channel and dispatch events into the
    /// session table until the broker connection ends.
    ///
    /// No-op on a disabled bus.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Coordination`] if the subscription cannot be set up.
    pub async fn start_dispatch(self: &Arc<Self>, sessions: Arc<SessionTable>) -> Result<()> {
        let Some(broker) = &self.broker else {
            return Ok(());
        };

        let mut rx = broker.subscribe(&events::event_channel(&self.node_id)).await?;
        let bus = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(payload) = rx.recv().await {
                match serde_json::from_str::<ChallengeEvent>(&payload) {
                    Ok(event) => bus.dispatch(&event, &sessions),
                    Err(e) => {
                        tracing::warn!(error = %e, "undecodable bus event dropped");
                    }
                }
            }
            tracing::warn!(node_id = %bus.node_id, "bus event channel closed");
        });
        Ok(())
    }

    /// Route one event to the session or remote wait it belongs to.
    ///
    /// Events with no live recipient are dropped; the peer node's handler
    /// notices via its own timeout or closed rendezvous.
    fn dispatch(&self, event: &ChallengeEvent, sessions: &SessionTable) {
        if !event.target_node.is_empty() && event.target_node != self.node_id {
            tracing::warn!(
                target = %event.target_node,
                node_id = %self.node_id,
                "misaddressed bus event dropped"
            );
            return;
        }
        match event.kind {
            EventKind::Accepted => self.dispatch_accepted(event, sessions),
            EventKind::ChallengerKey => self.dispatch_challenger_key(event, sessions),
            EventKind::EncryptedMasterKey => {
                let Ok(payload) =
                    serde_json::from_value::<EncryptedKeyPayload>(event.payload.clone())
                else {
                    tracing::warn!(challenge = %event.challenge, "bad encrypted key payload");
                    return;
                };
                // Same two-tier routing as the key material: session first,
                // then a registered wait, otherwise drop
                if let Some(session) = sessions.get(&event.challenge) {
                    if !session.encrypted_key.try_send(payload.encrypted_master_key) {
                        tracing::warn!(challenge = %event.challenge, "encrypted key arrived too late");
                    }
                    return;
                }
                if let Some(wait) = self.remote_wait(&event.challenge) {
                    if !wait.encrypted_key.try_send(payload.encrypted_master_key) {
                        tracing::warn!(challenge = %event.challenge, "encrypted key arrived too late");
                    }
                    return;
                }
                tracing::warn!(challenge = %event.challenge, "encrypted key for unknown challenge");
            }
            EventKind::Unknown => {
                tracing::warn!(challenge = %event.challenge, "unknown bus event type dropped");
            }
        }
    }

    fn dispatch_accepted(&self, event: &ChallengeEvent, sessions: &SessionTable) {
        let Ok(payload) = serde_json::from_value::<AcceptedPayload>(event.payload.clone()) else {
            tracing::warn!(challenge = %event.challenge, "bad accepted payload");
            return;
        };
        let Some(session) = sessions.get(&event.challenge) else {
            tracing::warn!(challenge = %event.challenge, "acceptance for unknown challenge");
            return;
        };
        // The responder's node checked the metadata, but the session here is
        // authoritative: a stale or forged event must not unlock it
        if payload.username != session.username {
            tracing::warn!(
                challenge = %event.challenge,
                "acceptance from wrong account dropped"
            );
            return;
        }
        session.set_owner_node(event.source_node.clone());
        if !session.accepted.try_send(true) {
            tracing::debug!(challenge = %event.challenge, "acceptance arrived after window closed");
        }
    }

    fn dispatch_challenger_key(&self, event: &ChallengeEvent, sessions: &SessionTable) {
        let Ok(payload) = serde_json::from_value::<ChallengerKeyPayload>(event.payload.clone())
        else {
            tracing::warn!(challenge = %event.challenge, "bad challenger key payload");
            return;
        };
        let material = KeyMaterial {
            public_key: payload.public_key,
            encapsulation_key: payload.encapsulation_key,
        };

        if let Some(session) = sessions.get(&event.challenge) {
            if !session.machine_key.try_send(material) {
                tracing::warn!(challenge = %event.challenge, "duplicate challenger key dropped");
            }
            return;
        }
        if let Some(wait) = self.remote_wait(&event.challenge) {
            if !wait.machine_key.try_send(material) {
                tracing::warn!(challenge = %event.challenge, "duplicate challenger key dropped");
            }
            return;
        }
        tracing::warn!(challenge = %event.challenge, "challenger key for unknown challenge");
    }

    // === Metadata keys ===

    /// Advertise a live challenge so other nodes can find it.
    ///
    /// No-op on a disabled bus.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Coordination`] on broker failure.
    pub async fn register_challenge(&self, challenge: &str, username: &str) -> Result<()> {
        let Some(broker) = &self.broker else {
            return Ok(());
        };
        let meta = SessionMeta {
            username: username.to_string(),
            node: self.node_id.clone(),
        };
        // Same expiry as the acceptance window: once the window closes the
        // advertisement is useless
        broker
            .set_ex(
                &events::session_key(challenge),
                &serde_json::to_string(&meta)?,
                HANDSHAKE_TIMEOUT_SECS,
            )
            .await
    }

    /// Remove a challenge advertisement.
    ///
    /// No-op on a disabled bus.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Coordination`] on broker failure.
    pub async fn remove_challenge(&self, challenge: &str) -> Result<()> {
        let Some(broker) = &self.broker else {
            return Ok(());
        };
        broker.del(&events::session_key(challenge)).await
    }

    /// Look up a challenge advertisement.
    ///
    /// Returns `Ok(None)` on a disabled bus or when no node advertises the
    /// challenge.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Coordination`] on broker failure.
    pub async fn metadata(&self, challenge: &str) -> Result<Option<SessionMeta>> {
        let Some(broker) = &self.broker else {
            return Ok(None);
        };
        let Some(raw) = broker.get(&events::session_key(challenge)).await? else {
            return Ok(None);
        };
        let meta = serde_json::from_str(&raw)
            .map_err(|e| Error::Coordination(format!("corrupt challenge metadata: {e}")))?;
        Ok(Some(meta))
    }

    // === Event publication ===

    async fn publish(
        &self,
        target_node: &str,
        kind: EventKind,
        challenge: &str,
        payload: serde_json::Value,
    ) -> Result<()> {
        let Some(broker) = &self.broker else {
            return Err(Error::Coordination(
                "coordination bus is disabled".to_string(),
            ));
        };
        let event = ChallengeEvent {
            kind,
            challenge: challenge.to_string(),
            target_node: target_node.to_string(),
            source_node: self.node_id.clone(),
            payload,
        };
        broker
            .publish(
                &events::event_channel(target_node),
                &serde_json::to_string(&event)?,
            )
            .await
    }

    /// Tell the challenge's home node a responder accepted here.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Coordination`] on a disabled bus or broker failure.
    pub async fn publish_accepted(
        &self,
        target_node: &str,
        challenge: &str,
        username: &str,
    ) -> Result<()> {
        self.publish(
            target_node,
            EventKind::Accepted,
            challenge,
            serde_json::to_value(AcceptedPayload {
                username: username.to_string(),
            })?,
        )
        .await
    }

    /// Relay the new machine's key material to the responder's node.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Coordination`] on a disabled bus or broker failure.
    pub async fn publish_challenger_key(
        &self,
        target_node: &str,
        challenge: &str,
        material: &KeyMaterial,
    ) -> Result<()> {
        self.publish(
            target_node,
            EventKind::ChallengerKey,
            challenge,
            serde_json::to_value(ChallengerKeyPayload {
                public_key: material.public_key.clone(),
                encapsulation_key: material.encapsulation_key.clone(),
            })?,
        )
        .await
    }

    /// Relay the encrypted master key back to the new machine's node.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Coordination`] on a disabled bus or broker failure.
    pub async fn publish_encrypted_key(
        &self,
        target_node: &str,
        challenge: &str,
        encrypted_master_key: Vec<u8>,
    ) -> Result<()> {
        self.publish(
            target_node,
            EventKind::EncryptedMasterKey,
            challenge,
            serde_json::to_value(EncryptedKeyPayload {
                encrypted_master_key,
            })?,
        )
        .await
    }

    // === Remote waits ===

    /// Register a slot for relayed key material on a responder's node.
    /// Idempotent: a second registration returns the existing slot.
    #[must_use]
    pub fn register_remote_wait(&self, challenge: &str) -> Arc<RemoteWait> {
        Arc::clone(
            self.remote_waits
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner)
                .entry(challenge.to_string())
                .or_insert_with(|| {
                    Arc::new(RemoteWait {
                        machine_key: Rendezvous::new(),
                        encrypted_key: Rendezvous::new(),
                    })
                }),
        )
    }

    /// Drop a remote wait slot, closing its rendezvous
    pub fn remove_remote_wait(&self, challenge: &str) {
        let removed = self
            .remote_waits
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .remove(challenge);
        if let Some(wait) = removed {
            wait.machine_key.close();
            wait.encrypted_key.close();
        }
    }

    fn remote_wait(&self, challenge: &str) -> Option<Arc<RemoteWait>> {
        self.remote_waits
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .get(challenge)
            .cloned()
    }
}
