//! Shared fixtures for the handshake integration tests

use std::sync::Arc;
use std::time::Duration;

use p256::pkcs8::EncodePublicKey as _;
use rand::rngs::OsRng;

use sshsync_server::bus::Broker;
use sshsync_server::db::{self, MachineRepo, UserRepo};
use sshsync_server::{CoordinationBus, HandshakeContext, SessionTable};

/// One simulated server node with its own database and session table
pub struct TestNode {
    pub ctx: HandshakeContext,
    pub users: UserRepo,
    pub machines: MachineRepo,
}

impl TestNode {
    /// Node with no coordination bus
    pub fn single(accept_timeout: Duration) -> Self {
        Self::build(CoordinationBus::disabled("solo".to_string()), accept_timeout)
    }

    /// Node attached to a broker, with the dispatch loop running
    pub async fn on_bus(
        broker: Arc<dyn Broker>,
        node_id: &str,
        accept_timeout: Duration,
    ) -> Self {
        let node = Self::build(CoordinationBus::new(broker, node_id.to_string()), accept_timeout);
        node.ctx
            .bus
            .start_dispatch(Arc::clone(&node.ctx.sessions))
            .await
            .expect("dispatch");
        node
    }

    fn build(bus: Arc<CoordinationBus>, accept_timeout: Duration) -> Self {
        let pool = db::init_memory().expect("db");
        let users = UserRepo::new(pool.clone());
        let machines = MachineRepo::new(pool);
        Self {
            ctx: HandshakeContext {
                sessions: Arc::new(SessionTable::new()),
                bus,
                users: users.clone(),
                machines: machines.clone(),
                accept_timeout,
            },
            users,
            machines,
        }
    }
}

/// A valid EC public key in PEM form, as an enrolling client would upload
pub fn ec_public_key_pem() -> Vec<u8> {
    let der = p256::SecretKey::random(&mut OsRng)
        .public_key()
        .to_public_key_der()
        .expect("encode");
    pem::encode(&pem::Pem::new("PUBLIC KEY", der.as_bytes().to_vec())).into_bytes()
}
