//! Device pairing handshake
//!
//! A new machine cannot authenticate; it gets enrolled by a handshake in
//! which an already-trusted device vouches for it. The new machine connects,
//! receives a three-word challenge phrase, and shows it to the user. The
//! user types the phrase on a trusted device, which connects authenticated,
//! submits the phrase, receives the new machine's public key, encrypts the
//! account master key for it, and sends the result back. The server relays;
//! it never sees key material it could use.

pub mod handlers;
pub mod phrase;
pub mod rendezvous;
pub mod session;
pub mod state;

pub use handlers::{HandshakeContext, handle_challenge_response, handle_new_machine};
pub use rendezvous::Rendezvous;
pub use session::{KeyMaterial, PairingSession, SessionTable};
pub use state::{HandshakeEvent, HandshakeState};
