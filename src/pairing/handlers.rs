//! The two sides of the pairing handshake
//!
//! [`handle_new_machine`] drives the connection from the machine being
//! enrolled; [`handle_challenge_response`] drives the connection from the
//! trusted device answering the challenge. The two handlers meet through the
//! session's rendezvous points when both devices hit the same node, and
//! through the coordination bus when they do not.

use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use crate::bus::CoordinationBus;
use crate::crypto::keys::{EC_BLOCK_TYPE, MLKEM_BLOCK_TYPE};
use crate::crypto::{KeyType, detect_key_type, parse_hybrid_upload, validate_public_key};
use crate::db::{MachineRepo, User, UserRepo};
use crate::pairing::phrase;
use crate::pairing::session::{KeyMaterial, PairingSession, SessionTable};
use crate::pairing::state::HandshakeEvent;
use crate::transport::{
    ChallengeSubmission, EncryptedMasterKey, KeyUpload, MachineInfo, ServerNotice, TypedStream,
    read_message, write_error, write_message,
};
use crate::{Error, Result};

/// Attempts to find an unused challenge phrase before giving up
const PHRASE_RETRIES: usize = 5;

/// Everything the handshake handlers need
#[derive(Clone)]
pub struct HandshakeContext {
    pub sessions: Arc<SessionTable>,
    pub bus: Arc<CoordinationBus>,
    pub users: UserRepo,
    pub machines: MachineRepo,

    /// How long a responder has to submit the phrase
    pub accept_timeout: Duration,
}

/// Drive the connection from a machine asking to be enrolled.
///
/// The connection is unauthenticated; trust comes from a responder
/// submitting the challenge phrase in time. Validation failures are reported
/// to the peer as error envelopes before the connection winds down.
///
/// # Errors
///
/// Returns error when the handshake dies mid-flight: transport failure,
/// timeout, invalid key upload, or a responder-side abort.
pub async fn handle_new_machine<S: TypedStream + ?Sized>(
    ctx: &HandshakeContext,
    stream: &mut S,
) -> Result<()> {
    let info: MachineInfo = read_message(stream).await?;

    let Some(user) = ctx.users.find_by_username(&info.username)? else {
        write_error(stream, "user not found").await?;
        return Ok(());
    };
    if ctx.machines.exists(user.id, &info.machine_name)? {
        write_error(stream, "machine name already in use").await?;
        return Ok(());
    }

    let session = issue_session(ctx, &info)?;
    info!(
        username = %session.username,
        machine = %session.machine_name,
        challenge = %session.challenge,
        "challenge issued"
    );

    let result = run_new_machine(ctx, stream, &user, &session).await;

    // Teardown happens exactly once, whatever path got us here. The table
    // entry goes first so no new sender can pick up the session mid-close.
    if let Err(e) = ctx.bus.remove_challenge(&session.challenge).await {
        warn!(challenge = %session.challenge, error = %e, "failed to remove challenge advertisement");
    }
    ctx.sessions.remove(&session.challenge);
    session.close();

    if let Err(e) = &result {
        if !session.state().is_terminal() {
            let _ = session.advance(HandshakeEvent::Fail);
        }
        let _ = write_error(stream, &e.to_string()).await;
        warn!(challenge = %session.challenge, error = %e, "handshake failed");
    }
    result
}

async fn run_new_machine<S: TypedStream + ?Sized>(
    ctx: &HandshakeContext,
    stream: &mut S,
    user: &User,
    session: &Arc<PairingSession>,
) -> Result<()> {
    // Best effort: without the advertisement the pairing still works when
    // both devices hit this node
    if let Err(e) = ctx
        .bus
        .register_challenge(&session.challenge, &session.username)
        .await
    {
        warn!(challenge = %session.challenge, error = %e, "failed to advertise challenge");
    }

    write_message(
        stream,
        &ServerNotice {
            message: session.challenge.clone(),
        },
    )
    .await?;

    // The timer loses to a real acceptance: the rendezvous takes one value
    let timer = {
        let session = Arc::clone(session);
        let window = ctx.accept_timeout;
        tokio::spawn(async move {
            tokio::time::sleep(window).await;
            session.accepted.try_send(false);
        })
    };

    let accepted = session.accepted.recv().await;
    timer.abort();
    if accepted != Some(true) {
        let _ = session.advance(HandshakeEvent::Timeout);
        return Err(Error::Timeout);
    }
    session.advance(HandshakeEvent::Accept)?;
    info!(challenge = %session.challenge, "challenge accepted");

    write_message(
        stream,
        &ServerNotice {
            message: "Challenge accepted!".to_string(),
        },
    )
    .await?;

    let upload: KeyUpload = read_message(stream).await?;
    let (material, key_type) = validate_upload(&upload)?;
    session.advance(HandshakeEvent::KeyUploaded)?;

    match session.owner_node() {
        Some(node) => {
            ctx.bus
                .publish_challenger_key(&node, &session.challenge, &material)
                .await?;
        }
        None => {
            if !session.machine_key.try_send(material.clone()) {
                return Err(Error::Protocol("responder is gone".to_string()));
            }
        }
    }

    let Some(encrypted) = session.encrypted_key.recv().await else {
        return Err(Error::Protocol("responder aborted the exchange".to_string()));
    };

    ctx.machines.create(
        user.id,
        &session.machine_name,
        &material.public_key,
        key_type,
        material.encapsulation_key.as_deref(),
    )?;
    session.advance(HandshakeEvent::Complete)?;
    info!(
        username = %session.username,
        machine = %session.machine_name,
        "machine enrolled"
    );

    write_message(
        stream,
        &EncryptedMasterKey {
            encrypted_master_key: encrypted,
        },
    )
    .await?;
    write_message(
        stream,
        &ServerNotice {
            message: "Everything is done, you can now use ssh-sync".to_string(),
        },
    )
    .await
}

/// Drive the connection from a trusted device answering a challenge.
///
/// `caller_username` is the account the device authenticated as; a challenge
/// belonging to any other account is reported as not found, never revealing
/// whose it is.
///
/// # Errors
///
/// Returns error when the exchange dies mid-flight.
pub async fn handle_challenge_response<S: TypedStream + ?Sized>(
    ctx: &HandshakeContext,
    stream: &mut S,
    caller_username: &str,
) -> Result<()> {
    let submission: ChallengeSubmission = read_message(stream).await?;
    let challenge = submission.challenge.trim().to_string();

    if let Some(session) = ctx.sessions.get(&challenge) {
        return respond_local(ctx, stream, caller_username, &session).await;
    }
    respond_remote(ctx, stream, caller_username, &challenge).await
}

async fn respond_local<S: TypedStream + ?Sized>(
    _ctx: &HandshakeContext,
    stream: &mut S,
    caller_username: &str,
    session: &Arc<PairingSession>,
) -> Result<()> {
    if session.username != caller_username {
        // Do not leak that the phrase exists under another account
        write_error(stream, "challenge not found").await?;
        return Ok(());
    }
    if !session.accepted.try_send(true) {
        // Already accepted or timed out; same answer as a miss so the reply
        // never confirms the phrase exists
        write_error(stream, "challenge not found").await?;
        return Ok(());
    }
    info!(challenge = %session.challenge, responder = %caller_username, "responder matched locally");

    let result = exchange_local(stream, session).await;
    if result.is_err() {
        // The enrolling side is parked on the session; wake it so it can
        // report the abort instead of waiting forever
        session.close();
    }
    result
}

async fn exchange_local<S: TypedStream + ?Sized>(
    stream: &mut S,
    session: &Arc<PairingSession>,
) -> Result<()> {
    // The responder hears nothing until the new machine's key arrives; its
    // first reply is the relayed key material itself
    let Some(material) = session.machine_key.recv().await else {
        write_error(stream, "pairing aborted").await?;
        return Ok(());
    };
    write_message(
        stream,
        &KeyUpload {
            public_key: material.public_key,
            encapsulation_key: material.encapsulation_key,
        },
    )
    .await?;

    let secret: EncryptedMasterKey = read_message(stream).await?;
    if !session.encrypted_key.try_send(secret.encrypted_master_key) {
        return Err(Error::Protocol("new machine is gone".to_string()));
    }
    Ok(())
}

async fn respond_remote<S: TypedStream + ?Sized>(
    ctx: &HandshakeContext,
    stream: &mut S,
    caller_username: &str,
    challenge: &str,
) -> Result<()> {
    let Some(meta) = ctx.bus.metadata(challenge).await? else {
        write_error(stream, "challenge not found").await?;
        return Ok(());
    };
    if meta.username != caller_username {
        write_error(stream, "challenge not found").await?;
        return Ok(());
    }
    info!(
        challenge = %challenge,
        responder = %caller_username,
        home_node = %meta.node,
        "responder matched via bus"
    );

    let wait = ctx.bus.register_remote_wait(challenge);
    let result = relay_remote(ctx, stream, challenge, &meta.node, caller_username, &wait).await;
    ctx.bus.remove_remote_wait(challenge);

    if let Err(e) = &result {
        let _ = write_error(stream, &e.to_string()).await;
    }
    result
}

async fn relay_remote<S: TypedStream + ?Sized>(
    ctx: &HandshakeContext,
    stream: &mut S,
    challenge: &str,
    home_node: &str,
    caller_username: &str,
    wait: &crate::bus::RemoteWait,
) -> Result<()> {
    ctx.bus
        .publish_accepted(home_node, challenge, caller_username)
        .await?;

    let Some(material) = wait.machine_key.recv().await else {
        return Err(Error::Protocol("pairing aborted".to_string()));
    };
    write_message(
        stream,
        &KeyUpload {
            public_key: material.public_key,
            encapsulation_key: material.encapsulation_key,
        },
    )
    .await?;

    let secret: EncryptedMasterKey = read_message(stream).await?;
    ctx.bus
        .publish_encrypted_key(home_node, challenge, secret.encrypted_master_key)
        .await
}

/// Generate a phrase and register the session, retrying on the freak chance
/// of a collision with a live session.
fn issue_session(ctx: &HandshakeContext, info: &MachineInfo) -> Result<Arc<PairingSession>> {
    for _ in 0..PHRASE_RETRIES {
        let session = PairingSession::new(
            phrase::generate(),
            info.username.clone(),
            info.machine_name.clone(),
        );
        if ctx.sessions.insert(Arc::clone(&session)).is_ok() {
            return Ok(session);
        }
    }
    Err(Error::Protocol(
        "could not allocate a challenge phrase".to_string(),
    ))
}

/// Validate an uploaded key bundle and normalize it for storage and relay.
///
/// The signing key may arrive alone or with an inline ML-KEM block; a
/// separately-sent encapsulation key wins over an inline one.
fn validate_upload(upload: &KeyUpload) -> Result<(KeyMaterial, KeyType)> {
    let (signing_pem, inline_ek, key_type) = match detect_key_type(&upload.public_key) {
        KeyType::MlDsa => {
            validate_public_key(&upload.public_key)?;
            (upload.public_key.clone(), None, KeyType::MlDsa)
        }
        _ => {
            let parsed = parse_hybrid_upload(&upload.public_key)?;
            let pem = pem::encode(&pem::Pem::new(EC_BLOCK_TYPE, parsed.signing_key));
            let inline = parsed
                .encapsulation_key
                .map(|ek| pem::encode(&pem::Pem::new(MLKEM_BLOCK_TYPE, ek)).into_bytes());
            (pem.into_bytes(), inline, KeyType::Ecdsa)
        }
    };

    let encapsulation_key = match &upload.encapsulation_key {
        Some(sep) if !sep.iter().all(u8::is_ascii_whitespace) => {
            crate::crypto::validate_encapsulation_key_pem(sep)?;
            Some(sep.clone())
        }
        _ => inline_ek,
    };

    Ok((
        KeyMaterial {
            public_key: signing_pem,
            encapsulation_key,
        },
        key_type,
    ))
}

#[cfg(test)]
mod tests {
    use ml_kem::{EncodedSizeUser as _, KemCore as _, MlKem768};
    use p256::pkcs8::EncodePublicKey;
    use rand::rngs::OsRng;

    use super::*;

    fn ec_pem() -> Vec<u8> {
        let der = p256::SecretKey::random(&mut OsRng)
            .public_key()
            .to_public_key_der()
            .unwrap();
        pem::encode(&pem::Pem::new(EC_BLOCK_TYPE, der.as_bytes().to_vec())).into_bytes()
    }

    fn mlkem_pem() -> Vec<u8> {
        let (_dk, ek) = MlKem768::generate(&mut OsRng);
        pem::encode(&pem::Pem::new(MLKEM_BLOCK_TYPE, ek.as_bytes().to_vec())).into_bytes()
    }

    #[test]
    fn upload_ec_only() {
        let (material, key_type) = validate_upload(&KeyUpload {
            public_key: ec_pem(),
            encapsulation_key: None,
        })
        .unwrap();
        assert_eq!(key_type, KeyType::Ecdsa);
        assert!(material.encapsulation_key.is_none());
    }

    #[test]
    fn upload_separate_encapsulation_key_wins() {
        let (material, key_type) = validate_upload(&KeyUpload {
            public_key: ec_pem(),
            encapsulation_key: Some(mlkem_pem()),
        })
        .unwrap();
        assert_eq!(key_type, KeyType::Ecdsa);
        assert!(material.encapsulation_key.is_some());
    }

    #[test]
    fn upload_inline_encapsulation_key() {
        let mut combined = ec_pem();
        combined.extend_from_slice(&mlkem_pem());
        let (material, _) = validate_upload(&KeyUpload {
            public_key: combined,
            encapsulation_key: None,
        })
        .unwrap();
        assert!(material.encapsulation_key.is_some());
    }

    #[test]
    fn upload_whitespace_encapsulation_field_ignored() {
        let (material, _) = validate_upload(&KeyUpload {
            public_key: ec_pem(),
            encapsulation_key: Some(b"  \n".to_vec()),
        })
        .unwrap();
        assert!(material.encapsulation_key.is_none());
    }

    #[test]
    fn upload_garbage_rejected() {
        assert!(
            validate_upload(&KeyUpload {
                public_key: b"not pem".to_vec(),
                encapsulation_key: None,
            })
            .is_err()
        );
    }
}
