//! Request authentication for already-enrolled machines
//!
//! A machine authenticates with a bearer token it signed itself. The token's
//! claims name the account and machine; the server loads that machine's
//! stored public key and verifies the signature against it. The algorithm in
//! the token header is only a routing hint; trust comes from the stored key.

use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use serde::Deserialize;

use crate::crypto::{KeyType, detect_algorithm, verify_token};
use crate::db::MachineRepo;
use crate::{Error, Result};

/// Identity proven by a verified token
#[derive(Debug, Clone)]
pub struct AuthedMachine {
    pub user_id: i64,
    pub username: String,
    pub machine_name: String,
    pub key_type: KeyType,
}

/// Claims the server reads before verification
#[derive(Debug, Deserialize)]
struct Claims {
    /// Account username
    sub: String,

    /// Machine name under that account
    machine: String,
}

/// Verifies bearer tokens against enrolled machine keys
#[derive(Clone)]
pub struct Authenticator {
    machines: MachineRepo,
}

impl Authenticator {
    /// Authenticator over the machine store
    #[must_use]
    pub const fn new(machines: MachineRepo) -> Self {
        Self { machines }
    }

    /// Verify a bearer token and resolve the machine behind it.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Verification`] if the named machine does not exist
    /// or the signature does not check out, [`Error::UnsupportedAlgorithm`]
    /// for algorithms off the allow-list, and [`Error::MalformedInput`] for
    /// structural problems.
    pub fn authenticate(&self, token: &str) -> Result<AuthedMachine> {
        let alg = detect_algorithm(token)?;
        let claims = unverified_claims(token)?;

        let machine = self
            .machines
            .find(&claims.sub, &claims.machine)?
            .ok_or_else(|| Error::Verification("unknown machine".to_string()))?;

        verify_token(token, &alg, &machine.public_key)?;

        Ok(AuthedMachine {
            user_id: machine.user_id,
            username: claims.sub,
            machine_name: machine.name,
            key_type: machine.key_type,
        })
    }
}

/// Pull the token out of an `Authorization: Bearer ...` header value.
///
/// # Errors
///
/// Returns [`Error::Verification`] if the header is missing or not a bearer
/// header.
pub fn bearer_token(header: Option<&str>) -> Result<&str> {
    header
        .and_then(|h| h.strip_prefix("Bearer "))
        .filter(|t| !t.is_empty())
        .ok_or_else(|| Error::Verification("missing bearer token".to_string()))
}

/// Decode the claims segment without verifying the signature. The result is
/// only used to locate the key that verification then runs against.
fn unverified_claims(token: &str) -> Result<Claims> {
    let claims_segment = token
        .split('.')
        .nth(1)
        .ok_or_else(|| Error::MalformedInput("token has no claims segment".to_string()))?;
    let raw = URL_SAFE_NO_PAD
        .decode(claims_segment)
        .map_err(|e| Error::MalformedInput(format!("claims not base64url: {e}")))?;
    serde_json::from_slice(&raw)
        .map_err(|e| Error::MalformedInput(format!("claims not JSON: {e}")))
}

#[cfg(test)]
mod tests {
    use jsonwebtoken::{Algorithm, EncodingKey, Header};
    use p256::pkcs8::{EncodePrivateKey, EncodePublicKey};
    use rand::rngs::OsRng;

    use super::*;
    use crate::db::{self, UserRepo};

    fn setup() -> (Authenticator, String) {
        let pool = db::init_memory().unwrap();
        let users = UserRepo::new(pool.clone());
        let machines = MachineRepo::new(pool);

        let secret = p256::SecretKey::random(&mut OsRng);
        let private_pem = secret
            .to_pkcs8_pem(p256::pkcs8::LineEnding::LF)
            .unwrap()
            .to_string();
        let public_pem = secret
            .public_key()
            .to_public_key_pem(p256::pkcs8::LineEnding::LF)
            .unwrap();

        let alice = users.create("alice").unwrap();
        machines
            .create(
                alice.id,
                "laptop",
                public_pem.as_bytes(),
                KeyType::Ecdsa,
                None,
            )
            .unwrap();

        (Authenticator::new(machines), private_pem)
    }

    fn token(private_pem: &str, sub: &str, machine: &str) -> String {
        let key = EncodingKey::from_ec_pem(private_pem.as_bytes()).unwrap();
        let claims = serde_json::json!({
            "sub": sub,
            "machine": machine,
            "exp": chrono::Utc::now().timestamp() + 300,
        });
        jsonwebtoken::encode(&Header::new(Algorithm::ES256), &claims, &key).unwrap()
    }

    #[test]
    fn valid_token_resolves_machine() {
        let (auth, private_pem) = setup();
        let authed = auth.authenticate(&token(&private_pem, "alice", "laptop")).unwrap();
        assert_eq!(authed.username, "alice");
        assert_eq!(authed.machine_name, "laptop");
        assert_eq!(authed.key_type, KeyType::Ecdsa);
    }

    #[test]
    fn unknown_machine_rejected() {
        let (auth, private_pem) = setup();
        assert!(auth.authenticate(&token(&private_pem, "alice", "desktop")).is_err());
        assert!(auth.authenticate(&token(&private_pem, "bob", "laptop")).is_err());
    }

    #[test]
    fn token_signed_by_other_key_rejected() {
        let (auth, _) = setup();
        let other = p256::SecretKey::random(&mut OsRng)
            .to_pkcs8_pem(p256::pkcs8::LineEnding::LF)
            .unwrap()
            .to_string();
        assert!(matches!(
            auth.authenticate(&token(&other, "alice", "laptop")),
            Err(Error::Verification(_))
        ));
    }

    #[test]
    fn bearer_extraction() {
        assert_eq!(bearer_token(Some("Bearer abc")).unwrap(), "abc");
        assert!(bearer_token(Some("Basic abc")).is_err());
        assert!(bearer_token(Some("Bearer ")).is_err());
        assert!(bearer_token(None).is_err());
    }
}
