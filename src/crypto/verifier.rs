//! Bearer-token verification across cryptographic families
//!
//! Tokens are three dot-separated base64url segments. The header declares the
//! signing algorithm; the allow-list is ES256, ES512, and the three ML-DSA
//! parameter sets. The declared algorithm is untrusted input: anything off
//! the list is a hard error, and verification always runs against the
//! device's stored public key.

use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use jsonwebtoken::{Algorithm, DecodingKey, Validation};
use ml_dsa::{MlDsa44, MlDsa65, MlDsa87, MlDsaParams};
use serde::Deserialize;
use signature::Verifier as _;

use crate::crypto::keys::MLDSA_BLOCK_TYPE;
use crate::{Error, Result};

/// Header fields we care about
#[derive(Debug, Deserialize)]
struct TokenHeader {
    alg: String,
}

/// Claims checked on the manual verification paths
#[derive(Debug, Deserialize)]
struct TokenClaims {
    exp: u64,
}

/// Extract the declared algorithm from a token header.
///
/// # Errors
///
/// Returns [`Error::MalformedInput`] if the token does not have exactly
/// three segments or the header segment does not decode as JSON.
pub fn detect_algorithm(token: &str) -> Result<String> {
    let [header, _, _] = split_token(token)?;
    let raw = URL_SAFE_NO_PAD
        .decode(header)
        .map_err(|e| Error::MalformedInput(format!("token header not base64url: {e}")))?;
    let header: TokenHeader = serde_json::from_slice(&raw)
        .map_err(|e| Error::MalformedInput(format!("token header not JSON: {e}")))?;
    Ok(header.alg)
}

/// Verify a bearer token against a stored public key.
///
/// `ES256` goes through `jsonwebtoken`, which also validates the standard
/// expiry claim. `ES512` and the ML-DSA parameter sets are verified directly
/// (the generic JWT library does not cover them), with the `exp` claim
/// enforced independently. The declared algorithm and the stored key must
/// match for trust to hold; a mismatch fails verification.
///
/// # Errors
///
/// Returns [`Error::UnsupportedAlgorithm`] for any algorithm off the
/// allow-list, [`Error::Verification`] on signature mismatch or expiry, and
/// [`Error::MalformedInput`] on structural problems.
pub fn verify_token(token: &str, alg: &str, public_key_pem: &[u8]) -> Result<()> {
    match alg {
        "ES256" => verify_es256(token, public_key_pem),
        "ES512" => verify_es512(token, public_key_pem),
        "ML-DSA-44" => verify_mldsa::<MlDsa44>(token, public_key_pem),
        "ML-DSA-65" => verify_mldsa::<MlDsa65>(token, public_key_pem),
        "ML-DSA-87" => verify_mldsa::<MlDsa87>(token, public_key_pem),
        other => Err(Error::UnsupportedAlgorithm(other.to_string())),
    }
}

fn split_token(token: &str) -> Result<[&str; 3]> {
    let mut parts = token.split('.');
    let (Some(header), Some(claims), Some(signature), None) =
        (parts.next(), parts.next(), parts.next(), parts.next())
    else {
        return Err(Error::MalformedInput(
            "token must have exactly three segments".to_string(),
        ));
    };
    Ok([header, claims, signature])
}

fn verify_es256(token: &str, public_key_pem: &[u8]) -> Result<()> {
    let key = DecodingKey::from_ec_pem(public_key_pem)
        .map_err(|e| Error::MalformedInput(format!("invalid EC public key: {e}")))?;

    let mut validation = Validation::new(Algorithm::ES256);
    validation.validate_aud = false;

    jsonwebtoken::decode::<serde_json::Value>(token, &key, &validation)
        .map_err(|e| Error::Verification(format!("ES256: {e}")))?;
    Ok(())
}

fn verify_es512(token: &str, public_key_pem: &[u8]) -> Result<()> {
    use p521::ecdsa::{Signature, VerifyingKey};
    use p521::pkcs8::DecodePublicKey as _;

    let [header, claims, signature] = split_token(token)?;

    let pem_text = std::str::from_utf8(public_key_pem)
        .map_err(|_| Error::MalformedInput("public key PEM is not UTF-8".to_string()))?;
    // Two-step parse: SPKI into the curve's PublicKey, then down to the
    // verifier over the SEC1 encoding
    let public_key = p521::PublicKey::from_public_key_pem(pem_text)
        .map_err(|e| Error::MalformedInput(format!("invalid P-521 public key: {e}")))?;
    let key = VerifyingKey::from_sec1_bytes(public_key.to_sec1_bytes().as_ref())
        .map_err(|e| Error::MalformedInput(format!("invalid P-521 public key: {e}")))?;

    let sig_bytes = URL_SAFE_NO_PAD
        .decode(signature)
        .map_err(|e| Error::MalformedInput(format!("signature not base64url: {e}")))?;
    let sig = Signature::from_slice(&sig_bytes)
        .map_err(|_| Error::Verification("ES512: malformed signature".to_string()))?;

    let signing_input = format!("{header}.{claims}");
    key.verify(signing_input.as_bytes(), &sig)
        .map_err(|_| Error::Verification("ES512: signature mismatch".to_string()))?;

    enforce_expiry(claims)
}

fn verify_mldsa<P: MlDsaParams>(token: &str, public_key_pem: &[u8]) -> Result<()> {
    let [header, claims, signature] = split_token(token)?;

    let block = pem::parse(public_key_pem)
        .map_err(|e| Error::MalformedInput(format!("invalid PEM: {e}")))?;
    if block.tag() != MLDSA_BLOCK_TYPE {
        return Err(Error::MalformedInput(format!(
            "expected {MLDSA_BLOCK_TYPE:?} block, got {:?}",
            block.tag()
        )));
    }

    let encoded = ml_dsa::EncodedVerifyingKey::<P>::try_from(block.contents())
        .map_err(|_| Error::MalformedInput("invalid ML-DSA public key".to_string()))?;
    let key = ml_dsa::VerifyingKey::<P>::decode(&encoded);

    let sig_bytes = URL_SAFE_NO_PAD
        .decode(signature)
        .map_err(|e| Error::MalformedInput(format!("signature not base64url: {e}")))?;
    let sig = ml_dsa::Signature::<P>::try_from(sig_bytes.as_slice())
        .map_err(|_| Error::Verification("ML-DSA: malformed signature".to_string()))?;

    let signing_input = format!("{header}.{claims}");
    if !key.verify_with_context(signing_input.as_bytes(), &[], &sig) {
        return Err(Error::Verification("ML-DSA: signature mismatch".to_string()));
    }

    enforce_expiry(claims)
}

/// Decode the claims segment and require `exp` strictly in the future.
///
/// The manual verification paths do not get claim validation for free from a
/// JWT library, so expiry is enforced here.
fn enforce_expiry(claims_segment: &str) -> Result<()> {
    let raw = URL_SAFE_NO_PAD
        .decode(claims_segment)
        .map_err(|e| Error::MalformedInput(format!("claims not base64url: {e}")))?;
    let claims: TokenClaims = serde_json::from_slice(&raw)
        .map_err(|e| Error::MalformedInput(format!("claims not JSON: {e}")))?;

    let now = u64::try_from(chrono::Utc::now().timestamp())
        .map_err(|_| Error::Verification("clock before epoch".to_string()))?;
    if claims.exp <= now {
        return Err(Error::Verification("token expired".to_string()));
    }

    Ok(())
}
