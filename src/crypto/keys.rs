//! Uploaded public-key validation
//!
//! Devices upload PEM text: one `PUBLIC KEY` block (PKIX EC key) for
//! classical devices, optionally followed by an `MLKEM768 ENCAPSULATION KEY`
//! block (raw 1184 bytes) for hybrid devices, or a single `MLDSA PUBLIC KEY`
//! block for post-quantum signing-only devices.

use ml_dsa::MlDsa65;
use ml_kem::{EncodedSizeUser, KemCore, MlKem768};
use spki::SubjectPublicKeyInfoRef;
use spki::der::Decode as _;

use crate::{Error, Result};

/// PEM block type for PKIX EC public keys
pub const EC_BLOCK_TYPE: &str = "PUBLIC KEY";

/// PEM block type for ML-DSA verifying keys
pub const MLDSA_BLOCK_TYPE: &str = "MLDSA PUBLIC KEY";

/// PEM block type for ML-KEM-768 encapsulation keys
pub const MLKEM_BLOCK_TYPE: &str = "MLKEM768 ENCAPSULATION KEY";

/// Exact byte length of an ML-KEM-768 encapsulation key
pub const MLKEM768_KEY_LEN: usize = 1184;

/// PKIX algorithm identifier for EC public keys (id-ecPublicKey)
const ID_EC_PUBLIC_KEY: spki::ObjectIdentifier =
    spki::ObjectIdentifier::new_unwrap("1.2.840.10045.2.1");

type MlKem768Key = <MlKem768 as KemCore>::EncapsulationKey;

/// Cryptographic family of a stored public key
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyType {
    /// Classical EC key (`PUBLIC KEY` block)
    Ecdsa,

    /// Post-quantum signing key (`MLDSA PUBLIC KEY` block)
    MlDsa,

    /// Unrecognized block type
    Unknown,
}

impl KeyType {
    /// Stable name used in storage
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Ecdsa => "ecdsa",
            Self::MlDsa => "mldsa",
            Self::Unknown => "unknown",
        }
    }

    /// Inverse of [`as_str`](Self::as_str)
    #[must_use]
    pub fn parse(s: &str) -> Self {
        match s {
            "ecdsa" => Self::Ecdsa,
            "mldsa" => Self::MlDsa,
            _ => Self::Unknown,
        }
    }
}

/// Result of validating a hybrid key upload
#[derive(Debug, Clone)]
pub struct ParsedKeys {
    /// DER contents of the EC signing key block; used to verify future
    /// requests from this device
    pub signing_key: Vec<u8>,

    /// Raw ML-KEM-768 encapsulation key, present only for hybrid devices
    pub encapsulation_key: Option<Vec<u8>>,
}

/// Classify a single PEM block by its type label
#[must_use]
pub fn detect_key_type(pem_bytes: &[u8]) -> KeyType {
    let Ok(block) = pem::parse(pem_bytes) else {
        return KeyType::Unknown;
    };
    match block.tag() {
        EC_BLOCK_TYPE => KeyType::Ecdsa,
        MLDSA_BLOCK_TYPE => KeyType::MlDsa,
        _ => KeyType::Unknown,
    }
}

/// Classify and structurally validate a single public-key PEM block.
///
/// EC keys must carry the id-ecPublicKey algorithm identifier; ML-DSA keys
/// must parse with the ML-DSA-65 parameter set.
///
/// # Errors
///
/// Returns [`Error::MalformedInput`] if the block does not parse or is not a
/// recognized key type.
pub fn validate_public_key(pem_bytes: &[u8]) -> Result<KeyType> {
    let block = pem::parse(pem_bytes)
        .map_err(|e| Error::MalformedInput(format!("invalid PEM: {e}")))?;

    match block.tag() {
        EC_BLOCK_TYPE => {
            validate_ec_spki(block.contents())?;
            Ok(KeyType::Ecdsa)
        }
        MLDSA_BLOCK_TYPE => {
            ml_dsa::EncodedVerifyingKey::<MlDsa65>::try_from(block.contents())
                .map_err(|_| Error::MalformedInput("invalid ML-DSA public key".to_string()))?;
            Ok(KeyType::MlDsa)
        }
        other => Err(Error::MalformedInput(format!(
            "unrecognized key block type {other:?}"
        ))),
    }
}

/// Validate a hybrid key upload: one EC signing key, optionally one
/// ML-KEM-768 encapsulation key.
///
/// If two `PUBLIC KEY` blocks are present the later one wins; callers only
/// ever submit zero or one. The encapsulation key alone is never sufficient.
///
/// # Errors
///
/// Returns [`Error::MalformedInput`] if the input contains no valid signing
/// key, an encapsulation key of the wrong size, or a block of any other type.
pub fn parse_hybrid_upload(pem_bytes: &[u8]) -> Result<ParsedKeys> {
    let blocks = pem::parse_many(pem_bytes)
        .map_err(|e| Error::MalformedInput(format!("invalid PEM: {e}")))?;

    let mut signing_key = None;
    let mut encapsulation_key = None;

    for block in &blocks {
        match block.tag() {
            EC_BLOCK_TYPE => {
                validate_ec_spki(block.contents())?;
                signing_key = Some(block.contents().to_vec());
            }
            MLKEM_BLOCK_TYPE => {
                validate_encapsulation_bytes(block.contents())?;
                encapsulation_key = Some(block.contents().to_vec());
            }
            other => {
                return Err(Error::MalformedInput(format!(
                    "unexpected key block type {other:?}"
                )));
            }
        }
    }

    let Some(signing_key) = signing_key else {
        return Err(Error::MalformedInput("no signing key in upload".to_string()));
    };

    Ok(ParsedKeys {
        signing_key,
        encapsulation_key,
    })
}

/// Validate a standalone ML-KEM-768 encapsulation key PEM.
///
/// Empty input is explicitly valid: legacy devices never send one.
///
/// # Errors
///
/// Returns [`Error::MalformedInput`] if a block is present but is not a
/// well-formed 1184-byte `MLKEM768 ENCAPSULATION KEY` block.
pub fn validate_encapsulation_key_pem(pem_bytes: &[u8]) -> Result<()> {
    if pem_bytes.iter().all(u8::is_ascii_whitespace) {
        return Ok(());
    }

    let blocks = pem::parse_many(pem_bytes)
        .map_err(|e| Error::MalformedInput(format!("invalid PEM: {e}")))?;

    for block in &blocks {
        if block.tag() != MLKEM_BLOCK_TYPE {
            return Err(Error::MalformedInput(format!(
                "unexpected key block type {:?}",
                block.tag()
            )));
        }
        validate_encapsulation_bytes(block.contents())?;
    }

    Ok(())
}

/// Check that DER bytes are a PKIX structure with the EC algorithm identifier
fn validate_ec_spki(der: &[u8]) -> Result<()> {
    let info = SubjectPublicKeyInfoRef::from_der(der)
        .map_err(|e| Error::MalformedInput(format!("invalid public key structure: {e}")))?;

    if info.algorithm.oid != ID_EC_PUBLIC_KEY {
        return Err(Error::MalformedInput(format!(
            "not an EC public key (algorithm {})",
            info.algorithm.oid
        )));
    }

    Ok(())
}

/// Check size and structure of raw ML-KEM-768 encapsulation key bytes
fn validate_encapsulation_bytes(bytes: &[u8]) -> Result<()> {
    if bytes.len() != MLKEM768_KEY_LEN {
        return Err(Error::MalformedInput(format!(
            "encapsulation key must be {MLKEM768_KEY_LEN} bytes, got {}",
            bytes.len()
        )));
    }

    let encoded: ml_kem::Encoded<MlKem768Key> = bytes
        .try_into()
        .map_err(|_| Error::MalformedInput("invalid encapsulation key".to_string()))?;
    let _ = MlKem768Key::from_bytes(&encoded);

    Ok(())
}

#[cfg(test)]
mod tests {
    use ml_dsa::KeyGen;
    use p256::pkcs8::EncodePublicKey;
    use rand::rngs::OsRng;
    use rand_core::TryRngCore as _;

    use super::*;

    fn ec_public_key_pem() -> String {
        let secret = p256::SecretKey::random(&mut OsRng);
        let der = secret
            .public_key()
            .to_public_key_der()
            .expect("encode EC key");
        pem::encode(&pem::Pem::new(EC_BLOCK_TYPE, der.as_bytes().to_vec()))
    }

    fn mlkem_key_pem() -> String {
        let (_dk, ek) = MlKem768::generate(&mut OsRng);
        pem::encode(&pem::Pem::new(MLKEM_BLOCK_TYPE, ek.as_bytes().to_vec()))
    }

    fn mldsa_key_pem() -> String {
        let kp = MlDsa65::key_gen(&mut rand_core::OsRng.unwrap_err());
        pem::encode(&pem::Pem::new(
            MLDSA_BLOCK_TYPE,
            kp.verifying_key().encode().to_vec(),
        ))
    }

    #[test]
    fn detects_key_types_by_block_label() {
        assert_eq!(detect_key_type(ec_public_key_pem().as_bytes()), KeyType::Ecdsa);
        assert_eq!(detect_key_type(mldsa_key_pem().as_bytes()), KeyType::MlDsa);
        assert_eq!(detect_key_type(b"not pem at all"), KeyType::Unknown);
    }

    #[test]
    fn validates_ec_and_mldsa_keys() {
        assert_eq!(
            validate_public_key(ec_public_key_pem().as_bytes()).unwrap(),
            KeyType::Ecdsa
        );
        assert_eq!(
            validate_public_key(mldsa_key_pem().as_bytes()).unwrap(),
            KeyType::MlDsa
        );
    }

    #[test]
    fn rejects_non_ec_spki_in_public_key_block() {
        // An ML-DSA key smuggled under a PUBLIC KEY label is not valid DER SPKI
        let kp = MlDsa65::key_gen(&mut rand_core::OsRng.unwrap_err());
        let pem = pem::encode(&pem::Pem::new(
            EC_BLOCK_TYPE,
            kp.verifying_key().encode().to_vec(),
        ));
        assert!(validate_public_key(pem.as_bytes()).is_err());
    }

    #[test]
    fn hybrid_upload_ec_only() {
        let parsed = parse_hybrid_upload(ec_public_key_pem().as_bytes()).unwrap();
        assert!(!parsed.signing_key.is_empty());
        assert!(parsed.encapsulation_key.is_none());
    }

    #[test]
    fn hybrid_upload_ec_plus_mlkem() {
        let combined = format!("{}{}", ec_public_key_pem(), mlkem_key_pem());
        let parsed = parse_hybrid_upload(combined.as_bytes()).unwrap();
        assert!(!parsed.signing_key.is_empty());
        assert_eq!(parsed.encapsulation_key.unwrap().len(), MLKEM768_KEY_LEN);
    }

    #[test]
    fn hybrid_upload_rejects_wrong_encapsulation_size() {
        let bad = pem::encode(&pem::Pem::new(MLKEM_BLOCK_TYPE, vec![0u8; 1183]));
        let combined = format!("{}{bad}", ec_public_key_pem());
        assert!(parse_hybrid_upload(combined.as_bytes()).is_err());
    }

    #[test]
    fn hybrid_upload_requires_signing_key() {
        let err = parse_hybrid_upload(mlkem_key_pem().as_bytes()).unwrap_err();
        assert!(err.to_string().contains("no signing key"));
    }

    #[test]
    fn hybrid_upload_rejects_foreign_block() {
        let combined = format!(
            "{}{}",
            ec_public_key_pem(),
            pem::encode(&pem::Pem::new("CERTIFICATE", vec![1, 2, 3]))
        );
        assert!(parse_hybrid_upload(combined.as_bytes()).is_err());
    }

    #[test]
    fn standalone_encapsulation_key_validates() {
        assert!(validate_encapsulation_key_pem(mlkem_key_pem().as_bytes()).is_ok());
        assert!(validate_encapsulation_key_pem(b"").is_ok());
        assert!(validate_encapsulation_key_pem(b"  \n").is_ok());

        let bad = pem::encode(&pem::Pem::new(MLKEM_BLOCK_TYPE, vec![0u8; 100]));
        assert!(validate_encapsulation_key_pem(bad.as_bytes()).is_err());
    }
}
