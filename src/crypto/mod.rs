//! Key validation and token verification
//!
//! Supports classical ECDSA devices, hybrid devices (EC signing key plus an
//! ML-KEM-768 encapsulation key), and post-quantum ML-DSA signing devices.
//! The algorithm a token was signed with is declared in its header, because
//! during the classical-to-post-quantum transition a user's machines may be
//! at different migration stages and the server must support both at once.

pub mod keys;
pub mod verifier;

pub use keys::{
    KeyType, ParsedKeys, detect_key_type, parse_hybrid_upload, validate_encapsulation_key_pem,
    validate_public_key,
};
pub use verifier::{detect_algorithm, verify_token};
