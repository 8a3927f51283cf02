//! Signature verification and identifier generation.
//!
//! Clients sign the SHA-256 digest of the bytes in question with Ed25519:
//! the raw challenge during registration, and the canonical envelope string
//! (see [`canonical_message`]) for every message.

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use ed25519_dalek::{Signature, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest, Sha256};

use crate::constants::{
    SESSION_TOKEN_SIZE, SIGNATURE_SIZE, WHISPER_ID_ALPHABET, WHISPER_ID_PREFIX,
};
use crate::error::ProtocolError;

/// Decode a standard base64 field.
pub fn decode_b64(field: &'static str, value: &str) -> Result<Vec<u8>, ProtocolError> {
    STANDARD
        .decode(value)
        .map_err(|_| ProtocolError::invalid(field, "not valid base64"))
}

/// Decode a base64 field that must be exactly `N` bytes long.
pub fn decode_b64_fixed<const N: usize>(
    field: &'static str,
    value: &str,
) -> Result<[u8; N], ProtocolError> {
    let bytes = decode_b64(field, value)?;
    bytes
        .try_into()
        .map_err(|_| ProtocolError::invalid(field, format!("expected {N} bytes")))
}

pub fn encode_b64(bytes: &[u8]) -> String {
    STANDARD.encode(bytes)
}

pub fn sha256(data: &[u8]) -> [u8; 32] {
    Sha256::digest(data).into()
}

/// Fill an array with OS randomness.
pub fn random_bytes<const N: usize>() -> [u8; N] {
    let mut out = [0u8; N];
    OsRng.fill_bytes(&mut out);
    out
}

/// Unguessable session token, hex-encoded.
pub fn generate_session_token() -> String {
    hex::encode(random_bytes::<SESSION_TOKEN_SIZE>())
}

/// Verify an Ed25519 signature over `SHA-256(message)`.
pub fn verify_prehashed(
    sign_public_key: &[u8; 32],
    message: &[u8],
    signature: &[u8; SIGNATURE_SIZE],
) -> Result<(), ProtocolError> {
    let key = VerifyingKey::from_bytes(sign_public_key).map_err(|_| ProtocolError::BadSignature)?;
    let signature = Signature::from_bytes(signature);
    key.verify(&sha256(message), &signature)
        .map_err(|_| ProtocolError::BadSignature)
}

/// Canonical string covered by an envelope signature.
///
/// `kind` is the frame type (`send_message` / `group_send_message`) and
/// `to_or_group` the recipient id or the group id.
pub fn canonical_message(
    kind: &str,
    message_id: &str,
    from: &str,
    to_or_group: &str,
    timestamp: i64,
    nonce_b64: &str,
    ciphertext_b64: &str,
) -> String {
    format!(
        "v1\n{kind}\n{message_id}\n{from}\n{to_or_group}\n{timestamp}\n{nonce_b64}\n{ciphertext_b64}\n"
    )
}

/// Generate a fresh identity id of the form `WSP-XXXX-XXXX-XXXX`.
pub fn generate_whisper_id() -> String {
    let raw = random_bytes::<12>();
    let chars: Vec<char> = raw
        .iter()
        .map(|b| WHISPER_ID_ALPHABET[(*b as usize) % WHISPER_ID_ALPHABET.len()] as char)
        .collect();
    let groups: Vec<String> = chars.chunks(4).map(|c| c.iter().collect()).collect();
    format!("{}-{}", WHISPER_ID_PREFIX, groups.join("-"))
}

pub fn is_valid_whisper_id(id: &str) -> bool {
    let mut parts = id.split('-');
    if parts.next() != Some(WHISPER_ID_PREFIX) {
        return false;
    }
    let groups: Vec<&str> = parts.collect();
    groups.len() == 3
        && groups.iter().all(|g| {
            g.len() == 4 && g.bytes().all(|b| WHISPER_ID_ALPHABET.contains(&b))
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use ed25519_dalek::{Signer, SigningKey};

    #[test]
    fn test_whisper_id_format() {
        for _ in 0..32 {
            let id = generate_whisper_id();
            assert!(is_valid_whisper_id(&id), "bad id {id}");
            assert_eq!(id.len(), 18);
        }
        assert!(!is_valid_whisper_id("WSP-AAAA-BBBB"));
        assert!(!is_valid_whisper_id("XYZ-AAAA-BBBB-CCCC"));
        assert!(!is_valid_whisper_id("WSP-aaaa-BBBB-CCCC"));
        assert!(!is_valid_whisper_id("WSP-AAA1-BBBB-CCCC"));
    }

    #[test]
    fn test_prehashed_signature() {
        let key = SigningKey::generate(&mut OsRng);
        let challenge = random_bytes::<32>();
        let sig = key.sign(&sha256(&challenge)).to_bytes();
        let pubkey = key.verifying_key().to_bytes();

        assert!(verify_prehashed(&pubkey, &challenge, &sig).is_ok());
        assert_eq!(
            verify_prehashed(&pubkey, b"other", &sig),
            Err(ProtocolError::BadSignature)
        );
    }

    #[test]
    fn test_decode_fixed_length() {
        let nonce = encode_b64(&[7u8; 24]);
        assert_eq!(decode_b64_fixed::<24>("nonce", &nonce).unwrap(), [7u8; 24]);
        assert!(decode_b64_fixed::<24>("nonce", &encode_b64(&[7u8; 12])).is_err());
        assert!(decode_b64_fixed::<24>("nonce", "***").is_err());
    }

    #[test]
    fn test_canonical_message_layout() {
        let c = canonical_message("send_message", "m1", "A", "B", 42, "bm9uY2U=", "Y3Q=");
        assert_eq!(c, "v1\nsend_message\nm1\nA\nB\n42\nbm9uY2U=\nY3Q=\n");
    }

    #[test]
    fn test_session_tokens_are_unique() {
        let a = generate_session_token();
        let b = generate_session_token();
        assert_eq!(a.len(), 64);
        assert_ne!(a, b);
    }
}
