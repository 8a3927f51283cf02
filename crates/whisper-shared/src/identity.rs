//! Client-side key material.
//!
//! The server never holds secret keys; this type is what a client (or a
//! test harness) uses to produce the public keys and signatures the server
//! verifies.

use ed25519_dalek::{Signer, SigningKey};
use rand::rngs::OsRng;
use x25519_dalek::{PublicKey, StaticSecret};

use crate::crypto::{canonical_message, encode_b64, sha256};

/// A device's signing and encryption key pair.
#[derive(Clone)]
pub struct ClientIdentity {
    signing_key: SigningKey,
    enc_secret: StaticSecret,
}

impl ClientIdentity {
    /// Generate a new random identity
    pub fn generate() -> Self {
        Self {
            signing_key: SigningKey::generate(&mut OsRng),
            enc_secret: StaticSecret::random_from_rng(OsRng),
        }
    }

    /// Ed25519 public key, base64
    pub fn sign_public_key_b64(&self) -> String {
        encode_b64(&self.signing_key.verifying_key().to_bytes())
    }

    /// X25519 public key, base64
    pub fn enc_public_key_b64(&self) -> String {
        encode_b64(PublicKey::from(&self.enc_secret).as_bytes())
    }

    /// Sign a registration challenge (raw bytes) and return the base64 signature.
    pub fn sign_challenge(&self, challenge: &[u8]) -> String {
        encode_b64(&self.signing_key.sign(&sha256(challenge)).to_bytes())
    }

    /// Sign an envelope's canonical form and return the base64 signature.
    #[allow(clippy::too_many_arguments)]
    pub fn sign_envelope(
        &self,
        kind: &str,
        message_id: &str,
        from: &str,
        to_or_group: &str,
        timestamp: i64,
        nonce_b64: &str,
        ciphertext_b64: &str,
    ) -> String {
        let canonical = canonical_message(
            kind,
            message_id,
            from,
            to_or_group,
            timestamp,
            nonce_b64,
            ciphertext_b64,
        );
        encode_b64(&self.signing_key.sign(&sha256(canonical.as_bytes())).to_bytes())
    }
}
