//! Structural validation of client input.
//!
//! The server cannot inspect plaintext, so everything here is about shape:
//! lengths, encodings, time windows and allowlists.

use crate::constants::{
    ALLOWED_CONTENT_TYPES, MAX_ATTACHMENT_SIZE, MAX_CIPHERTEXT_SIZE, MAX_FILE_KEY_BOX_SIZE,
    MAX_GROUP_TITLE, MAX_OBJECT_KEY_LEN, NONCE_SIZE, PUBKEY_SIZE, SIGNATURE_SIZE,
    TIMESTAMP_SKEW_MS,
};
use crate::crypto::{decode_b64, decode_b64_fixed};
use crate::error::ProtocolError;
use crate::protocol::AttachmentPointer;

const MAX_ID_LEN: usize = 128;

/// Reject timestamps further than the allowed skew from `now_ms`.
pub fn check_timestamp(timestamp: i64, now_ms: i64) -> Result<(), ProtocolError> {
    if now_ms.abs_diff(timestamp) > TIMESTAMP_SKEW_MS.unsigned_abs() {
        return Err(ProtocolError::TimestampOutOfWindow);
    }
    Ok(())
}

/// Client-generated identifiers (message ids, device ids).
pub fn validate_client_id(field: &'static str, id: &str) -> Result<(), ProtocolError> {
    if id.is_empty() || id.len() > MAX_ID_LEN {
        return Err(ProtocolError::invalid(field, "length out of range"));
    }
    if !id
        .bytes()
        .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_' || b == b'.')
    {
        return Err(ProtocolError::invalid(field, "unexpected character"));
    }
    Ok(())
}

pub fn validate_nonce(field: &'static str, nonce_b64: &str) -> Result<[u8; NONCE_SIZE], ProtocolError> {
    decode_b64_fixed::<NONCE_SIZE>(field, nonce_b64)
}

pub fn validate_public_key(field: &'static str, key_b64: &str) -> Result<[u8; PUBKEY_SIZE], ProtocolError> {
    decode_b64_fixed::<PUBKEY_SIZE>(field, key_b64)
}

pub fn validate_signature(field: &'static str, sig_b64: &str) -> Result<[u8; SIGNATURE_SIZE], ProtocolError> {
    decode_b64_fixed::<SIGNATURE_SIZE>(field, sig_b64)
}

pub fn validate_ciphertext(ciphertext_b64: &str) -> Result<(), ProtocolError> {
    // Reject oversized input before allocating for the decode.
    if ciphertext_b64.len() > (MAX_CIPHERTEXT_SIZE / 3 + 1) * 4 {
        return Err(ProtocolError::invalid("ciphertext", "too large"));
    }
    let bytes = decode_b64("ciphertext", ciphertext_b64)?;
    if bytes.is_empty() {
        return Err(ProtocolError::invalid("ciphertext", "empty"));
    }
    if bytes.len() > MAX_CIPHERTEXT_SIZE {
        return Err(ProtocolError::invalid("ciphertext", "too large"));
    }
    Ok(())
}

/// Object keys must be relative, path-safe and free of traversal sequences.
pub fn validate_object_key(key: &str) -> Result<(), ProtocolError> {
    if key.is_empty() || key.len() > MAX_OBJECT_KEY_LEN {
        return Err(ProtocolError::invalid("objectKey", "length out of range"));
    }
    if !key
        .bytes()
        .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'/' | b'_' | b'.' | b'-'))
    {
        return Err(ProtocolError::invalid("objectKey", "unexpected character"));
    }
    if key.starts_with('/') || key.ends_with('/') || key.contains("//") || key.contains("..") {
        return Err(ProtocolError::invalid("objectKey", "path traversal"));
    }
    Ok(())
}

pub fn validate_content_type(content_type: &str) -> Result<(), ProtocolError> {
    if !ALLOWED_CONTENT_TYPES.contains(&content_type) {
        return Err(ProtocolError::invalid("contentType", "not allowed"));
    }
    Ok(())
}

pub fn validate_attachment(pointer: &AttachmentPointer) -> Result<(), ProtocolError> {
    validate_object_key(&pointer.object_key)?;
    validate_content_type(&pointer.content_type)?;
    if pointer.ciphertext_size == 0 || pointer.ciphertext_size > MAX_ATTACHMENT_SIZE {
        return Err(ProtocolError::invalid("ciphertextSize", "out of range"));
    }
    validate_nonce("fileNonce", &pointer.file_nonce)?;
    validate_nonce("fileKeyBox.nonce", &pointer.file_key_box.nonce)?;
    let boxed = decode_b64("fileKeyBox.ciphertext", &pointer.file_key_box.ciphertext)?;
    if boxed.is_empty() || boxed.len() > MAX_FILE_KEY_BOX_SIZE {
        return Err(ProtocolError::invalid("fileKeyBox.ciphertext", "length out of range"));
    }
    Ok(())
}

/// Trim and bound a group title.
pub fn normalize_group_title(title: &str) -> Result<String, ProtocolError> {
    let trimmed = title.trim();
    let len = trimmed.chars().count();
    if len == 0 || len > MAX_GROUP_TITLE {
        return Err(ProtocolError::invalid("title", "length out of range"));
    }
    Ok(trimmed.to_string())
}
