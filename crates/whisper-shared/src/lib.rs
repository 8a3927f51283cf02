//! # whisper-shared
//!
//! Types shared between the Whisper relay server and its clients: the
//! WebSocket wire protocol, protocol constants, the error-code taxonomy,
//! signature helpers and structural validation of envelopes.

pub mod constants;
pub mod crypto;
pub mod error;
pub mod identity;
pub mod protocol;
pub mod types;
pub mod validation;

pub use error::{ErrorCode, ProtocolError};
