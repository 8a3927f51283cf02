/// Wire protocol version announced by clients.
pub const PROTOCOL_VERSION: u32 = 1;

/// Crypto suite version announced by clients.
pub const CRYPTO_VERSION: u32 = 1;

/// Prefix of every server-assigned identity.
pub const WHISPER_ID_PREFIX: &str = "WSP";

/// Alphabet used for the random groups of a whisper id (RFC 4648 base32).
pub const WHISPER_ID_ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ234567";

/// XSalsa20-Poly1305 nonce size in bytes
pub const NONCE_SIZE: usize = 24;

/// X25519 / Ed25519 public key size in bytes
pub const PUBKEY_SIZE: usize = 32;

/// Ed25519 signature size in bytes
pub const SIGNATURE_SIZE: usize = 64;

/// Random challenge size in bytes
pub const CHALLENGE_SIZE: usize = 32;

/// Session token entropy in bytes
pub const SESSION_TOKEN_SIZE: usize = 32;

/// Maximum decoded ciphertext size of a single envelope (256 KiB)
pub const MAX_CIPHERTEXT_SIZE: usize = 262_144;

/// Maximum attachment size in bytes (100 MiB)
pub const MAX_ATTACHMENT_SIZE: u64 = 100 * 1024 * 1024;

/// Maximum decoded size of a wrapped attachment file key
pub const MAX_FILE_KEY_BOX_SIZE: usize = 256;

/// Maximum contact backup size in bytes (256 KiB)
pub const MAX_BACKUP_SIZE: usize = 256 * 1024;

/// Maximum length of an attachment object key
pub const MAX_OBJECT_KEY_LEN: usize = 255;

/// Allowed symmetric clock skew for envelope timestamps (10 minutes)
pub const TIMESTAMP_SKEW_MS: i64 = 10 * 60 * 1000;

/// Lifetime of an issued registration challenge
pub const CHALLENGE_TTL_SECS: u64 = 60;

/// Lifetime of a session token (7 days)
pub const SESSION_TTL_SECS: u64 = 7 * 24 * 60 * 60;

/// Retention of undelivered envelopes (72 hours)
pub const PENDING_TTL_SECS: u64 = 72 * 60 * 60;

/// Lifetime of an idempotency marker (7 days)
pub const DEDUP_TTL_SECS: u64 = 7 * 24 * 60 * 60;

/// Coalescing window for wake pushes
pub const PUSH_SUPPRESS_SECS: u64 = 60;

/// Heartbeat ping interval
pub const HEARTBEAT_INTERVAL_SECS: u64 = 30;

/// A connection silent for this many ping intervals is evicted
pub const HEARTBEAT_TIMEOUT_FACTOR: u32 = 2;

/// Maximum active members of a group, owner included
pub const MAX_GROUP_MEMBERS: usize = 50;

/// Maximum group title length in characters
pub const MAX_GROUP_TITLE: usize = 64;

/// Default and maximum page size of `fetch_pending`
pub const PENDING_PAGE_DEFAULT: usize = 50;
pub const PENDING_PAGE_MAX: usize = 100;

/// Maximum number of identities in one presence query
pub const MAX_PRESENCE_QUERY: usize = 100;

/// Field names that must never appear in a push payload
pub const FORBIDDEN_PUSH_FIELDS: &[&str] = &[
    "ciphertext",
    "nonce",
    "messageId",
    "senderId",
    "groupId",
    "objectKey",
    "attachment",
    "content",
    "plaintext",
];

/// Content types accepted in attachment pointers
pub const ALLOWED_CONTENT_TYPES: &[&str] = &[
    "image/jpeg",
    "image/png",
    "image/gif",
    "image/webp",
    "image/heic",
    "video/mp4",
    "video/quicktime",
    "audio/aac",
    "audio/mp4",
    "audio/mpeg",
    "audio/ogg",
    "audio/wav",
    "application/pdf",
    "application/zip",
    "application/octet-stream",
    "text/plain",
];
