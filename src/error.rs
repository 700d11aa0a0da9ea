//! Error taxonomy shared by the relay pipeline.
//!
//! Validation failures are reported back to the sender and never end the
//! connection. Protocol failures are fatal to the session. Storage conflicts on
//! the event primary key are recovered by the write path as no-ops.

use thiserror::Error;

/// A rejected event, one variant per failing rule.
#[derive(Debug, Error)]
pub enum ValidationError {
    /// The event object could not be decoded into the event model.
    #[error("malformed event: {0}")]
    Malformed(#[source] serde_json::Error),
    /// `pubkey` is not hex.
    #[error("invalid public key encoding: {0}")]
    PublicKeyEncoding(#[source] hex::FromHexError),
    /// `pubkey` decodes but is not a valid x-only secp256k1 key.
    #[error("invalid public key: {0}")]
    PublicKey(#[source] secp256k1::Error),
    /// Declared id differs from the digest of the canonical serialization.
    #[error("event id mismatch: declared {declared}, computed {computed}")]
    IdMismatch { declared: String, computed: String },
    /// `sig` is not hex.
    #[error("invalid signature encoding: {0}")]
    SignatureEncoding(#[source] hex::FromHexError),
    /// Signature is malformed or does not verify over the id.
    #[error("invalid signature: {0}")]
    Signature(#[source] secp256k1::Error),
    /// `created_at` lies ahead of the relay clock.
    #[error("event timestamp {created_at} is in the future (now {now})")]
    FromFuture { created_at: u64, now: u64 },
    /// `created_at` is older than the retention horizon.
    #[error("event timestamp {created_at} is older than {horizon}")]
    TooOld { created_at: u64, horizon: u64 },
    /// Kind falls outside every storage band.
    #[error("kind {0} is not implemented")]
    UnsupportedKind(u32),
}

/// A message that does not follow the wire protocol.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("message is not valid JSON: {0}")]
    NotJson(#[source] serde_json::Error),
    #[error("message is not a JSON array with a command")]
    NotACommand,
    #[error("unknown command {0:?}")]
    UnknownCommand(String),
    #[error("malformed {command} message: {reason}")]
    Shape {
        command: &'static str,
        reason: &'static str,
    },
    #[error("invalid filter: {0}")]
    Filter(String),
    #[error("too many filters: {count} (at most {max})")]
    TooManyFilters { count: usize, max: usize },
    #[error("filters bind {count} values (at most {max})")]
    TooManyValues { count: usize, max: usize },
}

/// Failures raised by the storage collaborator.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("connection pool: {0}")]
    Pool(#[from] r2d2::Error),
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("storage worker failed: {0}")]
    Worker(#[from] tokio::task::JoinError),
    /// Duplicate primary key on insert.
    #[error("duplicate primary key")]
    Conflict,
    #[error("unexpected row shape: {0}")]
    Decode(String),
}

/// Failures raised by the broadcast collaborator.
#[derive(Debug, Error)]
pub enum BusError {
    #[error("topic {0:?} is closed")]
    Closed(String),
}

/// Umbrella error returned by relay operations.
#[derive(Debug, Error)]
pub enum RelayError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error("not found: {0}")]
    NotFound(String),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Bus(#[from] BusError),
}

impl RelayError {
    /// Whether the error must terminate the connection.
    pub fn is_fatal(&self) -> bool {
        matches!(self, RelayError::Protocol(_))
    }
}
