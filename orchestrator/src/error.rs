use crate::*;

use thiserror::Error;
use uuid::Uuid;

/// Error types
#[derive(Debug, Error)]
pub enum Error {
    #[error("orchestrator: invalid identifier {0:?} - expected a UUID")]
    InvalidIdentifier(String),

    #[error("orchestrator: resource not found: {0}")]
    ResourceNotFound(String),

    #[error("orchestrator: ballot box is not mixed (status is {0})")]
    NotMixed(AggregateStatus),

    #[error("orchestrator: coordinator has not been started")]
    NotStarted,

    #[error("orchestrator: coordinator is already started")]
    AlreadyStarted,

    #[error("orchestrator: node response addressed to unknown node {0}")]
    UnexpectedNode(u32),

    #[error("orchestrator: contribution from node is missing public key #{0}")]
    MissingPublicKey(usize),

    #[error("orchestrator: store error: {0}")]
    Store(#[from] StoreError),

    #[error("orchestrator: messaging error: {0}")]
    Messaging(#[from] MessagingError),

    #[error("orchestrator: codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("orchestrator: vote source error: {0}")]
    VoteSource(#[from] VoteSourceError),

    #[error("orchestrator: {0}")]
    Aggregator(#[from] AggregatorError),

    #[error("orchestrator: configuration error: {0}")]
    Config(#[from] ConfigError),
}

/// Infrastructure failures of the status and node-output stores.
///
/// A duplicate node output is not an error, see [`InsertOutcome`].
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    #[error("store unreachable: {0}")]
    Unreachable(String),

    #[error("no status record for chunk {0}")]
    ChunkNotFound(ChunkKey),
}

/// Transport failures of the messaging fabric
#[derive(Debug, Clone, Error)]
pub enum MessagingError {
    #[error("failed to send to {destination}: {reason}")]
    Send { destination: String, reason: String },

    #[error("no receiver attached to {0}")]
    NoReceiver(String),
}

/// Malformed or undeserializable message bytes
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("empty message body")]
    EmptyMessage,

    #[error("unknown frame type {0}")]
    UnknownFrameType(u8),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("CBOR error: {0}")]
    Cbor(#[from] serde_cbor::Error),
}

/// Failures reported by the chunked vote source
#[derive(Debug, Clone, Error)]
pub enum VoteSourceError {
    #[error("ballot box {0} not found")]
    NotFound(String),

    #[error("ballot box {0} is not closed yet")]
    NotReady(String),

    #[error("vote source unavailable: {0}")]
    Unavailable(String),
}

#[derive(Debug, Clone, Error)]
pub enum AggregatorError {
    #[error("timed out waiting for {correlation_id}: received {received} of {expected} results")]
    Timeout {
        correlation_id: Uuid,
        received: usize,
        expected: usize,
    },

    #[error("correlation id {0} is already pending")]
    DuplicateCorrelationId(Uuid),
}

#[derive(Debug, Clone, Error)]
pub enum ConfigError {
    #[error("environment variable {0} must be set")]
    MissingVariable(&'static str),

    #[error("cannot parse {name}: {reason}")]
    Invalid { name: &'static str, reason: String },

    #[error("unknown action {action} for node {node} in CC_QUEUE_NAMES")]
    UnknownAction { node: String, action: String },

    #[error("no queues configured for {0}")]
    NoQueues(&'static str),
}
