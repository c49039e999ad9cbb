/// Error taxonomy for the proxy
///
/// Codec, transport and validator failures are typed so the session loop can
/// decide which ones get a reply and which ones end the connection.

use serde_json::Value;
use thiserror::Error;

use crate::stratum::protocol::Method;

#[derive(Error, Debug)]
pub enum ProxyError {
    /// The line was not valid JSON or had no usable envelope.
    #[error("malformed message: {0}")]
    Parse(#[from] serde_json::Error),

    /// Line framing failed (line too long, invalid UTF-8).
    #[error("framing error: {0}")]
    Framing(String),

    /// Well-formed JSON with the wrong arity or encoding for its method.
    #[error("bad input for {method}: {reason}")]
    BadInput {
        id: Value,
        method: &'static str,
        reason: String,
    },

    #[error("unknown method: {method}")]
    UnknownMethod { id: Value, method: String },

    #[error("protocol violation: expected {expected}, got {got}")]
    ProtocolViolation { expected: Method, got: Method },

    #[error("{0} deadline exceeded")]
    Timeout(&'static str),

    /// Peer closed the stream cleanly.
    #[error("end of stream")]
    Eof,

    #[error("transport error: {0}")]
    Transport(#[from] std::io::Error),

    #[error("session closed")]
    SessionClosed,

    #[error("invalid compact target {0:#010x}")]
    InvalidCompactTarget(u32),

    #[error(transparent)]
    Base58(#[from] Base58Error),

    #[error("rpc error: {0}")]
    Rpc(String),

    #[error("share publish failed: {0}")]
    Publish(String),
}

impl ProxyError {
    /// Request id to echo in an error reply, when the failed line carried one.
    pub fn reply_id(&self) -> Option<&Value> {
        match self {
            ProxyError::BadInput { id, .. } | ProxyError::UnknownMethod { id, .. } => Some(id),
            _ => None,
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Base58Error {
    #[error("base58: invalid character {0:?}")]
    InvalidCharacter(char),

    #[error("base58: too short")]
    TooShort,

    #[error("base58: bad checksum")]
    Checksum,
}

pub type Result<T> = std::result::Result<T, ProxyError>;
