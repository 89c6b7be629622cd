//! Error types for engine operations

use std::time::Duration;

use thiserror::Error;
use turul_mcp_json_rpc::{CodecError, JsonRpcErrorObject, RequestId};
use turul_mcp_protocol::{Capability, McpError, Role, error_codes};

use crate::transport::{TransportError, TransportMetadata};

/// Result type for engine operations
pub type EngineResult<T> = Result<T, EngineError>;

/// Everything that can go wrong on a connection
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("Connection not initialized: '{method}' is not allowed before initialization completes")]
    NotInitialized { method: String },

    #[error("Duplicate request id: {0}")]
    DuplicateId(RequestId),

    #[error("No pending request for response id {0}")]
    OrphanResponse(RequestId),

    #[error("{} does not support {capability} capability (required by '{method}')", capitalize(.declared_by))]
    CapabilityViolation {
        method: String,
        capability: Capability,
        declared_by: Role,
    },

    #[error("Connection is shutting down")]
    ShuttingDown,

    /// The peer answered with an error response. `metadata` is whatever the
    /// transport attached to the frame that carried it.
    #[error("Remote error: {error}")]
    Remote {
        error: JsonRpcErrorObject,
        metadata: Option<TransportMetadata>,
    },

    #[error("Request cancelled")]
    Cancelled,

    #[error("Request timed out after {0:?}")]
    Timeout(Duration),

    #[error("Protocol version mismatch: requested {requested}, offered {offered}")]
    VersionMismatch { requested: String, offered: String },

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(String),
}

fn capitalize(role: &Role) -> &'static str {
    match role {
        Role::Client => "Client",
        Role::Server => "Server",
    }
}

impl EngineError {
    pub fn violation(message: impl Into<String>) -> Self {
        Self::ProtocolViolation(message.into())
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    /// Wire representation used when this error answers a peer's request
    pub fn to_error_object(&self) -> JsonRpcErrorObject {
        match self {
            EngineError::Codec(err) => err.to_error_object(),
            EngineError::ProtocolViolation(msg) => {
                JsonRpcErrorObject::invalid_request(Some(format!("Protocol violation: {}", msg)))
            }
            EngineError::NotInitialized { .. } => {
                JsonRpcErrorObject::domain(error_codes::NOT_INITIALIZED, self.to_string(), None)
            }
            EngineError::CapabilityViolation { .. } => JsonRpcErrorObject::domain(
                error_codes::CAPABILITY_NOT_SUPPORTED,
                self.to_string(),
                None,
            ),
            EngineError::ShuttingDown => {
                JsonRpcErrorObject::domain(error_codes::SHUTTING_DOWN, self.to_string(), None)
            }
            EngineError::Remote { error, .. } => error.clone(),
            other => JsonRpcErrorObject::internal_error(Some(other.to_string())),
        }
    }

    /// Check if the error came from the peer rather than from this side
    pub fn is_remote(&self) -> bool {
        matches!(self, Self::Remote { .. })
    }

    /// Get the JSON-RPC error code if the peer answered with an error
    pub fn error_code(&self) -> Option<i64> {
        match self {
            Self::Remote { error, .. } => Some(error.code),
            _ => None,
        }
    }

    /// Transport metadata of the error response, if the peer's frame had any
    pub fn transport_metadata(&self) -> Option<&TransportMetadata> {
        match self {
            Self::Remote { metadata, .. } => metadata.as_ref(),
            _ => None,
        }
    }
}

impl From<McpError> for EngineError {
    fn from(err: McpError) -> Self {
        match err {
            McpError::SerializationError(e) => EngineError::Serialization(e),
            other => EngineError::ProtocolViolation(other.to_string()),
        }
    }
}
