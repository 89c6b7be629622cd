use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use thiserror::Error;
use tracing::warn;

use crate::error_codes;
use crate::types::RequestId;

/// JSON-RPC error codes
///
/// The five standard codes form a closed set. Everything else is a domain code
/// owned by the protocol built on top of this crate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JsonRpcErrorCode {
    ParseError,
    InvalidRequest,
    MethodNotFound,
    InvalidParams,
    InternalError,
    Domain(i64),
}

impl JsonRpcErrorCode {
    pub fn code(&self) -> i64 {
        match self {
            JsonRpcErrorCode::ParseError => error_codes::PARSE_ERROR,
            JsonRpcErrorCode::InvalidRequest => error_codes::INVALID_REQUEST,
            JsonRpcErrorCode::MethodNotFound => error_codes::METHOD_NOT_FOUND,
            JsonRpcErrorCode::InvalidParams => error_codes::INVALID_PARAMS,
            JsonRpcErrorCode::InternalError => error_codes::INTERNAL_ERROR,
            JsonRpcErrorCode::Domain(code) => *code,
        }
    }

    pub fn from_code(code: i64) -> Self {
        match code {
            error_codes::PARSE_ERROR => JsonRpcErrorCode::ParseError,
            error_codes::INVALID_REQUEST => JsonRpcErrorCode::InvalidRequest,
            error_codes::METHOD_NOT_FOUND => JsonRpcErrorCode::MethodNotFound,
            error_codes::INVALID_PARAMS => JsonRpcErrorCode::InvalidParams,
            error_codes::INTERNAL_ERROR => JsonRpcErrorCode::InternalError,
            other => JsonRpcErrorCode::Domain(other),
        }
    }

    pub fn message(&self) -> &'static str {
        match self {
            JsonRpcErrorCode::ParseError => "Parse error",
            JsonRpcErrorCode::InvalidRequest => "Invalid Request",
            JsonRpcErrorCode::MethodNotFound => "Method not found",
            JsonRpcErrorCode::InvalidParams => "Invalid params",
            JsonRpcErrorCode::InternalError => "Internal error",
            JsonRpcErrorCode::Domain(_) => "Server error",
        }
    }

    pub fn is_standard(&self) -> bool {
        !matches!(self, JsonRpcErrorCode::Domain(_))
    }

    /// Codes JSON-RPC keeps for itself: the reserved block minus the
    /// implementation-defined server error range
    pub fn is_reserved(code: i64) -> bool {
        (error_codes::RESERVED_START..error_codes::SERVER_ERROR_START).contains(&code)
    }
}

impl fmt::Display for JsonRpcErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code(), self.message())
    }
}

/// JSON-RPC Error object
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcErrorObject {
    pub code: i64,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl JsonRpcErrorObject {
    pub fn new(code: JsonRpcErrorCode, message: Option<String>, data: Option<Value>) -> Self {
        Self {
            code: code.code(),
            message: message.unwrap_or_else(|| code.message().to_string()),
            data,
        }
    }

    pub fn kind(&self) -> JsonRpcErrorCode {
        JsonRpcErrorCode::from_code(self.code)
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }

    pub fn parse_error(data: Option<Value>) -> Self {
        Self::new(JsonRpcErrorCode::ParseError, None, data)
    }

    pub fn invalid_request(message: Option<String>) -> Self {
        Self::new(JsonRpcErrorCode::InvalidRequest, message, None)
    }

    pub fn method_not_found(method: &str) -> Self {
        Self::new(
            JsonRpcErrorCode::MethodNotFound,
            Some(format!("Method '{}' not found", method)),
            None,
        )
    }

    pub fn invalid_params(message: &str) -> Self {
        Self::new(
            JsonRpcErrorCode::InvalidParams,
            Some(message.to_string()),
            None,
        )
    }

    pub fn internal_error(message: Option<String>) -> Self {
        Self::new(JsonRpcErrorCode::InternalError, message, None)
    }

    /// Domain-specific error. A code JSON-RPC reserves for itself
    /// (`-32768..=-32100`, which includes the five standard codes) is replaced
    /// by `InternalError`, keeping message and data. The server error range
    /// `-32099..=-32000` and everything outside the reserved block pass through.
    pub fn domain(code: i64, message: impl Into<String>, data: Option<Value>) -> Self {
        if JsonRpcErrorCode::is_reserved(code) {
            warn!(code, "Domain error code is reserved by JSON-RPC, sending internal error");
            return Self::new(JsonRpcErrorCode::InternalError, Some(message.into()), data);
        }
        Self::new(JsonRpcErrorCode::Domain(code), Some(message.into()), data)
    }
}

impl fmt::Display for JsonRpcErrorObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "JSON-RPC Error {}: {}", self.code, self.message)
    }
}

impl std::error::Error for JsonRpcErrorObject {}

/// Malformed wire data. In a batch every element carries its own result.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum CodecError {
    #[error("JSON parse error: {0}")]
    Parse(String),

    /// `id` is only recovered for request-shaped input so it can be answered.
    #[error("Invalid message: {reason}")]
    InvalidMessage {
        id: Option<RequestId>,
        reason: String,
    },

    #[error("Empty batch")]
    EmptyBatch,
}

impl CodecError {
    pub fn invalid(id: Option<RequestId>, reason: impl Into<String>) -> Self {
        Self::InvalidMessage {
            id,
            reason: reason.into(),
        }
    }

    /// Id of the offending request, when one could be recovered
    pub fn request_id(&self) -> Option<&RequestId> {
        match self {
            CodecError::InvalidMessage { id, .. } => id.as_ref(),
            _ => None,
        }
    }

    pub fn to_error_object(&self) -> JsonRpcErrorObject {
        match self {
            CodecError::Parse(detail) => {
                JsonRpcErrorObject::parse_error(Some(Value::String(detail.clone())))
            }
            CodecError::InvalidMessage { reason, .. } => {
                JsonRpcErrorObject::invalid_request(Some(format!("Invalid Request: {}", reason)))
            }
            CodecError::EmptyBatch => {
                JsonRpcErrorObject::invalid_request(Some("Invalid Request: empty batch".into()))
            }
        }
    }
}
