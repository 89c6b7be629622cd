//! # JSON-RPC 2.0 for the MCP engine
//!
//! A transport-agnostic JSON-RPC 2.0 layer: the message model, a strict codec
//! between wire JSON and typed messages, and a method-name dispatcher. Nothing
//! in this crate knows about connections, lifecycles or capabilities.
//!
//! ## Features
//! - Requests, responses and notifications as distinct types
//! - Batches decoded element by element with isolated failures
//! - Handler registry with panic containment at the dispatch boundary

pub mod codec;
pub mod dispatch;
pub mod error;
pub mod message;
pub mod notification;
pub mod prelude;
pub mod request;
pub mod response;
pub mod types;

// Re-export main types
pub use codec::{Decoded, decode, decode_message, decode_str, encode, encode_batch};
pub use dispatch::{
    DispatchOutcome, HandlerError, JsonRpcDispatcher, MethodHandler, NotificationHandler,
    RequestHandler, SessionContext, notification_fn, request_fn,
};
pub use error::{CodecError, JsonRpcErrorCode, JsonRpcErrorObject};
pub use message::{Batch, JsonRpcMessage};
pub use notification::JsonRpcNotification;
pub use request::JsonRpcRequest;
pub use response::JsonRpcResponse;
pub use types::{JsonRpcVersion, Params, RequestId};

/// JSON-RPC 2.0 version constant
pub const JSONRPC_VERSION: &str = "2.0";

/// Standard JSON-RPC 2.0 error codes
pub mod error_codes {
    pub const PARSE_ERROR: i64 = -32700;
    pub const INVALID_REQUEST: i64 = -32600;
    pub const METHOD_NOT_FOUND: i64 = -32601;
    pub const INVALID_PARAMS: i64 = -32602;
    pub const INTERNAL_ERROR: i64 = -32603;

    // Reserved block: -32768 to -32000
    pub const RESERVED_START: i64 = -32768;

    // Server error range: -32099 to -32000
    pub const SERVER_ERROR_START: i64 = -32099;
    pub const SERVER_ERROR_END: i64 = -32000;
}
