//! # JSON-RPC Prelude
//!
//! Convenient re-exports of the most commonly used types.
//!
//! ```rust
//! use turul_mcp_json_rpc::prelude::*;
//! ```

pub use crate::codec::{Decoded, decode, decode_str, encode, encode_batch};
pub use crate::dispatch::{
    DispatchOutcome, HandlerError, JsonRpcDispatcher, MethodHandler, NotificationHandler,
    RequestHandler, SessionContext, notification_fn, request_fn,
};
pub use crate::error::{CodecError, JsonRpcErrorCode, JsonRpcErrorObject};
pub use crate::message::{Batch, JsonRpcMessage};
pub use crate::notification::JsonRpcNotification;
pub use crate::request::JsonRpcRequest;
pub use crate::response::JsonRpcResponse;
pub use crate::types::{JsonRpcVersion, Params, RequestId};

// Standard error codes
pub use crate::error_codes::*;
