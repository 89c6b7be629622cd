//! Conversion between wire JSON and [`JsonRpcMessage`].
//!
//! Encoding goes through the messages' `Serialize` impls. Decoding is strict: anything that does not match one of the three message
//! shapes exactly is rejected with [`CodecError::InvalidMessage`] rather than
//! repaired. Batch elements are decoded independently so one bad element never
//! poisons its siblings.

use serde_json::{Map, Value};

use crate::JSONRPC_VERSION;
use crate::error::{CodecError, JsonRpcErrorObject};
use crate::message::JsonRpcMessage;
use crate::notification::JsonRpcNotification;
use crate::request::JsonRpcRequest;
use crate::response::JsonRpcResponse;
use crate::types::RequestId;

/// Result of decoding one frame
#[derive(Debug, Clone, PartialEq)]
pub enum Decoded {
    Message(JsonRpcMessage),
    /// Each element decoded on its own, in arrival order
    Batch(Vec<Result<JsonRpcMessage, CodecError>>),
}

/// Encode a single message into its wire object
pub fn encode(message: &JsonRpcMessage) -> Result<Value, serde_json::Error> {
    serde_json::to_value(message)
}

/// Encode several messages as one batch array
pub fn encode_batch(messages: &[JsonRpcMessage]) -> Result<Value, serde_json::Error> {
    serde_json::to_value(messages)
}

/// Decode one frame: a single message object or a batch array
pub fn decode(value: Value) -> Result<Decoded, CodecError> {
    match value {
        Value::Array(items) => {
            if items.is_empty() {
                return Err(CodecError::EmptyBatch);
            }
            Ok(Decoded::Batch(items.into_iter().map(decode_message).collect()))
        }
        other => decode_message(other).map(Decoded::Message),
    }
}

/// Parse text and decode it
pub fn decode_str(text: &str) -> Result<Decoded, CodecError> {
    let value: Value =
        serde_json::from_str(text).map_err(|e| CodecError::Parse(e.to_string()))?;
    decode(value)
}

/// Decode exactly one message object
pub fn decode_message(value: Value) -> Result<JsonRpcMessage, CodecError> {
    let Value::Object(mut obj) = value else {
        return Err(CodecError::invalid(None, "message must be a JSON object"));
    };

    // Only request-shaped input is ever answered, so only it carries its id out.
    let request_shaped = obj.contains_key("method");
    let recovered_id = if request_shaped {
        obj.get("id").and_then(RequestId::from_value)
    } else {
        None
    };

    match obj.get("jsonrpc") {
        Some(Value::String(v)) if v == JSONRPC_VERSION => {}
        Some(_) => {
            return Err(CodecError::invalid(recovered_id, "jsonrpc must be \"2.0\""));
        }
        None => {
            return Err(CodecError::invalid(recovered_id, "missing jsonrpc member"));
        }
    }

    if request_shaped {
        decode_call(obj, recovered_id)
    } else {
        decode_response(&mut obj)
    }
}

fn decode_call(
    mut obj: Map<String, Value>,
    recovered_id: Option<RequestId>,
) -> Result<JsonRpcMessage, CodecError> {
    let invalid = |reason: &str| CodecError::invalid(recovered_id.clone(), reason);

    if obj.contains_key("result") || obj.contains_key("error") {
        return Err(invalid("request must not carry result or error"));
    }

    let method = match obj.remove("method") {
        Some(Value::String(m)) if !m.is_empty() => m,
        Some(Value::String(_)) => return Err(invalid("method must not be empty")),
        _ => return Err(invalid("method must be a string")),
    };

    let params = match obj.remove("params") {
        None => None,
        Some(Value::Object(p)) => Some(p),
        Some(_) => return Err(invalid("params must be an object")),
    };

    match obj.get("id") {
        None => Ok(JsonRpcNotification::new(method, params).into()),
        Some(_) => match recovered_id {
            Some(id) => Ok(JsonRpcRequest::new(id, method, params).into()),
            None => Err(CodecError::invalid(
                None,
                "id must be a string or integer",
            )),
        },
    }
}

fn decode_response(obj: &mut Map<String, Value>) -> Result<JsonRpcMessage, CodecError> {
    let id = match obj.get("id") {
        None => return Err(CodecError::invalid(None, "response is missing id")),
        Some(Value::Null) => None,
        Some(raw) => match RequestId::from_value(raw) {
            Some(id) => Some(id),
            None => {
                return Err(CodecError::invalid(
                    None,
                    "id must be a string, integer or null",
                ));
            }
        },
    };

    let outcome = match (obj.remove("result"), obj.remove("error")) {
        (Some(_), Some(_)) => {
            return Err(CodecError::invalid(
                None,
                "response must not carry both result and error",
            ));
        }
        (None, None) => {
            return Err(CodecError::invalid(
                None,
                "response must carry result or error",
            ));
        }
        (Some(Value::Object(result)), None) => Ok(result),
        (Some(_), None) => {
            return Err(CodecError::invalid(None, "result must be an object"));
        }
        (None, Some(error)) => Err(decode_error_object(error)?),
    };

    if id.is_none() && outcome.is_ok() {
        return Err(CodecError::invalid(
            None,
            "only error responses may carry a null id",
        ));
    }

    Ok(JsonRpcResponse::from_outcome(id, outcome).into())
}

fn decode_error_object(value: Value) -> Result<JsonRpcErrorObject, CodecError> {
    let Value::Object(mut obj) = value else {
        return Err(CodecError::invalid(None, "error must be an object"));
    };
    let code = obj
        .get("code")
        .and_then(Value::as_i64)
        .ok_or_else(|| CodecError::invalid(None, "error code must be an integer"))?;
    let message = match obj.remove("message") {
        Some(Value::String(m)) => m,
        _ => return Err(CodecError::invalid(None, "error message must be a string")),
    };
    Ok(JsonRpcErrorObject {
        code,
        message,
        data: obj.remove("data"),
    })
}
