//! Conversions between typed payloads and JSON-RPC `params`/`result` objects

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use turul_mcp_json_rpc::Params;

use crate::{McpError, McpResult};

/// Serialize a payload that must be a JSON object
pub fn to_params<T: Serialize>(value: &T) -> McpResult<Params> {
    match serde_json::to_value(value)? {
        Value::Object(map) => Ok(map),
        other => Err(McpError::InvalidParameters(format!(
            "expected an object, got {}",
            other
        ))),
    }
}

/// Deserialize a payload. Missing params read as an empty object.
pub fn from_params<T: DeserializeOwned>(params: Option<Params>) -> McpResult<T> {
    let value = Value::Object(params.unwrap_or_default());
    Ok(serde_json::from_value(value)?)
}
