use serde::Serialize;
use serde_json::Value;

use crate::types::{JsonRpcVersion, Params};

/// A JSON-RPC notification (request without an id)
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JsonRpcNotification {
    #[serde(rename = "jsonrpc")]
    pub version: JsonRpcVersion,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Params>,
}

impl JsonRpcNotification {
    pub fn new(method: impl Into<String>, params: Option<Params>) -> Self {
        Self {
            version: JsonRpcVersion::V2_0,
            method: method.into(),
            params,
        }
    }

    /// Create a new notification with no parameters
    pub fn new_no_params(method: impl Into<String>) -> Self {
        Self::new(method, None)
    }

    /// Get a parameter by name
    pub fn get_param(&self, name: &str) -> Option<&Value> {
        self.params.as_ref()?.get(name)
    }
}
