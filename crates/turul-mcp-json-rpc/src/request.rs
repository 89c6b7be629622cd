use serde::Serialize;
use serde_json::Value;

use crate::types::{JsonRpcVersion, Params, RequestId};

/// A JSON-RPC request
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JsonRpcRequest {
    #[serde(rename = "jsonrpc")]
    pub version: JsonRpcVersion,
    pub id: RequestId,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Params>,
}

impl JsonRpcRequest {
    pub fn new(id: impl Into<RequestId>, method: impl Into<String>, params: Option<Params>) -> Self {
        Self {
            version: JsonRpcVersion::V2_0,
            id: id.into(),
            method: method.into(),
            params,
        }
    }

    /// Create a new request with no parameters
    pub fn new_no_params(id: impl Into<RequestId>, method: impl Into<String>) -> Self {
        Self::new(id, method, None)
    }

    /// Get a parameter by name
    pub fn get_param(&self, name: &str) -> Option<&Value> {
        self.params.as_ref()?.get(name)
    }
}
