use serde::ser::{Serialize, SerializeStruct, Serializer};

use crate::error::{CodecError, JsonRpcErrorObject};
use crate::types::{JsonRpcVersion, Params, RequestId};

/// A JSON-RPC response.
///
/// `outcome` makes "exactly one of result or error" a property of the type.
/// `id` is `None` only for error responses to input whose id could not be
/// recovered (the wire form carries `"id": null`).
#[derive(Debug, Clone, PartialEq)]
pub struct JsonRpcResponse {
    pub version: JsonRpcVersion,
    pub id: Option<RequestId>,
    pub outcome: Result<Params, JsonRpcErrorObject>,
}

impl JsonRpcResponse {
    pub fn from_outcome(id: Option<RequestId>, outcome: Result<Params, JsonRpcErrorObject>) -> Self {
        Self {
            version: JsonRpcVersion::V2_0,
            id,
            outcome,
        }
    }

    pub fn success(id: RequestId, result: Params) -> Self {
        Self::from_outcome(Some(id), Ok(result))
    }

    /// Success with an empty result object
    pub fn empty(id: RequestId) -> Self {
        Self::success(id, Params::new())
    }

    pub fn error(id: RequestId, error: JsonRpcErrorObject) -> Self {
        Self::from_outcome(Some(id), Err(error))
    }

    /// Error response for a message whose id could not be determined
    pub fn error_without_id(error: JsonRpcErrorObject) -> Self {
        Self::from_outcome(None, Err(error))
    }

    /// Error response answering a codec failure
    pub fn from_codec_error(error: &CodecError) -> Self {
        Self::from_outcome(error.request_id().cloned(), Err(error.to_error_object()))
    }

    /// Check if this is an error response
    pub fn is_error(&self) -> bool {
        self.outcome.is_err()
    }

    pub fn result(&self) -> Option<&Params> {
        self.outcome.as_ref().ok()
    }

    pub fn error_object(&self) -> Option<&JsonRpcErrorObject> {
        self.outcome.as_ref().err()
    }
}

/// Exactly one of `result` or `error` goes on the wire; a missing id is `null`.
impl Serialize for JsonRpcResponse {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let mut state = serializer.serialize_struct("JsonRpcResponse", 3)?;
        state.serialize_field("jsonrpc", &self.version)?;
        state.serialize_field("id", &self.id)?;
        match &self.outcome {
            Ok(result) => state.serialize_field("result", result)?,
            Err(error) => state.serialize_field("error", error)?,
        }
        state.end()
    }
}
