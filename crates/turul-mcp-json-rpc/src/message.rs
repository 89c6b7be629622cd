use serde::Serialize;

use crate::notification::JsonRpcNotification;
use crate::request::JsonRpcRequest;
use crate::response::JsonRpcResponse;
use crate::types::RequestId;

/// Any single JSON-RPC message
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum JsonRpcMessage {
    Request(JsonRpcRequest),
    Response(JsonRpcResponse),
    Notification(JsonRpcNotification),
}

/// An ordered group of messages sent as one array
pub type Batch = Vec<JsonRpcMessage>;

impl JsonRpcMessage {
    /// Method name for requests and notifications
    pub fn method(&self) -> Option<&str> {
        match self {
            JsonRpcMessage::Request(req) => Some(&req.method),
            JsonRpcMessage::Notification(notif) => Some(&notif.method),
            JsonRpcMessage::Response(_) => None,
        }
    }

    pub fn id(&self) -> Option<&RequestId> {
        match self {
            JsonRpcMessage::Request(req) => Some(&req.id),
            JsonRpcMessage::Response(resp) => resp.id.as_ref(),
            JsonRpcMessage::Notification(_) => None,
        }
    }

    pub fn is_request(&self) -> bool {
        matches!(self, JsonRpcMessage::Request(_))
    }

    pub fn is_response(&self) -> bool {
        matches!(self, JsonRpcMessage::Response(_))
    }

    pub fn is_notification(&self) -> bool {
        matches!(self, JsonRpcMessage::Notification(_))
    }
}

impl From<JsonRpcRequest> for JsonRpcMessage {
    fn from(request: JsonRpcRequest) -> Self {
        JsonRpcMessage::Request(request)
    }
}

impl From<JsonRpcResponse> for JsonRpcMessage {
    fn from(response: JsonRpcResponse) -> Self {
        JsonRpcMessage::Response(response)
    }
}

impl From<JsonRpcNotification> for JsonRpcMessage {
    fn from(notification: JsonRpcNotification) -> Self {
        JsonRpcMessage::Notification(notification)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_accessors() {
        let request: JsonRpcMessage = JsonRpcRequest::new_no_params(1i64, "ping").into();
        assert!(request.is_request());
        assert_eq!(request.method(), Some("ping"));
        assert_eq!(request.id(), Some(&RequestId::Number(1)));

        let notification: JsonRpcMessage =
            JsonRpcNotification::new_no_params("notifications/initialized").into();
        assert!(notification.is_notification());
        assert_eq!(notification.id(), None);

        let response: JsonRpcMessage = JsonRpcResponse::empty(RequestId::from("a")).into();
        assert!(response.is_response());
        assert_eq!(response.method(), None);
        assert_eq!(response.id(), Some(&RequestId::String("a".into())));
    }
}
