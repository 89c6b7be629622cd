use std::any::Any;
use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use async_trait::async_trait;
use futures::FutureExt;
use parking_lot::RwLock;
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, warn};

use crate::{
    error::JsonRpcErrorObject,
    message::JsonRpcMessage,
    notification::JsonRpcNotification,
    request::JsonRpcRequest,
    response::JsonRpcResponse,
    types::{Params, RequestId},
};

/// Per-message context handed to handlers
#[derive(Debug, Clone, Default)]
pub struct SessionContext {
    /// Identifier of the connection the message arrived on
    pub session_id: String,
    /// Set for requests, `None` for notifications
    pub request_id: Option<RequestId>,
    /// Connection metadata such as the negotiated protocol version, plus the
    /// transport metadata of the carrying frame when there was any
    pub metadata: HashMap<String, Value>,
}

impl SessionContext {
    pub fn new(session_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            ..Default::default()
        }
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }
}

/// Failure reported by a handler
#[derive(Debug, Clone, PartialEq, Error)]
pub enum HandlerError {
    /// The handler chose the error to send
    #[error("{0}")]
    Rpc(JsonRpcErrorObject),

    #[error("Internal handler error: {0}")]
    Internal(String),
}

impl HandlerError {
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    pub fn to_error_object(&self) -> JsonRpcErrorObject {
        match self {
            HandlerError::Rpc(error) => error.clone(),
            HandlerError::Internal(message) => JsonRpcErrorObject::internal_error(Some(message.clone())),
        }
    }
}

impl From<JsonRpcErrorObject> for HandlerError {
    fn from(error: JsonRpcErrorObject) -> Self {
        HandlerError::Rpc(error)
    }
}

impl From<serde_json::Error> for HandlerError {
    fn from(error: serde_json::Error) -> Self {
        HandlerError::Rpc(JsonRpcErrorObject::invalid_params(&error.to_string()))
    }
}

/// Handles requests for one method
#[async_trait]
pub trait RequestHandler: Send + Sync {
    async fn handle(
        &self,
        method: &str,
        params: Option<Params>,
        context: SessionContext,
    ) -> Result<Params, HandlerError>;
}

/// Handles notifications for one method
#[async_trait]
pub trait NotificationHandler: Send + Sync {
    async fn handle(
        &self,
        method: &str,
        params: Option<Params>,
        context: SessionContext,
    ) -> Result<(), HandlerError>;
}

/// A registry entry. Requests only reach `Request` entries and notifications
/// only reach `Notification` entries.
#[derive(Clone)]
pub enum MethodHandler {
    Request(Arc<dyn RequestHandler>),
    Notification(Arc<dyn NotificationHandler>),
}

impl std::fmt::Debug for MethodHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MethodHandler::Request(_) => f.write_str("MethodHandler::Request"),
            MethodHandler::Notification(_) => f.write_str("MethodHandler::Notification"),
        }
    }
}

struct FnRequestHandler<F> {
    f: F,
}

#[async_trait]
impl<F, Fut> RequestHandler for FnRequestHandler<F>
where
    F: Fn(Option<Params>, SessionContext) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Params, HandlerError>> + Send,
{
    async fn handle(
        &self,
        _method: &str,
        params: Option<Params>,
        context: SessionContext,
    ) -> Result<Params, HandlerError> {
        (self.f)(params, context).await
    }
}

struct FnNotificationHandler<F> {
    f: F,
}

#[async_trait]
impl<F, Fut> NotificationHandler for FnNotificationHandler<F>
where
    F: Fn(Option<Params>, SessionContext) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), HandlerError>> + Send,
{
    async fn handle(
        &self,
        _method: &str,
        params: Option<Params>,
        context: SessionContext,
    ) -> Result<(), HandlerError> {
        (self.f)(params, context).await
    }
}

/// Wrap an async closure as a request handler
pub fn request_fn<F, Fut>(f: F) -> MethodHandler
where
    F: Fn(Option<Params>, SessionContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Params, HandlerError>> + Send + 'static,
{
    MethodHandler::Request(Arc::new(FnRequestHandler { f }))
}

/// Wrap an async closure as a notification handler
pub fn notification_fn<F, Fut>(f: F) -> MethodHandler
where
    F: Fn(Option<Params>, SessionContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    MethodHandler::Notification(Arc::new(FnNotificationHandler { f }))
}

/// What dispatching one message produced
#[derive(Debug, Clone, PartialEq)]
pub enum DispatchOutcome {
    /// A request was answered, successfully or not
    Respond(JsonRpcResponse),
    /// A notification handler ran to completion
    Handled,
    /// No handler for the notification (or the message was a response)
    Unhandled,
    /// A notification handler failed. Nothing goes on the wire.
    NotificationFailed { method: String, error: HandlerError },
}

/// Method-name registry and dispatch boundary
#[derive(Default)]
pub struct JsonRpcDispatcher {
    handlers: RwLock<HashMap<String, MethodHandler>>,
}

impl JsonRpcDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler, returning the one it replaced
    pub fn register(&self, method: impl Into<String>, handler: MethodHandler) -> Option<MethodHandler> {
        let method = method.into();
        debug!(method = %method, "Registering handler");
        self.handlers.write().insert(method, handler)
    }

    pub fn unregister(&self, method: &str) -> Option<MethodHandler> {
        self.handlers.write().remove(method)
    }

    pub fn handler(&self, method: &str) -> Option<MethodHandler> {
        self.handlers.read().get(method).cloned()
    }

    /// Get all registered methods
    pub fn registered_methods(&self) -> Vec<String> {
        self.handlers.read().keys().cloned().collect()
    }

    pub async fn dispatch(&self, message: JsonRpcMessage, context: SessionContext) -> DispatchOutcome {
        match message {
            JsonRpcMessage::Request(request) => {
                DispatchOutcome::Respond(self.dispatch_request(request, context).await)
            }
            JsonRpcMessage::Notification(notification) => {
                self.dispatch_notification(notification, context).await
            }
            JsonRpcMessage::Response(_) => DispatchOutcome::Unhandled,
        }
    }

    /// Run the handler for a request and turn its outcome into a response
    pub async fn dispatch_request(
        &self,
        request: JsonRpcRequest,
        mut context: SessionContext,
    ) -> JsonRpcResponse {
        let JsonRpcRequest {
            id,
            method,
            params,
            ..
        } = request;

        let handler = match self.handler(&method) {
            Some(MethodHandler::Request(handler)) => handler,
            _ => {
                debug!(method = %method, request_id = %id, "No request handler registered");
                return JsonRpcResponse::error(id, JsonRpcErrorObject::method_not_found(&method));
            }
        };

        context.request_id = Some(id.clone());
        let result = AssertUnwindSafe(handler.handle(&method, params, context))
            .catch_unwind()
            .await;

        match result {
            Ok(Ok(result)) => JsonRpcResponse::success(id, result),
            Ok(Err(error)) => {
                debug!(method = %method, request_id = %id, error = %error, "Request handler failed");
                JsonRpcResponse::error(id, error.to_error_object())
            }
            Err(panic) => {
                let reason = panic_message(panic.as_ref());
                warn!(method = %method, request_id = %id, reason = %reason, "Request handler panicked");
                JsonRpcResponse::error(id, JsonRpcErrorObject::internal_error(Some(reason)))
            }
        }
    }

    pub async fn dispatch_notification(
        &self,
        notification: JsonRpcNotification,
        mut context: SessionContext,
    ) -> DispatchOutcome {
        let JsonRpcNotification { method, params, .. } = notification;

        let handler = match self.handler(&method) {
            Some(MethodHandler::Notification(handler)) => handler,
            _ => {
                debug!(method = %method, "Dropping notification with no handler");
                return DispatchOutcome::Unhandled;
            }
        };

        context.request_id = None;
        let result = AssertUnwindSafe(handler.handle(&method, params, context))
            .catch_unwind()
            .await;

        let error = match result {
            Ok(Ok(())) => return DispatchOutcome::Handled,
            Ok(Err(error)) => error,
            Err(panic) => HandlerError::Internal(panic_message(panic.as_ref())),
        };
        warn!(method = %method, error = %error, "Notification handler failed");
        DispatchOutcome::NotificationFailed { method, error }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        format!("handler panicked: {}", s)
    } else if let Some(s) = panic.downcast_ref::<String>() {
        format!("handler panicked: {}", s)
    } else {
        "handler panicked".to_string()
    }
}
