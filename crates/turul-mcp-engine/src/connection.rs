//! Connection runtime
//!
//! A [`Connection`] owns one transport and drives the MCP lifecycle over it.
//! A single reader task decodes and admission-checks inbound frames in
//! arrival order; request and notification handlers run as their own tasks.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use futures::future::join_all;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::{OnceCell, broadcast, watch};
use tokio::task::{AbortHandle, JoinHandle};
use tracing::{Instrument, debug, error, info, info_span, warn};
use turul_mcp_json_rpc::{
    CodecError, Decoded, DispatchOutcome, HandlerError, JsonRpcDispatcher, JsonRpcErrorObject,
    JsonRpcMessage, JsonRpcNotification, JsonRpcRequest, JsonRpcResponse, MethodHandler, Params,
    RequestId, SessionContext, decode, encode, encode_batch,
};
use turul_mcp_protocol::{
    CancelledNotificationParams, Capability, ClientCapabilities, InitializeRequest,
    InitializeResult, Role, ServerCapabilities, from_params, methods, served_methods, to_params,
};
use uuid::Uuid;

use crate::config::{EngineConfig, VersionPolicy};
use crate::correlation::{CorrelationTable, PendingHandle, ResultWithMetadata};
use crate::error::{EngineError, EngineResult};
use crate::lifecycle::{Direction, MessageKind, Phase, PhaseTransition};
use crate::negotiator::{Negotiator, check_capability};
use crate::state::{ConnectionState, Session};
use crate::transport::{Transport, TransportError, TransportMessage, TransportMetadata};

/// Things worth knowing about that never reach the caller of an operation
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionEvent {
    PhaseChanged { from: Phase, to: Phase },
    /// A response matched no pending request. `None` for null-id error responses.
    Orphan { id: Option<RequestId> },
    /// Malformed inbound frame or batch element
    CodecError { error: CodecError },
    /// Inbound traffic rejected by lifecycle or capability rules
    Violation { method: String, reason: String },
    NotificationFailed { method: String, error: HandlerError },
}

/// Builder for creating MCP connections
pub struct ConnectionBuilder {
    role: Role,
    config: EngineConfig,
    client_capabilities: ClientCapabilities,
    server_capabilities: ServerCapabilities,
    dispatcher: JsonRpcDispatcher,
}

impl ConnectionBuilder {
    /// Client side: sends `initialize` and declares `capabilities`
    pub fn client(config: EngineConfig, capabilities: ClientCapabilities) -> Self {
        Self {
            role: Role::Client,
            config,
            client_capabilities: capabilities,
            server_capabilities: ServerCapabilities::default(),
            dispatcher: JsonRpcDispatcher::new(),
        }
    }

    /// Server side: answers `initialize` with `capabilities`
    pub fn server(config: EngineConfig, capabilities: ServerCapabilities) -> Self {
        Self {
            role: Role::Server,
            config,
            client_capabilities: ClientCapabilities::default(),
            server_capabilities: capabilities,
            dispatcher: JsonRpcDispatcher::new(),
        }
    }

    /// Register a handler for inbound requests or notifications of `method`
    pub fn handler(self, method: impl Into<String>, handler: MethodHandler) -> Self {
        self.dispatcher.register(method, handler);
        self
    }

    /// Build the connection. Nothing is read until [`Connection::start`].
    ///
    /// Every capability this side declares must come with request handlers
    /// for the methods it serves, e.g. a client declaring `sampling` needs a
    /// `sampling/createMessage` handler.
    pub fn build(self, transport: impl Transport + 'static) -> EngineResult<Connection> {
        self.config.validate()?;
        self.check_served_handlers()?;

        let id = Uuid::now_v7().to_string();
        let (events, _) = broadcast::channel(self.config.event_capacity);
        let (closed, _) = watch::channel(false);

        debug!(connection_id = %id, role = %self.role, "Building connection");

        Ok(Connection {
            inner: Arc::new(Inner {
                id,
                role: self.role,
                negotiator: Negotiator::new(self.config.protocol_versions.clone()),
                config: self.config,
                transport: Arc::new(transport),
                dispatcher: self.dispatcher,
                pending: CorrelationTable::new(),
                session: Mutex::new(Session::new(
                    self.role,
                    self.client_capabilities,
                    self.server_capabilities,
                )),
                in_flight: Mutex::new(HashMap::new()),
                events,
                closed,
                handshake: OnceCell::new(),
                started: AtomicBool::new(false),
            }),
        })
    }

    fn check_served_handlers(&self) -> EngineResult<()> {
        let declared = Capability::ALL.into_iter().filter(|capability| {
            capability.declared_by() == self.role
                && capability.is_declared(&self.client_capabilities, &self.server_capabilities)
        });
        for capability in declared {
            for method in served_methods(capability) {
                if !matches!(self.dispatcher.handler(method), Some(MethodHandler::Request(_))) {
                    return Err(EngineError::config(format!(
                        "{} capability declared without a request handler for '{}'",
                        capability, method
                    )));
                }
            }
        }
        Ok(())
    }
}

/// One MCP session over one transport. Cheap to clone.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<Inner>,
}

struct Inner {
    id: String,
    role: Role,
    config: EngineConfig,
    transport: Arc<dyn Transport>,
    dispatcher: JsonRpcDispatcher,
    negotiator: Negotiator,
    pending: CorrelationTable,
    session: Mutex<Session>,
    /// Abort handles of inbound requests whose handlers are still running
    in_flight: Mutex<HashMap<RequestId, AbortHandle>>,
    events: broadcast::Sender<ConnectionEvent>,
    closed: watch::Sender<bool>,
    handshake: OnceCell<InitializeResult>,
    started: AtomicBool,
}

/// What one inbound message contributes to the reply frame
enum Reply {
    Silent,
    Ready(JsonRpcResponse),
    Pending(JoinHandle<JsonRpcResponse>),
}

impl Connection {
    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn role(&self) -> Role {
        self.inner.role
    }

    /// Spawn the reader task. Calling it again is a no-op.
    pub fn start(&self) {
        if self.inner.started.swap(true, Ordering::SeqCst) {
            debug!(connection_id = %self.inner.id, "Connection already started");
            return;
        }

        let span = info_span!(
            "mcp_connection",
            connection_id = %self.inner.id,
            role = %self.inner.role
        );
        let inner = self.inner.clone();
        tokio::spawn(async move { inner.read_loop().await }.instrument(span));
    }

    /// Perform the client side of the handshake.
    ///
    /// Concurrent and repeated calls share the one handshake. Any failure
    /// closes the connection.
    pub async fn initialize(&self) -> EngineResult<InitializeResult> {
        if self.inner.role != Role::Client {
            return Err(EngineError::violation("only a client sends initialize"));
        }
        self.start();
        self.inner
            .handshake
            .get_or_try_init(|| self.inner.perform_handshake())
            .await
            .cloned()
    }

    /// Send a request and wait for its outcome
    pub async fn request(&self, method: &str, params: Option<Params>) -> EngineResult<Params> {
        self.send_request(method, params).await?.wait().await
    }

    /// Send a request with transport metadata attached to its frame. The
    /// result comes back with the metadata of the response frame; an error
    /// response carries it in [`EngineError::Remote`].
    pub async fn request_with_metadata(
        &self,
        method: &str,
        params: Option<Params>,
        metadata: Option<TransportMetadata>,
    ) -> EngineResult<ResultWithMetadata> {
        self.send_request_with_metadata(method, params, metadata)
            .await?
            .wait_with_metadata()
            .await
    }

    /// Like [`Connection::request`], but gives up after `timeout`. The request
    /// is cancelled and the peer told so; a late response is an orphan.
    pub async fn request_with_timeout(
        &self,
        method: &str,
        params: Option<Params>,
        timeout: Duration,
    ) -> EngineResult<Params> {
        let mut handle = self.send_request(method, params).await?;
        let id = handle.id().clone();

        // The handle outlives the timeout so the entry is still there to cancel
        match tokio::time::timeout(timeout, handle.recv()).await {
            Ok(outcome) => outcome.map(|(result, _)| result),
            Err(_) => {
                warn!(
                    connection_id = %self.inner.id,
                    method = %method,
                    request_id = %id,
                    "Request timed out after {:?}",
                    timeout
                );
                if self.inner.pending.cancel(&id).is_some() {
                    let reason = format!("Request timed out after {:?}", timeout);
                    if let Err(e) = self.inner.send_cancelled(&id, reason).await {
                        debug!(request_id = %id, error = %e, "Could not notify peer of cancellation");
                    }
                }
                Err(EngineError::Timeout(timeout))
            }
        }
    }

    /// Send a request and return the handle to await its response on
    pub async fn send_request(&self, method: &str, params: Option<Params>) -> EngineResult<PendingHandle> {
        self.send_request_with_metadata(method, params, None).await
    }

    pub async fn send_request_with_metadata(
        &self,
        method: &str,
        params: Option<Params>,
        metadata: Option<TransportMetadata>,
    ) -> EngineResult<PendingHandle> {
        reject_reserved(method)?;
        self.inner.start_request(method, params, metadata).await
    }

    pub async fn notify(&self, method: &str, params: Option<Params>) -> EngineResult<()> {
        reject_reserved(method)?;
        self.inner.send_notification(method, params).await
    }

    /// Cancel an outstanding request. The waiting caller gets `Cancelled` and
    /// the peer receives `notifications/cancelled`. Returns false if nothing
    /// was pending under `id`.
    pub async fn cancel(&self, id: &RequestId) -> bool {
        if self.inner.pending.cancel(id).is_none() {
            return false;
        }
        if let Err(e) = self
            .inner
            .send_cancelled(id, "Cancelled by caller".to_string())
            .await
        {
            debug!(request_id = %id, error = %e, "Could not notify peer of cancellation");
        }
        true
    }

    pub async fn ping(&self) -> EngineResult<()> {
        self.request(methods::PING, None).await.map(|_| ())
    }

    /// Register or replace a handler while the connection is running.
    /// `initialize` and `ping` are answered by the connection itself.
    pub fn register(&self, method: impl Into<String>, handler: MethodHandler) -> Option<MethodHandler> {
        self.inner.dispatcher.register(method, handler)
    }

    /// Graceful close: stop admitting requests, give outstanding ones up to
    /// the configured grace period, then fail the rest and close the transport.
    pub async fn shutdown(&self) -> EngineResult<()> {
        let transition = self.inner.session.lock().lifecycle.begin_shutdown();

        if let Some(transition) = transition {
            self.inner.emit_transition(transition);
            info!(connection_id = %self.inner.id, "Shutting down connection");

            let grace = self.inner.config.timeouts.shutdown_grace;
            if tokio::time::timeout(grace, self.inner.pending.wait_idle())
                .await
                .is_err()
            {
                warn!(
                    connection_id = %self.inner.id,
                    pending = self.inner.pending.len(),
                    "Shutdown grace period expired with requests outstanding"
                );
            }
        }

        self.inner.teardown().await.map_err(EngineError::from)
    }

    pub fn phase(&self) -> Phase {
        self.inner.session.lock().lifecycle.phase()
    }

    /// Every phase entered so far, in order
    pub fn phase_history(&self) -> Vec<Phase> {
        self.inner.session.lock().lifecycle.history().to_vec()
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.session.lock().snapshot(&self.inner.id)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.inner.events.subscribe()
    }

    /// Resolves once the connection has closed, for whatever reason
    pub async fn closed(&self) {
        let mut closed = self.inner.closed.subscribe();
        let _ = closed.wait_for(|closed| *closed).await;
    }

    pub fn is_closed(&self) -> bool {
        *self.inner.closed.borrow()
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.inner.id)
            .field("role", &self.inner.role)
            .field("phase", &self.phase())
            .finish()
    }
}

/// The handshake messages are driven by the connection, never by callers
fn reject_reserved(method: &str) -> EngineResult<()> {
    match method {
        methods::INITIALIZE | methods::notifications::INITIALIZED => Err(EngineError::violation(
            format!("{} is sent by the connection itself", method),
        )),
        _ => Ok(()),
    }
}

impl Inner {
    async fn read_loop(self: Arc<Self>) {
        debug!("Reader started");
        loop {
            match self.transport.receive().await {
                Ok(Some(message)) => self.handle_frame(message).await,
                Ok(None) => {
                    debug!("Transport closed");
                    break;
                }
                Err(e) => {
                    error!(error = %e, "Transport receive failed");
                    break;
                }
            }
        }
        if let Err(e) = self.teardown().await {
            debug!(error = %e, "Transport close failed during teardown");
        }
    }

    async fn handle_frame(self: &Arc<Self>, message: TransportMessage) {
        let TransportMessage { payload, metadata } = message;
        let replies = match decode(payload) {
            Ok(Decoded::Message(message)) => vec![self.route(message, metadata.as_ref())],
            Ok(Decoded::Batch(elements)) => {
                let admitted = self.session.lock().lifecycle.admit_batch();
                let replies = match admitted {
                    Ok(()) => elements
                        .into_iter()
                        .map(|element| match element {
                            Ok(message) => self.route(message, metadata.as_ref()),
                            Err(error) => self.reply_to_codec_error(error),
                        })
                        .collect(),
                    Err(error) => self.reject_batch(elements, error),
                };
                self.deliver(replies, true, metadata).await;
                return;
            }
            Err(error) => vec![self.reply_to_codec_error(error)],
        };
        self.deliver(replies, false, metadata).await;
    }

    fn route(
        self: &Arc<Self>,
        message: JsonRpcMessage,
        metadata: Option<&TransportMetadata>,
    ) -> Reply {
        match message {
            JsonRpcMessage::Request(request) => self.route_request(request, metadata),
            JsonRpcMessage::Notification(notification) => {
                self.route_notification(notification);
                Reply::Silent
            }
            JsonRpcMessage::Response(response) => {
                self.route_response(response, metadata.cloned());
                Reply::Silent
            }
        }
    }

    fn route_request(
        self: &Arc<Self>,
        request: JsonRpcRequest,
        metadata: Option<&TransportMetadata>,
    ) -> Reply {
        if self.in_flight.lock().contains_key(&request.id) {
            let error = JsonRpcErrorObject::invalid_request(Some(format!(
                "Request id {} is already in flight",
                request.id
            )));
            warn!(request_id = %request.id, method = %request.method, "Duplicate inbound request id");
            return Reply::Ready(JsonRpcResponse::error(request.id, error));
        }

        if request.method == methods::INITIALIZE {
            return self.answer_initialize(request);
        }

        let admitted = {
            let session = self.session.lock();
            session
                .lifecycle
                .admit(Direction::Inbound, MessageKind::Request, &request.method)
                .and_then(|_| {
                    check_capability(
                        self.role.peer(),
                        MessageKind::Request,
                        &request.method,
                        &session.client_capabilities,
                        &session.server_capabilities,
                    )
                })
        };

        match admitted {
            Err(error) => self.reject(request.id, &request.method, error),
            Ok(()) if request.method == methods::PING => {
                Reply::Ready(JsonRpcResponse::empty(request.id))
            }
            Ok(()) => Reply::Pending(self.spawn_request(request, metadata)),
        }
    }

    /// Server side of the handshake, answered inline so the phase change is
    /// visible before the next frame is read
    fn answer_initialize(&self, request: JsonRpcRequest) -> Reply {
        let JsonRpcRequest {
            id,
            method,
            params,
            ..
        } = request;

        let admitted = self
            .session
            .lock()
            .lifecycle
            .admit(Direction::Inbound, MessageKind::Request, &method);
        if let Err(error) = admitted {
            return self.reject(id, &method, error);
        }

        let init: InitializeRequest = match from_params(params) {
            Ok(init) => init,
            Err(e) => {
                warn!(request_id = %id, error = %e, "Invalid initialize parameters");
                return Reply::Ready(JsonRpcResponse::error(
                    id,
                    JsonRpcErrorObject::invalid_params(&e.to_string()),
                ));
            }
        };

        let (result, transition) = {
            let mut session = self.session.lock();
            let transition = match session.lifecycle.advance(Phase::Initializing) {
                Ok(transition) => transition,
                Err(error) => {
                    drop(session);
                    return self.reject(id, &method, error);
                }
            };
            let result = self.negotiator.respond(
                &init,
                session.server_capabilities.clone(),
                self.config.implementation.clone(),
                self.config.instructions.clone(),
            );
            session.apply_request(&init);
            session.apply_result(&result);
            // Cannot fail: the phase was entered just above
            let _ = session.lifecycle.record_initialize_response();
            (result, transition)
        };
        self.emit_transition(transition);

        info!(
            client = %init.client_info.name,
            requested = %init.protocol_version,
            protocol_version = %result.protocol_version,
            "Client initializing"
        );

        match to_params(&result) {
            Ok(result) => Reply::Ready(JsonRpcResponse::success(id, result)),
            Err(e) => Reply::Ready(JsonRpcResponse::error(
                id,
                JsonRpcErrorObject::internal_error(Some(e.to_string())),
            )),
        }
    }

    fn route_notification(self: &Arc<Self>, notification: JsonRpcNotification) {
        let admitted = {
            let mut session = self.session.lock();
            session
                .lifecycle
                .admit(Direction::Inbound, MessageKind::Notification, &notification.method)
                .and_then(|next| {
                    check_capability(
                        self.role.peer(),
                        MessageKind::Notification,
                        &notification.method,
                        &session.client_capabilities,
                        &session.server_capabilities,
                    )?;
                    next.map(|phase| session.lifecycle.advance(phase)).transpose()
                })
        };

        match admitted {
            Err(error) => {
                warn!(method = %notification.method, error = %error, "Dropping inbound notification");
                self.emit(ConnectionEvent::Violation {
                    method: notification.method,
                    reason: error.to_string(),
                });
                return;
            }
            Ok(Some(transition)) => {
                self.emit_transition(transition);
                info!("Connection operational");
            }
            Ok(None) => {}
        }

        if notification.method == methods::notifications::CANCELLED {
            self.cancel_in_flight(notification.params.clone());
        }
        self.spawn_notification(notification);
    }

    fn route_response(&self, response: JsonRpcResponse, metadata: Option<TransportMetadata>) {
        let JsonRpcResponse { id, outcome, .. } = response;
        let Some(id) = id else {
            warn!(error = ?outcome.err(), "Peer reported an error it could not attribute to a request");
            self.emit(ConnectionEvent::Orphan { id: None });
            return;
        };

        if let Err(error) = self.pending.resolve(&id, outcome, metadata) {
            warn!(request_id = %id, error = %error, "Orphan response");
            self.emit(ConnectionEvent::Orphan { id: Some(id) });
        }
    }

    fn cancel_in_flight(&self, params: Option<Params>) {
        let cancel: CancelledNotificationParams = match from_params(params) {
            Ok(cancel) => cancel,
            Err(e) => {
                warn!(error = %e, "Invalid cancellation parameters");
                return;
            }
        };

        match self.in_flight.lock().remove(&cancel.request_id) {
            Some(handle) => {
                handle.abort();
                info!(
                    request_id = %cancel.request_id,
                    reason = cancel.reason.as_deref().unwrap_or("none"),
                    "Cancelled in-flight request"
                );
            }
            None => debug!(request_id = %cancel.request_id, "Cancellation for unknown or finished request"),
        }
    }

    fn spawn_request(
        self: &Arc<Self>,
        request: JsonRpcRequest,
        metadata: Option<&TransportMetadata>,
    ) -> JoinHandle<JsonRpcResponse> {
        let inner = self.clone();
        let id = request.id.clone();
        let context = match metadata {
            Some(metadata) => self
                .context()
                .with_metadata("transport", Value::Object(metadata.clone())),
            None => self.context(),
        };

        // Registered under the lock the task removes itself with
        let mut in_flight = self.in_flight.lock();
        let task_id = id.clone();
        let handle = tokio::spawn(
            async move {
                let response = inner.dispatcher.dispatch_request(request, context).await;
                inner.in_flight.lock().remove(&task_id);
                response
            }
            .in_current_span(),
        );
        in_flight.insert(id, handle.abort_handle());
        handle
    }

    fn spawn_notification(self: &Arc<Self>, notification: JsonRpcNotification) {
        let inner = self.clone();
        let context = self.context();
        tokio::spawn(
            async move {
                let outcome = inner
                    .dispatcher
                    .dispatch_notification(notification, context)
                    .await;
                if let DispatchOutcome::NotificationFailed { method, error } = outcome {
                    inner.emit(ConnectionEvent::NotificationFailed { method, error });
                }
            }
            .in_current_span(),
        );
    }

    fn reject(&self, id: RequestId, method: &str, error: EngineError) -> Reply {
        warn!(request_id = %id, method = %method, error = %error, "Rejecting inbound request");
        self.emit(ConnectionEvent::Violation {
            method: method.to_string(),
            reason: error.to_string(),
        });
        Reply::Ready(JsonRpcResponse::error(id, error.to_error_object()))
    }

    /// A batch arriving before the handshake completed: every request in it
    /// gets the same error, everything else is dropped
    fn reject_batch(
        &self,
        elements: Vec<Result<JsonRpcMessage, CodecError>>,
        error: EngineError,
    ) -> Vec<Reply> {
        warn!(error = %error, size = elements.len(), "Rejecting batch");
        self.emit(ConnectionEvent::Violation {
            method: "batch".to_string(),
            reason: error.to_string(),
        });
        let error = error.to_error_object();
        elements
            .into_iter()
            .map(|element| match element {
                Ok(JsonRpcMessage::Request(request)) => {
                    Reply::Ready(JsonRpcResponse::error(request.id, error.clone()))
                }
                Ok(_) => Reply::Silent,
                Err(codec_error) => self.reply_to_codec_error(codec_error),
            })
            .collect()
    }

    /// Malformed input is answered when it carried a request id, or when the
    /// whole frame was an empty batch. Anything else is only reported.
    fn reply_to_codec_error(&self, error: CodecError) -> Reply {
        warn!(error = %error, "Malformed inbound message");
        let answerable =
            error.request_id().is_some() || matches!(error, CodecError::EmptyBatch);
        let reply = if answerable {
            Reply::Ready(JsonRpcResponse::from_codec_error(&error))
        } else {
            Reply::Silent
        };
        self.emit(ConnectionEvent::CodecError { error });
        reply
    }

    /// Send whatever the frame produced. Handlers still running are awaited
    /// off the reader task.
    async fn deliver(
        self: &Arc<Self>,
        replies: Vec<Reply>,
        batch: bool,
        metadata: Option<TransportMetadata>,
    ) {
        let waiting = replies.iter().any(|reply| matches!(reply, Reply::Pending(_)));
        if !waiting {
            let responses = replies
                .into_iter()
                .filter_map(|reply| match reply {
                    Reply::Ready(response) => Some(response),
                    _ => None,
                })
                .collect();
            self.send_responses(responses, batch, metadata).await;
            return;
        }

        let inner = self.clone();
        tokio::spawn(
            async move {
                let responses = join_all(replies.into_iter().map(|reply| async move {
                    match reply {
                        Reply::Silent => None,
                        Reply::Ready(response) => Some(response),
                        // Aborted by cancellation or teardown: nothing to send
                        Reply::Pending(handle) => handle.await.ok(),
                    }
                }))
                .await
                .into_iter()
                .flatten()
                .collect();
                inner.send_responses(responses, batch, metadata).await;
            }
            .in_current_span(),
        );
    }

    /// Replies go out with the metadata of the frame they answer
    async fn send_responses(
        &self,
        responses: Vec<JsonRpcResponse>,
        batch: bool,
        metadata: Option<TransportMetadata>,
    ) {
        let messages: Vec<JsonRpcMessage> =
            responses.into_iter().map(JsonRpcMessage::Response).collect();
        let encoded = match messages.as_slice() {
            [] => return,
            [single] if !batch => encode(single),
            many => encode_batch(many),
        };
        let payload = match encoded {
            Ok(payload) => payload,
            Err(e) => {
                error!(error = %e, "Failed to encode response");
                return;
            }
        };
        if let Err(e) = self.transport.send(TransportMessage { payload, metadata }).await {
            warn!(error = %e, "Failed to send response");
        }
    }

    async fn start_request(
        &self,
        method: &str,
        params: Option<Params>,
        metadata: Option<TransportMetadata>,
    ) -> EngineResult<PendingHandle> {
        let (id, handle, transition) = {
            let mut session = self.session.lock();
            let next = session
                .lifecycle
                .admit(Direction::Outbound, MessageKind::Request, method)?;
            check_capability(
                self.role,
                MessageKind::Request,
                method,
                &session.client_capabilities,
                &session.server_capabilities,
            )?;
            // Registered before sending so the response cannot outrun it
            let id = self.pending.next_id();
            let handle = self.pending.register(id.clone(), method)?;
            let transition = match next {
                Some(phase) => Some(session.lifecycle.advance(phase)?),
                None => None,
            };
            (id, handle, transition)
        };
        if let Some(transition) = transition {
            self.emit_transition(transition);
        }

        debug!(connection_id = %self.id, method = %method, request_id = %id, "Sending request");
        let request = JsonRpcRequest::new(id.clone(), method, params);
        let sent = match encode(&request.into()) {
            Ok(payload) => self
                .transport
                .send(TransportMessage { payload, metadata })
                .await
                .map_err(EngineError::from),
            Err(e) => Err(e.into()),
        };
        if let Err(e) = sent {
            self.pending.cancel(&id);
            return Err(e);
        }
        Ok(handle)
    }

    async fn send_notification(&self, method: &str, params: Option<Params>) -> EngineResult<()> {
        {
            let session = self.session.lock();
            session
                .lifecycle
                .admit(Direction::Outbound, MessageKind::Notification, method)?;
            check_capability(
                self.role,
                MessageKind::Notification,
                method,
                &session.client_capabilities,
                &session.server_capabilities,
            )?;
        }

        debug!(connection_id = %self.id, method = %method, "Sending notification");
        let notification = JsonRpcNotification::new(method, params);
        self.transport
            .send(encode(&notification.into())?.into())
            .await?;
        Ok(())
    }

    async fn send_cancelled(&self, id: &RequestId, reason: String) -> EngineResult<()> {
        let params = to_params(&CancelledNotificationParams::new(id.clone()).with_reason(reason))?;
        self.send_notification(methods::notifications::CANCELLED, Some(params))
            .await
    }

    async fn perform_handshake(&self) -> EngineResult<InitializeResult> {
        let timeout = self.config.timeouts.initialization;
        let outcome = match tokio::time::timeout(timeout, self.handshake_steps()).await {
            Ok(outcome) => outcome,
            Err(_) => Err(EngineError::Timeout(timeout)),
        };

        if let Err(error) = &outcome {
            error!(connection_id = %self.id, error = %error, "Initialization failed");
            if let Err(e) = self.teardown().await {
                debug!(error = %e, "Transport close failed during teardown");
            }
        }
        outcome
    }

    async fn handshake_steps(&self) -> EngineResult<InitializeResult> {
        let requested = self.negotiator.preferred();
        info!(connection_id = %self.id, protocol_version = %requested, "Initializing MCP session");

        let request = {
            let session = self.session.lock();
            InitializeRequest::new(
                requested,
                session.client_capabilities.clone(),
                self.config.implementation.clone(),
            )
        };
        let handle = self
            .start_request(methods::INITIALIZE, Some(to_params(&request)?), None)
            .await?;
        let result: InitializeResult = from_params(Some(handle.wait().await?))?;

        if self.negotiator.evaluate_offer(&result.protocol_version).is_none() {
            match self.config.version_policy {
                VersionPolicy::Abort => {
                    return Err(EngineError::VersionMismatch {
                        requested: requested.to_string(),
                        offered: result.protocol_version.clone(),
                    });
                }
                VersionPolicy::AcceptOffered => {
                    warn!(
                        connection_id = %self.id,
                        requested = %requested,
                        offered = %result.protocol_version,
                        "Continuing with unsupported protocol version offered by server"
                    );
                }
            }
        }

        let transition = {
            let mut session = self.session.lock();
            session.lifecycle.record_initialize_response()?;
            session.apply_result(&result);
            let next = session.lifecycle.admit(
                Direction::Outbound,
                MessageKind::Notification,
                methods::notifications::INITIALIZED,
            )?;
            // Operational before the notification leaves, so requests the
            // server sends in response are admitted
            match next {
                Some(phase) => Some(session.lifecycle.advance(phase)?),
                None => None,
            }
        };
        if let Some(transition) = transition {
            self.emit_transition(transition);
        }

        let initialized = JsonRpcNotification::new_no_params(methods::notifications::INITIALIZED);
        self.transport
            .send(encode(&initialized.into())?.into())
            .await?;

        info!(
            connection_id = %self.id,
            server = %result.server_info.name,
            protocol_version = %result.protocol_version,
            "MCP session initialized successfully"
        );
        Ok(result)
    }

    /// Close everything. Safe to call any number of times from any task.
    async fn teardown(&self) -> Result<(), TransportError> {
        let transition = self.session.lock().lifecycle.close();
        let Some(transition) = transition else {
            return Ok(());
        };
        self.emit_transition(transition);

        let drained = self.pending.drain_on_shutdown();
        if !drained.is_empty() {
            warn!(
                connection_id = %self.id,
                count = drained.len(),
                "Failing outstanding requests on close"
            );
        }

        let result = self.transport.close().await;
        self.closed.send_replace(true);

        // Last, since the caller may itself be one of these tasks
        let in_flight: Vec<AbortHandle> = self.in_flight.lock().drain().map(|(_, h)| h).collect();
        for handle in in_flight {
            handle.abort();
        }

        info!(connection_id = %self.id, "Connection closed");
        result
    }

    fn context(&self) -> SessionContext {
        let context = SessionContext::new(self.id.clone());
        match self.session.lock().protocol_version.clone() {
            Some(version) => context.with_metadata("protocolVersion", Value::String(version)),
            None => context,
        }
    }

    fn emit_transition(&self, transition: PhaseTransition) {
        self.emit(ConnectionEvent::PhaseChanged {
            from: transition.from,
            to: transition.to,
        });
    }

    fn emit(&self, event: ConnectionEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }
}
