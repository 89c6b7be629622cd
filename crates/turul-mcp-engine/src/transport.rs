//! Transport boundary
//!
//! The engine exchanges already-framed JSON values: a single message object or
//! a batch array. Byte framing (stdio lines, HTTP bodies, websocket frames)
//! belongs to the transport implementation.
//!
//! Each frame may carry transport metadata, such as HTTP headers or a session
//! id. The engine never interprets it: inbound metadata is handed to handlers
//! and to the caller awaiting a response, and echoed on the replies to an
//! inbound request.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{Map, Value};
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tracing::debug;

/// Transport-specific errors
#[derive(Error, Debug, Clone, PartialEq)]
pub enum TransportError {
    #[error("Transport closed")]
    Closed,

    #[error("Send failed: {0}")]
    SendFailed(String),

    #[error("Receive failed: {0}")]
    ReceiveFailed(String),
}

/// Opaque per-frame data owned by the transport
pub type TransportMetadata = Map<String, Value>;

/// One frame plus whatever the transport attached to it
#[derive(Debug, Clone, PartialEq)]
pub struct TransportMessage {
    pub payload: Value,
    pub metadata: Option<TransportMetadata>,
}

impl TransportMessage {
    pub fn new(payload: Value) -> Self {
        Self {
            payload,
            metadata: None,
        }
    }

    pub fn with_metadata(mut self, metadata: TransportMetadata) -> Self {
        self.metadata = Some(metadata);
        self
    }
}

impl From<Value> for TransportMessage {
    fn from(payload: Value) -> Self {
        Self::new(payload)
    }
}

/// A bidirectional channel of JSON frames
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send one frame
    async fn send(&self, message: TransportMessage) -> Result<(), TransportError>;

    /// Next inbound frame, or `None` once the channel is closed.
    /// Only the connection's reader task calls this.
    async fn receive(&self) -> Result<Option<TransportMessage>, TransportError>;

    /// Close the channel. Pending and future `receive` calls return `None`.
    async fn close(&self) -> Result<(), TransportError>;
}

/// In-process duplex transport
pub struct MemoryTransport {
    outbound: Mutex<Option<mpsc::UnboundedSender<TransportMessage>>>,
    inbound: tokio::sync::Mutex<mpsc::UnboundedReceiver<TransportMessage>>,
    closed: watch::Sender<bool>,
}

impl MemoryTransport {
    /// Two connected ends: frames sent on one are received on the other
    pub fn pair() -> (MemoryTransport, MemoryTransport) {
        let (a_tx, a_rx) = mpsc::unbounded_channel();
        let (b_tx, b_rx) = mpsc::unbounded_channel();
        (Self::new(a_tx, b_rx), Self::new(b_tx, a_rx))
    }

    fn new(outbound: mpsc::UnboundedSender<TransportMessage>, inbound: mpsc::UnboundedReceiver<TransportMessage>) -> Self {
        let (closed, _) = watch::channel(false);
        Self {
            outbound: Mutex::new(Some(outbound)),
            inbound: tokio::sync::Mutex::new(inbound),
            closed,
        }
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn send(&self, message: TransportMessage) -> Result<(), TransportError> {
        let guard = self.outbound.lock();
        let sender = guard.as_ref().ok_or(TransportError::Closed)?;
        sender.send(message).map_err(|_| TransportError::Closed)
    }

    async fn receive(&self) -> Result<Option<TransportMessage>, TransportError> {
        let mut closed = self.closed.subscribe();
        if *closed.borrow_and_update() {
            return Ok(None);
        }
        let mut inbound = self.inbound.lock().await;
        tokio::select! {
            message = inbound.recv() => Ok(message),
            _ = closed.wait_for(|c| *c) => Ok(None),
        }
    }

    async fn close(&self) -> Result<(), TransportError> {
        // Dropping the sender ends the peer's stream
        if self.outbound.lock().take().is_some() {
            debug!("Memory transport closed");
        }
        self.closed.send_replace(true);
        Ok(())
    }
}
