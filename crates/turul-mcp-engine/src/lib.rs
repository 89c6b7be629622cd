//! # MCP Connection Engine
//!
//! A transport-agnostic engine for Model Context Protocol sessions. It owns
//! everything between "a JSON frame arrived" and "a handler produced a
//! result": lifecycle, version negotiation, capability gating, request
//! correlation and dispatch. The same engine serves the client and the
//! server role.
//!
//! ## Features
//!
//! - **Handshake**: `initialize` / `notifications/initialized` with version negotiation
//! - **Capability gating**: traffic checked against both sides' declarations
//! - **Correlation**: concurrent outbound requests, cancellation and timeouts
//! - **Batches**: element-wise validation, responses sent as one array
//! - **Transports**: anything implementing [`Transport`]; [`MemoryTransport`] in-process,
//!   with per-frame transport metadata passed through untouched
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use serde_json::json;
//! use turul_mcp_engine::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let (client_end, server_end) = MemoryTransport::pair();
//!
//!     let server = ConnectionBuilder::server(
//!         EngineConfig::default(),
//!         ServerCapabilities::default().with_tools(false),
//!     )
//!     .handler(
//!         "tools/list",
//!         request_fn(|_params, _ctx| async move {
//!             Ok(json!({"tools": []}).as_object().cloned().unwrap_or_default())
//!         }),
//!     )
//!     .handler(
//!         "tools/call",
//!         request_fn(|params, _ctx| async move { Ok(params.unwrap_or_default()) }),
//!     )
//!     .build(server_end)?;
//!     server.start();
//!
//!     let client = ConnectionBuilder::client(EngineConfig::default(), ClientCapabilities::default())
//!         .build(client_end)?;
//!     let result = client.initialize().await?;
//!     println!("Connected to {}", result.server_info.name);
//!
//!     let tools = client.request("tools/list", None).await?;
//!     println!("Tools: {:?}", tools);
//!
//!     client.shutdown().await?;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod connection;
pub mod correlation;
pub mod error;
pub mod lifecycle;
pub mod negotiator;
pub mod prelude;
pub mod state;
pub mod transport;

// Re-export main types
pub use config::{EngineConfig, TimeoutConfig, VersionPolicy};
pub use connection::{Connection, ConnectionBuilder, ConnectionEvent};
pub use correlation::{CorrelationTable, PendingEntry, PendingHandle, ResultWithMetadata};
pub use error::{EngineError, EngineResult};
pub use lifecycle::{Direction, Lifecycle, MessageKind, Phase, PhaseTransition};
pub use negotiator::{Negotiator, check_capability};
pub use state::ConnectionState;
pub use transport::{
    MemoryTransport, Transport, TransportError, TransportMessage, TransportMetadata,
};

// Re-export the layers below for convenience
pub use turul_mcp_json_rpc as json_rpc;
pub use turul_mcp_protocol as protocol;
