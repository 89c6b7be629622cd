//! # MCP Engine Prelude
//!
//! Convenient re-exports of the most commonly used types and traits.
//!
//! ```rust
//! use turul_mcp_engine::prelude::*;
//! ```

// Core engine types
pub use crate::config::{EngineConfig, TimeoutConfig, VersionPolicy};
pub use crate::connection::{Connection, ConnectionBuilder, ConnectionEvent};
pub use crate::correlation::{PendingHandle, ResultWithMetadata};
pub use crate::error::{EngineError, EngineResult};
pub use crate::lifecycle::Phase;
pub use crate::state::ConnectionState;

// Transport types
pub use crate::transport::{
    MemoryTransport, Transport, TransportError, TransportMessage, TransportMetadata,
};

// Lower layers
pub use turul_mcp_json_rpc::prelude::*;
pub use turul_mcp_protocol::prelude::*;

// Standard library types commonly used with MCP
pub use std::time::Duration;
