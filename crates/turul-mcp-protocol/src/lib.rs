//! # Model Context Protocol (MCP) vocabulary
//!
//! The protocol-level types the engine negotiates with: supported versions,
//! initialize payloads, capability declarations and the table saying which
//! capability each method depends on. Built on `turul-mcp-json-rpc`.

pub mod capability;
pub mod initialize;
pub mod methods;
pub mod notifications;
pub mod params;
pub mod prelude;
pub mod version;

// Re-export main types
pub use capability::{Capability, Role, required_capability, served_methods};
pub use initialize::{
    ClientCapabilities, CompletionsCapabilities, ElicitationCapabilities, Implementation,
    InitializeRequest, InitializeResult, LoggingCapabilities, PromptsCapabilities,
    ResourcesCapabilities, RootsCapabilities, SamplingCapabilities, ServerCapabilities,
    ToolsCapabilities,
};
pub use notifications::CancelledNotificationParams;
pub use params::{from_params, to_params};
pub use version::McpVersion;

/// The MCP protocol version preferred by this crate
pub const MCP_VERSION: &str = "2025-06-18";

/// Domain error codes, inside the JSON-RPC server error range
pub mod error_codes {
    /// Request arrived before the handshake completed
    pub const NOT_INITIALIZED: i64 = -32002;
    /// The method needs a capability its owner did not declare
    pub const CAPABILITY_NOT_SUPPORTED: i64 = -32003;
    /// The receiving side is shutting down
    pub const SHUTTING_DOWN: i64 = -32004;
}

/// Common result type for MCP operations
pub type McpResult<T> = Result<T, McpError>;

/// MCP-specific errors
#[derive(Debug, thiserror::Error)]
pub enum McpError {
    #[error("Protocol version mismatch: expected {expected}, got {actual}")]
    VersionMismatch { expected: String, actual: String },

    #[error("Invalid parameters: {0}")]
    InvalidParameters(String),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),
}
