//! Common imports for code speaking MCP
//!
//! ```rust
//! use turul_mcp_protocol::prelude::*;
//! ```

pub use crate::capability::{Capability, Role, required_capability, served_methods};
pub use crate::initialize::{
    ClientCapabilities, Implementation, InitializeRequest, InitializeResult, ServerCapabilities,
};
pub use crate::methods;
pub use crate::notifications::CancelledNotificationParams;
pub use crate::params::{from_params, to_params};
pub use crate::version::McpVersion;
pub use crate::{McpError, McpResult};
