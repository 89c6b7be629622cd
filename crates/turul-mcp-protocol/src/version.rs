//! MCP Protocol Version Support
//!
//! ## Version History
//! - **2024-11-05**: Initial MCP specification
//! - **2025-03-26**: Tool annotations, completions capability
//! - **2025-06-18**: Elicitation, structured `_meta` fields

use serde::{Deserialize, Serialize};

/// Supported MCP protocol versions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum McpVersion {
    #[serde(rename = "2024-11-05")]
    V2024_11_05,
    #[serde(rename = "2025-03-26")]
    V2025_03_26,
    #[serde(rename = "2025-06-18")]
    V2025_06_18,
}

impl McpVersion {
    /// Parse a version string like "2024-11-05", "2025-03-26", or "2025-06-18"
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "2024-11-05" => Some(McpVersion::V2024_11_05),
            "2025-03-26" => Some(McpVersion::V2025_03_26),
            "2025-06-18" => Some(McpVersion::V2025_06_18),
            _ => None,
        }
    }

    /// Convert this version to its string representation
    pub fn as_str(&self) -> &'static str {
        match self {
            McpVersion::V2024_11_05 => "2024-11-05",
            McpVersion::V2025_03_26 => "2025-03-26",
            McpVersion::V2025_06_18 => "2025-06-18",
        }
    }

    /// Every known version, most preferred first
    pub fn all() -> Vec<McpVersion> {
        vec![
            McpVersion::V2025_06_18,
            McpVersion::V2025_03_26,
            McpVersion::V2024_11_05,
        ]
    }

    /// The latest protocol version implemented by this crate
    pub const LATEST: McpVersion = McpVersion::V2025_06_18;
}

impl std::fmt::Display for McpVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for McpVersion {
    type Err = crate::McpError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        McpVersion::from_str(s).ok_or_else(|| crate::McpError::VersionMismatch {
            expected: Self::LATEST.as_str().to_string(),
            actual: s.to_string(),
        })
    }
}

impl Default for McpVersion {
    fn default() -> Self {
        Self::LATEST
    }
}
