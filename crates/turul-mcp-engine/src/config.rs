//! Configuration types for MCP connections

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::time::Duration;
use turul_mcp_protocol::{Implementation, McpVersion};

use crate::error::{EngineError, EngineResult};

/// Connection-level configuration shared by both roles
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct EngineConfig {
    /// Our name and version, sent as clientInfo or serverInfo
    pub implementation: Implementation,

    /// Supported protocol versions, most preferred first
    pub protocol_versions: Vec<McpVersion>,

    /// What a client does when the server offers a version it does not support
    pub version_policy: VersionPolicy,

    /// Usage hints returned to clients (server role only)
    pub instructions: Option<String>,

    /// Timeout configurations
    pub timeouts: TimeoutConfig,

    /// Buffer size of the connection event broadcast channel
    pub event_capacity: usize,
}

/// Client reaction to an unsupported offered protocol version
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum VersionPolicy {
    /// Close the connection and report `VersionMismatch`
    #[default]
    Abort,
    /// Log a warning and carry on with the offered version
    AcceptOffered,
}

/// Timeout configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct TimeoutConfig {
    /// How long a client waits for the initialize result
    #[serde(with = "duration_serde")]
    pub initialization: Duration,

    /// How long shutdown waits for outstanding requests before draining them
    #[serde(with = "duration_serde")]
    pub shutdown_grace: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            implementation: Implementation::new("turul-mcp-engine", env!("CARGO_PKG_VERSION")),
            protocol_versions: McpVersion::all(),
            version_policy: VersionPolicy::default(),
            instructions: None,
            timeouts: TimeoutConfig::default(),
            event_capacity: 256,
        }
    }
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            initialization: Duration::from_secs(15),
            shutdown_grace: Duration::from_secs(5),
        }
    }
}

impl EngineConfig {
    /// Parse and validate a JSON configuration document. Missing fields take
    /// their defaults.
    pub fn from_json_str(json: &str) -> EngineResult<Self> {
        let config: Self = serde_json::from_str(json)
            .map_err(|e| EngineError::config(format!("invalid configuration: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> EngineResult<()> {
        if self.protocol_versions.is_empty() {
            return Err(EngineError::config("protocolVersions must not be empty"));
        }
        let mut seen = HashSet::new();
        for version in &self.protocol_versions {
            if !seen.insert(version) {
                return Err(EngineError::config(format!(
                    "protocol version {} listed more than once",
                    version
                )));
            }
        }
        if self.event_capacity == 0 {
            return Err(EngineError::config("eventCapacity must be greater than zero"));
        }
        if self.timeouts.initialization.is_zero() {
            return Err(EngineError::config("initialization timeout must be greater than zero"));
        }
        Ok(())
    }

    pub fn with_implementation(mut self, implementation: Implementation) -> Self {
        self.implementation = implementation;
        self
    }

    pub fn with_protocol_versions(mut self, versions: Vec<McpVersion>) -> Self {
        self.protocol_versions = versions;
        self
    }

    pub fn with_version_policy(mut self, policy: VersionPolicy) -> Self {
        self.version_policy = policy;
        self
    }

    pub fn with_instructions(mut self, instructions: impl Into<String>) -> Self {
        self.instructions = Some(instructions.into());
        self
    }
}

// Durations travel as integer milliseconds
mod duration_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}
