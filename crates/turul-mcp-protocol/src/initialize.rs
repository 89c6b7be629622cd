//! MCP Initialize Protocol Types
//!
//! Types exchanged during the initialization handshake. Every capability
//! object keeps unknown members in a flattened `extra` map so declarations
//! from newer peers survive a round trip unchanged.

use crate::version::McpVersion;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Describes the name and version of an MCP implementation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Implementation {
    /// Machine-readable name
    pub name: String,
    /// Version string (e.g., "1.0.0")
    pub version: String,
    /// Optional human-friendly display title
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
}

impl Implementation {
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
            title: None,
        }
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }
}

/// Capabilities related to root listing support
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct RootsCapabilities {
    /// Whether the client supports notifications for root list changes
    #[serde(skip_serializing_if = "Option::is_none")]
    pub list_changed: Option<bool>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Capabilities related to sampling support
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct SamplingCapabilities {
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Capabilities related to elicitation support
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct ElicitationCapabilities {
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Capabilities that a client may support
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct ClientCapabilities {
    /// Root directory capabilities
    #[serde(skip_serializing_if = "Option::is_none")]
    pub roots: Option<RootsCapabilities>,
    /// Sampling capabilities
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sampling: Option<SamplingCapabilities>,
    /// Elicitation capabilities
    #[serde(skip_serializing_if = "Option::is_none")]
    pub elicitation: Option<ElicitationCapabilities>,
    /// Experimental capabilities
    #[serde(skip_serializing_if = "Option::is_none")]
    pub experimental: Option<Map<String, Value>>,
    /// Capabilities this crate does not model
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl ClientCapabilities {
    pub fn with_roots(mut self, list_changed: bool) -> Self {
        self.roots = Some(RootsCapabilities {
            list_changed: Some(list_changed),
            ..Default::default()
        });
        self
    }

    pub fn with_sampling(mut self) -> Self {
        self.sampling = Some(SamplingCapabilities::default());
        self
    }

    pub fn with_elicitation(mut self) -> Self {
        self.elicitation = Some(ElicitationCapabilities::default());
        self
    }
}

/// Capabilities for prompts provided by the server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct PromptsCapabilities {
    /// Whether the server supports prompt list change notifications
    #[serde(skip_serializing_if = "Option::is_none")]
    pub list_changed: Option<bool>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Capabilities for tools provided by the server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct ToolsCapabilities {
    /// Whether the server supports tool list change notifications
    #[serde(skip_serializing_if = "Option::is_none")]
    pub list_changed: Option<bool>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Capabilities for resources provided by the server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct ResourcesCapabilities {
    /// Whether the server supports resource subscriptions
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subscribe: Option<bool>,
    /// Whether the server supports resource list change notifications
    #[serde(skip_serializing_if = "Option::is_none")]
    pub list_changed: Option<bool>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct LoggingCapabilities {
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct CompletionsCapabilities {
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Capabilities that a server may support
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct ServerCapabilities {
    /// Logging capabilities
    #[serde(skip_serializing_if = "Option::is_none")]
    pub logging: Option<LoggingCapabilities>,
    /// Completion capabilities
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completions: Option<CompletionsCapabilities>,
    /// Prompt capabilities
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prompts: Option<PromptsCapabilities>,
    /// Resource capabilities
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resources: Option<ResourcesCapabilities>,
    /// Tool capabilities
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tools: Option<ToolsCapabilities>,
    /// Experimental capabilities
    #[serde(skip_serializing_if = "Option::is_none")]
    pub experimental: Option<Map<String, Value>>,
    /// Capabilities this crate does not model
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl ServerCapabilities {
    pub fn with_tools(mut self, list_changed: bool) -> Self {
        self.tools = Some(ToolsCapabilities {
            list_changed: Some(list_changed),
            ..Default::default()
        });
        self
    }

    pub fn with_resources(mut self, subscribe: bool, list_changed: bool) -> Self {
        self.resources = Some(ResourcesCapabilities {
            subscribe: Some(subscribe),
            list_changed: Some(list_changed),
            ..Default::default()
        });
        self
    }

    pub fn with_prompts(mut self, list_changed: bool) -> Self {
        self.prompts = Some(PromptsCapabilities {
            list_changed: Some(list_changed),
            ..Default::default()
        });
        self
    }

    pub fn with_logging(mut self) -> Self {
        self.logging = Some(LoggingCapabilities::default());
        self
    }

    pub fn with_completions(mut self) -> Self {
        self.completions = Some(CompletionsCapabilities::default());
        self
    }
}

/// Parameters for initialize request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitializeRequest {
    /// The protocol version the client wants to use. Kept as text because a
    /// peer may request a version this crate has never heard of.
    pub protocol_version: String,
    /// Capabilities the client supports
    pub capabilities: ClientCapabilities,
    /// Information about the client implementation
    pub client_info: Implementation,
}

impl InitializeRequest {
    pub fn new(
        protocol_version: McpVersion,
        capabilities: ClientCapabilities,
        client_info: Implementation,
    ) -> Self {
        Self {
            protocol_version: protocol_version.as_str().to_string(),
            capabilities,
            client_info,
        }
    }
}

/// Result payload for initialize
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitializeResult {
    /// The protocol version the server selected
    pub protocol_version: String,
    /// Capabilities the server supports
    pub capabilities: ServerCapabilities,
    /// Information about the server implementation
    pub server_info: Implementation,
    /// Optional instructions for the client
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instructions: Option<String>,
}

impl InitializeResult {
    pub fn new(
        protocol_version: McpVersion,
        capabilities: ServerCapabilities,
        server_info: Implementation,
    ) -> Self {
        Self {
            protocol_version: protocol_version.as_str().to_string(),
            capabilities,
            server_info,
            instructions: None,
        }
    }

    pub fn with_instructions(mut self, instructions: impl Into<String>) -> Self {
        self.instructions = Some(instructions.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_implementation_creation() {
        let impl_info = Implementation::new("test-client", "1.0.0").with_title("Test Client");

        assert_eq!(impl_info.name, "test-client");
        assert_eq!(impl_info.version, "1.0.0");
        assert_eq!(impl_info.title, Some("Test Client".to_string()));
    }

    #[test]
    fn test_initialize_request_wire_shape() {
        let request = InitializeRequest::new(
            McpVersion::V2024_11_05,
            ClientCapabilities::default().with_sampling(),
            Implementation::new("test-client", "1.0.0"),
        );

        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(
            json,
            json!({
                "protocolVersion": "2024-11-05",
                "capabilities": {"sampling": {}},
                "clientInfo": {"name": "test-client", "version": "1.0.0"}
            })
        );
    }

    #[test]
    fn test_unknown_capability_members_survive() {
        let raw = json!({
            "tools": {"listChanged": true, "streaming": {"chunked": true}},
            "futureThing": {"level": 3}
        });

        let caps: ServerCapabilities = serde_json::from_value(raw.clone()).unwrap();
        let tools = caps.tools.as_ref().unwrap();
        assert_eq!(tools.list_changed, Some(true));
        assert_eq!(tools.extra["streaming"], json!({"chunked": true}));
        assert_eq!(caps.extra["futureThing"], json!({"level": 3}));

        assert_eq!(serde_json::to_value(&caps).unwrap(), raw);
    }

    #[test]
    fn test_initialize_result_keeps_unknown_version_text() {
        let result: InitializeResult = serde_json::from_value(json!({
            "protocolVersion": "2099-01-01",
            "capabilities": {},
            "serverInfo": {"name": "s", "version": "0.1"}
        }))
        .unwrap();

        assert_eq!(result.protocol_version, "2099-01-01");
        assert!(McpVersion::from_str(&result.protocol_version).is_none());
        assert!(result.instructions.is_none());
    }
}
