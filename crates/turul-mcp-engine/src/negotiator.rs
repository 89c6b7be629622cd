//! Protocol version negotiation and capability gating

use tracing::{debug, warn};
use turul_mcp_protocol::{
    ClientCapabilities, Implementation, InitializeRequest, InitializeResult, McpVersion, Role,
    ServerCapabilities, required_capability,
};

use crate::error::{EngineError, EngineResult};
use crate::lifecycle::MessageKind;

/// Picks the protocol version for a connection
#[derive(Debug, Clone)]
pub struct Negotiator {
    /// Most preferred first
    supported: Vec<McpVersion>,
}

impl Negotiator {
    pub fn new(supported: Vec<McpVersion>) -> Self {
        Self { supported }
    }

    pub fn supported(&self) -> &[McpVersion] {
        &self.supported
    }

    /// The version a client asks for and a server falls back to
    pub fn preferred(&self) -> McpVersion {
        self.supported.first().copied().unwrap_or(McpVersion::LATEST)
    }

    pub fn supports(&self, version: &str) -> bool {
        self.evaluate_offer(version).is_some()
    }

    /// Responder side: echo the requested version if we speak it, otherwise
    /// offer our most preferred one. Never fails; the initiator decides
    /// whether it can live with the offer.
    pub fn select(&self, requested: &str) -> McpVersion {
        match McpVersion::from_str(requested).filter(|v| self.supported.contains(v)) {
            Some(version) => {
                debug!(requested = %requested, "Accepting requested protocol version");
                version
            }
            None => {
                let offered = self.preferred();
                warn!(
                    requested = %requested,
                    offered = %offered,
                    "Requested protocol version not supported, offering preferred version"
                );
                offered
            }
        }
    }

    /// Initiator side: the offered version if it is one we support
    pub fn evaluate_offer(&self, offered: &str) -> Option<McpVersion> {
        McpVersion::from_str(offered).filter(|v| self.supported.contains(v))
    }

    /// Build the initialize result for a client's request. Capabilities are
    /// returned exactly as declared.
    pub fn respond(
        &self,
        request: &InitializeRequest,
        capabilities: ServerCapabilities,
        server_info: Implementation,
        instructions: Option<String>,
    ) -> InitializeResult {
        let version = self.select(&request.protocol_version);
        let mut result = InitializeResult::new(version, capabilities, server_info);
        result.instructions = instructions;
        result
    }
}

/// Check a message against the capability requirement table.
///
/// Requests must travel toward the side that declared the capability and
/// notifications must come from it.
pub fn check_capability(
    sender: Role,
    kind: MessageKind,
    method: &str,
    client: &ClientCapabilities,
    server: &ServerCapabilities,
) -> EngineResult<()> {
    let Some(capability) = required_capability(method) else {
        return Ok(());
    };
    let declared_by = capability.declared_by();

    let direction_ok = match kind {
        MessageKind::Request => sender == declared_by.peer(),
        MessageKind::Notification => sender == declared_by,
    };

    if direction_ok && capability.is_declared(client, server) {
        Ok(())
    } else {
        Err(EngineError::CapabilityViolation {
            method: method.to_string(),
            capability,
            declared_by,
        })
    }
}
