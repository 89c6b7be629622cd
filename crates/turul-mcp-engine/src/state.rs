//! Negotiated per-connection state

use serde::Serialize;
use turul_mcp_protocol::{
    ClientCapabilities, Implementation, InitializeRequest, InitializeResult, Role,
    ServerCapabilities,
};

use crate::lifecycle::{Lifecycle, Phase};

/// Snapshot of what both sides agreed on during the handshake
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionState {
    pub connection_id: String,
    pub role: Role,
    pub phase: Phase,
    /// Set once the initialize result has been sent or accepted
    pub protocol_version: Option<String>,
    pub client_capabilities: ClientCapabilities,
    pub server_capabilities: ServerCapabilities,
    pub client_info: Option<Implementation>,
    pub server_info: Option<Implementation>,
    pub instructions: Option<String>,
}

impl ConnectionState {
    /// Check if the handshake has completed and the connection is usable
    pub fn is_operational(&self) -> bool {
        self.phase == Phase::Operational
    }
}

/// Lifecycle and negotiated state, guarded together so admission decisions
/// and the capabilities they consult never disagree.
#[derive(Debug)]
pub(crate) struct Session {
    pub lifecycle: Lifecycle,
    pub protocol_version: Option<String>,
    pub client_capabilities: ClientCapabilities,
    pub server_capabilities: ServerCapabilities,
    pub client_info: Option<Implementation>,
    pub server_info: Option<Implementation>,
    pub instructions: Option<String>,
}

impl Session {
    /// A client knows its own capabilities up front, a server its own
    pub fn new(
        role: Role,
        client_capabilities: ClientCapabilities,
        server_capabilities: ServerCapabilities,
    ) -> Self {
        Self {
            lifecycle: Lifecycle::new(role),
            protocol_version: None,
            client_capabilities,
            server_capabilities,
            client_info: None,
            server_info: None,
            instructions: None,
        }
    }

    /// Record the client's side of the handshake (server role)
    pub fn apply_request(&mut self, request: &InitializeRequest) {
        self.client_capabilities = request.capabilities.clone();
        self.client_info = Some(request.client_info.clone());
    }

    /// Record the agreed result (both roles)
    pub fn apply_result(&mut self, result: &InitializeResult) {
        self.protocol_version = Some(result.protocol_version.clone());
        self.server_capabilities = result.capabilities.clone();
        self.server_info = Some(result.server_info.clone());
        self.instructions = result.instructions.clone();
    }

    pub fn snapshot(&self, connection_id: &str) -> ConnectionState {
        ConnectionState {
            connection_id: connection_id.to_string(),
            role: self.lifecycle.role(),
            phase: self.lifecycle.phase(),
            protocol_version: self.protocol_version.clone(),
            client_capabilities: self.client_capabilities.clone(),
            server_capabilities: self.server_capabilities.clone(),
            client_info: self.client_info.clone(),
            server_info: self.server_info.clone(),
            instructions: self.instructions.clone(),
        }
    }
}
