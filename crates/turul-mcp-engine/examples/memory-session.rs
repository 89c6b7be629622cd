//! # In-Process MCP Session
//!
//! Runs a client and a server connection over a `MemoryTransport` pair and
//! walks through a full session: handshake, a tool call, a server-initiated
//! `roots/list` request and a graceful shutdown.
//!
//! ## Usage
//! ```bash
//! RUST_LOG=debug cargo run -p turul-mcp-engine --example memory-session
//! ```

use anyhow::{Context, Result};
use serde_json::{Value, json};
use tracing::info;
use turul_mcp_engine::prelude::*;

fn object(value: Value) -> Params {
    value.as_object().cloned().unwrap_or_default()
}

fn add(params: Option<Params>) -> Result<Params, HandlerError> {
    let arguments = params
        .as_ref()
        .and_then(|p| p.get("arguments"))
        .cloned()
        .unwrap_or(Value::Null);
    let operand = |name: &str| {
        arguments[name].as_f64().ok_or_else(|| {
            HandlerError::Rpc(JsonRpcErrorObject::invalid_params(&format!(
                "Missing parameter: {}",
                name
            )))
        })
    };
    let sum = operand("a")? + operand("b")?;
    Ok(object(json!({
        "content": [{"type": "text", "text": sum.to_string()}]
    })))
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let (client_end, server_end) = MemoryTransport::pair();

    let server = ConnectionBuilder::server(
        EngineConfig::default()
            .with_implementation(Implementation::new("memory-server", "1.0.0"))
            .with_instructions("Try the add tool"),
        ServerCapabilities::default().with_tools(false),
    )
    .handler(
        "tools/list",
        request_fn(|_params, _ctx| async move {
            Ok(object(json!({
                "tools": [{"name": "add", "inputSchema": {"type": "object"}}]
            })))
        }),
    )
    .handler(
        "tools/call",
        request_fn(|params, _ctx| async move { add(params) }),
    )
    .build(server_end)?;
    server.start();

    let client = ConnectionBuilder::client(
        EngineConfig::default().with_implementation(Implementation::new("memory-client", "1.0.0")),
        ClientCapabilities::default().with_roots(false),
    )
    .handler(
        "roots/list",
        request_fn(|_params, _ctx| async move {
            Ok(object(json!({
                "roots": [{"uri": "file:///workspace", "name": "workspace"}]
            })))
        }),
    )
    .build(client_end)?;

    let init = client.initialize().await.context("handshake failed")?;
    info!(
        server = %init.server_info.name,
        protocol_version = %init.protocol_version,
        instructions = ?init.instructions,
        "Connected"
    );

    let tools = client.request("tools/list", None).await?;
    info!("Tools: {}", serde_json::Value::Object(tools));

    let sum = client
        .request(
            "tools/call",
            Some(object(json!({"name": "add", "arguments": {"a": 2, "b": 40}}))),
        )
        .await?;
    info!("add(2, 40) -> {}", serde_json::Value::Object(sum));

    match client
        .request("tools/call", Some(object(json!({"name": "add", "arguments": {}}))))
        .await
    {
        Err(e) => info!(code = ?e.error_code(), "Server rejected bad arguments: {}", e),
        Ok(result) => info!("Unexpected success: {}", serde_json::Value::Object(result)),
    }

    // The server needs the handshake finished on its side before it may ask
    let mut events = server.subscribe();
    while server.phase() != Phase::Operational {
        events.recv().await.context("server event stream ended")?;
    }
    let roots = server.request("roots/list", None).await?;
    info!("Client roots: {}", serde_json::Value::Object(roots));

    let state = server.state();
    info!(
        client = ?state.client_info.map(|i| i.name),
        protocol_version = ?state.protocol_version,
        "Server view of the session"
    );

    client.shutdown().await?;
    server.closed().await;
    info!(history = ?server.phase_history(), "Session closed");
    Ok(())
}
