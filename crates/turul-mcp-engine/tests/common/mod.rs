//! Shared helpers for engine integration tests
//!
//! A "raw" peer is a bare `MemoryTransport` end driven by the test itself, so
//! assertions can be made on the exact frames that cross the wire.

#![allow(dead_code)]

use std::time::Duration;

use serde_json::{Value, json};
use tokio::sync::broadcast;
use turul_mcp_engine::prelude::*;

pub fn obj(value: Value) -> Params {
    value.as_object().cloned().expect("test value must be an object")
}

/// Next frame from a raw peer with its transport metadata
pub async fn recv_message(raw: &MemoryTransport) -> TransportMessage {
    tokio::time::timeout(Duration::from_secs(5), raw.receive())
        .await
        .expect("timed out waiting for a frame")
        .expect("transport error")
        .expect("transport closed")
}

/// Next frame from a raw peer, failing the test if none arrives
pub async fn recv(raw: &MemoryTransport) -> Value {
    recv_message(raw).await.payload
}

/// Send a request from a raw peer and return the frame that answers it
pub async fn call(raw: &MemoryTransport, id: i64, method: &str, params: Value) -> Value {
    raw.send(json!({"jsonrpc": "2.0", "id": id, "method": method, "params": params}).into())
        .await
        .unwrap();
    recv(raw).await
}

/// Drive the client half of the handshake from a raw peer
pub async fn raw_initialize(raw: &MemoryTransport, version: &str, capabilities: Value) -> Value {
    let response = call(
        raw,
        0,
        "initialize",
        json!({
            "protocolVersion": version,
            "capabilities": capabilities,
            "clientInfo": {"name": "raw-client", "version": "1.0.0"}
        }),
    )
    .await;
    raw.send(json!({"jsonrpc": "2.0", "method": "notifications/initialized"}).into())
        .await
        .unwrap();
    response
}

/// Stub `tools/list` and `tools/call` handlers, required once `tools` is declared
pub fn with_tool_stubs(builder: ConnectionBuilder) -> ConnectionBuilder {
    builder
        .handler(
            "tools/list",
            request_fn(|_params, _ctx| async move { Ok(obj(json!({"tools": []}))) }),
        )
        .handler(
            "tools/call",
            request_fn(|params, _ctx| async move { Ok(params.unwrap_or_default()) }),
        )
}

/// A started server connection facing a raw client
pub fn server_with_raw_client(builder: ConnectionBuilder) -> (Connection, MemoryTransport) {
    let (server_end, raw) = MemoryTransport::pair();
    let server = builder.build(server_end).unwrap();
    server.start();
    (server, raw)
}

/// An initialized client connection facing a raw server that declared
/// `capabilities`
pub async fn client_with_raw_server(
    config: EngineConfig,
    capabilities: ClientCapabilities,
    server_capabilities: Value,
) -> (Connection, MemoryTransport) {
    let (client_end, raw) = MemoryTransport::pair();
    let client = ConnectionBuilder::client(config, capabilities)
        .build(client_end)
        .unwrap();

    let init = {
        let client = client.clone();
        tokio::spawn(async move { client.initialize().await })
    };

    let request = recv(&raw).await;
    assert_eq!(request["method"], json!("initialize"));
    raw.send(json!({
        "jsonrpc": "2.0",
        "id": request["id"].clone(),
        "result": {
            "protocolVersion": request["params"]["protocolVersion"].clone(),
            "capabilities": server_capabilities,
            "serverInfo": {"name": "raw-server", "version": "1.0.0"}
        }
    }).into())
    .await
    .unwrap();

    init.await.unwrap().unwrap();
    let initialized = recv(&raw).await;
    assert_eq!(initialized["method"], json!("notifications/initialized"));
    (client, raw)
}

/// Wait for the first event matching `predicate`
pub async fn wait_for_event(
    events: &mut broadcast::Receiver<ConnectionEvent>,
    predicate: impl Fn(&ConnectionEvent) -> bool,
) -> ConnectionEvent {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match events.recv().await {
                Ok(event) if predicate(&event) => return event,
                Ok(_) => continue,
                Err(e) => panic!("event channel failed: {}", e),
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}

pub async fn wait_for_phase(
    events: &mut broadcast::Receiver<ConnectionEvent>,
    phase: Phase,
) -> ConnectionEvent {
    wait_for_event(events, |event| {
        matches!(event, ConnectionEvent::PhaseChanged { to, .. } if *to == phase)
    })
    .await
}
