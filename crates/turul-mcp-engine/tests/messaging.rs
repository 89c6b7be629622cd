//! Batches, correlation, cancellation and teardown

mod common;

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use common::*;
use serde_json::{Value, json};
use tokio::sync::Notify;
use turul_mcp_engine::prelude::*;

fn echo() -> MethodHandler {
    request_fn(|params, _ctx| async move { Ok(params.unwrap_or_default()) })
}

/// Server with tools declared and an initialized raw client in front of it
async fn operational_server(builder: ConnectionBuilder) -> (Connection, MemoryTransport) {
    let (server, raw) = server_with_raw_client(builder);
    let mut events = server.subscribe();
    raw_initialize(&raw, "2025-06-18", json!({})).await;
    wait_for_phase(&mut events, Phase::Operational).await;
    (server, raw)
}

fn server_builder() -> ConnectionBuilder {
    with_tool_stubs(ConnectionBuilder::server(
        EngineConfig::default(),
        ServerCapabilities::default().with_tools(false),
    ))
}

fn response_by_id(frame: &Value, id: i64) -> Value {
    frame
        .as_array()
        .expect("batch response must be an array")
        .iter()
        .find(|response| response["id"] == json!(id))
        .cloned()
        .unwrap_or_else(|| panic!("no response for id {}", id))
}

#[tokio::test]
async fn test_end_to_end_request_and_remote_error() {
    let (client_end, server_end) = MemoryTransport::pair();
    let server = ConnectionBuilder::server(
        EngineConfig::default(),
        ServerCapabilities::default().with_tools(false),
    )
    .handler(
        "tools/list",
        request_fn(|_params, ctx| async move {
            assert!(ctx.request_id.is_some());
            Ok(obj(json!({
                "tools": [{"name": "echo"}],
                "protocolVersion": ctx.metadata.get("protocolVersion").cloned()
            })))
        }),
    )
    .handler(
        "tools/call",
        request_fn(|_params, _ctx| async move {
            Err(HandlerError::Rpc(JsonRpcErrorObject::invalid_params(
                "Missing parameter: name",
            )))
        }),
    )
    .build(server_end)
    .unwrap();
    server.start();

    let client = ConnectionBuilder::client(EngineConfig::default(), ClientCapabilities::default())
        .build(client_end)
        .unwrap();
    client.initialize().await.unwrap();

    let tools = client.request("tools/list", None).await.unwrap();
    assert_eq!(tools["tools"][0]["name"], json!("echo"));
    assert_eq!(tools["protocolVersion"], json!("2025-06-18"));

    let err = client
        .request("tools/call", Some(obj(json!({}))))
        .await
        .unwrap_err();
    assert!(err.is_remote());
    assert_eq!(err.error_code(), Some(-32602));

    let err = client.request("tools/unknown", None).await.unwrap_err();
    assert_eq!(err.error_code(), Some(-32601));
}

#[tokio::test]
async fn test_batch_with_malformed_element_is_isolated() {
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    let (_server, raw) = operational_server(server_builder().handler(
        "tools/call",
        request_fn(move |params, _ctx| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(params.unwrap_or_default())
            }
        }),
    ))
    .await;

    raw.send(json!([
        {"jsonrpc": "2.0", "id": 1, "method": "tools/call", "params": {"name": "a"}},
        {"jsonrpc": "2.0", "id": 2, "method": 42},
        {"jsonrpc": "2.0", "id": 3, "method": "tools/call", "params": {"name": "c"}}
    ]).into())
    .await
    .unwrap();

    let frame = recv(&raw).await;
    assert_eq!(frame.as_array().unwrap().len(), 3);

    assert_eq!(response_by_id(&frame, 1)["result"], json!({"name": "a"}));
    assert_eq!(response_by_id(&frame, 2)["error"]["code"], json!(-32600));
    assert_eq!(response_by_id(&frame, 3)["result"], json!({"name": "c"}));
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_batch_without_requests_sends_nothing() {
    let (server, raw) = operational_server(server_builder()).await;
    let mut events = server.subscribe();

    raw.send(json!([
        {"jsonrpc": "2.0", "method": "notifications/progress", "params": {"progressToken": 1, "progress": 5}},
        {"jsonrpc": "2.0", "id": 77, "result": {}}
    ]).into())
    .await
    .unwrap();

    wait_for_event(&mut events, |event| {
        matches!(event, ConnectionEvent::Orphan { id: Some(RequestId::Number(77)) })
    })
    .await;

    // Nothing was queued ahead of the ping
    let pong = call(&raw, 5, "ping", json!({})).await;
    assert_eq!(pong["id"], json!(5));
}

#[tokio::test]
async fn test_batch_rejected_before_initialization() {
    let (_server, raw) = server_with_raw_client(server_builder());

    raw.send(json!([
        {"jsonrpc": "2.0", "id": 1, "method": "ping"},
        {"jsonrpc": "2.0", "method": "notifications/initialized"}
    ]).into())
    .await
    .unwrap();

    let frame = recv(&raw).await;
    let responses = frame.as_array().unwrap();
    assert_eq!(responses.len(), 1);
    assert_eq!(responses[0]["id"], json!(1));
    assert_eq!(responses[0]["error"]["code"], json!(-32600));
}

#[tokio::test]
async fn test_stray_response_before_initialization_is_orphan() {
    let (server, raw) = server_with_raw_client(server_builder());
    let mut events = server.subscribe();

    raw.send(json!({"jsonrpc": "2.0", "id": 41, "result": {}}).into())
        .await
        .unwrap();
    wait_for_event(&mut events, |event| {
        matches!(event, ConnectionEvent::Orphan { id: Some(RequestId::Number(41)) })
    })
    .await;
    assert_eq!(server.phase(), Phase::Uninitialized);

    // Nothing was sent back for the response; the next frame answers the ping
    let pong = call(&raw, 2, "ping", json!({})).await;
    assert_eq!(pong, json!({"jsonrpc": "2.0", "id": 2, "result": {}}));
}

#[tokio::test]
async fn test_empty_batch_answered_with_null_id() {
    let (_server, raw) = operational_server(server_builder()).await;

    raw.send(json!([]).into()).await.unwrap();
    let frame = recv(&raw).await;
    assert_eq!(frame["id"], Value::Null);
    assert_eq!(frame["error"]["code"], json!(-32600));
}

#[tokio::test]
async fn test_malformed_messages_isolated() {
    let (server, raw) = operational_server(server_builder()).await;
    let mut events = server.subscribe();

    // No usable id: reported, never answered
    raw.send(json!({"jsonrpc": "2.0", "id": {"nested": true}, "method": "ping"}).into())
        .await
        .unwrap();
    let event = wait_for_event(&mut events, |event| {
        matches!(event, ConnectionEvent::CodecError { .. })
    })
    .await;
    let ConnectionEvent::CodecError { error } = event else {
        unreachable!()
    };
    assert!(error.request_id().is_none());

    // Recoverable id: answered with Invalid Request
    raw.send(json!({"jsonrpc": "1.0", "id": 5, "method": "ping"}).into())
        .await
        .unwrap();
    let response = recv(&raw).await;
    assert_eq!(response["id"], json!(5));
    assert_eq!(response["error"]["code"], json!(-32600));

    // The connection carries on
    let response = call(&raw, 6, "ping", json!({})).await;
    assert_eq!(response["result"], json!({}));
    assert_eq!(server.phase(), Phase::Operational);
}

#[tokio::test]
async fn test_orphan_and_null_id_responses_reported() {
    let (client, raw) = client_with_raw_server(
        EngineConfig::default(),
        ClientCapabilities::default(),
        json!({"tools": {}}),
    )
    .await;
    let mut events = client.subscribe();

    raw.send(json!({"jsonrpc": "2.0", "id": 99, "result": {}}).into())
        .await
        .unwrap();
    let event = wait_for_event(&mut events, |event| {
        matches!(event, ConnectionEvent::Orphan { .. })
    })
    .await;
    assert_eq!(
        event,
        ConnectionEvent::Orphan {
            id: Some(RequestId::Number(99))
        }
    );

    raw.send(json!({"jsonrpc": "2.0", "id": null, "error": {"code": -32700, "message": "Parse error"}}).into())
        .await
        .unwrap();
    let event = wait_for_event(&mut events, |event| {
        matches!(event, ConnectionEvent::Orphan { .. })
    })
    .await;
    assert_eq!(event, ConnectionEvent::Orphan { id: None });
    assert_eq!(client.phase(), Phase::Operational);
}

#[tokio::test]
async fn test_duplicate_inbound_id_while_in_flight() {
    let release = Arc::new(Notify::new());
    let gate = release.clone();
    let (_server, raw) = operational_server(server_builder().handler(
        "tools/call",
        request_fn(move |_params, _ctx| {
            let gate = gate.clone();
            async move {
                gate.notified().await;
                Ok(obj(json!({"done": true})))
            }
        }),
    ))
    .await;

    raw.send(json!({"jsonrpc": "2.0", "id": 1, "method": "tools/call", "params": {}}).into())
        .await
        .unwrap();
    let duplicate = call(&raw, 1, "tools/call", json!({})).await;
    assert_eq!(duplicate["id"], json!(1));
    assert_eq!(duplicate["error"]["code"], json!(-32600));

    release.notify_one();
    let response = recv(&raw).await;
    assert_eq!(response["result"], json!({"done": true}));
}

#[tokio::test]
async fn test_cancel_outbound_request() {
    let (client, raw) = client_with_raw_server(
        EngineConfig::default(),
        ClientCapabilities::default(),
        json!({"tools": {}}),
    )
    .await;
    let mut events = client.subscribe();

    let handle = client.send_request("tools/list", None).await.unwrap();
    let id = handle.id().clone();
    assert_eq!(handle.method(), "tools/list");

    assert!(client.cancel(&id).await);
    assert!(!client.cancel(&id).await);
    assert!(matches!(handle.wait().await, Err(EngineError::Cancelled)));

    let request = recv(&raw).await;
    assert_eq!(request["method"], json!("tools/list"));
    let cancelled = recv(&raw).await;
    assert_eq!(cancelled["method"], json!("notifications/cancelled"));
    assert_eq!(cancelled["params"]["requestId"], request["id"]);

    // The late answer is an orphan
    raw.send(json!({"jsonrpc": "2.0", "id": request["id"].clone(), "result": {"tools": []}}).into())
        .await
        .unwrap();
    let event = wait_for_event(&mut events, |event| {
        matches!(event, ConnectionEvent::Orphan { .. })
    })
    .await;
    assert_eq!(event, ConnectionEvent::Orphan { id: Some(id) });
}

#[tokio::test(start_paused = true)]
async fn test_request_timeout_cancels_and_notifies_peer() {
    let (client, raw) = client_with_raw_server(
        EngineConfig::default(),
        ClientCapabilities::default(),
        json!({"tools": {}}),
    )
    .await;

    let err = client
        .request_with_timeout("tools/list", None, Duration::from_secs(30))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Timeout(d) if d == Duration::from_secs(30)));

    let request = raw.receive().await.unwrap().unwrap().payload;
    assert_eq!(request["method"], json!("tools/list"));
    let cancelled = raw.receive().await.unwrap().unwrap().payload;
    assert_eq!(cancelled["method"], json!("notifications/cancelled"));
    assert_eq!(cancelled["params"]["requestId"], request["id"]);
    assert_eq!(
        cancelled["params"]["reason"],
        json!("Request timed out after 30s")
    );
}

#[tokio::test]
async fn test_inbound_cancellation_suppresses_response() {
    let started = Arc::new(Notify::new());
    let signal = started.clone();
    let (_server, raw) = operational_server(server_builder().handler(
        "tools/call",
        request_fn(move |_params, _ctx| {
            let signal = signal.clone();
            async move {
                signal.notify_one();
                futures::future::pending::<()>().await;
                Ok(Params::new())
            }
        }),
    ))
    .await;

    raw.send(json!({"jsonrpc": "2.0", "id": 7, "method": "tools/call", "params": {}}).into())
        .await
        .unwrap();
    started.notified().await;

    raw.send(json!({
        "jsonrpc": "2.0",
        "method": "notifications/cancelled",
        "params": {"requestId": 7, "reason": "user gave up"}
    }).into())
    .await
    .unwrap();

    // The next frame answers the ping; request 7 is never answered
    let pong = call(&raw, 8, "ping", json!({})).await;
    assert_eq!(pong["id"], json!(8));

    // The id is free again once the handler is gone
    let reused = call(&raw, 7, "ping", json!({})).await;
    assert_eq!(reused["result"], json!({}));
}

#[tokio::test]
async fn test_slow_handler_does_not_block_ping() {
    let release = Arc::new(Notify::new());
    let gate = release.clone();
    let (_server, raw) = operational_server(server_builder().handler(
        "tools/call",
        request_fn(move |_params, _ctx| {
            let gate = gate.clone();
            async move {
                gate.notified().await;
                Ok(obj(json!({"slow": true})))
            }
        }),
    ))
    .await;

    raw.send(json!({"jsonrpc": "2.0", "id": 1, "method": "tools/call", "params": {}}).into())
        .await
        .unwrap();
    let ping = call(&raw, 2, "ping", json!({})).await;
    assert_eq!(ping["id"], json!(2));

    release.notify_one();
    let slow = recv(&raw).await;
    assert_eq!(slow["id"], json!(1));
    assert_eq!(slow["result"], json!({"slow": true}));
}

#[tokio::test]
async fn test_handler_panic_becomes_internal_error() {
    let (_server, raw) = operational_server(server_builder().handler(
        "tools/call",
        request_fn(|params, _ctx| async move {
            if params.is_some() {
                panic!("tool exploded");
            }
            Ok(Params::new())
        }),
    ))
    .await;

    let response = call(&raw, 3, "tools/call", json!({"name": "boom"})).await;
    assert_eq!(response["id"], json!(3));
    assert_eq!(response["error"]["code"], json!(-32603));

    let response = call(&raw, 4, "ping", json!({})).await;
    assert_eq!(response["result"], json!({}));
}

#[tokio::test]
async fn test_notification_handler_failure_reported() {
    let (server, raw) = operational_server(server_builder().handler(
        "notifications/progress",
        notification_fn(|_params, _ctx| async move { Err(HandlerError::internal("bad progress")) }),
    ))
    .await;
    let mut events = server.subscribe();

    raw.send(json!({"jsonrpc": "2.0", "method": "notifications/progress", "params": {}}).into())
        .await
        .unwrap();
    let event = wait_for_event(&mut events, |event| {
        matches!(event, ConnectionEvent::NotificationFailed { .. })
    })
    .await;
    assert_eq!(
        event,
        ConnectionEvent::NotificationFailed {
            method: "notifications/progress".to_string(),
            error: HandlerError::internal("bad progress"),
        }
    );

    let pong = call(&raw, 1, "ping", json!({})).await;
    assert_eq!(pong["id"], json!(1));
}

#[tokio::test]
async fn test_runtime_registration() {
    let (server, raw) = operational_server(server_builder()).await;

    let missing = call(&raw, 1, "custom/echo", json!({"x": 1})).await;
    assert_eq!(missing["error"]["code"], json!(-32601));

    assert!(server.register("custom/echo", echo()).is_none());
    let found = call(&raw, 2, "custom/echo", json!({"x": 1})).await;
    assert_eq!(found["result"], json!({"x": 1}));

    // Replacing a handler the builder registered
    let replaced = server.register(
        "tools/call",
        request_fn(|_params, _ctx| async move { Ok(obj(json!({"replaced": true}))) }),
    );
    assert!(replaced.is_some());
    let response = call(&raw, 3, "tools/call", json!({})).await;
    assert_eq!(response["result"], json!({"replaced": true}));
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_drains_outstanding_requests() {
    let mut config = EngineConfig::default();
    config.timeouts.shutdown_grace = Duration::from_secs(1);
    let (client, raw) =
        client_with_raw_server(config, ClientCapabilities::default(), json!({"tools": {}})).await;

    let handle = client.send_request("tools/list", None).await.unwrap();
    client.shutdown().await.unwrap();

    assert!(matches!(handle.wait().await, Err(EngineError::ConnectionClosed)));
    assert_eq!(
        client.phase_history(),
        vec![
            Phase::Uninitialized,
            Phase::Initializing,
            Phase::Operational,
            Phase::ShuttingDown,
            Phase::Closed
        ]
    );

    let request = raw.receive().await.unwrap().unwrap().payload;
    assert_eq!(request["method"], json!("tools/list"));
    assert_eq!(raw.receive().await.unwrap(), None);

    assert!(matches!(
        client.request("tools/list", None).await,
        Err(EngineError::ConnectionClosed)
    ));
}

#[tokio::test]
async fn test_shutdown_waits_for_answers_within_grace() {
    let (client, raw) = client_with_raw_server(
        EngineConfig::default(),
        ClientCapabilities::default(),
        json!({"tools": {}}),
    )
    .await;

    let handle = client.send_request("tools/list", None).await.unwrap();
    let shutdown = {
        let client = client.clone();
        tokio::spawn(async move { client.shutdown().await })
    };

    let request = recv(&raw).await;
    raw.send(json!({"jsonrpc": "2.0", "id": request["id"].clone(), "result": {"tools": []}}).into())
        .await
        .unwrap();

    assert_eq!(handle.wait().await.unwrap(), obj(json!({"tools": []})));
    shutdown.await.unwrap().unwrap();
    client.closed().await;
    assert!(client.is_closed());
}

#[tokio::test]
async fn test_peer_disconnect_closes_connection() {
    let (client, raw) = client_with_raw_server(
        EngineConfig::default(),
        ClientCapabilities::default(),
        json!({"tools": {}}),
    )
    .await;

    let handle = client.send_request("tools/list", None).await.unwrap();
    raw.close().await.unwrap();

    client.closed().await;
    assert_eq!(client.phase(), Phase::Closed);
    assert!(matches!(handle.wait().await, Err(EngineError::ConnectionClosed)));
}

#[tokio::test]
async fn test_abandoned_request_releases_its_slot() {
    let (client, raw) = client_with_raw_server(
        EngineConfig::default(),
        ClientCapabilities::default(),
        json!({"tools": {}}),
    )
    .await;
    let mut events = client.subscribe();

    let abandoned =
        tokio::time::timeout(Duration::from_millis(20), client.request("tools/list", None)).await;
    assert!(abandoned.is_err());

    // The late answer matches nothing
    let request = recv(&raw).await;
    assert_eq!(request["method"], json!("tools/list"));
    raw.send(json!({"jsonrpc": "2.0", "id": request["id"].clone(), "result": {"tools": []}}).into())
        .await
        .unwrap();
    let event = wait_for_event(&mut events, |event| {
        matches!(event, ConnectionEvent::Orphan { .. })
    })
    .await;
    assert_eq!(
        event,
        ConnectionEvent::Orphan {
            id: RequestId::from_value(&request["id"])
        }
    );

    // Nor does a dropped handle hold shutdown for the grace period
    drop(client.send_request("tools/list", None).await.unwrap());
    let started = std::time::Instant::now();
    client.shutdown().await.unwrap();
    assert!(started.elapsed() < Duration::from_secs(1));
}

#[tokio::test]
async fn test_request_metadata_round_trip() {
    let (client, raw) = client_with_raw_server(
        EngineConfig::default(),
        ClientCapabilities::default(),
        json!({"tools": {}}),
    )
    .await;

    let outbound = obj(json!({"authorization": "Bearer t"}));
    let pending = {
        let client = client.clone();
        let outbound = outbound.clone();
        tokio::spawn(async move {
            client
                .request_with_metadata("tools/list", None, Some(outbound))
                .await
        })
    };

    let message = recv_message(&raw).await;
    assert_eq!(message.payload["method"], json!("tools/list"));
    assert_eq!(message.metadata, Some(outbound));

    let inbound = obj(json!({"mcp-session-id": "s-42"}));
    raw.send(
        TransportMessage::new(json!({
            "jsonrpc": "2.0",
            "id": message.payload["id"].clone(),
            "result": {"tools": []}
        }))
        .with_metadata(inbound.clone()),
    )
    .await
    .unwrap();

    let (result, metadata) = pending.await.unwrap().unwrap();
    assert_eq!(result, obj(json!({"tools": []})));
    assert_eq!(metadata, Some(inbound));
}

#[tokio::test]
async fn test_remote_error_carries_transport_metadata() {
    let (client, raw) = client_with_raw_server(
        EngineConfig::default(),
        ClientCapabilities::default(),
        json!({"tools": {}}),
    )
    .await;

    let pending = {
        let client = client.clone();
        tokio::spawn(async move { client.request("tools/call", Some(obj(json!({})))).await })
    };
    let request = recv(&raw).await;
    raw.send(
        TransportMessage::new(json!({
            "jsonrpc": "2.0",
            "id": request["id"].clone(),
            "error": {"code": -32602, "message": "Missing parameter: name"}
        }))
        .with_metadata(obj(json!({"status": 400}))),
    )
    .await
    .unwrap();

    let err = pending.await.unwrap().unwrap_err();
    assert_eq!(err.error_code(), Some(-32602));
    assert_eq!(err.transport_metadata(), Some(&obj(json!({"status": 400}))));
}

#[tokio::test]
async fn test_inbound_metadata_reaches_handler_and_is_echoed() {
    let (_server, raw) = operational_server(server_builder().handler(
        "tools/call",
        request_fn(|_params, ctx| async move {
            Ok(obj(json!({"seen": ctx.metadata.get("transport").cloned()})))
        }),
    ))
    .await;

    let metadata = obj(json!({"mcp-session-id": "s-7"}));
    raw.send(
        TransportMessage::new(
            json!({"jsonrpc": "2.0", "id": 3, "method": "tools/call", "params": {}}),
        )
        .with_metadata(metadata.clone()),
    )
    .await
    .unwrap();

    let reply = recv_message(&raw).await;
    assert_eq!(reply.payload["id"], json!(3));
    assert_eq!(reply.payload["result"]["seen"], json!({"mcp-session-id": "s-7"}));
    assert_eq!(reply.metadata, Some(metadata));

    // Frames without metadata are answered without any
    raw.send(json!({"jsonrpc": "2.0", "id": 4, "method": "ping"}).into())
        .await
        .unwrap();
    let reply = recv_message(&raw).await;
    assert_eq!(reply.payload["id"], json!(4));
    assert_eq!(reply.metadata, None);
}
