//! End-to-end tests for the control channel: a real broker listening on a
//! loopback port, driven by fake agents over WebSocket.

use std::time::Duration;

use clap::Parser;
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tunely_core::{ErrorKind, Headers};
use tunely_server::config::ServerConfig;
use tunely_server::forward::{ForwardOutcome, ForwardRequest};
use tunely_server::pending::StreamEvent;
use tunely_server::server::{build_router, AppState};
use tunely_server::store::{TunnelMode, TunnelStore};

type Agent = WebSocketStream<MaybeTlsStream<TcpStream>>;

struct Broker {
    state: AppState,
    ws_url: String,
}

async fn start_broker(adjust: impl FnOnce(&mut ServerConfig)) -> Broker {
    let mut config = ServerConfig::parse_from(["tunely-server"]);
    adjust(&mut config);
    let state = AppState::new(config, TunnelStore::memory());
    let app = build_router(state.clone());

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    Broker {
        ws_url: format!("ws://{addr}/ws/tunnel"),
        state,
    }
}

async fn register_domain(broker: &Broker, domain: &str) -> String {
    broker
        .state
        .store
        .create_domain(domain, None, None, TunnelMode::Http)
        .await
        .unwrap()
        .token
}

async fn connect(broker: &Broker) -> Agent {
    let (ws, _) = connect_async(&broker.ws_url).await.unwrap();
    ws
}

async fn send_json(agent: &mut Agent, value: Value) {
    agent
        .send(WsMessage::Text(value.to_string()))
        .await
        .unwrap();
}

/// Next JSON frame from the agent side, skipping ws-level control frames.
async fn recv_json(agent: &mut Agent) -> Option<Value> {
    loop {
        let frame = tokio::time::timeout(Duration::from_secs(5), agent.next())
            .await
            .expect("timed out waiting for a frame")?;
        match frame.ok()? {
            WsMessage::Text(raw) => return Some(serde_json::from_str(&raw).unwrap()),
            WsMessage::Close(_) => return None,
            _ => continue,
        }
    }
}

async fn auth(agent: &mut Agent, token: &str, force: bool) -> Value {
    send_json(agent, json!({ "type": "auth", "token": token, "force": force })).await;
    recv_json(agent).await.expect("auth reply")
}

fn forward_request(timeout: Option<f64>) -> ForwardRequest {
    ForwardRequest {
        method: "GET".to_string(),
        path: "/ping".to_string(),
        headers: Headers::new(),
        body: None,
        timeout,
    }
}

#[tokio::test]
async fn agent_authenticates_and_binds() {
    let broker = start_broker(|_| {}).await;
    let token = register_domain(&broker, "demo").await;

    let mut agent = connect(&broker).await;
    let reply = auth(&mut agent, &token, false).await;

    assert_eq!(reply["type"], "auth_ok");
    assert_eq!(reply["domain"], "demo");
    assert!(reply["tunnel_id"].is_string());
    assert!(broker.state.registry.is_connected("demo"));
}

#[tokio::test]
async fn invalid_token_is_rejected() {
    let broker = start_broker(|_| {}).await;

    let mut agent = connect(&broker).await;
    let reply = auth(&mut agent, "tun_bogus", false).await;

    assert_eq!(reply["type"], "auth_error");
    assert_eq!(reply["code"], "auth_failed");
    // The broker closes the channel after the rejection.
    assert!(recv_json(&mut agent).await.is_none());
}

#[tokio::test]
async fn disabled_tunnel_is_rejected() {
    let broker = start_broker(|_| {}).await;
    let token = register_domain(&broker, "demo").await;
    broker
        .state
        .store
        .update_domain(
            "demo",
            tunely_server::store::DomainUpdate {
                enabled: Some(false),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    let mut agent = connect(&broker).await;
    let reply = auth(&mut agent, &token, false).await;
    assert_eq!(reply["type"], "auth_error");
    assert_eq!(reply["code"], "tunnel_disabled");
}

#[tokio::test]
async fn non_auth_first_frame_is_a_protocol_error() {
    let broker = start_broker(|_| {}).await;

    let mut agent = connect(&broker).await;
    send_json(&mut agent, json!({ "type": "ping" })).await;
    let reply = recv_json(&mut agent).await.expect("reject frame");
    assert_eq!(reply["type"], "auth_error");
    assert_eq!(reply["code"], "protocol_error");
}

#[tokio::test]
async fn duplicate_connect_without_force_keeps_first_binding() {
    let broker = start_broker(|_| {}).await;
    let token = register_domain(&broker, "demo").await;

    let mut first = connect(&broker).await;
    assert_eq!(auth(&mut first, &token, false).await["type"], "auth_ok");

    let mut second = connect(&broker).await;
    let reply = auth(&mut second, &token, false).await;
    assert_eq!(reply["type"], "auth_error");
    assert_eq!(reply["code"], "already_connected");
    assert!(recv_json(&mut second).await.is_none());

    // The first agent still answers pings, so its session is intact.
    send_json(&mut first, json!({ "type": "ping" })).await;
    let pong = recv_json(&mut first).await.expect("pong");
    assert_eq!(pong["type"], "pong");
}

#[tokio::test]
async fn forced_bind_preempts_and_fails_inflight_requests() {
    let broker = start_broker(|_| {}).await;
    let token = register_domain(&broker, "demo").await;

    let mut first = connect(&broker).await;
    assert_eq!(auth(&mut first, &token, false).await["type"], "auth_ok");

    // A forward dispatched on the first session, never answered.
    let dispatcher = broker.state.dispatcher.clone();
    let inflight =
        tokio::spawn(async move { dispatcher.forward("demo", forward_request(None)).await });

    // Wait for the request frame to reach the first agent.
    let request = recv_json(&mut first).await.expect("request frame");
    assert_eq!(request["type"], "request");

    let mut second = connect(&broker).await;
    assert_eq!(auth(&mut second, &token, true).await["type"], "auth_ok");

    // The preempted session's entries fail with session_closed.
    let err = inflight.await.unwrap().unwrap_err();
    assert_eq!(err.kind, ErrorKind::SessionClosed);

    // A late reply from the first agent is discarded: the id is gone and a
    // fresh forward still reaches the second agent.
    let late = json!({
        "type": "response",
        "id": request["id"],
        "status": 200,
        "headers": {},
        "body": "late",
    });
    let _ = first.send(WsMessage::Text(late.to_string())).await;

    let dispatcher = broker.state.dispatcher.clone();
    let next =
        tokio::spawn(async move { dispatcher.forward("demo", forward_request(Some(5.0))).await });
    let request = recv_json(&mut second).await.expect("request frame");
    send_json(
        &mut second,
        json!({
            "type": "response",
            "id": request["id"],
            "status": 200,
            "headers": {},
            "body": "pong",
        }),
    )
    .await;
    match next.await.unwrap().unwrap() {
        ForwardOutcome::Unary(reply) => {
            assert_eq!(reply.status, 200);
            assert_eq!(reply.body.as_deref(), Some("pong"));
        }
        ForwardOutcome::Stream(_) => panic!("expected unary reply"),
    }
}

#[tokio::test]
async fn unary_forward_round_trip_with_log() {
    let broker = start_broker(|_| {}).await;
    let token = register_domain(&broker, "demo").await;

    let mut agent = connect(&broker).await;
    assert_eq!(auth(&mut agent, &token, false).await["type"], "auth_ok");

    let dispatcher = broker.state.dispatcher.clone();
    let forward =
        tokio::spawn(async move { dispatcher.forward("demo", forward_request(None)).await });

    let request = recv_json(&mut agent).await.expect("request frame");
    assert_eq!(request["method"], "GET");
    assert_eq!(request["path"], "/ping");
    send_json(
        &mut agent,
        json!({
            "type": "response",
            "id": request["id"],
            "status": 200,
            "headers": { "content-type": "text/plain" },
            "body": "pong",
            "duration_ms": 5,
        }),
    )
    .await;

    match forward.await.unwrap().unwrap() {
        ForwardOutcome::Unary(reply) => {
            assert_eq!(reply.status, 200);
            assert_eq!(reply.body.as_deref(), Some("pong"));
        }
        ForwardOutcome::Stream(_) => panic!("expected unary reply"),
    }

    let (total, logs) = broker
        .state
        .store
        .recent_logs("demo", 10, 0)
        .await
        .unwrap();
    assert_eq!(total, 1);
    assert_eq!(logs[0].status_code, Some(200));
    assert_eq!(logs[0].path, "/ping");
}

#[tokio::test]
async fn streamed_forward_delivers_ordered_chunks() {
    let broker = start_broker(|_| {}).await;
    let token = register_domain(&broker, "demo").await;

    let mut agent = connect(&broker).await;
    assert_eq!(auth(&mut agent, &token, false).await["type"], "auth_ok");

    let dispatcher = broker.state.dispatcher.clone();
    let forward =
        tokio::spawn(async move { dispatcher.forward("demo", forward_request(None)).await });

    let request = recv_json(&mut agent).await.expect("request frame");
    let id = request["id"].clone();
    send_json(
        &mut agent,
        json!({
            "type": "stream_start",
            "id": id,
            "status": 200,
            "headers": { "content-type": "text/event-stream" },
        }),
    )
    .await;
    for seq in 0..3 {
        send_json(
            &mut agent,
            json!({
                "type": "stream_chunk",
                "id": id,
                "data": format!("data: {seq}\n\n"),
                "sequence": seq,
            }),
        )
        .await;
    }
    send_json(
        &mut agent,
        json!({
            "type": "stream_end",
            "id": id,
            "total_chunks": 3,
            "duration_ms": 12,
        }),
    )
    .await;

    let mut stream = match forward.await.unwrap().unwrap() {
        ForwardOutcome::Stream(stream) => stream,
        ForwardOutcome::Unary(_) => panic!("expected stream reply"),
    };
    assert_eq!(stream.status, 200);

    let mut collected = String::new();
    let mut sequences = Vec::new();
    while let Some(event) = stream.events.recv().await {
        match event {
            StreamEvent::Chunk { data, sequence } => {
                sequences.push(sequence);
                collected.push_str(&data);
            }
            StreamEvent::End {
                error,
                total_chunks,
                ..
            } => {
                assert!(error.is_none());
                assert_eq!(total_chunks, Some(3));
                break;
            }
        }
    }
    assert_eq!(sequences, vec![0, 1, 2]);
    assert_eq!(collected, "data: 0\n\ndata: 1\n\ndata: 2\n\n");
    assert!(broker.state.pending.is_empty());
}

#[tokio::test]
async fn ping_from_agent_is_answered() {
    let broker = start_broker(|_| {}).await;
    let token = register_domain(&broker, "demo").await;

    let mut agent = connect(&broker).await;
    assert_eq!(auth(&mut agent, &token, false).await["type"], "auth_ok");

    send_json(&mut agent, json!({ "type": "ping" })).await;
    let reply = recv_json(&mut agent).await.expect("pong frame");
    assert_eq!(reply["type"], "pong");
}

#[tokio::test]
async fn unknown_frame_types_are_dropped_not_fatal() {
    let broker = start_broker(|_| {}).await;
    let token = register_domain(&broker, "demo").await;

    let mut agent = connect(&broker).await;
    assert_eq!(auth(&mut agent, &token, false).await["type"], "auth_ok");

    send_json(&mut agent, json!({ "type": "tcp_data", "conn_id": "c1" })).await;
    // Session is still alive.
    send_json(&mut agent, json!({ "type": "ping" })).await;
    let reply = recv_json(&mut agent).await.expect("pong frame");
    assert_eq!(reply["type"], "pong");
}

#[tokio::test]
async fn oversized_frame_closes_the_session() {
    let broker = start_broker(|config| config.max_frame_bytes = 256).await;
    let token = register_domain(&broker, "demo").await;

    let mut agent = connect(&broker).await;
    assert_eq!(auth(&mut agent, &token, false).await["type"], "auth_ok");

    let big = json!({
        "type": "response",
        "id": "r1",
        "status": 200,
        "headers": {},
        "body": "x".repeat(512),
    });
    send_json(&mut agent, big).await;
    assert!(recv_json(&mut agent).await.is_none());

    // The registry entry is gone once teardown runs.
    tokio::time::timeout(Duration::from_secs(2), async {
        while broker.state.registry.is_connected("demo") {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("session should unbind after a protocol error");
}

#[tokio::test]
async fn silent_agent_times_out_on_heartbeat() {
    let broker = start_broker(|config| config.heartbeat_interval_s = 1).await;
    let token = register_domain(&broker, "demo").await;

    let mut agent = connect(&broker).await;
    assert_eq!(auth(&mut agent, &token, false).await["type"], "auth_ok");

    // First broker-initiated ping arrives after one interval...
    let ping = recv_json(&mut agent).await.expect("broker ping");
    assert_eq!(ping["type"], "ping");

    // ...and staying silent past interval * 2.5 closes the session.
    let deadline = Duration::from_secs(5);
    tokio::time::timeout(deadline, async {
        loop {
            match recv_json(&mut agent).await {
                Some(frame) => assert_eq!(frame["type"], "ping"),
                None => break,
            }
        }
    })
    .await
    .expect("session should close after heartbeat timeout");
    assert!(!broker.state.registry.is_connected("demo"));
}
