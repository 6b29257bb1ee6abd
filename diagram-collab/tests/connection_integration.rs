//! Connection manager integration tests.
//!
//! Runs the real WebSocket connector against a local tokio-tungstenite
//! server.

mod common;

use std::sync::Arc;
use std::time::Duration;

use diagram_collab::{
    apply_remote_operations, session_url, CellPatch, ConnectionConfig, ConnectionEvent,
    ConnectionManager, ConnectionState, DomainMessage, Message, MessageType, SharedGraph,
    StaticTokenProvider, User,
};
use diagram_core::{Cell, CellOperation, CellOperationKind};
use serde_json::json;
use tokio::sync::broadcast;
use tokio::time::timeout;

use common::{ServerOptions, TestServer};

fn config() -> ConnectionConfig {
    let mut config = ConnectionConfig::default();
    config.connect_timeout_ms = 2_000;
    config.ack_timeout_ms = 2_000;
    config.reconnect.base_delay_ms = 50;
    config.reconnect.max_delay_ms = 200;
    config
}

async fn connect(server: &TestServer, config: ConnectionConfig) -> ConnectionManager {
    let manager = ConnectionManager::websocket(
        config,
        Some(Arc::new(StaticTokenProvider::new("integration-token"))),
    );
    let url = session_url(&server.base_url(), "diagram-1").expect("url");
    manager.connect(url.as_str()).await.expect("connect");
    assert_eq!(manager.state(), ConnectionState::Connected);
    manager
}

async fn wait_for_state(
    events: &mut broadcast::Receiver<ConnectionEvent>,
    wanted: ConnectionState,
) {
    timeout(Duration::from_secs(5), async {
        loop {
            if let Ok(ConnectionEvent::StateChanged { to, .. }) = events.recv().await {
                if to == wanted {
                    return;
                }
            }
        }
    })
    .await
    .unwrap_or_else(|_| panic!("never reached {wanted}"));
}

fn add_op(id: &str, label: &str) -> CellOperation {
    CellOperation {
        id: id.to_string(),
        operation: CellOperationKind::Add,
        data: Some(Cell::node(id, "process").with_attribute("label", json!(label))),
    }
}

#[tokio::test]
async fn test_acknowledged_send() {
    let mut server = TestServer::start().await;
    let manager = connect(&server, config()).await;

    manager
        .send(Message::new(MessageType::Notification, json!({ "note": "hello" })).requiring_ack())
        .await
        .expect("server acknowledges");

    let received = server.next_of_type("notification").await;
    assert_eq!(received["data"]["note"], "hello");
    assert_eq!(received["requiresAck"], true);
    assert!(!received["id"].as_str().unwrap_or_default().is_empty());
    assert_eq!(manager.pending_ack_count(), 0);

    manager.disconnect();
    server.shutdown().await;
}

#[tokio::test]
async fn test_unacknowledged_send_times_out() {
    let server = TestServer::start_with(ServerOptions {
        ack: false,
        echo_domain: false,
    })
    .await;
    let mut config = config();
    config.ack_timeout_ms = 100;
    let manager = connect(&server, config).await;

    let err = manager
        .send(Message::new(MessageType::Request, json!({})).requiring_ack())
        .await
        .expect_err("no ACK");
    assert!(err.is_retryable());
    assert_eq!(manager.pending_ack_count(), 0);
    assert!(manager.is_connected());

    manager.disconnect();
    server.shutdown().await;
}

#[tokio::test]
async fn test_chunked_round_trip() {
    let mut server = TestServer::start_with(ServerOptions {
        ack: true,
        echo_domain: true,
    })
    .await;
    let mut config = config();
    config.chunking.max_message_bytes = 2_048;
    config.chunking.chunk_size_bytes = 512;
    config.chunking.send_delay_ms = 0;
    let manager = connect(&server, config).await;
    let mut domain = manager.subscribe_domain();

    let cells: Vec<CellOperation> = (0..40)
        .map(|i| add_op(&format!("n{i}"), &"long label ".repeat(8)))
        .collect();
    let sent = DomainMessage::DiagramOperation {
        initiating_user: None,
        operation_id: "op-large".into(),
        sequence_number: None,
        operation: CellPatch::new(cells),
    };
    manager.send_domain(sent.clone()).await.expect("send");

    let first = server.next_received().await;
    assert_eq!(first["message_type"], "chunked_message");
    let total = first["chunk_info"]["total_chunks"].as_u64().expect("total");
    assert!(total > 1);

    let echoed = timeout(Duration::from_secs(5), domain.recv())
        .await
        .expect("reassembled in time")
        .expect("domain message");
    assert_eq!(echoed, sent);
    assert_eq!(manager.pending_chunk_sets(), 0);

    manager.disconnect();
    server.shutdown().await;
}

#[tokio::test]
async fn test_remote_operation_applies_to_graph() {
    let server = TestServer::start().await;
    let manager = connect(&server, config()).await;
    let mut domain = manager.subscribe_domain();
    let graph = SharedGraph::new();

    let remote = DomainMessage::DiagramOperation {
        initiating_user: Some(User {
            user_id: "u2".into(),
            email: None,
            name: Some("Peer".into()),
        }),
        operation_id: "op-7".into(),
        sequence_number: Some(7),
        operation: CellPatch::new(vec![add_op("n1", "Web server")]),
    };
    server.push(&serde_json::to_value(&remote).expect("encode"));

    let received = timeout(Duration::from_secs(5), domain.recv())
        .await
        .expect("delivered")
        .expect("domain message");
    let DomainMessage::DiagramOperation {
        operation_id,
        operation,
        ..
    } = received
    else {
        panic!("unexpected message: {received:?}");
    };
    apply_remote_operations(&graph, &operation_id, &operation.cells)
        .await
        .expect("apply");
    let cell = graph.get("n1").expect("cell applied");
    assert_eq!(cell.attribute("label"), Some(&json!("Web server")));

    manager.disconnect();
    server.shutdown().await;
}

#[tokio::test]
async fn test_ping_is_answered() {
    let mut server = TestServer::start().await;
    let manager = connect(&server, config()).await;

    server.push(&json!({
        "id": "ping-1",
        "type": "ping",
        "timestamp": 1,
        "data": { "nonce": 42 }
    }));
    let pong = server.next_of_type("pong").await;
    assert_eq!(pong["data"]["nonce"], 42);

    manager.disconnect();
    server.shutdown().await;
}

#[tokio::test]
async fn test_server_close_reconnects() {
    let server = TestServer::start().await;
    let manager = connect(&server, config()).await;
    let mut events = manager.subscribe_events();

    server.close_all(1011);
    wait_for_state(&mut events, ConnectionState::Reconnecting).await;
    wait_for_state(&mut events, ConnectionState::Connected).await;
    assert_eq!(server.connections(), 2);
    assert_eq!(manager.reconnect_attempts(), 0);

    manager.disconnect();
    server.shutdown().await;
}

#[tokio::test]
async fn test_auth_close_fails_without_retry() {
    let server = TestServer::start().await;
    let manager = connect(&server, config()).await;
    let mut events = manager.subscribe_events();

    server.close_all(4001);
    wait_for_state(&mut events, ConnectionState::Failed).await;
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(server.connections(), 1);
    assert_eq!(manager.state(), ConnectionState::Failed);

    server.shutdown().await;
}

#[tokio::test]
async fn test_client_disconnect_is_clean() {
    let server = TestServer::start().await;
    let manager = connect(&server, config()).await;
    let mut events = manager.subscribe_events();

    manager.disconnect();
    wait_for_state(&mut events, ConnectionState::Disconnected).await;
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(server.connections(), 1);
    assert!(manager
        .send(Message::new(MessageType::Notification, json!({})))
        .await
        .is_err());

    server.shutdown().await;
}
