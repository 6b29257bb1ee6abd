//! Test server harness for integration tests.
//!
//! Spins up a plain tokio-tungstenite WebSocket server on a random port.
//! Every JSON text frame a client sends is recorded. Protocol messages that
//! ask for an ACK get one, and domain messages can be echoed to every client.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;

/// Server behaviour switches.
#[derive(Debug, Clone, Copy)]
pub struct ServerOptions {
    /// Acknowledge protocol messages carrying `requiresAck`.
    pub ack: bool,
    /// Re-broadcast every domain message to all clients.
    pub echo_domain: bool,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            ack: true,
            echo_domain: false,
        }
    }
}

#[derive(Debug, Clone)]
enum ServerFrame {
    Text(String),
    Close(u16),
}

/// A test server instance with control handles.
pub struct TestServer {
    addr: SocketAddr,
    received: mpsc::UnboundedReceiver<Value>,
    outbound: broadcast::Sender<ServerFrame>,
    connections: Arc<AtomicU64>,
    shutdown_tx: Option<oneshot::Sender<()>>,
    handle: JoinHandle<()>,
}

impl TestServer {
    /// Start a server with default options.
    pub async fn start() -> Self {
        Self::start_with(ServerOptions::default()).await
    }

    /// Start a server on a random available port.
    ///
    /// # Panics
    ///
    /// Panics if no port is available or the server fails to bind.
    pub async fn start_with(options: ServerOptions) -> Self {
        let port = portpicker::pick_unused_port().expect("no available port");
        let listener = TcpListener::bind(("127.0.0.1", port))
            .await
            .expect("failed to bind");
        let addr = listener.local_addr().expect("failed to get local addr");

        let (received_tx, received) = mpsc::unbounded_channel();
        let (outbound, _) = broadcast::channel(256);
        let connections = Arc::new(AtomicU64::new(0));
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel();

        let accept_outbound = outbound.clone();
        let accept_connections = connections.clone();
        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = &mut shutdown_rx => break,
                    accepted = listener.accept() => {
                        let Ok((stream, _)) = accepted else { continue };
                        accept_connections.fetch_add(1, Ordering::SeqCst);
                        tokio::spawn(handle_client(
                            stream,
                            options,
                            received_tx.clone(),
                            accept_outbound.subscribe(),
                            accept_outbound.clone(),
                        ));
                    }
                }
            }
        });

        Self {
            addr,
            received,
            outbound,
            connections,
            shutdown_tx: Some(shutdown_tx),
            handle,
        }
    }

    /// HTTP base URL; the client derives the WebSocket URL from it.
    pub fn base_url(&self) -> String {
        format!("http://{}", self.addr)
    }

    /// TCP connections accepted so far.
    pub fn connections(&self) -> u64 {
        self.connections.load(Ordering::SeqCst)
    }

    /// Next JSON message received from any client.
    ///
    /// # Panics
    ///
    /// Panics if nothing arrives within five seconds.
    pub async fn next_received(&mut self) -> Value {
        timeout(Duration::from_secs(5), self.received.recv())
            .await
            .expect("timed out waiting for a client message")
            .expect("server stopped")
    }

    /// Next received message whose `type` or `message_type` is `kind`,
    /// skipping others.
    pub async fn next_of_type(&mut self, kind: &str) -> Value {
        loop {
            let value = self.next_received().await;
            if value["type"] == kind || value["message_type"] == kind {
                return value;
            }
        }
    }

    /// Send a JSON message to every connected client.
    pub fn push(&self, value: &Value) {
        let _ = self.outbound.send(ServerFrame::Text(value.to_string()));
    }

    /// Close every client connection with `code`.
    pub fn close_all(&self, code: u16) {
        let _ = self.outbound.send(ServerFrame::Close(code));
    }

    /// Stop accepting connections.
    pub async fn shutdown(mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        let _ = timeout(Duration::from_secs(5), self.handle).await;
    }
}

static SERVER_MESSAGE_ID: AtomicU64 = AtomicU64::new(1);

fn server_ack(message_id: &Value) -> Value {
    json!({
        "id": format!("srv-{}", SERVER_MESSAGE_ID.fetch_add(1, Ordering::SeqCst)),
        "type": "ack",
        "timestamp": diagram_core::current_timestamp(),
        "data": { "message_id": message_id },
    })
}

async fn handle_client(
    stream: TcpStream,
    options: ServerOptions,
    received: mpsc::UnboundedSender<Value>,
    mut outbound: broadcast::Receiver<ServerFrame>,
    echo: broadcast::Sender<ServerFrame>,
) {
    let Ok(ws) = tokio_tungstenite::accept_async(stream).await else {
        return;
    };
    let (mut sink, mut source) = ws.split();

    loop {
        tokio::select! {
            frame = source.next() => match frame {
                Some(Ok(Message::Text(text))) => {
                    let Ok(value) = serde_json::from_str::<Value>(&text) else { continue };
                    if options.ack && value["requiresAck"] == true && value["type"] != "ack" {
                        let ack = server_ack(&value["id"]);
                        if sink.send(Message::Text(ack.to_string())).await.is_err() {
                            break;
                        }
                    }
                    if options.echo_domain && value.get("message_type").is_some() {
                        let _ = echo.send(ServerFrame::Text(text.to_string()));
                    }
                    let _ = received.send(value);
                }
                Some(Ok(Message::Close(_)) | Err(_)) | None => break,
                Some(Ok(_)) => {}
            },
            frame = outbound.recv() => match frame {
                Ok(ServerFrame::Text(text)) => {
                    if sink.send(Message::Text(text)).await.is_err() {
                        break;
                    }
                }
                Ok(ServerFrame::Close(code)) => {
                    let frame = CloseFrame {
                        code: CloseCode::from(code),
                        reason: "closed by test".into(),
                    };
                    let _ = sink.send(Message::Close(Some(frame))).await;
                    break;
                }
                Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => break,
            },
        }
    }
}
