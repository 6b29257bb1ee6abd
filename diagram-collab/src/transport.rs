//! Transport abstraction under the connection manager.
//!
//! A [`Connector`] opens one duplex text link. The connection manager owns
//! the link and never sees the socket itself, which keeps the state machine
//! testable against an in-memory connector.

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{header::AUTHORIZATION, HeaderValue, StatusCode};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::{self, Message as WsMessage};
use url::Url;

use crate::error::SyncError;
use crate::validation::validate_session_id;

/// Normal closure.
pub const CLOSE_NORMAL: u16 = 1000;
/// Endpoint going away.
pub const CLOSE_GOING_AWAY: u16 = 1001;
/// Close frame carried no status.
pub const CLOSE_NO_STATUS: u16 = 1005;
/// Link dropped without a close frame.
pub const CLOSE_ABNORMAL: u16 = 1006;
/// Policy violation, used by servers to reject credentials mid-session.
pub const CLOSE_POLICY_VIOLATION: u16 = 1008;

/// Application close codes (4000-4999) that mean "unauthorized".
const CLOSE_APP_UNAUTHORIZED: std::ops::RangeInclusive<u16> = 4001..=4003;

/// Whether a close code means the server rejected our credentials.
#[must_use]
pub fn is_auth_close_code(code: u16) -> bool {
    code == CLOSE_POLICY_VIOLATION || CLOSE_APP_UNAUTHORIZED.contains(&code)
}

/// Outbound frame handed to the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// A text message.
    Text(String),
    /// Close the link with the given code.
    Close {
        /// WebSocket close code.
        code: u16,
        /// Close reason.
        reason: String,
    },
}

/// Something the transport observed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// A text message arrived.
    Text(String),
    /// The link closed.
    Closed {
        /// WebSocket close code.
        code: u16,
        /// Close reason.
        reason: String,
    },
    /// The link failed.
    Error(String),
}

/// An open link: a sender for frames and a receiver for events.
#[derive(Debug)]
pub struct TransportLink {
    /// Frames to send.
    pub outbound: mpsc::UnboundedSender<Frame>,
    /// Events observed on the link.
    pub inbound: mpsc::UnboundedReceiver<TransportEvent>,
}

/// Why a link could not be opened.
#[derive(Debug, Clone, Error)]
pub enum TransportError {
    /// Credentials were rejected (HTTP 401/403 on upgrade).
    #[error("authentication rejected: {0}")]
    Unauthorized(String),
    /// Network-level failure (refused, reset, DNS, TLS).
    #[error("network error: {0}")]
    Network(String),
    /// The request could not be built.
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    /// Anything else.
    #[error("{0}")]
    Other(String),
}

/// Opens transport links.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Open a link to `url`, presenting `token` as a bearer credential.
    async fn open(&self, url: &Url, token: Option<String>) -> Result<TransportLink, TransportError>;
}

/// WebSocket connector built on `tokio-tungstenite`.
#[derive(Debug, Clone, Copy, Default)]
pub struct WebSocketConnector;

#[async_trait]
impl Connector for WebSocketConnector {
    async fn open(&self, url: &Url, token: Option<String>) -> Result<TransportLink, TransportError> {
        let mut request = url
            .as_str()
            .into_client_request()
            .map_err(|e| TransportError::InvalidRequest(e.to_string()))?;
        if let Some(token) = token {
            let value = HeaderValue::from_str(&format!("Bearer {token}"))
                .map_err(|e| TransportError::InvalidRequest(e.to_string()))?;
            request.headers_mut().insert(AUTHORIZATION, value);
        }

        let (stream, response) = tokio_tungstenite::connect_async(request)
            .await
            .map_err(classify)?;
        tracing::debug!(status = %response.status(), "WebSocket upgrade complete");

        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (in_tx, in_rx) = mpsc::unbounded_channel();
        tokio::spawn(pump(stream, out_rx, in_tx));

        Ok(TransportLink {
            outbound: out_tx,
            inbound: in_rx,
        })
    }
}

fn classify(err: tungstenite::Error) -> TransportError {
    match err {
        tungstenite::Error::Http(response) => {
            let status = response.status();
            if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
                TransportError::Unauthorized(format!("server answered {status}"))
            } else {
                TransportError::Other(format!("upgrade rejected with {status}"))
            }
        }
        tungstenite::Error::Io(e) => TransportError::Network(e.to_string()),
        tungstenite::Error::Tls(e) => TransportError::Network(e.to_string()),
        tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed => {
            TransportError::Network("connection closed during handshake".to_string())
        }
        tungstenite::Error::Url(e) => TransportError::InvalidRequest(e.to_string()),
        other => TransportError::Other(other.to_string()),
    }
}

/// Shuttle frames between the socket and the link channels until either side ends.
async fn pump<S>(
    stream: tokio_tungstenite::WebSocketStream<S>,
    mut outbound: mpsc::UnboundedReceiver<Frame>,
    inbound: mpsc::UnboundedSender<TransportEvent>,
) where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    let (mut write, mut read) = stream.split();
    loop {
        tokio::select! {
            frame = outbound.recv() => match frame {
                Some(Frame::Text(text)) => {
                    if let Err(e) = write.send(WsMessage::Text(text)).await {
                        let _ = inbound.send(TransportEvent::Error(format!("send error: {e}")));
                        break;
                    }
                }
                Some(Frame::Close { code, reason }) => {
                    let frame = CloseFrame {
                        code: CloseCode::from(code),
                        reason: reason.clone().into(),
                    };
                    let _ = write.send(WsMessage::Close(Some(frame))).await;
                    let _ = inbound.send(TransportEvent::Closed { code, reason });
                    break;
                }
                // Manager dropped the link.
                None => {
                    let _ = write.close().await;
                    break;
                }
            },
            message = read.next() => match message {
                Some(Ok(WsMessage::Text(text))) => {
                    if inbound.send(TransportEvent::Text(text)).is_err() {
                        break;
                    }
                }
                Some(Ok(WsMessage::Close(frame))) => {
                    let (code, reason) = frame.map_or((CLOSE_NO_STATUS, String::new()), |f| {
                        (u16::from(f.code), f.reason.to_string())
                    });
                    let _ = inbound.send(TransportEvent::Closed { code, reason });
                    break;
                }
                Some(Ok(WsMessage::Binary(bytes))) => {
                    tracing::debug!(len = bytes.len(), "Ignoring binary frame");
                }
                // Ping/pong are answered by tungstenite.
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    let _ = inbound.send(TransportEvent::Error(format!("read error: {e}")));
                    break;
                }
                None => {
                    let _ = inbound.send(TransportEvent::Closed {
                        code: CLOSE_ABNORMAL,
                        reason: "stream ended".to_string(),
                    });
                    break;
                }
            },
        }
    }
}

/// Collaboration endpoint for `diagram_id` under an HTTP(S) or WS(S) base URL.
///
/// `http` maps to `ws` and `https` to `wss`; the path becomes
/// `/ws/diagrams/{diagram_id}` below any existing base path.
///
/// # Errors
///
/// Returns [`SyncError::InvalidUrl`] for an unparseable base, an unsupported
/// scheme, or an invalid diagram ID.
pub fn session_url(base: &str, diagram_id: &str) -> Result<Url, SyncError> {
    validate_session_id(diagram_id).map_err(|e| SyncError::InvalidUrl(e.to_string()))?;
    let mut url = Url::parse(base).map_err(|e| SyncError::InvalidUrl(format!("{base}: {e}")))?;
    let scheme = match url.scheme() {
        "http" | "ws" => "ws",
        "https" | "wss" => "wss",
        other => return Err(SyncError::InvalidUrl(format!("unsupported scheme '{other}'"))),
    };
    url.set_scheme(scheme)
        .map_err(|()| SyncError::InvalidUrl(format!("cannot switch {base} to {scheme}")))?;
    url.path_segments_mut()
        .map_err(|()| SyncError::InvalidUrl(format!("{base} cannot be a base URL")))?
        .pop_if_empty()
        .extend(["ws", "diagrams", diagram_id]);
    url.set_query(None);
    url.set_fragment(None);
    Ok(url)
}
