//! Wire message model and inbound decoding.
//!
//! Two families share the socket:
//!
//! - protocol messages: an envelope `{id, type, sessionId?, userId?,
//!   timestamp, data, requiresAck?}` where `type` is a [`MessageType`];
//! - domain messages: collaboration payloads discriminated by
//!   `message_type` (or the legacy `event` key), see [`DomainMessage`].
//!
//! [`InboundMessage::decode`] tells them apart once, at the boundary.

use std::fmt;
use std::str::FromStr;

use diagram_core::{CellOperation, CellOperationKind};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::chunker::ChunkedMessage;
use crate::error::SyncError;
use crate::validation::{
    require_non_empty, validate_cell_id, ValidationError, MAX_CHUNKS_PER_SET,
    MAX_OPERATIONS_PER_MESSAGE,
};

/// Protocol message types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    /// Acknowledges `data.message_id`.
    Ack,
    /// Liveness probe.
    Ping,
    /// Reply to a ping.
    Pong,
    /// Request expecting a correlated response.
    Request,
    /// Response to a request (`data.request_id`).
    Response,
    /// Server notification.
    Notification,
    /// A participant joined.
    SessionJoin,
    /// A participant left.
    SessionLeave,
    /// Presence update.
    Presence,
    /// Protocol-level error.
    Error,
}

impl MessageType {
    /// Every protocol type.
    pub const ALL: [Self; 10] = [
        Self::Ack,
        Self::Ping,
        Self::Pong,
        Self::Request,
        Self::Response,
        Self::Notification,
        Self::SessionJoin,
        Self::SessionLeave,
        Self::Presence,
        Self::Error,
    ];

    /// Wire name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Ack => "ack",
            Self::Ping => "ping",
            Self::Pong => "pong",
            Self::Request => "request",
            Self::Response => "response",
            Self::Notification => "notification",
            Self::SessionJoin => "session_join",
            Self::SessionLeave => "session_leave",
            Self::Presence => "presence",
            Self::Error => "error",
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MessageType {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| SyncError::ParseError(format!("unknown message type '{s}'")))
    }
}

/// Protocol envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    /// Message ID; assigned on send when empty.
    #[serde(default)]
    pub id: String,
    /// Protocol type.
    #[serde(rename = "type")]
    pub message_type: MessageType,
    /// Collaboration session.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    /// Sender.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    /// Milliseconds since epoch; assigned on send when zero.
    #[serde(default)]
    pub timestamp: u64,
    /// Type-specific payload (always an object).
    #[serde(default = "empty_object")]
    pub data: Value,
    /// Whether the receiver must acknowledge.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub requires_ack: bool,
}

fn empty_object() -> Value {
    Value::Object(Map::new())
}

impl Message {
    /// New message with the given payload; `id` and `timestamp` are filled
    /// in by the connection manager.
    #[must_use]
    pub fn new(message_type: MessageType, data: Value) -> Self {
        Self {
            id: String::new(),
            message_type,
            session_id: None,
            user_id: None,
            timestamp: 0,
            data,
            requires_ack: false,
        }
    }

    /// Ask the receiver to acknowledge this message.
    #[must_use]
    pub fn requiring_ack(mut self) -> Self {
        self.requires_ack = true;
        self
    }

    /// Attach a session ID.
    #[must_use]
    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    /// Attach a user ID.
    #[must_use]
    pub fn with_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    /// Acknowledgement of `message_id`.
    #[must_use]
    pub fn ack(message_id: &str) -> Self {
        Self::new(MessageType::Ack, serde_json::json!({ "message_id": message_id }))
    }

    /// String field of `data`.
    #[must_use]
    pub fn data_str(&self, key: &str) -> Option<&str> {
        self.data.get(key).and_then(Value::as_str)
    }

    /// Envelope checks applied to every inbound protocol message.
    ///
    /// # Errors
    ///
    /// Returns a [`ValidationError`] for an empty id, a zero timestamp, a
    /// non-object `data`, or an ack without `message_id`.
    pub fn validate(&self) -> Result<(), ValidationError> {
        require_non_empty("id", &self.id)?;
        if self.timestamp == 0 {
            return Err(ValidationError::Empty("timestamp"));
        }
        if !self.data.is_object() {
            return Err(ValidationError::Empty("data"));
        }
        if self.message_type == MessageType::Ack {
            require_non_empty("message_id", self.data_str("message_id").unwrap_or_default())?;
        }
        Ok(())
    }
}

/// A participant's identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    /// Stable user ID.
    pub user_id: String,
    /// Contact address.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    /// Display name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

/// A session participant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Participant {
    /// Who.
    pub user: User,
    /// `reader` or `writer`.
    pub permissions: String,
    /// Last activity (RFC 3339).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_activity: Option<String>,
}

/// Cursor position in diagram coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CursorPosition {
    /// Horizontal.
    pub x: f64,
    /// Vertical.
    pub y: f64,
}

/// Cell operations carried by a `diagram_operation`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CellPatch {
    /// Always `"patch"`.
    #[serde(rename = "type")]
    pub patch_type: String,
    /// Operations in application order.
    pub cells: Vec<CellOperation>,
}

impl CellPatch {
    /// Wrap an operation list.
    #[must_use]
    pub fn new(cells: Vec<CellOperation>) -> Self {
        Self {
            patch_type: "patch".to_string(),
            cells,
        }
    }
}

/// Collaboration messages, discriminated by `message_type`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "message_type", rename_all = "snake_case")]
pub enum DomainMessage {
    /// Cell changes made by a participant.
    DiagramOperation {
        /// Who made the change (set by the server on broadcast).
        #[serde(default, skip_serializing_if = "Option::is_none")]
        initiating_user: Option<User>,
        /// Client-generated operation ID.
        operation_id: String,
        /// Server-assigned ordering.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        sequence_number: Option<u64>,
        /// The operations.
        operation: CellPatch,
    },
    /// Ask the server to undo the session's last change.
    UndoRequest {
        /// Requester.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        initiating_user: Option<User>,
    },
    /// Ask the server to redo the session's last undone change.
    RedoRequest {
        /// Requester.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        initiating_user: Option<User>,
    },
    /// Outcome of a session-level undo/redo.
    HistoryOperation {
        /// `undo` or `redo`.
        operation_type: String,
        /// Outcome description.
        message: String,
    },
    /// Ask the server for a fresh copy of the diagram.
    ResyncRequest {
        /// Requester.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        initiating_user: Option<User>,
    },
    /// Tells the client how to resync.
    ResyncResponse {
        /// Resync method, e.g. `rest_api`.
        method: String,
        /// Diagram to reload.
        diagram_id: String,
        /// Owning threat model.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        threat_model_id: Option<String>,
    },
    /// The server's update vector differs from ours.
    StateCorrection {
        /// Authoritative update vector.
        update_vector: u64,
    },
    /// Current participant list.
    ParticipantsUpdate {
        /// Everyone in the session.
        participants: Vec<Participant>,
        /// Session host.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        host: Option<String>,
        /// Who is presenting.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        current_presenter: Option<String>,
    },
    /// Presenter's cursor moved.
    PresenterCursor {
        /// New position.
        cursor_position: CursorPosition,
    },
    /// The server refused one of our operations for lack of permission.
    AuthorizationDenied {
        /// The refused operation.
        original_operation_id: String,
        /// Why.
        reason: String,
    },
    /// The server refused one of our operations as invalid.
    OperationRejected {
        /// The refused operation.
        operation_id: String,
        /// Machine-readable reason.
        reason: String,
        /// Human-readable detail.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
    /// One slice of an oversized message.
    ChunkedMessage(ChunkedMessage),
    /// Server-side error.
    Error {
        /// Error code.
        error: String,
        /// Detail.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
}

impl DomainMessage {
    /// Wire discriminator.
    #[must_use]
    pub const fn message_type(&self) -> &'static str {
        match self {
            Self::DiagramOperation { .. } => "diagram_operation",
            Self::UndoRequest { .. } => "undo_request",
            Self::RedoRequest { .. } => "redo_request",
            Self::HistoryOperation { .. } => "history_operation",
            Self::ResyncRequest { .. } => "resync_request",
            Self::ResyncResponse { .. } => "resync_response",
            Self::StateCorrection { .. } => "state_correction",
            Self::ParticipantsUpdate { .. } => "participants_update",
            Self::PresenterCursor { .. } => "presenter_cursor",
            Self::AuthorizationDenied { .. } => "authorization_denied",
            Self::OperationRejected { .. } => "operation_rejected",
            Self::ChunkedMessage(_) => crate::chunker::CHUNKED_MESSAGE_TYPE,
            Self::Error { .. } => "error",
        }
    }

    /// Type-specific structural rules.
    ///
    /// # Errors
    ///
    /// Returns the first rule the message breaks.
    pub fn validate(&self) -> Result<(), ValidationError> {
        match self {
            Self::DiagramOperation {
                operation_id,
                operation,
                ..
            } => {
                require_non_empty("operation_id", operation_id)?;
                if operation.cells.is_empty() {
                    return Err(ValidationError::Empty("operation.cells"));
                }
                if operation.cells.len() > MAX_OPERATIONS_PER_MESSAGE {
                    return Err(ValidationError::TooManyOperations);
                }
                for op in &operation.cells {
                    validate_cell_id(&op.id)?;
                    let data_ok = match op.operation {
                        CellOperationKind::Remove => true,
                        CellOperationKind::Add | CellOperationKind::Update => {
                            op.data.as_ref().is_some_and(|cell| cell.id == op.id)
                        }
                    };
                    if !data_ok {
                        return Err(ValidationError::MissingOperationData(op.id.clone()));
                    }
                }
                Ok(())
            }
            Self::HistoryOperation { operation_type, .. } => {
                require_non_empty("operation_type", operation_type)
            }
            Self::ResyncResponse { diagram_id, .. } => require_non_empty("diagram_id", diagram_id),
            Self::ParticipantsUpdate { participants, .. } => participants
                .iter()
                .try_for_each(|p| require_non_empty("participants.user.user_id", &p.user.user_id)),
            Self::PresenterCursor { cursor_position } => {
                if cursor_position.x.is_finite() && cursor_position.y.is_finite() {
                    Ok(())
                } else {
                    Err(ValidationError::NotFinite("cursor_position"))
                }
            }
            Self::AuthorizationDenied {
                original_operation_id,
                ..
            } => require_non_empty("original_operation_id", original_operation_id),
            Self::OperationRejected { operation_id, .. } => {
                require_non_empty("operation_id", operation_id)
            }
            Self::ChunkedMessage(chunk) => {
                let info = &chunk.chunk_info;
                require_non_empty("chunk_info.chunk_id", &info.chunk_id)?;
                if info.total_chunks == 0 || info.chunk_index >= info.total_chunks {
                    return Err(ValidationError::InvalidChunk(format!(
                        "index {} of {}",
                        info.chunk_index, info.total_chunks
                    )));
                }
                if info.total_chunks > MAX_CHUNKS_PER_SET {
                    return Err(ValidationError::InvalidChunk(format!(
                        "{} chunks exceeds the limit of {MAX_CHUNKS_PER_SET}",
                        info.total_chunks
                    )));
                }
                Ok(())
            }
            Self::Error { error, .. } => require_non_empty("error", error),
            Self::UndoRequest { .. }
            | Self::RedoRequest { .. }
            | Self::ResyncRequest { .. }
            | Self::StateCorrection { .. } => Ok(()),
        }
    }
}

/// A decoded inbound frame.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundMessage {
    /// Protocol envelope.
    Protocol(Message),
    /// Collaboration payload.
    Domain(DomainMessage),
}

impl InboundMessage {
    /// Decode a text frame.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::ParseError`] for invalid JSON, an unknown type or
    /// discriminator, or a shape that matches neither family.
    pub fn decode(text: &str) -> Result<Self, SyncError> {
        let value: Value = serde_json::from_str(text)?;
        let Value::Object(mut map) = value else {
            return Err(SyncError::ParseError("expected a JSON object".to_string()));
        };

        if !map.contains_key("message_type") {
            if let Some(event) = map.remove("event") {
                map.insert("message_type".to_string(), event);
            }
        }
        if map.contains_key("message_type") {
            let message = serde_json::from_value(Value::Object(map))?;
            return Ok(Self::Domain(message));
        }

        match map.get("type") {
            Some(Value::String(kind)) => {
                kind.parse::<MessageType>()?;
                let message = serde_json::from_value(Value::Object(map))?;
                Ok(Self::Protocol(message))
            }
            Some(_) => Err(SyncError::ParseError("'type' must be a string".to_string())),
            None => Err(SyncError::ParseError(
                "message has neither 'type' nor 'message_type'".to_string(),
            )),
        }
    }
}
