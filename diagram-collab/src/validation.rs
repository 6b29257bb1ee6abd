//! Input validation for untrusted data.
//!
//! Everything received from a peer goes through these checks before it
//! reaches a subscriber or the operation executor.

use thiserror::Error;

/// Maximum length for diagram and session IDs.
pub const MAX_SESSION_ID_LEN: usize = 128;
/// Maximum length for cell IDs (UUIDs are 36 chars).
pub const MAX_CELL_ID_LEN: usize = 128;
/// Maximum cell operations in one `diagram_operation` message.
pub const MAX_OPERATIONS_PER_MESSAGE: usize = 10_000;
/// Maximum inbound WebSocket frame size.
pub const MAX_WS_MESSAGE_SIZE: usize = 16 * 1024 * 1024; // 16MB
/// Hard ceiling on `total_chunks` for any inbound chunk set.
pub const MAX_CHUNKS_PER_SET: usize = 16_384;

/// Validation error types.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    /// Session or diagram ID exceeds maximum length.
    #[error("session_id too long (max {MAX_SESSION_ID_LEN} chars)")]
    SessionIdTooLong,
    /// Session or diagram ID is empty or contains invalid characters.
    #[error("session_id contains invalid characters")]
    SessionIdInvalidChars,
    /// Cell ID exceeds maximum length.
    #[error("cell id too long (max {MAX_CELL_ID_LEN} chars)")]
    CellIdTooLong,
    /// Cell ID is empty or contains invalid characters.
    #[error("cell id '{0}' contains invalid characters")]
    CellIdInvalidChars(String),
    /// A required field was empty.
    #[error("{0} must not be empty")]
    Empty(&'static str),
    /// Too many operations in a single message.
    #[error("too many operations (max {MAX_OPERATIONS_PER_MESSAGE})")]
    TooManyOperations,
    /// An add/update carried no cell data, or its data names another cell.
    #[error("operation on '{0}' has missing or mismatched data")]
    MissingOperationData(String),
    /// Chunk metadata is inconsistent.
    #[error("invalid chunk metadata: {0}")]
    InvalidChunk(String),
    /// A number was NaN or infinite.
    #[error("{0} must be finite")]
    NotFinite(&'static str),
    /// Inbound frame exceeds maximum size.
    #[error("message too large (max {MAX_WS_MESSAGE_SIZE} bytes)")]
    MessageTooLarge,
}

fn is_valid_id_char(c: char) -> bool {
    c.is_alphanumeric() || c == '-' || c == '_'
}

/// Validate a diagram or session ID.
///
/// # Errors
///
/// Returns [`ValidationError::SessionIdTooLong`] past
/// [`MAX_SESSION_ID_LEN`], or [`ValidationError::SessionIdInvalidChars`] if
/// the ID is empty or contains anything but alphanumerics, `-` and `_`.
pub fn validate_session_id(id: &str) -> Result<(), ValidationError> {
    if id.len() > MAX_SESSION_ID_LEN {
        return Err(ValidationError::SessionIdTooLong);
    }
    if id.is_empty() || !id.chars().all(is_valid_id_char) {
        return Err(ValidationError::SessionIdInvalidChars);
    }
    Ok(())
}

/// Validate a cell ID.
///
/// Cell IDs are generated by the graph library and may contain `.` or `:`
/// in addition to the session ID alphabet.
///
/// # Errors
///
/// Returns an error if the ID is empty, too long or contains control or
/// whitespace characters.
pub fn validate_cell_id(id: &str) -> Result<(), ValidationError> {
    if id.len() > MAX_CELL_ID_LEN {
        return Err(ValidationError::CellIdTooLong);
    }
    if id.is_empty()
        || !id
            .chars()
            .all(|c| is_valid_id_char(c) || c == '.' || c == ':')
    {
        return Err(ValidationError::CellIdInvalidChars(id.to_string()));
    }
    Ok(())
}

/// Validate an inbound frame size.
///
/// # Errors
///
/// Returns [`ValidationError::MessageTooLarge`] past [`MAX_WS_MESSAGE_SIZE`].
pub fn validate_message_size(len: usize) -> Result<(), ValidationError> {
    if len > MAX_WS_MESSAGE_SIZE {
        return Err(ValidationError::MessageTooLarge);
    }
    Ok(())
}

/// Reject empty required strings.
///
/// # Errors
///
/// Returns [`ValidationError::Empty`] naming `field`.
pub fn require_non_empty(field: &'static str, value: &str) -> Result<(), ValidationError> {
    if value.trim().is_empty() {
        return Err(ValidationError::Empty(field));
    }
    Ok(())
}
