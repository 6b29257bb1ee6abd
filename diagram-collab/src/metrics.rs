//! Metrics for the collaboration layer.
//!
//! Recorded through the `metrics` facade; installing a recorder is left to
//! the embedding application.

use metrics::{counter, gauge};

// Metric names as constants for consistency
const WS_MESSAGES_TOTAL: &str = "collab_ws_messages_total";
const CONNECTION_STATE: &str = "collab_connection_state";
const STATE_TRANSITIONS_TOTAL: &str = "collab_state_transitions_total";
const RECONNECT_ATTEMPTS_TOTAL: &str = "collab_reconnect_attempts_total";
const ACK_TIMEOUTS_TOTAL: &str = "collab_ack_timeouts_total";
const INBOUND_REJECTED_TOTAL: &str = "collab_inbound_rejected_total";
const CHUNKS_SENT_TOTAL: &str = "collab_chunks_sent_total";
const CHUNK_SETS_TOTAL: &str = "collab_chunk_sets_total";
const HISTORY_OPERATIONS_TOTAL: &str = "collab_history_operations_total";
const BATCH_FLUSHES_TOTAL: &str = "collab_batch_flushes_total";
const BATCH_OPERATIONS_TOTAL: &str = "collab_batch_operations_total";

/// Record a WebSocket message.
///
/// # Arguments
///
/// * `direction` - "inbound" or "outbound"
/// * `message_type` - protocol type or domain `message_type`
pub fn record_ws_message(direction: &'static str, message_type: &str) {
    counter!(
        WS_MESSAGES_TOTAL,
        "direction" => direction,
        "type" => message_type.to_string()
    )
    .increment(1);
}

/// Record a connection state transition.
///
/// The gauge holds the numeric state (0=disconnected, 1=connecting,
/// 2=connected, 3=reconnecting, 4=error, 5=failed).
pub fn record_state_transition(to: &'static str, code: u8) {
    counter!(STATE_TRANSITIONS_TOTAL, "to" => to).increment(1);
    gauge!(CONNECTION_STATE).set(f64::from(code));
}

/// Record a reconnection attempt.
pub fn record_reconnect_attempt() {
    counter!(RECONNECT_ATTEMPTS_TOTAL).increment(1);
}

/// Record an ACK that never arrived.
pub fn record_ack_timeout() {
    counter!(ACK_TIMEOUTS_TOTAL).increment(1);
}

/// Record an inbound message dropped by decoding or validation.
pub fn record_inbound_rejected(reason: &'static str) {
    counter!(INBOUND_REJECTED_TOTAL, "reason" => reason).increment(1);
}

/// Record chunks sent for one logical message.
pub fn record_chunks_sent(count: usize) {
    counter!(CHUNKS_SENT_TOTAL).increment(count as u64);
}

/// Record the fate of an inbound chunk set ("reassembled" or "discarded").
pub fn record_chunk_set(outcome: &'static str) {
    counter!(CHUNK_SETS_TOTAL, "outcome" => outcome).increment(1);
}

/// Record an undo/redo execution.
pub fn record_history_operation(kind: &'static str, success: bool) {
    counter!(
        HISTORY_OPERATIONS_TOTAL,
        "kind" => kind,
        "success" => if success { "true" } else { "false" }
    )
    .increment(1);
}

/// Record a persistence batch flush.
///
/// # Arguments
///
/// * `strategy` - "push" or "rest"
/// * `outcome` - "saved", "failed" or "discarded"
/// * `operations` - cell operations in the batch
pub fn record_batch_flush(strategy: &'static str, outcome: &'static str, operations: usize) {
    counter!(BATCH_FLUSHES_TOTAL, "strategy" => strategy, "outcome" => outcome).increment(1);
    counter!(BATCH_OPERATIONS_TOTAL, "strategy" => strategy).increment(operations as u64);
}
