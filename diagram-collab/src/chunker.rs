//! Splitting and reassembly of oversized domain messages.
//!
//! A message whose serialized form exceeds the configured threshold is sent
//! as a sequence of `chunked_message` frames that share a `chunk_id`:
//!
//! ```json
//! {
//!   "message_type": "chunked_message",
//!   "chunk_info": {
//!     "chunk_id": "…",
//!     "chunk_index": 0,
//!     "total_chunks": 3,
//!     "original_message_type": "diagram_operation"
//!   },
//!   "chunk_data": "{\"message_type\":\"diagram_operation\",…"
//! }
//! ```
//!
//! The receiver buffers slices by `chunk_id` and rebuilds the message once
//! every index has arrived, in whatever order they came.

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::time::Instant;
use uuid::Uuid;

use crate::config::ChunkConfig;
use crate::message::DomainMessage;
use crate::validation::MAX_WS_MESSAGE_SIZE;

/// Discriminator value of chunk frames.
pub const CHUNKED_MESSAGE_TYPE: &str = "chunked_message";

/// Smallest slice we will cut; keeps the UTF-8 boundary search productive.
const MIN_CHUNK_SIZE: usize = 4;

/// Position of one slice within its set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkInfo {
    /// Shared by every chunk of one logical message.
    pub chunk_id: String,
    /// Zero-based position.
    pub chunk_index: usize,
    /// Number of chunks in the set.
    pub total_chunks: usize,
    /// `message_type` of the reassembled message.
    pub original_message_type: String,
}

/// One slice of a serialized domain message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkedMessage {
    /// Slice metadata.
    pub chunk_info: ChunkInfo,
    /// The slice itself.
    pub chunk_data: String,
}

/// Reasons a chunk set is discarded.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChunkError {
    /// `total_chunks` is zero.
    #[error("chunk set {chunk_id} declares zero chunks")]
    EmptySet {
        /// Offending set.
        chunk_id: String,
    },
    /// `total_chunks` is above the configured limit.
    #[error("chunk set {chunk_id} declares {total} chunks (max {max})")]
    TooManyChunks {
        /// Offending set.
        chunk_id: String,
        /// Declared size.
        total: usize,
        /// Configured limit.
        max: usize,
    },
    /// Buffered slices grew past the largest message we accept.
    #[error("chunk set {chunk_id} exceeds {MAX_WS_MESSAGE_SIZE} bytes")]
    Oversized {
        /// Offending set.
        chunk_id: String,
    },
    /// `chunk_index` is not below `total_chunks`.
    #[error("chunk set {chunk_id}: index {index} out of range for {total} chunks")]
    IndexOutOfRange {
        /// Offending set.
        chunk_id: String,
        /// Received index.
        index: usize,
        /// Declared size.
        total: usize,
    },
    /// A chunk disagreed with the set's `total_chunks`.
    #[error("chunk set {chunk_id}: total_chunks changed from {expected} to {actual}")]
    InconsistentTotal {
        /// Offending set.
        chunk_id: String,
        /// Size declared by earlier chunks.
        expected: usize,
        /// Size declared by this chunk.
        actual: usize,
    },
    /// A chunk disagreed with the set's `original_message_type`.
    #[error("chunk set {chunk_id}: original type changed from {expected} to {actual}")]
    InconsistentType {
        /// Offending set.
        chunk_id: String,
        /// Type declared by earlier chunks.
        expected: String,
        /// Type declared by this chunk.
        actual: String,
    },
    /// The same index arrived twice with different data.
    #[error("chunk set {chunk_id}: conflicting data for index {index}")]
    ConflictingDuplicate {
        /// Offending set.
        chunk_id: String,
        /// Duplicated index.
        index: usize,
    },
    /// The concatenated slices are not a valid domain message.
    #[error("chunk set {chunk_id}: reassembled payload is invalid: {reason}")]
    Reassembly {
        /// Offending set.
        chunk_id: String,
        /// Decoder message.
        reason: String,
    },
    /// The message could not be serialized for chunking.
    #[error("cannot chunk message: {0}")]
    Serialization(String),
}

#[derive(Debug)]
struct PendingSet {
    total: usize,
    original_type: String,
    parts: BTreeMap<usize, String>,
    bytes: usize,
    first_seen: Instant,
}

/// Chunks outbound messages and reassembles inbound ones.
#[derive(Debug)]
pub struct MessageChunker {
    config: ChunkConfig,
    pending: HashMap<String, PendingSet>,
}

impl Default for MessageChunker {
    fn default() -> Self {
        Self::new(ChunkConfig::default())
    }
}

impl MessageChunker {
    /// Create a chunker with the given thresholds.
    #[must_use]
    pub fn new(config: ChunkConfig) -> Self {
        Self {
            config,
            pending: HashMap::new(),
        }
    }

    /// Configured thresholds.
    #[must_use]
    pub fn config(&self) -> &ChunkConfig {
        &self.config
    }

    /// Delay between consecutive chunk sends.
    #[must_use]
    pub fn send_delay(&self) -> Duration {
        Duration::from_millis(self.config.send_delay_ms)
    }

    /// Whether `message` serializes to more than the configured threshold.
    ///
    /// # Errors
    ///
    /// Returns [`ChunkError::Serialization`] if the message cannot be encoded.
    pub fn needs_chunking(&self, message: &DomainMessage) -> Result<bool, ChunkError> {
        let len = serde_json::to_vec(message)
            .map_err(|e| ChunkError::Serialization(e.to_string()))?
            .len();
        Ok(len > self.config.max_message_bytes)
    }

    /// Split `message` into ordered chunks sharing a fresh `chunk_id`.
    ///
    /// Slices never split a UTF-8 code point. Chunk frames themselves cannot
    /// be chunked again.
    ///
    /// # Errors
    ///
    /// Returns [`ChunkError::Serialization`] if the message cannot be encoded
    /// or is itself a chunk.
    pub fn chunk(&self, message: &DomainMessage) -> Result<Vec<ChunkedMessage>, ChunkError> {
        if matches!(message, DomainMessage::ChunkedMessage(_)) {
            return Err(ChunkError::Serialization(
                "chunk frames cannot be chunked again".to_string(),
            ));
        }
        let payload =
            serde_json::to_string(message).map_err(|e| ChunkError::Serialization(e.to_string()))?;
        let slices = split_utf8(&payload, self.config.chunk_size_bytes.max(MIN_CHUNK_SIZE));
        let chunk_id = Uuid::new_v4().to_string();
        let total_chunks = slices.len();
        if total_chunks > self.config.max_chunks {
            return Err(ChunkError::Serialization(format!(
                "{total_chunks} chunks exceeds the limit of {}",
                self.config.max_chunks
            )));
        }
        let original_message_type = message.message_type().to_string();

        tracing::debug!(
            %chunk_id,
            total_chunks,
            bytes = payload.len(),
            message_type = %original_message_type,
            "Chunking oversized message"
        );

        Ok(slices
            .into_iter()
            .enumerate()
            .map(|(chunk_index, slice)| ChunkedMessage {
                chunk_info: ChunkInfo {
                    chunk_id: chunk_id.clone(),
                    chunk_index,
                    total_chunks,
                    original_message_type: original_message_type.clone(),
                },
                chunk_data: slice.to_string(),
            })
            .collect())
    }

    /// Buffer one chunk; returns the reassembled message once complete.
    ///
    /// Returns `Ok(None)` while the set is still incomplete. Any inconsistency
    /// discards the whole set and returns an error.
    ///
    /// # Errors
    ///
    /// Returns a [`ChunkError`] describing why the set was discarded.
    pub fn process_chunk(
        &mut self,
        chunk: ChunkedMessage,
    ) -> Result<Option<DomainMessage>, ChunkError> {
        self.discard_expired(Instant::now());

        let ChunkedMessage {
            chunk_info: info,
            chunk_data,
        } = chunk;
        let chunk_id = info.chunk_id.clone();

        if info.total_chunks == 0 {
            return Err(self.discard(&chunk_id, ChunkError::EmptySet { chunk_id: chunk_id.clone() }));
        }
        if info.chunk_index >= info.total_chunks {
            return Err(self.discard(
                &chunk_id,
                ChunkError::IndexOutOfRange {
                    chunk_id: chunk_id.clone(),
                    index: info.chunk_index,
                    total: info.total_chunks,
                },
            ));
        }
        if info.total_chunks > self.config.max_chunks {
            let err = ChunkError::TooManyChunks {
                chunk_id: chunk_id.clone(),
                total: info.total_chunks,
                max: self.config.max_chunks,
            };
            return Err(self.discard(&chunk_id, err));
        }

        let set = self
            .pending
            .entry(chunk_id.clone())
            .or_insert_with(|| PendingSet {
                total: info.total_chunks,
                original_type: info.original_message_type.clone(),
                parts: BTreeMap::new(),
                bytes: 0,
                first_seen: Instant::now(),
            });

        if set.total != info.total_chunks {
            let err = ChunkError::InconsistentTotal {
                chunk_id: chunk_id.clone(),
                expected: set.total,
                actual: info.total_chunks,
            };
            return Err(self.discard(&chunk_id, err));
        }
        if set.original_type != info.original_message_type {
            let err = ChunkError::InconsistentType {
                chunk_id: chunk_id.clone(),
                expected: set.original_type.clone(),
                actual: info.original_message_type,
            };
            return Err(self.discard(&chunk_id, err));
        }

        if let Some(existing) = set.parts.get(&info.chunk_index) {
            if *existing == chunk_data {
                tracing::debug!(%chunk_id, index = info.chunk_index, "Ignoring duplicate chunk");
                return Ok(None);
            }
            let err = ChunkError::ConflictingDuplicate {
                chunk_id: chunk_id.clone(),
                index: info.chunk_index,
            };
            return Err(self.discard(&chunk_id, err));
        }
        set.bytes += chunk_data.len();
        if set.bytes > MAX_WS_MESSAGE_SIZE {
            let err = ChunkError::Oversized {
                chunk_id: chunk_id.clone(),
            };
            return Err(self.discard(&chunk_id, err));
        }
        set.parts.insert(info.chunk_index, chunk_data);

        if set.parts.len() < set.total {
            return Ok(None);
        }

        let Some(set) = self.pending.remove(&chunk_id) else {
            return Ok(None);
        };
        let payload: String = set.parts.into_values().collect();
        let message: DomainMessage =
            serde_json::from_str(&payload).map_err(|e| ChunkError::Reassembly {
                chunk_id: chunk_id.clone(),
                reason: e.to_string(),
            })?;

        if matches!(message, DomainMessage::ChunkedMessage(_)) {
            return Err(ChunkError::Reassembly {
                chunk_id,
                reason: "nested chunk frame".to_string(),
            });
        }
        if message.message_type() != set.original_type {
            return Err(ChunkError::Reassembly {
                chunk_id,
                reason: format!(
                    "decoded {} but chunks declared {}",
                    message.message_type(),
                    set.original_type
                ),
            });
        }

        tracing::debug!(%chunk_id, total = set.total, "Reassembled chunked message");
        Ok(Some(message))
    }

    fn discard(&mut self, chunk_id: &str, err: ChunkError) -> ChunkError {
        let buffered = self.pending.remove(chunk_id).map_or(0, |set| set.parts.len());
        tracing::warn!(%chunk_id, buffered, error = %err, "Discarding chunk set");
        err
    }

    /// Drop incomplete sets older than the retention window.
    ///
    /// Returns how many sets were dropped.
    pub fn discard_expired(&mut self, now: Instant) -> usize {
        let retention = Duration::from_millis(self.config.retention_ms);
        let before = self.pending.len();
        self.pending.retain(|chunk_id, set| {
            let keep = now.saturating_duration_since(set.first_seen) < retention;
            if !keep {
                tracing::warn!(
                    %chunk_id,
                    received = set.parts.len(),
                    total = set.total,
                    "Discarding incomplete chunk set past retention"
                );
            }
            keep
        });
        before - self.pending.len()
    }

    /// Number of incomplete sets being buffered.
    #[must_use]
    pub fn pending_sets(&self) -> usize {
        self.pending.len()
    }

    /// Drop every buffered set, returning how many there were.
    pub fn clear(&mut self) -> usize {
        let count = self.pending.len();
        self.pending.clear();
        count
    }
}

/// Split `text` into slices of at most `max` bytes on char boundaries.
fn split_utf8(text: &str, max: usize) -> Vec<&str> {
    let mut slices = Vec::with_capacity(text.len() / max + 1);
    let mut start = 0;
    while start < text.len() {
        let mut end = (start + max).min(text.len());
        while !text.is_char_boundary(end) {
            end -= 1;
        }
        slices.push(&text[start..end]);
        start = end;
    }
    if slices.is_empty() {
        slices.push("");
    }
    slices
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{CellPatch, DomainMessage};
    use diagram_core::{Cell, CellOperation, CellOperationKind};
    use proptest::prelude::*;
    use serde_json::json;

    fn small_config() -> ChunkConfig {
        ChunkConfig {
            max_message_bytes: 256,
            chunk_size_bytes: 64,
            retention_ms: 1_000,
            send_delay_ms: 0,
            max_chunks: 512,
        }
    }

    fn big_operation(cells: usize) -> DomainMessage {
        let operations = (0..cells)
            .map(|i| CellOperation {
                id: format!("n{i}"),
                operation: CellOperationKind::Add,
                data: Some(
                    Cell::node(format!("n{i}"), "process")
                        .with_attribute("label", json!(format!("Process ✓ {i}"))),
                ),
            })
            .collect();
        DomainMessage::DiagramOperation {
            initiating_user: None,
            operation_id: "op-1".to_string(),
            sequence_number: None,
            operation: CellPatch::new(operations),
        }
    }

    #[test]
    fn test_needs_chunking_threshold() {
        let chunker = MessageChunker::new(small_config());
        assert!(!chunker.needs_chunking(&big_operation(1)).expect("size"));
        assert!(chunker.needs_chunking(&big_operation(20)).expect("size"));
    }

    #[test]
    fn test_in_order_round_trip() {
        let mut chunker = MessageChunker::new(small_config());
        let message = big_operation(20);
        let chunks = chunker.chunk(&message).expect("chunk");
        assert!(chunks.len() > 1);
        assert!(chunks.iter().all(|c| c.chunk_data.len() <= 64));
        assert!(chunks
            .iter()
            .all(|c| c.chunk_info.original_message_type == "diagram_operation"));

        let last = chunks.len() - 1;
        for (i, chunk) in chunks.into_iter().enumerate() {
            let result = chunker.process_chunk(chunk).expect("process");
            if i == last {
                assert_eq!(result, Some(message.clone()));
            } else {
                assert!(result.is_none());
            }
        }
        assert_eq!(chunker.pending_sets(), 0);
    }

    #[test]
    fn test_split_respects_utf8_boundaries() {
        let text = "ab✓✓✓cd";
        for max in 4..10 {
            let slices = split_utf8(text, max);
            assert_eq!(slices.concat(), text);
            assert!(slices.iter().all(|s| s.len() <= max));
        }
    }

    #[test]
    fn test_inconsistent_total_discards_set() {
        let mut chunker = MessageChunker::new(small_config());
        let mut chunks = chunker.chunk(&big_operation(20)).expect("chunk");
        let first = chunks.remove(0);
        let mut second = chunks.remove(0);
        second.chunk_info.total_chunks += 1;

        assert!(chunker.process_chunk(first).expect("first").is_none());
        assert_eq!(chunker.pending_sets(), 1);
        let err = chunker.process_chunk(second).expect_err("inconsistent");
        assert!(matches!(err, ChunkError::InconsistentTotal { .. }));
        assert_eq!(chunker.pending_sets(), 0);
    }

    #[test]
    fn test_conflicting_duplicate_discards_set() {
        let mut chunker = MessageChunker::new(small_config());
        let chunks = chunker.chunk(&big_operation(20)).expect("chunk");
        let mut forged = chunks[0].clone();
        forged.chunk_data.push('x');

        assert!(chunker.process_chunk(chunks[0].clone()).expect("first").is_none());
        assert!(chunker.process_chunk(chunks[0].clone()).expect("same again").is_none());
        let err = chunker.process_chunk(forged).expect_err("conflict");
        assert!(matches!(err, ChunkError::ConflictingDuplicate { index: 0, .. }));
        assert_eq!(chunker.pending_sets(), 0);
    }

    #[test]
    fn test_out_of_range_index_rejected() {
        let mut chunker = MessageChunker::new(small_config());
        let mut chunk = chunker.chunk(&big_operation(20)).expect("chunk").remove(0);
        chunk.chunk_info.chunk_index = chunk.chunk_info.total_chunks;
        assert!(matches!(
            chunker.process_chunk(chunk),
            Err(ChunkError::IndexOutOfRange { .. })
        ));
    }

    #[test]
    fn test_huge_total_chunks_discarded_without_buffering() {
        let mut chunker = MessageChunker::new(small_config());
        for total in [usize::MAX / 2, 1 << 40, 513] {
            let chunk = ChunkedMessage {
                chunk_info: ChunkInfo {
                    chunk_id: "hostile".to_string(),
                    chunk_index: 0,
                    total_chunks: total,
                    original_message_type: "diagram_operation".to_string(),
                },
                chunk_data: "{".to_string(),
            };
            let err = chunker.process_chunk(chunk).expect_err("over the limit");
            assert!(matches!(err, ChunkError::TooManyChunks { max: 512, .. }));
            assert_eq!(chunker.pending_sets(), 0);
        }
    }

    #[test]
    fn test_chunk_refuses_sets_over_the_limit() {
        let mut config = small_config();
        config.max_chunks = 2;
        let chunker = MessageChunker::new(config);
        assert!(matches!(
            chunker.chunk(&big_operation(20)),
            Err(ChunkError::Serialization(_))
        ));
    }

    #[test]
    fn test_chunk_frames_are_not_rechunked() {
        let chunker = MessageChunker::new(small_config());
        let chunk = chunker.chunk(&big_operation(20)).expect("chunk").remove(0);
        assert!(chunker.chunk(&DomainMessage::ChunkedMessage(chunk)).is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_sets_expire() {
        let mut chunker = MessageChunker::new(small_config());
        let chunk = chunker.chunk(&big_operation(20)).expect("chunk").remove(0);
        assert!(chunker.process_chunk(chunk).expect("first").is_none());

        tokio::time::advance(Duration::from_millis(500)).await;
        assert_eq!(chunker.discard_expired(Instant::now()), 0);

        tokio::time::advance(Duration::from_millis(600)).await;
        assert_eq!(chunker.discard_expired(Instant::now()), 1);
        assert_eq!(chunker.pending_sets(), 0);
    }

    fn shuffled_chunks() -> impl Strategy<Value = (DomainMessage, Vec<ChunkedMessage>)> {
        (5usize..40).prop_flat_map(|cells| {
            let message = big_operation(cells);
            let chunks = MessageChunker::new(small_config())
                .chunk(&message)
                .expect("chunk");
            (Just(message), Just(chunks).prop_shuffle())
        })
    }

    proptest! {
        #[test]
        fn prop_any_order_reassembles((message, chunks) in shuffled_chunks()) {
            let mut chunker = MessageChunker::new(small_config());
            let mut reassembled = None;
            for chunk in chunks {
                if let Some(done) = chunker.process_chunk(chunk).expect("process") {
                    reassembled = Some(done);
                }
            }
            prop_assert_eq!(reassembled, Some(message));
            prop_assert_eq!(chunker.pending_sets(), 0);
        }
    }
}
