//! Batches local edits and routes each flush to a persistence strategy.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use diagram_core::{HistoryEntry, OperationBatch};
use tokio::sync::broadcast::error::{RecvError, TryRecvError};
use tokio::sync::{broadcast, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, info, warn};

use super::{
    DiagramDocument, LoadRequest, PersistenceError, PersistenceStrategy, SavePayload,
    SaveRequest, SaveResult, SnapshotSource,
};
use crate::config::BatchConfig;
use crate::history::{HistoryEvent, HistoryEventKind};
use crate::metrics;

const EVENT_CAPACITY: usize = 64;

/// Diagram the arbitrator persists.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PersistenceTarget {
    /// Owning threat model, needed for REST saves.
    pub threat_model_id: Option<String>,
    /// Diagram ID.
    pub diagram_id: String,
}

/// What to do with buffered operations on shutdown.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TeardownPolicy {
    /// Save them first.
    #[default]
    Flush,
    /// Drop them.
    Discard,
}

/// Flush outcomes.
#[derive(Debug, Clone, PartialEq)]
pub enum PersistenceEvent {
    /// A batch was persisted.
    BatchSaved {
        /// Strategy used.
        strategy: &'static str,
        /// Coalesced operations in the batch.
        operations: usize,
        /// Strategy result.
        result: SaveResult,
    },
    /// A batch could not be persisted. It is not retried.
    BatchFailed {
        /// Strategy used.
        strategy: &'static str,
        /// Coalesced operations in the batch.
        operations: usize,
        /// Error text.
        error: String,
    },
    /// A batch was dropped on teardown.
    BatchDiscarded {
        /// Coalesced operations dropped.
        operations: usize,
    },
}

/// Turns history entries into coalesced batches and persists them.
///
/// Push is preferred while it reports itself available; otherwise the
/// request/response strategy saves a full snapshot. Missed history events
/// also force a snapshot save, since their operations are unknown.
pub struct PersistenceArbitrator {
    push: Arc<dyn PersistenceStrategy>,
    rest: Arc<dyn PersistenceStrategy>,
    snapshots: Arc<dyn SnapshotSource>,
    target: PersistenceTarget,
    config: BatchConfig,
    batch: Mutex<OperationBatch>,
    resync: AtomicBool,
    events: broadcast::Sender<PersistenceEvent>,
    flush_lock: tokio::sync::Mutex<()>,
}

impl std::fmt::Debug for PersistenceArbitrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PersistenceArbitrator")
            .field("target", &self.target)
            .field("pending", &self.pending_operations())
            .finish_non_exhaustive()
    }
}

impl PersistenceArbitrator {
    /// Create an arbitrator.
    #[must_use]
    pub fn new(
        push: Arc<dyn PersistenceStrategy>,
        rest: Arc<dyn PersistenceStrategy>,
        snapshots: Arc<dyn SnapshotSource>,
        target: PersistenceTarget,
        config: BatchConfig,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            push,
            rest,
            snapshots,
            target,
            config,
            batch: Mutex::new(OperationBatch::new()),
            resync: AtomicBool::new(false),
            events,
            flush_lock: tokio::sync::Mutex::new(()),
        }
    }

    fn lock_batch(&self) -> MutexGuard<'_, OperationBatch> {
        self.batch.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn emit(&self, event: PersistenceEvent) {
        let _ = self.events.send(event);
    }

    /// Observe flush outcomes.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<PersistenceEvent> {
        self.events.subscribe()
    }

    /// The persisted diagram.
    #[must_use]
    pub fn target(&self) -> &PersistenceTarget {
        &self.target
    }

    /// Coalesced operations waiting for the next flush.
    #[must_use]
    pub fn pending_operations(&self) -> usize {
        self.lock_batch().len()
    }

    /// Whether the next flush will save a full snapshot.
    #[must_use]
    pub fn needs_resync(&self) -> bool {
        self.resync.load(Ordering::SeqCst)
    }

    /// Force the next flush to save a full snapshot.
    pub fn request_resync(&self) {
        self.resync.store(true, Ordering::SeqCst);
    }

    /// Add an entry's forward diff to the batch. Returns the number of
    /// operations the entry contributed.
    pub fn enqueue(&self, entry: &HistoryEntry) -> usize {
        let operations = entry.forward_operations();
        let count = operations.len();
        if count > 0 {
            self.lock_batch().extend(operations);
        }
        count
    }

    /// Persist whatever is buffered.
    ///
    /// Returns `Ok(None)` if the buffer was empty and no resync was pending.
    ///
    /// # Errors
    ///
    /// Returns the strategy's error. The batch is dropped either way.
    pub async fn flush(&self) -> Result<Option<SaveResult>, PersistenceError> {
        let _guard = self.flush_lock.lock().await;
        let operations = self.lock_batch().take();
        let resync = self.resync.swap(false, Ordering::SeqCst);
        if operations.is_empty() && !resync {
            return Ok(None);
        }
        let count = operations.len();

        let (strategy, payload) = if resync {
            (&self.rest, SavePayload::Snapshot(self.snapshots.snapshot()))
        } else if self.push.is_available() {
            (&self.push, SavePayload::Operations(operations))
        } else {
            (&self.rest, SavePayload::Snapshot(self.snapshots.snapshot()))
        };
        let name = strategy.name();
        debug!(strategy = name, operations = count, resync, payload = payload.kind(), "Flushing batch");

        let request = SaveRequest {
            threat_model_id: self.target.threat_model_id.clone(),
            diagram_id: self.target.diagram_id.clone(),
            payload,
        };
        match strategy.save(request).await {
            Ok(result) => {
                metrics::record_batch_flush(name, "saved", count);
                self.emit(PersistenceEvent::BatchSaved {
                    strategy: name,
                    operations: count,
                    result: result.clone(),
                });
                Ok(Some(result))
            }
            Err(err) => {
                warn!(strategy = name, operations = count, error = %err, "Batch save failed");
                metrics::record_batch_flush(name, "failed", count);
                self.emit(PersistenceEvent::BatchFailed {
                    strategy: name,
                    operations: count,
                    error: err.to_string(),
                });
                Err(err)
            }
        }
    }

    /// Drop whatever is buffered. Returns the number of operations dropped.
    pub fn discard(&self) -> usize {
        self.resync.store(false, Ordering::SeqCst);
        let dropped = self.lock_batch().clear();
        if dropped > 0 {
            info!(operations = dropped, diagram_id = %self.target.diagram_id, "Discarded unsaved operations");
            metrics::record_batch_flush("none", "discarded", dropped);
            self.emit(PersistenceEvent::BatchDiscarded { operations: dropped });
        }
        dropped
    }

    /// Load the target diagram. Always request/response.
    ///
    /// # Errors
    ///
    /// Returns the strategy's error.
    pub async fn load(&self) -> Result<DiagramDocument, PersistenceError> {
        self.rest
            .load(LoadRequest {
                threat_model_id: self.target.threat_model_id.clone(),
                diagram_id: self.target.diagram_id.clone(),
            })
            .await
    }

    async fn teardown(&self, policy: TeardownPolicy) {
        match policy {
            TeardownPolicy::Flush => {
                // Failure is already logged and published.
                let _ = self.flush().await;
            }
            TeardownPolicy::Discard => {
                self.discard();
            }
        }
    }

    /// Batch a history event. Returns whether it added operations.
    fn absorb(&self, event: &HistoryEvent) -> bool {
        match event {
            HistoryEvent::Operation {
                kind: HistoryEventKind::Add,
                entry,
                success: true,
            } => self.enqueue(entry) > 0,
            _ => false,
        }
    }

    fn missed_events(&self, skipped: u64) {
        warn!(skipped, "Persistence fell behind history events; next save is a full snapshot");
        self.request_resync();
    }

    /// Batch everything already queued on `history`.
    fn drain(&self, history: &mut broadcast::Receiver<HistoryEvent>) {
        loop {
            match history.try_recv() {
                Ok(event) => {
                    self.absorb(&event);
                }
                Err(TryRecvError::Lagged(skipped)) => self.missed_events(skipped),
                Err(TryRecvError::Empty | TryRecvError::Closed) => break,
            }
        }
    }

    /// Start batching `history` events in a background task.
    pub fn spawn(self: Arc<Self>, history: broadcast::Receiver<HistoryEvent>) -> ArbitratorHandle {
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let task = tokio::spawn(self.run(history, shutdown_rx));
        ArbitratorHandle {
            shutdown: Some(shutdown_tx),
            task,
        }
    }

    async fn run(
        self: Arc<Self>,
        mut history: broadcast::Receiver<HistoryEvent>,
        mut shutdown: oneshot::Receiver<TeardownPolicy>,
    ) {
        let mut deadline: Option<Instant> = None;
        let mut history_open = true;

        loop {
            tokio::select! {
                policy = &mut shutdown => {
                    self.drain(&mut history);
                    // A dropped handle counts as a flush request.
                    self.teardown(policy.unwrap_or_default()).await;
                    break;
                }
                event = history.recv(), if history_open => match event {
                    Ok(event) => {
                        if self.absorb(&event) {
                            deadline = Some(Instant::now() + self.config.debounce());
                        }
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        self.missed_events(skipped);
                        deadline = Some(Instant::now() + self.config.debounce());
                    }
                    Err(RecvError::Closed) => {
                        debug!("History engine dropped; flushing remaining operations");
                        history_open = false;
                        deadline = None;
                        let _ = self.flush().await;
                    }
                },
                () = sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                    deadline = None;
                    let _ = self.flush().await;
                }
            }
        }
        debug!(diagram_id = %self.target.diagram_id, "Persistence arbitrator stopped");
    }
}

/// Controls a spawned arbitrator task.
#[derive(Debug)]
pub struct ArbitratorHandle {
    shutdown: Option<oneshot::Sender<TeardownPolicy>>,
    task: JoinHandle<()>,
}

impl ArbitratorHandle {
    /// Stop the task, applying `policy` to buffered operations, and wait for
    /// it to finish.
    pub async fn shutdown(mut self, policy: TeardownPolicy) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(policy);
        }
        if let Err(err) = (&mut self.task).await {
            warn!(error = %err, "Persistence arbitrator task ended abnormally");
        }
    }

    /// Whether the task has exited.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}
