//! Incremental persistence over the live connection.

use async_trait::async_trait;
use uuid::Uuid;

use super::{
    DiagramDocument, HistoryDirection, LoadRequest, PersistenceError, PersistenceStrategy,
    SavePayload, SaveRequest, SaveResult,
};
use crate::connection::ConnectionManager;
use crate::message::{CellPatch, DomainMessage, User};

const NAME: &str = "push";

/// Sends diffed operations as `diagram_operation` messages.
///
/// Never transmits full diagram state, never loads, and never carries
/// undo/redo through `save`.
#[derive(Debug, Clone)]
pub struct PushStrategy {
    connection: ConnectionManager,
    user: Option<User>,
}

impl PushStrategy {
    /// Push over `connection`.
    #[must_use]
    pub fn new(connection: ConnectionManager) -> Self {
        Self {
            connection,
            user: None,
        }
    }

    /// Attribute outgoing operations to `user`.
    #[must_use]
    pub fn with_user(mut self, user: User) -> Self {
        self.user = Some(user);
        self
    }

    /// Ask the server to undo or redo the session's last change.
    ///
    /// # Errors
    ///
    /// Returns [`PersistenceError::Sync`] if the message cannot be sent.
    pub async fn request_history(&self, direction: HistoryDirection) -> Result<(), PersistenceError> {
        let initiating_user = self.user.clone();
        let message = match direction {
            HistoryDirection::Undo => DomainMessage::UndoRequest { initiating_user },
            HistoryDirection::Redo => DomainMessage::RedoRequest { initiating_user },
        };
        tracing::debug!(?direction, "Requesting collaborative history operation");
        self.connection.send_domain(message).await?;
        Ok(())
    }

    /// Ask the server for a resync.
    ///
    /// # Errors
    ///
    /// Returns [`PersistenceError::Sync`] if the message cannot be sent.
    pub async fn request_resync(&self) -> Result<(), PersistenceError> {
        self.connection
            .send_domain(DomainMessage::ResyncRequest {
                initiating_user: self.user.clone(),
            })
            .await?;
        Ok(())
    }
}

#[async_trait]
impl PersistenceStrategy for PushStrategy {
    fn name(&self) -> &'static str {
        NAME
    }

    fn is_available(&self) -> bool {
        self.connection.is_connected()
    }

    async fn save(&self, request: SaveRequest) -> Result<SaveResult, PersistenceError> {
        let operations = match request.payload {
            SavePayload::Operations(operations) => operations,
            SavePayload::Snapshot(_) => {
                return Err(PersistenceError::Unsupported {
                    strategy: NAME,
                    operation: "snapshot saves",
                    hint: "push transmits diffed cell operations only",
                })
            }
            SavePayload::History(_) => {
                return Err(PersistenceError::Unsupported {
                    strategy: NAME,
                    operation: "undo/redo saves",
                    hint: "use PushStrategy::request_history",
                })
            }
        };
        if operations.is_empty() {
            return Ok(SaveResult::default());
        }

        let operation_id = Uuid::new_v4().to_string();
        let count = operations.len();
        let message = DomainMessage::DiagramOperation {
            initiating_user: self.user.clone(),
            operation_id: operation_id.clone(),
            sequence_number: None,
            operation: CellPatch::new(operations),
        };
        self.connection.send_domain(message).await?;
        tracing::debug!(%operation_id, diagram_id = %request.diagram_id, count, "Pushed operations");
        Ok(SaveResult {
            operation_id: Some(operation_id),
            ..SaveResult::default()
        })
    }

    async fn load(&self, _request: LoadRequest) -> Result<DiagramDocument, PersistenceError> {
        Err(PersistenceError::Unsupported {
            strategy: NAME,
            operation: "load",
            hint: "load diagrams through the REST strategy",
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConnectionConfig;
    use diagram_core::Cell;

    fn strategy() -> PushStrategy {
        PushStrategy::new(ConnectionManager::websocket(ConnectionConfig::default(), None))
    }

    #[tokio::test]
    async fn test_load_fails_fast() {
        let err = strategy()
            .load(LoadRequest {
                threat_model_id: Some("tm".into()),
                diagram_id: "d".into(),
            })
            .await
            .expect_err("unsupported");
        assert!(matches!(err, PersistenceError::Unsupported { operation: "load", .. }));
        assert!(err.to_string().contains("REST"));
    }

    #[tokio::test]
    async fn test_rejects_snapshot_and_history() {
        let push = strategy();
        let snapshot = push
            .save(SaveRequest {
                threat_model_id: None,
                diagram_id: "d".into(),
                payload: SavePayload::Snapshot(vec![Cell::node("n1", "process")]),
            })
            .await;
        assert!(matches!(snapshot, Err(PersistenceError::Unsupported { .. })));

        let history = push
            .save(SaveRequest {
                threat_model_id: None,
                diagram_id: "d".into(),
                payload: SavePayload::History(HistoryDirection::Undo),
            })
            .await;
        assert!(matches!(
            history,
            Err(PersistenceError::Unsupported { hint, .. }) if hint.contains("request_history")
        ));
    }

    #[tokio::test]
    async fn test_unavailable_when_disconnected() {
        let push = strategy();
        assert!(!push.is_available());
        let err = push
            .request_history(HistoryDirection::Redo)
            .await
            .expect_err("not connected");
        assert!(matches!(err, PersistenceError::Sync(_)));
    }
}
