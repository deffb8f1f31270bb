//! Drag-and-drop move orchestration

use std::sync::Arc;

use tracing::{debug, warn};

use crate::error::{Result, SyncError};
use crate::gateway::RequestGateway;
use crate::model::Card;
use crate::reconciler::BoardStateReconciler;

/// Outcome of a successful move gesture
#[derive(Debug, Clone, PartialEq)]
pub enum MoveOutcome {
    /// The server confirmed the move, echoing the updated card when it sent one
    Moved(Option<Card>),
    /// The card already sat in the target column; nothing was sent
    Unchanged,
}

/// Runs one drag-and-drop move: optimistic update, server confirmation,
/// rollback on failure.
pub struct DragMoveController {
    reconciler: Arc<BoardStateReconciler>,
    gateway: Arc<RequestGateway>,
}

impl DragMoveController {
    pub fn new(reconciler: Arc<BoardStateReconciler>, gateway: Arc<RequestGateway>) -> Self {
        Self {
            reconciler,
            gateway,
        }
    }

    /// Move `card_id` into `to_column_id`.
    ///
    /// The view reflects the new position as soon as the optimistic step is
    /// applied. If the server rejects the move the card returns to its prior
    /// placement and the error is returned for user notification.
    pub async fn move_card(&self, card_id: &str, to_column_id: &str) -> Result<MoveOutcome> {
        let from_column_id = self
            .reconciler
            .column_of(card_id)
            .await
            .ok_or_else(|| SyncError::InvalidMove(format!("unknown card {}", card_id)))?;

        if from_column_id == to_column_id {
            debug!(card_id, column = to_column_id, "Drop on the same column, nothing to move");
            return Ok(MoveOutcome::Unchanged);
        }

        let pending = self
            .reconciler
            .apply_optimistic_move(card_id, to_column_id)
            .await?;

        match self.gateway.move_card(card_id, to_column_id).await {
            Ok(card) => {
                self.reconciler.commit_move(pending);
                Ok(MoveOutcome::Moved(card))
            }
            Err(e) => {
                warn!(
                    card_id,
                    from = %from_column_id,
                    to = to_column_id,
                    error = %e,
                    "Move rejected, rolling back"
                );
                self.reconciler.rollback(pending).await;
                Err(e)
            }
        }
    }
}
