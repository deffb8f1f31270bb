//! Board state reconciler
//!
//! Authoritative in-memory model of the open board. Optimistic local moves,
//! server-confirmed CRUD results and remote push events all write the same
//! model, so the view only ever reads one source.
//!
//! Invariants held after every merge step:
//! - a card sits in exactly one column, and its `column_id` names that column
//! - re-applying a remote event with the same payload changes nothing

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::broadcast::{self, error::RecvError};
use tokio::sync::{watch, RwLock};
use tracing::{debug, info, warn};

use crate::error::{Result, SyncError};
use crate::gateway::RequestGateway;
use crate::model::{Board, Card, NewCard, RemoteEvent};

/// Rollback token for one optimistic move
///
/// Consumed by exactly one of [`BoardStateReconciler::commit_move`] or
/// [`BoardStateReconciler::rollback`].
#[derive(Debug, PartialEq, Eq)]
pub struct MoveToken {
    id: u64,
    board_id: String,
    card_id: String,
    from_column_id: String,
    from_index: usize,
    to_column_id: String,
}

impl MoveToken {
    pub fn card_id(&self) -> &str {
        &self.card_id
    }

    pub fn from_column_id(&self) -> &str {
        &self.from_column_id
    }

    pub fn to_column_id(&self) -> &str {
        &self.to_column_id
    }
}

pub struct BoardStateReconciler {
    gateway: Arc<RequestGateway>,
    board: RwLock<Option<Board>>,
    /// Bumped by every `load_board`; only the latest load installs its result
    load_generation: AtomicU64,
    next_move_id: AtomicU64,
    revision_tx: watch::Sender<u64>,
}

impl BoardStateReconciler {
    pub fn new(gateway: Arc<RequestGateway>) -> Self {
        let (revision_tx, _) = watch::channel(0);
        Self {
            gateway,
            board: RwLock::new(None),
            load_generation: AtomicU64::new(0),
            next_move_id: AtomicU64::new(1),
            revision_tx,
        }
    }

    /// Notified after every change to the held board
    pub fn subscribe_changes(&self) -> watch::Receiver<u64> {
        self.revision_tx.subscribe()
    }

    /// Clone of the held board
    pub async fn snapshot(&self) -> Option<Board> {
        self.board.read().await.clone()
    }

    pub async fn current_board_id(&self) -> Option<String> {
        self.board.read().await.as_ref().map(|b| b.id.clone())
    }

    /// Column currently holding `card_id`
    pub async fn column_of(&self, card_id: &str) -> Option<String> {
        self.board
            .read()
            .await
            .as_ref()
            .and_then(|b| b.card(card_id))
            .map(|c| c.column_id.clone())
    }

    /// Fetch a board and replace the held one wholesale.
    ///
    /// On failure the previously held board stays. If another load started
    /// while this one was in flight, the later load wins and this result is
    /// returned to the caller without being installed.
    pub async fn load_board(&self, board_id: &str) -> Result<Board> {
        let generation = self.load_generation.fetch_add(1, Ordering::SeqCst) + 1;
        let board = normalize(self.gateway.get_board(board_id).await?);

        let mut held = self.board.write().await;
        if self.load_generation.load(Ordering::SeqCst) != generation {
            debug!(board_id, "Board load superseded by a later load");
            return Ok(board);
        }
        info!(
            board_id,
            columns = board.columns.len(),
            cards = board.card_count(),
            "Board loaded"
        );
        *held = Some(board.clone());
        drop(held);

        self.notify();
        Ok(board)
    }

    /// Install a board obtained elsewhere, replacing the held one
    pub async fn replace_board(&self, board: Board) {
        self.load_generation.fetch_add(1, Ordering::SeqCst);
        *self.board.write().await = Some(normalize(board));
        self.notify();
    }

    /// Merge one remote event. Returns whether the model changed.
    pub async fn apply_remote_event(&self, event: RemoteEvent) -> bool {
        let mut held = self.board.write().await;
        let board = match held.as_mut() {
            Some(board) => board,
            None => return false,
        };

        let changed = match event {
            RemoteEvent::CardCreate(card) | RemoteEvent::CardUpdate(card) => upsert(board, card),
            RemoteEvent::CardDelete { card_id } => remove(board, &card_id).is_some(),
        };
        drop(held);

        if changed {
            self.notify();
        }
        changed
    }

    /// Relocate a card before the server confirms the move.
    ///
    /// A move into the card's own column leaves the layout untouched; its
    /// token commits and rolls back as a no-op.
    pub async fn apply_optimistic_move(
        &self,
        card_id: &str,
        to_column_id: &str,
    ) -> Result<MoveToken> {
        let mut held = self.board.write().await;
        let board = held
            .as_mut()
            .ok_or_else(|| SyncError::InvalidMove("no board is open".to_string()))?;

        let (from_ci, from_index) = board
            .position_of(card_id)
            .ok_or_else(|| SyncError::InvalidMove(format!("unknown card {}", card_id)))?;
        let to_ci = board
            .column_index(to_column_id)
            .ok_or_else(|| SyncError::InvalidMove(format!("unknown column {}", to_column_id)))?;

        let from_column_id = board.columns[from_ci].id.clone();
        let relocated = from_ci != to_ci;
        if relocated {
            let mut card = board.columns[from_ci].cards.remove(from_index);
            card.column_id = to_column_id.to_string();
            board.columns[to_ci].cards.push(card);
        }

        let token = MoveToken {
            id: self.next_move_id.fetch_add(1, Ordering::SeqCst),
            board_id: board.id.clone(),
            card_id: card_id.to_string(),
            from_column_id,
            from_index,
            to_column_id: to_column_id.to_string(),
        };
        drop(held);

        if !relocated {
            debug!(move_id = token.id, card_id, "Card already in target column, layout kept");
            return Ok(token);
        }
        debug!(
            move_id = token.id,
            card_id,
            from = %token.from_column_id,
            to = to_column_id,
            "Optimistic move applied"
        );
        self.notify();
        Ok(token)
    }

    /// Confirmed by the server; the optimistic state already matches
    pub fn commit_move(&self, token: MoveToken) {
        debug!(move_id = token.id, card_id = %token.card_id, "Move committed");
    }

    /// Undo the relocation identified by `token`.
    ///
    /// No-op when the card was deleted or relocated by a remote event in the
    /// meantime, or when a different board is now open. Returns whether the
    /// model changed.
    pub async fn rollback(&self, token: MoveToken) -> bool {
        if token.from_column_id == token.to_column_id {
            return false;
        }
        let mut held = self.board.write().await;
        let board = match held.as_mut() {
            Some(board) if board.id == token.board_id => board,
            _ => return false,
        };

        let (ci, pos) = match board.position_of(&token.card_id) {
            Some(found) => found,
            None => {
                debug!(move_id = token.id, "Card removed before rollback, nothing to undo");
                return false;
            }
        };
        if board.columns[ci].id != token.to_column_id {
            debug!(move_id = token.id, "Card relocated remotely, keeping remote placement");
            return false;
        }
        let from_ci = match board.column_index(&token.from_column_id) {
            Some(from_ci) => from_ci,
            None => return false,
        };

        let mut card = board.columns[ci].cards.remove(pos);
        card.column_id = token.from_column_id.clone();
        let cards = &mut board.columns[from_ci].cards;
        let index = token.from_index.min(cards.len());
        cards.insert(index, card);
        drop(held);

        info!(
            move_id = token.id,
            card_id = %token.card_id,
            column = %token.from_column_id,
            "Move rolled back"
        );
        self.notify();
        true
    }

    /// Create a card on the server and merge the confirmed result
    pub async fn create_card(&self, input: &NewCard) -> Result<Card> {
        let card = self.gateway.create_card(input).await?;
        self.apply_remote_event(RemoteEvent::CardCreate(card.clone()))
            .await;
        Ok(card)
    }

    /// Delete a card on the server and drop it from the model
    pub async fn delete_card(&self, card_id: &str) -> Result<()> {
        self.gateway.delete_card(card_id).await?;
        self.apply_remote_event(RemoteEvent::CardDelete {
            card_id: card_id.to_string(),
        })
        .await;
        Ok(())
    }

    /// Cards whose title or description contains `term`, ignoring case
    pub async fn filter_cards(&self, term: &str) -> Vec<Card> {
        let term = term.to_lowercase();
        let held = self.board.read().await;
        let board = match held.as_ref() {
            Some(board) => board,
            None => return Vec::new(),
        };

        board
            .columns
            .iter()
            .flat_map(|c| c.cards.iter())
            .filter(|card| {
                card.title.to_lowercase().contains(&term)
                    || card
                        .description
                        .as_deref()
                        .map(|d| d.to_lowercase().contains(&term))
                        .unwrap_or(false)
            })
            .cloned()
            .collect()
    }

    /// Apply events from a push channel subscription until it closes.
    ///
    /// Events dropped by a lagging subscription cannot be replayed, so the
    /// held board is reloaded in full instead.
    pub async fn follow(&self, mut events: broadcast::Receiver<RemoteEvent>) {
        loop {
            match events.recv().await {
                Ok(event) => {
                    self.apply_remote_event(event).await;
                }
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Remote events dropped, reloading board");
                    if let Some(board_id) = self.current_board_id().await {
                        if let Err(e) = self.load_board(&board_id).await {
                            warn!(error = %e, "Board reload after lag failed");
                        }
                    }
                }
                Err(RecvError::Closed) => break,
            }
        }
    }

    fn notify(&self) {
        self.revision_tx.send_modify(|rev| *rev += 1);
    }
}

/// Make every card's `column_id` agree with the column holding it
fn normalize(mut board: Board) -> Board {
    for column in &mut board.columns {
        for card in &mut column.cards {
            if card.column_id != column.id {
                warn!(card_id = %card.id, column = %column.id, "Card column mismatch in board payload");
                card.column_id = column.id.clone();
            }
        }
    }
    board
}

/// Insert or update a card. Returns whether the board changed.
fn upsert(board: &mut Board, card: Card) -> bool {
    if card.board_id != board.id {
        debug!(card_id = %card.id, board_id = %card.board_id, "Ignoring event for another board");
        return false;
    }

    let mut removed = false;
    if let Some((ci, pos)) = board.position_of(&card.id) {
        if board.columns[ci].id == card.column_id {
            let held = &mut board.columns[ci].cards[pos];
            if *held == card {
                return false;
            }
            *held = card;
            return true;
        }
        // Column changed: both sides move in the same step
        board.columns[ci].cards.remove(pos);
        removed = true;
    }

    match board.column_index(&card.column_id) {
        Some(ci) => {
            board.columns[ci].cards.push(card);
            true
        }
        None => {
            debug!(card_id = %card.id, column = %card.column_id, "Card targets a column outside the open board");
            removed
        }
    }
}

fn remove(board: &mut Board, card_id: &str) -> Option<Card> {
    let (ci, pos) = board.position_of(card_id)?;
    Some(board.columns[ci].cards.remove(pos))
}
