//! kanban-sync: client-side synchronization layer for a shared task board
//!
//! Keeps a local view of one board consistent under two sources of change:
//! actions this client performs against the board API, and push events
//! describing changes made by other clients.
//!
//! - [`Session`] holds the access/refresh credential pair
//! - [`RequestGateway`] issues API calls and recovers from expired credentials
//! - [`RealtimeChannel`] keeps the push connection alive
//! - [`BoardStateReconciler`] merges optimistic, confirmed and remote changes
//! - [`DragMoveController`] runs one optimistic move with rollback
//!
//! # Example
//!
//! ```rust,no_run
//! use kanban_sync::{Config, SyncContext};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let ctx = SyncContext::from_config(&Config::default())?;
//! ctx.gateway.login("ada@example.com", "secret").await?;
//!
//! ctx.reconciler.load_board("42").await?;
//! let _tasks = ctx.start_realtime();
//!
//! ctx.mover.move_card("7", "3").await?;
//! # Ok(())
//! # }
//! ```

pub mod api;
pub mod config;
pub mod context;
pub mod drag;
pub mod error;
pub mod gateway;
pub mod model;
pub mod realtime;
pub mod reconciler;
pub mod session;

// Re-export main types
pub use config::Config;
pub use context::SyncContext;
pub use drag::{DragMoveController, MoveOutcome};
pub use error::{Result, SyncError};
pub use gateway::{ApiResponse, RequestGateway};
pub use model::*;
pub use realtime::{ChannelConfig, ChannelState, RealtimeChannel};
pub use reconciler::{BoardStateReconciler, MoveToken};
pub use session::{FileTokenStore, MemoryTokenStore, Session, TokenStore};
