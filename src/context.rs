//! Explicit wiring of the sync components
//!
//! Built once at startup and passed to whatever needs a component; there is
//! no global client state.

use std::sync::Arc;

use tokio::task::JoinHandle;

use crate::config::Config;
use crate::drag::DragMoveController;
use crate::error::Result;
use crate::gateway::RequestGateway;
use crate::realtime::{ChannelConfig, RealtimeChannel};
use crate::reconciler::BoardStateReconciler;
use crate::session::{FileTokenStore, Session, TokenStore};

pub struct SyncContext {
    pub session: Arc<Session>,
    pub gateway: Arc<RequestGateway>,
    pub channel: Arc<RealtimeChannel>,
    pub reconciler: Arc<BoardStateReconciler>,
    pub mover: DragMoveController,
}

impl SyncContext {
    /// Wire every component over the given token store
    pub fn new(config: &Config, store: Arc<dyn TokenStore>) -> Result<Self> {
        let session = Arc::new(Session::load(store));
        let gateway = Arc::new(RequestGateway::new(&config.api, session.clone())?);
        let channel = Arc::new(RealtimeChannel::new(
            ChannelConfig::from(&config.realtime),
            session.clone(),
        ));
        let reconciler = Arc::new(BoardStateReconciler::new(gateway.clone()));
        let mover = DragMoveController::new(reconciler.clone(), gateway.clone());

        Ok(Self {
            session,
            gateway,
            channel,
            reconciler,
            mover,
        })
    }

    /// Wire every component with the token file named in the config
    pub fn from_config(config: &Config) -> Result<Self> {
        let store = Arc::new(FileTokenStore::new(&config.session.token_file));
        Self::new(config, store)
    }

    /// Start the push channel and route its events into the reconciler.
    ///
    /// The subscription is registered before the channel connects so no
    /// event is missed.
    pub fn start_realtime(&self) -> (JoinHandle<()>, JoinHandle<()>) {
        let events = self.channel.subscribe();

        let reconciler = self.reconciler.clone();
        let follower = tokio::spawn(async move { reconciler.follow(events).await });

        let channel = self.channel.clone();
        let runner = tokio::spawn(async move { channel.run().await });

        (runner, follower)
    }
}
