//! Realtime push channel
//!
//! Owns the WebSocket connection that delivers changes made by other
//! clients. The channel cycles `Disconnected -> Connecting -> Connected ->
//! Disconnected` and waits a fixed delay before every reconnection. It only
//! connects while the session holds a credential; once the credential is
//! gone the loop ends in `Disconnected`.

use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::{broadcast, watch};
use tokio::time::{sleep, Interval};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};

use crate::config::RealtimeConfig;
use crate::model::RemoteEvent;
use crate::session::Session;

/// Capacity of the event fan-out buffer
const EVENT_BUFFER: usize = 1000;

/// Connection state of the push channel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Disconnected,
    Connecting,
    Connected,
}

/// Channel timing and endpoint
#[derive(Debug, Clone)]
pub struct ChannelConfig {
    pub ws_url: String,
    pub reconnect_delay: Duration,
    /// Zero disables keep-alive pings
    pub ping_interval: Duration,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self::from(&RealtimeConfig::default())
    }
}

impl From<&RealtimeConfig> for ChannelConfig {
    fn from(config: &RealtimeConfig) -> Self {
        Self {
            ws_url: config.ws_url.clone(),
            reconnect_delay: Duration::from_secs(config.reconnect_delay_secs),
            ping_interval: Duration::from_secs(config.ping_interval_secs),
        }
    }
}

/// Why a connection ended without error
enum Disconnect {
    Closed,
    LoggedOut,
    Shutdown,
}

/// Push-notification connection with perpetual fixed-delay reconnection
pub struct RealtimeChannel {
    config: ChannelConfig,
    session: Arc<Session>,
    event_tx: broadcast::Sender<RemoteEvent>,
    state_tx: watch::Sender<ChannelState>,
    shutdown_tx: watch::Sender<bool>,
}

impl RealtimeChannel {
    pub fn new(config: ChannelConfig, session: Arc<Session>) -> Self {
        let (event_tx, _) = broadcast::channel(EVENT_BUFFER);
        let (state_tx, _) = watch::channel(ChannelState::Disconnected);
        let (shutdown_tx, _) = watch::channel(false);

        Self {
            config,
            session,
            event_tx,
            state_tx,
            shutdown_tx,
        }
    }

    /// Register for decoded remote events
    pub fn subscribe(&self) -> broadcast::Receiver<RemoteEvent> {
        self.event_tx.subscribe()
    }

    pub fn state(&self) -> ChannelState {
        *self.state_tx.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<ChannelState> {
        self.state_tx.subscribe()
    }

    /// Stop the connection loop
    pub fn shutdown(&self) {
        self.shutdown_tx.send_replace(true);
    }

    /// Run the connect/reconnect loop until the credential is gone or
    /// [`shutdown`](Self::shutdown) is called.
    pub async fn run(&self) {
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let mut attempt = 0u64;

        loop {
            let stop = *shutdown_rx.borrow_and_update();
            if stop {
                break;
            }

            // Subscribed before the token is read so a logout in between is seen
            let mut auth_rx = self.session.subscribe();
            let token = match self.session.access_token() {
                Some(token) => token,
                None => {
                    info!("No credential, push channel stays disconnected");
                    break;
                }
            };

            attempt += 1;
            self.set_state(ChannelState::Connecting);
            info!(url = %self.config.ws_url, attempt, "Connecting push channel");

            match self
                .connect_and_listen(&token, &mut auth_rx, &mut shutdown_rx)
                .await
            {
                Ok(Disconnect::Shutdown) => break,
                Ok(Disconnect::LoggedOut) => {
                    info!("Session cleared, closing push channel");
                }
                Ok(Disconnect::Closed) => {
                    info!("Push channel closed by server");
                }
                Err(e) => {
                    warn!(error = %e, "Push channel error");
                }
            }

            self.set_state(ChannelState::Disconnected);

            info!(delay = ?self.config.reconnect_delay, "Reconnecting push channel after delay");
            tokio::select! {
                _ = sleep(self.config.reconnect_delay) => {}
                _ = shutdown_rx.changed() => break,
            }
        }

        self.set_state(ChannelState::Disconnected);
        info!("Push channel stopped");
    }

    async fn connect_and_listen(
        &self,
        token: &str,
        auth_rx: &mut watch::Receiver<bool>,
        shutdown_rx: &mut watch::Receiver<bool>,
    ) -> Result<Disconnect, String> {
        let url = connect_url(&self.config.ws_url, token);
        let (ws_stream, _) = connect_async(url.as_str())
            .await
            .map_err(|e| format!("WebSocket connect failed: {}", e))?;

        self.set_state(ChannelState::Connected);
        info!("Push channel connected");

        let (mut write, mut read) = ws_stream.split();
        let mut ping_interval = if self.config.ping_interval.is_zero() {
            None
        } else {
            let mut interval = tokio::time::interval(self.config.ping_interval);
            // First tick completes immediately
            interval.tick().await;
            Some(interval)
        };

        loop {
            tokio::select! {
                _ = shutdown_rx.changed() => {
                    let _ = write.close().await;
                    return Ok(Disconnect::Shutdown);
                }

                changed = auth_rx.changed() => {
                    let logged_in = changed.is_ok() && *auth_rx.borrow();
                    if !logged_in {
                        let _ = write.close().await;
                        return Ok(Disconnect::LoggedOut);
                    }
                }

                _ = next_ping(&mut ping_interval) => {
                    if let Err(e) = write.send(Message::Ping(vec![])).await {
                        return Err(format!("Ping failed: {}", e));
                    }
                }

                msg = read.next() => {
                    match msg {
                        Some(Ok(Message::Text(text))) => self.dispatch(&text),
                        Some(Ok(Message::Binary(data))) => match std::str::from_utf8(&data) {
                            Ok(text) => self.dispatch(text),
                            Err(_) => debug!(bytes = data.len(), "Dropping non-UTF-8 binary frame"),
                        },
                        Some(Ok(Message::Close(_))) => return Ok(Disconnect::Closed),
                        Some(Ok(_)) => {}
                        Some(Err(e)) => return Err(format!("WebSocket error: {}", e)),
                        None => return Ok(Disconnect::Closed),
                    }
                }
            }
        }
    }

    /// Decode one frame and fan it out. Malformed frames are dropped.
    fn dispatch(&self, text: &str) {
        match RemoteEvent::decode(text) {
            Ok(Some(event)) => {
                debug!(kind = event.kind(), card_id = event.card_id(), "Remote event");
                // No subscribers is not an error
                let _ = self.event_tx.send(event);
            }
            Ok(None) => debug!("Ignoring unrecognized push frame"),
            Err(e) => warn!(error = %e, "Dropping malformed push frame"),
        }
    }

    fn set_state(&self, state: ChannelState) {
        self.state_tx.send_if_modified(|current| {
            if *current == state {
                false
            } else {
                debug!(from = ?*current, to = ?state, "Push channel state");
                *current = state;
                true
            }
        });
    }
}

/// Resolves on the next keep-alive tick, never when pings are disabled
async fn next_ping(interval: &mut Option<Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

/// Handshake URL carrying the credential as a query parameter
fn connect_url(ws_url: &str, token: &str) -> String {
    let separator = if ws_url.contains('?') { '&' } else { '?' };
    format!("{}{}token={}", ws_url, separator, urlencoding::encode(token))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::MemoryTokenStore;

    #[test]
    fn test_connect_url_appends_token() {
        assert_eq!(
            connect_url("ws://localhost:3000/ws", "a b"),
            "ws://localhost:3000/ws?token=a%20b"
        );
        assert_eq!(
            connect_url("ws://host/ws?board=1", "t"),
            "ws://host/ws?board=1&token=t"
        );
    }

    #[tokio::test]
    async fn test_run_without_credential_stays_disconnected() {
        let session = Arc::new(Session::load(Arc::new(MemoryTokenStore::default())));
        let channel = RealtimeChannel::new(ChannelConfig::default(), session);

        // Returns immediately, no connection is attempted
        channel.run().await;
        assert_eq!(channel.state(), ChannelState::Disconnected);
    }

    #[test]
    fn test_dispatch_drops_malformed_and_unknown_frames() {
        let session = Arc::new(Session::load(Arc::new(MemoryTokenStore::default())));
        let channel = RealtimeChannel::new(ChannelConfig::default(), session);
        let mut rx = channel.subscribe();

        channel.dispatch("{not json");
        channel.dispatch(r#"{"type":"member_added","board_id":1}"#);
        channel.dispatch(r#"{"type":"cardDelete","payload":{"cardId":"c9"}}"#);

        assert_eq!(
            rx.try_recv().unwrap(),
            RemoteEvent::CardDelete {
                card_id: "c9".into()
            }
        );
        assert!(rx.try_recv().is_err());
    }
}
