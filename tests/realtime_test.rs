//! Push channel integration tests
//!
//! Runs the RealtimeChannel against a local tokio-tungstenite server:
//! - credential carried in the handshake
//! - dispatch of card events, malformed and unknown frames dropped
//! - fixed-delay reconnection
//! - no reconnection once the session is cleared
//! - keep-alive pings disabled by a zero interval

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use kanban_sync::{
    ChannelConfig, ChannelState, MemoryTokenStore, RealtimeChannel, RemoteEvent, Session, TokenPair,
};
use tokio::net::TcpListener;
use tokio::time::{sleep, timeout};
use tokio_tungstenite::accept_hdr_async;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::Message;

const WAIT: Duration = Duration::from_secs(5);

struct TestServer {
    url: String,
    connections: Arc<AtomicUsize>,
    uris: Arc<Mutex<Vec<String>>>,
}

/// Accept connections, send `frames` on each, then close after `close_after`
/// or hold the connection open until the client leaves.
async fn spawn_server(frames: Vec<String>, close_after: Option<Duration>) -> TestServer {
    spawn_slow_server(frames, close_after, Duration::ZERO).await
}

/// Like `spawn_server`, holding every handshake back for `handshake_delay`
async fn spawn_slow_server(
    frames: Vec<String>,
    close_after: Option<Duration>,
    handshake_delay: Duration,
) -> TestServer {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("ws://{}/ws", listener.local_addr().unwrap());
    let connections = Arc::new(AtomicUsize::new(0));
    let uris = Arc::new(Mutex::new(Vec::new()));

    let server_connections = connections.clone();
    let server_uris = uris.clone();
    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            let connections = server_connections.clone();
            let uris = server_uris.clone();
            let frames = frames.clone();

            tokio::spawn(async move {
                sleep(handshake_delay).await;
                let record = move |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
                    uris.lock().unwrap().push(req.uri().to_string());
                    Ok(resp)
                };
                let mut ws = match accept_hdr_async(stream, record).await {
                    Ok(ws) => ws,
                    Err(_) => return,
                };
                connections.fetch_add(1, Ordering::SeqCst);

                for frame in frames {
                    if ws.send(Message::Text(frame)).await.is_err() {
                        return;
                    }
                }

                match close_after {
                    Some(delay) => {
                        sleep(delay).await;
                        let _ = ws.close(None).await;
                        while let Some(Ok(_)) = ws.next().await {}
                    }
                    None => while let Some(Ok(_)) = ws.next().await {},
                }
            });
        }
    });

    TestServer {
        url,
        connections,
        uris,
    }
}

fn session() -> Arc<Session> {
    Arc::new(Session::load(Arc::new(MemoryTokenStore::new(Some(
        TokenPair {
            access_token: "a1".into(),
            refresh_token: "r1".into(),
        },
    )))))
}

fn channel(url: &str, session: Arc<Session>, reconnect_delay: Duration) -> Arc<RealtimeChannel> {
    channel_with_ping(url, session, reconnect_delay, Duration::from_secs(30))
}

fn channel_with_ping(
    url: &str,
    session: Arc<Session>,
    reconnect_delay: Duration,
    ping_interval: Duration,
) -> Arc<RealtimeChannel> {
    Arc::new(RealtimeChannel::new(
        ChannelConfig {
            ws_url: url.to_string(),
            reconnect_delay,
            ping_interval,
        },
        session,
    ))
}

#[tokio::test]
async fn test_dispatches_card_events_in_order() {
    let frames = vec![
        r#"{"type":"cardCreate","payload":{"id":"c1","title":"New","priority":"low","columnId":"colA","boardId":"b1"}}"#.to_string(),
        "definitely not json".to_string(),
        r#"{"type":"board_updated","board_id":1}"#.to_string(),
        r#"{"type":"cardDelete","payload":{"cardId":"c9"}}"#.to_string(),
    ];
    let server = spawn_server(frames, None).await;
    let channel = channel(&server.url, session(), Duration::from_millis(100));
    let mut events = channel.subscribe();

    let runner = {
        let channel = channel.clone();
        tokio::spawn(async move { channel.run().await })
    };

    let first = timeout(WAIT, events.recv()).await.unwrap().unwrap();
    assert!(matches!(first, RemoteEvent::CardCreate(ref card) if card.id == "c1"));

    let second = timeout(WAIT, events.recv()).await.unwrap().unwrap();
    assert_eq!(
        second,
        RemoteEvent::CardDelete {
            card_id: "c9".into()
        }
    );
    assert_eq!(channel.state(), ChannelState::Connected);

    let uris = server.uris.lock().unwrap().clone();
    assert_eq!(uris, vec!["/ws?token=a1".to_string()]);

    channel.shutdown();
    timeout(WAIT, runner).await.unwrap().unwrap();
    assert_eq!(channel.state(), ChannelState::Disconnected);
}

#[tokio::test]
async fn test_reconnects_after_fixed_delay() {
    let server = spawn_server(vec![], Some(Duration::from_millis(50))).await;
    let channel = channel(&server.url, session(), Duration::from_millis(200));

    let runner = {
        let channel = channel.clone();
        tokio::spawn(async move { channel.run().await })
    };

    timeout(WAIT, async {
        while server.connections.load(Ordering::SeqCst) < 2 {
            sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("channel should reconnect");

    channel.shutdown();
    timeout(WAIT, runner).await.unwrap().unwrap();
}

#[tokio::test]
async fn test_no_reconnect_after_session_cleared_during_delay() {
    let server = spawn_server(vec![], Some(Duration::from_millis(100))).await;
    let session = session();
    let channel = channel(&server.url, session.clone(), Duration::from_millis(500));
    let mut state = channel.watch_state();

    let runner = {
        let channel = channel.clone();
        tokio::spawn(async move { channel.run().await })
    };

    timeout(WAIT, state.wait_for(|s| *s == ChannelState::Connected))
        .await
        .unwrap()
        .unwrap();
    timeout(WAIT, state.wait_for(|s| *s == ChannelState::Disconnected))
        .await
        .unwrap()
        .unwrap();

    // Logout while the reconnection delay is pending
    session.clear();

    // The loop ends on its own once it sees no credential
    timeout(WAIT, runner).await.unwrap().unwrap();
    assert_eq!(server.connections.load(Ordering::SeqCst), 1);
    assert_eq!(channel.state(), ChannelState::Disconnected);
}

#[tokio::test]
async fn test_logout_while_connected_closes_channel() {
    let server = spawn_server(vec![], None).await;
    let session = session();
    let channel = channel(&server.url, session.clone(), Duration::from_millis(100));
    let mut state = channel.watch_state();

    let runner = {
        let channel = channel.clone();
        tokio::spawn(async move { channel.run().await })
    };

    timeout(WAIT, state.wait_for(|s| *s == ChannelState::Connected))
        .await
        .unwrap()
        .unwrap();

    session.clear();

    timeout(WAIT, runner).await.unwrap().unwrap();
    assert_eq!(server.connections.load(Ordering::SeqCst), 1);
    assert_eq!(channel.state(), ChannelState::Disconnected);
}

#[tokio::test]
async fn test_logout_during_handshake_closes_channel() {
    let server = spawn_slow_server(vec![], None, Duration::from_millis(300)).await;
    let session = session();
    let channel = channel(&server.url, session.clone(), Duration::from_millis(100));
    let mut state = channel.watch_state();

    let runner = {
        let channel = channel.clone();
        tokio::spawn(async move { channel.run().await })
    };

    timeout(WAIT, state.wait_for(|s| *s == ChannelState::Connecting))
        .await
        .unwrap()
        .unwrap();

    // Credential revoked while the handshake is still pending
    session.clear();

    timeout(WAIT, runner).await.unwrap().unwrap();
    assert_eq!(channel.state(), ChannelState::Disconnected);
}

#[tokio::test]
async fn test_zero_ping_interval_disables_keepalive() {
    let frames = vec![r#"{"type":"cardDelete","payload":{"cardId":"c9"}}"#.to_string()];
    let server = spawn_server(frames, None).await;
    let channel = channel_with_ping(
        &server.url,
        session(),
        Duration::from_millis(100),
        Duration::ZERO,
    );
    let mut events = channel.subscribe();

    let runner = {
        let channel = channel.clone();
        tokio::spawn(async move { channel.run().await })
    };

    let event = timeout(WAIT, events.recv()).await.unwrap().unwrap();
    assert_eq!(
        event,
        RemoteEvent::CardDelete {
            card_id: "c9".into()
        }
    );
    assert_eq!(channel.state(), ChannelState::Connected);

    channel.shutdown();
    // Joins cleanly instead of panicking in the task
    timeout(WAIT, runner).await.unwrap().unwrap();
    assert_eq!(server.connections.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_unreachable_server_keeps_retrying() {
    // Bind then drop to get a port nobody listens on
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("ws://{}/ws", listener.local_addr().unwrap());
    drop(listener);

    let channel = channel(&url, session(), Duration::from_millis(20));

    let runner = {
        let channel = channel.clone();
        tokio::spawn(async move { channel.run().await })
    };

    // Many failed attempts later the loop is still going
    sleep(Duration::from_millis(300)).await;
    assert!(!runner.is_finished());
    assert_ne!(channel.state(), ChannelState::Connected);

    channel.shutdown();
    timeout(WAIT, runner).await.unwrap().unwrap();
}
