//! WebSocket connections: the driver loop that moves frames between a socket and a [Shim], and
//!  the client and server that establish connections.

use std::future::pending;
use std::sync::Arc;
use std::time::Duration;
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
#[cfg(test)] use mockall::automock;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::select;
use tokio::sync::mpsc;
use tokio::time::{self, Instant, Interval, MissedTickBehavior};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, trace, warn};
use crate::peer::Peer;
use crate::reassembly::ReassemblyTable;
use crate::shim::{FrameDisposition, Shim};
use crate::wire::{Outbound, WireFrame};

pub mod backoff;
pub mod client;
pub mod server;

/// Application callbacks for connection lifecycle events. `on_open` is called after
///  authentication and the replay of queued frames, `on_close` after the peer was detached.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ConnectionHooks: Send + Sync + 'static {
    async fn on_open(&self, _peer: &Peer) {}
    async fn on_close(&self, _peer: &Peer) {}
}

pub struct NoHooks;

#[async_trait]
impl ConnectionHooks for NoHooks {}

/// Ping / pong based liveness check. A connection is closed if no pong arrived for
///  `max_pong_wait`.
#[derive(Copy, Clone, Debug)]
pub struct Liveness {
    pub ping_interval: Duration,
    pub max_pong_wait: Duration,
}

/// Runs a connection until the socket closes, the shim asks to close it, or the peer's writer
///  channel is closed. This is the connection's single writer: everything sent to the peer
///  arrives through `outbound`.
///
/// The caller attaches the peer before and detaches it afterwards.
pub async fn drive_connection<S>(
    shim: Arc<Shim>,
    peer: Arc<Peer>,
    ws: WebSocketStream<S>,
    mut outbound: mpsc::UnboundedReceiver<Outbound>,
    liveness: Option<Liveness>,
)
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (mut sink, mut stream) = ws.split();
    let mut table = ReassemblyTable::new(shim.config().max_message_size, shim.config().max_in_flight_bytes);

    let mut ping_timer = liveness.map(|l| {
        let mut interval = time::interval_at(Instant::now() + l.ping_interval, l.ping_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        interval
    });
    let mut last_pong = Instant::now();

    loop {
        select! {
            received = stream.next() => {
                let frame = match received {
                    Some(Ok(Message::Text(text))) => WireFrame::Text(text.to_string()),
                    Some(Ok(Message::Binary(data))) => WireFrame::Binary(data.to_vec()),
                    Some(Ok(Message::Pong(_))) => {
                        trace!("pong from {:?}", peer.id());
                        last_pong = Instant::now();
                        continue;
                    }
                    Some(Ok(Message::Ping(_))) | Some(Ok(Message::Frame(_))) => continue,
                    Some(Ok(Message::Close(close))) => {
                        debug!("{:?} closed the connection: {:?}", peer.id(), close);
                        break;
                    }
                    Some(Err(e)) => {
                        warn!("error reading from {:?}: {}", peer.id(), e);
                        break;
                    }
                    None => {
                        debug!("connection to {:?} ended", peer.id());
                        break;
                    }
                };

                if shim.on_frame(&peer, &mut table, frame).await == FrameDisposition::Close {
                    debug!("closing connection to {:?}", peer.id());
                    let _ = sink.send(Message::Close(None)).await;
                    break;
                }
            }
            to_send = outbound.recv() => {
                let message = match to_send {
                    Some(Outbound::Frame(WireFrame::Text(text))) => Message::text(text),
                    Some(Outbound::Frame(WireFrame::Binary(data))) => Message::binary(data),
                    Some(Outbound::Close) | None => {
                        debug!("closing connection to {:?} on request", peer.id());
                        let _ = sink.send(Message::Close(None)).await;
                        break;
                    }
                };
                if let Err(e) = sink.send(message).await {
                    warn!("error writing to {:?}: {}", peer.id(), e);
                    break;
                }
            }
            _ = tick(&mut ping_timer) => {
                // the timer only exists with liveness configured
                let Some(liveness) = liveness else { continue };
                if last_pong.elapsed() > liveness.max_pong_wait {
                    warn!("no pong from {:?} for {:?} - closing", peer.id(), last_pong.elapsed());
                    let _ = sink.send(Message::Close(None)).await;
                    break;
                }
                trace!("ping to {:?}", peer.id());
                if let Err(e) = sink.send(Message::Ping(Vec::new().into())).await {
                    warn!("error pinging {:?}: {}", peer.id(), e);
                    break;
                }
            }
        }
    }

    // frames of messages that were in flight are lost with the connection
    if !table.is_empty() {
        debug!("discarding {} incomplete messages from {:?}", table.len(), peer.id());
    }
}

async fn tick(timer: &mut Option<Interval>) {
    match timer {
        Some(interval) => { interval.tick().await; }
        None => pending::<()>().await,
    }
}

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use serde_json::json;
    use tokio::net::TcpListener;
    use tokio_tungstenite::tungstenite::protocol::Role;
    use url::Url;
    use crate::action::outcome::{ActionErrorKind, ActionOutcome};
    use crate::action::{ActionCall, Authorization};
    use crate::config::{ClientConfig, Pacing, SendOptions, ServerConfig, ShimConfig};
    use crate::connection::client::ShimClient;
    use crate::connection::server::ShimServer;
    use crate::peer::identity::{AnonymousAuth, Identity, MockAuthHandler, MockAuthTokenProvider};
    use crate::peer::{ConnectionRequest, ConnectionState, PeerId, PeerSide};
    use crate::test_util::test_shim;
    use crate::wire::compression::Compression;
    use super::*;

    async fn register_echo(shim: &Shim) {
        shim.register_action("echo", Authorization::public(), Arc::new(|call: ActionCall| async move {
            Ok::<_, anyhow::Error>(json!(format!("{} (echoed)", call.payload.as_str().unwrap_or_default())))
        })).await.unwrap();
    }

    async fn start_server(shim: Arc<Shim>, hooks: Arc<dyn ConnectionHooks>) -> (SocketAddr, tokio::task::JoinHandle<()>) {
        let config = ServerConfig::new("127.0.0.1:0".parse().unwrap());
        let server = ShimServer::bind(shim, config, hooks).await.unwrap();
        let addr = server.local_addr().unwrap();
        let handle = tokio::spawn(async move {
            server.run().await;
        });
        (addr, handle)
    }

    fn client_config() -> ClientConfig {
        ClientConfig {
            reconnect_base_delay: Duration::from_millis(10),
            reconnect_jitter: Duration::from_millis(10),
            ..ClientConfig::default()
        }
    }

    async fn wait_until_open(client: &ShimClient) {
        for _ in 0..500 {
            if client.peer().state().await == ConnectionState::Open {
                return;
            }
            time::sleep(Duration::from_millis(10)).await;
        }
        panic!("client did not connect");
    }

    async fn wait_for_server_peer(shim: &Shim) -> PeerId {
        for _ in 0..500 {
            if let Some(peer_id) = shim.peer_ids().await.into_iter().next() {
                return peer_id;
            }
            time::sleep(Duration::from_millis(10)).await;
        }
        panic!("no connection was accepted");
    }

    async fn wait_for_count(counter: &AtomicUsize, expected: usize) {
        for _ in 0..500 {
            if counter.load(Ordering::SeqCst) == expected {
                return;
            }
            time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(counter.load(Ordering::SeqCst), expected);
    }

    #[derive(Default)]
    struct CountingHooks {
        opened: AtomicUsize,
        closed: AtomicUsize,
    }
    #[async_trait]
    impl ConnectionHooks for CountingHooks {
        async fn on_open(&self, _peer: &Peer) {
            self.opened.fetch_add(1, Ordering::SeqCst);
        }
        async fn on_close(&self, _peer: &Peer) {
            self.closed.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn test_echo_over_websocket() {
        let server_shim = test_shim();
        register_echo(&server_shim).await;
        let hooks = Arc::new(CountingHooks::default());
        let (addr, _server) = start_server(server_shim.clone(), hooks.clone()).await;

        let client_shim = test_shim();
        let url = Url::parse(&format!("ws://{}/shim", addr)).unwrap();
        let client = Arc::new(ShimClient::new(client_shim.clone(), client_config(), url, Arc::new(NoHooks)).await.unwrap());
        let supervisor = tokio::spawn({
            let client = client.clone();
            async move { client.run().await }
        });
        wait_until_open(&client).await;

        let outcome = client_shim.call_action(client.peer().id(), "echo", &json!("hello"), &SendOptions::default()).await;
        assert_eq!(outcome, ActionOutcome::ok(json!("hello (echoed)")));

        // a payload that takes many chunk frames
        let payload = "x".repeat(100_000);
        let options = SendOptions { compression: Compression::None, slice_size: 1000, pacing: Pacing::NoDelay, ..SendOptions::default() };
        let outcome = client_shim.call_action(client.peer().id(), "echo", &json!(payload), &options).await;
        assert_eq!(outcome, ActionOutcome::ok(json!(format!("{} (echoed)", payload))));

        assert_eq!(server_shim.peer_ids().await.len(), 1);
        wait_for_count(&hooks.opened, 1).await;

        client.terminate().await;
        supervisor.await.unwrap();
        assert_eq!(client.peer().state().await, ConnectionState::Closed);
    }

    #[tokio::test]
    async fn test_server_invokes_client_action() {
        let server_shim = test_shim();
        let (addr, _server) = start_server(server_shim.clone(), Arc::new(NoHooks)).await;

        let client_shim = test_shim();
        client_shim.register_action("admin-only", Authorization::roles(["admin"]), Arc::new(|_: ActionCall| async move {
            Ok::<_, anyhow::Error>(json!("done"))
        })).await.unwrap();
        let config = ClientConfig {
            server_identity: Identity::new("server", ["admin"]),
            ..client_config()
        };
        let url = Url::parse(&format!("ws://{}/shim", addr)).unwrap();
        let client = Arc::new(ShimClient::new(client_shim.clone(), config, url, Arc::new(NoHooks)).await.unwrap());
        tokio::spawn({
            let client = client.clone();
            async move { client.run().await }
        });
        wait_until_open(&client).await;

        let peer_id = wait_for_server_peer(&server_shim).await;
        let outcome = server_shim.call_action(&peer_id, "admin-only", &json!(null), &SendOptions::default()).await;
        assert_eq!(outcome, ActionOutcome::ok(json!("done")));

        client.terminate().await;
    }

    #[tokio::test]
    async fn test_offline_invocation_is_replayed_on_connect() {
        let server_shim = test_shim();
        register_echo(&server_shim).await;

        // bind before the client starts so that the port is known, but accept only later
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let client_shim = test_shim();
        let url = Url::parse(&format!("ws://{}/shim", addr)).unwrap();
        let client = Arc::new(ShimClient::new(client_shim.clone(), client_config(), url, Arc::new(NoHooks)).await.unwrap());

        let mut handle = client_shim.invoke_action(client.peer().id(), "echo", &json!("queued"), &SendOptions::default()).await.unwrap();
        assert!(client_shim.queued_bytes(client.peer().id()).await > 0);

        tokio::spawn({
            let client = client.clone();
            async move { client.run().await }
        });
        time::sleep(Duration::from_millis(50)).await;

        let config = ServerConfig::new(addr);
        let server = ShimServer::bind(server_shim, config, Arc::new(NoHooks)).await.unwrap();
        tokio::spawn(async move { server.run().await });

        assert_eq!(handle.wait_for_result(Duration::from_secs(10)).await, ActionOutcome::ok(json!("queued (echoed)")));
        client.terminate().await;
    }

    #[tokio::test]
    async fn test_client_reconnects_after_server_closes() {
        let server_shim = test_shim();
        register_echo(&server_shim).await;
        let hooks = Arc::new(CountingHooks::default());
        let (addr, _server) = start_server(server_shim.clone(), hooks.clone()).await;

        let client_shim = test_shim();
        let url = Url::parse(&format!("ws://{}/shim", addr)).unwrap();
        let client = Arc::new(ShimClient::new(client_shim.clone(), client_config(), url, Arc::new(NoHooks)).await.unwrap());
        tokio::spawn({
            let client = client.clone();
            async move { client.run().await }
        });
        wait_until_open(&client).await;

        wait_for_count(&hooks.opened, 1).await;
        let peer_id = wait_for_server_peer(&server_shim).await;
        server_shim.peer(&peer_id).await.unwrap().close().await;

        wait_for_count(&hooks.opened, 2).await;
        wait_for_count(&hooks.closed, 1).await;
        wait_until_open(&client).await;

        let outcome = client_shim.call_action(client.peer().id(), "echo", &json!("again"), &SendOptions::default()).await;
        assert_eq!(outcome, ActionOutcome::ok(json!("again (echoed)")));
        client.terminate().await;
    }

    #[tokio::test]
    async fn test_bidirectional_auth_over_websocket() {
        let mut token_provider = MockAuthTokenProvider::new();
        token_provider.expect_issue_token()
            .returning(|_, _| Ok("signed challenge".to_string()));
        token_provider.expect_verify_identity()
            .returning(|_, identity| Ok(identity));
        let server_shim = Shim::new(ShimConfig::default(), Arc::new(AnonymousAuth), Some(Arc::new(token_provider))).unwrap();
        server_shim.register_action("whoami", Authorization::roles(["user"]), Arc::new(|call: ActionCall| async move {
            Ok::<_, anyhow::Error>(json!(call.identity.id))
        })).await.unwrap();
        let (addr, _server) = start_server(server_shim.clone(), Arc::new(NoHooks)).await;

        let mut client_auth = MockAuthHandler::new();
        client_auth.expect_authenticate()
            .withf(|_, request| request.token.as_deref() == Some("signed challenge"))
            .returning(|_, _| Ok(Identity::new("alice", ["user"])));
        let client_shim = Shim::new(ShimConfig::default(), Arc::new(client_auth), None).unwrap();

        let url = Url::parse(&format!("ws://{}/shim", addr)).unwrap();
        let client = Arc::new(ShimClient::new(client_shim.clone(), client_config(), url, Arc::new(NoHooks)).await.unwrap()
            .with_bidirectional_auth());
        tokio::spawn({
            let client = client.clone();
            async move { client.run().await }
        });
        wait_until_open(&client).await;

        assert_eq!(client.peer().local_identity().await.unwrap().id, "alice");
        let outcome = client_shim.call_action(client.peer().id(), "whoami", &json!(null), &SendOptions::default()).await;
        assert_eq!(outcome, ActionOutcome::ok(json!("alice")));
        client.terminate().await;
    }

    #[tokio::test]
    async fn test_rejected_direct_auth_closes_connection() {
        let mut server_auth = MockAuthHandler::new();
        server_auth.expect_authenticate()
            .returning(|_, _| Err(anyhow::anyhow!("no credentials")));
        let server_shim = Shim::new(ShimConfig::default(), Arc::new(server_auth), None).unwrap();
        let mut hooks = MockConnectionHooks::new();
        hooks.expect_on_open().never();
        hooks.expect_on_close().never();
        let (addr, _server) = start_server(server_shim.clone(), Arc::new(hooks)).await;

        let (ws, _) = tokio_tungstenite::connect_async(format!("ws://{}/shim", addr)).await.unwrap();
        let (_, mut stream) = ws.split();
        // the server closes without sending anything
        loop {
            match stream.next().await {
                Some(Ok(Message::Close(_))) | None | Some(Err(_)) => break,
                Some(Ok(Message::Text(text))) => panic!("unexpected frame {}", text),
                Some(Ok(_)) => {}
            }
        }
        for _ in 0..500 {
            if server_shim.peer_ids().await.is_empty() {
                break;
            }
            time::sleep(Duration::from_millis(10)).await;
        }
        assert!(server_shim.peer_ids().await.is_empty());
    }

    #[tokio::test]
    async fn test_unknown_action_over_websocket() {
        let server_shim = test_shim();
        let (addr, _server) = start_server(server_shim, Arc::new(NoHooks)).await;

        let client_shim = test_shim();
        let url = Url::parse(&format!("ws://{}/shim", addr)).unwrap();
        let client = Arc::new(ShimClient::new(client_shim.clone(), client_config(), url, Arc::new(NoHooks)).await.unwrap());
        tokio::spawn({
            let client = client.clone();
            async move { client.run().await }
        });
        wait_until_open(&client).await;

        let outcome = client_shim.call_action(client.peer().id(), "missing", &json!(null), &SendOptions::default()).await;
        assert_eq!(outcome.error_kind(), Some(ActionErrorKind::UnknownAction));
        client.terminate().await;
    }

    /// Drives one side of an in-memory duplex stream and returns the raw websocket of the other
    async fn duplex_connection(shim: &Arc<Shim>, liveness: Option<Liveness>) -> (Arc<Peer>, WebSocketStream<tokio::io::DuplexStream>, tokio::task::JoinHandle<()>) {
        let (ours, theirs) = tokio::io::duplex(64 * 1024);
        let ws = WebSocketStream::from_raw_socket(ours, Role::Server, None).await;
        let raw = WebSocketStream::from_raw_socket(theirs, Role::Client, None).await;

        let peer = shim.add_peer(PeerId::from("raw"), PeerSide::Accepted).await.unwrap();
        let (send, recv) = mpsc::unbounded_channel();
        peer.attach(ConnectionRequest::new("/"), send).await;
        shim.open_peer(&peer).await.unwrap();

        let driver = tokio::spawn(drive_connection(shim.clone(), peer.clone(), ws, recv, liveness));
        (peer, raw, driver)
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_pong_closes_connection() {
        let shim = test_shim();
        let liveness = Liveness {
            ping_interval: Duration::from_secs(15),
            max_pong_wait: Duration::from_secs(30),
        };
        // the raw side is never polled, so it never answers pings
        let (_peer, _raw, driver) = duplex_connection(&shim, Some(liveness)).await;

        let start = Instant::now();
        driver.await.unwrap();
        assert!(start.elapsed() > Duration::from_secs(30));
        assert!(start.elapsed() <= Duration::from_secs(45));
    }

    #[tokio::test]
    async fn test_frames_are_written_in_order() {
        let shim = test_shim();
        let (peer, mut raw, _driver) = duplex_connection(&shim, None).await;

        let options = SendOptions { compression: Compression::None, slice_size: 2, pacing: Pacing::NoDelay, ..SendOptions::default() };
        shim.send_message(peer.id(), crate::wire::MessageType::ActionReturn, "iid", vec![1, 2, 3], &options).await.unwrap();

        let mut kinds = Vec::new();
        while kinds.len() < 6 {
            match raw.next().await.unwrap().unwrap() {
                Message::Text(text) => kinds.push(text.split('|').nth(2).unwrap_or_default().split('=').next().unwrap_or_default().to_string()),
                Message::Binary(_) => kinds.push("chunk".to_string()),
                _ => {}
            }
        }
        assert_eq!(kinds, vec!["content-length", "chunk-range", "chunk", "chunk-range", "chunk", "end"]);
    }

    #[tokio::test]
    async fn test_peer_close_request_closes_socket() {
        let shim = test_shim();
        let (peer, mut raw, driver) = duplex_connection(&shim, None).await;

        peer.close().await;
        driver.await.unwrap();
        assert!(matches!(raw.next().await, Some(Ok(Message::Close(_))) | None | Some(Err(_))));
    }
}
