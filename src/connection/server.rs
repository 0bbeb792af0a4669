use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::accept_hdr_async;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;
use crate::config::ServerConfig;
use crate::connection::{drive_connection, ConnectionHooks};
use crate::peer::{ConnectionRequest, Peer, PeerId, PeerSide};
use crate::shim::Shim;

/// Accepts WebSocket connections and registers each of them with the shim as a new peer with a
///  generated id. A connection is authenticated before it is opened: either by asserting the
///  identity established by the shim's auth handler, or by the bidirectional-auth handshake if
///  the connection URL asks for it.
pub struct ShimServer {
    shim: Arc<Shim>,
    config: ServerConfig,
    listener: TcpListener,
    hooks: Arc<dyn ConnectionHooks>,
}

impl ShimServer {
    pub async fn bind(shim: Arc<Shim>, config: ServerConfig, hooks: Arc<dyn ConnectionHooks>) -> anyhow::Result<ShimServer> {
        let listener = TcpListener::bind(config.bind_addr).await?;
        info!("listening on {:?}", listener.local_addr()?);
        Ok(ShimServer {
            shim,
            config,
            listener,
            hooks,
        })
    }

    pub fn local_addr(&self) -> anyhow::Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub fn shim(&self) -> &Arc<Shim> {
        &self.shim
    }

    /// The accept loop, running until the task is dropped
    pub async fn run(self) {
        loop {
            match self.listener.accept().await {
                Ok((stream, remote_addr)) => {
                    let shim = self.shim.clone();
                    let config = self.config.clone();
                    let hooks = self.hooks.clone();
                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(shim, config, hooks, stream, remote_addr).await {
                            warn!("connection from {:?} failed: {:#}", remote_addr, e);
                        }
                    });
                }
                Err(e) => {
                    error!(error = ?e, "error accepting connection");
                }
            }
        }
    }
}

#[instrument(name = "accepted_connection", skip_all, fields(remote = ?remote_addr))]
async fn handle_connection(shim: Arc<Shim>, config: ServerConfig, hooks: Arc<dyn ConnectionHooks>, stream: TcpStream, remote_addr: SocketAddr) -> anyhow::Result<()> {
    let mut request = ConnectionRequest::default();
    let capture = |upgrade: &Request, response: Response| -> Result<Response, ErrorResponse> {
        request = connection_request(upgrade);
        Ok(response)
    };
    let mut ws = accept_hdr_async(stream, capture).await?;

    let peer_id = PeerId::from(Uuid::new_v4().to_string());
    debug!("accepted {:?} for {}", peer_id, request.uri);
    let peer = shim.add_peer(peer_id, PeerSide::Accepted).await?;
    let (send, recv) = mpsc::unbounded_channel();
    peer.attach(request.clone(), send).await;

    // Direct identity assertion does not depend on anything the client sends, so it completes
    //  before the first frame is read. The handshake needs the driver to receive the client's
    //  identity.
    let driver = if request.requests_bidirectional_auth() {
        let driver = tokio::spawn(drive_connection(shim.clone(), peer.clone(), ws, recv, None));
        if let Err(e) = shim.authenticate_accepted(&peer, &request, config.handshake_timeout).await {
            peer.close().await;
            let _ = driver.await;
            discard(&shim, &peer).await;
            return Err(e.context("bidirectional authentication failed"));
        }
        driver
    }
    else {
        if let Err(e) = shim.authenticate_accepted(&peer, &request, config.handshake_timeout).await {
            let _ = ws.close(None).await;
            discard(&shim, &peer).await;
            return Err(e.context("authentication failed"));
        }
        tokio::spawn(drive_connection(shim.clone(), peer.clone(), ws, recv, None))
    };

    if let Err(e) = shim.open_peer(&peer).await {
        peer.close().await;
        let _ = driver.await;
        discard(&shim, &peer).await;
        return Err(e);
    }
    hooks.on_open(&peer).await;

    if let Err(e) = driver.await {
        error!("connection driver for {:?} failed: {}", peer.id(), e);
    }
    discard(&shim, &peer).await;
    info!("connection to {:?} closed", peer.id());
    hooks.on_close(&peer).await;
    Ok(())
}

/// Accepted peers do not outlive their connection
async fn discard(shim: &Shim, peer: &Peer) {
    peer.detach().await;
    shim.remove_peer(peer.id()).await;
}

fn connection_request(upgrade: &Request) -> ConnectionRequest {
    let uri = upgrade.uri().path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| upgrade.uri().to_string());
    let headers = upgrade.headers().iter()
        .filter_map(|(name, value)| {
            value.to_str().ok()
                .map(|value| (name.as_str().to_string(), value.to_string()))
        })
        .collect();
    ConnectionRequest { uri, headers }
}
