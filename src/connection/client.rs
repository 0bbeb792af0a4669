use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use anyhow::{anyhow, bail};
use async_trait::async_trait;
#[cfg(test)] use mockall::automock;
use tokio::select;
use tokio::sync::{mpsc, Notify};
use tokio::time::{self, Instant};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{HeaderName, HeaderValue};
use tracing::{debug, info, instrument, warn};
use url::Url;
use crate::config::ClientConfig;
use crate::connection::backoff::ReconnectBackoff;
use crate::connection::{drive_connection, ConnectionHooks, Liveness};
use crate::peer::identity::{add_bidirectional_marker, requests_bidirectional_auth};
use crate::peer::{ConnectionRequest, Peer, PeerId, PeerSide};
use crate::shim::Shim;
use crate::util::random::RngRandom;

/// Resolves the URL for each connection attempt, e.g. to embed a fresh access token
#[cfg_attr(test, automock)]
#[async_trait]
pub trait UrlProvider: Send + Sync + 'static {
    async fn url(&self) -> anyhow::Result<Url>;
}

/// Resolves the headers of each connection attempt's upgrade request
#[cfg_attr(test, automock)]
#[async_trait]
pub trait HeaderProvider: Send + Sync + 'static {
    async fn headers(&self) -> anyhow::Result<Vec<(String, String)>>;
}

pub enum UrlSource {
    Static(Url),
    Provider(Arc<dyn UrlProvider>),
}

impl UrlSource {
    async fn resolve(&self) -> anyhow::Result<Url> {
        match self {
            UrlSource::Static(url) => Ok(url.clone()),
            UrlSource::Provider(provider) => provider.url().await,
        }
    }
}

impl From<Url> for UrlSource {
    fn from(url: Url) -> Self {
        UrlSource::Static(url)
    }
}

pub enum HeaderSource {
    Static(Vec<(String, String)>),
    Provider(Arc<dyn HeaderProvider>),
}

impl HeaderSource {
    async fn resolve(&self) -> anyhow::Result<Vec<(String, String)>> {
        match self {
            HeaderSource::Static(headers) => Ok(headers.clone()),
            HeaderSource::Provider(provider) => provider.headers().await,
        }
    }
}

impl Default for HeaderSource {
    fn default() -> Self {
        HeaderSource::Static(Vec::new())
    }
}

/// Maintains one outbound connection to a server, reconnecting with backoff whenever it is
///  lost, until [ShimClient::terminate] is called.
///
/// The server is registered with the shim as a single peer that survives reconnects. Sends to
///  it while there is no open connection go to the offline queue and are replayed when the
///  next connection opens.
pub struct ShimClient {
    shim: Arc<Shim>,
    config: ClientConfig,
    url: UrlSource,
    headers: HeaderSource,
    bidirectional_auth: bool,
    hooks: Arc<dyn ConnectionHooks>,
    peer: Arc<Peer>,
    terminated: AtomicBool,
    terminate_notify: Notify,
}

impl ShimClient {
    pub async fn new(shim: Arc<Shim>, config: ClientConfig, url: impl Into<UrlSource>, hooks: Arc<dyn ConnectionHooks>) -> anyhow::Result<ShimClient> {
        config.validate()?;
        let peer = shim.add_peer(PeerId::from(config.peer_id.as_str()), PeerSide::Dialed).await?;
        Ok(ShimClient {
            shim,
            config,
            url: url.into(),
            headers: HeaderSource::default(),
            bidirectional_auth: false,
            hooks,
            peer,
            terminated: AtomicBool::new(false),
            terminate_notify: Notify::new(),
        })
    }

    pub fn with_headers(mut self, headers: HeaderSource) -> ShimClient {
        self.headers = headers;
        self
    }

    /// Adds the marker to every connection URL that asks the server for the bidirectional-auth
    ///  handshake
    pub fn with_bidirectional_auth(mut self) -> ShimClient {
        self.bidirectional_auth = true;
        self
    }

    pub fn peer(&self) -> &Arc<Peer> {
        &self.peer
    }

    pub fn shim(&self) -> &Arc<Shim> {
        &self.shim
    }

    /// The supervisor loop: connects, runs the connection until it closes, waits for the
    ///  backoff delay and starts over. Returns after [ShimClient::terminate] was called.
    pub async fn run(&self) {
        let mut backoff = ReconnectBackoff::<RngRandom>::new(&self.config);

        while !self.is_terminated() {
            let started = Instant::now();
            if let Err(e) = self.run_session().await {
                warn!("connection to {:?} failed: {:#}", self.peer.id(), e);
            }
            backoff.on_session_ended(started.elapsed());

            if self.is_terminated() {
                break;
            }
            let delay = backoff.next_delay();
            debug!("reconnecting to {:?} in {:?}", self.peer.id(), delay);
            select! {
                _ = time::sleep(delay) => {}
                _ = self.terminate_notify.notified() => {}
            }
        }
        info!("client for {:?} terminated", self.peer.id());
    }

    /// Stops the supervisor loop: a pending reconnect is abandoned, and an open connection is
    ///  closed
    pub async fn terminate(&self) {
        debug!("terminating client for {:?}", self.peer.id());
        self.terminated.store(true, Ordering::SeqCst);
        self.terminate_notify.notify_one();
        self.peer.close().await;
    }

    fn is_terminated(&self) -> bool {
        self.terminated.load(Ordering::SeqCst)
    }

    #[instrument(name = "client_session", skip_all, fields(peer = %self.peer.id()))]
    async fn run_session(&self) -> anyhow::Result<()> {
        let mut url = self.url.resolve().await?;
        if self.bidirectional_auth {
            add_bidirectional_marker(&mut url);
        }
        let headers = self.headers.resolve().await?;

        let mut request = url.as_str().into_client_request()?;
        for (name, value) in &headers {
            request.headers_mut().insert(HeaderName::from_bytes(name.as_bytes())?, HeaderValue::from_str(value)?);
        }

        debug!("connecting to {}", url);
        let (ws, _) = connect_async(request).await?;

        let (send, recv) = mpsc::unbounded_channel();
        self.peer.attach(ConnectionRequest { uri: url.to_string(), headers }, send).await;
        self.peer.set_remote_identity(self.config.server_identity.clone()).await;

        // registered before the driver reads the first frame, which may be the server's token
        let handshake = if requests_bidirectional_auth(url.as_str()) {
            Some(self.peer.begin_handshake().await)
        }
        else {
            None
        };

        let liveness = Liveness {
            ping_interval: self.config.ping_interval,
            max_pong_wait: self.config.max_pong_wait,
        };
        let driver = tokio::spawn(drive_connection(self.shim.clone(), self.peer.clone(), ws, recv, Some(liveness)));

        if let Some(handshake) = handshake {
            let authenticated = time::timeout(self.config.handshake_timeout, handshake).await
                .map_err(|_| anyhow!("no auth token from {:?} within {:?}", self.peer.id(), self.config.handshake_timeout))
                .and_then(|r| r.map_err(|_| anyhow!("connection closed during the handshake")));
            if let Err(e) = authenticated {
                self.peer.close().await;
                let _ = driver.await;
                self.peer.detach().await;
                return Err(e);
            }
        }

        if let Err(e) = self.shim.open_peer(&self.peer).await {
            self.peer.close().await;
            let _ = driver.await;
            self.peer.detach().await;
            return Err(e);
        }
        self.hooks.on_open(&self.peer).await;
        if self.is_terminated() {
            self.peer.close().await;
        }

        let result = driver.await;
        self.peer.detach().await;
        info!("connection to {} closed", url);
        self.hooks.on_close(&self.peer).await;

        if let Err(e) = result {
            bail!("connection driver failed: {}", e);
        }
        Ok(())
    }
}
