//! A peer is the shim's view of the process on the other end of a connection.

use std::fmt::{Debug, Display, Formatter};
use anyhow::anyhow;
use tokio::sync::{mpsc, oneshot, Mutex, MutexGuard};
use tracing::{debug, trace};
use crate::peer::identity::{requests_bidirectional_auth, Identity};
use crate::wire::{Outbound, WireFrame};

pub mod identity;

#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerId(String);

impl PeerId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}
impl From<&str> for PeerId {
    fn from(value: &str) -> Self {
        PeerId(value.to_string())
    }
}
impl From<String> for PeerId {
    fn from(value: String) -> Self {
        PeerId(value)
    }
}
impl Display for PeerId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}
impl Debug for PeerId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "peer#{}", self.0)
    }
}

/// Which side initiated the connection
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum PeerSide {
    /// accepted by a server
    Accepted,
    /// dialed by a client
    Dialed,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Open,
    Closed,
}

/// What is known about the upgrade request that established a connection
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ConnectionRequest {
    /// the full URL for dialed connections, path and query for accepted ones
    pub uri: String,
    pub headers: Vec<(String, String)>,
}

impl ConnectionRequest {
    pub fn new(uri: &str) -> ConnectionRequest {
        ConnectionRequest {
            uri: uri.to_string(),
            headers: Vec::new(),
        }
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn requests_bidirectional_auth(&self) -> bool {
        requests_bidirectional_auth(&self.uri)
    }
}

pub(crate) struct PeerLink {
    pub state: ConnectionState,
    pub request: Option<ConnectionRequest>,
    pub outbound: Option<mpsc::UnboundedSender<Outbound>>,
    /// who is on the other end - this is what inbound invocations are authorized against
    pub remote_identity: Option<Identity>,
    /// who the other end says we are
    pub local_identity: Option<Identity>,
    pub handshake: Option<oneshot::Sender<()>>,
}

impl PeerLink {
    pub fn send(&self, outbound: Outbound) -> anyhow::Result<()> {
        self.outbound.as_ref()
            .ok_or_else(|| anyhow!("no connection"))?
            .send(outbound)
            .map_err(|_| anyhow!("connection is gone"))
    }
}

/// A peer outlives its connections: a client keeps the same peer across reconnects, and sends
///  to a peer without an open connection go to the offline queue. The connection itself is
///  represented by the sender half of its writer's channel, which is attached when a connection
///  is established and detached when it closes.
pub struct Peer {
    id: PeerId,
    side: PeerSide,
    link: Mutex<PeerLink>,
}

impl Debug for Peer {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}({:?})", self.id, self.side)
    }
}

impl Peer {
    pub fn new(id: PeerId, side: PeerSide) -> Peer {
        Peer {
            id,
            side,
            link: Mutex::new(PeerLink {
                state: ConnectionState::Closed,
                request: None,
                outbound: None,
                remote_identity: None,
                local_identity: None,
                handshake: None,
            }),
        }
    }

    pub fn id(&self) -> &PeerId {
        &self.id
    }

    pub fn side(&self) -> PeerSide {
        self.side
    }

    pub(crate) async fn link(&self) -> MutexGuard<'_, PeerLink> {
        self.link.lock().await
    }

    pub async fn state(&self) -> ConnectionState {
        self.link.lock().await.state
    }

    pub async fn request(&self) -> Option<ConnectionRequest> {
        self.link.lock().await.request.clone()
    }

    pub async fn remote_identity(&self) -> Option<Identity> {
        self.link.lock().await.remote_identity.clone()
    }

    pub async fn local_identity(&self) -> Option<Identity> {
        self.link.lock().await.local_identity.clone()
    }

    pub async fn set_remote_identity(&self, identity: Identity) {
        self.link.lock().await.remote_identity = Some(identity);
    }

    pub async fn set_local_identity(&self, identity: Identity) {
        self.link.lock().await.local_identity = Some(identity);
    }

    /// Attaches a new connection. Until it is opened, sends to the peer are queued.
    pub async fn attach(&self, request: ConnectionRequest, outbound: mpsc::UnboundedSender<Outbound>) {
        let mut link = self.link.lock().await;
        debug!("attaching connection to {:?}", self.id);
        link.state = ConnectionState::Connecting;
        link.request = Some(request);
        link.outbound = Some(outbound);
        link.handshake = None;
    }

    pub async fn detach(&self) {
        let mut link = self.link.lock().await;
        debug!("detaching connection from {:?}", self.id);
        link.state = ConnectionState::Closed;
        link.outbound = None;
        link.handshake = None;
        link.remote_identity = None;
    }

    /// Sends a frame directly, regardless of the connection state. This is for the frames that
    ///  establish a connection, and for acknowledgements which are meaningless if queued.
    pub async fn send_control(&self, frame: WireFrame) -> anyhow::Result<()> {
        trace!("control frame to {:?}: {:?}", self.id, frame);
        self.link.lock().await.send(Outbound::Frame(frame))
    }

    /// Asks the connection's writer to close the connection
    pub async fn close(&self) {
        let link = self.link.lock().await;
        if link.send(Outbound::Close).is_err() {
            trace!("closing {:?}: no connection", self.id);
        }
    }

    /// Registers a pending handshake, returning the receiver that fires when it completes
    pub async fn begin_handshake(&self) -> oneshot::Receiver<()> {
        let (send, recv) = oneshot::channel();
        self.link.lock().await.handshake = Some(send);
        recv
    }

    pub async fn is_handshake_pending(&self) -> bool {
        self.link.lock().await.handshake.is_some()
    }

    /// Returns `false` if there was no pending handshake
    pub async fn complete_handshake(&self) -> bool {
        match self.link.lock().await.handshake.take() {
            Some(send) => {
                let _ = send.send(());
                true
            }
            None => false,
        }
    }
}
