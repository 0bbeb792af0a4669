use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::trace;
use crate::peer::{ConnectionRequest, Peer, PeerId, PeerSide};
use crate::reassembly::ReassemblyTable;
use crate::shim::{FrameDisposition, Shim};
use crate::wire::Outbound;

/// Connects a peer of one shim with a peer of another shim in memory, without a socket. Each
///  direction has its own reassembly table, like a real connection.
pub struct LoopbackLink {
    left: Arc<Peer>,
    right: Arc<Peer>,
    pumps: Vec<JoinHandle<()>>,
}

impl LoopbackLink {
    /// Links two existing peers and opens both
    pub async fn link(left_shim: &Arc<Shim>, left: &Arc<Peer>, right_shim: &Arc<Shim>, right: &Arc<Peer>) -> anyhow::Result<LoopbackLink> {
        let link = LoopbackLink::connect(left_shim, left, right_shim, right).await;
        left_shim.open_peer(left).await?;
        right_shim.open_peer(right).await?;
        Ok(link)
    }

    /// Links two existing peers, leaving them in `Connecting` state
    pub async fn connect(left_shim: &Arc<Shim>, left: &Arc<Peer>, right_shim: &Arc<Shim>, right: &Arc<Peer>) -> LoopbackLink {
        let (left_send, left_recv) = mpsc::unbounded_channel();
        let (right_send, right_recv) = mpsc::unbounded_channel();
        left.attach(ConnectionRequest::new("/loopback"), left_send).await;
        right.attach(ConnectionRequest::new("/loopback"), right_send).await;

        let pumps = vec![
            tokio::spawn(pump(left_recv, right_shim.clone(), right.clone(), left.clone())),
            tokio::spawn(pump(right_recv, left_shim.clone(), left.clone(), right.clone())),
        ];

        LoopbackLink {
            left: left.clone(),
            right: right.clone(),
            pumps,
        }
    }

    /// Registers a peer `right` on the left shim and a peer `left` on the right shim, and links them
    pub async fn pair(left_shim: &Arc<Shim>, right_shim: &Arc<Shim>) -> anyhow::Result<(Arc<Peer>, Arc<Peer>, LoopbackLink)> {
        let left = left_shim.add_peer(PeerId::from("right"), PeerSide::Dialed).await?;
        let right = right_shim.add_peer(PeerId::from("left"), PeerSide::Accepted).await?;
        let link = LoopbackLink::link(left_shim, &left, right_shim, &right).await?;
        Ok((left, right, link))
    }

    pub async fn close(self) {
        for pump in &self.pumps {
            pump.abort();
        }
        self.left.detach().await;
        self.right.detach().await;
    }
}

async fn pump(mut outbound: mpsc::UnboundedReceiver<Outbound>, to_shim: Arc<Shim>, to_peer: Arc<Peer>, from_peer: Arc<Peer>) {
    let mut table = ReassemblyTable::new(to_shim.config().max_message_size, to_shim.config().max_in_flight_bytes);
    while let Some(outbound) = outbound.recv().await {
        match outbound {
            Outbound::Frame(frame) => {
                if to_shim.on_frame(&to_peer, &mut table, frame).await == FrameDisposition::Close {
                    break;
                }
            }
            Outbound::Close => break,
        }
    }
    trace!("loopback from {:?} to {:?} closed", from_peer, to_peer);
    from_peer.detach().await;
    to_peer.detach().await;
}
