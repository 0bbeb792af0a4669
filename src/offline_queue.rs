use std::collections::VecDeque;
use rustc_hash::FxHashMap;
use tokio::time::Instant;
use tracing::{debug, warn};
use crate::config::OfflineQueueConfig;
use crate::peer::PeerId;
use crate::wire::message_id::MessageId;
use crate::wire::WireFrame;

struct QueuedMessage {
    id: MessageId,
    frames: Vec<WireFrame>,
    num_bytes: usize,
    queued_at: Instant,
}

#[derive(Default)]
struct PeerQueue {
    messages: VecDeque<QueuedMessage>,
    num_bytes: usize,
}

/// Frames of messages that were sent while their peer's connection was not open. They are
///  replayed when the peer's connection opens, in the order they were queued.
///
/// Queues are keyed by peer id and survive the peer's connection: they are discarded only by
///  being replayed or by expiring.
pub struct OfflineQueue {
    config: OfflineQueueConfig,
    queues: FxHashMap<PeerId, PeerQueue>,
}

impl OfflineQueue {
    pub fn new(config: OfflineQueueConfig) -> OfflineQueue {
        OfflineQueue {
            config,
            queues: FxHashMap::default(),
        }
    }

    /// Appends a message's frames to the peer's queue. If the peer's byte cap is reached, the
    ///  remaining frames of the message are dropped. Returns the number of frames that were
    ///  actually queued.
    pub fn enqueue(&mut self, peer_id: &PeerId, id: MessageId, frames: Vec<WireFrame>) -> usize {
        self.expire();

        let cap = self.config.max_bytes_per_peer;
        let queue = self.queues.entry(peer_id.clone()).or_default();

        let num_offered = frames.len();
        let mut accepted = Vec::with_capacity(num_offered);
        let mut num_bytes = 0;
        for frame in frames {
            if queue.num_bytes + num_bytes + frame.len() > cap {
                warn!("offline queue for peer {} is full ({} bytes) - dropping {} of {} frames of {:?}",
                    peer_id, queue.num_bytes + num_bytes, num_offered - accepted.len(), num_offered, id);
                break;
            }
            num_bytes += frame.len();
            accepted.push(frame);
        }

        let num_accepted = accepted.len();
        if num_accepted > 0 {
            debug!("queued {} frames ({} bytes) of {:?} for offline peer {}", num_accepted, num_bytes, id, peer_id);
            queue.num_bytes += num_bytes;
            queue.messages.push_back(QueuedMessage {
                id,
                frames: accepted,
                num_bytes,
                queued_at: Instant::now(),
            });
        }
        else if queue.messages.is_empty() {
            self.queues.remove(peer_id);
        }
        num_accepted
    }

    /// Removes and returns all unexpired frames queued for the peer, in queueing order
    pub fn drain(&mut self, peer_id: &PeerId) -> Vec<WireFrame> {
        self.expire();

        let Some(queue) = self.queues.remove(peer_id) else {
            return Vec::new();
        };
        debug!("replaying {} queued messages ({} bytes) for peer {}", queue.messages.len(), queue.num_bytes, peer_id);
        queue.messages.into_iter()
            .flat_map(|m| m.frames)
            .collect()
    }

    pub fn queued_bytes(&self, peer_id: &PeerId) -> usize {
        self.queues.get(peer_id)
            .map(|q| q.num_bytes)
            .unwrap_or(0)
    }

    pub fn queued_messages(&self, peer_id: &PeerId) -> usize {
        self.queues.get(peer_id)
            .map(|q| q.messages.len())
            .unwrap_or(0)
    }

    /// Discards all messages that were queued longer than the resend expiry ago
    pub fn expire(&mut self) {
        let expiry = self.config.resend_expiry;
        let now = Instant::now();

        self.queues.retain(|peer_id, queue| {
            while let Some(oldest) = queue.messages.front() {
                if now.duration_since(oldest.queued_at) < expiry {
                    break;
                }
                if let Some(expired) = queue.messages.pop_front() {
                    debug!("discarding {:?} queued for peer {}: resend expiry elapsed", expired.id, peer_id);
                    queue.num_bytes -= expired.num_bytes;
                }
            }
            !queue.messages.is_empty()
        });
    }
}
