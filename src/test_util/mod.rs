use std::sync::Arc;
use tokio::sync::mpsc;
use crate::config::ShimConfig;
use crate::peer::identity::AnonymousAuth;
use crate::peer::{ConnectionRequest, Peer};
use crate::shim::Shim;
use crate::wire::control_frame::ControlFrame;
use crate::wire::{Outbound, WireFrame};

pub mod loopback;

/// convenience for test code: a shim with default configuration that authenticates everybody
///  anonymously
pub fn test_shim() -> Arc<Shim> {
    test_shim_with_config(ShimConfig::default())
}

pub fn test_shim_with_config(config: ShimConfig) -> Arc<Shim> {
    Shim::new(config, Arc::new(AnonymousAuth), None)
        .expect("test configuration should be valid")
}

/// Stands in for a connection's writer: attaches to a peer and records everything the shim
///  writes to it
pub struct FrameTracker {
    outbound: mpsc::UnboundedReceiver<Outbound>,
}

impl FrameTracker {
    pub async fn attach(peer: &Peer, uri: &str) -> FrameTracker {
        let (send, outbound) = mpsc::unbounded_channel();
        peer.attach(ConnectionRequest::new(uri), send).await;
        FrameTracker { outbound }
    }

    /// everything written so far, without waiting
    pub fn drain(&mut self) -> Vec<Outbound> {
        let mut result = Vec::new();
        while let Ok(outbound) = self.outbound.try_recv() {
            result.push(outbound);
        }
        result
    }

    pub async fn next(&mut self) -> Option<Outbound> {
        self.outbound.recv().await
    }

    /// waits for the next frame, panicking if it is not a text frame with a control frame
    pub async fn next_control_frame(&mut self) -> ControlFrame {
        match self.next().await {
            Some(Outbound::Frame(WireFrame::Text(text))) => ControlFrame::parse(&text)
                .unwrap_or_else(|e| panic!("invalid control frame {:?}: {}", text, e)),
            other => panic!("expected a control frame, was {:?}", other),
        }
    }

    pub fn assert_nothing_written(&mut self) {
        let written = self.drain();
        assert!(written.is_empty(), "expected no output, was {:?}", written);
    }
}
