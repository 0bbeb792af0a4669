//! Bidirectional action invocation (RPC) over persistent WebSocket connections.
//!
//! Two peers exchange named *actions* with JSON payloads of arbitrary size. A payload is
//!  optionally compressed, split into id-prefixed binary chunk frames framed by textual control
//!  frames, and reassembled on the other side. An invocation is acknowledged as soon as its
//!  header arrives and completes asynchronously with an [action::outcome::ActionOutcome].
//!
//! A [shim::Shim] owns all protocol state of one process. [connection::client::ShimClient]
//!  keeps a connection to a server alive with reconnect backoff and ping / pong liveness checks,
//!  [connection::server::ShimServer] accepts and authenticates connections. Sends to a peer
//!  without an open connection are queued and replayed when it reconnects.

pub mod action;
pub mod config;
pub mod connection;
pub mod offline_queue;
pub mod peer;
pub mod reassembly;
pub mod shim;
pub mod util;
pub mod wire;

pub mod test_util;


#[cfg(test)]
mod test {
    use tracing::Level;

    #[ctor::ctor]
    fn init_test_logging() {
        tracing_subscriber::fmt()
            .with_max_level(Level::TRACE)
            .try_init()
            .ok();
    }
}
