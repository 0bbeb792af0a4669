use std::net::SocketAddr;
use std::time::Duration;
use anyhow::bail;
use crate::peer::identity::Identity;
use crate::wire::compression::Compression;

/// How a sender paces consecutive chunks of a single message
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Pacing {
    /// sleep for the given duration after each chunk
    Interval(Duration),
    /// write all chunks back-to-back
    NoDelay,
    /// give other tasks a chance to run after each chunk, without sleeping
    Yield,
}

#[derive(Clone, Debug)]
pub struct SendOptions {
    pub compression: Compression,
    /// Maximum number of payload bytes per binary chunk frame
    pub slice_size: usize,
    pub pacing: Pacing,
    /// Overall time a caller is willing to wait for an invocation's result
    pub timeout: Duration,
}

impl Default for SendOptions {
    fn default() -> Self {
        SendOptions {
            compression: Compression::Zlib,
            slice_size: 2048,
            pacing: Pacing::Interval(Duration::from_millis(1)),
            timeout: Duration::from_millis(7000),
        }
    }
}

impl SendOptions {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.slice_size == 0 {
            bail!("slice size must be positive");
        }
        if self.timeout.is_zero() {
            bail!("send timeout must be positive");
        }
        Ok(())
    }
}

#[derive(Clone, Debug)]
pub struct OfflineQueueConfig {
    /// Cap on the bytes of all frames queued for a single peer. Frames that would exceed it are
    ///  dropped (and logged).
    pub max_bytes_per_peer: usize,
    /// Queued messages older than this are discarded rather than replayed
    pub resend_expiry: Duration,
}

impl Default for OfflineQueueConfig {
    fn default() -> Self {
        OfflineQueueConfig {
            max_bytes_per_peer: 10 * 1024 * 1024,
            resend_expiry: Duration::from_secs(600),
        }
    }
}

#[derive(Clone, Debug)]
pub struct ShimConfig {
    pub send_options: SendOptions,
    pub offline_queue: OfflineQueueConfig,

    /// Upper bound for a message's declared content length, and for its size after
    ///  decompression. Larger messages are protocol errors.
    pub max_message_size: usize,

    /// Upper bound for the summed declared lengths of the messages being received on one
    ///  connection. Start frames beyond it are protocol errors.
    pub max_in_flight_bytes: usize,

    /// Time a completed invocation stays registered so that duplicate or late frames for it
    ///  are recognized
    pub invocation_grace_period: Duration,

    /// Maximum length of the base64 payload of an identity push; longer pushes close the connection
    pub max_identity_len: usize,
}

impl Default for ShimConfig {
    fn default() -> Self {
        ShimConfig {
            send_options: SendOptions::default(),
            offline_queue: OfflineQueueConfig::default(),
            max_message_size: 64 * 1024 * 1024,
            max_in_flight_bytes: 128 * 1024 * 1024,
            invocation_grace_period: Duration::from_secs(30),
            max_identity_len: 2048,
        }
    }
}

impl ShimConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        self.send_options.validate()?;
        if self.max_message_size == 0 {
            bail!("max message size must be positive");
        }
        if self.max_in_flight_bytes < self.max_message_size {
            bail!("max in-flight bytes must be at least the max message size");
        }
        if self.offline_queue.max_bytes_per_peer == 0 {
            bail!("offline queue cap must be positive");
        }
        Ok(())
    }
}

#[derive(Clone, Debug)]
pub struct ClientConfig {
    /// The id under which the remote server is registered as a peer. It stays the same across
    ///  reconnects so that sends queued while offline are replayed on the next connection.
    pub peer_id: String,

    pub ping_interval: Duration,
    /// A connection is closed if no pong was seen for this long. A session that lasted at least
    ///  this long resets the reconnect backoff.
    pub max_pong_wait: Duration,

    pub reconnect_base_delay: Duration,
    /// Upper bound of the uniformly distributed jitter added to every reconnect delay
    pub reconnect_jitter: Duration,
    pub max_reconnect_delay: Duration,

    /// How long to wait for the server's auth token in a bidirectional-auth handshake
    pub handshake_timeout: Duration,

    /// Identity attributed to the server when it invokes actions on this client
    pub server_identity: Identity,
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig {
            peer_id: "server".to_string(),
            ping_interval: Duration::from_millis(15_000),
            max_pong_wait: Duration::from_millis(30_000),
            reconnect_base_delay: Duration::from_millis(500),
            reconnect_jitter: Duration::from_millis(7000),
            max_reconnect_delay: Duration::from_millis(600_000),
            handshake_timeout: Duration::from_millis(7000),
            server_identity: Identity::default(),
        }
    }
}

impl ClientConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.peer_id.is_empty() {
            bail!("peer id must not be empty");
        }
        if self.ping_interval.is_zero() {
            bail!("ping interval must be positive");
        }
        if self.max_pong_wait < self.ping_interval {
            bail!("max pong wait must be at least the ping interval");
        }
        if self.max_reconnect_delay < self.reconnect_base_delay {
            bail!("max reconnect delay must be at least the base delay");
        }
        Ok(())
    }
}

#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub bind_addr: SocketAddr,
    /// How long a client has to push its identity in a bidirectional-auth handshake
    pub handshake_timeout: Duration,
}

impl ServerConfig {
    pub fn new(bind_addr: SocketAddr) -> ServerConfig {
        ServerConfig {
            bind_addr,
            handshake_timeout: Duration::from_millis(7000),
        }
    }
}
