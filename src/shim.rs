use std::collections::hash_map::Entry;
use std::sync::Arc;
use std::time::Duration;
use anyhow::{anyhow, bail};
use rustc_hash::FxHashMap;
use serde_json::Value;
use tokio::sync::{Mutex, RwLock};
use tokio::time::{self, Instant};
use tracing::{debug, error, info, trace, warn};
use crate::action::invocation::{InvocationHandle, InvocationRegistry};
use crate::action::outcome::{ActionErrorKind, ActionOutcome};
use crate::action::{ActionCall, ActionHandler, ActionRegistry, Authorization, InvokeMetadata};
use crate::config::{Pacing, SendOptions, ShimConfig};
use crate::offline_queue::OfflineQueue;
use crate::peer::identity::{decode_token, encode_token, AuthHandler, AuthRequest, AuthTokenProvider, Identity};
use crate::peer::{ConnectionRequest, ConnectionState, Peer, PeerId, PeerSide};
use crate::reassembly::{CompletedMessage, ReassemblyTable};
use crate::util::random::RngRandom;
use crate::wire::chunk_codec::{ack_frame, OutgoingMessage};
use crate::wire::control_frame::{ControlFrame, MessageStart};
use crate::wire::message_id::MessageId;
use crate::wire::{MessageType, Outbound, WireFrame};

/// What the connection should do after a frame was handled
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum FrameDisposition {
    Continue,
    Close,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SendStatus {
    /// all frames were handed to the connection's writer
    Sent,
    /// the peer's connection is not open, so the frames went to the offline queue
    Queued,
}

/// One instance of the protocol. It owns the registries for actions, invocations and peers and
///  the offline queue, and it is shared by all connections of a client or server.
///
/// Connection drivers feed every inbound frame to [Shim::on_frame] together with their
///  connection's reassembly table.
pub struct Shim {
    config: ShimConfig,
    actions: ActionRegistry,
    invocations: InvocationRegistry,
    peers: RwLock<FxHashMap<PeerId, Arc<Peer>>>,
    offline_queue: Mutex<OfflineQueue>,
    auth_handler: Arc<dyn AuthHandler>,
    token_provider: Option<Arc<dyn AuthTokenProvider>>,
}

impl Shim {
    pub fn new(config: ShimConfig, auth_handler: Arc<dyn AuthHandler>, token_provider: Option<Arc<dyn AuthTokenProvider>>) -> anyhow::Result<Arc<Shim>> {
        config.validate()?;
        Ok(Arc::new(Shim {
            invocations: InvocationRegistry::new(config.invocation_grace_period),
            offline_queue: Mutex::new(OfflineQueue::new(config.offline_queue.clone())),
            config,
            actions: ActionRegistry::default(),
            peers: Default::default(),
            auth_handler,
            token_provider,
        }))
    }

    pub fn config(&self) -> &ShimConfig {
        &self.config
    }

    pub fn invocations(&self) -> &InvocationRegistry {
        &self.invocations
    }

    pub async fn register_action(&self, name: &str, authorization: Authorization, handler: Arc<dyn ActionHandler>) -> anyhow::Result<()> {
        self.actions.register(name, authorization, handler).await
    }

    pub async fn add_peer(&self, id: PeerId, side: PeerSide) -> anyhow::Result<Arc<Peer>> {
        match self.peers.write().await
            .entry(id.clone())
        {
            Entry::Occupied(_) => {
                Err(anyhow!("peer {:?} is already registered", id))
            }
            Entry::Vacant(e) => {
                let peer = Arc::new(Peer::new(id, side));
                e.insert(peer.clone());
                Ok(peer)
            }
        }
    }

    /// Unregisters a peer, failing the invocations that still wait for it. Frames queued for
    ///  the peer stay in the offline queue until they expire.
    pub async fn remove_peer(&self, id: &PeerId) -> Option<Arc<Peer>> {
        let removed = self.peers.write().await.remove(id);
        if removed.is_some() {
            debug!("removed peer {:?}", id);
            self.invocations.fail_all_for_peer(id, ActionErrorKind::Disconnected, "peer disconnected").await;
        }
        removed
    }

    pub async fn peer(&self, id: &PeerId) -> Option<Arc<Peer>> {
        self.peers.read().await
            .get(id)
            .cloned()
    }

    pub async fn peer_ids(&self) -> Vec<PeerId> {
        let mut ids = self.peers.read().await
            .keys()
            .cloned()
            .collect::<Vec<_>>();
        ids.sort();
        ids
    }

    pub async fn queued_bytes(&self, peer_id: &PeerId) -> usize {
        self.offline_queue.lock().await.queued_bytes(peer_id)
    }

    /// Marks a peer's attached connection as open after replaying whatever was queued for the
    ///  peer while it was offline. Sends that start after this see the open state, so their
    ///  frames go out after the replayed ones.
    pub async fn open_peer(&self, peer: &Peer) -> anyhow::Result<()> {
        let mut link = peer.link().await;
        if link.outbound.is_none() {
            bail!("opening {:?} without a connection", peer.id());
        }

        let queued = self.offline_queue.lock().await.drain(peer.id());
        if !queued.is_empty() {
            debug!("replaying {} queued frames to {:?}", queued.len(), peer.id());
        }
        for frame in queued {
            link.send(Outbound::Frame(frame))?;
        }

        link.state = ConnectionState::Open;
        info!("connection to {:?} is open", peer.id());
        Ok(())
    }

    /// Sends a message of any type to a peer, queueing it if the peer's connection is not open.
    pub async fn send_message(&self, peer_id: &PeerId, message_type: MessageType, metadata: &str, payload: Vec<u8>, options: &SendOptions) -> anyhow::Result<SendStatus> {
        let peer = self.peer(peer_id).await
            .ok_or_else(|| anyhow!("unknown peer {:?}", peer_id))?;
        self.send_to(&peer, message_type, metadata, payload, options).await
    }

    async fn send_to(&self, peer: &Peer, message_type: MessageType, metadata: &str, payload: Vec<u8>, options: &SendOptions) -> anyhow::Result<SendStatus> {
        options.validate()?;

        let uncompressed_len = payload.len();
        let body = options.compression.compress_offloaded(payload).await?;
        let message = OutgoingMessage {
            id: MessageId::random::<RngRandom>(),
            message_type,
            compression: options.compression,
            metadata: metadata.to_string(),
            body,
        };
        trace!("sending {:?} to {:?}: {} bytes, {} after {}", message.id, peer.id(), uncompressed_len, message.body.len(), message.compression);

        let frames = message.encode_frames(options.slice_size);
        self.transmit(peer, message.id, frames, options.pacing).await
    }

    async fn transmit(&self, peer: &Peer, id: MessageId, frames: Vec<WireFrame>, pacing: Pacing) -> anyhow::Result<SendStatus> {
        // the state check and queueing are atomic with regard to open_peer's replay
        let link = peer.link().await;
        if link.state != ConnectionState::Open {
            self.offline_queue.lock().await
                .enqueue(peer.id(), id, frames);
            return Ok(SendStatus::Queued);
        }
        let outbound = link.outbound.clone()
            .ok_or_else(|| anyhow!("{:?} is open without a connection", peer.id()))?;
        drop(link);

        for frame in frames {
            let is_chunk = matches!(frame, WireFrame::Binary(_));
            outbound.send(Outbound::Frame(frame))
                .map_err(|_| anyhow!("connection to {:?} closed while sending {:?}", peer.id(), id))?;
            if is_chunk {
                pause(pacing).await;
            }
        }
        Ok(SendStatus::Sent)
    }

    /// Starts an invocation of an action on a peer. The invocation's header and chunks are sent
    ///  without waiting for the peer's acknowledgement; the returned handle allows waiting for
    ///  the acknowledgement and the result separately.
    ///
    /// A failure to send is reported through the handle's result rather than as an error.
    pub async fn invoke_action(&self, peer_id: &PeerId, name: &str, payload: &Value, options: &SendOptions) -> anyhow::Result<InvocationHandle> {
        let peer = self.peer(peer_id).await
            .ok_or_else(|| anyhow!("unknown peer {:?}", peer_id))?;

        let handle = self.invocations.register(peer_id.clone(), name, options.timeout).await;
        let metadata = serde_json::to_string(&InvokeMetadata {
            name: name.to_string(),
            iid: handle.iid().to_string(),
        })?;
        let body = serde_json::to_vec(payload)?;

        match self.send_to(&peer, MessageType::ActionInvoke, &metadata, body, options).await {
            Ok(SendStatus::Sent) => debug!("invoked {:?} on {:?} as {}", name, peer_id, handle.iid()),
            Ok(SendStatus::Queued) => debug!("queued invocation {} of {:?} for offline {:?}", handle.iid(), name, peer_id),
            Err(e) => {
                warn!("failed to send invocation {} of {:?}: {:#}", handle.iid(), name, e);
                self.invocations.complete(handle.iid(), ActionOutcome::error(ActionErrorKind::Disconnected, e.to_string())).await;
            }
        }
        Ok(handle)
    }

    /// Invokes an action and waits for its result, with the options' timeout covering both the
    ///  acknowledgement and the result
    pub async fn call_action(&self, peer_id: &PeerId, name: &str, payload: &Value, options: &SendOptions) -> ActionOutcome {
        let deadline = Instant::now() + options.timeout;
        let mut handle = match self.invoke_action(peer_id, name, payload, options).await {
            Ok(handle) => handle,
            Err(e) => return ActionOutcome::error(ActionErrorKind::Disconnected, e.to_string()),
        };

        let _ = time::timeout_at(deadline, handle.wait_for_ack()).await;
        handle.wait_for_result(deadline.saturating_duration_since(Instant::now())).await
    }

    /// Waits for the result of an invocation that is identified only by its id
    pub async fn wait_for_action_result(&self, iid: &str, timeout: Duration) -> ActionOutcome {
        match self.invocations.handle(iid).await {
            Some(mut handle) => handle.wait_for_result(timeout).await,
            None => ActionOutcome::error(ActionErrorKind::Protocol, format!("unknown invocation {}", iid)),
        }
    }

    /// Handles a single inbound frame of a peer's connection. Errors are contained here: a
    ///  frame that can not be handled is logged and dropped, and only authentication failures
    ///  ask for the connection to be closed.
    pub async fn on_frame(self: &Arc<Self>, peer: &Arc<Peer>, table: &mut ReassemblyTable, frame: WireFrame) -> FrameDisposition {
        let result = match frame {
            WireFrame::Binary(data) => {
                crate::wire::binary_frame::ChunkFrame::decode(&data)
                    .and_then(|(id, chunk)| table.chunk(&id, chunk))
                    .map(|_| FrameDisposition::Continue)
            }
            WireFrame::Text(text) => self.on_control_frame(peer, table, &text).await,
        };

        match result {
            Ok(disposition) => disposition,
            Err(e) => {
                warn!("protocol error on connection to {:?}, dropping frame: {:#}", peer.id(), e);
                FrameDisposition::Continue
            }
        }
    }

    async fn on_control_frame(self: &Arc<Self>, peer: &Arc<Peer>, table: &mut ReassemblyTable, text: &str) -> anyhow::Result<FrameDisposition> {
        match ControlFrame::parse(text)? {
            ControlFrame::Start(start) => self.on_start(peer, table, start).await?,
            ControlFrame::Ack { id, iid, accepted } => {
                trace!("acknowledgement {:?} for invocation {}: {}", id, iid, accepted);
                if !self.invocations.acknowledge(&iid, accepted).await {
                    debug!("acknowledgement for unknown invocation {} - ignoring", iid);
                }
            }
            ControlFrame::Range { id, start, end } => table.range(&id, start, end)?,
            ControlFrame::End { id } => {
                if let Some(completed) = table.end(&id)? {
                    self.on_message(peer, completed).await?;
                }
            }
            ControlFrame::UserData(data) => return Ok(self.on_user_data(peer, &data).await),
            ControlFrame::AuthToken(token) => return Ok(self.on_auth_token(peer, &token).await),
        }
        Ok(FrameDisposition::Continue)
    }

    async fn on_start(&self, peer: &Peer, table: &mut ReassemblyTable, start: MessageStart) -> anyhow::Result<()> {
        if start.message_type != MessageType::ActionInvoke {
            return table.start(&start);
        }

        if table.contains(&start.id) {
            bail!("message id {:?} is already in flight", start.id);
        }
        let metadata: InvokeMetadata = serde_json::from_str(&start.metadata)?;

        if !self.actions.contains(&metadata.name).await {
            warn!("{:?} invoked unknown action {:?} - rejecting", peer.id(), metadata.name);
            table.skip(&start.id)?;
            peer.send_control(ack_frame(start.id, &metadata.iid, false)).await?;
            return Ok(());
        }

        table.start(&start)?;
        peer.send_control(ack_frame(start.id, &metadata.iid, true)).await
    }

    async fn on_message(self: &Arc<Self>, peer: &Arc<Peer>, message: CompletedMessage) -> anyhow::Result<()> {
        let body = message.compression
            .decompress_offloaded(message.body, self.config.max_message_size)
            .await?;

        match message.message_type {
            MessageType::ActionInvoke => {
                let metadata: InvokeMetadata = serde_json::from_str(&message.metadata)?;
                let shim = self.clone();
                let peer = peer.clone();
                tokio::spawn(async move {
                    shim.run_action(peer, metadata, body).await;
                });
            }
            MessageType::ActionReturn => {
                let iid = message.metadata;
                let outcome = serde_json::from_slice::<ActionOutcome>(&body)
                    .unwrap_or_else(|e| ActionOutcome::error(ActionErrorKind::Protocol, format!("malformed result: {}", e)));
                if !self.invocations.complete(&iid, outcome).await {
                    debug!("result for unknown invocation {} - already reaped or never sent", iid);
                }
            }
            MessageType::ActionAck => {
                bail!("acknowledgement {:?} with a message body", message.id);
            }
        }
        Ok(())
    }

    /// Runs an invoked action and sends its outcome back as a return message
    async fn run_action(&self, peer: Arc<Peer>, metadata: InvokeMetadata, body: Vec<u8>) {
        let outcome = match serde_json::from_slice::<Value>(&body) {
            Ok(payload) => self.execute_action(&peer, &metadata.name, payload).await,
            Err(e) => ActionOutcome::error(ActionErrorKind::Protocol, format!("malformed payload: {}", e)),
        };

        let body = match serde_json::to_vec(&outcome) {
            Ok(body) => body,
            Err(e) => {
                error!("failed to serialize the result of invocation {}: {}", metadata.iid, e);
                return;
            }
        };
        if let Err(e) = self.send_to(&peer, MessageType::ActionReturn, &metadata.iid, body, &self.config.send_options).await {
            warn!("failed to send the result of invocation {} to {:?}: {:#}", metadata.iid, peer.id(), e);
        }
    }

    async fn execute_action(&self, peer: &Peer, name: &str, payload: Value) -> ActionOutcome {
        let Some(action) = self.actions.get(name).await else {
            return ActionOutcome::error(ActionErrorKind::UnknownAction, format!("no action {:?}", name));
        };

        let identity = peer.remote_identity().await.unwrap_or_default();
        let mut call = ActionCall::new(peer.id().clone(), identity, payload);
        if !action.authorization.authorize(&mut call) {
            warn!("{:?} ({:?}) is not authorized to invoke {:?}", peer.id(), call.identity.id, name);
            return ActionOutcome::error(ActionErrorKind::Unauthorized, format!("not authorized to invoke {:?}", name));
        }

        // on a separate task so that a panicking handler is contained
        let handler = action.handler.clone();
        match tokio::spawn(async move { handler.handle(call).await }).await {
            Ok(Ok(data)) => ActionOutcome::ok(data),
            Ok(Err(e)) => {
                debug!("action {:?} failed: {:#}", name, e);
                ActionOutcome::error(ActionErrorKind::Handler, e.to_string())
            }
            Err(e) => {
                error!("action {:?} panicked: {}", name, e);
                ActionOutcome::error(ActionErrorKind::Handler, format!("action {:?} panicked", name))
            }
        }
    }

    async fn on_user_data(&self, peer: &Peer, data: &str) -> FrameDisposition {
        let identity = match Identity::from_base64(data, self.config.max_identity_len) {
            Ok(identity) => identity,
            Err(e) => {
                warn!("invalid identity pushed by {:?} - closing: {:#}", peer.id(), e);
                return FrameDisposition::Close;
            }
        };

        match peer.side() {
            PeerSide::Dialed => {
                debug!("{:?} asserted our identity as {:?}", peer.id(), identity.id);
                peer.set_local_identity(identity).await;
            }
            PeerSide::Accepted => {
                if !peer.is_handshake_pending().await {
                    warn!("{:?} pushed an identity outside of a handshake - ignoring", peer.id());
                    return FrameDisposition::Continue;
                }
                let Some(token_provider) = &self.token_provider else {
                    warn!("{:?} pushed an identity, but no token provider is configured - closing", peer.id());
                    return FrameDisposition::Close;
                };
                let identity = match token_provider.verify_identity(peer.id(), identity).await {
                    Ok(identity) => identity,
                    Err(e) => {
                        warn!("identity pushed by {:?} was rejected - closing: {:#}", peer.id(), e);
                        return FrameDisposition::Close;
                    }
                };
                debug!("{:?} authenticated as {:?}", peer.id(), identity.id);
                peer.set_remote_identity(identity).await;
                peer.complete_handshake().await;
            }
        }
        FrameDisposition::Continue
    }

    /// A client's side of the bidirectional-auth handshake
    async fn on_auth_token(&self, peer: &Peer, encoded: &str) -> FrameDisposition {
        if peer.side() != PeerSide::Dialed {
            warn!("{:?} sent an auth token to a server - ignoring", peer.id());
            return FrameDisposition::Continue;
        }

        match self.answer_auth_token(peer, encoded).await {
            Ok(()) => FrameDisposition::Continue,
            Err(e) => {
                warn!("authentication with {:?} failed - closing: {:#}", peer.id(), e);
                FrameDisposition::Close
            }
        }
    }

    async fn answer_auth_token(&self, peer: &Peer, encoded: &str) -> anyhow::Result<()> {
        let request = AuthRequest {
            connection: peer.request().await.unwrap_or_default(),
            token: Some(decode_token(encoded)?),
        };
        let identity = self.auth_handler.authenticate(peer.id(), &request).await?;

        peer.send_control(WireFrame::Text(ControlFrame::UserData(identity.to_base64()?).to_text())).await?;
        debug!("authenticated with {:?} as {:?}", peer.id(), identity.id);
        peer.set_local_identity(identity).await;
        peer.complete_handshake().await;
        Ok(())
    }

    /// A server's side of authentication for an accepted connection: either the bidirectional
    ///  handshake if the connection URL asks for it, or asserting the identity established by
    ///  the auth handler.
    pub async fn authenticate_accepted(&self, peer: &Peer, request: &ConnectionRequest, handshake_timeout: Duration) -> anyhow::Result<()> {
        if request.requests_bidirectional_auth() {
            let token_provider = self.token_provider.as_ref()
                .ok_or_else(|| anyhow!("bidirectional auth requested, but no token provider is configured"))?;
            let token = token_provider.issue_token(peer.id(), request).await?;

            let handshake = peer.begin_handshake().await;
            peer.send_control(WireFrame::Text(ControlFrame::AuthToken(encode_token(&token)).to_text())).await?;
            time::timeout(handshake_timeout, handshake).await
                .map_err(|_| anyhow!("no identity from {:?} within {:?}", peer.id(), handshake_timeout))?
                .map_err(|_| anyhow!("connection to {:?} closed during handshake", peer.id()))?;
        }
        else {
            let auth_request = AuthRequest {
                connection: request.clone(),
                token: None,
            };
            let identity = self.auth_handler.authenticate(peer.id(), &auth_request).await?;
            peer.send_control(WireFrame::Text(ControlFrame::UserData(identity.to_base64()?).to_text())).await?;
            debug!("{:?} authenticated as {:?}", peer.id(), identity.id);
            peer.set_remote_identity(identity).await;
        }
        Ok(())
    }
}

async fn pause(pacing: Pacing) {
    match pacing {
        Pacing::Interval(interval) => time::sleep(interval).await,
        Pacing::NoDelay => {}
        Pacing::Yield => tokio::task::yield_now().await,
    }
}
