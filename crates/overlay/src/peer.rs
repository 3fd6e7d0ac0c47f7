//! Peer sessions: handshake enforcement and typed message dispatch.
//!
//! One `Peer` exists per connected neighbor. It owns the transport
//! (TCP or loopback), enforces the HELLO handshake under a bounded
//! timer, and routes every post-handshake message to the collaborator
//! that interprets it.
//!
//! # Lifecycle
//!
//! ```text
//! Connecting --connect--> Connected --HELLO--> GotHello --disconnect--> Closed
//! ```
//!
//! State is monotone and `Closed` is terminal. `disconnect` is
//! idempotent: it cancels the handshake timer, shuts the transport down,
//! and posts exactly one deregistration to the registry.
//!
//! Sessions are shared objects: the registry, pending scheduler
//! callbacks, and in-flight I/O all reference them. Long-lived
//! continuations hold [`Weak`] references so a dropped session is
//! reaped promptly instead of being kept alive by its own timers.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use concord_common::Hash256;
use concord_wire::{DontHave, Hello, Message, MessageType, PeerAddress};

use crate::codec::FrameCodec;
use crate::gateway::{ConsensusGateway, HerderGateway, OverlayGateway, PeerRegistry};
use crate::loopback::LoopbackTransport;
use crate::scheduler::{Scheduler, TimerHandle};
use crate::{OverlayConfig, OverlayError, Result};

/// Which side opened the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerRole {
    /// We dialed out.
    Initiator,
    /// We accepted the connection.
    Acceptor,
}

/// Session state. Ordering matters: handshake checks compare against
/// `GotHello`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum PeerState {
    /// Outbound connection in flight.
    Connecting,
    /// Transport is up, HELLO not yet received.
    Connected,
    /// Handshake complete; user-level traffic flows.
    GotHello,
    /// Terminal.
    Closed,
}

/// What the remote told us in its HELLO.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteInfo {
    /// The remote's overlay protocol version.
    pub protocol_version: u32,
    /// The remote's software version string.
    pub version_str: String,
    /// The port the remote accepts connections on.
    pub listening_port: u16,
}

/// Everything a session needs from its host: configuration, scheduling,
/// and the collaborator gateways.
pub struct PeerContext {
    /// Overlay configuration.
    pub config: OverlayConfig,
    /// Event scheduler.
    pub scheduler: Scheduler,
    /// Transaction-side collaborator.
    pub herder: Arc<dyn HerderGateway>,
    /// Overlay-side collaborator.
    pub overlay: Arc<dyn OverlayGateway>,
    /// Consensus-side collaborator.
    pub consensus: Arc<dyn ConsensusGateway>,
    /// Session registry.
    pub registry: Arc<dyn PeerRegistry>,
}

/// A session with one neighbor.
pub struct Peer {
    ctx: Arc<PeerContext>,
    role: PeerRole,
    transport: Transport,
    state: Mutex<PeerState>,
    remote: Mutex<Option<RemoteInfo>>,
    hello_timer: Mutex<Option<TimerHandle>>,
    dropped: AtomicBool,
    // Known to be valid for the session's whole life; lets &self methods
    // hand out Arcs to the registry and gateways.
    self_ref: Weak<Peer>,
}

impl Peer {
    fn build(
        ctx: Arc<PeerContext>,
        role: PeerRole,
        state: PeerState,
        make_transport: impl FnOnce() -> Transport,
    ) -> Arc<Self> {
        Arc::new_cyclic(|self_ref| Self {
            ctx,
            role,
            transport: make_transport(),
            state: Mutex::new(state),
            remote: Mutex::new(None),
            hello_timer: Mutex::new(None),
            dropped: AtomicBool::new(false),
            self_ref: self_ref.clone(),
        })
    }

    fn self_arc(&self) -> Option<Arc<Peer>> {
        self.self_ref.upgrade()
    }

    /// Create a loopback-backed session. The caller links the pair and
    /// registers it; see [`LoopbackConnection`].
    ///
    /// [`LoopbackConnection`]: crate::loopback::LoopbackConnection
    pub(crate) fn new_loopback(ctx: Arc<PeerContext>, role: PeerRole) -> Arc<Self> {
        let scheduler = ctx.scheduler.clone();
        let peer = Self::build(ctx, role, PeerState::Connected, || {
            Transport::Loopback(LoopbackTransport::new(scheduler))
        });
        peer.start();
        peer
    }

    /// Dial a peer over TCP. On connect success the session sends HELLO.
    pub async fn connect(ctx: Arc<PeerContext>, addr: &PeerAddress) -> Result<Arc<Self>> {
        debug!(%addr, "connecting");
        let stream = TcpStream::connect((addr.host.as_str(), addr.port))
            .await
            .map_err(|err| OverlayError::ConnectionFailed(format!("{}: {}", addr, err)))?;
        let peer = Self::from_tcp_stream(ctx, stream, PeerRole::Initiator)?;
        peer.connected();
        Ok(peer)
    }

    /// Wrap an accepted TCP stream as an acceptor-role session.
    pub fn accept(ctx: Arc<PeerContext>, stream: TcpStream) -> Result<Arc<Self>> {
        Self::from_tcp_stream(ctx, stream, PeerRole::Acceptor)
    }

    fn from_tcp_stream(
        ctx: Arc<PeerContext>,
        stream: TcpStream,
        role: PeerRole,
    ) -> Result<Arc<Self>> {
        stream.set_nodelay(true)?;
        let remote_ip = stream.peer_addr()?.ip().to_string();

        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();

        let initial = match role {
            PeerRole::Initiator => PeerState::Connecting,
            PeerRole::Acceptor => PeerState::Connected,
        };
        let tcp = TcpTransport {
            outbound,
            remote_ip,
            cancel: cancel.clone(),
        };
        let peer = Self::build(ctx.clone(), role, initial, || Transport::Tcp(tcp));
        peer.start();
        peer.spawn_tcp_tasks(stream, outbound_rx, cancel);
        ctx.registry.add_peer(peer.clone());
        Ok(peer)
    }

    /// Arm the handshake timer and, for acceptors, schedule the HELLO at
    /// the next tick.
    pub(crate) fn start(&self) {
        let weak = self.self_ref.clone();
        let timer = self
            .ctx
            .scheduler
            .schedule_after(self.ctx.config.handshake_timeout, move || {
                if let Some(peer) = weak.upgrade() {
                    peer.on_handshake_timeout();
                }
            });
        *self.hello_timer.lock() = Some(timer);

        if self.role == PeerRole::Acceptor {
            let weak = self.self_ref.clone();
            self.ctx.scheduler.post(move || {
                if let Some(peer) = weak.upgrade() {
                    peer.send_hello();
                }
            });
        }
    }

    /// The outbound connect completed: the initiator greets first.
    pub(crate) fn connected(&self) {
        {
            let mut state = self.state.lock();
            if *state == PeerState::Closed {
                return;
            }
            if *state == PeerState::Connecting {
                *state = PeerState::Connected;
            }
        }
        self.send_hello();
    }

    /// Which side opened this session.
    pub fn role(&self) -> PeerRole {
        self.role
    }

    /// Current session state.
    pub fn state(&self) -> PeerState {
        *self.state.lock()
    }

    /// What the remote said in its HELLO, once received.
    pub fn remote_info(&self) -> Option<RemoteInfo> {
        self.remote.lock().clone()
    }

    /// The remote's address, as far as the transport knows it.
    pub fn ip(&self) -> String {
        match &self.transport {
            Transport::Tcp(tcp) => tcp.remote_ip.clone(),
            Transport::Loopback(_) => "<loopback>".to_string(),
        }
    }

    /// The loopback knobs, when this session runs over the in-process
    /// transport.
    pub fn loopback(&self) -> Option<&LoopbackTransport> {
        match &self.transport {
            Transport::Loopback(loopback) => Some(loopback),
            Transport::Tcp(_) => None,
        }
    }

    /// Queue `msg` for ordered transmission. Fire-and-forget: transport
    /// failures surface through the read side and drop the session.
    pub fn send(&self, msg: Message) {
        if self.dropped.load(Ordering::SeqCst) {
            return;
        }
        trace!(ty = %msg.message_type(), "send");
        match &self.transport {
            Transport::Tcp(tcp) => tcp.send(msg),
            Transport::Loopback(loopback) => loopback.enqueue(FrameCodec::encode_body(&msg)),
        }
    }

    fn send_hello(&self) {
        self.send(Message::Hello(Hello {
            protocol_version: self.ctx.config.protocol_version,
            version_str: self.ctx.config.version_str.clone(),
            listening_port: self.ctx.config.listening_port,
        }));
    }

    fn send_dont_have(&self, kind: MessageType, req_hash: Hash256) {
        self.send(Message::DontHave(DontHave { kind, req_hash }));
    }

    fn send_peers(&self) {
        self.send(Message::Peers(self.ctx.registry.peer_address_hints()));
    }

    /// Raw bytes arrived (loopback path). Undecodable bytes drop the
    /// session.
    pub(crate) fn recv_frame(&self, bytes: &[u8]) {
        match FrameCodec::decode_body(bytes) {
            Ok(msg) => self.recv_message(msg),
            Err(err) => {
                warn!(ip = %self.ip(), %err, "dropping session on malformed frame");
                self.disconnect();
            }
        }
    }

    /// A decoded message arrived. Dispatches by type; everything except
    /// HELLO requires a completed handshake.
    pub fn recv_message(&self, msg: Message) {
        let state = self.state();
        if state == PeerState::Closed {
            return;
        }
        let msg_type = msg.message_type();
        trace!(ty = %msg_type, ?state, "recv");

        if state < PeerState::GotHello && !matches!(msg, Message::Hello(_)) {
            warn!(
                ip = %self.ip(),
                ty = %msg_type,
                "message before handshake, dropping session"
            );
            self.disconnect();
            return;
        }

        // Dispatch handlers run synchronously and must never call back
        // into this session's recv path; anything they trigger on other
        // sessions goes through those sessions' own queues.
        let Some(me) = self.self_arc() else {
            return;
        };

        match msg {
            Message::Hello(hello) => self.recv_hello(hello),
            Message::ErrorMsg(err) => {
                warn!(ip = %self.ip(), code = err.code, msg = %err.message, "peer reported error");
            }
            Message::DontHave(dont_have) => match dont_have.kind {
                MessageType::TxSet => {
                    self.ctx.herder.doesnt_have_tx_set(&dont_have.req_hash, &me)
                }
                MessageType::QuorumSet => self
                    .ctx
                    .overlay
                    .doesnt_have_quorum_set(&dont_have.req_hash, &me),
                other => trace!(kind = %other, "DONT_HAVE for untracked item kind"),
            },
            Message::GetPeers => self.send_peers(),
            Message::Peers(addrs) => {
                debug!(count = addrs.len(), "received peer address hints");
            }
            Message::GetTxSet(id) => match self.ctx.herder.fetch_tx_set(&id, false) {
                Some(set) => self.send(Message::TxSet(set)),
                None => self.send_dont_have(MessageType::TxSet, id),
            },
            Message::TxSet(set) => self.ctx.herder.recv_tx_set(set),
            Message::GetQuorumSet(id) => match self.ctx.overlay.fetch_quorum_set(&id, false) {
                Some(qset) => self.send(Message::QuorumSet(qset)),
                None => self.send_dont_have(MessageType::QuorumSet, id),
            },
            Message::QuorumSet(qset) => self.ctx.overlay.recv_quorum_set(qset),
            Message::Transaction(tx) => {
                if self.ctx.herder.recv_transaction(tx.clone()) {
                    // Accepted into our pending set: flood onward.
                    self.ctx
                        .overlay
                        .broadcast_message(Message::Transaction(tx), &me);
                }
            }
            Message::FbaMessage(envelope) => {
                let flood_id = Hash256::hash(&envelope.signature.0);
                let ledger_index = envelope.statement.slot_index;
                self.ctx.overlay.recv_flooded_msg(
                    flood_id,
                    Message::FbaMessage(envelope.clone()),
                    ledger_index,
                    &me,
                );
                self.ctx.consensus.recv_statement(envelope);
            }
            Message::GetHistory { .. }
            | Message::History(_)
            | Message::GetDelta { .. }
            | Message::Delta(_)
            | Message::GetValidations { .. }
            | Message::Validations(_) => {
                // Catchup traffic belongs to the history subsystem.
                debug!(ty = %msg_type, "catchup message ignored by this node");
            }
        }
    }

    fn recv_hello(&self, hello: Hello) {
        {
            let state = self.state.lock();
            if *state == PeerState::Closed {
                return;
            }
            if *state == PeerState::GotHello {
                drop(state);
                warn!(ip = %self.ip(), "duplicate HELLO, dropping session");
                self.disconnect();
                return;
            }
        }

        if hello.protocol_version != self.ctx.config.protocol_version {
            warn!(
                ip = %self.ip(),
                theirs = hello.protocol_version,
                ours = self.ctx.config.protocol_version,
                "protocol version mismatch, dropping session"
            );
            self.disconnect();
            return;
        }

        debug!(
            ip = %self.ip(),
            version = %hello.version_str,
            port = hello.listening_port,
            "handshake complete"
        );
        *self.remote.lock() = Some(RemoteInfo {
            protocol_version: hello.protocol_version,
            version_str: hello.version_str,
            listening_port: hello.listening_port,
        });
        *self.state.lock() = PeerState::GotHello;

        if let Some(timer) = self.hello_timer.lock().take() {
            timer.cancel();
        }

        let accepted = match self.self_arc() {
            Some(me) => self.ctx.registry.is_peer_accepted(&me),
            None => false,
        };
        if !accepted {
            debug!(ip = %self.ip(), "registry refused peer, hinting alternatives");
            self.send_peers();
            self.disconnect();
        }
    }

    fn on_handshake_timeout(&self) {
        if self.state() < PeerState::GotHello {
            warn!(ip = %self.ip(), "{}", OverlayError::HandshakeTimeout);
            self.disconnect();
        }
    }

    /// Tear the session down. Idempotent: the first call wins, cancels
    /// the handshake timer, posts one deregistration, and shuts the
    /// transport down.
    pub fn disconnect(&self) {
        if self.dropped.swap(true, Ordering::SeqCst) {
            return;
        }
        debug!(ip = %self.ip(), "closing session");
        *self.state.lock() = PeerState::Closed;

        if let Some(timer) = self.hello_timer.lock().take() {
            timer.cancel();
        }

        if let Some(me) = self.self_arc() {
            self.ctx.scheduler.post(move || {
                me.ctx.registry.drop_peer(&me);
            });
        }

        match &self.transport {
            Transport::Tcp(tcp) => tcp.shutdown(),
            Transport::Loopback(loopback) => loopback.sever(&self.ctx.scheduler),
        }
    }

    fn spawn_tcp_tasks(
        &self,
        stream: TcpStream,
        mut outbound_rx: mpsc::UnboundedReceiver<Message>,
        cancel: CancellationToken,
    ) {
        let framed = tokio_util::codec::Framed::new(stream, FrameCodec::new());
        let (mut sink, mut frames) = framed.split();

        // Writer: drains the outbound queue. The queued message owns its
        // buffer until the write completes.
        let weak = self.self_ref.clone();
        let write_cancel = cancel.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = write_cancel.cancelled() => break,
                    next = outbound_rx.recv() => match next {
                        Some(msg) => {
                            if let Err(err) = sink.send(msg).await {
                                if let Some(peer) = weak.upgrade() {
                                    warn!(ip = %peer.ip(), %err, "write failed, dropping session");
                                    peer.disconnect();
                                }
                                break;
                            }
                        }
                        None => break,
                    },
                }
            }
        });

        // Reader: header/body alternation lives in the codec; any error
        // or EOF closes the session.
        let weak = self.self_ref.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    frame = frames.next() => {
                        let Some(peer) = weak.upgrade() else { break };
                        match frame {
                            Some(Ok(msg)) => peer.recv_message(msg),
                            Some(Err(err)) => {
                                warn!(ip = %peer.ip(), %err, "read failed, dropping session");
                                peer.disconnect();
                                break;
                            }
                            None => {
                                debug!(ip = %peer.ip(), "peer closed connection");
                                peer.disconnect();
                                break;
                            }
                        }
                    }
                }
            }
        });
    }
}

/// Transport capability set: send, shut down, identify. A tagged variant
/// rather than a trait object so loopback knobs stay reachable.
pub(crate) enum Transport {
    Tcp(TcpTransport),
    Loopback(LoopbackTransport),
}

/// TCP transport half: an outbound queue drained by the writer task plus
/// a cancellation token shared with both I/O tasks.
pub(crate) struct TcpTransport {
    outbound: mpsc::UnboundedSender<Message>,
    remote_ip: String,
    cancel: CancellationToken,
}

impl TcpTransport {
    fn send(&self, msg: Message) {
        // A closed channel means the writer task is gone; the reader side
        // notices the dead socket and drops the session.
        let _ = self.outbound.send(msg);
    }

    fn shutdown(&self) {
        self.cancel.cancel();
    }
}

/// Accepts inbound TCP sessions.
pub struct Listener {
    listener: TcpListener,
    local_addr: std::net::SocketAddr,
}

impl Listener {
    /// Bind to `port` on all interfaces; port 0 picks a free port.
    pub async fn bind(port: u16) -> Result<Self> {
        let listener = TcpListener::bind(("0.0.0.0", port)).await?;
        let local_addr = listener.local_addr()?;
        debug!(%local_addr, "listening");
        Ok(Self {
            listener,
            local_addr,
        })
    }

    /// The bound address.
    pub fn local_addr(&self) -> std::net::SocketAddr {
        self.local_addr
    }

    /// Accept the next connection as an acceptor-role session.
    pub async fn accept(&self, ctx: Arc<PeerContext>) -> Result<Arc<Peer>> {
        let (stream, remote_addr) = self.listener.accept().await?;
        debug!(%remote_addr, "accepted connection");
        Peer::accept(ctx, stream)
    }
}
