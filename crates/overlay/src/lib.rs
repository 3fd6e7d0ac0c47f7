//! Peer overlay for concord.
//!
//! The overlay moves consensus envelopes and item exchange between
//! nodes. It provides:
//!
//! - **Framing** — 4-byte big-endian length prefix over any ordered byte
//!   stream ([`FrameCodec`])
//! - **Sessions** — one [`Peer`] per neighbor, enforcing the HELLO
//!   handshake under a 2-second timer and dispatching typed messages to
//!   collaborator gateways
//! - **Loopback** — an in-process transport with the same session
//!   contract plus duplicate/reorder/damage/drop fault injection
//!   ([`LoopbackConnection`])
//! - **Registry** — the [`PeerRegistry`] seam plus a simple in-memory
//!   [`PeerSet`]
//!
//! # Session protocol
//!
//! Every session begins with a HELLO exchange. Acceptors greet at the
//! next scheduler tick; initiators greet when their connect completes.
//! Until HELLO arrives, any other message — or 2000 ms of silence —
//! drops the session. A HELLO with the wrong protocol version drops it
//! too. After the handshake, messages dispatch per type to the herder,
//! overlay, and consensus gateways; flood messages fan out to every
//! other session.
//!
//! Sessions are single-shot: any transport error, malformed frame, or
//! protocol violation closes the session, and the registry decides
//! whether to dial again.

mod codec;
mod error;
mod gateway;
mod loopback;
mod peer;
mod registry;
mod scheduler;

pub use codec::{FrameCodec, MAX_MESSAGE_SIZE};
pub use error::OverlayError;
pub use gateway::{ConsensusGateway, HerderGateway, OverlayGateway, PeerRegistry};
pub use loopback::{LoopbackConnection, LoopbackStats, LoopbackTransport};
pub use peer::{Listener, Peer, PeerContext, PeerRole, PeerState, RemoteInfo};
pub use registry::PeerSet;
pub use scheduler::{Scheduler, TimerHandle};

// The wire types sessions speak.
pub use concord_wire::{
    DontHave, ErrorMsg, Hello, Message, MessageType, PeerAddress, Transaction, TxSet,
};

use std::time::Duration;

/// Result type for overlay operations.
pub type Result<T> = std::result::Result<T, OverlayError>;

/// Overlay protocol version spoken by this build. Sessions advertising a
/// different version are refused.
pub const PROTOCOL_VERSION: u32 = 1;

/// How long a session may sit without a HELLO before it is dropped.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_millis(2000);

/// Overlay configuration. Plain data; loading it from disk is the
/// host's business.
#[derive(Debug, Clone)]
pub struct OverlayConfig {
    /// Protocol version advertised in HELLO and required of peers.
    pub protocol_version: u32,
    /// Software version string advertised in HELLO.
    pub version_str: String,
    /// Port advertised in HELLO for return connections.
    pub listening_port: u16,
    /// Sessions allowed before the registry refuses newcomers.
    pub max_peers: usize,
    /// Handshake deadline.
    pub handshake_timeout: Duration,
}

impl Default for OverlayConfig {
    fn default() -> Self {
        Self {
            protocol_version: PROTOCOL_VERSION,
            version_str: format!("concord {}", env!("CARGO_PKG_VERSION")),
            listening_port: 39133,
            max_peers: 30,
            handshake_timeout: HANDSHAKE_TIMEOUT,
        }
    }
}
