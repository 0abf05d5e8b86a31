//! Session multiplexing over the WebSocket uplink
//!
//! Provides:
//! - Frame encoding/decoding (two-byte prefix)
//! - Session table
//! - Priority send scheduler (single uplink writer)
//! - Peer: uplink demultiplexer, per-session forwarders, lifecycle

mod frame;
mod peer;
mod scheduler;
mod session;

pub use frame::{is_reserved_session, ConnectFrame, Frame, PREFIX_DELETE};
pub use peer::{run, ExternalResource, Peer, PeerState, Shutdown};
pub use scheduler::{
    uplink_channel, UplinkQueues, UplinkSender, CONTROL_QUEUE_CAPACITY, DATA_QUEUE_CAPACITY,
};
pub use session::{SessionEntry, SessionTable};

use thiserror::Error;

/// Tunnel layer errors
#[derive(Debug, Error)]
pub enum TunnelError {
    #[error("invalid frame: {0}")]
    InvalidFrame(String),

    #[error("reserved session id: {0}")]
    ReservedSession(u16),

    #[error("duplicate session id: {0}")]
    DuplicateSession(u16),

    #[error("uplink closed")]
    UplinkClosed,

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Read buffer size for session forwarders (one DATA frame per read)
pub const FORWARD_BUFFER_SIZE: usize = 32 * 1024;
