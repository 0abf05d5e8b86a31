//! # Veil Tunnel
//!
//! A tunneling proxy client that multiplexes many local SOCKS5 sessions
//! over a single authenticated, TLS-encrypted WebSocket uplink.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │                Local Applications                    │
//! │              (SOCKS5, method NONE)                   │
//! ├─────────────────────────────────────────────────────┤
//! │                SOCKS5 Acceptor                       │
//! │      (negotiation, session id = remote port)         │
//! ├─────────────────────────────────────────────────────┤
//! │              Session Multiplexing                    │
//! │   (session table, forwarders, priority scheduler)    │
//! ├─────────────────────────────────────────────────────┤
//! │                 Frame Codec                          │
//! │        (two-byte prefix binary frames)               │
//! ├─────────────────────────────────────────────────────┤
//! │             Transport (TLS + WebSocket)              │
//! │     (DoH resolution, ESNI keys, auth headers)        │
//! └─────────────────────────────────────────────────────┘
//! ```

pub mod auth;
pub mod client;
pub mod config;
pub mod resolve;
pub mod socks;
pub mod transport;
pub mod tunnel;

pub use client::Client;
pub use config::Config;

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Auth error: {0}")]
    Auth(#[from] auth::AuthError),

    #[error("Resolve error: {0}")]
    Resolve(#[from] resolve::ResolveError),

    #[error("Transport error: {0}")]
    Transport(#[from] transport::TransportError),

    #[error("Tunnel error: {0}")]
    Tunnel(#[from] tunnel::TunnelError),

    #[error("SOCKS error: {0}")]
    Socks(#[from] socks::SocksError),

    #[error("Connection closed")]
    ConnectionClosed,
}
