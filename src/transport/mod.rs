//! TLS + WebSocket transport setup
//!
//! The uplink is dialed by IP (resolved over DoH, never plaintext DNS)
//! while the TLS layer presents the configured hostname, and the
//! WebSocket upgrade carries the auth headers.

use rustls::pki_types::ServerName;
use rustls::{ClientConfig, RootCertStore};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::{client_async, WebSocketStream};
use tracing::debug;

/// Remote TLS port; the uplink always rides ordinary HTTPS
pub const TLS_PORT: u16 = 443;

/// Transport layer errors
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("header value not representable: {0}")]
    InvalidHeader(String),
}

/// The established uplink stream type
pub type Uplink = WebSocketStream<TlsStream<TcpStream>>;

fn tls_config() -> ClientConfig {
    let root_store = RootCertStore {
        roots: webpki_roots::TLS_SERVER_ROOTS.to_vec(),
    };
    ClientConfig::builder()
        .with_root_certificates(root_store)
        .with_no_client_auth()
}

/// Dial TCP to the resolved address, wrap it in TLS presenting `host`
/// as the server name, and upgrade to a WebSocket at `wss://host:443/`
/// with the `username` and `token` auth headers.
pub async fn dial(
    ip: Ipv4Addr,
    host: &str,
    username: &str,
    token: &str,
) -> Result<Uplink, TransportError> {
    let addr = SocketAddr::new(IpAddr::V4(ip), TLS_PORT);
    let tcp = TcpStream::connect(addr).await?;
    tcp.set_nodelay(true).ok();

    let connector = TlsConnector::from(Arc::new(tls_config()));
    let server_name = ServerName::try_from(host.to_string())
        .map_err(|e| TransportError::Tls(format!("invalid server name '{}': {}", host, e)))?;
    let tls = connector
        .connect(server_name, tcp)
        .await
        .map_err(|e| TransportError::Tls(e.to_string()))?;
    debug!(host, ip = %addr.ip(), "TLS handshake complete");

    let mut request = format!("wss://{}:{}/", host, TLS_PORT).into_client_request()?;
    let headers = request.headers_mut();
    headers.insert(
        "username",
        HeaderValue::from_str(username)
            .map_err(|_| TransportError::InvalidHeader("username".to_string()))?,
    );
    headers.insert(
        "token",
        HeaderValue::from_str(token)
            .map_err(|_| TransportError::InvalidHeader("token".to_string()))?,
    );

    let (ws, response) = client_async(request, tls).await?;
    debug!(status = %response.status(), "WebSocket upgrade complete");
    Ok(ws)
}
