//! Tunnel client: construction and run loop
//!
//! Construction performs the whole transport setup (DoH resolution of
//! the server, ESNI key retrieval, TLS + WebSocket dial with the auth
//! token) and fails on any error before a local socket is opened.
//! `run` then serves the local SOCKS5 listener until shutdown.

use crate::auth;
use crate::config::{ClientConfig, Config, DohProvider};
use crate::resolve::{self, DohClient, ResolveError};
use crate::socks::{self, Address};
use crate::transport::{self, Uplink};
use crate::tunnel::{self, ExternalResource, Peer, UplinkQueues};
use std::net::Ipv4Addr;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::net::{TcpListener, TcpStream};
use tracing::{info, warn};

/// Tunnel client over one authenticated uplink
pub struct Client {
    conf: ClientConfig,
    ws: Uplink,
    peer: Peer,
    queues: UplinkQueues,
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client").field("conf", &self.conf).finish_non_exhaustive()
    }
}

impl Client {
    /// Build a client from configuration. Resolves the server over DoH,
    /// validates its ESNI keys, and dials the TLS WebSocket uplink.
    pub async fn connect(config: Config) -> crate::Result<Self> {
        let conf = config
            .client
            .ok_or_else(|| crate::Error::Config("missing [client] section".to_string()))?;

        let provider: DohProvider = conf.doh.parse()?;
        let doh = DohClient::new(provider)?;

        info!(server = %conf.server, provider = %provider, "resolving server address");
        let ip = doh.lookup_ipv4(&conf.server).await?;

        if conf.esni {
            let keys = resolve::fetch_esni_keys(&doh, &conf.server).await?;
            let now = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_secs())
                .unwrap_or(0);
            if !keys.valid_at(now) {
                return Err(ResolveError::InvalidEsniKeys(
                    "record outside its validity window".to_string(),
                )
                .into());
            }
            // rustls carries no draft-ESNI support. The published keys
            // are still validated above so a broken record fails
            // construction, then the dial proceeds with plain SNI.
            warn!(
                server = %conf.server,
                "ESNI keys validated, but the TLS stack cannot encrypt SNI; \
                 dialing with plain SNI (set client.esni = false to silence)"
            );
        }

        let token = auth::seal_token(&conf.password)?;
        let ws = transport::dial(ip, &conf.server, &conf.username, &token).await?;
        info!(server = %conf.server, ip = %ip, "uplink established");

        let (peer, queues) = Peer::new();
        Ok(Self {
            conf,
            ws,
            peer,
            queues,
        })
    }

    /// Handle for observing state and triggering shutdown
    pub fn peer(&self) -> Peer {
        self.peer.clone()
    }

    /// Local SOCKS5 listen port
    pub fn local_port(&self) -> u16 {
        self.conf.port
    }

    /// Register an external resource released at shutdown
    pub fn add_resource(&self, resource: Box<dyn ExternalResource>) {
        self.peer.add_resource(resource);
    }

    /// Bind the local SOCKS5 listener and serve until shutdown.
    /// Returns after the listener is closed and all tasks have observed
    /// shutdown.
    pub async fn run(self) -> crate::Result<()> {
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, self.conf.port)).await?;
        info!(port = self.conf.port, "SOCKS5 listener ready");

        tunnel::run(self.peer, self.queues, self.ws, listener).await?;
        info!("client stopped");
        Ok(())
    }

    /// Dial a destination through a running client's local listener and
    /// return the stream once the remote's success reply arrives.
    pub async fn dial(local_port: u16, target: &Address) -> crate::Result<TcpStream> {
        let mut stream = TcpStream::connect((Ipv4Addr::LOCALHOST, local_port)).await?;
        socks::client_connect(&mut stream, target).await?;
        Ok(stream)
    }
}
