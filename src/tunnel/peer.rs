//! Peer: the client side of the uplink
//!
//! One reader task owns the WebSocket read half and hands each owned
//! message buffer to a short-lived dispatch task; one writer task owns
//! the write half and drains the priority queues; the acceptor
//! registers local SOCKS5 connections and spawns a forwarder per
//! session. The shutdown token is a broadcast signal observed at every
//! loop head.

use super::frame::{is_reserved_session, ConnectFrame, Frame};
use super::scheduler::{uplink_channel, UplinkQueues, UplinkSender};
use super::session::{SessionEntry, SessionTable};
use super::{TunnelError, FORWARD_BUFFER_SIZE};
use crate::socks::{self, Address, SocksError};
use bytes::Bytes;
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, error, info, warn};

/// Broadcast shutdown token. Once raised it is never lowered.
#[derive(Clone)]
pub struct Shutdown {
    tx: Arc<watch::Sender<bool>>,
    rx: watch::Receiver<bool>,
}

impl Shutdown {
    pub fn new() -> Self {
        let (tx, rx) = watch::channel(false);
        Self {
            tx: Arc::new(tx),
            rx,
        }
    }

    /// Raise the token. Returns true if this call raised it.
    pub fn trigger(&self) -> bool {
        !self.tx.send_replace(true)
    }

    pub fn is_triggered(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolve once the token is raised
    pub async fn triggered(&mut self) {
        // An error means the sender dropped, which only happens after
        // the peer itself is gone.
        let _ = self.rx.wait_for(|raised| *raised).await;
    }
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

/// Externally supplied handle released at shutdown. The configuration
/// source may hand over e.g. a database connection whose only
/// obligation here is to be closed.
pub trait ExternalResource: Send + Sync {
    fn close(&self);
}

const STATE_RUNNING: u8 = 0;
const STATE_CLOSING: u8 = 1;
const STATE_CLOSED: u8 = 2;

/// Peer lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    Running,
    Closing,
    Closed,
}

struct PeerInner {
    table: SessionTable,
    uplink: UplinkSender,
    shutdown: Shutdown,
    state: AtomicU8,
    resources: Mutex<Vec<Box<dyn ExternalResource>>>,
}

/// Shared handle to the multiplexer state
#[derive(Clone)]
pub struct Peer {
    inner: Arc<PeerInner>,
}

impl Peer {
    /// Create a peer and the queue half for its writer task
    pub fn new() -> (Self, UplinkQueues) {
        let (uplink, queues) = uplink_channel();
        let peer = Self {
            inner: Arc::new(PeerInner {
                table: SessionTable::new(),
                uplink,
                shutdown: Shutdown::new(),
                state: AtomicU8::new(STATE_RUNNING),
                resources: Mutex::new(Vec::new()),
            }),
        };
        (peer, queues)
    }

    /// Clone of the shutdown token
    pub fn shutdown(&self) -> Shutdown {
        self.inner.shutdown.clone()
    }

    /// Current lifecycle state
    pub fn state(&self) -> PeerState {
        match self.inner.state.load(Ordering::SeqCst) {
            STATE_RUNNING => PeerState::Running,
            STATE_CLOSING => PeerState::Closing,
            _ => PeerState::Closed,
        }
    }

    /// Number of live sessions
    pub fn session_count(&self) -> usize {
        self.inner.table.len()
    }

    /// Register an external resource to release at shutdown
    pub fn add_resource(&self, resource: Box<dyn ExternalResource>) {
        self.inner.resources.lock().unwrap().push(resource);
    }

    /// Tear the peer down. Idempotent: only the first call acts.
    pub fn close(&self) {
        if self
            .inner
            .state
            .compare_exchange(STATE_RUNNING, STATE_CLOSING, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return;
        }
        debug!("closing peer");

        self.inner.shutdown.trigger();
        self.inner.uplink.shut();

        let dropped = self.inner.table.drain();
        if dropped > 0 {
            info!(sessions = dropped, "dropped sessions at shutdown");
        }

        for resource in self.inner.resources.lock().unwrap().drain(..) {
            resource.close();
        }

        self.inner.state.store(STATE_CLOSED, Ordering::SeqCst);
    }

    /// Retire a session and, if this was the first retirement, emit a
    /// CLOSE frame on the control queue. Every CLOSE emission in the
    /// peer funnels through here, so an id is closed at most once.
    async fn send_close(&self, session: u16) {
        if !self.inner.table.retire(session) {
            return;
        }
        let frame = match Frame::close(session) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(session, error = %e, "cannot encode close frame");
                return;
            }
        };
        if self
            .inner
            .uplink
            .send_control(Message::Binary(frame.encode()))
            .await
            .is_err()
        {
            debug!(session, "close frame dropped at shutdown");
        }
    }

    /// Inbound DELETE: the remote already tore the session down, so the
    /// record goes away without an answering frame.
    fn handle_delete(&self, session: u16) {
        if self.inner.table.retire(session) {
            debug!(session, "session deleted by peer");
        }
    }

    /// Inbound CONNECT reply: relay it to the local socket as a SOCKS5
    /// reply.
    async fn handle_connect_reply(&self, reply: ConnectFrame) {
        let session = reply.session;
        if self.inner.table.is_close_sent(session) {
            return;
        }

        let entry = match self.inner.table.get(session) {
            Some(entry) => entry,
            None => {
                debug!(session, "connect reply for unknown session");
                self.send_close(session).await;
                return;
            }
        };

        let delivered = {
            let mut writer = entry.writer.lock().await;
            socks::write_reply(&mut *writer, reply.rep, &reply.addr).await
        };

        if let Err(e) = delivered {
            debug!(session, error = %e, "failed to deliver connect reply");
            self.send_close(session).await;
            return;
        }

        if reply.rep != socks::REP_SUCCESS {
            debug!(session, rep = reply.rep, "remote refused connect");
            self.inner.table.retire(session);
        }
    }

    /// Inbound DATA: write the payload to the session's local socket
    async fn handle_data(&self, session: u16, payload: Bytes) {
        if self.inner.table.is_close_sent(session) {
            return;
        }

        let entry = match self.inner.table.get(session) {
            Some(entry) => entry,
            None => {
                debug!(session, "data for unknown session");
                self.send_close(session).await;
                return;
            }
        };

        let written = {
            let mut writer = entry.writer.lock().await;
            writer.write_all(&payload).await
        };

        if let Err(e) = written {
            debug!(session, error = %e, "local write failed");
            self.send_close(session).await;
        }
    }
}

/// Run the peer over an established WebSocket and local listener.
/// Returns once the listener is closed and every task has observed
/// shutdown.
pub async fn run<S>(
    peer: Peer,
    queues: UplinkQueues,
    ws: WebSocketStream<S>,
    listener: TcpListener,
) -> Result<(), TunnelError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (sink, mut stream) = ws.split();

    let writer = tokio::spawn(run_writer(peer.clone(), queues, sink));
    let acceptor = tokio::spawn(run_acceptor(peer.clone(), listener));

    let mut shutdown = peer.shutdown();
    let mut result = Ok(());
    loop {
        tokio::select! {
            _ = shutdown.triggered() => break,
            message = stream.next() => match message {
                Some(Ok(Message::Binary(payload))) => {
                    // The message buffer is owned, so dispatch runs
                    // concurrently with the next read.
                    tokio::spawn(dispatch(peer.clone(), payload));
                }
                Some(Ok(Message::Close(_))) | None => {
                    info!("uplink closed by remote");
                    peer.close();
                    break;
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    error!(error = %e, "uplink read failed");
                    result = Err(TunnelError::WebSocket(e));
                    peer.close();
                    break;
                }
            }
        }
    }

    peer.close();
    let _ = writer.await;
    let _ = acceptor.await;
    result
}

/// Decode one inbound message and dispatch it
async fn dispatch(peer: Peer, payload: Bytes) {
    let frame = match Frame::decode(&payload) {
        Ok(frame) => frame,
        Err(e) => {
            warn!(error = %e, "dropping undecodable frame");
            return;
        }
    };

    match frame {
        Frame::Delete { session } => peer.handle_delete(session),
        Frame::Connect(reply) => peer.handle_connect_reply(reply).await,
        Frame::Data { session, payload } => peer.handle_data(session, payload).await,
    }
}

/// Single writer task: drain the priority queues into the sink
async fn run_writer<S>(
    peer: Peer,
    mut queues: UplinkQueues,
    mut sink: SplitSink<WebSocketStream<S>, Message>,
) where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut shutdown = peer.shutdown();
    loop {
        tokio::select! {
            _ = shutdown.triggered() => break,
            msg = queues.next() => match msg {
                Some(msg) => {
                    if let Err(e) = sink.send(msg).await {
                        error!(error = %e, "uplink write failed");
                        peer.close();
                        return;
                    }
                }
                None => break,
            }
        }
    }

    // Best-effort WebSocket close frame on the way out
    let _ = sink.send(Message::Close(None)).await;
    let _ = sink.close().await;
}

/// Accept local SOCKS5 connections and register sessions
async fn run_acceptor(peer: Peer, listener: TcpListener) {
    let mut shutdown = peer.shutdown();
    loop {
        tokio::select! {
            _ = shutdown.triggered() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, remote)) => {
                    let session = remote.port();
                    if is_reserved_session(session) {
                        // Dropping the socket resets the client; the id
                        // space constraint is a wire-protocol rule.
                        warn!(session, "refusing connection on reserved session id");
                        continue;
                    }
                    tokio::spawn(serve_local(peer.clone(), session, stream));
                }
                Err(e) => {
                    error!(error = %e, "listener accept failed");
                    peer.close();
                    break;
                }
            }
        }
    }
}

/// Negotiate SOCKS5 with one local connection, emit its CONNECT frame,
/// and hand the socket over to a forwarder. The SOCKS5 reply is not
/// sent here; it arrives with the remote's CONNECT reply.
async fn serve_local(peer: Peer, session: u16, mut stream: TcpStream) {
    let target = match negotiate(&mut stream).await {
        Ok(target) => target,
        Err(e) => {
            debug!(session, error = %e, "SOCKS5 negotiation failed");
            return;
        }
    };
    debug!(session, target = %target, "connect request");

    let frame = match Frame::connect_request(session, target) {
        Ok(frame) => frame,
        Err(e) => {
            warn!(session, error = %e, "cannot encode connect frame");
            return;
        }
    };
    if peer
        .inner
        .uplink
        .send_control(Message::Binary(frame.encode()))
        .await
        .is_err()
    {
        return;
    }

    let (read_half, write_half) = stream.into_split();
    let entry = match peer.inner.table.insert(session, write_half) {
        Ok(entry) => entry,
        Err(e) => {
            warn!(session, error = %e, "session registration failed");
            return;
        }
    };

    tokio::spawn(run_forwarder(peer, session, read_half, entry));
}

async fn negotiate(stream: &mut TcpStream) -> Result<Address, SocksError> {
    socks::negotiate(stream).await?;
    socks::read_request(stream).await
}

/// Per-session pump copying the local socket into DATA frames on the
/// data queue.
/// EOF or a read error retires the session and emits CLOSE; a
/// peer-initiated retirement wakes `closed` and ends the pump without a
/// second CLOSE.
async fn run_forwarder(peer: Peer, session: u16, mut local: OwnedReadHalf, entry: SessionEntry) {
    let mut shutdown = peer.shutdown();
    let mut buf = vec![0u8; FORWARD_BUFFER_SIZE];

    loop {
        tokio::select! {
            _ = shutdown.triggered() => return,
            _ = entry.closed.notified() => return,
            result = local.read(&mut buf) => match result {
                Ok(0) => break,
                Ok(n) => {
                    let frame = match Frame::data(session, Bytes::copy_from_slice(&buf[..n])) {
                        Ok(frame) => frame,
                        Err(e) => {
                            warn!(session, error = %e, "cannot encode data frame");
                            break;
                        }
                    };
                    if peer
                        .inner
                        .uplink
                        .send_data(Message::Binary(frame.encode()))
                        .await
                        .is_err()
                    {
                        // Scheduler shut down; the close sweep owns cleanup
                        return;
                    }
                }
                Err(e) => {
                    debug!(session, error = %e, "local read failed");
                    break;
                }
            }
        }
    }

    peer.send_close(session).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    struct CountingResource(Arc<AtomicUsize>);

    impl ExternalResource for CountingResource {
        fn close(&self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let (peer, _queues) = Peer::new();
        let closes = Arc::new(AtomicUsize::new(0));
        peer.add_resource(Box::new(CountingResource(Arc::clone(&closes))));

        assert_eq!(peer.state(), PeerState::Running);
        peer.close();
        peer.close();
        peer.close();

        assert_eq!(peer.state(), PeerState::Closed);
        assert_eq!(closes.load(Ordering::SeqCst), 1);
        assert!(peer.shutdown().is_triggered());
    }

    #[tokio::test]
    async fn test_send_close_emits_once_per_session() {
        let (peer, mut queues) = Peer::new();

        peer.send_close(5000).await;
        peer.send_close(5000).await;
        peer.send_close(5000).await;

        assert_eq!(queues.pending_count(), 1);
        let msg = queues.next().await.unwrap();
        match msg {
            Message::Binary(payload) => {
                let frame = Frame::decode(&payload).unwrap();
                assert_eq!(frame, Frame::Delete { session: 5000 });
            }
            other => panic!("unexpected message: {:?}", other),
        }
        assert_eq!(queues.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_delete_suppresses_later_close() {
        let (peer, queues) = Peer::new();

        peer.handle_delete(5000);
        // Forwarder cleanup after the delete must not produce a frame
        peer.send_close(5000).await;

        assert_eq!(queues.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_shutdown_token_broadcasts() {
        let shutdown = Shutdown::new();
        let mut observer_a = shutdown.clone();
        let mut observer_b = shutdown.clone();

        let a = tokio::spawn(async move { observer_a.triggered().await });
        let b = tokio::spawn(async move { observer_b.triggered().await });

        assert!(shutdown.trigger());
        assert!(!shutdown.trigger()); // already raised

        tokio::time::timeout(std::time::Duration::from_secs(1), async {
            a.await.unwrap();
            b.await.unwrap();
        })
        .await
        .expect("observers did not see shutdown");
    }
}
