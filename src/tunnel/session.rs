//! Session table
//!
//! Maps 16-bit session ids to the write half of their local TCP
//! connection. The table is authoritative: a `get` miss means "dispatch
//! nothing". Retired ids keep a close-sent marker so late frames for
//! them are discarded, and the marker is cleared if the kernel ever
//! hands the same ephemeral port to a new connection.

use super::frame::is_reserved_session;
use super::TunnelError;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::sync::{Mutex as AsyncMutex, Notify};

/// A live session's shared state
#[derive(Clone)]
pub struct SessionEntry {
    /// Write half of the local socket; locked per write so dispatch
    /// tasks never hold the table lock across IO
    pub writer: Arc<AsyncMutex<OwnedWriteHalf>>,
    /// Raised when the session is retired, stopping its forwarder
    pub closed: Arc<Notify>,
}

#[derive(Default)]
struct Inner {
    sessions: HashMap<u16, SessionEntry>,
    close_sent: HashSet<u16>,
}

/// Concurrent session id ↔ local connection map
#[derive(Default)]
pub struct SessionTable {
    inner: Mutex<Inner>,
}

impl SessionTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new session. Clears any stale close-sent marker left
    /// by an earlier session on the same port.
    pub fn insert(&self, id: u16, writer: OwnedWriteHalf) -> Result<SessionEntry, TunnelError> {
        if is_reserved_session(id) {
            return Err(TunnelError::ReservedSession(id));
        }

        let mut inner = self.inner.lock().unwrap();
        if inner.sessions.contains_key(&id) {
            return Err(TunnelError::DuplicateSession(id));
        }
        inner.close_sent.remove(&id);

        let entry = SessionEntry {
            writer: Arc::new(AsyncMutex::new(writer)),
            closed: Arc::new(Notify::new()),
        };
        inner.sessions.insert(id, entry.clone());
        Ok(entry)
    }

    /// Look up a live session
    pub fn get(&self, id: u16) -> Option<SessionEntry> {
        self.inner.lock().unwrap().sessions.get(&id).cloned()
    }

    /// Whether the close handshake for this id is already over
    pub fn is_close_sent(&self, id: u16) -> bool {
        self.inner.lock().unwrap().close_sent.contains(&id)
    }

    /// Retire a session: drop its record, mark it close-sent, and wake
    /// its forwarder. Returns false if the id was already retired, which
    /// gates every CLOSE emission to at most one per id.
    pub fn retire(&self, id: u16) -> bool {
        let entry = {
            let mut inner = self.inner.lock().unwrap();
            if !inner.close_sent.insert(id) {
                return false;
            }
            inner.sessions.remove(&id)
        };
        if let Some(entry) = entry {
            entry.closed.notify_one();
        }
        true
    }

    /// Retire every live session (shutdown sweep). Returns the number of
    /// sessions dropped.
    pub fn drain(&self) -> usize {
        let entries: Vec<SessionEntry> = {
            let mut inner = self.inner.lock().unwrap();
            let drained: Vec<(u16, SessionEntry)> = inner.sessions.drain().collect();
            for (id, _) in &drained {
                inner.close_sent.insert(*id);
            }
            drained.into_iter().map(|(_, entry)| entry).collect()
        };
        let count = entries.len();
        for entry in entries {
            entry.closed.notify_one();
        }
        count
    }

    /// Number of live sessions
    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::{TcpListener, TcpStream};

    /// Produce a real write half to register in the table
    async fn write_half() -> OwnedWriteHalf {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (accepted, _) = tokio::join!(listener.accept(), TcpStream::connect(addr));
        let (stream, _) = accepted.unwrap();
        stream.into_split().1
    }

    #[tokio::test]
    async fn test_insert_get_retire() {
        let table = SessionTable::new();
        assert!(table.get(5000).is_none());

        table.insert(5000, write_half().await).unwrap();
        assert!(table.get(5000).is_some());
        assert_eq!(table.len(), 1);
        assert!(!table.is_close_sent(5000));

        assert!(table.retire(5000));
        assert!(table.get(5000).is_none());
        assert!(table.is_close_sent(5000));
        assert!(table.is_empty());
    }

    #[tokio::test]
    async fn test_retire_is_one_shot() {
        let table = SessionTable::new();
        table.insert(5000, write_half().await).unwrap();

        assert!(table.retire(5000));
        assert!(!table.retire(5000));
        // Retiring an id that never had a record still marks it once
        assert!(table.retire(6000));
        assert!(!table.retire(6000));
    }

    #[tokio::test]
    async fn test_retire_wakes_forwarder() {
        let table = SessionTable::new();
        let entry = table.insert(5000, write_half().await).unwrap();

        table.retire(5000);
        // notify_one stored a permit, so this resolves immediately
        tokio::time::timeout(std::time::Duration::from_secs(1), entry.closed.notified())
            .await
            .expect("closed notification not delivered");
    }

    #[tokio::test]
    async fn test_insert_clears_stale_close_marker() {
        let table = SessionTable::new();
        table.insert(5000, write_half().await).unwrap();
        table.retire(5000);
        assert!(table.is_close_sent(5000));

        // Kernel reused the port for a fresh connection
        table.insert(5000, write_half().await).unwrap();
        assert!(!table.is_close_sent(5000));
        assert!(table.get(5000).is_some());
    }

    #[tokio::test]
    async fn test_reserved_and_duplicate_ids_refused() {
        let table = SessionTable::new();
        for id in [0u16, 1, 3, 4] {
            assert!(matches!(
                table.insert(id, write_half().await),
                Err(TunnelError::ReservedSession(_))
            ));
        }

        table.insert(5000, write_half().await).unwrap();
        assert!(matches!(
            table.insert(5000, write_half().await),
            Err(TunnelError::DuplicateSession(5000))
        ));
    }

    #[tokio::test]
    async fn test_drain_retires_all_live_sessions() {
        let table = SessionTable::new();
        table.insert(5000, write_half().await).unwrap();
        table.insert(5001, write_half().await).unwrap();

        assert_eq!(table.drain(), 2);
        assert!(table.is_empty());
        assert!(table.is_close_sent(5000));
        assert!(table.is_close_sent(5001));
        assert_eq!(table.drain(), 0);
    }
}
