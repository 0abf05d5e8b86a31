//! Uplink send scheduler
//!
//! All outbound WebSocket writes go through a single writer task.
//! Producers enqueue pre-serialized messages into one of two bounded
//! FIFO queues; control frames (CONNECT, CLOSE) always overtake bulk
//! data so session lifetime is never starved by a backlogged sender.
//!
//! A semaphore carries the pending count: a permit is added only after
//! its message is in a queue, so the writer never acquires a permit
//! without a message to take, and the permit count equals
//! `|control| + |data|` at every quiescent point.

use super::TunnelError;
use std::sync::Arc;
use tokio::sync::{mpsc, Semaphore};
use tokio_tungstenite::tungstenite::Message;

/// Control queue bound (CONNECT and CLOSE frames)
pub const CONTROL_QUEUE_CAPACITY: usize = 256;

/// Data queue bound. Enqueueing blocks when full, which is the
/// backpressure mechanism for session forwarders.
pub const DATA_QUEUE_CAPACITY: usize = 4096;

/// Producer half: enqueue messages for the uplink writer
#[derive(Clone)]
pub struct UplinkSender {
    control: mpsc::Sender<Message>,
    data: mpsc::Sender<Message>,
    pending: Arc<Semaphore>,
}

/// Consumer half, owned by the single writer task
pub struct UplinkQueues {
    control: mpsc::Receiver<Message>,
    data: mpsc::Receiver<Message>,
    pending: Arc<Semaphore>,
}

/// Create the paired queue handles
pub fn uplink_channel() -> (UplinkSender, UplinkQueues) {
    let (control_tx, control_rx) = mpsc::channel(CONTROL_QUEUE_CAPACITY);
    let (data_tx, data_rx) = mpsc::channel(DATA_QUEUE_CAPACITY);
    let pending = Arc::new(Semaphore::new(0));

    (
        UplinkSender {
            control: control_tx,
            data: data_tx,
            pending: Arc::clone(&pending),
        },
        UplinkQueues {
            control: control_rx,
            data: data_rx,
            pending,
        },
    )
}

impl UplinkSender {
    /// Enqueue a control message (CONNECT, CLOSE)
    pub async fn send_control(&self, msg: Message) -> Result<(), TunnelError> {
        self.control
            .send(msg)
            .await
            .map_err(|_| TunnelError::UplinkClosed)?;
        self.pending.add_permits(1);
        Ok(())
    }

    /// Enqueue a data message, blocking while the queue is full
    pub async fn send_data(&self, msg: Message) -> Result<(), TunnelError> {
        self.data
            .send(msg)
            .await
            .map_err(|_| TunnelError::UplinkClosed)?;
        self.pending.add_permits(1);
        Ok(())
    }

    /// Stop the writer: pending and future acquires fail immediately
    pub fn shut(&self) {
        self.pending.close();
    }
}

impl UplinkQueues {
    /// Take the next message to write, control first. Returns `None`
    /// once the scheduler is shut down.
    pub async fn next(&mut self) -> Option<Message> {
        let permit = self.pending.acquire().await.ok()?;
        permit.forget();

        // The permit was added after its message, so one of the queues
        // is guaranteed non-empty here.
        if let Ok(msg) = self.control.try_recv() {
            return Some(msg);
        }
        self.data.try_recv().ok()
    }

    /// Total messages currently queued
    pub fn pending_count(&self) -> usize {
        self.pending.available_permits()
    }
}
