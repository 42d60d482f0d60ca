//! Send worker — drains the outbound queue into `Switchboard::send_to`.
//!
//! The inbox and the workers never talk to the switchboard directly; they
//! push encoded messages into the `Outbox` and move on.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::{broadcast, mpsc};

use rains_core::ConnInfo;

use super::Switchboard;

/// An encoded message and where it goes.
pub type Outbound = (ConnInfo, Bytes);

/// Non-blocking handle onto the outbound queue.
#[derive(Clone)]
pub struct Outbox {
    tx: mpsc::Sender<Outbound>,
}

impl Outbox {
    pub fn channel(size: usize) -> (Self, mpsc::Receiver<Outbound>) {
        let (tx, rx) = mpsc::channel(size.max(1));
        (Self { tx }, rx)
    }

    /// Queue `message` for `receiver`. A full or closed queue drops it.
    pub fn send(&self, receiver: ConnInfo, message: Bytes) {
        match self.tx.try_send((receiver, message)) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                tracing::warn!(peer = %receiver, "outbound queue full, message dropped");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                tracing::debug!(peer = %receiver, "outbound queue closed, message dropped");
            }
        }
    }

    pub fn depth(&self) -> usize {
        self.tx.max_capacity() - self.tx.capacity()
    }
}

/// Messages one receiver's lane may hold before further ones are dropped.
const LANE_CAPACITY: usize = 64;

/// A lane with nothing to send for this long winds down.
const LANE_IDLE: Duration = Duration::from_secs(30);

/// Fans the outbound queue out into one lane per receiver.
///
/// Each lane is a task calling `Switchboard::send_to` for its receiver only,
/// one message after another. Messages for the same peer leave in order and
/// the second reuses the first one's connection, while a peer that is slow
/// to dial holds up nobody but itself.
pub struct SendWorker {
    switchboard: Arc<Switchboard>,
    outbound_rx: mpsc::Receiver<Outbound>,
    lanes: HashMap<ConnInfo, mpsc::Sender<Bytes>>,
    shutdown: broadcast::Receiver<()>,
}

impl SendWorker {
    pub fn new(
        switchboard: Arc<Switchboard>,
        outbound_rx: mpsc::Receiver<Outbound>,
        shutdown: broadcast::Receiver<()>,
    ) -> Self {
        Self {
            switchboard,
            outbound_rx,
            lanes: HashMap::new(),
            shutdown,
        }
    }

    pub async fn run(mut self) -> anyhow::Result<()> {
        loop {
            tokio::select! {
                _ = self.shutdown.recv() => {
                    tracing::info!("send worker shutting down");
                    return Ok(());
                }

                msg = self.outbound_rx.recv() => {
                    let (receiver, message) = match msg {
                        Some(m) => m,
                        None => {
                            tracing::info!("outbox dropped, send worker exiting");
                            return Ok(());
                        }
                    };
                    self.dispatch(receiver, message);
                }
            }
        }
    }

    fn dispatch(&mut self, receiver: ConnInfo, message: Bytes) {
        let message = match self.lanes.get(&receiver) {
            Some(lane) => match lane.try_send(message) {
                Ok(()) => return,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    tracing::warn!(peer = %receiver, "peer send lane full, message dropped");
                    return;
                }
                // The lane went idle and wound down; open a new one.
                Err(mpsc::error::TrySendError::Closed(message)) => message,
            },
            None => message,
        };

        self.lanes.retain(|_, lane| !lane.is_closed());
        let (tx, rx) = mpsc::channel(LANE_CAPACITY);
        if tx.try_send(message).is_err() {
            return;
        }
        self.lanes.insert(receiver, tx);
        tokio::spawn(run_lane(
            self.switchboard.clone(),
            receiver,
            rx,
            self.shutdown.resubscribe(),
        ));
    }
}

async fn run_lane(
    switchboard: Arc<Switchboard>,
    receiver: ConnInfo,
    mut rx: mpsc::Receiver<Bytes>,
    mut shutdown: broadcast::Receiver<()>,
) {
    tracing::debug!(peer = %receiver, "send lane opened");
    loop {
        let message = tokio::select! {
            _ = shutdown.recv() => return,
            next = tokio::time::timeout(LANE_IDLE, rx.recv()) => match next {
                Ok(Some(message)) => message,
                Ok(None) => return,
                Err(_) => break,
            },
        };
        switchboard.send_to(&message, receiver).await;
    }

    // Idle: refuse new messages, then flush whatever raced in.
    rx.close();
    while let Ok(message) = rx.try_recv() {
        switchboard.send_to(&message, receiver).await;
    }
    tracing::debug!(peer = %receiver, "send lane closed");
}
