//! The three bounded work queues between the inbox and the worker pools.

use std::sync::Arc;

use tokio::sync::{mpsc, Mutex};

use rains_core::config::LimitsConfig;
use rains_core::{ConnInfo, Section, Token};

/// One section awaiting processing, with who sent it and under which token.
#[derive(Debug, Clone, PartialEq)]
pub struct MsgSectionSender {
    pub sender: ConnInfo,
    pub section: Section,
    pub token: Token,
}

/// Producer side, owned by the inbox. Sends wait for room.
#[derive(Clone)]
pub struct Queues {
    pub prio: mpsc::Sender<MsgSectionSender>,
    pub normal: mpsc::Sender<MsgSectionSender>,
    pub notification: mpsc::Sender<MsgSectionSender>,
}

pub type SharedReceiver = Arc<Mutex<mpsc::Receiver<MsgSectionSender>>>;

/// Consumer side, shared by every worker of a pool.
#[derive(Clone)]
pub struct QueueReceivers {
    pub prio: SharedReceiver,
    pub normal: SharedReceiver,
    pub notification: SharedReceiver,
}

/// Items currently waiting in each queue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueDepths {
    pub prio: usize,
    pub normal: usize,
    pub notification: usize,
}

pub fn channels(limits: &LimitsConfig) -> (Queues, QueueReceivers) {
    let (prio_tx, prio_rx) = mpsc::channel(limits.prio_buffer_size.max(1));
    let (normal_tx, normal_rx) = mpsc::channel(limits.normal_buffer_size.max(1));
    let (notification_tx, notification_rx) =
        mpsc::channel(limits.notification_buffer_size.max(1));

    (
        Queues {
            prio: prio_tx,
            normal: normal_tx,
            notification: notification_tx,
        },
        QueueReceivers {
            prio: Arc::new(Mutex::new(prio_rx)),
            normal: Arc::new(Mutex::new(normal_rx)),
            notification: Arc::new(Mutex::new(notification_rx)),
        },
    )
}

impl Queues {
    pub fn depths(&self) -> QueueDepths {
        fn depth(tx: &mpsc::Sender<MsgSectionSender>) -> usize {
            tx.max_capacity() - tx.capacity()
        }
        QueueDepths {
            prio: depth(&self.prio),
            normal: depth(&self.normal),
            notification: depth(&self.notification),
        }
    }
}

/// Receive from a queue shared between workers.
pub async fn recv_shared(rx: &SharedReceiver) -> Option<MsgSectionSender> {
    rx.lock().await.recv().await
}
