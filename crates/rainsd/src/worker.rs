//! Worker pools draining the inbox queues.
//!
//! Three kinds: priority-only, combined (priority first, then normal) and
//! notification. Every worker blocks on its queues instead of polling; a
//! combined worker uses a biased select so pending priority work always
//! wins over normal work.

use std::sync::Arc;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use rains_core::config::LimitsConfig;
use rains_core::Section;

use crate::inbox::queues::{recv_shared, MsgSectionSender, QueueReceivers};

/// Verify-then-process step for dequeued sections.
///
/// Called on the worker task; long work should be moved off it so the
/// worker returns to its queues promptly.
pub trait SectionHandler: Send + Sync + 'static {
    /// An assertion, shard, zone or query section.
    fn handle(&self, item: MsgSectionSender);

    /// A notification answering one of our queries.
    fn notify(&self, item: MsgSectionSender);
}

/// Logs every section it receives.
#[derive(Debug, Default)]
pub struct TracingHandler;

impl SectionHandler for TracingHandler {
    fn handle(&self, item: MsgSectionSender) {
        match &item.section {
            Section::Query(q) => tracing::info!(peer = %item.sender, token = %item.token, name = %q.name, "query received"),
            other => tracing::info!(peer = %item.sender, token = %item.token, kind = other.kind(), "section received"),
        }
    }

    fn notify(&self, item: MsgSectionSender) {
        if let Section::Notification(n) = &item.section {
            tracing::info!(peer = %item.sender, token = %item.token, kind = ?n.kind, data = %n.data, "notification received");
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerKind {
    Priority,
    Combined,
    Notification,
}

pub struct Worker {
    id: usize,
    kind: WorkerKind,
    queues: QueueReceivers,
    handler: Arc<dyn SectionHandler>,
    shutdown: broadcast::Receiver<()>,
}

impl Worker {
    pub fn new(
        id: usize,
        kind: WorkerKind,
        queues: QueueReceivers,
        handler: Arc<dyn SectionHandler>,
        shutdown: broadcast::Receiver<()>,
    ) -> Self {
        Self {
            id,
            kind,
            queues,
            handler,
            shutdown,
        }
    }

    pub async fn run(mut self) {
        tracing::debug!(id = self.id, kind = ?self.kind, "worker started");
        // A combined worker keeps serving one queue after the other closes.
        let mut prio_open = true;
        let mut normal_open = true;
        loop {
            let next = match self.kind {
                WorkerKind::Priority => tokio::select! {
                    biased;
                    _ = self.shutdown.recv() => None,
                    item = recv_shared(&self.queues.prio) => item,
                },
                WorkerKind::Combined if !prio_open && !normal_open => None,
                WorkerKind::Combined => tokio::select! {
                    biased;
                    _ = self.shutdown.recv() => None,
                    item = recv_shared(&self.queues.prio), if prio_open => {
                        if item.is_none() {
                            prio_open = false;
                            continue;
                        }
                        item
                    }
                    item = recv_shared(&self.queues.normal), if normal_open => {
                        if item.is_none() {
                            normal_open = false;
                            continue;
                        }
                        item
                    }
                },
                WorkerKind::Notification => tokio::select! {
                    biased;
                    _ = self.shutdown.recv() => None,
                    item = recv_shared(&self.queues.notification) => item,
                },
            };

            let Some(item) = next else {
                tracing::debug!(id = self.id, kind = ?self.kind, "worker exiting");
                return;
            };

            match item.section {
                Section::Notification(_) => self.handler.notify(item),
                _ => self.handler.handle(item),
            }
        }
    }
}

/// Spawn every pool with the configured sizes.
pub fn spawn_pools(
    limits: &LimitsConfig,
    queues: &QueueReceivers,
    handler: Arc<dyn SectionHandler>,
    shutdown: &broadcast::Sender<()>,
) -> Vec<JoinHandle<()>> {
    let pools = [
        (WorkerKind::Priority, limits.prio_worker_count),
        (WorkerKind::Combined, limits.normal_worker_count),
        (WorkerKind::Notification, limits.notification_worker_count),
    ];

    let mut handles = Vec::new();
    for (kind, count) in pools {
        for id in 0..count {
            let worker = Worker::new(id, kind, queues.clone(), handler.clone(), shutdown.subscribe());
            handles.push(tokio::spawn(worker.run()));
        }
    }
    tracing::info!(
        prio = limits.prio_worker_count,
        combined = limits.normal_worker_count,
        notification = limits.notification_worker_count,
        "worker pools started"
    );
    handles
}
