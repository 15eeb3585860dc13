//! Outbound notification dispatch, outside the durable commit path.
//!
//! Tasks produced by coordinator drains are buffered per channel and
//! executed FIFO, so joins, leaves and sends reach a node in assigned
//! order. The head task of a channel retries on transient failure;
//! a liveness-confirmed-dead target is pruned instead, and its pending
//! notification abandoned.

use std::collections::{BTreeMap, VecDeque};

use tracing::warn;

use groupcast_coord::{NotificationKind, NotificationTask};
use groupcast_proto::{ChannelError, ChannelServerDirectory, Liveness};

#[derive(Debug, Clone, Default)]
pub struct DispatchReport {
    pub delivered: usize,
    pub retried: usize,
    /// (channel id, node id) pairs confirmed dead and pruned.
    pub pruned: Vec<(String, String)>,
    /// (channel id, event id) acknowledgments owed to the coordinator.
    pub acks: Vec<(String, u64)>,
}

#[derive(Debug, Default)]
pub struct NotificationDispatcher {
    queues: BTreeMap<String, VecDeque<NotificationTask>>,
}

impl NotificationDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enqueue(&mut self, tasks: Vec<NotificationTask>) {
        for task in tasks {
            self.queues
                .entry(task.channel_id.clone())
                .or_default()
                .push_back(task);
        }
    }

    pub fn is_idle(&self) -> bool {
        self.queues.values().all(VecDeque::is_empty)
    }

    pub fn pending(&self) -> usize {
        self.queues.values().map(VecDeque::len).sum()
    }

    /// Makes one pass over every channel queue, executing head tasks
    /// until each queue empties or hits a transient failure.
    pub fn run_once(
        &mut self,
        directory: &dyn ChannelServerDirectory,
        liveness: &dyn Liveness,
    ) -> DispatchReport {
        let mut report = DispatchReport::default();
        for (channel_id, queue) in self.queues.iter_mut() {
            while let Some(task) = queue.front() {
                let target = task.target_node_id.clone();
                if !liveness.is_alive(&target) {
                    report.pruned.push((channel_id.clone(), target));
                    if let Some(event_id) = task.event_id {
                        report.acks.push((channel_id.clone(), event_id));
                    }
                    queue.pop_front();
                    continue;
                }
                let Some(server) = directory.server(&target) else {
                    // Proxy removed: the node failed and recovery will
                    // repair the server list. Abandon the notification.
                    report.pruned.push((channel_id.clone(), target));
                    if let Some(event_id) = task.event_id {
                        report.acks.push((channel_id.clone(), event_id));
                    }
                    queue.pop_front();
                    continue;
                };
                let result = match &task.kind {
                    NotificationKind::Join {
                        name,
                        delivery,
                        baseline_timestamp,
                        session_id,
                    } => server
                        .join(name, channel_id, *delivery, *baseline_timestamp, session_id)
                        .map(|_| ()),
                    NotificationKind::Leave {
                        timestamp,
                        session_id,
                    } => server.leave(channel_id, *timestamp, session_id).map(|_| ()),
                    NotificationKind::Send { payload, timestamp } => {
                        server.send(channel_id, payload, *timestamp)
                    }
                    NotificationKind::Close { timestamp } => server.close(channel_id, *timestamp),
                    NotificationKind::Refresh { name, delivery } => {
                        server.refresh(name, channel_id, *delivery)
                    }
                };
                match result {
                    Ok(()) => {
                        report.delivered += 1;
                        if let Some(event_id) = task.event_id {
                            report.acks.push((channel_id.clone(), event_id));
                        }
                        queue.pop_front();
                    }
                    Err(ChannelError::RpcFailed {
                        retryable: false,
                        node_id,
                        message,
                    }) => {
                        warn!(
                            channel_id = %channel_id,
                            node_id = %node_id,
                            message = %message,
                            "abandoning notification after permanent failure"
                        );
                        if let Some(event_id) = task.event_id {
                            report.acks.push((channel_id.clone(), event_id));
                        }
                        queue.pop_front();
                    }
                    Err(_) => {
                        // Transient: keep the task at the head and let
                        // the next pass retry it.
                        report.retried += 1;
                        break;
                    }
                }
            }
        }
        self.queues.retain(|_, queue| !queue.is_empty());
        report
    }
}
