//! Coordinator reassignment for channels stranded on a failed node.
//!
//! The recovering node walks every event queue durably bound to the
//! failed coordinator, picks a replacement from the channel's live
//! server nodes, records the recovery boundary on the queue, and
//! rebinds the queue to the new coordinator. The replacement's first
//! drain then refreshes every server node before servicing events.

use tracing::{info, warn};

use groupcast_proto::util::blake3_hex;
use groupcast_proto::{ChannelError, Liveness};

use crate::store::ChannelStore;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoordinatorReassignment {
    pub channel_id: String,
    pub from_node_id: String,
    pub to_node_id: String,
    /// Events below this timestamp form the possibly-duplicated
    /// recovery window for the new coordinator.
    pub assignment_timestamp: u64,
}

#[derive(Debug, Clone, Default)]
pub struct FailoverReport {
    pub reassignments: Vec<CoordinatorReassignment>,
    pub removed_queue_bindings: Vec<String>,
    pub swept_sessions: usize,
}

pub struct FailoverManager<S: ChannelStore> {
    node_id: String,
    store: S,
}

impl<S: ChannelStore> FailoverManager<S> {
    pub fn new(node_id: &str, store: S) -> Self {
        Self {
            node_id: node_id.to_string(),
            store,
        }
    }

    /// Reassigns every channel coordinated on the failed node. Members
    /// connected to the failed node (and to any other server node the
    /// liveness service reports dead, covering cascading failures) are
    /// dropped in the same pass.
    pub fn handle_node_failed(
        &self,
        failed_node_id: &str,
        liveness: &dyn Liveness,
    ) -> Result<FailoverReport, ChannelError> {
        let mut report = FailoverReport::default();
        for channel_id in self.store.queue_channel_ids_for_node(failed_node_id)? {
            let Some(mut record) = self.store.get_channel(&channel_id)? else {
                self.store.remove_queue(&channel_id)?;
                report.removed_queue_bindings.push(channel_id);
                continue;
            };
            if record.coordinator_node_id != failed_node_id {
                warn!(
                    channel_id = %channel_id,
                    coordinator = %record.coordinator_node_id,
                    failed = failed_node_id,
                    "stale queue binding for reassigned channel"
                );
                continue;
            }
            let Some(mut queue) = self.store.get_queue(&channel_id)? else {
                continue;
            };

            report.swept_sessions += record.remove_node(failed_node_id).len();
            let dead_servers: Vec<String> = record
                .servers
                .iter()
                .filter(|node_id| !liveness.is_alive(node_id))
                .cloned()
                .collect();
            for node_id in dead_servers {
                report.swept_sessions += record.remove_node(&node_id).len();
            }

            queue.mark_coordinator_assignment();
            let assignment_timestamp = queue.coordinator_assignment_timestamp();
            let candidates: Vec<String> = record.servers.iter().cloned().collect();
            let to_node_id = choose_coordinator(
                &channel_id,
                failed_node_id,
                assignment_timestamp,
                &candidates,
                liveness,
            )
            .unwrap_or_else(|| self.node_id.clone());

            info!(
                channel_id = %channel_id,
                from = failed_node_id,
                to = %to_node_id,
                "reassigning channel coordinator"
            );
            record.coordinator_node_id = to_node_id.clone();
            self.store.put_channel(&record)?;
            self.store.put_queue(&to_node_id, &queue)?;
            report.reassignments.push(CoordinatorReassignment {
                channel_id,
                from_node_id: failed_node_id.to_string(),
                to_node_id,
                assignment_timestamp,
            });
        }
        Ok(report)
    }
}

/// Samples the channel's live server nodes, starting from a position
/// derived from the reassignment itself so independent recoveries agree
/// without a shared random source. Returns `None` when no candidate is
/// alive.
fn choose_coordinator(
    channel_id: &str,
    failed_node_id: &str,
    assignment_timestamp: u64,
    candidates: &[String],
    liveness: &dyn Liveness,
) -> Option<String> {
    if candidates.is_empty() {
        return None;
    }
    let seed = blake3_hex(
        format!("{channel_id}:{failed_node_id}:{assignment_timestamp}").as_bytes(),
    );
    let start = u32::from_str_radix(&seed[..8], 16).unwrap_or(0) as usize % candidates.len();
    for i in 0..candidates.len() {
        let candidate = &candidates[(start + i) % candidates.len()];
        if liveness.is_alive(candidate) {
            return Some(candidate.clone());
        }
    }
    None
}
