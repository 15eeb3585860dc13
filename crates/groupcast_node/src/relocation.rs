//! Relocation of a session's channel memberships between nodes.
//!
//! The source node locks the session against further channel requests,
//! snapshots its memberships with their delivery cursors, and ships the
//! snapshot to the destination. The destination binds each channel,
//! replays missed reliable messages, then signals completion back so
//! the source can purge its state. A relocation that is never signaled
//! stays unresolved; channel state is untouched either way.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Mutex;

use groupcast_proto::{ChannelError, RelocationEntry};

/// Snapshot awaiting shipment to the destination node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundSnapshot {
    pub session_id: String,
    pub dest_node_id: String,
    pub entries: Vec<RelocationEntry>,
}

/// Snapshot received from a source node, merged during the next pump.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundSnapshot {
    pub session_id: String,
    pub source_node_id: String,
    pub entries: Vec<RelocationEntry>,
}

/// Completion signal owed to a source node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingCompletion {
    pub session_id: String,
    pub source_node_id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelocationStatus {
    Unknown,
    InFlight,
    Completed,
}

#[derive(Debug, Default)]
struct RelocationInner {
    locks: BTreeSet<String>,
    outbound: Vec<OutboundSnapshot>,
    inbound: Vec<InboundSnapshot>,
    completions: Vec<PendingCompletion>,
    awaiting: BTreeMap<String, String>,
    resolved: BTreeSet<String>,
}

#[derive(Debug, Default)]
pub struct RelocationManager {
    inner: Mutex<RelocationInner>,
}

impl RelocationManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Locks the session and queues its snapshot for shipment. Fails if
    /// a relocation for the session is already in flight.
    pub fn begin(
        &self,
        session_id: &str,
        dest_node_id: &str,
        entries: Vec<RelocationEntry>,
    ) -> Result<(), ChannelError> {
        let mut inner = self.inner.lock().expect("lock relocation");
        if inner.locks.contains(session_id) {
            return Err(ChannelError::SessionRelocating {
                session_id: session_id.to_string(),
            });
        }
        inner.locks.insert(session_id.to_string());
        inner.resolved.remove(session_id);
        inner
            .awaiting
            .insert(session_id.to_string(), dest_node_id.to_string());
        inner.outbound.push(OutboundSnapshot {
            session_id: session_id.to_string(),
            dest_node_id: dest_node_id.to_string(),
            entries,
        });
        Ok(())
    }

    /// Whether channel requests for the session must be refused.
    pub fn is_locked(&self, session_id: &str) -> bool {
        let inner = self.inner.lock().expect("lock relocation");
        inner.locks.contains(session_id)
    }

    pub fn take_outbound(&self) -> Vec<OutboundSnapshot> {
        let mut inner = self.inner.lock().expect("lock relocation");
        std::mem::take(&mut inner.outbound)
    }

    pub fn requeue_outbound(&self, snapshot: OutboundSnapshot) {
        let mut inner = self.inner.lock().expect("lock relocation");
        inner.outbound.push(snapshot);
    }

    pub fn queue_inbound(&self, snapshot: InboundSnapshot) {
        let mut inner = self.inner.lock().expect("lock relocation");
        inner.inbound.push(snapshot);
    }

    pub fn take_inbound(&self) -> Vec<InboundSnapshot> {
        let mut inner = self.inner.lock().expect("lock relocation");
        std::mem::take(&mut inner.inbound)
    }

    pub fn queue_completion(&self, session_id: &str, source_node_id: &str) {
        let mut inner = self.inner.lock().expect("lock relocation");
        inner.completions.push(PendingCompletion {
            session_id: session_id.to_string(),
            source_node_id: source_node_id.to_string(),
        });
    }

    pub fn take_completions(&self) -> Vec<PendingCompletion> {
        let mut inner = self.inner.lock().expect("lock relocation");
        std::mem::take(&mut inner.completions)
    }

    pub fn requeue_completion(&self, completion: PendingCompletion) {
        let mut inner = self.inner.lock().expect("lock relocation");
        inner.completions.push(completion);
    }

    /// Source-side: the destination finished preparing; release the
    /// session.
    pub fn complete(&self, session_id: &str) {
        let mut inner = self.inner.lock().expect("lock relocation");
        inner.locks.remove(session_id);
        inner.awaiting.remove(session_id);
        inner.resolved.insert(session_id.to_string());
    }

    pub fn status(&self, session_id: &str) -> RelocationStatus {
        let inner = self.inner.lock().expect("lock relocation");
        if inner.resolved.contains(session_id) {
            RelocationStatus::Completed
        } else if inner.awaiting.contains_key(session_id) {
            RelocationStatus::InFlight
        } else {
            RelocationStatus::Unknown
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use groupcast_proto::Delivery;

    fn entry(channel_id: &str, last_seen: u64) -> RelocationEntry {
        RelocationEntry {
            channel_id: channel_id.to_string(),
            delivery: Delivery::Reliable,
            last_seen_timestamp: last_seen,
        }
    }

    #[test]
    fn begin_locks_until_completed() {
        let manager = RelocationManager::new();
        manager
            .begin("s1", "n2", vec![entry("c1", 3)])
            .expect("begin");
        assert!(manager.is_locked("s1"));
        assert_eq!(manager.status("s1"), RelocationStatus::InFlight);

        let err = manager
            .begin("s1", "n3", Vec::new())
            .expect_err("already relocating");
        assert!(matches!(err, ChannelError::SessionRelocating { .. }));

        manager.complete("s1");
        assert!(!manager.is_locked("s1"));
        assert_eq!(manager.status("s1"), RelocationStatus::Completed);
    }

    #[test]
    fn outbound_snapshots_drain_once() {
        let manager = RelocationManager::new();
        manager
            .begin("s1", "n2", vec![entry("c1", 3)])
            .expect("begin");

        let taken = manager.take_outbound();
        assert_eq!(taken.len(), 1);
        assert!(manager.take_outbound().is_empty());

        manager.requeue_outbound(taken[0].clone());
        assert_eq!(manager.take_outbound().len(), 1);
    }

    #[test]
    fn unsignaled_relocation_stays_unresolved() {
        let manager = RelocationManager::new();
        manager.begin("s1", "n2", Vec::new()).expect("begin");
        let _ = manager.take_outbound();
        assert_eq!(manager.status("s1"), RelocationStatus::InFlight);
        assert!(manager.is_locked("s1"));
    }
}
