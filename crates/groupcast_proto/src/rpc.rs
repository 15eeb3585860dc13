//! Remote surfaces of the channel subsystem, generic over the error type.

use std::sync::Arc;

use crate::channel::{Delivery, Membership, RelocationEntry};
use crate::channel_error::ChannelError;

/// The node-to-node RPC surface every channel server exposes.
///
/// Notification calls (`join`, `leave`, `send`, `close`) are
/// non-transactional and must be safe to re-deliver: applying the same
/// notification twice leaves the receiving node's cache unchanged.
pub trait ChannelServerRpc<E> {
    /// Asks the coordinator node to drain the channel's event queue.
    fn service_event_queue(&self, channel_id: &str) -> Result<(), E>;

    /// Probes whether the session is a channel member from the node's
    /// local cache.
    fn is_member(&self, channel_id: &str, session_id: &str) -> Result<Membership, E>;

    /// Notifies the node that a locally-connected session joined.
    /// Returns `false` if the session is no longer connected there.
    fn join(
        &self,
        name: &str,
        channel_id: &str,
        delivery: Delivery,
        baseline_timestamp: u64,
        session_id: &str,
    ) -> Result<bool, E>;

    /// Notifies the node that a locally-connected session left.
    /// Returns `false` if the session is no longer connected there.
    fn leave(&self, channel_id: &str, timestamp: u64, session_id: &str) -> Result<bool, E>;

    /// Delivers a channel message to the node's local members.
    fn send(&self, channel_id: &str, payload: &[u8], timestamp: u64) -> Result<(), E>;

    /// Tells the node the channel is closed; the node drops local
    /// membership and sends a leave to each local member.
    fn close(&self, channel_id: &str, timestamp: u64) -> Result<(), E>;

    /// Re-reads the channel's durable membership for the receiving node
    /// and reconciles the local cache, emitting missed join/leave calls.
    fn refresh(&self, name: &str, channel_id: &str, delivery: Delivery) -> Result<(), E>;

    /// Lists the session ids of the node's local members.
    fn sessions(&self, channel_id: &str) -> Result<Vec<String>, E>;

    /// Hands a relocating session's channel memberships to the new node.
    fn relocate_channel_memberships(
        &self,
        session_id: &str,
        old_node_id: &str,
        entries: &[RelocationEntry],
    ) -> Result<(), E>;

    /// Signals the old node that relocation preparation finished and its
    /// local membership state for the session can be purged.
    fn relocate_channel_memberships_completed(
        &self,
        session_id: &str,
        new_node_id: &str,
    ) -> Result<(), E>;
}

/// Resolves the RPC handle for a server node, or `None` when the node
/// has failed and its proxy was removed.
pub trait ChannelServerDirectory {
    fn server(&self, node_id: &str) -> Option<Arc<dyn ChannelServerRpc<ChannelError> + Send + Sync>>;
}

/// Cluster liveness view supplied by the failure-detection service.
pub trait Liveness {
    fn is_alive(&self, node_id: &str) -> bool;
}

/// Delivery surface of a locally-connected client session.
///
/// Each call returns `false` when the session handle is gone
/// (disconnected); callers treat that as a benign no-op.
pub trait SessionTransport<E> {
    fn channel_join(&self, session_id: &str, name: &str, channel_id: &str) -> Result<bool, E>;

    fn channel_leave(&self, session_id: &str, channel_id: &str) -> Result<bool, E>;

    fn channel_message(
        &self,
        session_id: &str,
        channel_id: &str,
        payload: &[u8],
    ) -> Result<bool, E>;
}
