//! Channel wire types shared between coordinator and node runtimes.

use serde::{Deserialize, Serialize};

/// Ordering/reliability contract for messages sent on a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Delivery {
    Reliable,
    UnorderedReliable,
    OrderedUnreliable,
    Unreliable,
}

impl Delivery {
    /// Reliable deliveries retain sent payloads for the relocation replay
    /// window.
    pub fn is_reliable(self) -> bool {
        matches!(self, Delivery::Reliable | Delivery::UnorderedReliable)
    }

    /// Pure unreliable sends skip the coordinator queue entirely; no
    /// cross-node ordering is promised.
    pub fn bypasses_queue(self) -> bool {
        matches!(self, Delivery::Unreliable)
    }
}

/// Answer to a remote membership probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Membership {
    Member,
    NonMember,
    Unknown,
}

/// One channel's worth of membership state shipped when a session
/// relocates between nodes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelocationEntry {
    pub channel_id: String,
    pub delivery: Delivery,
    pub last_seen_timestamp: u64,
}
