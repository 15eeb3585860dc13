//! Coordinator-side cache of recent membership changes.
//!
//! Lets a Send's sender authorization be resolved without a remote round
//! trip: the cached Join/Leave entries up to the Send's timestamp are
//! replayed on top of the membership recorded when the Send was
//! enqueued. An entry expires once the queue's timestamp counter has
//! moved past it.

use std::collections::VecDeque;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MembershipEventKind {
    Join,
    Leave,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MembershipEventInfo {
    pub kind: MembershipEventKind,
    pub session_id: String,
    pub event_timestamp: u64,
    pub expiration_timestamp: u64,
}

#[derive(Debug, Clone, Default)]
pub struct MembershipEventCache {
    entries: VecDeque<MembershipEventInfo>,
}

impl MembershipEventCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Records a Join/Leave serviced at `event_timestamp`. The entry
    /// expires at the queue's `next_timestamp` as of insertion.
    pub fn record(
        &mut self,
        kind: MembershipEventKind,
        session_id: &str,
        event_timestamp: u64,
        expiration_timestamp: u64,
    ) {
        self.entries.push_back(MembershipEventInfo {
            kind,
            session_id: session_id.to_string(),
            event_timestamp,
            expiration_timestamp,
        });
    }

    /// Resolves whether `session_id` is a member at `at_timestamp`,
    /// starting from `was_member_at_enqueue` and replaying cached
    /// entries with `event_timestamp <= at_timestamp` in insertion
    /// order. Entries whose expiration precedes `at_timestamp` are
    /// evicted first.
    pub fn is_channel_member(
        &mut self,
        session_id: &str,
        was_member_at_enqueue: bool,
        at_timestamp: u64,
    ) -> bool {
        self.entries
            .retain(|entry| entry.expiration_timestamp >= at_timestamp);

        let mut member = was_member_at_enqueue;
        for entry in &self.entries {
            if entry.session_id != session_id || entry.event_timestamp > at_timestamp {
                continue;
            }
            member = matches!(entry.kind, MembershipEventKind::Join);
        }
        member
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}
