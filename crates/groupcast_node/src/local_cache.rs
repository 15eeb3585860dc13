//! Node-local view of channel membership.
//!
//! Tracks which locally-connected sessions belong to which channels,
//! the timestamp each joined at, and a per-member delivery cursor. The
//! cursor makes re-delivered reliable notifications no-ops and is the
//! `last_seen_timestamp` shipped when the session relocates.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Mutex;

use groupcast_proto::{Delivery, Membership, RelocationEntry};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalMemberInfo {
    pub join_timestamp: u64,
    /// Timestamp of the last message delivered to this member.
    pub delivered_cursor: u64,
}

#[derive(Debug, Clone)]
pub struct LocalChannelInfo {
    pub name: String,
    pub delivery: Delivery,
    members: BTreeMap<String, LocalMemberInfo>,
    pub last_delivered_timestamp: u64,
}

/// Sessions reconciled by a coordinator refresh.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileOutcome {
    pub joined: Vec<String>,
    pub left: Vec<String>,
}

#[derive(Debug, Default)]
struct CacheInner {
    channels: BTreeMap<String, LocalChannelInfo>,
    /// Reverse index: session id -> channels it belongs to here.
    session_channels: BTreeMap<String, BTreeSet<String>>,
}

#[derive(Debug, Default)]
pub struct LocalMembershipCache {
    inner: Mutex<CacheInner>,
}

impl LocalMembershipCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a member with its join timestamp. Returns `false` if it was
    /// already present (idempotent re-delivery).
    pub fn join(
        &self,
        channel_id: &str,
        name: &str,
        delivery: Delivery,
        session_id: &str,
        join_timestamp: u64,
    ) -> bool {
        let mut inner = self.inner.lock().expect("lock cache");
        let channel = inner
            .channels
            .entry(channel_id.to_string())
            .or_insert_with(|| LocalChannelInfo {
                name: name.to_string(),
                delivery,
                members: BTreeMap::new(),
                last_delivered_timestamp: 0,
            });
        if channel.members.contains_key(session_id) {
            return false;
        }
        channel.members.insert(
            session_id.to_string(),
            LocalMemberInfo {
                join_timestamp,
                delivered_cursor: join_timestamp.saturating_sub(1),
            },
        );
        inner
            .session_channels
            .entry(session_id.to_string())
            .or_default()
            .insert(channel_id.to_string());
        true
    }

    /// Removes a member. Returns `false` if it was not present.
    pub fn leave(&self, channel_id: &str, session_id: &str) -> bool {
        let mut inner = self.inner.lock().expect("lock cache");
        let removed = inner
            .channels
            .get_mut(channel_id)
            .map(|channel| channel.members.remove(session_id).is_some())
            .unwrap_or(false);
        if let Some(channels) = inner.session_channels.get_mut(session_id) {
            channels.remove(channel_id);
            if channels.is_empty() {
                inner.session_channels.remove(session_id);
            }
        }
        removed
    }

    /// Members eligible for a message at `timestamp` under the delivery
    /// window (joined at or before it, not yet delivered it). Advances
    /// their cursors and the channel's high-water mark.
    pub fn deliver(&self, channel_id: &str, timestamp: u64) -> Vec<String> {
        let mut inner = self.inner.lock().expect("lock cache");
        let Some(channel) = inner.channels.get_mut(channel_id) else {
            return Vec::new();
        };
        channel.last_delivered_timestamp = channel.last_delivered_timestamp.max(timestamp);
        let mut eligible = Vec::new();
        for (session_id, member) in channel.members.iter_mut() {
            if member.join_timestamp <= timestamp && member.delivered_cursor < timestamp {
                member.delivered_cursor = timestamp;
                eligible.push(session_id.clone());
            }
        }
        eligible
    }

    /// Members for a queue-bypassing unreliable send. No ordering or
    /// windowing contract applies: the current membership receives the
    /// message, and repeated timestamps are not deduplicated.
    pub fn deliver_unreliable(&self, channel_id: &str, timestamp: u64) -> Vec<String> {
        let mut inner = self.inner.lock().expect("lock cache");
        let Some(channel) = inner.channels.get_mut(channel_id) else {
            return Vec::new();
        };
        channel.last_delivered_timestamp = channel.last_delivered_timestamp.max(timestamp);
        channel.members.keys().cloned().collect()
    }

    /// Moves one member's cursor forward (replayed message delivered
    /// directly to it).
    pub fn advance_cursor(&self, channel_id: &str, session_id: &str, timestamp: u64) {
        let mut inner = self.inner.lock().expect("lock cache");
        if let Some(member) = inner
            .channels
            .get_mut(channel_id)
            .and_then(|channel| channel.members.get_mut(session_id))
        {
            member.delivered_cursor = member.delivered_cursor.max(timestamp);
        }
    }

    pub fn delivery(&self, channel_id: &str) -> Option<Delivery> {
        let inner = self.inner.lock().expect("lock cache");
        inner
            .channels
            .get(channel_id)
            .map(|channel| channel.delivery)
    }

    pub fn last_delivered(&self, channel_id: &str) -> u64 {
        let inner = self.inner.lock().expect("lock cache");
        inner
            .channels
            .get(channel_id)
            .map(|channel| channel.last_delivered_timestamp)
            .unwrap_or(0)
    }

    pub fn is_member(&self, channel_id: &str, session_id: &str) -> Membership {
        let inner = self.inner.lock().expect("lock cache");
        match inner.channels.get(channel_id) {
            Some(channel) if channel.members.contains_key(session_id) => Membership::Member,
            Some(_) => Membership::NonMember,
            None => Membership::Unknown,
        }
    }

    pub fn members(&self, channel_id: &str) -> Vec<String> {
        let inner = self.inner.lock().expect("lock cache");
        inner
            .channels
            .get(channel_id)
            .map(|channel| channel.members.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Drops the whole channel, returning its members (channel closed).
    pub fn drop_channel(&self, channel_id: &str) -> Vec<String> {
        let mut inner = self.inner.lock().expect("lock cache");
        let Some(channel) = inner.channels.remove(channel_id) else {
            return Vec::new();
        };
        let members: Vec<String> = channel.members.keys().cloned().collect();
        for session_id in &members {
            if let Some(channels) = inner.session_channels.get_mut(session_id) {
                channels.remove(channel_id);
                if channels.is_empty() {
                    inner.session_channels.remove(session_id);
                }
            }
        }
        members
    }

    /// Purges every membership of the session (disconnect or relocation
    /// handoff), returning the channel ids it belonged to.
    pub fn remove_session(&self, session_id: &str) -> Vec<String> {
        let mut inner = self.inner.lock().expect("lock cache");
        let Some(channels) = inner.session_channels.remove(session_id) else {
            return Vec::new();
        };
        for channel_id in &channels {
            if let Some(channel) = inner.channels.get_mut(channel_id) {
                channel.members.remove(session_id);
            }
        }
        channels.into_iter().collect()
    }

    /// Snapshot of the session's memberships for relocation, with the
    /// delivery cursor as `last_seen_timestamp`.
    pub fn channels_for_session(&self, session_id: &str) -> Vec<RelocationEntry> {
        let inner = self.inner.lock().expect("lock cache");
        let Some(channels) = inner.session_channels.get(session_id) else {
            return Vec::new();
        };
        channels
            .iter()
            .filter_map(|channel_id| {
                let channel = inner.channels.get(channel_id)?;
                let member = channel.members.get(session_id)?;
                Some(RelocationEntry {
                    channel_id: channel_id.clone(),
                    delivery: channel.delivery,
                    last_seen_timestamp: member.delivered_cursor,
                })
            })
            .collect()
    }

    /// Replaces the channel's membership with the durable list read
    /// back after a coordinator reassignment. Newly discovered members
    /// join at `baseline_timestamp`; members no longer present are
    /// dropped. Returns both sets so the missed transport calls can be
    /// made up.
    pub fn reconcile(
        &self,
        channel_id: &str,
        name: &str,
        delivery: Delivery,
        authoritative: &[String],
        baseline_timestamp: u64,
    ) -> ReconcileOutcome {
        let current: BTreeSet<String> = self.members(channel_id).into_iter().collect();
        let target: BTreeSet<String> = authoritative.iter().cloned().collect();
        let mut outcome = ReconcileOutcome::default();
        for session_id in target.difference(&current) {
            self.join(channel_id, name, delivery, session_id, baseline_timestamp);
            outcome.joined.push(session_id.clone());
        }
        for session_id in current.difference(&target) {
            self.leave(channel_id, session_id);
            outcome.left.push(session_id.clone());
        }
        outcome
    }
}
