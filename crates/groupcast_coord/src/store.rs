//! Durable-store seam for channel state.
//!
//! All cross-entity references are ids looked up through the store, not
//! live pointers: the channel record, its event queue, and its saved
//! messages are separate durable objects. Event queues are keyed by
//! their coordinator node so failover can enumerate the queues stranded
//! on a failed node.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};

use groupcast_proto::{ChannelError, Delivery};

use crate::event_queue::EventQueueState;
use crate::saved_messages::{SavedMessage, SavedMessageLog};

/// Durable record of one channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelRecord {
    pub channel_id: String,
    pub name: String,
    pub delivery: Delivery,
    pub max_message_len: usize,
    pub write_buffer_capacity: usize,
    /// Node ids with at least one locally-connected member.
    pub servers: BTreeSet<String>,
    /// Member session ids grouped by the node they are connected to.
    pub members: BTreeMap<String, BTreeSet<String>>,
    pub coordinator_node_id: String,
    pub closed: bool,
}

impl ChannelRecord {
    pub fn new(
        channel_id: &str,
        name: &str,
        delivery: Delivery,
        max_message_len: usize,
        write_buffer_capacity: usize,
        coordinator_node_id: &str,
    ) -> Self {
        Self {
            channel_id: channel_id.to_string(),
            name: name.to_string(),
            delivery,
            max_message_len,
            write_buffer_capacity,
            servers: BTreeSet::new(),
            members: BTreeMap::new(),
            coordinator_node_id: coordinator_node_id.to_string(),
            closed: false,
        }
    }

    pub fn is_member(&self, session_id: &str) -> bool {
        self.members
            .values()
            .any(|sessions| sessions.contains(session_id))
    }

    /// Node the member session is connected to, if it is a member.
    pub fn member_node(&self, session_id: &str) -> Option<&str> {
        self.members
            .iter()
            .find(|(_, sessions)| sessions.contains(session_id))
            .map(|(node_id, _)| node_id.as_str())
    }

    /// Adds the session under its node. Returns `false` if it was
    /// already a member.
    pub fn add_member(&mut self, node_id: &str, session_id: &str) -> bool {
        if self.is_member(session_id) {
            return false;
        }
        self.servers.insert(node_id.to_string());
        self.members
            .entry(node_id.to_string())
            .or_default()
            .insert(session_id.to_string());
        true
    }

    /// Removes the session. Returns `false` if it was not a member.
    /// Drops the node from `servers` when its last member leaves.
    pub fn remove_member(&mut self, session_id: &str) -> bool {
        let Some(node_id) = self.member_node(session_id).map(str::to_string) else {
            return false;
        };
        if let Some(sessions) = self.members.get_mut(&node_id) {
            sessions.remove(session_id);
            if sessions.is_empty() {
                self.members.remove(&node_id);
                self.servers.remove(&node_id);
            }
        }
        true
    }

    /// Moves a relocating session to its new node, adding the node to
    /// `servers` in the same step.
    pub fn relocate_member(&mut self, session_id: &str, new_node_id: &str) {
        self.remove_member(session_id);
        self.add_member(new_node_id, session_id);
    }

    /// Drops every member connected to `node_id` along with the server
    /// entry. Returns the removed session ids.
    pub fn remove_node(&mut self, node_id: &str) -> Vec<String> {
        self.servers.remove(node_id);
        self.members
            .remove(node_id)
            .map(|sessions| sessions.into_iter().collect())
            .unwrap_or_default()
    }

    pub fn sessions_on_node(&self, node_id: &str) -> Vec<String> {
        self.members
            .get(node_id)
            .map(|sessions| sessions.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn all_sessions(&self) -> Vec<String> {
        self.members
            .values()
            .flat_map(|sessions| sessions.iter().cloned())
            .collect()
    }

    pub fn has_sessions(&self) -> bool {
        self.members.values().any(|sessions| !sessions.is_empty())
    }
}

/// Durable store operations the channel subsystem relies on.
pub trait ChannelStore {
    fn put_channel(&self, record: &ChannelRecord) -> Result<(), ChannelError>;

    fn get_channel(&self, channel_id: &str) -> Result<Option<ChannelRecord>, ChannelError>;

    fn remove_channel(&self, channel_id: &str) -> Result<(), ChannelError>;

    fn channel_id_by_name(&self, name: &str) -> Result<Option<String>, ChannelError>;

    /// Writes the queue under its coordinator's key, replacing any
    /// previous binding for the channel.
    fn put_queue(
        &self,
        coordinator_node_id: &str,
        queue: &EventQueueState,
    ) -> Result<(), ChannelError>;

    fn get_queue(&self, channel_id: &str) -> Result<Option<EventQueueState>, ChannelError>;

    fn remove_queue(&self, channel_id: &str) -> Result<(), ChannelError>;

    /// Channel ids of every queue bound to the given coordinator node,
    /// in key order.
    fn queue_channel_ids_for_node(&self, node_id: &str) -> Result<Vec<String>, ChannelError>;

    fn save_message(&self, message: SavedMessage) -> Result<(), ChannelError>;

    /// Unexpired saved messages with timestamp in `(after, up_to]`,
    /// ascending.
    fn saved_messages_in_range(
        &self,
        channel_id: &str,
        after: u64,
        up_to: u64,
        now_ms: i64,
    ) -> Result<Vec<SavedMessage>, ChannelError>;

    fn reap_expired_messages(&self, now_ms: i64) -> Result<usize, ChannelError>;
}

#[derive(Debug, Default)]
struct StoreInner {
    channels: BTreeMap<String, ChannelRecord>,
    names: BTreeMap<String, String>,
    queues: BTreeMap<String, (String, EventQueueState)>,
    saved: SavedMessageLog,
}

/// Shared in-memory rendering of the durable store; clones share state,
/// standing in for the cluster-wide object store.
#[derive(Debug, Clone, Default)]
pub struct InMemoryChannelStore {
    inner: Arc<Mutex<StoreInner>>,
}

impl InMemoryChannelStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ChannelStore for InMemoryChannelStore {
    fn put_channel(&self, record: &ChannelRecord) -> Result<(), ChannelError> {
        let mut inner = self.inner.lock().expect("lock store");
        inner
            .names
            .insert(record.name.clone(), record.channel_id.clone());
        inner
            .channels
            .insert(record.channel_id.clone(), record.clone());
        Ok(())
    }

    fn get_channel(&self, channel_id: &str) -> Result<Option<ChannelRecord>, ChannelError> {
        let inner = self.inner.lock().expect("lock store");
        Ok(inner.channels.get(channel_id).cloned())
    }

    fn remove_channel(&self, channel_id: &str) -> Result<(), ChannelError> {
        let mut inner = self.inner.lock().expect("lock store");
        if let Some(record) = inner.channels.remove(channel_id) {
            inner.names.remove(&record.name);
        }
        Ok(())
    }

    fn channel_id_by_name(&self, name: &str) -> Result<Option<String>, ChannelError> {
        let inner = self.inner.lock().expect("lock store");
        Ok(inner.names.get(name).cloned())
    }

    fn put_queue(
        &self,
        coordinator_node_id: &str,
        queue: &EventQueueState,
    ) -> Result<(), ChannelError> {
        let mut inner = self.inner.lock().expect("lock store");
        inner.queues.insert(
            queue.channel_id.clone(),
            (coordinator_node_id.to_string(), queue.clone()),
        );
        Ok(())
    }

    fn get_queue(&self, channel_id: &str) -> Result<Option<EventQueueState>, ChannelError> {
        let inner = self.inner.lock().expect("lock store");
        Ok(inner.queues.get(channel_id).map(|(_, queue)| queue.clone()))
    }

    fn remove_queue(&self, channel_id: &str) -> Result<(), ChannelError> {
        let mut inner = self.inner.lock().expect("lock store");
        inner.queues.remove(channel_id);
        Ok(())
    }

    fn queue_channel_ids_for_node(&self, node_id: &str) -> Result<Vec<String>, ChannelError> {
        let inner = self.inner.lock().expect("lock store");
        Ok(inner
            .queues
            .iter()
            .filter(|(_, (coordinator, _))| coordinator == node_id)
            .map(|(channel_id, _)| channel_id.clone())
            .collect())
    }

    fn save_message(&self, message: SavedMessage) -> Result<(), ChannelError> {
        let mut inner = self.inner.lock().expect("lock store");
        inner.saved.insert(message);
        Ok(())
    }

    fn saved_messages_in_range(
        &self,
        channel_id: &str,
        after: u64,
        up_to: u64,
        now_ms: i64,
    ) -> Result<Vec<SavedMessage>, ChannelError> {
        let inner = self.inner.lock().expect("lock store");
        Ok(inner.saved.range(channel_id, after, up_to, now_ms))
    }

    fn reap_expired_messages(&self, now_ms: i64) -> Result<usize, ChannelError> {
        let mut inner = self.inner.lock().expect("lock store");
        Ok(inner.saved.reap_expired(now_ms))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(channel_id: &str, name: &str) -> ChannelRecord {
        ChannelRecord::new(channel_id, name, Delivery::Reliable, 65_535, 1024, "n1")
    }

    #[test]
    fn membership_tracks_server_nodes() {
        let mut channel = record("c1", "lobby");
        assert!(channel.add_member("n1", "s1"));
        assert!(channel.add_member("n2", "s2"));
        assert!(!channel.add_member("n2", "s1"), "already a member");
        assert_eq!(channel.servers.len(), 2);

        assert!(channel.remove_member("s2"));
        assert!(!channel.servers.contains("n2"), "last member left n2");
        assert!(!channel.remove_member("s2"));
    }

    #[test]
    fn relocate_member_moves_node_binding() {
        let mut channel = record("c1", "lobby");
        channel.add_member("n1", "s1");
        channel.relocate_member("s1", "n2");

        assert_eq!(channel.member_node("s1"), Some("n2"));
        assert!(channel.servers.contains("n2"));
        assert!(!channel.servers.contains("n1"));
    }

    #[test]
    fn store_round_trips_channels_and_queues() {
        let store = InMemoryChannelStore::new();
        let channel = record("c1", "lobby");
        store.put_channel(&channel).expect("put channel");
        store
            .put_queue("n1", &EventQueueState::new("c1", 1024))
            .expect("put queue");

        assert_eq!(
            store.channel_id_by_name("lobby").expect("lookup"),
            Some("c1".to_string())
        );
        assert!(store.get_queue("c1").expect("get queue").is_some());

        let shared = store.clone();
        assert!(
            shared.get_channel("c1").expect("get channel").is_some(),
            "clones share state"
        );
    }

    #[test]
    fn queue_rebind_replaces_node_key() {
        let store = InMemoryChannelStore::new();
        store
            .put_queue("n1", &EventQueueState::new("c1", 1024))
            .expect("put queue");
        store
            .put_queue("n1", &EventQueueState::new("c2", 1024))
            .expect("put queue");

        let queue = store.get_queue("c1").expect("get").expect("present");
        store.put_queue("n2", &queue).expect("rebind");

        assert_eq!(
            store.queue_channel_ids_for_node("n1").expect("scan"),
            vec!["c2".to_string()]
        );
        assert_eq!(
            store.queue_channel_ids_for_node("n2").expect("scan"),
            vec!["c1".to_string()]
        );
    }

    #[test]
    fn durable_objects_stay_serializable_for_write_back() {
        let mut channel = record("c1", "lobby");
        channel.add_member("n1", "s1");
        let encoded = serde_json::to_string(&channel).expect("serialize record");
        let decoded: ChannelRecord = serde_json::from_str(&encoded).expect("deserialize record");
        assert_eq!(decoded, channel);

        let mut queue = EventQueueState::new("c1", 1024);
        queue
            .offer(crate::event_queue::ChannelEventKind::Send {
                sender_id: Some("s1".to_string()),
                was_member_at_enqueue: true,
                payload: b"m".to_vec(),
            })
            .expect("offer");
        let encoded = serde_json::to_string(&queue).expect("serialize queue");
        let decoded: EventQueueState = serde_json::from_str(&encoded).expect("deserialize queue");
        assert_eq!(decoded, queue);
    }

    #[test]
    fn remove_channel_clears_name_binding() {
        let store = InMemoryChannelStore::new();
        store.put_channel(&record("c1", "lobby")).expect("put");
        store.remove_channel("c1").expect("remove");
        assert_eq!(store.channel_id_by_name("lobby").expect("lookup"), None);
    }
}
