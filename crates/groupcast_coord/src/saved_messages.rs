//! Retained copies of reliable channel messages for the relocation
//! replay window.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// A reliable message retained until its wall-clock expiration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SavedMessage {
    pub channel_id: String,
    pub timestamp: u64,
    pub payload: Vec<u8>,
    pub expires_at_ms: i64,
}

/// Ordered per-channel log of saved messages.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SavedMessageLog {
    messages: BTreeMap<String, BTreeMap<u64, SavedMessage>>,
}

impl SavedMessageLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, message: SavedMessage) {
        self.messages
            .entry(message.channel_id.clone())
            .or_default()
            .insert(message.timestamp, message);
    }

    /// Unexpired messages with timestamp in `(after, up_to]`, ascending.
    pub fn range(
        &self,
        channel_id: &str,
        after: u64,
        up_to: u64,
        now_ms: i64,
    ) -> Vec<SavedMessage> {
        let Some(per_channel) = self.messages.get(channel_id) else {
            return Vec::new();
        };
        per_channel
            .range(after.saturating_add(1)..=up_to)
            .filter(|(_, message)| message.expires_at_ms > now_ms)
            .map(|(_, message)| message.clone())
            .collect()
    }

    /// Drops every message whose expiration has passed. Returns the
    /// number removed.
    pub fn reap_expired(&mut self, now_ms: i64) -> usize {
        let mut reaped = 0;
        self.messages.retain(|_, per_channel| {
            per_channel.retain(|_, message| {
                let keep = message.expires_at_ms > now_ms;
                if !keep {
                    reaped += 1;
                }
                keep
            });
            !per_channel.is_empty()
        });
        reaped
    }

    pub fn message_count(&self, channel_id: &str) -> usize {
        self.messages
            .get(channel_id)
            .map(|per_channel| per_channel.len())
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message(channel: &str, timestamp: u64, expires_at_ms: i64) -> SavedMessage {
        SavedMessage {
            channel_id: channel.to_string(),
            timestamp,
            payload: format!("m{timestamp}").into_bytes(),
            expires_at_ms,
        }
    }

    #[test]
    fn range_is_exclusive_below_inclusive_above_and_ascending() {
        let mut log = SavedMessageLog::new();
        for ts in 1..=5 {
            log.insert(message("c1", ts, 1_000));
        }

        let replayed = log.range("c1", 2, 4, 0);
        let timestamps: Vec<u64> = replayed.iter().map(|m| m.timestamp).collect();
        assert_eq!(timestamps, vec![3, 4]);
    }

    #[test]
    fn range_skips_expired_messages() {
        let mut log = SavedMessageLog::new();
        log.insert(message("c1", 1, 50));
        log.insert(message("c1", 2, 500));

        let replayed = log.range("c1", 0, 2, 100);
        let timestamps: Vec<u64> = replayed.iter().map(|m| m.timestamp).collect();
        assert_eq!(timestamps, vec![2]);
    }

    #[test]
    fn reap_removes_only_expired() {
        let mut log = SavedMessageLog::new();
        log.insert(message("c1", 1, 50));
        log.insert(message("c1", 2, 500));
        log.insert(message("c2", 1, 40));

        assert_eq!(log.reap_expired(100), 2);
        assert_eq!(log.message_count("c1"), 1);
        assert_eq!(log.message_count("c2"), 0);
    }

    #[test]
    fn channels_are_isolated() {
        let mut log = SavedMessageLog::new();
        log.insert(message("c1", 1, 1_000));
        log.insert(message("c2", 1, 1_000));

        assert_eq!(log.range("c1", 0, 10, 0).len(), 1);
        assert_eq!(log.range("missing", 0, 10, 0).len(), 0);
    }
}
