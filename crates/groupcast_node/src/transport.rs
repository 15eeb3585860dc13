//! Recording in-memory session transport.

use std::collections::BTreeSet;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};

use groupcast_proto::{ChannelError, SessionTransport};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransportEvent {
    Join {
        session_id: String,
        name: String,
        channel_id: String,
    },
    Leave {
        session_id: String,
        channel_id: String,
    },
    Message {
        session_id: String,
        channel_id: String,
        payload: Vec<u8>,
    },
}

#[derive(Debug, Default)]
struct TransportInner {
    connected: BTreeSet<String>,
    log: Vec<TransportEvent>,
}

/// Session transport that records every delivery; calls against
/// disconnected sessions report `false` and leave no trace.
#[derive(Debug, Default)]
pub struct RecordingSessionTransport {
    inner: Mutex<TransportInner>,
}

impl RecordingSessionTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connect(&self, session_id: &str) {
        let mut inner = self.inner.lock().expect("lock transport");
        inner.connected.insert(session_id.to_string());
    }

    pub fn disconnect(&self, session_id: &str) {
        let mut inner = self.inner.lock().expect("lock transport");
        inner.connected.remove(session_id);
    }

    pub fn is_connected(&self, session_id: &str) -> bool {
        let inner = self.inner.lock().expect("lock transport");
        inner.connected.contains(session_id)
    }

    pub fn events(&self) -> Vec<TransportEvent> {
        let inner = self.inner.lock().expect("lock transport");
        inner.log.clone()
    }

    /// Message payloads delivered to the session, in order.
    pub fn messages_for(&self, session_id: &str) -> Vec<Vec<u8>> {
        let inner = self.inner.lock().expect("lock transport");
        inner
            .log
            .iter()
            .filter_map(|event| match event {
                TransportEvent::Message {
                    session_id: target,
                    payload,
                    ..
                } if target == session_id => Some(payload.clone()),
                _ => None,
            })
            .collect()
    }

    fn record(&self, session_id: &str, event: TransportEvent) -> bool {
        let mut inner = self.inner.lock().expect("lock transport");
        if !inner.connected.contains(session_id) {
            return false;
        }
        inner.log.push(event);
        true
    }
}

impl SessionTransport<ChannelError> for RecordingSessionTransport {
    fn channel_join(&self, session_id: &str, name: &str, channel_id: &str) -> Result<bool, ChannelError> {
        Ok(self.record(
            session_id,
            TransportEvent::Join {
                session_id: session_id.to_string(),
                name: name.to_string(),
                channel_id: channel_id.to_string(),
            },
        ))
    }

    fn channel_leave(&self, session_id: &str, channel_id: &str) -> Result<bool, ChannelError> {
        Ok(self.record(
            session_id,
            TransportEvent::Leave {
                session_id: session_id.to_string(),
                channel_id: channel_id.to_string(),
            },
        ))
    }

    fn channel_message(
        &self,
        session_id: &str,
        channel_id: &str,
        payload: &[u8],
    ) -> Result<bool, ChannelError> {
        Ok(self.record(
            session_id,
            TransportEvent::Message {
                session_id: session_id.to_string(),
                channel_id: channel_id.to_string(),
                payload: payload.to_vec(),
            },
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disconnected_sessions_receive_nothing() {
        let transport = RecordingSessionTransport::new();
        transport.connect("s1");

        assert!(transport
            .channel_message("s1", "c1", b"hello")
            .expect("deliver"));
        assert!(!transport
            .channel_message("s2", "c1", b"hello")
            .expect("deliver"));

        assert_eq!(transport.messages_for("s1"), vec![b"hello".to_vec()]);
        assert!(transport.messages_for("s2").is_empty());
    }
}
