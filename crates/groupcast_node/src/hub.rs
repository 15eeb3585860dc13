//! In-memory routing of channel-server RPCs between registered nodes.
//!
//! The hub plays the role of the server-proxy registry: each node
//! registers its RPC surface on start, a failed node's entry is
//! removed, and callers resolve per-node handles on demand. Marking a
//! node unreachable injects transient I/O failures without
//! unregistering it.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex};

use groupcast_proto::{
    ChannelError, ChannelServerDirectory, ChannelServerRpc, Delivery, Membership, RelocationEntry,
};

#[derive(Default)]
struct HubInner {
    servers: BTreeMap<String, Arc<dyn ChannelServerRpc<ChannelError> + Send + Sync>>,
    unreachable: BTreeSet<String>,
}

#[derive(Clone, Default)]
pub struct InMemoryChannelRpcHub {
    inner: Arc<Mutex<HubInner>>,
}

impl InMemoryChannelRpcHub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &self,
        node_id: &str,
        server: Arc<dyn ChannelServerRpc<ChannelError> + Send + Sync>,
    ) {
        let mut inner = self.inner.lock().expect("lock hub");
        inner.servers.insert(node_id.to_string(), server);
    }

    /// Removes a failed node's proxy; subsequent lookups return `None`.
    pub fn remove(&self, node_id: &str) {
        let mut inner = self.inner.lock().expect("lock hub");
        inner.servers.remove(node_id);
        inner.unreachable.remove(node_id);
    }

    /// Injects transient failures for every call routed to the node.
    pub fn set_unreachable(&self, node_id: &str, unreachable: bool) {
        let mut inner = self.inner.lock().expect("lock hub");
        if unreachable {
            inner.unreachable.insert(node_id.to_string());
        } else {
            inner.unreachable.remove(node_id);
        }
    }
}

impl ChannelServerDirectory for InMemoryChannelRpcHub {
    fn server(
        &self,
        node_id: &str,
    ) -> Option<Arc<dyn ChannelServerRpc<ChannelError> + Send + Sync>> {
        let inner = self.inner.lock().expect("lock hub");
        if !inner.servers.contains_key(node_id) {
            return None;
        }
        Some(Arc::new(HubHandle {
            inner: Arc::clone(&self.inner),
            node_id: node_id.to_string(),
        }))
    }
}

/// Per-node handle that checks reachability on every call, modeling an
/// unreliable link in front of the target server.
struct HubHandle {
    inner: Arc<Mutex<HubInner>>,
    node_id: String,
}

impl HubHandle {
    fn target(&self) -> Result<Arc<dyn ChannelServerRpc<ChannelError> + Send + Sync>, ChannelError> {
        let inner = self.inner.lock().expect("lock hub");
        if inner.unreachable.contains(&self.node_id) {
            return Err(ChannelError::RpcFailed {
                node_id: self.node_id.clone(),
                message: "node unreachable".to_string(),
                retryable: true,
            });
        }
        inner
            .servers
            .get(&self.node_id)
            .cloned()
            .ok_or_else(|| ChannelError::RpcFailed {
                node_id: self.node_id.clone(),
                message: "no channel server registered".to_string(),
                retryable: false,
            })
    }
}

impl ChannelServerRpc<ChannelError> for HubHandle {
    fn service_event_queue(&self, channel_id: &str) -> Result<(), ChannelError> {
        self.target()?.service_event_queue(channel_id)
    }

    fn is_member(&self, channel_id: &str, session_id: &str) -> Result<Membership, ChannelError> {
        self.target()?.is_member(channel_id, session_id)
    }

    fn join(
        &self,
        name: &str,
        channel_id: &str,
        delivery: Delivery,
        baseline_timestamp: u64,
        session_id: &str,
    ) -> Result<bool, ChannelError> {
        self.target()?
            .join(name, channel_id, delivery, baseline_timestamp, session_id)
    }

    fn leave(&self, channel_id: &str, timestamp: u64, session_id: &str) -> Result<bool, ChannelError> {
        self.target()?.leave(channel_id, timestamp, session_id)
    }

    fn send(&self, channel_id: &str, payload: &[u8], timestamp: u64) -> Result<(), ChannelError> {
        self.target()?.send(channel_id, payload, timestamp)
    }

    fn close(&self, channel_id: &str, timestamp: u64) -> Result<(), ChannelError> {
        self.target()?.close(channel_id, timestamp)
    }

    fn refresh(&self, name: &str, channel_id: &str, delivery: Delivery) -> Result<(), ChannelError> {
        self.target()?.refresh(name, channel_id, delivery)
    }

    fn sessions(&self, channel_id: &str) -> Result<Vec<String>, ChannelError> {
        self.target()?.sessions(channel_id)
    }

    fn relocate_channel_memberships(
        &self,
        session_id: &str,
        old_node_id: &str,
        entries: &[RelocationEntry],
    ) -> Result<(), ChannelError> {
        self.target()?
            .relocate_channel_memberships(session_id, old_node_id, entries)
    }

    fn relocate_channel_memberships_completed(
        &self,
        session_id: &str,
        new_node_id: &str,
    ) -> Result<(), ChannelError> {
        self.target()?
            .relocate_channel_memberships_completed(session_id, new_node_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct PanicsNever;

    impl ChannelServerRpc<ChannelError> for PanicsNever {
        fn service_event_queue(&self, _channel_id: &str) -> Result<(), ChannelError> {
            Ok(())
        }
        fn is_member(&self, _c: &str, _s: &str) -> Result<Membership, ChannelError> {
            Ok(Membership::Unknown)
        }
        fn join(
            &self,
            _n: &str,
            _c: &str,
            _d: Delivery,
            _t: u64,
            _s: &str,
        ) -> Result<bool, ChannelError> {
            Ok(true)
        }
        fn leave(&self, _c: &str, _t: u64, _s: &str) -> Result<bool, ChannelError> {
            Ok(true)
        }
        fn send(&self, _c: &str, _p: &[u8], _t: u64) -> Result<(), ChannelError> {
            Ok(())
        }
        fn close(&self, _c: &str, _t: u64) -> Result<(), ChannelError> {
            Ok(())
        }
        fn refresh(&self, _n: &str, _c: &str, _d: Delivery) -> Result<(), ChannelError> {
            Ok(())
        }
        fn sessions(&self, _c: &str) -> Result<Vec<String>, ChannelError> {
            Ok(Vec::new())
        }
        fn relocate_channel_memberships(
            &self,
            _s: &str,
            _o: &str,
            _e: &[RelocationEntry],
        ) -> Result<(), ChannelError> {
            Ok(())
        }
        fn relocate_channel_memberships_completed(
            &self,
            _s: &str,
            _n: &str,
        ) -> Result<(), ChannelError> {
            Ok(())
        }
    }

    #[test]
    fn unregistered_nodes_resolve_to_none() {
        let hub = InMemoryChannelRpcHub::new();
        assert!(hub.server("n1").is_none());
        hub.register("n1", Arc::new(PanicsNever));
        assert!(hub.server("n1").is_some());
        hub.remove("n1");
        assert!(hub.server("n1").is_none());
    }

    #[test]
    fn unreachable_node_fails_with_retryable_error() {
        let hub = InMemoryChannelRpcHub::new();
        hub.register("n1", Arc::new(PanicsNever));
        hub.set_unreachable("n1", true);

        let handle = hub.server("n1").expect("handle");
        let err = handle.service_event_queue("c1").expect_err("unreachable");
        assert!(matches!(
            err,
            ChannelError::RpcFailed {
                retryable: true,
                ..
            }
        ));

        hub.set_unreachable("n1", false);
        assert!(handle.service_event_queue("c1").is_ok());
    }
}
