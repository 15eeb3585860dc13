//! In-memory stand-in for the cluster liveness service.

use std::collections::BTreeMap;
use std::sync::Mutex;

use groupcast_proto::Liveness;

/// Tracks which nodes the failure detector currently believes alive.
/// Unregistered nodes are reported dead.
#[derive(Debug, Default)]
pub struct InMemoryLiveness {
    nodes: Mutex<BTreeMap<String, bool>>,
}

impl InMemoryLiveness {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_alive(&self, node_id: &str, alive: bool) {
        let mut nodes = self.nodes.lock().expect("lock liveness");
        nodes.insert(node_id.to_string(), alive);
    }

    pub fn mark_failed(&self, node_id: &str) {
        self.set_alive(node_id, false);
    }
}

impl Liveness for InMemoryLiveness {
    fn is_alive(&self, node_id: &str) -> bool {
        let nodes = self.nodes.lock().expect("lock liveness");
        nodes.get(node_id).copied().unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_nodes_are_dead() {
        let liveness = InMemoryLiveness::new();
        assert!(!liveness.is_alive("n1"));
        liveness.set_alive("n1", true);
        assert!(liveness.is_alive("n1"));
        liveness.mark_failed("n1");
        assert!(!liveness.is_alive("n1"));
    }
}
