//! Node capacity snapshots.
//!
//! Committed resources are recomputed from the store on every pass by
//! summing the specs of SCHEDULED and RUNNING sandboxes per node. Nothing is
//! cached across passes, so a missed watch event cannot skew accounting.

use std::time::Duration;

use strata_entity::schema::{Node, NodeStatus, Resources, Sandbox};
use strata_entity::{EntityId, EntityResult, EntityStore, Filter, Revision, Value};

/// One eligible node and what is already committed on it.
#[derive(Debug, Clone)]
pub struct NodeCapacity {
    pub id: EntityId,
    /// Node revision read with this snapshot, used to guard placement.
    pub revision: Revision,
    pub node: Node,
    pub used: Resources,
    pub sandboxes: usize,
}

impl NodeCapacity {
    pub fn total(&self) -> Resources {
        self.node.capacity
    }

    pub fn free(&self) -> Resources {
        self.node.capacity.saturating_sub(&self.used)
    }
}

/// Ready nodes with a fresh heartbeat, sorted by id.
pub fn snapshot(
    store: &EntityStore,
    now_millis: u64,
    staleness: Duration,
) -> EntityResult<Vec<NodeCapacity>> {
    let ready = Filter::attr("node.status", NodeStatus::Ready.keyword());
    let cutoff = now_millis.saturating_sub(staleness.as_millis() as u64);

    let mut nodes = Vec::new();
    for (entity, node) in store.list_as::<Node>(&ready)? {
        if node.heartbeat_at < cutoff {
            continue;
        }
        let on_node = Filter::attr("sandbox.node", Value::Ref(entity.id.clone()));
        let mut used = Resources::default();
        let mut sandboxes = 0;
        for (_, sandbox) in store.list_as::<Sandbox>(&on_node)? {
            if sandbox.status.holds_resources() {
                used = used.add(&sandbox.spec.resources);
                sandboxes += 1;
            }
        }
        nodes.push(NodeCapacity {
            id: entity.id,
            revision: entity.revision,
            node,
            used,
            sandboxes,
        });
    }
    nodes.sort_by(|a, b| a.id.cmp(&b.id));
    Ok(nodes)
}
