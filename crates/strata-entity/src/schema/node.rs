//! Worker nodes that run sandboxes.

use super::{int_value, keyword_enum, required_keyword, required_string, uint, Resources, Schema};
use crate::error::EntityResult;
use crate::value::{Attrs, Value};

keyword_enum! {
    /// Scheduling eligibility of a node.
    pub enum NodeStatus {
        Ready => "ready",
        NotReady => "not_ready",
        Draining => "draining",
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Node {
    pub status: NodeStatus,
    /// Host other components use to reach sandboxes on this node.
    pub address: String,
    pub capacity: Resources,
    /// Bumped on every placement so concurrent schedulers conflict on the node.
    pub placements: u64,
    /// Milliseconds since epoch of the last runner heartbeat.
    pub heartbeat_at: u64,
}

impl Schema for Node {
    const KIND: &'static str = "node";
    const FIELDS: &'static [&'static str] = &[
        "node.status",
        "node.address",
        "node.cpu_millis",
        "node.memory_mb",
        "node.placements",
        "node.heartbeat",
    ];
    const INDEXED: &'static [&'static str] = &["node.status"];

    fn encode(&self, attrs: &mut Attrs) {
        attrs.set("node.status", self.status.keyword());
        attrs.set("node.address", Value::string(&self.address));
        attrs.set("node.cpu_millis", int_value(self.capacity.cpu_millis));
        attrs.set("node.memory_mb", int_value(self.capacity.memory_mb));
        attrs.set("node.placements", int_value(self.placements));
        attrs.set("node.heartbeat", Value::Time(self.heartbeat_at));
    }

    fn decode(attrs: &Attrs) -> EntityResult<Self> {
        Ok(Self {
            status: required_keyword(attrs, Self::KIND, "node.status")?,
            address: required_string(attrs, Self::KIND, "node.address")?,
            capacity: Resources::new(
                uint(attrs, "node.cpu_millis"),
                uint(attrs, "node.memory_mb"),
            ),
            placements: uint(attrs, "node.placements"),
            heartbeat_at: attrs.time("node.heartbeat").unwrap_or(0),
        })
    }
}
