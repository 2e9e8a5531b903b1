//! Sandboxes: one runnable instance of an app version.

use super::{
    int_value, keyword_enum, required_keyword, required_ref, uint, Resources, Schema,
};
use crate::entity::EntityId;
use crate::error::EntityResult;
use crate::value::{Attrs, Value};

keyword_enum! {
    /// Sandbox lifecycle. `Failed` and `Terminated` are terminal.
    pub enum SandboxStatus {
        Pending => "pending",
        Scheduled => "scheduled",
        Running => "running",
        Failed => "failed",
        Terminated => "terminated",
    }
}

impl SandboxStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Failed | Self::Terminated)
    }

    /// Whether a sandbox in this state holds resources on its node.
    pub fn holds_resources(&self) -> bool {
        matches!(self, Self::Scheduled | Self::Running)
    }
}

/// What the sandbox asks for.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SandboxSpec {
    pub resources: Resources,
    pub command: Vec<String>,
    pub disk_leases: Vec<EntityId>,
    /// Port the workload listens on inside the sandbox.
    pub port: u16,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sandbox {
    pub status: SandboxStatus,
    pub spec: SandboxSpec,
    /// Empty until scheduled.
    pub node: Option<EntityId>,
    pub app: EntityId,
    pub app_version: EntityId,
    /// `host:port` reported by the runner once running.
    pub address: Option<String>,
    /// Failure message recorded with `Failed`.
    pub error: Option<String>,
    pub started_at: Option<u64>,
}

impl Sandbox {
    /// A new pending sandbox for an app version.
    pub fn pending(app: EntityId, app_version: EntityId, spec: SandboxSpec) -> Self {
        Self {
            status: SandboxStatus::Pending,
            spec,
            node: None,
            app,
            app_version,
            address: None,
            error: None,
            started_at: None,
        }
    }

    /// Base URL of the running workload.
    pub fn url(&self) -> Option<String> {
        self.address.as_ref().map(|a| format!("http://{a}"))
    }
}

impl Schema for Sandbox {
    const KIND: &'static str = "sandbox";
    const FIELDS: &'static [&'static str] = &[
        "sandbox.status",
        "sandbox.cpu_millis",
        "sandbox.memory_mb",
        "sandbox.command",
        "sandbox.disk_lease",
        "sandbox.port",
        "sandbox.node",
        "sandbox.app",
        "sandbox.app_version",
        "sandbox.address",
        "sandbox.error",
        "sandbox.started_at",
    ];
    const INDEXED: &'static [&'static str] = &[
        "sandbox.status",
        "sandbox.node",
        "sandbox.app",
        "sandbox.app_version",
    ];

    fn encode(&self, attrs: &mut Attrs) {
        attrs.set("sandbox.status", self.status.keyword());
        attrs.set("sandbox.cpu_millis", int_value(self.spec.resources.cpu_millis));
        attrs.set("sandbox.memory_mb", int_value(self.spec.resources.memory_mb));
        for arg in &self.spec.command {
            attrs.push("sandbox.command", Value::string(arg));
        }
        for lease in &self.spec.disk_leases {
            attrs.push("sandbox.disk_lease", Value::Ref(lease.clone()));
        }
        attrs.set("sandbox.port", Value::Int(i64::from(self.spec.port)));
        attrs.set_opt("sandbox.node", self.node.clone().map(Value::Ref));
        attrs.set("sandbox.app", Value::Ref(self.app.clone()));
        attrs.set("sandbox.app_version", Value::Ref(self.app_version.clone()));
        attrs.set_opt("sandbox.address", self.address.as_ref().map(Value::string));
        attrs.set_opt("sandbox.error", self.error.as_ref().map(Value::string));
        attrs.set_opt("sandbox.started_at", self.started_at.map(Value::Time));
    }

    fn decode(attrs: &Attrs) -> EntityResult<Self> {
        Ok(Self {
            status: required_keyword(attrs, Self::KIND, "sandbox.status")?,
            spec: SandboxSpec {
                resources: Resources::new(
                    uint(attrs, "sandbox.cpu_millis"),
                    uint(attrs, "sandbox.memory_mb"),
                ),
                command: attrs.strings("sandbox.command"),
                disk_leases: attrs.references("sandbox.disk_lease"),
                port: u16::try_from(uint(attrs, "sandbox.port")).unwrap_or(0),
            },
            node: attrs.reference("sandbox.node").cloned(),
            app: required_ref(attrs, Self::KIND, "sandbox.app")?,
            app_version: required_ref(attrs, Self::KIND, "sandbox.app_version")?,
            address: attrs.string("sandbox.address").map(str::to_string),
            error: attrs.string("sandbox.error").map(str::to_string),
            started_at: attrs.time("sandbox.started_at"),
        })
    }
}
