//! Disks and the leases that bind them to sandboxes.

use super::{int_value, keyword_enum, required_keyword, required_ref, required_string, uint, Schema};
use crate::entity::EntityId;
use crate::error::EntityResult;
use crate::value::{Attrs, Value};

keyword_enum! {
    pub enum DiskStatus {
        Provisioning => "provisioning",
        Provisioned => "provisioned",
        Failed => "failed",
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Disk {
    pub name: String,
    pub size_gb: u64,
    pub status: DiskStatus,
    /// Bumped by every lease bind, so two binds racing on one disk conflict.
    pub binds: u64,
}

impl Schema for Disk {
    const KIND: &'static str = "disk";
    const FIELDS: &'static [&'static str] =
        &["disk.name", "disk.size_gb", "disk.status", "disk.binds"];
    const INDEXED: &'static [&'static str] = &["disk.status"];

    fn encode(&self, attrs: &mut Attrs) {
        attrs.set("disk.name", Value::string(&self.name));
        attrs.set("disk.size_gb", int_value(self.size_gb));
        attrs.set("disk.status", self.status.keyword());
        attrs.set("disk.binds", int_value(self.binds));
    }

    fn decode(attrs: &Attrs) -> EntityResult<Self> {
        Ok(Self {
            name: required_string(attrs, Self::KIND, "disk.name")?,
            size_gb: uint(attrs, "disk.size_gb"),
            status: required_keyword(attrs, Self::KIND, "disk.status")?,
            binds: uint(attrs, "disk.binds"),
        })
    }
}

keyword_enum! {
    /// `Pending → Bound → Released`; any state may fail. `Failed` is terminal.
    pub enum DiskLeaseStatus {
        Pending => "pending",
        Bound => "bound",
        Released => "released",
        Failed => "failed",
    }
}

impl DiskLeaseStatus {
    /// Whether the lease currently claims its disk.
    pub fn claims_disk(&self) -> bool {
        matches!(self, Self::Bound)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Mount {
    pub path: String,
    pub read_only: bool,
    pub options: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiskLease {
    pub disk: EntityId,
    pub sandbox: Option<EntityId>,
    pub app: Option<EntityId>,
    pub node: Option<EntityId>,
    pub status: DiskLeaseStatus,
    pub mount: Mount,
    pub acquired_at: Option<u64>,
    pub released_at: Option<u64>,
    pub error: Option<String>,
}

impl DiskLease {
    pub fn pending(disk: EntityId, sandbox: Option<EntityId>, mount: Mount) -> Self {
        Self {
            disk,
            sandbox,
            app: None,
            node: None,
            status: DiskLeaseStatus::Pending,
            mount,
            acquired_at: None,
            released_at: None,
            error: None,
        }
    }
}

impl Schema for DiskLease {
    const KIND: &'static str = "disk_lease";
    const FIELDS: &'static [&'static str] = &[
        "disk_lease.disk",
        "disk_lease.sandbox",
        "disk_lease.app",
        "disk_lease.node",
        "disk_lease.status",
        "disk_lease.mount_path",
        "disk_lease.mount_read_only",
        "disk_lease.mount_options",
        "disk_lease.acquired_at",
        "disk_lease.released_at",
        "disk_lease.error",
    ];
    const INDEXED: &'static [&'static str] = &[
        "disk_lease.disk",
        "disk_lease.sandbox",
        "disk_lease.status",
    ];

    fn encode(&self, attrs: &mut Attrs) {
        attrs.set("disk_lease.disk", Value::Ref(self.disk.clone()));
        attrs.set_opt("disk_lease.sandbox", self.sandbox.clone().map(Value::Ref));
        attrs.set_opt("disk_lease.app", self.app.clone().map(Value::Ref));
        attrs.set_opt("disk_lease.node", self.node.clone().map(Value::Ref));
        attrs.set("disk_lease.status", self.status.keyword());
        attrs.set("disk_lease.mount_path", Value::string(&self.mount.path));
        attrs.set("disk_lease.mount_read_only", Value::Bool(self.mount.read_only));
        attrs.set_opt(
            "disk_lease.mount_options",
            self.mount.options.as_ref().map(Value::string),
        );
        attrs.set_opt("disk_lease.acquired_at", self.acquired_at.map(Value::Time));
        attrs.set_opt("disk_lease.released_at", self.released_at.map(Value::Time));
        attrs.set_opt("disk_lease.error", self.error.as_ref().map(Value::string));
    }

    fn decode(attrs: &Attrs) -> EntityResult<Self> {
        Ok(Self {
            disk: required_ref(attrs, Self::KIND, "disk_lease.disk")?,
            sandbox: attrs.reference("disk_lease.sandbox").cloned(),
            app: attrs.reference("disk_lease.app").cloned(),
            node: attrs.reference("disk_lease.node").cloned(),
            status: required_keyword(attrs, Self::KIND, "disk_lease.status")?,
            mount: Mount {
                path: attrs.string("disk_lease.mount_path").unwrap_or_default().to_string(),
                read_only: attrs.boolean("disk_lease.mount_read_only").unwrap_or(false),
                options: attrs.string("disk_lease.mount_options").map(str::to_string),
            },
            acquired_at: attrs.time("disk_lease.acquired_at"),
            released_at: attrs.time("disk_lease.released_at"),
            error: attrs.string("disk_lease.error").map(str::to_string),
        })
    }
}
