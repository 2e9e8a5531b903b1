//! Typed schemas for the built-in kinds.
//!
//! Each schema lists the attribute keys it owns and converts between those
//! attributes and a plain struct. Attributes outside that list pass through
//! untouched, so records written by a newer schema survive a round trip
//! through an older one.

mod app;
mod deployment;
mod disk;
mod network;
mod node;
mod sandbox;

pub use app::{App, AppVersion, Concurrency};
pub use deployment::{Deployment, DeploymentStatus, GitInfo};
pub use disk::{Disk, DiskLease, DiskLeaseStatus, DiskStatus, Mount};
pub use network::{HttpRoute, Service};
pub use node::{Node, NodeStatus};
pub use sandbox::{Sandbox, SandboxSpec, SandboxStatus};

use serde::{Deserialize, Serialize};

use crate::error::{EntityError, EntityResult};
use crate::kind::KindDescriptor;
use crate::value::{Attrs, Value};

/// Explicit attribute codec for one kind.
pub trait Schema: Sized {
    /// Kind name, also the id namespace.
    const KIND: &'static str;
    /// Attribute keys owned by this schema.
    const FIELDS: &'static [&'static str];
    /// Subset of `FIELDS` kept in the secondary index.
    const INDEXED: &'static [&'static str];

    fn encode(&self, attrs: &mut Attrs);
    fn decode(attrs: &Attrs) -> EntityResult<Self>;

    fn descriptor() -> KindDescriptor {
        KindDescriptor::new(Self::KIND, Self::INDEXED)
    }
}

/// Descriptors for every built-in kind.
pub fn builtin_kinds() -> Vec<KindDescriptor> {
    vec![
        Node::descriptor(),
        Sandbox::descriptor(),
        App::descriptor(),
        AppVersion::descriptor(),
        Deployment::descriptor(),
        Disk::descriptor(),
        DiskLease::descriptor(),
        Service::descriptor(),
        HttpRoute::descriptor(),
    ]
}

/// CPU and memory, either requested or available.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resources {
    /// Thousandths of a core.
    pub cpu_millis: u64,
    pub memory_mb: u64,
}

impl Resources {
    pub fn new(cpu_millis: u64, memory_mb: u64) -> Self {
        Self {
            cpu_millis,
            memory_mb,
        }
    }

    /// Whether `request` fits inside `self`.
    pub fn fits(&self, request: &Resources) -> bool {
        request.cpu_millis <= self.cpu_millis && request.memory_mb <= self.memory_mb
    }

    pub fn saturating_sub(&self, other: &Resources) -> Resources {
        Resources {
            cpu_millis: self.cpu_millis.saturating_sub(other.cpu_millis),
            memory_mb: self.memory_mb.saturating_sub(other.memory_mb),
        }
    }

    pub fn add(&self, other: &Resources) -> Resources {
        Resources {
            cpu_millis: self.cpu_millis.saturating_add(other.cpu_millis),
            memory_mb: self.memory_mb.saturating_add(other.memory_mb),
        }
    }
}

/// Declares a status-like enum stored as a keyword attribute.
macro_rules! keyword_enum {
    (
        $(#[$meta:meta])*
        pub enum $name:ident { $($variant:ident => $text:literal),+ $(,)? }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
        #[serde(rename_all = "snake_case")]
        pub enum $name {
            $($variant),+
        }

        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $(Self::$variant => $text),+
                }
            }

            pub fn keyword(&self) -> $crate::value::Value {
                $crate::value::Value::keyword(self.as_str())
            }
        }

        impl std::str::FromStr for $name {
            type Err = String;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok(Self::$variant),)+
                    other => Err(format!("unknown {}: {other}", stringify!($name))),
                }
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}
pub(crate) use keyword_enum;

// ── Decode helpers ─────────────────────────────────────────────────

pub(crate) fn required_keyword<T>(attrs: &Attrs, kind: &str, key: &str) -> EntityResult<T>
where
    T: std::str::FromStr<Err = String>,
{
    let raw = attrs
        .keyword(key)
        .ok_or_else(|| EntityError::schema(kind, format!("missing {key}")))?;
    raw.parse().map_err(|e: String| EntityError::schema(kind, e))
}

pub(crate) fn required_ref(
    attrs: &Attrs,
    kind: &str,
    key: &str,
) -> EntityResult<crate::entity::EntityId> {
    attrs
        .reference(key)
        .cloned()
        .ok_or_else(|| EntityError::schema(kind, format!("missing {key}")))
}

pub(crate) fn required_string(attrs: &Attrs, kind: &str, key: &str) -> EntityResult<String> {
    attrs
        .string(key)
        .map(str::to_string)
        .ok_or_else(|| EntityError::schema(kind, format!("missing {key}")))
}

/// Non-negative integer, `0` when absent.
pub(crate) fn uint(attrs: &Attrs, key: &str) -> u64 {
    attrs.int(key).map(|i| i.max(0) as u64).unwrap_or(0)
}

pub(crate) fn int_value(v: u64) -> Value {
    Value::Int(i64::try_from(v).unwrap_or(i64::MAX))
}
