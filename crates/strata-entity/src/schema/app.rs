//! Apps and their immutable versions.

use std::time::Duration;

use super::{int_value, required_ref, required_string, uint, Resources, Schema};
use crate::entity::EntityId;
use crate::error::{EntityError, EntityResult};
use crate::value::{Attrs, Value};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct App {
    pub name: String,
    pub active_version: Option<EntityId>,
    /// At most one app cluster-wide is the default; kept so by a reconciler.
    pub default: bool,
}

impl App {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            active_version: None,
            default: false,
        }
    }
}

impl Schema for App {
    const KIND: &'static str = "app";
    const FIELDS: &'static [&'static str] = &["app.name", "app.active_version", "app.default"];
    const INDEXED: &'static [&'static str] = &["app.default", "app.active_version"];

    fn encode(&self, attrs: &mut Attrs) {
        attrs.set("app.name", Value::string(&self.name));
        attrs.set_opt(
            "app.active_version",
            self.active_version.clone().map(Value::Ref),
        );
        attrs.set("app.default", Value::Bool(self.default));
    }

    fn decode(attrs: &Attrs) -> EntityResult<Self> {
        Ok(Self {
            name: required_string(attrs, Self::KIND, "app.name")?,
            active_version: attrs.reference("app.active_version").cloned(),
            default: attrs.boolean("app.default").unwrap_or(false),
        })
    }
}

/// How many requests a sandbox of this version may serve at once.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum Concurrency {
    /// Scale with traffic, down to zero when idle.
    Auto {
        requests_per_instance: Option<u32>,
        #[serde(default, with = "opt_millis")]
        scale_down_delay: Option<Duration>,
    },
    /// A fixed number of always-on instances.
    Fixed { instances: u32 },
}

mod opt_millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(v: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        match v {
            Some(d) => s.serialize_some(&(d.as_millis() as u64)),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        Ok(Option::<u64>::deserialize(d)?.map(Duration::from_millis))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppVersion {
    pub app: EntityId,
    pub version: String,
    pub command: Vec<String>,
    pub resources: Resources,
    pub port: u16,
    /// `None` means one request per sandbox.
    pub concurrency: Option<Concurrency>,
    pub min_instances: u32,
    /// `0` means unbounded.
    pub max_instances: u32,
}

impl AppVersion {
    pub fn new(app: EntityId, version: &str) -> Self {
        Self {
            app,
            version: version.to_string(),
            command: Vec::new(),
            resources: Resources::default(),
            port: 0,
            concurrency: None,
            min_instances: 0,
            max_instances: 0,
        }
    }
}

impl Schema for AppVersion {
    const KIND: &'static str = "app_version";
    const FIELDS: &'static [&'static str] = &[
        "app_version.app",
        "app_version.version",
        "app_version.command",
        "app_version.cpu_millis",
        "app_version.memory_mb",
        "app_version.port",
        "app_version.concurrency_mode",
        "app_version.requests_per_instance",
        "app_version.scale_down_delay_ms",
        "app_version.instances",
        "app_version.min_instances",
        "app_version.max_instances",
    ];
    const INDEXED: &'static [&'static str] = &["app_version.app"];

    fn encode(&self, attrs: &mut Attrs) {
        attrs.set("app_version.app", Value::Ref(self.app.clone()));
        attrs.set("app_version.version", Value::string(&self.version));
        for arg in &self.command {
            attrs.push("app_version.command", Value::string(arg));
        }
        attrs.set("app_version.cpu_millis", int_value(self.resources.cpu_millis));
        attrs.set("app_version.memory_mb", int_value(self.resources.memory_mb));
        attrs.set("app_version.port", Value::Int(i64::from(self.port)));
        match &self.concurrency {
            None => {}
            Some(Concurrency::Auto {
                requests_per_instance,
                scale_down_delay,
            }) => {
                attrs.set("app_version.concurrency_mode", Value::keyword("auto"));
                attrs.set_opt(
                    "app_version.requests_per_instance",
                    requests_per_instance.map(|n| Value::Int(i64::from(n))),
                );
                attrs.set_opt(
                    "app_version.scale_down_delay_ms",
                    scale_down_delay.map(|d| int_value(d.as_millis() as u64)),
                );
            }
            Some(Concurrency::Fixed { instances }) => {
                attrs.set("app_version.concurrency_mode", Value::keyword("fixed"));
                attrs.set("app_version.instances", Value::Int(i64::from(*instances)));
            }
        }
        attrs.set(
            "app_version.min_instances",
            Value::Int(i64::from(self.min_instances)),
        );
        attrs.set(
            "app_version.max_instances",
            Value::Int(i64::from(self.max_instances)),
        );
    }

    fn decode(attrs: &Attrs) -> EntityResult<Self> {
        let concurrency = match attrs.keyword("app_version.concurrency_mode") {
            None => None,
            Some("auto") => Some(Concurrency::Auto {
                requests_per_instance: attrs
                    .int("app_version.requests_per_instance")
                    .and_then(|n| u32::try_from(n).ok()),
                scale_down_delay: attrs
                    .int("app_version.scale_down_delay_ms")
                    .map(|ms| Duration::from_millis(ms.max(0) as u64)),
            }),
            Some("fixed") => Some(Concurrency::Fixed {
                instances: u32::try_from(uint(attrs, "app_version.instances")).unwrap_or(u32::MAX),
            }),
            Some(other) => {
                return Err(EntityError::schema(
                    Self::KIND,
                    format!("unknown concurrency mode {other}"),
                ));
            }
        };

        Ok(Self {
            app: required_ref(attrs, Self::KIND, "app_version.app")?,
            version: required_string(attrs, Self::KIND, "app_version.version")?,
            command: attrs.strings("app_version.command"),
            resources: Resources::new(
                uint(attrs, "app_version.cpu_millis"),
                uint(attrs, "app_version.memory_mb"),
            ),
            port: u16::try_from(uint(attrs, "app_version.port")).unwrap_or(0),
            concurrency,
            min_instances: u32::try_from(uint(attrs, "app_version.min_instances")).unwrap_or(0),
            max_instances: u32::try_from(uint(attrs, "app_version.max_instances")).unwrap_or(0),
        })
    }
}
