//! Service addresses and HTTP routes.

use std::net::Ipv4Addr;

use super::{required_ref, required_string, uint, Schema};
use crate::entity::EntityId;
use crate::error::{EntityError, EntityResult};
use crate::value::{Attrs, Value};

/// A stable virtual address for an app.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Service {
    pub app: Option<EntityId>,
    pub port: u16,
    /// Assigned by the IP allocator.
    pub ip: Option<Ipv4Addr>,
}

impl Schema for Service {
    const KIND: &'static str = "service";
    const FIELDS: &'static [&'static str] = &["service.app", "service.port", "service.ip"];
    const INDEXED: &'static [&'static str] = &["service.app", "service.ip"];

    fn encode(&self, attrs: &mut Attrs) {
        attrs.set_opt("service.app", self.app.clone().map(Value::Ref));
        attrs.set("service.port", Value::Int(i64::from(self.port)));
        attrs.set_opt("service.ip", self.ip.map(|ip| Value::string(ip.to_string())));
    }

    fn decode(attrs: &Attrs) -> EntityResult<Self> {
        let ip = match attrs.string("service.ip") {
            Some(raw) => Some(raw.parse().map_err(|e| {
                EntityError::schema(Self::KIND, format!("bad service.ip {raw}: {e}"))
            })?),
            None => None,
        };
        Ok(Self {
            app: attrs.reference("service.app").cloned(),
            port: u16::try_from(uint(attrs, "service.port")).unwrap_or(0),
            ip,
        })
    }
}

/// Maps an HTTP host to an app.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpRoute {
    pub host: String,
    pub app: EntityId,
    /// Catch-all route used when no host matches.
    pub default: bool,
}

impl Schema for HttpRoute {
    const KIND: &'static str = "http_route";
    const FIELDS: &'static [&'static str] =
        &["http_route.host", "http_route.app", "http_route.default"];
    const INDEXED: &'static [&'static str] = &["http_route.host", "http_route.app"];

    fn encode(&self, attrs: &mut Attrs) {
        attrs.set("http_route.host", Value::string(&self.host));
        attrs.set("http_route.app", Value::Ref(self.app.clone()));
        attrs.set("http_route.default", Value::Bool(self.default));
    }

    fn decode(attrs: &Attrs) -> EntityResult<Self> {
        Ok(Self {
            host: required_string(attrs, Self::KIND, "http_route.host")?,
            app: required_ref(attrs, Self::KIND, "http_route.app")?,
            default: attrs.boolean("http_route.default").unwrap_or(false),
        })
    }
}
