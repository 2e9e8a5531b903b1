//! IP allocator — gives every service a stable address in the service
//! subnet.
//!
//! The preferred address is derived from a SHA-256 of the service id, so
//! the same service lands on the same address across clusters. Collisions
//! probe forward to the next free host address, wrapping within the
//! subnet. Network and broadcast addresses are never handed out.

use std::collections::HashSet;
use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;

use sha2::{Digest, Sha256};
use tracing::{debug, info};

use strata_entity::schema::Service;
use strata_entity::{EntityId, EntityStore, Filter, WatchEvent};
use strata_reconcile::{update_with_retry, Outcome, ReconcileResult, Reconciler};

use crate::error::{ControllerError, ControllerResult};

/// An IPv4 CIDR block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Subnet {
    network: Ipv4Addr,
    prefix: u8,
}

impl Subnet {
    pub fn new(addr: Ipv4Addr, prefix: u8) -> ControllerResult<Self> {
        if !(8..=30).contains(&prefix) {
            return Err(ControllerError::InvalidSubnet {
                subnet: format!("{addr}/{prefix}"),
                reason: "prefix must be between 8 and 30".to_string(),
            });
        }
        let mask = u32::MAX << (32 - prefix);
        Ok(Self {
            network: Ipv4Addr::from(u32::from(addr) & mask),
            prefix,
        })
    }

    pub fn network(&self) -> Ipv4Addr {
        self.network
    }

    /// Usable host addresses (network and broadcast excluded).
    pub fn host_count(&self) -> u32 {
        (1u32 << (32 - self.prefix)) - 2
    }

    pub fn contains(&self, ip: Ipv4Addr) -> bool {
        let mask = u32::MAX << (32 - self.prefix);
        u32::from(ip) & mask == u32::from(self.network)
    }

    fn host(&self, offset: u32) -> Ipv4Addr {
        Ipv4Addr::from(u32::from(self.network) + 1 + offset)
    }

    /// Host offset the id hashes to.
    fn preferred_offset(&self, id: &EntityId) -> u32 {
        let digest = Sha256::digest(id.as_str().as_bytes());
        let head = u32::from_be_bytes([digest[0], digest[1], digest[2], digest[3]]);
        head % self.host_count()
    }

    /// The address for `id`: its hashed address, or the next free one after
    /// it. `None` when every host address is taken.
    pub fn allocate(&self, id: &EntityId, used: &HashSet<Ipv4Addr>) -> Option<Ipv4Addr> {
        let hosts = self.host_count();
        let start = self.preferred_offset(id);
        (0..hosts)
            .map(|i| self.host((start + i) % hosts))
            .find(|ip| !used.contains(ip))
    }
}

impl FromStr for Subnet {
    type Err = ControllerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = |reason: &str| ControllerError::InvalidSubnet {
            subnet: s.to_string(),
            reason: reason.to_string(),
        };
        let (addr, prefix) = s.split_once('/').ok_or_else(|| invalid("missing /prefix"))?;
        let addr: Ipv4Addr = addr.parse().map_err(|_| invalid("bad address"))?;
        let prefix: u8 = prefix.parse().map_err(|_| invalid("bad prefix"))?;
        Self::new(addr, prefix)
    }
}

impl fmt::Display for Subnet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.network, self.prefix)
    }
}

/// Assigns addresses to services that have none.
pub struct IpAllocator {
    store: EntityStore,
    subnet: Subnet,
}

impl IpAllocator {
    pub fn new(store: EntityStore, subnet: Subnet) -> Self {
        Self { store, subnet }
    }

    /// Assign an address to `id` unless it already has one. Returns the
    /// service's address.
    pub fn assign(&self, id: &EntityId) -> ControllerResult<Ipv4Addr> {
        let used: HashSet<Ipv4Addr> = self
            .store
            .list_as::<Service>(&Filter::kind("service"))?
            .into_iter()
            .filter(|(entity, _)| entity.id != *id)
            .filter_map(|(_, svc)| svc.ip)
            .collect();

        let ip = self
            .subnet
            .allocate(id, &used)
            .ok_or_else(|| ControllerError::AddressesExhausted(self.subnet.to_string()))?;

        let mut assigned = ip;
        update_with_retry(&self.store, id, |entity| {
            let mut svc: Service = entity.decode()?;
            if let Some(existing) = svc.ip {
                assigned = existing;
                return Ok(false);
            }
            svc.ip = Some(ip);
            entity.encode(&svc);
            Ok(true)
        })?;
        if assigned == ip {
            info!(service = %id, %ip, "service address assigned");
        }
        Ok(assigned)
    }
}

impl Reconciler for IpAllocator {
    fn name(&self) -> &'static str {
        "ipalloc"
    }

    fn filter(&self) -> Filter {
        Filter::kind("service")
    }

    async fn reconcile(&self, event: &WatchEvent) -> ReconcileResult<Outcome> {
        if event.is_delete() {
            return Ok(Outcome::Done);
        }
        let svc: Service = event.entity.decode()?;
        if let Some(ip) = svc.ip {
            debug!(service = %event.entity.id, %ip, "service already addressed");
            return Ok(Outcome::Done);
        }
        match self.assign(&event.entity.id) {
            Ok(_) => Ok(Outcome::Done),
            Err(e) if e.is_not_found() => Ok(Outcome::Done),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strata_entity::Entity;

    fn svc_id(name: &str) -> EntityId {
        EntityId::new("service", name).unwrap()
    }

    fn put_service(store: &EntityStore, name: &str, ip: Option<Ipv4Addr>) -> EntityId {
        let id = svc_id(name);
        let svc = Service { app: None, port: 80, ip };
        store
            .put(&Entity::from_schema(id.clone(), &svc).unwrap(), None)
            .unwrap();
        id
    }

    #[test]
    fn parses_and_normalises_cidr() {
        let subnet: Subnet = "10.8.3.7/16".parse().unwrap();
        assert_eq!(subnet.network(), Ipv4Addr::new(10, 8, 0, 0));
        assert_eq!(subnet.to_string(), "10.8.0.0/16");
        assert_eq!(subnet.host_count(), 65534);
        assert!(subnet.contains(Ipv4Addr::new(10, 8, 255, 1)));
        assert!(!subnet.contains(Ipv4Addr::new(10, 9, 0, 1)));

        assert!("10.8.0.0".parse::<Subnet>().is_err());
        assert!("10.8.0.0/31".parse::<Subnet>().is_err());
        assert!("nope/16".parse::<Subnet>().is_err());
    }

    #[test]
    fn allocation_is_deterministic_and_skips_reserved_addresses() {
        let subnet: Subnet = "10.8.0.0/30".parse().unwrap();
        let id = svc_id("api");
        let first = subnet.allocate(&id, &HashSet::new()).unwrap();
        assert_eq!(first, subnet.allocate(&id, &HashSet::new()).unwrap());

        // A /30 has exactly two hosts: .1 and .2.
        let hosts = [Ipv4Addr::new(10, 8, 0, 1), Ipv4Addr::new(10, 8, 0, 2)];
        assert!(hosts.contains(&first));

        let second = subnet.allocate(&id, &HashSet::from([first])).unwrap();
        assert_ne!(second, first);
        assert!(hosts.contains(&second));

        assert_eq!(subnet.allocate(&id, &HashSet::from(hosts)), None);
    }

    #[test]
    fn assigns_once_and_probes_past_collisions() {
        let store = EntityStore::open_in_memory().unwrap();
        let subnet: Subnet = "10.8.0.0/24".parse().unwrap();
        let allocator = IpAllocator::new(store.clone(), subnet);

        let preferred = subnet.allocate(&svc_id("web"), &HashSet::new()).unwrap();
        put_service(&store, "squatter", Some(preferred));
        let web = put_service(&store, "web", None);

        let ip = allocator.assign(&web).unwrap();
        assert_ne!(ip, preferred);
        assert!(subnet.contains(ip));

        let revision = store.get(&web).unwrap().revision;
        assert_eq!(allocator.assign(&web).unwrap(), ip);
        assert_eq!(store.get(&web).unwrap().revision, revision);
    }

    #[test]
    fn exhausted_subnet_is_an_error() {
        let store = EntityStore::open_in_memory().unwrap();
        let subnet: Subnet = "10.8.0.0/30".parse().unwrap();
        put_service(&store, "a", Some(Ipv4Addr::new(10, 8, 0, 1)));
        put_service(&store, "b", Some(Ipv4Addr::new(10, 8, 0, 2)));
        let c = put_service(&store, "c", None);

        let err = IpAllocator::new(store, subnet).assign(&c).unwrap_err();
        assert!(matches!(err, ControllerError::AddressesExhausted(_)));
    }
}
