//! Disk-lease controller.
//!
//! - PENDING binds when the disk is provisioned and no other lease holds
//!   it, waits while the disk is provisioning, and fails otherwise.
//! - BOUND is released once its owning sandbox is gone or finished.
//! - RELEASED leases are deleted after the retention period.
//! - FAILED is terminal.

use std::time::Duration;

use tracing::{debug, info, warn};

use strata_entity::schema::{Disk, DiskLease, DiskLeaseStatus, DiskStatus, Sandbox};
use strata_entity::{now_millis, Entity, EntityId, EntityStore, Filter, Value, WatchEvent, WriteOp};
use strata_reconcile::{
    update_with_retry, Outcome, ReconcileError, ReconcileResult, Reconciler,
    DEFAULT_UPDATE_ATTEMPTS,
};

use crate::error::ControllerResult;

/// How long RELEASED leases are kept before deletion.
pub const DEFAULT_RELEASED_RETENTION: Duration = Duration::from_secs(60 * 60);

const PROVISIONING_RECHECK: Duration = Duration::from_secs(5);

pub struct DiskLeaseController {
    store: EntityStore,
    retention: Duration,
    resync: Duration,
}

impl DiskLeaseController {
    pub fn new(store: EntityStore) -> Self {
        Self {
            store,
            retention: DEFAULT_RELEASED_RETENTION,
            resync: Duration::from_secs(30),
        }
    }

    pub fn with_retention(mut self, retention: Duration) -> Self {
        self.retention = retention;
        self
    }

    fn transition(
        &self,
        id: &EntityId,
        from: DiskLeaseStatus,
        apply: impl Fn(&mut DiskLease),
    ) -> ControllerResult<bool> {
        let written = update_with_retry(&self.store, id, |entity| {
            let mut lease: DiskLease = entity.decode()?;
            if lease.status != from {
                return Ok(false);
            }
            apply(&mut lease);
            entity.encode(&lease);
            Ok(true)
        })?;
        Ok(written.is_some())
    }

    fn fail(&self, id: &EntityId, reason: String) -> ControllerResult<()> {
        warn!(lease = %id, %reason, "disk lease failed");
        self.transition(id, DiskLeaseStatus::Pending, |lease| {
            lease.status = DiskLeaseStatus::Failed;
            lease.error = Some(reason.clone());
        })?;
        Ok(())
    }

    /// Bind a pending lease. The lease and its disk are written in one
    /// conditional apply, so of two leases racing for a free disk only one
    /// commits; the other re-reads and finds the disk held.
    fn bind(&self, id: &EntityId) -> ControllerResult<Outcome> {
        for attempt in 1..=DEFAULT_UPDATE_ATTEMPTS {
            let Some(mut lease_entity) = self.store.try_get(id)? else {
                return Ok(Outcome::Done);
            };
            let mut lease: DiskLease = lease_entity.decode()?;
            if lease.status != DiskLeaseStatus::Pending {
                return Ok(Outcome::Done);
            }

            let Some(mut disk_entity) = self.store.try_get(&lease.disk)? else {
                self.fail(id, format!("disk {} does not exist", lease.disk))?;
                return Ok(Outcome::Done);
            };
            let mut disk: Disk = disk_entity.decode()?;
            match disk.status {
                DiskStatus::Provisioning => {
                    debug!(lease = %id, disk = %lease.disk, "disk still provisioning");
                    return Ok(Outcome::RequeueAfter(PROVISIONING_RECHECK));
                }
                DiskStatus::Failed => {
                    self.fail(id, format!("disk {} failed to provision", lease.disk))?;
                    return Ok(Outcome::Done);
                }
                DiskStatus::Provisioned => {}
            }

            // Listed after the disk read: a bind committed before that read
            // is visible here, one committed after it bumps the disk revision.
            let holder = self
                .store
                .list_as::<DiskLease>(&Filter::attr(
                    "disk_lease.disk",
                    Value::Ref(lease.disk.clone()),
                ))?
                .into_iter()
                .find(|(entity, other)| entity.id != *id && other.status.claims_disk());
            if let Some((holder, _)) = holder {
                self.fail(id, format!("disk {} is already bound by {}", lease.disk, holder.id))?;
                return Ok(Outcome::Done);
            }

            lease.status = DiskLeaseStatus::Bound;
            lease.acquired_at = Some(now_millis());
            lease.error = None;
            disk.binds += 1;
            let lease_revision = lease_entity.revision;
            let disk_revision = disk_entity.revision;
            lease_entity.encode(&lease);
            disk_entity.encode(&disk);

            let ops = vec![
                WriteOp::Put {
                    entity: lease_entity,
                    expected: Some(lease_revision),
                },
                WriteOp::Put {
                    entity: disk_entity,
                    expected: Some(disk_revision),
                },
            ];
            match self.store.apply(ops) {
                Ok(_) => {
                    info!(lease = %id, disk = %lease.disk, "disk lease bound");
                    return Ok(Outcome::Done);
                }
                Err(e) if e.is_conflict() => {
                    debug!(lease = %id, attempt, error = %e, "bind conflicted, re-evaluating");
                }
                Err(e) => return Err(e.into()),
            }
        }
        Err(ReconcileError::Contended {
            id: id.to_string(),
            attempts: DEFAULT_UPDATE_ATTEMPTS,
        }
        .into())
    }

    /// Whether the lease's sandbox no longer needs the disk.
    fn owner_gone(&self, lease: &DiskLease) -> ControllerResult<bool> {
        let Some(sandbox) = &lease.sandbox else {
            return Ok(false);
        };
        Ok(match self.store.try_get(sandbox)? {
            None => true,
            Some(entity) => entity.decode::<Sandbox>()?.status.is_terminal(),
        })
    }

    /// Returns whether this call released the lease.
    fn release_if_orphaned(&self, id: &EntityId, lease: &DiskLease) -> ControllerResult<bool> {
        if !self.owner_gone(lease)? {
            return Ok(false);
        }
        let now = now_millis();
        let released = self.transition(id, DiskLeaseStatus::Bound, |lease| {
            lease.status = DiskLeaseStatus::Released;
            lease.released_at = Some(now);
        })?;
        if released {
            info!(lease = %id, disk = %lease.disk, "orphaned disk lease released");
        }
        Ok(released)
    }

    fn collect_released(&self, entity: &Entity, lease: &DiskLease) -> ControllerResult<Outcome> {
        let released_at = lease.released_at.unwrap_or(entity.updated_at);
        let age = Duration::from_millis(now_millis().saturating_sub(released_at));
        if age < self.retention {
            return Ok(Outcome::RequeueAfter(self.retention - age));
        }
        match self.store.delete(&entity.id, Some(entity.revision)) {
            Ok(_) => info!(lease = %entity.id, "released disk lease deleted"),
            Err(e) if e.is_conflict() || e.is_not_found() => {
                debug!(lease = %entity.id, "released lease changed before deletion");
            }
            Err(e) => return Err(e.into()),
        }
        Ok(Outcome::Done)
    }

    /// Release every bound lease whose sandbox is gone. Returns how many
    /// were released.
    pub fn release_orphans(&self) -> ControllerResult<usize> {
        let bound = self.store.list_as::<DiskLease>(&Filter::attr(
            "disk_lease.status",
            DiskLeaseStatus::Bound.keyword(),
        ))?;
        let mut released = 0;
        for (entity, lease) in bound {
            if self.release_if_orphaned(&entity.id, &lease)? {
                released += 1;
            }
        }
        Ok(released)
    }
}

impl Reconciler for DiskLeaseController {
    fn name(&self) -> &'static str {
        "disk_lease"
    }

    fn filter(&self) -> Filter {
        Filter::kind("disk_lease")
    }

    fn resync_interval(&self) -> Option<Duration> {
        Some(self.resync)
    }

    async fn reconcile(&self, event: &WatchEvent) -> ReconcileResult<Outcome> {
        if event.is_delete() {
            return Ok(Outcome::Done);
        }
        let entity = &event.entity;
        let lease: DiskLease = entity.decode()?;
        let outcome = match lease.status {
            DiskLeaseStatus::Pending => self.bind(&entity.id)?,
            DiskLeaseStatus::Bound => {
                self.release_if_orphaned(&entity.id, &lease)?;
                Outcome::Done
            }
            DiskLeaseStatus::Released => self.collect_released(entity, &lease)?,
            DiskLeaseStatus::Failed => Outcome::Done,
        };
        Ok(outcome)
    }
}
