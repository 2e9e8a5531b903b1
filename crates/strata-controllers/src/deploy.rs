//! Deployment bookkeeping: deploy, fail, rollback and history.
//!
//! A deploy records an in-progress deployment, writes the (immutable) app
//! version, CAS-updates the app's active version and then completes the
//! deployment as active, or as failed with the error. Completed records are
//! never touched again.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;
use tracing::{info, warn};

use strata_entity::schema::{App, AppVersion, Deployment, DeploymentStatus, GitInfo};
use strata_entity::{now_millis, Entity, EntityId, EntityStore, Filter, Value};
use strata_reconcile::update_with_retry;

use crate::error::{ControllerError, ControllerResult};

/// A version to roll out.
#[derive(Debug, Clone)]
pub struct DeployRequest {
    pub version: AppVersion,
    pub git: Option<GitInfo>,
}

/// Result of a deploy or rollback.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeployOutcome {
    pub deployment: EntityId,
    pub version: EntityId,
    pub status: DeploymentStatus,
}

pub struct Deployer {
    store: EntityStore,
    seq: AtomicU64,
}

impl Deployer {
    pub fn new(store: EntityStore) -> Self {
        Self {
            store,
            seq: AtomicU64::new(0),
        }
    }

    /// Ids sort by creation time, then by sequence within a millisecond.
    fn next_deployment_id(&self, app: &EntityId, now: u64) -> ControllerResult<EntityId> {
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        Ok(EntityId::new(
            "deployment",
            &format!("{}-{now:013}-{seq:06}", app.name()),
        )?)
    }

    fn ensure_app(&self, app: &EntityId) -> ControllerResult<()> {
        if self.store.try_get(app)?.is_some() {
            return Ok(());
        }
        match self.store.create(&Entity::from_schema(app.clone(), &App::new(app.name()))?) {
            Ok(_) => {
                info!(%app, "app created by deploy");
                Ok(())
            }
            Err(e) if e.is_conflict() => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn record(&self, id: &EntityId, deployment: &Deployment) -> ControllerResult<()> {
        self.store.create(&Entity::from_schema(id.clone(), deployment)?)?;
        Ok(())
    }

    /// Roll out a new version of `app` and make it active.
    pub fn deploy(&self, app: &EntityId, request: DeployRequest) -> ControllerResult<DeployOutcome> {
        self.ensure_app(app)?;
        let started_at = now_millis();
        let deployment = self.next_deployment_id(app, started_at)?;
        self.record(
            &deployment,
            &Deployment {
                app: app.clone(),
                app_version: None,
                status: DeploymentStatus::InProgress,
                started_at,
                completed_at: None,
                git: request.git,
                error: None,
            },
        )?;
        info!(%app, %deployment, version = %request.version.version, "deployment started");

        let version = match self.activate(app, request.version) {
            Ok(version) => version,
            Err(e) => {
                let reason = match e {
                    ControllerError::DeployFailed { reason, .. } => reason,
                    other => other.to_string(),
                };
                self.fail(&deployment, &reason)?;
                return Err(ControllerError::DeployFailed {
                    app: app.to_string(),
                    reason,
                });
            }
        };

        let now = now_millis();
        update_with_retry(&self.store, &deployment, |entity| {
            let mut record: Deployment = entity.decode()?;
            if record.status != DeploymentStatus::InProgress {
                return Ok(false);
            }
            record.status = DeploymentStatus::Active;
            record.app_version = Some(version.clone());
            record.completed_at = Some(now);
            entity.encode(&record);
            Ok(true)
        })?;
        info!(%app, %deployment, %version, "deployment active");
        Ok(DeployOutcome {
            deployment,
            version,
            status: DeploymentStatus::Active,
        })
    }

    /// Write the version (or reuse an identical one) and point the app at it.
    fn activate(&self, app: &EntityId, mut version: AppVersion) -> ControllerResult<EntityId> {
        version.app = app.clone();
        let id = EntityId::new("app_version", &format!("{}-{}", app.name(), version.version))?;
        match self.store.create(&Entity::from_schema(id.clone(), &version)?) {
            Ok(_) => {}
            Err(e) if e.is_conflict() => {
                let (_, existing) = self.store.get_as::<AppVersion>(&id)?;
                if existing != version {
                    return Err(ControllerError::DeployFailed {
                        app: app.to_string(),
                        reason: format!("{id} already exists with a different spec"),
                    });
                }
            }
            Err(e) => return Err(e.into()),
        }
        self.set_active(app, &id)?;
        Ok(id)
    }

    fn set_active(&self, app: &EntityId, version: &EntityId) -> ControllerResult<()> {
        update_with_retry(&self.store, app, |entity| {
            let mut value: App = entity.decode()?;
            if value.active_version.as_ref() == Some(version) {
                return Ok(false);
            }
            value.active_version = Some(version.clone());
            entity.encode(&value);
            Ok(true)
        })?;
        Ok(())
    }

    /// Mark an in-progress deployment failed. Completed ones are left alone.
    pub fn fail(&self, deployment: &EntityId, reason: &str) -> ControllerResult<()> {
        let now = now_millis();
        let written = update_with_retry(&self.store, deployment, |entity| {
            let mut record: Deployment = entity.decode()?;
            if record.status != DeploymentStatus::InProgress {
                return Ok(false);
            }
            record.status = DeploymentStatus::Failed;
            record.error = Some(reason.to_string());
            record.completed_at = Some(now);
            entity.encode(&record);
            Ok(true)
        })?;
        if written.is_some() {
            warn!(%deployment, %reason, "deployment failed");
        }
        Ok(())
    }

    /// Re-activate an earlier version. `target` names the deployment to
    /// return to; without it, the newest active deployment of a version
    /// other than the current one is used.
    pub fn rollback(&self, app: &EntityId, target: Option<&EntityId>) -> ControllerResult<DeployOutcome> {
        let (_, current) = self.store.get_as::<App>(app)?;
        let no_target = || ControllerError::NoRollbackTarget(app.to_string());

        let version = match target {
            Some(deployment) => {
                let (_, record) = self.store.get_as::<Deployment>(deployment)?;
                if record.app != *app {
                    return Err(no_target());
                }
                record.app_version.ok_or_else(no_target)?
            }
            None => self
                .history(app)?
                .into_iter()
                .filter(|(_, d)| d.status == DeploymentStatus::Active)
                .filter_map(|(_, d)| d.app_version)
                .find(|v| current.active_version.as_ref() != Some(v))
                .ok_or_else(no_target)?,
        };
        self.store.get(&version)?;
        self.set_active(app, &version)?;

        let now = now_millis();
        let deployment = self.next_deployment_id(app, now)?;
        self.record(
            &deployment,
            &Deployment {
                app: app.clone(),
                app_version: Some(version.clone()),
                status: DeploymentStatus::RolledBack,
                started_at: now,
                completed_at: Some(now),
                git: None,
                error: None,
            },
        )?;
        info!(%app, %deployment, %version, "rolled back");
        Ok(DeployOutcome {
            deployment,
            version,
            status: DeploymentStatus::RolledBack,
        })
    }

    /// Deployments of `app`, newest first.
    pub fn history(&self, app: &EntityId) -> ControllerResult<Vec<(Entity, Deployment)>> {
        let mut records = self
            .store
            .list_as::<Deployment>(&Filter::attr("deployment.app", Value::Ref(app.clone())))?;
        records.sort_by(|(a, da), (b, db)| {
            db.started_at
                .cmp(&da.started_at)
                .then_with(|| b.id.cmp(&a.id))
        });
        Ok(records)
    }
}
