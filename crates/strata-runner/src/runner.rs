//! Runner — the node-side agent.
//!
//! Registers its node entity, heartbeats it, and reconciles the sandboxes
//! assigned to it: SCHEDULED ones are started and reported RUNNING (or
//! FAILED), terminal or deleted ones are stopped, and RUNNING ones the
//! driver does not know about are marked FAILED.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use strata_entity::schema::{Node, NodeStatus, Resources, Sandbox, SandboxStatus};
use strata_entity::{now_millis, Entity, EntityId, EntityStore, Filter, Value, WatchEvent};
use strata_reconcile::{update_with_retry, Outcome, ReconcileError, ReconcileResult, Reconciler};

use crate::driver::SandboxDriver;
use crate::error::RunnerResult;

/// Node identity and advertised resources.
#[derive(Debug, Clone)]
pub struct RunnerConfig {
    /// Name part of the `node/<name>` id.
    pub node_name: String,
    /// Host other components use to reach this node's sandboxes.
    pub address: String,
    pub capacity: Resources,
    pub heartbeat_interval: Duration,
    pub resync_interval: Duration,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            node_name: "local".to_string(),
            address: "127.0.0.1".to_string(),
            capacity: Resources::new(4000, 4096),
            heartbeat_interval: Duration::from_secs(5),
            resync_interval: Duration::from_secs(30),
        }
    }
}

pub struct Runner<D> {
    store: EntityStore,
    node: EntityId,
    driver: Arc<D>,
    config: RunnerConfig,
}

impl<D: SandboxDriver> Runner<D> {
    pub fn new(store: EntityStore, driver: Arc<D>, config: RunnerConfig) -> RunnerResult<Self> {
        let node = EntityId::new("node", &config.node_name)?;
        Ok(Self {
            store,
            node,
            driver,
            config,
        })
    }

    pub fn node_id(&self) -> &EntityId {
        &self.node
    }

    // ── Node lifecycle ─────────────────────────────────────────────

    /// Create or refresh this node's entity as ready. An existing node keeps
    /// its placement counter.
    pub fn register(&self) -> RunnerResult<()> {
        let node = Node {
            status: NodeStatus::Ready,
            address: self.config.address.clone(),
            capacity: self.config.capacity,
            placements: 0,
            heartbeat_at: now_millis(),
        };
        match self.store.create(&Entity::from_schema(self.node.clone(), &node)?) {
            Ok(_) => {
                info!(node = %self.node, address = %node.address, "node registered");
                return Ok(());
            }
            Err(e) if e.is_conflict() => {}
            Err(e) => return Err(e.into()),
        }

        update_with_retry(&self.store, &self.node, |entity| {
            let mut existing: Node = entity.decode()?;
            existing.status = NodeStatus::Ready;
            existing.address = self.config.address.clone();
            existing.capacity = self.config.capacity;
            existing.heartbeat_at = now_millis();
            entity.encode(&existing);
            Ok(true)
        })?;
        info!(node = %self.node, "node re-registered");
        Ok(())
    }

    pub fn heartbeat(&self) -> RunnerResult<()> {
        let result = update_with_retry(&self.store, &self.node, |entity| {
            let mut node: Node = entity.decode()?;
            node.heartbeat_at = now_millis();
            entity.encode(&node);
            Ok(true)
        });
        match result {
            Ok(_) => {
                debug!(node = %self.node, "heartbeat");
                Ok(())
            }
            Err(ReconcileError::Store(e)) if e.is_not_found() => {
                warn!(node = %self.node, "node entity vanished, registering again");
                self.register()
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Take the node out of scheduling.
    pub fn mark_not_ready(&self) -> RunnerResult<()> {
        update_with_retry(&self.store, &self.node, |entity| {
            let mut node: Node = entity.decode()?;
            if node.status == NodeStatus::NotReady {
                return Ok(false);
            }
            node.status = NodeStatus::NotReady;
            entity.encode(&node);
            Ok(true)
        })?;
        info!(node = %self.node, "node marked not ready");
        Ok(())
    }

    /// Mark sandboxes whose workload exited as FAILED. Returns how many.
    pub fn reap_exited(&self) -> usize {
        let exited = self.driver.reap();
        for (sandbox, reason) in &exited {
            warn!(%sandbox, %reason, "sandbox workload exited");
            if let Err(e) = self.fail(sandbox, reason) {
                error!(%sandbox, error = %e, "failed to record sandbox exit");
            }
        }
        exited.len()
    }

    /// Heartbeat and reap until `shutdown` flips, then mark the node not
    /// ready.
    pub async fn run_heartbeat(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        info!(node = %self.node, interval = ?self.config.heartbeat_interval, "heartbeat loop started");
        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.config.heartbeat_interval) => {
                    if let Err(e) = self.heartbeat() {
                        warn!(node = %self.node, error = %e, "heartbeat failed");
                    }
                    self.reap_exited();
                }
                _ = shutdown.changed() => {
                    info!(node = %self.node, "heartbeat loop shutting down");
                    break;
                }
            }
        }
        if let Err(e) = self.mark_not_ready() {
            warn!(node = %self.node, error = %e, "could not mark node not ready");
        }
    }

    // ── Sandboxes ──────────────────────────────────────────────────

    async fn start(&self, id: &EntityId, sandbox: &Sandbox) -> RunnerResult<()> {
        if self.driver.is_running(id) {
            debug!(%id, "restarting sandbox with unrecorded start");
            self.driver.stop(id).await?;
        }

        let started = match self.driver.start(id, &sandbox.spec).await {
            Ok(started) => started,
            Err(e) => {
                warn!(%id, error = %e, "sandbox failed to start");
                return self.fail(id, &e.to_string());
            }
        };

        let written = update_with_retry(&self.store, id, |entity| {
            let mut current: Sandbox = entity.decode()?;
            if current.status != SandboxStatus::Scheduled || current.node.as_ref() != Some(&self.node) {
                return Ok(false);
            }
            current.status = SandboxStatus::Running;
            current.address = Some(started.address.clone());
            current.started_at = Some(now_millis());
            current.error = None;
            entity.encode(&current);
            Ok(true)
        });
        match written {
            Ok(Some(_)) => {
                info!(%id, node = %self.node, address = %started.address, "sandbox running");
                Ok(())
            }
            Ok(None) => {
                debug!(%id, "sandbox changed while starting, stopping it");
                self.driver.stop(id).await
            }
            Err(e) => {
                self.driver.stop(id).await?;
                match e {
                    ReconcileError::Store(e) if e.is_not_found() => Ok(()),
                    e => Err(e.into()),
                }
            }
        }
    }

    /// Record a failure unless the sandbox already finished.
    fn fail(&self, id: &EntityId, reason: &str) -> RunnerResult<()> {
        let result = update_with_retry(&self.store, id, |entity| {
            let mut sandbox: Sandbox = entity.decode()?;
            if sandbox.status.is_terminal() {
                return Ok(false);
            }
            sandbox.status = SandboxStatus::Failed;
            sandbox.error = Some(reason.to_string());
            entity.encode(&sandbox);
            Ok(true)
        });
        match result {
            Ok(_) => Ok(()),
            Err(ReconcileError::Store(e)) if e.is_not_found() => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

impl<D: SandboxDriver> Reconciler for Runner<D> {
    fn name(&self) -> &'static str {
        "runner"
    }

    fn filter(&self) -> Filter {
        Filter::attr("sandbox.node", Value::Ref(self.node.clone()))
    }

    fn resync_interval(&self) -> Option<Duration> {
        Some(self.config.resync_interval)
    }

    async fn reconcile(&self, event: &WatchEvent) -> ReconcileResult<Outcome> {
        let id = &event.entity.id;
        if event.is_delete() {
            self.driver.stop(id).await?;
            return Ok(Outcome::Done);
        }

        let sandbox: Sandbox = event.entity.decode()?;
        if sandbox.node.as_ref() != Some(&self.node) {
            self.driver.stop(id).await?;
            return Ok(Outcome::Done);
        }

        match sandbox.status {
            SandboxStatus::Pending => {}
            SandboxStatus::Scheduled => self.start(id, &sandbox).await?,
            SandboxStatus::Running => {
                if !self.driver.is_running(id) {
                    warn!(%id, node = %self.node, "running sandbox not tracked by this runner");
                    self.fail(id, "sandbox lost by its runner")?;
                }
            }
            SandboxStatus::Failed | SandboxStatus::Terminated => {
                if self.driver.is_running(id) {
                    info!(%id, status = sandbox.status.as_str(), "stopping sandbox");
                }
                self.driver.stop(id).await?;
            }
        }
        Ok(Outcome::Done)
    }
}
