//! Activator — turns requests for an app into leases on warm sandboxes.
//!
//! The request path leases an idle (or not yet full) window when one
//! exists. Otherwise it creates a PENDING sandbox for the app's active
//! version and waits, bounded by the cold-start timeout, for the watch to
//! report it RUNNING. Cold starts are coalesced per app: the check-and-create
//! step runs under a per-app async mutex, and a start already in flight is
//! reused instead of creating another one. The mutex is never held while
//! waiting for scheduling.
//!
//! A background sweep retires idle windows through a conditional
//! RUNNING→TERMINATED write and keeps `min_instances` warm.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use sha2::{Digest, Sha256};
use tokio::sync::{watch, Notify};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use strata_entity::schema::{App, AppVersion, Sandbox, SandboxSpec, SandboxStatus};
use strata_entity::{Entity, EntityId, EntityStore, Filter, Revision, WatchEvent};
use strata_reconcile::{Outcome, ReconcileResult, Reconciler};

use crate::error::{ActivatorError, ActivatorResult};
use crate::pool::{PoolStats, VersionPool, Window};
use crate::strategy::{Strategy, DEFAULT_SCALE_DOWN_DELAY};

/// Activator tuning.
#[derive(Debug, Clone)]
pub struct ActivatorConfig {
    /// Longest a request waits for a cold start.
    pub cold_start_timeout: Duration,
    /// Interval of the idle sweep and min-instance pass.
    pub sweep_interval: Duration,
    /// Idle time before retirement when the version sets none.
    pub default_scale_down_delay: Duration,
    /// Port used when the version sets none.
    pub default_port: u16,
    /// A cold start failing within this window counts as a crash.
    pub crash_window: Duration,
    pub crash_backoff_base: Duration,
    pub crash_backoff_max: Duration,
}

impl Default for ActivatorConfig {
    fn default() -> Self {
        Self {
            cold_start_timeout: Duration::from_secs(30),
            sweep_interval: Duration::from_secs(20),
            default_scale_down_delay: DEFAULT_SCALE_DOWN_DELAY,
            default_port: 3000,
            crash_window: Duration::from_secs(60),
            crash_backoff_base: Duration::from_secs(10),
            crash_backoff_max: Duration::from_secs(15 * 60),
        }
    }
}

/// A claim on part of a window's capacity. Release it when the request
/// is done.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lease {
    pub app: EntityId,
    pub version: EntityId,
    pub sandbox: EntityId,
    pub url: String,
    pub size: u32,
}

enum Retirement {
    Retired,
    /// The sandbox is no longer running; nothing to do.
    Gone,
    /// Still running at this revision; the window goes back.
    Kept(Revision),
}

/// Pool manager and request-path decision point.
pub struct Activator {
    store: EntityStore,
    config: ActivatorConfig,
    /// version id → pool
    pools: Mutex<HashMap<EntityId, VersionPool>>,
    /// app id → cold-start gate
    gates: Mutex<HashMap<EntityId, Arc<tokio::sync::Mutex<()>>>>,
    /// Woken whenever a window appears, frees up or a start fails.
    changed: Notify,
    seq: AtomicU64,
}

impl Activator {
    pub fn new(store: EntityStore, config: ActivatorConfig) -> Self {
        Self {
            store,
            config,
            pools: Mutex::new(HashMap::new()),
            gates: Mutex::new(HashMap::new()),
            changed: Notify::new(),
            seq: AtomicU64::new(0),
        }
    }

    pub fn config(&self) -> &ActivatorConfig {
        &self.config
    }

    fn pools(&self) -> MutexGuard<'_, HashMap<EntityId, VersionPool>> {
        self.pools.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn gate(&self, app: &EntityId) -> Arc<tokio::sync::Mutex<()>> {
        self.gates
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(app.clone())
            .or_default()
            .clone()
    }

    /// Make sure a pool exists for the version.
    fn ensure_pool(&self, version: &EntityId) -> ActivatorResult<()> {
        if self.pools().contains_key(version) {
            return Ok(());
        }
        let (_, spec) = self.store.get_as::<AppVersion>(version)?;
        let strategy = Strategy::for_version(&spec, self.config.default_scale_down_delay);
        debug!(%version, ?strategy, "tracking version pool");
        self.pools()
            .entry(version.clone())
            .or_insert_with(|| VersionPool::new(version.clone(), spec, strategy));
        Ok(())
    }

    /// The version requests for `app` are routed to.
    pub fn active_version(&self, app: &EntityId) -> ActivatorResult<EntityId> {
        let (_, value) = self.store.get_as::<App>(app)?;
        value
            .active_version
            .ok_or_else(|| ActivatorError::NoActiveVersion(app.to_string()))
    }

    // ── Request path ───────────────────────────────────────────────

    /// Lease a window of the app's active version, cold starting one if
    /// needed.
    pub async fn acquire(&self, app: &EntityId) -> ActivatorResult<Lease> {
        let version = self.active_version(app)?;
        self.acquire_version(app, &version).await
    }

    /// Lease a window of a specific version.
    pub async fn acquire_version(&self, app: &EntityId, version: &EntityId) -> ActivatorResult<Lease> {
        let started = Instant::now();
        let deadline = started + self.config.cold_start_timeout;
        self.ensure_pool(version)?;

        loop {
            // Register for wakeups before looking, so none is missed.
            let notified = self.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(lease) = self.try_lease(version) {
                return Ok(lease);
            }

            {
                let gate = self.gate(app);
                let _flight = gate.lock().await;
                if let Some(lease) = self.try_lease(version) {
                    return Ok(lease);
                }
                self.start_if_needed(version)?;
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                warn!(%app, %version, "timed out waiting for a cold start");
                return Err(ActivatorError::Timeout {
                    app: app.to_string(),
                    waited: started.elapsed(),
                });
            }
        }
    }

    fn try_lease(&self, version: &EntityId) -> Option<Lease> {
        let mut pools = self.pools();
        let pool = pools.get_mut(version)?;
        let granted = pool.lease(Instant::now())?;
        debug!(sandbox = %granted.sandbox, %version, size = granted.size, "lease granted");
        Some(Lease {
            app: pool.app().clone(),
            version: version.clone(),
            sandbox: granted.sandbox,
            url: granted.url,
            size: granted.size,
        })
    }

    /// Create a PENDING sandbox unless one is in flight, the version is at
    /// `max_instances` or it is backing off after crashes.
    fn start_if_needed(&self, version: &EntityId) -> ActivatorResult<()> {
        let now = Instant::now();
        let spec = {
            let pools = self.pools();
            let Some(pool) = pools.get(version) else {
                return Ok(());
            };
            if !pool.pending().is_empty() {
                debug!(%version, "cold start already in flight");
                return Ok(());
            }
            if let Some(remaining) = pool.crash_backoff_remaining(now) {
                return Err(ActivatorError::NoCapacity {
                    version: version.to_string(),
                    reason: format!("{} recent crashes", pool.crashes()),
                    retry_after: Some(remaining),
                });
            }
            if !pool.below_max() {
                debug!(%version, max = pool.spec.max_instances, "at max_instances, waiting for a release");
                return Ok(());
            }
            pool.spec.clone()
        };

        let id = self.create_sandbox(version, &spec)?;
        if let Some(pool) = self.pools().get_mut(version) {
            pool.add_pending(id, now);
        }
        Ok(())
    }

    fn create_sandbox(&self, version: &EntityId, spec: &AppVersion) -> ActivatorResult<EntityId> {
        let name = format!("{}-{}", spec.app.name(), self.next_suffix(version));
        let id = EntityId::new("sandbox", &name)?;
        let port = if spec.port > 0 {
            spec.port
        } else {
            self.config.default_port
        };
        let sandbox = Sandbox::pending(
            spec.app.clone(),
            version.clone(),
            SandboxSpec {
                resources: spec.resources,
                command: spec.command.clone(),
                disk_leases: Vec::new(),
                port,
            },
        );
        self.store.create(&Entity::from_schema(id.clone(), &sandbox)?)?;
        info!(sandbox = %id, app = %spec.app, %version, "cold start: sandbox created");
        Ok(id)
    }

    fn next_suffix(&self, version: &EntityId) -> String {
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos();
        let mut hasher = Sha256::new();
        hasher.update(version.as_str().as_bytes());
        hasher.update(nanos.to_le_bytes());
        hasher.update(seq.to_le_bytes());
        hex::encode(&hasher.finalize()[..6])
    }

    /// Give a lease's capacity back.
    pub fn release(&self, lease: &Lease) {
        let released = self
            .pools()
            .get_mut(&lease.version)
            .is_some_and(|p| p.release(&lease.sandbox, lease.size, Instant::now()));
        if released {
            self.changed.notify_waiters();
        } else {
            debug!(sandbox = %lease.sandbox, "released lease on a retired window");
        }
    }

    /// Mark a lease's window active so the sweep leaves it alone.
    pub fn renew(&self, lease: &Lease) -> ActivatorResult<()> {
        let renewed = self
            .pools()
            .get_mut(&lease.version)
            .is_some_and(|p| p.renew(&lease.sandbox, Instant::now()));
        if renewed {
            Ok(())
        } else {
            Err(ActivatorError::LeaseNotFound(lease.sandbox.to_string()))
        }
    }

    /// Window counts across every tracked version of an app.
    pub fn pool_stats(&self, app: &EntityId) -> PoolStats {
        let mut stats = PoolStats::default();
        for pool in self.pools().values().filter(|p| p.app() == app) {
            stats.merge(pool.stats());
        }
        stats
    }

    // ── Watch events ───────────────────────────────────────────────

    /// Fold one sandbox change into the pools.
    pub fn observe(&self, event: &WatchEvent) {
        let entity = &event.entity;
        let sandbox: Sandbox = match entity.decode() {
            Ok(sandbox) => sandbox,
            Err(e) => {
                debug!(id = %entity.id, error = %e, "ignoring undecodable sandbox");
                return;
            }
        };
        let version = &sandbox.app_version;
        let now = Instant::now();

        if event.is_delete() || sandbox.status.is_terminal() {
            {
                let mut pools = self.pools();
                let Some(pool) = pools.get_mut(version) else {
                    return;
                };
                let start = pool.observe_gone(&entity.id);
                let quick = start
                    .is_some_and(|s| now.saturating_duration_since(s.created) < self.config.crash_window);
                if quick && sandbox.status == SandboxStatus::Failed {
                    let delay = pool.record_crash(
                        now,
                        self.config.crash_backoff_base,
                        self.config.crash_backoff_max,
                    );
                    warn!(
                        sandbox = %entity.id,
                        %version,
                        crashes = pool.crashes(),
                        ?delay,
                        "cold start crashed, backing off"
                    );
                }
            }
            self.changed.notify_waiters();
            return;
        }

        if let Err(e) = self.ensure_pool(version) {
            warn!(sandbox = %entity.id, %version, error = %e, "cannot track sandbox version");
            return;
        }

        match sandbox.status {
            SandboxStatus::Running => {
                let Some(url) = sandbox.url() else {
                    return;
                };
                let added = self
                    .pools()
                    .get_mut(version)
                    .is_some_and(|p| p.observe_running(&entity.id, entity.revision, url, now));
                if added {
                    info!(sandbox = %entity.id, %version, "window ready");
                }
                self.changed.notify_waiters();
            }
            SandboxStatus::Pending | SandboxStatus::Scheduled => {
                if let Some(pool) = self.pools().get_mut(version) {
                    pool.add_pending(entity.id.clone(), now);
                }
            }
            SandboxStatus::Failed | SandboxStatus::Terminated => {}
        }
    }

    /// Reconcile the pools against the sandboxes that exist right now.
    /// Deletes missed while the watch was disconnected would otherwise
    /// leave dead windows and in-flight starts that never complete.
    pub fn prune(&self, present: &HashSet<EntityId>) -> usize {
        let dropped: usize = self
            .pools()
            .values_mut()
            .map(|pool| pool.retain_present(present))
            .sum();
        if dropped > 0 {
            info!(dropped, "dropped pool entries for vanished sandboxes");
            self.changed.notify_waiters();
        }
        dropped
    }

    /// Forget empty pools of inactive versions, and gates of apps with
    /// no pool left that nobody is waiting on.
    fn forget_retired(&self, inactive: &HashSet<EntityId>) {
        let mut pools = self.pools();
        pools.retain(|version, pool| {
            let keep = !(inactive.contains(version) && pool.is_empty());
            if !keep {
                debug!(%version, "forgetting retired version pool");
            }
            keep
        });
        let apps: HashSet<&EntityId> = pools.values().map(|p| p.app()).collect();
        self.gates
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|app, gate| apps.contains(app) || Arc::strong_count(gate) > 1);
    }

    // ── Background ─────────────────────────────────────────────────

    /// Retire idle windows. Returns the sandboxes terminated.
    pub fn sweep(&self) -> Vec<EntityId> {
        let now = Instant::now();
        let tracked: Vec<(EntityId, EntityId)> = self
            .pools()
            .iter()
            .map(|(version, pool)| (version.clone(), pool.app().clone()))
            .collect();

        let mut inactive = HashSet::new();
        for (version, app) in &tracked {
            match self.store.get_as::<App>(app) {
                Ok((_, app)) if app.active_version.as_ref() == Some(version) => {}
                Ok(_) => {
                    inactive.insert(version.clone());
                }
                Err(e) if e.is_not_found() => {
                    inactive.insert(version.clone());
                }
                Err(e) => warn!(%app, error = %e, "sweep could not read app"),
            }
        }

        let mut candidates: Vec<(EntityId, Window)> = Vec::new();
        {
            let mut pools = self.pools();
            for (version, pool) in pools.iter_mut() {
                for window in pool.take_idle(now, inactive.contains(version)) {
                    candidates.push((version.clone(), window));
                }
            }
        }

        let mut retired = Vec::new();
        for (version, window) in candidates {
            let outcome = match self.terminate(&window) {
                Ok(outcome) => outcome,
                Err(e) => {
                    warn!(sandbox = %window.sandbox, error = %e, "idle retirement failed");
                    Retirement::Kept(window.revision)
                }
            };
            let mut pools = self.pools();
            let Some(pool) = pools.get_mut(&version) else {
                continue;
            };
            match outcome {
                Retirement::Retired => {
                    info!(sandbox = %window.sandbox, %version, "idle sandbox retired");
                    pool.retired(&window.sandbox);
                    retired.push(window.sandbox);
                }
                Retirement::Gone => pool.retired(&window.sandbox),
                Retirement::Kept(revision) => {
                    debug!(sandbox = %window.sandbox, "sandbox changed under the sweep, keeping it");
                    pool.restore(window, revision);
                }
            }
        }
        self.forget_retired(&inactive);
        retired
    }

    /// Conditional RUNNING→TERMINATED against the revision the pool saw.
    fn terminate(&self, window: &Window) -> ActivatorResult<Retirement> {
        let entity = match self.store.try_get(&window.sandbox)? {
            Some(entity) => entity,
            None => return Ok(Retirement::Gone),
        };
        let mut sandbox: Sandbox = entity.decode()?;
        if sandbox.status != SandboxStatus::Running {
            return Ok(Retirement::Gone);
        }
        sandbox.status = SandboxStatus::Terminated;
        let mut updated = entity.clone();
        updated.encode(&sandbox);
        match self.store.put(&updated, Some(window.revision)) {
            Ok(_) => Ok(Retirement::Retired),
            Err(e) if e.is_conflict() => Ok(Retirement::Kept(entity.revision)),
            Err(e) => Err(e.into()),
        }
    }

    /// Start sandboxes until every active version has its minimum.
    /// Returns how many were started.
    pub async fn ensure_min_instances(&self) -> usize {
        let apps = match self.store.list_as::<App>(&Filter::kind("app")) {
            Ok(apps) => apps,
            Err(e) => {
                warn!(error = %e, "min-instance pass could not list apps");
                return 0;
            }
        };

        let mut started = 0;
        for (entity, app) in apps {
            let Some(version) = app.active_version else {
                continue;
            };
            if let Err(e) = self.ensure_pool(&version) {
                warn!(app = %entity.id, %version, error = %e, "cannot track active version");
                continue;
            }
            let gate = self.gate(&entity.id);
            let _flight = gate.lock().await;
            loop {
                let now = Instant::now();
                let spec = {
                    let pools = self.pools();
                    let Some(pool) = pools.get(&version) else {
                        break;
                    };
                    if pool.instance_count() >= pool.min_windows()
                        || !pool.below_max()
                        || pool.crash_backoff_remaining(now).is_some()
                    {
                        break;
                    }
                    pool.spec.clone()
                };
                match self.create_sandbox(&version, &spec) {
                    Ok(id) => {
                        if let Some(pool) = self.pools().get_mut(&version) {
                            pool.add_pending(id, now);
                        }
                        started += 1;
                    }
                    Err(e) => {
                        warn!(%version, error = %e, "failed to start minimum instance");
                        break;
                    }
                }
            }
        }
        started
    }

    /// Run the sweep and min-instance pass until `shutdown` flips.
    pub async fn run_background(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(self.config.sweep_interval);
        interval.tick().await;
        info!(interval = ?self.config.sweep_interval, "activator background pass started");
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let retired = self.sweep();
                    let started = self.ensure_min_instances().await;
                    if !retired.is_empty() || started > 0 {
                        debug!(retired = retired.len(), started, "activator pass");
                    }
                }
                _ = shutdown.changed() => {
                    debug!("activator background pass shutting down");
                    break;
                }
            }
        }
    }
}

impl Reconciler for Activator {
    fn name(&self) -> &'static str {
        "activator"
    }

    fn filter(&self) -> Filter {
        Filter::kind("sandbox")
    }

    fn on_snapshot(&self, ids: &HashSet<EntityId>) {
        self.prune(ids);
    }

    async fn reconcile(&self, event: &WatchEvent) -> ReconcileResult<Outcome> {
        self.observe(event);
        Ok(Outcome::Done)
    }
}
