//! Controller — drives a [`Reconciler`] from a watch stream.
//!
//! One controller runs per reconciler as a background task. It:
//! - opens a watch on the reconciler's filter and reconciles every event
//! - re-watches (and so re-snapshots) with backoff when the stream ends
//! - requeues entities that asked for it or failed, re-reading them first;
//!   each entity has at most one requeue outstanding, the earliest asked for
//! - optionally re-lists the filter on a fixed resync interval

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, Interval};
use tracing::{debug, info, warn};

use strata_entity::{ChangeKind, EntityId, EntityStore, Filter, WatchEvent};

use crate::backoff::Backoff;
use crate::error::ReconcileResult;

/// What the controller should do after a successful reconcile.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Done,
    /// Reconcile the entity again after the delay, using a fresh read.
    RequeueAfter(Duration),
}

/// Converges entities matching [`filter`](Reconciler::filter) toward
/// their desired state. Reconciles must be idempotent: the same entity can
/// be delivered again after a resync, a requeue or a re-watch.
pub trait Reconciler: Send + Sync + 'static {
    fn name(&self) -> &'static str;

    fn filter(&self) -> Filter;

    fn reconcile(&self, event: &WatchEvent) -> impl Future<Output = ReconcileResult<Outcome>> + Send;

    /// Periodic full re-list. `None` disables it.
    fn resync_interval(&self) -> Option<Duration> {
        None
    }

    /// Called with the ids of every newly opened watch's snapshot, before
    /// any of its events. Changes missed while disconnected (deletes in
    /// particular) are never replayed, so state built from earlier events
    /// must drop entries absent here.
    fn on_snapshot(&self, _ids: &HashSet<EntityId>) {}
}

/// Delayed re-reads, at most one outstanding per entity.
struct Requeues {
    tx: mpsc::UnboundedSender<(EntityId, Instant)>,
    due: HashMap<EntityId, Instant>,
}

impl Requeues {
    fn new(tx: mpsc::UnboundedSender<(EntityId, Instant)>) -> Self {
        Self {
            tx,
            due: HashMap::new(),
        }
    }

    /// Requeue `id` after `delay` unless one is already due no later.
    fn schedule(&mut self, id: EntityId, delay: Duration) {
        let at = Instant::now() + delay;
        if self.due.get(&id).is_some_and(|due| *due <= at) {
            return;
        }
        self.due.insert(id.clone(), at);
        let tx = self.tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep_until(at).await;
            let _ = tx.send((id, at));
        });
    }

    /// Whether a fired requeue is still the current one for its entity.
    fn take(&mut self, id: &EntityId, at: Instant) -> bool {
        if self.due.get(id) == Some(&at) {
            self.due.remove(id);
            true
        } else {
            false
        }
    }
}

/// Background runner for one reconciler.
pub struct Controller<R> {
    store: EntityStore,
    reconciler: Arc<R>,
    retry_base: Duration,
    retry_max: Duration,
}

impl<R: Reconciler> Controller<R> {
    pub fn new(store: EntityStore, reconciler: R) -> Self {
        Self::from_arc(store, Arc::new(reconciler))
    }

    /// Share a reconciler that other components also hold.
    pub fn from_arc(store: EntityStore, reconciler: Arc<R>) -> Self {
        Self {
            store,
            reconciler,
            retry_base: Duration::from_millis(100),
            retry_max: Duration::from_secs(30),
        }
    }

    /// Set the per-entity backoff applied after failed reconciles.
    pub fn with_retry(mut self, base: Duration, max: Duration) -> Self {
        self.retry_base = base;
        self.retry_max = max;
        self
    }

    /// Spawn the run loop as a background task.
    pub fn spawn(self, shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(self.run(shutdown))
    }

    /// Run until `shutdown` flips.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let name = self.reconciler.name();
        let filter = self.reconciler.filter();
        let (requeue_tx, mut requeue_rx) = mpsc::unbounded_channel();
        let mut requeues = Requeues::new(requeue_tx);
        let mut failures: HashMap<EntityId, Backoff> = HashMap::new();
        let mut reconnect = Backoff::reconnect();

        info!(controller = name, ?filter, "controller started");

        'watch: loop {
            let mut stream = match self.store.watch(filter.clone()) {
                Ok(stream) => {
                    debug!(controller = name, snapshot = stream.snapshot_len(), "watch opened");
                    reconnect.reset();
                    let ids: HashSet<EntityId> = stream.snapshot_ids().cloned().collect();
                    self.reconciler.on_snapshot(&ids);
                    stream
                }
                Err(e) => {
                    let delay = reconnect.next_delay();
                    warn!(controller = name, error = %e, ?delay, "watch failed, retrying");
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => continue 'watch,
                        _ = shutdown.changed() => break 'watch,
                    }
                }
            };

            let mut resync = self
                .reconciler
                .resync_interval()
                .map(|period| tokio::time::interval_at(Instant::now() + period, period));

            loop {
                tokio::select! {
                    _ = shutdown.changed() => break 'watch,
                    event = stream.recv() => match event {
                        Some(event) => self.dispatch(event, &mut requeues, &mut failures).await,
                        None => {
                            warn!(controller = name, "watch stream ended, re-watching");
                            break;
                        }
                    },
                    Some((id, at)) = requeue_rx.recv() => {
                        if !requeues.take(&id, at) {
                            // Superseded by an earlier deadline.
                            continue;
                        }
                        match self.store.try_get(&id) {
                            Ok(Some(entity)) if filter.matches(&entity) => {
                                let event = WatchEvent { change: ChangeKind::Put, entity };
                                self.dispatch(event, &mut requeues, &mut failures).await;
                            }
                            Ok(_) => {
                                failures.remove(&id);
                            }
                            Err(e) => {
                                warn!(controller = name, %id, error = %e, "requeue read failed");
                                requeues.schedule(id, reconnect.peek());
                            }
                        }
                    }
                    _ = next_tick(&mut resync) => {
                        match self.store.list(&filter) {
                            Ok(entities) => {
                                debug!(controller = name, count = entities.len(), "resync");
                                for entity in entities {
                                    let event = WatchEvent { change: ChangeKind::Put, entity };
                                    self.dispatch(event, &mut requeues, &mut failures).await;
                                }
                            }
                            Err(e) => warn!(controller = name, error = %e, "resync list failed"),
                        }
                    }
                }
            }

            let delay = reconnect.next_delay();
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = shutdown.changed() => break 'watch,
            }
        }

        info!(controller = name, "controller stopped");
    }

    async fn dispatch(
        &self,
        event: WatchEvent,
        requeues: &mut Requeues,
        failures: &mut HashMap<EntityId, Backoff>,
    ) {
        let name = self.reconciler.name();
        let id = event.entity.id.clone();
        match self.reconciler.reconcile(&event).await {
            Ok(Outcome::Done) => {
                failures.remove(&id);
            }
            Ok(Outcome::RequeueAfter(delay)) => {
                failures.remove(&id);
                requeues.schedule(id, delay);
            }
            Err(e) => {
                let delay = failures
                    .entry(id.clone())
                    .or_insert_with(|| Backoff::new(self.retry_base, self.retry_max))
                    .next_delay();
                if e.is_conflict() {
                    debug!(controller = name, %id, ?delay, "reconcile conflicted, requeueing");
                } else {
                    warn!(controller = name, %id, error = %e, ?delay, "reconcile failed, requeueing");
                }
                requeues.schedule(id, delay);
            }
        }
    }
}

async fn next_tick(interval: &mut Option<Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}
