//! Scheduler — places PENDING sandboxes onto ready nodes.
//!
//! Each pass reads the sandbox, snapshots node capacity, picks a node and
//! commits the assignment together with a bump of the node's placement
//! counter in one conditional `apply`. Two schedulers racing for the same
//! node therefore conflict on the node, and the loser re-evaluates against
//! fresh capacity instead of over-committing.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use strata_entity::schema::{Node, Sandbox, SandboxStatus};
use strata_entity::{now_millis, EntityId, EntityStore, Filter, WatchEvent, WriteOp};
use strata_reconcile::{update_with_retry, Backoff, Outcome, ReconcileError, ReconcileResult, Reconciler};

use crate::capacity::snapshot;
use crate::error::SchedulerResult;
use crate::placement::{is_satisfiable, select_node};

/// Re-evaluations after a conflicting commit within one pass.
const MAX_COMMIT_ATTEMPTS: usize = 8;

/// Scheduler tuning.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// First retry delay when no node has room.
    pub retry_base: Duration,
    /// Ceiling for the no-room retry delay.
    pub retry_max: Duration,
    /// No-room passes before the sandbox is failed.
    pub max_placement_attempts: u32,
    /// Nodes whose last heartbeat is older than this are ignored.
    pub heartbeat_staleness: Duration,
    /// Periodic re-list of pending sandboxes.
    pub resync_interval: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            retry_base: Duration::from_secs(1),
            retry_max: Duration::from_secs(30),
            max_placement_attempts: 30,
            heartbeat_staleness: Duration::from_secs(30),
            resync_interval: Duration::from_secs(30),
        }
    }
}

/// Result of one scheduling pass over a sandbox.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    Scheduled { node: EntityId },
    /// Eligible nodes exist but none has room right now.
    NoCapacity,
    /// The request can never be placed; the sandbox was failed.
    Unsatisfiable,
    /// The sandbox is no longer pending.
    Skipped,
    /// The sandbox was deleted.
    Gone,
}

/// A sandbox waiting for room.
struct Waiting {
    backoff: Backoff,
    /// Passes before this only re-arm the timer; they are not attempts.
    next_attempt: Instant,
}

/// Whether a no-room pass counts against `max_placement_attempts`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Attempt {
    /// The retry timer has not fired yet.
    Early(Duration),
    Counted { attempts: u32, delay: Duration },
}

/// Places pending sandboxes. Safe to run as several concurrent instances.
pub struct Scheduler {
    store: EntityStore,
    config: SchedulerConfig,
    waiting: Mutex<HashMap<EntityId, Waiting>>,
}

impl Scheduler {
    pub fn new(store: EntityStore, config: SchedulerConfig) -> Self {
        Self {
            store,
            config,
            waiting: Mutex::new(HashMap::new()),
        }
    }

    /// Run one scheduling pass for a sandbox.
    pub fn schedule(&self, id: &EntityId) -> SchedulerResult<Decision> {
        for attempt in 1..=MAX_COMMIT_ATTEMPTS {
            let entity = match self.store.try_get(id)? {
                Some(entity) => entity,
                None => return Ok(Decision::Gone),
            };
            let mut sandbox: Sandbox = entity.decode()?;
            if sandbox.status != SandboxStatus::Pending {
                return Ok(Decision::Skipped);
            }

            let request = sandbox.spec.resources;
            let nodes = snapshot(&self.store, now_millis(), self.config.heartbeat_staleness)?;

            if !nodes.is_empty() && !is_satisfiable(&nodes, &request) {
                let reason = format!(
                    "unsatisfiable: request of {}m cpu / {}MB memory exceeds every node",
                    request.cpu_millis, request.memory_mb
                );
                return Ok(match self.fail(id, &reason)? {
                    true => Decision::Unsatisfiable,
                    false => Decision::Skipped,
                });
            }

            let Some(target) = select_node(&nodes, &request) else {
                debug!(%id, nodes = nodes.len(), "no node has room");
                return Ok(Decision::NoCapacity);
            };

            sandbox.status = SandboxStatus::Scheduled;
            sandbox.node = Some(target.id.clone());
            let mut updated = entity.clone();
            updated.encode(&sandbox);

            let mut node_entity = self.store.get(&target.id)?;
            if node_entity.revision != target.revision {
                debug!(%id, node = %target.id, "node changed since snapshot, re-evaluating");
                continue;
            }
            let node = Node {
                placements: target.node.placements + 1,
                ..target.node.clone()
            };
            node_entity.encode(&node);

            let ops = vec![
                WriteOp::Put {
                    entity: updated,
                    expected: Some(entity.revision),
                },
                WriteOp::Put {
                    entity: node_entity,
                    expected: Some(target.revision),
                },
            ];
            match self.store.apply(ops) {
                Ok(_) => {
                    info!(%id, node = %target.id, "sandbox scheduled");
                    return Ok(Decision::Scheduled {
                        node: target.id.clone(),
                    });
                }
                Err(e) if e.is_conflict() => {
                    debug!(%id, attempt, error = %e, "placement conflicted, re-evaluating");
                }
                Err(e) => return Err(e.into()),
            }
        }
        Err(ReconcileError::Contended {
            id: id.to_string(),
            attempts: MAX_COMMIT_ATTEMPTS,
        }
        .into())
    }

    /// Mark a still-pending sandbox FAILED. Returns whether it was failed.
    fn fail(&self, id: &EntityId, reason: &str) -> SchedulerResult<bool> {
        let updated = update_with_retry(&self.store, id, |entity| {
            let mut sandbox: Sandbox = entity.decode()?;
            if sandbox.status != SandboxStatus::Pending {
                return Ok(false);
            }
            sandbox.status = SandboxStatus::Failed;
            sandbox.error = Some(reason.to_string());
            entity.encode(&sandbox);
            Ok(true)
        });
        match updated {
            Ok(Some(_)) => {
                warn!(%id, %reason, "sandbox failed placement");
                Ok(true)
            }
            Ok(None) => Ok(false),
            Err(ReconcileError::Store(e)) if e.is_not_found() => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    fn waiting(&self) -> std::sync::MutexGuard<'_, HashMap<EntityId, Waiting>> {
        self.waiting.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Record a no-room pass. Only passes at or after the backoff deadline
    /// count, so resyncs and re-delivered events cannot use up attempts.
    fn no_room(&self, id: &EntityId, now: Instant) -> Attempt {
        let mut waiting = self.waiting();
        let entry = waiting.entry(id.clone()).or_insert_with(|| Waiting {
            backoff: Backoff::new(self.config.retry_base, self.config.retry_max),
            next_attempt: now,
        });
        if now < entry.next_attempt {
            return Attempt::Early(entry.next_attempt - now);
        }
        let delay = entry.backoff.next_delay();
        entry.next_attempt = now + delay;
        Attempt::Counted {
            attempts: entry.backoff.attempts(),
            delay,
        }
    }
}

impl Reconciler for Scheduler {
    fn name(&self) -> &'static str {
        "scheduler"
    }

    fn filter(&self) -> Filter {
        Filter::attr("sandbox.status", SandboxStatus::Pending.keyword())
    }

    fn resync_interval(&self) -> Option<Duration> {
        Some(self.config.resync_interval)
    }

    async fn reconcile(&self, event: &WatchEvent) -> ReconcileResult<Outcome> {
        let id = &event.entity.id;
        if event.is_delete() {
            self.waiting().remove(id);
            return Ok(Outcome::Done);
        }

        match self.schedule(id)? {
            Decision::NoCapacity => match self.no_room(id, Instant::now()) {
                Attempt::Early(remaining) => Ok(Outcome::RequeueAfter(remaining)),
                Attempt::Counted { attempts, .. }
                    if attempts >= self.config.max_placement_attempts =>
                {
                    self.waiting().remove(id);
                    let reason = format!("no capacity after {attempts} placement attempts");
                    self.fail(id, &reason)?;
                    Ok(Outcome::Done)
                }
                Attempt::Counted { attempts, delay } => {
                    debug!(%id, attempt = attempts, ?delay, "sandbox waiting for capacity");
                    Ok(Outcome::RequeueAfter(delay))
                }
            },
            Decision::Scheduled { .. }
            | Decision::Unsatisfiable
            | Decision::Skipped
            | Decision::Gone => {
                self.waiting().remove(id);
                Ok(Outcome::Done)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use strata_entity::schema::{NodeStatus, Resources, SandboxSpec};
    use strata_entity::Entity;
    use strata_reconcile::Controller;

    fn test_node(store: &EntityStore, name: &str, cpu: u64, mem: u64) {
        let node = Node {
            status: NodeStatus::Ready,
            address: "127.0.0.1".to_string(),
            capacity: Resources::new(cpu, mem),
            placements: 0,
            heartbeat_at: now_millis(),
        };
        let id = EntityId::new("node", name).unwrap();
        store.put(&Entity::from_schema(id, &node).unwrap(), None).unwrap();
    }

    fn test_sandbox(store: &EntityStore, name: &str, cpu: u64, mem: u64) -> EntityId {
        let sb = Sandbox::pending(
            EntityId::parse("app/web").unwrap(),
            EntityId::parse("app_version/web-1").unwrap(),
            SandboxSpec {
                resources: Resources::new(cpu, mem),
                ..SandboxSpec::default()
            },
        );
        let id = EntityId::new("sandbox", name).unwrap();
        store.put(&Entity::from_schema(id.clone(), &sb).unwrap(), None).unwrap();
        id
    }

    fn sandbox(store: &EntityStore, id: &EntityId) -> Sandbox {
        store.get(id).unwrap().decode().unwrap()
    }

    #[test]
    fn schedules_pending_sandbox_onto_node() {
        let store = EntityStore::open_in_memory().unwrap();
        test_node(&store, "1", 4000, 4096);
        let id = test_sandbox(&store, "1", 1000, 512);

        let scheduler = Scheduler::new(store.clone(), SchedulerConfig::default());
        let decision = scheduler.schedule(&id).unwrap();

        let node = EntityId::parse("node/1").unwrap();
        assert_eq!(decision, Decision::Scheduled { node: node.clone() });
        let sb = sandbox(&store, &id);
        assert_eq!(sb.status, SandboxStatus::Scheduled);
        assert_eq!(sb.node, Some(node.clone()));

        let (_, n) = store.get_as::<Node>(&node).unwrap();
        assert_eq!(n.placements, 1);
    }

    #[test]
    fn non_pending_sandbox_is_skipped() {
        let store = EntityStore::open_in_memory().unwrap();
        test_node(&store, "1", 4000, 4096);
        let id = test_sandbox(&store, "1", 1000, 512);
        let scheduler = Scheduler::new(store.clone(), SchedulerConfig::default());
        scheduler.schedule(&id).unwrap();

        assert_eq!(scheduler.schedule(&id).unwrap(), Decision::Skipped);
        store.delete(&id, None).unwrap();
        assert_eq!(scheduler.schedule(&id).unwrap(), Decision::Gone);
    }

    #[test]
    fn oversized_request_fails_immediately() {
        let store = EntityStore::open_in_memory().unwrap();
        test_node(&store, "1", 4000, 4096);
        let id = test_sandbox(&store, "big", 8000, 512);

        let scheduler = Scheduler::new(store.clone(), SchedulerConfig::default());
        assert_eq!(scheduler.schedule(&id).unwrap(), Decision::Unsatisfiable);

        let sb = sandbox(&store, &id);
        assert_eq!(sb.status, SandboxStatus::Failed);
        assert!(sb.error.unwrap().contains("unsatisfiable"));
    }

    #[test]
    fn full_cluster_leaves_sandbox_pending() {
        let store = EntityStore::open_in_memory().unwrap();
        test_node(&store, "1", 2000, 4096);
        let a = test_sandbox(&store, "a", 2000, 512);
        let b = test_sandbox(&store, "b", 1000, 512);

        let scheduler = Scheduler::new(store.clone(), SchedulerConfig::default());
        assert!(matches!(scheduler.schedule(&a).unwrap(), Decision::Scheduled { .. }));
        assert_eq!(scheduler.schedule(&b).unwrap(), Decision::NoCapacity);
        assert_eq!(sandbox(&store, &b).status, SandboxStatus::Pending);
    }

    #[test]
    fn no_nodes_leaves_sandbox_pending() {
        let store = EntityStore::open_in_memory().unwrap();
        let id = test_sandbox(&store, "a", 1000, 512);
        let scheduler = Scheduler::new(store.clone(), SchedulerConfig::default());
        assert_eq!(scheduler.schedule(&id).unwrap(), Decision::NoCapacity);
    }

    #[tokio::test]
    async fn repeated_no_capacity_eventually_fails() {
        let store = EntityStore::open_in_memory().unwrap();
        test_node(&store, "1", 1000, 1024);
        let blocker = test_sandbox(&store, "blocker", 1000, 512);
        let id = test_sandbox(&store, "waiting", 1000, 512);

        let config = SchedulerConfig {
            max_placement_attempts: 3,
            retry_base: Duration::from_millis(5),
            retry_max: Duration::from_millis(5),
            ..SchedulerConfig::default()
        };
        let scheduler = Scheduler::new(store.clone(), config);
        scheduler.schedule(&blocker).unwrap();

        let event = WatchEvent {
            change: strata_entity::ChangeKind::Put,
            entity: store.get(&id).unwrap(),
        };
        for _ in 0..2 {
            let outcome = scheduler.reconcile(&event).await.unwrap();
            assert!(matches!(outcome, Outcome::RequeueAfter(_)));
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(scheduler.reconcile(&event).await.unwrap(), Outcome::Done);

        let sb = sandbox(&store, &id);
        assert_eq!(sb.status, SandboxStatus::Failed);
        assert!(sb.error.unwrap().contains("no capacity"));
    }

    #[test]
    fn passes_before_the_retry_is_due_are_not_attempts() {
        let store = EntityStore::open_in_memory().unwrap();
        let id = test_sandbox(&store, "waiting", 1000, 512);
        let config = SchedulerConfig {
            retry_base: Duration::from_secs(1),
            retry_max: Duration::from_secs(1),
            ..SchedulerConfig::default()
        };
        let scheduler = Scheduler::new(store, config);
        let now = Instant::now();

        assert_eq!(
            scheduler.no_room(&id, now),
            Attempt::Counted {
                attempts: 1,
                delay: Duration::from_secs(1)
            }
        );
        for ms in [0, 100, 999] {
            assert!(matches!(
                scheduler.no_room(&id, now + Duration::from_millis(ms)),
                Attempt::Early(_)
            ));
        }
        assert!(matches!(
            scheduler.no_room(&id, now + Duration::from_secs(1)),
            Attempt::Counted { attempts: 2, .. }
        ));
    }

    #[tokio::test]
    async fn resyncs_do_not_exhaust_placement_attempts() {
        let store = EntityStore::open_in_memory().unwrap();
        let id = test_sandbox(&store, "waiting", 1000, 512);
        let config = SchedulerConfig {
            retry_base: Duration::from_millis(100),
            retry_max: Duration::from_millis(100),
            max_placement_attempts: 5,
            resync_interval: Duration::from_millis(10),
            ..SchedulerConfig::default()
        };
        let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
        let handle = Controller::new(store.clone(), Scheduler::new(store.clone(), config))
            .spawn(shutdown_rx);

        // Five attempts 100ms apart take at least 400ms however often the
        // filter is re-listed.
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(sandbox(&store, &id).status, SandboxStatus::Pending);

        let mut failed = false;
        for _ in 0..300 {
            if sandbox(&store, &id).status == SandboxStatus::Failed {
                failed = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let _ = shutdown_tx.send(true);
        handle.await.unwrap();
        assert!(failed, "sandbox never failed for lack of capacity");
        assert!(sandbox(&store, &id).error.unwrap().contains("after 5 placement attempts"));
    }

    /// Small deterministic generator so the capacity property runs the same
    /// way every time.
    struct Lcg(u64);

    impl Lcg {
        fn next(&mut self, bound: u64) -> u64 {
            self.0 = self.0.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
            (self.0 >> 33) % bound
        }
    }

    #[test]
    fn concurrent_schedulers_never_overcommit_a_node() {
        for seed in 0..10u64 {
            let store = EntityStore::open_in_memory().unwrap();
            let mut rng = Lcg(seed);
            for n in 0..3 {
                test_node(
                    &store,
                    &format!("n{n}"),
                    1000 + rng.next(4) * 1000,
                    1024 + rng.next(4) * 1024,
                );
            }
            let ids: Vec<EntityId> = (0..24)
                .map(|i| {
                    test_sandbox(
                        &store,
                        &format!("s{i}"),
                        250 + rng.next(4) * 250,
                        128 + rng.next(8) * 128,
                    )
                })
                .collect();
            let ids = Arc::new(ids);

            let handles: Vec<_> = (0..3)
                .map(|_| {
                    let store = store.clone();
                    let ids = ids.clone();
                    std::thread::spawn(move || {
                        let scheduler = Scheduler::new(store, SchedulerConfig::default());
                        for id in ids.iter() {
                            // Contention errors are fine; another instance owns the write.
                            let _ = scheduler.schedule(id);
                        }
                    })
                })
                .collect();
            for h in handles {
                h.join().unwrap();
            }

            for (node_entity, node) in store.list_as::<Node>(&Filter::kind("node")).unwrap() {
                let mut used = Resources::default();
                for (_, sb) in store.list_as::<Sandbox>(&Filter::kind("sandbox")).unwrap() {
                    if sb.node.as_ref() == Some(&node_entity.id) && sb.status.holds_resources() {
                        used = used.add(&sb.spec.resources);
                    }
                }
                assert!(
                    node.capacity.fits(&used),
                    "seed {seed}: {} over-committed: {used:?} > {:?}",
                    node_entity.id,
                    node.capacity
                );
            }
        }
    }
}
