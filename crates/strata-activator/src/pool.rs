//! Per-version window pools.
//!
//! A pool is an in-memory view built from sandbox watch events: one
//! [`Window`] per RUNNING sandbox of the version, plus the cold starts still
//! in flight. Nothing here touches the store; the activator feeds events in
//! and acts on what the pool decides.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;

use strata_entity::schema::AppVersion;
use strata_entity::{EntityId, Revision};

use crate::strategy::Strategy;

/// One warm sandbox's availability to serve requests.
#[derive(Debug, Clone)]
pub struct Window {
    pub sandbox: EntityId,
    /// Last revision of the sandbox seen by the pool.
    pub revision: Revision,
    pub url: String,
    pub used_slots: u32,
    pub max_slots: u32,
    /// Outstanding leases, tracked in every mode.
    pub leases: u32,
    pub last_active: Instant,
}

impl Window {
    pub fn is_idle(&self) -> bool {
        self.leases == 0
    }
}

/// A cold start created by the activator that is not RUNNING yet.
#[derive(Debug, Clone)]
pub struct PendingStart {
    pub sandbox: EntityId,
    pub created: Instant,
}

/// Counts shown by the status view.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    pub total: usize,
    pub leased: usize,
    pub idle: usize,
    pub pending: usize,
}

impl PoolStats {
    pub fn merge(&mut self, other: PoolStats) {
        self.total += other.total;
        self.leased += other.leased;
        self.idle += other.idle;
        self.pending += other.pending;
    }
}

/// What a successful lease handed out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Granted {
    pub sandbox: EntityId,
    pub url: String,
    pub size: u32,
}

/// Delay before the next cold start after `crashes` quick crashes in a row.
pub fn crash_backoff(crashes: u32, base: Duration, max: Duration) -> Duration {
    if crashes == 0 {
        return Duration::ZERO;
    }
    let factor = 1u32.checked_shl(crashes - 1).unwrap_or(u32::MAX);
    base.checked_mul(factor).unwrap_or(max).min(max)
}

/// Windows and in-flight starts for one app version.
#[derive(Debug)]
pub struct VersionPool {
    pub version: EntityId,
    pub spec: AppVersion,
    pub strategy: Strategy,
    windows: Vec<Window>,
    pending: Vec<PendingStart>,
    /// Sandboxes taken out by the idle sweep, with the revision it saw.
    retiring: HashMap<EntityId, Revision>,
    cursor: usize,
    crashes: u32,
    crash_until: Option<Instant>,
}

impl VersionPool {
    pub fn new(version: EntityId, spec: AppVersion, strategy: Strategy) -> Self {
        Self {
            version,
            spec,
            strategy,
            windows: Vec::new(),
            pending: Vec::new(),
            retiring: HashMap::new(),
            cursor: 0,
            crashes: 0,
            crash_until: None,
        }
    }

    pub fn app(&self) -> &EntityId {
        &self.spec.app
    }

    pub fn windows(&self) -> &[Window] {
        &self.windows
    }

    pub fn pending(&self) -> &[PendingStart] {
        &self.pending
    }

    /// Windows plus in-flight starts, compared against `max_instances`.
    pub fn instance_count(&self) -> usize {
        self.windows.len() + self.pending.len()
    }

    /// Whether `max_instances` leaves room for one more start.
    pub fn below_max(&self) -> bool {
        self.spec.max_instances == 0 || self.instance_count() < self.spec.max_instances as usize
    }

    /// Windows the version should keep warm.
    pub fn min_windows(&self) -> usize {
        self.spec
            .min_instances
            .max(self.strategy.desired_instances()) as usize
    }

    // ── Request path ───────────────────────────────────────────────

    /// Lease a window with spare capacity, rotating the starting point.
    pub fn lease(&mut self, now: Instant) -> Option<Granted> {
        let count = self.windows.len();
        let size = self.strategy.lease_size();
        for i in 0..count {
            let idx = (self.cursor + i) % count;
            let window = &mut self.windows[idx];
            if self.strategy.has_capacity(window.used_slots, window.max_slots) {
                // Fixed windows take any number of leases; only auto counts slots.
                if matches!(self.strategy, Strategy::Auto { .. }) {
                    window.used_slots += size;
                }
                window.leases += 1;
                window.last_active = now;
                self.cursor = idx + 1;
                return Some(Granted {
                    sandbox: window.sandbox.clone(),
                    url: window.url.clone(),
                    size,
                });
            }
        }
        None
    }

    /// Return a lease's slots. `false` when the window is gone.
    pub fn release(&mut self, sandbox: &EntityId, size: u32, now: Instant) -> bool {
        let strategy = self.strategy;
        match self.windows.iter_mut().find(|w| w.sandbox == *sandbox) {
            Some(window) => {
                if matches!(strategy, Strategy::Auto { .. }) {
                    window.used_slots = window.used_slots.saturating_sub(size);
                }
                window.leases = window.leases.saturating_sub(1);
                window.last_active = now;
                true
            }
            None => false,
        }
    }

    /// Mark a leased window active. `false` when the window is gone.
    pub fn renew(&mut self, sandbox: &EntityId, now: Instant) -> bool {
        match self.windows.iter_mut().find(|w| w.sandbox == *sandbox) {
            Some(window) => {
                window.last_active = now;
                true
            }
            None => false,
        }
    }

    // ── Cold starts ────────────────────────────────────────────────

    /// Remaining crash backoff, if cold starts are refused right now.
    pub fn crash_backoff_remaining(&self, now: Instant) -> Option<Duration> {
        self.crash_until
            .filter(|until| *until > now)
            .map(|until| until - now)
    }

    pub fn crashes(&self) -> u32 {
        self.crashes
    }

    pub fn add_pending(&mut self, sandbox: EntityId, created: Instant) {
        if !self.pending.iter().any(|p| p.sandbox == sandbox)
            && !self.windows.iter().any(|w| w.sandbox == sandbox)
        {
            self.pending.push(PendingStart { sandbox, created });
        }
    }

    /// Record a quick crash and extend the backoff.
    pub fn record_crash(&mut self, now: Instant, base: Duration, max: Duration) -> Duration {
        self.crashes = self.crashes.saturating_add(1);
        let delay = crash_backoff(self.crashes, base, max);
        self.crash_until = Some(now + delay);
        delay
    }

    // ── Watch events ───────────────────────────────────────────────

    /// A sandbox of this version is RUNNING at `url`.
    /// Returns `true` when a window was added.
    pub fn observe_running(
        &mut self,
        sandbox: &EntityId,
        revision: Revision,
        url: String,
        now: Instant,
    ) -> bool {
        if let Some(seen) = self.retiring.get(sandbox) {
            if revision <= *seen {
                return false;
            }
            self.retiring.remove(sandbox);
        }
        self.pending.retain(|p| p.sandbox != *sandbox);
        self.crashes = 0;
        self.crash_until = None;

        if let Some(window) = self.windows.iter_mut().find(|w| w.sandbox == *sandbox) {
            if revision > window.revision {
                window.revision = revision;
                window.url = url;
            }
            return false;
        }
        self.windows.push(Window {
            sandbox: sandbox.clone(),
            revision,
            url,
            used_slots: 0,
            max_slots: self.strategy.max_slots(),
            leases: 0,
            last_active: now,
        });
        true
    }

    /// A sandbox stopped (failed, terminated or deleted). Returns the
    /// in-flight start it completed, if it was one.
    pub fn observe_gone(&mut self, sandbox: &EntityId) -> Option<PendingStart> {
        self.windows.retain(|w| w.sandbox != *sandbox);
        self.retiring.remove(sandbox);
        let idx = self.pending.iter().position(|p| p.sandbox == *sandbox)?;
        Some(self.pending.remove(idx))
    }

    // ── Idle sweep ─────────────────────────────────────────────────

    /// Take idle windows due for retirement out of the pool. `inactive`
    /// retires every idle window regardless of delay or minimum.
    pub fn take_idle(&mut self, now: Instant, inactive: bool) -> Vec<Window> {
        let keep = if inactive { 0 } else { self.min_windows() };
        let delay = self.strategy.scale_down_delay();
        let mut remaining = self.windows.len();
        let mut taken = Vec::new();

        let mut kept = Vec::with_capacity(self.windows.len());
        for window in self.windows.drain(..) {
            let expired = inactive
                || delay.is_some_and(|d| now.saturating_duration_since(window.last_active) >= d);
            if window.is_idle() && expired && remaining > keep {
                remaining -= 1;
                taken.push(window);
            } else {
                kept.push(window);
            }
        }
        self.windows = kept;
        for window in &taken {
            self.retiring.insert(window.sandbox.clone(), window.revision);
        }
        taken
    }

    /// Put back a window the sweep could not retire.
    pub fn restore(&mut self, mut window: Window, revision: Revision) {
        self.retiring.remove(&window.sandbox);
        if self.windows.iter().any(|w| w.sandbox == window.sandbox) {
            return;
        }
        window.revision = revision;
        self.windows.push(window);
    }

    /// Drop windows, in-flight starts and retirements whose sandbox is not
    /// in `present`. Returns how many entries were dropped.
    pub fn retain_present(&mut self, present: &HashSet<EntityId>) -> usize {
        let before = self.windows.len() + self.pending.len() + self.retiring.len();
        self.windows.retain(|w| present.contains(&w.sandbox));
        self.pending.retain(|p| present.contains(&p.sandbox));
        self.retiring.retain(|id, _| present.contains(id));
        before - (self.windows.len() + self.pending.len() + self.retiring.len())
    }

    /// Nothing running, starting or being retired.
    pub fn is_empty(&self) -> bool {
        self.windows.is_empty() && self.pending.is_empty() && self.retiring.is_empty()
    }

    /// Forget a retired sandbox.
    pub fn retired(&mut self, sandbox: &EntityId) {
        self.retiring.remove(sandbox);
    }

    pub fn stats(&self) -> PoolStats {
        let leased = self.windows.iter().filter(|w| !w.is_idle()).count();
        PoolStats {
            total: self.windows.len(),
            leased,
            idle: self.windows.len() - leased,
            pending: self.pending.len(),
        }
    }
}
