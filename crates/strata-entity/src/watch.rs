//! Watch streams: an initial snapshot followed by live changes.
//!
//! The store publishes committed changes to the hub while still holding its
//! commit gate, so a stream registered under that gate sees every change
//! after its snapshot exactly once and in commit order. A watcher whose
//! buffer fills up is disconnected rather than skipped; the consumer sees
//! the stream end and must re-watch (and so re-snapshot).

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::entity::{Entity, EntityId, Revision};
use crate::kind::Filter;

/// What happened to an entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    Put,
    Delete,
}

/// One delivered change. For deletes, `entity` holds the last stored
/// attributes and the tombstone revision.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WatchEvent {
    pub change: ChangeKind,
    pub entity: Entity,
}

impl WatchEvent {
    pub fn revision(&self) -> Revision {
        self.entity.revision
    }

    pub fn is_delete(&self) -> bool {
        self.change == ChangeKind::Delete
    }
}

/// A committed change plus the state it replaced.
pub(crate) struct Committed {
    pub(crate) event: WatchEvent,
    pub(crate) previous: Option<Entity>,
}

impl Committed {
    /// A watcher is told about a change if its filter matched the entity
    /// before or after the write, so it also learns when entities leave.
    fn concerns(&self, filter: &Filter) -> bool {
        filter.matches(&self.event.entity)
            || self.previous.as_ref().is_some_and(|p| filter.matches(p))
    }
}

struct Watcher {
    id: u64,
    filter: Filter,
    tx: mpsc::Sender<WatchEvent>,
}

/// Fan-out of committed changes to registered watchers.
pub(crate) struct WatchHub {
    next_id: u64,
    watchers: Vec<Watcher>,
}

impl WatchHub {
    pub(crate) fn new() -> Self {
        Self {
            next_id: 0,
            watchers: Vec::new(),
        }
    }

    pub(crate) fn register(&mut self, filter: Filter, buffer: usize) -> mpsc::Receiver<WatchEvent> {
        let (tx, rx) = mpsc::channel(buffer.max(1));
        self.next_id += 1;
        debug!(watcher = self.next_id, ?filter, "watcher registered");
        self.watchers.push(Watcher {
            id: self.next_id,
            filter,
            tx,
        });
        rx
    }

    /// Deliver committed events, dropping closed or overflowing watchers.
    pub(crate) fn publish(&mut self, committed: &[Committed]) {
        self.watchers.retain(|w| {
            for c in committed.iter().filter(|c| c.concerns(&w.filter)) {
                match w.tx.try_send(c.event.clone()) {
                    Ok(()) => {}
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        warn!(watcher = w.id, "watcher fell behind, disconnecting");
                        return false;
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => {
                        debug!(watcher = w.id, "watcher closed");
                        return false;
                    }
                }
            }
            true
        });
    }

    pub(crate) fn watcher_count(&self) -> usize {
        self.watchers.len()
    }
}

/// A restartable change stream. Dropping it cancels the watch.
pub struct WatchStream {
    snapshot: VecDeque<WatchEvent>,
    snapshot_len: usize,
    rx: mpsc::Receiver<WatchEvent>,
}

impl WatchStream {
    pub(crate) fn new(snapshot: Vec<WatchEvent>, rx: mpsc::Receiver<WatchEvent>) -> Self {
        Self {
            snapshot_len: snapshot.len(),
            snapshot: snapshot.into(),
            rx,
        }
    }

    /// Number of entities in the initial snapshot.
    pub fn snapshot_len(&self) -> usize {
        self.snapshot_len
    }

    /// Ids in the snapshot not yet received. Read it before the first
    /// `recv` to see the whole snapshot.
    pub fn snapshot_ids(&self) -> impl Iterator<Item = &EntityId> {
        self.snapshot.iter().map(|e| &e.entity.id)
    }

    /// Next event. Snapshot entries come first as `Put` events. Returns
    /// `None` once the stream is disconnected.
    pub async fn recv(&mut self) -> Option<WatchEvent> {
        if let Some(event) = self.snapshot.pop_front() {
            return Some(event);
        }
        self.rx.recv().await
    }

    /// Non-blocking variant of [`recv`](Self::recv).
    pub fn try_recv(&mut self) -> Option<WatchEvent> {
        if let Some(event) = self.snapshot.pop_front() {
            return Some(event);
        }
        self.rx.try_recv().ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(id: &str, revision: Revision) -> WatchEvent {
        let mut entity = Entity::new(EntityId::parse(id).unwrap());
        entity.revision = revision;
        WatchEvent {
            change: ChangeKind::Put,
            entity,
        }
    }

    fn committed(id: &str, revision: Revision) -> Committed {
        Committed {
            event: event(id, revision),
            previous: None,
        }
    }

    #[tokio::test]
    async fn hub_filters_events_per_watcher() {
        let mut hub = WatchHub::new();
        let mut sandboxes = hub.register(Filter::kind("sandbox"), 8);
        let mut nodes = hub.register(Filter::kind("node"), 8);

        hub.publish(&[committed("sandbox/a", 1), committed("node/n1", 1)]);

        assert_eq!(sandboxes.recv().await.unwrap().entity.id.as_str(), "sandbox/a");
        assert_eq!(nodes.recv().await.unwrap().entity.id.as_str(), "node/n1");
        assert!(sandboxes.try_recv().is_err());
    }

    #[tokio::test]
    async fn overflowing_watcher_is_disconnected_not_skipped() {
        let mut hub = WatchHub::new();
        let mut rx = hub.register(Filter::All, 2);

        hub.publish(&[committed("sandbox/a", 1), committed("sandbox/a", 2)]);
        hub.publish(&[committed("sandbox/a", 3)]);
        assert_eq!(hub.watcher_count(), 0);

        // The buffered prefix is still delivered, then the stream ends.
        assert_eq!(rx.recv().await.unwrap().revision(), 1);
        assert_eq!(rx.recv().await.unwrap().revision(), 2);
        assert!(rx.recv().await.is_none());
    }

    #[test]
    fn dropped_receivers_are_pruned() {
        let mut hub = WatchHub::new();
        let rx = hub.register(Filter::All, 4);
        drop(rx);
        hub.publish(&[committed("sandbox/a", 1)]);
        assert_eq!(hub.watcher_count(), 0);
    }

    #[tokio::test]
    async fn stream_yields_snapshot_before_live_events() {
        let (tx, rx) = mpsc::channel(4);
        let mut stream = WatchStream::new(vec![event("app/a", 3)], rx);
        tx.send(event("app/a", 4)).await.unwrap();

        assert_eq!(stream.snapshot_len(), 1);
        let ids: Vec<_> = stream.snapshot_ids().map(|id| id.as_str()).collect();
        assert_eq!(ids, ["app/a"]);
        assert_eq!(stream.recv().await.unwrap().revision(), 3);
        assert_eq!(stream.recv().await.unwrap().revision(), 4);
    }
}
