//! EntityStore — redb-backed entity persistence with optimistic concurrency.
//!
//! Every write runs in one redb write transaction behind a commit gate that
//! also guards the watch hub. That gives three properties the reconcilers
//! lean on:
//!
//! - a conditional write either sees the revision it expects or fails with
//!   `Conflict` and changes nothing
//! - revisions per id grow by exactly one per successful write, including
//!   across delete and re-create
//! - watchers observe changes in commit order with no gaps after their
//!   snapshot

use std::collections::BTreeSet;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};

use redb::{Database, ReadableDatabase, ReadableTable, Table};
use tracing::{debug, info, warn};

use crate::entity::{now_millis, Entity, EntityId, Revision};
use crate::error::{EntityError, EntityResult};
use crate::kind::{Filter, KindDescriptor, KIND_ATTR};
use crate::schema::{builtin_kinds, Schema};
use crate::tables::*;
use crate::value::Value;
use crate::watch::{ChangeKind, Committed, WatchEvent, WatchHub, WatchStream};

/// Convert any `Display` error into an `EntityError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| EntityError::$variant(e.to_string())
    };
}

/// Default per-watcher buffer before a slow watcher is disconnected.
pub const DEFAULT_WATCH_BUFFER: usize = 1024;

/// One conditional write inside [`EntityStore::apply`].
#[derive(Debug, Clone)]
pub enum WriteOp {
    Put {
        entity: Entity,
        expected: Option<Revision>,
    },
    Delete {
        id: EntityId,
        expected: Option<Revision>,
    },
}

/// Thread-safe entity store backed by redb.
#[derive(Clone)]
pub struct EntityStore {
    db: Arc<Database>,
    /// Watch fan-out. Its lock is also the commit gate.
    hub: Arc<Mutex<WatchHub>>,
    /// Attribute keys maintained in the secondary index.
    indexed: Arc<RwLock<BTreeSet<String>>>,
    watch_buffer: usize,
}

impl EntityStore {
    /// Open (or create) a persistent entity store at the given path.
    pub fn open(path: &Path) -> EntityResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self::from_database(db)?;
        debug!(?path, "entity store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory entity store (for testing).
    pub fn open_in_memory() -> EntityResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self::from_database(db)?;
        debug!("in-memory entity store opened");
        Ok(store)
    }

    fn from_database(db: Database) -> EntityResult<Self> {
        let store = Self {
            db: Arc::new(db),
            hub: Arc::new(Mutex::new(WatchHub::new())),
            indexed: Arc::new(RwLock::new(BTreeSet::new())),
            watch_buffer: DEFAULT_WATCH_BUFFER,
        };
        store.ensure_tables()?;
        for kind in store.list_kinds()? {
            store.write_indexed().extend(kind.indexed);
        }
        for kind in builtin_kinds() {
            store.register_kind(&kind)?;
        }
        Ok(store)
    }

    /// Set the per-watcher buffer size for watches opened afterwards.
    pub fn with_watch_buffer(mut self, buffer: usize) -> Self {
        self.watch_buffer = buffer.max(1);
        self
    }

    /// Create all tables if they don't exist yet.
    fn ensure_tables(&self) -> EntityResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Unavailable))?;
        txn.open_table(ENTITIES).map_err(map_err!(Unavailable))?;
        txn.open_table(REVISIONS).map_err(map_err!(Unavailable))?;
        txn.open_table(INDEX).map_err(map_err!(Unavailable))?;
        txn.open_table(KINDS).map_err(map_err!(Unavailable))?;
        txn.commit().map_err(map_err!(Unavailable))?;
        Ok(())
    }

    fn lock_hub(&self) -> MutexGuard<'_, WatchHub> {
        self.hub.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn read_indexed(&self) -> BTreeSet<String> {
        self.indexed
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn write_indexed(&self) -> std::sync::RwLockWriteGuard<'_, BTreeSet<String>> {
        self.indexed.write().unwrap_or_else(PoisonError::into_inner)
    }

    // ── Kinds ──────────────────────────────────────────────────────

    /// Register (or extend) a kind. Newly indexed attributes are
    /// backfilled for entities already stored.
    pub fn register_kind(&self, desc: &KindDescriptor) -> EntityResult<()> {
        let _gate = self.lock_hub();
        let known = self.read_indexed();

        let txn = self.db.begin_write().map_err(map_err!(Unavailable))?;
        let added: Vec<String> = {
            let mut kinds = txn.open_table(KINDS).map_err(map_err!(Unavailable))?;
            let mut merged = match kinds.get(desc.name.as_str()).map_err(map_err!(Unavailable))? {
                Some(guard) => serde_json::from_slice::<KindDescriptor>(guard.value())
                    .map_err(map_err!(Deserialize))?,
                None => KindDescriptor::new(&desc.name, &[]),
            };
            for key in &desc.indexed {
                if !merged.indexed.contains(key) {
                    merged.indexed.push(key.clone());
                }
            }
            let value = serde_json::to_vec(&merged).map_err(map_err!(Serialize))?;
            kinds
                .insert(desc.name.as_str(), value.as_slice())
                .map_err(map_err!(Unavailable))?;

            let added: Vec<String> = desc
                .indexed
                .iter()
                .filter(|k| !known.contains(*k))
                .cloned()
                .collect();

            if !added.is_empty() {
                let entities = txn.open_table(ENTITIES).map_err(map_err!(Unavailable))?;
                let mut index = txn.open_table(INDEX).map_err(map_err!(Unavailable))?;
                let prefix = index_prefix(KIND_ATTR, &Value::keyword(&desc.name).index_key());
                for id in index_ids(&index, &prefix)? {
                    if let Some(entity) = read_entity(&entities, &id)? {
                        for attr in entity.attrs.iter().filter(|a| added.contains(&a.key)) {
                            let key = index_key(&attr.key, &attr.value.index_key(), &id);
                            index.insert(key.as_str(), ()).map_err(map_err!(Unavailable))?;
                        }
                    }
                }
            }
            added
        };
        txn.commit().map_err(map_err!(Unavailable))?;

        if !added.is_empty() {
            info!(kind = %desc.name, ?added, "kind index extended");
        }
        self.write_indexed().extend(added);
        Ok(())
    }

    /// Resolve a kind name to its descriptor.
    pub fn lookup_kind(&self, name: &str) -> EntityResult<KindDescriptor> {
        let txn = self.db.begin_read().map_err(map_err!(Unavailable))?;
        let kinds = txn.open_table(KINDS).map_err(map_err!(Unavailable))?;
        match kinds.get(name).map_err(map_err!(Unavailable))? {
            Some(guard) => serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize)),
            None => Err(EntityError::NotFound(format!("kind {name}"))),
        }
    }

    /// All registered kinds.
    pub fn list_kinds(&self) -> EntityResult<Vec<KindDescriptor>> {
        let txn = self.db.begin_read().map_err(map_err!(Unavailable))?;
        let kinds = txn.open_table(KINDS).map_err(map_err!(Unavailable))?;
        let mut results = Vec::new();
        for entry in kinds.iter().map_err(map_err!(Unavailable))? {
            let (_, value) = entry.map_err(map_err!(Unavailable))?;
            results.push(serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?);
        }
        Ok(results)
    }

    // ── Reads ──────────────────────────────────────────────────────

    /// Get an entity by id.
    pub fn get(&self, id: &EntityId) -> EntityResult<Entity> {
        self.try_get(id)?
            .ok_or_else(|| EntityError::NotFound(id.to_string()))
    }

    /// Get an entity by id, `None` when absent.
    pub fn try_get(&self, id: &EntityId) -> EntityResult<Option<Entity>> {
        let txn = self.db.begin_read().map_err(map_err!(Unavailable))?;
        let entities = txn.open_table(ENTITIES).map_err(map_err!(Unavailable))?;
        read_entity(&entities, id.as_str())
    }

    /// Get an entity and decode its typed view.
    pub fn get_as<T: Schema>(&self, id: &EntityId) -> EntityResult<(Entity, T)> {
        let entity = self.get(id)?;
        let value = entity.decode()?;
        Ok((entity, value))
    }

    /// List entities matching a filter. Order is unspecified.
    pub fn list(&self, filter: &Filter) -> EntityResult<Vec<Entity>> {
        let indexed = self.read_indexed();
        let txn = self.db.begin_read().map_err(map_err!(Unavailable))?;
        let entities = txn.open_table(ENTITIES).map_err(map_err!(Unavailable))?;
        let index = txn.open_table(INDEX).map_err(map_err!(Unavailable))?;
        scan(&entities, &index, &indexed, filter)
    }

    /// List and decode entities of one schema, skipping records that fail
    /// to decode.
    pub fn list_as<T: Schema>(&self, filter: &Filter) -> EntityResult<Vec<(Entity, T)>> {
        let mut out = Vec::new();
        for entity in self.list(filter)? {
            match entity.decode::<T>() {
                Ok(value) => out.push((entity, value)),
                Err(e) => warn!(id = %entity.id, error = %e, "skipping undecodable entity"),
            }
        }
        Ok(out)
    }

    // ── Writes ─────────────────────────────────────────────────────

    /// Write an entity. With `expected`, the write only succeeds when the
    /// stored revision equals it (`Some(0)` means "must not exist").
    /// Returns the new revision.
    pub fn put(&self, entity: &Entity, expected: Option<Revision>) -> EntityResult<Revision> {
        let revisions = self.apply(vec![WriteOp::Put {
            entity: entity.clone(),
            expected,
        }])?;
        Ok(revisions[0])
    }

    /// Create an entity that must not exist yet.
    pub fn create(&self, entity: &Entity) -> EntityResult<Revision> {
        self.put(entity, Some(0))
    }

    /// Delete an entity. Returns the tombstone revision.
    pub fn delete(&self, id: &EntityId, expected: Option<Revision>) -> EntityResult<Revision> {
        let revisions = self.apply(vec![WriteOp::Delete {
            id: id.clone(),
            expected,
        }])?;
        Ok(revisions[0])
    }

    /// Apply several conditional writes atomically: all commit or none do.
    /// Later ops observe the effects of earlier ones.
    pub fn apply(&self, ops: Vec<WriteOp>) -> EntityResult<Vec<Revision>> {
        let mut hub = self.lock_hub();
        let indexed = self.read_indexed();
        let now = now_millis();

        let txn = self.db.begin_write().map_err(map_err!(Unavailable))?;
        let mut committed = Vec::with_capacity(ops.len());
        {
            let mut tables = WriteTables {
                entities: txn.open_table(ENTITIES).map_err(map_err!(Unavailable))?,
                revisions: txn.open_table(REVISIONS).map_err(map_err!(Unavailable))?,
                index: txn.open_table(INDEX).map_err(map_err!(Unavailable))?,
            };
            for op in ops {
                committed.push(tables.apply(op, &indexed, now)?);
            }
        }
        txn.commit().map_err(map_err!(Unavailable))?;

        for c in &committed {
            debug!(
                id = %c.event.entity.id,
                revision = c.event.revision(),
                change = ?c.event.change,
                "entity committed"
            );
        }
        hub.publish(&committed);
        Ok(committed.iter().map(|c| c.event.revision()).collect())
    }

    // ── Watch ──────────────────────────────────────────────────────

    /// Open a watch: a snapshot of every matching entity followed by every
    /// later change that matches the filter before or after the write.
    pub fn watch(&self, filter: Filter) -> EntityResult<WatchStream> {
        let mut hub = self.lock_hub();
        let snapshot: Vec<WatchEvent> = self
            .list(&filter)?
            .into_iter()
            .map(|entity| WatchEvent {
                change: ChangeKind::Put,
                entity,
            })
            .collect();
        let rx = hub.register(filter, self.watch_buffer);
        Ok(WatchStream::new(snapshot, rx))
    }

    /// Number of live watchers (diagnostics).
    pub fn watcher_count(&self) -> usize {
        self.lock_hub().watcher_count()
    }
}

// ── Transaction helpers ────────────────────────────────────────────

struct WriteTables<'txn> {
    entities: Table<'txn, &'static str, &'static [u8]>,
    revisions: Table<'txn, &'static str, u64>,
    index: Table<'txn, &'static str, ()>,
}

impl WriteTables<'_> {
    fn apply(
        &mut self,
        op: WriteOp,
        indexed: &BTreeSet<String>,
        now: u64,
    ) -> EntityResult<Committed> {
        match op {
            WriteOp::Put { entity, expected } => self.put(entity, expected, indexed, now),
            WriteOp::Delete { id, expected } => self.delete(&id, expected, indexed, now),
        }
    }

    fn next_revision(&self, key: &str) -> EntityResult<Revision> {
        let last = self
            .revisions
            .get(key)
            .map_err(map_err!(Unavailable))?
            .map(|g| g.value())
            .unwrap_or(0);
        Ok(last + 1)
    }

    fn put(
        &mut self,
        mut entity: Entity,
        expected: Option<Revision>,
        indexed: &BTreeSet<String>,
        now: u64,
    ) -> EntityResult<Committed> {
        if entity.kind != entity.id.kind() {
            return Err(EntityError::KindMismatch {
                id: entity.id.to_string(),
                expected: entity.id.kind().to_string(),
                actual: entity.kind,
            });
        }
        let key = entity.id.as_str().to_string();
        let current = read_entity(&self.entities, &key)?;
        let actual = current.as_ref().map(|e| e.revision).unwrap_or(0);
        check_expected(&key, expected, actual)?;

        entity.revision = self.next_revision(&key)?;
        entity.created_at = current.as_ref().map(|c| c.created_at).unwrap_or(now);
        entity.updated_at = now;

        if let Some(old) = &current {
            self.unindex(old, indexed)?;
        }
        self.index_entity(&entity, indexed)?;

        let value = serde_json::to_vec(&entity).map_err(map_err!(Serialize))?;
        self.entities
            .insert(key.as_str(), value.as_slice())
            .map_err(map_err!(Unavailable))?;
        self.revisions
            .insert(key.as_str(), entity.revision)
            .map_err(map_err!(Unavailable))?;

        Ok(Committed {
            event: WatchEvent {
                change: ChangeKind::Put,
                entity,
            },
            previous: current,
        })
    }

    fn delete(
        &mut self,
        id: &EntityId,
        expected: Option<Revision>,
        indexed: &BTreeSet<String>,
        now: u64,
    ) -> EntityResult<Committed> {
        let key = id.as_str();
        let current = read_entity(&self.entities, key)?
            .ok_or_else(|| EntityError::NotFound(key.to_string()))?;
        check_expected(key, expected, current.revision)?;

        let revision = self.next_revision(key)?;
        self.unindex(&current, indexed)?;
        self.entities.remove(key).map_err(map_err!(Unavailable))?;
        self.revisions
            .insert(key, revision)
            .map_err(map_err!(Unavailable))?;

        let mut tombstone = current.clone();
        tombstone.revision = revision;
        tombstone.updated_at = now;
        Ok(Committed {
            event: WatchEvent {
                change: ChangeKind::Delete,
                entity: tombstone,
            },
            previous: Some(current),
        })
    }

    fn index_entity(&mut self, entity: &Entity, indexed: &BTreeSet<String>) -> EntityResult<()> {
        for key in index_keys(entity, indexed) {
            self.index.insert(key.as_str(), ()).map_err(map_err!(Unavailable))?;
        }
        Ok(())
    }

    fn unindex(&mut self, entity: &Entity, indexed: &BTreeSet<String>) -> EntityResult<()> {
        for key in index_keys(entity, indexed) {
            self.index.remove(key.as_str()).map_err(map_err!(Unavailable))?;
        }
        Ok(())
    }
}

fn check_expected(id: &str, expected: Option<Revision>, actual: Revision) -> EntityResult<()> {
    match expected {
        Some(expected) if expected != actual => Err(EntityError::Conflict {
            id: id.to_string(),
            expected,
            actual,
        }),
        _ => Ok(()),
    }
}

fn index_keys(entity: &Entity, indexed: &BTreeSet<String>) -> Vec<String> {
    let id = entity.id.as_str();
    let mut keys = vec![index_key(
        KIND_ATTR,
        &Value::keyword(&entity.kind).index_key(),
        id,
    )];
    keys.extend(
        entity
            .attrs
            .iter()
            .filter(|a| indexed.contains(&a.key))
            .map(|a| index_key(&a.key, &a.value.index_key(), id)),
    );
    keys
}

fn read_entity<T>(table: &T, id: &str) -> EntityResult<Option<Entity>>
where
    T: ReadableTable<&'static str, &'static [u8]>,
{
    match table.get(id).map_err(map_err!(Unavailable))? {
        Some(guard) => {
            let entity: Entity =
                serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
            Ok(Some(entity))
        }
        None => Ok(None),
    }
}

/// Entity ids under an index prefix.
fn index_ids<T>(index: &T, prefix: &str) -> EntityResult<Vec<String>>
where
    T: ReadableTable<&'static str, ()>,
{
    let mut ids = Vec::new();
    for entry in index.range(prefix..).map_err(map_err!(Unavailable))? {
        let (key, _) = entry.map_err(map_err!(Unavailable))?;
        match key.value().strip_prefix(prefix) {
            Some(id) => ids.push(id.to_string()),
            None => break,
        }
    }
    Ok(ids)
}

fn scan<E, I>(
    entities: &E,
    index: &I,
    indexed: &BTreeSet<String>,
    filter: &Filter,
) -> EntityResult<Vec<Entity>>
where
    E: ReadableTable<&'static str, &'static [u8]>,
    I: ReadableTable<&'static str, ()>,
{
    let prefix = match filter {
        Filter::All => {
            let mut results = Vec::new();
            for entry in entities.iter().map_err(map_err!(Unavailable))? {
                let (_, value) = entry.map_err(map_err!(Unavailable))?;
                results.push(serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?);
            }
            return Ok(results);
        }
        Filter::Id(id) => return Ok(read_entity(entities, id.as_str())?.into_iter().collect()),
        Filter::Kind(kind) => index_prefix(KIND_ATTR, &Value::keyword(kind).index_key()),
        Filter::Attr { key, value } => {
            if key != KIND_ATTR && !indexed.contains(key) {
                return Err(EntityError::NotIndexed(key.clone()));
            }
            index_prefix(key, &value.index_key())
        }
    };

    let mut results = Vec::new();
    for id in index_ids(index, &prefix)? {
        if let Some(entity) = read_entity(entities, &id)? {
            results.push(entity);
        }
    }
    Ok(results)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{Node, NodeStatus, Resources, Sandbox, SandboxSpec, SandboxStatus};
    use crate::value::Value;

    fn id(s: &str) -> EntityId {
        EntityId::parse(s).unwrap()
    }

    fn test_sandbox(name: &str, status: SandboxStatus) -> Entity {
        let mut sb = Sandbox::pending(
            id("app/web"),
            id("app_version/web-v1"),
            SandboxSpec {
                resources: Resources::new(1000, 512),
                ..SandboxSpec::default()
            },
        );
        sb.status = status;
        Entity::from_schema(id(&format!("sandbox/{name}")), &sb).unwrap()
    }

    fn test_node(name: &str) -> Entity {
        let node = Node {
            status: NodeStatus::Ready,
            address: "127.0.0.1".to_string(),
            capacity: Resources::new(4000, 4096),
            placements: 0,
            heartbeat_at: 1000,
        };
        Entity::from_schema(id(&format!("node/{name}")), &node).unwrap()
    }

    fn plain(name: &str) -> Entity {
        Entity::new(id(&format!("entity/{name}")))
    }

    // ── Get / Put ──────────────────────────────────────────────────

    #[test]
    fn put_and_get() {
        let store = EntityStore::open_in_memory().unwrap();
        let entity = test_sandbox("s1", SandboxStatus::Pending);

        let rev = store.put(&entity, None).unwrap();
        let stored = store.get(&entity.id).unwrap();

        assert_eq!(rev, 1);
        assert_eq!(stored.revision, 1);
        assert_eq!(stored.attrs, entity.attrs);
        assert!(stored.created_at > 0);
    }

    #[test]
    fn get_nonexistent_is_not_found() {
        let store = EntityStore::open_in_memory().unwrap();
        let err = store.get(&id("sandbox/nope")).unwrap_err();
        assert!(err.is_not_found());
        assert!(store.try_get(&id("sandbox/nope")).unwrap().is_none());
    }

    #[test]
    fn empty_entity_still_exists() {
        let store = EntityStore::open_in_memory().unwrap();
        store.put(&plain("empty"), None).unwrap();
        let stored = store.get(&id("entity/empty")).unwrap();
        assert!(stored.attrs.is_empty());
    }

    #[test]
    fn revision_increments_by_one_per_write() {
        let store = EntityStore::open_in_memory().unwrap();
        let entity = plain("1");
        for expected in 0..5 {
            let rev = store.put(&entity, Some(expected)).unwrap();
            assert_eq!(rev, expected + 1);
        }
        assert_eq!(store.get(&entity.id).unwrap().revision, 5);
    }

    #[test]
    fn stale_expected_revision_conflicts() {
        let store = EntityStore::open_in_memory().unwrap();
        let entity = plain("1");
        store.put(&entity, None).unwrap();
        store.put(&entity, Some(1)).unwrap();

        let err = store.put(&entity, Some(1)).unwrap_err();
        match err {
            EntityError::Conflict {
                expected, actual, ..
            } => {
                assert_eq!(expected, 1);
                assert_eq!(actual, 2);
            }
            other => panic!("expected conflict, got {other}"),
        }
        assert_eq!(store.get(&entity.id).unwrap().revision, 2);
    }

    #[test]
    fn create_conflicts_when_present() {
        let store = EntityStore::open_in_memory().unwrap();
        store.create(&plain("1")).unwrap();
        let err = store.create(&plain("1")).unwrap_err();
        assert!(err.is_conflict());
    }

    #[test]
    fn expected_revision_on_missing_entity_conflicts_with_zero() {
        let store = EntityStore::open_in_memory().unwrap();
        let err = store.put(&plain("1"), Some(3)).unwrap_err();
        assert!(matches!(err, EntityError::Conflict { actual: 0, .. }));
    }

    #[test]
    fn kind_must_match_id_namespace() {
        let store = EntityStore::open_in_memory().unwrap();
        let mut entity = plain("1");
        entity.kind = "sandbox".to_string();
        let err = store.put(&entity, None).unwrap_err();
        assert!(matches!(err, EntityError::KindMismatch { .. }));
    }

    #[test]
    fn concurrent_puts_with_same_expected_revision_race_to_one_winner() {
        let store = EntityStore::open_in_memory().unwrap();
        let entity = plain("1");
        for expected in 0..5 {
            store.put(&entity, Some(expected)).unwrap();
        }

        let handles: Vec<_> = (0..2)
            .map(|_| {
                let store = store.clone();
                let entity = entity.clone();
                std::thread::spawn(move || store.put(&entity, Some(5)))
            })
            .collect();
        let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

        let winners: Vec<_> = results.iter().filter_map(|r| r.as_ref().ok()).collect();
        assert_eq!(winners, vec![&6]);
        let loser = results.iter().find_map(|r| r.as_ref().err()).unwrap();
        assert!(matches!(
            loser,
            EntityError::Conflict {
                expected: 5,
                actual: 6,
                ..
            }
        ));
        assert_eq!(store.get(&entity.id).unwrap().revision, 6);
    }

    // ── Delete ─────────────────────────────────────────────────────

    #[test]
    fn delete_with_matching_revision() {
        let store = EntityStore::open_in_memory().unwrap();
        let entity = plain("1");
        store.put(&entity, None).unwrap();

        let tomb = store.delete(&entity.id, Some(1)).unwrap();
        assert_eq!(tomb, 2);
        assert!(store.get(&entity.id).unwrap_err().is_not_found());
    }

    #[test]
    fn delete_conflict_and_not_found() {
        let store = EntityStore::open_in_memory().unwrap();
        let entity = plain("1");
        store.put(&entity, None).unwrap();

        assert!(store.delete(&entity.id, Some(7)).unwrap_err().is_conflict());
        assert!(store.get(&entity.id).is_ok());
        assert!(store.delete(&id("entity/nope"), None).unwrap_err().is_not_found());
    }

    #[test]
    fn recreated_entity_continues_revision_sequence() {
        let store = EntityStore::open_in_memory().unwrap();
        let entity = plain("1");
        store.put(&entity, None).unwrap();
        store.delete(&entity.id, None).unwrap();

        // Absent again, so create-only succeeds, but the revision keeps growing.
        let rev = store.create(&entity).unwrap();
        assert_eq!(rev, 3);
    }

    // ── Apply ──────────────────────────────────────────────────────

    #[test]
    fn apply_is_all_or_nothing() {
        let store = EntityStore::open_in_memory().unwrap();
        store.put(&plain("a"), None).unwrap();

        let err = store
            .apply(vec![
                WriteOp::Put {
                    entity: plain("a"),
                    expected: Some(1),
                },
                WriteOp::Put {
                    entity: plain("b"),
                    expected: Some(4),
                },
            ])
            .unwrap_err();
        assert!(err.is_conflict());
        assert_eq!(store.get(&id("entity/a")).unwrap().revision, 1);
        assert!(store.try_get(&id("entity/b")).unwrap().is_none());

        let revs = store
            .apply(vec![
                WriteOp::Put {
                    entity: plain("a"),
                    expected: Some(1),
                },
                WriteOp::Put {
                    entity: plain("b"),
                    expected: Some(0),
                },
            ])
            .unwrap();
        assert_eq!(revs, vec![2, 1]);
    }

    // ── List / index ───────────────────────────────────────────────

    #[test]
    fn list_by_kind() {
        let store = EntityStore::open_in_memory().unwrap();
        store.put(&test_sandbox("s1", SandboxStatus::Pending), None).unwrap();
        store.put(&test_sandbox("s2", SandboxStatus::Running), None).unwrap();
        store.put(&test_node("n1"), None).unwrap();

        assert_eq!(store.list(&Filter::kind("sandbox")).unwrap().len(), 2);
        assert_eq!(store.list(&Filter::kind("node")).unwrap().len(), 1);
        assert!(store.list(&Filter::kind("app")).unwrap().is_empty());
        assert_eq!(store.list(&Filter::All).unwrap().len(), 3);
    }

    #[test]
    fn list_by_indexed_attribute_tracks_updates() {
        let store = EntityStore::open_in_memory().unwrap();
        let mut entity = test_sandbox("s1", SandboxStatus::Pending);
        store.put(&entity, None).unwrap();
        store.put(&test_sandbox("s2", SandboxStatus::Pending), None).unwrap();

        let pending = Filter::attr("sandbox.status", SandboxStatus::Pending.keyword());
        assert_eq!(store.list(&pending).unwrap().len(), 2);

        entity
            .attrs
            .set("sandbox.status", SandboxStatus::Running.keyword());
        store.put(&entity, Some(1)).unwrap();

        let still_pending = store.list(&pending).unwrap();
        assert_eq!(still_pending.len(), 1);
        assert_eq!(still_pending[0].id.as_str(), "sandbox/s2");

        store.delete(&id("sandbox/s2"), None).unwrap();
        assert!(store.list(&pending).unwrap().is_empty());
    }

    #[test]
    fn list_refuses_unindexed_attribute() {
        let store = EntityStore::open_in_memory().unwrap();
        let err = store
            .list(&Filter::attr("sandbox.command", Value::string("node")))
            .unwrap_err();
        assert!(matches!(err, EntityError::NotIndexed(_)));
    }

    #[test]
    fn list_as_decodes_typed_values() {
        let store = EntityStore::open_in_memory().unwrap();
        store.put(&test_node("n1"), None).unwrap();
        let nodes = store.list_as::<Node>(&Filter::kind("node")).unwrap();
        assert_eq!(nodes.len(), 1);
        assert_eq!(nodes[0].1.capacity, Resources::new(4000, 4096));
    }

    #[test]
    fn lookup_builtin_kind() {
        let store = EntityStore::open_in_memory().unwrap();
        let kind = store.lookup_kind("sandbox").unwrap();
        assert_eq!(kind.filter(), Filter::kind("sandbox"));
        assert!(kind.indexed.contains(&"sandbox.status".to_string()));
        assert!(store.lookup_kind("nope").unwrap_err().is_not_found());
    }

    #[test]
    fn registering_a_kind_backfills_its_index() {
        let store = EntityStore::open_in_memory().unwrap();
        let mut widget = Entity::new(id("widget/w1"));
        widget.attrs.set("widget.color", Value::keyword("red"));
        store.put(&widget, None).unwrap();

        let red = Filter::attr("widget.color", Value::keyword("red"));
        assert!(store.list(&red).is_err());

        store
            .register_kind(&KindDescriptor::new("widget", &["widget.color"]))
            .unwrap();
        assert_eq!(store.list(&red).unwrap().len(), 1);
        assert_eq!(store.lookup_kind("widget").unwrap().indexed, vec!["widget.color"]);
    }

    // ── Watch ──────────────────────────────────────────────────────

    #[tokio::test]
    async fn watch_delivers_snapshot_then_changes() {
        let store = EntityStore::open_in_memory().unwrap();
        store.put(&test_sandbox("s1", SandboxStatus::Pending), None).unwrap();

        let mut stream = store.watch(Filter::kind("sandbox")).unwrap();
        assert_eq!(stream.snapshot_len(), 1);

        store.put(&test_sandbox("s2", SandboxStatus::Pending), None).unwrap();
        store.put(&test_node("n1"), None).unwrap();

        let first = stream.recv().await.unwrap();
        assert_eq!(first.entity.id.as_str(), "sandbox/s1");
        let second = stream.recv().await.unwrap();
        assert_eq!(second.entity.id.as_str(), "sandbox/s2");
        assert!(stream.try_recv().is_none());
    }

    #[tokio::test]
    async fn watcher_sees_every_revision_in_order() {
        let store = EntityStore::open_in_memory().unwrap();
        let entity = plain("1");
        let mut stream = store.watch(Filter::Id(entity.id.clone())).unwrap();

        for _ in 0..3 {
            store.put(&entity, None).unwrap();
        }
        store.delete(&entity.id, None).unwrap();
        store.put(&entity, None).unwrap();

        let mut seen = Vec::new();
        while let Some(event) = stream.try_recv() {
            seen.push((event.change, event.revision()));
        }
        assert_eq!(
            seen,
            vec![
                (ChangeKind::Put, 1),
                (ChangeKind::Put, 2),
                (ChangeKind::Put, 3),
                (ChangeKind::Delete, 4),
                (ChangeKind::Put, 5),
            ]
        );
    }

    #[tokio::test]
    async fn attribute_watch_sees_entities_leave_the_filter() {
        let store = EntityStore::open_in_memory().unwrap();
        let mut entity = test_sandbox("s1", SandboxStatus::Pending);
        store.put(&entity, None).unwrap();

        let pending = Filter::attr("sandbox.status", SandboxStatus::Pending.keyword());
        let mut stream = store.watch(pending).unwrap();
        assert_eq!(stream.recv().await.unwrap().revision(), 1);

        entity
            .attrs
            .set("sandbox.status", SandboxStatus::Scheduled.keyword());
        store.put(&entity, Some(1)).unwrap();

        let left = stream.recv().await.unwrap();
        assert_eq!(left.revision(), 2);
        assert_eq!(
            left.entity.decode::<Sandbox>().unwrap().status,
            SandboxStatus::Scheduled
        );
    }

    #[tokio::test]
    async fn dropping_a_stream_unregisters_the_watcher() {
        let store = EntityStore::open_in_memory().unwrap();
        let stream = store.watch(Filter::All).unwrap();
        assert_eq!(store.watcher_count(), 1);
        drop(stream);

        store.put(&plain("1"), None).unwrap();
        assert_eq!(store.watcher_count(), 0);
    }

    #[tokio::test]
    async fn slow_watcher_is_disconnected() {
        let store = EntityStore::open_in_memory().unwrap().with_watch_buffer(2);
        let mut stream = store.watch(Filter::All).unwrap();
        for i in 0..3 {
            store.put(&plain(&i.to_string()), None).unwrap();
        }

        assert!(stream.recv().await.is_some());
        assert!(stream.recv().await.is_some());
        assert!(stream.recv().await.is_none());
    }

    // ── Persistence (on-disk) ──────────────────────────────────────

    #[test]
    fn persistence_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("test.redb");

        {
            let store = EntityStore::open(&db_path).unwrap();
            store.put(&test_sandbox("s1", SandboxStatus::Pending), None).unwrap();
            store.delete(&id("sandbox/s1"), None).unwrap();
            store.put(&test_node("n1"), None).unwrap();
        }

        let store = EntityStore::open(&db_path).unwrap();
        assert_eq!(store.get(&id("node/n1")).unwrap().revision, 1);
        assert_eq!(
            store.create(&test_sandbox("s1", SandboxStatus::Pending)).unwrap(),
            3
        );
        let ready = Filter::attr("node.status", NodeStatus::Ready.keyword());
        assert_eq!(store.list(&ready).unwrap().len(), 1);
    }
}
