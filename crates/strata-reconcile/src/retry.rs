//! Read-modify-write with optimistic retry.

use tracing::debug;

use strata_entity::{Entity, EntityId, EntityStore};

use crate::error::{ReconcileError, ReconcileResult};

/// Attempts made by [`update_with_retry`] before giving up.
pub const DEFAULT_UPDATE_ATTEMPTS: usize = 8;

/// Re-read `id`, apply `mutate`, and write it back conditioned on the
/// revision just read. Repeats on conflict.
///
/// `mutate` returns `false` to skip the write. Returns the stored entity
/// after a write, `None` when nothing was written.
pub fn update_with_retry<F>(
    store: &EntityStore,
    id: &EntityId,
    mut mutate: F,
) -> ReconcileResult<Option<Entity>>
where
    F: FnMut(&mut Entity) -> ReconcileResult<bool>,
{
    for attempt in 1..=DEFAULT_UPDATE_ATTEMPTS {
        let mut entity = store.get(id)?;
        let read_revision = entity.revision;
        if !mutate(&mut entity)? {
            return Ok(None);
        }
        match store.put(&entity, Some(read_revision)) {
            Ok(revision) => {
                entity.revision = revision;
                return Ok(Some(entity));
            }
            Err(e) if e.is_conflict() => {
                debug!(%id, attempt, "update conflicted, re-reading");
            }
            Err(e) => return Err(e.into()),
        }
    }
    Err(ReconcileError::Contended {
        id: id.to_string(),
        attempts: DEFAULT_UPDATE_ATTEMPTS,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use strata_entity::Value;

    fn counter(store: &EntityStore) -> EntityId {
        let id = EntityId::parse("entity/counter").unwrap();
        let mut e = Entity::new(id.clone());
        e.attrs.set("count", Value::Int(0));
        store.put(&e, None).unwrap();
        id
    }

    #[test]
    fn applies_mutation_and_returns_new_revision() {
        let store = EntityStore::open_in_memory().unwrap();
        let id = counter(&store);

        let updated = update_with_retry(&store, &id, |e| {
            let n = e.attrs.int("count").unwrap_or(0);
            e.attrs.set("count", Value::Int(n + 1));
            Ok(true)
        })
        .unwrap()
        .unwrap();

        assert_eq!(updated.revision, 2);
        assert_eq!(store.get(&id).unwrap().attrs.int("count"), Some(1));
    }

    #[test]
    fn skipped_mutation_writes_nothing() {
        let store = EntityStore::open_in_memory().unwrap();
        let id = counter(&store);
        assert!(update_with_retry(&store, &id, |_| Ok(false)).unwrap().is_none());
        assert_eq!(store.get(&id).unwrap().revision, 1);
    }

    #[test]
    fn retries_after_a_concurrent_write() {
        let store = EntityStore::open_in_memory().unwrap();
        let id = counter(&store);
        let mut interfered = false;

        update_with_retry(&store, &id, |e| {
            if !interfered {
                // Another writer sneaks in between our read and write.
                interfered = true;
                store.put(&store.get(&id).unwrap(), None).unwrap();
            }
            let n = e.attrs.int("count").unwrap_or(0);
            e.attrs.set("count", Value::Int(n + 1));
            Ok(true)
        })
        .unwrap();

        let stored = store.get(&id).unwrap();
        assert_eq!(stored.revision, 3);
        assert_eq!(stored.attrs.int("count"), Some(1));
    }

    #[test]
    fn missing_entity_is_an_error() {
        let store = EntityStore::open_in_memory().unwrap();
        let id = EntityId::parse("entity/nope").unwrap();
        let err = update_with_retry(&store, &id, |_| Ok(true)).unwrap_err();
        assert!(matches!(err, ReconcileError::Store(e) if e.is_not_found()));
    }
}
