//! redb table definitions for the entity store.
//!
//! Entity records are JSON-serialized into `&[u8]` value columns keyed by
//! entity id. Index entries use composite keys
//! `{attr}\x1f{value}\x1f{entity_id}` so a prefix scan yields every entity
//! carrying one attribute value.

use redb::TableDefinition;

/// Entity records keyed by `{kind}/{name}`.
pub const ENTITIES: TableDefinition<&str, &[u8]> = TableDefinition::new("entities");

/// Last revision handed out per id. Survives deletes.
pub const REVISIONS: TableDefinition<&str, u64> = TableDefinition::new("revisions");

/// Attribute index keyed by `{attr}\x1f{value}\x1f{entity_id}`.
pub const INDEX: TableDefinition<&str, ()> = TableDefinition::new("attr_index");

/// Kind descriptors keyed by kind name.
pub const KINDS: TableDefinition<&str, &[u8]> = TableDefinition::new("kinds");

pub(crate) const SEP: char = '\u{1f}';

/// Prefix matching every index entry for `attr = value`.
pub(crate) fn index_prefix(attr: &str, value_key: &str) -> String {
    format!("{attr}{SEP}{value_key}{SEP}")
}

/// Full index key for one entity.
pub(crate) fn index_key(attr: &str, value_key: &str, id: &str) -> String {
    format!("{attr}{SEP}{value_key}{SEP}{id}")
}
