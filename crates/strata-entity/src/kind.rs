//! Kind registry types and list/watch filters.

use serde::{Deserialize, Serialize};

use crate::entity::{Entity, EntityId};
use crate::value::Value;

/// Pseudo-attribute under which every entity is indexed by kind.
pub const KIND_ATTR: &str = "entity.kind";

/// Describes a registered kind: which attribute selects it and which of
/// its attributes are indexed for `list`/`watch` filters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KindDescriptor {
    pub name: String,
    /// Attribute that selects entities of this kind.
    pub index_attr: String,
    /// Attribute keys maintained in the secondary index.
    pub indexed: Vec<String>,
}

impl KindDescriptor {
    pub fn new(name: &str, indexed: &[&str]) -> Self {
        Self {
            name: name.to_string(),
            index_attr: KIND_ATTR.to_string(),
            indexed: indexed.iter().map(|s| s.to_string()).collect(),
        }
    }

    /// The filter selecting every entity of this kind.
    pub fn filter(&self) -> Filter {
        Filter::Kind(self.name.clone())
    }
}

/// Selects entities for `list` and `watch`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "by", content = "of", rename_all = "snake_case")]
pub enum Filter {
    /// Every entity. Only meant for diagnostics; `list` does a full scan.
    All,
    Kind(String),
    /// Entities carrying `key = value`. `key` must be indexed for `list`.
    Attr { key: String, value: Value },
    Id(EntityId),
}

impl Filter {
    pub fn kind(name: &str) -> Self {
        Self::Kind(name.to_string())
    }

    pub fn attr(key: &str, value: Value) -> Self {
        Self::Attr {
            key: key.to_string(),
            value,
        }
    }

    pub fn matches(&self, entity: &Entity) -> bool {
        match self {
            Self::All => true,
            Self::Kind(kind) => entity.kind == *kind,
            Self::Attr { key, value } if key == KIND_ATTR => {
                matches!(value, Value::Keyword(k) if *k == entity.kind)
            }
            Self::Attr { key, value } => entity.attrs.get_all(key).any(|v| v == value),
            Self::Id(id) => entity.id == *id,
        }
    }
}
