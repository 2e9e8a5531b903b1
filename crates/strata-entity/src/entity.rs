//! The universal entity record and its identifier.

use std::fmt;
use std::sync::LazyLock;
use std::time::{SystemTime, UNIX_EPOCH};

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{EntityError, EntityResult};
use crate::schema::Schema;
use crate::value::Attrs;

/// Per-id version stamp. `0` means "does not exist".
pub type Revision = u64;

static ID_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[a-z][a-z0-9_]*/[A-Za-z0-9][A-Za-z0-9._:-]*$").expect("valid id pattern")
});

/// Globally unique entity id, namespaced by kind (`sandbox/abc123`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct EntityId(String);

impl EntityId {
    /// Build an id from a kind and a name.
    pub fn new(kind: &str, name: &str) -> EntityResult<Self> {
        Self::parse(&format!("{kind}/{name}"))
    }

    pub fn parse(s: &str) -> EntityResult<Self> {
        if ID_PATTERN.is_match(s) {
            Ok(Self(s.to_string()))
        } else {
            Err(EntityError::InvalidId(s.to_string()))
        }
    }

    /// The kind namespace (text before the first `/`).
    pub fn kind(&self) -> &str {
        self.0.split_once('/').map(|(k, _)| k).unwrap_or_default()
    }

    /// The name within the kind namespace.
    pub fn name(&self) -> &str {
        self.0.split_once('/').map(|(_, n)| n).unwrap_or_default()
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for EntityId {
    type Error = EntityError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<EntityId> for String {
    fn from(id: EntityId) -> Self {
        id.0
    }
}

impl std::str::FromStr for EntityId {
    type Err = EntityError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

/// A versioned, attribute-tagged record.
///
/// Values handed out by the store are detached copies; mutating one has no
/// effect until it is written back with `put`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entity {
    pub id: EntityId,
    pub kind: String,
    #[serde(default)]
    pub attrs: Attrs,
    /// Assigned by the store on each successful write.
    #[serde(default)]
    pub revision: Revision,
    /// Milliseconds since epoch, set by the store on first write.
    #[serde(default)]
    pub created_at: u64,
    #[serde(default)]
    pub updated_at: u64,
}

impl Entity {
    /// A fresh, never-written entity whose kind is taken from the id.
    pub fn new(id: EntityId) -> Self {
        Self {
            kind: id.kind().to_string(),
            id,
            attrs: Attrs::new(),
            revision: 0,
            created_at: 0,
            updated_at: 0,
        }
    }

    /// A fresh entity populated from a typed schema value.
    pub fn from_schema<T: Schema>(id: EntityId, value: &T) -> EntityResult<Self> {
        if id.kind() != T::KIND {
            return Err(EntityError::KindMismatch {
                id: id.to_string(),
                expected: T::KIND.to_string(),
                actual: id.kind().to_string(),
            });
        }
        let mut entity = Self::new(id);
        entity.encode(value);
        Ok(entity)
    }

    /// Decode the typed view of this entity.
    pub fn decode<T: Schema>(&self) -> EntityResult<T> {
        if self.kind != T::KIND {
            return Err(EntityError::KindMismatch {
                id: self.id.to_string(),
                expected: T::KIND.to_string(),
                actual: self.kind.clone(),
            });
        }
        T::decode(&self.attrs)
    }

    /// Overwrite the schema-owned attributes with `value`.
    ///
    /// Attributes the schema does not know about are left in place.
    pub fn encode<T: Schema>(&mut self, value: &T) {
        for key in T::FIELDS {
            self.attrs.remove(key);
        }
        value.encode(&mut self.attrs);
    }
}

/// Current Unix epoch in milliseconds.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
