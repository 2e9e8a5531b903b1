//! Typed attribute values and the ordered attribute set carried by entities.

use serde::{Deserialize, Serialize};

use crate::entity::EntityId;

/// A single typed attribute value.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "t", content = "v", rename_all = "snake_case")]
pub enum Value {
    /// Enumerated symbol such as a status (`pending`, `ready`).
    Keyword(String),
    Str(String),
    Int(i64),
    Bool(bool),
    /// Weak reference to another entity, resolved on demand via `get`.
    Ref(EntityId),
    /// Milliseconds since the Unix epoch.
    Time(u64),
}

impl Value {
    pub fn keyword(s: impl Into<String>) -> Self {
        Self::Keyword(s.into())
    }

    pub fn string(s: impl Into<String>) -> Self {
        Self::Str(s.into())
    }

    /// Stable textual form used in index keys.
    pub fn index_key(&self) -> String {
        match self {
            Self::Keyword(s) => format!("kw:{s}"),
            Self::Str(s) => format!("s:{s}"),
            Self::Int(i) => format!("i:{i}"),
            Self::Bool(b) => format!("b:{b}"),
            Self::Ref(id) => format!("r:{id}"),
            Self::Time(t) => format!("t:{t}"),
        }
    }
}

/// One key/value pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attr {
    pub key: String,
    pub value: Value,
}

impl Attr {
    pub fn new(key: impl Into<String>, value: Value) -> Self {
        Self {
            key: key.into(),
            value,
        }
    }
}

/// Ordered set of attributes.
///
/// Keys may repeat (multi-valued attributes such as a command line), but an
/// identical key/value pair is stored once. Insertion order is preserved.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Attrs(Vec<Attr>);

impl Attrs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Attr> {
        self.0.iter()
    }

    /// Append a value unless the same pair is already present.
    pub fn push(&mut self, key: impl Into<String>, value: Value) {
        let attr = Attr::new(key, value);
        if !self.0.contains(&attr) {
            self.0.push(attr);
        }
    }

    /// Replace every value of `key` with a single value.
    pub fn set(&mut self, key: &str, value: Value) {
        self.remove(key);
        self.0.push(Attr::new(key, value));
    }

    /// Set `key` when `value` is present, remove it otherwise.
    pub fn set_opt(&mut self, key: &str, value: Option<Value>) {
        match value {
            Some(v) => self.set(key, v),
            None => self.remove(key),
        }
    }

    pub fn remove(&mut self, key: &str) {
        self.0.retain(|a| a.key != key);
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.0.iter().any(|a| a.key == key)
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.iter().find(|a| a.key == key).map(|a| &a.value)
    }

    pub fn get_all<'a>(&'a self, key: &'a str) -> impl Iterator<Item = &'a Value> + 'a {
        self.0.iter().filter(move |a| a.key == key).map(|a| &a.value)
    }

    pub fn keyword(&self, key: &str) -> Option<&str> {
        match self.get(key) {
            Some(Value::Keyword(s)) => Some(s),
            _ => None,
        }
    }

    pub fn string(&self, key: &str) -> Option<&str> {
        match self.get(key) {
            Some(Value::Str(s)) => Some(s),
            _ => None,
        }
    }

    pub fn int(&self, key: &str) -> Option<i64> {
        match self.get(key) {
            Some(Value::Int(i)) => Some(*i),
            _ => None,
        }
    }

    pub fn boolean(&self, key: &str) -> Option<bool> {
        match self.get(key) {
            Some(Value::Bool(b)) => Some(*b),
            _ => None,
        }
    }

    pub fn reference(&self, key: &str) -> Option<&EntityId> {
        match self.get(key) {
            Some(Value::Ref(id)) => Some(id),
            _ => None,
        }
    }

    pub fn time(&self, key: &str) -> Option<u64> {
        match self.get(key) {
            Some(Value::Time(t)) => Some(*t),
            _ => None,
        }
    }

    pub fn strings(&self, key: &str) -> Vec<String> {
        self.get_all(key)
            .filter_map(|v| match v {
                Value::Str(s) => Some(s.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn references(&self, key: &str) -> Vec<EntityId> {
        self.get_all(key)
            .filter_map(|v| match v {
                Value::Ref(id) => Some(id.clone()),
                _ => None,
            })
            .collect()
    }
}

impl FromIterator<Attr> for Attrs {
    fn from_iter<I: IntoIterator<Item = Attr>>(iter: I) -> Self {
        let mut attrs = Attrs::new();
        for attr in iter {
            attrs.push(attr.key, attr.value);
        }
        attrs
    }
}

impl<'a> IntoIterator for &'a Attrs {
    type Item = &'a Attr;
    type IntoIter = std::slice::Iter<'a, Attr>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}
