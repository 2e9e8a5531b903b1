//! strata-entity — the versioned entity store at the center of Strata.
//!
//! Every piece of control-plane state (nodes, sandboxes, apps, versions,
//! disks, leases, services, routes) is an [`Entity`]: an id namespaced by
//! kind, a bag of typed attributes and a revision stamped by the store.
//!
//! # Architecture
//!
//! ```text
//! EntityStore (Clone, Arc<Database>)
//!   ├── entities     id → JSON entity
//!   ├── revisions    id → last revision (kept across delete)
//!   ├── attr_index   attr\x1fvalue\x1fid → ()
//!   ├── kinds        name → KindDescriptor
//!   └── WatchHub     commit gate + per-watcher bounded channels
//! ```
//!
//! Writes are conditional on an expected revision and fail with
//! [`EntityError::Conflict`] when it is stale. Controllers read, decide,
//! write with the revision they read, and retry on conflict.
//!
//! Typed views live in [`schema`]; each built-in kind is registered (with
//! its indexed attributes) whenever a store is opened.

pub mod entity;
pub mod error;
pub mod kind;
pub mod schema;
pub mod store;
pub mod tables;
pub mod value;
pub mod watch;

pub use entity::{now_millis, Entity, EntityId, Revision};
pub use error::{EntityError, EntityResult};
pub use kind::{Filter, KindDescriptor, KIND_ATTR};
pub use schema::Schema;
pub use store::{EntityStore, WriteOp, DEFAULT_WATCH_BUFFER};
pub use value::{Attr, Attrs, Value};
pub use watch::{ChangeKind, WatchEvent, WatchStream};
