//! strata-scheduler — turns PENDING sandboxes into node assignments.
//!
//! # Components
//!
//! - **`capacity`** — per-node committed resources, recomputed from the store
//! - **`placement`** — node scoring (least-loaded best fit, id tie-break)
//! - **`scheduler`** — the reconciler that commits assignments with CAS

pub mod capacity;
pub mod error;
pub mod placement;
pub mod scheduler;

pub use capacity::{snapshot, NodeCapacity};
pub use error::{SchedulerError, SchedulerResult};
pub use placement::{is_satisfiable, rank_nodes, score_node, select_node, NodeScore, ScoreBreakdown};
pub use scheduler::{Decision, Scheduler, SchedulerConfig};
