//! strata-runner — the agent that runs sandboxes on a worker node.
//!
//! # Components
//!
//! - **`driver`** — the `SandboxDriver` seam and a child-process driver
//! - **`runner`** — node registration, heartbeats, and the sandbox reconciler

pub mod driver;
pub mod error;
pub mod runner;

pub use driver::{ProcessDriver, SandboxDriver, Started};
pub use error::{RunnerError, RunnerResult};
pub use runner::{Runner, RunnerConfig};
