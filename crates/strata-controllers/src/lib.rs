//! strata-controllers — the secondary reconcilers and deployment
//! bookkeeping.
//!
//! # Components
//!
//! - **`ipalloc`** — deterministic service addresses inside the service subnet
//! - **`disk_lease`** — binds, releases and collects disk leases
//! - **`default_app`** — keeps at most one app flagged default
//! - **`default_route`** — points `http_route/default` at the default app
//! - **`deploy`** — deploy, fail, rollback and history of app versions

pub mod default_app;
pub mod default_route;
pub mod deploy;
pub mod disk_lease;
pub mod error;
pub mod ipalloc;

pub use default_app::{default_apps, DefaultAppController};
pub use default_route::{default_route_id, DefaultRouteController, DEFAULT_ROUTE, DEFAULT_ROUTE_HOST};
pub use deploy::{DeployOutcome, DeployRequest, Deployer};
pub use disk_lease::{DiskLeaseController, DEFAULT_RELEASED_RETENTION};
pub use error::{ControllerError, ControllerResult};
pub use ipalloc::{IpAllocator, Subnet};
