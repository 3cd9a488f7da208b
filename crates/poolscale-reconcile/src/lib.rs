//! poolscale-reconcile: the pool reconciliation loop.
//!
//! One [`Driver`] per Autoscaler resource owns one [`Reconciler`], which in
//! turn owns that pool's [`Registry`]. Nothing is shared between resources
//! except the status store and read-only configuration.
//!
//! ```text
//! Driver (interval, overlap guard, config watch, shutdown)
//!   └─▶ Reconciler::run_pass
//!         ├─ Refreshing: Provider::list ─▶ Registry::reconcile
//!         ├─ Planning:   BuildQueue::pending ─▶ Estimate ─▶ plan()
//!         ├─ Executing:  destroys, then creates (concurrent, isolated)
//!         └─ Reporting:  Status ─▶ StateStore
//! ```

pub mod driver;
pub mod error;
pub mod estimator;
pub mod planner;
pub mod reconciler;
pub mod registry;

#[cfg(test)]
pub(crate) mod testing;

pub use driver::{ConfigUpdate, Driver, DriverStats};
pub use error::{ReconcileError, ReconcileResult};
pub use estimator::{Estimate, target_size};
pub use planner::{Plan, PlanPolicy, plan};
pub use reconciler::{ActionOutcome, Clock, PassPhase, PassReport, Reconciler, instance_name};
pub use registry::{RefreshSummary, Registry, Snapshot};
