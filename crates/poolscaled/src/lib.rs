//! poolscaled: runs the reconcile loops of every Autoscaler resource in a
//! config directory.

pub mod supervisor;

pub use supervisor::{Backends, LiveBackends, ReloadSummary, Supervisor};
