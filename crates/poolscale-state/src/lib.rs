//! poolscale-state: resource store for Autoscaler status.
//!
//! Backed by [redb](https://docs.rs/redb). Each Autoscaler resource owns one
//! `Status` record, overwritten at the end of every reconciliation pass and
//! read by whatever displays the fleet. The reconciliation core only writes
//! here; it never reads its own prior status back.
//!
//! The `StateStore` is `Clone` + `Send` + `Sync` (backed by `Arc<Database>`)
//! and is shared by every reconciliation task in the process.

pub mod error;
pub mod store;
pub mod tables;
pub mod types;

pub use error::{StateError, StateResult};
pub use store::StateStore;
pub use types::*;
