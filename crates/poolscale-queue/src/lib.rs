//! poolscale-queue: the build-queue demand signal.
//!
//! A [`BuildQueue`] answers one question: how many builds are waiting for
//! an agent matching a selector. [`DroneQueue`] asks a Drone server;
//! [`StaticQueue`] returns fixed or scripted answers.

pub mod drone;
pub mod error;
pub mod queue;
pub mod static_queue;

pub use drone::DroneQueue;
pub use error::{QueueError, QueueResult};
pub use queue::BuildQueue;
pub use static_queue::StaticQueue;
