//! poolscale-core: shared types and the Autoscaler resource schema.
//!
//! An Autoscaler resource describes one pool of CI agents: label selector,
//! reconciliation cadence, pool bounds, build server and agent endpoints,
//! and exactly one cloud provider block. Resources are TOML files; each is
//! resolved into a single immutable [`AutoscalerConfig`] by an explicit
//! pipeline:
//!
//! ```text
//! declared defaults ─▶ file values ─▶ env overrides ─▶ user data ─▶ validate
//! ```

pub mod config;
pub mod duration;
pub mod error;
pub mod types;
pub mod userdata;

pub use config::{
    AgentConfig, AutoscalerConfig, LoadedResource, LoopConfig, PoolConfig, ProviderSpec,
    ServerConfig,
};
pub use error::{ConfigError, ConfigResult};
pub use types::*;
