//! poolscale-provider: the cloud backend boundary.
//!
//! Every backend implements [`Provider`]: `create`, `destroy` and `list`
//! over the instances of a single pool. Adapters are stateless per call;
//! instance identity lives in the reconciler's registry, never here.
//!
//! ```text
//! ProviderSpec ──build()──▶ Arc<dyn Provider>
//!                             ├── DigitalOcean  (droplets tagged poolscale:<pool>)
//!                             ├── HetznerCloud  (servers labelled poolscale-pool=<pool>)
//!                             └── MemoryProvider (dry runs, tests)
//! ```
//!
//! `destroy` of an instance that is already gone succeeds. `create` is
//! never retried inside an adapter; a create whose outcome is unknown is
//! reported as an error for which [`ProviderError::is_ambiguous`] is true.

pub mod digitalocean;
pub mod error;
pub mod factory;
pub mod hetzner;
mod http;
pub mod memory;
pub mod provider;

pub use digitalocean::DigitalOcean;
pub use error::{ProviderError, ProviderResult};
pub use factory::build;
pub use hetzner::HetznerCloud;
pub use memory::MemoryProvider;
pub use provider::{InstanceRequest, Provider};
