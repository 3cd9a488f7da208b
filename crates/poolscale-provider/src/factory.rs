//! Build the provider adapter a resource asks for.

use std::sync::Arc;

use poolscale_core::ProviderSpec;
use tracing::info;

use crate::digitalocean::DigitalOcean;
use crate::error::{ProviderError, ProviderResult};
use crate::hetzner::HetznerCloud;
use crate::memory::MemoryProvider;
use crate::provider::Provider;

/// Construct the adapter for `spec`, scoped to pool `pool`.
///
/// Amazon and Google resources parse and validate, but have no adapter.
pub fn build(pool: &str, spec: &ProviderSpec) -> ProviderResult<Arc<dyn Provider>> {
    let provider: Arc<dyn Provider> = match spec {
        ProviderSpec::DigitalOcean(config) => Arc::new(DigitalOcean::new(pool, config.clone())?),
        ProviderSpec::HetznerCloud(config) => Arc::new(HetznerCloud::new(pool, config.clone())?),
        ProviderSpec::Memory(config) => Arc::new(MemoryProvider::new().with_quota(config.quota)),
        ProviderSpec::Amazon(_) | ProviderSpec::Google(_) => {
            return Err(ProviderError::Unsupported(spec.kind().to_string()));
        }
    };
    info!(%pool, provider = %provider.kind(), "provider adapter ready");
    Ok(provider)
}
