//! Shared fixtures for the crate's tests.

use poolscale_core::config::MemoryConfig;
use poolscale_core::{
    AgentConfig, AutoscalerConfig, LoopConfig, PoolConfig, ProviderSpec, Selector, ServerConfig,
};

/// A memory-provider resource named `linux` with the given pool bounds.
pub(crate) fn test_config(min: u32, max: u32) -> AutoscalerConfig {
    AutoscalerConfig {
        name: "linux".to_string(),
        selector: Selector::new(),
        config: LoopConfig::default(),
        pool: PoolConfig {
            min,
            max,
            ..PoolConfig::default()
        },
        server: ServerConfig {
            host: "drone.example.com".to_string(),
            ..ServerConfig::default()
        },
        agent: AgentConfig::default(),
        provider: ProviderSpec::Memory(MemoryConfig::default()),
    }
}
