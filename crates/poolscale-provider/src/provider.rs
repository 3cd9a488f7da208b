//! The provider capability set.

use async_trait::async_trait;

use poolscale_core::{Instance, ProviderKind};

use crate::error::ProviderResult;

/// Provider-neutral description of an instance to create.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceRequest {
    /// Hostname for the new instance.
    pub name: String,
    /// Boot-time configuration (cloud-init).
    pub user_data: Option<String>,
}

impl InstanceRequest {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            user_data: None,
        }
    }

    pub fn with_user_data(mut self, user_data: Option<&str>) -> Self {
        self.user_data = user_data.map(str::to_string);
        self
    }
}

/// Instance lifecycle operations over one cloud backend, scoped to a pool.
#[async_trait]
pub trait Provider: Send + Sync {
    /// Which backend this adapter talks to.
    fn kind(&self) -> ProviderKind;

    /// Provision an instance. The returned instance is `Pending`.
    ///
    /// Must not retry internally.
    async fn create(&self, request: &InstanceRequest) -> ProviderResult<Instance>;

    /// Destroy an instance. Destroying an instance that no longer exists
    /// succeeds.
    async fn destroy(&self, id: &str) -> ProviderResult<()>;

    /// Every instance of the pool the provider currently reports, as `Running`.
    async fn list(&self) -> ProviderResult<Vec<Instance>>;
}
