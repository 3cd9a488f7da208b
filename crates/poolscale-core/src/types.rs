//! Provider-neutral types shared by the provider adapters and the
//! reconciliation core.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Provider-unique identifier of a cloud instance.
pub type InstanceId = String;

// ── Provider ──────────────────────────────────────────────────────

/// Cloud backend an Autoscaler resource provisions agents on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    Amazon,
    DigitalOcean,
    Google,
    HetznerCloud,
    Memory,
}

impl ProviderKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderKind::Amazon => "amazon",
            ProviderKind::DigitalOcean => "digitalocean",
            ProviderKind::Google => "google",
            ProviderKind::HetznerCloud => "hetznercloud",
            ProviderKind::Memory => "memory",
        }
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ── Selector ──────────────────────────────────────────────────────

/// Label-based target filter. An empty selector matches everything.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Selector(BTreeMap<String, String>);

impl Selector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: &str, value: &str) -> Self {
        self.0.insert(key.to_string(), value.to_string());
        self
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &String)> {
        self.0.iter()
    }

    /// True when every selector label is present with the same value.
    pub fn matches(&self, labels: &HashMap<String, String>) -> bool {
        self.0
            .iter()
            .all(|(k, v)| labels.get(k).is_some_and(|actual| actual == v))
    }
}

impl FromIterator<(String, String)> for Selector {
    fn from_iter<T: IntoIterator<Item = (String, String)>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}

// ── Instance ──────────────────────────────────────────────────────

/// Lifecycle state of an agent instance as tracked by the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceState {
    /// Create succeeded, not yet confirmed by a provider listing.
    Pending,
    /// Confirmed present by the provider.
    Running,
    /// Selected for termination; destroy in progress.
    Draining,
    /// Destroyed, or lost for longer than the grace window.
    Terminated,
    /// The last action against this instance failed.
    Errored,
}

impl InstanceState {
    /// Counts toward the pool size.
    pub fn is_live(&self) -> bool {
        matches!(
            self,
            InstanceState::Pending | InstanceState::Running | InstanceState::Errored
        )
    }
}

/// A single agent instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Instance {
    pub id: InstanceId,
    pub name: String,
    pub provider: ProviderKind,
    /// Public address, when the provider reports one.
    pub address: Option<String>,
    pub created_at: DateTime<Utc>,
    pub state: InstanceState,
    pub last_seen_at: DateTime<Utc>,
    /// Error from the last failed action against this instance.
    pub last_error: Option<String>,
}

impl Instance {
    /// An instance as reported by a provider listing at `seen_at`.
    pub fn observed(
        id: impl Into<InstanceId>,
        name: impl Into<String>,
        provider: ProviderKind,
        created_at: DateTime<Utc>,
        seen_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            provider,
            address: None,
            created_at,
            state: InstanceState::Running,
            last_seen_at: seen_at,
            last_error: None,
        }
    }

    /// An instance returned by a successful create call.
    pub fn pending(
        id: impl Into<InstanceId>,
        name: impl Into<String>,
        provider: ProviderKind,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            state: InstanceState::Pending,
            ..Self::observed(id, name, provider, created_at, created_at)
        }
    }

    pub fn with_address(mut self, address: impl Into<String>) -> Self {
        self.address = Some(address.into());
        self
    }

    /// Age at `now`. Instances with a creation time in the future are age zero.
    pub fn age(&self, now: DateTime<Utc>) -> Duration {
        (now - self.created_at).to_std().unwrap_or(Duration::ZERO)
    }

    /// Time since the instance was last confirmed present.
    pub fn unseen_for(&self, now: DateTime<Utc>) -> Duration {
        (now - self.last_seen_at).to_std().unwrap_or(Duration::ZERO)
    }
}
