//! Autoscaler resource parser.
//!
//! A resource file looks like:
//!
//! ```toml
//! name = "linux-amd64"
//!
//! [selector]
//! os = "linux"
//!
//! [config]
//! interval = "5m"
//!
//! [pool]
//! min = 2
//! max = 4
//! min_age = "55m"
//!
//! [server]
//! host = "ci.example.com"
//! token = "..."
//!
//! [agent]
//! host = "ci.example.com:9000"
//! token = "..."
//!
//! [provider.digitalocean]
//! token = "..."
//! ```
//!
//! Every section is optional and filled from its `Default` impl, which
//! carries the declared defaults. Secrets may be supplied through the
//! environment instead of the file.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{ConfigError, ConfigResult};
use crate::types::{ProviderKind, Selector};
use crate::userdata;

/// Environment lookup used for overrides. `std::env::var` in production,
/// a map in tests.
pub type EnvLookup<'a> = &'a dyn Fn(&str) -> Option<String>;

/// Longest resource name that still yields a 63-character instance hostname.
pub const MAX_NAME_LEN: usize = 48;

/// Reads overrides from the process environment.
pub fn process_env(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.is_empty())
}

// ── Sections ───────────────────────────────────────────────────────

/// Reconciliation loop settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoopConfig {
    /// Time between reconciliation passes.
    #[serde(with = "crate::duration::serde_str")]
    pub interval: Duration,
    /// Upper bound on any single provider or build-queue call.
    #[serde(with = "crate::duration::serde_str")]
    pub timeout: Duration,
    /// How long an instance may go unconfirmed before it is considered lost.
    #[serde(with = "crate::duration::serde_str")]
    pub grace: Duration,
    /// Maximum create + destroy actions issued in one pass.
    pub max_actions: Option<u32>,
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(5 * 60),
            timeout: Duration::from_secs(60),
            grace: Duration::from_secs(10 * 60),
            max_actions: None,
        }
    }
}

/// Pool bounds and recycling policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    pub min: u32,
    pub max: u32,
    /// Instances older than this are recycled. Zero disables recycling.
    #[serde(with = "crate::duration::serde_str")]
    pub min_age: Duration,
    /// Aged instances replaced per pass.
    pub recycle: u32,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min: 2,
            max: 4,
            min_age: Duration::from_secs(55 * 60),
            recycle: 1,
        }
    }
}

/// Build server the queue signal is read from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub proto: String,
    pub token: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: String::new(),
            proto: "https".to_string(),
            token: String::new(),
        }
    }
}

impl ServerConfig {
    /// Base URL of the build server.
    pub fn url(&self) -> String {
        format!("{}://{}", self.proto, self.host.trim_end_matches('/'))
    }
}

/// Settings baked into every agent's user data.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    pub host: String,
    pub token: String,
    pub image: String,
    /// Builds a single agent runs at once.
    pub concurrency: u32,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            host: String::new(),
            token: String::new(),
            image: "drone/agent:0.8".to_string(),
            concurrency: 2,
        }
    }
}

// ── Provider blocks ────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DigitalOceanConfig {
    pub token: String,
    pub image: String,
    pub region: String,
    pub size: String,
    pub ssh_key: Option<String>,
    pub tags: Vec<String>,
    pub user_data: Option<String>,
    pub user_data_file: Option<PathBuf>,
}

impl Default for DigitalOceanConfig {
    fn default() -> Self {
        Self {
            token: String::new(),
            image: "docker-18-04".to_string(),
            region: "nyc1".to_string(),
            size: "s-2vcpu-4gb".to_string(),
            ssh_key: None,
            tags: Vec::new(),
            user_data: None,
            user_data_file: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HetznerCloudConfig {
    pub token: String,
    pub datacenter: String,
    pub image: String,
    pub server_type: String,
    pub ssh_key: Option<u64>,
    pub user_data: Option<String>,
    pub user_data_file: Option<PathBuf>,
}

impl Default for HetznerCloudConfig {
    fn default() -> Self {
        Self {
            token: String::new(),
            datacenter: "nbg1-dc3".to_string(),
            image: "ubuntu-18.04".to_string(),
            server_type: "cx11".to_string(),
            ssh_key: None,
            user_data: None,
            user_data_file: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AmazonConfig {
    pub image: String,
    pub instance: String,
    pub private_ip: bool,
    pub region: String,
    pub retries: u32,
    pub ssh_key: Option<String>,
    pub subnet_id: Option<String>,
    pub security_group: Vec<String>,
    pub tags: BTreeMap<String, String>,
    pub user_data: Option<String>,
    pub user_data_file: Option<PathBuf>,
}

impl Default for AmazonConfig {
    fn default() -> Self {
        Self {
            image: String::new(),
            instance: "t3.nano".to_string(),
            private_ip: false,
            region: "us-east-1".to_string(),
            retries: 0,
            ssh_key: None,
            subnet_id: None,
            security_group: Vec::new(),
            tags: BTreeMap::new(),
            user_data: None,
            user_data_file: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GoogleConfig {
    pub machine_type: String,
    pub machine_image: String,
    pub network: String,
    pub labels: BTreeMap<String, String>,
    pub scopes: Vec<String>,
    pub disk_size: u64,
    pub disk_type: String,
    pub project: String,
    pub tags: Vec<String>,
    pub user_data: Option<String>,
    pub user_data_file: Option<PathBuf>,
    pub zone: String,
}

impl Default for GoogleConfig {
    fn default() -> Self {
        Self {
            machine_type: "n1-standard-1".to_string(),
            machine_image: "ubuntu-os-cloud/global/images/ubuntu-1604-xenial-v20170721".to_string(),
            network: "global/networks/default".to_string(),
            labels: BTreeMap::new(),
            scopes: Vec::new(),
            disk_size: 50,
            disk_type: "pd-standard".to_string(),
            project: String::new(),
            tags: Vec::new(),
            user_data: None,
            user_data_file: None,
            zone: "us-central1-a".to_string(),
        }
    }
}

/// In-process provider used for dry runs.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryConfig {
    /// Maximum concurrent instances; creates beyond it fail.
    pub quota: Option<u32>,
}

/// The single active provider of a resource.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProviderSpec {
    DigitalOcean(DigitalOceanConfig),
    HetznerCloud(HetznerCloudConfig),
    Amazon(AmazonConfig),
    Google(GoogleConfig),
    Memory(MemoryConfig),
}

impl ProviderSpec {
    pub fn kind(&self) -> ProviderKind {
        match self {
            ProviderSpec::DigitalOcean(_) => ProviderKind::DigitalOcean,
            ProviderSpec::HetznerCloud(_) => ProviderKind::HetznerCloud,
            ProviderSpec::Amazon(_) => ProviderKind::Amazon,
            ProviderSpec::Google(_) => ProviderKind::Google,
            ProviderSpec::Memory(_) => ProviderKind::Memory,
        }
    }

    /// Resolved user data handed to new instances.
    pub fn user_data(&self) -> Option<&str> {
        match self {
            ProviderSpec::DigitalOcean(c) => c.user_data.as_deref(),
            ProviderSpec::HetznerCloud(c) => c.user_data.as_deref(),
            ProviderSpec::Amazon(c) => c.user_data.as_deref(),
            ProviderSpec::Google(c) => c.user_data.as_deref(),
            ProviderSpec::Memory(_) => None,
        }
    }

    fn user_data_slots(&mut self) -> Option<(&mut Option<String>, &mut Option<PathBuf>)> {
        match self {
            ProviderSpec::DigitalOcean(c) => Some((&mut c.user_data, &mut c.user_data_file)),
            ProviderSpec::HetznerCloud(c) => Some((&mut c.user_data, &mut c.user_data_file)),
            ProviderSpec::Amazon(c) => Some((&mut c.user_data, &mut c.user_data_file)),
            ProviderSpec::Google(c) => Some((&mut c.user_data, &mut c.user_data_file)),
            ProviderSpec::Memory(_) => None,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
struct ProviderBlocks {
    digitalocean: Option<DigitalOceanConfig>,
    hetznercloud: Option<HetznerCloudConfig>,
    amazon: Option<AmazonConfig>,
    google: Option<GoogleConfig>,
    memory: Option<MemoryConfig>,
}

impl ProviderBlocks {
    fn apply_env(&mut self, env: EnvLookup<'_>) {
        if let Some(c) = self.digitalocean.as_mut() {
            override_string(&mut c.token, env("DRONE_DIGITALOCEAN_TOKEN"));
            override_option(&mut c.user_data, env("DRONE_DIGITALOCEAN_USERDATA"));
            override_option(
                &mut c.user_data_file,
                env("DRONE_DIGITALOCEAN_USERDATA_FILE").map(PathBuf::from),
            );
        }
        if let Some(c) = self.hetznercloud.as_mut() {
            override_string(&mut c.token, env("DRONE_HETZNERCLOUD_TOKEN"));
            override_option(&mut c.user_data, env("DRONE_HETZNERCLOUD_USERDATA"));
            override_option(
                &mut c.user_data_file,
                env("DRONE_HETZNERCLOUD_USERDATA_FILE").map(PathBuf::from),
            );
        }
        if let Some(c) = self.amazon.as_mut() {
            override_option(&mut c.user_data, env("DRONE_AMAZON_USERDATA"));
            override_option(
                &mut c.user_data_file,
                env("DRONE_AMAZON_USERDATA_FILE").map(PathBuf::from),
            );
        }
        if let Some(c) = self.google.as_mut() {
            override_option(&mut c.user_data, env("DRONE_GOOGLE_USERDATA"));
            override_option(
                &mut c.user_data_file,
                env("DRONE_GOOGLE_USERDATA_FILE").map(PathBuf::from),
            );
        }
    }

    fn into_spec(self, name: &str) -> ConfigResult<ProviderSpec> {
        let mut found = Vec::new();
        if let Some(c) = self.digitalocean {
            found.push(ProviderSpec::DigitalOcean(c));
        }
        if let Some(c) = self.hetznercloud {
            found.push(ProviderSpec::HetznerCloud(c));
        }
        if let Some(c) = self.amazon {
            found.push(ProviderSpec::Amazon(c));
        }
        if let Some(c) = self.google {
            found.push(ProviderSpec::Google(c));
        }
        if let Some(c) = self.memory {
            found.push(ProviderSpec::Memory(c));
        }

        match found.len() {
            0 => Err(ConfigError::invalid(name, "no provider configured")),
            1 => Ok(found.remove(0)),
            _ => {
                let kinds: Vec<&str> = found.iter().map(|p| p.kind().as_str()).collect();
                Err(ConfigError::invalid(
                    name,
                    format!("exactly one provider may be configured, found {}", kinds.join(", ")),
                ))
            }
        }
    }
}

fn override_string(slot: &mut String, value: Option<String>) {
    if let Some(v) = value {
        *slot = v;
    }
}

fn override_option<T>(slot: &mut Option<T>, value: Option<T>) {
    if value.is_some() {
        *slot = value;
    }
}

// ── Resource ──────────────────────────────────────────────────────

/// On-disk shape of a resource file.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
struct ResourceFile {
    name: String,
    selector: Selector,
    config: LoopConfig,
    pool: PoolConfig,
    server: ServerConfig,
    agent: AgentConfig,
    provider: ProviderBlocks,
}

/// Fully resolved, validated configuration of one Autoscaler resource.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AutoscalerConfig {
    pub name: String,
    pub selector: Selector,
    pub config: LoopConfig,
    pub pool: PoolConfig,
    pub server: ServerConfig,
    pub agent: AgentConfig,
    pub provider: ProviderSpec,
}

impl AutoscalerConfig {
    /// Resolve a resource from TOML text.
    ///
    /// `origin` names the source in errors and anchors relative
    /// `user_data_file` paths.
    pub fn parse(content: &str, origin: &Path, env: EnvLookup<'_>) -> ConfigResult<Self> {
        let mut file: ResourceFile = toml::from_str(content).map_err(|e| ConfigError::Parse {
            path: origin.to_path_buf(),
            message: e.to_string(),
        })?;

        if let Some(token) = env("DRONE_SERVER_TOKEN") {
            file.server.token = token;
        }
        if let Some(token) = env("DRONE_AGENT_TOKEN") {
            file.agent.token = token;
        }
        file.provider.apply_env(env);

        let mut provider = file.provider.into_spec(&file.name)?;
        let base_dir = origin.parent().unwrap_or_else(|| Path::new("."));
        resolve_user_data(&mut provider, &file.agent, base_dir)?;

        let config = AutoscalerConfig {
            name: file.name,
            selector: file.selector,
            config: file.config,
            pool: file.pool,
            server: file.server,
            agent: file.agent,
            provider,
        };
        config.validate()?;
        Ok(config)
    }

    /// Read and resolve a resource file.
    pub fn from_file(path: &Path, env: EnvLookup<'_>) -> ConfigResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&content, path, env)
    }

    /// Check the resource invariants.
    pub fn validate(&self) -> ConfigResult<()> {
        let name = &self.name;
        if name.is_empty() {
            return Err(ConfigError::invalid(name, "name must not be empty"));
        }
        // Names prefix instance hostnames: `<name>-agent-<8 hex>`.
        if !name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
            || name.starts_with('-')
            || name.ends_with('-')
        {
            return Err(ConfigError::invalid(
                name,
                "name may only contain lowercase letters, digits and inner '-'",
            ));
        }
        if name.len() > MAX_NAME_LEN {
            return Err(ConfigError::invalid(
                name,
                format!("name must be at most {MAX_NAME_LEN} characters"),
            ));
        }
        if self.pool.min > self.pool.max {
            return Err(ConfigError::invalid(
                name,
                format!("pool.min ({}) exceeds pool.max ({})", self.pool.min, self.pool.max),
            ));
        }
        if self.agent.concurrency == 0 {
            return Err(ConfigError::invalid(name, "agent.concurrency must be at least 1"));
        }
        if self.config.interval.is_zero() {
            return Err(ConfigError::invalid(name, "config.interval must be non-zero"));
        }
        if self.config.timeout.is_zero() {
            return Err(ConfigError::invalid(name, "config.timeout must be non-zero"));
        }
        if self.config.grace.is_zero() {
            return Err(ConfigError::invalid(name, "config.grace must be non-zero"));
        }
        if self.config.max_actions == Some(0) {
            return Err(ConfigError::invalid(name, "config.max_actions must be at least 1"));
        }
        if self.server.host.is_empty() {
            return Err(ConfigError::invalid(name, "server.host is required"));
        }
        match &self.provider {
            ProviderSpec::DigitalOcean(c) if c.token.is_empty() => {
                Err(ConfigError::invalid(name, "provider.digitalocean.token is required"))
            }
            ProviderSpec::HetznerCloud(c) if c.token.is_empty() => {
                Err(ConfigError::invalid(name, "provider.hetznercloud.token is required"))
            }
            ProviderSpec::Amazon(c) if c.image.is_empty() => {
                Err(ConfigError::invalid(name, "provider.amazon.image is required"))
            }
            ProviderSpec::Google(c) if c.project.is_empty() => {
                Err(ConfigError::invalid(name, "provider.google.project is required"))
            }
            _ => Ok(()),
        }
    }

    /// Whether moving from `self` to `next` needs a fresh provider and
    /// build-queue client rather than an in-place update.
    ///
    /// Selector, loop settings, pool bounds and agent settings are read at
    /// the start of every pass and apply without a restart.
    pub fn requires_restart(&self, next: &AutoscalerConfig) -> bool {
        self.name != next.name || self.server != next.server || self.provider != next.provider
    }
}

fn resolve_user_data(
    provider: &mut ProviderSpec,
    agent: &AgentConfig,
    base_dir: &Path,
) -> ConfigResult<()> {
    let Some((user_data, user_data_file)) = provider.user_data_slots() else {
        return Ok(());
    };
    if user_data.is_some() {
        return Ok(());
    }
    match user_data_file {
        Some(path) => {
            let full = if path.is_absolute() {
                path.clone()
            } else {
                base_dir.join(path.as_path())
            };
            let content = std::fs::read_to_string(&full)
                .map_err(|source| ConfigError::UserData { path: full, source })?;
            *user_data = Some(content);
        }
        None => *user_data = Some(userdata::render_default(agent)),
    }
    Ok(())
}

// ── Directory loading ──────────────────────────────────────────────

/// Outcome of loading one resource file.
#[derive(Debug)]
pub struct LoadedResource {
    pub path: PathBuf,
    pub result: ConfigResult<AutoscalerConfig>,
}

/// Load every `*.toml` resource in `dir`, sorted by path.
///
/// A broken file only fails its own entry. When two files declare the same
/// name, the later one (by path) is rejected.
pub fn load_dir(dir: &Path, env: EnvLookup<'_>) -> ConfigResult<Vec<LoadedResource>> {
    let entries = std::fs::read_dir(dir).map_err(|source| ConfigError::Read {
        path: dir.to_path_buf(),
        source,
    })?;

    let mut paths = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|source| ConfigError::Read {
            path: dir.to_path_buf(),
            source,
        })?;
        let path = entry.path();
        if path.is_file() && path.extension().is_some_and(|ext| ext == "toml") {
            paths.push(path);
        }
    }
    paths.sort();

    let mut seen: HashMap<String, PathBuf> = HashMap::new();
    let mut loaded = Vec::with_capacity(paths.len());
    for path in paths {
        let result = match AutoscalerConfig::from_file(&path, env) {
            Ok(config) => match seen.get(&config.name) {
                Some(first) => Err(ConfigError::Duplicate {
                    name: config.name.clone(),
                    first: first.clone(),
                }),
                None => {
                    seen.insert(config.name.clone(), path.clone());
                    Ok(config)
                }
            },
            Err(e) => Err(e),
        };
        debug!(path = ?path, ok = result.is_ok(), "autoscaler resource loaded");
        loaded.push(LoadedResource { path, result });
    }
    Ok(loaded)
}
