//! DigitalOcean adapter over the droplets API (v2).
//!
//! Droplets of a pool carry the tag `poolscale:<pool>`; `list` filters on it.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use poolscale_core::config::DigitalOceanConfig;
use poolscale_core::{Instance, InstanceState, ProviderKind};

use crate::error::{ProviderError, ProviderResult};
use crate::http::{check, client, transport_error};
use crate::provider::{InstanceRequest, Provider};

const PER_PAGE: u32 = 200;

/// DigitalOcean droplet provider.
pub struct DigitalOcean {
    client: reqwest::Client,
    endpoint: String,
    config: DigitalOceanConfig,
    pool_tag: String,
}

impl DigitalOcean {
    pub const ENDPOINT: &'static str = "https://api.digitalocean.com/v2";

    pub fn new(pool: &str, config: DigitalOceanConfig) -> ProviderResult<Self> {
        if config.token.is_empty() {
            return Err(ProviderError::Config("digitalocean token is empty".to_string()));
        }
        Ok(Self {
            client: client()?,
            endpoint: Self::ENDPOINT.to_string(),
            config,
            pool_tag: pool_tag(pool),
        })
    }

    /// Point the adapter at a different API root.
    pub fn with_endpoint(mut self, endpoint: &str) -> Self {
        self.endpoint = endpoint.trim_end_matches('/').to_string();
        self
    }

    fn create_body<'a>(&'a self, request: &'a InstanceRequest) -> CreateDroplet<'a> {
        let mut tags = vec![self.pool_tag.as_str()];
        tags.extend(self.config.tags.iter().map(String::as_str));
        CreateDroplet {
            name: &request.name,
            region: &self.config.region,
            size: &self.config.size,
            image: &self.config.image,
            ssh_keys: self.config.ssh_key.iter().map(String::as_str).collect(),
            tags,
            user_data: request.user_data.as_deref(),
        }
    }
}

/// Tag names allow letters, digits, `:`, `-` and `_`.
fn pool_tag(pool: &str) -> String {
    let sanitized: String = pool
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '-' })
        .collect();
    format!("poolscale:{sanitized}")
}

#[derive(Debug, Serialize)]
struct CreateDroplet<'a> {
    name: &'a str,
    region: &'a str,
    size: &'a str,
    image: &'a str,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    ssh_keys: Vec<&'a str>,
    tags: Vec<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    user_data: Option<&'a str>,
}

#[derive(Debug, Deserialize)]
struct DropletEnvelope {
    droplet: Droplet,
}

#[derive(Debug, Deserialize)]
struct DropletPage {
    droplets: Vec<Droplet>,
    #[serde(default)]
    links: Links,
}

#[derive(Debug, Default, Deserialize)]
struct Links {
    #[serde(default)]
    pages: Pages,
}

#[derive(Debug, Default, Deserialize)]
struct Pages {
    next: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Droplet {
    id: u64,
    name: String,
    created_at: DateTime<Utc>,
    #[serde(default)]
    networks: Networks,
}

#[derive(Debug, Default, Deserialize)]
struct Networks {
    #[serde(default)]
    v4: Vec<NetworkV4>,
}

#[derive(Debug, Deserialize)]
struct NetworkV4 {
    ip_address: String,
    #[serde(rename = "type")]
    kind: String,
}

impl Droplet {
    fn into_instance(self, seen_at: DateTime<Utc>) -> Instance {
        let address = self
            .networks
            .v4
            .into_iter()
            .find(|n| n.kind == "public")
            .map(|n| n.ip_address);
        let mut instance = Instance::observed(
            self.id.to_string(),
            self.name,
            ProviderKind::DigitalOcean,
            self.created_at,
            seen_at,
        );
        instance.address = address;
        instance
    }
}

#[async_trait]
impl Provider for DigitalOcean {
    fn kind(&self) -> ProviderKind {
        ProviderKind::DigitalOcean
    }

    async fn create(&self, request: &InstanceRequest) -> ProviderResult<Instance> {
        let resp = self
            .client
            .post(format!("{}/droplets", self.endpoint))
            .bearer_auth(&self.config.token)
            .json(&self.create_body(request))
            .send()
            .await
            .map_err(transport_error)?;
        let envelope: DropletEnvelope = check(resp)
            .await?
            .json()
            .await
            .map_err(transport_error)?;

        let mut instance = envelope.droplet.into_instance(Utc::now());
        instance.state = InstanceState::Pending;
        debug!(instance = %instance.id, name = %instance.name, "droplet created");
        Ok(instance)
    }

    async fn destroy(&self, id: &str) -> ProviderResult<()> {
        let resp = self
            .client
            .delete(format!("{}/droplets/{id}", self.endpoint))
            .bearer_auth(&self.config.token)
            .send()
            .await
            .map_err(transport_error)?;
        match check(resp).await {
            Ok(_) => {
                debug!(instance = %id, "droplet destroyed");
                Ok(())
            }
            Err(ProviderError::NotFound(_)) => {
                debug!(instance = %id, "droplet already gone");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn list(&self) -> ProviderResult<Vec<Instance>> {
        let mut instances = Vec::new();
        let mut page = 1u32;
        loop {
            let resp = self
                .client
                .get(format!("{}/droplets", self.endpoint))
                .bearer_auth(&self.config.token)
                .query(&[
                    ("tag_name", self.pool_tag.clone()),
                    ("page", page.to_string()),
                    ("per_page", PER_PAGE.to_string()),
                ])
                .send()
                .await
                .map_err(transport_error)?;
            let body: DropletPage = check(resp).await?.json().await.map_err(transport_error)?;

            let now = Utc::now();
            let has_next = body.links.pages.next.is_some() && !body.droplets.is_empty();
            instances.extend(body.droplets.into_iter().map(|d| d.into_instance(now)));
            if !has_next {
                break;
            }
            page += 1;
        }
        debug!(tag = %self.pool_tag, count = instances.len(), "droplets listed");
        Ok(instances)
    }
}
