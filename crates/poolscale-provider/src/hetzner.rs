//! Hetzner Cloud adapter over the servers API (v1).
//!
//! Servers of a pool carry the label `poolscale-pool=<pool>`.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use poolscale_core::config::HetznerCloudConfig;
use poolscale_core::{Instance, InstanceState, ProviderKind};

use crate::error::{ProviderError, ProviderResult};
use crate::http::{check, client, transport_error};
use crate::provider::{InstanceRequest, Provider};

const POOL_LABEL: &str = "poolscale-pool";
const PER_PAGE: u32 = 50;

/// Hetzner Cloud server provider.
pub struct HetznerCloud {
    client: reqwest::Client,
    endpoint: String,
    config: HetznerCloudConfig,
    pool_label: String,
}

impl HetznerCloud {
    pub const ENDPOINT: &'static str = "https://api.hetzner.cloud/v1";

    pub fn new(pool: &str, config: HetznerCloudConfig) -> ProviderResult<Self> {
        if config.token.is_empty() {
            return Err(ProviderError::Config("hetznercloud token is empty".to_string()));
        }
        Ok(Self {
            client: client()?,
            endpoint: Self::ENDPOINT.to_string(),
            config,
            pool_label: label_value(pool),
        })
    }

    /// Point the adapter at a different API root.
    pub fn with_endpoint(mut self, endpoint: &str) -> Self {
        self.endpoint = endpoint.trim_end_matches('/').to_string();
        self
    }

    fn create_body<'a>(&'a self, request: &'a InstanceRequest) -> CreateServer<'a> {
        let mut labels = HashMap::new();
        labels.insert(POOL_LABEL, self.pool_label.as_str());
        CreateServer {
            name: &request.name,
            server_type: &self.config.server_type,
            image: &self.config.image,
            datacenter: &self.config.datacenter,
            ssh_keys: self.config.ssh_key.into_iter().collect(),
            user_data: request.user_data.as_deref(),
            labels,
            start_after_create: true,
        }
    }
}

/// Label values allow letters, digits, `-`, `_` and `.`, up to 63 characters.
fn label_value(pool: &str) -> String {
    pool.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' {
                c
            } else {
                '-'
            }
        })
        .take(63)
        .collect()
}

#[derive(Debug, Serialize)]
struct CreateServer<'a> {
    name: &'a str,
    server_type: &'a str,
    image: &'a str,
    datacenter: &'a str,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    ssh_keys: Vec<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    user_data: Option<&'a str>,
    labels: HashMap<&'static str, &'a str>,
    start_after_create: bool,
}

#[derive(Debug, Deserialize)]
struct ServerEnvelope {
    server: Server,
}

#[derive(Debug, Deserialize)]
struct ServerPage {
    servers: Vec<Server>,
    #[serde(default)]
    meta: Meta,
}

#[derive(Debug, Default, Deserialize)]
struct Meta {
    #[serde(default)]
    pagination: Pagination,
}

#[derive(Debug, Default, Deserialize)]
struct Pagination {
    next_page: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct Server {
    id: u64,
    name: String,
    created: DateTime<Utc>,
    #[serde(default)]
    public_net: PublicNet,
}

#[derive(Debug, Default, Deserialize)]
struct PublicNet {
    ipv4: Option<Ipv4>,
}

#[derive(Debug, Deserialize)]
struct Ipv4 {
    ip: String,
}

impl Server {
    fn into_instance(self, seen_at: DateTime<Utc>) -> Instance {
        let mut instance = Instance::observed(
            self.id.to_string(),
            self.name,
            ProviderKind::HetznerCloud,
            self.created,
            seen_at,
        );
        instance.address = self.public_net.ipv4.map(|v4| v4.ip);
        instance
    }
}

#[async_trait]
impl Provider for HetznerCloud {
    fn kind(&self) -> ProviderKind {
        ProviderKind::HetznerCloud
    }

    async fn create(&self, request: &InstanceRequest) -> ProviderResult<Instance> {
        let resp = self
            .client
            .post(format!("{}/servers", self.endpoint))
            .bearer_auth(&self.config.token)
            .json(&self.create_body(request))
            .send()
            .await
            .map_err(transport_error)?;
        let envelope: ServerEnvelope = check(resp)
            .await?
            .json()
            .await
            .map_err(transport_error)?;

        let mut instance = envelope.server.into_instance(Utc::now());
        instance.state = InstanceState::Pending;
        debug!(instance = %instance.id, name = %instance.name, "server created");
        Ok(instance)
    }

    async fn destroy(&self, id: &str) -> ProviderResult<()> {
        let resp = self
            .client
            .delete(format!("{}/servers/{id}", self.endpoint))
            .bearer_auth(&self.config.token)
            .send()
            .await
            .map_err(transport_error)?;
        match check(resp).await {
            Ok(_) => {
                debug!(instance = %id, "server destroyed");
                Ok(())
            }
            Err(ProviderError::NotFound(_)) => {
                debug!(instance = %id, "server already gone");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn list(&self) -> ProviderResult<Vec<Instance>> {
        let selector = format!("{POOL_LABEL}={}", self.pool_label);
        let mut instances = Vec::new();
        let mut page = 1u32;
        loop {
            let resp = self
                .client
                .get(format!("{}/servers", self.endpoint))
                .bearer_auth(&self.config.token)
                .query(&[
                    ("label_selector", selector.clone()),
                    ("page", page.to_string()),
                    ("per_page", PER_PAGE.to_string()),
                ])
                .send()
                .await
                .map_err(transport_error)?;
            let body: ServerPage = check(resp).await?.json().await.map_err(transport_error)?;

            let now = Utc::now();
            instances.extend(body.servers.into_iter().map(|s| s.into_instance(now)));
            match body.meta.pagination.next_page {
                Some(next) if next > page => page = next,
                _ => break,
            }
        }
        debug!(%selector, count = instances.len(), "servers listed");
        Ok(instances)
    }
}

#[cfg(test)]
mod tests {
    use mockito::{Matcher, Server};

    use super::*;

    fn test_config() -> HetznerCloudConfig {
        HetznerCloudConfig {
            token: "hz-token".to_string(),
            ssh_key: Some(4711),
            ..HetznerCloudConfig::default()
        }
    }

    #[test]
    fn empty_token_is_rejected() {
        let result = HetznerCloud::new("linux", HetznerCloudConfig::default());
        assert!(matches!(result, Err(ProviderError::Config(_))));
    }

    #[test]
    fn label_value_is_sanitized_and_bounded() {
        assert_eq!(label_value("linux_amd64"), "linux_amd64");
        assert_eq!(label_value("a b/c"), "a-b-c");
        assert_eq!(label_value(&"x".repeat(100)).len(), 63);
    }

    #[test]
    fn create_body_carries_pool_label() {
        let provider = HetznerCloud::new("linux", test_config()).unwrap();
        let request = InstanceRequest::new("linux-agent-1").with_user_data(Some("#cloud-config"));
        let body = serde_json::to_value(provider.create_body(&request)).unwrap();

        assert_eq!(body["name"], "linux-agent-1");
        assert_eq!(body["server_type"], "cx11");
        assert_eq!(body["image"], "ubuntu-18.04");
        assert_eq!(body["datacenter"], "nbg1-dc3");
        assert_eq!(body["ssh_keys"], serde_json::json!([4711]));
        assert_eq!(body["labels"]["poolscale-pool"], "linux");
        assert_eq!(body["user_data"], "#cloud-config");
        assert_eq!(body["start_after_create"], true);
    }

    #[test]
    fn server_page_decodes_into_instances() {
        let json = r#"{
            "servers": [
                {
                    "id": 42,
                    "name": "linux-agent-1",
                    "status": "running",
                    "created": "2024-03-01T10:00:00+00:00",
                    "public_net": {"ipv4": {"ip": "1.2.3.4", "blocked": false}},
                    "labels": {"poolscale-pool": "linux"}
                }
            ],
            "meta": {"pagination": {"page": 1, "per_page": 50, "next_page": null, "last_page": 1}}
        }"#;
        let page: ServerPage = serde_json::from_str(json).unwrap();
        assert_eq!(page.meta.pagination.next_page, None);

        let inst = page.servers.into_iter().next().unwrap().into_instance(Utc::now());
        assert_eq!(inst.id, "42");
        assert_eq!(inst.provider, ProviderKind::HetznerCloud);
        assert_eq!(inst.address.as_deref(), Some("1.2.3.4"));
        assert_eq!(inst.state, InstanceState::Running);
    }

    #[test]
    fn server_without_public_ip() {
        let json = r#"{"server": {"id": 7, "name": "n", "created": "2024-03-01T10:00:00Z", "public_net": {"ipv4": null}}}"#;
        let envelope: ServerEnvelope = serde_json::from_str(json).unwrap();
        let inst = envelope.server.into_instance(Utc::now());
        assert_eq!(inst.address, None);
    }

    // ── Against a mock API ──

    fn server_json(id: u64, name: &str) -> String {
        format!(
            r#"{{"id": {id}, "name": "{name}", "created": "2024-03-01T10:00:00+00:00",
                "public_net": {{"ipv4": {{"ip": "1.2.3.{id}"}}}}}}"#
        )
    }

    fn page(page: u32) -> Matcher {
        Matcher::AllOf(vec![
            Matcher::UrlEncoded("label_selector".into(), "poolscale-pool=linux".into()),
            Matcher::UrlEncoded("page".into(), page.to_string()),
        ])
    }

    fn servers_page(servers: &[String], next_page: Option<u32>) -> String {
        let next = next_page.map_or("null".to_string(), |n| n.to_string());
        format!(
            r#"{{"servers": [{}], "meta": {{"pagination": {{"next_page": {next}}}}}}}"#,
            servers.join(", ")
        )
    }

    #[tokio::test]
    async fn destroy_treats_missing_server_as_done() {
        let mut server = Server::new_async().await;
        let gone = server
            .mock("DELETE", "/servers/42")
            .match_header("authorization", "Bearer hz-token")
            .with_status(404)
            .with_header("content-type", "application/json")
            .with_body(r#"{"error": {"code": "not_found", "message": "server with ID '42' not found"}}"#)
            .create_async()
            .await;

        let provider = HetznerCloud::new("linux", test_config()).unwrap().with_endpoint(&server.url());
        provider.destroy("42").await.unwrap();
        gone.assert_async().await;
    }

    #[tokio::test]
    async fn destroy_surfaces_other_failures() {
        let mut server = Server::new_async().await;
        let locked = server
            .mock("DELETE", "/servers/42")
            .with_status(423)
            .with_body(r#"{"error": {"code": "locked", "message": "server is locked"}}"#)
            .create_async()
            .await;

        let provider = HetznerCloud::new("linux", test_config()).unwrap().with_endpoint(&server.url());
        let err = provider.destroy("42").await.unwrap_err();
        assert_eq!(err, ProviderError::Api { status: 423, message: "server is locked".into() });
        locked.assert_async().await;
    }

    #[tokio::test]
    async fn create_maps_throttling_and_server_errors() {
        let mut server = Server::new_async().await;
        let provider = HetznerCloud::new("linux", test_config()).unwrap().with_endpoint(&server.url());
        let request = InstanceRequest::new("linux-agent-1");

        let throttled = server
            .mock("POST", "/servers")
            .with_status(429)
            .with_header("content-type", "application/json")
            .with_body(r#"{"error": {"code": "rate_limit_exceeded", "message": "limit of 3600 requests per hour reached"}}"#)
            .create_async()
            .await;
        let err = provider.create(&request).await.unwrap_err();
        assert!(matches!(err, ProviderError::RateLimited(ref m) if m.contains("3600")));
        throttled.assert_async().await;
        throttled.remove_async().await;

        let failing = server.mock("POST", "/servers").with_status(500).create_async().await;
        let err = provider.create(&request).await.unwrap_err();
        assert!(matches!(err, ProviderError::Api { status: 500, .. }));
        assert!(err.is_ambiguous());
        failing.assert_async().await;
    }

    #[tokio::test]
    async fn list_follows_next_page_until_null() {
        let mut server = Server::new_async().await;
        let first = server
            .mock("GET", "/servers")
            .match_header("authorization", "Bearer hz-token")
            .match_query(page(1))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(servers_page(&[server_json(1, "linux-agent-a")], Some(2)))
            .expect(1)
            .create_async()
            .await;
        let second = server
            .mock("GET", "/servers")
            .match_query(page(2))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(servers_page(&[server_json(2, "linux-agent-b")], None))
            .expect(1)
            .create_async()
            .await;
        let third = server.mock("GET", "/servers").match_query(page(3)).expect(0).create_async().await;

        let provider = HetznerCloud::new("linux", test_config()).unwrap().with_endpoint(&server.url());
        let listed = provider.list().await.unwrap();
        let ids: Vec<&str> = listed.iter().map(|i| i.id.as_str()).collect();
        assert_eq!(ids, vec!["1", "2"]);
        assert_eq!(listed[1].address.as_deref(), Some("1.2.3.2"));
        first.assert_async().await;
        second.assert_async().await;
        third.assert_async().await;
    }

    #[tokio::test]
    async fn list_stops_when_next_page_does_not_advance() {
        let mut server = Server::new_async().await;
        let only = server
            .mock("GET", "/servers")
            .match_query(page(1))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(servers_page(&[server_json(1, "linux-agent-a")], Some(1)))
            .expect(1)
            .create_async()
            .await;

        let provider = HetznerCloud::new("linux", test_config()).unwrap().with_endpoint(&server.url());
        assert_eq!(provider.list().await.unwrap().len(), 1);
        only.assert_async().await;
    }
}
