//! Drone server queue adapter.
//!
//! `GET /api/queue` returns every stage that has not finished. A stage is
//! counted when its status is `pending` and its platform fields plus
//! labels satisfy the selector.

use std::collections::HashMap;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::debug;

use poolscale_core::{Selector, ServerConfig};

use crate::error::{QueueError, QueueResult};
use crate::queue::BuildQueue;

/// Reads pending stages from a Drone server.
pub struct DroneQueue {
    client: reqwest::Client,
    url: String,
    token: String,
}

impl DroneQueue {
    pub fn new(server: &ServerConfig) -> QueueResult<Self> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("poolscale/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| QueueError::Transport(e.to_string()))?;
        Ok(Self {
            client,
            url: format!("{}/api/queue", server.url()),
            token: server.token.clone(),
        })
    }

    /// Point at another server root, keeping the queue path.
    pub fn with_endpoint(mut self, base: &str) -> Self {
        self.url = format!("{}/api/queue", base.trim_end_matches('/'));
        self
    }
}

#[derive(Debug, Deserialize)]
struct Stage {
    #[serde(default)]
    status: String,
    #[serde(default)]
    os: String,
    #[serde(default)]
    arch: String,
    #[serde(default)]
    variant: String,
    #[serde(default)]
    kernel: String,
    #[serde(default)]
    labels: Option<HashMap<String, String>>,
}

impl Stage {
    /// Labels the selector is matched against. Explicit labels win over
    /// the platform fields of the same name.
    fn selector_labels(&self) -> HashMap<String, String> {
        let mut labels = HashMap::new();
        for (key, value) in [
            ("os", &self.os),
            ("arch", &self.arch),
            ("variant", &self.variant),
            ("kernel", &self.kernel),
        ] {
            if !value.is_empty() {
                labels.insert(key.to_string(), value.clone());
            }
        }
        if let Some(explicit) = &self.labels {
            labels.extend(explicit.iter().map(|(k, v)| (k.clone(), v.clone())));
        }
        labels
    }
}

fn count_pending(stages: &[Stage], selector: &Selector) -> u32 {
    let count = stages
        .iter()
        .filter(|s| s.status == "pending")
        .filter(|s| selector.matches(&s.selector_labels()))
        .count();
    u32::try_from(count).unwrap_or(u32::MAX)
}

fn transport_error(e: reqwest::Error) -> QueueError {
    if e.is_timeout() {
        QueueError::Timeout(e.to_string())
    } else if e.is_decode() {
        QueueError::Decode(e.to_string())
    } else {
        QueueError::Transport(e.to_string())
    }
}

#[async_trait]
impl BuildQueue for DroneQueue {
    async fn pending(&self, selector: &Selector) -> QueueResult<u32> {
        let resp = self
            .client
            .get(&self.url)
            .bearer_auth(&self.token)
            .send()
            .await
            .map_err(transport_error)?;

        let status = resp.status();
        if !status.is_success() {
            let message = resp.text().await.unwrap_or_default();
            return Err(QueueError::Api {
                status: status.as_u16(),
                message: message.chars().take(200).collect(),
            });
        }

        let stages: Vec<Stage> = resp.json().await.map_err(transport_error)?;
        let pending = count_pending(&stages, selector);
        debug!(url = %self.url, stages = stages.len(), pending, "queue read");
        Ok(pending)
    }
}
