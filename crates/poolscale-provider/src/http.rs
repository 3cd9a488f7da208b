//! Shared HTTP plumbing for the REST-based adapters.

use reqwest::Response;

use crate::error::ProviderError;

pub(crate) fn client() -> Result<reqwest::Client, ProviderError> {
    reqwest::Client::builder()
        .user_agent(concat!("poolscale/", env!("CARGO_PKG_VERSION")))
        .build()
        .map_err(|e| ProviderError::Config(e.to_string()))
}

/// Classify a reqwest failure.
pub(crate) fn transport_error(e: reqwest::Error) -> ProviderError {
    if e.is_timeout() {
        ProviderError::Timeout(e.to_string())
    } else if e.is_connect() || e.is_builder() {
        ProviderError::Transport(e.to_string())
    } else if e.is_decode() {
        ProviderError::Decode(e.to_string())
    } else {
        ProviderError::Interrupted(e.to_string())
    }
}

/// Pass successful responses through; turn the rest into `ProviderError`.
pub(crate) async fn check(resp: Response) -> Result<Response, ProviderError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let body = resp.text().await.unwrap_or_default();
    Err(status_error(status.as_u16(), &body))
}

pub(crate) fn status_error(status: u16, body: &str) -> ProviderError {
    let message = error_message(body);
    match status {
        404 => ProviderError::NotFound(message),
        429 => ProviderError::RateLimited(message),
        _ => ProviderError::Api { status, message },
    }
}

/// Pull a human-readable message out of an error body.
///
/// DigitalOcean answers `{"id": .., "message": ..}`, Hetzner Cloud
/// `{"error": {"code": .., "message": ..}}`.
fn error_message(body: &str) -> String {
    if let Ok(value) = serde_json::from_str::<serde_json::Value>(body) {
        if let Some(msg) = value.get("message").and_then(|m| m.as_str()) {
            return msg.to_string();
        }
        if let Some(msg) = value
            .get("error")
            .and_then(|e| e.get("message"))
            .and_then(|m| m.as_str())
        {
            return msg.to_string();
        }
    }
    body.chars().take(200).collect()
}
