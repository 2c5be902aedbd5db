//! Instance metadata client
//!
//! Token-gated reads against the link-local instance metadata service. The
//! session token is cached with its expiry and refreshed lazily; every
//! request runs under a tight timeout so the agent fails fast on hosts that
//! are not cloud instances.

use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use reqwest::Client;
use tracing::debug;

const METADATA_BASE: &str = "http://169.254.169.254/latest/meta-data";
const TOKEN_URL: &str = "http://169.254.169.254/latest/api/token";
const TOKEN_TTL_HEADER: &str = "X-aws-ec2-metadata-token-ttl-seconds";
const TOKEN_HEADER: &str = "X-aws-ec2-metadata-token";
const TOKEN_TTL_SECONDS: i64 = 21_600;
const REQUEST_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone)]
struct CachedToken {
    value: String,
    expires_at: DateTime<Utc>,
}

impl CachedToken {
    fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

/// Client for the instance metadata service.
pub struct ImdsClient {
    client: Client,
    token: Mutex<Option<CachedToken>>,
}

impl ImdsClient {
    pub fn new() -> Self {
        Self {
            client: Client::new(),
            token: Mutex::new(None),
        }
    }

    /// Current session token, fetched on demand and cached until expiry.
    async fn token(&self) -> Option<String> {
        {
            let cached = self.token.lock().ok()?;
            if let Some(token) = cached.as_ref() {
                if !token.is_expired(Utc::now()) {
                    return Some(token.value.clone());
                }
            }
        }

        let response = self
            .client
            .put(TOKEN_URL)
            .header(TOKEN_TTL_HEADER, TOKEN_TTL_SECONDS.to_string())
            .timeout(REQUEST_TIMEOUT)
            .send()
            .await
            .ok()?;

        if !response.status().is_success() {
            debug!(status = %response.status(), "metadata token request rejected");
            return None;
        }

        let value = response.text().await.ok()?;
        if let Ok(mut cached) = self.token.lock() {
            *cached = Some(CachedToken {
                value: value.clone(),
                expires_at: Utc::now() + chrono::Duration::seconds(TOKEN_TTL_SECONDS),
            });
        }
        Some(value)
    }

    /// Fetch one metadata path. Absent on any transport or status failure.
    async fn fetch(&self, path: &str) -> Option<String> {
        let mut request = self
            .client
            .get(format!("{METADATA_BASE}/{path}"))
            .timeout(REQUEST_TIMEOUT);

        if let Some(token) = self.token().await {
            request = request.header(TOKEN_HEADER, token);
        }

        let response = match request.send().await {
            Ok(response) => response,
            Err(e) => {
                debug!(path, error = %e, "metadata request failed");
                return None;
            }
        };

        if !response.status().is_success() {
            debug!(path, status = %response.status(), "metadata request rejected");
            return None;
        }

        let body = response.text().await.ok()?;
        let value = body.trim().to_string();
        (!value.is_empty()).then_some(value)
    }

    pub async fn instance_id(&self) -> Option<String> {
        self.fetch("instance-id").await
    }

    pub async fn instance_type(&self) -> Option<String> {
        self.fetch("instance-type").await
    }

    pub async fn availability_zone(&self) -> Option<String> {
        self.fetch("placement/availability-zone").await
    }

    pub async fn image_id(&self) -> Option<String> {
        self.fetch("ami-id").await
    }

    pub async fn hostname(&self) -> Option<String> {
        match self.fetch("hostname").await {
            Some(hostname) => Some(hostname),
            None => hostname_from_env(),
        }
    }

    /// True iff this host answers the metadata service with an instance id.
    pub async fn on_cloud_host(&self) -> bool {
        matches!(self.instance_id().await, Some(id) if id.starts_with("i-"))
    }
}

impl Default for ImdsClient {
    fn default() -> Self {
        Self::new()
    }
}

fn hostname_from_env() -> Option<String> {
    std::env::var("HOSTNAME").ok().filter(|h| !h.is_empty())
}
