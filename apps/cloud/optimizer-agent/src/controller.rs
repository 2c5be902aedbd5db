//! Controller client
//!
//! Authenticated JSON calls to the central controller. Every request carries
//! the client bearer token and an explicit timeout; transport failures are
//! surfaced to the caller, which retries on its next tick. The trait is the
//! second mockable seam of the agent.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::models::{ControlFlags, LeaseClass, MigrationRecord, NodeIdentity, PendingCommand, PriceSample};

const REGISTER_TIMEOUT: Duration = Duration::from_secs(30);
const HEARTBEAT_TIMEOUT: Duration = Duration::from_secs(10);
const CONFIG_TIMEOUT: Duration = Duration::from_secs(10);
const PRICING_REPORT_TIMEOUT: Duration = Duration::from_secs(30);
const COMMANDS_TIMEOUT: Duration = Duration::from_secs(10);
const ACK_TIMEOUT: Duration = Duration::from_secs(10);
const SWITCH_REPORT_TIMEOUT: Duration = Duration::from_secs(30);

/// Error type for controller calls
#[derive(Error, Debug)]
pub enum ControllerError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("controller returned {status}: {body}")]
    Status { status: StatusCode, body: String },

    #[error("malformed controller response: {0}")]
    Decode(String),
}

pub type ControllerResult<T> = Result<T, ControllerError>;

/// Registration payload: the node's full identity.
#[derive(Debug, Clone, Serialize)]
pub struct RegisterRequest {
    pub client_token: String,
    pub hostname: String,
    pub instance_id: String,
    pub instance_type: String,
    pub region: String,
    pub az: String,
    pub ami_id: String,
    pub agent_version: String,
}

impl RegisterRequest {
    pub fn new(client_token: &str, identity: &NodeIdentity) -> Self {
        Self {
            client_token: client_token.to_string(),
            hostname: identity.hostname.clone(),
            instance_id: identity.instance_id.clone(),
            instance_type: identity.instance_type.clone(),
            region: identity.region.clone(),
            az: identity.zone.clone(),
            ami_id: identity.image_id.clone(),
            agent_version: crate::AGENT_VERSION.to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RegisterResponse {
    pub agent_id: String,
    #[serde(default)]
    pub config: ControlFlags,
}

#[derive(Debug, Serialize)]
struct HeartbeatRequest<'a> {
    status: &'a str,
    monitored_instances: &'a [String],
}

#[derive(Debug, Default, Deserialize)]
struct HeartbeatResponse {
    #[serde(default)]
    config: Option<ControlFlags>,
}

/// The identity block of a pricing report.
#[derive(Debug, Clone, Serialize)]
pub struct InstanceReport {
    pub instance_id: String,
    pub instance_type: String,
    pub region: String,
    pub az: String,
    pub ami_id: String,
    pub current_mode: LeaseClass,
    pub current_pool_id: Option<String>,
}

impl From<&NodeIdentity> for InstanceReport {
    fn from(identity: &NodeIdentity) -> Self {
        Self {
            instance_id: identity.instance_id.clone(),
            instance_type: identity.instance_type.clone(),
            region: identity.region.clone(),
            az: identity.zone.clone(),
            ami_id: identity.image_id.clone(),
            current_mode: identity.lease_class,
            current_pool_id: identity.pool_id.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct OnDemandPrice {
    pub price: f64,
    pub source: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct PricingReport {
    pub instance: InstanceReport,
    pub on_demand_price: OnDemandPrice,
    pub spot_pools: Vec<PriceSample>,
}

#[derive(Debug, Serialize)]
struct AckRequest {
    command_id: i64,
}

/// Capability surface over the controller API.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ControllerApi: Send + Sync {
    /// Exchange identity for an agent id and the initial control flags.
    async fn register(&self, request: &RegisterRequest) -> ControllerResult<RegisterResponse>;

    /// Liveness report. Returns the current flags when the controller
    /// includes them in the response.
    async fn heartbeat(
        &self,
        agent_id: &str,
        status: &str,
        monitored_instances: &[String],
    ) -> ControllerResult<Option<ControlFlags>>;

    /// Read the control flags on demand.
    async fn get_config(&self, agent_id: &str) -> ControllerResult<ControlFlags>;

    /// Publish identity, fixed price and reclaimable pool samples.
    async fn pricing_report(&self, agent_id: &str, report: &PricingReport)
        -> ControllerResult<()>;

    /// Commands addressed to this agent, in controller order.
    async fn pending_commands(&self, agent_id: &str) -> ControllerResult<Vec<PendingCommand>>;

    /// Acknowledge one command by id.
    async fn mark_command_executed(&self, agent_id: &str, command_id: i64)
        -> ControllerResult<()>;

    /// Publish one completed migration.
    async fn switch_report(&self, agent_id: &str, record: &MigrationRecord)
        -> ControllerResult<()>;
}

/// HTTP implementation of [`ControllerApi`].
pub struct ControllerClient {
    base_url: String,
    token: String,
    client: Client,
}

impl ControllerClient {
    pub fn new(base_url: impl Into<String>, token: impl Into<String>) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Self {
            base_url,
            token: token.into(),
            client: Client::new(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}/api{}", self.base_url, path)
    }

    async fn check(response: reqwest::Response) -> ControllerResult<reqwest::Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(ControllerError::Status { status, body })
    }
}

#[async_trait]
impl ControllerApi for ControllerClient {
    async fn register(&self, request: &RegisterRequest) -> ControllerResult<RegisterResponse> {
        let response = self
            .client
            .post(self.url("/agents/register"))
            .bearer_auth(&self.token)
            .timeout(REGISTER_TIMEOUT)
            .json(request)
            .send()
            .await?;

        Self::check(response)
            .await?
            .json()
            .await
            .map_err(|e| ControllerError::Decode(e.to_string()))
    }

    async fn heartbeat(
        &self,
        agent_id: &str,
        status: &str,
        monitored_instances: &[String],
    ) -> ControllerResult<Option<ControlFlags>> {
        let response = self
            .client
            .post(self.url(&format!("/agents/{agent_id}/heartbeat")))
            .bearer_auth(&self.token)
            .timeout(HEARTBEAT_TIMEOUT)
            .json(&HeartbeatRequest {
                status,
                monitored_instances,
            })
            .send()
            .await?;

        let response = Self::check(response).await?;
        // Flags are optional here; an empty or non-JSON body is still a
        // successful heartbeat.
        let parsed: HeartbeatResponse = response.json().await.unwrap_or_default();
        Ok(parsed.config)
    }

    async fn get_config(&self, agent_id: &str) -> ControllerResult<ControlFlags> {
        let response = self
            .client
            .get(self.url(&format!("/agents/{agent_id}/config")))
            .bearer_auth(&self.token)
            .timeout(CONFIG_TIMEOUT)
            .send()
            .await?;

        Self::check(response)
            .await?
            .json()
            .await
            .map_err(|e| ControllerError::Decode(e.to_string()))
    }

    async fn pricing_report(
        &self,
        agent_id: &str,
        report: &PricingReport,
    ) -> ControllerResult<()> {
        let response = self
            .client
            .post(self.url(&format!("/agents/{agent_id}/pricing-report")))
            .bearer_auth(&self.token)
            .timeout(PRICING_REPORT_TIMEOUT)
            .json(report)
            .send()
            .await?;

        Self::check(response).await?;
        debug!(pools = report.spot_pools.len(), "pricing report accepted");
        Ok(())
    }

    async fn pending_commands(&self, agent_id: &str) -> ControllerResult<Vec<PendingCommand>> {
        let response = self
            .client
            .get(self.url(&format!("/agents/{agent_id}/pending-commands")))
            .bearer_auth(&self.token)
            .timeout(COMMANDS_TIMEOUT)
            .send()
            .await?;

        Self::check(response)
            .await?
            .json()
            .await
            .map_err(|e| ControllerError::Decode(e.to_string()))
    }

    async fn mark_command_executed(
        &self,
        agent_id: &str,
        command_id: i64,
    ) -> ControllerResult<()> {
        let response = self
            .client
            .post(self.url(&format!("/agents/{agent_id}/mark-command-executed")))
            .bearer_auth(&self.token)
            .timeout(ACK_TIMEOUT)
            .json(&AckRequest { command_id })
            .send()
            .await?;

        Self::check(response).await?;
        Ok(())
    }

    async fn switch_report(
        &self,
        agent_id: &str,
        record: &MigrationRecord,
    ) -> ControllerResult<()> {
        let response = self
            .client
            .post(self.url(&format!("/agents/{agent_id}/switch-report")))
            .bearer_auth(&self.token)
            .timeout(SWITCH_REPORT_TIMEOUT)
            .json(record)
            .send()
            .await?;

        Self::check(response).await?;
        Ok(())
    }
}
