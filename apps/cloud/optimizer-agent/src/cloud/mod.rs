//! Cloud provider adapter
//!
//! The provider seam: everything the agent does to cloud resources goes
//! through the [`CloudAdapter`] trait so the migration engine and the
//! periodic tasks can be tested against a mock.

pub mod aws;

use std::collections::HashMap;

use async_trait::async_trait;
use thiserror::Error;

use crate::models::{pool_id, LeaseClass, PriceSample};

/// Error type for cloud adapter operations
#[derive(Error, Debug)]
pub enum CloudError {
    #[error("cloud API error: {0}")]
    Api(String),

    #[error("instance {0} not found")]
    InstanceNotFound(String),

    #[error("image {0} did not become available within {1} poll attempts")]
    ImageTimeout(String, usize),

    #[error("instance {0} did not reach the running state within {1} poll attempts")]
    LaunchTimeout(String, usize),

    #[error("no pricing catalog location known for region {0}")]
    UnsupportedRegion(String),

    #[error("malformed pricing payload: {0}")]
    Pricing(String),
}

pub type CloudResult<T> = Result<T, CloudError>;

/// Structured description of one instance.
#[derive(Debug, Clone, PartialEq)]
pub struct InstanceDetails {
    pub instance_id: String,
    pub instance_type: String,
    pub state: String,
    pub lease_class: LeaseClass,
    pub zone: String,
    pub image_id: String,
    pub subnet_id: Option<String>,
    pub security_groups: Vec<String>,
    pub key_name: Option<String>,
    pub iam_profile_arn: Option<String>,
    pub tags: HashMap<String, String>,
    /// Whether the first network interface carries an auto-assigned public
    /// address; a successor must request the same policy.
    pub public_ip_on_first_interface: bool,
    pub block_device_count: usize,
}

impl InstanceDetails {
    /// Pool identifier, present iff the instance holds a reclaimable lease.
    pub fn pool_id(&self) -> Option<String> {
        (self.lease_class == LeaseClass::Reclaimable)
            .then(|| pool_id(&self.instance_type, &self.zone))
    }
}

/// Launch configuration for a successor instance, assembled from the
/// predecessor's details plus the freshly created image.
#[derive(Debug, Clone, PartialEq)]
pub struct LaunchPlan {
    pub image_id: String,
    pub instance_type: String,
    pub subnet_id: Option<String>,
    pub security_groups: Vec<String>,
    pub key_name: Option<String>,
    pub iam_profile_arn: Option<String>,
    pub tags: HashMap<String, String>,
    pub associate_public_ip: bool,
    pub parent_instance_id: String,
    pub target: LeaseClass,
}

impl LaunchPlan {
    pub fn from_details(details: &InstanceDetails, image_id: &str, target: LeaseClass) -> Self {
        Self {
            image_id: image_id.to_string(),
            instance_type: details.instance_type.clone(),
            subnet_id: details.subnet_id.clone(),
            security_groups: details.security_groups.clone(),
            key_name: details.key_name.clone(),
            iam_profile_arn: details.iam_profile_arn.clone(),
            tags: details.tags.clone(),
            associate_public_ip: details.public_ip_on_first_interface,
            parent_instance_id: details.instance_id.clone(),
            target,
        }
    }
}

/// Capability surface over the provider's instance and pricing APIs.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait CloudAdapter: Send + Sync {
    /// Fetch a structured description of one instance.
    async fn describe_instance(&self, instance_id: &str) -> CloudResult<InstanceDetails>;

    /// Lease class and pool of one instance. Unknown when the describe fails.
    async fn current_lease(&self, instance_id: &str) -> (LeaseClass, Option<String>);

    /// Create a no-reboot image of a running instance and wait until it is
    /// available. Returns the image id.
    async fn create_image(&self, instance_id: &str, name: &str) -> CloudResult<String>;

    /// Launch one instance from the plan under its target lease class and
    /// wait until it is running. Returns the new instance id.
    async fn launch_instance(&self, plan: &LaunchPlan) -> CloudResult<String>;

    /// Request termination; returns once the provider accepts the request.
    async fn terminate_instance(&self, instance_id: &str) -> CloudResult<()>;

    /// Recent reclaimable price, one sample per zone, for an instance type.
    async fn reclaimable_prices(&self, instance_type: &str) -> CloudResult<Vec<PriceSample>>;

    /// Catalog hourly rate for a fixed lease on an instance type.
    async fn fixed_price(&self, instance_type: &str) -> CloudResult<f64>;
}
