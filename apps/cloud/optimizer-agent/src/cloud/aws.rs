//! AWS implementation of the cloud adapter
//!
//! EC2 for instance lifecycle and reclaimable price history, the Pricing
//! catalog for fixed hourly rates. Credentials come from the SDK default
//! chain (environment, instance profile, shared config).

use std::collections::HashSet;
use std::time::Duration;

use async_trait::async_trait;
use aws_config::Region;
use aws_sdk_ec2::types::{
    IamInstanceProfileSpecification, ImageState, Instance, InstanceInterruptionBehavior,
    InstanceLifecycleType, InstanceMarketOptionsRequest, InstanceNetworkInterfaceSpecification,
    InstanceStateName, InstanceType, MarketType, ResourceType, SpotInstanceType,
    SpotMarketOptions, Tag, TagSpecification,
};
use aws_sdk_pricing::types::{Filter, FilterType};
use chrono::{DateTime, Utc};
use tokio::time::sleep;
use tracing::{debug, info, warn};

use super::{CloudAdapter, CloudError, CloudResult, InstanceDetails, LaunchPlan};
use crate::models::{pool_id, LeaseClass, PriceSample};

/// Image availability poll: 15 s x 40 attempts = 10 min budget.
const IMAGE_WAIT_INTERVAL: Duration = Duration::from_secs(15);
const IMAGE_WAIT_ATTEMPTS: usize = 40;

/// Running-state poll for freshly launched instances.
const RUNNING_WAIT_INTERVAL: Duration = Duration::from_secs(5);
const RUNNING_WAIT_ATTEMPTS: usize = 60;

/// How far back to look for reclaimable price history.
const PRICE_HISTORY_WINDOW: chrono::Duration = chrono::Duration::minutes(5);

/// The pricing catalog is only served from this region.
const PRICING_API_REGION: &str = "us-east-1";

/// EC2-backed [`CloudAdapter`].
pub struct Ec2Adapter {
    ec2: aws_sdk_ec2::Client,
    pricing: aws_sdk_pricing::Client,
    region: String,
}

impl Ec2Adapter {
    /// Build clients for the node's region. The pricing client is pinned to
    /// the catalog endpoint region regardless.
    pub async fn new(region: &str) -> Self {
        let config = aws_config::from_env()
            .region(Region::new(region.to_string()))
            .load()
            .await;

        let pricing_config = aws_sdk_pricing::config::Builder::from(&config)
            .region(Region::new(PRICING_API_REGION))
            .build();

        Self {
            ec2: aws_sdk_ec2::Client::new(&config),
            pricing: aws_sdk_pricing::Client::from_conf(pricing_config),
            region: region.to_string(),
        }
    }

    async fn describe(&self, instance_id: &str) -> CloudResult<InstanceDetails> {
        let output = self
            .ec2
            .describe_instances()
            .instance_ids(instance_id)
            .send()
            .await
            .map_err(api_err)?;

        let instance = output
            .reservations()
            .first()
            .and_then(|reservation| reservation.instances().first())
            .ok_or_else(|| CloudError::InstanceNotFound(instance_id.to_string()))?;

        Ok(details_from_instance(instance))
    }

    async fn instance_state(&self, instance_id: &str) -> Option<InstanceStateName> {
        match self
            .ec2
            .describe_instances()
            .instance_ids(instance_id)
            .send()
            .await
        {
            Ok(output) => output
                .reservations()
                .first()
                .and_then(|reservation| reservation.instances().first())
                .and_then(|instance| instance.state())
                .and_then(|state| state.name())
                .cloned(),
            Err(e) => {
                warn!(instance_id, error = %e, "instance state probe failed, retrying");
                None
            }
        }
    }

    async fn wait_until_running(&self, instance_id: &str) -> CloudResult<()> {
        for attempt in 1..=RUNNING_WAIT_ATTEMPTS {
            sleep(RUNNING_WAIT_INTERVAL).await;
            if matches!(
                self.instance_state(instance_id).await,
                Some(InstanceStateName::Running)
            ) {
                info!(instance_id, "instance is running");
                return Ok(());
            }
            debug!(instance_id, attempt, "instance not yet running");
        }
        Err(CloudError::LaunchTimeout(
            instance_id.to_string(),
            RUNNING_WAIT_ATTEMPTS,
        ))
    }
}

#[async_trait]
impl CloudAdapter for Ec2Adapter {
    async fn describe_instance(&self, instance_id: &str) -> CloudResult<InstanceDetails> {
        self.describe(instance_id).await
    }

    async fn current_lease(&self, instance_id: &str) -> (LeaseClass, Option<String>) {
        match self.describe(instance_id).await {
            Ok(details) => {
                let pool = details.pool_id();
                (details.lease_class, pool)
            }
            Err(e) => {
                warn!(instance_id, error = %e, "lease probe failed");
                (LeaseClass::Unknown, None)
            }
        }
    }

    async fn create_image(&self, instance_id: &str, name: &str) -> CloudResult<String> {
        info!(instance_id, name, "creating image");

        let output = self
            .ec2
            .create_image()
            .instance_id(instance_id)
            .name(name)
            .description(format!(
                "Automated snapshot for lease optimization - {}",
                Utc::now().format("%Y-%m-%d %H:%M:%S UTC")
            ))
            .no_reboot(true)
            .send()
            .await
            .map_err(api_err)?;

        let image_id = output
            .image_id()
            .ok_or_else(|| CloudError::Api("create_image returned no image id".to_string()))?
            .to_string();

        info!(image_id = %image_id, "image creation started, waiting for availability");

        for attempt in 1..=IMAGE_WAIT_ATTEMPTS {
            sleep(IMAGE_WAIT_INTERVAL).await;
            let state = match self
                .ec2
                .describe_images()
                .image_ids(&image_id)
                .send()
                .await
            {
                Ok(output) => output
                    .images()
                    .first()
                    .and_then(|image| image.state())
                    .cloned(),
                Err(e) => {
                    warn!(image_id = %image_id, error = %e, "image describe failed, retrying");
                    None
                }
            };

            if matches!(state, Some(ImageState::Available)) {
                info!(image_id = %image_id, "image is available");
                return Ok(image_id);
            }
            debug!(image_id = %image_id, attempt, "image not yet available");
        }

        Err(CloudError::ImageTimeout(image_id, IMAGE_WAIT_ATTEMPTS))
    }

    async fn launch_instance(&self, plan: &LaunchPlan) -> CloudResult<String> {
        let tags: Vec<Tag> = merged_tags(plan, Utc::now())
            .into_iter()
            .map(|(key, value)| Tag::builder().key(key).value(value).build())
            .collect();

        let mut request = self
            .ec2
            .run_instances()
            .image_id(&plan.image_id)
            .instance_type(InstanceType::from(plan.instance_type.as_str()))
            .min_count(1)
            .max_count(1)
            .tag_specifications(
                TagSpecification::builder()
                    .resource_type(ResourceType::Instance)
                    .set_tags(Some(tags))
                    .build(),
            );

        if let Some(key_name) = &plan.key_name {
            request = request.key_name(key_name);
        }

        if let Some(arn) = &plan.iam_profile_arn {
            request = request.iam_instance_profile(
                IamInstanceProfileSpecification::builder().arn(arn).build(),
            );
        }

        // Preserve the predecessor's subnet placement and public-ip policy.
        match &plan.subnet_id {
            Some(subnet_id) => {
                request = request.network_interfaces(
                    InstanceNetworkInterfaceSpecification::builder()
                        .device_index(0)
                        .subnet_id(subnet_id)
                        .set_groups(Some(plan.security_groups.clone()))
                        .associate_public_ip_address(plan.associate_public_ip)
                        .build(),
                );
            }
            None => {
                request = request.set_security_group_ids(Some(plan.security_groups.clone()));
            }
        }

        if plan.target == LeaseClass::Reclaimable {
            request = request.instance_market_options(
                InstanceMarketOptionsRequest::builder()
                    .market_type(MarketType::Spot)
                    .spot_options(
                        SpotMarketOptions::builder()
                            .spot_instance_type(SpotInstanceType::Persistent)
                            .instance_interruption_behavior(InstanceInterruptionBehavior::Stop)
                            .build(),
                    )
                    .build(),
            );
        }

        info!(
            target = %plan.target,
            image_id = %plan.image_id,
            instance_type = %plan.instance_type,
            "launching successor instance"
        );

        let output = request.send().await.map_err(api_err)?;
        let instance_id = output
            .instances()
            .first()
            .and_then(|instance| instance.instance_id())
            .ok_or_else(|| CloudError::Api("run request returned no instance".to_string()))?
            .to_string();

        info!(instance_id, "instance launched, waiting for running state");
        self.wait_until_running(&instance_id).await?;
        Ok(instance_id)
    }

    async fn terminate_instance(&self, instance_id: &str) -> CloudResult<()> {
        self.ec2
            .terminate_instances()
            .instance_ids(instance_id)
            .send()
            .await
            .map_err(api_err)?;
        info!(instance_id, "termination requested");
        Ok(())
    }

    async fn reclaimable_prices(&self, instance_type: &str) -> CloudResult<Vec<PriceSample>> {
        let start = Utc::now() - PRICE_HISTORY_WINDOW;
        let output = self
            .ec2
            .describe_spot_price_history()
            .instance_types(InstanceType::from(instance_type))
            .product_descriptions("Linux/UNIX")
            .start_time(aws_smithy_types::DateTime::from_millis(
                start.timestamp_millis(),
            ))
            .max_results(100)
            .send()
            .await
            .map_err(api_err)?;

        // One sample per zone, first (most recent) occurrence wins.
        let mut seen = HashSet::new();
        let mut samples = Vec::new();
        for item in output.spot_price_history() {
            let Some(zone) = item.availability_zone() else {
                continue;
            };
            if !seen.insert(zone.to_string()) {
                continue;
            }
            let Some(price) = item.spot_price().and_then(|p| p.parse::<f64>().ok()) else {
                continue;
            };
            samples.push(PriceSample {
                zone: zone.to_string(),
                pool_id: pool_id(instance_type, zone),
                price,
            });
        }

        debug!(instance_type, count = samples.len(), "collected reclaimable price samples");
        Ok(samples)
    }

    async fn fixed_price(&self, instance_type: &str) -> CloudResult<f64> {
        let location = region_location(&self.region)
            .ok_or_else(|| CloudError::UnsupportedRegion(self.region.clone()))?;

        let mut request = self
            .pricing
            .get_products()
            .service_code("AmazonEC2")
            .max_results(1);

        for (field, value) in [
            ("instanceType", instance_type),
            ("location", location),
            ("operatingSystem", "Linux"),
            ("tenancy", "Shared"),
            ("preInstalledSw", "NA"),
            ("capacitystatus", "Used"),
        ] {
            request = request.filters(
                Filter::builder()
                    .r#type(FilterType::TermMatch)
                    .field(field)
                    .value(value)
                    .build()
                    .map_err(api_err)?,
            );
        }

        let output = request.send().await.map_err(api_err)?;
        let entry = output.price_list().first().ok_or_else(|| {
            CloudError::Pricing(format!("empty price list for {instance_type} in {location}"))
        })?;

        let price = parse_catalog_entry(entry)?;
        debug!(instance_type, price, "fetched fixed hourly rate");
        Ok(price)
    }
}

fn api_err<E: std::fmt::Display>(e: E) -> CloudError {
    CloudError::Api(e.to_string())
}

fn details_from_instance(instance: &Instance) -> InstanceDetails {
    let lease_class = match instance.instance_lifecycle() {
        Some(InstanceLifecycleType::Spot) => LeaseClass::Reclaimable,
        _ => LeaseClass::Fixed,
    };

    InstanceDetails {
        instance_id: instance.instance_id().unwrap_or_default().to_string(),
        instance_type: instance
            .instance_type()
            .map(|t| t.as_str().to_string())
            .unwrap_or_default(),
        state: instance
            .state()
            .and_then(|state| state.name())
            .map(|name| name.as_str().to_string())
            .unwrap_or_default(),
        lease_class,
        zone: instance
            .placement()
            .and_then(|placement| placement.availability_zone())
            .unwrap_or_default()
            .to_string(),
        image_id: instance.image_id().unwrap_or_default().to_string(),
        subnet_id: instance.subnet_id().map(str::to_string),
        security_groups: instance
            .security_groups()
            .iter()
            .filter_map(|group| group.group_id())
            .map(str::to_string)
            .collect(),
        key_name: instance.key_name().map(str::to_string),
        iam_profile_arn: instance
            .iam_instance_profile()
            .and_then(|profile| profile.arn())
            .map(str::to_string),
        tags: instance
            .tags()
            .iter()
            .filter_map(|tag| Some((tag.key()?.to_string(), tag.value()?.to_string())))
            .collect(),
        public_ip_on_first_interface: instance
            .network_interfaces()
            .first()
            .and_then(|interface| interface.association())
            .and_then(|association| association.public_ip())
            .is_some(),
        block_device_count: instance.block_device_mappings().len(),
    }
}

/// Tags for a successor: the predecessor's own tags plus the mandatory
/// operator markers. Provider-reserved keys cannot be re-applied and stale
/// operator markers from an earlier migration must not survive.
fn merged_tags(plan: &LaunchPlan, created_at: DateTime<Utc>) -> Vec<(String, String)> {
    let mut tags: Vec<(String, String)> = plan
        .tags
        .iter()
        .filter(|(key, _)| {
            !key.starts_with("aws:") && !matches!(key.as_str(), "managed" | "parent" | "created")
        })
        .map(|(key, value)| (key.clone(), value.clone()))
        .collect();
    tags.sort();

    tags.push(("managed".to_string(), "true".to_string()));
    tags.push(("parent".to_string(), plan.parent_instance_id.clone()));
    tags.push(("created".to_string(), created_at.to_rfc3339()));
    tags
}

/// Catalog pricing region names for the regions the fleet runs in. Regions
/// outside this table are a configuration error, not a silent zero.
fn region_location(region: &str) -> Option<&'static str> {
    match region {
        "us-east-1" => Some("US East (N. Virginia)"),
        "us-east-2" => Some("US East (Ohio)"),
        "us-west-2" => Some("US West (Oregon)"),
        "eu-west-1" => Some("EU (Ireland)"),
        "ap-south-1" => Some("Asia Pacific (Mumbai)"),
        "ap-southeast-1" => Some("Asia Pacific (Singapore)"),
        _ => None,
    }
}

/// Dig the hourly USD rate out of one pricing catalog entry.
fn parse_catalog_entry(raw: &str) -> CloudResult<f64> {
    let value: serde_json::Value =
        serde_json::from_str(raw).map_err(|e| CloudError::Pricing(e.to_string()))?;

    let on_demand = value
        .get("terms")
        .and_then(|terms| terms.get("OnDemand"))
        .and_then(|on_demand| on_demand.as_object())
        .ok_or_else(|| CloudError::Pricing("missing OnDemand terms".to_string()))?;

    on_demand
        .values()
        .next()
        .and_then(|term| term.get("priceDimensions"))
        .and_then(|dimensions| dimensions.as_object())
        .and_then(|dimensions| dimensions.values().next())
        .and_then(|dimension| dimension.get("pricePerUnit"))
        .and_then(|per_unit| per_unit.get("USD"))
        .and_then(|usd| usd.as_str())
        .and_then(|usd| usd.parse::<f64>().ok())
        .ok_or_else(|| CloudError::Pricing("missing USD price dimension".to_string()))
}
