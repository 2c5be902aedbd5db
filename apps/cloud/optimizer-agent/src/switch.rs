//! Migration engine
//!
//! Drives one node migration to completion or failure as a linear sequence
//! of named steps. At most one migration runs per agent: a mutex enforces
//! it, and an `in_progress` flag lets the command-drain task short-circuit
//! without touching the mutex. An aborted step leaves cloud resources
//! wherever the provider got them; cleanup of orphans is the controller's
//! job, never this engine's.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use strum::Display;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::time::sleep;
use tracing::{info, warn};

use crate::cloud::{CloudAdapter, CloudError, LaunchPlan};
use crate::controller::ControllerApi;
use crate::models::{
    InstanceSnapshot, LeaseClass, MigrationRecord, NodeIdentity, PriceSample, SnapshotInfo,
    SwitchPrices, SwitchTiming,
};
use crate::state::AgentState;

/// Settle time between launch and the verification describe.
const STABILIZE_DELAY: Duration = Duration::from_secs(5);

/// The step at which a migration aborted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "snake_case")]
pub enum SwitchStep {
    Describe,
    Snapshot,
    Launch,
    Verify,
}

#[derive(Error, Debug)]
pub enum SwitchError {
    #[error("a migration is already in progress")]
    Busy,

    #[error("unsupported target lease class")]
    InvalidTarget,

    #[error("{step} failed: {source}")]
    Step {
        step: SwitchStep,
        source: CloudError,
    },
}

pub struct SwitchEngine {
    cloud: Arc<dyn CloudAdapter>,
    controller: Arc<dyn ControllerApi>,
    state: Arc<AgentState>,
    gate: Mutex<()>,
    stabilize_delay: Duration,
    fixed_price_ttl: Duration,
}

impl SwitchEngine {
    pub fn new(
        cloud: Arc<dyn CloudAdapter>,
        controller: Arc<dyn ControllerApi>,
        state: Arc<AgentState>,
        fixed_price_ttl: Duration,
    ) -> Self {
        Self {
            cloud,
            controller,
            state,
            gate: Mutex::new(()),
            stabilize_delay: STABILIZE_DELAY,
            fixed_price_ttl,
        }
    }

    /// Override the post-launch stabilization delay.
    pub fn with_stabilize_delay(mut self, delay: Duration) -> Self {
        self.stabilize_delay = delay;
        self
    }

    /// Migrate the current node to `target`. Returns once the migration has
    /// completed or aborted; a second caller gets [`SwitchError::Busy`].
    pub async fn execute_switch(
        &self,
        target: LeaseClass,
        target_pool_id: Option<&str>,
        trigger: &str,
    ) -> Result<(), SwitchError> {
        if target == LeaseClass::Unknown {
            return Err(SwitchError::InvalidTarget);
        }

        let Ok(_guard) = self.gate.try_lock() else {
            warn!("migration already in progress, refusing another");
            return Err(SwitchError::Busy);
        };

        self.state.set_switch_in_progress(true);
        let result = self.run(target, target_pool_id, trigger).await;
        self.state.set_switch_in_progress(false);
        result
    }

    async fn run(
        &self,
        target: LeaseClass,
        target_pool_id: Option<&str>,
        trigger: &str,
    ) -> Result<(), SwitchError> {
        let old = self.state.identity().await;
        let initiated = Utc::now();

        info!(
            from = %old.lease_class,
            to = %target,
            target_pool_id = target_pool_id.unwrap_or("-"),
            trigger,
            "starting instance switch"
        );

        // DESCRIBE
        let details = self
            .cloud
            .describe_instance(&old.instance_id)
            .await
            .map_err(|source| SwitchError::Step {
                step: SwitchStep::Describe,
                source,
            })?;

        // SNAPSHOT
        let image_name = format!(
            "optimizer-{}-{}",
            old.instance_id,
            Utc::now().format("%Y%m%d-%H%M%S")
        );
        let image_id = self
            .cloud
            .create_image(&old.instance_id, &image_name)
            .await
            .map_err(|source| SwitchError::Step {
                step: SwitchStep::Snapshot,
                source,
            })?;

        // PLAN
        let plan = LaunchPlan::from_details(&details, &image_id, target);

        // LAUNCH
        let new_instance_id = self
            .cloud
            .launch_instance(&plan)
            .await
            .map_err(|source| SwitchError::Step {
                step: SwitchStep::Launch,
                source,
            })?;
        let new_instance_ready = Utc::now();
        info!(instance_id = %new_instance_id, "successor is running");

        // VERIFY
        sleep(self.stabilize_delay).await;
        let new_details = self
            .cloud
            .describe_instance(&new_instance_id)
            .await
            .map_err(|source| SwitchError::Step {
                step: SwitchStep::Verify,
                source,
            })?;
        let new_lease = new_details.lease_class;
        let new_pool = new_details.pool_id();
        let traffic_switched = Utc::now();

        if new_lease != target {
            // Capacity race: report what actually happened and let the
            // controller decide whether to re-issue.
            warn!(
                requested = %target,
                observed = %new_lease,
                "successor lease class differs from the requested one"
            );
        }

        // PRICE_CAPTURE
        let on_demand = self.capture_fixed_price(&old.instance_type).await;
        let pools = match self.cloud.reclaimable_prices(&old.instance_type).await {
            Ok(pools) => pools,
            Err(e) => {
                warn!(error = %e, "reclaimable price capture failed");
                Vec::new()
            }
        };
        let old_spot = if old.lease_class == LeaseClass::Reclaimable {
            pool_price(&pools, old.pool_id.as_deref())
        } else {
            0.0
        };
        let new_spot = if new_lease == LeaseClass::Reclaimable {
            pool_price(&pools, new_pool.as_deref())
        } else {
            0.0
        };

        // TERMINATE_OLD
        let flags = self.state.flags().await;
        let old_instance_terminated = if flags.auto_terminate_enabled {
            match self.cloud.terminate_instance(&old.instance_id).await {
                Ok(()) => Some(Utc::now()),
                Err(e) => {
                    warn!(instance_id = %old.instance_id, error = %e, "failed to terminate predecessor");
                    None
                }
            }
        } else {
            info!(instance_id = %old.instance_id, "auto-terminate disabled, predecessor left running");
            None
        };

        // REPORT
        let record = MigrationRecord {
            old_instance: InstanceSnapshot {
                instance_id: old.instance_id.clone(),
                lease_class: old.lease_class,
                pool_id: old.pool_id.clone(),
                instance_type: details.instance_type.clone(),
                region: old.region.clone(),
                az: details.zone.clone(),
                ami_id: old.image_id.clone(),
            },
            new_instance: InstanceSnapshot {
                instance_id: new_instance_id.clone(),
                lease_class: new_lease,
                pool_id: new_pool.clone(),
                instance_type: new_details.instance_type.clone(),
                region: old.region.clone(),
                az: new_details.zone.clone(),
                ami_id: image_id.clone(),
            },
            snapshot: SnapshotInfo {
                used: true,
                snapshot_id: image_id.clone(),
            },
            prices: SwitchPrices {
                on_demand,
                old_spot,
                new_spot,
            },
            timing: SwitchTiming {
                initiated,
                new_instance_ready,
                traffic_switched,
                old_instance_terminated,
            },
            trigger: trigger.to_string(),
        };

        if let Err(e) = self
            .controller
            .switch_report(&self.state.agent_id, &record)
            .await
        {
            warn!(error = %e, "failed to report the switch; continuing");
        }

        // DONE: the agent now describes the successor.
        self.state
            .set_identity(NodeIdentity {
                instance_id: new_instance_id.clone(),
                instance_type: new_details.instance_type,
                zone: new_details.zone,
                image_id,
                hostname: old.hostname,
                region: old.region,
                lease_class: new_lease,
                pool_id: new_pool,
            })
            .await;

        info!(
            old = %old.instance_id,
            new = %new_instance_id,
            lease = %new_lease,
            "switch completed"
        );
        Ok(())
    }

    async fn capture_fixed_price(&self, instance_type: &str) -> f64 {
        if let Some(price) = self.state.fresh_fixed_price(self.fixed_price_ttl).await {
            return price;
        }
        match self.cloud.fixed_price(instance_type).await {
            Ok(price) => {
                self.state.store_fixed_price(price).await;
                price
            }
            Err(e) => {
                warn!(error = %e, "fixed price capture failed, falling back to last known value");
                self.state.any_fixed_price().await.unwrap_or(0.0)
            }
        }
    }
}

fn pool_price(pools: &[PriceSample], pool_id: Option<&str>) -> f64 {
    pool_id
        .and_then(|id| pools.iter().find(|sample| sample.pool_id == id))
        .map(|sample| sample.price)
        .unwrap_or(0.0)
}
