//! Periodic tasks
//!
//! Four cooperative loops, each driven by its own period and a shared
//! shutdown gate. Per-tick work lives in separate functions; the loops only
//! add pacing and error swallowing, so a failed tick never kills a task -
//! the next tick retries.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use crate::cloud::CloudAdapter;
use crate::config::AgentConfig;
use crate::controller::{ControllerApi, InstanceReport, OnDemandPrice, PricingReport};
use crate::metadata::ImdsClient;
use crate::models::LeaseClass;
use crate::state::AgentState;
use crate::switch::SwitchEngine;

/// Task periods, all configurable through the environment.
#[derive(Debug, Clone, Copy)]
pub struct Intervals {
    pub heartbeat: Duration,
    pub reclaimable_price: Duration,
    pub fixed_price: Duration,
    pub command_drain: Duration,
}

impl From<&AgentConfig> for Intervals {
    fn from(config: &AgentConfig) -> Self {
        Self {
            heartbeat: config.heartbeat_interval,
            reclaimable_price: config.spot_price_interval,
            fixed_price: config.ondemand_price_interval,
            command_drain: config.command_check_interval,
        }
    }
}

/// Everything a periodic task needs, shared by handle.
pub struct TaskContext {
    pub state: Arc<AgentState>,
    pub cloud: Arc<dyn CloudAdapter>,
    pub controller: Arc<dyn ControllerApi>,
    pub metadata: Arc<ImdsClient>,
    pub engine: Arc<SwitchEngine>,
    pub intervals: Intervals,
}

/// Spawn the four periodic tasks. Each one exits within a period of the
/// shutdown gate being set.
pub fn spawn_tasks(
    ctx: Arc<TaskContext>,
    shutdown: &watch::Receiver<bool>,
) -> Vec<(&'static str, JoinHandle<()>)> {
    vec![
        (
            "heartbeat",
            tokio::spawn(heartbeat_loop(ctx.clone(), shutdown.clone())),
        ),
        (
            "reclaimable-price",
            tokio::spawn(reclaimable_price_loop(ctx.clone(), shutdown.clone())),
        ),
        (
            "fixed-price",
            tokio::spawn(fixed_price_loop(ctx.clone(), shutdown.clone())),
        ),
        (
            "command-drain",
            tokio::spawn(command_drain_loop(ctx, shutdown.clone())),
        ),
    ]
}

async fn heartbeat_loop(ctx: Arc<TaskContext>, mut shutdown: watch::Receiver<bool>) {
    info!("heartbeat task started");
    loop {
        if let Err(e) = heartbeat_tick(&ctx).await {
            debug!(error = %e, "heartbeat failed; retrying next tick");
        }
        tokio::select! {
            _ = sleep(ctx.intervals.heartbeat) => {}
            _ = shutdown.changed() => break,
        }
    }
    info!("heartbeat task stopped");
}

async fn reclaimable_price_loop(ctx: Arc<TaskContext>, mut shutdown: watch::Receiver<bool>) {
    info!("reclaimable-price task started");
    loop {
        if let Err(e) = reclaimable_price_tick(&ctx).await {
            warn!(error = %e, "reclaimable price probe failed; retrying next tick");
        }
        tokio::select! {
            _ = sleep(ctx.intervals.reclaimable_price) => {}
            _ = shutdown.changed() => break,
        }
    }
    info!("reclaimable-price task stopped");
}

async fn fixed_price_loop(ctx: Arc<TaskContext>, mut shutdown: watch::Receiver<bool>) {
    info!("fixed-price task started");
    loop {
        if let Err(e) = fixed_price_tick(&ctx).await {
            warn!(error = %e, "fixed price probe failed; retrying next tick");
        }
        tokio::select! {
            _ = sleep(ctx.intervals.fixed_price) => {}
            _ = shutdown.changed() => break,
        }
    }
    info!("fixed-price task stopped");
}

async fn command_drain_loop(ctx: Arc<TaskContext>, mut shutdown: watch::Receiver<bool>) {
    info!("command-drain task started");
    loop {
        if let Err(e) = drain_tick(&ctx).await {
            debug!(error = %e, "command drain failed; retrying next tick");
        }
        tokio::select! {
            _ = sleep(ctx.intervals.command_drain) => {}
            _ = shutdown.changed() => break,
        }
    }
    info!("command-drain task stopped");
}

/// Liveness report plus a control-flag refresh, either from the heartbeat
/// response itself or from a follow-up config read.
pub(crate) async fn heartbeat_tick(ctx: &TaskContext) -> eyre::Result<()> {
    let identity = ctx.state.identity().await;
    let monitored = vec![identity.instance_id];

    let flags = ctx
        .controller
        .heartbeat(&ctx.state.agent_id, "online", &monitored)
        .await?;

    let flags = match flags {
        Some(flags) => flags,
        None => ctx.controller.get_config(&ctx.state.agent_id).await?,
    };
    ctx.state.set_flags(flags).await;
    Ok(())
}

/// Pool samples plus the cached fixed price, published as one report. Also
/// re-reads the instance type from metadata and the lease class from the
/// provider so the report self-corrects after a migration.
pub(crate) async fn reclaimable_price_tick(ctx: &TaskContext) -> eyre::Result<()> {
    if let Some(instance_type) = ctx.metadata.instance_type().await {
        if ctx.state.refresh_instance_type(&instance_type).await {
            info!(instance_type, "instance type changed since the last probe");
        }
    }

    let identity = ctx.state.identity().await;
    let pools = ctx
        .cloud
        .reclaimable_prices(&identity.instance_type)
        .await?;
    if pools.is_empty() {
        debug!("no reclaimable price samples for this instance type");
        return Ok(());
    }

    let on_demand = cached_fixed_price(ctx).await;

    let (lease_class, pool_id) = ctx.cloud.current_lease(&identity.instance_id).await;
    if lease_class != LeaseClass::Unknown {
        ctx.state.update_lease(lease_class, pool_id).await;
    }

    let identity = ctx.state.identity().await;
    let report = PricingReport {
        instance: InstanceReport::from(&identity),
        on_demand_price: OnDemandPrice {
            price: on_demand,
            source: "api".to_string(),
        },
        spot_pools: pools,
    };
    ctx.controller
        .pricing_report(&ctx.state.agent_id, &report)
        .await?;
    info!(pools = report.spot_pools.len(), "published pricing report");
    Ok(())
}

/// Refresh the fixed-price cache.
pub(crate) async fn fixed_price_tick(ctx: &TaskContext) -> eyre::Result<()> {
    let identity = ctx.state.identity().await;
    let price = ctx.cloud.fixed_price(&identity.instance_type).await?;
    ctx.state.store_fixed_price(price).await;
    info!(price, "refreshed fixed price");
    Ok(())
}

/// Fetch, filter and execute pending switch commands. Every fetched command
/// is acknowledged exactly once, whether it ran, aborted, or was addressed
/// to a previous identity.
pub(crate) async fn drain_tick(ctx: &TaskContext) -> eyre::Result<()> {
    let flags = ctx.state.flags().await;
    if !flags.enabled || !flags.auto_switch_enabled {
        return Ok(());
    }
    if ctx.state.switch_in_progress() {
        debug!("migration in progress, skipping command drain");
        return Ok(());
    }

    let commands = ctx.controller.pending_commands(&ctx.state.agent_id).await?;
    if commands.is_empty() {
        return Ok(());
    }
    info!(count = commands.len(), "received pending commands");

    for command in commands {
        let identity = ctx.state.identity().await;
        if command.instance_id != identity.instance_id {
            warn!(
                command_id = command.id,
                addressed_to = %command.instance_id,
                current = %identity.instance_id,
                "command addressed to a previous identity, acknowledging without executing"
            );
        } else {
            match ctx
                .engine
                .execute_switch(command.target, command.target_pool_id.as_deref(), "manual")
                .await
            {
                Ok(()) => info!(command_id = command.id, "switch completed"),
                Err(e) => error!(command_id = command.id, error = %e, "switch failed"),
            }
        }

        if let Err(e) = ctx
            .controller
            .mark_command_executed(&ctx.state.agent_id, command.id)
            .await
        {
            warn!(command_id = command.id, error = %e, "failed to acknowledge command");
        }
    }
    Ok(())
}

/// Fixed price from the cache when fresh, fetched otherwise. A failed fetch
/// falls back to the last known value, then to zero.
async fn cached_fixed_price(ctx: &TaskContext) -> f64 {
    if let Some(price) = ctx.state.fresh_fixed_price(ctx.intervals.fixed_price).await {
        return price;
    }
    let identity = ctx.state.identity().await;
    match ctx.cloud.fixed_price(&identity.instance_type).await {
        Ok(price) => {
            ctx.state.store_fixed_price(price).await;
            price
        }
        Err(e) => {
            warn!(error = %e, "fixed price fetch failed");
            ctx.state.any_fixed_price().await.unwrap_or(0.0)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::cloud::{CloudError, InstanceDetails, MockCloudAdapter};
    use crate::controller::{ControllerError, MockControllerApi};
    use crate::models::{ControlFlags, NodeIdentity, PendingCommand, PriceSample};

    fn identity() -> NodeIdentity {
        NodeIdentity {
            instance_id: "i-X".to_string(),
            instance_type: "m5.large".to_string(),
            zone: "ap-south-1a".to_string(),
            image_id: "ami-0".to_string(),
            hostname: "node-1".to_string(),
            region: "ap-south-1".to_string(),
            lease_class: LeaseClass::Reclaimable,
            pool_id: Some("m5.large_apsouth1a".to_string()),
        }
    }

    fn details(instance_id: &str, zone: &str, lease_class: LeaseClass) -> InstanceDetails {
        InstanceDetails {
            instance_id: instance_id.to_string(),
            instance_type: "m5.large".to_string(),
            state: "running".to_string(),
            lease_class,
            zone: zone.to_string(),
            image_id: "ami-0".to_string(),
            subnet_id: Some("subnet-1".to_string()),
            security_groups: vec!["sg-1".to_string()],
            key_name: None,
            iam_profile_arn: None,
            tags: std::collections::HashMap::new(),
            public_ip_on_first_interface: false,
            block_device_count: 1,
        }
    }

    fn samples() -> Vec<PriceSample> {
        vec![PriceSample {
            zone: "ap-south-1a".to_string(),
            pool_id: "m5.large_apsouth1a".to_string(),
            price: 0.035,
        }]
    }

    fn intervals() -> Intervals {
        Intervals {
            heartbeat: Duration::from_secs(60),
            reclaimable_price: Duration::from_secs(600),
            fixed_price: Duration::from_secs(3600),
            command_drain: Duration::from_secs(30),
        }
    }

    /// Context over the given task-facing mocks; the engine gets its own
    /// pair so tests can distinguish drain traffic from migration traffic.
    fn context(
        flags: ControlFlags,
        cloud: MockCloudAdapter,
        controller: MockControllerApi,
        engine_cloud: MockCloudAdapter,
        engine_controller: MockControllerApi,
    ) -> TaskContext {
        let state = Arc::new(AgentState::new("agent-1", identity(), flags));
        let engine = Arc::new(
            SwitchEngine::new(
                Arc::new(engine_cloud),
                Arc::new(engine_controller),
                state.clone(),
                Duration::from_secs(3600),
            )
            .with_stabilize_delay(Duration::ZERO),
        );
        TaskContext {
            state,
            cloud: Arc::new(cloud),
            controller: Arc::new(controller),
            metadata: Arc::new(ImdsClient::new()),
            engine,
            intervals: intervals(),
        }
    }

    #[tokio::test]
    async fn test_heartbeat_tick_takes_flags_from_response() {
        let mut controller = MockControllerApi::new();
        controller
            .expect_heartbeat()
            .withf(|agent_id, status, monitored| {
                agent_id == "agent-1" && status == "online" && monitored == ["i-X".to_string()]
            })
            .times(1)
            .returning(|_, _, _| {
                Ok(Some(ControlFlags {
                    enabled: true,
                    auto_switch_enabled: false,
                    auto_terminate_enabled: true,
                }))
            });
        controller.expect_get_config().never();

        let ctx = context(
            ControlFlags::default(),
            MockCloudAdapter::new(),
            controller,
            MockCloudAdapter::new(),
            MockControllerApi::new(),
        );
        heartbeat_tick(&ctx).await.unwrap();
        assert!(!ctx.state.flags().await.auto_switch_enabled);
    }

    #[tokio::test]
    async fn test_heartbeat_tick_falls_back_to_get_config() {
        let mut controller = MockControllerApi::new();
        controller
            .expect_heartbeat()
            .times(1)
            .returning(|_, _, _| Ok(None));
        controller.expect_get_config().times(1).returning(|_| {
            Ok(ControlFlags {
                enabled: false,
                auto_switch_enabled: true,
                auto_terminate_enabled: true,
            })
        });

        let ctx = context(
            ControlFlags::default(),
            MockCloudAdapter::new(),
            controller,
            MockCloudAdapter::new(),
            MockControllerApi::new(),
        );
        heartbeat_tick(&ctx).await.unwrap();
        assert!(!ctx.state.flags().await.enabled);
    }

    #[tokio::test]
    async fn test_drain_tick_fetches_nothing_while_disabled() {
        let mut controller = MockControllerApi::new();
        controller.expect_pending_commands().never();

        let flags = ControlFlags {
            enabled: false,
            ..ControlFlags::default()
        };
        let ctx = context(
            flags,
            MockCloudAdapter::new(),
            controller,
            MockCloudAdapter::new(),
            MockControllerApi::new(),
        );
        drain_tick(&ctx).await.unwrap();

        // same for auto-switch disabled
        let mut controller = MockControllerApi::new();
        controller.expect_pending_commands().never();
        let flags = ControlFlags {
            auto_switch_enabled: false,
            ..ControlFlags::default()
        };
        let ctx = context(
            flags,
            MockCloudAdapter::new(),
            controller,
            MockCloudAdapter::new(),
            MockControllerApi::new(),
        );
        drain_tick(&ctx).await.unwrap();
    }

    #[tokio::test]
    async fn test_drain_resumes_once_flags_flip_back_on() {
        let mut controller = MockControllerApi::new();
        controller
            .expect_pending_commands()
            .times(1)
            .returning(|_| Ok(vec![]));

        let flags = ControlFlags {
            enabled: false,
            ..ControlFlags::default()
        };
        let ctx = context(
            flags,
            MockCloudAdapter::new(),
            controller,
            MockCloudAdapter::new(),
            MockControllerApi::new(),
        );

        drain_tick(&ctx).await.unwrap(); // no fetch while disabled
        ctx.state.set_flags(ControlFlags::default()).await;
        drain_tick(&ctx).await.unwrap(); // fetches once enabled
    }

    #[tokio::test]
    async fn test_drain_tick_skips_while_switch_in_progress() {
        let mut controller = MockControllerApi::new();
        controller.expect_pending_commands().never();

        let ctx = context(
            ControlFlags::default(),
            MockCloudAdapter::new(),
            controller,
            MockCloudAdapter::new(),
            MockControllerApi::new(),
        );
        ctx.state.set_switch_in_progress(true);
        drain_tick(&ctx).await.unwrap();
    }

    #[tokio::test]
    async fn test_drain_tick_acks_stale_command_without_running_the_engine() {
        let mut controller = MockControllerApi::new();
        controller.expect_pending_commands().times(1).returning(|_| {
            Ok(vec![PendingCommand {
                id: 12,
                instance_id: "i-OLD".to_string(),
                target: LeaseClass::Fixed,
                target_pool_id: None,
            }])
        });
        controller
            .expect_mark_command_executed()
            .withf(|agent_id, command_id| agent_id == "agent-1" && *command_id == 12)
            .times(1)
            .returning(|_, _| Ok(()));

        // engine mocks carry no expectations: any engine activity panics
        let ctx = context(
            ControlFlags::default(),
            MockCloudAdapter::new(),
            controller,
            MockCloudAdapter::new(),
            MockControllerApi::new(),
        );
        drain_tick(&ctx).await.unwrap();
        assert_eq!(ctx.state.identity().await.instance_id, "i-X");
    }

    #[tokio::test]
    async fn test_drain_tick_runs_matching_command_and_acks_exactly_once() {
        let mut controller = MockControllerApi::new();
        controller.expect_pending_commands().times(1).returning(|_| {
            Ok(vec![PendingCommand {
                id: 7,
                instance_id: "i-X".to_string(),
                target: LeaseClass::Fixed,
                target_pool_id: None,
            }])
        });
        controller
            .expect_mark_command_executed()
            .withf(|_, command_id| *command_id == 7)
            .times(1)
            .returning(|_, _| Ok(()));

        let mut engine_cloud = MockCloudAdapter::new();
        engine_cloud.expect_describe_instance().returning(|id| match id {
            "i-X" => Ok(details("i-X", "ap-south-1a", LeaseClass::Reclaimable)),
            "i-Y" => Ok(details("i-Y", "ap-south-1a", LeaseClass::Fixed)),
            other => Err(CloudError::InstanceNotFound(other.to_string())),
        });
        engine_cloud
            .expect_create_image()
            .returning(|_, _| Ok("ami-1".to_string()));
        engine_cloud
            .expect_launch_instance()
            .returning(|_| Ok("i-Y".to_string()));
        engine_cloud.expect_fixed_price().returning(|_| Ok(0.096));
        engine_cloud
            .expect_reclaimable_prices()
            .returning(|_| Ok(samples()));
        engine_cloud
            .expect_terminate_instance()
            .returning(|_| Ok(()));

        let mut engine_controller = MockControllerApi::new();
        engine_controller
            .expect_switch_report()
            .times(1)
            .returning(|_, _| Ok(()));

        let ctx = context(
            ControlFlags::default(),
            MockCloudAdapter::new(),
            controller,
            engine_cloud,
            engine_controller,
        );
        drain_tick(&ctx).await.unwrap();
        assert_eq!(ctx.state.identity().await.instance_id, "i-Y");
    }

    #[tokio::test]
    async fn test_drain_tick_acks_even_when_the_switch_aborts() {
        let mut controller = MockControllerApi::new();
        controller.expect_pending_commands().times(1).returning(|_| {
            Ok(vec![PendingCommand {
                id: 9,
                instance_id: "i-X".to_string(),
                target: LeaseClass::Fixed,
                target_pool_id: None,
            }])
        });
        controller
            .expect_mark_command_executed()
            .withf(|_, command_id| *command_id == 9)
            .times(1)
            .returning(|_, _| Ok(()));

        let mut engine_cloud = MockCloudAdapter::new();
        engine_cloud
            .expect_describe_instance()
            .returning(|_| Ok(details("i-X", "ap-south-1a", LeaseClass::Reclaimable)));
        engine_cloud
            .expect_create_image()
            .returning(|_, _| Err(CloudError::ImageTimeout("ami-x".to_string(), 40)));
        engine_cloud.expect_launch_instance().never();

        let mut engine_controller = MockControllerApi::new();
        engine_controller.expect_switch_report().never();

        let ctx = context(
            ControlFlags::default(),
            MockCloudAdapter::new(),
            controller,
            engine_cloud,
            engine_controller,
        );
        drain_tick(&ctx).await.unwrap();
        assert!(!ctx.state.switch_in_progress());
        assert_eq!(ctx.state.identity().await.instance_id, "i-X");
    }

    #[tokio::test]
    async fn test_pricing_tick_publishes_pools_with_cached_fixed_price() {
        let mut cloud = MockCloudAdapter::new();
        cloud
            .expect_reclaimable_prices()
            .times(1)
            .returning(|_| Ok(samples()));
        cloud.expect_fixed_price().never(); // cache is fresh
        cloud
            .expect_current_lease()
            .times(1)
            .returning(|_| (LeaseClass::Reclaimable, Some("m5.large_apsouth1a".to_string())));

        let mut controller = MockControllerApi::new();
        controller
            .expect_pricing_report()
            .withf(|agent_id, report| {
                agent_id == "agent-1"
                    && report.spot_pools.len() == 1
                    && report.spot_pools[0].pool_id == "m5.large_apsouth1a"
                    && (report.on_demand_price.price - 0.096).abs() < 1e-9
                    && report.on_demand_price.source == "api"
                    && report.instance.current_mode == LeaseClass::Reclaimable
            })
            .times(1)
            .returning(|_, _| Ok(()));

        let ctx = context(
            ControlFlags::default(),
            cloud,
            controller,
            MockCloudAdapter::new(),
            MockControllerApi::new(),
        );
        ctx.state.store_fixed_price(0.096).await;
        reclaimable_price_tick(&ctx).await.unwrap();
    }

    #[tokio::test]
    async fn test_pricing_tick_without_samples_publishes_nothing() {
        let mut cloud = MockCloudAdapter::new();
        cloud
            .expect_reclaimable_prices()
            .times(1)
            .returning(|_| Ok(vec![]));

        let mut controller = MockControllerApi::new();
        controller.expect_pricing_report().never();

        let ctx = context(
            ControlFlags::default(),
            cloud,
            controller,
            MockCloudAdapter::new(),
            MockControllerApi::new(),
        );
        reclaimable_price_tick(&ctx).await.unwrap();
    }

    #[tokio::test]
    async fn test_fixed_price_tick_updates_the_cache() {
        let mut cloud = MockCloudAdapter::new();
        cloud
            .expect_fixed_price()
            .times(1)
            .returning(|_| Ok(0.104));

        let ctx = context(
            ControlFlags::default(),
            cloud,
            MockControllerApi::new(),
            MockCloudAdapter::new(),
            MockControllerApi::new(),
        );
        fixed_price_tick(&ctx).await.unwrap();
        assert_eq!(ctx.state.any_fixed_price().await, Some(0.104));
    }

    #[tokio::test]
    async fn test_tasks_unblock_on_the_shutdown_gate() {
        // every tick fails; the loops still have to exit on the gate
        let mut cloud = MockCloudAdapter::new();
        cloud
            .expect_reclaimable_prices()
            .returning(|_| Err(CloudError::Api("offline".to_string())));
        cloud
            .expect_fixed_price()
            .returning(|_| Err(CloudError::Api("offline".to_string())));

        let mut controller = MockControllerApi::new();
        controller
            .expect_heartbeat()
            .returning(|_, _, _| Err(ControllerError::Decode("offline".to_string())));
        controller
            .expect_pending_commands()
            .returning(|_| Err(ControllerError::Decode("offline".to_string())));

        let mut ctx = context(
            ControlFlags::default(),
            cloud,
            controller,
            MockCloudAdapter::new(),
            MockControllerApi::new(),
        );
        ctx.intervals = Intervals {
            heartbeat: Duration::from_millis(50),
            reclaimable_price: Duration::from_millis(50),
            fixed_price: Duration::from_millis(50),
            command_drain: Duration::from_millis(50),
        };

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handles = spawn_tasks(Arc::new(ctx), &shutdown_rx);

        sleep(Duration::from_millis(120)).await;
        shutdown_tx.send(true).unwrap();

        for (name, handle) in handles {
            tokio::time::timeout(Duration::from_secs(10), handle)
                .await
                .unwrap_or_else(|_| panic!("{name} task did not stop"))
                .unwrap();
        }
    }
}
