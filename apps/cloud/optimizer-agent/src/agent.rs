//! Agent supervisor
//!
//! Owns the startup sequence, the shutdown gate and the lifetime of the
//! periodic tasks. Startup is strictly ordered and any failure is fatal;
//! after that the agent keeps running and heartbeating even when every
//! other task is failing.

use std::sync::Arc;
use std::time::Duration;

use eyre::{eyre, Result, WrapErr};
use tokio::signal;
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::cloud::aws::Ec2Adapter;
use crate::cloud::CloudAdapter;
use crate::config::AgentConfig;
use crate::controller::{ControllerApi, ControllerClient, RegisterRequest};
use crate::metadata::ImdsClient;
use crate::models::{LeaseClass, NodeIdentity};
use crate::scheduler::{self, Intervals, TaskContext};
use crate::state::AgentState;
use crate::switch::SwitchEngine;

/// Per-task join budget on shutdown. A migration that is still mutating
/// cloud state deliberately overruns this; the process then accepts the
/// forced-termination cost rather than cancelling mid-step.
const SHUTDOWN_JOIN_TIMEOUT: Duration = Duration::from_secs(5);

pub async fn run(config: AgentConfig) -> Result<()> {
    let metadata = Arc::new(ImdsClient::new());

    // 1. Refuse to run anywhere without an instance identity.
    if !metadata.on_cloud_host().await {
        return Err(eyre!(
            "not running on a cloud host: no instance identity at the metadata endpoint"
        ));
    }
    info!("running on a cloud instance");

    // 2. Resolve who we are.
    let identity = discover_identity(&metadata, &config).await?;
    info!(
        instance_id = %identity.instance_id,
        instance_type = %identity.instance_type,
        zone = %identity.zone,
        image_id = %identity.image_id,
        hostname = %identity.hostname,
        "instance identity resolved"
    );

    // 3. Provider adapter and the node's current lease class.
    let cloud: Arc<dyn CloudAdapter> = Arc::new(Ec2Adapter::new(&config.region).await);
    let (lease_class, pool_id) = cloud.current_lease(&identity.instance_id).await;
    let identity = NodeIdentity {
        lease_class,
        pool_id,
        ..identity
    };
    info!(
        lease = %identity.lease_class,
        pool = identity.pool_id.as_deref().unwrap_or("-"),
        "current lease resolved"
    );

    // 4. Register with the controller.
    let controller: Arc<dyn ControllerApi> = Arc::new(ControllerClient::new(
        &config.central_server_url,
        &config.client_token,
    ));
    let request = RegisterRequest::new(&config.client_token, &identity);
    let response = controller
        .register(&request)
        .await
        .wrap_err("agent registration failed")?;
    info!(
        agent_id = %response.agent_id,
        enabled = response.config.enabled,
        auto_switch = response.config.auto_switch_enabled,
        auto_terminate = response.config.auto_terminate_enabled,
        "registered with controller"
    );

    let state = Arc::new(AgentState::new(response.agent_id, identity, response.config));
    let engine = Arc::new(SwitchEngine::new(
        cloud.clone(),
        controller.clone(),
        state.clone(),
        config.ondemand_price_interval,
    ));

    // 5. Periodic tasks behind the shared shutdown gate.
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        shutdown_signal().await;
        let _ = shutdown_tx.send(true);
    });

    let ctx = Arc::new(TaskContext {
        state: state.clone(),
        cloud,
        controller: controller.clone(),
        metadata,
        engine,
        intervals: Intervals::from(&config),
    });
    let handles = scheduler::spawn_tasks(ctx, &shutdown_rx);
    info!("agent is running");

    // 6. Block until the gate is set.
    let mut gate = shutdown_rx;
    while !*gate.borrow() {
        if gate.changed().await.is_err() {
            break;
        }
    }
    info!("shutting down");

    // Best-effort: tell the controller we are going away.
    if let Err(e) = controller.heartbeat(&state.agent_id, "offline", &[]).await {
        warn!(error = %e, "offline heartbeat failed");
    }

    for (name, handle) in handles {
        match tokio::time::timeout(SHUTDOWN_JOIN_TIMEOUT, handle).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!(task = name, error = %e, "task ended abnormally"),
            Err(_) => warn!(task = name, "task did not stop within the join timeout"),
        }
    }

    info!("agent stopped");
    Ok(())
}

/// Populate the node identity from the metadata service. Any missing field
/// is fatal: an agent that does not know its own node cannot do anything
/// useful.
async fn discover_identity(metadata: &ImdsClient, config: &AgentConfig) -> Result<NodeIdentity> {
    let instance_id = metadata
        .instance_id()
        .await
        .ok_or_else(|| eyre!("instance metadata missing: instance-id"))?;
    let instance_type = metadata
        .instance_type()
        .await
        .ok_or_else(|| eyre!("instance metadata missing: instance-type"))?;
    let zone = metadata
        .availability_zone()
        .await
        .ok_or_else(|| eyre!("instance metadata missing: availability-zone"))?;
    let image_id = metadata
        .image_id()
        .await
        .ok_or_else(|| eyre!("instance metadata missing: ami-id"))?;
    let hostname = metadata
        .hostname()
        .await
        .unwrap_or_else(|| "unknown".to_string());

    Ok(NodeIdentity {
        instance_id,
        instance_type,
        zone,
        image_id,
        hostname,
        region: config.region.clone(),
        lease_class: LeaseClass::Unknown,
        pool_id: None,
    })
}

/// Wait for a shutdown signal (SIGINT or SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating shutdown...");
        },
        _ = terminate => {
            info!("Received SIGTERM, initiating shutdown...");
        },
    }
}
