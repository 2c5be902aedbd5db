//! Lease Optimization Agent
//!
//! Node-resident agent of the cost-optimization fleet. It discovers the
//! node's identity from the instance metadata service, reports live
//! reclaimable and fixed-price quotes to the central controller, and
//! executes migration commands by snapshotting the node, relaunching it
//! under the requested lease class and retiring the predecessor.
//!
//! ## Architecture
//!
//! ```text
//! metadata service ──► identity ─┐
//! EC2 / pricing APIs ──► adapter ─┼─► periodic tasks ──► controller
//!                                 │   (heartbeat, price probes,
//!                                 │    command drain)
//!                                 └─► migration engine ──► switch report
//! ```
//!
//! Four cooperative tasks share one shutdown gate; the migration engine
//! runs at most one switch at a time and rebinds the agent's identity to
//! the successor node when a switch completes.

pub mod agent;
pub mod cloud;
pub mod config;
pub mod controller;
pub mod metadata;
pub mod models;
pub mod scheduler;
pub mod state;
pub mod switch;

use core_config::{Environment, FromEnv};
use eyre::{Result, WrapErr};
use tracing::info;

use crate::config::AgentConfig;

/// Version string reported to the controller at registration.
pub const AGENT_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Run the agent
///
/// This is the main entry point. It:
/// 1. Sets up structured logging (env-aware: JSON for prod, pretty for dev)
/// 2. Loads the agent configuration from the environment
/// 3. Hands control to the supervisor, which owns startup and shutdown
///
/// # Errors
///
/// Returns an error if:
/// - Required configuration is missing or unparsable
/// - The host has no instance identity (not a cloud instance)
/// - Instance metadata is unavailable at startup
/// - Registration with the controller fails
pub async fn run() -> Result<()> {
    core_config::tracing::install_color_eyre();
    let environment = Environment::from_env();
    core_config::tracing::init_tracing(&environment);

    let config = AgentConfig::from_env().wrap_err("invalid agent configuration")?;
    info!(
        version = AGENT_VERSION,
        region = %config.region,
        "starting lease optimization agent"
    );

    agent::run(config).await
}
