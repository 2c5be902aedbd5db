//! Domain model for the optimization agent
//!
//! Identity, control flags, pricing samples, pending switch commands and the
//! migration record reported to the controller after a completed switch.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use strum::Display;

/// Lease class of a compute instance.
///
/// The controller wire format still speaks the legacy market tokens:
/// `spot` and `pool` both mean a reclaimable lease, `ondemand` a fixed-price
/// one. Normalization happens at (de)serialization so the rest of the agent
/// only ever sees the three variants below.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Display)]
#[strum(serialize_all = "lowercase")]
pub enum LeaseClass {
    Reclaimable,
    Fixed,
    #[default]
    Unknown,
}

impl LeaseClass {
    /// Parse a controller wire token. `spot` and the legacy `pool` both
    /// normalize to reclaimable.
    pub fn from_wire(token: &str) -> Option<Self> {
        match token {
            "spot" | "pool" => Some(LeaseClass::Reclaimable),
            "ondemand" => Some(LeaseClass::Fixed),
            _ => None,
        }
    }

    /// The token the controller expects when the agent reports a lease class.
    pub fn wire_token(&self) -> &'static str {
        match self {
            LeaseClass::Reclaimable => "spot",
            LeaseClass::Fixed => "ondemand",
            LeaseClass::Unknown => "unknown",
        }
    }
}

impl Serialize for LeaseClass {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.wire_token())
    }
}

impl<'de> Deserialize<'de> for LeaseClass {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let token = String::deserialize(deserializer)?;
        Ok(LeaseClass::from_wire(&token).unwrap_or(LeaseClass::Unknown))
    }
}

/// Derive the pool identifier for a (type, zone) reclaimable-capacity bucket.
pub fn pool_id(instance_type: &str, zone: &str) -> String {
    format!("{}_{}", instance_type, zone.replace('-', ""))
}

/// Identity of the node this agent currently describes.
///
/// Written at startup and again when a migration completes; everything else
/// only reads it.
#[derive(Debug, Clone, PartialEq)]
pub struct NodeIdentity {
    pub instance_id: String,
    pub instance_type: String,
    pub zone: String,
    pub image_id: String,
    pub hostname: String,
    pub region: String,
    pub lease_class: LeaseClass,
    /// Present iff the lease class is reclaimable.
    pub pool_id: Option<String>,
}

/// Controller-managed feature switches for this agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControlFlags {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_true")]
    pub auto_switch_enabled: bool,
    #[serde(default = "default_true")]
    pub auto_terminate_enabled: bool,
}

fn default_true() -> bool {
    true
}

impl Default for ControlFlags {
    fn default() -> Self {
        Self {
            enabled: true,
            auto_switch_enabled: true,
            auto_terminate_enabled: true,
        }
    }
}

/// A switch command fetched from the controller, normalized on ingestion.
#[derive(Debug, Clone, Deserialize)]
pub struct PendingCommand {
    pub id: i64,
    pub instance_id: String,
    #[serde(rename = "target_mode")]
    pub target: LeaseClass,
    #[serde(default)]
    pub target_pool_id: Option<String>,
}

/// One reclaimable price observation for a (type, zone) pool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceSample {
    #[serde(rename = "az")]
    pub zone: String,
    pub pool_id: String,
    pub price: f64,
}

/// Cached fixed-price quote with its fetch time.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FixedPriceCache {
    pub price: f64,
    pub fetched_at: DateTime<Utc>,
}

impl FixedPriceCache {
    pub fn is_fresh(&self, ttl: std::time::Duration) -> bool {
        let age = Utc::now().signed_duration_since(self.fetched_at);
        age.to_std().map(|age| age < ttl).unwrap_or(true)
    }
}

/// Identity snapshot of one side of a migration, as reported to the controller.
#[derive(Debug, Clone, Serialize)]
pub struct InstanceSnapshot {
    pub instance_id: String,
    #[serde(rename = "mode")]
    pub lease_class: LeaseClass,
    pub pool_id: Option<String>,
    pub instance_type: String,
    pub region: String,
    pub az: String,
    pub ami_id: String,
}

/// The image used to carry configuration across a migration.
#[derive(Debug, Clone, Serialize)]
pub struct SnapshotInfo {
    pub used: bool,
    pub snapshot_id: String,
}

/// Prices observed at cutover. Zero where a side has no reclaimable pool.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct SwitchPrices {
    pub on_demand: f64,
    pub old_spot: f64,
    pub new_spot: f64,
}

/// Timestamps of the migration milestones.
///
/// `old_instance_terminated` stays null when auto-terminate is disabled or
/// the termination request failed.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct SwitchTiming {
    #[serde(rename = "switch_initiated_at")]
    pub initiated: DateTime<Utc>,
    #[serde(rename = "new_instance_ready_at")]
    pub new_instance_ready: DateTime<Utc>,
    #[serde(rename = "traffic_switched_at")]
    pub traffic_switched: DateTime<Utc>,
    #[serde(rename = "old_instance_terminated_at")]
    pub old_instance_terminated: Option<DateTime<Utc>>,
}

/// Everything the controller needs to record one completed migration.
#[derive(Debug, Clone, Serialize)]
pub struct MigrationRecord {
    pub old_instance: InstanceSnapshot,
    pub new_instance: InstanceSnapshot,
    pub snapshot: SnapshotInfo,
    pub prices: SwitchPrices,
    pub timing: SwitchTiming,
    pub trigger: String,
}
