//! Shared agent state
//!
//! One value passed by handle to every periodic task and to the migration
//! engine. Single-writer rules: identity is written at startup and at the
//! end of a successful migration; flags are written by the heartbeat task;
//! the fixed-price cache by whichever task fetched last. Stale reads are
//! harmless and self-correct on the next tick.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::Utc;
use tokio::sync::RwLock;

use crate::models::{ControlFlags, FixedPriceCache, LeaseClass, NodeIdentity};

pub struct AgentState {
    /// Assigned by the controller at registration, stable for the process.
    pub agent_id: String,
    identity: RwLock<NodeIdentity>,
    flags: RwLock<ControlFlags>,
    fixed_price: RwLock<Option<FixedPriceCache>>,
    switch_in_progress: AtomicBool,
}

impl AgentState {
    pub fn new(agent_id: impl Into<String>, identity: NodeIdentity, flags: ControlFlags) -> Self {
        Self {
            agent_id: agent_id.into(),
            identity: RwLock::new(identity),
            flags: RwLock::new(flags),
            fixed_price: RwLock::new(None),
            switch_in_progress: AtomicBool::new(false),
        }
    }

    pub async fn identity(&self) -> NodeIdentity {
        self.identity.read().await.clone()
    }

    /// Rebind the agent to a successor node. Migration-engine use only.
    pub async fn set_identity(&self, identity: NodeIdentity) {
        *self.identity.write().await = identity;
    }

    /// Refresh the lease class and pool observed by a periodic probe.
    pub async fn update_lease(&self, lease_class: LeaseClass, pool_id: Option<String>) {
        let mut identity = self.identity.write().await;
        identity.lease_class = lease_class;
        identity.pool_id = pool_id;
    }

    /// Update the instance type if the metadata service disagrees with the
    /// current value. Returns true when a change was recorded.
    pub async fn refresh_instance_type(&self, instance_type: &str) -> bool {
        let mut identity = self.identity.write().await;
        if identity.instance_type == instance_type {
            return false;
        }
        identity.instance_type = instance_type.to_string();
        true
    }

    pub async fn flags(&self) -> ControlFlags {
        *self.flags.read().await
    }

    pub async fn set_flags(&self, flags: ControlFlags) {
        *self.flags.write().await = flags;
    }

    /// Cached fixed price, only when younger than `ttl`.
    pub async fn fresh_fixed_price(&self, ttl: Duration) -> Option<f64> {
        let cache = *self.fixed_price.read().await;
        cache.filter(|cache| cache.is_fresh(ttl)).map(|cache| cache.price)
    }

    /// Cached fixed price regardless of age; the fallback when a fetch fails.
    pub async fn any_fixed_price(&self) -> Option<f64> {
        let cache = *self.fixed_price.read().await;
        cache.map(|cache| cache.price)
    }

    pub async fn store_fixed_price(&self, price: f64) {
        *self.fixed_price.write().await = Some(FixedPriceCache {
            price,
            fetched_at: Utc::now(),
        });
    }

    pub fn switch_in_progress(&self) -> bool {
        self.switch_in_progress.load(Ordering::SeqCst)
    }

    pub(crate) fn set_switch_in_progress(&self, value: bool) {
        self.switch_in_progress.store(value, Ordering::SeqCst);
    }
}
