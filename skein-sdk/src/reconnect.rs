//! Per-network backoff and the active-network pointer.
//!
//! The runtime supervisor reports connection lifecycle here and asks for
//! the next delay after a drop. An intentional disconnect yields no delay,
//! which ends the supervisor loop.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::hub::{Hub, Subscription};
use crate::pool::{ConnectionPool, ConnectionState};
use crate::target::NetworkId;

/// Configuration for automatic reconnection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectConfig {
    /// Initial delay before first reconnect attempt.
    pub initial_delay_ms: u64,
    /// Maximum delay between attempts.
    pub max_delay_ms: u64,
    /// Multiplier applied to the delay after each failure.
    pub backoff_factor: f64,
    /// Up to this fraction of the delay is added as random jitter.
    pub jitter: f64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_delay_ms: 2_000,
            max_delay_ms: 30_000,
            backoff_factor: 2.0,
            jitter: 0.25,
        }
    }
}

impl ReconnectConfig {
    pub fn initial_delay(&self) -> Duration {
        Duration::from_millis(self.initial_delay_ms)
    }

    /// Delay that follows `delay`: scaled, jittered, capped.
    fn next_after(&self, delay: Duration) -> Duration {
        let base = delay.as_millis() as f64 * self.backoff_factor.max(1.0);
        let max_jitter = (delay.as_millis() as f64 * self.jitter.clamp(0.0, 1.0)) as u64;
        let jitter = if max_jitter == 0 {
            0
        } else {
            rand::thread_rng().gen_range(0..=max_jitter)
        };
        Duration::from_millis((base as u64 + jitter).min(self.max_delay_ms))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectState {
    /// Delay before the next attempt.
    pub delay: Duration,
    /// Consecutive failed attempts since the last registration.
    pub attempts: u32,
    pub intentional: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionChange {
    /// A network registered (`true`) or dropped (`false`).
    Connected { network: NetworkId, connected: bool },
    ActiveChanged { network: Option<NetworkId> },
}

pub struct ReconnectCoordinator {
    config: Mutex<ReconnectConfig>,
    pool: ConnectionPool,
    states: Mutex<HashMap<NetworkId, ReconnectState>>,
    changes: Hub<ConnectionChange>,
}

impl ReconnectCoordinator {
    pub fn new(config: ReconnectConfig, pool: ConnectionPool) -> Arc<Self> {
        Arc::new(Self {
            config: Mutex::new(config),
            pool,
            states: Mutex::new(HashMap::new()),
            changes: Hub::new(),
        })
    }

    pub fn set_config(&self, config: ReconnectConfig) {
        *self.config.lock() = config;
    }

    pub fn subscribe<F>(&self, cb: F) -> Subscription
    where
        F: Fn(&ConnectionChange) + Send + Sync + 'static,
    {
        self.changes.subscribe(cb)
    }

    pub fn state(&self, network: &NetworkId) -> Option<ReconnectState> {
        self.states.lock().get(network).cloned()
    }

    fn fresh_state(&self) -> ReconnectState {
        ReconnectState {
            delay: self.config.lock().initial_delay(),
            attempts: 0,
            intentional: false,
        }
    }

    /// A user-initiated connect: forget any earlier intentional disconnect.
    pub fn begin(&self, network: &NetworkId) {
        let fresh = self.fresh_state();
        self.states.lock().insert(network.clone(), fresh);
    }

    /// Registration succeeded: reset backoff and claim the active pointer if
    /// nobody holds it.
    pub fn on_registered(&self, network: &NetworkId) {
        let fresh = self.fresh_state();
        {
            let mut states = self.states.lock();
            let state = states.entry(network.clone()).or_insert_with(|| fresh.clone());
            state.attempts = 0;
            state.delay = fresh.delay;
        }
        tracing::info!(network = %network, "Registered");
        self.changes.publish(&ConnectionChange::Connected {
            network: network.clone(),
            connected: true,
        });
        if self.pool.get_active_network_id().is_none() {
            self.set_active(Some(network.clone()));
        }
    }

    /// The connection dropped (or never came up). Returns the delay before
    /// the next attempt, or `None` when the disconnect was intentional.
    pub fn on_disconnected(&self, network: &NetworkId) -> Option<Duration> {
        self.changes.publish(&ConnectionChange::Connected {
            network: network.clone(),
            connected: false,
        });
        let config = self.config.lock().clone();
        let fresh = self.fresh_state();
        let next = {
            let mut states = self.states.lock();
            let state = states.entry(network.clone()).or_insert(fresh);
            if state.intentional {
                None
            } else {
                let delay = state.delay;
                state.attempts += 1;
                state.delay = config.next_after(delay);
                tracing::info!(
                    network = %network,
                    attempt = state.attempts,
                    delay_ms = delay.as_millis() as u64,
                    "Disconnected, will reconnect"
                );
                Some(delay)
            }
        };
        if next.is_none() && self.pool.get_active_network_id().as_ref() == Some(network) {
            // Hand focus to another live network, if any.
            let other = self
                .pool
                .get_all_connections()
                .into_iter()
                .find(|c| c.id() != network && c.state() == ConnectionState::Registered)
                .map(|c| c.id().clone());
            self.set_active(other);
        }
        next
    }

    /// The next disconnect of `network` is the user's doing.
    pub fn mark_intentional(&self, network: &NetworkId) {
        let fresh = self.fresh_state();
        self.states
            .lock()
            .entry(network.clone())
            .or_insert(fresh)
            .intentional = true;
    }

    pub fn is_intentional(&self, network: &NetworkId) -> bool {
        self.states
            .lock()
            .get(network)
            .is_some_and(|s| s.intentional)
    }

    /// Explicit user switch. Fails for networks not in the pool.
    pub fn switch_active(&self, network: &NetworkId) -> bool {
        if self.pool.get_connection(network).is_none() {
            return false;
        }
        self.set_active(Some(network.clone()));
        true
    }

    fn set_active(&self, network: Option<NetworkId>) {
        if self.pool.get_active_network_id() == network {
            return;
        }
        self.pool.set_active(network.clone());
        tracing::debug!(network = ?network, "Active network changed");
        self.changes
            .publish(&ConnectionChange::ActiveChanged { network });
    }
}
