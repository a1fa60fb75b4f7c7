//! Connection manager configuration

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Interval between contact time reports
pub const DEFAULT_CONTACT_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManagerConfig {
    /// Whether sensor upgrades are managed at all
    #[serde(default)]
    pub upgrades_enabled: bool,

    /// Create an upgrade coordinator for every known cluster at startup
    /// instead of on first connection
    #[serde(default)]
    pub eager_upgrade_handles: bool,

    /// Let managed sensors push their own configuration during the handshake
    #[serde(default = "default_true")]
    pub accept_managed_config: bool,

    #[serde(default = "default_contact_interval")]
    pub contact_interval: Duration,

    /// Messages buffered per connection before senders wait
    #[serde(default = "default_outbound_queue_capacity")]
    pub outbound_queue_capacity: usize,

    /// Target version sent with upgrade triggers
    #[serde(default = "default_upgrade_target_version")]
    pub upgrade_target_version: String,
}

fn default_true() -> bool {
    true
}

fn default_contact_interval() -> Duration {
    DEFAULT_CONTACT_INTERVAL
}

fn default_outbound_queue_capacity() -> usize {
    256
}

fn default_upgrade_target_version() -> String {
    env!("CARGO_PKG_VERSION").to_string()
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            upgrades_enabled: false,
            eager_upgrade_handles: false,
            accept_managed_config: true,
            contact_interval: default_contact_interval(),
            outbound_queue_capacity: default_outbound_queue_capacity(),
            upgrade_target_version: default_upgrade_target_version(),
        }
    }
}

impl ManagerConfig {
    pub fn with_upgrades(mut self, enabled: bool) -> Self {
        self.upgrades_enabled = enabled;
        self
    }

    pub fn with_eager_upgrade_handles(mut self, eager: bool) -> Self {
        self.eager_upgrade_handles = eager;
        self
    }

    pub fn with_accept_managed_config(mut self, accept: bool) -> Self {
        self.accept_managed_config = accept;
        self
    }

    pub fn with_contact_interval(mut self, interval: Duration) -> Self {
        self.contact_interval = interval;
        self
    }

    pub fn with_outbound_queue_capacity(mut self, capacity: usize) -> Self {
        self.outbound_queue_capacity = capacity.max(1);
        self
    }

    pub fn with_upgrade_target_version(mut self, version: impl Into<String>) -> Self {
        self.upgrade_target_version = version.into();
        self
    }
}
