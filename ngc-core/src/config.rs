// Copyright (c) 2024 Botho Foundation

//! Tunable limits for a group runtime. Every bound referenced elsewhere in
//! this crate as a bare `pub const` is a protocol invariant and stays
//! fixed; the values collected here are the ones an operator can
//! legitimately want to change per deployment (peer caps, timeouts, rate
//! limits) and are loaded through [`GroupLimitsConfig`] with the same
//! serde-default pattern the rest of this workspace uses for its own
//! configuration.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Resolved, in-memory limits for a running group. Durations are stored
/// pre-converted from the config's millisecond fields so hot paths never
/// touch serde types.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupLimits {
    pub max_peers: u16,
    pub confirmed_timeout: Duration,
    pub unconfirmed_timeout: Duration,
    pub direct_recency_window: Duration,
    pub retransmit_interval: Duration,
    pub new_connection_threshold: u32,
    pub ping_interval: Duration,
}

impl Default for GroupLimits {
    fn default() -> Self {
        GroupLimitsConfig::default().resolve()
    }
}

/// Serde-deserializable form of [`GroupLimits`], for loading operator
/// overrides from a config file or environment. Every field has a default
/// matching the protocol's built-in constants, so a partially-specified
/// document is always valid.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupLimitsConfig {
    #[serde(default = "default_max_peers")]
    pub max_peers: u16,

    #[serde(default = "default_confirmed_timeout_secs")]
    pub confirmed_timeout_secs: u64,

    #[serde(default = "default_unconfirmed_timeout_secs")]
    pub unconfirmed_timeout_secs: u64,

    #[serde(default = "default_direct_recency_window_secs")]
    pub direct_recency_window_secs: u64,

    #[serde(default = "default_retransmit_interval_ms")]
    pub retransmit_interval_ms: u64,

    #[serde(default = "default_new_connection_threshold")]
    pub new_connection_threshold: u32,

    #[serde(default = "default_ping_interval_secs")]
    pub ping_interval_secs: u64,
}

fn default_max_peers() -> u16 {
    100
}

fn default_confirmed_timeout_secs() -> u64 {
    60
}

fn default_unconfirmed_timeout_secs() -> u64 {
    10
}

fn default_direct_recency_window_secs() -> u64 {
    30
}

fn default_retransmit_interval_ms() -> u64 {
    1000
}

fn default_new_connection_threshold() -> u32 {
    10
}

fn default_ping_interval_secs() -> u64 {
    60
}

impl Default for GroupLimitsConfig {
    fn default() -> Self {
        Self {
            max_peers: default_max_peers(),
            confirmed_timeout_secs: default_confirmed_timeout_secs(),
            unconfirmed_timeout_secs: default_unconfirmed_timeout_secs(),
            direct_recency_window_secs: default_direct_recency_window_secs(),
            retransmit_interval_ms: default_retransmit_interval_ms(),
            new_connection_threshold: default_new_connection_threshold(),
            ping_interval_secs: default_ping_interval_secs(),
        }
    }
}

impl GroupLimitsConfig {
    pub fn resolve(&self) -> GroupLimits {
        GroupLimits {
            max_peers: self.max_peers,
            confirmed_timeout: Duration::from_secs(self.confirmed_timeout_secs),
            unconfirmed_timeout: Duration::from_secs(self.unconfirmed_timeout_secs),
            direct_recency_window: Duration::from_secs(self.direct_recency_window_secs),
            retransmit_interval: Duration::from_millis(self.retransmit_interval_ms),
            new_connection_threshold: self.new_connection_threshold,
            ping_interval: Duration::from_secs(self.ping_interval_secs),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_matches_protocol_constants() {
        let limits = GroupLimits::default();
        assert_eq!(limits.confirmed_timeout, Duration::from_secs(60));
        assert_eq!(limits.unconfirmed_timeout, Duration::from_secs(10));
        assert_eq!(limits.new_connection_threshold, 10);
    }

    #[test]
    fn overriding_one_field_leaves_the_rest_at_default() {
        let config = GroupLimitsConfig {
            max_peers: 25,
            ..GroupLimitsConfig::default()
        };
        let limits = config.resolve();
        assert_eq!(limits.max_peers, 25);
        assert_eq!(limits.confirmed_timeout, Duration::from_secs(60));
    }
}
