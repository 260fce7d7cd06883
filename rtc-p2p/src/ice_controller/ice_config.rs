use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::NominationMode;

pub(crate) const DEFAULT_RECEIVING_TIMEOUT: Duration = Duration::from_millis(2500);
pub(crate) const WEAK_PING_INTERVAL: Duration = Duration::from_millis(48);
pub(crate) const STRONG_PING_INTERVAL: Duration = Duration::from_millis(480);
pub(crate) const WRITABLE_CONNECTION_PING_INTERVAL: Duration = Duration::from_millis(2500);
pub(crate) const UNWRITABLE_CONNECTION_PING_INTERVAL: Duration = Duration::from_millis(480);
pub(crate) const RECEIVING_SWITCHING_DELAY: Duration = Duration::from_millis(1000);
pub(crate) const RTT_SWITCH_THRESHOLD: Duration = Duration::from_millis(10);
pub(crate) const MIN_CHECK_RECEIVING_INTERVAL: Duration = Duration::from_millis(50);

/// Tunables of connection selection and ping pacing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct IceConfig {
    /// A connection stops counting as receiving after this long without
    /// inbound traffic.
    pub receiving_timeout: Duration,
    /// Spacing between pings while no writable, receiving connection is selected.
    pub ping_interval_weak: Duration,
    /// Spacing between pings once a writable, receiving connection is selected.
    pub ping_interval_strong: Duration,
    /// Minimum spacing of pings on one writable connection.
    pub writable_connection_ping_interval: Duration,
    /// Minimum spacing of pings on one connection that is not writable yet.
    pub unwritable_connection_ping_interval: Duration,
    /// Delay before re-evaluating when a better connection is not writable yet.
    pub receiving_switching_delay: Duration,
    /// A connection that is otherwise equal must beat the selected one's rtt
    /// by this much to replace it.
    pub rtt_switch_threshold: Duration,
    pub nomination_mode: NominationMode,
    /// Tear down connections dominated by a better one on the same network.
    pub prune_redundant: bool,
}

impl Default for IceConfig {
    fn default() -> Self {
        Self {
            receiving_timeout: DEFAULT_RECEIVING_TIMEOUT,
            ping_interval_weak: WEAK_PING_INTERVAL,
            ping_interval_strong: STRONG_PING_INTERVAL,
            writable_connection_ping_interval: WRITABLE_CONNECTION_PING_INTERVAL,
            unwritable_connection_ping_interval: UNWRITABLE_CONNECTION_PING_INTERVAL,
            receiving_switching_delay: RECEIVING_SWITCHING_DELAY,
            rtt_switch_threshold: RTT_SWITCH_THRESHOLD,
            nomination_mode: NominationMode::default(),
            prune_redundant: true,
        }
    }
}

impl IceConfig {
    pub fn with_receiving_timeout(mut self, timeout: Duration) -> Self {
        self.receiving_timeout = timeout;
        self
    }

    pub fn with_ping_intervals(mut self, weak: Duration, strong: Duration) -> Self {
        self.ping_interval_weak = weak;
        self.ping_interval_strong = strong;
        self
    }

    pub fn with_connection_ping_intervals(mut self, writable: Duration, unwritable: Duration) -> Self {
        self.writable_connection_ping_interval = writable;
        self.unwritable_connection_ping_interval = unwritable;
        self
    }

    pub fn with_receiving_switching_delay(mut self, delay: Duration) -> Self {
        self.receiving_switching_delay = delay;
        self
    }

    pub fn with_rtt_switch_threshold(mut self, threshold: Duration) -> Self {
        self.rtt_switch_threshold = threshold;
        self
    }

    pub fn with_nomination_mode(mut self, mode: NominationMode) -> Self {
        self.nomination_mode = mode;
        self
    }

    pub fn with_prune_redundant(mut self, prune: bool) -> Self {
        self.prune_redundant = prune;
        self
    }

    /// How often receiving state is worth re-checking.
    pub fn check_receiving_interval(&self) -> Duration {
        (self.receiving_timeout / 10).max(MIN_CHECK_RECEIVING_INTERVAL)
    }
}
