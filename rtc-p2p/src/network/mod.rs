
use std::time::Duration;

/// Network cost levels, lowest to highest. The value is an opaque weight used
/// when comparing connections and when bounding keepalive aggressiveness.
pub const NETWORK_COST_MIN: u16 = 0;
pub const NETWORK_COST_LOW: u16 = 10;
pub const NETWORK_COST_UNKNOWN: u16 = 50;
pub const NETWORK_COST_CELLULAR_5G: u16 = 250;
pub const NETWORK_COST_CELLULAR_4G: u16 = 500;
pub const NETWORK_COST_CELLULAR: u16 = 900;
pub const NETWORK_COST_CELLULAR_3G: u16 = 910;
pub const NETWORK_COST_CELLULAR_2G: u16 = 980;
pub const NETWORK_COST_MAX: u16 = 999;

/// Costs at or above this value count as metered.
pub const NETWORK_COST_HIGH: u16 = NETWORK_COST_CELLULAR;

/// How long a keepalive chain may run without incoming traffic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeepaliveLifetime {
    Infinite,
    Bounded(Duration),
}

impl KeepaliveLifetime {
    /// Picks the lifetime for `cost`: perpetual below `threshold`,
    /// `high_cost_lifetime` at or above it.
    pub fn for_network_cost(cost: u16, threshold: u16, high_cost_lifetime: Duration) -> Self {
        if is_high_cost(cost, threshold) {
            KeepaliveLifetime::Bounded(high_cost_lifetime)
        } else {
            KeepaliveLifetime::Infinite
        }
    }

    /// Whether a chain of `elapsed` age is still within the lifetime.
    pub fn allows(&self, elapsed: Duration) -> bool {
        match self {
            KeepaliveLifetime::Infinite => true,
            KeepaliveLifetime::Bounded(lifetime) => elapsed <= *lifetime,
        }
    }
}

pub fn is_high_cost(cost: u16, threshold: u16) -> bool {
    cost >= threshold
}
