use serde::{Deserialize, Serialize};
use std::time::Duration;

pub(crate) const DEFAULT_INITIAL_RTO: Duration = Duration::from_millis(250);
pub(crate) const DEFAULT_MAX_RTO: Duration = Duration::from_secs(8);
pub(crate) const DEFAULT_MAX_RETRANSMITS: u32 = 8;

/// Retransmission schedule of a STUN transaction.
///
/// The n-th wait (0-based) is `initial_rto * 2^n`, capped at `max_rto`, so
/// waits never shrink. After `max_retransmits` retransmissions the
/// transaction waits one more interval for a response before it fails.
///
/// With the defaults a request is sent 9 times and fails 39.75 s after the
/// first send.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetransmitPolicy {
    pub initial_rto: Duration,
    pub max_rto: Duration,
    pub max_retransmits: u32,
}

impl Default for RetransmitPolicy {
    fn default() -> Self {
        Self {
            initial_rto: DEFAULT_INITIAL_RTO,
            max_rto: DEFAULT_MAX_RTO,
            max_retransmits: DEFAULT_MAX_RETRANSMITS,
        }
    }
}

impl RetransmitPolicy {
    /// A single send that fails after `timeout` without a response.
    pub fn no_retransmit(timeout: Duration) -> Self {
        Self {
            initial_rto: timeout,
            max_rto: timeout,
            max_retransmits: 0,
        }
    }

    pub fn with_initial_rto(mut self, initial_rto: Duration) -> Self {
        self.initial_rto = initial_rto;
        self
    }

    pub fn with_max_rto(mut self, max_rto: Duration) -> Self {
        self.max_rto = max_rto;
        self
    }

    pub fn with_max_retransmits(mut self, max_retransmits: u32) -> Self {
        self.max_retransmits = max_retransmits;
        self
    }

    /// Wait after the `n`-th send (0-based) before retransmitting or failing.
    pub fn interval(&self, n: u32) -> Duration {
        let cap = self.max_rto.max(self.initial_rto);
        1u32.checked_shl(n)
            .and_then(|factor| self.initial_rto.checked_mul(factor))
            .map_or(cap, |d| d.min(cap))
    }

    /// Time from the first send until the transaction fails.
    pub fn total_timeout(&self) -> Duration {
        (0..=self.max_retransmits).map(|n| self.interval(n)).sum()
    }
}
