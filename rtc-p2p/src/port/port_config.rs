use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::time::Duration;

use crate::candidate::COMPONENT_RTP;
use crate::network::{NETWORK_COST_HIGH, NETWORK_COST_UNKNOWN};
use crate::stun_request::RetransmitPolicy;

pub(crate) const DEFAULT_STUN_KEEPALIVE_INTERVAL: Duration = Duration::from_secs(10);
pub(crate) const DEFAULT_HIGH_COST_KEEPALIVE_LIFETIME: Duration = Duration::from_secs(2 * 60);
pub(crate) const DEFAULT_RESOLVE_TIMEOUT: Duration = Duration::from_secs(10);

/// Configuration of a [`UdpPort`](crate::port::UdpPort).
///
/// Every field has a default, so a partial document deserializes:
///
/// ```rust
/// use rtc_p2p::port::PortConfig;
/// use std::time::Duration;
///
/// let config = PortConfig::default()
///     .with_stun_servers(vec!["stun:stun.example.org:3478".to_owned()])
///     .with_stun_keepalive_interval(Some(Duration::from_secs(15)))
///     .with_port_range(50000, 50100);
/// assert_eq!(config.network_cost_high_threshold, 900);
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PortConfig {
    /// STUN servers as `host:port`, `[v6]:port` or `stun:host[:port]`.
    pub stun_servers: Vec<String>,
    /// Spacing of keepalive binding requests. `None` disables keepalives.
    pub stun_keepalive_interval: Option<Duration>,
    /// A STUN server name still unresolved after this long counts as failed.
    pub resolve_timeout: Duration,
    /// Emit a host candidate even when the socket is bound to the any-address.
    pub emit_local_for_anyaddress: bool,
    /// Address advertised instead of the any-address.
    pub default_local_address: Option<IpAddr>,
    pub min_port: u16,
    pub max_port: u16,
    pub network_cost: u16,
    /// Costs at or above this bound keepalives by `high_cost_keepalive_lifetime`.
    pub network_cost_high_threshold: u16,
    pub high_cost_keepalive_lifetime: Duration,
    /// Only gather server reflexive candidates; no host candidate is emitted.
    pub server_reflexive_only: bool,
    pub component: u16,
    pub generation: u32,
    /// Generated when empty.
    pub local_ufrag: String,
    /// Generated when empty.
    pub local_pwd: String,
    pub network_name: String,
    pub retransmit: RetransmitPolicy,
}

impl Default for PortConfig {
    fn default() -> Self {
        Self {
            stun_servers: vec![],
            stun_keepalive_interval: Some(DEFAULT_STUN_KEEPALIVE_INTERVAL),
            resolve_timeout: DEFAULT_RESOLVE_TIMEOUT,
            emit_local_for_anyaddress: false,
            default_local_address: None,
            min_port: 0,
            max_port: 0,
            network_cost: NETWORK_COST_UNKNOWN,
            network_cost_high_threshold: NETWORK_COST_HIGH,
            high_cost_keepalive_lifetime: DEFAULT_HIGH_COST_KEEPALIVE_LIFETIME,
            server_reflexive_only: false,
            component: COMPONENT_RTP,
            generation: 0,
            local_ufrag: String::new(),
            local_pwd: String::new(),
            network_name: String::new(),
            retransmit: RetransmitPolicy::default(),
        }
    }
}

impl PortConfig {
    pub fn with_stun_servers(mut self, stun_servers: Vec<String>) -> Self {
        self.stun_servers = stun_servers;
        self
    }

    pub fn with_stun_keepalive_interval(mut self, interval: Option<Duration>) -> Self {
        self.stun_keepalive_interval = interval;
        self
    }

    pub fn with_resolve_timeout(mut self, timeout: Duration) -> Self {
        self.resolve_timeout = timeout;
        self
    }

    pub fn with_emit_local_for_anyaddress(mut self, emit: bool) -> Self {
        self.emit_local_for_anyaddress = emit;
        self
    }

    pub fn with_default_local_address(mut self, ip: IpAddr) -> Self {
        self.default_local_address = Some(ip);
        self
    }

    pub fn with_port_range(mut self, min_port: u16, max_port: u16) -> Self {
        self.min_port = min_port;
        self.max_port = max_port;
        self
    }

    pub fn with_network_cost(mut self, network_cost: u16) -> Self {
        self.network_cost = network_cost;
        self
    }

    pub fn with_network_cost_high_threshold(mut self, threshold: u16) -> Self {
        self.network_cost_high_threshold = threshold;
        self
    }

    pub fn with_high_cost_keepalive_lifetime(mut self, lifetime: Duration) -> Self {
        self.high_cost_keepalive_lifetime = lifetime;
        self
    }

    pub fn with_server_reflexive_only(mut self, server_reflexive_only: bool) -> Self {
        self.server_reflexive_only = server_reflexive_only;
        self
    }

    pub fn with_credentials(mut self, ufrag: &str, pwd: &str) -> Self {
        self.local_ufrag = ufrag.to_owned();
        self.local_pwd = pwd.to_owned();
        self
    }

    pub fn with_network_name(mut self, network_name: &str) -> Self {
        self.network_name = network_name.to_owned();
        self
    }

    pub fn with_generation(mut self, generation: u32) -> Self {
        self.generation = generation;
        self
    }

    pub fn with_retransmit(mut self, retransmit: RetransmitPolicy) -> Self {
        self.retransmit = retransmit;
        self
    }
}
