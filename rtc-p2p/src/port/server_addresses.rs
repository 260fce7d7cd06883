use log::{debug, warn};
use std::collections::BTreeSet;
use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;

use shared::error::{Error, Result};

/// A configured STUN server, before or after name resolution.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum StunServerAddress {
    Resolved(SocketAddr),
    Unresolved { host: String, port: u16 },
}

impl fmt::Display for StunServerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StunServerAddress::Resolved(addr) => write!(f, "{addr}"),
            StunServerAddress::Unresolved { host, port } => write!(f, "{host}:{port}"),
        }
    }
}

impl FromStr for StunServerAddress {
    type Err = Error;

    /// Accepts `host`, `host:port`, `ip:port`, `[v6]:port` and the same
    /// forms prefixed with `stun:`. The port defaults to 3478.
    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        let s = s.strip_prefix("stun:").unwrap_or(s);
        if s.is_empty() {
            return Err(Error::ErrInvalidStunServerAddress);
        }

        if let Ok(addr) = s.parse::<SocketAddr>() {
            return Ok(StunServerAddress::Resolved(addr));
        }
        if let Ok(ip) = s.trim_start_matches('[').trim_end_matches(']').parse() {
            return Ok(StunServerAddress::Resolved(SocketAddr::new(
                ip,
                stun::DEFAULT_PORT,
            )));
        }

        let (host, port) = match s.rsplit_once(':') {
            Some((host, port)) => (
                host,
                port.parse::<u16>()
                    .map_err(|_| Error::ErrInvalidStunServerAddress)?,
            ),
            None => (s, stun::DEFAULT_PORT),
        };
        if host.is_empty() || host.contains(':') || host.contains('[') {
            return Err(Error::ErrInvalidStunServerAddress);
        }

        Ok(StunServerAddress::Unresolved {
            host: host.to_owned(),
            port,
        })
    }
}

/// Configured STUN servers and the outcome of binding against each.
///
/// `succeeded` and `failed` are disjoint subsets of `configured`. A server
/// that resolves is replaced in `configured` by its resolved address.
#[derive(Debug, Default, Clone)]
pub struct ServerAddresses {
    configured: BTreeSet<StunServerAddress>,
    succeeded: BTreeSet<StunServerAddress>,
    failed: BTreeSet<StunServerAddress>,
}

impl ServerAddresses {
    pub fn new(servers: impl IntoIterator<Item = StunServerAddress>) -> Self {
        Self {
            configured: servers.into_iter().collect(),
            ..Default::default()
        }
    }

    pub fn configured(&self) -> &BTreeSet<StunServerAddress> {
        &self.configured
    }

    pub fn succeeded(&self) -> &BTreeSet<StunServerAddress> {
        &self.succeeded
    }

    pub fn failed(&self) -> &BTreeSet<StunServerAddress> {
        &self.failed
    }

    pub fn contains_resolved(&self, addr: &SocketAddr) -> bool {
        self.configured
            .contains(&StunServerAddress::Resolved(*addr))
    }

    /// Servers with no outcome yet.
    pub fn pending(&self) -> impl Iterator<Item = &StunServerAddress> {
        self.configured
            .iter()
            .filter(|s| !self.succeeded.contains(s) && !self.failed.contains(s))
    }

    /// True once every configured server succeeded or failed.
    pub fn is_done(&self) -> bool {
        self.pending().next().is_none()
    }

    /// Replaces an unresolved entry by its resolved address. Returns false if
    /// the resolved address was configured already.
    pub fn replace(&mut self, unresolved: &StunServerAddress, resolved: SocketAddr) -> bool {
        self.configured.remove(unresolved);
        self.configured.insert(StunServerAddress::Resolved(resolved))
    }

    pub fn mark_succeeded(&mut self, server: &StunServerAddress) {
        if self.failed.remove(server) {
            debug!("STUN server {server} recovered");
        }
        self.succeeded.insert(server.clone());
    }

    /// Returns false if `server` already succeeded; the earlier outcome stands.
    pub fn mark_failed(&mut self, server: &StunServerAddress) -> bool {
        if self.succeeded.contains(server) {
            warn!("STUN server {server} failed after succeeding, keeping it");
            return false;
        }
        self.failed.insert(server.clone())
    }
}
