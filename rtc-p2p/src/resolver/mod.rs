//! Sans-I/O hostname resolution with lookup sharing.
//!
//! [`AddressResolver`] never talks to DNS itself. Each distinct
//! `(host, family)` lookup is emitted once as a [`ResolveRequest`] from
//! [`poll_write()`](sansio::Protocol::poll_write); whoever owns the I/O
//! performs it (for instance with [`resolve_blocking`] on a worker) and
//! feeds the answer back through
//! [`handle_read()`](sansio::Protocol::handle_read) as a [`ResolveResponse`].
//!
//! Every call to [`AddressResolver::resolve`] produces exactly one
//! [`ResolveEvent`], even when several calls joined the same lookup.
//! Once [`close()`](sansio::Protocol::close) or
//! [`AddressResolver::abandon_all`] ran, late answers are ignored and no
//! event fires for the abandoned calls.
//!
//! ```rust
//! use rtc_p2p::resolver::{AddressFamily, AddressResolver, ResolveResponse};
//! use sansio::Protocol;
//! use std::time::Instant;
//!
//! let mut resolver = AddressResolver::new();
//! let now = Instant::now();
//! let a = resolver.resolve("stun.example.org", AddressFamily::V4, "first", now).unwrap();
//! let b = resolver.resolve("stun.example.org", AddressFamily::V4, "second", now).unwrap();
//! assert_ne!(a, b);
//!
//! // One request covers both calls.
//! let request = resolver.poll_write().unwrap();
//! assert!(resolver.poll_write().is_none());
//!
//! resolver
//!     .handle_read(ResolveResponse {
//!         token: request.token,
//!         result: Ok(vec!["203.0.113.1".parse().unwrap()]),
//!     })
//!     .unwrap();
//! assert!(resolver.poll_event().is_some());
//! assert!(resolver.poll_event().is_some());
//! ```


use log::{debug, trace};
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use shared::error::{Error, Result};
use shared::util::lookup_host;

/// Error code reported when the answer held no address of the requested family.
pub const RESOLVE_ERROR_NO_ADDRESS: i32 = 1;
/// Error code reported when a lookup exceeded the resolver's lookup timeout.
pub const RESOLVE_ERROR_TIMEOUT: i32 = 2;
/// Error code reported when the system resolver failed without a code of its own.
pub const RESOLVE_ERROR_FAILED: i32 = 3;

/// Identifies one call to [`AddressResolver::resolve`].
pub type LookupId = u64;

static NEXT_TOKEN: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum AddressFamily {
    V4,
    V6,
}

impl AddressFamily {
    pub fn of(ip: &IpAddr) -> Self {
        match ip {
            IpAddr::V4(_) => AddressFamily::V4,
            IpAddr::V6(_) => AddressFamily::V6,
        }
    }

    pub fn matches(&self, ip: &IpAddr) -> bool {
        Self::of(ip) == *self
    }
}

impl fmt::Display for AddressFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AddressFamily::V4 => write!(f, "ipv4"),
            AddressFamily::V6 => write!(f, "ipv6"),
        }
    }
}

/// A lookup the I/O owner has to perform.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolveRequest {
    /// Unique across all resolvers; echo it in the [`ResolveResponse`].
    pub token: u64,
    pub host: String,
    pub family: AddressFamily,
}

/// The answer to a [`ResolveRequest`]: resolved addresses, or a non-zero
/// error code.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolveResponse {
    pub token: u64,
    pub result: std::result::Result<Vec<IpAddr>, i32>,
}

/// Completion of one [`AddressResolver::resolve`] call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolveEvent<C> {
    pub lookup: LookupId,
    pub host: String,
    pub family: AddressFamily,
    pub context: C,
    pub result: std::result::Result<IpAddr, i32>,
}

impl<C> ResolveEvent<C> {
    /// 0 on success, the failure code otherwise.
    pub fn error_code(&self) -> i32 {
        match self.result {
            Ok(_) => 0,
            Err(code) => code,
        }
    }
}

struct Waiter<C> {
    lookup: LookupId,
    context: C,
}

struct Lookup<C> {
    token: u64,
    host: String,
    family: AddressFamily,
    started: Instant,
    waiters: Vec<Waiter<C>>,
}

/// Deduplicating, sans-I/O hostname resolver.
pub struct AddressResolver<C> {
    lookups: Vec<Lookup<C>>,
    resolved: HashMap<(String, AddressFamily), IpAddr>,
    next_lookup_id: LookupId,
    lookup_timeout: Option<Duration>,
    write_outs: VecDeque<ResolveRequest>,
    event_outs: VecDeque<ResolveEvent<C>>,
    closed: bool,
}

impl<C> Default for AddressResolver<C> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C> AddressResolver<C> {
    pub fn new() -> Self {
        Self {
            lookups: vec![],
            resolved: HashMap::new(),
            next_lookup_id: 1,
            lookup_timeout: None,
            write_outs: VecDeque::new(),
            event_outs: VecDeque::new(),
            closed: false,
        }
    }

    /// Fails lookups that stay unanswered for `timeout` with
    /// [`RESOLVE_ERROR_TIMEOUT`].
    pub fn with_lookup_timeout(mut self, timeout: Duration) -> Self {
        self.lookup_timeout = Some(timeout);
        self
    }

    /// Starts resolving `host`, or joins the lookup already in flight for
    /// the same host and family.
    ///
    /// IP literals of the requested family complete at once without a
    /// request.
    ///
    /// # Errors
    ///
    /// [`Error::ErrHostnameEmpty`] for an empty host,
    /// [`Error::ErrAlreadyClosed`] after close.
    pub fn resolve(
        &mut self,
        host: &str,
        family: AddressFamily,
        context: C,
        now: Instant,
    ) -> Result<LookupId> {
        if self.closed {
            return Err(Error::ErrAlreadyClosed);
        }
        if host.is_empty() {
            return Err(Error::ErrHostnameEmpty);
        }

        let lookup = self.next_lookup_id;
        self.next_lookup_id += 1;

        if let Ok(ip) = host.parse::<IpAddr>() {
            let result = if family.matches(&ip) {
                Ok(ip)
            } else {
                Err(RESOLVE_ERROR_NO_ADDRESS)
            };
            self.event_outs.push_back(ResolveEvent {
                lookup,
                host: host.to_owned(),
                family,
                context,
                result,
            });
            return Ok(lookup);
        }

        if let Some(pending) = self
            .lookups
            .iter_mut()
            .find(|l| l.host == host && l.family == family)
        {
            trace!("joining lookup {} for {} ({})", pending.token, host, family);
            pending.waiters.push(Waiter { lookup, context });
            return Ok(lookup);
        }

        let token = NEXT_TOKEN.fetch_add(1, Ordering::Relaxed);
        debug!("resolving {host} ({family}) with token {token}");
        self.lookups.push(Lookup {
            token,
            host: host.to_owned(),
            family,
            started: now,
            waiters: vec![Waiter { lookup, context }],
        });
        self.write_outs.push_back(ResolveRequest {
            token,
            host: host.to_owned(),
            family,
        });

        Ok(lookup)
    }

    /// Best-effort synchronous lookup into completed resolutions.
    pub fn get_resolved_address(&self, host: &str, family: AddressFamily) -> Option<IpAddr> {
        self.resolved.get(&(host.to_owned(), family)).copied()
    }

    /// Whether `lookup` still waits for its answer.
    pub fn is_lookup_pending(&self, lookup: LookupId) -> bool {
        self.lookups
            .iter()
            .any(|l| l.waiters.iter().any(|w| w.lookup == lookup))
    }

    /// Number of distinct lookups in flight.
    pub fn pending_lookup_count(&self) -> usize {
        self.lookups.len()
    }

    /// Whether `token` belongs to a lookup of this resolver that is still in flight.
    pub fn has_token(&self, token: u64) -> bool {
        self.lookups.iter().any(|l| l.token == token)
    }

    /// Withdraws one call. The shared lookup keeps running for the other
    /// callers; with none left it is dropped.
    ///
    /// # Errors
    ///
    /// [`Error::ErrLookupNotPending`] if `lookup` already completed.
    pub fn cancel(&mut self, lookup: LookupId) -> Result<()> {
        let index = self
            .lookups
            .iter()
            .position(|l| l.waiters.iter().any(|w| w.lookup == lookup))
            .ok_or(Error::ErrLookupNotPending)?;

        let l = &mut self.lookups[index];
        l.waiters.retain(|w| w.lookup != lookup);
        if l.waiters.is_empty() {
            let token = l.token;
            trace!("dropping lookup {} for {}, no callers left", token, l.host);
            self.lookups.remove(index);
            self.write_outs.retain(|r| r.token != token);
        }
        Ok(())
    }

    /// Drops every in-flight lookup. No event fires for them, and late
    /// answers are ignored.
    pub fn abandon_all(&mut self) {
        if !self.lookups.is_empty() {
            debug!("abandoning {} lookups", self.lookups.len());
        }
        self.lookups.clear();
        self.write_outs.clear();
    }

    fn complete(&mut self, index: usize, result: std::result::Result<IpAddr, i32>) {
        let l = self.lookups.remove(index);
        match result {
            Ok(ip) => {
                debug!("resolved {} ({}) to {}", l.host, l.family, ip);
                self.resolved.insert((l.host.clone(), l.family), ip);
            }
            Err(code) => {
                debug!("resolving {} ({}) failed with {}", l.host, l.family, code);
                self.resolved.remove(&(l.host.clone(), l.family));
            }
        }
        for w in l.waiters {
            self.event_outs.push_back(ResolveEvent {
                lookup: w.lookup,
                host: l.host.clone(),
                family: l.family,
                context: w.context,
                result,
            });
        }
    }
}

impl<C> sansio::Protocol<ResolveResponse, (), ()> for AddressResolver<C> {
    type Rout = ();
    type Wout = ResolveRequest;
    type Eout = ResolveEvent<C>;
    type Error = Error;
    type Time = Instant;

    /// Completes the lookup `msg.token` names. Unknown or stale tokens are
    /// ignored.
    fn handle_read(&mut self, msg: ResolveResponse) -> Result<()> {
        if self.closed {
            return Err(Error::ErrAlreadyClosed);
        }

        let Some(index) = self.lookups.iter().position(|l| l.token == msg.token) else {
            trace!("ignoring stale resolve response {}", msg.token);
            return Ok(());
        };

        let family = self.lookups[index].family;
        let result = match msg.result {
            Ok(addrs) => addrs
                .into_iter()
                .find(|ip| family.matches(ip))
                .ok_or(RESOLVE_ERROR_NO_ADDRESS),
            Err(0) => Err(RESOLVE_ERROR_FAILED),
            Err(code) => Err(code),
        };
        self.complete(index, result);

        Ok(())
    }

    fn poll_read(&mut self) -> Option<Self::Rout> {
        None
    }

    fn handle_write(&mut self, _msg: ()) -> Result<()> {
        Ok(())
    }

    fn poll_write(&mut self) -> Option<Self::Wout> {
        self.write_outs.pop_front()
    }

    fn handle_event(&mut self, _evt: ()) -> Result<()> {
        Ok(())
    }

    fn poll_event(&mut self) -> Option<Self::Eout> {
        self.event_outs.pop_front()
    }

    fn handle_timeout(&mut self, now: Instant) -> Result<()> {
        if self.closed {
            return Err(Error::ErrAlreadyClosed);
        }
        let Some(timeout) = self.lookup_timeout else {
            return Ok(());
        };

        while let Some(index) = self
            .lookups
            .iter()
            .position(|l| now.saturating_duration_since(l.started) >= timeout)
        {
            self.complete(index, Err(RESOLVE_ERROR_TIMEOUT));
        }
        Ok(())
    }

    fn poll_timeout(&mut self) -> Option<Instant> {
        let timeout = self.lookup_timeout?;
        self.lookups.iter().map(|l| l.started + timeout).min()
    }

    /// Abandons all lookups and clears queued requests and events.
    fn close(&mut self) -> Result<()> {
        self.closed = true;
        self.abandon_all();
        self.event_outs.clear();
        Ok(())
    }
}

/// Performs `request` with the system resolver, blocking the calling thread.
pub fn resolve_blocking(request: &ResolveRequest) -> ResolveResponse {
    let use_ipv4 = request.family == AddressFamily::V4;
    let result = match lookup_host(use_ipv4, (request.host.as_str(), 0)) {
        Ok(addr) => Ok(vec![addr.ip()]),
        Err(Error::ErrAddressParseFailed) => Err(RESOLVE_ERROR_NO_ADDRESS),
        Err(err) => {
            debug!("lookup of {} failed: {}", request.host, err);
            Err(RESOLVE_ERROR_FAILED)
        }
    };
    ResolveResponse {
        token: request.token,
        result,
    }
}
