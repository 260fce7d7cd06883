
use log::{debug, trace};
use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use stun::error_code::{
    CODE_ROLE_CONFLICT, CODE_SERVER_ERROR, CODE_UNAUTHORIZED, CODE_UNKNOWN_ATTRIBUTE, ErrorCode,
};
use stun::message::TransactionId;

use crate::attributes::control::Role;
use crate::candidate::{Candidate, pair_priority};

/// A writable connection turns unreliable once this many pings are overdue
/// and the oldest is at least `CONNECTION_WRITE_CONNECT_TIMEOUT` old.
pub(crate) const CONNECTION_WRITE_CONNECT_FAILURES: usize = 5;
pub(crate) const CONNECTION_WRITE_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
/// A connection that is not writable times out when its oldest unanswered
/// ping is this old.
pub(crate) const CONNECTION_WRITE_TIMEOUT: Duration = Duration::from_secs(15);
/// How long a single connectivity check waits for its response.
pub(crate) const CONNECTION_RESPONSE_TIMEOUT: Duration = Duration::from_secs(5);
/// Round-trip estimate before the first sample.
pub(crate) const DEFAULT_RTT: Duration = Duration::from_secs(3);
pub(crate) const DEFAULT_RECEIVING_TIMEOUT: Duration = Duration::from_millis(2500);

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Opaque handle of a [`Connection`], unique for the life of the process.
///
/// Controllers hold handles, never references; looking up a handle of a
/// destroyed connection simply finds nothing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct ConnectionId(pub u64);

impl ConnectionId {
    pub(crate) fn next() -> Self {
        ConnectionId(NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn#{}", self.0)
    }
}

/// Resolves connection handles for policy code that does not own them.
pub trait ConnectionLookup {
    fn connection(&self, id: ConnectionId) -> Option<&Connection>;
}

/// Write state of a connection, best first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub enum WriteState {
    /// Recent pings were answered.
    #[serde(rename = "writable")]
    Writable,
    /// Several recent pings went unanswered.
    #[serde(rename = "unreliable")]
    WriteUnreliable,
    /// No ping has been answered yet.
    #[serde(rename = "init")]
    WriteInit,
    /// No response for too long; the connection is considered failed.
    #[serde(rename = "timeout")]
    WriteTimeout,
}

impl fmt::Display for WriteState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match *self {
            WriteState::Writable => "writable",
            WriteState::WriteUnreliable => "unreliable",
            WriteState::WriteInit => "init",
            WriteState::WriteTimeout => "timeout",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone, Copy)]
struct SentPing {
    transaction_id: TransactionId,
    sent_at: Instant,
    nominating: bool,
}

/// Counters of one connection.
#[derive(Default, Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ConnectionStats {
    pub pings_sent: u64,
    pub ping_responses_received: u64,
    pub ping_requests_received: u64,
    pub packets_sent: u64,
    pub packets_received: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub rtt: Duration,
    pub total_round_trip_time: Duration,
}

/// A local/remote candidate pair owned by a port.
#[derive(Debug, Clone)]
pub struct Connection {
    id: ConnectionId,
    local: Candidate,
    remote: Candidate,
    ice_role: Role,

    write_state: WriteState,
    receiving: bool,
    receiving_timeout: Duration,
    nominated: bool,
    remote_nominated: bool,

    created_at: Instant,
    last_ping_sent: Option<Instant>,
    last_ping_received: Option<Instant>,
    last_ping_response_received: Option<Instant>,
    last_data_received: Option<Instant>,
    pings_since_last_response: Vec<SentPing>,

    rtt: Duration,
    rtt_samples: u32,
    stats: ConnectionStats,
}

impl fmt::Display for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}[{} -> {}|{}|{}|rtt={}ms]",
            self.id,
            self.local.address(),
            self.remote.address(),
            self.write_state,
            if self.receiving { "R" } else { "-" },
            self.rtt.as_millis()
        )
    }
}

impl Connection {
    pub(crate) fn new(local: Candidate, remote: Candidate, ice_role: Role, now: Instant) -> Self {
        Self {
            id: ConnectionId::next(),
            local,
            remote,
            ice_role,
            write_state: WriteState::WriteInit,
            receiving: false,
            receiving_timeout: DEFAULT_RECEIVING_TIMEOUT,
            nominated: false,
            remote_nominated: false,
            created_at: now,
            last_ping_sent: None,
            last_ping_received: None,
            last_ping_response_received: None,
            last_data_received: None,
            pings_since_last_response: vec![],
            rtt: DEFAULT_RTT,
            rtt_samples: 0,
            stats: ConnectionStats {
                rtt: DEFAULT_RTT,
                ..Default::default()
            },
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn local_candidate(&self) -> &Candidate {
        &self.local
    }

    pub fn remote_candidate(&self) -> &Candidate {
        &self.remote
    }

    pub fn write_state(&self) -> WriteState {
        self.write_state
    }

    pub fn writable(&self) -> bool {
        self.write_state == WriteState::Writable
    }

    pub fn write_timed_out(&self) -> bool {
        self.write_state == WriteState::WriteTimeout
    }

    /// True when something arrived within the receiving timeout.
    pub fn receiving(&self) -> bool {
        self.receiving
    }

    /// True once the pair was nominated, by either side.
    pub fn nominated(&self) -> bool {
        self.nominated || self.remote_nominated
    }

    /// True if the controlling peer sent USE-CANDIDATE on this pair.
    pub fn remote_nominated(&self) -> bool {
        self.remote_nominated
    }

    /// Smoothed round-trip time.
    pub fn rtt(&self) -> Duration {
        self.rtt
    }

    pub fn rtt_samples(&self) -> u32 {
        self.rtt_samples
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    pub fn last_ping_sent(&self) -> Option<Instant> {
        self.last_ping_sent
    }

    pub fn last_ping_received(&self) -> Option<Instant> {
        self.last_ping_received
    }

    pub fn last_ping_response_received(&self) -> Option<Instant> {
        self.last_ping_response_received
    }

    /// Latest time anything arrived on this pair.
    pub fn last_received(&self) -> Option<Instant> {
        [
            self.last_ping_received,
            self.last_ping_response_received,
            self.last_data_received,
        ]
        .into_iter()
        .flatten()
        .max()
    }

    pub fn unanswered_pings(&self) -> usize {
        self.pings_since_last_response.len()
    }

    pub fn stats(&self) -> ConnectionStats {
        self.stats
    }

    pub fn ice_role(&self) -> Role {
        self.ice_role
    }

    /// Pair priority from the point of view of our ICE role.
    pub fn priority(&self) -> u64 {
        let (local, remote) = (self.local.priority(), self.remote.priority());
        if self.ice_role == Role::Controlling {
            pair_priority(local, remote)
        } else {
            pair_priority(remote, local)
        }
    }

    /// Combined cost of both networks the pair crosses.
    pub fn network_cost(&self) -> u16 {
        self.local
            .network_cost()
            .saturating_add(self.remote.network_cost())
    }

    pub fn generation(&self) -> u32 {
        self.local.generation()
    }

    pub(crate) fn set_ice_role(&mut self, role: Role) {
        self.ice_role = role;
    }

    pub(crate) fn set_receiving_timeout(&mut self, timeout: Duration) {
        self.receiving_timeout = timeout;
    }

    pub(crate) fn set_local_candidate(&mut self, local: Candidate) {
        self.local = local;
    }

    pub(crate) fn set_remote_candidate(&mut self, remote: Candidate) {
        self.remote = remote;
    }

    pub(crate) fn on_ping_sent(&mut self, transaction_id: TransactionId, nominating: bool, now: Instant) {
        self.last_ping_sent = Some(now);
        self.stats.pings_sent += 1;
        self.pings_since_last_response.push(SentPing {
            transaction_id,
            sent_at: now,
            nominating,
        });
        trace!("{self}: sent ping {transaction_id:?}");
    }

    /// Records a response to one of our pings. Returns true if the state changed.
    pub(crate) fn on_ping_response(
        &mut self,
        transaction_id: TransactionId,
        rtt: Duration,
        now: Instant,
    ) -> bool {
        let before = self.snapshot();

        let nominating = self
            .pings_since_last_response
            .iter()
            .find(|p| p.transaction_id == transaction_id)
            .is_some_and(|p| p.nominating);
        self.pings_since_last_response.clear();

        self.last_ping_response_received = Some(now);
        self.stats.ping_responses_received += 1;
        self.stats.total_round_trip_time += rtt;
        self.rtt = (self.rtt * 3 + rtt) / 4;
        self.rtt_samples += 1;
        self.stats.rtt = self.rtt;

        if nominating && self.ice_role == Role::Controlling {
            self.nominated = true;
        }
        self.write_state = WriteState::Writable;
        self.update_receiving(now);

        before != self.snapshot()
    }

    /// The peer rejected one of our pings. Returns true if the state changed.
    ///
    /// 401, 420 and 500 are transient and the next ping retries. A 487 role
    /// conflict is left to the port. Any other code fails the connection.
    pub(crate) fn on_ping_error(&mut self, code: u16, now: Instant) -> bool {
        if matches!(
            ErrorCode(code),
            CODE_UNAUTHORIZED | CODE_UNKNOWN_ATTRIBUTE | CODE_SERVER_ERROR | CODE_ROLE_CONFLICT
        ) {
            debug!("{self}: ping rejected with {code}, will retry");
            return false;
        }

        let before = self.snapshot();
        debug!("{self}: ping rejected with {code}");
        self.last_ping_response_received = Some(now);
        self.write_state = WriteState::WriteTimeout;
        before != self.snapshot()
    }

    /// Records a valid binding request. Returns true if this request newly
    /// nominated the pair.
    pub(crate) fn on_ping_request(&mut self, use_candidate: bool, now: Instant) -> bool {
        self.last_ping_received = Some(now);
        self.stats.ping_requests_received += 1;
        self.update_receiving(now);

        if use_candidate && self.ice_role == Role::Controlled && !self.remote_nominated {
            self.remote_nominated = true;
            debug!("{self}: nominated by remote");
            return true;
        }
        false
    }

    pub(crate) fn on_data_received(&mut self, len: usize, now: Instant) {
        self.last_data_received = Some(now);
        self.stats.packets_received += 1;
        self.stats.bytes_received += len as u64;
        self.update_receiving(now);
    }

    pub(crate) fn on_data_sent(&mut self, len: usize) {
        self.stats.packets_sent += 1;
        self.stats.bytes_sent += len as u64;
    }

    /// Re-evaluates write and receiving state at `now`.
    /// Returns true if either changed.
    pub(crate) fn update_state(&mut self, now: Instant) -> bool {
        let before = self.snapshot();

        if self.write_state == WriteState::Writable
            && self.too_many_failures(now)
            && self.too_long_without_response(CONNECTION_WRITE_CONNECT_TIMEOUT, now)
        {
            debug!(
                "{self}: unreliable after {} unanswered pings",
                self.pings_since_last_response.len()
            );
            self.write_state = WriteState::WriteUnreliable;
        }

        if matches!(
            self.write_state,
            WriteState::WriteInit | WriteState::WriteUnreliable
        ) && self.too_long_without_response(CONNECTION_WRITE_TIMEOUT, now)
        {
            debug!("{self}: timed out");
            self.write_state = WriteState::WriteTimeout;
        }

        self.update_receiving(now);

        before != self.snapshot()
    }

    /// Earliest instant at which [`update_state`](Self::update_state) could
    /// change something without new input.
    pub(crate) fn next_state_deadline(&self) -> Option<Instant> {
        let mut deadlines = vec![];

        if self.receiving
            && let Some(last) = self.last_received()
        {
            deadlines.push(last + self.receiving_timeout);
        }

        if let Some(first) = self.pings_since_last_response.first() {
            match self.write_state {
                WriteState::Writable => {
                    // The failure count only grows as more pings go out.
                    if self.pings_since_last_response.len() >= CONNECTION_WRITE_CONNECT_FAILURES {
                        let nth = self.pings_since_last_response[CONNECTION_WRITE_CONNECT_FAILURES - 1];
                        deadlines.push(
                            (first.sent_at + CONNECTION_WRITE_CONNECT_TIMEOUT)
                                .max(nth.sent_at + self.rtt),
                        );
                    }
                }
                WriteState::WriteInit | WriteState::WriteUnreliable => {
                    deadlines.push(first.sent_at + CONNECTION_WRITE_TIMEOUT);
                }
                WriteState::WriteTimeout => {}
            }
        }

        deadlines.into_iter().min()
    }

    fn update_receiving(&mut self, now: Instant) {
        let receiving = self
            .last_received()
            .is_some_and(|last| now.saturating_duration_since(last) < self.receiving_timeout);
        if receiving != self.receiving {
            trace!("{self}: receiving {receiving}");
            self.receiving = receiving;
        }
    }

    // Pings whose response is overdue by the current RTT estimate.
    fn too_many_failures(&self, now: Instant) -> bool {
        self.pings_since_last_response
            .iter()
            .filter(|p| p.sent_at + self.rtt <= now)
            .count()
            >= CONNECTION_WRITE_CONNECT_FAILURES
    }

    fn too_long_without_response(&self, maximum: Duration, now: Instant) -> bool {
        self.pings_since_last_response
            .first()
            .is_some_and(|p| now.saturating_duration_since(p.sent_at) >= maximum)
    }

    fn snapshot(&self) -> (WriteState, bool, bool) {
        (self.write_state, self.receiving, self.nominated())
    }
}
