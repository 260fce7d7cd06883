//! UDP port: host and server reflexive candidate gathering, STUN keepalives
//! and the connections that send through the port's socket.
//!
//! [`UdpPort`] is sans-I/O. The embedding layer owns the socket and moves
//! datagrams in and out:
//!
//! * datagrams received on the socket go to [`handle_read()`](sansio::Protocol::handle_read);
//!   application data from known connections comes back from
//!   [`poll_read()`](sansio::Protocol::poll_read)
//! * everything from [`poll_write()`](sansio::Protocol::poll_write) is sent
//!   on the socket
//! * name lookups surface as [`PortEvent::ResolveRequested`]; their answers,
//!   send failures and socket readiness go to
//!   [`handle_event()`](sansio::Protocol::handle_event)
//! * [`handle_timeout()`](sansio::Protocol::handle_timeout) runs
//!   retransmissions, keepalives and connection state updates
//!
//! After [`close()`](sansio::Protocol::close) nothing is emitted any more.


mod port_config;
mod server_addresses;

pub use port_config::PortConfig;
pub use server_addresses::{ServerAddresses, StunServerAddress};

use bytes::BytesMut;
use log::{debug, info, trace, warn};
use sansio::Protocol;
use serde::Serialize;
use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::net::{IpAddr, SocketAddr, UdpSocket};
use std::time::{Duration, Instant};

use shared::error::{Error, Result};
use shared::util::bind_udp_in_range;
use shared::{TaggedBytesMut, TransportContext, TransportMessage, TransportProtocol};
use stun::addr::MappedAddress;
use stun::attributes::{ATTR_MESSAGE_INTEGRITY, ATTR_USERNAME};
use stun::error_code::*;
use stun::fingerprint::FINGERPRINT;
use stun::integrity::MessageIntegrity;
use stun::message::*;
use stun::textattrs::{TextAttribute, Username};
use stun::xoraddr::XorMappedAddress;

use crate::attributes::control::{AttrControlled, AttrControlling, Role};
use crate::attributes::priority::PriorityAttr;
use crate::attributes::use_candidate::UseCandidateAttr;
use crate::candidate::*;
use crate::connection::{CONNECTION_RESPONSE_TIMEOUT, Connection, ConnectionId, ConnectionLookup};
use crate::network::KeepaliveLifetime;
use crate::rand::{generate_pwd, generate_tie_breaker, generate_ufrag};
use crate::resolver::{AddressFamily, AddressResolver, ResolveEvent, ResolveRequest, ResolveResponse};
use crate::stun_request::{
    RequestEvent, RequestFailure, RequestInput, RequestManager, RetransmitPolicy, SendErrorKind,
    StunRequest,
};

/// Binding requests answered with an error are retried for at most this long
/// after the first request of their chain.
pub(crate) const STUN_RETRY_WINDOW: Duration = Duration::from_secs(50);

const REASON_HOST_LOOKUP: &str = "STUN host lookup received error.";
const REASON_BINDING_TIMEOUT: &str = "STUN binding request timed out.";
const REASON_NETWORK_UNREACHABLE: &str = "STUN server is not reachable.";
const REASON_INCOMPATIBLE_ADDRESS: &str = "STUN server address is incompatible.";
const REASON_NO_MAPPED_ADDRESS: &str = "STUN binding response is missing a mapped address.";

const MAX_DSCP: i32 = 63;

/// Socket options a port records on behalf of the socket's owner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub enum SocketOption {
    DontFragment,
    ReceiveBuffer,
    SendBuffer,
    /// Differentiated services code point, `0..=63`.
    Dscp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum PortState {
    /// Created, gathering not started.
    Init,
    Gathering,
    /// Every STUN server answered or failed and a candidate exists.
    Ready,
    /// Every STUN server failed and no candidate could be gathered.
    Error,
    Closed,
}

impl fmt::Display for PortState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PortState::Init => "init",
            PortState::Gathering => "gathering",
            PortState::Ready => "ready",
            PortState::Error => "error",
            PortState::Closed => "closed",
        };
        write!(f, "{s}")
    }
}

/// Inputs a [`UdpPort`] takes besides datagrams.
#[derive(Debug, Clone)]
pub enum PortInput {
    /// Answer to a [`PortEvent::ResolveRequested`].
    Resolved {
        now: Instant,
        response: ResolveResponse,
    },
    /// Sending `message` failed.
    SendFailed {
        now: Instant,
        transport: TransportContext,
        message: BytesMut,
        kind: SendErrorKind,
    },
    /// The socket sent a datagram.
    SentPacket { local_addr: SocketAddr },
    /// The socket is writable again after backpressure.
    ReadyToSend { local_addr: SocketAddr },
}

/// Signals a [`UdpPort`] emits to its owner.
#[derive(Debug, Clone, PartialEq)]
pub enum PortEvent {
    CandidateReady(Candidate),
    PortReady,
    PortError,
    /// Gathering against `server` failed. 701 means the server was never
    /// reached.
    CandidateGatheringError {
        server: StunServerAddress,
        code: u16,
        reason: String,
    },
    ConnectionCreated(ConnectionId),
    ConnectionDestroyed(ConnectionId),
    /// Write or receiving state of the connection changed.
    ConnectionStateChange(ConnectionId),
    /// The controlling peer nominated the connection.
    NominationReceived(ConnectionId),
    /// A ping was answered with 487: both sides claim the same ICE role.
    /// The owner decides whether to switch roles.
    RoleConflict(ConnectionId),
    /// Resolve the request and feed the answer back as [`PortInput::Resolved`].
    ResolveRequested(ResolveRequest),
    ReadyToSend,
    NetworkCostChanged(u16),
}

/// Counters of the binding requests sent to STUN servers.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StunStats {
    pub stun_binding_requests_sent: u64,
    pub stun_binding_responses_received: u64,
    pub stun_binding_rtt_ms_total: u64,
    pub stun_binding_rtt_ms_squared_total: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RequestContext {
    ServerBinding {
        server: SocketAddr,
        chain_start: Instant,
    },
    ConnectionPing {
        connection: ConnectionId,
        nominating: bool,
    },
}

#[derive(Debug, Clone, Copy)]
struct Keepalive {
    server: SocketAddr,
    at: Instant,
    chain_start: Instant,
}

/// A UDP socket's worth of ICE state.
pub struct UdpPort {
    config: PortConfig,
    local_addr: SocketAddr,
    state: PortState,

    ice_role: Role,
    tie_breaker: u64,
    remote_ufrag: String,
    remote_pwd: String,
    receiving_timeout: Option<Duration>,

    candidates: Vec<Candidate>,
    connections: BTreeMap<ConnectionId, Connection>,
    server_addresses: ServerAddresses,
    requests: RequestManager<RequestContext>,
    resolver: AddressResolver<StunServerAddress>,
    keepalives: Vec<Keepalive>,
    last_inbound: Option<Instant>,

    network_cost: u16,
    keepalive_lifetime: KeepaliveLifetime,
    stun_stats: StunStats,
    send_error_count: u64,
    last_send_error: Option<SendErrorKind>,
    options: BTreeMap<SocketOption, i32>,
    sent_packet_count: u64,

    read_outs: VecDeque<TaggedBytesMut>,
    write_outs: VecDeque<TaggedBytesMut>,
    event_outs: VecDeque<PortEvent>,
}

impl UdpPort {
    /// Creates a port for a socket bound to `local_addr`.
    ///
    /// # Errors
    ///
    /// [`Error::ErrInvalidStunServerAddress`] for a malformed STUN server.
    pub fn new(mut config: PortConfig, local_addr: SocketAddr) -> Result<Self> {
        let servers = config
            .stun_servers
            .iter()
            .map(|s| s.parse::<StunServerAddress>())
            .collect::<Result<Vec<_>>>()?;

        if config.local_ufrag.is_empty() {
            config.local_ufrag = generate_ufrag();
        }
        if config.local_pwd.is_empty() {
            config.local_pwd = generate_pwd();
        }

        let resolve_timeout = config.resolve_timeout;
        let network_cost = config.network_cost;
        let keepalive_lifetime = KeepaliveLifetime::for_network_cost(
            network_cost,
            config.network_cost_high_threshold,
            config.high_cost_keepalive_lifetime,
        );

        Ok(Self {
            config,
            local_addr,
            state: PortState::Init,
            ice_role: Role::default(),
            tie_breaker: generate_tie_breaker(),
            remote_ufrag: String::new(),
            remote_pwd: String::new(),
            receiving_timeout: None,
            candidates: vec![],
            connections: BTreeMap::new(),
            server_addresses: ServerAddresses::new(servers),
            requests: RequestManager::new(),
            resolver: AddressResolver::new().with_lookup_timeout(resolve_timeout),
            options: BTreeMap::new(),
            keepalives: vec![],
            last_inbound: None,
            network_cost,
            keepalive_lifetime,
            stun_stats: StunStats::default(),
            send_error_count: 0,
            last_send_error: None,
            sent_packet_count: 0,
            read_outs: VecDeque::new(),
            write_outs: VecDeque::new(),
            event_outs: VecDeque::new(),
        })
    }

    /// Binds a socket for a port on `ip` within the configured port range.
    ///
    /// # Errors
    ///
    /// [`Error::ErrPortSpaceExhausted`] when every port of the range is taken.
    pub fn bind_socket(ip: IpAddr, config: &PortConfig) -> Result<UdpSocket> {
        bind_udp_in_range(ip, config.min_port, config.max_port)
    }

    pub fn state(&self) -> PortState {
        self.state
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn config(&self) -> &PortConfig {
        &self.config
    }

    pub fn local_ufrag(&self) -> &str {
        &self.config.local_ufrag
    }

    pub fn local_pwd(&self) -> &str {
        &self.config.local_pwd
    }

    pub fn candidates(&self) -> &[Candidate] {
        &self.candidates
    }

    pub fn connections(&self) -> impl Iterator<Item = &Connection> {
        self.connections.values()
    }

    pub fn connection_ids(&self) -> Vec<ConnectionId> {
        self.connections.keys().copied().collect()
    }

    pub fn server_addresses(&self) -> &ServerAddresses {
        &self.server_addresses
    }

    pub fn stun_stats(&self) -> StunStats {
        self.stun_stats
    }

    pub fn network_cost(&self) -> u16 {
        self.network_cost
    }

    pub fn keepalive_lifetime(&self) -> KeepaliveLifetime {
        self.keepalive_lifetime
    }

    pub fn send_error_count(&self) -> u64 {
        self.send_error_count
    }

    /// The last send failure the embedding layer reported.
    pub fn error(&self) -> Option<SendErrorKind> {
        self.last_send_error
    }

    pub fn protocol(&self) -> TransportProtocol {
        TransportProtocol::UDP
    }

    /// Whether candidates of `protocol` (as named in candidate lines) can be
    /// paired with this port.
    pub fn supports_protocol(&self, protocol: &str) -> bool {
        protocol == TransportProtocol::UDP.as_str()
    }

    /// Records a socket option. The socket belongs to the embedding layer,
    /// which reads the options back with [`get_option`](Self::get_option);
    /// [`SocketOption::Dscp`] is also stamped on every outgoing datagram
    /// that does not carry its own.
    ///
    /// # Errors
    ///
    /// [`Error::ErrPortClosed`] after close, and
    /// [`Error::ErrInvalidSocketOptionValue`] for a DSCP outside `0..=63` or
    /// a negative buffer size.
    pub fn set_option(&mut self, option: SocketOption, value: i32) -> Result<()> {
        if self.state == PortState::Closed {
            return Err(Error::ErrPortClosed);
        }
        let valid = match option {
            SocketOption::Dscp => (0..=MAX_DSCP).contains(&value),
            SocketOption::ReceiveBuffer | SocketOption::SendBuffer => value >= 0,
            SocketOption::DontFragment => true,
        };
        if !valid {
            return Err(Error::ErrInvalidSocketOptionValue);
        }
        debug!("port {}: {:?} = {}", self.local_addr, option, value);
        self.options.insert(option, value);
        Ok(())
    }

    pub fn get_option(&self, option: SocketOption) -> Option<i32> {
        self.options.get(&option).copied()
    }

    fn dscp(&self) -> Option<u8> {
        self.get_option(SocketOption::Dscp)
            .and_then(|v| u8::try_from(v).ok())
    }

    pub fn sent_packet_count(&self) -> u64 {
        self.sent_packet_count
    }

    pub fn ice_role(&self) -> Role {
        self.ice_role
    }

    pub fn tie_breaker(&self) -> u64 {
        self.tie_breaker
    }

    /// Whether a [`ResolveResponse`] with this token belongs to this port.
    pub fn has_lookup_token(&self, token: u64) -> bool {
        self.resolver.has_token(token)
    }

    /// Connection whose remote candidate has `remote` as its address.
    pub fn connection_for(&self, remote: SocketAddr) -> Option<&Connection> {
        self.connections
            .values()
            .find(|c| c.remote_candidate().address() == remote)
    }

    pub fn set_remote_credentials(&mut self, ufrag: &str, pwd: &str) {
        self.remote_ufrag = ufrag.to_owned();
        self.remote_pwd = pwd.to_owned();
    }

    pub fn set_ice_role(&mut self, role: Role) {
        self.ice_role = role;
        for conn in self.connections.values_mut() {
            conn.set_ice_role(role);
        }
    }

    pub fn set_ice_tiebreaker(&mut self, tie_breaker: u64) {
        self.tie_breaker = tie_breaker;
    }

    pub fn set_receiving_timeout(&mut self, timeout: Duration) {
        self.receiving_timeout = Some(timeout);
        for conn in self.connections.values_mut() {
            conn.set_receiving_timeout(timeout);
        }
    }

    /// Moves the port onto a network of a different cost.
    ///
    /// Candidates are replaced by copies carrying the new cost, and the
    /// keepalive lifetime is re-evaluated at once: chains already older than
    /// the new lifetime stop.
    pub fn set_network_cost(&mut self, network_cost: u16, now: Instant) {
        if self.state == PortState::Closed || network_cost == self.network_cost {
            return;
        }

        info!(
            "port {}: network cost {} -> {}",
            self.local_addr, self.network_cost, network_cost
        );
        self.network_cost = network_cost;
        self.keepalive_lifetime = KeepaliveLifetime::for_network_cost(
            network_cost,
            self.config.network_cost_high_threshold,
            self.config.high_cost_keepalive_lifetime,
        );

        self.candidates = self
            .candidates
            .iter()
            .map(|c| c.with_network_cost(network_cost))
            .collect();
        for conn in self.connections.values_mut() {
            let local = conn.local_candidate().with_network_cost(network_cost);
            conn.set_local_candidate(local);
        }

        let lifetime = self.keepalive_lifetime;
        let last_inbound = self.last_inbound;
        self.keepalives.retain(|k| {
            let allowed = lifetime.allows(chain_age(k.chain_start, last_inbound, now));
            if !allowed {
                debug!("keepalive to {} outlived the new network cost", k.server);
            }
            allowed
        });

        self.event_outs
            .push_back(PortEvent::NetworkCostChanged(network_cost));
    }

    /// Starts gathering: emits the host candidate and kicks off a binding
    /// request (or a name lookup first) per configured STUN server.
    ///
    /// Calling it again once gathering started does nothing.
    pub fn prepare_address(&mut self, now: Instant) -> Result<()> {
        if self.state == PortState::Closed {
            return Err(Error::ErrPortClosed);
        }
        if self.state != PortState::Init {
            trace!("port {}: already {}", self.local_addr, self.state);
            return Ok(());
        }
        self.state = PortState::Gathering;
        debug!(
            "port {}: gathering with {} STUN servers",
            self.local_addr,
            self.server_addresses.configured().len()
        );

        if !self.config.server_reflexive_only
            && let Some(address) = self.host_address()
        {
            let host = CandidateHostConfig {
                base_config: self.candidate_config(address),
            }
            .new_candidate_host()?;
            self.add_candidate(host);
        }

        let servers: Vec<StunServerAddress> =
            self.server_addresses.configured().iter().cloned().collect();
        for server in servers {
            self.start_server_binding(server, now);
        }

        self.drive(now);
        self.maybe_ready();
        Ok(())
    }

    /// Pairs `remote` with this port's first local candidate.
    ///
    /// A second call for the same remote address returns the existing
    /// connection. A peer reflexive remote is upgraded in place when the
    /// signaled candidate arrives.
    pub fn create_connection(&mut self, remote: &Candidate, now: Instant) -> Result<ConnectionId> {
        if self.state == PortState::Closed {
            return Err(Error::ErrPortClosed);
        }
        let local = self
            .candidates
            .first()
            .ok_or(Error::ErrNoLocalCandidate)?
            .clone();
        if !self.supports_protocol(remote.protocol().as_str())
            || !local.is_compatible_with(remote)
        {
            return Err(Error::ErrIncompatibleRemoteCandidate);
        }

        if let Some(conn) = self
            .connections
            .values_mut()
            .find(|c| c.remote_candidate().address() == remote.address())
        {
            if conn.remote_candidate().candidate_type() == CandidateType::PeerReflexive
                && remote.candidate_type() != CandidateType::PeerReflexive
            {
                debug!("{conn}: learned signaled remote {remote}");
                conn.set_remote_candidate(remote.clone());
            }
            return Ok(conn.id());
        }

        Ok(self.add_connection(local, remote.clone(), now))
    }

    /// Removes the connection and cancels its outstanding pings.
    pub fn destroy_connection(&mut self, id: ConnectionId) -> Result<()> {
        let conn = self
            .connections
            .remove(&id)
            .ok_or(Error::ErrConnectionNotFound)?;
        debug!("{conn}: destroyed");

        self.requests.cancel_where(|ctx| {
            matches!(ctx, RequestContext::ConnectionPing { connection, .. } if *connection == id)
        });

        self.event_outs.push_back(PortEvent::ConnectionDestroyed(id));
        Ok(())
    }

    /// Sends a connectivity check on the connection. `use_candidate`
    /// nominates the pair when this side is controlling.
    ///
    /// # Errors
    ///
    /// [`Error::ErrConnectionNotFound`], [`Error::ErrRemoteCredentialsNotSet`]
    /// when neither the remote candidate nor the port has remote credentials.
    pub fn ping(
        &mut self,
        id: ConnectionId,
        use_candidate: bool,
        now: Instant,
    ) -> Result<TransactionId> {
        if self.state == PortState::Closed {
            return Err(Error::ErrPortClosed);
        }
        let conn = self
            .connections
            .get(&id)
            .ok_or(Error::ErrConnectionNotFound)?;

        let remote = conn.remote_candidate();
        let (remote_ufrag, remote_pwd) = if remote.username().is_empty() {
            (self.remote_ufrag.clone(), self.remote_pwd.clone())
        } else {
            (remote.username().to_owned(), remote.password().to_owned())
        };
        if remote_ufrag.is_empty() || remote_pwd.is_empty() {
            return Err(Error::ErrRemoteCredentialsNotSet);
        }

        let nominating = use_candidate && self.ice_role == Role::Controlling;
        let priority = (u32::from(CandidateType::PeerReflexive.preference()) << 24)
            | (conn.local_candidate().priority() & 0x00FF_FFFF);
        let peer = remote.address();

        let mut setters: Vec<Box<dyn Setter>> = vec![
            Box::new(BINDING_REQUEST),
            Box::new(TransactionId::new()),
            Box::new(Username::new(
                ATTR_USERNAME,
                format!("{}:{}", remote_ufrag, self.config.local_ufrag),
            )),
            Box::new(PriorityAttr(priority)),
        ];
        match self.ice_role {
            Role::Controlling => setters.push(Box::new(AttrControlling(self.tie_breaker))),
            Role::Controlled => setters.push(Box::new(AttrControlled(self.tie_breaker))),
        }
        if nominating {
            setters.push(Box::new(UseCandidateAttr::new()));
        }
        setters.push(Box::new(MessageIntegrity::new_short_term_integrity(
            remote_pwd,
        )));
        setters.push(Box::new(FINGERPRINT));

        let mut message = Message::new();
        message.build(&setters)?;

        let transaction_id = self.requests.send(TransportMessage::udp(
            now,
            self.local_addr,
            peer,
            StunRequest {
                message,
                context: RequestContext::ConnectionPing {
                    connection: id,
                    nominating,
                },
                policy: RetransmitPolicy::no_retransmit(CONNECTION_RESPONSE_TIMEOUT),
            },
        ))?;

        if let Some(conn) = self.connections.get_mut(&id) {
            conn.on_ping_sent(transaction_id, nominating, now);
        }
        self.drive(now);
        Ok(transaction_id)
    }

    fn host_address(&self) -> Option<SocketAddr> {
        if !self.local_addr.ip().is_unspecified() {
            return Some(self.local_addr);
        }
        if !self.config.emit_local_for_anyaddress {
            debug!(
                "port {}: bound to the any-address, no host candidate",
                self.local_addr
            );
            return None;
        }
        let ip = self
            .config
            .default_local_address
            .filter(|ip| ip.is_ipv4() == self.local_addr.is_ipv4())
            .unwrap_or(self.local_addr.ip());
        Some(SocketAddr::new(ip, self.local_addr.port()))
    }

    fn candidate_config(&self, address: SocketAddr) -> CandidateConfig {
        CandidateConfig {
            protocol: TransportProtocol::UDP,
            address: Some(address),
            component: self.config.component,
            network_name: self.config.network_name.clone(),
            network_cost: self.network_cost,
            generation: self.config.generation,
            username: self.config.local_ufrag.clone(),
            password: self.config.local_pwd.clone(),
            ..Default::default()
        }
    }

    fn add_candidate(&mut self, candidate: Candidate) {
        info!("port {}: gathered {}", self.local_addr, candidate);
        self.candidates.push(candidate.clone());
        self.event_outs
            .push_back(PortEvent::CandidateReady(candidate));
    }

    fn add_connection(&mut self, local: Candidate, remote: Candidate, now: Instant) -> ConnectionId {
        let mut conn = Connection::new(local, remote, self.ice_role, now);
        if let Some(timeout) = self.receiving_timeout {
            conn.set_receiving_timeout(timeout);
        }
        let id = conn.id();
        debug!("{conn}: created");
        self.connections.insert(id, conn);
        self.event_outs.push_back(PortEvent::ConnectionCreated(id));
        id
    }

    fn start_server_binding(&mut self, server: StunServerAddress, now: Instant) {
        match server {
            StunServerAddress::Resolved(addr) => {
                if addr.is_ipv4() != self.local_addr.is_ipv4() {
                    self.on_binding_failed(
                        &server,
                        CODE_SERVER_NOT_REACHABLE.0,
                        REASON_INCOMPATIBLE_ADDRESS,
                    );
                    return;
                }
                self.send_binding_request(addr, now, now);
            }
            StunServerAddress::Unresolved { ref host, .. } => {
                let family = AddressFamily::of(&self.local_addr.ip());
                if let Err(err) = self
                    .resolver
                    .resolve(host, family, server.clone(), now)
                {
                    warn!("port {}: cannot resolve {}: {}", self.local_addr, server, err);
                    self.on_binding_failed(&server, CODE_SERVER_NOT_REACHABLE.0, REASON_HOST_LOOKUP);
                }
            }
        }
    }

    fn send_binding_request(&mut self, server: SocketAddr, chain_start: Instant, now: Instant) {
        let mut message = Message::new();
        if let Err(err) = message.build(&[Box::new(BINDING_REQUEST), Box::new(TransactionId::new())])
        {
            warn!("port {}: failed to build binding request: {}", self.local_addr, err);
            return;
        }

        match self.requests.send(TransportMessage::udp(
            now,
            self.local_addr,
            server,
            StunRequest {
                message,
                context: RequestContext::ServerBinding {
                    server,
                    chain_start,
                },
                policy: self.config.retransmit,
            },
        )) {
            Ok(_) => self.stun_stats.stun_binding_requests_sent += 1,
            Err(err) => warn!("port {}: binding request to {} not sent: {}", self.local_addr, server, err),
        }
    }

    /// Moves outputs of the request engine and the resolver into the port's
    /// queues and reacts to their events until nothing new comes out.
    fn drive(&mut self, now: Instant) {
        loop {
            while let Some(w) = self.requests.poll_write() {
                self.write_outs.push_back(w);
            }
            while let Some(r) = self.resolver.poll_write() {
                self.event_outs.push_back(PortEvent::ResolveRequested(r));
            }

            let mut progressed = false;
            while let Some(evt) = self.requests.poll_event() {
                progressed = true;
                self.on_request_event(evt, now);
            }
            while let Some(evt) = self.resolver.poll_event() {
                progressed = true;
                self.on_resolve_event(evt, now);
            }
            if !progressed {
                break;
            }
        }
    }

    fn on_resolve_event(&mut self, evt: ResolveEvent<StunServerAddress>, now: Instant) {
        let server = evt.context;
        let StunServerAddress::Unresolved { port, .. } = server else {
            return;
        };

        match evt.result {
            Ok(ip) => {
                let resolved = SocketAddr::new(ip, port);
                debug!("port {}: {} resolved to {}", self.local_addr, server, resolved);
                if self.server_addresses.replace(&server, resolved) {
                    self.send_binding_request(resolved, now, now);
                } else {
                    debug!("port {}: {} is already configured", self.local_addr, resolved);
                }
            }
            Err(code) => {
                warn!(
                    "port {}: lookup of {} failed with {}",
                    self.local_addr, server, code
                );
                self.on_binding_failed(&server, CODE_SERVER_NOT_REACHABLE.0, REASON_HOST_LOOKUP);
            }
        }
        self.maybe_ready();
    }

    fn on_request_event(&mut self, evt: RequestEvent<RequestContext>, now: Instant) {
        match evt {
            RequestEvent::Success {
                transaction_id,
                context,
                response,
                rtt,
            } => match context {
                RequestContext::ServerBinding {
                    server,
                    chain_start,
                } => self.on_binding_success(server, chain_start, &response, rtt, now),
                RequestContext::ConnectionPing { connection, .. } => {
                    self.on_ping_success(connection, transaction_id, response, rtt, now)
                }
            },
            RequestEvent::Failure {
                context, reason, ..
            } => match context {
                RequestContext::ServerBinding {
                    server,
                    chain_start,
                } => self.on_binding_error(server, chain_start, reason, now),
                RequestContext::ConnectionPing { connection, .. } => {
                    self.on_ping_failure(connection, reason, now)
                }
            },
        }
    }

    fn on_binding_success(
        &mut self,
        server: SocketAddr,
        chain_start: Instant,
        response: &Message,
        rtt: Duration,
        now: Instant,
    ) {
        let rtt_ms = rtt.as_millis() as u64;
        self.stun_stats.stun_binding_responses_received += 1;
        self.stun_stats.stun_binding_rtt_ms_total += rtt_ms;
        self.stun_stats.stun_binding_rtt_ms_squared_total += rtt_ms * rtt_ms;

        let entry = StunServerAddress::Resolved(server);
        let Some(mapped) = mapped_address(response) else {
            self.on_binding_failed(&entry, CODE_SERVER_ERROR.0, REASON_NO_MAPPED_ADDRESS);
            return;
        };

        trace!("port {}: {} maps us to {}", self.local_addr, server, mapped);
        self.server_addresses.mark_succeeded(&entry);

        let known = self.candidates.iter().any(|c| {
            c.candidate_type() == CandidateType::ServerReflexive
                && c.address() == mapped
                && c.base_address() == self.local_addr
        });
        if !known {
            let srflx = CandidateServerReflexiveConfig {
                base_config: self.candidate_config(mapped),
                base_address: Some(self.local_addr),
                url: format!("stun:{server}"),
            }
            .new_candidate_server_reflexive();
            match srflx {
                Ok(c) => self.add_candidate(c),
                Err(err) => warn!("port {}: bad srflx candidate: {}", self.local_addr, err),
            }
        }
        self.maybe_ready();

        self.schedule_keepalive(server, chain_start, now, false);
    }

    fn on_binding_error(
        &mut self,
        server: SocketAddr,
        chain_start: Instant,
        reason: RequestFailure,
        now: Instant,
    ) {
        let entry = StunServerAddress::Resolved(server);
        match reason {
            RequestFailure::ErrorResponse { response, .. } => {
                let mut error_code = ErrorCodeAttribute::default();
                let (code, text) = if error_code.get_from(&response).is_ok() {
                    (error_code.code.0, error_code.reason_text())
                } else {
                    (CODE_SERVER_ERROR.0, "Server Error".to_owned())
                };
                self.on_binding_failed(&entry, code, &text);
                self.schedule_keepalive(server, chain_start, now, true);
            }
            RequestFailure::Timeout => {
                self.on_binding_failed(&entry, CODE_SERVER_NOT_REACHABLE.0, REASON_BINDING_TIMEOUT);
            }
            RequestFailure::NetworkUnreachable => {
                self.on_binding_failed(
                    &entry,
                    CODE_SERVER_NOT_REACHABLE.0,
                    REASON_NETWORK_UNREACHABLE,
                );
            }
            RequestFailure::Cancelled => {}
        }
    }

    fn on_binding_failed(&mut self, server: &StunServerAddress, code: u16, reason: &str) {
        debug!(
            "port {}: binding against {} failed: {} {}",
            self.local_addr, server, code, reason
        );
        if self.server_addresses.mark_failed(server) {
            self.event_outs.push_back(PortEvent::CandidateGatheringError {
                server: server.clone(),
                code,
                reason: reason.to_owned(),
            });
        }
        self.maybe_ready();
    }

    fn schedule_keepalive(
        &mut self,
        server: SocketAddr,
        chain_start: Instant,
        now: Instant,
        is_retry: bool,
    ) {
        let Some(interval) = self.config.stun_keepalive_interval else {
            return;
        };
        if !self
            .keepalive_lifetime
            .allows(chain_age(chain_start, self.last_inbound, now))
        {
            debug!(
                "port {}: keepalive chain to {} reached its lifetime",
                self.local_addr, server
            );
            return;
        }
        if is_retry && now.saturating_duration_since(chain_start) >= STUN_RETRY_WINDOW {
            debug!("port {}: giving up retrying {}", self.local_addr, server);
            return;
        }

        self.keepalives.push(Keepalive {
            server,
            at: now + interval,
            chain_start,
        });
    }

    fn maybe_ready(&mut self) {
        if self.state != PortState::Gathering || !self.server_addresses.is_done() {
            return;
        }
        if self.candidates.is_empty() {
            warn!("port {}: gathering failed", self.local_addr);
            self.state = PortState::Error;
            self.event_outs.push_back(PortEvent::PortError);
        } else {
            info!(
                "port {}: ready with {} candidates",
                self.local_addr,
                self.candidates.len()
            );
            self.state = PortState::Ready;
            self.event_outs.push_back(PortEvent::PortReady);
        }
    }

    fn on_ping_success(
        &mut self,
        id: ConnectionId,
        transaction_id: TransactionId,
        mut response: Message,
        rtt: Duration,
        now: Instant,
    ) {
        let Some(conn) = self.connections.get_mut(&id) else {
            return;
        };
        let pwd = if conn.remote_candidate().password().is_empty() {
            self.remote_pwd.clone()
        } else {
            conn.remote_candidate().password().to_owned()
        };
        if let Err(err) = MessageIntegrity::new_short_term_integrity(pwd).check(&mut response) {
            debug!("{conn}: dropping ping response: {err}");
            return;
        }

        if conn.on_ping_response(transaction_id, rtt, now) {
            self.event_outs
                .push_back(PortEvent::ConnectionStateChange(id));
        }
    }

    fn on_ping_failure(&mut self, id: ConnectionId, reason: RequestFailure, now: Instant) {
        let Some(conn) = self.connections.get_mut(&id) else {
            return;
        };
        match reason {
            RequestFailure::ErrorResponse { response, .. } => {
                let mut error_code = ErrorCodeAttribute::default();
                let code = if error_code.get_from(&response).is_ok() {
                    error_code.code.0
                } else {
                    CODE_SERVER_ERROR.0
                };
                if code == CODE_ROLE_CONFLICT.0 {
                    debug!("{conn}: peer reported a role conflict");
                    self.event_outs.push_back(PortEvent::RoleConflict(id));
                } else if conn.on_ping_error(code, now) {
                    self.event_outs
                        .push_back(PortEvent::ConnectionStateChange(id));
                }
            }
            reason => trace!("{conn}: ping ended with {reason:?}"),
        }
    }

    fn on_binding_request(&mut self, mut m: Message, transport: TransportContext, now: Instant) {
        let peer = transport.peer_addr;
        if let Err(err) = FINGERPRINT.check(&m) {
            debug!("port {}: dropping check from {}: {}", self.local_addr, peer, err);
            return;
        }

        let Ok(username) = TextAttribute::get_from_as(&m, ATTR_USERNAME) else {
            self.send_error_response(&m, peer, CODE_BAD_REQUEST, now);
            return;
        };
        let mut priority = PriorityAttr::default();
        if !m.contains(ATTR_MESSAGE_INTEGRITY) || priority.get_from(&m).is_err() {
            self.send_error_response(&m, peer, CODE_BAD_REQUEST, now);
            return;
        }
        let Some((local_ufrag, remote_ufrag)) = username
            .text
            .split_once(':')
            .filter(|(l, r)| !l.is_empty() && !r.is_empty())
        else {
            self.send_error_response(&m, peer, CODE_BAD_REQUEST, now);
            return;
        };
        if local_ufrag != self.config.local_ufrag {
            debug!(
                "port {}: check from {} for unknown ufrag {}",
                self.local_addr, peer, local_ufrag
            );
            self.send_error_response(&m, peer, CODE_UNAUTHORIZED, now);
            return;
        }
        let integrity = MessageIntegrity::new_short_term_integrity(self.config.local_pwd.clone());
        if integrity.check(&mut m).is_err() {
            self.send_error_response(&m, peer, CODE_UNAUTHORIZED, now);
            return;
        }
        let remote_ufrag = remote_ufrag.to_owned();

        self.last_inbound = Some(now);

        let id = match self.connection_for(peer).map(|c| c.id()) {
            Some(id) => id,
            None => {
                let Some(local) = self.candidates.first().cloned() else {
                    debug!("port {}: no local candidate for check from {}", self.local_addr, peer);
                    return;
                };
                let remote = CandidatePeerReflexiveConfig {
                    base_config: CandidateConfig {
                        protocol: TransportProtocol::UDP,
                        address: Some(peer),
                        component: local.component(),
                        priority: priority.0,
                        username: remote_ufrag,
                        password: self.remote_pwd.clone(),
                        ..Default::default()
                    },
                    base_address: None,
                }
                .new_candidate_peer_reflexive();
                match remote {
                    Ok(remote) => {
                        debug!("port {}: new peer reflexive remote {}", self.local_addr, remote);
                        self.add_connection(local, remote, now)
                    }
                    Err(err) => {
                        warn!("port {}: bad prflx candidate {}: {}", self.local_addr, peer, err);
                        return;
                    }
                }
            }
        };

        if let Some(conn) = self.connections.get_mut(&id) {
            let was_receiving = conn.receiving();
            if conn.on_ping_request(UseCandidateAttr::is_set(&m), now) {
                self.event_outs.push_back(PortEvent::NominationReceived(id));
            }
            if conn.receiving() != was_receiving {
                self.event_outs
                    .push_back(PortEvent::ConnectionStateChange(id));
            }
        }

        self.send_success_response(&m, peer, now);
    }

    fn send_success_response(&mut self, request: &Message, peer: SocketAddr, now: Instant) {
        let mut out = Message::new();
        let result = out.build(&[
            Box::new(request.clone()),
            Box::new(BINDING_SUCCESS),
            Box::new(XorMappedAddress::from(peer)),
            Box::new(MessageIntegrity::new_short_term_integrity(
                self.config.local_pwd.clone(),
            )),
            Box::new(FINGERPRINT),
        ]);
        match result {
            Ok(()) => self.queue_stun(out, peer, now),
            Err(err) => warn!("port {}: failed to answer {}: {}", self.local_addr, peer, err),
        }
    }

    fn send_error_response(&mut self, request: &Message, peer: SocketAddr, code: ErrorCode, now: Instant) {
        debug!("port {}: rejecting check from {} with {}", self.local_addr, peer, code.0);
        let mut out = Message::new();
        let result = out.build(&[
            Box::new(request.clone()),
            Box::new(BINDING_ERROR),
            Box::new(code),
            Box::new(FINGERPRINT),
        ]);
        match result {
            Ok(()) => self.queue_stun(out, peer, now),
            Err(err) => warn!("port {}: failed to reject {}: {}", self.local_addr, peer, err),
        }
    }

    fn queue_stun(&mut self, m: Message, peer: SocketAddr, now: Instant) {
        self.write_outs.push_back(TransportMessage::udp(
            now,
            self.local_addr,
            peer,
            BytesMut::from(&m.raw[..]),
        ));
    }
}

fn chain_age(chain_start: Instant, last_inbound: Option<Instant>, now: Instant) -> Duration {
    let start = last_inbound.map_or(chain_start, |t| t.max(chain_start));
    now.saturating_duration_since(start)
}

fn mapped_address(response: &Message) -> Option<SocketAddr> {
    let mut xor = XorMappedAddress::default();
    if xor.get_from(response).is_ok() {
        return Some(xor.socket_addr());
    }
    let mut mapped = MappedAddress::default();
    mapped
        .get_from(response)
        .ok()
        .map(|_| SocketAddr::new(mapped.ip, mapped.port))
}

impl ConnectionLookup for UdpPort {
    fn connection(&self, id: ConnectionId) -> Option<&Connection> {
        self.connections.get(&id)
    }
}

impl sansio::Protocol<TaggedBytesMut, TaggedBytesMut, PortInput> for UdpPort {
    type Rout = TaggedBytesMut;
    type Wout = TaggedBytesMut;
    type Eout = PortEvent;
    type Error = Error;
    type Time = Instant;

    /// Dispatches a datagram received on the port's socket.
    ///
    /// STUN responses go to the request engine, binding requests are
    /// validated and answered, and anything else is application data that
    /// is passed up only when it comes from a known connection.
    fn handle_read(&mut self, msg: TaggedBytesMut) -> Result<()> {
        if self.state == PortState::Closed {
            return Err(Error::ErrPortClosed);
        }
        let now = msg.now;

        if is_message(&msg.message) {
            let m = match Message::unmarshal(&msg.message) {
                Ok(m) => m,
                Err(err) => {
                    debug!(
                        "port {}: malformed STUN from {}: {}",
                        self.local_addr, msg.transport.peer_addr, err
                    );
                    return Ok(());
                }
            };

            if m.typ.class == CLASS_SUCCESS_RESPONSE || m.typ.class == CLASS_ERROR_RESPONSE {
                self.requests.handle_read(TransportMessage {
                    now,
                    transport: msg.transport,
                    message: m,
                })?;
            } else if m.typ == BINDING_REQUEST {
                self.on_binding_request(m, msg.transport, now);
            } else {
                trace!(
                    "port {}: ignoring {} from {}",
                    self.local_addr, m.typ, msg.transport.peer_addr
                );
            }
            self.drive(now);
            return Ok(());
        }

        let peer = msg.transport.peer_addr;
        let Some(conn) = self
            .connections
            .values_mut()
            .find(|c| c.remote_candidate().address() == peer)
        else {
            trace!(
                "port {}: dropping {} bytes from unknown {}",
                self.local_addr,
                msg.message.len(),
                peer
            );
            return Ok(());
        };

        let was_receiving = conn.receiving();
        conn.on_data_received(msg.message.len(), now);
        if conn.receiving() != was_receiving {
            self.event_outs
                .push_back(PortEvent::ConnectionStateChange(conn.id()));
        }
        self.last_inbound = Some(now);
        self.read_outs.push_back(msg);
        Ok(())
    }

    fn poll_read(&mut self) -> Option<Self::Rout> {
        self.read_outs.pop_front()
    }

    /// Queues application data towards `msg.transport.peer_addr`, which must
    /// be the remote address of one of the port's connections.
    fn handle_write(&mut self, msg: TaggedBytesMut) -> Result<()> {
        if self.state == PortState::Closed {
            return Err(Error::ErrPortClosed);
        }
        let peer = msg.transport.peer_addr;
        let conn = self
            .connections
            .values_mut()
            .find(|c| c.remote_candidate().address() == peer)
            .ok_or(Error::ErrNoConnection)?;
        conn.on_data_sent(msg.message.len());

        self.write_outs.push_back(TransportMessage {
            now: msg.now,
            transport: TransportContext {
                local_addr: self.local_addr,
                ..msg.transport
            },
            message: msg.message,
        });
        Ok(())
    }

    fn poll_write(&mut self) -> Option<Self::Wout> {
        let dscp = self.dscp();
        self.write_outs.pop_front().map(|mut w| {
            w.transport.dscp = w.transport.dscp.or(dscp);
            w
        })
    }

    fn handle_event(&mut self, evt: PortInput) -> Result<()> {
        if self.state == PortState::Closed {
            return Err(Error::ErrPortClosed);
        }
        match evt {
            PortInput::Resolved { now, response } => {
                self.resolver.handle_read(response)?;
                self.drive(now);
            }
            PortInput::SendFailed {
                now,
                transport,
                message,
                kind,
            } => {
                let transaction_id = Message::unmarshal(&message)
                    .ok()
                    .map(|m| m.transaction_id)
                    .filter(|id| self.requests.has_request(id));
                match (transaction_id, kind) {
                    (Some(transaction_id), SendErrorKind::NetworkUnreachable) => {
                        self.requests.handle_event(RequestInput::SendFailed {
                            transaction_id,
                            kind,
                        })?;
                        self.drive(now);
                    }
                    _ => {
                        debug!(
                            "port {}: send to {} failed: {:?}",
                            self.local_addr, transport.peer_addr, kind
                        );
                        self.send_error_count += 1;
                        self.last_send_error = Some(kind);
                    }
                }
            }
            PortInput::SentPacket { .. } => self.sent_packet_count += 1,
            PortInput::ReadyToSend { .. } => self.event_outs.push_back(PortEvent::ReadyToSend),
        }
        Ok(())
    }

    fn poll_event(&mut self) -> Option<Self::Eout> {
        self.event_outs.pop_front()
    }

    fn handle_timeout(&mut self, now: Instant) -> Result<()> {
        if self.state == PortState::Closed {
            return Err(Error::ErrPortClosed);
        }

        self.requests.handle_timeout(now)?;
        self.resolver.handle_timeout(now)?;

        let (due, pending): (Vec<Keepalive>, Vec<Keepalive>) =
            self.keepalives.drain(..).partition(|k| k.at <= now);
        self.keepalives = pending;
        for k in due {
            trace!("port {}: keepalive to {}", self.local_addr, k.server);
            self.send_binding_request(k.server, k.chain_start, now);
        }

        for conn in self.connections.values_mut() {
            if conn.update_state(now) {
                self.event_outs
                    .push_back(PortEvent::ConnectionStateChange(conn.id()));
            }
        }

        self.drive(now);
        Ok(())
    }

    fn poll_timeout(&mut self) -> Option<Instant> {
        if self.state == PortState::Closed {
            return None;
        }
        [
            self.requests.poll_timeout(),
            self.resolver.poll_timeout(),
            self.keepalives.iter().map(|k| k.at).min(),
            self.connections
                .values()
                .filter_map(|c| c.next_state_deadline())
                .min(),
        ]
        .into_iter()
        .flatten()
        .min()
    }

    /// Cancels every transaction, abandons lookups and drops connections.
    /// Nothing is emitted afterwards.
    fn close(&mut self) -> Result<()> {
        if self.state == PortState::Closed {
            return Ok(());
        }
        debug!("port {}: closing", self.local_addr);
        self.state = PortState::Closed;
        self.requests.close()?;
        self.resolver.close()?;
        self.keepalives.clear();
        self.connections.clear();
        self.read_outs.clear();
        self.write_outs.clear();
        self.event_outs.clear();
        Ok(())
    }
}
