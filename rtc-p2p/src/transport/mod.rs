//! A thin owner composing [`UdpPort`]s with an [`IceController`].
//!
//! [`IceTransport`] pairs every gathered local candidate with every signaled
//! remote candidate, paces connectivity checks, applies the controller's
//! switching and pruning decisions and carries application data over the
//! selected connection. Like the ports it drives, it is sans-I/O: datagrams,
//! lookups and timers are moved in and out through [`sansio::Protocol`].

#[cfg(test)]
mod transport_test;

use log::{debug, info, trace, warn};
use sansio::Protocol;
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::time::Instant;

use shared::error::{Error, Result};
use shared::{TaggedBytesMut, TransportContext, TransportMessage};

use crate::attributes::control::Role;
use crate::candidate::{Candidate, CandidateType};
use crate::connection::{Connection, ConnectionId, ConnectionLookup};
use crate::ice_controller::{
    BasicIceController, IceConfig, IceController, IceMode, IceSwitchReason, SwitchResult,
};
use crate::port::{PortEvent, PortInput, UdpPort};

/// Signals an [`IceTransport`] emits to its owner.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// Forwarded from the port bound to `local_addr`.
    Port {
        local_addr: SocketAddr,
        event: PortEvent,
    },
    SelectedConnectionChanged(Option<ConnectionId>),
}

/// Connection lookup across every port of a transport.
struct PortSet<'a>(&'a [UdpPort]);

impl ConnectionLookup for PortSet<'_> {
    fn connection(&self, id: ConnectionId) -> Option<&Connection> {
        self.0.iter().find_map(|p| p.connection(id))
    }
}

pub struct IceTransport {
    ports: Vec<UdpPort>,
    controller: Box<dyn IceController>,

    ice_role: Role,
    remote_ice_mode: IceMode,
    remote_ufrag: String,
    remote_pwd: String,
    remote_candidates: Vec<Candidate>,

    selected: Option<ConnectionId>,
    last_ping_sent: Option<Instant>,
    next_ping_at: Option<Instant>,
    recheck: Option<(Instant, IceSwitchReason)>,
    pending_sort: Option<IceSwitchReason>,
    closed: bool,

    read_outs: VecDeque<TaggedBytesMut>,
    event_outs: VecDeque<TransportEvent>,
}

impl IceTransport {
    /// Creates a transport selecting connections with [`BasicIceController`].
    pub fn new(config: IceConfig) -> Self {
        Self::with_controller(Box::new(BasicIceController::new(config)))
    }

    pub fn with_controller(controller: Box<dyn IceController>) -> Self {
        Self {
            ports: vec![],
            controller,
            ice_role: Role::default(),
            remote_ice_mode: IceMode::default(),
            remote_ufrag: String::new(),
            remote_pwd: String::new(),
            remote_candidates: vec![],
            selected: None,
            last_ping_sent: None,
            next_ping_at: None,
            recheck: None,
            pending_sort: None,
            closed: false,
            read_outs: VecDeque::new(),
            event_outs: VecDeque::new(),
        }
    }

    pub fn ports(&self) -> &[UdpPort] {
        &self.ports
    }

    pub fn port(&self, local_addr: SocketAddr) -> Option<&UdpPort> {
        self.ports.iter().find(|p| p.local_addr() == local_addr)
    }

    /// Mutable access for port-level tuning, e.g. [`UdpPort::set_network_cost`].
    /// Events the change produces are picked up on the next call into the
    /// transport.
    pub fn port_mut(&mut self, local_addr: SocketAddr) -> Option<&mut UdpPort> {
        self.ports.iter_mut().find(|p| p.local_addr() == local_addr)
    }

    pub fn connection(&self, id: ConnectionId) -> Option<&Connection> {
        self.ports.iter().find_map(|p| p.connection(id))
    }

    pub fn controller(&self) -> &dyn IceController {
        self.controller.as_ref()
    }

    pub fn ice_role(&self) -> Role {
        self.ice_role
    }

    pub fn remote_candidates(&self) -> &[Candidate] {
        &self.remote_candidates
    }

    pub fn selected_connection(&self) -> Option<&Connection> {
        self.selected.and_then(|id| self.connection(id))
    }

    pub fn selected_connection_id(&self) -> Option<ConnectionId> {
        self.selected
    }

    /// Adopts `port` and starts its gathering.
    pub fn add_port(&mut self, mut port: UdpPort, now: Instant) -> Result<()> {
        if self.closed {
            return Err(Error::ErrAlreadyClosed);
        }
        port.set_ice_role(self.ice_role);
        port.set_receiving_timeout(self.controller.ice_config().receiving_timeout);
        if !self.remote_ufrag.is_empty() {
            port.set_remote_credentials(&self.remote_ufrag, &self.remote_pwd);
        }
        port.prepare_address(now)?;
        debug!("transport: added port {}", port.local_addr());
        self.ports.push(port);
        self.process_port_events(now);
        Ok(())
    }

    pub fn set_remote_credentials(&mut self, ufrag: &str, pwd: &str) {
        self.remote_ufrag = ufrag.to_owned();
        self.remote_pwd = pwd.to_owned();
        for port in &mut self.ports {
            port.set_remote_credentials(ufrag, pwd);
        }
    }

    pub fn set_remote_ice_mode(&mut self, mode: IceMode) {
        self.remote_ice_mode = mode;
    }

    pub fn set_ice_config(&mut self, config: IceConfig) {
        for port in &mut self.ports {
            port.set_receiving_timeout(config.receiving_timeout);
        }
        self.controller.set_ice_config(config);
    }

    pub fn set_ice_role(&mut self, role: Role) {
        if role == self.ice_role {
            return;
        }
        info!("transport: role {} -> {}", self.ice_role, role);
        self.ice_role = role;
        for port in &mut self.ports {
            port.set_ice_role(role);
        }
    }

    /// Pairs a signaled remote candidate with every compatible port.
    ///
    /// A candidate already known is ignored.
    pub fn add_remote_candidate(&mut self, remote: Candidate, now: Instant) -> Result<()> {
        if self.closed {
            return Err(Error::ErrAlreadyClosed);
        }
        if self.remote_candidates.iter().any(|c| c.equal(&remote)) {
            trace!("transport: remote {remote} already known");
            return Ok(());
        }
        debug!("transport: remote candidate {remote}");

        for port in &mut self.ports {
            match port.create_connection(&remote, now) {
                Ok(_) => {}
                Err(Error::ErrNoLocalCandidate | Error::ErrIncompatibleRemoteCandidate) => {}
                Err(err) => warn!(
                    "transport: pairing {} with port {} failed: {}",
                    remote,
                    port.local_addr(),
                    err
                ),
            }
        }
        self.remote_candidates.push(remote);
        self.process_port_events(now);
        Ok(())
    }

    /// Tears a connection down. The controller forgets it before its port
    /// drops it.
    pub fn destroy_connection(&mut self, id: ConnectionId, now: Instant) -> Result<()> {
        let port = self
            .ports
            .iter_mut()
            .find(|p| p.connection(id).is_some())
            .ok_or(Error::ErrConnectionNotFound)?;

        self.controller.on_connection_destroyed(id);
        port.destroy_connection(id)?;

        if self.selected == Some(id) {
            info!("transport: selected {id} destroyed");
            self.selected = None;
            self.event_outs
                .push_back(TransportEvent::SelectedConnectionChanged(None));
            self.pending_sort = Some(IceSwitchReason::SelectedConnectionDestroyed);
        }
        self.process_port_events(now);
        Ok(())
    }

    fn process_port_events(&mut self, now: Instant) {
        loop {
            let mut events = vec![];
            for (index, port) in self.ports.iter_mut().enumerate() {
                while let Some(event) = port.poll_event() {
                    events.push((index, event));
                }
            }
            if events.is_empty() {
                break;
            }
            for (index, event) in events {
                self.on_port_event(index, event, now);
            }
        }

        if let Some(reason) = self.pending_sort.take() {
            self.sort_and_switch(reason, now);
        }
    }

    fn on_port_event(&mut self, index: usize, event: PortEvent, now: Instant) {
        match &event {
            PortEvent::CandidateReady(local) => {
                let port = &mut self.ports[index];
                for remote in self.remote_candidates.iter() {
                    if !local.is_compatible_with(remote) {
                        continue;
                    }
                    if let Err(err) = port.create_connection(remote, now) {
                        debug!("transport: pairing {local} with {remote} failed: {err}");
                    }
                }
            }
            PortEvent::ConnectionCreated(id) => {
                self.controller.add_connection(*id);
                self.next_ping_at = Some(self.next_ping_at.map_or(now, |at| at.min(now)));

                let reason = match self.connection(*id) {
                    Some(c) if c.remote_candidate().candidate_type() == CandidateType::PeerReflexive => {
                        IceSwitchReason::NewConnectionFromUnknownRemoteAddress
                    }
                    _ => IceSwitchReason::NewConnectionFromRemoteCandidate,
                };
                self.maybe_switch(reason, *id, now);
            }
            PortEvent::ConnectionStateChange(_) => {
                self.pending_sort
                    .get_or_insert(IceSwitchReason::ConnectStateChange);
            }
            PortEvent::NominationReceived(id) => {
                self.maybe_switch(IceSwitchReason::NominationOnControlledSide, *id, now);
            }
            PortEvent::NetworkCostChanged(_) => {
                self.pending_sort
                    .get_or_insert(IceSwitchReason::NetworkPreferenceChange);
            }
            _ => {}
        }

        let local_addr = self.ports[index].local_addr();
        self.event_outs
            .push_back(TransportEvent::Port { local_addr, event });
    }

    fn maybe_switch(&mut self, reason: IceSwitchReason, id: ConnectionId, now: Instant) {
        let result =
            self.controller
                .should_switch_connection(&PortSet(&self.ports), reason, id, now);
        self.apply(result, now);
    }

    fn sort_and_switch(&mut self, reason: IceSwitchReason, now: Instant) {
        let result =
            self.controller
                .sort_and_switch_connection(&PortSet(&self.ports), reason, now);
        self.apply(result, now);
    }

    fn apply(&mut self, result: SwitchResult, now: Instant) {
        if let Some(id) = result.connection
            && self.selected != Some(id)
        {
            match self.connection(id) {
                Some(conn) => info!("transport: selected {conn}"),
                None => return,
            }
            self.selected = Some(id);
            self.controller.set_selected_connection(Some(id));
            self.event_outs
                .push_back(TransportEvent::SelectedConnectionChanged(Some(id)));
        }
        if let Some(recheck) = result.recheck_event {
            let at = now + recheck.delay;
            trace!("transport: recheck ({}) in {:?}", recheck.reason, recheck.delay);
            self.recheck = Some(match self.recheck {
                Some((earlier, reason)) if earlier <= at => (earlier, reason),
                _ => (at, recheck.reason),
            });
        }
    }

    fn ping_next(&mut self, now: Instant) {
        let result = self.controller.select_connection_to_ping(
            &PortSet(&self.ports),
            self.last_ping_sent,
            now,
        );
        self.next_ping_at = result.recheck_delay.map(|delay| now + delay);

        let Some(id) = result.connection else {
            return;
        };
        let mode = self.controller.ice_config().nomination_mode;
        let use_candidate = self.controller.get_use_candidate_attr(
            &PortSet(&self.ports),
            id,
            mode,
            self.remote_ice_mode,
        );
        let Some(port) = self.ports.iter_mut().find(|p| p.connection(id).is_some()) else {
            return;
        };
        match port.ping(id, use_candidate, now) {
            Ok(_) => {
                self.last_ping_sent = Some(now);
                self.controller.mark_connection_pinged(id, now);
            }
            Err(err) => debug!("transport: ping on {id} failed: {err}"),
        }
    }

    fn prune(&mut self, now: Instant) -> Result<()> {
        let pruned = self
            .controller
            .prune_connections(&PortSet(&self.ports), now);
        for id in pruned {
            debug!("transport: pruning {id}");
            self.destroy_connection(id, now)?;
        }
        Ok(())
    }
}

impl sansio::Protocol<TaggedBytesMut, TaggedBytesMut, PortInput> for IceTransport {
    type Rout = TaggedBytesMut;
    type Wout = TaggedBytesMut;
    type Eout = TransportEvent;
    type Error = Error;
    type Time = Instant;

    /// Hands a datagram to the port bound to `msg.transport.local_addr`.
    fn handle_read(&mut self, msg: TaggedBytesMut) -> Result<()> {
        if self.closed {
            return Err(Error::ErrAlreadyClosed);
        }
        let now = msg.now;
        let port = self
            .ports
            .iter_mut()
            .find(|p| p.local_addr() == msg.transport.local_addr)
            .ok_or(Error::ErrPortNotFound)?;
        port.handle_read(msg)?;

        let mut data_from = vec![];
        while let Some(data) = port.poll_read() {
            if let Some(conn) = port.connection_for(data.transport.peer_addr) {
                data_from.push(conn.id());
            }
            self.read_outs.push_back(data);
        }

        self.process_port_events(now);
        for id in data_from {
            if self.selected != Some(id) {
                self.maybe_switch(IceSwitchReason::DataReceived, id, now);
            }
        }
        Ok(())
    }

    fn poll_read(&mut self) -> Option<Self::Rout> {
        self.read_outs.pop_front()
    }

    /// Sends application data over the selected connection. The transport
    /// context of `msg` is replaced by the connection's addresses.
    fn handle_write(&mut self, msg: TaggedBytesMut) -> Result<()> {
        if self.closed {
            return Err(Error::ErrAlreadyClosed);
        }
        let id = self.selected.ok_or(Error::ErrNoSelectedConnection)?;
        let port = self
            .ports
            .iter_mut()
            .find(|p| p.connection(id).is_some())
            .ok_or(Error::ErrConnectionNotFound)?;
        let peer_addr = port
            .connection(id)
            .map(|c| c.remote_candidate().address())
            .ok_or(Error::ErrConnectionNotFound)?;

        port.handle_write(TransportMessage {
            now: msg.now,
            transport: TransportContext {
                local_addr: port.local_addr(),
                peer_addr,
                transport_protocol: msg.transport.transport_protocol,
                dscp: msg.transport.dscp,
            },
            message: msg.message,
        })
    }

    fn poll_write(&mut self) -> Option<Self::Wout> {
        self.ports.iter_mut().find_map(|p| p.poll_write())
    }

    /// Routes lookup answers by token and socket notifications by local
    /// address.
    fn handle_event(&mut self, evt: PortInput) -> Result<()> {
        if self.closed {
            return Err(Error::ErrAlreadyClosed);
        }
        let (now, port) = match &evt {
            PortInput::Resolved { now, response } => {
                let Some(port) = self
                    .ports
                    .iter_mut()
                    .find(|p| p.has_lookup_token(response.token))
                else {
                    trace!("transport: stale lookup token {}", response.token);
                    return Ok(());
                };
                (Some(*now), port)
            }
            PortInput::SendFailed { now, transport, .. } => (
                Some(*now),
                self.ports
                    .iter_mut()
                    .find(|p| p.local_addr() == transport.local_addr)
                    .ok_or(Error::ErrPortNotFound)?,
            ),
            PortInput::SentPacket { local_addr } | PortInput::ReadyToSend { local_addr } => (
                None,
                self.ports
                    .iter_mut()
                    .find(|p| p.local_addr() == *local_addr)
                    .ok_or(Error::ErrPortNotFound)?,
            ),
        };
        port.handle_event(evt)?;

        match now {
            Some(now) => self.process_port_events(now),
            None => {
                // Readiness only produces events that need no decision.
                for port in &mut self.ports {
                    while let Some(event) = port.poll_event() {
                        let local_addr = port.local_addr();
                        self.event_outs
                            .push_back(TransportEvent::Port { local_addr, event });
                    }
                }
            }
        }
        Ok(())
    }

    fn poll_event(&mut self) -> Option<Self::Eout> {
        self.event_outs.pop_front()
    }

    /// Runs port timers, a due recheck, the next connectivity check and
    /// pruning.
    fn handle_timeout(&mut self, now: Instant) -> Result<()> {
        if self.closed {
            return Err(Error::ErrAlreadyClosed);
        }
        for port in &mut self.ports {
            port.handle_timeout(now)?;
        }
        self.process_port_events(now);

        if let Some((at, reason)) = self.recheck
            && at <= now
        {
            self.recheck = None;
            self.sort_and_switch(reason, now);
        }

        if self.next_ping_at.is_some_and(|at| at <= now) {
            self.ping_next(now);
            if self.controller.connections().is_empty() {
                self.next_ping_at = None;
            }
        }

        self.prune(now)?;
        self.process_port_events(now);
        Ok(())
    }

    fn poll_timeout(&mut self) -> Option<Instant> {
        if self.closed {
            return None;
        }
        self.ports
            .iter_mut()
            .filter_map(|p| p.poll_timeout())
            .chain(self.next_ping_at)
            .chain(self.recheck.map(|(at, _)| at))
            .min()
    }

    /// Closes every port. Nothing is emitted afterwards.
    fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        debug!("transport: closing");
        self.closed = true;
        for port in &mut self.ports {
            port.close()?;
        }
        self.selected = None;
        self.next_ping_at = None;
        self.recheck = None;
        self.read_outs.clear();
        self.event_outs.clear();
        Ok(())
    }
}
