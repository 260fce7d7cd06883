use log::{debug, trace};
use std::cmp::{Ordering, Reverse};
use std::collections::HashMap;
use std::time::{Duration, Instant};

use super::*;
use crate::connection::Connection;

/// Default selection policy.
///
/// Connections are ranked by write state, receiving, nomination, network
/// cost, priority and generation, with rtt only separating otherwise equal
/// connections. Pings go to the selected connection first and otherwise to
/// the connection pinged least recently.
#[derive(Debug, Default)]
pub struct BasicIceController {
    config: IceConfig,
    connections: Vec<ConnectionId>,
    selected: Option<ConnectionId>,
    last_pinged: HashMap<ConnectionId, Instant>,
}

impl BasicIceController {
    pub fn new(config: IceConfig) -> Self {
        Self {
            config,
            ..Default::default()
        }
    }

    fn last_ping(&self, conn: &Connection) -> Option<Instant> {
        conn.last_ping_sent()
            .max(self.last_pinged.get(&conn.id()).copied())
    }

    /// Selected connection is writable and receiving.
    fn strong(&self, lookup: &dyn ConnectionLookup) -> bool {
        self.selected
            .and_then(|id| lookup.connection(id))
            .is_some_and(|c| c.writable() && c.receiving())
    }

    fn ping_interval(&self, lookup: &dyn ConnectionLookup) -> Duration {
        if self.strong(lookup) {
            self.config.ping_interval_strong
        } else {
            self.config.ping_interval_weak
        }
    }

    fn is_pingable(&self, conn: &Connection, now: Instant) -> bool {
        if conn.write_timed_out() {
            return false;
        }
        let interval = if conn.writable() {
            self.config.writable_connection_ping_interval
        } else {
            self.config.unwritable_connection_ping_interval
        };
        self.last_ping(conn)
            .is_none_or(|last| now.saturating_duration_since(last) >= interval)
    }

    fn live<'a>(&self, lookup: &'a dyn ConnectionLookup) -> Vec<&'a Connection> {
        self.connections
            .iter()
            .filter_map(|id| lookup.connection(*id))
            .collect()
    }

    /// Nomination sides, costs and candidate priorities; no runtime state.
    fn compare_candidates(a: &Connection, b: &Connection) -> Ordering {
        a.nominated()
            .cmp(&b.nominated())
            .then_with(|| b.network_cost().cmp(&a.network_cost()))
            .then_with(|| a.priority().cmp(&b.priority()))
            .then_with(|| a.generation().cmp(&b.generation()))
    }

    /// `Greater` when `a` is the better connection.
    fn compare_connections(a: &Connection, b: &Connection) -> Ordering {
        b.write_state()
            .cmp(&a.write_state())
            .then_with(|| a.receiving().cmp(&b.receiving()))
            .then_with(|| Self::compare_candidates(a, b))
    }

    fn rank(&self, a: &Connection, b: &Connection) -> Ordering {
        Self::compare_connections(b, a)
            .then_with(|| a.rtt().cmp(&b.rtt()))
            .then_with(|| a.id().cmp(&b.id()))
    }
}

impl IceController for BasicIceController {
    fn set_ice_config(&mut self, config: IceConfig) {
        self.config = config;
    }

    fn ice_config(&self) -> &IceConfig {
        &self.config
    }

    fn set_selected_connection(&mut self, id: Option<ConnectionId>) {
        self.selected = id;
    }

    fn selected_connection(&self) -> Option<ConnectionId> {
        self.selected
    }

    fn add_connection(&mut self, id: ConnectionId) {
        if !self.connections.contains(&id) {
            self.connections.push(id);
        }
    }

    fn on_connection_destroyed(&mut self, id: ConnectionId) {
        self.connections.retain(|c| *c != id);
        self.last_pinged.remove(&id);
        if self.selected == Some(id) {
            debug!("selected connection {id} destroyed");
            self.selected = None;
        }
    }

    fn connections(&self) -> &[ConnectionId] {
        &self.connections
    }

    fn has_pingable_connection(&self, lookup: &dyn ConnectionLookup, now: Instant) -> bool {
        self.live(lookup).iter().any(|c| self.is_pingable(c, now))
    }

    fn select_connection_to_ping(
        &mut self,
        lookup: &dyn ConnectionLookup,
        last_ping_sent: Option<Instant>,
        now: Instant,
    ) -> PingResult {
        let interval = self.ping_interval(lookup);
        if let Some(last) = last_ping_sent
            && now < last + interval
        {
            return PingResult {
                connection: None,
                recheck_delay: Some(last + interval - now),
            };
        }

        PingResult {
            connection: self.find_next_pingable_connection(lookup, now),
            recheck_delay: Some(interval.min(self.config.check_receiving_interval())),
        }
    }

    fn find_next_pingable_connection(
        &self,
        lookup: &dyn ConnectionLookup,
        now: Instant,
    ) -> Option<ConnectionId> {
        if let Some(selected) = self.selected.and_then(|id| lookup.connection(id))
            && selected.writable()
            && self.is_pingable(selected, now)
        {
            return Some(selected.id());
        }

        self.live(lookup)
            .into_iter()
            .filter(|c| self.is_pingable(c, now))
            .min_by_key(|c| (self.last_ping(c), Reverse(c.priority()), c.id()))
            .map(|c| c.id())
    }

    fn mark_connection_pinged(&mut self, id: ConnectionId, now: Instant) {
        trace!("{id} pinged");
        self.last_pinged.insert(id, now);
    }

    fn get_use_candidate_attr(
        &self,
        lookup: &dyn ConnectionLookup,
        id: ConnectionId,
        mode: NominationMode,
        remote_ice_mode: IceMode,
    ) -> bool {
        let Some(conn) = lookup.connection(id) else {
            return false;
        };
        let is_selected = self.selected == Some(id);

        match mode {
            NominationMode::Regular => is_selected && conn.writable() && !conn.nominated(),
            NominationMode::Aggressive if remote_ice_mode == IceMode::Lite => self
                .get_use_candidate_attr(lookup, id, NominationMode::Regular, remote_ice_mode),
            NominationMode::Aggressive => true,
            NominationMode::SemiAggressive => {
                if remote_ice_mode == IceMode::Lite {
                    return is_selected && conn.writable();
                }
                let better_than_selected = match self.selected.and_then(|s| lookup.connection(s)) {
                    Some(selected) => {
                        !selected.writable()
                            || Self::compare_candidates(selected, conn) == Ordering::Less
                    }
                    None => true,
                };
                is_selected || better_than_selected
            }
        }
    }

    fn should_switch_connection(
        &mut self,
        lookup: &dyn ConnectionLookup,
        reason: IceSwitchReason,
        id: ConnectionId,
        _now: Instant,
    ) -> SwitchResult {
        let Some(candidate) = lookup.connection(id) else {
            return SwitchResult::default();
        };
        if self.selected == Some(id) {
            return SwitchResult::default();
        }

        let Some(selected) = self.selected.and_then(|s| lookup.connection(s)) else {
            if candidate.write_timed_out() && !candidate.receiving() {
                return SwitchResult::default();
            }
            debug!("selecting {candidate} ({reason})");
            return SwitchResult {
                connection: Some(id),
                recheck_event: None,
            };
        };

        if selected.writable() && !candidate.writable() {
            // Worth another look once the candidate had time to become writable.
            let recheck = Self::compare_candidates(candidate, selected) == Ordering::Greater
                || (candidate.receiving() && !selected.receiving());
            return SwitchResult {
                connection: None,
                recheck_event: recheck.then_some(RecheckEvent {
                    reason: IceSwitchReason::IceControllerRecheck,
                    delay: self.config.receiving_switching_delay,
                }),
            };
        }

        let switch = match Self::compare_connections(candidate, selected) {
            Ordering::Greater => true,
            Ordering::Less => false,
            Ordering::Equal => candidate.rtt() + self.config.rtt_switch_threshold <= selected.rtt(),
        };
        if switch {
            debug!("switching {selected} -> {candidate} ({reason})");
        }
        SwitchResult {
            connection: switch.then_some(id),
            recheck_event: None,
        }
    }

    fn sort_and_switch_connection(
        &mut self,
        lookup: &dyn ConnectionLookup,
        reason: IceSwitchReason,
        now: Instant,
    ) -> SwitchResult {
        let mut live = self.live(lookup);
        live.sort_by(|a, b| self.rank(a, b));
        self.connections = live.iter().map(|c| c.id()).collect();
        trace!("sorted connections ({reason}): {:?}", self.connections);

        let Some(best) = live
            .iter()
            .find(|c| !c.write_timed_out() || c.receiving())
            .map(|c| c.id())
        else {
            return SwitchResult::default();
        };
        self.should_switch_connection(lookup, reason, best, now)
    }

    fn prune_connections(
        &mut self,
        lookup: &dyn ConnectionLookup,
        _now: Instant,
    ) -> Vec<ConnectionId> {
        let mut live = self.live(lookup);
        live.sort_by(|a, b| self.rank(a, b));

        let mut premiers: HashMap<&str, &Connection> = HashMap::new();
        for c in &live {
            premiers
                .entry(c.local_candidate().network_name())
                .or_insert(*c);
        }

        let pruned: Vec<ConnectionId> = live
            .iter()
            .filter(|c| Some(c.id()) != self.selected)
            .filter(|c| {
                if c.write_timed_out() && !c.receiving() {
                    return true;
                }
                if !self.config.prune_redundant {
                    return false;
                }
                let Some(premier) = premiers.get(c.local_candidate().network_name()) else {
                    return false;
                };
                premier.id() != c.id()
                    && premier.writable()
                    && premier.receiving()
                    && Self::compare_candidates(premier, c) == Ordering::Greater
            })
            .map(|c| c.id())
            .collect();

        if !pruned.is_empty() {
            debug!("pruning {} connections", pruned.len());
        }
        pruned
    }
}
