//! Connection selection policy.
//!
//! An [`IceController`] decides which connection to ping next, which one
//! should carry data and which ones can go. It never owns connections: it
//! keeps [`ConnectionId`] handles and reads state through a
//! [`ConnectionLookup`] supplied on every call, so a destroyed connection is
//! simply a handle that no longer resolves.
//!
//! The owner applies the decisions. A [`SwitchResult`] names the connection
//! to select, and the owner reports it back with
//! [`IceController::set_selected_connection`]; pruned connections are
//! destroyed by the owner, which then calls
//! [`IceController::on_connection_destroyed`].


mod basic_ice_controller;
mod ice_config;

pub use basic_ice_controller::BasicIceController;
pub use ice_config::IceConfig;

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{Duration, Instant};

use crate::connection::{ConnectionId, ConnectionLookup};

/// What prompted a selection re-evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IceSwitchReason {
    Unknown,
    RemoteCandidateGenerationChange,
    NetworkPreferenceChange,
    NewConnectionFromLocalCandidate,
    NewConnectionFromRemoteCandidate,
    NewConnectionFromUnknownRemoteAddress,
    NominationOnControlledSide,
    DataReceived,
    ConnectStateChange,
    SelectedConnectionDestroyed,
    /// A delayed re-evaluation asked for by an earlier [`SwitchResult`].
    IceControllerRecheck,
    ApplicationRequested,
}

impl fmt::Display for IceSwitchReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            IceSwitchReason::Unknown => "unknown",
            IceSwitchReason::RemoteCandidateGenerationChange => {
                "remote candidate generation maybe changed"
            }
            IceSwitchReason::NetworkPreferenceChange => "network preference changed",
            IceSwitchReason::NewConnectionFromLocalCandidate => {
                "new candidate pairs created from a new local candidate"
            }
            IceSwitchReason::NewConnectionFromRemoteCandidate => {
                "new candidate pairs created from a new remote candidate"
            }
            IceSwitchReason::NewConnectionFromUnknownRemoteAddress => {
                "a new candidate pair created from an unknown remote address"
            }
            IceSwitchReason::NominationOnControlledSide => {
                "nomination on the controlled side"
            }
            IceSwitchReason::DataReceived => "data received",
            IceSwitchReason::ConnectStateChange => "candidate pair state changed",
            IceSwitchReason::SelectedConnectionDestroyed => "selected candidate pair destroyed",
            IceSwitchReason::IceControllerRecheck => "ice-controller-request-recheck",
            IceSwitchReason::ApplicationRequested => "application requested",
        };
        write!(f, "{s}")
    }
}

/// When the controlling side sets USE-CANDIDATE on its pings.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NominationMode {
    /// Nominate the selected connection once it is writable.
    #[serde(rename = "regular")]
    Regular,
    /// Nominate on every ping.
    #[serde(rename = "aggressive")]
    Aggressive,
    /// Nominate the selected connection and anything better than it.
    #[default]
    #[serde(rename = "semi_aggressive")]
    SemiAggressive,
}

/// ICE implementation of the remote peer.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IceMode {
    #[default]
    #[serde(rename = "full")]
    Full,
    #[serde(rename = "lite")]
    Lite,
}

/// Answer of [`IceController::select_connection_to_ping`].
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PingResult {
    /// Connection to ping now, if any.
    pub connection: Option<ConnectionId>,
    /// Ask again after this long.
    pub recheck_delay: Option<Duration>,
}

/// A delayed call to [`IceController::sort_and_switch_connection`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecheckEvent {
    pub reason: IceSwitchReason,
    pub delay: Duration,
}

/// Answer of the switching calls.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SwitchResult {
    /// Connection to select, when a switch is recommended.
    pub connection: Option<ConnectionId>,
    pub recheck_event: Option<RecheckEvent>,
}

/// Pluggable connection selection policy.
///
/// `add_connection` and `on_connection_destroyed` are called exactly once
/// per connection, in that order.
pub trait IceController {
    fn set_ice_config(&mut self, config: IceConfig);
    fn ice_config(&self) -> &IceConfig;

    /// Records the owner's current selection.
    fn set_selected_connection(&mut self, id: Option<ConnectionId>);
    fn selected_connection(&self) -> Option<ConnectionId>;

    fn add_connection(&mut self, id: ConnectionId);
    /// Forgets `id`, clearing the selection if it was selected.
    fn on_connection_destroyed(&mut self, id: ConnectionId);
    /// Known connections, best first after the last sort.
    fn connections(&self) -> &[ConnectionId];

    fn has_pingable_connection(&self, lookup: &dyn ConnectionLookup, now: Instant) -> bool;
    /// Picks the connection to ping now, if pacing allows one.
    fn select_connection_to_ping(
        &mut self,
        lookup: &dyn ConnectionLookup,
        last_ping_sent: Option<Instant>,
        now: Instant,
    ) -> PingResult;
    fn find_next_pingable_connection(
        &self,
        lookup: &dyn ConnectionLookup,
        now: Instant,
    ) -> Option<ConnectionId>;
    fn mark_connection_pinged(&mut self, id: ConnectionId, now: Instant);
    /// Whether a ping on `id` should carry USE-CANDIDATE.
    fn get_use_candidate_attr(
        &self,
        lookup: &dyn ConnectionLookup,
        id: ConnectionId,
        mode: NominationMode,
        remote_ice_mode: IceMode,
    ) -> bool;

    fn should_switch_connection(
        &mut self,
        lookup: &dyn ConnectionLookup,
        reason: IceSwitchReason,
        id: ConnectionId,
        now: Instant,
    ) -> SwitchResult;
    /// Sorts the connections and recommends the best one if it should
    /// replace the selection.
    fn sort_and_switch_connection(
        &mut self,
        lookup: &dyn ConnectionLookup,
        reason: IceSwitchReason,
        now: Instant,
    ) -> SwitchResult;
    /// Connections the owner should destroy. The selection is never among them.
    fn prune_connections(&mut self, lookup: &dyn ConnectionLookup, now: Instant)
    -> Vec<ConnectionId>;
}
