//! Sans-I/O ICE candidate gathering and connectivity checks.
//!
//! * [`port::UdpPort`] gathers host and server reflexive candidates over one
//!   UDP socket, keeps STUN bindings alive and owns the
//!   [`connection::Connection`]s that send through that socket.
//! * [`stun_request::RequestManager`] retransmits STUN requests and matches
//!   their responses; [`resolver::AddressResolver`] tracks STUN server name
//!   lookups performed by the embedding layer.
//! * [`ice_controller::IceController`] decides which connection to ping and
//!   which one should carry data.
//! * [`transport::IceTransport`] composes ports with a controller.
//!
//! Nothing here touches a socket or the clock: every object is driven
//! through [`sansio::Protocol`] with explicit timestamps.

#![warn(rust_2018_idioms)]
#![allow(dead_code)]

pub mod attributes;
pub mod candidate;
pub mod connection;
pub mod ice_controller;
pub mod network;
pub mod port;
pub mod rand;
pub mod resolver;
pub mod stun_request;
pub mod transport;

pub use port::{PortConfig, PortEvent, PortInput, UdpPort};
pub use transport::{IceTransport, TransportEvent};
