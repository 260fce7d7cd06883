use rtc_p2p::port::{PortConfig, PortEvent, PortInput, UdpPort};
use rtc_p2p::resolver::resolve_blocking;
use rtc_p2p::stun_request::SendErrorKind;
use sansio::Protocol;

use bytes::BytesMut;
use clap::Parser;
use shared::TaggedBytesMut;
use shared::error::Error;
use std::io::ErrorKind;
use std::net::{IpAddr, Ipv4Addr};
use std::time::{Duration, Instant};

#[derive(Parser)]
#[command(name = "STUN Gather")]
#[command(author = "Rusty Rain <yliu@webrtc.rs>")]
#[command(version = "0.1.0")]
#[command(about = "An example of ICE candidate gathering against STUN servers", long_about = None)]
struct Cli {
    #[arg(long, default_values_t = vec![format!("stun:stun.l.google.com:19302")])]
    server: Vec<String>,
    #[arg(long, default_value_t = 0)]
    min_port: u16,
    #[arg(long, default_value_t = 0)]
    max_port: u16,
    #[arg(long, default_value_t = false)]
    debug: bool,
}

fn main() -> Result<(), Error> {
    let cli = Cli::parse();
    if cli.debug {
        env_logger::Builder::new()
            .filter(None, log::LevelFilter::Trace)
            .init();
    }

    let config = PortConfig::default()
        .with_stun_servers(cli.server)
        .with_port_range(cli.min_port, cli.max_port)
        .with_emit_local_for_anyaddress(true);

    let socket = UdpPort::bind_socket(IpAddr::V4(Ipv4Addr::UNSPECIFIED), &config)?;
    socket.set_read_timeout(Some(Duration::from_millis(50)))?;
    let local_addr = socket.local_addr()?;
    println!("Local address: {local_addr}");

    let mut port = UdpPort::new(config, local_addr)?;
    port.prepare_address(Instant::now())?;

    let mut buf = vec![0u8; 1500];
    loop {
        while let Some(transmit) = port.poll_write() {
            let now = Instant::now();
            match socket.send_to(&transmit.message, transmit.transport.peer_addr) {
                Ok(_) => port.handle_event(PortInput::SentPacket { local_addr })?,
                Err(err) => {
                    let kind = if err.kind() == ErrorKind::NetworkUnreachable {
                        SendErrorKind::NetworkUnreachable
                    } else {
                        SendErrorKind::Other
                    };
                    port.handle_event(PortInput::SendFailed {
                        now,
                        transport: transmit.transport,
                        message: transmit.message,
                        kind,
                    })?;
                }
            }
        }

        while let Some(event) = port.poll_event() {
            match event {
                PortEvent::CandidateReady(candidate) => {
                    println!("Candidate: {}", candidate.marshal());
                }
                PortEvent::CandidateGatheringError {
                    server,
                    code,
                    reason,
                } => {
                    println!("Gathering from {server} failed: {code} {reason}");
                }
                PortEvent::ResolveRequested(request) => {
                    let response = resolve_blocking(&request);
                    port.handle_event(PortInput::Resolved {
                        now: Instant::now(),
                        response,
                    })?;
                }
                PortEvent::PortReady => {
                    println!("Stats: {:?}", port.stun_stats());
                    port.close()?;
                    return Ok(());
                }
                PortEvent::PortError => {
                    println!("No candidate gathered");
                    port.close()?;
                    return Ok(());
                }
                _ => {}
            }
        }

        match socket.recv_from(&mut buf) {
            Ok((n, peer_addr)) => {
                port.handle_read(TaggedBytesMut::udp(
                    Instant::now(),
                    local_addr,
                    peer_addr,
                    BytesMut::from(&buf[..n]),
                ))?;
            }
            Err(err) if matches!(err.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {}
            Err(err) => return Err(err.into()),
        }

        let now = Instant::now();
        if port.poll_timeout().is_some_and(|deadline| deadline <= now) {
            port.handle_timeout(now)?;
        }
    }
}
