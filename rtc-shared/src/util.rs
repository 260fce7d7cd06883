use crate::error::{Error, Result};
use rand::{Rng, rng};
use std::io;
use std::net::{IpAddr, SocketAddr, ToSocketAddrs, UdpSocket};


/// lookup host to SocketAddr
pub fn lookup_host<T>(use_ipv4: bool, host: T) -> Result<SocketAddr>
where
    T: ToSocketAddrs,
{
    for remote_addr in host.to_socket_addrs()? {
        if (use_ipv4 && remote_addr.is_ipv4()) || (!use_ipv4 && remote_addr.is_ipv6()) {
            return Ok(remote_addr);
        }
    }

    Err(Error::ErrAddressParseFailed)
}

/// Binds a UDP socket on `ip` to the first free port in `min_port..=max_port`.
///
/// A zero range (`min_port == 0 && max_port == 0`) lets the OS pick the port.
/// When every port in the range is taken the result is
/// [`Error::ErrPortSpaceExhausted`].
pub fn bind_udp_in_range(ip: IpAddr, min_port: u16, max_port: u16) -> Result<UdpSocket> {
    if min_port == 0 && max_port == 0 {
        return Ok(UdpSocket::bind(SocketAddr::new(ip, 0))?);
    }
    if max_port < min_port {
        return Err(Error::ErrEndPortLessThanStart);
    }

    let start = min_port.max(1);
    for port in start..=max_port {
        match UdpSocket::bind(SocketAddr::new(ip, port)) {
            Ok(socket) => return Ok(socket),
            Err(err) if err.kind() == io::ErrorKind::AddrInUse => continue,
            Err(err) if err.kind() == io::ErrorKind::PermissionDenied => continue,
            Err(err) => return Err(err.into()),
        }
    }

    Err(Error::ErrPortSpaceExhausted)
}

/// generates a random string from `runes` using the thread-local generator.
pub fn generate_crypto_random_string(n: usize, runes: &[u8]) -> String {
    let mut rng = rng();

    let rand_string: String = (0..n)
        .map(|_| {
            let idx = rng.random_range(0..runes.len());
            runes[idx] as char
        })
        .collect();

    rand_string
}
