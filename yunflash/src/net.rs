//! Host and device address allocation.
//!
//! The board is told over the boot-loader console which server to fetch
//! images from (`serverip`) and which address to assume itself (`ipaddr`).
//! The server address is the host's own address on an active interface; the
//! device address is picked on the same subnet by walking the last octet
//! upward from the server address and probing each candidate until one looks
//! unused.
//!
//! Retries pass the previously used server address so that multi-homed hosts
//! rotate to a different interface when one exists; on a single-homed host
//! the same address is reused.

use crate::error::{Error, Result};
use log::{debug, info};
use std::net::{IpAddr, Ipv4Addr, SocketAddr, TcpStream};
use std::time::Duration;

/// TCP port probed on candidate device addresses.
const PROBE_PORT: u16 = 80;

/// How long a candidate probe may take before the address counts as free.
const PROBE_TIMEOUT: Duration = Duration::from_secs(2);

/// A server/device address pair advertised to the board.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddressPair {
    /// The host address the TFTP server is reachable on.
    pub server: Ipv4Addr,
    /// The free address the board is told to assume.
    pub device: Ipv4Addr,
}

impl std::fmt::Display for AddressPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "server {} / device {}", self.server, self.device)
    }
}

/// Allocate a fresh server/device address pair.
///
/// `not_this` is the server address of a failed previous attempt; it is
/// skipped when another interface is available.
pub fn allocate_addresses(not_this: Option<Ipv4Addr>) -> Result<AddressPair> {
    let server = pick_host_address(&host_candidates()?, not_this)?;
    let device = pick_device_address(server, probe_in_use)?;
    debug!("allocated addresses: server {server}, device {device}");
    Ok(AddressPair { server, device })
}

/// IPv4 addresses of all up, non-loopback interfaces, with interface names.
pub fn host_candidates() -> Result<Vec<(String, Ipv4Addr)>> {
    let mut candidates = Vec::new();
    for iface in if_addrs::get_if_addrs()? {
        if iface.is_loopback() {
            continue;
        }
        if let IpAddr::V4(addr) = iface.ip() {
            debug!("interface {}: {}", iface.name, addr);
            candidates.push((iface.name, addr));
        }
    }
    Ok(candidates)
}

/// Pick the host (server) address from the candidate list.
///
/// Prefers an address different from `not_this`; falls back to the first
/// candidate when no alternative exists.
pub fn pick_host_address(
    candidates: &[(String, Ipv4Addr)],
    not_this: Option<Ipv4Addr>,
) -> Result<Ipv4Addr> {
    let Some((first_name, first)) = candidates.first() else {
        return Err(Error::Network(
            "Could not get your IP address, check your network connection".into(),
        ));
    };
    for (name, addr) in candidates {
        if Some(*addr) != not_this {
            debug!("using {addr} on {name} as server address");
            return Ok(*addr);
        }
    }
    info!("no alternative interface available, reusing {first} on {first_name}");
    Ok(*first)
}

/// Pick a device address on the server's subnet.
///
/// Walks the last octet upward from `server + 1` and returns the first
/// candidate `in_use` reports free. `.255` is never considered.
pub fn pick_device_address(
    server: Ipv4Addr,
    mut in_use: impl FnMut(Ipv4Addr) -> bool,
) -> Result<Ipv4Addr> {
    let [a, b, c, start] = server.octets();
    for last in start.saturating_add(1)..255 {
        let candidate = Ipv4Addr::new(a, b, c, last);
        if !in_use(candidate) {
            return Ok(candidate);
        }
        debug!("{candidate} is already taken");
    }
    Err(Error::Network(format!(
        "no free address found on the subnet of {server}"
    )))
}

/// Whether some host already answers at `addr`.
///
/// A completed or refused TCP connection both mean something lives there;
/// only a timeout or unreachable result counts as free.
fn probe_in_use(addr: Ipv4Addr) -> bool {
    let target = SocketAddr::from((addr, PROBE_PORT));
    match TcpStream::connect_timeout(&target, PROBE_TIMEOUT) {
        Ok(_) => true,
        Err(e) => e.kind() == std::io::ErrorKind::ConnectionRefused,
    }
}
