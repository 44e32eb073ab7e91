//! Read-only TFTP firmware origin server (RFC 1350 subset).
//!
//! The boot-loader on the board fetches firmware images with its `tftp`
//! command, so the updater has to be the server side of the exchange. Only
//! read requests in `octet` mode are honored; anything else is answered with
//! a TFTP error packet. Files are served by bare name from a single root
//! directory and requests can never escape it.
//!
//! ## Packet Formats
//!
//! ```text
//! RRQ/WRQ:  +--------+------------+----+----------+----+
//!           | opcode |  filename  | 0  |   mode   | 0  |
//!           | 2 bytes|  string    |    |  string  |    |
//!           +--------+------------+----+----------+----+
//!
//! DATA:     +--------+--------+--------------+
//!           | opcode | block# |     data     |
//!           |  0x03  | 2 bytes|  0-512 bytes |
//!           +--------+--------+--------------+
//!
//! ACK:      +--------+--------+
//!           | opcode | block# |
//!           |  0x04  | 2 bytes|
//!           +--------+--------+
//!
//! ERROR:    +--------+--------+------------+----+
//!           | opcode |  code  |  message   | 0  |
//!           |  0x05  | 2 bytes|  string    |    |
//!           +--------+--------+------------+----+
//! ```
//!
//! All two-byte fields are big-endian. A transfer is over when a DATA packet
//! carries fewer than 512 payload bytes; a file whose size is an exact
//! multiple of 512 is terminated by an empty DATA packet.

use crate::error::{Error, Result};
use byteorder::{BigEndian, WriteBytesExt};
use log::{debug, info, warn};
use std::fs::File;
use std::io::Read;
use std::net::{SocketAddr, ToSocketAddrs, UdpSocket};
use std::path::PathBuf;
use std::thread;
use std::time::Duration;

/// The well-known TFTP port.
pub const TFTP_PORT: u16 = 69;

/// Payload bytes per DATA packet.
pub const BLOCK_SIZE: usize = 512;

/// How long to wait for the client's ACK before retransmitting.
const ACK_TIMEOUT: Duration = Duration::from_secs(5);

/// Retransmissions of one DATA packet before the transfer is abandoned.
const MAX_RETRANSMITS: u32 = 5;

/// TFTP packet opcodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum Opcode {
    /// Read request.
    ReadRequest = 1,
    /// Write request (always rejected).
    WriteRequest = 2,
    /// Data block.
    Data = 3,
    /// Block acknowledgment.
    Ack = 4,
    /// Error report.
    Error = 5,
}

impl Opcode {
    fn from_u16(value: u16) -> Option<Self> {
        match value {
            1 => Some(Self::ReadRequest),
            2 => Some(Self::WriteRequest),
            3 => Some(Self::Data),
            4 => Some(Self::Ack),
            5 => Some(Self::Error),
            _ => None,
        }
    }
}

/// TFTP error codes (RFC 1350 §5).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum ErrorCode {
    /// Not defined, message carries the detail.
    NotDefined = 0,
    /// File not found.
    FileNotFound = 1,
    /// Access violation.
    AccessViolation = 2,
    /// Illegal TFTP operation.
    IllegalOperation = 4,
}

/// A parsed client request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    /// `RRQ filename mode`.
    Read {
        /// Requested file name.
        filename: String,
        /// Transfer mode (`octet`, `netascii`, ...).
        mode: String,
    },
    /// `WRQ filename mode`, never honored by this server.
    Write {
        /// Requested file name.
        filename: String,
    },
}

/// Build a read-request packet. The server never sends one; clients and
/// tests do.
#[allow(clippy::unwrap_used)] // Writing to Vec<u8> cannot fail
pub fn read_request_packet(filename: &str, mode: &str) -> Vec<u8> {
    let mut buf = Vec::with_capacity(4 + filename.len() + mode.len());
    buf.write_u16::<BigEndian>(Opcode::ReadRequest as u16).unwrap();
    buf.extend_from_slice(filename.as_bytes());
    buf.push(0);
    buf.extend_from_slice(mode.as_bytes());
    buf.push(0);
    buf
}

/// Build a DATA packet for `block` carrying `payload`.
#[allow(clippy::unwrap_used)] // Writing to Vec<u8> cannot fail
pub fn data_packet(block: u16, payload: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(4 + payload.len());
    buf.write_u16::<BigEndian>(Opcode::Data as u16).unwrap();
    buf.write_u16::<BigEndian>(block).unwrap();
    buf.extend_from_slice(payload);
    buf
}

/// Build an ACK packet for `block`.
#[allow(clippy::unwrap_used)] // Writing to Vec<u8> cannot fail
pub fn ack_packet(block: u16) -> Vec<u8> {
    let mut buf = Vec::with_capacity(4);
    buf.write_u16::<BigEndian>(Opcode::Ack as u16).unwrap();
    buf.write_u16::<BigEndian>(block).unwrap();
    buf
}

/// Build an ERROR packet.
#[allow(clippy::unwrap_used)] // Writing to Vec<u8> cannot fail
pub fn error_packet(code: ErrorCode, message: &str) -> Vec<u8> {
    let mut buf = Vec::with_capacity(5 + message.len());
    buf.write_u16::<BigEndian>(Opcode::Error as u16).unwrap();
    buf.write_u16::<BigEndian>(code as u16).unwrap();
    buf.extend_from_slice(message.as_bytes());
    buf.push(0);
    buf
}

fn read_u16_be(buf: &[u8]) -> Option<u16> {
    Some(u16::from_be_bytes([*buf.first()?, *buf.get(1)?]))
}

fn read_cstr(buf: &[u8]) -> Option<(&str, &[u8])> {
    let end = buf.iter().position(|&b| b == 0)?;
    let s = std::str::from_utf8(&buf[..end]).ok()?;
    Some((s, &buf[end + 1..]))
}

/// Parse an RRQ or WRQ packet. `None` for anything malformed or any other
/// opcode.
pub fn parse_request(buf: &[u8]) -> Option<Request> {
    let opcode = Opcode::from_u16(read_u16_be(buf)?)?;
    let rest = &buf[2..];
    let (filename, rest) = read_cstr(rest)?;
    match opcode {
        Opcode::ReadRequest => {
            let (mode, _) = read_cstr(rest)?;
            Some(Request::Read {
                filename: filename.to_string(),
                mode: mode.to_string(),
            })
        }
        Opcode::WriteRequest => Some(Request::Write {
            filename: filename.to_string(),
        }),
        _ => None,
    }
}

/// Parse an ACK packet, returning the acknowledged block number.
pub fn parse_ack(buf: &[u8]) -> Option<u16> {
    if Opcode::from_u16(read_u16_be(buf)?)? != Opcode::Ack {
        return None;
    }
    read_u16_be(&buf[2..])
}

/// A bare file name safe to look up under the root directory, or `None` when
/// the request tries to walk the filesystem.
fn sanitized(filename: &str) -> Option<&str> {
    if filename.is_empty()
        || filename.contains(['/', '\\'])
        || filename == "."
        || filename == ".."
    {
        return None;
    }
    Some(filename)
}

/// The firmware origin server.
///
/// Binding happens in [`FirmwareServer::bind`] so that a failure to claim the
/// port surfaces synchronously as a fatal configuration error; [`spawn`]
/// moves the bound socket onto a background thread that serves for the rest
/// of the process lifetime.
///
/// [`spawn`]: FirmwareServer::spawn
#[derive(Debug)]
pub struct FirmwareServer {
    socket: UdpSocket,
    root: PathBuf,
}

/// Handle to the running origin server.
///
/// The serve thread is detached for the process lifetime; the handle reports
/// where the server listens.
#[derive(Debug)]
pub struct ServerHandle {
    addr: SocketAddr,
}

impl ServerHandle {
    /// The address the server is listening on.
    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }
}

impl FirmwareServer {
    /// Bind the server socket. `root` is the directory images are served
    /// from.
    pub fn bind<A: ToSocketAddrs>(addr: A, root: impl Into<PathBuf>) -> Result<Self> {
        let socket = UdpSocket::bind(addr).map_err(|e| {
            Error::Tftp(format!(
                "cannot bind the firmware server: {e}; \
                 port {TFTP_PORT} usually requires administrator privileges"
            ))
        })?;
        Ok(Self {
            socket,
            root: root.into(),
        })
    }

    /// The bound address.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    /// Move the server onto a background thread for the process lifetime.
    pub fn spawn(self) -> Result<ServerHandle> {
        let addr = self.local_addr()?;
        thread::Builder::new()
            .name("tftp-server".into())
            .spawn(move || self.serve())?;
        info!("firmware server listening on {addr}");
        Ok(ServerHandle { addr })
    }

    fn serve(self) {
        let mut buf = [0u8; 1024];
        loop {
            let (len, peer) = match self.socket.recv_from(&mut buf) {
                Ok(received) => received,
                Err(e) => {
                    warn!("firmware server receive failed: {e}");
                    continue;
                }
            };
            self.dispatch(peer, &buf[..len]);
        }
    }

    fn dispatch(&self, peer: SocketAddr, packet: &[u8]) {
        match parse_request(packet) {
            Some(Request::Read { filename, mode }) => {
                debug!("read request from {peer}: {filename} ({mode})");
                if !mode.eq_ignore_ascii_case("octet") {
                    self.reject(peer, ErrorCode::NotDefined, "only octet mode is supported");
                    return;
                }
                let Some(name) = sanitized(&filename) else {
                    self.reject(peer, ErrorCode::AccessViolation, "invalid file name");
                    return;
                };
                let path = self.root.join(name);
                let file = match File::open(&path) {
                    Ok(file) => file,
                    Err(e) => {
                        warn!("cannot serve {}: {e}", path.display());
                        self.reject(peer, ErrorCode::FileNotFound, "file not found");
                        return;
                    }
                };
                let name = name.to_string();
                if let Err(e) = thread::Builder::new()
                    .name(format!("tftp-{name}"))
                    .spawn(move || match transfer(peer, file) {
                        Ok(total) => info!("{total} bytes sent ({name} to {peer})"),
                        Err(e) => warn!("transfer of {name} to {peer} failed: {e}"),
                    })
                {
                    warn!("cannot start transfer thread: {e}");
                }
            }
            Some(Request::Write { filename }) => {
                debug!("rejecting write request from {peer}: {filename}");
                self.reject(peer, ErrorCode::AccessViolation, "server is read-only");
            }
            None => {
                self.reject(peer, ErrorCode::IllegalOperation, "malformed request");
            }
        }
    }

    fn reject(&self, peer: SocketAddr, code: ErrorCode, message: &str) {
        if let Err(e) = self.socket.send_to(&error_packet(code, message), peer) {
            warn!("cannot send error packet to {peer}: {e}");
        }
    }
}

/// Push one file to `peer` over a fresh ephemeral socket. Returns the number
/// of payload bytes sent.
fn transfer(peer: SocketAddr, mut file: File) -> Result<u64> {
    let socket = UdpSocket::bind((local_bind_ip(peer), 0))?;
    socket.set_read_timeout(Some(ACK_TIMEOUT))?;

    let mut block: u16 = 1;
    let mut total: u64 = 0;
    loop {
        let mut payload = [0u8; BLOCK_SIZE];
        let len = read_block(&mut file, &mut payload)?;
        let packet = data_packet(block, &payload[..len]);
        send_until_acked(&socket, peer, &packet, block)?;
        total += len as u64;
        if len < BLOCK_SIZE {
            return Ok(total);
        }
        block = block.wrapping_add(1);
    }
}

/// Transfers answer from the same address family the request arrived on.
fn local_bind_ip(peer: SocketAddr) -> std::net::IpAddr {
    use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
    match peer {
        SocketAddr::V4(_) => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
        SocketAddr::V6(_) => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
    }
}

/// Fill `buf` from the file, short only at end of file.
fn read_block(file: &mut File, buf: &mut [u8]) -> Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = file.read(&mut buf[filled..])?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

/// Send one DATA packet and wait for its ACK, retransmitting on timeout.
fn send_until_acked(
    socket: &UdpSocket,
    peer: SocketAddr,
    packet: &[u8],
    block: u16,
) -> Result<()> {
    let mut reply = [0u8; 1024];
    for attempt in 1..=MAX_RETRANSMITS {
        socket.send_to(packet, peer)?;
        loop {
            match socket.recv_from(&mut reply) {
                Ok((len, from)) => {
                    if from != peer {
                        continue;
                    }
                    let reply = &reply[..len];
                    match parse_ack(reply) {
                        Some(acked) if acked == block => return Ok(()),
                        // Stale ACK of an earlier block, keep waiting.
                        Some(_) => continue,
                        None => {
                            if read_u16_be(reply) == Some(Opcode::Error as u16) {
                                return Err(Error::Tftp(format!(
                                    "client aborted the transfer at block {block}"
                                )));
                            }
                            continue;
                        }
                    }
                }
                Err(e)
                    if e.kind() == std::io::ErrorKind::WouldBlock
                        || e.kind() == std::io::ErrorKind::TimedOut =>
                {
                    debug!("no ACK for block {block} (attempt {attempt}/{MAX_RETRANSMITS})");
                    break;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }
    Err(Error::Tftp(format!(
        "no ACK for block {block} after {MAX_RETRANSMITS} attempts"
    )))
}
