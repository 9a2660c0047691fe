//! Server side of the SOCKS5 CONNECT handshake (no auth, RFC 1928).

use std::io::{Read, Write};
use std::net::{Ipv4Addr, Ipv6Addr};
use std::time::Duration;

use thiserror::Error;

const VERSION: u8 = 0x05;
const NO_AUTH: u8 = 0x00;
const NO_ACCEPTABLE: u8 = 0xFF;
const CMD_CONNECT: u8 = 0x01;

#[derive(Debug, Error)]
pub enum SocksError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("unsupported SOCKS version {0}")]
    Version(u8),
    #[error("client offers no usable auth method")]
    NoAuthMethod,
    #[error("unsupported SOCKS command {0}")]
    Command(u8),
    #[error("unsupported address type {0}")]
    AddressType(u8),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reply {
    Succeeded = 0x00,
    HostUnreachable = 0x04,
    CommandNotSupported = 0x07,
}

/// Read greeting and request; returns the destination the client asked for.
pub fn negotiate<S: Read + Write>(stream: &mut S) -> Result<(String, u16), SocksError> {
    let mut header = [0u8; 2];
    stream.read_exact(&mut header)?;
    if header[0] != VERSION {
        return Err(SocksError::Version(header[0]));
    }
    let mut methods = vec![0u8; header[1] as usize];
    stream.read_exact(&mut methods)?;
    if !methods.contains(&NO_AUTH) {
        let _ = stream.write_all(&[VERSION, NO_ACCEPTABLE]);
        return Err(SocksError::NoAuthMethod);
    }
    stream.write_all(&[VERSION, NO_AUTH])?;

    let mut req = [0u8; 4];
    stream.read_exact(&mut req)?;
    if req[0] != VERSION {
        return Err(SocksError::Version(req[0]));
    }
    if req[1] != CMD_CONNECT {
        let _ = reply(stream, Reply::CommandNotSupported);
        return Err(SocksError::Command(req[1]));
    }

    let host = match req[3] {
        0x01 => {
            let mut buf = [0u8; 4];
            stream.read_exact(&mut buf)?;
            Ipv4Addr::from(buf).to_string()
        }
        0x03 => {
            let mut len = [0u8; 1];
            stream.read_exact(&mut len)?;
            let mut buf = vec![0u8; len[0] as usize];
            stream.read_exact(&mut buf)?;
            String::from_utf8_lossy(&buf).into_owned()
        }
        0x04 => {
            let mut buf = [0u8; 16];
            stream.read_exact(&mut buf)?;
            Ipv6Addr::from(buf).to_string()
        }
        other => return Err(SocksError::AddressType(other)),
    };

    let mut port = [0u8; 2];
    stream.read_exact(&mut port)?;
    Ok((host, u16::from_be_bytes(port)))
}

/// Send the final reply. The bound address is always reported as 0.0.0.0:0.
pub fn reply<W: Write>(stream: &mut W, code: Reply) -> std::io::Result<()> {
    stream.write_all(&[VERSION, code as u8, 0x00, 0x01, 0, 0, 0, 0, 0, 0])
}

/// Negotiation timeout applied to a freshly accepted client.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
