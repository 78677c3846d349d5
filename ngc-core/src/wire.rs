// Copyright (c) 2024 Botho Foundation

//! Small on-wire structures shared by the handshake, sync, and connection
//! layers: packed IP/port pairs and TCP relay node hints.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

/// A packed IPv4/IPv6 address plus port, or "none" if no direct address is
/// known for a peer. Packed form: 1 family byte (0 = none, 4, 6) followed
/// by 4 or 16 address bytes and a 2-byte big-endian port (omitted when
/// family is 0).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IpPort {
    pub addr: Option<IpAddr>,
    pub port: u16,
}

impl IpPort {
    pub const NONE: IpPort = IpPort {
        addr: None,
        port: 0,
    };

    pub fn new(addr: IpAddr, port: u16) -> Self {
        Self {
            addr: Some(addr),
            port,
        }
    }

    pub fn packed_len(&self) -> usize {
        match self.addr {
            None => 1,
            Some(IpAddr::V4(_)) => 1 + 4 + 2,
            Some(IpAddr::V6(_)) => 1 + 16 + 2,
        }
    }

    pub fn write(&self, out: &mut Vec<u8>) {
        match self.addr {
            None => out.push(0),
            Some(IpAddr::V4(v4)) => {
                out.push(4);
                out.extend_from_slice(&v4.octets());
                out.extend_from_slice(&self.port.to_be_bytes());
            }
            Some(IpAddr::V6(v6)) => {
                out.push(6);
                out.extend_from_slice(&v6.octets());
                out.extend_from_slice(&self.port.to_be_bytes());
            }
        }
    }

    /// Parse an `IpPort` from the front of `buf`, returning the remainder.
    pub fn parse(buf: &[u8]) -> Option<(Self, &[u8])> {
        let family = *buf.first()?;
        let rest = &buf[1..];
        match family {
            0 => Some((Self::NONE, rest)),
            4 => {
                if rest.len() < 6 {
                    return None;
                }
                let mut octets = [0u8; 4];
                octets.copy_from_slice(&rest[..4]);
                let port = u16::from_be_bytes(rest[4..6].try_into().ok()?);
                Some((
                    Self::new(IpAddr::V4(Ipv4Addr::from(octets)), port),
                    &rest[6..],
                ))
            }
            6 => {
                if rest.len() < 18 {
                    return None;
                }
                let mut octets = [0u8; 16];
                octets.copy_from_slice(&rest[..16]);
                let port = u16::from_be_bytes(rest[16..18].try_into().ok()?);
                Some((
                    Self::new(IpAddr::V6(Ipv6Addr::from(octets)), port),
                    &rest[18..],
                ))
            }
            _ => None,
        }
    }
}

/// A hint for reaching a peer or handshake responder through a TCP relay:
/// the relay's own DHT public key plus its address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelayNode {
    pub pk: [u8; 32],
    pub addr: IpPort,
}

impl RelayNode {
    pub fn packed_len(&self) -> usize {
        32 + self.addr.packed_len()
    }

    pub fn write(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.pk);
        self.addr.write(out);
    }

    pub fn parse(buf: &[u8]) -> Option<(Self, &[u8])> {
        if buf.len() < 32 {
            return None;
        }
        let mut pk = [0u8; 32];
        pk.copy_from_slice(&buf[..32]);
        let (addr, rest) = IpPort::parse(&buf[32..])?;
        Some((Self { pk, addr }, rest))
    }
}
