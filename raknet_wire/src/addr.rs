//! RakNet address field codec.
//!
//! RakNet encodes an IPv4 endpoint as 7 bytes: a version byte (always
//! `0x04` for IPv4), the four octets bitwise-complemented, and the port
//! in big-endian order. This is a RakNet quirk, not a general network
//! byte order convention - the complement is part of the wire contract.

use std::net::{Ipv4Addr, SocketAddr};

/// Length in bytes of an IPv4 RakNet address field.
pub const ADDRESS_TEMPLATE_LEN: usize = 7;

/// IP version byte marking an IPv4 address field.
pub const IP_VERSION_V4: u8 = 0x04;

#[derive(Debug, thiserror::Error, Clone, Copy, PartialEq, Eq)]
pub enum AddrError {
    #[error("unsupported address family byte {0:#04x}, expected {IP_VERSION_V4:#04x}")]
    UnsupportedAddrFamily(u8),
}

/// The exact 7-byte sequence an IPv4 endpoint occupies in a RakNet
/// payload. Precomputed once per flow and substituted in place by the
/// mutator - never reparsed from a live packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AddressTemplate([u8; ADDRESS_TEMPLATE_LEN]);

impl AddressTemplate {
    /// Encodes an endpoint into its RakNet wire representation.
    pub fn encode(ip: Ipv4Addr, port: u16) -> Self {
        let octets = ip.octets();
        let [port_hi, port_lo] = port.to_be_bytes();
        Self([
            IP_VERSION_V4,
            !octets[0],
            !octets[1],
            !octets[2],
            !octets[3],
            port_hi,
            port_lo,
        ])
    }

    /// Encodes a socket address, if it's IPv4. RakNet's IPv6 template
    /// has a different length and isn't produced by this proxy.
    pub fn from_socket_addr(addr: SocketAddr) -> Option<Self> {
        match addr {
            SocketAddr::V4(addr) => Some(Self::encode(*addr.ip(), addr.port())),
            SocketAddr::V6(_) => None,
        }
    }

    /// Decodes a 7-byte RakNet address field back into an endpoint.
    pub fn decode(bytes: [u8; ADDRESS_TEMPLATE_LEN]) -> Result<(Ipv4Addr, u16), AddrError> {
        if bytes[0] != IP_VERSION_V4 {
            return Err(AddrError::UnsupportedAddrFamily(bytes[0]));
        }
        let ip = Ipv4Addr::new(!bytes[1], !bytes[2], !bytes[3], !bytes[4]);
        let port = u16::from_be_bytes([bytes[5], bytes[6]]);
        Ok((ip, port))
    }

    /// Returns the raw 7 bytes, ready to be copied into a payload.
    pub fn as_bytes(&self) -> &[u8; ADDRESS_TEMPLATE_LEN] {
        &self.0
    }
}
