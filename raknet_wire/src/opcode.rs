//! The handful of RakNet control opcodes this proxy understands.
//!
//! Everything else is opaque payload and passes through untouched - the
//! proxy is not a RakNet implementation, it only knows enough to find
//! and rewrite four address fields.

use std::ops::Range;

/// Data flow direction of a datagram relative to the proxy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    ClientToServer,
    ServerToClient,
}

/// Control opcodes whose payload contains an address field the proxy
/// must rewrite. Opcode values match the RakNet wire protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RaknetOpcode {
    /// Client -> server. Carries the address the client believes the
    /// server is at (the proxy, from the client's point of view).
    OpenConnectionRequest2 = 0x07,
    /// Server -> client. Carries the address the server believes the
    /// client is at (the proxy's upstream socket).
    OpenConnectionReply2 = 0x08,
    /// Server -> client. Carries the client address the server saw.
    ConnectionRequestAccepted = 0x10,
    /// Client -> server. Carries the address the client believes the
    /// server is at, again.
    NewIncomingConnection = 0x13,
}

impl RaknetOpcode {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x07 => Some(Self::OpenConnectionRequest2),
            0x08 => Some(Self::OpenConnectionReply2),
            0x10 => Some(Self::ConnectionRequestAccepted),
            0x13 => Some(Self::NewIncomingConnection),
            _ => None,
        }
    }

    pub fn to_u8(self) -> u8 {
        self as u8
    }

    /// Direction this opcode travels in.
    pub fn direction(self) -> Direction {
        match self {
            Self::OpenConnectionRequest2 | Self::NewIncomingConnection => {
                Direction::ClientToServer
            }
            Self::OpenConnectionReply2 | Self::ConnectionRequestAccepted => {
                Direction::ServerToClient
            }
        }
    }

    /// Byte range (0-based, exclusive end) of the embedded address
    /// field within the packet payload, including the IP-version byte.
    pub fn field_range(self) -> Range<usize> {
        match self {
            Self::OpenConnectionRequest2 => 8..15,
            Self::OpenConnectionReply2 => 16..23,
            Self::ConnectionRequestAccepted => 1..8,
            Self::NewIncomingConnection => 1..8,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_known_opcodes() {
        for opcode in [
            RaknetOpcode::OpenConnectionRequest2,
            RaknetOpcode::OpenConnectionReply2,
            RaknetOpcode::ConnectionRequestAccepted,
            RaknetOpcode::NewIncomingConnection,
        ] {
            assert_eq!(RaknetOpcode::from_u8(opcode.to_u8()), Some(opcode));
        }
    }

    #[test]
    fn unknown_opcode_is_none() {
        assert_eq!(RaknetOpcode::from_u8(0x84), None);
        assert_eq!(RaknetOpcode::from_u8(0x09), None);
    }

    #[test]
    fn field_ranges_are_seven_bytes_wide() {
        for opcode in [
            RaknetOpcode::OpenConnectionRequest2,
            RaknetOpcode::OpenConnectionReply2,
            RaknetOpcode::ConnectionRequestAccepted,
            RaknetOpcode::NewIncomingConnection,
        ] {
            let range = opcode.field_range();
            assert_eq!(range.end - range.start, 7);
        }
    }
}
