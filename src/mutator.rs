//! Inspects the first byte (opcode) of a datagram and, for the four
//! recognized RakNet control opcodes, overwrites a fixed-offset 7-byte
//! address field in place. Everything else passes through untouched.
//!
//! Deliberately offset-based rather than a structured
//! deserialize-mutate-reserialize round trip: scanning the payload for
//! a byte pattern and replacing it wherever found risks rewriting an
//! unrelated 7-byte sequence that happens to match, and reserializing
//! would require understanding fields this proxy has no business parsing.

use raknet_wire::{addr::IP_VERSION_V4, opcode::Direction, AddressTemplate, RaknetOpcode};

/// What the caller should do with the datagram after [`mutate`] runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Forward the (possibly mutated) payload.
    Forward,
    /// Drop the datagram. Used only for the short-packet edge case;
    /// never for an unrecognized opcode or an IPv6 address field.
    Drop,
}

/// Applies the client->server mutation: stamps the server's real
/// address into `OpenConnectionRequest2` / `NewIncomingConnection`
/// packets, replacing whatever endpoint the client believed it was
/// talking to.
pub fn mutate_client_to_server(payload: &mut [u8], server_template: &AddressTemplate) -> Outcome {
    mutate(payload, Direction::ClientToServer, server_template)
}

/// Applies the server->client mutation: stamps the client's real
/// address into `OpenConnectionReply2` / `ConnectionRequestAccepted`
/// packets, replacing the proxy's upstream-socket endpoint the server
/// observed.
pub fn mutate_server_to_client(payload: &mut [u8], client_template: &AddressTemplate) -> Outcome {
    mutate(payload, Direction::ServerToClient, client_template)
}

fn mutate(payload: &mut [u8], direction: Direction, template: &AddressTemplate) -> Outcome {
    let Some(opcode) = payload.first().copied().and_then(RaknetOpcode::from_u8) else {
        return Outcome::Forward;
    };
    if opcode.direction() != direction {
        return Outcome::Forward;
    }

    let range = opcode.field_range();
    if payload.len() < range.end {
        log::warn!(
            "dropping {:?} packet: {} bytes, field at offset {} needs {}",
            opcode,
            payload.len(),
            range.start,
            range.end
        );
        return Outcome::Drop;
    }
    if payload[range.start] != IP_VERSION_V4 {
        // IPv6-encoded field (29 bytes, different layout) - a known,
        // deliberate limitation. Pass through unmodified.
        return Outcome::Forward;
    }
    payload[range.clone()].copy_from_slice(template.as_bytes());
    Outcome::Forward
}
