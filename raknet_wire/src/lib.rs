//! RakNet wire format primitives shared between the dispatcher and the
//! per-client flows: the address field encoding and the handful of
//! control opcodes the proxy rewrites.

pub mod addr;
pub mod opcode;

pub use addr::{AddrError, AddressTemplate};
pub use opcode::RaknetOpcode;
