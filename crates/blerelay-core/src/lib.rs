//! blerelay-core — shared types, configuration, and the client wire protocol.
//! All other blerelay crates depend on this one.

pub mod config;
pub mod gatt;
pub mod mac;
pub mod protocol;

pub use mac::{MacAddress, MacParseError};
pub use protocol::{ClientMessage, ProtocolError, ServerMessage};
