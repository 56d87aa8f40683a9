//! wsrelay protocol - frame and payload definitions
//!
//! This crate defines the wire format spoken between a controller and the agent:
//! - `Frame`: length-delimited, typed, token-addressed unit (see [`frame`])
//! - `CommandType`: the closed set of frame kinds
//! - `Token` / `ConnectionToken`: 16-byte identifiers
//! - Payload codecs for every command that carries one
//!
//! Everything here is pure; no I/O.

mod command;
mod connect;
mod files;
mod frame;
mod messages;
mod token;
mod wire;

pub use command::*;
pub use connect::*;
pub use files::*;
pub use frame::*;
pub use messages::*;
pub use token::*;
pub use wire::*;

use bytes::Bytes;

/// A typed frame payload
pub trait Payload: Sized {
    fn decode(payload: &[u8]) -> Result<Self, WireError>;

    fn encode(&self) -> Bytes;
}
