//! # Wire Protocol
//!
//! Messages exchanged with nodes inside each tick, and the length-framed
//! binary codec that carries them.
//!
//! ## Framing
//!
//! ```text
//! ┌──────────────────────┬─────┬──────────────────┐
//! │ u32 BE header        │ tag │ payload          │  repeated
//! │ flags:2 | length:30  │ u8  │ (length - 1) B   │
//! └──────────────────────┴─────┴──────────────────┘
//! 0x00000000                                         terminator
//! ```
//!
//! All integers are big-endian. Strings carry a `u16` byte length, blobs a
//! `u32` byte length. Positions use `-1` for "none".

pub mod codec;
pub mod message;

pub use codec::{decode_messages, encode_messages, CodecError};
pub use message::{Message, MessageTag, NodeStatistics};

/// Version sent with every tick in the [`PROTOCOL_HEADER`] header.
pub const PROTOCOL_VERSION: u32 = 1;

/// Request header carrying [`PROTOCOL_VERSION`].
pub const PROTOCOL_HEADER: &str = "X-Relay-Protocol";
