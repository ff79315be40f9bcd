//! Wire protocol types for ferry transfers.
//!
//! A transfer moves one byte stream between two peers over a
//! message-oriented transport. This crate defines the four message kinds
//! that make up the protocol ([`TransferMessage`]), the packet-number
//! encoding that marks the final chunk of a stream ([`packet`]), and the
//! self-describing parameter blocks that tell the serving peer what to
//! read and the receiving peer how to consume it ([`params`]).
//!
//! Everything here is pure data — no I/O, no state machines. The state
//! machines live in `ferry-transfer`.

pub mod messages;
pub mod packet;
pub mod params;

pub use messages::TransferMessage;
pub use params::{AssetKind, AssetParams, FileParams, SourceKind, SourceParams};

/// Errors from wire encoding and decoding.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("message too short (need at least 4 bytes)")]
    TooShort,

    #[error("header truncated: expected {expected} bytes, got {got}")]
    HeaderTruncated { expected: usize, got: usize },

    #[error("invalid header JSON: {0}")]
    InvalidJson(String),

    #[error("missing header field `{0}`")]
    MissingField(&'static str),

    #[error("payload checksum mismatch: header says {expected:#010x}, computed {got:#010x}")]
    ChecksumMismatch { expected: u32, got: u32 },

    #[error("packet number {0} exceeds the protocol ceiling")]
    PacketNumberOverflow(u64),
}
