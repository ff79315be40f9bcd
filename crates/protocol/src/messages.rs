//! Binary framing for transfer messages.
//!
//! # Wire format
//!
//! ```text
//! [4 bytes BE: header_len][header_len bytes: JSON header][rest: payload]
//! ```
//!
//! The JSON header identifies the message kind and carries the small
//! fields; only `Chunk` messages have a payload after the header. A
//! chunk's header additionally carries a CRC-32 of its payload, checked
//! on decode, so a corrupted chunk surfaces as a framing error instead of
//! corrupt data on disk.
//!
//! Packet 0 of a stream prefixes its payload with the 4-byte declared
//! total size — that prefix is part of the payload here, applied and
//! stripped by the transfer layer (see [`crate::packet`]).

use serde::{Deserialize, Serialize};

use crate::ProtocolError;
use crate::params::SourceParams;

/// A protocol message exchanged between two transfer peers.
#[derive(Debug, Clone, PartialEq)]
pub enum TransferMessage {
    /// Asks the peer to start serving a stream.
    Request {
        transfer_id: u64,
        params: SourceParams,
        priority: bool,
    },
    /// One chunk of stream data. `packet` is the raw packet-number field:
    /// low 31 bits index, top bit final.
    Chunk {
        transfer_id: u64,
        packet: u32,
        payload: Vec<u8>,
    },
    /// Acknowledges receipt of chunk `packet` (index form, no final-bit).
    Confirm { transfer_id: u64, packet: u32 },
    /// Terminates the transfer with a result code.
    Abort { transfer_id: u64, result: i32 },
}

impl TransferMessage {
    /// The transfer this message belongs to.
    pub fn transfer_id(&self) -> u64 {
        match self {
            TransferMessage::Request { transfer_id, .. }
            | TransferMessage::Chunk { transfer_id, .. }
            | TransferMessage::Confirm { transfer_id, .. }
            | TransferMessage::Abort { transfer_id, .. } => *transfer_id,
        }
    }

    /// Encodes the message into its wire form.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        let (header, payload) = match self {
            TransferMessage::Request {
                transfer_id,
                params,
                priority,
            } => (
                WireHeader {
                    kind: MessageKind::Request,
                    transfer_id: *transfer_id,
                    params: Some(params.clone()),
                    priority: *priority,
                    packet: None,
                    crc32: None,
                    result: None,
                },
                &[][..],
            ),
            TransferMessage::Chunk {
                transfer_id,
                packet,
                payload,
            } => (
                WireHeader {
                    kind: MessageKind::Chunk,
                    transfer_id: *transfer_id,
                    params: None,
                    priority: false,
                    packet: Some(*packet),
                    crc32: Some(crc32fast::hash(payload)),
                    result: None,
                },
                payload.as_slice(),
            ),
            TransferMessage::Confirm {
                transfer_id,
                packet,
            } => (
                WireHeader {
                    kind: MessageKind::Confirm,
                    transfer_id: *transfer_id,
                    params: None,
                    priority: false,
                    packet: Some(*packet),
                    crc32: None,
                    result: None,
                },
                &[][..],
            ),
            TransferMessage::Abort {
                transfer_id,
                result,
            } => (
                WireHeader {
                    kind: MessageKind::Abort,
                    transfer_id: *transfer_id,
                    params: None,
                    priority: false,
                    packet: None,
                    crc32: None,
                    result: Some(*result),
                },
                &[][..],
            ),
        };

        let header_json =
            serde_json::to_vec(&header).map_err(|e| ProtocolError::InvalidJson(e.to_string()))?;
        let mut buf = Vec::with_capacity(4 + header_json.len() + payload.len());
        buf.extend_from_slice(&(header_json.len() as u32).to_be_bytes());
        buf.extend_from_slice(&header_json);
        buf.extend_from_slice(payload);
        Ok(buf)
    }

    /// Decodes a raw frame into a message, verifying chunk checksums.
    pub fn decode(data: &[u8]) -> Result<TransferMessage, ProtocolError> {
        if data.len() < 4 {
            return Err(ProtocolError::TooShort);
        }
        let header_len = u32::from_be_bytes(data[..4].try_into().unwrap()) as usize;
        if data.len() < 4 + header_len {
            return Err(ProtocolError::HeaderTruncated {
                expected: header_len,
                got: data.len() - 4,
            });
        }

        let header: WireHeader = serde_json::from_slice(&data[4..4 + header_len])
            .map_err(|e| ProtocolError::InvalidJson(e.to_string()))?;
        let payload = &data[4 + header_len..];

        match header.kind {
            MessageKind::Request => Ok(TransferMessage::Request {
                transfer_id: header.transfer_id,
                params: header.params.ok_or(ProtocolError::MissingField("params"))?,
                priority: header.priority,
            }),
            MessageKind::Chunk => {
                let packet = header.packet.ok_or(ProtocolError::MissingField("packet"))?;
                let expected = header.crc32.ok_or(ProtocolError::MissingField("crc32"))?;
                let got = crc32fast::hash(payload);
                if got != expected {
                    return Err(ProtocolError::ChecksumMismatch { expected, got });
                }
                Ok(TransferMessage::Chunk {
                    transfer_id: header.transfer_id,
                    packet,
                    payload: payload.to_vec(),
                })
            }
            MessageKind::Confirm => Ok(TransferMessage::Confirm {
                transfer_id: header.transfer_id,
                packet: header.packet.ok_or(ProtocolError::MissingField("packet"))?,
            }),
            MessageKind::Abort => Ok(TransferMessage::Abort {
                transfer_id: header.transfer_id,
                result: header.result.ok_or(ProtocolError::MissingField("result"))?,
            }),
        }
    }
}

/// Message kind tag in the JSON header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
enum MessageKind {
    Request,
    Chunk,
    Confirm,
    Abort,
}

/// Flat JSON header shared by all message kinds.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireHeader {
    #[serde(rename = "type")]
    kind: MessageKind,
    transfer_id: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    params: Option<SourceParams>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    priority: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    packet: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    crc32: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    result: Option<i32>,
}
