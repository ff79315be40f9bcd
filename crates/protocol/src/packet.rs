//! Packet-number encoding and the first-packet size prefix.
//!
//! The 32-bit packet-number field on the wire does double duty: the low
//! 31 bits are the chunk index, and the top bit flags the final chunk of
//! the stream. There is no separate end-of-stream message.
//!
//! ```text
//! [bit 31: final][bits 30..0: chunk index]
//! ```
//!
//! Packet 0 carries one more piece of framing: its payload is prefixed
//! with the stream's declared total size as a 4-byte big-endian integer,
//! so the receiver can pre-allocate before any data lands.
//!
//! Reusing the top bit caps a transfer at 2^31 chunks. At the default
//! chunk size that is ~2 TB per transfer, which nothing here approaches,
//! but [`encode_packet_number`] refuses to encode past the ceiling rather
//! than silently corrupting the final-bit.

use crate::ProtocolError;

/// Bit flagging the final chunk of a stream.
pub const FINAL_PACKET_FLAG: u32 = 0x8000_0000;

/// Largest encodable chunk index.
pub const MAX_PACKET_NUMBER: u32 = 0x7FFF_FFFF;

/// Default payload bytes per chunk.
pub const DEFAULT_CHUNK_SIZE: usize = 1000;

/// Payload bytes per chunk when both peers negotiated bulk packets.
pub const BULK_CHUNK_SIZE: usize = 7680;

/// Length of the declared-total-size prefix on packet 0.
pub const SIZE_PREFIX_LEN: usize = 4;

/// Encodes a chunk index, setting the final-bit when `is_final`.
pub fn encode_packet_number(packet: u32, is_final: bool) -> Result<u32, ProtocolError> {
    if packet > MAX_PACKET_NUMBER {
        return Err(ProtocolError::PacketNumberOverflow(packet as u64));
    }
    Ok(if is_final {
        packet | FINAL_PACKET_FLAG
    } else {
        packet
    })
}

/// Extracts the chunk index from a raw packet-number field.
pub fn decode_packet_number(raw: u32) -> u32 {
    raw & MAX_PACKET_NUMBER
}

/// Returns `true` if the raw packet-number field carries the final-bit.
pub fn is_final_packet(raw: u32) -> bool {
    raw & FINAL_PACKET_FLAG != 0
}

/// Prepends the 4-byte big-endian total-size prefix to a first-packet payload.
pub fn prefix_total_size(total_size: u32, data: &[u8]) -> Vec<u8> {
    let mut payload = Vec::with_capacity(SIZE_PREFIX_LEN + data.len());
    payload.extend_from_slice(&total_size.to_be_bytes());
    payload.extend_from_slice(data);
    payload
}

/// Splits a first-packet payload into the declared total size and the data.
pub fn split_total_size(payload: &[u8]) -> Result<(u32, &[u8]), ProtocolError> {
    if payload.len() < SIZE_PREFIX_LEN {
        return Err(ProtocolError::TooShort);
    }
    let total = u32::from_be_bytes(payload[..SIZE_PREFIX_LEN].try_into().unwrap());
    Ok((total, &payload[SIZE_PREFIX_LEN..]))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_without_final_bit() {
        assert_eq!(encode_packet_number(0, false).unwrap(), 0);
        assert_eq!(encode_packet_number(42, false).unwrap(), 42);
        assert_eq!(
            encode_packet_number(MAX_PACKET_NUMBER, false).unwrap(),
            MAX_PACKET_NUMBER
        );
    }

    #[test]
    fn encode_with_final_bit() {
        assert_eq!(encode_packet_number(0, true).unwrap(), FINAL_PACKET_FLAG);
        assert_eq!(encode_packet_number(2, true).unwrap(), 0x8000_0002);
    }

    #[test]
    fn encode_rejects_overflow() {
        let err = encode_packet_number(MAX_PACKET_NUMBER + 1, false);
        assert!(matches!(err, Err(ProtocolError::PacketNumberOverflow(_))));
    }

    #[test]
    fn decode_strips_final_bit() {
        assert_eq!(decode_packet_number(0x8000_0002), 2);
        assert_eq!(decode_packet_number(2), 2);
    }

    #[test]
    fn final_bit_detection() {
        assert!(is_final_packet(0x8000_0000));
        assert!(is_final_packet(0x8000_0017));
        assert!(!is_final_packet(0x7FFF_FFFF));
        assert!(!is_final_packet(0));
    }

    #[test]
    fn size_prefix_roundtrip() {
        let payload = prefix_total_size(2500, b"hello");
        assert_eq!(payload.len(), SIZE_PREFIX_LEN + 5);
        assert_eq!(&payload[..4], &[0, 0, 9, 196]); // 2500 big-endian

        let (total, data) = split_total_size(&payload).unwrap();
        assert_eq!(total, 2500);
        assert_eq!(data, b"hello");
    }

    #[test]
    fn size_prefix_empty_data() {
        let payload = prefix_total_size(0, b"");
        let (total, data) = split_total_size(&payload).unwrap();
        assert_eq!(total, 0);
        assert!(data.is_empty());
    }

    #[test]
    fn split_rejects_short_payload() {
        assert!(matches!(
            split_total_size(&[1, 2, 3]),
            Err(ProtocolError::TooShort)
        ));
    }
}
