//! Wire protocol shared by the server and client crates.
//!
//! Every message is one fixed-size frame of [`FRAME_SIZE`] bytes. There is no
//! delimiter and no length prefix on the stream: a reader always consumes
//! exactly one frame per packet.
//!
//! Frame layout (little-endian, fixed-width integers):
//!
//! | offset | size | field            |
//! |--------|------|------------------|
//! | 0      | 4    | type             |
//! | 4      | 8    | timestamp (secs) |
//! | 12     | 4    | message length   |
//! | 16     | 256  | message payload  |
//! | 272    | 32   | message digest   |
//!
//! Payload bytes travel through [`transform`], a keyed XOR. It obfuscates the
//! payload and nothing more; it offers no confidentiality or integrity.

use bincode::Options;
use serde::de::{self, SeqAccess, Visitor};
use serde::ser::SerializeTuple;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use thiserror::Error;

/// Maximum number of payload bytes a single frame can carry.
pub const PAYLOAD_CAPACITY: usize = 256;
/// Size of the reserved digest field.
pub const DIGEST_LEN: usize = 32;
/// Size in bytes of every frame on the wire.
pub const FRAME_SIZE: usize = 4 + 8 + 4 + PAYLOAD_CAPACITY + DIGEST_LEN;
/// Process-wide key for the payload transform.
pub const TRANSFORM_KEY: u32 = 0xdead_beef;

pub const PING: u32 = 1;
pub const PONG: u32 = 2;

/// Errors raised while building or parsing frames.
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("payload of {len} bytes exceeds frame capacity of {capacity} bytes")]
    PayloadTooLarge { len: usize, capacity: usize },
    #[error("malformed frame: got {len} bytes, expected {expected}")]
    MalformedFrame { len: usize, expected: usize },
    #[error("malformed frame: length field {length} exceeds capacity of {capacity} bytes")]
    InvalidLength { length: u32, capacity: usize },
    #[error("frame codec error: {0}")]
    Codec(#[from] bincode::Error),
}

impl ProtocolError {
    /// True for every error caused by bytes received from a peer.
    pub fn is_malformed(&self) -> bool {
        matches!(
            self,
            ProtocolError::MalformedFrame { .. }
                | ProtocolError::InvalidLength { .. }
                | ProtocolError::Codec(_)
        )
    }
}

/// Message kind carried in the frame's type field.
///
/// Codes other than PING and PONG are kept as `Other` so that newer peers can
/// introduce message types without older peers treating them as errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PacketType {
    Ping,
    Pong,
    Other(u32),
}

impl PacketType {
    pub fn code(self) -> u32 {
        match self {
            PacketType::Ping => PING,
            PacketType::Pong => PONG,
            PacketType::Other(code) => code,
        }
    }
}

impl From<u32> for PacketType {
    fn from(code: u32) -> Self {
        match code {
            PING => PacketType::Ping,
            PONG => PacketType::Pong,
            other => PacketType::Other(other),
        }
    }
}

impl From<PacketType> for u32 {
    fn from(kind: PacketType) -> Self {
        kind.code()
    }
}

impl fmt::Display for PacketType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PacketType::Ping => write!(f, "PING"),
            PacketType::Pong => write!(f, "PONG"),
            PacketType::Other(code) => write!(f, "UNKNOWN({})", code),
        }
    }
}

/// Logical view of a frame, with the payload already detransformed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub kind: PacketType,
    /// Seconds since the Unix epoch, stamped by the sender. Informational only.
    pub timestamp: u64,
    pub payload: Vec<u8>,
}

impl Packet {
    /// Creates a packet stamped with the current time.
    pub fn new(kind: PacketType, payload: &[u8]) -> Self {
        Self {
            kind,
            timestamp: current_timestamp(),
            payload: payload.to_vec(),
        }
    }

    /// Serializes the packet into exactly [`FRAME_SIZE`] bytes.
    pub fn to_frame(&self) -> Result<Vec<u8>, ProtocolError> {
        let len = self.payload.len();
        if len > PAYLOAD_CAPACITY {
            return Err(ProtocolError::PayloadTooLarge {
                len,
                capacity: PAYLOAD_CAPACITY,
            });
        }

        let mut payload = [0u8; PAYLOAD_CAPACITY];
        payload[..len].copy_from_slice(&self.payload);
        transform(&mut payload[..len]);

        let frame = WireFrame {
            kind: self.kind.code(),
            timestamp: self.timestamp,
            message: WireMessage {
                length: len as u32,
                payload: FixedBytes(payload),
                digest: FixedBytes([0u8; DIGEST_LEN]),
            },
        };

        let bytes = wire_options().serialize(&frame)?;
        debug_assert_eq!(bytes.len(), FRAME_SIZE);
        Ok(bytes)
    }

    /// Parses one frame. The input must be exactly [`FRAME_SIZE`] bytes long.
    pub fn from_frame(bytes: &[u8]) -> Result<Self, ProtocolError> {
        if bytes.len() != FRAME_SIZE {
            return Err(ProtocolError::MalformedFrame {
                len: bytes.len(),
                expected: FRAME_SIZE,
            });
        }

        let frame: WireFrame = wire_options().deserialize(bytes)?;
        let length = frame.message.length;
        if length as usize > PAYLOAD_CAPACITY {
            return Err(ProtocolError::InvalidLength {
                length,
                capacity: PAYLOAD_CAPACITY,
            });
        }

        let mut payload = frame.message.payload.0[..length as usize].to_vec();
        transform(&mut payload);

        Ok(Self {
            kind: PacketType::from(frame.kind),
            timestamp: frame.timestamp,
            payload,
        })
    }
}

/// Builds a frame of the given type carrying `payload`, stamped now.
pub fn encode(kind: PacketType, payload: &[u8]) -> Result<Vec<u8>, ProtocolError> {
    Packet::new(kind, payload).to_frame()
}

/// Parses a frame back into its logical fields.
pub fn decode(bytes: &[u8]) -> Result<Packet, ProtocolError> {
    Packet::from_frame(bytes)
}

/// Applies the keyed XOR in place. Applying it twice restores the input.
pub fn transform(bytes: &mut [u8]) {
    let key = TRANSFORM_KEY.to_be_bytes();
    for (byte, k) in bytes.iter_mut().zip(key.iter().cycle()) {
        *byte ^= k;
    }
}

/// Current time in whole seconds since the Unix epoch.
pub fn current_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::from_secs(0))
        .as_secs()
}

fn wire_options() -> impl Options {
    bincode::DefaultOptions::new()
        .with_fixint_encoding()
        .with_little_endian()
        .reject_trailing_bytes()
}

#[derive(Serialize, Deserialize)]
struct WireFrame {
    kind: u32,
    timestamp: u64,
    message: WireMessage,
}

#[derive(Serialize, Deserialize)]
struct WireMessage {
    length: u32,
    payload: FixedBytes<PAYLOAD_CAPACITY>,
    // Reserved for a content digest; always zero.
    digest: FixedBytes<DIGEST_LEN>,
}

/// Byte array serialized as a tuple so that it carries no length prefix.
struct FixedBytes<const N: usize>([u8; N]);

impl<const N: usize> Serialize for FixedBytes<N> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut tuple = serializer.serialize_tuple(N)?;
        for byte in &self.0 {
            tuple.serialize_element(byte)?;
        }
        tuple.end()
    }
}

impl<'de, const N: usize> Deserialize<'de> for FixedBytes<N> {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct FixedBytesVisitor<const N: usize>;

        impl<'de, const N: usize> Visitor<'de> for FixedBytesVisitor<N> {
            type Value = FixedBytes<N>;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "an array of {} bytes", N)
            }

            fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<Self::Value, A::Error> {
                let mut bytes = [0u8; N];
                for (index, slot) in bytes.iter_mut().enumerate() {
                    *slot = seq
                        .next_element()?
                        .ok_or_else(|| de::Error::invalid_length(index, &self))?;
                }
                Ok(FixedBytes(bytes))
            }
        }

        deserializer.deserialize_tuple(N, FixedBytesVisitor::<N>)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const LENGTH_OFFSET: usize = 12;
    const PAYLOAD_OFFSET: usize = 16;
    const DIGEST_OFFSET: usize = PAYLOAD_OFFSET + PAYLOAD_CAPACITY;

    #[test]
    fn test_frame_size_matches_serialized_layout() {
        let frame = encode(PacketType::Ping, b"").unwrap();
        assert_eq!(frame.len(), FRAME_SIZE);
        assert_eq!(FRAME_SIZE, 304);
    }

    #[test]
    fn test_roundtrip_preserves_type_and_payload() {
        for len in [0, 1, 5, 64, PAYLOAD_CAPACITY - 1, PAYLOAD_CAPACITY] {
            let payload: Vec<u8> = (0..len).map(|i| (i * 7 % 251) as u8).collect();
            let frame = encode(PacketType::Ping, &payload).unwrap();
            let packet = decode(&frame).unwrap();

            assert_eq!(packet.kind, PacketType::Ping);
            assert_eq!(packet.payload, payload);
        }
    }

    #[test]
    fn test_roundtrip_keeps_explicit_timestamp() {
        let packet = Packet {
            kind: PacketType::Pong,
            timestamp: 1_700_000_000,
            payload: b"hello".to_vec(),
        };
        let decoded = Packet::from_frame(&packet.to_frame().unwrap()).unwrap();
        assert_eq!(decoded, packet);
    }

    #[test]
    fn test_encode_stamps_current_time() {
        let before = current_timestamp();
        let packet = decode(&encode(PacketType::Pong, b"").unwrap()).unwrap();
        let after = current_timestamp();

        assert!(packet.timestamp >= before);
        assert!(packet.timestamp <= after);
    }

    #[test]
    fn test_transform_is_an_involution() {
        for len in [0, 1, 3, 4, 5, 255, PAYLOAD_CAPACITY] {
            let original: Vec<u8> = (0..len).map(|i| (i % 256) as u8).collect();
            let mut bytes = original.clone();

            transform(&mut bytes);
            if len > 0 {
                assert_ne!(bytes, original);
            }
            transform(&mut bytes);
            assert_eq!(bytes, original);
        }
    }

    #[test]
    fn test_transform_cycles_key_bytes() {
        let mut bytes = [0u8; 6];
        transform(&mut bytes);
        assert_eq!(bytes, [0xde, 0xad, 0xbe, 0xef, 0xde, 0xad]);
    }

    #[test]
    fn test_payload_is_transformed_on_the_wire() {
        let frame = encode(PacketType::Other(9), b"abcd").unwrap();
        let on_wire = &frame[PAYLOAD_OFFSET..PAYLOAD_OFFSET + 4];

        assert_ne!(on_wire, b"abcd");
        let mut restored = on_wire.to_vec();
        transform(&mut restored);
        assert_eq!(restored, b"abcd");

        // Bytes past the payload length stay zero.
        assert!(frame[PAYLOAD_OFFSET + 4..DIGEST_OFFSET].iter().all(|b| *b == 0));
    }

    #[test]
    fn test_header_fields_are_little_endian() {
        let packet = Packet {
            kind: PacketType::Pong,
            timestamp: 0x0102_0304_0506_0708,
            payload: vec![1, 2, 3],
        };
        let frame = packet.to_frame().unwrap();

        assert_eq!(&frame[0..4], &PONG.to_le_bytes());
        assert_eq!(&frame[4..12], &0x0102_0304_0506_0708u64.to_le_bytes());
        assert_eq!(&frame[LENGTH_OFFSET..PAYLOAD_OFFSET], &3u32.to_le_bytes());
    }

    #[test]
    fn test_digest_field_is_zero() {
        let frame = encode(PacketType::Ping, b"digest me").unwrap();
        assert!(frame[DIGEST_OFFSET..].iter().all(|b| *b == 0));
    }

    #[test]
    fn test_payload_at_capacity_is_accepted() {
        let payload = vec![0x41; PAYLOAD_CAPACITY];
        assert!(encode(PacketType::Ping, &payload).is_ok());
    }

    #[test]
    fn test_payload_over_capacity_is_rejected() {
        let payload = vec![0x41; PAYLOAD_CAPACITY + 1];
        match encode(PacketType::Ping, &payload) {
            Err(ProtocolError::PayloadTooLarge { len, capacity }) => {
                assert_eq!(len, PAYLOAD_CAPACITY + 1);
                assert_eq!(capacity, PAYLOAD_CAPACITY);
            }
            other => panic!("expected PayloadTooLarge, got {:?}", other),
        }
    }

    #[test]
    fn test_decode_rejects_wrong_sizes() {
        let frame = encode(PacketType::Ping, b"x").unwrap();
        let mut longer = frame.clone();
        longer.push(0);

        for bytes in [&[][..], &frame[..FRAME_SIZE - 1], &longer[..], &frame[..10]] {
            match decode(bytes) {
                Err(ProtocolError::MalformedFrame { len, expected }) => {
                    assert_eq!(len, bytes.len());
                    assert_eq!(expected, FRAME_SIZE);
                }
                other => panic!("expected MalformedFrame, got {:?}", other),
            }
        }
    }

    #[test]
    fn test_decode_rejects_length_beyond_capacity() {
        let mut frame = encode(PacketType::Ping, b"").unwrap();
        let bogus = (PAYLOAD_CAPACITY as u32 + 1).to_le_bytes();
        frame[LENGTH_OFFSET..PAYLOAD_OFFSET].copy_from_slice(&bogus);

        let err = decode(&frame).unwrap_err();
        assert!(matches!(err, ProtocolError::InvalidLength { .. }));
        assert!(err.is_malformed());
    }

    #[test]
    fn test_unknown_type_survives_roundtrip() {
        let packet = decode(&encode(PacketType::Other(42), b"future").unwrap()).unwrap();
        assert_eq!(packet.kind, PacketType::Other(42));
        assert_eq!(packet.payload, b"future");
    }

    #[test]
    fn test_packet_type_codes() {
        assert_eq!(PacketType::from(1), PacketType::Ping);
        assert_eq!(PacketType::from(2), PacketType::Pong);
        assert_eq!(PacketType::from(7), PacketType::Other(7));
        assert_eq!(u32::from(PacketType::Ping), PING);
        assert_eq!(PacketType::Other(7).code(), 7);
    }

    #[test]
    fn test_packet_type_display() {
        assert_eq!(PacketType::Ping.to_string(), "PING");
        assert_eq!(PacketType::Pong.to_string(), "PONG");
        assert_eq!(PacketType::Other(9).to_string(), "UNKNOWN(9)");
    }

    #[test]
    fn test_payload_too_large_is_not_malformed() {
        let err = encode(PacketType::Ping, &[0; PAYLOAD_CAPACITY + 1]).unwrap_err();
        assert!(!err.is_malformed());
    }
}
