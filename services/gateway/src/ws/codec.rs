//! Binary audio frame formats.
//!
//! The binary protocol version is negotiated in the hello exchange:
//!
//! - v1: raw payload, no header.
//! - v2: 16-byte header `version(2) type(2) reserved(4) timestamp(4) size(4)`.
//! - v3: 4-byte header `type(1) reserved(1) size(2)`.
//!
//! All multi-byte fields are big-endian. Connections relayed through the
//! MQTT/UDP gateway additionally prefix every frame with a 16-byte relay
//! header carrying a timestamp at bytes 8..12 and the payload length at
//! bytes 12..16.

use bytes::{BufMut, Bytes, BytesMut};

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum FrameError {
    #[error("frame truncated: needed {needed} bytes, got {got}")]
    Truncated { needed: usize, got: usize },
    #[error("unsupported binary protocol version {0}")]
    UnsupportedVersion(u8),
}

/// One decoded inbound audio frame. Timestamp is zero for formats that do
/// not carry one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioFrame {
    pub timestamp: u32,
    pub payload: Bytes,
}

const V2_HEADER_LEN: usize = 16;
const V3_HEADER_LEN: usize = 4;
const RELAY_HEADER_LEN: usize = 16;

/// Decodes an inbound binary frame according to the negotiated version.
pub fn decode_frame(version: u8, data: Bytes) -> Result<AudioFrame, FrameError> {
    match version {
        1 => Ok(AudioFrame {
            timestamp: 0,
            payload: data,
        }),
        2 => {
            if data.len() < V2_HEADER_LEN {
                return Err(FrameError::Truncated {
                    needed: V2_HEADER_LEN,
                    got: data.len(),
                });
            }
            let timestamp = u32::from_be_bytes([data[8], data[9], data[10], data[11]]);
            let size = u32::from_be_bytes([data[12], data[13], data[14], data[15]]) as usize;
            let available = data.len() - V2_HEADER_LEN;
            if size > available {
                return Err(FrameError::Truncated {
                    needed: V2_HEADER_LEN + size,
                    got: data.len(),
                });
            }
            Ok(AudioFrame {
                timestamp,
                payload: data.slice(V2_HEADER_LEN..V2_HEADER_LEN + size),
            })
        }
        3 => {
            if data.len() < V3_HEADER_LEN {
                return Err(FrameError::Truncated {
                    needed: V3_HEADER_LEN,
                    got: data.len(),
                });
            }
            let size = u16::from_be_bytes([data[2], data[3]]) as usize;
            let available = data.len() - V3_HEADER_LEN;
            if size > available {
                return Err(FrameError::Truncated {
                    needed: V3_HEADER_LEN + size,
                    got: data.len(),
                });
            }
            Ok(AudioFrame {
                timestamp: 0,
                payload: data.slice(V3_HEADER_LEN..V3_HEADER_LEN + size),
            })
        }
        other => Err(FrameError::UnsupportedVersion(other)),
    }
}

/// Encodes an outbound audio frame for the negotiated version. Frame type is
/// 0 (audio) for the headered formats.
pub fn encode_frame(version: u8, timestamp: u32, payload: &[u8]) -> Result<Bytes, FrameError> {
    match version {
        1 => Ok(Bytes::copy_from_slice(payload)),
        2 => {
            let mut buf = BytesMut::with_capacity(V2_HEADER_LEN + payload.len());
            buf.put_u16(2);
            buf.put_u16(0);
            buf.put_u32(0);
            buf.put_u32(timestamp);
            buf.put_u32(payload.len() as u32);
            buf.put_slice(payload);
            Ok(buf.freeze())
        }
        3 => {
            let mut buf = BytesMut::with_capacity(V3_HEADER_LEN + payload.len());
            buf.put_u8(0);
            buf.put_u8(0);
            buf.put_u16(payload.len() as u16);
            buf.put_slice(payload);
            Ok(buf.freeze())
        }
        other => Err(FrameError::UnsupportedVersion(other)),
    }
}

/// Strips the 16-byte relay prefix from a frame that arrived through the
/// MQTT/UDP gateway.
///
/// When the declared payload length does not line up with the frame, the
/// prefix is still stripped as long as bytes remain past it. Frames shorter
/// than the prefix are rejected.
pub fn unwrap_relay_frame(data: Bytes) -> Result<AudioFrame, FrameError> {
    if data.len() < RELAY_HEADER_LEN {
        return Err(FrameError::Truncated {
            needed: RELAY_HEADER_LEN,
            got: data.len(),
        });
    }
    let timestamp = u32::from_be_bytes([data[8], data[9], data[10], data[11]]);
    let declared = u32::from_be_bytes([data[12], data[13], data[14], data[15]]) as usize;
    let available = data.len() - RELAY_HEADER_LEN;
    if declared > 0 && declared <= available {
        return Ok(AudioFrame {
            timestamp,
            payload: data.slice(RELAY_HEADER_LEN..RELAY_HEADER_LEN + declared),
        });
    }
    if available > 0 {
        tracing::debug!(
            declared,
            available,
            "relay frame length mismatch, stripping prefix"
        );
        return Ok(AudioFrame {
            timestamp,
            payload: data.slice(RELAY_HEADER_LEN..),
        });
    }
    Err(FrameError::Truncated {
        needed: RELAY_HEADER_LEN + 1,
        got: data.len(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn v1_is_the_raw_payload() {
        let frame = decode_frame(1, Bytes::from_static(b"opus!")).unwrap();
        assert_eq!(frame.timestamp, 0);
        assert_eq!(&frame.payload[..], b"opus!");
    }

    #[test]
    fn v2_round_trip_preserves_timestamp_and_payload() {
        let encoded = encode_frame(2, 0xAABBCCDD, b"payload").unwrap();
        assert_eq!(encoded.len(), 16 + 7);
        assert_eq!(&encoded[0..2], &[0, 2], "version field");

        let frame = decode_frame(2, encoded).unwrap();
        assert_eq!(frame.timestamp, 0xAABBCCDD);
        assert_eq!(&frame.payload[..], b"payload");
    }

    #[test]
    fn v2_truncated_header_is_rejected() {
        let err = decode_frame(2, Bytes::from_static(&[0u8; 10])).unwrap_err();
        assert_eq!(err, FrameError::Truncated { needed: 16, got: 10 });
    }

    #[test]
    fn v2_size_beyond_frame_is_rejected() {
        let mut buf = BytesMut::new();
        buf.put_u16(2);
        buf.put_u16(0);
        buf.put_u32(0);
        buf.put_u32(7);
        buf.put_u32(100); // declares 100 payload bytes
        buf.put_slice(b"short");
        let err = decode_frame(2, buf.freeze()).unwrap_err();
        assert!(matches!(err, FrameError::Truncated { .. }));
    }

    #[test]
    fn v3_round_trip() {
        let encoded = encode_frame(3, 0, b"abc").unwrap();
        assert_eq!(encoded.len(), 4 + 3);
        let frame = decode_frame(3, encoded).unwrap();
        assert_eq!(frame.timestamp, 0);
        assert_eq!(&frame.payload[..], b"abc");
    }

    #[test]
    fn unknown_version_is_rejected() {
        assert_eq!(
            decode_frame(9, Bytes::from_static(b"x")).unwrap_err(),
            FrameError::UnsupportedVersion(9)
        );
        assert_eq!(
            encode_frame(0, 0, b"x").unwrap_err(),
            FrameError::UnsupportedVersion(0)
        );
    }

    fn relay_frame(timestamp: u32, declared: u32, payload: &[u8]) -> Bytes {
        let mut buf = BytesMut::new();
        buf.put_slice(&[0u8; 8]);
        buf.put_u32(timestamp);
        buf.put_u32(declared);
        buf.put_slice(payload);
        buf.freeze()
    }

    #[test]
    fn relay_prefix_yields_timestamp_and_payload() {
        let frame = unwrap_relay_frame(relay_frame(42, 4, b"data")).unwrap();
        assert_eq!(frame.timestamp, 42);
        assert_eq!(&frame.payload[..], b"data");
    }

    #[test]
    fn relay_length_mismatch_falls_back_to_prefix_strip() {
        // Declared length larger than what's actually there.
        let frame = unwrap_relay_frame(relay_frame(7, 999, b"data")).unwrap();
        assert_eq!(frame.timestamp, 7);
        assert_eq!(&frame.payload[..], b"data");
    }

    #[test]
    fn relay_frame_without_payload_is_rejected() {
        assert!(unwrap_relay_frame(relay_frame(7, 0, b"")).is_err());
        assert!(unwrap_relay_frame(Bytes::from_static(&[0u8; 10])).is_err());
    }
}
