//! Inbound stream packets.
//!
//! Every packet starts with a little-endian `u32` type. Video frames carry a
//! fixed 40 byte header followed by the codec bitstream.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

use wavry_xr::{TimeSync, TrackingFrameIndex};

pub const PACKET_TYPE_TIME_SYNC: u32 = 7;
pub const PACKET_TYPE_VIDEO_FRAME: u32 = 9;

pub const VIDEO_FRAME_HEADER_SIZE: usize = 40;
pub const TIME_SYNC_SIZE: usize = 32;

/// Time sync modes.
pub const TIME_SYNC_PING: u32 = 0;
pub const TIME_SYNC_REPLY: u32 = 1;
pub const TIME_SYNC_RESULT: u32 = 2;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("packet too short: {0} bytes, minimum {1}")]
    TooShort(usize, usize),

    #[error("unknown packet type: {0}")]
    UnknownType(u32),
}

/// Video frame header (40 bytes).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct VideoFrameHeader {
    /// Incremented by one per video packet, gaps mean loss.
    pub packet_counter: u32,
    pub tracking_frame_index: TrackingFrameIndex,
    pub video_frame_index: u64,
    pub sent_time_us: u64,
    pub frame_byte_size: u32,
    pub flags: u32,
}

impl VideoFrameHeader {
    pub fn encode(&self, payload: &[u8]) -> Bytes {
        let mut buf = BytesMut::with_capacity(VIDEO_FRAME_HEADER_SIZE + payload.len());
        buf.put_u32_le(PACKET_TYPE_VIDEO_FRAME);
        buf.put_u32_le(self.packet_counter);
        buf.put_u64_le(self.tracking_frame_index);
        buf.put_u64_le(self.video_frame_index);
        buf.put_u64_le(self.sent_time_us);
        buf.put_u32_le(self.frame_byte_size);
        buf.put_u32_le(self.flags);
        buf.put_slice(payload);
        buf.freeze()
    }

    /// Decodes the header after the type word, which the caller already consumed.
    fn decode_body(mut buf: &[u8]) -> Self {
        Self {
            packet_counter: buf.get_u32_le(),
            tracking_frame_index: buf.get_u64_le(),
            video_frame_index: buf.get_u64_le(),
            sent_time_us: buf.get_u64_le(),
            frame_byte_size: buf.get_u32_le(),
            flags: buf.get_u32_le(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundPacket<'a> {
    VideoFrame {
        header: VideoFrameHeader,
        payload: &'a [u8],
    },
    TimeSync(TimeSync),
}

pub fn parse_packet(packet: &[u8]) -> Result<InboundPacket<'_>, ProtocolError> {
    if packet.len() < 4 {
        return Err(ProtocolError::TooShort(packet.len(), 4));
    }
    let mut buf = packet;
    match buf.get_u32_le() {
        PACKET_TYPE_VIDEO_FRAME => {
            if packet.len() < VIDEO_FRAME_HEADER_SIZE {
                return Err(ProtocolError::TooShort(
                    packet.len(),
                    VIDEO_FRAME_HEADER_SIZE,
                ));
            }
            Ok(InboundPacket::VideoFrame {
                header: VideoFrameHeader::decode_body(buf),
                payload: &packet[VIDEO_FRAME_HEADER_SIZE..],
            })
        }
        PACKET_TYPE_TIME_SYNC => {
            if packet.len() < TIME_SYNC_SIZE {
                return Err(ProtocolError::TooShort(packet.len(), TIME_SYNC_SIZE));
            }
            Ok(InboundPacket::TimeSync(TimeSync {
                mode: buf.get_u32_le(),
                sequence: buf.get_u64_le(),
                server_time_us: buf.get_u64_le(),
                client_time_us: buf.get_u64_le(),
            }))
        }
        other => Err(ProtocolError::UnknownType(other)),
    }
}

pub fn encode_time_sync(sync: &TimeSync) -> Bytes {
    let mut buf = BytesMut::with_capacity(TIME_SYNC_SIZE);
    buf.put_u32_le(PACKET_TYPE_TIME_SYNC);
    buf.put_u32_le(sync.mode);
    buf.put_u64_le(sync.sequence);
    buf.put_u64_le(sync.server_time_us);
    buf.put_u64_le(sync.client_time_us);
    buf.freeze()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_video_frame_layout() {
        let header = VideoFrameHeader {
            packet_counter: 3,
            tracking_frame_index: 0x0102_0304_0506_0708,
            video_frame_index: 11,
            sent_time_us: 99,
            frame_byte_size: 4,
            flags: 0,
        };
        let packet = header.encode(&[0, 0, 1, 0x65]);
        assert_eq!(packet.len(), VIDEO_FRAME_HEADER_SIZE + 4);
        assert_eq!(&packet[0..4], &9u32.to_le_bytes());
        assert_eq!(&packet[8..16], &0x0102_0304_0506_0708u64.to_le_bytes());

        match parse_packet(&packet).unwrap() {
            InboundPacket::VideoFrame { header: parsed, payload } => {
                assert_eq!(parsed, header);
                assert_eq!(payload, &[0, 0, 1, 0x65]);
            }
            other => panic!("unexpected packet {other:?}"),
        }
    }

    #[test]
    fn test_time_sync_parse() {
        let sync = TimeSync {
            mode: TIME_SYNC_RESULT,
            sequence: 5,
            server_time_us: 1_000,
            client_time_us: 2_000,
        };
        let packet = encode_time_sync(&sync);
        assert_eq!(packet.len(), TIME_SYNC_SIZE);
        assert_eq!(parse_packet(&packet), Ok(InboundPacket::TimeSync(sync)));
    }

    #[test]
    fn test_rejects_short_and_unknown() {
        assert_eq!(parse_packet(&[9, 0]), Err(ProtocolError::TooShort(2, 4)));
        assert_eq!(
            parse_packet(&[9, 0, 0, 0, 1]),
            Err(ProtocolError::TooShort(5, VIDEO_FRAME_HEADER_SIZE))
        );
        assert_eq!(
            parse_packet(&[42, 0, 0, 0]),
            Err(ProtocolError::UnknownType(42))
        );
    }
}
