//! Wire framing for events and acknowledgements on local stream sockets.
//!
//! Both directions use the same event frame: a little-endian `u32` header
//! whose high 8 bits carry the protocol version (always 1) and whose low
//! 24 bits carry the total frame size including the header, followed by
//! the event payload. Acknowledgements are fixed 20-byte frames carrying
//! the event id.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use snafu::Snafu;
use tokio_util::codec::{Decoder, Encoder};
use tracing::warn;

use crate::event::EventId;

/// Protocol version carried in the frame header.
pub const FRAME_VERSION: u32 = 1;

/// Default cap on a frame this peer is willing to buffer.
pub const MAX_FRAME_SIZE: usize = 256 * 1024;

const HEADER_SIZE: usize = 4;
const ACK_SIZE: usize = 20;

#[derive(Debug, Snafu)]
pub enum FrameError {
    #[snafu(display("frame version {version} is not supported"))]
    BadVersion { version: u32 },

    #[snafu(display("frame size {size} is out of range"))]
    BadSize { size: usize },

    #[snafu(display("frame I/O error: {source}"))]
    Io { source: std::io::Error },
}

impl From<std::io::Error> for FrameError {
    fn from(source: std::io::Error) -> Self {
        FrameError::Io { source }
    }
}

/// Codec for the event frame.
///
/// Frames larger than the configured maximum are discarded in place: the
/// decoder consumes and drops `size - 4` bytes, logs once per frame, and
/// keeps the stream usable. A bad version is unrecoverable and errors the
/// stream.
#[derive(Debug)]
pub struct FrameCodec {
    max_frame_size: usize,
    discard_remaining: usize,
    discarded_frame_size: usize,
}

impl FrameCodec {
    pub fn new(max_frame_size: usize) -> FrameCodec {
        FrameCodec {
            max_frame_size,
            discard_remaining: 0,
            discarded_frame_size: 0,
        }
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        FrameCodec::new(MAX_FRAME_SIZE)
    }
}

impl Decoder for FrameCodec {
    type Item = Bytes;
    type Error = FrameError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            if self.discard_remaining > 0 {
                let take = self.discard_remaining.min(src.len());
                src.advance(take);
                self.discard_remaining -= take;
                if self.discard_remaining > 0 {
                    src.reserve(self.discard_remaining.min(self.max_frame_size));
                    return Ok(None);
                }
                warn!(
                    frame_size = self.discarded_frame_size,
                    max_frame_size = self.max_frame_size,
                    "Discarded frame larger than the read buffer."
                );
                self.discarded_frame_size = 0;
            }

            if src.len() < HEADER_SIZE {
                return Ok(None);
            }

            let header = u32::from_le_bytes([src[0], src[1], src[2], src[3]]);
            let version = header >> 24;
            let size = (header & 0x00FF_FFFF) as usize;

            if version != FRAME_VERSION {
                return Err(FrameError::BadVersion { version });
            }
            if size <= HEADER_SIZE {
                return Err(FrameError::BadSize { size });
            }

            if size > self.max_frame_size {
                src.advance(HEADER_SIZE);
                self.discard_remaining = size - HEADER_SIZE;
                self.discarded_frame_size = size;
                continue;
            }

            if src.len() < size {
                src.reserve(size - src.len());
                return Ok(None);
            }

            src.advance(HEADER_SIZE);
            return Ok(Some(src.split_to(size - HEADER_SIZE).freeze()));
        }
    }
}

impl Encoder<Bytes> for FrameCodec {
    type Error = FrameError;

    fn encode(&mut self, payload: Bytes, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let size = payload.len() + HEADER_SIZE;
        if size > 0x00FF_FFFF {
            return Err(FrameError::BadSize { size });
        }
        dst.reserve(size);
        dst.put_u32_le((FRAME_VERSION << 24) | size as u32);
        dst.put_slice(&payload);
        Ok(())
    }
}

/// Codec for the 20-byte acknowledgement frame:
/// `sec: u64 | msec: u32 | serial: u64`, little-endian.
#[derive(Debug, Default)]
pub struct AckCodec;

impl Decoder for AckCodec {
    type Item = EventId;
    type Error = FrameError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < ACK_SIZE {
            return Ok(None);
        }
        let frame = src.split_to(ACK_SIZE);
        let sec = u64::from_le_bytes(frame[0..8].try_into().expect("frame is 20 bytes"));
        let msec = u32::from_le_bytes(frame[8..12].try_into().expect("frame is 20 bytes"));
        let serial = u64::from_le_bytes(frame[12..20].try_into().expect("frame is 20 bytes"));
        Ok(Some(EventId::new(sec, msec, serial)))
    }
}

impl Encoder<EventId> for AckCodec {
    type Error = FrameError;

    fn encode(&mut self, id: EventId, dst: &mut BytesMut) -> Result<(), Self::Error> {
        dst.reserve(ACK_SIZE);
        dst.put_u64_le(id.sec);
        dst.put_u32_le(id.msec);
        dst.put_u64_le(id.serial);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(payload: &[u8]) -> BytesMut {
        let mut codec = FrameCodec::default();
        let mut buf = BytesMut::new();
        codec.encode(Bytes::copy_from_slice(payload), &mut buf).unwrap();
        buf
    }

    #[test]
    fn round_trip() {
        let mut buf = frame(b"hello event");
        let mut codec = FrameCodec::default();
        assert_eq!(codec.decode(&mut buf).unwrap().unwrap(), "hello event");
        assert_eq!(codec.decode(&mut buf).unwrap(), None);
    }

    #[test]
    fn decode_partial_frame() {
        let full = frame(b"partial");
        let mut codec = FrameCodec::default();

        let mut buf = BytesMut::from(&full[..5]);
        assert_eq!(codec.decode(&mut buf).unwrap(), None);
        buf.extend_from_slice(&full[5..]);
        assert_eq!(codec.decode(&mut buf).unwrap().unwrap(), "partial");
    }

    #[test]
    fn decode_two_frames() {
        let mut buf = frame(b"one");
        buf.extend_from_slice(&frame(b"two"));
        let mut codec = FrameCodec::default();
        assert_eq!(codec.decode(&mut buf).unwrap().unwrap(), "one");
        assert_eq!(codec.decode(&mut buf).unwrap().unwrap(), "two");
        assert_eq!(codec.decode(&mut buf).unwrap(), None);
    }

    #[test]
    fn bad_version_errors() {
        let mut buf = BytesMut::new();
        buf.put_u32_le((2 << 24) | 10);
        buf.put_slice(&[0u8; 6]);
        let mut codec = FrameCodec::default();
        assert!(matches!(
            codec.decode(&mut buf),
            Err(FrameError::BadVersion { version: 2 })
        ));
    }

    #[test]
    fn undersized_frame_errors() {
        let mut buf = BytesMut::new();
        buf.put_u32_le((1 << 24) | 4);
        let mut codec = FrameCodec::default();
        assert!(matches!(codec.decode(&mut buf), Err(FrameError::BadSize { size: 4 })));
    }

    #[test]
    fn oversized_frame_is_discarded_and_stream_continues() {
        let mut codec = FrameCodec::new(64);

        let big = vec![b'x'; 100];
        let mut buf = frame(&big);
        buf.extend_from_slice(&frame(b"after"));

        // The oversized frame is consumed and dropped, the next frame
        // decodes normally.
        assert_eq!(codec.decode(&mut buf).unwrap().unwrap(), "after");
    }

    #[test]
    fn oversized_frame_discard_spans_reads() {
        let mut codec = FrameCodec::new(64);
        let big = vec![b'y'; 200];
        let full = frame(&big);

        let mut buf = BytesMut::from(&full[..50]);
        assert_eq!(codec.decode(&mut buf).unwrap(), None);
        buf.extend_from_slice(&full[50..]);
        buf.extend_from_slice(&frame(b"tail"));
        assert_eq!(codec.decode(&mut buf).unwrap().unwrap(), "tail");
    }

    #[test]
    fn ack_round_trip() {
        let mut codec = AckCodec;
        let mut buf = BytesMut::new();
        let id = EventId::new(1521757638, 392, 262332);
        codec.encode(id, &mut buf).unwrap();
        assert_eq!(buf.len(), 20);
        assert_eq!(codec.decode(&mut buf).unwrap().unwrap(), id);
        assert_eq!(codec.decode(&mut buf).unwrap(), None);
    }

    #[test]
    fn ack_partial() {
        let mut codec = AckCodec;
        let mut buf = BytesMut::from(&[0u8; 19][..]);
        assert_eq!(codec.decode(&mut buf).unwrap(), None);
        buf.put_u8(0);
        assert_eq!(codec.decode(&mut buf).unwrap().unwrap(), EventId::default());
    }
}
