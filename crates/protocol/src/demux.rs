//! Demuxer for the scrcpy video socket.
//!
//! The agent sends one metadata header, then an endless run of frames.
//! Everything is big-endian:
//! ```text
//! metadata (76 bytes)
//! [0..64]   device name, UTF-8, NUL padded
//! [64..68]  codec id (u32)
//! [68..72]  width (u32)
//! [72..76]  height (u32)
//!
//! frame (12 byte header + payload)
//! [0..8]    pts (u64, opaque here)
//! [8..12]   payload_length (u32)
//! [12..]    payload (one encoded access unit)
//! ```

use bytes::{Buf, Bytes, BytesMut};

use crate::coords::Resolution;

pub const DEVICE_NAME_FIELD_SIZE: usize = 64;
pub const METADATA_SIZE: usize = DEVICE_NAME_FIELD_SIZE + 12;
pub const FRAME_HEADER_SIZE: usize = 12;
/// Payload lengths above this are treated as a desynchronized stream.
pub const MAX_PAYLOAD_LENGTH: u32 = 10_000_000;

/// Initial capacity for a connection's receive buffer.
const INITIAL_BUFFER_CAPACITY: usize = 256 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamMetadata {
    pub device_name: String,
    pub codec_id: u32,
    pub width: u32,
    pub height: u32,
}

impl StreamMetadata {
    /// Parse the 76-byte metadata header.
    pub fn parse(buf: &[u8]) -> Result<Self, DemuxError> {
        if buf.len() < METADATA_SIZE {
            return Err(DemuxError::TooShort(buf.len()));
        }
        Ok(Self::decode(buf))
    }

    /// `buf` holds at least `METADATA_SIZE` bytes.
    fn decode(buf: &[u8]) -> Self {
        let name_field = &buf[..DEVICE_NAME_FIELD_SIZE];
        let name_len = name_field
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(DEVICE_NAME_FIELD_SIZE);
        let device_name = String::from_utf8_lossy(&name_field[..name_len])
            .trim()
            .to_string();

        let mut rest = &buf[DEVICE_NAME_FIELD_SIZE..METADATA_SIZE];
        let codec_id = rest.get_u32();
        let width = rest.get_u32();
        let height = rest.get_u32();

        Self {
            device_name,
            codec_id,
            width,
            height,
        }
    }

    pub fn resolution(&self) -> Resolution {
        Resolution::new(self.width, self.height)
    }

    /// Codec id rendered as its four-character code ("h264", "h265", "av01").
    pub fn codec_name(&self) -> String {
        self.codec_id
            .to_be_bytes()
            .iter()
            .map(|&b| if b.is_ascii_graphic() { b as char } else { '?' })
            .collect()
    }

    /// Serialize to the wire layout. Names longer than the field are truncated.
    pub fn serialize(&self) -> [u8; METADATA_SIZE] {
        let mut buf = [0u8; METADATA_SIZE];
        let name = self.device_name.as_bytes();
        let len = name.len().min(DEVICE_NAME_FIELD_SIZE);
        buf[..len].copy_from_slice(&name[..len]);
        buf[64..68].copy_from_slice(&self.codec_id.to_be_bytes());
        buf[68..72].copy_from_slice(&self.width.to_be_bytes());
        buf[72..76].copy_from_slice(&self.height.to_be_bytes());
        buf
    }
}

/// One demuxed encoded access unit. Cloning shares the payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VideoUnit {
    pub payload: Bytes,
}

impl VideoUnit {
    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }
}

/// Encode a frame (header + payload) the way the agent does.
pub fn encode_frame(pts: u64, payload: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(FRAME_HEADER_SIZE + payload.len());
    buf.extend_from_slice(&pts.to_be_bytes());
    buf.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    buf.extend_from_slice(payload);
    buf
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DemuxState {
    AwaitingMetadata,
    StreamingFrames,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DemuxEvent {
    Metadata(StreamMetadata),
    Unit(VideoUnit),
    /// A frame header declared an impossible length; `discarded` buffered
    /// bytes were dropped and the demuxer waits for fresh data to realign.
    Corruption { declared_length: u32, discarded: usize },
}

/// Incremental parser for one agent connection.
///
/// Feed bytes with [`FrameDemuxer::extend`] (or read straight into
/// [`FrameDemuxer::buffer_mut`]) and drain events with
/// [`FrameDemuxer::next_event`] until it returns `None`.
pub struct FrameDemuxer {
    buf: BytesMut,
    state: DemuxState,
}

impl FrameDemuxer {
    pub fn new() -> Self {
        Self {
            buf: BytesMut::with_capacity(INITIAL_BUFFER_CAPACITY),
            state: DemuxState::AwaitingMetadata,
        }
    }

    pub fn state(&self) -> DemuxState {
        self.state
    }

    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    pub fn extend(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Direct access for `AsyncReadExt::read_buf`.
    pub fn buffer_mut(&mut self) -> &mut BytesMut {
        &mut self.buf
    }

    /// Parse the next complete item out of the buffer, if any.
    pub fn next_event(&mut self) -> Option<DemuxEvent> {
        match self.state {
            DemuxState::AwaitingMetadata => {
                if self.buf.len() < METADATA_SIZE {
                    return None;
                }
                let header = self.buf.split_to(METADATA_SIZE);
                let meta = StreamMetadata::decode(&header);
                self.state = DemuxState::StreamingFrames;
                Some(DemuxEvent::Metadata(meta))
            }
            DemuxState::StreamingFrames => {
                if self.buf.len() < FRAME_HEADER_SIZE {
                    return None;
                }
                let length = u32::from_be_bytes([self.buf[8], self.buf[9], self.buf[10], self.buf[11]]);
                if length > MAX_PAYLOAD_LENGTH {
                    let discarded = self.buf.len();
                    self.buf.clear();
                    return Some(DemuxEvent::Corruption {
                        declared_length: length,
                        discarded,
                    });
                }
                let total = FRAME_HEADER_SIZE + length as usize;
                if self.buf.len() < total {
                    // Make room for the rest of this frame in one go.
                    self.buf.reserve(total - self.buf.len());
                    return None;
                }
                self.buf.advance(FRAME_HEADER_SIZE);
                let payload = self.buf.split_to(length as usize).freeze();
                Some(DemuxEvent::Unit(VideoUnit { payload }))
            }
        }
    }

    /// Check that the connection may close now without losing the header.
    pub fn finish(&self) -> Result<(), DemuxError> {
        match self.state {
            DemuxState::AwaitingMetadata => Err(DemuxError::IncompleteMetadata {
                received: self.buf.len(),
            }),
            DemuxState::StreamingFrames => Ok(()),
        }
    }
}

impl Default for FrameDemuxer {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DemuxError {
    #[error("buffer too short: {0} bytes (need at least {METADATA_SIZE})")]
    TooShort(usize),
    #[error("connection closed after {received} of {METADATA_SIZE} metadata bytes")]
    IncompleteMetadata { received: usize },
    #[error("video socket read failed: {0}")]
    Io(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn metadata(width: u32, height: u32) -> StreamMetadata {
        StreamMetadata {
            device_name: "Pixel 7".to_string(),
            codec_id: u32::from_be_bytes(*b"h264"),
            width,
            height,
        }
    }

    fn drain(demuxer: &mut FrameDemuxer) -> Vec<DemuxEvent> {
        std::iter::from_fn(|| demuxer.next_event()).collect()
    }

    fn sample_stream() -> (Vec<u8>, Vec<Vec<u8>>) {
        let payloads: Vec<Vec<u8>> = vec![
            vec![0, 0, 0, 1, 0x67, 0x42],
            (0..5000u32).map(|i| (i % 251) as u8).collect(),
            vec![0xAB],
            Vec::new(),
            vec![0, 0, 0, 1, 0x65, 0x88, 0x84, 0x00],
        ];
        let mut stream = metadata(888, 1920).serialize().to_vec();
        for (i, p) in payloads.iter().enumerate() {
            stream.extend(encode_frame(i as u64 * 16_666, p));
        }
        (stream, payloads)
    }

    fn units(events: &[DemuxEvent]) -> Vec<Vec<u8>> {
        events
            .iter()
            .filter_map(|e| match e {
                DemuxEvent::Unit(u) => Some(u.payload.to_vec()),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn metadata_size_is_76() {
        assert_eq!(METADATA_SIZE, 76);
    }

    #[test]
    fn parse_metadata_trims_name() {
        let buf = metadata(888, 1920).serialize();
        let parsed = StreamMetadata::parse(&buf).unwrap();
        assert_eq!(parsed.device_name, "Pixel 7");
        assert_eq!(parsed.codec_name(), "h264");
        assert_eq!(parsed.resolution(), Resolution::new(888, 1920));
    }

    #[test]
    fn parse_metadata_too_short() {
        match StreamMetadata::parse(&[0u8; 40]) {
            Err(DemuxError::TooShort(40)) => {}
            other => panic!("expected TooShort(40), got {:?}", other),
        }
    }

    #[test]
    fn metadata_published_once_then_frames() {
        let (stream, payloads) = sample_stream();
        let mut demuxer = FrameDemuxer::new();
        demuxer.extend(&stream);
        let events = drain(&mut demuxer);

        let metas: Vec<_> = events
            .iter()
            .filter(|e| matches!(e, DemuxEvent::Metadata(_)))
            .collect();
        assert_eq!(metas.len(), 1);
        assert_eq!(events[0], DemuxEvent::Metadata(metadata(888, 1920)));
        assert_eq!(units(&events), payloads);
        assert_eq!(demuxer.buffered(), 0);
        assert_eq!(demuxer.state(), DemuxState::StreamingFrames);
    }

    #[test]
    fn chunking_does_not_change_output() {
        let (stream, _) = sample_stream();

        let mut whole = FrameDemuxer::new();
        whole.extend(&stream);
        let expected = drain(&mut whole);

        for chunk_size in [1, 2, 3, 7, 11, 12, 13, 76, 77, 1000, 4096] {
            let mut demuxer = FrameDemuxer::new();
            let mut events = Vec::new();
            for chunk in stream.chunks(chunk_size) {
                demuxer.extend(chunk);
                events.extend(drain(&mut demuxer));
            }
            assert_eq!(events, expected, "chunk size {chunk_size}");
        }
    }

    #[test]
    fn irregular_chunking_does_not_change_output() {
        let (stream, payloads) = sample_stream();
        let sizes = [5, 71, 1, 12, 300, 2, 9999];
        let mut demuxer = FrameDemuxer::new();
        let mut events = Vec::new();
        let mut offset = 0;
        let mut i = 0;
        while offset < stream.len() {
            let end = (offset + sizes[i % sizes.len()]).min(stream.len());
            demuxer.extend(&stream[offset..end]);
            events.extend(drain(&mut demuxer));
            offset = end;
            i += 1;
        }
        assert_eq!(units(&events), payloads);
    }

    #[test]
    fn partial_frame_waits_for_more() {
        let mut demuxer = FrameDemuxer::new();
        demuxer.extend(&metadata(720, 1280).serialize());
        assert!(matches!(demuxer.next_event(), Some(DemuxEvent::Metadata(_))));

        let frame = encode_frame(0, &[1, 2, 3, 4, 5]);
        demuxer.extend(&frame[..14]);
        assert_eq!(demuxer.next_event(), None);
        assert_eq!(demuxer.buffered(), 14);

        demuxer.extend(&frame[14..]);
        match demuxer.next_event() {
            Some(DemuxEvent::Unit(u)) => assert_eq!(&u.payload[..], &[1, 2, 3, 4, 5]),
            other => panic!("expected unit, got {:?}", other),
        }
    }

    #[test]
    fn oversized_length_discards_buffer() {
        let mut demuxer = FrameDemuxer::new();
        demuxer.extend(&metadata(888, 1920).serialize());
        drain(&mut demuxer);

        let mut bad = Vec::new();
        bad.extend_from_slice(&0u64.to_be_bytes());
        bad.extend_from_slice(&10_000_001u32.to_be_bytes());
        bad.extend_from_slice(&[0xFF; 20]);
        demuxer.extend(&bad);

        assert_eq!(
            demuxer.next_event(),
            Some(DemuxEvent::Corruption {
                declared_length: 10_000_001,
                discarded: 32,
            })
        );
        assert_eq!(demuxer.buffered(), 0);
        assert_eq!(demuxer.state(), DemuxState::StreamingFrames);

        // The next aligned frame goes through.
        demuxer.extend(&encode_frame(1, &[9, 9]));
        match demuxer.next_event() {
            Some(DemuxEvent::Unit(u)) => assert_eq!(&u.payload[..], &[9, 9]),
            other => panic!("expected unit after realignment, got {:?}", other),
        }
    }

    #[test]
    fn max_length_is_accepted() {
        let mut demuxer = FrameDemuxer::new();
        demuxer.extend(&metadata(888, 1920).serialize());
        drain(&mut demuxer);
        let mut header = Vec::new();
        header.extend_from_slice(&0u64.to_be_bytes());
        header.extend_from_slice(&MAX_PAYLOAD_LENGTH.to_be_bytes());
        demuxer.extend(&header);
        // Not corruption, just waiting for the payload.
        assert_eq!(demuxer.next_event(), None);
        assert_eq!(demuxer.buffered(), FRAME_HEADER_SIZE);
    }

    #[test]
    fn finish_before_metadata_is_incomplete() {
        let mut demuxer = FrameDemuxer::new();
        demuxer.extend(&[0u8; 30]);
        assert_eq!(demuxer.next_event(), None);
        match demuxer.finish() {
            Err(DemuxError::IncompleteMetadata { received: 30 }) => {}
            other => panic!("expected IncompleteMetadata, got {:?}", other),
        }
    }

    #[test]
    fn finish_after_metadata_is_ok() {
        let mut demuxer = FrameDemuxer::new();
        demuxer.extend(&metadata(888, 1920).serialize());
        drain(&mut demuxer);
        assert!(demuxer.finish().is_ok());
    }

    #[test]
    fn long_stream_keeps_buffer_bounded() {
        let mut demuxer = FrameDemuxer::new();
        demuxer.extend(&metadata(888, 1920).serialize());
        drain(&mut demuxer);
        let frame = encode_frame(0, &[7u8; 1000]);
        let mut count = 0;
        for _ in 0..10_000 {
            demuxer.extend(&frame);
            count += units(&drain(&mut demuxer)).len();
        }
        assert_eq!(count, 10_000);
        assert_eq!(demuxer.buffered(), 0);
        assert!(demuxer.buffer_mut().capacity() < 4 * INITIAL_BUFFER_CAPACITY);
    }
}
