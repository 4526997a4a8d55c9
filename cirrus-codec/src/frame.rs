//! Length-prefixed multiplexing frames.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use cirrus_core::{CodecError, Reason, TransportError};

/// Default maximum frame payload size (16 KB).
pub const DEFAULT_MAX_FRAME_SIZE: usize = 16 * 1024;

/// Size of the fixed frame header.
pub const HEADER_LEN: usize = 10;

/// Largest control frame payload (`GOAWAY`).
pub const CONTROL_PAYLOAD_MAX: usize = 8;

/// Largest payload the length prefix can describe.
const MAX_WIRE_LEN: usize = u32::MAX as usize;

/// Flag marking the last frame a side sends on a stream.
pub const FLAG_END_STREAM: u8 = 0x1;

const TYPE_DATA: u8 = 0x0;
const TYPE_HEADERS: u8 = 0x1;
const TYPE_RESET: u8 = 0x3;
const TYPE_GOAWAY: u8 = 0x7;
const TYPE_WINDOW_UPDATE: u8 = 0x8;

/// A single frame on a multiplexed connection.
///
/// Stream id `0` addresses the connection itself and is only valid for
/// [`Frame::WindowUpdate`] and [`Frame::GoAway`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// Opaque header block opening (or answering) a stream.
    Headers {
        stream_id: u32,
        payload: Bytes,
        end_stream: bool,
    },
    /// Body bytes; counted against flow-control windows.
    Data {
        stream_id: u32,
        payload: Bytes,
        end_stream: bool,
    },
    /// Grants the peer `increment` more bytes of DATA.
    WindowUpdate { stream_id: u32, increment: u32 },
    /// Aborts one stream.
    Reset { stream_id: u32, reason: Reason },
    /// The sender will not process streams above `last_stream_id`.
    GoAway { last_stream_id: u32, reason: Reason },
}

impl Frame {
    /// Stream this frame is addressed to (`0` for connection frames).
    #[must_use]
    pub fn stream_id(&self) -> u32 {
        match self {
            Self::Headers { stream_id, .. }
            | Self::Data { stream_id, .. }
            | Self::WindowUpdate { stream_id, .. }
            | Self::Reset { stream_id, .. } => *stream_id,
            Self::GoAway { .. } => 0,
        }
    }

    #[must_use]
    pub fn is_end_stream(&self) -> bool {
        match self {
            Self::Headers { end_stream, .. } | Self::Data { end_stream, .. } => *end_stream,
            _ => false,
        }
    }

    /// Bytes of this frame counted by flow control.
    #[must_use]
    pub fn flow_controlled_len(&self) -> usize {
        match self {
            Self::Data { payload, .. } => payload.len(),
            _ => 0,
        }
    }

    fn kind(&self) -> u8 {
        match self {
            Self::Headers { .. } => TYPE_HEADERS,
            Self::Data { .. } => TYPE_DATA,
            Self::WindowUpdate { .. } => TYPE_WINDOW_UPDATE,
            Self::Reset { .. } => TYPE_RESET,
            Self::GoAway { .. } => TYPE_GOAWAY,
        }
    }

    fn payload_len(&self) -> usize {
        match self {
            Self::Headers { payload, .. } | Self::Data { payload, .. } => payload.len(),
            Self::WindowUpdate { .. } | Self::Reset { .. } => 4,
            Self::GoAway { .. } => 8,
        }
    }
}

/// Encoder/decoder for [`Frame`]s.
///
/// ## Frame Format
///
/// ```text
/// +---------------+----------+-----------+------------------+------------------+
/// | Length (4 LE) | Type (1) | Flags (1) | Stream id (4 LE) | Payload (Length) |
/// +---------------+----------+-----------+------------------+------------------+
/// ```
///
/// `max_frame_size` bounds `HEADERS` and `DATA` payloads. Control frames have
/// fixed payloads of at most [`CONTROL_PAYLOAD_MAX`] bytes and are never
/// refused for size.
///
/// The codec implements [`Decoder`] and [`Encoder<Frame>`] so it can drive
/// `FramedRead`/`FramedWrite` directly.
///
/// ## Example
///
/// ```rust
/// use bytes::{Bytes, BytesMut};
/// use cirrus_codec::{Frame, FrameCodec};
///
/// let codec = FrameCodec::new();
/// let mut buf = BytesMut::new();
///
/// let frame = Frame::Data {
///     stream_id: 1,
///     payload: Bytes::from_static(b"hello"),
///     end_stream: true,
/// };
/// codec.encode_frame(&frame, &mut buf).unwrap();
///
/// assert_eq!(codec.decode_frame(&mut buf).unwrap(), Some(frame));
/// ```
#[derive(Debug, Clone, Copy)]
pub struct FrameCodec {
    max_frame_size: usize,
}

impl FrameCodec {
    /// Create a new codec with default settings.
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self {
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
        }
    }

    /// Create a codec with a custom maximum payload size.
    ///
    /// The size is capped at what the 4-byte length prefix can carry.
    #[inline]
    #[must_use]
    pub fn with_max_frame_size(max_frame_size: usize) -> Self {
        Self {
            max_frame_size: max_frame_size.min(MAX_WIRE_LEN),
        }
    }

    #[inline]
    #[must_use]
    pub fn max_frame_size(&self) -> usize {
        self.max_frame_size
    }

    /// Payload limit for a frame of type `kind`.
    fn limit_for(&self, kind: u8) -> usize {
        match kind {
            TYPE_WINDOW_UPDATE | TYPE_RESET | TYPE_GOAWAY => CONTROL_PAYLOAD_MAX,
            _ => self.max_frame_size,
        }
    }

    /// Append `frame` to `dst`.
    pub fn encode_frame(&self, frame: &Frame, dst: &mut BytesMut) -> Result<(), CodecError> {
        let len = frame.payload_len();
        let max = self.limit_for(frame.kind());
        if len > max {
            return Err(CodecError::FrameTooLarge { size: len, max });
        }
        let wire_len = u32::try_from(len).map_err(|_| CodecError::FrameTooLarge {
            size: len,
            max: MAX_WIRE_LEN,
        })?;

        let flags = if frame.is_end_stream() {
            FLAG_END_STREAM
        } else {
            0
        };

        dst.reserve(HEADER_LEN + len);
        dst.put_u32_le(wire_len);
        dst.put_u8(frame.kind());
        dst.put_u8(flags);
        dst.put_u32_le(frame.stream_id());

        match frame {
            Frame::Headers { payload, .. } | Frame::Data { payload, .. } => {
                dst.put_slice(payload);
            }
            Frame::WindowUpdate { increment, .. } => dst.put_u32_le(*increment),
            Frame::Reset { reason, .. } => dst.put_u32_le(reason.code()),
            Frame::GoAway {
                last_stream_id,
                reason,
            } => {
                dst.put_u32_le(*last_stream_id);
                dst.put_u32_le(reason.code());
            }
        }

        Ok(())
    }

    /// Take one complete frame off the front of `src`.
    ///
    /// Returns `Ok(None)` if more data is needed. A frame that fails
    /// validation is still consumed.
    pub fn decode_frame(&self, src: &mut BytesMut) -> Result<Option<Frame>, CodecError> {
        if src.len() < HEADER_LEN {
            return Ok(None);
        }

        let len = u32::from_le_bytes([src[0], src[1], src[2], src[3]]) as usize;
        let max = self.limit_for(src[4]);
        if len > max {
            return Err(CodecError::FrameTooLarge { size: len, max });
        }

        let total_len = HEADER_LEN + len;
        if src.len() < total_len {
            src.reserve(total_len - src.len());
            return Ok(None);
        }

        src.advance(4);
        let kind = src.get_u8();
        let flags = src.get_u8();
        let stream_id = src.get_u32_le();
        let mut payload = src.split_to(len).freeze();
        let end_stream = flags & FLAG_END_STREAM != 0;

        let frame = match kind {
            TYPE_HEADERS | TYPE_DATA => {
                if stream_id == 0 {
                    return Err(CodecError::InvalidFrame(
                        "stream frame on stream 0".to_string(),
                    ));
                }
                if kind == TYPE_HEADERS {
                    Frame::Headers {
                        stream_id,
                        payload,
                        end_stream,
                    }
                } else {
                    Frame::Data {
                        stream_id,
                        payload,
                        end_stream,
                    }
                }
            }
            TYPE_WINDOW_UPDATE => {
                expect_len("WINDOW_UPDATE", &payload, 4)?;
                let increment = payload.get_u32_le();
                if increment == 0 {
                    return Err(CodecError::InvalidFrame(
                        "zero window increment".to_string(),
                    ));
                }
                Frame::WindowUpdate {
                    stream_id,
                    increment,
                }
            }
            TYPE_RESET => {
                expect_len("RST_STREAM", &payload, 4)?;
                if stream_id == 0 {
                    return Err(CodecError::InvalidFrame(
                        "RST_STREAM on stream 0".to_string(),
                    ));
                }
                Frame::Reset {
                    stream_id,
                    reason: Reason::from(payload.get_u32_le()),
                }
            }
            TYPE_GOAWAY => {
                expect_len("GOAWAY", &payload, 8)?;
                let last_stream_id = payload.get_u32_le();
                Frame::GoAway {
                    last_stream_id,
                    reason: Reason::from(payload.get_u32_le()),
                }
            }
            other => return Err(CodecError::UnknownFrameType(other)),
        };

        Ok(Some(frame))
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = TransportError;

    #[inline]
    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        Ok(self.decode_frame(src)?)
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = TransportError;

    #[inline]
    fn encode(&mut self, item: Frame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        Ok(self.encode_frame(&item, dst)?)
    }
}

fn expect_len(kind: &str, payload: &Bytes, len: usize) -> Result<(), CodecError> {
    if payload.len() == len {
        Ok(())
    } else {
        Err(CodecError::InvalidFrame(format!(
            "{kind} payload must be {len} bytes, got {}",
            payload.len()
        )))
    }
}
