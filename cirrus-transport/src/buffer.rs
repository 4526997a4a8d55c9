//! Watermark-driven buffering for stream bodies.

use std::collections::VecDeque;

use bytes::Bytes;

use cirrus_codec::Frame;

/// High/low watermark pair in bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Watermarks {
    pub high: usize,
    pub low: usize,
}

impl Watermarks {
    /// `low` is clamped to `high`.
    #[must_use]
    pub fn new(high: usize, low: usize) -> Self {
        Self {
            high,
            low: low.min(high),
        }
    }
}

impl Default for Watermarks {
    fn default() -> Self {
        Self::new(256 * 1024, 64 * 1024)
    }
}

/// Outgoing body buffer for one stream.
///
/// Chunks accumulate until more than `high_water` bytes or `max_chunks`
/// chunks are buffered, at which point [`BufferedWriter::write`] asks for a
/// flush. A flush emits DATA frames bounded by the available send window
/// and the maximum frame size; whatever does not fit stays buffered until
/// the peer grants more window.
#[derive(Debug)]
pub struct BufferedWriter {
    chunks: VecDeque<Bytes>,
    buffered: usize,
    high_water: usize,
    max_chunks: usize,
    finished: bool,
    end_sent: bool,
}

impl BufferedWriter {
    #[must_use]
    pub fn new(high_water: usize, max_chunks: usize) -> Self {
        Self {
            chunks: VecDeque::new(),
            buffered: 0,
            high_water,
            max_chunks: max_chunks.max(1),
            finished: false,
            end_sent: false,
        }
    }

    /// Buffer a chunk. Returns `true` once a flush is due.
    pub fn write(&mut self, chunk: Bytes) -> bool {
        if !chunk.is_empty() {
            self.buffered += chunk.len();
            self.chunks.push_back(chunk);
        }
        self.should_flush()
    }

    #[must_use]
    pub fn should_flush(&self) -> bool {
        self.buffered > self.high_water || self.chunks.len() >= self.max_chunks
    }

    /// Mark the body complete; the next flush that drains the buffer carries
    /// the end-of-stream flag.
    pub fn finish(&mut self) {
        self.finished = true;
    }

    #[must_use]
    pub fn buffered(&self) -> usize {
        self.buffered
    }

    /// Data or the end-of-stream marker still has to go out.
    #[must_use]
    pub fn has_pending(&self) -> bool {
        !self.chunks.is_empty() || (self.finished && !self.end_sent)
    }

    /// The end-of-stream marker has been emitted.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.end_sent
    }

    /// Emit as many DATA frames as `window` allows.
    pub fn flush(&mut self, stream_id: u32, window: usize, max_frame: usize) -> Vec<Frame> {
        let max_frame = max_frame.max(1);
        let mut frames = Vec::new();
        let mut budget = window;

        while budget > 0 {
            let Some(front_len) = self.chunks.front().map(Bytes::len) else {
                break;
            };
            let take = front_len.min(budget).min(max_frame);
            let payload = if take == front_len {
                self.chunks.pop_front().unwrap_or_default()
            } else {
                match self.chunks.front_mut() {
                    Some(front) => front.split_to(take),
                    None => break,
                }
            };
            budget -= take;
            self.buffered -= take;
            frames.push(Frame::Data {
                stream_id,
                payload,
                end_stream: false,
            });
        }

        if self.finished && self.chunks.is_empty() && !self.end_sent {
            self.end_sent = true;
            match frames.last_mut() {
                Some(Frame::Data { end_stream, .. }) => *end_stream = true,
                _ => frames.push(Frame::Data {
                    stream_id,
                    payload: Bytes::new(),
                    end_stream: true,
                }),
            }
        }

        frames
    }
}

/// Incoming body buffer for one stream.
///
/// Reads pause once more than `high` bytes are buffered and resume when the
/// consumer drains the buffer to `low` or below. While paused, consumed
/// bytes are not returned to the peer as window credit, so the peer stops
/// sending once its window is spent.
#[derive(Debug)]
pub struct BufferedReader {
    chunks: VecDeque<Bytes>,
    buffered: usize,
    marks: Watermarks,
    paused: bool,
    unacked: usize,
}

impl BufferedReader {
    #[must_use]
    pub fn new(marks: Watermarks) -> Self {
        Self {
            chunks: VecDeque::new(),
            buffered: 0,
            marks,
            paused: false,
            unacked: 0,
        }
    }

    pub fn push(&mut self, chunk: Bytes) {
        if chunk.is_empty() {
            return;
        }
        self.buffered += chunk.len();
        self.chunks.push_back(chunk);
        if !self.paused && self.buffered > self.marks.high {
            self.paused = true;
            tracing::trace!(buffered = self.buffered, "reader paused");
        }
    }

    pub fn pop(&mut self) -> Option<Bytes> {
        let chunk = self.chunks.pop_front()?;
        self.buffered -= chunk.len();
        self.unacked += chunk.len();
        if self.paused && self.buffered <= self.marks.low {
            self.paused = false;
            tracing::trace!(buffered = self.buffered, "reader resumed");
        }
        Some(chunk)
    }

    /// Consumed bytes to return to the peer, unless paused.
    pub fn take_credit(&mut self) -> Option<u32> {
        if self.paused || self.unacked == 0 {
            return None;
        }
        let credit = u32::try_from(self.unacked).unwrap_or(u32::MAX);
        self.unacked -= credit as usize;
        Some(credit)
    }

    #[must_use]
    pub fn is_paused(&self) -> bool {
        self.paused
    }

    #[must_use]
    pub fn buffered(&self) -> usize {
        self.buffered
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lens(frames: &[Frame]) -> Vec<(usize, bool)> {
        frames
            .iter()
            .map(|f| (f.flow_controlled_len(), f.is_end_stream()))
            .collect()
    }

    #[test]
    fn test_writer_flushes_above_high_water() {
        let mut writer = BufferedWriter::new(10, 100);
        assert!(!writer.write(Bytes::from_static(b"12345")));
        assert!(!writer.write(Bytes::from_static(b"12345")));
        assert!(writer.write(Bytes::from_static(b"1")));
    }

    #[test]
    fn test_writer_flushes_at_max_chunks() {
        let mut writer = BufferedWriter::new(1024, 3);
        assert!(!writer.write(Bytes::from_static(b"a")));
        assert!(!writer.write(Bytes::from_static(b"b")));
        assert!(writer.write(Bytes::from_static(b"c")));
    }

    #[test]
    fn test_flush_respects_window_and_frame_size() {
        let mut writer = BufferedWriter::new(0, 16);
        writer.write(Bytes::from(vec![0u8; 10]));
        writer.write(Bytes::from(vec![1u8; 10]));
        writer.finish();

        let frames = writer.flush(1, 14, 4);
        assert_eq!(lens(&frames), vec![(4, false), (4, false), (2, false), (4, false)]);
        assert_eq!(writer.buffered(), 6);
        assert!(writer.has_pending());

        let frames = writer.flush(1, 100, 8);
        assert_eq!(lens(&frames), vec![(6, true)]);
        assert!(writer.is_complete());
        assert!(!writer.has_pending());
    }

    #[test]
    fn test_zero_window_only_sends_end_of_empty_body() {
        let mut writer = BufferedWriter::new(0, 16);
        writer.write(Bytes::from_static(b"data"));
        writer.finish();
        assert!(writer.flush(3, 0, 16).is_empty());

        let mut empty = BufferedWriter::new(0, 16);
        empty.finish();
        assert_eq!(lens(&empty.flush(3, 0, 16)), vec![(0, true)]);
    }

    #[test]
    fn test_reader_pauses_and_resumes() {
        let mut reader = BufferedReader::new(Watermarks::new(8, 4));
        reader.push(Bytes::from_static(b"12345"));
        assert!(!reader.is_paused());
        reader.push(Bytes::from_static(b"67890"));
        assert!(reader.is_paused());

        assert_eq!(reader.pop().unwrap().len(), 5);
        assert!(!reader.is_paused());
        assert_eq!(reader.take_credit(), Some(5));
        assert_eq!(reader.take_credit(), None);
    }

    #[test]
    fn test_reader_withholds_credit_while_paused() {
        let mut reader = BufferedReader::new(Watermarks::new(4, 2));
        for _ in 0..4 {
            reader.push(Bytes::from_static(b"ab"));
        }
        assert!(reader.is_paused());

        reader.pop();
        assert!(reader.is_paused());
        assert_eq!(reader.take_credit(), None);

        reader.pop();
        reader.pop();
        assert!(!reader.is_paused());
        assert_eq!(reader.take_credit(), Some(6));
        assert_eq!(reader.buffered(), 2);
    }

    #[test]
    fn test_watermarks_clamped() {
        assert_eq!(Watermarks::new(4, 10), Watermarks { high: 4, low: 4 });
    }
}
