//! # cirrus-codec
//!
//! Binary framing for multiplexed request/response streams.
//!
//! ## Frame Format
//!
//! ```text
//! +---------------+----------+-----------+------------------+------------------+
//! | Length (4 LE) | Type (1) | Flags (1) | Stream id (4 LE) | Payload (Length) |
//! +---------------+----------+-----------+------------------+------------------+
//! ```
//!
//! | Type | Name            | Payload                               |
//! |------|-----------------|---------------------------------------|
//! | 0x0  | `DATA`          | body bytes                            |
//! | 0x1  | `HEADERS`       | opaque header block                   |
//! | 0x3  | `RST_STREAM`    | reason code (4 LE)                    |
//! | 0x7  | `GOAWAY`        | last stream id (4 LE), reason (4 LE)  |
//! | 0x8  | `WINDOW_UPDATE` | increment (4 LE)                      |
//!
//! Flag `0x1` on `HEADERS`/`DATA` ends the sender's half of the stream.
//! `FrameCodec` implements the `tokio_util` codec traits, so a connection is
//! read with `FramedRead` and written with `FramedWrite`.

mod frame;

pub use frame::{
    Frame, FrameCodec, CONTROL_PAYLOAD_MAX, DEFAULT_MAX_FRAME_SIZE, FLAG_END_STREAM, HEADER_LEN,
};
