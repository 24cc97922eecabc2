//! Wire error types

use thiserror::Error;

use crate::frame::FrameKind;

/// Errors that can occur while sniffing a connection preface
#[derive(Error, Debug)]
pub enum WireError {
    /// Frame payload does not match its declared layout
    #[error("Malformed HTTP/2 frame: {0}")]
    MalformedFrame(&'static str),

    /// HPACK header block could not be decoded
    #[error("Header block could not be decoded: {0}")]
    Hpack(String),

    /// A frame other than CONTINUATION arrived while a header block was open
    #[error("Unexpected {found:?} frame while a header block is open on stream {stream_id}")]
    InterleavedHeaderBlock { found: FrameKind, stream_id: u32 },
}
