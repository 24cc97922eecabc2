//! cm-wire: Connection sniffing for the cluster master's shared listener
//!
//! The master serves gRPC and plain HTTP on one socket. This crate decodes
//! just enough of an HTTP/2 connection preface to tell the two apart,
//! without consuming the bytes the real server still needs to read.

pub mod classify;
pub mod error;
pub mod frame;

pub use classify::{protocol_for_header_block, Classifier, Protocol, GRPC_CONTENT_TYPE, MAX_SNIFF_BYTES};
pub use error::WireError;
pub use frame::{
    FrameHeader, FrameKind, EMPTY_SETTINGS, FLAG_ACK, FLAG_END_HEADERS, FRAME_HEADER_SIZE, HTTP2_PREFACE,
};
