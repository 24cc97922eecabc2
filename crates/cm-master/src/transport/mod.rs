//! Shared listener transport
//!
//! - `listener`: systemd socket adoption or port binding
//! - `tls`: optional TLS termination with deferred handshakes
//! - `mux`: gRPC/HTTP demultiplexing onto two sub-listeners
//! - `stream`: boxed connection types and sniffed-byte replay
//! - `supervisor`: first-exit-wins supervision of the serving loops

pub mod listener;
pub mod mux;
pub mod stream;
pub mod supervisor;
pub mod tls;

pub use listener::{resolve_listener, Activation, BaseListener, ListenerOrigin};
pub use mux::{Demux, Routes, SubListener};
pub use stream::{BoxedStream, MuxConnectInfo, MuxStream};
pub use supervisor::TransportSupervisor;
pub use tls::{acceptor_from_config, Pending, SecureListener};
