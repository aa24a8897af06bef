//! `wiremux`: a minimal stream multiplexer over a single reliable,
//! ordered, bidirectional byte-stream transport.
//!
//! A connection carries many independent byte streams, each identified by
//! a varint-friendly id and framed with a tiny header. See [`Multiplex`]
//! for the connection-level driver and [`Stream`] for the per-stream
//! handle handed to accept-side handlers and returned by
//! [`Multiplex::new_stream`].

mod error;
pub mod frame;
mod mux;
mod stream;
pub mod varint;

pub use error::{Error, Result};
pub use mux::{Multiplex, MuxConfig};
pub use stream::{ReadStatus, Stream};
