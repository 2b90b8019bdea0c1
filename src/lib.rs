#![warn(future_incompatible, nonstandard_style, rust_2018_idioms, unused)]
#![warn(clippy::pedantic)]
#![allow(
    clippy::doc_markdown,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc,
    clippy::module_name_repetitions,
    clippy::similar_names,
    clippy::cast_possible_truncation
)]

//! The connection core of an HTTP/2 endpoint: everything between a raw byte
//! duplex and a set of per-stream message queues. Framing, HPACK, flow
//! control, the settings and ping handshakes, stream lifecycle, and
//! graceful/forceful shutdown live here; TLS, ALPN, and HTTP semantics do
//! not.

mod codec;
mod connection;
mod defrag;
mod error;
mod flags;
mod frame;
mod headers;
mod ping;
mod settings;
mod stream;
mod stream_coordinator;
mod types;
mod window;

pub use bytes::Bytes;
pub use codec::{FrameReader, FrameWriter, PREFACE};
pub use connection::{ClientOptions, Connection, Incoming, IncomingStream};
pub use error::{ConnectionError, TransportError};
pub use flags::{
    ContinuationFlags, DataFlags, HeadersFlags, PingFlags, PushPromiseFlags, SettingsFlags,
};
pub use frame::{Frame, FrameHeader, Priority};
pub use stream::{StreamEvent, StreamHandle};
pub use stream_coordinator::Role;
pub use types::{
    ErrorType, FrameType, Headers, NonZeroStreamId, SettingsParameter, StreamId, U31_MAX,
};
