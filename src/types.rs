use num_derive::{FromPrimitive, ToPrimitive};

/// Largest stream identifier and flow-control bound (31 bits).
pub const U31_MAX: u32 = u32::MAX >> 1;

pub type StreamId = u32;
pub type NonZeroStreamId = std::num::NonZeroU32;

/// Decoded header list as exchanged with the HTTP layer. Order-preserving;
/// pseudo-headers are ordinary entries whose names start with `:`.
pub type Headers = Vec<(String, String)>;

/// https://httpwg.org/specs/rfc7540.html#FrameTypes
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, FromPrimitive, ToPrimitive)]
#[repr(u8)]
pub enum FrameType {
    Data = 0x0,
    Headers = 0x1,
    Priority = 0x2,
    ResetStream = 0x3,
    Settings = 0x4,
    PushPromise = 0x5,
    Ping = 0x6,
    GoAway = 0x7,
    WindowUpdate = 0x8,
    Continuation = 0x9,
}

/// https://httpwg.org/specs/rfc7540.html#ErrorCodes
///
/// Carried by GOAWAY and RST_STREAM frames in both directions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, FromPrimitive, ToPrimitive)]
#[repr(u32)]
#[non_exhaustive]
pub enum ErrorType {
    /// Not an error; used for graceful shutdown.
    NoError = 0x0,
    /// Unspecific protocol violation.
    ProtocolError = 0x1,
    /// Unexpected internal failure of the endpoint.
    InternalError = 0x2,
    /// The peer violated the flow-control protocol.
    FlowControlError = 0x3,
    /// A SETTINGS frame went unacknowledged for too long.
    SettingsTimeout = 0x4,
    /// A frame arrived after the stream was half-closed.
    StreamClosed = 0x5,
    /// A frame had an invalid size.
    FrameSizeError = 0x6,
    /// The stream was refused before any application processing.
    RefusedStream = 0x7,
    /// The stream is no longer needed.
    Cancel = 0x8,
    /// The header-compression context cannot be maintained.
    CompressionError = 0x9,
    /// The tunneled connection behind a CONNECT request failed.
    ConnectError = 0xa,
    /// The peer is generating excessive load.
    EnhanceYourCalm = 0xb,
    /// The transport does not meet minimum security requirements.
    InadequateSecurity = 0xc,
    /// HTTP/1.1 is required instead.
    Http11Required = 0xd,
}

/// https://httpwg.org/specs/rfc7540.html#SettingValues
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    FromPrimitive,
    ToPrimitive,
    enum_map::Enum,
)]
#[repr(u16)]
pub enum SettingsParameter {
    /// Maximum size in octets of the header-compression table used to decode
    /// blocks sent to us. Initial value: 4096.
    HeaderTableSize = 0x1,
    /// Whether the sender accepts PUSH_PROMISE frames. Must be 0 or 1;
    /// anything else is a connection error of type PROTOCOL_ERROR.
    EnablePush = 0x2,
    /// How many concurrent streams the sender permits the receiver to create.
    /// Initially unlimited.
    MaxConcurrentStreams = 0x3,
    /// Initial stream-level flow-control window, in octets. Values above
    /// 2^31-1 are a connection error of type FLOW_CONTROL_ERROR.
    InitialWindowSize = 0x4,
    /// Largest frame payload the sender is willing to receive. Must lie in
    /// [16384, 16777215]; anything else is a connection error.
    MaxFrameSize = 0x5,
    /// Advisory bound on the uncompressed size of a header list.
    MaxHeaderListSize = 0x6,
}
