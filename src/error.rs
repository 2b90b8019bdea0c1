use crate::types::ErrorType;
use std::io;

/// Connection-scoped failure raised while processing frames or commands.
///
/// Every variant maps to exactly one GOAWAY error code; dispatch classifies
/// by variant, emits the GOAWAY, and terminates. `Transport` means the wire
/// itself failed and no GOAWAY is attempted. `Terminated` is swallowed by
/// dispatch rather than escalated.
#[derive(thiserror::Error, Debug)]
pub enum ConnectionError {
    #[error("protocol error: {0}")]
    Protocol(&'static str),
    #[error("flow-control error: {0}")]
    FlowControl(&'static str),
    #[error("frame size error: {0}")]
    FrameSize(&'static str),
    #[error("compression error: {0}")]
    Compression(&'static str),
    #[error("transport error: {0}")]
    Transport(#[from] io::Error),
    #[error("connection already terminated")]
    Terminated,
    #[error("internal error: {0}")]
    Internal(&'static str),
}

impl ConnectionError {
    pub fn goaway_code(&self) -> ErrorType {
        match self {
            Self::Protocol(_) => ErrorType::ProtocolError,
            Self::FlowControl(_) => ErrorType::FlowControlError,
            Self::FrameSize(_) => ErrorType::FrameSizeError,
            Self::Compression(_) => ErrorType::CompressionError,
            Self::Transport(_) => ErrorType::ConnectError,
            Self::Terminated => ErrorType::NoError,
            Self::Internal(_) => ErrorType::InternalError,
        }
    }
}

/// Failure delivered through a user-facing future (`ping`, `open_stream`,
/// stream sends, `change_settings`). These never surface outside the future
/// that returned them.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// The connection was torn down before the operation completed. Carries
    /// the GOAWAY code the termination used.
    #[error("connection terminated: {0:?}")]
    Terminated(ErrorType),
    /// The connection is shutting down; new streams are refused.
    #[error("connection is shutting down")]
    GoingAway,
    /// The connection has not finished its settings handshake yet.
    #[error("connection is not ready")]
    NotReady,
    /// One more stream would exceed the peer's MAX_CONCURRENT_STREAMS.
    #[error("peer concurrent-stream limit reached")]
    TooManyStreams,
    /// The bounded in-flight ping window is full.
    #[error("too many unacknowledged pings")]
    TooManyPings,
    /// Local stream ids are exhausted; a fresh connection is required.
    #[error("stream ids exhausted")]
    IdsExhausted,
    /// The stream is closed (or not writable) for the attempted operation.
    #[error("stream closed")]
    StreamClosed,
    /// A locally proposed setting value is illegal.
    #[error("invalid setting value")]
    InvalidSetting,
    /// Server push is disabled or not available in this role.
    #[error("push not permitted")]
    PushDisabled,
}

impl TransportError {
    /// Error used when the driver is already gone.
    pub(crate) fn closed() -> Self {
        Self::Terminated(ErrorType::NoError)
    }
}
