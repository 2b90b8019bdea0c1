use bitflags::bitflags;

bitflags! {
    /// https://httpwg.org/specs/rfc7540.html#DATA
    #[repr(transparent)]
    pub struct DataFlags: u8 {
        /// Last frame the sender will emit on this stream.
        const END_STREAM = 0x1;
        /// A pad-length octet and trailing padding are present.
        const PADDED = 0x8;
    }

    /// https://httpwg.org/specs/rfc7540.html#HEADERS
    #[repr(transparent)]
    pub struct HeadersFlags: u8 {
        /// The header block is the last thing the sender will emit on this
        /// stream. CONTINUATION frames may still follow; they belong to the
        /// same block.
        const END_STREAM = 0x1;
        /// The frame carries a complete header block. Without this flag the
        /// next frame on the connection must be a CONTINUATION for the same
        /// stream.
        const END_HEADERS = 0x4;
        /// A pad-length octet and trailing padding are present.
        const PADDED = 0x8;
        /// Exclusive bit, stream dependency, and weight fields are present.
        const PRIORITY = 0x20;
    }

    /// https://httpwg.org/specs/rfc7540.html#SETTINGS
    #[repr(transparent)]
    pub struct SettingsFlags: u8 {
        /// Acknowledges receipt and application of the peer's SETTINGS. An
        /// ack with a non-empty payload is a FRAME_SIZE_ERROR.
        const ACK = 0x1;
    }

    /// https://httpwg.org/specs/rfc7540.html#PUSH_PROMISE
    #[repr(transparent)]
    pub struct PushPromiseFlags: u8 {
        /// The frame carries a complete header block; same contract as on
        /// HEADERS.
        const END_HEADERS = 0x4;
        /// A pad-length octet and trailing padding are present.
        const PADDED = 0x8;
    }

    /// https://httpwg.org/specs/rfc7540.html#PING
    #[repr(transparent)]
    pub struct PingFlags: u8 {
        /// This PING is a response. Responses must carry the identical
        /// payload and must not themselves be answered.
        const ACK = 0x1;
    }

    /// https://httpwg.org/specs/rfc7540.html#CONTINUATION
    #[repr(transparent)]
    pub struct ContinuationFlags: u8 {
        /// This frame ends the header block opened by the preceding
        /// HEADERS or PUSH_PROMISE.
        const END_HEADERS = 0x4;
    }
}
