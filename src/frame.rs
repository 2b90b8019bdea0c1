use crate::{error::ConnectionError, flags::*, types::*};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use num_traits::FromPrimitive;

/// The fixed 9-octet header carried by every frame.
/// https://httpwg.org/specs/rfc7540.html#FrameHeader
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub length: u32,
    pub typ: u8,
    pub flags: u8,
    pub stream: StreamId,
}

impl FrameHeader {
    pub const SIZE: usize = 9;

    pub fn parse(raw: &[u8; Self::SIZE]) -> Self {
        Self {
            length: u32::from_be_bytes([0, raw[0], raw[1], raw[2]]),
            typ: raw[3],
            flags: raw[4],
            stream: u32::from_be_bytes([raw[5], raw[6], raw[7], raw[8]]) & U31_MAX,
        }
    }

    fn encode(&self, dst: &mut BytesMut) {
        dst.put_slice(&self.length.to_be_bytes()[1..]);
        dst.put_u8(self.typ);
        dst.put_u8(self.flags);
        dst.put_u32(self.stream & U31_MAX);
    }
}

/// Dependency fields carried by PRIORITY frames and prioritized HEADERS.
/// Parsed and surfaced, never acted upon.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Priority {
    pub dependency: StreamId,
    pub exclusive: bool,
    pub weight: u8,
}

/// One HTTP/2 frame, decoded. https://httpwg.org/specs/rfc7540.html#FrameTypes
///
/// Padding on DATA is stripped but its octet count is kept so flow-control
/// accounting sees the full payload; padding on header-carrying frames is
/// stripped entirely and the PADDED flag cleared.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Data {
        stream: NonZeroStreamId,
        flags: DataFlags,
        data: Bytes,
        pad: u8,
    },
    Headers {
        stream: NonZeroStreamId,
        flags: HeadersFlags,
        priority: Option<Priority>,
        fragment: Bytes,
    },
    Priority {
        stream: NonZeroStreamId,
        priority: Priority,
    },
    ResetStream {
        stream: NonZeroStreamId,
        error: ErrorType,
    },
    Settings {
        flags: SettingsFlags,
        params: Vec<(SettingsParameter, u32)>,
    },
    PushPromise {
        stream: NonZeroStreamId,
        flags: PushPromiseFlags,
        promised: NonZeroStreamId,
        fragment: Bytes,
    },
    Ping {
        flags: PingFlags,
        payload: [u8; 8],
    },
    GoAway {
        last_stream: StreamId,
        error: ErrorType,
        debug: Bytes,
    },
    WindowUpdate {
        stream: StreamId,
        increment: u32,
    },
    Continuation {
        stream: NonZeroStreamId,
        flags: ContinuationFlags,
        fragment: Bytes,
    },
    /// Unrecognized frame type, carried through for forward compatibility.
    Unknown {
        typ: u8,
        flags: u8,
        stream: StreamId,
        payload: Bytes,
    },
}

fn require_stream(id: StreamId, what: &'static str) -> Result<NonZeroStreamId, ConnectionError> {
    NonZeroStreamId::new(id).ok_or(ConnectionError::Protocol(what))
}

fn require_connection(id: StreamId, what: &'static str) -> Result<(), ConnectionError> {
    if id == 0 {
        Ok(())
    } else {
        Err(ConnectionError::Protocol(what))
    }
}

/// Removes the pad-length octet and trailing padding, returning the count of
/// padding octets.
fn strip_padding(payload: &mut Bytes) -> Result<u8, ConnectionError> {
    if payload.is_empty() {
        return Err(ConnectionError::Protocol("padded frame without pad length"));
    }
    let pad = payload[0];
    payload.advance(1);
    if usize::from(pad) > payload.len() {
        return Err(ConnectionError::Protocol("padding exceeds frame payload"));
    }
    payload.truncate(payload.len() - usize::from(pad));
    Ok(pad)
}

fn read_priority(payload: &mut Bytes) -> Result<Priority, ConnectionError> {
    if payload.len() < 5 {
        return Err(ConnectionError::FrameSize("truncated priority fields"));
    }
    let raw = payload.get_u32();
    Ok(Priority {
        dependency: raw & U31_MAX,
        exclusive: raw & !U31_MAX != 0,
        weight: payload.get_u8(),
    })
}

fn error_type(code: u32) -> ErrorType {
    // Unknown codes carry no special behavior; read them as INTERNAL_ERROR.
    ErrorType::from_u32(code).unwrap_or(ErrorType::InternalError)
}

impl Frame {
    pub fn parse(header: FrameHeader, mut payload: Bytes) -> Result<Self, ConnectionError> {
        let Some(typ) = FrameType::from_u8(header.typ) else {
            return Ok(Self::Unknown {
                typ: header.typ,
                flags: header.flags,
                stream: header.stream,
                payload,
            });
        };
        match typ {
            FrameType::Data => {
                let stream = require_stream(header.stream, "DATA on stream 0")?;
                let flags = DataFlags::from_bits_truncate(header.flags);
                let pad = if flags.contains(DataFlags::PADDED) {
                    strip_padding(&mut payload)?
                } else {
                    0
                };
                Ok(Self::Data {
                    stream,
                    flags,
                    data: payload,
                    pad,
                })
            }
            FrameType::Headers => {
                let stream = require_stream(header.stream, "HEADERS on stream 0")?;
                let mut flags = HeadersFlags::from_bits_truncate(header.flags);
                if flags.contains(HeadersFlags::PADDED) {
                    strip_padding(&mut payload)?;
                    flags.remove(HeadersFlags::PADDED);
                }
                let priority = if flags.contains(HeadersFlags::PRIORITY) {
                    Some(read_priority(&mut payload)?)
                } else {
                    None
                };
                Ok(Self::Headers {
                    stream,
                    flags,
                    priority,
                    fragment: payload,
                })
            }
            FrameType::Priority => {
                let stream = require_stream(header.stream, "PRIORITY on stream 0")?;
                if payload.len() != 5 {
                    return Err(ConnectionError::FrameSize("PRIORITY payload must be 5 octets"));
                }
                Ok(Self::Priority {
                    stream,
                    priority: read_priority(&mut payload)?,
                })
            }
            FrameType::ResetStream => {
                let stream = require_stream(header.stream, "RST_STREAM on stream 0")?;
                if payload.len() != 4 {
                    return Err(ConnectionError::FrameSize("RST_STREAM payload must be 4 octets"));
                }
                Ok(Self::ResetStream {
                    stream,
                    error: error_type(payload.get_u32()),
                })
            }
            FrameType::Settings => {
                require_connection(header.stream, "SETTINGS on a stream")?;
                let flags = SettingsFlags::from_bits_truncate(header.flags);
                if flags.contains(SettingsFlags::ACK) && !payload.is_empty() {
                    return Err(ConnectionError::FrameSize("SETTINGS ack with a payload"));
                }
                if payload.len() % 6 != 0 {
                    return Err(ConnectionError::FrameSize("SETTINGS payload not a multiple of 6"));
                }
                let mut params = Vec::with_capacity(payload.len() / 6);
                while !payload.is_empty() {
                    let id = payload.get_u16();
                    let value = payload.get_u32();
                    // unknown identifiers are ignored for forward compatibility
                    if let Some(param) = SettingsParameter::from_u16(id) {
                        params.push((param, value));
                    }
                }
                Ok(Self::Settings { flags, params })
            }
            FrameType::PushPromise => {
                let stream = require_stream(header.stream, "PUSH_PROMISE on stream 0")?;
                let mut flags = PushPromiseFlags::from_bits_truncate(header.flags);
                if flags.contains(PushPromiseFlags::PADDED) {
                    strip_padding(&mut payload)?;
                    flags.remove(PushPromiseFlags::PADDED);
                }
                if payload.len() < 4 {
                    return Err(ConnectionError::FrameSize("PUSH_PROMISE without promised id"));
                }
                let promised = require_stream(
                    payload.get_u32() & U31_MAX,
                    "PUSH_PROMISE promising stream 0",
                )?;
                Ok(Self::PushPromise {
                    stream,
                    flags,
                    promised,
                    fragment: payload,
                })
            }
            FrameType::Ping => {
                require_connection(header.stream, "PING on a stream")?;
                if payload.len() != 8 {
                    return Err(ConnectionError::FrameSize("PING payload must be 8 octets"));
                }
                let mut data = [0u8; 8];
                data.copy_from_slice(&payload);
                Ok(Self::Ping {
                    flags: PingFlags::from_bits_truncate(header.flags),
                    payload: data,
                })
            }
            FrameType::GoAway => {
                require_connection(header.stream, "GOAWAY on a stream")?;
                if payload.len() < 8 {
                    return Err(ConnectionError::FrameSize("GOAWAY shorter than 8 octets"));
                }
                let last_stream = payload.get_u32() & U31_MAX;
                let error = error_type(payload.get_u32());
                Ok(Self::GoAway {
                    last_stream,
                    error,
                    debug: payload,
                })
            }
            FrameType::WindowUpdate => {
                if payload.len() != 4 {
                    return Err(ConnectionError::FrameSize(
                        "WINDOW_UPDATE payload must be 4 octets",
                    ));
                }
                Ok(Self::WindowUpdate {
                    stream: header.stream,
                    increment: payload.get_u32() & U31_MAX,
                })
            }
            FrameType::Continuation => {
                let stream = require_stream(header.stream, "CONTINUATION on stream 0")?;
                Ok(Self::Continuation {
                    stream,
                    flags: ContinuationFlags::from_bits_truncate(header.flags),
                    fragment: payload,
                })
            }
        }
    }

    pub fn encode(&self, dst: &mut BytesMut) {
        let mut payload = BytesMut::new();
        let (typ, flags, stream) = match self {
            Self::Data {
                stream,
                flags,
                data,
                pad,
            } => {
                if flags.contains(DataFlags::PADDED) {
                    payload.put_u8(*pad);
                }
                payload.extend_from_slice(data);
                if flags.contains(DataFlags::PADDED) {
                    payload.put_bytes(0, usize::from(*pad));
                }
                (FrameType::Data as u8, flags.bits(), stream.get())
            }
            Self::Headers {
                stream,
                flags,
                priority,
                fragment,
            } => {
                if let Some(priority) = priority {
                    encode_priority(&mut payload, priority);
                }
                payload.extend_from_slice(fragment);
                (FrameType::Headers as u8, flags.bits(), stream.get())
            }
            Self::Priority { stream, priority } => {
                encode_priority(&mut payload, priority);
                (FrameType::Priority as u8, 0, stream.get())
            }
            Self::ResetStream { stream, error } => {
                payload.put_u32(*error as u32);
                (FrameType::ResetStream as u8, 0, stream.get())
            }
            Self::Settings { flags, params } => {
                for &(param, value) in params {
                    payload.put_u16(param as u16);
                    payload.put_u32(value);
                }
                (FrameType::Settings as u8, flags.bits(), 0)
            }
            Self::PushPromise {
                stream,
                flags,
                promised,
                fragment,
            } => {
                payload.put_u32(promised.get());
                payload.extend_from_slice(fragment);
                (FrameType::PushPromise as u8, flags.bits(), stream.get())
            }
            Self::Ping {
                flags,
                payload: data,
            } => {
                payload.extend_from_slice(data);
                (FrameType::Ping as u8, flags.bits(), 0)
            }
            Self::GoAway {
                last_stream,
                error,
                debug,
            } => {
                payload.put_u32(last_stream & U31_MAX);
                payload.put_u32(*error as u32);
                payload.extend_from_slice(debug);
                (FrameType::GoAway as u8, 0, 0)
            }
            Self::WindowUpdate { stream, increment } => {
                payload.put_u32(increment & U31_MAX);
                (FrameType::WindowUpdate as u8, 0, *stream)
            }
            Self::Continuation {
                stream,
                flags,
                fragment,
            } => {
                payload.extend_from_slice(fragment);
                (FrameType::Continuation as u8, flags.bits(), stream.get())
            }
            Self::Unknown {
                typ,
                flags,
                stream,
                payload: raw,
            } => {
                payload.extend_from_slice(raw);
                (*typ, *flags, *stream)
            }
        };
        FrameHeader {
            length: payload.len() as u32,
            typ,
            flags,
            stream,
        }
        .encode(dst);
        dst.extend_from_slice(&payload);
    }

    /// Octets this frame counts against flow control. Only DATA is
    /// flow-controlled; padding counts, including the pad-length octet.
    pub fn flow_controlled_len(&self) -> u32 {
        match self {
            Self::Data {
                flags, data, pad, ..
            } => {
                let padding = if flags.contains(DataFlags::PADDED) {
                    u32::from(*pad) + 1
                } else {
                    0
                };
                data.len() as u32 + padding
            }
            _ => 0,
        }
    }
}

fn encode_priority(payload: &mut BytesMut, priority: &Priority) {
    let mut raw = priority.dependency & U31_MAX;
    if priority.exclusive {
        raw |= !U31_MAX;
    }
    payload.put_u32(raw);
    payload.put_u8(priority.weight);
}
