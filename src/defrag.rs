use crate::{
    error::ConnectionError,
    flags::{ContinuationFlags, HeadersFlags, PushPromiseFlags},
    frame::{Frame, Priority},
    types::NonZeroStreamId,
};
use bytes::BytesMut;
use log::trace;

/// Reassembles header blocks split across HEADERS / PUSH_PROMISE and
/// CONTINUATION frames. https://httpwg.org/specs/rfc7540.html#CONTINUATION
///
/// Every inbound frame passes through `accept`. While a block is open the
/// only legal frame on the whole connection is a CONTINUATION for the same
/// stream; anything else is a connection error of type PROTOCOL_ERROR.
#[derive(Debug)]
pub(crate) struct Defragmenter {
    pending: Option<Pending>,
    /// Bound on the accumulated (compressed) block, from our advertised
    /// MAX_HEADER_LIST_SIZE.
    max_block: usize,
}

#[derive(Debug)]
struct Pending {
    stream: NonZeroStreamId,
    kind: PendingKind,
    fragment: BytesMut,
}

#[derive(Debug)]
enum PendingKind {
    Headers {
        flags: HeadersFlags,
        priority: Option<Priority>,
    },
    PushPromise {
        promised: NonZeroStreamId,
    },
}

impl Defragmenter {
    pub(crate) fn new() -> Self {
        Self {
            pending: None,
            max_block: u32::MAX as usize,
        }
    }

    pub(crate) fn set_max_block(&mut self, max: u32) {
        self.max_block = max as usize;
    }

    /// Feeds one inbound frame through. `Ok(Some(_))` is a complete frame
    /// ready for dispatch (passed through, or synthesized from a finished
    /// run); `Ok(None)` means the block is still open.
    pub(crate) fn accept(&mut self, frame: Frame) -> Result<Option<Frame>, ConnectionError> {
        let Some(mut pending) = self.pending.take() else {
            return self.start(frame);
        };

        let Frame::Continuation {
            stream,
            flags,
            fragment,
        } = frame
        else {
            return Err(ConnectionError::Protocol(
                "expected CONTINUATION for the open header block",
            ));
        };
        if stream != pending.stream {
            return Err(ConnectionError::Protocol(
                "CONTINUATION on a different stream",
            ));
        }
        pending.fragment.extend_from_slice(&fragment);
        if pending.fragment.len() > self.max_block {
            return Err(ConnectionError::Compression(
                "header block exceeds MAX_HEADER_LIST_SIZE",
            ));
        }
        if !flags.contains(ContinuationFlags::END_HEADERS) {
            self.pending = Some(pending);
            return Ok(None);
        }

        trace!(
            "header block on stream {} reassembled ({} octets)",
            pending.stream,
            pending.fragment.len()
        );
        let fragment = pending.fragment.freeze();
        let merged = match pending.kind {
            PendingKind::Headers { flags, priority } => Frame::Headers {
                stream: pending.stream,
                flags: flags | HeadersFlags::END_HEADERS,
                priority,
                fragment,
            },
            PendingKind::PushPromise { promised } => Frame::PushPromise {
                stream: pending.stream,
                flags: PushPromiseFlags::END_HEADERS,
                promised,
                fragment,
            },
        };
        Ok(Some(merged))
    }

    fn start(&mut self, frame: Frame) -> Result<Option<Frame>, ConnectionError> {
        match frame {
            Frame::Headers {
                stream,
                flags,
                priority,
                fragment,
            } if !flags.contains(HeadersFlags::END_HEADERS) => {
                self.pending = Some(Pending {
                    stream,
                    kind: PendingKind::Headers { flags, priority },
                    fragment: BytesMut::from(&fragment[..]),
                });
                Ok(None)
            }
            Frame::PushPromise {
                stream,
                flags,
                promised,
                fragment,
            } if !flags.contains(PushPromiseFlags::END_HEADERS) => {
                self.pending = Some(Pending {
                    stream,
                    kind: PendingKind::PushPromise { promised },
                    fragment: BytesMut::from(&fragment[..]),
                });
                Ok(None)
            }
            Frame::Continuation { .. } => Err(ConnectionError::Protocol(
                "CONTINUATION without an open header block",
            )),
            complete => Ok(Some(complete)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use crate::flags::PingFlags;

    fn stream(id: u32) -> NonZeroStreamId {
        NonZeroStreamId::new(id).unwrap()
    }

    fn open_headers(stream_id: u32, fragment: &'static [u8]) -> Frame {
        Frame::Headers {
            stream: stream(stream_id),
            flags: HeadersFlags::empty(),
            priority: None,
            fragment: Bytes::from_static(fragment),
        }
    }

    fn continuation(stream_id: u32, end: bool, fragment: &'static [u8]) -> Frame {
        Frame::Continuation {
            stream: stream(stream_id),
            flags: if end {
                ContinuationFlags::END_HEADERS
            } else {
                ContinuationFlags::empty()
            },
            fragment: Bytes::from_static(fragment),
        }
    }

    #[test]
    fn merges_three_part_run() {
        let mut defrag = Defragmenter::new();
        assert!(defrag.accept(open_headers(1, b"aa")).unwrap().is_none());
        assert!(defrag.accept(continuation(1, false, b"bb")).unwrap().is_none());
        let merged = defrag.accept(continuation(1, true, b"cc")).unwrap().unwrap();
        assert_eq!(
            merged,
            Frame::Headers {
                stream: stream(1),
                flags: HeadersFlags::END_HEADERS,
                priority: None,
                fragment: Bytes::from_static(b"aabbcc"),
            }
        );
    }

    #[test]
    fn complete_headers_pass_through() {
        let mut defrag = Defragmenter::new();
        let frame = Frame::Headers {
            stream: stream(1),
            flags: HeadersFlags::END_HEADERS | HeadersFlags::END_STREAM,
            priority: None,
            fragment: Bytes::from_static(b"x"),
        };
        assert_eq!(defrag.accept(frame.clone()).unwrap(), Some(frame));
    }

    #[test]
    fn end_stream_survives_the_run() {
        let mut defrag = Defragmenter::new();
        let opener = Frame::Headers {
            stream: stream(5),
            flags: HeadersFlags::END_STREAM,
            priority: None,
            fragment: Bytes::from_static(b"a"),
        };
        assert!(defrag.accept(opener).unwrap().is_none());
        let merged = defrag.accept(continuation(5, true, b"b")).unwrap().unwrap();
        let Frame::Headers { flags, .. } = merged else {
            panic!("expected HEADERS");
        };
        assert!(flags.contains(HeadersFlags::END_STREAM));
        assert!(flags.contains(HeadersFlags::END_HEADERS));
    }

    #[test]
    fn interleaved_frame_is_protocol_error() {
        let mut defrag = Defragmenter::new();
        assert!(defrag.accept(open_headers(1, b"aa")).unwrap().is_none());
        let err = defrag
            .accept(Frame::Ping {
                flags: PingFlags::empty(),
                payload: [0; 8],
            })
            .unwrap_err();
        assert!(matches!(err, ConnectionError::Protocol(_)));
    }

    #[test]
    fn continuation_on_other_stream_is_protocol_error() {
        let mut defrag = Defragmenter::new();
        assert!(defrag.accept(open_headers(1, b"aa")).unwrap().is_none());
        let err = defrag.accept(continuation(3, true, b"bb")).unwrap_err();
        assert!(matches!(err, ConnectionError::Protocol(_)));
    }

    #[test]
    fn stray_continuation_is_protocol_error() {
        let mut defrag = Defragmenter::new();
        let err = defrag.accept(continuation(1, true, b"x")).unwrap_err();
        assert!(matches!(err, ConnectionError::Protocol(_)));
    }

    #[test]
    fn oversized_block_is_rejected() {
        let mut defrag = Defragmenter::new();
        defrag.set_max_block(3);
        assert!(defrag.accept(open_headers(1, b"ab")).unwrap().is_none());
        let err = defrag.accept(continuation(1, true, b"cd")).unwrap_err();
        assert!(matches!(err, ConnectionError::Compression(_)));
    }

    #[test]
    fn push_promise_run_merges() {
        let mut defrag = Defragmenter::new();
        let opener = Frame::PushPromise {
            stream: stream(1),
            flags: PushPromiseFlags::empty(),
            promised: stream(2),
            fragment: Bytes::from_static(b"pp"),
        };
        assert!(defrag.accept(opener).unwrap().is_none());
        let merged = defrag.accept(continuation(1, true, b"qq")).unwrap().unwrap();
        assert_eq!(
            merged,
            Frame::PushPromise {
                stream: stream(1),
                flags: PushPromiseFlags::END_HEADERS,
                promised: stream(2),
                fragment: Bytes::from_static(b"ppqq"),
            }
        );
    }
}
