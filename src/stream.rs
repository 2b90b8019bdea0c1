use crate::{
    connection::Command,
    error::{ConnectionError, TransportError},
    types::*,
    window::{RecvFlow, Window},
};
use bytes::Bytes;
use log::trace;
use std::collections::VecDeque;
use tokio::sync::{mpsc, oneshot};

/// https://httpwg.org/specs/rfc7540.html#StreamStates
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum StreamState {
    Idle,
    ReservedLocal,
    ReservedRemote,
    Open,
    HalfClosedLocal,
    HalfClosedRemote,
    Closed,
}

/// A violation observed while applying an inbound frame to a stream.
/// `Reset` stays stream-scoped (RST_STREAM and move on); `Conn` escalates.
#[derive(Debug)]
pub(crate) enum StreamError {
    Reset(ErrorType),
    Conn(ConnectionError),
}

/// One message in the sequence a stream yields to the HTTP layer. Every
/// message carries its end-stream marker explicitly; `Trailers` and `Reset`
/// always end the stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    Headers { headers: Headers, end_stream: bool },
    Data { data: Bytes, end_stream: bool },
    Trailers { headers: Headers },
    Reset { error: ErrorType },
}

/// Outbound work queued on a stream until window credit allows it out.
pub(crate) enum PendingSend {
    Data {
        data: Bytes,
        end_stream: bool,
        reply: Option<oneshot::Sender<Result<(), TransportError>>>,
    },
    /// Pre-encoded trailing header block; waits its turn behind data.
    Trailers {
        fragment: Bytes,
        reply: Option<oneshot::Sender<Result<(), TransportError>>>,
    },
}

pub(crate) struct Stream {
    pub(crate) id: NonZeroStreamId,
    state: StreamState,
    /// Credit for DATA we send on this stream.
    pub(crate) send_window: Window,
    /// Accounting for DATA the peer sends on this stream.
    pub(crate) recv_flow: RecvFlow,
    events: mpsc::UnboundedSender<StreamEvent>,
    pub(crate) pending_send: VecDeque<PendingSend>,
    /// Present in the connection's flush FIFO.
    pub(crate) queued_for_send: bool,
    remote_headers_seen: bool,
    local_headers_sent: bool,
    /// A queued end-stream DATA or trailer block closes our side once it
    /// flushes; nothing may be sent behind it.
    outbound_closing: bool,
}

impl Stream {
    pub(crate) fn new(
        id: NonZeroStreamId,
        state: StreamState,
        send_init: u32,
        recv_init: u32,
        events: mpsc::UnboundedSender<StreamEvent>,
    ) -> Self {
        Self {
            id,
            state,
            send_window: Window::new(send_init),
            recv_flow: RecvFlow::new(recv_init),
            events,
            pending_send: VecDeque::new(),
            queued_for_send: false,
            remote_headers_seen: false,
            local_headers_sent: false,
            outbound_closing: false,
        }
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.state == StreamState::Closed
    }

    /// Hands an event to the stream's consumer. A dropped receiver is not an
    /// error; the data is simply unobserved.
    pub(crate) fn deliver(&mut self, event: StreamEvent) {
        self.events.send(event).ok();
    }

    fn transition(&mut self, next: StreamState) {
        if self.state != next {
            trace!("stream {} {:?} -> {:?}", self.id, self.state, next);
            self.state = next;
        }
    }

    fn recv_close(&mut self) {
        match self.state {
            StreamState::Open => self.transition(StreamState::HalfClosedRemote),
            StreamState::HalfClosedLocal => self.transition(StreamState::Closed),
            _ => {}
        }
    }

    fn send_close(&mut self) {
        match self.state {
            StreamState::Open => self.transition(StreamState::HalfClosedLocal),
            StreamState::HalfClosedRemote => self.transition(StreamState::Closed),
            _ => {}
        }
    }

    /// Applies an inbound header block. `Ok(true)` means it was trailers.
    pub(crate) fn recv_headers(&mut self, end_stream: bool) -> Result<bool, StreamError> {
        let trailers = match self.state {
            StreamState::Idle => {
                self.transition(StreamState::Open);
                false
            }
            StreamState::ReservedRemote => {
                self.transition(StreamState::HalfClosedLocal);
                false
            }
            StreamState::Open | StreamState::HalfClosedLocal => {
                if self.remote_headers_seen {
                    // trailers must end the stream
                    if !end_stream {
                        return Err(StreamError::Reset(ErrorType::ProtocolError));
                    }
                    true
                } else {
                    false
                }
            }
            StreamState::ReservedLocal => {
                return Err(StreamError::Conn(ConnectionError::Protocol(
                    "HEADERS on a push stream we reserved",
                )));
            }
            StreamState::HalfClosedRemote | StreamState::Closed => {
                return Err(StreamError::Reset(ErrorType::StreamClosed));
            }
        };
        self.remote_headers_seen = true;
        if end_stream {
            self.recv_close();
        }
        Ok(trailers)
    }

    /// Applies inbound DATA: state check, then per-stream flow accounting.
    /// `Ok(Some(n))` asks for a stream WINDOW_UPDATE with increment `n`.
    pub(crate) fn recv_data(
        &mut self,
        flow_len: u32,
        end_stream: bool,
    ) -> Result<Option<u32>, StreamError> {
        match self.state {
            StreamState::Open | StreamState::HalfClosedLocal => {}
            StreamState::Idle | StreamState::ReservedLocal | StreamState::ReservedRemote => {
                return Err(StreamError::Conn(ConnectionError::Protocol(
                    "DATA on a stream that is not open",
                )));
            }
            StreamState::HalfClosedRemote | StreamState::Closed => {
                return Err(StreamError::Reset(ErrorType::StreamClosed));
            }
        }
        let increment = self
            .recv_flow
            .recv(flow_len)
            .map_err(|_| StreamError::Reset(ErrorType::FlowControlError))?;
        if end_stream {
            self.recv_close();
        }
        Ok(increment)
    }

    pub(crate) fn recv_window_update(&mut self, increment: u32) -> Result<(), StreamError> {
        if increment == 0 {
            return Err(StreamError::Reset(ErrorType::ProtocolError));
        }
        self.send_window
            .increase(increment)
            .map_err(|_| StreamError::Reset(ErrorType::FlowControlError))
    }

    /// The parent-stream side of an inbound PUSH_PROMISE.
    pub(crate) fn recv_push_promise(&mut self) -> Result<(), StreamError> {
        match self.state {
            StreamState::Open | StreamState::HalfClosedLocal => Ok(()),
            _ => Err(StreamError::Conn(ConnectionError::Protocol(
                "PUSH_PROMISE on a stream that is not open",
            ))),
        }
    }

    /// Applies an outbound header block (initial headers, push response
    /// headers, or trailers when `end_stream` and headers were sent before).
    pub(crate) fn send_headers(&mut self, end_stream: bool) -> Result<(), TransportError> {
        match self.state {
            StreamState::Idle => self.transition(StreamState::Open),
            StreamState::ReservedLocal => self.transition(StreamState::HalfClosedRemote),
            StreamState::Open | StreamState::HalfClosedRemote => {
                // a second block from us is trailers and must end the stream
                if self.local_headers_sent && !end_stream {
                    return Err(TransportError::StreamClosed);
                }
            }
            StreamState::ReservedRemote | StreamState::HalfClosedLocal | StreamState::Closed => {
                return Err(TransportError::StreamClosed);
            }
        }
        self.local_headers_sent = true;
        if end_stream {
            self.send_close();
        }
        Ok(())
    }

    pub(crate) fn can_send_data(&self) -> bool {
        self.local_headers_sent
            && !self.outbound_closing
            && matches!(self.state, StreamState::Open | StreamState::HalfClosedRemote)
    }

    pub(crate) fn mark_outbound_closing(&mut self) {
        self.outbound_closing = true;
    }

    /// Whether a PUSH_PROMISE may be sent with this stream as its parent.
    pub(crate) fn can_push(&self) -> bool {
        matches!(self.state, StreamState::Open | StreamState::HalfClosedRemote)
    }

    /// Marks our side closed after the final DATA chunk was written.
    pub(crate) fn sent_end_stream(&mut self) {
        self.send_close();
    }

    /// Fails queued sends and tells the consumer the stream died.
    pub(crate) fn abort(&mut self, code: ErrorType, err: &TransportError) {
        for entry in self.pending_send.drain(..) {
            let reply = match entry {
                PendingSend::Data { reply, .. } | PendingSend::Trailers { reply, .. } => reply,
            };
            if let Some(reply) = reply {
                let _ = reply.send(Err(err.clone()));
            }
        }
        if self.state != StreamState::Closed {
            self.events.send(StreamEvent::Reset { error: code }).ok();
            self.transition(StreamState::Closed);
        }
    }
}

/// Handle to one stream: a receiver for its inbound message sequence and the
/// symmetric outbound operations. Dropping the handle does not reset the
/// stream; use `reset` for that.
#[derive(Debug)]
pub struct StreamHandle {
    pub(crate) id: NonZeroStreamId,
    pub(crate) events: mpsc::UnboundedReceiver<StreamEvent>,
    pub(crate) cmd: mpsc::Sender<Command>,
}

impl StreamHandle {
    pub fn id(&self) -> NonZeroStreamId {
        self.id
    }

    /// Next inbound message; `None` once the stream is done and drained.
    pub async fn recv(&mut self) -> Option<StreamEvent> {
        self.events.recv().await
    }

    /// Sends DATA, suspending (via the connection's queues) until window
    /// credit allowed every octet onto the wire.
    pub async fn send_data(&self, data: Bytes, end_stream: bool) -> Result<(), TransportError> {
        let (reply, rx) = oneshot::channel();
        self.cmd
            .send(Command::SendData {
                stream: self.id,
                data,
                end_stream,
                reply,
            })
            .await
            .map_err(|_| TransportError::closed())?;
        rx.await.unwrap_or_else(|_| Err(TransportError::closed()))
    }

    /// Sends a header block on this stream: response headers on a pushed
    /// stream, or trailers when a block was already sent.
    pub async fn send_headers(
        &self,
        headers: Headers,
        end_stream: bool,
    ) -> Result<(), TransportError> {
        let (reply, rx) = oneshot::channel();
        self.cmd
            .send(Command::SendHeaders {
                stream: self.id,
                headers,
                end_stream,
                reply,
            })
            .await
            .map_err(|_| TransportError::closed())?;
        rx.await.unwrap_or_else(|_| Err(TransportError::closed()))
    }

    /// Sends a trailing header block, ending our side of the stream.
    pub async fn send_trailers(&self, headers: Headers) -> Result<(), TransportError> {
        self.send_headers(headers, true).await
    }

    /// Reserves a push stream promised on this one (server only; subject to
    /// the peer's ENABLE_PUSH).
    pub async fn push(&self, headers: Headers) -> Result<StreamHandle, TransportError> {
        let (reply, rx) = oneshot::channel();
        self.cmd
            .send(Command::Push {
                parent: self.id,
                headers,
                reply,
            })
            .await
            .map_err(|_| TransportError::closed())?;
        rx.await.unwrap_or_else(|_| Err(TransportError::closed()))
    }

    /// Abandons the stream with RST_STREAM. Best effort; a terminated
    /// connection has nothing left to reset.
    pub async fn reset(&self, error: ErrorType) {
        self.cmd
            .send(Command::ResetStream {
                stream: self.id,
                error,
            })
            .await
            .ok();
    }
}
