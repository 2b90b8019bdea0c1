use crate::{
    codec::{FrameReader, FrameWriter},
    defrag::Defragmenter,
    error::{ConnectionError, TransportError},
    flags::{ContinuationFlags, DataFlags, HeadersFlags, PingFlags, PushPromiseFlags, SettingsFlags},
    frame::Frame,
    headers::HeaderCodec,
    ping::PingHandler,
    settings::{SettingsHandler, DEFAULT_INITIAL_WINDOW_SIZE},
    stream::{PendingSend, StreamEvent, StreamHandle, StreamState, StreamError},
    stream_coordinator::{Role, RouteClass, StreamCoordinator},
    types::*,
    window::{RecvFlow, Window},
};
use bytes::Bytes;
use log::{debug, error, trace, warn};
use std::{collections::VecDeque, io};
use tokio::{
    io::{AsyncRead, AsyncWrite, ReadHalf, WriteHalf},
    sync::{mpsc, oneshot},
};

/// Connection lifecycle. Monotonic: no state ever goes back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum ConnectionState {
    Initialized,
    Operational,
    Finishing,
    Terminated,
}

/// Client-side construction options.
#[derive(Debug, Clone, Copy, Default)]
pub struct ClientOptions {
    /// Accept PUSH_PROMISE from the server. Off by default; when off the
    /// initial SETTINGS advertise ENABLE_PUSH=0 and an inbound push is a
    /// protocol error.
    pub allow_server_push: bool,
}

type Reply<R> = oneshot::Sender<Result<R, TransportError>>;

/// Requests from the user-facing handles, serialized onto the driver task.
pub(crate) enum Command {
    Ping {
        reply: Reply<()>,
    },
    OpenStream {
        headers: Headers,
        end_stream: bool,
        reply: Reply<StreamHandle>,
    },
    ChangeSettings {
        params: Vec<(SettingsParameter, u32)>,
        reply: Reply<()>,
    },
    SendData {
        stream: NonZeroStreamId,
        data: Bytes,
        end_stream: bool,
        reply: Reply<()>,
    },
    SendHeaders {
        stream: NonZeroStreamId,
        headers: Headers,
        end_stream: bool,
        reply: Reply<()>,
    },
    Push {
        parent: NonZeroStreamId,
        headers: Headers,
        reply: Reply<StreamHandle>,
    },
    ResetStream {
        stream: NonZeroStreamId,
        error: ErrorType,
    },
    Finish,
    Terminate {
        done: oneshot::Sender<()>,
    },
}

/// One HTTP/2 connection. Cheap operations hand work to the driver task that
/// owns all connection state; both halves of the duplex live there.
#[derive(Debug)]
pub struct Connection {
    cmd: mpsc::Sender<Command>,
}

/// Peer-initiated streams: requests on a server, pushed streams on a client.
#[derive(Debug)]
pub struct Incoming {
    rx: mpsc::UnboundedReceiver<IncomingStream>,
}

/// A stream the peer opened, with its initial header list already decoded.
#[derive(Debug)]
pub struct IncomingStream {
    pub headers: Headers,
    pub end_stream: bool,
    pub stream: StreamHandle,
}

impl Incoming {
    /// Next peer-initiated stream; `None` once the connection is gone.
    pub async fn accept(&mut self) -> Option<IncomingStream> {
        self.rx.recv().await
    }
}

impl Connection {
    /// Builds the client side of a connection. The 24-octet preface and our
    /// initial SETTINGS go out before anything else.
    pub fn client<T>(io: T, options: ClientOptions) -> (Self, Incoming)
    where
        T: AsyncRead + AsyncWrite + Send + 'static,
    {
        Self::start(io, Role::Client, options.allow_server_push)
    }

    /// Builds the server side of a connection. The client preface is
    /// consumed and validated before any frame is read.
    pub fn server<T>(io: T) -> (Self, Incoming)
    where
        T: AsyncRead + AsyncWrite + Send + 'static,
    {
        Self::start(io, Role::Server, false)
    }

    fn start<T>(io: T, role: Role, allow_push: bool) -> (Self, Incoming)
    where
        T: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (cmd_tx, cmd_rx) = mpsc::channel(32);
        let (accept_tx, accept_rx) = mpsc::unbounded_channel();
        let (read, write) = tokio::io::split(io);
        let driver = Driver {
            allow_push,
            state: ConnectionState::Initialized,
            reader: FrameReader::new(read),
            writer: FrameWriter::new(write),
            hpack: HeaderCodec::new(),
            settings: SettingsHandler::new(),
            pings: PingHandler::new(),
            defrag: Defragmenter::new(),
            send_window: Window::new(DEFAULT_INITIAL_WINDOW_SIZE),
            recv_flow: RecvFlow::new(DEFAULT_INITIAL_WINDOW_SIZE),
            streams: StreamCoordinator::new(role),
            send_queue: VecDeque::new(),
            cmd_rx,
            cmd_tx: cmd_tx.clone(),
            accept_tx,
            sent_goaway: false,
            terminate_waiters: Vec::new(),
        };
        tokio::spawn(driver.run());
        (Self { cmd: cmd_tx }, Incoming { rx: accept_rx })
    }

    async fn roundtrip<R>(
        &self,
        make: impl FnOnce(Reply<R>) -> Command,
    ) -> Result<R, TransportError> {
        let (reply, rx) = oneshot::channel();
        self.cmd
            .send(make(reply))
            .await
            .map_err(|_| TransportError::closed())?;
        rx.await.unwrap_or_else(|_| Err(TransportError::closed()))
    }

    /// Measures liveness: resolves once the peer acknowledged a PING with
    /// the matching payload, fails if the connection dies first.
    pub async fn ping(&self) -> Result<(), TransportError> {
        self.roundtrip(|reply| Command::Ping { reply }).await
    }

    /// Opens a stream with an initial header list; the make-request
    /// primitive. `end_stream` marks a request without a body.
    pub async fn open_stream(
        &self,
        headers: Headers,
        end_stream: bool,
    ) -> Result<StreamHandle, TransportError> {
        self.roundtrip(|reply| Command::OpenStream {
            headers,
            end_stream,
            reply,
        })
        .await
    }

    /// Proposes local settings; resolves once the peer acks them, in order.
    pub async fn change_settings(
        &self,
        params: Vec<(SettingsParameter, u32)>,
    ) -> Result<(), TransportError> {
        self.roundtrip(|reply| Command::ChangeSettings { params, reply })
            .await
    }

    /// Graceful shutdown: GOAWAY with NO_ERROR, new streams refused in both
    /// directions, existing streams run to completion, then the duplex
    /// closes.
    pub async fn finish(&self) {
        self.cmd.send(Command::Finish).await.ok();
    }

    /// Forceful shutdown: every pending operation fails, the outbound side
    /// closes once flushed. This future always resolves.
    pub async fn terminate(&self) {
        let (done, rx) = oneshot::channel();
        if self.cmd.send(Command::Terminate { done }).await.is_ok() {
            rx.await.ok();
        }
    }
}

enum Tick {
    Inbound(Result<Option<Frame>, ConnectionError>),
    Command(Option<Command>),
}

/// Everything mutable about one connection, owned by a single task. All
/// callbacks (inbound frames, user commands) are serialized here, so none of
/// it needs a lock.
struct Driver<T> {
    allow_push: bool,
    state: ConnectionState,
    reader: FrameReader<ReadHalf<T>>,
    writer: FrameWriter<WriteHalf<T>>,
    hpack: HeaderCodec,
    settings: SettingsHandler,
    pings: PingHandler,
    defrag: Defragmenter,
    /// Connection-level credit for DATA we send.
    send_window: Window,
    /// Connection-level accounting for DATA we receive.
    recv_flow: RecvFlow,
    streams: StreamCoordinator,
    /// Streams with queued outbound work, drained FIFO.
    send_queue: VecDeque<NonZeroStreamId>,
    cmd_rx: mpsc::Receiver<Command>,
    cmd_tx: mpsc::Sender<Command>,
    accept_tx: mpsc::UnboundedSender<IncomingStream>,
    sent_goaway: bool,
    terminate_waiters: Vec<oneshot::Sender<()>>,
}

#[derive(Default)]
struct FlushPlan {
    frames: Vec<Frame>,
    done: Vec<Reply<()>>,
    closed: Vec<NonZeroStreamId>,
}

impl<T> Driver<T>
where
    T: AsyncRead + AsyncWrite + Send + 'static,
{
    async fn run(mut self) {
        if let Err(err) = self.handshake().await {
            self.fatal(err).await;
            return;
        }
        while self.state != ConnectionState::Terminated {
            if self.state == ConnectionState::Finishing && self.streams.is_empty() {
                debug!("all streams complete; closing");
                self.shutdown(ErrorType::NoError, false, Bytes::new()).await;
                break;
            }
            let tick = tokio::select! {
                frame = self.reader.read_frame() => Tick::Inbound(frame),
                cmd = self.cmd_rx.recv() => Tick::Command(cmd),
            };
            match tick {
                Tick::Inbound(Ok(Some(frame))) => {
                    if let Err(err) = self.dispatch(frame).await {
                        self.fatal(err).await;
                    }
                }
                Tick::Inbound(Ok(None)) => {
                    if self.state == ConnectionState::Finishing {
                        self.shutdown(ErrorType::NoError, false, Bytes::new()).await;
                    } else {
                        let eof = io::Error::new(
                            io::ErrorKind::UnexpectedEof,
                            "peer closed the connection",
                        );
                        self.fatal(ConnectionError::Transport(eof)).await;
                    }
                }
                Tick::Inbound(Err(err)) => self.fatal(err).await,
                Tick::Command(Some(cmd)) => {
                    if let Err(err) = self.handle_command(cmd).await {
                        self.fatal(err).await;
                    }
                }
                // unreachable while we hold a cmd_tx clone ourselves
                Tick::Command(None) => {}
            }
        }
    }

    async fn handshake(&mut self) -> Result<(), ConnectionError> {
        let initial = match self.streams.role() {
            Role::Client => {
                self.writer.write_preface().await?;
                if self.allow_push {
                    Vec::new()
                } else {
                    vec![(SettingsParameter::EnablePush, 0)]
                }
            }
            Role::Server => {
                self.reader.read_preface().await?;
                Vec::new()
            }
        };
        if let Some(frame) = self.settings.propose(initial, None) {
            self.writer.write_frame(&frame).await?;
        }
        Ok(())
    }

    // ===== inbound dispatch =====

    async fn dispatch(&mut self, frame: Frame) -> Result<(), ConnectionError> {
        if self.state == ConnectionState::Terminated {
            return Ok(());
        }
        if self.state == ConnectionState::Initialized {
            let valid = matches!(
                &frame,
                Frame::Settings { flags, .. } if !flags.contains(SettingsFlags::ACK)
            );
            if !valid {
                return Err(ConnectionError::Protocol("first frame must be SETTINGS"));
            }
            self.state = ConnectionState::Operational;
            debug!("connection operational");
        }

        let Some(frame) = self.defrag.accept(frame)? else {
            return Ok(());
        };

        // The shared decoder must see every header block in receive order,
        // even blocks on streams that end up ignored.
        let decoded = match &frame {
            Frame::Headers { fragment, .. } | Frame::PushPromise { fragment, .. } => {
                Some(self.hpack.decode(fragment)?)
            }
            _ => None,
        };

        match frame {
            Frame::Settings { flags, params } => self.on_settings(flags, &params).await,
            Frame::Ping { flags, payload } => {
                if flags.contains(PingFlags::ACK) {
                    self.pings.recv_ack(payload)
                } else {
                    self.writer.write_frame(&PingHandler::pong(payload)).await
                }
            }
            Frame::GoAway {
                last_stream,
                error,
                debug,
            } => {
                self.on_goaway(last_stream, error, &debug);
                Ok(())
            }
            Frame::WindowUpdate {
                stream: 0,
                increment,
            } => self.on_connection_window_update(increment).await,
            Frame::WindowUpdate { stream, increment } => {
                let Some(id) = NonZeroStreamId::new(stream) else {
                    return Ok(());
                };
                self.on_stream_window_update(id, increment).await
            }
            Frame::Data {
                stream,
                flags,
                data,
                pad,
            } => self.on_data(stream, flags, data, pad).await,
            Frame::Headers { stream, flags, .. } => {
                self.on_headers(stream, flags, decoded.unwrap_or_default())
                    .await
            }
            Frame::PushPromise {
                stream, promised, ..
            } => {
                self.on_push_promise(stream, promised, decoded.unwrap_or_default())
                    .await
            }
            Frame::ResetStream { stream, error } => self.on_reset(stream, error).await,
            Frame::Priority { stream, priority } => {
                trace!("ignoring PRIORITY on stream {}: {:?}", stream, priority);
                Ok(())
            }
            Frame::Continuation { .. } => Err(ConnectionError::Internal(
                "CONTINUATION escaped defragmentation",
            )),
            Frame::Unknown { typ, .. } => {
                trace!("ignoring unknown frame type {:#x}", typ);
                Ok(())
            }
        }
    }

    async fn on_settings(
        &mut self,
        flags: SettingsFlags,
        params: &[(SettingsParameter, u32)],
    ) -> Result<(), ConnectionError> {
        if flags.contains(SettingsFlags::ACK) {
            let applied = self.settings.recv_ack()?;
            if let Some(init) = applied.initial_window {
                self.streams.apply_local_initial_window(init)?;
            }
            if let Some(size) = applied.header_table_size {
                self.hpack.set_decoder_table_size(size);
            }
            if let Some(max) = applied.max_frame_size {
                self.reader.set_max_frame_size(max);
            }
            if let Some(max) = applied.max_header_list {
                self.defrag.set_max_block(max);
            }
            return Ok(());
        }

        let change = self.settings.recv_peer(params)?;
        // the ack goes out before any frame that depends on the new view
        self.writer
            .write_frame(&Frame::Settings {
                flags: SettingsFlags::ACK,
                params: Vec::new(),
            })
            .await?;
        if let Some(delta) = change.send_window_delta {
            self.streams.apply_send_window_delta(delta)?;
            if delta > 0 {
                self.rearm_pending();
                self.flush_data().await?;
            }
        }
        Ok(())
    }

    fn on_goaway(&mut self, last_stream: StreamId, code: ErrorType, debug_data: &Bytes) {
        warn!("peer going away: {:?}, last stream {}", code, last_stream);
        if !debug_data.is_empty() {
            if let Ok(text) = std::str::from_utf8(debug_data) {
                debug!("go away debug: {}", text);
            }
        }
        // passive finishing: no GOAWAY back; which streams to retry above
        // last_stream is the caller's business
        if self.state < ConnectionState::Finishing {
            self.state = ConnectionState::Finishing;
        }
    }

    async fn on_connection_window_update(
        &mut self,
        increment: u32,
    ) -> Result<(), ConnectionError> {
        if increment == 0 {
            return Err(ConnectionError::FlowControl(
                "WINDOW_UPDATE with zero increment",
            ));
        }
        self.send_window
            .increase(increment)
            .map_err(|_| ConnectionError::FlowControl("connection window overflow"))?;
        self.flush_data().await
    }

    async fn on_stream_window_update(
        &mut self,
        id: NonZeroStreamId,
        increment: u32,
    ) -> Result<(), ConnectionError> {
        match self.streams.classify(id)? {
            RouteClass::Closed => Ok(()),
            RouteClass::NewRemote => Err(ConnectionError::Protocol(
                "WINDOW_UPDATE on an idle stream",
            )),
            RouteClass::Live => {
                let armed = {
                    let Some(stream) = self.streams.get_mut(id) else {
                        return Ok(());
                    };
                    match stream.recv_window_update(increment) {
                        Err(err) => Err(err),
                        Ok(()) => {
                            let arm = !stream.pending_send.is_empty() && !stream.queued_for_send;
                            if arm {
                                stream.queued_for_send = true;
                            }
                            Ok(arm)
                        }
                    }
                };
                match armed {
                    Err(err) => self.on_stream_error(id, err).await,
                    Ok(arm) => {
                        if arm {
                            self.send_queue.push_back(id);
                        }
                        self.flush_data().await
                    }
                }
            }
        }
    }

    async fn on_data(
        &mut self,
        id: NonZeroStreamId,
        flags: DataFlags,
        data: Bytes,
        pad: u8,
    ) -> Result<(), ConnectionError> {
        let flow_len = data.len() as u32
            + if flags.contains(DataFlags::PADDED) {
                u32::from(pad) + 1
            } else {
                0
            };
        // connection-level accounting covers every DATA octet, including
        // frames for streams we no longer track
        let conn_increment = self.recv_flow.recv(flow_len).map_err(|_| {
            ConnectionError::FlowControl("connection flow-control window exceeded")
        })?;
        if let Some(increment) = conn_increment {
            self.writer
                .write_frame(&Frame::WindowUpdate {
                    stream: 0,
                    increment,
                })
                .await?;
        }

        match self.streams.classify(id)? {
            RouteClass::Closed => {
                trace!("discarding DATA for released stream {}", id);
                Ok(())
            }
            RouteClass::NewRemote => {
                Err(ConnectionError::Protocol("DATA on an idle stream"))
            }
            RouteClass::Live => {
                let end_stream = flags.contains(DataFlags::END_STREAM);
                let outcome = {
                    let Some(stream) = self.streams.get_mut(id) else {
                        return Ok(());
                    };
                    match stream.recv_data(flow_len, end_stream) {
                        Ok(increment) => {
                            stream.deliver(StreamEvent::Data { data, end_stream });
                            Ok((increment, stream.is_closed()))
                        }
                        Err(err) => Err(err),
                    }
                };
                match outcome {
                    Err(err) => self.on_stream_error(id, err).await,
                    Ok((increment, closed)) => {
                        if closed {
                            self.streams.close(id);
                        } else if let Some(increment) = increment {
                            self.writer
                                .write_frame(&Frame::WindowUpdate {
                                    stream: id.get(),
                                    increment,
                                })
                                .await?;
                        }
                        Ok(())
                    }
                }
            }
        }
    }

    async fn on_headers(
        &mut self,
        id: NonZeroStreamId,
        flags: HeadersFlags,
        headers: Headers,
    ) -> Result<(), ConnectionError> {
        let end_stream = flags.contains(HeadersFlags::END_STREAM);
        match self.streams.classify(id)? {
            RouteClass::Closed => {
                // decoded above for HPACK state; nothing else to do
                trace!("discarding HEADERS for released stream {}", id);
                Ok(())
            }
            RouteClass::Live => {
                let outcome = {
                    let Some(stream) = self.streams.get_mut(id) else {
                        return Ok(());
                    };
                    match stream.recv_headers(end_stream) {
                        Ok(is_trailers) => {
                            stream.deliver(if is_trailers {
                                StreamEvent::Trailers { headers }
                            } else {
                                StreamEvent::Headers {
                                    headers,
                                    end_stream,
                                }
                            });
                            Ok(stream.is_closed())
                        }
                        Err(err) => Err(err),
                    }
                };
                match outcome {
                    Err(err) => self.on_stream_error(id, err).await,
                    Ok(closed) => {
                        if closed {
                            self.streams.close(id);
                        }
                        Ok(())
                    }
                }
            }
            RouteClass::NewRemote => self.accept_remote_stream(id, end_stream, headers).await,
        }
    }

    /// A peer-initiated HEADERS on a fresh id: create the stream, or refuse.
    async fn accept_remote_stream(
        &mut self,
        id: NonZeroStreamId,
        end_stream: bool,
        headers: Headers,
    ) -> Result<(), ConnectionError> {
        if self.streams.role() == Role::Client {
            // servers initiate streams with PUSH_PROMISE only
            return Err(ConnectionError::Protocol(
                "server opened a stream with HEADERS",
            ));
        }
        if self.state == ConnectionState::Finishing
            || self.streams.remote_active() >= self.settings.local_max_concurrent()
        {
            self.streams.note_refused_remote(id);
            return self.send_reset(id, ErrorType::RefusedStream).await;
        }

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let stream = self.streams.open_remote(
            id,
            StreamState::Idle,
            self.settings.peer_initial_window(),
            self.settings.local_initial_window(),
            events_tx,
        );
        if let Err(err) = stream.recv_headers(end_stream) {
            // fresh stream; only an internal bug gets here
            match err {
                StreamError::Conn(err) => return Err(err),
                StreamError::Reset(code) => return self.send_reset(id, code).await,
            }
        }
        let incoming = IncomingStream {
            headers,
            end_stream,
            stream: StreamHandle {
                id,
                events: events_rx,
                cmd: self.cmd_tx.clone(),
            },
        };
        // a dropped acceptor just means nobody is listening
        self.accept_tx.send(incoming).ok();
        Ok(())
    }

    async fn on_push_promise(
        &mut self,
        parent: NonZeroStreamId,
        promised: NonZeroStreamId,
        headers: Headers,
    ) -> Result<(), ConnectionError> {
        if self.streams.role() == Role::Server {
            return Err(ConnectionError::Protocol("PUSH_PROMISE from a client"));
        }
        if !self.allow_push {
            return Err(ConnectionError::Protocol(
                "PUSH_PROMISE with push disabled",
            ));
        }
        if self.streams.classify(promised)? != RouteClass::NewRemote {
            return Err(ConnectionError::Protocol(
                "PUSH_PROMISE reuses a stream id",
            ));
        }
        match self.streams.classify(parent)? {
            RouteClass::NewRemote => {
                Err(ConnectionError::Protocol("PUSH_PROMISE on an idle stream"))
            }
            RouteClass::Closed => {
                // parent is gone; refuse the reservation
                self.streams.note_refused_remote(promised);
                self.send_reset(promised, ErrorType::RefusedStream).await
            }
            RouteClass::Live => {
                let parent_ok = {
                    let Some(stream) = self.streams.get_mut(parent) else {
                        return Ok(());
                    };
                    stream.recv_push_promise()
                };
                if let Err(err) = parent_ok {
                    return self.on_stream_error(parent, err).await;
                }
                if self.state == ConnectionState::Finishing {
                    self.streams.note_refused_remote(promised);
                    return self.send_reset(promised, ErrorType::RefusedStream).await;
                }
                let (events_tx, events_rx) = mpsc::unbounded_channel();
                self.streams.open_remote(
                    promised,
                    StreamState::ReservedRemote,
                    self.settings.peer_initial_window(),
                    self.settings.local_initial_window(),
                    events_tx,
                );
                let incoming = IncomingStream {
                    // a promised request carries no body
                    headers,
                    end_stream: true,
                    stream: StreamHandle {
                        id: promised,
                        events: events_rx,
                        cmd: self.cmd_tx.clone(),
                    },
                };
                self.accept_tx.send(incoming).ok();
                Ok(())
            }
        }
    }

    async fn on_reset(
        &mut self,
        id: NonZeroStreamId,
        error: ErrorType,
    ) -> Result<(), ConnectionError> {
        match self.streams.classify(id)? {
            RouteClass::Closed => Ok(()),
            RouteClass::NewRemote => {
                Err(ConnectionError::Protocol("RST_STREAM on an idle stream"))
            }
            RouteClass::Live => {
                if let Some(stream) = self.streams.get_mut(id) {
                    stream.abort(error, &TransportError::StreamClosed);
                }
                self.streams.close(id);
                Ok(())
            }
        }
    }

    /// Stream-scoped violations become RST_STREAM; connection-scoped ones
    /// escalate to the caller.
    async fn on_stream_error(
        &mut self,
        id: NonZeroStreamId,
        err: StreamError,
    ) -> Result<(), ConnectionError> {
        match err {
            StreamError::Conn(err) => Err(err),
            StreamError::Reset(code) => {
                if let Some(stream) = self.streams.get_mut(id) {
                    stream.abort(code, &TransportError::StreamClosed);
                }
                self.streams.close(id);
                self.send_reset(id, code).await
            }
        }
    }

    async fn send_reset(
        &mut self,
        id: NonZeroStreamId,
        error: ErrorType,
    ) -> Result<(), ConnectionError> {
        self.writer
            .write_frame(&Frame::ResetStream { stream: id, error })
            .await
    }

    // ===== user commands =====

    async fn handle_command(&mut self, cmd: Command) -> Result<(), ConnectionError> {
        match cmd {
            Command::Ping { reply } => {
                if let Some(frame) = self.pings.start(reply) {
                    self.writer.write_frame(&frame).await?;
                }
                Ok(())
            }
            Command::OpenStream {
                headers,
                end_stream,
                reply,
            } => self.open_local_stream(headers, end_stream, reply).await,
            Command::ChangeSettings { params, reply } => {
                if let Some(frame) = self.settings.propose(params, Some(reply)) {
                    self.writer.write_frame(&frame).await?;
                }
                Ok(())
            }
            Command::SendData {
                stream,
                data,
                end_stream,
                reply,
            } => {
                let queued = {
                    let Some(stream) = self.streams.get_mut(stream) else {
                        let _ = reply.send(Err(TransportError::StreamClosed));
                        return Ok(());
                    };
                    if !stream.can_send_data() {
                        let _ = reply.send(Err(TransportError::StreamClosed));
                        return Ok(());
                    }
                    if end_stream {
                        stream.mark_outbound_closing();
                    }
                    stream.pending_send.push_back(PendingSend::Data {
                        data,
                        end_stream,
                        reply: Some(reply),
                    });
                    let arm = !stream.queued_for_send;
                    if arm {
                        stream.queued_for_send = true;
                    }
                    arm
                };
                if queued {
                    self.send_queue.push_back(stream);
                }
                self.flush_data().await
            }
            Command::SendHeaders {
                stream,
                headers,
                end_stream,
                reply,
            } => self.send_local_headers(stream, headers, end_stream, reply).await,
            Command::Push {
                parent,
                headers,
                reply,
            } => self.push_local_stream(parent, headers, reply).await,
            Command::ResetStream { stream, error } => {
                let existed = match self.streams.get_mut(stream) {
                    Some(s) => {
                        s.abort(error, &TransportError::StreamClosed);
                        true
                    }
                    None => false,
                };
                if existed {
                    self.streams.close(stream);
                    self.send_reset(stream, error).await?;
                }
                Ok(())
            }
            Command::Finish => self.begin_finish().await,
            Command::Terminate { done } => {
                self.terminate_waiters.push(done);
                self.shutdown(ErrorType::NoError, true, Bytes::new()).await;
                Ok(())
            }
        }
    }

    async fn open_local_stream(
        &mut self,
        headers: Headers,
        end_stream: bool,
        reply: Reply<StreamHandle>,
    ) -> Result<(), ConnectionError> {
        match self.state {
            ConnectionState::Initialized => {
                let _ = reply.send(Err(TransportError::NotReady));
                return Ok(());
            }
            ConnectionState::Finishing | ConnectionState::Terminated => {
                let _ = reply.send(Err(TransportError::GoingAway));
                return Ok(());
            }
            ConnectionState::Operational => {}
        }
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let id = match self.streams.open_local(
            self.settings.peer_max_concurrent(),
            self.settings.peer_initial_window(),
            self.settings.local_initial_window(),
            events_tx,
        ) {
            Ok(id) => id,
            Err(err) => {
                let _ = reply.send(Err(err));
                return Ok(());
            }
        };
        let fragment = self.hpack.encode(&headers);
        if let Some(stream) = self.streams.get_mut(id) {
            if let Err(err) = stream.send_headers(end_stream) {
                let _ = reply.send(Err(err));
                self.streams.close(id);
                return Ok(());
            }
        }
        let frames = header_frames(
            id,
            fragment,
            end_stream,
            self.settings.peer_max_frame_size() as usize,
        );
        for frame in &frames {
            self.writer.write_frame(frame).await?;
        }
        let _ = reply.send(Ok(StreamHandle {
            id,
            events: events_rx,
            cmd: self.cmd_tx.clone(),
        }));
        Ok(())
    }

    async fn send_local_headers(
        &mut self,
        id: NonZeroStreamId,
        headers: Headers,
        end_stream: bool,
        reply: Reply<()>,
    ) -> Result<(), ConnectionError> {
        enum Action {
            Arm,
            Queued,
            Write { fragment: Bytes, reply: Reply<()>, closed: bool },
        }

        let fragment = self.hpack.encode(&headers);
        let action = {
            let Some(stream) = self.streams.get_mut(id) else {
                let _ = reply.send(Err(TransportError::StreamClosed));
                return Ok(());
            };
            if !stream.pending_send.is_empty() {
                // trailers wait their turn behind queued data
                if !end_stream {
                    let _ = reply.send(Err(TransportError::StreamClosed));
                    return Ok(());
                }
                stream.mark_outbound_closing();
                stream.pending_send.push_back(PendingSend::Trailers {
                    fragment,
                    reply: Some(reply),
                });
                if stream.queued_for_send {
                    Action::Queued
                } else {
                    stream.queued_for_send = true;
                    Action::Arm
                }
            } else {
                match stream.send_headers(end_stream) {
                    Err(err) => {
                        let _ = reply.send(Err(err));
                        return Ok(());
                    }
                    Ok(()) => Action::Write {
                        fragment,
                        reply,
                        closed: stream.is_closed(),
                    },
                }
            }
        };
        match action {
            Action::Arm => {
                self.send_queue.push_back(id);
                Ok(())
            }
            Action::Queued => Ok(()),
            Action::Write {
                fragment,
                reply,
                closed,
            } => {
                let frames = header_frames(
                    id,
                    fragment,
                    end_stream,
                    self.settings.peer_max_frame_size() as usize,
                );
                for frame in &frames {
                    self.writer.write_frame(frame).await?;
                }
                let _ = reply.send(Ok(()));
                if closed {
                    self.streams.close(id);
                }
                Ok(())
            }
        }
    }

    async fn push_local_stream(
        &mut self,
        parent: NonZeroStreamId,
        headers: Headers,
        reply: Reply<StreamHandle>,
    ) -> Result<(), ConnectionError> {
        if self.streams.role() != Role::Server || !self.settings.peer_push_enabled() {
            let _ = reply.send(Err(TransportError::PushDisabled));
            return Ok(());
        }
        if self.state != ConnectionState::Operational {
            let _ = reply.send(Err(TransportError::GoingAway));
            return Ok(());
        }
        let parent_ok = self
            .streams
            .get_mut(parent)
            .map(|stream| stream.can_push())
            .unwrap_or(false);
        if !parent_ok {
            let _ = reply.send(Err(TransportError::StreamClosed));
            return Ok(());
        }
        let fragment = self.hpack.encode(&headers);
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let promised = match self.streams.reserve_local(
            self.settings.peer_initial_window(),
            self.settings.local_initial_window(),
            events_tx,
        ) {
            Ok(id) => id,
            Err(err) => {
                let _ = reply.send(Err(err));
                return Ok(());
            }
        };
        let frames = push_promise_frames(
            parent,
            promised,
            fragment,
            self.settings.peer_max_frame_size() as usize,
        );
        for frame in &frames {
            self.writer.write_frame(frame).await?;
        }
        let _ = reply.send(Ok(StreamHandle {
            id: promised,
            events: events_rx,
            cmd: self.cmd_tx.clone(),
        }));
        Ok(())
    }

    async fn begin_finish(&mut self) -> Result<(), ConnectionError> {
        if self.state >= ConnectionState::Finishing {
            return Ok(());
        }
        self.state = ConnectionState::Finishing;
        debug!("finishing; new streams refused");
        self.send_goaway(ErrorType::NoError, Bytes::new()).await
    }

    async fn send_goaway(&mut self, code: ErrorType, debug_data: Bytes) -> Result<(), ConnectionError> {
        if self.sent_goaway {
            return Ok(());
        }
        self.sent_goaway = true;
        self.writer
            .write_frame(&Frame::GoAway {
                last_stream: self.streams.highest_remote(),
                error: code,
                debug: debug_data,
            })
            .await
    }

    // ===== outbound data queue =====

    /// Splits queued DATA against connection credit, stream credit, and the
    /// peer's MAX_FRAME_SIZE. Connection starvation parks the whole FIFO;
    /// stream starvation parks just that stream until its WINDOW_UPDATE.
    fn plan_flush(&mut self) -> FlushPlan {
        let mut plan = FlushPlan::default();
        let max_frame = self.settings.peer_max_frame_size();
        'streams: while let Some(id) = self.send_queue.pop_front() {
            let Some(stream) = self.streams.get_mut(id) else {
                continue;
            };
            stream.queued_for_send = false;
            loop {
                match stream.pending_send.pop_front() {
                    None => break,
                    Some(PendingSend::Trailers { fragment, reply }) => {
                        match stream.send_headers(true) {
                            Ok(()) => {
                                plan.frames.extend(header_frames(
                                    id,
                                    fragment,
                                    true,
                                    max_frame as usize,
                                ));
                                if let Some(reply) = reply {
                                    plan.done.push(reply);
                                }
                            }
                            Err(err) => {
                                if let Some(reply) = reply {
                                    let _ = reply.send(Err(err));
                                }
                            }
                        }
                    }
                    Some(PendingSend::Data {
                        mut data,
                        end_stream,
                        reply,
                    }) => {
                        if data.is_empty() {
                            plan.frames.push(Frame::Data {
                                stream: id,
                                flags: end_flags(end_stream),
                                data,
                                pad: 0,
                            });
                            if end_stream {
                                stream.sent_end_stream();
                            }
                            if let Some(reply) = reply {
                                plan.done.push(reply);
                            }
                            continue;
                        }
                        loop {
                            if self.send_window.available() == 0 {
                                stream.pending_send.push_front(PendingSend::Data {
                                    data,
                                    end_stream,
                                    reply,
                                });
                                stream.queued_for_send = true;
                                self.send_queue.push_front(id);
                                break 'streams;
                            }
                            if stream.send_window.available() == 0 {
                                stream.pending_send.push_front(PendingSend::Data {
                                    data,
                                    end_stream,
                                    reply,
                                });
                                continue 'streams;
                            }
                            let quota = self
                                .send_window
                                .available()
                                .min(stream.send_window.available())
                                .min(max_frame)
                                .min(data.len() as u32);
                            let chunk = data.split_to(quota as usize);
                            self.send_window.consume(quota);
                            stream.send_window.consume(quota);
                            let last = data.is_empty();
                            plan.frames.push(Frame::Data {
                                stream: id,
                                flags: end_flags(last && end_stream),
                                data: chunk,
                                pad: 0,
                            });
                            if last {
                                if end_stream {
                                    stream.sent_end_stream();
                                }
                                if let Some(reply) = reply {
                                    plan.done.push(reply);
                                }
                                break;
                            }
                        }
                    }
                }
            }
            if stream.is_closed() {
                plan.closed.push(id);
            }
        }
        plan
    }

    async fn flush_data(&mut self) -> Result<(), ConnectionError> {
        let plan = self.plan_flush();
        for frame in &plan.frames {
            self.writer.write_frame(frame).await?;
        }
        for reply in plan.done {
            let _ = reply.send(Ok(()));
        }
        for id in plan.closed {
            self.streams.close(id);
        }
        Ok(())
    }

    /// Re-arms every stream with queued sends; used after a positive
    /// INITIAL_WINDOW_SIZE delta may have unblocked them.
    fn rearm_pending(&mut self) {
        for id in self.streams.ids_with_pending_sends() {
            if let Some(stream) = self.streams.get_mut(id) {
                stream.queued_for_send = true;
            }
            self.send_queue.push_back(id);
        }
    }

    // ===== termination =====

    async fn fatal(&mut self, err: ConnectionError) {
        // "already terminated" is swallowed, never escalated
        if matches!(err, ConnectionError::Terminated) {
            return;
        }
        if self.state == ConnectionState::Terminated {
            return;
        }
        error!("connection error: {}", err);
        let code = err.goaway_code();
        // a dead wire gets no GOAWAY
        let emit_goaway = !matches!(err, ConnectionError::Transport(_));
        let debug_data = Bytes::from(err.to_string());
        self.shutdown(code, emit_goaway, debug_data).await;
    }

    async fn shutdown(&mut self, code: ErrorType, emit_goaway: bool, debug_data: Bytes) {
        if self.state == ConnectionState::Terminated {
            for waiter in self.terminate_waiters.drain(..) {
                let _ = waiter.send(());
            }
            return;
        }
        self.state = ConnectionState::Terminated;
        debug!("terminated: {:?}", code);
        if emit_goaway {
            self.send_goaway(code, debug_data).await.ok();
        }
        self.writer.shutdown().await.ok();
        let err = TransportError::Terminated(code);
        self.pings.shutdown(&err);
        self.settings.shutdown(&err);
        self.streams.shutdown(code, &err);
        self.send_queue.clear();
        // commands already queued behind the shutdown fail with the same code
        while let Ok(cmd) = self.cmd_rx.try_recv() {
            fail_command(cmd, &err);
        }
        for waiter in self.terminate_waiters.drain(..) {
            let _ = waiter.send(());
        }
    }
}

fn fail_command(cmd: Command, err: &TransportError) {
    match cmd {
        Command::Ping { reply }
        | Command::ChangeSettings { reply, .. }
        | Command::SendData { reply, .. }
        | Command::SendHeaders { reply, .. } => {
            let _ = reply.send(Err(err.clone()));
        }
        Command::OpenStream { reply, .. } | Command::Push { reply, .. } => {
            let _ = reply.send(Err(err.clone()));
        }
        Command::ResetStream { .. } | Command::Finish => {}
        Command::Terminate { done } => {
            let _ = done.send(());
        }
    }
}

fn end_flags(end_stream: bool) -> DataFlags {
    if end_stream {
        DataFlags::END_STREAM
    } else {
        DataFlags::empty()
    }
}

/// Builds a HEADERS frame, split into HEADERS + CONTINUATION against the
/// peer's MAX_FRAME_SIZE when the encoded block is too long for one frame.
fn header_frames(
    stream: NonZeroStreamId,
    mut fragment: Bytes,
    end_stream: bool,
    max_frame: usize,
) -> Vec<Frame> {
    let stream_flags = if end_stream {
        HeadersFlags::END_STREAM
    } else {
        HeadersFlags::empty()
    };
    if fragment.len() <= max_frame {
        return vec![Frame::Headers {
            stream,
            flags: stream_flags | HeadersFlags::END_HEADERS,
            priority: None,
            fragment,
        }];
    }
    let mut frames = vec![Frame::Headers {
        stream,
        flags: stream_flags,
        priority: None,
        fragment: fragment.split_to(max_frame),
    }];
    while fragment.len() > max_frame {
        frames.push(Frame::Continuation {
            stream,
            flags: ContinuationFlags::empty(),
            fragment: fragment.split_to(max_frame),
        });
    }
    frames.push(Frame::Continuation {
        stream,
        flags: ContinuationFlags::END_HEADERS,
        fragment,
    });
    frames
}

/// Same splitting for PUSH_PROMISE; the promised-id field eats 4 octets of
/// the first frame's budget.
fn push_promise_frames(
    stream: NonZeroStreamId,
    promised: NonZeroStreamId,
    mut fragment: Bytes,
    max_frame: usize,
) -> Vec<Frame> {
    let first_budget = max_frame.saturating_sub(4);
    if fragment.len() <= first_budget {
        return vec![Frame::PushPromise {
            stream,
            flags: PushPromiseFlags::END_HEADERS,
            promised,
            fragment,
        }];
    }
    let mut frames = vec![Frame::PushPromise {
        stream,
        flags: PushPromiseFlags::empty(),
        promised,
        fragment: fragment.split_to(first_budget),
    }];
    while fragment.len() > max_frame {
        frames.push(Frame::Continuation {
            stream,
            flags: ContinuationFlags::empty(),
            fragment: fragment.split_to(max_frame),
        });
    }
    frames.push(Frame::Continuation {
        stream,
        flags: ContinuationFlags::END_HEADERS,
        fragment,
    });
    frames
}
