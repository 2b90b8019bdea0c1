use crate::{
    error::{ConnectionError, TransportError},
    stream::{Stream, StreamEvent, StreamState},
    types::*,
};
use log::trace;
use std::collections::HashMap;
use tokio::sync::mpsc;

/// Which side of the connection we are. Fixed at construction; decides
/// stream-id parity and who owns the preface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Client,
    Server,
}

impl Role {
    fn first_local_id(self) -> u32 {
        match self {
            Role::Client => 1,
            Role::Server => 2,
        }
    }

    /// Whether `id` has the parity of streams this endpoint initiates.
    fn initiates(self, id: NonZeroStreamId) -> bool {
        (id.get() % 2 == 1) == matches!(self, Role::Client)
    }
}

/// Where a stream-addressed frame should go.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RouteClass {
    /// A live stream; look it up with `get_mut`.
    Live,
    /// A stream that once existed and was released; frames are ignored.
    Closed,
    /// A peer-initiated id above everything seen so far.
    NewRemote,
}

/// Owns every stream on the connection: id allocation, routing, lifecycle
/// bookkeeping, and the highest peer-initiated id needed for GOAWAY.
pub(crate) struct StreamCoordinator {
    role: Role,
    streams: HashMap<NonZeroStreamId, Stream>,
    next_local: u64,
    highest_remote: StreamId,
    local_active: u32,
    remote_active: u32,
}

impl StreamCoordinator {
    pub(crate) fn new(role: Role) -> Self {
        Self {
            role,
            streams: HashMap::new(),
            next_local: u64::from(role.first_local_id()),
            highest_remote: 0,
            local_active: 0,
            remote_active: 0,
        }
    }

    pub(crate) fn role(&self) -> Role {
        self.role
    }

    /// Highest peer-initiated stream id we have acknowledged; the
    /// `last-stream-id` of any GOAWAY we send.
    pub(crate) fn highest_remote(&self) -> StreamId {
        self.highest_remote
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.streams.is_empty()
    }

    pub(crate) fn remote_active(&self) -> u32 {
        self.remote_active
    }

    pub(crate) fn get_mut(&mut self, id: NonZeroStreamId) -> Option<&mut Stream> {
        self.streams.get_mut(&id)
    }

    /// Classifies a stream-addressed frame's target. Peer-initiated ids must
    /// be strictly increasing; a frame on a local-parity id we never opened
    /// is a protocol error.
    pub(crate) fn classify(&self, id: NonZeroStreamId) -> Result<RouteClass, ConnectionError> {
        if self.streams.contains_key(&id) {
            return Ok(RouteClass::Live);
        }
        if self.role.initiates(id) {
            if u64::from(id.get()) < self.next_local {
                Ok(RouteClass::Closed)
            } else {
                Err(ConnectionError::Protocol(
                    "frame on a local stream that was never opened",
                ))
            }
        } else if id.get() <= self.highest_remote {
            Ok(RouteClass::Closed)
        } else {
            Ok(RouteClass::NewRemote)
        }
    }

    /// Allocates the next local stream id and registers the stream in Idle,
    /// enforcing the peer's concurrency limit.
    pub(crate) fn open_local(
        &mut self,
        peer_max_concurrent: u32,
        send_init: u32,
        recv_init: u32,
        events: mpsc::UnboundedSender<StreamEvent>,
    ) -> Result<NonZeroStreamId, TransportError> {
        if self.local_active >= peer_max_concurrent {
            return Err(TransportError::TooManyStreams);
        }
        let id = self.allocate_local()?;
        self.streams.insert(
            id,
            Stream::new(id, StreamState::Idle, send_init, recv_init, events),
        );
        self.local_active += 1;
        Ok(id)
    }

    /// Registers a locally reserved push stream. Reservations are not held
    /// against MAX_CONCURRENT_STREAMS until they activate.
    pub(crate) fn reserve_local(
        &mut self,
        send_init: u32,
        recv_init: u32,
        events: mpsc::UnboundedSender<StreamEvent>,
    ) -> Result<NonZeroStreamId, TransportError> {
        let id = self.allocate_local()?;
        self.streams.insert(
            id,
            Stream::new(id, StreamState::ReservedLocal, send_init, recv_init, events),
        );
        self.local_active += 1;
        Ok(id)
    }

    fn allocate_local(&mut self) -> Result<NonZeroStreamId, TransportError> {
        if self.next_local > u64::from(U31_MAX) {
            return Err(TransportError::IdsExhausted);
        }
        let id =
            NonZeroStreamId::new(self.next_local as u32).ok_or(TransportError::IdsExhausted)?;
        self.next_local += 2;
        Ok(id)
    }

    /// Registers a peer-initiated stream after `route` returned `NewRemote`.
    pub(crate) fn open_remote(
        &mut self,
        id: NonZeroStreamId,
        state: StreamState,
        send_init: u32,
        recv_init: u32,
        events: mpsc::UnboundedSender<StreamEvent>,
    ) -> &mut Stream {
        debug_assert!(!self.role.initiates(id));
        debug_assert!(id.get() > self.highest_remote);
        self.highest_remote = id.get();
        self.remote_active += 1;
        self.streams
            .entry(id)
            .or_insert_with(|| Stream::new(id, state, send_init, recv_init, events))
    }

    /// Remembers a promised id we refused, so monotonicity checks still hold.
    pub(crate) fn note_refused_remote(&mut self, id: NonZeroStreamId) {
        self.highest_remote = self.highest_remote.max(id.get());
    }

    /// Releases a terminal stream: the id is gone, late frames for it are
    /// ignored, and its concurrency slot frees up.
    pub(crate) fn close(&mut self, id: NonZeroStreamId) {
        if self.streams.remove(&id).is_some() {
            trace!("stream {} released", id);
            if self.role.initiates(id) {
                self.local_active = self.local_active.saturating_sub(1);
            } else {
                self.remote_active = self.remote_active.saturating_sub(1);
            }
        }
    }

    /// Applies a peer INITIAL_WINDOW_SIZE delta to every live stream's send
    /// window. Overflow on any stream kills the connection.
    pub(crate) fn apply_send_window_delta(&mut self, delta: i64) -> Result<(), ConnectionError> {
        for stream in self.streams.values_mut() {
            stream.send_window.adjust(delta).map_err(|_| {
                ConnectionError::FlowControl("INITIAL_WINDOW_SIZE change overflows a stream window")
            })?;
        }
        Ok(())
    }

    /// Applies our acknowledged INITIAL_WINDOW_SIZE to every live stream's
    /// receive accounting.
    pub(crate) fn apply_local_initial_window(&mut self, init: u32) -> Result<(), ConnectionError> {
        for stream in self.streams.values_mut() {
            stream.recv_flow.set_init(init).map_err(|_| {
                ConnectionError::FlowControl("INITIAL_WINDOW_SIZE change overflows a stream window")
            })?;
        }
        Ok(())
    }

    /// Stream ids that have queued sends, for re-arming the flush FIFO.
    pub(crate) fn ids_with_pending_sends(&self) -> Vec<NonZeroStreamId> {
        self.streams
            .values()
            .filter(|stream| !stream.pending_send.is_empty() && !stream.queued_for_send)
            .map(|stream| stream.id)
            .collect()
    }

    /// Tears every stream down; used at termination.
    pub(crate) fn shutdown(&mut self, code: ErrorType, err: &TransportError) {
        for (_, mut stream) in self.streams.drain() {
            stream.abort(code, err);
        }
        self.local_active = 0;
        self.remote_active = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn events() -> mpsc::UnboundedSender<StreamEvent> {
        mpsc::unbounded_channel().0
    }

    #[test]
    fn local_ids_are_monotonic_with_parity() {
        let mut streams = StreamCoordinator::new(Role::Client);
        let a = streams.open_local(u32::MAX, 100, 100, events()).unwrap();
        let b = streams.open_local(u32::MAX, 100, 100, events()).unwrap();
        assert_eq!(a.get(), 1);
        assert_eq!(b.get(), 3);

        let mut streams = StreamCoordinator::new(Role::Server);
        let a = streams.reserve_local(100, 100, events()).unwrap();
        assert_eq!(a.get(), 2);
    }

    #[test]
    fn concurrency_limit_applies_to_local_opens() {
        let mut streams = StreamCoordinator::new(Role::Client);
        streams.open_local(1, 100, 100, events()).unwrap();
        assert_eq!(
            streams.open_local(1, 100, 100, events()).unwrap_err(),
            TransportError::TooManyStreams
        );
    }

    #[test]
    fn remote_ids_below_high_water_mark_are_closed() {
        let mut streams = StreamCoordinator::new(Role::Server);
        let id = NonZeroStreamId::new(5).unwrap();
        assert_eq!(streams.classify(id).unwrap(), RouteClass::NewRemote);
        streams.open_remote(id, StreamState::Idle, 100, 100, events());
        assert_eq!(streams.classify(id).unwrap(), RouteClass::Live);
        streams.close(id);
        assert_eq!(streams.classify(id).unwrap(), RouteClass::Closed);
        let lower = NonZeroStreamId::new(3).unwrap();
        assert_eq!(streams.classify(lower).unwrap(), RouteClass::Closed);
        let higher = NonZeroStreamId::new(7).unwrap();
        assert_eq!(streams.classify(higher).unwrap(), RouteClass::NewRemote);
    }

    #[test]
    fn frame_on_unopened_local_id_is_protocol_error() {
        let streams = StreamCoordinator::new(Role::Client);
        let id = NonZeroStreamId::new(9).unwrap();
        assert!(matches!(
            streams.classify(id),
            Err(ConnectionError::Protocol(_))
        ));
    }

    #[test]
    fn goaway_high_water_mark_tracks_remote_opens() {
        let mut streams = StreamCoordinator::new(Role::Server);
        assert_eq!(streams.highest_remote(), 0);
        let id = NonZeroStreamId::new(7).unwrap();
        streams.open_remote(id, StreamState::Idle, 100, 100, events());
        assert_eq!(streams.highest_remote(), 7);
    }
}
