use crate::{
    error::{ConnectionError, TransportError},
    flags::PingFlags,
    frame::Frame,
};
use log::trace;
use std::collections::HashMap;
use tokio::sync::oneshot;

/// In-flight pings we will track at once; one more fails immediately rather
/// than dropping silently.
const MAX_IN_FLIGHT: usize = 32;

/// Tracks pings we initiated and answers pings from the peer.
/// https://httpwg.org/specs/rfc7540.html#PING
///
/// Payloads come from a monotonic counter, so duplicates cannot occur and an
/// inbound ack either matches exactly one pending ping or is a protocol
/// error.
pub(crate) struct PingHandler {
    pending: HashMap<[u8; 8], oneshot::Sender<Result<(), TransportError>>>,
    next_payload: u64,
}

impl PingHandler {
    pub(crate) fn new() -> Self {
        Self {
            pending: HashMap::new(),
            next_payload: 0,
        }
    }

    /// Registers a ping and returns the frame to write, or fails the reply
    /// if the in-flight window is full.
    pub(crate) fn start(
        &mut self,
        reply: oneshot::Sender<Result<(), TransportError>>,
    ) -> Option<Frame> {
        if self.pending.len() >= MAX_IN_FLIGHT {
            let _ = reply.send(Err(TransportError::TooManyPings));
            return None;
        }
        let payload = self.next_payload.to_be_bytes();
        self.next_payload += 1;
        self.pending.insert(payload, reply);
        Some(Frame::Ping {
            flags: PingFlags::empty(),
            payload,
        })
    }

    /// The ack for an inbound non-ack PING: identical payload, ACK set.
    pub(crate) fn pong(payload: [u8; 8]) -> Frame {
        Frame::Ping {
            flags: PingFlags::ACK,
            payload,
        }
    }

    /// Resolves the pending ping matching an inbound ack.
    pub(crate) fn recv_ack(&mut self, payload: [u8; 8]) -> Result<(), ConnectionError> {
        match self.pending.remove(&payload) {
            Some(reply) => {
                trace!("ping {:?} acknowledged", payload);
                let _ = reply.send(Ok(()));
                Ok(())
            }
            None => Err(ConnectionError::Protocol("PING ack with unknown payload")),
        }
    }

    /// Fails every pending ping; used at termination.
    pub(crate) fn shutdown(&mut self, err: &TransportError) {
        for (_, reply) in self.pending.drain() {
            let _ = reply.send(Err(err.clone()));
        }
    }
}
