use crate::{
    error::{ConnectionError, TransportError},
    flags::SettingsFlags,
    frame::Frame,
    types::{SettingsParameter, U31_MAX},
};
use enum_map::{enum_map, EnumMap};
use log::debug;
use std::collections::VecDeque;
use tokio::sync::oneshot;

pub(crate) const DEFAULT_INITIAL_WINDOW_SIZE: u32 = 65_535;
pub(crate) const DEFAULT_MAX_FRAME_SIZE: u32 = 16_384;
pub(crate) const MAX_MAX_FRAME_SIZE: u32 = 16_777_215;

/// https://httpwg.org/specs/rfc7540.html#SettingValues
fn defaults() -> EnumMap<SettingsParameter, u32> {
    enum_map! {
        SettingsParameter::HeaderTableSize => 4_096,
        SettingsParameter::EnablePush => 1,
        SettingsParameter::MaxConcurrentStreams => u32::MAX,
        SettingsParameter::InitialWindowSize => DEFAULT_INITIAL_WINDOW_SIZE,
        SettingsParameter::MaxFrameSize => DEFAULT_MAX_FRAME_SIZE,
        SettingsParameter::MaxHeaderListSize => u32::MAX,
    }
}

/// Effects of a peer SETTINGS frame the controller must propagate.
#[derive(Debug)]
pub(crate) struct PeerChange {
    /// Delta to apply to every open stream's send window.
    pub(crate) send_window_delta: Option<i64>,
}

/// Effects of an acknowledged local proposal.
#[derive(Default, Debug)]
pub(crate) struct AppliedChange {
    /// New initial window for per-stream receive accounting.
    pub(crate) initial_window: Option<u32>,
    /// New bound for the HPACK decoder's dynamic table.
    pub(crate) header_table_size: Option<u32>,
    /// New bound for inbound frame payloads.
    pub(crate) max_frame_size: Option<u32>,
    /// New bound for reassembled header blocks.
    pub(crate) max_header_list: Option<u32>,
}

type AckReply = oneshot::Sender<Result<(), TransportError>>;

struct PendingChange {
    params: Vec<(SettingsParameter, u32)>,
    reply: Option<AckReply>,
}

/// The settings handshake. https://httpwg.org/specs/rfc7540.html#SETTINGS
///
/// Two independent views: `acknowledged` is what the peer has promised to
/// obey when sending to us (our settings, once acked); `peer` is what we
/// must obey when sending to the peer. Local proposals sit in a FIFO until
/// the peer acks them, in order.
pub(crate) struct SettingsHandler {
    acknowledged: EnumMap<SettingsParameter, u32>,
    peer: EnumMap<SettingsParameter, u32>,
    pending: VecDeque<PendingChange>,
}

impl SettingsHandler {
    pub(crate) fn new() -> Self {
        Self {
            acknowledged: defaults(),
            peer: defaults(),
            pending: VecDeque::new(),
        }
    }

    pub(crate) fn peer_max_frame_size(&self) -> u32 {
        self.peer[SettingsParameter::MaxFrameSize]
    }

    pub(crate) fn peer_initial_window(&self) -> u32 {
        self.peer[SettingsParameter::InitialWindowSize]
    }

    pub(crate) fn peer_max_concurrent(&self) -> u32 {
        self.peer[SettingsParameter::MaxConcurrentStreams]
    }

    pub(crate) fn peer_push_enabled(&self) -> bool {
        self.peer[SettingsParameter::EnablePush] == 1
    }

    pub(crate) fn local_initial_window(&self) -> u32 {
        self.acknowledged[SettingsParameter::InitialWindowSize]
    }

    pub(crate) fn local_max_concurrent(&self) -> u32 {
        self.acknowledged[SettingsParameter::MaxConcurrentStreams]
    }

    /// Registers a local proposal and returns the SETTINGS frame to write.
    /// Illegal values fail the reply without touching the wire.
    pub(crate) fn propose(
        &mut self,
        params: Vec<(SettingsParameter, u32)>,
        reply: Option<AckReply>,
    ) -> Option<Frame> {
        if validate(&params).is_err() {
            if let Some(reply) = reply {
                let _ = reply.send(Err(TransportError::InvalidSetting));
            }
            return None;
        }
        let frame = Frame::Settings {
            flags: SettingsFlags::empty(),
            params: params.clone(),
        };
        self.pending.push_back(PendingChange { params, reply });
        Some(frame)
    }

    /// Promotes the oldest pending proposal on an inbound SETTINGS ack.
    pub(crate) fn recv_ack(&mut self) -> Result<AppliedChange, ConnectionError> {
        let Some(change) = self.pending.pop_front() else {
            return Err(ConnectionError::Protocol(
                "SETTINGS ack without a pending change",
            ));
        };
        let mut applied = AppliedChange::default();
        for &(param, value) in &change.params {
            self.acknowledged[param] = value;
            match param {
                SettingsParameter::InitialWindowSize => applied.initial_window = Some(value),
                SettingsParameter::HeaderTableSize => applied.header_table_size = Some(value),
                SettingsParameter::MaxFrameSize => applied.max_frame_size = Some(value),
                SettingsParameter::MaxHeaderListSize => applied.max_header_list = Some(value),
                _ => {}
            }
        }
        debug!("local settings acknowledged: {:?}", change.params);
        if let Some(reply) = change.reply {
            let _ = reply.send(Ok(()));
        }
        Ok(applied)
    }

    /// Applies an inbound non-ack SETTINGS frame to the peer view. The
    /// caller writes the ack before reading any further frame.
    pub(crate) fn recv_peer(
        &mut self,
        params: &[(SettingsParameter, u32)],
    ) -> Result<PeerChange, ConnectionError> {
        validate(params)?;
        let old_window = self.peer_initial_window();
        for &(param, value) in params {
            self.peer[param] = value;
        }
        let new_window = self.peer_initial_window();
        let send_window_delta = if params
            .iter()
            .any(|&(param, _)| param == SettingsParameter::InitialWindowSize)
        {
            Some(i64::from(new_window) - i64::from(old_window))
        } else {
            None
        };
        Ok(PeerChange { send_window_delta })
    }

    /// Fails every pending proposal; used at termination.
    pub(crate) fn shutdown(&mut self, err: &TransportError) {
        for change in self.pending.drain(..) {
            if let Some(reply) = change.reply {
                let _ = reply.send(Err(err.clone()));
            }
        }
    }
}

fn validate(params: &[(SettingsParameter, u32)]) -> Result<(), ConnectionError> {
    for &(param, value) in params {
        match param {
            SettingsParameter::EnablePush if value > 1 => {
                return Err(ConnectionError::Protocol("ENABLE_PUSH must be 0 or 1"));
            }
            SettingsParameter::InitialWindowSize if value > U31_MAX => {
                return Err(ConnectionError::FlowControl(
                    "INITIAL_WINDOW_SIZE exceeds 2^31-1",
                ));
            }
            SettingsParameter::MaxFrameSize
                if !(DEFAULT_MAX_FRAME_SIZE..=MAX_MAX_FRAME_SIZE).contains(&value) =>
            {
                return Err(ConnectionError::Protocol("MAX_FRAME_SIZE out of range"));
            }
            _ => {}
        }
    }
    Ok(())
}
