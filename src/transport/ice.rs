use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use log::{debug, trace, warn};

use crate::backend::{IceAgent, IceAgentHandler, IceParameters, IceRole, SelectedCandidatePair};
use crate::callback::{Callback, CallbackSlot};
use crate::error::Result;
use crate::message::Message;
use crate::transport::{State, Transport, TransportCore};

#[derive(Debug, Default, Copy, Clone, Eq, PartialEq)]
pub enum GatheringState {
    #[default]
    New,
    InProgress,
    Complete,
}

impl From<u8> for GatheringState {
    fn from(v: u8) -> Self {
        match v {
            0 => GatheringState::New,
            1 => GatheringState::InProgress,
            _ => GatheringState::Complete,
        }
    }
}

/// Connectivity establishment: wraps the external ICE agent, surfaces
/// gathered candidates and the selected pair, and moves datagrams between
/// the wire and the DTLS layer.
pub(crate) struct IceTransport {
    core: TransportCore,
    agent: Box<dyn IceAgent>,
    gathering_state: AtomicU8,
    candidate_callback: CallbackSlot<String>,
    gathering_state_callback: CallbackSlot<GatheringState>,
}

impl IceTransport {
    pub(crate) fn new(agent: Box<dyn IceAgent>) -> Arc<Self> {
        Arc::new(Self {
            core: TransportCore::new(None),
            agent,
            gathering_state: AtomicU8::new(GatheringState::New as u8),
            candidate_callback: CallbackSlot::default(),
            gathering_state_callback: CallbackSlot::default(),
        })
    }

    pub(crate) fn on_candidate(&self, callback: Option<Callback<String>>) {
        self.candidate_callback.set(callback);
    }

    pub(crate) fn on_gathering_state_change(&self, callback: Option<Callback<GatheringState>>) {
        self.gathering_state_callback.set(callback);
    }

    pub(crate) fn gathering_state(&self) -> GatheringState {
        self.gathering_state.load(Ordering::SeqCst).into()
    }

    pub(crate) fn local_parameters(&self) -> IceParameters {
        self.agent.local_parameters()
    }

    pub(crate) fn set_remote_parameters(
        &self,
        parameters: IceParameters,
        role: IceRole,
    ) -> Result<()> {
        trace!("Setting remote ICE parameters, role {role:?}");
        self.agent.set_remote_parameters(parameters, role)
    }

    pub(crate) fn add_remote_candidate(&self, candidate: &str) -> Result<()> {
        trace!("Adding remote candidate: {candidate}");
        self.agent.add_remote_candidate(candidate)
    }

    pub(crate) fn selected_pair(&self) -> Option<SelectedCandidatePair> {
        self.agent.selected_pair()
    }

    pub(crate) fn rtt(&self) -> Option<Duration> {
        self.selected_pair().and_then(|pair| pair.rtt)
    }

    fn change_gathering_state(&self, state: GatheringState) {
        let old = self.gathering_state.swap(state as u8, Ordering::SeqCst);
        if old != state as u8 {
            self.gathering_state_callback.call(state);
        }
    }
}

impl Transport for IceTransport {
    fn start(self: Arc<Self>) -> Result<()> {
        debug!("Starting ICE transport");
        self.core.change_state(State::Connecting);
        self.change_gathering_state(GatheringState::InProgress);

        let weak = Arc::downgrade(&self);
        let handler = IceAgentHandler {
            on_candidate: candidate_upcall(weak.clone()),
            on_gathering_done: gathering_done_upcall(weak.clone()),
            on_state_change: state_upcall(weak.clone()),
            on_recv: recv_upcall(weak),
        };
        self.agent.start(handler)
    }

    fn stop(&self) {
        debug!("Stopping ICE transport");
        self.agent.stop();
        self.core.change_state(State::Disconnected);
    }

    fn send(&self, message: Message) -> bool {
        let state = self.core.state();
        if state != State::Connected && state != State::Completed {
            trace!("ICE transport is not connected, dropping outgoing message");
            return false;
        }
        if let Err(err) = self.agent.send(message.payload) {
            warn!("ICE send failed: {err}");
            return false;
        }
        true
    }

    fn state(&self) -> State {
        self.core.state()
    }

    fn on_recv(&self, callback: Option<Callback<Message>>) {
        self.core.set_recv_callback(callback);
    }

    fn on_state_change(&self, callback: Option<Callback<State>>) {
        self.core.set_state_callback(callback);
    }
}

fn candidate_upcall(weak: Weak<IceTransport>) -> Callback<String> {
    Box::new(move |candidate| {
        if let Some(transport) = weak.upgrade() {
            trace!("Gathered local candidate: {candidate}");
            transport.candidate_callback.call(candidate);
        }
    })
}

fn gathering_done_upcall(weak: Weak<IceTransport>) -> Callback<()> {
    Box::new(move |_| {
        if let Some(transport) = weak.upgrade() {
            debug!("Candidate gathering done");
            transport.change_gathering_state(GatheringState::Complete);
        }
    })
}

fn state_upcall(weak: Weak<IceTransport>) -> Callback<State> {
    Box::new(move |state| {
        if let Some(transport) = weak.upgrade() {
            transport.core.change_state(state);
        }
    })
}

fn recv_upcall(weak: Weak<IceTransport>) -> Callback<bytes::Bytes> {
    Box::new(move |data| {
        if let Some(transport) = weak.upgrade() {
            transport.core.recv(Message::binary(data));
        }
    })
}
