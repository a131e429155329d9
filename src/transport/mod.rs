use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex};

use log::trace;

use crate::callback::{Callback, CallbackSlot};
use crate::error::Result;
use crate::message::Message;

pub(crate) mod demux;
pub(crate) mod dtls;
pub(crate) mod dtls_srtp;
pub(crate) mod ice;
pub(crate) mod sctp;

#[derive(Debug, Default, Copy, Clone, Eq, PartialEq)]
pub enum State {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Completed,
    Failed,
}

impl From<u8> for State {
    fn from(v: u8) -> Self {
        match v {
            0 => State::Disconnected,
            1 => State::Connecting,
            2 => State::Connected,
            3 => State::Completed,
            _ => State::Failed,
        }
    }
}

/// A bidirectional pipeline node.
///
/// A transport holds a strong reference to its lower neighbor for the
/// duration it is started, and only a callback reference to its upper
/// neighbor, so the pipeline never forms an ownership cycle.
pub(crate) trait Transport: Send + Sync {
    fn start(self: Arc<Self>) -> Result<()>;
    fn stop(&self);
    /// Hands a message to the transport. Returns false when the message was
    /// buffered rather than passed on immediately; it is never rejected.
    fn send(&self, message: Message) -> bool;
    fn state(&self) -> State;
    fn on_recv(&self, callback: Option<Callback<Message>>);
    fn on_state_change(&self, callback: Option<Callback<State>>);
}

/// Messages buffered while no upper neighbor is listening yet; bounds the
/// window between transport bring-up steps.
const PENDING_RECV_LIMIT: usize = 64;

/// State, neighbor and callback bookkeeping shared by every transport.
pub(crate) struct TransportCore {
    lower: Mutex<Option<Arc<dyn Transport>>>,
    state: AtomicU8,
    recv_callback: CallbackSlot<Message>,
    state_callback: CallbackSlot<State>,
    pending_recv: Mutex<std::collections::VecDeque<Message>>,
}

impl TransportCore {
    pub(crate) fn new(lower: Option<Arc<dyn Transport>>) -> Self {
        Self {
            lower: Mutex::new(lower),
            state: AtomicU8::new(State::Disconnected as u8),
            recv_callback: CallbackSlot::default(),
            state_callback: CallbackSlot::default(),
            pending_recv: Mutex::new(std::collections::VecDeque::new()),
        }
    }

    pub(crate) fn lower(&self) -> Option<Arc<dyn Transport>> {
        self.lower.lock().unwrap().clone()
    }

    /// Drops the strong reference downward, breaking the pipeline.
    pub(crate) fn take_lower(&self) -> Option<Arc<dyn Transport>> {
        self.lower.lock().unwrap().take()
    }

    pub(crate) fn state(&self) -> State {
        self.state.load(Ordering::SeqCst).into()
    }

    /// Stores and propagates a new state.
    ///
    /// Transitions are monotonic except `Connected <-> Completed`; a failed
    /// transport only leaves `Failed` for `Disconnected` on stop.
    pub(crate) fn change_state(&self, state: State) -> bool {
        let old: State = self.state.swap(state as u8, Ordering::SeqCst).into();
        if old == state {
            return false;
        }
        if old == State::Failed && state != State::Disconnected {
            self.state.store(old as u8, Ordering::SeqCst);
            return false;
        }
        trace!("Transport state change: {:?} -> {:?}", old, state);
        self.state_callback.call(state);
        true
    }

    /// Delivers a message to the upper neighbor. While no receiver is
    /// installed, a bounded number of messages is held back and flushed on
    /// registration; the upper layer may still be wiring itself up.
    pub(crate) fn recv(&self, message: Message) {
        let mut pending = self.pending_recv.lock().unwrap();
        if !pending.is_empty() || !self.recv_callback.is_set() {
            if pending.len() == PENDING_RECV_LIMIT {
                trace!("Pending receive buffer full, dropping oldest message");
                pending.pop_front();
            }
            pending.push_back(message);
            return;
        }
        drop(pending);
        self.recv_callback.call(message);
    }

    /// Hands a message to the lower neighbor.
    pub(crate) fn send_down(&self, message: Message) -> bool {
        match self.lower() {
            Some(lower) => lower.send(message),
            None => false,
        }
    }

    pub(crate) fn set_recv_callback(&self, callback: Option<Callback<Message>>) {
        self.recv_callback.set(callback);
        if !self.recv_callback.is_set() {
            return;
        }
        loop {
            let message = {
                let mut pending = self.pending_recv.lock().unwrap();
                match pending.pop_front() {
                    Some(message) => message,
                    None => break,
                }
            };
            self.recv_callback.call(message);
        }
    }

    pub(crate) fn set_state_callback(&self, callback: Option<Callback<State>>) {
        self.state_callback.set(callback);
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_change_state_dedup_and_failed_latch() {
        let core = TransportCore::new(None);
        assert_eq!(core.state(), State::Disconnected);
        assert!(core.change_state(State::Connecting));
        assert!(!core.change_state(State::Connecting));
        assert!(core.change_state(State::Connected));
        assert!(core.change_state(State::Completed));
        assert!(core.change_state(State::Connected));
        assert!(core.change_state(State::Failed));
        assert!(!core.change_state(State::Connected));
        assert_eq!(core.state(), State::Failed);
        assert!(core.change_state(State::Disconnected));
    }
}
