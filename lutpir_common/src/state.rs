//! Per-connection state tracking of the two servers.
//!
//! These machines only record what a connection has done so far, for logging. They never gate request handling.

use crate::he::KeyKind;
use std::fmt::Debug;
use tracing::debug;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnState {
    Init,
    Ready,
}

/// Event type of one server role, fixing the state its connections start in.
pub trait ConnEvent: Copy + Debug {
    const INITIAL_STATE: ConnState;
}

/// Events seen on a computation server connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CsEvent {
    QueryReceived,
    ResultRequested,
}

impl ConnEvent for CsEvent {
    const INITIAL_STATE: ConnState = ConnState::Init;
}

/// Events seen on a decryptor connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DecEvent {
    NewKeys,
    DeleteKeys,
    KeyRequested(KeyKind),
    MidResult,
}

impl ConnEvent for DecEvent {
    const INITIAL_STATE: ConnState = ConnState::Ready;
}

pub struct StateContext<E: ConnEvent> {
    state: ConnState,
    last_event: Option<E>,
    num_events: u64,
}

impl<E: ConnEvent> Default for StateContext<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E: ConnEvent> StateContext<E> {
    pub fn new() -> Self {
        StateContext {
            state: E::INITIAL_STATE,
            last_event: None,
            num_events: 0,
        }
    }

    /// Records `event`. Every event is accepted in every state; the first one moves `Init` to `Ready`.
    pub fn on_event(&mut self, event: E) {
        let prev_state = self.state;

        self.state = ConnState::Ready;
        self.last_event = Some(event);
        self.num_events += 1;

        if prev_state != self.state {
            debug!(?event, from = ?prev_state, to = ?self.state, "connection state transition");
        }
    }

    pub fn state(&self) -> ConnState {
        self.state
    }

    pub fn last_event(&self) -> Option<E> {
        self.last_event
    }

    pub fn num_events(&self) -> u64 {
        self.num_events
    }
}
