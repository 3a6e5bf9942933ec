//! Isolate ports
//!
//! Message-passing ports for the isolate backend. Unlike the shared
//! channel queues, nothing structured crosses a port: every frame is a
//! kind byte plus an encoded payload, so each crossing is a deep copy
//! with no references into the sending side's heap.

use std::collections::VecDeque;
use std::sync::atomic::AtomicBool;
use std::sync::{Condvar, Mutex};
use std::time::Duration;

use crate::channel::{CompletionSlot, ControlToken, Polled};

/// Frame kind, one byte on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PortKind {
    /// Worker to main: progress value
    Progress,
    /// Worker to main: user message
    Message,
    /// Main to worker: control tokens
    Pause,
    Resume,
    Stop,
    /// Main to worker: user message
    User,
}

impl PortKind {
    pub fn as_u8(self) -> u8 {
        match self {
            Self::Progress => 0,
            Self::Message => 1,
            Self::Pause => 2,
            Self::Resume => 3,
            Self::Stop => 4,
            Self::User => 5,
        }
    }

    pub fn from_u8(raw: u8) -> Option<Self> {
        match raw {
            0 => Some(Self::Progress),
            1 => Some(Self::Message),
            2 => Some(Self::Pause),
            3 => Some(Self::Resume),
            4 => Some(Self::Stop),
            5 => Some(Self::User),
            _ => None,
        }
    }

    fn is_control(self) -> bool {
        matches!(self, Self::Pause | Self::Resume | Self::Stop)
    }
}

/// One framed message
#[derive(Debug)]
pub(crate) struct PortMessage {
    pub kind: PortKind,
    pub payload: Vec<u8>,
}

impl PortMessage {
    pub fn new(kind: PortKind, payload: Vec<u8>) -> Self {
        Self { kind, payload }
    }

    pub fn token(token: ControlToken) -> Self {
        let kind = match token {
            ControlToken::Pause => PortKind::Pause,
            ControlToken::Resume => PortKind::Resume,
            ControlToken::Stop => PortKind::Stop,
        };
        Self {
            kind,
            payload: Vec::new(),
        }
    }

    pub fn as_token(&self) -> Option<ControlToken> {
        match self.kind {
            PortKind::Pause => Some(ControlToken::Pause),
            PortKind::Resume => Some(ControlToken::Resume),
            PortKind::Stop => Some(ControlToken::Stop),
            _ => None,
        }
    }
}

struct PortState {
    frames: VecDeque<PortMessage>,
    closed: bool,
}

/// One direction of an isolate boundary
pub(crate) struct Port {
    state: Mutex<PortState>,
    condvar: Condvar,
}

impl Port {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(PortState {
                frames: VecDeque::new(),
                closed: false,
            }),
            condvar: Condvar::new(),
        }
    }

    /// Returns false if the port is closed
    pub fn push(&self, frame: PortMessage) -> bool {
        let mut state = self.state.lock().unwrap();
        if state.closed {
            return false;
        }
        state.frames.push_back(frame);
        self.condvar.notify_all();
        true
    }

    pub fn pop(&self) -> Polled<PortMessage> {
        let mut state = self.state.lock().unwrap();
        if state.closed {
            return Polled::Closed;
        }
        match state.frames.pop_front() {
            Some(frame) => Polled::Item(frame),
            None => Polled::Empty,
        }
    }

    /// Remove the earliest control frame, leaving other frames queued
    /// in order (same overtaking rule as the shared control queue)
    pub fn pop_token(&self) -> Polled<ControlToken> {
        let mut state = self.state.lock().unwrap();
        if state.closed {
            return Polled::Closed;
        }
        let position = state.frames.iter().position(|f| f.kind.is_control());
        match position {
            Some(i) => {
                let frame = state.frames.remove(i).unwrap();
                match frame.as_token() {
                    Some(token) => Polled::Item(token),
                    None => unreachable!(),
                }
            }
            None => Polled::Empty,
        }
    }

    /// Block until the port changes or the timeout elapses
    pub fn wait_activity(&self, timeout: Duration) {
        let state = self.state.lock().unwrap();
        if state.closed || !state.frames.is_empty() {
            return;
        }
        let _unused = self.condvar.wait_timeout(state, timeout).unwrap();
    }

    /// Drain every pending frame, oldest first
    pub fn drain(&self) -> Vec<PortMessage> {
        let mut state = self.state.lock().unwrap();
        state.frames.drain(..).collect()
    }

    pub fn close(&self) {
        let mut state = self.state.lock().unwrap();
        state.closed = true;
        state.frames.clear();
        self.condvar.notify_all();
    }
}

/// The port pair (plus lifecycle plumbing) backing one isolate
///
/// User data crosses only through the ports; the paused flag and the
/// completion slot are backend plumbing, not a data path.
pub(crate) struct IsolatePorts {
    /// Main to worker
    pub inbound: Port,
    /// Worker to main
    pub outbound: Port,
    pub paused: AtomicBool,
    pub completion: CompletionSlot,
}

impl IsolatePorts {
    pub fn new() -> Self {
        Self {
            inbound: Port::new(),
            outbound: Port::new(),
            paused: AtomicBool::new(false),
            completion: CompletionSlot::new(),
        }
    }

    pub fn close(&self) {
        self.inbound.close();
        self.outbound.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_round_trip() {
        for kind in [
            PortKind::Progress,
            PortKind::Message,
            PortKind::Pause,
            PortKind::Resume,
            PortKind::Stop,
            PortKind::User,
        ] {
            assert_eq!(PortKind::from_u8(kind.as_u8()), Some(kind));
        }
        assert_eq!(PortKind::from_u8(99), None);
    }

    #[test]
    fn test_pop_token_leaves_user_frames() {
        let port = Port::new();
        port.push(PortMessage::new(PortKind::User, vec![1]));
        port.push(PortMessage::token(ControlToken::Stop));

        assert!(matches!(port.pop_token(), Polled::Item(ControlToken::Stop)));
        assert!(matches!(port.pop_token(), Polled::Empty));

        let Polled::Item(frame) = port.pop() else {
            panic!("expected frame");
        };
        assert_eq!(frame.kind, PortKind::User);
    }

    #[test]
    fn test_closed_port_rejects_pushes() {
        let port = Port::new();
        port.close();
        assert!(!port.push(PortMessage::new(PortKind::Progress, vec![])));
        assert!(matches!(port.pop(), Polled::Closed));
    }
}
