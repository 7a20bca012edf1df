//! 1:1 call signaling: call state machine, peer connection lifecycle and
//! local media.
//!
//! The [`controller::CallController`] owns one [`machine::CallMachine`] and
//! feeds it UI commands, relay messages, peer events and a one-second tick
//! from a single task, so every transition runs to completion before the
//! next event is looked at.

pub mod controller;
pub mod machine;
pub mod media;
pub mod peer;
pub mod records;
pub mod rtc;
#[cfg(test)]
pub mod testing;
pub mod tone;

use std::fmt;

use chrono::{DateTime, Utc};

use crate::signaling::{CallId, CallType, UserId};
use media::MediaError;

pub use controller::{CallController, CallHandle};
pub use machine::CallDeps;

/// Call lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CallState {
    #[default]
    Idle,
    /// We sent an offer and wait for the answer.
    Calling,
    /// An incoming offer waits for the user.
    Ringing,
    Connected,
    /// Cleanup in progress; always followed by `Idle`.
    Ended,
}

impl CallState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CallState::Idle => "idle",
            CallState::Calling => "calling",
            CallState::Ringing => "ringing",
            CallState::Connected => "connected",
            CallState::Ended => "ended",
        }
    }
}

impl fmt::Display for CallState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The call record owned by the state machine for one call.
#[derive(Debug, Clone, PartialEq)]
pub struct Call {
    pub call_id: CallId,
    pub caller_id: UserId,
    pub receiver_id: UserId,
    pub call_type: CallType,
    pub started_at: DateTime<Utc>,
    pub connected_at: Option<DateTime<Utc>>,
}

impl Call {
    pub fn new(call_id: CallId, caller_id: UserId, receiver_id: UserId, call_type: CallType) -> Self {
        Self {
            call_id,
            caller_id,
            receiver_id,
            call_type,
            started_at: Utc::now(),
            connected_at: None,
        }
    }
}

/// What the UI shows for a ringing call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IncomingCall {
    pub call_id: CallId,
    pub caller_id: UserId,
    pub call_type: CallType,
}

/// How a call ended, from the local point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndCause {
    /// We hung up.
    HungUp,
    /// The remote party hung up.
    RemoteHungUp,
    /// We declined the incoming call.
    Rejected,
    /// The callee declined.
    RemoteRejected,
    /// The callee was already in a call.
    RemoteBusy,
    /// ICE failed or disconnected.
    ConnectionLost,
    /// Ring timeout elapsed without an answer.
    NoAnswer,
    MediaUnavailable,
    NegotiationFailed,
    /// Lost a simultaneous-call race and switched to the other call.
    Yielded,
}

impl EndCause {
    pub fn as_str(&self) -> &'static str {
        match self {
            EndCause::HungUp => "hung up",
            EndCause::RemoteHungUp => "remote hung up",
            EndCause::Rejected => "rejected",
            EndCause::RemoteRejected => "declined by remote",
            EndCause::RemoteBusy => "remote busy",
            EndCause::ConnectionLost => "connection lost",
            EndCause::NoAnswer => "no answer",
            EndCause::MediaUnavailable => "media unavailable",
            EndCause::NegotiationFailed => "negotiation failed",
            EndCause::Yielded => "yielded to incoming call",
        }
    }
}

impl fmt::Display for EndCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallEnded {
    pub call_id: CallId,
    pub peer: UserId,
    pub cause: EndCause,
    pub duration_secs: u64,
}

/// Observable state published to the UI after every event.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct CallSnapshot {
    pub state: CallState,
    pub call_id: Option<CallId>,
    /// Id from the call-record service, once it answered.
    pub record_id: Option<String>,
    pub peer: Option<UserId>,
    pub call_type: Option<CallType>,
    /// Non-zero only while connected.
    pub duration_secs: u64,
    pub muted: bool,
    pub camera_off: bool,
    pub incoming: Option<IncomingCall>,
    pub last_end: Option<CallEnded>,
}

/// Errors surfaced to the UI.
#[derive(Debug, thiserror::Error)]
pub enum CallError {
    #[error(transparent)]
    Media(#[from] MediaError),
    #[error("call negotiation failed: {0:#}")]
    Negotiation(anyhow::Error),
    #[error("cannot call yourself")]
    SelfCall,
    #[error("call controller is not running")]
    ControllerGone,
}
