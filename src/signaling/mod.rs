//! Signaling wire types and the relay client.
//!
//! Signaling messages travel over a persistent WebSocket to the relay,
//! which forwards them to whichever socket is registered for the target
//! user. Nothing here knows about the peer-to-peer connection itself.

pub mod client;
pub mod websocket;

use std::fmt;

use serde::{Deserialize, Serialize};

pub use client::{Inbound, RelayClient, RelayHandle};

/// Identity of a user on the relay.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(String);

impl UserId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Opaque call identifier shared by both ends of one call.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CallId(String);

impl CallId {
    /// Fresh locally generated id.
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }
}

impl fmt::Display for CallId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Media kind of a call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallType {
    Voice,
    Video,
}

impl CallType {
    pub fn as_str(&self) -> &'static str {
        match self {
            CallType::Voice => "voice",
            CallType::Video => "video",
        }
    }

    pub fn has_video(&self) -> bool {
        matches!(self, CallType::Video)
    }
}

impl fmt::Display for CallType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a call ended, as carried by an `end` message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EndReason {
    Ended,
    Rejected,
    Busy,
}

impl EndReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            EndReason::Ended => "ended",
            EndReason::Rejected => "rejected",
            EndReason::Busy => "busy",
        }
    }
}

impl fmt::Display for EndReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One ICE candidate in the JSON shape browsers use (`RTCIceCandidateInit`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(rename = "sdpMid", default)]
    pub sdp_mid: Option<String>,
    #[serde(rename = "sdpMLineIndex", default)]
    pub sdp_mline_index: Option<u16>,
    #[serde(rename = "usernameFragment", default)]
    pub username_fragment: Option<String>,
}

impl IceCandidate {
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid: None,
            sdp_mline_index: None,
            username_fragment: None,
        }
    }
}

/// A signaling message exchanged between the two parties of a call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum SignalMessage {
    Offer {
        #[serde(rename = "callId")]
        call_id: CallId,
        sdp: String,
        #[serde(rename = "callType")]
        call_type: CallType,
    },
    Answer {
        #[serde(rename = "callId")]
        call_id: CallId,
        sdp: String,
    },
    Candidate {
        #[serde(rename = "callId")]
        call_id: CallId,
        candidate: IceCandidate,
    },
    End {
        #[serde(rename = "callId")]
        call_id: CallId,
        reason: EndReason,
    },
}

impl SignalMessage {
    pub fn call_id(&self) -> &CallId {
        match self {
            SignalMessage::Offer { call_id, .. }
            | SignalMessage::Answer { call_id, .. }
            | SignalMessage::Candidate { call_id, .. }
            | SignalMessage::End { call_id, .. } => call_id,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            SignalMessage::Offer { .. } => "offer",
            SignalMessage::Answer { .. } => "answer",
            SignalMessage::Candidate { .. } => "candidate",
            SignalMessage::End { .. } => "end",
        }
    }
}

/// Frames exchanged between a client and the relay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum RelayFrame {
    /// First frame from a client: bind this socket to an identity.
    Register {
        #[serde(rename = "userId")]
        user_id: UserId,
    },
    /// Client -> relay: forward `message` to `to`.
    Send { to: UserId, message: SignalMessage },
    /// Relay -> client: `message` arrived from `from`.
    Deliver { from: UserId, message: SignalMessage },
}

/// Outgoing side of the relay as the call state machine sees it.
///
/// Best-effort: no acknowledgment, no retry. Failures are logged by the
/// implementation and never reported back.
pub trait SignalSender: Send + Sync {
    fn send(&self, to: &UserId, message: SignalMessage);
}
