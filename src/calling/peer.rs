//! Peer connection seam.
//!
//! The call machine drives one [`PeerConnection`] per call through this
//! trait; the WebRTC engine behind it lives in `rtc.rs`. Everything the
//! engine reports (local candidates, connectivity changes, remote tracks)
//! comes back as a [`PeerEvent`] tagged with the call it belongs to, so a
//! late event from a connection that was already torn down is recognisable.

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::{mpsc, watch};

use super::media::{LocalStream, TrackKind};
use crate::signaling::{CallId, IceCandidate};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SdpType {
    Offer,
    Answer,
}

/// A session description plus its role in the offer/answer exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionDescription {
    pub sdp_type: SdpType,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Answer,
            sdp: sdp.into(),
        }
    }
}

/// Aggregate connectivity state of a peer connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl PeerState {
    /// States that end the call.
    pub fn is_lost(&self) -> bool {
        matches!(self, PeerState::Disconnected | PeerState::Failed)
    }
}

/// A track received from the remote party.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteTrack {
    pub id: String,
    pub stream_id: String,
    pub kind: TrackKind,
}

#[derive(Debug, Clone, PartialEq)]
pub enum PeerEventKind {
    /// A local candidate was discovered and must go to the remote party.
    LocalCandidate(IceCandidate),
    StateChanged(PeerState),
    RemoteTrack(RemoteTrack),
}

#[derive(Debug, Clone, PartialEq)]
pub struct PeerEvent {
    pub call_id: CallId,
    pub kind: PeerEventKind,
}

/// Event sink handed to the engine when a connection is created.
#[derive(Debug, Clone)]
pub struct PeerEvents {
    call_id: CallId,
    tx: mpsc::UnboundedSender<PeerEvent>,
}

impl PeerEvents {
    pub fn new(call_id: CallId, tx: mpsc::UnboundedSender<PeerEvent>) -> Self {
        Self { call_id, tx }
    }

    pub fn call_id(&self) -> &CallId {
        &self.call_id
    }

    pub fn emit(&self, kind: PeerEventKind) {
        let event = PeerEvent {
            call_id: self.call_id.clone(),
            kind,
        };
        // Controller gone means the process is shutting down.
        let _ = self.tx.send(event);
    }
}

/// One peer-to-peer connection, owned by the call machine for one call.
#[async_trait]
pub trait PeerConnection: Send + Sync {
    /// Attach every track of `stream` (by reference, not copied).
    async fn add_local_tracks(&self, stream: &LocalStream) -> Result<()>;

    async fn create_offer(&self) -> Result<SessionDescription>;

    async fn create_answer(&self) -> Result<SessionDescription>;

    async fn set_local_description(&self, desc: SessionDescription) -> Result<()>;

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<()>;

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()>;

    async fn close(&self) -> Result<()>;
}

/// Factory for peer connections.
#[async_trait]
pub trait PeerConnector: Send + Sync {
    async fn create(&self, events: PeerEvents) -> Result<Box<dyn PeerConnection>>;
}

/// Remote candidates received before the remote description was applied.
///
/// Append-only until flushed. Flushed exactly once; after that callers
/// apply candidates directly (see [`CandidateQueue::is_flushed`]).
#[derive(Debug, Default)]
pub struct CandidateQueue {
    pending: Vec<IceCandidate>,
    flushed: bool,
}

impl CandidateQueue {
    pub fn push(&mut self, candidate: IceCandidate) {
        debug_assert!(!self.flushed, "candidate queued after flush");
        self.pending.push(candidate);
    }

    /// Take everything queued, in receipt order, and mark the queue flushed.
    /// A second call returns nothing.
    pub fn flush(&mut self) -> Vec<IceCandidate> {
        self.flushed = true;
        std::mem::take(&mut self.pending)
    }

    /// True once the remote description is applied.
    pub fn is_flushed(&self) -> bool {
        self.flushed
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn clear(&mut self) {
        self.pending.clear();
    }
}

/// The remote stream currently shown to the user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteStream {
    pub id: String,
    pub tracks: Vec<RemoteTrack>,
}

/// Sink for the single remote stream of the current call.
#[derive(Debug)]
pub struct RemoteMediaSink {
    tx: watch::Sender<Option<RemoteStream>>,
}

impl RemoteMediaSink {
    pub fn new() -> (Self, watch::Receiver<Option<RemoteStream>>) {
        let (tx, rx) = watch::channel(None);
        (Self { tx }, rx)
    }

    /// Add `track` to the remote stream. Tracks of a second stream are
    /// ignored: a 1:1 call has exactly one remote stream.
    pub fn attach(&self, track: RemoteTrack) {
        self.tx.send_modify(|current| match current {
            None => {
                *current = Some(RemoteStream {
                    id: track.stream_id.clone(),
                    tracks: vec![track],
                });
            }
            Some(stream) if stream.id == track.stream_id => {
                if !stream.tracks.iter().any(|t| t.id == track.id) {
                    stream.tracks.push(track);
                }
            }
            Some(stream) => {
                tracing::warn!(
                    "Ignoring track {} of unexpected remote stream {} (showing {})",
                    track.id,
                    track.stream_id,
                    stream.id
                );
            }
        });
    }

    pub fn clear(&self) {
        self.tx.send_replace(None);
    }

    pub fn current(&self) -> Option<RemoteStream> {
        self.tx.borrow().clone()
    }
}
