//! Call state machine.
//!
//! ```text
//! idle --start_call--> calling --answer--> connected
//! idle --offer-------> ringing --accept--> connected
//!                      ringing --reject--> idle
//! any non-idle --end_call | remote end | connection lost--> ended -> idle
//! ```
//!
//! A trigger that is not listed for the current state is a no-op. At most
//! one call exists at a time; an offer arriving while busy is answered with
//! `end{busy}` and never becomes visible.

use std::sync::Arc;

use anyhow::Context;
use chrono::Utc;
use tokio::sync::mpsc;

use super::media::{LocalStream, MediaDevices, TrackKind};
use super::peer::{
    CandidateQueue, PeerConnection, PeerConnector, PeerEvent, PeerEventKind, PeerEvents,
    PeerState, RemoteMediaSink, RemoteStream, SessionDescription,
};
use super::records::{CallRecordStore, RecordKeeper, RecordSession};
use super::{Call, CallEnded, CallError, CallSnapshot, CallState, EndCause, IncomingCall};
use crate::signaling::{
    CallId, CallType, EndReason, IceCandidate, Inbound, SignalMessage, SignalSender, UserId,
};

/// Collaborators of the state machine.
#[derive(Clone)]
pub struct CallDeps {
    pub media: Arc<dyn MediaDevices>,
    pub connector: Arc<dyn PeerConnector>,
    pub signals: Arc<dyn SignalSender>,
    pub records: Arc<dyn CallRecordStore>,
}

/// Everything that exists only while a call does.
struct ActiveCall {
    call: Call,
    remote_user: UserId,
    peer: Option<Box<dyn PeerConnection>>,
    stream: Option<LocalStream>,
    candidates: CandidateQueue,
    /// Offer SDP held while ringing.
    remote_offer: Option<String>,
    ring_secs: u64,
    record: RecordSession,
}

impl ActiveCall {
    fn new(call: Call, remote_user: UserId, record: RecordSession) -> Self {
        Self {
            call,
            remote_user,
            peer: None,
            stream: None,
            candidates: CandidateQueue::default(),
            remote_offer: None,
            ring_secs: 0,
            record,
        }
    }

    fn is(&self, from: &UserId, call_id: &CallId) -> bool {
        &self.remote_user == from && &self.call.call_id == call_id
    }

    /// Apply the remote description, then every candidate queued before it.
    async fn apply_remote(&mut self, desc: SessionDescription) -> anyhow::Result<()> {
        let peer = self.peer.as_ref().context("no peer connection")?;
        peer.set_remote_description(desc).await?;

        let queued = self.candidates.flush();
        if !queued.is_empty() {
            tracing::debug!("Applying {} queued candidates", queued.len());
        }
        for candidate in queued {
            if let Err(e) = peer.add_ice_candidate(candidate).await {
                tracing::warn!("Queued candidate rejected: {:#}", e);
            }
        }
        Ok(())
    }
}

pub struct CallMachine {
    local_user: UserId,
    media: Arc<dyn MediaDevices>,
    connector: Arc<dyn PeerConnector>,
    signals: Arc<dyn SignalSender>,
    records: RecordKeeper,
    peer_events: mpsc::UnboundedSender<PeerEvent>,
    remote: RemoteMediaSink,
    /// 0 disables the caller-side timeout.
    ring_timeout_secs: u64,

    state: CallState,
    active: Option<ActiveCall>,
    duration_secs: u64,
    muted: bool,
    camera_off: bool,
    last_end: Option<CallEnded>,
}

impl CallMachine {
    pub fn new(
        local_user: UserId,
        deps: CallDeps,
        peer_events: mpsc::UnboundedSender<PeerEvent>,
        remote: RemoteMediaSink,
        ring_timeout_secs: u64,
    ) -> Self {
        Self {
            local_user,
            media: deps.media,
            connector: deps.connector,
            signals: deps.signals,
            records: RecordKeeper::new(deps.records),
            peer_events,
            remote,
            ring_timeout_secs,
            state: CallState::Idle,
            active: None,
            duration_secs: 0,
            muted: false,
            camera_off: false,
            last_end: None,
        }
    }

    pub fn local_user(&self) -> &UserId {
        &self.local_user
    }

    pub fn state(&self) -> CallState {
        self.state
    }

    pub fn duration_secs(&self) -> u64 {
        self.duration_secs
    }

    pub fn local_stream(&self) -> Option<&LocalStream> {
        self.active.as_ref().and_then(|a| a.stream.as_ref())
    }

    pub fn queued_candidates(&self) -> usize {
        self.active.as_ref().map_or(0, |a| a.candidates.len())
    }

    pub fn remote_stream(&self) -> Option<RemoteStream> {
        self.remote.current()
    }

    pub fn snapshot(&self) -> CallSnapshot {
        let active = self.active.as_ref();
        let incoming = match (self.state, active) {
            (CallState::Ringing, Some(a)) => Some(IncomingCall {
                call_id: a.call.call_id.clone(),
                caller_id: a.call.caller_id.clone(),
                call_type: a.call.call_type,
            }),
            _ => None,
        };
        CallSnapshot {
            state: self.state,
            call_id: active.map(|a| a.call.call_id.clone()),
            record_id: active.and_then(|a| a.record.record_id()),
            peer: active.map(|a| a.remote_user.clone()),
            call_type: active.map(|a| a.call.call_type),
            duration_secs: self.duration_secs,
            muted: self.muted,
            camera_off: self.camera_off,
            incoming,
            last_end: self.last_end.clone(),
        }
    }

    // ------------------------------------------------------------------
    // UI triggers
    // ------------------------------------------------------------------

    /// idle -> calling: acquire media, create the connection, send the offer.
    pub async fn start_call(&mut self, target: UserId, call_type: CallType) -> Result<(), CallError> {
        if self.state != CallState::Idle {
            tracing::debug!("start_call ignored while {}", self.state);
            return Ok(());
        }
        if target == self.local_user {
            return Err(CallError::SelfCall);
        }

        let call_id = CallId::generate();
        tracing::info!("Calling {} ({} call {})", target, call_type, call_id);
        let call = Call::new(
            call_id.clone(),
            self.local_user.clone(),
            target.clone(),
            call_type,
        );
        let record = self.records.open(call_id.clone());
        self.active = Some(ActiveCall::new(call, target.clone(), record));
        self.state = CallState::Calling;

        let stream = match self.media.acquire(call_type).await {
            Ok(stream) => stream,
            Err(e) => {
                // Nothing was sent yet: abort without touching the relay.
                tracing::warn!("Cannot start call: {}", e);
                self.teardown(EndCause::MediaUnavailable, None, None).await;
                return Err(e.into());
            }
        };
        self.attach_stream(stream.clone());

        match self.negotiate_offer(&stream).await {
            Ok(offer) => {
                self.signals.send(
                    &target,
                    SignalMessage::Offer {
                        call_id,
                        sdp: offer.clone(),
                        call_type,
                    },
                );
                if let Some(active) = &self.active {
                    active.record.register(&target, call_type, &offer);
                }
                Ok(())
            }
            Err(e) => {
                tracing::warn!("Offer negotiation failed: {:#}", e);
                self.teardown(EndCause::NegotiationFailed, None, None).await;
                Err(CallError::Negotiation(e))
            }
        }
    }

    /// ringing -> connected: acquire media, answer the held offer.
    pub async fn accept_call(&mut self) -> Result<(), CallError> {
        if self.state != CallState::Ringing {
            tracing::debug!("accept_call ignored while {}", self.state);
            return Ok(());
        }
        let Some(call_type) = self.active.as_ref().map(|a| a.call.call_type) else {
            return Ok(());
        };

        let stream = match self.media.acquire(call_type).await {
            Ok(stream) => stream,
            Err(e) => {
                tracing::warn!("Cannot accept call: {}", e);
                self.teardown(
                    EndCause::MediaUnavailable,
                    Some(EndReason::Rejected),
                    Some(EndReason::Rejected),
                )
                .await;
                return Err(e.into());
            }
        };
        self.attach_stream(stream.clone());

        match self.negotiate_answer(&stream).await {
            Ok(answer) => {
                if let Some(active) = &self.active {
                    self.signals.send(
                        &active.remote_user,
                        SignalMessage::Answer {
                            call_id: active.call.call_id.clone(),
                            sdp: answer.clone(),
                        },
                    );
                    active.record.answer(&answer);
                }
                self.enter_connected();
                Ok(())
            }
            Err(e) => {
                tracing::warn!("Answer negotiation failed: {:#}", e);
                self.teardown(
                    EndCause::NegotiationFailed,
                    Some(EndReason::Ended),
                    Some(EndReason::Ended),
                )
                .await;
                Err(CallError::Negotiation(e))
            }
        }
    }

    /// ringing -> idle. No media is acquired for a rejected call.
    pub async fn reject_call(&mut self) {
        if self.state != CallState::Ringing {
            tracing::debug!("reject_call ignored while {}", self.state);
            return;
        }
        self.teardown(
            EndCause::Rejected,
            Some(EndReason::Rejected),
            Some(EndReason::Rejected),
        )
        .await;
    }

    /// Any non-idle state -> idle, telling the remote party.
    pub async fn end_call(&mut self) {
        if self.state == CallState::Idle {
            tracing::debug!("end_call ignored while idle");
            return;
        }
        self.teardown(
            EndCause::HungUp,
            Some(EndReason::Ended),
            Some(EndReason::Ended),
        )
        .await;
    }

    /// Flip the microphone. Returns the new muted flag.
    pub fn toggle_mute(&mut self) -> bool {
        if let Some(stream) = self.local_stream() {
            let muted = !self.muted;
            stream.set_enabled(TrackKind::Audio, !muted);
            self.muted = muted;
        }
        self.muted
    }

    /// Flip the camera on video calls. Returns the new camera-off flag.
    pub fn toggle_camera(&mut self) -> bool {
        if let Some(stream) = self.local_stream() {
            if stream.tracks_of(TrackKind::Video).next().is_some() {
                let off = !self.camera_off;
                stream.set_enabled(TrackKind::Video, !off);
                self.camera_off = off;
            }
        }
        self.camera_off
    }

    // ------------------------------------------------------------------
    // Relay triggers
    // ------------------------------------------------------------------

    /// Dispatch one relay message by kind.
    pub async fn handle_signal(&mut self, inbound: Inbound) {
        let Inbound { from, message } = inbound;
        match message {
            SignalMessage::Offer {
                call_id,
                sdp,
                call_type,
            } => self.on_offer(from, call_id, sdp, call_type).await,
            SignalMessage::Answer { call_id, sdp } => self.on_answer(from, call_id, sdp).await,
            SignalMessage::Candidate { call_id, candidate } => {
                self.on_candidate(from, call_id, candidate).await
            }
            SignalMessage::End { call_id, reason } => self.on_end(from, call_id, reason).await,
        }
    }

    async fn on_offer(&mut self, from: UserId, call_id: CallId, sdp: String, call_type: CallType) {
        if let Some(active) = &self.active {
            if active.is(&from, &call_id) {
                tracing::debug!("Duplicate offer for call {} ignored", call_id);
                return;
            }
            if self.state == CallState::Calling && active.remote_user == from {
                self.resolve_glare(from, call_id, sdp, call_type).await;
                return;
            }
        }
        if self.state != CallState::Idle {
            tracing::info!("Busy: declining {} call {} from {}", call_type, call_id, from);
            self.signals.send(
                &from,
                SignalMessage::End {
                    call_id,
                    reason: EndReason::Busy,
                },
            );
            return;
        }
        self.ring(from, call_id, sdp, call_type);
    }

    /// Both sides called each other. The lower identity keeps its call;
    /// the higher one drops its own attempt and takes the incoming one.
    async fn resolve_glare(
        &mut self,
        from: UserId,
        call_id: CallId,
        sdp: String,
        call_type: CallType,
    ) {
        if self.local_user < from {
            tracing::info!("Simultaneous call with {}: keeping ours", from);
            return;
        }
        tracing::info!("Simultaneous call with {}: taking theirs", from);
        self.teardown(EndCause::Yielded, None, Some(EndReason::Ended))
            .await;
        self.ring(from, call_id, sdp, call_type);
        if let Err(e) = self.accept_call().await {
            tracing::warn!("Accepting call after glare failed: {}", e);
        }
    }

    fn ring(&mut self, from: UserId, call_id: CallId, sdp: String, call_type: CallType) {
        tracing::info!("Incoming {} call {} from {}", call_type, call_id, from);
        let call = Call::new(
            call_id.clone(),
            from.clone(),
            self.local_user.clone(),
            call_type,
        );
        let mut active = ActiveCall::new(call, from, self.records.open(call_id));
        active.remote_offer = Some(sdp);
        self.active = Some(active);
        self.state = CallState::Ringing;
    }

    async fn on_answer(&mut self, from: UserId, call_id: CallId, sdp: String) {
        let Some(active) = self.active.as_mut() else {
            tracing::debug!("Answer for {} with no call in progress", call_id);
            return;
        };
        if self.state != CallState::Calling || !active.is(&from, &call_id) {
            tracing::debug!("Stale answer for {} from {} ignored", call_id, from);
            return;
        }

        match active.apply_remote(SessionDescription::answer(sdp)).await {
            Ok(()) => self.enter_connected(),
            Err(e) => {
                tracing::warn!("Applying answer failed: {:#}", e);
                self.teardown(
                    EndCause::NegotiationFailed,
                    Some(EndReason::Ended),
                    Some(EndReason::Ended),
                )
                .await;
            }
        }
    }

    async fn on_candidate(&mut self, from: UserId, call_id: CallId, candidate: IceCandidate) {
        let Some(active) = self.active.as_mut() else {
            tracing::debug!("Candidate for {} with no call in progress", call_id);
            return;
        };
        if !active.is(&from, &call_id) {
            tracing::debug!("Stale candidate for {} from {} ignored", call_id, from);
            return;
        }

        if !active.candidates.is_flushed() {
            active.candidates.push(candidate);
            return;
        }
        if let Some(peer) = &active.peer {
            if let Err(e) = peer.add_ice_candidate(candidate).await {
                tracing::warn!("Remote candidate rejected: {:#}", e);
            }
        }
    }

    async fn on_end(&mut self, from: UserId, call_id: CallId, reason: EndReason) {
        match &self.active {
            Some(active) if active.is(&from, &call_id) => {}
            _ => {
                tracing::debug!("Stale end for {} from {} ignored", call_id, from);
                return;
            }
        }
        let (cause, record) = match reason {
            EndReason::Ended => (EndCause::RemoteHungUp, None),
            EndReason::Rejected => (EndCause::RemoteRejected, None),
            // The busy side never opened a record for this call.
            EndReason::Busy => (EndCause::RemoteBusy, Some(EndReason::Busy)),
        };
        self.teardown(cause, None, record).await;
    }

    // ------------------------------------------------------------------
    // Peer connection and timer triggers
    // ------------------------------------------------------------------

    pub async fn on_peer_event(&mut self, event: PeerEvent) {
        let Some(active) = &self.active else {
            tracing::debug!("Peer event for {} after cleanup ignored", event.call_id);
            return;
        };
        if active.call.call_id != event.call_id {
            tracing::debug!("Peer event for old call {} ignored", event.call_id);
            return;
        }

        match event.kind {
            PeerEventKind::LocalCandidate(candidate) => {
                self.signals.send(
                    &active.remote_user,
                    SignalMessage::Candidate {
                        call_id: event.call_id,
                        candidate,
                    },
                );
            }
            PeerEventKind::StateChanged(PeerState::Connected) => {
                tracing::debug!("Media path for call {} is up", event.call_id);
            }
            PeerEventKind::StateChanged(state) if state.is_lost() => {
                tracing::warn!("Peer connection {:?}; ending call {}", state, event.call_id);
                self.teardown(
                    EndCause::ConnectionLost,
                    Some(EndReason::Ended),
                    Some(EndReason::Ended),
                )
                .await;
            }
            PeerEventKind::StateChanged(state) => {
                tracing::debug!("Peer connection for {} now {:?}", event.call_id, state);
            }
            PeerEventKind::RemoteTrack(track) => {
                tracing::info!("Remote {} track {} arrived", track.kind, track.id);
                self.remote.attach(track);
            }
        }
    }

    /// Called once per second.
    pub async fn on_tick(&mut self) {
        match self.state {
            CallState::Connected => self.duration_secs += 1,
            CallState::Calling => {
                let Some(active) = self.active.as_mut() else {
                    return;
                };
                active.ring_secs += 1;
                if self.ring_timeout_secs > 0 && active.ring_secs >= self.ring_timeout_secs {
                    tracing::info!(
                        "No answer from {} after {}s",
                        active.remote_user,
                        active.ring_secs
                    );
                    self.teardown(
                        EndCause::NoAnswer,
                        Some(EndReason::Ended),
                        Some(EndReason::Ended),
                    )
                    .await;
                }
            }
            _ => {}
        }
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    fn attach_stream(&mut self, stream: LocalStream) {
        match self.active.as_mut() {
            Some(active) => active.stream = Some(stream),
            None => stream.stop(),
        }
    }

    async fn create_peer(&mut self) -> anyhow::Result<&mut Box<dyn PeerConnection>> {
        let call_id = self
            .active
            .as_ref()
            .map(|a| a.call.call_id.clone())
            .context("no active call")?;
        let events = PeerEvents::new(call_id, self.peer_events.clone());
        let peer = self.connector.create(events).await?;
        let active = self.active.as_mut().context("no active call")?;
        Ok(active.peer.insert(peer))
    }

    /// Create the connection, attach tracks, produce and apply an offer.
    async fn negotiate_offer(&mut self, stream: &LocalStream) -> anyhow::Result<String> {
        let peer = self.create_peer().await?;
        peer.add_local_tracks(stream).await?;
        let offer = peer.create_offer().await?;
        peer.set_local_description(offer.clone()).await?;
        Ok(offer.sdp)
    }

    /// Create the connection, apply the held offer and queued candidates,
    /// produce and apply an answer.
    async fn negotiate_answer(&mut self, stream: &LocalStream) -> anyhow::Result<String> {
        self.create_peer()
            .await?
            .add_local_tracks(stream)
            .await?;

        let active = self.active.as_mut().context("no active call")?;
        let offer = active.remote_offer.take().context("no offer to answer")?;
        active.apply_remote(SessionDescription::offer(offer)).await?;

        let peer = active.peer.as_ref().context("no peer connection")?;
        let answer = peer.create_answer().await?;
        peer.set_local_description(answer.clone()).await?;
        Ok(answer.sdp)
    }

    fn enter_connected(&mut self) {
        if let Some(active) = self.active.as_mut() {
            active.call.connected_at = Some(Utc::now());
            tracing::info!("Call {} with {} connected", active.call.call_id, active.remote_user);
        }
        self.state = CallState::Connected;
        self.duration_secs = 0;
    }

    /// Release everything the call holds and return to idle.
    ///
    /// `notify` is sent to the remote party, `record` goes to the record
    /// service. Runs identically for every way a call can end.
    async fn teardown(&mut self, cause: EndCause, notify: Option<EndReason>, record: Option<EndReason>) {
        let Some(mut active) = self.active.take() else {
            self.state = CallState::Idle;
            return;
        };
        self.state = CallState::Ended;
        let duration_secs = self.duration_secs;

        if let Some(reason) = notify {
            self.signals.send(
                &active.remote_user,
                SignalMessage::End {
                    call_id: active.call.call_id.clone(),
                    reason,
                },
            );
        }
        if let Some(reason) = record {
            active.record.end(reason, duration_secs);
        }

        if let Some(stream) = active.stream.take() {
            stream.stop();
        }
        self.remote.clear();
        if let Some(peer) = active.peer.take() {
            if let Err(e) = peer.close().await {
                tracing::warn!("Closing peer connection failed: {:#}", e);
            }
        }
        active.candidates.clear();

        self.duration_secs = 0;
        self.muted = false;
        self.camera_off = false;
        tracing::info!(
            "Call {} with {} ended: {} ({}s)",
            active.call.call_id,
            active.remote_user,
            cause,
            duration_secs
        );
        self.last_end = Some(CallEnded {
            call_id: active.call.call_id,
            peer: active.remote_user,
            cause,
            duration_secs,
        });
        self.state = CallState::Idle;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calling::media::MediaError;
    use crate::calling::peer::RemoteTrack;
    use crate::calling::testing::Harness;

    fn cand(n: u32) -> IceCandidate {
        IceCandidate::new(format!("candidate:{} 1 UDP 2130706431 10.0.0.{} 5000 typ host", n, n))
    }

    fn call_id(h: &Harness) -> CallId {
        h.machine.snapshot().call_id.expect("no call in progress")
    }

    /// Every resource of the finished call is released.
    fn assert_clean(h: &Harness) {
        let m = &h.machine;
        assert_eq!(m.state(), CallState::Idle);
        assert!(m.local_stream().is_none());
        assert!(m.remote_stream().is_none());
        assert!(h.remote.borrow().is_none());
        assert_eq!(m.queued_candidates(), 0);
        assert_eq!(m.duration_secs(), 0);

        let snap = m.snapshot();
        assert!(snap.call_id.is_none());
        assert!(snap.incoming.is_none());
        assert!(!snap.muted);
        assert!(!snap.camera_off);

        for stream in h.devices.acquired() {
            assert_eq!(stream.active_tracks(), 0, "track left running");
        }
        for i in 0..h.connector.count() {
            assert!(h.connector.log(i).closed, "peer connection left open");
        }
    }

    fn last_cause(h: &Harness) -> EndCause {
        h.machine
            .snapshot()
            .last_end
            .expect("no call ended")
            .cause
    }

    /// Alice calls Bob and Bob picks up.
    async fn connect(alice: &mut Harness, bob: &mut Harness, call_type: CallType) {
        alice
            .machine
            .start_call(bob.user.clone(), call_type)
            .await
            .unwrap();
        alice.deliver_to(bob).await;
        bob.machine.accept_call().await.unwrap();
        bob.deliver_to(alice).await;
        assert_eq!(alice.machine.state(), CallState::Connected);
        assert_eq!(bob.machine.state(), CallState::Connected);
    }

    #[tokio::test]
    async fn test_video_call_happy_path() {
        let mut alice = Harness::new("alice");
        let mut bob = Harness::new("bob");

        alice
            .machine
            .start_call(bob.user.clone(), CallType::Video)
            .await
            .unwrap();
        assert_eq!(alice.machine.state(), CallState::Calling);
        let id = call_id(&alice);

        assert_eq!(alice.deliver_to(&mut bob).await, vec!["offer"]);
        assert_eq!(bob.machine.state(), CallState::Ringing);
        let incoming = bob.machine.snapshot().incoming.unwrap();
        assert_eq!(incoming.caller_id, alice.user);
        assert_eq!(incoming.call_id, id);
        assert_eq!(incoming.call_type, CallType::Video);
        // Nothing is acquired until the user accepts.
        assert!(bob.devices.acquired().is_empty());

        bob.machine.accept_call().await.unwrap();
        assert_eq!(bob.machine.state(), CallState::Connected);
        assert_eq!(bob.deliver_to(&mut alice).await, vec!["answer"]);
        assert_eq!(alice.machine.state(), CallState::Connected);

        let peer = alice.connector.last();
        assert_eq!(peer.local.unwrap().sdp, format!("v=0 offer {}", id));
        assert_eq!(peer.remote.unwrap().sdp, format!("v=0 answer {}", id));
        assert_eq!(peer.tracks.len(), 2);

        alice.tick(5).await;
        assert_eq!(alice.machine.snapshot().duration_secs, 5);

        alice.machine.end_call().await;
        assert_clean(&alice);
        assert_eq!(last_cause(&alice), EndCause::HungUp);
        assert_eq!(alice.machine.snapshot().last_end.unwrap().duration_secs, 5);

        let end = alice.sent.take();
        assert_eq!(
            end[0].1,
            SignalMessage::End {
                call_id: id.clone(),
                reason: EndReason::Ended,
            }
        );
        bob.machine
            .handle_signal(Inbound {
                from: alice.user.clone(),
                message: end[0].1.clone(),
            })
            .await;
        assert_clean(&bob);
        assert_eq!(last_cause(&bob), EndCause::RemoteHungUp);

        assert_eq!(
            alice.records.wait_for(2).await,
            vec![format!("register {} bob video", id), format!("end {} ended 5", id)]
        );
        assert_eq!(bob.records.wait_for(1).await, vec![format!("answer {}", id)]);
    }

    #[tokio::test]
    async fn test_record_id_reaches_snapshot() {
        let mut alice = Harness::new("alice");
        alice
            .machine
            .start_call(UserId::new("bob"), CallType::Video)
            .await
            .unwrap();
        let id = call_id(&alice);
        alice.records.wait_for(1).await;
        // The writer sets the id right after the store returns it.
        for _ in 0..50 {
            if alice.machine.snapshot().record_id.is_some() {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert_eq!(
            alice.machine.snapshot().record_id,
            Some(format!("rec-{}", id))
        );
    }

    #[tokio::test]
    async fn test_caller_cancel_clears_ringing() {
        let mut alice = Harness::new("alice");
        let mut bob = Harness::new("bob");

        alice
            .machine
            .start_call(bob.user.clone(), CallType::Voice)
            .await
            .unwrap();
        alice.deliver_to(&mut bob).await;
        assert!(bob.machine.snapshot().incoming.is_some());

        alice.machine.end_call().await;
        assert_clean(&alice);
        alice.deliver_to(&mut bob).await;
        assert_clean(&bob);
        assert_eq!(last_cause(&bob), EndCause::RemoteHungUp);
        assert!(bob.sent.take().is_empty());
    }

    #[tokio::test]
    async fn test_busy_receiver_declines_without_changing_state() {
        let mut alice = Harness::new("alice");
        let mut bob = Harness::new("bob");
        let mut carol = Harness::new("carol");
        connect(&mut carol, &mut bob, CallType::Voice).await;
        let bob_call = call_id(&bob);

        alice
            .machine
            .start_call(bob.user.clone(), CallType::Video)
            .await
            .unwrap();
        let id = call_id(&alice);
        alice.deliver_to(&mut bob).await;

        assert_eq!(bob.machine.state(), CallState::Connected);
        assert_eq!(call_id(&bob), bob_call);
        assert!(bob.machine.snapshot().incoming.is_none());
        assert_eq!(bob.devices.acquired().len(), 1);

        assert_eq!(bob.deliver_to(&mut alice).await, vec!["end"]);
        assert_clean(&alice);
        assert_eq!(last_cause(&alice), EndCause::RemoteBusy);
        assert_eq!(
            alice.records.wait_for(2).await,
            vec![format!("register {} bob video", id), format!("end {} busy 0", id)]
        );
    }

    #[tokio::test]
    async fn test_rejected_call_never_acquires_media() {
        let mut alice = Harness::new("alice");
        let mut bob = Harness::new("bob");

        alice
            .machine
            .start_call(bob.user.clone(), CallType::Video)
            .await
            .unwrap();
        let id = call_id(&alice);
        alice.deliver_to(&mut bob).await;

        bob.machine.reject_call().await;
        assert_clean(&bob);
        assert!(bob.devices.acquired().is_empty());
        assert_eq!(bob.connector.count(), 0);
        assert_eq!(last_cause(&bob), EndCause::Rejected);

        let sent = bob.sent.take();
        assert_eq!(
            sent,
            vec![(
                alice.user.clone(),
                SignalMessage::End {
                    call_id: id.clone(),
                    reason: EndReason::Rejected,
                }
            )]
        );
        alice
            .machine
            .handle_signal(Inbound {
                from: bob.user.clone(),
                message: sent[0].1.clone(),
            })
            .await;
        assert_clean(&alice);
        assert_eq!(last_cause(&alice), EndCause::RemoteRejected);
        assert_eq!(
            bob.records.wait_for(1).await,
            vec![format!("end {} rejected 0", id)]
        );
    }

    #[tokio::test]
    async fn test_triggers_outside_their_state_are_ignored() {
        let mut alice = Harness::new("alice");

        alice.machine.accept_call().await.unwrap();
        alice.machine.reject_call().await;
        alice.machine.end_call().await;
        alice.tick(5).await;
        alice
            .machine
            .handle_signal(Inbound {
                from: UserId::new("bob"),
                message: SignalMessage::Answer {
                    call_id: CallId::new("nope"),
                    sdp: "v=0".into(),
                },
            })
            .await;
        assert_eq!(alice.machine.state(), CallState::Idle);
        assert!(alice.sent.take().is_empty());
        assert!(alice.machine.snapshot().last_end.is_none());

        alice
            .machine
            .start_call(UserId::new("bob"), CallType::Voice)
            .await
            .unwrap();
        let id = call_id(&alice);
        alice
            .machine
            .start_call(UserId::new("carol"), CallType::Voice)
            .await
            .unwrap();
        alice.machine.accept_call().await.unwrap();
        alice.machine.reject_call().await;
        assert_eq!(alice.machine.state(), CallState::Calling);
        assert_eq!(call_id(&alice), id);
        assert_eq!(alice.connector.count(), 1);
        assert_eq!(alice.sent.kinds(), vec!["offer"]);
    }

    #[tokio::test]
    async fn test_self_call_is_refused() {
        let mut alice = Harness::new("alice");
        let err = alice
            .machine
            .start_call(UserId::new("alice"), CallType::Voice)
            .await
            .unwrap_err();
        assert!(matches!(err, CallError::SelfCall));
        assert_eq!(alice.machine.state(), CallState::Idle);
        assert!(alice.sent.take().is_empty());
    }

    #[tokio::test]
    async fn test_stale_messages_are_ignored() {
        let mut alice = Harness::new("alice");
        let mut bob = Harness::new("bob");
        connect(&mut alice, &mut bob, CallType::Voice).await;
        let id = call_id(&alice);

        // Wrong call id from the right user.
        alice
            .machine
            .handle_signal(Inbound {
                from: bob.user.clone(),
                message: SignalMessage::End {
                    call_id: CallId::new("old"),
                    reason: EndReason::Ended,
                },
            })
            .await;
        // Right call id from someone else.
        alice
            .machine
            .handle_signal(Inbound {
                from: UserId::new("mallory"),
                message: SignalMessage::End {
                    call_id: id.clone(),
                    reason: EndReason::Ended,
                },
            })
            .await;
        alice
            .machine
            .handle_signal(Inbound {
                from: UserId::new("mallory"),
                message: SignalMessage::Candidate {
                    call_id: id,
                    candidate: cand(9),
                },
            })
            .await;

        assert_eq!(alice.machine.state(), CallState::Connected);
        assert!(alice.connector.last().candidates.is_empty());
    }

    /// Candidates that beat the description are applied exactly as if they
    /// had arrived after it.
    #[tokio::test]
    async fn test_early_candidates_are_queued_then_flushed_in_order() {
        let mut alice = Harness::new("alice");
        let mut bob = Harness::new("bob");

        alice
            .machine
            .start_call(bob.user.clone(), CallType::Voice)
            .await
            .unwrap();
        for n in 1..=3 {
            alice
                .connector
                .emit(PeerEventKind::LocalCandidate(cand(n)));
        }
        alice.pump_events().await;
        assert_eq!(
            alice.deliver_to(&mut bob).await,
            vec!["offer", "candidate", "candidate", "candidate"]
        );
        assert_eq!(bob.machine.queued_candidates(), 3);

        bob.machine.accept_call().await.unwrap();
        assert_eq!(bob.machine.queued_candidates(), 0);
        assert_eq!(bob.connector.last().candidates, vec![cand(1), cand(2), cand(3)]);

        // Bob's candidates reach Alice before his answer does.
        bob.connector.emit(PeerEventKind::LocalCandidate(cand(7)));
        bob.pump_events().await;
        let mut sent = bob.sent.take();
        sent.rotate_left(1);
        assert_eq!(sent[0].1.kind(), "candidate");
        for (_, message) in sent {
            alice
                .machine
                .handle_signal(Inbound {
                    from: bob.user.clone(),
                    message,
                })
                .await;
        }
        assert_eq!(alice.machine.state(), CallState::Connected);
        assert_eq!(alice.connector.last().candidates, vec![cand(7)]);

        // After the description, candidates go straight to the connection.
        alice.connector.emit(PeerEventKind::LocalCandidate(cand(4)));
        alice.pump_events().await;
        alice.deliver_to(&mut bob).await;
        assert_eq!(bob.machine.queued_candidates(), 0);
        assert_eq!(
            bob.connector.last().candidates,
            vec![cand(1), cand(2), cand(3), cand(4)]
        );
    }

    #[tokio::test]
    async fn test_connection_loss_ends_call() {
        let mut alice = Harness::new("alice");
        let mut bob = Harness::new("bob");
        connect(&mut alice, &mut bob, CallType::Video).await;
        let id = call_id(&alice);

        alice
            .connector
            .emit(PeerEventKind::StateChanged(PeerState::Connected));
        alice.pump_events().await;
        assert_eq!(alice.machine.state(), CallState::Connected);

        alice
            .connector
            .emit(PeerEventKind::StateChanged(PeerState::Failed));
        alice.pump_events().await;
        assert_clean(&alice);
        assert_eq!(last_cause(&alice), EndCause::ConnectionLost);

        assert_eq!(alice.deliver_to(&mut bob).await, vec!["end"]);
        assert_clean(&bob);

        // A late event from the closed connection changes nothing.
        alice
            .connector
            .emit(PeerEventKind::LocalCandidate(cand(1)));
        alice.pump_events().await;
        assert!(alice.sent.take().is_empty());
        assert_eq!(last_cause(&alice), EndCause::ConnectionLost);
        assert_eq!(alice.machine.snapshot().last_end.unwrap().call_id, id);
    }

    #[tokio::test]
    async fn test_remote_track_is_shown_until_cleanup() {
        let mut alice = Harness::new("alice");
        let mut bob = Harness::new("bob");
        connect(&mut alice, &mut bob, CallType::Video).await;

        for (id, kind) in [("a1", TrackKind::Audio), ("v1", TrackKind::Video)] {
            alice.connector.emit(PeerEventKind::RemoteTrack(RemoteTrack {
                id: id.into(),
                stream_id: "bob-stream".into(),
                kind,
            }));
        }
        alice.pump_events().await;
        let shown = alice.remote.borrow().clone().unwrap();
        assert_eq!(shown.id, "bob-stream");
        assert_eq!(shown.tracks.len(), 2);

        bob.machine.end_call().await;
        bob.deliver_to(&mut alice).await;
        assert_clean(&alice);
    }

    #[tokio::test]
    async fn test_duration_counts_only_while_connected() {
        let mut alice = Harness::new("alice");
        let mut bob = Harness::new("bob");

        alice
            .machine
            .start_call(bob.user.clone(), CallType::Voice)
            .await
            .unwrap();
        alice.tick(4).await;
        assert_eq!(alice.machine.duration_secs(), 0);

        alice.deliver_to(&mut bob).await;
        bob.tick(4).await;
        assert_eq!(bob.machine.duration_secs(), 0);

        bob.machine.accept_call().await.unwrap();
        bob.deliver_to(&mut alice).await;
        alice.tick(2).await;
        bob.tick(2).await;
        assert_eq!(alice.machine.duration_secs(), 2);
        assert_eq!(bob.machine.duration_secs(), 2);

        bob.machine.end_call().await;
        assert_eq!(bob.machine.duration_secs(), 0);
        bob.tick(3).await;
        assert_eq!(bob.machine.duration_secs(), 0);
    }

    #[tokio::test]
    async fn test_mute_and_camera_follow_the_stream() {
        let mut alice = Harness::new("alice");
        let mut bob = Harness::new("bob");

        // Nothing to mute without a call.
        assert!(!alice.machine.toggle_mute());

        connect(&mut alice, &mut bob, CallType::Voice).await;
        assert!(alice.machine.toggle_mute());
        let stream = alice.machine.local_stream().unwrap().clone();
        assert!(!stream.tracks_of(TrackKind::Audio).any(|t| t.is_enabled()));
        assert!(alice.machine.snapshot().muted);

        // Voice calls have no camera to turn off.
        assert!(!alice.machine.toggle_camera());

        assert!(!alice.machine.toggle_mute());
        assert!(stream.tracks_of(TrackKind::Audio).all(|t| t.is_enabled()));

        alice.machine.toggle_mute();
        alice.machine.end_call().await;
        assert!(!alice.machine.snapshot().muted);

        let mut carol = Harness::new("carol");
        connect(&mut alice, &mut carol, CallType::Video).await;
        assert!(alice.machine.toggle_camera());
        let stream = alice.machine.local_stream().unwrap();
        assert!(!stream.tracks_of(TrackKind::Video).any(|t| t.is_enabled()));
        assert!(stream.tracks_of(TrackKind::Audio).all(|t| t.is_enabled()));
    }

    #[tokio::test]
    async fn test_simultaneous_calls_settle_on_one() {
        let mut alice = Harness::new("alice");
        let mut bob = Harness::new("bob");

        alice
            .machine
            .start_call(bob.user.clone(), CallType::Voice)
            .await
            .unwrap();
        bob.machine
            .start_call(alice.user.clone(), CallType::Voice)
            .await
            .unwrap();
        let alice_call = call_id(&alice);
        let bob_call = call_id(&bob);

        // Bob has the higher id: he drops his attempt and answers Alice's.
        alice.deliver_to(&mut bob).await;
        assert_eq!(bob.machine.state(), CallState::Connected);
        assert_eq!(call_id(&bob), alice_call);
        assert!(bob.connector.log(0).closed);

        // Alice ignores Bob's offer and takes his answer.
        assert_eq!(bob.deliver_to(&mut alice).await, vec!["offer", "answer"]);
        assert_eq!(alice.machine.state(), CallState::Connected);
        assert_eq!(call_id(&alice), alice_call);
        assert_eq!(alice.connector.count(), 1);

        let ops = bob.records.wait_for(3).await;
        assert!(ops.contains(&format!("end {} ended 0", bob_call)));
        assert!(ops.contains(&format!("answer {}", alice_call)));
    }

    #[tokio::test]
    async fn test_unanswered_call_times_out() {
        let mut alice = Harness::with_ring_timeout("alice", 3);
        alice
            .machine
            .start_call(UserId::new("bob"), CallType::Voice)
            .await
            .unwrap();
        let id = call_id(&alice);

        alice.tick(2).await;
        assert_eq!(alice.machine.state(), CallState::Calling);
        alice.tick(1).await;
        assert_clean(&alice);
        assert_eq!(last_cause(&alice), EndCause::NoAnswer);
        assert_eq!(alice.sent.kinds(), vec!["offer", "end"]);
        assert_eq!(
            alice.records.wait_for(2).await[1],
            format!("end {} ended 0", id)
        );
    }

    #[tokio::test]
    async fn test_zero_ring_timeout_waits_forever() {
        let mut alice = Harness::new("alice");
        alice
            .machine
            .start_call(UserId::new("bob"), CallType::Voice)
            .await
            .unwrap();
        alice.tick(600).await;
        assert_eq!(alice.machine.state(), CallState::Calling);
    }

    #[tokio::test]
    async fn test_caller_media_failure_sends_nothing() {
        let mut alice = Harness::new("alice");
        alice.devices.set_deny(true);

        let err = alice
            .machine
            .start_call(UserId::new("bob"), CallType::Video)
            .await
            .unwrap_err();
        assert!(matches!(err, CallError::Media(MediaError::PermissionDenied)));
        assert_clean(&alice);
        assert_eq!(last_cause(&alice), EndCause::MediaUnavailable);
        assert!(alice.sent.take().is_empty());
        assert_eq!(alice.connector.count(), 0);

        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert!(alice.records.ops().is_empty());
    }

    #[tokio::test]
    async fn test_receiver_media_failure_rejects() {
        let mut alice = Harness::new("alice");
        let mut bob = Harness::new("bob");
        bob.devices.set_deny(true);

        alice
            .machine
            .start_call(bob.user.clone(), CallType::Voice)
            .await
            .unwrap();
        alice.deliver_to(&mut bob).await;

        let err = bob.machine.accept_call().await.unwrap_err();
        assert!(matches!(err, CallError::Media(_)));
        assert_clean(&bob);

        assert_eq!(bob.deliver_to(&mut alice).await, vec!["end"]);
        assert_clean(&alice);
        assert_eq!(last_cause(&alice), EndCause::RemoteRejected);
    }

    #[tokio::test]
    async fn test_caller_negotiation_failure_cleans_up_locally() {
        let mut alice = Harness::new("alice");
        alice.connector.fail_next();

        let err = alice
            .machine
            .start_call(UserId::new("bob"), CallType::Voice)
            .await
            .unwrap_err();
        assert!(matches!(err, CallError::Negotiation(_)));
        assert_clean(&alice);
        assert_eq!(last_cause(&alice), EndCause::NegotiationFailed);
        assert!(alice.sent.take().is_empty());
    }

    #[tokio::test]
    async fn test_receiver_negotiation_failure_ends_call() {
        let mut alice = Harness::new("alice");
        let mut bob = Harness::new("bob");
        bob.connector.fail_next();

        alice
            .machine
            .start_call(bob.user.clone(), CallType::Voice)
            .await
            .unwrap();
        alice.deliver_to(&mut bob).await;

        let err = bob.machine.accept_call().await.unwrap_err();
        assert!(matches!(err, CallError::Negotiation(_)));
        assert_clean(&bob);
        assert_eq!(bob.sent.kinds(), vec!["end"]);
    }
}
