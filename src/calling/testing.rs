//! In-memory collaborators for exercising the call machine without a
//! network, devices or a WebRTC engine.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::{mpsc, watch};

use super::machine::{CallDeps, CallMachine};
use super::media::{LocalStream, LocalTrack, MediaDevices, MediaError, TrackKind, TrackSource};
use super::peer::{
    PeerConnection, PeerConnector, PeerEvent, PeerEventKind, PeerEvents, RemoteStream, SdpType,
    SessionDescription,
};
use super::records::CallRecordStore;
use crate::signaling::{
    CallId, CallType, EndReason, IceCandidate, Inbound, SignalMessage, SignalSender, UserId,
};

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

/// What one fake connection was asked to do.
#[derive(Debug, Clone, Default)]
pub struct PeerLog {
    pub call_id: Option<CallId>,
    pub tracks: Vec<String>,
    pub local: Option<SessionDescription>,
    pub remote: Option<SessionDescription>,
    pub candidates: Vec<IceCandidate>,
    pub closed: bool,
}

pub struct FakePeer {
    call_id: CallId,
    log: Arc<Mutex<PeerLog>>,
}

#[async_trait]
impl PeerConnection for FakePeer {
    async fn add_local_tracks(&self, stream: &LocalStream) -> Result<()> {
        let mut log = lock(&self.log);
        log.tracks
            .extend(stream.tracks().iter().map(|t| t.id().to_string()));
        Ok(())
    }

    async fn create_offer(&self) -> Result<SessionDescription> {
        Ok(SessionDescription::offer(format!("v=0 offer {}", self.call_id)))
    }

    async fn create_answer(&self) -> Result<SessionDescription> {
        let log = lock(&self.log);
        match &log.remote {
            Some(desc) if desc.sdp_type == SdpType::Offer => Ok(SessionDescription::answer(
                format!("v=0 answer {}", self.call_id),
            )),
            _ => anyhow::bail!("no remote offer"),
        }
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<()> {
        lock(&self.log).local = Some(desc);
        Ok(())
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<()> {
        lock(&self.log).remote = Some(desc);
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()> {
        let mut log = lock(&self.log);
        if log.remote.is_none() {
            anyhow::bail!("candidate before remote description");
        }
        log.candidates.push(candidate);
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        lock(&self.log).closed = true;
        Ok(())
    }
}

/// Hands out [`FakePeer`]s and keeps their logs and event sinks.
#[derive(Default)]
pub struct FakeConnector {
    peers: Mutex<Vec<(Arc<Mutex<PeerLog>>, PeerEvents)>>,
    fail: AtomicBool,
}

impl FakeConnector {
    /// Make every following `create` fail.
    pub fn fail_next(&self) {
        self.fail.store(true, Ordering::SeqCst);
    }

    pub fn count(&self) -> usize {
        lock(&self.peers).len()
    }

    pub fn log(&self, index: usize) -> PeerLog {
        lock(&lock(&self.peers)[index].0).clone()
    }

    pub fn last(&self) -> PeerLog {
        let peers = lock(&self.peers);
        let (log, _) = peers.last().expect("no peer created");
        let log = lock(log).clone();
        log
    }

    /// Emit an engine event from the most recent connection.
    pub fn emit(&self, kind: PeerEventKind) {
        let peers = lock(&self.peers);
        let (_, events) = peers.last().expect("no peer created");
        events.emit(kind);
    }
}

#[async_trait]
impl PeerConnector for FakeConnector {
    async fn create(&self, events: PeerEvents) -> Result<Box<dyn PeerConnection>> {
        if self.fail.load(Ordering::SeqCst) {
            anyhow::bail!("peer connection refused");
        }
        let log = Arc::new(Mutex::new(PeerLog {
            call_id: Some(events.call_id().clone()),
            ..Default::default()
        }));
        let call_id = events.call_id().clone();
        lock(&self.peers).push((log.clone(), events));
        Ok(Box::new(FakePeer { call_id, log }))
    }
}

/// Devices that always succeed unless told to deny.
#[derive(Default)]
pub struct FakeDevices {
    deny: AtomicBool,
    acquired: Mutex<Vec<LocalStream>>,
}

impl FakeDevices {
    pub fn set_deny(&self, deny: bool) {
        self.deny.store(deny, Ordering::SeqCst);
    }

    /// Every stream handed out so far, sharing flags with the originals.
    pub fn acquired(&self) -> Vec<LocalStream> {
        lock(&self.acquired).clone()
    }
}

#[async_trait]
impl MediaDevices for FakeDevices {
    async fn acquire(&self, call_type: CallType) -> Result<LocalStream, MediaError> {
        if self.deny.load(Ordering::SeqCst) {
            return Err(MediaError::PermissionDenied);
        }
        let mut tracks = vec![LocalTrack::new(TrackKind::Audio, TrackSource::Tone)];
        if call_type.has_video() {
            tracks.push(LocalTrack::new(TrackKind::Video, TrackSource::Blank));
        }
        let stream = LocalStream::new(tracks);
        lock(&self.acquired).push(stream.clone());
        Ok(stream)
    }
}

/// Captures outgoing relay messages.
#[derive(Default)]
pub struct RecordingSender {
    sent: Mutex<Vec<(UserId, SignalMessage)>>,
}

impl RecordingSender {
    /// Drain everything sent so far.
    pub fn take(&self) -> Vec<(UserId, SignalMessage)> {
        std::mem::take(&mut *lock(&self.sent))
    }

    pub fn kinds(&self) -> Vec<&'static str> {
        lock(&self.sent).iter().map(|(_, m)| m.kind()).collect()
    }
}

impl SignalSender for RecordingSender {
    fn send(&self, to: &UserId, message: SignalMessage) {
        lock(&self.sent).push((to.clone(), message));
    }
}

/// Record store keeping one line per write.
#[derive(Default)]
pub struct MemoryRecords {
    ops: Mutex<Vec<String>>,
    fail_register: bool,
}

impl MemoryRecords {
    pub fn failing_register() -> Self {
        Self {
            ops: Mutex::default(),
            fail_register: true,
        }
    }

    pub fn ops(&self) -> Vec<String> {
        lock(&self.ops).clone()
    }

    /// Wait until `n` writes have landed (writes run on a background task).
    pub async fn wait_for(&self, n: usize) -> Vec<String> {
        for _ in 0..200 {
            if lock(&self.ops).len() >= n {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        self.ops()
    }
}

#[async_trait]
impl CallRecordStore for MemoryRecords {
    async fn register_call(
        &self,
        call_id: &CallId,
        receiver: &UserId,
        call_type: CallType,
        _offer: &str,
    ) -> Result<String> {
        if self.fail_register {
            anyhow::bail!("record service unavailable");
        }
        lock(&self.ops).push(format!("register {} {} {}", call_id, receiver, call_type));
        Ok(format!("rec-{}", call_id))
    }

    async fn record_answer(&self, call_id: &CallId, _answer: &str) -> Result<()> {
        lock(&self.ops).push(format!("answer {}", call_id));
        Ok(())
    }

    async fn record_end(&self, call_id: &CallId, reason: EndReason, duration_secs: u64) -> Result<()> {
        lock(&self.ops).push(format!("end {} {} {}", call_id, reason, duration_secs));
        Ok(())
    }
}

/// One user's call machine wired to fakes.
pub struct Harness {
    pub user: UserId,
    pub machine: CallMachine,
    pub devices: Arc<FakeDevices>,
    pub connector: Arc<FakeConnector>,
    pub sent: Arc<RecordingSender>,
    pub records: Arc<MemoryRecords>,
    pub remote: watch::Receiver<Option<RemoteStream>>,
    events: mpsc::UnboundedReceiver<PeerEvent>,
}

impl Harness {
    pub fn new(user: &str) -> Self {
        Self::with_ring_timeout(user, 0)
    }

    pub fn with_ring_timeout(user: &str, ring_timeout_secs: u64) -> Self {
        let user = UserId::new(user);
        let devices = Arc::new(FakeDevices::default());
        let connector = Arc::new(FakeConnector::default());
        let sent = Arc::new(RecordingSender::default());
        let records = Arc::new(MemoryRecords::default());
        let deps = CallDeps {
            media: devices.clone(),
            connector: connector.clone(),
            signals: sent.clone(),
            records: records.clone(),
        };
        let (events_tx, events) = mpsc::unbounded_channel();
        let (sink, remote) = super::peer::RemoteMediaSink::new();
        let machine = CallMachine::new(user.clone(), deps, events_tx, sink, ring_timeout_secs);
        Self {
            user,
            machine,
            devices,
            connector,
            sent,
            records,
            remote,
            events,
        }
    }

    /// Feed every pending engine event into the machine.
    pub async fn pump_events(&mut self) {
        while let Ok(event) = self.events.try_recv() {
            self.machine.on_peer_event(event).await;
        }
    }

    /// Deliver everything this side sent to `other`, as the relay would.
    /// Returns the kinds delivered.
    pub async fn deliver_to(&mut self, other: &mut Harness) -> Vec<&'static str> {
        let mut kinds = Vec::new();
        for (to, message) in self.sent.take() {
            if to != other.user {
                continue;
            }
            kinds.push(message.kind());
            other
                .machine
                .handle_signal(Inbound {
                    from: self.user.clone(),
                    message,
                })
                .await;
        }
        kinds
    }

    pub async fn tick(&mut self, secs: u64) {
        for _ in 0..secs {
            self.machine.on_tick().await;
        }
    }
}
