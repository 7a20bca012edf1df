//! WebRTC engine behind the [`PeerConnection`] seam (webrtc-rs).
//!
//! Audio tracks sourced from the tone generator are paced onto a PCMU
//! track every 20 ms, sending silence while the track is disabled. Video
//! tracks are negotiated as VP8 but carry no frames. Remote tracks are
//! reported to the call machine and their RTP is drained.

use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use async_trait::async_trait;
use bytes::Bytes;
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MediaEngine, MIME_TYPE_PCMU, MIME_TYPE_VP8};
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::media::Sample;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTPCodecType};
use webrtc::rtp_transceiver::rtp_receiver::RTCRtpReceiver;
use webrtc::rtp_transceiver::RTCRtpTransceiver;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

use super::media::{LocalStream, LocalTrack, TrackKind, TrackSource};
use super::peer::{
    PeerConnection, PeerConnector, PeerEventKind, PeerEvents, PeerState, RemoteTrack, SdpType,
    SessionDescription,
};
use super::tone::{self, ToneGenerator, FRAME_DURATION};
use crate::signaling::IceCandidate;

pub const DEFAULT_STUN_SERVER: &str = "stun:stun.l.google.com:19302";

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

/// Creates webrtc-rs peer connections.
pub struct RtcConnector {
    ice_servers: Vec<String>,
}

impl RtcConnector {
    pub fn new(ice_servers: Vec<String>) -> Self {
        Self { ice_servers }
    }

    fn configuration(&self) -> RTCConfiguration {
        let ice_servers = if self.ice_servers.is_empty() {
            Vec::new()
        } else {
            vec![RTCIceServer {
                urls: self.ice_servers.clone(),
                ..Default::default()
            }]
        };
        RTCConfiguration {
            ice_servers,
            ..Default::default()
        }
    }
}

impl Default for RtcConnector {
    fn default() -> Self {
        Self::new(vec![DEFAULT_STUN_SERVER.to_string()])
    }
}

#[async_trait]
impl PeerConnector for RtcConnector {
    async fn create(&self, events: PeerEvents) -> Result<Box<dyn PeerConnection>> {
        let mut media = MediaEngine::default();
        media
            .register_default_codecs()
            .context("Failed to register codecs")?;
        let registry = register_default_interceptors(Registry::new(), &mut media)
            .context("Failed to register interceptors")?;
        let api = APIBuilder::new()
            .with_media_engine(media)
            .with_interceptor_registry(registry)
            .build();

        let pc = Arc::new(
            api.new_peer_connection(self.configuration())
                .await
                .context("Failed to create peer connection")?,
        );
        tracing::debug!("Peer connection created for call {}", events.call_id());

        let ev = events.clone();
        pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            let ev = ev.clone();
            Box::pin(async move {
                // `None` marks the end of gathering.
                let Some(candidate) = candidate else {
                    return;
                };
                match candidate.to_json() {
                    Ok(init) => ev.emit(PeerEventKind::LocalCandidate(from_init(init))),
                    Err(e) => tracing::warn!("Cannot serialise local candidate: {}", e),
                }
            })
        }));

        let ev = events.clone();
        pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
            let ev = ev.clone();
            Box::pin(async move {
                if let Some(state) = peer_state(state) {
                    ev.emit(PeerEventKind::StateChanged(state));
                }
            })
        }));

        let ev = events;
        pc.on_track(Box::new(
            move |track: Arc<TrackRemote>,
                  _receiver: Arc<RTCRtpReceiver>,
                  _transceiver: Arc<RTCRtpTransceiver>| {
                let ev = ev.clone();
                Box::pin(async move {
                    let kind = match track.kind() {
                        RTPCodecType::Video => TrackKind::Video,
                        _ => TrackKind::Audio,
                    };
                    ev.emit(PeerEventKind::RemoteTrack(RemoteTrack {
                        id: track.id(),
                        stream_id: track.stream_id(),
                        kind,
                    }));
                    tokio::spawn(async move {
                        let mut packets = 0u64;
                        while track.read_rtp().await.is_ok() {
                            packets += 1;
                        }
                        tracing::debug!("Remote {} track ended after {} packets", kind, packets);
                    });
                })
            },
        ));

        Ok(Box::new(RtcPeer {
            pc,
            pumps: Mutex::new(Vec::new()),
        }))
    }
}

pub struct RtcPeer {
    pc: Arc<RTCPeerConnection>,
    pumps: Mutex<Vec<JoinHandle<()>>>,
}

#[async_trait]
impl PeerConnection for RtcPeer {
    async fn add_local_tracks(&self, stream: &LocalStream) -> Result<()> {
        for track in stream.tracks() {
            let local = Arc::new(TrackLocalStaticSample::new(
                codec_for(track.kind()),
                track.id().to_string(),
                stream.id().to_string(),
            ));
            let sender = self
                .pc
                .add_track(Arc::clone(&local) as Arc<dyn TrackLocal + Send + Sync>)
                .await
                .with_context(|| format!("Failed to add {} track", track.kind()))?;

            // RTCP has to be read for the interceptors to run.
            let rtcp = tokio::spawn(async move {
                let mut buf = vec![0u8; 1500];
                while sender.read(&mut buf).await.is_ok() {}
            });

            let mut pumps = lock(&self.pumps);
            pumps.push(rtcp);
            if track.source() == TrackSource::Tone {
                pumps.push(tokio::spawn(pump_tone(track.clone(), local)));
            }
        }
        Ok(())
    }

    async fn create_offer(&self) -> Result<SessionDescription> {
        let offer = self
            .pc
            .create_offer(None)
            .await
            .context("Failed to create offer")?;
        Ok(SessionDescription::offer(offer.sdp))
    }

    async fn create_answer(&self) -> Result<SessionDescription> {
        let answer = self
            .pc
            .create_answer(None)
            .await
            .context("Failed to create answer")?;
        Ok(SessionDescription::answer(answer.sdp))
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<()> {
        self.pc
            .set_local_description(to_rtc(desc)?)
            .await
            .context("Failed to set local description")
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<()> {
        self.pc
            .set_remote_description(to_rtc(desc)?)
            .await
            .context("Failed to set remote description")
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()> {
        self.pc
            .add_ice_candidate(to_init(candidate))
            .await
            .context("Failed to add ICE candidate")
    }

    async fn close(&self) -> Result<()> {
        for pump in lock(&self.pumps).drain(..) {
            pump.abort();
        }
        self.pc
            .close()
            .await
            .context("Failed to close peer connection")
    }
}

/// Send the tone (or silence while disabled) until the track stops.
async fn pump_tone(track: LocalTrack, out: Arc<TrackLocalStaticSample>) {
    let mut generator = ToneGenerator::new();
    let mut pace = time::interval(FRAME_DURATION);
    pace.set_missed_tick_behavior(MissedTickBehavior::Skip);

    while track.is_live() {
        pace.tick().await;
        let data = if track.is_enabled() {
            generator.next_pcmu()
        } else {
            tone::silence_pcmu()
        };
        let sample = Sample {
            data: Bytes::from(data),
            duration: FRAME_DURATION,
            ..Default::default()
        };
        if let Err(e) = out.write_sample(&sample).await {
            tracing::debug!("Tone write failed on {}: {}", track.id(), e);
        }
    }
    tracing::debug!("Local {} track {} stopped", track.kind(), track.id());
}

fn codec_for(kind: TrackKind) -> RTCRtpCodecCapability {
    match kind {
        TrackKind::Audio => RTCRtpCodecCapability {
            mime_type: MIME_TYPE_PCMU.to_owned(),
            clock_rate: 8000,
            channels: 1,
            ..Default::default()
        },
        TrackKind::Video => RTCRtpCodecCapability {
            mime_type: MIME_TYPE_VP8.to_owned(),
            clock_rate: 90000,
            ..Default::default()
        },
    }
}

fn peer_state(state: RTCPeerConnectionState) -> Option<PeerState> {
    match state {
        RTCPeerConnectionState::New => Some(PeerState::New),
        RTCPeerConnectionState::Connecting => Some(PeerState::Connecting),
        RTCPeerConnectionState::Connected => Some(PeerState::Connected),
        RTCPeerConnectionState::Disconnected => Some(PeerState::Disconnected),
        RTCPeerConnectionState::Failed => Some(PeerState::Failed),
        RTCPeerConnectionState::Closed => Some(PeerState::Closed),
        _ => None,
    }
}

fn to_rtc(desc: SessionDescription) -> Result<RTCSessionDescription> {
    let parsed = match desc.sdp_type {
        SdpType::Offer => RTCSessionDescription::offer(desc.sdp),
        SdpType::Answer => RTCSessionDescription::answer(desc.sdp),
    };
    parsed.context("Invalid session description")
}

fn to_init(candidate: IceCandidate) -> RTCIceCandidateInit {
    RTCIceCandidateInit {
        candidate: candidate.candidate,
        sdp_mid: candidate.sdp_mid,
        sdp_mline_index: candidate.sdp_mline_index,
        username_fragment: candidate.username_fragment,
    }
}

fn from_init(init: RTCIceCandidateInit) -> IceCandidate {
    IceCandidate {
        candidate: init.candidate,
        sdp_mid: init.sdp_mid,
        sdp_mline_index: init.sdp_mline_index,
        username_fragment: init.username_fragment,
    }
}
