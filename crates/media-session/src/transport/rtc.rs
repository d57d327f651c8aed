//! [`PeerTransport`] backed by a webrtc-rs peer connection.

use std::sync::Arc;

use async_trait::async_trait;
use signaling_store::SdpType;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::setting_engine::SettingEngine;
use webrtc::api::{APIBuilder, API};
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::track::track_local::TrackLocal;

use super::{
    Description, EventSender, IceCandidate, PeerState, PeerTransport, RemoteTrack, TrackSender,
    TransportError, TransportEvent, TransportFactory, TransportResult,
};
use crate::config::IceServer;
use crate::media::{LocalTrack, TrackKind};

fn build_api(setting: SettingEngine) -> Result<API, TransportError> {
    let mut media_engine = MediaEngine::default();
    media_engine
        .register_default_codecs()
        .map_err(to_setup_error)?;

    let mut registry = Registry::new();
    registry =
        register_default_interceptors(registry, &mut media_engine).map_err(to_setup_error)?;

    Ok(APIBuilder::new()
        .with_setting_engine(setting)
        .with_media_engine(media_engine)
        .with_interceptor_registry(registry)
        .build())
}

fn to_setup_error<E: std::fmt::Display>(err: E) -> TransportError {
    TransportError::Setup(err.to_string())
}

fn to_negotiation_error<E: std::fmt::Display>(err: E) -> TransportError {
    TransportError::Negotiation(err.to_string())
}

fn track_kind(codec: RTPCodecType) -> Option<TrackKind> {
    match codec {
        RTPCodecType::Audio => Some(TrackKind::Audio),
        RTPCodecType::Video => Some(TrackKind::Video),
        _ => None,
    }
}

fn peer_state(state: RTCPeerConnectionState) -> PeerState {
    match state {
        RTCPeerConnectionState::Connecting => PeerState::Connecting,
        RTCPeerConnectionState::Connected => PeerState::Connected,
        RTCPeerConnectionState::Disconnected => PeerState::Disconnected,
        RTCPeerConnectionState::Failed => PeerState::Failed,
        RTCPeerConnectionState::Closed => PeerState::Closed,
        _ => PeerState::New,
    }
}

#[derive(Default)]
pub struct RtcTransportFactory {
    setting: Option<SettingEngine>,
}

impl RtcTransportFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_setting_engine(setting: SettingEngine) -> Self {
        Self {
            setting: Some(setting),
        }
    }
}

#[async_trait]
impl TransportFactory for RtcTransportFactory {
    async fn create(
        &self,
        ice_servers: &[IceServer],
        events: EventSender,
    ) -> TransportResult<Arc<dyn PeerTransport>> {
        let api = build_api(self.setting.clone().unwrap_or_default())?;
        let config = RTCConfiguration {
            ice_servers: ice_servers.to_vec(),
            ..Default::default()
        };
        let pc = Arc::new(
            api.new_peer_connection(config)
                .await
                .map_err(to_setup_error)?,
        );

        let candidate_events = events.clone();
        pc.on_ice_candidate(Box::new(move |candidate| {
            let tx = candidate_events.clone();
            Box::pin(async move {
                let Some(candidate) = candidate else {
                    return;
                };
                match candidate.to_json() {
                    Ok(init) => {
                        let _ = tx.send(TransportEvent::LocalCandidate(IceCandidate {
                            candidate: init.candidate,
                            sdp_mid: init.sdp_mid,
                            sdp_mline_index: init.sdp_mline_index,
                            username_fragment: init.username_fragment,
                        }));
                    }
                    Err(err) => {
                        tracing::warn!(
                            target: "media_session::transport",
                            error = %err,
                            "local candidate serialization failed"
                        );
                    }
                }
            })
        }));

        let track_events = events.clone();
        pc.on_track(Box::new(move |track, _receiver, _transceiver| {
            let tx = track_events.clone();
            Box::pin(async move {
                let Some(kind) = track_kind(track.kind()) else {
                    return;
                };
                tracing::debug!(
                    target: "media_session::transport",
                    track = %track.id(),
                    ?kind,
                    "remote track announced"
                );
                let _ = tx.send(TransportEvent::RemoteTrack(RemoteTrack {
                    id: track.id(),
                    kind,
                    stream_id: track.stream_id(),
                    handle: Some(track),
                }));
            })
        }));

        pc.on_peer_connection_state_change(Box::new(move |state| {
            let tx = events.clone();
            Box::pin(async move {
                tracing::debug!(
                    target: "media_session::transport",
                    ?state,
                    "peer connection state changed"
                );
                let _ = tx.send(TransportEvent::StateChanged(peer_state(state)));
            })
        }));

        Ok(Arc::new(RtcPeerTransport { pc }))
    }
}

pub struct RtcPeerTransport {
    pc: Arc<RTCPeerConnection>,
}

impl RtcPeerTransport {
    fn to_rtc(description: Description) -> TransportResult<RTCSessionDescription> {
        match description.sdp_type {
            SdpType::Offer => RTCSessionDescription::offer(description.sdp),
            SdpType::Answer => RTCSessionDescription::answer(description.sdp),
        }
        .map_err(to_negotiation_error)
    }
}

#[async_trait]
impl PeerTransport for RtcPeerTransport {
    async fn add_track(&self, track: &LocalTrack) -> TransportResult<Arc<dyn TrackSender>> {
        let local: Arc<dyn TrackLocal + Send + Sync> = track.rtc_track();
        let sender = self.pc.add_track(local).await.map_err(to_setup_error)?;

        // Drain RTCP so interceptors keep running.
        let reader = Arc::clone(&sender);
        tokio::spawn(async move {
            let mut buf = vec![0u8; 1500];
            while reader.read(&mut buf).await.is_ok() {}
        });

        Ok(Arc::new(RtcTrackSender { sender }))
    }

    async fn senders(&self) -> Vec<Arc<dyn TrackSender>> {
        self.pc
            .get_senders()
            .await
            .into_iter()
            .map(|sender| Arc::new(RtcTrackSender { sender }) as Arc<dyn TrackSender>)
            .collect()
    }

    async fn create_offer(&self) -> TransportResult<Description> {
        let offer = self
            .pc
            .create_offer(None)
            .await
            .map_err(to_negotiation_error)?;
        Ok(Description::offer(offer.sdp))
    }

    async fn create_answer(&self) -> TransportResult<Description> {
        let answer = self
            .pc
            .create_answer(None)
            .await
            .map_err(to_negotiation_error)?;
        Ok(Description::answer(answer.sdp))
    }

    async fn set_local_description(&self, description: Description) -> TransportResult<()> {
        let description = Self::to_rtc(description)?;
        self.pc
            .set_local_description(description)
            .await
            .map_err(to_negotiation_error)
    }

    async fn set_remote_description(&self, description: Description) -> TransportResult<()> {
        let description = Self::to_rtc(description)?;
        self.pc
            .set_remote_description(description)
            .await
            .map_err(to_negotiation_error)
    }

    async fn has_remote_description(&self) -> bool {
        self.pc.remote_description().await.is_some()
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> TransportResult<()> {
        if !self.has_remote_description().await {
            return Err(TransportError::NoRemoteDescription);
        }
        self.pc
            .add_ice_candidate(RTCIceCandidateInit {
                candidate: candidate.candidate,
                sdp_mid: candidate.sdp_mid,
                sdp_mline_index: candidate.sdp_mline_index,
                username_fragment: candidate.username_fragment,
            })
            .await
            .map_err(|err| TransportError::Candidate(err.to_string()))
    }

    async fn close(&self) -> TransportResult<()> {
        self.pc.close().await.map_err(to_setup_error)
    }
}

struct RtcTrackSender {
    sender: Arc<RTCRtpSender>,
}

#[async_trait]
impl TrackSender for RtcTrackSender {
    async fn kind(&self) -> Option<TrackKind> {
        let track = self.sender.track().await?;
        track_kind(track.kind())
    }

    async fn track_id(&self) -> Option<String> {
        let track = self.sender.track().await?;
        Some(track.id().to_owned())
    }

    async fn replace_track(&self, track: &LocalTrack) -> TransportResult<()> {
        let local: Arc<dyn TrackLocal + Send + Sync> = track.rtc_track();
        self.sender
            .replace_track(Some(local))
            .await
            .map_err(|err| TransportError::Track(err.to_string()))
    }
}
