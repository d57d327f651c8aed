//! Peer transport seam: what the engine needs from a WebRTC peer connection.

pub mod rtc;

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use signaling_store::SdpType;
use thiserror::Error;
use tokio::sync::mpsc;
use webrtc::track::track_remote::TrackRemote;

use crate::config::IceServer;
use crate::media::{LocalTrack, TrackKind};

pub use rtc::RtcTransportFactory;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("transport setup failed: {0}")]
    Setup(String),
    #[error("negotiation failed: {0}")]
    Negotiation(String),
    #[error("candidate rejected: {0}")]
    Candidate(String),
    #[error("remote description not set")]
    NoRemoteDescription,
    #[error("track replacement failed: {0}")]
    Track(String),
    #[error("transport closed")]
    Closed,
}

pub type TransportResult<T> = Result<T, TransportError>;

/// Local or remote session description as the transport sees it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Description {
    pub sdp_type: SdpType,
    pub sdp: String,
}

impl Description {
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

/// Connectivity candidate in the browser's `RTCIceCandidateInit` JSON shape.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(default)]
    pub sdp_mid: Option<String>,
    #[serde(default, rename = "sdpMLineIndex")]
    pub sdp_mline_index: Option<u16>,
    #[serde(default)]
    pub username_fragment: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

/// A track announced by the remote peer.
#[derive(Clone)]
pub struct RemoteTrack {
    pub id: String,
    pub kind: TrackKind,
    pub stream_id: String,
    /// Live RTP source; absent for transports that carry no real media.
    pub handle: Option<Arc<TrackRemote>>,
}

impl fmt::Debug for RemoteTrack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteTrack")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("stream_id", &self.stream_id)
            .field("live", &self.handle.is_some())
            .finish()
    }
}

#[derive(Debug, Clone)]
pub enum TransportEvent {
    LocalCandidate(IceCandidate),
    RemoteTrack(RemoteTrack),
    StateChanged(PeerState),
}

pub type EventSender = mpsc::UnboundedSender<TransportEvent>;

/// Outbound slot carrying one local track.
#[async_trait]
pub trait TrackSender: Send + Sync {
    async fn kind(&self) -> Option<TrackKind>;

    async fn track_id(&self) -> Option<String>;

    /// Swap the outgoing track without renegotiating.
    async fn replace_track(&self, track: &LocalTrack) -> TransportResult<()>;
}

#[async_trait]
pub trait PeerTransport: Send + Sync {
    async fn add_track(&self, track: &LocalTrack) -> TransportResult<Arc<dyn TrackSender>>;

    async fn senders(&self) -> Vec<Arc<dyn TrackSender>>;

    async fn create_offer(&self) -> TransportResult<Description>;

    async fn create_answer(&self) -> TransportResult<Description>;

    async fn set_local_description(&self, description: Description) -> TransportResult<()>;

    async fn set_remote_description(&self, description: Description) -> TransportResult<()>;

    async fn has_remote_description(&self) -> bool;

    /// Fails with [`TransportError::NoRemoteDescription`] before a remote description
    /// has been applied.
    async fn add_ice_candidate(&self, candidate: IceCandidate) -> TransportResult<()>;

    async fn close(&self) -> TransportResult<()>;
}

/// Creates one transport per call. Events flow on `events` until the transport closes.
#[async_trait]
pub trait TransportFactory: Send + Sync {
    async fn create(
        &self,
        ice_servers: &[IceServer],
        events: EventSender,
    ) -> TransportResult<Arc<dyn PeerTransport>>;
}

/// Finds the sender currently carrying video.
pub async fn video_sender(transport: &dyn PeerTransport) -> Option<Arc<dyn TrackSender>> {
    for sender in transport.senders().await {
        if sender.kind().await == Some(TrackKind::Video) {
            return Some(sender);
        }
    }
    None
}
