//! Local capture: tracks, the devices behind them, and the acquisition seam.

mod synthetic;

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::watch;
use webrtc::api::media_engine::{MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;

pub use synthetic::{DeviceAvailability, SyntheticMedia};

pub const STREAM_ID: &str = "callroom";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TrackKind {
    Audio,
    Video,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TrackSource {
    Microphone,
    Camera,
    Screen,
}

impl TrackSource {
    pub fn kind(self) -> TrackKind {
        match self {
            TrackSource::Microphone => TrackKind::Audio,
            TrackSource::Camera | TrackSource::Screen => TrackKind::Video,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            TrackSource::Microphone => "microphone",
            TrackSource::Camera => "camera",
            TrackSource::Screen => "screen",
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum MediaError {
    #[error("permission denied for {0}")]
    PermissionDenied(String),
    #[error("{0} not found")]
    DeviceNotFound(String),
    #[error("{0} is busy")]
    DeviceBusy(String),
}

/// Hardware (or synthetic) producer behind a [`LocalTrack`].
pub trait CaptureDevice: Send + Sync {
    /// Release the device. Called at most once per track.
    fn stop(&self);
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MediaConstraints {
    pub video: bool,
    pub audio: bool,
}

impl MediaConstraints {
    pub fn camera_and_microphone() -> Self {
        Self {
            video: true,
            audio: true,
        }
    }

    /// Video without audio: a camera on its own, or a screen without system audio.
    pub fn video_only() -> Self {
        Self {
            video: true,
            audio: false,
        }
    }
}

/// Source of local media. Failures are surfaced to the user and never retried here.
#[async_trait]
pub trait MediaAcquisition: Send + Sync {
    async fn get_user_media(&self, constraints: MediaConstraints) -> Result<LocalMedia, MediaError>;

    /// Screen capture. The returned video track ends on its own when the platform
    /// stops sharing. Sources that cannot capture system audio ignore `constraints.audio`.
    async fn get_display_media(&self, constraints: MediaConstraints)
        -> Result<LocalMedia, MediaError>;
}

struct TrackInner {
    id: String,
    source: TrackSource,
    enabled: AtomicBool,
    live: watch::Sender<bool>,
    capture: Box<dyn CaptureDevice>,
    rtc: Arc<TrackLocalStaticSample>,
}

/// A captured track. Clones share the same underlying device.
#[derive(Clone)]
pub struct LocalTrack {
    inner: Arc<TrackInner>,
}

/// Non-owning handle for producers that must not keep a track alive.
#[derive(Clone)]
pub struct WeakTrack {
    inner: Weak<TrackInner>,
}

impl WeakTrack {
    pub fn upgrade(&self) -> Option<LocalTrack> {
        self.inner.upgrade().map(|inner| LocalTrack { inner })
    }
}

fn codec_for(kind: TrackKind) -> RTCRtpCodecCapability {
    match kind {
        TrackKind::Audio => RTCRtpCodecCapability {
            mime_type: MIME_TYPE_OPUS.to_owned(),
            clock_rate: 48000,
            channels: 2,
            sdp_fmtp_line: "minptime=10;useinbandfec=1".to_owned(),
            rtcp_feedback: vec![],
        },
        TrackKind::Video => RTCRtpCodecCapability {
            mime_type: MIME_TYPE_VP8.to_owned(),
            clock_rate: 90000,
            channels: 0,
            sdp_fmtp_line: String::new(),
            rtcp_feedback: vec![],
        },
    }
}

impl LocalTrack {
    pub fn new(source: TrackSource, capture: Box<dyn CaptureDevice>) -> Self {
        let id = format!("{}-{}", source.label(), uuid::Uuid::new_v4());
        let rtc = Arc::new(TrackLocalStaticSample::new(
            codec_for(source.kind()),
            id.clone(),
            STREAM_ID.to_owned(),
        ));
        let (live, _) = watch::channel(true);
        Self {
            inner: Arc::new(TrackInner {
                id,
                source,
                enabled: AtomicBool::new(true),
                live,
                capture,
                rtc,
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn kind(&self) -> TrackKind {
        self.inner.source.kind()
    }

    pub fn source(&self) -> TrackSource {
        self.inner.source
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.enabled.load(Ordering::SeqCst)
    }

    /// Mutes or unmutes without touching the device.
    pub fn set_enabled(&self, enabled: bool) {
        self.inner.enabled.store(enabled, Ordering::SeqCst);
    }

    pub fn is_live(&self) -> bool {
        *self.inner.live.borrow()
    }

    /// Ends the track and releases its device. Returns `false` if it had already ended.
    pub fn stop(&self) -> bool {
        let was_live = self.inner.live.send_replace(false);
        if was_live {
            self.inner.capture.stop();
            tracing::debug!(
                target: "media_session::media",
                track = %self.inner.id,
                source = self.inner.source.label(),
                "track stopped"
            );
        }
        was_live
    }

    /// Resolves once the track has ended, whoever ended it.
    pub async fn ended(&self) {
        let mut rx = self.inner.live.subscribe();
        // The sender lives in `self`, so the channel cannot close under us.
        let _ = rx.wait_for(|live| !*live).await;
    }

    pub fn rtc_track(&self) -> Arc<TrackLocalStaticSample> {
        Arc::clone(&self.inner.rtc)
    }

    pub fn downgrade(&self) -> WeakTrack {
        WeakTrack {
            inner: Arc::downgrade(&self.inner),
        }
    }

    pub fn same_track(&self, other: &LocalTrack) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl fmt::Debug for LocalTrack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalTrack")
            .field("id", &self.inner.id)
            .field("source", &self.inner.source)
            .field("enabled", &self.is_enabled())
            .field("live", &self.is_live())
            .finish()
    }
}

/// The set of tracks one acquisition produced.
#[derive(Clone, Debug, Default)]
pub struct LocalMedia {
    tracks: Vec<LocalTrack>,
}

impl LocalMedia {
    pub fn new(tracks: Vec<LocalTrack>) -> Self {
        Self { tracks }
    }

    pub fn tracks(&self) -> &[LocalTrack] {
        &self.tracks
    }

    pub fn is_empty(&self) -> bool {
        self.tracks.is_empty()
    }

    pub fn audio_track(&self) -> Option<&LocalTrack> {
        self.tracks.iter().find(|t| t.kind() == TrackKind::Audio)
    }

    pub fn video_track(&self) -> Option<&LocalTrack> {
        self.tracks.iter().find(|t| t.kind() == TrackKind::Video)
    }

    /// Swaps the video track, returning the one it displaced.
    pub fn replace_video(&mut self, track: LocalTrack) -> Option<LocalTrack> {
        match self.tracks.iter_mut().find(|t| t.kind() == TrackKind::Video) {
            Some(slot) => Some(std::mem::replace(slot, track)),
            None => {
                self.tracks.push(track);
                None
            }
        }
    }

    pub fn into_tracks(self) -> Vec<LocalTrack> {
        self.tracks
    }

    /// Stops every track; returns how many were still live.
    pub fn stop_all(&self) -> usize {
        self.tracks.iter().filter(|t| t.stop()).count()
    }
}
