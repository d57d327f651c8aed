use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use webrtc::media::Sample;

use super::{
    CaptureDevice, LocalMedia, LocalTrack, MediaAcquisition, MediaConstraints, MediaError,
    TrackSource,
};

// Opus DTX silence frame.
const OPUS_SILENCE: &[u8] = &[0xf8, 0xff, 0xfe];
// Tiny VP8 inter-frame; receivers only need bytes to packetize.
const VP8_FILLER: &[u8] = &[0x31, 0x02, 0x00, 0x9d, 0x01, 0x2a, 0x10, 0x00, 0x10, 0x00];

const AUDIO_FRAME: Duration = Duration::from_millis(20);
const VIDEO_FRAME: Duration = Duration::from_millis(33);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DeviceAvailability {
    #[default]
    Ready,
    Missing,
    Busy,
    Denied,
}

impl DeviceAvailability {
    fn check(self, source: TrackSource) -> Result<(), MediaError> {
        let name = source.label().to_string();
        match self {
            DeviceAvailability::Ready => Ok(()),
            DeviceAvailability::Missing => Err(MediaError::DeviceNotFound(name)),
            DeviceAvailability::Busy => Err(MediaError::DeviceBusy(name)),
            DeviceAvailability::Denied => Err(MediaError::PermissionDenied(name)),
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct Devices {
    camera: DeviceAvailability,
    microphone: DeviceAvailability,
    screen: DeviceAvailability,
}

/// Generated media for headless endpoints: silence and filler frames paced like
/// real capture, written only while the track is enabled.
#[derive(Default)]
pub struct SyntheticMedia {
    devices: Mutex<Devices>,
}

impl SyntheticMedia {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_availability(&self, source: TrackSource, availability: DeviceAvailability) {
        let mut devices = self.devices.lock();
        match source {
            TrackSource::Camera => devices.camera = availability,
            TrackSource::Microphone => devices.microphone = availability,
            TrackSource::Screen => devices.screen = availability,
        }
    }

    fn open(&self, source: TrackSource) -> LocalTrack {
        let pump = PumpHandle::default();
        let track = LocalTrack::new(source, Box::new(pump.clone()));
        pump.attach(tokio::spawn(run_pump(track.downgrade(), source)));
        track
    }
}

#[async_trait]
impl MediaAcquisition for SyntheticMedia {
    async fn get_user_media(&self, constraints: MediaConstraints) -> Result<LocalMedia, MediaError> {
        let devices = *self.devices.lock();
        if constraints.audio {
            devices.microphone.check(TrackSource::Microphone)?;
        }
        if constraints.video {
            devices.camera.check(TrackSource::Camera)?;
        }

        let mut tracks = Vec::new();
        if constraints.audio {
            tracks.push(self.open(TrackSource::Microphone));
        }
        if constraints.video {
            tracks.push(self.open(TrackSource::Camera));
        }
        Ok(LocalMedia::new(tracks))
    }

    async fn get_display_media(
        &self,
        _constraints: MediaConstraints,
    ) -> Result<LocalMedia, MediaError> {
        let screen = self.devices.lock().screen;
        screen.check(TrackSource::Screen)?;
        Ok(LocalMedia::new(vec![self.open(TrackSource::Screen)]))
    }
}

#[derive(Clone, Default)]
struct PumpHandle {
    task: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl PumpHandle {
    fn attach(&self, handle: JoinHandle<()>) {
        *self.task.lock() = Some(handle);
    }
}

impl CaptureDevice for PumpHandle {
    fn stop(&self) {
        if let Some(handle) = self.task.lock().take() {
            handle.abort();
        }
    }
}

async fn run_pump(track: super::WeakTrack, source: TrackSource) {
    let (payload, frame) = match source.kind() {
        super::TrackKind::Audio => (Bytes::from_static(OPUS_SILENCE), AUDIO_FRAME),
        super::TrackKind::Video => (Bytes::from_static(VP8_FILLER), VIDEO_FRAME),
    };
    let mut ticker = tokio::time::interval(frame);
    loop {
        ticker.tick().await;
        let Some(track) = track.upgrade() else {
            break;
        };
        if !track.is_live() {
            break;
        }
        if !track.is_enabled() {
            continue;
        }
        let sample = Sample {
            data: payload.clone(),
            duration: frame,
            ..Default::default()
        };
        if let Err(err) = track.rtc_track().write_sample(&sample).await {
            tracing::trace!(
                target: "media_session::media",
                track = %track.id(),
                error = %err,
                "sample write failed"
            );
        }
    }
}
