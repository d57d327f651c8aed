#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use media_session::config::IceServer;
use media_session::transport::{EventSender, TransportResult};
use media_session::{
    CallState, CaptureDevice, Description, EngineConfig, IceCandidate, LocalMedia, LocalTrack,
    MediaAcquisition, MediaConstraints, MediaError, NegotiationEngine, PeerState, PeerTransport,
    RemoteTrack, TrackKind, TrackSender, TrackSource, TransportError, TransportEvent,
    TransportFactory,
};
use parking_lot::Mutex;
use serde_json::Value;
use signaling_store::{
    CallSession, CallSessionPatch, CandidateDirection, CandidateRecord, MemoryStore,
    SessionStatus, SignalingStore, StoreError, StoreResult, Subscription,
};
use tokio::sync::mpsc;

pub const SESSION: &str = "appt-42";
pub const REQUESTER: &str = "client-7";
pub const INTERPRETER: &str = "interp-3";

pub fn config() -> EngineConfig {
    EngineConfig::builder().build().unwrap()
}

pub struct Endpoint {
    pub engine: NegotiationEngine,
    pub media: Arc<FakeMedia>,
    pub factory: Arc<FakeFactory>,
}

impl Endpoint {
    pub fn new(label: &str, store: Arc<dyn SignalingStore>) -> Self {
        Self::with_config(label, store, config())
    }

    pub fn with_config(label: &str, store: Arc<dyn SignalingStore>, config: EngineConfig) -> Self {
        let media = FakeMedia::new();
        let factory = FakeFactory::new(label, 2);
        let engine = NegotiationEngine::new(config, store, media.clone(), factory.clone());
        Self {
            engine,
            media,
            factory,
        }
    }

    /// Media plus transport, ready to negotiate.
    pub async fn prepare(&self) {
        self.engine.acquire_media(true, true).await.unwrap();
        self.engine.create_transport(|_| {}).await.unwrap();
    }

    pub fn transport(&self) -> Arc<FakeTransport> {
        self.factory.transport()
    }
}

/// Runs both roles to `Connected` against one store.
pub async fn connected_pair(store: Arc<dyn SignalingStore>) -> (Endpoint, Endpoint) {
    let initiator = Endpoint::new("initiator", store.clone());
    let responder = Endpoint::new("responder", store);
    initiator.prepare().await;
    responder.prepare().await;
    initiator
        .engine
        .negotiate_as_initiator(SESSION, REQUESTER)
        .await
        .unwrap();
    responder
        .engine
        .negotiate_as_responder(SESSION, INTERPRETER)
        .await
        .unwrap();
    for endpoint in [&initiator, &responder] {
        endpoint
            .engine
            .wait_for(CallState::Connected, Duration::from_secs(5))
            .await
            .unwrap();
    }
    (initiator, responder)
}

pub async fn eventually<F: Fn() -> bool>(condition: F) {
    for _ in 0..500 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached");
}

// ---------------------------------------------------------------------------
// Media

struct CountingCapture {
    stops: Arc<AtomicUsize>,
}

impl CaptureDevice for CountingCapture {
    fn stop(&self) {
        self.stops.fetch_add(1, Ordering::SeqCst);
    }
}

#[derive(Default)]
pub struct FakeMedia {
    failures: Mutex<HashMap<TrackSource, MediaError>>,
    stops: Arc<AtomicUsize>,
    acquired: Mutex<Vec<LocalTrack>>,
}

impl FakeMedia {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn fail(&self, source: TrackSource, err: MediaError) {
        self.failures.lock().insert(source, err);
    }

    /// Device releases across every track this source handed out.
    pub fn stops(&self) -> usize {
        self.stops.load(Ordering::SeqCst)
    }

    pub fn acquired(&self) -> Vec<LocalTrack> {
        self.acquired.lock().clone()
    }

    pub fn live_tracks(&self) -> usize {
        self.acquired.lock().iter().filter(|t| t.is_live()).count()
    }

    fn check(&self, source: TrackSource) -> Result<(), MediaError> {
        match self.failures.lock().get(&source) {
            Some(err) => Err(err.clone()),
            None => Ok(()),
        }
    }

    fn open(&self, source: TrackSource) -> LocalTrack {
        let track = LocalTrack::new(
            source,
            Box::new(CountingCapture {
                stops: self.stops.clone(),
            }),
        );
        self.acquired.lock().push(track.clone());
        track
    }
}

#[async_trait]
impl MediaAcquisition for FakeMedia {
    async fn get_user_media(&self, constraints: MediaConstraints) -> Result<LocalMedia, MediaError> {
        if constraints.audio {
            self.check(TrackSource::Microphone)?;
        }
        if constraints.video {
            self.check(TrackSource::Camera)?;
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
        self.check(TrackSource::Screen)?;
        Ok(LocalMedia::new(vec![self.open(TrackSource::Screen)]))
    }
}

// ---------------------------------------------------------------------------
// Transport

pub struct FakeFactory {
    label: String,
    candidates: usize,
    created: Mutex<Vec<Arc<FakeTransport>>>,
}

impl FakeFactory {
    pub fn new(label: &str, candidates: usize) -> Arc<Self> {
        Arc::new(Self {
            label: label.to_string(),
            candidates,
            created: Mutex::new(Vec::new()),
        })
    }

    pub fn transport(&self) -> Arc<FakeTransport> {
        self.created
            .lock()
            .last()
            .cloned()
            .expect("transport created")
    }
}

#[async_trait]
impl TransportFactory for FakeFactory {
    async fn create(
        &self,
        _ice_servers: &[IceServer],
        events: EventSender,
    ) -> TransportResult<Arc<dyn PeerTransport>> {
        let transport = Arc::new(FakeTransport {
            label: self.label.clone(),
            candidates: self.candidates,
            events,
            state: Mutex::new(FakeState::default()),
        });
        self.created.lock().push(transport.clone());
        Ok(transport)
    }
}

#[derive(Default)]
struct FakeState {
    local: Option<Description>,
    remote: Option<Description>,
    offers: usize,
    remote_sets: usize,
    applied: Vec<IceCandidate>,
    rejected: usize,
    emitted: Vec<IceCandidate>,
    closed: usize,
    senders: Vec<Arc<FakeSender>>,
}

/// Peer connection stand-in. Emits its local candidates when the local description
/// is set and reports `Connected` once both descriptions are in place. Like a real
/// peer connection it refuses candidates before the remote description.
pub struct FakeTransport {
    label: String,
    candidates: usize,
    events: EventSender,
    state: Mutex<FakeState>,
}

impl FakeTransport {
    pub fn remote_sets(&self) -> usize {
        self.state.lock().remote_sets
    }

    pub fn offers_created(&self) -> usize {
        self.state.lock().offers
    }

    pub fn applied_candidates(&self) -> Vec<IceCandidate> {
        self.state.lock().applied.clone()
    }

    pub fn rejected_candidates(&self) -> usize {
        self.state.lock().rejected
    }

    pub fn emitted_candidates(&self) -> Vec<IceCandidate> {
        self.state.lock().emitted.clone()
    }

    pub fn close_count(&self) -> usize {
        self.state.lock().closed
    }

    pub fn sender_replacements(&self) -> usize {
        self.state
            .lock()
            .senders
            .iter()
            .map(|s| s.replacements.load(Ordering::SeqCst))
            .sum()
    }

    pub fn video_track_id(&self) -> Option<String> {
        self.state
            .lock()
            .senders
            .iter()
            .map(|s| s.track.lock().clone())
            .find(|t| t.kind() == TrackKind::Video)
            .map(|t| t.id().to_string())
    }

    fn announce_connected_if_ready(&self, state: &FakeState) {
        if state.local.is_some() && state.remote.is_some() {
            let _ = self
                .events
                .send(TransportEvent::StateChanged(PeerState::Connected));
        }
    }
}

#[async_trait]
impl PeerTransport for FakeTransport {
    async fn add_track(&self, track: &LocalTrack) -> TransportResult<Arc<dyn TrackSender>> {
        let sender = Arc::new(FakeSender {
            track: Mutex::new(track.clone()),
            replacements: AtomicUsize::new(0),
        });
        self.state.lock().senders.push(sender.clone());
        Ok(sender)
    }

    async fn senders(&self) -> Vec<Arc<dyn TrackSender>> {
        self.state
            .lock()
            .senders
            .iter()
            .map(|s| s.clone() as Arc<dyn TrackSender>)
            .collect()
    }

    async fn create_offer(&self) -> TransportResult<Description> {
        let mut state = self.state.lock();
        state.offers += 1;
        Ok(Description::offer(format!(
            "v=0\r\no={} {} IN IP4 0.0.0.0\r\n",
            self.label, state.offers
        )))
    }

    async fn create_answer(&self) -> TransportResult<Description> {
        let state = self.state.lock();
        if state.remote.is_none() {
            return Err(TransportError::Negotiation("answer without offer".into()));
        }
        Ok(Description::answer(format!(
            "v=0\r\no={} 1 IN IP4 0.0.0.0\r\n",
            self.label
        )))
    }

    async fn set_local_description(&self, description: Description) -> TransportResult<()> {
        let mut state = self.state.lock();
        state.local = Some(description);
        for index in 0..self.candidates {
            let candidate = IceCandidate {
                candidate: format!(
                    "candidate:{}-{index} 1 udp 2122260223 10.0.0.{} 5000{index} typ host",
                    self.label,
                    index + 1
                ),
                sdp_mid: Some("0".into()),
                sdp_mline_index: Some(0),
                username_fragment: None,
            };
            state.emitted.push(candidate.clone());
            let _ = self.events.send(TransportEvent::LocalCandidate(candidate));
        }
        self.announce_connected_if_ready(&state);
        Ok(())
    }

    async fn set_remote_description(&self, description: Description) -> TransportResult<()> {
        let mut state = self.state.lock();
        state.remote = Some(description);
        state.remote_sets += 1;
        for kind in [TrackKind::Audio, TrackKind::Video] {
            let _ = self.events.send(TransportEvent::RemoteTrack(RemoteTrack {
                id: format!("remote-{kind:?}").to_lowercase(),
                kind,
                stream_id: "peer".into(),
                handle: None,
            }));
        }
        self.announce_connected_if_ready(&state);
        Ok(())
    }

    async fn has_remote_description(&self) -> bool {
        self.state.lock().remote.is_some()
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> TransportResult<()> {
        let mut state = self.state.lock();
        if state.remote.is_none() {
            state.rejected += 1;
            return Err(TransportError::NoRemoteDescription);
        }
        state.applied.push(candidate);
        Ok(())
    }

    async fn close(&self) -> TransportResult<()> {
        self.state.lock().closed += 1;
        Ok(())
    }
}

pub struct FakeSender {
    track: Mutex<LocalTrack>,
    replacements: AtomicUsize,
}

#[async_trait]
impl TrackSender for FakeSender {
    async fn kind(&self) -> Option<TrackKind> {
        Some(self.track.lock().kind())
    }

    async fn track_id(&self) -> Option<String> {
        Some(self.track.lock().id().to_string())
    }

    async fn replace_track(&self, track: &LocalTrack) -> TransportResult<()> {
        *self.track.lock() = track.clone();
        self.replacements.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Store

/// [`MemoryStore`] wrapper that counts traffic, can fail writes, and can deliver
/// every change-stream item twice.
pub struct CountingStore {
    pub inner: MemoryStore,
    replay: bool,
    gets: AtomicUsize,
    writes: AtomicUsize,
    fail_writes: AtomicBool,
}

impl CountingStore {
    pub fn new() -> Arc<Self> {
        Self::build(false)
    }

    pub fn replaying() -> Arc<Self> {
        Self::build(true)
    }

    fn build(replay: bool) -> Arc<Self> {
        Arc::new(Self {
            inner: MemoryStore::new(),
            replay,
            gets: AtomicUsize::new(0),
            writes: AtomicUsize::new(0),
            fail_writes: AtomicBool::new(false),
        })
    }

    pub fn gets(&self) -> usize {
        self.gets.load(Ordering::SeqCst)
    }

    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    fn write(&self) -> StoreResult<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("store refusing writes".into()));
        }
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn maybe_replay<T: Clone + Send + 'static>(&self, sub: Subscription<T>) -> Subscription<T> {
        if !self.replay {
            return sub;
        }
        let (mut rx, handle) = sub.into_parts();
        let (tx, out) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            while let Some(item) = rx.recv().await {
                let _ = tx.send(item.clone());
                let _ = tx.send(item);
            }
        });
        Subscription::new(out, handle)
    }
}

#[async_trait]
impl SignalingStore for CountingStore {
    async fn get(&self, session_id: &str) -> StoreResult<Option<CallSession>> {
        self.gets.fetch_add(1, Ordering::SeqCst);
        self.inner.get(session_id).await
    }

    async fn set_merge(&self, session_id: &str, patch: CallSessionPatch) -> StoreResult<()> {
        self.write()?;
        self.inner.set_merge(session_id, patch).await
    }

    async fn update(&self, session_id: &str, patch: CallSessionPatch) -> StoreResult<bool> {
        self.write()?;
        self.inner.update(session_id, patch).await
    }

    async fn subscribe(&self, session_id: &str) -> StoreResult<Subscription<CallSession>> {
        let sub = self.inner.subscribe(session_id).await?;
        Ok(self.maybe_replay(sub))
    }

    async fn append_candidate(
        &self,
        session_id: &str,
        direction: CandidateDirection,
        candidate: Value,
    ) -> StoreResult<CandidateRecord> {
        self.write()?;
        self.inner
            .append_candidate(session_id, direction, candidate)
            .await
    }

    async fn subscribe_candidates(
        &self,
        session_id: &str,
        direction: CandidateDirection,
    ) -> StoreResult<Subscription<CandidateRecord>> {
        let sub = self.inner.subscribe_candidates(session_id, direction).await?;
        Ok(self.maybe_replay(sub))
    }

    async fn delete(&self, session_id: &str) -> StoreResult<()> {
        self.write()?;
        self.inner.delete(session_id).await
    }

    async fn list_by_status(&self, status: SessionStatus) -> StoreResult<Vec<CallSession>> {
        self.inner.list_by_status(status).await
    }
}
