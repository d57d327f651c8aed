//! One call attempt: local capture, the peer transport, and the signaling protocol
//! that connects them through the store.
//!
//! The initiator writes its offer and watches the record for an answer. The responder
//! polls the record for the offer, answers it, and waits for the transport to connect.
//! Both sides trickle candidates into their own sub-collection and consume the other
//! side's, holding remote candidates back until the remote description is applied.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use signaling_store::{
    end_session, CallSession, CallSessionPatch, CandidateDirection, CandidateRecord,
    SessionDescription, SignalingStore, Unsubscribe,
};
use tokio::sync::{mpsc, watch, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tokio::time::{sleep, Instant};
use tracing::{debug, info, trace, warn};

use crate::candidates::{Admission, CandidateInbox};
use crate::config::EngineConfig;
use crate::error::{CallError, CallResult};
use crate::media::{LocalMedia, LocalTrack, MediaAcquisition, MediaConstraints, TrackKind};
use crate::role::{Role, RoleAssignment, RoleResolver};
use crate::state::CallState;
use crate::transport::{
    video_sender, Description, IceCandidate, PeerState, PeerTransport, RemoteTrack,
    TransportEvent, TransportFactory,
};

const TARGET: &str = "media_session::engine";

pub type RemoteTrackHandler = Arc<dyn Fn(&RemoteMedia) + Send + Sync>;

/// Tracks received from the peer so far.
#[derive(Debug, Clone, Default)]
pub struct RemoteMedia {
    tracks: Vec<RemoteTrack>,
}

impl RemoteMedia {
    pub fn tracks(&self) -> &[RemoteTrack] {
        &self.tracks
    }

    pub fn is_empty(&self) -> bool {
        self.tracks.is_empty()
    }

    pub fn audio(&self) -> Option<&RemoteTrack> {
        self.tracks.iter().find(|t| t.kind == TrackKind::Audio)
    }

    pub fn video(&self) -> Option<&RemoteTrack> {
        self.tracks.iter().find(|t| t.kind == TrackKind::Video)
    }

    fn insert(&mut self, track: RemoteTrack) -> bool {
        if self.tracks.iter().any(|t| t.id == track.id) {
            return false;
        }
        self.tracks.push(track);
        true
    }
}

/// How a device toggle took effect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToggleEffect {
    /// Same track, muted or unmuted.
    InPlace,
    /// Device released; turning it back on needs a new track.
    Released,
    /// A fresh track was captured and swapped onto the outbound sender.
    Reacquired,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Toggle {
    pub enabled: bool,
    pub effect: ToggleEffect,
}

struct ScreenShare {
    track: LocalTrack,
    watcher: Option<JoinHandle<()>>,
}

#[derive(Default)]
struct Outbound {
    target: Option<(String, CandidateDirection)>,
    pending: Vec<IceCandidate>,
}

struct Core {
    config: EngineConfig,
    store: Arc<dyn SignalingStore>,
    media: Arc<dyn MediaAcquisition>,
    factory: Arc<dyn TransportFactory>,
    state: watch::Sender<CallState>,
    local: Mutex<Option<LocalMedia>>,
    camera_off: AtomicBool,
    screen: Mutex<Option<ScreenShare>>,
    transport: Mutex<Option<Arc<dyn PeerTransport>>>,
    remote: Mutex<RemoteMedia>,
    on_remote_track: Mutex<Option<RemoteTrackHandler>>,
    inbox: AsyncMutex<CandidateInbox>,
    outbound: AsyncMutex<Outbound>,
    peer_connected: AtomicBool,
    subscriptions: Mutex<Vec<Unsubscribe>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    released: AtomicBool,
    hung_up: AtomicBool,
}

/// Drives one call from media acquisition to hang-up.
///
/// Create one engine per call attempt. Dropping it releases local media and closes
/// the transport but leaves the session record alone; call
/// [`NegotiationEngine::hang_up`] to end the session for both sides.
pub struct NegotiationEngine {
    core: Arc<Core>,
}

impl NegotiationEngine {
    pub fn new(
        config: EngineConfig,
        store: Arc<dyn SignalingStore>,
        media: Arc<dyn MediaAcquisition>,
        factory: Arc<dyn TransportFactory>,
    ) -> Self {
        let (state, _) = watch::channel(CallState::Idle);
        Self {
            core: Arc::new(Core {
                config,
                store,
                media,
                factory,
                state,
                local: Mutex::new(None),
                camera_off: AtomicBool::new(false),
                screen: Mutex::new(None),
                transport: Mutex::new(None),
                remote: Mutex::new(RemoteMedia::default()),
                on_remote_track: Mutex::new(None),
                inbox: AsyncMutex::new(CandidateInbox::new()),
                outbound: AsyncMutex::new(Outbound::default()),
                peer_connected: AtomicBool::new(false),
                subscriptions: Mutex::new(Vec::new()),
                tasks: Mutex::new(Vec::new()),
                released: AtomicBool::new(false),
                hung_up: AtomicBool::new(false),
            }),
        }
    }

    pub fn state(&self) -> CallState {
        *self.core.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<CallState> {
        self.core.state.subscribe()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == CallState::Connected
    }

    /// Waits until the call reaches `target`. Fails with [`CallError::Ended`] if the
    /// call ends first.
    pub async fn wait_for(&self, target: CallState, within: Duration) -> CallResult<()> {
        let mut rx = self.core.state.subscribe();
        let reached = tokio::time::timeout(
            within,
            rx.wait_for(|state| *state == target || *state == CallState::Ended),
        )
        .await;
        match reached {
            Ok(Ok(state)) if *state == target => Ok(()),
            Ok(_) => Err(CallError::Ended),
            Err(_) => Err(CallError::StateTimeout {
                current: self.state(),
                waited: within,
            }),
        }
    }

    pub fn local_media(&self) -> Option<LocalMedia> {
        self.core.local.lock().clone()
    }

    pub fn local_audio_track(&self) -> Option<LocalTrack> {
        self.core
            .local
            .lock()
            .as_ref()
            .and_then(|m| m.audio_track().cloned())
    }

    pub fn local_video_track(&self) -> Option<LocalTrack> {
        self.core
            .local
            .lock()
            .as_ref()
            .and_then(|m| m.video_track().cloned())
    }

    pub fn remote_media(&self) -> RemoteMedia {
        self.core.remote.lock().clone()
    }

    pub fn screen_track(&self) -> Option<LocalTrack> {
        self.core.screen.lock().as_ref().map(|s| s.track.clone())
    }

    pub fn is_screen_sharing(&self) -> bool {
        self.core.screen.lock().is_some()
    }

    /// Captures local media. Failures leave the call idle and are not retried.
    pub async fn acquire_media(&self, video: bool, audio: bool) -> CallResult<LocalMedia> {
        let core = &self.core;
        core.expect_state(CallState::Idle, CallState::MediaReady)?;

        let media = core
            .media
            .get_user_media(MediaConstraints { video, audio })
            .await
            .map_err(|err| {
                let err = CallError::from(err);
                warn!(target: TARGET, error = %err, "media acquisition failed");
                err
            })?;

        if core.released.load(Ordering::SeqCst) {
            media.stop_all();
            return Err(CallError::Ended);
        }
        *core.local.lock() = Some(media.clone());
        core.advance(CallState::MediaReady)?;
        info!(
            target: TARGET,
            tracks = media.tracks().len(),
            "local media ready"
        );
        Ok(media)
    }

    /// Builds the peer transport, attaches every local track, and starts routing
    /// transport events. `on_remote_track` sees the accumulated remote media each time
    /// a new remote track arrives.
    pub async fn create_transport<F>(&self, on_remote_track: F) -> CallResult<()>
    where
        F: Fn(&RemoteMedia) + Send + Sync + 'static,
    {
        let core = &self.core;
        core.expect_state(CallState::MediaReady, CallState::TransportCreated)?;
        *core.on_remote_track.lock() = Some(Arc::new(on_remote_track));

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let transport = match core
            .factory
            .create(&core.config.ice_servers, events_tx)
            .await
        {
            Ok(transport) => transport,
            Err(err) => return Err(core.abort(err.into()).await),
        };
        *core.transport.lock() = Some(Arc::clone(&transport));

        let tracks = core
            .local
            .lock()
            .as_ref()
            .map(|m| m.tracks().to_vec())
            .unwrap_or_default();
        for track in &tracks {
            if let Err(err) = transport.add_track(track).await {
                return Err(core.abort(err.into()).await);
            }
        }

        let pump = Arc::clone(core);
        core.spawn(async move { pump.pump_events(events_rx).await });
        core.advance(CallState::TransportCreated)?;
        debug!(target: TARGET, tracks = tracks.len(), "peer transport created");
        Ok(())
    }

    /// Offers the call and returns once the offer is stored; the answer is applied in
    /// the background when it appears.
    pub async fn negotiate_as_initiator(&self, session_id: &str, self_id: &str) -> CallResult<()> {
        let core = &self.core;
        let transport = core.transport()?;
        core.expect_state(CallState::TransportCreated, CallState::OfferSent)?;
        match core.offer(&transport, session_id, self_id).await {
            Ok(()) => Ok(()),
            Err(err) => Err(core.abort(err).await),
        }
    }

    /// Waits for the initiator's offer, answers it, and returns once the answer is
    /// stored.
    pub async fn negotiate_as_responder(&self, session_id: &str, self_id: &str) -> CallResult<()> {
        let core = &self.core;
        let transport = core.transport()?;
        core.expect_state(CallState::TransportCreated, CallState::AwaitingOffer)?;
        match core.answer(&transport, session_id, self_id).await {
            Ok(()) => Ok(()),
            Err(err) => Err(core.abort(err).await),
        }
    }

    /// Resolves this endpoint's role, then runs every setup step for it.
    pub async fn join_call<F>(
        &self,
        resolver: &dyn RoleResolver,
        session_id: &str,
        self_id: &str,
        constraints: MediaConstraints,
        on_remote_track: F,
    ) -> CallResult<RoleAssignment>
    where
        F: Fn(&RemoteMedia) + Send + Sync + 'static,
    {
        let assignment = resolver.resolve_role(session_id, self_id).await?;
        info!(
            target: TARGET,
            session_id,
            role = assignment.role.as_str(),
            peer = %assignment.peer_id,
            "joining call"
        );
        self.acquire_media(constraints.video, constraints.audio)
            .await?;
        self.create_transport(on_remote_track).await?;
        match assignment.role {
            Role::Initiator => self.negotiate_as_initiator(session_id, self_id).await?,
            Role::Responder => self.negotiate_as_responder(session_id, self_id).await?,
        }
        Ok(assignment)
    }

    /// Mutes or unmutes the microphone in place.
    pub fn toggle_microphone(&self) -> CallResult<Toggle> {
        self.core.ensure_live()?;
        let track = self
            .local_audio_track()
            .ok_or(CallError::TrackUnavailable(TrackKind::Audio))?;
        let enabled = !track.is_enabled();
        track.set_enabled(enabled);
        debug!(target: TARGET, enabled, "microphone toggled");
        Ok(Toggle {
            enabled,
            effect: ToggleEffect::InPlace,
        })
    }

    /// Turning the camera off releases the device. Turning it back on captures a new
    /// track and swaps it onto the outbound video sender without renegotiating.
    pub async fn toggle_camera(&self) -> CallResult<Toggle> {
        let core = &self.core;
        core.ensure_live()?;
        let current = self.local_video_track();

        if let Some(track) = current.filter(|t| t.is_live() && t.is_enabled()) {
            track.set_enabled(false);
            track.stop();
            core.camera_off.store(true, Ordering::SeqCst);
            debug!(target: TARGET, track = %track.id(), "camera released");
            return Ok(Toggle {
                enabled: false,
                effect: ToggleEffect::Released,
            });
        }

        let track = core.reacquire_camera().await?;
        core.camera_off.store(false, Ordering::SeqCst);
        let sharing = core.screen.lock().is_some();
        let transport = core.transport.lock().clone();
        if let (false, Some(transport)) = (sharing, transport) {
            if let Some(sender) = video_sender(transport.as_ref()).await {
                sender.replace_track(&track).await?;
            }
        }
        debug!(target: TARGET, track = %track.id(), sharing, "camera reacquired");
        Ok(Toggle {
            enabled: true,
            effect: ToggleEffect::Reacquired,
        })
    }

    /// Sends the screen instead of the camera. When the platform ends the capture the
    /// camera is restored automatically.
    pub async fn start_screen_share(&self) -> CallResult<()> {
        let core = &self.core;
        core.ensure_live()?;
        let transport = core.transport()?;
        if core.screen.lock().is_some() {
            return Ok(());
        }

        let display = core
            .media
            .get_display_media(MediaConstraints::video_only())
            .await?;
        let Some(screen) = display.video_track().cloned() else {
            display.stop_all();
            return Err(CallError::DeviceNotFound("screen".into()));
        };
        for extra in display.tracks().iter().filter(|t| !t.same_track(&screen)) {
            extra.stop();
        }

        let Some(sender) = video_sender(transport.as_ref()).await else {
            screen.stop();
            return Err(CallError::TrackUnavailable(TrackKind::Video));
        };
        if let Err(err) = sender.replace_track(&screen).await {
            screen.stop();
            return Err(err.into());
        }

        *core.screen.lock() = Some(ScreenShare {
            track: screen.clone(),
            watcher: None,
        });
        let watcher_core = Arc::clone(core);
        let watched = screen.clone();
        let watcher = tokio::spawn(async move {
            watched.ended().await;
            debug!(target: TARGET, track = %watched.id(), "screen capture ended by platform");
            if let Err(err) = watcher_core.finish_screen_share(false).await {
                warn!(target: TARGET, error = %err, "camera restore after screen share failed");
            }
        });
        if let Some(share) = core.screen.lock().as_mut() {
            share.watcher = Some(watcher);
        }
        info!(target: TARGET, track = %screen.id(), "screen share started");
        Ok(())
    }

    /// Puts the camera back on the outbound video sender and releases the screen.
    pub async fn stop_screen_share(&self) -> CallResult<()> {
        self.core.ensure_live()?;
        self.core.finish_screen_share(true).await
    }

    /// Ends the call locally and, best effort, in the store.
    ///
    /// Releases every local track, closes the transport, and cancels every
    /// subscription exactly once. With `delete_record` the session and its candidates
    /// are removed; otherwise the session is marked ended. Store failures are logged.
    /// Repeated calls do nothing.
    pub async fn hang_up(&self, session_id: &str, delete_record: bool) {
        let core = &self.core;
        if core.hung_up.swap(true, Ordering::SeqCst) {
            debug!(target: TARGET, session_id, "hang up already handled");
            return;
        }
        if let Some(transport) = core.release_local() {
            close_transport(transport).await;
        }

        let cleanup = if delete_record {
            core.store.delete(session_id).await
        } else {
            end_session(core.store.as_ref(), session_id).await
        };
        if let Err(err) = cleanup {
            warn!(
                target: TARGET,
                session_id,
                delete_record,
                error = %err,
                "session cleanup failed"
            );
        }
        info!(target: TARGET, session_id, "call ended");
    }
}

impl Drop for NegotiationEngine {
    fn drop(&mut self) {
        if let Some(transport) = self.core.release_local() {
            if let Ok(handle) = tokio::runtime::Handle::try_current() {
                handle.spawn(close_transport(transport));
            }
        }
    }
}

/// A terminal status written after the current offer. An `ended` left over from an
/// earlier attempt on the same session does not count.
fn closed_after_offer(record: &CallSession) -> bool {
    if !record.status.is_terminal() {
        return false;
    }
    match (
        record.ended_at,
        record.current_offer().and_then(|offer| offer.created_at),
    ) {
        (Some(ended), Some(offered)) => ended >= offered,
        _ => true,
    }
}

async fn close_transport(transport: Arc<dyn PeerTransport>) {
    if let Err(err) = transport.close().await {
        warn!(target: TARGET, error = %err, "transport close failed");
    }
}

impl Core {
    fn transport(&self) -> CallResult<Arc<dyn PeerTransport>> {
        self.ensure_live()?;
        self.transport
            .lock()
            .clone()
            .ok_or(CallError::TransportNotReady)
    }

    fn ensure_live(&self) -> CallResult<()> {
        if self.released.load(Ordering::SeqCst) {
            return Err(CallError::Ended);
        }
        Ok(())
    }

    fn expect_state(&self, expected: CallState, next: CallState) -> CallResult<()> {
        let current = *self.state.borrow();
        if current == expected {
            Ok(())
        } else if current == CallState::Ended {
            Err(CallError::Ended)
        } else {
            Err(CallError::InvalidState {
                from: current,
                to: next,
            })
        }
    }

    fn advance(&self, next: CallState) -> CallResult<()> {
        let mut from = next;
        let moved = self.state.send_if_modified(|current| {
            from = *current;
            if current.can_transition_to(next) {
                *current = next;
                true
            } else {
                false
            }
        });
        if moved {
            debug!(target: TARGET, ?from, to = ?next, "call state advanced");
            Ok(())
        } else if from == CallState::Ended {
            Err(CallError::Ended)
        } else {
            Err(CallError::InvalidState { from, to: next })
        }
    }

    fn promote_connected(&self) {
        let promoted = self.state.send_if_modified(|current| {
            if *current == CallState::AnswerSent {
                *current = CallState::Connected;
                true
            } else {
                false
            }
        });
        if promoted {
            info!(target: TARGET, "peer connected");
        }
    }

    fn spawn<F>(&self, future: F)
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let handle = tokio::spawn(future);
        if self.released.load(Ordering::SeqCst) {
            handle.abort();
            return;
        }
        self.tasks.lock().push(handle);
    }

    fn hold(&self, subscription: Unsubscribe) {
        if self.released.load(Ordering::SeqCst) {
            subscription.unsubscribe();
            return;
        }
        self.subscriptions.lock().push(subscription);
    }

    /// Local teardown, at most once. Hands back the transport for the caller to close.
    fn release_local(&self) -> Option<Arc<dyn PeerTransport>> {
        if self.released.swap(true, Ordering::SeqCst) {
            return None;
        }
        self.state.send_replace(CallState::Ended);

        let tasks = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            task.abort();
        }
        let subscriptions = std::mem::take(&mut *self.subscriptions.lock());
        for subscription in subscriptions {
            subscription.unsubscribe();
        }
        if let Some(share) = self.screen.lock().take() {
            if let Some(watcher) = share.watcher {
                watcher.abort();
            }
            share.track.stop();
        }
        let stopped = self
            .local
            .lock()
            .as_ref()
            .map(LocalMedia::stop_all)
            .unwrap_or(0);
        debug!(target: TARGET, stopped, "local media released");

        self.transport.lock().take()
    }

    /// Tears down after a protocol failure and hands the error back.
    async fn abort(&self, err: CallError) -> CallError {
        warn!(target: TARGET, error = %err, "negotiation failed; ending call");
        if let Some(transport) = self.release_local() {
            close_transport(transport).await;
        }
        err
    }

    /// Like [`Core::abort`], for use inside tasks that teardown itself cancels.
    fn abort_detached(&self, err: CallError) {
        warn!(target: TARGET, error = %err, "negotiation failed; ending call");
        if let Some(transport) = self.release_local() {
            tokio::spawn(close_transport(transport));
        }
    }

    /// Local teardown after the peer ended the session. Nothing is written back.
    fn end_by_peer(&self) {
        if let Some(transport) = self.release_local() {
            tokio::spawn(close_transport(transport));
        }
    }

    async fn offer(
        self: &Arc<Self>,
        transport: &Arc<dyn PeerTransport>,
        session_id: &str,
        self_id: &str,
    ) -> CallResult<()> {
        let offer = transport.create_offer().await?;
        transport.set_local_description(offer.clone()).await?;
        self.ensure_live()?;
        self.store
            .set_merge(
                session_id,
                CallSessionPatch::default()
                    .initiator(self_id)
                    .offer(SessionDescription::offer(offer.sdp, self_id)),
            )
            .await?;
        self.advance(CallState::OfferSent)?;
        info!(target: TARGET, session_id, "offer written");
        // Candidates gathered so far were held; the record now exists to carry them.
        self.set_signal_target(session_id, CandidateDirection::Initiator)
            .await;

        self.listen_for_candidates(transport, session_id, CandidateDirection::Responder)
            .await?;

        let (records, handle) = self.store.subscribe(session_id).await?.into_parts();
        self.hold(handle);
        self.advance(CallState::AwaitingAnswer)?;

        let core = Arc::clone(self);
        let transport = Arc::clone(transport);
        let session = session_id.to_string();
        self.spawn(async move { core.watch_for_answer(transport, session, records).await });
        Ok(())
    }

    async fn watch_for_answer(
        self: Arc<Self>,
        transport: Arc<dyn PeerTransport>,
        session_id: String,
        mut records: mpsc::UnboundedReceiver<CallSession>,
    ) {
        while let Some(record) = records.recv().await {
            if closed_after_offer(&record) {
                info!(
                    target: TARGET,
                    session_id = %session_id,
                    status = ?record.status,
                    "session closed by peer; ending call"
                );
                self.end_by_peer();
                return;
            }
            let Some(answer) = record.current_answer() else {
                continue;
            };
            if let (Some(answered), Some(offered)) = (
                answer.created_at,
                record.current_offer().and_then(|o| o.created_at),
            ) {
                if answered < offered {
                    trace!(target: TARGET, session_id = %session_id, "ignoring answer to an earlier offer");
                    continue;
                }
            }

            match self
                .apply_remote_description(&transport, Description::answer(answer.sdp.clone()))
                .await
            {
                Ok(true) => {
                    info!(target: TARGET, session_id = %session_id, "answer applied");
                    if let Err(err) = self.advance(CallState::Connected) {
                        debug!(target: TARGET, error = %err, "answer arrived after call left awaiting state");
                    }
                }
                Ok(false) => {
                    trace!(target: TARGET, session_id = %session_id, "answer already applied");
                }
                Err(err) => {
                    self.abort_detached(err);
                    return;
                }
            }
        }
        // The stream only closes when the record is deleted or we unsubscribed.
        if !self.released.load(Ordering::SeqCst) {
            info!(target: TARGET, session_id = %session_id, "session deleted by peer; ending call");
            self.end_by_peer();
        }
    }

    async fn answer(
        self: &Arc<Self>,
        transport: &Arc<dyn PeerTransport>,
        session_id: &str,
        self_id: &str,
    ) -> CallResult<()> {
        self.advance(CallState::AwaitingOffer)?;

        let offer = self.wait_for_offer(session_id).await?;
        self.apply_remote_description(transport, Description::offer(offer.sdp))
            .await?;
        debug!(target: TARGET, session_id, from = %offer.from, "offer applied");

        let answer = transport.create_answer().await?;
        transport.set_local_description(answer.clone()).await?;
        self.ensure_live()?;
        self.store
            .set_merge(
                session_id,
                CallSessionPatch::default()
                    .responder(self_id)
                    .answer(SessionDescription::answer(answer.sdp, self_id)),
            )
            .await?;
        self.advance(CallState::AnswerSent)?;
        info!(target: TARGET, session_id, "answer written");
        self.set_signal_target(session_id, CandidateDirection::Responder)
            .await;

        self.listen_for_candidates(transport, session_id, CandidateDirection::Initiator)
            .await?;
        if self.peer_connected.load(Ordering::SeqCst) {
            self.promote_connected();
        }
        Ok(())
    }

    async fn wait_for_offer(&self, session_id: &str) -> CallResult<SessionDescription> {
        let attempts = self.config.offer_poll_attempts;
        let interval = self.config.offer_poll_interval;
        let started = Instant::now();

        for attempt in 1..=attempts {
            self.ensure_live()?;
            if let Some(offer) = self
                .store
                .get(session_id)
                .await?
                .and_then(|record| record.current_offer().cloned())
            {
                debug!(target: TARGET, session_id, attempt, "offer found");
                return Ok(offer);
            }
            trace!(target: TARGET, session_id, attempt, "offer not yet written");
            if attempt < attempts {
                sleep(interval).await;
            }
        }

        Err(CallError::SignalingTimeout {
            attempts,
            waited: started.elapsed(),
        })
    }

    /// Applies the remote description once and releases any held candidates.
    /// Returns `false` if a remote description was already in place.
    async fn apply_remote_description(
        &self,
        transport: &Arc<dyn PeerTransport>,
        description: Description,
    ) -> CallResult<bool> {
        let mut inbox = self.inbox.lock().await;
        if transport.has_remote_description().await {
            return Ok(false);
        }
        transport.set_remote_description(description).await?;
        let held = inbox.mark_remote_ready();
        if !held.is_empty() {
            debug!(target: TARGET, count = held.len(), "applying held candidates");
        }
        for candidate in held {
            if let Err(err) = transport.add_ice_candidate(candidate).await {
                warn!(target: TARGET, error = %err, "remote candidate rejected");
            }
        }
        Ok(true)
    }

    async fn listen_for_candidates(
        self: &Arc<Self>,
        transport: &Arc<dyn PeerTransport>,
        session_id: &str,
        direction: CandidateDirection,
    ) -> CallResult<()> {
        let (records, handle) = self
            .store
            .subscribe_candidates(session_id, direction)
            .await?
            .into_parts();
        self.hold(handle);

        let core = Arc::clone(self);
        let transport = Arc::clone(transport);
        self.spawn(async move { core.consume_candidates(transport, records).await });
        Ok(())
    }

    async fn consume_candidates(
        self: Arc<Self>,
        transport: Arc<dyn PeerTransport>,
        mut records: mpsc::UnboundedReceiver<CandidateRecord>,
    ) {
        while let Some(record) = records.recv().await {
            let mut inbox = self.inbox.lock().await;
            match inbox.admit(&record) {
                Admission::Apply(candidate) => {
                    if let Err(err) = transport.add_ice_candidate(candidate).await {
                        warn!(target: TARGET, id = %record.id, error = %err, "remote candidate rejected");
                    }
                }
                Admission::Queued => {
                    trace!(target: TARGET, id = %record.id, "remote candidate held");
                }
                Admission::Duplicate => {
                    trace!(target: TARGET, id = %record.id, "duplicate remote candidate");
                }
                Admission::Malformed(reason) => {
                    warn!(target: TARGET, id = %record.id, reason = %reason, "malformed remote candidate");
                }
            }
        }
    }

    async fn set_signal_target(&self, session_id: &str, direction: CandidateDirection) {
        let mut outbound = self.outbound.lock().await;
        outbound.target = Some((session_id.to_string(), direction));
        let held = std::mem::take(&mut outbound.pending);
        for candidate in &held {
            self.write_candidate(session_id, direction, candidate).await;
        }
    }

    async fn publish_candidate(&self, candidate: IceCandidate) {
        let mut outbound = self.outbound.lock().await;
        match outbound.target.clone() {
            Some((session_id, direction)) => {
                self.write_candidate(&session_id, direction, &candidate)
                    .await
            }
            None => outbound.pending.push(candidate),
        }
    }

    async fn write_candidate(
        &self,
        session_id: &str,
        direction: CandidateDirection,
        candidate: &IceCandidate,
    ) {
        let value = match serde_json::to_value(candidate) {
            Ok(value) => value,
            Err(err) => {
                warn!(target: TARGET, error = %err, "candidate serialization failed");
                return;
            }
        };
        if let Err(err) = self
            .store
            .append_candidate(session_id, direction, value)
            .await
        {
            warn!(
                target: TARGET,
                session_id,
                collection = direction.collection(),
                error = %err,
                "candidate write failed"
            );
        }
    }

    async fn pump_events(self: Arc<Self>, mut events: mpsc::UnboundedReceiver<TransportEvent>) {
        while let Some(event) = events.recv().await {
            match event {
                TransportEvent::LocalCandidate(candidate) => {
                    self.publish_candidate(candidate).await
                }
                TransportEvent::RemoteTrack(track) => self.remote_track_added(track),
                TransportEvent::StateChanged(state) => self.peer_state_changed(state),
            }
        }
    }

    fn remote_track_added(&self, track: RemoteTrack) {
        let snapshot = {
            let mut remote = self.remote.lock();
            if !remote.insert(track) {
                return;
            }
            remote.clone()
        };
        debug!(target: TARGET, tracks = snapshot.tracks().len(), "remote media updated");
        let handler = self.on_remote_track.lock().clone();
        if let Some(handler) = handler {
            handler(&snapshot);
        }
    }

    fn peer_state_changed(&self, state: PeerState) {
        match state {
            PeerState::Connected => {
                self.peer_connected.store(true, Ordering::SeqCst);
                self.promote_connected();
            }
            PeerState::Failed | PeerState::Disconnected => {
                warn!(target: TARGET, ?state, "peer connection degraded");
            }
            _ => trace!(target: TARGET, ?state, "peer connection state"),
        }
    }

    async fn reacquire_camera(&self) -> CallResult<LocalTrack> {
        let media = self.media.get_user_media(MediaConstraints::video_only()).await?;
        let Some(track) = media.video_track().cloned() else {
            media.stop_all();
            return Err(CallError::DeviceNotFound("camera".into()));
        };
        for extra in media.tracks().iter().filter(|t| !t.same_track(&track)) {
            extra.stop();
        }
        if self.released.load(Ordering::SeqCst) {
            track.stop();
            return Err(CallError::Ended);
        }

        let displaced = self
            .local
            .lock()
            .get_or_insert_with(LocalMedia::default)
            .replace_video(track.clone());
        if let Some(old) = displaced {
            old.stop();
        }
        Ok(track)
    }

    async fn restore_camera(&self) -> CallResult<()> {
        let camera = self
            .local
            .lock()
            .as_ref()
            .and_then(|m| m.video_track().cloned());
        let camera = match camera {
            Some(track) if track.is_live() || self.camera_off.load(Ordering::SeqCst) => track,
            _ => self.reacquire_camera().await?,
        };
        let transport = self.transport()?;
        let sender = video_sender(transport.as_ref())
            .await
            .ok_or(CallError::TrackUnavailable(TrackKind::Video))?;
        sender.replace_track(&camera).await?;
        debug!(target: TARGET, track = %camera.id(), "camera restored");
        Ok(())
    }

    async fn finish_screen_share(&self, requested: bool) -> CallResult<()> {
        let share = self.screen.lock().take();
        let Some(share) = share else {
            return Ok(());
        };
        if requested {
            if let Some(watcher) = share.watcher {
                watcher.abort();
            }
        }
        let restored = self.restore_camera().await;
        share.track.stop();
        info!(target: TARGET, requested, "screen share stopped");
        restored
    }
}
