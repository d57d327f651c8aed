use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use time::OffsetDateTime;
use tokio::sync::mpsc;
use tracing::{debug, trace};
use uuid::Uuid;

use crate::{
    CallSession, CallSessionPatch, CandidateDirection, CandidateRecord, SessionStatus,
    SignalingStore, StoreError, StoreResult, Subscription, Unsubscribe,
};

/// Source of store-assigned timestamps.
pub type Clock = Arc<dyn Fn() -> OffsetDateTime + Send + Sync>;

type Watchers<T> = Vec<(u64, mpsc::UnboundedSender<T>)>;

#[derive(Default)]
struct Entry {
    record: Option<CallSession>,
    initiator_candidates: Vec<CandidateRecord>,
    responder_candidates: Vec<CandidateRecord>,
    record_watchers: Watchers<CallSession>,
    initiator_watchers: Watchers<CandidateRecord>,
    responder_watchers: Watchers<CandidateRecord>,
}

impl Entry {
    fn candidates(&mut self, direction: CandidateDirection) -> &mut Vec<CandidateRecord> {
        match direction {
            CandidateDirection::Initiator => &mut self.initiator_candidates,
            CandidateDirection::Responder => &mut self.responder_candidates,
        }
    }

    fn candidate_watchers(
        &mut self,
        direction: CandidateDirection,
    ) -> &mut Watchers<CandidateRecord> {
        match direction {
            CandidateDirection::Initiator => &mut self.initiator_watchers,
            CandidateDirection::Responder => &mut self.responder_watchers,
        }
    }

    /// No record and nobody listening: the entry can go.
    fn is_vacant(&self) -> bool {
        self.record.is_none()
            && self.initiator_candidates.is_empty()
            && self.responder_candidates.is_empty()
            && self.record_watchers.is_empty()
            && self.initiator_watchers.is_empty()
            && self.responder_watchers.is_empty()
    }
}

#[derive(Default)]
struct State {
    entries: HashMap<String, Entry>,
    next_watcher: u64,
}

impl State {
    fn watcher_id(&mut self) -> u64 {
        self.next_watcher += 1;
        self.next_watcher
    }

    fn prune(&mut self, session_id: &str) {
        if self
            .entries
            .get(session_id)
            .is_some_and(Entry::is_vacant)
        {
            self.entries.remove(session_id);
        }
    }
}

/// In-process signaling store.
///
/// Cloning yields another handle to the same documents, so two engines in one process
/// can signal through it exactly as two browsers would through a hosted store.
#[derive(Clone)]
pub struct MemoryStore {
    state: Arc<Mutex<State>>,
    offline: Arc<AtomicBool>,
    clock: Clock,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(OffsetDateTime::now_utc))
    }

    pub fn with_clock(clock: Clock) -> Self {
        Self {
            state: Arc::new(Mutex::new(State::default())),
            offline: Arc::new(AtomicBool::new(false)),
            clock,
        }
    }

    /// Simulates an outage: every operation fails with [`StoreError::Unavailable`].
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Snapshot of one candidate sub-collection in creation order.
    pub fn candidates(&self, session_id: &str, direction: CandidateDirection) -> Vec<CandidateRecord> {
        let mut state = self.state.lock();
        state
            .entries
            .get_mut(session_id)
            .map(|entry| entry.candidates(direction).clone())
            .unwrap_or_default()
    }

    /// Sessions the store is holding state for: stored records plus sessions with a
    /// live subscription waiting for their record.
    pub fn tracked_sessions(&self) -> usize {
        self.state.lock().entries.len()
    }

    fn merge(&self, session_id: &str, patch: CallSessionPatch, create: bool) -> StoreResult<bool> {
        self.ensure_online()?;
        let now = self.now();
        let mut state = self.state.lock();
        let existing = state
            .entries
            .get(session_id)
            .and_then(|entry| entry.record.clone());
        let mut record = match existing {
            Some(record) => record,
            None if create => CallSession::new(session_id),
            None => return Ok(false),
        };
        let sets_answer = patch.answer.is_some();
        patch.apply(&mut record, now);
        if sets_answer && record.current_offer().is_none() {
            return Err(StoreError::Rejected {
                session_id: session_id.to_string(),
                reason: "answer written before offer".into(),
            });
        }
        trace!(
            target: "signaling_store::memory",
            session_id,
            has_offer = record.current_offer().is_some(),
            has_answer = record.current_answer().is_some(),
            status = ?record.status,
            "record merged"
        );
        let entry = state.entries.entry(session_id.to_string()).or_default();
        broadcast(&mut entry.record_watchers, &record);
        entry.record = Some(record);
        Ok(true)
    }

    fn ensure_online(&self) -> StoreResult<()> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("memory store is offline".into()));
        }
        Ok(())
    }

    fn now(&self) -> OffsetDateTime {
        (self.clock)()
    }
}

fn broadcast<T: Clone>(watchers: &mut Watchers<T>, value: &T) {
    watchers.retain(|(_, tx)| tx.send(value.clone()).is_ok());
}

#[async_trait]
impl SignalingStore for MemoryStore {
    async fn get(&self, session_id: &str) -> StoreResult<Option<CallSession>> {
        self.ensure_online()?;
        let state = self.state.lock();
        Ok(state
            .entries
            .get(session_id)
            .and_then(|entry| entry.record.clone()))
    }

    async fn set_merge(&self, session_id: &str, patch: CallSessionPatch) -> StoreResult<()> {
        self.merge(session_id, patch, true).map(|_| ())
    }

    async fn update(&self, session_id: &str, patch: CallSessionPatch) -> StoreResult<bool> {
        self.merge(session_id, patch, false)
    }

    async fn subscribe(&self, session_id: &str) -> StoreResult<Subscription<CallSession>> {
        self.ensure_online()?;
        let (tx, rx) = mpsc::unbounded_channel();
        let mut state = self.state.lock();
        let id = state.watcher_id();
        let entry = state.entries.entry(session_id.to_string()).or_default();
        if let Some(record) = entry.record.as_ref() {
            let _ = tx.send(record.clone());
        }
        entry.record_watchers.push((id, tx));

        let shared = Arc::downgrade(&self.state);
        let key = session_id.to_string();
        let handle = Unsubscribe::new(move || {
            if let Some(state) = shared.upgrade() {
                let mut state = state.lock();
                if let Some(entry) = state.entries.get_mut(&key) {
                    entry.record_watchers.retain(|(watcher, _)| *watcher != id);
                }
                state.prune(&key);
            }
        });
        Ok(Subscription::new(rx, handle))
    }

    async fn append_candidate(
        &self,
        session_id: &str,
        direction: CandidateDirection,
        candidate: Value,
    ) -> StoreResult<CandidateRecord> {
        self.ensure_online()?;
        let now = self.now();
        let mut state = self.state.lock();
        // Candidates never outlive their session, so there must be one to attach to.
        let Some(entry) = state
            .entries
            .get_mut(session_id)
            .filter(|entry| entry.record.is_some())
        else {
            return Err(StoreError::Rejected {
                session_id: session_id.to_string(),
                reason: format!("no session to hold {}", direction.collection()),
            });
        };
        let records = entry.candidates(direction);
        // Creation order is the read order; never let a clock step backwards reorder it.
        let created_at = records
            .last()
            .map(|last| last.created_at.max(now))
            .unwrap_or(now);
        let record = CandidateRecord {
            id: Uuid::new_v4().to_string(),
            candidate,
            created_at,
        };
        records.push(record.clone());
        broadcast(entry.candidate_watchers(direction), &record);
        trace!(
            target: "signaling_store::memory",
            session_id,
            collection = direction.collection(),
            record_id = %record.id,
            "candidate appended"
        );
        Ok(record)
    }

    async fn subscribe_candidates(
        &self,
        session_id: &str,
        direction: CandidateDirection,
    ) -> StoreResult<Subscription<CandidateRecord>> {
        self.ensure_online()?;
        let (tx, rx) = mpsc::unbounded_channel();
        let mut state = self.state.lock();
        let id = state.watcher_id();
        let entry = state.entries.entry(session_id.to_string()).or_default();
        for record in entry.candidates(direction).iter() {
            let _ = tx.send(record.clone());
        }
        entry.candidate_watchers(direction).push((id, tx));

        let shared = Arc::downgrade(&self.state);
        let key = session_id.to_string();
        let handle = Unsubscribe::new(move || {
            if let Some(state) = shared.upgrade() {
                let mut state = state.lock();
                if let Some(entry) = state.entries.get_mut(&key) {
                    entry
                        .candidate_watchers(direction)
                        .retain(|(watcher, _)| *watcher != id);
                }
                state.prune(&key);
            }
        });
        Ok(Subscription::new(rx, handle))
    }

    async fn delete(&self, session_id: &str) -> StoreResult<()> {
        self.ensure_online()?;
        let removed = self.state.lock().entries.remove(session_id);
        // Dropping the entry closes every watcher channel.
        debug!(
            target: "signaling_store::memory",
            session_id,
            existed = removed.as_ref().is_some_and(|entry| entry.record.is_some()),
            "session deleted"
        );
        Ok(())
    }

    async fn list_by_status(&self, status: SessionStatus) -> StoreResult<Vec<CallSession>> {
        self.ensure_online()?;
        let state = self.state.lock();
        Ok(state
            .entries
            .values()
            .filter_map(|entry| entry.record.as_ref())
            .filter(|record| record.status == status)
            .cloned()
            .collect())
    }
}
