//! Signaling store: the shared, eventually-consistent relay two call endpoints use to
//! exchange session descriptions and connectivity candidates before they can reach
//! each other directly.
//!
//! Responsibilities:
//! - the `CallSession` record and its two append-only candidate sub-collections
//! - the [`SignalingStore`] capability every backend implements
//! - an in-process [`MemoryStore`] for tests, demos and single-host deployments
//! - the expiry [`Janitor`] that retires sessions nobody ended

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

mod janitor;
mod memory;
mod record;
mod subscription;

pub use janitor::{expire_stale, Janitor, DEFAULT_RETENTION, MIN_SWEEP_INTERVAL};
pub use memory::{Clock, MemoryStore};
pub use record::{
    CallSession, CallSessionPatch, CandidateDirection, CandidateRecord, SdpType,
    SessionDescription, SessionStatus,
};
pub use subscription::{Subscription, Unsubscribe};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("signaling store unavailable: {0}")]
    Unavailable(String),
    #[error("write to session {session_id} rejected: {reason}")]
    Rejected { session_id: String, reason: String },
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Capability contract for the document store used as the signaling channel.
///
/// Writes are merges: fields absent from a [`CallSessionPatch`] are left untouched.
/// Timestamps (`createdAt`, `endedAt`, description and candidate `createdAt`) are
/// assigned by the store at write time, never by the caller.
#[async_trait]
pub trait SignalingStore: Send + Sync {
    async fn get(&self, session_id: &str) -> StoreResult<Option<CallSession>>;

    /// Merge `patch` into the record, creating it when absent.
    async fn set_merge(&self, session_id: &str, patch: CallSessionPatch) -> StoreResult<()>;

    /// Merge `patch` into an existing record. Returns `false` without writing when the
    /// record does not exist, so a concurrent delete is never undone.
    async fn update(&self, session_id: &str, patch: CallSessionPatch) -> StoreResult<bool>;

    /// Change stream for one record. The current snapshot (if any) is delivered first,
    /// then one snapshot per mutation. The stream closes when the record is deleted.
    async fn subscribe(&self, session_id: &str) -> StoreResult<Subscription<CallSession>>;

    /// Appends to one candidate sub-collection. Rejected when the session record does
    /// not exist.
    async fn append_candidate(
        &self,
        session_id: &str,
        direction: CandidateDirection,
        candidate: Value,
    ) -> StoreResult<CandidateRecord>;

    /// Ordered stream of one candidate sub-collection: existing records in creation
    /// order, then each newly appended record.
    async fn subscribe_candidates(
        &self,
        session_id: &str,
        direction: CandidateDirection,
    ) -> StoreResult<Subscription<CandidateRecord>>;

    /// Deletes the record together with both candidate sub-collections.
    async fn delete(&self, session_id: &str) -> StoreResult<()>;

    async fn list_by_status(&self, status: SessionStatus) -> StoreResult<Vec<CallSession>>;
}

/// Confirmation step: make sure an `active` record exists for `session_id`.
///
/// Returns `true` when this call created the record.
pub async fn ensure_session(
    store: &dyn SignalingStore,
    session_id: &str,
    initiator_id: &str,
) -> StoreResult<bool> {
    if store.get(session_id).await?.is_some() {
        return Ok(false);
    }
    store
        .set_merge(
            session_id,
            CallSessionPatch::default()
                .initiator(initiator_id)
                .status(SessionStatus::Active),
        )
        .await?;
    tracing::debug!(target: "signaling_store", session_id, "call session created");
    Ok(true)
}

/// Marks the session `ended`; the store stamps `endedAt`. A missing record is left
/// missing.
pub async fn end_session(store: &dyn SignalingStore, session_id: &str) -> StoreResult<()> {
    let ended = store
        .update(
            session_id,
            CallSessionPatch::default().status(SessionStatus::Ended),
        )
        .await?;
    if !ended {
        tracing::debug!(target: "signaling_store", session_id, "no session to end");
    }
    Ok(())
}
