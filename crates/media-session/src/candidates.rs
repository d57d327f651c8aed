use std::collections::HashSet;

use signaling_store::CandidateRecord;
use time::OffsetDateTime;

use crate::transport::IceCandidate;

/// What to do with one remote candidate record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    Apply(IceCandidate),
    Queued,
    Duplicate,
    Malformed(String),
}

/// Remote candidates waiting on, or released by, the remote description.
///
/// Records arrive in store order and may be delivered more than once; each id is
/// admitted at most once. Until [`CandidateInbox::mark_remote_ready`] is called,
/// admitted candidates are held back in arrival order.
#[derive(Debug, Default)]
pub struct CandidateInbox {
    seen: HashSet<String>,
    pending: Vec<IceCandidate>,
    remote_ready: bool,
    last_created_at: Option<OffsetDateTime>,
}

impl CandidateInbox {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn admit(&mut self, record: &CandidateRecord) -> Admission {
        if !self.seen.insert(record.id.clone()) {
            return Admission::Duplicate;
        }
        if let Some(last) = self.last_created_at {
            if record.created_at < last {
                tracing::warn!(
                    target: "media_session::candidates",
                    id = %record.id,
                    "candidate delivered out of creation order"
                );
            }
        }
        self.last_created_at = Some(record.created_at);

        let candidate: IceCandidate = match serde_json::from_value(record.candidate.clone()) {
            Ok(candidate) => candidate,
            Err(err) => return Admission::Malformed(err.to_string()),
        };

        if self.remote_ready {
            Admission::Apply(candidate)
        } else {
            self.pending.push(candidate);
            Admission::Queued
        }
    }

    /// Marks the remote description applied and hands back everything held so far.
    pub fn mark_remote_ready(&mut self) -> Vec<IceCandidate> {
        self.remote_ready = true;
        std::mem::take(&mut self.pending)
    }

    pub fn is_remote_ready(&self) -> bool {
        self.remote_ready
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }
}
