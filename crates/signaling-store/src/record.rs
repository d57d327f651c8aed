use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::OffsetDateTime;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    Offer,
    Answer,
}

/// Opaque session description as stored in the record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub sdp_type: SdpType,
    pub sdp: String,
    pub from: String,
    /// Assigned by the store when the description is written.
    #[serde(default)]
    pub created_at: Option<OffsetDateTime>,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>, from: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Offer,
            sdp: sdp.into(),
            from: from.into(),
            created_at: None,
        }
    }

    pub fn answer(sdp: impl Into<String>, from: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Answer,
            sdp: sdp.into(),
            from: from.into(),
            created_at: None,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.sdp.trim().is_empty()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    #[default]
    Active,
    Ended,
    Expired,
}

impl SessionStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, SessionStatus::Active)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallSession {
    pub session_id: String,
    #[serde(default)]
    pub initiator_id: Option<String>,
    #[serde(default)]
    pub responder_id: Option<String>,
    #[serde(default)]
    pub offer: Option<SessionDescription>,
    #[serde(default)]
    pub answer: Option<SessionDescription>,
    #[serde(default)]
    pub status: SessionStatus,
    #[serde(default)]
    pub created_at: Option<OffsetDateTime>,
    #[serde(default)]
    pub ended_at: Option<OffsetDateTime>,
}

impl CallSession {
    pub fn new(session_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            initiator_id: None,
            responder_id: None,
            offer: None,
            answer: None,
            status: SessionStatus::Active,
            created_at: None,
            ended_at: None,
        }
    }

    /// The offer, if present and non-empty.
    pub fn current_offer(&self) -> Option<&SessionDescription> {
        self.offer.as_ref().filter(|offer| !offer.is_empty())
    }

    /// The answer, if present and non-empty.
    pub fn current_answer(&self) -> Option<&SessionDescription> {
        self.answer.as_ref().filter(|answer| !answer.is_empty())
    }
}

/// Partial record for merge writes. `None` leaves the stored field untouched.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CallSessionPatch {
    pub initiator_id: Option<String>,
    pub responder_id: Option<String>,
    pub offer: Option<SessionDescription>,
    pub answer: Option<SessionDescription>,
    pub status: Option<SessionStatus>,
}

impl CallSessionPatch {
    pub fn initiator(mut self, id: impl Into<String>) -> Self {
        self.initiator_id = Some(id.into());
        self
    }

    pub fn responder(mut self, id: impl Into<String>) -> Self {
        self.responder_id = Some(id.into());
        self
    }

    pub fn offer(mut self, offer: SessionDescription) -> Self {
        self.offer = Some(offer);
        self
    }

    pub fn answer(mut self, answer: SessionDescription) -> Self {
        self.answer = Some(answer);
        self
    }

    pub fn status(mut self, status: SessionStatus) -> Self {
        self.status = Some(status);
        self
    }

    /// Applies the patch, stamping store-assigned timestamps with `now`.
    pub fn apply(self, record: &mut CallSession, now: OffsetDateTime) {
        if record.created_at.is_none() {
            record.created_at = Some(now);
        }
        if let Some(id) = self.initiator_id {
            record.initiator_id = Some(id);
        }
        if let Some(id) = self.responder_id {
            record.responder_id = Some(id);
        }
        if let Some(mut offer) = self.offer {
            offer.created_at = Some(now);
            record.offer = Some(offer);
        }
        if let Some(mut answer) = self.answer {
            answer.created_at = Some(now);
            record.answer = Some(answer);
        }
        if let Some(status) = self.status {
            if status.is_terminal() && record.status != status {
                record.ended_at = Some(now);
            }
            record.status = status;
        }
    }
}

/// Which party's candidates a sub-collection carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CandidateDirection {
    Initiator,
    Responder,
}

impl CandidateDirection {
    pub fn collection(self) -> &'static str {
        match self {
            CandidateDirection::Initiator => "initiatorCandidates",
            CandidateDirection::Responder => "responderCandidates",
        }
    }

    pub fn opposite(self) -> Self {
        match self {
            CandidateDirection::Initiator => CandidateDirection::Responder,
            CandidateDirection::Responder => CandidateDirection::Initiator,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CandidateRecord {
    pub id: String,
    pub candidate: Value,
    pub created_at: OffsetDateTime,
}
