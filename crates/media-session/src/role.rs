use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::RwLock;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    Initiator,
    Responder,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::Initiator => "initiator",
            Role::Responder => "responder",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoleAssignment {
    pub role: Role,
    pub peer_id: String,
}

impl RoleAssignment {
    pub fn is_initiator(&self) -> bool {
        self.role == Role::Initiator
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RoleError {
    #[error("no booking for session {0}")]
    UnknownSession(String),
    #[error("{participant} is not part of session {session_id}")]
    NotAParticipant {
        session_id: String,
        participant: String,
    },
    #[error("booking lookup failed: {0}")]
    Lookup(String),
}

/// Decides, outside the engine, which side of a call creates the offer.
///
/// Both endpoints must reach opposite answers for the same session.
#[async_trait]
pub trait RoleResolver: Send + Sync {
    async fn resolve_role(&self, session_id: &str, self_id: &str)
        -> Result<RoleAssignment, RoleError>;
}

/// The appointment a call session belongs to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Booking {
    pub session_id: String,
    pub requester_id: String,
    pub interpreter_id: String,
}

#[async_trait]
pub trait BookingLookup: Send + Sync {
    async fn booking(&self, session_id: &str) -> Result<Option<Booking>, RoleError>;
}

/// The requester of a booking always initiates; the interpreter responds.
pub struct BookingRoleResolver<L> {
    lookup: L,
}

impl<L: BookingLookup> BookingRoleResolver<L> {
    pub fn new(lookup: L) -> Self {
        Self { lookup }
    }
}

#[async_trait]
impl<L: BookingLookup> RoleResolver for BookingRoleResolver<L> {
    async fn resolve_role(
        &self,
        session_id: &str,
        self_id: &str,
    ) -> Result<RoleAssignment, RoleError> {
        let booking = self
            .lookup
            .booking(session_id)
            .await?
            .ok_or_else(|| RoleError::UnknownSession(session_id.to_string()))?;

        if self_id == booking.requester_id {
            Ok(RoleAssignment {
                role: Role::Initiator,
                peer_id: booking.interpreter_id,
            })
        } else if self_id == booking.interpreter_id {
            Ok(RoleAssignment {
                role: Role::Responder,
                peer_id: booking.requester_id,
            })
        } else {
            Err(RoleError::NotAParticipant {
                session_id: session_id.to_string(),
                participant: self_id.to_string(),
            })
        }
    }
}

/// In-process booking table.
#[derive(Debug, Default)]
pub struct StaticBookings {
    bookings: RwLock<HashMap<String, Booking>>,
}

impl StaticBookings {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, booking: Booking) {
        self.bookings
            .write()
            .insert(booking.session_id.clone(), booking);
    }
}

#[async_trait]
impl BookingLookup for StaticBookings {
    async fn booking(&self, session_id: &str) -> Result<Option<Booking>, RoleError> {
        Ok(self.bookings.read().get(session_id).cloned())
    }
}

#[async_trait]
impl<T: BookingLookup + ?Sized> BookingLookup for std::sync::Arc<T> {
    async fn booking(&self, session_id: &str) -> Result<Option<Booking>, RoleError> {
        (**self).booking(session_id).await
    }
}
