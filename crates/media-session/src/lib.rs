//! Peer media-session negotiation over a shared signaling store.
//!
//! A [`NegotiationEngine`] owns one call attempt: local capture, one peer transport,
//! and the store subscriptions that relay the offer, the answer and the trickled
//! connectivity candidates between the two endpoints. Roles come from a
//! [`RoleResolver`]; the store is any [`signaling_store::SignalingStore`].

pub mod candidates;
pub mod config;
pub mod engine;
pub mod error;
pub mod media;
pub mod role;
pub mod state;
pub mod transport;

pub use candidates::{Admission, CandidateInbox};
pub use config::{EngineConfig, EngineConfigBuilder, IceServer};
pub use engine::{NegotiationEngine, RemoteMedia, Toggle, ToggleEffect};
pub use error::{CallError, CallResult};
pub use media::{
    CaptureDevice, LocalMedia, LocalTrack, MediaAcquisition, MediaConstraints, MediaError,
    TrackKind, TrackSource,
};
pub use role::{
    Booking, BookingLookup, BookingRoleResolver, Role, RoleAssignment, RoleError, RoleResolver,
    StaticBookings,
};
pub use state::CallState;
pub use transport::{
    Description, IceCandidate, PeerState, PeerTransport, RemoteTrack, TrackSender,
    TransportError, TransportEvent, TransportFactory,
};
