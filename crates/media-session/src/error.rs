use std::time::Duration;

use signaling_store::StoreError;
use thiserror::Error;

use crate::media::{MediaError, TrackKind};
use crate::role::RoleError;
use crate::state::CallState;
use crate::transport::TransportError;

#[derive(Debug, Error)]
pub enum CallError {
    #[error("permission to use the {0} was denied")]
    PermissionDenied(String),
    #[error("no {0} was found")]
    DeviceNotFound(String),
    #[error("the {0} is in use by another application")]
    DeviceBusy(String),
    #[error("no offer appeared after {attempts} attempts ({waited:?})")]
    SignalingTimeout { attempts: u32, waited: Duration },
    #[error("peer transport has not been created")]
    TransportNotReady,
    #[error(transparent)]
    StoreUnavailable(#[from] StoreError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Role(#[from] RoleError),
    #[error("no local {0:?} track")]
    TrackUnavailable(TrackKind),
    #[error("call still {current:?} after {waited:?}")]
    StateTimeout { current: CallState, waited: Duration },
    #[error("cannot move call from {from:?} to {to:?}")]
    InvalidState { from: CallState, to: CallState },
    #[error("call already ended")]
    Ended,
}

pub type CallResult<T> = Result<T, CallError>;

impl From<MediaError> for CallError {
    fn from(err: MediaError) -> Self {
        match err {
            MediaError::PermissionDenied(device) => CallError::PermissionDenied(device),
            MediaError::DeviceNotFound(device) => CallError::DeviceNotFound(device),
            MediaError::DeviceBusy(device) => CallError::DeviceBusy(device),
        }
    }
}

impl CallError {
    /// User-facing remediation for this failure.
    pub fn remediation(&self) -> &'static str {
        match self {
            CallError::PermissionDenied(_) => {
                "Allow camera and microphone access in your browser or system settings, then rejoin."
            }
            CallError::DeviceNotFound(_) => {
                "Connect a camera or microphone and check that it is recognised, then rejoin."
            }
            CallError::DeviceBusy(_) => {
                "Close other applications that are using your camera or microphone, then rejoin."
            }
            CallError::SignalingTimeout { .. } => {
                "The other participant has not joined yet. Keep this page open and try again shortly."
            }
            CallError::TransportNotReady => "The call is still starting up. Wait a moment and retry.",
            CallError::StoreUnavailable(_) => {
                "We could not reach the call service. Check your connection and retry."
            }
            CallError::Transport(_) => "The media connection failed. Retry the call.",
            CallError::Role(_) => "You are not a participant of this appointment.",
            CallError::TrackUnavailable(_) => "That device is not part of this call.",
            CallError::StateTimeout { .. } => {
                "The connection is taking longer than expected. Check your network and retry."
            }
            CallError::InvalidState { .. } => "That action is not available right now.",
            CallError::Ended => "This call has ended.",
        }
    }

    /// Media acquisition failures are left for the user to resolve; nothing retries them.
    pub fn is_media_failure(&self) -> bool {
        matches!(
            self,
            CallError::PermissionDenied(_) | CallError::DeviceNotFound(_) | CallError::DeviceBusy(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn media_failures_map_to_distinct_remediations() {
        let errors = [
            CallError::from(MediaError::PermissionDenied("camera".into())),
            CallError::from(MediaError::DeviceNotFound("camera".into())),
            CallError::from(MediaError::DeviceBusy("camera".into())),
            CallError::SignalingTimeout {
                attempts: 30,
                waited: Duration::from_secs(29),
            },
        ];
        let messages: HashSet<_> = errors.iter().map(CallError::remediation).collect();
        assert_eq!(messages.len(), errors.len());
        assert!(errors[..3].iter().all(CallError::is_media_failure));
    }

    #[test]
    fn timeout_points_at_the_peer() {
        let err = CallError::SignalingTimeout {
            attempts: 30,
            waited: Duration::from_secs(29),
        };
        assert!(err.remediation().contains("not joined"));
        assert!(!err.remediation().to_lowercase().contains("network"));
    }
}
