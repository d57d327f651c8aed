use serde::Serialize;

/// Lifecycle of one call attempt as seen by the local endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CallState {
    Idle,
    MediaReady,
    TransportCreated,
    OfferSent,
    AwaitingAnswer,
    AwaitingOffer,
    AnswerSent,
    Connected,
    Ended,
}

impl CallState {
    pub fn can_transition_to(self, next: CallState) -> bool {
        use CallState::*;
        if next == Ended {
            return self != Ended;
        }
        matches!(
            (self, next),
            (Idle, MediaReady)
                | (MediaReady, TransportCreated)
                | (TransportCreated, OfferSent)
                | (TransportCreated, AwaitingOffer)
                | (OfferSent, AwaitingAnswer)
                | (AwaitingAnswer, Connected)
                | (AwaitingOffer, AnswerSent)
                | (AnswerSent, Connected)
        )
    }

    pub fn is_terminal(self) -> bool {
        self == CallState::Ended
    }

    /// True once signaling for this endpoint has started.
    pub fn is_negotiating(self) -> bool {
        use CallState::*;
        matches!(
            self,
            OfferSent | AwaitingAnswer | AwaitingOffer | AnswerSent
        )
    }
}
