use serde::{Deserialize, Serialize};

/// Lifecycle of one chat session. `Closed` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SessionState {
    Idle,
    Negotiating,
    Open,
    Chatting,
    Closed,
}

impl SessionState {
    pub fn can_transition_to(&self, next: SessionState) -> bool {
        use SessionState::*;
        matches!(
            (self, next),
            (Idle, Negotiating)
                | (Negotiating, Open)
                | (Open, Chatting)
                | (Idle | Negotiating | Open | Chatting, Closed)
        )
    }

    pub fn is_closed(&self) -> bool {
        matches!(self, SessionState::Closed)
    }

    /// Whether chat traffic may flow.
    pub fn is_connected(&self) -> bool {
        matches!(self, SessionState::Open | SessionState::Chatting)
    }
}
