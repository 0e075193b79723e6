//! Session lifecycle states

use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Disconnected,
    Connecting,
    Connected,
    Failed,
    /// Waiting for the user to adjudicate a host key
    HostKeyPending,
}

impl SessionState {
    /// Whether `self -> next` is an allowed transition.
    pub fn can_transition_to(self, next: SessionState) -> bool {
        use SessionState::*;
        matches!(
            (self, next),
            (Disconnected, Connecting)
                | (Failed, Connecting)
                | (Connecting, Connected)
                | (Connecting, Failed)
                | (Connecting, HostKeyPending)
                | (Connecting, Disconnected)
                | (Connected, Disconnected)
                | (Connected, HostKeyPending)
                | (HostKeyPending, Connecting)
                | (HostKeyPending, Connected)
                | (HostKeyPending, Disconnected)
                | (Failed, Disconnected)
        )
    }

    pub fn is_connected(self) -> bool {
        self == SessionState::Connected
    }
}
