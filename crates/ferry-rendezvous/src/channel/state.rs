//! Channel lifecycle states and the transitions allowed between them

use ferry_core::FerryError;

/// Where a channel is in its handshake
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelState {
    /// Fresh channel, no negotiation yet
    Empty,
    /// `request` issued, waiting for the peer's ACK
    Initiated,
    /// `respond` issued, role chosen
    Responded,
    /// ACK received, waiting to send the control token
    Finalizing,
    /// Control token exchanged; messages flow
    Open,
    /// Terminal
    Closed,
}

impl ChannelState {
    /// Whether the lifecycle permits moving from `self` to `next`.
    ///
    /// States only move forward, FINALIZING is entered only from INITIATED
    /// and nothing leaves CLOSED.
    pub fn can_transition_to(self, next: ChannelState) -> bool {
        use ChannelState::*;
        match (self, next) {
            (Closed, _) => false,
            (_, Closed) => true,
            (Empty, Initiated) | (Empty, Responded) => true,
            (Initiated, Finalizing) => true,
            (Finalizing, Open) | (Responded, Open) => true,
            _ => false,
        }
    }

    /// Whether the channel can never be used again
    pub fn is_terminal(self) -> bool {
        self == ChannelState::Closed
    }

    /// Error for attempting `operation` in this state
    pub(crate) fn reject(self, operation: &str) -> FerryError {
        FerryError::invalid_state(operation, self)
    }
}

#[cfg(test)]
mod tests {
    use super::ChannelState::*;
    use super::*;

    #[test]
    fn test_forward_only() {
        assert!(Empty.can_transition_to(Initiated));
        assert!(Empty.can_transition_to(Responded));
        assert!(Initiated.can_transition_to(Finalizing));
        assert!(Finalizing.can_transition_to(Open));
        assert!(Responded.can_transition_to(Open));

        assert!(!Open.can_transition_to(Finalizing));
        assert!(!Initiated.can_transition_to(Empty));
        assert!(!Initiated.can_transition_to(Open));
    }

    #[test]
    fn test_finalizing_only_from_initiated() {
        for state in [Empty, Responded, Open, Closed] {
            assert!(!state.can_transition_to(Finalizing), "{state:?}");
        }
    }

    #[test]
    fn test_closed_is_terminal() {
        assert!(Closed.is_terminal());
        for state in [Empty, Initiated, Responded, Finalizing, Open, Closed] {
            assert!(!Closed.can_transition_to(state));
        }
        for state in [Empty, Initiated, Responded, Finalizing, Open] {
            assert!(state.can_transition_to(Closed));
        }
    }

    #[test]
    fn test_reject_names_state() {
        let err = Open.reject("respond");
        assert_eq!(err.to_string(), "Invalid state: cannot respond while Open");
    }
}
