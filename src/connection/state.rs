//! Handshake and lifecycle state.

use serde::Serialize;
use thiserror::Error;

/// Where a connection is in its lifecycle.
///
/// The handshake advances strictly in declaration order; `AwaitingSecureOk`
/// is skipped when the client authenticates in `start-ok`. Any live state may
/// move to `Closing` and any state may move to `Closed`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    AwaitingProtocolHeader,
    AwaitingStartOk,
    AwaitingSecureOk,
    AwaitingTuneOk,
    AwaitingOpen,
    Open,
    Closing,
    Closed,
}

/// A transition the state machine does not allow.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Error)]
#[error("invalid connection state transition {from:?} -> {to:?}")]
pub struct InvalidTransition {
    pub from: ConnectionState,
    pub to: ConnectionState,
}

impl ConnectionState {
    fn allows(self, to: Self) -> bool {
        use ConnectionState::{
            AwaitingOpen,
            AwaitingProtocolHeader,
            AwaitingSecureOk,
            AwaitingStartOk,
            AwaitingTuneOk,
            Closed,
            Closing,
            Open,
        };
        match (self, to) {
            (AwaitingProtocolHeader, AwaitingStartOk)
            | (AwaitingStartOk, AwaitingSecureOk | AwaitingTuneOk)
            | (AwaitingSecureOk, AwaitingTuneOk)
            | (AwaitingTuneOk, AwaitingOpen)
            | (AwaitingOpen, Open) => true,
            (Closing | Closed, Closing) => false,
            (_, Closing) => true,
            (Closed, Closed) => false,
            (_, Closed) => true,
            _ => false,
        }
    }

    /// Move to `to` if the transition is allowed.
    ///
    /// # Errors
    ///
    /// Returns [`InvalidTransition`] and leaves `self` unchanged otherwise.
    pub fn advance(&mut self, to: Self) -> Result<(), InvalidTransition> {
        if self.allows(to) {
            *self = to;
            Ok(())
        } else {
            Err(InvalidTransition { from: *self, to })
        }
    }

    /// Whether frames on channels other than 0 are accepted.
    #[must_use]
    pub fn is_open(self) -> bool { self == Self::Open }

    /// Whether a close is under way or finished.
    #[must_use]
    pub fn is_closing(self) -> bool { matches!(self, Self::Closing | Self::Closed) }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::{ConnectionState::*, *};

    #[rstest]
    #[case(&[AwaitingStartOk, AwaitingTuneOk, AwaitingOpen, Open, Closing, Closed])]
    #[case(&[AwaitingStartOk, AwaitingSecureOk, AwaitingTuneOk, AwaitingOpen, Open])]
    #[case(&[AwaitingStartOk, Closing, Closed])]
    #[case(&[AwaitingStartOk, AwaitingTuneOk, Closed])]
    fn valid_paths(#[case] path: &[ConnectionState]) {
        let mut state = AwaitingProtocolHeader;
        for &next in path {
            state.advance(next).expect("transition allowed");
        }
    }

    #[rstest]
    #[case(AwaitingStartOk, AwaitingOpen)]
    #[case(AwaitingStartOk, Open)]
    #[case(AwaitingTuneOk, AwaitingSecureOk)]
    #[case(Open, AwaitingTuneOk)]
    #[case(Closing, Closing)]
    #[case(Closing, Open)]
    #[case(Closed, Closing)]
    #[case(Closed, Closed)]
    fn invalid_transitions_leave_state_unchanged(
        #[case] from: ConnectionState,
        #[case] to: ConnectionState,
    ) {
        let mut state = from;
        assert_eq!(state.advance(to), Err(InvalidTransition { from, to }));
        assert_eq!(state, from);
    }

    #[test]
    fn only_open_accepts_channel_frames() {
        assert!(Open.is_open());
        assert!(!AwaitingOpen.is_open());
        assert!(Closing.is_closing());
        assert!(!Open.is_closing());
    }
}
