//! Handshake lifecycle state machine
//!
//! Each pairing attempt moves through an explicit state machine instead of
//! being implied by which await the handler task happens to be parked on.
//! Illegal transitions are protocol errors; a timed-out or failed attempt
//! never resurrects.

use crate::{Error, Result};

/// Where a pairing attempt currently stands
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeState {
    /// Connection open, machine info not yet received
    AwaitingInput,

    /// Challenge phrase generated and shown to the new machine
    Issued,

    /// A trusted device submitted the matching phrase in time
    Accepted,

    /// Nobody answered within the acceptance window
    TimedOut,

    /// Key material is moving between the two devices
    Exchanging,

    /// Encrypted master key delivered, machine persisted
    Done,

    /// Aborted by error on either side
    Failed,
}

/// Events that drive the state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeEvent {
    /// Machine info validated, phrase issued
    PhraseIssued,

    /// Matching phrase submitted by a trusted device
    Accept,

    /// Acceptance window elapsed
    Timeout,

    /// New machine uploaded its public key
    KeyUploaded,

    /// Encrypted master key delivered
    Complete,

    /// Unrecoverable error on either side
    Fail,
}

impl HandshakeState {
    /// Apply an event, producing the next state.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Protocol`] if the event is not legal in the current
    /// state.
    pub fn apply(self, event: HandshakeEvent) -> Result<Self> {
        use HandshakeEvent as E;
        use HandshakeState as S;

        let next = match (self, event) {
            (S::AwaitingInput, E::PhraseIssued) => S::Issued,
            (S::Issued, E::Accept) => S::Accepted,
            (S::Issued, E::Timeout) => S::TimedOut,
            (S::Accepted, E::KeyUploaded) => S::Exchanging,
            (S::Exchanging, E::Complete) => S::Done,
            (S::AwaitingInput | S::Issued | S::Accepted | S::Exchanging, E::Fail) => S::Failed,
            (state, event) => {
                return Err(Error::Protocol(format!(
                    "illegal handshake transition {state:?} + {event:?}"
                )));
            }
        };
        Ok(next)
    }

    /// Whether the attempt has reached a final state
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::TimedOut | Self::Done | Self::Failed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn happy_path_reaches_done() {
        let mut state = HandshakeState::AwaitingInput;
        for event in [
            HandshakeEvent::PhraseIssued,
            HandshakeEvent::Accept,
            HandshakeEvent::KeyUploaded,
            HandshakeEvent::Complete,
        ] {
            state = state.apply(event).unwrap();
        }
        assert_eq!(state, HandshakeState::Done);
        assert!(state.is_terminal());
    }

    #[test]
    fn timeout_only_from_issued() {
        let state = HandshakeState::AwaitingInput
            .apply(HandshakeEvent::PhraseIssued)
            .unwrap();
        assert_eq!(state.apply(HandshakeEvent::Timeout).unwrap(), HandshakeState::TimedOut);

        assert!(HandshakeState::Accepted.apply(HandshakeEvent::Timeout).is_err());
        assert!(HandshakeState::Done.apply(HandshakeEvent::Timeout).is_err());
    }

    #[test]
    fn terminal_states_reject_everything() {
        for state in [
            HandshakeState::TimedOut,
            HandshakeState::Done,
            HandshakeState::Failed,
        ] {
            for event in [
                HandshakeEvent::PhraseIssued,
                HandshakeEvent::Accept,
                HandshakeEvent::Timeout,
                HandshakeEvent::KeyUploaded,
                HandshakeEvent::Complete,
                HandshakeEvent::Fail,
            ] {
                assert!(state.apply(event).is_err(), "{state:?} + {event:?}");
            }
        }
    }

    #[test]
    fn fail_allowed_from_any_live_state() {
        for state in [
            HandshakeState::AwaitingInput,
            HandshakeState::Issued,
            HandshakeState::Accepted,
            HandshakeState::Exchanging,
        ] {
            assert_eq!(
                state.apply(HandshakeEvent::Fail).unwrap(),
                HandshakeState::Failed
            );
        }
    }

    #[test]
    fn cannot_skip_acceptance() {
        let state = HandshakeState::AwaitingInput
            .apply(HandshakeEvent::PhraseIssued)
            .unwrap();
        assert!(state.apply(HandshakeEvent::KeyUploaded).is_err());
    }
}
