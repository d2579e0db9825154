use shared::{domain::SendState, error::FailureKind};

use crate::error::InvalidTransition;

/// Something that happened to an echo during one pipeline run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendInput {
    /// A worker picked the echo up.
    Dispatch { requires_encryption: bool },
    Encrypted,
    EncryptionFailed { unknown_devices: bool },
    Acknowledged,
    /// Submission failed; `attempts` counts this attempt.
    Failed { kind: FailureKind, attempts: u32 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub next: SendState,
    /// The echo goes back to its room queue for another attempt.
    pub retry: bool,
}

impl Transition {
    fn to(next: SendState) -> Self {
        Self { next, retry: false }
    }
}

/// Pure mapping of (state, input) to the next state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SendStateMachine {
    max_attempts: u32,
}

impl Default for SendStateMachine {
    fn default() -> Self {
        Self::new(5)
    }
}

impl SendStateMachine {
    /// `max_attempts` bounds transmissions per run, including the first.
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn apply(
        &self,
        current: SendState,
        input: SendInput,
    ) -> Result<Transition, InvalidTransition> {
        use SendInput::*;
        use SendState::*;

        let transition = match (current, input) {
            (Unsent, Dispatch { requires_encryption }) => {
                Transition::to(if requires_encryption { Encrypting } else { Sending })
            }
            (Encrypting, Encrypted) => Transition::to(Sending),
            (Encrypting, EncryptionFailed { unknown_devices }) => {
                Transition::to(if unknown_devices {
                    FailedUnknownDevices
                } else {
                    Undelivered
                })
            }
            (Sending, Acknowledged) => Transition::to(Sent),
            (Sending, Failed { kind, attempts }) => match kind {
                FailureKind::NetworkTransient if attempts < self.max_attempts => Transition {
                    next: Unsent,
                    retry: true,
                },
                FailureKind::NetworkTransient | FailureKind::ServerRejected => {
                    Transition::to(Undelivered)
                }
                FailureKind::UnknownDevices => Transition::to(FailedUnknownDevices),
            },
            (from, input) => {
                return Err(InvalidTransition {
                    from,
                    input: format!("{input:?}"),
                })
            }
        };

        debug_assert!(current.can_transition_to(transition.next));
        Ok(transition)
    }
}
