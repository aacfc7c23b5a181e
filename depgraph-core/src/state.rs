//! Command state machine.
//!
//! [`CommandState::check_transition_allowed`] is the single authority on
//! which state changes are legal. It is pure: no I/O, no graph context.
//! Callers (the plan and the release engine) apply a transition only after
//! this check, so every illegal move is caught as a programming error at
//! the point it is attempted.

use crate::types::{Command, CommandState};

/// Rejected state transition. `InvalidTransition` and `IllegalPredecessor`
/// indicate bugs in the caller; `DependenciesRemaining` means the Waiting
/// set has not drained yet.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransitionError {
    #[error("Cannot transition from {from} to {to}")]
    InvalidTransition { from: String, to: String },

    #[error(
        "Can only change from Waiting to Ready once no dependencies remain; \
         still blocked by: {blocking}"
    )]
    DependenciesRemaining { blocking: String },

    #[error("Cannot transition to {attempted} because state is not {required}; state was {actual}")]
    IllegalPredecessor {
        attempted: &'static str,
        required: &'static str,
        actual: String,
    },
}

impl CommandState {
    /// Check whether `next` may follow `self`, returning the new state to
    /// apply. Rules:
    ///
    /// - `Disabled` is terminal: nothing may follow it.
    /// - No self-transitions: re-entrant calls must be caught before here.
    /// - `Deactivated` may only rewind to exactly the state it wraps (or be
    ///   disabled); deactivating captures the prior state the same way.
    /// - `Waiting → Ready` requires an empty dependency set.
    /// - The only forward steps are `Ready → Queueing → InProgress →
    ///   Succeeded`; `Failed` may follow any in-flight state and
    ///   `ReadyToRetrigger` only follows `Failed`.
    pub fn check_transition_allowed(
        &self,
        next: &CommandState,
    ) -> Result<CommandState, TransitionError> {
        if matches!(self, CommandState::Disabled) {
            return Err(self.invalid(next));
        }
        if self.name() == next.name() {
            return Err(self.invalid(next));
        }

        match next {
            // Deactivation must capture exactly the current state.
            CommandState::Deactivated { previous } => {
                if **previous == *self {
                    Ok(next.clone())
                } else {
                    Err(self.invalid(next))
                }
            }
            // Disabling is permitted from any non-Disabled state.
            CommandState::Disabled => Ok(next.clone()),
            _ => {
                // Reactivation is the only move out of Deactivated.
                if let CommandState::Deactivated { previous } = self {
                    return if next == &**previous {
                        Ok(next.clone())
                    } else {
                        Err(self.invalid(next))
                    };
                }
                match next {
                    CommandState::Ready => match self {
                        CommandState::Waiting { dependencies } if dependencies.is_empty() => {
                            Ok(next.clone())
                        }
                        CommandState::Waiting { dependencies } => {
                            Err(TransitionError::DependenciesRemaining {
                                blocking: dependencies
                                    .iter()
                                    .map(|id| id.identifier())
                                    .collect::<Vec<_>>()
                                    .join(", "),
                            })
                        }
                        CommandState::ReadyToRetrigger => Ok(next.clone()),
                        _ => Err(self.illegal(next, "Waiting or ReadyToRetrigger")),
                    },
                    CommandState::Queueing => self.require(next, "Ready", |s| {
                        matches!(s, CommandState::Ready)
                    }),
                    CommandState::InProgress => self.require(next, "Queueing", |s| {
                        matches!(s, CommandState::Queueing)
                    }),
                    CommandState::Succeeded => self.require(next, "InProgress", |s| {
                        matches!(s, CommandState::InProgress)
                    }),
                    CommandState::Failed { .. } => {
                        self.require(next, "Ready, Queueing or InProgress", |s| {
                            matches!(
                                s,
                                CommandState::Ready
                                    | CommandState::Queueing
                                    | CommandState::InProgress
                            )
                        })
                    }
                    CommandState::ReadyToRetrigger => self.require(next, "Failed", |s| {
                        matches!(s, CommandState::Failed { .. })
                    }),
                    // Waiting is only ever an initial state (or restored via
                    // reactivation, handled above).
                    CommandState::Waiting { .. } => Err(self.invalid(next)),
                    CommandState::Deactivated { .. } | CommandState::Disabled => unreachable!(),
                }
            }
        }
    }

    fn require(
        &self,
        next: &CommandState,
        required: &'static str,
        pred: impl Fn(&CommandState) -> bool,
    ) -> Result<CommandState, TransitionError> {
        if pred(self) {
            Ok(next.clone())
        } else {
            Err(self.illegal(next, required))
        }
    }

    fn invalid(&self, next: &CommandState) -> TransitionError {
        TransitionError::InvalidTransition {
            from: self.to_string(),
            to: next.to_string(),
        }
    }

    fn illegal(&self, next: &CommandState, required: &'static str) -> TransitionError {
        TransitionError::IllegalPredecessor {
            attempted: next.name(),
            required,
            actual: self.to_string(),
        }
    }
}

impl Command {
    /// Apply `next` after validating it against the machine.
    pub fn set_state(&mut self, next: CommandState) -> Result<(), TransitionError> {
        self.state = self.state.check_transition_allowed(&next)?;
        Ok(())
    }

    /// Opt this command out, capturing the current state for reactivation.
    pub fn deactivate(&mut self) -> Result<(), TransitionError> {
        let next = CommandState::Deactivated {
            previous: Box::new(self.state.clone()),
        };
        self.set_state(next)
    }

    /// Undo a deactivation, restoring exactly the wrapped state.
    pub fn reactivate(&mut self) -> Result<(), TransitionError> {
        match &self.state {
            CommandState::Deactivated { previous } => {
                let restored = (**previous).clone();
                self.set_state(restored)
            }
            other => Err(TransitionError::IllegalPredecessor {
                attempted: "reactivation",
                required: "Deactivated",
                actual: other.to_string(),
            }),
        }
    }

    /// Permanently exclude this command. Irreversible.
    pub fn disable(&mut self) -> Result<(), TransitionError> {
        self.set_state(CommandState::Disabled)
    }
}
