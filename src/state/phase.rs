use serde::Serialize;
use thiserror::Error;

use crate::dto::events::EventKind;

/// Stages of a duel as observed by the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DuelPhase {
    /// Waiting for the socket acknowledgment.
    Connecting,
    /// Connected; joining the room and waiting for the opponent.
    Lobby,
    /// Pre-duel countdown.
    Countdown,
    /// A question is open.
    Question,
    /// The last round's result is displayed.
    Results,
    /// The duel is over.
    Final,
    /// The duel failed.
    Error,
}

impl DuelPhase {
    /// `Final` and `Error` end the duel instance; a new duel needs a fresh state machine.
    pub fn is_terminal(self) -> bool {
        matches!(self, DuelPhase::Final | DuelPhase::Error)
    }
}

/// Error returned when an event has no transition from the current phase.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid transition: {event:?} cannot be applied while in {from:?}")]
pub struct InvalidTransition {
    /// The phase the state machine was in when the event was received.
    pub from: DuelPhase,
    /// The event that cannot be applied from this phase.
    pub event: EventKind,
}

/// Phase state machine of a single duel.
#[derive(Debug, Clone)]
pub struct PhaseMachine {
    phase: DuelPhase,
    version: usize,
}

impl Default for PhaseMachine {
    fn default() -> Self {
        Self {
            phase: DuelPhase::Connecting,
            version: 0,
        }
    }
}

impl PhaseMachine {
    /// Create a state machine waiting for the connection.
    pub fn new() -> Self {
        Self::default()
    }

    /// Inspect the current phase.
    pub fn phase(&self) -> DuelPhase {
        self.phase
    }

    /// Number of transitions applied so far.
    pub fn version(&self) -> usize {
        self.version
    }

    /// Phase `event` would lead to, without applying it.
    pub fn next_phase(&self, event: EventKind) -> Result<DuelPhase, InvalidTransition> {
        let next = match (self.phase, event) {
            (DuelPhase::Connecting, EventKind::Connect) => DuelPhase::Lobby,
            (DuelPhase::Connecting | DuelPhase::Lobby, EventKind::RoomError) => DuelPhase::Error,
            (DuelPhase::Lobby, EventKind::DuelStarting) => DuelPhase::Countdown,
            (DuelPhase::Countdown | DuelPhase::Results, EventKind::QuestionPresented) => {
                DuelPhase::Question
            }
            (DuelPhase::Question, EventKind::RoundResult) => DuelPhase::Results,
            (DuelPhase::Results, EventKind::DuelCompleted) => DuelPhase::Final,
            (
                DuelPhase::Lobby | DuelPhase::Countdown | DuelPhase::Question | DuelPhase::Results,
                EventKind::OpponentDisconnected,
            ) => DuelPhase::Final,
            (from, EventKind::DuelError | EventKind::ConnectError | EventKind::Disconnect)
                if !from.is_terminal() =>
            {
                DuelPhase::Error
            }
            (from, event) => return Err(InvalidTransition { from, event }),
        };

        Ok(next)
    }

    /// Apply the transition for `event`, returning the new phase.
    pub fn apply(&mut self, event: EventKind) -> Result<DuelPhase, InvalidTransition> {
        let next = self.next_phase(event)?;
        self.phase = next;
        self.version += 1;
        Ok(next)
    }
}
