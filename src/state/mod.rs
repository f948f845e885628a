//! Client-side duel state: the phase machine, the question countdown and the aggregate
//! that ties them to the decoded server events.

pub mod duel;
pub mod phase;
pub mod timer;

pub use self::duel::{Applied, DuelSettings, DuelSnapshot, DuelState};
pub use self::phase::{DuelPhase, InvalidTransition, PhaseMachine};
pub use self::timer::{Tick, TimerReconciler, TimerSource};
