//! View models for a running duel as the server describes them.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_with::{DisplayFromStr, PickFirst, serde_as};
use validator::{Validate, ValidationErrors};

use crate::dto::validation::require_present;

/// Backend user identifier.
pub type UserId = u64;

/// Lifecycle of the server-side duel room.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    /// Waiting for both players.
    Waiting,
    /// Both players present, countdown about to start.
    Starting,
    /// Questions are being played.
    Active,
    /// The duel is over.
    Completed,
}

/// Participant listed in a room.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectedUser {
    /// Display name.
    pub username: String,
    /// Whether the participant sent `ready_for_duel`.
    #[serde(default)]
    pub ready: bool,
}

/// Room description received with `room_joined`; replaced wholesale on every push.
#[serde_as]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DuelSessionInfo {
    /// Socket-side room id.
    pub session_id: String,
    /// Persistent duel id.
    #[serde_as(as = "PickFirst<(_, DisplayFromStr)>")]
    pub duel_id: u64,
    /// Room lifecycle.
    pub status: SessionStatus,
    /// Participants currently in the room.
    #[serde(default)]
    pub connected_users: Vec<ConnectedUser>,
}

/// A question whose answer window is still open.
#[serde_as]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingQuestion {
    /// Question id echoed back in `submit_answer`.
    #[serde_as(as = "PickFirst<(_, DisplayFromStr)>")]
    pub id: u64,
    /// Stem.
    pub text: String,
    /// Answer options keyed by letter, in display order.
    pub options: IndexMap<String, String>,
}

impl PendingQuestion {
    /// Attach the round outcome. The stem and options are kept as presented; only the
    /// result fields are added.
    pub fn resolve(self, correct_answer: String, explanation: Option<String>) -> ResolvedQuestion {
        ResolvedQuestion {
            id: self.id,
            text: self.text,
            options: self.options,
            correct_answer,
            explanation,
        }
    }
}

/// A question after its round resolved.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolvedQuestion {
    /// Question id.
    pub id: u64,
    /// Stem, unchanged from presentation.
    pub text: String,
    /// Options, unchanged from presentation.
    pub options: IndexMap<String, String>,
    /// Letter of the correct option.
    pub correct_answer: String,
    /// Optional explanation shown after the round.
    pub explanation: Option<String>,
}

/// The question currently on screen.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum CurrentQuestion {
    /// Answer window open.
    Pending(PendingQuestion),
    /// Round resolved.
    Resolved(ResolvedQuestion),
}

impl CurrentQuestion {
    /// Question id.
    pub fn id(&self) -> u64 {
        match self {
            CurrentQuestion::Pending(q) => q.id,
            CurrentQuestion::Resolved(q) => q.id,
        }
    }

    /// Stem.
    pub fn text(&self) -> &str {
        match self {
            CurrentQuestion::Pending(q) => &q.text,
            CurrentQuestion::Resolved(q) => &q.text,
        }
    }

    /// Options in display order.
    pub fn options(&self) -> &IndexMap<String, String> {
        match self {
            CurrentQuestion::Pending(q) => &q.options,
            CurrentQuestion::Resolved(q) => &q.options,
        }
    }

    /// Correct letter once resolved.
    pub fn correct_answer(&self) -> Option<&str> {
        match self {
            CurrentQuestion::Pending(_) => None,
            CurrentQuestion::Resolved(q) => Some(&q.correct_answer),
        }
    }
}

/// Question block carried by `round_result`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoundQuestion {
    /// Stem as the server knows it.
    pub text: String,
    /// Options as the server knows them.
    #[serde(default)]
    pub options: IndexMap<String, String>,
    /// Letter of the correct option.
    pub correct_answer: String,
    /// Optional explanation.
    #[serde(default)]
    pub explanation: Option<String>,
}

/// One participant's recorded answer for a round.
#[serde_as]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlayerAnswer {
    /// Who answered.
    #[serde_as(as = "PickFirst<(_, DisplayFromStr)>")]
    pub user_id: UserId,
    /// Chosen letter; `None` when the window expired.
    #[serde(default)]
    pub selected_answer: Option<String>,
    /// Whether the choice matched the correct answer.
    #[serde(default)]
    pub is_correct: bool,
    /// Milliseconds between presentation and submission.
    #[serde(default)]
    pub time_taken: u64,
}

/// `round_result` as received. Every field is optional on the wire so that partial
/// payloads can be recognised and dropped instead of failing the whole frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoundResultPayload {
    /// Round index.
    #[serde(default)]
    pub question_index: Option<usize>,
    /// Resolved question.
    #[serde(default)]
    pub question: Option<RoundQuestion>,
    /// Both participants' answers.
    #[serde(default)]
    pub answers: Option<Vec<PlayerAnswer>>,
}

impl Validate for RoundResultPayload {
    fn validate(&self) -> Result<(), ValidationErrors> {
        let mut errors = ValidationErrors::new();
        require_present(&mut errors, "question", &self.question);
        require_present(&mut errors, "answers", &self.answers);

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

/// A validated round result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoundResult {
    /// Round index, when the server sent one.
    pub question_index: Option<usize>,
    /// Resolved question.
    pub question: RoundQuestion,
    /// Participants' answers.
    pub answers: Vec<PlayerAnswer>,
}

impl RoundResult {
    /// First answer recorded for `user_id`.
    pub fn answer_of(&self, user_id: UserId) -> Option<&PlayerAnswer> {
        self.answers.iter().find(|answer| answer.user_id == user_id)
    }

    /// First answer recorded for anyone other than `user_id`.
    pub fn answer_of_other(&self, user_id: UserId) -> Option<&PlayerAnswer> {
        self.answers.iter().find(|answer| answer.user_id != user_id)
    }
}

impl TryFrom<RoundResultPayload> for RoundResult {
    type Error = ValidationErrors;

    fn try_from(value: RoundResultPayload) -> Result<Self, Self::Error> {
        value.validate()?;
        match (value.question, value.answers) {
            (Some(question), Some(answers)) => Ok(Self {
                question_index: value.question_index,
                question,
                answers,
            }),
            _ => Err(ValidationErrors::new()),
        }
    }
}

/// Per-participant totals in `duel_completed`.
#[serde_as]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlayerResult {
    /// Participant id.
    #[serde_as(as = "PickFirst<(_, DisplayFromStr)>")]
    pub id: UserId,
    /// Display name.
    #[serde(default)]
    pub username: Option<String>,
    /// Final score.
    #[serde(default)]
    pub score: u32,
    /// Number of correct answers, when reported separately from the score.
    #[serde(default)]
    pub correct_answers: Option<u32>,
    /// Sum of answer times in milliseconds.
    #[serde(default)]
    pub total_time: Option<u64>,
}

/// `duel_completed` payload. `winner_id == None` is a draw.
#[serde_as]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FinalResults {
    /// Winner, or `None` for a draw.
    #[serde_as(as = "Option<PickFirst<(_, DisplayFromStr)>>")]
    pub winner_id: Option<UserId>,
    /// First participant.
    pub user1: PlayerResult,
    /// Second participant.
    pub user2: PlayerResult,
}

impl FinalResults {
    /// Outcome from the point of view of `local_user`.
    pub fn outcome_for(&self, local_user: UserId) -> DuelOutcome {
        match self.winner_id {
            None => DuelOutcome::Draw,
            Some(winner) if winner == local_user => DuelOutcome::Victory,
            Some(_) => DuelOutcome::Defeat,
        }
    }

    /// Totals of `local_user`, if they are one of the two participants.
    pub fn result_of(&self, local_user: UserId) -> Option<&PlayerResult> {
        [&self.user1, &self.user2]
            .into_iter()
            .find(|result| result.id == local_user)
    }
}

/// How the duel ended for the local user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DuelOutcome {
    /// The local user won.
    Victory,
    /// The opponent won.
    Defeat,
    /// Nobody won.
    Draw,
    /// The opponent left; the duel resolves in the local user's favour.
    OpponentLeft,
}

/// Local record of a finished round, kept for the end-of-duel summary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AnsweredQuestion {
    /// Round index.
    pub question_index: usize,
    /// Question id.
    pub question_id: u64,
    /// Stem.
    pub text: String,
    /// Options.
    pub options: IndexMap<String, String>,
    /// Correct letter.
    pub correct_answer: String,
    /// Explanation.
    pub explanation: Option<String>,
    /// Local user's letter.
    pub selected_answer: Option<String>,
    /// Whether the local user was right.
    pub is_correct: bool,
    /// Local user's answer time.
    pub time_taken_ms: u64,
    /// Opponent's letter.
    pub opponent_answer: Option<String>,
    /// Whether the opponent was right.
    pub opponent_correct: bool,
}

/// Countdown state exposed to consumers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TimerSnapshot {
    /// Presentation time, epoch milliseconds.
    pub server_start_time: i64,
    /// Deadline, epoch milliseconds.
    pub server_end_time: i64,
    /// Whole seconds left, rounded up.
    pub time_left_seconds: u64,
    /// Whether the value comes from a recent server push.
    pub is_synced: bool,
}
