//! Request and response bodies of the REST collaborators.

use serde::{Deserialize, Serialize};
use serde_with::{DisplayFromStr, PickFirst, serde_as, skip_serializing_none};

use crate::dto::{
    commands::BotDifficulty,
    duel::{AnsweredQuestion, DuelOutcome, UserId},
};

/// Opponent as listed by the duel endpoint.
#[serde_as]
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParticipantSummary {
    /// User id.
    #[serde_as(as = "PickFirst<(_, DisplayFromStr)>")]
    pub id: UserId,
    /// Display name.
    pub username: String,
    /// Whether the participant is a bot.
    #[serde(default)]
    pub is_bot: bool,
}

/// `GET /duels/{id}`.
#[serde_as]
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DuelDetails {
    /// Duel id.
    #[serde_as(as = "PickFirst<(_, DisplayFromStr)>")]
    pub id: u64,
    /// Backend status string.
    #[serde(default)]
    pub status: Option<String>,
    /// Test the questions are drawn from.
    #[serde_as(as = "Option<PickFirst<(_, DisplayFromStr)>>")]
    pub test_id: Option<u64>,
    /// Course the questions are drawn from.
    #[serde_as(as = "Option<PickFirst<(_, DisplayFromStr)>>")]
    pub course_id: Option<u64>,
    /// Both participants.
    #[serde(default)]
    pub participants: Vec<ParticipantSummary>,
    /// Number of rounds.
    #[serde(default)]
    pub total_questions: Option<usize>,
}

/// `GET /courses/{id}`.
#[serde_as]
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CourseSummary {
    /// Course id.
    #[serde_as(as = "PickFirst<(_, DisplayFromStr)>")]
    pub id: u64,
    /// Course title.
    #[serde(alias = "name")]
    pub title: String,
}

/// `GET /tests/{id}`.
#[serde_as]
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestSummary {
    /// Test id.
    #[serde_as(as = "PickFirst<(_, DisplayFromStr)>")]
    pub id: u64,
    /// Test title.
    #[serde(alias = "name")]
    pub title: String,
    /// Number of questions in the test.
    #[serde(default)]
    pub question_count: Option<usize>,
}

/// `GET /bots`.
#[serde_as]
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BotProfile {
    /// Bot user id.
    #[serde_as(as = "PickFirst<(_, DisplayFromStr)>")]
    pub id: UserId,
    /// Display name.
    pub username: String,
    /// Strength.
    pub difficulty: BotDifficulty,
}

/// Why a question is being reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReportReason {
    /// The keyed answer is wrong.
    WrongAnswer,
    /// Stem or options are unclear.
    Ambiguous,
    /// Typo or formatting problem.
    Typo,
    /// Anything else, detailed in the comment.
    Other,
}

/// `POST /reports`.
#[skip_serializing_none]
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportRequest {
    /// Reported question.
    pub question_id: u64,
    /// Duel the question was seen in.
    pub duel_id: Option<u64>,
    /// Category.
    pub reason: ReportReason,
    /// Free-form details.
    pub comment: Option<String>,
}

/// `POST /duels/{id}/results`: the local user's end-of-duel summary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DuelResultRecord {
    /// Duel id.
    pub duel_id: u64,
    /// Local user.
    pub user_id: UserId,
    /// Local score.
    pub user_score: u32,
    /// Opponent score.
    pub opponent_score: u32,
    /// How it ended.
    pub outcome: DuelOutcome,
    /// Per-round record.
    pub answers: Vec<AnsweredQuestion>,
    /// Mean answer time of the local user in milliseconds.
    pub average_time_ms: u64,
    /// Completion time, RFC 3339.
    pub completed_at: String,
}

/// `POST /auth/refresh` body.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RefreshRequest {
    /// Current refresh token.
    pub refresh_token: String,
}

/// `POST /auth/refresh` response.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RefreshResponse {
    /// New bearer token.
    #[serde(alias = "accessToken")]
    pub token: String,
    /// Rotated refresh token, if the backend rotates them.
    #[serde(default)]
    pub refresh_token: Option<String>,
}
