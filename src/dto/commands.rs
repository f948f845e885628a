use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};
use serde_with::skip_serializing_none;

/// Bot strength requested with `challenge_bot`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BotDifficulty {
    /// Slow, often wrong.
    Easy,
    /// Balanced.
    Medium,
    /// Fast, rarely wrong.
    Hard,
}

impl BotDifficulty {
    /// Lowercase wire name.
    pub fn as_str(self) -> &'static str {
        match self {
            BotDifficulty::Easy => "easy",
            BotDifficulty::Medium => "medium",
            BotDifficulty::Hard => "hard",
        }
    }
}

impl fmt::Display for BotDifficulty {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BotDifficulty {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "easy" => Ok(BotDifficulty::Easy),
            "medium" => Ok(BotDifficulty::Medium),
            "hard" => Ok(BotDifficulty::Hard),
            other => Err(format!("unknown difficulty `{other}`")),
        }
    }
}

/// Question pool a bot duel is drawn from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BotTarget {
    /// A single test.
    Test(u64),
    /// A whole course.
    Course(u64),
}

/// Messages sent to the duel server, serialized as `{"event": ..., "data": {...}}`.
#[skip_serializing_none]
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(
    tag = "event",
    content = "data",
    rename_all = "snake_case",
    rename_all_fields = "camelCase"
)]
pub enum ClientCommand {
    /// Enter the room of an existing duel.
    JoinDuelRoom {
        /// Duel to join.
        duel_id: u64,
    },
    /// Signal readiness once in the room.
    ReadyForDuel {},
    /// Answer the current question. `selected_answer == None` is a timeout.
    SubmitAnswer {
        /// Question being answered.
        question_id: u64,
        /// Chosen letter.
        #[serialize_always]
        selected_answer: Option<String>,
        /// Milliseconds since `serverStartTime`.
        time_taken: u64,
    },
    /// Start a duel against a bot.
    ChallengeBot {
        /// Test pool.
        test_id: Option<u64>,
        /// Course pool.
        course_id: Option<u64>,
        /// Bot strength.
        difficulty: BotDifficulty,
    },
    /// Leave the room.
    LeaveDuelRoom {},
}

impl ClientCommand {
    /// Build a `challenge_bot` command for exactly one question pool.
    pub fn challenge_bot(target: BotTarget, difficulty: BotDifficulty) -> Self {
        let (test_id, course_id) = match target {
            BotTarget::Test(id) => (Some(id), None),
            BotTarget::Course(id) => (None, Some(id)),
        };
        ClientCommand::ChallengeBot {
            test_id,
            course_id,
            difficulty,
        }
    }

    /// Event name, for logs.
    pub fn name(&self) -> &'static str {
        match self {
            ClientCommand::JoinDuelRoom { .. } => "join_duel_room",
            ClientCommand::ReadyForDuel {} => "ready_for_duel",
            ClientCommand::SubmitAnswer { .. } => "submit_answer",
            ClientCommand::ChallengeBot { .. } => "challenge_bot",
            ClientCommand::LeaveDuelRoom {} => "leave_duel_room",
        }
    }

    /// Serialize into a text frame.
    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}
