//! Inbound events: server pushes plus the connection lifecycle events the client raises
//! locally, decoded into a single tagged union.

use serde::{Deserialize, de::DeserializeOwned};
use serde_json::Value;
use serde_with::{DisplayFromStr, PickFirst, serde_as};
use thiserror::Error;

use crate::dto::duel::{
    DuelSessionInfo, FinalResults, PendingQuestion, RoundResultPayload, UserId,
};

/// Registry key for listeners, one per event name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    /// Link established and acknowledged.
    Connect,
    /// Link lost or closed.
    Disconnect,
    /// Connection attempt failed.
    ConnectError,
    /// Room membership confirmed.
    RoomJoined,
    /// Room membership refused.
    RoomError,
    /// Opponent entered the room.
    OpponentJoined,
    /// Opponent left mid-duel.
    OpponentDisconnected,
    /// Both participants are in the room.
    BothPlayersConnected,
    /// A participant is ready.
    PlayerReady,
    /// Pre-duel countdown started.
    DuelStarting,
    /// A new question opened.
    QuestionPresented,
    /// Authoritative remaining time.
    TimerUpdate,
    /// Server closed the answer window.
    QuestionTimeUp,
    /// Opponent submitted.
    OpponentAnswered,
    /// Round resolved.
    RoundResult,
    /// Duel finished.
    DuelCompleted,
    /// Fatal duel error.
    DuelError,
    /// Non-fatal question error.
    QuestionError,
}

impl EventKind {
    /// Every kind, in wire order.
    pub const ALL: [EventKind; 18] = [
        EventKind::Connect,
        EventKind::Disconnect,
        EventKind::ConnectError,
        EventKind::RoomJoined,
        EventKind::RoomError,
        EventKind::OpponentJoined,
        EventKind::OpponentDisconnected,
        EventKind::BothPlayersConnected,
        EventKind::PlayerReady,
        EventKind::DuelStarting,
        EventKind::QuestionPresented,
        EventKind::TimerUpdate,
        EventKind::QuestionTimeUp,
        EventKind::OpponentAnswered,
        EventKind::RoundResult,
        EventKind::DuelCompleted,
        EventKind::DuelError,
        EventKind::QuestionError,
    ];

    /// Event name used on the wire.
    pub fn wire_name(self) -> &'static str {
        match self {
            EventKind::Connect => "connect",
            EventKind::Disconnect => "disconnect",
            EventKind::ConnectError => "connect_error",
            EventKind::RoomJoined => "room_joined",
            EventKind::RoomError => "room_error",
            EventKind::OpponentJoined => "opponent_joined",
            EventKind::OpponentDisconnected => "opponent_disconnected",
            EventKind::BothPlayersConnected => "both_players_connected",
            EventKind::PlayerReady => "player_ready",
            EventKind::DuelStarting => "duel_starting",
            EventKind::QuestionPresented => "question_presented",
            EventKind::TimerUpdate => "timer_update",
            EventKind::QuestionTimeUp => "question_time_up",
            EventKind::OpponentAnswered => "opponent_answered",
            EventKind::RoundResult => "round_result",
            EventKind::DuelCompleted => "duel_completed",
            EventKind::DuelError => "duel_error",
            EventKind::QuestionError => "question_error",
        }
    }

    /// Reverse of [`EventKind::wire_name`].
    pub fn from_wire(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.wire_name() == name)
    }
}

/// Server-provided human-readable failure.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ErrorMessage {
    /// Message to display.
    #[serde(default)]
    pub message: String,
}

/// `room_joined` payload.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct RoomJoined {
    /// Room description.
    pub session: DuelSessionInfo,
}

/// Loose participant description shared by several lobby pushes.
#[serde_as]
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParticipantInfo {
    /// Participant id, when included.
    #[serde_as(as = "Option<PickFirst<(_, DisplayFromStr)>>")]
    pub user_id: Option<UserId>,
    /// Display name, when included.
    #[serde(default)]
    pub username: Option<String>,
    /// Round the push refers to, for `opponent_answered`.
    #[serde(default)]
    pub question_index: Option<usize>,
}

/// `duel_starting` payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct DuelStarting {
    /// Seconds before the first question.
    #[serde(default)]
    pub countdown: u32,
}

/// `question_presented` payload.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuestionPresented {
    /// Zero-based round index.
    pub question_index: usize,
    /// Number of rounds in the duel.
    pub total_questions: usize,
    /// Question without its answer.
    pub question: PendingQuestion,
    /// Answer window in seconds.
    #[serde(default)]
    pub time_limit: u32,
    /// Window opening, epoch milliseconds.
    pub server_start_time: i64,
    /// Window closing, epoch milliseconds.
    pub server_end_time: i64,
}

/// `timer_update` payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimerUpdate {
    /// Whole seconds remaining according to the server.
    pub time_remaining: u64,
    /// Server clock at emission, epoch milliseconds.
    #[serde(default)]
    pub server_time: Option<i64>,
    /// Round the update belongs to.
    pub question_index: usize,
}

/// `question_time_up` payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuestionTimeUp {
    /// Round whose window closed.
    pub question_index: usize,
    /// Server clock at emission, epoch milliseconds.
    #[serde(default)]
    pub server_time: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct ConnectAck {
    sid: String,
}

/// Every event a listener can observe.
#[derive(Debug, Clone, PartialEq)]
pub enum DuelEvent {
    /// Link established; carries the server-assigned socket id.
    Connect {
        /// Socket id.
        socket_id: String,
    },
    /// Link lost. Raised locally, never after an explicit disconnect.
    Disconnect {
        /// Why the link ended.
        reason: String,
    },
    /// Connection attempt failed.
    ConnectError(ErrorMessage),
    /// See [`EventKind::RoomJoined`].
    RoomJoined(RoomJoined),
    /// See [`EventKind::RoomError`].
    RoomError(ErrorMessage),
    /// See [`EventKind::OpponentJoined`].
    OpponentJoined(ParticipantInfo),
    /// See [`EventKind::OpponentDisconnected`].
    OpponentDisconnected(ParticipantInfo),
    /// See [`EventKind::BothPlayersConnected`].
    BothPlayersConnected,
    /// See [`EventKind::PlayerReady`].
    PlayerReady(ParticipantInfo),
    /// See [`EventKind::DuelStarting`].
    DuelStarting(DuelStarting),
    /// See [`EventKind::QuestionPresented`].
    QuestionPresented(QuestionPresented),
    /// See [`EventKind::TimerUpdate`].
    TimerUpdate(TimerUpdate),
    /// See [`EventKind::QuestionTimeUp`].
    QuestionTimeUp(QuestionTimeUp),
    /// See [`EventKind::OpponentAnswered`].
    OpponentAnswered(ParticipantInfo),
    /// Raw payload; validated by the state machine.
    RoundResult(RoundResultPayload),
    /// See [`EventKind::DuelCompleted`].
    DuelCompleted(FinalResults),
    /// See [`EventKind::DuelError`].
    DuelError(ErrorMessage),
    /// See [`EventKind::QuestionError`].
    QuestionError(ErrorMessage),
}

/// Failure to turn a frame into a [`DuelEvent`].
#[derive(Debug, Error)]
pub enum DecodeError {
    /// The frame is not a `{event, data}` object.
    #[error("malformed frame")]
    Envelope(#[source] serde_json::Error),
    /// The payload does not match the event.
    #[error("malformed `{event}` payload")]
    Payload {
        /// Event name.
        event: &'static str,
        #[source]
        /// Underlying JSON error.
        source: serde_json::Error,
    },
}

#[derive(Debug, Deserialize)]
struct Envelope {
    event: String,
    #[serde(default)]
    data: Value,
}

impl DuelEvent {
    /// Registry key of this event.
    pub fn kind(&self) -> EventKind {
        match self {
            DuelEvent::Connect { .. } => EventKind::Connect,
            DuelEvent::Disconnect { .. } => EventKind::Disconnect,
            DuelEvent::ConnectError(_) => EventKind::ConnectError,
            DuelEvent::RoomJoined(_) => EventKind::RoomJoined,
            DuelEvent::RoomError(_) => EventKind::RoomError,
            DuelEvent::OpponentJoined(_) => EventKind::OpponentJoined,
            DuelEvent::OpponentDisconnected(_) => EventKind::OpponentDisconnected,
            DuelEvent::BothPlayersConnected => EventKind::BothPlayersConnected,
            DuelEvent::PlayerReady(_) => EventKind::PlayerReady,
            DuelEvent::DuelStarting(_) => EventKind::DuelStarting,
            DuelEvent::QuestionPresented(_) => EventKind::QuestionPresented,
            DuelEvent::TimerUpdate(_) => EventKind::TimerUpdate,
            DuelEvent::QuestionTimeUp(_) => EventKind::QuestionTimeUp,
            DuelEvent::OpponentAnswered(_) => EventKind::OpponentAnswered,
            DuelEvent::RoundResult(_) => EventKind::RoundResult,
            DuelEvent::DuelCompleted(_) => EventKind::DuelCompleted,
            DuelEvent::DuelError(_) => EventKind::DuelError,
            DuelEvent::QuestionError(_) => EventKind::QuestionError,
        }
    }

    /// Decode one text frame. Unknown event names yield `Ok(None)`.
    pub fn decode(text: &str) -> Result<Option<Self>, DecodeError> {
        let envelope: Envelope = serde_json::from_str(text).map_err(DecodeError::Envelope)?;
        let Some(kind) = EventKind::from_wire(&envelope.event) else {
            return Ok(None);
        };
        let data = envelope.data;

        let event = match kind {
            EventKind::Connect => {
                let ack: ConnectAck = payload(kind, data)?;
                DuelEvent::Connect {
                    socket_id: ack.sid,
                }
            }
            EventKind::Disconnect => DuelEvent::Disconnect {
                reason: data
                    .get("reason")
                    .and_then(Value::as_str)
                    .unwrap_or("server disconnect")
                    .to_string(),
            },
            EventKind::ConnectError => DuelEvent::ConnectError(payload(kind, data)?),
            EventKind::RoomJoined => DuelEvent::RoomJoined(payload(kind, data)?),
            EventKind::RoomError => DuelEvent::RoomError(payload(kind, data)?),
            EventKind::OpponentJoined => DuelEvent::OpponentJoined(payload(kind, data)?),
            EventKind::OpponentDisconnected => {
                DuelEvent::OpponentDisconnected(payload(kind, data)?)
            }
            EventKind::BothPlayersConnected => DuelEvent::BothPlayersConnected,
            EventKind::PlayerReady => DuelEvent::PlayerReady(payload(kind, data)?),
            EventKind::DuelStarting => DuelEvent::DuelStarting(payload(kind, data)?),
            EventKind::QuestionPresented => DuelEvent::QuestionPresented(payload(kind, data)?),
            EventKind::TimerUpdate => DuelEvent::TimerUpdate(payload(kind, data)?),
            EventKind::QuestionTimeUp => DuelEvent::QuestionTimeUp(payload(kind, data)?),
            EventKind::OpponentAnswered => DuelEvent::OpponentAnswered(payload(kind, data)?),
            EventKind::RoundResult => DuelEvent::RoundResult(payload(kind, data)?),
            EventKind::DuelCompleted => DuelEvent::DuelCompleted(payload(kind, data)?),
            EventKind::DuelError => DuelEvent::DuelError(payload(kind, data)?),
            EventKind::QuestionError => DuelEvent::QuestionError(payload(kind, data)?),
        };

        Ok(Some(event))
    }
}

/// Decode `data`, treating `null` as an empty object so payload-less pushes still match
/// structs whose fields all have defaults.
fn payload<T>(kind: EventKind, data: Value) -> Result<T, DecodeError>
where
    T: DeserializeOwned,
{
    let data = if data.is_null() {
        Value::Object(serde_json::Map::new())
    } else {
        data
    };
    serde_json::from_value(data).map_err(|source| DecodeError::Payload {
        event: kind.wire_name(),
        source,
    })
}
