//! Everything the client knows about the running duel, updated one event at a time.

use tracing::{debug, info, warn};

use crate::{
    dto::{
        api::DuelResultRecord,
        commands::ClientCommand,
        duel::{
            AnsweredQuestion, CurrentQuestion, DuelOutcome, DuelSessionInfo, FinalResults,
            RoundResult, TimerSnapshot, UserId,
        },
        events::{DuelEvent, EventKind, ParticipantInfo},
        format_epoch_ms,
        validation::validate_option_letter,
    },
    error::SessionError,
    state::{
        phase::{DuelPhase, PhaseMachine},
        timer::{DEFAULT_SYNC_STALENESS_MS, Tick, TimerReconciler},
    },
};

/// Per-duel parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DuelSettings {
    /// The signed-in user; decides which recorded answer is "ours".
    pub local_user_id: UserId,
    /// Duel being joined, when known up front. Bot challenges learn it from
    /// `room_joined`.
    pub duel_id: Option<u64>,
    /// Window during which a `timer_update` is preferred over the local estimate.
    pub sync_staleness_ms: i64,
}

impl DuelSettings {
    /// Settings with the default staleness window.
    pub fn new(local_user_id: UserId) -> Self {
        Self {
            local_user_id,
            duel_id: None,
            sync_staleness_ms: DEFAULT_SYNC_STALENESS_MS,
        }
    }

    /// Record the duel id.
    #[must_use]
    pub fn with_duel_id(mut self, duel_id: u64) -> Self {
        self.duel_id = Some(duel_id);
        self
    }

    /// Override the staleness window.
    #[must_use]
    pub fn with_sync_staleness_ms(mut self, staleness_ms: i64) -> Self {
        self.sync_staleness_ms = staleness_ms;
        self
    }
}

/// What applying an event did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Applied {
    /// Nothing changed.
    Ignored,
    /// Fields or phase changed.
    Updated,
    /// The duel reached `final`; results can be persisted.
    Finished,
}

/// Read-only view handed to consumers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DuelSnapshot {
    /// Current phase.
    pub phase: DuelPhase,
    /// Incremented on every change.
    pub revision: u64,
    /// Room description.
    pub session: Option<DuelSessionInfo>,
    /// Last known opponent details.
    pub opponent: Option<ParticipantInfo>,
    /// Both participants are in the room.
    pub both_connected: bool,
    /// The opponent signalled readiness.
    pub opponent_ready: bool,
    /// Pre-duel countdown in seconds.
    pub countdown_secs: Option<u32>,
    /// When `duel_starting` arrived, epoch milliseconds.
    pub duel_started_at: Option<i64>,
    /// Question on screen.
    pub question: Option<CurrentQuestion>,
    /// Zero-based round index.
    pub question_index: Option<usize>,
    /// Number of rounds.
    pub total_questions: Option<usize>,
    /// Countdown of the open question.
    pub timer: Option<TimerSnapshot>,
    /// A submission exists for the current question.
    pub answered: bool,
    /// Letter the local user picked.
    pub selected_answer: Option<String>,
    /// The opponent already submitted.
    pub opponent_answered: bool,
    /// Local score.
    pub user_score: u32,
    /// Opponent score.
    pub opponent_score: u32,
    /// Finished rounds.
    pub history: Vec<AnsweredQuestion>,
    /// Server totals once the duel completed.
    pub final_results: Option<FinalResults>,
    /// How the duel ended.
    pub outcome: Option<DuelOutcome>,
    /// Non-fatal message to show inline.
    pub notice: Option<String>,
    /// Fatal message shown in the `error` phase.
    pub error: Option<String>,
}

/// State of one duel instance.
#[derive(Debug, Clone)]
pub struct DuelState {
    settings: DuelSettings,
    machine: PhaseMachine,
    revision: u64,
    session: Option<DuelSessionInfo>,
    opponent: Option<ParticipantInfo>,
    both_connected: bool,
    opponent_ready: bool,
    countdown_secs: Option<u32>,
    duel_started_at: Option<i64>,
    question: Option<CurrentQuestion>,
    question_index: Option<usize>,
    total_questions: Option<usize>,
    timer: Option<TimerReconciler>,
    answered: bool,
    selected_answer: Option<String>,
    answered_at: Option<u64>,
    opponent_answered: bool,
    user_score: u32,
    opponent_score: u32,
    history: Vec<AnsweredQuestion>,
    final_results: Option<FinalResults>,
    outcome: Option<DuelOutcome>,
    notice: Option<String>,
    error: Option<String>,
}

impl DuelState {
    /// Fresh state in `connecting`.
    pub fn new(settings: DuelSettings) -> Self {
        Self {
            settings,
            machine: PhaseMachine::new(),
            revision: 0,
            session: None,
            opponent: None,
            both_connected: false,
            opponent_ready: false,
            countdown_secs: None,
            duel_started_at: None,
            question: None,
            question_index: None,
            total_questions: None,
            timer: None,
            answered: false,
            selected_answer: None,
            answered_at: None,
            opponent_answered: false,
            user_score: 0,
            opponent_score: 0,
            history: Vec::new(),
            final_results: None,
            outcome: None,
            notice: None,
            error: None,
        }
    }

    /// Current phase.
    pub fn phase(&self) -> DuelPhase {
        self.machine.phase()
    }

    /// Change counter; bumped by every applied event, tick or selection.
    pub fn revision(&self) -> u64 {
        self.revision
    }

    /// Whether the local countdown needs ticking.
    pub fn is_ticking(&self) -> bool {
        self.phase() == DuelPhase::Question && self.timer.as_ref().is_some_and(|t| t.is_running())
    }

    /// Apply one inbound event. Events that do not fit the current phase are ignored.
    pub fn apply(&mut self, event: &DuelEvent, now: i64) -> Applied {
        let applied = match event {
            DuelEvent::Connect { .. } => self.transition(EventKind::Connect),
            DuelEvent::Disconnect { reason } => self.fail(EventKind::Disconnect, reason),
            DuelEvent::ConnectError(err) => self.fail(EventKind::ConnectError, &err.message),
            DuelEvent::DuelError(err) => self.fail(EventKind::DuelError, &err.message),
            DuelEvent::RoomError(err) => self.fail(EventKind::RoomError, &err.message),
            DuelEvent::RoomJoined(joined) => self.update_live(|state| {
                state.session = Some(joined.session.clone());
            }),
            DuelEvent::OpponentJoined(info) => self.update_live(|state| {
                state.opponent = Some(info.clone());
            }),
            DuelEvent::BothPlayersConnected => self.update_live(|state| {
                state.both_connected = true;
            }),
            DuelEvent::PlayerReady(info) => {
                if info.user_id == Some(self.settings.local_user_id) {
                    Applied::Ignored
                } else {
                    self.update_live(|state| state.opponent_ready = true)
                }
            }
            DuelEvent::QuestionError(err) => self.update_live(|state| {
                state.notice = Some(err.message.clone());
            }),
            DuelEvent::OpponentDisconnected(info) => self.on_opponent_left(info),
            DuelEvent::DuelStarting(starting) => {
                let applied = self.transition(EventKind::DuelStarting);
                if applied != Applied::Ignored {
                    self.countdown_secs = Some(starting.countdown);
                    self.duel_started_at = Some(now);
                }
                applied
            }
            DuelEvent::QuestionPresented(presented) => {
                let applied = self.transition(EventKind::QuestionPresented);
                if applied != Applied::Ignored {
                    self.question = Some(CurrentQuestion::Pending(presented.question.clone()));
                    self.question_index = Some(presented.question_index);
                    self.total_questions = Some(presented.total_questions);
                    self.timer = Some(TimerReconciler::start(
                        presented.question_index,
                        presented.server_start_time,
                        presented.server_end_time,
                        now,
                        self.settings.sync_staleness_ms,
                    ));
                    self.answered = false;
                    self.selected_answer = None;
                    self.answered_at = None;
                    self.opponent_answered = false;
                    self.notice = None;
                }
                applied
            }
            DuelEvent::TimerUpdate(update) => {
                let accepted = self.phase() == DuelPhase::Question
                    && self.timer.as_mut().is_some_and(|timer| {
                        timer.apply_server_update(update.question_index, update.time_remaining, now)
                    });
                if accepted {
                    Applied::Updated
                } else {
                    debug!(
                        question_index = update.question_index,
                        "ignoring timer update for another round"
                    );
                    Applied::Ignored
                }
            }
            DuelEvent::QuestionTimeUp(time_up) => {
                let expired = self.phase() == DuelPhase::Question
                    && self
                        .timer
                        .as_mut()
                        .is_some_and(|timer| timer.force_expire(time_up.question_index));
                if expired {
                    if !self.answered {
                        debug!(
                            question_index = time_up.question_index,
                            "server closed the answer window before any submission"
                        );
                        self.answered = true;
                    }
                    Applied::Updated
                } else {
                    Applied::Ignored
                }
            }
            DuelEvent::OpponentAnswered(info) => {
                let same_round = info.question_index.is_none() || info.question_index == self.question_index;
                if self.phase() == DuelPhase::Question && same_round {
                    self.opponent_answered = true;
                    Applied::Updated
                } else {
                    Applied::Ignored
                }
            }
            DuelEvent::RoundResult(payload) => {
                if self.phase() != DuelPhase::Question {
                    debug!(phase = ?self.phase(), "ignoring round result outside of a question");
                    return Applied::Ignored;
                }
                match RoundResult::try_from(payload.clone()) {
                    Ok(result) => self.on_round_result(result),
                    Err(errors) => {
                        warn!(error = %errors, "discarding malformed round result");
                        Applied::Ignored
                    }
                }
            }
            DuelEvent::DuelCompleted(results) => {
                let applied = self.transition(EventKind::DuelCompleted);
                if applied != Applied::Ignored {
                    self.stop_timer();
                    self.outcome = Some(results.outcome_for(self.settings.local_user_id));
                    self.final_results = Some(results.clone());
                    info!(outcome = ?self.outcome, "duel completed");
                    return self.bump(Applied::Finished);
                }
                applied
            }
        };

        self.bump(applied)
    }

    /// Record the local user's choice. The returned command must be sent by the caller.
    pub fn select_answer(&mut self, letter: &str, now: i64) -> Result<ClientCommand, SessionError> {
        let Some(CurrentQuestion::Pending(question)) = self
            .question
            .as_ref()
            .filter(|_| self.phase() == DuelPhase::Question)
        else {
            return Err(SessionError::NoActiveQuestion);
        };
        if self.answered {
            return Err(SessionError::AlreadyAnswered);
        }
        validate_option_letter(letter, &question.options)
            .map_err(|err| SessionError::InvalidAnswer(err.to_string()))?;

        let question_id = question.id;
        let time_taken = self
            .timer
            .as_ref()
            .map_or(0, |timer| timer.time_taken_ms(now));
        self.stop_timer();
        self.answered = true;
        self.selected_answer = Some(letter.to_string());
        self.answered_at = Some(time_taken);
        self.revision += 1;

        Ok(ClientCommand::SubmitAnswer {
            question_id,
            selected_answer: Some(letter.to_string()),
            time_taken,
        })
    }

    /// Advance the local countdown. Returns the timeout submission when the deadline
    /// passes without any answer.
    pub fn tick(&mut self, now: i64) -> Option<ClientCommand> {
        if self.phase() != DuelPhase::Question {
            return None;
        }
        let timer = self.timer.as_mut()?;
        let before = timer.displayed_secs();

        match timer.tick(now) {
            Tick::Expired => {
                let time_taken = timer.time_taken_ms(now);
                self.revision += 1;
                if self.answered {
                    return None;
                }
                let question_id = self.question.as_ref()?.id();
                warn!(question_id, "answer window elapsed locally; submitting timeout");
                self.answered = true;
                self.answered_at = Some(time_taken);
                Some(ClientCommand::SubmitAnswer {
                    question_id,
                    selected_answer: None,
                    time_taken,
                })
            }
            Tick::Running(secs) => {
                if secs != before {
                    self.revision += 1;
                }
                None
            }
            Tick::Idle => None,
        }
    }

    /// Consumer view at `now`.
    pub fn snapshot(&self, now: i64) -> DuelSnapshot {
        DuelSnapshot {
            phase: self.phase(),
            revision: self.revision,
            session: self.session.clone(),
            opponent: self.opponent.clone(),
            both_connected: self.both_connected,
            opponent_ready: self.opponent_ready,
            countdown_secs: self.countdown_secs,
            duel_started_at: self.duel_started_at,
            question: self.question.clone(),
            question_index: self.question_index,
            total_questions: self.total_questions,
            timer: self.timer.as_ref().map(|timer| timer.snapshot(now)),
            answered: self.answered,
            selected_answer: self.selected_answer.clone(),
            opponent_answered: self.opponent_answered,
            user_score: self.user_score,
            opponent_score: self.opponent_score,
            history: self.history.clone(),
            final_results: self.final_results.clone(),
            outcome: self.outcome,
            notice: self.notice.clone(),
            error: self.error.clone(),
        }
    }

    /// Summary persisted after the duel. `None` until the duel finished or when the
    /// duel id never became known.
    pub fn result_record(&self, now: i64) -> Option<DuelResultRecord> {
        let outcome = self.outcome?;
        let duel_id = self
            .session
            .as_ref()
            .map(|session| session.duel_id)
            .or(self.settings.duel_id)?;

        let answered = self.history.len() as u64;
        let total_time: u64 = self.history.iter().map(|answer| answer.time_taken_ms).sum();
        let average_time_ms = if answered == 0 {
            0
        } else {
            total_time / answered
        };

        Some(DuelResultRecord {
            duel_id,
            user_id: self.settings.local_user_id,
            user_score: self.user_score,
            opponent_score: self.opponent_score,
            outcome,
            answers: self.history.clone(),
            average_time_ms,
            completed_at: format_epoch_ms(now),
        })
    }

    fn on_round_result(&mut self, result: RoundResult) -> Applied {
        if let (Some(index), Some(current)) = (result.question_index, self.question_index) {
            if index != current {
                debug!(index, current, "ignoring round result for another round");
                return Applied::Ignored;
            }
        }
        let Some(CurrentQuestion::Pending(pending)) = self.question.take() else {
            return Applied::Ignored;
        };
        if self.transition(EventKind::RoundResult) == Applied::Ignored {
            self.question = Some(CurrentQuestion::Pending(pending));
            return Applied::Ignored;
        }
        self.stop_timer();

        let local = self.settings.local_user_id;
        let mine = result.answer_of(local);
        let theirs = result.answer_of_other(local);

        if mine.is_some_and(|answer| answer.is_correct) {
            self.user_score += 1;
        }
        if theirs.is_some_and(|answer| answer.is_correct) {
            self.opponent_score += 1;
        }

        let resolved = pending.resolve(
            result.question.correct_answer.clone(),
            result.question.explanation.clone(),
        );
        self.history.push(AnsweredQuestion {
            question_index: self.question_index.unwrap_or_default(),
            question_id: resolved.id,
            text: resolved.text.clone(),
            options: resolved.options.clone(),
            correct_answer: resolved.correct_answer.clone(),
            explanation: resolved.explanation.clone(),
            selected_answer: mine
                .and_then(|answer| answer.selected_answer.clone())
                .or_else(|| self.selected_answer.clone()),
            is_correct: mine.is_some_and(|answer| answer.is_correct),
            time_taken_ms: mine
                .map(|answer| answer.time_taken)
                .or(self.answered_at)
                .unwrap_or_default(),
            opponent_answer: theirs.and_then(|answer| answer.selected_answer.clone()),
            opponent_correct: theirs.is_some_and(|answer| answer.is_correct),
        });
        self.question = Some(CurrentQuestion::Resolved(resolved));

        Applied::Updated
    }

    fn on_opponent_left(&mut self, info: &ParticipantInfo) -> Applied {
        if self.transition(EventKind::OpponentDisconnected) == Applied::Ignored {
            return Applied::Ignored;
        }
        self.stop_timer();
        self.outcome = Some(DuelOutcome::OpponentLeft);
        let name = info.username.as_deref().unwrap_or("Your opponent");
        self.notice = Some(format!("{name} left the duel. You win!"));
        info!(opponent = ?info.user_id, "opponent disconnected; duel resolved in our favour");
        Applied::Finished
    }

    fn fail(&mut self, event: EventKind, message: &str) -> Applied {
        let applied = self.transition(event);
        if applied != Applied::Ignored {
            self.stop_timer();
            warn!(event = event.wire_name(), reason = message, "duel failed");
            self.error = Some(message.to_string());
        }
        applied
    }

    fn update_live<F>(&mut self, update: F) -> Applied
    where
        F: FnOnce(&mut Self),
    {
        if self.phase().is_terminal() {
            return Applied::Ignored;
        }
        update(self);
        Applied::Updated
    }

    fn transition(&mut self, event: EventKind) -> Applied {
        match self.machine.apply(event) {
            Ok(next) => {
                debug!(event = event.wire_name(), phase = ?next, "phase changed");
                Applied::Updated
            }
            Err(err) => {
                debug!(error = %err, "ignoring event");
                Applied::Ignored
            }
        }
    }

    fn stop_timer(&mut self) {
        if let Some(timer) = self.timer.as_mut() {
            timer.stop();
        }
    }

    fn bump(&mut self, applied: Applied) -> Applied {
        if applied != Applied::Ignored {
            self.revision += 1;
        }
        applied
    }
}
