//! Session driver: a single task owning the [`DuelState`].
//!
//! The task multiplexes decoded server events (fed by listeners registered on the
//! [`ConnectionManager`]), caller commands and the local countdown tick, and publishes a
//! [`DuelSnapshot`] after every change.

use std::{sync::Arc, time::Duration};

use futures::future::join_all;
use tokio::{
    sync::{mpsc, oneshot, watch},
    task::JoinHandle,
    time::{MissedTickBehavior, interval, timeout},
};
use tokio_stream::wrappers::WatchStream;
use tracing::{debug, info, warn};

use crate::{
    clock::Clock,
    config::ClientConfig,
    dto::{
        commands::{BotDifficulty, BotTarget, ClientCommand},
        events::{DuelEvent, EventKind},
    },
    error::SessionError,
    services::{
        connection::ConnectionManager, listeners::ListenerId, results::ResultSink,
    },
    state::{Applied, DuelSettings, DuelSnapshot, DuelState},
};

/// How the session enters its room once the socket is acknowledged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEntry {
    /// Join an existing duel.
    Join(u64),
    /// Ask for a bot opponent.
    Challenge {
        /// Question pool.
        target: BotTarget,
        /// Bot strength.
        difficulty: BotDifficulty,
    },
}

impl SessionEntry {
    fn command(self) -> ClientCommand {
        match self {
            SessionEntry::Join(duel_id) => ClientCommand::JoinDuelRoom { duel_id },
            SessionEntry::Challenge { target, difficulty } => {
                ClientCommand::challenge_bot(target, difficulty)
            }
        }
    }
}

/// Session parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSettings {
    /// Duel parameters.
    pub duel: DuelSettings,
    /// Period of the local countdown tick.
    pub tick_interval: Duration,
    /// Command sent on every acknowledged connect.
    pub entry: Option<SessionEntry>,
    /// Longest [`DuelSession::close`] waits for result sinks still running.
    pub results_timeout: Duration,
}

impl SessionSettings {
    /// Settings with a 100 ms tick, a 15 s results timeout and no automatic entry.
    pub fn new(duel: DuelSettings) -> Self {
        Self {
            duel,
            tick_interval: Duration::from_millis(100),
            entry: None,
            results_timeout: Duration::from_secs(15),
        }
    }

    /// Take the tick period and staleness window from the configuration.
    pub fn from_config(config: &ClientConfig, duel: DuelSettings) -> Self {
        let staleness = i64::try_from(config.sync_staleness.as_millis()).unwrap_or(i64::MAX);
        Self {
            duel: duel.with_sync_staleness_ms(staleness),
            tick_interval: config.tick_interval,
            entry: None,
            results_timeout: config.results_timeout,
        }
    }

    /// Enter the room automatically once connected.
    #[must_use]
    pub fn with_entry(mut self, entry: SessionEntry) -> Self {
        self.entry = Some(entry);
        self
    }

    /// Bound the wait for result sinks on close.
    #[must_use]
    pub fn with_results_timeout(mut self, results_timeout: Duration) -> Self {
        self.results_timeout = results_timeout;
        self
    }
}

enum SessionCommand {
    SelectAnswer {
        letter: String,
        reply: oneshot::Sender<Result<(), SessionError>>,
    },
    Close {
        reply: oneshot::Sender<()>,
    },
}

/// Handle to a running duel session. Dropping it stops the session task.
pub struct DuelSession {
    connection: ConnectionManager,
    commands: mpsc::UnboundedSender<SessionCommand>,
    snapshot: watch::Receiver<DuelSnapshot>,
    listeners: Vec<(EventKind, ListenerId)>,
    task: JoinHandle<()>,
}

impl DuelSession {
    /// Register on `connection` and start the session task. The caller still has to
    /// [`connect`](Self::connect).
    pub fn start(
        connection: ConnectionManager,
        settings: SessionSettings,
        clock: Arc<dyn Clock>,
        sinks: Vec<Arc<dyn ResultSink>>,
    ) -> Self {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let listeners = EventKind::ALL
            .into_iter()
            .map(|kind| {
                let event_tx = event_tx.clone();
                let id = connection.on(kind, move |event: &DuelEvent| {
                    let _ = event_tx.send(event.clone());
                });
                (kind, id)
            })
            .collect();

        let state = DuelState::new(settings.duel.clone());
        let (snapshot_tx, snapshot) = watch::channel(state.snapshot(clock.now_ms()));
        let (commands, command_rx) = mpsc::unbounded_channel();

        let driver = Driver {
            published: state.revision(),
            state,
            connection: connection.clone(),
            clock,
            entry: settings.entry,
            sinks,
            results_timeout: settings.results_timeout,
            persisting: None,
            snapshot: snapshot_tx,
        };
        let task = tokio::spawn(driver.run(event_rx, command_rx, settings.tick_interval));

        Self {
            connection,
            commands,
            snapshot,
            listeners,
            task,
        }
    }

    /// Connect the underlying link.
    pub async fn connect(&self, token: Option<String>) -> Result<(), SessionError> {
        self.connection.connect(token).await.map_err(SessionError::from)
    }

    /// Answer the open question with `letter`.
    pub async fn select_answer(&self, letter: &str) -> Result<(), SessionError> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(SessionCommand::SelectAnswer {
                letter: letter.to_string(),
                reply,
            })
            .map_err(|_| SessionError::Closed)?;
        response.await.map_err(|_| SessionError::Closed)?
    }

    /// Send `join_duel_room`.
    pub fn join_room(&self, duel_id: u64) -> Result<(), SessionError> {
        self.emit(ClientCommand::JoinDuelRoom { duel_id })
    }

    /// Send `ready_for_duel`.
    pub fn ready(&self) -> Result<(), SessionError> {
        self.emit(ClientCommand::ReadyForDuel {})
    }

    /// Send `challenge_bot`.
    pub fn challenge_bot(
        &self,
        target: BotTarget,
        difficulty: BotDifficulty,
    ) -> Result<(), SessionError> {
        self.emit(ClientCommand::challenge_bot(target, difficulty))
    }

    /// Send `leave_duel_room`.
    pub fn leave(&self) -> Result<(), SessionError> {
        self.emit(ClientCommand::LeaveDuelRoom {})
    }

    /// Latest snapshot.
    pub fn snapshot(&self) -> DuelSnapshot {
        self.snapshot.borrow().clone()
    }

    /// Stream of snapshots, starting with the current one.
    pub fn updates(&self) -> WatchStream<DuelSnapshot> {
        WatchStream::new(self.snapshot.clone())
    }

    /// Wait until a snapshot satisfies `predicate`.
    pub async fn wait_for<F>(&self, mut predicate: F) -> Result<DuelSnapshot, SessionError>
    where
        F: FnMut(&DuelSnapshot) -> bool,
    {
        let mut snapshot = self.snapshot.clone();
        let found = snapshot
            .wait_for(|current| predicate(current))
            .await
            .map_err(|_| SessionError::Closed)?;
        Ok(found.clone())
    }

    /// Stop the countdown and the session task, then disconnect. Result sinks still
    /// running get up to [`SessionSettings::results_timeout`] before being abandoned.
    pub async fn close(self) {
        let (reply, stopped) = oneshot::channel();
        if self.commands.send(SessionCommand::Close { reply }).is_ok() {
            let _ = stopped.await;
        }
        self.connection.disconnect();
        info!("session closed");
    }

    fn emit(&self, command: ClientCommand) -> Result<(), SessionError> {
        self.connection.emit(&command).map_err(SessionError::from)
    }
}

impl Drop for DuelSession {
    fn drop(&mut self) {
        self.task.abort();
        for (kind, id) in self.listeners.drain(..) {
            self.connection.off(kind, Some(id));
        }
    }
}

struct Driver {
    state: DuelState,
    connection: ConnectionManager,
    clock: Arc<dyn Clock>,
    entry: Option<SessionEntry>,
    sinks: Vec<Arc<dyn ResultSink>>,
    results_timeout: Duration,
    persisting: Option<JoinHandle<()>>,
    snapshot: watch::Sender<DuelSnapshot>,
    published: u64,
}

impl Driver {
    async fn run(
        mut self,
        mut events: mpsc::UnboundedReceiver<DuelEvent>,
        mut commands: mpsc::UnboundedReceiver<SessionCommand>,
        tick_interval: Duration,
    ) {
        let mut ticker = interval(tick_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        let closed = loop {
            let ticking = self.state.is_ticking();
            tokio::select! {
                Some(event) = events.recv() => {
                    if self.on_event(event) == Applied::Finished {
                        self.persisting = self.persist();
                    }
                }
                command = commands.recv() => match command {
                    Some(SessionCommand::SelectAnswer { letter, reply }) => {
                        let _ = reply.send(self.select_answer(&letter));
                    }
                    Some(SessionCommand::Close { reply }) => break Some(reply),
                    None => break None,
                },
                _ = ticker.tick(), if ticking => self.on_tick(),
            }
            self.publish();
        };

        drop(ticker);
        self.finish_persisting().await;
        debug!("session loop stopped");
        if let Some(reply) = closed {
            let _ = reply.send(());
        }
    }

    fn on_event(&mut self, event: DuelEvent) -> Applied {
        let connected = matches!(event, DuelEvent::Connect { .. });
        let applied = self.state.apply(&event, self.clock.now_ms());

        if connected && applied != Applied::Ignored {
            if let Some(entry) = self.entry {
                self.send(entry.command());
            }
        }
        applied
    }

    fn on_tick(&mut self) {
        if let Some(command) = self.state.tick(self.clock.now_ms()) {
            self.send(command);
        }
    }

    fn select_answer(&mut self, letter: &str) -> Result<(), SessionError> {
        let command = self.state.select_answer(letter, self.clock.now_ms())?;
        self.connection.emit(&command)?;
        Ok(())
    }

    fn send(&self, command: ClientCommand) {
        if let Err(err) = self.connection.emit(&command) {
            warn!(command = command.name(), error = %err, "failed to send command");
        }
    }

    /// Hand the summary to every sink in a background task. Failures are logged and
    /// otherwise ignored.
    fn persist(&self) -> Option<JoinHandle<()>> {
        let Some(record) = self.state.result_record(self.clock.now_ms()) else {
            warn!("duel finished without a known duel id; results not recorded");
            return None;
        };
        let sinks = self.sinks.clone();
        Some(tokio::spawn(async move {
            let duel_id = record.duel_id;
            let outcomes = join_all(sinks.iter().map(|sink| sink.record(record.clone()))).await;
            for err in outcomes.into_iter().filter_map(Result::err) {
                warn!(duel_id, error = %err, "failed to record duel results");
            }
        }))
    }

    async fn finish_persisting(&mut self) {
        let Some(mut task) = self.persisting.take() else {
            return;
        };
        if timeout(self.results_timeout, &mut task).await.is_err() {
            warn!(
                timeout_ms = self.results_timeout.as_millis() as u64,
                "duel results still pending; abandoning"
            );
            task.abort();
        }
    }

    fn publish(&mut self) {
        if self.state.revision() == self.published {
            return;
        }
        self.published = self.state.revision();
        self.snapshot
            .send_replace(self.state.snapshot(self.clock.now_ms()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        clock::ManualClock,
        dto::{api::DuelResultRecord, duel::DuelOutcome},
        error::{ApiError, ConnectionError},
        services::{connection::ConnectionSettings, testing::ScriptedConnector},
        state::DuelPhase,
    };
    use futures::future::BoxFuture;
    use serde_json::{Value, json};
    use tokio::time::sleep;

    const ME: u64 = 1;
    const THEM: u64 = 2;
    const T: i64 = 1_700_000_000_000;

    struct RecordingSink(mpsc::UnboundedSender<DuelResultRecord>);

    impl ResultSink for RecordingSink {
        fn record(&self, record: DuelResultRecord) -> BoxFuture<'static, Result<(), ApiError>> {
            let _ = self.0.send(record);
            Box::pin(async { Ok(()) })
        }
    }

    struct FailingSink;

    impl ResultSink for FailingSink {
        fn record(&self, _record: DuelResultRecord) -> BoxFuture<'static, Result<(), ApiError>> {
            Box::pin(async { Err(ApiError::SessionExpired) })
        }
    }

    /// A backend that accepted the request and never answers.
    struct StuckSink;

    impl ResultSink for StuckSink {
        fn record(&self, _record: DuelResultRecord) -> BoxFuture<'static, Result<(), ApiError>> {
            Box::pin(futures::future::pending())
        }
    }

    struct Harness {
        connector: Arc<ScriptedConnector>,
        connection: ConnectionManager,
        sent: mpsc::UnboundedReceiver<String>,
        records: mpsc::UnboundedReceiver<DuelResultRecord>,
        clock: ManualClock,
        session: DuelSession,
    }

    impl Harness {
        async fn connected() -> Self {
            Self::with_sinks(vec![Arc::new(FailingSink)]).await
        }

        async fn with_sinks(mut sinks: Vec<Arc<dyn ResultSink>>) -> Self {
            let (connector, sent) = ScriptedConnector::new(vec![], Ok(()));
            let connection = ConnectionManager::new(
                ConnectionSettings {
                    url: "ws://duel.test/socket".into(),
                    connect_timeout: Duration::from_secs(10),
                    reconnect_base_delay: Duration::from_secs(1),
                    max_reconnect_attempts: 3,
                },
                connector.clone(),
            );
            let clock = ManualClock::new(T);
            let (records_tx, records) = mpsc::unbounded_channel();
            sinks.push(Arc::new(RecordingSink(records_tx)));
            let settings = SessionSettings::new(DuelSettings::new(ME).with_duel_id(9))
                .with_entry(SessionEntry::Join(9))
                .with_results_timeout(Duration::from_secs(2));
            let session = DuelSession::start(
                connection.clone(),
                settings,
                Arc::new(clock.clone()),
                sinks,
            );
            session.connect(Some("token".into())).await.unwrap();

            let mut harness = Self {
                connector,
                connection,
                sent,
                records,
                clock,
                session,
            };
            assert_eq!(harness.next_sent().await["event"], "join_duel_room");
            harness
        }

        fn push(&self, event: &str, data: Value) {
            self.connector
                .push_text(0, &json!({"event": event, "data": data}).to_string());
        }

        async fn next_sent(&mut self) -> Value {
            let text = self.sent.recv().await.unwrap();
            serde_json::from_str(&text).unwrap()
        }

        async fn reach(&self, phase: DuelPhase) -> DuelSnapshot {
            self.session
                .wait_for(|snapshot| snapshot.phase == phase)
                .await
                .unwrap()
        }

        async fn open_question(&self) -> i64 {
            self.push("duel_starting", json!({"countdown": 3}));
            self.reach(DuelPhase::Countdown).await;
            let start = self.clock.now_ms();
            self.push(
                "question_presented",
                json!({
                    "questionIndex": 0,
                    "totalQuestions": 1,
                    "question": {"id": 501, "text": "2 + 2?", "options": {"A": "4", "B": "5"}},
                    "timeLimit": 60,
                    "serverStartTime": start,
                    "serverEndTime": start + 60_000
                }),
            );
            self.reach(DuelPhase::Question).await;
            start
        }
    }

    #[tokio::test(start_paused = true)]
    async fn plays_a_duel_to_victory() {
        let mut harness = Harness::connected().await;
        harness.push(
            "room_joined",
            json!({"session": {"sessionId": "room-9", "duelId": 9, "status": "waiting"}}),
        );
        harness.open_question().await;

        harness.clock.advance(2_500);
        harness.session.select_answer("A").await.unwrap();
        let submit = harness.next_sent().await;
        assert_eq!(submit["event"], "submit_answer");
        assert_eq!(submit["data"]["questionId"], 501);
        assert_eq!(submit["data"]["selectedAnswer"], "A");
        assert_eq!(submit["data"]["timeTaken"], 2_500);
        assert!(matches!(
            harness.session.select_answer("B").await,
            Err(SessionError::AlreadyAnswered)
        ));

        harness.push(
            "round_result",
            json!({
                "questionIndex": 0,
                "question": {"text": "2 + 2?", "correctAnswer": "A"},
                "answers": [
                    {"userId": ME, "selectedAnswer": "A", "isCorrect": true, "timeTaken": 2_500},
                    {"userId": THEM, "selectedAnswer": "B", "isCorrect": false, "timeTaken": 9_000}
                ]
            }),
        );
        let results = harness.reach(DuelPhase::Results).await;
        assert_eq!((results.user_score, results.opponent_score), (1, 0));

        harness.push(
            "duel_completed",
            json!({
                "winnerId": ME,
                "user1": {"id": ME, "score": 1},
                "user2": {"id": THEM, "score": 0}
            }),
        );
        let last = harness.reach(DuelPhase::Final).await;
        assert_eq!(last.outcome, Some(DuelOutcome::Victory));

        let record = harness.records.recv().await.unwrap();
        assert_eq!(record.duel_id, 9);
        assert_eq!(record.user_score, 1);
        assert_eq!(record.answers.len(), 1);
        assert_eq!(record.average_time_ms, 2_500);
    }

    #[tokio::test(start_paused = true)]
    async fn lost_time_up_submits_a_single_timeout() {
        let mut harness = Harness::connected().await;
        harness.open_question().await;

        harness.clock.advance(65_000);
        sleep(Duration::from_millis(500)).await;

        let submit = harness.next_sent().await;
        assert_eq!(submit["event"], "submit_answer");
        assert_eq!(submit["data"]["selectedAnswer"], Value::Null);
        assert_eq!(submit["data"]["timeTaken"], 60_000);
        assert!(harness.sent.try_recv().is_err());

        let snapshot = harness.session.snapshot();
        assert!(snapshot.answered);
        assert_eq!(snapshot.timer.unwrap().time_left_seconds, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn server_time_up_suppresses_the_local_timeout() {
        let mut harness = Harness::connected().await;
        harness.open_question().await;

        harness.clock.advance(30_000);
        harness.push("question_time_up", json!({"questionIndex": 0}));
        harness.session.wait_for(|snapshot| snapshot.answered).await.unwrap();

        harness.clock.advance(60_000);
        sleep(Duration::from_secs(1)).await;
        assert!(harness.sent.try_recv().is_err());
        assert!(matches!(
            harness.session.select_answer("A").await,
            Err(SessionError::AlreadyAnswered)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn opponent_leaving_finishes_the_duel() {
        let mut harness = Harness::connected().await;
        harness.open_question().await;

        harness.push("opponent_disconnected", json!({"userId": THEM, "username": "bob"}));
        let last = harness.reach(DuelPhase::Final).await;
        assert_eq!(last.outcome, Some(DuelOutcome::OpponentLeft));
        assert!(last.error.is_none());

        let record = harness.records.recv().await.unwrap();
        assert_eq!(record.outcome, DuelOutcome::OpponentLeft);
    }

    #[tokio::test(start_paused = true)]
    async fn close_stops_and_disconnects() {
        let harness = Harness::connected().await;
        let connection = harness.connection.clone();
        assert!(connection.listener_count(EventKind::RoundResult) > 0);

        assert!(connection.is_connected());

        harness.session.close().await;
        assert!(!connection.is_connected());
        assert_eq!(connection.listener_count(EventKind::RoundResult), 0);
        assert_eq!(
            connection.emit(&ClientCommand::ReadyForDuel {}),
            Err(ConnectionError::NotConnected)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn invalid_letters_are_refused() {
        let harness = Harness::connected().await;
        harness.open_question().await;

        assert!(matches!(
            harness.session.select_answer("Q").await,
            Err(SessionError::InvalidAnswer(_))
        ));
        assert!(!harness.session.snapshot().answered);
    }

    #[tokio::test(start_paused = true)]
    async fn close_does_not_wait_forever_on_a_stuck_results_sink() {
        let mut harness = Harness::with_sinks(vec![Arc::new(StuckSink)]).await;
        harness.open_question().await;
        harness.push("opponent_disconnected", json!({"userId": THEM, "username": "bob"}));
        harness.reach(DuelPhase::Final).await;
        assert_eq!(harness.records.recv().await.unwrap().duel_id, 9);

        // The loop keeps serving commands while the stuck sink is pending.
        assert!(matches!(
            harness.session.select_answer("A").await,
            Err(SessionError::NoActiveQuestion)
        ));

        let connection = harness.connection.clone();
        let closed = tokio::time::timeout(Duration::from_secs(20), harness.session.close()).await;
        assert!(closed.is_ok());
        assert!(!connection.is_connected());
        assert_eq!(connection.listener_count(EventKind::DuelCompleted), 0);
    }
}
