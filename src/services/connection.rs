//! Lifecycle of the single socket link used by a duel session.
//!
//! [`ConnectionManager`] is a cheap handle around shared state. Each live link is
//! served by a background task that decodes inbound frames, dispatches them to the
//! [`ListenerRegistry`] and writes queued outbound frames. Unexpected link loss and
//! retryable connect failures schedule a reconnect with exponential backoff.

use std::{
    sync::{
        Arc, Mutex, MutexGuard, PoisonError, Weak,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use futures::{
    FutureExt,
    future::{BoxFuture, Shared},
};
use tokio::{
    sync::{mpsc, oneshot, watch},
    task::JoinHandle,
    time::{sleep, timeout},
};
use tracing::{debug, info, warn};

use crate::{
    config::ClientConfig,
    dto::{
        commands::ClientCommand,
        events::{DuelEvent, ErrorMessage, EventKind},
    },
    error::ConnectionError,
    services::{
        listeners::{Listener, ListenerId, ListenerRegistry},
        transport::{Connector, Established, Transport, WsConnector},
    },
};

/// Connection parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionSettings {
    /// Socket endpoint.
    pub url: String,
    /// Upper bound for the handshake plus acknowledgment.
    pub connect_timeout: Duration,
    /// Delay before the first reconnect.
    pub reconnect_base_delay: Duration,
    /// Consecutive reconnects attempted before giving up.
    pub max_reconnect_attempts: u32,
}

impl From<&ClientConfig> for ConnectionSettings {
    fn from(config: &ClientConfig) -> Self {
        Self {
            url: config.socket_url.clone(),
            connect_timeout: config.connect_timeout,
            reconnect_base_delay: config.reconnect_base_delay,
            max_reconnect_attempts: config.max_reconnect_attempts,
        }
    }
}

impl ConnectionSettings {
    /// Delay before reconnect number `attempt` (1-based): `base * 2^(attempt - 1)`.
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        self.reconnect_base_delay.saturating_mul(1 << exponent)
    }
}

/// Observable connection status.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionState {
    /// A link is established and acknowledged.
    pub connected: bool,
    /// An attempt is in flight.
    pub connecting: bool,
    /// Reconnects scheduled since the last successful connect.
    pub reconnect_attempts: u32,
    /// Reconnect cap.
    pub max_reconnect_attempts: u32,
    /// Server-assigned socket id of the live link.
    pub socket_id: Option<String>,
    /// Last failure.
    pub error: Option<String>,
}

impl ConnectionState {
    fn initial(max_reconnect_attempts: u32) -> Self {
        Self {
            connected: false,
            connecting: false,
            reconnect_attempts: 0,
            max_reconnect_attempts,
            socket_id: None,
            error: None,
        }
    }
}

type ConnectFuture = Shared<BoxFuture<'static, Result<(), ConnectionError>>>;

struct Link {
    commands: mpsc::UnboundedSender<String>,
    shutdown: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

struct Inner {
    settings: ConnectionSettings,
    connector: Arc<dyn Connector>,
    registry: ListenerRegistry,
    state: watch::Sender<ConnectionState>,
    token: Mutex<Option<String>>,
    link: Mutex<Option<Link>>,
    in_flight: Mutex<Option<ConnectFuture>>,
    reconnect: Mutex<Option<JoinHandle<()>>>,
    /// Bumped by every explicit disconnect; work started under an older value is stale.
    generation: AtomicU64,
}

impl Drop for Inner {
    fn drop(&mut self) {
        let link = self.link.get_mut().unwrap_or_else(PoisonError::into_inner);
        if let Some(task) = link.as_mut().and_then(|link| link.task.take()) {
            task.abort();
        }
        let reconnect = self.reconnect.get_mut().unwrap_or_else(PoisonError::into_inner);
        if let Some(handle) = reconnect.take() {
            handle.abort();
        }
    }
}

/// Handle to the socket connection. Clones share the same link.
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<Inner>,
}

impl ConnectionManager {
    /// Create a manager that opens links through `connector`.
    pub fn new(settings: ConnectionSettings, connector: Arc<dyn Connector>) -> Self {
        let (state, _) = watch::channel(ConnectionState::initial(settings.max_reconnect_attempts));
        Self {
            inner: Arc::new(Inner {
                settings,
                connector,
                registry: ListenerRegistry::new(),
                state,
                token: Mutex::new(None),
                link: Mutex::new(None),
                in_flight: Mutex::new(None),
                reconnect: Mutex::new(None),
                generation: AtomicU64::new(0),
            }),
        }
    }

    /// Create a manager speaking WebSocket to the configured endpoint.
    pub fn websocket(config: &ClientConfig) -> Self {
        Self::new(ConnectionSettings::from(config), Arc::new(WsConnector))
    }

    /// Connect, reusing the live link or the attempt already in flight.
    ///
    /// `token` replaces the remembered credentials; when absent the last token given is
    /// reused. Fails with [`ConnectionError::MissingToken`] before any I/O when no token
    /// is known.
    pub async fn connect(&self, token: Option<String>) -> Result<(), ConnectionError> {
        if let Some(token) = token {
            *lock(&self.inner.token) = Some(token);
        }
        connect_shared(&self.inner)?.await
    }

    /// Tear down the link, cancel any scheduled reconnect, drop every listener and reset
    /// the state. No `disconnect` event is dispatched.
    pub fn disconnect(&self) {
        let inner = &self.inner;
        inner.generation.fetch_add(1, Ordering::SeqCst);

        if let Some(handle) = lock(&inner.reconnect).take() {
            handle.abort();
        }
        lock(&inner.in_flight).take();
        if let Some(mut link) = lock(&inner.link).take() {
            if let Some(shutdown) = link.shutdown.take() {
                let _ = shutdown.send(());
            }
        }
        inner.registry.clear();
        inner
            .state
            .send_replace(ConnectionState::initial(inner.settings.max_reconnect_attempts));
        info!("disconnected");
    }

    /// Register a listener for `kind`.
    pub fn on<F>(&self, kind: EventKind, listener: F) -> ListenerId
    where
        F: Fn(&DuelEvent) + Send + Sync + 'static,
    {
        let listener: Listener = Arc::new(listener);
        self.inner.registry.on(kind, listener)
    }

    /// Unregister one listener, or all listeners of `kind` when `id` is `None`.
    pub fn off(&self, kind: EventKind, id: Option<ListenerId>) {
        self.inner.registry.off(kind, id);
    }

    /// Queue `command` on the live link.
    pub fn emit(&self, command: &ClientCommand) -> Result<(), ConnectionError> {
        let text = command
            .encode()
            .map_err(|err| ConnectionError::Encode(err.to_string()))?;
        let guard = lock(&self.inner.link);
        let link = guard.as_ref().ok_or(ConnectionError::NotConnected)?;
        link.commands
            .send(text)
            .map_err(|_| ConnectionError::NotConnected)?;
        debug!(command = command.name(), "queued command");
        Ok(())
    }

    /// Current state.
    pub fn state(&self) -> ConnectionState {
        self.inner.state.borrow().clone()
    }

    /// Subscribe to state changes.
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state.subscribe()
    }

    /// Whether a link is live.
    pub fn is_connected(&self) -> bool {
        self.inner.state.borrow().connected
    }

    /// Number of listeners registered for `kind`.
    pub fn listener_count(&self, kind: EventKind) -> usize {
        self.inner.registry.count(kind)
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Return the future every caller awaits: ready when already connected, otherwise the
/// shared in-flight attempt, started on demand.
fn connect_shared(inner: &Arc<Inner>) -> Result<ConnectFuture, ConnectionError> {
    let mut in_flight = lock(&inner.in_flight);
    if let Some(attempt) = in_flight.as_ref() {
        return Ok(attempt.clone());
    }
    if inner.state.borrow().connected {
        return Ok(futures::future::ready(Ok(())).boxed().shared());
    }

    let token = lock(&inner.token)
        .clone()
        .ok_or(ConnectionError::MissingToken)?;
    let attempt = attempt(Arc::clone(inner), token).boxed().shared();
    *in_flight = Some(attempt.clone());
    Ok(attempt)
}

async fn attempt(inner: Arc<Inner>, token: String) -> Result<(), ConnectionError> {
    let generation = inner.generation.load(Ordering::SeqCst);
    inner.state.send_modify(|state| {
        state.connecting = true;
    });
    debug!(url = %inner.settings.url, "connecting");

    let result = match timeout(
        inner.settings.connect_timeout,
        inner.connector.connect(&inner.settings.url, &token),
    )
    .await
    {
        Ok(result) => result,
        Err(_) => Err(ConnectionError::Timeout),
    };

    if inner.generation.load(Ordering::SeqCst) != generation {
        if let Ok(mut established) = result {
            established.transport.close().await;
        }
        return Err(ConnectionError::NotConnected);
    }
    lock(&inner.in_flight).take();

    match result {
        Ok(established) => {
            install_link(&inner, generation, established);
            Ok(())
        }
        Err(err) => {
            warn!(error = %err, "connection attempt failed");
            inner.state.send_modify(|state| {
                state.connecting = false;
                state.connected = false;
                state.error = Some(err.to_string());
            });
            inner.registry.dispatch(&DuelEvent::ConnectError(ErrorMessage {
                message: err.to_string(),
            }));
            if err.is_retryable() {
                schedule_reconnect(&inner);
            }
            Err(err)
        }
    }
}

fn install_link(inner: &Arc<Inner>, generation: u64, established: Established) {
    let Established {
        transport,
        socket_id,
    } = established;
    let (commands, command_rx) = mpsc::unbounded_channel();
    let (shutdown, shutdown_rx) = oneshot::channel();

    *lock(&inner.link) = Some(Link {
        commands,
        shutdown: Some(shutdown),
        task: None,
    });
    inner.state.send_modify(|state| {
        state.connected = true;
        state.connecting = false;
        state.reconnect_attempts = 0;
        state.socket_id = Some(socket_id.clone());
        state.error = None;
    });
    info!(%socket_id, "connected");
    inner.registry.dispatch(&DuelEvent::Connect { socket_id });

    // Spawned after the `connect` dispatch so listeners see it before any pushed frame.
    let task = tokio::spawn(run_link(
        Arc::downgrade(inner),
        generation,
        transport,
        command_rx,
        shutdown_rx,
    ));
    if let Some(link) = lock(&inner.link).as_mut() {
        link.task = Some(task);
    }
}

async fn run_link(
    inner: Weak<Inner>,
    generation: u64,
    mut transport: Box<dyn Transport>,
    mut commands: mpsc::UnboundedReceiver<String>,
    mut shutdown: oneshot::Receiver<()>,
) {
    let reason = loop {
        tokio::select! {
            _ = &mut shutdown => {
                transport.close().await;
                return;
            }
            Some(text) = commands.recv() => {
                if let Err(err) = transport.send(text).await {
                    break err.to_string();
                }
            }
            frame = transport.recv() => match frame {
                Some(Ok(text)) => {
                    let Some(inner) = inner.upgrade() else {
                        transport.close().await;
                        return;
                    };
                    dispatch_frame(&inner, &text);
                }
                Some(Err(err)) => break err.to_string(),
                None => break "transport closed".to_string(),
            },
        }
    };

    if let Some(inner) = inner.upgrade() {
        on_link_lost(&inner, generation, reason);
    }
}

fn dispatch_frame(inner: &Inner, text: &str) {
    match DuelEvent::decode(text) {
        Ok(Some(DuelEvent::Connect { .. })) => debug!("ignoring repeated acknowledgment"),
        Ok(Some(event)) => {
            debug!(event = event.kind().wire_name(), "received event");
            inner.registry.dispatch(&event);
        }
        Ok(None) => debug!(frame = text, "ignoring unknown event"),
        Err(err) => warn!(error = %err, "dropping undecodable frame"),
    }
}

fn on_link_lost(inner: &Arc<Inner>, generation: u64, reason: String) {
    if inner.generation.load(Ordering::SeqCst) != generation {
        return;
    }
    lock(&inner.link).take();
    warn!(%reason, "link lost");
    inner.state.send_modify(|state| {
        state.connected = false;
        state.socket_id = None;
        state.error = Some(reason.clone());
    });
    inner.registry.dispatch(&DuelEvent::Disconnect { reason });
    schedule_reconnect(inner);
}

fn schedule_reconnect(inner: &Arc<Inner>) {
    let settings = &inner.settings;
    let attempts = inner.state.borrow().reconnect_attempts;
    if attempts >= settings.max_reconnect_attempts {
        warn!(attempts, "giving up on reconnecting");
        inner.state.send_modify(|state| {
            state.error = Some(format!("gave up after {attempts} reconnect attempts"));
        });
        return;
    }

    let attempt_number = attempts + 1;
    let delay = settings.backoff_delay(attempt_number);
    inner.state.send_modify(|state| {
        state.reconnect_attempts = attempt_number;
    });
    info!(attempt = attempt_number, delay_ms = delay.as_millis() as u64, "scheduling reconnect");

    let weak = Arc::downgrade(inner);
    let generation = inner.generation.load(Ordering::SeqCst);
    let handle = tokio::spawn(async move {
        sleep(delay).await;
        let Some(inner) = weak.upgrade() else {
            return;
        };
        if inner.generation.load(Ordering::SeqCst) != generation {
            return;
        }
        lock(&inner.reconnect).take();
        let attempt = match connect_shared(&inner) {
            Ok(attempt) => attempt,
            Err(err) => {
                warn!(error = %err, "cannot reconnect");
                return;
            }
        };
        drop(inner);
        if let Err(err) = attempt.await {
            debug!(error = %err, "reconnect attempt failed");
        }
    });

    if let Some(previous) = lock(&inner.reconnect).replace(handle) {
        previous.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::testing::ScriptedConnector;

    fn settings(max_reconnect_attempts: u32) -> ConnectionSettings {
        ConnectionSettings {
            url: "ws://duel.test/socket".into(),
            connect_timeout: Duration::from_secs(10),
            reconnect_base_delay: Duration::from_millis(1_000),
            max_reconnect_attempts,
        }
    }

    fn refused() -> ConnectionError {
        ConnectionError::Transport("connection refused".into())
    }

    fn record_kinds(manager: &ConnectionManager) -> mpsc::UnboundedReceiver<EventKind> {
        let (tx, rx) = mpsc::unbounded_channel();
        for kind in EventKind::ALL {
            let tx = tx.clone();
            manager.on(kind, move |event| {
                let _ = tx.send(event.kind());
            });
        }
        rx
    }

    #[test]
    fn backoff_doubles_from_base() {
        let settings = settings(5);
        let delays: Vec<_> = (1..=4).map(|n| settings.backoff_delay(n).as_millis()).collect();
        assert_eq!(delays, vec![1_000, 2_000, 4_000, 8_000]);
    }

    #[tokio::test(start_paused = true)]
    async fn missing_token_fails_without_touching_the_connector() {
        let (connector, _sent) = ScriptedConnector::new(vec![], Ok(()));
        let manager = ConnectionManager::new(settings(5), connector.clone());

        assert_eq!(manager.connect(None).await, Err(ConnectionError::MissingToken));
        assert_eq!(connector.calls(), 0);
        assert!(!manager.state().connecting);
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_connects_share_one_attempt() {
        let (connector, _sent) = ScriptedConnector::new(vec![], Ok(()));
        let manager = ConnectionManager::new(settings(5), connector.clone());
        let other = manager.clone();

        let (first, second) = tokio::join!(
            manager.connect(Some("token".into())),
            other.connect(None)
        );
        assert_eq!(first, Ok(()));
        assert_eq!(second, Ok(()));
        assert_eq!(connector.calls(), 1);

        let state = manager.state();
        assert!(state.connected);
        assert_eq!(state.socket_id.as_deref(), Some("sock-1"));

        // Already connected: no new attempt.
        manager.connect(None).await.unwrap();
        assert_eq!(connector.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn reconnect_stops_at_the_cap() {
        let (connector, _sent) = ScriptedConnector::new(vec![], Err(refused()));
        let manager = ConnectionManager::new(settings(3), connector.clone());

        assert_eq!(
            manager.connect(Some("token".into())).await,
            Err(refused())
        );
        sleep(Duration::from_secs(60)).await;

        assert_eq!(connector.calls(), 4);
        let state = manager.state();
        assert_eq!(state.reconnect_attempts, 3);
        assert!(!state.connected);
        assert!(state.error.unwrap().contains("gave up"));

        sleep(Duration::from_secs(600)).await;
        assert_eq!(connector.calls(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn unauthorized_is_not_retried() {
        let (connector, _sent) = ScriptedConnector::new(
            vec![],
            Err(ConnectionError::Unauthorized("bad token".into())),
        );
        let manager = ConnectionManager::new(settings(5), connector.clone());

        assert!(matches!(
            manager.connect(Some("token".into())).await,
            Err(ConnectionError::Unauthorized(_))
        ));
        sleep(Duration::from_secs(60)).await;
        assert_eq!(connector.calls(), 1);
        assert_eq!(manager.state().reconnect_attempts, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn listeners_survive_reconnect() {
        let (connector, _sent) = ScriptedConnector::new(vec![], Ok(()));
        let manager = ConnectionManager::new(settings(5), connector.clone());
        let mut kinds = record_kinds(&manager);

        manager.connect(Some("token".into())).await.unwrap();
        assert_eq!(kinds.recv().await, Some(EventKind::Connect));

        connector.push(0, Some(Ok(r#"{"event":"both_players_connected"}"#.into())));
        assert_eq!(kinds.recv().await, Some(EventKind::BothPlayersConnected));

        connector.push(0, None);
        assert_eq!(kinds.recv().await, Some(EventKind::Disconnect));
        assert_eq!(manager.state().reconnect_attempts, 1);

        assert_eq!(kinds.recv().await, Some(EventKind::Connect));
        assert_eq!(connector.calls(), 2);
        let state = manager.state();
        assert!(state.connected);
        assert_eq!(state.reconnect_attempts, 0);
        assert_eq!(state.socket_id.as_deref(), Some("sock-2"));

        connector.push(1, Some(Ok(r#"{"event":"both_players_connected"}"#.into())));
        assert_eq!(kinds.recv().await, Some(EventKind::BothPlayersConnected));
    }

    #[tokio::test(start_paused = true)]
    async fn emit_writes_encoded_commands() {
        let (connector, mut sent) = ScriptedConnector::new(vec![], Ok(()));
        let manager = ConnectionManager::new(settings(5), connector);

        assert_eq!(
            manager.emit(&ClientCommand::ReadyForDuel {}),
            Err(ConnectionError::NotConnected)
        );

        manager.connect(Some("token".into())).await.unwrap();
        manager.emit(&ClientCommand::JoinDuelRoom { duel_id: 7 }).unwrap();
        assert_eq!(
            sent.recv().await.as_deref(),
            Some(r#"{"event":"join_duel_room","data":{"duelId":7}}"#)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn disconnect_resets_everything() {
        let (connector, _sent) = ScriptedConnector::new(vec![Err(refused())], Ok(()));
        let manager = ConnectionManager::new(settings(5), connector.clone());
        manager.on(EventKind::RoomJoined, |_| {});
        manager.on(EventKind::RoomJoined, |_| {});

        assert!(manager.connect(Some("token".into())).await.is_err());
        assert_eq!(manager.state().reconnect_attempts, 1);

        manager.disconnect();
        assert_eq!(manager.state(), ConnectionState::initial(5));
        assert_eq!(manager.listener_count(EventKind::RoomJoined), 0);

        // The scheduled reconnect was cancelled.
        sleep(Duration::from_secs(60)).await;
        assert_eq!(connector.calls(), 1);
        assert_eq!(
            manager.emit(&ClientCommand::LeaveDuelRoom {}),
            Err(ConnectionError::NotConnected)
        );

        // Idempotent.
        manager.disconnect();
        assert_eq!(manager.state(), ConnectionState::initial(5));
    }

    #[tokio::test(start_paused = true)]
    async fn off_without_id_removes_every_listener_of_a_kind() {
        let (connector, _sent) = ScriptedConnector::new(vec![], Ok(()));
        let manager = ConnectionManager::new(settings(5), connector);
        let id = manager.on(EventKind::TimerUpdate, |_| {});
        manager.on(EventKind::TimerUpdate, |_| {});
        manager.on(EventKind::DuelError, |_| {});

        manager.off(EventKind::TimerUpdate, Some(id));
        assert_eq!(manager.listener_count(EventKind::TimerUpdate), 1);
        manager.off(EventKind::TimerUpdate, None);
        assert_eq!(manager.listener_count(EventKind::TimerUpdate), 0);
        assert_eq!(manager.listener_count(EventKind::DuelError), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn connect_times_out() {
        let (connector, _sent) = ScriptedConnector::new(vec![], Ok(()));
        let mut settings = settings(0);
        settings.connect_timeout = Duration::from_millis(10);
        let manager = ConnectionManager::new(settings, connector);

        assert_eq!(
            manager.connect(Some("token".into())).await,
            Err(ConnectionError::Timeout)
        );
        assert!(manager.state().error.is_some());
    }
}
