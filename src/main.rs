//! Command-line runner: joins a duel (or challenges a bot), answers every question and
//! logs the outcome.

use std::{env, sync::Arc, time::Duration};

use anyhow::{Context, Result, anyhow, bail};
use rand::{Rng, seq::IndexedRandom};
use tokio::time::{Instant, sleep_until};
use tokio_stream::StreamExt;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use duel_client::{
    clock::SystemClock,
    config::ClientConfig,
    dao::{
        storage::FileStore,
        token_store::{StoredTokens, TokenStore},
    },
    dto::commands::{BotDifficulty, BotTarget},
    services::{
        api::ApiClient,
        connection::ConnectionManager,
        results::{ApiResultSink, LogResultSink, ResultSink},
        session::{DuelSession, SessionEntry, SessionSettings},
    },
    state::{DuelPhase, DuelSettings},
};

const USER_ID_PREFERENCE: &str = "user_id";

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let config = ClientConfig::load();
    let tokens = TokenStore::new(Arc::new(FileStore::new(config.storage_path.clone())));
    seed_tokens(&tokens).await?;

    let token = tokens
        .auth_token()
        .await
        .context("failed to read stored credentials")?
        .ok_or_else(|| anyhow!("no auth token stored; set DUEL_AUTH_TOKEN"))?;
    let user_id = resolve_user_id(&tokens).await?;
    let api = ApiClient::new(&config.api_base_url, tokens.clone(), config.request_timeout)
        .context("failed to build REST client")?;

    let entry = entry_from_env()?;
    describe_entry(&api, entry).await;

    let mut duel = DuelSettings::new(user_id);
    if let SessionEntry::Join(duel_id) = entry {
        duel = duel.with_duel_id(duel_id);
    }
    let settings = SessionSettings::from_config(&config, duel).with_entry(entry);
    let sinks: Vec<Arc<dyn ResultSink>> = vec![
        Arc::new(ApiResultSink::new(api.clone())),
        Arc::new(LogResultSink),
    ];
    let session = DuelSession::start(
        ConnectionManager::websocket(&config),
        settings,
        Arc::new(SystemClock),
        sinks,
    );

    session
        .connect(Some(token))
        .await
        .context("failed to connect to the duel server")?;
    info!(user_id, socket_url = %config.socket_url, "connected");

    let outcome = play(&session).await;
    session.close().await;
    outcome
}

/// Answer questions with a random letter after a short think time until the duel ends.
async fn play(session: &DuelSession) -> Result<()> {
    let mut updates = session.updates();
    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);

    let mut ready_sent = false;
    let mut answered_index = None;
    let mut pending: Option<(Instant, Vec<String>)> = None;

    loop {
        let deadline = pending.as_ref().map(|(at, _)| *at);
        let think = async move {
            match deadline {
                Some(at) => sleep_until(at).await,
                None => std::future::pending().await,
            }
        };

        tokio::select! {
            _ = &mut shutdown => {
                info!("interrupted, leaving the duel");
                if let Err(err) = session.leave() {
                    warn!(error = %err, "failed to leave the room");
                }
                return Ok(());
            }
            _ = think => {
                let letter = pending
                    .take()
                    .and_then(|(_, letters)| letters.choose(&mut rand::rng()).cloned());
                if let Some(letter) = letter {
                    match session.select_answer(&letter).await {
                        Ok(()) => info!(%letter, "answer submitted"),
                        Err(err) => warn!(error = %err, "answer refused"),
                    }
                }
            }
            update = updates.next() => {
                let Some(snapshot) = update else {
                    bail!("session stopped unexpectedly");
                };

                if snapshot.both_connected && !ready_sent && snapshot.phase == DuelPhase::Lobby {
                    session.ready().context("failed to signal readiness")?;
                    ready_sent = true;
                }

                if snapshot.phase == DuelPhase::Question
                    && !snapshot.answered
                    && snapshot.question_index != answered_index
                {
                    answered_index = snapshot.question_index;
                    if let Some(question) = &snapshot.question {
                        let think = Duration::from_millis(rand::rng().random_range(800..4_000));
                        let letters = question.options().keys().cloned().collect();
                        pending = Some((Instant::now() + think, letters));
                        info!(index = ?snapshot.question_index, text = question.text(), "question");
                    }
                }
                if snapshot.answered {
                    pending = None;
                }

                match snapshot.phase {
                    DuelPhase::Final => {
                        info!(
                            outcome = ?snapshot.outcome,
                            user_score = snapshot.user_score,
                            opponent_score = snapshot.opponent_score,
                            "duel finished"
                        );
                        return Ok(());
                    }
                    DuelPhase::Error => {
                        let reason = snapshot.error.unwrap_or_else(|| "unknown error".into());
                        bail!("duel failed: {reason}");
                    }
                    _ => {}
                }
            }
        }
    }
}

/// Store credentials passed through the environment, replacing whatever was cached.
async fn seed_tokens(tokens: &TokenStore) -> Result<()> {
    let Ok(auth_token) = env::var("DUEL_AUTH_TOKEN") else {
        return Ok(());
    };
    tokens
        .store_tokens(StoredTokens {
            auth_token,
            refresh_token: env::var("DUEL_REFRESH_TOKEN").ok(),
        })
        .await
        .context("failed to store credentials")
}

/// `DUEL_USER_ID` wins and is cached; otherwise the cached value is used.
async fn resolve_user_id(tokens: &TokenStore) -> Result<u64> {
    if let Ok(raw) = env::var("DUEL_USER_ID") {
        let user_id: u64 = raw
            .parse()
            .with_context(|| format!("DUEL_USER_ID `{raw}` is not a number"))?;
        if let Err(err) = tokens.set_preference(USER_ID_PREFERENCE, &user_id).await {
            warn!(error = %err, "failed to cache the user id");
        }
        return Ok(user_id);
    }
    tokens
        .preference::<u64>(USER_ID_PREFERENCE)
        .await
        .context("failed to read the cached user id")?
        .ok_or_else(|| anyhow!("no user id known; set DUEL_USER_ID"))
}

fn entry_from_env() -> Result<SessionEntry> {
    if let Some(duel_id) = env_id("DUEL_ID")? {
        return Ok(SessionEntry::Join(duel_id));
    }

    let target = match (env_id("CHALLENGE_TEST_ID")?, env_id("CHALLENGE_COURSE_ID")?) {
        (Some(test_id), _) => BotTarget::Test(test_id),
        (None, Some(course_id)) => BotTarget::Course(course_id),
        (None, None) => {
            bail!("set DUEL_ID, or CHALLENGE_TEST_ID / CHALLENGE_COURSE_ID for a bot duel")
        }
    };
    let difficulty = match env::var("CHALLENGE_DIFFICULTY") {
        Ok(raw) => raw
            .parse::<BotDifficulty>()
            .map_err(|err| anyhow!(err))
            .context("invalid CHALLENGE_DIFFICULTY")?,
        Err(_) => BotDifficulty::Medium,
    };
    Ok(SessionEntry::Challenge { target, difficulty })
}

fn env_id(name: &str) -> Result<Option<u64>> {
    match env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .with_context(|| format!("{name} `{raw}` is not a number")),
        Err(_) => Ok(None),
    }
}

/// Log what is about to be played. Lookup failures are not fatal.
async fn describe_entry(api: &ApiClient, entry: SessionEntry) {
    match entry {
        SessionEntry::Join(duel_id) => match api.get_duel(duel_id).await {
            Ok(details) => info!(
                duel_id,
                status = ?details.status,
                participants = details.participants.len(),
                "joining duel"
            ),
            Err(err) => warn!(duel_id, error = %err, "could not load duel details"),
        },
        SessionEntry::Challenge { target, difficulty } => {
            let title = match target {
                BotTarget::Test(id) => api.get_test(id).await.map(|test| test.title),
                BotTarget::Course(id) => api.get_course(id).await.map(|course| course.title),
            };
            match title {
                Ok(title) => info!(%title, %difficulty, "challenging a bot"),
                Err(err) => warn!(error = %err, "could not load the question pool"),
            }
            match api.find_bot(target, difficulty).await {
                Ok(bot) => info!(bot = %bot.username, "bot opponent"),
                Err(err) => warn!(error = %err, "no bot preview available"),
            }
        }
    }
}

fn init_tracing() {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| "info,duel_client=debug".into());

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {},
                    _ = sigterm.recv() => {},
                }
                return;
            }
            Err(err) => warn!(error = %err, "failed to install SIGTERM handler"),
        }
    }

    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!(error = %err, "failed to listen for ctrl-c");
        std::future::pending::<()>().await;
    }
}
