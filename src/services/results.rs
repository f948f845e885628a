use futures::future::BoxFuture;
use tracing::info;

use crate::{dto::api::DuelResultRecord, error::ApiError, services::api::ApiClient};

/// Destination of the end-of-duel summary.
pub trait ResultSink: Send + Sync {
    /// Persist or report `record`.
    fn record(&self, record: DuelResultRecord) -> BoxFuture<'static, Result<(), ApiError>>;
}

/// Persists results through the REST backend.
#[derive(Clone)]
pub struct ApiResultSink {
    api: ApiClient,
}

impl ApiResultSink {
    /// Wrap an API client.
    pub fn new(api: ApiClient) -> Self {
        Self { api }
    }
}

impl ResultSink for ApiResultSink {
    fn record(&self, record: DuelResultRecord) -> BoxFuture<'static, Result<(), ApiError>> {
        let api = self.api.clone();
        Box::pin(async move {
            api.save_duel_results(&record).await?;
            info!(duel_id = record.duel_id, "duel results saved");
            Ok(())
        })
    }
}

/// Emits the summary as a structured log line.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogResultSink;

impl ResultSink for LogResultSink {
    fn record(&self, record: DuelResultRecord) -> BoxFuture<'static, Result<(), ApiError>> {
        let correct = record.answers.iter().filter(|answer| answer.is_correct).count();
        info!(
            duel_id = record.duel_id,
            outcome = ?record.outcome,
            user_score = record.user_score,
            opponent_score = record.opponent_score,
            rounds = record.answers.len(),
            correct,
            average_time_ms = record.average_time_ms,
            completed_at = %record.completed_at,
            "duel summary"
        );
        Box::pin(async { Ok(()) })
    }
}
