//! REST collaborators of the duel screen: metadata lookups, bot matching, question
//! reports and result persistence.

use std::{sync::Arc, time::Duration};

use reqwest::{Client, Method, RequestBuilder, Response, StatusCode};
use serde::{Serialize, de::DeserializeOwned};
use tracing::{debug, info, warn};

use crate::{
    dao::token_store::{StoredTokens, TokenStore},
    dto::{
        api::{
            BotProfile, CourseSummary, DuelDetails, DuelResultRecord, RefreshRequest,
            RefreshResponse, ReportRequest, TestSummary,
        },
        commands::{BotDifficulty, BotTarget},
    },
    error::ApiError,
};

/// Endpoints for which a 401 is final: retrying them after a refresh would loop.
pub const NO_RETRY_AUTH_ENDPOINTS: [&str; 4] = [
    "/auth/login",
    "/auth/register",
    "/auth/refresh",
    "/auth/logout",
];

const REFRESH_PATH: &str = "/auth/refresh";
const LOGOUT_PATH: &str = "/auth/logout";

/// Authenticated REST client. Clones share the connection pool and the token store.
#[derive(Clone)]
pub struct ApiClient {
    client: Client,
    base_url: Arc<str>,
    tokens: TokenStore,
}

impl ApiClient {
    /// Build a client against `base_url`. Every request, including the token refresh,
    /// fails with [`ApiError::Request`] once `timeout` elapses.
    pub fn new(base_url: &str, tokens: TokenStore, timeout: Duration) -> Result<Self, ApiError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|source| ApiError::ClientBuilder { source })?;
        Ok(Self {
            client,
            base_url: Arc::from(base_url.trim_end_matches('/')),
            tokens,
        })
    }

    /// Credentials backing this client.
    pub fn tokens(&self) -> &TokenStore {
        &self.tokens
    }

    /// `GET /duels/{id}`.
    pub async fn get_duel(&self, duel_id: u64) -> Result<DuelDetails, ApiError> {
        self.get_json(&format!("/duels/{duel_id}"), &[]).await
    }

    /// `GET /courses/{id}`.
    pub async fn get_course(&self, course_id: u64) -> Result<CourseSummary, ApiError> {
        self.get_json(&format!("/courses/{course_id}"), &[]).await
    }

    /// `GET /tests/{id}`.
    pub async fn get_test(&self, test_id: u64) -> Result<TestSummary, ApiError> {
        self.get_json(&format!("/tests/{test_id}"), &[]).await
    }

    /// `GET /bots`: the bot that would be matched for `target` at `difficulty`.
    pub async fn find_bot(
        &self,
        target: BotTarget,
        difficulty: BotDifficulty,
    ) -> Result<BotProfile, ApiError> {
        let pool = match target {
            BotTarget::Test(id) => ("testId", id.to_string()),
            BotTarget::Course(id) => ("courseId", id.to_string()),
        };
        let query = [pool, ("difficulty", difficulty.as_str().to_string())];
        self.get_json("/bots", &query).await
    }

    /// `POST /reports`.
    pub async fn submit_report(&self, report: &ReportRequest) -> Result<(), ApiError> {
        self.post_json("/reports", report).await?;
        info!(question_id = report.question_id, reason = ?report.reason, "question reported");
        Ok(())
    }

    /// `POST /duels/{id}/results`.
    pub async fn save_duel_results(&self, record: &DuelResultRecord) -> Result<(), ApiError> {
        self.post_json(&format!("/duels/{}/results", record.duel_id), record)
            .await
    }

    /// `POST /auth/logout`, then forget the stored credentials whatever the outcome.
    pub async fn logout(&self) -> Result<(), ApiError> {
        let outcome = self.post_json(LOGOUT_PATH, &serde_json::json!({})).await;
        self.tokens.clear_tokens().await?;
        outcome
    }

    /// Exchange the refresh token for a new pair and return the new bearer token. Any
    /// failure clears the stored credentials and yields [`ApiError::SessionExpired`].
    pub async fn refresh(&self) -> Result<String, ApiError> {
        let Some(refresh_token) = self.tokens.refresh_token().await? else {
            return self.expire("no refresh token stored").await;
        };

        let response = self
            .client
            .post(self.url(REFRESH_PATH))
            .json(&RefreshRequest {
                refresh_token: refresh_token.clone(),
            })
            .send()
            .await;

        let refreshed = match response {
            Ok(response) if response.status().is_success() => {
                match response.json::<RefreshResponse>().await {
                    Ok(refreshed) => refreshed,
                    Err(err) => {
                        warn!(error = %err, "undecodable refresh response");
                        return self.expire("undecodable refresh response").await;
                    }
                }
            }
            Ok(response) => {
                warn!(status = %response.status(), "token refresh rejected");
                return self.expire("refresh rejected").await;
            }
            Err(err) => {
                warn!(error = %err, "token refresh failed");
                return self.expire("refresh failed").await;
            }
        };

        self.tokens
            .store_tokens(StoredTokens {
                auth_token: refreshed.token.clone(),
                refresh_token: refreshed.refresh_token.or(Some(refresh_token)),
            })
            .await?;
        debug!("access token refreshed");
        Ok(refreshed.token)
    }

    async fn expire<T>(&self, reason: &str) -> Result<T, ApiError> {
        warn!(reason, "session expired; clearing stored credentials");
        self.tokens.clear_tokens().await?;
        Err(ApiError::SessionExpired)
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn get_json<T>(&self, path: &str, query: &[(&str, String)]) -> Result<T, ApiError>
    where
        T: DeserializeOwned,
    {
        let response = self
            .execute(Method::GET, path, |builder| builder.query(query))
            .await?;
        match response.status() {
            status if status.is_success() => {
                response
                    .json::<T>()
                    .await
                    .map_err(|source| ApiError::Decode {
                        path: path.to_string(),
                        source,
                    })
            }
            other => Err(ApiError::Status {
                path: path.to_string(),
                status: other,
            }),
        }
    }

    async fn post_json<B>(&self, path: &str, body: &B) -> Result<(), ApiError>
    where
        B: ?Sized + Serialize,
    {
        let response = self
            .execute(Method::POST, path, |builder| builder.json(body))
            .await?;
        if response.status().is_success() {
            Ok(())
        } else {
            Err(ApiError::Status {
                path: path.to_string(),
                status: response.status(),
            })
        }
    }

    /// Send an authenticated request. A 401 triggers one refresh and one retry unless
    /// `path` is listed in [`NO_RETRY_AUTH_ENDPOINTS`].
    async fn execute<F>(&self, method: Method, path: &str, build: F) -> Result<Response, ApiError>
    where
        F: Fn(RequestBuilder) -> RequestBuilder,
    {
        let token = self
            .tokens
            .auth_token()
            .await?
            .ok_or(ApiError::MissingToken)?;
        let response = self.send_once(method.clone(), path, &token, &build).await?;

        if response.status() != StatusCode::UNAUTHORIZED || NO_RETRY_AUTH_ENDPOINTS.contains(&path)
        {
            return Ok(response);
        }

        debug!(path, "access token rejected; refreshing");
        let token = self.refresh().await?;
        self.send_once(method, path, &token, &build).await
    }

    async fn send_once<F>(
        &self,
        method: Method,
        path: &str,
        token: &str,
        build: &F,
    ) -> Result<Response, ApiError>
    where
        F: Fn(RequestBuilder) -> RequestBuilder,
    {
        let builder = self
            .client
            .request(method, self.url(path))
            .bearer_auth(token);
        build(builder)
            .send()
            .await
            .map_err(|source| ApiError::Request {
                path: path.to_string(),
                source,
            })
    }
}
