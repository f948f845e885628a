use std::sync::Arc;

use serde::{Serialize, de::DeserializeOwned};
use tracing::warn;

use super::storage::{KeyValueStore, StorageResult};

const AUTH_TOKEN_KEY: &str = "auth_token";
const REFRESH_TOKEN_KEY: &str = "refresh_token";
const PREFERENCE_PREFIX: &str = "pref:";

/// Credentials issued by the backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredTokens {
    /// Bearer token attached to REST calls and the socket handshake.
    pub auth_token: String,
    /// Token exchanged for a new pair once the bearer token expires.
    pub refresh_token: Option<String>,
}

/// Typed view over a [`KeyValueStore`] holding credentials and cached preferences.
#[derive(Clone)]
pub struct TokenStore {
    backend: Arc<dyn KeyValueStore>,
}

impl TokenStore {
    /// Wrap a storage backend.
    pub fn new(backend: Arc<dyn KeyValueStore>) -> Self {
        Self { backend }
    }

    /// Current bearer token, if signed in.
    pub async fn auth_token(&self) -> StorageResult<Option<String>> {
        self.backend.get(AUTH_TOKEN_KEY).await
    }

    /// Current refresh token, if any.
    pub async fn refresh_token(&self) -> StorageResult<Option<String>> {
        self.backend.get(REFRESH_TOKEN_KEY).await
    }

    /// Persist a freshly issued credential pair. A missing refresh token removes the
    /// previously stored one.
    pub async fn store_tokens(&self, tokens: StoredTokens) -> StorageResult<()> {
        self.backend.set(AUTH_TOKEN_KEY, tokens.auth_token).await?;
        match tokens.refresh_token {
            Some(refresh) => self.backend.set(REFRESH_TOKEN_KEY, refresh).await,
            None => self.backend.remove(REFRESH_TOKEN_KEY).await,
        }
    }

    /// Forget both tokens.
    pub async fn clear_tokens(&self) -> StorageResult<()> {
        self.backend.remove(AUTH_TOKEN_KEY).await?;
        self.backend.remove(REFRESH_TOKEN_KEY).await
    }

    /// Read a cached preference. Entries that no longer decode into `T` are treated as
    /// absent.
    pub async fn preference<T>(&self, key: &str) -> StorageResult<Option<T>>
    where
        T: DeserializeOwned,
    {
        let raw = self
            .backend
            .get(&format!("{PREFERENCE_PREFIX}{key}"))
            .await?;
        Ok(raw.and_then(|raw| match serde_json::from_str(&raw) {
            Ok(value) => Some(value),
            Err(err) => {
                warn!(key, error = %err, "discarding undecodable preference");
                None
            }
        }))
    }

    /// Cache a preference.
    pub async fn set_preference<T>(&self, key: &str, value: &T) -> StorageResult<()>
    where
        T: Serialize + ?Sized,
    {
        let raw = serde_json::to_string(value).unwrap_or_else(|_| "null".into());
        self.backend
            .set(&format!("{PREFERENCE_PREFIX}{key}"), raw)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dao::storage::MemoryStore;

    fn store() -> TokenStore {
        TokenStore::new(Arc::new(MemoryStore::new()))
    }

    #[tokio::test]
    async fn tokens_round_trip_and_clear() {
        let tokens = store();
        assert_eq!(tokens.auth_token().await.unwrap(), None);

        tokens
            .store_tokens(StoredTokens {
                auth_token: "a1".into(),
                refresh_token: Some("r1".into()),
            })
            .await
            .unwrap();
        assert_eq!(tokens.auth_token().await.unwrap().as_deref(), Some("a1"));
        assert_eq!(tokens.refresh_token().await.unwrap().as_deref(), Some("r1"));

        tokens
            .store_tokens(StoredTokens {
                auth_token: "a2".into(),
                refresh_token: None,
            })
            .await
            .unwrap();
        assert_eq!(tokens.refresh_token().await.unwrap(), None);

        tokens.clear_tokens().await.unwrap();
        assert_eq!(tokens.auth_token().await.unwrap(), None);
    }

    #[tokio::test]
    async fn preferences_are_typed() {
        let tokens = store();
        tokens.set_preference("difficulty", "hard").await.unwrap();
        let value: Option<String> = tokens.preference("difficulty").await.unwrap();
        assert_eq!(value.as_deref(), Some("hard"));

        let mismatched: Option<u32> = tokens.preference("difficulty").await.unwrap();
        assert_eq!(mismatched, None);
    }
}
