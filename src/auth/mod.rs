//! OAuth token acquisition for the Graph API.
//!
//! Silent path first: a cached token bundle from the store's `sync_state`
//! table, renewed via the refresh grant when expired. Falls back to the
//! RFC 8628 device-code flow, which blocks until the user completes
//! authentication out of band. Any terminal failure here is fatal to the
//! run.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::time::sleep;
use tracing::warn;

use crate::config::SyncConfig;
use crate::store::{Store, StoreError};

const SCOPES: &str = "User.Read Mail.Read offline_access";
const TOKEN_CACHE_KEY: &str = "graph_token";
const CACHE_SKEW_SECONDS: i64 = 60;

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("token endpoint transport error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("oauth error {error}: {description}")]
    OAuth { error: String, description: String },

    #[error("user declined the device-code authorization")]
    Declined,

    #[error("device code expired before authorization completed")]
    Expired,

    #[error("token cache: {0}")]
    Cache(#[from] StoreError),

    #[error("decode token response: {0}")]
    Decode(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct CachedToken {
    access_token: String,
    refresh_token: Option<String>,
    expires_at: DateTime<Utc>,
}

impl CachedToken {
    fn is_expired(&self) -> bool {
        self.expires_at <= Utc::now()
    }
}

#[derive(Debug, Clone, Deserialize)]
struct TokenResponse {
    access_token: String,
    refresh_token: Option<String>,
    expires_in: u64,
}

impl TokenResponse {
    fn into_cached(self) -> CachedToken {
        let expires_at = Utc::now()
            + chrono::Duration::seconds((self.expires_in as i64).saturating_sub(CACHE_SKEW_SECONDS));
        CachedToken {
            access_token: self.access_token,
            refresh_token: self.refresh_token,
            expires_at,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
struct DeviceAuthorization {
    device_code: String,
    user_code: String,
    verification_uri: String,
    expires_in: u32,
    #[serde(default = "default_interval")]
    interval: u32,
    message: Option<String>,
}

const fn default_interval() -> u32 {
    5
}

#[derive(Debug, Clone, Deserialize)]
struct OAuthErrorResponse {
    error: String,
    #[serde(default)]
    error_description: String,
}

#[derive(Debug, Clone)]
pub struct TokenProvider {
    client: reqwest::Client,
    client_id: String,
    authority: String,
}

impl TokenProvider {
    pub fn new(config: &SyncConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            client_id: config.client_id.clone(),
            authority: config.authority.trim_end_matches('/').to_string(),
        }
    }

    /// Silent acquisition against the cached bundle, then the interactive
    /// device-code grant.
    pub async fn acquire(&self, store: &Store) -> Result<String, AuthError> {
        if let Some(cached) = self.cached_token(store)? {
            if !cached.is_expired() {
                return Ok(cached.access_token);
            }
            if let Some(refresh_token) = cached.refresh_token.as_deref() {
                match self.refresh(refresh_token).await {
                    Ok(renewed) => {
                        self.store_token(store, &renewed)?;
                        return Ok(renewed.access_token);
                    }
                    Err(error) => {
                        warn!("silent token refresh failed, falling back to device code: {error}");
                        store.clear_sync_state(TOKEN_CACHE_KEY)?;
                    }
                }
            }
        }

        let token = self.device_code_flow().await?;
        self.store_token(store, &token)?;
        Ok(token.access_token)
    }

    fn cached_token(&self, store: &Store) -> Result<Option<CachedToken>, AuthError> {
        let Some(state) = store.get_sync_state(TOKEN_CACHE_KEY)? else {
            return Ok(None);
        };
        let Some(raw) = state.value else {
            return Ok(None);
        };

        match serde_json::from_str::<CachedToken>(&raw) {
            Ok(token) => Ok(Some(token)),
            Err(error) => {
                warn!("discarding unreadable token cache entry: {error}");
                store.clear_sync_state(TOKEN_CACHE_KEY)?;
                Ok(None)
            }
        }
    }

    fn store_token(&self, store: &Store, token: &CachedToken) -> Result<(), AuthError> {
        let value = serde_json::to_string(token)?;
        store.set_sync_state(TOKEN_CACHE_KEY, &value)?;
        Ok(())
    }

    async fn refresh(&self, refresh_token: &str) -> Result<CachedToken, AuthError> {
        let response = self
            .client
            .post(self.token_url())
            .form(&[
                ("client_id", self.client_id.as_str()),
                ("grant_type", "refresh_token"),
                ("refresh_token", refresh_token),
                ("scope", SCOPES),
            ])
            .send()
            .await?;

        if !response.status().is_success() {
            let error: OAuthErrorResponse = response.json().await?;
            return Err(AuthError::OAuth {
                error: error.error,
                description: error.error_description,
            });
        }

        let payload: TokenResponse = response.json().await?;
        Ok(payload.into_cached())
    }

    async fn device_code_flow(&self) -> Result<CachedToken, AuthError> {
        let auth = self.request_device_authorization().await?;

        // The server's own message carries localized instructions; fall
        // back to a plain rendering of uri + code.
        match auth.message.as_deref() {
            Some(message) => eprintln!("{message}"),
            None => eprintln!(
                "To sign in, visit {} and enter the code {}",
                auth.verification_uri, auth.user_code
            ),
        }

        let mut interval = Duration::from_secs(u64::from(auth.interval));
        let deadline = Utc::now() + chrono::Duration::seconds(i64::from(auth.expires_in));

        loop {
            if Utc::now() >= deadline {
                return Err(AuthError::Expired);
            }
            sleep(interval).await;

            match self.poll_device_token(&auth.device_code).await {
                Ok(token) => return Ok(token),
                Err(AuthError::OAuth { ref error, .. }) if error == "authorization_pending" => {}
                Err(AuthError::OAuth { ref error, .. }) if error == "slow_down" => {
                    interval += Duration::from_secs(5);
                }
                Err(error) => return Err(error),
            }
        }
    }

    async fn request_device_authorization(&self) -> Result<DeviceAuthorization, AuthError> {
        let url = format!("{}/oauth2/v2.0/devicecode", self.authority);
        let response = self
            .client
            .post(&url)
            .form(&[("client_id", self.client_id.as_str()), ("scope", SCOPES)])
            .send()
            .await?;

        if !response.status().is_success() {
            let error: OAuthErrorResponse = response.json().await?;
            return Err(AuthError::OAuth {
                error: error.error,
                description: error.error_description,
            });
        }

        Ok(response.json().await?)
    }

    async fn poll_device_token(&self, device_code: &str) -> Result<CachedToken, AuthError> {
        let response = self
            .client
            .post(self.token_url())
            .form(&[
                ("client_id", self.client_id.as_str()),
                ("grant_type", "urn:ietf:params:oauth:grant-type:device_code"),
                ("device_code", device_code),
            ])
            .send()
            .await?;

        if !response.status().is_success() {
            let error: OAuthErrorResponse = response.json().await?;
            return match error.error.as_str() {
                "access_denied" => Err(AuthError::Declined),
                "expired_token" => Err(AuthError::Expired),
                _ => Err(AuthError::OAuth {
                    error: error.error,
                    description: error.error_description,
                }),
            };
        }

        let payload: TokenResponse = response.json().await?;
        Ok(payload.into_cached())
    }

    fn token_url(&self) -> String {
        format!("{}/oauth2/v2.0/token", self.authority)
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use chrono::{Duration, Utc};
    use uuid::Uuid;

    use super::{CachedToken, DeviceAuthorization, TokenProvider, TokenResponse, TOKEN_CACHE_KEY};
    use crate::config::SyncConfig;
    use crate::store::Store;

    fn temp_db_path() -> PathBuf {
        std::env::temp_dir().join(format!("mts-auth-test-{}.db", Uuid::new_v4()))
    }

    fn config() -> SyncConfig {
        SyncConfig {
            client_id: "client-1".to_string(),
            authority: "https://login.microsoftonline.com/consumers/".to_string(),
            target_email: None,
            flagged_only: false,
            db_path: temp_db_path(),
            graph_api_base: "https://graph.example.test/v1.0".to_string(),
            cloudinary: None,
        }
    }

    #[test]
    fn authority_trailing_slash_is_normalized() {
        let provider = TokenProvider::new(&config());
        assert_eq!(
            provider.token_url(),
            "https://login.microsoftonline.com/consumers/oauth2/v2.0/token"
        );
    }

    #[test]
    fn device_authorization_deserializes_with_default_interval() {
        let auth: DeviceAuthorization = serde_json::from_str(
            r#"{
                "device_code": "dev123",
                "user_code": "ABC-DEF",
                "verification_uri": "https://microsoft.com/devicelogin",
                "expires_in": 900
            }"#,
        )
        .expect("decode device authorization");
        assert_eq!(auth.device_code, "dev123");
        assert_eq!(auth.user_code, "ABC-DEF");
        assert_eq!(auth.interval, 5);
        assert!(auth.message.is_none());
    }

    #[test]
    fn token_response_expiry_is_skewed_early() {
        let response: TokenResponse = serde_json::from_str(
            r#"{"access_token":"abc","refresh_token":"r1","expires_in":3600}"#,
        )
        .expect("decode token response");
        let cached = response.into_cached();
        assert_eq!(cached.access_token, "abc");
        assert_eq!(cached.refresh_token.as_deref(), Some("r1"));
        assert!(cached.expires_at <= Utc::now() + Duration::seconds(3600 - 60));
        assert!(!cached.is_expired());
    }

    #[test]
    fn cached_token_roundtrip_in_sync_state() {
        let provider = TokenProvider::new(&config());
        let path = temp_db_path();
        let store = Store::open(&path).expect("open store");

        let token = CachedToken {
            access_token: "cached-token".to_string(),
            refresh_token: Some("refresh-1".to_string()),
            expires_at: Utc::now() + Duration::minutes(10),
        };
        provider.store_token(&store, &token).expect("store token");

        let loaded = provider
            .cached_token(&store)
            .expect("load token")
            .expect("token exists");
        assert_eq!(loaded.access_token, "cached-token");
        assert_eq!(loaded.refresh_token.as_deref(), Some("refresh-1"));

        let _ = std::fs::remove_file(path);
    }

    #[test]
    fn unreadable_cache_entry_is_discarded() {
        let provider = TokenProvider::new(&config());
        let path = temp_db_path();
        let store = Store::open(&path).expect("open store");

        store
            .set_sync_state(TOKEN_CACHE_KEY, "not json")
            .expect("seed bad cache entry");

        assert!(provider
            .cached_token(&store)
            .expect("load token")
            .is_none());
        assert!(store
            .get_sync_state(TOKEN_CACHE_KEY)
            .expect("read state")
            .is_none());

        let _ = std::fs::remove_file(path);
    }
}
