//! OAuth2 client-credentials token cache for `sse`/`http` transports (§4.1, §9).
//!
//! Keyed by server id, refreshed when within 60s of expiry. A single
//! `DashMap` entry per server means refreshes for distinct servers never
//! contend.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Deserialize;
use uuid::Uuid;

use crate::error::{Error, Result};

const EXPIRY_SKEW: chrono::Duration = chrono::Duration::seconds(60);

#[derive(Debug, Clone)]
struct CachedToken {
    access_token: String,
    expires_at: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: i64,
}

/// Client-credentials OAuth2 descriptor for a server.
#[derive(Debug, Clone)]
pub struct OAuth2Client {
    pub token_url: String,
    pub client_id: String,
    pub client_secret: String,
    pub scope: Option<String>,
}

/// Per-server-id OAuth2 token cache.
#[derive(Default)]
pub struct OAuthTokenCache {
    tokens: DashMap<Uuid, CachedToken>,
    http: reqwest::Client,
}

impl OAuthTokenCache {
    pub fn new() -> Self {
        Self { tokens: DashMap::new(), http: reqwest::Client::new() }
    }

    /// Return a valid bearer token for `server_id`, fetching/refreshing via
    /// the client-credentials grant when missing or within 60s of expiry.
    pub async fn token_for(&self, server_id: Uuid, client: &OAuth2Client) -> Result<String> {
        if let Some(cached) = self.tokens.get(&server_id) {
            if cached.expires_at - Utc::now() > EXPIRY_SKEW {
                return Ok(cached.access_token.clone());
            }
        }

        let fetched = self.fetch_token(client).await?;
        self.tokens.insert(server_id, fetched.clone());
        Ok(fetched.access_token)
    }

    async fn fetch_token(&self, client: &OAuth2Client) -> Result<CachedToken> {
        let mut form = vec![
            ("grant_type", "client_credentials"),
            ("client_id", client.client_id.as_str()),
            ("client_secret", client.client_secret.as_str()),
        ];
        if let Some(scope) = &client.scope {
            form.push(("scope", scope.as_str()));
        }

        let response = tokio::time::timeout(
            Duration::from_secs(10),
            self.http.post(&client.token_url).form(&form).send(),
        )
        .await
        .map_err(|_| Error::Timeout("oauth2 token fetch timed out".into()))?
        .map_err(|e| Error::Upstream(format!("oauth2 token fetch failed: {e}")))?;

        if !response.status().is_success() {
            return Err(Error::Upstream(format!("oauth2 token endpoint returned {}", response.status())));
        }

        let body: TokenResponse = response
            .json()
            .await
            .map_err(|e| Error::Upstream(format!("invalid oauth2 token response: {e}")))?;

        Ok(CachedToken {
            access_token: body.access_token,
            expires_at: Utc::now() + chrono::Duration::seconds(body.expires_in),
        })
    }

    pub fn remove(&self, server_id: Uuid) {
        self.tokens.remove(&server_id);
    }
}

pub type SharedOAuthCache = Arc<OAuthTokenCache>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cache_starts_empty() {
        let cache = OAuthTokenCache::new();
        assert!(cache.tokens.get(&Uuid::now_v7()).is_none());
    }
}
