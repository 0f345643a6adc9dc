//! Browser sessions: the GitHub OAuth round trip, identity-server login and
//! the cookies that carry state and bearer token.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use axum::http::{HeaderMap, header};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::json;
use utoipa::ToSchema;

use super::github::{OauthProvider, http_client};
use super::jwt::{Claims, JwtIssuer};
use super::rpc::RpcError;
use super::store::Store;
use crate::errors::AuthError;

pub const AUTH_COOKIE: &str = "authToken";
pub const STATE_COOKIE: &str = "authstate";

/// Shortest accepted lifetime of an OAuth state.
pub const MIN_STATE_TTL: Duration = Duration::from_secs(60);

/// Value of cookie `name` across every `Cookie` header.
pub fn read_cookie(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(k, _)| *k == name)
        .map(|(_, v)| v.to_string())
        .filter(|v| !v.is_empty())
}

#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub state_ttl: Duration,
    /// Where the browser lands after a successful callback. Without it the
    /// callback answers with the token as JSON.
    pub redirect_url: Option<String>,
    pub secure_cookies: bool,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            state_ttl: Duration::from_secs(90),
            redirect_url: None,
            secure_cookies: false,
        }
    }
}

// ── Cookies ───────────────────────────────────────────────────────────

fn cookie(name: &str, value: &str, max_age: Duration, secure: bool) -> String {
    let mut c = format!(
        "{}={}; Path=/; HttpOnly; SameSite=Lax; Max-Age={}",
        name,
        value,
        max_age.as_secs()
    );
    if secure {
        c.push_str("; Secure");
    }
    c
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct AuthCallbackQuery {
    #[serde(default)]
    pub code: String,
    #[serde(default)]
    pub state: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct AccessTokenResponse {
    pub access_token: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct LoginQuery {
    #[serde(default)]
    pub provider: String,
}

// ── Identity server ───────────────────────────────────────────────────

/// External identity server that brokers logins through other IdPs.
pub struct IdentityServer {
    http: reqwest::Client,
    url: String,
    token: String,
    /// Provider name to IdP id.
    providers: BTreeMap<String, String>,
    return_url: String,
}

impl IdentityServer {
    pub fn new(
        url: &str,
        token: &str,
        providers: BTreeMap<String, String>,
        return_url: &str,
    ) -> anyhow::Result<Self> {
        Ok(Self {
            http: http_client()?,
            url: url.trim_end_matches('/').to_string(),
            token: token.to_string(),
            providers,
            return_url: return_url.to_string(),
        })
    }

    /// Parse `name=idpId,name2=idpId2`.
    pub fn parse_providers(spec: &str) -> Result<BTreeMap<String, String>, String> {
        spec.split(',')
            .map(str::trim)
            .filter(|entry| !entry.is_empty())
            .map(|entry| match entry.split_once('=') {
                Some((name, id)) if !name.trim().is_empty() && !id.trim().is_empty() => {
                    Ok((name.trim().to_string(), id.trim().to_string()))
                }
                _ => Err(format!("invalid identity provider entry '{}'", entry)),
            })
            .collect()
    }

    /// Start an IdP intent and return the URL the browser should visit.
    pub async fn create_intent(&self, provider: &str) -> Result<String, AuthError> {
        let idp_id = self
            .providers
            .get(provider)
            .ok_or_else(|| AuthError::ProviderNotFound(provider.to_string()))?;

        #[derive(Deserialize)]
        #[serde(rename_all = "camelCase")]
        struct IntentResponse {
            auth_url: String,
        }

        let body = json!({
            "idpId": idp_id,
            "urls": {
                "successUrl": self.return_url,
                "failureUrl": self.return_url,
            },
        });
        let resp = self
            .http
            .post(format!("{}/v2/idp_intents", self.url))
            .bearer_auth(&self.token)
            .json(&body)
            .send()
            .await
            .map_err(|e| AuthError::Other(anyhow::anyhow!("identity server unreachable: {}", e)))?;
        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(AuthError::Other(anyhow::anyhow!(
                "identity server returned {}: {}",
                status,
                text
            )));
        }
        let intent: IntentResponse = resp
            .json()
            .await
            .map_err(|e| AuthError::Other(anyhow::anyhow!("invalid intent response: {}", e)))?;
        Ok(intent.auth_url)
    }
}

// ── Session service ───────────────────────────────────────────────────

pub struct Session {
    store: Arc<dyn Store>,
    oauth: Arc<dyn OauthProvider>,
    jwt: Arc<JwtIssuer>,
    identity: Option<IdentityServer>,
    settings: SessionSettings,
}

/// Result of a completed OAuth callback.
#[derive(Debug, Clone)]
pub struct SignedIn {
    pub user_id: String,
    pub token: String,
}

impl Session {
    pub fn new(
        store: Arc<dyn Store>,
        oauth: Arc<dyn OauthProvider>,
        jwt: Arc<JwtIssuer>,
        identity: Option<IdentityServer>,
        settings: SessionSettings,
    ) -> Self {
        Self {
            store,
            oauth,
            jwt,
            identity,
            settings,
        }
    }

    pub fn settings(&self) -> &SessionSettings {
        &self.settings
    }

    /// Record a fresh state; returns it with the provider URL to visit.
    pub async fn begin(&self) -> Result<(String, String), RpcError> {
        let state = uuid::Uuid::new_v4().to_string();
        let ttl = chrono::Duration::from_std(self.settings.state_ttl)
            .map_err(|e| RpcError::internal("UNKNOWN", "invalid state ttl", e))?;
        self.store
            .save_auth_state(&state, Utc::now() + ttl)
            .await?;
        let url = self.oauth.authorize_url(&state);
        Ok((state, url))
    }

    /// Check the callback state against the cookie and the store, then
    /// exchange the code and sign the caller in.
    pub async fn complete(
        &self,
        cookie_state: Option<String>,
        query: &AuthCallbackQuery,
    ) -> Result<SignedIn, RpcError> {
        let Some(cookie_state) = cookie_state else {
            return Err(RpcError::new("COOKIE_IS_EMPTY", "auth state cookie is missing"));
        };
        if query.state.is_empty() || cookie_state != query.state {
            return Err(RpcError::new(
                "STATE_DOESNT_MATCH",
                "auth state does not match the cookie",
            ));
        }
        match self.store.take_auth_state(&query.state).await? {
            None => {
                return Err(RpcError::new(
                    "STATE_DOESNT_MATCH",
                    "auth state is unknown or already used",
                ));
            }
            Some(expires_at) if expires_at < Utc::now() => {
                return Err(RpcError::new("STATE_EXPIRED", "auth state expired"));
            }
            Some(_) => {}
        }
        if query.code.is_empty() {
            return Err(RpcError::new("FAILED_DECODING", "code is required"));
        }

        let token = self.oauth.exchange_code(&query.code).await?;
        let profile = self.oauth.fetch_user(&token.access_token).await?;
        let user = self.store.get_or_create_user(profile).await?;
        self.store
            .save_token_pair(&user.id, &token.access_token, &token.refresh_token)
            .await?;

        let mut claims = Claims::new();
        claims.insert("id".into(), user.id.clone().into());
        claims.insert("email".into(), user.email.clone().into());
        claims.insert("displayName".into(), user.display_name.clone().into());
        let jwt = self.jwt.issue(claims)?;
        tracing::info!(user_id = %user.id, "user signed in");
        Ok(SignedIn {
            user_id: user.id,
            token: jwt,
        })
    }

    pub async fn login_url(&self, provider: &str) -> Result<String, RpcError> {
        let identity = self
            .identity
            .as_ref()
            .ok_or_else(|| AuthError::ProviderNotFound(provider.to_string()))?;
        Ok(identity.create_intent(provider).await?)
    }

    pub async fn logout(&self, user_id: &str) -> Result<(), RpcError> {
        if !user_id.is_empty() {
            self.store.delete_token_pair(user_id).await?;
        }
        tracing::info!(user_id, "user signed out");
        Ok(())
    }

    pub fn state_cookie(&self, state: &str) -> String {
        cookie(STATE_COOKIE, state, self.settings.state_ttl, self.settings.secure_cookies)
    }

    pub fn clear_state_cookie(&self) -> String {
        cookie(STATE_COOKIE, "", Duration::ZERO, self.settings.secure_cookies)
    }

    pub fn auth_cookie(&self, token: &str) -> String {
        cookie(AUTH_COOKIE, token, self.jwt.ttl(), self.settings.secure_cookies)
    }

    pub fn clear_auth_cookie(&self) -> String {
        cookie(AUTH_COOKIE, "", Duration::ZERO, self.settings.secure_cookies)
    }
}
