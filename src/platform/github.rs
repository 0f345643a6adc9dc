//! GitHub App client (installation tokens, repositories, branches, manifest
//! lookup) and the GitHub OAuth provider used by the session bridge.

use std::time::{Duration, Instant};

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use jsonwebtoken::{Algorithm, EncodingKey, Header};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};

use super::extract::{MANIFEST_FILES, decode_manifest};
use super::models::{InstalledRepository, UserInfo};
use super::space::Space;
use crate::errors::{AuthError, SourceError};

pub const DEFAULT_API_URL: &str = "https://api.github.com";
pub const DEFAULT_OAUTH_URL: &str = "https://github.com";

pub(crate) const USER_AGENT: &str = "treenq";
const API_VERSION: &str = "2022-11-28";
const ACCEPT_JSON: &str = "application/vnd.github+json";
const ACCEPT_RAW: &str = "application/vnd.github.raw+json";

/// Installation tokens are dropped this long before GitHub expires them.
const TOKEN_EXPIRY_MARGIN_SECS: i64 = 20;
const BRANCH_CACHE_TTL: Duration = Duration::from_secs(10 * 60);
/// A `fresh` branch listing still reuses entries younger than this.
const BRANCH_FRESH_WINDOW: Duration = Duration::from_secs(60);
pub(crate) const HTTP_TIMEOUT: Duration = Duration::from_secs(10);

/// The VCS operations the control plane needs, in terms of installation ids.
#[async_trait]
pub trait VcsClient: Send + Sync {
    async fn issue_access_token(&self, installation_id: i64) -> Result<String, SourceError>;

    async fn get_user_accessible_installations(
        &self,
        user_token: &str,
    ) -> Result<Vec<i64>, SourceError>;

    async fn list_repositories(
        &self,
        installation_id: i64,
    ) -> Result<Vec<InstalledRepository>, SourceError>;

    async fn get_branches(
        &self,
        installation_id: i64,
        full_name: &str,
        fresh: bool,
    ) -> Result<Vec<String>, SourceError>;

    async fn get_repo_space(
        &self,
        installation_id: i64,
        full_name: &str,
        git_ref: &str,
    ) -> Result<Space, SourceError>;
}

fn transport(err: reqwest::Error) -> SourceError {
    SourceError::Transport(err.to_string())
}

pub(crate) fn http_client() -> anyhow::Result<reqwest::Client> {
    reqwest::Client::builder()
        .user_agent(USER_AGENT)
        .timeout(HTTP_TIMEOUT)
        .build()
        .context("Failed to build HTTP client")
}

/// Turn a non-success response into a `SourceError`; 5xx counts as transport.
async fn check_status(resp: reqwest::Response, what: &str) -> Result<reqwest::Response, SourceError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let body = resp.text().await.unwrap_or_default();
    let message = format!("GitHub {} responded with {}: {}", what, status, body);
    if status.is_server_error() {
        Err(SourceError::Transport(message))
    } else if status == StatusCode::UNAUTHORIZED {
        Err(SourceError::TokenRejected(message))
    } else {
        Err(anyhow::anyhow!(message).into())
    }
}

// ── GitHub App client ─────────────────────────────────────────────────

#[derive(Debug, Clone)]
struct CachedToken {
    token: String,
    expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
struct CachedBranches {
    branches: Vec<String>,
    saved_at: Instant,
}

pub struct GithubClient {
    http: reqwest::Client,
    api_url: String,
    app_id: String,
    private_key: EncodingKey,
    tokens: DashMap<i64, CachedToken>,
    branches: DashMap<String, CachedBranches>,
}

impl GithubClient {
    pub fn new(api_url: &str, app_id: &str, private_key_pem: &str) -> anyhow::Result<Self> {
        let private_key = EncodingKey::from_rsa_pem(private_key_pem.as_bytes())
            .context("Invalid GitHub App private key")?;
        Ok(Self {
            http: http_client()?,
            api_url: api_url.trim_end_matches('/').to_string(),
            app_id: app_id.to_string(),
            private_key,
            tokens: DashMap::new(),
            branches: DashMap::new(),
        })
    }

    /// App JWT used to mint installation tokens.
    fn app_jwt(&self) -> Result<String, SourceError> {
        #[derive(Serialize)]
        struct AppClaims<'a> {
            iat: i64,
            exp: i64,
            iss: &'a str,
        }

        let now = Utc::now().timestamp();
        let claims = AppClaims {
            // GitHub tolerates clock drift only backwards.
            iat: now - 60,
            exp: now + 600,
            iss: &self.app_id,
        };
        jsonwebtoken::encode(&Header::new(Algorithm::RS256), &claims, &self.private_key)
            .context("Failed to sign GitHub App JWT")
            .map_err(SourceError::from)
    }

    fn get(&self, path: &str, token: &str) -> reqwest::RequestBuilder {
        self.get_as(path, token, ACCEPT_JSON)
    }

    fn get_as(&self, path: &str, token: &str, accept: &str) -> reqwest::RequestBuilder {
        self.http
            .get(format!("{}{}", self.api_url, path))
            .bearer_auth(token)
            .header("Accept", accept)
            .header("X-GitHub-Api-Version", API_VERSION)
    }
}

#[async_trait]
impl VcsClient for GithubClient {
    async fn issue_access_token(&self, installation_id: i64) -> Result<String, SourceError> {
        if let Some(cached) = self.tokens.get(&installation_id)
            && cached.expires_at - chrono::Duration::seconds(TOKEN_EXPIRY_MARGIN_SECS) > Utc::now()
        {
            return Ok(cached.token.clone());
        }

        #[derive(Deserialize)]
        struct AccessTokenResponse {
            token: String,
            expires_at: DateTime<Utc>,
        }

        let jwt = self.app_jwt()?;
        let resp = self
            .http
            .post(format!(
                "{}/app/installations/{}/access_tokens",
                self.api_url, installation_id
            ))
            .bearer_auth(jwt)
            .header("Accept", ACCEPT_JSON)
            .header("X-GitHub-Api-Version", API_VERSION)
            .send()
            .await
            .map_err(transport)?;
        let resp = check_status(resp, "access token").await?;
        let payload: AccessTokenResponse = resp
            .json()
            .await
            .context("Failed to parse access token response")?;

        tracing::debug!(installation_id, expires_at = %payload.expires_at, "issued installation token");
        self.tokens.insert(
            installation_id,
            CachedToken {
                token: payload.token.clone(),
                expires_at: payload.expires_at,
            },
        );
        Ok(payload.token)
    }

    async fn get_user_accessible_installations(
        &self,
        user_token: &str,
    ) -> Result<Vec<i64>, SourceError> {
        #[derive(Deserialize)]
        struct InstallationRef {
            id: i64,
        }
        #[derive(Deserialize)]
        struct InstallationsResponse {
            installations: Vec<InstallationRef>,
        }

        let resp = self
            .get("/user/installations", user_token)
            .send()
            .await
            .map_err(transport)?;
        let resp = check_status(resp, "user installations").await?;
        let payload: InstallationsResponse = resp
            .json()
            .await
            .context("Failed to parse user installations response")?;
        Ok(payload.installations.into_iter().map(|i| i.id).collect())
    }

    async fn list_repositories(
        &self,
        installation_id: i64,
    ) -> Result<Vec<InstalledRepository>, SourceError> {
        #[derive(Deserialize)]
        struct RepositoriesResponse {
            total_count: usize,
            repositories: Vec<InstalledRepository>,
        }

        let token = self.issue_access_token(installation_id).await?;
        let mut repos = Vec::new();
        let mut page = 1u32;
        loop {
            let resp = self
                .get("/installation/repositories", &token)
                .query(&[("per_page", "100"), ("page", &page.to_string())])
                .send()
                .await
                .map_err(transport)?;
            let resp = check_status(resp, "installation repositories").await?;
            let payload: RepositoriesResponse = resp
                .json()
                .await
                .context("Failed to parse repositories response")?;
            let count = payload.repositories.len();
            repos.extend(payload.repositories);
            if count < 100 || repos.len() >= payload.total_count {
                break;
            }
            page += 1;
        }
        Ok(repos)
    }

    async fn get_branches(
        &self,
        installation_id: i64,
        full_name: &str,
        fresh: bool,
    ) -> Result<Vec<String>, SourceError> {
        if let Some(cached) = self.branches.get(full_name) {
            let age = cached.saved_at.elapsed();
            let usable = if fresh {
                age < BRANCH_FRESH_WINDOW
            } else {
                age < BRANCH_CACHE_TTL
            };
            if usable {
                return Ok(cached.branches.clone());
            }
        }

        #[derive(Deserialize)]
        struct Branch {
            name: String,
        }

        let token = self.issue_access_token(installation_id).await?;
        let resp = self
            .get(&format!("/repos/{}/branches", full_name), &token)
            .query(&[("per_page", "100")])
            .send()
            .await
            .map_err(transport)?;
        let resp = check_status(resp, "branches").await?;
        let branches: Vec<Branch> = resp
            .json()
            .await
            .context("Failed to parse branches response")?;
        let names: Vec<String> = branches.into_iter().map(|b| b.name).collect();

        self.branches.insert(
            full_name.to_string(),
            CachedBranches {
                branches: names.clone(),
                saved_at: Instant::now(),
            },
        );
        Ok(names)
    }

    async fn get_repo_space(
        &self,
        installation_id: i64,
        full_name: &str,
        git_ref: &str,
    ) -> Result<Space, SourceError> {
        let token = self.issue_access_token(installation_id).await?;
        for name in MANIFEST_FILES {
            let resp = self
                .get_as(
                    &format!("/repos/{}/contents/{}", full_name, name),
                    &token,
                    ACCEPT_RAW,
                )
                .query(&[("ref", git_ref)])
                .send()
                .await
                .map_err(transport)?;
            if resp.status() == StatusCode::NOT_FOUND {
                continue;
            }
            let resp = check_status(resp, "contents").await?;
            let content = resp.text().await.map_err(transport)?;
            return decode_manifest(name, &content);
        }
        Err(SourceError::NoTqJsonFound)
    }
}

// ── OAuth ─────────────────────────────────────────────────────────────

/// Tokens returned by an OAuth code exchange.
#[derive(Debug, Clone, PartialEq)]
pub struct ProviderToken {
    pub access_token: String,
    pub refresh_token: String,
}

#[async_trait]
pub trait OauthProvider: Send + Sync {
    /// Provider URL the browser is sent to, carrying `state`.
    fn authorize_url(&self, state: &str) -> String;

    async fn exchange_code(&self, code: &str) -> Result<ProviderToken, AuthError>;

    /// Identity of the token's owner; `id` is left empty for the store to assign.
    async fn fetch_user(&self, access_token: &str) -> Result<UserInfo, AuthError>;
}

pub struct GithubOauth {
    http: reqwest::Client,
    client_id: String,
    client_secret: String,
    redirect_url: Option<String>,
    oauth_url: String,
    api_url: String,
}

impl GithubOauth {
    pub const SCOPES: &'static str = "read:user user:email";

    pub fn new(
        client_id: &str,
        client_secret: &str,
        redirect_url: Option<String>,
        oauth_url: &str,
        api_url: &str,
    ) -> anyhow::Result<Self> {
        Ok(Self {
            http: http_client()?,
            client_id: client_id.to_string(),
            client_secret: client_secret.to_string(),
            redirect_url,
            oauth_url: oauth_url.trim_end_matches('/').to_string(),
            api_url: api_url.trim_end_matches('/').to_string(),
        })
    }

    async fn primary_email(&self, access_token: &str) -> Result<String, AuthError> {
        #[derive(Deserialize)]
        struct Email {
            email: String,
            primary: bool,
            verified: bool,
        }

        let emails: Vec<Email> = self
            .http
            .get(format!("{}/user/emails", self.api_url))
            .bearer_auth(access_token)
            .header("Accept", ACCEPT_JSON)
            .send()
            .await
            .context("Failed to request GitHub emails")?
            .error_for_status()
            .context("GitHub emails API returned error status")?
            .json()
            .await
            .context("Failed to parse GitHub emails")?;
        emails
            .into_iter()
            .find(|e| e.primary && e.verified)
            .map(|e| e.email)
            .ok_or_else(|| AuthError::Forbidden("no verified primary email".into()))
    }
}

#[async_trait]
impl OauthProvider for GithubOauth {
    fn authorize_url(&self, state: &str) -> String {
        let mut url = format!(
            "{}/login/oauth/authorize?client_id={}&scope={}&state={}",
            self.oauth_url,
            urlencoding::encode(&self.client_id),
            urlencoding::encode(Self::SCOPES),
            urlencoding::encode(state),
        );
        if let Some(redirect) = &self.redirect_url {
            url.push_str(&format!("&redirect_uri={}", urlencoding::encode(redirect)));
        }
        url
    }

    async fn exchange_code(&self, code: &str) -> Result<ProviderToken, AuthError> {
        #[derive(Deserialize)]
        struct TokenResponse {
            access_token: Option<String>,
            refresh_token: Option<String>,
            error: Option<String>,
            error_description: Option<String>,
        }

        let resp: TokenResponse = self
            .http
            .post(format!("{}/login/oauth/access_token", self.oauth_url))
            .header("Accept", "application/json")
            .form(&[
                ("client_id", self.client_id.as_str()),
                ("client_secret", self.client_secret.as_str()),
                ("code", code),
            ])
            .send()
            .await
            .context("Failed to send token request to GitHub")?
            .error_for_status()
            .context("GitHub token endpoint returned error status")?
            .json()
            .await
            .context("Failed to parse token response from GitHub")?;

        match (resp.access_token, resp.error) {
            (Some(access_token), _) => Ok(ProviderToken {
                access_token,
                refresh_token: resp.refresh_token.unwrap_or_default(),
            }),
            (None, Some(error)) => Err(AuthError::Unauthorized(format!(
                "{}: {}",
                error,
                resp.error_description.unwrap_or_default()
            ))),
            (None, None) => Err(anyhow::anyhow!("Unexpected response from GitHub").into()),
        }
    }

    async fn fetch_user(&self, access_token: &str) -> Result<UserInfo, AuthError> {
        #[derive(Deserialize)]
        struct GithubUser {
            login: String,
            email: Option<String>,
        }

        let resp = self
            .http
            .get(format!("{}/user", self.api_url))
            .bearer_auth(access_token)
            .header("Accept", ACCEPT_JSON)
            .send()
            .await
            .context("Failed to request GitHub user")?;
        if resp.status() == StatusCode::UNAUTHORIZED {
            return Err(AuthError::Unauthorized("github token rejected".into()));
        }
        let user: GithubUser = resp
            .error_for_status()
            .context("GitHub user API returned error status")?
            .json()
            .await
            .context("Failed to parse GitHub user")?;

        let email = match user.email.filter(|e| !e.is_empty()) {
            Some(email) => email,
            None => self.primary_email(access_token).await?,
        };
        Ok(UserInfo {
            id: String::new(),
            email,
            display_name: user.login,
            current_workspace: String::new(),
        })
    }
}
