use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use base64::Engine;
use clap::{ArgAction, Args};

use crate::platform::github::DEFAULT_API_URL;
use crate::platform::kube::ClusterSettings;
use crate::platform::pipeline::PipelineConfig;
use crate::platform::registry::{ArtifactoryConfig, RegistryAuth};
use crate::platform::server::ServerConfig;
use crate::platform::session::{MIN_STATE_TTL, SessionSettings};
use crate::telemetry::LogConfig;

/// Runtime configuration for the control plane.
///
/// Every field is read from the environment variable of the same name and
/// can be overridden on the command line.
#[derive(Debug, Clone, Args)]
pub struct Config {
    // ── HTTP ──────────────────────────────────────────────────────────
    #[arg(long, env = "HTTP_PORT", default_value_t = 8000)]
    pub http_port: u16,

    #[arg(long, env = "CORS_ALLOW_ORIGIN", default_value = "http://localhost:3000")]
    pub cors_allow_origin: String,

    #[arg(long, env = "IS_PROD", default_value_t = false, action = ArgAction::Set)]
    pub is_prod: bool,

    // ── Storage ───────────────────────────────────────────────────────
    /// SQLite database file.
    #[arg(long, env = "DB_DSN", default_value = "treenq.db")]
    pub db_dsn: PathBuf,

    /// Extra `*.sql` migrations applied after the built-in schema.
    #[arg(long, env = "MIGRATIONS_DIR")]
    pub migrations_dir: Option<PathBuf>,

    // ── Registry and builder ──────────────────────────────────────────
    #[arg(long, env = "DOCKER_REGISTRY", default_value = "localhost:5000")]
    pub docker_registry: String,

    #[arg(long, env = "REGISTRY_TLS_VERIFY", default_value_t = true, action = ArgAction::Set)]
    pub registry_tls_verify: bool,

    /// Directory with the registry's CA certificates.
    #[arg(long, env = "REGISTRY_CERT")]
    pub registry_cert: Option<PathBuf>,

    #[arg(long, env = "REGISTRY_AUTH_TYPE", default_value = "none")]
    pub registry_auth_type: String,

    #[arg(long, env = "REGISTRY_AUTH_USERNAME", default_value = "")]
    pub registry_auth_username: String,

    #[arg(long, env = "REGISTRY_AUTH_PASSWORD", default_value = "", hide_env_values = true)]
    pub registry_auth_password: String,

    #[arg(long, env = "REGISTRY_AUTH_TOKEN", default_value = "", hide_env_values = true)]
    pub registry_auth_token: String,

    #[arg(long, env = "BUILDKIT_HOST", default_value = "tcp://localhost:1234")]
    pub buildkit_host: String,

    #[arg(long, env = "BUILDKIT_TLS_CA")]
    pub buildkit_tls_ca: Option<PathBuf>,

    // ── Cluster ───────────────────────────────────────────────────────
    /// Kubeconfig path; in-cluster or default config when unset.
    #[arg(long, env = "KUBE_CONFIG")]
    pub kube_config: Option<PathBuf>,

    #[arg(long, env = "INGRESS_HOST", default_value = "localhost")]
    pub ingress_host: String,

    #[arg(long, env = "CERT_ISSUER", default_value = "letsencrypt")]
    pub cert_issuer: String,

    // ── GitHub ────────────────────────────────────────────────────────
    /// OAuth client id; also the issuer of GitHub App tokens.
    #[arg(long, env = "GITHUB_CLIENT_ID", default_value = "")]
    pub github_client_id: String,

    #[arg(long, env = "GITHUB_SECRET", default_value = "", hide_env_values = true)]
    pub github_secret: String,

    /// GitHub App private key: PEM, a path to a PEM file, or base64 PEM.
    #[arg(long, env = "GITHUB_PRIVATE_KEY", default_value = "", hide_env_values = true)]
    pub github_private_key: String,

    #[arg(long, env = "GITHUB_WEBHOOK_SECRET", default_value = "", hide_env_values = true)]
    pub github_webhook_secret: String,

    #[arg(long, env = "GITHUB_WEBHOOK_SECRET_ENABLE", default_value_t = true, action = ArgAction::Set)]
    pub github_webhook_secret_enable: bool,

    #[arg(long, env = "GITHUB_API_URL", default_value = DEFAULT_API_URL)]
    pub github_api_url: String,

    /// OAuth callback registered with the GitHub App.
    #[arg(long, env = "GITHUB_REDIRECT_URL")]
    pub github_redirect_url: Option<String>,

    /// Base URL for OAuth and clones.
    #[arg(long, env = "GITHUB_CLONE_URL", default_value = "https://github.com")]
    pub github_clone_url: String,

    // ── Auth ──────────────────────────────────────────────────────────
    #[arg(long, env = "AUTH_PRIVATE_KEY", default_value = "", hide_env_values = true)]
    pub auth_private_key: String,

    #[arg(long, env = "AUTH_PUBLIC_KEY", default_value = "")]
    pub auth_public_key: String,

    /// Session token lifetime (`3600`, `60m`, `24h`).
    #[arg(long, env = "AUTH_TTL", default_value = "24h", value_parser = parse_duration)]
    pub auth_ttl: Duration,

    #[arg(long, env = "AUTH_REDIRECT_URL")]
    pub auth_redirect_url: Option<String>,

    /// OAuth state lifetime in seconds.
    #[arg(long, env = "AUTH_STATE_TTL", default_value_t = 90)]
    pub auth_state_ttl: u64,

    #[arg(long, env = "IDENTITY_SERVER_URL")]
    pub identity_server_url: Option<String>,

    #[arg(long, env = "IDENTITY_SERVER_TOKEN", default_value = "", hide_env_values = true)]
    pub identity_server_token: String,

    /// `name=idpId,...`
    #[arg(long, env = "IDENTITY_PROVIDERS", default_value = "")]
    pub identity_providers: String,

    // ── Pipeline ──────────────────────────────────────────────────────
    /// Clone root; defaults to `<cache dir>/treenq/repos`.
    #[arg(long, env = "CLONE_DIR")]
    pub clone_dir: Option<PathBuf>,

    /// Deployment run budget in seconds.
    #[arg(long, env = "DEPLOY_TIMEOUT", default_value_t = 300)]
    pub deploy_timeout: u64,

    #[arg(long, env = "DEPLOY_SUPERSEDE", default_value_t = true, action = ArgAction::Set)]
    pub deploy_supersede: bool,

    // ── Misc ──────────────────────────────────────────────────────────
    #[arg(long, env = "LOG_DIR")]
    pub log_dir: Option<PathBuf>,

    #[arg(long, env = "APP_VERSION", default_value = env!("CARGO_PKG_VERSION"))]
    pub app_version: String,
}

impl Config {
    /// Reject combinations the collaborators would fail on later.
    pub fn validate(&self) -> Result<()> {
        self.registry_auth()?;
        if self.auth_state_ttl < MIN_STATE_TTL.as_secs() {
            bail!(
                "AUTH_STATE_TTL must be at least {} seconds, got {}",
                MIN_STATE_TTL.as_secs(),
                self.auth_state_ttl
            );
        }
        if self.auth_ttl.is_zero() {
            bail!("AUTH_TTL must be positive");
        }
        if self.deploy_timeout == 0 {
            bail!("DEPLOY_TIMEOUT must be positive");
        }
        if self.github_webhook_secret_enable && self.github_webhook_secret.is_empty() {
            bail!("GITHUB_WEBHOOK_SECRET is required when GITHUB_WEBHOOK_SECRET_ENABLE is set");
        }
        if self.identity_server_url.is_some() {
            self.identity_providers()?;
        }
        Ok(())
    }

    pub fn registry_auth(&self) -> Result<RegistryAuth> {
        RegistryAuth::from_parts(
            &self.registry_auth_type,
            &self.registry_auth_username,
            &self.registry_auth_password,
            &self.registry_auth_token,
        )
    }

    pub fn identity_providers(&self) -> Result<std::collections::BTreeMap<String, String>> {
        crate::platform::session::IdentityServer::parse_providers(&self.identity_providers)
            .map_err(|e| anyhow::anyhow!(e))
    }

    pub fn server(&self) -> ServerConfig {
        ServerConfig {
            port: self.http_port,
            cors_allow_origin: self.cors_allow_origin.clone(),
        }
    }

    pub fn logging(&self) -> LogConfig {
        LogConfig {
            json: self.is_prod,
            dir: self.log_dir.clone(),
        }
    }

    pub fn artifactory(&self) -> Result<ArtifactoryConfig> {
        Ok(ArtifactoryConfig {
            registry: self.docker_registry.clone(),
            tls_verify: self.registry_tls_verify,
            cert_dir: self.registry_cert.clone(),
            auth: self.registry_auth()?,
            buildkit_host: self.buildkit_host.clone(),
            buildkit_tls_ca: self.buildkit_tls_ca.clone(),
        })
    }

    pub fn pipeline(&self) -> PipelineConfig {
        PipelineConfig {
            cluster: ClusterSettings {
                ingress_host: self.ingress_host.clone(),
                cert_issuer: self.cert_issuer.clone(),
            },
            deploy_timeout: Duration::from_secs(self.deploy_timeout),
            supersede: self.deploy_supersede,
        }
    }

    pub fn session(&self) -> SessionSettings {
        SessionSettings {
            state_ttl: Duration::from_secs(self.auth_state_ttl),
            redirect_url: self.auth_redirect_url.clone().filter(|u| !u.is_empty()),
            secure_cookies: self.is_prod,
        }
    }

    pub fn clone_root(&self) -> PathBuf {
        self.clone_dir.clone().unwrap_or_else(|| {
            dirs::cache_dir()
                .unwrap_or_else(std::env::temp_dir)
                .join("treenq")
                .join("repos")
        })
    }
}

/// Parse `90`, `45s`, `60m`, `24h` or `7d`.
pub fn parse_duration(value: &str) -> Result<Duration, String> {
    let value = value.trim();
    let split = value
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(value.len());
    let (digits, unit) = value.split_at(split);
    let n: u64 = digits
        .parse()
        .map_err(|_| format!("invalid duration '{}'", value))?;
    let secs = match unit {
        "" | "s" => n,
        "m" => n * 60,
        "h" => n * 3600,
        "d" => n * 86_400,
        _ => return Err(format!("invalid duration unit in '{}'", value)),
    };
    Ok(Duration::from_secs(secs))
}

/// Resolve a key given inline as PEM, as a path to a file, or base64-encoded.
pub fn load_key(value: &str) -> Result<String> {
    let value = value.trim();
    if value.is_empty() {
        bail!("key is empty");
    }
    if value.starts_with("-----BEGIN") {
        return Ok(value.to_string());
    }
    let path = Path::new(value);
    if path.is_file() {
        return std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read key file {}", path.display()));
    }
    let decoded = base64::engine::general_purpose::STANDARD
        .decode(value)
        .context("Key is neither PEM, a file, nor base64")?;
    String::from_utf8(decoded).context("Decoded key is not UTF-8")
}
