//! Typed error hierarchy for the Treenq control plane.
//!
//! One enum per collaborator boundary:
//! - `StoreError`: persistence lookups and state transitions
//! - `SourceError`: VCS API, git checkout and manifest extraction
//! - `RegistryError`: image inspect/build/push
//! - `ClusterError`: manifest apply, secrets, logs and stats
//! - `AuthError`: JWT issuing/verification, webhook signatures, OAuth
//!
//! Every enum keeps an `Other(#[from] anyhow::Error)` variant for failures
//! that carry no domain meaning beyond their message.

use thiserror::Error;

/// Errors from the `Store` port.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("user not found")]
    UserNotFound,

    #[error("workspace not found")]
    WorkspaceNotFound,

    #[error("repo not found")]
    RepoNotFound,

    #[error("installation not found")]
    InstallationNotFound,

    #[error("deployment not found")]
    DeploymentNotFound,

    #[error("deployment {id} is already {status}, cannot move to {next}")]
    InvalidTransition {
        id: String,
        status: String,
        next: String,
    },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Errors from the VCS client, git fetcher and manifest extractor.
#[derive(Debug, Error)]
pub enum SourceError {
    #[error("no git checkout specified: one of branch, sha or tag is required")]
    NoGitCheckoutSpecified,

    #[error("git branch, sha and tag are mutually exclusive")]
    GitBranchAndShaMutuallyExclusive,

    #[error("tq.json not found")]
    NoTqJsonFound,

    #[error("tq.json contains invalid json: {0}")]
    TqIsNotValidJson(String),

    #[error("invalid space: {0}")]
    InvalidSpace(String),

    #[error("vcs rejected the token: {0}")]
    TokenRejected(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl SourceError {
    /// Network-level failures that an idempotent caller may retry.
    pub fn is_transport(&self) -> bool {
        matches!(self, Self::Transport(_))
    }
}

/// Errors from the image builder and registry.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("image not found")]
    ImageNotFound,

    #[error("build failed: {0}")]
    BuildFailed(String),

    #[error("build cancelled")]
    Cancelled,

    #[error("transport error: {0}")]
    Transport(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl RegistryError {
    pub fn is_transport(&self) -> bool {
        matches!(self, Self::Transport(_))
    }
}

/// Errors from the cluster applier.
#[derive(Debug, Error)]
pub enum ClusterError {
    #[error("secret not found")]
    SecretNotFound,

    #[error("no pods running")]
    NoPodsRunning,

    #[error("invalid manifest: {0}")]
    InvalidManifest(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Errors from identity, session and signature handling.
#[derive(Debug, Error)]
pub enum AuthError {
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("invalid signature")]
    InvalidSignature,

    #[error("identity provider {0} not found")]
    ProviderNotFound(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl AuthError {
    /// Upper-snake code used in the RPC error envelope.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Unauthorized(_) => "UNAUTHORIZED",
            Self::Forbidden(_) => "FORBIDDEN",
            Self::InvalidSignature => "INVALID_SIGNATURE",
            Self::ProviderNotFound(_) => "PROVIDER_NOT_FOUND",
            Self::Other(_) => "UNKNOWN",
        }
    }
}
