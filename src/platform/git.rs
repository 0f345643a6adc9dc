//! Fetches a repository revision into a working tree with libgit2.

use std::path::{Path, PathBuf};

use anyhow::Context;
use async_trait::async_trait;
use git2::{FetchOptions, Oid, Repository as GitRepository, build::CheckoutBuilder};
use uuid::Uuid;

use super::models::Repository;
use crate::errors::SourceError;

/// The single revision a clone resolves to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Checkout {
    Branch(String),
    Sha(String),
    Tag(String),
}

impl Checkout {
    /// Exactly one of `branch`, `sha`, `tag` must be non-empty.
    pub fn from_parts(branch: &str, sha: &str, tag: &str) -> Result<Self, SourceError> {
        let set = [branch, sha, tag].iter().filter(|v| !v.is_empty()).count();
        match set {
            0 => Err(SourceError::NoGitCheckoutSpecified),
            1 if !branch.is_empty() => Ok(Self::Branch(branch.to_string())),
            1 if !sha.is_empty() => Ok(Self::Sha(sha.to_string())),
            1 => Ok(Self::Tag(tag.to_string())),
            _ => Err(SourceError::GitBranchAndShaMutuallyExclusive),
        }
    }

    pub fn branch(&self) -> &str {
        match self {
            Self::Branch(b) => b,
            _ => "",
        }
    }

    pub fn tag(&self) -> &str {
        match self {
            Self::Tag(t) => t,
            _ => "",
        }
    }
}

impl std::fmt::Display for Checkout {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Branch(b) => write!(f, "branch {}", b),
            Self::Sha(s) => write!(f, "sha {}", s),
            Self::Tag(t) => write!(f, "tag {}", t),
        }
    }
}

/// A checked-out working tree.
#[derive(Debug, Clone, PartialEq)]
pub struct GitRepo {
    pub dir: PathBuf,
    pub sha: String,
    pub message: String,
}

#[async_trait]
pub trait Git: Send + Sync {
    /// Clone `repo` at `checkout` into a fresh directory under the clone
    /// root. The caller owns the directory and removes it after the run.
    async fn fetch(
        &self,
        repo: &Repository,
        access_token: &str,
        checkout: &Checkout,
    ) -> Result<GitRepo, SourceError>;
}

pub struct Git2Fetcher {
    root: PathBuf,
    clone_base_url: String,
}

impl Git2Fetcher {
    pub fn new(root: impl Into<PathBuf>, clone_base_url: &str) -> Self {
        Self {
            root: root.into(),
            clone_base_url: clone_base_url.trim_end_matches('/').to_string(),
        }
    }

    fn clone_url(&self, full_name: &str, access_token: &str) -> String {
        let url = format!("{}/{}.git", self.clone_base_url, full_name);
        if access_token.is_empty() {
            return url;
        }
        match url.split_once("://") {
            Some((scheme, rest)) if scheme.starts_with("http") => {
                format!("{}://x-access-token:{}@{}", scheme, access_token, rest)
            }
            _ => url,
        }
    }
}

#[async_trait]
impl Git for Git2Fetcher {
    async fn fetch(
        &self,
        repo: &Repository,
        access_token: &str,
        checkout: &Checkout,
    ) -> Result<GitRepo, SourceError> {
        let url = self.clone_url(&repo.full_name, access_token);
        let dir = self
            .root
            .join(format!("{}-{}", repo.id, Uuid::new_v4().simple()));
        let checkout = checkout.clone();
        tracing::info!(repo = %repo.full_name, %checkout, dir = %dir.display(), "fetching source");

        let target = dir.clone();
        let result = tokio::task::spawn_blocking(move || fetch_and_checkout(&url, &target, &checkout))
            .await
            .context("git task panicked")?;
        if result.is_err() {
            let _ = tokio::fs::remove_dir_all(&dir).await;
        }
        result
    }
}

fn git_error(err: git2::Error, what: &str) -> SourceError {
    match err.class() {
        git2::ErrorClass::Net | git2::ErrorClass::Http | git2::ErrorClass::Ssl => {
            SourceError::Transport(format!("{}: {}", what, err.message()))
        }
        _ => anyhow::anyhow!("{}: {}", what, err.message()).into(),
    }
}

fn fetch_and_checkout(url: &str, dir: &Path, checkout: &Checkout) -> Result<GitRepo, SourceError> {
    std::fs::create_dir_all(dir).with_context(|| format!("failed to create {}", dir.display()))?;
    let repo =
        GitRepository::init(dir).map_err(|e| git_error(e, "failed to init clone directory"))?;

    let mut remote = repo
        .remote_anonymous(url)
        .map_err(|e| git_error(e, "invalid clone url"))?;
    let mut opts = FetchOptions::new();
    opts.download_tags(git2::AutotagOption::All);
    remote
        .fetch(
            &[
                "+refs/heads/*:refs/remotes/origin/*",
                "+refs/tags/*:refs/tags/*",
            ],
            Some(&mut opts),
            None,
        )
        .map_err(|e| git_error(e, "failed to fetch"))?;

    let object = match checkout {
        Checkout::Branch(b) => repo.revparse_single(&format!("refs/remotes/origin/{}", b)),
        Checkout::Tag(t) => repo.revparse_single(&format!("refs/tags/{}", t)),
        Checkout::Sha(s) => match Oid::from_str(s) {
            Ok(oid) if s.len() == 40 => repo.find_object(oid, None),
            _ => repo.revparse_single(s),
        },
    }
    .map_err(|e| git_error(e, &format!("{} not found", checkout)))?;
    let commit = object
        .peel_to_commit()
        .map_err(|e| git_error(e, &format!("{} is not a commit", checkout)))?;

    repo.checkout_tree(commit.as_object(), Some(CheckoutBuilder::new().force()))
        .map_err(|e| git_error(e, "failed to check out tree"))?;
    repo.set_head_detached(commit.id())
        .map_err(|e| git_error(e, "failed to move HEAD"))?;

    Ok(GitRepo {
        dir: dir.to_path_buf(),
        sha: commit.id().to_string(),
        message: commit.message().unwrap_or_default().trim().to_string(),
    })
}
