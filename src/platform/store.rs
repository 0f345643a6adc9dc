//! The `Store` port: persistence for users, workspaces, installations,
//! repositories, deployments, secret keys and session state.
//!
//! Secret values never pass through here; the store only records which keys
//! exist for a repository.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::models::{
    AppDeployment, DeploymentHistoryItem, Installation, InstalledRepository, Repository, UserInfo,
    Workspace,
};
use crate::errors::StoreError;

#[async_trait]
pub trait Store: Send + Sync {
    // ── Users & workspaces ────────────────────────────────────────────

    /// Upsert by email. A new user gets a workspace of their own, and
    /// installations already owned by their login are attached to it.
    async fn get_or_create_user(&self, user: UserInfo) -> Result<UserInfo, StoreError>;

    async fn get_user(&self, user_id: &str) -> Result<UserInfo, StoreError>;

    async fn get_workspace(&self, workspace_id: &str) -> Result<Workspace, StoreError>;

    // ── Installations & repositories ──────────────────────────────────

    /// Upsert the installation and replace its repository set with `repos`.
    async fn link_github(
        &self,
        installation_id: i64,
        owner: &str,
        repos: Vec<InstalledRepository>,
    ) -> Result<Installation, StoreError>;

    /// Add `repos` to the installation, creating it when unknown.
    async fn save_github_repos(
        &self,
        installation_id: i64,
        owner: &str,
        repos: Vec<InstalledRepository>,
    ) -> Result<Vec<Repository>, StoreError>;

    async fn remove_github_repos(
        &self,
        installation_id: i64,
        repos: Vec<InstalledRepository>,
    ) -> Result<(), StoreError>;

    /// Delete the installation with its repositories; returns what was removed.
    async fn remove_installation(&self, installation_id: i64)
    -> Result<Vec<Repository>, StoreError>;

    async fn get_installation(&self, installation_id: i64) -> Result<Installation, StoreError>;

    /// Repositories visible to the user through installations of their workspace.
    async fn get_github_repos(&self, user_id: &str) -> Result<Vec<Repository>, StoreError>;

    async fn get_repo_by_id(&self, user_id: &str, repo_id: &str)
    -> Result<Repository, StoreError>;

    async fn get_repo_by_vcs_id(&self, vcs_id: i64) -> Result<Repository, StoreError>;

    async fn connect_repo(
        &self,
        user_id: &str,
        repo_id: &str,
        branch: &str,
    ) -> Result<Repository, StoreError>;

    async fn get_installation_id(
        &self,
        workspace_id: &str,
        repo_full_name: &str,
    ) -> Result<i64, StoreError>;

    // ── Deployments ───────────────────────────────────────────────────

    /// Insert a new row; the store assigns id and timestamps.
    async fn save_deployment(&self, deployment: AppDeployment)
    -> Result<AppDeployment, StoreError>;

    /// Compare-and-update: fails with `InvalidTransition` when the stored
    /// status cannot move to `deployment.status`.
    async fn update_deployment(
        &self,
        deployment: &AppDeployment,
    ) -> Result<AppDeployment, StoreError>;

    async fn get_deployment(&self, deployment_id: &str) -> Result<AppDeployment, StoreError>;

    /// Latest first.
    async fn get_deployments(&self, repo_id: &str) -> Result<Vec<AppDeployment>, StoreError>;

    /// Latest first, `init` rows excluded.
    async fn get_deployment_history(
        &self,
        repo_id: &str,
    ) -> Result<Vec<DeploymentHistoryItem>, StoreError>;

    /// Mark every other non-terminal deployment of the repo `failed
    /// ("superseded")` in one transaction. Returns the affected ids.
    async fn supersede_deployments(
        &self,
        repo_id: &str,
        keep_id: &str,
    ) -> Result<Vec<String>, StoreError>;

    /// Mark `done` deployments created after `source_id` as `rolledBack`,
    /// except `keep_id`. Returns the number of rows changed.
    async fn mark_rolled_back(
        &self,
        repo_id: &str,
        source_id: &str,
        keep_id: &str,
    ) -> Result<usize, StoreError>;

    // ── Secret keys ───────────────────────────────────────────────────

    async fn save_secret(
        &self,
        workspace_id: &str,
        repo_id: &str,
        key: &str,
    ) -> Result<(), StoreError>;

    async fn remove_secret(
        &self,
        workspace_id: &str,
        repo_id: &str,
        key: &str,
    ) -> Result<(), StoreError>;

    async fn repository_secret_key_exists(
        &self,
        workspace_id: &str,
        repo_id: &str,
        key: &str,
    ) -> Result<bool, StoreError>;

    async fn get_repository_secret_keys(
        &self,
        workspace_id: &str,
        repo_id: &str,
    ) -> Result<Vec<String>, StoreError>;

    // ── Session state ─────────────────────────────────────────────────

    async fn save_auth_state(
        &self,
        state: &str,
        expires_at: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    /// Consume a state; returns its expiry, `None` when unknown.
    async fn take_auth_state(&self, state: &str) -> Result<Option<DateTime<Utc>>, StoreError>;

    async fn save_token_pair(
        &self,
        user_id: &str,
        access_token: &str,
        refresh_token: &str,
    ) -> Result<(), StoreError>;

    /// `(access_token, refresh_token)` of the user's provider session.
    async fn get_token_pair(&self, user_id: &str)
    -> Result<Option<(String, String)>, StoreError>;

    async fn delete_token_pair(&self, user_id: &str) -> Result<(), StoreError>;
}
