//! GitHub App webhook handling.
//!
//! `plan` turns a payload into the action it asks for without touching any
//! collaborator; `WebhookDispatcher::dispatch` carries the action out.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use super::git::Checkout;
use super::kube::ClusterApplier;
use super::models::{DeploymentStatus, InstalledRepository};
use super::pipeline::{DeployRequest, DeploySource, DeploymentPipeline, RepoScope};
use super::rpc::RpcError;
use super::store::Store;
use crate::errors::StoreError;

/// Branches a push deploys from when the repository has no connected branch.
const DEFAULT_DEPLOY_BRANCHES: [&str; 2] = ["main", "master"];

// ── Payload ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize, Deserialize, ToSchema)]
#[serde(default)]
pub struct WebhookPayload {
    /// Head commit after a push.
    pub after: String,
    pub installation: PayloadInstallation,
    pub sender: Sender,
    pub action: String,
    pub repositories: Vec<InstalledRepository>,
    pub repositories_added: Vec<InstalledRepository>,
    pub repositories_removed: Vec<InstalledRepository>,
    #[serde(rename = "ref")]
    pub git_ref: String,
    pub repository: Option<PushedRepository>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, ToSchema)]
#[serde(default)]
pub struct PayloadInstallation {
    pub id: i64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, ToSchema)]
#[serde(default)]
pub struct Sender {
    pub login: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, ToSchema)]
#[serde(default)]
pub struct PushedRepository {
    pub id: i64,
    pub full_name: String,
}

// ── Planning ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub enum WebhookPlan {
    Link {
        installation_id: i64,
        owner: String,
        repos: Vec<InstalledRepository>,
    },
    AddRepos {
        installation_id: i64,
        owner: String,
        repos: Vec<InstalledRepository>,
    },
    RemoveRepos {
        installation_id: i64,
        repos: Vec<InstalledRepository>,
    },
    DeleteInstallation {
        installation_id: i64,
        repos: Vec<InstalledRepository>,
    },
    Push {
        vcs_repo_id: i64,
        branch: String,
        sha: String,
        sender: String,
    },
    Ignore,
}

pub fn plan(payload: &WebhookPayload) -> WebhookPlan {
    let installation_id = payload.installation.id;
    match payload.action.as_str() {
        "created" => WebhookPlan::Link {
            installation_id,
            owner: payload.sender.login.clone(),
            repos: payload.repositories.clone(),
        },
        "added" => WebhookPlan::AddRepos {
            installation_id,
            owner: payload.sender.login.clone(),
            repos: payload.repositories_added.clone(),
        },
        "removed" => WebhookPlan::RemoveRepos {
            installation_id,
            repos: payload.repositories_removed.clone(),
        },
        "deleted" => WebhookPlan::DeleteInstallation {
            installation_id,
            repos: payload.repositories.clone(),
        },
        "" => match (payload.git_ref.strip_prefix("refs/heads/"), &payload.repository) {
            // An all-zero head is a deleted branch; there is nothing to build.
            _ if is_zero_sha(&payload.after) => WebhookPlan::Ignore,
            (Some(branch), Some(repo)) if !branch.is_empty() => WebhookPlan::Push {
                vcs_repo_id: repo.id,
                branch: branch.to_string(),
                sha: payload.after.clone(),
                sender: payload.sender.login.clone(),
            },
            _ => WebhookPlan::Ignore,
        },
        _ => WebhookPlan::Ignore,
    }
}

fn is_zero_sha(sha: &str) -> bool {
    !sha.is_empty() && sha.bytes().all(|b| b == b'0')
}

// ── Dispatch ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct WebhookOutcome {
    /// Deployments started by this event.
    pub deployment_ids: Vec<String>,
}

pub struct WebhookDispatcher {
    store: Arc<dyn Store>,
    cluster: Arc<dyn ClusterApplier>,
    pipeline: Arc<DeploymentPipeline>,
}

impl WebhookDispatcher {
    pub fn new(
        store: Arc<dyn Store>,
        cluster: Arc<dyn ClusterApplier>,
        pipeline: Arc<DeploymentPipeline>,
    ) -> Self {
        Self {
            store,
            cluster,
            pipeline,
        }
    }

    pub async fn dispatch(&self, payload: &WebhookPayload) -> Result<WebhookOutcome, RpcError> {
        let plan = plan(payload);
        tracing::info!(
            installation_id = payload.installation.id,
            action = %payload.action,
            git_ref = %payload.git_ref,
            "webhook received"
        );
        match plan {
            WebhookPlan::Link {
                installation_id,
                owner,
                repos,
            } => {
                self.store.link_github(installation_id, &owner, repos).await?;
            }
            WebhookPlan::AddRepos {
                installation_id,
                owner,
                repos,
            } => {
                self.store
                    .save_github_repos(installation_id, &owner, repos)
                    .await?;
            }
            WebhookPlan::RemoveRepos {
                installation_id,
                repos,
            } => {
                self.store.remove_github_repos(installation_id, repos).await?;
            }
            WebhookPlan::DeleteInstallation {
                installation_id,
                repos,
            } => {
                self.delete_installation(installation_id, &repos).await?;
            }
            WebhookPlan::Push {
                vcs_repo_id,
                branch,
                sha,
                sender,
            } => {
                if let Some(id) = self.push(vcs_repo_id, &branch, &sha, &sender).await? {
                    return Ok(WebhookOutcome {
                        deployment_ids: vec![id],
                    });
                }
            }
            WebhookPlan::Ignore => {}
        }
        Ok(WebhookOutcome::default())
    }

    /// Tear down the cluster namespaces of the installation's repositories,
    /// then forget the installation.
    async fn delete_installation(
        &self,
        installation_id: i64,
        repos: &[InstalledRepository],
    ) -> Result<(), RpcError> {
        for installed in repos {
            let repo = match self.store.get_repo_by_vcs_id(installed.id).await {
                Ok(repo) => repo,
                Err(StoreError::RepoNotFound) => continue,
                Err(e) => return Err(e.into()),
            };
            self.pipeline.cancel_repo(&repo.id);
            let scope = RepoScope::resolve(self.store.as_ref(), &repo, None).await?;
            self.cluster.remove_namespace(&scope.namespace()).await?;
            tracing::info!(repo_id = %repo.id, namespace = %scope.namespace(), "namespace removed");
        }
        match self.store.remove_installation(installation_id).await {
            Ok(removed) => {
                tracing::info!(installation_id, repos = removed.len(), "installation removed");
                Ok(())
            }
            Err(StoreError::InstallationNotFound) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Deploy a push when it targets the repository's deploy branch and its
    /// commit is not already the latest finished deployment.
    async fn push(
        &self,
        vcs_repo_id: i64,
        branch: &str,
        sha: &str,
        sender: &str,
    ) -> Result<Option<String>, RpcError> {
        let repo = match self.store.get_repo_by_vcs_id(vcs_repo_id).await {
            Ok(repo) => repo,
            Err(StoreError::RepoNotFound) => {
                tracing::debug!(vcs_repo_id, "push for unknown repository ignored");
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        };
        if !repo.connected {
            tracing::debug!(repo_id = %repo.id, "push for disconnected repository ignored");
            return Ok(None);
        }
        let accepted = match repo.connected_branch.as_deref().filter(|b| !b.is_empty()) {
            Some(connected) => connected == branch,
            None => DEFAULT_DEPLOY_BRANCHES.contains(&branch),
        };
        if !accepted {
            tracing::debug!(repo_id = %repo.id, branch, "push to a non-deploy branch ignored");
            return Ok(None);
        }

        if !sha.is_empty() {
            let deployments = self.store.get_deployments(&repo.id).await?;
            let latest_done = deployments
                .iter()
                .find(|d| d.status == DeploymentStatus::Done);
            if latest_done.is_some_and(|d| d.sha == sha) {
                tracing::info!(repo_id = %repo.id, sha, "commit already deployed, skipping");
                return Ok(None);
            }
        }

        let checkout = if sha.is_empty() {
            Checkout::Branch(branch.to_string())
        } else {
            Checkout::Sha(sha.to_string())
        };
        let deployment = self
            .pipeline
            .deploy(DeployRequest {
                repo,
                user_display_name: sender.to_string(),
                workspace_hint: None,
                source: DeploySource::Checkout(checkout),
            })
            .await?;
        Ok(Some(deployment.id))
    }
}
