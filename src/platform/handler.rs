//! Bearer-protected operations: profile, repositories, deploys, secrets and
//! workload queries.
//!
//! Every operation resolves the caller from the `id` claim and only sees
//! repositories reachable through the caller's workspace.

use std::collections::BTreeMap;
use std::sync::{Arc, LazyLock};

use regex::Regex;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use super::git::Checkout;
use super::github::VcsClient;
use super::jwt::claim_str;
use super::kube::ClusterApplier;
use super::models::{
    AppDeployment, DeploymentHistoryItem, DeploymentStatus, Repository, UserInfo, WorkloadStats,
    Workspace,
};
use super::pipeline::{DeployError, DeployRequest, DeploySource, DeploymentPipeline, RepoScope};
use super::rpc::{Empty, RequestContext, RpcError};
use super::store::Store;
use crate::errors::{ClusterError, SourceError, StoreError};

static SECRET_KEY_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-zA-Z][a-zA-Z0-9_.-]*$").expect("valid regex"));

pub fn is_valid_secret_key(key: &str) -> bool {
    !key.is_empty() && SECRET_KEY_RE.is_match(key)
}

// ── Error mapping ─────────────────────────────────────────────────────

impl From<StoreError> for RpcError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::UserNotFound => Self::new("USER_NOT_FOUND", err.to_string()),
            StoreError::WorkspaceNotFound => Self::new("WORKSPACE_NOT_FOUND", err.to_string()),
            StoreError::RepoNotFound => Self::new("REPO_NOT_FOUND", err.to_string()),
            StoreError::InstallationNotFound => {
                Self::new("INSTALLATION_NOT_FOUND", err.to_string())
            }
            StoreError::DeploymentNotFound => Self::new("DEPLOYMENT_NOT_FOUND", err.to_string()),
            StoreError::InvalidTransition { .. } => Self::new("INVALID_REQUEST", err.to_string()),
            StoreError::Other(e) => Self::internal("UNKNOWN", "storage failure", e),
        }
    }
}

impl From<ClusterError> for RpcError {
    fn from(err: ClusterError) -> Self {
        match err {
            ClusterError::SecretNotFound => Self::new("SECRET_DOESNT_EXIST", err.to_string()),
            ClusterError::NoPodsRunning => Self::new("NO_PODS_RUNNING", err.to_string()),
            ClusterError::InvalidManifest(_) => {
                Self::internal("FAILED_DEFINE_APP", "invalid manifest", err)
            }
            ClusterError::Other(e) => Self::internal("UNKNOWN", "cluster request failed", e),
        }
    }
}

impl From<SourceError> for RpcError {
    fn from(err: SourceError) -> Self {
        match err {
            SourceError::NoGitCheckoutSpecified | SourceError::GitBranchAndShaMutuallyExclusive => {
                Self::new("ONLY_BRANCH_OR_SHA_OR_TAG_ALLOWED", err.to_string())
            }
            SourceError::NoTqJsonFound => Self::new("TQ_JSON_NOT_FOUND", err.to_string()),
            SourceError::TqIsNotValidJson(_) | SourceError::InvalidSpace(_) => {
                Self::new("TQ_JSON_INVALID", err.to_string())
            }
            SourceError::TokenRejected(msg) => Self::unauthorized(msg),
            SourceError::Transport(_) | SourceError::Other(_) => {
                Self::internal("UNKNOWN", "vcs request failed", err)
            }
        }
    }
}

impl From<DeployError> for RpcError {
    fn from(err: DeployError) -> Self {
        match err {
            DeployError::Store(e) => e.into(),
        }
    }
}

// ── Payloads ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct InfoResponse {
    pub version: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct GetProfileResponse {
    pub user_info: UserInfo,
    pub workspace: Option<Workspace>,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct GetReposResponse {
    pub installation: bool,
    pub repos: Vec<Repository>,
}

#[derive(Debug, Clone, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct RepoRequest {
    #[serde(alias = "repoID")]
    pub repo_id: String,
}

#[derive(Debug, Clone, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct GetBranchesRequest {
    #[serde(alias = "repoID")]
    pub repo_id: String,
    #[serde(default)]
    pub fresh: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct GetBranchesResponse {
    pub branches: Vec<String>,
}

#[derive(Debug, Clone, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ConnectBranchRequest {
    #[serde(alias = "repoID")]
    pub repo_id: String,
    pub branch: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ConnectBranchResponse {
    pub repo: Repository,
}

#[derive(Debug, Clone, Default, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase", default)]
pub struct DeployRequestBody {
    #[serde(alias = "repoID")]
    pub repo_id: String,
    pub branch: String,
    pub sha: String,
    pub tag: String,
    #[serde(alias = "fromDeploymentID")]
    pub from_deployment_id: String,
}

#[derive(Debug, Clone, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentRequest {
    #[serde(alias = "deploymentID")]
    pub deployment_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct DeploymentResponse {
    pub deployment: AppDeployment,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct GetDeploymentsResponse {
    pub deployments: Vec<AppDeployment>,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct GetDeploymentHistoryResponse {
    pub history: Vec<DeploymentHistoryItem>,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct GetSecretsResponse {
    pub keys: Vec<String>,
}

#[derive(Debug, Clone, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct RevealSecretsRequest {
    #[serde(alias = "repoID")]
    pub repo_id: String,
    pub keys: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct RevealSecretsResponse {
    pub values: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct SetSecretRequest {
    #[serde(alias = "repoID")]
    pub repo_id: String,
    pub key: String,
    pub value: String,
}

#[derive(Debug, Clone, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct RemoveSecretRequest {
    #[serde(alias = "repoID")]
    pub repo_id: String,
    pub key: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct GetWorkloadStatsResponse {
    pub workload_stats: WorkloadStats,
}

// ── Handler ───────────────────────────────────────────────────────────

pub struct Handler {
    store: Arc<dyn Store>,
    vcs: Arc<dyn VcsClient>,
    cluster: Arc<dyn ClusterApplier>,
    pipeline: Arc<DeploymentPipeline>,
    app_version: String,
}

impl Handler {
    pub fn new(
        store: Arc<dyn Store>,
        vcs: Arc<dyn VcsClient>,
        cluster: Arc<dyn ClusterApplier>,
        pipeline: Arc<DeploymentPipeline>,
        app_version: impl Into<String>,
    ) -> Self {
        Self {
            store,
            vcs,
            cluster,
            pipeline,
            app_version: app_version.into(),
        }
    }

    pub fn pipeline(&self) -> &Arc<DeploymentPipeline> {
        &self.pipeline
    }

    /// The caller named by the bearer `id` claim.
    pub async fn current_user(&self, ctx: &RequestContext) -> Result<UserInfo, RpcError> {
        let id = claim_str(ctx.claims()?, "id");
        if id.is_empty() {
            return Err(RpcError::unauthorized("token carries no user id"));
        }
        self.store.get_user(&id).await.map_err(|e| match e {
            StoreError::UserNotFound => RpcError::unauthorized("unknown user"),
            other => other.into(),
        })
    }

    async fn visible_repo(&self, user: &UserInfo, repo_id: &str) -> Result<Repository, RpcError> {
        Ok(self.store.get_repo_by_id(&user.id, repo_id).await?)
    }

    /// A deployment whose repository the user can see.
    async fn visible_deployment(
        &self,
        user: &UserInfo,
        deployment_id: &str,
    ) -> Result<AppDeployment, RpcError> {
        let deployment = self.store.get_deployment(deployment_id).await?;
        match self.store.get_repo_by_id(&user.id, &deployment.repo_id).await {
            Ok(_) => Ok(deployment),
            Err(StoreError::RepoNotFound) => Err(RpcError::new(
                "DEPLOYMENT_NOT_FOUND",
                StoreError::DeploymentNotFound.to_string(),
            )),
            Err(e) => Err(e.into()),
        }
    }

    async fn scope(&self, user: &UserInfo, repo: &Repository) -> Result<RepoScope, RpcError> {
        Ok(RepoScope::resolve(self.store.as_ref(), repo, Some(&user.current_workspace)).await?)
    }

    // ── Profile & repositories ────────────────────────────────────────

    pub async fn info(&self, _ctx: &RequestContext, _: Empty) -> Result<InfoResponse, RpcError> {
        Ok(InfoResponse {
            version: self.app_version.clone(),
        })
    }

    pub async fn get_profile(
        &self,
        ctx: &RequestContext,
        _: Empty,
    ) -> Result<GetProfileResponse, RpcError> {
        let user = self.current_user(ctx).await?;
        let workspace = if user.current_workspace.is_empty() {
            None
        } else {
            match self.store.get_workspace(&user.current_workspace).await {
                Ok(ws) => Some(ws),
                Err(StoreError::WorkspaceNotFound) => None,
                Err(e) => return Err(e.into()),
            }
        };
        Ok(GetProfileResponse {
            user_info: user,
            workspace,
        })
    }

    pub async fn get_repos(
        &self,
        ctx: &RequestContext,
        _: Empty,
    ) -> Result<GetReposResponse, RpcError> {
        let user = self.current_user(ctx).await?;
        let repos = self.store.get_github_repos(&user.id).await?;
        Ok(GetReposResponse {
            installation: !repos.is_empty(),
            repos,
        })
    }

    pub async fn get_branches(
        &self,
        ctx: &RequestContext,
        req: GetBranchesRequest,
    ) -> Result<GetBranchesResponse, RpcError> {
        let user = self.current_user(ctx).await?;
        let repo = self.visible_repo(&user, &req.repo_id).await?;
        let branches = self
            .vcs
            .get_branches(repo.installation_id, &repo.full_name, req.fresh)
            .await?;
        Ok(GetBranchesResponse { branches })
    }

    /// Re-read every installation the user can reach and link it to the
    /// user's workspace.
    pub async fn sync_github_app(
        &self,
        ctx: &RequestContext,
        _: Empty,
    ) -> Result<GetReposResponse, RpcError> {
        let user = self.current_user(ctx).await?;
        let Some((access_token, _)) = self.store.get_token_pair(&user.id).await? else {
            return Err(RpcError::unauthorized(
                "GitHub token expired or invalid, please re-authenticate with GitHub",
            ));
        };

        let installations = self
            .vcs
            .get_user_accessible_installations(&access_token)
            .await?;
        if installations.is_empty() {
            return Err(RpcError::new(
                "NO_INSTALLATIONS_FOUND",
                "no accessible github app installations found for user",
            ));
        }

        for installation_id in installations {
            let repos = self.vcs.list_repositories(installation_id).await?;
            tracing::info!(
                installation_id,
                repos = repos.len(),
                user_id = %user.id,
                "syncing installation"
            );
            self.store
                .link_github(installation_id, &user.display_name, repos)
                .await?;
        }

        let repos = self.store.get_github_repos(&user.id).await?;
        Ok(GetReposResponse {
            installation: true,
            repos,
        })
    }

    /// Validate the branch's manifest, then mark the repository connected.
    pub async fn connect_repo_branch(
        &self,
        ctx: &RequestContext,
        req: ConnectBranchRequest,
    ) -> Result<ConnectBranchResponse, RpcError> {
        let user = self.current_user(ctx).await?;
        let repo = self.visible_repo(&user, &req.repo_id).await?;
        self.vcs
            .get_repo_space(repo.installation_id, &repo.full_name, &req.branch)
            .await?;
        let repo = self
            .store
            .connect_repo(&user.id, &repo.id, &req.branch)
            .await?;
        tracing::info!(repo_id = %repo.id, branch = %req.branch, "repository connected");
        Ok(ConnectBranchResponse { repo })
    }

    // ── Deployments ───────────────────────────────────────────────────

    pub async fn deploy(
        &self,
        ctx: &RequestContext,
        req: DeployRequestBody,
    ) -> Result<DeploymentResponse, RpcError> {
        let user = self.current_user(ctx).await?;
        let repo = self.visible_repo(&user, &req.repo_id).await?;
        if !repo.connected {
            return Err(RpcError::new(
                "REPO_IS_NOT_CONNECTED",
                "connect a branch before deploying",
            ));
        }

        let source = if !req.from_deployment_id.is_empty() {
            let previous = self
                .visible_deployment(&user, &req.from_deployment_id)
                .await?;
            if previous.repo_id != repo.id {
                return Err(RpcError::new(
                    "DEPLOYMENT_NOT_FOUND",
                    StoreError::DeploymentNotFound.to_string(),
                ));
            }
            if previous.sha.is_empty() {
                return Err(RpcError::new(
                    "INVALID_REQUEST",
                    "deployment has no commit to redeploy",
                ));
            }
            DeploySource::Redeploy(previous)
        } else if req.branch.is_empty() && req.sha.is_empty() && req.tag.is_empty() {
            DeploySource::Checkout(Checkout::Branch(repo.deploy_branch().to_string()))
        } else {
            DeploySource::Checkout(Checkout::from_parts(&req.branch, &req.sha, &req.tag)?)
        };

        let deployment = self
            .pipeline
            .deploy(DeployRequest {
                repo,
                user_display_name: user.display_name.clone(),
                workspace_hint: Some(user.current_workspace.clone()),
                source,
            })
            .await?;
        Ok(DeploymentResponse { deployment })
    }

    pub async fn get_deployment(
        &self,
        ctx: &RequestContext,
        req: DeploymentRequest,
    ) -> Result<DeploymentResponse, RpcError> {
        let user = self.current_user(ctx).await?;
        let deployment = self.visible_deployment(&user, &req.deployment_id).await?;
        Ok(DeploymentResponse { deployment })
    }

    pub async fn get_deployments(
        &self,
        ctx: &RequestContext,
        req: RepoRequest,
    ) -> Result<GetDeploymentsResponse, RpcError> {
        let user = self.current_user(ctx).await?;
        let repo = self.visible_repo(&user, &req.repo_id).await?;
        let deployments = self.store.get_deployments(&repo.id).await?;
        Ok(GetDeploymentsResponse { deployments })
    }

    pub async fn get_deployment_history(
        &self,
        ctx: &RequestContext,
        req: RepoRequest,
    ) -> Result<GetDeploymentHistoryResponse, RpcError> {
        let user = self.current_user(ctx).await?;
        let repo = self.visible_repo(&user, &req.repo_id).await?;
        let history = self.store.get_deployment_history(&repo.id).await?;
        Ok(GetDeploymentHistoryResponse { history })
    }

    /// Redeploy the image of a finished deployment as a new deployment.
    pub async fn rollback_deployment(
        &self,
        ctx: &RequestContext,
        req: DeploymentRequest,
    ) -> Result<DeploymentResponse, RpcError> {
        let user = self.current_user(ctx).await?;
        let source = self.visible_deployment(&user, &req.deployment_id).await?;
        if !matches!(
            source.status,
            DeploymentStatus::Done | DeploymentStatus::RolledBack
        ) {
            return Err(RpcError::new(
                "INVALID_REQUEST",
                format!("cannot roll back to a {} deployment", source.status.as_str()),
            ));
        }
        let repo = self.visible_repo(&user, &source.repo_id).await?;
        tracing::info!(repo_id = %repo.id, from = %source.id, "rolling back");

        let deployment = self
            .pipeline
            .deploy(DeployRequest {
                repo,
                user_display_name: user.display_name.clone(),
                workspace_hint: Some(user.current_workspace.clone()),
                source: DeploySource::Rollback(source),
            })
            .await?;
        Ok(DeploymentResponse { deployment })
    }

    // ── Secrets ───────────────────────────────────────────────────────

    pub async fn get_secrets(
        &self,
        ctx: &RequestContext,
        req: RepoRequest,
    ) -> Result<GetSecretsResponse, RpcError> {
        let user = self.current_user(ctx).await?;
        let repo = self.visible_repo(&user, &req.repo_id).await?;
        let scope = self.scope(&user, &repo).await?;
        let keys = self
            .store
            .get_repository_secret_keys(&scope.workspace_id, &repo.id)
            .await?;
        Ok(GetSecretsResponse { keys })
    }

    pub async fn reveal_secrets(
        &self,
        ctx: &RequestContext,
        req: RevealSecretsRequest,
    ) -> Result<RevealSecretsResponse, RpcError> {
        let user = self.current_user(ctx).await?;
        let repo = self.visible_repo(&user, &req.repo_id).await?;
        let scope = self.scope(&user, &repo).await?;
        let namespace = scope.namespace();

        let mut values = BTreeMap::new();
        for key in req.keys {
            let exists = self
                .store
                .repository_secret_key_exists(&scope.workspace_id, &repo.id, &key)
                .await?;
            if !exists {
                return Err(RpcError::new("SECRET_DOESNT_EXIST", "secret doesn't exist")
                    .with_meta("key", key));
            }
            let value = self.cluster.get_secret(&namespace, &repo.id, &key).await?;
            values.insert(key, value);
        }
        Ok(RevealSecretsResponse { values })
    }

    /// The cluster holds the value before the store records the key.
    pub async fn set_secret(
        &self,
        ctx: &RequestContext,
        req: SetSecretRequest,
    ) -> Result<Empty, RpcError> {
        if !is_valid_secret_key(&req.key) {
            return Err(RpcError::new(
                "INVALID_SECRET_KEY",
                "secret keys start with a letter and contain letters, digits, '_', '.' or '-'",
            ));
        }
        let user = self.current_user(ctx).await?;
        let repo = self.visible_repo(&user, &req.repo_id).await?;
        let scope = self.scope(&user, &repo).await?;

        self.cluster
            .store_secret(&scope.namespace(), &repo.id, &req.key, &req.value)
            .await?;
        self.store
            .save_secret(&scope.workspace_id, &repo.id, &req.key)
            .await?;
        tracing::info!(repo_id = %repo.id, key = %req.key, "secret stored");
        Ok(Empty {})
    }

    /// The store forgets the key before the cluster drops the value.
    pub async fn remove_secret(
        &self,
        ctx: &RequestContext,
        req: RemoveSecretRequest,
    ) -> Result<Empty, RpcError> {
        let user = self.current_user(ctx).await?;
        let repo = self.visible_repo(&user, &req.repo_id).await?;
        let scope = self.scope(&user, &repo).await?;

        self.store
            .remove_secret(&scope.workspace_id, &repo.id, &req.key)
            .await?;
        match self
            .cluster
            .remove_secret(&scope.namespace(), &repo.id, &req.key)
            .await
        {
            Ok(()) | Err(ClusterError::SecretNotFound) => {}
            Err(e) => return Err(e.into()),
        }
        tracing::info!(repo_id = %repo.id, key = %req.key, "secret removed");
        Ok(Empty {})
    }

    // ── Runtime ───────────────────────────────────────────────────────

    pub async fn get_workload_stats(
        &self,
        ctx: &RequestContext,
        req: RepoRequest,
    ) -> Result<GetWorkloadStatsResponse, RpcError> {
        let user = self.current_user(ctx).await?;
        let repo = self.visible_repo(&user, &req.repo_id).await?;
        let scope = self.scope(&user, &repo).await?;
        let workload_stats = self.cluster.get_workload_stats(&scope.namespace()).await?;
        Ok(GetWorkloadStatsResponse { workload_stats })
    }

    /// Namespace whose pod logs `getLogs` follows, checked against the
    /// caller's visibility.
    pub async fn logs_namespace(
        &self,
        ctx: &RequestContext,
        repo_id: &str,
    ) -> Result<String, RpcError> {
        let user = self.current_user(ctx).await?;
        let repo = self.visible_repo(&user, repo_id).await?;
        Ok(self.scope(&user, &repo).await?.namespace())
    }

    /// Deployment whose progress `getBuildProgress` streams.
    pub async fn progress_deployment(
        &self,
        ctx: &RequestContext,
        deployment_id: &str,
    ) -> Result<AppDeployment, RpcError> {
        let user = self.current_user(ctx).await?;
        self.visible_deployment(&user, deployment_id).await
    }

    pub fn cluster(&self) -> &Arc<dyn ClusterApplier> {
        &self.cluster
    }
}
