//! The deployment pipeline: clone, extract, inspect-or-build, apply.
//!
//! A deploy inserts its `init` row synchronously and hands back the row; the
//! rest runs as a background task bounded by the deploy timeout. Every run
//! ends with exactly one `final` progress message: `info` on success, `error`
//! with a code otherwise.

use std::future::Future;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio_util::sync::CancellationToken;

use super::extract::Extractor;
use super::git::{Checkout, Git};
use super::github::VcsClient;
use super::kube::{ClusterApplier, ClusterSettings, ManifestInput, namespace_name, synthesize};
use super::models::{
    AppDeployment, DeploymentStatus, Image, ProgressMessage, Repository, build_tag,
};
use super::progress::ProgressBus;
use super::registry::{BuildArgs, ImageBuilder};
use super::store::Store;
use crate::errors::{ClusterError, RegistryError, SourceError, StoreError};

/// Retries after the first attempt for idempotent steps.
const MAX_RETRIES: u32 = 2;
const RETRY_BASE_DELAY: Duration = Duration::from_millis(200);

pub const SUPERSEDED: &str = "superseded";

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub cluster: ClusterSettings,
    pub deploy_timeout: Duration,
    /// Fail (and cancel) older in-flight deployments of a repo when a new one
    /// starts.
    pub supersede: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            cluster: ClusterSettings::default(),
            deploy_timeout: Duration::from_secs(300),
            supersede: true,
        }
    }
}

/// Where a deployment takes its source from.
#[derive(Debug, Clone)]
pub enum DeploySource {
    /// Clone the ref, read the manifest, build when the image is missing.
    Checkout(Checkout),
    /// Reuse space, sha and build tag of a previous deployment.
    Redeploy(AppDeployment),
    /// Like `Redeploy`, and records the source as `rolledBackFromId`.
    Rollback(AppDeployment),
}

#[derive(Debug, Clone)]
pub struct DeployRequest {
    pub repo: Repository,
    pub user_display_name: String,
    /// Workspace of the requesting user, used when the repository's
    /// installation is not attached to one yet.
    pub workspace_hint: Option<String>,
    pub source: DeploySource,
}

/// The workspace a repository deploys into and its namespace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepoScope {
    pub repo_id: String,
    pub workspace_id: String,
    pub workspace_name: String,
}

impl RepoScope {
    /// The repository's workspace, else `hint`, else the installation owner
    /// (with an empty workspace id).
    pub async fn resolve(
        store: &dyn Store,
        repo: &Repository,
        hint: Option<&str>,
    ) -> Result<Self, StoreError> {
        let workspace_id = repo
            .workspace_id
            .as_deref()
            .or(hint)
            .filter(|id| !id.is_empty());
        let (workspace_id, workspace_name) = match workspace_id {
            Some(id) => {
                let workspace = store.get_workspace(id).await?;
                (workspace.id, workspace.name)
            }
            None => {
                let installation = store.get_installation(repo.installation_id).await?;
                (String::new(), installation.owner)
            }
        };
        Ok(Self {
            repo_id: repo.id.clone(),
            workspace_id,
            workspace_name,
        })
    }

    pub fn namespace(&self) -> String {
        namespace_name(&self.workspace_name, &self.repo_id)
    }
}

/// Why a run stopped before `done`.
#[derive(Debug)]
enum RunError {
    Failed { code: &'static str, message: String },
    Cancelled,
}

impl RunError {
    fn failed(code: &'static str, err: impl std::fmt::Display) -> Self {
        Self::Failed {
            code,
            message: err.to_string(),
        }
    }
}

/// Errors the pipeline reports before the background run starts.
#[derive(Debug, thiserror::Error)]
pub enum DeployError {
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Errors that an idempotent step may retry.
trait Retryable {
    fn is_retryable(&self) -> bool;
}

impl Retryable for SourceError {
    fn is_retryable(&self) -> bool {
        self.is_transport()
    }
}

impl Retryable for RegistryError {
    fn is_retryable(&self) -> bool {
        self.is_transport()
    }
}

/// Run `op`, retrying transport failures with exponential backoff.
async fn with_retry<T, E, F, Fut>(what: &str, mut op: F) -> Result<T, E>
where
    E: Retryable + std::fmt::Display,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let mut attempt = 0;
    loop {
        match op().await {
            Err(e) if e.is_retryable() && attempt < MAX_RETRIES => {
                let delay = RETRY_BASE_DELAY * 2u32.pow(attempt);
                tracing::warn!(step = what, attempt, error = %e, "retrying after transport error");
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            other => return other,
        }
    }
}

/// A clone directory owned by one run. Removed on drop, so a run abandoned
/// by the deploy timeout still cleans up after itself.
#[derive(Debug)]
struct WorkDir(PathBuf);

impl WorkDir {
    fn path(&self) -> &Path {
        &self.0
    }
}

impl Drop for WorkDir {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_dir_all(&self.0) {
            tracing::debug!(dir = %self.0.display(), error = %e, "failed to remove clone directory");
        }
    }
}

/// `rel` joined onto `dir`, or `None` when it would leave `dir`.
fn within(dir: &Path, rel: &str) -> Option<PathBuf> {
    let rel = Path::new(rel);
    let contained = rel
        .components()
        .all(|c| matches!(c, Component::Normal(_) | Component::CurDir));
    contained.then(|| dir.join(rel))
}

struct RunHandle {
    repo_id: String,
    cancel: CancellationToken,
}

pub struct DeploymentPipeline {
    store: Arc<dyn Store>,
    vcs: Arc<dyn VcsClient>,
    git: Arc<dyn Git>,
    extractor: Arc<dyn Extractor>,
    builder: Arc<dyn ImageBuilder>,
    cluster: Arc<dyn ClusterApplier>,
    progress: Arc<ProgressBus>,
    config: PipelineConfig,
    /// In-flight runs by deployment id.
    running: DashMap<String, RunHandle>,
}

/// Collaborators of the pipeline.
pub struct PipelineDeps {
    pub store: Arc<dyn Store>,
    pub vcs: Arc<dyn VcsClient>,
    pub git: Arc<dyn Git>,
    pub extractor: Arc<dyn Extractor>,
    pub builder: Arc<dyn ImageBuilder>,
    pub cluster: Arc<dyn ClusterApplier>,
    pub progress: Arc<ProgressBus>,
}

impl DeploymentPipeline {
    pub fn new(deps: PipelineDeps, config: PipelineConfig) -> Self {
        Self {
            store: deps.store,
            vcs: deps.vcs,
            git: deps.git,
            extractor: deps.extractor,
            builder: deps.builder,
            cluster: deps.cluster,
            progress: deps.progress,
            config,
            running: DashMap::new(),
        }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Number of runs still in flight.
    pub fn in_flight(&self) -> usize {
        self.running.len()
    }

    /// Insert the deployment row and start the run in the background.
    pub async fn deploy(self: &Arc<Self>, req: DeployRequest) -> Result<AppDeployment, DeployError> {
        let mut row = AppDeployment::new(&req.repo.id, &req.user_display_name);
        match &req.source {
            DeploySource::Checkout(checkout) => {
                row.branch = checkout.branch().to_string();
                row.tag = checkout.tag().to_string();
                if let Checkout::Sha(sha) = checkout {
                    row.sha = sha.clone();
                }
            }
            DeploySource::Redeploy(prev) | DeploySource::Rollback(prev) => {
                row.space = prev.space.clone();
                row.sha = prev.sha.clone();
                row.build_tag = prev.build_tag.clone();
                row.branch = prev.branch.clone();
                row.tag = prev.tag.clone();
                row.message = prev.message.clone();
                if matches!(req.source, DeploySource::Rollback(_)) {
                    row.rolled_back_from_id = Some(prev.id.clone());
                }
            }
        }

        let deployment = self.store.save_deployment(row).await?;
        tracing::info!(
            deployment_id = %deployment.id,
            repo_id = %deployment.repo_id,
            "deployment queued"
        );

        if self.config.supersede {
            self.supersede(&deployment).await?;
        }

        let cancel = CancellationToken::new();
        self.running.insert(
            deployment.id.clone(),
            RunHandle {
                repo_id: deployment.repo_id.clone(),
                cancel: cancel.clone(),
            },
        );
        self.progress.publish(
            &deployment.id,
            ProgressMessage::info(&deployment.id, "queued"),
        );

        let pipeline = Arc::clone(self);
        let started = deployment.clone();
        tokio::spawn(async move {
            pipeline.execute(started, req, cancel).await;
        });
        Ok(deployment)
    }

    /// Fail every other in-flight deployment of the repo and cancel its run.
    async fn supersede(&self, keep: &AppDeployment) -> Result<(), StoreError> {
        let superseded = self
            .store
            .supersede_deployments(&keep.repo_id, &keep.id)
            .await?;
        for id in superseded {
            tracing::info!(deployment_id = %id, by = %keep.id, "deployment superseded");
            if let Some((_, handle)) = self.running.remove(&id) {
                handle.cancel.cancel();
            }
            self.progress.publish(
                &id,
                ProgressMessage::error(&id, "SUPERSEDED", format!("superseded by {}", keep.id))
                    .finished(),
            );
        }
        Ok(())
    }

    /// Cancel the in-flight runs of a repository.
    pub fn cancel_repo(&self, repo_id: &str) {
        self.running.retain(|_, handle| {
            if handle.repo_id == repo_id {
                handle.cancel.cancel();
                false
            } else {
                true
            }
        });
    }

    async fn execute(&self, deployment: AppDeployment, req: DeployRequest, cancel: CancellationToken) {
        let id = deployment.id.clone();
        let mut current = deployment.clone();
        let outcome = tokio::time::timeout(
            self.config.deploy_timeout,
            self.run(&mut current, &req, &cancel),
        )
        .await
        .unwrap_or_else(|_| {
            cancel.cancel();
            Err(RunError::failed(
                "DEPLOY_TIMEOUT",
                format!("deployment exceeded {}s", self.config.deploy_timeout.as_secs()),
            ))
        });

        match outcome {
            Ok(done) => {
                tracing::info!(deployment_id = %id, sha = %done.sha, "deployment done");
            }
            Err(RunError::Cancelled) => {
                tracing::info!(deployment_id = %id, "deployment run cancelled");
            }
            Err(RunError::Failed { code, message }) => {
                tracing::warn!(deployment_id = %id, code, error = %message, "deployment failed");
                let mut failed = current.clone();
                failed.status = DeploymentStatus::Failed;
                failed.error = Some(message.clone());
                match self.store.update_deployment(&failed).await {
                    Ok(_) | Err(StoreError::InvalidTransition { .. }) => {}
                    Err(e) => {
                        tracing::error!(deployment_id = %id, error = %e, "failed to record failure")
                    }
                }
                self.progress
                    .publish(&id, ProgressMessage::error(&id, code, message).finished());
            }
        }
        self.running.remove(&id);
    }

    /// Persist a status move; a terminal row means another writer won.
    async fn transition(
        &self,
        deployment: &mut AppDeployment,
        status: DeploymentStatus,
        cancel: &CancellationToken,
    ) -> Result<(), RunError> {
        if cancel.is_cancelled() {
            return Err(RunError::Cancelled);
        }
        deployment.status = status;
        match self.store.update_deployment(deployment).await {
            Ok(updated) => {
                *deployment = updated;
                Ok(())
            }
            Err(StoreError::InvalidTransition { .. }) => Err(RunError::Cancelled),
            Err(e) => Err(RunError::failed("FAILED_UPDATE_DEPLOYMENT", e)),
        }
    }

    fn info(&self, deployment_id: &str, payload: impl Into<String>) {
        self.progress
            .publish(deployment_id, ProgressMessage::info(deployment_id, payload));
    }

    async fn run(
        &self,
        deployment: &mut AppDeployment,
        req: &DeployRequest,
        cancel: &CancellationToken,
    ) -> Result<AppDeployment, RunError> {
        let repo = &req.repo;
        let scope = RepoScope::resolve(self.store.as_ref(), repo, req.workspace_hint.as_deref())
            .await
            .map_err(|e| RunError::failed("WORKSPACE_NOT_FOUND", e))?;
        let namespace = scope.namespace();
        let mut clone_dir: Option<WorkDir> = None;

        let result = async {
            if let DeploySource::Checkout(checkout) = &req.source {
                clone_dir = Some(self.fetch_source(deployment, repo, checkout, cancel).await?);
            }

            let current: &AppDeployment = deployment;
            let image = match with_retry("inspect", || self.builder.inspect(current)).await {
                Ok(image) => {
                    self.info(
                        &deployment.id,
                        format!("image {} already present, skipping build", image.full_path()),
                    );
                    image
                }
                Err(RegistryError::ImageNotFound) => {
                    if clone_dir.is_none() {
                        self.info(&deployment.id, "image missing from registry, rebuilding");
                        let fallback = Checkout::Sha(deployment.sha.clone());
                        clone_dir = Some(self.fetch_source(deployment, repo, &fallback, cancel).await?);
                    }
                    let dir = match &clone_dir {
                        Some(dir) => dir.path().to_path_buf(),
                        None => return Err(RunError::failed("FAILED_CLONE", "no source checked out")),
                    };
                    self.transition(deployment, DeploymentStatus::Building, cancel).await?;
                    self.build(deployment, &dir, &namespace, cancel).await?
                }
                Err(e) => return Err(RunError::failed("FAILED_INSPECT_IMAGE", e)),
            };

            self.transition(deployment, DeploymentStatus::Deploying, cancel).await?;
            let secret_keys = self
                .store
                .get_repository_secret_keys(&scope.workspace_id, &repo.id)
                .await
                .map_err(|e| RunError::failed("FAILED_GET_SECRETS", e))?;
            self.apply(deployment, repo, &scope.workspace_name, &image, &secret_keys, cancel)
                .await?;

            self.transition(deployment, DeploymentStatus::Done, cancel).await?;
            if let Some(source_id) = deployment.rolled_back_from_id.clone() {
                match self
                    .store
                    .mark_rolled_back(&repo.id, &source_id, &deployment.id)
                    .await
                {
                    Ok(n) if n > 0 => tracing::info!(deployment_id = %deployment.id, rolled_back = n, "marked later deployments rolled back"),
                    Ok(_) => {}
                    Err(e) => tracing::warn!(deployment_id = %deployment.id, error = %e, "failed to mark rolled back deployments"),
                }
            }
            self.progress.publish(
                &deployment.id,
                ProgressMessage::info(&deployment.id, format!("deployed {}", image.full_path()))
                    .finished(),
            );
            Ok(deployment.clone())
        }
        .await;

        drop(clone_dir);
        result
    }

    /// Clone the checkout and read the manifest into `deployment`.
    async fn fetch_source(
        &self,
        deployment: &mut AppDeployment,
        repo: &Repository,
        checkout: &Checkout,
        cancel: &CancellationToken,
    ) -> Result<WorkDir, RunError> {
        self.transition(deployment, DeploymentStatus::Cloning, cancel).await?;

        let token = with_retry("issue token", || self.vcs.issue_access_token(repo.installation_id))
            .await
            .map_err(|e| RunError::failed("INSTALLATION_NOT_FOUND", e))?;

        self.info(&deployment.id, format!("cloning {} at {}", repo.full_name, checkout));
        let source = with_retry("clone", || self.git.fetch(repo, &token, checkout))
            .await
            .map_err(|e| RunError::failed("FAILED_CLONE", e))?;
        let workdir = WorkDir(source.dir.clone());
        self.info(
            &deployment.id,
            format!("checked out {} {}", &source.sha, source.message.lines().next().unwrap_or_default()),
        );

        let mut space = self
            .extractor
            .extract_config(&source.dir)
            .await
            .map_err(|e| match e {
                SourceError::NoTqJsonFound | SourceError::TqIsNotValidJson(_) => {
                    RunError::failed("TQ_NOT_FOUND", e)
                }
                SourceError::InvalidSpace(_) => RunError::failed("INVALID_SPACE", e),
                other => RunError::failed("FAILED_EXTRACT_CONFIG", other),
            })?;
        space.key = repo.id.clone();

        deployment.space = space;
        deployment.sha = source.sha.clone();
        deployment.build_tag = build_tag(&source.sha);
        deployment.message = source.message.clone();
        self.transition(deployment, DeploymentStatus::Cloning, cancel).await?;
        Ok(workdir)
    }

    async fn build(
        &self,
        deployment: &AppDeployment,
        dir: &Path,
        namespace: &str,
        cancel: &CancellationToken,
    ) -> Result<Image, RunError> {
        let service = &deployment.space.service;
        let (Some(docker_context), Some(dockerfile)) = (
            within(dir, &service.docker_context),
            within(dir, &service.dockerfile_path),
        ) else {
            return Err(RunError::failed(
                "INVALID_SPACE",
                "dockerContext and dockerfilePath must stay inside the repository",
            ));
        };
        let mut secrets = std::collections::BTreeMap::new();
        for key in &service.build_secrets {
            let value = self
                .cluster
                .get_secret(namespace, &deployment.repo_id, key)
                .await
                .map_err(|e| match e {
                    ClusterError::SecretNotFound => RunError::failed(
                        "SECRET_DOESNT_EXIST",
                        format!("build secret {} is not set", key),
                    ),
                    other => RunError::failed("FAILED_GET_SECRETS", other),
                })?;
            secrets.insert(key.clone(), value);
        }

        self.info(&deployment.id, "building image");
        let args = BuildArgs {
            deployment_id: deployment.id.clone(),
            name: deployment.repo_id.clone(),
            tag: deployment.build_tag.clone(),
            docker_context,
            dockerfile,
            build_args: service.build_envs.clone(),
            secrets,
        };
        match self
            .builder
            .build(args, self.progress.clone(), cancel.clone())
            .await
        {
            Ok(image) => Ok(image),
            Err(RegistryError::Cancelled) => Err(RunError::Cancelled),
            Err(e) => Err(RunError::failed("FAILED_BUILD", e)),
        }
    }

    async fn apply(
        &self,
        deployment: &AppDeployment,
        repo: &Repository,
        workspace_name: &str,
        image: &Image,
        secret_keys: &[String],
        cancel: &CancellationToken,
    ) -> Result<(), RunError> {
        let manifest = synthesize(
            &ManifestInput {
                deployment_id: &deployment.id,
                repo_id: &repo.id,
                workspace_name,
                space: &deployment.space,
                image,
                secret_keys,
            },
            &self.config.cluster,
        )
        .map_err(|e| RunError::failed("FAILED_DEFINE_APP", e))?;

        if cancel.is_cancelled() {
            return Err(RunError::Cancelled);
        }
        self.info(&deployment.id, "applying manifests");
        let report = self
            .cluster
            .apply(&manifest)
            .await
            .map_err(|e| RunError::failed("FAILED_APPLY", e))?;
        tracing::info!(
            deployment_id = %deployment.id,
            created = report.created,
            updated = report.updated,
            kept = report.kept,
            "manifests applied"
        );
        Ok(())
    }
}
