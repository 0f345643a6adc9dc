//! In-memory fakes of the platform ports and a harness that drives the real
//! router, SQLite store and progress bus.

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use axum::Router;
use axum::body::Body;
use axum::http::{Request, Response, StatusCode};
use http_body_util::BodyExt;
use kube::ResourceExt;
use serde_json::{Value, json};
use tempfile::TempDir;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tower::ServiceExt;

use treenq::errors::{AuthError, ClusterError, RegistryError, SourceError};
use treenq::platform::api::AppState;
use treenq::platform::db::{DbHandle, PlatformDb};
use treenq::platform::extract::FileExtractor;
use treenq::platform::git::{Checkout, Git, GitRepo};
use treenq::platform::github::{OauthProvider, ProviderToken, VcsClient};
use treenq::platform::handler::Handler;
use treenq::platform::jwt::{Claims, DEFAULT_ISSUER, JwtIssuer};
use treenq::platform::kube::{ApplyReport, ClusterApplier, parse_manifest};
use treenq::platform::middleware::{SIGNATURE_HEADER, WebhookSecret, sign_payload};
use treenq::platform::models::{
    AppDeployment, Image, InstalledRepository, PodPhase, ProgressMessage, Repository, UserInfo,
    WorkloadStats, aggregate_workload,
};
use treenq::platform::pipeline::{DeploymentPipeline, PipelineConfig, PipelineDeps};
use treenq::platform::progress::ProgressBus;
use treenq::platform::registry::{BuildArgs, ImageBuilder};
use treenq::platform::server::{ServerConfig, build_router};
use treenq::platform::session::{Session, SessionSettings};
use treenq::platform::space::{Service, Space};
use treenq::platform::store::Store;
use treenq::platform::webhook::WebhookDispatcher;

pub const WEBHOOK_SECRET: &[u8] = b"test-webhook-secret";
pub const REGISTRY: &str = "registry.test";
pub const VALID_MANIFEST: &str = r#"{
    "service": {
        "name": "web",
        "httpPort": 8080,
        "replicas": 1,
        "runtimeEnvs": {"MODE": "prod"}
    }
}"#;

// ── VCS ───────────────────────────────────────────────────────────────

#[derive(Default)]
pub struct FakeVcs {
    pub installations: Mutex<Vec<i64>>,
    pub repos: Mutex<BTreeMap<i64, Vec<InstalledRepository>>>,
}

pub fn valid_space() -> Space {
    Space {
        service: Service {
            name: "web".into(),
            http_port: 8080,
            ..Default::default()
        },
        ..Default::default()
    }
}

#[async_trait]
impl VcsClient for FakeVcs {
    async fn issue_access_token(&self, installation_id: i64) -> Result<String, SourceError> {
        Ok(format!("token-{}", installation_id))
    }

    async fn get_user_accessible_installations(
        &self,
        _user_token: &str,
    ) -> Result<Vec<i64>, SourceError> {
        Ok(self.installations.lock().unwrap().clone())
    }

    async fn list_repositories(
        &self,
        installation_id: i64,
    ) -> Result<Vec<InstalledRepository>, SourceError> {
        Ok(self
            .repos
            .lock()
            .unwrap()
            .get(&installation_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn get_branches(
        &self,
        _installation_id: i64,
        _full_name: &str,
        _fresh: bool,
    ) -> Result<Vec<String>, SourceError> {
        Ok(vec!["main".into(), "dev".into()])
    }

    async fn get_repo_space(
        &self,
        _installation_id: i64,
        _full_name: &str,
        _git_ref: &str,
    ) -> Result<Space, SourceError> {
        Ok(valid_space())
    }
}

// ── Git ───────────────────────────────────────────────────────────────

/// Writes the configured manifest into a fresh directory per clone.
pub struct FakeGit {
    root: PathBuf,
    /// `tq.json` content; `None` leaves the checkout without a manifest.
    pub manifest: Mutex<Option<String>>,
    pub clones: AtomicUsize,
}

impl FakeGit {
    pub fn new(root: PathBuf) -> Self {
        Self {
            root,
            manifest: Mutex::new(Some(VALID_MANIFEST.to_string())),
            clones: AtomicUsize::new(0),
        }
    }

    pub fn set_manifest(&self, content: Option<&str>) {
        *self.manifest.lock().unwrap() = content.map(str::to_string);
    }

    pub fn sha_for(checkout: &Checkout) -> String {
        match checkout {
            Checkout::Sha(sha) => sha.clone(),
            Checkout::Branch(b) => format!("{:0<40}", hex_of(b)),
            Checkout::Tag(t) => format!("{:0<40}", hex_of(t)),
        }
    }
}

fn hex_of(s: &str) -> String {
    s.bytes().map(|b| format!("{:02x}", b)).collect()
}

#[async_trait]
impl Git for FakeGit {
    async fn fetch(
        &self,
        repo: &Repository,
        _access_token: &str,
        checkout: &Checkout,
    ) -> Result<GitRepo, SourceError> {
        let n = self.clones.fetch_add(1, Ordering::SeqCst);
        let dir = self.root.join(format!("{}-{}", repo.id, n));
        std::fs::create_dir_all(&dir).map_err(anyhow::Error::from)?;
        if let Some(content) = self.manifest.lock().unwrap().as_deref() {
            std::fs::write(dir.join("tq.json"), content).map_err(anyhow::Error::from)?;
        }
        Ok(GitRepo {
            dir,
            sha: Self::sha_for(checkout),
            message: format!("commit for {}", checkout),
        })
    }
}

// ── Image builder ─────────────────────────────────────────────────────

#[derive(Default)]
pub struct FakeBuilder {
    /// `repo_id:tag` of every image in the registry.
    pub published: Mutex<Vec<String>>,
    pub builds: AtomicUsize,
    pub last_secrets: Mutex<BTreeMap<String, String>>,
    /// Builds wait for cancellation instead of finishing.
    pub hold: std::sync::atomic::AtomicBool,
}

impl FakeBuilder {
    pub fn build_count(&self) -> usize {
        self.builds.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ImageBuilder for FakeBuilder {
    fn image(&self, name: &str, tag: &str) -> Image {
        Image {
            registry: REGISTRY.into(),
            repository: name.into(),
            tag: tag.into(),
        }
    }

    async fn inspect(&self, deployment: &AppDeployment) -> Result<Image, RegistryError> {
        let key = format!("{}:{}", deployment.repo_id, deployment.build_tag);
        if self.published.lock().unwrap().contains(&key) {
            Ok(self.image(&deployment.repo_id, &deployment.build_tag))
        } else {
            Err(RegistryError::ImageNotFound)
        }
    }

    async fn build(
        &self,
        args: BuildArgs,
        progress: Arc<ProgressBus>,
        cancel: CancellationToken,
    ) -> Result<Image, RegistryError> {
        self.builds.fetch_add(1, Ordering::SeqCst);
        *self.last_secrets.lock().unwrap() = args.secrets.clone();
        progress.publish(
            &args.deployment_id,
            ProgressMessage::info(&args.deployment_id, "#1 building"),
        );
        if self.hold.load(Ordering::SeqCst) {
            cancel.cancelled().await;
            return Err(RegistryError::Cancelled);
        }
        self.published
            .lock()
            .unwrap()
            .push(format!("{}:{}", args.name, args.tag));
        Ok(self.image(&args.name, &args.tag))
    }
}

// ── Cluster ───────────────────────────────────────────────────────────

#[derive(Default)]
pub struct FakeCluster {
    /// `(kind, namespace, name)` of every object applied.
    pub objects: Mutex<BTreeMap<(String, String, String), String>>,
    /// `(namespace, repo_id) -> key -> value`
    pub secrets: Mutex<BTreeMap<(String, String), BTreeMap<String, String>>>,
    pub removed_namespaces: Mutex<Vec<String>>,
    pub applies: AtomicUsize,
}

impl FakeCluster {
    pub fn count(&self, kind: &str) -> usize {
        self.objects
            .lock()
            .unwrap()
            .keys()
            .filter(|(k, _, _)| k == kind)
            .count()
    }

    pub fn secret_keys(&self, namespace: &str, repo_id: &str) -> Vec<String> {
        self.secrets
            .lock()
            .unwrap()
            .get(&(namespace.to_string(), repo_id.to_string()))
            .map(|m| m.keys().cloned().collect())
            .unwrap_or_default()
    }
}

#[async_trait]
impl ClusterApplier for FakeCluster {
    async fn apply(&self, manifest: &str) -> Result<ApplyReport, ClusterError> {
        self.applies.fetch_add(1, Ordering::SeqCst);
        let mut report = ApplyReport::default();
        let mut objects = self.objects.lock().unwrap();
        for obj in parse_manifest(manifest)? {
            let kind = obj.types.as_ref().map(|t| t.kind.clone()).unwrap_or_default();
            let key = (
                kind.clone(),
                obj.namespace().unwrap_or_default(),
                obj.name_any(),
            );
            let body = serde_json::to_string(&obj).map_err(anyhow::Error::from)?;
            match objects.get(&key) {
                None => {
                    objects.insert(key, body);
                    report.created += 1;
                }
                Some(_) if kind == "Secret" || kind == "Namespace" => report.kept += 1,
                Some(_) => {
                    objects.insert(key, body);
                    report.updated += 1;
                }
            }
        }
        Ok(report)
    }

    async fn store_secret(
        &self,
        namespace: &str,
        repo_id: &str,
        key: &str,
        value: &str,
    ) -> Result<(), ClusterError> {
        self.secrets
            .lock()
            .unwrap()
            .entry((namespace.to_string(), repo_id.to_string()))
            .or_default()
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn get_secret(
        &self,
        namespace: &str,
        repo_id: &str,
        key: &str,
    ) -> Result<String, ClusterError> {
        self.secrets
            .lock()
            .unwrap()
            .get(&(namespace.to_string(), repo_id.to_string()))
            .and_then(|m| m.get(key).cloned())
            .ok_or(ClusterError::SecretNotFound)
    }

    async fn remove_secret(
        &self,
        namespace: &str,
        repo_id: &str,
        key: &str,
    ) -> Result<(), ClusterError> {
        let mut secrets = self.secrets.lock().unwrap();
        let removed = secrets
            .get_mut(&(namespace.to_string(), repo_id.to_string()))
            .and_then(|m| m.remove(key));
        removed.map(|_| ()).ok_or(ClusterError::SecretNotFound)
    }

    async fn stream_logs(
        &self,
        _namespace: &str,
        stream_id: &str,
        _cancel: CancellationToken,
    ) -> Result<mpsc::Receiver<ProgressMessage>, ClusterError> {
        let (tx, rx) = mpsc::channel(4);
        let _ = tx.try_send(ProgressMessage::info(stream_id, "listening on :8080"));
        Ok(rx)
    }

    async fn get_workload_stats(&self, namespace: &str) -> Result<WorkloadStats, ClusterError> {
        if !self
            .objects
            .lock()
            .unwrap()
            .keys()
            .any(|(kind, ns, _)| kind == "Deployment" && ns == namespace)
        {
            return Err(ClusterError::NoPodsRunning);
        }
        Ok(aggregate_workload(
            namespace,
            1,
            [(PodPhase::Running, format!("{}/app:abc", REGISTRY))],
        ))
    }

    async fn remove_namespace(&self, namespace: &str) -> Result<(), ClusterError> {
        self.removed_namespaces
            .lock()
            .unwrap()
            .push(namespace.to_string());
        self.objects
            .lock()
            .unwrap()
            .retain(|(_, ns, name), _| ns != namespace && name != namespace);
        Ok(())
    }
}

// ── OAuth ─────────────────────────────────────────────────────────────

pub struct FakeOauth;

#[async_trait]
impl OauthProvider for FakeOauth {
    fn authorize_url(&self, state: &str) -> String {
        format!("https://github.test/login/oauth/authorize?state={}", state)
    }

    async fn exchange_code(&self, code: &str) -> Result<ProviderToken, AuthError> {
        Ok(ProviderToken {
            access_token: format!("access-{}", code),
            refresh_token: format!("refresh-{}", code),
        })
    }

    async fn fetch_user(&self, _access_token: &str) -> Result<UserInfo, AuthError> {
        Ok(UserInfo {
            email: "alice@example.com".into(),
            display_name: "alice".into(),
            ..Default::default()
        })
    }
}

// ── Harness ───────────────────────────────────────────────────────────

pub struct TestApp {
    pub router: Router,
    pub store: Arc<DbHandle>,
    pub jwt: Arc<JwtIssuer>,
    pub progress: Arc<ProgressBus>,
    pub pipeline: Arc<DeploymentPipeline>,
    pub vcs: Arc<FakeVcs>,
    pub git: Arc<FakeGit>,
    pub builder: Arc<FakeBuilder>,
    pub cluster: Arc<FakeCluster>,
    clones: TempDir,
}

pub fn jwt() -> JwtIssuer {
    JwtIssuer::new(
        DEFAULT_ISSUER,
        include_str!("../fixtures/auth_private.pem"),
        include_str!("../fixtures/auth_public.pem"),
        Duration::from_secs(3600),
    )
    .unwrap()
}

impl TestApp {
    pub fn new() -> Self {
        Self::with_config(PipelineConfig::default())
    }

    pub fn with_config(config: PipelineConfig) -> Self {
        let clones = TempDir::new().unwrap();
        let store = Arc::new(DbHandle::new(PlatformDb::new_in_memory().unwrap()));
        let dyn_store: Arc<dyn Store> = store.clone();
        let jwt = Arc::new(jwt());
        let progress = Arc::new(ProgressBus::new());
        let vcs = Arc::new(FakeVcs::default());
        let git = Arc::new(FakeGit::new(clones.path().to_path_buf()));
        let builder = Arc::new(FakeBuilder::default());
        let cluster = Arc::new(FakeCluster::default());

        let pipeline = Arc::new(DeploymentPipeline::new(
            PipelineDeps {
                store: dyn_store.clone(),
                vcs: vcs.clone(),
                git: git.clone(),
                extractor: Arc::new(FileExtractor),
                builder: builder.clone(),
                cluster: cluster.clone(),
                progress: progress.clone(),
            },
            config,
        ));

        let state = Arc::new(AppState {
            handler: Handler::new(
                dyn_store.clone(),
                vcs.clone(),
                cluster.clone(),
                pipeline.clone(),
                "1.2.3",
            ),
            session: Session::new(
                dyn_store.clone(),
                Arc::new(FakeOauth),
                jwt.clone(),
                None,
                SessionSettings::default(),
            ),
            webhooks: WebhookDispatcher::new(dyn_store, cluster.clone(), pipeline.clone()),
            progress: progress.clone(),
        });

        let router = build_router(
            state,
            jwt.clone(),
            Some(WebhookSecret(Arc::new(WEBHOOK_SECRET.to_vec()))),
            &ServerConfig::default(),
        )
        .unwrap();

        Self {
            router,
            store,
            jwt,
            progress,
            pipeline,
            vcs,
            git,
            builder,
            cluster,
            clones,
        }
    }

    /// Clone directories still on disk.
    pub fn leftover_clones(&self) -> Vec<String> {
        std::fs::read_dir(self.clones.path())
            .unwrap()
            .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
            .collect()
    }

    pub async fn send(&self, req: Request<Body>) -> Response<Body> {
        self.router.clone().oneshot(req).await.unwrap()
    }

    /// `POST /<op>` with a bearer token; returns status and JSON body.
    pub async fn rpc(&self, op: &str, token: &str, body: Value) -> (StatusCode, Value) {
        let req = Request::builder()
            .method("POST")
            .uri(format!("/{}", op))
            .header("content-type", "application/json")
            .header("authorization", format!("Bearer {}", token))
            .body(Body::from(body.to_string()))
            .unwrap();
        let resp = self.send(req).await;
        let status = resp.status();
        (status, body_json(resp).await)
    }

    /// Deliver a signed webhook.
    pub async fn webhook(&self, payload: Value) -> (StatusCode, Value) {
        let body = payload.to_string();
        let req = Request::builder()
            .method("POST")
            .uri("/githubWebhook")
            .header("content-type", "application/json")
            .header(SIGNATURE_HEADER, sign_payload(WEBHOOK_SECRET, body.as_bytes()))
            .body(Body::from(body))
            .unwrap();
        let resp = self.send(req).await;
        let status = resp.status();
        (status, body_json(resp).await)
    }

    /// A user `alice` with installation 42 holding `alice/app` (vcs id 7).
    /// Returns the bearer token, the user and the repository.
    pub async fn seed(&self) -> (String, UserInfo, Repository) {
        let user = self
            .store
            .get_or_create_user(UserInfo {
                email: "alice@example.com".into(),
                display_name: "alice".into(),
                ..Default::default()
            })
            .await
            .unwrap();
        self.store
            .link_github(
                42,
                "alice",
                vec![InstalledRepository {
                    id: 7,
                    full_name: "alice/app".into(),
                    private: false,
                    default_branch: Some("main".into()),
                }],
            )
            .await
            .unwrap();
        let repo = self.store.get_github_repos(&user.id).await.unwrap().remove(0);
        (self.token_for(&user.id), user, repo)
    }

    /// `seed` plus `main` connected.
    pub async fn seed_connected(&self) -> (String, UserInfo, Repository) {
        let (token, user, repo) = self.seed().await;
        let repo = self
            .store
            .connect_repo(&user.id, &repo.id, "main")
            .await
            .unwrap();
        (token, user, repo)
    }

    pub fn token_for(&self, user_id: &str) -> String {
        let mut claims = Claims::new();
        claims.insert("id".into(), json!(user_id));
        self.jwt.issue(claims).unwrap()
    }

    /// Every progress message of a deployment up to its final one.
    pub async fn wait_final(&self, deployment_id: &str) -> Vec<ProgressMessage> {
        let mut sub = self
            .progress
            .subscribe(deployment_id, CancellationToken::new());
        let mut seen = Vec::new();
        tokio::time::timeout(Duration::from_secs(10), async {
            while let Some(msg) = sub.recv().await {
                let done = msg.is_final;
                seen.push(msg);
                if done {
                    break;
                }
            }
        })
        .await
        .expect("deployment did not finish in time");
        seen
    }

    /// Wait until the background run has released its handle.
    pub async fn wait_idle(&self) {
        tokio::time::timeout(Duration::from_secs(10), async {
            while self.pipeline.in_flight() > 0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("pipeline did not settle");
    }
}

pub async fn body_json(resp: Response<Body>) -> Value {
    let bytes = resp.into_body().collect().await.unwrap().to_bytes();
    if bytes.is_empty() {
        return Value::Null;
    }
    serde_json::from_slice(&bytes).unwrap_or(Value::Null)
}

pub fn push_payload(branch: &str, sha: &str) -> Value {
    json!({
        "ref": format!("refs/heads/{}", branch),
        "after": sha,
        "installation": {"id": 42},
        "sender": {"login": "alice"},
        "repository": {"id": 7, "full_name": "alice/app"}
    })
}
