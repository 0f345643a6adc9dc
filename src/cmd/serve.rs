//! API server command (`treenq serve`).

use std::sync::Arc;

use anyhow::{Context, Result};
use treenq::config::{Config, load_key};
use treenq::platform::api::AppState;
use treenq::platform::db::{DbHandle, PlatformDb};
use treenq::platform::extract::FileExtractor;
use treenq::platform::git::Git2Fetcher;
use treenq::platform::github::{GithubClient, GithubOauth};
use treenq::platform::handler::Handler;
use treenq::platform::jwt::{DEFAULT_ISSUER, JwtIssuer};
use treenq::platform::kube::{ClusterApplier, KubeCluster};
use treenq::platform::middleware::WebhookSecret;
use treenq::platform::pipeline::{DeploymentPipeline, PipelineDeps};
use treenq::platform::progress::ProgressBus;
use treenq::platform::registry::DockerArtifactory;
use treenq::platform::server::{build_router, start_server};
use treenq::platform::session::{IdentityServer, Session};
use treenq::platform::store::Store;
use treenq::platform::webhook::WebhookDispatcher;

pub async fn cmd_serve(config: Config) -> Result<()> {
    config.validate().context("Invalid configuration")?;
    let _guard = treenq::telemetry::init(&config.logging());

    let db = PlatformDb::new(&config.db_dsn, config.migrations_dir.as_deref())
        .with_context(|| format!("Failed to open database {}", config.db_dsn.display()))?;
    let store: Arc<dyn Store> = Arc::new(DbHandle::new(db));

    let github_key = load_key(&config.github_private_key).context("GITHUB_PRIVATE_KEY")?;
    let vcs = Arc::new(GithubClient::new(
        &config.github_api_url,
        &config.github_client_id,
        &github_key,
    )?);
    let oauth = Arc::new(GithubOauth::new(
        &config.github_client_id,
        &config.github_secret,
        config.github_redirect_url.clone(),
        &config.github_clone_url,
        &config.github_api_url,
    )?);

    let clone_root = config.clone_root();
    std::fs::create_dir_all(&clone_root)
        .with_context(|| format!("Failed to create clone dir {}", clone_root.display()))?;
    let git = Arc::new(Git2Fetcher::new(clone_root, &config.github_clone_url));
    let builder = Arc::new(DockerArtifactory::new(config.artifactory()?)?);
    let cluster: Arc<dyn ClusterApplier> =
        Arc::new(KubeCluster::connect(config.kube_config.as_deref()).await?);

    let jwt = Arc::new(JwtIssuer::new(
        DEFAULT_ISSUER,
        &load_key(&config.auth_private_key).context("AUTH_PRIVATE_KEY")?,
        &load_key(&config.auth_public_key).context("AUTH_PUBLIC_KEY")?,
        config.auth_ttl,
    )?);

    let progress = Arc::new(ProgressBus::new());
    let pipeline = Arc::new(DeploymentPipeline::new(
        PipelineDeps {
            store: store.clone(),
            vcs: vcs.clone(),
            git,
            extractor: Arc::new(FileExtractor),
            builder,
            cluster: cluster.clone(),
            progress: progress.clone(),
        },
        config.pipeline(),
    ));

    let identity = match &config.identity_server_url {
        Some(url) => Some(IdentityServer::new(
            url,
            &config.identity_server_token,
            config.identity_providers()?,
            config.auth_redirect_url.as_deref().unwrap_or_default(),
        )?),
        None => None,
    };

    let state = Arc::new(AppState {
        handler: Handler::new(
            store.clone(),
            vcs,
            cluster.clone(),
            pipeline.clone(),
            config.app_version.clone(),
        ),
        session: Session::new(
            store.clone(),
            oauth,
            jwt.clone(),
            identity,
            config.session(),
        ),
        webhooks: WebhookDispatcher::new(store, cluster, pipeline),
        progress,
    });

    let webhook_secret = config
        .github_webhook_secret_enable
        .then(|| WebhookSecret(Arc::new(config.github_webhook_secret.clone().into_bytes())));
    if webhook_secret.is_none() {
        tracing::warn!("webhook signature verification is disabled");
    }

    let server = config.server();
    let app = build_router(state, jwt, webhook_secret, &server)?;
    start_server(app, &server).await
}
