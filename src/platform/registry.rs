//! Image builder and registry access.
//!
//! Builds run through `buildctl` against a BuildKit daemon and push straight
//! to the registry; lookups use the registry's v2 HTTP API so a redeploy of
//! an already-published tag can skip the build.

use std::collections::{BTreeMap, VecDeque};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use base64::Engine;
use futures::StreamExt;
use reqwest::StatusCode;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio_stream::wrappers::LinesStream;
use tokio_util::sync::CancellationToken;

use super::models::{AppDeployment, Image, ProgressMessage};
use super::progress::ProgressBus;
use crate::errors::RegistryError;

const MANIFEST_ACCEPT: &str = "application/vnd.oci.image.index.v1+json, \
     application/vnd.oci.image.manifest.v1+json, \
     application/vnd.docker.distribution.manifest.v2+json, \
     application/vnd.docker.distribution.manifest.list.v2+json";

/// Lines of builder output kept for the failure message.
const ERROR_TAIL_LINES: usize = 5;

/// Key buildctl writes the pushed manifest digest under.
const DIGEST_KEY: &str = "containerimage.digest";

/// Credentials presented to the registry.
#[derive(Clone, PartialEq, Eq)]
pub enum RegistryAuth {
    None,
    Basic { username: String, password: String },
    Token(String),
}

impl std::fmt::Debug for RegistryAuth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::None => write!(f, "None"),
            Self::Basic { username, .. } => write!(f, "Basic({}, ***)", username),
            Self::Token(_) => write!(f, "Token(***)"),
        }
    }
}

impl RegistryAuth {
    pub fn from_parts(
        kind: &str,
        username: &str,
        password: &str,
        token: &str,
    ) -> anyhow::Result<Self> {
        match kind {
            "" | "none" | "noauth" => Ok(Self::None),
            "basic" => {
                if username.is_empty() || password.is_empty() {
                    anyhow::bail!("basic registry auth requires a username and password");
                }
                Ok(Self::Basic {
                    username: username.to_string(),
                    password: password.to_string(),
                })
            }
            "token" => {
                if token.is_empty() {
                    anyhow::bail!("token registry auth requires a token");
                }
                Ok(Self::Token(token.to_string()))
            }
            other => anyhow::bail!("unknown registry auth type: {}", other),
        }
    }
}

/// Input of a single image build.
#[derive(Debug, Clone)]
pub struct BuildArgs {
    pub deployment_id: String,
    pub name: String,
    pub tag: String,
    pub docker_context: PathBuf,
    pub dockerfile: PathBuf,
    pub build_args: BTreeMap<String, String>,
    pub secrets: BTreeMap<String, String>,
}

#[async_trait]
pub trait ImageBuilder: Send + Sync {
    fn image(&self, name: &str, tag: &str) -> Image;

    /// The published image of `deployment`, or `ImageNotFound`.
    async fn inspect(&self, deployment: &AppDeployment) -> Result<Image, RegistryError>;

    /// Build and push. Output lines are published to `progress`; the final
    /// progress message is left to the caller.
    async fn build(
        &self,
        args: BuildArgs,
        progress: Arc<ProgressBus>,
        cancel: CancellationToken,
    ) -> Result<Image, RegistryError>;
}

#[derive(Debug, Clone)]
pub struct ArtifactoryConfig {
    pub registry: String,
    pub tls_verify: bool,
    pub cert_dir: Option<PathBuf>,
    pub auth: RegistryAuth,
    pub buildkit_host: String,
    pub buildkit_tls_ca: Option<PathBuf>,
}

pub struct DockerArtifactory {
    /// Host (and port) images are tagged with.
    registry: String,
    /// Base URL for the v2 API.
    api_base: String,
    tls_verify: bool,
    auth: RegistryAuth,
    buildkit_host: String,
    buildkit_tls_ca: Option<PathBuf>,
    buildctl: PathBuf,
    http: reqwest::Client,
}

impl DockerArtifactory {
    pub fn new(config: ArtifactoryConfig) -> anyhow::Result<Self> {
        let (api_base, registry) = match config.registry.split_once("://") {
            Some((_, host)) => (
                config.registry.trim_end_matches('/').to_string(),
                host.trim_end_matches('/').to_string(),
            ),
            None => (
                format!("https://{}", config.registry.trim_end_matches('/')),
                config.registry.trim_end_matches('/').to_string(),
            ),
        };

        let mut builder = reqwest::Client::builder()
            .user_agent(super::github::USER_AGENT)
            .timeout(super::github::HTTP_TIMEOUT)
            .danger_accept_invalid_certs(!config.tls_verify);
        if let Some(dir) = &config.cert_dir {
            for cert in load_certificates(dir)? {
                builder = builder.add_root_certificate(cert);
            }
        }
        let http = builder
            .build()
            .context("Failed to build registry HTTP client")?;

        Ok(Self {
            registry,
            api_base,
            tls_verify: config.tls_verify,
            auth: config.auth,
            buildkit_host: config.buildkit_host,
            buildkit_tls_ca: config.buildkit_tls_ca,
            buildctl: PathBuf::from("buildctl"),
            http,
        })
    }

    /// Override the `buildctl` executable.
    pub fn with_buildctl(mut self, path: impl Into<PathBuf>) -> Self {
        self.buildctl = path.into();
        self
    }

    fn build_command_args(&self, args: &BuildArgs, image: &Image, metadata: &Path) -> Vec<String> {
        let dockerfile_dir = args
            .dockerfile
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| args.docker_context.clone());
        let dockerfile_name = args
            .dockerfile
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("Dockerfile");

        let mut out = vec!["--addr".to_string(), self.buildkit_host.clone()];
        if let Some(ca) = &self.buildkit_tls_ca {
            out.push("--tlscacert".into());
            out.push(ca.display().to_string());
        }
        out.extend([
            "build".into(),
            "--progress".into(),
            "plain".into(),
            "--frontend".into(),
            "dockerfile.v0".into(),
            "--local".into(),
            format!("context={}", args.docker_context.display()),
            "--local".into(),
            format!("dockerfile={}", dockerfile_dir.display()),
            "--opt".into(),
            format!("filename={}", dockerfile_name),
        ]);
        for (key, value) in &args.build_args {
            out.push("--opt".into());
            out.push(format!("build-arg:{}={}", key, value));
        }
        for (i, key) in args.secrets.keys().enumerate() {
            out.push("--secret".into());
            out.push(format!("id={},env={}", key, secret_env(i)));
        }
        out.push("--metadata-file".into());
        out.push(metadata.display().to_string());
        let mut output = format!("type=image,name={},push=true", image.full_path());
        if !self.tls_verify {
            output.push_str(",registry.insecure=true");
        }
        out.push("--output".into());
        out.push(output);
        out
    }

    /// `config.json` for the builder's registry push.
    fn docker_config(&self) -> Option<serde_json::Value> {
        let auth = match &self.auth {
            RegistryAuth::None => return None,
            RegistryAuth::Basic { username, password } => serde_json::json!({
                "auth": base64::engine::general_purpose::STANDARD
                    .encode(format!("{}:{}", username, password)),
            }),
            RegistryAuth::Token(token) => serde_json::json!({ "identitytoken": token }),
        };
        Some(serde_json::json!({ "auths": { self.registry.clone(): auth } }))
    }

    fn authorize(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.auth {
            RegistryAuth::None => req,
            RegistryAuth::Basic { username, password } => req.basic_auth(username, Some(password)),
            RegistryAuth::Token(token) => req.bearer_auth(token),
        }
    }
}

fn secret_env(index: usize) -> String {
    format!("TQ_BUILD_SECRET_{}", index)
}

fn load_certificates(dir: &Path) -> anyhow::Result<Vec<reqwest::Certificate>> {
    let mut certs = Vec::new();
    for ext in ["crt", "pem", "cert"] {
        let pattern = dir.join(format!("*.{}", ext));
        let pattern = pattern
            .to_str()
            .context("Certificate directory is not valid UTF-8")?;
        for path in glob::glob(pattern).context("Invalid certificate glob")?.flatten() {
            let pem = std::fs::read(&path)
                .with_context(|| format!("Failed to read {}", path.display()))?;
            certs.push(
                reqwest::Certificate::from_pem(&pem)
                    .with_context(|| format!("Invalid certificate {}", path.display()))?,
            );
        }
    }
    Ok(certs)
}

fn transport_or_other(err: reqwest::Error, what: &str) -> RegistryError {
    if err.is_connect() || err.is_timeout() {
        RegistryError::Transport(format!("{}: {}", what, err))
    } else {
        anyhow::Error::new(err).context(what.to_string()).into()
    }
}

#[async_trait]
impl ImageBuilder for DockerArtifactory {
    fn image(&self, name: &str, tag: &str) -> Image {
        Image {
            registry: self.registry.clone(),
            repository: name.to_string(),
            tag: tag.to_string(),
        }
    }

    async fn inspect(&self, deployment: &AppDeployment) -> Result<Image, RegistryError> {
        let image = self.image(&deployment.repo_id, &deployment.build_tag);
        let url = format!(
            "{}/v2/{}/manifests/{}",
            self.api_base, image.repository, image.tag
        );
        let resp = self
            .authorize(self.http.head(&url).header("Accept", MANIFEST_ACCEPT))
            .send()
            .await
            .map_err(|e| transport_or_other(e, "registry manifest lookup failed"))?;

        match resp.status() {
            s if s.is_success() => Ok(image),
            StatusCode::NOT_FOUND => Err(RegistryError::ImageNotFound),
            s if s.is_server_error() => Err(RegistryError::Transport(format!(
                "registry responded with {}",
                s
            ))),
            s => Err(anyhow::anyhow!("registry manifest lookup responded with {}", s).into()),
        }
    }

    async fn build(
        &self,
        args: BuildArgs,
        progress: Arc<ProgressBus>,
        cancel: CancellationToken,
    ) -> Result<Image, RegistryError> {
        let image = self.image(&args.name, &args.tag);
        let deployment_id = args.deployment_id.clone();
        tracing::info!(deployment_id = %deployment_id, image = %image.full_path(), "building image");

        // Scratch space for the push credentials and build metadata; removed
        // when dropped, including when the build future is abandoned.
        let scratch = tempfile::Builder::new()
            .prefix("treenq-build-")
            .tempdir()
            .context("Failed to create build scratch dir")?;
        let metadata = scratch.path().join("metadata.json");

        let mut cmd = Command::new(&self.buildctl);
        cmd.args(self.build_command_args(&args, &image, &metadata))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        for (i, value) in args.secrets.values().enumerate() {
            cmd.env(secret_env(i), value);
        }

        if let Some(config) = self.docker_config() {
            std::fs::write(scratch.path().join("config.json"), config.to_string())
                .context("Failed to write docker config")?;
            cmd.env("DOCKER_CONFIG", scratch.path());
        }

        run_build(cmd, &deployment_id, &progress, &cancel).await?;

        let pushed = match read_digest(&metadata).await {
            Some(digest) => format!("pushed {}@{}", image.full_path(), digest),
            None => {
                tracing::warn!(deployment_id = %deployment_id, "buildctl metadata carried no image digest");
                format!("pushed {}", image.full_path())
            }
        };
        progress.publish(&deployment_id, ProgressMessage::info(&deployment_id, pushed));
        Ok(image)
    }
}

/// The manifest digest from buildctl's `--metadata-file` output.
async fn read_digest(metadata: &Path) -> Option<String> {
    let raw = tokio::fs::read(metadata).await.ok()?;
    let value: serde_json::Value = serde_json::from_slice(&raw).ok()?;
    value
        .get(DIGEST_KEY)
        .and_then(|d| d.as_str())
        .filter(|d| !d.is_empty())
        .map(str::to_string)
}

async fn run_build(
    mut cmd: Command,
    deployment_id: &str,
    progress: &ProgressBus,
    cancel: &CancellationToken,
) -> Result<(), RegistryError> {
    let mut child = cmd.spawn().context("Failed to spawn buildctl")?;
    let stdout = child.stdout.take().context("buildctl stdout not captured")?;
    let stderr = child.stderr.take().context("buildctl stderr not captured")?;

    let mut lines = futures::stream::select(
        LinesStream::new(BufReader::new(stdout).lines()),
        LinesStream::new(BufReader::new(stderr).lines()),
    );
    let mut tail: VecDeque<String> = VecDeque::with_capacity(ERROR_TAIL_LINES);

    let pump = async {
        while let Some(Ok(line)) = lines.next().await {
            let line = line.trim_end();
            if line.is_empty() {
                continue;
            }
            if tail.len() == ERROR_TAIL_LINES {
                tail.pop_front();
            }
            tail.push_back(line.to_string());
            progress.publish(deployment_id, ProgressMessage::info(deployment_id, line));
        }
    };

    tokio::select! {
        _ = cancel.cancelled() => {
            let _ = child.kill().await;
            tracing::warn!(deployment_id, "build cancelled");
            return Err(RegistryError::Cancelled);
        }
        _ = pump => {}
    }

    let status = child.wait().await.context("Failed to wait for buildctl")?;
    if !status.success() {
        let detail = tail.into_iter().collect::<Vec<_>>().join("\n");
        return Err(RegistryError::BuildFailed(format!("buildctl exited with {}: {}", status, detail)));
    }
    Ok(())
}
