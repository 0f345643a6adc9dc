//! Cluster side of a deployment: manifest synthesis, apply, runtime secrets,
//! log following and workload stats.

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::Context;
use async_trait::async_trait;
use futures::{AsyncBufReadExt, StreamExt};
use k8s_openapi::ByteString;
use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec};
use k8s_openapi::api::core::v1::{
    Container, ContainerPort, EnvVar, EnvVarSource, Namespace, Pod, PodSpec, PodTemplateSpec,
    ResourceRequirements, Secret, SecretKeySelector, Service, ServicePort, ServiceSpec,
};
use k8s_openapi::api::networking::v1::{
    HTTPIngressPath, HTTPIngressRuleValue, Ingress, IngressBackend, IngressRule,
    IngressServiceBackend, IngressSpec, IngressTLS, ServiceBackendPort,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::api::{
    Api, ApiResource, DeleteParams, DynamicObject, GroupVersionKind, ListParams, LogParams,
    PostParams,
};
use kube::{Client, ResourceExt};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::models::{Image, PodPhase, ProgressMessage, WorkloadStats, aggregate_workload};
use super::space::Space;
use crate::errors::ClusterError;

const NAME_LABEL: &str = "tq/name";
const DEPLOYMENT_ANNOTATION: &str = "treenq.dev/deployment-id";
const SERVICE_PORT: i32 = 80;
const MAX_NAME_LEN: usize = 63;
const LOG_TAIL_LINES: i64 = 100;

/// Namespace of a space: `<workspaceName>-<space.key>`, reduced to a DNS
/// label. The workspace part is truncated so the key always survives.
pub fn namespace_name(workspace_name: &str, space_key: &str) -> String {
    let key = dns_label(space_key);
    let budget = MAX_NAME_LEN.saturating_sub(key.len() + 1);
    let workspace: String = dns_label(workspace_name).chars().take(budget).collect();
    let workspace = workspace.trim_end_matches('-');
    match (workspace.is_empty(), key.is_empty()) {
        (true, _) => key,
        (false, true) => workspace.to_string(),
        (false, false) => format!("{}-{}", workspace, key),
    }
}

fn dns_label(s: &str) -> String {
    let mapped: String = s
        .to_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
        .collect();
    let mut out = String::with_capacity(mapped.len());
    for c in mapped.chars() {
        if c == '-' && out.ends_with('-') {
            continue;
        }
        out.push(c);
    }
    out.trim_matches('-').to_string()
}

/// Name of the runtime secret object of a repository.
pub fn secret_object_name(repo_id: &str) -> String {
    format!("{}-secrets", repo_id)
}

/// Cluster-wide settings applied to every synthesized manifest.
#[derive(Debug, Clone)]
pub struct ClusterSettings {
    pub ingress_host: String,
    pub cert_issuer: String,
}

impl Default for ClusterSettings {
    fn default() -> Self {
        Self {
            ingress_host: "localhost".to_string(),
            cert_issuer: "letsencrypt".to_string(),
        }
    }
}

/// Everything a manifest is derived from.
#[derive(Debug, Clone)]
pub struct ManifestInput<'a> {
    pub deployment_id: &'a str,
    pub repo_id: &'a str,
    pub workspace_name: &'a str,
    pub space: &'a Space,
    pub image: &'a Image,
    pub secret_keys: &'a [String],
}

fn to_yaml<T: Serialize>(obj: &T) -> Result<String, ClusterError> {
    serde_yaml::to_string(obj).map_err(|e| ClusterError::InvalidManifest(e.to_string()))
}

/// Render the Namespace, Secret, Deployment, Service and Ingress of a space
/// as one YAML stream, in apply order.
pub fn synthesize(input: &ManifestInput<'_>, settings: &ClusterSettings) -> Result<String, ClusterError> {
    let service = &input.space.service;
    let ns = namespace_name(input.workspace_name, &input.space.key);
    let secret_name = secret_object_name(input.repo_id);
    let labels = BTreeMap::from([(NAME_LABEL.to_string(), service.name.clone())]);
    let meta = |name: &str| ObjectMeta {
        name: Some(name.to_string()),
        namespace: Some(ns.clone()),
        labels: Some(labels.clone()),
        ..Default::default()
    };

    let namespace = Namespace {
        metadata: ObjectMeta {
            name: Some(ns.clone()),
            ..Default::default()
        },
        ..Default::default()
    };

    let secret = Secret {
        metadata: meta(&secret_name),
        data: Some(BTreeMap::new()),
        type_: Some("Opaque".to_string()),
        ..Default::default()
    };

    let mut env: Vec<EnvVar> = service
        .runtime_envs
        .iter()
        .map(|(name, value)| EnvVar {
            name: name.clone(),
            value: Some(value.clone()),
            ..Default::default()
        })
        .collect();
    env.extend(input.secret_keys.iter().map(|key| EnvVar {
        name: key.clone(),
        value_from: Some(EnvVarSource {
            secret_key_ref: Some(SecretKeySelector {
                name: secret_name.clone(),
                key: key.clone(),
                optional: None,
            }),
            ..Default::default()
        }),
        ..Default::default()
    }));

    let compute = &service.computation_resource;
    let resources = BTreeMap::from([
        ("cpu".to_string(), Quantity(format!("{}m", compute.cpu_millis))),
        ("memory".to_string(), Quantity(format!("{}Mi", compute.memory_mib))),
        (
            "ephemeral-storage".to_string(),
            Quantity(format!("{}Gi", compute.disk_gib)),
        ),
    ]);

    let deployment = Deployment {
        metadata: meta(&service.name),
        spec: Some(DeploymentSpec {
            replicas: Some(service.replicas as i32),
            selector: LabelSelector {
                match_labels: Some(labels.clone()),
                ..Default::default()
            },
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(labels.clone()),
                    annotations: Some(BTreeMap::from([(
                        DEPLOYMENT_ANNOTATION.to_string(),
                        input.deployment_id.to_string(),
                    )])),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    containers: vec![Container {
                        name: service.name.clone(),
                        image: Some(input.image.full_path()),
                        image_pull_policy: Some("Always".to_string()),
                        ports: Some(vec![ContainerPort {
                            name: Some("http".to_string()),
                            container_port: service.http_port as i32,
                            protocol: Some("TCP".to_string()),
                            ..Default::default()
                        }]),
                        env: (!env.is_empty()).then_some(env),
                        resources: Some(ResourceRequirements {
                            requests: Some(resources.clone()),
                            limits: Some(resources),
                            ..Default::default()
                        }),
                        ..Default::default()
                    }],
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        ..Default::default()
    };

    let svc = Service {
        metadata: meta(&service.name),
        spec: Some(ServiceSpec {
            type_: Some("ClusterIP".to_string()),
            selector: Some(labels.clone()),
            ports: Some(vec![ServicePort {
                name: Some("http".to_string()),
                port: SERVICE_PORT,
                target_port: Some(IntOrString::Int(service.http_port as i32)),
                protocol: Some("TCP".to_string()),
                ..Default::default()
            }]),
            ..Default::default()
        }),
        ..Default::default()
    };

    let host = format!("{}.{}", dns_label(&input.space.key), settings.ingress_host);
    let mut ingress_meta = meta("ingress");
    ingress_meta.annotations = Some(BTreeMap::from([(
        "cert-manager.io/cluster-issuer".to_string(),
        settings.cert_issuer.clone(),
    )]));
    let ingress = Ingress {
        metadata: ingress_meta,
        spec: Some(IngressSpec {
            rules: Some(vec![IngressRule {
                host: Some(host.clone()),
                http: Some(HTTPIngressRuleValue {
                    paths: vec![HTTPIngressPath {
                        path: Some("/".to_string()),
                        path_type: "Prefix".to_string(),
                        backend: IngressBackend {
                            service: Some(IngressServiceBackend {
                                name: service.name.clone(),
                                port: Some(ServiceBackendPort {
                                    number: Some(SERVICE_PORT),
                                    ..Default::default()
                                }),
                            }),
                            ..Default::default()
                        },
                    }],
                }),
            }]),
            tls: Some(vec![IngressTLS {
                hosts: Some(vec![host]),
                secret_name: Some(format!("{}-tls", ns)),
            }]),
            ..Default::default()
        }),
        ..Default::default()
    };

    let docs = [
        to_yaml(&namespace)?,
        to_yaml(&secret)?,
        to_yaml(&deployment)?,
        to_yaml(&svc)?,
        to_yaml(&ingress)?,
    ];
    Ok(docs.join("---\n"))
}

/// Split a YAML stream on `---` lines and decode each non-empty document.
pub fn parse_manifest(manifest: &str) -> Result<Vec<DynamicObject>, ClusterError> {
    let mut docs = Vec::new();
    let mut current = String::new();
    for line in manifest.lines().chain(std::iter::once("---")) {
        if line.trim_end() == "---" {
            if !current.trim().is_empty() {
                let obj: DynamicObject = serde_yaml::from_str(&current)
                    .map_err(|e| ClusterError::InvalidManifest(e.to_string()))?;
                if obj.types.is_none() {
                    return Err(ClusterError::InvalidManifest(
                        "document without apiVersion/kind".to_string(),
                    ));
                }
                docs.push(obj);
            }
            current.clear();
        } else {
            current.push_str(line);
            current.push('\n');
        }
    }
    Ok(docs)
}

/// Outcome of an apply, per object.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ApplyReport {
    pub created: usize,
    pub updated: usize,
    /// Existing objects left as they are (secret values live there).
    pub kept: usize,
}

#[async_trait]
pub trait ClusterApplier: Send + Sync {
    /// Create each object of `manifest` in order, updating ones that exist.
    async fn apply(&self, manifest: &str) -> Result<ApplyReport, ClusterError>;

    async fn store_secret(
        &self,
        namespace: &str,
        repo_id: &str,
        key: &str,
        value: &str,
    ) -> Result<(), ClusterError>;

    async fn get_secret(&self, namespace: &str, repo_id: &str, key: &str)
    -> Result<String, ClusterError>;

    async fn remove_secret(&self, namespace: &str, repo_id: &str, key: &str)
    -> Result<(), ClusterError>;

    /// Follow the logs of every pod in `namespace`. Messages carry
    /// `stream_id`; the channel closes once every follower ends or `cancel`
    /// fires.
    async fn stream_logs(
        &self,
        namespace: &str,
        stream_id: &str,
        cancel: CancellationToken,
    ) -> Result<mpsc::Receiver<ProgressMessage>, ClusterError>;

    async fn get_workload_stats(&self, namespace: &str) -> Result<WorkloadStats, ClusterError>;

    /// Delete a namespace; a missing namespace is not an error.
    async fn remove_namespace(&self, namespace: &str) -> Result<(), ClusterError>;
}

pub struct KubeCluster {
    client: Client,
}

fn is_status(err: &kube::Error, code: u16) -> bool {
    matches!(err, kube::Error::Api(resp) if resp.code == code)
}

impl KubeCluster {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// Client from a kubeconfig file, or the in-cluster/default config.
    pub async fn connect(kubeconfig: Option<&Path>) -> anyhow::Result<Self> {
        let config = match kubeconfig {
            Some(path) => {
                let raw = kube::config::Kubeconfig::read_from(path)
                    .with_context(|| format!("Failed to read kubeconfig {}", path.display()))?;
                kube::Config::from_custom_kubeconfig(raw, &kube::config::KubeConfigOptions::default())
                    .await
                    .context("Invalid kubeconfig")?
            }
            None => kube::Config::infer().await.context("Failed to infer kube config")?,
        };
        let client = Client::try_from(config).context("Failed to create kube client")?;
        Ok(Self::new(client))
    }

    fn secrets(&self, namespace: &str) -> Api<Secret> {
        Api::namespaced(self.client.clone(), namespace)
    }

    async fn ensure_namespace(&self, namespace: &str) -> Result<(), ClusterError> {
        let api: Api<Namespace> = Api::all(self.client.clone());
        let ns = Namespace {
            metadata: ObjectMeta {
                name: Some(namespace.to_string()),
                ..Default::default()
            },
            ..Default::default()
        };
        match api.create(&PostParams::default(), &ns).await {
            Ok(_) => Ok(()),
            Err(e) if is_status(&e, 409) => Ok(()),
            Err(e) => Err(anyhow::Error::new(e)
                .context(format!("Failed to create namespace {}", namespace))
                .into()),
        }
    }
}

#[async_trait]
impl ClusterApplier for KubeCluster {
    async fn apply(&self, manifest: &str) -> Result<ApplyReport, ClusterError> {
        let mut report = ApplyReport::default();
        for mut obj in parse_manifest(manifest)? {
            let types = obj.types.clone().unwrap_or_default();
            let gvk = GroupVersionKind::try_from(&types)
                .map_err(|e| ClusterError::InvalidManifest(e.to_string()))?;
            let resource = ApiResource::from_gvk(&gvk);
            let api: Api<DynamicObject> = match obj.metadata.namespace.as_deref() {
                Some(ns) => Api::namespaced_with(self.client.clone(), ns, &resource),
                None => Api::all_with(self.client.clone(), &resource),
            };
            let name = obj.name_any();

            match api.create(&PostParams::default(), &obj).await {
                Ok(_) => {
                    tracing::debug!(kind = %gvk.kind, %name, "created");
                    report.created += 1;
                }
                Err(e) if is_status(&e, 409) => {
                    if gvk.kind == "Secret" || gvk.kind == "Namespace" {
                        report.kept += 1;
                        continue;
                    }
                    let existing = api
                        .get(&name)
                        .await
                        .with_context(|| format!("Failed to get existing {} {}", gvk.kind, name))?;
                    obj.metadata.resource_version = existing.resource_version();
                    api.replace(&name, &PostParams::default(), &obj)
                        .await
                        .with_context(|| format!("Failed to update {} {}", gvk.kind, name))?;
                    tracing::debug!(kind = %gvk.kind, %name, "updated");
                    report.updated += 1;
                }
                Err(e) => {
                    return Err(anyhow::Error::new(e)
                        .context(format!("Failed to create {} {}", gvk.kind, name))
                        .into());
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
        self.ensure_namespace(namespace).await?;
        let api = self.secrets(namespace);
        let name = secret_object_name(repo_id);
        let existing = api
            .get_opt(&name)
            .await
            .with_context(|| format!("Failed to read secret {}", name))?;

        match existing {
            Some(mut secret) => {
                secret
                    .data
                    .get_or_insert_with(BTreeMap::new)
                    .insert(key.to_string(), ByteString(value.as_bytes().to_vec()));
                api.replace(&name, &PostParams::default(), &secret)
                    .await
                    .with_context(|| format!("Failed to update secret {}", name))?;
            }
            None => {
                let secret = Secret {
                    metadata: ObjectMeta {
                        name: Some(name.clone()),
                        namespace: Some(namespace.to_string()),
                        ..Default::default()
                    },
                    data: Some(BTreeMap::from([(
                        key.to_string(),
                        ByteString(value.as_bytes().to_vec()),
                    )])),
                    type_: Some("Opaque".to_string()),
                    ..Default::default()
                };
                api.create(&PostParams::default(), &secret)
                    .await
                    .with_context(|| format!("Failed to create secret {}", name))?;
            }
        }
        Ok(())
    }

    async fn get_secret(&self, namespace: &str, repo_id: &str, key: &str) -> Result<String, ClusterError> {
        let name = secret_object_name(repo_id);
        let secret = self
            .secrets(namespace)
            .get_opt(&name)
            .await
            .with_context(|| format!("Failed to read secret {}", name))?
            .ok_or(ClusterError::SecretNotFound)?;
        let bytes = secret
            .data
            .and_then(|mut data| data.remove(key))
            .ok_or(ClusterError::SecretNotFound)?;
        String::from_utf8(bytes.0)
            .map_err(|_| anyhow::anyhow!("secret {} is not valid UTF-8", key).into())
    }

    async fn remove_secret(&self, namespace: &str, repo_id: &str, key: &str) -> Result<(), ClusterError> {
        let api = self.secrets(namespace);
        let name = secret_object_name(repo_id);
        let Some(mut secret) = api
            .get_opt(&name)
            .await
            .with_context(|| format!("Failed to read secret {}", name))?
        else {
            return Ok(());
        };

        let data = secret.data.get_or_insert_with(BTreeMap::new);
        if data.remove(key).is_none() {
            return Ok(());
        }
        if data.is_empty() {
            api.delete(&name, &DeleteParams::default())
                .await
                .with_context(|| format!("Failed to delete secret {}", name))?;
        } else {
            api.replace(&name, &PostParams::default(), &secret)
                .await
                .with_context(|| format!("Failed to update secret {}", name))?;
        }
        Ok(())
    }

    async fn stream_logs(
        &self,
        namespace: &str,
        stream_id: &str,
        cancel: CancellationToken,
    ) -> Result<mpsc::Receiver<ProgressMessage>, ClusterError> {
        let pods: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let list = pods
            .list(&ListParams::default())
            .await
            .with_context(|| format!("Failed to list pods in {}", namespace))?;
        if list.items.is_empty() {
            return Err(ClusterError::NoPodsRunning);
        }

        let (tx, rx) = mpsc::channel(super::progress::BUFFER_SIZE);
        let params = LogParams {
            follow: true,
            tail_lines: Some(LOG_TAIL_LINES),
            timestamps: true,
            ..Default::default()
        };
        for pod in list.items {
            let pods = pods.clone();
            let params = params.clone();
            let tx = tx.clone();
            let cancel = cancel.clone();
            let stream_id = stream_id.to_string();
            let pod_name = pod.name_any();
            tokio::spawn(async move {
                let reader = match pods.log_stream(&pod_name, &params).await {
                    Ok(reader) => reader,
                    Err(e) => {
                        let msg = ProgressMessage::error(
                            &stream_id,
                            "FAILED_GET_LOGS",
                            format!("failed to get log stream of {}: {}", pod_name, e),
                        );
                        let _ = tx.send(msg).await;
                        return;
                    }
                };
                let mut lines = Box::pin(reader.lines());
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        line = lines.next() => match line {
                            Some(Ok(line)) => {
                                if tx.send(ProgressMessage::info(&stream_id, line)).await.is_err() {
                                    break;
                                }
                            }
                            Some(Err(e)) => {
                                tracing::warn!(pod = %pod_name, error = %e, "log stream failed");
                                break;
                            }
                            None => break,
                        }
                    }
                }
            });
        }
        Ok(rx)
    }

    async fn get_workload_stats(&self, namespace: &str) -> Result<WorkloadStats, ClusterError> {
        let deployments: Api<Deployment> = Api::namespaced(self.client.clone(), namespace);
        let list = deployments
            .list(&ListParams::default())
            .await
            .with_context(|| format!("Failed to list deployments in {}", namespace))?;
        let deployment = list.items.into_iter().next().ok_or(ClusterError::NoPodsRunning)?;
        let spec = deployment.spec.clone().unwrap_or_default();
        let desired = spec.replicas.unwrap_or(1);
        let selector = spec
            .selector
            .match_labels
            .unwrap_or_default()
            .into_iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect::<Vec<_>>()
            .join(",");

        let pods: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let pods = pods
            .list(&ListParams::default().labels(&selector))
            .await
            .with_context(|| format!("Failed to list pods in {}", namespace))?;

        let observed = pods.items.into_iter().map(|pod| {
            let phase = PodPhase::from_phase(pod.status.as_ref().and_then(|s| s.phase.as_deref()));
            let image = pod
                .spec
                .and_then(|s| s.containers.into_iter().next())
                .and_then(|c| c.image)
                .unwrap_or_default();
            (phase, image)
        });
        Ok(aggregate_workload(&deployment.name_any(), desired, observed))
    }

    async fn remove_namespace(&self, namespace: &str) -> Result<(), ClusterError> {
        let api: Api<Namespace> = Api::all(self.client.clone());
        match api.delete(namespace, &DeleteParams::default()).await {
            Ok(_) => {
                tracing::info!(namespace, "namespace removed");
                Ok(())
            }
            Err(e) if is_status(&e, 404) => Ok(()),
            Err(e) => Err(anyhow::Error::new(e)
                .context(format!("Failed to delete namespace {}", namespace))
                .into()),
        }
    }
}
