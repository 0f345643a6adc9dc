//! The `Space` manifest (`tq.json` / `tq.yaml`) a repository ships at its
//! root, with defaulting and validation.

use std::collections::BTreeMap;
use std::path::{Component, Path};
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

pub const DEFAULT_DOCKERFILE_PATH: &str = "Dockerfile";
pub const DEFAULT_DOCKER_CONTEXT: &str = ".";
pub const DEFAULT_REPLICAS: u32 = 1;
pub const DEFAULT_CPU_MILLIS: u32 = 1000;
pub const DEFAULT_MEMORY_MIB: u32 = 2048;
pub const DEFAULT_DISK_GIB: u32 = 20;

static SERVICE_NAME_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-z0-9]([-a-z0-9]*[a-z0-9])?$").expect("valid regex"));
static ENV_KEY_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Z_][A-Z0-9_]*$").expect("valid regex"));

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct Space {
    /// Scope key of the space; assigned from the repository id at deploy time.
    #[serde(default)]
    pub key: String,
    #[serde(default)]
    pub region: String,
    #[serde(default)]
    pub version: String,
    pub service: Service,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct Service {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub dockerfile_path: String,
    #[serde(default)]
    pub docker_context: String,
    #[serde(default)]
    pub http_port: u32,
    #[serde(default)]
    pub replicas: u32,
    #[serde(default)]
    pub computation_resource: ComputationResource,
    #[serde(default)]
    pub build_envs: BTreeMap<String, String>,
    #[serde(default)]
    pub runtime_envs: BTreeMap<String, String>,
    #[serde(default)]
    pub build_secrets: Vec<String>,
    #[serde(default)]
    pub runtime_secrets: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ComputationResource {
    #[serde(default, alias = "cpuUnits")]
    pub cpu_millis: u32,
    #[serde(default, rename = "memoryMiB", alias = "memoryMibs")]
    pub memory_mib: u32,
    #[serde(default, rename = "diskGiB", alias = "diskGibs")]
    pub disk_gib: u32,
}

impl Space {
    /// Fill defaults, then check the service definition.
    pub fn validate(&mut self) -> Result<(), String> {
        let service = &mut self.service;
        if service.name.is_empty() {
            return Err("service.name required".to_string());
        }
        if service.http_port == 0 {
            return Err("service.httpPort required".to_string());
        }
        if !SERVICE_NAME_RE.is_match(&service.name) || service.name.len() > 63 {
            return Err(format!(
                "service.name {:?} must be kebab-case (lowercase letters, digits and '-')",
                service.name
            ));
        }
        if service.http_port > 65535 {
            return Err(format!(
                "service.httpPort {} out of range 1-65535",
                service.http_port
            ));
        }

        if service.dockerfile_path.is_empty() {
            service.dockerfile_path = DEFAULT_DOCKERFILE_PATH.to_string();
        }
        if service.docker_context.is_empty() {
            service.docker_context = DEFAULT_DOCKER_CONTEXT.to_string();
        }
        check_repo_path("service.dockerfilePath", &service.dockerfile_path)?;
        check_repo_path("service.dockerContext", &service.docker_context)?;
        if service.replicas == 0 {
            service.replicas = DEFAULT_REPLICAS;
        }
        let compute = &mut service.computation_resource;
        if compute.cpu_millis == 0 {
            compute.cpu_millis = DEFAULT_CPU_MILLIS;
        }
        if compute.memory_mib == 0 {
            compute.memory_mib = DEFAULT_MEMORY_MIB;
        }
        if compute.disk_gib == 0 {
            compute.disk_gib = DEFAULT_DISK_GIB;
        }

        for key in service.build_envs.keys().chain(service.runtime_envs.keys()) {
            if !ENV_KEY_RE.is_match(key) {
                return Err(format!("env key {:?} must match [A-Z_][A-Z0-9_]*", key));
            }
        }
        Ok(())
    }
}

/// Build inputs are joined onto the clone directory, so they must stay
/// relative and never climb out of it.
fn check_repo_path(field: &str, value: &str) -> Result<(), String> {
    let escapes = Path::new(value).components().any(|c| {
        matches!(
            c,
            Component::RootDir | Component::Prefix(_) | Component::ParentDir
        )
    });
    if escapes {
        return Err(format!(
            "{} {:?} must be a relative path inside the repository",
            field, value
        ));
    }
    Ok(())
}
