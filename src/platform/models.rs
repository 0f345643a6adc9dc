use std::collections::BTreeMap;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use super::space::Space;

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct UserInfo {
    pub id: String,
    pub email: String,
    pub display_name: String,
    #[serde(default)]
    pub current_workspace: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct Workspace {
    pub id: String,
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct Installation {
    pub id: String,
    pub vcs_installation_id: i64,
    pub owner: String,
    pub workspace_id: Option<String>,
}

/// A repository as the VCS provider reports it in installation payloads.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, ToSchema)]
pub struct InstalledRepository {
    pub id: i64,
    pub full_name: String,
    #[serde(default)]
    pub private: bool,
    #[serde(default)]
    pub default_branch: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct Repository {
    pub id: String,
    pub installation_id: i64,
    pub vcs_id: i64,
    pub full_name: String,
    pub default_branch: String,
    pub private: bool,
    pub connected_branch: Option<String>,
    pub webhook_id: Option<i64>,
    pub connected: bool,
    pub workspace_id: Option<String>,
}

impl Repository {
    /// Branch a deploy without an explicit ref builds from.
    pub fn deploy_branch(&self) -> &str {
        self.connected_branch
            .as_deref()
            .filter(|b| !b.is_empty())
            .unwrap_or(&self.default_branch)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, ToSchema)]
#[serde(rename_all = "camelCase")]
pub enum DeploymentStatus {
    Init,
    Cloning,
    Building,
    Deploying,
    Done,
    Failed,
    RolledBack,
}

impl DeploymentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Init => "init",
            Self::Cloning => "cloning",
            Self::Building => "building",
            Self::Deploying => "deploying",
            Self::Done => "done",
            Self::Failed => "failed",
            Self::RolledBack => "rolledBack",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Failed | Self::RolledBack)
    }

    fn rank(&self) -> u8 {
        match self {
            Self::Init => 0,
            Self::Cloning => 1,
            Self::Building => 2,
            Self::Deploying => 3,
            Self::Done | Self::Failed => 4,
            Self::RolledBack => 5,
        }
    }

    /// Transitions only move forward; `done → rolledBack` is the one move
    /// out of a terminal state.
    pub fn can_transition(from: Self, to: Self) -> bool {
        if from == to {
            return !from.is_terminal();
        }
        match from {
            Self::Done => to == Self::RolledBack,
            Self::Failed | Self::RolledBack => false,
            _ => to == Self::Failed || (to != Self::RolledBack && to.rank() > from.rank()),
        }
    }
}

impl FromStr for DeploymentStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "init" => Ok(Self::Init),
            "cloning" => Ok(Self::Cloning),
            "building" => Ok(Self::Building),
            "deploying" => Ok(Self::Deploying),
            "done" => Ok(Self::Done),
            "failed" => Ok(Self::Failed),
            "rolledBack" => Ok(Self::RolledBack),
            _ => Err(format!("Invalid deployment status: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct AppDeployment {
    pub id: String,
    pub repo_id: String,
    pub space: Space,
    pub sha: String,
    pub build_tag: String,
    pub branch: String,
    pub tag: String,
    pub message: String,
    pub user_display_name: String,
    pub status: DeploymentStatus,
    pub error: Option<String>,
    pub rolled_back_from_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl AppDeployment {
    /// A fresh `init` row; the store assigns id and timestamps on save.
    pub fn new(repo_id: &str, user_display_name: &str) -> Self {
        let now = Utc::now();
        Self {
            id: String::new(),
            repo_id: repo_id.to_string(),
            space: Space::default(),
            sha: String::new(),
            build_tag: String::new(),
            branch: String::new(),
            tag: String::new(),
            message: String::new(),
            user_display_name: user_display_name.to_string(),
            status: DeploymentStatus::Init,
            error: None,
            rolled_back_from_id: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Build tags are the first 12 hex characters of the commit sha.
pub fn build_tag(sha: &str) -> String {
    sha.chars().take(12).collect()
}

/// Row shape returned by `getDeploymentHistory`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentHistoryItem {
    pub id: String,
    pub repo_id: String,
    pub status: DeploymentStatus,
    pub commit_hash: String,
    pub build_tag: String,
    pub message: String,
    pub timestamp: DateTime<Utc>,
    pub user_display_name: String,
    pub rolled_back_from_id: Option<String>,
}

impl From<AppDeployment> for DeploymentHistoryItem {
    fn from(d: AppDeployment) -> Self {
        Self {
            id: d.id,
            repo_id: d.repo_id,
            status: d.status,
            commit_hash: d.sha,
            build_tag: d.build_tag,
            message: d.message,
            timestamp: d.created_at,
            user_display_name: d.user_display_name,
            rolled_back_from_id: d.rolled_back_from_id,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct Image {
    pub registry: String,
    pub repository: String,
    pub tag: String,
}

impl Image {
    pub fn full_path(&self) -> String {
        format!("{}/{}:{}", self.registry, self.repository, self.tag)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct SecretKey {
    pub workspace_id: String,
    pub repo_id: String,
    pub key: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum Level {
    Debug,
    Info,
    Warn,
    Error,
}

impl Level {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ProgressMessage {
    pub deployment_id: String,
    pub payload: String,
    pub level: Level,
    #[serde(rename = "final")]
    pub is_final: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl ProgressMessage {
    pub fn new(deployment_id: &str, level: Level, payload: impl Into<String>) -> Self {
        Self {
            deployment_id: deployment_id.to_string(),
            payload: payload.into(),
            level,
            is_final: false,
            error_code: None,
            timestamp: Utc::now(),
        }
    }

    pub fn info(deployment_id: &str, payload: impl Into<String>) -> Self {
        Self::new(deployment_id, Level::Info, payload)
    }

    pub fn error(deployment_id: &str, code: &str, payload: impl Into<String>) -> Self {
        Self {
            error_code: Some(code.to_string()),
            ..Self::new(deployment_id, Level::Error, payload)
        }
    }

    pub fn finished(mut self) -> Self {
        self.is_final = true;
        self
    }

    /// The final message of a finished deployment, rebuilt from its row for
    /// when the live history is gone.
    pub fn outcome(deployment: &AppDeployment) -> Self {
        let msg = match deployment.status {
            DeploymentStatus::Failed => Self::error(
                &deployment.id,
                "DEPLOYMENT_FAILED",
                deployment.error.clone().unwrap_or_else(|| "deployment failed".to_string()),
            ),
            _ => Self::info(
                &deployment.id,
                format!("deployment {}", deployment.status.as_str()),
            ),
        };
        msg.finished()
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, ToSchema)]
pub struct ReplicaCounts {
    pub desired: i32,
    pub running: i32,
    pub pending: i32,
    pub failed: i32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, ToSchema)]
pub struct VersionReplicas {
    pub running: i32,
    pub pending: i32,
    pub failed: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, ToSchema)]
pub struct VersionInfo {
    pub version: String,
    pub replicas: VersionReplicas,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum OverallStatus {
    Healthy,
    Degraded,
    Failing,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct WorkloadStats {
    pub name: String,
    pub replicas: ReplicaCounts,
    pub versions: Vec<VersionInfo>,
    pub overall_status: OverallStatus,
}

/// Phase of a pod as seen by the stats aggregation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PodPhase {
    Running,
    Pending,
    Failed,
}

impl PodPhase {
    /// Unknown or succeeded phases count as failed for a long-running service.
    pub fn from_phase(phase: Option<&str>) -> Self {
        match phase {
            Some("Running") => Self::Running,
            Some("Pending") => Self::Pending,
            _ => Self::Failed,
        }
    }
}

/// Aggregate pod phases and image tags into `WorkloadStats`.
pub fn aggregate_workload(
    name: &str,
    desired: i32,
    pods: impl IntoIterator<Item = (PodPhase, String)>,
) -> WorkloadStats {
    let mut replicas = ReplicaCounts {
        desired,
        ..Default::default()
    };
    let mut versions: BTreeMap<String, VersionReplicas> = BTreeMap::new();

    for (phase, image) in pods {
        let version = image
            .rsplit_once(':')
            .map(|(_, tag)| tag.to_string())
            .unwrap_or_else(|| "latest".to_string());
        let entry = versions.entry(version).or_default();
        match phase {
            PodPhase::Running => {
                replicas.running += 1;
                entry.running += 1;
            }
            PodPhase::Pending => {
                replicas.pending += 1;
                entry.pending += 1;
            }
            PodPhase::Failed => {
                replicas.failed += 1;
                entry.failed += 1;
            }
        }
    }

    let overall_status = if replicas.failed > 0 {
        OverallStatus::Failing
    } else if replicas.pending > 0 || replicas.running < replicas.desired {
        OverallStatus::Degraded
    } else {
        OverallStatus::Healthy
    };

    WorkloadStats {
        name: name.to_string(),
        replicas,
        versions: versions
            .into_iter()
            .map(|(version, replicas)| VersionInfo { version, replicas })
            .collect(),
        overall_status,
    }
}
