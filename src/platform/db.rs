use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{Connection, OptionalExtension, Row, params};

use super::models::*;
use super::space::Space;
use super::store::Store;
use crate::errors::StoreError;

type Result<T, E = StoreError> = std::result::Result<T, E>;

/// Built-in schema, applied in order and recorded in `schema_migrations`.
const MIGRATIONS: &[(i64, &str, &str)] = &[
    (
        1,
        "identity",
        "
        CREATE TABLE IF NOT EXISTS workspaces (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL UNIQUE,
            created_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS users (
            id TEXT PRIMARY KEY,
            email TEXT NOT NULL UNIQUE,
            display_name TEXT NOT NULL UNIQUE,
            current_workspace TEXT REFERENCES workspaces(id),
            created_at TEXT NOT NULL
        );
        ",
    ),
    (
        2,
        "github",
        "
        CREATE TABLE IF NOT EXISTS installations (
            id TEXT PRIMARY KEY,
            vcs_installation_id INTEGER NOT NULL UNIQUE,
            owner TEXT NOT NULL,
            workspace_id TEXT REFERENCES workspaces(id) ON DELETE SET NULL,
            created_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS repositories (
            id TEXT PRIMARY KEY,
            installation_id INTEGER NOT NULL
                REFERENCES installations(vcs_installation_id) ON DELETE CASCADE,
            vcs_id INTEGER NOT NULL UNIQUE,
            full_name TEXT NOT NULL,
            default_branch TEXT NOT NULL DEFAULT 'main',
            private INTEGER NOT NULL DEFAULT 0,
            connected_branch TEXT,
            webhook_id INTEGER,
            connected INTEGER NOT NULL DEFAULT 0,
            created_at TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_installations_owner ON installations(owner);
        CREATE INDEX IF NOT EXISTS idx_repositories_installation ON repositories(installation_id);
        ",
    ),
    (
        3,
        "deployments",
        "
        CREATE TABLE IF NOT EXISTS deployments (
            id TEXT PRIMARY KEY,
            repo_id TEXT NOT NULL REFERENCES repositories(id) ON DELETE CASCADE,
            space TEXT NOT NULL DEFAULT '{}',
            sha TEXT NOT NULL DEFAULT '',
            build_tag TEXT NOT NULL DEFAULT '',
            branch TEXT NOT NULL DEFAULT '',
            tag TEXT NOT NULL DEFAULT '',
            message TEXT NOT NULL DEFAULT '',
            user_display_name TEXT NOT NULL DEFAULT '',
            status TEXT NOT NULL DEFAULT 'init',
            error TEXT,
            rolled_back_from_id TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_deployments_repo ON deployments(repo_id);
        CREATE INDEX IF NOT EXISTS idx_deployments_repo_status ON deployments(repo_id, status);
        ",
    ),
    (
        4,
        "secrets_and_sessions",
        "
        CREATE TABLE IF NOT EXISTS repository_secret_keys (
            workspace_id TEXT NOT NULL,
            repo_id TEXT NOT NULL REFERENCES repositories(id) ON DELETE CASCADE,
            key TEXT NOT NULL,
            created_at TEXT NOT NULL,
            PRIMARY KEY (workspace_id, repo_id, key)
        );

        CREATE TABLE IF NOT EXISTS auth_states (
            state TEXT PRIMARY KEY,
            expires_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS token_pairs (
            user_id TEXT PRIMARY KEY REFERENCES users(id) ON DELETE CASCADE,
            access_token TEXT NOT NULL,
            refresh_token TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );
        ",
    ),
];

const NON_TERMINAL: &str = "('init', 'cloning', 'building', 'deploying')";

const REPO_COLUMNS: &str = "r.id, r.installation_id, r.vcs_id, r.full_name, r.default_branch,
     r.private, r.connected_branch, r.webhook_id, r.connected, i.workspace_id";

const DEPLOYMENT_COLUMNS: &str = "id, repo_id, space, sha, build_tag, branch, tag, message,
     user_display_name, status, error, rolled_back_from_id, created_at, updated_at";

fn now() -> String {
    timestamp(Utc::now())
}

fn timestamp(t: DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_timestamp(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|t| t.with_timezone(&Utc))
        .with_context(|| format!("Failed to parse timestamp {:?}", s))
        .map_err(StoreError::from)
}

fn new_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Async-safe handle to the platform database.
///
/// Wraps `PlatformDb` behind `Arc<Mutex>` and runs all access on tokio's
/// blocking pool via `spawn_blocking`.
#[derive(Clone)]
pub struct DbHandle {
    inner: Arc<std::sync::Mutex<PlatformDb>>,
}

impl DbHandle {
    pub fn new(db: PlatformDb) -> Self {
        Self {
            inner: Arc::new(std::sync::Mutex::new(db)),
        }
    }

    /// Run a closure with access to the database on a blocking thread.
    pub async fn call<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&PlatformDb) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let db = self.inner.clone();
        tokio::task::spawn_blocking(move || {
            let guard = db
                .lock()
                .map_err(|e| anyhow::anyhow!("DB lock poisoned: {}", e))?;
            f(&guard)
        })
        .await
        .context("DB task panicked")?
    }
}

pub struct PlatformDb {
    conn: Connection,
}

impl PlatformDb {
    /// Open (or create) a SQLite database and apply migrations, including
    /// `*.sql` files from `migrations_dir` when given.
    pub fn new(path: &Path, migrations_dir: Option<&Path>) -> Result<Self> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let conn = Connection::open(path).context("Failed to open SQLite database")?;
        let db = Self { conn };
        db.init(migrations_dir)?;
        Ok(db)
    }

    /// Create an in-memory SQLite database (for testing).
    pub fn new_in_memory() -> Result<Self> {
        let conn =
            Connection::open_in_memory().context("Failed to open in-memory SQLite database")?;
        let db = Self { conn };
        db.init(None)?;
        Ok(db)
    }

    fn init(&self, migrations_dir: Option<&Path>) -> Result<()> {
        self.conn
            .execute_batch("PRAGMA foreign_keys = ON; PRAGMA busy_timeout = 5000;")
            .context("Failed to enable foreign keys")?;
        self.run_migrations(migrations_dir)
            .context("Failed to run migrations")?;
        Ok(())
    }

    fn run_migrations(&self, migrations_dir: Option<&Path>) -> anyhow::Result<()> {
        self.conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS schema_migrations (
                version INTEGER PRIMARY KEY,
                name TEXT NOT NULL,
                applied_at TEXT NOT NULL
            );",
        )?;

        let mut pending: Vec<(i64, String, String)> = MIGRATIONS
            .iter()
            .map(|(v, n, sql)| (*v, n.to_string(), sql.to_string()))
            .collect();
        if let Some(dir) = migrations_dir {
            pending.extend(load_migration_files(dir)?);
        }
        pending.sort_by_key(|(v, _, _)| *v);

        for (version, name, sql) in pending {
            let applied: bool = self.conn.query_row(
                "SELECT COUNT(*) > 0 FROM schema_migrations WHERE version = ?1",
                params![version],
                |row| row.get(0),
            )?;
            if applied {
                continue;
            }
            let tx = self.conn.unchecked_transaction()?;
            tx.execute_batch(&sql)
                .with_context(|| format!("Migration {} ({}) failed", version, name))?;
            tx.execute(
                "INSERT INTO schema_migrations (version, name, applied_at) VALUES (?1, ?2, ?3)",
                params![version, name, now()],
            )?;
            tx.commit()?;
            tracing::info!(version, name = %name, "applied migration");
        }
        Ok(())
    }

    /// Versions recorded in `schema_migrations`, ascending.
    pub fn applied_migrations(&self) -> Result<Vec<i64>> {
        let mut stmt = self
            .conn
            .prepare("SELECT version FROM schema_migrations ORDER BY version")
            .context("Failed to prepare migrations query")?;
        let versions = stmt
            .query_map([], |row| row.get(0))
            .context("Failed to query migrations")?
            .collect::<rusqlite::Result<Vec<i64>>>()
            .context("Failed to read migrations")?;
        Ok(versions)
    }

    // ── Users & workspaces ────────────────────────────────────────────

    pub fn get_or_create_user(&self, user: &UserInfo) -> Result<UserInfo> {
        if let Some(existing) = self.find_user("email", &user.email)? {
            return Ok(existing);
        }

        let tx = self
            .conn
            .unchecked_transaction()
            .context("Failed to begin transaction")?;

        let workspace_id = new_id();
        let taken: bool = tx
            .query_row(
                "SELECT COUNT(*) > 0 FROM workspaces WHERE name = ?1",
                params![user.display_name],
                |row| row.get(0),
            )
            .context("Failed to check workspace name")?;
        let workspace_name = if taken {
            format!("{}-{}", user.display_name, &workspace_id[..8])
        } else {
            user.display_name.clone()
        };
        tx.execute(
            "INSERT INTO workspaces (id, name, created_at) VALUES (?1, ?2, ?3)",
            params![workspace_id, workspace_name, now()],
        )
        .context("Failed to insert workspace")?;

        let user_id = if user.id.is_empty() {
            new_id()
        } else {
            user.id.clone()
        };
        tx.execute(
            "INSERT INTO users (id, email, display_name, current_workspace, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![user_id, user.email, user.display_name, workspace_id, now()],
        )
        .context("Failed to insert user")?;

        // Installations created before the owner's first login.
        tx.execute(
            "UPDATE installations SET workspace_id = ?1 WHERE owner = ?2 AND workspace_id IS NULL",
            params![workspace_id, user.display_name],
        )
        .context("Failed to attach installations")?;

        tx.commit().context("Failed to commit user")?;
        self.find_user("id", &user_id)?
            .ok_or(StoreError::UserNotFound)
    }

    fn find_user(&self, column: &str, value: &str) -> Result<Option<UserInfo>> {
        let sql = format!(
            "SELECT id, email, display_name, COALESCE(current_workspace, '') FROM users WHERE {} = ?1",
            column
        );
        let user = self
            .conn
            .query_row(&sql, params![value], |row| {
                Ok(UserInfo {
                    id: row.get(0)?,
                    email: row.get(1)?,
                    display_name: row.get(2)?,
                    current_workspace: row.get(3)?,
                })
            })
            .optional()
            .context("Failed to query user")?;
        Ok(user)
    }

    pub fn get_user(&self, user_id: &str) -> Result<UserInfo> {
        self.find_user("id", user_id)?
            .ok_or(StoreError::UserNotFound)
    }

    pub fn get_workspace(&self, workspace_id: &str) -> Result<Workspace> {
        self.conn
            .query_row(
                "SELECT id, name FROM workspaces WHERE id = ?1",
                params![workspace_id],
                |row| {
                    Ok(Workspace {
                        id: row.get(0)?,
                        name: row.get(1)?,
                    })
                },
            )
            .optional()
            .context("Failed to query workspace")?
            .ok_or(StoreError::WorkspaceNotFound)
    }

    // ── Installations & repositories ──────────────────────────────────

    fn upsert_installation(&self, installation_id: i64, owner: &str) -> Result<()> {
        let workspace_id: Option<String> = self
            .conn
            .query_row(
                "SELECT current_workspace FROM users WHERE display_name = ?1",
                params![owner],
                |row| row.get(0),
            )
            .optional()
            .context("Failed to look up installation owner")?
            .flatten();

        self.conn
            .execute(
                "INSERT INTO installations (id, vcs_installation_id, owner, workspace_id, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(vcs_installation_id) DO UPDATE SET
                    owner = excluded.owner,
                    workspace_id = COALESCE(installations.workspace_id, excluded.workspace_id)",
                params![new_id(), installation_id, owner, workspace_id, now()],
            )
            .context("Failed to upsert installation")?;
        Ok(())
    }

    fn upsert_repo(&self, installation_id: i64, repo: &InstalledRepository) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO repositories
                    (id, installation_id, vcs_id, full_name, default_branch, private, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                 ON CONFLICT(vcs_id) DO UPDATE SET
                    installation_id = excluded.installation_id,
                    full_name = excluded.full_name,
                    private = excluded.private,
                    default_branch = excluded.default_branch",
                params![
                    new_id(),
                    installation_id,
                    repo.id,
                    repo.full_name,
                    repo.default_branch.as_deref().unwrap_or("main"),
                    repo.private,
                    now(),
                ],
            )
            .context("Failed to upsert repository")?;
        Ok(())
    }

    pub fn link_github(
        &self,
        installation_id: i64,
        owner: &str,
        repos: &[InstalledRepository],
    ) -> Result<Installation> {
        let tx = self
            .conn
            .unchecked_transaction()
            .context("Failed to begin transaction")?;
        self.upsert_installation(installation_id, owner)?;
        for repo in repos {
            self.upsert_repo(installation_id, repo)?;
        }

        let keep: Vec<i64> = repos.iter().map(|r| r.id).collect();
        let keep_json = serde_json::to_string(&keep).context("Failed to encode repo ids")?;
        tx.execute(
            "DELETE FROM repositories WHERE installation_id = ?1
               AND vcs_id NOT IN (SELECT value FROM json_each(?2))",
            params![installation_id, keep_json],
        )
        .context("Failed to prune repositories")?;
        tx.commit().context("Failed to commit installation")?;

        self.get_installation(installation_id)
    }

    pub fn save_github_repos(
        &self,
        installation_id: i64,
        owner: &str,
        repos: &[InstalledRepository],
    ) -> Result<Vec<Repository>> {
        let tx = self
            .conn
            .unchecked_transaction()
            .context("Failed to begin transaction")?;
        self.upsert_installation(installation_id, owner)?;
        for repo in repos {
            self.upsert_repo(installation_id, repo)?;
        }
        tx.commit().context("Failed to commit repositories")?;

        repos
            .iter()
            .map(|r| self.get_repo_by_vcs_id(r.id))
            .collect()
    }

    pub fn remove_github_repos(
        &self,
        installation_id: i64,
        repos: &[InstalledRepository],
    ) -> Result<()> {
        let tx = self
            .conn
            .unchecked_transaction()
            .context("Failed to begin transaction")?;
        for repo in repos {
            tx.execute(
                "DELETE FROM repositories WHERE installation_id = ?1 AND vcs_id = ?2",
                params![installation_id, repo.id],
            )
            .context("Failed to delete repository")?;
        }
        tx.commit().context("Failed to commit repository removal")?;
        Ok(())
    }

    pub fn remove_installation(&self, installation_id: i64) -> Result<Vec<Repository>> {
        let repos = self.query_repos(
            "WHERE r.installation_id = ?1",
            params![installation_id],
        )?;
        let count = self
            .conn
            .execute(
                "DELETE FROM installations WHERE vcs_installation_id = ?1",
                params![installation_id],
            )
            .context("Failed to delete installation")?;
        if count == 0 {
            return Err(StoreError::InstallationNotFound);
        }
        Ok(repos)
    }

    pub fn get_installation(&self, installation_id: i64) -> Result<Installation> {
        self.conn
            .query_row(
                "SELECT id, vcs_installation_id, owner, workspace_id
                 FROM installations WHERE vcs_installation_id = ?1",
                params![installation_id],
                |row| {
                    Ok(Installation {
                        id: row.get(0)?,
                        vcs_installation_id: row.get(1)?,
                        owner: row.get(2)?,
                        workspace_id: row.get(3)?,
                    })
                },
            )
            .optional()
            .context("Failed to query installation")?
            .ok_or(StoreError::InstallationNotFound)
    }

    fn query_repos(&self, filter: &str, params: impl rusqlite::Params) -> Result<Vec<Repository>> {
        let sql = format!(
            "SELECT {} FROM repositories r
             JOIN installations i ON i.vcs_installation_id = r.installation_id
             {} ORDER BY r.full_name",
            REPO_COLUMNS, filter
        );
        let mut stmt = self
            .conn
            .prepare(&sql)
            .context("Failed to prepare repository query")?;
        let repos = stmt
            .query_map(params, repo_from_row)
            .context("Failed to query repositories")?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("Failed to read repository row")?;
        Ok(repos)
    }

    pub fn get_github_repos(&self, user_id: &str) -> Result<Vec<Repository>> {
        let user = self.get_user(user_id)?;
        self.query_repos(
            "WHERE i.workspace_id = ?1 OR i.owner = ?2",
            params![user.current_workspace, user.display_name],
        )
    }

    pub fn get_repo_by_id(&self, user_id: &str, repo_id: &str) -> Result<Repository> {
        let user = self.get_user(user_id)?;
        self.query_repos(
            "WHERE r.id = ?1 AND (i.workspace_id = ?2 OR i.owner = ?3)",
            params![repo_id, user.current_workspace, user.display_name],
        )?
        .into_iter()
        .next()
        .ok_or(StoreError::RepoNotFound)
    }

    pub fn get_repo_by_vcs_id(&self, vcs_id: i64) -> Result<Repository> {
        self.query_repos("WHERE r.vcs_id = ?1", params![vcs_id])?
            .into_iter()
            .next()
            .ok_or(StoreError::RepoNotFound)
    }

    pub fn connect_repo(&self, user_id: &str, repo_id: &str, branch: &str) -> Result<Repository> {
        // Visibility check before the write.
        self.get_repo_by_id(user_id, repo_id)?;
        self.conn
            .execute(
                "UPDATE repositories SET connected_branch = ?1, connected = 1 WHERE id = ?2",
                params![branch, repo_id],
            )
            .context("Failed to connect repository")?;
        self.get_repo_by_id(user_id, repo_id)
    }

    pub fn get_installation_id(&self, workspace_id: &str, repo_full_name: &str) -> Result<i64> {
        self.conn
            .query_row(
                "SELECT i.vcs_installation_id FROM repositories r
                 JOIN installations i ON i.vcs_installation_id = r.installation_id
                 WHERE r.full_name = ?1 AND (i.workspace_id = ?2 OR i.workspace_id IS NULL)
                 ORDER BY i.workspace_id IS NULL
                 LIMIT 1",
                params![repo_full_name, workspace_id],
                |row| row.get(0),
            )
            .optional()
            .context("Failed to query installation id")?
            .ok_or(StoreError::InstallationNotFound)
    }

    // ── Deployments ───────────────────────────────────────────────────

    pub fn save_deployment(&self, d: &AppDeployment) -> Result<AppDeployment> {
        let id = if d.id.is_empty() { new_id() } else { d.id.clone() };
        let ts = now();
        let space = serde_json::to_string(&d.space).context("Failed to encode space")?;
        self.conn
            .execute(
                "INSERT INTO deployments
                    (id, repo_id, space, sha, build_tag, branch, tag, message,
                     user_display_name, status, error, rolled_back_from_id, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?13)",
                params![
                    id,
                    d.repo_id,
                    space,
                    d.sha,
                    d.build_tag,
                    d.branch,
                    d.tag,
                    d.message,
                    d.user_display_name,
                    DeploymentStatus::Init.as_str(),
                    d.error,
                    d.rolled_back_from_id,
                    ts,
                ],
            )
            .map_err(|e| match e {
                rusqlite::Error::SqliteFailure(err, _)
                    if err.code == rusqlite::ErrorCode::ConstraintViolation =>
                {
                    StoreError::RepoNotFound
                }
                other => anyhow::Error::new(other)
                    .context("Failed to insert deployment")
                    .into(),
            })?;
        self.get_deployment(&id)
    }

    pub fn update_deployment(&self, d: &AppDeployment) -> Result<AppDeployment> {
        let tx = self
            .conn
            .unchecked_transaction()
            .context("Failed to begin transaction")?;
        let current: String = tx
            .query_row(
                "SELECT status FROM deployments WHERE id = ?1",
                params![d.id],
                |row| row.get(0),
            )
            .optional()
            .context("Failed to read deployment status")?
            .ok_or(StoreError::DeploymentNotFound)?;
        let current = DeploymentStatus::from_str(&current)
            .map_err(|e| anyhow::anyhow!(e))
            .context("Failed to parse deployment status")?;
        if !DeploymentStatus::can_transition(current, d.status) {
            return Err(StoreError::InvalidTransition {
                id: d.id.clone(),
                status: current.as_str().to_string(),
                next: d.status.as_str().to_string(),
            });
        }

        let space = serde_json::to_string(&d.space).context("Failed to encode space")?;
        tx.execute(
            "UPDATE deployments SET space = ?1, sha = ?2, build_tag = ?3, branch = ?4, tag = ?5,
                message = ?6, status = ?7, error = ?8, updated_at = ?9
             WHERE id = ?10",
            params![
                space,
                d.sha,
                d.build_tag,
                d.branch,
                d.tag,
                d.message,
                d.status.as_str(),
                d.error,
                now(),
                d.id,
            ],
        )
        .context("Failed to update deployment")?;
        tx.commit().context("Failed to commit deployment update")?;
        self.get_deployment(&d.id)
    }

    pub fn get_deployment(&self, id: &str) -> Result<AppDeployment> {
        let sql = format!("SELECT {} FROM deployments WHERE id = ?1", DEPLOYMENT_COLUMNS);
        let row = self
            .conn
            .query_row(&sql, params![id], DeploymentRow::from_row)
            .optional()
            .context("Failed to query deployment")?
            .ok_or(StoreError::DeploymentNotFound)?;
        row.into_deployment()
    }

    fn query_deployments(&self, filter: &str, repo_id: &str) -> Result<Vec<AppDeployment>> {
        let sql = format!(
            "SELECT {} FROM deployments WHERE repo_id = ?1 {} ORDER BY created_at DESC, rowid DESC",
            DEPLOYMENT_COLUMNS, filter
        );
        let mut stmt = self
            .conn
            .prepare(&sql)
            .context("Failed to prepare deployments query")?;
        let rows = stmt
            .query_map(params![repo_id], DeploymentRow::from_row)
            .context("Failed to query deployments")?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("Failed to read deployment row")?;
        rows.into_iter().map(DeploymentRow::into_deployment).collect()
    }

    pub fn get_deployments(&self, repo_id: &str) -> Result<Vec<AppDeployment>> {
        self.query_deployments("", repo_id)
    }

    pub fn get_deployment_history(&self, repo_id: &str) -> Result<Vec<DeploymentHistoryItem>> {
        Ok(self
            .query_deployments("AND status != 'init'", repo_id)?
            .into_iter()
            .map(DeploymentHistoryItem::from)
            .collect())
    }

    pub fn supersede_deployments(&self, repo_id: &str, keep_id: &str) -> Result<Vec<String>> {
        let tx = self
            .conn
            .unchecked_transaction()
            .context("Failed to begin transaction")?;
        let ids = {
            let mut stmt = tx
                .prepare(&format!(
                    "SELECT id FROM deployments WHERE repo_id = ?1 AND id != ?2 AND status IN {}",
                    NON_TERMINAL
                ))
                .context("Failed to prepare supersede query")?;
            stmt.query_map(params![repo_id, keep_id], |row| row.get::<_, String>(0))
                .context("Failed to query in-flight deployments")?
                .collect::<rusqlite::Result<Vec<_>>>()
                .context("Failed to read deployment id")?
        };
        tx.execute(
            &format!(
                "UPDATE deployments SET status = 'failed', error = 'superseded', updated_at = ?3
                 WHERE repo_id = ?1 AND id != ?2 AND status IN {}",
                NON_TERMINAL
            ),
            params![repo_id, keep_id, now()],
        )
        .context("Failed to supersede deployments")?;
        tx.commit().context("Failed to commit supersede")?;
        Ok(ids)
    }

    pub fn mark_rolled_back(&self, repo_id: &str, source_id: &str, keep_id: &str) -> Result<usize> {
        let count = self
            .conn
            .execute(
                "UPDATE deployments SET status = 'rolledBack', updated_at = ?4
                 WHERE repo_id = ?1 AND status = 'done' AND id != ?3
                   AND rowid > (SELECT rowid FROM deployments WHERE id = ?2)",
                params![repo_id, source_id, keep_id, now()],
            )
            .context("Failed to mark rolled back deployments")?;
        Ok(count)
    }

    // ── Secret keys ───────────────────────────────────────────────────

    pub fn save_secret(&self, workspace_id: &str, repo_id: &str, key: &str) -> Result<()> {
        self.conn
            .execute(
                "INSERT OR IGNORE INTO repository_secret_keys (workspace_id, repo_id, key, created_at)
                 VALUES (?1, ?2, ?3, ?4)",
                params![workspace_id, repo_id, key, now()],
            )
            .context("Failed to save secret key")?;
        Ok(())
    }

    pub fn remove_secret(&self, workspace_id: &str, repo_id: &str, key: &str) -> Result<()> {
        self.conn
            .execute(
                "DELETE FROM repository_secret_keys WHERE workspace_id = ?1 AND repo_id = ?2 AND key = ?3",
                params![workspace_id, repo_id, key],
            )
            .context("Failed to remove secret key")?;
        Ok(())
    }

    pub fn repository_secret_key_exists(
        &self,
        workspace_id: &str,
        repo_id: &str,
        key: &str,
    ) -> Result<bool> {
        let exists = self
            .conn
            .query_row(
                "SELECT COUNT(*) > 0 FROM repository_secret_keys
                 WHERE workspace_id = ?1 AND repo_id = ?2 AND key = ?3",
                params![workspace_id, repo_id, key],
                |row| row.get(0),
            )
            .context("Failed to check secret key")?;
        Ok(exists)
    }

    pub fn get_repository_secret_keys(&self, workspace_id: &str, repo_id: &str) -> Result<Vec<String>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT key FROM repository_secret_keys
                 WHERE workspace_id = ?1 AND repo_id = ?2 ORDER BY key",
            )
            .context("Failed to prepare secret keys query")?;
        let keys = stmt
            .query_map(params![workspace_id, repo_id], |row| row.get(0))
            .context("Failed to query secret keys")?
            .collect::<rusqlite::Result<Vec<String>>>()
            .context("Failed to read secret key")?;
        Ok(keys)
    }

    // ── Session state ─────────────────────────────────────────────────

    pub fn save_auth_state(&self, state: &str, expires_at: DateTime<Utc>) -> Result<()> {
        // Expired states are swept on every write.
        self.conn
            .execute(
                "DELETE FROM auth_states WHERE expires_at < ?1",
                params![now()],
            )
            .context("Failed to sweep auth states")?;
        self.conn
            .execute(
                "INSERT OR REPLACE INTO auth_states (state, expires_at) VALUES (?1, ?2)",
                params![state, timestamp(expires_at)],
            )
            .context("Failed to save auth state")?;
        Ok(())
    }

    pub fn take_auth_state(&self, state: &str) -> Result<Option<DateTime<Utc>>> {
        let expires_at: Option<String> = self
            .conn
            .query_row(
                "SELECT expires_at FROM auth_states WHERE state = ?1",
                params![state],
                |row| row.get(0),
            )
            .optional()
            .context("Failed to query auth state")?;
        self.conn
            .execute("DELETE FROM auth_states WHERE state = ?1", params![state])
            .context("Failed to delete auth state")?;
        expires_at.as_deref().map(parse_timestamp).transpose()
    }

    pub fn save_token_pair(&self, user_id: &str, access: &str, refresh: &str) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO token_pairs (user_id, access_token, refresh_token, updated_at)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(user_id) DO UPDATE SET
                    access_token = excluded.access_token,
                    refresh_token = excluded.refresh_token,
                    updated_at = excluded.updated_at",
                params![user_id, access, refresh, now()],
            )
            .context("Failed to save token pair")?;
        Ok(())
    }

    pub fn get_token_pair(&self, user_id: &str) -> Result<Option<(String, String)>> {
        let pair = self
            .conn
            .query_row(
                "SELECT access_token, refresh_token FROM token_pairs WHERE user_id = ?1",
                params![user_id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()
            .context("Failed to read token pair")?;
        Ok(pair)
    }

    pub fn delete_token_pair(&self, user_id: &str) -> Result<()> {
        self.conn
            .execute("DELETE FROM token_pairs WHERE user_id = ?1", params![user_id])
            .context("Failed to delete token pair")?;
        Ok(())
    }
}

/// `NNNN_name.sql` files from a migrations directory.
fn load_migration_files(dir: &Path) -> anyhow::Result<Vec<(i64, String, String)>> {
    let pattern = dir.join("*.sql");
    let pattern = pattern
        .to_str()
        .context("Migrations directory is not valid UTF-8")?;
    let mut files: Vec<PathBuf> = glob::glob(pattern)
        .context("Invalid migrations glob")?
        .filter_map(|entry| entry.ok())
        .collect();
    files.sort();

    let mut out = Vec::new();
    for path in files {
        let stem = path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or_default();
        let (version, name) = stem.split_once('_').unwrap_or((stem, ""));
        let Ok(version) = version.parse::<i64>() else {
            tracing::warn!(path = %path.display(), "skipping migration without numeric prefix");
            continue;
        };
        let sql = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        out.push((version, name.to_string(), sql));
    }
    Ok(out)
}

// ── Store impl ────────────────────────────────────────────────────────

#[async_trait]
impl Store for DbHandle {
    async fn get_or_create_user(&self, user: UserInfo) -> Result<UserInfo> {
        self.call(move |db| db.get_or_create_user(&user)).await
    }

    async fn get_user(&self, user_id: &str) -> Result<UserInfo> {
        let user_id = user_id.to_string();
        self.call(move |db| db.get_user(&user_id)).await
    }

    async fn get_workspace(&self, workspace_id: &str) -> Result<Workspace> {
        let workspace_id = workspace_id.to_string();
        self.call(move |db| db.get_workspace(&workspace_id)).await
    }

    async fn link_github(
        &self,
        installation_id: i64,
        owner: &str,
        repos: Vec<InstalledRepository>,
    ) -> Result<Installation> {
        let owner = owner.to_string();
        self.call(move |db| db.link_github(installation_id, &owner, &repos))
            .await
    }

    async fn save_github_repos(
        &self,
        installation_id: i64,
        owner: &str,
        repos: Vec<InstalledRepository>,
    ) -> Result<Vec<Repository>> {
        let owner = owner.to_string();
        self.call(move |db| db.save_github_repos(installation_id, &owner, &repos))
            .await
    }

    async fn remove_github_repos(
        &self,
        installation_id: i64,
        repos: Vec<InstalledRepository>,
    ) -> Result<()> {
        self.call(move |db| db.remove_github_repos(installation_id, &repos))
            .await
    }

    async fn remove_installation(&self, installation_id: i64) -> Result<Vec<Repository>> {
        self.call(move |db| db.remove_installation(installation_id))
            .await
    }

    async fn get_installation(&self, installation_id: i64) -> Result<Installation> {
        self.call(move |db| db.get_installation(installation_id))
            .await
    }

    async fn get_github_repos(&self, user_id: &str) -> Result<Vec<Repository>> {
        let user_id = user_id.to_string();
        self.call(move |db| db.get_github_repos(&user_id)).await
    }

    async fn get_repo_by_id(&self, user_id: &str, repo_id: &str) -> Result<Repository> {
        let (user_id, repo_id) = (user_id.to_string(), repo_id.to_string());
        self.call(move |db| db.get_repo_by_id(&user_id, &repo_id))
            .await
    }

    async fn get_repo_by_vcs_id(&self, vcs_id: i64) -> Result<Repository> {
        self.call(move |db| db.get_repo_by_vcs_id(vcs_id)).await
    }

    async fn connect_repo(&self, user_id: &str, repo_id: &str, branch: &str) -> Result<Repository> {
        let (user_id, repo_id, branch) =
            (user_id.to_string(), repo_id.to_string(), branch.to_string());
        self.call(move |db| db.connect_repo(&user_id, &repo_id, &branch))
            .await
    }

    async fn get_installation_id(&self, workspace_id: &str, repo_full_name: &str) -> Result<i64> {
        let (workspace_id, full_name) = (workspace_id.to_string(), repo_full_name.to_string());
        self.call(move |db| db.get_installation_id(&workspace_id, &full_name))
            .await
    }

    async fn save_deployment(&self, deployment: AppDeployment) -> Result<AppDeployment> {
        self.call(move |db| db.save_deployment(&deployment)).await
    }

    async fn update_deployment(&self, deployment: &AppDeployment) -> Result<AppDeployment> {
        let deployment = deployment.clone();
        self.call(move |db| db.update_deployment(&deployment)).await
    }

    async fn get_deployment(&self, deployment_id: &str) -> Result<AppDeployment> {
        let id = deployment_id.to_string();
        self.call(move |db| db.get_deployment(&id)).await
    }

    async fn get_deployments(&self, repo_id: &str) -> Result<Vec<AppDeployment>> {
        let repo_id = repo_id.to_string();
        self.call(move |db| db.get_deployments(&repo_id)).await
    }

    async fn get_deployment_history(&self, repo_id: &str) -> Result<Vec<DeploymentHistoryItem>> {
        let repo_id = repo_id.to_string();
        self.call(move |db| db.get_deployment_history(&repo_id))
            .await
    }

    async fn supersede_deployments(&self, repo_id: &str, keep_id: &str) -> Result<Vec<String>> {
        let (repo_id, keep_id) = (repo_id.to_string(), keep_id.to_string());
        self.call(move |db| db.supersede_deployments(&repo_id, &keep_id))
            .await
    }

    async fn mark_rolled_back(&self, repo_id: &str, source_id: &str, keep_id: &str) -> Result<usize> {
        let (repo_id, source_id, keep_id) =
            (repo_id.to_string(), source_id.to_string(), keep_id.to_string());
        self.call(move |db| db.mark_rolled_back(&repo_id, &source_id, &keep_id))
            .await
    }

    async fn save_secret(&self, workspace_id: &str, repo_id: &str, key: &str) -> Result<()> {
        let (w, r, k) = (workspace_id.to_string(), repo_id.to_string(), key.to_string());
        self.call(move |db| db.save_secret(&w, &r, &k)).await
    }

    async fn remove_secret(&self, workspace_id: &str, repo_id: &str, key: &str) -> Result<()> {
        let (w, r, k) = (workspace_id.to_string(), repo_id.to_string(), key.to_string());
        self.call(move |db| db.remove_secret(&w, &r, &k)).await
    }

    async fn repository_secret_key_exists(
        &self,
        workspace_id: &str,
        repo_id: &str,
        key: &str,
    ) -> Result<bool> {
        let (w, r, k) = (workspace_id.to_string(), repo_id.to_string(), key.to_string());
        self.call(move |db| db.repository_secret_key_exists(&w, &r, &k))
            .await
    }

    async fn get_repository_secret_keys(&self, workspace_id: &str, repo_id: &str) -> Result<Vec<String>> {
        let (w, r) = (workspace_id.to_string(), repo_id.to_string());
        self.call(move |db| db.get_repository_secret_keys(&w, &r))
            .await
    }

    async fn save_auth_state(&self, state: &str, expires_at: DateTime<Utc>) -> Result<()> {
        let state = state.to_string();
        self.call(move |db| db.save_auth_state(&state, expires_at))
            .await
    }

    async fn take_auth_state(&self, state: &str) -> Result<Option<DateTime<Utc>>> {
        let state = state.to_string();
        self.call(move |db| db.take_auth_state(&state)).await
    }

    async fn save_token_pair(&self, user_id: &str, access_token: &str, refresh_token: &str) -> Result<()> {
        let (u, a, r) = (
            user_id.to_string(),
            access_token.to_string(),
            refresh_token.to_string(),
        );
        self.call(move |db| db.save_token_pair(&u, &a, &r)).await
    }

    async fn get_token_pair(&self, user_id: &str) -> Result<Option<(String, String)>> {
        let user_id = user_id.to_string();
        self.call(move |db| db.get_token_pair(&user_id)).await
    }

    async fn delete_token_pair(&self, user_id: &str) -> Result<()> {
        let user_id = user_id.to_string();
        self.call(move |db| db.delete_token_pair(&user_id)).await
    }
}

// ── Internal row helpers ──────────────────────────────────────────────

fn repo_from_row(row: &Row<'_>) -> rusqlite::Result<Repository> {
    Ok(Repository {
        id: row.get(0)?,
        installation_id: row.get(1)?,
        vcs_id: row.get(2)?,
        full_name: row.get(3)?,
        default_branch: row.get(4)?,
        private: row.get(5)?,
        connected_branch: row.get(6)?,
        webhook_id: row.get(7)?,
        connected: row.get(8)?,
        workspace_id: row.get(9)?,
    })
}

/// Intermediate row struct for deployments before decoding the status and
/// the embedded space snapshot.
struct DeploymentRow {
    id: String,
    repo_id: String,
    space: String,
    sha: String,
    build_tag: String,
    branch: String,
    tag: String,
    message: String,
    user_display_name: String,
    status: String,
    error: Option<String>,
    rolled_back_from_id: Option<String>,
    created_at: String,
    updated_at: String,
}

impl DeploymentRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            repo_id: row.get(1)?,
            space: row.get(2)?,
            sha: row.get(3)?,
            build_tag: row.get(4)?,
            branch: row.get(5)?,
            tag: row.get(6)?,
            message: row.get(7)?,
            user_display_name: row.get(8)?,
            status: row.get(9)?,
            error: row.get(10)?,
            rolled_back_from_id: row.get(11)?,
            created_at: row.get(12)?,
            updated_at: row.get(13)?,
        })
    }

    fn into_deployment(self) -> Result<AppDeployment> {
        let status = DeploymentStatus::from_str(&self.status)
            .map_err(|e| anyhow::anyhow!(e))
            .context("Failed to parse deployment status")?;
        let space: Space =
            serde_json::from_str(&self.space).context("Failed to parse deployment space")?;
        Ok(AppDeployment {
            id: self.id,
            repo_id: self.repo_id,
            space,
            sha: self.sha,
            build_tag: self.build_tag,
            branch: self.branch,
            tag: self.tag,
            message: self.message,
            user_display_name: self.user_display_name,
            status,
            error: self.error,
            rolled_back_from_id: self.rolled_back_from_id,
            created_at: parse_timestamp(&self.created_at)?,
            updated_at: parse_timestamp(&self.updated_at)?,
        })
    }
}

// ── Tests ─────────────────────────────────────────────────────────────
