//! Apply database migrations without starting the server (`treenq migrate`).

use std::path::Path;

use anyhow::Result;
use treenq::platform::db::PlatformDb;

pub fn cmd_migrate(db_path: &Path, migrations_dir: Option<&Path>) -> Result<()> {
    let db = PlatformDb::new(db_path, migrations_dir)?;
    let applied = db.applied_migrations()?;
    tracing::info!(db = %db_path.display(), migrations = applied.len(), "database migrated");
    println!(
        "Applied {} migration(s) to {}",
        applied.len(),
        db_path.display()
    );
    Ok(())
}
