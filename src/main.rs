use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use treenq::config::Config;

mod cmd;

#[derive(Parser)]
#[command(name = "treenq")]
#[command(version, about = "Build and deploy repositories to Kubernetes")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the API server
    Serve {
        #[command(flatten)]
        config: Box<Config>,
    },
    /// Apply database migrations and exit
    Migrate {
        /// SQLite database file
        #[arg(long, env = "DB_DSN", default_value = "treenq.db")]
        db_dsn: PathBuf,

        #[arg(long, env = "MIGRATIONS_DIR")]
        migrations_dir: Option<PathBuf>,
    },
    /// Print the RPC operation catalog as JSON
    Schema {
        /// Indent the output
        #[arg(long)]
        pretty: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // A missing .env is fine; the environment may already be set.
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();

    match cli.command {
        Commands::Serve { config } => cmd::cmd_serve(*config).await?,
        Commands::Migrate {
            db_dsn,
            migrations_dir,
        } => {
            let _guard = treenq::telemetry::init(&Default::default());
            cmd::cmd_migrate(&db_dsn, migrations_dir.as_deref())?;
        }
        Commands::Schema { pretty } => cmd::cmd_schema(pretty)?,
    }

    Ok(())
}
