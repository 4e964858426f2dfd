use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use idrec_storage::PgDocumentStore;
use idrec_sync::{find_user_by_cluster_username, find_user_by_key, ReconcileConfig};
use tracing::info;
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "idrec-cli")]
#[command(about = "Identity reconciliation command-line interface")]
struct Cli {
    /// YAML configuration file (default: $IDREC_CONFIG or ./idrec.yaml).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Pull sources and reconcile them into the document store.
    Acquire {
        #[command(subcommand)]
        target: AcquireTarget,
    },
    /// Look up one reconciled user.
    User {
        #[command(subcommand)]
        action: UserAction,
    },
    /// Apply the document store schema.
    Migrate,
    /// Serve the read-only JSON API.
    Serve,
}

#[derive(Debug, Subcommand)]
enum AcquireTarget {
    Users(AcquireUsersArgs),
}

#[derive(Debug, Args)]
struct AcquireUsersArgs {
    /// Ask the operator about accounts that could not be matched automatically.
    #[arg(long)]
    prompt: bool,
}

#[derive(Debug, Subcommand)]
enum UserAction {
    Show(UserShowArgs),
}

#[derive(Debug, Args)]
#[group(required = true, multiple = false)]
struct UserShowArgs {
    #[arg(long)]
    key: Option<String>,
    #[arg(long)]
    cluster_username: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    // stderr keeps stdout free for the operator prompt
    let _ = fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .try_init();

    let cli = Cli::parse();
    let config = ReconcileConfig::load(cli.config.as_deref())?;

    match cli.command {
        Commands::Acquire {
            target: AcquireTarget::Users(args),
        } => {
            let summary = idrec_sync::run_from_config(&config, args.prompt).await?;
            let matched: usize = summary.matches_by_method.values().sum();
            println!(
                "acquire users complete: run_id={} profiles={} matched={} unmatched={} issues={} reports={}",
                summary.run_id,
                summary.profiles,
                matched,
                summary.unmatched.len(),
                summary.issues.len(),
                summary.reports_dir.as_deref().unwrap_or("-"),
            );
        }
        Commands::User {
            action: UserAction::Show(args),
        } => {
            let store = config.document_store().await?;
            let found = match (&args.key, &args.cluster_username) {
                (Some(key), _) => find_user_by_key(store.as_ref(), &config.collection, key).await?,
                (None, Some(username)) => {
                    find_user_by_cluster_username(store.as_ref(), &config.collection, username)
                        .await?
                }
                (None, None) => None,
            };
            match found {
                Some(user) => println!(
                    "{}",
                    serde_json::to_string_pretty(&user).context("serializing user")?
                ),
                None => anyhow::bail!("no matching user"),
            }
        }
        Commands::Migrate => {
            let url = config
                .database_url
                .as_deref()
                .context("DATABASE_URL is required for migrate")?;
            PgDocumentStore::connect(url).await?.migrate().await?;
            info!("migrations applied");
        }
        Commands::Serve => idrec_web::serve_from_config(&config).await?,
    }

    Ok(())
}
