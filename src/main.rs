use std::sync::Arc;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand, ValueEnum};
use tracing_subscriber::EnvFilter;

use cohort::clients::Clients;
use cohort::config::Settings;
use cohort::report;
use cohort::sync::{differential_sync, orchestrate, CancelFlag, RunOptions, SyncMode};

#[derive(Parser)]
#[command(
    name = "cohort",
    version,
    about = "Converge downstream service access onto chat channel membership"
)]
struct Cli {
    /// Emit the raw records as JSON instead of the text summary.
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Additive sync: add missing users and align permissions, never remove.
    Sync {
        /// Where entities are discovered from.
        #[arg(long, value_enum, default_value_t = ModeArg::WithProvider)]
        mode: ModeArg,
        /// Services to leave untouched (comma-separated).
        #[arg(long, value_delimiter = ',')]
        skip: Vec<String>,
    },
    /// Differential sync: full convergence, including removals.
    Diff {
        /// Services to leave untouched (comma-separated).
        #[arg(long, value_delimiter = ',')]
        skip: Vec<String>,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum ModeArg {
    WithProvider,
    ChatToTools,
}

impl From<ModeArg> for SyncMode {
    fn from(mode: ModeArg) -> Self {
        match mode {
            ModeArg::WithProvider => SyncMode::WithProvider,
            ModeArg::ChatToTools => SyncMode::ChatToTools,
        }
    }
}

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    if let Err(e) = run().await {
        tracing::error!("{e:#}");
        std::process::exit(1);
    }
}

async fn run() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let settings = Settings::resolve().context("resolving settings")?;
    let matrix = Arc::new(settings.load_matrix().context("loading permissions matrix")?);
    if matrix.is_empty() {
        bail!(
            "permissions matrix at {} defines no entity kinds",
            settings.matrix_path.display()
        );
    }
    let exclusions = Arc::new(settings.load_exclusions().context("loading exclusion list")?);
    tracing::info!(
        kinds = matrix.len(),
        excluded_users = exclusions.len(),
        "configuration loaded"
    );

    let clients = Clients::from_settings(&settings).context("building service clients")?;
    let team_id = settings
        .chat
        .as_ref()
        .and_then(|c| c.team_id.clone())
        .unwrap_or_default();

    let options = RunOptions {
        concurrency: settings.concurrency,
        cancel: CancelFlag::new(),
    };
    let cancel = options.cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("interrupt received, finishing in-flight work");
            cancel.cancel();
        }
    });

    let (ok, records) = match cli.command {
        Command::Sync { mode, skip } => {
            orchestrate(
                &clients,
                matrix,
                exclusions,
                &team_id,
                mode.into(),
                &skip,
                &options,
            )
            .await
        }
        Command::Diff { skip } => {
            differential_sync(&clients, matrix, exclusions, &team_id, &skip, &options).await
        }
    };

    if cli.json {
        println!(
            "{}",
            serde_json::to_string_pretty(&records).context("serializing records")?
        );
    } else {
        print!("{}", report::render_summary(&records));
    }

    if !ok {
        bail!("synchronization aborted before completion");
    }
    Ok(())
}
