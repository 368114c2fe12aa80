use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use secrecy::SecretString;

use place_enricher::secrets::PLACES_KEY_ALIAS;
use place_enricher::worklist::load_worklist;
use place_enricher::{
    init_tracing, open_store, seed_places, status_summary, AppConfig, BatchOptions, Pipeline,
    SecretVault, VAULT_SERVICE_NAME,
};

#[derive(Parser)]
#[command(name = "place-enricher", about = "Enrich places with listing matches and reviews")]
struct Cli {
    /// SQLite database file (overrides ENRICHER_DATABASE_PATH)
    #[arg(long, global = true)]
    database: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Process every runnable id from a worklist file (.txt, .csv or .json)
    Run {
        /// CSV files use a place_id/placeid/id column, else the first column.
        /// A first row that does not look like an id is read as the header.
        worklist: PathBuf,
        /// Simultaneous places in flight
        #[arg(long)]
        concurrency: Option<usize>,
        /// Stop after this many places have run
        #[arg(long)]
        limit: Option<usize>,
        /// Review pages to read per listing
        #[arg(long)]
        pages: Option<u32>,
        /// Look up and create records for ids the store has never seen
        #[arg(long)]
        register: bool,
    },
    /// Process a single place id, whatever its schedule
    Process { place_id: String },
    /// Enqueue worklist ids as pending records
    Seed { worklist: PathBuf },
    /// Per-status record counts
    Status,
    /// Save the Google Places API key in the OS keychain
    StoreKey {
        #[arg(long, env = "GOOGLE_PLACES_API_KEY", hide_env_values = true)]
        key: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    let mut config = AppConfig::from_env();
    if let Some(database) = cli.database {
        config.database_path = database;
    }
    let vault = SecretVault::new(VAULT_SERVICE_NAME);

    match cli.command {
        Command::Run {
            worklist,
            concurrency,
            limit,
            pages,
            register,
        } => {
            if let Some(pages) = pages {
                config.max_review_pages = pages.max(1);
            }
            let options = BatchOptions {
                concurrency: concurrency.unwrap_or(config.batch_concurrency).max(1),
                limit,
                register_unknown: register,
            };
            config.log_redacted();
            let pipeline = Pipeline::initialize(config, &vault)?;
            let report = pipeline
                .run_worklist(&worklist, options)
                .await
                .with_context(|| format!("running worklist {}", worklist.display()))?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            if report.failed > 0 {
                tracing::warn!(failed = report.failed, "some places failed");
            }
        }
        Command::Process { place_id } => {
            config.log_redacted();
            let pipeline = Pipeline::initialize(config, &vault)?;
            let report = pipeline
                .process_place(&place_id)
                .await
                .with_context(|| format!("processing {place_id}"))?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Command::Seed { worklist } => {
            let ids = load_worklist(&worklist)
                .with_context(|| format!("loading worklist {}", worklist.display()))?;
            let store = open_store(&config)?;
            let created = seed_places(&store, &ids)?;
            println!("seeded {created} of {} ids", ids.len());
        }
        Command::Status => {
            let store = open_store(&config)?;
            println!("{}", serde_json::to_string_pretty(&status_summary(&store)?)?);
        }
        Command::StoreKey { key } => {
            if key.trim().is_empty() {
                bail!("refusing to store an empty API key");
            }
            vault.store(PLACES_KEY_ALIAS, &SecretString::from(key))?;
            println!("stored {PLACES_KEY_ALIAS} in the keychain");
        }
    }
    Ok(())
}
