use anyhow::{bail, Result};
use clap::{Args, Parser, Subcommand};
use pkmn_core::EntityKind;
use pkmn_sync::{CatalogSelection, PgSnapshotStore, SyncConfig, SyncPipeline};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Debug, Parser)]
#[command(name = "pkmn-cli")]
#[command(about = "Pokémon catalog ETL command-line interface")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one sync against the configured upstream.
    Sync(SyncArgs),
    /// Apply database migrations.
    Migrate,
    /// Maintain the response cache.
    #[command(subcommand)]
    Cache(CacheCommand),
}

#[derive(Debug, Default, Args)]
struct SyncArgs {
    /// Only sync these kinds (comma separated: type,ability,pokemon).
    #[arg(long, value_delimiter = ',', value_parser = parse_kind)]
    kinds: Vec<EntityKind>,
    /// Cap the number of Pokémon enumerated.
    #[arg(long)]
    pokemon_limit: Option<usize>,
    /// Keep snapshots in memory instead of Postgres (dry run).
    #[arg(long)]
    memory_store: bool,
    /// Bypass the response cache.
    #[arg(long)]
    no_cache: bool,
}

#[derive(Debug, Subcommand)]
enum CacheCommand {
    /// Delete expired entries.
    Prune,
    /// Drop the cached response for one API path, e.g. `pokemon/25`.
    Invalidate { path: String },
}

fn parse_kind(value: &str) -> Result<EntityKind, String> {
    EntityKind::from_resource(value.trim())
        .ok_or_else(|| format!("unknown kind `{value}` (expected type, ability or pokemon)"))
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = SyncConfig::from_env();

    match cli.command.unwrap_or(Commands::Sync(SyncArgs::default())) {
        Commands::Sync(args) => sync(config, args).await?,
        Commands::Migrate => {
            let store = PgSnapshotStore::connect(&config.database_url).await?;
            store.migrate().await?;
            println!("migrations applied");
        }
        Commands::Cache(CacheCommand::Prune) => {
            let removed = pkmn_sync::prune_cache(&config).await?;
            println!("pruned {removed} expired cache entries");
        }
        Commands::Cache(CacheCommand::Invalidate { path }) => {
            if pkmn_sync::invalidate_cached_path(&config, &path).await? {
                println!("invalidated {path}");
            } else {
                println!("no cache entry for {path}");
            }
        }
    }

    Ok(())
}

async fn sync(config: SyncConfig, args: SyncArgs) -> Result<()> {
    let mut selection = CatalogSelection::load(&config.catalog_file)?;
    if !args.kinds.is_empty() {
        selection.restrict_to(&args.kinds);
    }
    if let Some(limit) = args.pokemon_limit {
        selection.set_limit(EntityKind::Pokemon, Some(limit));
    }

    let store = pkmn_sync::open_store(&config, args.memory_store).await?;
    let mut pipeline = SyncPipeline::new(config, selection, store)?;
    if args.no_cache {
        pipeline = pipeline.without_cache();
    }

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received; cancelling sync");
            on_signal.cancel();
        }
    });

    let record = pipeline.run_once(cancel).await?;
    let counts = record.counts;
    println!(
        "sync {}: run_id={} fetched={} cache_hit={} inserted={} updated={} unchanged={} failed={} aggregates_derived={}",
        record.status,
        record.run_id,
        counts.fetched,
        counts.cache_hit,
        counts.inserted,
        counts.updated,
        counts.unchanged,
        counts.failed,
        record.aggregates_derived,
    );
    if !record.is_success() {
        bail!("sync run {} failed: {:?}", record.run_id, record.abort_reason);
    }
    info!(run_id = %record.run_id, "sync complete");
    Ok(())
}
