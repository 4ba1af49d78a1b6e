use anyhow::{bail, Context, Result};
use chrono::Local;
use clap::{Args, Parser, Subcommand};
use oacap_core::GasDay;
use oacap_storage::{ReportCache, ReportFetcher};
use oacap_sync::{
    gas_day_window, BulkLoader, MemoryStore, PgStore, SyncConfig, SyncPipeline, SyncRunSummary,
    DEFAULT_BATCH_SIZE, DEFAULT_WINDOW_DAYS,
};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "oacap")]
#[command(about = "Operationally available capacity report ingest")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Fetch, parse and upsert reports for a window of gas days.
    Sync(SyncArgs),
    /// Apply the database schema.
    Migrate,
    /// Remove every cached report.
    CleanCache,
}

#[derive(Debug, Args)]
struct SyncArgs {
    /// Gas days to process, ending yesterday.
    #[arg(long, default_value_t = DEFAULT_WINDOW_DAYS)]
    days: u32,
    /// Explicit gas day (MM/DD/YYYY or YYYY-MM-DD); repeatable, overrides --days.
    #[arg(long = "gas-day")]
    gas_days: Vec<GasDay>,
    /// Intraday cycles to fetch for each gas day; cycles start at 1.
    #[arg(
        long,
        value_delimiter = ',',
        default_value = "1,2,3,4,5",
        value_parser = clap::value_parser!(u8).range(1..)
    )]
    cycles: Vec<u8>,
    /// Commit every N records separately instead of one transaction per report.
    #[arg(long)]
    batch_size: Option<usize>,
    /// Shorthand for --batch-size with the default batch size.
    #[arg(long, conflicts_with = "batch_size")]
    batched: bool,
    #[arg(long)]
    keep_cache: bool,
    /// Parse and deduplicate without writing to the database.
    #[arg(long)]
    dry_run: bool,
    /// Print the run summary as JSON.
    #[arg(long)]
    json: bool,
}

impl Default for SyncArgs {
    fn default() -> Self {
        Self {
            days: DEFAULT_WINDOW_DAYS,
            gas_days: Vec::new(),
            cycles: vec![1, 2, 3, 4, 5],
            batch_size: None,
            batched: false,
            keep_cache: false,
            dry_run: false,
            json: false,
        }
    }
}

fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(true)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    init_tracing();
    let cli = Cli::parse();
    let config = SyncConfig::from_env();

    match cli.command.unwrap_or_else(|| Commands::Sync(SyncArgs::default())) {
        Commands::Sync(args) => run_sync(config, args).await?,
        Commands::Migrate => {
            let mut store = PgStore::connect(&config.database_url)
                .await
                .context("connecting to database")?;
            store.migrate().await.context("applying migrations")?;
            store.close().await?;
            println!("migrations applied");
        }
        Commands::CleanCache => {
            let removed = ReportCache::new(config.cache_dir.clone())
                .evict_all()
                .await?;
            println!("removed {removed} cached reports from {}", config.cache_dir.display());
        }
    }

    Ok(())
}

async fn run_sync(mut config: SyncConfig, args: SyncArgs) -> Result<()> {
    if args.batched {
        config.batch_size = Some(DEFAULT_BATCH_SIZE);
    } else if args.batch_size.is_some() {
        config.batch_size = args.batch_size;
    }
    config.keep_cache |= args.keep_cache || args.dry_run;

    let gas_days = if args.gas_days.is_empty() {
        gas_day_window(Local::now().date_naive(), args.days)
    } else {
        args.gas_days
    };

    let summary = if args.dry_run {
        info!("dry run: records are counted in memory, nothing is written");
        let fetcher = ReportFetcher::from_config(
            config.fetcher_config(),
            ReportCache::new(config.cache_dir.clone()),
        )?;
        let mut pipeline = SyncPipeline::new(
            fetcher,
            BulkLoader::new(MemoryStore::new()),
            config.pipeline_options(),
        );
        pipeline.run_window(&gas_days, &args.cycles).await
    } else {
        let mut pipeline = SyncPipeline::connect(&config).await?;
        pipeline
            .loader_mut()
            .store_mut()
            .migrate()
            .await
            .context("applying migrations")?;
        let summary = pipeline.run_window(&gas_days, &args.cycles).await;
        pipeline.into_loader().into_store().close().await?;
        summary
    };

    print_summary(&summary, args.dry_run, args.json)?;
    if summary.failed_keys > 0 {
        bail!("{} report(s) failed to persist", summary.failed_keys);
    }
    Ok(())
}

fn print_summary(summary: &SyncRunSummary, dry_run: bool, json: bool) -> Result<()> {
    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(summary).context("serializing run summary")?
        );
        return Ok(());
    }
    let verb = if dry_run { "would persist" } else { "persisted" };
    println!(
        "sync complete: run_id={} keys={} no_data={} fetched={} cached={} parsed={} rejected={} deduplicated={} {verb}={} failed={}",
        summary.run_id,
        summary.keys_attempted,
        summary.keys_without_data,
        summary.fetched,
        summary.replayed_from_cache,
        summary.parsed,
        summary.rejected_rows,
        summary.deduplicated,
        summary.persisted,
        summary.failed_keys
    );
    Ok(())
}
