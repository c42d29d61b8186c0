use anyhow::{Context, Result};
use clap::Parser;
use log::{info, warn};
use sensor_ingest::config::load_config;
use sensor_ingest::db::{create_pool, ensure_schema};
use sensor_ingest::{MemoryStore, PgStore, Pipeline, PipelineConfig, ReadingStore, Scanner};
use std::io::IsTerminal;
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::watch;

#[derive(Parser, Debug)]
#[command(name = "sensor_ingest")]
#[command(about = "Ingest sensor measurement files into PostgreSQL", long_about = None)]
struct Args {
    /// JSON config file; its keys override environment variables
    #[arg(long)]
    config: Option<PathBuf>,

    /// Root holding incoming/, processed/ and quarantine/
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Database connection string
    #[arg(long)]
    database_url: Option<String>,

    /// Seconds between intake sweeps in polling mode
    #[arg(long)]
    poll_interval_seconds: Option<u64>,

    /// Copy files to their destination and leave a .done marker instead of moving them
    #[arg(long)]
    keep_incoming: bool,

    /// Sweep the intake area once and exit
    #[arg(long, env = "RUN_ONCE")]
    once: bool,

    /// Run against an in-memory store instead of PostgreSQL
    #[arg(long, env = "DRY_RUN")]
    dry_run: bool,

    /// Create the tables if they do not exist, then continue
    #[arg(long)]
    init_schema: bool,
}

fn build_config(args: &Args) -> Result<PipelineConfig> {
    let mut config = PipelineConfig::from_env()?;
    if let Some(path) = &args.config {
        config.apply_file(load_config(path)?);
    }
    if let Some(dir) = &args.data_dir {
        config.layout = sensor_ingest::config::DataLayout::from_data_dir(dir);
    }
    if let Some(url) = &args.database_url {
        config.db.url = Some(url.clone());
    }
    if let Some(secs) = args.poll_interval_seconds {
        config.poll_interval = Duration::from_secs(secs);
    }
    if args.keep_incoming {
        config.keep_incoming = true;
    }
    config.validate()?;
    Ok(config)
}

async fn run<S: ReadingStore>(pipeline: Pipeline<S>, once: bool) -> Result<()> {
    let (stop_tx, stop_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received; stopping after the current file");
            let _ = stop_tx.send(true);
        }
    });

    let mut scanner = Scanner::new(pipeline, stop_rx).with_progress(std::io::stderr().is_terminal());
    if once {
        scanner.run_once().await?;
    } else {
        scanner.run_polling().await?;
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let config = build_config(&args).context("Invalid configuration")?;
    config
        .layout
        .ensure()
        .with_context(|| format!("Failed to create data directories under {:?}", config.layout))?;

    info!(
        "Starting sensor ingestion (source: {}, intake: {})",
        config.source_name,
        config.layout.incoming.display()
    );

    if args.dry_run {
        info!("Dry run: readings are kept in memory only");
        let pipeline = Pipeline::new(config, MemoryStore::new());
        return run(pipeline, args.once).await;
    }

    let pool = create_pool(&config.db)?;
    if args.init_schema {
        ensure_schema(&pool).await?;
    }
    let pipeline = Pipeline::new(config, PgStore::new(pool));
    run(pipeline, args.once).await
}
