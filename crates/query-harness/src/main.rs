use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use query_harness::broker::{Broker, LapinBroker};
use query_harness::config::{load_config, Config};
use query_harness::intake::{Intake, SubmitQueryRequest};
use query_harness::metadata::{ArticleMetadataReader, SqliteMetadataReader};
use query_harness::orchestrator::Orchestrator;
use query_harness::queues::{QUERY_SEARCH_RESULTS, SEARCH_RESULTS};
use query_harness::result_store::{RedisResultStore, ResultStore};
use query_harness::router::ReplyRouter;
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "qh-worker", about = "Query orchestration and ranking worker")]
struct Cli {
    #[arg(long, default_value = "config.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run one or more pipeline components as long-lived consumers.
    Serve {
        #[arg(value_enum)]
        service: ServeService,
    },
    /// Submit a query job directly, for manual exercising during development.
    Submit {
        query: String,
        #[arg(long)]
        immediate: bool,
        #[arg(long)]
        max_results: Option<i64>,
        #[arg(long)]
        score_threshold: Option<f64>,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum ServeService {
    /// Both job consumers and both reply routers in one process.
    All,
    /// Only the query-mode and article-mode job consumers.
    Orchestrator,
    /// Only the query-mode and article-mode reply routers.
    Router,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let config = load_config(&cli.config)
        .with_context(|| format!("failed to load config from {}", cli.config.display()))?;

    match cli.command {
        Commands::Serve { service } => run_serve(config, service).await,
        Commands::Submit {
            query,
            immediate,
            max_results,
            score_threshold,
        } => run_submit(config, query, immediate, max_results, score_threshold).await,
    }
}

async fn build_broker(config: &Config) -> Result<Arc<dyn Broker>> {
    let broker = LapinBroker::connect(&config.broker.url).await?;
    Ok(Arc::new(broker))
}

async fn build_store(config: &Config) -> Result<Arc<dyn ResultStore>> {
    let store = RedisResultStore::connect(&config.result_store.url).await?;
    Ok(Arc::new(store))
}

async fn build_metadata(config: &Config) -> Result<Arc<dyn ArticleMetadataReader>> {
    let reader = SqliteMetadataReader::connect(&config.metadata.db_path).await?;
    Ok(Arc::new(reader))
}

async fn run_serve(config: Config, service: ServeService) -> Result<()> {
    let broker = build_broker(&config).await?;
    let store = build_store(&config).await?;
    let metadata = build_metadata(&config).await?;
    let await_timeout = Duration::from_secs(config.orchestrator.await_timeout_secs);
    let prefetch = config.broker.prefetch;
    let orchestrator = Arc::new(Orchestrator::new(
        broker.clone(),
        store,
        metadata,
        await_timeout,
        prefetch,
    ));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        tracing::info!("shutdown requested");
        let _ = shutdown_tx.send(true);
    });

    let mut tasks = Vec::new();

    if matches!(service, ServeService::All | ServeService::Orchestrator) {
        let o1 = orchestrator.clone();
        let rx1 = shutdown_rx.clone();
        tasks.push(tokio::spawn(async move { o1.run_query_jobs(rx1).await }));

        let o2 = orchestrator.clone();
        let rx2 = shutdown_rx.clone();
        tasks.push(tokio::spawn(
            async move { o2.run_recommendation_jobs(rx2).await },
        ));
    }

    if matches!(service, ServeService::All | ServeService::Router) {
        let pending = orchestrator.pending_map();
        let router = ReplyRouter::new(broker.clone(), pending.clone(), prefetch);
        let rx3 = shutdown_rx.clone();
        tasks.push(tokio::spawn(async move {
            router.run(QUERY_SEARCH_RESULTS, rx3).await
        }));

        let router2 = ReplyRouter::new(broker, pending, prefetch);
        let rx4 = shutdown_rx.clone();
        tasks.push(tokio::spawn(async move { router2.run(SEARCH_RESULTS, rx4).await }));
    }

    for task in tasks {
        if let Err(e) = task.await.context("worker task panicked")? {
            tracing::error!(error = %e, "worker task exited with an error");
        }
    }

    Ok(())
}

async fn run_submit(
    config: Config,
    query: String,
    immediate: bool,
    max_results: Option<i64>,
    score_threshold: Option<f64>,
) -> Result<()> {
    let broker = build_broker(&config).await?;
    let store = build_store(&config).await?;
    let intake = Intake::new(broker, store, config.intake);

    let request = SubmitQueryRequest {
        query,
        session_id: None,
        max_results,
        score_threshold,
        correlation_id: None,
    };

    if immediate {
        let outcome = intake.submit_immediate(request).await?;
        println!("{}", serde_json::to_string_pretty(&outcome)?);
    } else {
        let response = intake.submit_async(request).await?;
        println!("job_id: {}", response.job_id);
        println!("poll_url: {}", response.poll_url);
    }

    Ok(())
}
