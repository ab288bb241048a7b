mod config;
mod database;
mod extractor;
mod fetcher;
mod geocoder;
mod http_client;
mod models;
mod orchestrator;

use anyhow::Result;
use clap::{Parser, Subcommand};
use config::Config;
use database::{Database, ListingFilter};
use fetcher::{HttpFetcher, PageFetcher, RateLimiter, RetryPolicy};
use geocoder::{Geocoder, NominatimBackend};
use orchestrator::{CancelHandle, Orchestrator};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

#[derive(Parser, Debug)]
#[command(name = "kleinanzeigen-map")]
#[command(about = "Scrapes classified-ad listings for a keyword and maps them", long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the scraping pipeline for one keyword
    Scrape {
        /// Search keyword
        #[arg(long)]
        keyword: String,

        /// Number of result pages to request (defaults to config)
        #[arg(long)]
        max_pages: Option<u32>,
    },
    /// Print stored listings, optionally filtered
    Query {
        #[arg(long)]
        keyword: Option<String>,

        #[arg(long)]
        city: Option<String>,

        #[arg(long)]
        min_price: Option<f64>,

        #[arg(long)]
        max_price: Option<f64>,
    },
    /// Show recent run summaries
    Runs {
        #[arg(long, default_value_t = 20)]
        limit: u32,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if !std::path::Path::new("data/config.yaml").exists() {
        eprintln!("No config file found, creating default data/config.yaml");
        Config::create_default()?;
    }
    let config = Config::load()?;

    // RUST_LOG wins over the configured level when set.
    if std::env::var("RUST_LOG").is_ok() {
        tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .init();
    } else {
        let level = match config.tracing_level.to_lowercase().as_str() {
            "trace" => tracing::Level::TRACE,
            "debug" => tracing::Level::DEBUG,
            "info" => tracing::Level::INFO,
            "warn" => tracing::Level::WARN,
            "error" => tracing::Level::ERROR,
            other => {
                eprintln!("Invalid tracing level '{}', using 'info'", other);
                tracing::Level::INFO
            }
        };
        tracing_subscriber::fmt().with_max_level(level).init();
    }

    if let Some(parent) = std::path::Path::new(&config.db_path).parent() {
        std::fs::create_dir_all(parent)?;
    }
    let db = Arc::new(Mutex::new(Database::new(&config.db_path)?));
    tracing::debug!(path = %config.db_path, "database opened");

    match args.command {
        Command::Scrape { keyword, max_pages } => {
            let max_pages = max_pages
                .unwrap_or(config.max_pages)
                .clamp(1, config::MAX_PAGES_HARD_LIMIT);
            scrape(&config, db, &keyword, max_pages).await
        }
        Command::Query {
            keyword,
            city,
            min_price,
            max_price,
        } => {
            let filter = ListingFilter {
                keyword,
                city,
                min_price,
                max_price,
            };
            let db = db.lock().await;
            for listing in db.query_listings(&filter)? {
                let price = listing
                    .price
                    .map(|p| format!("{:.2} EUR", p))
                    .unwrap_or_else(|| "-".to_string());
                let coords = listing
                    .coordinates
                    .map(|c| format!("{:.5},{:.5}", c.latitude, c.longitude))
                    .unwrap_or_else(|| "-".to_string());
                println!(
                    "{}\t{}\t{}\t{} {}\t{}\t{}",
                    listing.identity, listing.title, price, listing.postal_code, listing.city,
                    coords, listing.url
                );
            }
            Ok(())
        }
        Command::Runs { limit } => {
            let db = db.lock().await;
            for run in db.recent_runs(limit)? {
                println!(
                    "{}\t{}\t{}\tpages={}/{} found={} new={} duplicate={} geocode_failed={} fetch_failed={}",
                    run.started_at.format("%Y-%m-%d %H:%M:%S"),
                    run.keyword,
                    run.status.as_str(),
                    run.pages_fetched,
                    run.max_pages,
                    run.found,
                    run.new,
                    run.duplicate,
                    run.geocode_failed,
                    run.fetch_failed,
                );
            }
            Ok(())
        }
    }
}

async fn scrape(
    config: &Config,
    db: Arc<Mutex<Database>>,
    keyword: &str,
    max_pages: u32,
) -> Result<()> {
    let client = http_client::create_http_client(&config.user_agent)?;
    let site_limiter = Arc::new(RateLimiter::new(Duration::from_millis(
        config.request_delay_ms,
    )));
    let policy = RetryPolicy::new(
        config.max_retries,
        Duration::from_millis(config.retry_base_delay_ms),
    );
    let fetcher: Arc<dyn PageFetcher> = Arc::new(HttpFetcher::new(client, site_limiter, policy));

    let geocode_limiter = Arc::new(RateLimiter::new(Duration::from_millis(
        config.geocode_delay_ms,
    )));
    let backend = NominatimBackend::new(
        &config.geocoder_endpoint,
        &config.user_agent,
        geocode_limiter,
    );
    let geocoder = Geocoder::new(Box::new(backend), db.clone());

    let cancel = CancelHandle::new();
    let cancel_on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("interrupt received, draining current run");
            cancel_on_signal.cancel();
        }
    });

    let orchestrator = Orchestrator::new(
        fetcher,
        geocoder,
        db,
        &config.base_url,
        config.fail_threshold,
        cancel,
    );
    let run = orchestrator.run(keyword, max_pages).await?;

    println!(
        "run {}: {} (pages {}/{}, found {}, new {}, duplicate {}, geocode failures {}, fetch failures {})",
        run.id,
        run.status.as_str(),
        run.pages_fetched,
        run.max_pages,
        run.found,
        run.new,
        run.duplicate,
        run.geocode_failed,
        run.fetch_failed,
    );

    if run.status == models::RunStatus::Failed {
        std::process::exit(1);
    }
    Ok(())
}
