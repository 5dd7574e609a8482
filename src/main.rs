use std::sync::Arc;

use redis::aio::ConnectionManager;
use tokio_util::sync::CancellationToken;

use nimbus::cache::{DnsCache, RateLimiter};
use nimbus::cli::{Cli, Commands};
use nimbus::config::Config;
use nimbus::crawler::{Crawler, STALE_CLAIM_AGE};
use nimbus::db;
use nimbus::fetcher::Fetcher;
use nimbus::parser::Parser;
use nimbus::proxy::ProxyPool;
use nimbus::queue::{
    self, Consumer, Publisher, CRAWLER_GROUP, FRONTIER_DLQ, FRONTIER_STREAM, PARSER_GROUP,
    PARSE_DLQ, PARSE_STREAM,
};
use nimbus::robots::RobotsChecker;
use nimbus::seeder;
use nimbus::storage::ObjectStore;

#[tokio::main]
async fn main() {
    nimbus::logging::init();

    let cli = Cli::parse_args();
    if let Err(e) = run(cli).await {
        tracing::error!(error = %e, "fatal error");
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<(), Box<dyn std::error::Error>> {
    let cfg = match Config::load(&cli.config) {
        Ok(cfg) => cfg,
        Err(e) => {
            tracing::debug!(error = %e, "config file not loaded, using environment");
            Config::from_env()
        }
    };

    match cli.command {
        Commands::Crawler => run_crawler(cfg).await,
        Commands::Parser => run_parser(cfg).await,
        Commands::Seed { file } => run_seeder(cfg, &file).await,
    }
}

/// Root cancellation context, wired to SIGINT and SIGTERM. Cancelling it
/// stops the consumer loops, which closes the delivery channel, which drains
/// the workers: the full shutdown ordering falls out of that chain.
fn shutdown_token() -> CancellationToken {
    let token = CancellationToken::new();
    let trigger = token.clone();

    tokio::spawn(async move {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            match signal(SignalKind::terminate()) {
                Ok(mut term) => {
                    tokio::select! {
                        _ = tokio::signal::ctrl_c() => {}
                        _ = term.recv() => {}
                    }
                }
                Err(e) => {
                    tracing::error!(error = %e, "failed to register SIGTERM handler");
                    let _ = tokio::signal::ctrl_c().await;
                }
            }
        }
        #[cfg(not(unix))]
        {
            let _ = tokio::signal::ctrl_c().await;
        }

        tracing::info!("shutdown signal received");
        trigger.cancel();
    });

    token
}

async fn run_crawler(cfg: Config) -> Result<(), Box<dyn std::error::Error>> {
    let token = shutdown_token();

    let pool = db::connect(&cfg.postgres).await?;
    let redis_client = redis::Client::open(cfg.redis.url())?;
    let redis_conn = ConnectionManager::new(redis_client.clone()).await?;

    queue::ensure_groups(&mut redis_conn.clone()).await?;
    let publisher = Publisher::new(redis_conn.clone());
    let store = Arc::new(ObjectStore::connect(&cfg.minio).await?);

    let dns = Arc::new(DnsCache::new(redis_conn.clone()));
    let rate_limiter = RateLimiter::new(redis_conn.clone());
    let robots = RobotsChecker::new(pool.clone(), redis_conn.clone())?;

    let proxy_pool = ProxyPool::load(
        &cfg.crawler.proxy.file,
        Some(redis_conn.clone()),
        cfg.crawler.proxy.health_cooldown_s,
    )?;
    match &proxy_pool {
        Some(proxies) => tracing::info!(count = proxies.len(), "proxy pool loaded"),
        None => tracing::info!("no proxy file configured, using direct connections"),
    }

    let fetcher = Arc::new(Fetcher::new(
        Some(dns),
        proxy_pool,
        cfg.crawler.timeout_secs,
        cfg.crawler.max_redirects,
    )?);

    // Heal rows orphaned by a crashed claimant before taking new work.
    match db::reset_stale_crawling_urls(&pool, STALE_CLAIM_AGE).await {
        Ok(0) => {}
        Ok(count) => tracing::info!(count, "reset stale crawling urls"),
        Err(e) => tracing::error!(error = %e, "failed to reset stale crawling urls"),
    }

    let consumer = Consumer::new(
        redis_client,
        redis_conn,
        FRONTIER_STREAM,
        FRONTIER_DLQ,
        CRAWLER_GROUP,
        format!("crawler-{}", std::process::id()),
        cfg.crawler.prefetch_count,
    );
    let deliveries = consumer.run(token.clone());

    let crawler = Crawler::new(
        cfg.crawler.clone(),
        pool,
        fetcher,
        publisher,
        rate_limiter,
        robots,
        store,
    );

    tracing::info!(
        workers = cfg.crawler.workers,
        max_depth = cfg.crawler.max_depth,
        "crawler starting"
    );
    crawler.run(deliveries, token).await;
    consumer.wait().await;

    Ok(())
}

async fn run_parser(cfg: Config) -> Result<(), Box<dyn std::error::Error>> {
    let token = shutdown_token();

    let pool = db::connect(&cfg.postgres).await?;
    let redis_client = redis::Client::open(cfg.redis.url())?;
    let redis_conn = ConnectionManager::new(redis_client.clone()).await?;

    queue::ensure_groups(&mut redis_conn.clone()).await?;
    let publisher = Publisher::new(redis_conn.clone());
    let store = Arc::new(ObjectStore::connect(&cfg.minio).await?);

    let consumer = Consumer::new(
        redis_client,
        redis_conn,
        PARSE_STREAM,
        PARSE_DLQ,
        PARSER_GROUP,
        format!("parser-{}", std::process::id()),
        cfg.parser.prefetch_count,
    );
    let deliveries = consumer.run(token.clone());

    let parser = Parser::new(cfg.parser.clone(), pool, publisher, store);

    tracing::info!(
        workers = cfg.parser.workers,
        max_depth = cfg.parser.max_depth,
        "parser starting"
    );
    parser.run(deliveries, token).await;
    consumer.wait().await;

    Ok(())
}

async fn run_seeder(cfg: Config, seed_file: &str) -> Result<(), Box<dyn std::error::Error>> {
    let pool = db::connect(&cfg.postgres).await?;
    let redis_client = redis::Client::open(cfg.redis.url())?;
    let mut redis_conn = ConnectionManager::new(redis_client).await?;

    queue::ensure_groups(&mut redis_conn).await?;
    let publisher = Publisher::new(redis_conn);

    let count = seeder::load_and_publish(&pool, &publisher, seed_file).await?;
    tracing::info!(count, seed_file, "seeder finished");
    Ok(())
}
