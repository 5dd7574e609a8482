//! Crawl workers: drain the frontier, claim URLs, fetch politely, store
//! HTML, and hand pages to the parse pipeline.
//!
//! Every worker shares one delivery channel and one cancellation token.
//! A delivery always ends in exactly one of ack, nack-to-DLQ, or staying
//! pending for the reclaim loop; per-message failures never kill a worker.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use url::Url;
use uuid::Uuid;

use crate::backoff::backoff_delay;
use crate::cache::ratelimiter::{RateLimitError, RateLimiter};
use crate::config::CrawlerConfig;
use crate::db::{self, Db, UrlStatus};
use crate::fetcher::Fetcher;
use crate::queue::{Delivery, ParseMessage, Publisher, UrlMessage};
use crate::robots::{RobotsChecker, DEFAULT_CRAWL_DELAY_MS};
use crate::storage::{self, ObjectStore, HTML_BUCKET};

/// URLs left in `crawling` longer than this are reverted to `pending` by the
/// startup reaper; their claimant is assumed dead.
pub const STALE_CLAIM_AGE: Duration = Duration::from_secs(5 * 60);

#[derive(Clone)]
pub struct Crawler {
    cfg: CrawlerConfig,
    db: Db,
    fetcher: Arc<Fetcher>,
    publisher: Publisher,
    rate_limiter: RateLimiter,
    robots: RobotsChecker,
    store: Arc<ObjectStore>,
    // One domain upsert per process per domain; evicted on failure so the
    // next URL retries it.
    seen_domains: Arc<DashMap<String, ()>>,
    retry_tasks: TaskTracker,
}

impl Crawler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        cfg: CrawlerConfig,
        db: Db,
        fetcher: Arc<Fetcher>,
        publisher: Publisher,
        rate_limiter: RateLimiter,
        robots: RobotsChecker,
        store: Arc<ObjectStore>,
    ) -> Self {
        Self {
            cfg,
            db,
            fetcher,
            publisher,
            rate_limiter,
            robots,
            store,
            seen_domains: Arc::new(DashMap::new()),
            retry_tasks: TaskTracker::new(),
        }
    }

    /// Run the worker pool until the token fires or the delivery channel
    /// closes, then wait for outstanding retry re-publishes.
    pub async fn run(&self, deliveries: flume::Receiver<Delivery>, token: CancellationToken) {
        let mut workers = JoinSet::new();
        for worker_id in 0..self.cfg.workers.max(1) {
            let crawler = self.clone();
            let rx = deliveries.clone();
            let worker_token = token.clone();
            workers.spawn(async move {
                crawler.worker(worker_id, rx, worker_token).await;
            });
        }
        drop(deliveries);

        while workers.join_next().await.is_some() {}

        self.retry_tasks.close();
        self.retry_tasks.wait().await;
        tracing::info!("all crawler workers stopped");
    }

    async fn worker(&self, id: usize, rx: flume::Receiver<Delivery>, token: CancellationToken) {
        tracing::info!(worker = id, "crawler worker started");
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                received = rx.recv_async() => match received {
                    Ok(delivery) => self.process_delivery(&token, delivery).await,
                    Err(_) => break,
                },
            }
        }
        tracing::info!(worker = id, "crawler worker stopping");
    }

    async fn process_delivery(&self, token: &CancellationToken, delivery: Delivery) {
        let msg: UrlMessage = match serde_json::from_slice(&delivery.body) {
            Ok(msg) => msg,
            Err(e) => {
                tracing::error!(error = %e, "failed to decode url message");
                log_settle_error(delivery.nack(true).await);
                return;
            }
        };

        if msg.depth > self.cfg.max_depth {
            tracing::debug!(url = %msg.url, depth = msg.depth, "max depth exceeded, dropping");
            log_settle_error(delivery.ack().await);
            return;
        }

        let domain = match Url::parse(&msg.url)
            .ok()
            .and_then(|u| u.host_str().map(|h| h.to_string()))
        {
            Some(domain) => domain,
            None => {
                tracing::warn!(url = %msg.url, "invalid url, dropping");
                log_settle_error(delivery.ack().await);
                return;
            }
        };

        if !self.seen_domains.contains_key(&domain) {
            if let Err(e) = db::upsert_domain(&self.db, &domain, DEFAULT_CRAWL_DELAY_MS).await {
                tracing::error!(domain = %domain, error = %e, "failed to upsert domain");
                log_settle_error(delivery.nack(false).await);
                return;
            }
            self.seen_domains.insert(domain.clone(), ());
        }

        // Atomic claim: one statement inserts the URL as crawling or flips a
        // pending/failed row. No row back means someone else owns it or it
        // is terminal; either way this delivery is done.
        let url_id = match db::upsert_url_returning(&self.db, &msg.url, &domain, msg.depth as i32)
            .await
        {
            Ok(Some((id, UrlStatus::Crawling))) => id,
            Ok(_) => {
                tracing::debug!(url = %msg.url, "url already claimed or terminal, dropping");
                log_settle_error(delivery.ack().await);
                return;
            }
            Err(e) => {
                tracing::error!(url = %msg.url, error = %e, "failed to claim url");
                log_settle_error(delivery.nack(false).await);
                return;
            }
        };

        let mut crawl_delay_ms = DEFAULT_CRAWL_DELAY_MS;
        if self.cfg.respect_robots_txt {
            let (allowed, delay) = self.robots.is_allowed(&msg.url, &domain).await;
            crawl_delay_ms = delay;
            if !allowed {
                tracing::debug!(url = %msg.url, "disallowed by robots.txt, skipping");
                if let Err(e) = db::update_url_status(&self.db, url_id, UrlStatus::Skipped).await {
                    tracing::error!(url = %msg.url, error = %e, "failed to mark url skipped");
                }
                log_settle_error(delivery.ack().await);
                return;
            }
        }

        match self
            .rate_limiter
            .wait_for_allow(token, &domain, crawl_delay_ms)
            .await
        {
            Ok(()) => {}
            Err(RateLimitError::Cancelled) => {
                log_settle_error(delivery.nack(false).await);
                return;
            }
            Err(e) => {
                tracing::error!(domain = %domain, error = %e, "rate limiter error");
                log_settle_error(delivery.nack(false).await);
                return;
            }
        }

        let fetched = tokio::select! {
            _ = token.cancelled() => {
                log_settle_error(delivery.nack(false).await);
                return;
            }
            result = self.fetcher.fetch(&msg.url) => result,
        };

        let body = match fetched {
            Ok(resp) if resp.status == 200 => resp.body,
            Ok(resp) => {
                tracing::warn!(url = %msg.url, status = resp.status, "fetch returned non-200");
                self.handle_fetch_failure(token, &delivery, &msg, url_id).await;
                return;
            }
            Err(e) => {
                tracing::warn!(url = %msg.url, error = %e, "fetch failed");
                self.handle_fetch_failure(token, &delivery, &msg, url_id).await;
                return;
            }
        };

        let key = storage::html_key(&msg.url);
        if let Err(e) = self
            .store
            .put_object(HTML_BUCKET, &key, body, "text/html")
            .await
        {
            tracing::error!(url = %msg.url, error = %e, "failed to store html");
            log_settle_error(delivery.nack(false).await);
            return;
        }
        let html_locator = format!("{}/{}", HTML_BUCKET, key);

        if let Err(e) = db::update_url_crawled(&self.db, url_id, &html_locator).await {
            tracing::error!(url = %msg.url, error = %e, "failed to update url record");
            log_settle_error(delivery.nack(false).await);
            return;
        }

        let parse_msg = ParseMessage {
            url_id,
            url: msg.url.clone(),
            html_locator,
            depth: msg.depth,
        };
        if let Err(e) = self.publisher.publish_parse(&parse_msg).await {
            tracing::error!(url = %msg.url, error = %e, "failed to publish parse message");
            log_settle_error(delivery.nack(false).await);
            return;
        }

        tracing::info!(url = %msg.url, depth = msg.depth, "crawled successfully");
        log_settle_error(delivery.ack().await);
    }

    /// Count the failure against the retry budget. Exhausted URLs go to the
    /// DLQ as `failed`; otherwise the delivery is acked now and the same
    /// message is re-published after an exponential backoff on a tracked
    /// task, so shutdown can wait for it.
    async fn handle_fetch_failure(
        &self,
        token: &CancellationToken,
        delivery: &Delivery,
        msg: &UrlMessage,
        url_id: Uuid,
    ) {
        let retry_count = match db::increment_retry_and_maybe_fail(
            &self.db,
            url_id,
            self.cfg.max_retries as i32,
        )
        .await
        {
            Ok(count) => count,
            Err(e) => {
                tracing::error!(url = %msg.url, error = %e, "failed to increment retry count");
                log_settle_error(delivery.nack(false).await);
                return;
            }
        };

        if retry_count >= self.cfg.max_retries as i32 {
            tracing::warn!(url = %msg.url, retry_count, "retries exhausted, dead-lettering");
            log_settle_error(delivery.nack(true).await);
            return;
        }

        log_settle_error(delivery.ack().await);

        let delay = backoff_delay(retry_count.saturating_sub(1) as u32);
        tracing::debug!(url = %msg.url, retry_count, delay_ms = delay.as_millis() as u64, "scheduling retry");

        let publisher = self.publisher.clone();
        let retry_msg = msg.clone();
        let retry_token = token.clone();
        self.retry_tasks.spawn(async move {
            tokio::select! {
                _ = retry_token.cancelled() => {}
                _ = tokio::time::sleep(delay) => {
                    if let Err(e) = publisher.publish_url(&retry_msg).await {
                        tracing::error!(url = %retry_msg.url, error = %e, "failed to re-publish retry");
                    }
                }
            }
        });
    }
}

/// Settlement failures are logged but never change control flow: the entry
/// stays in the pending list and the reclaim loop recovers it.
fn log_settle_error<E: std::fmt::Display>(result: Result<(), E>) {
    if let Err(e) = result {
        tracing::error!(error = %e, "failed to settle delivery");
    }
}
