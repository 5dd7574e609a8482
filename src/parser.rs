//! Parse workers: pull stored HTML, dedup by content hash, extract text and
//! outbound links, and feed newly-discovered URLs back onto the frontier.

use std::sync::Arc;

use dashmap::DashMap;
use scraper::Html;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::config::ParserConfig;
use crate::db::{self, Db};
use crate::extract;
use crate::queue::{
    Delivery, ParseMessage, Publisher, UrlMessage, BACKPRESSURE_THRESHOLD, FRONTIER_STREAM,
};
use crate::robots::DEFAULT_CRAWL_DELAY_MS;
use crate::storage::{self, ObjectStore, TEXT_BUCKET};
use crate::url_utils;

#[derive(Clone)]
pub struct Parser {
    cfg: ParserConfig,
    db: Db,
    publisher: Publisher,
    store: Arc<ObjectStore>,
    seen_domains: Arc<DashMap<String, ()>>,
}

impl Parser {
    pub fn new(cfg: ParserConfig, db: Db, publisher: Publisher, store: Arc<ObjectStore>) -> Self {
        Self {
            cfg,
            db,
            publisher,
            store,
            seen_domains: Arc::new(DashMap::new()),
        }
    }

    pub async fn run(&self, deliveries: flume::Receiver<Delivery>, token: CancellationToken) {
        let mut workers = JoinSet::new();
        for worker_id in 0..self.cfg.workers.max(1) {
            let parser = self.clone();
            let rx = deliveries.clone();
            let worker_token = token.clone();
            workers.spawn(async move {
                parser.worker(worker_id, rx, worker_token).await;
            });
        }
        drop(deliveries);

        while workers.join_next().await.is_some() {}
        tracing::info!("all parser workers stopped");
    }

    async fn worker(&self, id: usize, rx: flume::Receiver<Delivery>, token: CancellationToken) {
        tracing::info!(worker = id, "parser worker started");
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                received = rx.recv_async() => match received {
                    Ok(delivery) => self.process_delivery(delivery).await,
                    Err(_) => break,
                },
            }
        }
        tracing::info!(worker = id, "parser worker stopping");
    }

    async fn process_delivery(&self, delivery: Delivery) {
        let msg: ParseMessage = match serde_json::from_slice(&delivery.body) {
            Ok(msg) => msg,
            Err(e) => {
                tracing::error!(error = %e, "failed to decode parse message");
                log_settle_error(delivery.nack(true).await);
                return;
            }
        };

        // Locators are `bucket/key`. A malformed one can never be fetched,
        // no matter how often it is retried.
        let Some((bucket, key)) = msg.html_locator.split_once('/') else {
            tracing::error!(url = %msg.url, locator = %msg.html_locator, "invalid blob locator");
            log_settle_error(delivery.nack(true).await);
            return;
        };

        let html = match self.store.get_object(bucket, key).await {
            Ok(data) => data,
            Err(e) => {
                tracing::error!(url = %msg.url, error = %e, "failed to fetch html blob");
                log_settle_error(delivery.nack(false).await);
                return;
            }
        };

        let hash = extract::content_hash(&html);
        match db::content_hash_exists(&self.db, &hash).await {
            Ok(true) => {
                tracing::debug!(url = %msg.url, "duplicate content, skipping");
                if let Err(e) = db::update_url_duplicate(&self.db, msg.url_id, &hash).await {
                    tracing::error!(url = %msg.url, error = %e, "failed to mark url skipped");
                }
                log_settle_error(delivery.ack().await);
                return;
            }
            Ok(false) => {}
            Err(e) => {
                tracing::error!(url = %msg.url, error = %e, "content hash check failed, will retry");
                log_settle_error(delivery.nack(false).await);
                return;
            }
        }

        // Parse once on the blocking pool; the DOM type is not Send so it
        // must not live across an await. Links come out before the text walk
        // removes script/style/noscript/iframe subtrees.
        let base_url = msg.url.clone();
        let parse_result = tokio::task::spawn_blocking(move || {
            let html_str = String::from_utf8_lossy(&html);
            let mut doc = Html::parse_document(&html_str);
            let urls = extract::extract_urls(&doc, &base_url);
            let text = extract::extract_text(&mut doc);
            (urls, text)
        })
        .await;

        let (extracted_urls, text) = match parse_result {
            Ok(parsed) => parsed,
            Err(e) => {
                tracing::error!(url = %msg.url, error = %e, "html parse task failed");
                log_settle_error(delivery.nack(true).await);
                return;
            }
        };

        let text_key = storage::text_key(&msg.url);
        if let Err(e) = self
            .store
            .put_object(TEXT_BUCKET, &text_key, text.into_bytes(), "text/plain")
            .await
        {
            tracing::error!(url = %msg.url, error = %e, "failed to store text");
            log_settle_error(delivery.nack(false).await);
            return;
        }
        let text_locator = format!("{}/{}", TEXT_BUCKET, text_key);

        // Under backpressure the page is still fully parsed; only the
        // discovered links are dropped. A failed length check publishes
        // normally rather than stalling discovery.
        let mut under_backpressure = false;
        match self.publisher.stream_len(FRONTIER_STREAM).await {
            Ok(len) if len > BACKPRESSURE_THRESHOLD => {
                tracing::warn!(stream_len = len, "frontier backpressure, skipping url publishing");
                under_backpressure = true;
            }
            Ok(_) => {}
            Err(e) => {
                tracing::warn!(error = %e, "failed to check frontier length");
            }
        }

        if !under_backpressure
            && !extracted_urls.is_empty()
            && msg.depth + 1 <= self.cfg.max_depth
        {
            self.publish_discovered(&msg, &extracted_urls).await;
        }

        if let Err(e) = db::update_url_parsed(&self.db, msg.url_id, &hash, &text_locator).await {
            tracing::error!(url = %msg.url, error = %e, "failed to update url record");
            log_settle_error(delivery.nack(false).await);
            return;
        }

        tracing::info!(url = %msg.url, extracted_urls = extracted_urls.len(), "parsed successfully");
        log_settle_error(delivery.ack().await);
    }

    /// Upsert unseen domains, bulk-insert the discovered URLs at the next
    /// depth, and publish whichever rows were actually new. A partial bulk
    /// failure still publishes what landed.
    async fn publish_discovered(&self, msg: &ParseMessage, extracted_urls: &[String]) {
        let next_depth = msg.depth + 1;
        let mut valid_urls = Vec::with_capacity(extracted_urls.len());
        let mut valid_domains = Vec::with_capacity(extracted_urls.len());

        for raw in extracted_urls {
            let Some(domain) = url_utils::extract_host(raw) else {
                continue;
            };
            if domain.is_empty() {
                continue;
            }

            if self.seen_domains.insert(domain.clone(), ()).is_none() {
                if let Err(e) =
                    db::upsert_domain(&self.db, &domain, DEFAULT_CRAWL_DELAY_MS).await
                {
                    tracing::warn!(domain = %domain, error = %e, "failed to upsert domain");
                    self.seen_domains.remove(&domain);
                }
            }

            valid_urls.push(raw.clone());
            valid_domains.push(domain);
        }

        if valid_urls.is_empty() {
            return;
        }

        let (inserted, insert_err) =
            db::bulk_insert_urls(&self.db, &valid_urls, &valid_domains, next_depth as i32).await;

        if !inserted.is_empty() {
            let msgs: Vec<UrlMessage> = inserted
                .iter()
                .map(|url| UrlMessage {
                    url: url.clone(),
                    depth: next_depth,
                })
                .collect();
            if let Err(e) = self.publisher.publish_url_batch(&msgs).await {
                tracing::warn!(error = %e, count = msgs.len(), "failed to publish url batch");
            }
        }

        if let Some(e) = insert_err {
            tracing::error!(error = %e, inserted = inserted.len(), "bulk insert partially failed");
        }
    }
}

fn log_settle_error<E: std::fmt::Display>(result: Result<(), E>) {
    if let Err(e) = result {
        tracing::error!(error = %e, "failed to settle delivery");
    }
}
