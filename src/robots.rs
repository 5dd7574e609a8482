//! robots.txt fetching, caching, and crawl-delay extraction.
//!
//! Lookup order per domain: broker hash cache, then the domain row, then a
//! live fetch of `https://{domain}/robots.txt`. Every failure along the way
//! fails open (the URL is allowed with the default delay) because the rate
//! limiter still bounds how hard an unreadable domain gets hit.

use std::collections::HashMap;
use std::time::Duration;

use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use robotstxt::DefaultMatcher;

use crate::db::{self, Db, DbError};

/// Token matched against robots.txt groups.
pub const CRAWLER_NAME: &str = "NimbusCrawler";
/// Full User-Agent header value sent with every request.
pub const CRAWLER_USER_AGENT: &str = "NimbusCrawler/1.0";

/// Fallback crawl delay when no Crawl-Delay directive exists.
pub const DEFAULT_CRAWL_DELAY_MS: u64 = 200;
/// Floor applied to any parsed Crawl-Delay.
pub const MIN_CRAWL_DELAY_MS: u64 = 100;

const ROBOTS_KEY_PREFIX: &str = "robots:";
const ROBOTS_CACHE_TTL_SECS: i64 = 60 * 60;
const ROBOTS_FETCH_TIMEOUT: Duration = Duration::from_secs(2);
const MAX_ROBOTS_BODY_SIZE: usize = 512 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum RobotsError {
    #[error("db get domain: {0}")]
    Db(#[from] DbError),

    #[error("reading robots.txt: {0}")]
    Fetch(String),
}

#[derive(Clone)]
pub struct RobotsChecker {
    db: Db,
    conn: ConnectionManager,
    client: reqwest::Client,
}

impl RobotsChecker {
    pub fn new(db: Db, conn: ConnectionManager) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .timeout(ROBOTS_FETCH_TIMEOUT)
            .user_agent(CRAWLER_USER_AGENT)
            .build()?;
        Ok(Self { db, conn, client })
    }

    /// Whether `raw_url` may be crawled, plus the effective crawl delay in
    /// milliseconds. Never errors: robots problems allow with the default.
    pub async fn is_allowed(&self, raw_url: &str, domain: &str) -> (bool, u64) {
        let (body, delay) = match self.robots_text(domain).await {
            Ok(r) => r,
            Err(e) => {
                tracing::warn!(domain, error = %e, "failed to get robots.txt, allowing");
                return (true, DEFAULT_CRAWL_DELAY_MS);
            }
        };

        if body.is_empty() {
            return (true, delay);
        }

        let mut matcher = DefaultMatcher::default();
        let allowed = matcher.one_agent_allowed_by_robots(&body, CRAWLER_NAME, raw_url);
        (allowed, delay)
    }

    /// Resolve the robots body and crawl delay through the cache hierarchy.
    async fn robots_text(&self, domain: &str) -> Result<(String, u64), RobotsError> {
        let key = format!("{}{}", ROBOTS_KEY_PREFIX, domain);
        let mut conn = self.conn.clone();

        match conn.hgetall::<_, HashMap<String, String>>(&key).await {
            Ok(cached) if !cached.is_empty() => {
                let delay = cached
                    .get("delay")
                    .and_then(|d| d.parse().ok())
                    .unwrap_or(DEFAULT_CRAWL_DELAY_MS);
                let body = cached.get("body").cloned().unwrap_or_default();
                return Ok((body, delay));
            }
            Ok(_) => {}
            Err(e) => {
                // Leftover key in the legacy string format; drop it and refetch.
                tracing::warn!(key = %key, error = %e, "deleting stale robots cache key");
                let _: redis::RedisResult<()> = conn.del(&key).await;
            }
        }

        match db::get_domain(&self.db, domain).await? {
            Some(record) => {
                if let Some(body) = record.robots_txt {
                    let delay = record.crawl_delay_ms.max(0) as u64;
                    self.cache_robots(&key, &body, delay).await;
                    return Ok((body, delay));
                }
            }
            None => {}
        }

        self.fetch_robots(domain, &key).await
    }

    async fn fetch_robots(&self, domain: &str, key: &str) -> Result<(String, u64), RobotsError> {
        let robots_url = format!("https://{}/robots.txt", domain);

        let resp = match self.client.get(&robots_url).send().await {
            Ok(r) if r.status() == reqwest::StatusCode::OK => r,
            // Network error or non-200: remember the default so every worker
            // does not refetch, and treat the domain as allow-all.
            _ => {
                let _ = db::upsert_domain(&self.db, domain, DEFAULT_CRAWL_DELAY_MS).await;
                self.cache_robots(key, "", DEFAULT_CRAWL_DELAY_MS).await;
                return Ok((String::new(), DEFAULT_CRAWL_DELAY_MS));
            }
        };

        let bytes = resp
            .bytes()
            .await
            .map_err(|e| RobotsError::Fetch(e.to_string()))?;
        let capped = &bytes[..bytes.len().min(MAX_ROBOTS_BODY_SIZE)];
        let body = String::from_utf8_lossy(capped).into_owned();

        let delay = extract_crawl_delay(&body);

        if let Err(e) = db::upsert_domain_with_robots(&self.db, domain, &body, delay).await {
            tracing::warn!(domain, error = %e, "failed to persist robots.txt");
        }
        self.cache_robots(key, &body, delay).await;

        Ok((body, delay))
    }

    async fn cache_robots(&self, key: &str, body: &str, delay: u64) {
        let mut conn = self.conn.clone();
        let delay_str = delay.to_string();
        let mut pipe = redis::pipe();
        pipe.hset_multiple(key, &[("body", body), ("delay", delay_str.as_str())])
            .ignore()
            .expire(key, ROBOTS_CACHE_TTL_SECS)
            .ignore();
        let cached: redis::RedisResult<()> = pipe.query_async(&mut conn).await;
        if let Err(e) = cached {
            tracing::warn!(key, error = %e, "failed to cache robots.txt");
        }
    }
}

/// Crawl-Delay in milliseconds for our crawler token, preferring its group
/// over `*`, floored at [`MIN_CRAWL_DELAY_MS`]. Directives are seconds and
/// may be fractional.
pub fn extract_crawl_delay(robots_body: &str) -> u64 {
    let mut specific: Option<f64> = None;
    let mut wildcard: Option<f64> = None;
    let mut in_specific = false;
    let mut in_wildcard = false;
    let mut last_was_agent = false;

    for line in robots_body.lines() {
        let line = line.split('#').next().unwrap_or("").trim();
        if line.is_empty() {
            continue;
        }
        let Some((field, value)) = line.split_once(':') else {
            continue;
        };
        let field = field.trim().to_ascii_lowercase();
        let value = value.trim();

        match field.as_str() {
            "user-agent" => {
                // Consecutive User-agent lines accumulate into one group;
                // any other directive ends the header run.
                if !last_was_agent {
                    in_specific = false;
                    in_wildcard = false;
                }
                if value == "*" {
                    in_wildcard = true;
                }
                if value.eq_ignore_ascii_case(CRAWLER_NAME) {
                    in_specific = true;
                }
                last_was_agent = true;
            }
            "crawl-delay" => {
                last_was_agent = false;
                if let Ok(secs) = value.parse::<f64>() {
                    if in_specific && specific.is_none() {
                        specific = Some(secs);
                    }
                    if in_wildcard && wildcard.is_none() {
                        wildcard = Some(secs);
                    }
                }
            }
            _ => {
                last_was_agent = false;
            }
        }
    }

    match specific.or(wildcard) {
        Some(secs) if secs > 0.0 => ((secs * 1000.0) as u64).max(MIN_CRAWL_DELAY_MS),
        _ => DEFAULT_CRAWL_DELAY_MS,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_directive_yields_default() {
        assert_eq!(extract_crawl_delay(""), DEFAULT_CRAWL_DELAY_MS);
        assert_eq!(
            extract_crawl_delay("User-agent: *\nDisallow: /admin/"),
            DEFAULT_CRAWL_DELAY_MS
        );
    }

    #[test]
    fn test_wildcard_group_delay() {
        let body = "User-agent: *\nCrawl-delay: 1";
        assert_eq!(extract_crawl_delay(body), 1000);
    }

    #[test]
    fn test_specific_group_preferred() {
        let body = "User-agent: NimbusCrawler\nCrawl-delay: 2\n\nUser-agent: *\nCrawl-delay: 9";
        assert_eq!(extract_crawl_delay(body), 2000);

        let reversed = "User-agent: *\nCrawl-delay: 9\n\nUser-agent: nimbuscrawler\nCrawl-delay: 2";
        assert_eq!(extract_crawl_delay(reversed), 2000);
    }

    #[test]
    fn test_delay_floor_and_fractions() {
        assert_eq!(extract_crawl_delay("User-agent: *\nCrawl-delay: 0.05"), 100);
        assert_eq!(extract_crawl_delay("User-agent: *\nCrawl-delay: 0.5"), 500);
    }

    #[test]
    fn test_stacked_agent_lines_share_rules() {
        let body = "User-agent: SomebodyElse\nUser-agent: NimbusCrawler\nCrawl-delay: 3";
        assert_eq!(extract_crawl_delay(body), 3000);
    }

    #[test]
    fn test_other_groups_ignored() {
        let body = "User-agent: SomebodyElse\nCrawl-delay: 30";
        assert_eq!(extract_crawl_delay(body), DEFAULT_CRAWL_DELAY_MS);
    }

    #[test]
    fn test_matcher_honors_disallow() {
        let body = "User-agent: NimbusCrawler\nDisallow: /admin/";
        let mut matcher = DefaultMatcher::default();
        assert!(!matcher.one_agent_allowed_by_robots(
            body,
            CRAWLER_NAME,
            "https://site.example/admin/x"
        ));
        assert!(matcher.one_agent_allowed_by_robots(
            body,
            CRAWLER_NAME,
            "https://site.example/pub"
        ));
    }
}
