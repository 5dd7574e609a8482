//! Per-domain sliding-window rate limiter.
//!
//! The window lives in a sorted set keyed by `ratelimit:{domain}` and scored
//! by timestamp. Trim, count, insert, and expire happen in one server-side
//! script so concurrent workers on different machines cannot interleave.

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use rand::Rng;
use redis::aio::ConnectionManager;
use tokio_util::sync::CancellationToken;

const SLIDING_WINDOW_SCRIPT: &str = r#"
local key = KEYS[1]
local now = tonumber(ARGV[1])
local window = tonumber(ARGV[2])
local limit = tonumber(ARGV[3])

redis.call('ZREMRANGEBYSCORE', key, '-inf', now - window)
local count = redis.call('ZCARD', key)

if count < limit then
    redis.call('ZADD', key, now, now .. '-' .. math.random(1000000))
    redis.call('EXPIRE', key, math.ceil(window / 1000))
    return 1
end
return 0
"#;

#[derive(Debug, thiserror::Error)]
pub enum RateLimitError {
    #[error("rate limit script: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("rate limiter wait cancelled")]
    Cancelled,
}

#[derive(Clone)]
pub struct RateLimiter {
    conn: ConnectionManager,
    script: Arc<redis::Script>,
}

impl RateLimiter {
    pub fn new(conn: ConnectionManager) -> Self {
        Self {
            conn,
            script: Arc::new(redis::Script::new(SLIDING_WINDOW_SCRIPT)),
        }
    }

    /// One admission check against the window. `window_ms` is the sliding
    /// window size; `limit` the number of requests allowed inside it.
    pub async fn allow(
        &self,
        domain: &str,
        window_ms: u64,
        limit: u32,
    ) -> Result<bool, RateLimitError> {
        let key = format!("ratelimit:{}", domain);
        let now_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64;

        let mut conn = self.conn.clone();
        let allowed: i64 = self
            .script
            .key(key)
            .arg(now_ms)
            .arg(window_ms)
            .arg(limit)
            .invoke_async(&mut conn)
            .await?;

        Ok(allowed == 1)
    }

    /// Block until the domain admits a request, sleeping half a window plus
    /// jitter between attempts so waiting workers spread out.
    pub async fn wait_for_allow(
        &self,
        token: &CancellationToken,
        domain: &str,
        crawl_delay_ms: u64,
    ) -> Result<(), RateLimitError> {
        loop {
            if self.allow(domain, crawl_delay_ms, 1).await? {
                return Ok(());
            }

            let jitter = rand::thread_rng().gen_range(0..=crawl_delay_ms / 2);
            let wait = Duration::from_millis(crawl_delay_ms / 2 + jitter);
            tokio::select! {
                _ = token.cancelled() => return Err(RateLimitError::Cancelled),
                _ = tokio::time::sleep(wait) => {}
            }
        }
    }
}
