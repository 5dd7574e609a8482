use std::fmt;
use std::time::Duration;

use uuid::Uuid;

use super::{Db, DbError};

/// Chunk size for the batched discovered-URL insert.
const BULK_INSERT_CHUNK: usize = 500;

/// Lifecycle of a URL row. Only the transitions driven by the claim
/// statement, the crawler, the parser, and the stale-claim reaper are legal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UrlStatus {
    Pending,
    Crawling,
    Crawled,
    Parsed,
    Failed,
    Skipped,
}

impl UrlStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            UrlStatus::Pending => "pending",
            UrlStatus::Crawling => "crawling",
            UrlStatus::Crawled => "crawled",
            UrlStatus::Parsed => "parsed",
            UrlStatus::Failed => "failed",
            UrlStatus::Skipped => "skipped",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(UrlStatus::Pending),
            "crawling" => Some(UrlStatus::Crawling),
            "crawled" => Some(UrlStatus::Crawled),
            "parsed" => Some(UrlStatus::Parsed),
            "failed" => Some(UrlStatus::Failed),
            "skipped" => Some(UrlStatus::Skipped),
            _ => None,
        }
    }
}

impl fmt::Display for UrlStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Insert a URL; `None` when it already exists.
pub async fn insert_url(
    db: &Db,
    url: &str,
    domain: &str,
    depth: i32,
) -> Result<Option<Uuid>, DbError> {
    let client = db.get().await?;
    let row = client
        .query_opt(
            "INSERT INTO urls (url, domain, depth) VALUES ($1, $2, $3)
             ON CONFLICT (url) DO NOTHING
             RETURNING id",
            &[&url, &domain, &depth],
        )
        .await?;
    Ok(row.map(|r| r.get(0)))
}

/// Batch-insert discovered URLs, returning only the ones that were actually
/// inserted. Inserts run in chunks; on a chunk error the URLs inserted so
/// far are still returned alongside the error so callers can publish them.
pub async fn bulk_insert_urls(
    db: &Db,
    urls: &[String],
    domains: &[String],
    depth: i32,
) -> (Vec<String>, Option<DbError>) {
    debug_assert_eq!(urls.len(), domains.len());

    let mut inserted = Vec::new();
    let client = match db.get().await {
        Ok(c) => c,
        Err(e) => return (inserted, Some(e.into())),
    };

    for (url_chunk, domain_chunk) in urls
        .chunks(BULK_INSERT_CHUNK)
        .zip(domains.chunks(BULK_INSERT_CHUNK))
    {
        let rows = client
            .query(
                "INSERT INTO urls (url, domain, depth)
                 SELECT t.url, t.domain, $3
                 FROM UNNEST($1::text[], $2::text[]) AS t(url, domain)
                 ON CONFLICT (url) DO NOTHING
                 RETURNING url",
                &[&url_chunk, &domain_chunk, &depth],
            )
            .await;

        match rows {
            Ok(rows) => inserted.extend(rows.iter().map(|r| r.get::<_, String>(0))),
            Err(e) => return (inserted, Some(e.into())),
        }
    }

    (inserted, None)
}

/// Atomic claim: insert the URL as `crawling`, or on conflict transition it
/// `pending`/`failed` → `crawling`. Returns `None` when neither happened:
/// the row is owned by another crawler or in a terminal state. The row lock
/// taken by the conflict update serializes racing claimants, so at most one
/// caller per URL ever sees `crawling` back.
pub async fn upsert_url_returning(
    db: &Db,
    url: &str,
    domain: &str,
    depth: i32,
) -> Result<Option<(Uuid, UrlStatus)>, DbError> {
    let client = db.get().await?;
    let row = client
        .query_opt(
            "INSERT INTO urls (url, domain, depth, status) VALUES ($1, $2, $3, 'crawling')
             ON CONFLICT (url) DO UPDATE
             SET status = 'crawling', updated_at = NOW()
             WHERE urls.status IN ('pending', 'failed')
             RETURNING id, status",
            &[&url, &domain, &depth],
        )
        .await?;

    Ok(row.map(|r| {
        let status: String = r.get(1);
        (
            r.get(0),
            UrlStatus::parse(&status).unwrap_or(UrlStatus::Crawling),
        )
    }))
}

pub async fn update_url_status(db: &Db, id: Uuid, status: UrlStatus) -> Result<(), DbError> {
    let client = db.get().await?;
    client
        .execute(
            "UPDATE urls SET status = $2, updated_at = NOW() WHERE id = $1",
            &[&id, &status.as_str()],
        )
        .await?;
    Ok(())
}

pub async fn update_url_crawled(db: &Db, id: Uuid, html_locator: &str) -> Result<(), DbError> {
    let client = db.get().await?;
    client
        .execute(
            "UPDATE urls SET status = 'crawled', html_locator = $2,
                    last_crawl_time = NOW(), updated_at = NOW()
             WHERE id = $1",
            &[&id, &html_locator],
        )
        .await?;
    Ok(())
}

pub async fn update_url_parsed(
    db: &Db,
    id: Uuid,
    content_hash: &str,
    text_locator: &str,
) -> Result<(), DbError> {
    let client = db.get().await?;
    client
        .execute(
            "UPDATE urls SET status = 'parsed', content_hash = $2, text_locator = $3,
                    updated_at = NOW()
             WHERE id = $1",
            &[&id, &content_hash, &text_locator],
        )
        .await?;
    Ok(())
}

/// Duplicate-content outcome: mark skipped and record the hash that matched.
pub async fn update_url_duplicate(db: &Db, id: Uuid, content_hash: &str) -> Result<(), DbError> {
    let client = db.get().await?;
    client
        .execute(
            "UPDATE urls SET status = 'skipped', content_hash = $2, updated_at = NOW()
             WHERE id = $1",
            &[&id, &content_hash],
        )
        .await?;
    Ok(())
}

/// Bump the retry counter and, when it reaches `max_retries`, flip the row
/// to `failed` in the same statement. A non-final failure releases the claim
/// back to `pending`, since the deferred re-publish could never re-claim a
/// row still marked `crawling`. Returns the new counter value.
pub async fn increment_retry_and_maybe_fail(
    db: &Db,
    id: Uuid,
    max_retries: i32,
) -> Result<i32, DbError> {
    let client = db.get().await?;
    let row = client
        .query_one(
            "UPDATE urls SET
                retry_count = retry_count + 1,
                status = CASE WHEN retry_count + 1 >= $2 THEN 'failed' ELSE 'pending' END,
                updated_at = NOW()
             WHERE id = $1
             RETURNING retry_count",
            &[&id, &max_retries],
        )
        .await?;
    Ok(row.get(0))
}

/// Revert rows stuck in `crawling` by a crashed claimant. Returns the count.
pub async fn reset_stale_crawling_urls(db: &Db, older_than: Duration) -> Result<u64, DbError> {
    let client = db.get().await?;
    let count = client
        .execute(
            "UPDATE urls SET status = 'pending', updated_at = NOW()
             WHERE status = 'crawling'
               AND updated_at < NOW() - make_interval(secs => $1)",
            &[&older_than.as_secs_f64()],
        )
        .await?;
    Ok(count)
}

pub async fn content_hash_exists(db: &Db, content_hash: &str) -> Result<bool, DbError> {
    let client = db.get().await?;
    let row = client
        .query_one(
            "SELECT EXISTS(SELECT 1 FROM urls WHERE content_hash = $1)",
            &[&content_hash],
        )
        .await?;
    Ok(row.get(0))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_round_trips() {
        for status in [
            UrlStatus::Pending,
            UrlStatus::Crawling,
            UrlStatus::Crawled,
            UrlStatus::Parsed,
            UrlStatus::Failed,
            UrlStatus::Skipped,
        ] {
            assert_eq!(UrlStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(UrlStatus::parse("unknown"), None);
    }
}
