use chrono::{DateTime, Utc};

use super::{Db, DbError};

#[derive(Debug, Clone)]
pub struct DomainRecord {
    pub domain: String,
    pub last_crawl_time: Option<DateTime<Utc>>,
    pub robots_txt: Option<String>,
    pub crawl_delay_ms: i32,
    pub created_at: DateTime<Utc>,
}

/// Insert-or-ignore: existing rows keep their robots body and delay.
pub async fn upsert_domain(db: &Db, domain: &str, crawl_delay_ms: u64) -> Result<(), DbError> {
    let client = db.get().await?;
    client
        .execute(
            "INSERT INTO domains (domain, crawl_delay_ms) VALUES ($1, $2)
             ON CONFLICT (domain) DO NOTHING",
            &[&domain, &(crawl_delay_ms as i32)],
        )
        .await?;
    Ok(())
}

/// Insert or refresh the stored robots.txt body and crawl delay.
pub async fn upsert_domain_with_robots(
    db: &Db,
    domain: &str,
    robots_txt: &str,
    crawl_delay_ms: u64,
) -> Result<(), DbError> {
    let client = db.get().await?;
    client
        .execute(
            "INSERT INTO domains (domain, robots_txt, crawl_delay_ms) VALUES ($1, $2, $3)
             ON CONFLICT (domain) DO UPDATE
             SET robots_txt = EXCLUDED.robots_txt, crawl_delay_ms = EXCLUDED.crawl_delay_ms",
            &[&domain, &robots_txt, &(crawl_delay_ms as i32)],
        )
        .await?;
    Ok(())
}

pub async fn get_domain(db: &Db, domain: &str) -> Result<Option<DomainRecord>, DbError> {
    let client = db.get().await?;
    let row = client
        .query_opt(
            "SELECT domain, last_crawl_time, robots_txt, crawl_delay_ms, created_at
             FROM domains WHERE domain = $1",
            &[&domain],
        )
        .await?;

    Ok(row.map(|r| DomainRecord {
        domain: r.get(0),
        last_crawl_time: r.get(1),
        robots_txt: r.get(2),
        crawl_delay_ms: r.get(3),
        created_at: r.get(4),
    }))
}
