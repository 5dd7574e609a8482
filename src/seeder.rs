//! One-shot seeder: load a file of URLs and publish them onto the frontier
//! at depth 0. Lines already present in the URL table are skipped so the
//! seeder can be re-run safely.

use url::Url;

use crate::db::{self, Db};
use crate::queue::{Publisher, QueueError, UrlMessage};
use crate::robots::DEFAULT_CRAWL_DELAY_MS;

#[derive(Debug, thiserror::Error)]
pub enum SeedError {
    #[error("reading seed file {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },

    #[error(transparent)]
    Queue(#[from] QueueError),
}

/// Returns the number of URLs newly seeded.
pub async fn load_and_publish(
    db: &Db,
    publisher: &Publisher,
    seed_file: &str,
) -> Result<usize, SeedError> {
    let contents = tokio::fs::read_to_string(seed_file)
        .await
        .map_err(|source| SeedError::Read {
            path: seed_file.to_string(),
            source,
        })?;

    let mut count = 0;
    for line in contents.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let parsed = match Url::parse(line) {
            Ok(u) => u,
            Err(e) => {
                tracing::warn!(url = line, error = %e, "invalid seed url");
                continue;
            }
        };
        if !matches!(parsed.scheme(), "http" | "https") {
            tracing::warn!(url = line, scheme = parsed.scheme(), "unsupported scheme in seed url");
            continue;
        }
        let Some(domain) = parsed.host_str() else {
            tracing::warn!(url = line, "no domain in seed url");
            continue;
        };

        if let Err(e) = db::upsert_domain(db, domain, DEFAULT_CRAWL_DELAY_MS).await {
            tracing::warn!(domain, error = %e, "failed to upsert domain");
            continue;
        }

        match db::insert_url(db, line, domain, 0).await {
            Ok(Some(_)) => {}
            Ok(None) => {
                tracing::info!(url = line, "seed url already exists");
                continue;
            }
            Err(e) => {
                tracing::warn!(url = line, error = %e, "failed to insert seed url");
                continue;
            }
        }

        if let Err(e) = publisher
            .publish_url(&UrlMessage {
                url: line.to_string(),
                depth: 0,
            })
            .await
        {
            tracing::error!(url = line, error = %e, "failed to publish seed url");
            continue;
        }

        count += 1;
        tracing::info!(url = line, "seeded url");
    }

    tracing::info!(count, "seeding complete");
    Ok(count)
}
