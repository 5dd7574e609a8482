//! Durable job streams: names, message types, and consumer-group bootstrap.
//!
//! Both pipelines ride Redis Streams. Each stream has one consumer group and
//! a sibling dead-letter stream that receives payloads which will never be
//! retried. Delivery is at-least-once: unacked entries stay in the group's
//! pending list until the reclaim loop re-delivers them.

pub mod consumer;
pub mod publisher;

use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub use consumer::{Consumer, Delivery};
pub use publisher::Publisher;

pub const FRONTIER_STREAM: &str = "stream:frontier";
pub const PARSE_STREAM: &str = "stream:parse";
pub const FRONTIER_DLQ: &str = "stream:frontier:dlq";
pub const PARSE_DLQ: &str = "stream:parse:dlq";

pub const CRAWLER_GROUP: &str = "crawler-workers";
pub const PARSER_GROUP: &str = "parser-workers";

/// Name of the single field carrying the JSON message body.
pub const PAYLOAD_FIELD: &str = "payload";

/// Approximate cap applied on every append so producers trim opportunistically.
pub const MAX_STREAM_LEN: usize = 100_000;

/// Frontier length above which the parser stops publishing discovered links.
/// Coupled to [`MAX_STREAM_LEN`] by construction: it must leave the trimmer
/// headroom, or the cap would silently drop entries instead.
pub const BACKPRESSURE_THRESHOLD: i64 = 80_000;

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("serializing message: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("broker did not answer within {0:?}")]
    Timeout(std::time::Duration),
}

/// A URL awaiting a crawl attempt, carried on the frontier stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UrlMessage {
    pub url: String,
    pub depth: u32,
}

/// A stored HTML page awaiting parsing, carried on the parse stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParseMessage {
    pub url_id: Uuid,
    pub url: String,
    pub html_locator: String,
    pub depth: u32,
}

/// Create both consumer groups (and their underlying streams) idempotently.
pub async fn ensure_groups(conn: &mut ConnectionManager) -> Result<(), QueueError> {
    for (stream, group) in [
        (FRONTIER_STREAM, CRAWLER_GROUP),
        (PARSE_STREAM, PARSER_GROUP),
    ] {
        let res: redis::RedisResult<()> = conn.xgroup_create_mkstream(stream, group, "0").await;
        match res {
            Ok(()) => tracing::info!(stream, group, "created consumer group"),
            // BUSYGROUP means the group already exists
            Err(e) if e.code() == Some("BUSYGROUP") => {
                tracing::debug!(stream, group, "consumer group already exists");
            }
            Err(e) => return Err(e.into()),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_url_message_wire_format() {
        let msg: UrlMessage =
            serde_json::from_str(r#"{"url":"https://example.com/","depth":2}"#).unwrap();
        assert_eq!(msg.url, "https://example.com/");
        assert_eq!(msg.depth, 2);

        let encoded = serde_json::to_string(&msg).unwrap();
        assert!(encoded.contains(r#""url":"https://example.com/""#));
        assert!(encoded.contains(r#""depth":2"#));
    }

    #[test]
    fn test_parse_message_wire_format() {
        let raw = r#"{
            "url_id": "6ba7b810-9dad-11d1-80b4-00c04fd430c8",
            "url": "https://example.com/a",
            "html_locator": "nimbus-html/example.com/a_deadbeef.html",
            "depth": 1
        }"#;
        let msg: ParseMessage = serde_json::from_str(raw).unwrap();
        assert_eq!(msg.url, "https://example.com/a");
        assert_eq!(
            msg.html_locator,
            "nimbus-html/example.com/a_deadbeef.html"
        );
        assert_eq!(msg.depth, 1);
    }
}
