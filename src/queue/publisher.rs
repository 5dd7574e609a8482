//! Producer side of the job streams.

use redis::aio::ConnectionManager;
use redis::streams::StreamMaxlen;
use redis::AsyncCommands;

use super::{
    ParseMessage, QueueError, UrlMessage, FRONTIER_STREAM, MAX_STREAM_LEN, PARSE_STREAM,
    PAYLOAD_FIELD,
};

/// Pipelined appends are chunked to bound publisher memory.
pub const PIPELINE_BATCH_MAX: usize = 500;

#[derive(Clone)]
pub struct Publisher {
    conn: ConnectionManager,
}

impl Publisher {
    pub fn new(conn: ConnectionManager) -> Self {
        Self { conn }
    }

    pub async fn publish_url(&self, msg: &UrlMessage) -> Result<(), QueueError> {
        self.publish(FRONTIER_STREAM, serde_json::to_vec(msg)?).await
    }

    pub async fn publish_parse(&self, msg: &ParseMessage) -> Result<(), QueueError> {
        self.publish(PARSE_STREAM, serde_json::to_vec(msg)?).await
    }

    /// Append a batch of frontier messages, pipelined in chunks of
    /// [`PIPELINE_BATCH_MAX`].
    pub async fn publish_url_batch(&self, msgs: &[UrlMessage]) -> Result<(), QueueError> {
        if msgs.is_empty() {
            return Ok(());
        }

        let mut conn = self.conn.clone();
        for chunk in msgs.chunks(PIPELINE_BATCH_MAX) {
            let mut pipe = redis::pipe();
            for msg in chunk {
                let payload = serde_json::to_vec(msg)?;
                pipe.xadd_maxlen(
                    FRONTIER_STREAM,
                    StreamMaxlen::Approx(MAX_STREAM_LEN),
                    "*",
                    &[(PAYLOAD_FIELD, payload)],
                )
                .ignore();
            }
            let _: () = pipe.query_async(&mut conn).await?;
        }
        Ok(())
    }

    /// Current entry count of a stream, used for backpressure decisions.
    pub async fn stream_len(&self, stream: &str) -> Result<i64, QueueError> {
        let mut conn = self.conn.clone();
        let len: i64 = conn.xlen(stream).await?;
        Ok(len)
    }

    async fn publish(&self, stream: &str, payload: Vec<u8>) -> Result<(), QueueError> {
        let mut conn = self.conn.clone();
        let _: String = conn
            .xadd_maxlen(
                stream,
                StreamMaxlen::Approx(MAX_STREAM_LEN),
                "*",
                &[(PAYLOAD_FIELD, payload)],
            )
            .await?;
        Ok(())
    }
}
