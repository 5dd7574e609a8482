//! Consumer-group read and reclaim loops.
//!
//! `Consumer::run` spawns two loops feeding one delivery channel: a blocking
//! XREADGROUP loop for new entries and an XAUTOCLAIM loop that re-delivers
//! entries another consumer accepted but never acked. The channel closes once
//! both loops exit, which is how workers learn the consumer shut down.

use std::time::Duration;

use redis::aio::ConnectionManager;
use redis::streams::{
    StreamAutoClaimOptions, StreamAutoClaimReply, StreamId, StreamMaxlen, StreamReadOptions,
    StreamReadReply,
};
use redis::AsyncCommands;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use super::{QueueError, MAX_STREAM_LEN, PAYLOAD_FIELD};

const BLOCK_MS: usize = 5_000;
const READ_ERROR_BACKOFF: Duration = Duration::from_secs(1);
const RECLAIM_INTERVAL: Duration = Duration::from_secs(30);
const RECLAIM_MIN_IDLE_MS: usize = 60_000;
const RECLAIM_BATCH_SIZE: usize = 50;
const ACK_TIMEOUT: Duration = Duration::from_secs(5);

/// One message handed to a worker, with its settlement handles.
pub struct Delivery {
    pub body: Vec<u8>,
    id: String,
    stream: &'static str,
    dlq: &'static str,
    group: &'static str,
    conn: ConnectionManager,
}

impl Delivery {
    /// Remove this entry from the pending list.
    ///
    /// Runs on its own connection under a short timeout so an entry in flight
    /// during shutdown is still settled after the consumer context is gone.
    pub async fn ack(&self) -> Result<(), QueueError> {
        let mut conn = self.conn.clone();
        let stream = self.stream;
        let group = self.group;
        let id = self.id.clone();
        tokio::time::timeout(ACK_TIMEOUT, async move {
            let _: i64 = conn.xack(stream, group, &[&id]).await?;
            Ok(())
        })
        .await
        .map_err(|_| QueueError::Timeout(ACK_TIMEOUT))?
    }

    /// Settle without success. With `to_dlq` the payload is re-published
    /// verbatim to the sibling dead-letter stream and then acked; without it
    /// this is a no-op and the entry stays pending for the reclaim loop.
    pub async fn nack(&self, to_dlq: bool) -> Result<(), QueueError> {
        if !to_dlq {
            return Ok(());
        }

        let mut conn = self.conn.clone();
        let stream = self.stream;
        let dlq = self.dlq;
        let group = self.group;
        let id = self.id.clone();
        let payload = self.body.clone();
        tokio::time::timeout(ACK_TIMEOUT, async move {
            let _: String = conn
                .xadd_maxlen(
                    dlq,
                    StreamMaxlen::Approx(MAX_STREAM_LEN),
                    "*",
                    &[(PAYLOAD_FIELD, payload)],
                )
                .await?;
            let _: i64 = conn.xack(stream, group, &[&id]).await?;
            Ok(())
        })
        .await
        .map_err(|_| QueueError::Timeout(ACK_TIMEOUT))?
    }
}

#[derive(Clone)]
pub struct Consumer {
    client: redis::Client,
    conn: ConnectionManager,
    stream: &'static str,
    dlq: &'static str,
    group: &'static str,
    name: String,
    count: usize,
    tasks: TaskTracker,
}

impl Consumer {
    pub fn new(
        client: redis::Client,
        conn: ConnectionManager,
        stream: &'static str,
        dlq: &'static str,
        group: &'static str,
        name: String,
        count: usize,
    ) -> Self {
        Self {
            client,
            conn,
            stream,
            dlq,
            group,
            name,
            count: count.max(1),
            tasks: TaskTracker::new(),
        }
    }

    /// Start the read and reclaim loops and return the delivery channel.
    /// The channel closes after both loops have exited.
    pub fn run(&self, token: CancellationToken) -> flume::Receiver<Delivery> {
        let (tx, rx) = flume::bounded(self.count);

        let reader = self.clone();
        let reader_tx = tx.clone();
        let reader_token = token.clone();
        self.tasks.spawn(async move {
            reader.read_loop(reader_tx, reader_token).await;
        });

        let reclaimer = self.clone();
        self.tasks.spawn(async move {
            reclaimer.reclaim_loop(tx, token).await;
        });

        rx
    }

    /// Block until both loops have fully exited.
    pub async fn wait(&self) {
        self.tasks.close();
        self.tasks.wait().await;
    }

    async fn read_loop(&self, tx: flume::Sender<Delivery>, token: CancellationToken) {
        // The blocking read gets a dedicated connection so it cannot stall
        // acks or reclaims multiplexed elsewhere.
        let mut read_conn = loop {
            if token.is_cancelled() {
                return;
            }
            match ConnectionManager::new(self.client.clone()).await {
                Ok(conn) => break conn,
                Err(e) => {
                    tracing::error!(error = %e, stream = self.stream, "connecting read loop");
                    tokio::select! {
                        _ = token.cancelled() => return,
                        _ = tokio::time::sleep(READ_ERROR_BACKOFF) => {}
                    }
                }
            }
        };

        let opts = StreamReadOptions::default()
            .group(self.group, &self.name)
            .count(self.count)
            .block(BLOCK_MS);

        loop {
            if token.is_cancelled() {
                return;
            }

            let streams = [self.stream];
            let ids = [">"];
            let reply: redis::RedisResult<Option<StreamReadReply>> = tokio::select! {
                _ = token.cancelled() => return,
                r = read_conn.xread_options(&streams, &ids, &opts) => r,
            };

            match reply {
                Ok(Some(reply)) => {
                    for key in reply.keys {
                        for entry in key.ids {
                            let Some(delivery) = self.build_delivery(entry).await else {
                                continue;
                            };
                            tokio::select! {
                                _ = token.cancelled() => return,
                                sent = tx.send_async(delivery) => {
                                    if sent.is_err() {
                                        return;
                                    }
                                }
                            }
                        }
                    }
                }
                Ok(None) => continue,
                Err(e) => {
                    if token.is_cancelled() {
                        return;
                    }
                    tracing::error!(error = %e, stream = self.stream, "stream read error");
                    tokio::select! {
                        _ = token.cancelled() => return,
                        _ = tokio::time::sleep(READ_ERROR_BACKOFF) => {}
                    }
                }
            }
        }
    }

    async fn reclaim_loop(&self, tx: flume::Sender<Delivery>, token: CancellationToken) {
        let start = tokio::time::Instant::now() + RECLAIM_INTERVAL;
        let mut ticker = tokio::time::interval_at(start, RECLAIM_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = token.cancelled() => return,
                _ = ticker.tick() => {}
            }
            if self.reclaim_pending(&tx, &token).await.is_err() {
                return;
            }
        }
    }

    /// Claim entries idle past the threshold, walking the pending cursor
    /// until exhausted for this tick. Err means the loop should exit.
    async fn reclaim_pending(
        &self,
        tx: &flume::Sender<Delivery>,
        token: &CancellationToken,
    ) -> Result<(), ()> {
        let mut conn = self.conn.clone();
        let mut cursor = "0-0".to_string();

        loop {
            let opts = StreamAutoClaimOptions::default().count(RECLAIM_BATCH_SIZE);
            let reply: redis::RedisResult<StreamAutoClaimReply> = conn
                .xautoclaim_options(
                    self.stream,
                    self.group,
                    &self.name,
                    RECLAIM_MIN_IDLE_MS,
                    &cursor,
                    opts,
                )
                .await;

            let reply = match reply {
                Ok(r) => r,
                Err(e) => {
                    if !token.is_cancelled() {
                        tracing::error!(error = %e, stream = self.stream, "auto-claim error");
                    }
                    return Ok(());
                }
            };

            let claimed = reply.claimed.len();
            for entry in reply.claimed {
                let Some(delivery) = self.build_delivery(entry).await else {
                    continue;
                };
                tokio::select! {
                    _ = token.cancelled() => return Err(()),
                    sent = tx.send_async(delivery) => {
                        if sent.is_err() {
                            return Err(());
                        }
                    }
                }
            }

            if reply.next_stream_id == "0-0" || claimed == 0 {
                return Ok(());
            }
            cursor = reply.next_stream_id;
        }
    }

    /// Turn a raw stream entry into a Delivery. Entries without a usable
    /// payload cannot be retried meaningfully, so they are acked and dropped.
    async fn build_delivery(&self, entry: StreamId) -> Option<Delivery> {
        let payload: Vec<u8> = entry
            .map
            .get(PAYLOAD_FIELD)
            .and_then(|v| redis::from_redis_value(v).ok())
            .unwrap_or_default();

        if payload.is_empty() {
            tracing::error!(
                stream = self.stream,
                id = %entry.id,
                "stream entry missing payload field, dropping"
            );
            let mut conn = self.conn.clone();
            let stream = self.stream;
            let group = self.group;
            let id = entry.id.clone();
            let _ = tokio::time::timeout(ACK_TIMEOUT, async move {
                let _: redis::RedisResult<i64> = conn.xack(stream, group, &[&id]).await;
            })
            .await;
            return None;
        }

        Some(Delivery {
            body: payload,
            id: entry.id,
            stream: self.stream,
            dlq: self.dlq,
            group: self.group,
            conn: self.conn.clone(),
        })
    }
}
