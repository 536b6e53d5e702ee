//! Redis Streams backend
//!
//! A topic maps to one stream key (a single partition). Consumer groups map
//! to `XGROUP`/`XREADGROUP`, commits to `XACK`. Each record is a stream
//! entry with a `value` field and an optional `key` field.
//!
//! On startup a subscription first replays the entries still pending for
//! its consumer name (delivered earlier but never acknowledged), then reads
//! new entries. The replay walks the pending list with a cursor, so an entry
//! handed out once is not handed out again while its ack is outstanding.
//!
//! Blocking reads run on a connection of their own; acks and publishes share
//! a second one and never queue behind a `BLOCK`.

use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::streams::{StreamId, StreamReadOptions, StreamReadReply};
use redis::AsyncCommands;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, info, warn};

use super::{Broker, Message, Offset, Publisher, Subscription};
use crate::error::BrokerError;

/// How long one `XREADGROUP` blocks before polling again (in milliseconds)
const READ_BLOCK_MS: usize = 1_000;

/// Stream entry field holding the record value
const VALUE_FIELD: &str = "value";

/// Stream entry field holding the optional record key
const KEY_FIELD: &str = "key";

/// Id before the first pending entry
const PENDING_START: &str = "0";

/// Default consumer name within a group
pub const DEFAULT_CONSUMER_NAME: &str = "bridge";

/// Broker backed by Redis Streams
pub struct RedisBroker {
    client: redis::Client,
    connection: MultiplexedConnection,
    consumer: String,
}

impl RedisBroker {
    /// Connect to `url` (e.g. `redis://127.0.0.1:6379`).
    pub async fn connect(url: &str, consumer: impl Into<String>) -> Result<Self, BrokerError> {
        let client =
            redis::Client::open(url).map_err(|e| BrokerError::InvalidAddress(format!("{url}: {e}")))?;
        let connection = client.get_multiplexed_async_connection().await?;
        let consumer = consumer.into();
        info!(url, consumer = %consumer, "Connected to Redis broker");
        Ok(Self {
            client,
            connection,
            consumer,
        })
    }
}

#[async_trait]
impl Broker for RedisBroker {
    async fn subscribe(
        &self,
        topic: &str,
        group: &str,
    ) -> Result<Arc<dyn Subscription>, BrokerError> {
        let mut conn = self.connection.clone();
        let created: Result<(), redis::RedisError> =
            conn.xgroup_create_mkstream(topic, group, "$").await;
        match created {
            Ok(()) => info!(topic, group, "Created consumer group"),
            Err(e) if e.code() == Some("BUSYGROUP") => {
                debug!(topic, group, "Consumer group already exists");
            }
            Err(e) => return Err(e.into()),
        }

        let reader = self.client.get_multiplexed_async_connection().await?;
        Ok(Arc::new(RedisSubscription {
            reader,
            connection: self.connection.clone(),
            topic: topic.to_string(),
            group: group.to_string(),
            consumer: self.consumer.clone(),
            replay_cursor: Mutex::new(PENDING_START.to_string()),
            backlog_done: AtomicBool::new(false),
        }))
    }

    async fn publisher(&self, topic: &str) -> Result<Arc<dyn Publisher>, BrokerError> {
        Ok(Arc::new(RedisPublisher {
            connection: self.connection.clone(),
            topic: topic.to_string(),
        }))
    }
}

struct RedisSubscription {
    /// Dedicated to `XREADGROUP`, which may block
    reader: MultiplexedConnection,
    /// Shared with publishers, used for `XACK`
    connection: MultiplexedConnection,
    topic: String,
    group: String,
    consumer: String,
    /// Id of the last pending entry handed out during replay
    replay_cursor: Mutex<String>,
    backlog_done: AtomicBool,
}

impl RedisSubscription {
    async fn read(&self, id: &str, block: bool) -> Result<Vec<StreamId>, BrokerError> {
        let mut opts = StreamReadOptions::default()
            .group(&self.group, &self.consumer)
            .count(1);
        if block {
            opts = opts.block(READ_BLOCK_MS);
        }

        let mut conn = self.reader.clone();
        let reply: Option<StreamReadReply> =
            conn.xread_options(&[&self.topic], &[id], &opts).await?;

        Ok(reply
            .map(|r| r.keys.into_iter().flat_map(|k| k.ids).collect())
            .unwrap_or_default())
    }

    fn cursor(&self) -> std::sync::MutexGuard<'_, String> {
        self.replay_cursor.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Convert an entry, acknowledging and skipping it if it has no value.
    async fn to_message(&self, entry: StreamId) -> Result<Option<Message>, BrokerError> {
        let Some(value) = entry.get::<String>(VALUE_FIELD) else {
            warn!(topic = %self.topic, id = %entry.id, "Skipping stream entry without a value field");
            let mut conn = self.connection.clone();
            let _: i64 = conn.xack(&self.topic, &self.group, &[&entry.id]).await?;
            return Ok(None);
        };

        Ok(Some(Message {
            topic: self.topic.clone(),
            partition: 0,
            key: entry.get::<String>(KEY_FIELD),
            offset: Offset::StreamId(entry.id),
            value,
        }))
    }
}

#[async_trait]
impl Subscription for RedisSubscription {
    async fn next(&self) -> Result<Option<Message>, BrokerError> {
        loop {
            if !self.backlog_done.load(Ordering::Acquire) {
                let after = self.cursor().clone();
                match self.read(&after, false).await?.into_iter().next() {
                    Some(entry) => {
                        debug!(topic = %self.topic, id = %entry.id, "Replaying pending entry");
                        self.cursor().clone_from(&entry.id);
                        if let Some(message) = self.to_message(entry).await? {
                            return Ok(Some(message));
                        }
                        continue;
                    }
                    None => {
                        debug!(topic = %self.topic, consumer = %self.consumer, "Pending backlog drained");
                        self.backlog_done.store(true, Ordering::Release);
                    }
                }
            }

            if let Some(entry) = self.read(">", true).await?.into_iter().next() {
                if let Some(message) = self.to_message(entry).await? {
                    return Ok(Some(message));
                }
            }
        }
    }

    async fn commit(&self, message: &Message) -> Result<(), BrokerError> {
        let Offset::StreamId(id) = &message.offset else {
            return Err(BrokerError::MalformedRecord {
                topic: message.topic.clone(),
                reason: format!("offset {} is not a stream id", message.offset),
            });
        };

        let mut conn = self.connection.clone();
        let _: i64 = conn.xack(&self.topic, &self.group, &[id]).await?;
        Ok(())
    }

    fn topic(&self) -> &str {
        &self.topic
    }
}

struct RedisPublisher {
    connection: MultiplexedConnection,
    topic: String,
}

#[async_trait]
impl Publisher for RedisPublisher {
    async fn publish(&self, key: Option<&str>, value: &str) -> Result<(), BrokerError> {
        let mut fields = vec![(VALUE_FIELD, value)];
        if let Some(key) = key {
            fields.push((KEY_FIELD, key));
        }

        let mut conn = self.connection.clone();
        let id: String = conn.xadd(&self.topic, "*", fields.as_slice()).await?;
        debug!(topic = %self.topic, id = %id, "Published record");
        Ok(())
    }

    fn topic(&self) -> &str {
        &self.topic
    }
}
