//! Message broker seam
//!
//! The stream stage only sees three traits:
//! - [`Broker`] opens subscriptions and publishers by topic name
//! - [`Subscription`] yields records of one topic for one consumer group
//!   and takes commits once a record is handled
//! - [`Publisher`] appends records to one topic
//!
//! Two backends are provided: [`MemoryBroker`] (in-process, partitioned)
//! and [`RedisBroker`] (Redis Streams with consumer groups).

mod memory;
mod redis_streams;

pub use memory::MemoryBroker;
pub use redis_streams::{RedisBroker, DEFAULT_CONSUMER_NAME};

use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;

use crate::error::BrokerError;

/// One record read from a topic
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub topic: String,
    pub partition: u32,
    pub offset: Offset,
    pub key: Option<String>,
    pub value: String,
}

/// Position of a record within its partition
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Offset {
    /// Sequence number in an in-memory partition log
    Index(u64),
    /// Redis stream entry id (`<ms>-<seq>`)
    StreamId(String),
}

impl fmt::Display for Offset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Index(i) => write!(f, "{i}"),
            Self::StreamId(id) => f.write_str(id),
        }
    }
}

/// Entry point to a broker backend
#[async_trait]
pub trait Broker: Send + Sync {
    /// Join `group` on `topic`. Records are spread across the group's members.
    async fn subscribe(&self, topic: &str, group: &str)
        -> Result<Arc<dyn Subscription>, BrokerError>;

    async fn publisher(&self, topic: &str) -> Result<Arc<dyn Publisher>, BrokerError>;
}

/// Consumer-group membership on one topic
#[async_trait]
pub trait Subscription: Send + Sync {
    /// Wait for the next record. `Ok(None)` means the topic was closed.
    ///
    /// Dropping the future before it resolves must not lose a record for
    /// good; it may be redelivered after a restart.
    async fn next(&self) -> Result<Option<Message>, BrokerError>;

    /// Mark `message` as handled for this group.
    async fn commit(&self, message: &Message) -> Result<(), BrokerError>;

    fn topic(&self) -> &str;
}

/// Producer on one topic
#[async_trait]
pub trait Publisher: Send + Sync {
    async fn publish(&self, key: Option<&str>, value: &str) -> Result<(), BrokerError>;

    fn topic(&self) -> &str;
}

/// Choose a partition for `key`; keyless records go to partition 0.
pub(crate) fn partition_for(key: Option<&str>, partitions: u32) -> u32 {
    use std::hash::{Hash, Hasher};

    match key {
        Some(key) if partitions > 1 => {
            let mut hasher = std::collections::hash_map::DefaultHasher::new();
            key.hash(&mut hasher);
            // Modulo of a u32 partition count always fits back into u32
            u32::try_from(hasher.finish() % u64::from(partitions)).unwrap_or(0)
        }
        _ => 0,
    }
}
