//! In-process partitioned topics
//!
//! Each topic keeps an append-only log per partition. Consumer groups track
//! a read position and a committed offset per partition; members of one
//! group share those positions, so each record goes to exactly one member.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::Notify;
use tracing::debug;

use super::{partition_for, Broker, Message, Offset, Publisher, Subscription};
use crate::error::BrokerError;

/// Partition count for topics created implicitly
pub const DEFAULT_PARTITIONS: u32 = 1;

#[derive(Debug, Clone)]
struct Record {
    key: Option<String>,
    value: String,
}

#[derive(Debug)]
struct GroupState {
    /// Next offset to hand out, per partition
    next: Vec<u64>,
    /// Offset after the last committed record, per partition
    committed: Vec<u64>,
    /// Partition to try first on the next read
    cursor: usize,
}

impl GroupState {
    fn new(partitions: usize) -> Self {
        Self {
            next: vec![0; partitions],
            committed: vec![0; partitions],
            cursor: 0,
        }
    }
}

#[derive(Debug, Default)]
struct TopicState {
    logs: Vec<Vec<Record>>,
    groups: HashMap<String, GroupState>,
    closed: bool,
}

impl TopicState {
    fn take_next(&mut self, topic: &str, group: &str) -> Option<Message> {
        let partitions = self.logs.len();
        let logs = &self.logs;
        let state = self
            .groups
            .entry(group.to_string())
            .or_insert_with(|| GroupState::new(partitions));

        for step in 0..partitions {
            let partition = (state.cursor + step) % partitions;
            let offset = state.next[partition];
            let Some(record) = usize::try_from(offset).ok().and_then(|i| logs[partition].get(i))
            else {
                continue;
            };

            state.next[partition] += 1;
            state.cursor = (partition + 1) % partitions;
            return Some(Message {
                topic: topic.to_string(),
                partition: u32::try_from(partition).unwrap_or(u32::MAX),
                offset: Offset::Index(offset),
                key: record.key.clone(),
                value: record.value.clone(),
            });
        }
        None
    }
}

struct Topic {
    name: String,
    partitions: u32,
    state: Mutex<TopicState>,
    notify: Notify,
}

impl Topic {
    fn new(name: &str, partitions: u32) -> Self {
        let partitions = partitions.max(1);
        Self {
            name: name.to_string(),
            partitions,
            state: Mutex::new(TopicState {
                logs: vec![Vec::new(); partitions as usize],
                ..TopicState::default()
            }),
            notify: Notify::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, TopicState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// In-process broker with partitioned topics
pub struct MemoryBroker {
    topics: Mutex<HashMap<String, Arc<Topic>>>,
    default_partitions: u32,
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::with_partitions(DEFAULT_PARTITIONS)
    }

    /// Broker whose implicitly created topics have `partitions` partitions
    pub fn with_partitions(partitions: u32) -> Self {
        Self {
            topics: Mutex::new(HashMap::new()),
            default_partitions: partitions.max(1),
        }
    }

    /// Create `name` with an explicit partition count. No-op if it exists.
    pub fn create_topic(&self, name: &str, partitions: u32) {
        self.lock_topics()
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(Topic::new(name, partitions)));
    }

    /// Append a record, as a producer outside the stage would.
    pub fn send(&self, topic: &str, key: Option<&str>, value: &str) {
        self.topic(topic).append(key, value);
    }

    /// All records of `topic` as `(key, value)`, partition by partition
    pub fn records(&self, topic: &str) -> Vec<(Option<String>, String)> {
        let Some(topic) = self.lock_topics().get(topic).cloned() else {
            return Vec::new();
        };
        let state = topic.lock();
        state
            .logs
            .iter()
            .flatten()
            .map(|r| (r.key.clone(), r.value.clone()))
            .collect()
    }

    /// Offset after the last record `group` committed on `partition`
    pub fn committed(&self, topic: &str, group: &str, partition: u32) -> u64 {
        let Some(topic) = self.lock_topics().get(topic).cloned() else {
            return 0;
        };
        let state = topic.lock();
        state
            .groups
            .get(group)
            .and_then(|g| g.committed.get(partition as usize).copied())
            .unwrap_or(0)
    }

    /// Close `topic`; subscribers drain what is left, then see end of stream.
    pub fn close_topic(&self, topic: &str) {
        if let Some(topic) = self.lock_topics().get(topic).cloned() {
            topic.lock().closed = true;
            topic.notify.notify_waiters();
        }
    }

    fn topic(&self, name: &str) -> Arc<Topic> {
        self.lock_topics()
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(Topic::new(name, self.default_partitions)))
            .clone()
    }

    fn lock_topics(&self) -> MutexGuard<'_, HashMap<String, Arc<Topic>>> {
        self.topics.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Topic {
    fn append(&self, key: Option<&str>, value: &str) {
        let partition = partition_for(key, self.partitions) as usize;
        {
            let mut state = self.lock();
            state.logs[partition].push(Record {
                key: key.map(ToString::to_string),
                value: value.to_string(),
            });
        }
        self.notify.notify_waiters();
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn subscribe(
        &self,
        topic: &str,
        group: &str,
    ) -> Result<Arc<dyn Subscription>, BrokerError> {
        let topic = self.topic(topic);
        debug!(topic = %topic.name, group, partitions = topic.partitions, "Subscribed to memory topic");
        Ok(Arc::new(MemorySubscription {
            topic,
            group: group.to_string(),
        }))
    }

    async fn publisher(&self, topic: &str) -> Result<Arc<dyn Publisher>, BrokerError> {
        Ok(Arc::new(MemoryPublisher {
            topic: self.topic(topic),
        }))
    }
}

struct MemorySubscription {
    topic: Arc<Topic>,
    group: String,
}

#[async_trait]
impl Subscription for MemorySubscription {
    async fn next(&self) -> Result<Option<Message>, BrokerError> {
        loop {
            // Registered before the check so an append in between still wakes us
            let notified = self.topic.notify.notified();
            {
                let mut state = self.topic.lock();
                if let Some(message) = state.take_next(&self.topic.name, &self.group) {
                    return Ok(Some(message));
                }
                if state.closed {
                    return Ok(None);
                }
            }
            notified.await;
        }
    }

    async fn commit(&self, message: &Message) -> Result<(), BrokerError> {
        let Offset::Index(offset) = message.offset else {
            return Err(BrokerError::MalformedRecord {
                topic: message.topic.clone(),
                reason: format!("offset {} is not a memory offset", message.offset),
            });
        };

        let mut state = self.topic.lock();
        let partitions = state.logs.len();
        let group = state
            .groups
            .entry(self.group.clone())
            .or_insert_with(|| GroupState::new(partitions));
        if let Some(committed) = group.committed.get_mut(message.partition as usize) {
            *committed = (*committed).max(offset + 1);
        }
        Ok(())
    }

    fn topic(&self) -> &str {
        &self.topic.name
    }
}

struct MemoryPublisher {
    topic: Arc<Topic>,
}

#[async_trait]
impl Publisher for MemoryPublisher {
    async fn publish(&self, key: Option<&str>, value: &str) -> Result<(), BrokerError> {
        if self.topic.lock().closed {
            return Err(BrokerError::Closed);
        }
        self.topic.append(key, value);
        Ok(())
    }

    fn topic(&self) -> &str {
        &self.topic.name
    }
}
