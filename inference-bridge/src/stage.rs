//! Stream stage: input topic -> inference bridge -> output topic
//!
//! One dispatcher task pulls records from the subscription and hands each
//! partition's records to that partition's worker task. A worker handles its
//! records strictly one after another, so output order per partition follows
//! input order, while different partitions progress independently.
//!
//! # Backpressure
//!
//! Handing a record to a worker never waits on that worker. Instead every
//! record holds a permit from one stage-wide budget of
//! [`MAX_BUFFERED_RECORDS`] until its worker is done with it, and the
//! dispatcher only reads when a permit is free. A stalled partition can
//! therefore hold up the others only after it has soaked up the whole
//! budget.
//!
//! # Shutdown
//!
//! [`StreamStage::stop`] stops the dispatcher from pulling, lets every
//! worker finish the record it is on, and waits up to the grace period.
//! After that the in-flight classify calls are cancelled. Records that were
//! queued but not started stay uncommitted.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex, OwnedSemaphorePermit, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::bridge::{InferenceBridge, OutputFormat};
use crate::broker::{Broker, Message, Publisher, Subscription};
use crate::client::Connector;
use crate::error::BrokerError;

/// Default input topic
pub const DEFAULT_INPUT_TOPIC: &str = "ImageInputTopic";

/// Default output topic
pub const DEFAULT_OUTPUT_TOPIC: &str = "ImageOutputTopic";

/// Default consumer group
pub const DEFAULT_GROUP: &str = "kafka-streams-tensorflow-image-recognition-example";

/// Time in-flight work gets to finish on stop (in milliseconds)
pub const DEFAULT_GRACE_PERIOD_MS: u64 = 10_000;

/// Records read but not yet handled, across all partitions
pub const MAX_BUFFERED_RECORDS: usize = 256;

/// How long to wait for workers after cancelling their calls
const CANCEL_WAIT: Duration = Duration::from_secs(1);

/// Pause after a failed read from the input topic
const READ_ERROR_BACKOFF: Duration = Duration::from_secs(1);

/// Topics, group and shutdown settings of a stage
#[derive(Debug, Clone)]
pub struct StageConfig {
    pub input_topic: String,
    pub output_topic: String,
    pub group: String,
    pub grace_period: Duration,
}

impl Default for StageConfig {
    fn default() -> Self {
        Self {
            input_topic: DEFAULT_INPUT_TOPIC.to_string(),
            output_topic: DEFAULT_OUTPUT_TOPIC.to_string(),
            group: DEFAULT_GROUP.to_string(),
            grace_period: Duration::from_millis(DEFAULT_GRACE_PERIOD_MS),
        }
    }
}

/// How [`StreamStage::stop`] ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    /// All in-flight records finished within the grace period
    Drained,
    /// In-flight calls were cancelled after the grace period
    Cancelled,
    /// Workers had to be aborted
    Aborted,
    /// The stage was already stopped
    AlreadyStopped,
}

/// A running stream stage
pub struct StreamStage {
    shutdown: CancellationToken,
    abort: CancellationToken,
    done: CancellationToken,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
    grace_period: Duration,
}

impl StreamStage {
    /// Subscribe to the input topic and start consuming.
    ///
    /// Failing to subscribe or to open the output publisher is returned
    /// here; everything after that is handled per message.
    pub async fn start<B, C>(
        broker: &B,
        bridge: Arc<InferenceBridge<C>>,
        config: StageConfig,
    ) -> Result<Self, BrokerError>
    where
        B: Broker + ?Sized,
        C: Connector,
    {
        let subscription = broker.subscribe(&config.input_topic, &config.group).await?;
        let publisher = broker.publisher(&config.output_topic).await?;

        let shutdown = CancellationToken::new();
        let abort = CancellationToken::new();
        let done = CancellationToken::new();

        let dispatcher = Dispatcher {
            subscription,
            publisher,
            bridge,
            budget: Arc::new(Semaphore::new(MAX_BUFFERED_RECORDS)),
            shutdown: shutdown.clone(),
            abort: abort.clone(),
        };
        let finished = done.clone();
        let handle = tokio::spawn(async move {
            let _finished = finished.drop_guard();
            dispatcher.run().await;
        });

        info!(
            input = %config.input_topic,
            output = %config.output_topic,
            group = %config.group,
            "Stream stage started"
        );

        Ok(Self {
            shutdown,
            abort,
            done,
            dispatcher: Mutex::new(Some(handle)),
            grace_period: config.grace_period,
        })
    }

    /// Stop consuming and wait for in-flight records.
    ///
    /// Safe to call more than once and from several tasks; later callers
    /// wait for the first one to finish.
    pub async fn stop(&self) -> StopOutcome {
        self.shutdown.cancel();

        let mut dispatcher = self.dispatcher.lock().await;
        let Some(handle) = dispatcher.as_mut() else {
            return StopOutcome::AlreadyStopped;
        };

        let outcome = if tokio::time::timeout(self.grace_period, &mut *handle).await.is_ok() {
            StopOutcome::Drained
        } else {
            warn!(
                grace_ms = self.grace_period.as_millis(),
                "Grace period elapsed, cancelling in-flight classify calls"
            );
            self.abort.cancel();
            if tokio::time::timeout(CANCEL_WAIT, &mut *handle).await.is_ok() {
                StopOutcome::Cancelled
            } else {
                handle.abort();
                StopOutcome::Aborted
            }
        };

        *dispatcher = None;
        info!(outcome = ?outcome, "Stream stage stopped");
        outcome
    }

    /// Resolves once the stage has stopped, by [`stop`](Self::stop) or
    /// because the input topic ended.
    pub async fn finished(&self) {
        self.done.cancelled().await;
    }

    pub fn is_running(&self) -> bool {
        !self.done.is_cancelled()
    }
}

/// A record on its way to a worker, with its share of the buffer budget
type Queued = (Message, OwnedSemaphorePermit);

struct Dispatcher<C: Connector> {
    subscription: Arc<dyn Subscription>,
    publisher: Arc<dyn Publisher>,
    bridge: Arc<InferenceBridge<C>>,
    budget: Arc<Semaphore>,
    shutdown: CancellationToken,
    abort: CancellationToken,
}

impl<C: Connector> Dispatcher<C> {
    async fn run(self) {
        let mut queues: HashMap<u32, mpsc::UnboundedSender<Queued>> = HashMap::new();
        let mut workers = JoinSet::new();

        loop {
            let permit = tokio::select! {
                biased;
                () = self.shutdown.cancelled() => break,
                permit = self.budget.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            let next = tokio::select! {
                biased;
                () = self.shutdown.cancelled() => break,
                next = self.subscription.next() => next,
            };

            let message = match next {
                Ok(Some(message)) => message,
                Ok(None) => {
                    info!(topic = %self.subscription.topic(), "Input topic closed");
                    break;
                }
                Err(e) => {
                    error!(topic = %self.subscription.topic(), error = %e, "Failed to read input topic");
                    tokio::select! {
                        () = self.shutdown.cancelled() => break,
                        () = tokio::time::sleep(READ_ERROR_BACKOFF) => continue,
                    }
                }
            };

            crate::metrics::record_received();
            let partition = message.partition;
            let queue = queues
                .entry(partition)
                .or_insert_with(|| self.spawn_worker(partition, &mut workers));

            if queue.send((message, permit)).is_err() {
                error!(partition, "Partition worker exited unexpectedly");
                queues.remove(&partition);
            }
        }

        // Closing the queues lets workers run out once they are empty
        drop(queues);
        while let Some(joined) = workers.join_next().await {
            if let Err(e) = joined {
                error!(error = %e, "Partition worker panicked");
            }
        }

        self.bridge.pool().close();
        debug!("Dispatcher finished");
    }

    fn spawn_worker(&self, partition: u32, workers: &mut JoinSet<()>) -> mpsc::UnboundedSender<Queued> {
        let (tx, rx) = mpsc::unbounded_channel();
        let worker = PartitionWorker {
            partition,
            subscription: self.subscription.clone(),
            publisher: self.publisher.clone(),
            bridge: self.bridge.clone(),
            shutdown: self.shutdown.clone(),
            abort: self.abort.clone(),
        };
        workers.spawn(worker.run(rx));
        debug!(partition, "Partition worker started");
        tx
    }
}

struct PartitionWorker<C: Connector> {
    partition: u32,
    subscription: Arc<dyn Subscription>,
    publisher: Arc<dyn Publisher>,
    bridge: Arc<InferenceBridge<C>>,
    shutdown: CancellationToken,
    abort: CancellationToken,
}

impl<C: Connector> PartitionWorker<C> {
    async fn run(self, mut queue: mpsc::UnboundedReceiver<Queued>) {
        loop {
            let (message, permit) = tokio::select! {
                biased;
                () = self.shutdown.cancelled() => break,
                queued = queue.recv() => match queued {
                    Some(queued) => queued,
                    None => break,
                },
            };
            self.handle(message).await;
            drop(permit);
        }
        debug!(partition = self.partition, "Partition worker stopped");
    }

    async fn handle(&self, message: Message) {
        let format: OutputFormat = self.bridge.config().output_format;

        match self.bridge.process(&message, &self.abort).await {
            Some(result) => {
                let payload = result.payload(format);
                if let Err(e) = self.publisher.publish(result.key.as_deref(), &payload).await {
                    crate::metrics::record_publish_failed();
                    error!(
                        image = %message.value,
                        topic = %self.publisher.topic(),
                        error = %e,
                        "Failed to publish prediction"
                    );
                    return;
                }
                crate::metrics::record_emitted();
                info!(
                    image = %result.image,
                    partition = self.partition,
                    top = result.predictions.top().map_or("", |p| p.label.as_str()),
                    "Prediction emitted"
                );
            }
            // Cancelled by shutdown: leave uncommitted so it is redelivered
            None if self.abort.is_cancelled() => return,
            None => {}
        }

        if let Err(e) = self.subscription.commit(&message).await {
            warn!(
                partition = self.partition,
                offset = %message.offset,
                error = %e,
                "Failed to commit record"
            );
        }
    }
}
