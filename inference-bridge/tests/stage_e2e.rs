//! End-to-end tests for the stream stage
//!
//! Drives the full input topic -> bridge -> output topic path with the
//! in-memory broker and a scripted classification service.

use async_trait::async_trait;
use inference_bridge::{
    Broker, BridgeConfig, BridgeError, Classifier, ClassificationRequest, ClassificationResponse,
    ClientPool, Connector, InferenceBridge, MemoryBroker, Message, Offset, OutputFormat,
    StageConfig, StopOutcome, StreamStage,
};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

const INPUT: &str = "ImageInputTopic";
const OUTPUT: &str = "ImageOutputTopic";
const GROUP: &str = "test-group";

/// Content of `images/slow.jpg`
const SLOW_IMAGE: &[u8] = b"slow";

// ============================================================================
// Scripted classification service
// ============================================================================

#[derive(Clone)]
struct FakeService {
    labels: Vec<String>,
    scores: Vec<f32>,
    down: Arc<AtomicBool>,
    calls: Arc<AtomicUsize>,
    connects: Arc<AtomicUsize>,
    delay: Duration,
    /// Extra latency for images whose bytes are [`SLOW_IMAGE`]
    slow_delay: Duration,
}

impl FakeService {
    fn new(labels: &[&str], scores: &[f32]) -> Self {
        Self {
            labels: labels.iter().map(ToString::to_string).collect(),
            scores: scores.to_vec(),
            down: Arc::new(AtomicBool::new(false)),
            calls: Arc::new(AtomicUsize::new(0)),
            connects: Arc::new(AtomicUsize::new(0)),
            delay: Duration::ZERO,
            slow_delay: Duration::ZERO,
        }
    }

    fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    fn with_slow_images(mut self, delay: Duration) -> Self {
        self.slow_delay = delay;
        self
    }

    fn set_down(&self, down: bool) {
        self.down.store(down, Ordering::SeqCst);
    }
}

struct FakeClient {
    service: FakeService,
    open: bool,
}

#[async_trait]
impl Classifier for FakeClient {
    async fn classify(
        &mut self,
        request: ClassificationRequest,
        _deadline: Duration,
    ) -> Result<ClassificationResponse, BridgeError> {
        self.service.calls.fetch_add(1, Ordering::SeqCst);
        if self.service.down.load(Ordering::SeqCst) {
            return Err(BridgeError::Rpc("Unavailable: service down".to_string()));
        }
        assert!(!request.image.is_empty(), "image bytes should be forwarded");
        tokio::time::sleep(self.service.delay).await;
        if request.image.as_ref() == SLOW_IMAGE {
            tokio::time::sleep(self.service.slow_delay).await;
        }
        Ok(ClassificationResponse {
            labels: self.service.labels.clone(),
            scores: self.service.scores.clone(),
        })
    }

    fn close(&mut self) {
        self.open = false;
    }

    fn is_open(&self) -> bool {
        self.open
    }
}

struct FakeConnector(FakeService);

#[async_trait]
impl Connector for FakeConnector {
    type Client = FakeClient;

    async fn connect(&self) -> Result<FakeClient, BridgeError> {
        self.0.connects.fetch_add(1, Ordering::SeqCst);
        if self.0.down.load(Ordering::SeqCst) {
            return Err(BridgeError::Connection {
                endpoint: self.endpoint(),
                reason: "connection refused".to_string(),
            });
        }
        Ok(FakeClient {
            service: self.0.clone(),
            open: true,
        })
    }

    fn endpoint(&self) -> String {
        "fake://classifier".to_string()
    }
}

// ============================================================================
// Helpers
// ============================================================================

fn image_dir() -> TempDir {
    let dir = tempfile::tempdir().unwrap();
    std::fs::create_dir_all(dir.path().join("images")).unwrap();
    for name in ["cat.jpg", "dog.jpg", "fox.jpg"] {
        std::fs::write(dir.path().join("images").join(name), [0xff, 0xd8, 0xff, 0xe0]).unwrap();
    }
    for i in 0..12 {
        std::fs::write(dir.path().join(format!("images/frame-{i}.jpg")), [0xff, 0xd8, 0xff, 0xe0]).unwrap();
    }
    std::fs::write(dir.path().join("images/slow.jpg"), SLOW_IMAGE).unwrap();
    dir
}

fn bridge(service: &FakeService, root: &Path) -> Arc<InferenceBridge<FakeConnector>> {
    let pool = ClientPool::new(FakeConnector(service.clone()), 2);
    let config = BridgeConfig {
        image_root: Some(root.to_path_buf()),
        call_timeout: Duration::from_secs(5),
        output_format: OutputFormat::Text,
    };
    Arc::new(InferenceBridge::new(pool, config))
}

fn stage_config(grace: Duration) -> StageConfig {
    StageConfig {
        input_topic: INPUT.to_string(),
        output_topic: OUTPUT.to_string(),
        group: GROUP.to_string(),
        grace_period: grace,
    }
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

/// Two keys the memory broker routes to different partitions of a
/// `partitions`-partition topic
async fn keys_on_distinct_partitions(partitions: u32) -> (String, String) {
    let scratch = MemoryBroker::new();
    scratch.create_topic("scratch", partitions);
    let subscription = scratch.subscribe("scratch", "scratch").await.unwrap();

    let mut seen: Vec<(u32, String)> = Vec::new();
    for i in 0..64 {
        let key = format!("camera-{i}");
        scratch.send("scratch", Some(&key), "x");
        let partition = subscription.next().await.unwrap().unwrap().partition;
        if let Some((_, other)) = seen.iter().find(|(p, _)| *p != partition) {
            return (other.clone(), key);
        }
        seen.push((partition, key));
    }
    panic!("all keys landed on one partition");
}

fn message(value: &str) -> Message {
    Message {
        topic: INPUT.to_string(),
        partition: 0,
        offset: Offset::Index(0),
        key: None,
        value: value.to_string(),
    }
}

// ============================================================================
// Scenarios
// ============================================================================

#[tokio::test]
async fn test_prediction_is_emitted_in_service_order() {
    let dir = image_dir();
    let service = FakeService::new(&["cat", "dog"], &[0.91, 0.05]);
    let broker = MemoryBroker::new();
    let stage = StreamStage::start(&broker, bridge(&service, dir.path()), stage_config(Duration::from_secs(5)))
        .await
        .unwrap();

    broker.send(INPUT, Some("camera-1"), "images/cat.jpg");
    wait_until(|| broker.records(OUTPUT).len() == 1).await;

    let records = broker.records(OUTPUT);
    let (key, value) = &records[0];
    assert_eq!(key.as_deref(), Some("camera-1"));
    assert!(value.contains("images/cat.jpg"));

    let cat = value.find("cat=").unwrap();
    let dog = value.find("dog=").unwrap();
    assert!(cat < dog, "cat should be ranked before dog: {value}");
    let first = value.find("0.91").unwrap();
    let second = value.find("0.05").unwrap();
    assert!(first < second);

    assert_eq!(stage.stop().await, StopOutcome::Drained);
}

#[tokio::test]
async fn test_missing_image_produces_no_output_and_stream_continues() {
    let dir = image_dir();
    let service = FakeService::new(&["dog"], &[0.8]);
    let broker = MemoryBroker::new();
    let stage = StreamStage::start(&broker, bridge(&service, dir.path()), stage_config(Duration::from_secs(5)))
        .await
        .unwrap();

    broker.send(INPUT, None, "images/missing.jpg");
    broker.send(INPUT, None, "images/dog.jpg");

    wait_until(|| broker.committed(INPUT, GROUP, 0) == 2).await;

    let records = broker.records(OUTPUT);
    assert_eq!(records.len(), 1);
    assert!(records[0].1.contains("images/dog.jpg"));
    // The missing image never reached the remote service
    assert_eq!(service.calls.load(Ordering::SeqCst), 1);

    stage.stop().await;
}

#[tokio::test]
async fn test_missing_image_error_names_the_reference() {
    let dir = image_dir();
    let service = FakeService::new(&["cat"], &[0.9]);
    let bridge = bridge(&service, dir.path());

    let err = bridge
        .handle(&message("images/missing.jpg"), &CancellationToken::new())
        .await
        .unwrap_err();

    assert!(matches!(err, BridgeError::ImageLoad { .. }));
    assert!(err.to_string().contains("images/missing.jpg"));
}

#[tokio::test]
async fn test_empty_reference_is_an_image_load_failure() {
    let dir = image_dir();
    let service = FakeService::new(&["cat"], &[0.9]);
    let bridge = bridge(&service, dir.path());

    let err = bridge
        .handle(&message("   "), &CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, BridgeError::ImageLoad { .. }));
}

#[tokio::test]
async fn test_endpoint_down_skips_message_without_restart() {
    let dir = image_dir();
    let service = FakeService::new(&["fox"], &[0.7]);
    service.set_down(true);

    let broker = MemoryBroker::new();
    let stage = StreamStage::start(&broker, bridge(&service, dir.path()), stage_config(Duration::from_secs(5)))
        .await
        .unwrap();

    broker.send(INPUT, None, "images/cat.jpg");
    wait_until(|| broker.committed(INPUT, GROUP, 0) == 1).await;
    assert!(broker.records(OUTPUT).is_empty());
    assert!(stage.is_running());

    service.set_down(false);
    broker.send(INPUT, None, "images/fox.jpg");
    wait_until(|| broker.records(OUTPUT).len() == 1).await;
    assert!(broker.records(OUTPUT)[0].1.contains("fox="));

    stage.stop().await;
}

#[tokio::test]
async fn test_rpc_failure_discards_client() {
    let dir = image_dir();
    let service = FakeService::new(&["cat"], &[0.9]);
    let bridge = bridge(&service, dir.path());
    let cancel = CancellationToken::new();

    bridge.handle(&message("images/cat.jpg"), &cancel).await.unwrap();
    assert_eq!(bridge.pool().idle_count(), 1);

    service.set_down(true);
    // The pooled client is reused, fails, and is dropped
    assert!(bridge.handle(&message("images/cat.jpg"), &cancel).await.is_err());
    assert_eq!(bridge.pool().idle_count(), 0);

    service.set_down(false);
    bridge.handle(&message("images/cat.jpg"), &cancel).await.unwrap();
    assert_eq!(service.connects.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_clients_are_reused_across_messages() {
    let dir = image_dir();
    let service = FakeService::new(&["cat"], &[0.9]);
    let broker = MemoryBroker::new();
    let stage = StreamStage::start(&broker, bridge(&service, dir.path()), stage_config(Duration::from_secs(5)))
        .await
        .unwrap();

    for _ in 0..5 {
        broker.send(INPUT, None, "images/cat.jpg");
    }
    wait_until(|| broker.records(OUTPUT).len() == 5).await;

    assert_eq!(service.connects.load(Ordering::SeqCst), 1);
    stage.stop().await;
}

#[tokio::test]
async fn test_length_mismatch_is_truncated_not_failed() {
    let dir = image_dir();
    let service = FakeService::new(&["cat", "dog", "fox"], &[0.6, 0.3]);
    let bridge = bridge(&service, dir.path());

    let result = bridge
        .handle(&message("images/cat.jpg"), &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(result.predictions.len(), 2);
    assert!(!result.payload(OutputFormat::Text).contains("fox"));
}

#[tokio::test]
async fn test_output_order_follows_input_order_per_partition() {
    let dir = image_dir();
    let service = FakeService::new(&["cat"], &[0.9]);
    let broker = MemoryBroker::new();
    broker.create_topic(INPUT, 4);
    let stage = StreamStage::start(&broker, bridge(&service, dir.path()), stage_config(Duration::from_secs(5)))
        .await
        .unwrap();

    let cameras = ["camera-0", "camera-1", "camera-2"];
    let mut sent: Vec<(String, String)> = Vec::new();
    for i in 0..12 {
        let key = cameras[i % 3].to_string();
        let image = format!("images/frame-{i}.jpg");
        broker.send(INPUT, Some(&key), &image);
        sent.push((key, image));
    }
    wait_until(|| broker.records(OUTPUT).len() == 12).await;

    let outputs = broker.records(OUTPUT);
    for camera in cameras {
        let expected: Vec<&str> = sent
            .iter()
            .filter(|(key, _)| key == camera)
            .map(|(_, image)| image.as_str())
            .collect();
        let emitted: Vec<&str> = outputs
            .iter()
            .filter(|(key, _)| key.as_deref() == Some(camera))
            .map(|(_, value)| {
                let start = value.find("images/").unwrap();
                let end = value[start..].find('?').unwrap() + start;
                &value[start..end]
            })
            .collect();
        assert_eq!(emitted, expected, "order for {camera}");
    }

    stage.stop().await;
}

#[tokio::test]
async fn test_slow_partition_does_not_hold_up_others() {
    let dir = image_dir();
    let service = FakeService::new(&["cat"], &[0.9]).with_slow_images(Duration::from_millis(500));
    let broker = MemoryBroker::new();
    broker.create_topic(INPUT, 2);
    let (slow_key, fast_key) = keys_on_distinct_partitions(2).await;

    let stage = StreamStage::start(&broker, bridge(&service, dir.path()), stage_config(Duration::from_secs(5)))
        .await
        .unwrap();

    for _ in 0..40 {
        broker.send(INPUT, Some(&slow_key), "images/slow.jpg");
    }
    tokio::time::sleep(Duration::from_millis(50)).await;

    let sent_at = std::time::Instant::now();
    broker.send(INPUT, Some(&fast_key), "images/cat.jpg");
    wait_until(|| broker.records(OUTPUT).iter().any(|(key, _)| key.as_deref() == Some(fast_key.as_str()))).await;
    let waited = sent_at.elapsed();

    let slow_done = broker
        .records(OUTPUT)
        .iter()
        .filter(|(key, _)| key.as_deref() == Some(slow_key.as_str()))
        .count();
    assert_eq!(slow_done, 0, "fast partition waited for the slow one");
    assert!(waited < Duration::from_millis(300), "fast partition took {waited:?}");

    stage.stop().await;
}

#[tokio::test]
async fn test_stop_waits_for_in_flight_message() {
    let dir = image_dir();
    let service = FakeService::new(&["cat"], &[0.9]).with_delay(Duration::from_millis(200));
    let broker = MemoryBroker::new();
    let stage = StreamStage::start(&broker, bridge(&service, dir.path()), stage_config(Duration::from_secs(5)))
        .await
        .unwrap();

    broker.send(INPUT, None, "images/cat.jpg");
    wait_until(|| service.calls.load(Ordering::SeqCst) == 1).await;

    assert_eq!(stage.stop().await, StopOutcome::Drained);
    assert_eq!(broker.records(OUTPUT).len(), 1);
    assert_eq!(broker.committed(INPUT, GROUP, 0), 1);
    assert!(!stage.is_running());
}

#[tokio::test]
async fn test_stop_cancels_calls_after_grace_period() {
    let dir = image_dir();
    let service = FakeService::new(&["cat"], &[0.9]).with_delay(Duration::from_secs(30));
    let broker = MemoryBroker::new();
    let stage = StreamStage::start(&broker, bridge(&service, dir.path()), stage_config(Duration::from_millis(50)))
        .await
        .unwrap();

    broker.send(INPUT, None, "images/cat.jpg");
    wait_until(|| service.calls.load(Ordering::SeqCst) == 1).await;

    assert_eq!(stage.stop().await, StopOutcome::Cancelled);
    assert!(broker.records(OUTPUT).is_empty());
    // Cancelled records stay uncommitted for redelivery
    assert_eq!(broker.committed(INPUT, GROUP, 0), 0);
}

#[tokio::test]
async fn test_stop_is_idempotent_and_concurrent_safe() {
    let dir = image_dir();
    let service = FakeService::new(&["cat"], &[0.9]);
    let broker = MemoryBroker::new();
    let stage = StreamStage::start(&broker, bridge(&service, dir.path()), stage_config(Duration::from_secs(5)))
        .await
        .unwrap();

    broker.send(INPUT, None, "images/cat.jpg");
    let (first, second) = tokio::join!(stage.stop(), stage.stop());

    let outcomes = [first, second];
    assert!(outcomes.contains(&StopOutcome::Drained));
    assert!(outcomes.contains(&StopOutcome::AlreadyStopped));
    assert_eq!(stage.stop().await, StopOutcome::AlreadyStopped);
}

#[tokio::test]
async fn test_stage_finishes_when_input_closes() {
    let dir = image_dir();
    let service = FakeService::new(&["cat"], &[0.9]);
    let broker = MemoryBroker::new();
    let bridge = bridge(&service, dir.path());
    let stage = StreamStage::start(&broker, bridge.clone(), stage_config(Duration::from_secs(5)))
        .await
        .unwrap();

    broker.send(INPUT, None, "images/cat.jpg");
    broker.close_topic(INPUT);

    tokio::time::timeout(Duration::from_secs(5), stage.finished())
        .await
        .expect("stage should finish");
    assert_eq!(broker.records(OUTPUT).len(), 1);
    assert!(bridge.pool().is_closed());
}

#[tokio::test]
async fn test_json_output_format() {
    let dir = image_dir();
    let service = FakeService::new(&["cat", "dog"], &[0.91, 0.05]);
    let broker = MemoryBroker::new();
    let pool = ClientPool::new(FakeConnector(service.clone()), 1);
    let bridge = Arc::new(InferenceBridge::new(
        pool,
        BridgeConfig {
            image_root: Some(dir.path().to_path_buf()),
            output_format: OutputFormat::Json,
            ..BridgeConfig::default()
        },
    ));
    let stage = StreamStage::start(&broker, bridge, stage_config(Duration::from_secs(5)))
        .await
        .unwrap();

    broker.send(INPUT, None, "images/cat.jpg");
    wait_until(|| broker.records(OUTPUT).len() == 1).await;

    let value: serde_json::Value = serde_json::from_str(&broker.records(OUTPUT)[0].1).unwrap();
    assert_eq!(value["image"], "images/cat.jpg");
    assert_eq!(value["predictions"][0]["label"], "cat");
    assert_eq!(value["predictions"][1]["label"], "dog");

    stage.stop().await;
}
