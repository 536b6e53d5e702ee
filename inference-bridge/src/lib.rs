//! Inference Bridge - topic-to-classifier streaming bridge
//!
//! This crate consumes messages naming an image, forwards each image to a
//! remote classification service over gRPC, and publishes the ranked
//! label/confidence predictions to an output topic.
//!
//! # Architecture
//!
//! - [`client`]: `InferenceClient`, one plaintext gRPC channel to the
//!   classification endpoint with a single unary `classify` call
//! - [`codec`]: wraps image bytes for the wire and pairs the response's
//!   label and score lists into a [`Prediction`]
//! - [`pool`]: bounded borrow/return pool of open clients
//! - [`bridge`]: per-message load -> classify -> format sequence with
//!   message-scoped failure handling
//! - [`stage`]: wires a broker subscription and publisher to the bridge,
//!   one sequential worker per partition
//! - [`broker`]: broker seam with in-memory and Redis Streams backends
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use inference_bridge::{
//!     BridgeConfig, ClientPool, EndpointConfig, GrpcConnector, InferenceBridge,
//!     MemoryBroker, StageConfig, StreamStage,
//! };
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let pool = ClientPool::new(GrpcConnector::new(EndpointConfig::default()), 4);
//!     let bridge = Arc::new(InferenceBridge::new(pool, BridgeConfig::default()));
//!     let broker = MemoryBroker::new();
//!
//!     let stage = StreamStage::start(&broker, bridge, StageConfig::default()).await?;
//!     broker.send("ImageInputTopic", None, "images/cat.jpg");
//!
//!     tokio::signal::ctrl_c().await?;
//!     stage.stop().await;
//!     Ok(())
//! }
//! ```

pub mod bridge;
pub mod broker;
pub mod client;
pub mod codec;
pub mod error;
pub mod metrics;
pub mod pool;
pub mod proto;
pub mod stage;

// Re-export main types for convenience
pub use bridge::{BridgeConfig, BridgeResult, ImageReference, InferenceBridge, OutputFormat};
pub use broker::{Broker, MemoryBroker, Message, Offset, Publisher, RedisBroker, Subscription};
pub use client::{Classifier, Connector, EndpointConfig, GrpcConnector, InferenceClient};
pub use codec::{
    decode_response, encode_request, ClassificationRequest, ClassificationResponse, LabelScore,
    Prediction,
};
pub use error::{BridgeError, BrokerError, ErrorKind};
pub use pool::{ClientPool, PooledClient};
pub use stage::{StageConfig, StopOutcome, StreamStage};
