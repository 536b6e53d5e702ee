//! Per-message orchestration
//!
//! For every incoming message the bridge walks the same sequence:
//!
//! 1. read the image reference from the message value
//! 2. load the referenced image bytes
//! 3. borrow a client from the pool and classify the image
//! 4. return the client to the pool, whatever the outcome of step 3
//! 5. build the [`BridgeResult`] for the stage to emit
//!
//! Any failure ends the message: it is logged together with the image
//! reference and nothing is emitted. The prediction for a message travels
//! with that message's result only; no state is shared between messages.

use bytes::Bytes;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::broker::Message;
use crate::client::{Classifier, Connector, DEFAULT_CALL_TIMEOUT_MS};
use crate::codec::{decode_response, encode_request, Prediction};
use crate::error::BridgeError;
use crate::pool::ClientPool;

/// Payload format of emitted messages
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OutputFormat {
    /// `Prediction: What is the content of <image>? => [label=score, ...]`
    #[default]
    Text,
    /// `{"image": ..., "predictions": [{"label": ..., "confidence": ...}]}`
    Json,
}

impl FromStr for OutputFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "text" => Ok(Self::Text),
            "json" => Ok(Self::Json),
            other => Err(format!("unknown output format '{other}' (expected text or json)")),
        }
    }
}

/// Bridge settings
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    /// Directory relative image references are resolved against
    pub image_root: Option<PathBuf>,
    /// Deadline for one classify call
    pub call_timeout: Duration,
    pub output_format: OutputFormat,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            image_root: None,
            call_timeout: Duration::from_millis(DEFAULT_CALL_TIMEOUT_MS),
            output_format: OutputFormat::Text,
        }
    }
}

/// Where the image bytes of one message live
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageReference(String);

impl ImageReference {
    pub fn new(reference: impl Into<String>) -> Self {
        Self(reference.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Resolve against `root` unless the reference is already absolute.
    pub fn resolve(&self, root: Option<&Path>) -> PathBuf {
        let path = Path::new(self.0.trim());
        match root {
            Some(root) if path.is_relative() => root.join(path),
            _ => path.to_path_buf(),
        }
    }
}

/// Outcome of a successfully bridged message
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BridgeResult {
    /// Key of the input message, reused for the output message
    #[serde(skip)]
    pub key: Option<String>,
    pub image: String,
    pub predictions: Prediction,
}

impl BridgeResult {
    /// Render the output message value.
    pub fn payload(&self, format: OutputFormat) -> String {
        match format {
            OutputFormat::Text => format!(
                "Prediction: What is the content of {}? => {}",
                self.image, self.predictions
            ),
            OutputFormat::Json => serde_json::json!({
                "image": self.image,
                "predictions": self.predictions,
            })
            .to_string(),
        }
    }
}

/// Turns image references into predictions using a pool of remote clients
pub struct InferenceBridge<C: Connector> {
    pool: ClientPool<C>,
    config: BridgeConfig,
}

impl<C: Connector> InferenceBridge<C> {
    pub fn new(pool: ClientPool<C>, config: BridgeConfig) -> Self {
        Self { pool, config }
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    pub fn pool(&self) -> &ClientPool<C> {
        &self.pool
    }

    /// Handle one message, logging and swallowing message-scoped failures.
    ///
    /// Returns `None` when the message failed and nothing should be emitted.
    pub async fn process(
        &self,
        message: &Message,
        cancel: &CancellationToken,
    ) -> Option<BridgeResult> {
        match self.handle(message, cancel).await {
            Ok(result) => Some(result),
            Err(e) => {
                crate::metrics::record_failed(e.kind());
                warn!(
                    image = %message.value,
                    partition = message.partition,
                    offset = %message.offset,
                    kind = e.kind().as_str(),
                    error = %e,
                    "Failed to classify image"
                );
                None
            }
        }
    }

    /// Handle one message, returning the first failure.
    pub async fn handle(
        &self,
        message: &Message,
        cancel: &CancellationToken,
    ) -> Result<BridgeResult, BridgeError> {
        let reference = ImageReference::new(message.value.clone());
        debug!(image = %reference.as_str(), "Received image reference");

        let image = self.load_image(&reference).await?;
        debug!(image = %reference.as_str(), bytes = image.len(), "Image loaded");

        let predictions = self.classify(image, cancel).await?;
        debug!(image = %reference.as_str(), labels = predictions.len(), "Image classified");

        Ok(BridgeResult {
            key: message.key.clone(),
            image: reference.0,
            predictions,
        })
    }

    /// Read the referenced image into memory.
    pub async fn load_image(&self, reference: &ImageReference) -> Result<Bytes, BridgeError> {
        if reference.as_str().trim().is_empty() {
            return Err(BridgeError::ImageLoad {
                reference: reference.0.clone(),
                source: std::io::Error::new(std::io::ErrorKind::InvalidInput, "empty image reference"),
            });
        }

        let path = reference.resolve(self.config.image_root.as_deref());
        tokio::fs::read(&path)
            .await
            .map(Bytes::from)
            .map_err(|source| BridgeError::ImageLoad {
                reference: reference.0.clone(),
                source,
            })
    }

    /// Classify `image` on a pooled client.
    ///
    /// The client goes back to the pool on every path; it is discarded
    /// instead when the failure suggests the connection is unusable.
    pub async fn classify(
        &self,
        image: Bytes,
        cancel: &CancellationToken,
    ) -> Result<Prediction, BridgeError> {
        let mut client = tokio::select! {
            biased;
            () = cancel.cancelled() => return Err(BridgeError::Cancelled),
            client = self.pool.acquire() => client?,
        };

        let request = encode_request(image);
        let outcome = tokio::select! {
            biased;
            () = cancel.cancelled() => Err(BridgeError::Cancelled),
            response = client.classify(request, self.config.call_timeout) => response,
        };

        if outcome.as_ref().is_err_and(BridgeError::poisons_client) {
            client.discard();
        }
        drop(client);

        outcome.map(decode_response)
    }
}
