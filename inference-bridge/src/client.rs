//! gRPC client for the remote classification service
//!
//! [`InferenceClient`] owns one plaintext HTTP/2 channel to a fixed
//! endpoint and issues unary `Classify` calls over it.
//!
//! # Lifecycle
//!
//! - [`InferenceClient::new`] only records the endpoint
//! - [`InferenceClient::open`] establishes the channel (bounded by the
//!   connect timeout)
//! - [`Classifier::close`] drops the channel; it is idempotent and safe on a
//!   client whose `open` never succeeded
//!
//! Connection setup is reached through the [`Connector`] trait so the pool
//! and the bridge can be driven by a fake service in tests.

use async_trait::async_trait;
use std::error::Error as StdError;
use std::time::{Duration, Instant};
use tonic::codec::ProstCodec;
use tonic::codegen::http::uri::PathAndQuery;
use tonic::transport::{Channel, Endpoint};
use tonic::{Code, Request, Status};
use tracing::{debug, info, warn};

use crate::codec::{ClassificationRequest, ClassificationResponse};
use crate::error::BridgeError;
use crate::proto::{InceptionRequest, InceptionResponse, CLASSIFY_PATH};

/// Default classification service host
pub const DEFAULT_ENDPOINT_HOST: &str = "localhost";

/// Default classification service port
pub const DEFAULT_ENDPOINT_PORT: u16 = 9000;

/// Maximum time to establish the channel (in milliseconds)
pub const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 5_000;

/// Maximum time for one classify call (in milliseconds)
pub const DEFAULT_CALL_TIMEOUT_MS: u64 = 30_000;

/// Prefix tonic puts on statuses produced by a failed protobuf decode
const DECODE_FAILURE_PREFIX: &str = "failed to decode Protobuf message";

/// Location and timeouts of the remote classification service
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointConfig {
    pub host: String,
    pub port: u16,
    pub connect_timeout: Duration,
    pub call_timeout: Duration,
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_ENDPOINT_HOST.to_string(),
            port: DEFAULT_ENDPOINT_PORT,
            connect_timeout: Duration::from_millis(DEFAULT_CONNECT_TIMEOUT_MS),
            call_timeout: Duration::from_millis(DEFAULT_CALL_TIMEOUT_MS),
        }
    }
}

impl EndpointConfig {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            ..Self::default()
        }
    }

    /// `http://host:port`, the form tonic expects for plaintext channels
    pub fn uri(&self) -> String {
        format!("http://{}:{}", self.host, self.port)
    }
}

/// A connection able to classify images
#[async_trait]
pub trait Classifier: Send {
    /// Issue one unary classify call, bounded by `deadline`.
    async fn classify(
        &mut self,
        request: ClassificationRequest,
        deadline: Duration,
    ) -> Result<ClassificationResponse, BridgeError>;

    /// Release the connection. Must be idempotent.
    fn close(&mut self);

    fn is_open(&self) -> bool;
}

/// Factory for open [`Classifier`]s
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    type Client: Classifier + 'static;

    async fn connect(&self) -> Result<Self::Client, BridgeError>;

    /// Human readable endpoint, used in logs
    fn endpoint(&self) -> String;
}

/// Client for `tensorflow.serving.InceptionService/Classify`
pub struct InferenceClient {
    config: EndpointConfig,
    grpc: Option<tonic::client::Grpc<Channel>>,
}

impl InferenceClient {
    /// Create an unopened client for `config`
    pub fn new(config: EndpointConfig) -> Self {
        Self { config, grpc: None }
    }

    /// Create a client and open its channel.
    pub async fn connect(config: EndpointConfig) -> Result<Self, BridgeError> {
        let mut client = Self::new(config);
        client.open().await?;
        Ok(client)
    }

    /// Establish the plaintext channel to the configured endpoint.
    ///
    /// Re-opening an already open client replaces its channel.
    pub async fn open(&mut self) -> Result<(), BridgeError> {
        let uri = self.config.uri();
        debug!(endpoint = %uri, "Opening classification channel");

        let endpoint = Endpoint::from_shared(uri.clone())
            .map_err(|e| BridgeError::InvalidEndpoint(format!("{uri}: {e}")))?
            .connect_timeout(self.config.connect_timeout)
            .tcp_nodelay(true);

        let channel = endpoint.connect().await.map_err(|e| {
            warn!(endpoint = %uri, error = %error_chain(&e), "Classification channel failed to open");
            BridgeError::Connection {
                endpoint: uri.clone(),
                reason: error_chain(&e),
            }
        })?;

        info!(endpoint = %uri, "Classification channel open");
        self.grpc = Some(tonic::client::Grpc::new(channel));
        Ok(())
    }

    pub fn config(&self) -> &EndpointConfig {
        &self.config
    }

    async fn call(
        grpc: &mut tonic::client::Grpc<Channel>,
        request: InceptionRequest,
        deadline: Duration,
    ) -> Result<InceptionResponse, Status> {
        grpc.ready()
            .await
            .map_err(|e| Status::unavailable(format!("Service was not ready: {}", error_chain(&e))))?;

        let mut request = Request::new(request);
        request.set_timeout(deadline);

        let codec: ProstCodec<InceptionRequest, InceptionResponse> = ProstCodec::default();
        let path = PathAndQuery::from_static(CLASSIFY_PATH);
        let response = grpc.unary(request, path, codec).await?;
        Ok(response.into_inner())
    }
}

#[async_trait]
impl Classifier for InferenceClient {
    async fn classify(
        &mut self,
        request: ClassificationRequest,
        deadline: Duration,
    ) -> Result<ClassificationResponse, BridgeError> {
        let endpoint = self.config.uri();
        let grpc = self.grpc.as_mut().ok_or_else(|| BridgeError::Connection {
            endpoint: endpoint.clone(),
            reason: "client is not open".to_string(),
        })?;

        let payload_len = request.image.len();
        let start = Instant::now();
        let result = tokio::time::timeout(deadline, Self::call(grpc, request.into(), deadline)).await;
        let elapsed = start.elapsed();

        metrics::histogram!(crate::metrics::CLASSIFY_DURATION).record(elapsed.as_secs_f64());
        debug!(
            endpoint = %endpoint,
            payload_len,
            elapsed_ms = elapsed.as_millis(),
            "Classify call finished"
        );

        match result {
            Ok(Ok(response)) => Ok(response.into()),
            Ok(Err(status)) => Err(status_to_error(&status, deadline)),
            Err(_) => {
                warn!(endpoint = %endpoint, timeout_ms = deadline.as_millis(), "Classify call timed out");
                Err(BridgeError::DeadlineExceeded(deadline))
            }
        }
    }

    fn close(&mut self) {
        if self.grpc.take().is_some() {
            debug!(endpoint = %self.config.uri(), "Closing classification channel");
        }
    }

    fn is_open(&self) -> bool {
        self.grpc.is_some()
    }
}

impl Drop for InferenceClient {
    fn drop(&mut self) {
        self.close();
    }
}

/// Opens one [`InferenceClient`] per call against a fixed endpoint
#[derive(Debug, Clone)]
pub struct GrpcConnector {
    config: EndpointConfig,
}

impl GrpcConnector {
    pub fn new(config: EndpointConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl Connector for GrpcConnector {
    type Client = InferenceClient;

    async fn connect(&self) -> Result<InferenceClient, BridgeError> {
        InferenceClient::connect(self.config.clone()).await
    }

    fn endpoint(&self) -> String {
        self.config.uri()
    }
}

fn status_to_error(status: &Status, deadline: Duration) -> BridgeError {
    match status.code() {
        Code::DeadlineExceeded => BridgeError::DeadlineExceeded(deadline),
        Code::Internal if status.message().starts_with(DECODE_FAILURE_PREFIX) => {
            BridgeError::Codec(status.message().to_string())
        }
        code => BridgeError::Rpc(format!("{code:?}: {}", status.message())),
    }
}

/// Flatten an error and its sources into one line
fn error_chain(err: &dyn StdError) -> String {
    let mut out = err.to_string();
    let mut source = err.source();
    while let Some(inner) = source {
        out.push_str(": ");
        out.push_str(&inner.to_string());
        source = inner.source();
    }
    out
}
