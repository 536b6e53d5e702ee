//! Wire messages for the remote classification service
//!
//! The service exposes a single unary method,
//! `tensorflow.serving.InceptionService/Classify`. Messages are declared
//! directly with `prost` derives so no protobuf compiler is needed at build
//! time.

use bytes::Bytes;

/// Fully qualified gRPC service name
pub const SERVICE_NAME: &str = "tensorflow.serving.InceptionService";

/// Method name on [`SERVICE_NAME`]
pub const METHOD_NAME: &str = "Classify";

/// HTTP/2 path of the classify method
pub const CLASSIFY_PATH: &str = "/tensorflow.serving.InceptionService/Classify";

/// Request carrying the raw encoded image
#[derive(Clone, PartialEq, prost::Message)]
pub struct InceptionRequest {
    /// Encoded image bytes, passed through unchanged
    #[prost(bytes = "bytes", tag = "1")]
    pub jpeg_encoded: Bytes,
}

/// Response with positionally paired class names and scores
#[derive(Clone, PartialEq, prost::Message)]
pub struct InceptionResponse {
    #[prost(float, repeated, tag = "2")]
    pub scores: Vec<f32>,

    #[prost(string, repeated, tag = "3")]
    pub classes: Vec<String>,
}
