//! Error taxonomy for the inference bridge
//!
//! Every variant of [`BridgeError`] is message-scoped: the stream stage logs
//! it against the offending image reference and moves on to the next
//! message. Only [`BrokerError`]s raised while starting the stage are fatal.

use std::time::Duration;
use thiserror::Error;

/// Errors raised while handling a single message
#[derive(Error, Debug)]
pub enum BridgeError {
    #[error("Connection to {endpoint} failed: {reason}")]
    Connection { endpoint: String, reason: String },

    #[error("Invalid classification endpoint: {0}")]
    InvalidEndpoint(String),

    #[error("Classification call failed: {0}")]
    Rpc(String),

    #[error("Classification call exceeded deadline of {0:?}")]
    DeadlineExceeded(Duration),

    #[error("Classification call cancelled")]
    Cancelled,

    #[error("Malformed classification response: {0}")]
    Codec(String),

    #[error("Failed to load image {reference}: {source}")]
    ImageLoad {
        reference: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Client pool is closed")]
    PoolClosed,
}

/// Coarse classification of [`BridgeError`] used for logs and metric labels
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Connection,
    Rpc,
    ImageLoad,
    Codec,
}

impl ErrorKind {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Connection => "connection",
            Self::Rpc => "rpc",
            Self::ImageLoad => "image_load",
            Self::Codec => "codec",
        }
    }
}

impl BridgeError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Connection { .. } | Self::InvalidEndpoint(_) | Self::PoolClosed => {
                ErrorKind::Connection
            }
            Self::Rpc(_) | Self::DeadlineExceeded(_) | Self::Cancelled => ErrorKind::Rpc,
            Self::Codec(_) => ErrorKind::Codec,
            Self::ImageLoad { .. } => ErrorKind::ImageLoad,
        }
    }

    /// Whether the client that produced this error should be dropped
    /// rather than returned to the pool.
    pub fn poisons_client(&self) -> bool {
        matches!(
            self,
            Self::Connection { .. } | Self::Rpc(_) | Self::DeadlineExceeded(_) | Self::Cancelled
        )
    }
}

/// Errors raised by a message broker backend
#[derive(Error, Debug)]
pub enum BrokerError {
    #[error("Subscription closed")]
    Closed,

    #[error("Invalid broker address: {0}")]
    InvalidAddress(String),

    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Malformed record on {topic}: {reason}")]
    MalformedRecord { topic: String, reason: String },
}
