//! Command line and environment configuration

use clap::Parser;
use inference_bridge::broker::DEFAULT_CONSUMER_NAME;
use inference_bridge::client::{
    DEFAULT_CALL_TIMEOUT_MS, DEFAULT_CONNECT_TIMEOUT_MS, DEFAULT_ENDPOINT_HOST, DEFAULT_ENDPOINT_PORT,
};
use inference_bridge::pool::DEFAULT_POOL_SIZE;
use inference_bridge::stage::{
    DEFAULT_GRACE_PERIOD_MS, DEFAULT_GROUP, DEFAULT_INPUT_TOPIC, DEFAULT_OUTPUT_TOPIC,
};
use inference_bridge::{BridgeConfig, EndpointConfig, OutputFormat, StageConfig};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Which broker backend to run against
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BrokerKind {
    /// In-process topics fed from stdin and printed to stdout
    Memory,
    /// Redis Streams at the given URL
    Redis(String),
}

impl std::str::FromStr for BrokerKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.eq_ignore_ascii_case("memory") {
            Ok(Self::Memory)
        } else if s.starts_with("redis://") || s.starts_with("rediss://") {
            Ok(Self::Redis(s.to_string()))
        } else {
            Err(format!("unsupported broker '{s}' (expected memory or redis://host:port)"))
        }
    }
}

/// Streams image references through a remote image classifier
#[derive(Debug, Clone, Parser)]
#[command(name = "bridge-service", version, about)]
pub struct Args {
    /// Broker backend: `memory` or a `redis://` URL
    #[arg(long, env = "BRIDGE_BROKER", default_value = "memory")]
    pub broker: BrokerKind,

    /// Consumer name within the group (Redis only)
    #[arg(long, env = "BRIDGE_CONSUMER", default_value = DEFAULT_CONSUMER_NAME)]
    pub consumer_name: String,

    #[arg(long, env = "BRIDGE_INPUT_TOPIC", default_value = DEFAULT_INPUT_TOPIC)]
    pub input_topic: String,

    #[arg(long, env = "BRIDGE_OUTPUT_TOPIC", default_value = DEFAULT_OUTPUT_TOPIC)]
    pub output_topic: String,

    /// Consumer group, doubles as the application id
    #[arg(long, env = "BRIDGE_GROUP", default_value = DEFAULT_GROUP)]
    pub group: String,

    #[arg(long, env = "BRIDGE_ENDPOINT_HOST", default_value = DEFAULT_ENDPOINT_HOST)]
    pub endpoint_host: String,

    #[arg(long, env = "BRIDGE_ENDPOINT_PORT", default_value_t = DEFAULT_ENDPOINT_PORT)]
    pub endpoint_port: u16,

    #[arg(long, default_value_t = DEFAULT_CONNECT_TIMEOUT_MS)]
    pub connect_timeout_ms: u64,

    /// Deadline for one classify call
    #[arg(long, default_value_t = DEFAULT_CALL_TIMEOUT_MS)]
    pub call_timeout_ms: u64,

    /// Maximum number of open connections to the classifier
    #[arg(long, default_value_t = DEFAULT_POOL_SIZE)]
    pub pool_size: usize,

    /// Directory relative image references are resolved against
    #[arg(long, env = "BRIDGE_IMAGE_ROOT")]
    pub image_root: Option<PathBuf>,

    /// Output payload format: text or json
    #[arg(long, default_value = "text")]
    pub output_format: OutputFormat,

    /// Time in-flight messages get to finish on shutdown
    #[arg(long, default_value_t = DEFAULT_GRACE_PERIOD_MS)]
    pub grace_period_ms: u64,

    /// Serve Prometheus metrics on this address
    #[arg(long, env = "BRIDGE_METRICS_ADDR")]
    pub metrics_addr: Option<SocketAddr>,

    /// Emit logs as JSON
    #[arg(long)]
    pub log_json: bool,
}

impl Args {
    pub fn endpoint_config(&self) -> EndpointConfig {
        EndpointConfig {
            host: self.endpoint_host.clone(),
            port: self.endpoint_port,
            connect_timeout: Duration::from_millis(self.connect_timeout_ms),
            call_timeout: Duration::from_millis(self.call_timeout_ms),
        }
    }

    pub fn bridge_config(&self) -> BridgeConfig {
        BridgeConfig {
            image_root: self.image_root.clone(),
            call_timeout: Duration::from_millis(self.call_timeout_ms),
            output_format: self.output_format,
        }
    }

    pub fn stage_config(&self) -> StageConfig {
        StageConfig {
            input_topic: self.input_topic.clone(),
            output_topic: self.output_topic.clone(),
            group: self.group.clone(),
            grace_period: Duration::from_millis(self.grace_period_ms),
        }
    }
}
