//! Image classification bridge service
//!
//! Consumes image references from the input topic, classifies each image on
//! the remote classification endpoint and publishes the predictions to the
//! output topic.
//!
//! Brokers:
//! - `memory` - in-process topics; image references are read from stdin one
//!   per line and emitted predictions are printed to stdout
//! - `redis://host:port` - Redis Streams with consumer groups

mod config;
mod telemetry;

use anyhow::Context;
use clap::Parser;
use inference_bridge::{
    Broker, ClientPool, GrpcConnector, InferenceBridge, MemoryBroker, RedisBroker, StreamStage,
};
use std::io::BufRead;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

use config::{Args, BrokerKind};

/// Group used to read the output topic back for printing in memory mode
const STDOUT_GROUP: &str = "stdout";

/// How long printing may take to catch up after the stage stopped
const PRINT_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    telemetry::init_tracing(args.log_json);

    if let Some(addr) = args.metrics_addr {
        telemetry::init_metrics(addr).context("failed to start metrics exporter")?;
    }

    let endpoint = args.endpoint_config();
    info!(
        endpoint = %endpoint.uri(),
        input = %args.input_topic,
        output = %args.output_topic,
        group = %args.group,
        "Bridge service starting"
    );

    let pool = ClientPool::new(GrpcConnector::new(endpoint), args.pool_size);
    let bridge = Arc::new(InferenceBridge::new(pool, args.bridge_config()));

    match &args.broker {
        BrokerKind::Memory => run_memory(&args, bridge).await,
        BrokerKind::Redis(url) => {
            let broker = RedisBroker::connect(url, args.consumer_name.clone())
                .await
                .with_context(|| format!("failed to connect to {url}"))?;
            let stage = StreamStage::start(&broker, bridge, args.stage_config())
                .await
                .context("failed to start stream stage")?;
            supervise(&stage).await;
            Ok(())
        }
    }
}

async fn run_memory(args: &Args, bridge: Arc<InferenceBridge<GrpcConnector>>) -> anyhow::Result<()> {
    let broker = Arc::new(MemoryBroker::new());
    let stage = StreamStage::start(broker.as_ref(), bridge, args.stage_config())
        .await
        .context("failed to start stream stage")?;

    let printer = {
        let broker = broker.clone();
        let topic = args.output_topic.clone();
        tokio::spawn(async move { print_output(broker.as_ref(), &topic).await })
    };

    // Blocking stdin reads live on a plain thread so they never hold up
    // runtime shutdown.
    {
        let broker = broker.clone();
        let topic = args.input_topic.clone();
        std::thread::spawn(move || feed_stdin(&broker, &topic));
    }

    supervise(&stage).await;

    broker.close_topic(&args.output_topic);
    match tokio::time::timeout(PRINT_DRAIN_TIMEOUT, printer).await {
        Ok(Ok(Ok(()))) => {}
        Ok(Ok(Err(e))) => warn!(error = %e, "Output printer failed"),
        Ok(Err(e)) => warn!(error = %e, "Output printer panicked"),
        Err(_) => warn!("Output printer did not drain in time"),
    }
    Ok(())
}

/// Publish every non-empty stdin line as an image reference; end of input
/// closes the topic.
fn feed_stdin(broker: &MemoryBroker, topic: &str) {
    for line in std::io::stdin().lock().lines() {
        match line {
            Ok(line) if line.trim().is_empty() => {}
            Ok(line) => broker.send(topic, None, line.trim()),
            Err(e) => {
                error!(error = %e, "Failed to read stdin");
                break;
            }
        }
    }
    info!(topic, "Input ended");
    broker.close_topic(topic);
}

async fn print_output(broker: &MemoryBroker, topic: &str) -> anyhow::Result<()> {
    let subscription = broker.subscribe(topic, STDOUT_GROUP).await?;
    while let Some(message) = subscription.next().await? {
        println!("{}", message.value);
        subscription.commit(&message).await?;
    }
    Ok(())
}

/// Run until a shutdown signal or until the stage ends on its own, then stop.
async fn supervise(stage: &StreamStage) {
    tokio::select! {
        () = shutdown_signal() => info!("Shutdown signal received"),
        () = stage.finished() => info!("Stream stage finished"),
    }

    let outcome = stage.stop().await;
    info!(outcome = ?outcome, "Bridge service stopped");
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }
}
