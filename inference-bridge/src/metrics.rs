//! Metric names and recording helpers
//!
//! Recorded through the `metrics` facade; nothing is exported unless the
//! embedding binary installs a recorder.

use metrics::{counter, describe_counter, describe_histogram};

use crate::error::ErrorKind;

/// Metric names
pub const MESSAGES_TOTAL: &str = "bridge_messages_total";
pub const FAILURES_TOTAL: &str = "bridge_failures_total";
pub const CLASSIFY_DURATION: &str = "bridge_classify_duration_seconds";
pub const POOL_CONNECTIONS_OPENED: &str = "bridge_pool_connections_opened_total";

/// Register metric descriptions with the installed recorder
pub fn describe() {
    describe_counter!(MESSAGES_TOTAL, "Messages handled, by outcome");
    describe_counter!(FAILURES_TOTAL, "Message-scoped failures, by error kind");
    describe_histogram!(CLASSIFY_DURATION, "Remote classify call latency in seconds");
    describe_counter!(POOL_CONNECTIONS_OPENED, "Connections opened by the client pool");
}

pub fn record_received() {
    counter!(MESSAGES_TOTAL, "outcome" => "received").increment(1);
}

pub fn record_emitted() {
    counter!(MESSAGES_TOTAL, "outcome" => "emitted").increment(1);
}

pub fn record_failed(kind: ErrorKind) {
    counter!(MESSAGES_TOTAL, "outcome" => "failed").increment(1);
    counter!(FAILURES_TOTAL, "kind" => kind.as_str()).increment(1);
}

pub fn record_publish_failed() {
    counter!(MESSAGES_TOTAL, "outcome" => "publish_failed").increment(1);
}
