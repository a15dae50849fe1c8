//! Metric instrument factories for msgq.
//!
//! Uses the OTel Meter API with the globally-registered `MeterProvider`.
//! All instruments are created lazily from the `"msgq"` meter.

use opentelemetry::metrics::{Counter, Meter};

/// Returns the shared meter for msgq instruments.
fn meter() -> Meter {
    opentelemetry::global::meter("msgq")
}

/// Counter: queue-level operations (enqueue, dequeue, actioned, error, reply).
/// Labels: `queue`, `operation`.
pub fn queue_operations() -> Counter<u64> {
    meter()
        .u64_counter("msgq.queue.operations")
        .with_description("Number of queue operations")
        .build()
}

/// Counter: messages made claimable again.
/// Labels: `queue`, `reason` ("lost" | "failed" | "reset").
pub fn messages_requeued() -> Counter<u64> {
    meter()
        .u64_counter("msgq.messages.requeued")
        .with_description("Number of messages reset to a claimable state")
        .build()
}

/// Counter: heartbeat writes that failed and were left to the next tick.
pub fn heartbeat_failures() -> Counter<u64> {
    meter()
        .u64_counter("msgq.heartbeat.failures")
        .with_description("Heartbeat writes that failed")
        .build()
}

/// Counter: replies whose inputs had to be rolled back.
/// Labels: `queue`, `result` ("ok" | "error").
pub fn reply_rollbacks() -> Counter<u64> {
    meter()
        .u64_counter("msgq.reply.rollbacks")
        .with_description("Replies rolled back after a partial failure")
        .build()
}
