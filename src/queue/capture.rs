//! Agent log capture.
//!
//! [`channel`] returns a tracing layer and the matching sink. Install the layer
//! in the subscriber (see [`TelemetryConfig::capture`]) and hand the sink to
//! [`QueueClient::start_with_capture`]; the session's pacemaker then persists
//! every captured line as a log entry of the agent. Capture is a side channel:
//! lines that cannot be stored are dropped.
//!
//! [`TelemetryConfig::capture`]: crate::telemetry::TelemetryConfig::capture
//! [`QueueClient::start_with_capture`]: crate::queue::QueueClient::start_with_capture

use std::fmt::Write as _;

use chrono::Utc;
use tokio::sync::mpsc;
use tracing::field::{Field, Visit};
use tracing::{Event, Subscriber};
use tracing_subscriber::layer::{Context, Layer};

/// Log type used for captured diagnostics.
pub const CAPTURED_LTYPE: i32 = 0;

/// Create a connected layer/sink pair.
pub fn channel() -> (AgentLogLayer, LogSink) {
    let (tx, rx) = mpsc::unbounded_channel();
    (AgentLogLayer { tx }, LogSink { rx })
}

/// Formats tracing events into log lines and forwards them to a [`LogSink`].
#[derive(Clone)]
pub struct AgentLogLayer {
    tx: mpsc::UnboundedSender<String>,
}

impl<S: Subscriber> Layer<S> for AgentLogLayer {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let meta = event.metadata();
        // Query logging from the store driver would feed back into itself.
        if meta.target().starts_with("sqlx") {
            return;
        }

        let mut fields = LineVisitor::default();
        event.record(&mut fields);

        let line = format!(
            "{} [{:>5}] {}: {}{}\n",
            Utc::now().format("%Y-%m-%dT%H:%M:%S%.3fZ"),
            meta.level(),
            meta.target(),
            fields.message,
            fields.rest,
        );
        // Receiver gone means the session ended; nothing left to attach to.
        let _ = self.tx.send(line);
    }
}

#[derive(Default)]
struct LineVisitor {
    message: String,
    rest: String,
}

impl Visit for LineVisitor {
    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        if field.name() == "message" {
            let _ = write!(self.message, "{value:?}");
        } else {
            let _ = write!(self.rest, " {}={value:?}", field.name());
        }
    }

    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.message.push_str(value);
        } else {
            let _ = write!(self.rest, " {}={value}", field.name());
        }
    }
}

/// Receiving end of a capture channel, drained by the pacemaker.
pub struct LogSink {
    rx: mpsc::UnboundedReceiver<String>,
}

impl LogSink {
    /// Everything captured since the last drain, oldest first.
    pub fn drain(&mut self) -> Vec<String> {
        let mut lines = Vec::new();
        while let Ok(line) = self.rx.try_recv() {
            lines.push(line);
        }
        lines
    }
}
