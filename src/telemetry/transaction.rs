//! Transaction replay span helpers.

use tracing::Span;

/// Start a span covering one guarded replay.
///
/// `transaction.deferred_signal` is declared empty and filled by
/// [`record_deferred_signal`] when a termination was held back.
pub fn start_replay_span(commands: usize) -> Span {
    tracing::info_span!(
        "transaction.replay",
        "transaction.commands" = commands,
        "transaction.deferred_signal" = tracing::field::Empty,
    )
}

/// Record one replayed command on the span.
pub fn record_command(span: &Span, index: usize, command: &str) {
    span.in_scope(|| {
        tracing::debug!(index, command, "replay_command");
    });
}

pub fn record_deferred_signal(span: &Span, signal: &str) {
    span.record("transaction.deferred_signal", signal);
}
