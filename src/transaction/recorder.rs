//! Record queue operations now, apply them later as one guarded unit.

use std::time::Duration;

use tracing::{Instrument, info};

use super::signal::{SignalGuard, TerminationSignal};
use crate::error::{Error, Result};
use crate::model::{Message, MessageId, MtypeFilter, NewMessage, Reply};
use crate::queue::QueueClient;
use crate::telemetry::transaction::{record_command, record_deferred_signal, start_replay_span};

/// The message a recorded command acts on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageRef {
    Id(MessageId),
    /// The message claimed by the most recent `Dequeue` of the same replay.
    LastClaimed,
}

impl From<MessageId> for MessageRef {
    fn from(uid: MessageId) -> Self {
        MessageRef::Id(uid)
    }
}

impl From<&Message> for MessageRef {
    fn from(message: &Message) -> Self {
        MessageRef::Id(message.uid)
    }
}

/// One recorded [`QueueClient`] call.
#[derive(Debug, Clone)]
pub enum Command {
    Enqueue {
        queue: String,
        message: NewMessage,
    },
    Dequeue {
        queue: String,
        namespace: Option<String>,
        mtype: Option<MtypeFilter>,
    },
    MarkActioned {
        queue: String,
        message: MessageRef,
    },
    MarkError {
        queue: String,
        message: MessageRef,
        error: String,
    },
    MarkActionedAll {
        queue: String,
        uids: Vec<MessageId>,
    },
    Reply(Reply),
    /// Wait before the next command.
    Pause(Duration),
}

impl Command {
    pub fn name(&self) -> &'static str {
        match self {
            Command::Enqueue { .. } => "enqueue",
            Command::Dequeue { .. } => "dequeue",
            Command::MarkActioned { .. } => "mark_actioned",
            Command::MarkError { .. } => "mark_error",
            Command::MarkActionedAll { .. } => "mark_actioned_all",
            Command::Reply(_) => "reply",
            Command::Pause(_) => "pause",
        }
    }
}

/// Result of one replayed command, in history order.
#[derive(Debug, Clone, PartialEq)]
pub enum Applied {
    Enqueued(MessageId),
    Claimed(Option<Message>),
    Actioned(MessageId),
    Errored(MessageId),
    ActionedAll(Vec<Message>),
    Replied(MessageId),
    Paused,
}

/// What a guarded replay produced, plus any termination it held back.
#[derive(Debug)]
pub struct ReplayOutcome {
    pub result: Result<Vec<Applied>>,
    pub deferred: Option<TerminationSignal>,
}

/// Ordered history of queue calls, applied later against a real client.
///
/// Recording does not touch the store. Deciding what to do can take as long
/// as it needs; committing it is the fast [`TransactionRecorder::execute`]
/// step, which runs with termination signals deferred.
#[derive(Debug, Clone, Default)]
pub struct TransactionRecorder {
    history: Vec<Command>,
}

impl TransactionRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn history(&self) -> &[Command] {
        &self.history
    }

    pub fn len(&self) -> usize {
        self.history.len()
    }

    pub fn is_empty(&self) -> bool {
        self.history.is_empty()
    }

    pub fn clear(&mut self) {
        self.history.clear();
    }

    pub fn record(&mut self, command: Command) -> &mut Self {
        self.history.push(command);
        self
    }

    pub fn enqueue(&mut self, queue: impl Into<String>, message: NewMessage) -> &mut Self {
        self.record(Command::Enqueue {
            queue: queue.into(),
            message,
        })
    }

    pub fn push(
        &mut self,
        queue: impl Into<String>,
        namespace: impl Into<String>,
        payload: serde_json::Value,
    ) -> &mut Self {
        self.enqueue(queue, NewMessage::new(namespace, payload))
    }

    pub fn dequeue(
        &mut self,
        queue: impl Into<String>,
        namespace: Option<&str>,
        mtype: Option<MtypeFilter>,
    ) -> &mut Self {
        self.record(Command::Dequeue {
            queue: queue.into(),
            namespace: namespace.map(str::to_string),
            mtype,
        })
    }

    pub fn pop(&mut self, queue: impl Into<String>, namespace: Option<&str>) -> &mut Self {
        self.dequeue(queue, namespace, None)
    }

    pub fn mark_actioned(
        &mut self,
        queue: impl Into<String>,
        message: impl Into<MessageRef>,
    ) -> &mut Self {
        self.record(Command::MarkActioned {
            queue: queue.into(),
            message: message.into(),
        })
    }

    pub fn mark_error(
        &mut self,
        queue: impl Into<String>,
        message: impl Into<MessageRef>,
        error: impl Into<String>,
    ) -> &mut Self {
        self.record(Command::MarkError {
            queue: queue.into(),
            message: message.into(),
            error: error.into(),
        })
    }

    pub fn mark_actioned_all(&mut self, queue: impl Into<String>, uids: Vec<MessageId>) -> &mut Self {
        self.record(Command::MarkActionedAll {
            queue: queue.into(),
            uids,
        })
    }

    pub fn reply(&mut self, reply: Reply) -> &mut Self {
        self.record(Command::Reply(reply))
    }

    pub fn pause(&mut self, duration: Duration) -> &mut Self {
        self.record(Command::Pause(duration))
    }

    /// Apply the history in order on the current task, without deferring
    /// signals. Stops at the first failing command.
    pub async fn replay(&self, client: &QueueClient) -> Result<Vec<Applied>> {
        let span = start_replay_span(self.history.len());
        apply(client, &self.history, &span)
            .instrument(span.clone())
            .await
    }

    /// Apply the history on a spawned task while this task holds a
    /// [`SignalGuard`]. A termination requested during the replay is
    /// returned in [`ReplayOutcome::deferred`] instead of being honored.
    pub async fn replay_guarded(&self, client: &QueueClient) -> Result<ReplayOutcome> {
        let guard = SignalGuard::enter()?;

        let span = start_replay_span(self.history.len());
        let history = self.history.clone();
        let client = client.clone();
        let task_span = span.clone();
        let handle = tokio::spawn(
            async move { apply(&client, &history, &task_span).await }.instrument(span.clone()),
        );

        let result = match handle.await {
            Ok(result) => result,
            Err(e) => Err(Error::Other(format!("replay task failed: {e}"))),
        };

        let deferred = guard.release();
        if let Some(signal) = deferred {
            record_deferred_signal(&span, signal.name());
            info!(signal = signal.name(), "replay finished with a deferred signal");
        }
        Ok(ReplayOutcome { result, deferred })
    }

    /// Guarded replay that honors a deferred termination as soon as the
    /// replay is over, whether it succeeded or not.
    ///
    /// With [`Shutdown`] subscribers the signal is announced to them and the
    /// replay result is returned; otherwise the process exits here.
    ///
    /// [`Shutdown`]: super::signal::Shutdown
    pub async fn execute(&self, client: &QueueClient) -> Result<Vec<Applied>> {
        let outcome = self.replay_guarded(client).await?;
        if let Some(signal) = outcome.deferred {
            signal.redeliver();
        }
        outcome.result
    }
}

async fn apply(
    client: &QueueClient,
    history: &[Command],
    span: &tracing::Span,
) -> Result<Vec<Applied>> {
    let mut applied = Vec::with_capacity(history.len());
    let mut last_claimed: Option<MessageId> = None;

    for (index, command) in history.iter().enumerate() {
        record_command(span, index, command.name());

        let step = match command {
            Command::Enqueue { queue, message } => {
                Applied::Enqueued(client.enqueue(queue, message.clone()).await?)
            }
            Command::Dequeue {
                queue,
                namespace,
                mtype,
            } => {
                let claimed = client
                    .dequeue(queue, namespace.as_deref(), mtype.clone())
                    .await?;
                last_claimed = claimed.as_ref().map(|m| m.uid);
                Applied::Claimed(claimed)
            }
            Command::MarkActioned { queue, message } => {
                let uid = resolve(message, last_claimed)?;
                Applied::Actioned(client.mark_actioned(queue, uid).await?)
            }
            Command::MarkError {
                queue,
                message,
                error,
            } => {
                let uid = resolve(message, last_claimed)?;
                Applied::Errored(client.mark_error(queue, uid, error.as_str()).await?)
            }
            Command::MarkActionedAll { queue, uids } => {
                Applied::ActionedAll(client.mark_actioned_all(queue, uids).await?)
            }
            Command::Reply(reply) => Applied::Replied(client.reply(reply).await?),
            Command::Pause(duration) => {
                tokio::time::sleep(*duration).await;
                Applied::Paused
            }
        };
        applied.push(step);
    }
    Ok(applied)
}

fn resolve(message: &MessageRef, last_claimed: Option<MessageId>) -> Result<MessageId> {
    match message {
        MessageRef::Id(uid) => Ok(*uid),
        MessageRef::LastClaimed => last_claimed.ok_or_else(|| {
            Error::InvalidState("no message was claimed earlier in this replay".to_string())
        }),
    }
}
