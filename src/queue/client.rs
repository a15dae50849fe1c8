//! Queue client: enqueue, claim, complete, fail, reply.
//!
//! Claiming is delegated to [`Store::find_one_and_update`]; the client holds no
//! locks of its own. Every other operation targets a known uid.

use std::sync::Arc;

use chrono::Utc;
use opentelemetry::KeyValue;
use tracing::{debug, error, info, warn};

use super::capture::LogSink;
use super::pacemaker::Pacemaker;
use super::validate_queue_name;
use crate::config::QueueConfig;
use crate::error::{Error, Result};
use crate::model::{AgentId, Message, MessageId, MtypeFilter, NewMessage, Reply};
use crate::monitor::QueueMonitor;
use crate::store::{MessageFilter, MessageUpdate, Store};
use crate::telemetry::metrics;

/// Handle to the queues of one store, optionally running a worker session.
///
/// Clones share the store and the session's pacemaker.
#[derive(Clone)]
pub struct QueueClient {
    store: Arc<dyn Store>,
    name: String,
    namespace: Option<String>,
    config: QueueConfig,
    pacemaker: Option<Arc<Pacemaker>>,
}

impl QueueClient {
    /// A client without a session. `name` is the agent name used by
    /// [`QueueClient::start`].
    pub fn new(store: Arc<dyn Store>, name: impl Into<String>) -> Self {
        Self {
            store,
            name: name.into(),
            namespace: None,
            config: QueueConfig::default(),
            pacemaker: None,
        }
    }

    /// Namespace recorded on the agent at registration.
    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = Some(namespace.into());
        self
    }

    pub fn with_config(mut self, config: QueueConfig) -> Self {
        self.config = config;
        self
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    /// A monitor over the same store.
    pub fn monitor(&self) -> QueueMonitor {
        QueueMonitor::new(Arc::clone(&self.store))
    }

    pub fn pacemaker(&self) -> Option<&Pacemaker> {
        self.pacemaker.as_deref()
    }

    pub fn agent_id(&self) -> Option<AgentId> {
        self.pacemaker.as_ref().map(|p| p.agent_id())
    }

    // -----------------------------------------------------------------------
    // Session
    // -----------------------------------------------------------------------

    /// Open a worker session: register the agent and start heartbeats.
    pub async fn start(&mut self) -> Result<AgentId> {
        self.open_session(None).await
    }

    /// Like [`QueueClient::start`], persisting captured output to the agent log.
    pub async fn start_with_capture(&mut self, sink: LogSink) -> Result<AgentId> {
        self.open_session(Some(sink)).await
    }

    async fn open_session(&mut self, capture: Option<LogSink>) -> Result<AgentId> {
        if self.pacemaker.is_some() {
            return Err(Error::InvalidState(format!(
                "session for {} already open",
                self.name
            )));
        }

        let pacemaker = Pacemaker::register_agent(
            Arc::clone(&self.store),
            &self.name,
            self.namespace.as_deref(),
            self.config.heartbeat_interval,
        )
        .await?;
        if let Some(sink) = capture {
            pacemaker.capture_output(sink);
        }
        pacemaker.start()?;

        let agent = pacemaker.agent_id();
        self.pacemaker = Some(Arc::new(pacemaker));
        Ok(agent)
    }

    /// Close the session: stop heartbeats, then mark the agent not alive.
    pub async fn close(&mut self) -> Result<()> {
        let Some(pacemaker) = self.pacemaker.take() else {
            return Ok(());
        };
        pacemaker.stop().await;
        pacemaker.unregister_agent().await
    }

    // -----------------------------------------------------------------------
    // Protocol
    // -----------------------------------------------------------------------

    /// Insert a new unread message, creating the queue if needed.
    pub async fn enqueue(&self, queue: &str, message: NewMessage) -> Result<MessageId> {
        validate_queue_name(queue)?;
        self.store.create_queue(&message.namespace, queue).await?;

        let uid = self.store.insert_message(queue, message).await?;
        debug!(queue, %uid, "enqueued");
        record_operation(queue, "enqueue");
        Ok(uid)
    }

    /// Shorthand for [`QueueClient::enqueue`] with message type 0.
    pub async fn push(
        &self,
        queue: &str,
        namespace: &str,
        payload: serde_json::Value,
    ) -> Result<MessageId> {
        self.enqueue(queue, NewMessage::new(namespace, payload))
            .await
    }

    /// Claim the oldest unread message matching the filters.
    ///
    /// The selection and the `read = true` flip are one store operation, so a
    /// message is handed to exactly one caller. Returns `None` immediately when
    /// nothing is eligible.
    pub async fn dequeue(
        &self,
        queue: &str,
        namespace: Option<&str>,
        mtype: Option<MtypeFilter>,
    ) -> Result<Option<Message>> {
        let eligible = MessageFilter::new()
            .read(false)
            .namespace(namespace)
            .mtype(mtype);

        let claimed = self
            .store
            .find_one_and_update(queue, &eligible, &MessageUpdate::claim(Utc::now()))
            .await?;

        let Some(message) = claimed else {
            record_operation(queue, "dequeue_empty");
            return Ok(None);
        };

        debug!(queue, uid = %message.uid, "claimed");
        record_operation(queue, "dequeue");

        if let Some(pacemaker) = &self.pacemaker {
            // The claim already happened; losing the binding only means the
            // message gets no heartbeats and may be requeued as lost.
            if let Err(e) = pacemaker.register_message(queue, &message).await {
                warn!(queue, uid = %message.uid, "could not bind message to agent: {e}");
            }
        }
        Ok(Some(message))
    }

    /// Shorthand for [`QueueClient::dequeue`] without a type filter.
    pub async fn pop(&self, queue: &str, namespace: Option<&str>) -> Result<Option<Message>> {
        self.dequeue(queue, namespace, None).await
    }

    /// Mark a message completed.
    pub async fn mark_actioned(
        &self,
        queue: &str,
        message: impl Into<MessageId>,
    ) -> Result<MessageId> {
        let uid = message.into();
        self.release(uid).await;

        self.store
            .find_one_and_update(
                queue,
                &MessageFilter::new().uid(uid),
                &MessageUpdate::actioned(Utc::now()),
            )
            .await?
            .ok_or_else(|| Error::NotFound(format!("message {uid} in {queue}")))?;

        debug!(queue, %uid, "actioned");
        record_operation(queue, "actioned");
        Ok(uid)
    }

    /// Record a failure on a message. The message stays claimed; whether it is
    /// retried is up to a monitor sweep.
    pub async fn mark_error(
        &self,
        queue: &str,
        message: impl Into<MessageId>,
        error: impl Into<String>,
    ) -> Result<MessageId> {
        let uid = message.into();
        self.release(uid).await;

        self.store
            .find_one_and_update(
                queue,
                &MessageFilter::new().uid(uid),
                &MessageUpdate::error(error),
            )
            .await?
            .ok_or_else(|| Error::NotFound(format!("message {uid} in {queue}")))?;

        debug!(queue, %uid, "errored");
        record_operation(queue, "error");
        Ok(uid)
    }

    /// Mark every not-yet-actioned message of `uids` completed in one store
    /// operation. Returns the messages this call changed.
    pub async fn mark_actioned_all(&self, queue: &str, uids: &[MessageId]) -> Result<Vec<Message>> {
        if uids.is_empty() {
            return Ok(Vec::new());
        }
        if let Some(held) = self.pacemaker.as_ref().and_then(|p| p.held()) {
            if uids.contains(&held.uid) {
                self.release(held.uid).await;
            }
        }

        let pending = MessageFilter::new().uids(uids.to_vec()).actioned(false);
        let marked = self
            .store
            .update_many(queue, &pending, &MessageUpdate::actioned(Utc::now()))
            .await?;

        debug!(queue, count = marked.len(), "actioned in bulk");
        record_operation(queue, "actioned_all");
        Ok(marked)
    }

    /// Complete the reply's inputs, then enqueue its payload.
    ///
    /// If any step fails, every input this call marked is reset to
    /// `actioned = false` and the original error is returned. This is a
    /// best-effort, same-process compensation, not a transaction: a crash
    /// between marking and rollback leaves the inputs actioned without a reply.
    /// Wrap the call in a [`TransactionRecorder`] replay to at least defer
    /// termination signals across it.
    ///
    /// [`TransactionRecorder`]: crate::transaction::TransactionRecorder
    pub async fn reply(&self, reply: &Reply) -> Result<MessageId> {
        let mut marked: Vec<(&str, Vec<MessageId>)> = Vec::with_capacity(reply.work.len());

        match self.commit_reply(reply, &mut marked).await {
            Ok(uid) => {
                info!(queue = %reply.queue, %uid, inputs = reply.input_count(), "replied");
                record_operation(&reply.queue, "reply");
                Ok(uid)
            }
            Err(e) => {
                warn!(queue = %reply.queue, "rolling back reply: {e}");
                let result = if self.rollback(&marked).await { "ok" } else { "error" };
                metrics::reply_rollbacks().add(
                    1,
                    &[
                        KeyValue::new("queue", reply.queue.clone()),
                        KeyValue::new("result", result),
                    ],
                );
                Err(e)
            }
        }
    }

    async fn commit_reply<'r>(
        &self,
        reply: &'r Reply,
        marked: &mut Vec<(&'r str, Vec<MessageId>)>,
    ) -> Result<MessageId> {
        for (queue, uids) in &reply.work {
            let done = self.mark_actioned_all(queue, uids).await?;
            marked.push((queue.as_str(), done.iter().map(|m| m.uid).collect()));
        }

        let mut message = NewMessage::new(&reply.namespace, reply.payload.clone()).mtype(reply.mtype);
        message.replying_to = reply.replying_to;
        self.enqueue(&reply.queue, message).await
    }

    /// Undo the marks of a failed reply. Returns false if any queue could not
    /// be rolled back; those failures are logged, not returned.
    async fn rollback(&self, marked: &[(&str, Vec<MessageId>)]) -> bool {
        let mut clean = true;
        for (queue, uids) in marked.iter().filter(|(_, uids)| !uids.is_empty()) {
            let filter = MessageFilter::new().uids(uids.clone());
            if let Err(e) = self
                .store
                .update_many(queue, &filter, &MessageUpdate::rollback_actioned())
                .await
            {
                error!(queue, count = uids.len(), "reply rollback failed: {e}");
                clean = false;
            }
        }
        clean
    }

    /// Unbind `uid` from the session before it leaves the in-flight state.
    async fn release(&self, uid: MessageId) {
        if let Some(pacemaker) = &self.pacemaker {
            if let Err(e) = pacemaker.unregister_message(uid).await {
                warn!(%uid, "could not release message from agent: {e}");
            }
        }
    }
}

fn record_operation(queue: &str, operation: &'static str) {
    metrics::queue_operations().add(
        1,
        &[
            KeyValue::new("queue", queue.to_string()),
            KeyValue::new("operation", operation),
        ],
    );
}
