//! Replies: enqueue a follow-up only if the inputs can be marked actioned.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::{Message, MessageId};

/// A conditional enqueue. `payload` goes into `queue` once every message
/// listed in `work` has been marked actioned. Never persisted on its own;
/// see [`QueueClient::reply`](crate::queue::QueueClient::reply) for the
/// (best-effort) commit semantics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reply {
    pub queue: String,
    pub namespace: String,
    /// Input messages to complete, grouped by the queue they live in.
    pub work: BTreeMap<String, Vec<MessageId>>,
    pub payload: serde_json::Value,
    pub mtype: i32,
    pub replying_to: Option<MessageId>,
}

impl Reply {
    pub fn new(
        queue: impl Into<String>,
        namespace: impl Into<String>,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            queue: queue.into(),
            namespace: namespace.into(),
            work: BTreeMap::new(),
            payload,
            mtype: 0,
            replying_to: None,
        }
    }

    /// Add input messages from `queue`.
    pub fn consumes<'a>(
        mut self,
        queue: impl Into<String>,
        messages: impl IntoIterator<Item = &'a Message>,
    ) -> Self {
        self.work
            .entry(queue.into())
            .or_default()
            .extend(messages.into_iter().map(MessageId::from));
        self
    }

    /// Add input message ids from `queue`.
    pub fn consumes_ids(
        mut self,
        queue: impl Into<String>,
        uids: impl IntoIterator<Item = MessageId>,
    ) -> Self {
        self.work.entry(queue.into()).or_default().extend(uids);
        self
    }

    pub fn mtype(mut self, mtype: i32) -> Self {
        self.mtype = mtype;
        self
    }

    pub fn replying_to(mut self, uid: MessageId) -> Self {
        self.replying_to = Some(uid);
        self
    }

    /// Total number of input messages across queues.
    pub fn input_count(&self) -> usize {
        self.work.values().map(Vec::len).sum()
    }
}
