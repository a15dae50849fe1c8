//! The backing store contract.
//!
//! Queue semantics live in [`crate::queue`] and [`crate::monitor`]; a store
//! only has to provide document-level primitives over per-(namespace, queue)
//! message collections plus the agent ("system") and log collections.
//!
//! The one primitive that carries correctness is
//! [`Store::find_one_and_update`]: it must select the oldest matching message
//! and apply the update as a single indivisible operation, so that two callers
//! can never both receive the same document.

pub mod memory;

pub use memory::MemoryStore;

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::Result;
use crate::model::{Agent, AgentId, Message, MessageId, MtypeFilter, NewAgent, NewMessage};

#[async_trait]
pub trait Store: Send + Sync {
    /// Register a queue in a namespace (idempotent).
    async fn create_queue(&self, namespace: &str, queue: &str) -> Result<()>;

    async fn namespaces(&self) -> Result<Vec<String>>;

    async fn queues(&self, namespace: &str) -> Result<Vec<String>>;

    async fn insert_message(&self, queue: &str, message: NewMessage) -> Result<MessageId>;

    /// Matching messages ordered by `time`, then `uid`.
    async fn find_messages(
        &self,
        queue: &str,
        filter: &MessageFilter,
        limit: Option<usize>,
    ) -> Result<Vec<Message>>;

    async fn count_messages(&self, queue: &str, filter: &MessageFilter) -> Result<u64>;

    /// Matching messages of `queue` counted per namespace. Namespaces without
    /// a match are absent.
    async fn count_by_namespace(
        &self,
        queue: &str,
        filter: &MessageFilter,
    ) -> Result<BTreeMap<String, u64>>;

    /// Atomically pick the oldest matching message, apply `update`, and return
    /// the updated document. `None` when nothing matches; never blocks waiting
    /// for a match to appear.
    async fn find_one_and_update(
        &self,
        queue: &str,
        filter: &MessageFilter,
        update: &MessageUpdate,
    ) -> Result<Option<Message>>;

    /// Apply `update` to every matching message. The filter is re-checked per
    /// document at write time, so concurrent callers with the same filter never
    /// update a document twice. Returns the updated documents.
    async fn update_many(
        &self,
        queue: &str,
        filter: &MessageFilter,
        update: &MessageUpdate,
    ) -> Result<Vec<Message>>;

    async fn delete_messages(&self, queue: &str, filter: &MessageFilter) -> Result<u64>;

    async fn insert_agent(&self, agent: NewAgent) -> Result<AgentId>;

    async fn update_agent(&self, uid: AgentId, update: &AgentUpdate) -> Result<()>;

    async fn find_agents(&self, filter: &AgentFilter) -> Result<Vec<Agent>>;

    /// Matching agents counted per namespace. Agents without a namespace are
    /// not counted.
    async fn count_agents_by_namespace(&self, filter: &AgentFilter)
    -> Result<BTreeMap<String, u64>>;

    /// Same write-time re-check discipline as [`Store::update_many`].
    async fn update_agents(&self, filter: &AgentFilter, update: &AgentUpdate)
    -> Result<Vec<Agent>>;

    async fn insert_log(&self, agent: AgentId, ltype: i32, line: &str) -> Result<()>;

    /// All lines of one log type of an agent, concatenated in insert order.
    async fn log(&self, agent: AgentId, ltype: i32) -> Result<String>;

    async fn log_types(&self, agent: AgentId) -> Result<Vec<i32>>;

    /// Remove every queue, message, agent and log line of a namespace.
    async fn drop_namespace(&self, namespace: &str) -> Result<()>;
}

// ---------------------------------------------------------------------------
// Message filter
// ---------------------------------------------------------------------------

/// Conjunction of optional predicates over messages of one queue.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MessageFilter {
    pub uids: Option<Vec<MessageId>>,
    pub namespace: Option<String>,
    pub mtype: Option<MtypeFilter>,
    pub read: Option<bool>,
    pub actioned: Option<bool>,
    pub has_error: Option<bool>,
    /// `retry < n`
    pub retry_below: Option<i32>,
    /// `retry >= n`
    pub retry_at_least: Option<i32>,
    /// `coalesce(heartbeat, read_time) < t`
    pub stale_before: Option<DateTime<Utc>>,
    pub replying_to: Option<MessageId>,
}

impl MessageFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn uid(self, uid: MessageId) -> Self {
        self.uids(vec![uid])
    }

    pub fn uids(mut self, uids: Vec<MessageId>) -> Self {
        self.uids = Some(uids);
        self
    }

    pub fn namespace(mut self, namespace: Option<&str>) -> Self {
        self.namespace = namespace.map(str::to_string);
        self
    }

    pub fn mtype(mut self, mtype: Option<MtypeFilter>) -> Self {
        self.mtype = mtype;
        self
    }

    pub fn read(mut self, read: bool) -> Self {
        self.read = Some(read);
        self
    }

    pub fn actioned(mut self, actioned: bool) -> Self {
        self.actioned = Some(actioned);
        self
    }

    pub fn has_error(mut self, has_error: bool) -> Self {
        self.has_error = Some(has_error);
        self
    }

    pub fn retry_below(mut self, max_retry: i32) -> Self {
        self.retry_below = Some(max_retry);
        self
    }

    pub fn retry_at_least(mut self, max_retry: i32) -> Self {
        self.retry_at_least = Some(max_retry);
        self
    }

    pub fn stale_before(mut self, cutoff: DateTime<Utc>) -> Self {
        self.stale_before = Some(cutoff);
        self
    }

    pub fn replying_to(mut self, uid: MessageId) -> Self {
        self.replying_to = Some(uid);
        self
    }

    /// Reference semantics. SQL translations must agree with this.
    pub fn matches(&self, msg: &Message) -> bool {
        if let Some(uids) = &self.uids {
            if !uids.contains(&msg.uid) {
                return false;
            }
        }
        if let Some(ns) = &self.namespace {
            if *ns != msg.namespace {
                return false;
            }
        }
        if let Some(mtype) = &self.mtype {
            if !mtype.matches(msg.mtype) {
                return false;
            }
        }
        if self.read.is_some_and(|r| r != msg.read) {
            return false;
        }
        if self.actioned.is_some_and(|a| a != msg.actioned) {
            return false;
        }
        if self.has_error.is_some_and(|e| e != msg.error.is_some()) {
            return false;
        }
        if self.retry_below.is_some_and(|max| msg.retry >= max) {
            return false;
        }
        if self.retry_at_least.is_some_and(|max| msg.retry < max) {
            return false;
        }
        if let Some(cutoff) = self.stale_before {
            // A message nobody ever touched is not stale, it is unclaimed.
            match msg.last_seen() {
                Some(seen) if seen < cutoff => {}
                _ => return false,
            }
        }
        if let Some(uid) = self.replying_to {
            if msg.replying_to != Some(uid) {
                return false;
            }
        }
        true
    }
}

// ---------------------------------------------------------------------------
// Message update
// ---------------------------------------------------------------------------

/// Field assignments applied to matched messages.
///
/// `Some(None)` on an optional column clears it.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MessageUpdate {
    pub read: Option<bool>,
    pub read_time: Option<Option<DateTime<Utc>>>,
    pub actioned: Option<bool>,
    pub actioned_time: Option<Option<DateTime<Utc>>>,
    pub error: Option<Option<String>>,
    pub heartbeat: Option<DateTime<Utc>>,
    pub increment_retry: bool,
}

impl MessageUpdate {
    /// Unread → read.
    pub fn claim(now: DateTime<Utc>) -> Self {
        Self {
            read: Some(true),
            read_time: Some(Some(now)),
            heartbeat: Some(now),
            ..Self::default()
        }
    }

    pub fn actioned(now: DateTime<Utc>) -> Self {
        Self {
            actioned: Some(true),
            actioned_time: Some(Some(now)),
            ..Self::default()
        }
    }

    /// Compensation for [`MessageUpdate::actioned`].
    pub fn rollback_actioned() -> Self {
        Self {
            actioned: Some(false),
            actioned_time: Some(None),
            ..Self::default()
        }
    }

    pub fn error(error: impl Into<String>) -> Self {
        Self {
            error: Some(Some(error.into())),
            ..Self::default()
        }
    }

    pub fn heartbeat(now: DateTime<Utc>) -> Self {
        Self {
            heartbeat: Some(now),
            ..Self::default()
        }
    }

    /// Make claimable again, clear the error, count the attempt.
    pub fn requeue() -> Self {
        Self {
            read: Some(false),
            read_time: Some(None),
            error: Some(None),
            increment_retry: true,
            ..Self::default()
        }
    }

    /// Make claimable again without retry accounting.
    pub fn reset() -> Self {
        Self {
            read: Some(false),
            read_time: Some(None),
            ..Self::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    pub fn apply(&self, msg: &mut Message) {
        if let Some(read) = self.read {
            msg.read = read;
        }
        if let Some(read_time) = self.read_time {
            msg.read_time = read_time;
        }
        if let Some(actioned) = self.actioned {
            msg.actioned = actioned;
        }
        if let Some(actioned_time) = self.actioned_time {
            msg.actioned_time = actioned_time;
        }
        if let Some(error) = &self.error {
            msg.error = error.clone();
        }
        if let Some(heartbeat) = self.heartbeat {
            msg.heartbeat = Some(heartbeat);
        }
        if self.increment_retry {
            msg.retry += 1;
        }
    }
}

// ---------------------------------------------------------------------------
// Agents
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq)]
pub struct AgentFilter {
    pub uid: Option<AgentId>,
    pub namespace: Option<String>,
    /// Only agents that never claimed anything and so have no namespace.
    pub unassigned: bool,
    pub alive: Option<bool>,
    /// `heartbeat < t`
    pub heartbeat_before: Option<DateTime<Utc>>,
}

impl AgentFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn uid(mut self, uid: AgentId) -> Self {
        self.uid = Some(uid);
        self
    }

    pub fn namespace(mut self, namespace: Option<&str>) -> Self {
        self.namespace = namespace.map(str::to_string);
        self
    }

    pub fn unassigned(mut self) -> Self {
        self.unassigned = true;
        self
    }

    pub fn alive(mut self, alive: bool) -> Self {
        self.alive = Some(alive);
        self
    }

    pub fn heartbeat_before(mut self, cutoff: DateTime<Utc>) -> Self {
        self.heartbeat_before = Some(cutoff);
        self
    }

    pub fn matches(&self, agent: &Agent) -> bool {
        self.uid.is_none_or(|uid| uid == agent.uid)
            && self
                .namespace
                .as_ref()
                .is_none_or(|ns| agent.namespace.as_ref() == Some(ns))
            && (!self.unassigned || agent.namespace.is_none())
            && self.alive.is_none_or(|alive| alive == agent.alive)
            && self
                .heartbeat_before
                .is_none_or(|cutoff| agent.heartbeat < cutoff)
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct AgentUpdate {
    pub heartbeat: Option<DateTime<Utc>>,
    pub alive: Option<bool>,
    pub message: Option<Option<MessageId>>,
    pub queue: Option<Option<String>>,
    pub namespace: Option<String>,
}

impl AgentUpdate {
    pub fn heartbeat(now: DateTime<Utc>) -> Self {
        Self {
            heartbeat: Some(now),
            ..Self::default()
        }
    }

    /// Point the agent at the message it just claimed.
    pub fn hold(now: DateTime<Utc>, queue: &str, msg: &Message) -> Self {
        Self {
            heartbeat: Some(now),
            message: Some(Some(msg.uid)),
            queue: Some(Some(queue.to_string())),
            namespace: Some(msg.namespace.clone()),
            ..Self::default()
        }
    }

    pub fn release(now: DateTime<Utc>) -> Self {
        Self {
            heartbeat: Some(now),
            message: Some(None),
            queue: Some(None),
            ..Self::default()
        }
    }

    pub fn dead() -> Self {
        Self {
            alive: Some(false),
            ..Self::default()
        }
    }

    pub fn apply(&self, agent: &mut Agent) {
        if let Some(heartbeat) = self.heartbeat {
            agent.heartbeat = heartbeat;
        }
        if let Some(alive) = self.alive {
            agent.alive = alive;
        }
        if let Some(message) = self.message {
            agent.message = message;
        }
        if let Some(queue) = &self.queue {
            agent.queue = queue.clone();
        }
        if let Some(namespace) = &self.namespace {
            agent.namespace = Some(namespace.clone());
        }
    }
}
