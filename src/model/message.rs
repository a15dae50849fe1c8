//! Queue messages.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Message
// ---------------------------------------------------------------------------

/// A unit of work stored in one queue of one namespace.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Store-assigned unique identifier.
    pub uid: MessageId,

    /// When the message was created. Claim order is `time` ascending.
    pub time: DateTime<Utc>,

    /// Consumer-defined discriminator, usable as a dequeue filter.
    pub mtype: i32,

    /// Claimed by a worker.
    pub read: bool,
    pub read_time: Option<DateTime<Utc>>,

    /// Completed. `actioned_time` is set iff `actioned` is true.
    pub actioned: bool,
    pub actioned_time: Option<DateTime<Utc>>,

    /// The message this one answers, if any.
    pub replying_to: Option<MessageId>,

    /// Opaque payload. The queue never interprets it.
    pub message: serde_json::Value,

    /// Number of requeues so far. Only requeue increments it.
    pub retry: i32,

    /// Last failure description.
    pub error: Option<String>,

    pub namespace: String,

    /// Refreshed by the claiming agent's pacemaker while processing.
    pub heartbeat: Option<DateTime<Utc>>,
}

impl Message {
    /// Claimed and not yet completed.
    pub fn is_in_flight(&self) -> bool {
        self.read && !self.actioned
    }

    /// Last proof that someone is still working on this message.
    pub fn last_seen(&self) -> Option<DateTime<Utc>> {
        self.heartbeat.or(self.read_time)
    }
}

/// Newtype for message IDs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(pub i64);

impl std::fmt::Display for MessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i64> for MessageId {
    fn from(uid: i64) -> Self {
        Self(uid)
    }
}

impl From<&Message> for MessageId {
    fn from(message: &Message) -> Self {
        message.uid
    }
}

// ---------------------------------------------------------------------------
// Message type filter
// ---------------------------------------------------------------------------

/// Restricts dequeue and listing to one message type or a set of them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MtypeFilter {
    One(i32),
    AnyOf(Vec<i32>),
}

impl MtypeFilter {
    pub fn matches(&self, mtype: i32) -> bool {
        match self {
            MtypeFilter::One(t) => *t == mtype,
            MtypeFilter::AnyOf(types) => types.contains(&mtype),
        }
    }

    /// All accepted values, for `= ANY($n)` style binds.
    pub fn values(&self) -> Vec<i32> {
        match self {
            MtypeFilter::One(t) => vec![*t],
            MtypeFilter::AnyOf(types) => types.clone(),
        }
    }
}

impl From<i32> for MtypeFilter {
    fn from(mtype: i32) -> Self {
        MtypeFilter::One(mtype)
    }
}

impl From<Vec<i32>> for MtypeFilter {
    fn from(types: Vec<i32>) -> Self {
        MtypeFilter::AnyOf(types)
    }
}

impl From<&[i32]> for MtypeFilter {
    fn from(types: &[i32]) -> Self {
        MtypeFilter::AnyOf(types.to_vec())
    }
}

// ---------------------------------------------------------------------------
// Insert
// ---------------------------------------------------------------------------

/// The caller-provided part of a message. Everything else is set by the store
/// on insert: `read = false`, `actioned = false`, `retry = 0`, no error.
#[derive(Debug, Clone)]
pub struct NewMessage {
    pub namespace: String,
    pub mtype: i32,
    pub replying_to: Option<MessageId>,
    pub message: serde_json::Value,
}

impl NewMessage {
    pub fn new(namespace: impl Into<String>, message: serde_json::Value) -> Self {
        Self {
            namespace: namespace.into(),
            mtype: 0,
            replying_to: None,
            message,
        }
    }

    pub fn mtype(mut self, mtype: i32) -> Self {
        self.mtype = mtype;
        self
    }

    pub fn replying_to(mut self, uid: MessageId) -> Self {
        self.replying_to = Some(uid);
        self
    }

    /// Materialize the stored document with the defaults of a fresh message.
    pub fn into_message(self, uid: MessageId, time: DateTime<Utc>) -> Message {
        Message {
            uid,
            time,
            mtype: self.mtype,
            read: false,
            read_time: None,
            actioned: false,
            actioned_time: None,
            replying_to: self.replying_to,
            message: self.message,
            retry: 0,
            error: None,
            namespace: self.namespace,
            heartbeat: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mtype_filter_matches_single_and_set() {
        assert!(MtypeFilter::from(2).matches(2));
        assert!(!MtypeFilter::from(2).matches(0));

        let set = MtypeFilter::from(vec![1, 3]);
        assert!(set.matches(3));
        assert!(!set.matches(2));
        assert_eq!(set.values(), vec![1, 3]);
    }

    #[test]
    fn new_message_starts_claimable() {
        let msg = NewMessage::new("ns", serde_json::json!({"k": 1}))
            .mtype(4)
            .into_message(MessageId(7), Utc::now());

        assert!(!msg.read);
        assert!(!msg.actioned);
        assert_eq!(msg.retry, 0);
        assert!(msg.error.is_none());
        assert!(msg.last_seen().is_none());
        assert_eq!(msg.mtype, 4);
    }
}
