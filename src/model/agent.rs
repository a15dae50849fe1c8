//! Agent records: one per worker session.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::MessageId;

/// Liveness record of one worker session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Agent {
    pub uid: AgentId,

    /// When the session registered.
    pub time: DateTime<Utc>,

    /// Display name. Names are not unique.
    pub agent: String,

    /// Last proof of life.
    pub heartbeat: DateTime<Utc>,

    /// True from registration until explicit unregistration or retirement
    /// by a monitor sweep.
    pub alive: bool,

    /// Message currently held by the session, if any.
    pub message: Option<MessageId>,

    pub namespace: Option<String>,

    /// Queue the held message belongs to.
    pub queue: Option<String>,
}

/// Newtype for agent IDs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AgentId(pub i64);

impl std::fmt::Display for AgentId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&Agent> for AgentId {
    fn from(agent: &Agent) -> Self {
        agent.uid
    }
}

impl From<i64> for AgentId {
    fn from(uid: i64) -> Self {
        Self(uid)
    }
}

/// Registration data for a new agent.
#[derive(Debug, Clone)]
pub struct NewAgent {
    pub agent: String,
    pub namespace: Option<String>,
}

impl NewAgent {
    pub fn into_agent(self, uid: AgentId, now: DateTime<Utc>) -> Agent {
        Agent {
            uid,
            time: now,
            agent: self.agent,
            heartbeat: now,
            alive: true,
            message: None,
            namespace: self.namespace,
            queue: None,
        }
    }
}
