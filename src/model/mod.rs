//! Core data model.
//!
//! Messages are units of work inside a (namespace, queue) pair. Agents are
//! worker sessions proving liveness. A reply is a conditional enqueue that
//! only exists client-side until the queue client commits it.

pub mod agent;
pub mod message;
pub mod reply;

pub use agent::{Agent, AgentId, NewAgent};
pub use message::{Message, MessageId, MtypeFilter, NewMessage};
pub use reply::Reply;
