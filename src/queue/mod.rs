//! Worker side of the queue: the client protocol and its heartbeat.

pub mod capture;
pub mod client;
pub mod pacemaker;

pub use client::QueueClient;
pub use pacemaker::{HeldMessage, Pacemaker, PacemakerState};

use crate::error::{Error, Result};

/// Reserved for the agent collection.
pub const SYSTEM_QUEUE: &str = "system";

const MAX_QUEUE_NAME: usize = 64;

/// Check a queue name before anything is written under it.
pub fn validate_queue_name(name: &str) -> Result<()> {
    let reason = if name.is_empty() {
        "must not be empty"
    } else if name.len() > MAX_QUEUE_NAME {
        "longer than 64 bytes"
    } else if name == SYSTEM_QUEUE {
        "reserved"
    } else {
        return Ok(());
    };
    Err(Error::InvalidQueue {
        name: name.to_string(),
        reason,
    })
}
