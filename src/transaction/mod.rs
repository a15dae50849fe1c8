//! Two-phase commit of queue work: record first, replay under a signal guard.
//!
//! ```no_run
//! # async fn demo(client: msgq::queue::QueueClient) -> msgq::error::Result<()> {
//! use msgq::transaction::{MessageRef, TransactionRecorder};
//!
//! let mut tx = TransactionRecorder::new();
//! tx.pop("work", Some("run-1"))
//!     .mark_actioned("work", MessageRef::LastClaimed);
//! tx.execute(&client).await?;
//! # Ok(())
//! # }
//! ```

pub mod recorder;
pub mod signal;

pub use recorder::{Applied, Command, MessageRef, ReplayOutcome, TransactionRecorder};
pub use signal::{Shutdown, SignalGuard, TerminationSignal, subscribe, terminated};
