//! # msgq
//!
//! Work queues over a shared document store, for distributed workers.
//!
//! Provides exclusive message claiming, heartbeat-based liveness for worker
//! sessions, monitor sweeps that requeue lost and failed work, best-effort
//! replies, and replay of recorded queue calls with termination deferred.
//! Postgres (sqlx) is the production store; an in-memory store backs tests.

pub mod config;
pub mod db;
pub mod error;
pub mod model;
pub mod monitor;
pub mod queue;
pub mod store;
pub mod telemetry;
pub mod transaction;
