//! Pacemaker: the heartbeat loop of one worker session.
//!
//! Lifecycle is `Created → Running → Stopped`; a stopped pacemaker cannot be
//! restarted. Each tick refreshes the agent's heartbeat and, while the session
//! holds a message, that message's heartbeat, which is what lets a monitor tell
//! slow work apart from stuck work. Tick failures are logged and retried on the
//! next tick; they never reach the owning session.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::Utc;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use super::capture::{CAPTURED_LTYPE, LogSink};
use crate::error::{Error, Result};
use crate::model::{AgentId, Message, MessageId, NewAgent};
use crate::store::{AgentUpdate, MessageFilter, MessageUpdate, Store};
use crate::telemetry::metrics;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacemakerState {
    Created,
    Running,
    Stopped,
}

/// The message a session currently holds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeldMessage {
    pub queue: String,
    pub uid: MessageId,
}

/// State shared between the pacemaker handle and its loop.
#[derive(Clone)]
struct Heart {
    store: Arc<dyn Store>,
    agent: AgentId,
    held: Arc<Mutex<Option<HeldMessage>>>,
}

impl Heart {
    fn held(&self) -> MutexGuard<'_, Option<HeldMessage>> {
        self.held.lock().unwrap_or_else(|e| e.into_inner())
    }

    async fn beat(&self) -> Result<()> {
        let now = Utc::now();
        self.store
            .update_agent(self.agent, &AgentUpdate::heartbeat(now))
            .await?;

        let held = self.held().clone();
        if let Some(held) = held {
            let in_flight = MessageFilter::new().uid(held.uid).read(true).actioned(false);
            self.store
                .update_many(&held.queue, &in_flight, &MessageUpdate::heartbeat(now))
                .await?;
        }
        Ok(())
    }

    async fn flush_logs(&self, capture: &mut Option<LogSink>) {
        let Some(sink) = capture.as_mut() else {
            return;
        };
        for line in sink.drain() {
            // Captured output is best effort; a failed insert drops the line.
            if let Err(e) = self.store.insert_log(self.agent, CAPTURED_LTYPE, &line).await {
                debug!(agent = %self.agent, "dropped captured log line: {e}");
            }
        }
    }
}

/// Heartbeat loop bound to one agent record.
pub struct Pacemaker {
    heart: Heart,
    interval: Duration,
    state: Mutex<PacemakerState>,
    shutdown: Arc<Notify>,
    task: Mutex<Option<JoinHandle<()>>>,
    capture: Mutex<Option<LogSink>>,
}

impl Pacemaker {
    /// Insert the agent record and return a pacemaker in the `Created` state.
    pub async fn register_agent(
        store: Arc<dyn Store>,
        name: &str,
        namespace: Option<&str>,
        interval: Duration,
    ) -> Result<Self> {
        let agent = store
            .insert_agent(NewAgent {
                agent: name.to_string(),
                namespace: namespace.map(str::to_string),
            })
            .await?;
        info!(%agent, name, "agent registered");

        Ok(Self {
            heart: Heart {
                store,
                agent,
                held: Arc::new(Mutex::new(None)),
            },
            interval,
            state: Mutex::new(PacemakerState::Created),
            shutdown: Arc::new(Notify::new()),
            task: Mutex::new(None),
            capture: Mutex::new(None),
        })
    }

    /// Persist lines from `sink` as this agent's log. Takes effect on start.
    pub fn capture_output(&self, sink: LogSink) {
        *lock(&self.capture) = Some(sink);
    }

    pub fn agent_id(&self) -> AgentId {
        self.heart.agent
    }

    pub fn state(&self) -> PacemakerState {
        *lock(&self.state)
    }

    pub fn held(&self) -> Option<HeldMessage> {
        self.heart.held().clone()
    }

    /// Spawn the heartbeat loop. Must be called from within a tokio runtime.
    pub fn start(&self) -> Result<()> {
        let mut state = lock(&self.state);
        if *state != PacemakerState::Created {
            return Err(Error::InvalidState(format!(
                "pacemaker for agent {} cannot start from {:?}",
                self.heart.agent, *state
            )));
        }

        let capture = lock(&self.capture).take();
        let handle = tokio::spawn(run(
            self.heart.clone(),
            self.interval,
            Arc::clone(&self.shutdown),
            capture,
        ));
        *lock(&self.task) = Some(handle);
        *state = PacemakerState::Running;
        Ok(())
    }

    /// One heartbeat: refresh the agent and the held message, if any.
    pub async fn update_heartbeat(&self) -> Result<()> {
        self.heart.beat().await
    }

    /// Bind the message just claimed from `queue` to this session.
    pub async fn register_message(&self, queue: &str, message: &Message) -> Result<()> {
        *self.heart.held() = Some(HeldMessage {
            queue: queue.to_string(),
            uid: message.uid,
        });
        self.heart
            .store
            .update_agent(self.heart.agent, &AgentUpdate::hold(Utc::now(), queue, message))
            .await
    }

    /// Release `uid` if it is the held message. Other uids are ignored.
    pub async fn unregister_message(&self, uid: MessageId) -> Result<()> {
        {
            let mut held = self.heart.held();
            if held.as_ref().is_none_or(|h| h.uid != uid) {
                return Ok(());
            }
            *held = None;
        }
        self.heart
            .store
            .update_agent(self.heart.agent, &AgentUpdate::release(Utc::now()))
            .await
    }

    /// Ask the loop to exit and wait for the current tick to finish.
    ///
    /// Idempotent. A pacemaker that never started goes straight to `Stopped`.
    pub async fn stop(&self) {
        let handle = {
            let mut state = lock(&self.state);
            if *state == PacemakerState::Stopped {
                return;
            }
            *state = PacemakerState::Stopped;
            lock(&self.task).take()
        };

        if let Some(handle) = handle {
            self.shutdown.notify_one();
            if let Err(e) = handle.await {
                warn!(agent = %self.heart.agent, "pacemaker task ended abnormally: {e}");
            }
        }
        debug!(agent = %self.heart.agent, "pacemaker stopped");
    }

    /// Mark the agent as no longer alive. History is kept.
    pub async fn unregister_agent(&self) -> Result<()> {
        self.heart
            .store
            .update_agent(self.heart.agent, &AgentUpdate::dead())
            .await?;
        info!(agent = %self.heart.agent, "agent unregistered");
        Ok(())
    }
}

impl Drop for Pacemaker {
    fn drop(&mut self) {
        // The session went away without stopping: do not leave a detached loop
        // beating for it. The agent stays alive in the store and will be
        // reported by `dead_agents` once its heartbeat goes stale.
        if let Some(handle) = lock(&self.task).take() {
            handle.abort();
        }
    }
}

async fn run(
    heart: Heart,
    interval: Duration,
    shutdown: Arc<Notify>,
    mut capture: Option<LogSink>,
) {
    let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = shutdown.notified() => break,
            _ = ticker.tick() => {
                if let Err(e) = heart.beat().await {
                    warn!(agent = %heart.agent, "heartbeat failed, retrying next tick: {e}");
                    metrics::heartbeat_failures().add(1, &[]);
                }
                heart.flush_logs(&mut capture).await;
            }
        }
    }

    heart.flush_logs(&mut capture).await;
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}
