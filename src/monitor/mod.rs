//! Queue monitor: inspection and corrective sweeps.
//!
//! A monitor needs no session. Every sweep computes its staleness cutoff from
//! the wall clock at the moment it is called, and every corrective write goes
//! through [`Store::update_many`], which re-checks the filter per document.
//! Two supervisors sweeping the same queue therefore never requeue a message
//! twice.

pub mod archive;

pub use archive::{Archiver, DirArchive};

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use opentelemetry::KeyValue;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::model::{Agent, AgentId, Message, MessageId, MtypeFilter};
use crate::store::{AgentFilter, AgentUpdate, MessageFilter, MessageUpdate, Store};
use crate::telemetry::metrics;

/// Error stamped on lost messages that used up their retries, so that they
/// surface in [`QueueMonitor::failed_messages`].
pub const RETRY_LIMIT_ERROR: &str = "lost: retry limit reached";

/// Per-namespace counts, namespaces without a match left out.
pub type NamespaceCounts = BTreeMap<String, u64>;

/// Read-mostly view over a store, plus requeue and reset.
#[derive(Clone)]
pub struct QueueMonitor {
    store: Arc<dyn Store>,
    lock: Arc<Mutex<()>>,
}

impl QueueMonitor {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self {
            store,
            lock: Arc::new(Mutex::new(())),
        }
    }

    /// Share an exclusion guard with other writers. [`QueueMonitor::archive`]
    /// holds it for the whole export.
    pub fn with_lock(mut self, lock: Arc<Mutex<()>>) -> Self {
        self.lock = lock;
        self
    }

    pub fn lock(&self) -> Arc<Mutex<()>> {
        Arc::clone(&self.lock)
    }

    // -----------------------------------------------------------------------
    // Listing
    // -----------------------------------------------------------------------

    pub async fn namespaces(&self) -> Result<Vec<String>> {
        self.store.namespaces().await
    }

    pub async fn queues(&self, namespace: &str) -> Result<Vec<String>> {
        self.store.queues(namespace).await
    }

    /// Every message of a queue, oldest first.
    pub async fn messages(
        &self,
        queue: &str,
        namespace: Option<&str>,
        mtype: Option<MtypeFilter>,
    ) -> Result<Vec<Message>> {
        let filter = MessageFilter::new().namespace(namespace).mtype(mtype);
        self.store.find_messages(queue, &filter, None).await
    }

    /// Messages nobody has claimed yet.
    pub async fn unread_messages(
        &self,
        queue: &str,
        namespace: Option<&str>,
        mtype: Option<MtypeFilter>,
    ) -> Result<Vec<Message>> {
        let filter = unread(namespace, mtype);
        self.store.find_messages(queue, &filter, None).await
    }

    /// Claimed but not completed.
    pub async fn unactioned_messages(
        &self,
        queue: &str,
        namespace: Option<&str>,
        mtype: Option<MtypeFilter>,
    ) -> Result<Vec<Message>> {
        let filter = in_flight(namespace, mtype);
        self.store.find_messages(queue, &filter, None).await
    }

    /// Not completed, claimed or not.
    pub async fn unactioned(&self, queue: &str, namespace: Option<&str>) -> Result<Vec<Message>> {
        let filter = MessageFilter::new().namespace(namespace).actioned(false);
        self.store.find_messages(queue, &filter, None).await
    }

    /// The message that answers `uid`, if one was enqueued.
    pub async fn reply_to(&self, queue: &str, uid: MessageId) -> Result<Option<Message>> {
        let filter = MessageFilter::new().replying_to(uid);
        let mut found = self.store.find_messages(queue, &filter, Some(1)).await?;
        Ok(found.pop())
    }

    // -----------------------------------------------------------------------
    // Counting
    // -----------------------------------------------------------------------

    pub async fn message_count(
        &self,
        queue: &str,
        namespace: Option<&str>,
        mtype: Option<MtypeFilter>,
    ) -> Result<u64> {
        let filter = MessageFilter::new().namespace(namespace).mtype(mtype);
        self.store.count_messages(queue, &filter).await
    }

    pub async fn unread_count(
        &self,
        queue: &str,
        namespace: Option<&str>,
        mtype: Option<MtypeFilter>,
    ) -> Result<u64> {
        self.store
            .count_messages(queue, &unread(namespace, mtype))
            .await
    }

    pub async fn unactioned_count(
        &self,
        queue: &str,
        namespace: Option<&str>,
        mtype: Option<MtypeFilter>,
    ) -> Result<u64> {
        self.store
            .count_messages(queue, &in_flight(namespace, mtype))
            .await
    }

    pub async fn read_count(
        &self,
        queue: &str,
        namespace: Option<&str>,
        mtype: Option<MtypeFilter>,
    ) -> Result<u64> {
        self.store
            .count_messages(queue, &read(namespace, mtype))
            .await
    }

    pub async fn actioned_count(
        &self,
        queue: &str,
        namespace: Option<&str>,
        mtype: Option<MtypeFilter>,
    ) -> Result<u64> {
        self.store
            .count_messages(queue, &actioned(namespace, mtype))
            .await
    }

    // -----------------------------------------------------------------------
    // Across namespaces
    // -----------------------------------------------------------------------

    /// Live agents per namespace.
    pub async fn agent_counts(&self) -> Result<NamespaceCounts> {
        self.store
            .count_agents_by_namespace(&AgentFilter::new().alive(true))
            .await
    }

    pub async fn unread_counts(
        &self,
        queue: &str,
        mtype: Option<MtypeFilter>,
    ) -> Result<NamespaceCounts> {
        self.store
            .count_by_namespace(queue, &unread(None, mtype))
            .await
    }

    pub async fn unactioned_counts(
        &self,
        queue: &str,
        mtype: Option<MtypeFilter>,
    ) -> Result<NamespaceCounts> {
        self.store
            .count_by_namespace(queue, &in_flight(None, mtype))
            .await
    }

    pub async fn read_counts(
        &self,
        queue: &str,
        mtype: Option<MtypeFilter>,
    ) -> Result<NamespaceCounts> {
        self.store.count_by_namespace(queue, &read(None, mtype)).await
    }

    pub async fn actioned_counts(
        &self,
        queue: &str,
        mtype: Option<MtypeFilter>,
    ) -> Result<NamespaceCounts> {
        self.store
            .count_by_namespace(queue, &actioned(None, mtype))
            .await
    }

    pub async fn lost_counts(
        &self,
        queue: &str,
        mtype: Option<MtypeFilter>,
        timeout: Duration,
    ) -> Result<NamespaceCounts> {
        let filter = lost(None, mtype, cutoff(timeout)?);
        self.store.count_by_namespace(queue, &filter).await
    }

    pub async fn failed_counts(
        &self,
        queue: &str,
        mtype: Option<MtypeFilter>,
    ) -> Result<NamespaceCounts> {
        self.store
            .count_by_namespace(queue, &failed(None, mtype))
            .await
    }

    // -----------------------------------------------------------------------
    // Agents
    // -----------------------------------------------------------------------

    pub async fn agents(&self, namespace: Option<&str>) -> Result<Vec<Agent>> {
        self.store
            .find_agents(&AgentFilter::new().namespace(namespace))
            .await
    }

    /// Agents still marked alive whose heartbeat is older than `timeout`.
    pub async fn dead_agents(
        &self,
        namespace: Option<&str>,
        timeout: Duration,
    ) -> Result<Vec<Agent>> {
        self.store.find_agents(&dead(namespace, cutoff(timeout)?)).await
    }

    /// Mark every agent [`QueueMonitor::dead_agents`] would report as not
    /// alive. Returns the retired agents.
    pub async fn retire_dead_agents(
        &self,
        namespace: Option<&str>,
        timeout: Duration,
    ) -> Result<Vec<Agent>> {
        let retired = self
            .store
            .update_agents(&dead(namespace, cutoff(timeout)?), &AgentUpdate::dead())
            .await?;
        if !retired.is_empty() {
            info!(count = retired.len(), "retired dead agents");
        }
        Ok(retired)
    }

    /// Retire dead agents that never claimed a message. They carry no
    /// namespace, so a namespace-scoped sweep cannot see them.
    pub async fn retire_unassigned_dead_agents(&self, timeout: Duration) -> Result<Vec<Agent>> {
        let filter = dead(None, cutoff(timeout)?).unassigned();
        let retired = self
            .store
            .update_agents(&filter, &AgentUpdate::dead())
            .await?;
        if !retired.is_empty() {
            info!(count = retired.len(), "retired dead agents without a namespace");
        }
        Ok(retired)
    }

    pub async fn log(&self, agent: impl Into<AgentId>, ltype: i32) -> Result<String> {
        self.store.log(agent.into(), ltype).await
    }

    pub async fn log_types(&self, agent: impl Into<AgentId>) -> Result<Vec<i32>> {
        self.store.log_types(agent.into()).await
    }

    // -----------------------------------------------------------------------
    // Sweeps
    // -----------------------------------------------------------------------

    /// Claimed, not completed, and silent for longer than `timeout`.
    ///
    /// Includes messages that already exhausted their retries; those stay
    /// here until an operator deals with them.
    pub async fn lost_messages(
        &self,
        queue: &str,
        namespace: Option<&str>,
        timeout: Duration,
    ) -> Result<Vec<Message>> {
        let filter = lost(namespace, None, cutoff(timeout)?);
        self.store.find_messages(queue, &filter, None).await
    }

    /// Make lost messages with `retry < max_retry` claimable again.
    ///
    /// Lost messages that already reached `max_retry` stay claimed and get
    /// [`RETRY_LIMIT_ERROR`] (unless they carry an error already), which lists
    /// them in [`QueueMonitor::failed_messages`]. Returns the requeued ones.
    pub async fn requeue_lost_messages(
        &self,
        queue: &str,
        namespace: Option<&str>,
        timeout: Duration,
        max_retry: i32,
    ) -> Result<Vec<Message>> {
        let cutoff = cutoff(timeout)?;
        let retryable = lost(namespace, None, cutoff).retry_below(max_retry);
        let requeued = self
            .requeue(queue, &retryable, &MessageUpdate::requeue(), "lost")
            .await?;

        let exhausted = lost(namespace, None, cutoff)
            .retry_at_least(max_retry)
            .has_error(false);
        let stuck = self
            .store
            .update_many(queue, &exhausted, &MessageUpdate::error(RETRY_LIMIT_ERROR))
            .await?;
        if !stuck.is_empty() {
            warn!(queue, count = stuck.len(), max_retry, "lost messages out of retries");
        }
        Ok(requeued)
    }

    /// Claimed messages carrying an error, not completed.
    pub async fn failed_messages(
        &self,
        queue: &str,
        namespace: Option<&str>,
    ) -> Result<Vec<Message>> {
        self.store
            .find_messages(queue, &failed(namespace, None), None)
            .await
    }

    /// Clear the error of failed messages with `retry < max_retry` and make
    /// them claimable again.
    pub async fn requeue_failed_messages(
        &self,
        queue: &str,
        namespace: Option<&str>,
        max_retry: i32,
    ) -> Result<Vec<Message>> {
        let filter = failed(namespace, None).retry_below(max_retry);
        self.requeue(queue, &filter, &MessageUpdate::requeue(), "failed")
            .await
    }

    /// Administrative recovery: every message not yet completed becomes
    /// unread, claimed or not. Retry counts are left alone.
    pub async fn reset_queue(&self, queue: &str, namespace: Option<&str>) -> Result<Vec<Message>> {
        let filter = MessageFilter::new().namespace(namespace).actioned(false);
        self.requeue(queue, &filter, &MessageUpdate::reset(), "reset")
            .await
    }

    /// Delete every message of `queue` in `namespace`.
    pub async fn clear(&self, queue: &str, namespace: &str) -> Result<u64> {
        let filter = MessageFilter::new().namespace(Some(namespace));
        let deleted = self.store.delete_messages(queue, &filter).await?;
        info!(queue, namespace, deleted, "queue cleared");
        Ok(deleted)
    }

    async fn requeue(
        &self,
        queue: &str,
        filter: &MessageFilter,
        update: &MessageUpdate,
        reason: &'static str,
    ) -> Result<Vec<Message>> {
        let requeued = self.store.update_many(queue, filter, update).await?;
        if !requeued.is_empty() {
            info!(queue, reason, count = requeued.len(), "messages requeued");
            metrics::messages_requeued().add(
                requeued.len() as u64,
                &[
                    KeyValue::new("queue", queue.to_string()),
                    KeyValue::new("reason", reason),
                ],
            );
        }
        Ok(requeued)
    }

    // -----------------------------------------------------------------------
    // Archive
    // -----------------------------------------------------------------------

    /// Export a namespace to `archiver`, then optionally drop it.
    ///
    /// The exclusion guard is held from the first read to the drop, so
    /// writers sharing it (see [`QueueMonitor::with_lock`]) cannot change the
    /// namespace mid-export.
    pub async fn archive<A: Archiver>(
        &self,
        namespace: &str,
        archiver: &mut A,
        remove: bool,
    ) -> Result<()> {
        let _guard = self.lock.lock().await;

        let queues = self.store.queues(namespace).await?;
        for queue in &queues {
            let messages = self.messages(queue, Some(namespace), None).await?;
            debug!(queue, count = messages.len(), "archiving queue");
            archiver.write_queue(queue, &messages).await?;
        }

        let agents = self.agents(Some(namespace)).await?;
        archiver.write_agents(&agents).await?;

        for agent in &agents {
            for ltype in self.store.log_types(agent.uid).await? {
                let log = self.store.log(agent.uid, ltype).await?;
                archiver.write_log(agent.uid, ltype, &log).await?;
            }
        }
        archiver.finish().await?;

        if remove {
            self.store.drop_namespace(namespace).await?;
        }
        info!(
            namespace,
            queues = queues.len(),
            agents = agents.len(),
            remove,
            "namespace archived"
        );
        Ok(())
    }
}

fn cutoff(timeout: Duration) -> Result<DateTime<Utc>> {
    let timeout = chrono::Duration::from_std(timeout)
        .map_err(|e| Error::Other(format!("timeout out of range: {e}")))?;
    Ok(Utc::now() - timeout)
}

fn unread(namespace: Option<&str>, mtype: Option<MtypeFilter>) -> MessageFilter {
    MessageFilter::new()
        .namespace(namespace)
        .mtype(mtype)
        .read(false)
}

fn in_flight(namespace: Option<&str>, mtype: Option<MtypeFilter>) -> MessageFilter {
    MessageFilter::new()
        .namespace(namespace)
        .mtype(mtype)
        .read(true)
        .actioned(false)
}

fn read(namespace: Option<&str>, mtype: Option<MtypeFilter>) -> MessageFilter {
    MessageFilter::new()
        .namespace(namespace)
        .mtype(mtype)
        .read(true)
}

fn actioned(namespace: Option<&str>, mtype: Option<MtypeFilter>) -> MessageFilter {
    MessageFilter::new()
        .namespace(namespace)
        .mtype(mtype)
        .actioned(true)
}

fn lost(
    namespace: Option<&str>,
    mtype: Option<MtypeFilter>,
    cutoff: DateTime<Utc>,
) -> MessageFilter {
    in_flight(namespace, mtype).stale_before(cutoff)
}

fn failed(namespace: Option<&str>, mtype: Option<MtypeFilter>) -> MessageFilter {
    in_flight(namespace, mtype).has_error(true)
}

fn dead(namespace: Option<&str>, cutoff: DateTime<Utc>) -> AgentFilter {
    AgentFilter::new()
        .namespace(namespace)
        .alive(true)
        .heartbeat_before(cutoff)
}
