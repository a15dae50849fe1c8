//! In-process store.
//!
//! One mutex guards the whole state, which makes every primitive trivially
//! atomic. Useful for tests and single-process tools; it cannot coordinate
//! workers across processes.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;

use super::{AgentFilter, AgentUpdate, MessageFilter, MessageUpdate, Store};
use crate::error::{Error, Result};
use crate::model::{Agent, AgentId, Message, MessageId, NewAgent, NewMessage};

#[derive(Default)]
struct State {
    /// (namespace, queue)
    queues: BTreeSet<(String, String)>,
    /// queue name → messages in insertion order
    messages: BTreeMap<String, Vec<Message>>,
    agents: Vec<Agent>,
    logs: Vec<LogLine>,
    next_message: i64,
    next_agent: i64,
}

struct LogLine {
    agent: AgentId,
    ltype: i32,
    line: String,
}

#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<State>,
    latency: Option<Duration>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delay every operation by `latency` before it takes effect, simulating a
    /// store round-trip so that concurrent callers interleave.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    async fn round_trip(&self) {
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
    }

    fn state(&self) -> MutexGuard<'_, State> {
        // State is only mutated by complete assignments, so a poisoned lock
        // still holds consistent data.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

fn sorted(mut messages: Vec<Message>) -> Vec<Message> {
    messages.sort_by_key(|m| (m.time, m.uid));
    messages
}

#[async_trait]
impl Store for MemoryStore {
    async fn create_queue(&self, namespace: &str, queue: &str) -> Result<()> {
        self.round_trip().await;
        self.state()
            .queues
            .insert((namespace.to_string(), queue.to_string()));
        Ok(())
    }

    async fn namespaces(&self) -> Result<Vec<String>> {
        self.round_trip().await;
        let state = self.state();
        let names: BTreeSet<_> = state.queues.iter().map(|(ns, _)| ns.clone()).collect();
        Ok(names.into_iter().collect())
    }

    async fn queues(&self, namespace: &str) -> Result<Vec<String>> {
        self.round_trip().await;
        Ok(self
            .state()
            .queues
            .iter()
            .filter(|(ns, _)| ns == namespace)
            .map(|(_, q)| q.clone())
            .collect())
    }

    async fn insert_message(&self, queue: &str, message: NewMessage) -> Result<MessageId> {
        self.round_trip().await;
        let mut state = self.state();
        state.next_message += 1;
        let uid = MessageId(state.next_message);
        let msg = message.into_message(uid, Utc::now());
        state.messages.entry(queue.to_string()).or_default().push(msg);
        Ok(uid)
    }

    async fn find_messages(
        &self,
        queue: &str,
        filter: &MessageFilter,
        limit: Option<usize>,
    ) -> Result<Vec<Message>> {
        self.round_trip().await;
        let state = self.state();
        let found: Vec<Message> = state
            .messages
            .get(queue)
            .map(|msgs| msgs.iter().filter(|m| filter.matches(m)).cloned().collect())
            .unwrap_or_default();
        let mut found = sorted(found);
        if let Some(limit) = limit {
            found.truncate(limit);
        }
        Ok(found)
    }

    async fn count_messages(&self, queue: &str, filter: &MessageFilter) -> Result<u64> {
        self.round_trip().await;
        let state = self.state();
        Ok(state
            .messages
            .get(queue)
            .map(|msgs| msgs.iter().filter(|m| filter.matches(m)).count() as u64)
            .unwrap_or(0))
    }

    async fn count_by_namespace(
        &self,
        queue: &str,
        filter: &MessageFilter,
    ) -> Result<BTreeMap<String, u64>> {
        self.round_trip().await;
        let state = self.state();
        let mut counts = BTreeMap::new();
        for msg in state.messages.get(queue).into_iter().flatten() {
            if filter.matches(msg) {
                *counts.entry(msg.namespace.clone()).or_insert(0) += 1;
            }
        }
        Ok(counts)
    }

    async fn find_one_and_update(
        &self,
        queue: &str,
        filter: &MessageFilter,
        update: &MessageUpdate,
    ) -> Result<Option<Message>> {
        self.round_trip().await;
        let mut state = self.state();
        let Some(msgs) = state.messages.get_mut(queue) else {
            return Ok(None);
        };
        let oldest = msgs
            .iter_mut()
            .filter(|m| filter.matches(m))
            .min_by_key(|m| (m.time, m.uid));
        Ok(oldest.map(|msg| {
            update.apply(msg);
            msg.clone()
        }))
    }

    async fn update_many(
        &self,
        queue: &str,
        filter: &MessageFilter,
        update: &MessageUpdate,
    ) -> Result<Vec<Message>> {
        self.round_trip().await;
        let mut state = self.state();
        let Some(msgs) = state.messages.get_mut(queue) else {
            return Ok(Vec::new());
        };
        let mut updated = Vec::new();
        for msg in msgs.iter_mut().filter(|m| filter.matches(m)) {
            update.apply(msg);
            updated.push(msg.clone());
        }
        Ok(sorted(updated))
    }

    async fn delete_messages(&self, queue: &str, filter: &MessageFilter) -> Result<u64> {
        self.round_trip().await;
        let mut state = self.state();
        let Some(msgs) = state.messages.get_mut(queue) else {
            return Ok(0);
        };
        let before = msgs.len();
        msgs.retain(|m| !filter.matches(m));
        Ok((before - msgs.len()) as u64)
    }

    async fn insert_agent(&self, agent: NewAgent) -> Result<AgentId> {
        self.round_trip().await;
        let mut state = self.state();
        state.next_agent += 1;
        let uid = AgentId(state.next_agent);
        state.agents.push(agent.into_agent(uid, Utc::now()));
        Ok(uid)
    }

    async fn update_agent(&self, uid: AgentId, update: &AgentUpdate) -> Result<()> {
        self.round_trip().await;
        let mut state = self.state();
        let agent = state
            .agents
            .iter_mut()
            .find(|a| a.uid == uid)
            .ok_or_else(|| Error::NotFound(format!("agent {uid}")))?;
        update.apply(agent);
        Ok(())
    }

    async fn find_agents(&self, filter: &AgentFilter) -> Result<Vec<Agent>> {
        self.round_trip().await;
        Ok(self
            .state()
            .agents
            .iter()
            .filter(|a| filter.matches(a))
            .cloned()
            .collect())
    }

    async fn count_agents_by_namespace(
        &self,
        filter: &AgentFilter,
    ) -> Result<BTreeMap<String, u64>> {
        self.round_trip().await;
        let state = self.state();
        let mut counts = BTreeMap::new();
        for agent in state.agents.iter().filter(|a| filter.matches(a)) {
            if let Some(ns) = &agent.namespace {
                *counts.entry(ns.clone()).or_insert(0) += 1;
            }
        }
        Ok(counts)
    }

    async fn update_agents(
        &self,
        filter: &AgentFilter,
        update: &AgentUpdate,
    ) -> Result<Vec<Agent>> {
        self.round_trip().await;
        let mut state = self.state();
        let mut updated = Vec::new();
        for agent in state.agents.iter_mut().filter(|a| filter.matches(a)) {
            update.apply(agent);
            updated.push(agent.clone());
        }
        Ok(updated)
    }

    async fn insert_log(&self, agent: AgentId, ltype: i32, line: &str) -> Result<()> {
        self.round_trip().await;
        self.state().logs.push(LogLine {
            agent,
            ltype,
            line: line.to_string(),
        });
        Ok(())
    }

    async fn log(&self, agent: AgentId, ltype: i32) -> Result<String> {
        self.round_trip().await;
        Ok(self
            .state()
            .logs
            .iter()
            .filter(|l| l.agent == agent && l.ltype == ltype)
            .map(|l| l.line.as_str())
            .collect())
    }

    async fn log_types(&self, agent: AgentId) -> Result<Vec<i32>> {
        self.round_trip().await;
        let types: BTreeSet<i32> = self
            .state()
            .logs
            .iter()
            .filter(|l| l.agent == agent)
            .map(|l| l.ltype)
            .collect();
        Ok(types.into_iter().collect())
    }

    async fn drop_namespace(&self, namespace: &str) -> Result<()> {
        self.round_trip().await;
        let mut state = self.state();
        state.queues.retain(|(ns, _)| ns != namespace);
        for msgs in state.messages.values_mut() {
            msgs.retain(|m| m.namespace != namespace);
        }
        let dropped: BTreeSet<AgentId> = state
            .agents
            .iter()
            .filter(|a| a.namespace.as_deref() == Some(namespace))
            .map(|a| a.uid)
            .collect();
        state.agents.retain(|a| !dropped.contains(&a.uid));
        state.logs.retain(|l| !dropped.contains(&l.agent));
        Ok(())
    }
}
