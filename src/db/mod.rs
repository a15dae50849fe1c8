//! Postgres-backed store: connection pool, migrations, health check.
//!
//! Implements [`Store`] with plain SQL through sqlx. Every queue of every
//! namespace shares the `messages` table; claims and requeues are single
//! `UPDATE ... RETURNING` statements so the row lock is the only
//! coordination between workers.

pub mod agents;
pub mod messages;

use std::collections::BTreeMap;

use async_trait::async_trait;
use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;

use crate::error::Result;
use crate::model::{Agent, AgentId, Message, MessageId, NewAgent, NewMessage};
use crate::store::{AgentFilter, AgentUpdate, MessageFilter, MessageUpdate, Store};

/// Database handle. Owns the connection pool.
pub struct Db {
    pool: PgPool,
}

impl Db {
    /// Connect to Postgres and create a connection pool.
    pub async fn connect(url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(url)
            .await?;
        Ok(Self { pool })
    }

    /// Wrap an existing pool.
    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Run all pending migrations.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }

    /// Simple health check: run a SELECT 1.
    pub async fn health_check(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    pub(crate) fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl Store for Db {
    async fn create_queue(&self, namespace: &str, queue: &str) -> Result<()> {
        messages::create_queue(self.pool(), namespace, queue).await
    }

    async fn namespaces(&self) -> Result<Vec<String>> {
        messages::namespaces(self.pool()).await
    }

    async fn queues(&self, namespace: &str) -> Result<Vec<String>> {
        messages::queues(self.pool(), namespace).await
    }

    async fn insert_message(&self, queue: &str, message: NewMessage) -> Result<MessageId> {
        messages::insert(self.pool(), queue, message).await
    }

    async fn find_messages(
        &self,
        queue: &str,
        filter: &MessageFilter,
        limit: Option<usize>,
    ) -> Result<Vec<Message>> {
        messages::find(self.pool(), queue, filter, limit).await
    }

    async fn count_messages(&self, queue: &str, filter: &MessageFilter) -> Result<u64> {
        messages::count(self.pool(), queue, filter).await
    }

    async fn count_by_namespace(
        &self,
        queue: &str,
        filter: &MessageFilter,
    ) -> Result<BTreeMap<String, u64>> {
        messages::count_by_namespace(self.pool(), queue, filter).await
    }

    async fn find_one_and_update(
        &self,
        queue: &str,
        filter: &MessageFilter,
        update: &MessageUpdate,
    ) -> Result<Option<Message>> {
        messages::find_one_and_update(self.pool(), queue, filter, update).await
    }

    async fn update_many(
        &self,
        queue: &str,
        filter: &MessageFilter,
        update: &MessageUpdate,
    ) -> Result<Vec<Message>> {
        messages::update_many(self.pool(), queue, filter, update).await
    }

    async fn delete_messages(&self, queue: &str, filter: &MessageFilter) -> Result<u64> {
        messages::delete(self.pool(), queue, filter).await
    }

    async fn insert_agent(&self, agent: NewAgent) -> Result<AgentId> {
        agents::insert(self.pool(), agent).await
    }

    async fn update_agent(&self, uid: AgentId, update: &AgentUpdate) -> Result<()> {
        agents::update_one(self.pool(), uid, update).await
    }

    async fn find_agents(&self, filter: &AgentFilter) -> Result<Vec<Agent>> {
        agents::find(self.pool(), filter).await
    }

    async fn count_agents_by_namespace(
        &self,
        filter: &AgentFilter,
    ) -> Result<BTreeMap<String, u64>> {
        agents::count_by_namespace(self.pool(), filter).await
    }

    async fn update_agents(
        &self,
        filter: &AgentFilter,
        update: &AgentUpdate,
    ) -> Result<Vec<Agent>> {
        agents::update_many(self.pool(), filter, update).await
    }

    async fn insert_log(&self, agent: AgentId, ltype: i32, line: &str) -> Result<()> {
        agents::insert_log(self.pool(), agent, ltype, line).await
    }

    async fn log(&self, agent: AgentId, ltype: i32) -> Result<String> {
        agents::log(self.pool(), agent, ltype).await
    }

    async fn log_types(&self, agent: AgentId) -> Result<Vec<i32>> {
        agents::log_types(self.pool(), agent).await
    }

    async fn drop_namespace(&self, namespace: &str) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM messages WHERE namespace = $1")
            .bind(namespace)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM queues WHERE namespace = $1")
            .bind(namespace)
            .execute(&mut *tx)
            .await?;
        // agent_logs rows go with their agent (ON DELETE CASCADE)
        sqlx::query("DELETE FROM agents WHERE namespace = $1")
            .bind(namespace)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }
}
