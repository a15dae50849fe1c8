//! Agent ("system") collection and agent log SQL.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use sqlx::{PgPool, Postgres, QueryBuilder};

use crate::error::{Error, Result};
use crate::model::{Agent, AgentId, MessageId, NewAgent};
use crate::store::{AgentFilter, AgentUpdate};

const COLUMNS: &str = "uid, time, agent, heartbeat, alive, message, namespace, queue";

pub async fn insert(pool: &PgPool, new: NewAgent) -> Result<AgentId> {
    let row: (i64,) = sqlx::query_as(
        "INSERT INTO agents (time, agent, heartbeat, alive, namespace)
         VALUES ($1, $2, $1, true, $3)
         RETURNING uid",
    )
    .bind(Utc::now())
    .bind(&new.agent)
    .bind(&new.namespace)
    .fetch_one(pool)
    .await?;
    Ok(AgentId(row.0))
}

pub async fn update_one(pool: &PgPool, uid: AgentId, update: &AgentUpdate) -> Result<()> {
    let mut qb = QueryBuilder::<Postgres>::new("UPDATE agents SET ");
    push_update(&mut qb, update)?;
    qb.push(" WHERE uid = ").push_bind(uid.0);

    let rows_affected = qb.build().execute(pool).await?.rows_affected();
    if rows_affected == 0 {
        return Err(Error::NotFound(format!("agent {uid}")));
    }
    Ok(())
}

pub async fn find(pool: &PgPool, filter: &AgentFilter) -> Result<Vec<Agent>> {
    let mut qb = QueryBuilder::<Postgres>::new(format!("SELECT {COLUMNS} FROM agents"));
    push_filter(&mut qb, filter);
    qb.push(" ORDER BY uid");
    let rows: Vec<AgentRow> = qb.build_query_as().fetch_all(pool).await?;
    Ok(rows.into_iter().map(AgentRow::into_agent).collect())
}

pub async fn count_by_namespace(
    pool: &PgPool,
    filter: &AgentFilter,
) -> Result<BTreeMap<String, u64>> {
    let mut qb = QueryBuilder::<Postgres>::new("SELECT namespace, COUNT(*) FROM agents");
    push_filter(&mut qb, filter);
    qb.push(" AND namespace IS NOT NULL GROUP BY namespace");
    let rows: Vec<(String, i64)> = qb.build_query_as().fetch_all(pool).await?;
    Ok(rows.into_iter().map(|(ns, n)| (ns, n as u64)).collect())
}

pub async fn update_many(
    pool: &PgPool,
    filter: &AgentFilter,
    update: &AgentUpdate,
) -> Result<Vec<Agent>> {
    let mut qb = QueryBuilder::<Postgres>::new("UPDATE agents SET ");
    push_update(&mut qb, update)?;
    push_filter(&mut qb, filter);
    qb.push(format!(" RETURNING {COLUMNS}"));
    let rows: Vec<AgentRow> = qb.build_query_as().fetch_all(pool).await?;
    let mut agents: Vec<Agent> = rows.into_iter().map(AgentRow::into_agent).collect();
    agents.sort_by_key(|a| a.uid);
    Ok(agents)
}

pub async fn insert_log(pool: &PgPool, agent: AgentId, ltype: i32, line: &str) -> Result<()> {
    sqlx::query("INSERT INTO agent_logs (agent, ltype, line) VALUES ($1, $2, $3)")
        .bind(agent.0)
        .bind(ltype)
        .bind(line)
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn log(pool: &PgPool, agent: AgentId, ltype: i32) -> Result<String> {
    let row: (String,) = sqlx::query_as(
        "SELECT COALESCE(string_agg(line, '' ORDER BY uid), '')
         FROM agent_logs WHERE agent = $1 AND ltype = $2",
    )
    .bind(agent.0)
    .bind(ltype)
    .fetch_one(pool)
    .await?;
    Ok(row.0)
}

pub async fn log_types(pool: &PgPool, agent: AgentId) -> Result<Vec<i32>> {
    let rows: Vec<(i32,)> =
        sqlx::query_as("SELECT DISTINCT ltype FROM agent_logs WHERE agent = $1 ORDER BY ltype")
            .bind(agent.0)
            .fetch_all(pool)
            .await?;
    Ok(rows.into_iter().map(|(t,)| t).collect())
}

/// Mirrors [`AgentFilter::matches`].
fn push_filter(qb: &mut QueryBuilder<'_, Postgres>, filter: &AgentFilter) {
    qb.push(" WHERE true");
    if let Some(uid) = filter.uid {
        qb.push(" AND uid = ").push_bind(uid.0);
    }
    if let Some(namespace) = &filter.namespace {
        qb.push(" AND namespace = ").push_bind(namespace.clone());
    }
    if filter.unassigned {
        qb.push(" AND namespace IS NULL");
    }
    if let Some(alive) = filter.alive {
        qb.push(" AND alive = ").push_bind(alive);
    }
    if let Some(cutoff) = filter.heartbeat_before {
        qb.push(" AND heartbeat < ").push_bind(cutoff);
    }
}

fn push_update(qb: &mut QueryBuilder<'_, Postgres>, update: &AgentUpdate) -> Result<()> {
    if *update == AgentUpdate::default() {
        return Err(Error::InvalidState("empty agent update".to_string()));
    }

    let mut set = qb.separated(", ");
    if let Some(heartbeat) = update.heartbeat {
        set.push("heartbeat = ").push_bind_unseparated(heartbeat);
    }
    if let Some(alive) = update.alive {
        set.push("alive = ").push_bind_unseparated(alive);
    }
    if let Some(message) = update.message {
        set.push("message = ")
            .push_bind_unseparated(message.map(|uid| uid.0));
    }
    if let Some(queue) = &update.queue {
        set.push("queue = ").push_bind_unseparated(queue.clone());
    }
    if let Some(namespace) = &update.namespace {
        set.push("namespace = ").push_bind_unseparated(namespace.clone());
    }
    Ok(())
}

/// Internal row type for sqlx::FromRow.
#[derive(sqlx::FromRow)]
struct AgentRow {
    uid: i64,
    time: DateTime<Utc>,
    agent: String,
    heartbeat: DateTime<Utc>,
    alive: bool,
    message: Option<i64>,
    namespace: Option<String>,
    queue: Option<String>,
}

impl AgentRow {
    fn into_agent(self) -> Agent {
        Agent {
            uid: AgentId(self.uid),
            time: self.time,
            agent: self.agent,
            heartbeat: self.heartbeat,
            alive: self.alive,
            message: self.message.map(MessageId),
            namespace: self.namespace,
            queue: self.queue,
        }
    }
}
