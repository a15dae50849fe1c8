//! Message collection SQL.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use sqlx::{PgPool, Postgres, QueryBuilder};

use crate::error::{Error, Result};
use crate::model::{Message, MessageId, NewMessage};
use crate::store::{MessageFilter, MessageUpdate};

const COLUMNS: &str = "uid, time, mtype, read, read_time, actioned, actioned_time, \
                       replying_to, message, retry, error, namespace, heartbeat";

/// Register a queue (idempotent).
pub async fn create_queue(pool: &PgPool, namespace: &str, queue: &str) -> Result<()> {
    sqlx::query("INSERT INTO queues (namespace, name) VALUES ($1, $2) ON CONFLICT DO NOTHING")
        .bind(namespace)
        .bind(queue)
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn namespaces(pool: &PgPool) -> Result<Vec<String>> {
    let rows: Vec<(String,)> =
        sqlx::query_as("SELECT DISTINCT namespace FROM queues ORDER BY namespace")
            .fetch_all(pool)
            .await?;
    Ok(rows.into_iter().map(|(ns,)| ns).collect())
}

pub async fn queues(pool: &PgPool, namespace: &str) -> Result<Vec<String>> {
    let rows: Vec<(String,)> =
        sqlx::query_as("SELECT name FROM queues WHERE namespace = $1 ORDER BY name")
            .bind(namespace)
            .fetch_all(pool)
            .await?;
    Ok(rows.into_iter().map(|(name,)| name).collect())
}

pub async fn insert(pool: &PgPool, queue: &str, new: NewMessage) -> Result<MessageId> {
    let row: (i64,) = sqlx::query_as(
        "INSERT INTO messages (queue, namespace, time, mtype, replying_to, message)
         VALUES ($1, $2, $3, $4, $5, $6)
         RETURNING uid",
    )
    .bind(queue)
    .bind(&new.namespace)
    .bind(Utc::now())
    .bind(new.mtype)
    .bind(new.replying_to.map(|uid| uid.0))
    .bind(&new.message)
    .fetch_one(pool)
    .await?;
    Ok(MessageId(row.0))
}

pub async fn find(
    pool: &PgPool,
    queue: &str,
    filter: &MessageFilter,
    limit: Option<usize>,
) -> Result<Vec<Message>> {
    let mut qb = QueryBuilder::<Postgres>::new(format!("SELECT {COLUMNS} FROM messages"));
    push_filter(&mut qb, queue, filter);
    qb.push(" ORDER BY time, uid");
    if let Some(limit) = limit {
        qb.push(" LIMIT ").push_bind(limit as i64);
    }
    let rows: Vec<MessageRow> = qb.build_query_as().fetch_all(pool).await?;
    Ok(rows.into_iter().map(MessageRow::into_message).collect())
}

pub async fn count(pool: &PgPool, queue: &str, filter: &MessageFilter) -> Result<u64> {
    let mut qb = QueryBuilder::<Postgres>::new("SELECT COUNT(*) FROM messages");
    push_filter(&mut qb, queue, filter);
    let (n,): (i64,) = qb.build_query_as().fetch_one(pool).await?;
    Ok(n as u64)
}

pub async fn count_by_namespace(
    pool: &PgPool,
    queue: &str,
    filter: &MessageFilter,
) -> Result<BTreeMap<String, u64>> {
    let mut qb = QueryBuilder::<Postgres>::new("SELECT namespace, COUNT(*) FROM messages");
    push_filter(&mut qb, queue, filter);
    qb.push(" GROUP BY namespace");
    let rows: Vec<(String, i64)> = qb.build_query_as().fetch_all(pool).await?;
    Ok(rows.into_iter().map(|(ns, n)| (ns, n as u64)).collect())
}

/// Update of the oldest match.
///
/// Open filters (a claim) use `FOR UPDATE SKIP LOCKED`, so concurrent callers
/// pass over a row another transaction is already taking instead of waiting
/// on it and then seeing it no longer match. A filter naming uids targets
/// known rows: it waits for their locks and re-checks, since skipping would
/// report a message as missing while a heartbeat or sweep touches it.
pub async fn find_one_and_update(
    pool: &PgPool,
    queue: &str,
    filter: &MessageFilter,
    update: &MessageUpdate,
) -> Result<Option<Message>> {
    let mut qb = QueryBuilder::<Postgres>::new("UPDATE messages SET ");
    push_update(&mut qb, update)?;
    qb.push(" WHERE uid = (SELECT uid FROM messages");
    push_filter(&mut qb, queue, filter);
    qb.push(" ORDER BY time, uid LIMIT 1 ");
    qb.push(lock_clause(filter));
    qb.push(")");
    qb.push(format!(" RETURNING {COLUMNS}"));

    let row: Option<MessageRow> = qb.build_query_as().fetch_optional(pool).await?;
    Ok(row.map(MessageRow::into_message))
}

pub async fn update_many(
    pool: &PgPool,
    queue: &str,
    filter: &MessageFilter,
    update: &MessageUpdate,
) -> Result<Vec<Message>> {
    let mut qb = QueryBuilder::<Postgres>::new("UPDATE messages SET ");
    push_update(&mut qb, update)?;
    push_filter(&mut qb, queue, filter);
    qb.push(format!(" RETURNING {COLUMNS}"));

    let rows: Vec<MessageRow> = qb.build_query_as().fetch_all(pool).await?;
    let mut messages: Vec<Message> = rows.into_iter().map(MessageRow::into_message).collect();
    messages.sort_by_key(|m| (m.time, m.uid));
    Ok(messages)
}

pub async fn delete(pool: &PgPool, queue: &str, filter: &MessageFilter) -> Result<u64> {
    let mut qb = QueryBuilder::<Postgres>::new("DELETE FROM messages");
    push_filter(&mut qb, queue, filter);
    Ok(qb.build().execute(pool).await?.rows_affected())
}

fn lock_clause(filter: &MessageFilter) -> &'static str {
    if filter.uids.is_some() {
        "FOR UPDATE"
    } else {
        "FOR UPDATE SKIP LOCKED"
    }
}

/// Append `WHERE ...` for `filter`. Mirrors [`MessageFilter::matches`].
fn push_filter(qb: &mut QueryBuilder<'_, Postgres>, queue: &str, filter: &MessageFilter) {
    qb.push(" WHERE queue = ").push_bind(queue.to_string());

    if let Some(uids) = &filter.uids {
        let uids: Vec<i64> = uids.iter().map(|uid| uid.0).collect();
        qb.push(" AND uid = ANY(").push_bind(uids).push(")");
    }
    if let Some(namespace) = &filter.namespace {
        qb.push(" AND namespace = ").push_bind(namespace.clone());
    }
    if let Some(mtype) = &filter.mtype {
        qb.push(" AND mtype = ANY(").push_bind(mtype.values()).push(")");
    }
    if let Some(read) = filter.read {
        qb.push(" AND read = ").push_bind(read);
    }
    if let Some(actioned) = filter.actioned {
        qb.push(" AND actioned = ").push_bind(actioned);
    }
    match filter.has_error {
        Some(true) => {
            qb.push(" AND error IS NOT NULL");
        }
        Some(false) => {
            qb.push(" AND error IS NULL");
        }
        None => {}
    }
    if let Some(max_retry) = filter.retry_below {
        qb.push(" AND retry < ").push_bind(max_retry);
    }
    if let Some(limit) = filter.retry_at_least {
        qb.push(" AND retry >= ").push_bind(limit);
    }
    if let Some(cutoff) = filter.stale_before {
        qb.push(" AND COALESCE(heartbeat, read_time) < ").push_bind(cutoff);
    }
    if let Some(uid) = filter.replying_to {
        qb.push(" AND replying_to = ").push_bind(uid.0);
    }
}

/// Append the `SET` list for `update`.
fn push_update(qb: &mut QueryBuilder<'_, Postgres>, update: &MessageUpdate) -> Result<()> {
    if update.is_empty() {
        return Err(Error::InvalidState("empty message update".to_string()));
    }

    let mut set = qb.separated(", ");
    if let Some(read) = update.read {
        set.push("read = ").push_bind_unseparated(read);
    }
    if let Some(read_time) = update.read_time {
        set.push("read_time = ").push_bind_unseparated(read_time);
    }
    if let Some(actioned) = update.actioned {
        set.push("actioned = ").push_bind_unseparated(actioned);
    }
    if let Some(actioned_time) = update.actioned_time {
        set.push("actioned_time = ").push_bind_unseparated(actioned_time);
    }
    if let Some(error) = &update.error {
        set.push("error = ").push_bind_unseparated(error.clone());
    }
    if let Some(heartbeat) = update.heartbeat {
        set.push("heartbeat = ").push_bind_unseparated(heartbeat);
    }
    if update.increment_retry {
        set.push("retry = retry + 1");
    }
    Ok(())
}

/// Internal row type for sqlx::FromRow.
#[derive(sqlx::FromRow)]
struct MessageRow {
    uid: i64,
    time: DateTime<Utc>,
    mtype: i32,
    read: bool,
    read_time: Option<DateTime<Utc>>,
    actioned: bool,
    actioned_time: Option<DateTime<Utc>>,
    replying_to: Option<i64>,
    message: serde_json::Value,
    retry: i32,
    error: Option<String>,
    namespace: String,
    heartbeat: Option<DateTime<Utc>>,
}

impl MessageRow {
    fn into_message(self) -> Message {
        Message {
            uid: MessageId(self.uid),
            time: self.time,
            mtype: self.mtype,
            read: self.read,
            read_time: self.read_time,
            actioned: self.actioned,
            actioned_time: self.actioned_time,
            replying_to: self.replying_to.map(MessageId),
            message: self.message,
            retry: self.retry,
            error: self.error,
            namespace: self.namespace,
            heartbeat: self.heartbeat,
        }
    }
}
