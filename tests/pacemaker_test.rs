use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use msgq::error::{Error, Result};
use msgq::model::{Agent, AgentId, Message, MessageId, NewAgent, NewMessage};
use msgq::queue::capture;
use msgq::queue::{Pacemaker, PacemakerState, QueueClient};
use msgq::store::{AgentFilter, AgentUpdate, MemoryStore, MessageFilter, MessageUpdate, Store};
use serde_json::json;
use tracing_subscriber::layer::SubscriberExt as _;

const NS: &str = "run-1";
const BEAT: Duration = Duration::from_millis(20);

async fn agent(store: &Arc<dyn Store>, uid: AgentId) -> Agent {
    let found = store.find_agents(&AgentFilter::new().uid(uid)).await.unwrap();
    found.into_iter().next().unwrap()
}

#[tokio::test]
async fn ticks_refresh_agent_and_held_message() {
    let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
    let mut client = QueueClient::new(Arc::clone(&store), "worker").with_config(
        msgq::config::QueueConfig {
            heartbeat_interval: BEAT,
            ..Default::default()
        },
    );
    let uid = client.start().await.unwrap();
    assert_eq!(client.pacemaker().unwrap().state(), PacemakerState::Running);

    client.push("work", NS, json!(1)).await.unwrap();
    let msg = client.pop("work", Some(NS)).await.unwrap().unwrap();
    let registered = agent(&store, uid).await.heartbeat;

    tokio::time::sleep(BEAT * 5).await;

    assert!(agent(&store, uid).await.heartbeat > registered);
    let stored = store
        .find_messages("work", &MessageFilter::new().uid(msg.uid), None)
        .await
        .unwrap();
    assert!(stored[0].heartbeat > msg.heartbeat);

    client.close().await.unwrap();
}

#[tokio::test]
async fn stop_is_idempotent_and_final() {
    let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
    let pacemaker = Pacemaker::register_agent(store, "worker", Some(NS), BEAT)
        .await
        .unwrap();
    assert_eq!(pacemaker.state(), PacemakerState::Created);

    pacemaker.start().unwrap();
    assert!(pacemaker.start().is_err());

    pacemaker.stop().await;
    pacemaker.stop().await;
    assert_eq!(pacemaker.state(), PacemakerState::Stopped);
    assert!(matches!(pacemaker.start(), Err(Error::InvalidState(_))));
}

#[tokio::test]
async fn unregister_ignores_messages_it_does_not_hold() {
    let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
    let pacemaker = Pacemaker::register_agent(Arc::clone(&store), "worker", None, BEAT)
        .await
        .unwrap();

    store.create_queue(NS, "work").await.unwrap();
    store
        .insert_message("work", NewMessage::new(NS, json!(1)))
        .await
        .unwrap();
    let msg = store
        .find_one_and_update(
            "work",
            &MessageFilter::new().read(false),
            &MessageUpdate::claim(chrono::Utc::now()),
        )
        .await
        .unwrap()
        .unwrap();

    pacemaker.register_message("work", &msg).await.unwrap();
    pacemaker.unregister_message(MessageId(12345)).await.unwrap();
    assert_eq!(pacemaker.held().unwrap().uid, msg.uid);

    // Registration also adopts the message's namespace.
    let record = agent(&store, pacemaker.agent_id()).await;
    assert_eq!(record.namespace.as_deref(), Some(NS));
    assert_eq!(record.message, Some(msg.uid));

    pacemaker.unregister_message(msg.uid).await.unwrap();
    assert!(pacemaker.held().is_none());
    assert_eq!(agent(&store, pacemaker.agent_id()).await.message, None);

    pacemaker.unregister_agent().await.unwrap();
    assert!(!agent(&store, pacemaker.agent_id()).await.alive);
}

#[tokio::test]
async fn heartbeat_failures_do_not_stop_the_loop() {
    let flaky = Arc::new(FlakyStore::default());
    let store: Arc<dyn Store> = flaky.clone();
    let pacemaker = Pacemaker::register_agent(Arc::clone(&store), "worker", None, BEAT)
        .await
        .unwrap();
    let registered = agent(&store, pacemaker.agent_id()).await.heartbeat;

    flaky.failing.store(true, Ordering::SeqCst);
    pacemaker.start().unwrap();
    tokio::time::sleep(BEAT * 4).await;
    assert_eq!(pacemaker.state(), PacemakerState::Running);
    assert_eq!(agent(&store, pacemaker.agent_id()).await.heartbeat, registered);

    flaky.failing.store(false, Ordering::SeqCst);
    tokio::time::sleep(BEAT * 4).await;
    assert!(agent(&store, pacemaker.agent_id()).await.heartbeat > registered);

    pacemaker.stop().await;
}

#[tokio::test]
async fn captured_output_is_attached_to_the_agent() {
    let (layer, sink) = capture::channel();
    let subscriber = tracing_subscriber::registry().with(layer);
    tracing::subscriber::with_default(subscriber, || {
        tracing::info!(step = 1, "loading model");
        tracing::warn!("slow batch");
    });

    let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
    let mut client = QueueClient::new(Arc::clone(&store), "worker");
    let uid = client.start_with_capture(sink).await.unwrap();
    client.close().await.unwrap();

    let monitor = client.monitor();
    assert_eq!(monitor.log_types(uid).await.unwrap(), vec![capture::CAPTURED_LTYPE]);
    let log = monitor.log(uid, capture::CAPTURED_LTYPE).await.unwrap();
    assert!(log.contains("loading model step=1"), "{log}");
    assert!(log.contains("WARN"), "{log}");
    assert_eq!(log.lines().count(), 2);
}

/// Delegates to a [`MemoryStore`], failing agent updates while `failing` is set.
#[derive(Default)]
struct FlakyStore {
    inner: MemoryStore,
    failing: AtomicBool,
}

#[async_trait]
impl Store for FlakyStore {
    async fn create_queue(&self, namespace: &str, queue: &str) -> Result<()> {
        self.inner.create_queue(namespace, queue).await
    }

    async fn namespaces(&self) -> Result<Vec<String>> {
        self.inner.namespaces().await
    }

    async fn queues(&self, namespace: &str) -> Result<Vec<String>> {
        self.inner.queues(namespace).await
    }

    async fn insert_message(&self, queue: &str, message: NewMessage) -> Result<MessageId> {
        self.inner.insert_message(queue, message).await
    }

    async fn find_messages(
        &self,
        queue: &str,
        filter: &MessageFilter,
        limit: Option<usize>,
    ) -> Result<Vec<Message>> {
        self.inner.find_messages(queue, filter, limit).await
    }

    async fn count_messages(&self, queue: &str, filter: &MessageFilter) -> Result<u64> {
        self.inner.count_messages(queue, filter).await
    }

    async fn count_by_namespace(
        &self,
        queue: &str,
        filter: &MessageFilter,
    ) -> Result<BTreeMap<String, u64>> {
        self.inner.count_by_namespace(queue, filter).await
    }

    async fn find_one_and_update(
        &self,
        queue: &str,
        filter: &MessageFilter,
        update: &MessageUpdate,
    ) -> Result<Option<Message>> {
        self.inner.find_one_and_update(queue, filter, update).await
    }

    async fn update_many(
        &self,
        queue: &str,
        filter: &MessageFilter,
        update: &MessageUpdate,
    ) -> Result<Vec<Message>> {
        self.inner.update_many(queue, filter, update).await
    }

    async fn delete_messages(&self, queue: &str, filter: &MessageFilter) -> Result<u64> {
        self.inner.delete_messages(queue, filter).await
    }

    async fn insert_agent(&self, agent: NewAgent) -> Result<AgentId> {
        self.inner.insert_agent(agent).await
    }

    async fn update_agent(&self, uid: AgentId, update: &AgentUpdate) -> Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(Error::Other("store unavailable".to_string()));
        }
        self.inner.update_agent(uid, update).await
    }

    async fn find_agents(&self, filter: &AgentFilter) -> Result<Vec<Agent>> {
        self.inner.find_agents(filter).await
    }

    async fn count_agents_by_namespace(
        &self,
        filter: &AgentFilter,
    ) -> Result<BTreeMap<String, u64>> {
        self.inner.count_agents_by_namespace(filter).await
    }

    async fn update_agents(
        &self,
        filter: &AgentFilter,
        update: &AgentUpdate,
    ) -> Result<Vec<Agent>> {
        self.inner.update_agents(filter, update).await
    }

    async fn insert_log(&self, agent: AgentId, ltype: i32, line: &str) -> Result<()> {
        self.inner.insert_log(agent, ltype, line).await
    }

    async fn log(&self, agent: AgentId, ltype: i32) -> Result<String> {
        self.inner.log(agent, ltype).await
    }

    async fn log_types(&self, agent: AgentId) -> Result<Vec<i32>> {
        self.inner.log_types(agent).await
    }

    async fn drop_namespace(&self, namespace: &str) -> Result<()> {
        self.inner.drop_namespace(namespace).await
    }
}
