use std::sync::Arc;
use std::time::Duration;

use msgq::model::{Message, MtypeFilter, NewMessage};
use msgq::monitor::{DirArchive, QueueMonitor, RETRY_LIMIT_ERROR};
use msgq::queue::QueueClient;
use msgq::store::{MemoryStore, Store};
use serde_json::json;

const NS: &str = "run-1";
const STALE: Duration = Duration::from_millis(10);

fn setup() -> (QueueClient, QueueMonitor) {
    let client = QueueClient::new(Arc::new(MemoryStore::new()), "worker");
    let monitor = client.monitor();
    (client, monitor)
}

/// Claim the oldest message and let it go silent.
async fn claim_and_abandon(client: &QueueClient) -> Message {
    let msg = client.pop("work", Some(NS)).await.unwrap().unwrap();
    tokio::time::sleep(STALE * 3).await;
    msg
}

#[tokio::test]
async fn counts_follow_message_lifecycle() {
    let (client, monitor) = setup();
    for mtype in [0, 0, 1, 2] {
        client
            .enqueue("work", NewMessage::new(NS, json!(mtype)).mtype(mtype))
            .await
            .unwrap();
    }
    let first = client.pop("work", Some(NS)).await.unwrap().unwrap();
    let second = client.pop("work", Some(NS)).await.unwrap().unwrap();
    client.mark_actioned("work", &first).await.unwrap();

    assert_eq!(monitor.message_count("work", Some(NS), None).await.unwrap(), 4);
    assert_eq!(monitor.unread_count("work", Some(NS), None).await.unwrap(), 2);
    assert_eq!(monitor.read_count("work", Some(NS), None).await.unwrap(), 2);
    assert_eq!(monitor.actioned_count("work", Some(NS), None).await.unwrap(), 1);
    assert_eq!(monitor.unactioned_count("work", Some(NS), None).await.unwrap(), 1);
    assert_eq!(
        monitor
            .unread_count("work", Some(NS), Some(MtypeFilter::from(vec![1, 2])))
            .await
            .unwrap(),
        2
    );

    let in_flight = monitor.unactioned_messages("work", Some(NS), None).await.unwrap();
    assert_eq!(in_flight.len(), 1);
    assert_eq!(in_flight[0].uid, second.uid);
    assert_eq!(monitor.unactioned("work", Some(NS)).await.unwrap().len(), 3);

    let unread = monitor
        .unread_messages("work", Some(NS), Some(MtypeFilter::from(2)))
        .await
        .unwrap();
    assert_eq!(unread.len(), 1);
    assert_eq!(unread[0].mtype, 2);

    assert_eq!(monitor.namespaces().await.unwrap(), vec![NS.to_string()]);
    assert_eq!(monitor.queues(NS).await.unwrap(), vec!["work".to_string()]);
}

#[tokio::test]
async fn silent_agents_are_dead_until_they_beat() {
    let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
    let mut client = QueueClient::new(Arc::clone(&store), "worker").with_namespace(NS);
    let uid = client.start().await.unwrap();
    let monitor = client.monitor();

    assert!(monitor.dead_agents(Some(NS), Duration::from_secs(60)).await.unwrap().is_empty());

    tokio::time::sleep(STALE * 3).await;
    let dead = monitor.dead_agents(Some(NS), STALE).await.unwrap();
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].uid, uid);

    client.pacemaker().unwrap().update_heartbeat().await.unwrap();
    assert!(monitor.dead_agents(Some(NS), STALE).await.unwrap().is_empty());

    tokio::time::sleep(STALE * 3).await;
    let retired = monitor.retire_dead_agents(Some(NS), STALE).await.unwrap();
    assert_eq!(retired.len(), 1);
    assert!(!retired[0].alive);
    assert!(monitor.dead_agents(Some(NS), STALE).await.unwrap().is_empty());

    client.close().await.unwrap();
}

#[tokio::test]
async fn lost_message_requeue_stops_at_max_retry() {
    let (client, monitor) = setup();
    let max_retry = 2;
    client.push("work", NS, json!("job")).await.unwrap();

    // retry 0 and retry 1 (= max_retry - 1) are both requeued.
    for expected in 1..=max_retry {
        claim_and_abandon(&client).await;
        let requeued = monitor
            .requeue_lost_messages("work", Some(NS), STALE, max_retry)
            .await
            .unwrap();
        assert_eq!(requeued.len(), 1);
        assert_eq!(requeued[0].retry, expected);
        assert!(!requeued[0].read);
        assert!(requeued[0].read_time.is_none());
    }

    // retry == max_retry: left claimed, reported as lost and as failed.
    let msg = claim_and_abandon(&client).await;
    let requeued = monitor
        .requeue_lost_messages("work", Some(NS), STALE, max_retry)
        .await
        .unwrap();
    assert!(requeued.is_empty());

    let lost = monitor.lost_messages("work", Some(NS), STALE).await.unwrap();
    assert_eq!(lost.len(), 1);
    assert_eq!(lost[0].uid, msg.uid);
    assert_eq!(lost[0].retry, max_retry);
    assert!(lost[0].read);

    let failed = monitor.failed_messages("work", Some(NS)).await.unwrap();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].uid, msg.uid);
    assert_eq!(failed[0].error.as_deref(), Some(RETRY_LIMIT_ERROR));
    assert!(
        monitor
            .requeue_failed_messages("work", Some(NS), max_retry)
            .await
            .unwrap()
            .is_empty()
    );
}

#[tokio::test]
async fn exhausted_sweep_keeps_an_existing_error() {
    let (client, monitor) = setup();
    client.push("work", NS, json!("job")).await.unwrap();
    let msg = claim_and_abandon(&client).await;
    client.mark_error("work", &msg, "model diverged").await.unwrap();
    tokio::time::sleep(STALE * 3).await;

    monitor
        .requeue_lost_messages("work", Some(NS), STALE, 0)
        .await
        .unwrap();
    let failed = monitor.failed_messages("work", Some(NS)).await.unwrap();
    assert_eq!(failed[0].error.as_deref(), Some("model diverged"));
}

#[tokio::test]
async fn counts_group_by_namespace() {
    let (client, monitor) = setup();
    for (ns, mtype) in [("run-1", 0), ("run-1", 1), ("run-2", 1), ("run-2", 1)] {
        client
            .enqueue("work", NewMessage::new(ns, json!(null)).mtype(mtype))
            .await
            .unwrap();
    }
    let a = client.pop("work", Some("run-1")).await.unwrap().unwrap();
    client.mark_actioned("work", &a).await.unwrap();
    let b = client.pop("work", Some("run-2")).await.unwrap().unwrap();
    client.mark_error("work", &b, "boom").await.unwrap();

    let counts = monitor.unread_counts("work", None).await.unwrap();
    assert_eq!(counts.get("run-1"), Some(&1));
    assert_eq!(counts.get("run-2"), Some(&1));

    let typed = monitor
        .unread_counts("work", Some(MtypeFilter::from(1)))
        .await
        .unwrap();
    assert_eq!(typed.get("run-1"), Some(&1));
    assert_eq!(typed.get("run-2"), Some(&1));
    let type_zero = monitor
        .read_counts("work", Some(MtypeFilter::from(0)))
        .await
        .unwrap();
    assert_eq!(type_zero.get("run-1"), Some(&1));
    assert!(!type_zero.contains_key("run-2"));

    assert_eq!(monitor.read_counts("work", None).await.unwrap().len(), 2);
    let actioned = monitor.actioned_counts("work", None).await.unwrap();
    assert_eq!(actioned.into_iter().collect::<Vec<_>>(), vec![("run-1".to_string(), 1)]);
    let in_flight = monitor.unactioned_counts("work", None).await.unwrap();
    assert_eq!(in_flight.into_iter().collect::<Vec<_>>(), vec![("run-2".to_string(), 1)]);
    let failed = monitor.failed_counts("work", None).await.unwrap();
    assert_eq!(failed.get("run-2"), Some(&1));
    assert!(
        monitor
            .failed_counts("work", Some(MtypeFilter::from(0)))
            .await
            .unwrap()
            .is_empty()
    );

    tokio::time::sleep(STALE * 3).await;
    let lost = monitor.lost_counts("work", None, STALE).await.unwrap();
    assert_eq!(lost.into_iter().collect::<Vec<_>>(), vec![("run-2".to_string(), 1)]);

    assert_eq!(
        monitor
            .read_count("work", Some("run-2"), Some(MtypeFilter::from(0)))
            .await
            .unwrap(),
        0
    );
    assert_eq!(
        monitor
            .actioned_count("work", Some("run-1"), Some(MtypeFilter::from(0)))
            .await
            .unwrap(),
        1
    );
}

#[tokio::test]
async fn agent_counts_cover_live_assigned_agents() {
    let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
    let monitor = QueueMonitor::new(Arc::clone(&store));

    let mut one = QueueClient::new(Arc::clone(&store), "a").with_namespace("run-1");
    let mut two = QueueClient::new(Arc::clone(&store), "b").with_namespace("run-1");
    let mut three = QueueClient::new(Arc::clone(&store), "c").with_namespace("run-2");
    let mut idle = QueueClient::new(Arc::clone(&store), "idle");
    for client in [&mut one, &mut two, &mut three, &mut idle] {
        client.start().await.unwrap();
    }
    three.close().await.unwrap();

    let counts = monitor.agent_counts().await.unwrap();
    assert_eq!(counts.into_iter().collect::<Vec<_>>(), vec![("run-1".to_string(), 2)]);

    for client in [&mut one, &mut two, &mut idle] {
        client.close().await.unwrap();
    }
}

#[tokio::test]
async fn unassigned_dead_agents_can_be_retired() {
    let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
    let monitor = QueueMonitor::new(Arc::clone(&store));
    let mut scoped = QueueClient::new(Arc::clone(&store), "scoped").with_namespace(NS);
    let mut idle = QueueClient::new(Arc::clone(&store), "idle");
    let scoped_uid = scoped.start().await.unwrap();
    let idle_uid = idle.start().await.unwrap();

    tokio::time::sleep(STALE * 3).await;
    let scoped_dead = monitor.dead_agents(Some(NS), STALE).await.unwrap();
    assert_eq!(scoped_dead.len(), 1);
    assert_eq!(scoped_dead[0].uid, scoped_uid);

    let retired = monitor.retire_unassigned_dead_agents(STALE).await.unwrap();
    assert_eq!(retired.len(), 1);
    assert_eq!(retired[0].uid, idle_uid);
    assert!(retired[0].namespace.is_none());
    assert_eq!(monitor.dead_agents(Some(NS), STALE).await.unwrap().len(), 1);

    scoped.close().await.unwrap();
    idle.close().await.unwrap();
}

#[tokio::test]
async fn lost_detection_respects_heartbeats() {
    let (client, monitor) = setup();
    client.push("work", NS, json!(1)).await.unwrap();
    client.push("work", NS, json!(2)).await.unwrap();

    // Unclaimed messages are never lost.
    tokio::time::sleep(STALE * 3).await;
    assert!(monitor.lost_messages("work", Some(NS), STALE).await.unwrap().is_empty());

    let mut session = QueueClient::new(Arc::clone(client.store()), "worker");
    session.start().await.unwrap();
    let held = session.pop("work", Some(NS)).await.unwrap().unwrap();
    tokio::time::sleep(STALE * 3).await;
    session.pacemaker().unwrap().update_heartbeat().await.unwrap();

    assert!(monitor.lost_messages("work", Some(NS), STALE).await.unwrap().is_empty());
    tokio::time::sleep(STALE * 3).await;
    let lost = monitor.lost_messages("work", Some(NS), STALE).await.unwrap();
    assert_eq!(lost.len(), 1);
    assert_eq!(lost[0].uid, held.uid);

    session.close().await.unwrap();
}

#[tokio::test]
async fn failed_requeue_clears_error_and_counts_retry() {
    let (client, monitor) = setup();
    client.push("work", NS, json!(1)).await.unwrap();

    let msg = client.pop("work", Some(NS)).await.unwrap().unwrap();
    client.mark_error("work", &msg, "first").await.unwrap();

    let requeued = monitor.requeue_failed_messages("work", Some(NS), 1).await.unwrap();
    assert_eq!(requeued.len(), 1);
    assert_eq!(requeued[0].retry, 1);
    assert!(requeued[0].error.is_none());
    assert!(monitor.failed_messages("work", Some(NS)).await.unwrap().is_empty());

    let msg = client.pop("work", Some(NS)).await.unwrap().unwrap();
    client.mark_error("work", &msg, "second").await.unwrap();
    assert!(
        monitor
            .requeue_failed_messages("work", Some(NS), 1)
            .await
            .unwrap()
            .is_empty()
    );
    let failed = monitor.failed_messages("work", Some(NS)).await.unwrap();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].error.as_deref(), Some("second"));
}

#[tokio::test]
async fn concurrent_sweeps_requeue_once() {
    let (client, monitor) = setup();
    for i in 0..5 {
        client.push("work", NS, json!(i)).await.unwrap();
    }
    for _ in 0..5 {
        client.pop("work", Some(NS)).await.unwrap().unwrap();
    }
    tokio::time::sleep(STALE * 3).await;

    let sweeps: Vec<_> = (0..4)
        .map(|_| {
            let monitor = monitor.clone();
            tokio::spawn(async move {
                monitor
                    .requeue_lost_messages("work", Some(NS), STALE, 3)
                    .await
                    .unwrap()
                    .len()
            })
        })
        .collect();

    let mut total = 0;
    for sweep in sweeps {
        total += sweep.await.unwrap();
    }
    assert_eq!(total, 5);
    for msg in monitor.messages("work", Some(NS), None).await.unwrap() {
        assert_eq!(msg.retry, 1);
        assert!(!msg.read);
    }
}

#[tokio::test]
async fn reset_queue_unreads_everything_not_actioned() {
    let (client, monitor) = setup();
    for i in 0..3 {
        client.push("work", NS, json!(i)).await.unwrap();
    }
    let done = client.pop("work", Some(NS)).await.unwrap().unwrap();
    let failed = client.pop("work", Some(NS)).await.unwrap().unwrap();
    client.mark_actioned("work", &done).await.unwrap();
    client.mark_error("work", &failed, "boom").await.unwrap();

    let reset = monitor.reset_queue("work", Some(NS)).await.unwrap();
    assert_eq!(reset.len(), 2);
    assert!(reset.iter().all(|m| !m.read && m.retry == 0));

    assert_eq!(monitor.unread_count("work", Some(NS), None).await.unwrap(), 2);
    assert_eq!(monitor.actioned_count("work", Some(NS), None).await.unwrap(), 1);
}

#[tokio::test]
async fn clear_only_touches_one_namespace() {
    let (client, monitor) = setup();
    client.push("work", NS, json!(1)).await.unwrap();
    client.push("work", NS, json!(2)).await.unwrap();
    client.push("work", "run-2", json!(3)).await.unwrap();

    assert_eq!(monitor.clear("work", NS).await.unwrap(), 2);
    assert_eq!(monitor.message_count("work", None, None).await.unwrap(), 1);
}

#[tokio::test]
async fn archive_writes_queues_agents_and_logs() {
    let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
    let mut client = QueueClient::new(Arc::clone(&store), "worker").with_namespace(NS);
    let agent = client.start().await.unwrap();
    store.insert_log(agent, 0, "line one\n").await.unwrap();
    store.insert_log(agent, 3, "other\n").await.unwrap();

    client.push("a", NS, json!({"k": 1})).await.unwrap();
    client.push("a", NS, json!({"k": 2})).await.unwrap();
    client.push("b", NS, json!({"k": 3})).await.unwrap();
    client.push("a", "run-2", json!({"k": 4})).await.unwrap();
    client.close().await.unwrap();

    let out = tempfile::tempdir().unwrap();
    let mut archive = DirArchive::new(out.path(), "export");
    let monitor = client.monitor();
    monitor.archive(NS, &mut archive, true).await.unwrap();

    let dir = out.path().join("export");
    let queue_a = std::fs::read_to_string(dir.join("a.jsonl")).unwrap();
    let messages: Vec<Message> = queue_a
        .lines()
        .map(|line| serde_json::from_str(line).unwrap())
        .collect();
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[1].message, json!({"k": 2}));

    let system = std::fs::read_to_string(dir.join("system.jsonl")).unwrap();
    assert_eq!(system.lines().count(), 1);
    assert!(dir.join("b.jsonl").exists());
    assert_eq!(
        std::fs::read_to_string(dir.join("logs").join(format!("{agent}_0.txt"))).unwrap(),
        "line one\n"
    );
    assert!(dir.join("logs").join(format!("{agent}_3.txt")).exists());
    assert_eq!(archive.files().len(), 5);

    // Removed: only the other namespace is left.
    assert_eq!(monitor.namespaces().await.unwrap(), vec!["run-2".to_string()]);
    assert!(monitor.agents(Some(NS)).await.unwrap().is_empty());
    assert_eq!(monitor.message_count("a", None, None).await.unwrap(), 1);
}

#[tokio::test]
async fn archive_holds_the_shared_lock() {
    let (client, monitor) = setup();
    client.push("work", NS, json!(1)).await.unwrap();

    let lock = Arc::new(tokio::sync::Mutex::new(()));
    let monitor = monitor.with_lock(Arc::clone(&lock));
    let held = lock.lock().await;

    let out = tempfile::tempdir().unwrap();
    let root = out.path().to_path_buf();
    let task = tokio::spawn(async move {
        let mut archive = DirArchive::new(&root, NS);
        monitor.archive(NS, &mut archive, false).await.unwrap();
    });

    tokio::time::sleep(Duration::from_millis(30)).await;
    assert!(!task.is_finished());
    assert!(!out.path().join(NS).exists());

    drop(held);
    task.await.unwrap();
    assert!(out.path().join(NS).join("work.jsonl").exists());
}
