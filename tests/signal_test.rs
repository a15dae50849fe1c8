//! Termination during a guarded replay.
//!
//! Each case re-runs this test binary as a child restricted to
//! `signal_child`, sends it a real SIGTERM, and reads what it printed. The
//! store lives inside the child, so the child reports every command it
//! applied and the final message state on stdout.
#![cfg(unix)]

use std::io::{BufRead, BufReader};
use std::os::unix::process::ExitStatusExt;
use std::process::{Child, Command, Stdio};
use std::sync::Arc;
use std::sync::mpsc;
use std::time::Duration;

use msgq::queue::QueueClient;
use msgq::store::MemoryStore;
use msgq::transaction::{MessageRef, TransactionRecorder, subscribe};
use serde_json::json;

const CHILD_ENV: &str = "MSGQ_SIGNAL_CHILD";
const PREFIX: &str = "child:";
const NS: &str = "run-1";

fn say(line: &str) {
    println!("{PREFIX} {line}");
}

/// Body of the child process. Does nothing in a normal test run.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn signal_child() {
    let Ok(mode) = std::env::var(CHILD_ENV) else {
        return;
    };

    let client = QueueClient::new(Arc::new(MemoryStore::new()), "worker");
    client.push("work", NS, json!({"my_work": 0})).await.unwrap();

    let mut tx = TransactionRecorder::new();
    tx.pop("work", Some(NS))
        .pause(Duration::from_millis(1500))
        .mark_actioned("work", MessageRef::LastClaimed);

    if mode == "early" {
        // Time for the parent to kill us before anything is committed.
        say("ready");
        tokio::time::sleep(Duration::from_secs(5)).await;
    }

    // An application shutdown path, waiting the way a worker's main loop would.
    let waiter = (mode == "graceful").then(|| {
        let mut shutdown = subscribe().unwrap();
        tokio::spawn(async move {
            let signal = shutdown.recv().await.unwrap();
            say(&format!("shutdown {signal}"));
        })
    });

    say("replaying");
    let outcome = tx.replay_guarded(&client).await.unwrap();
    let applied = outcome.result.unwrap();
    say(&format!("applied {}", applied.len()));

    let messages = client.monitor().messages("work", Some(NS), None).await.unwrap();
    say(&format!("read={} actioned={}", messages[0].read, messages[0].actioned));

    match outcome.deferred {
        Some(signal) => {
            say(&format!("deferred {signal}"));
            signal.redeliver();
        }
        None => say("no signal"),
    }
    if let Some(waiter) = waiter {
        waiter.await.unwrap();
    }
}

fn spawn_child(mode: &str) -> Child {
    Command::new(std::env::current_exe().unwrap())
        .args(["signal_child", "--exact", "--nocapture", "--test-threads=1", "-q"])
        .env(CHILD_ENV, mode)
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .unwrap()
}

/// Forward the child's lines to a channel so the parent can wait on them.
fn child_lines(child: &mut Child) -> mpsc::Receiver<String> {
    let stdout = child.stdout.take().unwrap();
    let (tx, rx) = mpsc::channel();
    std::thread::spawn(move || {
        for line in BufReader::new(stdout).lines().map_while(Result::ok) {
            if let Some(rest) = line.strip_prefix(PREFIX) {
                let _ = tx.send(rest.trim().to_string());
            }
        }
    });
    rx
}

fn wait_for(lines: &mpsc::Receiver<String>, expected: &str) {
    let line = lines.recv_timeout(Duration::from_secs(30)).unwrap();
    assert_eq!(line, expected);
}

fn sigterm(child: &Child) {
    let status = Command::new("kill")
        .args(["-TERM", &child.id().to_string()])
        .status()
        .unwrap();
    assert!(status.success());
}

#[test]
fn termination_mid_replay_waits_for_the_replay() {
    let mut child = spawn_child("mid");
    let lines = child_lines(&mut child);

    wait_for(&lines, "replaying");
    // Lands inside the pause between the claim and the completion.
    std::thread::sleep(Duration::from_millis(500));
    sigterm(&child);

    let status = child.wait().unwrap();
    let rest: Vec<String> = lines.iter().collect();
    assert_eq!(
        rest,
        ["applied 3", "read=true actioned=true", "deferred SIGTERM"]
    );
    assert_eq!(status.code(), Some(143));
}

#[test]
fn termination_before_replay_commits_nothing() {
    let mut child = spawn_child("early");
    let lines = child_lines(&mut child);

    wait_for(&lines, "ready");
    sigterm(&child);

    let status = child.wait().unwrap();
    let rest: Vec<String> = lines.iter().collect();
    assert!(rest.is_empty(), "child went on after the signal: {rest:?}");
    assert!(!status.success());
    assert_eq!(status.signal(), Some(15));
}

#[test]
fn shutdown_subscribers_wait_for_the_replay() {
    let mut child = spawn_child("graceful");
    let lines = child_lines(&mut child);

    wait_for(&lines, "replaying");
    std::thread::sleep(Duration::from_millis(500));
    sigterm(&child);

    let status = child.wait().unwrap();
    let rest: Vec<String> = lines.iter().collect();
    assert_eq!(
        rest,
        [
            "applied 3",
            "read=true actioned=true",
            "deferred SIGTERM",
            "shutdown SIGTERM"
        ]
    );
    assert!(status.success());
}
