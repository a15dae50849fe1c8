//! msgq CLI: operator interface to the queues of a Postgres store.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use msgq::config::{Config, QueueConfig};
use msgq::db::Db;
use msgq::model::{AgentId, MessageId, NewMessage};
use msgq::monitor::{DirArchive, QueueMonitor};
use msgq::queue::QueueClient;
use msgq::telemetry::{TelemetryConfig, init_telemetry};
use secrecy::ExposeSecret;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "msgq", about = "Inspect and repair msgq work queues")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// List namespaces, or the queues of one namespace
    Queues {
        #[arg(long, short)]
        namespace: Option<String>,
    },
    /// Message counts of one queue
    Status {
        queue: String,
        #[arg(long, short)]
        namespace: String,
    },
    /// List agents
    Agents {
        #[arg(long, short)]
        namespace: Option<String>,
        /// Only agents whose heartbeat is older than the agent timeout
        #[arg(long)]
        dead: bool,
    },
    /// Enqueue one message
    Enqueue {
        queue: String,
        #[arg(long, short)]
        namespace: String,
        /// JSON payload
        payload: String,
        #[arg(long, default_value_t = 0)]
        mtype: i32,
        /// Uid of the message this one answers
        #[arg(long)]
        replying_to: Option<i64>,
    },
    /// Retire dead agents, then requeue lost and failed messages of every queue
    Sweep {
        #[arg(long, short)]
        namespace: String,
        /// Staleness threshold in seconds (default: MSGQ_AGENT_TIMEOUT_SECS)
        #[arg(long)]
        timeout: Option<u64>,
        /// Retry cap (default: MSGQ_MAX_RETRY)
        #[arg(long)]
        max_retry: Option<i32>,
        /// Repeat every N seconds until interrupted
        #[arg(long)]
        watch: Option<u64>,
    },
    /// Make every not-actioned message of a queue unread again
    Reset {
        queue: String,
        #[arg(long, short)]
        namespace: String,
    },
    /// Print an agent's log
    Log {
        agent: i64,
        #[arg(long, default_value_t = 0)]
        ltype: i32,
    },
    /// Export a namespace as JSON lines into a directory
    Archive {
        namespace: String,
        /// Output directory
        #[arg(long, default_value = "archive")]
        out: PathBuf,
        /// Directory name inside the output (default: the namespace)
        #[arg(long)]
        namespace_out: Option<String>,
        /// Drop the namespace after exporting it
        #[arg(long)]
        remove: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    let config = Config::from_env()?;

    let _guard = init_telemetry(TelemetryConfig {
        endpoint: config.otel_endpoint.clone(),
        log_level: config.log_level.clone(),
        ..TelemetryConfig::new("msgq")
    })?;

    let db = Db::connect(config.database_url.expose_secret()).await?;
    db.migrate().await?;
    let client = QueueClient::new(Arc::new(db), "msgq-cli").with_config(config.queue.clone());
    let monitor = client.monitor();

    match cli.command {
        Command::Queues { namespace } => cmd_queues(&monitor, namespace).await,
        Command::Status { queue, namespace } => cmd_status(&monitor, &queue, &namespace).await,
        Command::Agents { namespace, dead } => {
            cmd_agents(&monitor, namespace.as_deref(), dead.then_some(&config.queue)).await
        }
        Command::Enqueue {
            queue,
            namespace,
            payload,
            mtype,
            replying_to,
        } => {
            let mut message = NewMessage::new(namespace, serde_json::from_str(&payload)?).mtype(mtype);
            if let Some(uid) = replying_to {
                message = message.replying_to(MessageId(uid));
            }
            let uid = client.enqueue(&queue, message).await?;
            println!("Enqueued: {uid}");
            Ok(())
        }
        Command::Sweep {
            namespace,
            timeout,
            max_retry,
            watch,
        } => {
            let policy = QueueConfig {
                agent_timeout: timeout.map(Duration::from_secs).unwrap_or(config.queue.agent_timeout),
                max_retry: max_retry.unwrap_or(config.queue.max_retry),
                ..config.queue.clone()
            };
            match watch {
                None => cmd_sweep(&monitor, &namespace, &policy).await,
                Some(secs) => cmd_watch(&monitor, &namespace, &policy, Duration::from_secs(secs)).await,
            }
        }
        Command::Reset { queue, namespace } => {
            let reset = monitor.reset_queue(&queue, Some(&namespace)).await?;
            println!("Reset {} message(s) in {namespace}/{queue}", reset.len());
            Ok(())
        }
        Command::Log { agent, ltype } => {
            print!("{}", monitor.log(AgentId(agent), ltype).await?);
            Ok(())
        }
        Command::Archive {
            namespace,
            out,
            namespace_out,
            remove,
        } => {
            let mut archive = DirArchive::new(&out, namespace_out.as_deref().unwrap_or(&namespace));
            monitor.archive(&namespace, &mut archive, remove).await?;
            println!(
                "Archived {namespace} to {} ({} file(s))",
                archive.dir().display(),
                archive.files().len()
            );
            Ok(())
        }
    }
}

async fn cmd_queues(monitor: &QueueMonitor, namespace: Option<String>) -> anyhow::Result<()> {
    let Some(namespace) = namespace else {
        for ns in monitor.namespaces().await? {
            println!("{ns}");
        }
        return Ok(());
    };

    let queues = monitor.queues(&namespace).await?;
    if queues.is_empty() {
        println!("No queues in {namespace}.");
        return Ok(());
    }

    println!(
        "{:<24}  {:>8}  {:>8}  {:>10}  {:>8}",
        "QUEUE", "TOTAL", "UNREAD", "IN FLIGHT", "DONE"
    );
    println!("{}", "-".repeat(66));
    for queue in &queues {
        let ns = Some(namespace.as_str());
        println!(
            "{:<24}  {:>8}  {:>8}  {:>10}  {:>8}",
            queue,
            monitor.message_count(queue, ns, None).await?,
            monitor.unread_count(queue, ns, None).await?,
            monitor.unactioned_count(queue, ns, None).await?,
            monitor.actioned_count(queue, ns, None).await?,
        );
    }
    Ok(())
}

async fn cmd_status(monitor: &QueueMonitor, queue: &str, namespace: &str) -> anyhow::Result<()> {
    let ns = Some(namespace);
    let failed = monitor.failed_messages(queue, ns).await?;

    println!("Queue:      {namespace}/{queue}");
    println!("Messages:   {}", monitor.message_count(queue, ns, None).await?);
    println!("Unread:     {}", monitor.unread_count(queue, ns, None).await?);
    println!("Read:       {}", monitor.read_count(queue, ns, None).await?);
    println!("In flight:  {}", monitor.unactioned_count(queue, ns, None).await?);
    println!("Actioned:   {}", monitor.actioned_count(queue, ns, None).await?);
    println!("Failed:     {}", failed.len());
    for msg in &failed {
        println!(
            "  {:<8} retry={:<3} {}",
            msg.uid,
            msg.retry,
            msg.error.as_deref().unwrap_or("-")
        );
    }
    Ok(())
}

async fn cmd_agents(
    monitor: &QueueMonitor,
    namespace: Option<&str>,
    dead: Option<&QueueConfig>,
) -> anyhow::Result<()> {
    let agents = match dead {
        Some(policy) => monitor.dead_agents(namespace, policy.agent_timeout).await?,
        None => monitor.agents(namespace).await?,
    };

    if agents.is_empty() {
        println!("No agents found.");
        return Ok(());
    }

    println!(
        "{:<8}  {:<20}  {:<16}  {:<5}  {:<16}  HEARTBEAT",
        "UID", "NAME", "NAMESPACE", "ALIVE", "HOLDING"
    );
    println!("{}", "-".repeat(96));
    for agent in &agents {
        let holding = match (&agent.queue, agent.message) {
            (Some(queue), Some(uid)) => format!("{queue}/{uid}"),
            _ => "-".to_string(),
        };
        println!(
            "{:<8}  {:<20}  {:<16}  {:<5}  {:<16}  {}",
            agent.uid,
            agent.agent,
            agent.namespace.as_deref().unwrap_or("-"),
            agent.alive,
            holding,
            agent.heartbeat.format("%Y-%m-%d %H:%M:%S")
        );
    }
    println!("\n{} agent(s)", agents.len());
    Ok(())
}

async fn cmd_sweep(monitor: &QueueMonitor, namespace: &str, policy: &QueueConfig) -> anyhow::Result<()> {
    let ns = Some(namespace);
    let mut retired = monitor.retire_dead_agents(ns, policy.agent_timeout).await?;
    // Agents that never claimed anything belong to no namespace.
    retired.extend(
        monitor
            .retire_unassigned_dead_agents(policy.agent_timeout)
            .await?,
    );

    let (mut lost, mut failed, mut stuck) = (0, 0, 0);
    for queue in monitor.queues(namespace).await? {
        lost += monitor
            .requeue_lost_messages(&queue, ns, policy.agent_timeout, policy.max_retry)
            .await?
            .len();
        failed += monitor
            .requeue_failed_messages(&queue, ns, policy.max_retry)
            .await?
            .len();
        stuck += monitor
            .lost_messages(&queue, ns, policy.agent_timeout)
            .await?
            .len();
    }

    info!(namespace, retired = retired.len(), lost, failed, stuck, "sweep done");
    println!(
        "Retired {} agent(s), requeued {lost} lost and {failed} failed message(s); {stuck} stuck past max retry",
        retired.len()
    );
    Ok(())
}

async fn cmd_watch(
    monitor: &QueueMonitor,
    namespace: &str,
    policy: &QueueConfig,
    every: Duration,
) -> anyhow::Result<()> {
    let mut ticker = tokio::time::interval(every);
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    loop {
        tokio::select! {
            _ = &mut ctrl_c => {
                info!("sweep watch interrupted");
                return Ok(());
            }
            _ = ticker.tick() => {
                if let Err(e) = cmd_sweep(monitor, namespace, policy).await {
                    warn!("sweep failed, retrying next tick: {e}");
                }
            }
        }
    }
}
