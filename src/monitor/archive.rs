//! Namespace export targets.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::Serialize;
use tokio::io::AsyncWriteExt;

use crate::error::Result;
use crate::model::{Agent, AgentId, Message};

/// Receives the contents of one namespace from [`QueueMonitor::archive`].
///
/// Calls arrive in order: every queue, then the agents, then one call per
/// (agent, log type), then `finish`.
///
/// [`QueueMonitor::archive`]: super::QueueMonitor::archive
#[async_trait]
pub trait Archiver: Send {
    async fn write_queue(&mut self, queue: &str, messages: &[Message]) -> Result<()>;

    async fn write_agents(&mut self, agents: &[Agent]) -> Result<()>;

    async fn write_log(&mut self, agent: AgentId, ltype: i32, log: &str) -> Result<()>;

    async fn finish(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Writes a namespace as JSON lines into a directory:
///
/// ```text
/// <root>/<namespace_out>/<queue>.jsonl
/// <root>/<namespace_out>/system.jsonl
/// <root>/<namespace_out>/logs/<agent>_<ltype>.txt
/// ```
#[derive(Debug, Clone)]
pub struct DirArchive {
    dir: PathBuf,
    files: Vec<PathBuf>,
}

impl DirArchive {
    pub fn new(root: impl AsRef<Path>, namespace_out: &str) -> Self {
        Self {
            dir: root.as_ref().join(namespace_out),
            files: Vec::new(),
        }
    }

    /// Directory the namespace is written into.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Files written so far.
    pub fn files(&self) -> &[PathBuf] {
        &self.files
    }

    async fn write_file(&mut self, path: PathBuf, contents: &[u8]) -> Result<()> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut file = tokio::fs::File::create(&path).await?;
        file.write_all(contents).await?;
        file.flush().await?;
        self.files.push(path);
        Ok(())
    }
}

fn json_lines<T: Serialize>(items: &[T]) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    for item in items {
        serde_json::to_writer(&mut out, item)?;
        out.push(b'\n');
    }
    Ok(out)
}

#[async_trait]
impl Archiver for DirArchive {
    async fn write_queue(&mut self, queue: &str, messages: &[Message]) -> Result<()> {
        let body = json_lines(messages)?;
        let path = self.dir.join(format!("{queue}.jsonl"));
        self.write_file(path, &body).await
    }

    async fn write_agents(&mut self, agents: &[Agent]) -> Result<()> {
        let body = json_lines(agents)?;
        let path = self.dir.join("system.jsonl");
        self.write_file(path, &body).await
    }

    async fn write_log(&mut self, agent: AgentId, ltype: i32, log: &str) -> Result<()> {
        let path = self.dir.join("logs").join(format!("{agent}_{ltype}.txt"));
        self.write_file(path, log.as_bytes()).await
    }
}
