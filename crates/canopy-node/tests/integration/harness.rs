//! Test harness for in-process canopy-node integration tests.
//!
//! Each TestNode is a full node (listener, loop, worker pool) on an
//! ephemeral port with its own results directory. Observation goes
//! through the Inspect command, the same way the console would.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use canopy_node::config::NodeConfig;
use canopy_node::jobs::JobState;
use canopy_node::reactor::{self, NodeCommand, NodeHandle, NodeStatus};
use tempfile::TempDir;

pub struct TestNode {
    pub handle: NodeHandle,
    pub results_dir: PathBuf,
    _tempdir: TempDir,
}

#[allow(dead_code)]
impl TestNode {
    /// Start a node on an ephemeral port. `parent` attaches it to a tree.
    pub async fn start(parent: Option<SocketAddr>) -> Result<TestNode> {
        let tempdir = tempfile::tempdir()?;
        let mut cfg = NodeConfig::default();
        cfg.node.listen_port = 0;
        cfg.node.results_dir = tempdir.path().join("results");
        cfg.node.workers = 2;
        cfg.network.parent = parent.map(|a| a.to_string());
        let results_dir = cfg.node.results_dir.clone();
        let handle = reactor::spawn(cfg).await?;
        Ok(TestNode { handle, results_dir, _tempdir: tempdir })
    }

    /// Where other local nodes (or raw sockets) reach this one.
    pub fn dial_addr(&self) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], self.handle.listen_addr.port()))
    }

    pub async fn status(&self) -> Result<NodeStatus> {
        self.handle.inspect().await.context("node loop gone")
    }

    pub async fn start_job(
        &self,
        artifact: &Path,
        entry_point: &str,
        start: i64,
        end: i64,
        output: &str,
    ) -> Result<PathBuf> {
        self.handle
            .commands
            .send(NodeCommand::Start {
                artifact_url: artifact.display().to_string(),
                entry_point: entry_point.to_string(),
                start,
                end,
                output: PathBuf::from(output),
            })
            .await
            .context("sending START")?;
        Ok(self.results_dir.join(output))
    }

    pub async fn disconnect(&self) -> Result<()> {
        self.handle
            .commands
            .send(NodeCommand::Disconnect)
            .await
            .context("sending DISCONNECT")
    }

    /// Poll until `accept` likes a status snapshot, or time out.
    pub async fn wait_for(
        &self,
        what: &str,
        accept: impl Fn(&NodeStatus) -> bool,
        timeout: Duration,
    ) -> Result<NodeStatus> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let status = self.status().await?;
            if accept(&status) {
                return Ok(status);
            }
            if tokio::time::Instant::now() > deadline {
                bail!("timeout waiting for {what}, status: {status:?}");
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
    }

    /// Poll until this node sees the whole tree as `want` nodes.
    pub async fn wait_potential(&self, want: i32, timeout: Duration) -> Result<()> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let status = self.status().await?;
            if status.potential == want {
                return Ok(());
            }
            if tokio::time::Instant::now() > deadline {
                bail!("timeout waiting for potential {want}, status: {status:?}");
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
    }

    /// Poll until every tracked job reached `Finished` (and at least
    /// one job exists). Returns the total answers across jobs.
    pub async fn wait_jobs_finished(&self, timeout: Duration) -> Result<i64> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let status = self.status().await?;
            if !status.jobs.is_empty()
                && status.jobs.iter().all(|j| j.state == JobState::Finished)
            {
                return Ok(status.jobs.iter().map(|j| j.answered).sum());
            }
            if tokio::time::Instant::now() > deadline {
                bail!("timeout waiting for jobs to finish, status: {status:?}");
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
    }

    /// Poll until the node task itself has exited (a completed leave).
    pub async fn wait_exit(mut self, timeout: Duration) -> Result<()> {
        tokio::time::timeout(timeout, &mut self.handle.task)
            .await
            .context("timeout waiting for node exit")?
            .context("node task panicked")
    }
}

/// A dummy artifact file for jobs to "fetch" (a local copy).
pub fn make_artifact(dir: &Path) -> Result<PathBuf> {
    let path = dir.join("checker-artifact.bin");
    std::fs::write(&path, b"canopy test artifact")?;
    Ok(path)
}

/// Parse an output file back into the values it covers, failing on
/// duplicates.
pub fn read_output_values(path: &Path) -> Result<HashSet<i64>> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("reading output {}", path.display()))?;
    let mut values = HashSet::new();
    for line in raw.lines() {
        let first = line
            .split_whitespace()
            .next()
            .with_context(|| format!("blank output line in {}", path.display()))?;
        let value: i64 = first.parse().with_context(|| format!("bad output line: {line}"))?;
        if !values.insert(value) {
            bail!("value {value} appears twice in {}", path.display());
        }
    }
    Ok(values)
}
