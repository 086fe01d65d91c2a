//! Node configuration: a small TOML file plus command-line overrides.
//!
//! Every field has a default so a node can start with nothing but a
//! listen port. The file is optional; flags win over the file.

use std::net::{SocketAddr, SocketAddrV4, ToSocketAddrs};
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::Parser;
use serde::{Deserialize, Serialize};

#[derive(Parser, Debug)]
#[command(name = "canopy-node", version, about = "Canopy volunteer-computing tree node")]
pub struct Cli {
    /// Path to the TOML configuration file (optional).
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// TCP port to listen on for incoming links.
    #[arg(short = 'p', long)]
    pub listen_port: Option<u16>,

    /// Directory where job result files are written.
    #[arg(short, long)]
    pub results_dir: Option<PathBuf>,

    /// Address of the parent node to attach to (host:port). Omit for the root.
    #[arg(long)]
    pub parent: Option<String>,

    /// Number of worker tasks computing ranges.
    #[arg(long)]
    pub workers: Option<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeSection {
    pub listen_port: u16,
    pub results_dir: PathBuf,
    pub workers: usize,
}

impl Default for NodeSection {
    fn default() -> Self {
        Self {
            listen_port: 7070,
            results_dir: PathBuf::from("results"),
            workers: default_workers(),
        }
    }
}

fn default_workers() -> usize {
    std::thread::available_parallelism().map(|n| n.get()).unwrap_or(4)
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct NetworkSection {
    /// Parent address as host:port. `None` makes this node the root.
    pub parent: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueSection {
    /// Console commands waiting for the node loop.
    pub commands: usize,
    /// Worker answers waiting for the node loop.
    pub results: usize,
}

impl Default for QueueSection {
    fn default() -> Self {
        Self { commands: 8, results: 128 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct NodeConfig {
    pub node: NodeSection,
    pub network: NetworkSection,
    pub queues: QueueSection,
}

impl NodeConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;
        let cfg: NodeConfig = toml::from_str(&raw)
            .with_context(|| format!("parsing config file {}", path.display()))?;
        Ok(cfg)
    }

    /// Load the file if given, otherwise start from defaults, then apply flags.
    pub fn from_cli(cli: &Cli) -> Result<Self> {
        let mut cfg = match &cli.config {
            Some(path) => Self::load(path)?,
            None => Self::default(),
        };
        if let Some(port) = cli.listen_port {
            cfg.node.listen_port = port;
        }
        if let Some(dir) = &cli.results_dir {
            cfg.node.results_dir = dir.clone();
        }
        if let Some(parent) = &cli.parent {
            cfg.network.parent = Some(parent.clone());
        }
        if let Some(workers) = cli.workers {
            cfg.node.workers = workers.max(1);
        }
        Ok(cfg)
    }

    /// Resolve the configured parent to an IPv4 socket address.
    ///
    /// The wire format for rejoin redirection only carries IPv4, so an
    /// address that resolves exclusively to IPv6 is rejected up front.
    pub fn parent_addr(&self) -> Result<Option<SocketAddrV4>> {
        let Some(spec) = &self.network.parent else {
            return Ok(None);
        };
        let addrs = spec
            .to_socket_addrs()
            .with_context(|| format!("resolving parent address {spec}"))?;
        for addr in addrs {
            if let SocketAddr::V4(v4) = addr {
                return Ok(Some(v4));
            }
        }
        bail!("parent address {spec} did not resolve to an IPv4 address");
    }
}
