//! The node loop: accepts links, tracks potential, routes packets to
//! the job registry and drives the departure handshake.
//!
//! Exactly one task mutates node state. Link tasks, workers, the
//! console and artifact fetches all talk to it over channels.

use std::collections::HashMap;
use std::net::{SocketAddr, SocketAddrV4};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use canopy_checker::{BuiltinResolver, CheckerResolver, FetchError};
use canopy_protocol::Packet;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::NodeConfig;
use crate::jobs::{JobCtx, JobId, JobRegistry, JobStatus};
use crate::link::{self, Link, LinkEvent, LinkId};
use crate::worker::{self, Answer, WorkUnit};

// ============================================================================
// Commands and status
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DebugCode {
    Potential,
    Id,
}

/// Operator commands, from the console or the test harness.
#[derive(Debug)]
pub enum NodeCommand {
    Start {
        artifact_url: String,
        entry_point: String,
        start: i64,
        end: i64,
        output: PathBuf,
    },
    Disconnect,
    Debug(DebugCode),
    Cache(bool),
    /// Snapshot of node state, answered on the carried channel.
    Inspect(oneshot::Sender<NodeStatus>),
}

#[derive(Debug, Clone)]
pub struct LinkStatus {
    pub id: LinkId,
    pub peer_addr: SocketAddr,
    pub remote_app_id: Option<i32>,
    pub potential: i32,
    pub is_parent: bool,
    pub connected: bool,
    pub leaving: bool,
}

#[derive(Debug, Clone)]
pub struct NodeStatus {
    pub app_id: i32,
    pub listen_addr: SocketAddr,
    pub potential: i32,
    pub leaving: bool,
    pub links: Vec<LinkStatus>,
    pub jobs: Vec<JobStatus>,
}

// ============================================================================
// Handle
// ============================================================================

/// Running node, as seen from outside the loop.
pub struct NodeHandle {
    pub app_id: i32,
    pub listen_addr: SocketAddr,
    pub commands: mpsc::Sender<NodeCommand>,
    shutdown: broadcast::Sender<()>,
    pub task: JoinHandle<()>,
}

impl NodeHandle {
    /// Ask the loop to stop. Idempotent.
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(());
    }

    pub fn subscribe_shutdown(&self) -> broadcast::Receiver<()> {
        self.shutdown.subscribe()
    }

    /// Round-trip a status snapshot through the command channel.
    pub async fn inspect(&self) -> Option<NodeStatus> {
        let (tx, rx) = oneshot::channel();
        self.commands.send(NodeCommand::Inspect(tx)).await.ok()?;
        rx.await.ok()
    }
}

/// Bind the listener, start the worker pool and the loop task.
pub async fn spawn(cfg: NodeConfig) -> Result<NodeHandle> {
    let parent_addr = cfg.parent_addr()?;
    std::fs::create_dir_all(&cfg.node.results_dir)
        .with_context(|| format!("creating results dir {}", cfg.node.results_dir.display()))?;
    let artifacts_dir = cfg.node.results_dir.join("_artifacts");
    std::fs::create_dir_all(&artifacts_dir)?;

    let listener = TcpListener::bind(("0.0.0.0", cfg.node.listen_port))
        .await
        .with_context(|| format!("binding listen port {}", cfg.node.listen_port))?;
    let listen_addr = listener.local_addr()?;
    let app_id = crate::derive_app_id(listen_addr);

    let (event_tx, event_rx) = mpsc::channel::<LinkEvent>(1024);
    let (cmd_tx, cmd_rx) = mpsc::channel::<NodeCommand>(cfg.queues.commands);
    let (results_tx, results_rx) = mpsc::channel::<Answer>(cfg.queues.results);
    let (fetch_tx, fetch_rx) = mpsc::channel::<(JobId, Result<PathBuf, FetchError>)>(16);
    let (shutdown_tx, shutdown_rx) = broadcast::channel::<()>(1);

    let work_tx = worker::spawn_workers(cfg.node.workers, results_tx);

    let mut reactor = Reactor {
        app_id,
        listen_addr,
        results_dir: cfg.node.results_dir.clone(),
        artifacts_dir,
        listener,
        links: HashMap::new(),
        next_link: 1,
        potential: 1,
        parent_link: None,
        parent_addr,
        jobs: JobRegistry::new(),
        reroute: HashMap::new(),
        parked: HashMap::new(),
        leaving: false,
        pending_acks: 0,
        resolver: Arc::new(BuiltinResolver::new()),
        reuse_artifacts: true,
        work_tx,
        event_tx: event_tx.clone(),
        fetch_tx,
        shutdown: shutdown_tx.clone(),
    };

    if let Some(parent) = parent_addr {
        reactor.dial_parent(SocketAddr::V4(parent), None);
    }

    info!(app_id, listen = %listen_addr, parent = ?parent_addr, workers = cfg.node.workers, "node: up");

    let task = tokio::spawn(async move {
        reactor.run(event_rx, cmd_rx, results_rx, fetch_rx, shutdown_rx).await;
    });

    Ok(NodeHandle { app_id, listen_addr, commands: cmd_tx, shutdown: shutdown_tx, task })
}

// ============================================================================
// The loop
// ============================================================================

struct Reactor {
    app_id: i32,
    listen_addr: SocketAddr,
    results_dir: PathBuf,
    artifacts_dir: PathBuf,
    listener: TcpListener,

    links: HashMap<LinkId, Link>,
    next_link: LinkId,
    /// 1 + sum of available link potentials.
    potential: i32,
    parent_link: Option<LinkId>,
    parent_addr: Option<SocketAddrV4>,

    jobs: JobRegistry,
    /// Departed peers' bookkeeping: remote identity -> job ids to
    /// re-home once a link from that identity shows up.
    reroute: HashMap<i32, Vec<JobId>>,
    /// Answers waiting for an upstream to come back.
    parked: HashMap<JobId, Vec<Packet>>,

    leaving: bool,
    pending_acks: usize,

    resolver: Arc<dyn CheckerResolver>,
    reuse_artifacts: bool,

    work_tx: mpsc::UnboundedSender<WorkUnit>,
    event_tx: mpsc::Sender<LinkEvent>,
    fetch_tx: mpsc::Sender<(JobId, Result<PathBuf, FetchError>)>,
    shutdown: broadcast::Sender<()>,
}

impl Reactor {
    async fn run(
        &mut self,
        mut event_rx: mpsc::Receiver<LinkEvent>,
        mut cmd_rx: mpsc::Receiver<NodeCommand>,
        mut results_rx: mpsc::Receiver<Answer>,
        mut fetch_rx: mpsc::Receiver<(JobId, Result<PathBuf, FetchError>)>,
        mut shutdown_rx: broadcast::Receiver<()>,
    ) {
        loop {
            tokio::select! {
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => self.on_accept(stream, peer),
                    Err(err) => warn!(%err, "net: accept failed"),
                },
                Some(event) = event_rx.recv() => {
                    if self.on_link_event(event) {
                        return;
                    }
                }
                Some(cmd) = cmd_rx.recv() => self.on_command(cmd),
                Some(answer) = results_rx.recv() => {
                    // Once leaving, unfinished tails were already handed
                    // back upstream; forwarding more local answers would
                    // double-count values.
                    if self.leaving {
                        continue;
                    }
                    let mut ctx = JobCtx {
                        links: &self.links,
                        work_tx: &self.work_tx,
                        parked: &mut self.parked,
                    };
                    self.jobs.handle_ans(answer.job_id, answer.value, answer.result, &mut ctx);
                }
                Some((job_id, outcome)) = fetch_rx.recv() => self.on_fetch_done(job_id, outcome),
                _ = shutdown_rx.recv() => {
                    info!("node: shutdown requested");
                    return;
                }
                else => return,
            }
        }
    }

    fn alloc_link(&mut self) -> LinkId {
        let id = self.next_link;
        self.next_link += 1;
        id
    }

    // ------------------------------------------------------------------
    // Topology
    // ------------------------------------------------------------------

    fn on_accept(&mut self, stream: TcpStream, peer: SocketAddr) {
        let id = self.alloc_link();
        let outbound = link::spawn_accepted(id, stream, peer, self.event_tx.clone());
        let l = Link::new(id, peer, outbound, false, true);
        // The greeting carries the tree as it was before this peer
        // joined: everything on our side of the new link.
        l.send(Packet::Init { potential: self.potential, sender: self.app_id });
        self.links.insert(id, l);
        info!(link = id, peer = %peer, "net: link accepted");
        self.recompute_potential();
        self.broadcast_updt(Some(id));
    }

    fn dial_parent(&mut self, addr: SocketAddr, bind_local: Option<SocketAddr>) -> LinkId {
        let id = self.alloc_link();
        let outbound = link::spawn_outbound(id, addr, bind_local, self.event_tx.clone());
        self.links.insert(id, Link::new(id, addr, outbound, true, false));
        self.parent_link = Some(id);
        id
    }

    fn recompute_potential(&mut self) {
        let fresh = 1 + self
            .links
            .values()
            .filter(|l| l.available())
            .map(|l| l.potential)
            .sum::<i32>();
        if fresh != self.potential {
            debug!(old = self.potential, new = fresh, "node: potential recomputed");
            self.potential = fresh;
        }
    }

    /// Tell every available link (minus `except`) what the tree looks
    /// like from its far side: our total minus its own contribution.
    fn broadcast_updt(&self, except: Option<LinkId>) {
        for l in self.links.values().filter(|l| l.available()) {
            if Some(l.id) == except {
                continue;
            }
            l.send(Packet::Updt { potential: self.potential - l.potential, sender: self.app_id });
        }
    }

    // ------------------------------------------------------------------
    // Link events
    // ------------------------------------------------------------------

    /// Returns true when the loop should stop.
    fn on_link_event(&mut self, event: LinkEvent) -> bool {
        match event {
            LinkEvent::Connected { link, local_addr, peer_addr } => {
                let Some(l) = self.links.get_mut(&link) else {
                    return false;
                };
                l.connected = true;
                l.local_addr = Some(local_addr);
                let is_parent = l.is_parent;
                info!(link, peer = %peer_addr, local = %local_addr, "net: link established");
                self.recompute_potential();
                if is_parent {
                    if let Some(l) = self.links.get(&link) {
                        l.send(Packet::Updt {
                            potential: self.potential - l.potential,
                            sender: self.app_id,
                        });
                    }
                    // Answers that queued up while the parent was away.
                    let waiting = self.jobs.with_upstream(link);
                    self.deliver_parked(&waiting);
                }
                false
            }
            LinkEvent::Packet { link, packet } => self.on_packet(link, packet),
            LinkEvent::Closed { link, error } => {
                self.on_closed(link, error);
                false
            }
        }
    }

    fn on_packet(&mut self, link: LinkId, packet: Packet) -> bool {
        if !self.links.contains_key(&link) {
            return false;
        }
        match packet {
            Packet::Init { potential, sender } | Packet::Updt { potential, sender } => {
                self.on_potential(link, potential, sender);
            }
            Packet::Req { job_id, artifact_url, entry_point, start, end } => {
                self.on_req(link, job_id, artifact_url, entry_point, start, end);
            }
            Packet::Acc { job_id, start, end } => self.jobs.handle_acc(job_id, start, end),
            Packet::Ref { job_id, start, end } => {
                let mut ctx = JobCtx {
                    links: &self.links,
                    work_tx: &self.work_tx,
                    parked: &mut self.parked,
                };
                self.jobs.handle_ref(job_id, start, end, &mut ctx);
            }
            Packet::Ans { job_id, value, result } => {
                let mut ctx = JobCtx {
                    links: &self.links,
                    work_tx: &self.work_tx,
                    parked: &mut self.parked,
                };
                self.jobs.handle_ans(job_id, value, result, &mut ctx);
            }
            Packet::Redi { new_parent } => self.on_redi(link, new_parent),
            Packet::Disc { expected_reconnects, jobs } => {
                self.on_disc(link, expected_reconnects, jobs);
            }
            Packet::OkDisc => return self.on_ok_disc(link),
        }
        false
    }

    fn on_potential(&mut self, link: LinkId, value: i32, sender: i32) {
        let Some(l) = self.links.get_mut(&link) else {
            return;
        };
        l.potential = value;
        let learned = l.remote_app_id != Some(sender);
        l.remote_app_id = Some(sender);
        self.recompute_potential();
        self.broadcast_updt(Some(link));
        if learned {
            debug!(link, remote_app_id = sender, "net: peer identified");
            if let Some(ids) = self.reroute.remove(&sender) {
                let swapped = self.jobs.reroute(&ids, link);
                info!(link, remote_app_id = sender, jobs = swapped.len(), "node: rerouted jobs onto returning peer");
                self.deliver_parked(&swapped);
            }
        }
    }

    fn on_req(
        &mut self,
        link: LinkId,
        job_id: JobId,
        artifact_url: String,
        entry_point: String,
        start: i64,
        end: i64,
    ) {
        if self.leaving {
            debug!(job_id, "node: REQ while leaving ignored");
            return;
        }
        if self.jobs.contains(job_id) {
            warn!(job_id, "node: REQ with colliding job id refused");
            if let Some(l) = self.links.get(&link) {
                l.send(Packet::Ref { job_id, start, end });
            }
            return;
        }
        info!(job_id, link, start, end, entry_point = %entry_point, "node: range offered to us");
        self.jobs
            .insert_downstream(job_id, artifact_url.clone(), entry_point, start, end, link);
        self.spawn_fetch(job_id, artifact_url);
    }

    // ------------------------------------------------------------------
    // Departure, both sides
    // ------------------------------------------------------------------

    fn on_redi(&mut self, link: LinkId, new_parent: SocketAddrV4) {
        let Some(l) = self.links.get_mut(&link) else {
            return;
        };
        info!(link, new_parent = %new_parent, "node: peer leaving, redirected");
        l.send(Packet::OkDisc);
        l.leaving = true;
        l.pending_leave = Some(Packet::Redi { new_parent });
        self.recompute_potential();
        self.broadcast_updt(Some(link));
    }

    fn on_disc(&mut self, link: LinkId, expected_reconnects: i32, jobs: Vec<canopy_protocol::DiscJob>) {
        let Some(l) = self.links.get_mut(&link) else {
            return;
        };
        info!(link, expected_reconnects, reroutes = jobs.len(), "node: child link leaving");
        l.send(Packet::OkDisc);
        l.leaving = true;
        for entry in jobs {
            self.reroute.entry(entry.new_upstream).or_default().push(entry.job_id);
        }
        self.recompute_potential();
        self.broadcast_updt(Some(link));
    }

    fn on_ok_disc(&mut self, link: LinkId) -> bool {
        if !self.leaving {
            warn!(link, "node: unexpected OK_DISC");
            return false;
        }
        self.pending_acks = self.pending_acks.saturating_sub(1);
        debug!(link, remaining = self.pending_acks, "node: departure acknowledged");
        if self.pending_acks == 0 {
            info!("node: all peers acknowledged, closing links and shutting down");
            self.links.clear();
            let _ = self.shutdown.send(());
            return true;
        }
        false
    }

    fn begin_leave(&mut self) {
        let Some(parent) = self.parent_link else {
            warn!("node: the root cannot disconnect");
            return;
        };
        if self.leaving {
            return;
        }
        let Some(parent_addr) = self.parent_addr else {
            warn!("node: parent address unknown, cannot leave");
            return;
        };
        if !self.links.get(&parent).map(Link::available).unwrap_or(false) {
            warn!("node: parent link not ready, cannot leave");
            return;
        }

        let available: Vec<LinkId> = self
            .links
            .values()
            .filter(|l| l.available())
            .map(|l| l.id)
            .collect();
        let expected_reconnects = (available.len() - 1) as i32;
        let entries = self.jobs.disc_entries(parent, &self.links);
        self.jobs.cancel_unfinished(&self.links);

        info!(
            expected_reconnects,
            reroutes = entries.len(),
            peers = available.len(),
            "node: leaving the tree"
        );
        for &id in &available {
            let Some(l) = self.links.get(&id) else { continue };
            if id == parent {
                l.send(Packet::Disc { expected_reconnects, jobs: entries.clone() });
            } else {
                l.send(Packet::Redi { new_parent: parent_addr });
            }
        }
        self.leaving = true;
        self.pending_acks = available.len();
    }

    fn on_closed(&mut self, link: LinkId, error: Option<String>) {
        let Some(l) = self.links.remove(&link) else {
            return;
        };
        match (&error, l.leaving) {
            (_, true) => info!(link, peer = %l.peer_addr, "net: departed peer closed"),
            (Some(err), false) => warn!(link, peer = %l.peer_addr, %err, "net: link lost"),
            (None, false) => info!(link, peer = %l.peer_addr, "net: link closed by peer"),
        }

        if l.is_parent && self.parent_link == Some(link) {
            self.parent_link = None;
            if let Some(Packet::Redi { new_parent }) = l.pending_leave {
                // Re-attach where the old parent pointed us, from the
                // same local address it knew us by.
                let new_id = self.dial_parent(SocketAddr::V4(new_parent), l.local_addr);
                self.parent_addr = Some(new_parent);
                let swapped = self.jobs.swap_upstream(link, new_id);
                info!(
                    old_link = link,
                    new_link = new_id,
                    new_parent = %new_parent,
                    jobs = swapped.len(),
                    "node: re-attaching to new parent"
                );
            }
        }
        self.recompute_potential();
        self.broadcast_updt(None);
    }

    /// Replay parked answers for the given jobs through the normal
    /// answer path. Still-unreachable ones park again.
    fn deliver_parked(&mut self, ids: &[JobId]) {
        for &id in ids {
            let Some(packets) = self.parked.remove(&id) else {
                continue;
            };
            debug!(job_id = id, count = packets.len(), "node: replaying parked answers");
            for packet in packets {
                if let Packet::Ans { job_id, value, result } = packet {
                    let mut ctx = JobCtx {
                        links: &self.links,
                        work_tx: &self.work_tx,
                        parked: &mut self.parked,
                    };
                    self.jobs.handle_ans(job_id, value, result, &mut ctx);
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Commands and fetches
    // ------------------------------------------------------------------

    fn on_command(&mut self, cmd: NodeCommand) {
        match cmd {
            NodeCommand::Start { artifact_url, entry_point, start, end, output } => {
                if self.leaving {
                    warn!("node: START while leaving ignored");
                    return;
                }
                if start > end || end.checked_sub(start).is_none() {
                    warn!(start, end, "node: unusable range, START ignored");
                    return;
                }
                let mut job_id = (rand::random::<u64>() >> 1) as i64;
                while self.jobs.contains(job_id) {
                    job_id = (rand::random::<u64>() >> 1) as i64;
                }
                let output = if output.is_absolute() {
                    output
                } else {
                    self.results_dir.join(output)
                };
                info!(job_id, start, end, entry_point = %entry_point, output = %output.display(), "node: job started");
                self.jobs.insert_upstream(
                    job_id,
                    artifact_url.clone(),
                    entry_point,
                    start,
                    end,
                    output,
                );
                self.spawn_fetch(job_id, artifact_url);
            }
            NodeCommand::Disconnect => self.begin_leave(),
            NodeCommand::Debug(DebugCode::Potential) => {
                println!("potential: {}", self.potential);
                for l in self.links.values() {
                    println!(
                        "  link {} peer={} remote_id={:?} potential={} parent={} available={}",
                        l.id, l.peer_addr, l.remote_app_id, l.potential, l.is_parent, l.available()
                    );
                }
            }
            NodeCommand::Debug(DebugCode::Id) => {
                println!("app id: {}", self.app_id);
            }
            NodeCommand::Cache(enabled) => {
                info!(enabled, "node: artifact cache toggled");
                self.resolver.set_cache_enabled(enabled);
                self.reuse_artifacts = enabled;
            }
            NodeCommand::Inspect(tx) => {
                let _ = tx.send(self.status());
            }
        }
    }

    fn on_fetch_done(&mut self, job_id: JobId, outcome: Result<PathBuf, FetchError>) {
        let Some(entry_point) = self.jobs.entry_point(job_id) else {
            debug!(job_id, "node: fetch finished for forgotten job");
            return;
        };
        let resolved = outcome
            .map_err(|e| e.to_string())
            .and_then(|path| self.resolver.resolve(&path, &entry_point).map_err(|e| e.to_string()));
        let mut ctx = JobCtx {
            links: &self.links,
            work_tx: &self.work_tx,
            parked: &mut self.parked,
        };
        match resolved {
            Ok(checker) => self.jobs.activate(job_id, checker, &mut ctx),
            Err(reason) => self.jobs.fail_fetch(job_id, &reason, &mut ctx),
        }
    }

    fn spawn_fetch(&self, job_id: JobId, artifact_url: String) {
        let tx = self.fetch_tx.clone();
        let dir = self.artifacts_dir.clone();
        let reuse = self.reuse_artifacts;
        tokio::spawn(async move {
            let outcome = canopy_checker::fetch_artifact(&artifact_url, &dir, reuse).await;
            let _ = tx.send((job_id, outcome)).await;
        });
    }

    fn status(&self) -> NodeStatus {
        let mut links: Vec<LinkStatus> = self
            .links
            .values()
            .map(|l| LinkStatus {
                id: l.id,
                peer_addr: l.peer_addr,
                remote_app_id: l.remote_app_id,
                potential: l.potential,
                is_parent: l.is_parent,
                connected: l.connected,
                leaving: l.leaving,
            })
            .collect();
        links.sort_by_key(|l| l.id);
        NodeStatus {
            app_id: self.app_id,
            listen_addr: self.listen_addr,
            potential: self.potential,
            leaving: self.leaving,
            links,
            jobs: self.jobs.statuses(),
        }
    }
}
