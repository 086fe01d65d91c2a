//! Job registry and the two per-job roles.
//!
//! A job this node started is `Upstream`: it collects every answer into
//! an output sink. A job admitted over the wire is `Downstream`: every
//! answer flows back to the link it came from. Both sides slice their
//! range over the tree with [`plan_distribution`] and keep what is left.

use std::collections::HashMap;
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use canopy_checker::Checker;
use canopy_protocol::{DiscJob, Packet};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::link::{Link, LinkId};
use crate::worker::WorkUnit;

// ============================================================================
// Distribution planning
// ============================================================================

fn ceil_div(n: i64, d: i64) -> i64 {
    if n == 0 {
        0
    } else {
        (n - 1) / d + 1
    }
}

/// How one range gets split between this node and its peers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DistributionPlan {
    /// Values handed out per unit of potential.
    pub slice: i64,
    /// Ranges this node computes itself (claim plus any remainder).
    pub local: Vec<(i64, i64)>,
    /// Ranges offered to peers, weighted by their advertised potential.
    pub offers: Vec<(LinkId, i64, i64)>,
}

/// Split `[start, end)` between this node (weight 1) and `peers`.
///
/// The returned ranges cover the input exactly once: the local claim
/// comes first, peers follow in the given order, and whatever the
/// weighted slices do not reach stays local.
pub fn plan_distribution(start: i64, end: i64, peers: &[(LinkId, i32)]) -> DistributionPlan {
    // Callers reject ranges whose width does not fit i64 before planning.
    let total = end.checked_sub(start).filter(|w| *w >= 0).unwrap_or(0);
    let weight_sum: i64 = 1 + peers.iter().map(|(_, p)| i64::from((*p).max(1))).sum::<i64>();
    let slice = ceil_div(total, weight_sum).max(1);

    let mut local = Vec::new();
    let mut offers = Vec::new();
    let mut cursor = start;
    let end = cursor.saturating_add(total);

    let claim_end = cursor.saturating_add(slice).min(end);
    if cursor < claim_end {
        local.push((cursor, claim_end));
        cursor = claim_end;
    }
    for (link, potential) in peers {
        if cursor >= end {
            break;
        }
        let give = slice
            .saturating_mul(i64::from((*potential).max(1)))
            .min(end - cursor);
        offers.push((*link, cursor, cursor + give));
        cursor += give;
    }
    if cursor < end {
        local.push((cursor, end));
    }
    DistributionPlan { slice, local, offers }
}

// ============================================================================
// Work ranges
// ============================================================================

/// One contiguous range this node owns, with a high-water mark of the
/// answers already sent on. The tail past the mark is what a leaving
/// node hands back to its upstream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkRange {
    pub start: i64,
    pub end: i64,
    /// First value whose answer has not been sent on. Stays in
    /// `[start, end]` so it never wraps at the i64 edges.
    next_unsent: i64,
}

impl WorkRange {
    pub fn new(start: i64, end: i64) -> Self {
        Self { start, end, next_unsent: start }
    }

    /// Advance the high-water mark if `value` belongs to this range.
    pub fn record(&mut self, value: i64) -> bool {
        if value < self.start || value >= self.end {
            return false;
        }
        if value >= self.next_unsent {
            self.next_unsent = value + 1;
        }
        true
    }

    /// The part of the range not yet answered, if any.
    pub fn unfinished_tail(&self) -> Option<(i64, i64)> {
        if self.next_unsent < self.end {
            Some((self.next_unsent, self.end))
        } else {
            None
        }
    }

    /// Mark the whole range as dealt with, so a second cancellation
    /// pass produces nothing.
    pub fn exhaust(&mut self) {
        self.next_unsent = self.end;
    }
}

// ============================================================================
// Output sinks
// ============================================================================

/// Where an originating job's answers end up, one line each.
pub trait OutputSink: Send {
    fn append_line(&mut self, line: &str) -> io::Result<()>;
    fn close(&mut self) -> io::Result<()>;
}

pub struct FileSink {
    inner: BufWriter<File>,
}

impl FileSink {
    pub fn create(path: &Path) -> io::Result<Self> {
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        Ok(Self { inner: BufWriter::new(File::create(path)?) })
    }
}

impl OutputSink for FileSink {
    fn append_line(&mut self, line: &str) -> io::Result<()> {
        self.inner.write_all(line.as_bytes())?;
        self.inner.write_all(b"\n")
    }

    fn close(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

// ============================================================================
// Jobs
// ============================================================================

pub type JobId = i64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    /// Artifact fetch and checker resolution in flight.
    Fetching,
    Running,
    Finished,
}

pub enum JobRole {
    /// This node started the job and owns the output.
    Upstream {
        sink: Option<Box<dyn OutputSink>>,
        output_path: PathBuf,
    },
    /// The job arrived over `upstream`; answers flow back there.
    Downstream { upstream: LinkId },
}

pub struct Job {
    pub id: JobId,
    pub artifact_url: String,
    pub entry_point: String,
    pub start: i64,
    pub end: i64,
    pub state: JobState,
    /// Answers seen so far, local and delegated alike.
    pub answered: i64,
    pub ranges: Vec<WorkRange>,
    checker: Option<Arc<dyn Checker>>,
    pub role: JobRole,
}

impl Job {
    pub fn total(&self) -> i64 {
        self.end - self.start
    }

    fn note_value(&mut self, value: i64) {
        for range in &mut self.ranges {
            if range.record(value) {
                return;
            }
        }
    }
}

/// Flat view of one job for the console and the test harness.
#[derive(Debug, Clone)]
pub struct JobStatus {
    pub id: JobId,
    pub role: &'static str,
    pub state: JobState,
    pub answered: i64,
    pub total: i64,
}

/// What the registry needs from the node loop to act on a job event.
pub struct JobCtx<'a> {
    pub links: &'a HashMap<LinkId, Link>,
    pub work_tx: &'a mpsc::UnboundedSender<WorkUnit>,
    /// Answers that could not reach an unavailable upstream, per job.
    pub parked: &'a mut HashMap<JobId, Vec<Packet>>,
}

// ============================================================================
// Registry
// ============================================================================

#[derive(Default)]
pub struct JobRegistry {
    jobs: HashMap<JobId, Job>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, id: JobId) -> bool {
        self.jobs.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    pub fn statuses(&self) -> Vec<JobStatus> {
        let mut out: Vec<JobStatus> = self
            .jobs
            .values()
            .map(|job| JobStatus {
                id: job.id,
                role: match job.role {
                    JobRole::Upstream { .. } => "upstream",
                    JobRole::Downstream { .. } => "downstream",
                },
                state: job.state,
                answered: job.answered,
                total: job.total(),
            })
            .collect();
        out.sort_by_key(|s| s.id);
        out
    }

    pub fn insert_upstream(
        &mut self,
        id: JobId,
        artifact_url: String,
        entry_point: String,
        start: i64,
        end: i64,
        output_path: PathBuf,
    ) {
        self.jobs.insert(
            id,
            Job {
                id,
                artifact_url,
                entry_point,
                start,
                end,
                state: JobState::Fetching,
                answered: 0,
                ranges: Vec::new(),
                checker: None,
                role: JobRole::Upstream { sink: None, output_path },
            },
        );
    }

    pub fn insert_downstream(
        &mut self,
        id: JobId,
        artifact_url: String,
        entry_point: String,
        start: i64,
        end: i64,
        upstream: LinkId,
    ) {
        self.jobs.insert(
            id,
            Job {
                id,
                artifact_url,
                entry_point,
                start,
                end,
                state: JobState::Fetching,
                answered: 0,
                ranges: Vec::new(),
                checker: None,
                role: JobRole::Downstream { upstream },
            },
        );
    }

    /// The artifact resolved: slice the range, queue local work, offer
    /// the rest over the tree, and (downstream) accept toward upstream.
    pub fn activate(&mut self, id: JobId, checker: Arc<dyn Checker>, ctx: &mut JobCtx<'_>) {
        let Some(job) = self.jobs.get_mut(&id) else {
            warn!(job_id = id, "jobs: activation for unknown job");
            return;
        };
        if job.state != JobState::Fetching {
            warn!(job_id = id, state = ?job.state, "jobs: duplicate activation ignored");
            return;
        }
        job.checker = Some(Arc::clone(&checker));

        let exclude = match job.role {
            JobRole::Downstream { upstream } => Some(upstream),
            JobRole::Upstream { .. } => None,
        };
        let mut peers: Vec<(LinkId, i32)> = ctx
            .links
            .values()
            .filter(|l| l.available() && Some(l.id) != exclude)
            .map(|l| (l.id, l.potential))
            .collect();
        peers.sort_by_key(|(id, _)| *id);

        let plan = plan_distribution(job.start, job.end, &peers);
        info!(
            job_id = id,
            slice = plan.slice,
            local = plan.local.len(),
            offers = plan.offers.len(),
            "jobs: distributing range"
        );
        for &(s, e) in &plan.local {
            job.ranges.push(WorkRange::new(s, e));
            let _ = ctx.work_tx.send(WorkUnit {
                job_id: id,
                checker: Arc::clone(&checker),
                start: s,
                end: e,
            });
        }
        for &(link, s, e) in &plan.offers {
            if let Some(l) = ctx.links.get(&link) {
                l.send(Packet::Req {
                    job_id: id,
                    artifact_url: job.artifact_url.clone(),
                    entry_point: job.entry_point.clone(),
                    start: s,
                    end: e,
                });
            }
        }

        match &mut job.role {
            JobRole::Upstream { sink, output_path } => match FileSink::create(output_path) {
                Ok(file) => *sink = Some(Box::new(file)),
                Err(err) => {
                    warn!(job_id = id, path = %output_path.display(), %err, "jobs: cannot open output, abandoning job");
                    self.jobs.remove(&id);
                    return;
                }
            },
            JobRole::Downstream { upstream } => {
                if let Some(l) = ctx.links.get(upstream) {
                    l.send(Packet::Acc { job_id: id, start: job.start, end: job.end });
                }
            }
        }
        job.state = JobState::Running;
    }

    /// The artifact could not be fetched or resolved. A downstream job
    /// hands its whole range back; an originating job is abandoned.
    pub fn fail_fetch(&mut self, id: JobId, reason: &str, ctx: &mut JobCtx<'_>) {
        let Some(job) = self.jobs.remove(&id) else {
            return;
        };
        match job.role {
            JobRole::Downstream { upstream } => {
                warn!(job_id = id, reason, "jobs: artifact unusable, refusing range");
                if let Some(l) = ctx.links.get(&upstream) {
                    l.send(Packet::Ref { job_id: id, start: job.start, end: job.end });
                }
            }
            JobRole::Upstream { .. } => {
                warn!(job_id = id, reason, "jobs: artifact unusable, abandoning job");
            }
        }
    }

    pub fn handle_acc(&self, id: JobId, start: i64, end: i64) {
        if self.jobs.contains_key(&id) {
            debug!(job_id = id, start, end, "jobs: range accepted by peer");
        } else {
            debug!(job_id = id, "jobs: ACC for unknown job dropped");
        }
    }

    /// A peer refused a range: take it back and compute it here.
    pub fn handle_ref(&mut self, id: JobId, start: i64, end: i64, ctx: &mut JobCtx<'_>) {
        let Some(job) = self.jobs.get_mut(&id) else {
            debug!(job_id = id, "jobs: REF for unknown job dropped");
            return;
        };
        if job.state != JobState::Running {
            debug!(job_id = id, state = ?job.state, "jobs: REF outside running state dropped");
            return;
        }
        let Some(checker) = job.checker.clone() else {
            warn!(job_id = id, "jobs: REF but no checker");
            return;
        };
        if start >= end {
            return;
        }
        info!(job_id = id, start, end, "jobs: range refused, reclaiming locally");
        job.ranges.push(WorkRange::new(start, end));
        let _ = ctx.work_tx.send(WorkUnit { job_id: id, checker, start, end });
    }

    /// One computed value, from the local pool or a child link. Both
    /// take the same path.
    pub fn handle_ans(&mut self, id: JobId, value: i64, result: String, ctx: &mut JobCtx<'_>) {
        let Some(job) = self.jobs.get_mut(&id) else {
            debug!(job_id = id, value, "jobs: answer for unknown job dropped");
            return;
        };
        if job.state != JobState::Running {
            debug!(job_id = id, value, state = ?job.state, "jobs: late answer dropped");
            return;
        }
        match &mut job.role {
            JobRole::Upstream { sink, output_path } => {
                if let Some(s) = sink.as_mut() {
                    if let Err(err) = s.append_line(&format!("{value} {result}")) {
                        warn!(job_id = id, path = %output_path.display(), %err, "jobs: output write failed");
                    }
                }
                for range in &mut job.ranges {
                    if range.record(value) {
                        break;
                    }
                }
                job.answered += 1;
                if job.answered >= job.end - job.start {
                    if let Some(mut s) = sink.take() {
                        if let Err(err) = s.close() {
                            warn!(job_id = id, %err, "jobs: output close failed");
                        }
                    }
                    job.state = JobState::Finished;
                    info!(job_id = id, answers = job.answered, path = %output_path.display(), "jobs: job complete");
                }
            }
            JobRole::Downstream { upstream } => {
                match ctx.links.get(upstream) {
                    Some(l) if l.available() => {
                        l.send(Packet::Ans { job_id: id, value, result });
                        job.note_value(value);
                        job.answered += 1;
                        if job.answered >= job.total() {
                            job.state = JobState::Finished;
                            info!(job_id = id, answers = job.answered, "jobs: delegated job complete");
                        }
                    }
                    _ => {
                        debug!(job_id = id, value, "jobs: upstream unavailable, answer parked");
                        ctx.parked
                            .entry(id)
                            .or_default()
                            .push(Packet::Ans { job_id: id, value, result });
                    }
                }
            }
        }
    }

    pub fn entry_point(&self, id: JobId) -> Option<String> {
        self.jobs.get(&id).map(|j| j.entry_point.clone())
    }

    /// Downstream jobs currently answering to `link`.
    pub fn with_upstream(&self, link: LinkId) -> Vec<JobId> {
        let mut ids: Vec<JobId> = self
            .jobs
            .values()
            .filter(|j| matches!(j.role, JobRole::Downstream { upstream } if upstream == link))
            .map(|j| j.id)
            .collect();
        ids.sort_unstable();
        ids
    }

    /// Re-home every downstream job whose upstream was `old`. Used when
    /// a departed parent is replaced by a fresh link.
    pub fn swap_upstream(&mut self, old: LinkId, new: LinkId) -> Vec<JobId> {
        let mut swapped = Vec::new();
        for job in self.jobs.values_mut() {
            if let JobRole::Downstream { upstream } = &mut job.role {
                if *upstream == old {
                    *upstream = new;
                    swapped.push(job.id);
                }
            }
        }
        swapped.sort_unstable();
        swapped
    }

    /// Point the listed downstream jobs at `new`. Ids we do not track
    /// are skipped; the departed node listed them for someone else too.
    pub fn reroute(&mut self, ids: &[JobId], new: LinkId) -> Vec<JobId> {
        let mut swapped = Vec::new();
        for &id in ids {
            match self.jobs.get_mut(&id) {
                Some(job) => {
                    if let JobRole::Downstream { upstream } = &mut job.role {
                        *upstream = new;
                        swapped.push(id);
                    }
                }
                None => debug!(job_id = id, "jobs: reroute for untracked job skipped"),
            }
        }
        swapped
    }

    /// Departure bookkeeping: which downstream jobs answer to somebody
    /// other than `parent`, by that somebody's identity.
    pub fn disc_entries(&self, parent: LinkId, links: &HashMap<LinkId, Link>) -> Vec<DiscJob> {
        let mut entries = Vec::new();
        for job in self.jobs.values() {
            let JobRole::Downstream { upstream } = job.role else {
                continue;
            };
            if upstream == parent {
                continue;
            }
            match links.get(&upstream).and_then(|l| l.remote_app_id) {
                Some(new_upstream) => entries.push(DiscJob { job_id: job.id, new_upstream }),
                None => warn!(job_id = job.id, "jobs: upstream identity unknown, reroute entry dropped"),
            }
        }
        entries.sort_by_key(|e| e.job_id);
        entries
    }

    /// Hand every unfinished local tail back upstream. Safe to call
    /// more than once: cancelled tails are marked exhausted.
    pub fn cancel_unfinished(&mut self, links: &HashMap<LinkId, Link>) {
        for job in self.jobs.values_mut() {
            let JobRole::Downstream { upstream } = job.role else {
                continue;
            };
            for range in &mut job.ranges {
                if let Some((s, e)) = range.unfinished_tail() {
                    info!(job_id = job.id, start = s, end = e, "jobs: cancelling unfinished tail");
                    if let Some(l) = links.get(&upstream) {
                        l.send(Packet::Ref { job_id: job.id, start: s, end: e });
                    }
                    range.exhaust();
                }
            }
        }
    }
}
