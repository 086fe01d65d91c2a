//! Fixed pool of worker tasks running checker computations.
//!
//! Ranges arrive on a shared queue; each value produces one answer on
//! the bounded results channel. When the node loop falls behind, the
//! send blocks and the whole pool slows down instead of piling up
//! answers in memory. Checkers are synchronous and free to burn CPU or
//! sleep, so each range runs on a dedicated blocking thread rather
//! than on the runtime the node loop shares.

use std::sync::Arc;

use canopy_checker::Checker;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, trace, warn};

/// A contiguous range of values to run through one checker.
pub struct WorkUnit {
    pub job_id: i64,
    pub checker: Arc<dyn Checker>,
    /// Inclusive.
    pub start: i64,
    /// Exclusive.
    pub end: i64,
}

/// One computed value, headed for the node loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Answer {
    pub job_id: i64,
    pub value: i64,
    pub result: String,
}

/// Spawn `count` workers draining a shared work queue.
///
/// Returns the submission handle. The pool winds down once every clone
/// of the handle is dropped and the queue is drained.
pub fn spawn_workers(count: usize, results_tx: mpsc::Sender<Answer>) -> mpsc::UnboundedSender<WorkUnit> {
    let (work_tx, work_rx) = mpsc::unbounded_channel::<WorkUnit>();
    let work_rx = Arc::new(Mutex::new(work_rx));
    for worker in 0..count {
        let work_rx = Arc::clone(&work_rx);
        let results_tx = results_tx.clone();
        tokio::spawn(async move {
            loop {
                let unit = {
                    let mut rx = work_rx.lock().await;
                    rx.recv().await
                };
                let Some(unit) = unit else {
                    debug!(worker, "pool: queue closed, worker exiting");
                    return;
                };
                trace!(worker, job_id = unit.job_id, start = unit.start, end = unit.end, "pool: range picked up");
                let results = results_tx.clone();
                let outcome = tokio::task::spawn_blocking(move || {
                    for value in unit.start..unit.end {
                        let result = unit.checker.check(value);
                        let answer = Answer { job_id: unit.job_id, value, result };
                        if results.blocking_send(answer).is_err() {
                            return false;
                        }
                    }
                    true
                })
                .await;
                match outcome {
                    Ok(true) => {}
                    Ok(false) => return,
                    Err(err) => warn!(worker, %err, "pool: checker thread failed"),
                }
            }
        });
    }
    work_tx
}
