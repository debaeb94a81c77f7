use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::batch::{Batch, BatchAllocator};
use crate::context::JoinContext;
use crate::errors::{ExecError, Result};
use crate::exec::BatchSource;
use crate::spill::SpillCoordinator;
use crate::util::cancel::CancelSignal;
use crate::util::wait_group::{WaitGroup, WaitToken};

/// The row table construction stage, supplied by the caller.
///
/// Consumes build-output batches in whatever order the workers produce
/// them; nothing is observed from the stage beyond the batches being
/// drained. The pipeline recycles each batch container after `consume`
/// returns, so implementations copy rows into their own storage.
/// `num_rows` backs the empty-build check in the build/probe handshake.
pub trait RowTableBuilder: Send {
    fn consume(&mut self, batch: &Batch);

    fn num_rows(&self) -> usize;
}

/// A build-output batch paired with its drain-barrier token.
///
/// The consumer dropping the message is the barrier decrement, so a spill
/// waiting for zero observes no batch still being consumed.
#[derive(Debug)]
pub(crate) struct TrackedBatch {
    pub batch: Batch,
    pub _token: WaitToken,
}

/// Handles to a running pool of build workers.
pub(crate) struct BuildPool {
    pub out_rx: mpsc::Receiver<TrackedBatch>,
    pub err_rx: mpsc::Receiver<ExecError>,
    /// Stops the hand-off of further batches without cancelling the join.
    pub stop: CancelSignal,
    pub handles: Vec<JoinHandle<()>>,
}

/// Spawn `workers` build workers pulling from a shared build input.
///
/// `syncer` is the drain barrier: one token per batch in flight between a
/// worker and the row table builder. Callers that spill must pass the same
/// group to their spill instrumentation if they want to observe it.
pub(crate) fn spawn_build_workers(
    ctx: Arc<JoinContext>,
    source: Box<dyn BatchSource>,
    alloc: Arc<BatchAllocator>,
    spill: Arc<dyn SpillCoordinator>,
    syncer: WaitGroup,
    workers: usize,
) -> BuildPool {
    let (out_tx, out_rx) = mpsc::channel(workers);
    // Room for one input/spill error plus one final-spill error per worker.
    let (err_tx, err_rx) = mpsc::channel(workers * 2);
    let stop = CancelSignal::new();
    let source = Arc::new(Mutex::new(source));

    let handles = (0..workers)
        .map(|id| {
            let worker = BuildWorker {
                id,
                ctx: ctx.clone(),
                source: source.clone(),
                alloc: alloc.clone(),
                spill: spill.clone(),
                syncer: syncer.clone(),
                stop: stop.clone(),
                out_tx: out_tx.clone(),
                err_tx: err_tx.clone(),
            };
            worker.spawn()
        })
        .collect();

    BuildPool {
        out_rx,
        err_rx,
        stop,
        handles,
    }
}

struct BuildWorker {
    id: usize,
    ctx: Arc<JoinContext>,
    source: Arc<Mutex<Box<dyn BatchSource>>>,
    alloc: Arc<BatchAllocator>,
    spill: Arc<dyn SpillCoordinator>,
    syncer: WaitGroup,
    stop: CancelSignal,
    out_tx: mpsc::Sender<TrackedBatch>,
    err_tx: mpsc::Sender<ExecError>,
}

impl BuildWorker {
    fn spawn(self) -> JoinHandle<()> {
        let err_tx = self.err_tx.clone();
        tokio::spawn(async move {
            // A panic drops the worker (and with it the output sender)
            // immediately; the payload still travels the error queue.
            if let Err(payload) = AssertUnwindSafe(self.run()).catch_unwind().await {
                let err = ExecError::from_panic(payload);
                if err_tx.try_send(err).is_err() {
                    warn!("dropping build worker panic, error queue full");
                }
            }
        })
    }

    async fn run(self) {
        let ctx = self.ctx.clone();
        let mut had_error = false;

        loop {
            if let Err(err) = self.check_and_spill_row_table().await {
                had_error = true;
                self.send_err(err);
                break;
            }

            if ctx.is_finished() {
                break;
            }

            let mut batch = self.alloc.alloc();
            let fetched = tokio::select! {
                _ = ctx.closed() => break,
                res = self.fetch_next(&mut batch) => res,
            };
            if let Err(err) = fetched {
                had_error = true;
                self.send_err(err);
                break;
            }
            ctx.mem_tracker().consume(batch.mem_bytes() as i64);

            if batch.is_empty() {
                // Build input exhausted.
                break;
            }

            // Mint the drain token before the hand-off; losing the race to
            // stop or close drops it without forwarding the batch.
            let tracked = TrackedBatch {
                batch,
                _token: self.syncer.token(),
            };
            tokio::select! {
                _ = self.stop.cancelled() => break,
                _ = ctx.closed() => break,
                res = self.out_tx.send(tracked) => {
                    if res.is_err() {
                        break;
                    }
                }
            }
        }

        // End-of-build path. If any spill happened during the run, rows
        // accumulated since then are still only in memory; push them out
        // once nothing is in flight. The output sender must stay alive
        // until after this final spill, so the builder can't mistake a
        // closed queue for a fully resident build.
        if !had_error && self.spill.spill_triggered() {
            tokio::select! {
                _ = ctx.closed() => {}
                _ = self.syncer.wait_zero() => {
                    debug!(worker = self.id, "spilling remaining build rows");
                    if let Err(err) = self.spill.spill_remaining_rows().await {
                        self.send_err(err);
                    }
                }
            }
        }
    }

    async fn fetch_next(&self, batch: &mut Batch) -> Result<()> {
        let mut source = self.source.lock().await;
        source.next(batch).await
    }

    /// Spill the row table when the coordinator asks for it, strictly
    /// after the drain barrier reaches zero.
    async fn check_and_spill_row_table(&self) -> Result<()> {
        if !self.spill.spill_needed() {
            return Ok(());
        }
        tokio::select! {
            _ = self.ctx.closed() => return Ok(()),
            _ = self.syncer.wait_zero() => {}
        }
        debug!(worker = self.id, "spilling row table");
        self.spill.spill_row_table().await
    }

    fn send_err(&self, err: ExecError) {
        if self.err_tx.try_send(err).is_err() {
            warn!(worker = self.id, "dropping build error, queue full");
        }
    }
}
