use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::batch::{Batch, Row};
use crate::context::{JoinContext, WorkResult};
use crate::errors::{ExecError, Result};
use crate::resource::ProbeBatchResource;
use crate::util::wait_group::{WaitGroup, WaitToken};

/// The join matching algorithm, supplied by the caller.
///
/// Implementations hold whatever view of the row table they need; the
/// table is read-only by the time `probe` is first called, since the
/// fetcher releases no batch before build completion.
pub trait JoinProber: Send {
    /// Produce output rows for one probe batch.
    fn probe(&mut self, input: &Batch) -> Result<Vec<Row>>;

    /// Emit rows from this worker's slice of the row table after probing
    /// completes. Only invoked for join types that preserve unmatched
    /// build rows.
    fn scan_row_table(&mut self) -> Result<Vec<Row>> {
        Ok(Vec::new())
    }
}

/// One probe worker: consumes batches from its fan-out queue, runs the
/// prober, and emits result batches through the recycling result pipeline.
pub(crate) struct ProbeWorker {
    pub id: usize,
    pub ctx: Arc<JoinContext>,
    pub input_rx: mpsc::Receiver<Batch>,
    /// Returns consumed input buffers to the fetcher's pool.
    pub resource_tx: mpsc::Sender<ProbeBatchResource>,
    /// The consumer sends finished result batches back on this queue.
    pub recycle_tx: mpsc::Sender<Batch>,
    pub recycle_rx: mpsc::Receiver<Batch>,
    pub result_tx: mpsc::Sender<WorkResult>,
    /// Rendezvous: all workers finish probing before any scans the table.
    pub probe_done: WaitGroup,
    pub probe_done_token: Option<WaitToken>,
    pub prober: Box<dyn JoinProber>,
}

impl ProbeWorker {
    /// Wire up a worker with its single recycled result buffer.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        id: usize,
        ctx: Arc<JoinContext>,
        input_rx: mpsc::Receiver<Batch>,
        resource_tx: mpsc::Sender<ProbeBatchResource>,
        result_tx: mpsc::Sender<WorkResult>,
        probe_done: &WaitGroup,
        prober: Box<dyn JoinProber>,
        result_batch: Batch,
    ) -> ProbeWorker {
        let (recycle_tx, recycle_rx) = mpsc::channel(1);
        recycle_tx
            .try_send(result_batch)
            .expect("seed within capacity");
        ProbeWorker {
            id,
            ctx,
            input_rx,
            resource_tx,
            recycle_tx,
            recycle_rx,
            result_tx,
            probe_done: probe_done.clone(),
            probe_done_token: Some(probe_done.token()),
            prober,
        }
    }

    pub(crate) fn spawn(self) -> JoinHandle<()> {
        let ctx = self.ctx.clone();
        tokio::spawn(async move {
            if let Err(payload) = AssertUnwindSafe(self.run()).catch_unwind().await {
                ctx.report_error(ExecError::from_panic(payload));
            }
        })
    }

    async fn run(mut self) {
        let ctx = self.ctx.clone();

        // The single result buffer, obtained once at startup.
        let Some(mut out) = self.take_result_batch().await else {
            return;
        };

        let mut clean = false;
        loop {
            let input = tokio::select! {
                _ = ctx.closed() => break,
                input = self.input_rx.recv() => match input {
                    // Fan-out queue closed: probe input is done.
                    None => {
                        clean = true;
                        break;
                    }
                    Some(input) => input,
                },
            };

            let rows = match self.prober.probe(&input) {
                Ok(rows) => rows,
                Err(err) => {
                    self.send_error(err).await;
                    return;
                }
            };

            // Hand the consumed input buffer back to the fetcher. An
            // error just means the fetcher is gone; the buffer is dropped.
            let mut batch = input;
            batch.reset();
            let resource = ProbeBatchResource {
                batch,
                worker: self.id,
            };
            tokio::select! {
                _ = ctx.closed() => break,
                res = self.resource_tx.send(resource) => {
                    let _ = res;
                }
            }

            for row in rows {
                out.push_row(row);
                if out.is_full() {
                    if !self.emit(out).await {
                        return;
                    }
                    out = match self.take_result_batch().await {
                        Some(next) => next,
                        None => return,
                    };
                }
            }
        }

        if !clean {
            // Cancellation abandons any staged partial results.
            return;
        }

        // Flush the partial result batch, keeping an unused buffer around
        // for the scan phase.
        let out = if out.is_empty() {
            Some(out)
        } else {
            if !self.emit(out).await {
                return;
            }
            None
        };
        self.scan_row_table_if_needed(out).await;
    }

    /// Run the post-probe row table scan for build-preserving join types.
    ///
    /// Waits for every worker to finish probing first: scanning for
    /// unmatched build rows is only sound once no probe can still mark
    /// matches.
    async fn scan_row_table_if_needed(&mut self, out: Option<Batch>) {
        if !self.ctx.join_type().needs_scan_after_probe()
            || self.ctx.skip_scan_row_table()
            || self.ctx.is_finished()
        {
            self.probe_done_token = None;
            return;
        }

        let ctx = self.ctx.clone();
        self.probe_done_token = None;
        tokio::select! {
            _ = ctx.closed() => return,
            _ = self.probe_done.wait_zero() => {}
        }

        debug!(worker = self.id, "scanning row table");
        let rows = match self.prober.scan_row_table() {
            Ok(rows) => rows,
            Err(err) => {
                self.send_error(err).await;
                return;
            }
        };
        if rows.is_empty() {
            return;
        }

        let mut out = match out {
            Some(out) => out,
            // The startup buffer was flushed; wait for the consumer to
            // recycle it.
            None => match self.take_result_batch().await {
                Some(out) => out,
                None => return,
            },
        };
        for row in rows {
            out.push_row(row);
            if out.is_full() {
                if !self.emit(out).await {
                    return;
                }
                out = match self.take_result_batch().await {
                    Some(next) => next,
                    None => return,
                };
            }
        }
        if !out.is_empty() {
            self.emit(out).await;
        }
    }

    /// Wait for the recycled result buffer, racing close.
    async fn take_result_batch(&mut self) -> Option<Batch> {
        tokio::select! {
            biased;
            _ = self.ctx.closed() => None,
            batch = self.recycle_rx.recv() => batch,
        }
    }

    /// Send a full result batch. Returns false if the pipeline is closing.
    async fn emit(&mut self, batch: Batch) -> bool {
        let msg = WorkResult::Batch {
            batch,
            src: self.recycle_tx.clone(),
        };
        tokio::select! {
            _ = self.ctx.closed() => false,
            res = self.result_tx.send(msg) => res.is_ok(),
        }
    }

    async fn send_error(&mut self, err: ExecError) {
        tokio::select! {
            _ = self.ctx.closed() => {}
            _ = self.result_tx.send(WorkResult::Err(err)) => {}
        }
    }
}
