use std::sync::Arc;
use std::sync::atomic::Ordering;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::batch::{Batch, BatchAllocator};
use crate::build::{RowTableBuilder, TrackedBatch, spawn_build_workers};
use crate::context::{JoinContext, WorkResult};
use crate::errors::ExecError;
use crate::exec::BatchSource;
use crate::fetcher::{FetcherShared, ProbeFetcher};
use crate::join_type::JoinType;
use crate::probe::{JoinProber, ProbeWorker};
use crate::resource::init_probe_wiring;
use crate::spill::SpillCoordinator;
use crate::util::wait_group::WaitGroup;

/// Configuration for one hash join execution.
#[derive(Debug, Clone)]
pub struct HashJoinOptions {
    /// Number of probe workers and build workers.
    pub concurrency: usize,
    /// Capacity of result batches.
    pub batch_capacity: usize,
    pub join_type: JoinType,
    /// Whether each key column compares null equal to null.
    pub null_eq: Vec<bool>,
    /// Apply the shared required-rows hint to probe fetches.
    pub limit_probe_fetch: bool,
}

impl Default for HashJoinOptions {
    fn default() -> Self {
        HashJoinOptions {
            concurrency: num_cpus::get(),
            batch_capacity: 1024,
            join_type: JoinType::Inner,
            null_eq: Vec::new(),
            limit_probe_fetch: false,
        }
    }
}

/// A running parallel hash join.
///
/// Spawning wires up the build worker pool, the row table consumer stage,
/// the probe fetcher, and the probe workers; results arrive on
/// [`next_result`](Self::next_result). After consuming a
/// [`WorkResult::Batch`] the caller must send the batch back on its `src`
/// queue so the producing worker can reuse it.
pub struct HashJoinOperator {
    ctx: Arc<JoinContext>,
    result_rx: mpsc::Receiver<WorkResult>,
    shared: Arc<FetcherShared>,
    driver: Option<JoinHandle<()>>,
}

impl HashJoinOperator {
    /// Start the join. `probers` supplies one matching-algorithm instance
    /// per probe worker.
    pub fn start(
        opts: HashJoinOptions,
        build_source: Box<dyn BatchSource>,
        probe_source: Box<dyn BatchSource>,
        builder: Box<dyn RowTableBuilder>,
        spill: Arc<dyn SpillCoordinator>,
        probers: Vec<Box<dyn JoinProber>>,
    ) -> HashJoinOperator {
        assert_eq!(
            opts.concurrency,
            probers.len(),
            "one prober per probe worker"
        );

        let (ctx, result_rx) = JoinContext::new(opts.concurrency, opts.join_type, opts.null_eq);
        let alloc = Arc::new(BatchAllocator::new(opts.batch_capacity));
        let builder = Arc::new(Mutex::new(builder));

        // Build side: workers feeding the row table construction stage.
        let syncer = WaitGroup::new();
        let pool = spawn_build_workers(
            ctx.clone(),
            build_source,
            alloc.clone(),
            spill.clone(),
            syncer,
            opts.concurrency,
        );

        let consumer = spawn_row_table_consumer(pool.out_rx, builder.clone(), alloc);
        let build_done = spawn_build_supervisor(ctx.clone(), pool.handles, pool.err_rx, consumer);

        // Probe side: fetcher fanning out to workers.
        let wiring = init_probe_wiring(opts.concurrency, || probe_source.first_batch());

        let probe_done = WaitGroup::new();
        let result_tx = ctx.result_sender().expect("result queue open at start");
        let mut worker_handles = Vec::with_capacity(opts.concurrency);
        for (id, (input_rx, prober)) in wiring
            .worker_rxs
            .into_iter()
            .zip(probers.into_iter())
            .enumerate()
        {
            let worker = ProbeWorker::new(
                id,
                ctx.clone(),
                input_rx,
                wiring.resource_tx.clone(),
                result_tx.clone(),
                &probe_done,
                prober,
                Batch::with_capacity(opts.batch_capacity),
            );
            worker_handles.push(worker.spawn());
        }
        // Workers hold their own clones; keeping the original would stop
        // the fetcher from ever observing a closed pool.
        drop(wiring.resource_tx);
        drop(result_tx);

        let shared = Arc::new(FetcherShared::default());
        let fetcher = ProbeFetcher {
            ctx: ctx.clone(),
            source: probe_source,
            resource_rx: wiring.resource_rx,
            worker_txs: wiring.worker_txs,
            shared: shared.clone(),
            limit_fetch: opts.limit_probe_fetch,
            is_build_empty: {
                let builder = builder.clone();
                Box::new(move || builder.lock().num_rows() == 0)
            },
            is_spill_triggered: {
                let spill = spill.clone();
                Box::new(move || spill.spill_triggered())
            },
        };
        let fetcher_handle = fetcher.spawn();

        let driver = tokio::spawn(drive(
            ctx.clone(),
            build_done,
            fetcher_handle,
            worker_handles,
        ));

        HashJoinOperator {
            ctx,
            result_rx,
            shared,
            driver: Some(driver),
        }
    }

    /// Next result from the join. `None` means end-of-results; it is not
    /// an error.
    pub async fn next_result(&mut self) -> Option<WorkResult> {
        self.result_rx.recv().await
    }

    /// Cancel the join. Idempotent.
    pub fn request_close(&self) {
        self.ctx.request_close();
    }

    pub fn is_finished(&self) -> bool {
        self.ctx.is_finished()
    }

    /// Lower the number of probe rows still needed (limit pushdown). Only
    /// observed when the operator was started with `limit_probe_fetch`.
    pub fn set_required_rows(&self, rows: usize) {
        self.shared.required_rows.store(rows, Ordering::Relaxed);
    }

    pub fn context(&self) -> &Arc<JoinContext> {
        &self.ctx
    }

    /// Wait for every pipeline task to wind down.
    pub async fn join(&mut self) {
        if let Some(driver) = self.driver.take() {
            let _ = driver.await;
        }
    }
}

/// Drain build-output batches into the row table.
///
/// Dropping each message after `consume` is the drain-barrier decrement,
/// so a waiting spill observes the batch fully absorbed. Exits when the
/// build workers close the queue.
fn spawn_row_table_consumer(
    mut out_rx: mpsc::Receiver<TrackedBatch>,
    builder: Arc<Mutex<Box<dyn RowTableBuilder>>>,
    alloc: Arc<BatchAllocator>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(tracked) = out_rx.recv().await {
            let TrackedBatch { mut batch, _token } = tracked;
            builder.lock().consume(&batch);
            batch.reset();
            alloc.recycle(batch);
        }
    })
}

/// Wait for the build side to finish and publish completion exactly once,
/// carrying the first build error if any.
fn spawn_build_supervisor(
    ctx: Arc<JoinContext>,
    handles: Vec<JoinHandle<()>>,
    mut err_rx: mpsc::Receiver<ExecError>,
    consumer: JoinHandle<()>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        for handle in handles {
            let _ = handle.await;
        }
        let _ = consumer.await;

        let first_err = err_rx.try_recv().ok();
        while let Ok(extra) = err_rx.try_recv() {
            warn!(%extra, "additional build error");
        }

        debug!(err = first_err.is_some(), "build side complete");
        ctx.finish_build(first_err);
    })
}

/// Close the result queue once every probe task has exited.
async fn drive(
    ctx: Arc<JoinContext>,
    build_done: JoinHandle<()>,
    fetcher: JoinHandle<()>,
    workers: Vec<JoinHandle<()>>,
) {
    let _ = build_done.await;
    let _ = fetcher.await;
    for worker in workers {
        let _ = worker.await;
    }
    ctx.close_results();
    debug!("hash join pipeline complete");
}
