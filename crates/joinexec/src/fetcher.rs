use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use futures::FutureExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::batch::Batch;
use crate::context::JoinContext;
use crate::errors::ExecError;
use crate::exec::BatchSource;
use crate::resource::ProbeBatchResource;

/// No row-limit hint active.
pub(crate) const NO_REQUIRED_ROWS: usize = usize::MAX;

/// State shared between the fetcher task and the operator handle, so the
/// consumer can lower the number of probe rows still needed ("only N more
/// rows" limit pushdown).
#[derive(Debug)]
pub(crate) struct FetcherShared {
    pub required_rows: AtomicUsize,
}

impl Default for FetcherShared {
    fn default() -> Self {
        FetcherShared {
            required_rows: AtomicUsize::new(NO_REQUIRED_ROWS),
        }
    }
}

/// Outcome of the build/probe handshake.
#[derive(Debug, Clone, Copy)]
pub(crate) struct WaitOutcome {
    pub skip_probe: bool,
    pub skip_scan_row_table: bool,
}

/// Block until the build side completes or the join is closed, and decide
/// whether probing (and the post-probe row table scan) can be skipped.
///
/// The empty-build skip applies only when build completed cleanly, the
/// build side produced no rows, no spill has been triggered, and the join
/// type permits it. A spill that becomes triggered between the
/// `is_spill_triggered` read and probe start is tolerated: probing an
/// empty in-memory table is correct, just not minimal.
pub(crate) async fn wait_for_build(
    ctx: &JoinContext,
    is_build_empty: &(dyn Fn() -> bool + Send + Sync),
    is_spill_triggered: &(dyn Fn() -> bool + Send + Sync),
) -> WaitOutcome {
    let mut skip_probe = false;
    let mut skip_scan_row_table = false;
    let mut build_err = None;
    let mut build_finished = false;

    tokio::select! {
        _ = ctx.closed() => {
            // Executor is shutting down, nothing left to probe or scan.
            skip_probe = true;
            skip_scan_row_table = true;
        }
        err = ctx.build_finished() => match err {
            Some(err) => {
                skip_probe = true;
                skip_scan_row_table = true;
                build_err = Some(err);
            }
            None => build_finished = true,
        }
    }

    if build_finished
        && is_build_empty()
        && !is_spill_triggered()
        && ctx.join_type().can_skip_probe_on_empty_build()
    {
        skip_probe = true;
    }

    if let Some(err) = build_err {
        ctx.report_error(err);
    } else if skip_probe && !ctx.join_type().needs_scan_after_probe() {
        // Nothing to probe and nothing to scan afterwards: the whole join
        // is done.
        ctx.signal_finished();
    }

    WaitOutcome {
        skip_probe,
        skip_scan_row_table,
    }
}

/// The single probe-side fetcher task.
///
/// Pulls batches from the probe input and fans them out to the per-worker
/// queues, checking buffers out of the resource pool so steady state
/// allocates nothing. Holds the only senders for the per-worker queues:
/// when this task exits, by any path, the workers observe end-of-input.
pub(crate) struct ProbeFetcher {
    pub ctx: Arc<JoinContext>,
    pub source: Box<dyn BatchSource>,
    pub resource_rx: mpsc::Receiver<ProbeBatchResource>,
    pub worker_txs: Vec<mpsc::Sender<Batch>>,
    pub shared: Arc<FetcherShared>,
    /// Apply the shared required-rows hint before each fetch.
    pub limit_fetch: bool,
    pub is_build_empty: Box<dyn Fn() -> bool + Send + Sync>,
    pub is_spill_triggered: Box<dyn Fn() -> bool + Send + Sync>,
}

impl ProbeFetcher {
    pub(crate) fn spawn(self) -> JoinHandle<()> {
        let ctx = self.ctx.clone();
        tokio::spawn(async move {
            // The fetcher owns the fan-out senders, so unwinding here still
            // closes the worker queues when the task future drops.
            if let Err(payload) = AssertUnwindSafe(self.run()).catch_unwind().await {
                ctx.report_error(ExecError::from_panic(payload));
            }
        })
    }

    async fn run(mut self) {
        let ctx = self.ctx.clone();
        let mut waited_for_build = false;

        loop {
            let Some(resource) = self.checkout().await else {
                break;
            };
            let ProbeBatchResource { mut batch, worker } = resource;
            batch.reset();

            if !waited_for_build {
                let outcome =
                    wait_for_build(&ctx, &*self.is_build_empty, &*self.is_spill_triggered).await;
                if outcome.skip_scan_row_table {
                    ctx.set_skip_scan_row_table();
                }
                if outcome.skip_probe {
                    debug!("skipping probe side");
                    return;
                }
                waited_for_build = true;
            }

            if self.limit_fetch {
                let required = self.shared.required_rows.load(Ordering::Relaxed);
                if required != NO_REQUIRED_ROWS {
                    batch.set_required_rows(required);
                }
            }

            let fetched = tokio::select! {
                _ = ctx.closed() => break,
                res = self.source.next(&mut batch) => res,
            };
            if let Err(err) = fetched {
                ctx.report_error(err);
                break;
            }
            ctx.mem_tracker().consume(batch.mem_bytes() as i64);

            if batch.is_empty() {
                // Probe input exhausted. Not an error.
                break;
            }

            let forwarded = tokio::select! {
                _ = ctx.closed() => break,
                res = self.worker_txs[worker].send(batch) => res,
            };
            if forwarded.is_err() {
                break;
            }
        }
    }

    /// Check a buffer resource out of the pool.
    ///
    /// Returns `None` if the join already finished, the pool closed (all
    /// probe workers exited), or close fires first. Close always wins a
    /// race with resource availability.
    async fn checkout(&mut self) -> Option<ProbeBatchResource> {
        if self.ctx.is_finished() {
            return None;
        }
        tokio::select! {
            biased;
            _ = self.ctx.closed() => None,
            resource = self.resource_rx.recv() => resource,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::time::Duration;

    use async_trait::async_trait;

    use super::*;
    use crate::batch::{Row, Scalar};
    use crate::context::WorkResult;
    use crate::errors::{Result, internal};
    use crate::join_type::JoinType;
    use crate::resource::init_probe_wiring;

    struct ScriptedSource {
        batches: VecDeque<Vec<Row>>,
        capacity: usize,
        calls: Arc<AtomicUsize>,
        required_seen: Arc<AtomicUsize>,
    }

    impl ScriptedSource {
        fn new(batches: Vec<Vec<Row>>) -> ScriptedSource {
            ScriptedSource {
                batches: batches.into(),
                capacity: 16,
                calls: Arc::new(AtomicUsize::new(0)),
                required_seen: Arc::new(AtomicUsize::new(0)),
            }
        }
    }

    #[async_trait]
    impl BatchSource for ScriptedSource {
        fn first_batch(&self) -> Batch {
            Batch::with_capacity(self.capacity)
        }

        async fn next(&mut self, out: &mut Batch) -> Result<()> {
            self.calls.fetch_add(1, Ordering::Relaxed);
            self.required_seen
                .store(out.required_rows(), Ordering::Relaxed);
            if let Some(rows) = self.batches.pop_front() {
                for row in rows {
                    out.push_row(row);
                }
            }
            Ok(())
        }
    }

    fn row(v: i64) -> Row {
        vec![Scalar::Int64(v)]
    }

    fn always(v: bool) -> Box<dyn Fn() -> bool + Send + Sync> {
        Box::new(move || v)
    }

    fn fetcher_for(
        ctx: &Arc<JoinContext>,
        source: ScriptedSource,
        build_empty: bool,
    ) -> (ProbeFetcher, Vec<mpsc::Receiver<Batch>>, mpsc::Sender<ProbeBatchResource>) {
        let wiring = init_probe_wiring(ctx.concurrency(), || source.first_batch());
        let fetcher = ProbeFetcher {
            ctx: ctx.clone(),
            source: Box::new(source),
            resource_rx: wiring.resource_rx,
            worker_txs: wiring.worker_txs,
            shared: Arc::new(FetcherShared::default()),
            limit_fetch: false,
            is_build_empty: always(build_empty),
            is_spill_triggered: always(false),
        };
        (fetcher, wiring.worker_rxs, wiring.resource_tx)
    }

    #[tokio::test]
    async fn handshake_close_skips_everything() {
        let (ctx, _rx) = JoinContext::new(1, JoinType::Inner, vec![]);
        ctx.request_close();
        let outcome = wait_for_build(&ctx, &*always(false), &*always(false)).await;
        assert!(outcome.skip_probe);
        assert!(outcome.skip_scan_row_table);
    }

    #[tokio::test]
    async fn handshake_forwards_build_error() {
        let (ctx, mut rx) = JoinContext::new(1, JoinType::Inner, vec![]);
        ctx.finish_build(Some(internal!("build blew up")));
        let outcome = wait_for_build(&ctx, &*always(false), &*always(false)).await;
        assert!(outcome.skip_probe);
        assert!(outcome.skip_scan_row_table);
        assert!(matches!(rx.recv().await, Some(WorkResult::Err(_))));
    }

    #[tokio::test]
    async fn handshake_empty_build_finishes_inner_join() {
        let (ctx, _rx) = JoinContext::new(1, JoinType::Inner, vec![]);
        ctx.finish_build(None);
        let outcome = wait_for_build(&ctx, &*always(true), &*always(false)).await;
        assert!(outcome.skip_probe);
        assert!(!outcome.skip_scan_row_table);
        assert!(ctx.is_finished());
    }

    #[tokio::test]
    async fn handshake_empty_build_keeps_scan_for_right_join() {
        let (ctx, _rx) = JoinContext::new(1, JoinType::Right, vec![]);
        ctx.finish_build(None);
        let outcome = wait_for_build(&ctx, &*always(true), &*always(false)).await;
        assert!(outcome.skip_probe);
        assert!(!outcome.skip_scan_row_table);
        // The row table scan still has to run, so the join isn't finished.
        assert!(!ctx.is_finished());
    }

    #[tokio::test]
    async fn handshake_left_join_probes_empty_build() {
        let (ctx, _rx) = JoinContext::new(1, JoinType::Left, vec![]);
        ctx.finish_build(None);
        let outcome = wait_for_build(&ctx, &*always(true), &*always(false)).await;
        assert!(!outcome.skip_probe);
    }

    #[tokio::test]
    async fn handshake_spill_in_progress_blocks_skip() {
        let (ctx, _rx) = JoinContext::new(1, JoinType::Inner, vec![]);
        ctx.finish_build(None);
        let outcome = wait_for_build(&ctx, &*always(true), &*always(true)).await;
        assert!(!outcome.skip_probe);
    }

    #[tokio::test]
    async fn skip_probe_reads_nothing_from_probe_input() {
        let (ctx, _rx) = JoinContext::new(2, JoinType::Inner, vec![]);
        ctx.finish_build(None);

        let source = ScriptedSource::new(vec![vec![row(1)]]);
        let calls = source.calls.clone();
        let (fetcher, mut worker_rxs, _resource_tx) = fetcher_for(&ctx, source, true);

        fetcher.spawn().await.unwrap();

        assert_eq!(0, calls.load(Ordering::Relaxed));
        assert!(ctx.is_finished());
        // Fan-out queues are closed so workers observe end-of-input.
        for rx in worker_rxs.iter_mut() {
            assert!(rx.recv().await.is_none());
        }
    }

    #[tokio::test]
    async fn fans_out_until_input_exhausted() {
        let (ctx, _rx) = JoinContext::new(2, JoinType::Inner, vec![]);
        ctx.finish_build(None);

        let source = ScriptedSource::new(vec![vec![row(1)], vec![row(2)], vec![row(3)]]);
        let (fetcher, mut worker_rxs, resource_tx) = fetcher_for(&ctx, source, false);
        let handle = fetcher.spawn();

        // Resources are seeded in worker order, so the first two batches
        // land on workers 0 and 1.
        let first = worker_rxs[0].recv().await.unwrap();
        assert_eq!(&[row(1)][..], first.rows());
        let second = worker_rxs[1].recv().await.unwrap();
        assert_eq!(&[row(2)][..], second.rows());

        // Returning worker 0's buffer lets the fetcher continue.
        let mut batch = first;
        batch.reset();
        resource_tx
            .send(ProbeBatchResource { batch, worker: 0 })
            .await
            .unwrap();

        let third = worker_rxs[0].recv().await.unwrap();
        assert_eq!(&[row(3)][..], third.rows());

        // Return worker 1's buffer so the fetcher can observe exhaustion.
        let mut batch = second;
        batch.reset();
        resource_tx
            .send(ProbeBatchResource { batch, worker: 1 })
            .await
            .unwrap();

        // Input exhausted: fetcher exits and queues close.
        handle.await.unwrap();
        assert!(worker_rxs[0].recv().await.is_none());
        assert!(worker_rxs[1].recv().await.is_none());
    }

    #[tokio::test]
    async fn close_wins_race_with_checkout() {
        let (ctx, _rx) = JoinContext::new(1, JoinType::Inner, vec![]);
        ctx.finish_build(None);

        let source = ScriptedSource::new(vec![vec![row(1)], vec![row(2)]]);
        let (fetcher, mut worker_rxs, _resource_tx) = fetcher_for(&ctx, source, false);
        let handle = fetcher.spawn();

        // Consume the only seeded resource's batch but never return it,
        // leaving the fetcher blocked on checkout.
        let _first = worker_rxs[0].recv().await.unwrap();

        ctx.request_close();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn required_rows_hint_caps_fetch() {
        let (ctx, _rx) = JoinContext::new(1, JoinType::Inner, vec![]);
        ctx.finish_build(None);

        let source = ScriptedSource::new(vec![vec![row(1)], vec![]]);
        let required_seen = source.required_seen.clone();
        let wiring = init_probe_wiring(1, || source.first_batch());
        let shared = Arc::new(FetcherShared::default());
        shared.required_rows.store(5, Ordering::Relaxed);

        let fetcher = ProbeFetcher {
            ctx: ctx.clone(),
            source: Box::new(source),
            resource_rx: wiring.resource_rx,
            worker_txs: wiring.worker_txs,
            shared: shared.clone(),
            limit_fetch: true,
            is_build_empty: always(false),
            is_spill_triggered: always(false),
        };
        let handle = fetcher.spawn();

        let mut worker_rxs = wiring.worker_rxs;
        let batch = worker_rxs[0].recv().await.unwrap();
        assert_eq!(5, required_seen.load(Ordering::Relaxed));

        let mut batch = batch;
        batch.reset();
        wiring
            .resource_tx
            .send(ProbeBatchResource { batch, worker: 0 })
            .await
            .unwrap();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn input_error_reaches_result_queue() {
        struct FailingSource;

        #[async_trait]
        impl BatchSource for FailingSource {
            fn first_batch(&self) -> Batch {
                Batch::with_capacity(4)
            }

            async fn next(&mut self, _out: &mut Batch) -> Result<()> {
                Err(internal!("probe input failed"))
            }
        }

        let (ctx, mut rx) = JoinContext::new(1, JoinType::Inner, vec![]);
        ctx.finish_build(None);

        let wiring = init_probe_wiring(1, || Batch::with_capacity(4));
        let fetcher = ProbeFetcher {
            ctx: ctx.clone(),
            source: Box::new(FailingSource),
            resource_rx: wiring.resource_rx,
            worker_txs: wiring.worker_txs,
            shared: Arc::new(FetcherShared::default()),
            limit_fetch: false,
            is_build_empty: always(false),
            is_spill_triggered: always(false),
        };
        fetcher.spawn().await.unwrap();

        match rx.recv().await {
            Some(WorkResult::Err(e)) => assert!(e.to_string().contains("probe input failed")),
            other => panic!("unexpected result: {other:?}"),
        }
    }
}
