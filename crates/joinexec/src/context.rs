use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::warn;

use crate::batch::Batch;
use crate::errors::ExecError;
use crate::join_type::JoinType;
use crate::tracker::UsageTracker;
use crate::util::cancel::CancelSignal;
use crate::util::signal::OnceSignal;

/// A message on the join's result queue.
///
/// Exactly one of "here is a result batch" or "the join failed" per
/// message, enforced by the variants. After consuming a batch the consumer
/// must send it back on `src` so the producing worker can reuse it.
#[derive(Debug)]
pub enum WorkResult {
    Batch {
        batch: Batch,
        src: mpsc::Sender<Batch>,
    },
    Err(ExecError),
}

/// State shared by every task of one hash join execution.
///
/// Created once per execution and dropped only after all workers have
/// exited and the consumer has drained the result queue.
#[derive(Debug)]
pub struct JoinContext {
    concurrency: usize,
    join_type: JoinType,
    /// Whether each key column compares null equal to null.
    null_eq: Vec<bool>,
    /// Monotonic early-termination flag: false -> true only.
    finished: AtomicBool,
    /// Set by the build/probe handshake when probing is skipped in a way
    /// that also skips the post-probe row table scan.
    skip_scan_row_table: AtomicBool,
    close: CancelSignal,
    build_done: OnceSignal<Option<ExecError>>,
    /// Held in an Option so the pipeline driver can close the queue
    /// exactly once while the context stays alive for the consumer.
    result_tx: Mutex<Option<mpsc::Sender<WorkResult>>>,
    mem_tracker: UsageTracker,
    disk_tracker: UsageTracker,
}

impl JoinContext {
    /// Create the context and the receiving end of its result queue.
    ///
    /// The queue holds `concurrency + 2` messages so every probe worker,
    /// the fetcher, and the handshake can each deposit a terminal error
    /// without blocking.
    pub fn new(
        concurrency: usize,
        join_type: JoinType,
        null_eq: Vec<bool>,
    ) -> (Arc<JoinContext>, mpsc::Receiver<WorkResult>) {
        let (result_tx, result_rx) = mpsc::channel(concurrency + 2);
        let ctx = JoinContext {
            concurrency,
            join_type,
            null_eq,
            finished: AtomicBool::new(false),
            skip_scan_row_table: AtomicBool::new(false),
            close: CancelSignal::new(),
            build_done: OnceSignal::new(),
            result_tx: Mutex::new(Some(result_tx)),
            mem_tracker: UsageTracker::new("join_mem"),
            disk_tracker: UsageTracker::new("join_disk"),
        };
        (Arc::new(ctx), result_rx)
    }

    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    pub fn join_type(&self) -> JoinType {
        self.join_type
    }

    pub fn null_eq(&self) -> &[bool] {
        &self.null_eq
    }

    /// Mark the whole join finished. Idempotent.
    pub fn signal_finished(&self) {
        self.finished.store(true, Ordering::Release);
    }

    pub fn is_finished(&self) -> bool {
        self.finished.load(Ordering::Acquire)
    }

    /// Broadcast cancellation to every task. Idempotent.
    pub fn request_close(&self) {
        self.close.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.close.is_cancelled()
    }

    /// Resolve once cancellation has been requested.
    pub async fn closed(&self) {
        self.close.cancelled().await
    }

    /// Deliver a terminal error on the result queue without blocking.
    ///
    /// The queue is sized to absorb one error from each task; a full or
    /// already-closed queue drops the duplicate rather than deadlocking.
    pub fn report_error(&self, err: ExecError) {
        let Some(tx) = self.result_tx.lock().clone() else {
            warn!(%err, "error reported after result queue closed");
            return;
        };
        if let Err(send_err) = tx.try_send(WorkResult::Err(err)) {
            warn!(?send_err, "dropping duplicate terminal error");
        }
    }

    pub(crate) fn result_sender(&self) -> Option<mpsc::Sender<WorkResult>> {
        self.result_tx.lock().clone()
    }

    /// Close the result queue. The consumer observes end-of-results once
    /// in-flight worker senders are gone as well.
    pub(crate) fn close_results(&self) {
        *self.result_tx.lock() = None;
    }

    /// Publish build completion, carrying the first build error if any.
    pub(crate) fn finish_build(&self, err: Option<ExecError>) {
        self.build_done.fire(err);
    }

    /// Resolve once the build side has completed.
    pub(crate) async fn build_finished(&self) -> Option<ExecError> {
        self.build_done.wait().await
    }

    pub(crate) fn set_skip_scan_row_table(&self) {
        self.skip_scan_row_table.store(true, Ordering::Release);
    }

    pub fn skip_scan_row_table(&self) -> bool {
        self.skip_scan_row_table.load(Ordering::Acquire)
    }

    pub fn mem_tracker(&self) -> &UsageTracker {
        &self.mem_tracker
    }

    pub fn disk_tracker(&self) -> &UsageTracker {
        &self.disk_tracker
    }
}
