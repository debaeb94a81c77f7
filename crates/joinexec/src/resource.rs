use tokio::sync::mpsc;

use crate::batch::Batch;

/// A reusable probe-input buffer bound to the per-worker queue it feeds.
///
/// The fetcher checks a resource out of the pool, fills its batch from the
/// probe input, and dispatches the batch to the queue of `worker`. After
/// consuming the batch, that worker resets it and sends the resource back
/// to the pool. The pool is seeded with one resource per worker, so the
/// live-buffer count never grows past the worker count.
#[derive(Debug)]
pub struct ProbeBatchResource {
    pub batch: Batch,
    pub worker: usize,
}

/// Channel plumbing for the probe side of the join.
///
/// Only the fetcher holds the per-worker queue senders; dropping the
/// fetcher therefore closes every fan-out queue and the workers observe
/// end-of-input, on clean exit and panic alike.
pub(crate) struct ProbeWiring {
    pub resource_tx: mpsc::Sender<ProbeBatchResource>,
    pub resource_rx: mpsc::Receiver<ProbeBatchResource>,
    pub worker_txs: Vec<mpsc::Sender<Batch>>,
    pub worker_rxs: Vec<mpsc::Receiver<Batch>>,
}

pub(crate) fn init_probe_wiring(
    concurrency: usize,
    mut first_batch: impl FnMut() -> Batch,
) -> ProbeWiring {
    let (resource_tx, resource_rx) = mpsc::channel(concurrency);
    let mut worker_txs = Vec::with_capacity(concurrency);
    let mut worker_rxs = Vec::with_capacity(concurrency);

    for worker in 0..concurrency {
        let (tx, rx) = mpsc::channel(1);
        worker_txs.push(tx);
        worker_rxs.push(rx);

        resource_tx
            .try_send(ProbeBatchResource {
                batch: first_batch(),
                worker,
            })
            .expect("pool seeded within capacity");
    }

    ProbeWiring {
        resource_tx,
        resource_rx,
        worker_txs,
        worker_rxs,
    }
}
