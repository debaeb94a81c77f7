use async_trait::async_trait;

use crate::batch::Batch;
use crate::errors::Result;

/// One side of the join's input: an executor producing row batches.
///
/// `next` fills the provided batch in place; leaving it empty signals the
/// input is exhausted. Implementations should respect the batch's
/// required-rows hint when producing rows.
#[async_trait]
pub trait BatchSource: Send {
    /// A template batch sized for this source's output.
    fn first_batch(&self) -> Batch;

    /// Fill `out` with the next rows from the input.
    async fn next(&mut self, out: &mut Batch) -> Result<()>;
}
