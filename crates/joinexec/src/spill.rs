use async_trait::async_trait;

use crate::errors::Result;

/// Coordinates spilling the build-side row table to disk under memory
/// pressure.
///
/// The coordinator owns the spill decision and the on-disk format; this
/// crate's only obligation is sequencing. Both spill operations are invoked
/// strictly after the build-output drain barrier reaches zero, so no
/// consumer holds a reference into in-memory partition state while rows
/// move to disk. The predicates may be polled concurrently by every build
/// worker; implementations are expected to be internally synchronized.
#[async_trait]
pub trait SpillCoordinator: Send + Sync {
    /// True when memory pressure requires spilling the row table.
    fn spill_needed(&self) -> bool;

    /// True once any spill has happened during this build.
    fn spill_triggered(&self) -> bool;

    /// Spill the current in-memory row table.
    async fn spill_row_table(&self) -> Result<()>;

    /// Spill rows accumulated since the last spill. Called at end of build
    /// when a spill was triggered at any point during the run.
    async fn spill_remaining_rows(&self) -> Result<()>;
}

/// Coordinator for joins that never spill.
#[derive(Debug, Default)]
pub struct NeverSpill;

#[async_trait]
impl SpillCoordinator for NeverSpill {
    fn spill_needed(&self) -> bool {
        false
    }

    fn spill_triggered(&self) -> bool {
        false
    }

    async fn spill_row_table(&self) -> Result<()> {
        Ok(())
    }

    async fn spill_remaining_rows(&self) -> Result<()> {
        Ok(())
    }
}
