//! Parallel hash join execution.
//!
//! This crate implements the worker orchestration for a parallel hash join:
//! build-side workers feeding a row table construction stage (with a
//! drain-then-spill protocol for memory pressure), a probe-side fetcher
//! fanning batches out to probe workers, and a buffer-recycling result
//! pipeline. The hash table itself, the matching algorithm, and the spill
//! format are supplied by the caller through the traits in [`exec`],
//! [`build`], [`probe`], and [`spill`].
pub mod batch;
pub mod build;
pub mod context;
pub mod errors;
pub mod exec;
pub mod join_type;
pub mod operator;
pub mod probe;
pub mod resource;
pub mod spill;
pub mod tracker;
pub mod util;

mod fetcher;

pub use batch::{Batch, BatchAllocator, Row, Scalar};
pub use build::RowTableBuilder;
pub use context::{JoinContext, WorkResult};
pub use errors::{ExecError, Result};
pub use exec::BatchSource;
pub use join_type::JoinType;
pub use operator::{HashJoinOperator, HashJoinOptions};
pub use probe::JoinProber;
pub use spill::{NeverSpill, SpillCoordinator};
