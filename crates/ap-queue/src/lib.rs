//! # ap-queue
//!
//! File-based work queue for exhaustive and sampled sweeps.
//!
//! A coordinating process enumerates the configs a sweep requires,
//! subtracts whatever the workers' `complete.csv` files already cover, and
//! writes the rest as `todo.csv` batches. Reconciliation is pure and can be
//! re-run after any crash.

pub mod batch;
pub mod completion;
pub mod reconcile;
mod schema;
pub mod sweep;

pub use batch::{default_label, read_batch, write_batches, TODO_FILE};
pub use completion::{
    collect_completions, completion_files, Completion, CompletionFile, COMPLETE_FILE,
};
pub use reconcile::{JobBatch, JobQueueReconciler, Reconciliation, FAILURE_SENTINEL};
pub use schema::{PROBLEM_SIZE_COLUMN, PROGRAM_COLUMN, TIME_COLUMN};
pub use sweep::{SamplingPlan, SweepDefinition};
