//! Process exit codes understood by the relaunch wrapper.
//!
//! The wrapper resubmits a task on any code other than
//! [`FINISHED_EXIT_CODE`].

/// All assigned work is finished; do not resubmit.
pub const FINISHED_EXIT_CODE: i32 = 42;

/// Stopped cleanly ahead of the scheduler's time limit; resubmit to resume.
pub const PREEMPTED_EXIT_CODE: i32 = 75;

/// Anything went wrong; resubmit after inspection.
pub const ERROR_EXIT_CODE: i32 = 1;
