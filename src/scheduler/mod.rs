//! Dispatch scheduling.
//!
//! The scheduler produces a bounded, priority-ordered, fairness-respecting
//! list of step ids ready for dispatch and marks them working in a single
//! claim statement.

mod dispatch;

pub use dispatch::{Scheduler, SchedulerConfig, SchedulerError};
