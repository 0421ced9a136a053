//! Frequency scheduler: fires `trigger` for the configured frequencies.

pub mod cron;
pub mod engine;

pub use self::cron::{PlannedRun, Scheduler};
pub use self::engine::run_scheduler_loop;
