//! cradle-scheduler - cron and interval scheduling for agents
//!
//! Parses trigger schedule strings and runs one tokio task per job, emitting
//! a `ScheduleEvent` over a channel whenever a job fires.

pub mod job;
pub mod runner;

pub use job::{Job, MAX_PERIOD_SECS, ScheduleEvent, ScheduleSpec};
pub use runner::{JobRunner, SchedulerConfig};

#[cfg(test)]
mod tests {
    #[test]
    fn test_package_metadata() {
        assert_eq!(env!("CARGO_PKG_LICENSE"), "MIT");
        assert!(!env!("CARGO_PKG_DESCRIPTION").is_empty());
    }
}
