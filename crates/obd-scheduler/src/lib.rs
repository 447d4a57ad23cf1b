//! OBD-II Command Scheduler
//!
//! Periodically injects Mode 01 polling commands for a fixed set of PIDs
//! into the link's outbound command channel.

mod scheduler;

pub use scheduler::{CommandScheduler, SchedulerConfig, SchedulerError, TickReport};
