//! Process-lifecycle orchestration for the supervised service's host:
//! planned maintenance windows, a dependency-ordered maintenance task
//! runner, and signal-driven graceful shutdown with a bounded request drain.

#![forbid(unsafe_code)]

pub mod maintenance;
pub mod shutdown;
pub mod signals;
pub mod tasks;

pub use maintenance::{
    MaintenanceManager, MaintenanceMode, MaintenancePlan, MaintenanceStatus, ServiceController,
    SessionRecord,
};
pub use shutdown::{RequestTracker, ShutdownManager, ShutdownReport, StepRecord};
pub use signals::ShutdownSignal;
pub use tasks::{MaintenanceTask, TaskRecord, TaskRunReport, TaskRunner, TaskStatus};
