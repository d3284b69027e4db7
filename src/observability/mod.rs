// Observability: metrics and the import audit trail

pub mod activity;
pub mod metrics;

pub use activity::{ActivityEvent, ActivityLog, MemoryActivityLog, TracingActivityLog};
