/// Persistent job queue
///
/// Leased, prioritized, retrying job queue backed by SQLite. Safe for any
/// number of concurrent claimers across processes sharing the database.

pub mod payload;
pub mod retry;
pub mod service;
pub mod store;
pub mod types;

pub use retry::RetryPolicy;
pub use service::{JobQueue, QueueSettings};
pub use store::JobStore;
pub use types::{
    Job, JobEvent, JobEventKind, JobPriority, JobStats, JobStatus, JobType, NewJob, StatsFilter,
};
