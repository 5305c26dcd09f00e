// Recurring background workers: job bodies, the execution loop and the host

pub mod host;
pub mod job;
pub mod jobs;
pub mod recurring;

pub use host::WorkerHost;
pub use job::{JobContext, WorkerJob};
pub use jobs::CacheResetJob;
pub use recurring::{CycleOutcome, RecurringWorker, WorkerRuntimeState};
