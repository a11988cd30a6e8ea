//! Background job system with retry, backoff, and dead-letter handling.
//!
//! Side effects of the write path (emails, ticket artifacts, organizer
//! statistics) are enqueued here after the primary write has committed, so a
//! failing collaborator can never undo a booking.
//!
//! ## Components
//!
//! - `Job`: payload plus routing kind and retry bookkeeping
//! - `JobStore`: persistence for jobs and the dead-letter queue
//! - `JobExecutor`: runs jobs with registered handlers, on demand or on a thread

pub mod executor;
pub mod store;
pub mod types;

pub use executor::{ExecutorStats, JobExecutor, JobExecutorConfig, JobExecutorHandle, JobOutcome};
pub use store::{InMemoryJobStore, JobStats, JobStore, JobStoreError};
pub use types::{BackoffStrategy, DeadLetterEntry, Job, JobId, JobKind, JobResult, JobStatus, RetryPolicy};
