pub mod correlation;
pub mod dedup;
pub mod error_codes;
pub mod fingerprint;
pub mod memory;
pub mod model;
pub mod repo;
pub mod retry;
pub mod store;

pub use correlation::{Correlation, CorrelationError, ParentLink};
pub use dedup::{try_reuse, Reuse};
pub use error_codes::ErrorCode;
pub use memory::MemoryJobStore;
pub use model::{Job, JobId, JobKind, JobResultItem, JobStatus, NewJob, TransitionOutcome};
pub use repo::JobsRepo;
pub use retry::{classify_error, Backoff, ErrorClass, RetryConfig, RetryDecision, RetryPolicy};
pub use store::{JobStore, StatusCount};
