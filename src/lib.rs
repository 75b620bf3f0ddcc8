//! A Tokio-based bounded worker pool: a fixed set of worker slots draining a
//! FIFO job queue, with a caller-owned cancellable scope for graceful drain.

mod config;
mod error;
mod executor;
mod ident;
mod job;
mod notifier;
mod pool;
mod queue;
mod slots;

pub use config::{PoolConfig, TerminationPolicy, MAX_WORKERS, MIN_WORKERS, QUEUE_CAPACITY_FACTOR};
pub use error::PoolError;
pub use ident::{InstanceToken, InstanceTokenGenerator, OsTokenGenerator, PoolId, PoolIdAllocator, INSTANCE_TOKEN_BYTES};
pub use job::{job_fn, FnJob, Job, JobContext, JobError, JobId, JobProcessor, JobResult};
pub use notifier::{JobOutcome, JobStatus};
pub use pool::{DispatchExit, Pool, PoolStats};
