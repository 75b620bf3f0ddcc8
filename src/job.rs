use crate::config::TerminationPolicy;
use crate::ident::PoolId;

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Per-pool job sequence number, starting at 1.
pub type JobId = u64;

/// Error type returned by a job processor.
pub type JobError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// What a job processor produces.
pub type JobResult<R> = Result<R, JobError>;

/// The unit of work a pool runs. The pool never looks inside it.
///
/// `process` is handed a `JobContext` carrying the pool's cancellable scope.
/// Processors are expected to watch it and return early once it is
/// cancelled; one that ignores it runs to completion and holds up the pool's
/// drain for as long as it takes.
#[async_trait]
pub trait JobProcessor<R: Send + 'static>: Send + Sync + 'static {
  fn name(&self) -> &str;

  async fn process(&self, ctx: JobContext) -> JobResult<R>;
}

/// Everything a processor gets from the pool for one invocation.
#[derive(Clone)]
pub struct JobContext {
  pub(crate) pool_id: PoolId,
  pub(crate) job_id: JobId,
  pub(crate) job_name: Arc<str>,
  pub(crate) scope: CancellationToken,
  pub(crate) pool_scope: CancellationToken,
  pub(crate) termination: Option<TerminationPolicy>,
}

impl fmt::Debug for JobContext {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("JobContext")
      .field("pool_id", &self.pool_id)
      .field("job_id", &self.job_id)
      .field("job_name", &self.job_name)
      .field("cancelled", &self.scope.is_cancelled())
      .field("termination", &self.termination)
      .finish()
  }
}

impl JobContext {
  pub fn pool_id(&self) -> PoolId {
    self.pool_id
  }

  pub fn job_id(&self) -> JobId {
    self.job_id
  }

  pub fn job_name(&self) -> &str {
    &self.job_name
  }

  /// The job's sub-scope. It is cancelled whenever the pool's scope is.
  pub fn scope(&self) -> &CancellationToken {
    &self.scope
  }

  pub fn is_cancelled(&self) -> bool {
    self.scope.is_cancelled()
  }

  /// Resolves once the job's scope is cancelled.
  pub async fn cancelled(&self) {
    self.scope.cancelled().await
  }

  /// Cancels the pool's scope, triggering the pool's graceful drain.
  pub fn cancel_pool(&self) {
    debug!(pool_id = self.pool_id, job_id = self.job_id, "Job requested pool cancellation.");
    self.pool_scope.cancel();
  }

  pub fn termination_policy(&self) -> Option<TerminationPolicy> {
    self.termination
  }

  /// True if this job is the one after which the pool should terminate.
  /// Acting on it (calling `cancel_pool`) is left to the processor.
  pub fn reached_termination_point(&self) -> bool {
    self
      .termination
      .map(|policy| policy.is_termination_point(self.job_id))
      .unwrap_or(false)
  }
}

/// A queued job: sequence number, name, and the processor to invoke once.
pub struct Job<R: Send + 'static> {
  pub(crate) id: JobId,
  pub(crate) name: Arc<str>,
  pub(crate) processor: Box<dyn JobProcessor<R>>,
}

impl<R: Send + 'static> fmt::Debug for Job<R> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("Job")
      .field("id", &self.id)
      .field("name", &self.name)
      .finish_non_exhaustive()
  }
}

impl<R: Send + 'static> Job<R> {
  pub fn id(&self) -> JobId {
    self.id
  }

  pub fn name(&self) -> &str {
    &self.name
  }
}

/// Adapts an async closure into a `JobProcessor`.
pub struct FnJob<F> {
  name: String,
  f: F,
}

/// Wraps `f` as a named job processor.
pub fn job_fn<R, F, Fut>(name: impl Into<String>, f: F) -> FnJob<F>
where
  R: Send + 'static,
  F: Fn(JobContext) -> Fut + Send + Sync + 'static,
  Fut: Future<Output = JobResult<R>> + Send + 'static,
{
  FnJob { name: name.into(), f }
}

#[async_trait]
impl<R, F, Fut> JobProcessor<R> for FnJob<F>
where
  R: Send + 'static,
  F: Fn(JobContext) -> Fut + Send + Sync + 'static,
  Fut: Future<Output = JobResult<R>> + Send + 'static,
{
  fn name(&self) -> &str {
    &self.name
  }

  async fn process(&self, ctx: JobContext) -> JobResult<R> {
    (self.f)(ctx).await
  }
}
