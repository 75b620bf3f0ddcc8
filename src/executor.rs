use crate::config::TerminationPolicy;
use crate::ident::PoolId;
use crate::job::{Job, JobContext, JobId, JobResult};
use crate::notifier::{JobOutcome, JobStatus, OutcomeNotifier};
use crate::slots::SlotGuard;

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::SystemTime;

use dashmap::DashMap;
use futures::FutureExt;
use tokio::runtime::Handle as TokioHandle;
use tokio::task::JoinError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace, warn};

/// State every executor of one pool reads.
pub(crate) struct ExecutorShared {
  pub(crate) pool_id: PoolId,
  pub(crate) pool_name: Arc<str>,
  pub(crate) scope: CancellationToken,
  pub(crate) termination: Option<TerminationPolicy>,
  pub(crate) tokio_handle: TokioHandle,
  pub(crate) active_jobs: DashMap<JobId, Arc<str>>,
  pub(crate) notifier: OutcomeNotifier,
}

impl ExecutorShared {
  pub(crate) fn outcome(&self, job_id: JobId, job_name: Arc<str>, status: JobStatus, error: Option<String>) -> JobOutcome {
    JobOutcome {
      pool_id: self.pool_id,
      pool_name: self.pool_name.clone(),
      job_id,
      job_name,
      status,
      error,
      completed_at: SystemTime::now(),
    }
  }
}

/// Registration of one dispatched job. Holds the job's worker slot.
///
/// Dropping it removes the job from the active map and then returns the slot,
/// so every exit path of an executor releases both.
pub(crate) struct InFlightJob {
  shared: Arc<ExecutorShared>,
  job_id: JobId,
  _slot: SlotGuard,
}

impl InFlightJob {
  pub(crate) fn register(shared: Arc<ExecutorShared>, job_id: JobId, job_name: Arc<str>, slot: SlotGuard) -> Self {
    shared.active_jobs.insert(job_id, job_name);
    Self {
      shared,
      job_id,
      _slot: slot,
    }
  }
}

impl Drop for InFlightJob {
  fn drop(&mut self) {
    self.shared.active_jobs.remove(&self.job_id);
    trace!(pool_name = %self.shared.pool_name, job_id = self.job_id, "Released in-flight job.");
  }
}

type Invocation<R> = Result<JobResult<R>, Box<dyn Any + Send>>;

/// Runs one dispatched job to completion.
///
/// The processor is invoked on its own task. The executor then races the
/// pool's scope against that task: if the scope is cancelled first, or at the
/// same instant the result arrives, cancellation wins, the executor waits for
/// the invocation to return and discards its result. A panic in the
/// processor is contained here and reported as `JobStatus::Panicked`.
pub(crate) async fn execute<R: Send + 'static>(shared: Arc<ExecutorShared>, job: Job<R>, in_flight: InFlightJob) {
  let Job {
    id: job_id,
    name: job_name,
    processor,
  } = job;

  let ctx = JobContext {
    pool_id: shared.pool_id,
    job_id,
    job_name: job_name.clone(),
    scope: shared.scope.child_token(),
    pool_scope: shared.scope.clone(),
    termination: shared.termination,
  };

  debug!(pool_name = %shared.pool_name, job_id, job_name = %job_name, "Invoking job processor.");
  let mut invocation = shared
    .tokio_handle
    .spawn(async move { AssertUnwindSafe(processor.process(ctx)).catch_unwind().await });

  let (status, error) = tokio::select! {
    biased;

    _ = shared.scope.cancelled() => {
      debug!(pool_name = %shared.pool_name, job_id, "Scope cancelled while job running. Waiting for the processor to return.");
      if let Err(join_error) = (&mut invocation).await {
        warn!(pool_name = %shared.pool_name, job_id, "Cancelled job's invocation task failed: {}", join_error);
      }
      (JobStatus::Cancelled, None)
    }

    joined = &mut invocation => classify(&shared, job_id, joined),
  };

  // Slot goes back before the outcome is published.
  drop(in_flight);

  debug!(pool_name = %shared.pool_name, job_id, ?status, "Job finished.");
  let outcome = shared.outcome(job_id, job_name, status, error);
  shared.notifier.notify(outcome).await;
}

fn classify<R>(shared: &ExecutorShared, job_id: JobId, joined: Result<Invocation<R>, JoinError>) -> (JobStatus, Option<String>) {
  match joined {
    Ok(Ok(Ok(_))) => (JobStatus::Succeeded, None),
    Ok(Ok(Err(job_error))) => {
      debug!(pool_name = %shared.pool_name, job_id, "Job processor returned an error: {}", job_error);
      (JobStatus::Failed, Some(job_error.to_string()))
    }
    Ok(Err(panic_payload)) => {
      let message = panic_message(panic_payload.as_ref());
      error!(pool_name = %shared.pool_name, job_id, "Job panicked during execution: {}", message);
      (JobStatus::Panicked, Some(message))
    }
    Err(join_error) if join_error.is_panic() => {
      let message = panic_message(join_error.into_panic().as_ref());
      error!(pool_name = %shared.pool_name, job_id, "Job invocation task panicked: {}", message);
      (JobStatus::Panicked, Some(message))
    }
    Err(join_error) => {
      warn!(pool_name = %shared.pool_name, job_id, "Job invocation task aborted: {}", join_error);
      (JobStatus::Cancelled, None)
    }
  }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
  if let Some(s) = payload.downcast_ref::<&str>() {
    (*s).to_string()
  } else if let Some(s) = payload.downcast_ref::<String>() {
    s.clone()
  } else {
    "non-string panic payload".to_string()
  }
}
