use crate::config::{PoolConfig, TerminationPolicy};
use crate::error::PoolError;
use crate::executor::{self, ExecutorShared, InFlightJob};
use crate::ident::{InstanceToken, InstanceTokenGenerator, OsTokenGenerator, PoolId, PoolIdAllocator};
use crate::job::{Job, JobId, JobProcessor};
use crate::notifier::{JobOutcome, JobStatus, OutcomeNotifier};
use crate::queue::{JobQueue, QueueConsumer, QueueProducer};
use crate::slots::{SlotGuard, WorkerSlots};

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::runtime::Handle as TokioHandle;
use tokio::task::JoinHandle;
use tokio_util::sync::{CancellationToken, DropGuard};
use tokio_util::task::TaskTracker;
use tracing::{debug, info, info_span, trace, warn, Instrument};

/// How a call to `Pool::start` ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchExit {
  /// Another call already owns the dispatch loop; this call did nothing.
  AlreadyRunning,
  /// This call ran the dispatch loop until the scope was cancelled (or the
  /// queue closed) and every in-flight job had finished.
  Drained,
}

/// Point-in-time view of a pool's counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
  pub worker_count: usize,
  pub active_workers: usize,
  pub available_workers: usize,
  pub jobs_served: u64,
  pub queued_jobs: usize,
  pub in_flight: usize,
}

// The consumer taken by the one dispatch loop, plus the guard that signals
// `shutdown` when that loop returns or is dropped.
struct DispatchClaim<R: Send + 'static> {
  consumer: QueueConsumer<R>,
  _done: DropGuard,
}

struct Lifecycle<R: Send + 'static> {
  started: bool,
  stopped: bool,
  // True while a dispatch loop is between claiming the consumer and returning.
  running: bool,
  // Taken by the one call to `start` that runs the dispatch loop.
  consumer: Option<QueueConsumer<R>>,
}

/// A bounded worker pool.
///
/// Jobs are queued FIFO and dispatched to at most `worker_count` concurrently
/// running executors. The pool observes a caller-supplied cancellable scope;
/// cancelling it makes the dispatch loop stop taking jobs and return once
/// every in-flight job has finished.
///
/// Typical lifecycle: `new`, then `spawn` (or a caller-spawned `start`), any
/// number of `add_job` calls, then cancel the scope, await the loop and
/// `stop`. `shutdown` does the last three steps in order.
pub struct Pool<R: Send + 'static> {
  id: PoolId,
  instance_token: InstanceToken,
  config: PoolConfig,
  worker_count: usize,
  queue_tx: QueueProducer<R>,
  slots: WorkerSlots,
  next_job_id: AtomicU64,
  lifecycle: Mutex<Lifecycle<R>>,
  in_flight: TaskTracker,
  // Cancelled when the running dispatch loop returns or is dropped.
  dispatch_done: CancellationToken,
  shared: Arc<ExecutorShared>,
}

impl<R: Send + 'static> fmt::Debug for Pool<R> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("Pool")
      .field("id", &self.id)
      .field("instance_token", &self.instance_token)
      .field("name", &self.shared.pool_name)
      .field("stats", &self.stats())
      .finish_non_exhaustive()
  }
}

impl<R: Send + 'static> Pool<R> {
  /// Creates a pool using the process-wide ID allocator and OS entropy for
  /// the instance token.
  pub fn new(config: PoolConfig, scope: CancellationToken, tokio_handle: TokioHandle) -> Result<Arc<Self>, PoolError> {
    Self::with_identity(config, scope, tokio_handle, PoolIdAllocator::global(), &OsTokenGenerator)
  }

  /// Creates a pool drawing its identity from the given collaborators.
  ///
  /// Fails only if the instance token cannot be generated, in which case no
  /// pool ID is consumed.
  pub fn with_identity(
    config: PoolConfig,
    scope: CancellationToken,
    tokio_handle: TokioHandle,
    ids: &PoolIdAllocator,
    tokens: &dyn InstanceTokenGenerator,
  ) -> Result<Arc<Self>, PoolError> {
    let instance_token = tokens.generate()?;
    let id = ids.next_id();

    let worker_count = config.effective_worker_count();
    if worker_count != config.worker_count {
      debug!(requested = config.worker_count, effective = worker_count, "Clamped requested worker count.");
    }

    let pool_name: Arc<str> = match &config.name {
      Some(name) => Arc::from(name.as_str()),
      None => Arc::from(format!("pool-{}", id)),
    };
    let (queue_tx, queue_rx) = JobQueue::bounded(config.queue_capacity());

    let shared = Arc::new(ExecutorShared {
      pool_id: id,
      pool_name: pool_name.clone(),
      scope,
      termination: config.termination,
      tokio_handle: tokio_handle.clone(),
      active_jobs: DashMap::new(),
      notifier: OutcomeNotifier::new(pool_name.clone(), tokio_handle),
    });

    info!(
      pool_name = %pool_name,
      pool_id = id,
      %instance_token,
      worker_count,
      queue_capacity = queue_tx.capacity(),
      "Created worker pool."
    );

    Ok(Arc::new(Self {
      id,
      instance_token,
      config,
      worker_count,
      queue_tx,
      slots: WorkerSlots::new(worker_count),
      next_job_id: AtomicU64::new(0),
      lifecycle: Mutex::new(Lifecycle {
        started: false,
        stopped: false,
        running: false,
        consumer: Some(queue_rx),
      }),
      in_flight: TaskTracker::new(),
      dispatch_done: CancellationToken::new(),
      shared,
    }))
  }

  pub fn id(&self) -> PoolId {
    self.id
  }

  pub fn instance_token(&self) -> &InstanceToken {
    &self.instance_token
  }

  /// The configured name, if any.
  pub fn name(&self) -> Option<&str> {
    self.config.name.as_deref()
  }

  pub fn worker_count(&self) -> usize {
    self.worker_count
  }

  pub fn queue_capacity(&self) -> usize {
    self.queue_tx.capacity()
  }

  pub fn termination_policy(&self) -> Option<TerminationPolicy> {
    self.config.termination
  }

  pub fn max_job_count(&self) -> Option<u64> {
    self.config.termination.map(|policy| policy.max_job_count)
  }

  /// The execution scope shared with every job executor.
  pub fn scope(&self) -> &CancellationToken {
    &self.shared.scope
  }

  pub fn is_started(&self) -> bool {
    self.lifecycle.lock().started
  }

  pub fn is_stopped(&self) -> bool {
    self.lifecycle.lock().stopped
  }

  pub fn stats(&self) -> PoolStats {
    let occupancy = self.slots.counters().occupancy();
    PoolStats {
      worker_count: self.worker_count,
      active_workers: occupancy.active,
      available_workers: occupancy.available,
      jobs_served: self.slots.counters().jobs_served(),
      queued_jobs: self.queue_tx.len(),
      in_flight: self.in_flight.len(),
    }
  }

  /// In-flight jobs as `(id, name)` pairs, ordered by id.
  pub fn active_jobs(&self) -> Vec<(JobId, String)> {
    let mut jobs: Vec<(JobId, String)> = self
      .shared
      .active_jobs
      .iter()
      .map(|entry| (*entry.key(), entry.value().to_string()))
      .collect();
    jobs.sort_unstable_by_key(|(id, _)| *id);
    jobs
  }

  /// Registers a handler invoked with the outcome of every job that finishes
  /// after registration. Handlers run on a background task, one outcome at a
  /// time, in completion order.
  pub fn on_job_completed(&self, handler: impl Fn(&JobOutcome) + Send + Sync + 'static) {
    self.shared.notifier.add_handler(handler);
  }

  /// Wraps `processor` into a job with the next sequence number. Without an
  /// explicit name the job is named after its processor.
  pub fn new_job<P: JobProcessor<R>>(&self, name: Option<&str>, processor: P) -> Job<R> {
    let id = self.next_job_id.fetch_add(1, AtomicOrdering::Relaxed) + 1;
    let name: Arc<str> = Arc::from(name.unwrap_or_else(|| processor.name()));
    Job {
      id,
      name,
      processor: Box::new(processor),
    }
  }

  /// Queues a job, waiting while the queue is full.
  ///
  /// # Errors
  /// `PoolStopped` after `stop`, `ScopeCancelled` once the scope is
  /// cancelled (including while waiting for queue space).
  pub async fn submit(&self, job: Job<R>) -> Result<JobId, PoolError> {
    let job_id = job.id;
    trace!(pool_name = %self.shared.pool_name, job_id, job_name = %job.name, "Submitting job to queue.");
    match self.queue_tx.send(job, &self.shared.scope).await {
      Ok(()) => Ok(job_id),
      Err(e) => {
        warn!(pool_name = %self.shared.pool_name, job_id, "Submit: job rejected: {}", e);
        Err(e)
      }
    }
  }

  /// `new_job` followed by `submit`.
  pub async fn add_job<P: JobProcessor<R>>(&self, processor: P) -> Result<JobId, PoolError> {
    let job = self.new_job(None, processor);
    self.submit(job).await
  }

  /// Runs the dispatch loop on the calling task until the scope is cancelled
  /// and all in-flight jobs have finished.
  ///
  /// Only the first call runs the loop; later calls return
  /// `DispatchExit::AlreadyRunning` immediately.
  ///
  /// # Errors
  /// `PoolStopped` if the pool has been stopped.
  pub async fn start(&self) -> Result<DispatchExit, PoolError> {
    match self.claim_dispatch_loop()? {
      Some(claim) => Ok(self.run_claimed(claim).await),
      None => Ok(DispatchExit::AlreadyRunning),
    }
  }

  /// Spawns the dispatch loop on the pool's runtime and returns its join
  /// handle, which resolves to what `start` would have returned.
  ///
  /// The loop is claimed before this returns, so a `shutdown` issued right
  /// after `spawn` waits for it whether or not the handle is kept.
  pub fn spawn(self: &Arc<Self>) -> JoinHandle<Result<DispatchExit, PoolError>> {
    let claimed = self.claim_dispatch_loop();
    let pool = self.clone();
    self.shared.tokio_handle.spawn(async move {
      match claimed {
        Ok(Some(claim)) => Ok(pool.run_claimed(claim).await),
        Ok(None) => Ok(DispatchExit::AlreadyRunning),
        Err(e) => Err(e),
      }
    })
  }

  fn claim_dispatch_loop(&self) -> Result<Option<DispatchClaim<R>>, PoolError> {
    let mut lifecycle = self.lifecycle.lock();
    if lifecycle.stopped {
      warn!(pool_name = %self.shared.pool_name, "Start: pool is stopped, refusing to start.");
      return Err(PoolError::PoolStopped);
    }
    if lifecycle.started {
      warn!(pool_name = %self.shared.pool_name, "Start: dispatch loop already running.");
      return Ok(None);
    }
    let Some(consumer) = lifecycle.consumer.take() else {
      return Ok(None);
    };
    lifecycle.started = true;
    lifecycle.running = true;
    Ok(Some(DispatchClaim {
      consumer,
      _done: self.dispatch_done.clone().drop_guard(),
    }))
  }

  async fn run_claimed(&self, claim: DispatchClaim<R>) -> DispatchExit {
    let DispatchClaim { consumer, _done } = claim;
    if let Some(message) = &self.config.start_message {
      info!(pool_name = %self.shared.pool_name, "{}", message);
    }

    let span = info_span!("workpool_dispatch_loop", pool_name = %self.shared.pool_name, pool_id = self.id);
    self.run_dispatch_loop(consumer).instrument(span).await;

    {
      let mut lifecycle = self.lifecycle.lock();
      lifecycle.running = false;
      if lifecycle.stopped {
        self.shared.notifier.close();
      }
    }
    DispatchExit::Drained
  }

  /// Closes the job queue and the worker slots. Idempotent: returns `true`
  /// only for the call that actually stopped the pool.
  ///
  /// Normally called after the scope is cancelled and the dispatch loop has
  /// returned. If the loop is still running, `stop` does not wait: the loop
  /// stops dispatching, reports every job left in the queue as dropped and
  /// returns once its in-flight jobs finish. The outcome channel closes only
  /// then.
  pub fn stop(&self) -> bool {
    let mut lifecycle = self.lifecycle.lock();
    if lifecycle.stopped {
      debug!(pool_name = %self.shared.pool_name, "Stop: pool already stopped.");
      return false;
    }
    lifecycle.stopped = true;
    lifecycle.started = false;

    self.queue_tx.close();
    self.slots.close();
    if !lifecycle.running {
      self.shared.notifier.close();
    }

    if let Some(message) = &self.config.stop_message {
      info!(pool_name = %self.shared.pool_name, "{}", message);
    }
    info!(
      pool_name = %self.shared.pool_name,
      jobs_served = self.slots.counters().jobs_served(),
      "Pool stopped. Job queue and worker slots closed."
    );
    true
  }

  /// Cancels the scope, waits for the dispatch loop and every in-flight job,
  /// stops the pool and waits for pending outcome notifications.
  pub async fn shutdown(&self) {
    info!(pool_name = %self.shared.pool_name, "Initiating pool shutdown.");
    self.shared.scope.cancel();

    let loop_taken = self.lifecycle.lock().consumer.is_none();
    if loop_taken {
      self.dispatch_done.cancelled().await;
      debug!(pool_name = %self.shared.pool_name, "Dispatch loop returned.");
    }

    self.in_flight.close();
    self.in_flight.wait().await;
    self.stop();
    self.shared.notifier.await_shutdown().await;
    info!(pool_name = %self.shared.pool_name, "Pool shutdown completed.");
  }

  async fn run_dispatch_loop(&self, mut consumer: QueueConsumer<R>) {
    let scope = self.shared.scope.clone();
    info!(worker_count = self.worker_count, "Dispatch loop started.");

    loop {
      tokio::select! {
        biased;

        _ = scope.cancelled() => {
          info!("Scope cancelled. Dispatch loop stops taking jobs.");
          break;
        }

        received = consumer.recv() => {
          let Some(job) = received else {
            info!("Job queue closed and drained. Dispatch loop stops taking jobs.");
            break;
          };

          let slot = tokio::select! {
            biased;
            _ = scope.cancelled() => None,
            slot = self.slots.acquire() => slot,
          };

          match slot {
            Some(slot) => self.dispatch(job, slot),
            None => {
              if self.slots.is_closed() {
                info!(job_id = job.id, "Worker slots closed. Dropping dequeued job.");
              } else {
                info!(job_id = job.id, "Scope cancelled while waiting for a worker slot. Dropping dequeued job.");
              }
              let outcome = self.shared.outcome(job.id, job.name.clone(), JobStatus::Dropped, None);
              self.shared.notifier.notify(outcome).await;
              break;
            }
          }
        }
      }
    }

    let leftover = consumer.drain_ready();
    if !leftover.is_empty() {
      info!(count = leftover.len(), "Dropping jobs left in the queue.");
    }
    for job in leftover {
      let outcome = self.shared.outcome(job.id, job.name.clone(), JobStatus::Dropped, None);
      self.shared.notifier.notify(outcome).await;
    }

    self.in_flight.close();
    self.in_flight.wait().await;
    info!(
      jobs_served = self.slots.counters().jobs_served(),
      "Dispatch loop stopped. All in-flight jobs finished."
    );
  }

  fn dispatch(&self, job: Job<R>, slot: SlotGuard) {
    let job_id = job.id;
    let in_flight = InFlightJob::register(self.shared.clone(), job_id, job.name.clone(), slot);
    debug!(
      job_id,
      job_name = %job.name,
      occupancy = ?self.slots.counters().occupancy(),
      "Dispatching job."
    );

    let span = info_span!("workpool_job", pool_name = %self.shared.pool_name, job_id);
    self.in_flight.spawn_on(
      executor::execute(self.shared.clone(), job, in_flight).instrument(span),
      &self.shared.tokio_handle,
    );
  }
}
