/// Smallest number of worker slots a pool runs with.
pub const MIN_WORKERS: usize = 10;
/// Largest number of worker slots a pool runs with.
pub const MAX_WORKERS: usize = 100;
/// Job queue capacity per worker slot.
pub const QUEUE_CAPACITY_FACTOR: usize = 100;

/// Optional self-termination rule handed to every job processor.
///
/// The pool never enforces it; the processor running the job whose sequence
/// number equals `max_job_count` is expected to cancel the pool's scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TerminationPolicy {
  pub max_job_count: u64,
  pub terminate_on_max: bool,
}

impl TerminationPolicy {
  pub fn new(max_job_count: u64, terminate_on_max: bool) -> Self {
    Self {
      max_job_count,
      terminate_on_max,
    }
  }

  /// True when `job_id` is the job on which the pool should be cancelled.
  pub fn is_termination_point(&self, job_id: u64) -> bool {
    self.terminate_on_max && job_id == self.max_job_count
  }
}

/// Construction parameters of a `Pool`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolConfig {
  /// Requested worker count. Clamped into `[MIN_WORKERS, MAX_WORKERS]`.
  pub worker_count: usize,
  pub name: Option<String>,
  /// Logged when the dispatch loop starts.
  pub start_message: Option<String>,
  /// Logged when the pool is stopped.
  pub stop_message: Option<String>,
  pub termination: Option<TerminationPolicy>,
}

impl Default for PoolConfig {
  fn default() -> Self {
    Self {
      worker_count: MIN_WORKERS,
      name: None,
      start_message: None,
      stop_message: None,
      termination: None,
    }
  }
}

impl PoolConfig {
  pub fn new(worker_count: usize) -> Self {
    Self {
      worker_count,
      ..Self::default()
    }
  }

  pub fn with_name(mut self, name: impl Into<String>) -> Self {
    self.name = Some(name.into());
    self
  }

  pub fn with_start_message(mut self, message: impl Into<String>) -> Self {
    self.start_message = Some(message.into());
    self
  }

  pub fn with_stop_message(mut self, message: impl Into<String>) -> Self {
    self.stop_message = Some(message.into());
    self
  }

  pub fn with_termination(mut self, policy: TerminationPolicy) -> Self {
    self.termination = Some(policy);
    self
  }

  /// Worker count actually used by the pool. Out-of-range requests are
  /// clamped, never rejected.
  pub fn effective_worker_count(&self) -> usize {
    self.worker_count.clamp(MIN_WORKERS, MAX_WORKERS)
  }

  pub fn queue_capacity(&self) -> usize {
    self.effective_worker_count() * QUEUE_CAPACITY_FACTOR
  }

  /// Builds a configuration from `WORKPOOL_*` environment variables.
  pub fn from_env() -> Self {
    Self::from_lookup(|key| std::env::var(key).ok())
  }

  /// Builds a configuration from an arbitrary key lookup. Missing or
  /// unparsable values fall back to the defaults.
  pub fn from_lookup<F>(lookup: F) -> Self
  where
    F: Fn(&str) -> Option<String>,
  {
    let defaults = Self::default();

    let worker_count = lookup("WORKPOOL_WORKER_COUNT")
      .and_then(|s| s.trim().parse().ok())
      .unwrap_or(defaults.worker_count);

    let termination = lookup("WORKPOOL_MAX_JOB_COUNT")
      .and_then(|s| s.trim().parse::<u64>().ok())
      .map(|max_job_count| {
        let terminate_on_max = lookup("WORKPOOL_TERMINATE_ON_MAX")
          .map(|s| matches!(s.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes"))
          .unwrap_or(false);
        TerminationPolicy::new(max_job_count, terminate_on_max)
      });

    Self {
      worker_count,
      name: lookup("WORKPOOL_NAME").filter(|s| !s.is_empty()),
      start_message: lookup("WORKPOOL_START_MESSAGE"),
      stop_message: lookup("WORKPOOL_STOP_MESSAGE"),
      termination,
    }
  }
}
