use thiserror::Error;

/// Errors surfaced by a `Pool` to its caller.
///
/// Job payload failures are not represented here; they are reported through
/// the outcome hook as a `JobStatus`.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PoolError {
  #[error("Failed to generate pool instance token: {0}")]
  TokenGeneration(String),

  #[error("Pool is stopped, its job queue and worker slots are closed")]
  PoolStopped,

  #[error("Pool's execution scope is cancelled, cannot accept new jobs")]
  ScopeCancelled,

  #[error("Pool's internal job queue (sender side) was closed unexpectedly")]
  QueueSendChannelClosed,
}
