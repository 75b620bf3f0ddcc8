use crate::ident::PoolId;
use crate::job::JobId;

use fibre::mpsc::{self, AsyncReceiver, AsyncSender};
use parking_lot::{Mutex, RwLock};
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::SystemTime;
use tokio::runtime::Handle as TokioHandle;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, info_span, trace, Instrument};

// --- Public Event Types for Handlers ---

/// How a job left the pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JobStatus {
  /// The processor returned `Ok`.
  Succeeded,
  /// The processor returned `Err`.
  Failed,
  /// The processor panicked; the panic was contained by the executor.
  Panicked,
  /// The pool's scope was cancelled before the executor consumed the result.
  Cancelled,
  /// Never dispatched: the scope was cancelled, or the pool stopped, while
  /// the job waited in the queue or for a worker slot.
  Dropped,
}

#[derive(Debug, Clone)]
pub struct JobOutcome {
  pub pool_id: PoolId,
  pub pool_name: Arc<str>,
  pub job_id: JobId,
  pub job_name: Arc<str>,
  pub status: JobStatus,
  /// Error or panic message for `Failed` and `Panicked` jobs.
  pub error: Option<String>,
  pub completed_at: SystemTime,
}

type OutcomeHandler = Arc<dyn Fn(&JobOutcome) + Send + Sync + 'static>;

// --- OutcomeNotifier ---

struct NotifierState {
  rx: Option<AsyncReceiver<JobOutcome>>,
  tokio_handle: TokioHandle,
  worker_join_handle: Option<JoinHandle<()>>,
}

/// Fans job outcomes out to registered handlers.
///
/// Executors only enqueue outcomes; a background loop, started when the first
/// handler is registered, invokes the handlers in completion order. Outcomes
/// produced while no handler is registered are discarded.
pub(crate) struct OutcomeNotifier {
  pool_name: Arc<str>,
  handlers: Arc<RwLock<Vec<OutcomeHandler>>>,
  has_handlers: AtomicBool,
  tx: AsyncSender<JobOutcome>,
  state: Mutex<NotifierState>,
}

impl fmt::Debug for OutcomeNotifier {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let state = self.state.lock();
    f.debug_struct("OutcomeNotifier")
      .field("pool_name", &self.pool_name)
      .field("handler_count", &self.handlers.read().len())
      .field("worker_started", &state.rx.is_none())
      .finish()
  }
}

impl OutcomeNotifier {
  pub(crate) fn new(pool_name: Arc<str>, tokio_handle: TokioHandle) -> Self {
    let (tx, rx) = mpsc::unbounded_async();
    Self {
      pool_name,
      handlers: Arc::new(RwLock::new(Vec::new())),
      has_handlers: AtomicBool::new(false),
      tx,
      state: Mutex::new(NotifierState {
        rx: Some(rx),
        tokio_handle,
        worker_join_handle: None,
      }),
    }
  }

  pub(crate) fn add_handler(&self, handler: impl Fn(&JobOutcome) + Send + Sync + 'static) {
    self.ensure_worker_started();
    let total = {
      let mut handlers = self.handlers.write();
      handlers.push(Arc::new(handler));
      handlers.len()
    };
    self.has_handlers.store(true, AtomicOrdering::Release);
    info!(pool_name = %self.pool_name, "Added job outcome handler. Total handlers: {}", total);
  }

  fn ensure_worker_started(&self) {
    let mut state = self.state.lock();
    if let Some(rx) = state.rx.take() {
      info!(pool_name = %self.pool_name, "Starting job outcome notification loop.");
      let handlers = self.handlers.clone();
      let span = info_span!("workpool_outcome_loop", pool_name = %self.pool_name);
      let join_handle = state
        .tokio_handle
        .spawn(Self::run_notification_loop(rx, handlers).instrument(span));
      state.worker_join_handle = Some(join_handle);
    }
  }

  /// Queues an outcome for the handlers.
  pub(crate) async fn notify(&self, outcome: JobOutcome) {
    if !self.has_handlers.load(AtomicOrdering::Acquire) {
      trace!(job_id = outcome.job_id, "No outcome handlers registered, dropping outcome.");
      return;
    }
    let job_id = outcome.job_id;
    if self.tx.send(outcome).await.is_err() {
      debug!(pool_name = %self.pool_name, job_id, "Outcome channel closed, outcome not delivered.");
    }
  }

  /// Stops accepting outcomes. The loop drains what is already queued.
  pub(crate) fn close(&self) {
    let _ = self.tx.close();
  }

  /// Waits for the notification loop to drain and exit. Call after `close`.
  pub(crate) async fn await_shutdown(&self) {
    let handle = self.state.lock().worker_join_handle.take();
    if let Some(handle) = handle {
      if let Err(e) = handle.await {
        error!(pool_name = %self.pool_name, "Error joining outcome notification loop: {:?}", e);
      } else {
        debug!(pool_name = %self.pool_name, "Outcome notification loop joined.");
      }
    }
  }

  async fn run_notification_loop(rx: AsyncReceiver<JobOutcome>, handlers: Arc<RwLock<Vec<OutcomeHandler>>>) {
    while let Ok(outcome) = rx.recv().await {
      // Snapshot so handlers run without the lock held.
      let current: Vec<OutcomeHandler> = handlers.read().clone();
      for handler in current {
        let result = std::panic::catch_unwind(AssertUnwindSafe(|| handler(&outcome)));
        if result.is_err() {
          error!(
            pool_name = %outcome.pool_name,
            job_id = outcome.job_id,
            "A job outcome handler panicked."
          );
        }
      }
    }
    info!("Outcome notification loop stopped (channel closed and drained).");
  }
}
