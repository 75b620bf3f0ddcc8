use futures_workpool::{job_fn, JobError, JobOutcome, JobStatus, Pool, PoolConfig};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

fn setup_tracing_for_test() {
  use std::sync::Once;
  use tracing_subscriber::{fmt, EnvFilter};
  static TRACING_INIT: Once = Once::new();

  TRACING_INIT.call_once(|| {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,futures_workpool=debug"));

    fmt::Subscriber::builder()
      .with_env_filter(filter)
      .with_test_writer()
      .try_init()
      .ok();
  });
}

fn new_pool(name: &str) -> (Arc<Pool<String>>, CancellationToken) {
  let scope = CancellationToken::new();
  let pool = Pool::new(
    PoolConfig::new(10).with_name(name),
    scope.clone(),
    tokio::runtime::Handle::current(),
  )
  .unwrap();
  (pool, scope)
}

fn collect_outcomes(pool: &Pool<String>) -> Arc<Mutex<Vec<JobOutcome>>> {
  let outcomes = Arc::new(Mutex::new(Vec::new()));
  let sink = outcomes.clone();
  pool.on_job_completed(move |outcome| sink.lock().push(outcome.clone()));
  outcomes
}

fn by_job_id(outcomes: &[JobOutcome]) -> HashMap<u64, JobOutcome> {
  outcomes.iter().map(|o| (o.job_id, o.clone())).collect()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_outcomes_report_success_failure_and_panic() {
  setup_tracing_for_test();
  let (pool, _scope) = new_pool("test_notifier_statuses");
  let outcomes = collect_outcomes(&pool);
  pool.spawn();

  let ok_id = pool
    .add_job(job_fn("ok", |_ctx| async { Ok::<_, JobError>("fine".to_string()) }))
    .await
    .unwrap();
  let failed_id = pool
    .add_job(job_fn("fails", |_ctx| async { Err::<String, JobError>("boom".into()) }))
    .await
    .unwrap();
  let panicked_id = pool
    .add_job(job_fn("panics", |ctx| async move {
      if ctx.job_id() > 0 {
        panic!("kaboom in job {}", ctx.job_id());
      }
      Ok::<_, JobError>(String::new())
    }))
    .await
    .unwrap();

  sleep(Duration::from_millis(200)).await;
  pool.shutdown().await;

  let outcomes = outcomes.lock();
  assert_eq!(outcomes.len(), 3, "outcomes: {:?}", *outcomes);
  let by_id = by_job_id(&outcomes);

  let ok = &by_id[&ok_id];
  assert_eq!(ok.status, JobStatus::Succeeded);
  assert_eq!(ok.error, None);
  assert_eq!(&*ok.job_name, "ok");
  assert_eq!(&*ok.pool_name, "test_notifier_statuses");
  assert_eq!(ok.pool_id, pool.id());

  let failed = &by_id[&failed_id];
  assert_eq!(failed.status, JobStatus::Failed);
  assert_eq!(failed.error.as_deref(), Some("boom"));

  let panicked = &by_id[&panicked_id];
  assert_eq!(panicked.status, JobStatus::Panicked);
  assert!(panicked.error.as_deref().unwrap_or_default().contains("kaboom"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_cancellation_wins_over_simultaneous_result() {
  setup_tracing_for_test();
  let (pool, scope) = new_pool("test_notifier_tie_break");
  let outcomes = collect_outcomes(&pool);
  pool.spawn();

  // The result is ready at the same instant the scope is cancelled.
  let job_id = pool
    .add_job(job_fn("cancels_then_returns", |ctx| async move {
      ctx.cancel_pool();
      Ok::<_, JobError>("late result".to_string())
    }))
    .await
    .unwrap();

  sleep(Duration::from_millis(100)).await;
  assert!(scope.is_cancelled());
  pool.shutdown().await;

  let outcomes = outcomes.lock();
  assert_eq!(outcomes.len(), 1);
  assert_eq!(outcomes[0].job_id, job_id);
  assert_eq!(outcomes[0].status, JobStatus::Cancelled);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_shutdown_reports_cancelled_and_dropped_jobs() {
  setup_tracing_for_test();
  let (pool, _scope) = new_pool("test_notifier_dropped");
  let outcomes = collect_outcomes(&pool);
  pool.spawn();

  // Ten occupy every slot, the eleventh is dequeued and waits for a slot,
  // the rest stay in the queue.
  for _ in 0..15 {
    pool
      .add_job(job_fn("cooperative", |ctx| async move {
        ctx.cancelled().await;
        Ok::<_, JobError>(String::new())
      }))
      .await
      .unwrap();
  }
  sleep(Duration::from_millis(100)).await;
  assert_eq!(pool.stats().active_workers, 10);
  assert_eq!(pool.stats().queued_jobs, 4);

  pool.shutdown().await;

  let outcomes = outcomes.lock();
  assert_eq!(outcomes.len(), 15, "outcomes: {:?}", *outcomes);
  let by_id = by_job_id(&outcomes);
  for id in 1..=10u64 {
    assert_eq!(by_id[&id].status, JobStatus::Cancelled, "job {}", id);
  }
  for id in 11..=15u64 {
    assert_eq!(by_id[&id].status, JobStatus::Dropped, "job {}", id);
  }
  assert_eq!(pool.stats().jobs_served, 10);
  assert_eq!(pool.stats().queued_jobs, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_panicking_handler_does_not_stop_delivery() {
  setup_tracing_for_test();
  let (pool, _scope) = new_pool("test_notifier_handler_panic");
  let delivered = Arc::new(AtomicUsize::new(0));

  pool.on_job_completed(|outcome| {
    if outcome.job_id == 1 {
      panic!("handler failed on job 1");
    }
  });
  {
    let delivered = delivered.clone();
    pool.on_job_completed(move |_outcome| {
      delivered.fetch_add(1, Ordering::SeqCst);
    });
  }
  pool.spawn();

  for _ in 0..3 {
    pool
      .add_job(job_fn("quick", |_ctx| async { Ok::<_, JobError>(String::new()) }))
      .await
      .unwrap();
  }
  sleep(Duration::from_millis(200)).await;
  pool.shutdown().await;

  assert_eq!(delivered.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn test_outcomes_without_handlers_are_discarded() {
  setup_tracing_for_test();
  let (pool, _scope) = new_pool("test_notifier_no_handlers");
  pool.spawn();

  pool
    .add_job(job_fn("quick", |_ctx| async { Ok::<_, JobError>(String::new()) }))
    .await
    .unwrap();
  sleep(Duration::from_millis(50)).await;

  // Registered after the first job finished: sees only later jobs.
  let outcomes = collect_outcomes(&pool);
  let second = pool
    .add_job(job_fn("quick", |_ctx| async { Ok::<_, JobError>(String::new()) }))
    .await
    .unwrap();
  sleep(Duration::from_millis(50)).await;
  pool.shutdown().await;

  let outcomes = outcomes.lock();
  assert_eq!(outcomes.len(), 1);
  assert_eq!(outcomes[0].job_id, second);
}
