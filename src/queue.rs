use crate::error::PoolError;
use crate::job::Job;

use fibre::mpsc::{self, AsyncReceiver, AsyncSender};
use futures::FutureExt;
use std::fmt;
use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;

/// A queued job paired with the capacity permit it occupies.
///
/// The permit is released when the message is dropped, which happens right
/// after the consumer receives it, so a queue slot frees only once the job
/// has actually left the queue.
struct QueueMessage<R: Send + 'static> {
  job: Job<R>,
  _permit: OwnedSemaphorePermit,
}

/// Bounded FIFO job queue.
///
/// An unbounded `fibre::mpsc` channel carries the jobs; a semaphore gate in
/// front of it enforces the capacity, so submitters wait while the queue is
/// full instead of having jobs rejected.
pub(crate) struct JobQueue;

impl JobQueue {
  /// Creates a queue holding at most `capacity` jobs and splits it into its
  /// producer and consumer halves.
  pub(crate) fn bounded<R: Send + 'static>(capacity: usize) -> (QueueProducer<R>, QueueConsumer<R>) {
    let (tx, rx) = mpsc::unbounded_async();
    let gate = Arc::new(Semaphore::new(capacity.max(1)));
    (
      QueueProducer {
        tx,
        gate,
        capacity: capacity.max(1),
      },
      QueueConsumer { rx },
    )
  }
}

/// Submission side of the queue. Cloneable.
pub(crate) struct QueueProducer<R: Send + 'static> {
  tx: AsyncSender<QueueMessage<R>>,
  gate: Arc<Semaphore>,
  capacity: usize,
}

/// Receiving side of the queue. Not cloneable: the dispatch loop is the only
/// consumer.
pub(crate) struct QueueConsumer<R: Send + 'static> {
  rx: AsyncReceiver<QueueMessage<R>>,
}

impl<R: Send + 'static> Clone for QueueProducer<R> {
  fn clone(&self) -> Self {
    Self {
      tx: self.tx.clone(),
      gate: self.gate.clone(),
      capacity: self.capacity,
    }
  }
}

impl<R: Send + 'static> fmt::Debug for QueueProducer<R> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("QueueProducer")
      .field("len", &self.len())
      .field("capacity", &self.capacity)
      .field("free", &self.gate.available_permits())
      .finish_non_exhaustive()
  }
}

impl<R: Send + 'static> fmt::Debug for QueueConsumer<R> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("QueueConsumer").finish_non_exhaustive()
  }
}

impl<R: Send + 'static> QueueProducer<R> {
  /// Enqueues a job, waiting while the queue is full.
  ///
  /// Fails with `PoolStopped` once the queue is closed, and with
  /// `ScopeCancelled` if `scope` is (or becomes, while waiting) cancelled.
  pub(crate) async fn send(&self, job: Job<R>, scope: &CancellationToken) -> Result<(), PoolError> {
    if self.is_closed() {
      return Err(PoolError::PoolStopped);
    }
    if scope.is_cancelled() {
      return Err(PoolError::ScopeCancelled);
    }

    let permit = tokio::select! {
      biased;
      _ = scope.cancelled() => return Err(PoolError::ScopeCancelled),
      acquired = self.gate.clone().acquire_owned() => match acquired {
        Ok(permit) => permit,
        Err(_) => return Err(PoolError::PoolStopped),
      },
    };

    let message = QueueMessage { job, _permit: permit };
    if self.tx.send(message).await.is_ok() {
      Ok(())
    } else if self.is_closed() {
      Err(PoolError::PoolStopped)
    } else {
      Err(PoolError::QueueSendChannelClosed)
    }
  }

  /// Closes the queue. Submitters blocked on a full queue are woken with
  /// `PoolStopped`; jobs already queued can still be received.
  pub(crate) fn close(&self) {
    let _ = self.tx.close();
    self.gate.close();
  }

  pub(crate) fn is_closed(&self) -> bool {
    self.tx.is_closed() || self.gate.is_closed()
  }

  /// Number of jobs currently waiting in the queue.
  pub(crate) fn len(&self) -> usize {
    self.tx.len()
  }

  pub(crate) fn capacity(&self) -> usize {
    self.capacity
  }
}

impl<R: Send + 'static> QueueConsumer<R> {
  /// Receives the oldest queued job. Returns `None` once the queue is closed
  /// and drained.
  pub(crate) async fn recv(&mut self) -> Option<Job<R>> {
    self.rx.recv().await.ok().map(|message| message.job)
  }

  /// Takes every job that is queued right now without waiting for more.
  pub(crate) fn drain_ready(&mut self) -> Vec<Job<R>> {
    let mut jobs = Vec::new();
    while let Some(Some(job)) = self.recv().now_or_never() {
      jobs.push(job);
    }
    jobs
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::job::{job_fn, JobError};
  use std::sync::atomic::{AtomicUsize, Ordering};
  use std::time::Duration;

  fn dummy_job(id: u64) -> Job<String> {
    Job {
      id,
      name: format!("job-{}", id).into(),
      processor: Box::new(job_fn("dummy", |_ctx| async { Ok::<_, JobError>("done".to_string()) })),
    }
  }

  #[tokio::test]
  async fn test_queue_send_recv_is_fifo() {
    let (producer, mut consumer) = JobQueue::bounded::<String>(5);
    let scope = CancellationToken::new();

    for id in 1..=3 {
      producer.send(dummy_job(id), &scope).await.unwrap();
    }
    assert_eq!(producer.len(), 3);
    assert_eq!(producer.gate.available_permits(), 2);

    for id in 1..=3 {
      assert_eq!(consumer.recv().await.unwrap().id(), id);
    }
    assert_eq!(producer.gate.available_permits(), 5);
  }

  #[tokio::test]
  async fn test_queue_capacity_blocks_send() {
    let (producer, mut consumer) = JobQueue::bounded::<String>(1);
    let scope = CancellationToken::new();

    producer.send(dummy_job(1), &scope).await.unwrap();
    assert_eq!(producer.gate.available_permits(), 0);

    let send_future = producer.send(dummy_job(2), &scope);
    tokio::pin!(send_future);

    tokio::select! {
      _ = &mut send_future => panic!("Send should have blocked because the queue is full."),
      _ = tokio::time::sleep(Duration::from_millis(50)) => {}
    }

    assert_eq!(consumer.recv().await.unwrap().id(), 1);

    tokio::time::timeout(Duration::from_millis(50), send_future)
      .await
      .expect("Send did not complete after queue was drained.")
      .unwrap();
    assert_eq!(consumer.recv().await.unwrap().id(), 2);
  }

  #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
  async fn test_queue_concurrent_sends() {
    let (producer, mut consumer) = JobQueue::bounded::<String>(4);
    let scope = CancellationToken::new();
    let num_jobs: u64 = 20;
    let received = Arc::new(AtomicUsize::new(0));

    let producers: Vec<_> = (0..num_jobs)
      .map(|i| {
        let p = producer.clone();
        let s = scope.clone();
        tokio::spawn(async move { p.send(dummy_job(i), &s).await.unwrap() })
      })
      .collect();

    let consumer_handle = {
      let received = received.clone();
      tokio::spawn(async move {
        for _ in 0..num_jobs {
          if consumer.recv().await.is_some() {
            received.fetch_add(1, Ordering::SeqCst);
          }
        }
      })
    };

    for p in producers {
      p.await.unwrap();
    }
    consumer_handle.await.unwrap();

    assert_eq!(received.load(Ordering::SeqCst), num_jobs as usize);
    assert_eq!(producer.gate.available_permits(), 4);
  }

  #[tokio::test]
  async fn test_send_respects_cancelled_scope() {
    let (producer, _consumer) = JobQueue::bounded::<String>(1);
    let scope = CancellationToken::new();

    producer.send(dummy_job(1), &scope).await.unwrap();

    let blocked = {
      let producer = producer.clone();
      let scope = scope.clone();
      tokio::spawn(async move { producer.send(dummy_job(2), &scope).await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;
    scope.cancel();

    assert_eq!(blocked.await.unwrap(), Err(PoolError::ScopeCancelled));
    assert_eq!(producer.send(dummy_job(3), &scope).await, Err(PoolError::ScopeCancelled));
  }

  #[tokio::test]
  async fn test_close_drains_then_ends() {
    let (producer, mut consumer) = JobQueue::bounded::<String>(2);
    let scope = CancellationToken::new();

    producer.send(dummy_job(1), &scope).await.unwrap();
    producer.close();
    assert!(producer.is_closed());

    assert_eq!(producer.send(dummy_job(2), &scope).await, Err(PoolError::PoolStopped));
    assert_eq!(consumer.recv().await.unwrap().id(), 1);
    assert!(consumer.recv().await.is_none());
  }

  #[tokio::test]
  async fn test_drain_ready_takes_queued_jobs_without_waiting() {
    let (producer, mut consumer) = JobQueue::bounded::<String>(3);
    let scope = CancellationToken::new();

    assert!(consumer.drain_ready().is_empty(), "empty open queue must not block");
    for id in 1..=3 {
      producer.send(dummy_job(id), &scope).await.unwrap();
    }

    let ids: Vec<u64> = consumer.drain_ready().iter().map(|job| job.id()).collect();
    assert_eq!(ids, vec![1, 2, 3]);
    assert_eq!(producer.len(), 0);
    assert_eq!(producer.gate.available_permits(), 3, "drained jobs free their queue slots");
  }
}
