use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::trace;

// Occupancy word layout: active count in the high 32 bits, available count in
// the low 32 bits. Moving one worker between the two is a single atomic add,
// so `active + available == worker_count` holds for every load.
const ACTIVE_UNIT: u64 = 1 << 32;
const AVAILABLE_MASK: u64 = ACTIVE_UNIT - 1;
const TAKE_ONE: u64 = ACTIVE_UNIT - 1;

/// A consistent view of how many worker slots are busy and free.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerOccupancy {
  pub active: usize,
  pub available: usize,
}

/// Lock-free bookkeeping shared by the dispatch loop and every executor.
pub(crate) struct WorkerCounters {
  worker_count: usize,
  occupancy: AtomicU64,
  jobs_served: AtomicU64,
}

impl fmt::Debug for WorkerCounters {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("WorkerCounters")
      .field("worker_count", &self.worker_count)
      .field("occupancy", &self.occupancy())
      .field("jobs_served", &self.jobs_served())
      .finish()
  }
}

impl WorkerCounters {
  pub(crate) fn new(worker_count: usize) -> Self {
    Self {
      worker_count,
      occupancy: AtomicU64::new(worker_count as u64),
      jobs_served: AtomicU64::new(0),
    }
  }

  pub(crate) fn occupancy(&self) -> WorkerOccupancy {
    let word = self.occupancy.load(AtomicOrdering::Acquire);
    WorkerOccupancy {
      active: (word >> 32) as usize,
      available: (word & AVAILABLE_MASK) as usize,
    }
  }

  pub(crate) fn jobs_served(&self) -> u64 {
    self.jobs_served.load(AtomicOrdering::Acquire)
  }

  // Callers hold a semaphore permit, so available >= 1 here.
  fn mark_dispatched(&self) {
    self.occupancy.fetch_add(TAKE_ONE, AtomicOrdering::AcqRel);
    self.jobs_served.fetch_add(1, AtomicOrdering::AcqRel);
  }

  // Callers still hold the permit they were dispatched with, so active >= 1.
  fn mark_released(&self) {
    self.occupancy.fetch_sub(TAKE_ONE, AtomicOrdering::AcqRel);
  }
}

/// Counting semaphore of worker slots, sized once at construction.
#[derive(Debug)]
pub(crate) struct WorkerSlots {
  semaphore: Arc<Semaphore>,
  counters: Arc<WorkerCounters>,
}

impl WorkerSlots {
  pub(crate) fn new(worker_count: usize) -> Self {
    Self {
      semaphore: Arc::new(Semaphore::new(worker_count)),
      counters: Arc::new(WorkerCounters::new(worker_count)),
    }
  }

  pub(crate) fn counters(&self) -> &Arc<WorkerCounters> {
    &self.counters
  }

  /// Waits for a free slot. Returns `None` once the slots are closed.
  ///
  /// Acquisition marks the slot active and counts one more job served; the
  /// returned guard undoes the occupancy change when dropped.
  pub(crate) async fn acquire(&self) -> Option<SlotGuard> {
    let permit = self.semaphore.clone().acquire_owned().await.ok()?;
    self.counters.mark_dispatched();
    trace!(occupancy = ?self.counters.occupancy(), "Worker slot acquired.");
    Some(SlotGuard {
      counters: self.counters.clone(),
      _permit: permit,
    })
  }

  /// Closes the semaphore. Pending and future acquisitions return `None`.
  pub(crate) fn close(&self) {
    self.semaphore.close();
  }

  pub(crate) fn is_closed(&self) -> bool {
    self.semaphore.is_closed()
  }
}

/// One held worker slot. Dropping it returns the slot and restores the
/// occupancy counters, whatever path the holder exits by.
pub(crate) struct SlotGuard {
  counters: Arc<WorkerCounters>,
  // Dropped after `Drop::drop` runs, so counters move before the permit frees.
  _permit: OwnedSemaphorePermit,
}

impl fmt::Debug for SlotGuard {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("SlotGuard").finish_non_exhaustive()
  }
}

impl Drop for SlotGuard {
  fn drop(&mut self) {
    self.counters.mark_released();
    trace!(occupancy = ?self.counters.occupancy(), "Worker slot released.");
  }
}
