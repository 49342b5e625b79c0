use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio_util::sync::CancellationToken;

/// Jobs this worker has claimed and not yet released, with per-queue
/// counters for `max_jobs_per_worker`.
#[derive(Default)]
pub(crate) struct InFlight {
    total: AtomicUsize,
    per_queue: Mutex<HashMap<String, Arc<AtomicUsize>>>,
    jobs: Mutex<HashMap<i64, CancellationToken>>,
}

/// Increments `counter` unless it already reached `limit`.
fn increment_below(counter: &AtomicUsize, limit: usize) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
            (n < limit).then_some(n + 1)
        })
        .is_ok()
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl InFlight {
    fn queue_counter(&self, queue: &str) -> Arc<AtomicUsize> {
        lock(&self.per_queue)
            .entry(queue.to_string())
            .or_default()
            .clone()
    }

    /// Reserves one execution slot on `queue`, bounded by this worker's
    /// `concurrency` and the queue's `max_jobs_per_worker`. The slot is given
    /// back when the returned [`Slot`] is dropped.
    pub(crate) fn try_reserve(
        self: &Arc<Self>,
        queue: &str,
        max_jobs_per_worker: usize,
        concurrency: usize,
    ) -> Option<Slot> {
        if !increment_below(&self.total, concurrency) {
            return None;
        }
        let queue_counter = self.queue_counter(queue);
        if !increment_below(&queue_counter, max_jobs_per_worker) {
            self.total.fetch_sub(1, Ordering::SeqCst);
            return None;
        }
        Some(Slot {
            in_flight: self.clone(),
            queue_counter,
            job_id: None,
        })
    }

    pub(crate) fn total(&self) -> usize {
        self.total.load(Ordering::SeqCst)
    }

    pub(crate) fn has_free_slot(&self, concurrency: usize) -> bool {
        self.total() < concurrency
    }

    pub(crate) fn queue_count(&self, queue: &str) -> usize {
        lock(&self.per_queue)
            .get(queue)
            .map(|c| c.load(Ordering::SeqCst))
            .unwrap_or(0)
    }

    pub(crate) fn job_ids(&self) -> Vec<i64> {
        let mut ids: Vec<i64> = lock(&self.jobs).keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Triggers the cancellation token handed to the job's handler.
    pub(crate) fn cancel(&self, job_id: i64) -> bool {
        match lock(&self.jobs).get(&job_id) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }
}

/// A reserved execution slot, released on drop.
pub(crate) struct Slot {
    in_flight: Arc<InFlight>,
    queue_counter: Arc<AtomicUsize>,
    job_id: Option<i64>,
}

impl Slot {
    /// Binds the slot to a claimed job so heartbeats report it and it can be
    /// cancelled.
    pub(crate) fn attach(&mut self, job_id: i64, cancellation_token: CancellationToken) {
        lock(&self.in_flight.jobs).insert(job_id, cancellation_token);
        self.job_id = Some(job_id);
    }
}

impl Drop for Slot {
    fn drop(&mut self) {
        if let Some(job_id) = self.job_id {
            lock(&self.in_flight.jobs).remove(&job_id);
        }
        self.queue_counter.fetch_sub(1, Ordering::SeqCst);
        self.in_flight.total.fetch_sub(1, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slots_respect_both_limits_and_are_released_on_drop() {
        let in_flight = Arc::new(InFlight::default());

        let a = in_flight.try_reserve("emails", 2, 3).unwrap();
        let b = in_flight.try_reserve("emails", 2, 3).unwrap();
        assert!(in_flight.try_reserve("emails", 2, 3).is_none());

        let c = in_flight.try_reserve("reports", 2, 3).unwrap();
        assert!(in_flight.try_reserve("reports", 2, 3).is_none());
        assert_eq!(in_flight.total(), 3);

        drop(a);
        assert_eq!(in_flight.queue_count("emails"), 1);
        assert!(in_flight.has_free_slot(3));
        drop((b, c));
        assert_eq!(in_flight.total(), 0);
    }

    #[test]
    fn attached_jobs_are_reported_and_cancellable() {
        let in_flight = Arc::new(InFlight::default());
        let mut slot = in_flight.try_reserve("emails", 1, 1).unwrap();
        let token = CancellationToken::new();
        slot.attach(7, token.clone());

        assert_eq!(in_flight.job_ids(), vec![7]);
        assert!(in_flight.cancel(7));
        assert!(token.is_cancelled());

        drop(slot);
        assert!(in_flight.job_ids().is_empty());
        assert!(!in_flight.cancel(7));
    }
}
