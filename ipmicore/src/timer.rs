//! Bounded pool of scheduler threads shared by all connections. Retries and
//! keep-alives run here; tasks must be short and must never hold connection
//! locks across a scheduling call (lock order is connection, then timer).

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering as MemoryOrdering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::{Duration, Instant};

type Task = Box<dyn FnMut() + Send>;

/// Cancellation handle for a scheduled task. Cancellation is best-effort
/// and idempotent: a task already claimed by a worker may still run once.
#[derive(Clone)]
pub struct TimerHandle {
    cancelled: Arc<AtomicBool>,
}

impl TimerHandle {
    #[inline]
    pub fn cancel(&self) {
        self.cancelled.store(true, MemoryOrdering::SeqCst);
    }

    #[inline]
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(MemoryOrdering::SeqCst)
    }
}

struct Entry {
    due: Instant,
    sequence: u64,
    period: Option<Duration>,
    cancelled: Arc<AtomicBool>,
    task: Task,
}

impl PartialEq for Entry {
    fn eq(&self, other: &Entry) -> bool {
        self.due == other.due && self.sequence == other.sequence
    }
}

impl Eq for Entry {}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Entry) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Entry {
    // Reversed so the binary heap pops the earliest deadline first.
    fn cmp(&self, other: &Entry) -> Ordering {
        other
            .due
            .cmp(&self.due)
            .then(other.sequence.cmp(&self.sequence))
    }
}

struct Shared {
    queue: Mutex<BinaryHeap<Entry>>,
    available: Condvar,
    shutdown: AtomicBool,
    sequence: AtomicU64,
}

/// Fixed-size pool of worker threads draining a deadline-ordered queue.
pub struct TimerService {
    shared: Arc<Shared>,
    workers: Mutex<Vec<thread::JoinHandle<()>>>,
}

enum Step {
    Wait,
    Sleep(Duration),
    Discard,
    Run,
}

impl TimerService {
    pub fn new(pool_size: usize) -> TimerService {
        let shared = Arc::new(Shared {
            queue: Mutex::new(BinaryHeap::new()),
            available: Condvar::new(),
            shutdown: AtomicBool::new(false),
            sequence: AtomicU64::new(0),
        });

        let workers = (0..pool_size.max(1))
            .map(|_| {
                let shared = shared.clone();
                thread::spawn(move || Self::run(shared))
            })
            .collect();

        TimerService {
            shared,
            workers: Mutex::new(workers),
        }
    }

    /// Schedules a one-shot task after the supplied delay.
    pub fn schedule_after<F: FnOnce() + Send + 'static>(
        &self,
        delay: Duration,
        task: F,
    ) -> TimerHandle {
        let mut slot = Some(task);

        self.schedule(
            delay,
            None,
            Box::new(move || {
                if let Some(task) = slot.take() {
                    task()
                }
            }),
        )
    }

    /// Schedules a periodic task; the first run fires one period from now.
    pub fn schedule_at_fixed_rate<F: FnMut() + Send + 'static>(
        &self,
        period: Duration,
        task: F,
    ) -> TimerHandle {
        self.schedule(period, Some(period), Box::new(task))
    }

    fn schedule(&self, delay: Duration, period: Option<Duration>, task: Task) -> TimerHandle {
        let cancelled = Arc::new(AtomicBool::new(false));

        let entry = Entry {
            due: Instant::now() + delay,
            sequence: self.shared.sequence.fetch_add(1, MemoryOrdering::Relaxed),
            period,
            cancelled: cancelled.clone(),
            task,
        };

        self.shared
            .queue
            .lock()
            .expect("Timer queue poisoned")
            .push(entry);
        self.shared.available.notify_one();

        TimerHandle { cancelled }
    }

    /// Stops the workers and drops all queued tasks. Idempotent.
    pub fn shutdown(&self) {
        self.shared.shutdown.store(true, MemoryOrdering::SeqCst);
        self.shared.available.notify_all();

        let workers: Vec<_> = self
            .workers
            .lock()
            .expect("Timer worker list poisoned")
            .drain(..)
            .collect();

        for worker in workers {
            drop(worker.join());
        }

        self.shared
            .queue
            .lock()
            .expect("Timer queue poisoned")
            .clear();
    }

    fn run(shared: Arc<Shared>) {
        let mut queue = shared.queue.lock().expect("Timer queue poisoned");

        loop {
            if shared.shutdown.load(MemoryOrdering::SeqCst) {
                break;
            }

            let now = Instant::now();

            let step = match queue.peek() {
                None => Step::Wait,
                Some(entry) if entry.cancelled.load(MemoryOrdering::SeqCst) => Step::Discard,
                Some(entry) if entry.due <= now => Step::Run,
                Some(entry) => Step::Sleep(entry.due - now),
            };

            match step {
                Step::Wait => {
                    queue = shared
                        .available
                        .wait(queue)
                        .expect("Timer queue poisoned");
                }
                Step::Sleep(duration) => {
                    queue = shared
                        .available
                        .wait_timeout(queue, duration)
                        .expect("Timer queue poisoned")
                        .0;
                }
                Step::Discard => {
                    queue.pop();
                }
                Step::Run => {
                    let mut entry = queue.pop().expect("Peeked entry vanished");
                    drop(queue);

                    (entry.task)();

                    if let Some(period) = entry.period {
                        if !entry.cancelled.load(MemoryOrdering::SeqCst)
                            && !shared.shutdown.load(MemoryOrdering::SeqCst)
                        {
                            entry.due = Instant::now() + period;
                            shared
                                .queue
                                .lock()
                                .expect("Timer queue poisoned")
                                .push(entry);
                            shared.available.notify_one();
                        }
                    }

                    queue = shared.queue.lock().expect("Timer queue poisoned");
                }
            }
        }
    }
}

impl Drop for TimerService {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_one_shot_fires() {
        let service = TimerService::new(2);
        let counter = Arc::new(AtomicUsize::new(0));

        let task_counter = counter.clone();
        service.schedule_after(Duration::from_millis(10), move || {
            task_counter.fetch_add(1, MemoryOrdering::SeqCst);
        });

        thread::sleep(Duration::from_millis(100));
        assert_eq!(counter.load(MemoryOrdering::SeqCst), 1);
    }

    #[test]
    fn test_cancel_prevents_run() {
        let service = TimerService::new(2);
        let counter = Arc::new(AtomicUsize::new(0));

        let task_counter = counter.clone();
        let handle = service.schedule_after(Duration::from_millis(50), move || {
            task_counter.fetch_add(1, MemoryOrdering::SeqCst);
        });

        handle.cancel();
        assert!(handle.is_cancelled());

        thread::sleep(Duration::from_millis(150));
        assert_eq!(counter.load(MemoryOrdering::SeqCst), 0);
    }

    #[test]
    fn test_periodic_repeats_until_cancelled() {
        let service = TimerService::new(2);
        let counter = Arc::new(AtomicUsize::new(0));

        let task_counter = counter.clone();
        let handle = service.schedule_at_fixed_rate(Duration::from_millis(10), move || {
            task_counter.fetch_add(1, MemoryOrdering::SeqCst);
        });

        thread::sleep(Duration::from_millis(120));
        handle.cancel();

        let fired = counter.load(MemoryOrdering::SeqCst);
        assert!(fired >= 3, "Expected at least 3 runs, got {}", fired);

        thread::sleep(Duration::from_millis(60));
        let after_cancel = counter.load(MemoryOrdering::SeqCst);
        // At most one dispatched run may still land after cancellation.
        assert!(after_cancel <= fired + 1);
    }

    #[test]
    fn test_shutdown_drops_pending() {
        let service = TimerService::new(2);
        let counter = Arc::new(AtomicUsize::new(0));

        let task_counter = counter.clone();
        service.schedule_after(Duration::from_millis(50), move || {
            task_counter.fetch_add(1, MemoryOrdering::SeqCst);
        });

        service.shutdown();
        thread::sleep(Duration::from_millis(120));

        assert_eq!(counter.load(MemoryOrdering::SeqCst), 0);
    }

    #[test]
    fn test_many_tasks_on_small_pool() {
        let service = TimerService::new(2);
        let counter = Arc::new(AtomicUsize::new(0));

        for _ in 0..20 {
            let task_counter = counter.clone();
            service.schedule_after(Duration::from_millis(5), move || {
                task_counter.fetch_add(1, MemoryOrdering::SeqCst);
            });
        }

        thread::sleep(Duration::from_millis(200));
        assert_eq!(counter.load(MemoryOrdering::SeqCst), 20);
    }
}
