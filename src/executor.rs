//! Single-threaded deterministic executor
//!
//! Runs lane futures in FIFO wake order so offline runs are reproducible.
//! Futures stay on the owning thread; only the ready queue is shared, which
//! keeps the wakers `Send + Sync` as the engine stores them behind its lock.

use parking_lot::Mutex;
use std::cell::RefCell;
use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll, Wake, Waker};

type LocalTask = Pin<Box<dyn Future<Output = ()>>>;

/// Ready queue shared with wakers.
#[derive(Default)]
struct ReadyQueue {
    ready: Mutex<VecDeque<usize>>,
}

/// Waker for one task.
struct TaskWaker {
    id: usize,
    /// Whether the task is already in the ready queue.
    scheduled: AtomicBool,
    queue: Arc<ReadyQueue>,
}

impl Wake for TaskWaker {
    fn wake(self: Arc<Self>) {
        self.wake_by_ref();
    }

    fn wake_by_ref(self: &Arc<Self>) {
        if !self.scheduled.swap(true, Ordering::AcqRel) {
            self.queue.ready.lock().push_back(self.id);
        }
    }
}

struct TaskEntry {
    /// `None` once the task finished (or while it is being polled).
    fut: Option<LocalTask>,
    waker: Arc<TaskWaker>,
}

/// Single-threaded deterministic executor.
pub struct LaneExecutor {
    tasks: RefCell<Vec<TaskEntry>>,
    queue: Arc<ReadyQueue>,
}

impl Default for LaneExecutor {
    fn default() -> Self {
        Self::new()
    }
}

impl LaneExecutor {
    pub fn new() -> Self {
        Self {
            tasks: RefCell::new(Vec::new()),
            queue: Arc::new(ReadyQueue::default()),
        }
    }

    /// Spawn a task; it first runs on the next `run_until_stalled`.
    pub fn spawn(&self, fut: impl Future<Output = ()> + 'static) -> usize {
        let mut tasks = self.tasks.borrow_mut();
        let id = tasks.len();
        let waker = Arc::new(TaskWaker {
            id,
            scheduled: AtomicBool::new(false),
            queue: self.queue.clone(),
        });
        waker.wake_by_ref();
        tasks.push(TaskEntry {
            fut: Some(Box::pin(fut)),
            waker,
        });
        id
    }

    /// Poll ready tasks until none are left. Returns the number of polls.
    pub fn run_until_stalled(&self) -> usize {
        let mut polls = 0;
        loop {
            let next = self.queue.ready.lock().pop_front();
            let Some(id) = next else {
                break;
            };

            let (fut, waker) = {
                let mut tasks = self.tasks.borrow_mut();
                let entry = &mut tasks[id];
                entry.waker.scheduled.store(false, Ordering::Release);
                (entry.fut.take(), entry.waker.clone())
            };
            // Finished tasks can still be woken by stale wakers.
            let Some(mut fut) = fut else {
                continue;
            };

            polls += 1;
            let waker = Waker::from(waker);
            let mut cx = Context::from_waker(&waker);
            if let Poll::Pending = fut.as_mut().poll(&mut cx) {
                self.tasks.borrow_mut()[id].fut = Some(fut);
            }
        }
        polls
    }

    pub fn has_ready_tasks(&self) -> bool {
        !self.queue.ready.lock().is_empty()
    }

    /// Tasks that have not finished yet.
    pub fn live_tasks(&self) -> usize {
        self.tasks
            .borrow()
            .iter()
            .filter(|t| t.fut.is_some())
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::rc::Rc;

    /// Parks once, handing its waker out, then finishes on the next poll.
    fn park_once(slot: Arc<Mutex<Option<Waker>>>) -> impl Future<Output = ()> {
        let mut parked = false;
        std::future::poll_fn(move |cx| {
            if parked {
                return Poll::Ready(());
            }
            parked = true;
            *slot.lock() = Some(cx.waker().clone());
            Poll::Pending
        })
    }

    #[test]
    fn test_spawned_tasks_run_in_spawn_order() {
        let exec = LaneExecutor::new();
        let log = Rc::new(RefCell::new(Vec::new()));
        for lane in [3, 1, 2] {
            let log = log.clone();
            exec.spawn(async move { log.borrow_mut().push(lane) });
        }
        assert_eq!(exec.run_until_stalled(), 3);
        assert_eq!(*log.borrow(), vec![3, 1, 2]);
        assert_eq!(exec.live_tasks(), 0);
    }

    #[test]
    fn test_resumes_in_wake_order() {
        let exec = LaneExecutor::new();
        let log = Rc::new(RefCell::new(Vec::new()));
        let wakers: Vec<_> = (0..3).map(|_| Arc::new(Mutex::new(None))).collect();
        for (lane, slot) in wakers.iter().enumerate() {
            let log = log.clone();
            let park = park_once(slot.clone());
            exec.spawn(async move {
                park.await;
                log.borrow_mut().push(lane);
            });
        }
        exec.run_until_stalled();
        assert_eq!(exec.live_tasks(), 3);

        for i in [2, 0, 1] {
            wakers[i].lock().take().unwrap().wake();
        }
        exec.run_until_stalled();
        assert_eq!(*log.borrow(), vec![2, 0, 1]);
    }

    #[test]
    fn test_duplicate_and_stale_wakes_are_ignored() {
        let exec = LaneExecutor::new();
        let slot = Arc::new(Mutex::new(None));
        exec.spawn(park_once(slot.clone()));
        exec.run_until_stalled();

        let waker = slot.lock().take().unwrap();
        waker.wake_by_ref();
        waker.wake_by_ref();
        assert_eq!(exec.run_until_stalled(), 1);
        assert_eq!(exec.live_tasks(), 0);

        // The task is gone; waking it again polls nothing.
        waker.wake();
        assert_eq!(exec.run_until_stalled(), 0);
    }

    #[test]
    fn test_wake_from_clock_thread() {
        let exec = LaneExecutor::new();
        let slot = Arc::new(Mutex::new(None));
        exec.spawn(park_once(slot.clone()));
        exec.run_until_stalled();
        assert!(!exec.has_ready_tasks());

        let waker = slot.lock().take().unwrap();
        std::thread::spawn(move || waker.wake()).join().unwrap();
        assert!(exec.has_ready_tasks());
        exec.run_until_stalled();
        assert_eq!(exec.live_tasks(), 0);
    }
}
