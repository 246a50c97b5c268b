use std::collections::HashMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc::{Receiver, Sender, channel};
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, error};

/// A unit of work executed by a worker thread on behalf of a channel.
/// Either `service` or `cancel` runs, exactly once.
pub trait Task: Send {
    fn service(self: Box<Self>);

    /// Non-blocking teardown; typically closes the owning channel.
    fn cancel(self: Box<Self>);

    /// Called before the task enters the queue.
    fn defer(&self) {}
}

enum QueueEntry {
    Work(Box<dyn Task>),
    /// Sentinel that makes one worker exit.
    Stop,
}

#[derive(Debug, thiserror::Error)]
#[error("task queue is closed")]
pub struct QueueClosed;

struct ThreadState {
    handles: HashMap<usize, thread::JoinHandle<()>>,
    /// Number of workers that will exit soon because a Stop sentinel is in
    /// flight for them. running == handles.len() - stop_count.
    stop_count: usize,
    next_no: usize,
}

/// A bounded worker pool fed from a blocking queue. Workers pull tasks and
/// run them; panics are caught and logged so the pool survives bad tasks.
pub struct ThreadedTaskDispatcher {
    sender: Sender<QueueEntry>,
    receiver: Arc<Mutex<Receiver<QueueEntry>>>,
    pending: Arc<AtomicUsize>,
    state: Arc<Mutex<ThreadState>>,
}

impl ThreadedTaskDispatcher {
    pub fn new() -> Self {
        let (sender, receiver) = channel();
        ThreadedTaskDispatcher {
            sender,
            receiver: Arc::new(Mutex::new(receiver)),
            pending: Arc::new(AtomicUsize::new(0)),
            state: Arc::new(Mutex::new(ThreadState {
                handles: HashMap::new(),
                stop_count: 0,
                next_no: 0,
            })),
        }
    }

    /// Adjusts the pool toward `count` workers: grows by spawning, shrinks
    /// by queueing stop sentinels. Idempotent for an unchanged target.
    pub fn set_thread_count(&self, count: usize) {
        let mut state = self.state.lock();
        let mut running = state.handles.len().saturating_sub(state.stop_count);
        while running < count {
            let no = state.next_no;
            state.next_no += 1;
            let receiver = Arc::clone(&self.receiver);
            let pending = Arc::clone(&self.pending);
            let pool_state = Arc::clone(&self.state);
            let handle = thread::Builder::new()
                .name(format!("polyserve-worker-{}", no))
                .spawn(move || {
                    worker_loop(no, receiver, pending, pool_state);
                })
                .expect("failed to spawn worker thread");
            state.handles.insert(no, handle);
            running += 1;
        }
        if running > count {
            let to_stop = running - count;
            state.stop_count += to_stop;
            for _ in 0..to_stop {
                let _ = self.sender.send(QueueEntry::Stop);
            }
        }
    }

    /// Queues a task for a worker. The task's `defer` hook runs first; if
    /// the queue refuses the task, `cancel` runs and the error propagates.
    pub fn add_task(&self, task: Box<dyn Task>) -> Result<(), QueueClosed> {
        task.defer();
        self.pending.fetch_add(1, Ordering::SeqCst);
        match self.sender.send(QueueEntry::Work(task)) {
            Ok(()) => Ok(()),
            Err(err) => {
                self.pending.fetch_sub(1, Ordering::SeqCst);
                if let QueueEntry::Work(task) = err.0 {
                    task.cancel();
                }
                Err(QueueClosed)
            }
        }
    }

    /// Stops all workers, waiting up to `timeout` for them to drain. When
    /// `cancel_pending` is set, tasks still queued are cancelled.
    pub fn shutdown(&self, cancel_pending: bool, timeout: Duration) {
        self.set_thread_count(0);
        let expiration = Instant::now() + timeout;
        loop {
            let remaining = self.state.lock().handles.len();
            if remaining == 0 {
                break;
            }
            if Instant::now() >= expiration {
                error!("{} worker thread(s) still running", remaining);
                break;
            }
            thread::sleep(Duration::from_millis(100));
        }
        if cancel_pending {
            let receiver = self.receiver.lock();
            while let Ok(entry) = receiver.try_recv() {
                if let QueueEntry::Work(task) = entry {
                    self.pending.fetch_sub(1, Ordering::SeqCst);
                    task.cancel();
                }
            }
        }
    }

    /// Approximate number of queued, not yet started tasks.
    pub fn pending_tasks_estimate(&self) -> usize {
        self.pending.load(Ordering::SeqCst)
    }

    pub fn thread_count(&self) -> usize {
        let state = self.state.lock();
        state.handles.len().saturating_sub(state.stop_count)
    }
}

impl Default for ThreadedTaskDispatcher {
    fn default() -> Self {
        Self::new()
    }
}

fn worker_loop(
    no: usize,
    receiver: Arc<Mutex<Receiver<QueueEntry>>>,
    pending: Arc<AtomicUsize>,
    state: Arc<Mutex<ThreadState>>,
) {
    loop {
        // Hold the lock only for the blocking take, not while servicing.
        let entry = {
            let receiver = receiver.lock();
            receiver.recv()
        };
        match entry {
            Ok(QueueEntry::Work(task)) => {
                pending.fetch_sub(1, Ordering::SeqCst);
                if let Err(panic) = catch_unwind(AssertUnwindSafe(|| task.service())) {
                    error!(worker = no, "exception during task: {:?}", panic);
                }
            }
            Ok(QueueEntry::Stop) | Err(_) => break,
        }
    }
    debug!(worker = no, "worker exiting");
    let mut state = state.lock();
    state.stop_count = state.stop_count.saturating_sub(1);
    state.handles.remove(&no);
}
