use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use log::trace;

use crate::internal::{DEFAULT_CLOSE_TIMEOUT_MS, MIN_THREADPOOL_SIZE};
use crate::queue::Queue;

type Task = Box<dyn FnOnce() + Send + 'static>;

/// Shared worker pool executing tasks in no particular order.
///
/// Per-subsystem ordering is layered on top with [`Processor`].
pub(crate) struct ThreadPool {
    tasks: Arc<Queue<Task>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl ThreadPool {
    fn new(count: usize) -> Self {
        let tasks: Arc<Queue<Task>> = Arc::new(Queue::new(0));
        let mut workers = Vec::with_capacity(count);
        for i in 0..count {
            let tasks = Arc::clone(&tasks);
            workers.push(
                thread::Builder::new()
                    .name(format!("rtcdc-worker-{i}"))
                    .spawn(move || {
                        while let Some(task) = tasks.pop() {
                            task();
                        }
                    })
                    .expect("failed to spawn worker thread"),
            );
        }
        Self {
            tasks,
            workers: Mutex::new(workers),
        }
    }

    fn spawn(&self, task: Task) {
        self.tasks.push(task);
    }

    fn join(&self) {
        self.tasks.stop();
        let mut workers = self.workers.lock().unwrap();
        for handle in workers.drain(..) {
            let _ = handle.join();
        }
    }
}

static RUNTIME: Mutex<Option<Arc<Runtime>>> = Mutex::new(None);

/// Process-wide state: the shared worker pool and global settings.
///
/// A Runtime is created on first use and torn down by [`Runtime::shutdown`].
/// Components hold an `Arc` to the Runtime they were bound to, so an
/// in-flight PeerConnection keeps its pool alive across a shutdown.
pub struct Runtime {
    pool: ThreadPool,
    close_timeout_ms: AtomicU64,
}

impl Runtime {
    /// Returns the current global Runtime, creating it if needed.
    pub fn init() -> Arc<Runtime> {
        let mut global = RUNTIME.lock().unwrap();
        if let Some(runtime) = global.as_ref() {
            return Arc::clone(runtime);
        }
        let count = thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(MIN_THREADPOOL_SIZE)
            .max(MIN_THREADPOOL_SIZE);
        trace!("Starting runtime with {count} worker threads");
        let runtime = Arc::new(Runtime {
            pool: ThreadPool::new(count),
            close_timeout_ms: AtomicU64::new(DEFAULT_CLOSE_TIMEOUT_MS),
        });
        *global = Some(Arc::clone(&runtime));
        runtime
    }

    /// Joins the global worker pool and clears the global slot.
    ///
    /// Blocks until queued tasks have drained. Objects still bound to the
    /// old Runtime keep functioning; the next [`Runtime::init`] creates a
    /// fresh pool.
    pub fn shutdown() {
        let runtime = RUNTIME.lock().unwrap().take();
        if let Some(runtime) = runtime {
            trace!("Shutting down runtime");
            runtime.pool.join();
        }
    }

    /// Graceful cleanup timeout applied when closing peer connections and
    /// transports.
    pub fn close_timeout(&self) -> Duration {
        Duration::from_millis(self.close_timeout_ms.load(Ordering::Relaxed))
    }

    pub fn set_close_timeout(&self, timeout: Duration) {
        self.close_timeout_ms
            .store(timeout.as_millis() as u64, Ordering::Relaxed);
    }

    pub(crate) fn spawn(&self, task: impl FnOnce() + Send + 'static) {
        self.pool.spawn(Box::new(task));
    }
}

struct ProcessorState {
    tasks: VecDeque<Task>,
    running: bool,
}

struct ProcessorInner {
    runtime: Arc<Runtime>,
    state: Mutex<ProcessorState>,
    idle: Condvar,
}

impl ProcessorInner {
    fn schedule(self: &Arc<Self>, task: Task) {
        let inner = Arc::clone(self);
        self.runtime.spawn(move || {
            task();
            inner.next();
        });
    }

    fn next(self: &Arc<Self>) {
        let task = {
            let mut state = self.state.lock().unwrap();
            match state.tasks.pop_front() {
                Some(task) => Some(task),
                None => {
                    state.running = false;
                    self.idle.notify_all();
                    None
                }
            }
        };
        if let Some(task) = task {
            self.schedule(task);
        }
    }
}

/// Serial task executor backed by the shared worker pool.
///
/// Tasks enqueued on one Processor run in strict FIFO order, at most one at
/// a time, giving the owner a private virtual thread without a dedicated OS
/// thread.
#[derive(Clone)]
pub struct Processor {
    inner: Arc<ProcessorInner>,
}

impl Default for Processor {
    fn default() -> Self {
        Self::new()
    }
}

impl Processor {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(ProcessorInner {
                runtime: Runtime::init(),
                state: Mutex::new(ProcessorState {
                    tasks: VecDeque::new(),
                    running: false,
                }),
                idle: Condvar::new(),
            }),
        }
    }

    pub fn enqueue(&self, task: impl FnOnce() + Send + 'static) {
        let task: Task = Box::new(task);
        let run_now = {
            let mut state = self.inner.state.lock().unwrap();
            if state.running {
                state.tasks.push_back(task);
                None
            } else {
                state.running = true;
                Some(task)
            }
        };
        if let Some(task) = run_now {
            self.inner.schedule(task);
        }
    }

    /// Fence: blocks until all previously enqueued work has completed.
    pub fn join(&self) {
        let mut state = self.inner.state.lock().unwrap();
        while state.running || !state.tasks.is_empty() {
            state = self.inner.idle.wait(state).unwrap();
        }
    }

    /// Fence with a deadline; returns false on timeout.
    pub fn join_timeout(&self, timeout: Duration) -> bool {
        let state = self.inner.state.lock().unwrap();
        let (_state, result) = self
            .inner
            .idle
            .wait_timeout_while(state, timeout, |state| {
                state.running || !state.tasks.is_empty()
            })
            .unwrap();
        !result.timed_out()
    }
}
