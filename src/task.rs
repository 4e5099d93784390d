use std::panic::{catch_unwind, AssertUnwindSafe};
use std::pin::Pin;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::task::{Context, Poll, Waker};

use crate::error::ClientError;

/// Outcome of one task execution: a value or an error, never both.
#[derive(Debug)]
pub enum TaskOutcome<T> {
    Success(T),
    Failure(ClientError),
}

impl<T> TaskOutcome<T> {
    pub fn is_success(&self) -> bool {
        matches!(self, TaskOutcome::Success(_))
    }
}

/// A unit of deferred work. `execute` runs synchronously on whichever
/// thread invokes it; scheduling is the caller's concern.
pub trait Task: Send + 'static {
    type Output: Send + Sync + 'static;

    fn execute(&mut self) -> TaskOutcome<Self::Output>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Pending,
    Started,
    Done,
    Canceled,
}

impl TaskState {
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskState::Done | TaskState::Canceled)
    }
}

type ThenCallback<T> = Box<dyn FnOnce(&TaskOutcome<T>) + Send>;
type BeforeCallback<T> = Box<dyn FnOnce(&TaskFuture<T>) + Send>;

struct FutureCore<T> {
    state: TaskState,
    outcome: Option<Arc<TaskOutcome<T>>>,
    before: Vec<BeforeCallback<T>>,
    then: Vec<ThenCallback<T>>,
    wakers: Vec<Waker>,
}

struct FutureInner<T> {
    core: Mutex<FutureCore<T>>,
    completed: Condvar,
}

/// Handle around one task execution: registration point for callbacks,
/// cancellation, and the blocking `get` join.
///
/// State transitions are monotonic — once `Done` or `Canceled` is reached
/// the future never leaves it. Cloning yields another handle to the same
/// execution.
pub struct TaskFuture<T> {
    inner: Arc<FutureInner<T>>,
}

impl<T> Clone for TaskFuture<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Send + Sync + 'static> Default for TaskFuture<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Send + Sync + 'static> TaskFuture<T> {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(FutureInner {
                core: Mutex::new(FutureCore {
                    state: TaskState::Pending,
                    outcome: None,
                    before: Vec::new(),
                    then: Vec::new(),
                    wakers: Vec::new(),
                }),
                completed: Condvar::new(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, FutureCore<T>> {
        // A panicking callback never runs while the lock is held, but
        // recover from poisoning anyway rather than cascading the panic.
        self.inner.core.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn state(&self) -> TaskState {
        self.lock().state
    }

    /// Cancel this execution. Before the task starts this prevents it from
    /// running at all; while it is in flight the computation is not
    /// interrupted, but callbacks are suppressed and `get` reports
    /// cancellation. After completion this is a no-op.
    pub fn cancel(&self) -> bool {
        let mut core = self.lock();
        match core.state {
            TaskState::Pending | TaskState::Started => {
                core.state = TaskState::Canceled;
                core.before.clear();
                core.then.clear();
                let wakers = std::mem::take(&mut core.wakers);
                drop(core);
                self.inner.completed.notify_all();
                for waker in wakers {
                    waker.wake();
                }
                true
            }
            TaskState::Done | TaskState::Canceled => false,
        }
    }

    /// Register a callback to run strictly before the task executes.
    /// Callbacks compose in registration order and may cancel the future;
    /// cancellation is checked immediately after each one runs.
    pub fn before_execution<F>(&self, callback: F)
    where
        F: FnOnce(&TaskFuture<T>) + Send + 'static,
    {
        let mut core = self.lock();
        if core.state == TaskState::Pending {
            core.before.push(Box::new(callback));
        } else {
            tracing::debug!(
                "before_execution registered in state {:?}, ignoring",
                core.state
            );
        }
    }

    /// Register a completion callback. Runs exactly once after the outcome
    /// is known, success or failure. Registering after completion delivers
    /// immediately on the calling thread. Suppressed by cancellation.
    pub fn then<F>(&self, callback: F)
    where
        F: FnOnce(&TaskOutcome<T>) + Send + 'static,
    {
        let immediate = {
            let mut core = self.lock();
            match core.state {
                TaskState::Done => core.outcome.clone(),
                TaskState::Canceled => return,
                TaskState::Pending | TaskState::Started => {
                    core.then.push(Box::new(callback));
                    return;
                }
            }
        };
        if let Some(outcome) = immediate {
            invoke_then(Box::new(callback), &outcome);
        }
    }

    /// Block the calling thread until the outcome is known. Returns the
    /// shared outcome, or `ClientError::Canceled` if the future was
    /// canceled. Repeated calls return the same outcome.
    pub fn get(&self) -> Result<Arc<TaskOutcome<T>>, ClientError> {
        let mut core = self.lock();
        while !core.state.is_terminal() {
            core = self
                .inner
                .completed
                .wait(core)
                .unwrap_or_else(|e| e.into_inner());
        }
        if core.state == TaskState::Canceled {
            return Err(ClientError::Canceled);
        }
        core.outcome.clone().ok_or(ClientError::Canceled)
    }

    /// Resolve this future with an outcome. Used by executors that perform
    /// the work themselves (the request scheduler, URL resolvers). Ignored
    /// once a terminal state has been reached.
    pub fn complete(&self, outcome: TaskOutcome<T>) {
        let (shared, callbacks, wakers) = {
            let mut core = self.lock();
            match core.state {
                TaskState::Pending | TaskState::Started => {
                    let shared = Arc::new(outcome);
                    core.state = TaskState::Done;
                    core.outcome = Some(Arc::clone(&shared));
                    let callbacks = std::mem::take(&mut core.then);
                    let wakers = std::mem::take(&mut core.wakers);
                    (shared, callbacks, wakers)
                }
                TaskState::Canceled => {
                    tracing::trace!("outcome for canceled future discarded");
                    return;
                }
                TaskState::Done => return,
            }
        };
        self.inner.completed.notify_all();
        for waker in wakers {
            waker.wake();
        }
        for callback in callbacks {
            invoke_then(callback, &shared);
        }
    }

    /// Execute `task` through this future on the current thread: run the
    /// before-callbacks, honor cancellation, execute, complete.
    pub fn run<K>(&self, mut task: K)
    where
        K: Task<Output = T>,
    {
        let before = {
            let mut core = self.lock();
            if core.state != TaskState::Pending {
                return;
            }
            std::mem::take(&mut core.before)
        };

        for callback in before {
            let this = self.clone();
            if catch_unwind(AssertUnwindSafe(move || callback(&this))).is_err() {
                tracing::error!("panic in before_execution callback");
            }
            if self.state() == TaskState::Canceled {
                return;
            }
        }

        {
            let mut core = self.lock();
            if core.state != TaskState::Pending {
                return;
            }
            core.state = TaskState::Started;
        }

        self.complete(task.execute());
    }
}

/// Async counterpart of `get`: awaiting the handle yields the shared
/// outcome once the execution reaches a terminal state.
impl<T: Send + Sync + 'static> std::future::Future for TaskFuture<T> {
    type Output = Result<Arc<TaskOutcome<T>>, ClientError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut core = self.lock();
        match core.state {
            TaskState::Done => match core.outcome.clone() {
                Some(outcome) => Poll::Ready(Ok(outcome)),
                None => Poll::Ready(Err(ClientError::Canceled)),
            },
            TaskState::Canceled => Poll::Ready(Err(ClientError::Canceled)),
            TaskState::Pending | TaskState::Started => {
                core.wakers.push(cx.waker().clone());
                Poll::Pending
            }
        }
    }
}

/// Run a task on the blocking thread pool, returning its future.
pub fn spawn<K: Task>(task: K) -> TaskFuture<K::Output> {
    let future = TaskFuture::new();
    let handle = future.clone();
    tokio::task::spawn_blocking(move || handle.run(task));
    future
}

fn invoke_then<T>(callback: ThenCallback<T>, outcome: &Arc<TaskOutcome<T>>) {
    let shared = Arc::clone(outcome);
    if catch_unwind(AssertUnwindSafe(move || callback(&shared))).is_err() {
        tracing::error!("panic in completion callback");
    }
}
