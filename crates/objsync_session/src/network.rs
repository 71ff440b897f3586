//! Background execution of authentication requests and connectivity tracking.

use crate::config::RetryConfig;
use crate::error::SessionResult;
use objsync_auth::AuthenticateResponse;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::runtime::{Handle, Runtime};
use tracing::debug;

/// A unit of work submitted to a [`NetworkExecutor`].
pub type Job = Box<dyn FnOnce() + Send + 'static>;

/// Runs network requests off the caller's thread.
///
/// Submission returns immediately. Implementations must never run the job
/// on the submitting thread: sessions submit while holding their lock.
pub trait NetworkExecutor: Send + Sync {
    /// Submits a job for background execution.
    fn submit(&self, job: Job);
}

/// Executor backed by the blocking pool of a Tokio runtime.
pub struct TokioNetworkExecutor {
    handle: Handle,
    runtime: Option<Runtime>,
}

impl TokioNetworkExecutor {
    /// Creates an executor with its own runtime running at most
    /// `max_threads` requests at a time.
    pub fn new(max_threads: usize) -> SessionResult<Self> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .max_blocking_threads(max_threads.max(1))
            .thread_name("objsync-network")
            .enable_all()
            .build()?;
        Ok(Self {
            handle: runtime.handle().clone(),
            runtime: Some(runtime),
        })
    }

    /// Creates an executor on an existing runtime.
    pub fn from_handle(handle: Handle) -> Self {
        Self {
            handle,
            runtime: None,
        }
    }
}

impl NetworkExecutor for TokioNetworkExecutor {
    fn submit(&self, job: Job) {
        drop(self.handle.spawn_blocking(job));
    }
}

impl Drop for TokioNetworkExecutor {
    fn drop(&mut self) {
        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown_background();
        }
    }
}

impl fmt::Debug for TokioNetworkExecutor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokioNetworkExecutor")
            .field("owns_runtime", &self.runtime.is_some())
            .finish()
    }
}

/// Executor that queues jobs until [`ManualExecutor::run_pending`] is called.
///
/// Useful for driving sessions deterministically in tests.
#[derive(Default)]
pub struct ManualExecutor {
    jobs: Mutex<VecDeque<Job>>,
}

impl ManualExecutor {
    /// Creates an empty executor.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of queued jobs.
    pub fn pending(&self) -> usize {
        self.jobs.lock().len()
    }

    /// Runs queued jobs, including any they submit, until the queue is empty.
    ///
    /// Returns the number of jobs run.
    pub fn run_pending(&self) -> usize {
        let mut ran = 0;
        loop {
            let job = self.jobs.lock().pop_front();
            match job {
                Some(job) => {
                    job();
                    ran += 1;
                }
                None => return ran,
            }
        }
    }
}

impl NetworkExecutor for ManualExecutor {
    fn submit(&self, job: Job) {
        self.jobs.lock().push_back(job);
    }
}

impl fmt::Debug for ManualExecutor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ManualExecutor")
            .field("pending", &self.pending())
            .finish()
    }
}

/// Cancellable handle to an in-flight authentication request.
#[derive(Debug, Clone, Default)]
pub struct AuthTask {
    cancelled: Arc<AtomicBool>,
}

impl AuthTask {
    /// Creates a new, live task handle.
    pub fn new() -> Self {
        Self::default()
    }

    /// Cancels the request. Its callbacks will not run.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    /// Returns true if the request was cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

const CANCEL_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Repeats an authentication request with exponential backoff.
///
/// Recoverable failures are retried until the retry budget is spent; fatal
/// failures and successes end the task immediately.
#[derive(Debug)]
pub struct BackoffTask {
    retry: RetryConfig,
    task: AuthTask,
}

impl BackoffTask {
    /// Creates a task governed by `retry` and cancelled through `task`.
    pub fn new(retry: RetryConfig, task: AuthTask) -> Self {
        Self { retry, task }
    }

    /// Runs `execute` until it succeeds, fails fatally or runs out of attempts.
    ///
    /// Returns `None` if the task was cancelled.
    pub fn run<F>(&self, mut execute: F) -> Option<AuthenticateResponse>
    where
        F: FnMut() -> AuthenticateResponse,
    {
        let max_attempts = self.retry.max_attempts.max(1);
        let mut attempt = 0;
        loop {
            self.sleep_unless_cancelled(self.retry.delay_for_attempt(attempt));
            if self.task.is_cancelled() {
                return None;
            }

            let response = execute();
            match &response {
                AuthenticateResponse::Failure(error)
                    if !error.is_fatal() && attempt + 1 < max_attempts =>
                {
                    debug!(attempt, %error, "authentication attempt failed, retrying");
                    attempt += 1;
                }
                _ => return Some(response),
            }
        }
    }

    fn sleep_unless_cancelled(&self, delay: Duration) {
        let deadline = Instant::now() + delay;
        loop {
            let now = Instant::now();
            if now >= deadline || self.task.is_cancelled() {
                return;
            }
            std::thread::sleep((deadline - now).min(CANCEL_POLL_INTERVAL));
        }
    }
}

/// Callback invoked with the new connectivity state.
pub type ConnectionListener = Arc<dyn Fn(bool) + Send + Sync>;

/// Identifies a registered [`ConnectionListener`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

/// Source of network availability.
pub trait NetworkMonitor: Send + Sync {
    /// Returns true if the device can currently reach the network.
    fn is_online(&self) -> bool;

    /// Registers a listener for connectivity changes.
    fn add_listener(&self, listener: ConnectionListener) -> ListenerId;

    /// Removes a listener. Returns false if it was not registered.
    fn remove_listener(&self, id: ListenerId) -> bool;
}

/// Connectivity state fed by the platform layer.
pub struct ConnectivityMonitor {
    online: AtomicBool,
    next_id: AtomicU64,
    listeners: Mutex<Vec<(ListenerId, ConnectionListener)>>,
}

impl ConnectivityMonitor {
    /// Creates a monitor with the given initial state.
    pub fn new(online: bool) -> Self {
        Self {
            online: AtomicBool::new(online),
            next_id: AtomicU64::new(1),
            listeners: Mutex::new(Vec::new()),
        }
    }

    /// Updates the connectivity state and notifies listeners on change.
    ///
    /// Listeners run on the calling thread without the monitor's lock held,
    /// so they may deregister themselves.
    pub fn set_online(&self, online: bool) {
        if self.online.swap(online, Ordering::SeqCst) == online {
            return;
        }
        let listeners: Vec<ConnectionListener> = self
            .listeners
            .lock()
            .iter()
            .map(|(_, listener)| Arc::clone(listener))
            .collect();
        for listener in listeners {
            listener(online);
        }
    }

    /// Returns the number of registered listeners.
    pub fn listener_count(&self) -> usize {
        self.listeners.lock().len()
    }
}

impl Default for ConnectivityMonitor {
    fn default() -> Self {
        Self::new(true)
    }
}

impl NetworkMonitor for ConnectivityMonitor {
    fn is_online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }

    fn add_listener(&self, listener: ConnectionListener) -> ListenerId {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::SeqCst));
        self.listeners.lock().push((id, listener));
        id
    }

    fn remove_listener(&self, id: ListenerId) -> bool {
        let mut listeners = self.listeners.lock();
        let before = listeners.len();
        listeners.retain(|(registered, _)| *registered != id);
        listeners.len() != before
    }
}

impl fmt::Debug for ConnectivityMonitor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectivityMonitor")
            .field("online", &self.is_online())
            .field("listeners", &self.listener_count())
            .finish()
    }
}
