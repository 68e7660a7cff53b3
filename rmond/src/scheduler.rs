//! Timer-ordered job scheduler with a single worker thread.
//!
//! Jobs are one-shot closures queued under a monotonic deadline. One named
//! worker thread sleeps on a condition variable until the earliest deadline
//! passes (or a sooner job arrives), pops the job and runs it with the queue
//! lock released, so a job may push further jobs, including itself.
//!
//! Jobs with equal deadlines fire in push order. There is no cancel
//! primitive: a job that must not outlive its target captures a weak
//! reference and does nothing once the target is gone.
//!
//! # Example
//!
//! ```rust
//! use std::sync::mpsc;
//! use std::time::Duration;
//!
//! use rmond::scheduler::Scheduler;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let scheduler = Scheduler::new();
//! scheduler.start()?;
//!
//! let (tx, rx) = mpsc::channel();
//! scheduler.push(Duration::from_millis(5), move |_| {
//!     let _ = tx.send("fired");
//! })?;
//! assert_eq!(rx.recv_timeout(Duration::from_secs(5))?, "fired");
//!
//! scheduler.stop();
//! # Ok(())
//! # }
//! ```

use std::collections::BTreeMap;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle, ThreadId};
use std::time::{Duration, Instant};

use tracing::{debug, error, info};

use crate::error::SchedulerError;

/// A queued closure. It receives the scheduler so that it can reschedule.
pub type Job = Box<dyn FnOnce(&Scheduler) + Send + 'static>;

const WORKER_NAME: &str = "rmond-scheduler";

/// Cloneable handle to a job scheduler.
///
/// All clones share one queue and one worker.
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<Inner>,
}

struct Inner {
    state: Mutex<State>,
    wake: Condvar,
}

#[derive(Default)]
struct State {
    queue: BTreeMap<(Instant, u64), Job>,
    sequence: u64,
    running: bool,
    generation: u64,
    worker: Option<JoinHandle<()>>,
    worker_id: Option<ThreadId>,
}

impl Scheduler {
    /// Creates a stopped scheduler with an empty queue.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State::default()),
                wake: Condvar::new(),
            }),
        }
    }

    /// Spawns the worker thread.
    ///
    /// A stopped scheduler can be started again.
    ///
    /// # Errors
    ///
    /// Returns [`SchedulerError::AlreadyRunning`] if the worker is running,
    /// or [`SchedulerError::Spawn`] if the thread cannot be created.
    pub fn start(&self) -> Result<(), SchedulerError> {
        let mut state = self.lock();
        if state.running {
            return Err(SchedulerError::AlreadyRunning);
        }
        state.generation += 1;
        let generation = state.generation;
        let inner = Arc::clone(&self.inner);
        let handle = thread::Builder::new()
            .name(WORKER_NAME.into())
            .spawn(move || run(&inner, generation))
            .map_err(|source| SchedulerError::Spawn { source })?;

        state.running = true;
        state.worker_id = Some(handle.thread().id());
        state.worker = Some(handle);
        info!(generation, "scheduler started");
        Ok(())
    }

    /// Stops the worker and abandons every queued job.
    ///
    /// A job already running is allowed to finish. Called from another
    /// thread this joins the worker; called from inside a job it detaches
    /// the worker, which exits once the job returns. Stopping a stopped
    /// scheduler does nothing.
    pub fn stop(&self) {
        let (queue, handle, on_worker) = {
            let mut state = self.lock();
            if !state.running {
                return;
            }
            state.running = false;
            let on_worker = state.worker_id == Some(thread::current().id());
            state.worker_id = None;
            self.inner.wake.notify_all();
            (std::mem::take(&mut state.queue), state.worker.take(), on_worker)
        };

        debug!(abandoned = queue.len(), "scheduler stopping");
        drop(queue);

        if let Some(handle) = handle {
            if !on_worker && handle.join().is_err() {
                error!("scheduler worker terminated abnormally");
            }
        }
        info!("scheduler stopped");
    }

    /// Queues `job` to run once `delay` has elapsed.
    ///
    /// # Errors
    ///
    /// Returns [`SchedulerError::NotRunning`] if the scheduler is stopped.
    pub fn push<F>(&self, delay: Duration, job: F) -> Result<(), SchedulerError>
    where
        F: FnOnce(&Scheduler) + Send + 'static,
    {
        let mut state = self.lock();
        if !state.running {
            return Err(SchedulerError::NotRunning);
        }
        let deadline = Instant::now() + delay;
        state.sequence += 1;
        let slot = (deadline, state.sequence);
        let sooner = state
            .queue
            .first_key_value()
            .is_none_or(|(first, _)| slot < *first);
        state.queue.insert(slot, Box::new(job));
        if sooner {
            self.inner.wake.notify_one();
        }
        Ok(())
    }

    /// Returns `true` while the worker is running.
    pub fn is_running(&self) -> bool {
        self.lock().running
    }

    /// Returns the number of queued jobs.
    pub fn pending(&self) -> usize {
        self.lock().queue.len()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.inner.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.lock();
        f.debug_struct("Scheduler")
            .field("running", &state.running)
            .field("pending", &state.queue.len())
            .finish()
    }
}

fn run(inner: &Arc<Inner>, generation: u64) {
    let scheduler = Scheduler {
        inner: Arc::clone(inner),
    };
    let mut state = scheduler.lock();
    loop {
        if !state.running || state.generation != generation {
            break;
        }
        let now = Instant::now();
        match state.queue.first_key_value().map(|(slot, _)| slot.0) {
            None => {
                state = inner.wake.wait(state).unwrap_or_else(PoisonError::into_inner);
            }
            Some(deadline) if deadline > now => {
                state = inner
                    .wake
                    .wait_timeout(state, deadline - now)
                    .map_or_else(|e| e.into_inner().0, |(guard, _)| guard);
            }
            Some(_) => {
                let Some((_, job)) = state.queue.pop_first() else {
                    continue;
                };
                drop(state);
                if panic::catch_unwind(AssertUnwindSafe(|| job(&scheduler))).is_err() {
                    error!("scheduled job panicked");
                }
                state = scheduler.lock();
            }
        }
    }
    debug!(generation, "scheduler worker exiting");
}
