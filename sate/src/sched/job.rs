//! A unit of work wrapping one external tool invocation.
//!
//! Lifecycle: `Pending -> Running -> {Completed | Failed | Killed}`. Workers
//! drive the transitions; the owning controller only reads state and results.

use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};

use anyhow::Result;
use tracing::{debug, warn};

use crate::sched::cancel::KillSwitch;

static NEXT_JOB_ID: AtomicU64 = AtomicU64::new(1);

pub type JobId = u64;

type Work<T> = Box<dyn FnOnce(&KillSwitch) -> Result<T> + Send>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Killed,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed | JobStatus::Killed)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobStatus::Pending => write!(f, "pending"),
            JobStatus::Running => write!(f, "running"),
            JobStatus::Completed => write!(f, "completed"),
            JobStatus::Failed => write!(f, "failed"),
            JobStatus::Killed => write!(f, "killed"),
        }
    }
}

/// Returned by [`Job::get_results`] for a killed job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobKilledError {
    pub label: String,
}

impl fmt::Display for JobKilledError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "job '{}' was killed", self.label)
    }
}

impl std::error::Error for JobKilledError {}

/// Returned by [`Job::get_results`] when the tool failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobFailedError {
    pub label: String,
    pub reason: String,
}

impl fmt::Display for JobFailedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "job '{}' failed: {}", self.label, self.reason)
    }
}

impl std::error::Error for JobFailedError {}

enum Slot<T> {
    Pending(Option<Work<T>>),
    Running,
    Completed(T),
    Failed(String),
    Killed,
}

impl<T> Slot<T> {
    fn status(&self) -> JobStatus {
        match self {
            Slot::Pending(_) => JobStatus::Pending,
            Slot::Running => JobStatus::Running,
            Slot::Completed(_) => JobStatus::Completed,
            Slot::Failed(_) => JobStatus::Failed,
            Slot::Killed => JobStatus::Killed,
        }
    }
}

struct Shared<T> {
    id: JobId,
    label: String,
    slot: Mutex<Slot<T>>,
    done: Condvar,
    kill: KillSwitch,
}

impl<T> Shared<T> {
    fn lock(&self) -> MutexGuard<'_, Slot<T>> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Type-erased view of a job used by the worker pool and the cancel path.
pub(crate) trait Runnable: Send + Sync {
    fn id(&self) -> JobId;
    fn label(&self) -> &str;
    fn status(&self) -> JobStatus;
    fn run(&self);
    fn kill(&self);
}

impl<T: Send + 'static> Runnable for Shared<T> {
    fn id(&self) -> JobId {
        self.id
    }

    fn label(&self) -> &str {
        &self.label
    }

    fn status(&self) -> JobStatus {
        self.lock().status()
    }

    fn run(&self) {
        let work = {
            let mut slot = self.lock();
            let taken = match &mut *slot {
                Slot::Pending(work) => work.take(),
                _ => None,
            };
            match taken {
                Some(work) => {
                    *slot = Slot::Running;
                    work
                }
                // Killed while queued, or already handed to another worker.
                None => return,
            }
        };

        debug!(job = %self.label, id = self.id, "job running");
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| work(&self.kill)));

        let mut slot = self.lock();
        *slot = if self.kill.is_tripped() {
            Slot::Killed
        } else {
            match outcome {
                Ok(Ok(value)) => Slot::Completed(value),
                Ok(Err(err)) => {
                    warn!(job = %self.label, err = %format!("{err:#}"), "job failed");
                    Slot::Failed(format!("{err:#}"))
                }
                Err(_) => {
                    warn!(job = %self.label, "job panicked");
                    Slot::Failed("job panicked".to_string())
                }
            }
        };
        debug!(job = %self.label, id = self.id, status = %slot.status(), "job finished");
        drop(slot);
        self.done.notify_all();
    }

    fn kill(&self) {
        let mut slot = self.lock();
        match slot.status() {
            JobStatus::Pending => {
                *slot = Slot::Killed;
                drop(slot);
                self.done.notify_all();
            }
            JobStatus::Running => {
                drop(slot);
                // The worker moves the job to Killed once the tool has stopped.
                self.kill.trip();
            }
            _ => {}
        }
    }
}

/// Handle to a job producing a `T`. Cloning shares the same job.
pub struct Job<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for Job<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T: Clone + Send + 'static> Job<T> {
    pub fn new<F>(label: impl Into<String>, work: F) -> Self
    where
        F: FnOnce(&KillSwitch) -> Result<T> + Send + 'static,
    {
        Self {
            shared: Arc::new(Shared {
                id: NEXT_JOB_ID.fetch_add(1, Ordering::Relaxed),
                label: label.into(),
                slot: Mutex::new(Slot::Pending(Some(Box::new(work)))),
                done: Condvar::new(),
                kill: KillSwitch::new(),
            }),
        }
    }

    pub fn id(&self) -> JobId {
        self.shared.id
    }

    pub fn label(&self) -> &str {
        &self.shared.label
    }

    pub fn status(&self) -> JobStatus {
        self.shared.lock().status()
    }

    /// Block until the job is terminal, then return its result. Repeated calls
    /// return the same outcome.
    pub fn get_results(&self) -> Result<T> {
        let mut slot = self.shared.lock();
        while !slot.status().is_terminal() {
            slot = self
                .shared
                .done
                .wait(slot)
                .unwrap_or_else(PoisonError::into_inner);
        }
        match &*slot {
            Slot::Completed(value) => Ok(value.clone()),
            Slot::Failed(reason) => Err(JobFailedError {
                label: self.shared.label.clone(),
                reason: reason.clone(),
            }
            .into()),
            _ => Err(JobKilledError {
                label: self.shared.label.clone(),
            }
            .into()),
        }
    }

    /// Idempotent. A pending job is never run; a running job has its tool
    /// terminated and becomes `Killed` once the tool stops.
    pub fn kill(&self) {
        Runnable::kill(&*self.shared);
    }

    pub fn handle(&self) -> JobHandle {
        JobHandle {
            inner: self.shared.clone(),
        }
    }

    /// Execute the job on the calling thread.
    pub fn run(&self) {
        Runnable::run(&*self.shared);
    }
}

/// Type-erased, cloneable job reference.
#[derive(Clone)]
pub struct JobHandle {
    inner: Arc<dyn Runnable>,
}

impl JobHandle {
    pub fn id(&self) -> JobId {
        self.inner.id()
    }

    pub fn label(&self) -> &str {
        self.inner.label()
    }

    pub fn status(&self) -> JobStatus {
        self.inner.status()
    }

    pub fn kill(&self) {
        self.inner.kill();
    }

    pub(crate) fn run(&self) {
        self.inner.run();
    }
}

impl fmt::Debug for JobHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobHandle")
            .field("id", &self.id())
            .field("label", &self.label())
            .finish()
    }
}
