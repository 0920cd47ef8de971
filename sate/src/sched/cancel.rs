//! Cancellation primitives shared between the control thread, the workers and
//! the signal watcher.
//!
//! - [`KillSwitch`]: per-job flag plus the process group of the tool the job is
//!   currently running, so a kill can reach the subprocess immediately.
//! - [`CancelToken`]: run-wide flag; once set no further work is started.
//! - [`Cancellation`]: the token plus the registry of jobs currently in flight.
//!   The registry is the only state the asynchronous cancel path touches.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use anyhow::Result;
use tracing::{debug, warn};

use crate::io::process::terminate_process_group;
use crate::sched::job::JobHandle;

/// Raised when the run was cancelled from outside the normal control flow.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CancelledError {
    pub reason: String,
}

impl fmt::Display for CancelledError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "run cancelled: {}", self.reason)
    }
}

impl std::error::Error for CancelledError {}

#[derive(Debug, Default)]
struct KillState {
    tripped: AtomicBool,
    pid: Mutex<Option<u32>>,
}

/// Cooperative kill request for one job.
#[derive(Debug, Clone, Default)]
pub struct KillSwitch {
    inner: Arc<KillState>,
}

impl KillSwitch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request termination. Kills the attached process group, if any.
    pub fn trip(&self) {
        self.inner.tripped.store(true, Ordering::SeqCst);
        let pid = *self.inner.pid.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(pid) = pid {
            debug!(pid, "killing process group of running tool");
            terminate_process_group(pid);
        }
    }

    pub fn is_tripped(&self) -> bool {
        self.inner.tripped.load(Ordering::SeqCst)
    }

    /// Record the subprocess now running on behalf of the job. Returns false if
    /// the switch was already tripped, in which case the caller must stop it.
    pub fn attach(&self, pid: u32) -> bool {
        *self.inner.pid.lock().unwrap_or_else(PoisonError::into_inner) = Some(pid);
        !self.is_tripped()
    }

    pub fn detach(&self) {
        *self.inner.pid.lock().unwrap_or_else(PoisonError::into_inner) = None;
    }
}

/// Run-wide cancellation flag.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

/// Cancellation controller: token plus the jobs currently considered in flight.
#[derive(Debug, Default)]
pub struct Cancellation {
    token: CancelToken,
    reason: Mutex<Option<String>>,
    in_flight: Mutex<Vec<JobHandle>>,
}

impl Cancellation {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn token(&self) -> CancelToken {
        self.token.clone()
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Register `jobs` as in flight until the returned guard drops. Must be
    /// called before the jobs are submitted.
    pub fn track(&self, jobs: Vec<JobHandle>) -> InFlightGuard<'_> {
        *self.in_flight.lock().unwrap_or_else(PoisonError::into_inner) = jobs.clone();
        // A cancel that raced ahead of registration must still reach these jobs.
        if self.is_cancelled() {
            for job in &jobs {
                job.kill();
            }
        }
        InFlightGuard { owner: self }
    }

    /// Mark the run cancelled and kill every in-flight job. Returns how many
    /// jobs were signalled.
    pub fn cancel(&self, reason: &str) -> usize {
        {
            let mut slot = self.reason.lock().unwrap_or_else(PoisonError::into_inner);
            slot.get_or_insert_with(|| reason.to_string());
        }
        self.token.cancel();
        let jobs = std::mem::take(
            &mut *self
                .in_flight
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
        );
        if jobs.is_empty() {
            warn!(reason, "cancellation requested with no jobs running");
            return 0;
        }
        warn!(reason, jobs = jobs.len(), "cancellation requested, killing running jobs");
        for job in &jobs {
            job.kill();
            warn!(job = %job.label(), "kill requested");
        }
        jobs.len()
    }

    /// `Err(CancelledError)` once the run has been cancelled.
    pub fn check(&self) -> Result<()> {
        if !self.is_cancelled() {
            return Ok(());
        }
        let reason = self
            .reason
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .unwrap_or_else(|| "cancelled".to_string());
        Err(CancelledError { reason }.into())
    }

    pub fn in_flight_count(&self) -> usize {
        self.in_flight.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    fn clear(&self) {
        self.in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}

/// Clears the in-flight registry on every exit path.
#[must_use = "the in-flight registration is cleared when the guard drops"]
pub struct InFlightGuard<'a> {
    owner: &'a Cancellation,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.owner.clear();
    }
}
