//! Controller-side submission with join semantics and in-flight tracking.

use anyhow::Result;

use crate::sched::cancel::Cancellation;
use crate::sched::job::Job;
use crate::sched::pool::WorkerPool;

/// Submit `jobs`, wait for every one of them, and return their results in
/// submission order (not completion order).
///
/// The jobs are registered as in flight for the cancel path before the first
/// submission and unregistered on every exit path. Cancellation wins over
/// results: if the run was cancelled while waiting, `CancelledError` is
/// returned even when every job completed.
pub fn run_batch<T: Clone + Send + 'static>(
    pool: &WorkerPool,
    cancellation: &Cancellation,
    jobs: &[Job<T>],
) -> Result<Vec<Result<T>>> {
    cancellation.check()?;
    let results = {
        let _in_flight = cancellation.track(jobs.iter().map(Job::handle).collect());
        for job in jobs {
            if let Err(err) = pool.submit(job) {
                for job in jobs {
                    job.kill();
                }
                return Err(err);
            }
        }
        jobs.iter().map(Job::get_results).collect::<Vec<_>>()
    };
    cancellation.check()?;
    Ok(results)
}

/// [`run_batch`] for a single job.
pub fn run_one<T: Clone + Send + 'static>(
    pool: &WorkerPool,
    cancellation: &Cancellation,
    job: &Job<T>,
) -> Result<Result<T>> {
    let mut results = run_batch(pool, cancellation, std::slice::from_ref(job))?;
    Ok(results.remove(0))
}
