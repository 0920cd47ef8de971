//! Fixed-size pool of worker threads pulling jobs from one FIFO queue.

use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};

use anyhow::{Context, Result, anyhow};
use tracing::{debug, info, warn};

use crate::sched::cancel::CancelToken;
use crate::sched::job::{Job, JobHandle};

/// Detected core count, never less than 1.
pub fn default_num_cpus() -> usize {
    thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

pub struct WorkerPool {
    sender: Option<Sender<JobHandle>>,
    workers: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Spawn `num_workers` workers (at least one). Jobs dequeued after `cancel`
    /// fires are killed instead of run.
    pub fn new(num_workers: usize, cancel: CancelToken) -> Result<Self> {
        let num_workers = num_workers.max(1);
        let (sender, receiver) = mpsc::channel::<JobHandle>();
        let receiver = Arc::new(Mutex::new(receiver));
        let mut workers = Vec::with_capacity(num_workers);
        for idx in 0..num_workers {
            let receiver = receiver.clone();
            let cancel = cancel.clone();
            let handle = thread::Builder::new()
                .name(format!("sate-worker-{idx}"))
                .spawn(move || worker_loop(idx, &receiver, &cancel))
                .with_context(|| format!("spawn worker thread {idx}"))?;
            workers.push(handle);
        }
        info!(workers = num_workers, "worker pool started");
        Ok(Self {
            sender: Some(sender),
            workers,
        })
    }

    pub fn size(&self) -> usize {
        self.workers.len()
    }

    /// Enqueue a pending job. Never blocks.
    pub fn submit<T: Clone + Send + 'static>(&self, job: &Job<T>) -> Result<()> {
        let sender = self
            .sender
            .as_ref()
            .ok_or_else(|| anyhow!("worker pool is shut down"))?;
        debug!(job = %job.label(), id = job.id(), "job queued");
        sender
            .send(job.handle())
            .map_err(|_| anyhow!("worker pool is shut down"))
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        // Closing the channel ends every worker loop once the queue drains.
        self.sender.take();
        for handle in self.workers.drain(..) {
            if handle.join().is_err() {
                warn!("worker thread panicked");
            }
        }
    }
}

fn worker_loop(idx: usize, receiver: &Mutex<Receiver<JobHandle>>, cancel: &CancelToken) {
    loop {
        let next = receiver
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .recv();
        let Ok(job) = next else {
            debug!(worker = idx, "queue closed, worker exiting");
            return;
        };
        if cancel.is_cancelled() {
            debug!(worker = idx, job = %job.label(), "run cancelled, dropping queued job");
            job.kill();
            continue;
        }
        debug!(worker = idx, job = %job.label(), "worker picked up job");
        job.run();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use anyhow::anyhow;

    use super::*;
    use crate::sched::job::JobStatus;

    #[test]
    fn pool_runs_every_job_and_keeps_identity() {
        let pool = WorkerPool::new(3, CancelToken::default()).expect("pool");
        let jobs: Vec<Job<usize>> = (0..10)
            .map(|i| {
                Job::new(format!("job{i}"), move |_| {
                    thread::sleep(Duration::from_millis((10 - i as u64) * 2));
                    Ok(i * i)
                })
            })
            .collect();
        for job in &jobs {
            pool.submit(job).expect("submit");
        }
        let results: Vec<usize> = jobs
            .iter()
            .map(|j| j.get_results().expect("result"))
            .collect();
        assert_eq!(results, (0..10).map(|i| i * i).collect::<Vec<_>>());
    }

    #[test]
    fn failing_job_does_not_stop_the_pool() {
        let pool = WorkerPool::new(1, CancelToken::default()).expect("pool");
        let bad: Job<u32> = Job::new("bad", |_| Err(anyhow!("tool crashed")));
        let good: Job<u32> = Job::new("good", |_| Ok(5));
        pool.submit(&bad).expect("submit bad");
        pool.submit(&good).expect("submit good");
        assert!(bad.get_results().is_err());
        assert_eq!(good.get_results().expect("good"), 5);
    }

    #[test]
    fn zero_workers_still_gives_one() {
        let pool = WorkerPool::new(0, CancelToken::default()).expect("pool");
        assert_eq!(pool.size(), 1);
    }

    #[test]
    fn killed_pending_job_is_skipped_by_workers() {
        let pool = WorkerPool::new(1, CancelToken::default()).expect("pool");
        let runs = Arc::new(AtomicUsize::new(0));
        let gate = Arc::new(Mutex::new(()));
        let held = gate.lock().expect("lock gate");

        let blocker = {
            let gate = gate.clone();
            Job::new("blocker", move |_| {
                drop(gate.lock().unwrap_or_else(PoisonError::into_inner));
                Ok(())
            })
        };
        let counted = runs.clone();
        let victim = Job::new("victim", move |_| {
            counted.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        pool.submit(&blocker).expect("submit blocker");
        pool.submit(&victim).expect("submit victim");
        victim.kill();
        drop(held);

        blocker.get_results().expect("blocker");
        assert!(victim.get_results().is_err());
        drop(pool);
        assert_eq!(runs.load(Ordering::SeqCst), 0);
        assert_eq!(victim.status(), JobStatus::Killed);
    }

    #[test]
    fn cancelled_pool_kills_queued_jobs() {
        let cancel = CancelToken::default();
        cancel.cancel();
        let pool = WorkerPool::new(2, cancel).expect("pool");
        let job = Job::new("late", |_| Ok(1u8));
        pool.submit(&job).expect("submit");
        assert!(job.get_results().is_err());
        assert_eq!(job.status(), JobStatus::Killed);
    }
}
