//! Job execution: jobs, the worker pool, and cancellation.
//!
//! The control thread builds [`job::Job`]s, hands them to the
//! [`pool::WorkerPool`] through [`dispatch::run_batch`], and blocks on their
//! results. The only state it shares with the asynchronous cancel path is the
//! in-flight registry held by [`cancel::Cancellation`].

pub mod cancel;
pub mod dispatch;
pub mod job;
pub mod pool;
