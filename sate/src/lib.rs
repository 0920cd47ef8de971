//! SATe: iterative co-estimation of multiple sequence alignments and trees.
//!
//! A run aligns the input, estimates a tree, then repeatedly decomposes the
//! tree into subproblems, realigns and merges them, and re-estimates the tree,
//! keeping the best-scoring (alignment, tree) pair. The crate is split as:
//!
//! - **[`core`]**: Pure, deterministic logic (data model, tree decomposition,
//!   scores, acceptance and termination rules). No I/O.
//! - **[`sched`]**: Jobs, the worker pool and cancellation.
//! - **[`io`]**: Side effects (settings, sequence files, external tools,
//!   temporary directories, signals).
//!
//! Orchestration modules ([`iteration`], [`looping`], [`pipeline`]) combine
//! them into a run.

pub mod core;
pub mod exit_codes;
pub mod io;
pub mod iteration;
pub mod logging;
pub mod looping;
pub mod pipeline;
pub mod sched;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
