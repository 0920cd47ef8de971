//! The refining loop: iterate until a termination condition holds.

use std::time::Instant;

use anyhow::Result;
use tracing::info;

use crate::core::state::{BlindPolicy, IterationState, RunLimits, StopReason, Verdict};
use crate::io::temp::TempScope;
use crate::iteration::{Engine, RefineSettings, run_iteration};

/// Progress report for one finished iteration.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct IterationReport {
    pub iteration: u32,
    pub verdict: Verdict,
    /// Whether current state was reset to best-known before this iteration ran.
    pub reverted: bool,
}

/// Run refining iterations on `state` until it asks to stop. Each iteration
/// works inside its own child scope of `run_scope`, removed when the iteration
/// ends unless iteration temporaries are kept.
///
/// Cancellation and fatal iteration errors propagate; `state` then still holds
/// the last accepted results.
pub fn refine<F: FnMut(&IterationReport)>(
    engine: &Engine<'_>,
    settings: &RefineSettings,
    policy: &BlindPolicy,
    limits: &RunLimits,
    state: &mut IterationState,
    run_scope: &TempScope,
    mut on_iteration: F,
) -> Result<StopReason> {
    loop {
        if let Some(reason) = state.stop_reason(policy, limits, Instant::now()) {
            info!(iterations = state.iterations(), %reason, "refinement stopped");
            return Ok(reason);
        }
        engine.cancellation.check()?;

        let reverted = state.begin_iteration();
        let iteration = state.iterations();
        if reverted {
            info!(iteration, "reverted to best-known alignment and tree");
        }

        let scope = run_scope.child(&format!("step{iteration}_"), settings.keep_iteration_temps)?;
        let candidate = run_iteration(engine, settings, state.current(), &scope, iteration)?;
        drop(scope);

        let verdict = match candidate {
            Some(candidate) => {
                let score = candidate.score;
                let verdict = state.record_candidate(candidate, policy, Instant::now());
                match verdict {
                    Verdict::Improved => {
                        info!(iteration, %score, "iteration improved the best score");
                    }
                    Verdict::Blind => {
                        info!(iteration, %score, "iteration did not improve, continuing blind");
                    }
                    _ => info!(iteration, %score, "iteration did not improve, discarding it"),
                }
                verdict
            }
            None => {
                info!(iteration, "iteration produced no candidate");
                state.record_failure(policy, Instant::now())
            }
        };
        if state.revert_pending() {
            info!(
                iteration,
                "no improvement within the blind limits, reverting before next iteration"
            );
        }
        on_iteration(&IterationReport {
            iteration,
            verdict,
            reverted,
        });
    }
}
