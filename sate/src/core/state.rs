//! Acceptance, blind-mode and termination rules of the refinement loop.
//!
//! `IterationState` is owned by the control thread only. It never performs I/O;
//! the loop feeds it candidates and asks it whether to continue.

use std::fmt;
use std::time::{Duration, Instant};

use serde::Serialize;

use crate::core::budget::limit_reached;
use crate::core::dataset::MultiLocusDataset;
use crate::core::phylo::Tree;
use crate::core::score::Score;

/// An (alignment, tree, score) triple. The score is absent only for a
/// user-supplied starting tree that was never evaluated.
#[derive(Debug, Clone, PartialEq)]
pub struct Snapshot {
    pub dataset: MultiLocusDataset,
    pub tree: Tree,
    pub score: Option<Score>,
}

/// Result of one completed refinement iteration.
#[derive(Debug, Clone, PartialEq)]
pub struct Candidate {
    pub dataset: MultiLocusDataset,
    pub tree: Tree,
    pub score: Score,
}

impl From<Candidate> for Snapshot {
    fn from(c: Candidate) -> Self {
        Snapshot {
            dataset: c.dataset,
            tree: c.tree,
            score: Some(c.score),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlindPolicy {
    /// Keep searching from a non-improving candidate instead of discarding it.
    pub move_to_blind_on_worse_score: bool,
    /// Consecutive non-improving iterations tolerated before reverting.
    pub iter_limit: u32,
    /// Time without improvement tolerated in blind mode before reverting.
    pub time_limit: Option<Duration>,
    /// Reverts that may be followed by further searching instead of stopping.
    pub restarts: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RunLimits {
    pub time_limit: Option<Duration>,
    pub iter_limit: Option<u32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// New best-known state.
    Improved,
    /// Not better, but searching continues from it.
    Blind,
    /// Not better and discarded.
    Rejected,
    /// The iteration produced no candidate.
    Failed,
}

/// Why a run ended (cancellation is reported as an error instead).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    TwoPhase,
    NoImprovement,
    TimeLimit,
    IterationLimit,
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            StopReason::TwoPhase => "two-phase mode (refinement skipped)",
            StopReason::NoImprovement => "no further improvement",
            StopReason::TimeLimit => "time limit reached",
            StopReason::IterationLimit => "iteration limit reached",
        };
        f.write_str(text)
    }
}

#[derive(Debug, Clone)]
pub struct IterationState {
    current: Snapshot,
    best: Snapshot,
    started: Instant,
    last_improvement: Instant,
    iterations: u32,
    without_improvement: u32,
    blind_mode: bool,
    revert_pending: bool,
    restarts_used: u32,
}

impl IterationState {
    pub fn new(initial: Snapshot, now: Instant) -> Self {
        Self {
            current: initial.clone(),
            best: initial,
            started: now,
            last_improvement: now,
            iterations: 0,
            without_improvement: 0,
            blind_mode: false,
            revert_pending: false,
            restarts_used: 0,
        }
    }

    pub fn current(&self) -> &Snapshot {
        &self.current
    }

    pub fn best(&self) -> &Snapshot {
        &self.best
    }

    pub fn best_score(&self) -> Option<Score> {
        self.best.score
    }

    pub fn iterations(&self) -> u32 {
        self.iterations
    }

    pub fn without_improvement(&self) -> u32 {
        self.without_improvement
    }

    pub fn is_blind(&self) -> bool {
        self.blind_mode
    }

    pub fn revert_pending(&self) -> bool {
        self.revert_pending
    }

    pub fn elapsed(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.started)
    }

    /// First termination condition that holds, if any.
    pub fn stop_reason(
        &self,
        policy: &BlindPolicy,
        limits: &RunLimits,
        now: Instant,
    ) -> Option<StopReason> {
        if limit_reached(self.started, limits.time_limit, now) {
            return Some(StopReason::TimeLimit);
        }
        if limits.iter_limit.is_some_and(|max| self.iterations >= max) {
            return Some(StopReason::IterationLimit);
        }
        if self.revert_pending && self.restarts_used >= policy.restarts {
            return Some(StopReason::NoImprovement);
        }
        None
    }

    /// Start a new iteration. A pending revert is applied first; returns
    /// whether current state was reset to best-known.
    pub fn begin_iteration(&mut self) -> bool {
        let reverted = self.revert_pending;
        if reverted {
            self.apply_revert();
            self.restarts_used += 1;
        }
        self.iterations += 1;
        reverted
    }

    pub fn record_candidate(
        &mut self,
        candidate: Candidate,
        policy: &BlindPolicy,
        now: Instant,
    ) -> Verdict {
        if candidate.score.improves_on(self.best.score) {
            let snapshot = Snapshot::from(candidate);
            self.best = snapshot.clone();
            self.current = snapshot;
            self.without_improvement = 0;
            self.blind_mode = false;
            self.last_improvement = now;
            return Verdict::Improved;
        }
        self.without_improvement += 1;
        let verdict = if policy.move_to_blind_on_worse_score {
            self.current = Snapshot::from(candidate);
            self.blind_mode = true;
            Verdict::Blind
        } else {
            Verdict::Rejected
        };
        self.check_blind_limits(policy, now);
        verdict
    }

    pub fn record_failure(&mut self, policy: &BlindPolicy, now: Instant) -> Verdict {
        self.without_improvement += 1;
        self.check_blind_limits(policy, now);
        Verdict::Failed
    }

    /// Consume the state, applying any pending revert. Returns `(current, best)`.
    pub fn finish(mut self) -> (Snapshot, Snapshot) {
        if self.revert_pending {
            self.apply_revert();
        }
        (self.current, self.best)
    }

    fn check_blind_limits(&mut self, policy: &BlindPolicy, now: Instant) {
        let count_exceeded = self.without_improvement >= policy.iter_limit.max(1);
        let time_exceeded =
            self.blind_mode && limit_reached(self.last_improvement, policy.time_limit, now);
        if count_exceeded || time_exceeded {
            self.revert_pending = true;
        }
    }

    fn apply_revert(&mut self) {
        self.current = self.best.clone();
        self.revert_pending = false;
        self.blind_mode = false;
        self.without_improvement = 0;
    }
}
