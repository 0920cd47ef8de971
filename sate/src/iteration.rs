//! One refining iteration: decompose the current tree, realign every
//! subproblem of every locus, merge bottom-up, and re-estimate the tree.

use std::collections::BTreeMap;

use anyhow::{Result, bail};
use tracing::{debug, info, instrument, warn};

use crate::core::dataset::{Alignment, Locus, MultiLocusDataset};
use crate::core::decompose::{MergePlan, Slot, centroid_decomposition, subproblem_bound};
use crate::core::score::{ScoreTransform, ScoreWeights};
use crate::core::state::{Candidate, Snapshot};
use crate::io::temp::TempScope;
use crate::io::tools::{JobContext, Team};
use crate::sched::cancel::Cancellation;
use crate::sched::dispatch::{run_batch, run_one};
use crate::sched::job::Job;
use crate::sched::pool::WorkerPool;

/// Refinement parameters fixed for the whole run.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RefineSettings {
    pub max_subproblem_size: usize,
    pub max_subproblem_frac: f64,
    pub start_tree_search_from_current: bool,
    pub keep_iteration_temps: bool,
    pub keep_realignment_temps: bool,
}

/// Everything the control thread needs to submit work.
pub struct Engine<'a> {
    pub pool: &'a WorkerPool,
    pub cancellation: &'a Cancellation,
    pub team: &'a Team,
    pub transform: &'a dyn ScoreTransform,
    pub weights: ScoreWeights,
}

/// Per-locus alignments of one decomposition slot.
type LociAlignments = Vec<Alignment>;

/// Run one iteration from `current`. `Ok(None)` means the iteration produced
/// no candidate (a merge or the tree search failed); errors abort the run.
#[instrument(skip_all, fields(iteration = iteration))]
pub fn run_iteration(
    engine: &Engine<'_>,
    settings: &RefineSettings,
    current: &Snapshot,
    scope: &TempScope,
    iteration: u32,
) -> Result<Option<Candidate>> {
    let taxa = current.dataset.taxa();
    let bound = subproblem_bound(
        taxa.len(),
        settings.max_subproblem_size,
        settings.max_subproblem_frac,
    );
    let plan = centroid_decomposition(&current.tree, bound)?.plan();
    debug!(parts = plan.parts.len(), merges = plan.merges.len(), bound, "decomposed tree");

    let parts = realign_parts(engine, settings, current, &plan, scope, iteration)?;
    let Some(merged) = merge_parts(engine, settings, &plan, parts, scope, iteration)? else {
        return Ok(None);
    };

    let dataset = MultiLocusDataset::new(
        current
            .dataset
            .loci
            .iter()
            .zip(merged)
            .map(|(locus, alignment)| Locus {
                name: locus.name.clone(),
                alignment,
            })
            .collect(),
    );

    let matrix = dataset.concatenate()?;
    let start_tree = settings
        .start_tree_search_from_current
        .then(|| current.tree.clone());
    let job = engine.team.tree_estimator.create_job(
        matrix,
        start_tree,
        JobContext::new(
            scope.path(),
            format!("iter{iteration}_tree"),
            settings.keep_iteration_temps,
        ),
    );
    let result = match run_one(engine.pool, engine.cancellation, &job)? {
        Ok(result) => result,
        Err(err) => {
            warn!(iteration, err = %format!("{err:#}"), "tree search failed, discarding iteration");
            return Ok(None);
        }
    };
    let score = engine.transform.transform(result.score, &engine.weights);
    Ok(Some(Candidate {
        dataset,
        tree: result.tree,
        score,
    }))
}

/// Realign the induced sub-alignment of every (part, locus) pair concurrently.
/// Failed realignments fall back to the induced sub-alignment; if none
/// succeeds, the run is aborted.
fn realign_parts(
    engine: &Engine<'_>,
    settings: &RefineSettings,
    current: &Snapshot,
    plan: &MergePlan,
    scope: &TempScope,
    iteration: u32,
) -> Result<Vec<LociAlignments>> {
    let mut parts: Vec<LociAlignments> = Vec::with_capacity(plan.parts.len());
    let mut jobs: Vec<Job<Alignment>> = Vec::new();
    let mut job_slots: Vec<(usize, usize)> = Vec::new();

    for (p, names) in plan.parts.iter().enumerate() {
        let mut per_locus = Vec::with_capacity(current.dataset.len());
        for (l, locus) in current.dataset.loci.iter().enumerate() {
            let sub = locus.alignment.sub_alignment(names).without_gap_columns();
            if sub.len() >= 2 {
                jobs.push(engine.team.aligner.create_job(
                    sub.clone(),
                    JobContext::new(
                        scope.path(),
                        format!("iter{iteration}_p{p}_l{l}"),
                        settings.keep_realignment_temps,
                    ),
                ));
                job_slots.push((p, l));
            }
            per_locus.push(sub);
        }
        parts.push(per_locus);
    }

    if jobs.is_empty() {
        return Ok(parts);
    }
    let results = run_batch(engine.pool, engine.cancellation, &jobs)?;
    let mut succeeded = 0usize;
    for ((p, l), result) in job_slots.into_iter().zip(results) {
        match result {
            Ok(aligned) => {
                parts[p][l] = aligned;
                succeeded += 1;
            }
            Err(err) => warn!(
                part = p,
                locus = l,
                err = %format!("{err:#}"),
                "realignment failed, keeping the current sub-alignment"
            ),
        }
    }
    if succeeded == 0 {
        bail!("every realignment of iteration {iteration} failed");
    }
    debug!(succeeded, total = jobs.len(), "realignment finished");
    Ok(parts)
}

/// Merge bottom-up following `plan`; merges of equal height run together.
/// Returns the per-locus alignments of the root, or `None` if a merge failed.
fn merge_parts(
    engine: &Engine<'_>,
    settings: &RefineSettings,
    plan: &MergePlan,
    parts: Vec<LociAlignments>,
    scope: &TempScope,
    iteration: u32,
) -> Result<Option<LociAlignments>> {
    let mut merged: Vec<Option<LociAlignments>> = vec![None; plan.merges.len()];
    let mut by_height: BTreeMap<usize, Vec<usize>> = BTreeMap::new();
    for (idx, step) in plan.merges.iter().enumerate() {
        by_height.entry(step.height).or_default().push(idx);
    }

    for (height, steps) in by_height {
        let mut jobs: Vec<Job<Alignment>> = Vec::new();
        let mut job_slots: Vec<usize> = Vec::new();
        for &idx in &steps {
            let step = plan.merges[idx];
            let left = slot_alignments(&parts, &merged, step.left)?;
            let right = slot_alignments(&parts, &merged, step.right)?;
            for (l, (a, b)) in left.iter().zip(right).enumerate() {
                jobs.push(engine.team.merger.create_job(
                    a.clone(),
                    b.clone(),
                    JobContext::new(
                        scope.path(),
                        format!("iter{iteration}_m{idx}_l{l}"),
                        settings.keep_realignment_temps,
                    ),
                ));
                job_slots.push(idx);
            }
        }
        let results = run_batch(engine.pool, engine.cancellation, &jobs)?;
        for (idx, result) in job_slots.into_iter().zip(results) {
            match result {
                Ok(alignment) => merged[idx].get_or_insert_with(Vec::new).push(alignment),
                Err(err) => {
                    warn!(
                        iteration,
                        height,
                        err = %format!("{err:#}"),
                        "merge failed, discarding iteration"
                    );
                    return Ok(None);
                }
            }
        }
        info!(iteration, height, merges = steps.len(), "merge level complete");
    }

    Ok(Some(slot_alignments(&parts, &merged, plan.root)?.clone()))
}

fn slot_alignments<'a>(
    parts: &'a [LociAlignments],
    merged: &'a [Option<LociAlignments>],
    slot: Slot,
) -> Result<&'a LociAlignments> {
    let found = match slot {
        Slot::Part(p) => parts.get(p),
        Slot::Merge(m) => merged.get(m).and_then(Option::as_ref),
    };
    match found {
        Some(alignments) => Ok(alignments),
        None => bail!("merge input {slot:?} is not available"),
    }
}
