//! A whole co-estimation run:
//! `Init -> InitialAlignment -> InitialTreeSearch -> Refining -> PostSearch -> Done`.
//!
//! The control thread runs everything here and only ever blocks on job results.
//! Temp scopes are RAII guards, so every exit path (including cancellation)
//! removes what was created unless temporaries are kept.

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use serde::{Serialize, Serializer};
use tracing::{info, instrument, warn};

use crate::core::dataset::{
    Datatype, Locus, MultiLocusDataset, NameMap, SummaryStats, check_dataset,
};
use crate::core::phylo::{Tree, check_tree_matches_taxa};
use crate::core::score::{Score, ScoreTransform};
use crate::core::state::{IterationState, Snapshot, StopReason};
use crate::io::config::{SateConfig, write_config};
use crate::io::fasta::read_input;
use crate::io::newick::read_tree_file;
use crate::io::products::RunProducts;
use crate::io::temp::TempScope;
use crate::io::tools::{JobContext, Team};
use crate::iteration::{Engine, RefineSettings};
use crate::looping::refine;
use crate::sched::cancel::Cancellation;
use crate::sched::dispatch::{run_batch, run_one};
use crate::sched::pool::WorkerPool;

/// Name of the config snapshot inside the run temp directory.
pub const LAST_USED_CONFIG: &str = "last_used.toml";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Init,
    InitialAlignment,
    InitialTreeSearch,
    Refining,
    PostSearch,
    Done,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Phase::Init => "init",
            Phase::InitialAlignment => "initial alignment",
            Phase::InitialTreeSearch => "initial tree search",
            Phase::Refining => "refining",
            Phase::PostSearch => "post-search",
            Phase::Done => "done",
        };
        f.write_str(text)
    }
}

/// What a finished run reports.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunSummary {
    pub stop: StopReason,
    /// Phases entered, in order.
    pub phases: Vec<Phase>,
    pub iterations: u32,
    pub best_score: Option<Score>,
    /// Score of the written alignment and tree.
    pub final_score: Option<Score>,
    #[serde(rename = "elapsed_secs", serialize_with = "as_secs")]
    pub elapsed: Duration,
    pub output_directory: PathBuf,
}

fn as_secs<S: Serializer>(elapsed: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_f64(elapsed.as_secs_f64())
}

/// Builds the tool team once the effective config and the internal datatype
/// are known.
pub type TeamBuilder<'a> = dyn Fn(&SateConfig, Datatype) -> Team + 'a;

struct Run<'a> {
    cfg: &'a SateConfig,
    engine: Engine<'a>,
    run_scope: &'a TempScope,
    phases: Vec<Phase>,
}

impl Run<'_> {
    fn enter(&mut self, phase: Phase) {
        info!(%phase, "entering phase");
        self.phases.push(phase);
    }

    fn keep_alignment_temps(&self) -> bool {
        self.cfg.commandline.keeptemp && self.cfg.commandline.keepalignmenttemps
    }

    /// One aligner job per locus, all in flight together.
    fn initial_alignment(&mut self, dataset: MultiLocusDataset) -> Result<MultiLocusDataset> {
        self.enter(Phase::InitialAlignment);
        let scope = self.run_scope.child("init_aln_", self.keep_alignment_temps())?;
        let jobs: Vec<_> = dataset
            .loci
            .iter()
            .enumerate()
            .map(|(idx, locus)| {
                self.engine.team.aligner.create_job(
                    locus.alignment.clone(),
                    JobContext::new(
                        scope.path(),
                        format!("initalign_l{idx}"),
                        self.keep_alignment_temps(),
                    ),
                )
            })
            .collect();
        let results = run_batch(self.engine.pool, self.engine.cancellation, &jobs)?;
        let mut loci = Vec::with_capacity(dataset.len());
        for (locus, result) in dataset.loci.into_iter().zip(results) {
            let alignment = result
                .with_context(|| format!("initial alignment of locus '{}' failed", locus.name))?;
            loci.push(Locus {
                name: locus.name,
                alignment,
            });
        }
        info!(loci = loci.len(), "initial alignment complete");
        Ok(MultiLocusDataset::new(loci))
    }

    /// One tree search over the concatenated alignment.
    fn initial_tree_search(
        &mut self,
        dataset: &MultiLocusDataset,
        start_tree: Option<Tree>,
    ) -> Result<(Tree, Score)> {
        self.enter(Phase::InitialTreeSearch);
        let scope = self.run_scope.child("init_tree_", self.cfg.commandline.keeptemp)?;
        let job = self.engine.team.tree_estimator.create_job(
            dataset.concatenate()?,
            start_tree,
            JobContext::new(scope.path(), "inittree", self.cfg.commandline.keeptemp),
        );
        let result = run_one(self.engine.pool, self.engine.cancellation, &job)?
            .context("initial tree search failed")?;
        let score = self.engine.transform.transform(result.score, &self.engine.weights);
        info!(%score, "initial tree search complete");
        Ok((result.tree, score))
    }

    /// Optional extra search with the post-search tool. Accepted only if it
    /// beats `best`; a failed search leaves `chosen` unchanged.
    fn post_search(&mut self, chosen: &mut Snapshot, best: Option<Score>) -> Result<()> {
        let Some(estimator) = self.engine.team.post_estimator.clone() else {
            return Ok(());
        };
        self.enter(Phase::PostSearch);
        let scope = self.run_scope.child("post_tree_", self.cfg.commandline.keeptemp)?;
        let start_tree = self
            .cfg
            .sate
            .start_tree_search_from_current
            .then(|| chosen.tree.clone());
        let job = estimator.create_job(
            chosen.dataset.concatenate()?,
            start_tree,
            JobContext::new(scope.path(), "postraxtree", self.cfg.commandline.keeptemp),
        );
        match run_one(self.engine.pool, self.engine.cancellation, &job)? {
            Ok(result) => {
                let score = self.engine.transform.transform(result.score, &self.engine.weights);
                if score.improves_on(best) {
                    info!(%score, "post-search tree improves the best score, using it");
                    chosen.tree = result.tree;
                    chosen.score = Some(score);
                } else {
                    info!(%score, "post-search tree does not improve the best score, ignoring it");
                }
            }
            Err(err) => warn!(
                err = %format!("{err:#}"),
                "post-search failed, keeping refined tree"
            ),
        }
        Ok(())
    }
}

/// Run SATe as configured. `cfg` must have passed validation; `--auto`
/// defaults are applied here once the data has been read.
#[instrument(skip_all, fields(job = %cfg.commandline.job))]
pub fn run_sate(
    mut cfg: SateConfig,
    build_team: &TeamBuilder<'_>,
    transform: &dyn ScoreTransform,
    cancellation: Arc<Cancellation>,
) -> Result<RunSummary> {
    let started = Instant::now();
    info!(phase = %Phase::Init, "entering phase");

    let input = cfg.input()?.to_path_buf();
    let mut dataset = read_input(&input, cfg.commandline.multilocus)
        .with_context(|| format!("read input {}", input.display()))?;
    check_dataset(&dataset)?;
    if cfg.commandline.auto {
        let stats = SummaryStats::from_dataset(&dataset, cfg.commandline.datatype);
        cfg.apply_auto_defaults(&stats);
        cfg.validate()?;
    }

    let mut start_tree = match &cfg.commandline.treefile {
        Some(path) => {
            let tree = read_tree_file(path)?;
            check_tree_matches_taxa(&tree, &dataset.taxa())
                .with_context(|| format!("starting tree {}", path.display()))?;
            Some(tree)
        }
        None => None,
    };

    let output_directory = cfg.output_directory()?;
    let products = RunProducts::new(&output_directory, &cfg.commandline.job)?;
    let run_scope = TempScope::create_top_level(
        &cfg.temporaries_directory(),
        &format!("{}_", cfg.commandline.job),
        cfg.commandline.keeptemp,
    )?;
    write_config(&run_scope.path().join(LAST_USED_CONFIG), &cfg)?;
    products.write_config(&cfg)?;

    let names = dataset.relabel_for_tools();
    products.write_name_translation(&names)?;
    if let Some(tree) = start_tree.as_mut() {
        tree.relabel_leaves(|real| names.safe(real).map(str::to_string))?;
    }
    let restore_rna = cfg.commandline.datatype == Datatype::Rna;
    let datatype = if restore_rna {
        dataset.convert_rna_to_dna();
        Datatype::Dna
    } else {
        cfg.commandline.datatype
    };

    let aligned_input = cfg.commandline.aligned && dataset.is_aligned();
    if cfg.commandline.aligned && !aligned_input {
        warn!("input was declared aligned but sequence lengths differ; aligning it");
    }
    if !cfg.commandline.aligned && start_tree.is_none() && dataset.is_aligned() {
        info!("input sequences have equal lengths but were not declared aligned; aligning them");
    }

    let team = build_team(&cfg, datatype);
    let pool = WorkerPool::new(cfg.sate.num_cpus, cancellation.token())?;
    let mut run = Run {
        cfg: &cfg,
        engine: Engine {
            pool: &pool,
            cancellation: &cancellation,
            team: &team,
            transform,
            weights: cfg.score,
        },
        run_scope: &run_scope,
        phases: vec![Phase::Init],
    };

    let (stop, iterations, best_score, mut chosen) = if cfg.commandline.two_phase {
        if !aligned_input {
            dataset = run.initial_alignment(dataset)?;
        }
        let (tree, score) = run.initial_tree_search(&dataset, start_tree.take())?;
        info!("two-phase mode: skipping refinement");
        let snapshot = Snapshot {
            dataset,
            tree,
            score: Some(score),
        };
        (StopReason::TwoPhase, 0, Some(score), snapshot)
    } else {
        let initial = match start_tree.take() {
            Some(tree) => {
                info!("using the supplied starting tree");
                Snapshot {
                    dataset,
                    tree,
                    score: None,
                }
            }
            None => {
                if !aligned_input {
                    dataset = run.initial_alignment(dataset)?;
                } else {
                    info!("input sequences are aligned, skipping initial alignment");
                }
                let (tree, score) = run.initial_tree_search(&dataset, None)?;
                Snapshot {
                    dataset,
                    tree,
                    score: Some(score),
                }
            }
        };

        run.enter(Phase::Refining);
        let settings = RefineSettings {
            max_subproblem_size: cfg.sate.max_subproblem_size,
            max_subproblem_frac: cfg.sate.max_subproblem_frac,
            start_tree_search_from_current: cfg.sate.start_tree_search_from_current,
            keep_iteration_temps: cfg.commandline.keeptemp,
            keep_realignment_temps: run.keep_alignment_temps(),
        };
        let mut state = IterationState::new(initial, Instant::now());
        let stop = refine(
            &run.engine,
            &settings,
            &cfg.blind_policy(),
            &cfg.run_limits(),
            &mut state,
            &run_scope,
            |_| {},
        )?;
        let iterations = state.iterations();
        let best_score = state.best_score();
        let (current, best) = state.finish();
        let mut chosen = if cfg.sate.return_final_tree_and_alignment {
            current
        } else {
            best
        };
        run.post_search(&mut chosen, best_score)?;
        let best_score = match (best_score, chosen.score) {
            (Some(b), Some(c)) => Some(b.max(c)),
            (b, c) => b.or(c),
        };
        (stop, iterations, best_score, chosen)
    };

    run.enter(Phase::Done);
    let phases = std::mem::take(&mut run.phases);
    drop(run);
    drop(pool);

    write_products(&products, &mut chosen, &names, restore_rna)?;
    let summary = RunSummary {
        stop,
        phases,
        iterations,
        best_score,
        final_score: chosen.score,
        elapsed: started.elapsed(),
        output_directory,
    };
    info!(
        stop = %summary.stop,
        iterations = summary.iterations,
        best_score = ?summary.best_score.map(Score::value),
        elapsed_secs = summary.elapsed.as_secs_f64(),
        "run finished"
    );
    Ok(summary)
}

fn write_products(
    products: &RunProducts,
    chosen: &mut Snapshot,
    names: &NameMap,
    restore_rna: bool,
) -> Result<()> {
    chosen.dataset.restore_names(names)?;
    chosen
        .tree
        .relabel_leaves(|safe| names.real(safe).map(str::to_string))?;
    if restore_rna {
        chosen.dataset.convert_dna_to_rna();
    }
    products.write_results(&chosen.dataset, &chosen.tree, chosen.score)
}
