//! Test-only helpers: a scripted tool team that never spawns processes, and
//! builders for sequence data and settings.

use std::collections::VecDeque;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Result, bail};

use crate::core::dataset::{Alignment, GAP, Sequence};
use crate::core::phylo::Tree;
use crate::io::config::SateConfig;
use crate::io::fasta::write_fasta;
use crate::io::tools::{Aligner, JobContext, Merger, Team, TreeEstimator, TreeResult};
use crate::sched::cancel::KillSwitch;
use crate::sched::job::{Job, JobHandle};

/// Score returned by scripted tree searches once the scripted scores run out.
pub const DEFAULT_TREE_SCORE: f64 = -1000.0;

/// How long a blocking scripted job waits for its kill before giving up.
const BLOCK_LIMIT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolKind {
    Align,
    Merge,
    Tree,
    PostTree,
}

/// One scripted tool invocation, recorded when the job starts running.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Call {
    pub kind: ToolKind,
    pub label: String,
    /// Tree searches only: whether a starting tree was passed.
    pub seeded: bool,
}

#[derive(Default)]
struct ScriptState {
    calls: Vec<Call>,
    handles: Vec<JobHandle>,
    tree_scores: VecDeque<f64>,
    post_scores: VecDeque<f64>,
    fail_prefixes: Vec<String>,
    block_prefixes: Vec<String>,
    started: Option<Sender<String>>,
}

/// Shared script behind every scripted adapter of one [`Team`].
///
/// Failures and blocking are selected by job label prefix, e.g. `iter1_p0`
/// or `initalign_l2`.
#[derive(Default)]
pub struct Script {
    state: Mutex<ScriptState>,
}

impl Script {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ScriptState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Raw scores handed out by successive main tree searches.
    pub fn tree_scores(self: &Arc<Self>, scores: impl IntoIterator<Item = f64>) -> Arc<Self> {
        self.lock().tree_scores.extend(scores);
        Arc::clone(self)
    }

    /// Raw scores handed out by successive post-searches.
    pub fn post_scores(self: &Arc<Self>, scores: impl IntoIterator<Item = f64>) -> Arc<Self> {
        self.lock().post_scores.extend(scores);
        Arc::clone(self)
    }

    /// Jobs whose label starts with `prefix` fail.
    pub fn fail(self: &Arc<Self>, prefix: &str) -> Arc<Self> {
        self.lock().fail_prefixes.push(prefix.to_string());
        Arc::clone(self)
    }

    /// Jobs whose label starts with `prefix` announce themselves on the
    /// returned channel and then block until killed.
    pub fn block(self: &Arc<Self>, prefix: &str) -> Receiver<String> {
        let (tx, rx) = mpsc::channel();
        let mut state = self.lock();
        state.block_prefixes.push(prefix.to_string());
        state.started = Some(tx);
        rx
    }

    pub fn calls(&self) -> Vec<Call> {
        self.lock().calls.clone()
    }

    pub fn calls_of(&self, kind: ToolKind) -> Vec<Call> {
        self.calls().into_iter().filter(|c| c.kind == kind).collect()
    }

    /// Every job created by the scripted adapters, in creation order.
    pub fn handles(&self) -> Vec<JobHandle> {
        self.lock().handles.clone()
    }

    /// A team of scripted adapters without a post-search.
    pub fn team(self: &Arc<Self>) -> Team {
        Team {
            aligner: Arc::new(ScriptedAligner(Arc::clone(self))),
            merger: Arc::new(ScriptedMerger(Arc::clone(self))),
            tree_estimator: Arc::new(ScriptedTreeEstimator {
                script: Arc::clone(self),
                kind: ToolKind::Tree,
            }),
            post_estimator: None,
        }
    }

    /// [`Script::team`] plus a scripted post-search estimator.
    pub fn team_with_post_search(self: &Arc<Self>) -> Team {
        Team {
            post_estimator: Some(Arc::new(ScriptedTreeEstimator {
                script: Arc::clone(self),
                kind: ToolKind::PostTree,
            })),
            ..self.team()
        }
    }

    fn register<T: Clone + Send + 'static>(&self, job: Job<T>) -> Job<T> {
        self.lock().handles.push(job.handle());
        job
    }

    fn begin(&self, kind: ToolKind, label: &str, seeded: bool, kill: &KillSwitch) -> Result<()> {
        let (fail, block, started) = {
            let mut state = self.lock();
            state.calls.push(Call {
                kind,
                label: label.to_string(),
                seeded,
            });
            let fail = state.fail_prefixes.iter().any(|p| label.starts_with(p.as_str()));
            let block = state.block_prefixes.iter().any(|p| label.starts_with(p.as_str()));
            (fail, block, state.started.clone())
        };
        if fail {
            bail!("scripted failure of '{label}'");
        }
        if block {
            if let Some(tx) = started {
                let _ = tx.send(label.to_string());
            }
            let deadline = Instant::now() + BLOCK_LIMIT;
            while !kill.is_tripped() {
                if Instant::now() >= deadline {
                    bail!("scripted job '{label}' was never killed");
                }
                thread::sleep(Duration::from_millis(5));
            }
            bail!("scripted job '{label}' interrupted");
        }
        Ok(())
    }

    fn next_score(&self, kind: ToolKind) -> f64 {
        let mut state = self.lock();
        let queue = match kind {
            ToolKind::PostTree => &mut state.post_scores,
            _ => &mut state.tree_scores,
        };
        queue.pop_front().unwrap_or(DEFAULT_TREE_SCORE)
    }
}

/// Pad every row with gaps to the longest row.
pub fn pad_rows(sequences: Vec<Sequence>) -> Alignment {
    let width = sequences
        .iter()
        .map(|s| s.residues.chars().count())
        .max()
        .unwrap_or(0);
    Alignment::new(
        sequences
            .into_iter()
            .map(|mut s| {
                let missing = width - s.residues.chars().count();
                s.residues.extend(std::iter::repeat_n(GAP, missing));
                s
            })
            .collect(),
    )
}

/// Aligns by removing gaps and padding rows to a common length.
pub struct ScriptedAligner(Arc<Script>);

impl Aligner for ScriptedAligner {
    fn name(&self) -> &str {
        "scripted-aligner"
    }

    fn create_job(&self, sequences: Alignment, ctx: JobContext) -> Job<Alignment> {
        let script = Arc::clone(&self.0);
        let label = ctx.label.clone();
        self.0.register(Job::new(ctx.label, move |kill: &KillSwitch| {
            script.begin(ToolKind::Align, &label, false, kill)?;
            Ok(pad_rows(sequences.degapped().sequences))
        }))
    }
}

/// Merges by stacking both profiles and padding to a common length.
pub struct ScriptedMerger(Arc<Script>);

impl Merger for ScriptedMerger {
    fn name(&self) -> &str {
        "scripted-merger"
    }

    fn create_job(&self, left: Alignment, right: Alignment, ctx: JobContext) -> Job<Alignment> {
        let script = Arc::clone(&self.0);
        let label = ctx.label.clone();
        self.0.register(Job::new(ctx.label, move |kill: &KillSwitch| {
            script.begin(ToolKind::Merge, &label, false, kill)?;
            let mut rows = left.sequences;
            rows.extend(right.sequences);
            Ok(pad_rows(rows))
        }))
    }
}

/// Returns a caterpillar over the alignment's rows and the next scripted score.
pub struct ScriptedTreeEstimator {
    script: Arc<Script>,
    kind: ToolKind,
}

impl TreeEstimator for ScriptedTreeEstimator {
    fn name(&self) -> &str {
        "scripted-tree"
    }

    fn create_job(
        &self,
        alignment: Alignment,
        start_tree: Option<Tree>,
        ctx: JobContext,
    ) -> Job<TreeResult> {
        let script = Arc::clone(&self.script);
        let kind = self.kind;
        let label = ctx.label.clone();
        self.script.register(Job::new(ctx.label, move |kill: &KillSwitch| {
            script.begin(kind, &label, start_tree.is_some(), kill)?;
            let mut names = alignment.names();
            names.sort_unstable();
            Ok(TreeResult {
                score: script.next_score(kind),
                tree: Tree::caterpillar(&names),
            })
        }))
    }
}

/// Deterministic DNA residues for taxon `taxon` of locus `locus`.
pub fn residues(taxon: usize, locus: usize, len: usize) -> String {
    const BASES: [char; 4] = ['A', 'C', 'G', 'T'];
    (0..len)
        .map(|i| BASES[(i * 7 + taxon * 3 + locus) % BASES.len()])
        .collect()
}

/// Taxon names `t0`, `t1`, ...
pub fn taxon_names(taxa: usize) -> Vec<String> {
    (0..taxa).map(|i| format!("t{i}")).collect()
}

/// One locus over `taxa` taxa. Unaligned rows get lengths `len..len + 2`.
pub fn locus_alignment(taxa: usize, locus: usize, len: usize, aligned: bool) -> Alignment {
    Alignment::new(
        taxon_names(taxa)
            .into_iter()
            .enumerate()
            .map(|(i, name)| {
                let extra = if aligned { 0 } else { i % 3 };
                Sequence::new(name, residues(i, locus, len + extra))
            })
            .collect(),
    )
}

/// Write input data under `dir`: a single FASTA file for one locus, or a
/// directory of `locus<N>.fasta` files otherwise. Returns the input path.
pub fn write_input(dir: &Path, taxa: usize, loci: usize, len: usize, aligned: bool) -> PathBuf {
    if loci == 1 {
        let path = dir.join("input.fasta");
        write_fasta(&path, &locus_alignment(taxa, 0, len, aligned)).expect("write input");
        return path;
    }
    let input = dir.join("input");
    fs::create_dir_all(&input).expect("create input dir");
    for locus in 0..loci {
        let path = input.join(format!("locus{locus}.fasta"));
        write_fasta(&path, &locus_alignment(taxa, locus, len, aligned)).expect("write locus");
    }
    input
}

/// Settings for a run rooted at `work`: outputs in `work/out`, temporaries in
/// `work/tmp`, two workers, and a one-iteration limit.
pub fn test_config(input: &Path, work: &Path) -> SateConfig {
    let mut cfg = SateConfig::default();
    cfg.commandline.input = Some(input.to_path_buf());
    cfg.commandline.multilocus = input.is_dir();
    cfg.commandline.job = "testjob".to_string();
    cfg.commandline.output_directory = Some(work.join("out"));
    cfg.commandline.temporaries = Some(work.join("tmp"));
    cfg.sate.num_cpus = 2;
    cfg.sate.iter_limit = Some(1);
    cfg
}

/// Entries directly under `dir` (empty if it does not exist).
pub fn dir_entries(dir: &Path) -> Vec<PathBuf> {
    match fs::read_dir(dir) {
        Ok(entries) => {
            let mut paths: Vec<PathBuf> =
                entries.filter_map(|e| e.ok().map(|e| e.path())).collect();
            paths.sort();
            paths
        }
        Err(_) => Vec::new(),
    }
}
