//! External tool adapters.
//!
//! Each adapter turns a request into a [`Job`] that, once a worker runs it,
//! creates its own temp scope under the request's `tmp_dir`, invokes the tool
//! there (own process group, timeout, bounded output) and parses the result.
//! Tests swap the whole [`Team`] for scripted adapters that never spawn.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::{Arc, LazyLock};

use anyhow::{Context, Result, anyhow, bail};
use regex::Regex;
use tracing::{debug, info};

use crate::core::dataset::{Alignment, Datatype};
use crate::core::phylo::Tree;
use crate::io::config::{AlignerKind, MergerKind, SateConfig, TreeEstimatorKind};
use crate::io::fasta::{compose_fasta, compose_relaxed_phylip, parse_fasta, read_fasta};
use crate::io::newick::{compose_newick, parse_newick, read_tree_file};
use crate::io::process::{CommandOutput, ProcessLimits, run_command};
use crate::io::temp::create_scope;
use crate::sched::cancel::KillSwitch;
use crate::sched::job::Job;

/// Where and under which name a job does its work.
#[derive(Debug, Clone)]
pub struct JobContext {
    /// Parent directory for the job's own temp scope.
    pub tmp_dir: PathBuf,
    /// Short label used in job names, temp directory names and logs.
    pub label: String,
    pub keep_temps: bool,
}

impl JobContext {
    pub fn new(tmp_dir: &Path, label: impl Into<String>, keep_temps: bool) -> Self {
        Self {
            tmp_dir: tmp_dir.to_path_buf(),
            label: label.into(),
            keep_temps,
        }
    }
}

/// Raw (untransformed) tool score and the estimated tree.
#[derive(Debug, Clone, PartialEq)]
pub struct TreeResult {
    pub score: f64,
    pub tree: Tree,
}

pub trait Aligner: Send + Sync {
    fn name(&self) -> &str;
    /// Align `sequences` (gaps are removed first).
    fn create_job(&self, sequences: Alignment, ctx: JobContext) -> Job<Alignment>;
}

pub trait Merger: Send + Sync {
    fn name(&self) -> &str;
    /// Profile-align two alignments over disjoint taxa.
    fn create_job(&self, left: Alignment, right: Alignment, ctx: JobContext) -> Job<Alignment>;
}

pub trait TreeEstimator: Send + Sync {
    fn name(&self) -> &str;
    /// Estimate a tree from the (concatenated) alignment, optionally starting
    /// from `start_tree`.
    fn create_job(
        &self,
        alignment: Alignment,
        start_tree: Option<Tree>,
        ctx: JobContext,
    ) -> Job<TreeResult>;
}

/// The tools one run uses.
#[derive(Clone)]
pub struct Team {
    pub aligner: Arc<dyn Aligner>,
    pub merger: Arc<dyn Merger>,
    pub tree_estimator: Arc<dyn TreeEstimator>,
    /// Post-search estimator; present only when a post-search is configured.
    pub post_estimator: Option<Arc<dyn TreeEstimator>>,
}

impl Team {
    /// Build the external-tool team. `datatype` is the internal one (RNA
    /// already converted to DNA).
    pub fn from_config(cfg: &SateConfig, datatype: Datatype) -> Self {
        let limits = cfg.tools.process_limits();
        let tools = &cfg.tools;
        let aligner: Arc<dyn Aligner> = match cfg.sate.aligner {
            AlignerKind::Mafft => Arc::new(Mafft::new(&tools.mafft, limits)),
            AlignerKind::Muscle => Arc::new(Muscle::new(&tools.muscle, limits)),
        };
        let merger: Arc<dyn Merger> = match cfg.sate.merger {
            MergerKind::Muscle => Arc::new(MuscleMerger::new(&tools.muscle, limits)),
            MergerKind::Opal => Arc::new(Opal::new(&tools.opal, limits)),
        };
        let tree_estimator: Arc<dyn TreeEstimator> = match cfg.sate.tree_estimator {
            TreeEstimatorKind::Fasttree => Arc::new(FastTree::new(
                &tools.fasttree,
                datatype,
                &cfg.fasttree.model,
                limits,
            )),
            TreeEstimatorKind::Raxml => {
                let model = raxml_model(cfg, datatype);
                Arc::new(Raxml::new(&tools.raxml, &model, limits))
            }
        };
        let post_estimator: Option<Arc<dyn TreeEstimator>> =
            cfg.commandline.raxml_search_after.then(|| {
                let model = raxml_model(cfg, datatype);
                Arc::new(Raxml::new(&tools.raxml, &model, limits)) as Arc<dyn TreeEstimator>
            });
        Self {
            aligner,
            merger,
            tree_estimator,
            post_estimator,
        }
    }
}

fn raxml_model(cfg: &SateConfig, datatype: Datatype) -> String {
    let model = cfg.raxml.model.trim();
    if model.is_empty() {
        fasttree_to_raxml_model(datatype, &cfg.fasttree.model)
    } else {
        model.to_string()
    }
}

/// RAxML model string equivalent to a FastTree model flag set.
pub fn fasttree_to_raxml_model(datatype: Datatype, fasttree_model: &str) -> String {
    let model = fasttree_model.to_uppercase();
    let gamma = model.contains("-GAMMA");
    let name = if datatype.is_protein() {
        match (model.contains("-WAG"), gamma) {
            (true, true) => "PROTGAMMAWAGF",
            (true, false) => "PROTCATWAGF",
            (false, true) => "PROTGAMMAJTTF",
            (false, false) => "PROTCATJTTF",
        }
    } else if gamma {
        "GTRGAMMA"
    } else {
        "GTRCAT"
    };
    name.to_string()
}

/// Alignments of fewer than two sequences need no tool run.
fn trivial_alignment(sequences: &Alignment) -> Option<Alignment> {
    (sequences.len() < 2).then(|| sequences.clone())
}

fn run_tool(
    tool: &str,
    cmd: Command,
    limits: ProcessLimits,
    kill: &KillSwitch,
) -> Result<CommandOutput> {
    let out = run_command(cmd, limits, kill).with_context(|| format!("run {tool}"))?;
    out.ensure_success(tool)?;
    Ok(out)
}

/// Write `contents` to `dir/name`. Tools run with `dir` as working directory
/// and receive bare file names.
fn write_input(dir: &Path, name: &str, contents: &str) -> Result<()> {
    let path = dir.join(name);
    fs::write(&path, contents).with_context(|| format!("write {}", path.display()))
}

pub struct Mafft {
    exe: PathBuf,
    limits: ProcessLimits,
}

impl Mafft {
    pub fn new(exe: &Path, limits: ProcessLimits) -> Self {
        Self {
            exe: exe.to_path_buf(),
            limits,
        }
    }
}

impl Aligner for Mafft {
    fn name(&self) -> &str {
        "mafft"
    }

    fn create_job(&self, sequences: Alignment, ctx: JobContext) -> Job<Alignment> {
        let exe = self.exe.clone();
        let limits = self.limits;
        Job::new(format!("mafft:{}", ctx.label), move |kill| {
            let sequences = sequences.degapped();
            if let Some(done) = trivial_alignment(&sequences) {
                return Ok(done);
            }
            let scope = create_scope(&ctx.tmp_dir, &format!("{}_", ctx.label), ctx.keep_temps)?;
            write_input(scope.path(), "input.fasta", &compose_fasta(&sequences))?;
            let mut cmd = Command::new(&exe);
            cmd.current_dir(scope.path())
                .arg("--auto")
                .arg("--quiet")
                .arg("input.fasta");
            let out = run_tool("mafft", cmd, limits, kill)?;
            parse_fasta(&out.stdout_str(), "mafft output")
        })
    }
}

pub struct Muscle {
    exe: PathBuf,
    limits: ProcessLimits,
}

impl Muscle {
    pub fn new(exe: &Path, limits: ProcessLimits) -> Self {
        Self {
            exe: exe.to_path_buf(),
            limits,
        }
    }
}

impl Aligner for Muscle {
    fn name(&self) -> &str {
        "muscle"
    }

    fn create_job(&self, sequences: Alignment, ctx: JobContext) -> Job<Alignment> {
        let exe = self.exe.clone();
        let limits = self.limits;
        Job::new(format!("muscle:{}", ctx.label), move |kill| {
            let sequences = sequences.degapped();
            if let Some(done) = trivial_alignment(&sequences) {
                return Ok(done);
            }
            let scope = create_scope(&ctx.tmp_dir, &format!("{}_", ctx.label), ctx.keep_temps)?;
            write_input(scope.path(), "input.fasta", &compose_fasta(&sequences))?;
            let mut cmd = Command::new(&exe);
            cmd.current_dir(scope.path())
                .args(["-in", "input.fasta", "-out", "output.fasta", "-quiet"]);
            run_tool("muscle", cmd, limits, kill)?;
            read_fasta(&scope.path().join("output.fasta"))
        })
    }
}

/// Shared driver for two-profile mergers: writes `in1.fasta` and `in2.fasta`,
/// runs the tool with `args`, reads `merged.fasta`.
fn profile_merge_job(
    tool: &'static str,
    exe: PathBuf,
    limits: ProcessLimits,
    left: Alignment,
    right: Alignment,
    ctx: JobContext,
    args: &'static [&'static str],
) -> Job<Alignment> {
    Job::new(format!("{tool}:{}", ctx.label), move |kill| {
        if left.is_empty() {
            return Ok(right);
        }
        if right.is_empty() {
            return Ok(left);
        }
        let scope = create_scope(&ctx.tmp_dir, &format!("{}_", ctx.label), ctx.keep_temps)?;
        write_input(scope.path(), "in1.fasta", &compose_fasta(&left))?;
        write_input(scope.path(), "in2.fasta", &compose_fasta(&right))?;
        let mut cmd = Command::new(&exe);
        cmd.current_dir(scope.path()).args(args);
        run_tool(tool, cmd, limits, kill)?;
        let merged = read_fasta(&scope.path().join("merged.fasta"))?;
        if merged.len() != left.len() + right.len() {
            bail!(
                "{tool} returned {} sequences, expected {}",
                merged.len(),
                left.len() + right.len()
            );
        }
        Ok(merged)
    })
}

pub struct MuscleMerger {
    exe: PathBuf,
    limits: ProcessLimits,
}

impl MuscleMerger {
    pub fn new(exe: &Path, limits: ProcessLimits) -> Self {
        Self {
            exe: exe.to_path_buf(),
            limits,
        }
    }
}

impl Merger for MuscleMerger {
    fn name(&self) -> &str {
        "muscle"
    }

    fn create_job(&self, left: Alignment, right: Alignment, ctx: JobContext) -> Job<Alignment> {
        profile_merge_job(
            "muscle",
            self.exe.clone(),
            self.limits,
            left,
            right,
            ctx,
            &[
                "-profile",
                "-in1",
                "in1.fasta",
                "-in2",
                "in2.fasta",
                "-out",
                "merged.fasta",
                "-quiet",
            ],
        )
    }
}

pub struct Opal {
    exe: PathBuf,
    limits: ProcessLimits,
}

impl Opal {
    pub fn new(exe: &Path, limits: ProcessLimits) -> Self {
        Self {
            exe: exe.to_path_buf(),
            limits,
        }
    }
}

impl Merger for Opal {
    fn name(&self) -> &str {
        "opal"
    }

    fn create_job(&self, left: Alignment, right: Alignment, ctx: JobContext) -> Job<Alignment> {
        profile_merge_job(
            "opal",
            self.exe.clone(),
            self.limits,
            left,
            right,
            ctx,
            &[
                "--in",
                "in1.fasta",
                "--in2",
                "in2.fasta",
                "--out",
                "merged.fasta",
                "--align_method",
                "profile",
            ],
        )
    }
}

static FASTTREE_LOGLK: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"LogLk\s*=\s*(-?[0-9]+(?:\.[0-9]+)?(?:[eE][-+]?[0-9]+)?)").unwrap()
});

static RAXML_SCORE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?mi)^Final (?:GAMMA-based Score of best tree|.*likelihood:?)\s*(-?[0-9]+(?:\.[0-9]+)?(?:[eE][-+]?[0-9]+)?)",
    )
    .unwrap()
});

/// Last `LogLk = <x>` reported by FastTree.
pub fn parse_fasttree_score(log: &str) -> Result<f64> {
    let value = FASTTREE_LOGLK
        .captures_iter(log)
        .last()
        .and_then(|c| c.get(1))
        .ok_or_else(|| anyhow!("no LogLk line in FastTree output"))?;
    value
        .as_str()
        .parse()
        .with_context(|| format!("parse FastTree score '{}'", value.as_str()))
}

/// Final likelihood from a `RAxML_info` file.
pub fn parse_raxml_score(info: &str) -> Result<f64> {
    let value = RAXML_SCORE
        .captures_iter(info)
        .last()
        .and_then(|c| c.get(1))
        .ok_or_else(|| anyhow!("no final likelihood in RAxML info file"))?;
    value
        .as_str()
        .parse()
        .with_context(|| format!("parse RAxML score '{}'", value.as_str()))
}

pub struct FastTree {
    exe: PathBuf,
    datatype: Datatype,
    model: Vec<String>,
    limits: ProcessLimits,
}

impl FastTree {
    pub fn new(exe: &Path, datatype: Datatype, model: &str, limits: ProcessLimits) -> Self {
        Self {
            exe: exe.to_path_buf(),
            datatype,
            model: model.split_whitespace().map(str::to_string).collect(),
            limits,
        }
    }
}

impl TreeEstimator for FastTree {
    fn name(&self) -> &str {
        "fasttree"
    }

    fn create_job(
        &self,
        alignment: Alignment,
        start_tree: Option<Tree>,
        ctx: JobContext,
    ) -> Job<TreeResult> {
        let exe = self.exe.clone();
        let model = self.model.clone();
        let nucleotide = !self.datatype.is_protein();
        let limits = self.limits;
        Job::new(format!("fasttree:{}", ctx.label), move |kill| {
            let scope = create_scope(&ctx.tmp_dir, &format!("{}_", ctx.label), ctx.keep_temps)?;
            write_input(scope.path(), "input.fasta", &compose_fasta(&alignment))?;
            let mut cmd = Command::new(&exe);
            cmd.current_dir(scope.path());
            if nucleotide {
                cmd.arg("-nt");
            }
            cmd.args(&model);
            if let Some(tree) = &start_tree {
                write_input(scope.path(), "start.tre", &compose_newick(tree))?;
                cmd.args(["-intree", "start.tre"]);
            }
            cmd.arg("input.fasta");
            let out = run_tool("FastTree", cmd, limits, kill)?;
            let score = parse_fasttree_score(&out.stderr_str())?;
            let tree = parse_newick(&out.stdout_str(), "FastTree output")?
                .into_iter()
                .next()
                .ok_or_else(|| anyhow!("FastTree printed no tree"))?;
            debug!(score, "FastTree finished");
            Ok(TreeResult { score, tree })
        })
    }
}

pub struct Raxml {
    exe: PathBuf,
    model: String,
    seed: u64,
    limits: ProcessLimits,
}

impl Raxml {
    pub fn new(exe: &Path, model: &str, limits: ProcessLimits) -> Self {
        Self {
            exe: exe.to_path_buf(),
            model: model.to_string(),
            seed: 12345,
            limits,
        }
    }
}

impl TreeEstimator for Raxml {
    fn name(&self) -> &str {
        "raxml"
    }

    fn create_job(
        &self,
        alignment: Alignment,
        start_tree: Option<Tree>,
        ctx: JobContext,
    ) -> Job<TreeResult> {
        let exe = self.exe.clone();
        let model = self.model.clone();
        let seed = self.seed;
        let limits = self.limits;
        Job::new(format!("raxml:{}", ctx.label), move |kill| {
            let scope = create_scope(&ctx.tmp_dir, &format!("{}_", ctx.label), ctx.keep_temps)?;
            let workdir = fs::canonicalize(scope.path())
                .with_context(|| format!("resolve {}", scope.path().display()))?;
            let workdir = workdir.as_path();
            write_input(workdir, "aln.phy", &compose_relaxed_phylip(&alignment)?)?;
            let run_name = "sate";
            let mut cmd = Command::new(&exe);
            cmd.current_dir(workdir)
                .arg("-s")
                .arg("aln.phy")
                .arg("-n")
                .arg(run_name)
                .arg("-m")
                .arg(&model)
                .arg("-p")
                .arg(seed.to_string())
                .arg("-w")
                .arg(workdir);
            if let Some(tree) = &start_tree {
                write_input(workdir, "start.tre", &compose_newick(tree))?;
                cmd.args(["-t", "start.tre"]);
            }
            run_tool("RAxML", cmd, limits, kill)?;
            let info_path = workdir.join(format!("RAxML_info.{run_name}"));
            let info = fs::read_to_string(&info_path)
                .with_context(|| format!("read {}", info_path.display()))?;
            let score = parse_raxml_score(&info)?;
            let tree = read_tree_file(&workdir.join(format!("RAxML_bestTree.{run_name}")))?;
            info!(score, "RAxML finished");
            Ok(TreeResult { score, tree })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::dataset::Sequence;

    #[test]
    fn fasttree_score_uses_last_report() {
        let log = "Initial topology\nTopHits\nML-NNI round 1: LogLk = -5000.12\n\
                   Gamma(20) LogLk = -4321.5 alpha = 0.9\n";
        assert_eq!(parse_fasttree_score(log).expect("score"), -4321.5);
        assert!(parse_fasttree_score("nothing here").is_err());
    }

    #[test]
    fn raxml_score_accepts_both_report_styles() {
        let gamma = "Overall Time\nFinal GAMMA-based Score of best tree -1234.567890\n";
        assert_eq!(parse_raxml_score(gamma).expect("gamma"), -1234.56789);
        let other = "Final ML Optimization Likelihood: -99.5\n";
        assert_eq!(parse_raxml_score(other).expect("ml"), -99.5);
        assert!(parse_raxml_score("Starting tree\n").is_err());
    }

    #[test]
    fn raxml_model_follows_fasttree_model() {
        assert_eq!(fasttree_to_raxml_model(Datatype::Dna, "-gtr -gamma"), "GTRGAMMA");
        assert_eq!(fasttree_to_raxml_model(Datatype::Dna, "-gtr"), "GTRCAT");
        assert_eq!(fasttree_to_raxml_model(Datatype::Protein, "-wag -gamma"), "PROTGAMMAWAGF");
        assert_eq!(fasttree_to_raxml_model(Datatype::Protein, "-wag"), "PROTCATWAGF");
        assert_eq!(fasttree_to_raxml_model(Datatype::Protein, "-gamma"), "PROTGAMMAJTTF");
        assert_eq!(fasttree_to_raxml_model(Datatype::Protein, ""), "PROTCATJTTF");
    }

    #[test]
    fn team_follows_configuration() {
        let mut cfg = SateConfig::default();
        cfg.sate.aligner = AlignerKind::Muscle;
        cfg.sate.merger = MergerKind::Opal;
        cfg.commandline.raxml_search_after = true;
        let team = Team::from_config(&cfg, Datatype::Dna);
        assert_eq!(team.aligner.name(), "muscle");
        assert_eq!(team.merger.name(), "opal");
        assert_eq!(team.tree_estimator.name(), "fasttree");
        assert_eq!(team.post_estimator.as_ref().map(|t| t.name()), Some("raxml"));
    }

    #[test]
    fn single_sequence_needs_no_aligner_run() {
        let temp = tempfile::tempdir().expect("tempdir");
        let mafft = Mafft::new(
            Path::new("/nonexistent/mafft"),
            SateConfig::default().tools.process_limits(),
        );
        let job = mafft.create_job(
            Alignment::new(vec![Sequence::new("a", "A-C")]),
            JobContext::new(temp.path(), "one", false),
        );
        job.run();
        assert_eq!(job.get_results().expect("aligned").sequences[0].residues, "AC");
    }

    #[test]
    fn missing_executable_fails_the_job() {
        let temp = tempfile::tempdir().expect("tempdir");
        let mafft = Mafft::new(
            Path::new("/nonexistent/mafft"),
            SateConfig::default().tools.process_limits(),
        );
        let job = mafft.create_job(
            Alignment::new(vec![Sequence::new("a", "AC"), Sequence::new("b", "AG")]),
            JobContext::new(temp.path(), "two", false),
        );
        job.run();
        assert!(job.get_results().is_err());
        assert_eq!(fs::read_dir(temp.path()).expect("read").count(), 0);
    }
}
