//! Settings files: several TOML files merged in order, then `section.key=value`
//! overrides, then validation into an immutable [`SateConfig`].

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::core::dataset::{Datatype, SummaryStats};
use crate::core::score::ScoreWeights;
use crate::core::state::{BlindPolicy, RunLimits};
use crate::io::process::ProcessLimits;
use crate::io::products::write_atomic;
use crate::sched::pool::default_num_cpus;

pub const DEFAULT_JOB_NAME: &str = "satejob";

/// Fully resolved run configuration.
///
/// Every recognised option is enumerated here; unknown keys are rejected while
/// parsing and invalid combinations by [`SateConfig::validate`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default, deny_unknown_fields)]
pub struct SateConfig {
    pub commandline: CommandlineConfig,
    pub sate: SateSection,
    pub tools: ToolsConfig,
    pub fasttree: FastTreeConfig,
    pub raxml: RaxmlConfig,
    pub score: ScoreWeights,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct CommandlineConfig {
    /// FASTA file, or a directory of FASTA files when `multilocus` is set.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input: Option<PathBuf>,
    pub multilocus: bool,
    pub datatype: Datatype,
    pub job: String,
    /// Defaults to the directory containing `input`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_directory: Option<PathBuf>,
    /// Parent of the run temp directory. Defaults to `~/.sate`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temporaries: Option<PathBuf>,
    pub keeptemp: bool,
    pub keepalignmenttemps: bool,
    /// Treat the input as aligned.
    pub aligned: bool,
    /// Stop after the initial tree.
    pub two_phase: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub treefile: Option<PathBuf>,
    /// Finish with a RAxML search on the refined alignment.
    pub raxml_search_after: bool,
    /// Replace algorithm settings by data-dependent defaults.
    pub auto: bool,
}

impl Default for CommandlineConfig {
    fn default() -> Self {
        Self {
            input: None,
            multilocus: false,
            datatype: Datatype::Dna,
            job: DEFAULT_JOB_NAME.to_string(),
            output_directory: None,
            temporaries: None,
            keeptemp: false,
            keepalignmenttemps: false,
            aligned: false,
            two_phase: false,
            treefile: None,
            raxml_search_after: false,
            auto: false,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum AlignerKind {
    #[default]
    Mafft,
    Muscle,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum MergerKind {
    #[default]
    Muscle,
    Opal,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum TreeEstimatorKind {
    #[default]
    Fasttree,
    Raxml,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum BreakStrategy {
    #[default]
    Centroid,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct SateSection {
    pub aligner: AlignerKind,
    pub merger: MergerKind,
    pub tree_estimator: TreeEstimatorKind,
    pub break_strategy: BreakStrategy,
    pub max_subproblem_size: usize,
    pub max_subproblem_frac: f64,
    pub num_cpus: usize,
    pub move_to_blind_on_worse_score: bool,
    pub start_tree_search_from_current: bool,
    pub after_blind_iter_without_imp_limit: u32,
    /// Seconds.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub after_blind_time_without_imp_limit: Option<u64>,
    pub blind_restarts: u32,
    /// Seconds.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub time_limit: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub iter_limit: Option<u32>,
    /// Report the last state instead of the best one.
    pub return_final_tree_and_alignment: bool,
}

impl Default for SateSection {
    fn default() -> Self {
        Self {
            aligner: AlignerKind::Mafft,
            merger: MergerKind::Muscle,
            tree_estimator: TreeEstimatorKind::Fasttree,
            break_strategy: BreakStrategy::Centroid,
            max_subproblem_size: 200,
            max_subproblem_frac: 0.2,
            num_cpus: default_num_cpus(),
            move_to_blind_on_worse_score: true,
            start_tree_search_from_current: true,
            after_blind_iter_without_imp_limit: 1,
            after_blind_time_without_imp_limit: None,
            blind_restarts: 0,
            time_limit: None,
            iter_limit: None,
            return_final_tree_and_alignment: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct ToolsConfig {
    pub mafft: PathBuf,
    pub muscle: PathBuf,
    pub opal: PathBuf,
    pub fasttree: PathBuf,
    pub raxml: PathBuf,
    /// Wall-clock limit for one tool invocation.
    pub timeout_secs: u64,
    /// Truncate tool stdout/stderr beyond this many bytes.
    pub output_limit_bytes: usize,
    /// How long a cancelled run may spend stopping tools before exiting anyway.
    pub kill_grace_secs: u64,
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            mafft: PathBuf::from("mafft"),
            muscle: PathBuf::from("muscle"),
            opal: PathBuf::from("opal"),
            fasttree: PathBuf::from("FastTree"),
            raxml: PathBuf::from("raxmlHPC"),
            timeout_secs: 24 * 60 * 60,
            output_limit_bytes: 256 * 1024 * 1024,
            kill_grace_secs: 5,
        }
    }
}

impl ToolsConfig {
    pub fn process_limits(&self) -> ProcessLimits {
        ProcessLimits {
            timeout: Duration::from_secs(self.timeout_secs),
            output_limit_bytes: self.output_limit_bytes,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct FastTreeConfig {
    pub model: String,
}

impl Default for FastTreeConfig {
    fn default() -> Self {
        Self {
            model: "-gtr -gamma".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(default, deny_unknown_fields)]
pub struct RaxmlConfig {
    /// Empty means derived from the FastTree model.
    pub model: String,
}

impl SateConfig {
    pub fn validate(&self) -> Result<()> {
        let sate = &self.sate;
        if sate.num_cpus == 0 {
            bail!("sate.num_cpus must be >= 1");
        }
        if sate.max_subproblem_size == 0 {
            bail!("sate.max_subproblem_size must be >= 1");
        }
        if !(sate.max_subproblem_frac > 0.0 && sate.max_subproblem_frac <= 1.0) {
            bail!("sate.max_subproblem_frac must be in (0, 1]");
        }
        if sate.time_limit == Some(0) {
            bail!("sate.time_limit must be > 0 when set");
        }
        if sate.after_blind_time_without_imp_limit == Some(0) {
            bail!("sate.after_blind_time_without_imp_limit must be > 0 when set");
        }
        if self.tools.timeout_secs == 0 {
            bail!("tools.timeout_secs must be > 0");
        }
        if self.tools.output_limit_bytes == 0 {
            bail!("tools.output_limit_bytes must be > 0");
        }
        if self.commandline.raxml_search_after
            && sate.tree_estimator != TreeEstimatorKind::Fasttree
        {
            bail!("commandline.raxml_search_after requires sate.tree_estimator = \"fasttree\"");
        }
        if self.commandline.job.is_empty() {
            bail!("commandline.job must not be empty");
        }
        Ok(())
    }

    pub fn blind_policy(&self) -> BlindPolicy {
        BlindPolicy {
            move_to_blind_on_worse_score: self.sate.move_to_blind_on_worse_score,
            iter_limit: self.sate.after_blind_iter_without_imp_limit,
            time_limit: self.sate.after_blind_time_without_imp_limit.map(Duration::from_secs),
            restarts: self.sate.blind_restarts,
        }
    }

    pub fn run_limits(&self) -> RunLimits {
        RunLimits {
            time_limit: self.sate.time_limit.map(Duration::from_secs),
            iter_limit: self.sate.iter_limit,
        }
    }

    pub fn input(&self) -> Result<&Path> {
        self.commandline
            .input
            .as_deref()
            .ok_or_else(|| anyhow!("commandline.input is required"))
    }

    /// Output directory, falling back to the directory of the input.
    pub fn output_directory(&self) -> Result<PathBuf> {
        if let Some(dir) = &self.commandline.output_directory {
            return Ok(dir.clone());
        }
        let parent = self.input()?.parent().unwrap_or_else(|| Path::new("."));
        Ok(if parent.as_os_str().is_empty() {
            PathBuf::from(".")
        } else {
            parent.to_path_buf()
        })
    }

    pub fn temporaries_directory(&self) -> PathBuf {
        if let Some(dir) = &self.commandline.temporaries {
            return dir.clone();
        }
        match std::env::var_os("HOME") {
            Some(home) => PathBuf::from(home).join(".sate"),
            None => std::env::temp_dir().join("sate"),
        }
    }

    /// Data-dependent algorithm defaults (`--auto`). Overwrites what the
    /// settings files chose for the same options.
    pub fn apply_auto_defaults(&mut self, stats: &SummaryStats) {
        let ntax = stats.total_taxa;
        let sate = &mut self.sate;
        sate.tree_estimator = TreeEstimatorKind::Fasttree;
        sate.aligner = AlignerKind::Mafft;
        sate.merger = MergerKind::Muscle;
        sate.break_strategy = BreakStrategy::Centroid;
        sate.move_to_blind_on_worse_score = true;
        sate.start_tree_search_from_current = true;
        sate.after_blind_iter_without_imp_limit = 1;
        sate.time_limit = None;
        sate.after_blind_time_without_imp_limit = None;
        if ntax > 400 {
            sate.max_subproblem_size = 200;
            sate.max_subproblem_frac = 200.0 / ntax as f64;
        } else {
            sate.max_subproblem_size = ntax.div_ceil(2).max(1);
            sate.max_subproblem_frac = 0.5;
        }
        sate.num_cpus = default_num_cpus();
        self.fasttree.model = if stats.datatype.is_protein() {
            "-wag -gamma".to_string()
        } else {
            "-gtr -gamma".to_string()
        };
        self.commandline.datatype = stats.datatype;
        self.commandline.multilocus = stats.per_locus.len() > 1;
        info!(ntax, loci = stats.per_locus.len(), "applied automatic defaults");
    }
}

/// Keep only `[-_a-zA-Z0-9.]`; an empty result becomes [`DEFAULT_JOB_NAME`].
pub fn coerce_job_name(job: &str) -> String {
    let cleaned: String = job
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
        .collect();
    if cleaned.is_empty() {
        DEFAULT_JOB_NAME.to_string()
    } else {
        cleaned
    }
}

/// Merge settings files in order (later wins, table by table), apply
/// `section.key=value` overrides, then parse and validate.
pub fn load_config(paths: &[PathBuf], overrides: &[String]) -> Result<SateConfig> {
    let mut merged = toml::Table::new();
    for path in paths {
        let contents =
            fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
        let table: toml::Table =
            toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
        merge_tables(&mut merged, table);
    }
    for item in overrides {
        apply_override(&mut merged, item)?;
    }
    let mut cfg: SateConfig = toml::Value::Table(merged)
        .try_into()
        .context("invalid settings")?;

    let job = coerce_job_name(&cfg.commandline.job);
    if job != cfg.commandline.job {
        warn!(
            requested = %cfg.commandline.job,
            used = %job,
            "job name contained unsupported characters"
        );
        cfg.commandline.job = job;
    }
    cfg.validate()?;
    Ok(cfg)
}

fn merge_tables(into: &mut toml::Table, from: toml::Table) {
    for (key, value) in from {
        match (into.get_mut(&key), value) {
            (Some(toml::Value::Table(existing)), toml::Value::Table(incoming)) => {
                merge_tables(existing, incoming);
            }
            (_, value) => {
                into.insert(key, value);
            }
        }
    }
}

fn apply_override(table: &mut toml::Table, item: &str) -> Result<()> {
    let (key, raw) = item
        .split_once('=')
        .ok_or_else(|| anyhow!("override '{item}' must look like section.key=value"))?;
    let (section, field) = key
        .trim()
        .split_once('.')
        .ok_or_else(|| anyhow!("override key '{key}' must look like section.key"))?;
    let value = parse_override_value(raw.trim());
    let entry = table
        .entry(section.to_string())
        .or_insert_with(|| toml::Value::Table(toml::Table::new()));
    let toml::Value::Table(section_table) = entry else {
        bail!("settings entry '{section}' is not a table");
    };
    section_table.insert(field.to_string(), value);
    Ok(())
}

/// TOML literal if it parses as one, otherwise a bare string.
fn parse_override_value(raw: &str) -> toml::Value {
    toml::from_str::<toml::Table>(&format!("v = {raw}"))
        .ok()
        .and_then(|mut t| t.remove("v"))
        .unwrap_or_else(|| toml::Value::String(raw.to_string()))
}

/// Atomically write the resolved config (temp file + rename).
pub fn write_config(path: &Path, cfg: &SateConfig) -> Result<()> {
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    write_atomic(path, buf.as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write(dir: &Path, name: &str, contents: &str) -> PathBuf {
        let path = dir.join(name);
        fs::write(&path, contents).expect("write settings");
        path
    }

    #[test]
    fn defaults_are_valid() {
        SateConfig::default().validate().expect("valid");
    }

    #[test]
    fn later_files_and_overrides_win() {
        let temp = tempfile::tempdir().expect("tempdir");
        let a = write(
            temp.path(),
            "a.toml",
            "[sate]\nmax_subproblem_size = 50\niter_limit = 3\n[commandline]\njob = \"first\"\n",
        );
        let b = write(temp.path(), "b.toml", "[sate]\niter_limit = 7\n");
        let cfg = load_config(
            &[a, b],
            &["commandline.job=second".to_string(), "sate.time_limit=60".to_string()],
        )
        .expect("load");
        assert_eq!(cfg.sate.max_subproblem_size, 50);
        assert_eq!(cfg.sate.iter_limit, Some(7));
        assert_eq!(cfg.sate.time_limit, Some(60));
        assert_eq!(cfg.commandline.job, "second");
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let temp = tempfile::tempdir().expect("tempdir");
        let a = write(temp.path(), "a.toml", "[sate]\nmax_subproblem_sise = 50\n");
        assert!(load_config(&[a], &[]).is_err());
        assert!(load_config(&[], &["bogus.key=1".to_string()]).is_err());
    }

    #[test]
    fn raxml_after_requires_fasttree() {
        let err = load_config(
            &[],
            &[
                "commandline.raxml_search_after=true".to_string(),
                "sate.tree_estimator=raxml".to_string(),
            ],
        )
        .unwrap_err();
        assert!(err.to_string().contains("raxml_search_after"));
    }

    #[test]
    fn invalid_numbers_are_rejected() {
        for item in [
            "sate.num_cpus=0",
            "sate.max_subproblem_size=0",
            "sate.max_subproblem_frac=1.5",
            "sate.time_limit=0",
            "tools.timeout_secs=0",
        ] {
            assert!(load_config(&[], &[item.to_string()]).is_err(), "{item}");
        }
    }

    #[test]
    fn job_name_is_coerced() {
        assert_eq!(coerce_job_name("my job/1"), "myjob1");
        assert_eq!(coerce_job_name("***"), DEFAULT_JOB_NAME);
        let cfg = load_config(&[], &["commandline.job=a b".to_string()]).expect("load");
        assert_eq!(cfg.commandline.job, "ab");
    }

    #[test]
    fn auto_defaults_follow_dataset_size() {
        let mut cfg = SateConfig::default();
        cfg.sate.aligner = AlignerKind::Muscle;
        let small = SummaryStats {
            datatype: Datatype::Protein,
            per_locus: vec![(11, 100), (9, 80)],
            total_taxa: 11,
        };
        cfg.apply_auto_defaults(&small);
        assert_eq!(cfg.sate.aligner, AlignerKind::Mafft);
        assert_eq!(cfg.sate.max_subproblem_size, 6);
        assert_eq!(cfg.sate.max_subproblem_frac, 0.5);
        assert_eq!(cfg.fasttree.model, "-wag -gamma");
        assert!(cfg.commandline.multilocus);

        let large = SummaryStats {
            datatype: Datatype::Dna,
            per_locus: vec![(800, 1000)],
            total_taxa: 800,
        };
        cfg.apply_auto_defaults(&large);
        assert_eq!(cfg.sate.max_subproblem_size, 200);
        assert_eq!(cfg.sate.max_subproblem_frac, 0.25);
        assert!(!cfg.commandline.multilocus);
        cfg.validate().expect("valid");
    }

    #[test]
    fn written_config_loads_back() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("out").join("config.toml");
        let mut cfg = SateConfig::default();
        cfg.commandline.input = Some(PathBuf::from("/data/in.fasta"));
        cfg.sate.time_limit = Some(120);
        cfg.score.w_ml = Some(1.0);
        write_config(&path, &cfg).expect("write");
        let loaded = load_config(&[path], &[]).expect("load");
        assert_eq!(loaded, cfg);
    }

    #[test]
    fn output_directory_defaults_to_input_parent() {
        let mut cfg = SateConfig::default();
        cfg.commandline.input = Some(PathBuf::from("/data/run/in.fasta"));
        assert_eq!(cfg.output_directory().expect("dir"), PathBuf::from("/data/run"));
        cfg.commandline.output_directory = Some(PathBuf::from("/out"));
        assert_eq!(cfg.output_directory().expect("dir"), PathBuf::from("/out"));
    }
}
