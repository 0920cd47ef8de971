//! Files a run leaves in its output directory.

use std::ffi::OsString;
use std::fmt::Write as _;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::info;

use crate::core::dataset::{MultiLocusDataset, NameMap};
use crate::core::phylo::Tree;
use crate::core::score::Score;
use crate::io::config::{SateConfig, write_config};
use crate::io::fasta::write_fasta;
use crate::io::newick::write_tree;

/// Output paths for one job, all inside `dir` and prefixed by the job name.
#[derive(Debug, Clone)]
pub struct RunProducts {
    dir: PathBuf,
    job: String,
}

impl RunProducts {
    pub fn new(dir: &Path, job: &str) -> Result<Self> {
        fs::create_dir_all(dir)
            .with_context(|| format!("create output directory {}", dir.display()))?;
        Ok(Self {
            dir: dir.to_path_buf(),
            job: job.to_string(),
        })
    }

    /// `<job>.marker<NNN>.aln`, numbered from 1 in locus order.
    pub fn alignment_path(&self, locus_index: usize) -> PathBuf {
        self.dir
            .join(format!("{}.marker{:03}.aln", self.job, locus_index + 1))
    }

    pub fn tree_path(&self) -> PathBuf {
        self.dir.join(format!("{}.tre", self.job))
    }

    pub fn score_path(&self) -> PathBuf {
        self.dir.join(format!("{}.score.txt", self.job))
    }

    pub fn config_path(&self) -> PathBuf {
        self.dir.join(format!("{}_config.txt", self.job))
    }

    /// Every status line of the run.
    pub fn run_log_path(&self) -> PathBuf {
        self.dir.join(format!("{}_log.txt", self.job))
    }

    /// Warnings and errors of the run.
    pub fn err_log_path(&self) -> PathBuf {
        self.dir.join(format!("{}_err.txt", self.job))
    }

    pub fn name_translation_path(&self) -> PathBuf {
        self.dir.join(format!("{}_name_translation.txt", self.job))
    }

    /// Safe name, original name, blank line; sorted by safe name.
    pub fn write_name_translation(&self, names: &NameMap) -> Result<()> {
        let mut text = String::new();
        for (safe, real) in names.pairs() {
            let _ = write!(text, "{safe}\n{real}\n\n");
        }
        let path = self.name_translation_path();
        write_atomic(&path, text.as_bytes())?;
        info!(
            path = %path.display(),
            "name translation saved (safe name, original name, blank line)"
        );
        Ok(())
    }

    pub fn write_config(&self, cfg: &SateConfig) -> Result<()> {
        write_config(&self.config_path(), cfg)
    }

    /// Per-locus alignments, the tree and the score. Names must already be
    /// the original ones.
    pub fn write_results(
        &self,
        dataset: &MultiLocusDataset,
        tree: &Tree,
        score: Option<Score>,
    ) -> Result<()> {
        for (idx, locus) in dataset.loci.iter().enumerate() {
            let path = self.alignment_path(idx);
            write_fasta(&path, &locus.alignment)?;
            info!(locus = %locus.name, path = %path.display(), "wrote resulting alignment");
        }
        let tree_path = self.tree_path();
        write_tree(&tree_path, tree)?;
        info!(path = %tree_path.display(), "wrote resulting tree");

        let score_text = match score {
            Some(score) => format!("{score}\n"),
            None => "None\n".to_string(),
        };
        let score_path = self.score_path();
        write_atomic(&score_path, score_text.as_bytes())?;
        info!(path = %score_path.display(), "wrote resulting score");
        Ok(())
    }
}

/// Write `contents` to a sibling temp file, then rename it over `path`.
pub fn write_atomic(path: &Path, contents: &[u8]) -> Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("output path missing parent {}", path.display()))?;
    if !parent.as_os_str().is_empty() {
        fs::create_dir_all(parent)
            .with_context(|| format!("create directory {}", parent.display()))?;
    }
    let mut tmp_name = path
        .file_name()
        .map(OsString::from)
        .with_context(|| format!("output path missing file name {}", path.display()))?;
    tmp_name.push(".tmp");
    let tmp_path = path.with_file_name(tmp_name);
    fs::write(&tmp_path, contents)
        .with_context(|| format!("write temp file {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::dataset::{Alignment, Locus, Sequence};

    fn dataset() -> MultiLocusDataset {
        MultiLocusDataset::new(vec![
            Locus {
                name: "g1".to_string(),
                alignment: Alignment::new(vec![Sequence::new("a", "AC"), Sequence::new("b", "AG")]),
            },
            Locus {
                name: "g2".to_string(),
                alignment: Alignment::new(vec![Sequence::new("a", "TT"), Sequence::new("b", "T-")]),
            },
        ])
    }

    #[test]
    fn results_are_written_with_job_prefix() {
        let temp = tempfile::tempdir().expect("tempdir");
        let products = RunProducts::new(&temp.path().join("out"), "run1").expect("products");
        let tree = Tree::caterpillar(&["a", "b"]);
        products
            .write_results(&dataset(), &tree, Some(Score(-12.5)))
            .expect("write");

        let out = temp.path().join("out");
        assert_eq!(
            fs::read_to_string(out.join("run1.marker001.aln")).expect("aln1"),
            ">a\nAC\n>b\nAG\n"
        );
        assert!(out.join("run1.marker002.aln").is_file());
        assert_eq!(fs::read_to_string(out.join("run1.tre")).expect("tre"), "(a,b);\n");
        assert_eq!(fs::read_to_string(out.join("run1.score.txt")).expect("score"), "-12.5\n");
        assert!(!out.join("run1.tre.tmp").exists());
    }

    #[test]
    fn name_translation_lists_pairs() {
        let temp = tempfile::tempdir().expect("tempdir");
        let products = RunProducts::new(temp.path(), "job").expect("products");
        let mut data = dataset();
        let names = data.relabel_for_tools();
        products.write_name_translation(&names).expect("write");
        let text = fs::read_to_string(products.name_translation_path()).expect("read");
        assert_eq!(text, "sate00000\na\n\nsate00001\nb\n\n");
    }
}
