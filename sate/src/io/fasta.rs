//! FASTA and relaxed PHYLIP adapters.

use std::collections::BTreeSet;
use std::fmt::Write as _;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow, bail};
use tracing::{debug, instrument};

use crate::core::dataset::{Alignment, Locus, MultiLocusDataset, Sequence};
use crate::io::products::write_atomic;

/// Parse FASTA text. Whitespace inside records is dropped; duplicate names and
/// empty input are errors.
pub fn parse_fasta(text: &str, source: &str) -> Result<Alignment> {
    let mut sequences: Vec<Sequence> = Vec::new();
    let mut seen = BTreeSet::new();
    for (lineno, line) in text.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if let Some(header) = line.strip_prefix('>') {
            let name = header.trim();
            if name.is_empty() {
                bail!("{source}:{}: empty sequence name", lineno + 1);
            }
            if !seen.insert(name.to_string()) {
                bail!("{source}:{}: duplicate sequence name '{name}'", lineno + 1);
            }
            sequences.push(Sequence::new(name, String::new()));
            continue;
        }
        let current = sequences.last_mut().ok_or_else(|| {
            anyhow!(
                "{source}:{}: sequence data before first '>' header",
                lineno + 1
            )
        })?;
        current
            .residues
            .extend(line.chars().filter(|c| !c.is_whitespace()));
    }
    if sequences.is_empty() {
        bail!("{source}: no sequences found");
    }
    Ok(Alignment::new(sequences))
}

pub fn compose_fasta(alignment: &Alignment) -> String {
    let mut out = String::new();
    for seq in &alignment.sequences {
        let _ = writeln!(out, ">{}", seq.name);
        let _ = writeln!(out, "{}", seq.residues);
    }
    out
}

pub fn read_fasta(path: &Path) -> Result<Alignment> {
    let text = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    parse_fasta(&text, &path.display().to_string())
}

pub fn write_fasta(path: &Path, alignment: &Alignment) -> Result<()> {
    write_atomic(path, compose_fasta(alignment).as_bytes())
}

/// Read the run input: one FASTA file, or (multilocus) every regular file of a
/// directory in name order, one locus each.
#[instrument(skip_all, fields(input = %input.display(), multilocus))]
pub fn read_input(input: &Path, multilocus: bool) -> Result<MultiLocusDataset> {
    let files = if multilocus {
        locus_files(input)?
    } else {
        if !input.is_file() {
            bail!("input {} is not a file", input.display());
        }
        vec![input.to_path_buf()]
    };
    let mut loci = Vec::with_capacity(files.len());
    for path in files {
        let name = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "locus".to_string());
        let alignment = read_fasta(&path)?;
        debug!(locus = %name, sequences = alignment.len(), "read locus");
        loci.push(Locus { name, alignment });
    }
    Ok(MultiLocusDataset::new(loci))
}

fn locus_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let entries = fs::read_dir(dir).with_context(|| format!("read directory {}", dir.display()))?;
    let mut files = Vec::new();
    for entry in entries {
        let entry = entry.with_context(|| format!("read entry in {}", dir.display()))?;
        let path = entry.path();
        if path.is_file() {
            files.push(path);
        }
    }
    files.sort();
    if files.is_empty() {
        bail!("input directory {} contains no files", dir.display());
    }
    Ok(files)
}

/// Relaxed PHYLIP (names of any length, separated by one space).
pub fn compose_relaxed_phylip(alignment: &Alignment) -> Result<String> {
    let width = alignment
        .width()
        .ok_or_else(|| anyhow!("PHYLIP output requires an aligned matrix"))?;
    let mut out = format!("{} {}\n", alignment.len(), width);
    for seq in &alignment.sequences {
        let _ = writeln!(out, "{} {}", seq.name, seq.residues);
    }
    Ok(out)
}
