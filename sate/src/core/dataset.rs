//! In-memory sequence data: per-locus alignments and multi-locus datasets.
//!
//! Everything here is pure. Reading and writing files lives in `io::fasta`.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use anyhow::{Result, anyhow, bail};
use serde::{Deserialize, Serialize};

/// Gap character used when padding or concatenating alignments.
pub const GAP: char = '-';

/// Residue alphabet of the input data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Datatype {
    #[default]
    Dna,
    Rna,
    Protein,
}

impl Datatype {
    pub fn is_protein(self) -> bool {
        self == Datatype::Protein
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sequence {
    pub name: String,
    pub residues: String,
}

impl Sequence {
    pub fn new(name: impl Into<String>, residues: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            residues: residues.into(),
        }
    }

    fn degapped(&self) -> Sequence {
        Sequence {
            name: self.name.clone(),
            residues: self.residues.chars().filter(|c| !is_gap(*c)).collect(),
        }
    }
}

fn is_gap(c: char) -> bool {
    c == '-' || c == '?'
}

/// Sequences of one locus, aligned or not. Row order is preserved.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Alignment {
    pub sequences: Vec<Sequence>,
}

impl Alignment {
    pub fn new(sequences: Vec<Sequence>) -> Self {
        Self { sequences }
    }

    pub fn len(&self) -> usize {
        self.sequences.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sequences.is_empty()
    }

    pub fn names(&self) -> Vec<&str> {
        self.sequences.iter().map(|s| s.name.as_str()).collect()
    }

    pub fn get(&self, name: &str) -> Option<&Sequence> {
        self.sequences.iter().find(|s| s.name == name)
    }

    /// Number of columns; `None` unless every row has the same length.
    pub fn width(&self) -> Option<usize> {
        let mut lengths = self.sequences.iter().map(|s| s.residues.chars().count());
        let first = lengths.next()?;
        lengths.all(|len| len == first).then_some(first)
    }

    /// True when all rows share one length. An empty alignment is not aligned.
    pub fn is_aligned(&self) -> bool {
        self.width().is_some()
    }

    /// Rows named in `names`, in this alignment's order. Names not present are skipped.
    pub fn sub_alignment(&self, names: &BTreeSet<String>) -> Alignment {
        Alignment {
            sequences: self
                .sequences
                .iter()
                .filter(|s| names.contains(&s.name))
                .cloned()
                .collect(),
        }
    }

    /// The same rows with every gap removed.
    pub fn degapped(&self) -> Alignment {
        Alignment {
            sequences: self.sequences.iter().map(Sequence::degapped).collect(),
        }
    }

    /// Drop columns that hold only gaps. Rows of unequal length are left untouched.
    pub fn without_gap_columns(&self) -> Alignment {
        let Some(width) = self.width() else {
            return self.clone();
        };
        let rows: Vec<Vec<char>> = self
            .sequences
            .iter()
            .map(|s| s.residues.chars().collect())
            .collect();
        let keep: Vec<bool> = (0..width)
            .map(|col| rows.iter().any(|row| !is_gap(row[col])))
            .collect();
        let sequences = self
            .sequences
            .iter()
            .zip(rows)
            .map(|(seq, row)| Sequence {
                name: seq.name.clone(),
                residues: row
                    .into_iter()
                    .zip(&keep)
                    .filter_map(|(c, k)| k.then_some(c))
                    .collect(),
            })
            .collect();
        Alignment { sequences }
    }

    fn map_residues(&mut self, f: impl Fn(char) -> char) {
        for seq in &mut self.sequences {
            seq.residues = seq.residues.chars().map(&f).collect();
        }
    }
}

/// One independent sequence dataset of a multi-locus run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Locus {
    /// Source label, usually the input file stem.
    pub name: String,
    pub alignment: Alignment,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct MultiLocusDataset {
    pub loci: Vec<Locus>,
}

impl MultiLocusDataset {
    pub fn new(loci: Vec<Locus>) -> Self {
        Self { loci }
    }

    pub fn len(&self) -> usize {
        self.loci.len()
    }

    pub fn is_empty(&self) -> bool {
        self.loci.is_empty()
    }

    pub fn is_aligned(&self) -> bool {
        self.loci.iter().all(|l| l.alignment.is_aligned())
    }

    /// Union of taxon names across loci, in order of first appearance.
    pub fn taxa(&self) -> Vec<String> {
        let mut seen = BTreeSet::new();
        let mut taxa = Vec::new();
        for locus in &self.loci {
            for seq in &locus.alignment.sequences {
                if seen.insert(seq.name.clone()) {
                    taxa.push(seq.name.clone());
                }
            }
        }
        taxa
    }

    /// Concatenate all loci into a single supermatrix. Taxa missing from a
    /// locus are padded with gaps over that locus' width.
    pub fn concatenate(&self) -> Result<Alignment> {
        let taxa = self.taxa();
        let mut rows: Vec<String> = vec![String::new(); taxa.len()];
        for locus in &self.loci {
            let width = locus
                .alignment
                .width()
                .ok_or_else(|| anyhow!("locus '{}' is not aligned", locus.name))?;
            let by_name: HashMap<&str, &Sequence> = locus
                .alignment
                .sequences
                .iter()
                .map(|s| (s.name.as_str(), s))
                .collect();
            for (row, taxon) in rows.iter_mut().zip(&taxa) {
                match by_name.get(taxon.as_str()) {
                    Some(seq) => row.push_str(&seq.residues),
                    None => row.extend(std::iter::repeat_n(GAP, width)),
                }
            }
        }
        Ok(Alignment {
            sequences: taxa
                .into_iter()
                .zip(rows)
                .map(|(name, residues)| Sequence { name, residues })
                .collect(),
        })
    }

    /// Convert RNA to DNA in place (U -> T).
    pub fn convert_rna_to_dna(&mut self) {
        for locus in &mut self.loci {
            locus.alignment.map_residues(|c| match c {
                'U' => 'T',
                'u' => 't',
                other => other,
            });
        }
    }

    /// Convert DNA back to RNA in place (T -> U).
    pub fn convert_dna_to_rna(&mut self) {
        for locus in &mut self.loci {
            locus.alignment.map_residues(|c| match c {
                'T' => 'U',
                't' => 'u',
                other => other,
            });
        }
    }

    /// Replace every taxon name with a tool-safe one and return the mapping.
    pub fn relabel_for_tools(&mut self) -> NameMap {
        let map = NameMap::for_taxa(&self.taxa());
        for locus in &mut self.loci {
            for seq in &mut locus.alignment.sequences {
                if let Some(safe) = map.real_to_safe.get(&seq.name) {
                    seq.name = safe.clone();
                }
            }
        }
        map
    }

    /// Undo [`relabel_for_tools`](Self::relabel_for_tools).
    pub fn restore_names(&mut self, map: &NameMap) -> Result<()> {
        for locus in &mut self.loci {
            for seq in &mut locus.alignment.sequences {
                seq.name = map.real(&seq.name)?.to_string();
            }
        }
        Ok(())
    }
}

/// Bidirectional mapping between original taxon names and tool-safe names.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct NameMap {
    safe_to_real: BTreeMap<String, String>,
    real_to_safe: BTreeMap<String, String>,
}

impl NameMap {
    fn for_taxa(taxa: &[String]) -> Self {
        let mut map = NameMap::default();
        for (idx, real) in taxa.iter().enumerate() {
            let safe = format!("sate{idx:05}");
            map.safe_to_real.insert(safe.clone(), real.clone());
            map.real_to_safe.insert(real.clone(), safe);
        }
        map
    }

    pub fn safe(&self, real: &str) -> Result<&str> {
        self.real_to_safe
            .get(real)
            .map(String::as_str)
            .ok_or_else(|| anyhow!("unknown taxon name '{real}'"))
    }

    pub fn real(&self, safe: &str) -> Result<&str> {
        self.safe_to_real
            .get(safe)
            .map(String::as_str)
            .ok_or_else(|| anyhow!("unknown safe taxon name '{safe}'"))
    }

    /// `(safe, real)` pairs sorted by safe name.
    pub fn pairs(&self) -> impl Iterator<Item = (&str, &str)> {
        self.safe_to_real
            .iter()
            .map(|(safe, real)| (safe.as_str(), real.as_str()))
    }
}

/// Dataset size figures used to pick data-dependent defaults.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SummaryStats {
    pub datatype: Datatype,
    /// `(taxa, max row length)` per locus.
    pub per_locus: Vec<(usize, usize)>,
    pub total_taxa: usize,
}

impl SummaryStats {
    pub fn from_dataset(dataset: &MultiLocusDataset, datatype: Datatype) -> Self {
        let per_locus = dataset
            .loci
            .iter()
            .map(|l| {
                let nchar = l
                    .alignment
                    .sequences
                    .iter()
                    .map(|s| s.residues.chars().count())
                    .max()
                    .unwrap_or(0);
                (l.alignment.len(), nchar)
            })
            .collect();
        Self {
            datatype,
            per_locus,
            total_taxa: dataset.taxa().len(),
        }
    }
}

/// Fail unless every locus has at least one sequence and no locus repeats a name.
pub fn check_dataset(dataset: &MultiLocusDataset) -> Result<()> {
    if dataset.is_empty() {
        bail!("no sequence data was read");
    }
    for locus in &dataset.loci {
        if locus.alignment.is_empty() {
            bail!("locus '{}' contains no sequences", locus.name);
        }
        let mut seen = BTreeSet::new();
        for seq in &locus.alignment.sequences {
            if !seen.insert(seq.name.as_str()) {
                bail!("duplicate sequence name '{}' in locus '{}'", seq.name, locus.name);
            }
        }
    }
    Ok(())
}
