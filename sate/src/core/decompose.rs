//! Centroid-edge decomposition of a tree into bounded leaf subsets.
//!
//! The tree is treated as unrooted. Each split cuts the edge that minimizes the
//! larger side's leaf count, restricted to the leaves still being divided, and
//! recursion stops once a part is no larger than the bound.

use std::collections::BTreeSet;

use anyhow::{Result, bail};

use crate::core::phylo::Tree;

/// Binary decomposition tree. Leaves are the subproblems.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decomposition {
    Part(BTreeSet<String>),
    Split(Box<Decomposition>, Box<Decomposition>),
}

/// Flattened decomposition used to schedule realignment and merges.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergePlan {
    /// Leaf subsets, indexed by part number.
    pub parts: Vec<BTreeSet<String>>,
    /// Merge steps in bottom-up order.
    pub merges: Vec<MergeStep>,
    /// Slot holding the fully merged result.
    pub root: Slot,
}

/// Input or output slot of a merge step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Slot {
    Part(usize),
    Merge(usize),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MergeStep {
    pub left: Slot,
    pub right: Slot,
    /// Longest path (in merges) down to a part. Steps of equal height are independent.
    pub height: usize,
}

impl Decomposition {
    pub fn plan(&self) -> MergePlan {
        let mut plan = MergePlan {
            parts: Vec::new(),
            merges: Vec::new(),
            root: Slot::Part(0),
        };
        let (root, _) = flatten(self, &mut plan);
        plan.root = root;
        plan
    }
}

fn flatten(node: &Decomposition, plan: &mut MergePlan) -> (Slot, usize) {
    match node {
        Decomposition::Part(p) => {
            plan.parts.push(p.clone());
            (Slot::Part(plan.parts.len() - 1), 0)
        }
        Decomposition::Split(l, r) => {
            let (left, lh) = flatten(l, plan);
            let (right, rh) = flatten(r, plan);
            let height = lh.max(rh) + 1;
            plan.merges.push(MergeStep {
                left,
                right,
                height,
            });
            (Slot::Merge(plan.merges.len() - 1), height)
        }
    }
}

/// Effective subproblem bound: the smaller of the absolute size and the
/// fraction of the taxon count (rounded up), never below 1.
pub fn subproblem_bound(total_taxa: usize, max_size: usize, max_frac: f64) -> usize {
    let by_frac = (max_frac * total_taxa as f64).ceil() as usize;
    max_size.min(by_frac).max(1)
}

/// Decompose `tree` by repeated centroid-edge cuts until every part has at
/// most `max_size` leaves.
pub fn centroid_decomposition(tree: &Tree, max_size: usize) -> Result<Decomposition> {
    if max_size == 0 {
        bail!("subproblem size bound must be at least 1");
    }
    let leaves: BTreeSet<usize> = tree.leaves().into_iter().collect();
    if leaves.is_empty() {
        bail!("cannot decompose an empty tree");
    }
    // Labels are required so parts can be expressed in taxon names.
    tree.leaf_labels()?;
    Ok(decompose(tree, &tree.postorder(), &leaves, max_size))
}

fn decompose(
    tree: &Tree,
    postorder: &[usize],
    subset: &BTreeSet<usize>,
    max_size: usize,
) -> Decomposition {
    if subset.len() <= max_size || subset.len() < 2 {
        return Decomposition::Part(labels_of(tree, subset));
    }
    let cut = centroid_edge(tree, postorder, subset);
    let below = leaves_below(tree, cut, subset);
    let rest: BTreeSet<usize> = subset.difference(&below).copied().collect();
    Decomposition::Split(
        Box::new(decompose(tree, postorder, &below, max_size)),
        Box::new(decompose(tree, postorder, &rest, max_size)),
    )
}

/// Node whose parent edge best balances `subset`. Ties go to the lowest index.
fn centroid_edge(tree: &Tree, postorder: &[usize], subset: &BTreeSet<usize>) -> usize {
    let total = subset.len();
    let mut counts = vec![0usize; tree.len()];
    for &idx in postorder {
        let node = tree.node(idx);
        counts[idx] = if node.children.is_empty() {
            usize::from(subset.contains(&idx))
        } else {
            node.children.iter().map(|c| counts[*c]).sum()
        };
    }
    let mut best: Option<(usize, usize)> = None;
    for idx in 0..tree.len() {
        if idx == Tree::ROOT {
            continue;
        }
        let below = counts[idx];
        if below == 0 || below == total {
            continue;
        }
        let larger = below.max(total - below);
        if best.is_none_or(|(_, b)| larger < b) {
            best = Some((idx, larger));
        }
    }
    // A subset of two or more leaves always has a separating edge: any member leaf's own edge.
    best.map(|(idx, _)| idx).unwrap_or(Tree::ROOT)
}

fn leaves_below(tree: &Tree, node: usize, subset: &BTreeSet<usize>) -> BTreeSet<usize> {
    let mut out = BTreeSet::new();
    let mut stack = vec![node];
    while let Some(idx) = stack.pop() {
        let n = tree.node(idx);
        if n.children.is_empty() {
            if subset.contains(&idx) {
                out.insert(idx);
            }
        } else {
            stack.extend(&n.children);
        }
    }
    out
}

fn labels_of(tree: &Tree, subset: &BTreeSet<usize>) -> BTreeSet<String> {
    subset
        .iter()
        .filter_map(|idx| tree.node(*idx).label.clone())
        .collect()
}
