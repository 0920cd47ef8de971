//! Rooted representation of (possibly unrooted) phylogenies.
//!
//! Nodes live in an arena; index 0 is always the root. Newick text conversion
//! lives in `io::newick`.

use std::collections::{BTreeSet, HashMap};

use anyhow::{Result, anyhow, bail};

#[derive(Debug, Clone, PartialEq)]
pub struct TreeNode {
    pub label: Option<String>,
    pub length: Option<f64>,
    pub parent: Option<usize>,
    pub children: Vec<usize>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Tree {
    nodes: Vec<TreeNode>,
}

impl Default for Tree {
    fn default() -> Self {
        Self::new()
    }
}

impl Tree {
    /// A tree holding only an unlabeled root.
    pub fn new() -> Self {
        Self {
            nodes: vec![TreeNode {
                label: None,
                length: None,
                parent: None,
                children: Vec::new(),
            }],
        }
    }

    pub const ROOT: usize = 0;

    /// Append a child under `parent` and return its index.
    pub fn add_child(
        &mut self,
        parent: usize,
        label: Option<String>,
        length: Option<f64>,
    ) -> usize {
        let idx = self.nodes.len();
        self.nodes.push(TreeNode {
            label,
            length,
            parent: Some(parent),
            children: Vec::new(),
        });
        self.nodes[parent].children.push(idx);
        idx
    }

    pub fn node(&self, idx: usize) -> &TreeNode {
        &self.nodes[idx]
    }

    pub fn node_mut(&mut self, idx: usize) -> &mut TreeNode {
        &mut self.nodes[idx]
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Leaf node indices in depth-first (left to right) order.
    pub fn leaves(&self) -> Vec<usize> {
        let mut out = Vec::new();
        let mut stack = vec![Self::ROOT];
        while let Some(idx) = stack.pop() {
            let node = &self.nodes[idx];
            if node.children.is_empty() {
                out.push(idx);
            } else {
                stack.extend(node.children.iter().rev());
            }
        }
        out
    }

    /// Leaf labels in depth-first order. Unlabeled leaves are an error.
    pub fn leaf_labels(&self) -> Result<Vec<String>> {
        self.leaves()
            .into_iter()
            .map(|idx| {
                self.nodes[idx]
                    .label
                    .clone()
                    .ok_or_else(|| anyhow!("tree has an unlabeled leaf"))
            })
            .collect()
    }

    /// Node indices ordered so every child comes before its parent.
    pub fn postorder(&self) -> Vec<usize> {
        let mut out = Vec::with_capacity(self.nodes.len());
        let mut stack = vec![(Self::ROOT, false)];
        while let Some((idx, expanded)) = stack.pop() {
            if expanded {
                out.push(idx);
                continue;
            }
            stack.push((idx, true));
            for &child in self.nodes[idx].children.iter().rev() {
                stack.push((child, false));
            }
        }
        out
    }

    /// Rename leaves through `rename`. Unknown leaf labels are an error.
    pub fn relabel_leaves(&mut self, rename: impl Fn(&str) -> Result<String>) -> Result<()> {
        for idx in self.leaves() {
            let label = self.nodes[idx]
                .label
                .clone()
                .ok_or_else(|| anyhow!("tree has an unlabeled leaf"))?;
            self.nodes[idx].label = Some(rename(&label)?);
        }
        Ok(())
    }

    /// A caterpillar tree over `labels` (used when a tool must be seeded and
    /// nothing better is available).
    pub fn caterpillar<S: AsRef<str>>(labels: &[S]) -> Tree {
        let mut tree = Tree::new();
        let mut attach = Tree::ROOT;
        for (i, label) in labels.iter().enumerate() {
            let remaining = labels.len() - i;
            if remaining <= 2 || i == 0 {
                tree.add_child(attach, Some(label.as_ref().to_string()), None);
                continue;
            }
            attach = tree.add_child(attach, None, None);
            tree.add_child(attach, Some(label.as_ref().to_string()), None);
        }
        tree
    }
}

/// Check that `tree` and the dataset taxa name exactly the same set of taxa.
pub fn check_tree_matches_taxa(tree: &Tree, taxa: &[String]) -> Result<()> {
    let labels = tree.leaf_labels()?;
    let mut counts: HashMap<&str, usize> = HashMap::new();
    for label in &labels {
        *counts.entry(label.as_str()).or_default() += 1;
    }
    if let Some((dup, _)) = counts.iter().find(|(_, n)| **n > 1) {
        bail!("taxon '{dup}' appears more than once in the tree");
    }
    let in_tree: BTreeSet<&str> = labels.iter().map(String::as_str).collect();
    let in_data: BTreeSet<&str> = taxa.iter().map(String::as_str).collect();
    if let Some(missing) = in_tree.difference(&in_data).next() {
        bail!("tree taxon '{missing}' does not match any sequence name");
    }
    if let Some(missing) = in_data.difference(&in_tree).next() {
        bail!("sequence '{missing}' is not a leaf of the tree");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn caterpillar_contains_every_label_once() {
        let tree = Tree::caterpillar(&["a", "b", "c", "d", "e"]);
        let labels = tree.leaf_labels().expect("labels");
        assert_eq!(labels, vec!["a", "b", "c", "d", "e"]);
        assert_eq!(tree.postorder().last(), Some(&Tree::ROOT));
    }

    #[test]
    fn tree_taxa_mismatch_is_reported() {
        let tree = Tree::caterpillar(&["a", "b", "x"]);
        let taxa = vec!["a".to_string(), "b".to_string(), "c".to_string()];
        let err = check_tree_matches_taxa(&tree, &taxa).unwrap_err();
        assert!(err.to_string().contains("'x'"));
    }

    #[test]
    fn relabel_leaves_uses_mapping() {
        let mut tree = Tree::caterpillar(&["a", "b"]);
        tree.relabel_leaves(|l| Ok(l.to_uppercase())).expect("relabel");
        assert_eq!(tree.leaf_labels().expect("labels"), vec!["A", "B"]);
    }
}
