//! Newick reader and writer.
//!
//! Supported: labels on any node, optional `:length`, single-quoted labels with
//! `''` escapes, `[...]` comments, several `;`-terminated trees per file.
//! Underscores in unquoted labels are kept as-is.

use std::fmt::Write as _;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result, anyhow, bail};
use tracing::warn;

use crate::core::phylo::Tree;
use crate::io::products::write_atomic;

const DELIMITERS: &[char] = &['(', ')', ',', ':', ';', '[', ']', '\''];

struct ParsedNode {
    label: Option<String>,
    length: Option<f64>,
    children: Vec<ParsedNode>,
}

struct Parser<'a> {
    chars: Vec<char>,
    pos: usize,
    source: &'a str,
}

impl<'a> Parser<'a> {
    fn new(text: &str, source: &'a str) -> Self {
        Self {
            chars: text.chars().collect(),
            pos: 0,
            source,
        }
    }

    fn error(&self, msg: &str) -> anyhow::Error {
        anyhow!("{}: malformed tree at offset {}: {msg}", self.source, self.pos)
    }

    fn peek(&self) -> Option<char> {
        self.chars.get(self.pos).copied()
    }

    /// Skip whitespace and bracketed comments.
    fn skip_trivia(&mut self) -> Result<()> {
        while let Some(c) = self.peek() {
            if c.is_whitespace() {
                self.pos += 1;
            } else if c == '[' {
                while self.peek().is_some_and(|c| c != ']') {
                    self.pos += 1;
                }
                if self.peek().is_none() {
                    return Err(self.error("unterminated comment"));
                }
                self.pos += 1;
            } else {
                break;
            }
        }
        Ok(())
    }

    fn at_end(&mut self) -> Result<bool> {
        self.skip_trivia()?;
        Ok(self.peek().is_none())
    }

    fn expect(&mut self, want: char) -> Result<()> {
        self.skip_trivia()?;
        if self.peek() != Some(want) {
            return Err(self.error(&format!("expected '{want}'")));
        }
        self.pos += 1;
        Ok(())
    }

    fn tree(&mut self) -> Result<ParsedNode> {
        let root = self.subtree()?;
        self.expect(';')?;
        Ok(root)
    }

    fn subtree(&mut self) -> Result<ParsedNode> {
        self.skip_trivia()?;
        let mut children = Vec::new();
        if self.peek() == Some('(') {
            self.pos += 1;
            loop {
                children.push(self.subtree()?);
                self.skip_trivia()?;
                match self.peek() {
                    Some(',') => self.pos += 1,
                    Some(')') => {
                        self.pos += 1;
                        break;
                    }
                    _ => return Err(self.error("expected ',' or ')'")),
                }
            }
        }
        let label = self.label()?;
        let length = self.length()?;
        if children.is_empty() && label.is_none() {
            return Err(self.error("leaf without a label"));
        }
        Ok(ParsedNode {
            label,
            length,
            children,
        })
    }

    fn label(&mut self) -> Result<Option<String>> {
        self.skip_trivia()?;
        if self.peek() == Some('\'') {
            self.pos += 1;
            let mut label = String::new();
            loop {
                match self.peek() {
                    None => return Err(self.error("unterminated quoted label")),
                    Some('\'') if self.chars.get(self.pos + 1) == Some(&'\'') => {
                        label.push('\'');
                        self.pos += 2;
                    }
                    Some('\'') => {
                        self.pos += 1;
                        break;
                    }
                    Some(c) => {
                        label.push(c);
                        self.pos += 1;
                    }
                }
            }
            return Ok(Some(label));
        }
        let start = self.pos;
        while self
            .peek()
            .is_some_and(|c| !c.is_whitespace() && !DELIMITERS.contains(&c))
        {
            self.pos += 1;
        }
        if self.pos == start {
            return Ok(None);
        }
        Ok(Some(self.chars[start..self.pos].iter().collect()))
    }

    fn length(&mut self) -> Result<Option<f64>> {
        self.skip_trivia()?;
        if self.peek() != Some(':') {
            return Ok(None);
        }
        self.pos += 1;
        self.skip_trivia()?;
        let start = self.pos;
        while self
            .peek()
            .is_some_and(|c| c.is_ascii_digit() || matches!(c, '.' | '-' | '+' | 'e' | 'E'))
        {
            self.pos += 1;
        }
        let text: String = self.chars[start..self.pos].iter().collect();
        text.parse::<f64>()
            .map(Some)
            .map_err(|_| self.error(&format!("invalid branch length '{text}'")))
    }
}

fn build(parsed: ParsedNode) -> Tree {
    let mut tree = Tree::new();
    let root = tree.node_mut(Tree::ROOT);
    root.label = parsed.label;
    root.length = parsed.length;
    let mut stack: Vec<(usize, ParsedNode)> = parsed
        .children
        .into_iter()
        .rev()
        .map(|c| (Tree::ROOT, c))
        .collect();
    while let Some((parent, node)) = stack.pop() {
        let idx = tree.add_child(parent, node.label, node.length);
        stack.extend(node.children.into_iter().rev().map(|c| (idx, c)));
    }
    tree
}

/// Parse every tree in `text`.
pub fn parse_newick(text: &str, source: &str) -> Result<Vec<Tree>> {
    let mut parser = Parser::new(text, source);
    let mut trees = Vec::new();
    while !parser.at_end()? {
        trees.push(build(parser.tree()?));
    }
    Ok(trees)
}

/// Read the first tree of `path`. Additional trees are ignored with a warning.
pub fn read_tree_file(path: &Path) -> Result<Tree> {
    let text = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let mut trees = parse_newick(&text, &path.display().to_string())?;
    if trees.is_empty() {
        bail!("{}: no tree found", path.display());
    }
    if trees.len() > 1 {
        warn!(
            path = %path.display(),
            ignored = trees.len() - 1,
            "tree file contains more than one tree; only the first is used"
        );
    }
    Ok(trees.swap_remove(0))
}

pub fn compose_newick(tree: &Tree) -> String {
    let mut out = String::new();
    write_node(tree, Tree::ROOT, &mut out);
    out.push(';');
    out
}

fn write_node(tree: &Tree, idx: usize, out: &mut String) {
    let node = tree.node(idx);
    if !node.children.is_empty() {
        out.push('(');
        for (i, child) in node.children.iter().enumerate() {
            if i > 0 {
                out.push(',');
            }
            write_node(tree, *child, out);
        }
        out.push(')');
    }
    if let Some(label) = &node.label {
        out.push_str(&quote_label(label));
    }
    if let Some(length) = node.length {
        let _ = write!(out, ":{length}");
    }
}

fn quote_label(label: &str) -> String {
    if label.chars().any(|c| c.is_whitespace() || DELIMITERS.contains(&c)) {
        format!("'{}'", label.replace('\'', "''"))
    } else {
        label.to_string()
    }
}

pub fn write_tree(path: &Path, tree: &Tree) -> Result<()> {
    let mut text = compose_newick(tree);
    text.push('\n');
    write_atomic(path, text.as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_labels_lengths_and_comments() {
        let trees = parse_newick("[&R] ((a:0.1,'b c':2e-1)x:1,d);", "t").expect("parse");
        assert_eq!(trees.len(), 1);
        let tree = &trees[0];
        assert_eq!(tree.leaf_labels().expect("labels"), vec!["a", "b c", "d"]);
        assert_eq!(compose_newick(tree), "((a:0.1,'b c':0.2)x:1,d);");
    }

    #[test]
    fn reads_several_trees() {
        let trees = parse_newick("(a,b);\n(b,a);\n", "t").expect("parse");
        assert_eq!(trees.len(), 2);
    }

    #[test]
    fn first_tree_of_file_is_used() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("start.tre");
        fs::write(&path, "(a,(b,c));\n(c,(a,b));\n").expect("write");
        let tree = read_tree_file(&path).expect("read");
        assert_eq!(tree.leaf_labels().expect("labels"), vec!["a", "b", "c"]);
    }

    #[test]
    fn malformed_trees_are_errors() {
        for text in ["(a,b", "(a,,b);", "(a,b):x;", "(a,b)[oops;"] {
            assert!(parse_newick(text, "t").is_err(), "{text}");
        }
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("empty.tre");
        fs::write(&path, "  \n").expect("write");
        assert!(read_tree_file(&path).is_err());
    }

    #[test]
    fn quoted_labels_round_trip() {
        let trees = parse_newick("('it''s',b);", "t").expect("parse");
        assert_eq!(trees[0].leaf_labels().expect("labels"), vec!["it's", "b"]);
        assert_eq!(compose_newick(&trees[0]), "('it''s',b);");
    }
}
