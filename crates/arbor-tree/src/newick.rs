//! Newick writer and a narrow reader.
//!
//! The reader accepts the usual grammar plus `[&key=value,...]` metadata
//! comments. Two keys are understood: `nr` pins the node index and `height`
//! pins the node height. When every node carries both, parsing reproduces the
//! written tree exactly, which is what the checkpoint format relies on.
//!
//! ```text
//! tree     = subtree ';'?
//! subtree  = '(' subtree ',' subtree ')' label? meta? (':' length)? meta?
//!          | label meta? (':' length)? meta?
//! ```

use std::collections::BTreeMap;

use arbor_core::errors::{ArborError, ErrorInfo};

use crate::tree::{NodeIndex, Tree};

/// Serialises `tree`. With `metadata` every node carries `[&nr=..,height=..]`.
pub fn write(tree: &Tree, metadata: bool) -> String {
    let mut buf = String::new();
    write_subtree(tree, tree.root(), metadata, &mut buf);
    buf.push(';');
    buf
}

fn write_subtree(tree: &Tree, idx: NodeIndex, metadata: bool, buf: &mut String) {
    let children = tree.children(idx);
    if children.is_empty() {
        buf.push_str(&quote_label(tree.node(idx).taxon().unwrap_or("")));
    } else {
        buf.push('(');
        for (pos, &child) in children.iter().enumerate() {
            if pos > 0 {
                buf.push(',');
            }
            write_subtree(tree, child, metadata, buf);
        }
        buf.push(')');
    }
    if metadata {
        buf.push_str(&format!("[&nr={},height={}]", idx, tree.height(idx)));
    }
    if !tree.is_root(idx) {
        buf.push(':');
        buf.push_str(&tree.branch_length(idx).to_string());
    }
}

fn quote_label(label: &str) -> String {
    let needs_quotes = label.is_empty()
        || label
            .chars()
            .any(|c| c.is_whitespace() || "()[]:;,'\"".contains(c));
    if needs_quotes {
        format!("'{}'", label.replace('\'', "''"))
    } else {
        label.to_string()
    }
}

/// Parses a Newick string into a binary [`Tree`].
///
/// Without `nr` metadata leaves are numbered in order of appearance and
/// internal nodes in post-order. Without `height` metadata heights are derived
/// from branch lengths (missing lengths count as zero) so the deepest tip sits
/// at height zero.
pub fn parse(text: &str) -> Result<Tree, ArborError> {
    let mut parser = Parser {
        input: text.as_bytes(),
        pos: 0,
        nodes: Vec::new(),
    };
    parser.skip_whitespace();
    let root = parser.parse_subtree()?;
    parser.skip_whitespace();
    if parser.peek() == Some(b';') {
        parser.pos += 1;
        parser.skip_whitespace();
    }
    if parser.pos != parser.input.len() {
        return Err(parser.error("trailing-input", "unexpected characters after the tree"));
    }
    build_tree(parser.nodes, root)
}

#[derive(Debug, Default)]
struct ParsedNode {
    label: Option<String>,
    length: Option<f64>,
    meta: BTreeMap<String, String>,
    children: Vec<usize>,
}

struct Parser<'a> {
    input: &'a [u8],
    pos: usize,
    nodes: Vec<ParsedNode>,
}

impl<'a> Parser<'a> {
    fn peek(&self) -> Option<u8> {
        self.input.get(self.pos).copied()
    }

    fn skip_whitespace(&mut self) {
        while matches!(self.peek(), Some(c) if c.is_ascii_whitespace()) {
            self.pos += 1;
        }
    }

    fn error(&self, code: &str, message: &str) -> ArborError {
        ArborError::Tree(
            ErrorInfo::new(code, message).with_context("offset", self.pos.to_string()),
        )
    }

    fn parse_subtree(&mut self) -> Result<usize, ArborError> {
        self.skip_whitespace();
        let mut node = ParsedNode::default();
        if self.peek() == Some(b'(') {
            self.pos += 1;
            loop {
                let child = self.parse_subtree()?;
                node.children.push(child);
                self.skip_whitespace();
                match self.peek() {
                    Some(b',') => self.pos += 1,
                    Some(b')') => {
                        self.pos += 1;
                        break;
                    }
                    _ => return Err(self.error("unbalanced", "expected ',' or ')'")),
                }
            }
        }
        self.skip_whitespace();
        node.label = self.parse_label()?;
        self.parse_annotations(&mut node)?;
        if self.peek() == Some(b':') {
            self.pos += 1;
            self.skip_whitespace();
            node.length = Some(self.parse_length()?);
            self.parse_annotations(&mut node)?;
        }
        let idx = self.nodes.len();
        self.nodes.push(node);
        Ok(idx)
    }

    fn parse_label(&mut self) -> Result<Option<String>, ArborError> {
        match self.peek() {
            Some(quote @ (b'\'' | b'"')) => {
                self.pos += 1;
                let mut label = Vec::new();
                loop {
                    match self.peek() {
                        Some(c) if c == quote => {
                            if self.input.get(self.pos + 1) == Some(&quote) {
                                label.push(quote);
                                self.pos += 2;
                            } else {
                                self.pos += 1;
                                break;
                            }
                        }
                        Some(c) => {
                            label.push(c);
                            self.pos += 1;
                        }
                        None => return Err(self.error("unterminated-quote", "label quote not closed")),
                    }
                }
                Ok(Some(String::from_utf8_lossy(&label).into_owned()))
            }
            _ => {
                let start = self.pos;
                while matches!(self.peek(), Some(c) if !c.is_ascii_whitespace() && !b"()[]:;,".contains(&c))
                {
                    self.pos += 1;
                }
                if self.pos == start {
                    Ok(None)
                } else {
                    Ok(Some(String::from_utf8_lossy(&self.input[start..self.pos]).into_owned()))
                }
            }
        }
    }

    fn parse_length(&mut self) -> Result<f64, ArborError> {
        let start = self.pos;
        while matches!(self.peek(), Some(c) if !c.is_ascii_whitespace() && !b",)[;".contains(&c)) {
            self.pos += 1;
        }
        let raw = String::from_utf8_lossy(&self.input[start..self.pos]);
        raw.parse::<f64>().map_err(|_| {
            ArborError::Tree(
                ErrorInfo::new("bad-length", "branch length is not a number")
                    .with_context("value", raw.to_string())
                    .with_context("offset", start.to_string()),
            )
        })
    }

    fn parse_annotations(&mut self, node: &mut ParsedNode) -> Result<(), ArborError> {
        loop {
            self.skip_whitespace();
            if self.peek() != Some(b'[') {
                return Ok(());
            }
            let start = self.pos + 1;
            let end = self.input[start..]
                .iter()
                .position(|&c| c == b']')
                .map(|offset| start + offset)
                .ok_or_else(|| self.error("unterminated-comment", "metadata comment not closed"))?;
            let body = String::from_utf8_lossy(&self.input[start..end]).into_owned();
            self.pos = end + 1;
            if let Some(pairs) = body.strip_prefix('&') {
                for (key, value) in split_pairs(pairs) {
                    node.meta.insert(key, value);
                }
            }
        }
    }
}

fn split_pairs(body: &str) -> Vec<(String, String)> {
    let mut pairs = Vec::new();
    let mut depth = 0i32;
    let mut current = String::new();
    let mut push = |chunk: &str| {
        if let Some((key, value)) = chunk.split_once('=') {
            pairs.push((key.trim().to_string(), value.trim().to_string()));
        }
    };
    for ch in body.chars() {
        match ch {
            '{' => depth += 1,
            '}' => depth -= 1,
            ',' if depth == 0 => {
                push(&current);
                current.clear();
                continue;
            }
            _ => {}
        }
        current.push(ch);
    }
    push(&current);
    pairs
}

fn build_tree(nodes: Vec<ParsedNode>, root: usize) -> Result<Tree, ArborError> {
    for (idx, node) in nodes.iter().enumerate() {
        if !node.children.is_empty() && node.children.len() != 2 {
            return Err(ArborError::Tree(
                ErrorInfo::new("not-binary", "only bifurcating trees are supported")
                    .with_context("node", idx.to_string())
                    .with_context("children", node.children.len().to_string()),
            ));
        }
    }
    let leaf_count = nodes.iter().filter(|node| node.children.is_empty()).count();
    let count = nodes.len();

    let numbering = if nodes.iter().all(|node| node.meta.contains_key("nr")) {
        explicit_numbering(&nodes, leaf_count)?
    } else {
        implicit_numbering(&nodes, root, leaf_count)
    };

    let heights = if nodes.iter().all(|node| node.meta.contains_key("height")) {
        nodes
            .iter()
            .map(|node| meta_f64(node, "height"))
            .collect::<Result<Vec<_>, _>>()?
    } else {
        heights_from_lengths(&nodes, root)
    };

    let mut parents = vec![None; count];
    let mut node_heights = vec![0.0; count];
    let mut taxa = vec![String::new(); leaf_count];
    for (parsed_idx, node) in nodes.iter().enumerate() {
        let nr = numbering[parsed_idx];
        node_heights[nr] = heights[parsed_idx];
        for &child in &node.children {
            parents[numbering[child]] = Some(nr);
        }
        if node.children.is_empty() {
            taxa[nr] = node.label.clone().unwrap_or_default();
        }
    }
    Tree::from_parts(taxa, &parents, &node_heights)
}

fn meta_f64(node: &ParsedNode, key: &str) -> Result<f64, ArborError> {
    let raw = node.meta.get(key).map(String::as_str).unwrap_or("");
    raw.parse::<f64>().map_err(|_| {
        ArborError::Tree(
            ErrorInfo::new("bad-metadata", "metadata value is not a number")
                .with_context("key", key)
                .with_context("value", raw),
        )
    })
}

fn explicit_numbering(nodes: &[ParsedNode], leaf_count: usize) -> Result<Vec<NodeIndex>, ArborError> {
    let mut seen = vec![false; nodes.len()];
    let mut numbering = Vec::with_capacity(nodes.len());
    for node in nodes {
        let nr = meta_f64(node, "nr")? as usize;
        let in_range = if node.children.is_empty() {
            nr < leaf_count
        } else {
            nr >= leaf_count && nr < nodes.len()
        };
        if !in_range || seen[nr] {
            return Err(ArborError::Tree(
                ErrorInfo::new("bad-numbering", "node numbers must be a leaves-first permutation")
                    .with_context("nr", nr.to_string()),
            ));
        }
        seen[nr] = true;
        numbering.push(nr);
    }
    Ok(numbering)
}

fn implicit_numbering(nodes: &[ParsedNode], root: usize, leaf_count: usize) -> Vec<NodeIndex> {
    // Parsed indices are already post-order: children are pushed before parents.
    let mut numbering = vec![0; nodes.len()];
    let mut next_leaf = 0;
    let mut next_internal = leaf_count;
    for (idx, node) in nodes.iter().enumerate() {
        if node.children.is_empty() {
            numbering[idx] = next_leaf;
            next_leaf += 1;
        } else if idx != root {
            numbering[idx] = next_internal;
            next_internal += 1;
        }
    }
    numbering[root] = nodes.len() - 1;
    numbering
}

fn heights_from_lengths(nodes: &[ParsedNode], root: usize) -> Vec<f64> {
    let mut depth = vec![0.0; nodes.len()];
    let mut stack = vec![root];
    while let Some(idx) = stack.pop() {
        for &child in &nodes[idx].children {
            depth[child] = depth[idx] + nodes[child].length.unwrap_or(0.0);
            stack.push(child);
        }
    }
    let max_depth = depth.iter().copied().fold(0.0, f64::max);
    depth.iter().map(|d| max_depth - d).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quoting_escapes_apostrophes() {
        assert_eq!(quote_label("O'Brien"), "'O''Brien'");
        assert_eq!(quote_label("plain"), "plain");
    }

    #[test]
    fn rejects_polytomy() {
        let err = parse("(A:1,B:1,C:1);").unwrap_err();
        assert!(matches!(err, ArborError::Tree(info) if info.code == "not-binary"));
    }
}
