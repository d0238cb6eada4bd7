use fixedbitset::FixedBitSet;

use crate::tree::TreeTopology;

/// Staleness flags for node partials and, when asked for, for individual patterns.
///
/// Only the node flags drive evaluation: partials are always recomputed for every pattern.
/// The pattern flags are advisory. They record which patterns a tip change touched, for a
/// backend or caller that can restrict its work to them, and are cleared with the nodes.
#[derive(Debug, Clone, PartialEq)]
pub struct DirtyTracker {
    nodes: FixedBitSet,
    pattern_count: usize,
    patterns: Option<FixedBitSet>,
    stored: Option<(FixedBitSet, Option<FixedBitSet>)>,
}

impl DirtyTracker {
    pub fn new(node_count: usize, pattern_count: usize) -> Self {
        DirtyTracker {
            nodes: FixedBitSet::with_capacity(node_count),
            pattern_count,
            patterns: None,
            stored: None,
        }
    }

    pub fn mark_node(&mut self, node: usize) {
        self.nodes.insert(node);
    }

    pub fn mark_node_and_children(&mut self, node: usize, tree: &dyn TreeTopology) {
        self.nodes.insert(node);
        for i in 0..tree.child_count(node) {
            self.nodes.insert(tree.child(node, i));
        }
    }

    pub fn mark_subtree(&mut self, node: usize, tree: &dyn TreeTopology) {
        let mut stack = vec![node];
        while let Some(node) = stack.pop() {
            self.nodes.insert(node);
            stack.extend((0..tree.child_count(node)).map(|i| tree.child(node, i)));
        }
    }

    pub fn mark_all(&mut self) {
        self.nodes.insert_range(..);
        if let Some(patterns) = self.patterns.as_mut() {
            patterns.insert_range(..);
        }
    }

    pub fn is_dirty(&self, node: usize) -> bool {
        self.nodes.contains(node)
    }

    pub fn any_dirty(&self) -> bool {
        self.nodes.count_ones(..) > 0
    }

    pub fn dirty_nodes(&self) -> Vec<usize> {
        self.nodes.ones().collect()
    }

    pub fn mark_pattern(&mut self, pattern: usize) {
        self.patterns
            .get_or_insert_with(|| FixedBitSet::with_capacity(self.pattern_count))
            .insert(pattern);
    }

    pub fn mark_all_patterns(&mut self) {
        self.patterns
            .get_or_insert_with(|| FixedBitSet::with_capacity(self.pattern_count))
            .insert_range(..);
    }

    /// Empty unless per-pattern flags were requested.
    pub fn dirty_patterns(&self) -> Vec<usize> {
        match &self.patterns {
            Some(patterns) => patterns.ones().collect(),
            None => Vec::new(),
        }
    }

    pub fn clear(&mut self) {
        self.nodes.clear();
        if let Some(patterns) = self.patterns.as_mut() {
            patterns.clear();
        }
    }

    pub fn store_state(&mut self) {
        self.stored = Some((self.nodes.clone(), self.patterns.clone()));
    }

    pub fn restore_state(&mut self) {
        if let Some((nodes, patterns)) = self.stored.take() {
            self.nodes = nodes;
            self.patterns = patterns;
        }
    }

    pub fn accept_state(&mut self) {
        self.stored = None;
    }
}
