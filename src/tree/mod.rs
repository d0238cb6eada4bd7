use std::fmt::Display;

use anyhow::bail;
use log::debug;

use crate::Result;

pub use tree_node::Node;
use NodeIdx::{Internal as Int, Leaf};

mod tree_node;
pub mod tree_parser;

#[derive(Debug, PartialEq, Clone, Copy, PartialOrd, Eq, Ord, Hash)]
pub enum NodeIdx {
    Internal(usize),
    Leaf(usize),
}

impl From<NodeIdx> for usize {
    fn from(node_idx: NodeIdx) -> usize {
        match node_idx {
            Int(idx) => idx,
            Leaf(idx) => idx,
        }
    }
}

impl From<&NodeIdx> for usize {
    fn from(node_idx: &NodeIdx) -> usize {
        usize::from(*node_idx)
    }
}

impl Display for NodeIdx {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Int(idx) => write!(f, "internal node {}", idx),
            Leaf(idx) => write!(f, "leaf node {}", idx),
        }
    }
}

/// Read-only view of a rooted tree as consumed by the likelihood engine.
///
/// Nodes are numbered `0..node_count()`, tips first (`0..external_node_count()`)
/// followed by the internal nodes.
pub trait TreeTopology {
    fn root(&self) -> usize;
    fn node_count(&self) -> usize;
    fn external_node_count(&self) -> usize;
    fn is_external(&self, node: usize) -> bool;
    fn parent(&self, node: usize) -> Option<usize>;
    fn child_count(&self, node: usize) -> usize;
    fn child(&self, node: usize, i: usize) -> usize;
    fn node_height(&self, node: usize) -> f64;
    fn taxon_id(&self, node: usize) -> Option<&str>;

    fn internal_node_count(&self) -> usize {
        self.node_count() - self.external_node_count()
    }

    fn is_root(&self, node: usize) -> bool {
        self.root() == node
    }
}

#[derive(Debug, Clone)]
pub struct Tree {
    pub root: NodeIdx,
    pub nodes: Vec<Node>,
    postorder: Vec<NodeIdx>,
    preorder: Vec<NodeIdx>,
    pub n: usize,
    leaf_ids: Vec<String>,
}

impl Tree {
    /// Builds a tree from nodes whose indices already follow the tips-first numbering.
    pub(crate) fn from_nodes(nodes: Vec<Node>, root: NodeIdx) -> Result<Self> {
        let n = nodes.iter().filter(|node| node.is_leaf()).count();
        for (i, node) in nodes.iter().enumerate() {
            if usize::from(node.idx) != i {
                bail!("Node {} is stored at position {}.", node.idx, i);
            }
            if node.is_leaf() != (i < n) {
                bail!("Tips must be numbered before internal nodes, found {}.", node.idx);
            }
        }
        let leaf_ids = nodes[0..n].iter().map(|node| node.id.clone()).collect();
        let mut tree = Tree {
            root,
            nodes,
            postorder: Vec::new(),
            preorder: Vec::new(),
            n,
            leaf_ids,
        };
        tree.compute_postorder();
        tree.compute_preorder();
        tree.compute_heights();
        Ok(tree)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn postorder(&self) -> &[NodeIdx] {
        &self.postorder
    }

    pub fn preorder(&self) -> &[NodeIdx] {
        &self.preorder
    }

    pub fn leaf_ids(&self) -> &[String] {
        &self.leaf_ids
    }

    pub fn leaves(&self) -> Vec<&Node> {
        self.nodes.iter().filter(|node| node.is_leaf()).collect()
    }

    pub fn node(&self, idx: &NodeIdx) -> &Node {
        &self.nodes[usize::from(idx)]
    }

    pub fn idx(&self, id: &str) -> Result<NodeIdx> {
        match self.nodes.iter().find(|node| node.id == id) {
            Some(node) => Ok(node.idx),
            None => bail!("No node with id {} found in the tree", id),
        }
    }

    pub fn height(&self) -> f64 {
        self.node(&self.root).height
    }

    pub fn blen(&self, idx: &NodeIdx) -> f64 {
        self.node(idx).blen
    }

    /// Children are visited in their stored order, so the first child's subtree comes first.
    pub(crate) fn compute_postorder(&mut self) {
        let mut order = Vec::<NodeIdx>::with_capacity(self.nodes.len());
        let mut stack = Vec::<(NodeIdx, bool)>::with_capacity(self.nodes.len());
        stack.push((self.root, false));
        while let Some((cur_root, expanded)) = stack.pop() {
            if expanded {
                order.push(cur_root);
                continue;
            }
            stack.push((cur_root, true));
            for child in self.node(&cur_root).children.iter().rev() {
                stack.push((*child, false));
            }
        }
        self.postorder = order;
    }

    pub(crate) fn compute_preorder(&mut self) {
        self.preorder = self.preorder_subroot(&self.root);
    }

    pub fn preorder_subroot(&self, subroot_idx: &NodeIdx) -> Vec<NodeIdx> {
        let mut order = Vec::<NodeIdx>::with_capacity(self.nodes.len());
        let mut stack = Vec::<NodeIdx>::with_capacity(self.nodes.len());
        stack.push(*subroot_idx);
        while let Some(cur_root) = stack.pop() {
            order.push(cur_root);
            for child in self.node(&cur_root).children.iter().rev() {
                stack.push(*child);
            }
        }
        order
    }

    /// Derives node heights from branch lengths: the deepest tip sits at height zero.
    pub(crate) fn compute_heights(&mut self) {
        let mut depths = vec![0.0; self.nodes.len()];
        for node_idx in self.preorder.iter() {
            let idx = usize::from(node_idx);
            if let Some(parent) = self.nodes[idx].parent {
                depths[idx] = depths[usize::from(parent)] + self.nodes[idx].blen;
            }
        }
        let max_depth = depths.iter().cloned().fold(0.0, f64::max);
        for (node, depth) in self.nodes.iter_mut().zip(depths) {
            node.height = max_depth - depth;
        }
        self.nodes[usize::from(self.root)].blen = 0.0;
    }

    /// Moves a node to a new height, keeping the lengths of the adjacent branches in sync.
    ///
    /// No ordering check is done against the parent or the children: inverted heights are
    /// caught by the likelihood computation.
    pub fn set_node_height(&mut self, node: usize, height: f64) {
        debug!("Setting height of node {} to {}", node, height);
        self.nodes[node].height = height;
        if let Some(parent) = self.nodes[node].parent {
            self.nodes[node].blen = self.nodes[usize::from(parent)].height - height;
        }
        for child in self.nodes[node].children.clone() {
            let child = usize::from(child);
            self.nodes[child].blen = height - self.nodes[child].height;
        }
    }

    /// Exchanges the subtrees rooted at `a` and `b` between their parents.
    pub fn exchange(&mut self, a: usize, b: usize) -> Result<()> {
        let (Some(parent_a), Some(parent_b)) = (self.nodes[a].parent, self.nodes[b].parent) else {
            bail!("Cannot exchange the root of the tree.");
        };
        if self.is_ancestor(a, b) || self.is_ancestor(b, a) {
            bail!("Cannot exchange node {} with node {}, one contains the other.", a, b);
        }
        let idx_a = self.nodes[a].idx;
        let idx_b = self.nodes[b].idx;
        for child in self.nodes[usize::from(parent_a)].children.iter_mut() {
            if *child == idx_a {
                *child = idx_b;
            }
        }
        for child in self.nodes[usize::from(parent_b)].children.iter_mut() {
            if *child == idx_b {
                *child = idx_a;
            }
        }
        self.nodes[a].parent = Some(parent_b);
        self.nodes[b].parent = Some(parent_a);
        self.nodes[a].blen = self.nodes[usize::from(parent_b)].height - self.nodes[a].height;
        self.nodes[b].blen = self.nodes[usize::from(parent_a)].height - self.nodes[b].height;
        self.compute_postorder();
        self.compute_preorder();
        Ok(())
    }

    pub fn is_ancestor(&self, ancestor: usize, node: usize) -> bool {
        let mut cur = Some(self.nodes[node].idx);
        while let Some(idx) = cur {
            if usize::from(idx) == ancestor {
                return true;
            }
            cur = self.node(&idx).parent;
        }
        false
    }

    pub fn to_newick(&self) -> String {
        format!("{};", self.subtree_to_newick(&self.root))
    }

    fn subtree_to_newick(&self, node_idx: &NodeIdx) -> String {
        let node = self.node(node_idx);
        let label = match node.parent {
            Some(_) => format!("{}:{}", node.id, node.blen),
            None => node.id.clone(),
        };
        match node.idx {
            Int(_) => {
                let children: Vec<String> = node
                    .children
                    .iter()
                    .map(|child| self.subtree_to_newick(child))
                    .collect();
                format!("({}){}", children.join(","), label)
            }
            Leaf(_) => label,
        }
    }
}

impl TreeTopology for Tree {
    fn root(&self) -> usize {
        usize::from(self.root)
    }

    fn node_count(&self) -> usize {
        self.nodes.len()
    }

    fn external_node_count(&self) -> usize {
        self.n
    }

    fn is_external(&self, node: usize) -> bool {
        self.nodes[node].is_leaf()
    }

    fn parent(&self, node: usize) -> Option<usize> {
        self.nodes[node].parent.map(usize::from)
    }

    fn child_count(&self, node: usize) -> usize {
        self.nodes[node].children.len()
    }

    fn child(&self, node: usize, i: usize) -> usize {
        usize::from(self.nodes[node].children[i])
    }

    fn node_height(&self, node: usize) -> f64 {
        self.nodes[node].height
    }

    fn taxon_id(&self, node: usize) -> Option<&str> {
        if self.nodes[node].is_leaf() {
            Some(&self.nodes[node].id)
        } else {
            None
        }
    }
}
