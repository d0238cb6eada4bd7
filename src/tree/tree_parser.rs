use std::fmt;

use anyhow::bail;
use log::{info, warn};
use pest::{error::Error as PestError, iterators::Pair, Parser};
use pest_derive::Parser;

use crate::tree::{
    Node,
    NodeIdx::{self, Internal as Int, Leaf},
    Tree,
};
use crate::Result;

#[derive(Parser)]
#[grammar = "./tree/newick.pest"]
pub struct NewickParser;

#[derive(Debug)]
pub struct ParsingError(pub(crate) Box<PestError<Rule>>);

impl fmt::Display for ParsingError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Malformed newick string")?;
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for ParsingError {}

/// Node as it appears in the newick string, before the tips-first renumbering.
#[derive(Debug, Default)]
struct ParsedNode {
    id: String,
    blen: f64,
    children: Vec<usize>,
    parent: Option<usize>,
}

pub fn from_newick(newick_string: &str) -> Result<Vec<Tree>> {
    info!("Parsing newick trees.");
    let mut trees = Vec::new();
    let newick_tree_rule = match NewickParser::parse(Rule::newick, newick_string) {
        Ok(mut pairs) => match pairs.next() {
            Some(rule) => rule,
            None => bail!("Empty newick input."),
        },
        Err(e) => bail!(ParsingError(Box::new(e))),
    };
    for tree_rule in newick_tree_rule.into_inner() {
        if tree_rule.as_rule() != Rule::tree {
            continue;
        }
        let Some(rule) = tree_rule.into_inner().next() else {
            continue;
        };
        let mut parsed = Vec::<ParsedNode>::new();
        let root = match rule.as_rule() {
            Rule::rooted => parse_rooted_rule(&mut parsed, rule),
            Rule::unrooted => parse_unrooted_rule(&mut parsed, rule),
            _ => unreachable!(),
        };
        trees.push(renumber(parsed, root)?);
    }
    info!("Finished parsing {} newick tree(s) successfully.", trees.len());
    Ok(trees)
}

fn parse_rooted_rule(parsed: &mut Vec<ParsedNode>, rooted_rule: Pair<Rule>) -> usize {
    let mut root = 0;
    for rule in rooted_rule.into_inner() {
        root = parse_node_rule(parsed, rule);
    }
    root
}

fn parse_unrooted_rule(parsed: &mut Vec<ParsedNode>, unrooted_rule: Pair<Rule>) -> usize {
    warn!("Found unrooted tree, will root at the trifurcation.");
    let mut children = Vec::new();
    for rule in unrooted_rule.into_inner() {
        match rule.as_rule() {
            Rule::leaf | Rule::internal => children.push(parse_node_rule(parsed, rule)),
            _ => {}
        }
    }
    let inner = add_parent(parsed, vec![children[0], children[1]]);
    add_parent(parsed, vec![inner, children[2]])
}

fn add_parent(parsed: &mut Vec<ParsedNode>, children: Vec<usize>) -> usize {
    let idx = parsed.len();
    for &child in &children {
        parsed[child].parent = Some(idx);
    }
    parsed.push(ParsedNode {
        children,
        ..Default::default()
    });
    idx
}

fn parse_node_rule(parsed: &mut Vec<ParsedNode>, node_rule: Pair<Rule>) -> usize {
    let idx = parsed.len();
    parsed.push(ParsedNode::default());
    let mut children = Vec::new();
    for rule in node_rule.into_inner() {
        match rule.as_rule() {
            Rule::label => parsed[idx].id = rule.as_str().to_string(),
            Rule::branch_length => parsed[idx].blen = parse_branch_length_rule(rule),
            Rule::internal | Rule::leaf => children.push(parse_node_rule(parsed, rule)),
            _ => unreachable!(),
        }
    }
    for &child in &children {
        parsed[child].parent = Some(idx);
    }
    parsed[idx].children = children;
    idx
}

fn parse_branch_length_rule(rule: Pair<Rule>) -> f64 {
    rule.into_inner()
        .next()
        .map(|float| float.as_str().trim().parse::<f64>().unwrap_or_default())
        .unwrap_or_default()
}

/// Tips keep their order of appearance, internal nodes follow in postorder so the root is last.
fn renumber(parsed: Vec<ParsedNode>, root: usize) -> Result<Tree> {
    let mut postorder = Vec::with_capacity(parsed.len());
    let mut stack = vec![(root, false)];
    while let Some((idx, expanded)) = stack.pop() {
        if expanded {
            postorder.push(idx);
            continue;
        }
        stack.push((idx, true));
        for &child in parsed[idx].children.iter().rev() {
            stack.push((child, false));
        }
    }
    let mut leaves: Vec<usize> = postorder
        .iter()
        .copied()
        .filter(|&idx| parsed[idx].children.is_empty())
        .collect();
    leaves.sort();
    let internals = postorder
        .iter()
        .copied()
        .filter(|&idx| !parsed[idx].children.is_empty());

    let mut new_idx = vec![Leaf(0); parsed.len()];
    for (i, &old) in leaves.iter().enumerate() {
        new_idx[old] = Leaf(i);
    }
    for (i, old) in internals.enumerate() {
        new_idx[old] = Int(leaves.len() + i);
    }

    let mut nodes: Vec<Option<Node>> = vec![None; parsed.len()];
    for (old, node) in parsed.into_iter().enumerate() {
        let parent = node.parent.map(|p| new_idx[p]);
        let idx = new_idx[old];
        nodes[usize::from(idx)] = Some(match idx {
            Leaf(i) => Node::new_leaf(i, parent, node.blen, node.id),
            Int(i) => Node::new_internal(
                i,
                parent,
                node.children.iter().map(|&c| new_idx[c]).collect::<Vec<NodeIdx>>(),
                node.blen,
                node.id,
            ),
        });
    }
    Tree::from_nodes(nodes.into_iter().flatten().collect(), new_idx[root])
}
