//! Node selector matching.
//!
//! Evaluates a `NodeSelector` against a node's labels and name. A selector
//! is an OR of terms, each term an AND of requirements. Requirements are
//! assumed well-formed (arity and keys are checked when the pool is
//! registered), so matching only ever answers true or false.
//!
//! Besides the yes/no answer the matcher reports how specific the match
//! was, which the candidate ranking uses to prefer purpose-built pools.

use crds::{NODE_NAME_FIELD, NodeSelector, NodeSelectorOperator, NodeSelectorRequirement, NodeSelectorTerm};
use std::collections::{BTreeMap, BTreeSet};

/// The parts of a node a selector can look at
#[derive(Debug, Clone, Copy)]
pub struct NodeFields<'a> {
    /// `metadata.name`
    pub name: &'a str,
    /// `metadata.labels`
    pub labels: &'a BTreeMap<String, String>,
}

/// Result of a successful match
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SelectorMatch {
    /// Requirements in all matching terms
    pub specificity: usize,
    /// Sorted, de-duplicated keys of those requirements, comma separated
    pub key: String,
}

/// Matches a selector against a node.
///
/// An absent selector, or one without terms, matches every node with
/// specificity 0. Otherwise returns `None` unless at least one term matches.
#[must_use]
pub fn evaluate(selector: Option<&NodeSelector>, node: NodeFields<'_>) -> Option<SelectorMatch> {
    let Some(selector) = selector.filter(|s| !s.node_selector_terms.is_empty()) else {
        return Some(SelectorMatch::default());
    };

    let mut specificity = 0;
    let mut keys = BTreeSet::new();
    let mut matched = false;
    for term in selector
        .node_selector_terms
        .iter()
        .filter(|term| term_matches(term, node))
    {
        matched = true;
        specificity += term.len();
        keys.extend(term.requirements().map(|req| req.key.as_str()));
    }

    matched.then(|| SelectorMatch {
        specificity,
        key: keys.into_iter().collect::<Vec<_>>().join(","),
    })
}

/// Whether every requirement of the term holds. An empty term matches nothing.
#[must_use]
pub fn term_matches(term: &NodeSelectorTerm, node: NodeFields<'_>) -> bool {
    if term.is_empty() {
        return false;
    }
    term.match_expressions
        .iter()
        .all(|req| requirement_matches(req, node.labels.get(&req.key).map(String::as_str)))
        && term.match_fields.iter().all(|req| {
            let value = (req.key == NODE_NAME_FIELD).then_some(node.name);
            requirement_matches(req, value)
        })
}

fn requirement_matches(req: &NodeSelectorRequirement, value: Option<&str>) -> bool {
    match req.operator {
        NodeSelectorOperator::In => value.is_some_and(|v| req.values.iter().any(|x| x == v)),
        NodeSelectorOperator::NotIn => value.is_none_or(|v| req.values.iter().all(|x| x != v)),
        NodeSelectorOperator::Exists => value.is_some(),
        NodeSelectorOperator::DoesNotExist => value.is_none(),
        NodeSelectorOperator::Gt => compare(req, value).is_some_and(|(v, bound)| v > bound),
        NodeSelectorOperator::Lt => compare(req, value).is_some_and(|(v, bound)| v < bound),
        NodeSelectorOperator::Unknown => false,
    }
}

fn compare(req: &NodeSelectorRequirement, value: Option<&str>) -> Option<(i64, i64)> {
    let value = value?.parse().ok()?;
    let bound = req.values.first()?.parse().ok()?;
    Some((value, bound))
}
