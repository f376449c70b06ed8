//! Node selector types
//!
//! Mirrors the core/v1 `NodeSelector` shape: a disjunction of terms, each term
//! a conjunction of label requirements (`matchExpressions`) and field
//! requirements (`matchFields`).

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Field key that `matchFields` requirements may reference
pub const NODE_NAME_FIELD: &str = "metadata.name";

/// Selects nodes by label and field requirements.
///
/// The selector matches a node if any of its terms matches (OR of terms).
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct NodeSelector {
    /// Required list of node selector terms; terms are ORed
    #[serde(default)]
    pub node_selector_terms: Vec<NodeSelectorTerm>,
}

/// A conjunction of label and field requirements
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct NodeSelectorTerm {
    /// Requirements on node labels
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub match_expressions: Vec<NodeSelectorRequirement>,

    /// Requirements on node fields (only `metadata.name` is supported)
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub match_fields: Vec<NodeSelectorRequirement>,
}

impl NodeSelectorTerm {
    /// Total number of requirements in the term
    #[must_use]
    pub fn len(&self) -> usize {
        self.match_expressions.len() + self.match_fields.len()
    }

    /// Whether the term has no requirements at all
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Iterates over label and field requirements, labels first
    pub fn requirements(&self) -> impl Iterator<Item = &NodeSelectorRequirement> {
        self.match_expressions.iter().chain(self.match_fields.iter())
    }
}

/// A single key/operator/values requirement
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct NodeSelectorRequirement {
    /// Label key or field path the requirement applies to
    pub key: String,

    /// Relationship between the key and the values
    pub operator: NodeSelectorOperator,

    /// Values to compare against; arity depends on the operator
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub values: Vec<String>,
}

impl NodeSelectorRequirement {
    /// Builds a requirement from its parts
    pub fn new(
        key: impl Into<String>,
        operator: NodeSelectorOperator,
        values: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        Self {
            key: key.into(),
            operator,
            values: values.into_iter().map(Into::into).collect(),
        }
    }
}

/// Node selector operator
///
/// Operators outside the known set deserialize as `Unknown` so that a bad
/// object is reported by validation instead of breaking the watch stream.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Hash)]
pub enum NodeSelectorOperator {
    /// Value is one of the listed values
    In,
    /// Value is none of the listed values
    NotIn,
    /// Key is present
    Exists,
    /// Key is absent
    DoesNotExist,
    /// Value, parsed as an integer, is greater than the single listed value
    Gt,
    /// Value, parsed as an integer, is less than the single listed value
    Lt,
    /// Any operator not listed above
    #[serde(other)]
    #[schemars(skip)]
    Unknown,
}

impl fmt::Display for NodeSelectorOperator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::In => "In",
            Self::NotIn => "NotIn",
            Self::Exists => "Exists",
            Self::DoesNotExist => "DoesNotExist",
            Self::Gt => "Gt",
            Self::Lt => "Lt",
            Self::Unknown => "Unknown",
        };
        f.write_str(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deserialize_selector() {
        let selector: NodeSelector = serde_json::from_value(serde_json::json!({
            "nodeSelectorTerms": [{
                "matchExpressions": [
                    {"key": "ipv4", "operator": "In", "values": ["true"]},
                    {"key": "gpu", "operator": "Exists"}
                ],
                "matchFields": [
                    {"key": "metadata.name", "operator": "NotIn", "values": ["node-a"]}
                ]
            }]
        }))
        .unwrap();

        let term = &selector.node_selector_terms[0];
        assert_eq!(term.len(), 3);
        assert_eq!(term.match_expressions[1].operator, NodeSelectorOperator::Exists);
        assert!(term.match_expressions[1].values.is_empty());
        assert_eq!(term.match_fields[0].key, NODE_NAME_FIELD);
    }

    #[test]
    fn test_unknown_operator_deserializes() {
        let req: NodeSelectorRequirement = serde_json::from_value(serde_json::json!({
            "key": "foo", "operator": "Matches", "values": ["x"]
        }))
        .unwrap();
        assert_eq!(req.operator, NodeSelectorOperator::Unknown);
    }
}
