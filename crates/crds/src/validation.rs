//! ClusterCIDR validation
//!
//! A ClusterCIDR must pass these checks before the controller builds any
//! allocator for it. All problems are collected, each tagged with the field
//! path it refers to, so a single report lists everything wrong with the
//! object.

use crate::cluster_cidr::ClusterCIDRSpec;
use crate::node_selector::{
    NODE_NAME_FIELD, NodeSelector, NodeSelectorOperator, NodeSelectorRequirement,
    NodeSelectorTerm,
};
use ipnet::IpNet;
use std::fmt;
use thiserror::Error;

/// Smallest per-node range: 2^4 = 16 addresses
pub const MIN_PER_NODE_HOST_BITS: i32 = 4;

const MAX_LABEL_NAME_LEN: usize = 63;
const MAX_DNS_SUBDOMAIN_LEN: usize = 253;

/// IP address family
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum IpFamily {
    /// IPv4
    IPv4,
    /// IPv6
    IPv6,
}

impl IpFamily {
    /// Family of an existing network
    #[must_use]
    pub fn of(net: &IpNet) -> Self {
        match net {
            IpNet::V4(_) => Self::IPv4,
            IpNet::V6(_) => Self::IPv6,
        }
    }

    /// Address width in bits
    #[must_use]
    pub fn bits(self) -> u8 {
        match self {
            Self::IPv4 => 32,
            Self::IPv6 => 128,
        }
    }
}

impl fmt::Display for IpFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::IPv4 => f.write_str("IPv4"),
            Self::IPv6 => f.write_str("IPv6"),
        }
    }
}

/// One validated address family of a ClusterCIDR
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FamilyBlock {
    /// Address family of the block
    pub family: IpFamily,
    /// Base block, host bits cleared
    pub block: IpNet,
    /// Host bits of each node's range
    pub host_bits: u8,
}

/// A single validation problem
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldError {
    /// JSON path of the offending field, e.g. `spec.ipv4`
    pub path: String,
    /// What is wrong with it
    pub message: String,
}

impl FieldError {
    fn new(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for FieldError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.path, self.message)
    }
}

/// All problems found while validating a ClusterCIDR
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid ClusterCIDR: {}", join(.0))]
pub struct ValidationErrors(pub Vec<FieldError>);

fn join(errors: &[FieldError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

impl ValidationErrors {
    fn into_result<T>(self, value: T) -> Result<T, Self> {
        if self.0.is_empty() { Ok(value) } else { Err(self) }
    }
}

/// Validates a ClusterCIDR spec and returns its families in IPv4, IPv6 order.
///
/// # Errors
///
/// Returns every problem found: missing families, unparsable blocks, host
/// bits out of `[4, familyBits - prefixLen]`, and malformed node selector
/// requirements.
pub fn validate_spec(spec: &ClusterCIDRSpec) -> Result<Vec<FamilyBlock>, ValidationErrors> {
    let mut errors = Vec::new();

    if let Some(selector) = &spec.node_selector {
        validate_node_selector(selector, "spec.nodeSelector", &mut errors);
    }

    if spec.ipv4.is_empty() && spec.ipv6.is_empty() {
        errors.push(FieldError::new(
            "spec",
            "one or both of `ipv4` and `ipv6` must be specified",
        ));
        return Err(ValidationErrors(errors));
    }

    let mut families = Vec::with_capacity(2);
    if !spec.ipv4.is_empty() {
        if let Some(block) = validate_cidr_config(
            &spec.ipv4,
            spec.per_node_host_bits4,
            IpFamily::IPv4,
            &mut errors,
        ) {
            families.push(block);
        }
    }
    if !spec.ipv6.is_empty() {
        if let Some(block) = validate_cidr_config(
            &spec.ipv6,
            spec.per_node_host_bits6,
            IpFamily::IPv6,
            &mut errors,
        ) {
            families.push(block);
        }
    }

    ValidationErrors(errors).into_result(families)
}

/// Checks that an update leaves every immutable field untouched.
///
/// # Errors
///
/// Returns one error per changed field.
pub fn validate_update(old: &ClusterCIDRSpec, new: &ClusterCIDRSpec) -> Result<(), ValidationErrors> {
    let mut errors = Vec::new();
    let immutable = "field is immutable";

    if old.node_selector != new.node_selector {
        errors.push(FieldError::new("spec.nodeSelector", immutable));
    }
    if old.per_node_host_bits4 != new.per_node_host_bits4 {
        errors.push(FieldError::new("spec.perNodeHostBits4", immutable));
    }
    if old.per_node_host_bits6 != new.per_node_host_bits6 {
        errors.push(FieldError::new("spec.perNodeHostBits6", immutable));
    }
    if old.ipv4 != new.ipv4 {
        errors.push(FieldError::new("spec.ipv4", immutable));
    }
    if old.ipv6 != new.ipv6 {
        errors.push(FieldError::new("spec.ipv6", immutable));
    }

    ValidationErrors(errors).into_result(())
}

fn validate_cidr_config(
    cidr: &str,
    host_bits: i32,
    family: IpFamily,
    errors: &mut Vec<FieldError>,
) -> Option<FamilyBlock> {
    let (field, bits_field) = match family {
        IpFamily::IPv4 => ("spec.ipv4", "spec.perNodeHostBits4"),
        IpFamily::IPv6 => ("spec.ipv6", "spec.perNodeHostBits6"),
    };

    let Ok(block) = cidr.parse::<IpNet>() else {
        errors.push(FieldError::new(field, format!("must be a valid CIDR: {cidr}")));
        return None;
    };
    if IpFamily::of(&block) != family {
        errors.push(FieldError::new(field, format!("must be a valid {family} CIDR")));
        return None;
    }

    let max_host_bits = i32::from(family.bits()) - i32::from(block.prefix_len());
    if host_bits < MIN_PER_NODE_HOST_BITS {
        errors.push(FieldError::new(
            bits_field,
            format!("must be greater than or equal to {MIN_PER_NODE_HOST_BITS}"),
        ));
        return None;
    }
    if host_bits > max_host_bits {
        errors.push(FieldError::new(
            bits_field,
            format!("must be less than or equal to {max_host_bits}"),
        ));
        return None;
    }

    Some(FamilyBlock {
        family,
        block: block.trunc(),
        host_bits: u8::try_from(host_bits).ok()?,
    })
}

fn validate_node_selector(selector: &NodeSelector, path: &str, errors: &mut Vec<FieldError>) {
    let terms_path = format!("{path}.nodeSelectorTerms");
    if selector.node_selector_terms.is_empty() {
        errors.push(FieldError::new(
            terms_path,
            "must have at least one node selector term",
        ));
        return;
    }

    for (i, term) in selector.node_selector_terms.iter().enumerate() {
        validate_node_selector_term(term, &format!("{terms_path}[{i}]"), errors);
    }
}

fn validate_node_selector_term(term: &NodeSelectorTerm, path: &str, errors: &mut Vec<FieldError>) {
    for (j, req) in term.match_expressions.iter().enumerate() {
        validate_label_requirement(req, &format!("{path}.matchExpressions[{j}]"), errors);
    }
    for (j, req) in term.match_fields.iter().enumerate() {
        validate_field_requirement(req, &format!("{path}.matchFields[{j}]"), errors);
    }
}

fn validate_label_requirement(req: &NodeSelectorRequirement, path: &str, errors: &mut Vec<FieldError>) {
    let values_path = format!("{path}.values");
    match req.operator {
        NodeSelectorOperator::In | NodeSelectorOperator::NotIn => {
            if req.values.is_empty() {
                errors.push(FieldError::new(
                    values_path,
                    "must be specified when `operator` is 'In' or 'NotIn'",
                ));
            }
        }
        NodeSelectorOperator::Exists | NodeSelectorOperator::DoesNotExist => {
            if !req.values.is_empty() {
                errors.push(FieldError::new(
                    values_path,
                    "may not be specified when `operator` is 'Exists' or 'DoesNotExist'",
                ));
            }
        }
        NodeSelectorOperator::Gt | NodeSelectorOperator::Lt => {
            validate_single_integer(req, &values_path, errors);
        }
        NodeSelectorOperator::Unknown => {
            errors.push(FieldError::new(
                format!("{path}.operator"),
                "not a valid selector operator",
            ));
        }
    }

    if let Err(msg) = validate_qualified_name(&req.key) {
        errors.push(FieldError::new(format!("{path}.key"), msg));
    }
}

fn validate_field_requirement(req: &NodeSelectorRequirement, path: &str, errors: &mut Vec<FieldError>) {
    let values_path = format!("{path}.values");
    match req.operator {
        NodeSelectorOperator::In | NodeSelectorOperator::NotIn => {
            if req.values.len() != 1 {
                errors.push(FieldError::new(
                    values_path.clone(),
                    "must be only one value when `operator` is 'In' or 'NotIn' for node field selector",
                ));
            }
        }
        NodeSelectorOperator::Gt | NodeSelectorOperator::Lt => {
            validate_single_integer(req, &values_path, errors);
        }
        NodeSelectorOperator::Exists
        | NodeSelectorOperator::DoesNotExist
        | NodeSelectorOperator::Unknown => {
            errors.push(FieldError::new(
                format!("{path}.operator"),
                "not a valid selector operator",
            ));
        }
    }

    if req.key != NODE_NAME_FIELD {
        errors.push(FieldError::new(
            format!("{path}.key"),
            format!("not a valid field selector key: {}", req.key),
        ));
        return;
    }

    if matches!(req.operator, NodeSelectorOperator::In | NodeSelectorOperator::NotIn) {
        for (i, value) in req.values.iter().enumerate() {
            if let Err(msg) = validate_dns_subdomain(value) {
                errors.push(FieldError::new(format!("{values_path}[{i}]"), msg));
            }
        }
    }
}

fn validate_single_integer(req: &NodeSelectorRequirement, path: &str, errors: &mut Vec<FieldError>) {
    match req.values.as_slice() {
        [value] => {
            if value.parse::<i64>().is_err() {
                errors.push(FieldError::new(
                    format!("{path}[0]"),
                    "must be an integer when `operator` is 'Lt' or 'Gt'",
                ));
            }
        }
        _ => errors.push(FieldError::new(
            path,
            "must be specified single value when `operator` is 'Lt' or 'Gt'",
        )),
    }
}

/// Validates a label key: an optional DNS subdomain prefix and `/`, then a
/// name of at most 63 characters.
fn validate_qualified_name(key: &str) -> Result<(), String> {
    let (prefix, name) = match key.split_once('/') {
        Some((prefix, name)) => (Some(prefix), name),
        None => (None, key),
    };

    if let Some(prefix) = prefix {
        if prefix.is_empty() {
            return Err("prefix part must be non-empty".to_string());
        }
        validate_dns_subdomain(prefix).map_err(|msg| format!("prefix part {msg}"))?;
    }

    if name.is_empty() {
        return Err("name part must be non-empty".to_string());
    }
    if name.len() > MAX_LABEL_NAME_LEN {
        return Err(format!(
            "name part must be no more than {MAX_LABEL_NAME_LEN} characters"
        ));
    }
    let valid_chars = name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    if !valid_chars || !starts_and_ends_alphanumeric(name) {
        return Err(format!(
            "name part must consist of alphanumeric characters, '-', '_' or '.', and must start and end with an alphanumeric character: {name}"
        ));
    }
    Ok(())
}

fn validate_dns_subdomain(value: &str) -> Result<(), String> {
    if value.is_empty() || value.len() > MAX_DNS_SUBDOMAIN_LEN {
        return Err(format!(
            "must be a DNS subdomain of 1 to {MAX_DNS_SUBDOMAIN_LEN} characters"
        ));
    }
    let valid = value.split('.').all(|label| {
        !label.is_empty()
            && label
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
            && starts_and_ends_alphanumeric(label)
    });
    if valid {
        Ok(())
    } else {
        Err(format!(
            "must consist of lower case alphanumeric characters, '-' or '.', and must start and end with an alphanumeric character: {value}"
        ))
    }
}

fn starts_and_ends_alphanumeric(s: &str) -> bool {
    let bytes = s.as_bytes();
    matches!((bytes.first(), bytes.last()), (Some(first), Some(last))
        if first.is_ascii_alphanumeric() && last.is_ascii_alphanumeric())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn selector(key: &str, op: NodeSelectorOperator, values: &[&str]) -> Option<NodeSelector> {
        Some(NodeSelector {
            node_selector_terms: vec![NodeSelectorTerm {
                match_expressions: vec![NodeSelectorRequirement::new(key, op, values.iter().copied())],
                match_fields: vec![],
            }],
        })
    }

    fn spec(host_bits: i32, ipv4: &str, ipv6: &str, node_selector: Option<NodeSelector>) -> ClusterCIDRSpec {
        ClusterCIDRSpec {
            node_selector,
            per_node_host_bits4: host_bits,
            per_node_host_bits6: host_bits,
            ipv4: ipv4.to_string(),
            ipv6: ipv6.to_string(),
        }
    }

    fn foo_bar() -> Option<NodeSelector> {
        selector("foo", NodeSelectorOperator::In, &["bar"])
    }

    #[test]
    fn test_valid_specs() {
        let cases = [
            ("single stack IPv4", spec(8, "10.1.0.0/16", "", foo_bar())),
            ("IPv4, host bits = max", spec(16, "10.1.0.0/16", "", foo_bar())),
            ("IPv4, host bits = min", spec(4, "10.1.0.0/16", "", foo_bar())),
            ("single stack IPv6", spec(8, "", "fd00:1:1::/64", foo_bar())),
            ("IPv6, host bits = max", spec(64, "", "fd00:1:1::/64", foo_bar())),
            ("IPv6, host bits = min", spec(4, "", "fd00:1:1::/64", foo_bar())),
            ("IPv6, host bits = 100", spec(100, "", "fd00:1:1::/16", foo_bar())),
            ("dual stack", spec(8, "10.1.0.0/16", "fd00:1:1::/64", foo_bar())),
            ("dual stack, no selector", spec(8, "10.1.0.0/16", "fd00:1:1::/64", None)),
        ];

        for (name, spec) in cases {
            assert!(validate_spec(&spec).is_ok(), "{name} should be valid: {:?}", validate_spec(&spec));
        }
    }

    #[test]
    fn test_invalid_specs() {
        let cases = [
            ("no IPv4 or IPv6", spec(8, "", "", None)),
            (
                "invalid selector key",
                spec(8, "10.1.0.0/16", "fd00:1:1::/64",
                    selector("NoUppercaseOrSpecialCharsLike=Equals", NodeSelectorOperator::In, &["bar"])),
            ),
            ("invalid IPv4", spec(8, "test", "", foo_bar())),
            ("IPv4 host bits > max", spec(100, "10.1.0.0/16", "", foo_bar())),
            ("IPv4 host bits < min", spec(2, "10.1.0.0/16", "", foo_bar())),
            ("invalid IPv6", spec(8, "", "testv6", foo_bar())),
            ("IPv4 CIDR in ipv6", spec(8, "", "10.2.0.0/16", foo_bar())),
            ("IPv6 host bits > max", spec(12, "", "fd00::/120", foo_bar())),
            ("IPv6 host bits < min", spec(3, "", "fd00::/120", foo_bar())),
            ("dual stack, invalid IPv6", spec(8, "10.1.0.0/16", "testv6", foo_bar())),
            ("dual stack, invalid IPv4", spec(8, "testv4", "fd00::/120", foo_bar())),
            ("dual stack, host bits > IPv4 max", spec(24, "10.1.0.0/16", "fd00:1:1::/64", foo_bar())),
            ("IPv6 CIDR in ipv4", spec(8, "fd00::/120", "fd00:1:1::/64", foo_bar())),
        ];

        for (name, spec) in cases {
            assert!(validate_spec(&spec).is_err(), "{name} should be invalid");
        }
    }

    #[test]
    fn test_families_in_order_and_normalized() {
        let families = validate_spec(&spec(8, "10.1.2.3/16", "fd00:1:1::/64", None)).unwrap();
        assert_eq!(families.len(), 2);
        assert_eq!(families[0].family, IpFamily::IPv4);
        assert_eq!(families[0].block.to_string(), "10.1.0.0/16");
        assert_eq!(families[1].family, IpFamily::IPv6);
        assert_eq!(families[1].host_bits, 8);
    }

    #[test]
    fn test_selector_operator_arity() {
        let cases = [
            (NodeSelectorOperator::In, vec![], false),
            (NodeSelectorOperator::NotIn, vec!["a"], true),
            (NodeSelectorOperator::Exists, vec![], true),
            (NodeSelectorOperator::Exists, vec!["a"], false),
            (NodeSelectorOperator::DoesNotExist, vec!["a"], false),
            (NodeSelectorOperator::Gt, vec!["1"], true),
            (NodeSelectorOperator::Gt, vec!["1", "2"], false),
            (NodeSelectorOperator::Lt, vec!["abc"], false),
            (NodeSelectorOperator::Unknown, vec!["a"], false),
        ];

        for (op, values, ok) in cases {
            let spec = spec(8, "10.1.0.0/16", "", selector("foo", op, &values));
            assert_eq!(validate_spec(&spec).is_ok(), ok, "{op} {values:?}");
        }
    }

    #[test]
    fn test_field_selector_rules() {
        let with_field = |req: NodeSelectorRequirement| {
            spec(8, "10.1.0.0/16", "", Some(NodeSelector {
                node_selector_terms: vec![NodeSelectorTerm {
                    match_expressions: vec![],
                    match_fields: vec![req],
                }],
            }))
        };

        let ok = with_field(NodeSelectorRequirement::new(NODE_NAME_FIELD, NodeSelectorOperator::In, ["node-1"]));
        assert!(validate_spec(&ok).is_ok());

        let two_values = with_field(NodeSelectorRequirement::new(NODE_NAME_FIELD, NodeSelectorOperator::In, ["a", "b"]));
        assert!(validate_spec(&two_values).is_err());

        let bad_key = with_field(NodeSelectorRequirement::new("metadata.uid", NodeSelectorOperator::In, ["a"]));
        assert!(validate_spec(&bad_key).is_err());

        let exists = with_field(NodeSelectorRequirement::new(NODE_NAME_FIELD, NodeSelectorOperator::Exists, Vec::<String>::new()));
        assert!(validate_spec(&exists).is_err());

        let bad_name = with_field(NodeSelectorRequirement::new(NODE_NAME_FIELD, NodeSelectorOperator::In, ["Not_A_Name"]));
        assert!(validate_spec(&bad_name).is_err());
    }

    #[test]
    fn test_empty_selector_terms_rejected() {
        let spec = spec(8, "10.1.0.0/16", "", Some(NodeSelector::default()));
        let err = validate_spec(&spec).unwrap_err();
        assert_eq!(err.0[0].path, "spec.nodeSelector.nodeSelectorTerms");
    }

    #[test]
    fn test_all_errors_collected() {
        let spec = spec(2, "test", "fd00::/120", Some(NodeSelector::default()));
        let err = validate_spec(&spec).unwrap_err();
        assert_eq!(err.0.len(), 3, "{err}");
    }

    #[test]
    fn test_qualified_names() {
        assert!(validate_qualified_name("foo").is_ok());
        assert!(validate_qualified_name("topology.kubernetes.io/zone").is_ok());
        assert!(validate_qualified_name("a.b_c-d").is_ok());
        assert!(validate_qualified_name("-foo").is_err());
        assert!(validate_qualified_name("/foo").is_err());
        assert!(validate_qualified_name("Example.com/foo").is_err());
        assert!(validate_qualified_name(&"a".repeat(64)).is_err());
    }

    #[test]
    fn test_validate_update() {
        let old = spec(8, "10.1.0.0/16", "fd00:1:1::/64", foo_bar());

        assert!(validate_update(&old, &old.clone()).is_ok());
        assert!(validate_update(&old, &spec(12, "10.1.0.0/16", "fd00:1:1::/64", foo_bar())).is_err());
        assert!(validate_update(&old, &spec(8, "10.2.0.0/16", "fd00:1:1::/64", foo_bar())).is_err());
        assert!(validate_update(&old, &spec(8, "10.1.0.0/16", "fd00:2::/112", foo_bar())).is_err());
        assert!(validate_update(
            &old,
            &spec(8, "10.1.0.0/16", "fd00:1:1::/64", selector("foo", NodeSelectorOperator::In, &["bar2"]))
        )
        .is_err());
    }
}
