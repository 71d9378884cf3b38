//! Placement constraint parsing and node matching.
//!
//! Expressions take the form `key==value` or `key!=value`. Supported keys:
//! `node.id`, `node.name`, `node.hostname`, `node.role`, `node.platform.os`,
//! `node.platform.arch` and `node.labels.<label>`.

use once_cell::sync::Lazy;
use regex_lite::Regex;

use crate::cluster::Node;
use crate::error::{DroverError, Result};

static KEY_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z0-9._-]+$").expect("constraint key pattern is valid"));

/// Comparison operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operator {
    Eq,
    NotEq,
}

impl Operator {
    fn as_str(&self) -> &'static str {
        match self {
            Self::Eq => "==",
            Self::NotEq => "!=",
        }
    }
}

/// A compiled placement constraint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Constraint {
    pub key: String,
    pub operator: Operator,
    pub exp: String,
}

impl Constraint {
    /// Parse a single expression.
    pub fn parse(expression: &str) -> Result<Self> {
        // `!=` must be checked first so `a!=b` is not read as key `a!`.
        let (key, operator, exp) = [Operator::NotEq, Operator::Eq]
            .into_iter()
            .find_map(|op| {
                expression
                    .split_once(op.as_str())
                    .map(|(k, v)| (k.trim(), op, v.trim()))
            })
            .ok_or_else(|| {
                DroverError::InvalidConstraint(format!(
                    "expression '{}' has no operator",
                    expression
                ))
            })?;

        if !KEY_PATTERN.is_match(key) {
            return Err(DroverError::InvalidConstraint(format!(
                "invalid key '{}' in '{}'",
                key, expression
            )));
        }
        if exp.is_empty() {
            return Err(DroverError::InvalidConstraint(format!(
                "empty value in '{}'",
                expression
            )));
        }

        Ok(Self {
            key: key.to_string(),
            operator,
            exp: exp.to_string(),
        })
    }

    /// Parse every expression, failing on the first invalid one.
    pub fn parse_all<S: AsRef<str>>(expressions: &[S]) -> Result<Vec<Self>> {
        expressions.iter().map(|e| Self::parse(e.as_ref())).collect()
    }

    /// Evaluate against a node.
    pub fn matches(&self, node: &Node) -> bool {
        let lowered = self.key.to_ascii_lowercase();
        let actual: Option<String> = match lowered.as_str() {
            "node.id" => Some(node.id.to_string()),
            "node.name" => Some(node.spec.name.clone()),
            "node.hostname" => node.hostname().map(str::to_string),
            "node.role" => Some(node.spec.role.as_str().to_string()),
            "node.platform.os" => node.description.as_ref().map(|d| d.platform.os.clone()),
            "node.platform.arch" => node
                .description
                .as_ref()
                .map(|d| d.platform.architecture.clone()),
            _ => match self.key.get("node.labels.".len()..) {
                Some(label) if lowered.starts_with("node.labels.") => {
                    node.spec.labels.get(label).cloned()
                }
                // Unknown keys never match.
                _ => return false,
            },
        };

        match (self.operator, actual) {
            (Operator::Eq, Some(value)) => value.eq_ignore_ascii_case(&self.exp),
            (Operator::Eq, None) => false,
            (Operator::NotEq, Some(value)) => !value.eq_ignore_ascii_case(&self.exp),
            (Operator::NotEq, None) => true,
        }
    }
}

impl std::fmt::Display for Constraint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}{}{}", self.key, self.operator.as_str(), self.exp)
    }
}

/// Whether a node satisfies every constraint.
pub fn node_matches(constraints: &[Constraint], node: &Node) -> bool {
    constraints.iter().all(|c| c.matches(node))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::{NodeDescription, NodeRole, Platform};
    use crate::id::NodeId;

    fn labelled_node() -> Node {
        let mut node = Node::new(NodeId::new());
        node.spec.name = "edge-1".to_string();
        node.spec.labels.insert("zone".to_string(), "east".to_string());
        node.description = Some(NodeDescription {
            hostname: "host-a".to_string(),
            platform: Platform {
                os: "linux".to_string(),
                architecture: "x86_64".to_string(),
            },
        });
        node
    }

    #[test]
    fn test_parse_operators() {
        let eq = Constraint::parse("node.labels.zone == east").unwrap();
        assert_eq!(eq.key, "node.labels.zone");
        assert_eq!(eq.operator, Operator::Eq);
        assert_eq!(eq.exp, "east");

        let ne = Constraint::parse("node.role!=manager").unwrap();
        assert_eq!(ne.operator, Operator::NotEq);
        assert_eq!(ne.to_string(), "node.role!=manager");
    }

    #[test]
    fn test_parse_rejects_invalid() {
        assert!(Constraint::parse("node.role").is_err());
        assert!(Constraint::parse("==worker").is_err());
        assert!(Constraint::parse("node.role==").is_err());
        assert!(Constraint::parse("node role==worker").is_err());
        assert!(Constraint::parse_all(&["node.role==worker", "bogus"]).is_err());
    }

    #[test]
    fn test_matches_attributes() {
        let node = labelled_node();
        let id_expr = format!("node.id=={}", node.id);
        let constraints = Constraint::parse_all(&[
            id_expr.as_str(),
            "node.hostname==HOST-A",
            "node.name==edge-1",
            "node.role==worker",
            "node.platform.os==linux",
            "node.platform.arch!=arm64",
            "node.labels.zone==east",
        ])
        .unwrap();
        assert!(node_matches(&constraints, &node));
    }

    #[test]
    fn test_missing_and_unknown_keys() {
        let node = labelled_node();

        let missing_eq = Constraint::parse("node.labels.rack==r1").unwrap();
        assert!(!missing_eq.matches(&node));

        let missing_ne = Constraint::parse("node.labels.rack!=r1").unwrap();
        assert!(missing_ne.matches(&node));

        let unknown = Constraint::parse("engine.version!=1").unwrap();
        assert!(!unknown.matches(&node));
    }

    #[test]
    fn test_role_mismatch() {
        let mut node = labelled_node();
        node.spec.role = NodeRole::Manager;
        let constraints = Constraint::parse_all(&["node.role==worker"]).unwrap();
        assert!(!node_matches(&constraints, &node));
        assert!(node_matches(&[], &node));
    }
}
