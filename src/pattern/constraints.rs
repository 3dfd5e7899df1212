//! Binding constraints.
//!
//! Constraints are declarative so patterns stay plain YAML:
//!
//! ```yaml
//! constraints:
//!   - forbid: { container: set, op: index }
//!   - require:
//!       if: { kind: float }
//!       then: { fmt: ["%.2f", "%.3f"] }
//!   - distinct: [left, right]
//! ```

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::error::PatternError;
use crate::generator::BindingAssignment;
use crate::pattern::schema::{Pattern, Scalar};

/// A predicate over a complete binding assignment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawConstraint", into = "RawConstraint")]
pub enum Constraint {
    /// The listed values may not all occur together.
    Forbid(BTreeMap<String, String>),
    /// When every `when` pair holds, each `then` placeholder must take one of
    /// the listed values.
    Require {
        when: BTreeMap<String, String>,
        then: BTreeMap<String, Vec<String>>,
    },
    /// The listed placeholders take pairwise different values.
    Distinct(Vec<String>),
}

impl Constraint {
    /// Returns true if the assignment satisfies this constraint.
    pub fn is_satisfied(&self, assignment: &BindingAssignment) -> bool {
        let matches_all = |pairs: &BTreeMap<String, String>| {
            pairs
                .iter()
                .all(|(ph, value)| assignment.get(ph) == Some(value.as_str()))
        };

        match self {
            Constraint::Forbid(pairs) => !matches_all(pairs),
            Constraint::Require { when, then } => {
                if !matches_all(when) {
                    return true;
                }
                then.iter().all(|(ph, allowed)| {
                    assignment
                        .get(ph)
                        .map(|v| allowed.iter().any(|a| a == v))
                        .unwrap_or(false)
                })
            }
            Constraint::Distinct(placeholders) => {
                let mut seen = BTreeSet::new();
                placeholders
                    .iter()
                    .filter_map(|ph| assignment.get(ph))
                    .all(|v| seen.insert(v))
            }
        }
    }

    /// Checks that every placeholder and value named by the constraint exists
    /// in the pattern's pools.
    pub fn validate(&self, pattern: &Pattern) -> Result<(), PatternError> {
        let invalid = |message: String| PatternError::InvalidConstraint {
            pattern: pattern.id.clone(),
            message,
        };
        let check_pair = |ph: &str, value: &str| -> Result<(), PatternError> {
            let pool = pattern
                .bindings
                .get(ph)
                .ok_or_else(|| invalid(format!("unknown placeholder '{}'", ph)))?;
            if pool.iter().any(|b| b.value == value) {
                Ok(())
            } else {
                Err(invalid(format!(
                    "value '{}' is not in the pool of '{}'",
                    value, ph
                )))
            }
        };

        match self {
            Constraint::Forbid(pairs) => {
                if pairs.is_empty() {
                    return Err(invalid("'forbid' needs at least one pair".to_string()));
                }
                for (ph, value) in pairs {
                    check_pair(ph, value)?;
                }
            }
            Constraint::Require { when, then } => {
                if when.is_empty() || then.is_empty() {
                    return Err(invalid(
                        "'require' needs non-empty 'if' and 'then'".to_string(),
                    ));
                }
                for (ph, value) in when {
                    check_pair(ph, value)?;
                }
                for (ph, allowed) in then {
                    if allowed.is_empty() {
                        return Err(invalid(format!(
                            "'then' lists no allowed values for '{}'",
                            ph
                        )));
                    }
                    for value in allowed {
                        check_pair(ph, value)?;
                    }
                }
            }
            Constraint::Distinct(placeholders) => {
                if placeholders.len() < 2 {
                    return Err(invalid(
                        "'distinct' needs at least two placeholders".to_string(),
                    ));
                }
                if let Some(ph) = placeholders
                    .iter()
                    .find(|ph| !pattern.bindings.contains_key(*ph))
                {
                    return Err(invalid(format!("unknown placeholder '{}'", ph)));
                }
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct RawRequire {
    #[serde(rename = "if")]
    when: BTreeMap<String, Scalar>,
    then: BTreeMap<String, Vec<Scalar>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawConstraint {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    forbid: Option<BTreeMap<String, Scalar>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    require: Option<RawRequire>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    distinct: Option<Vec<String>>,
}

fn texts(pairs: BTreeMap<String, Scalar>) -> BTreeMap<String, String> {
    pairs.into_iter().map(|(k, v)| (k, v.into_text())).collect()
}

impl TryFrom<RawConstraint> for Constraint {
    type Error = String;

    fn try_from(raw: RawConstraint) -> Result<Self, Self::Error> {
        match (raw.forbid, raw.require, raw.distinct) {
            (Some(pairs), None, None) => Ok(Constraint::Forbid(texts(pairs))),
            (None, Some(req), None) => Ok(Constraint::Require {
                when: texts(req.when),
                then: req
                    .then
                    .into_iter()
                    .map(|(k, vs)| (k, vs.into_iter().map(Scalar::into_text).collect()))
                    .collect(),
            }),
            (None, None, Some(list)) => Ok(Constraint::Distinct(list)),
            _ => Err(
                "a constraint must have exactly one of 'forbid', 'require' or 'distinct'"
                    .to_string(),
            ),
        }
    }
}

impl From<Constraint> for RawConstraint {
    fn from(constraint: Constraint) -> Self {
        let scalars = |pairs: BTreeMap<String, String>| {
            pairs
                .into_iter()
                .map(|(k, v)| (k, Scalar::Text(v)))
                .collect()
        };
        match constraint {
            Constraint::Forbid(pairs) => RawConstraint {
                forbid: Some(scalars(pairs)),
                ..Default::default()
            },
            Constraint::Require { when, then } => RawConstraint {
                require: Some(RawRequire {
                    when: scalars(when),
                    then: then
                        .into_iter()
                        .map(|(k, vs)| (k, vs.into_iter().map(Scalar::Text).collect()))
                        .collect(),
                }),
                ..Default::default()
            },
            Constraint::Distinct(list) => RawConstraint {
                distinct: Some(list),
                ..Default::default()
            },
        }
    }
}
