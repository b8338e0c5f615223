// Predicate trees for `find` and the shared operator-evaluation primitive.
// Workflow conditions (action module) evaluate through the same `compare`.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Comparison operators usable in `find` predicates and workflow conditions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Op {
    #[serde(rename = "==")]
    Eq,
    #[serde(rename = "!=")]
    Ne,
    #[serde(rename = ">")]
    Gt,
    #[serde(rename = ">=")]
    Ge,
    #[serde(rename = "<")]
    Lt,
    #[serde(rename = "<=")]
    Le,
    #[serde(rename = "contains")]
    Contains,
    #[serde(rename = "notContains")]
    NotContains,
}

/// A predicate tree. Leaves compare a named field against a literal value;
/// branches combine sub-predicates with short-circuit AND/OR.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Where {
    And { and: Vec<Where> },
    Or { or: Vec<Where> },
    Cond(Condition),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Condition {
    pub name: String,
    pub op: Op,
    pub value: Value,
}

/// Evaluate one operator over two values. Numbers compare numerically
/// (integers and floats interchangeably), strings lexicographically;
/// ordering operators on mismatched types are false.
pub fn compare(op: Op, left: &Value, right: &Value) -> bool {
    match op {
        Op::Eq => loose_eq(left, right),
        Op::Ne => !loose_eq(left, right),
        Op::Gt | Op::Ge | Op::Lt | Op::Le => {
            let ordering = if let (Some(a), Some(b)) = (left.as_f64(), right.as_f64()) {
                a.partial_cmp(&b)
            } else if let (Some(a), Some(b)) = (left.as_str(), right.as_str()) {
                Some(a.cmp(b))
            } else {
                None
            };
            match (op, ordering) {
                (Op::Gt, Some(o)) => o.is_gt(),
                (Op::Ge, Some(o)) => o.is_ge(),
                (Op::Lt, Some(o)) => o.is_lt(),
                (Op::Le, Some(o)) => o.is_le(),
                _ => false,
            }
        }
        Op::Contains => contains(left, right),
        Op::NotContains => !contains(left, right),
    }
}

/// Equality that treats 1 and 1.0 as equal, matching how callers author
/// comparisons against numbers of either flavor.
pub fn loose_eq(left: &Value, right: &Value) -> bool {
    if let (Some(a), Some(b)) = (left.as_f64(), right.as_f64()) {
        return a == b;
    }
    left == right
}

fn contains(left: &Value, right: &Value) -> bool {
    match left {
        Value::Array(items) => items.iter().any(|item| loose_eq(item, right)),
        Value::String(s) => right.as_str().map(|r| s.contains(r)).unwrap_or(false),
        _ => false,
    }
}

/// Evaluate a predicate tree against a field resolver. AND stops at the
/// first false, OR at the first true. A leaf whose field does not resolve
/// is false.
pub fn evaluate<F>(predicate: &Where, resolve: &F) -> bool
where
    F: Fn(&str) -> Option<Value>,
{
    match predicate {
        Where::And { and } => and.iter().all(|p| evaluate(p, resolve)),
        Where::Or { or } => or.iter().any(|p| evaluate(p, resolve)),
        Where::Cond(condition) => match resolve(&condition.name) {
            Some(field) => compare(condition.op, &field, &condition.value),
            None => false,
        },
    }
}
