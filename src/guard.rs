//! Guard expression evaluation (§3, §4.5, §4.12).
//!
//! A [`GuardExpression`] is evaluated against a small JSON context map using
//! dotted field paths. An unknown field path is not an error — it compares
//! against `Value::Null` like any other missing field, per §4.12. Malformed
//! *shape* (e.g. `logic` without `conditions`) cannot be constructed at all
//! here since `GuardExpression`'s untagged deserialization already rejects it
//! at topology-load time (`IntegrityError`); this module only ever sees
//! well-shaped expressions.

use serde_json::Value;

use crate::model::{GuardExpression, GuardLogic, GuardOp};

/// Resolve a dotted path (`"decision.kind"`) against a JSON object, returning
/// `Value::Null` for any missing segment.
fn resolve_path<'a>(context: &'a Value, path: &str) -> &'a Value {
    let mut current = context;
    for segment in path.split('.') {
        match current.get(segment) {
            Some(next) => current = next,
            None => return &Value::Null,
        }
    }
    current
}

fn compare(op: GuardOp, lhs: &Value, rhs: &Value) -> bool {
    match op {
        GuardOp::Eq => lhs == rhs,
        GuardOp::Ne => lhs != rhs,
        GuardOp::Lt | GuardOp::Le | GuardOp::Gt | GuardOp::Ge => {
            let (Some(l), Some(r)) = (lhs.as_f64(), rhs.as_f64()) else {
                return false;
            };
            match op {
                GuardOp::Lt => l < r,
                GuardOp::Le => l <= r,
                GuardOp::Gt => l > r,
                GuardOp::Ge => l >= r,
                GuardOp::Eq | GuardOp::Ne => unreachable!(),
            }
        }
    }
}

/// Evaluate a guard expression against a context map.
pub fn evaluate(expr: &GuardExpression, context: &Value) -> bool {
    match expr {
        GuardExpression::Leaf { field, op, value } => {
            compare(*op, resolve_path(context, field), value)
        }
        GuardExpression::Logic { logic, conditions } => match logic {
            GuardLogic::And => conditions.iter().all(|c| evaluate(c, context)),
            GuardLogic::Or => conditions.iter().any(|c| evaluate(c, context)),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn leaf_equality_matches_routing_decision_kind() {
        let expr = GuardExpression::Leaf {
            field: "decision".into(),
            op: GuardOp::Eq,
            value: json!("changes_requested"),
        };
        assert!(evaluate(&expr, &json!({"decision": "changes_requested"})));
        assert!(!evaluate(&expr, &json!({"decision": "approved"})));
    }

    #[test]
    fn unknown_field_path_compares_against_null_not_an_error() {
        let expr = GuardExpression::Leaf {
            field: "decision.nested.missing".into(),
            op: GuardOp::Eq,
            value: Value::Null,
        };
        assert!(evaluate(&expr, &json!({"decision": {"kind": "x"}})));
    }

    #[test]
    fn and_or_combine_leaves() {
        let a = GuardExpression::Leaf {
            field: "score".into(),
            op: GuardOp::Ge,
            value: json!(3),
        };
        let b = GuardExpression::Leaf {
            field: "status".into(),
            op: GuardOp::Eq,
            value: json!("ok"),
        };
        let and_expr = GuardExpression::Logic {
            logic: GuardLogic::And,
            conditions: vec![a.clone(), b.clone()],
        };
        assert!(evaluate(&and_expr, &json!({"score": 5, "status": "ok"})));
        assert!(!evaluate(&and_expr, &json!({"score": 1, "status": "ok"})));

        let or_expr = GuardExpression::Logic {
            logic: GuardLogic::Or,
            conditions: vec![a, b],
        };
        assert!(evaluate(&or_expr, &json!({"score": 1, "status": "ok"})));
    }

    #[test]
    fn numeric_comparisons_use_f64() {
        let expr = GuardExpression::Leaf {
            field: "n".into(),
            op: GuardOp::Lt,
            value: json!(10),
        };
        assert!(evaluate(&expr, &json!({"n": 9.5})));
        assert!(!evaluate(&expr, &json!({"n": 10})));
    }
}
