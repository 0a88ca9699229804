//! Boolean evaluation of phase conditions against instance variables.

use serde_json::{Map, Value};
use std::cmp::Ordering;

use super::schema::{ComparisonOperator, ConditionExpression, ConditionNode, ConditionTerm, LogicalOperator};

/// Evaluate `expr` against `variables`.
///
/// Total over parsed expressions: operators were validated when the schema was
/// built. A dotted path that does not resolve compares as `null`; ordering
/// comparisons between values of different kinds are false.
pub fn evaluate(expr: &ConditionExpression, variables: &Map<String, Value>) -> bool {
    match expr.operator {
        LogicalOperator::And => expr.operands.iter().all(|node| evaluate_node(node, variables)),
        LogicalOperator::Or => expr.operands.iter().any(|node| evaluate_node(node, variables)),
        LogicalOperator::Not => !expr
            .operands
            .first()
            .map(|node| evaluate_node(node, variables))
            .unwrap_or(false),
    }
}

fn evaluate_node(node: &ConditionNode, variables: &Map<String, Value>) -> bool {
    match node {
        ConditionNode::Term(term) => evaluate_term(term, variables),
        ConditionNode::Expression(expr) => evaluate(expr, variables),
    }
}

fn evaluate_term(term: &ConditionTerm, variables: &Map<String, Value>) -> bool {
    let actual = lookup_path(&term.field, variables).unwrap_or(&Value::Null);

    match term.operator {
        ComparisonOperator::Eq => values_equal(actual, &term.value),
        ComparisonOperator::Ne => !values_equal(actual, &term.value),
        ComparisonOperator::Gt => compare(actual, &term.value) == Some(Ordering::Greater),
        ComparisonOperator::Lt => compare(actual, &term.value) == Some(Ordering::Less),
        ComparisonOperator::Ge => matches!(
            compare(actual, &term.value),
            Some(Ordering::Greater | Ordering::Equal)
        ),
        ComparisonOperator::Le => matches!(
            compare(actual, &term.value),
            Some(Ordering::Less | Ordering::Equal)
        ),
    }
}

/// Resolve `code.risk_level` style paths through nested maps.
pub fn lookup_path<'a>(path: &str, variables: &'a Map<String, Value>) -> Option<&'a Value> {
    let mut segments = path.split('.');
    let mut current = variables.get(segments.next()?)?;
    for segment in segments {
        current = current.as_object()?.get(segment)?;
    }
    Some(current)
}

fn values_equal(left: &Value, right: &Value) -> bool {
    match (left, right) {
        (Value::Number(l), Value::Number(r)) => match (l.as_f64(), r.as_f64()) {
            (Some(l), Some(r)) => l == r,
            _ => l == r,
        },
        _ => left == right,
    }
}

fn compare(left: &Value, right: &Value) -> Option<Ordering> {
    match (left, right) {
        (Value::Number(l), Value::Number(r)) => l.as_f64()?.partial_cmp(&r.as_f64()?),
        (Value::String(l), Value::String(r)) => Some(l.cmp(r)),
        (Value::Bool(l), Value::Bool(r)) => Some(l.cmp(r)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    fn vars(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap()
    }

    fn term(field: &str, op: ComparisonOperator, value: Value) -> ConditionNode {
        ConditionTerm::new(field, op, value).into()
    }

    #[test]
    fn test_dotted_path_lookup() {
        let variables = vars(json!({"code": {"risk_level": 4, "meta": {"lang": "rust"}}}));

        assert_eq!(lookup_path("code.risk_level", &variables), Some(&json!(4)));
        assert_eq!(lookup_path("code.meta.lang", &variables), Some(&json!("rust")));
        assert_eq!(lookup_path("code.missing", &variables), None);
        assert_eq!(lookup_path("code.risk_level.deeper", &variables), None);
    }

    #[test]
    fn test_comparison_operators() {
        let variables = vars(json!({"score": 7, "name": "beta", "ok": true}));
        let check = |op, value| evaluate(&ConditionExpression::and(vec![term("score", op, value)]), &variables);

        assert!(check(ComparisonOperator::Eq, json!(7)));
        assert!(check(ComparisonOperator::Eq, json!(7.0)));
        assert!(check(ComparisonOperator::Ne, json!(8)));
        assert!(check(ComparisonOperator::Gt, json!(6)));
        assert!(!check(ComparisonOperator::Gt, json!(7)));
        assert!(check(ComparisonOperator::Ge, json!(7)));
        assert!(check(ComparisonOperator::Lt, json!(7.5)));
        assert!(check(ComparisonOperator::Le, json!(7)));

        let by_name = ConditionExpression::and(vec![term("name", ComparisonOperator::Gt, json!("alpha"))]);
        assert!(evaluate(&by_name, &variables));
    }

    #[test]
    fn test_missing_path_is_absent() {
        let variables = vars(json!({}));

        let eq_null = ConditionExpression::and(vec![term("a.b", ComparisonOperator::Eq, Value::Null)]);
        let ne_value = ConditionExpression::and(vec![term("a.b", ComparisonOperator::Ne, json!(1))]);
        let gt_value = ConditionExpression::and(vec![term("a.b", ComparisonOperator::Gt, json!(1))]);

        assert!(evaluate(&eq_null, &variables));
        assert!(evaluate(&ne_value, &variables));
        assert!(!evaluate(&gt_value, &variables));
    }

    #[test]
    fn test_mixed_kinds_do_not_order() {
        let variables = vars(json!({"level": "high"}));
        let gt = ConditionExpression::and(vec![term("level", ComparisonOperator::Gt, json!(2))]);
        let le = ConditionExpression::and(vec![term("level", ComparisonOperator::Le, json!(2))]);

        assert!(!evaluate(&gt, &variables));
        assert!(!evaluate(&le, &variables));
    }

    #[test]
    fn test_combinators() {
        let variables = vars(json!({"a": 1, "b": 2}));
        let a_is_1 = term("a", ComparisonOperator::Eq, json!(1));
        let b_is_3 = term("b", ComparisonOperator::Eq, json!(3));

        assert!(!evaluate(&ConditionExpression::and(vec![a_is_1.clone(), b_is_3.clone()]), &variables));
        assert!(evaluate(&ConditionExpression::or(vec![a_is_1.clone(), b_is_3.clone()]), &variables));
        assert!(evaluate(&ConditionExpression::not(b_is_3.clone()), &variables));

        let nested = ConditionExpression::and(vec![
            a_is_1,
            ConditionExpression::not(ConditionExpression::or(vec![b_is_3])).into(),
        ]);
        assert!(evaluate(&nested, &variables));
    }

    proptest! {
        #[test]
        fn prop_not_inverts(x in -1000i64..1000, threshold in -1000i64..1000) {
            let variables = vars(json!({"metrics": {"x": x}}));
            let base = ConditionExpression::and(vec![term("metrics.x", ComparisonOperator::Ge, json!(threshold))]);
            let negated = ConditionExpression::not(base.clone());

            prop_assert_eq!(evaluate(&base, &variables), x >= threshold);
            prop_assert_eq!(evaluate(&negated, &variables), x < threshold);
        }
    }
}
