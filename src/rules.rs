//! Rule compilation: raw `create_rule` payloads in, normalized
//! [`RuleDefinition`]s out. Nothing here evaluates a condition.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tracing::{debug, warn};

use crate::error::RuleError;
use crate::models::{
    field_kind, suggest_field, BooleanOperator, Condition, ConditionValue, FieldKind, Operator,
    RuleDefinition,
};

/// Key holding the company name in each processed feature map.
pub const RESERVED_FEATURE_NAME: &str = "company";

/// Body of a `create_rule` request.
#[derive(Debug, Clone, Deserialize)]
pub struct CreateRulesRequest {
    #[serde(default)]
    pub user_name: String,
    #[serde(default)]
    pub rules: Vec<Value>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CreatedRules {
    pub user_name: String,
    pub rules: Vec<RuleDefinition>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CreateRulesResponse {
    pub success: bool,
    pub message: String,
    pub rule: CreatedRules,
}

impl CreateRulesResponse {
    pub fn created(user_name: &str, rules: Vec<RuleDefinition>) -> Self {
        Self {
            success: true,
            message: "Rule created successfully".to_string(),
            rule: CreatedRules {
                user_name: user_name.to_string(),
                rules,
            },
        }
    }
}

/// Compiles every rule of a request. Fails on the first invalid rule and on
/// feature names repeated within the request.
pub fn compile_request(request: &CreateRulesRequest) -> Result<Vec<RuleDefinition>, RuleError> {
    if request.user_name.trim().is_empty() || request.rules.is_empty() {
        return Err(RuleError::malformed("missing user_name or rules"));
    }

    let mut seen = HashSet::new();
    let mut compiled = Vec::with_capacity(request.rules.len());
    for raw in &request.rules {
        let rule = compile(raw)?;
        if !seen.insert(rule.feature_name.clone()) {
            return Err(RuleError::DuplicateRule {
                user_name: request.user_name.clone(),
                feature_name: rule.feature_name,
            });
        }
        compiled.push(rule);
    }
    Ok(compiled)
}

/// Compiles one rule object:
/// `{"input", "feature_name", "match", "default", "operation": {...}}`.
pub fn compile(raw: &Value) -> Result<RuleDefinition, RuleError> {
    let object = raw
        .as_object()
        .ok_or_else(|| RuleError::malformed("rule must be a JSON object"))?;

    let feature_name = required_text(object, "feature_name")?;
    if feature_name == RESERVED_FEATURE_NAME {
        return Err(RuleError::malformed(format!(
            "feature_name '{}' is reserved for the company name in results",
            RESERVED_FEATURE_NAME
        )));
    }
    let input = match object.get("input") {
        None | Some(Value::Null) => feature_name.clone(),
        Some(Value::String(input)) => input.clone(),
        Some(other) => {
            return Err(RuleError::malformed(format!(
                "input must be a string, got {}",
                other
            )));
        }
    };
    let match_value = outcome_value(object, "match")?;
    let default_value = outcome_value(object, "default")?;

    let operation = object
        .get("operation")
        .ok_or_else(|| RuleError::malformed(format!("rule '{}' has no operation", feature_name)))?;
    let (boolean_operator, conditions) = compile_operation(operation)?;

    debug!(
        feature = %feature_name,
        boolean_operator = %boolean_operator,
        conditions = conditions.len(),
        "compiled rule"
    );

    Ok(RuleDefinition {
        input,
        feature_name,
        match_value,
        default_value,
        boolean_operator,
        conditions,
    })
}

/// Normalizes an operation block into a boolean tag plus a flat list of
/// leaves. A boolean block with a single leaf normalizes to `N/A`.
pub fn compile_operation(
    operation: &Value,
) -> Result<(BooleanOperator, Vec<Condition>), RuleError> {
    let object = operation
        .as_object()
        .ok_or_else(|| RuleError::malformed("operation must be a JSON object"))?;

    let boolean_keys: Vec<&String> = object
        .keys()
        .filter(|key| key.eq_ignore_ascii_case("and") || key.eq_ignore_ascii_case("or"))
        .collect();

    match boolean_keys.as_slice() {
        [] => Ok((BooleanOperator::Single, vec![compile_condition(operation)?])),
        [key] => {
            if object.len() > 1 {
                return Err(RuleError::malformed(format!(
                    "'{}' block cannot be mixed with other keys",
                    key
                )));
            }
            let boolean_operator: BooleanOperator = key.parse()?;
            let leaves = object[key.as_str()].as_array().ok_or_else(|| {
                RuleError::malformed(format!("'{}' must hold a list of conditions", key))
            })?;
            if leaves.is_empty() {
                return Err(RuleError::malformed(format!(
                    "'{}' needs at least one condition",
                    key
                )));
            }

            let conditions = leaves
                .iter()
                .map(compile_condition)
                .collect::<Result<Vec<_>, _>>()?;

            if conditions.len() == 1 {
                Ok((BooleanOperator::Single, conditions))
            } else {
                Ok((boolean_operator, conditions))
            }
        }
        _ => Err(RuleError::malformed(
            "operation cannot hold both AND and OR",
        )),
    }
}

fn compile_condition(raw: &Value) -> Result<Condition, RuleError> {
    let object = raw
        .as_object()
        .ok_or_else(|| RuleError::malformed("condition must be a JSON object"))?;

    if object
        .keys()
        .any(|key| key.eq_ignore_ascii_case("and") || key.eq_ignore_ascii_case("or"))
    {
        return Err(RuleError::malformed(
            "nested AND/OR groups are not supported",
        ));
    }

    let target_object = required_text(object, "target_object")?;
    let raw_operator = required_text(object, "operator")?;
    let operator: Operator = raw_operator
        .parse()
        .map_err(|_| RuleError::malformed(format!("unsupported operator '{}'", raw_operator)))?;

    let value = match object.get("value") {
        Some(Value::String(text)) => ConditionValue::Text(text.clone()),
        Some(Value::Number(number)) => ConditionValue::Number(number.clone()),
        Some(Value::Null) | None => {
            return Err(RuleError::malformed(format!(
                "condition on '{}' is missing value",
                target_object
            )));
        }
        Some(other) => {
            return Err(RuleError::malformed(format!(
                "condition value must be a string or number, got {}",
                other
            )));
        }
    };

    match field_kind(&target_object) {
        None => warn!(
            target_object = %target_object,
            suggestion = suggest_field(&target_object).as_deref().unwrap_or("-"),
            "condition targets an unknown company field"
        ),
        Some(FieldKind::Text | FieldKind::Mapping) if operator.is_ordering() => warn!(
            target_object = %target_object,
            operator = %operator,
            "ordering operator on a non-numeric field will fail at evaluation"
        ),
        Some(_) => {}
    }

    Ok(Condition {
        target_object,
        operator,
        value,
    })
}

fn required_text(object: &Map<String, Value>, key: &str) -> Result<String, RuleError> {
    match object.get(key) {
        Some(Value::String(text)) if !text.trim().is_empty() => Ok(text.trim().to_string()),
        _ => Err(RuleError::malformed(format!("missing {}", key))),
    }
}

fn outcome_value(object: &Map<String, Value>, key: &str) -> Result<Value, RuleError> {
    match object.get(key) {
        None | Some(Value::Null) => Ok(json!(0)),
        Some(value @ (Value::Number(_) | Value::String(_) | Value::Bool(_))) => Ok(value.clone()),
        Some(other) => Err(RuleError::malformed(format!(
            "{} must be a scalar, got {}",
            key, other
        ))),
    }
}

/// Re-serializes a compiled rule's conditions into operation-block form.
pub fn to_operation(definition: &RuleDefinition) -> Value {
    let leaves: Vec<Value> = definition
        .conditions
        .iter()
        .map(|condition| {
            json!({
                "target_object": condition.target_object,
                "operator": condition.operator,
                "value": condition.value,
            })
        })
        .collect();

    match definition.boolean_operator {
        BooleanOperator::Single => leaves.into_iter().next().unwrap_or(Value::Null),
        other => {
            let mut block = Map::new();
            block.insert(other.as_str().to_string(), Value::Array(leaves));
            Value::Object(block)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn leaf(target: &str, operator: &str, value: Value) -> Value {
        json!({"target_object": target, "operator": operator, "value": value})
    }

    fn rule_with(operation: Value) -> Value {
        json!({
            "input": "employee_count",
            "feature_name": "is_large_company",
            "match": 1,
            "default": 0,
            "operation": operation,
        })
    }

    #[test]
    fn test_single_condition_is_na() {
        let rule = compile(&rule_with(leaf("total_employees", "gt", json!(100)))).unwrap();
        assert_eq!(rule.boolean_operator, BooleanOperator::Single);
        assert_eq!(rule.conditions.len(), 1);
        assert_eq!(rule.conditions[0].operator, Operator::GreaterThan);
        assert_eq!(rule.match_value, json!(1));
        assert_eq!(rule.default_value, json!(0));
    }

    #[test]
    fn test_and_block_flattens_in_order() {
        let rule = compile(&rule_with(json!({
            "AND": [
                leaf("industry", "eq", json!("Technology")),
                leaf("founded_year", "lt", json!(2020)),
            ]
        })))
        .unwrap();
        assert_eq!(rule.boolean_operator, BooleanOperator::And);
        let targets: Vec<&str> = rule.conditions.iter().map(|c| c.target_object.as_str()).collect();
        assert_eq!(targets, vec!["industry", "founded_year"]);
    }

    #[test]
    fn test_lowercase_or_key() {
        let (op, conditions) = compile_operation(&json!({
            "or": [
                leaf("headquarters_country", "EQUALS", json!("Canada")),
                leaf("headquarters_country", "EQUALS", json!("USA")),
            ]
        }))
        .unwrap();
        assert_eq!(op, BooleanOperator::Or);
        assert_eq!(conditions.len(), 2);
    }

    #[test]
    fn test_single_leaf_boolean_block_normalizes_to_na() {
        let (op, conditions) =
            compile_operation(&json!({"AND": [leaf("industry", "EQUALS", json!("Retail"))]}))
                .unwrap();
        assert_eq!(op, BooleanOperator::Single);
        assert_eq!(conditions.len(), 1);
    }

    #[test]
    fn test_malformed_operations() {
        let both = json!({"AND": [leaf("a", "EQUALS", json!(1))], "OR": []});
        let empty = json!({"OR": []});
        let not_list = json!({"AND": {"target_object": "x"}});
        let nested = json!({"AND": [{"OR": [leaf("industry", "EQUALS", json!("x"))]}, leaf("name", "EQUALS", json!("y"))]});
        let missing_value = json!({"target_object": "industry", "operator": "EQUALS"});
        let missing_target = json!({"operator": "EQUALS", "value": "x"});
        let bad_value = json!({"target_object": "industry", "operator": "EQUALS", "value": [1]});

        for operation in [both, empty, not_list, nested, missing_value, missing_target, bad_value] {
            let result = compile_operation(&operation);
            assert!(
                matches!(result, Err(RuleError::MalformedRule(_))),
                "expected MalformedRule for {}",
                operation
            );
        }
    }

    #[test]
    fn test_unsupported_operator_rejected() {
        let err = compile_operation(&leaf("industry", "BETWEEN", json!("x"))).unwrap_err();
        match err {
            RuleError::MalformedRule(message) => assert!(message.contains("BETWEEN")),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_rule_requires_feature_name_and_operation() {
        assert!(compile(&json!({"operation": leaf("industry", "EQUALS", json!("x"))})).is_err());
        assert!(compile(&json!({"feature_name": "f"})).is_err());
        assert!(compile(&json!(["not", "an", "object"])).is_err());
    }

    #[test]
    fn test_company_feature_name_is_reserved() {
        let raw = json!({
            "feature_name": "company",
            "match": 1,
            "default": 0,
            "operation": leaf("industry", "EQUALS", json!("Technology")),
        });
        assert!(matches!(compile(&raw), Err(RuleError::MalformedRule(_))));

        // other names that merely contain it are fine
        let mut raw = raw;
        raw["feature_name"] = json!("company_is_tech");
        assert!(compile(&raw).is_ok());
    }

    #[test]
    fn test_outcome_defaults_and_input_fallback() {
        let rule = compile(&json!({
            "feature_name": "is_tech",
            "operation": leaf("industry", "EQUALS", json!("Technology")),
            "match": "yes",
        }))
        .unwrap();
        assert_eq!(rule.input, "is_tech");
        assert_eq!(rule.match_value, json!("yes"));
        assert_eq!(rule.default_value, json!(0));

        let err = compile(&json!({
            "feature_name": "is_tech",
            "operation": leaf("industry", "EQUALS", json!("Technology")),
            "match": {"nested": true},
        }))
        .unwrap_err();
        assert!(matches!(err, RuleError::MalformedRule(_)));
    }

    #[test]
    fn test_round_trip_preserves_operator_and_conditions() {
        let operations = [
            leaf("company_age", "LESS_THAN", json!(5)),
            json!({"AND": [
                leaf("industry", "EQUALS", json!("Technology")),
                leaf("total_employees", "GREATER_THAN_OR_EQUAL", json!(50)),
                leaf("description", "LLM", json!("Does it sell software?")),
            ]}),
            json!({"OR": [
                leaf("headquarters_country", "EQUALS", json!("Canada")),
                leaf("headquarters_country", "EQUALS", json!("USA")),
            ]}),
        ];

        for operation in operations {
            let first = compile(&rule_with(operation)).unwrap();
            let second = compile(&rule_with(to_operation(&first))).unwrap();
            assert_eq!(first.boolean_operator, second.boolean_operator);
            assert_eq!(first.conditions, second.conditions);
        }
    }

    #[test]
    fn test_request_rejects_duplicate_feature_names() {
        let request = CreateRulesRequest {
            user_name: "master_user".into(),
            rules: vec![
                rule_with(leaf("total_employees", "gt", json!(100))),
                rule_with(leaf("total_employees", "gt", json!(500))),
            ],
        };
        let err = compile_request(&request).unwrap_err();
        assert_eq!(
            err,
            RuleError::DuplicateRule {
                user_name: "master_user".into(),
                feature_name: "is_large_company".into(),
            }
        );
    }

    #[test]
    fn test_request_requires_user_and_rules() {
        let request = CreateRulesRequest {
            user_name: " ".into(),
            rules: vec![rule_with(leaf("total_employees", "gt", json!(100)))],
        };
        assert!(compile_request(&request).is_err());

        let request = CreateRulesRequest {
            user_name: "u".into(),
            rules: vec![],
        };
        assert!(compile_request(&request).is_err());
    }

    #[test]
    fn test_response_shape() {
        let rule = compile(&rule_with(json!({"OR": [
            leaf("headquarters_country", "EQUALS", json!("Canada")),
            leaf("headquarters_country", "EQUALS", json!("USA")),
        ]})))
        .unwrap();
        let response = serde_json::to_value(CreateRulesResponse::created("master_user", vec![rule])).unwrap();

        assert_eq!(response["success"], json!(true));
        assert_eq!(response["message"], json!("Rule created successfully"));
        assert_eq!(response["rule"]["user_name"], json!("master_user"));
        let created = &response["rule"]["rules"][0];
        assert_eq!(created["boolean_operator"], json!("OR"));
        assert_eq!(created["match"], json!(1));
        assert_eq!(created["conditions"][1]["value"], json!("USA"));
        assert_eq!(created["conditions"][1]["operator"], json!("EQUALS"));
    }
}
