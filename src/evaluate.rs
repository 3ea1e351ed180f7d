use crate::ai::LlmResolver;
use crate::error::RuleError;
use crate::models::{
    BooleanOperator, Company, Condition, ConditionValue, FieldValue, Operator, RuleDefinition,
};

/// Evaluates conditions against one company snapshot.
#[derive(Clone, Copy)]
pub struct Evaluator<'a> {
    current_year: i32,
    llm: LlmResolver<'a>,
}

impl<'a> Evaluator<'a> {
    pub fn new(current_year: i32, llm: LlmResolver<'a>) -> Self {
        Self { current_year, llm }
    }

    pub fn evaluate(&self, condition: &Condition, company: &Company) -> Result<bool, RuleError> {
        let actual = company.field(&condition.target_object, self.current_year)?;

        if condition.operator == Operator::Llm {
            let question = condition.value.as_text().ok_or_else(|| {
                RuleError::type_mismatch(
                    &condition.target_object,
                    condition.operator,
                    "LLM conditions take a text question",
                )
            })?;
            return self.llm.ask(question, &condition.target_object, &actual);
        }

        compare(
            &condition.target_object,
            condition.operator,
            &actual,
            &condition.value,
        )
    }

    /// Evaluates every leaf of the rule, then aggregates. The first leaf
    /// error fails the whole rule for this company.
    pub fn evaluate_rule(&self, rule: &RuleDefinition, company: &Company) -> Result<bool, RuleError> {
        let results = rule
            .conditions
            .iter()
            .map(|condition| self.evaluate(condition, company))
            .collect::<Result<Vec<_>, _>>()?;
        aggregate(rule.boolean_operator, &results)
    }
}

/// Applies a non-LLM operator to a resolved field value.
pub fn compare(
    field: &str,
    operator: Operator,
    actual: &FieldValue,
    expected: &ConditionValue,
) -> Result<bool, RuleError> {
    match operator {
        Operator::Equals => equals(field, operator, actual, expected),
        Operator::NotEquals => equals(field, operator, actual, expected).map(|eq| !eq),
        Operator::Contains => contains(field, operator, actual, expected),
        Operator::NotContains => contains(field, operator, actual, expected).map(|found| !found),
        Operator::LessThan
        | Operator::GreaterThan
        | Operator::LessThanOrEqual
        | Operator::GreaterThanOrEqual => {
            let lhs = actual.as_f64().ok_or_else(|| {
                RuleError::type_mismatch(
                    field,
                    operator,
                    format!("ordering needs a number, field holds {}", actual.type_name()),
                )
            })?;
            let rhs = numeric_literal(field, operator, expected)?;
            Ok(match operator {
                Operator::LessThan => lhs < rhs,
                Operator::GreaterThan => lhs > rhs,
                Operator::LessThanOrEqual => lhs <= rhs,
                _ => lhs >= rhs,
            })
        }
        Operator::Llm => Err(RuleError::UnsupportedOperator(
            "LLM must be resolved through the evaluator".to_string(),
        )),
    }
}

fn numeric_literal(
    field: &str,
    operator: Operator,
    expected: &ConditionValue,
) -> Result<f64, RuleError> {
    expected.as_f64().ok_or_else(|| {
        RuleError::type_mismatch(field, operator, format!("value '{}' is not numeric", expected))
    })
}

fn equals(
    field: &str,
    operator: Operator,
    actual: &FieldValue,
    expected: &ConditionValue,
) -> Result<bool, RuleError> {
    match actual {
        FieldValue::Null => Ok(false),
        FieldValue::Text(text) => match expected {
            ConditionValue::Text(other) => Ok(text == other),
            ConditionValue::Number(_) => Err(RuleError::type_mismatch(
                field,
                operator,
                "text field compared with a number",
            )),
        },
        FieldValue::Integer(_) | FieldValue::Float(_) => {
            let rhs = numeric_literal(field, operator, expected)?;
            Ok(actual.as_f64() == Some(rhs))
        }
        FieldValue::Mapping(_) => Err(RuleError::type_mismatch(
            field,
            operator,
            "mapping fields only support CONTAINS",
        )),
    }
}

fn contains(
    field: &str,
    operator: Operator,
    actual: &FieldValue,
    expected: &ConditionValue,
) -> Result<bool, RuleError> {
    let needle = match actual {
        FieldValue::Null => return Ok(false),
        FieldValue::Text(_) | FieldValue::Mapping(_) => expected.as_text().ok_or_else(|| {
            RuleError::type_mismatch(field, operator, "CONTAINS takes a text value")
        })?,
        FieldValue::Integer(_) | FieldValue::Float(_) => {
            return Err(RuleError::type_mismatch(
                field,
                operator,
                format!("CONTAINS does not apply to {}", actual.type_name()),
            ));
        }
    };

    match actual {
        FieldValue::Text(text) => Ok(text.contains(needle)),
        FieldValue::Mapping(regions) => Ok(regions.contains_key(needle)),
        _ => Ok(false),
    }
}

/// Combines already evaluated leaf results.
pub fn aggregate(operator: BooleanOperator, results: &[bool]) -> Result<bool, RuleError> {
    match (operator, results) {
        (_, []) => Err(RuleError::malformed("rule has no conditions")),
        (BooleanOperator::Single, [only]) => Ok(*only),
        (BooleanOperator::Single, many) => Err(RuleError::malformed(format!(
            "N/A rules take exactly one condition, found {}",
            many.len()
        ))),
        (BooleanOperator::And, all) => Ok(all.iter().all(|result| *result)),
        (BooleanOperator::Or, any) => Ok(any.iter().any(|result| *result)),
    }
}
