use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use regex::Regex;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;

use crate::error::RuleError;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct User {
    pub id: i64,
    pub user_name: String,
    pub created_at: String,
}

/// Region name to employee head count.
pub type EmployeeLocations = BTreeMap<String, u64>;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Company {
    pub id: i64,
    pub url: String,
    pub name: String,
    pub founded_year: Option<i64>,
    pub total_employees: Option<i64>,
    pub headquarters_city: Option<String>,
    pub headquarters_country: Option<String>,
    pub employee_locations: EmployeeLocations,
    pub employee_growth_2y: Option<f64>,
    pub employee_growth_1y: Option<f64>,
    pub employee_growth_6m: Option<f64>,
    pub description: Option<String>,
    pub industry: Option<String>,
    pub imported_at: String,
    pub last_processed_at: Option<String>,
}

impl Company {
    /// Country from the import data, or the parenthesised suffix of the
    /// headquarters city ("Paris (France)" gives "France").
    pub fn country(&self) -> Option<String> {
        if let Some(country) = self.headquarters_country.as_deref() {
            let country = country.trim();
            if !country.is_empty() {
                return Some(country.to_string());
            }
        }
        self.headquarters_city
            .as_deref()
            .and_then(country_from_city)
    }

    /// Years since founding, relative to `current_year`.
    pub fn company_age(&self, current_year: i32) -> Option<i64> {
        self.founded_year.map(|year| i64::from(current_year) - year)
    }

    /// Resolves a field name to its runtime value. `company_age` is derived
    /// from `current_year` and never stored.
    pub fn field(&self, name: &str, current_year: i32) -> Result<FieldValue, RuleError> {
        let value = match name {
            "name" => FieldValue::Text(self.name.clone()),
            "founded_year" => FieldValue::from_integer(self.founded_year),
            "total_employees" => FieldValue::from_integer(self.total_employees),
            "company_age" => FieldValue::from_integer(self.company_age(current_year)),
            "headquarters_city" => FieldValue::from_text(self.headquarters_city.clone()),
            "headquarters_country" => FieldValue::from_text(self.country()),
            "employee_locations" => FieldValue::Mapping(self.employee_locations.clone()),
            "employee_growth_2y" => FieldValue::from_float(self.employee_growth_2y),
            "employee_growth_1y" => FieldValue::from_float(self.employee_growth_1y),
            "employee_growth_6m" => FieldValue::from_float(self.employee_growth_6m),
            "description" => FieldValue::from_text(self.description.clone()),
            "industry" => FieldValue::from_text(self.industry.clone()),
            _ => {
                return Err(RuleError::MissingField {
                    field: name.to_string(),
                    suggestion: suggest_field(name),
                });
            }
        };
        Ok(value)
    }
}

/// Company data accepted for import, before it has an id.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct NewCompany {
    pub url: String,
    pub name: String,
    pub founded_year: Option<i64>,
    pub total_employees: Option<i64>,
    pub headquarters_city: Option<String>,
    pub headquarters_country: Option<String>,
    pub employee_locations: EmployeeLocations,
    pub employee_growth_2y: Option<f64>,
    pub employee_growth_1y: Option<f64>,
    pub employee_growth_6m: Option<f64>,
    pub description: Option<String>,
    pub industry: Option<String>,
}

pub fn country_from_city(city: &str) -> Option<String> {
    let re = Regex::new(r"\((?P<country>[^)]+)\)").ok()?;
    re.captures(city)
        .map(|caps| caps["country"].trim().to_string())
        .filter(|country| !country.is_empty())
}

// --- Field typing ---

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    Text,
    Integer,
    Float,
    Mapping,
}

pub const COMPANY_FIELDS: &[(&str, FieldKind)] = &[
    ("name", FieldKind::Text),
    ("founded_year", FieldKind::Integer),
    ("total_employees", FieldKind::Integer),
    ("company_age", FieldKind::Integer),
    ("headquarters_city", FieldKind::Text),
    ("headquarters_country", FieldKind::Text),
    ("employee_locations", FieldKind::Mapping),
    ("employee_growth_2y", FieldKind::Float),
    ("employee_growth_1y", FieldKind::Float),
    ("employee_growth_6m", FieldKind::Float),
    ("description", FieldKind::Text),
    ("industry", FieldKind::Text),
];

pub fn field_kind(name: &str) -> Option<FieldKind> {
    COMPANY_FIELDS
        .iter()
        .find(|(field, _)| *field == name)
        .map(|(_, kind)| *kind)
}

/// Closest known field name, if any is reasonably close.
pub fn suggest_field(name: &str) -> Option<String> {
    let lower = name.to_lowercase();
    COMPANY_FIELDS
        .iter()
        .map(|(field, _)| (*field, strsim::jaro_winkler(&lower, field)))
        .filter(|(_, score)| *score >= 0.85)
        .max_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal))
        .map(|(field, _)| field.to_string())
}

/// Runtime value of a company field.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Null,
    Text(String),
    Integer(i64),
    Float(f64),
    Mapping(EmployeeLocations),
}

impl FieldValue {
    fn from_text(value: Option<String>) -> Self {
        value.map(FieldValue::Text).unwrap_or(FieldValue::Null)
    }

    fn from_integer(value: Option<i64>) -> Self {
        value.map(FieldValue::Integer).unwrap_or(FieldValue::Null)
    }

    fn from_float(value: Option<f64>) -> Self {
        value.map(FieldValue::Float).unwrap_or(FieldValue::Null)
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            FieldValue::Integer(n) => Some(*n as f64),
            FieldValue::Float(n) => Some(*n),
            _ => None,
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            FieldValue::Null => "missing value",
            FieldValue::Text(_) => "text",
            FieldValue::Integer(_) => "integer",
            FieldValue::Float(_) => "float",
            FieldValue::Mapping(_) => "mapping",
        }
    }
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldValue::Null => write!(f, "unknown"),
            FieldValue::Text(text) => write!(f, "{}", text),
            FieldValue::Integer(n) => write!(f, "{}", n),
            FieldValue::Float(n) => write!(f, "{}", n),
            FieldValue::Mapping(map) => {
                let pairs: Vec<String> = map
                    .iter()
                    .map(|(region, count)| format!("{}: {}", region, count))
                    .collect();
                write!(f, "{}", pairs.join(", "))
            }
        }
    }
}

// --- Operators ---

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operator {
    Equals,
    NotEquals,
    LessThan,
    GreaterThan,
    LessThanOrEqual,
    GreaterThanOrEqual,
    Contains,
    NotContains,
    Llm,
}

impl Operator {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operator::Equals => "EQUALS",
            Operator::NotEquals => "NOT_EQUALS",
            Operator::LessThan => "LESS_THAN",
            Operator::GreaterThan => "GREATER_THAN",
            Operator::LessThanOrEqual => "LESS_THAN_OR_EQUAL",
            Operator::GreaterThanOrEqual => "GREATER_THAN_OR_EQUAL",
            Operator::Contains => "CONTAINS",
            Operator::NotContains => "NOT_CONTAINS",
            Operator::Llm => "LLM",
        }
    }

    pub fn is_ordering(&self) -> bool {
        matches!(
            self,
            Operator::LessThan
                | Operator::GreaterThan
                | Operator::LessThanOrEqual
                | Operator::GreaterThanOrEqual
        )
    }
}

impl FromStr for Operator {
    type Err = RuleError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let op = match raw.trim().to_uppercase().as_str() {
            "EQUALS" | "EQ" => Operator::Equals,
            "NOT_EQUALS" | "NE" | "NEQ" => Operator::NotEquals,
            "LESS_THAN" | "LT" => Operator::LessThan,
            "GREATER_THAN" | "GT" => Operator::GreaterThan,
            "LESS_THAN_OR_EQUAL" | "LTE" | "LE" => Operator::LessThanOrEqual,
            "GREATER_THAN_OR_EQUAL" | "GTE" | "GE" => Operator::GreaterThanOrEqual,
            "CONTAINS" => Operator::Contains,
            "NOT_CONTAINS" => Operator::NotContains,
            "LLM" => Operator::Llm,
            _ => return Err(RuleError::UnsupportedOperator(raw.to_string())),
        };
        Ok(op)
    }
}

impl fmt::Display for Operator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

impl Serialize for Operator {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for Operator {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// How the leaf results of a rule combine. `Single` is written as "N/A".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BooleanOperator {
    And,
    Or,
    Single,
}

impl BooleanOperator {
    pub fn as_str(&self) -> &'static str {
        match self {
            BooleanOperator::And => "AND",
            BooleanOperator::Or => "OR",
            BooleanOperator::Single => "N/A",
        }
    }
}

impl FromStr for BooleanOperator {
    type Err = RuleError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_uppercase().as_str() {
            "AND" => Ok(BooleanOperator::And),
            "OR" => Ok(BooleanOperator::Or),
            "N/A" | "" => Ok(BooleanOperator::Single),
            other => Err(RuleError::malformed(format!(
                "unsupported boolean operator '{}'",
                other
            ))),
        }
    }
}

impl fmt::Display for BooleanOperator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

impl Serialize for BooleanOperator {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for BooleanOperator {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

// --- Rules ---

/// Literal on the right-hand side of a condition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ConditionValue {
    Number(serde_json::Number),
    Text(String),
}

impl ConditionValue {
    /// Numeric reading of the literal. Text is accepted when it parses.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            ConditionValue::Number(n) => n.as_f64(),
            ConditionValue::Text(text) => text.trim().parse().ok(),
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            ConditionValue::Text(text) => Some(text),
            ConditionValue::Number(_) => None,
        }
    }
}

impl fmt::Display for ConditionValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConditionValue::Number(n) => write!(f, "{}", n),
            ConditionValue::Text(text) => write!(f, "{}", text),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Condition {
    pub target_object: String,
    pub operator: Operator,
    pub value: ConditionValue,
}

/// Normalized rule content, as produced by the rule compiler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleDefinition {
    pub input: String,
    pub feature_name: String,
    #[serde(rename = "match")]
    pub match_value: Value,
    #[serde(rename = "default")]
    pub default_value: Value,
    pub boolean_operator: BooleanOperator,
    pub conditions: Vec<Condition>,
}

impl RuleDefinition {
    /// Outcome chosen for an aggregate result.
    pub fn outcome(&self, matched: bool) -> &Value {
        if matched {
            &self.match_value
        } else {
            &self.default_value
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rule {
    pub id: i64,
    pub user_id: i64,
    #[serde(flatten)]
    pub definition: RuleDefinition,
    pub created_at: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessingResult {
    pub id: i64,
    pub company_id: i64,
    pub user_id: i64,
    pub rule_id: i64,
    pub feature_name: String,
    pub result_value: String,
    pub processed_at: String,
}

/// Processing result joined with the owning user's name, for display.
#[derive(Debug, Clone, Serialize)]
pub struct ProcessedFeature {
    pub user_name: String,
    pub feature_name: String,
    pub value: Value,
    pub processed_at: String,
}

#[cfg(test)]
pub fn sample_company() -> Company {
    Company {
        id: 1,
        url: "https://acme.example".to_string(),
        name: "Acme".to_string(),
        founded_year: Some(2010),
        total_employees: Some(150),
        headquarters_city: Some("Toronto (Canada)".to_string()),
        headquarters_country: None,
        employee_locations: EmployeeLocations::from([
            ("Canada".to_string(), 100),
            ("USA".to_string(), 50),
        ]),
        employee_growth_2y: Some(0.25),
        employee_growth_1y: Some(0.1),
        employee_growth_6m: None,
        description: Some("Acme builds developer tooling for data teams.".to_string()),
        industry: Some("Technology".to_string()),
        imported_at: "2025-01-01T00:00:00Z".to_string(),
        last_processed_at: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_country_derived_from_city() {
        let company = sample_company();
        assert_eq!(company.country(), Some("Canada".to_string()));
        assert_eq!(country_from_city("Berlin (Deutschland)"), Some("Deutschland".to_string()));
        assert_eq!(country_from_city("Berlin"), None);
    }

    #[test]
    fn test_explicit_country_wins() {
        let mut company = sample_company();
        company.headquarters_country = Some("USA".to_string());
        assert_eq!(company.country(), Some("USA".to_string()));
    }

    #[test]
    fn test_company_age_is_relative_to_current_year() {
        let company = sample_company();
        assert_eq!(company.field("company_age", 2025).unwrap(), FieldValue::Integer(15));
        assert_eq!(company.field("company_age", 2026).unwrap(), FieldValue::Integer(16));
    }

    #[test]
    fn test_unknown_field_suggests_closest() {
        let company = sample_company();
        let err = company.field("industy", 2025).unwrap_err();
        assert_eq!(
            err,
            RuleError::MissingField {
                field: "industy".to_string(),
                suggestion: Some("industry".to_string()),
            }
        );
    }

    #[test]
    fn test_every_declared_field_resolves() {
        let company = sample_company();
        for (name, _) in COMPANY_FIELDS {
            assert!(company.field(name, 2025).is_ok(), "field {} should resolve", name);
        }
    }

    #[test]
    fn test_operator_aliases() {
        assert_eq!("gt".parse::<Operator>().unwrap(), Operator::GreaterThan);
        assert_eq!("eq".parse::<Operator>().unwrap(), Operator::Equals);
        assert_eq!("Less_Than".parse::<Operator>().unwrap(), Operator::LessThan);
        assert!(matches!(
            "BETWEEN".parse::<Operator>(),
            Err(RuleError::UnsupportedOperator(_))
        ));
    }

    #[test]
    fn test_operator_serializes_canonical_name() {
        let json = serde_json::to_string(&Operator::GreaterThanOrEqual).unwrap();
        assert_eq!(json, "\"GREATER_THAN_OR_EQUAL\"");
        let op: Operator = serde_json::from_str("\"lte\"").unwrap();
        assert_eq!(op, Operator::LessThanOrEqual);
    }

    #[test]
    fn test_condition_value_numeric_reading() {
        let value: ConditionValue = serde_json::from_str("100").unwrap();
        assert_eq!(value.as_f64(), Some(100.0));
        let value: ConditionValue = serde_json::from_str("\" 42 \"").unwrap();
        assert_eq!(value.as_f64(), Some(42.0));
        let value: ConditionValue = serde_json::from_str("\"USA\"").unwrap();
        assert_eq!(value.as_f64(), None);
    }

    #[test]
    fn test_mapping_display_for_prompts() {
        let value = FieldValue::Mapping(EmployeeLocations::from([
            ("UK".to_string(), 5),
            ("France".to_string(), 2),
        ]));
        assert_eq!(value.to_string(), "France: 2, UK: 5");
        assert_eq!(FieldValue::Null.to_string(), "unknown");
    }
}
