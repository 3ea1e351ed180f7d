use thiserror::Error;

/// Errors raised while compiling or evaluating rules.
///
/// Creation-time variants reject the whole request. Evaluation-time variants
/// are recorded per (company, rule) pair by the processor and never abort the
/// rest of a batch.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum RuleError {
    #[error("malformed rule: {0}")]
    MalformedRule(String),
    #[error("unsupported operator: {0}")]
    UnsupportedOperator(String),
    #[error("unknown company field '{field}'{}", suggestion_suffix(.suggestion))]
    MissingField {
        field: String,
        suggestion: Option<String>,
    },
    #[error("operator {operator} cannot be applied to field '{field}': {reason}")]
    TypeMismatch {
        field: String,
        operator: String,
        reason: String,
    },
    #[error("could not interpret LLM answer: {0:?}")]
    LlmResponseUnparseable(String),
    #[error("LLM provider error: {0}")]
    LlmProviderError(String),
    #[error("company not found: {0}")]
    CompanyNotFound(String),
    #[error("user not found: {0}")]
    UserNotFound(String),
    #[error("feature '{feature_name}' is already defined for user '{user_name}'")]
    DuplicateRule {
        user_name: String,
        feature_name: String,
    },
}

impl RuleError {
    pub fn malformed(message: impl Into<String>) -> Self {
        RuleError::MalformedRule(message.into())
    }

    pub fn type_mismatch(
        field: impl Into<String>,
        operator: impl std::fmt::Display,
        reason: impl Into<String>,
    ) -> Self {
        RuleError::TypeMismatch {
            field: field.into(),
            operator: operator.to_string(),
            reason: reason.into(),
        }
    }

    /// Stable machine-readable name of the variant, used in failure reports.
    pub fn kind(&self) -> &'static str {
        match self {
            RuleError::MalformedRule(_) => "MalformedRule",
            RuleError::UnsupportedOperator(_) => "UnsupportedOperator",
            RuleError::MissingField { .. } => "MissingField",
            RuleError::TypeMismatch { .. } => "TypeMismatch",
            RuleError::LlmResponseUnparseable(_) => "LLMResponseUnparseable",
            RuleError::LlmProviderError(_) => "LLMProviderError",
            RuleError::CompanyNotFound(_) => "CompanyNotFound",
            RuleError::UserNotFound(_) => "UserNotFound",
            RuleError::DuplicateRule { .. } => "DuplicateRule",
        }
    }
}

fn suggestion_suffix(suggestion: &Option<String>) -> String {
    match suggestion {
        Some(name) => format!(" (did you mean '{}'?)", name),
        None => String::new(),
    }
}
