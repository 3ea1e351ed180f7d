//! Applies a user's rules to a batch of companies and records the outcomes.
//!
//! Evaluation runs on scoped threads, at most `max_parallel` companies at a
//! time, against snapshots loaded up front. Nothing touches the database
//! until every rule for a company has been decided, so no transaction is open
//! while an LLM call is in flight.

use std::collections::{HashMap, HashSet};
use std::thread;

use anyhow::{anyhow, Result};
use chrono::{DateTime, Datelike, SecondsFormat, Utc};
use serde::Serialize;
use serde_json::{Map, Value};
use tracing::{debug, info, warn};

use crate::ai::{LlmProvider, LlmResolver};
use crate::config::ProcessorConfig;
use crate::db::{Database, NewResult};
use crate::error::RuleError;
use crate::evaluate::Evaluator;
use crate::models::{Company, Rule};

/// Feature map for one company: `{"company": name, feature_name: value, ...}`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CompanyFeatures {
    pub company: String,
    #[serde(flatten)]
    pub features: Map<String, Value>,
}

/// A (company, rule) pair or a company that produced no result.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProcessingFailure {
    pub company_url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub feature_name: Option<String>,
    pub kind: &'static str,
    pub message: String,
}

impl ProcessingFailure {
    fn new(company_url: &str, feature_name: Option<&str>, err: &RuleError) -> Self {
        Self {
            company_url: company_url.to_string(),
            feature_name: feature_name.map(str::to_string),
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}

#[derive(Debug, Default, Serialize)]
pub struct ProcessingReport {
    pub results: Vec<CompanyFeatures>,
    pub failures: Vec<ProcessingFailure>,
}

type RuleOutcome<'r> = (&'r Rule, Result<Value, RuleError>);

pub fn process(
    db: &Database,
    provider: &dyn LlmProvider,
    config: &ProcessorConfig,
    user_name: &str,
    urls: &[String],
) -> Result<ProcessingReport> {
    process_at(db, provider, config, user_name, urls, Utc::now())
}

/// Same as [`process`] with an explicit clock. `company_age` and the
/// recorded timestamps both come from `now`.
pub fn process_at(
    db: &Database,
    provider: &dyn LlmProvider,
    config: &ProcessorConfig,
    user_name: &str,
    urls: &[String],
    now: DateTime<Utc>,
) -> Result<ProcessingReport> {
    let user = db
        .get_user_by_name(user_name)?
        .ok_or_else(|| RuleError::UserNotFound(user_name.to_string()))?;
    let (rules, unreadable) = db.load_rules(user.id)?;
    for bad in &unreadable {
        warn!(rule_id = bad.id, feature = %bad.feature_name, "Stored rule is unreadable: {}", bad.error);
    }

    let mut seen = HashSet::new();
    let urls: Vec<String> = urls
        .iter()
        .filter(|url| seen.insert(url.to_string()))
        .cloned()
        .collect();

    let mut by_url: HashMap<String, Company> = db
        .get_companies_by_urls(&urls)?
        .into_iter()
        .map(|company| (company.url.clone(), company))
        .collect();

    let mut report = ProcessingReport::default();
    let mut companies = Vec::with_capacity(urls.len());
    for url in &urls {
        match by_url.remove(url) {
            Some(company) => companies.push(company),
            None => {
                let err = RuleError::CompanyNotFound(url.clone());
                warn!("{}", err);
                report.failures.push(ProcessingFailure::new(url, None, &err));
            }
        }
    }

    info!(
        user = %user.user_name,
        companies = companies.len(),
        rules = rules.len(),
        model = provider.model_name(),
        "Processing batch"
    );

    let evaluator = Evaluator::new(now.year(), LlmResolver::new(provider));
    let outcomes = evaluate_companies(evaluator, &companies, &rules, config.max_parallel)?;

    let processed_at = now.to_rfc3339_opts(SecondsFormat::Secs, true);
    for (company, outcome) in companies.iter().zip(outcomes) {
        let mut features = Map::new();
        let mut pending = Vec::new();

        for bad in &unreadable {
            report
                .failures
                .push(ProcessingFailure::new(&company.url, Some(&bad.feature_name), &bad.error));
        }

        for (rule, result) in outcome {
            let feature_name = &rule.definition.feature_name;
            match result {
                Ok(value) => {
                    pending.push(NewResult {
                        rule_id: rule.id,
                        feature_name: feature_name.clone(),
                        result_value: serde_json::to_string(&value)?,
                    });
                    features.insert(feature_name.clone(), value);
                }
                Err(err) => {
                    warn!(company = %company.url, feature = %feature_name, "Skipping feature: {}", err);
                    report
                        .failures
                        .push(ProcessingFailure::new(&company.url, Some(feature_name), &err));
                }
            }
        }

        db.record_company_results(company.id, user.id, &pending, &processed_at)?;
        debug!(company = %company.url, recorded = pending.len(), "Stored results");

        report.results.push(CompanyFeatures {
            company: company.name.clone(),
            features,
        });
    }

    info!(
        processed = report.results.len(),
        failures = report.failures.len(),
        "Batch complete"
    );
    Ok(report)
}

/// Evaluates every rule against every company, keeping company order.
fn evaluate_companies<'r>(
    evaluator: Evaluator<'_>,
    companies: &[Company],
    rules: &'r [Rule],
    max_parallel: usize,
) -> Result<Vec<Vec<RuleOutcome<'r>>>> {
    let mut outcomes = Vec::with_capacity(companies.len());

    for chunk in companies.chunks(max_parallel.max(1)) {
        let chunk_outcomes = thread::scope(|scope| {
            let handles: Vec<_> = chunk
                .iter()
                .map(|company| scope.spawn(move || evaluate_company(evaluator, company, rules)))
                .collect();

            handles
                .into_iter()
                .map(|handle| {
                    handle
                        .join()
                        .map_err(|_| anyhow!("Evaluation worker panicked"))
                })
                .collect::<Result<Vec<_>>>()
        })?;
        outcomes.extend(chunk_outcomes);
    }

    Ok(outcomes)
}

fn evaluate_company<'r>(
    evaluator: Evaluator<'_>,
    company: &Company,
    rules: &'r [Rule],
) -> Vec<RuleOutcome<'r>> {
    rules
        .iter()
        .map(|rule| {
            let result = evaluator
                .evaluate_rule(&rule.definition, company)
                .map(|matched| rule.definition.outcome(matched).clone());
            (rule, result)
        })
        .collect()
}
