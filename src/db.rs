use anyhow::{anyhow, Context, Result};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension};
use serde::de::DeserializeOwned;
use std::path::{Path, PathBuf};

use crate::error::RuleError;
use crate::models::{
    Company, Condition, ConditionValue, EmployeeLocations, NewCompany, ProcessedFeature,
    ProcessingResult, Rule, RuleDefinition, User,
};

const COMPANY_COLUMNS: &str = "id, url, name, founded_year, total_employees, headquarters_city,
    headquarters_country, employee_locations, employee_growth_2y, employee_growth_1y,
    employee_growth_6m, description, industry, imported_at, last_processed_at";

pub struct Database {
    conn: Connection,
    path: Option<PathBuf>,
}

/// One evaluated feature waiting to be appended for a company.
#[derive(Debug, Clone)]
pub struct NewResult {
    pub rule_id: i64,
    pub feature_name: String,
    pub result_value: String,
}

/// A stored rule whose columns no longer decode into a [`Rule`].
#[derive(Debug, Clone)]
pub struct UnreadableRule {
    pub id: i64,
    pub feature_name: String,
    pub error: RuleError,
}

struct StoredRuleRow {
    id: i64,
    user_id: i64,
    input: String,
    feature_name: String,
    boolean_operator: String,
    match_value: String,
    default_value: String,
    created_at: String,
}

fn decode_json<T: DeserializeOwned>(rule_id: i64, column: &str, raw: &str) -> Result<T, RuleError> {
    serde_json::from_str(raw)
        .map_err(|e| RuleError::malformed(format!("stored {} for rule {} is not JSON: {}", column, rule_id, e)))
}

fn decode_rule(row: StoredRuleRow, conditions: Vec<(String, String, String)>) -> Result<Rule, RuleError> {
    let match_value = decode_json(row.id, "match value", &row.match_value)?;
    let default_value = decode_json(row.id, "default value", &row.default_value)?;
    let boolean_operator = row.boolean_operator.parse()?;

    let mut decoded = Vec::with_capacity(conditions.len());
    for (target_object, operator, value) in conditions {
        let value: ConditionValue = decode_json(row.id, "condition value", &value)?;
        decoded.push(Condition {
            target_object,
            operator: operator.parse()?,
            value,
        });
    }

    Ok(Rule {
        id: row.id,
        user_id: row.user_id,
        definition: RuleDefinition {
            input: row.input,
            feature_name: row.feature_name,
            match_value,
            default_value,
            boolean_operator,
            conditions: decoded,
        },
        created_at: row.created_at,
    })
}

impl Database {
    pub fn open(path: Option<&Path>) -> Result<Self> {
        let path = match path {
            Some(path) => path.to_path_buf(),
            None => Self::default_path()?,
        };
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(&path)
            .with_context(|| format!("Failed to open database at {}", path.display()))?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        Ok(Self {
            conn,
            path: Some(path),
        })
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        Ok(Self { conn, path: None })
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    #[cfg(test)]
    pub(crate) fn connection(&self) -> &Connection {
        &self.conn
    }

    fn default_path() -> Result<PathBuf> {
        // Use XDG data directory or fallback
        if let Some(proj_dirs) = directories::ProjectDirs::from("", "", "featurizer") {
            Ok(proj_dirs.data_dir().join("featurizer.db"))
        } else {
            Ok(PathBuf::from("featurizer.db"))
        }
    }

    pub fn init(&self) -> Result<()> {
        self.conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS users (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                user_name TEXT NOT NULL UNIQUE,
                created_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%SZ', 'now'))
            );

            CREATE TABLE IF NOT EXISTS companies (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                url TEXT NOT NULL UNIQUE,
                name TEXT NOT NULL,
                founded_year INTEGER,
                total_employees INTEGER,
                headquarters_city TEXT,
                headquarters_country TEXT,
                employee_locations TEXT NOT NULL DEFAULT '{}',
                employee_growth_2y REAL,
                employee_growth_1y REAL,
                employee_growth_6m REAL,
                description TEXT,
                industry TEXT,
                imported_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%SZ', 'now')),
                last_processed_at TEXT
            );

            CREATE TABLE IF NOT EXISTS rules (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id INTEGER NOT NULL REFERENCES users(id) ON DELETE CASCADE,
                input TEXT NOT NULL,
                feature_name TEXT NOT NULL,
                boolean_operator TEXT NOT NULL CHECK (boolean_operator IN ('AND', 'OR', 'N/A')),
                match_value TEXT NOT NULL,
                default_value TEXT NOT NULL,
                created_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%SZ', 'now')),
                UNIQUE (user_id, feature_name)
            );

            CREATE TABLE IF NOT EXISTS conditions (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                rule_id INTEGER NOT NULL REFERENCES rules(id) ON DELETE CASCADE,
                position INTEGER NOT NULL,
                target_object TEXT NOT NULL,
                operator TEXT NOT NULL,
                value TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS processing_results (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                company_id INTEGER NOT NULL REFERENCES companies(id) ON DELETE CASCADE,
                user_id INTEGER NOT NULL REFERENCES users(id) ON DELETE CASCADE,
                rule_id INTEGER NOT NULL REFERENCES rules(id) ON DELETE CASCADE,
                feature_name TEXT NOT NULL,
                result_value TEXT NOT NULL,
                processed_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_rules_user ON rules(user_id);
            CREATE INDEX IF NOT EXISTS idx_conditions_rule ON conditions(rule_id, position);
            CREATE INDEX IF NOT EXISTS idx_results_company ON processing_results(company_id);
            "#,
        )?;
        Ok(())
    }

    pub fn ensure_initialized(&self) -> Result<()> {
        let tables: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name='processing_results'",
            [],
            |row| row.get(0),
        )?;
        if tables == 0 {
            return Err(anyhow!(
                "Database not initialized. Run 'featurizer init' first."
            ));
        }
        Ok(())
    }

    // --- User operations ---

    pub fn get_or_create_user(&self, user_name: &str) -> Result<User> {
        if let Some(user) = self.get_user_by_name(user_name)? {
            return Ok(user);
        }

        self.conn.execute(
            "INSERT INTO users (user_name) VALUES (?1)",
            [user_name],
        )?;
        let id = self.conn.last_insert_rowid();
        self.conn
            .query_row(
                "SELECT id, user_name, created_at FROM users WHERE id = ?1",
                [id],
                Self::row_to_user,
            )
            .context("Failed to read back new user")
    }

    /// Explicit creation. Unlike `get_or_create_user` an existing name is an error.
    pub fn create_user(&self, user_name: &str) -> Result<User> {
        let user_name = user_name.trim();
        if user_name.is_empty() {
            return Err(anyhow!("User name cannot be empty"));
        }
        if self.get_user_by_name(user_name)?.is_some() {
            return Err(anyhow!("User '{}' already exists", user_name));
        }
        self.get_or_create_user(user_name)
    }

    pub fn get_user_by_name(&self, user_name: &str) -> Result<Option<User>> {
        self.conn
            .query_row(
                "SELECT id, user_name, created_at FROM users WHERE user_name = ?1",
                [user_name],
                Self::row_to_user,
            )
            .optional()
            .context("Failed to look up user")
    }

    pub fn list_users(&self) -> Result<Vec<User>> {
        let mut stmt = self
            .conn
            .prepare("SELECT id, user_name, created_at FROM users ORDER BY user_name")?;
        let rows = stmt.query_map([], Self::row_to_user)?;
        rows.collect::<Result<Vec<_>, _>>()
            .context("Failed to list users")
    }

    fn row_to_user(row: &rusqlite::Row) -> rusqlite::Result<User> {
        Ok(User {
            id: row.get(0)?,
            user_name: row.get(1)?,
            created_at: row.get(2)?,
        })
    }

    // --- Company operations ---

    /// Inserts a company unless its URL is already present. Returns the new
    /// id, or `None` for a duplicate.
    pub fn insert_company(&self, company: &NewCompany) -> Result<Option<i64>> {
        let locations = serde_json::to_string(&company.employee_locations)?;
        let inserted = self.conn.execute(
            "INSERT OR IGNORE INTO companies (url, name, founded_year, total_employees,
                headquarters_city, headquarters_country, employee_locations,
                employee_growth_2y, employee_growth_1y, employee_growth_6m, description, industry)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            params![
                company.url,
                company.name,
                company.founded_year,
                company.total_employees,
                company.headquarters_city,
                company.headquarters_country,
                locations,
                company.employee_growth_2y,
                company.employee_growth_1y,
                company.employee_growth_6m,
                company.description,
                company.industry,
            ],
        )?;

        if inserted == 0 {
            Ok(None)
        } else {
            Ok(Some(self.conn.last_insert_rowid()))
        }
    }

    pub fn get_company_by_url(&self, url: &str) -> Result<Option<Company>> {
        let sql = format!("SELECT {} FROM companies WHERE url = ?1", COMPANY_COLUMNS);
        self.conn
            .query_row(&sql, [url], Self::row_to_company)
            .optional()
            .context("Failed to look up company")
    }

    /// Companies for the given URLs, in no particular order. Unknown URLs are
    /// simply absent from the result.
    pub fn get_companies_by_urls(&self, urls: &[String]) -> Result<Vec<Company>> {
        if urls.is_empty() {
            return Ok(Vec::new());
        }
        let placeholders: Vec<String> = (1..=urls.len()).map(|i| format!("?{}", i)).collect();
        let sql = format!(
            "SELECT {} FROM companies WHERE url IN ({})",
            COMPANY_COLUMNS,
            placeholders.join(", ")
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(rusqlite::params_from_iter(urls.iter()), Self::row_to_company)?;
        rows.collect::<Result<Vec<_>, _>>()
            .context("Failed to load companies")
    }

    pub fn list_companies(&self) -> Result<Vec<Company>> {
        let sql = format!("SELECT {} FROM companies ORDER BY name", COMPANY_COLUMNS);
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map([], Self::row_to_company)?;
        rows.collect::<Result<Vec<_>, _>>()
            .context("Failed to list companies")
    }

    fn row_to_company(row: &rusqlite::Row) -> rusqlite::Result<Company> {
        let locations: String = row.get(7)?;
        let employee_locations: EmployeeLocations = serde_json::from_str(&locations)
            .map_err(|err| rusqlite::Error::FromSqlConversionFailure(7, Type::Text, Box::new(err)))?;

        Ok(Company {
            id: row.get(0)?,
            url: row.get(1)?,
            name: row.get(2)?,
            founded_year: row.get(3)?,
            total_employees: row.get(4)?,
            headquarters_city: row.get(5)?,
            headquarters_country: row.get(6)?,
            employee_locations,
            employee_growth_2y: row.get(8)?,
            employee_growth_1y: row.get(9)?,
            employee_growth_6m: row.get(10)?,
            description: row.get(11)?,
            industry: row.get(12)?,
            imported_at: row.get(13)?,
            last_processed_at: row.get(14)?,
        })
    }

    // --- Rule operations ---

    /// Stores compiled rules for a user, creating the user on first use. The
    /// whole batch is rejected if any feature name already exists for them.
    pub fn create_rules(&self, user_name: &str, rules: &[RuleDefinition]) -> Result<Vec<Rule>> {
        let tx = self.conn.unchecked_transaction()?;
        let user = self.get_or_create_user(user_name)?;

        for rule in rules {
            let exists: Option<i64> = tx
                .query_row(
                    "SELECT id FROM rules WHERE user_id = ?1 AND feature_name = ?2",
                    params![user.id, rule.feature_name],
                    |row| row.get(0),
                )
                .optional()?;
            if exists.is_some() {
                return Err(RuleError::DuplicateRule {
                    user_name: user.user_name.clone(),
                    feature_name: rule.feature_name.clone(),
                }
                .into());
            }
        }

        let mut stored = Vec::with_capacity(rules.len());
        for rule in rules {
            tx.execute(
                "INSERT INTO rules (user_id, input, feature_name, boolean_operator, match_value, default_value)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    user.id,
                    rule.input,
                    rule.feature_name,
                    rule.boolean_operator.as_str(),
                    serde_json::to_string(&rule.match_value)?,
                    serde_json::to_string(&rule.default_value)?,
                ],
            )?;
            let rule_id = tx.last_insert_rowid();

            for (position, condition) in rule.conditions.iter().enumerate() {
                tx.execute(
                    "INSERT INTO conditions (rule_id, position, target_object, operator, value)
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                    params![
                        rule_id,
                        position as i64,
                        condition.target_object,
                        condition.operator.as_str(),
                        serde_json::to_string(&condition.value)?,
                    ],
                )?;
            }
            stored.push(rule_id);
        }

        tx.commit()?;

        let mut rules = self.list_rules(user.id)?;
        rules.retain(|rule| stored.contains(&rule.id));
        Ok(rules)
    }

    /// Rules owned by a user with their conditions in stored order. Fails if
    /// any stored rule no longer decodes.
    pub fn list_rules(&self, user_id: i64) -> Result<Vec<Rule>> {
        let (rules, unreadable) = self.load_rules(user_id)?;
        if let Some(bad) = unreadable.into_iter().next() {
            return Err(anyhow!(bad.error))
                .with_context(|| format!("Stored rule {} ('{}') is unreadable", bad.id, bad.feature_name));
        }
        Ok(rules)
    }

    /// Like [`Database::list_rules`], but a rule whose stored columns no
    /// longer decode is returned separately instead of failing the call.
    pub fn load_rules(&self, user_id: i64) -> Result<(Vec<Rule>, Vec<UnreadableRule>)> {
        let mut stmt = self.conn.prepare(
            "SELECT id, user_id, input, feature_name, boolean_operator, match_value, default_value, created_at
             FROM rules WHERE user_id = ?1 ORDER BY id",
        )?;
        let rows = stmt.query_map([user_id], |row| {
            Ok(StoredRuleRow {
                id: row.get(0)?,
                user_id: row.get(1)?,
                input: row.get(2)?,
                feature_name: row.get(3)?,
                boolean_operator: row.get(4)?,
                match_value: row.get(5)?,
                default_value: row.get(6)?,
                created_at: row.get(7)?,
            })
        })?;

        let mut rules = Vec::new();
        let mut unreadable = Vec::new();
        for row in rows {
            let row = row?;
            let conditions = self.list_condition_rows(row.id)?;
            let (id, feature_name) = (row.id, row.feature_name.clone());
            match decode_rule(row, conditions) {
                Ok(rule) => rules.push(rule),
                Err(error) => unreadable.push(UnreadableRule {
                    id,
                    feature_name,
                    error,
                }),
            }
        }
        Ok((rules, unreadable))
    }

    fn list_condition_rows(&self, rule_id: i64) -> Result<Vec<(String, String, String)>> {
        let mut stmt = self.conn.prepare(
            "SELECT target_object, operator, value FROM conditions WHERE rule_id = ?1 ORDER BY position",
        )?;
        let rows = stmt.query_map([rule_id], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)))?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    // --- Processing results ---

    /// Appends one result row per evaluated feature and stamps the company's
    /// `last_processed_at`, in a single short transaction.
    pub fn record_company_results(
        &self,
        company_id: i64,
        user_id: i64,
        results: &[NewResult],
        processed_at: &str,
    ) -> Result<Vec<ProcessingResult>> {
        let tx = self.conn.unchecked_transaction()?;
        let mut recorded = Vec::with_capacity(results.len());

        for result in results {
            tx.execute(
                "INSERT INTO processing_results (company_id, user_id, rule_id, feature_name, result_value, processed_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    company_id,
                    user_id,
                    result.rule_id,
                    result.feature_name,
                    result.result_value,
                    processed_at,
                ],
            )?;
            recorded.push(ProcessingResult {
                id: tx.last_insert_rowid(),
                company_id,
                user_id,
                rule_id: result.rule_id,
                feature_name: result.feature_name.clone(),
                result_value: result.result_value.clone(),
                processed_at: processed_at.to_string(),
            });
        }

        tx.execute(
            "UPDATE companies SET last_processed_at = ?1 WHERE id = ?2",
            params![processed_at, company_id],
        )?;
        tx.commit()?;
        Ok(recorded)
    }

    pub fn list_results_for_company(&self, company_id: i64) -> Result<Vec<ProcessedFeature>> {
        let mut stmt = self.conn.prepare(
            "SELECT u.user_name, r.feature_name, r.result_value, r.processed_at
             FROM processing_results r
             JOIN users u ON r.user_id = u.id
             WHERE r.company_id = ?1
             ORDER BY r.id",
        )?;
        let rows = stmt.query_map([company_id], |row| {
            let raw: String = row.get(2)?;
            Ok(ProcessedFeature {
                user_name: row.get(0)?,
                feature_name: row.get(1)?,
                value: serde_json::from_str(&raw).unwrap_or(serde_json::Value::String(raw)),
                processed_at: row.get(3)?,
            })
        })?;
        rows.collect::<Result<Vec<_>, _>>()
            .context("Failed to list processing results")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{BooleanOperator, Operator};
    use serde_json::json;

    fn test_db() -> Database {
        let db = Database::open_in_memory().unwrap();
        db.init().unwrap();
        db
    }

    fn corrupt_operator(db: &Database, feature_name: &str, operator: &str) {
        db.connection()
            .execute(
                "UPDATE conditions SET operator = ?1
                 WHERE rule_id = (SELECT id FROM rules WHERE feature_name = ?2)",
                params![operator, feature_name],
            )
            .unwrap();
    }

    fn new_company(url: &str, name: &str) -> NewCompany {
        NewCompany {
            url: url.to_string(),
            name: name.to_string(),
            founded_year: Some(2015),
            total_employees: Some(40),
            headquarters_city: Some("Lyon (France)".to_string()),
            headquarters_country: None,
            employee_locations: EmployeeLocations::from([("France".to_string(), 40)]),
            employee_growth_2y: Some(0.5),
            employee_growth_1y: None,
            employee_growth_6m: None,
            description: Some("Makes cheese robots".to_string()),
            industry: Some("Robotics".to_string()),
        }
    }

    fn definition(feature_name: &str) -> RuleDefinition {
        RuleDefinition {
            input: "size".to_string(),
            feature_name: feature_name.to_string(),
            match_value: json!(1),
            default_value: json!("small"),
            boolean_operator: BooleanOperator::And,
            conditions: vec![
                Condition {
                    target_object: "total_employees".to_string(),
                    operator: Operator::GreaterThan,
                    value: ConditionValue::Number(10.into()),
                },
                Condition {
                    target_object: "industry".to_string(),
                    operator: Operator::Equals,
                    value: ConditionValue::Text("Robotics".to_string()),
                },
            ],
        }
    }

    #[test]
    fn test_ensure_initialized() {
        let db = Database::open_in_memory().unwrap();
        assert!(db.ensure_initialized().is_err());
        db.init().unwrap();
        assert!(db.ensure_initialized().is_ok());
    }

    #[test]
    fn test_get_or_create_user_is_idempotent() {
        let db = test_db();
        let first = db.get_or_create_user("master_user").unwrap();
        let second = db.get_or_create_user("master_user").unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(db.list_users().unwrap().len(), 1);
        assert!(db.get_user_by_name("nobody").unwrap().is_none());
    }

    #[test]
    fn test_create_user_rejects_existing() {
        let db = test_db();
        let user = db.create_user("analyst").unwrap();
        assert_eq!(user.user_name, "analyst");
        assert!(user.created_at.ends_with('Z'));
        assert!(db.create_user("analyst").is_err());
        assert!(db.create_user("  ").is_err());
    }

    #[test]
    fn test_insert_company_dedupes_by_url() {
        let db = test_db();
        let company = new_company("https://a.example", "A");
        assert!(db.insert_company(&company).unwrap().is_some());
        assert!(db.insert_company(&company).unwrap().is_none());

        let stored = db.get_company_by_url("https://a.example").unwrap().unwrap();
        assert_eq!(stored.name, "A");
        assert_eq!(stored.employee_locations.get("France"), Some(&40));
        assert_eq!(stored.country(), Some("France".to_string()));
        assert!(stored.last_processed_at.is_none());
    }

    #[test]
    fn test_get_companies_by_urls_skips_unknown() {
        let db = test_db();
        db.insert_company(&new_company("https://a.example", "A")).unwrap();
        db.insert_company(&new_company("https://b.example", "B")).unwrap();

        let urls = vec!["https://b.example".to_string(), "https://zzz.example".to_string()];
        let companies = db.get_companies_by_urls(&urls).unwrap();
        assert_eq!(companies.len(), 1);
        assert_eq!(companies[0].name, "B");
        assert!(db.get_companies_by_urls(&[]).unwrap().is_empty());
    }

    #[test]
    fn test_rules_round_trip_through_storage() {
        let db = test_db();
        let created = db.create_rules("master_user", &[definition("is_big_robotics")]).unwrap();
        assert_eq!(created.len(), 1);

        let user = db.get_user_by_name("master_user").unwrap().unwrap();
        let rules = db.list_rules(user.id).unwrap();
        assert_eq!(rules.len(), 1);
        assert_eq!(rules[0].definition, definition("is_big_robotics"));
        assert_eq!(rules[0].user_id, user.id);
    }

    #[test]
    fn test_unreadable_rule_is_separated_from_the_rest() {
        let db = test_db();
        db.create_rules("master_user", &[definition("is_big_robotics"), definition("is_small")])
            .unwrap();
        corrupt_operator(&db, "is_small", "BETWEEN");
        let user = db.get_user_by_name("master_user").unwrap().unwrap();

        let (rules, unreadable) = db.load_rules(user.id).unwrap();
        assert_eq!(rules.len(), 1);
        assert_eq!(rules[0].definition.feature_name, "is_big_robotics");
        assert_eq!(unreadable.len(), 1);
        assert_eq!(unreadable[0].feature_name, "is_small");
        assert_eq!(unreadable[0].error.kind(), "UnsupportedOperator");

        assert!(db.list_rules(user.id).is_err());
    }

    #[test]
    fn test_duplicate_feature_rejects_whole_batch() {
        let db = test_db();
        db.create_rules("master_user", &[definition("is_big")]).unwrap();

        let err = db
            .create_rules("master_user", &[definition("is_new"), definition("is_big")])
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<RuleError>(),
            Some(RuleError::DuplicateRule { .. })
        ));

        let user = db.get_user_by_name("master_user").unwrap().unwrap();
        let names: Vec<String> = db
            .list_rules(user.id)
            .unwrap()
            .into_iter()
            .map(|rule| rule.definition.feature_name)
            .collect();
        assert_eq!(names, vec!["is_big".to_string()]);

        // the same feature name is fine for another user
        assert!(db.create_rules("other_user", &[definition("is_big")]).is_ok());
    }

    #[test]
    fn test_record_company_results_appends_history() {
        let db = test_db();
        let company_id = db.insert_company(&new_company("https://a.example", "A")).unwrap().unwrap();
        let rules = db.create_rules("master_user", &[definition("is_big")]).unwrap();
        let user_id = rules[0].user_id;
        let result = NewResult {
            rule_id: rules[0].id,
            feature_name: "is_big".to_string(),
            result_value: "1".to_string(),
        };

        db.record_company_results(company_id, user_id, &[result.clone()], "2025-03-01T10:00:00Z")
            .unwrap();
        let second = db
            .record_company_results(company_id, user_id, &[result], "2025-03-02T10:00:00Z")
            .unwrap();
        assert_eq!(second[0].processed_at, "2025-03-02T10:00:00Z");

        let history = db.list_results_for_company(company_id).unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].user_name, "master_user");
        assert_eq!(history[1].value, json!(1));

        let company = db.get_company_by_url("https://a.example").unwrap().unwrap();
        assert_eq!(company.last_processed_at.as_deref(), Some("2025-03-02T10:00:00Z"));
    }

    #[test]
    fn test_file_backed_database_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("featurizer.db");
        {
            let db = Database::open(Some(&path)).unwrap();
            db.init().unwrap();
            db.get_or_create_user("master_user").unwrap();
        }
        let db = Database::open(Some(&path)).unwrap();
        db.ensure_initialized().unwrap();
        assert_eq!(db.path(), Some(path.as_path()));
        assert!(db.get_user_by_name("master_user").unwrap().is_some());
    }
}
