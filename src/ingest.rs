use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashSet;
use std::fs;
use std::path::Path;
use tracing::{debug, warn};

use crate::db::Database;
use crate::models::{EmployeeLocations, NewCompany};

/// One company as it appears in an import file. Numbers may arrive as
/// strings and several column names have historical spellings.
#[derive(Debug, Default, Deserialize)]
pub struct CompanyRecord {
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default, alias = "company_name")]
    pub name: Option<String>,
    #[serde(default)]
    pub founded_year: Option<Value>,
    #[serde(default)]
    pub total_employees: Option<Value>,
    #[serde(default)]
    pub headquarters_city: Option<String>,
    #[serde(default)]
    pub headquarters_country: Option<String>,
    #[serde(default)]
    pub employee_locations: Option<Value>,
    #[serde(default, alias = "employee_rowth_2Y", alias = "employee_growth_2Y")]
    pub employee_growth_2y: Option<Value>,
    #[serde(default, alias = "employee_growth_1Y")]
    pub employee_growth_1y: Option<Value>,
    #[serde(default, alias = "employee_growth_6M")]
    pub employee_growth_6m: Option<Value>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub industry: Option<String>,
}

impl CompanyRecord {
    pub fn into_new_company(self) -> Result<NewCompany> {
        let url = clean(self.url).ok_or_else(|| anyhow!("missing url"))?;
        let name = clean(self.name).ok_or_else(|| anyhow!("missing name for {}", url))?;

        Ok(NewCompany {
            url,
            name,
            founded_year: self.founded_year.as_ref().and_then(integer_or_none),
            total_employees: self.total_employees.as_ref().and_then(integer_or_none),
            headquarters_city: clean(self.headquarters_city),
            headquarters_country: clean(self.headquarters_country),
            employee_locations: self
                .employee_locations
                .as_ref()
                .map(parse_locations)
                .unwrap_or_default(),
            employee_growth_2y: self.employee_growth_2y.as_ref().and_then(float_or_none),
            employee_growth_1y: self.employee_growth_1y.as_ref().and_then(float_or_none),
            employee_growth_6m: self.employee_growth_6m.as_ref().and_then(float_or_none),
            description: clean(self.description),
            industry: clean(self.industry),
        })
    }
}

#[derive(Debug, Default, Serialize, PartialEq)]
pub struct ImportSummary {
    pub imported_records: usize,
    pub skipped_duplicates: usize,
    pub record_errors: usize,
    pub errors: Vec<String>,
}

/// Layout of an import file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum ImportFormat {
    Json,
    Csv,
}

impl ImportFormat {
    /// Guesses from the extension; anything that is not `.csv` is JSON.
    pub fn from_path(path: &Path) -> Self {
        match path.extension().and_then(|ext| ext.to_str()) {
            Some(ext) if ext.eq_ignore_ascii_case("csv") => ImportFormat::Csv,
            _ => ImportFormat::Json,
        }
    }
}

/// Reads company records from disk, as JSON objects ready for
/// [`import_companies`].
pub fn read_records(path: &Path, format: Option<ImportFormat>) -> Result<Vec<Value>> {
    match format.unwrap_or_else(|| ImportFormat::from_path(path)) {
        ImportFormat::Json => read_json_records(path),
        ImportFormat::Csv => read_csv_records(path),
    }
}

fn read_json_records(path: &Path) -> Result<Vec<Value>> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("Failed to read import file: {}", path.display()))?;
    let parsed: Value = serde_json::from_str(&raw)
        .with_context(|| format!("Import file is not valid JSON: {}", path.display()))?;

    match parsed {
        Value::Array(records) => Ok(records),
        _ => Err(anyhow!("Import file must contain a JSON array of companies")),
    }
}

/// Each row becomes an object keyed by header. Empty cells are left out so
/// they read as missing values.
fn read_csv_records(path: &Path) -> Result<Vec<Value>> {
    let mut reader = csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .flexible(true)
        .from_path(path)
        .with_context(|| format!("Failed to read import file: {}", path.display()))?;
    let headers = reader
        .headers()
        .with_context(|| format!("CSV import file has no header row: {}", path.display()))?
        .clone();

    let mut records = Vec::new();
    for (line, row) in reader.records().enumerate() {
        let row = row.with_context(|| format!("Invalid CSV row {}", line + 2))?;
        let object: Map<String, Value> = headers
            .iter()
            .zip(row.iter())
            .filter(|(_, cell)| !cell.is_empty())
            .map(|(header, cell)| (header.to_string(), Value::String(cell.to_string())))
            .collect();
        records.push(Value::Object(object));
    }
    Ok(records)
}

/// Inserts new companies, skipping URLs already stored or already seen in
/// this batch. A bad record is counted and reported without stopping the rest.
pub fn import_companies(db: &Database, records: Vec<Value>) -> Result<ImportSummary> {
    let mut summary = ImportSummary::default();
    let mut seen_urls: HashSet<String> = HashSet::new();

    for (index, raw) in records.into_iter().enumerate() {
        let company = match serde_json::from_value::<CompanyRecord>(raw)
            .map_err(anyhow::Error::from)
            .and_then(CompanyRecord::into_new_company)
        {
            Ok(company) => company,
            Err(e) => {
                warn!(record = index, "Skipping company record: {:#}", e);
                summary.record_errors += 1;
                summary.errors.push(format!("record {}: {:#}", index, e));
                continue;
            }
        };

        if !seen_urls.insert(company.url.clone()) {
            debug!(url = %company.url, "Duplicate URL within import file");
            summary.skipped_duplicates += 1;
            continue;
        }

        match db.insert_company(&company)? {
            Some(id) => {
                debug!(id, url = %company.url, "Imported company");
                summary.imported_records += 1;
            }
            None => summary.skipped_duplicates += 1,
        }
    }

    Ok(summary)
}

fn clean(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn float_or_none(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn integer_or_none(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
        Value::String(s) => {
            let s = s.trim();
            s.parse::<i64>()
                .ok()
                .or_else(|| s.parse::<f64>().ok().map(|f| f as i64))
        }
        _ => None,
    }
}

/// Accepts `{"USA": 10}`, the same object encoded as a string, or free text
/// like `"USA: 10, Canada"`. Regions without a count get 0.
pub fn parse_locations(value: &Value) -> EmployeeLocations {
    match value {
        Value::Object(map) => map
            .iter()
            .map(|(region, count)| {
                let count = integer_or_none(count).unwrap_or(0).max(0) as u64;
                (region.trim().to_string(), count)
            })
            .filter(|(region, _)| !region.is_empty())
            .collect(),
        Value::String(text) => {
            let text = text.trim();
            if text.starts_with('{') {
                if let Ok(parsed @ Value::Object(_)) = serde_json::from_str::<Value>(text) {
                    return parse_locations(&parsed);
                }
            }
            parse_location_list(text)
        }
        _ => EmployeeLocations::new(),
    }
}

fn parse_location_list(text: &str) -> EmployeeLocations {
    let mut locations = EmployeeLocations::new();
    for entry in text.split([',', ';']) {
        let (region, count) = match entry.rsplit_once(':') {
            Some((region, count)) => (region, count.trim().parse::<u64>().unwrap_or(0)),
            None => (entry, 0),
        };
        let region = region.trim();
        if !region.is_empty() {
            *locations.entry(region.to_string()).or_insert(0) += count;
        }
    }
    locations
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn test_db() -> Database {
        let db = Database::open_in_memory().unwrap();
        db.init().unwrap();
        db
    }

    #[test]
    fn test_record_aliases_and_string_numbers() {
        let record: CompanyRecord = serde_json::from_value(json!({
            "company_name": " Acme ",
            "url": "https://acme.example",
            "founded_year": "2010",
            "total_employees": 150,
            "employee_rowth_2Y": "0.25",
            "employee_growth_1Y": 0.1,
            "employee_growth_6M": "n/a",
            "headquarters_city": "Toronto (Canada)",
            "description": ""
        }))
        .unwrap();

        let company = record.into_new_company().unwrap();
        assert_eq!(company.name, "Acme");
        assert_eq!(company.founded_year, Some(2010));
        assert_eq!(company.total_employees, Some(150));
        assert_eq!(company.employee_growth_2y, Some(0.25));
        assert_eq!(company.employee_growth_1y, Some(0.1));
        assert_eq!(company.employee_growth_6m, None);
        assert_eq!(company.description, None);
    }

    #[test]
    fn test_parse_locations_formats() {
        let from_object = parse_locations(&json!({"USA": 10, "Canada": "4"}));
        assert_eq!(from_object.get("USA"), Some(&10));
        assert_eq!(from_object.get("Canada"), Some(&4));

        let from_string = parse_locations(&json!("{\"UK\": 3}"));
        assert_eq!(from_string.get("UK"), Some(&3));

        let from_list = parse_locations(&json!("San Francisco, New York: 12"));
        assert_eq!(from_list.get("San Francisco"), Some(&0));
        assert_eq!(from_list.get("New York"), Some(&12));

        assert!(parse_locations(&json!(null)).is_empty());
    }

    #[test]
    fn test_import_counts_duplicates_and_errors() {
        let db = test_db();
        db.insert_company(&NewCompany {
            url: "https://old.example".to_string(),
            name: "Old".to_string(),
            ..Default::default()
        })
        .unwrap();

        let records = vec![
            json!({"name": "A", "url": "https://a.example"}),
            json!({"name": "A again", "url": "https://a.example"}),
            json!({"name": "Old", "url": "https://old.example"}),
            json!({"name": "No url"}),
            json!({"name": "Bad", "url": "https://bad.example", "industry": 7}),
        ];

        let summary = import_companies(&db, records).unwrap();
        assert_eq!(summary.imported_records, 1);
        assert_eq!(summary.skipped_duplicates, 2);
        assert_eq!(summary.record_errors, 2);
        assert_eq!(summary.errors.len(), 2);
        assert!(summary.errors[0].starts_with("record 3"));
        assert_eq!(db.list_companies().unwrap().len(), 2);
    }

    #[test]
    fn test_read_records_requires_array() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("companies.json");

        fs::write(&path, r#"[{"name": "A", "url": "https://a.example"}]"#).unwrap();
        assert_eq!(read_records(&path, None).unwrap().len(), 1);

        fs::write(&path, r#"{"name": "A"}"#).unwrap();
        assert!(read_records(&path, None).is_err());
    }

    #[test]
    fn test_csv_import_with_legacy_headers() {
        let db = test_db();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("companies.csv");
        fs::write(
            &path,
            "company_name,url,founded_year,total_employees,headquarters_city,employee_locations,employee_rowth_2Y,employee_growth_1Y,employee_growth_6M,description,industry\n\
             Acme,https://acme.example,2010,150,Toronto (Canada),\"Canada: 100, USA: 50\",0.25,,0.05,Developer tooling,Technology\n\
             Acme dup,https://acme.example,2011,1,,,,,,,\n\
             ,https://nameless.example,2020,3,,,,,,,\n",
        )
        .unwrap();

        assert_eq!(ImportFormat::from_path(&path), ImportFormat::Csv);
        let records = read_records(&path, None).unwrap();
        assert_eq!(records.len(), 3);

        let summary = import_companies(&db, records).unwrap();
        assert_eq!(summary.imported_records, 1);
        assert_eq!(summary.skipped_duplicates, 1);
        assert_eq!(summary.record_errors, 1);

        let acme = db.get_company_by_url("https://acme.example").unwrap().unwrap();
        assert_eq!(acme.name, "Acme");
        assert_eq!(acme.founded_year, Some(2010));
        assert_eq!(acme.total_employees, Some(150));
        assert_eq!(acme.employee_growth_2y, Some(0.25));
        assert_eq!(acme.employee_growth_1y, None);
        assert_eq!(acme.employee_growth_6m, Some(0.05));
        assert_eq!(acme.employee_locations.get("USA"), Some(&50));
        assert_eq!(acme.country(), Some("Canada".to_string()));
    }

    #[test]
    fn test_format_flag_overrides_extension() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("companies.txt");
        fs::write(&path, "company_name,url\nAcme,https://acme.example\n").unwrap();

        assert_eq!(ImportFormat::from_path(&path), ImportFormat::Json);
        assert!(read_records(&path, None).is_err());
        let records = read_records(&path, Some(ImportFormat::Csv)).unwrap();
        assert_eq!(records[0]["company_name"], "Acme");
    }
}
