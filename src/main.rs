mod ai;
mod config;
mod db;
mod error;
mod evaluate;
mod ingest;
mod logging;
mod models;
mod processor;
mod rules;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use config::{LlmConfig, Settings};
use db::Database;
use serde::Serialize;
use std::fs;
use std::path::PathBuf;
use std::time::Duration;
use tracing::info;

#[derive(Parser)]
#[command(name = "featurizer")]
#[command(about = "Evaluate user-defined rules against company records")]
struct Cli {
    /// Database file (defaults to FEATURIZER_DB or the user data directory)
    #[arg(long, global = true)]
    db: Option<PathBuf>,

    /// Increase log verbosity (-v info, -vv debug)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database
    Init,

    /// Import companies from a JSON or CSV file
    Import {
        /// Path to a JSON array or a CSV file with a header row
        file: PathBuf,

        /// File format (defaults to the file extension)
        #[arg(short, long, value_enum)]
        format: Option<ingest::ImportFormat>,
    },

    /// Manage users
    User {
        #[command(subcommand)]
        command: UserCommands,
    },

    /// Manage rules
    Rule {
        #[command(subcommand)]
        command: RuleCommands,
    },

    /// Evaluate a user's rules against companies
    Process {
        /// User whose rules are applied
        #[arg(short, long)]
        user: String,

        /// Company URLs to process
        #[arg(required = true)]
        urls: Vec<String>,

        /// Print failures alongside the results
        #[arg(long)]
        with_errors: bool,

        /// Model for LLM conditions (mistral-small, gpt-4o, haiku, ...)
        #[arg(short, long)]
        model: Option<String>,

        /// LLM request timeout in seconds
        #[arg(long)]
        timeout: Option<u64>,

        /// Companies evaluated in parallel
        #[arg(long)]
        parallel: Option<usize>,
    },

    /// Inspect imported companies
    Company {
        #[command(subcommand)]
        command: CompanyCommands,
    },
}

#[derive(Subcommand)]
enum UserCommands {
    /// Create a user
    Add {
        /// Unique user name
        name: String,
    },

    /// List users
    List,
}

#[derive(Subcommand)]
enum RuleCommands {
    /// Create rules from a request file: {"user_name": ..., "rules": [...]}
    Create {
        /// Path to the rule request JSON
        file: PathBuf,
    },

    /// List a user's rules
    List {
        /// User name
        #[arg(short, long)]
        user: String,
    },
}

#[derive(Subcommand)]
enum CompanyCommands {
    /// List all companies
    List,

    /// Show company details and processed features
    Show {
        /// Company URL
        url: String,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    logging::init_tracing(Some(logging::level_for_verbosity(cli.verbose)))?;

    let settings = Settings::from_env()?;
    let db_path = cli.db.clone().or_else(|| settings.db_path.clone());
    let db = Database::open(db_path.as_deref())?;

    match cli.command {
        Commands::Init => {
            db.init()?;
            if let Some(path) = db.path() {
                println!("Database initialized at {}", path.display());
            }
        }

        Commands::Import { file, format } => {
            db.ensure_initialized()?;
            let records = ingest::read_records(&file, format)?;
            let summary = ingest::import_companies(&db, records)?;
            info!(
                imported = summary.imported_records,
                skipped = summary.skipped_duplicates,
                errors = summary.record_errors,
                "Import finished"
            );
            print_json(&summary)?;
        }

        Commands::User { command } => {
            db.ensure_initialized()?;
            match command {
                UserCommands::Add { name } => {
                    let user = db.create_user(&name)?;
                    println!("Created user '{}' (ID: {})", user.user_name, user.id);
                }
                UserCommands::List => {
                    let users = db.list_users()?;
                    if users.is_empty() {
                        println!("No users found.");
                    } else {
                        println!("{:<6} {:<30} {:<22}", "ID", "NAME", "CREATED");
                        println!("{}", "-".repeat(58));
                        for user in users {
                            println!(
                                "{:<6} {:<30} {:<22}",
                                user.id,
                                truncate(&user.user_name, 28),
                                user.created_at
                            );
                        }
                    }
                }
            }
        }

        Commands::Rule { command } => {
            db.ensure_initialized()?;
            match command {
                RuleCommands::Create { file } => {
                    let raw = fs::read_to_string(&file)
                        .with_context(|| format!("Failed to read rule file: {}", file.display()))?;
                    let request: rules::CreateRulesRequest = serde_json::from_str(&raw)
                        .with_context(|| format!("Rule file is not a valid request: {}", file.display()))?;
                    let compiled = rules::compile_request(&request)?;
                    db.create_rules(request.user_name.trim(), &compiled)?;
                    print_json(&rules::CreateRulesResponse::created(
                        request.user_name.trim(),
                        compiled,
                    ))?;
                }
                RuleCommands::List { user } => {
                    let owner = db
                        .get_user_by_name(&user)?
                        .ok_or_else(|| error::RuleError::UserNotFound(user.clone()))?;
                    let stored = db.list_rules(owner.id)?;
                    if stored.is_empty() {
                        println!("No rules found for '{}'.", owner.user_name);
                    } else {
                        println!("{:<6} {:<28} {:<6} {:>10}", "ID", "FEATURE", "BOOL", "CONDITIONS");
                        println!("{}", "-".repeat(53));
                        for rule in &stored {
                            println!(
                                "{:<6} {:<28} {:<6} {:>10}",
                                rule.id,
                                truncate(&rule.definition.feature_name, 26),
                                rule.definition.boolean_operator,
                                rule.definition.conditions.len()
                            );
                            println!("       {}", rules::to_operation(&rule.definition));
                        }
                    }
                }
            }
        }

        Commands::Process {
            user,
            urls,
            with_errors,
            model,
            timeout,
            parallel,
        } => {
            db.ensure_initialized()?;

            let llm_config = match (model, timeout) {
                (None, None) => settings.llm_config()?,
                (model, timeout) => LlmConfig::for_model(
                    model.as_deref().unwrap_or(&settings.model),
                    timeout.map(Duration::from_secs).unwrap_or(settings.llm_timeout),
                )?,
            };
            let mut processor_config = settings.processor_config();
            if let Some(parallel) = parallel {
                processor_config.max_parallel = parallel.max(1);
            }

            info!(
                model = %llm_config.model.short_name,
                timeout_secs = llm_config.timeout.as_secs(),
                parallel = processor_config.max_parallel,
                "Starting processing"
            );
            let provider = ai::create_provider(&llm_config)?;
            let report = processor::process(&db, provider.as_ref(), &processor_config, &user, &urls)?;

            if with_errors {
                print_json(&report)?;
            } else {
                print_json(&report.results)?;
            }
        }

        Commands::Company { command } => {
            db.ensure_initialized()?;
            match command {
                CompanyCommands::List => {
                    let companies = db.list_companies()?;
                    if companies.is_empty() {
                        println!("No companies found.");
                    } else {
                        println!("{:<6} {:<26} {:<34} {:>9}", "ID", "NAME", "URL", "EMPLOYEES");
                        println!("{}", "-".repeat(78));
                        for company in companies {
                            let employees = company
                                .total_employees
                                .map(|n| n.to_string())
                                .unwrap_or_else(|| "-".to_string());
                            println!(
                                "{:<6} {:<26} {:<34} {:>9}",
                                company.id,
                                truncate(&company.name, 24),
                                truncate(&company.url, 32),
                                employees
                            );
                        }
                    }
                }
                CompanyCommands::Show { url } => match db.get_company_by_url(&url)? {
                    Some(company) => {
                        println!("Company #{}", company.id);
                        println!("Name: {}", company.name);
                        println!("URL: {}", company.url);
                        if let Some(industry) = &company.industry {
                            println!("Industry: {}", industry);
                        }
                        if let Some(year) = company.founded_year {
                            println!("Founded: {}", year);
                        }
                        if let Some(total) = company.total_employees {
                            println!("Employees: {}", total);
                        }
                        if let Some(city) = &company.headquarters_city {
                            println!("Headquarters: {}", city);
                        }
                        if let Some(country) = company.country() {
                            println!("Country: {}", country);
                        }
                        if !company.employee_locations.is_empty() {
                            println!(
                                "Locations: {}",
                                models::FieldValue::Mapping(company.employee_locations.clone())
                            );
                        }
                        println!("Imported: {}", company.imported_at);
                        if let Some(processed) = &company.last_processed_at {
                            println!("Last processed: {}", processed);
                        }
                        if let Some(description) = &company.description {
                            println!("\n--- Description ---");
                            for line in textwrap::fill(description, 78).lines() {
                                println!("{}", line);
                            }
                        }

                        let features = db.list_results_for_company(company.id)?;
                        if !features.is_empty() {
                            println!("\nFeatures ({}):", features.len());
                            for feature in features {
                                println!(
                                    "  {} {} = {} ({})",
                                    feature.user_name,
                                    feature.feature_name,
                                    feature.value,
                                    feature.processed_at
                                );
                            }
                        }
                    }
                    None => {
                        println!("Company '{}' not found.", url);
                    }
                },
            }
        }
    }

    Ok(())
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let kept: String = s.chars().take(max.saturating_sub(3)).collect();
        format!("{}...", kept)
    }
}
