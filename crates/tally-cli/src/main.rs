//! Tally CLI - Track spending from the command line
//!
//! Quick capture of transactions with minimal friction, plus sync against
//! a remote document store.

mod config;

use std::io;
use std::path::{Path, PathBuf};

use chrono::NaiveDate;
use clap::{CommandFactory, Parser, Subcommand};
use serde::Serialize;
use tally_core::remote::CouchClient;
use tally_core::store::{LocalStore, SqliteStore};
use tally_core::sync::{FileMetadataStore, MetadataStore, SyncEngine};
use tally_core::{Category, Transaction};
use thiserror::Error;

use config::CliConfig;

const DATE_FORMAT: &str = "%Y-%m-%d";

#[derive(Parser)]
#[command(name = "tally")]
#[command(about = "Track spending from the command line")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Optional path to local database file
    #[arg(long, value_name = "PATH")]
    db_path: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Record a transaction (negative amounts are spending)
    #[command(alias = "new")]
    Add {
        /// Amount, e.g. -12.50
        amount: String,
        /// Description
        description: Vec<String>,
        /// Category name (created on first use)
        #[arg(long)]
        category: Option<String>,
        /// Calendar date, defaults to today
        #[arg(long, value_name = "YYYY-MM-DD")]
        date: Option<String>,
    },
    /// List recent transactions
    List {
        /// Number of transactions to show
        #[arg(short, long, default_value = "10")]
        limit: usize,
        /// Filter by category name
        #[arg(long)]
        category: Option<String>,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Manage categories
    Category {
        #[command(subcommand)]
        command: CategoryCommands,
    },
    /// Sync with the remote store
    Sync {
        #[command(subcommand)]
        command: Option<SyncCommands>,
        /// Output the sync report as JSON
        #[arg(long)]
        json: bool,
    },
    /// Manage CLI configuration
    Config {
        #[command(subcommand)]
        command: ConfigCommands,
    },
}

#[derive(Subcommand)]
enum CategoryCommands {
    /// Create a category
    Add {
        /// Category name
        name: String,
        /// Display color, e.g. #a3be8c
        #[arg(long)]
        color: Option<String>,
    },
    /// List categories
    List {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
}

#[derive(Subcommand)]
enum SyncCommands {
    /// Show the last known sync status
    Status {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// List recently resolved sync conflicts
    Conflicts {
        /// Number of conflicts to show
        #[arg(short, long, default_value = "10")]
        limit: usize,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
}

#[derive(Subcommand)]
enum ConfigCommands {
    /// Initialize or update the sync configuration
    Init {
        /// Remote document store base URL
        #[arg(long, value_name = "URL")]
        server_url: Option<String>,
        /// Remote database name
        #[arg(long, value_name = "NAME")]
        database: Option<String>,
        /// Basic auth username
        #[arg(long, value_name = "NAME")]
        username: Option<String>,
        /// Basic auth password
        #[arg(long, value_name = "SECRET")]
        password: Option<String>,
    },
    /// Print the current configuration (secrets redacted)
    Show,
}

#[derive(Debug, Error)]
enum CliError {
    #[error(transparent)]
    Core(#[from] tally_core::Error),
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Serialization(#[from] serde_json::Error),
    #[error("Invalid amount: {0}")]
    InvalidAmount(String),
    #[error("Invalid date (expected YYYY-MM-DD): {0}")]
    InvalidDate(String),
    #[error("No description provided")]
    EmptyDescription,
    #[error("Configuration error: {0}")]
    Config(String),
    #[error(
        "Sync is not configured. Run `tally config init --server-url <URL> --database <NAME>`, or set TALLY_SERVER_URL and TALLY_DATABASE."
    )]
    SyncNotConfigured,
    #[error("Sync finished with {0} error(s)")]
    SyncFinishedWithErrors(usize),
}

#[tokio::main]
async fn main() {
    if let Err(error) = run().await {
        eprintln!("Error: {error}");
        std::process::exit(1);
    }
}

async fn run() -> Result<(), CliError> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("tally=info".parse().unwrap()),
        )
        .init();

    let cli = Cli::parse();
    let db_path = resolve_db_path(cli.db_path)?;

    match cli.command {
        Some(Commands::Add {
            amount,
            description,
            category,
            date,
        }) => run_add(&amount, &description, category.as_deref(), date.as_deref(), &db_path)?,
        Some(Commands::List {
            limit,
            category,
            json,
        }) => run_list(limit, category.as_deref(), json, &db_path)?,
        Some(Commands::Category { command }) => match command {
            CategoryCommands::Add { name, color } => {
                run_category_add(&name, color.as_deref(), &db_path)?;
            }
            CategoryCommands::List { json } => run_category_list(json, &db_path)?,
        },
        Some(Commands::Sync { command, json }) => match command {
            None => run_sync(json, &db_path).await?,
            Some(SyncCommands::Status { json }) => run_sync_status(json)?,
            Some(SyncCommands::Conflicts { limit, json }) => {
                run_sync_conflicts(limit, json, &db_path)?;
            }
        },
        Some(Commands::Config { command }) => match command {
            ConfigCommands::Init {
                server_url,
                database,
                username,
                password,
            } => run_config_init(server_url, database, username, password)?,
            ConfigCommands::Show => run_config_show()?,
        },
        None => {
            Cli::command().print_help().map_err(CliError::Io)?;
            println!();
        }
    }

    Ok(())
}

fn run_add(
    amount_raw: &str,
    description_parts: &[String],
    category: Option<&str>,
    date: Option<&str>,
    db_path: &Path,
) -> Result<(), CliError> {
    let amount = parse_amount(amount_raw)?;
    let description = resolve_description(description_parts)?;

    let store = open_store(db_path)?;
    let mut tx = Transaction::new(amount, description);
    if let Some(raw) = date {
        let occurred_on = NaiveDate::parse_from_str(raw, DATE_FORMAT)
            .map_err(|_| CliError::InvalidDate(raw.to_string()))?;
        tx = tx.with_date(occurred_on);
    }
    if let Some(name) = category {
        let category = ensure_category(&store, name)?;
        tx = tx.with_category(category.id);
    }
    store.put_transaction(&tx)?;

    println!("{}", tx.id);
    Ok(())
}

#[derive(Debug, Serialize)]
struct TransactionListItem {
    id: String,
    amount: f64,
    description: String,
    category: Option<String>,
    date: String,
    updated_at: String,
}

fn run_list(
    limit: usize,
    category: Option<&str>,
    as_json: bool,
    db_path: &Path,
) -> Result<(), CliError> {
    let store = open_store(db_path)?;
    let transactions = list_transactions(&store, limit, category)?;
    let category_names = category_name_index(&store)?;

    if as_json {
        let items: Vec<TransactionListItem> = transactions
            .iter()
            .map(|tx| transaction_to_list_item(tx, &category_names))
            .collect();
        println!("{}", serde_json::to_string_pretty(&items)?);
    } else {
        for tx in &transactions {
            let category = tx
                .category_id
                .as_ref()
                .and_then(|id| category_names.get(&id.as_str()))
                .map_or_else(String::new, |name| format!("  [{name}]"));
            println!(
                "{}  {:>10.2}  {}{}",
                tx.occurred_on.format(DATE_FORMAT),
                tx.amount,
                tx.description,
                category
            );
        }
    }

    Ok(())
}

fn run_category_add(name: &str, color: Option<&str>, db_path: &Path) -> Result<(), CliError> {
    let store = open_store(db_path)?;
    if store.find_category_by_name(name)?.is_some() {
        return Err(CliError::Config(format!(
            "category already exists: {name}"
        )));
    }

    let mut category = Category::new(name);
    if let Some(color) = color {
        category = category.with_color(color);
    }
    store.put_category(&category)?;

    println!("{}", category.id);
    Ok(())
}

fn run_category_list(as_json: bool, db_path: &Path) -> Result<(), CliError> {
    let store = open_store(db_path)?;
    let categories = store.list_categories()?;

    if as_json {
        println!("{}", serde_json::to_string_pretty(&categories)?);
    } else {
        for category in &categories {
            match &category.color {
                Some(color) => println!("{}  ({color})", category.name),
                None => println!("{}", category.name),
            }
        }
    }

    Ok(())
}

async fn run_sync(as_json: bool, db_path: &Path) -> Result<(), CliError> {
    let cli_config = CliConfig::load().map_err(CliError::Config)?;
    let settings = config::resolve_settings(&cli_config).ok_or(CliError::SyncNotConfigured)?;

    let store = open_store(db_path)?;
    let client = CouchClient::new(&settings)?;
    let metadata = FileMetadataStore::new(sync_metadata_dir()?);
    let engine = SyncEngine::new(store, client, metadata, settings);

    engine.initialize().await?;
    let report = engine.sync().await?;

    if as_json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!(
            "Uploaded {} and downloaded {} documents ({} conflicts resolved)",
            report.documents_uploaded, report.documents_downloaded, report.conflicts_resolved
        );
        for error in &report.errors {
            eprintln!("warning: {error}");
        }
    }

    if report.success {
        Ok(())
    } else {
        Err(CliError::SyncFinishedWithErrors(report.errors.len()))
    }
}

fn run_sync_status(as_json: bool) -> Result<(), CliError> {
    let metadata = FileMetadataStore::new(sync_metadata_dir()?);
    let Some(status) = metadata.load_status()? else {
        println!("No sync has run yet");
        return Ok(());
    };

    if as_json {
        println!("{}", serde_json::to_string_pretty(&status)?);
    } else {
        match status.last_sync {
            Some(last_sync) => println!("Last sync: {last_sync}"),
            None => println!("Last sync: never"),
        }
        println!(
            "Uploaded {} / downloaded {} documents",
            status.documents_uploaded, status.documents_downloaded
        );
        if let Some(error) = &status.error {
            println!("Last error: {error}");
        }
    }

    Ok(())
}

fn run_sync_conflicts(limit: usize, as_json: bool, db_path: &Path) -> Result<(), CliError> {
    let store = open_store(db_path)?;
    let conflicts = store.recent_conflicts(limit)?;

    if as_json {
        println!("{}", serde_json::to_string_pretty(&conflicts)?);
    } else if conflicts.is_empty() {
        println!("No sync conflicts recorded");
    } else {
        for conflict in &conflicts {
            println!(
                "{}  {}:{}  {}",
                conflict.resolved_at, conflict.record_kind, conflict.record_id, conflict.strategy
            );
        }
    }

    Ok(())
}

fn run_config_init(
    server_url: Option<String>,
    database: Option<String>,
    username: Option<String>,
    password: Option<String>,
) -> Result<(), CliError> {
    let mut cli_config = CliConfig::load().map_err(CliError::Config)?;

    let mut settings = cli_config
        .sync
        .take()
        .unwrap_or_else(|| tally_core::SyncSettings::new("", ""));
    if let Some(server_url) = server_url {
        settings.server_url = server_url;
    }
    if let Some(database) = database {
        settings.database = database;
    }
    if let Some(username) = username {
        settings.username = Some(username);
    }
    if let Some(password) = password {
        settings.password = Some(password);
    }
    settings.validate()?;

    cli_config.sync = Some(settings);
    let path = cli_config.save().map_err(CliError::Config)?;
    println!("{}", path.display());
    Ok(())
}

fn run_config_show() -> Result<(), CliError> {
    let cli_config = CliConfig::load().map_err(CliError::Config)?;
    match config::resolve_settings(&cli_config) {
        // Debug impl redacts the password
        Some(settings) => println!("{settings:#?}"),
        None => println!("Sync is not configured"),
    }
    Ok(())
}

fn parse_amount(raw: &str) -> Result<f64, CliError> {
    let amount: f64 = raw
        .trim()
        .parse()
        .map_err(|_| CliError::InvalidAmount(raw.to_string()))?;
    if amount.is_finite() {
        Ok(amount)
    } else {
        Err(CliError::InvalidAmount(raw.to_string()))
    }
}

fn resolve_description(parts: &[String]) -> Result<String, CliError> {
    let description = parts.join(" ").trim().to_string();
    if description.is_empty() {
        return Err(CliError::EmptyDescription);
    }
    Ok(description)
}

fn ensure_category(store: &SqliteStore, name: &str) -> Result<Category, CliError> {
    if let Some(existing) = store.find_category_by_name(name)? {
        return Ok(existing);
    }
    let category = Category::new(name);
    store.put_category(&category)?;
    Ok(category)
}

fn list_transactions(
    store: &SqliteStore,
    limit: usize,
    category: Option<&str>,
) -> Result<Vec<Transaction>, CliError> {
    let Some(name) = category else {
        return Ok(store.list_transactions(limit)?);
    };

    let Some(category) = store.find_category_by_name(name)? else {
        return Ok(Vec::new());
    };
    // Over-fetch, then narrow to the category
    let mut transactions = store.list_transactions(10_000)?;
    transactions.retain(|tx| tx.category_id.as_ref() == Some(&category.id));
    transactions.truncate(limit);
    Ok(transactions)
}

fn category_name_index(
    store: &SqliteStore,
) -> Result<std::collections::HashMap<String, String>, CliError> {
    Ok(store
        .list_categories()?
        .into_iter()
        .map(|category| (category.id.as_str(), category.name))
        .collect())
}

fn transaction_to_list_item(
    tx: &Transaction,
    category_names: &std::collections::HashMap<String, String>,
) -> TransactionListItem {
    TransactionListItem {
        id: tx.id.as_str(),
        amount: tx.amount,
        description: tx.description.clone(),
        category: tx
            .category_id
            .as_ref()
            .and_then(|id| category_names.get(&id.as_str()).cloned()),
        date: tx.occurred_on.format(DATE_FORMAT).to_string(),
        updated_at: tx.updated_at.to_rfc3339(),
    }
}

fn open_store(path: &Path) -> Result<SqliteStore, CliError> {
    Ok(SqliteStore::open(path)?)
}

fn resolve_db_path(explicit: Option<PathBuf>) -> Result<PathBuf, CliError> {
    if let Some(path) = explicit {
        return Ok(path);
    }
    Ok(config::default_data_dir()
        .map_err(CliError::Config)?
        .join("tally.db"))
}

fn sync_metadata_dir() -> Result<PathBuf, CliError> {
    Ok(config::default_data_dir()
        .map_err(CliError::Config)?
        .join("sync"))
}
