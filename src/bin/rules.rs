//! carepath-rules CLI
//!
//! Manage permission rules and run access checks against a CRM SQLite database

use anyhow::{bail, Context, Result};
use carepath_rules::{
    AuditQuery, AuditWriter, Condition, EngineConfig, EntityKind, Record, RuleConfig, RuleEngine, SqliteStore,
};
use clap::{Parser, Subcommand};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "carepath-rules")]
#[command(about = "Row-level permission rules for CRM records")]
struct Args {
    /// Path to the SQLite database
    #[arg(long, global = true, default_value = "crm.db")]
    db: PathBuf,

    /// Engine configuration (TOML)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create the rule, evaluation and audit tables
    Migrate,

    /// Evaluate a user's access to one entity
    Check {
        #[arg(long)]
        entity_type: String,
        #[arg(long)]
        entity_id: i64,
        #[arg(long)]
        user_id: i64,
    },

    /// Manage permission rules
    #[command(subcommand)]
    Rules(RulesCommand),

    /// Evaluate a condition tree against an entity record, with no side effects
    Simulate {
        /// Condition tree as JSON, or @path to read it from a file
        #[arg(long)]
        conditions: String,
        /// Entity record as a JSON object, or @path
        #[arg(long)]
        entity: String,
    },

    /// Show audit log entries, newest first
    Audit {
        #[arg(long)]
        entity_type: Option<String>,
        #[arg(long, requires = "entity_type")]
        entity_id: Option<i64>,
        #[arg(long)]
        user_id: Option<i64>,
        #[arg(long, default_value = "50")]
        limit: usize,
    },

    /// Write audit records spilled by the background writer back to the database
    ReplayAudit {
        /// Spill file (JSON lines)
        #[arg(long)]
        file: PathBuf,
    },
}

#[derive(Subcommand, Debug)]
enum RulesCommand {
    /// List rules, optionally only the active ones of one subject type
    List {
        #[arg(long)]
        subject_type: Option<String>,
    },

    /// Create a rule from a JSON definition
    Add {
        /// Rule definition file
        #[arg(long)]
        file: PathBuf,
        /// Id of the user creating the rule
        #[arg(long)]
        created_by: i64,
    },

    /// Delete a rule
    Delete {
        #[arg(long)]
        id: i64,
    },
}

/// Read a JSON argument given inline or as `@path`
fn read_json_arg(arg: &str) -> Result<String> {
    match arg.strip_prefix('@') {
        Some(path) => {
            std::fs::read_to_string(path).with_context(|| format!("Failed to read {}", path))
        }
        None => Ok(arg.to_string()),
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn open_engine(db: &Path, config: Option<&Path>) -> Result<RuleEngine> {
    let config = match config {
        Some(path) => EngineConfig::load(path)
            .with_context(|| format!("Failed to load config {:?}", path))?,
        None => EngineConfig::default(),
    };

    let store = SqliteStore::open(db).with_context(|| format!("Failed to open {:?}", db))?;
    Ok(RuleEngine::with_config(Arc::new(store), config))
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let args = Args::parse();

    match args.command {
        Command::Migrate => {
            let store = SqliteStore::open(&args.db)
                .with_context(|| format!("Failed to open {:?}", args.db))?;
            store.migrate()?;
            info!("Schema ready in {:?}", args.db);
        }

        Command::Check {
            entity_type,
            entity_id,
            user_id,
        } => {
            let engine = open_engine(&args.db, args.config.as_deref())?;
            let access = engine.evaluate_user_access(&entity_type, entity_id, user_id)?;
            engine.flush_audit()?;
            print_json(&access)?;
        }

        Command::Rules(RulesCommand::List { subject_type }) => {
            let engine = open_engine(&args.db, args.config.as_deref())?;
            match subject_type {
                Some(subject_type) => {
                    if subject_type.parse::<EntityKind>().is_err() {
                        bail!("Unknown subject type '{}'", subject_type);
                    }
                    print_json(&engine.get_rules_for_entity(&subject_type)?.to_vec())?;
                }
                None => print_json(&engine.get_all_rules()?)?,
            }
        }

        Command::Rules(RulesCommand::Add { file, created_by }) => {
            let engine = open_engine(&args.db, args.config.as_deref())?;
            let text = std::fs::read_to_string(&file)
                .with_context(|| format!("Failed to read {:?}", file))?;
            let config: RuleConfig =
                serde_json::from_str(&text).context("Invalid rule definition")?;
            let rule = engine.create_rule(&config, created_by)?;
            engine.flush_audit()?;
            print_json(&rule)?;
        }

        Command::Rules(RulesCommand::Delete { id }) => {
            let engine = open_engine(&args.db, args.config.as_deref())?;
            engine.delete_rule(id)?;
            engine.flush_audit()?;
            info!("Deleted rule {}", id);
        }

        Command::Simulate { conditions, entity } => {
            let engine = open_engine(&args.db, args.config.as_deref())?;
            let conditions: Condition = serde_json::from_str(&read_json_arg(&conditions)?)
                .context("Invalid condition tree")?;
            let entity: Record = serde_json::from_str(&read_json_arg(&entity)?)
                .context("Entity must be a JSON object")?;
            print_json(&engine.simulate(&conditions, &entity))?;
        }

        Command::Audit {
            entity_type,
            entity_id,
            user_id,
            limit,
        } => {
            let engine = open_engine(&args.db, args.config.as_deref())?;
            let mut query = AuditQuery::new().limit(limit);
            query.entity_type = entity_type;
            query.entity_id = entity_id;
            query.user_id = user_id;
            print_json(&engine.audit_log(&query)?)?;
        }

        Command::ReplayAudit { file } => {
            let records = AuditWriter::read_spill(&file)
                .with_context(|| format!("Failed to read spill file {:?}", file))?;
            let store = SqliteStore::open(&args.db)
                .with_context(|| format!("Failed to open {:?}", args.db))?;
            for (line, record) in records.iter().enumerate() {
                record
                    .write_to(&store)
                    .with_context(|| format!("Failed to replay record {}", line + 1))?;
            }
            info!("Replayed {} audit records from {:?}", records.len(), file);
        }
    }

    Ok(())
}
