use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Result};
use clap::{Args, Parser, Subcommand};
use record_ledger_api::RecordLedgerApi;
use record_ledger_core::{AttributeDelta, RecordId};
use record_ledger_store_sqlite::SqliteStore;
use serde::Serialize;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "rl")]
#[command(about = "Record ledger CLI")]
struct Cli {
    #[arg(long, default_value = "./record_ledger.sqlite3")]
    db: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    Db {
        #[command(subcommand)]
        command: DbCommand,
    },
    Record {
        #[command(subcommand)]
        command: RecordCommand,
    },
}

#[derive(Debug, Subcommand)]
enum DbCommand {
    SchemaVersion,
    Migrate(DbMigrateArgs),
    Export(DbExportArgs),
    Import(DbImportArgs),
    Backup(DbBackupArgs),
    Restore(DbRestoreArgs),
    IntegrityCheck,
}

#[derive(Debug, Args)]
struct DbMigrateArgs {
    #[arg(long, default_value_t = false)]
    dry_run: bool,
}

#[derive(Debug, Args)]
struct DbExportArgs {
    #[arg(long)]
    out: PathBuf,
}

#[derive(Debug, Args)]
struct DbImportArgs {
    #[arg(long = "in")]
    input: PathBuf,
    #[arg(long, default_value_t = true)]
    skip_existing: bool,
}

#[derive(Debug, Args)]
struct DbBackupArgs {
    #[arg(long)]
    out: PathBuf,
}

#[derive(Debug, Args)]
struct DbRestoreArgs {
    #[arg(long = "in")]
    input: PathBuf,
}

#[derive(Debug, Subcommand)]
enum RecordCommand {
    Get(RecordGetArgs),
    Upsert(RecordUpsertArgs),
    Versions(RecordIdArgs),
    Show(RecordShowArgs),
}

#[derive(Debug, Args)]
struct RecordIdArgs {
    #[arg(long)]
    id: i64,
}

#[derive(Debug, Args)]
struct RecordGetArgs {
    #[arg(long)]
    id: i64,
    /// Read the version in force just before this unix timestamp instead of
    /// the latest one.
    #[arg(long)]
    at: Option<i64>,
}

#[derive(Debug, Args)]
struct RecordUpsertArgs {
    #[arg(long)]
    id: i64,
    /// Unix timestamp the change took effect; defaults to now. An earlier
    /// timestamp than existing versions performs a retroactive update.
    #[arg(long)]
    effective: Option<i64>,
    /// Attribute to set, as key=value. Repeatable.
    #[arg(long = "set")]
    set: Vec<String>,
    /// Attribute key to delete. Repeatable.
    #[arg(long = "unset")]
    unset: Vec<String>,
}

#[derive(Debug, Args)]
struct RecordShowArgs {
    #[arg(long)]
    id: i64,
    #[arg(long)]
    version: i64,
}

fn emit_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn parse_set_pair(raw: &str) -> Result<(String, String)> {
    let (key, value) = raw
        .split_once('=')
        .ok_or_else(|| anyhow!("--set expects key=value, got {raw:?}"))?;
    if key.is_empty() {
        return Err(anyhow!("--set expects a non-empty key, got {raw:?}"));
    }
    Ok((key.to_string(), value.to_string()))
}

fn build_delta(set: &[String], unset: &[String]) -> Result<AttributeDelta> {
    let mut edits: BTreeMap<String, Option<String>> = BTreeMap::new();
    for raw in set {
        let (key, value) = parse_set_pair(raw)?;
        edits.insert(key, Some(value));
    }
    for key in unset {
        if edits.contains_key(key) {
            return Err(anyhow!("key {key:?} is both set and unset"));
        }
        edits.insert(key.clone(), None);
    }
    Ok(AttributeDelta(edits))
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_target(false)
        .init();

    let cli = Cli::parse();
    match cli.command {
        Command::Db { command } => run_db_command(&cli.db, command),
        Command::Record { command } => run_record_command(&cli.db, command),
    }
}

fn run_db_command(db: &Path, command: DbCommand) -> Result<()> {
    match command {
        DbCommand::SchemaVersion => {
            let store = SqliteStore::open(db)?;
            emit_json(&store.schema_status()?)
        }
        DbCommand::Migrate(args) => {
            let api = RecordLedgerApi::new(db.to_path_buf());
            emit_json(&api.migrate(args.dry_run)?)
        }
        DbCommand::Export(args) => {
            let mut store = SqliteStore::open(db)?;
            store.migrate()?;
            emit_json(&store.export_snapshot(&args.out)?)
        }
        DbCommand::Import(args) => {
            let mut store = SqliteStore::open(db)?;
            emit_json(&store.import_snapshot(&args.input, args.skip_existing)?)
        }
        DbCommand::Backup(args) => {
            let store = SqliteStore::open(db)?;
            store.backup_database(&args.out)?;
            emit_json(&serde_json::json!({"backup": args.out}))
        }
        DbCommand::Restore(args) => {
            let mut store = SqliteStore::open(db)?;
            store.restore_database(&args.input)?;
            emit_json(&serde_json::json!({"restored_from": args.input}))
        }
        DbCommand::IntegrityCheck => {
            let store = SqliteStore::open(db)?;
            emit_json(&store.integrity_check()?)
        }
    }
}

fn run_record_command(db: &Path, command: RecordCommand) -> Result<()> {
    let api = RecordLedgerApi::new(db.to_path_buf());
    match command {
        RecordCommand::Get(args) => {
            let id = RecordId::new(args.id)?;
            let record = match args.at {
                Some(at) => api.get_record_at(id, at)?,
                None => api.get_record(id)?,
            };
            emit_json(&record)
        }
        RecordCommand::Upsert(args) => {
            let id = RecordId::new(args.id)?;
            let delta = build_delta(&args.set, &args.unset)?;
            emit_json(&api.upsert(id, args.effective, &delta)?)
        }
        RecordCommand::Versions(args) => {
            let id = RecordId::new(args.id)?;
            emit_json(&api.get_versions(id)?)
        }
        RecordCommand::Show(args) => {
            let id = RecordId::new(args.id)?;
            emit_json(&api.get_version(id, args.version)?)
        }
    }
}
