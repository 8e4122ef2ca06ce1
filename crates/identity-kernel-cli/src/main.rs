use std::path::PathBuf;
use std::str::FromStr;

use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand};
use identity_kernel_api::{
    IdentifyPolicy, IdentityKernelApi, DEFAULT_MAX_CONFLICT_RETRIES,
    DEFAULT_MAX_UNAVAILABLE_RETRIES, DEFAULT_UNAVAILABLE_BACKOFF_MS,
};
use identity_kernel_core::{ContactId, IdentifyRequest};
use identity_kernel_store_sqlite::SqliteStore;
use serde_json::Value;
use tracing::debug;
use tracing_subscriber::EnvFilter;

const CLI_CONTRACT_VERSION: &str = "cli.v1";

#[derive(Debug, Parser)]
#[command(name = "ik")]
#[command(about = "Identity Kernel CLI")]
struct Cli {
    #[arg(long, env = "IDENTITY_KERNEL_DB", default_value = "./identity_kernel.sqlite3")]
    db: PathBuf,

    #[command(flatten)]
    retry: RetryArgs,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Clone, Copy, Args)]
struct RetryArgs {
    #[arg(
        long,
        global = true,
        env = "IDENTITY_KERNEL_MAX_CONFLICT_RETRIES",
        default_value_t = DEFAULT_MAX_CONFLICT_RETRIES
    )]
    max_conflict_retries: u32,
    #[arg(
        long,
        global = true,
        env = "IDENTITY_KERNEL_MAX_UNAVAILABLE_RETRIES",
        default_value_t = DEFAULT_MAX_UNAVAILABLE_RETRIES
    )]
    max_unavailable_retries: u32,
    #[arg(
        long,
        global = true,
        env = "IDENTITY_KERNEL_UNAVAILABLE_BACKOFF_MS",
        default_value_t = DEFAULT_UNAVAILABLE_BACKOFF_MS
    )]
    unavailable_backoff_ms: u64,
}

impl From<RetryArgs> for IdentifyPolicy {
    fn from(args: RetryArgs) -> Self {
        Self {
            max_conflict_retries: args.max_conflict_retries,
            max_unavailable_retries: args.max_unavailable_retries,
            unavailable_backoff_ms: args.unavailable_backoff_ms,
        }
    }
}

#[derive(Debug, Subcommand)]
enum Command {
    Db {
        #[command(subcommand)]
        command: DbCommand,
    },
    Contact {
        #[command(subcommand)]
        command: ContactCommand,
    },
}

#[derive(Debug, Subcommand)]
enum DbCommand {
    SchemaVersion,
    Migrate(DbMigrateArgs),
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
enum ContactCommand {
    Identify(IdentifyArgs),
    List,
    Show(ShowArgs),
}

#[derive(Debug, Args)]
struct IdentifyArgs {
    #[arg(long)]
    email: Option<String>,
    #[arg(long, alias = "phone-number")]
    phone: Option<String>,
    #[arg(long)]
    name: Option<String>,
}

#[derive(Debug, Args)]
struct ShowArgs {
    #[arg(long)]
    id: String,
}

fn with_contract_version(value: Value) -> Value {
    match value {
        Value::Object(mut object) => {
            object.insert(
                "contract_version".to_string(),
                Value::String(CLI_CONTRACT_VERSION.to_string()),
            );
            Value::Object(object)
        }
        other => serde_json::json!({
            "contract_version": CLI_CONTRACT_VERSION,
            "payload": other
        }),
    }
}

fn emit_json(value: Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(&with_contract_version(value))?);
    Ok(())
}

/// Logs go to stderr; stdout carries only the JSON result.
fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt().with_env_filter(filter).with_writer(std::io::stderr).init();
}

fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    debug!(db = %cli.db.display(), "opening contact store");
    match cli.command {
        Command::Db { command } => {
            let mut store = SqliteStore::open(&cli.db)?;
            run_db(command, &mut store)
        }
        Command::Contact { command } => {
            let api = IdentityKernelApi::new(cli.db).with_policy(cli.retry.into());
            run_contact(command, &api)
        }
    }
}

fn run_db(command: DbCommand, store: &mut SqliteStore) -> Result<()> {
    match command {
        DbCommand::SchemaVersion => run_db_schema_version(store),
        DbCommand::Migrate(args) => run_db_migrate(&args, store),
        DbCommand::Backup(args) => run_db_backup(&args, store),
        DbCommand::Restore(args) => run_db_restore(&args, store),
        DbCommand::IntegrityCheck => run_db_integrity_check(store),
    }
}

fn run_db_schema_version(store: &SqliteStore) -> Result<()> {
    let status = store.schema_status()?;
    emit_json(serde_json::json!({
        "current_version": status.current_version,
        "target_version": status.target_version,
        "pending_versions": status.pending_versions,
        "up_to_date": status.pending_versions.is_empty()
    }))
}

fn run_db_migrate(args: &DbMigrateArgs, store: &mut SqliteStore) -> Result<()> {
    let before = store.schema_status()?;
    if args.dry_run {
        return emit_json(serde_json::json!({
            "dry_run": true,
            "current_version": before.current_version,
            "target_version": before.target_version,
            "would_apply_versions": before.pending_versions
        }));
    }

    store.migrate()?;
    let after = store.schema_status()?;
    emit_json(serde_json::json!({
        "dry_run": false,
        "before_version": before.current_version,
        "applied_versions": before.pending_versions,
        "after_version": after.current_version,
        "target_version": after.target_version,
        "up_to_date": after.pending_versions.is_empty()
    }))
}

fn run_db_backup(args: &DbBackupArgs, store: &mut SqliteStore) -> Result<()> {
    store.migrate()?;
    store.backup_database(&args.out)?;
    emit_json(serde_json::json!({
        "backup_path": args.out,
        "status": "ok"
    }))
}

fn run_db_restore(args: &DbRestoreArgs, store: &mut SqliteStore) -> Result<()> {
    store.restore_database(&args.input)?;
    let status = store.schema_status()?;
    let contacts = store.list_contacts()?;
    emit_json(serde_json::json!({
        "restored_from": args.input,
        "current_version": status.current_version,
        "target_version": status.target_version,
        "contact_count": contacts.len()
    }))
}

fn run_db_integrity_check(store: &SqliteStore) -> Result<()> {
    let report = store.integrity_check()?;
    emit_json(serde_json::to_value(&report).context("failed to serialize integrity report")?)
}

fn run_contact(command: ContactCommand, api: &IdentityKernelApi) -> Result<()> {
    match command {
        ContactCommand::Identify(args) => {
            let request = IdentifyRequest { email: args.email, phone: args.phone, name: args.name };
            let response = api.identify(&request)?;
            emit_json(
                serde_json::to_value(&response).context("failed to serialize identify result")?,
            )
        }
        ContactCommand::List => {
            let contacts = api.list_contacts()?;
            emit_json(serde_json::json!({ "contacts": contacts }))
        }
        ContactCommand::Show(args) => {
            let contact_id = ContactId::from_str(&args.id)?;
            let contact = api
                .show_contact(contact_id)?
                .ok_or_else(|| anyhow!("unknown contact {contact_id}"))?;
            emit_json(serde_json::to_value(&contact).context("failed to serialize contact")?)
        }
    }
}
