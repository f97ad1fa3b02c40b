//! Command surface for the study record kernel.
//!
//! Hosts embed it through:
//! - [`run_cli`] for full parsed CLI execution.
//! - [`run_records_with_db`] for direct [`RecordsCommand`] execution against a DB path.
//! - [`run_records`] for execution against an existing [`SqliteRecordStore`].
//!
//! Every mutating command re-reads the whole table afterwards and prints that
//! fresh list, never a locally patched one.

use std::path::PathBuf;

use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand};
use serde::Serialize;
use study_record_core::{NewRecord, Projection, RecordId, RecordList, TotalTime};
use study_record_store_sqlite::SqliteRecordStore;

const RECORD_LIST_CONTRACT_VERSION: &str = "record_list.v1";
const TOTAL_TIME_CONTRACT_VERSION: &str = "total_time.v1";

#[derive(Debug, Parser)]
#[command(name = "sr")]
#[command(about = "Study record CLI")]
pub struct Cli {
    #[arg(long, default_value = "./study_record.sqlite3")]
    db: PathBuf,

    /// Tracing filter directive, e.g. `info` or `study_record_store_sqlite=debug`.
    #[arg(long, default_value = "warn")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

impl Cli {
    #[must_use]
    pub fn log_level(&self) -> &str {
        &self.log_level
    }
}

#[derive(Debug, Subcommand)]
pub enum Command {
    Records {
        #[command(subcommand)]
        command: RecordsCommand,
    },
}

#[derive(Debug, Subcommand)]
pub enum RecordsCommand {
    List(ListArgs),
    Add(AddArgs),
    Edit(EditArgs),
    Delete(DeleteArgs),
    Total(TotalArgs),
}

#[derive(Debug, Args)]
pub struct ListArgs {
    #[arg(long)]
    table: bool,
}

#[derive(Debug, Args)]
pub struct AddArgs {
    #[arg(long)]
    title: String,
    #[arg(long)]
    time: u32,
}

#[derive(Debug, Args)]
pub struct EditArgs {
    #[arg(long)]
    id: i64,
    #[arg(long)]
    title: String,
    #[arg(long)]
    time: u32,
}

#[derive(Debug, Args)]
pub struct DeleteArgs {
    #[arg(long)]
    id: i64,
}

#[derive(Debug, Args)]
pub struct TotalArgs {
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Serialize)]
struct RecordListOutput<'a> {
    contract_version: &'static str,
    #[serde(flatten)]
    projection: &'a Projection,
}

#[derive(Debug, Serialize)]
struct TotalTimeOutput {
    contract_version: &'static str,
    #[serde(flatten)]
    total: TotalTime,
}

/// Executes the parsed top-level CLI command graph.
///
/// # Errors
/// Returns an error when store open/migrate fails or the command fails.
pub fn run_cli(cli: Cli) -> Result<()> {
    match cli.command {
        Command::Records { command } => run_records_with_db(&cli.db, command),
    }
}

/// Executes a parsed records command using the provided `SQLite` DB path.
///
/// # Errors
/// Returns an error when store open/migrate fails or the requested command fails.
pub fn run_records_with_db(db_path: &std::path::Path, command: RecordsCommand) -> Result<()> {
    let mut store = SqliteRecordStore::open(db_path)?;
    store.migrate()?;
    run_records(command, &mut store)
}

/// Executes a parsed records command against an existing store handle.
///
/// # Errors
/// Returns an error when input validation fails or the store reports an error.
pub fn run_records(command: RecordsCommand, store: &mut SqliteRecordStore) -> Result<()> {
    let mut list = RecordList::new(store);

    match command {
        RecordsCommand::List(args) => {
            let projection = list.refresh()?;
            if args.table {
                print_record_table(projection);
            } else {
                print_projection(projection)?;
            }
            Ok(())
        }
        RecordsCommand::Add(args) => {
            let input = validated(args.title, args.time)?;
            let projection = list.insert(&input)?;
            tracing::info!(title = %input.title, time = input.time, "record added");
            print_projection(projection)
        }
        RecordsCommand::Edit(args) => {
            let input = validated(args.title, args.time)?;
            let id = RecordId(args.id);
            let projection = list.update(id, &input)?;
            tracing::info!(%id, "record edited");
            print_projection(projection)
        }
        RecordsCommand::Delete(args) => {
            let id = RecordId(args.id);
            let projection = list.delete(id)?;
            tracing::info!(%id, "record deleted");
            print_projection(projection)
        }
        RecordsCommand::Total(args) => {
            let total = list.refresh()?.total();
            if args.json {
                let payload = TotalTimeOutput {
                    contract_version: TOTAL_TIME_CONTRACT_VERSION,
                    total,
                };
                println!("{}", serde_json::to_string_pretty(&payload)?);
            } else {
                println!("total: {total}");
            }
            Ok(())
        }
    }
}

fn validated(title: String, time: u32) -> Result<NewRecord> {
    let input = NewRecord::new(title, time);
    input.validate().map_err(|err| anyhow!(err))?;
    Ok(input)
}

fn print_projection(projection: &Projection) -> Result<()> {
    let payload = RecordListOutput {
        contract_version: RECORD_LIST_CONTRACT_VERSION,
        projection,
    };
    let rendered =
        serde_json::to_string_pretty(&payload).context("failed to serialize record list")?;
    println!("{rendered}");
    Ok(())
}

fn print_record_table(projection: &Projection) {
    println!("{:<8} {:<32} {:>8}", "id", "title", "time(h)");
    println!("{}", "-".repeat(50));
    for record in &projection.records {
        println!("{:<8} {:<32} {:>8}", record.id, record.title, record.time);
    }
    println!("total: {}", projection.total());
}
