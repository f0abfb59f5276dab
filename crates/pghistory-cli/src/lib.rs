//! `pgh`: render, install and inspect row history declared in a JSON file.
//!
//! Every command loads the declaration given by `--declaration` (and the
//! optional settings file given by `--config`) and freezes it before running.
//! Commands that touch a database open the `SQLite` file given by `--db`.

use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use pghistory_core::context;
use pghistory_core::ddl::install_script;
use pghistory_core::query::EventQuery;
use pghistory_core::{
    ContextStorage, Declaration, Dialect, EntityRow, EventModel, EventModelFilter, History,
    HistoryConfig,
};
use pghistory_store_sqlite::SqliteHistoryStore;
use serde::Serialize;
use serde_json::{Map, Value};

#[derive(Debug, Parser)]
#[command(name = "pgh")]
#[command(about = "Trigger-driven row history")]
pub struct Cli {
    /// JSON file declaring namespaces, entities and tracking.
    #[arg(long)]
    declaration: PathBuf,

    /// JSON settings file; defaults apply when omitted.
    #[arg(long)]
    config: Option<PathBuf>,

    #[arg(long, default_value = "./pghistory.sqlite3")]
    db: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Print the install script.
    Render(RenderArgs),
    /// Create event tables, back-pointers and triggers in the database.
    Install,
    /// List event models.
    Models(ModelsArgs),
    /// List stored events of one event model.
    Events(EventsArgs),
    /// Record a manual event.
    CreateEvent(CreateEventArgs),
    /// Write an event's snapshot back over its tracked row.
    Revert(RevertArgs),
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum DialectArg {
    Postgres,
    Sqlite,
}

impl From<DialectArg> for Dialect {
    fn from(value: DialectArg) -> Self {
        match value {
            DialectArg::Postgres => Dialect::Postgres,
            DialectArg::Sqlite => Dialect::Sqlite,
        }
    }
}

#[derive(Debug, Args)]
pub struct RenderArgs {
    #[arg(long, value_enum, default_value_t = DialectArg::Postgres)]
    dialect: DialectArg,
    /// Render trigger drops instead of the install script.
    #[arg(long)]
    drop: bool,
}

#[derive(Debug, Args)]
pub struct ModelsArgs {
    #[arg(long)]
    tracks: Vec<String>,
    #[arg(long)]
    references: Vec<String>,
    #[arg(long)]
    include_missing_obj: bool,
}

#[derive(Debug, Args)]
pub struct EventsArgs {
    #[arg(long)]
    model: String,
    /// Tracked row id, as JSON.
    #[arg(long)]
    obj_id: Option<String>,
    #[arg(long)]
    label: Option<String>,
    #[arg(long)]
    limit: Option<usize>,
}

#[derive(Debug, Args)]
pub struct CreateEventArgs {
    #[arg(long)]
    entity: String,
    #[arg(long)]
    label: String,
    #[arg(long)]
    tracker_type: Option<String>,
    /// Field values of the tracked row, as a JSON object.
    #[arg(long)]
    row: String,
    /// Context metadata active while the event is written, as a JSON object.
    #[arg(long)]
    context: Option<String>,
}

#[derive(Debug, Args)]
pub struct RevertArgs {
    #[arg(long)]
    model: String,
    #[arg(long)]
    pgh_id: i64,
}

#[derive(Debug, Serialize)]
struct ModelSummary {
    label: String,
    table: String,
    tracked: String,
    context: &'static str,
    append_only: bool,
    trackers: Vec<TrackerSummary>,
    proxy_fields: Vec<String>,
}

/// One tracker of a model. Labels repeat across tracker types.
#[derive(Debug, Serialize, PartialEq, Eq)]
struct TrackerSummary {
    label: String,
    #[serde(rename = "type")]
    tracker_type: String,
}

impl ModelSummary {
    fn from_model(model: &EventModel) -> Self {
        Self {
            label: model.label(),
            table: model.table.clone(),
            tracked: model.tracked.clone(),
            context: match model.context {
                ContextStorage::None => "none",
                ContextStorage::ForeignKey { .. } => "foreign_key",
                ContextStorage::Json { .. } => "json",
            },
            append_only: model.append_only,
            trackers: model
                .trackers
                .iter()
                .map(|tracker| TrackerSummary {
                    label: tracker.label(),
                    tracker_type: tracker.type_name(),
                })
                .collect(),
            proxy_fields: model
                .proxy_fields
                .iter()
                .map(|proxy| proxy.name.clone())
                .collect(),
        }
    }
}

/// Loads the declaration and settings named on the command line.
///
/// # Errors
/// Returns an error when either file cannot be read or the declarations are
/// invalid.
pub fn load_history(declaration: &Path, config: Option<&Path>) -> Result<History> {
    let config = match config {
        Some(path) => HistoryConfig::load(path)?,
        None => HistoryConfig::default(),
    };
    let declaration = Declaration::load(declaration)?;
    let history = declaration.build(config)?;
    tracing::debug!(
        models = history.models().len(),
        triggers = history.plan().triggers().len(),
        "history built"
    );
    Ok(history)
}

/// Executes the parsed command.
///
/// # Errors
/// Returns an error when loading the declaration, opening the database or the
/// command itself fails.
pub fn run_cli(cli: Cli) -> Result<()> {
    let history = load_history(&cli.declaration, cli.config.as_deref())?;
    match cli.command {
        Command::Render(args) => {
            let dialect = Dialect::from(args.dialect);
            if args.drop {
                for trigger in history.plan().triggers() {
                    print!("{}", trigger.render_drop(dialect));
                }
            } else {
                print!("{}", install_script(&history, dialect));
            }
            Ok(())
        }
        Command::Models(args) => {
            let filter = EventModelFilter {
                references: args.references,
                tracks: args.tracks,
                include_missing_obj: args.include_missing_obj,
            };
            let models: Vec<ModelSummary> = history
                .event_models(&filter)
                .iter()
                .map(|model| ModelSummary::from_model(model))
                .collect();
            println!("{}", serde_json::to_string_pretty(&models)?);
            Ok(())
        }
        command => {
            let mut store = SqliteHistoryStore::open(&cli.db, history)?;
            run_store_command(command, &mut store)
        }
    }
}

fn run_store_command(command: Command, store: &mut SqliteHistoryStore) -> Result<()> {
    match command {
        Command::Install => {
            let report = store.install()?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(())
        }
        Command::Events(args) => {
            let query = EventQuery {
                obj_id: args.obj_id.as_deref().map(parse_json).transpose()?,
                label: args.label,
                pgh_id: None,
                limit: args.limit,
            };
            let events = store.events(&args.model, &query)?;
            println!("{}", serde_json::to_string_pretty(&events)?);
            Ok(())
        }
        Command::CreateEvent(args) => {
            let values = parse_object(&args.row, "--row")?;
            let row = EntityRow {
                entity: args.entity,
                values: values.into_iter().collect(),
            };
            let metadata = args
                .context
                .as_deref()
                .map(|raw| parse_object(raw, "--context"))
                .transpose()?;
            let _frame = metadata.map(context::enter);
            let event = store.create_event(&row, &args.label, args.tracker_type.as_deref())?;
            println!("{}", serde_json::to_string_pretty(&event)?);
            Ok(())
        }
        Command::Revert(args) => {
            store.revert(&args.model, args.pgh_id)?;
            let out = serde_json::json!({
                "model": args.model,
                "reverted_pgh_id": args.pgh_id,
            });
            println!("{}", serde_json::to_string_pretty(&out)?);
            Ok(())
        }
        Command::Render(_) | Command::Models(_) => Err(anyhow!(
            "internal dispatch error: command does not need a database"
        )),
    }
}

fn parse_json(raw: &str) -> Result<Value> {
    serde_json::from_str(raw).with_context(|| format!("invalid JSON value: {raw}"))
}

fn parse_object(raw: &str, flag: &str) -> Result<Map<String, Value>> {
    match parse_json(raw)? {
        Value::Object(map) => Ok(map),
        other => Err(anyhow!("{flag} must be a JSON object, got {other}")),
    }
}
