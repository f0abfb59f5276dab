#![allow(clippy::missing_errors_doc)]
#![allow(clippy::uninlined_format_args)]

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use pghistory_core::context;
use pghistory_core::ddl;
use pghistory_core::query::{revert_statement, select_events, EventQuery, Selected};
use pghistory_core::sql::sqlite_context_upsert;
use pghistory_core::{
    Column, ColumnKind, Dialect, Entity, EntityRow, EventModel, EventRecord, History, Operation,
    BACK_POINTER_COLUMN, CONTEXT_TABLE,
};
use rusqlite::functions::FunctionFlags;
use rusqlite::types::{Value as SqlValue, ValueRef};
use rusqlite::{params, params_from_iter, Connection, OptionalExtension};
use serde::Serialize;
use serde_json::Value;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

/// Runs a frozen [`History`] against one SQLite connection.
pub struct SqliteHistoryStore {
    conn: Connection,
    history: History,
}

#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct InstallReport {
    pub context_table: bool,
    /// Event tables that did not exist before this install.
    pub event_tables: Vec<String>,
    /// Tracked tables that gained the back-pointer column.
    pub back_pointers: Vec<String>,
    /// Trigger programs created, one per operation.
    pub triggers: usize,
}

/// Opens `path` with the pragmas every history connection runs under.
pub fn open_connection(path: &Path) -> Result<Connection> {
    let conn = Connection::open(path)
        .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

    conn.execute_batch(
        "PRAGMA journal_mode = WAL;
         PRAGMA foreign_keys = ON;
         PRAGMA busy_timeout = 5000;",
    )
    .context("failed to configure sqlite pragmas")?;

    Ok(conn)
}

/// Registers `pgh_context_id()` and `pgh_context_metadata()`, which read the
/// calling thread's active context frame.
pub fn register_context_functions(conn: &Connection) -> Result<()> {
    conn.create_scalar_function("pgh_context_id", 0, FunctionFlags::SQLITE_UTF8, |_| {
        Ok(context::current_id().map(|id| id.to_string()))
    })
    .context("failed to register pgh_context_id()")?;
    conn.create_scalar_function("pgh_context_metadata", 0, FunctionFlags::SQLITE_UTF8, |_| {
        Ok(context::current().map(|frame| frame.metadata_json()))
    })
    .context("failed to register pgh_context_metadata()")?;
    Ok(())
}

impl SqliteHistoryStore {
    pub fn open(path: &Path, history: History) -> Result<Self> {
        Self::from_connection(open_connection(path)?, history)
    }

    pub fn open_in_memory(history: History) -> Result<Self> {
        Self::open(Path::new(":memory:"), history)
    }

    pub fn from_connection(conn: Connection, history: History) -> Result<Self> {
        register_context_functions(&conn)?;
        Ok(Self { conn, history })
    }

    #[must_use]
    pub fn history(&self) -> &History {
        &self.history
    }

    #[must_use]
    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    pub fn connection_mut(&mut self) -> &mut Connection {
        &mut self.conn
    }

    /// Creates context and event tables, adds back-pointer columns and
    /// (re)creates every planned trigger in one transaction.
    pub fn install(&mut self) -> Result<InstallReport> {
        let schema = self.history.schema();
        let mut report = InstallReport::default();
        let tx = self
            .conn
            .transaction()
            .context("failed to start install transaction")?;

        if self.history.uses_context_table() {
            tx.execute_batch(&ddl::context_table(schema, Dialect::Sqlite))
                .context("failed to create context table")?;
            report.context_table = true;
        }

        for model in self.history.models() {
            if !table_exists(&tx, &model.table)? {
                report.event_tables.push(model.table.clone());
            }
            tx.execute_batch(&ddl::event_table(model, schema, Dialect::Sqlite))
                .with_context(|| format!("failed to create event table {}", model.table))?;
            if model.append_only {
                tx.execute_batch(&ddl::append_only(model, Dialect::Sqlite))
                    .with_context(|| format!("failed to protect event table {}", model.table))?;
            }

            let tracked = schema.entity(&model.tracked)?;
            let table = tracked.table();
            if !table_exists(&tx, &table)? {
                return Err(anyhow!(
                    "tracked table {table} for {} does not exist",
                    tracked.label()
                ));
            }
            if tracked.back_pointer().is_some()
                && !table_has_column(&tx, &table, BACK_POINTER_COLUMN)?
            {
                tx.execute_batch(&ddl::add_back_pointer(tracked, Dialect::Sqlite))
                    .with_context(|| format!("failed to add back-pointer to {table}"))?;
                report.back_pointers.push(table);
            }
        }

        for trigger in self.history.plan().triggers() {
            tx.execute_batch(&trigger.render(Dialect::Sqlite))
                .with_context(|| format!("failed to install trigger {}", trigger.name))?;
            report.triggers += trigger.operations.iter().count();
        }

        tx.commit().context("failed to commit install transaction")?;
        tracing::info!(
            event_tables = report.event_tables.len(),
            back_pointers = report.back_pointers.len(),
            triggers = report.triggers,
            "history installed"
        );
        Ok(report)
    }

    /// Inserts a manual event for `row` and returns it as stored.
    ///
    /// Context is attached by the same SQL functions triggers use, inside the
    /// insert's savepoint. A transaction the caller already holds on this
    /// connection decides whether the event persists. Tracker `extra_context` is merged through a
    /// nested frame for the duration of the call.
    pub fn create_event(
        &mut self,
        row: &EntityRow,
        label: &str,
        tracker_type: Option<&str>,
    ) -> Result<EventRecord> {
        let prepared = self
            .history
            .prepare_event(row, label, tracker_type, Dialect::Sqlite)?;
        let _extra = (!prepared.extra_context.is_empty())
            .then(|| context::enter(prepared.extra_context.clone()));
        let params: Vec<SqlValue> = prepared.params.iter().map(json_to_sql).collect();

        let tx = self
            .conn
            .savepoint()
            .context("failed to start event savepoint")?;
        if prepared.attach_context {
            for statement in sqlite_context_upsert() {
                tx.execute(&statement, [])
                    .context("failed to attach event context")?;
            }
        }
        let pgh_id: i64 = tx
            .query_row(&prepared.sql, params_from_iter(params.iter()), |row| {
                row.get("pgh_id")
            })
            .with_context(|| format!("failed to insert event into {}", prepared.model.table))?;
        let mut events = read_events(
            &tx,
            &prepared.model,
            &EventQuery {
                pgh_id: Some(pgh_id),
                ..EventQuery::default()
            },
        )?;
        tx.commit().context("failed to release event savepoint")?;

        tracing::debug!(model = %prepared.model.label(), pgh_id, label, "manual event created");
        events
            .pop()
            .ok_or_else(|| {
                anyhow!(
                    "event {pgh_id} missing from {} after insert",
                    prepared.model.table
                )
            })
    }

    /// Events of the model labelled `model`, oldest first.
    pub fn events(&self, model: &str, query: &EventQuery) -> Result<Vec<EventRecord>> {
        let model = self.history.event_model(model)?;
        read_events(&self.conn, model, query)
    }

    /// Most recent event of `model` for the tracked row `obj_id`.
    pub fn last_event(&self, model: &str, obj_id: &Value) -> Result<Option<EventRecord>> {
        let mut events = self.events(
            model,
            &EventQuery {
                obj_id: Some(obj_id.clone()),
                ..EventQuery::default()
            },
        )?;
        Ok(events.pop())
    }

    /// Writes the snapshot of event `pgh_id` back over its tracked row. The
    /// write goes through the tracked table, so its own triggers fire.
    pub fn revert(&mut self, model: &str, pgh_id: i64) -> Result<()> {
        let model = Arc::clone(self.history.event_model(model)?);
        let tracked = self.history.schema().entity(&model.tracked)?.clone();
        let record = read_events(
            &self.conn,
            &model,
            &EventQuery {
                pgh_id: Some(pgh_id),
                ..EventQuery::default()
            },
        )?
        .pop()
        .ok_or_else(|| anyhow!("no event {pgh_id} in {}", model.label()))?;

        let statement = revert_statement(&model, &tracked, &record, Dialect::Sqlite)?;
        let params: Vec<SqlValue> = statement.params.iter().map(json_to_sql).collect();
        let tx = self
            .conn
            .savepoint()
            .context("failed to start revert savepoint")?;
        tx.execute(&statement.sql, params_from_iter(params.iter()))
            .with_context(|| format!("failed to revert {} to event {pgh_id}", tracked.label()))?;
        tx.commit().context("failed to release revert savepoint")?;
        tracing::debug!(model = %model.label(), pgh_id, "event reverted");
        Ok(())
    }
}

/// Builds an [`Entity`] from an existing table's columns. An existing
/// back-pointer column is left out; tracking adds it back as a relation.
pub fn introspect_entity(
    conn: &Connection,
    namespace: &str,
    name: &str,
    table: Option<&str>,
) -> Result<Entity> {
    let mut entity = Entity::new(namespace, name);
    if let Some(table) = table {
        entity = entity.with_table(table);
    }
    let table = entity.table();
    if !table_exists(conn, &table)? {
        return Err(anyhow!("table {table} does not exist"));
    }

    let mut stmt = conn
        .prepare("SELECT name, type, \"notnull\", pk FROM pragma_table_info(?1) ORDER BY cid")
        .with_context(|| format!("failed to inspect table_info for {table}"))?;
    let mut rows = stmt.query(params![table])?;
    while let Some(row) = rows.next()? {
        let column_name: String = row.get(0)?;
        if column_name == BACK_POINTER_COLUMN {
            continue;
        }
        let declared: String = row.get(1)?;
        let not_null: bool = row.get(2)?;
        let pk: i64 = row.get(3)?;

        let kind = column_kind(&declared, pk > 0);
        let mut column = Column::new(column_name, kind);
        if pk > 0 {
            column = column.primary_key();
        } else if !not_null {
            column = column.nullable();
        }
        entity = entity.with_column(column);
    }
    tracing::debug!(
        entity = %entity.label(),
        columns = entity.columns.len(),
        "entity introspected"
    );
    Ok(entity)
}

fn column_kind(declared: &str, primary_key: bool) -> ColumnKind {
    let upper = declared.trim().to_ascii_uppercase();
    let base = upper.split('(').next().unwrap_or_default().trim();
    let length = upper
        .split_once('(')
        .and_then(|(_, rest)| rest.trim_end_matches(')').split(',').next())
        .and_then(|raw| raw.trim().parse::<u32>().ok());
    match base {
        "INTEGER" | "INT" if primary_key => ColumnKind::Auto,
        "INTEGER" | "INT" | "MEDIUMINT" => ColumnKind::Integer,
        "BIGINT" => ColumnKind::BigInteger,
        "SMALLINT" | "TINYINT" => ColumnKind::SmallInteger,
        "BOOLEAN" | "BOOL" => ColumnKind::Boolean,
        "REAL" | "FLOAT" | "DOUBLE" | "DOUBLE PRECISION" => ColumnKind::Float,
        "NUMERIC" | "DECIMAL" => ColumnKind::Decimal {
            precision: length.unwrap_or(10),
            scale: 0,
        },
        "VARCHAR" | "CHAR" | "CHARACTER" => length.map_or(ColumnKind::Text, |max_length| {
            ColumnKind::Char { max_length }
        }),
        "DATETIME" | "TIMESTAMP" => ColumnKind::DateTime,
        "DATE" => ColumnKind::Date,
        "UUID" => ColumnKind::Uuid,
        "JSON" | "JSONB" => ColumnKind::Json,
        "BLOB" => ColumnKind::Binary,
        _ => ColumnKind::Text,
    }
}

fn read_events(
    conn: &Connection,
    model: &EventModel,
    query: &EventQuery,
) -> Result<Vec<EventRecord>> {
    let select = select_events(model, Dialect::Sqlite, query)?;
    let params: Vec<SqlValue> = select.params.iter().map(json_to_sql).collect();
    let mut stmt = conn
        .prepare(&select.sql)
        .with_context(|| format!("failed to query events of {}", model.label()))?;
    let rows = stmt.query_map(params_from_iter(params.iter()), |row| {
        let mut values = Vec::with_capacity(select.columns.len());
        for (idx, column) in select.columns.iter().enumerate() {
            let kind = match column {
                Selected::Data { kind, .. } | Selected::Proxy { kind, .. } => Some(kind),
                Selected::Framework(_) | Selected::ContextMetadata => None,
            };
            values.push(sql_to_json(row.get_ref(idx)?, kind));
        }
        Ok(values)
    })?;

    let mut records = Vec::new();
    for values in collect_rows(rows)? {
        records.push(build_record(model, &select.columns, values)?);
    }
    Ok(records)
}

fn build_record(
    model: &EventModel,
    columns: &[Selected],
    values: Vec<Value>,
) -> Result<EventRecord> {
    let mut record = EventRecord {
        model: model.label(),
        pgh_id: 0,
        pgh_created_at: OffsetDateTime::UNIX_EPOCH,
        pgh_label: String::new(),
        pgh_operation: None,
        pgh_obj_id: None,
        pgh_previous_id: None,
        pgh_context_id: None,
        pgh_context: None,
        data: BTreeMap::new(),
        proxies: BTreeMap::new(),
    };
    for (column, value) in columns.iter().zip(values) {
        match column {
            Selected::Framework(name) => match name.as_str() {
                "pgh_id" => {
                    record.pgh_id = value
                        .as_i64()
                        .ok_or_else(|| anyhow!("invalid pgh_id in {}: {value}", model.table))?;
                }
                "pgh_created_at" => {
                    let raw = value.as_str().unwrap_or_default();
                    record.pgh_created_at =
                        OffsetDateTime::parse(raw, &Rfc3339).with_context(|| {
                            format!("invalid pgh_created_at in {}: {raw}", model.table)
                        })?;
                }
                "pgh_label" => record.pgh_label = value.as_str().unwrap_or_default().to_string(),
                "pgh_operation" => {
                    record.pgh_operation = value.as_i64().and_then(Operation::from_code);
                }
                "pgh_previous_id" => record.pgh_previous_id = value.as_i64(),
                "pgh_context_id" => record.pgh_context_id = value.as_str().map(str::to_string),
                _ => record.pgh_obj_id = (!value.is_null()).then_some(value),
            },
            Selected::ContextMetadata => {
                record.pgh_context = match value {
                    Value::Null => None,
                    Value::String(raw) => Some(
                        serde_json::from_str(&raw).context("invalid stored context metadata")?,
                    ),
                    other => Some(other),
                };
            }
            Selected::Data { field, .. } => {
                record.data.insert(field.clone(), value);
            }
            Selected::Proxy { name, .. } => {
                record.proxies.insert(name.clone(), value);
            }
        }
    }
    Ok(record)
}

fn json_to_sql(value: &Value) -> SqlValue {
    match value {
        Value::Null => SqlValue::Null,
        Value::Bool(flag) => SqlValue::Integer(i64::from(*flag)),
        Value::Number(number) => match number.as_i64() {
            Some(int) => SqlValue::Integer(int),
            None => number.as_f64().map_or(SqlValue::Null, SqlValue::Real),
        },
        Value::String(text) => SqlValue::Text(text.clone()),
        Value::Array(_) | Value::Object(_) => SqlValue::Text(value.to_string()),
    }
}

fn sql_to_json(value: ValueRef<'_>, kind: Option<&ColumnKind>) -> Value {
    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(int) => match kind {
            Some(ColumnKind::Boolean) => Value::Bool(int != 0),
            _ => Value::from(int),
        },
        ValueRef::Real(real) => {
            serde_json::Number::from_f64(real).map_or(Value::Null, Value::Number)
        }
        ValueRef::Text(bytes) => {
            let text = String::from_utf8_lossy(bytes).into_owned();
            match kind {
                Some(ColumnKind::Json) => {
                    serde_json::from_str(&text).unwrap_or(Value::String(text))
                }
                _ => Value::String(text),
            }
        }
        ValueRef::Blob(bytes) => {
            Value::Array(bytes.iter().map(|byte| Value::from(*byte)).collect())
        }
    }
}

fn table_exists(conn: &Connection, table_name: &str) -> Result<bool> {
    let exists = conn
        .query_row(
            "SELECT 1
             FROM sqlite_master
             WHERE type = 'table' AND name = ?1
             LIMIT 1",
            params![table_name],
            |_| Ok(()),
        )
        .optional()
        .context("failed to query sqlite_master")?
        .is_some();

    Ok(exists)
}

fn table_has_column(conn: &Connection, table_name: &str, column: &str) -> Result<bool> {
    let found = conn
        .query_row(
            "SELECT 1 FROM pragma_table_info(?1) WHERE name = ?2 LIMIT 1",
            params![table_name, column],
            |_| Ok(()),
        )
        .optional()
        .with_context(|| format!("failed to inspect table_info for {table_name}"))?
        .is_some();
    Ok(found)
}

/// Number of rows in the shared context table, zero when it does not exist.
pub fn context_row_count(conn: &Connection) -> Result<i64> {
    if !table_exists(conn, CONTEXT_TABLE)? {
        return Ok(0);
    }
    conn.query_row(&format!("SELECT COUNT(*) FROM \"{CONTEXT_TABLE}\""), [], |row| row.get(0))
        .context("failed to count context rows")
}

fn collect_rows<T>(
    rows: rusqlite::MappedRows<'_, impl FnMut(&rusqlite::Row<'_>) -> rusqlite::Result<T>>,
) -> Result<Vec<T>> {
    let mut values = Vec::new();
    for row in rows {
        values.push(row?);
    }
    Ok(values)
}
