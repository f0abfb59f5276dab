//! Structured SQL fragments.
//!
//! Identifiers, literals and parameter placeholders are kept apart until
//! rendering so quoting happens in exactly one place.

use std::collections::BTreeMap;
use std::fmt::Write as _;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::condition::RowImage;
use crate::tracker::{Operation, OperationSet};
use crate::CONTEXT_TABLE;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum Dialect {
    #[default]
    Postgres,
    Sqlite,
}

impl Dialect {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Postgres => "postgres",
            Self::Sqlite => "sqlite",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "postgres" | "postgresql" => Some(Self::Postgres),
            "sqlite" => Some(Self::Sqlite),
            _ => None,
        }
    }

    /// Database-side "now".
    #[must_use]
    pub fn now(self) -> &'static str {
        match self {
            Self::Postgres => "NOW()",
            Self::Sqlite => "strftime('%Y-%m-%dT%H:%M:%fZ', 'now')",
        }
    }

    /// SQL for "a differs from b", treating NULLs as comparable values.
    #[must_use]
    pub fn is_distinct(self, left: &str, right: &str) -> String {
        match self {
            Self::Postgres => format!("{left} IS DISTINCT FROM {right}"),
            Self::Sqlite => format!("{left} IS NOT {right}"),
        }
    }

    #[must_use]
    pub fn bool_literal(self, value: bool) -> &'static str {
        match (self, value) {
            (Self::Postgres, true) => "TRUE",
            (Self::Postgres, false) => "FALSE",
            (Self::Sqlite, true) => "1",
            (Self::Sqlite, false) => "0",
        }
    }

    #[must_use]
    pub fn param(self, index: usize) -> String {
        match self {
            Self::Postgres => format!("${index}"),
            Self::Sqlite => format!("?{index}"),
        }
    }
}

#[must_use]
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

#[must_use]
pub fn quote_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

/// `"table"."column"` or `OLD."column"`.
#[must_use]
pub fn qualified(qualifier: &str, column: &str) -> String {
    format!("{qualifier}.{}", quote_ident(column))
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(untagged)]
pub enum Literal {
    Null,
    Bool(bool),
    Integer(i64),
    Text(String),
}

impl Literal {
    #[must_use]
    pub fn render(&self, dialect: Dialect) -> String {
        match self {
            Self::Null => "NULL".to_string(),
            Self::Bool(value) => dialect.bool_literal(*value).to_string(),
            Self::Integer(value) => value.to_string(),
            Self::Text(value) => quote_literal(value),
        }
    }
}

/// Rendering context: the dialect plus, for SQLite, the single operation a
/// trigger program runs for.
#[derive(Debug, Clone, Copy)]
pub struct RenderScope {
    pub dialect: Dialect,
    pub operation: Option<Operation>,
}

impl RenderScope {
    #[must_use]
    pub fn new(dialect: Dialect) -> Self {
        Self {
            dialect,
            operation: None,
        }
    }

    #[must_use]
    pub fn for_operation(dialect: Dialect, operation: Operation) -> Self {
        Self {
            dialect,
            operation: Some(operation),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Column { image: RowImage, column: String },
    Literal(Literal),
    Param(usize),
    Now,
    OperationCode(OperationSet),
    /// The back-pointer value before this firing, from whichever row image exists.
    PreviousEvent { column: String },
    ContextId,
    ContextMetadata { extra: Map<String, Value> },
    /// Upserts the active context frame and yields its id.
    AttachContext,
}

const PG_CONTEXT_ID: &str =
    "COALESCE(NULLIF(CURRENT_SETTING('pghistory.context_id', TRUE), ''), NULL)::UUID";
const PG_CONTEXT_METADATA: &str =
    "COALESCE(NULLIF(CURRENT_SETTING('pghistory.context_metadata', TRUE), ''), NULL)::JSONB";

impl Expr {
    #[must_use]
    pub fn column(image: RowImage, column: impl Into<String>) -> Self {
        Self::Column {
            image,
            column: column.into(),
        }
    }

    #[must_use]
    pub fn text(value: impl Into<String>) -> Self {
        Self::Literal(Literal::Text(value.into()))
    }

    #[must_use]
    pub fn render(&self, scope: RenderScope) -> String {
        let dialect = scope.dialect;
        match self {
            Self::Column { image, column } => qualified(image.qualifier(), column),
            Self::Literal(literal) => literal.render(dialect),
            Self::Param(index) => dialect.param(*index),
            Self::Now => dialect.now().to_string(),
            Self::OperationCode(operations) => render_operation_code(*operations, scope),
            Self::PreviousEvent { column } => {
                let new = qualified("NEW", column);
                let old = qualified("OLD", column);
                match scope.operation {
                    Some(Operation::Insert) => new,
                    Some(Operation::Delete) => old,
                    _ => format!("COALESCE({new}, {old})"),
                }
            }
            Self::ContextId => match dialect {
                Dialect::Postgres => PG_CONTEXT_ID.to_string(),
                Dialect::Sqlite => "pgh_context_id()".to_string(),
            },
            Self::ContextMetadata { extra } => render_context_metadata(extra, dialect),
            Self::AttachContext => match dialect {
                Dialect::Postgres => "_pgh_attach_context()".to_string(),
                Dialect::Sqlite => "pgh_context_id()".to_string(),
            },
        }
    }
}

fn render_operation_code(operations: OperationSet, scope: RenderScope) -> String {
    if let Some(operation) = scope.operation {
        return operation.code().to_string();
    }
    let mut iter = operations.iter();
    match (iter.next(), iter.next()) {
        (Some(only), None) => only.code().to_string(),
        (None, _) => "NULL".to_string(),
        _ if scope.dialect == Dialect::Postgres => {
            let mut sql = "CASE TG_OP".to_string();
            for operation in operations.iter() {
                let _ = write!(
                    sql,
                    " WHEN {} THEN {}",
                    quote_literal(operation.as_sql()),
                    operation.code()
                );
            }
            sql.push_str(" END");
            sql
        }
        _ => "NULL".to_string(),
    }
}

fn render_context_metadata(extra: &Map<String, Value>, dialect: Dialect) -> String {
    if extra.is_empty() {
        return match dialect {
            Dialect::Postgres => PG_CONTEXT_METADATA.to_string(),
            Dialect::Sqlite => "pgh_context_metadata()".to_string(),
        };
    }
    let extra = quote_literal(&Value::Object(extra.clone()).to_string());
    match dialect {
        Dialect::Postgres => {
            format!("(COALESCE({PG_CONTEXT_METADATA}, '{{}}'::JSONB) || {extra}::JSONB)")
        }
        Dialect::Sqlite => format!("json_patch(COALESCE(pgh_context_metadata(), '{{}}'), {extra})"),
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Returning {
    Nothing,
    /// `RETURNING *`.
    All,
    /// PL/pgSQL `RETURNING "column" INTO variable`.
    Into { column: String, variable: String },
}

/// An INSERT whose column list is always rendered in sorted order.
#[derive(Debug, Clone, PartialEq)]
pub struct InsertStatement {
    pub table: String,
    pub values: BTreeMap<String, Expr>,
    pub returning: Returning,
}

impl InsertStatement {
    #[must_use]
    pub fn new(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            values: BTreeMap::new(),
            returning: Returning::Nothing,
        }
    }

    pub fn set(&mut self, column: impl Into<String>, value: Expr) {
        self.values.insert(column.into(), value);
    }

    #[must_use]
    pub fn render(&self, scope: RenderScope) -> String {
        let columns: Vec<String> = self
            .values
            .keys()
            .map(|column| quote_ident(column))
            .collect();
        let values: Vec<String> = self
            .values
            .values()
            .map(|expr| expr.render(scope))
            .collect();
        let mut sql = format!(
            "INSERT INTO {} ({}) VALUES ({})",
            quote_ident(&self.table),
            columns.join(", "),
            values.join(", ")
        );
        match &self.returning {
            Returning::Nothing => {}
            Returning::All => sql.push_str(" RETURNING *"),
            Returning::Into { column, variable } => {
                let _ = write!(sql, " RETURNING {} INTO {variable}", quote_ident(column));
            }
        }
        sql
    }
}

/// Statements that upsert the active context frame into the shared context
/// table from inside a SQLite trigger program or transaction.
#[must_use]
pub fn sqlite_context_upsert() -> Vec<String> {
    let table = quote_ident(CONTEXT_TABLE);
    let now = Dialect::Sqlite.now();
    vec![
        format!(
            "INSERT OR IGNORE INTO {table} (\"created_at\", \"id\", \"metadata\", \"updated_at\") \
             SELECT {now}, pgh_context_id(), pgh_context_metadata(), {now} \
             WHERE pgh_context_id() IS NOT NULL"
        ),
        format!(
            "UPDATE {table} SET \"metadata\" = pgh_context_metadata(), \"updated_at\" = {now} \
             WHERE \"id\" = pgh_context_id()"
        ),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identifiers_and_literals_double_embedded_quotes() {
        assert_eq!(quote_ident("we\"ird"), "\"we\"\"ird\"");
        assert_eq!(quote_literal("it's"), "'it''s'");
        assert_eq!(
            Literal::Text("x'); DROP TABLE t; --".to_string()).render(Dialect::Postgres),
            "'x''); DROP TABLE t; --'"
        );
    }

    #[test]
    fn insert_columns_render_sorted() {
        let mut insert = InsertStatement::new("events");
        insert.set("zeta", Expr::Param(2));
        insert.set("alpha", Expr::Param(1));
        insert.set("pgh_created_at", Expr::Now);
        insert.returning = Returning::All;

        assert_eq!(
            insert.render(RenderScope::new(Dialect::Sqlite)),
            "INSERT INTO \"events\" (\"alpha\", \"pgh_created_at\", \"zeta\") VALUES (?1, \
             strftime('%Y-%m-%dT%H:%M:%fZ', 'now'), ?2) RETURNING *"
        );
    }

    #[test]
    fn multi_operation_code_uses_tg_op_on_postgres() {
        let ops = OperationSet::of(&[Operation::Insert, Operation::Update]);
        assert_eq!(
            Expr::OperationCode(ops).render(RenderScope::new(Dialect::Postgres)),
            "CASE TG_OP WHEN 'INSERT' THEN 0 WHEN 'UPDATE' THEN 1 END"
        );
        assert_eq!(
            Expr::OperationCode(ops)
                .render(RenderScope::for_operation(Dialect::Sqlite, Operation::Update)),
            "1"
        );
    }

    #[test]
    fn previous_event_reads_the_image_that_exists() {
        let expr = Expr::PreviousEvent {
            column: "pgh_last_event_id".to_string(),
        };
        assert_eq!(
            expr.render(RenderScope::new(Dialect::Postgres)),
            "COALESCE(NEW.\"pgh_last_event_id\", OLD.\"pgh_last_event_id\")"
        );
        assert_eq!(
            expr.render(RenderScope::for_operation(Dialect::Sqlite, Operation::Delete)),
            "OLD.\"pgh_last_event_id\""
        );
    }

    #[test]
    fn extra_context_merges_over_session_metadata() {
        let mut extra = Map::new();
        extra.insert("source".to_string(), Value::String("trigger".to_string()));
        let expr = Expr::ContextMetadata { extra };
        assert_eq!(
            expr.render(RenderScope::new(Dialect::Sqlite)),
            "json_patch(COALESCE(pgh_context_metadata(), '{}'), '{\"source\":\"trigger\"}')"
        );
        assert!(expr
            .render(RenderScope::new(Dialect::Postgres))
            .ends_with("|| '{\"source\":\"trigger\"}'::JSONB)"));
    }
}
