//! Table, function and trigger DDL for installing a history.

use std::fmt::Write as _;

use crate::history::History;
use crate::model::{context_entity, EventModel};
use crate::schema::{Column, ColumnKind, Entity, SchemaRegistry};
use crate::sql::{quote_ident, quote_literal, Dialect};
use crate::trigger::trigger_name;
use crate::{BACK_POINTER_COLUMN, CONTEXT_TABLE};

#[must_use]
pub fn column_type(kind: &ColumnKind, schema: &SchemaRegistry, dialect: Dialect) -> String {
    if kind.is_relation() {
        return column_type(&schema.relation_target_kind(kind), schema, dialect);
    }
    let sql = match (dialect, kind) {
        (Dialect::Postgres, ColumnKind::Auto | ColumnKind::Integer) => "INTEGER",
        (Dialect::Postgres, ColumnKind::BigAuto | ColumnKind::BigInteger) => "BIGINT",
        (Dialect::Postgres, ColumnKind::SmallAuto | ColumnKind::SmallInteger) => "SMALLINT",
        (Dialect::Postgres, ColumnKind::Boolean) => "BOOLEAN",
        (Dialect::Postgres, ColumnKind::Text) => "TEXT",
        (Dialect::Postgres, ColumnKind::Char { max_length }) => {
            return format!("VARCHAR({max_length})")
        }
        (Dialect::Postgres, ColumnKind::Float) => "DOUBLE PRECISION",
        (Dialect::Postgres, ColumnKind::Decimal { precision, scale }) => {
            return format!("NUMERIC({precision}, {scale})")
        }
        (Dialect::Postgres, ColumnKind::DateTime) => "TIMESTAMP WITH TIME ZONE",
        (Dialect::Postgres, ColumnKind::Date) => "DATE",
        (Dialect::Postgres, ColumnKind::Uuid) => "UUID",
        (Dialect::Postgres, ColumnKind::Json) => "JSONB",
        (Dialect::Postgres, ColumnKind::Binary) => "BYTEA",
        (Dialect::Postgres, ColumnKind::File) => "VARCHAR(100)",
        (
            Dialect::Sqlite,
            ColumnKind::Auto
            | ColumnKind::BigAuto
            | ColumnKind::SmallAuto
            | ColumnKind::Integer
            | ColumnKind::BigInteger
            | ColumnKind::SmallInteger
            | ColumnKind::Boolean,
        ) => "INTEGER",
        (Dialect::Sqlite, ColumnKind::Float) => "REAL",
        (Dialect::Sqlite, ColumnKind::Decimal { .. }) => "NUMERIC",
        (Dialect::Sqlite, ColumnKind::Binary) => "BLOB",
        (Dialect::Sqlite, ColumnKind::Char { max_length }) => {
            return format!("VARCHAR({max_length})");
        }
        (Dialect::Sqlite, _) => "TEXT",
        (Dialect::Postgres, ColumnKind::ForeignKey { .. } | ColumnKind::OneToOne { .. }) => {
            "INTEGER"
        }
    };
    sql.to_string()
}

fn column_definition(column: &Column, schema: &SchemaRegistry, dialect: Dialect) -> String {
    let name = quote_ident(&column.column());
    if column.kind.is_auto() && column.options.is_primary_key() {
        return match (dialect, &column.kind) {
            (Dialect::Sqlite, _) => format!("{name} INTEGER PRIMARY KEY AUTOINCREMENT"),
            (Dialect::Postgres, ColumnKind::BigAuto) => format!("{name} BIGSERIAL PRIMARY KEY"),
            (Dialect::Postgres, ColumnKind::SmallAuto) => format!("{name} SMALLSERIAL PRIMARY KEY"),
            (Dialect::Postgres, _) => format!("{name} SERIAL PRIMARY KEY"),
        };
    }

    let mut sql = format!("{name} {}", column_type(&column.kind, schema, dialect));
    if column.options.is_primary_key() {
        sql.push_str(" PRIMARY KEY");
    } else {
        sql.push_str(if column.options.is_null() { " NULL" } else { " NOT NULL" });
        if column.options.is_unique() {
            sql.push_str(" UNIQUE");
        }
    }
    if column.options.has_db_constraint() {
        let target = column
            .kind
            .related_entity()
            .and_then(|label| schema.entity(label).ok())
            .and_then(|entity| entity.primary_key().map(|pk| (entity.table(), pk.column())));
        if let Some((table, pk)) = target {
            let _ = write!(sql, " REFERENCES {} ({})", quote_ident(&table), quote_ident(&pk));
            if let Some(action) = column.options.on_delete().as_sql() {
                let _ = write!(sql, " ON DELETE {action}");
            }
        }
    }
    sql
}

/// `CREATE TABLE IF NOT EXISTS` plus indexes for relation and indexed columns.
#[must_use]
pub fn entity_table(entity: &Entity, schema: &SchemaRegistry, dialect: Dialect) -> String {
    let table = entity.table();
    let columns: Vec<String> = entity
        .concrete_columns()
        .map(|column| format!("    {}", column_definition(column, schema, dialect)))
        .collect();
    let mut sql = format!(
        "CREATE TABLE IF NOT EXISTS {} (\n{}\n);\n",
        quote_ident(&table),
        columns.join(",\n")
    );
    for column in entity.concrete_columns() {
        let indexed = column
            .options
            .db_index
            .unwrap_or_else(|| column.kind.is_relation());
        if !indexed || column.options.is_primary_key() || column.options.is_unique() {
            continue;
        }
        let physical = column.column();
        let _ = writeln!(
            sql,
            "CREATE INDEX IF NOT EXISTS {} ON {} ({});",
            quote_ident(&format!("{table}_{physical}_idx")),
            quote_ident(&table),
            quote_ident(&physical)
        );
    }
    sql
}

#[must_use]
pub fn event_table(model: &EventModel, schema: &SchemaRegistry, dialect: Dialect) -> String {
    entity_table(&model.storage_entity(), schema, dialect)
}

/// The shared context table, plus the attach function on Postgres.
#[must_use]
pub fn context_table(schema: &SchemaRegistry, dialect: Dialect) -> String {
    let mut sql = entity_table(&context_entity(), schema, dialect);
    if dialect == Dialect::Postgres {
        sql.push_str(&attach_context_function());
    }
    sql
}

/// Upserts the transaction's context settings into the context table and
/// returns the context id, or NULL outside a context.
#[must_use]
pub fn attach_context_function() -> String {
    let table = quote_ident(CONTEXT_TABLE);
    format!(
        "CREATE OR REPLACE FUNCTION _pgh_attach_context() RETURNS UUID AS $pgh$\n\
         DECLARE\n    \
             _pgh_context_id UUID := NULLIF(CURRENT_SETTING('pghistory.context_id', TRUE), '')::UUID;\n    \
             _pgh_context_metadata JSONB := NULLIF(CURRENT_SETTING('pghistory.context_metadata', TRUE), '')::JSONB;\n\
         BEGIN\n    \
             IF _pgh_context_id IS NULL OR _pgh_context_metadata IS NULL THEN\n        \
                 RETURN NULL;\n    \
             END IF;\n    \
             INSERT INTO {table} (\"created_at\", \"id\", \"metadata\", \"updated_at\")\n        \
                 VALUES (NOW(), _pgh_context_id, _pgh_context_metadata, NOW())\n        \
                 ON CONFLICT (\"id\") DO UPDATE SET \"metadata\" = EXCLUDED.\"metadata\", \
                 \"updated_at\" = EXCLUDED.\"updated_at\";\n    \
             RETURN _pgh_context_id;\n\
         END;\n\
         $pgh$ LANGUAGE plpgsql;\n"
    )
}

/// Veto triggers that reject updates and deletes of event rows.
#[must_use]
pub fn append_only(model: &EventModel, dialect: Dialect) -> String {
    let table = quote_ident(&model.table);
    let message = format!("{} is append-only", model.table);
    let name = trigger_name(&model.table, "append_only", "veto");
    match dialect {
        Dialect::Sqlite => ["update", "delete"]
            .iter()
            .map(|operation| {
                format!(
                    "CREATE TRIGGER IF NOT EXISTS {} BEFORE {} ON {table}\nBEGIN\n    SELECT RAISE(FAIL, {});\nEND;\n",
                    quote_ident(&format!("{name}_{operation}")),
                    operation.to_uppercase(),
                    quote_literal(&message)
                )
            })
            .collect(),
        Dialect::Postgres => {
            let function = quote_ident(&name);
            format!(
                "CREATE OR REPLACE FUNCTION {function}() RETURNS TRIGGER AS $pgh$\n\
                 BEGIN\n    RAISE EXCEPTION {};\nEND;\n$pgh$ LANGUAGE plpgsql;\n\
                 DROP TRIGGER IF EXISTS {function} ON {table};\n\
                 CREATE TRIGGER {function} BEFORE UPDATE OR DELETE ON {table} FOR EACH ROW EXECUTE FUNCTION {function}();\n",
                quote_literal(&message.replace('%', "%%"))
            )
        }
    }
}

/// Adds the back-pointer column to a tracked table.
#[must_use]
pub fn add_back_pointer(entity: &Entity, dialect: Dialect) -> String {
    let guard = match dialect {
        Dialect::Postgres => "IF NOT EXISTS ",
        Dialect::Sqlite => "",
    };
    format!(
        "ALTER TABLE {} ADD COLUMN {guard}{} INTEGER NULL;\n",
        quote_ident(&entity.table()),
        quote_ident(BACK_POINTER_COLUMN)
    )
}

/// The whole install script for `history`: context storage, event tables,
/// back-pointer columns, then triggers in declaration order.
#[must_use]
pub fn install_script(history: &History, dialect: Dialect) -> String {
    let schema = history.schema();
    let mut sql = String::new();
    if history.uses_context_table() {
        sql.push_str(&context_table(schema, dialect));
    }
    let mut pointer_tables = Vec::new();
    for model in history.models() {
        sql.push_str(&event_table(model, schema, dialect));
        if model.append_only {
            sql.push_str(&append_only(model, dialect));
        }
        if let Ok(tracked) = schema.entity(&model.tracked) {
            if tracked.back_pointer().is_some() && !pointer_tables.contains(&tracked.table()) {
                pointer_tables.push(tracked.table());
                sql.push_str(&add_back_pointer(tracked, dialect));
            }
        }
    }
    for trigger in history.plan().triggers() {
        sql.push_str(&trigger.render(dialect));
    }
    sql
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::condition::Predicate;
    use crate::config::HistoryConfig;
    use crate::history::HistoryBuilder;
    use crate::model::{ContextField, EventModelOptions, Setting};
    use crate::schema::{ColumnOptions, Namespace};
    use crate::tracker::{Tracker, TrackerKind};
    use crate::HistoryError;

    fn must<T>(result: Result<T, HistoryError>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("test failure: {err}"),
        }
    }

    fn fixture_history(trackers: Vec<Tracker>, options: EventModelOptions, track: bool) -> History {
        let mut schema = SchemaRegistry::default();
        schema.add_namespace(Namespace::owned("tests"));
        must(schema.define(
            Entity::new("tests", "Model")
                .with_column(Column::new("id", ColumnKind::Auto).primary_key())
                .with_column(Column::new("int_field", ColumnKind::Integer))
                .with_column(
                    Column::new("char_field", ColumnKind::Char { max_length: 32 }).nullable(),
                ),
        ));
        let mut builder = must(HistoryBuilder::with_schema(HistoryConfig::default(), schema));
        if track {
            must(builder.track("tests.Model", trackers, options));
        } else {
            must(builder.create_event_model("tests.Model", trackers, options));
        }
        builder.finish()
    }

    #[test]
    fn postgres_after_update_body_is_stable() {
        let history = fixture_history(
            vec![Tracker::new(TrackerKind::AfterUpdate)
                .with_label("int_changed")
                .with_condition(Predicate::field_changed("int_field"))],
            EventModelOptions {
                context_field: Setting::Disabled,
                ..EventModelOptions::default()
            },
            false,
        );
        let trigger = &history.plan().triggers()[0];
        assert_eq!(
            trigger.render(Dialect::Postgres),
            "CREATE OR REPLACE FUNCTION \"pgh_tests_model_int_changed_after_update\"() RETURNS TRIGGER AS $pgh$\n\
             DECLARE\n    _pgh_event_id INTEGER;\nBEGIN\n    \
             INSERT INTO \"tests_modelevent\" (\"char_field\", \"id\", \"int_field\", \"pgh_created_at\", \
             \"pgh_label\", \"pgh_obj_id\", \"pgh_operation\") VALUES (NEW.\"char_field\", NEW.\"id\", \
             NEW.\"int_field\", NOW(), 'int_changed', NEW.\"id\", 1) RETURNING \"pgh_id\" INTO _pgh_event_id;\n    \
             RETURN NULL;\nEND;\n$pgh$ LANGUAGE plpgsql;\n\
             DROP TRIGGER IF EXISTS \"pgh_tests_model_int_changed_after_update\" ON \"tests_model\";\n\
             CREATE TRIGGER \"pgh_tests_model_int_changed_after_update\" AFTER UPDATE ON \"tests_model\" \
             FOR EACH ROW WHEN (OLD.\"int_field\" IS DISTINCT FROM NEW.\"int_field\") \
             EXECUTE FUNCTION \"pgh_tests_model_int_changed_after_update\"();\n"
        );
    }

    #[test]
    fn postgres_tracked_body_maintains_back_pointer() {
        let history = fixture_history(
            vec![Tracker::new(TrackerKind::AfterInsertOrUpdate).with_label("audit")],
            EventModelOptions::default(),
            true,
        );
        let sql = history.plan().triggers()[0].render(Dialect::Postgres);
        assert!(sql.contains("CASE TG_OP WHEN 'INSERT' THEN 0 WHEN 'UPDATE' THEN 1 END"));
        assert!(sql.contains(
            "COALESCE(NEW.\"pgh_last_event_id\", OLD.\"pgh_last_event_id\")"
        ));
        assert!(sql.contains("_pgh_attach_context()"));
        assert!(sql.contains(
            "UPDATE \"tests_model\" SET \"pgh_last_event_id\" = _pgh_event_id WHERE \"id\" = NEW.\"id\";"
        ));
        assert!(sql.contains(
            "IF TG_OP = 'UPDATE' AND (OLD.\"pgh_last_event_id\" IS DISTINCT FROM NEW.\"pgh_last_event_id\""
        ));
        assert!(sql.contains("AFTER INSERT OR UPDATE ON \"tests_model\""));
    }

    #[test]
    fn postgres_before_triggers_return_the_row() {
        let history = fixture_history(
            vec![Tracker::new(TrackerKind::BeforeUpdateOrDelete).with_label("audit")],
            EventModelOptions::default(),
            true,
        );
        let sql = history.plan().triggers()[0].render(Dialect::Postgres);
        assert!(sql.contains("NEW.\"pgh_last_event_id\" := _pgh_event_id;"));
        assert!(sql.contains("IF TG_OP = 'DELETE' THEN RETURN OLD; END IF;"));
        assert!(sql.contains("OLD.\"id\", OLD.\"int_field\""));
        assert!(!sql.contains("UPDATE \"tests_model\""));
    }

    #[test]
    fn sqlite_snapshot_splits_operations_and_guards_pointer_updates() {
        let history = fixture_history(
            vec![Tracker::snapshot("snapshot")],
            EventModelOptions {
                context_field: Setting::Custom(ContextField::Json {
                    options: ColumnOptions::default(),
                }),
                ..EventModelOptions::default()
            },
            true,
        );
        let triggers = history.plan().triggers();
        assert_eq!(triggers.len(), 3);

        let update = triggers[1].render(Dialect::Sqlite);
        assert!(update.starts_with(
            "DROP TRIGGER IF EXISTS \"pgh_tests_model_snapshot_snapshot_update\";\n\
             CREATE TRIGGER \"pgh_tests_model_snapshot_snapshot_update\" AFTER UPDATE ON \"tests_model\" FOR EACH ROW WHEN"
        ));
        assert!(update.contains("OLD.\"int_field\" IS NOT NEW.\"int_field\""));
        assert!(update.contains(
            "NOT ((OLD.\"pgh_last_event_id\" IS NOT NEW.\"pgh_last_event_id\""
        ));
        assert!(update.contains("pgh_context_metadata()"));
        assert!(update.contains(
            "UPDATE \"tests_model\" SET \"pgh_last_event_id\" = last_insert_rowid()"
        ));

        let delete = triggers[2].render(Dialect::Sqlite);
        assert!(delete.contains("OLD.\"pgh_last_event_id\""));
        assert!(!delete.contains("last_insert_rowid()"));
        assert!(delete.contains(", 2, "));
    }

    #[test]
    fn install_script_orders_tables_before_triggers() {
        let history = fixture_history(
            vec![Tracker::snapshot("snapshot")],
            EventModelOptions {
                append_only: Some(true),
                ..EventModelOptions::default()
            },
            true,
        );
        let sql = install_script(&history, Dialect::Sqlite);
        let context = sql.find("CREATE TABLE IF NOT EXISTS \"pgh_context\"");
        let events = sql.find("CREATE TABLE IF NOT EXISTS \"tests_modelevent\"");
        let trigger = sql.find("CREATE TRIGGER \"pgh_tests_model_snapshot_snapshot_insert\"");
        assert!(context < events && events < trigger, "{sql}");
        assert!(context.is_some());
        assert!(sql.contains("\"pgh_id\" INTEGER PRIMARY KEY AUTOINCREMENT"));
        assert!(sql.contains("\"char_field\" VARCHAR(32) NULL"));
        assert!(sql.contains("SELECT RAISE(FAIL, 'tests_modelevent is append-only');"));
        assert!(sql.contains(
            "ALTER TABLE \"tests_model\" ADD COLUMN \"pgh_last_event_id\" INTEGER NULL;"
        ));
        assert!(sql.contains("CREATE INDEX IF NOT EXISTS \"tests_modelevent_pgh_obj_id_idx\""));

        let pg = install_script(&history, Dialect::Postgres);
        assert!(pg.contains("CREATE OR REPLACE FUNCTION _pgh_attach_context() RETURNS UUID"));
        assert!(pg.contains("\"pgh_context_id\" UUID NULL"));
        assert!(pg.contains("RAISE EXCEPTION 'tests_modelevent is append-only';"));
    }
}
