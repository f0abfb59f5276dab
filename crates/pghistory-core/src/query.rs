//! Reading events back and writing snapshots over tracked rows.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::history::EventRecord;
use crate::model::{ContextStorage, EventModel};
use crate::schema::{ColumnKind, Entity};
use crate::sql::{qualified, quote_ident, quote_literal, Dialect};
use crate::{is_framework_owned, HistoryError, CONTEXT_TABLE};

/// Filters for [`select_events`]. Unset fields match everything.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct EventQuery {
    pub obj_id: Option<Value>,
    pub label: Option<String>,
    pub pgh_id: Option<i64>,
    pub limit: Option<usize>,
}

/// What one selected column holds, in select-list order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Selected {
    /// A reserved `pgh_` column, under its physical name.
    Framework(String),
    /// Context metadata, inline or joined from the context table.
    ContextMetadata,
    /// A snapshot or base column, keyed by field name.
    Data { field: String, kind: ColumnKind },
    Proxy { name: String, kind: ColumnKind },
}

#[derive(Debug, Clone)]
pub struct SelectStatement {
    pub sql: String,
    pub params: Vec<Value>,
    pub columns: Vec<Selected>,
}

const EVENT_ALIAS: &str = "e";
const CONTEXT_ALIAS: &str = "c";

/// `SELECT` over an event table ordered by `pgh_id`, joining the context
/// table when context is stored relationally.
///
/// # Errors
/// Returns [`HistoryError::Configuration`] for malformed proxy paths.
pub fn select_events(
    model: &EventModel,
    dialect: Dialect,
    query: &EventQuery,
) -> Result<SelectStatement, HistoryError> {
    let event = quote_ident(EVENT_ALIAS);
    let mut select = Vec::new();
    let mut columns = Vec::new();

    let mut framework = vec!["pgh_id", "pgh_created_at", "pgh_label", "pgh_operation"];
    if model.previous_id {
        framework.push("pgh_previous_id");
    }
    let obj_column = model.obj_field.as_ref().map(crate::schema::Column::column);
    if let Some(obj) = &obj_column {
        framework.push(obj);
    }
    for name in framework {
        select.push(qualified(&event, name));
        columns.push(Selected::Framework(name.to_string()));
    }

    let mut join = None;
    let metadata = match &model.context {
        ContextStorage::None => None,
        ContextStorage::ForeignKey { column } => {
            let physical = column.column();
            select.push(qualified(&event, &physical));
            columns.push(Selected::Framework("pgh_context_id".to_string()));
            let context = quote_ident(CONTEXT_ALIAS);
            join = Some(format!(
                " LEFT JOIN {} AS {context} ON {} = {}",
                quote_ident(CONTEXT_TABLE),
                qualified(&context, "id"),
                qualified(&event, &physical)
            ));
            Some(qualified(&context, "metadata"))
        }
        ContextStorage::Json { column, id_column } => {
            if let Some(id_column) = id_column {
                select.push(qualified(&event, &id_column.column()));
                columns.push(Selected::Framework("pgh_context_id".to_string()));
            }
            Some(qualified(&event, &column.column()))
        }
    };
    if let Some(metadata) = &metadata {
        select.push(metadata.clone());
        columns.push(Selected::ContextMetadata);
    }

    for column in model
        .base
        .columns
        .iter()
        .chain(model.columns.iter())
        .filter(|column| column.concrete && !is_framework_owned(&column.name))
    {
        select.push(qualified(&event, &column.column()));
        columns.push(Selected::Data {
            field: column.name.clone(),
            kind: column.kind.clone(),
        });
    }

    for proxy in &model.proxy_fields {
        let keys = proxy.keys()?;
        let expr = match &metadata {
            Some(metadata) => proxy_expr(metadata, &keys, dialect),
            None => "NULL".to_string(),
        };
        select.push(format!("{expr} AS {}", quote_ident(&proxy.name)));
        columns.push(Selected::Proxy {
            name: proxy.name.clone(),
            kind: proxy.kind.clone(),
        });
    }

    let mut sql = format!(
        "SELECT {} FROM {} AS {event}{}",
        select.join(", "),
        quote_ident(&model.table),
        join.unwrap_or_default()
    );

    let mut filters = Vec::new();
    let mut params = Vec::new();
    if let (Some(obj_id), Some(obj)) = (&query.obj_id, &obj_column) {
        params.push(obj_id.clone());
        filters.push(format!("{} = {}", qualified(&event, obj), dialect.param(params.len())));
    }
    if let Some(label) = &query.label {
        params.push(Value::String(label.clone()));
        filters.push(format!(
            "{} = {}",
            qualified(&event, "pgh_label"),
            dialect.param(params.len())
        ));
    }
    if let Some(pgh_id) = query.pgh_id {
        params.push(Value::from(pgh_id));
        filters.push(format!("{} = {}", qualified(&event, "pgh_id"), dialect.param(params.len())));
    }
    if !filters.is_empty() {
        sql.push_str(" WHERE ");
        sql.push_str(&filters.join(" AND "));
    }
    sql.push_str(&format!(" ORDER BY {}", qualified(&event, "pgh_id")));
    if let Some(limit) = query.limit {
        sql.push_str(&format!(" LIMIT {limit}"));
    }

    Ok(SelectStatement { sql, params, columns })
}

fn proxy_expr(metadata: &str, keys: &[&str], dialect: Dialect) -> String {
    match dialect {
        Dialect::Sqlite => {
            let path: String = keys
                .iter()
                .map(|key| format!(".\"{}\"", key.replace('"', "\\\"")))
                .collect();
            format!("json_extract({metadata}, {})", quote_literal(&format!("${path}")))
        }
        Dialect::Postgres => {
            let mut expr = metadata.to_string();
            for (idx, key) in keys.iter().enumerate() {
                let op = if idx + 1 == keys.len() { "->>" } else { "->" };
                expr = format!("{expr} {op} {}", quote_literal(key));
            }
            format!("({expr})")
        }
    }
}

/// An upsert of `record`'s snapshot over the tracked row, keyed by its
/// primary key, with parameters in column order.
#[derive(Debug, Clone)]
pub struct RevertStatement {
    pub sql: String,
    pub params: Vec<Value>,
}

/// # Errors
/// Returns [`HistoryError::CannotRevert`] when the model does not capture
/// every tracked column or the tracked entity has no primary key.
pub fn revert_statement(
    model: &EventModel,
    tracked: &Entity,
    record: &EventRecord,
    dialect: Dialect,
) -> Result<RevertStatement, HistoryError> {
    let pk = match tracked.primary_key() {
        Some(pk) if model.can_revert(tracked) => pk,
        _ => return Err(HistoryError::CannotRevert(model.label())),
    };

    let mut names = Vec::new();
    let mut values = Vec::new();
    let mut params = Vec::new();
    for column in tracked
        .concrete_columns()
        .filter(|column| !is_framework_owned(&column.name))
    {
        params.push(
            record
                .data
                .get(&column.name)
                .cloned()
                .unwrap_or(Value::Null),
        );
        names.push(quote_ident(&column.column()));
        values.push(dialect.param(params.len()));
    }
    let updates: Vec<String> = names
        .iter()
        .filter(|name| **name != quote_ident(&pk.column()))
        .map(|name| format!("{name} = excluded.{name}"))
        .collect();
    let conflict = if updates.is_empty() {
        "DO NOTHING".to_string()
    } else {
        format!("DO UPDATE SET {}", updates.join(", "))
    };
    let sql = format!(
        "INSERT INTO {} ({}) VALUES ({}) ON CONFLICT ({}) {conflict}",
        quote_ident(&tracked.table()),
        names.join(", "),
        values.join(", "),
        quote_ident(&pk.column())
    );
    tracing::debug!(model = %model.label(), pgh_id = record.pgh_id, "revert prepared");
    Ok(RevertStatement { sql, params })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HistoryConfig;
    use crate::history::{History, HistoryBuilder};
    use crate::model::{ContextField, EventModelOptions, ProxyField, Setting};
    use crate::schema::{Column, ColumnOptions, Namespace, SchemaRegistry};
    use crate::tracker::Tracker;
    use serde_json::json;
    use std::collections::BTreeMap;

    fn must<T>(result: Result<T, HistoryError>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("test failure: {err}"),
        }
    }

    fn fixture(options: EventModelOptions) -> History {
        let mut schema = SchemaRegistry::default();
        schema.add_namespace(Namespace::owned("shop"));
        must(schema.define(
            Entity::new("shop", "Order")
                .with_column(Column::new("id", ColumnKind::Auto).primary_key())
                .with_column(Column::new("status", ColumnKind::Text)),
        ));
        let mut builder = must(HistoryBuilder::with_schema(HistoryConfig::default(), schema));
        must(builder.track("shop.Order", vec![Tracker::snapshot("snapshot")], options));
        builder.finish()
    }

    #[test]
    fn relational_context_is_joined_and_proxied() {
        let history = fixture(EventModelOptions {
            proxy_fields: vec![ProxyField::new(
                "user",
                "pgh_context__user__name",
                ColumnKind::Text,
            )],
            ..EventModelOptions::default()
        });
        let model = must(history.event_model("shop.OrderEvent"));
        let query = EventQuery {
            obj_id: Some(json!(4)),
            label: Some("snapshot".to_string()),
            ..EventQuery::default()
        };

        let sqlite = must(select_events(model, Dialect::Sqlite, &query));
        assert!(sqlite.sql.contains(
            "FROM \"shop_orderevent\" AS \"e\" LEFT JOIN \"pgh_context\" AS \"c\" ON \"c\".\"id\" = \"e\".\"pgh_context_id\""
        ));
        assert!(sqlite
            .sql
            .contains("json_extract(\"c\".\"metadata\", '$.\"user\".\"name\"') AS \"user\""));
        assert!(sqlite.sql.ends_with(
            "WHERE \"e\".\"pgh_obj_id\" = ?1 AND \"e\".\"pgh_label\" = ?2 ORDER BY \"e\".\"pgh_id\""
        ));
        assert_eq!(sqlite.params, vec![json!(4), json!("snapshot")]);
        assert!(sqlite.columns.contains(&Selected::Framework("pgh_previous_id".to_string())));
        assert!(sqlite.columns.contains(&Selected::Data {
            field: "status".to_string(),
            kind: ColumnKind::Text
        }));

        let postgres = must(select_events(model, Dialect::Postgres, &query));
        assert!(postgres.sql.contains("(\"c\".\"metadata\" -> 'user' ->> 'name') AS \"user\""));
        assert!(postgres.sql.contains("\"e\".\"pgh_obj_id\" = $1"));
    }

    #[test]
    fn json_context_is_read_inline() {
        let history = fixture(EventModelOptions {
            context_field: Setting::Custom(ContextField::Json {
                options: ColumnOptions::default(),
            }),
            proxy_fields: vec![ProxyField::new("url", "pgh_context__url", ColumnKind::Text)],
            ..EventModelOptions::default()
        });
        let model = must(history.event_model("shop.OrderEvent"));
        let select = must(select_events(
            model,
            Dialect::Sqlite,
            &EventQuery {
                limit: Some(10),
                ..EventQuery::default()
            },
        ));
        assert!(!select.sql.contains("JOIN"));
        assert!(select.sql.contains("json_extract(\"e\".\"pgh_context\", '$.\"url\"') AS \"url\""));
        assert!(select.sql.ends_with("ORDER BY \"e\".\"pgh_id\" LIMIT 10"));
        assert!(select.params.is_empty());
    }

    #[test]
    fn revert_upserts_every_tracked_field() {
        let history = fixture(EventModelOptions::default());
        let model = must(history.event_model("shop.OrderEvent"));
        let tracked = must(history.schema().entity("shop.Order"));
        let record = EventRecord {
            model: model.label(),
            pgh_id: 1,
            pgh_created_at: time::OffsetDateTime::UNIX_EPOCH,
            pgh_label: "snapshot".to_string(),
            pgh_operation: None,
            pgh_obj_id: Some(json!(3)),
            pgh_previous_id: None,
            pgh_context_id: None,
            pgh_context: None,
            data: BTreeMap::from([
                ("id".to_string(), json!(3)),
                ("status".to_string(), json!("open")),
            ]),
            proxies: BTreeMap::new(),
        };
        let revert = must(revert_statement(model, tracked, &record, Dialect::Sqlite));
        assert_eq!(
            revert.sql,
            "INSERT INTO \"shop_order\" (\"id\", \"status\") VALUES (?1, ?2) \
             ON CONFLICT (\"id\") DO UPDATE SET \"status\" = excluded.\"status\""
        );
        assert_eq!(revert.params, vec![json!(3), json!("open")]);
    }

    #[test]
    fn partial_snapshots_cannot_revert() {
        let mut schema = SchemaRegistry::default();
        schema.add_namespace(Namespace::owned("shop"));
        must(schema.define(
            Entity::new("shop", "Order")
                .with_column(Column::new("id", ColumnKind::Auto).primary_key())
                .with_column(Column::new("status", ColumnKind::Text)),
        ));
        let mut builder = must(HistoryBuilder::with_schema(HistoryConfig::default(), schema));
        let model = must(builder.create_event_model(
            "shop.Order",
            vec![Tracker::manual("manual")],
            EventModelOptions {
                fields: Some(vec!["status".to_string()]),
                ..EventModelOptions::default()
            },
        ));
        let history = builder.finish();
        let tracked = must(history.schema().entity("shop.Order"));
        let record = EventRecord {
            model: model.label(),
            pgh_id: 1,
            pgh_created_at: time::OffsetDateTime::UNIX_EPOCH,
            pgh_label: "manual".to_string(),
            pgh_operation: None,
            pgh_obj_id: None,
            pgh_previous_id: None,
            pgh_context_id: None,
            pgh_context: None,
            data: BTreeMap::new(),
            proxies: BTreeMap::new(),
        };
        assert!(matches!(
            revert_statement(&model, tracked, &record, Dialect::Sqlite),
            Err(HistoryError::CannotRevert(_))
        ));
    }
}
