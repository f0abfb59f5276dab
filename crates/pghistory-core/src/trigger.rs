//! Trigger definitions and their dialect renderings.

use std::collections::BTreeSet;
use std::fmt::Write as _;

use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

use crate::condition::{Condition, RowImage};
use crate::model::{ContextStorage, EventModel};
use crate::schema::Entity;
use crate::sql::{
    qualified, quote_ident, sqlite_context_upsert, Dialect, Expr, InsertStatement,
    RenderScope, Returning,
};
use crate::tracker::{Operation, OperationSet, TriggerPreset, When};
use crate::HistoryError;

const EVENT_ID_VAR: &str = "_pgh_event_id";
/// Longest identifier Postgres keeps without truncating.
pub const MAX_TRIGGER_NAME_LEN: usize = 63;
const NAME_HASH_LEN: usize = 8;

/// Installs named triggers on an entity.
pub trait TriggerInstaller {
    /// Installs every trigger of the batch or none of them.
    ///
    /// # Errors
    /// Returns [`HistoryError::DuplicateTrigger`] when a name is already taken.
    fn install(
        &mut self,
        entity: &Entity,
        triggers: Vec<TriggerDefinition>,
    ) -> Result<(), HistoryError>;
}

/// Triggers collected while a history is being declared, in declaration order.
#[derive(Debug, Clone, Default)]
pub struct InstallPlan {
    triggers: Vec<TriggerDefinition>,
    names: BTreeSet<String>,
}

impl InstallPlan {
    #[must_use]
    pub fn triggers(&self) -> &[TriggerDefinition] {
        &self.triggers
    }
}

impl TriggerInstaller for InstallPlan {
    fn install(
        &mut self,
        entity: &Entity,
        triggers: Vec<TriggerDefinition>,
    ) -> Result<(), HistoryError> {
        let mut batch = BTreeSet::new();
        for trigger in &triggers {
            if self.names.contains(&trigger.name) || !batch.insert(trigger.name.clone()) {
                return Err(HistoryError::DuplicateTrigger(trigger.name.clone()));
            }
        }
        tracing::debug!(entity = %entity.label(), count = triggers.len(), "triggers planned");
        self.names.extend(batch);
        self.triggers.extend(triggers);
        Ok(())
    }
}

/// Inputs of one trigger, resolved by the tracker.
#[derive(Debug, Clone)]
pub struct TriggerSpec {
    pub name: String,
    pub label: String,
    pub preset: TriggerPreset,
    pub condition: Option<Condition>,
    pub extra_context: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackPointer {
    pub column: String,
    pub primary_key: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TriggerDefinition {
    pub name: String,
    pub table: String,
    pub event_model: String,
    pub label: String,
    pub when: When,
    pub operations: OperationSet,
    pub snapshot: RowImage,
    pub condition: Option<Condition>,
    pub insert: InsertStatement,
    pub back_pointer: Option<BackPointer>,
    /// The body upserts the context row before inserting the event.
    pub attach_context: bool,
    /// Concrete tracked columns, for whole-row comparisons.
    pub row_columns: Vec<String>,
}

/// `pgh_<table>_<label>_<type>` with non-identifier characters folded to `_`.
///
/// Names longer than [`MAX_TRIGGER_NAME_LEN`] are cut short and end in a hash
/// of the full name, so distinct long names stay distinct.
#[must_use]
pub fn trigger_name(table: &str, label: &str, tracker_type: &str) -> String {
    let raw = format!("pgh_{table}_{label}_{tracker_type}");
    let mut name = String::with_capacity(raw.len());
    let mut last_underscore = false;
    for ch in raw.chars() {
        if ch.is_ascii_alphanumeric() {
            name.push(ch.to_ascii_lowercase());
            last_underscore = false;
        } else if !last_underscore {
            name.push('_');
            last_underscore = true;
        }
    }
    if name.len() <= MAX_TRIGGER_NAME_LEN {
        return name;
    }
    let digest = hex::encode(Sha256::digest(name.as_bytes()));
    name.truncate(MAX_TRIGGER_NAME_LEN - NAME_HASH_LEN - 1);
    let kept = name.trim_end_matches('_').len();
    name.truncate(kept);
    name.push('_');
    name.push_str(&digest[..NAME_HASH_LEN]);
    name
}

/// Builds the procedure body for one firing of `spec` on `tracked`.
///
/// # Errors
/// Returns [`HistoryError::Configuration`] when the event model needs the
/// tracked primary key and the entity has none.
pub fn build_trigger(
    model: &EventModel,
    tracked: &Entity,
    spec: TriggerSpec,
) -> Result<TriggerDefinition, HistoryError> {
    let snapshot = spec.preset.snapshot;
    let mut insert = InsertStatement::new(model.table.clone());

    for column in model.columns.iter().filter(|column| column.concrete) {
        if let Some(source) = tracked.column(&column.name) {
            insert.set(column.column(), Expr::column(snapshot, source.column()));
        }
    }
    insert.set("pgh_operation", Expr::OperationCode(spec.preset.operations));
    insert.set("pgh_created_at", Expr::Now);
    insert.set("pgh_label", Expr::text(spec.label.clone()));

    let pointer = tracked.back_pointer().map(crate::schema::Column::column);
    if let (Some(pointer), true) = (&pointer, model.previous_id) {
        insert.set(
            "pgh_previous_id",
            Expr::PreviousEvent {
                column: pointer.clone(),
            },
        );
    }

    let needs_pk = model.obj_field.is_some() || pointer.is_some();
    let primary_key = match tracked.primary_key() {
        Some(pk) => Some(pk.column()),
        None if needs_pk => {
            return Err(HistoryError::Configuration(format!(
                "{} has no primary key to reference from {}",
                tracked.label(),
                model.label()
            )))
        }
        None => None,
    };

    if let (Some(obj), Some(pk)) = (&model.obj_field, &primary_key) {
        insert.set(obj.column(), Expr::column(snapshot, pk.clone()));
    }

    match &model.context {
        ContextStorage::None => {}
        ContextStorage::ForeignKey { column } => insert.set(column.column(), Expr::AttachContext),
        ContextStorage::Json { column, id_column } => {
            insert.set(
                column.column(),
                Expr::ContextMetadata {
                    extra: spec.extra_context.clone(),
                },
            );
            if let Some(id_column) = id_column {
                insert.set(id_column.column(), Expr::ContextId);
            }
        }
    }

    insert.returning = Returning::Into {
        column: "pgh_id".to_string(),
        variable: EVENT_ID_VAR.to_string(),
    };

    Ok(TriggerDefinition {
        name: spec.name,
        table: tracked.table(),
        event_model: model.label(),
        label: spec.label,
        when: spec.preset.when,
        operations: spec.preset.operations,
        snapshot,
        condition: spec.condition,
        insert,
        back_pointer: pointer.zip(primary_key).map(|(column, primary_key)| BackPointer {
            column,
            primary_key,
        }),
        attach_context: model.uses_context_table(),
        row_columns: tracked
            .concrete_columns()
            .map(crate::schema::Column::column)
            .collect(),
    })
}

impl TriggerDefinition {
    #[must_use]
    pub fn render(&self, dialect: Dialect) -> String {
        match dialect {
            Dialect::Postgres => self.render_postgres(),
            Dialect::Sqlite => self.render_sqlite(),
        }
    }

    /// Drops whatever `render` creates.
    #[must_use]
    pub fn render_drop(&self, dialect: Dialect) -> String {
        match dialect {
            Dialect::Postgres => format!(
                "DROP TRIGGER IF EXISTS {} ON {};\nDROP FUNCTION IF EXISTS {}();\n",
                quote_ident(&self.name),
                quote_ident(&self.table),
                quote_ident(&self.name)
            ),
            Dialect::Sqlite => self
                .operations
                .iter()
                .map(|operation| {
                    format!(
                        "DROP TRIGGER IF EXISTS {};\n",
                        quote_ident(&self.sqlite_name(operation))
                    )
                })
                .collect(),
        }
    }

    /// `OLD.pointer` differs while every other column is unchanged: the
    /// firing came from a back-pointer maintenance UPDATE.
    fn pointer_only_change(&self, dialect: Dialect) -> Option<String> {
        let pointer = &self.back_pointer.as_ref()?.column;
        let mut parts = vec![dialect.is_distinct(
            &qualified("OLD", pointer),
            &qualified("NEW", pointer),
        )];
        for column in self.row_columns.iter().filter(|column| *column != pointer) {
            parts.push(format!(
                "NOT ({})",
                dialect.is_distinct(&qualified("OLD", column), &qualified("NEW", column))
            ));
        }
        Some(format!("({})", parts.join(" AND ")))
    }

    fn returns_row(&self) -> &'static str {
        match (self.when, self.operations.iter().collect::<Vec<_>>().as_slice()) {
            (When::After, _) => "RETURN NULL;",
            (When::Before, [Operation::Delete]) => "RETURN OLD;",
            (When::Before, ops) if ops.contains(&Operation::Delete) => {
                "IF TG_OP = 'DELETE' THEN RETURN OLD; END IF;\n    RETURN NEW;"
            }
            (When::Before, _) => "RETURN NEW;",
        }
    }

    fn render_postgres(&self) -> String {
        let scope = RenderScope::new(Dialect::Postgres);
        let mut body = String::new();

        if self.operations.contains(Operation::Update) {
            if let Some(guard) = self.pointer_only_change(Dialect::Postgres) {
                let _ = write!(
                    body,
                    "    IF TG_OP = 'UPDATE' AND {guard} THEN\n        {}\n    END IF;\n",
                    self.returns_row().replace("\n    ", "\n        ")
                );
            }
        }
        let _ = writeln!(body, "    {};", self.insert.render(scope));

        if let Some(pointer) = &self.back_pointer {
            let writes_row = self
                .operations
                .iter()
                .any(|operation| operation != Operation::Delete);
            if writes_row {
                let assignment = match self.when {
                    When::Before => {
                        format!("NEW.{} := {EVENT_ID_VAR};", quote_ident(&pointer.column))
                    }
                    When::After => format!(
                        "UPDATE {} SET {} = {EVENT_ID_VAR} WHERE {} = {};",
                        quote_ident(&self.table),
                        quote_ident(&pointer.column),
                        quote_ident(&pointer.primary_key),
                        qualified("NEW", &pointer.primary_key)
                    ),
                };
                if self.operations.contains(Operation::Delete) {
                    let _ = writeln!(
                        body,
                        "    IF TG_OP <> 'DELETE' THEN\n        {assignment}\n    END IF;"
                    );
                } else {
                    let _ = writeln!(body, "    {assignment}");
                }
            }
        }
        let _ = writeln!(body, "    {}", self.returns_row());

        let tag = dollar_tag(&body);
        let mut sql = format!(
            "CREATE OR REPLACE FUNCTION {name}() RETURNS TRIGGER AS {tag}\n\
             DECLARE\n    {EVENT_ID_VAR} INTEGER;\nBEGIN\n{body}END;\n{tag} LANGUAGE plpgsql;\n",
            name = quote_ident(&self.name),
        );
        let _ = write!(
            sql,
            "DROP TRIGGER IF EXISTS {name} ON {table};\nCREATE TRIGGER {name} {when} {ops} ON {table} FOR EACH ROW",
            name = quote_ident(&self.name),
            table = quote_ident(&self.table),
            when = self.when.as_sql(),
            ops = self.operations.as_sql(),
        );
        if let Some(condition) = &self.condition {
            let _ = write!(
                sql,
                " WHEN ({})",
                condition.render(Dialect::Postgres, &self.row_columns)
            );
        }
        let _ = writeln!(sql, " EXECUTE FUNCTION {}();", quote_ident(&self.name));
        sql
    }

    fn sqlite_name(&self, operation: Operation) -> String {
        if self.operations.iter().count() > 1 {
            format!("{}_{}", self.name, operation.as_str())
        } else {
            self.name.clone()
        }
    }

    fn render_sqlite(&self) -> String {
        let mut sql = String::new();
        for operation in self.operations.iter() {
            let scope = RenderScope::for_operation(Dialect::Sqlite, operation);
            let name = quote_ident(&self.sqlite_name(operation));

            let mut conditions = Vec::new();
            if let Some(condition) = &self.condition {
                conditions.push(condition.render(Dialect::Sqlite, &self.row_columns));
            }
            if operation == Operation::Update {
                if let Some(guard) = self.pointer_only_change(Dialect::Sqlite) {
                    conditions.push(format!("NOT {guard}"));
                }
            }

            let _ = writeln!(sql, "DROP TRIGGER IF EXISTS {name};");
            let _ = write!(
                sql,
                "CREATE TRIGGER {name} {} {} ON {} FOR EACH ROW",
                self.when.as_sql(),
                operation.as_sql(),
                quote_ident(&self.table)
            );
            if !conditions.is_empty() {
                let guards: Vec<String> = conditions.iter().map(|c| format!("({c})")).collect();
                let _ = write!(sql, " WHEN {}", guards.join(" AND "));
            }
            sql.push_str("\nBEGIN\n");
            if self.attach_context {
                for statement in sqlite_context_upsert() {
                    let _ = writeln!(sql, "    {statement};");
                }
            }
            let mut insert = self.insert.clone();
            insert.returning = Returning::Nothing;
            let _ = writeln!(sql, "    {};", insert.render(scope));

            if let (Some(pointer), When::After, false) =
                (&self.back_pointer, self.when, operation == Operation::Delete)
            {
                let _ = writeln!(
                    sql,
                    "    UPDATE {} SET {} = last_insert_rowid() WHERE {} = {};",
                    quote_ident(&self.table),
                    quote_ident(&pointer.column),
                    quote_ident(&pointer.primary_key),
                    qualified("NEW", &pointer.primary_key)
                );
            }
            sql.push_str("END;\n");
        }
        sql
    }
}

/// A dollar-quote tag that does not occur in `body`.
fn dollar_tag(body: &str) -> String {
    let mut tag = "$pgh$".to_string();
    let mut suffix = 0_u32;
    while body.contains(&tag) {
        suffix += 1;
        tag = format!("$pgh{suffix}$");
    }
    tag
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn trigger_names_fold_separators() {
        assert_eq!(
            trigger_name("tests_snapshotmodel", "snapshot", "snapshot_insert"),
            "pgh_tests_snapshotmodel_snapshot_snapshot_insert"
        );
        assert_eq!(
            trigger_name("App Table", "Re-Titled!", "after_update"),
            "pgh_app_table_re_titled_after_update"
        );
    }

    #[test]
    fn long_trigger_names_are_capped_and_stay_distinct() {
        let table = "inventory_warehouse_stock_level";
        let first = trigger_name(table, "quarterly_compliance_audit_a", "after_update");
        let second = trigger_name(table, "quarterly_compliance_audit_b", "after_update");
        assert_eq!(first.len(), MAX_TRIGGER_NAME_LEN);
        assert_eq!(second.len(), MAX_TRIGGER_NAME_LEN);
        assert!(first.starts_with("pgh_inventory_warehouse_stock_level_quarterly_"));
        assert_ne!(first, second);
        assert_eq!(first, trigger_name(table, "quarterly_compliance_audit_a", "after_update"));

        let parts: BTreeSet<String> = ["snapshot_insert", "snapshot_update", "snapshot_delete"]
            .iter()
            .map(|kind| trigger_name(table, "quarterly_compliance_audit_a", kind))
            .collect();
        assert_eq!(parts.len(), 3);
    }

    proptest! {
        #[test]
        fn prop_trigger_names_are_plain_identifiers(
            table in "[A-Za-z_ .-]{1,80}",
            label in "\\PC{0,16}",
        ) {
            let name = trigger_name(&table, &label, "after_insert");
            prop_assert!(name.starts_with("pgh_"));
            prop_assert!(name
                .chars()
                .all(|ch| ch.is_ascii_lowercase() || ch.is_ascii_digit() || ch == '_'));
            prop_assert!(!name.contains("__"));
            prop_assert!(name.len() <= MAX_TRIGGER_NAME_LEN);
        }
    }
}
