//! Event model descriptors.
//!
//! An [`EventModel`] is the immutable description of one event table: the
//! snapshot columns derived from a tracked entity plus the reserved `pgh_`
//! columns. Models are built by [`crate::HistoryBuilder`].

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::schema::{Column, ColumnKind, ColumnOptions, Entity};
use crate::tracker::Tracker;
use crate::{is_framework_owned, HistoryError, CONTEXT_TABLE};

/// Namespace and name of the shared context entity.
pub const CONTEXT_NAMESPACE: &str = "pghistory";
pub const CONTEXT_ENTITY: &str = "pghistory.Context";

const PROXY_PREFIX: &str = "pgh_context__";

/// Three-way option: engine default, explicitly disabled, or custom.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Default)]
#[serde(rename_all = "snake_case")]
pub enum Setting<T> {
    #[default]
    Default,
    Disabled,
    Custom(T),
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Default)]
#[serde(default)]
pub struct ObjField {
    pub options: ColumnOptions,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(tag = "storage", rename_all = "snake_case")]
pub enum ContextField {
    ForeignKey {
        #[serde(default)]
        options: ColumnOptions,
    },
    Json {
        #[serde(default)]
        options: ColumnOptions,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Default)]
#[serde(default)]
pub struct ContextIdField {
    pub options: ColumnOptions,
}

/// Base of an event model. Custom bases contribute extra columns that
/// triggers leave to their defaults.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct BaseModel {
    pub name: String,
    #[serde(default)]
    pub columns: Vec<Column>,
    #[serde(default = "default_true")]
    pub derives_event: bool,
}

fn default_true() -> bool {
    true
}

impl Default for BaseModel {
    fn default() -> Self {
        Self {
            name: "Event".to_string(),
            columns: Vec::new(),
            derives_event: true,
        }
    }
}

/// A pseudo-column read from context metadata, e.g. `pgh_context__user__email`.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct ProxyField {
    pub name: String,
    pub path: String,
    pub kind: ColumnKind,
}

impl ProxyField {
    #[must_use]
    pub fn new(name: impl Into<String>, path: impl Into<String>, kind: ColumnKind) -> Self {
        Self {
            name: name.into(),
            path: path.into(),
            kind,
        }
    }

    /// Metadata keys the path walks through.
    ///
    /// # Errors
    /// Returns [`HistoryError::Configuration`] unless the path is
    /// `pgh_context__<key>[__<key>...]`.
    pub fn keys(&self) -> Result<Vec<&str>, HistoryError> {
        let keys: Vec<&str> = self
            .path
            .strip_prefix(PROXY_PREFIX)
            .map(|rest| rest.split("__").collect())
            .unwrap_or_default();
        if keys.is_empty() || keys.iter().any(|key| key.is_empty()) {
            return Err(HistoryError::Configuration(format!(
                "proxy field \"{}\" must read from {PROXY_PREFIX}<key>, got \"{}\"",
                self.name, self.path
            )));
        }
        Ok(keys)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(tag = "storage", rename_all = "snake_case")]
pub enum ContextStorage {
    None,
    /// `pgh_context_id` references the shared context table.
    ForeignKey { column: Column },
    /// `pgh_context` holds the metadata inline, optionally with `pgh_context_id`.
    Json {
        column: Column,
        id_column: Option<Column>,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct EventModelOptions {
    /// Snapshot only these fields.
    pub fields: Option<Vec<String>>,
    pub exclude: Vec<String>,
    pub obj_field: Setting<ObjField>,
    pub context_field: Setting<ContextField>,
    pub context_id_field: Setting<ContextIdField>,
    pub related_name: Option<String>,
    pub model_name: Option<String>,
    /// Namespace of the event model; defaults to the tracked entity's.
    pub namespace: Option<String>,
    pub base_model: Option<BaseModel>,
    pub attrs: BTreeMap<String, Value>,
    pub meta: BTreeMap<String, Value>,
    pub proxy_fields: Vec<ProxyField>,
    pub append_only: Option<bool>,
    /// Abstract models are returned unregistered and install nothing.
    #[serde(rename = "abstract")]
    pub abstract_model: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EventModel {
    pub namespace: String,
    pub name: String,
    pub table: String,
    /// Label of the tracked entity.
    pub tracked: String,
    pub base: BaseModel,
    /// Snapshot columns derived from the tracked entity.
    pub columns: Vec<Column>,
    pub obj_field: Option<Column>,
    pub context: ContextStorage,
    pub previous_id: bool,
    pub trackers: Vec<Tracker>,
    pub proxy_fields: Vec<ProxyField>,
    pub attrs: BTreeMap<String, Value>,
    pub meta: BTreeMap<String, Value>,
    pub append_only: bool,
    pub is_abstract: bool,
}

impl EventModel {
    #[must_use]
    pub fn label(&self) -> String {
        format!("{}.{}", self.namespace, self.name)
    }

    /// Reserved columns in storage order.
    #[must_use]
    pub fn framework_columns(&self) -> Vec<Column> {
        let mut columns = vec![
            Column::new("pgh_id", ColumnKind::Auto).primary_key(),
            Column::new("pgh_created_at", ColumnKind::DateTime),
            Column::new("pgh_label", ColumnKind::Text),
            Column::new("pgh_operation", ColumnKind::SmallInteger).nullable(),
        ];
        if self.previous_id {
            columns.push(Column::new("pgh_previous_id", ColumnKind::BigInteger).nullable());
        }
        if let Some(obj) = &self.obj_field {
            columns.push(obj.clone());
        }
        match &self.context {
            ContextStorage::None => {}
            ContextStorage::ForeignKey { column } => columns.push(column.clone()),
            ContextStorage::Json { column, id_column } => {
                columns.push(column.clone());
                columns.extend(id_column.iter().cloned());
            }
        }
        columns
    }

    /// Every column of the event table.
    #[must_use]
    pub fn storage_columns(&self) -> Vec<Column> {
        let mut columns = self.framework_columns();
        columns.extend(self.base.columns.iter().cloned());
        columns.extend(self.columns.iter().filter(|c| c.concrete).cloned());
        columns
    }

    /// The event model as a schema entity.
    #[must_use]
    pub fn storage_entity(&self) -> Entity {
        Entity {
            namespace: self.namespace.clone(),
            name: self.name.clone(),
            table: Some(self.table.clone()),
            columns: self.storage_columns(),
            proxy: false,
        }
    }

    #[must_use]
    pub fn column(&self, name: &str) -> Option<&Column> {
        self.columns.iter().find(|column| column.name == name)
    }

    /// True when the object reference points at `entity`.
    #[must_use]
    pub fn tracks(&self, entity: &str) -> bool {
        self.obj_field
            .as_ref()
            .and_then(|column| column.kind.related_entity())
            .is_some_and(|target| target == entity)
    }

    /// True when any relation column of the event table points at `entity`.
    #[must_use]
    pub fn references(&self, entity: &str) -> bool {
        self.storage_columns()
            .iter()
            .filter_map(|column| column.kind.related_entity())
            .any(|target| target == entity)
    }

    #[must_use]
    pub fn uses_context_table(&self) -> bool {
        matches!(self.context, ContextStorage::ForeignKey { .. })
    }

    /// Whether every non-reserved field of `tracked` is captured, so an event
    /// can be written back over the tracked row.
    #[must_use]
    pub fn can_revert(&self, tracked: &Entity) -> bool {
        tracked
            .concrete_columns()
            .filter(|column| !is_framework_owned(&column.name))
            .all(|column| self.column(&column.name).is_some_and(|c| c.concrete))
    }
}

/// Converts `snake_case`, `kebab-case` or dotted names to `PascalCase`.
///
/// One leading separator is dropped; separators followed by a lowercase
/// letter are folded into the capital.
#[must_use]
pub fn pascal_case(value: &str) -> String {
    let trimmed = value
        .strip_prefix(|ch: char| matches!(ch, '-' | '_' | '.'))
        .unwrap_or(value);
    let chars: Vec<char> = trimmed.chars().collect();
    let mut out = String::with_capacity(chars.len());
    let mut idx = 0;
    while idx < chars.len() {
        let ch = chars[idx];
        if idx == 0 {
            out.extend(ch.to_uppercase());
        } else if is_separator(ch) && chars.get(idx + 1).is_some_and(char::is_ascii_lowercase) {
            out.push(chars[idx + 1].to_ascii_uppercase());
            idx += 1;
        } else {
            out.push(ch);
        }
        idx += 1;
    }
    out
}

fn is_separator(ch: char) -> bool {
    matches!(ch, '-' | '_' | '.') || ch.is_whitespace()
}

/// `<Tracked>[<Fields>]<Base>`, e.g. `EventModelIntFieldDtFieldEvent`.
#[must_use]
pub fn default_model_name(
    tracked_name: &str,
    fields: Option<&[String]>,
    base_name: &str,
) -> String {
    let mut raw = tracked_name.to_string();
    if let Some(fields) = fields.filter(|fields| !fields.is_empty()) {
        raw.push('_');
        raw.push_str(&fields.join("_"));
    }
    raw.push('_');
    raw.push_str(&base_name.to_lowercase());
    pascal_case(&raw)
}

/// Reverse accessor name of the object reference.
#[must_use]
pub fn default_related_name(fields: Option<&[String]>, base_name: &str) -> String {
    let base = base_name.to_lowercase();
    match fields.filter(|fields| !fields.is_empty()) {
        Some(fields) => format!("{}_{base}", fields.join("_")),
        None => base,
    }
}

/// The shared context entity, registered by every builder.
#[must_use]
pub fn context_entity() -> Entity {
    Entity::new(CONTEXT_NAMESPACE, "Context")
        .with_table(CONTEXT_TABLE)
        .with_column(Column::new("id", ColumnKind::Uuid).primary_key())
        .with_column(Column::new("created_at", ColumnKind::DateTime))
        .with_column(Column::new("updated_at", ColumnKind::DateTime))
        .with_column(Column::new("metadata", ColumnKind::Json))
}
