use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::{HistoryError, BACK_POINTER_COLUMN};

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ColumnKind {
    Auto,
    BigAuto,
    SmallAuto,
    Integer,
    BigInteger,
    SmallInteger,
    Boolean,
    Text,
    Char { max_length: u32 },
    Float,
    Decimal { precision: u32, scale: u32 },
    DateTime,
    Date,
    Uuid,
    Json,
    Binary,
    File,
    ForeignKey { to: String },
    OneToOne { to: String },
}

impl ColumnKind {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Auto => "auto",
            Self::BigAuto => "big_auto",
            Self::SmallAuto => "small_auto",
            Self::Integer => "integer",
            Self::BigInteger => "big_integer",
            Self::SmallInteger => "small_integer",
            Self::Boolean => "boolean",
            Self::Text => "text",
            Self::Char { .. } => "char",
            Self::Float => "float",
            Self::Decimal { .. } => "decimal",
            Self::DateTime => "date_time",
            Self::Date => "date",
            Self::Uuid => "uuid",
            Self::Json => "json",
            Self::Binary => "binary",
            Self::File => "file",
            Self::ForeignKey { .. } => "foreign_key",
            Self::OneToOne { .. } => "one_to_one",
        }
    }

    #[must_use]
    pub fn is_auto(&self) -> bool {
        matches!(self, Self::Auto | Self::BigAuto | Self::SmallAuto)
    }

    #[must_use]
    pub fn is_relation(&self) -> bool {
        matches!(self, Self::ForeignKey { .. } | Self::OneToOne { .. })
    }

    /// Entity label a relation column points at.
    #[must_use]
    pub fn related_entity(&self) -> Option<&str> {
        match self {
            Self::ForeignKey { to } | Self::OneToOne { to } => Some(to),
            _ => None,
        }
    }

    /// Every category this kind belongs to, from most general to most specific.
    ///
    /// A one-to-one relation is also a foreign key, and every kind is a field.
    #[must_use]
    pub fn categories(&self) -> Vec<ColumnCategory> {
        let mut categories = vec![ColumnCategory::Field];
        match self {
            Self::Auto | Self::BigAuto | Self::SmallAuto => categories.push(ColumnCategory::Auto),
            Self::File => categories.push(ColumnCategory::File),
            Self::Json => categories.push(ColumnCategory::Json),
            Self::ForeignKey { .. } => {
                categories.extend([ColumnCategory::Related, ColumnCategory::ForeignKey]);
            }
            Self::OneToOne { .. } => categories.extend([
                ColumnCategory::Related,
                ColumnCategory::ForeignKey,
                ColumnCategory::OneToOne,
            ]),
            _ => {}
        }
        categories
    }
}

/// Column families used to key option-removal rules.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ColumnCategory {
    Field,
    Auto,
    File,
    Json,
    Related,
    ForeignKey,
    OneToOne,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum OnDelete {
    Cascade,
    Protect,
    Restrict,
    SetNull,
    DoNothing,
}

impl OnDelete {
    /// Referential action clause, or `None` when the database should not act.
    #[must_use]
    pub fn as_sql(self) -> Option<&'static str> {
        match self {
            Self::Cascade => Some("CASCADE"),
            Self::Protect | Self::Restrict => Some("RESTRICT"),
            Self::SetNull => Some("SET NULL"),
            Self::DoNothing => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ColumnOption {
    Null,
    PrimaryKey,
    Unique,
    DbIndex,
    DbConstraint,
    OnDelete,
    RelatedName,
}

/// Column options. `None` means "not set" so overlays can tell an explicit
/// `false` apart from an inherited default.
#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(default)]
pub struct ColumnOptions {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub null: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub primary_key: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub unique: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub db_index: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub db_constraint: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub on_delete: Option<OnDelete>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub related_name: Option<String>,
}

impl ColumnOptions {
    /// Copies every option `other` sets over `self`.
    pub fn overlay(&mut self, other: &Self) {
        if other.null.is_some() {
            self.null = other.null;
        }
        if other.primary_key.is_some() {
            self.primary_key = other.primary_key;
        }
        if other.unique.is_some() {
            self.unique = other.unique;
        }
        if other.db_index.is_some() {
            self.db_index = other.db_index;
        }
        if other.db_constraint.is_some() {
            self.db_constraint = other.db_constraint;
        }
        if other.on_delete.is_some() {
            self.on_delete = other.on_delete;
        }
        if other.related_name.is_some() {
            self.related_name.clone_from(&other.related_name);
        }
    }

    /// Resets one option to its default.
    pub fn remove(&mut self, option: ColumnOption) {
        match option {
            ColumnOption::Null => self.null = None,
            ColumnOption::PrimaryKey => self.primary_key = None,
            ColumnOption::Unique => self.unique = None,
            ColumnOption::DbIndex => self.db_index = None,
            ColumnOption::DbConstraint => self.db_constraint = None,
            ColumnOption::OnDelete => self.on_delete = None,
            ColumnOption::RelatedName => self.related_name = None,
        }
    }

    #[must_use]
    pub fn is_null(&self) -> bool {
        self.null.unwrap_or(false)
    }

    #[must_use]
    pub fn is_primary_key(&self) -> bool {
        self.primary_key.unwrap_or(false)
    }

    #[must_use]
    pub fn is_unique(&self) -> bool {
        self.unique.unwrap_or(false)
    }

    #[must_use]
    pub fn has_db_constraint(&self) -> bool {
        self.db_constraint.unwrap_or(true)
    }

    #[must_use]
    pub fn on_delete(&self) -> OnDelete {
        self.on_delete.unwrap_or(OnDelete::Cascade)
    }
}

fn default_concrete() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct Column {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub db_column: Option<String>,
    pub kind: ColumnKind,
    #[serde(default)]
    pub options: ColumnOptions,
    #[serde(default = "default_concrete")]
    pub concrete: bool,
    /// Settings key naming a substitutable relation target.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub swappable: Option<String>,
}

impl Column {
    #[must_use]
    pub fn new(name: impl Into<String>, kind: ColumnKind) -> Self {
        Self {
            name: name.into(),
            db_column: None,
            kind,
            options: ColumnOptions::default(),
            concrete: true,
            swappable: None,
        }
    }

    #[must_use]
    pub fn with_options(mut self, options: ColumnOptions) -> Self {
        self.options = options;
        self
    }

    #[must_use]
    pub fn primary_key(mut self) -> Self {
        self.options.primary_key = Some(true);
        self
    }

    #[must_use]
    pub fn nullable(mut self) -> Self {
        self.options.null = Some(true);
        self
    }

    #[must_use]
    pub fn db_column(mut self, column: impl Into<String>) -> Self {
        self.db_column = Some(column.into());
        self
    }

    /// Marks the column as having no storage of its own.
    #[must_use]
    pub fn non_concrete(mut self) -> Self {
        self.concrete = false;
        self
    }

    /// Physical column name. Relations store `<name>_id` unless overridden.
    #[must_use]
    pub fn column(&self) -> String {
        match &self.db_column {
            Some(column) => column.clone(),
            None if self.kind.is_relation() => format!("{}_id", self.name),
            None => self.name.clone(),
        }
    }

    #[must_use]
    pub fn is_back_pointer(&self) -> bool {
        self.column() == BACK_POINTER_COLUMN
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct Namespace {
    pub label: String,
    /// Third-party namespaces cannot host generated event models.
    #[serde(default)]
    pub third_party: bool,
}

impl Namespace {
    #[must_use]
    pub fn owned(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            third_party: false,
        }
    }

    #[must_use]
    pub fn third_party(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            third_party: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct Entity {
    pub namespace: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub table: Option<String>,
    #[serde(default)]
    pub columns: Vec<Column>,
    /// Proxies share storage with another entity and never get a back-pointer.
    #[serde(default)]
    pub proxy: bool,
}

impl Entity {
    #[must_use]
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
            table: None,
            columns: Vec::new(),
            proxy: false,
        }
    }

    #[must_use]
    pub fn with_table(mut self, table: impl Into<String>) -> Self {
        self.table = Some(table.into());
        self
    }

    #[must_use]
    pub fn with_column(mut self, column: Column) -> Self {
        self.columns.push(column);
        self
    }

    /// `namespace.Name`, the identity used across registries.
    #[must_use]
    pub fn label(&self) -> String {
        format!("{}.{}", self.namespace, self.name)
    }

    /// Storage table, `<namespace>_<lowercase name>` unless overridden.
    #[must_use]
    pub fn table(&self) -> String {
        match &self.table {
            Some(table) => table.clone(),
            None => format!("{}_{}", self.namespace, self.name.to_lowercase()),
        }
    }

    #[must_use]
    pub fn column(&self, name: &str) -> Option<&Column> {
        self.columns.iter().find(|column| column.name == name)
    }

    /// # Errors
    /// Returns [`HistoryError::UnknownField`] when the entity has no such field.
    pub fn require_column(&self, name: &str) -> Result<&Column, HistoryError> {
        self.column(name).ok_or_else(|| HistoryError::UnknownField {
            entity: self.label(),
            field: name.to_string(),
        })
    }

    #[must_use]
    pub fn primary_key(&self) -> Option<&Column> {
        self.columns
            .iter()
            .find(|column| column.options.is_primary_key())
    }

    #[must_use]
    pub fn back_pointer(&self) -> Option<&Column> {
        self.columns.iter().find(|column| column.is_back_pointer())
    }

    pub fn concrete_columns(&self) -> impl Iterator<Item = &Column> {
        self.columns.iter().filter(|column| column.concrete)
    }
}

/// Namespaces and entities known to the history engine.
#[derive(Debug, Clone, Default)]
pub struct SchemaRegistry {
    namespaces: BTreeMap<String, Namespace>,
    entities: BTreeMap<String, Entity>,
}

impl SchemaRegistry {
    pub fn add_namespace(&mut self, namespace: Namespace) {
        self.namespaces.insert(namespace.label.clone(), namespace);
    }

    #[must_use]
    pub fn namespace(&self, label: &str) -> Option<&Namespace> {
        self.namespaces.get(label)
    }

    /// Registers an entity under an existing namespace.
    ///
    /// # Errors
    /// Returns [`HistoryError::InvalidNamespace`] for unknown namespaces and
    /// [`HistoryError::NameCollision`] when the name is taken.
    pub fn define(&mut self, entity: Entity) -> Result<(), HistoryError> {
        if !self.namespaces.contains_key(&entity.namespace) {
            return Err(HistoryError::InvalidNamespace(entity.namespace));
        }
        let label = entity.label();
        if self.entities.contains_key(&label) {
            return Err(HistoryError::NameCollision {
                namespace: entity.namespace,
                name: entity.name,
            });
        }
        self.entities.insert(label, entity);
        Ok(())
    }

    #[must_use]
    pub fn contains(&self, namespace: &str, name: &str) -> bool {
        self.entities.contains_key(&format!("{namespace}.{name}"))
    }

    /// # Errors
    /// Returns [`HistoryError::UnknownEntity`] when nothing is registered under `label`.
    pub fn entity(&self, label: &str) -> Result<&Entity, HistoryError> {
        self.entities
            .get(label)
            .ok_or_else(|| HistoryError::UnknownEntity(label.to_string()))
    }

    /// # Errors
    /// Returns [`HistoryError::UnknownEntity`] when nothing is registered under `label`.
    pub fn entity_mut(&mut self, label: &str) -> Result<&mut Entity, HistoryError> {
        self.entities
            .get_mut(label)
            .ok_or_else(|| HistoryError::UnknownEntity(label.to_string()))
    }

    pub fn entities(&self) -> impl Iterator<Item = &Entity> {
        self.entities.values()
    }

    /// Physical type of the primary key `kind` points at, used for relation columns.
    #[must_use]
    pub fn relation_target_kind(&self, kind: &ColumnKind) -> ColumnKind {
        kind.related_entity()
            .and_then(|label| self.entities.get(label))
            .and_then(Entity::primary_key)
            .map_or(ColumnKind::Integer, |pk| match &pk.kind {
                ColumnKind::Auto => ColumnKind::Integer,
                ColumnKind::BigAuto => ColumnKind::BigInteger,
                ColumnKind::SmallAuto => ColumnKind::SmallInteger,
                other if other.is_relation() => ColumnKind::Integer,
                other => other.clone(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn relation_columns_store_id_suffix() {
        let fk = Column::new(
            "user",
            ColumnKind::ForeignKey {
                to: "auth.User".to_string(),
            },
        );
        assert_eq!(fk.column(), "user_id");
        assert_eq!(fk.clone().db_column("owner").column(), "owner");
        assert_eq!(Column::new("name", ColumnKind::Text).column(), "name");
    }

    #[test]
    fn overlay_keeps_unset_options_and_remove_restores_default() {
        let mut options = ColumnOptions {
            null: Some(true),
            unique: Some(true),
            ..ColumnOptions::default()
        };
        options.overlay(&ColumnOptions {
            unique: Some(false),
            db_index: Some(true),
            ..ColumnOptions::default()
        });
        assert!(options.is_null());
        assert!(!options.is_unique());
        assert_eq!(options.db_index, Some(true));

        options.remove(ColumnOption::Null);
        assert!(!options.is_null());
        assert!(options.has_db_constraint());
    }

    #[test]
    fn one_to_one_counts_as_foreign_key() {
        let kind = ColumnKind::OneToOne {
            to: "tests.Other".to_string(),
        };
        let categories = kind.categories();
        assert!(categories.contains(&ColumnCategory::ForeignKey));
        assert!(categories.contains(&ColumnCategory::Related));
        assert!(categories.contains(&ColumnCategory::Field));
        assert!(!ColumnKind::Text
            .categories()
            .contains(&ColumnCategory::Related));
    }

    #[test]
    fn define_requires_known_namespace_and_unique_name() {
        let mut schema = SchemaRegistry::default();
        assert_eq!(
            schema.define(Entity::new("tests", "Model")),
            Err(HistoryError::InvalidNamespace("tests".to_string()))
        );

        schema.add_namespace(Namespace::owned("tests"));
        assert_eq!(schema.define(Entity::new("tests", "Model")), Ok(()));
        assert!(matches!(
            schema.define(Entity::new("tests", "Model")),
            Err(HistoryError::NameCollision { .. })
        ));
        assert_eq!(
            schema
                .entity("tests.Model")
                .map(Entity::table)
                .unwrap_or_default(),
            "tests_model"
        );
    }

    #[test]
    fn relation_target_kind_follows_primary_key() {
        let mut schema = SchemaRegistry::default();
        schema.add_namespace(Namespace::owned("tests"));
        let entity = Entity::new("tests", "Target")
            .with_column(Column::new("id", ColumnKind::Uuid).primary_key());
        assert_eq!(schema.define(entity), Ok(()));

        let fk = ColumnKind::ForeignKey {
            to: "tests.Target".to_string(),
        };
        assert_eq!(schema.relation_target_kind(&fk), ColumnKind::Uuid);

        let dangling = ColumnKind::ForeignKey {
            to: "tests.Missing".to_string(),
        };
        assert_eq!(schema.relation_target_kind(&dangling), ColumnKind::Integer);
    }
}
