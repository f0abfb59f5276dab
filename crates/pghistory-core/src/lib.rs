//! Trigger-driven row history for relational entities.
//!
//! Entities are declared in a [`SchemaRegistry`], tracked through a
//! [`HistoryBuilder`], and frozen into a [`History`] that renders install
//! SQL for Postgres or SQLite and prepares manual events.

pub mod condition;
pub mod config;
pub mod context;
pub mod ddl;
pub mod declare;
pub mod derive;
pub mod history;
pub mod model;
pub mod query;
pub mod registry;
pub mod schema;
pub mod sql;
pub mod tracker;
pub mod trigger;

pub use condition::{CompareOp, Condition, Predicate, RowImage};
pub use config::HistoryConfig;
pub use context::{ContextFrame, ContextGuard, ContextId};
pub use declare::{Declaration, TrackingDeclaration};
pub use history::{EntityRow, EventRecord, History, HistoryBuilder, PreparedEvent};
pub use model::{
    BaseModel, ContextField, ContextIdField, ContextStorage, EventModel, EventModelOptions,
    ObjField, ProxyField, Setting,
};
pub use registry::{EventModelFilter, RegistryKey, TrackerRegistry};
pub use schema::{
    Column, ColumnCategory, ColumnKind, ColumnOption, ColumnOptions, Entity, Namespace, OnDelete,
    SchemaRegistry,
};
pub use sql::{Dialect, Literal};
pub use tracker::{Operation, OperationSet, Tracker, TrackerKind, When};
pub use trigger::{InstallPlan, TriggerDefinition, TriggerInstaller};

/// Prefix reserved for every column the history engine owns.
pub const FRAMEWORK_PREFIX: &str = "pgh_";
/// Field name of the optional back-pointer from a tracked row to its latest event.
pub const BACK_POINTER_FIELD: &str = "pgh_last_event";
/// Physical column of the back-pointer.
pub const BACK_POINTER_COLUMN: &str = "pgh_last_event_id";
/// Shared context table written by the attach step.
pub const CONTEXT_TABLE: &str = "pgh_context";
/// Tracker type used by manual events when none is given.
pub const MANUAL_TRACKER_TYPE: &str = "manual_tracker";

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum HistoryError {
    #[error("validation error: {0}")]
    Validation(String),
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("unknown field \"{field}\" on {entity}")]
    UnknownField { entity: String, field: String },
    #[error("unknown entity \"{0}\"")]
    UnknownEntity(String),
    #[error("namespace \"{0}\" is invalid")]
    InvalidNamespace(String),
    #[error("cannot create event model under third party namespace \"{0}\"")]
    ForeignNamespace(String),
    #[error("namespace \"{namespace}\" already has a model named \"{name}\"")]
    NameCollision { namespace: String, name: String },
    #[error("base model \"{0}\" does not derive from the event base")]
    InvalidBaseModel(String),
    #[error("tracker \"{label}\" ({tracker_type}) is already registered for {entity}")]
    DuplicateTracker {
        entity: String,
        label: String,
        tracker_type: String,
    },
    #[error("\"{label}\" is not a registered tracker label of type \"{tracker_type}\" for {entity}")]
    NotRegistered {
        entity: String,
        label: String,
        tracker_type: String,
    },
    #[error("{entity} has more than one event model; pass a label to pick one")]
    AmbiguousEventModel { entity: String },
    #[error("trigger \"{0}\" is already installed")]
    DuplicateTrigger(String),
    #[error("event model {0} does not capture every field of its tracked entity")]
    CannotRevert(String),
}

/// Returns true when `name` lives in the engine's reserved column namespace.
#[must_use]
pub fn is_framework_owned(name: &str) -> bool {
    name.starts_with(FRAMEWORK_PREFIX)
}
