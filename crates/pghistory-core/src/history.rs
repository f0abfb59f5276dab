//! Declaring tracked entities and the frozen history they produce.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use time::OffsetDateTime;

use crate::config::{ContextStorageKind, HistoryConfig};
use crate::derive::derive_columns;
use crate::model::{
    context_entity, default_model_name, default_related_name, ContextField, ContextStorage,
    EventModel, EventModelOptions, Setting, CONTEXT_ENTITY,
};
use crate::registry::{EventModelFilter, TrackerRegistry};
use crate::schema::{Column, ColumnKind, ColumnOptions, Namespace, OnDelete, SchemaRegistry};
use crate::sql::{Dialect, Expr, InsertStatement, Returning};
use crate::tracker::{Operation, Tracker};
use crate::trigger::InstallPlan;
use crate::{is_framework_owned, HistoryError, BACK_POINTER_FIELD, MANUAL_TRACKER_TYPE};

/// Collects entities, event models and trackers during startup.
#[derive(Debug, Clone)]
pub struct HistoryBuilder {
    config: HistoryConfig,
    schema: SchemaRegistry,
    registry: TrackerRegistry,
    plan: InstallPlan,
    models: Vec<Arc<EventModel>>,
}

impl HistoryBuilder {
    /// # Errors
    /// See [`HistoryBuilder::with_schema`].
    pub fn new(config: HistoryConfig) -> Result<Self, HistoryError> {
        Self::with_schema(config, SchemaRegistry::default())
    }

    /// Starts from `schema`, defining the shared context entity when the
    /// schema does not carry it yet.
    ///
    /// # Errors
    /// Returns the [`HistoryError`] raised while defining the context entity.
    pub fn with_schema(
        config: HistoryConfig,
        mut schema: SchemaRegistry,
    ) -> Result<Self, HistoryError> {
        if schema.entity(CONTEXT_ENTITY).is_err() {
            let context = context_entity();
            schema.add_namespace(Namespace::third_party(context.namespace.clone()));
            schema.define(context)?;
        }
        Ok(Self {
            config,
            schema,
            registry: TrackerRegistry::default(),
            plan: InstallPlan::default(),
            models: Vec::new(),
        })
    }

    #[must_use]
    pub fn config(&self) -> &HistoryConfig {
        &self.config
    }

    #[must_use]
    pub fn schema(&self) -> &SchemaRegistry {
        &self.schema
    }

    pub fn schema_mut(&mut self) -> &mut SchemaRegistry {
        &mut self.schema
    }

    /// Derives an event model for `tracked` and attaches `trackers` to it.
    ///
    /// Abstract models are returned without being registered; pass them to
    /// [`HistoryBuilder::register_event_model`] once customised.
    ///
    /// # Errors
    /// Returns [`HistoryError`] for unknown entities or fields, invalid or
    /// foreign namespaces, name collisions, a base model that does not derive
    /// from the event base, and duplicate tracker registrations.
    pub fn create_event_model(
        &mut self,
        tracked: &str,
        trackers: Vec<Tracker>,
        options: EventModelOptions,
    ) -> Result<Arc<EventModel>, HistoryError> {
        let base = options.base_model.clone().unwrap_or_default();
        if !base.derives_event {
            return Err(HistoryError::InvalidBaseModel(base.name));
        }
        let tracked = self.schema.entity(tracked)?.clone();
        let fields = options.fields.as_deref();
        let mut exclude = options.exclude.clone();
        if let Some(pointer) = tracked.back_pointer() {
            if !exclude.contains(&pointer.name) {
                exclude.push(pointer.name.clone());
            }
        }

        let obj_field = match &options.obj_field {
            Setting::Disabled => None,
            setting => {
                let mut column_options = self.config.obj_field.clone();
                if let Setting::Custom(custom) = setting {
                    column_options.overlay(&custom.options);
                }
                if column_options.related_name.is_none() {
                    column_options.related_name = Some(
                        options
                            .related_name
                            .clone()
                            .unwrap_or_else(|| default_related_name(fields, &base.name)),
                    );
                }
                Some(
                    Column::new("pgh_obj", ColumnKind::ForeignKey { to: tracked.label() })
                        .with_options(column_options),
                )
            }
        };

        let context = self.resolve_context(&options)?;

        let name = options
            .model_name
            .clone()
            .unwrap_or_else(|| default_model_name(&tracked.name, fields, &base.name));
        let namespace = options
            .namespace
            .clone()
            .unwrap_or_else(|| tracked.namespace.clone());
        self.validate_model_path(&namespace, &name, options.abstract_model)?;

        let columns = derive_columns(&tracked, fields, &exclude, &self.config)?;
        for proxy in &options.proxy_fields {
            proxy.keys()?;
        }

        let model = EventModel {
            table: format!("{namespace}_{}", name.to_lowercase()),
            namespace,
            name,
            tracked: tracked.label(),
            base,
            columns,
            obj_field,
            context,
            previous_id: tracked.back_pointer().is_some(),
            trackers,
            proxy_fields: options.proxy_fields,
            attrs: options.attrs,
            meta: options.meta,
            append_only: options.append_only.unwrap_or(self.config.append_only),
            is_abstract: options.abstract_model,
        };

        if model.is_abstract {
            return Ok(Arc::new(model));
        }
        self.register_event_model(model)
    }

    /// Registers a concrete event model and attaches its trackers.
    ///
    /// # Errors
    /// Returns [`HistoryError`] when the model is abstract, its name is taken,
    /// or a tracker fails to register or plan its triggers.
    pub fn register_event_model(
        &mut self,
        mut model: EventModel,
    ) -> Result<Arc<EventModel>, HistoryError> {
        model.is_abstract = false;
        self.validate_model_path(&model.namespace, &model.name, false)?;
        let tracked = self.schema.entity(&model.tracked)?.clone();
        for proxy in &model.proxy_fields {
            proxy.keys()?;
        }
        for tracker in &model.trackers {
            tracker.validate(&model)?;
            let (label, tracker_type) = (tracker.label(), tracker.type_name());
            if self.registry.contains(&tracked.label(), &label, &tracker_type) {
                return Err(HistoryError::DuplicateTracker {
                    entity: tracked.label(),
                    label,
                    tracker_type,
                });
            }
        }

        self.schema.define(model.storage_entity())?;
        let model = Arc::new(model);
        for tracker in &model.trackers {
            tracker.attach(&model, &tracked, &mut self.registry, &mut self.plan)?;
        }
        tracing::debug!(
            model = %model.label(),
            tracked = %model.tracked,
            trackers = model.trackers.len(),
            "event model registered"
        );
        self.models.push(Arc::clone(&model));
        Ok(model)
    }

    /// Tracks `entity`: adds the back-pointer column unless the entity is a
    /// proxy or already has one, then creates a concrete event model that
    /// never snapshots the pointer.
    ///
    /// # Errors
    /// Same as [`HistoryBuilder::create_event_model`].
    pub fn track(
        &mut self,
        entity: &str,
        trackers: Vec<Tracker>,
        mut options: EventModelOptions,
    ) -> Result<Arc<EventModel>, HistoryError> {
        let (proxy, has_pointer, tracked_namespace, tracked_name) = {
            let tracked = self.schema.entity(entity)?;
            (
                tracked.proxy,
                tracked.back_pointer().is_some(),
                tracked.namespace.clone(),
                tracked.name.clone(),
            )
        };

        let add_pointer = !has_pointer && !proxy;
        if add_pointer {
            let base = options.base_model.clone().unwrap_or_default();
            let name = options.model_name.clone().unwrap_or_else(|| {
                default_model_name(&tracked_name, options.fields.as_deref(), &base.name)
            });
            let namespace = options.namespace.clone().unwrap_or(tracked_namespace);
            let column = Column::new(
                BACK_POINTER_FIELD,
                ColumnKind::ForeignKey {
                    to: format!("{namespace}.{name}"),
                },
            )
            .with_options(ColumnOptions {
                null: Some(true),
                db_constraint: Some(false),
                on_delete: Some(OnDelete::SetNull),
                related_name: Some("+".to_string()),
                ..ColumnOptions::default()
            });
            self.schema.entity_mut(entity)?.columns.push(column);
            tracing::debug!(entity, "back-pointer column added");
        }
        options.abstract_model = false;
        let created = self.create_event_model(entity, trackers, options);
        if created.is_err() && add_pointer {
            self.schema
                .entity_mut(entity)?
                .columns
                .retain(|column| column.name != BACK_POINTER_FIELD);
        }
        created
    }

    fn resolve_context(&self, options: &EventModelOptions) -> Result<ContextStorage, HistoryError> {
        let field = match &options.context_field {
            Setting::Disabled => return Ok(ContextStorage::None),
            Setting::Default => match self.config.context_field {
                ContextStorageKind::ForeignKey => ContextField::ForeignKey {
                    options: ColumnOptions::default(),
                },
                ContextStorageKind::Json => ContextField::Json {
                    options: ColumnOptions::default(),
                },
            },
            Setting::Custom(field) => field.clone(),
        };
        let mut column_options = self.config.context_field_options.clone();

        Ok(match field {
            ContextField::ForeignKey { options: custom } => {
                if matches!(options.context_id_field, Setting::Custom(_)) {
                    return Err(HistoryError::Configuration(
                        "a context id field needs json context storage".to_string(),
                    ));
                }
                column_options.overlay(&custom);
                column_options.related_name.get_or_insert_with(|| "+".to_string());
                ContextStorage::ForeignKey {
                    column: Column::new(
                        "pgh_context",
                        ColumnKind::ForeignKey {
                            to: CONTEXT_ENTITY.to_string(),
                        },
                    )
                    .with_options(column_options),
                }
            }
            ContextField::Json { options: custom } => {
                column_options.overlay(&custom);
                column_options.db_constraint = None;
                column_options.on_delete = None;
                let id_column = match &options.context_id_field {
                    Setting::Disabled => None,
                    Setting::Default if !self.config.context_id_field => None,
                    setting => {
                        let mut id_options = self.config.context_id_field_options.clone();
                        if let Setting::Custom(custom) = setting {
                            id_options.overlay(&custom.options);
                        }
                        Some(
                            Column::new("pgh_context_id", ColumnKind::Uuid)
                                .with_options(id_options),
                        )
                    }
                };
                ContextStorage::Json {
                    column: Column::new("pgh_context", ColumnKind::Json)
                        .with_options(column_options),
                    id_column,
                }
            }
        })
    }

    fn validate_model_path(
        &self,
        namespace: &str,
        name: &str,
        is_abstract: bool,
    ) -> Result<(), HistoryError> {
        let Some(found) = self.schema.namespace(namespace) else {
            return Err(HistoryError::InvalidNamespace(namespace.to_string()));
        };
        if !is_abstract && self.schema.contains(namespace, name) {
            return Err(HistoryError::NameCollision {
                namespace: namespace.to_string(),
                name: name.to_string(),
            });
        }
        if found.third_party {
            return Err(HistoryError::ForeignNamespace(namespace.to_string()));
        }
        Ok(())
    }

    /// Freezes the declarations.
    #[must_use]
    pub fn finish(self) -> History {
        tracing::info!(
            models = self.models.len(),
            trackers = self.registry.len(),
            triggers = self.plan.triggers().len(),
            "history declarations frozen"
        );
        History {
            config: Arc::new(self.config),
            schema: Arc::new(self.schema),
            registry: Arc::new(self.registry),
            plan: Arc::new(self.plan),
            models: self.models,
        }
    }
}

/// Read-only result of a [`HistoryBuilder`]. Cheap to clone and safe to share
/// between threads.
#[derive(Debug, Clone)]
pub struct History {
    config: Arc<HistoryConfig>,
    schema: Arc<SchemaRegistry>,
    registry: Arc<TrackerRegistry>,
    plan: Arc<InstallPlan>,
    models: Vec<Arc<EventModel>>,
}

impl History {
    #[must_use]
    pub fn config(&self) -> &HistoryConfig {
        &self.config
    }

    #[must_use]
    pub fn schema(&self) -> &SchemaRegistry {
        &self.schema
    }

    #[must_use]
    pub fn registry(&self) -> &TrackerRegistry {
        &self.registry
    }

    #[must_use]
    pub fn plan(&self) -> &InstallPlan {
        &self.plan
    }

    #[must_use]
    pub fn models(&self) -> &[Arc<EventModel>] {
        &self.models
    }

    /// # Errors
    /// Returns [`HistoryError::UnknownEntity`] when no event model has this label.
    pub fn event_model(&self, label: &str) -> Result<&Arc<EventModel>, HistoryError> {
        self.models
            .iter()
            .find(|model| model.label() == label)
            .ok_or_else(|| HistoryError::UnknownEntity(label.to_string()))
    }

    #[must_use]
    pub fn event_models(&self, filter: &EventModelFilter) -> Vec<Arc<EventModel>> {
        self.models
            .iter()
            .filter(|model| filter.matches(model))
            .cloned()
            .collect()
    }

    #[must_use]
    pub fn event_models_for(&self, entity: &str) -> BTreeMap<String, Arc<EventModel>> {
        self.registry.models_for(entity)
    }

    /// # Errors
    /// See [`TrackerRegistry::model_for`].
    pub fn event_model_for(
        &self,
        entity: &str,
        label: Option<&str>,
    ) -> Result<Arc<EventModel>, HistoryError> {
        self.registry.model_for(entity, label)
    }

    #[must_use]
    pub fn uses_context_table(&self) -> bool {
        self.models.iter().any(|model| model.uses_context_table())
    }

    /// Builds the insert for a manual event from an entity row.
    ///
    /// Snapshot fields are bound as parameters in column order; the context
    /// column reuses the trigger expression so manual and trigger events
    /// attach context the same way.
    ///
    /// # Errors
    /// Returns [`HistoryError::NotRegistered`] when no tracker matches,
    /// [`HistoryError::Validation`] when the row lacks a snapshot field, or
    /// [`HistoryError::Configuration`] when the tracked entity has no primary
    /// key for the object reference.
    pub fn prepare_event(
        &self,
        row: &EntityRow,
        label: &str,
        tracker_type: Option<&str>,
        dialect: Dialect,
    ) -> Result<PreparedEvent, HistoryError> {
        let tracker_type = tracker_type.unwrap_or(MANUAL_TRACKER_TYPE);
        let model = Arc::clone(self.registry.get(&row.entity, label, tracker_type)?);
        let tracked = self.schema.entity(&row.entity)?;

        let mut values: BTreeMap<String, Value> = BTreeMap::new();
        for column in model.columns.iter().filter(|column| column.concrete) {
            if is_framework_owned(&column.name) {
                continue;
            }
            let value = row.values.get(&column.name).cloned().ok_or_else(|| {
                HistoryError::Validation(format!(
                    "row of {} has no value for field \"{}\"",
                    row.entity, column.name
                ))
            })?;
            values.insert(column.column(), value);
        }
        values.insert("pgh_label".to_string(), Value::String(label.to_string()));

        if let Some(obj) = &model.obj_field {
            let pk = tracked.primary_key().ok_or_else(|| {
                HistoryError::Configuration(format!("{} has no primary key", tracked.label()))
            })?;
            let value = row
                .values
                .get(&pk.name)
                .filter(|value| !value.is_null())
                .cloned()
                .ok_or_else(|| {
                    HistoryError::Validation(format!(
                        "row of {} has no value for primary key \"{}\"",
                        tracked.label(),
                        pk.name
                    ))
                })?;
            values.insert(obj.column(), value);
        }

        let mut insert = InsertStatement::new(model.table.clone());
        let mut params = Vec::with_capacity(values.len());
        for (column, value) in values {
            params.push(value);
            insert.set(column, Expr::Param(params.len()));
        }
        insert.set("pgh_created_at", Expr::Now);

        let extra_context = model
            .trackers
            .iter()
            .find(|tracker| tracker.label() == label && tracker.type_name() == tracker_type)
            .map(|tracker| tracker.extra_context.clone())
            .unwrap_or_default();
        match &model.context {
            ContextStorage::None => {}
            ContextStorage::ForeignKey { column } => {
                insert.set(column.column(), Expr::AttachContext);
            }
            ContextStorage::Json { column, id_column } => {
                insert.set(column.column(), Expr::ContextMetadata { extra: Map::new() });
                if let Some(id_column) = id_column {
                    insert.set(id_column.column(), Expr::ContextId);
                }
            }
        }
        insert.returning = Returning::All;

        tracing::debug!(model = %model.label(), label, tracker_type, "manual event prepared");
        Ok(PreparedEvent {
            attach_context: model.uses_context_table(),
            model,
            sql: insert.render(crate::sql::RenderScope::new(dialect)),
            params,
            extra_context,
        })
    }
}

/// In-memory values of one tracked row, keyed by field name.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct EntityRow {
    pub entity: String,
    pub values: BTreeMap<String, Value>,
}

impl EntityRow {
    #[must_use]
    pub fn new(entity: impl Into<String>) -> Self {
        Self {
            entity: entity.into(),
            values: BTreeMap::new(),
        }
    }

    #[must_use]
    pub fn with(mut self, field: impl Into<String>, value: Value) -> Self {
        self.values.insert(field.into(), value);
        self
    }
}

/// A manual event insert ready to execute.
#[derive(Debug, Clone)]
pub struct PreparedEvent {
    pub model: Arc<EventModel>,
    pub sql: String,
    pub params: Vec<Value>,
    /// Runs the context upsert before `sql` on SQLite.
    pub attach_context: bool,
    /// Tracker metadata to merge into the active context for this insert.
    pub extra_context: Map<String, Value>,
}

/// One stored event row.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EventRecord {
    pub model: String,
    pub pgh_id: i64,
    #[serde(with = "time::serde::rfc3339")]
    pub pgh_created_at: OffsetDateTime,
    pub pgh_label: String,
    pub pgh_operation: Option<Operation>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pgh_obj_id: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pgh_previous_id: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pgh_context_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pgh_context: Option<Value>,
    /// Snapshot values keyed by field name.
    pub data: BTreeMap<String, Value>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub proxies: BTreeMap<String, Value>,
}
