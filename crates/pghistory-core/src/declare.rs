//! Declarations loaded from a file: entities plus what to track on them.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::config::HistoryConfig;
use crate::history::{History, HistoryBuilder};
use crate::model::EventModelOptions;
use crate::schema::{Entity, Namespace, SchemaRegistry};
use crate::tracker::Tracker;
use crate::HistoryError;

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Declaration {
    pub namespaces: Vec<Namespace>,
    pub entities: Vec<Entity>,
    pub tracking: Vec<TrackingDeclaration>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TrackingDeclaration {
    pub entity: String,
    #[serde(default)]
    pub trackers: Vec<Tracker>,
    #[serde(default)]
    pub options: EventModelOptions,
    /// `track` (with a back-pointer) rather than a bare event model.
    #[serde(default = "default_track")]
    pub track: bool,
}

fn default_track() -> bool {
    true
}

impl Declaration {
    /// # Errors
    /// Returns [`HistoryError::Configuration`] when the JSON does not parse.
    pub fn from_json_str(raw: &str) -> Result<Self, HistoryError> {
        serde_json::from_str(raw)
            .map_err(|err| HistoryError::Configuration(format!("invalid declaration: {err}")))
    }

    /// # Errors
    /// Returns [`HistoryError::Configuration`] when the file cannot be read or parsed.
    pub fn load(path: &Path) -> Result<Self, HistoryError> {
        let raw = std::fs::read_to_string(path).map_err(|err| {
            HistoryError::Configuration(format!("failed to read {}: {err}", path.display()))
        })?;
        let declaration = Self::from_json_str(&raw)?;
        tracing::debug!(
            path = %path.display(),
            entities = declaration.entities.len(),
            tracking = declaration.tracking.len(),
            "declaration loaded"
        );
        Ok(declaration)
    }

    /// Defines the entities, applies the tracking entries in order and
    /// freezes the result.
    ///
    /// # Errors
    /// Returns the first [`HistoryError`] raised by a definition or tracker.
    pub fn build(&self, config: HistoryConfig) -> Result<History, HistoryError> {
        let mut schema = SchemaRegistry::default();
        for namespace in &self.namespaces {
            schema.add_namespace(namespace.clone());
        }
        for entity in &self.entities {
            schema.define(entity.clone())?;
        }
        let mut builder = HistoryBuilder::with_schema(config, schema)?;
        for entry in &self.tracking {
            if entry.track {
                builder.track(&entry.entity, entry.trackers.clone(), entry.options.clone())?;
            } else {
                builder.create_event_model(
                    &entry.entity,
                    entry.trackers.clone(),
                    entry.options.clone(),
                )?;
            }
        }
        Ok(builder.finish())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sql::Dialect;

    const DECLARATION: &str = r#"{
        "namespaces": [{"label": "blog"}],
        "entities": [{
            "namespace": "blog",
            "name": "Post",
            "columns": [
                {"name": "id", "kind": {"type": "auto"}, "options": {"primary_key": true}},
                {"name": "title", "kind": {"type": "char", "max_length": 200}},
                {"name": "body", "kind": {"type": "text"}, "options": {"null": true}}
            ]
        }],
        "tracking": [
            {
                "entity": "blog.Post",
                "trackers": [
                    {"kind": "snapshot", "label": "snapshot"},
                    {"kind": "manual", "label": "published"}
                ]
            },
            {
                "entity": "blog.Post",
                "track": false,
                "trackers": [{
                    "kind": "after_update",
                    "label": "retitled",
                    "condition": {"type": "field_changed", "field": "title"}
                }],
                "options": {"model_name": "PostTitleChange", "fields": ["title"]}
            }
        ]
    }"#;

    fn must<T>(result: Result<T, HistoryError>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("test failure: {err}"),
        }
    }

    #[test]
    fn declarations_build_a_history() {
        let declaration = must(Declaration::from_json_str(DECLARATION));
        let history = must(declaration.build(HistoryConfig::default()));

        let labels: Vec<String> = history
            .models()
            .iter()
            .map(|model| model.label())
            .collect();
        assert_eq!(labels, vec!["blog.PostEvent".to_string(), "blog.PostTitleChange".to_string()]);
        assert_eq!(history.plan().triggers().len(), 4);
        assert!(history.registry().contains("blog.Post", "published", "manual_tracker"));

        let retitled = must(history.event_model_for("blog.Post", Some("retitled")));
        assert!(retitled.previous_id);
        assert!(retitled.column("body").is_none());
        let sql = crate::ddl::install_script(&history, Dialect::Sqlite);
        assert!(sql.contains("CREATE TRIGGER \"pgh_blog_post_retitled_after_update\""));
    }

    #[test]
    fn malformed_declarations_are_configuration_errors() {
        assert!(matches!(
            Declaration::from_json_str("{\"entities\": 3}"),
            Err(HistoryError::Configuration(_))
        ));
        let unknown = Declaration {
            tracking: vec![TrackingDeclaration {
                entity: "blog.Missing".to_string(),
                trackers: Vec::new(),
                options: EventModelOptions::default(),
                track: true,
            }],
            ..Declaration::default()
        };
        assert!(matches!(
            unknown.build(HistoryConfig::default()),
            Err(HistoryError::UnknownEntity(_))
        ));
    }
}
