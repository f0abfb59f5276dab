//! Engine-wide defaults applied when event models are derived.
//!
//! Every field has a compiled default, so a settings file only needs the
//! keys it wants to change.

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::schema::{ColumnCategory, ColumnOption, ColumnOptions, OnDelete};
use crate::HistoryError;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Default)]
#[serde(rename_all = "snake_case")]
pub enum ContextStorageKind {
    #[default]
    ForeignKey,
    Json,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct HistoryConfig {
    /// Overlay applied to every derived column.
    pub field: ColumnOptions,
    /// Overlay applied to relation columns after `field`.
    pub related_field: ColumnOptions,
    /// Overlay applied to foreign keys after `related_field`.
    pub foreign_key_field: ColumnOptions,
    /// Options stripped from derived columns of a category after all overlays.
    pub exclude_field_options: BTreeMap<ColumnCategory, Vec<ColumnOption>>,
    /// Default options of the `pgh_obj` reference.
    pub obj_field: ColumnOptions,
    pub context_field: ContextStorageKind,
    /// Default options of the `pgh_context` column.
    pub context_field_options: ColumnOptions,
    /// Whether json context also stores `pgh_context_id`.
    pub context_id_field: bool,
    pub context_id_field_options: ColumnOptions,
    pub append_only: bool,
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            field: ColumnOptions {
                primary_key: Some(false),
                unique: Some(false),
                db_index: Some(false),
                ..ColumnOptions::default()
            },
            related_field: ColumnOptions {
                related_name: Some("+".to_string()),
                ..ColumnOptions::default()
            },
            foreign_key_field: ColumnOptions {
                db_constraint: Some(false),
                on_delete: Some(OnDelete::DoNothing),
                ..ColumnOptions::default()
            },
            exclude_field_options: BTreeMap::new(),
            obj_field: ColumnOptions {
                null: Some(false),
                db_constraint: Some(false),
                on_delete: Some(OnDelete::DoNothing),
                ..ColumnOptions::default()
            },
            context_field: ContextStorageKind::ForeignKey,
            context_field_options: ColumnOptions {
                null: Some(true),
                db_constraint: Some(false),
                on_delete: Some(OnDelete::DoNothing),
                ..ColumnOptions::default()
            },
            context_id_field: true,
            context_id_field_options: ColumnOptions {
                null: Some(true),
                ..ColumnOptions::default()
            },
            append_only: false,
        }
    }
}

impl HistoryConfig {
    /// Decodes settings from JSON, falling back to defaults for missing keys.
    ///
    /// # Errors
    /// Returns [`HistoryError::Configuration`] when the JSON does not decode.
    pub fn from_json_str(raw: &str) -> Result<Self, HistoryError> {
        serde_json::from_str(raw)
            .map_err(|err| HistoryError::Configuration(format!("invalid history settings: {err}")))
    }

    /// # Errors
    /// Returns [`HistoryError::Configuration`] when the file cannot be read or decoded.
    pub fn load(path: &Path) -> Result<Self, HistoryError> {
        let raw = std::fs::read_to_string(path).map_err(|err| {
            HistoryError::Configuration(format!(
                "failed to read history settings {}: {err}",
                path.display()
            ))
        })?;
        let config = Self::from_json_str(&raw)?;
        tracing::debug!(path = %path.display(), "history settings loaded");
        Ok(config)
    }

    /// Options to strip from a column with the given categories.
    pub(crate) fn excluded_options<'a>(
        &'a self,
        categories: &'a [ColumnCategory],
    ) -> impl Iterator<Item = ColumnOption> + 'a {
        categories
            .iter()
            .filter_map(|category| self.exclude_field_options.get(category))
            .flatten()
            .copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_settings_keep_defaults() {
        let config = match HistoryConfig::from_json_str(
            r#"{"context_field": "json", "exclude_field_options": {"foreign_key": ["db_index"]}}"#,
        ) {
            Ok(config) => config,
            Err(err) => panic!("expected settings to decode: {err}"),
        };

        assert_eq!(config.context_field, ContextStorageKind::Json);
        assert!(config.context_id_field);
        assert_eq!(config.related_field.related_name.as_deref(), Some("+"));
        let excluded: Vec<_> = config
            .excluded_options(&[ColumnCategory::Field, ColumnCategory::ForeignKey])
            .collect();
        assert_eq!(excluded, vec![ColumnOption::DbIndex]);
    }

    #[test]
    fn malformed_settings_are_configuration_errors() {
        assert!(matches!(
            HistoryConfig::from_json_str("{\"append_only\": \"yes\"}"),
            Err(HistoryError::Configuration(_))
        ));
    }
}
