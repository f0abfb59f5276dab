use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::model::EventModel;
use crate::HistoryError;

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct RegistryKey {
    pub entity: String,
    pub label: String,
    pub tracker_type: String,
}

impl RegistryKey {
    #[must_use]
    pub fn new(
        entity: impl Into<String>,
        label: impl Into<String>,
        tracker_type: impl Into<String>,
    ) -> Self {
        Self {
            entity: entity.into(),
            label: label.into(),
            tracker_type: tracker_type.into(),
        }
    }
}

/// Maps (tracked entity, label, tracker type) to the event model it writes.
///
/// Populated while a [`crate::HistoryBuilder`] runs and read-only once the
/// builder is finished.
#[derive(Debug, Clone, Default)]
pub struct TrackerRegistry {
    entries: BTreeMap<RegistryKey, Arc<EventModel>>,
}

impl TrackerRegistry {
    /// # Errors
    /// Returns [`HistoryError::DuplicateTracker`] when the key is already taken.
    pub fn register(
        &mut self,
        key: RegistryKey,
        model: Arc<EventModel>,
    ) -> Result<(), HistoryError> {
        if self.entries.contains_key(&key) {
            return Err(HistoryError::DuplicateTracker {
                entity: key.entity,
                label: key.label,
                tracker_type: key.tracker_type,
            });
        }
        tracing::debug!(
            entity = %key.entity,
            label = %key.label,
            tracker_type = %key.tracker_type,
            model = %model.label(),
            "tracker registered"
        );
        self.entries.insert(key, model);
        Ok(())
    }

    /// # Errors
    /// Returns [`HistoryError::NotRegistered`] naming the missing triple.
    pub fn get(
        &self,
        entity: &str,
        label: &str,
        tracker_type: &str,
    ) -> Result<&Arc<EventModel>, HistoryError> {
        self.entries
            .get(&RegistryKey::new(entity, label, tracker_type))
            .ok_or_else(|| HistoryError::NotRegistered {
                entity: entity.to_string(),
                label: label.to_string(),
                tracker_type: tracker_type.to_string(),
            })
    }

    #[must_use]
    pub fn contains(&self, entity: &str, label: &str, tracker_type: &str) -> bool {
        self.entries
            .contains_key(&RegistryKey::new(entity, label, tracker_type))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&RegistryKey, &Arc<EventModel>)> {
        self.entries.iter()
    }

    /// Event models registered for `entity`, keyed by tracker label.
    #[must_use]
    pub fn models_for(&self, entity: &str) -> BTreeMap<String, Arc<EventModel>> {
        self.entries
            .iter()
            .filter(|(key, _)| key.entity == entity)
            .map(|(key, model)| (key.label.clone(), Arc::clone(model)))
            .collect()
    }

    /// The single event model of `entity`, optionally narrowed by label.
    ///
    /// # Errors
    /// Returns [`HistoryError::AmbiguousEventModel`] when several models match
    /// and [`HistoryError::NotRegistered`] when none does.
    pub fn model_for(
        &self,
        entity: &str,
        label: Option<&str>,
    ) -> Result<Arc<EventModel>, HistoryError> {
        let mut found: Vec<&Arc<EventModel>> = Vec::new();
        for (key, model) in &self.entries {
            if key.entity != entity || label.is_some_and(|label| label != key.label) {
                continue;
            }
            if !found.iter().any(|seen| Arc::ptr_eq(seen, model)) {
                found.push(model);
            }
        }
        match found.as_slice() {
            [only] => Ok(Arc::clone(only)),
            [] => Err(HistoryError::NotRegistered {
                entity: entity.to_string(),
                label: label.unwrap_or("*").to_string(),
                tracker_type: "*".to_string(),
            }),
            _ => Err(HistoryError::AmbiguousEventModel {
                entity: entity.to_string(),
            }),
        }
    }
}

/// Selects event models by their relationships.
#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq)]
#[serde(default)]
pub struct EventModelFilter {
    /// Entity labels the models must reference through any relation column.
    pub references: Vec<String>,
    /// Entity labels the models' object reference must point at.
    pub tracks: Vec<String>,
    /// Keep models without an object reference whose tracked entity is one of
    /// `tracks`.
    pub include_missing_obj: bool,
}

impl EventModelFilter {
    #[must_use]
    pub fn matches(&self, model: &EventModel) -> bool {
        if !self.references.is_empty()
            && !self.references.iter().any(|entity| model.references(entity))
        {
            return false;
        }
        if !self.tracks.is_empty() {
            if model.obj_field.is_none() {
                return self.include_missing_obj
                    && self.tracks.iter().any(|entity| model.tracked == *entity);
            }
            return self.tracks.iter().any(|entity| model.tracks(entity));
        }
        true
    }
}
