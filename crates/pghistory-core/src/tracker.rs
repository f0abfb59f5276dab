use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::condition::{Predicate, RowImage};
use crate::model::{ContextStorage, EventModel};
use crate::registry::{RegistryKey, TrackerRegistry};
use crate::schema::Entity;
use crate::trigger::{build_trigger, trigger_name, TriggerDefinition, TriggerInstaller, TriggerSpec};
use crate::HistoryError;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum When {
    Before,
    After,
}

impl When {
    #[must_use]
    pub fn as_sql(self) -> &'static str {
        match self {
            Self::Before => "BEFORE",
            Self::After => "AFTER",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    Insert,
    Update,
    Delete,
}

impl Operation {
    pub const ALL: [Self; 3] = [Self::Insert, Self::Update, Self::Delete];

    #[must_use]
    pub fn as_sql(self) -> &'static str {
        match self {
            Self::Insert => "INSERT",
            Self::Update => "UPDATE",
            Self::Delete => "DELETE",
        }
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Insert => "insert",
            Self::Update => "update",
            Self::Delete => "delete",
        }
    }

    /// Value stored in `pgh_operation`.
    #[must_use]
    pub fn code(self) -> i16 {
        match self {
            Self::Insert => 0,
            Self::Update => 1,
            Self::Delete => 2,
        }
    }

    #[must_use]
    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            0 => Some(Self::Insert),
            1 => Some(Self::Update),
            2 => Some(Self::Delete),
            _ => None,
        }
    }

    fn bit(self) -> u8 {
        1 << self.code()
    }
}

/// A set of DML operations, iterated in insert/update/delete order.
#[derive(Debug, Clone, Copy, Default, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(from = "Vec<Operation>", into = "Vec<Operation>")]
pub struct OperationSet(u8);

impl OperationSet {
    #[must_use]
    pub fn of(operations: &[Operation]) -> Self {
        Self(operations.iter().fold(0, |bits, op| bits | op.bit()))
    }

    #[must_use]
    pub fn contains(self, operation: Operation) -> bool {
        self.0 & operation.bit() != 0
    }

    #[must_use]
    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn iter(self) -> impl Iterator<Item = Operation> {
        Operation::ALL.into_iter().filter(move |op| self.contains(*op))
    }

    /// `INSERT OR UPDATE` style trigger event list.
    #[must_use]
    pub fn as_sql(self) -> String {
        self.iter().map(Operation::as_sql).collect::<Vec<_>>().join(" OR ")
    }
}

impl From<Vec<Operation>> for OperationSet {
    fn from(value: Vec<Operation>) -> Self {
        Self::of(&value)
    }
}

impl From<OperationSet> for Vec<Operation> {
    fn from(value: OperationSet) -> Self {
        value.iter().collect()
    }
}

/// Timing, operations and captured row image of a database tracker.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct TriggerPreset {
    pub when: When,
    pub operations: OperationSet,
    pub snapshot: RowImage,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum TrackerKind {
    Manual,
    AfterInsert,
    AfterInsertOrUpdate,
    BeforeUpdate,
    AfterUpdate,
    BeforeDelete,
    BeforeUpdateOrDelete,
    SnapshotInsert,
    SnapshotUpdate,
    SnapshotDelete,
    /// Insert, update and delete snapshots under one label.
    Snapshot,
    /// Fully custom timing.
    Database {
        when: When,
        operations: OperationSet,
        snapshot: RowImage,
    },
}

impl TrackerKind {
    /// Concrete variant name the type token is derived from.
    #[must_use]
    pub fn variant_name(&self) -> &'static str {
        match self {
            Self::Manual => "ManualTracker",
            Self::AfterInsert => "AfterInsert",
            Self::AfterInsertOrUpdate => "AfterInsertOrUpdate",
            Self::BeforeUpdate => "BeforeUpdate",
            Self::AfterUpdate => "AfterUpdate",
            Self::BeforeDelete => "BeforeDelete",
            Self::BeforeUpdateOrDelete => "BeforeUpdateOrDelete",
            Self::SnapshotInsert => "SnapshotInsert",
            Self::SnapshotUpdate => "SnapshotUpdate",
            Self::SnapshotDelete => "SnapshotDelete",
            Self::Snapshot => "Snapshot",
            Self::Database { .. } => "DatabaseTracker",
        }
    }

    #[must_use]
    pub fn type_name(&self) -> String {
        normalize_type_name(self.variant_name())
    }

    #[must_use]
    pub fn is_database(&self) -> bool {
        !matches!(self, Self::Manual)
    }

    /// Fixed trigger preset, or `None` for manual and composite trackers.
    #[must_use]
    pub fn preset(&self) -> Option<TriggerPreset> {
        use Operation::{Delete, Insert, Update};
        use RowImage::{New, Old};

        let (when, operations, snapshot) = match self {
            Self::Manual | Self::Snapshot => return None,
            Self::AfterInsert | Self::SnapshotInsert => (When::After, &[Insert][..], New),
            Self::AfterInsertOrUpdate => (When::After, &[Insert, Update][..], New),
            Self::BeforeUpdate => (When::Before, &[Update][..], Old),
            Self::AfterUpdate | Self::SnapshotUpdate => (When::After, &[Update][..], New),
            Self::BeforeDelete => (When::Before, &[Delete][..], Old),
            Self::BeforeUpdateOrDelete => (When::Before, &[Update, Delete][..], Old),
            Self::SnapshotDelete => (When::After, &[Delete][..], Old),
            Self::Database {
                when,
                operations,
                snapshot,
            } => {
                return Some(TriggerPreset {
                    when: *when,
                    operations: *operations,
                    snapshot: *snapshot,
                })
            }
        };
        Some(TriggerPreset {
            when,
            operations: OperationSet::of(operations),
            snapshot,
        })
    }
}

impl Display for TrackerKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.variant_name())
    }
}

/// `AfterInsertOrUpdate` -> `after_insert_or_update`.
#[must_use]
pub fn normalize_type_name(name: &str) -> String {
    let mut token = String::with_capacity(name.len() + 4);
    for (idx, ch) in name.chars().enumerate() {
        if ch.is_ascii_uppercase() {
            if idx > 0 {
                token.push('_');
            }
            token.push(ch.to_ascii_lowercase());
        } else {
            token.push(ch);
        }
    }
    token
}

/// One audit rule attached to an event model.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Tracker {
    pub kind: TrackerKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<Predicate>,
    /// Static metadata merged into the context of every event.
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub extra_context: Map<String, Value>,
}

impl Tracker {
    #[must_use]
    pub fn new(kind: TrackerKind) -> Self {
        Self {
            kind,
            label: None,
            condition: None,
            extra_context: Map::new(),
        }
    }

    #[must_use]
    pub fn manual(label: impl Into<String>) -> Self {
        Self::new(TrackerKind::Manual).with_label(label)
    }

    #[must_use]
    pub fn snapshot(label: impl Into<String>) -> Self {
        Self::new(TrackerKind::Snapshot).with_label(label)
    }

    #[must_use]
    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    #[must_use]
    pub fn with_condition(mut self, condition: Predicate) -> Self {
        self.condition = Some(condition);
        self
    }

    #[must_use]
    pub fn with_extra_context(mut self, key: impl Into<String>, value: Value) -> Self {
        self.extra_context.insert(key.into(), value);
        self
    }

    /// Label, defaulting to the type token.
    #[must_use]
    pub fn label(&self) -> String {
        self.label.clone().unwrap_or_else(|| self.kind.type_name())
    }

    #[must_use]
    pub fn type_name(&self) -> String {
        self.kind.type_name()
    }

    /// Checks configuration that does not depend on trigger rendering.
    ///
    /// # Errors
    /// Returns [`HistoryError::Configuration`] when static context cannot be
    /// stored by a trigger writing to the shared context table.
    pub fn validate(&self, model: &EventModel) -> Result<(), HistoryError> {
        if self.kind.is_database()
            && !self.extra_context.is_empty()
            && !matches!(model.context, ContextStorage::Json { .. })
        {
            return Err(HistoryError::Configuration(format!(
                "tracker \"{}\" on {} sets extra_context, which triggers can only store in json context",
                self.label(),
                model.label()
            )));
        }
        Ok(())
    }

    /// Trigger definitions this tracker installs; empty for manual trackers.
    ///
    /// # Errors
    /// Returns [`HistoryError`] when the condition or the snapshot columns do
    /// not resolve against `tracked`.
    pub fn triggers(
        &self,
        model: &EventModel,
        tracked: &Entity,
    ) -> Result<Vec<TriggerDefinition>, HistoryError> {
        let label = self.label();
        let table = tracked.table();
        let parts: Vec<(TrackerKind, Option<Predicate>)> = match &self.kind {
            TrackerKind::Manual => return Ok(Vec::new()),
            TrackerKind::Snapshot => vec![
                (TrackerKind::SnapshotInsert, self.condition.clone()),
                (TrackerKind::SnapshotUpdate, Some(self.update_condition())),
                (TrackerKind::SnapshotDelete, self.condition.clone()),
            ],
            TrackerKind::SnapshotUpdate => vec![(self.kind.clone(), Some(self.update_condition()))],
            other => vec![(other.clone(), self.condition.clone())],
        };

        let mut triggers = Vec::with_capacity(parts.len());
        for (kind, predicate) in parts {
            let Some(preset) = kind.preset() else {
                continue;
            };
            let condition = predicate
                .map(|predicate| predicate.bind(tracked, &model.columns))
                .transpose()?;
            triggers.push(build_trigger(
                model,
                tracked,
                TriggerSpec {
                    name: trigger_name(&table, &label, &kind.type_name()),
                    label: label.clone(),
                    preset,
                    condition,
                    extra_context: self.extra_context.clone(),
                },
            )?);
        }
        Ok(triggers)
    }

    /// Snapshot updates always gate on a change; a user condition narrows it further.
    fn update_condition(&self) -> Predicate {
        match &self.condition {
            Some(condition) => Predicate::changed().and(condition.clone()),
            None => Predicate::changed(),
        }
    }

    /// Installs the tracker's triggers, if any.
    ///
    /// # Errors
    /// Propagates trigger construction and installer failures.
    pub fn setup(
        &self,
        model: &EventModel,
        tracked: &Entity,
        installer: &mut dyn TriggerInstaller,
    ) -> Result<(), HistoryError> {
        let triggers = self.triggers(model, tracked)?;
        if triggers.is_empty() {
            return Ok(());
        }
        tracing::debug!(
            model = %model.label(),
            label = %self.label(),
            triggers = triggers.len(),
            "planning history triggers"
        );
        installer.install(tracked, triggers)
    }

    /// Registers the tracker, then runs [`Tracker::setup`].
    ///
    /// # Errors
    /// Returns [`HistoryError::DuplicateTracker`] when the key is taken, or
    /// any error from `setup`.
    pub fn attach(
        &self,
        model: &std::sync::Arc<EventModel>,
        tracked: &Entity,
        registry: &mut TrackerRegistry,
        installer: &mut dyn TriggerInstaller,
    ) -> Result<(), HistoryError> {
        self.validate(model)?;
        registry.register(
            RegistryKey::new(tracked.label(), self.label(), self.type_name()),
            std::sync::Arc::clone(model),
        )?;
        self.setup(model, tracked, installer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn type_tokens_come_from_variant_names() {
        assert_eq!(TrackerKind::Manual.type_name(), "manual_tracker");
        assert_eq!(
            TrackerKind::AfterInsertOrUpdate.type_name(),
            "after_insert_or_update"
        );
        assert_eq!(TrackerKind::Snapshot.type_name(), "snapshot");
        assert_eq!(Tracker::new(TrackerKind::BeforeDelete).label(), "before_delete");
        assert_eq!(Tracker::snapshot("model").label(), "model");
    }

    #[test]
    fn presets_match_the_tracker_table() {
        let cases = [
            (TrackerKind::AfterInsert, When::After, vec![Operation::Insert], RowImage::New),
            (
                TrackerKind::AfterInsertOrUpdate,
                When::After,
                vec![Operation::Insert, Operation::Update],
                RowImage::New,
            ),
            (TrackerKind::BeforeUpdate, When::Before, vec![Operation::Update], RowImage::Old),
            (TrackerKind::AfterUpdate, When::After, vec![Operation::Update], RowImage::New),
            (TrackerKind::BeforeDelete, When::Before, vec![Operation::Delete], RowImage::Old),
            (
                TrackerKind::BeforeUpdateOrDelete,
                When::Before,
                vec![Operation::Update, Operation::Delete],
                RowImage::Old,
            ),
            (TrackerKind::SnapshotInsert, When::After, vec![Operation::Insert], RowImage::New),
            (TrackerKind::SnapshotUpdate, When::After, vec![Operation::Update], RowImage::New),
            (TrackerKind::SnapshotDelete, When::After, vec![Operation::Delete], RowImage::Old),
        ];
        for (kind, when, operations, snapshot) in cases {
            assert_eq!(
                kind.preset(),
                Some(TriggerPreset {
                    when,
                    operations: OperationSet::of(&operations),
                    snapshot,
                }),
                "{kind}"
            );
        }
        assert_eq!(TrackerKind::Manual.preset(), None);
        assert_eq!(TrackerKind::Snapshot.preset(), None);
    }

    #[test]
    fn operation_sets_keep_canonical_order() {
        let set = OperationSet::of(&[Operation::Delete, Operation::Insert]);
        assert_eq!(set.as_sql(), "INSERT OR DELETE");
        assert!(!set.contains(Operation::Update));
        assert_eq!(Operation::from_code(2), Some(Operation::Delete));
        assert_eq!(Operation::from_code(7), None);
    }

    #[test]
    fn trackers_decode_from_json() {
        let decoded: Vec<Tracker> = match serde_json::from_str(
            r#"[
                {"kind": "snapshot", "label": "model"},
                {
                    "kind": "after_update",
                    "condition": {"type": "field_changed", "field": "int_field"}
                },
                {
                    "kind": {
                        "database": {
                            "when": "before",
                            "operations": ["insert", "delete"],
                            "snapshot": "old"
                        }
                    }
                }
            ]"#,
        ) {
            Ok(value) => value,
            Err(err) => panic!("trackers should decode: {err}"),
        };
        assert_eq!(decoded[0], Tracker::snapshot("model"));
        assert_eq!(decoded[1].label(), "after_update");
        assert_eq!(
            decoded[2].kind.preset().map(|preset| preset.operations.as_sql()),
            Some("INSERT OR DELETE".to_string())
        );
        assert_eq!(decoded[2].type_name(), "database_tracker");
    }
}
