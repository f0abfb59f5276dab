//! Event column derivation from a tracked entity.

use std::collections::BTreeSet;

use crate::config::HistoryConfig;
use crate::schema::{Column, ColumnCategory, ColumnKind, ColumnOption, ColumnOptions, Entity};
use crate::{is_framework_owned, HistoryError};

/// Derives the event columns for `tracked`.
///
/// `fields` restricts the snapshot to the named fields (declaration order of
/// the entity is kept); `exclude` removes fields afterwards.
///
/// # Errors
/// Returns [`HistoryError::UnknownField`] for any name in `fields` or
/// `exclude` the entity does not declare, and [`HistoryError::Configuration`]
/// when a snapshot field would shadow a reserved `pgh_` column.
pub fn derive_columns(
    tracked: &Entity,
    fields: Option<&[String]>,
    exclude: &[String],
    config: &HistoryConfig,
) -> Result<Vec<Column>, HistoryError> {
    for name in fields.unwrap_or_default().iter().chain(exclude) {
        tracked.require_column(name)?;
    }

    let selected: Option<BTreeSet<&str>> =
        fields.map(|names| names.iter().map(String::as_str).collect());
    let excluded: BTreeSet<&str> = exclude.iter().map(String::as_str).collect();

    let mut derived = Vec::new();
    for column in &tracked.columns {
        if excluded.contains(column.name.as_str()) {
            continue;
        }
        if selected
            .as_ref()
            .is_some_and(|names| !names.contains(column.name.as_str()))
        {
            continue;
        }
        if is_framework_owned(&column.name) {
            return Err(HistoryError::Configuration(format!(
                "field \"{}\" of {} uses the reserved pgh_ prefix; exclude it from the event model",
                column.name,
                tracked.label()
            )));
        }
        derived.push(derive_column(column, config));
    }
    Ok(derived)
}

/// Rebuilds one tracked column for storage on an event table.
#[must_use]
pub fn derive_column(column: &Column, config: &HistoryConfig) -> Column {
    let plain_integer = match column.kind {
        ColumnKind::Auto => Some(ColumnKind::Integer),
        ColumnKind::BigAuto => Some(ColumnKind::BigInteger),
        ColumnKind::SmallAuto => Some(ColumnKind::SmallInteger),
        _ => None,
    };
    if let Some(kind) = plain_integer {
        return Column {
            name: column.name.clone(),
            db_column: column.db_column.clone(),
            kind,
            options: ColumnOptions::default(),
            concrete: true,
            swappable: None,
        };
    }
    if !column.concrete {
        return column.clone();
    }

    let mut rebuilt = column.clone();
    let swappable = rebuilt.swappable.take();
    let categories = column.kind.categories();

    rebuilt.options.overlay(&config.field);
    if categories.contains(&ColumnCategory::Related) {
        rebuilt.options.overlay(&config.related_field);
    }
    if categories.contains(&ColumnCategory::ForeignKey) {
        rebuilt.options.overlay(&config.foreign_key_field);
    }

    // A one-to-one on the event table would allow a single event per row.
    if let ColumnKind::OneToOne { to } = &rebuilt.kind {
        rebuilt.kind = ColumnKind::ForeignKey { to: to.clone() };
    }
    if categories.contains(&ColumnCategory::File) {
        rebuilt.options.remove(ColumnOption::PrimaryKey);
    }
    for option in config.excluded_options(&categories) {
        rebuilt.options.remove(option);
    }

    rebuilt.swappable = swappable;
    rebuilt
}
