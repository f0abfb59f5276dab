//! Row-change predicates that gate trigger firings.
//!
//! A [`Predicate`] is written against logical field names. Binding it to the
//! tracked entity and the event columns yields a [`Condition`] over physical
//! columns that renders for either dialect.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::schema::{Column, Entity};
use crate::sql::{qualified, Dialect, Literal};
use crate::HistoryError;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum RowImage {
    Old,
    New,
}

impl RowImage {
    #[must_use]
    pub fn qualifier(self) -> &'static str {
        match self {
            Self::Old => "OLD",
            Self::New => "NEW",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum CompareOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl CompareOp {
    #[must_use]
    pub fn as_sql(self) -> &'static str {
        match self {
            Self::Eq => "=",
            Self::Ne => "<>",
            Self::Lt => "<",
            Self::Le => "<=",
            Self::Gt => ">",
            Self::Ge => ">=",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Predicate {
    /// Any snapshot field differs between OLD and NEW.
    Changed {
        #[serde(default)]
        exclude: Vec<String>,
    },
    FieldChanged {
        field: String,
    },
    Compare {
        image: RowImage,
        field: String,
        op: CompareOp,
        value: Literal,
    },
    IsNull {
        image: RowImage,
        field: String,
    },
    Any {
        of: Vec<Predicate>,
    },
    All {
        of: Vec<Predicate>,
    },
    Not {
        predicate: Box<Predicate>,
    },
}

impl Predicate {
    #[must_use]
    pub fn changed() -> Self {
        Self::Changed {
            exclude: Vec::new(),
        }
    }

    #[must_use]
    pub fn changed_excluding<I, S>(fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::Changed {
            exclude: fields.into_iter().map(Into::into).collect(),
        }
    }

    #[must_use]
    pub fn field_changed(field: impl Into<String>) -> Self {
        Self::FieldChanged {
            field: field.into(),
        }
    }

    #[must_use]
    pub fn or(self, other: Self) -> Self {
        match self {
            Self::Any { mut of } => {
                of.push(other);
                Self::Any { of }
            }
            first => Self::Any {
                of: vec![first, other],
            },
        }
    }

    #[must_use]
    pub fn and(self, other: Self) -> Self {
        match self {
            Self::All { mut of } => {
                of.push(other);
                Self::All { of }
            }
            first => Self::All {
                of: vec![first, other],
            },
        }
    }

    #[must_use]
    pub fn negate(self) -> Self {
        Self::Not {
            predicate: Box::new(self),
        }
    }

    /// Resolves field names to physical columns.
    ///
    /// `event_columns` are the derived snapshot columns; `Changed` only
    /// compares fields captured by the event model.
    ///
    /// # Errors
    /// Returns [`HistoryError::UnknownField`] for fields `tracked` lacks.
    pub fn bind(
        &self,
        tracked: &Entity,
        event_columns: &[Column],
    ) -> Result<Condition, HistoryError> {
        Ok(match self {
            Self::Changed { exclude } => changed_condition(tracked, event_columns, exclude)?,
            Self::FieldChanged { field } => {
                Condition::ColumnDistinct(tracked.require_column(field)?.column())
            }
            Self::Compare {
                image,
                field,
                op,
                value,
            } => Condition::Compare {
                image: *image,
                column: tracked.require_column(field)?.column(),
                op: *op,
                value: value.clone(),
            },
            Self::IsNull { image, field } => Condition::IsNull {
                image: *image,
                column: tracked.require_column(field)?.column(),
            },
            Self::Any { of } => Condition::Any(
                of.iter()
                    .map(|predicate| predicate.bind(tracked, event_columns))
                    .collect::<Result<_, _>>()?,
            ),
            Self::All { of } => Condition::All(
                of.iter()
                    .map(|predicate| predicate.bind(tracked, event_columns))
                    .collect::<Result<_, _>>()?,
            ),
            Self::Not { predicate } => {
                Condition::Not(Box::new(predicate.bind(tracked, event_columns)?))
            }
        })
    }
}

/// Builds the change-detection condition for an event model.
///
/// When the snapshot covers every tracked field and nothing is excluded the
/// whole row is compared; otherwise the per-column comparisons are OR-ed.
///
/// # Errors
/// Returns [`HistoryError::UnknownField`] when an excluded field is not on `tracked`.
pub fn changed_condition(
    tracked: &Entity,
    event_columns: &[Column],
    exclude: &[String],
) -> Result<Condition, HistoryError> {
    for name in exclude {
        tracked.require_column(name)?;
    }
    let event_fields: BTreeSet<&str> = event_columns.iter().map(|c| c.name.as_str()).collect();
    let tracked_fields: BTreeSet<&str> = tracked.columns.iter().map(|c| c.name.as_str()).collect();

    if exclude.is_empty() && event_fields == tracked_fields {
        return Ok(Condition::RowDistinct);
    }

    let excluded: BTreeSet<&str> = exclude.iter().map(String::as_str).collect();
    let comparisons = event_columns
        .iter()
        .filter(|column| column.concrete && !excluded.contains(column.name.as_str()))
        .filter_map(|column| tracked.column(&column.name))
        .map(|column| Condition::ColumnDistinct(column.column()))
        .collect();
    Ok(Condition::Any(comparisons))
}

/// A predicate bound to physical columns.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Condition {
    RowDistinct,
    ColumnDistinct(String),
    Compare {
        image: RowImage,
        column: String,
        op: CompareOp,
        value: Literal,
    },
    IsNull {
        image: RowImage,
        column: String,
    },
    Any(Vec<Condition>),
    All(Vec<Condition>),
    Not(Box<Condition>),
}

impl Condition {
    /// Renders the condition. `row_columns` expands whole-row comparisons on
    /// SQLite, which has no row-value `IS DISTINCT FROM`.
    #[must_use]
    pub fn render(&self, dialect: Dialect, row_columns: &[String]) -> String {
        match self {
            Self::RowDistinct => match dialect {
                Dialect::Postgres => "OLD.* IS DISTINCT FROM NEW.*".to_string(),
                Dialect::Sqlite => Self::Any(
                    row_columns
                        .iter()
                        .map(|column| Self::ColumnDistinct(column.clone()))
                        .collect(),
                )
                .render(dialect, row_columns),
            },
            Self::ColumnDistinct(column) => {
                dialect.is_distinct(&qualified("OLD", column), &qualified("NEW", column))
            }
            Self::Compare {
                image,
                column,
                op,
                value,
            } => format!(
                "{} {} {}",
                qualified(image.qualifier(), column),
                op.as_sql(),
                value.render(dialect)
            ),
            Self::IsNull { image, column } => {
                format!("{} IS NULL", qualified(image.qualifier(), column))
            }
            Self::Any(conditions) => join(
                conditions,
                " OR ",
                dialect.bool_literal(false),
                dialect,
                row_columns,
            ),
            Self::All(conditions) => join(
                conditions,
                " AND ",
                dialect.bool_literal(true),
                dialect,
                row_columns,
            ),
            Self::Not(condition) => format!("NOT ({})", condition.render(dialect, row_columns)),
        }
    }
}

fn join(
    conditions: &[Condition],
    separator: &str,
    empty: &str,
    dialect: Dialect,
    row_columns: &[String],
) -> String {
    match conditions {
        [] => empty.to_string(),
        [only] => only.render(dialect, row_columns),
        many => {
            let parts: Vec<String> = many
                .iter()
                .map(|condition| condition.render(dialect, row_columns))
                .collect();
            format!("({})", parts.join(separator))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::ColumnKind;

    fn must_ok<T, E: std::fmt::Display>(result: Result<T, E>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("expected Ok(..), got error: {err}"),
        }
    }

    fn fixture_entity() -> Entity {
        Entity::new("tests", "SnapshotModel")
            .with_column(Column::new("id", ColumnKind::Auto).primary_key())
            .with_column(Column::new("dt_field", ColumnKind::DateTime))
            .with_column(Column::new("int_field", ColumnKind::Integer))
            .with_column(Column::new(
                "fk_field",
                ColumnKind::ForeignKey {
                    to: "auth.User".to_string(),
                },
            ))
    }

    #[test]
    fn full_snapshot_compares_whole_row() {
        let entity = fixture_entity();
        let condition = must_ok(changed_condition(&entity, &entity.columns, &[]));
        assert_eq!(condition, Condition::RowDistinct);
        assert_eq!(
            condition.render(Dialect::Postgres, &[]),
            "OLD.* IS DISTINCT FROM NEW.*"
        );
    }

    #[test]
    fn partial_snapshot_ors_columns_on_both_sides() {
        let entity = fixture_entity();
        let event_columns = vec![entity.columns[2].clone(), entity.columns[3].clone()];
        let condition = must_ok(changed_condition(&entity, &event_columns, &[]));
        assert_eq!(
            condition.render(Dialect::Postgres, &[]),
            "(OLD.\"int_field\" IS DISTINCT FROM NEW.\"int_field\" OR \
             OLD.\"fk_field_id\" IS DISTINCT FROM NEW.\"fk_field_id\")"
        );
    }

    #[test]
    fn excluded_fields_drop_out_of_the_comparison() {
        let entity = fixture_entity();
        let condition = must_ok(
            Predicate::changed_excluding(["dt_field", "fk_field", "id"])
                .bind(&entity, &entity.columns),
        );
        assert_eq!(
            condition.render(Dialect::Sqlite, &[]),
            "OLD.\"int_field\" IS NOT NEW.\"int_field\""
        );
    }

    #[test]
    fn sqlite_expands_whole_row_comparison() {
        let rendered = Condition::RowDistinct.render(
            Dialect::Sqlite,
            &["id".to_string(), "int_field".to_string()],
        );
        assert_eq!(
            rendered,
            "(OLD.\"id\" IS NOT NEW.\"id\" OR OLD.\"int_field\" IS NOT NEW.\"int_field\")"
        );
        assert_eq!(Condition::Any(Vec::new()).render(Dialect::Sqlite, &[]), "0");
        assert_eq!(Condition::All(Vec::new()).render(Dialect::Postgres, &[]), "TRUE");
    }

    #[test]
    fn composite_predicates_bind_and_render() {
        let entity = fixture_entity();
        let predicate = Predicate::field_changed("int_field").and(
            Predicate::Compare {
                image: RowImage::New,
                field: "int_field".to_string(),
                op: CompareOp::Gt,
                value: Literal::Integer(10),
            }
            .negate(),
        );
        let condition = must_ok(predicate.bind(&entity, &entity.columns));
        assert_eq!(
            condition.render(Dialect::Postgres, &[]),
            "(OLD.\"int_field\" IS DISTINCT FROM NEW.\"int_field\" AND NOT (NEW.\"int_field\" > 10))"
        );
    }

    #[test]
    fn unknown_fields_are_rejected_at_bind_time() {
        let entity = fixture_entity();
        assert!(matches!(
            Predicate::field_changed("missing").bind(&entity, &entity.columns),
            Err(HistoryError::UnknownField { .. })
        ));
        assert!(matches!(
            Predicate::changed_excluding(["missing"]).bind(&entity, &entity.columns),
            Err(HistoryError::UnknownField { .. })
        ));
    }

    #[test]
    fn predicates_decode_from_json() {
        let decoded: Predicate = match serde_json::from_str(
            r#"{"type": "any", "of": [
                {"type": "field_changed", "field": "a"},
                {"type": "is_null", "image": "old", "field": "b"}
            ]}"#,
        ) {
            Ok(value) => value,
            Err(err) => panic!("predicate should decode: {err}"),
        };
        assert_eq!(
            decoded,
            Predicate::field_changed("a").or(Predicate::IsNull {
                image: RowImage::Old,
                field: "b".to_string(),
            })
        );
    }
}
