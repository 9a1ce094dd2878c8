//! Translation of query filters into SQL.
//!
//! Every clause produced here is two-valued (never NULL) so that `NOT` agrees
//! with in-memory evaluation. Conjuncts that cannot be expressed faithfully in
//! SQL are returned as a residual filter and evaluated after the fetch.

use anyhow::Result;
use inout_core::{Field, FieldValue, Filter, RecordKind};
use rusqlite::types::Value;

use crate::codec;

#[derive(Debug)]
pub(crate) struct Plan {
    pub clause: String,
    pub params: Vec<Value>,
    /// `Filter::All` when the whole filter was pushed down.
    pub residual: Filter,
}

impl Plan {
    pub fn is_exact(&self) -> bool {
        matches!(self.residual, Filter::All)
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum ValueType {
    Text,
    Integer,
    Bool,
    Timestamp,
}

fn value_type(field: Field) -> ValueType {
    match field {
        Field::Created | Field::Started | Field::Completed => ValueType::Timestamp,
        Field::Abandoned | Field::SawCredits => ValueType::Bool,
        Field::When => ValueType::Integer,
        Field::Id
        | Field::Title
        | Field::Subtitle
        | Field::Link
        | Field::Notes
        | Field::Rating
        | Field::Recommender
        | Field::Format
        | Field::Keywords => ValueType::Text,
    }
}

/// Bind value for `value` when it has the field's stored type.
fn bind(field: Field, value: &FieldValue) -> Result<Option<Value>> {
    let bound = match (value_type(field), value) {
        (ValueType::Text, FieldValue::Text(text)) => Some(Value::Text(text.clone())),
        (ValueType::Integer, FieldValue::Integer(number)) => Some(Value::Integer(*number)),
        (ValueType::Bool, FieldValue::Bool(flag)) => Some(Value::Integer(i64::from(*flag))),
        (ValueType::Timestamp, FieldValue::Timestamp(at)) => {
            Some(Value::Text(codec::timestamp_text(*at)?))
        }
        _ => None,
    };
    Ok(bound)
}

type Clause = (String, Vec<Value>);

fn translate(kind: RecordKind, filter: &Filter) -> Result<Option<Clause>> {
    let clause = match filter {
        Filter::All => Some(("1".to_string(), Vec::new())),
        Filter::Eq(field, value) => match field.column(kind) {
            None => Some(("0".to_string(), Vec::new())),
            Some(column) => bind(*field, value)?
                .map(|bound| (format!("({column} IS ?)"), vec![bound])),
        },
        Filter::IsNull(field) => Some(match field.column(kind) {
            None => ("1".to_string(), Vec::new()),
            Some(column) => (format!("({column} IS NULL)"), Vec::new()),
        }),
        Filter::NotNull(field) => Some(match field.column(kind) {
            None => ("0".to_string(), Vec::new()),
            Some(column) => (format!("({column} IS NOT NULL)"), Vec::new()),
        }),
        Filter::Contains(field, needle) => match field.column(kind) {
            None => Some(("0".to_string(), Vec::new())),
            // SQLite's lower() only folds ASCII.
            Some(_) if !needle.is_ascii() || value_type(*field) != ValueType::Text => None,
            Some(column) => Some((
                format!("({column} IS NOT NULL AND instr(lower({column}), lower(?)) > 0)"),
                vec![Value::Text(needle.clone())],
            )),
        },
        Filter::Gte(field, value) => compare(kind, *field, value, ">=")?,
        Filter::Lt(field, value) => compare(kind, *field, value, "<")?,
        Filter::AnyOf(field, values) => match field.column(kind) {
            None => Some(("0".to_string(), Vec::new())),
            Some(_) if values.is_empty() => Some(("0".to_string(), Vec::new())),
            Some(column) => {
                let mut bound = Vec::with_capacity(values.len());
                for value in values {
                    match bind(*field, value)? {
                        Some(value) => bound.push(value),
                        None => return Ok(None),
                    }
                }
                let placeholders = vec!["?"; bound.len()].join(", ");
                Some((
                    format!("({column} IS NOT NULL AND {column} IN ({placeholders}))"),
                    bound,
                ))
            }
        },
        Filter::HasTag(_) => None,
        Filter::And(filters) => combine(kind, filters, " AND ", "1")?,
        Filter::Or(filters) => combine(kind, filters, " OR ", "0")?,
        Filter::Not(inner) => translate(kind, inner)?
            .map(|(clause, params)| (format!("(NOT {clause})"), params)),
    };
    Ok(clause)
}

fn compare(
    kind: RecordKind,
    field: Field,
    value: &FieldValue,
    op: &str,
) -> Result<Option<Clause>> {
    let Some(column) = field.column(kind) else {
        return Ok(Some(("0".to_string(), Vec::new())));
    };
    let Some(bound) = bind(field, value)? else {
        return Ok(None);
    };
    let clause = format!("({column} IS NOT NULL AND {column} {op} ?)");
    Ok(Some((clause, vec![bound])))
}

fn combine(
    kind: RecordKind,
    filters: &[Filter],
    joiner: &str,
    empty: &str,
) -> Result<Option<Clause>> {
    if filters.is_empty() {
        return Ok(Some((empty.to_string(), Vec::new())));
    }
    let mut clauses = Vec::with_capacity(filters.len());
    let mut params = Vec::new();
    for filter in filters {
        let Some((clause, bound)) = translate(kind, filter)? else {
            return Ok(None);
        };
        clauses.push(clause);
        params.extend(bound);
    }
    Ok(Some((format!("({})", clauses.join(joiner)), params)))
}

/// Split `filter` into a SQL clause and a residual, conjunct by conjunct.
pub(crate) fn plan(kind: RecordKind, filter: &Filter) -> Result<Plan> {
    let conjuncts: Vec<&Filter> = match filter {
        Filter::And(filters) => filters.iter().collect(),
        other => vec![other],
    };

    let mut clauses = Vec::new();
    let mut params = Vec::new();
    let mut residual = Filter::All;
    for conjunct in conjuncts {
        match translate(kind, conjunct)? {
            Some((clause, bound)) => {
                clauses.push(clause);
                params.extend(bound);
            }
            None => residual = residual.and(conjunct.clone()),
        }
    }

    let clause = if clauses.is_empty() {
        "1".to_string()
    } else {
        clauses.join(" AND ")
    };
    Ok(Plan {
        clause,
        params,
        residual,
    })
}
