//! Query descriptors: a kind, a filter tree, an optional sort key and limit.
//!
//! The store pushes what it can down to SQL and evaluates the rest with
//! [`Filter::matches`] and [`Query::apply`]. Both paths share the same
//! semantics: a missing value never satisfies a comparison, `Not` is plain
//! boolean negation, missing values sort first when ascending, and ties break
//! on record id.

use std::cmp::Ordering;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::journal::DayKey;
use crate::{Record, RecordKind};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Field {
    Id,
    Created,
    Title,
    /// Author, director or artist depending on the kind.
    Subtitle,
    Link,
    Started,
    Completed,
    Notes,
    Rating,
    Recommender,
    /// Format for Read/Watch/Listen, platform for Play.
    Format,
    Abandoned,
    SawCredits,
    When,
    Keywords,
}

impl Field {
    /// Column backing this field for `kind`, if the kind has one.
    #[must_use]
    pub fn column(self, kind: RecordKind) -> Option<&'static str> {
        use RecordKind::{Journal, Listen, Play, Read, Watch};
        match (self, kind) {
            (Self::Id, _) => Some("id"),
            (Self::When, Journal) => Some("when_key"),
            (Self::Keywords, Journal) => Some("keywords"),
            (_, Journal) | (Self::When | Self::Keywords, _) => None,
            (Self::Created, _) => Some("created"),
            (Self::Title, _) => Some("title"),
            (Self::Subtitle, Read) => Some("author"),
            (Self::Subtitle, Watch) => Some("director"),
            (Self::Subtitle, Listen) => Some("artist"),
            (Self::Subtitle, Play) => None,
            (Self::Link, _) => Some("link"),
            (Self::Started, _) => Some("started"),
            (Self::Completed, _) => Some("completed"),
            (Self::Notes, _) => Some("notes"),
            (Self::Rating, _) => Some("rating"),
            (Self::Recommender, _) => Some("recommender"),
            (Self::Format, Play) => Some("platform"),
            (Self::Format, _) => Some("format"),
            (Self::Abandoned, Play) | (Self::SawCredits, Read | Watch | Listen) => None,
            (Self::Abandoned, _) => Some("abandoned"),
            (Self::SawCredits, _) => Some("saw_credits"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum FieldValue {
    Text(String),
    Integer(i64),
    Bool(bool),
    #[serde(with = "time::serde::rfc3339")]
    Timestamp(OffsetDateTime),
}

impl FieldValue {
    /// Ordering between two values of the same variant. Mixed variants are unordered.
    #[must_use]
    pub fn compare(&self, other: &Self) -> Option<Ordering> {
        match (self, other) {
            (Self::Text(a), Self::Text(b)) => Some(a.cmp(b)),
            (Self::Integer(a), Self::Integer(b)) => Some(a.cmp(b)),
            (Self::Bool(a), Self::Bool(b)) => Some(a.cmp(b)),
            (Self::Timestamp(a), Self::Timestamp(b)) => Some(a.cmp(b)),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(value) => Some(value),
            _ => None,
        }
    }
}

impl From<&str> for FieldValue {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<String> for FieldValue {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl From<i64> for FieldValue {
    fn from(value: i64) -> Self {
        Self::Integer(value)
    }
}

impl From<bool> for FieldValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<OffsetDateTime> for FieldValue {
    fn from(value: OffsetDateTime) -> Self {
        Self::Timestamp(value)
    }
}

impl From<DayKey> for FieldValue {
    fn from(value: DayKey) -> Self {
        Self::Integer(i64::from(value.value()))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum Filter {
    All,
    Eq(Field, FieldValue),
    IsNull(Field),
    NotNull(Field),
    /// Case-insensitive substring match on a text field.
    Contains(Field, String),
    Gte(Field, FieldValue),
    Lt(Field, FieldValue),
    AnyOf(Field, Vec<FieldValue>),
    /// Consumables: the item's tags. Journal: any entry's tags.
    HasTag(String),
    And(Vec<Filter>),
    Or(Vec<Filter>),
    Not(Box<Filter>),
}

impl Filter {
    #[must_use]
    pub fn and(self, other: Filter) -> Filter {
        match (self, other) {
            (Filter::All, other) | (other, Filter::All) => other,
            (Filter::And(mut left), Filter::And(right)) => {
                left.extend(right);
                Filter::And(left)
            }
            (Filter::And(mut left), other) => {
                left.push(other);
                Filter::And(left)
            }
            (left, right) => Filter::And(vec![left, right]),
        }
    }

    #[must_use]
    pub fn negate(self) -> Filter {
        Filter::Not(Box::new(self))
    }

    #[must_use]
    pub fn matches(&self, record: &Record) -> bool {
        match self {
            Self::All => true,
            Self::Eq(field, value) => record.field(*field).is_some_and(|actual| &actual == value),
            Self::IsNull(field) => record.field(*field).is_none(),
            Self::NotNull(field) => record.field(*field).is_some(),
            Self::Contains(field, needle) => record.field(*field).is_some_and(|actual| {
                actual
                    .as_text()
                    .is_some_and(|text| text.to_lowercase().contains(&needle.to_lowercase()))
            }),
            Self::Gte(field, bound) => record
                .field(*field)
                .and_then(|actual| actual.compare(bound))
                .is_some_and(Ordering::is_ge),
            Self::Lt(field, bound) => record
                .field(*field)
                .and_then(|actual| actual.compare(bound))
                .is_some_and(Ordering::is_lt),
            Self::AnyOf(field, values) => {
                record.field(*field).is_some_and(|actual| values.contains(&actual))
            }
            Self::HasTag(tag) => match record {
                Record::Journal(item) => {
                    item.entries().iter().any(|entry| entry.tags.iter().any(|t| t == tag))
                }
                other => other
                    .as_consumable()
                    .is_some_and(|item| item.info().tags.contains(tag)),
            },
            Self::And(filters) => filters.iter().all(|filter| filter.matches(record)),
            Self::Or(filters) => filters.iter().any(|filter| filter.matches(record)),
            Self::Not(filter) => !filter.matches(record),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum SortDirection {
    Ascending,
    Descending,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
pub struct SortKey {
    pub field: Field,
    pub direction: SortDirection,
}

impl SortKey {
    #[must_use]
    pub fn ascending(field: Field) -> Self {
        Self {
            field,
            direction: SortDirection::Ascending,
        }
    }

    #[must_use]
    pub fn descending(field: Field) -> Self {
        Self {
            field,
            direction: SortDirection::Descending,
        }
    }

    #[must_use]
    pub fn compare(&self, left: &Record, right: &Record) -> Ordering {
        let (a, b) = (left.field(self.field), right.field(self.field));
        let by_field = match (&a, &b) {
            (None, None) => Ordering::Equal,
            (None, Some(_)) => Ordering::Less,
            (Some(_), None) => Ordering::Greater,
            (Some(a), Some(b)) => a.compare(b).unwrap_or(Ordering::Equal),
        };
        let by_field = match self.direction {
            SortDirection::Ascending => by_field,
            SortDirection::Descending => by_field.reverse(),
        };
        by_field.then_with(|| left.id().cmp(&right.id()))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Query {
    pub kind: RecordKind,
    pub filter: Filter,
    pub sort: Option<SortKey>,
    pub limit: Option<usize>,
}

impl Query {
    #[must_use]
    pub fn new(kind: RecordKind) -> Self {
        Self {
            kind,
            filter: Filter::All,
            sort: None,
            limit: None,
        }
    }

    /// Narrow the query; repeated calls are combined with `And`.
    #[must_use]
    pub fn filtered(mut self, filter: Filter) -> Self {
        self.filter = std::mem::replace(&mut self.filter, Filter::All).and(filter);
        self
    }

    #[must_use]
    pub fn sorted(mut self, key: SortKey) -> Self {
        self.sort = Some(key);
        self
    }

    #[must_use]
    pub fn limited(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Evaluate the whole query in memory over `records`.
    #[must_use]
    pub fn apply(&self, records: Vec<Record>) -> Vec<Record> {
        let mut selected: Vec<Record> = records
            .into_iter()
            .filter(|record| record.kind() == self.kind && self.filter.matches(record))
            .collect();
        match self.sort {
            Some(key) => selected.sort_by(|left, right| key.compare(left, right)),
            None => selected.sort_by_key(Record::id),
        }
        if let Some(limit) = self.limit {
            selected.truncate(limit);
        }
        selected
    }
}

impl Record {
    /// Value of `field` on this record, or `None` when unset or not applicable.
    #[must_use]
    pub fn field(&self, field: Field) -> Option<FieldValue> {
        if field == Field::Id {
            return Some(FieldValue::Text(self.id().to_string()));
        }
        if let Self::Journal(item) = self {
            return match field {
                Field::When => Some(item.when.into()),
                Field::Keywords => Some(item.keywords().into()),
                _ => None,
            };
        }
        let consumable = self.as_consumable()?;
        let info = consumable.info();
        match field {
            Field::Id | Field::When | Field::Keywords => None,
            Field::Created => Some(info.created.into()),
            Field::Title => Some(consumable.title().into()),
            Field::Subtitle => consumable.subtitle().map(FieldValue::from),
            Field::Link => info.link.as_deref().map(FieldValue::from),
            Field::Started => info.started().map(FieldValue::from),
            Field::Completed => info.completed().map(FieldValue::from),
            Field::Notes => info.notes.as_deref().map(FieldValue::from),
            Field::Rating => Some(info.rating.as_str().into()),
            Field::Recommender => info.recommender.as_deref().map(FieldValue::from),
            Field::Format => Some(
                match self {
                    Self::Read(item) => item.format.as_str(),
                    Self::Watch(item) => item.format.as_str(),
                    Self::Listen(item) => item.format.as_str(),
                    Self::Play(item) => item.platform.as_str(),
                    Self::Journal(_) => return None,
                }
                .into(),
            ),
            Field::Abandoned => match self {
                Self::Read(item) => Some(item.abandoned.into()),
                Self::Watch(item) => Some(item.abandoned.into()),
                Self::Listen(item) => Some(item.abandoned.into()),
                Self::Play(_) | Self::Journal(_) => None,
            },
            Field::SawCredits => match self {
                Self::Play(item) => Some(item.saw_credits.into()),
                _ => None,
            },
        }
    }
}
