//! Best-effort normalizers from exported JSON arrays to current-generation records.
//!
//! Nothing here returns an error. A payload that is not a JSON array yields no
//! records; a record that cannot be decoded is skipped; an unknown enum string
//! falls back to the kind's default. Each of these is logged.

use std::collections::BTreeMap;

use serde::Deserialize;
use serde_json::Value;
use time::macros::format_description;
use time::{Date, OffsetDateTime};

use crate::journal::{DayKey, JournalEntry, JournalItem};
use crate::{
    ItemInfo, ListenFormat, ListenItem, Platform, PlayItem, Rating, ReadFormat, ReadItem, Record,
    RecordKind, TagSet, WatchFormat, WatchItem,
};

#[derive(Debug, Deserialize)]
struct ItemJson {
    created: i64,
    title: String,
    #[serde(default, rename = "type")]
    format: Option<String>,
    #[serde(default)]
    tags: Option<Vec<String>>,
    #[serde(default)]
    link: Option<String>,
    #[serde(default)]
    rating: Option<String>,
    #[serde(default)]
    started: Option<String>,
    #[serde(default)]
    completed: Option<String>,
    #[serde(default)]
    recommender: Option<String>,
    #[serde(default)]
    notes: Option<String>,
    #[serde(default)]
    author: Option<String>,
    #[serde(default)]
    director: Option<String>,
    #[serde(default)]
    artist: Option<String>,
    #[serde(default)]
    abandoned: Option<bool>,
    #[serde(default)]
    platform: Option<String>,
    #[serde(default)]
    credits: Option<bool>,
}

#[derive(Debug, Deserialize)]
struct EntryJson {
    text: String,
    #[serde(default)]
    tags: Option<Vec<String>>,
}

#[derive(Debug, Deserialize)]
struct JournalJson {
    #[serde(default)]
    id: Option<String>,
    date: String,
    entries: BTreeMap<String, EntryJson>,
    #[serde(default)]
    order: Option<Vec<String>>,
}

/// Decode an exported array of `kind` records.
#[must_use]
pub fn import_items(kind: RecordKind, raw: &[u8]) -> Vec<Record> {
    if kind == RecordKind::Journal {
        return import_journal(raw).into_iter().map(Record::from).collect();
    }
    top_level(kind, raw)
        .into_iter()
        .enumerate()
        .filter_map(|(index, value)| match serde_json::from_value::<ItemJson>(value) {
            Ok(json) => normalize_item(kind, json),
            Err(err) => {
                tracing::warn!(
                    kind = kind.as_str(),
                    index,
                    error = %err,
                    "skipping malformed import record"
                );
                None
            }
        })
        .collect()
}

/// Decode an exported array of journal days. Days without entries are dropped.
#[must_use]
pub fn import_journal(raw: &[u8]) -> Vec<JournalItem> {
    top_level(RecordKind::Journal, raw)
        .into_iter()
        .enumerate()
        .filter_map(|(index, value)| match serde_json::from_value::<JournalJson>(value) {
            Ok(json) => normalize_journal(json),
            Err(err) => {
                tracing::warn!(
                    kind = "journal",
                    index,
                    error = %err,
                    "skipping malformed import record"
                );
                None
            }
        })
        .collect()
}

fn top_level(kind: RecordKind, raw: &[u8]) -> Vec<Value> {
    match serde_json::from_slice::<Vec<Value>>(raw) {
        Ok(values) => values,
        Err(err) => {
            tracing::error!(
                kind = kind.as_str(),
                error = %err,
                "import payload is not a JSON array"
            );
            Vec::new()
        }
    }
}

fn normalize_item(kind: RecordKind, json: ItemJson) -> Option<Record> {
    let Some(created) = created_at(json.created) else {
        tracing::warn!(
            kind = kind.as_str(),
            created = json.created,
            "skipping import record with invalid created time"
        );
        return None;
    };

    let mut info = ItemInfo::new(created);
    info.tags = json.tags.unwrap_or_default().into_iter().collect::<TagSet>();
    info.link = non_blank(json.link);
    info.set_dates(
        parse_day(kind, "started", json.started.as_deref()),
        parse_day(kind, "completed", json.completed.as_deref()),
    );
    info.rating = coerce(kind, "rating", json.rating.as_deref(), Rating::parse);
    info.recommender = non_blank(json.recommender);
    info.notes = non_blank(json.notes);

    let format = json.format.as_deref();
    let abandoned = json.abandoned.unwrap_or(false);
    let record = match kind {
        RecordKind::Read => Record::Read(ReadItem {
            info,
            format: coerce(kind, "format", format, ReadFormat::parse),
            title: json.title,
            author: non_blank(json.author),
            abandoned,
        }),
        RecordKind::Watch => Record::Watch(WatchItem {
            info,
            format: coerce(kind, "format", format, WatchFormat::parse),
            title: json.title,
            director: non_blank(json.director),
            abandoned,
        }),
        RecordKind::Listen => Record::Listen(ListenItem {
            info,
            format: coerce(kind, "format", format, ListenFormat::parse),
            title: json.title,
            artist: non_blank(json.artist),
            abandoned,
        }),
        RecordKind::Play => Record::Play(PlayItem {
            info,
            platform: coerce(kind, "platform", json.platform.as_deref(), Platform::parse),
            title: json.title,
            saw_credits: json.credits.unwrap_or(false),
        }),
        RecordKind::Journal => return None,
    };
    Some(record)
}

fn normalize_journal(json: JournalJson) -> Option<JournalItem> {
    let Some(date) = parse_date(&json.date) else {
        tracing::warn!(
            kind = "journal",
            date = %json.date,
            "skipping journal day with unparsable date"
        );
        return None;
    };

    let keys: Vec<String> = match json.order {
        Some(order) => order,
        None => {
            let mut numeric: Vec<(u64, &String)> = Vec::new();
            for key in json.entries.keys() {
                match key.parse::<u64>() {
                    Ok(n) => numeric.push((n, key)),
                    Err(_) => skip_entry_key(key),
                }
            }
            numeric.sort();
            numeric.into_iter().map(|(_, key)| key.clone()).collect()
        }
    };

    let mut entries = json.entries;
    let mut day = Vec::with_capacity(entries.len());
    for key in keys {
        if key.parse::<u64>().is_err() {
            skip_entry_key(&key);
            continue;
        }
        if let Some(entry) = entries.remove(&key) {
            let tags = entry.tags.unwrap_or_default();
            day.push(JournalEntry::new(entry.text).with_tags(tags));
        }
    }

    if day.is_empty() {
        tracing::debug!(
            kind = "journal",
            date = %json.date,
            source_id = ?json.id,
            "skipping journal day without entries"
        );
        return None;
    }
    Some(JournalItem::with_entries(DayKey::from_date(date), day))
}

fn skip_entry_key(key: &str) {
    tracing::warn!(
        kind = "journal",
        key,
        "skipping journal entry with non-numeric key"
    );
}

fn created_at(millis: i64) -> Option<OffsetDateTime> {
    OffsetDateTime::from_unix_timestamp_nanos(i128::from(millis) * 1_000_000).ok()
}

fn parse_date(value: &str) -> Option<Date> {
    Date::parse(value.trim(), format_description!("[year]-[month]-[day]")).ok()
}

fn parse_day(
    kind: RecordKind,
    field: &'static str,
    value: Option<&str>,
) -> Option<OffsetDateTime> {
    let value = value?;
    let parsed = parse_date(value);
    if parsed.is_none() {
        tracing::warn!(
            kind = kind.as_str(),
            field,
            value,
            "dropping unparsable import date"
        );
    }
    parsed.map(|date| date.midnight().assume_utc())
}

/// Map a raw enum string, falling back to the default (and logging) when unknown.
fn coerce<T: Default>(
    kind: RecordKind,
    field: &'static str,
    value: Option<&str>,
    parse: fn(&str) -> Option<T>,
) -> T {
    let Some(value) = value else {
        return T::default();
    };
    parse(value).unwrap_or_else(|| {
        tracing::warn!(
            kind = kind.as_str(),
            field,
            value,
            "unknown import value, using default"
        );
        T::default()
    })
}

fn non_blank(value: Option<String>) -> Option<String> {
    value.filter(|text| !text.trim().is_empty())
}
