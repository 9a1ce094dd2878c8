use anyhow::{anyhow, Context, Result};
use inout_core::{
    current_generation, DayKey, ItemInfo, JournalEntry, JournalItem, KindDescriptor,
    ListenFormat, ListenItem, Platform, PlayItem, Rating, ReadFormat, ReadItem, Record, RecordId,
    RecordKind, TagSet, WatchFormat, WatchItem,
};
use rusqlite::types::Value;
use time::format_description::well_known::Rfc3339;
use time::macros::format_description;
use time::{OffsetDateTime, PrimitiveDateTime, UtcOffset};

pub(crate) type Column = (&'static str, Value);

/// Current-generation descriptor for `kind`.
pub(crate) fn descriptor(kind: RecordKind) -> Result<&'static KindDescriptor> {
    current_generation()
        .kind(kind)
        .ok_or_else(|| {
            anyhow!(
                "current generation does not declare kind {}",
                kind.as_str()
            )
        })
}

pub(crate) fn select_columns(kind: RecordKind) -> Result<String> {
    Ok(descriptor(kind)?.column_names().collect::<Vec<_>>().join(", "))
}

/// Fixed-width UTC text so that lexical order equals chronological order.
pub(crate) fn timestamp_text(value: OffsetDateTime) -> Result<String> {
    value
        .to_offset(UtcOffset::UTC)
        .format(format_description!(
            "[year]-[month]-[day]T[hour]:[minute]:[second].[subsecond digits:9]Z"
        ))
        .context("failed to format stored timestamp")
}

pub(crate) fn parse_timestamp(value: &str) -> Result<OffsetDateTime> {
    PrimitiveDateTime::parse(
        value,
        format_description!("[year]-[month]-[day]T[hour]:[minute]:[second].[subsecond digits:9]Z"),
    )
    .map(PrimitiveDateTime::assume_utc)
    .or_else(|_| OffsetDateTime::parse(value, &Rfc3339))
    .with_context(|| format!("invalid stored timestamp: {value}"))
}

pub(crate) fn now_text() -> Result<String> {
    timestamp_text(OffsetDateTime::now_utc())
}

fn optional_timestamp(value: Option<OffsetDateTime>) -> Result<Value> {
    value.map_or(Ok(Value::Null), |value| timestamp_text(value).map(Value::Text))
}

fn optional_text(value: Option<&str>) -> Value {
    value.map_or(Value::Null, |text| Value::Text(text.to_string()))
}

fn text(value: &str) -> Value {
    Value::Text(value.to_string())
}

fn flag(value: bool) -> Value {
    Value::Integer(i64::from(value))
}

fn shared_columns(info: &ItemInfo) -> Result<Vec<Column>> {
    let tags = serde_json::to_string(&info.tags)
        .context("failed to encode tags")?;
    Ok(vec![
        ("id", Value::Text(info.id.to_string())),
        ("created", Value::Text(timestamp_text(info.created)?)),
        ("tags", Value::Text(tags)),
        ("link", optional_text(info.link.as_deref())),
        ("started", optional_timestamp(info.started())?),
        ("completed", optional_timestamp(info.completed())?),
        ("rating", text(info.rating.as_str())),
        ("recommender", optional_text(info.recommender.as_deref())),
    ])
}

/// Column/value pairs for `record` in the current generation's column order.
pub(crate) fn encode(record: &Record) -> Result<Vec<Column>> {
    let mut columns = match record {
        Record::Read(item) => {
            let mut columns = shared_columns(&item.info)?;
            columns.extend([
                ("format", text(item.format.as_str())),
                ("title", text(&item.title)),
                ("author", optional_text(item.author.as_deref())),
                ("abandoned", flag(item.abandoned)),
            ]);
            columns
        }
        Record::Watch(item) => {
            let mut columns = shared_columns(&item.info)?;
            columns.extend([
                ("format", text(item.format.as_str())),
                ("title", text(&item.title)),
                ("director", optional_text(item.director.as_deref())),
                ("abandoned", flag(item.abandoned)),
            ]);
            columns
        }
        Record::Listen(item) => {
            let mut columns = shared_columns(&item.info)?;
            columns.extend([
                ("format", text(item.format.as_str())),
                ("title", text(&item.title)),
                ("artist", optional_text(item.artist.as_deref())),
                ("abandoned", flag(item.abandoned)),
            ]);
            columns
        }
        Record::Play(item) => {
            let mut columns = shared_columns(&item.info)?;
            columns.extend([
                ("platform", text(item.platform.as_str())),
                ("title", text(&item.title)),
                ("saw_credits", flag(item.saw_credits)),
            ]);
            columns
        }
        Record::Journal(item) => {
            return Ok(vec![
                ("id", Value::Text(item.id.to_string())),
                ("when_key", Value::Integer(i64::from(item.when.value()))),
                (
                    "entries",
                    Value::Text(
                        serde_json::to_string(item.entries())
                            .context("failed to encode journal entries")?,
                    ),
                ),
                ("keywords", text(item.keywords())),
            ]);
        }
    };
    let notes = record
        .as_consumable()
        .and_then(|item| item.info().notes.as_deref());
    columns.push(("notes", optional_text(notes)));
    Ok(columns)
}

fn parse_enum<T>(
    kind: RecordKind,
    field: &str,
    raw: &str,
    parse: fn(&str) -> Option<T>,
) -> Result<T> {
    parse(raw).ok_or_else(|| anyhow!("unknown stored {} {field}: {raw}", kind.as_str()))
}

fn decode_info(row: &rusqlite::Row<'_>) -> Result<ItemInfo> {
    let id: String = row.get("id")?;
    let created: String = row.get("created")?;
    let tags: String = row.get("tags")?;
    let started: Option<String> = row.get("started")?;
    let completed: Option<String> = row.get("completed")?;
    let rating: String = row.get("rating")?;

    let mut info = ItemInfo::new(parse_timestamp(&created)?);
    info.id = id.parse::<RecordId>()?;
    info.tags = serde_json::from_str::<Vec<String>>(&tags)
        .with_context(|| format!("invalid stored tags for {id}"))?
        .into_iter()
        .collect::<TagSet>();
    info.link = row.get("link")?;
    info.set_dates(
        started.as_deref().map(parse_timestamp).transpose()?,
        completed.as_deref().map(parse_timestamp).transpose()?,
    );
    info.rating = Rating::parse(&rating)
        .ok_or_else(|| anyhow!("unknown stored rating: {rating}"))?;
    info.recommender = row.get("recommender")?;
    info.notes = row.get("notes")?;
    Ok(info)
}

/// Rebuild a record from a row selected with [`select_columns`].
pub(crate) fn decode(kind: RecordKind, row: &rusqlite::Row<'_>) -> Result<Record> {
    let record = match kind {
        RecordKind::Read => {
            let format: String = row.get("format")?;
            Record::Read(ReadItem {
                info: decode_info(row)?,
                format: parse_enum(kind, "format", &format, ReadFormat::parse)?,
                title: row.get("title")?,
                author: row.get("author")?,
                abandoned: row.get("abandoned")?,
            })
        }
        RecordKind::Watch => {
            let format: String = row.get("format")?;
            Record::Watch(WatchItem {
                info: decode_info(row)?,
                format: parse_enum(kind, "format", &format, WatchFormat::parse)?,
                title: row.get("title")?,
                director: row.get("director")?,
                abandoned: row.get("abandoned")?,
            })
        }
        RecordKind::Listen => {
            let format: String = row.get("format")?;
            Record::Listen(ListenItem {
                info: decode_info(row)?,
                format: parse_enum(kind, "format", &format, ListenFormat::parse)?,
                title: row.get("title")?,
                artist: row.get("artist")?,
                abandoned: row.get("abandoned")?,
            })
        }
        RecordKind::Play => {
            let platform: String = row.get("platform")?;
            Record::Play(PlayItem {
                info: decode_info(row)?,
                platform: parse_enum(kind, "platform", &platform, Platform::parse)?,
                title: row.get("title")?,
                saw_credits: row.get("saw_credits")?,
            })
        }
        RecordKind::Journal => {
            let id: String = row.get("id")?;
            let when: i64 = row.get("when_key")?;
            let entries: String = row.get("entries")?;
            let entries: Vec<JournalEntry> = serde_json::from_str(&entries)
                .with_context(|| format!("invalid stored journal entries for {id}"))?;
            Record::Journal(JournalItem::from_parts(
                id.parse::<RecordId>()?,
                DayKey::from_value(when)?,
                entries,
                row.get("keywords")?,
            ))
        }
    };
    Ok(record)
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use inout_core::{JournalEntry, JournalItem, ListenFormat};
    use time::macros::{date, datetime};

    use super::*;

    fn sample_records() -> Vec<Record> {
        let created = datetime!(2024-12-11 06:53:20.123456789 UTC);
        let mut read = ReadItem::new("Getting To Yes", ReadFormat::Book, created);
        read.author = Some("Roger Fisher".to_string());
        read.info.notes = Some("negotiation".to_string());
        let watch = WatchItem::new("Anomalisa", WatchFormat::Film, created);
        let listen = ListenItem::new("Interview", ListenFormat::Podcast, created);
        let play = PlayItem::new("Golf Story", Platform::Switch, created);
        let journal = JournalItem::with_entries(
            DayKey::from_date(date!(2025 - 01 - 22)),
            vec![JournalEntry::new("Worked on iOS I/O")],
        );
        vec![
            read.into(),
            watch.into(),
            listen.into(),
            play.into(),
            journal.into(),
        ]
    }

    #[test]
    fn encoded_columns_match_current_generation() -> Result<()> {
        for record in sample_records() {
            let encoded: Vec<&str> = encode(&record)?.into_iter().map(|(name, _)| name).collect();
            let declared: Vec<&str> = descriptor(record.kind())?.column_names().collect();
            assert_eq!(
                encoded.iter().collect::<BTreeSet<_>>(),
                declared.iter().collect::<BTreeSet<_>>(),
                "{}",
                record.kind()
            );
        }
        Ok(())
    }

    #[test]
    fn timestamps_are_fixed_width_utc() -> Result<()> {
        let early = datetime!(2024-01-02 03:04:05 +02:00);
        let late = datetime!(2024-01-02 03:04:05.5 UTC);
        let (early_text, late_text) = (timestamp_text(early)?, timestamp_text(late)?);

        assert_eq!(early_text, "2024-01-02T01:04:05.000000000Z");
        assert_eq!(early_text.len(), late_text.len());
        assert!(early_text < late_text);
        assert_eq!(parse_timestamp(&late_text)?, late);
        assert_eq!(parse_timestamp("2024-01-02T01:04:05Z")?, early);
        Ok(())
    }
}
