//! Generation tagging and the forward migration chain.
//!
//! Every stage reshapes the kinds whose column set changed by building a
//! staging table in the target shape, copying rows across, dropping the old
//! table and renaming the staging table into place. A stage and its tag row
//! commit in a single transaction.

use std::collections::{BTreeMap, BTreeSet};

use anyhow::{anyhow, Context, Result};
use inout_core::{
    compute_keywords, current_generation, generation, list_generations, DayKey, FieldSpec,
    GenerationDescriptor, JournalEntry, KindDescriptor, RecordKind, SchemaVersion,
};
use rusqlite::types::Value;
use rusqlite::{params, params_from_iter, Connection};
use serde::{Deserialize, Serialize};

use crate::codec;

const CREATE_SCHEMA_GENERATIONS_SQL: &str = r"
CREATE TABLE IF NOT EXISTS schema_generations (
  seq INTEGER PRIMARY KEY AUTOINCREMENT,
  version TEXT NOT NULL,
  applied_at TEXT NOT NULL
);
";

#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum SchemaError {
    #[error("store generation {found} is newer than the newest supported generation {supported}")]
    NewerGeneration {
        found: SchemaVersion,
        supported: SchemaVersion,
    },
    #[error("store generation tag `{0}` is not a registered generation")]
    UnrecognizedGeneration(String),
    #[error("untagged store does not match any known pre-versioning shape: {0}")]
    UnrecognizedLegacyShape(String),
    #[error("no migration stage from {from} to {to}")]
    MissingStage {
        from: SchemaVersion,
        to: SchemaVersion,
    },
}

/// A row read during a reshape, keyed by column name.
pub type RowValues = BTreeMap<String, Value>;

/// Per-row computation run by a custom stage. Must be idempotent.
pub type RowTransform = fn(RecordKind, &mut RowValues) -> Result<()>;

#[derive(Debug, Clone, Copy)]
pub enum StageKind {
    /// Copy shared columns, let declared defaults fill added ones.
    Lightweight,
    Custom(RowTransform),
}

#[derive(Debug, Clone, Copy)]
pub struct MigrationStage {
    pub from: SchemaVersion,
    pub to: SchemaVersion,
    pub kind: StageKind,
    pub description: &'static str,
}

static STAGES: [MigrationStage; 3] = [
    MigrationStage {
        from: SchemaVersion::new(1, 0, 1),
        to: SchemaVersion::new(2, 0, 0),
        kind: StageKind::Lightweight,
        description: "listen items gain notes",
    },
    MigrationStage {
        from: SchemaVersion::new(2, 0, 0),
        to: SchemaVersion::new(3, 0, 0),
        kind: StageKind::Lightweight,
        description: "read, watch and play items gain notes",
    },
    MigrationStage {
        from: SchemaVersion::new(3, 0, 0),
        to: SchemaVersion::new(4, 0, 0),
        kind: StageKind::Custom(journal_day_keys),
        description: "journal days keyed by when with a keyword index",
    },
];

#[must_use]
pub fn migration_stages() -> &'static [MigrationStage] {
    &STAGES
}

#[must_use]
pub fn stage_for(from: SchemaVersion, to: SchemaVersion) -> Option<&'static MigrationStage> {
    STAGES.iter().find(|stage| stage.from == from && stage.to == to)
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SchemaStatus {
    /// `None` for an empty store that has never been initialised.
    pub current_version: Option<SchemaVersion>,
    pub target_version: SchemaVersion,
    pub pending_versions: Vec<SchemaVersion>,
    pub inferred_from_legacy: bool,
}

/// Replaces `(year, month, day)` with `when_key`, pins entry ids and rebuilds
/// the keyword index. Rows already in the target shape pass through unchanged.
fn journal_day_keys(kind: RecordKind, row: &mut RowValues) -> Result<()> {
    if kind != RecordKind::Journal {
        return Ok(());
    }

    let id = match row.get("id") {
        Some(Value::Text(id)) => id.clone(),
        _ => return Err(anyhow!("journal row without a text id")),
    };
    let integer = |name: &str| match row.get(name) {
        Some(Value::Integer(value)) => Some(*value),
        _ => None,
    };

    let when = match (integer("year"), integer("month"), integer("day")) {
        (Some(year), Some(month), Some(day)) => DayKey::from_parts(year, month, day)
            .with_context(|| format!("journal {id} has an invalid legacy date"))?,
        _ => {
            let value = integer("when_key")
                .ok_or_else(|| anyhow!("journal {id} has neither a legacy date nor when_key"))?;
            DayKey::from_value(value)
                .with_context(|| format!("journal {id} has an invalid when_key"))?
        }
    };

    let entries: Vec<JournalEntry> = match row.get("entries") {
        Some(Value::Text(raw)) => serde_json::from_str(raw)
            .with_context(|| format!("journal {id} has unreadable entries"))?,
        _ => Vec::new(),
    };

    let key = i64::from(when.value());
    let keywords = compute_keywords(&entries);
    let encoded = serde_json::to_string(&entries)
        .context("failed to encode journal entries")?;
    row.insert("when_key".to_string(), Value::Integer(key));
    row.insert("keywords".to_string(), Value::Text(keywords));
    row.insert("entries".to_string(), Value::Text(encoded));
    Ok(())
}

pub(crate) fn table_exists(conn: &Connection, table: &str) -> Result<bool> {
    let matches: i64 = conn
        .query_row(
            "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?1",
            params![table],
            |row| row.get(0),
        )
        .with_context(|| format!("cannot look up table {table}"))?;
    Ok(matches > 0)
}

fn table_columns(conn: &Connection, table: &str) -> Result<Vec<String>> {
    let mut stmt = conn
        .prepare(&format!("PRAGMA table_info({table})"))
        .with_context(|| format!("failed to inspect table_info for {table}"))?;
    let mut rows = stmt.query([])?;

    let mut columns = Vec::new();
    while let Some(row) = rows.next()? {
        columns.push(row.get::<_, String>(1)?);
    }
    Ok(columns)
}

fn recorded_generation(conn: &Connection) -> Result<Option<String>> {
    if !table_exists(conn, "schema_generations")? {
        return Ok(None);
    }
    let mut stmt = conn
        .prepare("SELECT version FROM schema_generations ORDER BY seq DESC LIMIT 1")
        .context("failed to prepare generation tag lookup")?;
    let mut rows = stmt.query([]).context("failed to read generation tag")?;
    match rows.next()? {
        Some(row) => Ok(Some(row.get::<_, String>(0)?)),
        None => Ok(None),
    }
}

fn record_generation(conn: &Connection, version: SchemaVersion) -> Result<()> {
    conn.execute_batch(CREATE_SCHEMA_GENERATIONS_SQL)
        .context("failed to apply schema_generations table")?;
    conn.execute(
        "INSERT INTO schema_generations(version, applied_at) VALUES (?1, ?2)",
        params![version.to_string(), codec::now_text()?],
    )
    .with_context(|| format!("failed to record generation {version}"))?;
    Ok(())
}

/// Effective generation of the store and whether it was inferred from a
/// pre-versioning shape. `None` means the store is empty.
pub(crate) fn detect_effective_generation(
    conn: &Connection,
) -> Result<Option<(SchemaVersion, bool)>> {
    if let Some(raw) = recorded_generation(conn)? {
        let version = raw
            .parse::<SchemaVersion>()
            .map_err(|_| SchemaError::UnrecognizedGeneration(raw.clone()))?;
        return Ok(Some((version, false)));
    }

    let legacy = &list_generations()[0];
    let mut present = Vec::new();
    for descriptor in legacy.record_kinds() {
        if table_exists(conn, descriptor.table)? {
            present.push(descriptor);
        }
    }
    if present.is_empty() {
        return Ok(None);
    }
    if present.len() != legacy.record_kinds().len() {
        let names: Vec<&str> = present.iter().map(|d| d.table).collect();
        return Err(SchemaError::UnrecognizedLegacyShape(format!(
            "only some kind tables exist: {}",
            names.join(", ")
        ))
        .into());
    }

    for descriptor in legacy.record_kinds() {
        let actual: BTreeSet<String> = table_columns(conn, descriptor.table)?.into_iter().collect();
        let expected: BTreeSet<String> = descriptor.column_names().map(str::to_string).collect();
        if actual != expected {
            return Err(SchemaError::UnrecognizedLegacyShape(format!(
                "{} has columns [{}]",
                descriptor.table,
                actual.into_iter().collect::<Vec<_>>().join(", ")
            ))
            .into());
        }
    }
    Ok(Some((legacy.version, true)))
}

pub(crate) fn schema_status(conn: &Connection) -> Result<SchemaStatus> {
    let target_version = current_generation().version;
    let detected = detect_effective_generation(conn)?;
    let pending_versions = match detected {
        None => vec![target_version],
        Some((current, _)) => list_generations()
            .iter()
            .map(|generation| generation.version)
            .filter(|version| *version > current)
            .collect(),
    };

    Ok(SchemaStatus {
        current_version: detected.map(|(version, _)| version),
        target_version,
        pending_versions,
        inferred_from_legacy: detected.is_some_and(|(_, inferred)| inferred),
    })
}

fn column_sql(field: &FieldSpec) -> String {
    let mut sql = format!("{} {}", field.name, field.column_type.as_sql());
    if field.primary_key {
        sql.push_str(" PRIMARY KEY");
    }
    if !field.nullable {
        sql.push_str(" NOT NULL");
    }
    if let Some(default) = field.default {
        sql.push_str(" DEFAULT ");
        sql.push_str(default);
    }
    sql
}

pub(crate) fn create_table(
    conn: &Connection,
    descriptor: &KindDescriptor,
    name: &str,
) -> Result<()> {
    let columns: Vec<String> = descriptor.fields.iter().map(column_sql).collect();
    let sql = format!("CREATE TABLE {name} (\n  {}\n);", columns.join(",\n  "));
    conn.execute_batch(&sql)
        .with_context(|| format!("failed to create table {name}"))
}

fn create_indexes(conn: &Connection, descriptor: &KindDescriptor) -> Result<()> {
    for index in descriptor.indexes {
        conn.execute_batch(&format!(
            "CREATE INDEX IF NOT EXISTS {} ON {}({});",
            index.name, descriptor.table, index.column
        ))
        .with_context(|| format!("failed to create index {}", index.name))?;
    }
    Ok(())
}

/// Create every kind table of `generation` with its indexes, without tagging.
pub(crate) fn create_generation_shapes(
    conn: &Connection,
    generation: &GenerationDescriptor,
) -> Result<()> {
    for descriptor in generation.record_kinds() {
        create_table(conn, descriptor, descriptor.table)?;
        create_indexes(conn, descriptor)?;
    }
    Ok(())
}

fn read_rows(conn: &Connection, table: &str) -> Result<Vec<RowValues>> {
    let columns = table_columns(conn, table)?;
    let sql = format!(
        "SELECT {} FROM {table} ORDER BY rowid ASC",
        columns.join(", ")
    );
    let mut stmt = conn
        .prepare(&sql)
        .with_context(|| format!("failed to prepare row copy from {table}"))?;
    let mut rows = stmt.query([])?;

    let mut out = Vec::new();
    while let Some(row) = rows.next()? {
        let mut values = RowValues::new();
        for (index, name) in columns.iter().enumerate() {
            values.insert(name.clone(), row.get::<_, Value>(index)?);
        }
        out.push(values);
    }
    Ok(out)
}

/// Columns holding instants. Rewritten to the canonical stored text on every
/// reshape so that SQL ordering agrees with decoded values.
const TIMESTAMP_COLUMNS: [&str; 3] = ["created", "started", "completed"];

fn canonicalize_timestamps(row: &mut RowValues) -> Result<()> {
    for column in TIMESTAMP_COLUMNS {
        if let Some(Value::Text(raw)) = row.get_mut(column) {
            *raw = codec::timestamp_text(codec::parse_timestamp(raw)?)?;
        }
    }
    Ok(())
}

fn insert_row(
    conn: &Connection,
    target: &KindDescriptor,
    table: &str,
    row: &RowValues,
) -> Result<()> {
    // Explicit NULLs would defeat the default of a NOT NULL column.
    let columns: Vec<(&str, &Value)> = target
        .fields
        .iter()
        .filter_map(|field| {
            let value = row.get(field.name)?;
            let defaulted =
                matches!(value, Value::Null) && !field.nullable && field.default.is_some();
            (!defaulted).then_some((field.name, value))
        })
        .collect();
    let names: Vec<&str> = columns.iter().map(|(name, _)| *name).collect();
    let placeholders = vec!["?"; columns.len()].join(", ");
    conn.execute(
        &format!(
            "INSERT INTO {table} ({}) VALUES ({placeholders})",
            names.join(", ")
        ),
        params_from_iter(columns.iter().map(|(_, value)| *value)),
    )
    .with_context(|| format!("failed to copy row into {table}"))?;
    Ok(())
}

fn reshape_kind(
    conn: &Connection,
    stage: &MigrationStage,
    target: &KindDescriptor,
) -> Result<usize> {
    let staging = format!("{}__next", target.table);
    conn.execute_batch(&format!("DROP TABLE IF EXISTS {staging};"))
        .with_context(|| format!("failed to clear staging table {staging}"))?;
    create_table(conn, target, &staging)?;

    let mut copied = 0;
    if table_exists(conn, target.table)? {
        for mut row in read_rows(conn, target.table)? {
            if let StageKind::Custom(transform) = stage.kind {
                transform(target.kind, &mut row).with_context(|| {
                    format!(
                        "stage {} -> {} failed on {}",
                        stage.from, stage.to, target.table
                    )
                })?;
            }
            canonicalize_timestamps(&mut row)
                .with_context(|| format!("unreadable timestamp in {}", target.table))?;
            insert_row(conn, target, &staging, &row)?;
            copied += 1;
        }
        conn.execute_batch(&format!("DROP TABLE {};", target.table))
            .with_context(|| format!("failed to drop {}", target.table))?;
    }

    let rename = format!("ALTER TABLE {staging} RENAME TO {};", target.table);
    conn.execute_batch(&rename)
        .with_context(|| format!("failed to rename {staging} into place"))?;
    create_indexes(conn, target)?;
    Ok(copied)
}

/// Apply one stage and record its target tag, all in one transaction.
///
/// # Errors
/// Returns an error when either endpoint is unregistered or any reshape fails;
/// the store is left exactly as it was before the call.
pub fn apply_stage(conn: &mut Connection, stage: &MigrationStage) -> Result<()> {
    let from = generation(stage.from)
        .ok_or_else(|| SchemaError::UnrecognizedGeneration(stage.from.to_string()))?;
    let to = generation(stage.to)
        .ok_or_else(|| SchemaError::UnrecognizedGeneration(stage.to.to_string()))?;

    let tx = conn
        .transaction()
        .with_context(|| format!("failed to start stage {} -> {}", stage.from, stage.to))?;
    for kind in from.changed_kinds(to) {
        let target = to.kind(kind).ok_or_else(|| {
            anyhow!(
                "generation {} does not declare {}",
                to.version,
                kind.as_str()
            )
        })?;
        let copied = reshape_kind(&tx, stage, target)?;
        tracing::info!(
            from = %stage.from,
            to = %stage.to,
            kind = kind.as_str(),
            count = copied,
            "migrated kind"
        );
    }
    record_generation(&tx, stage.to)?;
    tx.commit()
        .with_context(|| format!("failed to commit stage {} -> {}", stage.from, stage.to))?;

    tracing::info!(
        from = %stage.from,
        to = %stage.to,
        description = stage.description,
        "applied migration stage"
    );
    Ok(())
}

/// Bring the store to the current generation.
///
/// An empty store is created directly in the current shape. A store behind
/// current walks every stage in order. A store ahead of current is refused.
///
/// # Errors
/// Returns a [`SchemaError`] (wrapped) when the store cannot be placed on the
/// chain, or any SQLite error raised by a stage.
pub fn migrate(conn: &mut Connection) -> Result<SchemaVersion> {
    let target = current_generation().version;

    let Some((found, inferred)) = detect_effective_generation(conn)? else {
        let tx = conn
            .transaction()
            .context("failed to start fresh store transaction")?;
        create_generation_shapes(&tx, current_generation())?;
        record_generation(&tx, target)?;
        tx.commit().context("failed to commit fresh store")?;
        tracing::info!(version = %target, "created fresh store");
        return Ok(target);
    };

    if found > target {
        return Err(SchemaError::NewerGeneration {
            found,
            supported: target,
        }
        .into());
    }
    if generation(found).is_none() {
        return Err(SchemaError::UnrecognizedGeneration(found.to_string()).into());
    }
    if inferred {
        tracing::warn!(version = %found, "untagged store matches the pre-versioning shape");
        record_generation(conn, found)?;
    }

    let chain: Vec<SchemaVersion> = list_generations()
        .iter()
        .map(|generation| generation.version)
        .filter(|version| *version >= found)
        .collect();
    for pair in chain.windows(2) {
        let (from, to) = (pair[0], pair[1]);
        let stage = stage_for(from, to)
            .ok_or(SchemaError::MissingStage { from, to })?;
        apply_stage(conn, stage)?;
    }
    Ok(target)
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use inout_core::{Consumable, Field, Filter, Query, Record, SortKey};
    use rusqlite::params;
    use time::macros::datetime;

    use super::*;
    use crate::SqliteStore;

    const CREATED: &str = "2024-12-11T06:53:20.000000000Z";

    fn legacy_store() -> Result<SqliteStore> {
        let store = SqliteStore::open(Path::new(":memory:"))?;
        create_generation_shapes(&store.conn, &list_generations()[0])?;
        Ok(store)
    }

    fn insert_legacy_items(conn: &Connection) -> Result<()> {
        conn.execute(
            "INSERT INTO read_items(id, created, title, author, format, completed, started)
             VALUES (?1, ?2, 'Getting To Yes', 'Roger Fisher', 'book', ?2, ?2)",
            params![ulid::Ulid::new().to_string(), CREATED],
        )?;
        conn.execute(
            "INSERT INTO watch_items(id, created, title, format)
             VALUES (?1, ?2, 'Anomalisa', 'film')",
            params![ulid::Ulid::new().to_string(), CREATED],
        )?;
        conn.execute(
            "INSERT INTO listen_items(id, created, title, format, rating)
             VALUES (?1, ?2, 'Summer', 'song', 'great')",
            params![ulid::Ulid::new().to_string(), CREATED],
        )?;
        conn.execute(
            "INSERT INTO play_items(id, created, title, platform, saw_credits)
             VALUES (?1, ?2, 'Golf Story', 'switch', 1)",
            params![ulid::Ulid::new().to_string(), CREATED],
        )?;
        conn.execute(
            "INSERT INTO journal_items(id, year, month, day, entries)
             VALUES (?1, 2025, 1, 22, ?2)",
            params![
                ulid::Ulid::new().to_string(),
                r#"[{"text":"Worked on iOS I/O","tags":null},{"text":"Taxied Remy to school"}]"#
            ],
        )?;
        Ok(())
    }

    fn journal_snapshot(conn: &Connection) -> Result<Vec<(String, i64, String, String)>> {
        let mut stmt =
            conn.prepare("SELECT id, when_key, entries, keywords FROM journal_items ORDER BY id")?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
        })?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    fn tag_count(conn: &Connection) -> Result<i64> {
        let count = conn.query_row("SELECT COUNT(*) FROM schema_generations", [], |row| {
            row.get(0)
        })?;
        Ok(count)
    }

    // Test IDs: TMIG-001
    #[test]
    fn every_adjacent_generation_pair_has_one_stage() {
        for pair in list_generations().windows(2) {
            let matching = migration_stages()
                .iter()
                .filter(|stage| stage.from == pair[0].version && stage.to == pair[1].version)
                .count();
            assert_eq!(matching, 1, "{} -> {}", pair[0].version, pair[1].version);
        }
        assert_eq!(migration_stages().len(), list_generations().len() - 1);
    }

    // Test IDs: TMIG-002
    #[test]
    fn fresh_store_is_created_at_current_generation() -> Result<()> {
        let mut store = SqliteStore::open(Path::new(":memory:"))?;
        assert_eq!(store.schema_status()?.current_version, None);

        store.migrate()?;
        let status = store.schema_status()?;
        assert_eq!(status.current_version, Some(current_generation().version));
        assert!(status.pending_versions.is_empty());
        assert!(!status.inferred_from_legacy);
        Ok(())
    }

    // Test IDs: TMIG-003
    #[test]
    fn legacy_store_migrates_to_current_without_loss() -> Result<()> {
        let mut store = legacy_store()?;
        insert_legacy_items(&store.conn)?;

        let status = store.schema_status()?;
        assert_eq!(status.current_version, Some(SchemaVersion::new(1, 0, 1)));
        assert!(status.inferred_from_legacy);
        assert_eq!(status.pending_versions.len(), 3);

        store.migrate()?;
        assert_eq!(
            store.schema_status()?.current_version,
            Some(current_generation().version)
        );
        for kind in RecordKind::ALL {
            assert_eq!(store.count(*kind)?, 1, "{kind}");
        }

        let reads = store.fetch(&Query::new(RecordKind::Read))?;
        let Some(Record::Read(read)) = reads.into_iter().next() else {
            return Err(anyhow!("migrated read item not found"));
        };
        assert_eq!(read.author.as_deref(), Some("Roger Fisher"));
        assert_eq!(read.info.notes, None);
        assert!(read.completed().is_some());

        let days = store.journals_on(DayKey::from_parts(2025, 1, 22)?)?;
        assert_eq!(days.len(), 1);
        assert_eq!(days[0].entries().len(), 2);
        assert!(days[0].keywords().contains("i/o"));
        assert!(days[0].validate().is_ok());

        let on_day = Query::new(RecordKind::Journal)
            .filtered(Filter::Eq(Field::When, 20_250_122_i64.into()));
        let hits = store.fetch(&on_day)?;
        assert_eq!(hits.len(), 1);
        Ok(())
    }

    // Test IDs: TMIG-004
    #[test]
    fn migration_count_matches_direct_insert() -> Result<()> {
        let mut legacy = legacy_store()?;
        insert_legacy_items(&legacy.conn)?;
        legacy.migrate()?;

        let mut direct = SqliteStore::open(Path::new(":memory:"))?;
        direct.migrate()?;
        for kind in RecordKind::ALL {
            for record in legacy.fetch(&Query::new(*kind))? {
                direct.insert(&record)?;
            }
        }
        for kind in RecordKind::ALL {
            assert_eq!(legacy.count(*kind)?, direct.count(*kind)?);
            let query = Query::new(*kind);
            assert_eq!(legacy.fetch(&query)?, direct.fetch(&query)?);
        }
        Ok(())
    }

    // Test IDs: TMIG-005
    #[test]
    fn migrate_twice_is_a_no_op() -> Result<()> {
        let mut store = legacy_store()?;
        insert_legacy_items(&store.conn)?;
        store.migrate()?;
        let before = journal_snapshot(&store.conn)?;
        let tags = tag_count(&store.conn)?;

        store.migrate()?;
        assert_eq!(journal_snapshot(&store.conn)?, before);
        assert_eq!(tag_count(&store.conn)?, tags);
        Ok(())
    }

    // Test IDs: TMIG-006
    #[test]
    fn reapplying_custom_stage_leaves_data_unchanged() -> Result<()> {
        let mut store = legacy_store()?;
        insert_legacy_items(&store.conn)?;
        store.migrate()?;
        let before = journal_snapshot(&store.conn)?;

        let Some(stage) = stage_for(SchemaVersion::new(3, 0, 0), SchemaVersion::new(4, 0, 0)) else {
            return Err(anyhow!("custom stage missing"));
        };
        apply_stage(&mut store.conn, stage)?;

        assert_eq!(journal_snapshot(&store.conn)?, before);
        assert_eq!(
            store.schema_status()?.current_version,
            Some(current_generation().version)
        );
        Ok(())
    }

    // Test IDs: TMIG-007
    #[test]
    fn newer_generation_tag_is_refused() -> Result<()> {
        let mut store = SqliteStore::open(Path::new(":memory:"))?;
        store.migrate()?;
        record_generation(&store.conn, SchemaVersion::new(9, 0, 0))?;

        let err = match store.migrate() {
            Ok(_) => return Err(anyhow!("expected migration to refuse a newer generation")),
            Err(err) => err,
        };
        assert!(matches!(
            err.downcast_ref::<SchemaError>(),
            Some(SchemaError::NewerGeneration { .. })
        ));
        Ok(())
    }

    // Test IDs: TMIG-008
    #[test]
    fn unknown_untagged_shape_is_refused() -> Result<()> {
        let mut store = SqliteStore::open(Path::new(":memory:"))?;
        store.conn.execute_batch(
            "CREATE TABLE read_items(id TEXT PRIMARY KEY, headline TEXT NOT NULL);",
        )?;

        let err = match store.migrate() {
            Ok(_) => return Err(anyhow!("expected migration to fail on an unknown shape")),
            Err(err) => err,
        };
        assert!(matches!(
            err.downcast_ref::<SchemaError>(),
            Some(SchemaError::UnrecognizedLegacyShape(_))
        ));
        Ok(())
    }

    // Test IDs: TMIG-009
    #[test]
    fn unregistered_tag_is_refused() -> Result<()> {
        let mut store = SqliteStore::open(Path::new(":memory:"))?;
        store.migrate()?;
        record_generation(&store.conn, SchemaVersion::new(2, 5, 0))?;

        let err = match store.migrate() {
            Ok(_) => return Err(anyhow!("expected migration to refuse an unregistered tag")),
            Err(err) => err,
        };
        assert!(matches!(
            err.downcast_ref::<SchemaError>(),
            Some(SchemaError::UnrecognizedGeneration(_))
        ));
        Ok(())
    }

    // Test IDs: TMIG-010
    #[test]
    fn failed_stage_leaves_store_untouched() -> Result<()> {
        let mut store = legacy_store()?;
        store.conn.execute(
            "INSERT INTO journal_items(id, year, month, day, entries)
             VALUES (?1, 2025, 2, 30, '[]')",
            params![ulid::Ulid::new().to_string()],
        )?;

        assert!(store.migrate().is_err());
        let status = store.schema_status()?;
        assert_eq!(status.current_version, Some(SchemaVersion::new(3, 0, 0)));
        let columns = table_columns(&store.conn, "journal_items")?;
        assert!(columns.contains(&"year".to_string()));
        assert!(!table_exists(&store.conn, "journal_items__next")?);
        Ok(())
    }

    // Test IDs: TMIG-011
    #[test]
    fn migrated_offset_timestamps_sort_like_decoded_values() -> Result<()> {
        let mut store = legacy_store()?;
        for (title, completed) in [
            ("Offset", "2024-01-02T03:04:05+02:00"),
            ("Zulu", "2024-01-02T02:00:00Z"),
        ] {
            store.conn.execute(
                "INSERT INTO read_items(id, created, title, format, started, completed)
                 VALUES (?1, ?2, ?3, 'book', ?2, ?2)",
                params![ulid::Ulid::new().to_string(), completed, title],
            )?;
        }
        store.migrate()?;

        let all = store.fetch(&Query::new(RecordKind::Read))?;
        let newest = Query::new(RecordKind::Read)
            .sorted(SortKey::descending(Field::Completed))
            .limited(1);
        let early = Query::new(RecordKind::Read).filtered(Filter::Lt(
            Field::Completed,
            datetime!(2024-01-02 01:30 UTC).into(),
        ));
        for query in [newest, early] {
            assert_eq!(store.fetch(&query)?, query.apply(all.clone()));
        }

        let stored: Vec<String> = {
            let mut stmt =
                store.conn.prepare("SELECT completed FROM read_items ORDER BY completed")?;
            let rows = stmt.query_map([], |row| row.get(0))?;
            rows.collect::<rusqlite::Result<_>>()?
        };
        assert_eq!(
            stored,
            vec![
                "2024-01-02T01:04:05.000000000Z".to_string(),
                "2024-01-02T02:00:00.000000000Z".to_string(),
            ]
        );
        Ok(())
    }

    #[test]
    fn lightweight_stage_fills_defaults_for_added_columns() -> Result<()> {
        let mut store = legacy_store()?;
        insert_legacy_items(&store.conn)?;
        store.migrate()?;

        let listens = store.fetch(&Query::new(RecordKind::Listen))?;
        let Some(listen) = listens.first().and_then(Record::as_consumable) else {
            return Err(anyhow!("migrated listen item not found"));
        };
        assert_eq!(listen.info().notes, None);
        assert_eq!(listen.info().rating, inout_core::Rating::Great);
        Ok(())
    }
}
