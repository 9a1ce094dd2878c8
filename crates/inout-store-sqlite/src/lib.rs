use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use inout_core::{
    current_generation, DayKey, Query, Record, RecordId, RecordKind, SchemaVersion, SortDirection,
};
use rusqlite::types::Value;
use rusqlite::{params, params_from_iter, Connection, DatabaseName};
use serde::{Deserialize, Serialize};

mod codec;
mod journal;
pub mod migrate;
mod pushdown;

pub use journal::{DayMerge, JournalMatch};
pub use migrate::{
    apply_stage, migration_stages, stage_for, MigrationStage, RowTransform, RowValues,
    SchemaError, SchemaStatus, StageKind,
};

pub struct SqliteStore {
    conn: Connection,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IntegrityReport {
    pub quick_check_ok: bool,
    pub quick_check_message: String,
    /// Days that still hold more than one journal record.
    pub duplicate_days: Vec<DayKey>,
    pub schema_status: SchemaStatus,
}

impl SqliteStore {
    /// Open the store file at `path` (or `":memory:"`).
    ///
    /// Records cannot be read or written until [`SqliteStore::migrate`] has
    /// brought the file to the current generation.
    ///
    /// # Errors
    /// Returns an error when the file cannot be opened or the connection
    /// settings are rejected.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("cannot open inout store {}", path.display()))?;
        let journal_mode: String = conn
            .pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))
            .context("cannot enable write-ahead logging")?;
        tracing::debug!(
            path = %path.display(),
            journal_mode = %journal_mode,
            "opened inout store"
        );
        conn.pragma_update(None, "foreign_keys", "ON")
            .context("cannot enable foreign keys")?;
        conn.busy_timeout(Duration::from_millis(5_000))
            .context("cannot set busy timeout")?;
        Ok(Self { conn })
    }

    /// Report the store's generation, the target generation and what is pending.
    /// Reads only.
    ///
    /// # Errors
    /// Returns an error when generation metadata cannot be read or the store
    /// does not match any known shape.
    pub fn schema_status(&self) -> Result<SchemaStatus> {
        migrate::schema_status(&self.conn)
    }

    /// Bring the store to the current generation.
    ///
    /// # Errors
    /// Returns an error when the store is newer than this build, cannot be
    /// placed on the generation chain, or a stage fails.
    pub fn migrate(&mut self) -> Result<SchemaVersion> {
        migrate::migrate(&mut self.conn)
    }

    /// Insert a new record.
    ///
    /// # Errors
    /// Returns an error when validation fails or the id already exists.
    pub fn insert(&mut self, record: &Record) -> Result<()> {
        insert_record(&self.conn, record)
    }

    /// Insert many records in one transaction. Returns how many were written.
    ///
    /// # Errors
    /// Returns an error, writing nothing, when any record fails to insert.
    pub fn insert_all(&mut self, records: &[Record]) -> Result<usize> {
        let tx = self
            .conn
            .transaction()
            .context("failed to start insert transaction")?;
        for record in records {
            insert_record(&tx, record)?;
        }
        tx.commit().context("failed to commit inserted records")?;
        Ok(records.len())
    }

    /// Overwrite an existing record.
    ///
    /// # Errors
    /// Returns an error when validation fails or no record has this id.
    pub fn update(&mut self, record: &Record) -> Result<()> {
        update_record(&self.conn, record)
    }

    /// # Errors
    /// Returns an error when the delete statement fails.
    pub fn delete(&mut self, kind: RecordKind, id: RecordId) -> Result<bool> {
        delete_record(&self.conn, kind, id)
    }

    /// # Errors
    /// Returns an error when the row cannot be read or decoded.
    pub fn get(&self, kind: RecordKind, id: RecordId) -> Result<Option<Record>> {
        let records = select_records(
            &self.conn,
            kind,
            "id = ?",
            vec![Value::Text(id.to_string())],
            "ORDER BY id ASC",
        )?;
        Ok(records.into_iter().next())
    }

    /// # Errors
    /// Returns an error when the count query fails.
    pub fn count(&self, kind: RecordKind) -> Result<usize> {
        let table = codec::descriptor(kind)?.table;
        let count: i64 = self
            .conn
            .query_row(
                &format!("SELECT COUNT(*) FROM {table}"),
                [],
                |row| row.get(0),
            )
            .with_context(|| format!("failed to count {table}"))?;
        usize::try_from(count).context("row count out of range")
    }

    /// Run `query`, pushing down to SQL what can be expressed there.
    ///
    /// When part of the filter has to be evaluated in memory, sort and limit
    /// are applied in memory too.
    ///
    /// # Errors
    /// Returns an error when the query fails or a row cannot be decoded.
    pub fn fetch(&self, query: &Query) -> Result<Vec<Record>> {
        let plan = pushdown::plan(query.kind, &query.filter)?;

        if !plan.is_exact() {
            let records = select_records(&self.conn, query.kind, &plan.clause, plan.params, "")?;
            let residual = Query {
                kind: query.kind,
                filter: plan.residual,
                sort: query.sort,
                limit: query.limit,
            };
            return Ok(residual.apply(records));
        }

        let sort_column = query
            .sort
            .and_then(|key| key.field.column(query.kind).map(|column| (column, key)));
        let mut tail = match sort_column {
            Some((column, key)) => {
                let direction = match key.direction {
                    SortDirection::Ascending => "ASC",
                    SortDirection::Descending => "DESC",
                };
                format!("ORDER BY {column} {direction}, id ASC")
            }
            None => "ORDER BY id ASC".to_string(),
        };
        let mut params = plan.params;
        if let Some(limit) = query.limit {
            tail.push_str(" LIMIT ?");
            params.push(Value::Integer(i64::try_from(limit).unwrap_or(i64::MAX)));
        }
        select_records(&self.conn, query.kind, &plan.clause, params, &tail)
    }

    /// Copy every generation of records into a standalone snapshot file.
    ///
    /// # Errors
    /// Returns an error when the snapshot directory or file cannot be written.
    pub fn backup_database(&self, out_file: &Path) -> Result<()> {
        if let Some(dir) = out_file.parent().filter(|dir| !dir.as_os_str().is_empty()) {
            fs::create_dir_all(dir)
                .with_context(|| format!("cannot create snapshot directory {}", dir.display()))?;
        }
        self.conn
            .backup(DatabaseName::Main, out_file, None)
            .with_context(|| format!("cannot write snapshot {}", out_file.display()))?;
        tracing::info!(path = %out_file.display(), "wrote store snapshot");
        Ok(())
    }

    /// Replace the store's contents with a snapshot, which may come from an
    /// older generation, and migrate it forward.
    ///
    /// # Errors
    /// Returns an error when the snapshot is missing or unreadable, or when it
    /// cannot be migrated (for example because it is from a newer generation).
    pub fn restore_database(&mut self, in_file: &Path) -> Result<SchemaVersion> {
        if !in_file.is_file() {
            return Err(anyhow!("no snapshot at {}", in_file.display()));
        }
        self.conn
            .restore(
                DatabaseName::Main,
                in_file,
                None::<fn(rusqlite::backup::Progress)>,
            )
            .with_context(|| format!("cannot restore snapshot {}", in_file.display()))?;
        let version = self.migrate()?;
        tracing::info!(
            path = %in_file.display(),
            version = %version,
            "restored store snapshot"
        );
        Ok(version)
    }

    /// Run the quick-check, duplicate-day and schema status health checks.
    ///
    /// # Errors
    /// Returns an error when any integrity check query fails.
    pub fn integrity_check(&self) -> Result<IntegrityReport> {
        let quick_check_message: String = self
            .conn
            .query_row("PRAGMA quick_check", [], |row| row.get::<_, String>(0))
            .context("failed to run PRAGMA quick_check")?;

        let schema_status = self.schema_status()?;
        let is_current = schema_status.current_version == Some(current_generation().version);
        let duplicate_days = if is_current {
            journal::duplicate_days(&self.conn)?
        } else {
            Vec::new()
        };

        Ok(IntegrityReport {
            quick_check_ok: quick_check_message == "ok",
            quick_check_message,
            duplicate_days,
            schema_status,
        })
    }
}

fn insert_record(conn: &Connection, record: &Record) -> Result<()> {
    record
        .validate()
        .map_err(|err| anyhow!("record validation failed: {err}"))?;

    let table = codec::descriptor(record.kind())?.table;
    let columns = codec::encode(record)?;
    let names: Vec<&str> = columns.iter().map(|(name, _)| *name).collect();
    let placeholders = vec!["?"; columns.len()].join(", ");
    conn.execute(
        &format!(
            "INSERT INTO {table} ({}) VALUES ({placeholders})",
            names.join(", ")
        ),
        params_from_iter(columns.into_iter().map(|(_, value)| value)),
    )
    .with_context(|| {
        format!(
            "failed to insert {} record {}",
            record.kind().as_str(),
            record.id()
        )
    })?;
    Ok(())
}

fn update_record(conn: &Connection, record: &Record) -> Result<()> {
    record
        .validate()
        .map_err(|err| anyhow!("record validation failed: {err}"))?;

    let table = codec::descriptor(record.kind())?.table;
    let columns: Vec<_> = codec::encode(record)?
        .into_iter()
        .filter(|(name, _)| *name != "id")
        .collect();
    let assignments: Vec<String> = columns
        .iter()
        .map(|(name, _)| format!("{name} = ?"))
        .collect();
    let mut values: Vec<Value> = columns.into_iter().map(|(_, value)| value).collect();
    values.push(Value::Text(record.id().to_string()));

    let changed = conn
        .execute(
            &format!("UPDATE {table} SET {} WHERE id = ?", assignments.join(", ")),
            params_from_iter(values),
        )
        .with_context(|| {
            format!(
                "failed to update {} record {}",
                record.kind().as_str(),
                record.id()
            )
        })?;
    if changed == 0 {
        return Err(anyhow!(
            "no {} record with id {}",
            record.kind().as_str(),
            record.id()
        ));
    }
    Ok(())
}

fn delete_record(conn: &Connection, kind: RecordKind, id: RecordId) -> Result<bool> {
    let table = codec::descriptor(kind)?.table;
    let deleted = conn
        .execute(
            &format!("DELETE FROM {table} WHERE id = ?1"),
            params![id.to_string()],
        )
        .with_context(|| format!("failed to delete {} record {id}", kind.as_str()))?;
    Ok(deleted > 0)
}

fn select_records(
    conn: &Connection,
    kind: RecordKind,
    clause: &str,
    params: Vec<Value>,
    tail: &str,
) -> Result<Vec<Record>> {
    let table = codec::descriptor(kind)?.table;
    let columns = codec::select_columns(kind)?;
    let mut stmt = conn
        .prepare(&format!("SELECT {columns} FROM {table} WHERE {clause} {tail}"))
        .with_context(|| format!("failed to prepare {table} query"))?;
    let mut rows = stmt
        .query(params_from_iter(params))
        .with_context(|| format!("failed to query {table}"))?;

    let mut records = Vec::new();
    while let Some(row) = rows.next()? {
        records.push(codec::decode(kind, row)?);
    }
    Ok(records)
}

#[cfg(test)]
mod tests {
    use inout_core::{
        Consumable, Field, FieldValue, Filter, ListenFormat, ListenItem, Platform, PlayItem,
        ReadFormat, ReadItem, SortKey, WatchFormat, WatchItem,
    };
    use time::macros::datetime;
    use time::{Duration, OffsetDateTime};
    use ulid::Ulid;

    use super::*;

    fn migrated_store() -> Result<SqliteStore> {
        let mut store = SqliteStore::open(Path::new(":memory:"))?;
        store.migrate()?;
        Ok(store)
    }

    fn base_time() -> OffsetDateTime {
        datetime!(2024-05-01 12:00 UTC)
    }

    fn seed_reads(store: &mut SqliteStore) -> Result<Vec<RecordId>> {
        let mut ids = Vec::new();
        for (offset, (title, author, tag)) in [
            ("Dune", Some("Frank Herbert"), "scifi"),
            ("Ulysses", Some("James Joyce"), "classic"),
            ("Été indien", None, "french"),
            ("Neuromancer", Some("William Gibson"), "scifi"),
        ]
        .into_iter()
        .enumerate()
        {
            let created = base_time() + Duration::days(i64::try_from(offset)?);
            let mut item = ReadItem::new(title, ReadFormat::Book, created);
            item.author = author.map(str::to_string);
            item.info.tags.insert(tag);
            if offset % 2 == 0 {
                item.info.set_started(Some(base_time()));
            }
            ids.push(item.info.id);
            store.insert(&item.into())?;
        }
        Ok(ids)
    }

    fn titles(records: &[Record]) -> Vec<String> {
        records
            .iter()
            .filter_map(Record::as_consumable)
            .map(|item| item.title().to_string())
            .collect()
    }

    // Test IDs: TDB-001
    #[test]
    fn insert_get_update_delete_round_trip() -> Result<()> {
        let mut store = migrated_store()?;
        let mut item = WatchItem::new("Anomalisa", WatchFormat::Film, base_time());
        item.director = Some("Charlie Kaufman".to_string());
        item.info.tags.insert("stop-motion");
        let id = item.info.id;
        store.insert(&item.clone().into())?;

        let Some(Record::Watch(stored)) = store.get(RecordKind::Watch, id)? else {
            return Err(anyhow!("inserted watch item not found"));
        };
        assert_eq!(stored, item);

        item.info.notes = Some("rewatch".to_string());
        item.advance_progress(base_time() + Duration::hours(2));
        store.update(&item.clone().into())?;
        let Some(Record::Watch(updated)) = store.get(RecordKind::Watch, id)? else {
            return Err(anyhow!("updated watch item not found"));
        };
        assert_eq!(updated.info.notes.as_deref(), Some("rewatch"));
        assert!(updated.completed().is_some());

        assert!(store.delete(RecordKind::Watch, id)?);
        assert!(!store.delete(RecordKind::Watch, id)?);
        assert!(store.get(RecordKind::Watch, id)?.is_none());
        Ok(())
    }

    // Test IDs: TDB-002
    #[test]
    fn update_of_missing_record_fails() -> Result<()> {
        let mut store = migrated_store()?;
        let item = PlayItem::new("Myst", Platform::Pc, base_time());
        assert!(store.update(&item.into()).is_err());
        Ok(())
    }

    // Test IDs: TDB-003
    #[test]
    fn invalid_records_are_rejected() -> Result<()> {
        let mut store = migrated_store()?;
        let mut item = ListenItem::new("Summer", ListenFormat::Song, base_time());
        item.info.link = Some(" ".to_string());
        assert!(store.insert(&item.into()).is_err());
        assert_eq!(store.count(RecordKind::Listen)?, 0);
        Ok(())
    }

    // Test IDs: TDB-004
    #[test]
    fn pushed_down_fetch_sorts_and_limits() -> Result<()> {
        let mut store = migrated_store()?;
        seed_reads(&mut store)?;

        let newest = store.fetch(
            &Query::new(RecordKind::Read)
                .sorted(SortKey::descending(Field::Created))
                .limited(2),
        )?;
        assert_eq!(titles(&newest), vec!["Neuromancer", "Été indien"]);

        let started = store.fetch(
            &Query::new(RecordKind::Read)
                .filtered(Filter::NotNull(Field::Started))
                .sorted(SortKey::ascending(Field::Title)),
        )?;
        assert_eq!(titles(&started), vec!["Dune", "Été indien"]);

        let by_author = store.fetch(
            &Query::new(RecordKind::Read)
                .filtered(Filter::Contains(Field::Subtitle, "GIBSON".to_string())),
        )?;
        assert_eq!(titles(&by_author), vec!["Neuromancer"]);
        Ok(())
    }

    // Test IDs: TDB-005
    #[test]
    fn residual_filters_match_in_memory_evaluation() -> Result<()> {
        let mut store = migrated_store()?;
        seed_reads(&mut store)?;
        let all = store.fetch(&Query::new(RecordKind::Read))?;
        let second_day = base_time() + Duration::days(1);

        let queries = [
            Query::new(RecordKind::Read).filtered(Filter::HasTag("scifi".to_string())),
            Query::new(RecordKind::Read)
                .filtered(Filter::Contains(Field::Title, "été".to_string()))
                .sorted(SortKey::descending(Field::Created)),
            Query::new(RecordKind::Read)
                .filtered(Filter::Or(vec![
                    Filter::HasTag("classic".to_string()),
                    Filter::IsNull(Field::Subtitle),
                ]))
                .sorted(SortKey::ascending(Field::Subtitle))
                .limited(1),
            Query::new(RecordKind::Read)
                .filtered(Filter::Eq(Field::Subtitle, "Frank Herbert".into()).negate())
                .filtered(Filter::Gte(Field::Created, second_day.into())),
            Query::new(RecordKind::Read).filtered(Filter::AnyOf(
                Field::Title,
                vec![FieldValue::from("Dune"), FieldValue::from("Ulysses")],
            )),
        ];
        for query in queries {
            assert_eq!(store.fetch(&query)?, query.apply(all.clone()), "{query:?}");
        }

        let scifi_only =
            Query::new(RecordKind::Read).filtered(Filter::HasTag("scifi".to_string()));
        let scifi = store.fetch(&scifi_only)?;
        assert_eq!(titles(&scifi).len(), 2);
        Ok(())
    }

    // Test IDs: TDB-006
    #[test]
    fn backup_and_restore_database_round_trip() -> Result<()> {
        let mut source = migrated_store()?;
        let ids = seed_reads(&mut source)?;

        let backup_file =
            std::env::temp_dir().join(format!("inout-backup-{}.sqlite3", Ulid::new()));
        source.backup_database(&backup_file)?;

        let mut target = SqliteStore::open(Path::new(":memory:"))?;
        target.restore_database(&backup_file)?;
        assert_eq!(target.count(RecordKind::Read)?, ids.len());
        assert!(target.get(RecordKind::Read, ids[0])?.is_some());

        fs::remove_file(&backup_file).with_context(|| {
            format!("failed to cleanup temp backup file {}", backup_file.display())
        })?;
        Ok(())
    }

    // Test IDs: TDB-007
    #[test]
    fn integrity_check_reports_clean_database() -> Result<()> {
        let store = migrated_store()?;
        let report = store.integrity_check()?;
        assert!(report.quick_check_ok);
        assert!(report.duplicate_days.is_empty());
        assert_eq!(
            report.schema_status.current_version,
            Some(current_generation().version)
        );
        Ok(())
    }

    // Test IDs: TDB-008
    #[test]
    fn file_backed_store_survives_reopen() -> Result<()> {
        let db_path =
            std::env::temp_dir().join(format!("inout-reopen-{}.sqlite3", Ulid::new()));
        let item = ListenItem::new("Interview", ListenFormat::Podcast, base_time());
        let id = item.info.id;
        {
            let mut store = SqliteStore::open(&db_path)?;
            store.migrate()?;
            store.insert(&item.into())?;
        }

        let mut reopened = SqliteStore::open(&db_path)?;
        reopened.migrate()?;
        assert!(reopened.get(RecordKind::Listen, id)?.is_some());
        drop(reopened);

        for suffix in ["", "-wal", "-shm"] {
            let path = std::path::PathBuf::from(format!("{}{suffix}", db_path.display()));
            if path.exists() {
                fs::remove_file(&path)
                    .with_context(|| format!("failed to cleanup temp db file {}", path.display()))?;
            }
        }
        Ok(())
    }
}
