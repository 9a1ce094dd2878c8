use std::path::{Path, PathBuf};

use anyhow::{anyhow, Result};
use inout_core::import::{import_items, import_journal};
use inout_core::{
    DayKey, EntryId, Field, Filter, JournalEntry, JournalItem, Progress, Query, Record, RecordId,
    RecordKind, SchemaVersion, SortKey,
};
use inout_store_sqlite::{
    DayMerge, IntegrityReport, JournalMatch, SchemaError, SchemaStatus, SqliteStore,
};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tracing_subscriber::EnvFilter;

mod config;

pub use config::{InOutConfig, DB_PATH_ENV, LOG_FILTER_ENV, RECENT_LIMIT_ENV};

/// Why the store could not be made ready. Nothing else is reported this way.
#[derive(Debug, thiserror::Error)]
pub enum SetupFailure {
    #[error("failed to open store at {}", path.display())]
    Open {
        path: PathBuf,
        #[source]
        source: anyhow::Error,
    },
    #[error("failed to bring store to the current generation")]
    Migration(#[source] anyhow::Error),
}

impl SetupFailure {
    /// The typed migration failure, when there is one.
    #[must_use]
    pub fn schema_error(&self) -> Option<&SchemaError> {
        match self {
            Self::Migration(source) => source.downcast_ref::<SchemaError>(),
            Self::Open { .. } => None,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ImportSummary {
    /// Records the normalizer produced from the payload.
    pub parsed: usize,
    /// Records written as new rows, including new journal days.
    pub inserted: usize,
    /// Imported journal days that gained entries on a day already stored,
    /// even an empty one.
    pub merged_days: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct YearGroup {
    pub year: i32,
    pub items: Vec<Record>,
}

/// Install a global `fmt` subscriber filtered by `filter`.
///
/// Returns `false` when a subscriber was already installed. An invalid filter
/// falls back to `info`.
pub fn init_tracing(filter: &str) -> bool {
    let env_filter = EnvFilter::try_new(filter).unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(env_filter).try_init().is_ok()
}

pub struct InOutApi {
    store: SqliteStore,
    config: InOutConfig,
}

impl InOutApi {
    /// Open the configured database and migrate it to the current generation.
    ///
    /// # Errors
    /// Returns [`SetupFailure::Open`] when the database cannot be opened and
    /// [`SetupFailure::Migration`] when it cannot be migrated.
    pub fn open(config: InOutConfig) -> Result<Self, SetupFailure> {
        let mut store = SqliteStore::open(&config.db_path).map_err(|source| SetupFailure::Open {
            path: config.db_path.clone(),
            source,
        })?;
        let version = store.migrate().map_err(SetupFailure::Migration)?;
        tracing::info!(path = %config.db_path.display(), version = %version, "store ready");
        Ok(Self { store, config })
    }

    #[must_use]
    pub fn config(&self) -> &InOutConfig {
        &self.config
    }

    /// # Errors
    /// Returns an error when the schema tables cannot be read.
    pub fn schema_status(&self) -> Result<SchemaStatus> {
        self.store.schema_status()
    }

    /// # Errors
    /// Returns an error when the integrity checks fail to run.
    pub fn integrity_check(&self) -> Result<IntegrityReport> {
        self.store.integrity_check()
    }

    /// # Errors
    /// Returns an error when the backup cannot be written.
    pub fn backup(&self, out_file: &Path) -> Result<()> {
        self.store.backup_database(out_file)
    }

    /// Replace the store's contents with a backup and migrate the result.
    ///
    /// # Errors
    /// Returns an error when the restore or the follow-up migration fails.
    pub fn restore(&mut self, in_file: &Path) -> Result<SchemaVersion> {
        self.store.restore_database(in_file)
    }

    /// Normalize an export payload for `kind` and store it.
    ///
    /// Each journal day is merged into the stored record for that day in one
    /// transaction, so a day that already exists gains the imported entries
    /// instead of a second record. Entries already present on that day (same
    /// text and tags) are not added again.
    ///
    /// # Errors
    /// Returns an error when writing to the store fails. Malformed payloads are
    /// not errors; they import nothing.
    pub fn import(&mut self, kind: RecordKind, raw: &[u8]) -> Result<ImportSummary> {
        let summary = if kind == RecordKind::Journal {
            self.import_journal_days(raw)?
        } else {
            let records = import_items(kind, raw);
            let inserted = self.store.insert_all(&records)?;
            ImportSummary {
                parsed: records.len(),
                inserted,
                merged_days: 0,
            }
        };
        tracing::info!(
            kind = kind.as_str(),
            parsed = summary.parsed,
            inserted = summary.inserted,
            merged_days = summary.merged_days,
            "import finished"
        );
        Ok(summary)
    }

    fn import_journal_days(&mut self, raw: &[u8]) -> Result<ImportSummary> {
        let days = import_journal(raw);
        let mut summary = ImportSummary {
            parsed: days.len(),
            ..ImportSummary::default()
        };

        for day in &days {
            match self.store.merge_journal_day(day)? {
                DayMerge::Created => summary.inserted += 1,
                DayMerge::Merged => summary.merged_days += 1,
                DayMerge::Unchanged => {}
            }
        }
        Ok(summary)
    }

    /// # Errors
    /// Returns an error when the record is invalid or cannot be written.
    pub fn insert(&mut self, record: &Record) -> Result<()> {
        self.store.insert(record)
    }

    /// # Errors
    /// Returns an error when the record is invalid, missing or cannot be written.
    pub fn update(&mut self, record: &Record) -> Result<()> {
        self.store.update(record)
    }

    /// # Errors
    /// Returns an error when the delete fails.
    pub fn delete(&mut self, kind: RecordKind, id: RecordId) -> Result<bool> {
        self.store.delete(kind, id)
    }

    /// # Errors
    /// Returns an error when the lookup fails.
    pub fn get(&self, kind: RecordKind, id: RecordId) -> Result<Option<Record>> {
        self.store.get(kind, id)
    }

    /// Recently completed items, newest first, up to the configured limit.
    ///
    /// # Errors
    /// Returns an error when `kind` is not a consumable kind or the query fails.
    pub fn recent(&self, kind: RecordKind) -> Result<Vec<Record>> {
        require_consumable(kind)?;
        self.store.fetch(
            &Query::new(kind)
                .filtered(Filter::NotNull(Field::Completed))
                .sorted(SortKey::descending(Field::Completed))
                .limited(self.config.effective_recent_limit()),
        )
    }

    /// Started but not completed items, longest running first.
    ///
    /// # Errors
    /// Returns an error when `kind` is not a consumable kind or the query fails.
    pub fn in_progress(&self, kind: RecordKind) -> Result<Vec<Record>> {
        require_consumable(kind)?;
        self.store.fetch(
            &Query::new(kind)
                .filtered(Filter::NotNull(Field::Started))
                .filtered(Filter::IsNull(Field::Completed))
                .sorted(SortKey::ascending(Field::Started)),
        )
    }

    /// Items not started yet, newest first.
    ///
    /// # Errors
    /// Returns an error when `kind` is not a consumable kind or the query fails.
    pub fn backlog(&self, kind: RecordKind) -> Result<Vec<Record>> {
        require_consumable(kind)?;
        self.store.fetch(
            &Query::new(kind)
                .filtered(Filter::IsNull(Field::Started))
                .filtered(Filter::IsNull(Field::Completed))
                .sorted(SortKey::descending(Field::Created)),
        )
    }

    /// Completed items grouped by the UTC year of completion, newest year
    /// first and newest completion first within a year.
    ///
    /// # Errors
    /// Returns an error when `kind` is not a consumable kind or the query fails.
    pub fn history_by_year(&self, kind: RecordKind) -> Result<Vec<YearGroup>> {
        require_consumable(kind)?;
        let completed = self.store.fetch(
            &Query::new(kind)
                .filtered(Filter::NotNull(Field::Completed))
                .sorted(SortKey::descending(Field::Completed)),
        )?;

        let mut groups: Vec<YearGroup> = Vec::new();
        for record in completed {
            let Some(year) = record
                .as_consumable()
                .and_then(|item| item.completed())
                .map(OffsetDateTime::year)
            else {
                continue;
            };
            match groups.last_mut() {
                Some(group) if group.year == year => group.items.push(record),
                _ => groups.push(YearGroup {
                    year,
                    items: vec![record],
                }),
            }
        }
        Ok(groups)
    }

    /// Items whose title, subtitle or recommender contains `text`.
    ///
    /// # Errors
    /// Returns an error when `kind` is not a consumable kind or the query fails.
    pub fn search_items(&self, kind: RecordKind, text: &str) -> Result<Vec<Record>> {
        require_consumable(kind)?;
        let needle = text.trim();
        if needle.is_empty() {
            return Ok(Vec::new());
        }
        self.store.fetch(
            &Query::new(kind)
                .filtered(Filter::Or(vec![
                    Filter::Contains(Field::Title, needle.to_string()),
                    Filter::Contains(Field::Subtitle, needle.to_string()),
                    Filter::Contains(Field::Recommender, needle.to_string()),
                ]))
                .sorted(SortKey::ascending(Field::Completed)),
        )
    }

    /// Toggle an item one step along its lifecycle and persist it.
    ///
    /// # Errors
    /// Returns an error when the item does not exist or cannot be written.
    pub fn advance_progress(
        &mut self,
        kind: RecordKind,
        id: RecordId,
        now: OffsetDateTime,
    ) -> Result<Progress> {
        require_consumable(kind)?;
        let mut record = self
            .store
            .get(kind, id)?
            .ok_or_else(|| anyhow!("no {} record with id {id}", kind.as_str()))?;
        let progress = record
            .as_consumable_mut()
            .map(|item| item.advance_progress(now))
            .ok_or_else(|| anyhow!("{} records have no progress", kind.as_str()))?;
        self.store.update(&record)?;
        Ok(progress)
    }

    /// The day's journal, created empty if it does not exist yet.
    ///
    /// # Errors
    /// Returns an error when the day cannot be resolved.
    pub fn journal_for(&mut self, when: DayKey) -> Result<JournalItem> {
        self.store.resolve_journal(when)
    }

    /// # Errors
    /// Returns an error when the day cannot be resolved or saved.
    pub fn add_entry(&mut self, when: DayKey, entry: JournalEntry) -> Result<EntryId> {
        let mut day = self.store.resolve_journal(when)?;
        let id = day.push_entry(entry);
        self.store.save_journal(&mut day)?;
        Ok(id)
    }

    /// # Errors
    /// Returns an error when the entry does not exist on that day or the save fails.
    pub fn edit_entry(&mut self, when: DayKey, id: EntryId, text: &str) -> Result<()> {
        let mut day = self.store.resolve_journal(when)?;
        day.edit_entry(id, text)?;
        self.store.save_journal(&mut day)
    }

    /// Returns whether an entry was removed.
    ///
    /// # Errors
    /// Returns an error when the day cannot be resolved or saved.
    pub fn delete_entry(&mut self, when: DayKey, id: EntryId) -> Result<bool> {
        let mut day = self.store.resolve_journal(when)?;
        if day.remove_entry(id).is_none() {
            return Ok(false);
        }
        self.store.save_journal(&mut day)?;
        Ok(true)
    }

    /// # Errors
    /// Returns an error when either position is out of range or the save fails.
    pub fn move_entry(&mut self, when: DayKey, from: usize, to: usize) -> Result<()> {
        let mut day = self.store.resolve_journal(when)?;
        day.move_entry(from, to)?;
        self.store.save_journal(&mut day)
    }

    /// # Errors
    /// Returns an error when the search query fails.
    pub fn search_journal(&self, query: &str) -> Result<Vec<JournalMatch>> {
        self.store.search_journal(query)
    }
}

fn require_consumable(kind: RecordKind) -> Result<()> {
    if kind.is_consumable() {
        Ok(())
    } else {
        Err(anyhow!("{} is not a consumable kind", kind.as_str()))
    }
}
