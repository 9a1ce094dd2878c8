use std::collections::BTreeSet;
use std::fmt::{Display, Formatter};

use serde::{Deserialize, Deserializer, Serialize};
use time::{Date, Month};

use crate::query::{Field, Filter};
use crate::{EntryId, ModelError, RecordId};

/// Calendar day encoded as `year * 10000 + month * 100 + day`, e.g. `20250122`.
///
/// Used as the lookup key for journal items so that a day can be matched
/// with exact integer equality.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(transparent)]
pub struct DayKey(i32);

impl DayKey {
    #[must_use]
    pub fn from_date(date: Date) -> Self {
        Self(
            date.year() * 10_000 + i32::from(u8::from(date.month())) * 100 + i32::from(date.day()),
        )
    }

    /// # Errors
    /// Returns [`ModelError::InvalidDay`] when the parts do not name a real calendar day.
    pub fn from_parts(year: i64, month: i64, day: i64) -> Result<Self, ModelError> {
        let invalid = || ModelError::InvalidDay(format!("{year}-{month}-{day}"));
        let year = i32::try_from(year).map_err(|_| invalid())?;
        let month = u8::try_from(month)
            .ok()
            .and_then(|m| Month::try_from(m).ok())
            .ok_or_else(invalid)?;
        let day = u8::try_from(day).map_err(|_| invalid())?;
        let date = Date::from_calendar_date(year, month, day).map_err(|_| invalid())?;
        Ok(Self::from_date(date))
    }

    /// # Errors
    /// Returns [`ModelError::InvalidDay`] when the encoded value is not a real calendar day.
    pub fn from_value(value: i64) -> Result<Self, ModelError> {
        if value <= 0 {
            return Err(ModelError::InvalidDay(value.to_string()));
        }
        Self::from_parts(value / 10_000, (value / 100) % 100, value % 100)
    }

    #[must_use]
    pub fn value(self) -> i32 {
        self.0
    }

    #[must_use]
    pub fn year(self) -> i32 {
        self.0 / 10_000
    }

    /// # Errors
    /// Returns [`ModelError::InvalidDay`] when the key was not built from a real date.
    pub fn to_date(self) -> Result<Date, ModelError> {
        let invalid = || ModelError::InvalidDay(self.0.to_string());
        let month = u8::try_from((self.0 / 100) % 100)
            .ok()
            .and_then(|m| Month::try_from(m).ok())
            .ok_or_else(invalid)?;
        let day = u8::try_from(self.0 % 100).map_err(|_| invalid())?;
        Date::from_calendar_date(self.year(), month, day).map_err(|_| invalid())
    }
}

impl Display for DayKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{:04}-{:02}-{:02}",
            self.year(),
            (self.0 / 100) % 100,
            self.0 % 100
        )
    }
}

impl From<Date> for DayKey {
    fn from(date: Date) -> Self {
        Self::from_date(date)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct JournalEntry {
    #[serde(default)]
    pub id: EntryId,
    pub text: String,
    #[serde(default, deserialize_with = "null_as_empty")]
    pub tags: Vec<String>,
}

fn null_as_empty<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<String>, D::Error> {
    Ok(Option::<Vec<String>>::deserialize(deserializer)?.unwrap_or_default())
}

impl JournalEntry {
    #[must_use]
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            id: EntryId::new(),
            text: text.into(),
            tags: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_tags(mut self, tags: Vec<String>) -> Self {
        self.tags = tags;
        self
    }

    /// Case-insensitive substring match against the entry text.
    #[must_use]
    pub fn matches(&self, query: &str) -> bool {
        self.text.to_lowercase().contains(&query.to_lowercase())
    }
}

/// Lowercased, de-duplicated, space-joined set of every whitespace token longer
/// than two characters across all entry texts.
#[must_use]
pub fn compute_keywords(entries: &[JournalEntry]) -> String {
    let words: BTreeSet<String> = entries
        .iter()
        .flat_map(|entry| entry.text.split_whitespace())
        .filter(|token| token.chars().count() > 2)
        .map(str::to_lowercase)
        .collect();
    words.into_iter().collect::<Vec<_>>().join(" ")
}

/// All entries for one calendar day.
///
/// `keywords` is derived from `entries`; the mutators below keep it current.
/// Callers that edit through [`JournalItem::entries_mut`] must follow up with
/// [`JournalItem::update_keywords`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JournalItem {
    pub id: RecordId,
    pub when: DayKey,
    entries: Vec<JournalEntry>,
    #[serde(default)]
    keywords: String,
}

impl JournalItem {
    #[must_use]
    pub fn new(when: DayKey) -> Self {
        Self::with_entries(when, Vec::new())
    }

    #[must_use]
    pub fn with_entries(when: DayKey, entries: Vec<JournalEntry>) -> Self {
        let keywords = compute_keywords(&entries);
        Self {
            id: RecordId::new(),
            when,
            entries,
            keywords,
        }
    }

    /// Rebuild an item exactly as persisted, keywords included.
    #[must_use]
    pub fn from_parts(
        id: RecordId,
        when: DayKey,
        entries: Vec<JournalEntry>,
        keywords: String,
    ) -> Self {
        Self {
            id,
            when,
            entries,
            keywords,
        }
    }

    #[must_use]
    pub fn entries(&self) -> &[JournalEntry] {
        &self.entries
    }

    pub fn entries_mut(&mut self) -> &mut Vec<JournalEntry> {
        &mut self.entries
    }

    #[must_use]
    pub fn keywords(&self) -> &str {
        &self.keywords
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Recompute the keyword index. Returns whether it changed.
    pub fn update_keywords(&mut self) -> bool {
        let keywords = compute_keywords(&self.entries);
        if keywords == self.keywords {
            return false;
        }
        self.keywords = keywords;
        true
    }

    pub fn push_entry(&mut self, entry: JournalEntry) -> EntryId {
        let id = entry.id;
        self.entries.push(entry);
        self.update_keywords();
        id
    }

    /// # Errors
    /// Returns [`ModelError::Validation`] when no entry has the given id.
    pub fn edit_entry(&mut self, id: EntryId, text: impl Into<String>) -> Result<(), ModelError> {
        let entry = self
            .entries
            .iter_mut()
            .find(|entry| entry.id == id)
            .ok_or_else(|| ModelError::Validation(format!("no journal entry {id}")))?;
        entry.text = text.into();
        self.update_keywords();
        Ok(())
    }

    pub fn remove_entry(&mut self, id: EntryId) -> Option<JournalEntry> {
        let index = self.entries.iter().position(|entry| entry.id == id)?;
        let removed = self.entries.remove(index);
        self.update_keywords();
        Some(removed)
    }

    /// Move the entry at `from` so that it ends up at index `to`.
    ///
    /// # Errors
    /// Returns [`ModelError::Validation`] when either index is out of range.
    pub fn move_entry(&mut self, from: usize, to: usize) -> Result<(), ModelError> {
        let len = self.entries.len();
        if from >= len || to >= len {
            return Err(ModelError::Validation(format!(
                "cannot move entry {from} to {to} in a day with {len} entries"
            )));
        }
        let entry = self.entries.remove(from);
        self.entries.insert(to, entry);
        self.update_keywords();
        Ok(())
    }

    /// Append another day's entries, as done when merging duplicates.
    pub fn absorb(&mut self, other: JournalItem) {
        self.entries.extend(other.entries);
        self.update_keywords();
    }

    pub fn matching_entries<'a>(
        &'a self,
        query: &'a str,
    ) -> impl Iterator<Item = &'a JournalEntry> {
        self.entries.iter().filter(move |entry| entry.matches(query))
    }

    /// Coarse pre-filter selecting days whose keyword index contains `query`.
    /// Entry-level matches are recomputed with [`JournalItem::matching_entries`].
    #[must_use]
    pub fn search_filter(query: &str) -> Filter {
        Filter::Contains(Field::Keywords, query.to_string())
    }

    /// # Errors
    /// Returns [`ModelError::Validation`] when the keyword index is stale, or
    /// [`ModelError::InvalidDay`] when `when` does not name a real day.
    pub fn validate(&self) -> Result<(), ModelError> {
        self.when.to_date()?;
        if self.keywords != compute_keywords(&self.entries) {
            return Err(ModelError::Validation(format!(
                "keywords for {} are stale relative to entries",
                self.when
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;
    use time::macros::date;

    use super::*;

    fn sample_day() -> JournalItem {
        let entries = vec![
            JournalEntry::new("Worked on iOS I/O").with_tags(vec!["IO".to_string()]),
            JournalEntry::new("Taxied Remy to/from school"),
            JournalEntry::new("Listened to Jon Bishop set, nostalgic!"),
        ];
        JournalItem::with_entries(DayKey::from_date(date!(2025 - 01 - 23)), entries)
    }

    #[test]
    fn day_key_encodes_year_month_day() -> Result<(), ModelError> {
        let key = DayKey::from_date(date!(2025 - 01 - 22));
        assert_eq!(key.value(), 20_250_122);
        assert_eq!(key.to_string(), "2025-01-22");
        assert_eq!(key.to_date()?, date!(2025 - 01 - 22));
        assert_eq!(DayKey::from_parts(2025, 1, 22)?, key);
        assert_eq!(DayKey::from_value(20_250_122)?, key);
        Ok(())
    }

    #[test]
    fn day_key_rejects_impossible_days() {
        assert!(DayKey::from_parts(2025, 2, 30).is_err());
        assert!(DayKey::from_parts(2025, 13, 1).is_err());
        assert!(DayKey::from_value(20_251_301).is_err());
        assert!(DayKey::from_value(0).is_err());
    }

    #[test]
    fn keywords_drop_short_tokens_and_lowercase() {
        let keywords = compute_keywords(&[JournalEntry::new("Worked on iOS I/O")]);
        let words: Vec<&str> = keywords.split(' ').collect();

        assert!(words.contains(&"worked"));
        assert!(words.contains(&"i/o"));
        assert!(words.contains(&"ios"));
        assert!(!words.contains(&"on"));
        assert!(!words.contains(&"iOS"));
    }

    #[test]
    fn keywords_are_deduplicated_across_entries() {
        let keywords = compute_keywords(&[
            JournalEntry::new("More work on iOS"),
            JournalEntry::new("more WORK"),
        ]);
        assert_eq!(keywords, "ios more work");
    }

    #[test]
    fn token_length_counts_characters() {
        assert_eq!(compute_keywords(&[JournalEntry::new("été ça")]), "été");
    }

    #[test]
    fn update_keywords_reports_change_only_once() {
        let mut item = JournalItem::new(DayKey::from_date(date!(2025 - 01 - 23)));
        item.entries_mut().push(JournalEntry::new("Wednesday morning shenanigans"));

        assert!(item.update_keywords());
        assert!(!item.update_keywords());
        assert_eq!(item.keywords(), "morning shenanigans wednesday");
    }

    #[test]
    fn mutators_keep_keywords_current() -> Result<(), ModelError> {
        let mut item = sample_day();
        let first = item.entries()[0].id;

        item.edit_entry(first, "Fixed the build")?;
        assert!(item.keywords().contains("build"));
        assert!(!item.keywords().contains("worked"));

        let removed = item.remove_entry(first);
        assert!(removed.is_some());
        assert!(!item.keywords().contains("build"));

        item.move_entry(1, 0)?;
        assert!(item.entries()[0].text.starts_with("Listened"));
        item.validate()
    }

    #[test]
    fn move_entry_rejects_out_of_range_indexes() {
        let mut item = sample_day();
        assert!(item.move_entry(0, 3).is_err());
        assert!(item.move_entry(5, 0).is_err());
    }

    #[test]
    fn matching_entries_are_case_insensitive() {
        let item = sample_day();
        let hits: Vec<&str> = item
            .matching_entries("JON")
            .map(|entry| entry.text.as_str())
            .collect();
        assert_eq!(hits, vec!["Listened to Jon Bishop set, nostalgic!"]);
    }

    #[test]
    fn legacy_entries_without_ids_get_fresh_ids() -> Result<(), serde_json::Error> {
        let entries: Vec<JournalEntry> =
            serde_json::from_str(r#"[{"text":"one","tags":null},{"text":"two","tags":["x"]}]"#)?;
        assert_eq!(entries.len(), 2);
        assert!(entries[0].tags.is_empty());
        assert_ne!(entries[0].id, entries[1].id);
        assert_eq!(entries[1].tags, vec!["x".to_string()]);
        Ok(())
    }

    proptest! {
        #[test]
        fn property_keywords_match_entries_after_any_mutation(
            texts in proptest::collection::vec("[A-Za-z/ ]{0,24}", 0..6),
            edits in proptest::collection::vec((0usize..6, "[A-Za-z ]{0,12}"), 0..6),
        ) {
            let mut item = JournalItem::new(DayKey::from_date(date!(2025 - 01 - 22)));
            for text in texts {
                item.push_entry(JournalEntry::new(text));
            }
            for (index, text) in edits {
                if let Some(id) = item.entries().get(index).map(|entry| entry.id) {
                    if text.len() % 2 == 0 {
                        prop_assert!(item.edit_entry(id, text).is_ok());
                    } else {
                        item.remove_entry(id);
                    }
                }
            }
            item.entries_mut().reverse();
            item.update_keywords();

            let expected = compute_keywords(item.entries());
            prop_assert_eq!(item.keywords(), expected.as_str());
            for word in item.keywords().split_whitespace() {
                prop_assert!(word.chars().count() > 2);
                prop_assert_eq!(word.to_lowercase(), word);
            }
        }

        #[test]
        fn property_day_key_order_matches_date_order(a in 0i32..3_000_000, b in 0i32..3_000_000) {
            let base = date!(1970 - 01 - 01);
            let left = base + time::Duration::days(i64::from(a) % 40_000);
            let right = base + time::Duration::days(i64::from(b) % 40_000);
            prop_assert_eq!(
                DayKey::from_date(left).cmp(&DayKey::from_date(right)),
                left.cmp(&right)
            );
        }
    }
}
