use std::collections::BTreeSet;
use std::fmt::{Display, Formatter};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use ulid::Ulid;

pub mod import;
pub mod journal;
pub mod query;
pub mod schema;

pub use journal::{compute_keywords, DayKey, JournalEntry, JournalItem};
pub use query::{Field, FieldValue, Filter, Query, SortDirection, SortKey};
pub use schema::{
    current_generation, generation, list_generations, FieldSpec, GenerationDescriptor,
    KindDescriptor, SchemaVersion,
};

/// Glyph shown in place of a rating for items the user gave up on.
pub const ABANDONED_GLYPH: &str = "😴";

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum ModelError {
    #[error("validation error: {0}")]
    Validation(String),
    #[error("invalid calendar day: {0}")]
    InvalidDay(String),
    #[error("unknown record kind: {0}")]
    UnknownKind(String),
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct RecordId(pub Ulid);

impl RecordId {
    #[must_use]
    pub fn new() -> Self {
        Self(Ulid::new())
    }
}

impl Default for RecordId {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for RecordId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for RecordId {
    type Err = ModelError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Ulid::from_string(value)
            .map(Self)
            .map_err(|err| ModelError::Validation(format!("invalid record id {value}: {err}")))
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct EntryId(pub Ulid);

impl EntryId {
    #[must_use]
    pub fn new() -> Self {
        Self(Ulid::new())
    }
}

impl Default for EntryId {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for EntryId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Declares a closed enumeration with a stable storage key and a display label.
macro_rules! labeled_enum {
    (
        $(#[$meta:meta])*
        $name:ident {
            $($(#[$vmeta:meta])* $variant:ident => ($key:literal, $label:literal)),+ $(,)?
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
        pub enum $name {
            $($(#[$vmeta])* #[serde(rename = $key)] $variant),+
        }

        impl $name {
            pub const ALL: &'static [Self] = &[$(Self::$variant),+];

            #[must_use]
            pub fn as_str(self) -> &'static str {
                match self {
                    $(Self::$variant => $key),+
                }
            }

            #[must_use]
            pub fn label(self) -> &'static str {
                match self {
                    $(Self::$variant => $label),+
                }
            }

            #[must_use]
            pub fn parse(value: &str) -> Option<Self> {
                match value {
                    $($key => Some(Self::$variant),)+
                    _ => None,
                }
            }
        }

        impl Display for $name {
            fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.label())
            }
        }
    };
}

labeled_enum! {
    /// Record kinds known to the store, one table per kind.
    RecordKind {
        Read => ("read", "Reading"),
        Watch => ("watch", "Watching"),
        Listen => ("listen", "Listening"),
        Play => ("play", "Playing"),
        Journal => ("journal", "Journal"),
    }
}

impl RecordKind {
    pub const CONSUMABLES: &'static [Self] = &[Self::Read, Self::Watch, Self::Listen, Self::Play];

    #[must_use]
    pub fn is_consumable(self) -> bool {
        !matches!(self, Self::Journal)
    }
}

impl FromStr for RecordKind {
    type Err = ModelError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Self::parse(value).ok_or_else(|| ModelError::UnknownKind(value.to_string()))
    }
}

labeled_enum! {
    /// How much the user liked a consumed item. `Unrated` is stored as `none`.
    #[derive(Default)]
    Rating {
        #[default]
        Unrated => ("none", "None"),
        Bad => ("bad", "Bad"),
        Meh => ("meh", "Meh"),
        Ok => ("ok", "OK"),
        Good => ("good", "Good"),
        Great => ("great", "Great"),
    }
}

impl Rating {
    #[must_use]
    pub fn glyph(self) -> &'static str {
        match self {
            Self::Unrated => "🫥",
            Self::Bad => "🤮",
            Self::Meh => "😐",
            Self::Ok => "🙂",
            Self::Good => "😀",
            Self::Great => "🤩",
        }
    }
}

labeled_enum! {
    #[derive(Default)]
    ReadFormat {
        Article => ("article", "Article"),
        #[default]
        Book => ("book", "Book"),
        Paper => ("paper", "Paper"),
    }
}

labeled_enum! {
    #[derive(Default)]
    WatchFormat {
        Show => ("show", "Show"),
        #[default]
        Film => ("film", "Film"),
        Video => ("video", "Video"),
        Other => ("other", "Other"),
    }
}

labeled_enum! {
    #[derive(Default)]
    ListenFormat {
        Song => ("song", "Song"),
        Album => ("album", "Album"),
        Podcast => ("podcast", "Podcast"),
        #[default]
        Other => ("other", "Other"),
    }
}

labeled_enum! {
    #[derive(Default)]
    Platform {
        #[default]
        Pc => ("pc", "PC"),
        Tabletop => ("table", "Tabletop"),
        Mobile => ("mobile", "Mobile"),
        Switch => ("switch", "Switch"),
        N3ds => ("3ds", "3DS"),
        WiiU => ("wiiu", "WiiU"),
        Wii => ("wii", "Wii"),
        GameCube => ("cube", "GameCube"),
        N64 => ("n64", "N64"),
        GameBoy => ("gb", "GameBoy"),
        Dreamcast => ("dcast", "Dreamcast"),
        Ps1 => ("ps1", "PS1"),
        Ps2 => ("ps2", "PS2"),
        Ps3 => ("ps3", "PS3"),
        Ps4 => ("ps4", "PS4"),
        Ps5 => ("ps5", "PS5"),
        Vita => ("vita", "Vita"),
        Xbox => ("xbox", "XBOX"),
    }
}

/// Lifecycle of a consumable item, derived from its `started`/`completed` dates.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Progress {
    Unstarted,
    Started,
    Completed,
}

impl Progress {
    #[must_use]
    pub fn from_dates(started: Option<OffsetDateTime>, completed: Option<OffsetDateTime>) -> Self {
        match (started, completed) {
            (_, Some(_)) => Self::Completed,
            (Some(_), None) => Self::Started,
            (None, None) => Self::Unstarted,
        }
    }
}

/// Ordered set of free-text labels. Insertion order is kept for display;
/// equality ignores it.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(from = "Vec<String>", into = "Vec<String>")]
pub struct TagSet(Vec<String>);

impl TagSet {
    #[must_use]
    pub fn new() -> Self {
        Self(Vec::new())
    }

    /// Add a tag, ignoring blanks and duplicates. Returns whether the set changed.
    pub fn insert(&mut self, tag: impl Into<String>) -> bool {
        let tag = tag.into();
        let tag = tag.trim();
        if tag.is_empty() || self.contains(tag) {
            return false;
        }
        self.0.push(tag.to_string());
        true
    }

    pub fn remove(&mut self, tag: &str) -> bool {
        let before = self.0.len();
        self.0.retain(|existing| existing != tag);
        before != self.0.len()
    }

    #[must_use]
    pub fn contains(&self, tag: &str) -> bool {
        self.0.iter().any(|existing| existing == tag)
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(String::as_str)
    }

    #[must_use]
    pub fn as_slice(&self) -> &[String] {
        &self.0
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl PartialEq for TagSet {
    fn eq(&self, other: &Self) -> bool {
        self.iter().collect::<BTreeSet<_>>() == other.iter().collect::<BTreeSet<_>>()
    }
}

impl Eq for TagSet {}

impl From<Vec<String>> for TagSet {
    fn from(values: Vec<String>) -> Self {
        values.into_iter().collect()
    }
}

impl From<TagSet> for Vec<String> {
    fn from(tags: TagSet) -> Self {
        tags.0
    }
}

impl FromIterator<String> for TagSet {
    fn from_iter<I: IntoIterator<Item = String>>(iter: I) -> Self {
        let mut tags = Self::new();
        for tag in iter {
            tags.insert(tag);
        }
        tags
    }
}

/// Fields shared by every consumable kind.
///
/// `started` and `completed` are private so that no mutation can leave an
/// item completed without having been started.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ItemInfo {
    pub id: RecordId,
    #[serde(with = "time::serde::rfc3339")]
    pub created: OffsetDateTime,
    #[serde(default)]
    pub tags: TagSet,
    pub link: Option<String>,
    #[serde(with = "time::serde::rfc3339::option")]
    started: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    completed: Option<OffsetDateTime>,
    pub notes: Option<String>,
    #[serde(default)]
    pub rating: Rating,
    pub recommender: Option<String>,
}

impl ItemInfo {
    #[must_use]
    pub fn new(created: OffsetDateTime) -> Self {
        Self {
            id: RecordId::new(),
            created,
            tags: TagSet::new(),
            link: None,
            started: None,
            completed: None,
            notes: None,
            rating: Rating::Unrated,
            recommender: None,
        }
    }

    #[must_use]
    pub fn started(&self) -> Option<OffsetDateTime> {
        self.started
    }

    #[must_use]
    pub fn completed(&self) -> Option<OffsetDateTime> {
        self.completed
    }

    #[must_use]
    pub fn progress(&self) -> Progress {
        Progress::from_dates(self.started, self.completed)
    }

    /// Clearing `started` also clears `completed`.
    pub fn set_started(&mut self, started: Option<OffsetDateTime>) {
        self.started = started;
        if started.is_none() {
            self.completed = None;
        }
    }

    /// Completing an unstarted item starts it at the same instant.
    pub fn set_completed(&mut self, completed: Option<OffsetDateTime>) {
        if completed.is_some() && self.started.is_none() {
            self.started = completed;
        }
        self.completed = completed;
    }

    /// Set both dates at once, repairing a completed-but-unstarted pair.
    pub fn set_dates(
        &mut self,
        started: Option<OffsetDateTime>,
        completed: Option<OffsetDateTime>,
    ) {
        self.started = started.or(completed);
        self.completed = completed;
    }

    /// # Errors
    /// Returns [`ModelError::Validation`] when the progress invariant or link shape is violated.
    pub fn validate(&self) -> Result<(), ModelError> {
        if self.completed.is_some() && self.started.is_none() {
            return Err(ModelError::Validation(
                "completed MUST NOT be set while started is unset".to_string(),
            ));
        }
        if let Some(link) = &self.link {
            if link.trim().is_empty() {
                return Err(ModelError::Validation(
                    "link MUST be omitted rather than blank".to_string(),
                ));
            }
        }
        Ok(())
    }
}

/// Capabilities shared by the four consumable kinds.
pub trait Consumable {
    fn info(&self) -> &ItemInfo;
    fn info_mut(&mut self) -> &mut ItemInfo;
    fn title(&self) -> &str;
    fn subtitle(&self) -> Option<&str>;
    /// Whether the item is consumed across several sessions, so that it
    /// passes through the started state before completion.
    fn is_protracted(&self) -> bool;

    fn is_abandoned(&self) -> bool {
        false
    }

    fn id(&self) -> RecordId {
        self.info().id
    }

    fn created(&self) -> OffsetDateTime {
        self.info().created
    }

    fn link(&self) -> Option<&str> {
        self.info().link.as_deref()
    }

    fn started(&self) -> Option<OffsetDateTime> {
        self.info().started()
    }

    fn completed(&self) -> Option<OffsetDateTime> {
        self.info().completed()
    }

    fn progress(&self) -> Progress {
        self.info().progress()
    }

    fn rating_glyph(&self) -> &'static str {
        if self.is_abandoned() {
            ABANDONED_GLYPH
        } else {
            self.info().rating.glyph()
        }
    }

    /// Move the item one step along its lifecycle, the way a status toggle does:
    /// protracted items start first, others jump straight to completed, and a
    /// completed item is reopened.
    fn advance_progress(&mut self, now: OffsetDateTime) -> Progress {
        let protracted = self.is_protracted();
        let info = self.info_mut();
        match info.progress() {
            Progress::Unstarted if protracted => info.set_started(Some(now)),
            Progress::Unstarted | Progress::Started => info.set_completed(Some(now)),
            Progress::Completed => info.set_completed(None),
        }
        info.progress()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReadItem {
    pub info: ItemInfo,
    pub format: ReadFormat,
    pub title: String,
    pub author: Option<String>,
    pub abandoned: bool,
}

impl ReadItem {
    #[must_use]
    pub fn new(title: impl Into<String>, format: ReadFormat, created: OffsetDateTime) -> Self {
        Self {
            info: ItemInfo::new(created),
            format,
            title: title.into(),
            author: None,
            abandoned: false,
        }
    }
}

impl Consumable for ReadItem {
    fn info(&self) -> &ItemInfo {
        &self.info
    }

    fn info_mut(&mut self) -> &mut ItemInfo {
        &mut self.info
    }

    fn title(&self) -> &str {
        &self.title
    }

    fn subtitle(&self) -> Option<&str> {
        self.author.as_deref()
    }

    fn is_protracted(&self) -> bool {
        true
    }

    fn is_abandoned(&self) -> bool {
        self.abandoned
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WatchItem {
    pub info: ItemInfo,
    pub format: WatchFormat,
    pub title: String,
    pub director: Option<String>,
    pub abandoned: bool,
}

impl WatchItem {
    #[must_use]
    pub fn new(title: impl Into<String>, format: WatchFormat, created: OffsetDateTime) -> Self {
        Self {
            info: ItemInfo::new(created),
            format,
            title: title.into(),
            director: None,
            abandoned: false,
        }
    }
}

impl Consumable for WatchItem {
    fn info(&self) -> &ItemInfo {
        &self.info
    }

    fn info_mut(&mut self) -> &mut ItemInfo {
        &mut self.info
    }

    fn title(&self) -> &str {
        &self.title
    }

    fn subtitle(&self) -> Option<&str> {
        self.director.as_deref()
    }

    fn is_protracted(&self) -> bool {
        self.format != WatchFormat::Film
    }

    fn is_abandoned(&self) -> bool {
        self.abandoned
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ListenItem {
    pub info: ItemInfo,
    pub format: ListenFormat,
    pub title: String,
    pub artist: Option<String>,
    pub abandoned: bool,
}

impl ListenItem {
    #[must_use]
    pub fn new(title: impl Into<String>, format: ListenFormat, created: OffsetDateTime) -> Self {
        Self {
            info: ItemInfo::new(created),
            format,
            title: title.into(),
            artist: None,
            abandoned: false,
        }
    }
}

impl Consumable for ListenItem {
    fn info(&self) -> &ItemInfo {
        &self.info
    }

    fn info_mut(&mut self) -> &mut ItemInfo {
        &mut self.info
    }

    fn title(&self) -> &str {
        &self.title
    }

    fn subtitle(&self) -> Option<&str> {
        self.artist.as_deref()
    }

    fn is_protracted(&self) -> bool {
        self.format == ListenFormat::Podcast
    }

    fn is_abandoned(&self) -> bool {
        self.abandoned
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PlayItem {
    pub info: ItemInfo,
    pub platform: Platform,
    pub title: String,
    pub saw_credits: bool,
}

impl PlayItem {
    #[must_use]
    pub fn new(title: impl Into<String>, platform: Platform, created: OffsetDateTime) -> Self {
        Self {
            info: ItemInfo::new(created),
            platform,
            title: title.into(),
            saw_credits: false,
        }
    }
}

impl Consumable for PlayItem {
    fn info(&self) -> &ItemInfo {
        &self.info
    }

    fn info_mut(&mut self) -> &mut ItemInfo {
        &mut self.info
    }

    fn title(&self) -> &str {
        &self.title
    }

    fn subtitle(&self) -> Option<&str> {
        None
    }

    fn is_protracted(&self) -> bool {
        true
    }
}

/// A persisted record of any kind.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", content = "record", rename_all = "snake_case")]
pub enum Record {
    Read(ReadItem),
    Watch(WatchItem),
    Listen(ListenItem),
    Play(PlayItem),
    Journal(JournalItem),
}

impl Record {
    #[must_use]
    pub fn kind(&self) -> RecordKind {
        match self {
            Self::Read(_) => RecordKind::Read,
            Self::Watch(_) => RecordKind::Watch,
            Self::Listen(_) => RecordKind::Listen,
            Self::Play(_) => RecordKind::Play,
            Self::Journal(_) => RecordKind::Journal,
        }
    }

    #[must_use]
    pub fn id(&self) -> RecordId {
        match self {
            Self::Read(item) => item.info.id,
            Self::Watch(item) => item.info.id,
            Self::Listen(item) => item.info.id,
            Self::Play(item) => item.info.id,
            Self::Journal(item) => item.id,
        }
    }

    #[must_use]
    pub fn as_consumable(&self) -> Option<&dyn Consumable> {
        match self {
            Self::Read(item) => Some(item),
            Self::Watch(item) => Some(item),
            Self::Listen(item) => Some(item),
            Self::Play(item) => Some(item),
            Self::Journal(_) => None,
        }
    }

    pub fn as_consumable_mut(&mut self) -> Option<&mut dyn Consumable> {
        match self {
            Self::Read(item) => Some(item),
            Self::Watch(item) => Some(item),
            Self::Listen(item) => Some(item),
            Self::Play(item) => Some(item),
            Self::Journal(_) => None,
        }
    }

    #[must_use]
    pub fn as_journal(&self) -> Option<&JournalItem> {
        match self {
            Self::Journal(item) => Some(item),
            _ => None,
        }
    }

    #[must_use]
    pub fn into_journal(self) -> Option<JournalItem> {
        match self {
            Self::Journal(item) => Some(item),
            _ => None,
        }
    }

    /// # Errors
    /// Returns [`ModelError`] when a consumable breaks the progress invariant or a
    /// journal item carries a stale keyword index.
    pub fn validate(&self) -> Result<(), ModelError> {
        match self {
            Self::Journal(item) => item.validate(),
            other => other.as_consumable().map_or(Ok(()), |item| item.info().validate()),
        }
    }
}

impl From<ReadItem> for Record {
    fn from(item: ReadItem) -> Self {
        Self::Read(item)
    }
}

impl From<WatchItem> for Record {
    fn from(item: WatchItem) -> Self {
        Self::Watch(item)
    }
}

impl From<ListenItem> for Record {
    fn from(item: ListenItem) -> Self {
        Self::Listen(item)
    }
}

impl From<PlayItem> for Record {
    fn from(item: PlayItem) -> Self {
        Self::Play(item)
    }
}

impl From<JournalItem> for Record {
    fn from(item: JournalItem) -> Self {
        Self::Journal(item)
    }
}
