//! Ordered, append-only registry of schema generations.
//!
//! Each generation pins the column shape of every record kind. Generations are
//! plain data; the store crate turns them into DDL and pairs each adjacent
//! pair with a migration stage.

use std::fmt::{Display, Formatter};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::{ModelError, RecordKind};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct SchemaVersion {
    pub major: u16,
    pub minor: u16,
    pub patch: u16,
}

impl SchemaVersion {
    #[must_use]
    pub const fn new(major: u16, minor: u16, patch: u16) -> Self {
        Self {
            major,
            minor,
            patch,
        }
    }
}

impl Display for SchemaVersion {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

impl FromStr for SchemaVersion {
    type Err = ModelError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let invalid = || ModelError::Validation(format!("invalid schema version `{value}`"));
        let mut parts = value.trim().split('.');
        let mut next = || -> Result<u16, ModelError> {
            parts
                .next()
                .ok_or_else(invalid)?
                .parse::<u16>()
                .map_err(|_| invalid())
        };
        let version = Self::new(next()?, next()?, next()?);
        if parts.next().is_some() {
            return Err(invalid());
        }
        Ok(version)
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum ColumnType {
    Text,
    Integer,
}

impl ColumnType {
    #[must_use]
    pub fn as_sql(self) -> &'static str {
        match self {
            Self::Text => "TEXT",
            Self::Integer => "INTEGER",
        }
    }
}

/// One column of a kind's shape. `default` is a SQL literal and is what a
/// lightweight migration fills an added column with.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct FieldSpec {
    pub name: &'static str,
    pub column_type: ColumnType,
    pub nullable: bool,
    pub default: Option<&'static str>,
    pub primary_key: bool,
}

impl FieldSpec {
    #[must_use]
    pub const fn text(name: &'static str) -> Self {
        Self {
            name,
            column_type: ColumnType::Text,
            nullable: true,
            default: None,
            primary_key: false,
        }
    }

    #[must_use]
    pub const fn integer(name: &'static str) -> Self {
        Self {
            name,
            column_type: ColumnType::Integer,
            ..Self::text(name)
        }
    }

    #[must_use]
    pub const fn key(self) -> Self {
        Self {
            nullable: false,
            primary_key: true,
            ..self
        }
    }

    #[must_use]
    pub const fn required(self) -> Self {
        Self {
            nullable: false,
            ..self
        }
    }

    #[must_use]
    pub const fn required_or(self, default: &'static str) -> Self {
        Self {
            nullable: false,
            default: Some(default),
            ..self
        }
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct IndexSpec {
    pub name: &'static str,
    pub column: &'static str,
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct KindDescriptor {
    pub kind: RecordKind,
    pub table: &'static str,
    pub fields: &'static [FieldSpec],
    pub indexes: &'static [IndexSpec],
}

impl KindDescriptor {
    #[must_use]
    pub fn field(&self, name: &str) -> Option<&FieldSpec> {
        self.fields.iter().find(|field| field.name == name)
    }

    #[must_use]
    pub fn has_field(&self, name: &str) -> bool {
        self.field(name).is_some()
    }

    pub fn column_names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.fields.iter().map(|field| field.name)
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct GenerationDescriptor {
    pub version: SchemaVersion,
    pub name: &'static str,
    pub kinds: &'static [KindDescriptor],
}

impl GenerationDescriptor {
    #[must_use]
    pub fn record_kinds(&self) -> &'static [KindDescriptor] {
        self.kinds
    }

    #[must_use]
    pub fn kind(&self, kind: RecordKind) -> Option<&'static KindDescriptor> {
        self.kinds.iter().find(|descriptor| descriptor.kind == kind)
    }

    /// Kinds whose shape differs between `self` and `next`.
    #[must_use]
    pub fn changed_kinds(&self, next: &GenerationDescriptor) -> Vec<RecordKind> {
        RecordKind::ALL
            .iter()
            .copied()
            .filter(|kind| self.kind(*kind) != next.kind(*kind))
            .collect()
    }
}

const fn created_index(name: &'static str) -> [IndexSpec; 1] {
    [IndexSpec {
        name,
        column: "created",
    }]
}

const READ_INDEXES: [IndexSpec; 1] = created_index("read_items_created_idx");
const WATCH_INDEXES: [IndexSpec; 1] = created_index("watch_items_created_idx");
const LISTEN_INDEXES: [IndexSpec; 1] = created_index("listen_items_created_idx");
const PLAY_INDEXES: [IndexSpec; 1] = created_index("play_items_created_idx");
const JOURNAL_V4_INDEXES: [IndexSpec; 1] = [IndexSpec {
    name: "journal_items_when_idx",
    column: "when_key",
}];

const ID: FieldSpec = FieldSpec::text("id").key();
const CREATED: FieldSpec = FieldSpec::text("created").required();
const TAGS: FieldSpec = FieldSpec::text("tags").required_or("'[]'");
const LINK: FieldSpec = FieldSpec::text("link");
const STARTED: FieldSpec = FieldSpec::text("started");
const COMPLETED: FieldSpec = FieldSpec::text("completed");
const RATING: FieldSpec = FieldSpec::text("rating").required_or("'none'");
const RECOMMENDER: FieldSpec = FieldSpec::text("recommender");
const NOTES: FieldSpec = FieldSpec::text("notes");
const TITLE: FieldSpec = FieldSpec::text("title").required_or("''");
const ABANDONED: FieldSpec = FieldSpec::integer("abandoned").required_or("0");
const ENTRIES: FieldSpec = FieldSpec::text("entries").required_or("'[]'");

const READ_V1_FIELDS: [FieldSpec; 12] = [
    ID,
    CREATED,
    TAGS,
    LINK,
    STARTED,
    COMPLETED,
    RATING,
    RECOMMENDER,
    FieldSpec::text("format").required_or("'book'"),
    TITLE,
    FieldSpec::text("author"),
    ABANDONED,
];
const READ_V3_FIELDS: [FieldSpec; 13] = [
    ID,
    CREATED,
    TAGS,
    LINK,
    STARTED,
    COMPLETED,
    RATING,
    RECOMMENDER,
    FieldSpec::text("format").required_or("'book'"),
    TITLE,
    FieldSpec::text("author"),
    ABANDONED,
    NOTES,
];

const WATCH_V1_FIELDS: [FieldSpec; 12] = [
    ID,
    CREATED,
    TAGS,
    LINK,
    STARTED,
    COMPLETED,
    RATING,
    RECOMMENDER,
    FieldSpec::text("format").required_or("'film'"),
    TITLE,
    FieldSpec::text("director"),
    ABANDONED,
];
const WATCH_V3_FIELDS: [FieldSpec; 13] = [
    ID,
    CREATED,
    TAGS,
    LINK,
    STARTED,
    COMPLETED,
    RATING,
    RECOMMENDER,
    FieldSpec::text("format").required_or("'film'"),
    TITLE,
    FieldSpec::text("director"),
    ABANDONED,
    NOTES,
];

const LISTEN_V1_FIELDS: [FieldSpec; 12] = [
    ID,
    CREATED,
    TAGS,
    LINK,
    STARTED,
    COMPLETED,
    RATING,
    RECOMMENDER,
    FieldSpec::text("format").required_or("'other'"),
    TITLE,
    FieldSpec::text("artist"),
    ABANDONED,
];
const LISTEN_V2_FIELDS: [FieldSpec; 13] = [
    ID,
    CREATED,
    TAGS,
    LINK,
    STARTED,
    COMPLETED,
    RATING,
    RECOMMENDER,
    FieldSpec::text("format").required_or("'other'"),
    TITLE,
    FieldSpec::text("artist"),
    ABANDONED,
    NOTES,
];

const PLAY_V1_FIELDS: [FieldSpec; 11] = [
    ID,
    CREATED,
    TAGS,
    LINK,
    STARTED,
    COMPLETED,
    RATING,
    RECOMMENDER,
    FieldSpec::text("platform").required_or("'pc'"),
    TITLE,
    FieldSpec::integer("saw_credits").required_or("0"),
];
const PLAY_V3_FIELDS: [FieldSpec; 12] = [
    ID,
    CREATED,
    TAGS,
    LINK,
    STARTED,
    COMPLETED,
    RATING,
    RECOMMENDER,
    FieldSpec::text("platform").required_or("'pc'"),
    TITLE,
    FieldSpec::integer("saw_credits").required_or("0"),
    NOTES,
];

const JOURNAL_V1_FIELDS: [FieldSpec; 5] = [
    ID,
    FieldSpec::integer("year").required_or("1970"),
    FieldSpec::integer("month").required_or("1"),
    FieldSpec::integer("day").required_or("1"),
    ENTRIES,
];
const JOURNAL_V4_FIELDS: [FieldSpec; 4] = [
    ID,
    FieldSpec::integer("when_key").required_or("0"),
    ENTRIES,
    FieldSpec::text("keywords").required_or("''"),
];

const READ_V1: KindDescriptor = KindDescriptor {
    kind: RecordKind::Read,
    table: "read_items",
    fields: &READ_V1_FIELDS,
    indexes: &READ_INDEXES,
};
const READ_V3: KindDescriptor = KindDescriptor {
    kind: RecordKind::Read,
    table: "read_items",
    fields: &READ_V3_FIELDS,
    indexes: &READ_INDEXES,
};
const WATCH_V1: KindDescriptor = KindDescriptor {
    kind: RecordKind::Watch,
    table: "watch_items",
    fields: &WATCH_V1_FIELDS,
    indexes: &WATCH_INDEXES,
};
const WATCH_V3: KindDescriptor = KindDescriptor {
    kind: RecordKind::Watch,
    table: "watch_items",
    fields: &WATCH_V3_FIELDS,
    indexes: &WATCH_INDEXES,
};
const LISTEN_V1: KindDescriptor = KindDescriptor {
    kind: RecordKind::Listen,
    table: "listen_items",
    fields: &LISTEN_V1_FIELDS,
    indexes: &LISTEN_INDEXES,
};
const LISTEN_V2: KindDescriptor = KindDescriptor {
    kind: RecordKind::Listen,
    table: "listen_items",
    fields: &LISTEN_V2_FIELDS,
    indexes: &LISTEN_INDEXES,
};
const PLAY_V1: KindDescriptor = KindDescriptor {
    kind: RecordKind::Play,
    table: "play_items",
    fields: &PLAY_V1_FIELDS,
    indexes: &PLAY_INDEXES,
};
const PLAY_V3: KindDescriptor = KindDescriptor {
    kind: RecordKind::Play,
    table: "play_items",
    fields: &PLAY_V3_FIELDS,
    indexes: &PLAY_INDEXES,
};
const JOURNAL_V1: KindDescriptor = KindDescriptor {
    kind: RecordKind::Journal,
    table: "journal_items",
    fields: &JOURNAL_V1_FIELDS,
    indexes: &[],
};
const JOURNAL_V4: KindDescriptor = KindDescriptor {
    kind: RecordKind::Journal,
    table: "journal_items",
    fields: &JOURNAL_V4_FIELDS,
    indexes: &JOURNAL_V4_INDEXES,
};

static GENERATIONS: [GenerationDescriptor; 4] = [
    GenerationDescriptor {
        version: SchemaVersion::new(1, 0, 1),
        name: "initial",
        kinds: &[READ_V1, WATCH_V1, LISTEN_V1, PLAY_V1, JOURNAL_V1],
    },
    GenerationDescriptor {
        version: SchemaVersion::new(2, 0, 0),
        name: "listen_notes",
        kinds: &[READ_V1, WATCH_V1, LISTEN_V2, PLAY_V1, JOURNAL_V1],
    },
    GenerationDescriptor {
        version: SchemaVersion::new(3, 0, 0),
        name: "item_notes",
        kinds: &[READ_V3, WATCH_V3, LISTEN_V2, PLAY_V3, JOURNAL_V1],
    },
    GenerationDescriptor {
        version: SchemaVersion::new(4, 0, 0),
        name: "journal_day_keys",
        kinds: &[READ_V3, WATCH_V3, LISTEN_V2, PLAY_V3, JOURNAL_V4],
    },
];

#[must_use]
pub fn list_generations() -> &'static [GenerationDescriptor] {
    &GENERATIONS
}

/// The generation this build reads and writes. Always the last registered one.
#[must_use]
pub fn current_generation() -> &'static GenerationDescriptor {
    &GENERATIONS[GENERATIONS.len() - 1]
}

#[must_use]
pub fn generation(version: SchemaVersion) -> Option<&'static GenerationDescriptor> {
    GENERATIONS.iter().find(|descriptor| descriptor.version == version)
}
