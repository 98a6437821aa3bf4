// Copyright 2024 contributors to BeholdFS.

//! DDL for the per-directory metadata file (spec §4.2, §3).
//!
//! Grounded on `examples/original_source/src/schema.c`, collapsed to
//! the newest unified `objects`/`objects_owners`/`objects_tags` schema
//! per spec §9 ("multiple overlapping revisions... follow the newest").

/// The `type` discriminator of an [`objects`](self) row.
///
/// Tags are objects too (spec §9: "do not model this with
/// inheritance... use a tagged variant with a `type` discriminator").
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[repr(i64)]
pub enum ObjectKind {
    File = 0,
    Directory = 1,
    Tag = 2,
}

impl ObjectKind {
    pub fn from_i64(v: i64) -> Option<ObjectKind> {
        match v {
            0 => Some(ObjectKind::File),
            1 => Some(ObjectKind::Directory),
            2 => Some(ObjectKind::Tag),
            _ => None,
        }
    }
}

/// The schema major/minor this binary writes and understands.
pub const CURRENT_MAJOR: u32 = 1;
pub const CURRENT_MINOR: u32 = 0;

/// Config key under which the schema version string lives.
pub const VERSION_KEY: &str = "version";

pub const ROOT_NAME: &str = "/";

pub const CREATE_SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS objects (
    id        INTEGER PRIMARY KEY,
    id_parent INTEGER REFERENCES objects(id) ON DELETE RESTRICT,
    type      INTEGER NOT NULL,
    name      TEXT NOT NULL,
    UNIQUE(id_parent, type, name)
);
CREATE INDEX IF NOT EXISTS objects_id_parent ON objects(id_parent);
CREATE INDEX IF NOT EXISTS objects_name ON objects(name);

CREATE TABLE IF NOT EXISTS objects_owners (
    id_owner  INTEGER NOT NULL REFERENCES objects(id) ON DELETE CASCADE,
    id_object INTEGER NOT NULL REFERENCES objects(id) ON DELETE CASCADE,
    UNIQUE(id_owner, id_object)
);
CREATE INDEX IF NOT EXISTS objects_owners_owner ON objects_owners(id_owner);
CREATE INDEX IF NOT EXISTS objects_owners_object ON objects_owners(id_object);

CREATE TABLE IF NOT EXISTS objects_tags (
    id_object INTEGER NOT NULL REFERENCES objects(id) ON DELETE CASCADE,
    id_tag    INTEGER NOT NULL REFERENCES objects(id) ON DELETE CASCADE,
    UNIQUE(id_object, id_tag)
);
CREATE INDEX IF NOT EXISTS objects_tags_object ON objects_tags(id_object);
CREATE INDEX IF NOT EXISTS objects_tags_tag ON objects_tags(id_tag);

CREATE TABLE IF NOT EXISTS config (
    param TEXT UNIQUE ON CONFLICT REPLACE,
    value TEXT
);
";
