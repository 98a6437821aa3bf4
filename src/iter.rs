// Copyright 2024 contributors to BeholdFS.

//! The directory iterator (component C6, spec §4.6).
//!
//! Grounded on `examples/original_source/src/beholddb.c`'s
//! `beholddb_opendir`/`beholddb_readdir`/`beholddb_listdir` (normal
//! mode) and `beholddb_opentags` (tag mode), generalized to collect a
//! `Vec<Entry>` up front rather than driving a stateful SQLite cursor
//! one `readdir()` call at a time — the session layer (C7) is what
//! owns replay-on-rewind, not this component.

use std::fs;
use std::path::Path;

use crate::config::{Config, METADATA_FILE_NAME};
use crate::error::Result;
use crate::filter::{self, FastLocate};
use crate::path::Filter;
use crate::store::MetadataStore;

/// What kind of thing an [`Entry`] names, for the POSIX layer's
/// `d_type` hint.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum EntryKind {
    File,
    Directory,
    Symlink,
    Other,
}

impl EntryKind {
    fn from_file_type(file_type: fs::FileType) -> EntryKind {
        if file_type.is_dir() {
            EntryKind::Directory
        } else if file_type.is_symlink() {
            EntryKind::Symlink
        } else if file_type.is_file() {
            EntryKind::File
        } else {
            EntryKind::Other
        }
    }
}

/// One listed entry, synthetic or backed by a real directory entry.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Entry {
    pub name: String,
    pub kind: EntryKind,
}

/// List `real_dir` under `filter` (spec §4.6). `store`/`parent_id`
/// identify the directory's own metadata row; `store` is `None` when
/// the directory has no `.beholdfs` file yet. Takes `store` by mutable
/// reference because the `-o new_locate` fast path (`config.fast_locate`)
/// needs to open a scratch-table savepoint on it.
pub fn list(
    real_dir: &Path,
    store: Option<&mut MetadataStore>,
    parent_id: i64,
    filter: &Filter,
    config: &Config,
) -> Result<Vec<Entry>> {
    if filter.listing {
        list_tags(store.as_deref(), parent_id, filter)
    } else {
        list_normal(real_dir, store, parent_id, filter, config)
    }
}

/// Either the per-call aggregate path or the `-o new_locate` scratch
/// table, behind one `visible` check so [`list_normal`] only has to
/// walk the backing directory once.
enum Locator<'a> {
    Aggregate(Option<&'a MetadataStore>),
    Fast(FastLocate<'a>),
}

impl<'a> Locator<'a> {
    fn visible(&self, filter: &Filter, parent_id: i64, name: &str) -> Result<bool> {
        match self {
            Locator::Aggregate(store) => filter::visible(*store, filter, parent_id, name),
            Locator::Fast(fast) => fast.visible(name),
        }
    }

    fn finish(self) -> Result<()> {
        if let Locator::Fast(fast) = self {
            fast.close()?;
        }
        Ok(())
    }
}

fn list_normal(
    real_dir: &Path,
    store: Option<&mut MetadataStore>,
    parent_id: i64,
    filter: &Filter,
    config: &Config,
) -> Result<Vec<Entry>> {
    let mut out = Vec::new();
    if config.list_sigil_entry {
        out.push(Entry {
            name: (config.tag_sigil as char).to_string(),
            kind: EntryKind::Directory,
        });
    }

    let locator = match store {
        Some(store) if config.fast_locate && !filter.is_trivial() => {
            Locator::Fast(FastLocate::populate(store, parent_id, filter)?)
        }
        store => Locator::Aggregate(store.map(|s| &*s)),
    };

    for dirent in fs::read_dir(real_dir)? {
        let dirent = dirent?;
        let name = dirent.file_name().to_string_lossy().into_owned();
        if name == METADATA_FILE_NAME {
            continue;
        }
        if !locator.visible(filter, parent_id, &name)? {
            continue;
        }
        let Ok(file_type) = dirent.file_type() else {
            continue; // entry vanished or is unreadable between readdir and stat
        };
        out.push(Entry {
            name,
            kind: EntryKind::from_file_type(file_type),
        });
    }
    locator.finish()?;
    Ok(out)
}

/// Tag listing never touches the backing directory: its entries are
/// the candidate tag names themselves, presented as `dr-xr-xr-x`
/// pseudo-directories with a link count of 1 (the POSIX layer fills in
/// the attributes; this just names them).
fn list_tags(store: Option<&MetadataStore>, parent_id: i64, filter: &Filter) -> Result<Vec<Entry>> {
    let Some(store) = store else {
        return Ok(Vec::new());
    };
    let candidates = filter::open_tag_candidates(store, parent_id, filter)?;
    Ok(candidates
        .into_iter()
        .map(|c| Entry {
            name: c.name,
            kind: EntryKind::Directory,
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::schema::ObjectKind as Kind;
    use tempfile::tempdir;

    fn names(entries: &[Entry]) -> Vec<&str> {
        entries.iter().map(|e| e.name.as_str()).collect()
    }

    #[test]
    fn normal_listing_merges_backing_and_filter_and_skips_metadata_file() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("a"), b"").unwrap();
        std::fs::write(dir.path().join("b"), b"").unwrap();

        let mut store = MetadataStore::open_write(dir.path()).unwrap();
        let root = store.root_id().unwrap();
        let a = store.create_object(root, Kind::File, "a").unwrap();
        let red = store.ensure_tag("red").unwrap();
        store.link_tag(a, red).unwrap();
        store.create_object(root, Kind::File, "b").unwrap();

        let config = Config::default();
        let f = Filter {
            include: vec!["red".to_string()],
            exclude: vec![],
            listing: false,
        };
        let entries = list(dir.path(), Some(&mut store), root, &f, &config).unwrap();
        let mut got = names(&entries);
        got.sort();
        assert_eq!(got, vec!["%", "a"]);
    }

    #[test]
    fn nolist_option_hides_synthetic_sigil_entry() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("a"), b"").unwrap();

        let config = Config {
            list_sigil_entry: false,
            ..Config::default()
        };
        let f = Filter::default();
        let entries = list(dir.path(), None, 0, &f, &config).unwrap();
        assert_eq!(names(&entries), vec!["a"]);
    }

    #[test]
    fn trivial_filter_with_no_store_shows_everything() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("a"), b"").unwrap();
        std::fs::write(dir.path().join("b"), b"").unwrap();

        let config = Config::default();
        let f = Filter::default();
        let entries = list(dir.path(), None, 0, &f, &config).unwrap();
        let mut got = names(&entries);
        got.sort();
        assert_eq!(got, vec!["%", "a", "b"]);
    }

    #[test]
    fn fast_locate_option_matches_the_aggregate_path() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("a"), b"").unwrap();
        std::fs::write(dir.path().join("b"), b"").unwrap();

        let mut store = MetadataStore::open_write(dir.path()).unwrap();
        let root = store.root_id().unwrap();
        let a = store.create_object(root, Kind::File, "a").unwrap();
        let red = store.ensure_tag("red").unwrap();
        store.link_tag(a, red).unwrap();
        store.create_object(root, Kind::File, "b").unwrap();

        let config = Config {
            fast_locate: true,
            ..Config::default()
        };
        let f = Filter {
            include: vec!["red".to_string()],
            exclude: vec![],
            listing: false,
        };
        let entries = list(dir.path(), Some(&mut store), root, &f, &config).unwrap();
        let mut got = names(&entries);
        got.sort();
        assert_eq!(got, vec!["%", "a"]);
    }

    #[test]
    fn tag_listing_does_not_touch_the_backing_directory() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("untracked"), b"").unwrap();

        let mut store = MetadataStore::open_write(dir.path()).unwrap();
        let root = store.root_id().unwrap();
        let a = store.create_object(root, Kind::File, "a").unwrap();
        let red = store.ensure_tag("red").unwrap();
        store.link_tag(a, red).unwrap();

        let config = Config::default();
        let f = Filter {
            include: vec![],
            exclude: vec![],
            listing: true,
        };
        let entries = list(dir.path(), Some(&mut store), root, &f, &config).unwrap();
        assert_eq!(names(&entries), vec!["red"]);
        assert!(entries.iter().all(|e| e.kind == EntryKind::Directory));
    }
}
