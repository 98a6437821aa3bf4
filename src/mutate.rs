// Copyright 2024 contributors to BeholdFS.

//! The mutation API (component C5, spec §4.5).
//!
//! Grounded on
//! `examples/original_source/src/beholddb.c::beholddb_create_file_with_tags`,
//! `beholddb_delete_file_with_tags`, and `beholddb_rename_file`,
//! generalized to the unified schema and to [`crate::mark`]'s
//! iterative upward walk.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};
use crate::mark;
use crate::path::ParsedPath;
use crate::store::schema::ObjectKind;
use crate::store::MetadataStore;

fn split_path(parsed: &ParsedPath) -> Result<(&[String], &str)> {
    parsed
        .components
        .split_last()
        .map(|(last, ancestors)| (ancestors, last.as_str()))
        .ok_or_else(|| Error::internal("mutate: empty path (root is not a mutable object)"))
}

fn containing_dir(fsroot: &Path, ancestors: &[String]) -> PathBuf {
    ancestors.iter().fold(fsroot.to_path_buf(), |dir, c| dir.join(c))
}

/// **create(parsed_path, type)** (spec §4.5): ensure every ancestor
/// component exists as a DIRECTORY object (one metadata file per
/// level), create the final component as `kind`, link it to every tag
/// in `parsed.filter.include`, and propagate the mark.
pub fn create(fsroot: &Path, parsed: &ParsedPath, kind: ObjectKind) -> Result<()> {
    let (ancestors, name) = split_path(parsed)?;

    let mut cur_dir = fsroot.to_path_buf();
    for component in ancestors {
        let store = MetadataStore::open_write(&cur_dir)?;
        let parent_id = store.root_id()?;
        store.ensure_directory(parent_id, component)?;
        cur_dir = cur_dir.join(component);
    }

    let added: BTreeSet<String> = parsed.filter.include.iter().cloned().collect();
    {
        let store = MetadataStore::open_write(&cur_dir)?;
        let parent_id = store.root_id()?;
        let object_id = store.create_object(parent_id, kind, name)?;
        for tag in &added {
            let tag_id = store.ensure_tag(tag)?;
            store.link_tag(object_id, tag_id)?;
        }
    }

    mark::propagate(fsroot, &cur_dir, name, kind, &added, &BTreeSet::new())
}

/// **delete(parsed_path)** (spec §4.5): locate the object, let
/// `ON DELETE CASCADE` drop its ownership/tag-link rows, GC any tag
/// left unreferenced, and propagate the mark with its former tags as
/// the `removed` set. `NotFound` is expected (and harmless to the
/// caller) for an object the metadata store never tracked.
pub fn delete(fsroot: &Path, parsed: &ParsedPath, kind: ObjectKind) -> Result<()> {
    let (ancestors, name) = split_path(parsed)?;
    let cur_dir = containing_dir(fsroot, ancestors);

    let removed: BTreeSet<String> = {
        let store = MetadataStore::open_write(&cur_dir)?;
        let parent_id = store.root_id()?;
        let object_id = store
            .find_object(parent_id, kind, name)?
            .ok_or_else(|| Error::not_found(name))?;
        let tag_ids = store.object_tag_ids(object_id)?;
        let tag_names: BTreeSet<String> = store.object_tag_names(object_id)?.into_iter().collect();
        store.delete_object(object_id)?;
        for tag_id in tag_ids {
            store.gc_tag_if_unused(tag_id)?;
        }
        tag_names
    };

    mark::propagate(fsroot, &cur_dir, name, kind, &BTreeSet::new(), &removed)
}

/// **retag(parsed_path, new_tag_set)** (spec §4.5): replace the
/// object's tag links with exactly `new_tags`.
pub fn retag(fsroot: &Path, parsed: &ParsedPath, kind: ObjectKind, new_tags: &[String]) -> Result<()> {
    let (ancestors, name) = split_path(parsed)?;
    let cur_dir = containing_dir(fsroot, ancestors);

    let (added, removed) = {
        let store = MetadataStore::open_write(&cur_dir)?;
        let parent_id = store.root_id()?;
        let object_id = store
            .find_object(parent_id, kind, name)?
            .ok_or_else(|| Error::not_found(name))?;
        apply_retag(&store, object_id, new_tags)?
    };

    mark::propagate(fsroot, &cur_dir, name, kind, &added, &removed)
}

fn apply_retag(
    store: &MetadataStore,
    object_id: i64,
    new_tags: &[String],
) -> Result<(BTreeSet<String>, BTreeSet<String>)> {
    let old: BTreeSet<String> = store.object_tag_names(object_id)?.into_iter().collect();
    let new: BTreeSet<String> = new_tags.iter().cloned().collect();

    for tag in new.difference(&old) {
        let tag_id = store.ensure_tag(tag)?;
        store.link_tag(object_id, tag_id)?;
    }
    for tag in old.difference(&new) {
        if let Some(tag_id) = store.find_object(0, ObjectKind::Tag, tag)? {
            store.unlink_tag(object_id, tag_id)?;
            store.gc_tag_if_unused(tag_id)?;
        }
    }

    let added = new.difference(&old).cloned().collect();
    let removed = old.difference(&new).cloned().collect();
    Ok((added, removed))
}

/// **rename(old_parsed_path, new_parsed_path)** (spec §4.5): delete
/// then create with the *preserved* tag set and type by default. Only
/// when the destination path explicitly names a tag segment of its
/// own does that segment's `include` set become the object's new
/// tags — the narrow "cross-directory move that changes the
/// effective filter" case from spec §9's Open Question. A plain
/// destination name (no tag segment at all) always keeps the source
/// object's existing tags. When both paths share a parent directory,
/// an in-place object rename is used as an optimization with an
/// identical observable result (documented Open Question decision,
/// see `DESIGN.md`).
pub fn rename(fsroot: &Path, old: &ParsedPath, new: &ParsedPath, kind: ObjectKind) -> Result<()> {
    let (old_ancestors, old_name) = split_path(old)?;
    let (new_ancestors, new_name) = split_path(new)?;
    let old_dir = containing_dir(fsroot, old_ancestors);
    let new_dir = containing_dir(fsroot, new_ancestors);

    if old_dir == new_dir {
        rename_in_place(fsroot, &old_dir, old_name, new_name, kind, &new.filter.include)
    } else {
        let old_tags: BTreeSet<String> = {
            let store = MetadataStore::open_write(&old_dir)?;
            let parent_id = store.root_id()?;
            let object_id = store
                .find_object(parent_id, kind, old_name)?
                .ok_or_else(|| Error::not_found(old_name))?;
            store.object_tag_names(object_id)?.into_iter().collect()
        };
        let new_tags = effective_tag_set(&old_tags, &new.filter.include);

        delete(fsroot, old, kind)?;
        let mut renamed = new.clone();
        renamed.filter.include = new_tags;
        create(fsroot, &renamed, kind)
    }
}

/// The destination's new tag set: its own `include` list when the
/// destination path explicitly names one, otherwise the source
/// object's existing tags (spec §4.5's preserve-by-default rule).
fn effective_tag_set(old_tags: &BTreeSet<String>, new_filter_include: &[String]) -> Vec<String> {
    if new_filter_include.is_empty() {
        old_tags.iter().cloned().collect()
    } else {
        new_filter_include.to_vec()
    }
}

fn rename_in_place(
    fsroot: &Path,
    dir: &Path,
    old_name: &str,
    new_name: &str,
    kind: ObjectKind,
    new_filter_include: &[String],
) -> Result<()> {
    let (added, removed) = {
        let store = MetadataStore::open_write(dir)?;
        let parent_id = store.root_id()?;
        let object_id = store
            .find_object(parent_id, kind, old_name)?
            .ok_or_else(|| Error::not_found(old_name))?;
        store.rename_object(object_id, parent_id, new_name)?;
        let old_tags: BTreeSet<String> = store.object_tag_names(object_id)?.into_iter().collect();
        let new_tag_set = effective_tag_set(&old_tags, new_filter_include);
        apply_retag(&store, object_id, &new_tag_set)?
    };

    mark::propagate(fsroot, dir, new_name, kind, &added, &removed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::path::parse_path;
    use tempfile::tempdir;

    fn parsed(path: &str) -> ParsedPath {
        parse_path(path, &Config::default(), false).unwrap()
    }

    #[test]
    fn create_links_include_tags_and_marks_parent() {
        let dir = tempdir().unwrap();
        let fsroot = dir.path();
        std::fs::create_dir(fsroot.join("d")).unwrap();

        create(fsroot, &parsed("/d"), ObjectKind::Directory).ok();
        create(fsroot, &parsed("/d/%red/e"), ObjectKind::File).unwrap();

        let d_store = MetadataStore::open_read(&fsroot.join("d")).unwrap().unwrap();
        let d_root = d_store.root_id().unwrap();
        let e = d_store.find_object(d_root, ObjectKind::File, "e").unwrap().unwrap();
        assert_eq!(d_store.object_tag_names(e).unwrap(), vec!["red".to_string()]);

        let root_store = MetadataStore::open_read(fsroot).unwrap().unwrap();
        let root_id = root_store.root_id().unwrap();
        let d = root_store
            .find_object(root_id, ObjectKind::Directory, "d")
            .unwrap()
            .unwrap();
        assert_eq!(root_store.object_tag_names(d).unwrap(), vec!["red".to_string()]);
    }

    #[test]
    fn create_rejects_existing_object() {
        let dir = tempdir().unwrap();
        let fsroot = dir.path();
        create(fsroot, &parsed("/a"), ObjectKind::File).unwrap();
        assert!(matches!(
            create(fsroot, &parsed("/a"), ObjectKind::File),
            Err(Error::Exists { .. })
        ));
    }

    #[test]
    fn delete_gcs_the_only_tag() {
        let dir = tempdir().unwrap();
        let fsroot = dir.path();
        create(fsroot, &parsed("/%gone/a"), ObjectKind::File).unwrap();

        let store = MetadataStore::open_read(fsroot).unwrap().unwrap();
        let root_id = store.root_id().unwrap();
        assert!(store
            .find_object(0, ObjectKind::Tag, "gone")
            .unwrap()
            .is_some());
        drop(store);

        delete(fsroot, &parsed("/a"), ObjectKind::File).unwrap();

        let store = MetadataStore::open_read(fsroot).unwrap().unwrap();
        assert!(store
            .find_object(0, ObjectKind::Tag, "gone")
            .unwrap()
            .is_none());
        let _ = root_id;
    }

    #[test]
    fn retag_replaces_tag_set() {
        let dir = tempdir().unwrap();
        let fsroot = dir.path();
        create(fsroot, &parsed("/%a/f"), ObjectKind::File).unwrap();

        retag(
            fsroot,
            &parsed("/f"),
            ObjectKind::File,
            &["b".to_string(), "c".to_string()],
        )
        .unwrap();

        let store = MetadataStore::open_read(fsroot).unwrap().unwrap();
        let root_id = store.root_id().unwrap();
        let f = store.find_object(root_id, ObjectKind::File, "f").unwrap().unwrap();
        let mut tags = store.object_tag_names(f).unwrap();
        tags.sort();
        assert_eq!(tags, vec!["b".to_string(), "c".to_string()]);
        assert!(store.find_object(0, ObjectKind::Tag, "a").unwrap().is_none());
    }

    #[test]
    fn rename_same_parent_is_in_place() {
        let dir = tempdir().unwrap();
        let fsroot = dir.path();
        create(fsroot, &parsed("/%a/old"), ObjectKind::File).unwrap();

        rename(fsroot, &parsed("/old"), &parsed("/%a/new"), ObjectKind::File).unwrap();

        let store = MetadataStore::open_read(fsroot).unwrap().unwrap();
        let root_id = store.root_id().unwrap();
        assert!(store.find_object(root_id, ObjectKind::File, "old").unwrap().is_none());
        let new = store.find_object(root_id, ObjectKind::File, "new").unwrap().unwrap();
        assert_eq!(store.object_tag_names(new).unwrap(), vec!["a".to_string()]);
    }

    #[test]
    fn rename_to_a_plain_name_preserves_existing_tags() {
        let dir = tempdir().unwrap();
        let fsroot = dir.path();
        create(fsroot, &parsed("/%a/file1"), ObjectKind::File).unwrap();

        rename(fsroot, &parsed("/file1"), &parsed("/file2"), ObjectKind::File).unwrap();

        let store = MetadataStore::open_read(fsroot).unwrap().unwrap();
        let root_id = store.root_id().unwrap();
        assert!(store.find_object(root_id, ObjectKind::File, "file1").unwrap().is_none());
        let file2 = store.find_object(root_id, ObjectKind::File, "file2").unwrap().unwrap();
        assert_eq!(store.object_tag_names(file2).unwrap(), vec!["a".to_string()]);
    }

    #[test]
    fn rename_across_directories_to_a_plain_name_preserves_existing_tags() {
        let dir = tempdir().unwrap();
        let fsroot = dir.path();
        std::fs::create_dir(fsroot.join("src")).unwrap();
        std::fs::create_dir(fsroot.join("dst")).unwrap();
        create(fsroot, &parsed("/src"), ObjectKind::Directory).ok();
        create(fsroot, &parsed("/dst"), ObjectKind::Directory).ok();
        create(fsroot, &parsed("/src/%a/file1"), ObjectKind::File).unwrap();

        rename(fsroot, &parsed("/src/file1"), &parsed("/dst/file1"), ObjectKind::File).unwrap();

        let dst_store = MetadataStore::open_read(&fsroot.join("dst")).unwrap().unwrap();
        let dst_root = dst_store.root_id().unwrap();
        let file1 = dst_store.find_object(dst_root, ObjectKind::File, "file1").unwrap().unwrap();
        assert_eq!(dst_store.object_tag_names(file1).unwrap(), vec!["a".to_string()]);
    }
}
