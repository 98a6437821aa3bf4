// Copyright 2024 contributors to BeholdFS.

//! The mark engine (component C4, spec §4.4).
//!
//! Restores the invariant "a directory carries weak tag T iff some
//! descendant carries strong tag T" after a mutation, walking upward
//! one metadata file per directory level, exactly as
//! `examples/original_source/src/beholddb.c::beholddb_mark_recursive`
//! does by repeated `dirname()`, generalized to the unified schema and
//! to named savepoints per level (spec §5, §9).

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use rusqlite::OptionalExtension;
use tracing::{trace, warn};

use crate::error::{Error, Result};
use crate::store::schema::ObjectKind;
use crate::store::MetadataStore;

const MARK_SAVEPOINT: &str = "beholdfs_mark";

/// Walk upward from `dir` (the real directory that directly contains
/// the mutated object `name`), applying `added`/`removed` to that
/// object's tag links, then to its parent's weak summary, and so on,
/// stopping at `fsroot` (spec §4.4 step 3).
///
/// The caller (C5) has already applied `added`/`removed` to `name`
/// itself (or, for a delete, removed the object entirely) before
/// calling this; the first level here only needs to check whether the
/// change is already represented by a sibling, not re-apply it. From
/// the second level on (the parent directory's own weak summary, then
/// its parent, ...) nobody else applies the delta, so this function
/// does it directly.
pub fn propagate(
    fsroot: &Path,
    dir: &Path,
    name: &str,
    kind: ObjectKind,
    added: &BTreeSet<String>,
    removed: &BTreeSet<String>,
) -> Result<()> {
    let mut cur_dir = dir.to_path_buf();
    let mut cur_name = name.to_string();
    let mut cur_kind = kind;
    let mut added = added.clone();
    let mut removed = removed.clone();
    let mut apply_self = false;

    loop {
        if added.is_empty() && removed.is_empty() {
            return Ok(());
        }
        let at_root = cur_dir == fsroot;
        trace!(
            dir = %cur_dir.display(),
            name = %cur_name,
            ?added,
            ?removed,
            apply_self,
            "mark level"
        );

        let (include_up, exclude_up) =
            match mark_one_level(&cur_dir, &cur_name, cur_kind, &added, &removed, apply_self) {
                Ok(deltas) => deltas,
                Err(e) => {
                    warn!(error = %e, dir = %cur_dir.display(), "mark level failed, aborting walk");
                    return Err(e);
                }
            };

        if at_root || (include_up.is_empty() && exclude_up.is_empty()) {
            return Ok(());
        }

        let Some(parent_dir) = cur_dir.parent() else {
            return Ok(());
        };
        let Some(dir_name) = cur_dir.file_name().and_then(|n| n.to_str()) else {
            return Err(Error::internal("mark: directory name is not valid UTF-8"));
        };

        cur_name = dir_name.to_string();
        cur_kind = ObjectKind::Directory;
        added = include_up;
        removed = exclude_up;
        cur_dir = parent_dir.to_path_buf();
        apply_self = true;
    }
}

/// Process one level: optionally apply the delta to `name`'s own tag
/// links in `dir`'s metadata store, then compute the up-delta
/// relative to its siblings. Wrapped in a named savepoint so a
/// failure here rolls back cleanly without touching levels already
/// committed (spec §4.4, §5).
fn mark_one_level(
    dir: &Path,
    name: &str,
    kind: ObjectKind,
    added: &BTreeSet<String>,
    removed: &BTreeSet<String>,
    apply_self: bool,
) -> Result<(BTreeSet<String>, BTreeSet<String>)> {
    let store = MetadataStore::open_write(dir)?;
    store.begin_savepoint(MARK_SAVEPOINT)?;

    let outcome = (|| -> Result<(BTreeSet<String>, BTreeSet<String>)> {
        let parent_id = store.root_id()?;

        let object_id = if apply_self {
            let object_id = match kind {
                ObjectKind::Directory => store.ensure_directory(parent_id, name)?,
                _ => store.find_object(parent_id, kind, name)?.ok_or_else(|| {
                    Error::internal(format!("mark: {name:?} missing from its own directory's store"))
                })?,
            };
            for tag in added {
                let tag_id = store.ensure_tag(tag)?;
                store.link_tag(object_id, tag_id)?;
            }
            for tag in removed {
                if let Some(tag_id) = store.find_object(0, ObjectKind::Tag, tag)? {
                    store.unlink_tag(object_id, tag_id)?;
                    store.gc_tag_if_unused(tag_id)?;
                }
            }
            Some(object_id)
        } else {
            // The caller already applied the delta (or, for a delete,
            // removed the object outright); it may no longer exist.
            store.find_object(parent_id, kind, name)?
        };
        // -1 never matches a real object id, so excluding it is a
        // no-op when the object is already gone.
        let self_id = object_id.unwrap_or(-1);

        let mut include_up = BTreeSet::new();
        for tag in added {
            if !sibling_has_tag(&store, parent_id, self_id, tag)? {
                include_up.insert(tag.clone());
            }
        }
        let mut exclude_up = BTreeSet::new();
        for tag in removed {
            if !sibling_has_tag(&store, parent_id, self_id, tag)? {
                exclude_up.insert(tag.clone());
            }
        }
        Ok((include_up, exclude_up))
    })();

    match outcome {
        Ok(deltas) => {
            store.release_savepoint(MARK_SAVEPOINT)?;
            Ok(deltas)
        }
        Err(e) => {
            // Best-effort: if the rollback itself fails the connection
            // is about to be dropped anyway, and the original error is
            // the one worth reporting.
            let _ = store.rollback_savepoint(MARK_SAVEPOINT);
            Err(e)
        }
    }
}

/// True if some child of `parent_id` other than `exclude_object`
/// itself carries `tag` (strong for a file, weak-or-strong for a
/// directory — either way it already represents the tag at this
/// level, so no separate entry needs to be added).
fn sibling_has_tag(store: &MetadataStore, parent_id: i64, exclude_object: i64, tag: &str) -> Result<bool> {
    let sql = "SELECT 1 FROM objects o \
               JOIN objects_tags ot ON ot.id_object = o.id \
               JOIN objects t ON t.id = ot.id_tag \
               WHERE o.id_parent = ?1 AND o.id != ?2 AND t.name = ?3 LIMIT 1";
    Ok(store
        .connection()
        .query_row(sql, (parent_id, exclude_object, tag), |_| Ok(()))
        .optional()?
        .is_some())
}
