// Copyright 2024 contributors to BeholdFS.

//! The per-directory metadata store (component C2, spec §4.2, §3).
//!
//! Grounded on `examples/original_source/src/schema.c` for the schema
//! and `examples/original_source/src/version.c` for the version policy,
//! generalized to the unified `objects` schema (spec §9) and wrapped in
//! conserve's connection-owning-handle style (`gc_lock.rs`).

pub mod functions;
pub mod schema;

use std::path::{Path, PathBuf};

use rusqlite::{Connection, OptionalExtension, Savepoint};
use tracing::trace;

use crate::config::METADATA_FILE_NAME;
use crate::error::{Error, Result};
use schema::{ObjectKind, CREATE_SCHEMA, CURRENT_MAJOR, CURRENT_MINOR, ROOT_NAME, VERSION_KEY};

/// A connection to one directory's `.beholdfs` metadata file.
///
/// Opened read/write for mutations, read-only for lookups (spec §3
/// "Lifecycles"); closed (dropped) at the end of each top-level
/// operation by its owner (C7).
pub struct MetadataStore {
    conn: Connection,
}

fn metadata_path(dir: &Path) -> PathBuf {
    dir.join(METADATA_FILE_NAME)
}

fn exec(conn: &Connection, sql: &str) -> Result<()> {
    trace!(sql, "executing statement");
    conn.execute_batch(sql)?;
    Ok(())
}

impl MetadataStore {
    /// Open `dir`'s metadata file read-only. Returns `Ok(None)` if it
    /// does not exist: a directory with no tags has nothing to say
    /// about visibility beyond the trivial-filter short circuit.
    pub fn open_read(dir: &Path) -> Result<Option<MetadataStore>> {
        let path = metadata_path(dir);
        if !path.exists() {
            return Ok(None);
        }
        let conn = Connection::open_with_flags(
            &path,
            rusqlite::OpenFlags::SQLITE_OPEN_READ_ONLY | rusqlite::OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        functions::register(&conn)?;
        let store = MetadataStore { conn };
        store.check_version()?;
        Ok(Some(store))
    }

    /// Open `dir`'s metadata file read/write, creating it (with the
    /// root object and current schema version) if it does not exist.
    pub fn open_write(dir: &Path) -> Result<MetadataStore> {
        let path = metadata_path(dir);
        let conn = Connection::open(&path)?;
        functions::register(&conn)?;
        let store = MetadataStore { conn };
        store.init_schema()?;
        store.reconcile_version()?;
        Ok(store)
    }

    pub(crate) fn connection(&self) -> &Connection {
        &self.conn
    }

    pub fn savepoint(&mut self) -> Result<Savepoint<'_>> {
        Ok(self.conn.savepoint()?)
    }

    /// Begin a named savepoint on the raw connection. Used by the mark
    /// engine and mutation API, one per public operation / mark level
    /// (spec §5), rather than the typed [`Savepoint`] RAII guard,
    /// because those callers span several high-level `MetadataStore`
    /// method calls rather than one lexical scope.
    pub fn begin_savepoint(&self, name: &str) -> Result<()> {
        let sql = format!("SAVEPOINT {name}");
        trace!(sql, "begin_savepoint");
        self.conn.execute_batch(&sql)?;
        Ok(())
    }

    pub fn release_savepoint(&self, name: &str) -> Result<()> {
        let sql = format!("RELEASE {name}");
        trace!(sql, "release_savepoint");
        self.conn.execute_batch(&sql)?;
        Ok(())
    }

    pub fn rollback_savepoint(&self, name: &str) -> Result<()> {
        let sql = format!("ROLLBACK TO {name}; RELEASE {name};");
        trace!(sql, "rollback_savepoint");
        self.conn.execute_batch(&sql)?;
        Ok(())
    }

    fn init_schema(&self) -> Result<()> {
        exec(&self.conn, CREATE_SCHEMA)?;
        let root = self.find_object(0, ObjectKind::Directory, ROOT_NAME)?;
        if root.is_none() {
            trace!("seeding root object and self-ownership edge");
            self.conn.execute(
                "INSERT INTO objects (id_parent, type, name) VALUES (NULL, ?1, ?2)",
                (ObjectKind::Directory as i64, ROOT_NAME),
            )?;
            let id = self.conn.last_insert_rowid();
            self.conn.execute(
                "INSERT INTO objects_owners (id_owner, id_object) VALUES (?1, ?1)",
                [id],
            )?;
        }
        Ok(())
    }

    fn stored_version(&self) -> Result<Option<(u32, u32)>> {
        let raw: Option<String> = self
            .conn
            .query_row(
                "SELECT value FROM config WHERE param = ?1",
                [VERSION_KEY],
                |row| row.get(0),
            )
            .optional()?;
        let Some(raw) = raw else { return Ok(None) };
        let (major, minor) = raw
            .split_once('.')
            .and_then(|(a, b)| Some((a.parse().ok()?, b.parse().ok()?)))
            .ok_or_else(|| Error::internal(format!("malformed stored version {raw:?}")))?;
        Ok(Some((major, minor)))
    }

    fn write_version(&self, major: u32, minor: u32) -> Result<()> {
        self.conn.execute(
            "INSERT INTO config (param, value) VALUES (?1, ?2)",
            (VERSION_KEY, format!("{major}.{minor}")),
        )?;
        Ok(())
    }

    /// Read-only version check: refuse a metadata file from a newer
    /// major version (spec §4.2).
    fn check_version(&self) -> Result<()> {
        let Some((major, minor)) = self.stored_version()? else {
            return Ok(());
        };
        if major > CURRENT_MAJOR {
            return Err(Error::VersionTooNew {
                found: format!("{major}.{minor}"),
                supported: format!("{CURRENT_MAJOR}.{CURRENT_MINOR}"),
            });
        }
        if major == CURRENT_MAJOR && minor > CURRENT_MINOR {
            tracing::warn!(
                found = format!("{major}.{minor}"),
                supported = format!("{CURRENT_MAJOR}.{CURRENT_MINOR}"),
                "metadata store minor version is ahead of this binary"
            );
        }
        Ok(())
    }

    /// Read/write version check, with write-back when the binary is
    /// ahead of a store that predates it (SPEC_FULL.md supplement 1).
    fn reconcile_version(&self) -> Result<()> {
        match self.stored_version()? {
            None => self.write_version(CURRENT_MAJOR, CURRENT_MINOR),
            Some((major, minor)) => {
                if major > CURRENT_MAJOR {
                    return Err(Error::VersionTooNew {
                        found: format!("{major}.{minor}"),
                        supported: format!("{CURRENT_MAJOR}.{CURRENT_MINOR}"),
                    });
                }
                if major < CURRENT_MAJOR || (major == CURRENT_MAJOR && minor < CURRENT_MINOR) {
                    trace!(
                        from = format!("{major}.{minor}"),
                        to = format!("{CURRENT_MAJOR}.{CURRENT_MINOR}"),
                        "writing back metadata version"
                    );
                    self.write_version(CURRENT_MAJOR, CURRENT_MINOR)?;
                }
                Ok(())
            }
        }
    }

    pub fn root_id(&self) -> Result<i64> {
        self.find_object(0, ObjectKind::Directory, ROOT_NAME)?
            .ok_or_else(|| Error::internal("metadata store has no root object"))
    }

    /// `parent = 0` is used internally to mean "no parent" (the root's
    /// own row and every TAG object), since `objects.id` is never 0.
    pub fn find_object(&self, parent: i64, kind: ObjectKind, name: &str) -> Result<Option<i64>> {
        let sql = "SELECT id FROM objects WHERE \
                    (id_parent IS NULL AND ?1 = 0 OR id_parent = ?1) AND type = ?2 AND name = ?3";
        trace!(sql, parent, ?kind, name, "find_object");
        Ok(self
            .conn
            .query_row(sql, (parent, kind as i64, name), |row| row.get(0))
            .optional()?)
    }

    pub fn object_name(&self, id: i64) -> Result<String> {
        Ok(self
            .conn
            .query_row("SELECT name FROM objects WHERE id = ?1", [id], |row| {
                row.get(0)
            })
            .optional()?
            .ok_or_else(|| Error::internal(format!("object {id} has no row")))?)
    }

    pub fn object_kind(&self, id: i64) -> Result<ObjectKind> {
        let raw: i64 = self
            .conn
            .query_row("SELECT type FROM objects WHERE id = ?1", [id], |row| {
                row.get(0)
            })
            .optional()?
            .ok_or_else(|| Error::internal(format!("object {id} has no row")))?;
        ObjectKind::from_i64(raw).ok_or_else(|| Error::internal(format!("object {id} has bad type {raw}")))
    }

    /// Create `name` under `parent` with `kind`. Errors with `Exists`
    /// if the `(parent, kind, name)` triple is already taken.
    pub fn create_object(&self, parent: i64, kind: ObjectKind, name: &str) -> Result<i64> {
        if self.find_object(parent, kind, name)?.is_some() {
            return Err(Error::exists(name));
        }
        let sql = "INSERT INTO objects (id_parent, type, name) VALUES (?1, ?2, ?3)";
        trace!(sql, parent, ?kind, name, "create_object");
        let parent_param: Option<i64> = if parent == 0 { None } else { Some(parent) };
        self.conn.execute(sql, (parent_param, kind as i64, name))?;
        let id = self.conn.last_insert_rowid();
        self.add_owner_edges(id, parent)?;
        Ok(id)
    }

    /// Get-or-create a DIRECTORY named `name` under `parent`: used by
    /// C5 `create` to materialize intermediate path components.
    pub fn ensure_directory(&self, parent: i64, name: &str) -> Result<i64> {
        if let Some(id) = self.find_object(parent, ObjectKind::Directory, name)? {
            return Ok(id);
        }
        let sql = "INSERT INTO objects (id_parent, type, name) VALUES (?1, ?2, ?3)";
        trace!(sql, parent, name, "ensure_directory");
        self.conn
            .execute(sql, (parent, ObjectKind::Directory as i64, name))?;
        let id = self.conn.last_insert_rowid();
        self.add_owner_edges(id, parent)?;
        Ok(id)
    }

    /// Get-or-create the TAG object named `name` (no parent).
    pub fn ensure_tag(&self, name: &str) -> Result<i64> {
        if let Some(id) = self.find_object(0, ObjectKind::Tag, name)? {
            return Ok(id);
        }
        let sql = "INSERT INTO objects (id_parent, type, name) VALUES (NULL, ?1, ?2)";
        trace!(sql, name, "ensure_tag");
        self.conn
            .execute(sql, (ObjectKind::Tag as i64, name))?;
        let id = self.conn.last_insert_rowid();
        // A TAG object owns only itself; it is never a containment
        // parent, so it needs no further ownership edges.
        self.conn
            .execute("INSERT INTO objects_owners (id_owner, id_object) VALUES (?1, ?1)", [id])?;
        Ok(id)
    }

    /// Record that every ancestor of `parent` (including `parent`
    /// itself) also owns the freshly created `child` (spec §3
    /// ownership-edge invariant), plus `child`'s self-edge.
    fn add_owner_edges(&self, child: i64, parent: i64) -> Result<()> {
        if parent == 0 {
            // The root object: it owns itself, nothing more.
            self.conn
                .execute("INSERT OR IGNORE INTO objects_owners (id_owner, id_object) VALUES (?1, ?1)", [child])?;
            return Ok(());
        }
        let sql = "INSERT OR IGNORE INTO objects_owners (id_owner, id_object) \
                    SELECT id_owner, ?1 FROM objects_owners WHERE id_object = ?2 \
                    UNION SELECT ?1, ?1";
        trace!(sql, child, parent, "add_owner_edges");
        self.conn.execute(sql, (child, parent))?;
        Ok(())
    }

    /// Delete an object; `ON DELETE CASCADE` removes its ownership and
    /// tag-link rows (spec §4.5).
    pub fn delete_object(&self, id: i64) -> Result<()> {
        let sql = "DELETE FROM objects WHERE id = ?1";
        trace!(sql, id, "delete_object");
        let changed = self.conn.execute(sql, [id])?;
        if changed == 0 {
            return Err(Error::internal(format!("delete_object: no row for {id}")));
        }
        Ok(())
    }

    pub fn rename_object(&self, id: i64, new_parent: i64, new_name: &str) -> Result<()> {
        let kind = self.object_kind(id)?;
        if self.find_object(new_parent, kind, new_name)?.is_some() {
            return Err(Error::exists(new_name));
        }
        let sql = "UPDATE objects SET id_parent = ?1, name = ?2 WHERE id = ?3";
        let parent_param: Option<i64> = if new_parent == 0 { None } else { Some(new_parent) };
        trace!(sql, id, new_parent, new_name, "rename_object");
        self.conn.execute(sql, (parent_param, new_name, id))?;
        self.add_owner_edges(id, new_parent)?;
        Ok(())
    }

    pub fn link_tag(&self, object_id: i64, tag_id: i64) -> Result<bool> {
        let sql = "INSERT OR IGNORE INTO objects_tags (id_object, id_tag) VALUES (?1, ?2)";
        trace!(sql, object_id, tag_id, "link_tag");
        Ok(self.conn.execute(sql, (object_id, tag_id))? > 0)
    }

    pub fn unlink_tag(&self, object_id: i64, tag_id: i64) -> Result<bool> {
        let sql = "DELETE FROM objects_tags WHERE id_object = ?1 AND id_tag = ?2";
        trace!(sql, object_id, tag_id, "unlink_tag");
        Ok(self.conn.execute(sql, (object_id, tag_id))? > 0)
    }

    pub fn object_tag_names(&self, object_id: i64) -> Result<Vec<String>> {
        let mut stmt = self.conn.prepare(
            "SELECT o.name FROM objects_tags ot JOIN objects o ON o.id = ot.id_tag \
             WHERE ot.id_object = ?1 ORDER BY o.name",
        )?;
        let rows = stmt.query_map([object_id], |row| row.get(0))?;
        Ok(rows.collect::<rusqlite::Result<_>>()?)
    }

    pub fn object_tag_ids(&self, object_id: i64) -> Result<Vec<i64>> {
        let mut stmt = self
            .conn
            .prepare("SELECT id_tag FROM objects_tags WHERE id_object = ?1")?;
        let rows = stmt.query_map([object_id], |row| row.get(0))?;
        Ok(rows.collect::<rusqlite::Result<_>>()?)
    }

    pub fn tag_link_count(&self, tag_id: i64) -> Result<i64> {
        Ok(self.conn.query_row(
            "SELECT COUNT(*) FROM objects_tags WHERE id_tag = ?1",
            [tag_id],
            |row| row.get(0),
        )?)
    }

    /// Delete `tag_id` if it has no remaining links (SPEC_FULL.md P9).
    /// Returns whether it was removed.
    pub fn gc_tag_if_unused(&self, tag_id: i64) -> Result<bool> {
        if self.tag_link_count(tag_id)? > 0 {
            return Ok(false);
        }
        trace!(tag_id, "garbage-collecting unused tag object");
        self.delete_object(tag_id)?;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn creates_root_and_version_on_first_write() {
        let dir = tempdir().unwrap();
        let store = MetadataStore::open_write(dir.path()).unwrap();
        let root = store.root_id().unwrap();
        assert_eq!(store.object_name(root).unwrap(), ROOT_NAME);
        assert_eq!(store.stored_version().unwrap(), Some((CURRENT_MAJOR, CURRENT_MINOR)));
    }

    #[test]
    fn open_read_on_missing_file_is_none() {
        let dir = tempdir().unwrap();
        assert!(MetadataStore::open_read(dir.path()).unwrap().is_none());
    }

    #[test]
    fn create_object_rejects_duplicate() {
        let dir = tempdir().unwrap();
        let store = MetadataStore::open_write(dir.path()).unwrap();
        let root = store.root_id().unwrap();
        store.create_object(root, ObjectKind::File, "a").unwrap();
        assert!(matches!(
            store.create_object(root, ObjectKind::File, "a"),
            Err(Error::Exists { .. })
        ));
    }

    #[test]
    fn tag_lifecycle_and_gc() {
        let dir = tempdir().unwrap();
        let store = MetadataStore::open_write(dir.path()).unwrap();
        let root = store.root_id().unwrap();
        let file = store.create_object(root, ObjectKind::File, "a").unwrap();
        let tag = store.ensure_tag("red").unwrap();
        assert!(store.link_tag(file, tag).unwrap());
        assert_eq!(store.object_tag_names(file).unwrap(), vec!["red".to_string()]);
        assert!(store.unlink_tag(file, tag).unwrap());
        assert!(store.gc_tag_if_unused(tag).unwrap());
        assert!(store.find_object(0, ObjectKind::Tag, "red").unwrap().is_none());
    }

    #[test]
    fn ownership_edges_include_every_ancestor() {
        let dir = tempdir().unwrap();
        let store = MetadataStore::open_write(dir.path()).unwrap();
        let root = store.root_id().unwrap();
        let d = store.ensure_directory(root, "d").unwrap();
        let f = store.create_object(d, ObjectKind::File, "e").unwrap();

        let owners: Vec<i64> = store
            .conn
            .prepare("SELECT id_owner FROM objects_owners WHERE id_object = ?1 ORDER BY id_owner")
            .unwrap()
            .query_map([f], |row| row.get(0))
            .unwrap()
            .collect::<rusqlite::Result<_>>()
            .unwrap();
        let mut expected = vec![root, d, f];
        expected.sort();
        assert_eq!(owners, expected);
    }
}
