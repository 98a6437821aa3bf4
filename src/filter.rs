// Copyright 2024 contributors to BeholdFS.

//! The filter evaluator (component C3, spec §4.3).
//!
//! Generalizes `examples/original_source/src/schema.c`'s
//! `BEHOLDDB_DML_LOCATE`/`BEHOLDDB_DML_LISTDIR`/`BEHOLDDB_DML_LISTTAGS`
//! statements from the split `files_tags`/`dirs_tags` schema to the
//! unified `objects`/`objects_tags` schema, evaluated through the
//! `tags`/`include`/`exclude` UDFs in [`crate::store::functions`].

use rusqlite::{OptionalExtension, Savepoint};
use tracing::trace;

use crate::error::Result;
use crate::path::Filter;
use crate::store::schema::ObjectKind;
use crate::store::{functions, MetadataStore};

/// A child object found by [`open_children`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Child {
    pub id: i64,
    pub name: String,
    pub kind: ObjectKind,
}

/// A tag name surfaced by [`open_tag_candidates`], with the number of
/// visible children it is attached to.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct TagCandidate {
    pub name: String,
    pub frequency: i64,
}

const VISIBLE_GROUP_SQL: &str = "
    SELECT o.id, o.name, o.type
    FROM objects o
    LEFT JOIN objects_tags ot ON ot.id_object = o.id
    LEFT JOIN objects t ON t.id = ot.id_tag
    WHERE o.id_parent = ?1
    GROUP BY o.id";

/// `visible(dir_metadata, filter, basename)` (spec §4.3), collapsed to
/// the short-circuit rules plus one SQL query. `store` is `None` when
/// the directory has no metadata file at all, in which case no object
/// carries any tag.
pub fn visible(
    store: Option<&MetadataStore>,
    filter: &Filter,
    parent_id: i64,
    basename: &str,
) -> Result<bool> {
    if filter.is_trivial() || filter.listing {
        return Ok(true);
    }
    let Some(store) = store else {
        return Ok(filter.include.is_empty());
    };
    let blob = functions::encode_filter(filter);
    let sql = "SELECT tags(?2, t.name, o.type, o.name)
         FROM objects o
         LEFT JOIN objects_tags ot ON ot.id_object = o.id
         LEFT JOIN objects t ON t.id = ot.id_tag
         WHERE o.id_parent = ?1 AND o.name = ?3
         GROUP BY o.id";
    trace!(sql, parent_id, basename, "visible");
    let result: Option<i64> = store
        .connection()
        .query_row(sql, (parent_id, &blob, basename), |row| row.get(0))
        .optional()?;
    Ok(result == Some(1))
}

/// `open_children(dir_metadata, parent_id, filter)` (spec §4.3).
pub fn open_children(store: &MetadataStore, parent_id: i64, filter: &Filter) -> Result<Vec<Child>> {
    let blob = functions::encode_filter(filter);
    let sql = format!("{VISIBLE_GROUP_SQL} HAVING tags(?2, t.name, o.type, o.name) = 1 ORDER BY o.name");
    trace!(sql, parent_id, "open_children");
    let mut stmt = store.connection().prepare(&sql)?;
    let rows = stmt.query_map((parent_id, &blob), |row| {
        let kind_raw: i64 = row.get(2)?;
        Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?, kind_raw))
    })?;
    let mut out = Vec::new();
    for row in rows {
        let (id, name, kind_raw) = row?;
        let kind = ObjectKind::from_i64(kind_raw)
            .ok_or_else(|| crate::error::Error::internal(format!("object {id} has bad type {kind_raw}")))?;
        out.push(Child { id, name, kind });
    }
    Ok(out)
}

/// `open_tag_candidates(dir_metadata, filter)` (spec §4.3): tags
/// carried by visible children, not already in the filter, ordered by
/// decreasing frequency (ties broken by name for determinism).
pub fn open_tag_candidates(store: &MetadataStore, parent_id: i64, filter: &Filter) -> Result<Vec<TagCandidate>> {
    let blob = functions::encode_filter(filter);
    let sql = format!(
        "WITH visible_objects AS ({VISIBLE_GROUP_SQL} HAVING tags(?2, t.name, o.type, o.name) = 1)
         SELECT tg.name, COUNT(*) AS freq
         FROM visible_objects vo
         JOIN objects_tags ot2 ON ot2.id_object = vo.id
         JOIN objects tg ON tg.id = ot2.id_tag
         WHERE NOT include(?2, tg.name) AND NOT exclude(?2, tg.name)
         GROUP BY tg.name
         ORDER BY freq DESC, tg.name ASC"
    );
    trace!(sql, parent_id, "open_tag_candidates");
    let mut stmt = store.connection().prepare(&sql)?;
    let rows = stmt.query_map((parent_id, &blob), |row| {
        Ok(TagCandidate {
            name: row.get(0)?,
            frequency: row.get(1)?,
        })
    })?;
    Ok(rows.collect::<rusqlite::Result<_>>()?)
}

/// The scratch-table fast path (`-o new_locate`, spec §4.3): populate
/// a temporary `fast_objects(id, name)` table once inside a savepoint,
/// then answer `visible` by primary-key lookup and `open_children` by
/// a plain scan, instead of re-running the aggregate per call.
pub struct FastLocate<'a> {
    savepoint: Savepoint<'a>,
}

impl<'a> FastLocate<'a> {
    pub fn populate(store: &'a mut MetadataStore, parent_id: i64, filter: &Filter) -> Result<FastLocate<'a>> {
        let savepoint = store.savepoint()?;
        let blob = functions::encode_filter(filter);
        savepoint.execute_batch(
            "CREATE TEMP TABLE fast_objects (id INTEGER PRIMARY KEY, name TEXT UNIQUE, type INTEGER)",
        )?;
        let sql = format!(
            "INSERT INTO fast_objects (id, name, type) \
             SELECT o.id, o.name, o.type FROM ({VISIBLE_GROUP_SQL} HAVING tags(?2, t.name, o.type, o.name) = 1) o"
        );
        trace!(sql, parent_id, "fast_locate populate");
        savepoint.execute(&sql, (parent_id, &blob))?;
        Ok(FastLocate { savepoint })
    }

    pub fn visible(&self, name: &str) -> Result<bool> {
        Ok(self
            .savepoint
            .query_row("SELECT 1 FROM fast_objects WHERE name = ?1", [name], |_| Ok(()))
            .optional()?
            .is_some())
    }

    pub fn children(&self) -> Result<Vec<Child>> {
        let mut stmt = self
            .savepoint
            .prepare("SELECT id, name, type FROM fast_objects ORDER BY name")?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?, row.get::<_, i64>(2)?))
        })?;
        let mut out = Vec::new();
        for row in rows {
            let (id, name, kind_raw) = row?;
            let kind = ObjectKind::from_i64(kind_raw)
                .ok_or_else(|| crate::error::Error::internal(format!("object {id} has bad type {kind_raw}")))?;
            out.push(Child { id, name, kind });
        }
        Ok(out)
    }

    /// Release the savepoint; rolling it back (the default on drop if
    /// this is never called) is equivalent to dropping the scratch
    /// table (spec §4.3).
    pub fn close(self) -> Result<()> {
        self.savepoint.rollback()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::schema::ObjectKind as Kind;
    use tempfile::tempdir;

    fn filter(include: &[&str], exclude: &[&str]) -> Filter {
        Filter {
            include: include.iter().map(|s| s.to_string()).collect(),
            exclude: exclude.iter().map(|s| s.to_string()).collect(),
            listing: false,
        }
    }

    #[test]
    fn simple_filter_scenario() {
        let dir = tempdir().unwrap();
        let store = MetadataStore::open_write(dir.path()).unwrap();
        let root = store.root_id().unwrap();
        let a = store.create_object(root, Kind::File, "a").unwrap();
        let b = store.create_object(root, Kind::File, "b").unwrap();
        let c = store.create_object(root, Kind::File, "c").unwrap();
        let red = store.ensure_tag("red").unwrap();
        let blue = store.ensure_tag("blue").unwrap();
        store.link_tag(a, red).unwrap();
        store.link_tag(b, blue).unwrap();
        store.link_tag(c, red).unwrap();
        store.link_tag(c, blue).unwrap();

        let names = |children: Vec<Child>| -> Vec<String> {
            let mut v: Vec<_> = children.into_iter().map(|c| c.name).collect();
            v.sort();
            v
        };

        assert_eq!(
            names(open_children(&store, root, &filter(&["red"], &[])).unwrap()),
            vec!["a", "c"]
        );
        assert_eq!(
            names(open_children(&store, root, &filter(&["red"], &["blue"])).unwrap()),
            vec!["a"]
        );
        assert!(open_children(&store, root, &filter(&["green"], &[]))
            .unwrap()
            .is_empty());
    }

    #[test]
    fn directory_promotion_via_weak_tag() {
        let dir = tempdir().unwrap();
        let store = MetadataStore::open_write(dir.path()).unwrap();
        let root = store.root_id().unwrap();
        let d = store.ensure_directory(root, "d").unwrap();
        let e = store.create_object(d, Kind::File, "e").unwrap();
        let x = store.ensure_tag("x").unwrap();
        store.link_tag(e, x).unwrap();
        // Simulates the mark engine's weak-tag propagation onto `d`.
        store.link_tag(d, x).unwrap();

        let children = open_children(&store, root, &filter(&["x"], &[])).unwrap();
        assert_eq!(children.len(), 1);
        assert_eq!(children[0].name, "d");
        assert!(visible(Some(&store), &filter(&["x"], &[]), root, "d").unwrap());
    }

    #[test]
    fn exclude_does_not_hide_a_directory_with_some_matching_descendants() {
        let dir = tempdir().unwrap();
        let store = MetadataStore::open_write(dir.path()).unwrap();
        let root = store.root_id().unwrap();
        let d = store.ensure_directory(root, "d").unwrap();
        let tagged = store.create_object(d, Kind::File, "tagged").unwrap();
        store.create_object(d, Kind::File, "plain").unwrap();
        let t = store.ensure_tag("t").unwrap();
        store.link_tag(tagged, t).unwrap();
        store.link_tag(d, t).unwrap(); // weak summary at d

        assert!(visible(Some(&store), &filter(&[], &["t"]), root, "d").unwrap());
    }

    #[test]
    fn tag_candidates_ordered_by_frequency() {
        let dir = tempdir().unwrap();
        let store = MetadataStore::open_write(dir.path()).unwrap();
        let root = store.root_id().unwrap();
        let f1 = store.create_object(root, Kind::File, "f1").unwrap();
        let f2 = store.create_object(root, Kind::File, "f2").unwrap();
        let f3 = store.create_object(root, Kind::File, "f3").unwrap();
        let a = store.ensure_tag("a").unwrap();
        let b = store.ensure_tag("b").unwrap();
        store.link_tag(f1, a).unwrap();
        store.link_tag(f2, a).unwrap();
        store.link_tag(f3, a).unwrap();
        store.link_tag(f2, b).unwrap();

        let candidates = open_tag_candidates(&store, root, &filter(&[], &[])).unwrap();
        assert_eq!(candidates[0].name, "a");
        assert_eq!(candidates[0].frequency, 3);
        assert_eq!(candidates[1].name, "b");
        assert_eq!(candidates[1].frequency, 1);
    }

    #[test]
    fn fast_locate_matches_slow_path() {
        let dir = tempdir().unwrap();
        let mut store = MetadataStore::open_write(dir.path()).unwrap();
        let root = store.root_id().unwrap();
        let a = store.create_object(root, Kind::File, "a").unwrap();
        let red = store.ensure_tag("red").unwrap();
        store.link_tag(a, red).unwrap();

        let f = filter(&["red"], &[]);
        let fast = FastLocate::populate(&mut store, root, &f).unwrap();
        assert!(fast.visible("a").unwrap());
        assert_eq!(fast.children().unwrap().len(), 1);
        fast.close().unwrap();
    }
}
