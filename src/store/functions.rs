// Copyright 2024 contributors to BeholdFS.

//! The `tags`/`include`/`exclude` user-defined SQL functions (spec §4.2).
//!
//! A [`Filter`] is bound to statements as an opaque BLOB (`encode_filter`)
//! and decoded inside the functions below, rather than passed as a raw
//! pointer the way the original C bound `struct beholddb_path_tags *`
//! directly — there is no safe equivalent of that trick across the
//! `rusqlite` FFI boundary, and the filters here are small enough that
//! a length-prefixed encoding costs nothing that matters.

use std::collections::HashSet;
use std::fmt;

use rusqlite::functions::{Aggregate, Context, FunctionFlags};
use rusqlite::{Connection, Error as SqlError, Result as SqlResult};

use crate::path::Filter;
use crate::store::schema::ObjectKind;

#[derive(Debug)]
struct BlobError(&'static str);

impl fmt::Display for BlobError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "malformed filter blob: {}", self.0)
    }
}

impl std::error::Error for BlobError {}

fn blob_err(why: &'static str) -> SqlError {
    SqlError::UserFunctionError(Box::new(BlobError(why)))
}

/// Encode a [`Filter`]'s `include`/`exclude` lists as a self-describing
/// byte blob: two length-prefixed lists of length-prefixed UTF-8 names.
pub fn encode_filter(filter: &Filter) -> Vec<u8> {
    let mut buf = Vec::new();
    encode_list(&filter.include, &mut buf);
    encode_list(&filter.exclude, &mut buf);
    buf
}

fn encode_list(names: &[String], buf: &mut Vec<u8>) {
    buf.extend_from_slice(&(names.len() as u32).to_le_bytes());
    for name in names {
        let bytes = name.as_bytes();
        buf.extend_from_slice(&(bytes.len() as u16).to_le_bytes());
        buf.extend_from_slice(bytes);
    }
}

struct DecodedFilter {
    include: HashSet<String>,
    exclude: HashSet<String>,
}

fn decode_filter(blob: &[u8]) -> SqlResult<DecodedFilter> {
    let mut pos = 0;
    let include = decode_list(blob, &mut pos)?;
    let exclude = decode_list(blob, &mut pos)?;
    Ok(DecodedFilter { include, exclude })
}

fn decode_list(blob: &[u8], pos: &mut usize) -> SqlResult<HashSet<String>> {
    let count = read_u32(blob, pos)?;
    let mut out = HashSet::with_capacity(count as usize);
    for _ in 0..count {
        let len = read_u16(blob, pos)? as usize;
        let end = pos.checked_add(len).ok_or_else(|| blob_err("name overruns blob"))?;
        let bytes = blob.get(*pos..end).ok_or_else(|| blob_err("name overruns blob"))?;
        let name = std::str::from_utf8(bytes)
            .map_err(|_| blob_err("name is not utf-8"))?
            .to_string();
        out.insert(name);
        *pos = end;
    }
    Ok(out)
}

fn read_u32(blob: &[u8], pos: &mut usize) -> SqlResult<u32> {
    let end = *pos + 4;
    let bytes: [u8; 4] = blob
        .get(*pos..end)
        .ok_or_else(|| blob_err("truncated length prefix"))?
        .try_into()
        .unwrap();
    *pos = end;
    Ok(u32::from_le_bytes(bytes))
}

fn read_u16(blob: &[u8], pos: &mut usize) -> SqlResult<u16> {
    let end = *pos + 2;
    let bytes: [u8; 2] = blob
        .get(*pos..end)
        .ok_or_else(|| blob_err("truncated length prefix"))?
        .try_into()
        .unwrap();
    *pos = end;
    Ok(u16::from_le_bytes(bytes))
}

/// Running state of one `tags(...)` aggregate call, one per candidate
/// object (the query groups rows by object id).
#[derive(Default)]
struct TagsState {
    filter: Option<DecodedFilter>,
    include_left: HashSet<String>,
    exclude_hit: bool,
}

struct TagsAggregate;

impl Aggregate<TagsState, i64> for TagsAggregate {
    fn init(&self, _ctx: &mut Context<'_>) -> SqlResult<TagsState> {
        Ok(TagsState::default())
    }

    fn step(&self, ctx: &mut Context<'_>, state: &mut TagsState) -> SqlResult<()> {
        if state.filter.is_none() {
            let blob: Vec<u8> = ctx.get(0)?;
            let decoded = decode_filter(&blob)?;
            state.include_left = decoded.include.clone();
            state.filter = Some(decoded);
        }
        // A candidate with no tag links at all still contributes one
        // row via the LEFT JOIN, with a NULL tag name; it can only
        // satisfy the aggregate when `include` is already empty.
        let tag_name: Option<String> = ctx.get(1)?;
        let Some(tag_name) = tag_name else {
            return Ok(());
        };
        let object_type: i64 = ctx.get(2)?;
        state.include_left.remove(&tag_name);
        if object_type == ObjectKind::File as i64
            && state.filter.as_ref().unwrap().exclude.contains(&tag_name)
        {
            state.exclude_hit = true;
        }
        Ok(())
    }

    fn finalize(&self, _ctx: &mut Context<'_>, state: Option<TagsState>) -> SqlResult<i64> {
        let state = state.unwrap_or_default();
        Ok(i64::from(state.include_left.is_empty() && !state.exclude_hit))
    }
}

/// Install `tags`, `include`, and `exclude` on `conn` (spec §4.2).
pub fn register(conn: &Connection) -> SqlResult<()> {
    let flags = FunctionFlags::SQLITE_UTF8 | FunctionFlags::SQLITE_DETERMINISTIC;

    conn.create_aggregate_function("tags", 4, flags, TagsAggregate)?;

    conn.create_scalar_function("include", 2, flags, |ctx: &Context<'_>| {
        let blob: Vec<u8> = ctx.get(0)?;
        let tag_name: String = ctx.get(1)?;
        Ok(decode_filter(&blob)?.include.contains(&tag_name))
    })?;

    conn.create_scalar_function("exclude", 2, flags, |ctx: &Context<'_>| {
        let blob: Vec<u8> = ctx.get(0)?;
        let tag_name: String = ctx.get(1)?;
        Ok(decode_filter(&blob)?.exclude.contains(&tag_name))
    })?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_blob() {
        let filter = Filter {
            include: vec!["red".to_string(), "blue".to_string()],
            exclude: vec!["green".to_string()],
            listing: false,
        };
        let blob = encode_filter(&filter);
        let decoded = decode_filter(&blob).unwrap();
        assert!(decoded.include.contains("red"));
        assert!(decoded.include.contains("blue"));
        assert!(decoded.exclude.contains("green"));
        assert!(!decoded.exclude.contains("red"));
    }

    #[test]
    fn tags_aggregate_matches_visibility_rules() {
        let conn = Connection::open_in_memory().unwrap();
        register(&conn).unwrap();
        conn.execute_batch(
            "CREATE TABLE rows(tag_name TEXT, object_type INTEGER);
             INSERT INTO rows VALUES ('red', 0), ('blue', 0);",
        )
        .unwrap();

        let filter = Filter {
            include: vec!["red".to_string()],
            exclude: vec!["blue".to_string()],
            listing: false,
        };
        let blob = encode_filter(&filter);

        let visible: i64 = conn
            .query_row(
                "SELECT tags(?1, tag_name, object_type, 'x') FROM rows",
                [&blob],
                |row| row.get(0),
            )
            .unwrap();
        // 'blue' is a FILE-type tag in the exclude set: hidden.
        assert_eq!(visible, 0);
    }

    #[test]
    fn exclude_on_a_directory_row_does_not_hide_it() {
        let conn = Connection::open_in_memory().unwrap();
        register(&conn).unwrap();
        conn.execute_batch(
            "CREATE TABLE rows(tag_name TEXT, object_type INTEGER);
             INSERT INTO rows VALUES ('blue', 1);", // DIRECTORY
        )
        .unwrap();

        let filter = Filter {
            include: vec![],
            exclude: vec!["blue".to_string()],
            listing: false,
        };
        let blob = encode_filter(&filter);

        let visible: i64 = conn
            .query_row(
                "SELECT tags(?1, tag_name, object_type, 'd') FROM rows",
                [&blob],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(visible, 1);
    }
}
