// Copyright 2024 contributors to BeholdFS.

//! The virtual-path parser (component C1, spec §4.1).
//!
//! Splits a FUSE-presented path into a backing-store real path and a
//! [`Filter`], in one forward pass with no backtracking, per the
//! original `beholddb_parse_path` (`examples/original_source/src/beholddb.c`).
//! Tag names are collected into owned `String`s rather than the
//! original's intrusive `name`/`next` linked list (spec §9): there is
//! one parse per request and the whole [`ParsedPath`] is dropped at
//! the end of it.

use crate::config::Config;
use crate::error::{Error, Result};

/// A request-scoped include/exclude tag filter (spec §3).
#[derive(Clone, Debug, Default, Eq, PartialEq, Hash)]
pub struct Filter {
    /// Tag names that must all be present.
    pub include: Vec<String>,
    /// Tag names that must all be absent.
    pub exclude: Vec<String>,
    /// Whether this request targets the synthetic tag-listing view.
    pub listing: bool,
}

impl Filter {
    /// A filter with empty include/exclude and `listing = false`.
    ///
    /// Per spec §4.3, this is always visible without opening a store.
    pub fn is_trivial(&self) -> bool {
        self.include.is_empty() && self.exclude.is_empty() && !self.listing
    }

    /// Swap `include` and `exclude`, for callers that need to
    /// anti-match this filter.
    pub fn invert(&mut self) {
        std::mem::swap(&mut self.include, &mut self.exclude);
    }
}

/// The result of parsing a virtual FUSE path (spec §3).
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ParsedPath {
    /// Backing-store path, always relative (leading `.`), tag
    /// components stripped.
    pub realpath: String,
    /// Byte offset of the final `name` component within `realpath`,
    /// or `None` when the path denotes the root.
    basename_start: Option<usize>,
    /// Ordered real path components, used by C5 to create ancestor
    /// objects.
    pub components: Vec<String>,
    /// The request's tag filter.
    pub filter: Filter,
}

impl ParsedPath {
    /// The final real-path component, or `None` for the root.
    pub fn basename(&self) -> Option<&str> {
        self.basename_start.map(|start| &self.realpath[start..])
    }
}

fn find_sigil(s: &str, sigil: u8) -> Option<usize> {
    // The sigil is a single configured byte; since it is restricted to
    // the ASCII range, a byte-for-byte search is always on a UTF-8
    // char boundary (ASCII bytes never occur as continuation bytes).
    s.as_bytes().iter().position(|&b| b == sigil)
}

/// Parse `path` (which must begin with `/`) into a [`ParsedPath`].
///
/// When `invert` is set, `include` and `exclude` are swapped as the
/// final step (spec §4.1 rule 5), for callers such as an anti-match
/// lookup.
pub fn parse_path(path: &str, config: &Config, invert: bool) -> Result<ParsedPath> {
    if !path.starts_with('/') {
        return Err(Error::malformed_path(path));
    }

    let mut realpath = String::with_capacity(path.len() + 1);
    realpath.push('.');
    let mut basename_start = None;
    let mut components = Vec::new();
    let mut include = Vec::new();
    let mut exclude = Vec::new();
    let mut listing = false;

    let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
    let last_index = segments.len().saturating_sub(1);

    for (i, seg) in segments.iter().enumerate() {
        let is_last = i == last_index;
        if seg.as_bytes().first() == Some(&config.tag_sigil) {
            let mut rest = *seg;
            loop {
                rest = &rest[1..]; // drop the sigil just matched
                if rest.is_empty() {
                    if !is_last {
                        // Open question (spec §9): `listing` is only
                        // valid as the final path segment.
                        return Err(Error::malformed_path(path));
                    }
                    listing = true;
                    break;
                }
                let is_exclude = rest.as_bytes()[0] == b'-';
                if is_exclude {
                    rest = &rest[1..];
                }
                let end = find_sigil(rest, config.tag_sigil).unwrap_or(rest.len());
                let name = &rest[..end];
                if name.is_empty() {
                    return Err(Error::malformed_path(path));
                }
                if is_exclude {
                    exclude.push(name.to_string());
                } else {
                    include.push(name.to_string());
                }
                rest = &rest[end..];
                if rest.is_empty() {
                    break;
                }
                // `rest` now starts with the sigil again; loop.
            }
        } else {
            if config.is_reserved_name(seg) {
                return Err(Error::malformed_path(path));
            }
            realpath.push('/');
            basename_start = Some(realpath.len());
            realpath.push_str(seg);
            components.push(seg.to_string());
        }
    }

    let mut filter = Filter {
        include,
        exclude,
        listing,
    };
    if invert {
        filter.invert();
    }

    Ok(ParsedPath {
        realpath,
        basename_start,
        components,
        filter,
    })
}
