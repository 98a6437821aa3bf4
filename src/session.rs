// Copyright 2024 contributors to BeholdFS.

//! The open-handle / session manager (component C7, spec §4.7).
//!
//! Grounded on conserve's `gc_lock.rs` (a `Drop`-based guard releasing
//! a held resource in a fixed order) and
//! `examples/original_source/src/beholddb.c`'s
//! `beholddb_opendir`/`beholddb_closedir` pairing. The original keeps a
//! live `sqlite3_stmt` open across the handle's whole lifetime and
//! steps it once per `readdir()` call; here the listing is computed
//! once at `open` time into a plain `Vec`, which already satisfies
//! FUSE's "readdir may be restarted at offset 0" contract by ordinary
//! indexing and needs no cursor to keep alive.

use std::path::Path;

use tracing::warn;

use crate::config::Config;
use crate::error::Result;
use crate::iter::{self, Entry};
use crate::path::Filter;
use crate::store::MetadataStore;

const SESSION_SAVEPOINT: &str = "beholdfs_session";

/// An open directory handle spanning one `opendir`..`releasedir` pair.
///
/// Field order is release order (spec §4.7): dropping a `Session` rolls
/// back the session savepoint before the metadata connection itself is
/// closed. The backing-store directory iterator named in the spec has
/// no separate field to release — `std::fs::read_dir` is consumed in
/// full by [`iter::list`] while building the replay buffer below, and
/// nothing about it needs to outlive that call.
pub struct Session {
    store: Option<MetadataStore>,
    entries: Vec<Entry>,
}

impl Session {
    /// Open a directory handle for `real_dir` under `filter`. Opens the
    /// metadata store only if the filter needs one (spec §4.3's
    /// `store.is_none()` short circuit), and begins a named savepoint
    /// on it for the evaluation that follows.
    pub fn open(real_dir: &Path, filter: &Filter, config: &Config) -> Result<Session> {
        let needs_store = !filter.is_trivial() || filter.listing;
        let store = if needs_store {
            MetadataStore::open_read(real_dir)?
        } else {
            None
        };

        let (mut store, parent_id) = match store {
            Some(store) => {
                let root = store.root_id()?;
                store.begin_savepoint(SESSION_SAVEPOINT)?;
                (Some(store), root)
            }
            None => (None, 0),
        };

        let entries = match iter::list(real_dir, store.as_mut(), parent_id, filter, config) {
            Ok(entries) => entries,
            Err(e) => {
                if let Some(store) = &store {
                    let _ = store.rollback_savepoint(SESSION_SAVEPOINT);
                }
                return Err(e);
            }
        };

        Ok(Session { store, entries })
    }

    /// The full, already-filtered listing. Callers index into this at
    /// whatever offset FUSE asks for, including a restart at 0.
    pub fn entries(&self) -> &[Entry] {
        &self.entries
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if let Some(store) = &self.store {
            if let Err(e) = store.rollback_savepoint(SESSION_SAVEPOINT) {
                warn!(error = %e, "session: failed to roll back savepoint on close");
            }
        }
    }
}
