// Copyright 2024 contributors to BeholdFS.

//! Process-wide, immutable mount configuration (spec §5, §6).
//!
//! Built once in the mount entry point and threaded explicitly into
//! every parser/evaluator/mutation call, replacing the original's
//! `beholddb_tagchar` global (spec §9).

/// The reserved name for a per-directory metadata file.
pub const METADATA_FILE_NAME: &str = ".beholdfs";

/// Default tag sigil, matching the original CLI's default `-o char=%`.
pub const DEFAULT_TAG_SIGIL: u8 = b'%';

/// Mount-time options, parsed once from `-o key[=value]` pairs.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Config {
    /// The byte that introduces a tag segment in a virtual path.
    pub tag_sigil: u8,
    /// Whether normal directory listings prepend a synthetic entry
    /// named after the tag sigil (`-o list` / `-o nolist`).
    pub list_sigil_entry: bool,
    /// Whether the filter evaluator uses the scratch-table fast path
    /// (`-o new_locate`) instead of row-at-a-time lookups.
    pub fast_locate: bool,
    /// Syslog-style level upper bound (`-o debug=N`, spec §6), mapped
    /// to the `tracing` level the mount entry point installs.
    pub log_level: tracing::Level,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            tag_sigil: DEFAULT_TAG_SIGIL,
            list_sigil_entry: true,
            fast_locate: false,
            log_level: tracing::Level::ERROR,
        }
    }
}

/// Map the `debug=N` syslog level upper bound (0-7) to a `tracing`
/// level (spec SPEC_FULL.md "Logging"): 0-3 -> ERROR, 4 -> WARN,
/// 5 -> INFO, 6 -> DEBUG, 7 -> TRACE.
pub fn level_for_debug(n: u8) -> tracing::Level {
    match n {
        0..=3 => tracing::Level::ERROR,
        4 => tracing::Level::WARN,
        5 => tracing::Level::INFO,
        6 => tracing::Level::DEBUG,
        _ => tracing::Level::TRACE,
    }
}

impl Config {
    /// True if `name` cannot appear as an ordinary path component:
    /// the metadata file name, or a name beginning with the tag sigil.
    pub fn is_reserved_name(&self, name: &str) -> bool {
        name == METADATA_FILE_NAME || name.as_bytes().first() == Some(&self.tag_sigil)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_sigil_is_percent() {
        assert_eq!(Config::default().tag_sigil, b'%');
    }

    #[test]
    fn reserved_names() {
        let cfg = Config::default();
        assert!(cfg.is_reserved_name(".beholdfs"));
        assert!(cfg.is_reserved_name("%red"));
        assert!(!cfg.is_reserved_name("notes.txt"));
    }
}
