// Copyright 2024 contributors to BeholdFS.

//! Command-line parsing for the mount entry point (spec §6).
//!
//! Grounded on conserve's `clap`-derived option structs (its
//! `Cargo.toml` already carries `clap` with the `derive` feature for
//! this purpose); the retrieved `main.rs`/`cmd.rs` are a stale
//! `docopt`-era revision and are not generalized here.

use std::path::PathBuf;

use clap::Parser;

use crate::config::{level_for_debug, Config};

/// `beholdfs [-o options] <fsroot> <mountpoint>` (spec §6).
#[derive(Debug, Parser)]
#[command(name = "beholdfs", version, about = "A user-space tag overlay filesystem.")]
pub struct Cli {
    /// Existing directory to project through the tag overlay.
    pub fsroot: PathBuf,

    /// Directory to mount the overlay at.
    pub mountpoint: PathBuf,

    /// Mount options, comma-separated within one `-o` or repeated:
    /// `debug=N`, `char=C`, `list`/`nolist`, `new_locate`.
    #[arg(short = 'o', value_delimiter = ',')]
    pub options: Vec<String>,
}

/// A `-o` option string was not one of the recognized mount options.
#[derive(Debug, thiserror::Error)]
#[error("unrecognized mount option: {0:?}")]
pub struct OptionError(pub String);

/// Fold the `-o` option strings into a [`Config`], starting from
/// `Config::default()` (spec §6's option table).
pub fn build_config(options: &[String]) -> Result<Config, OptionError> {
    let mut config = Config::default();
    for opt in options {
        let opt = opt.trim();
        if opt.is_empty() {
            continue;
        }
        match opt.split_once('=') {
            Some(("debug", n)) => {
                let n: u8 = n.parse().map_err(|_| OptionError(opt.to_string()))?;
                config.log_level = level_for_debug(n);
            }
            Some(("char", c)) => {
                if c.len() != 1 || !c.is_ascii() {
                    return Err(OptionError(opt.to_string()));
                }
                config.tag_sigil = c.as_bytes()[0];
            }
            Some(_) => return Err(OptionError(opt.to_string())),
            None => match opt {
                "list" => config.list_sigil_entry = true,
                "nolist" => config.list_sigil_entry = false,
                "new_locate" => config.fast_locate = true,
                _ => return Err(OptionError(opt.to_string())),
            },
        }
    }
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_with_no_options() {
        let config = build_config(&[]).unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn parses_each_recognized_option() {
        let options: Vec<String> = ["debug=6", "char=@", "nolist", "new_locate"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        let config = build_config(&options).unwrap();
        assert_eq!(config.log_level, tracing::Level::DEBUG);
        assert_eq!(config.tag_sigil, b'@');
        assert!(!config.list_sigil_entry);
        assert!(config.fast_locate);
    }

    #[test]
    fn rejects_unrecognized_option() {
        assert!(build_config(&["bogus".to_string()]).is_err());
    }

    #[test]
    fn rejects_malformed_debug_value() {
        assert!(build_config(&["debug=not-a-number".to_string()]).is_err());
    }
}
