// Copyright 2024 contributors to BeholdFS.

//! BeholdFS: a user-space tag overlay filesystem.
//!
//! The core (C1-C7) has no FUSE dependency and can be exercised purely
//! through the metadata store and mutation API; [`posix`] is the thin,
//! optional translator that exposes it as a real mount point.

pub mod cli;
pub mod config;
pub mod error;
pub mod filter;
pub mod iter;
pub mod logging;
pub mod mark;
pub mod mutate;
pub mod path;
pub mod session;
pub mod store;

#[cfg(unix)]
pub mod posix;

pub use error::{Error, Result};
