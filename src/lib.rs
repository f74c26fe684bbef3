//! # Formulary Core Library
//!
//! This crate contains the core logic of the `formulary` tool: a formula store,
//! upstream release checks, and a build pipeline for command-line tools that are
//! built from tagged source archives.
//!
//! A formula is a plain record that says where to fetch a release archive, which
//! SHA-256 it must have, which version, commit, and date to bake into the binary,
//! and how to smoke-test the result. The same upstream project may be published
//! under several names (for example `zipcmt` and `namzd`); the store keeps those
//! as separate records and reports them as aliases.
//!
//! This library is built for the `formulary` CLI, but you can also reuse it as a backend in other tools.
//!
//! ## Modules Overview
//! - [`formula`] – Formula records, validation, and formula files
//! - [`store`] – Keyed formula store with integrity-conflict and alias detection
//! - [`livecheck`] – Comparing declared versions with upstream release tags
//! - [`build`] – Fetch, checksum, extract, compile, and atomic install
//! - [`verify`] – Post-install smoke tests
//! - [`pipeline`] – Build plus verification for one or many formulas
//! - [`error`] – Error types for every stage
//! - [`util`] – Hashing, archives, and bounded process execution
//! - [`global`] – Per-user directories, configuration, and the download cache

pub mod error;
pub mod formula;
pub mod store;
pub mod livecheck;
pub mod build;
pub mod verify;
pub mod pipeline;
pub mod util;
pub mod global;

pub use error::*;
pub use formula::*;
pub use store::*;
pub use livecheck::*;
pub use build::*;
pub use verify::*;
pub use pipeline::*;
pub use util::*;
pub use global::cache::*;
pub use global::config::*;
