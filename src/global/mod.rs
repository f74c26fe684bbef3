//! Per-user state: directories, configuration, and the source archive cache.

pub mod cache;
pub mod config;
pub mod utils;
