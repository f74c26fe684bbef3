use std::path::PathBuf;
use anyhow::{anyhow, Result};
use directories::ProjectDirs;

fn project_dirs() -> Result<ProjectDirs> {
    ProjectDirs::from("org", "formulary", "formulary")
        .ok_or_else(|| anyhow!("Could not determine the home directory of the current user"))
}

/// `<config dir>/config.toml`.
pub fn user_config_file() -> Result<PathBuf> {
    Ok(project_dirs()?.config_dir().join("config.toml"))
}

/// Where downloaded source archives are kept between builds.
pub fn source_cache_dir() -> Result<PathBuf> {
    Ok(project_dirs()?.cache_dir().join("sources"))
}

/// Install prefix used when the config does not name one.
pub fn default_prefix() -> Result<PathBuf> {
    Ok(project_dirs()?.data_dir().join("Cellar"))
}
