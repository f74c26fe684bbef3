use std::path::{Path, PathBuf};
use regex::Regex;
use reqwest::Url;
use semver::Version;
use serde::{Deserialize, Serialize};
use walkdir::WalkDir;
use crate::error::FormulaError;
use crate::util::{format_hash, is_sha256_hex};

/// Versioning scheme applied to upstream tags when a formula does not declare one.
pub const DEFAULT_TAG_SCHEME: &str = r"^v?(\d+\.\d+\.\d+(?:-[0-9A-Za-z.-]+)?)$";

/// A formula: everything needed to fetch, verify, build, and smoke-test one
/// version of a package.
///
/// Records are plain data. Anything derived from them (toolchain arguments,
/// install paths) is computed by free functions elsewhere.
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
pub struct Formula {
    /// Logical package name, the key in the store.
    pub name: String,
    /// One-line description of the package.
    #[serde(alias = "desc")]
    pub description: String,
    pub homepage: String,
    /// Tag-pinned release archive to build from.
    #[serde(alias = "url")]
    pub source_url: String,
    /// SHA-256 of the archive at `source_url`.
    #[serde(alias = "sha256", deserialize_with = "deserialize_hash")]
    pub checksum: String,
    pub version: Version,
    /// SPDX identifier. Informational only.
    pub license: String,
    /// Commit embedded into the binary. Not checked against the archive.
    pub build_commit: String,
    /// Build timestamp embedded into the binary.
    pub build_date: String,
    #[serde(default)]
    pub livecheck: Livecheck,
    #[serde(default)]
    pub dependencies: Vec<Dependency>,
    pub test: VerificationCommand,
    #[serde(default)]
    pub build: BuildSettings,
}

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq, Default)]
pub struct Livecheck {
    #[serde(default)]
    pub strategy: LivecheckStrategy,
    /// Which of the formula's URLs names the upstream project.
    #[serde(default)]
    pub url: LivecheckUrl,
    /// Versioning scheme for upstream tags. Capture group 1, or the whole
    /// match, must be a SemVer version.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub regex: Option<String>,
}

#[derive(Deserialize, Serialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum LivecheckStrategy {
    /// Highest stable tag among the forge's published releases.
    #[default]
    LatestReleaseTag,
    /// Highest tag in the repository, released or not.
    GitTags,
    Skip,
}

#[derive(Deserialize, Serialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum LivecheckUrl {
    #[default]
    Stable,
    Homepage,
}

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq, Eq)]
pub struct Dependency {
    pub name: String,
    pub stage: DependencyStage,
}

#[derive(Deserialize, Serialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum DependencyStage {
    Build,
    Run,
}

/// Post-install smoke test: run the binary with `args` and look for `expected`.
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq, Eq)]
pub struct VerificationCommand {
    pub args: Vec<String>,
    pub expected: String,
}

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq, Eq)]
pub struct BuildSettings {
    /// Package holding the `version`, `commit`, and `date` variables.
    #[serde(default = "default_symbol_package")]
    pub symbol_package: String,
    /// Arguments appended after the generated ones.
    #[serde(default)]
    pub extra_flags: Vec<String>,
}

impl Default for BuildSettings {
    fn default() -> Self {
        Self {
            symbol_package: default_symbol_package(),
            extra_flags: Vec::new(),
        }
    }
}

fn default_symbol_package() -> String {
    "main".to_string()
}

fn deserialize_hash<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let raw = String::deserialize(deserializer)?;
    Ok(format_hash(&raw))
}

impl Formula {
    /// Checks every field invariant.
    ///
    /// # Errors
    /// Returns [`FormulaError::Invalid`] naming the first offending field.
    pub fn validate(&self) -> Result<(), FormulaError> {
        let invalid = |field: &'static str, reason: String| FormulaError::Invalid {
            name: self.name.clone(),
            field,
            reason,
        };

        if !is_valid_name(&self.name) {
            return Err(invalid("name", format!("`{}` is not a valid formula name", self.name)));
        }
        if self.description.trim().is_empty() {
            return Err(invalid("description", "must not be empty".into()));
        }
        parse_http_url(&self.homepage).map_err(|reason| invalid("homepage", reason))?;
        let source = parse_http_url(&self.source_url).map_err(|reason| invalid("source_url", reason))?;
        if !is_tag_pinned(&source, &self.version) {
            return Err(invalid(
                "source_url",
                format!("{} is not pinned to a release of {}", self.source_url, self.version),
            ));
        }
        if !is_sha256_hex(&self.checksum) {
            return Err(invalid("checksum", format!("`{}` is not a SHA-256 hex digest", self.checksum)));
        }
        if self.license.trim().is_empty() {
            return Err(invalid("license", "must not be empty".into()));
        }
        let commit_ok = (7..=40).contains(&self.build_commit.len())
            && self.build_commit.bytes().all(|b| b.is_ascii_hexdigit());
        if !commit_ok {
            return Err(invalid("build_commit", format!("`{}` is not a commit hash", self.build_commit)));
        }
        // The linker splits `-ldflags` on whitespace, so embedded values must not contain any.
        if self.build_date.contains(char::is_whitespace) {
            return Err(invalid("build_date", format!("`{}` contains whitespace", self.build_date)));
        }
        chrono::DateTime::parse_from_rfc3339(&self.build_date)
            .map_err(|e| invalid("build_date", format!("`{}`: {e}", self.build_date)))?;
        if let Some(pattern) = &self.livecheck.regex {
            Regex::new(pattern).map_err(|e| invalid("livecheck.regex", e.to_string()))?;
        }
        if let Some(dep) = self.dependencies.iter().find(|d| d.name.trim().is_empty()) {
            return Err(invalid("dependencies", format!("empty dependency name ({:?} stage)", dep.stage)));
        }
        if self.test.args.is_empty() {
            return Err(invalid("test.args", "at least one argument is required".into()));
        }
        if self.test.expected.is_empty() {
            return Err(invalid("test.expected", "must not be empty".into()));
        }
        let package = &self.build.symbol_package;
        if package.is_empty() || package.contains(char::is_whitespace) {
            return Err(invalid("build.symbol_package", format!("`{package}` is not a package path")));
        }
        Ok(())
    }

    /// The tag scheme used by livecheck.
    pub fn tag_scheme(&self) -> &str {
        self.livecheck.regex.as_deref().unwrap_or(DEFAULT_TAG_SCHEME)
    }

    /// The URL livecheck derives the upstream project from.
    pub fn livecheck_url(&self) -> &str {
        match self.livecheck.url {
            LivecheckUrl::Stable => &self.source_url,
            LivecheckUrl::Homepage => &self.homepage,
        }
    }

    /// Dependencies needed at the given stage.
    pub fn dependencies_for(&self, stage: DependencyStage) -> impl Iterator<Item = &Dependency> {
        self.dependencies.iter().filter(move |d| d.stage == stage)
    }
}

fn is_valid_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphanumeric() => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '+' | '@'))
}

fn parse_http_url(raw: &str) -> Result<Url, String> {
    let url = Url::parse(raw).map_err(|e| format!("`{raw}`: {e}"))?;
    if !matches!(url.scheme(), "http" | "https") || url.host_str().is_none() {
        return Err(format!("`{raw}` is not an http(s) URL"));
    }
    Ok(url)
}

/// Whether `url` names one immutable release rather than a moving branch.
fn is_tag_pinned(url: &Url, version: &Version) -> bool {
    let path = url.path();
    if path.contains("/refs/heads/")
        || path.ends_with("/archive/master.tar.gz")
        || path.ends_with("/archive/main.tar.gz")
        || path.ends_with("/archive/master.zip")
        || path.ends_with("/archive/main.zip")
    {
        return false;
    }
    if path.contains("/refs/tags/") || path.contains("/releases/download/") {
        return true;
    }
    let last = path.rsplit('/').next().unwrap_or_default();
    last.contains(&version.to_string())
}

/// A formula file: every recorded version of one package lineage.
#[derive(Deserialize, Serialize, Debug, Default)]
pub struct FormulaFile {
    #[serde(rename = "formula", default)]
    pub formulas: Vec<Formula>,
}

impl FormulaFile {
    /// Loads a `FormulaFile` from a file path.
    ///
    /// Records are only parsed here, not validated; the store validates on
    /// registration.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<FormulaFile, FormulaError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| FormulaError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&content).map_err(|source| FormulaError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Saves the `FormulaFile` to the given path in pretty TOML format.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), FormulaError> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path.as_ref(), content).map_err(|source| FormulaError::Io {
            path: path.as_ref().to_path_buf(),
            source,
        })
    }
}

/// Lists every `.toml` file below `dir`, sorted for a stable load order.
pub fn formula_files<P: AsRef<Path>>(dir: P) -> Result<Vec<PathBuf>, FormulaError> {
    let dir = dir.as_ref();
    let mut files = Vec::new();
    for entry in WalkDir::new(dir) {
        let entry = entry.map_err(|e| FormulaError::Io {
            path: dir.to_path_buf(),
            source: e.into(),
        })?;
        let path = entry.path();
        if entry.file_type().is_file() && path.extension().is_some_and(|ext| ext == "toml") {
            files.push(path.to_path_buf());
        }
    }
    files.sort();
    Ok(files)
}
