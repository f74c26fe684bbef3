use std::path::PathBuf;
use std::time::Duration;
use semver::Version;
use thiserror::Error;

/// Errors raised while reading or validating a formula record.
#[derive(Error, Debug)]
pub enum FormulaError {
    /// A field violates its invariant.
    #[error("invalid formula `{name}`: {field}: {reason}")]
    Invalid {
        name: String,
        field: &'static str,
        reason: String,
    },

    /// The formula file is not valid TOML for a formula lineage.
    #[error("could not parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("could not serialize formula file: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Errors raised by the formula store.
///
/// A rejected registration never changes what the store already holds.
#[derive(Error, Debug)]
pub enum StoreError {
    /// Two records for the same name and version disagree on the checksum.
    #[error(
        "integrity conflict for {name} {version}: registered checksum {existing_checksum}, incoming checksum {incoming_checksum}"
    )]
    IntegrityConflict {
        name: String,
        version: Version,
        existing_checksum: String,
        incoming_checksum: String,
    },

    /// Two records for the same source URL and version disagree on the checksum.
    #[error(
        "integrity conflict for {source_url} at {version}: `{existing_name}` declares {existing_checksum}, `{incoming_name}` declares {incoming_checksum}"
    )]
    SourceConflict {
        source_url: String,
        version: Version,
        existing_name: String,
        existing_checksum: String,
        incoming_name: String,
        incoming_checksum: String,
    },

    /// The incoming name only differs from a registered one by case.
    #[error("name collision: `{incoming}` clashes with registered formula `{existing}`")]
    NameCollision { existing: String, incoming: String },

    #[error("formula not found: {0}")]
    NotFound(String),

    #[error("formula {name} has no version {version}")]
    VersionNotFound { name: String, version: Version },

    #[error(transparent)]
    Invalid(#[from] FormulaError),
}

/// Errors raised while checking a formula against its upstream host.
///
/// None of these are fatal to a batch run.
#[derive(Error, Debug)]
pub enum LivecheckError {
    #[error("upstream unavailable for {name}: {reason}")]
    UpstreamUnavailable { name: String, reason: String },

    #[error("no upstream tag of {name} matches its versioning scheme")]
    NoMatchingTag { name: String },

    #[error("livecheck of {name} does not support {url}")]
    UnsupportedSource { name: String, url: String },

    #[error("livecheck is skipped for {name}")]
    Skipped { name: String },
}

impl LivecheckError {
    /// Whether a caller may retry the check later.
    pub fn is_transient(&self) -> bool {
        matches!(self, LivecheckError::UpstreamUnavailable { .. })
    }
}

/// The checkpoint of a build at which an error occurred.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildStep {
    Fetch,
    Checksum,
    Extract,
    Compile,
    Install,
}

impl std::fmt::Display for BuildStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let step = match self {
            BuildStep::Fetch => "fetch",
            BuildStep::Checksum => "checksum",
            BuildStep::Extract => "extract",
            BuildStep::Compile => "compile",
            BuildStep::Install => "install",
        };
        f.write_str(step)
    }
}

#[derive(Error, Debug)]
pub enum BuildError {
    #[error("build of {name} cancelled before {step}")]
    Cancelled { name: String, step: BuildStep },

    #[error("failed to fetch {url} for {name}: {reason}")]
    Fetch {
        name: String,
        url: String,
        reason: String,
    },

    #[error("checksum mismatch for {name}: expected {expected}, got {actual}")]
    Integrity {
        name: String,
        expected: String,
        actual: String,
    },

    #[error("failed to extract source of {name}: {reason}")]
    Extract { name: String, reason: String },

    #[error("toolchain failed for {name}: {stderr}")]
    Toolchain { name: String, stderr: String },

    #[error("toolchain for {name} exceeded {timeout:?}")]
    ToolchainTimeout { name: String, timeout: Duration },

    #[error("toolchain reported success for {name} but produced no artifact at {path}")]
    MissingArtifact { name: String, path: PathBuf },

    #[error("failed to install {name} into {path}: {source}")]
    Install {
        name: String,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl BuildError {
    /// The checkpoint that failed.
    pub fn step(&self) -> BuildStep {
        match self {
            BuildError::Cancelled { step, .. } => *step,
            BuildError::Fetch { .. } => BuildStep::Fetch,
            BuildError::Integrity { .. } => BuildStep::Checksum,
            BuildError::Extract { .. } => BuildStep::Extract,
            BuildError::Toolchain { .. }
            | BuildError::ToolchainTimeout { .. }
            | BuildError::MissingArtifact { .. } => BuildStep::Compile,
            BuildError::Install { .. } => BuildStep::Install,
        }
    }
}

#[derive(Error, Debug)]
pub enum VerificationError {
    #[error("expected `{expected}` in output, got: {got}")]
    Mismatch { expected: String, got: String },

    #[error("{artifact} did not finish within {timeout:?}")]
    Timeout { artifact: PathBuf, timeout: Duration },

    #[error("could not run {artifact}: {reason}")]
    Launch { artifact: PathBuf, reason: String },

    #[error("verification of {artifact} cancelled")]
    Cancelled { artifact: PathBuf },
}

/// Errors from the combined build and verify pipeline of one record.
#[derive(Error, Debug)]
pub enum InstallError {
    #[error("{} step failed: {}", .0.step(), .0)]
    Build(#[from] BuildError),

    #[error("verification of {name} failed (artifact removed: {removed}): {source}")]
    Verification {
        name: String,
        removed: bool,
        #[source]
        source: VerificationError,
    },

    #[error("could not write install receipt {path}: {reason}")]
    Receipt { path: PathBuf, reason: String },
}

/// Errors from running an external process under a deadline.
#[derive(Error, Debug)]
pub enum ProcessError {
    #[error("could not start {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{program} exceeded {timeout:?}")]
    TimedOut { program: String, timeout: Duration },

    #[error("{program} was cancelled")]
    Cancelled { program: String },

    #[error("I/O error while waiting on {program}: {source}")]
    Io {
        program: String,
        #[source]
        source: std::io::Error,
    },
}
