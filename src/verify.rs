use std::path::Path;
use std::process::Command;
use std::time::Duration;
use tracing::{debug, warn};
use crate::error::{ProcessError, VerificationError};
use crate::formula::VerificationCommand;
use crate::util::{run_with_deadline, Cancellation};

/// Diagnostic flag used when no explicit arguments are given.
pub const VERSION_FLAG: &str = "--version";

/// Smoke-tests freshly installed binaries.
#[derive(Debug, Clone)]
pub struct InstallVerifier {
    timeout: Duration,
}

impl InstallVerifier {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    /// Runs `artifact --version` and checks that `expected` appears in its
    /// output.
    pub fn verify(&self, artifact: &Path, expected: &str) -> Result<String, VerificationError> {
        self.run(artifact, &[VERSION_FLAG.to_string()], expected, &Cancellation::new())
    }

    /// Runs a formula's test command against `artifact`.
    pub fn verify_command(
        &self,
        artifact: &Path,
        test: &VerificationCommand,
        cancel: &Cancellation,
    ) -> Result<String, VerificationError> {
        self.run(artifact, &test.args, &test.expected, cancel)
    }

    /// Runs `artifact` with `args` and returns the combined output when it
    /// contains `expected`.
    ///
    /// The exit code does not decide the outcome; a non-zero exit with
    /// matching output is only logged.
    pub fn run(
        &self,
        artifact: &Path,
        args: &[String],
        expected: &str,
        cancel: &Cancellation,
    ) -> Result<String, VerificationError> {
        let mut command = Command::new(artifact);
        command.args(args);
        let output = run_with_deadline(command, self.timeout, cancel).map_err(|e| match e {
            ProcessError::TimedOut { timeout, .. } => VerificationError::Timeout {
                artifact: artifact.to_path_buf(),
                timeout,
            },
            ProcessError::Cancelled { .. } => VerificationError::Cancelled {
                artifact: artifact.to_path_buf(),
            },
            other => VerificationError::Launch {
                artifact: artifact.to_path_buf(),
                reason: other.to_string(),
            },
        })?;

        let combined = output.combined();
        debug!(artifact = %artifact.display(), code = ?output.code, "verification output: {}", combined.trim());
        if !combined.contains(expected) {
            return Err(VerificationError::Mismatch {
                expected: expected.to_string(),
                got: combined,
            });
        }
        if !output.success() {
            warn!(artifact = %artifact.display(), code = ?output.code, "verification output matched but the exit status was not zero");
        }
        Ok(combined)
    }
}
