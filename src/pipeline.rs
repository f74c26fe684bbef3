use std::path::{Path, PathBuf};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};
use crate::build::BuildOrchestrator;
use crate::error::InstallError;
use crate::formula::{DependencyStage, Formula};
use crate::util::Cancellation;
use crate::verify::InstallVerifier;

pub const RECEIPT_FILE: &str = "INSTALL_RECEIPT.json";

/// Record of one install, written next to the installed binary.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct InstallReceipt {
    pub name: String,
    pub version: String,
    pub checksum: String,
    pub source_url: String,
    pub build_commit: String,
    pub build_date: String,
    pub artifact: PathBuf,
    pub aliases: Vec<String>,
    pub verified: bool,
    pub installed_at: String,
}

impl InstallReceipt {
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<InstallReceipt> {
        let content = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }
}

/// `<prefix>/<name>/<version>`.
pub fn keg_dir(prefix: &Path, formula: &Formula) -> PathBuf {
    prefix.join(&formula.name).join(formula.version.to_string())
}

/// Build-stage dependencies of `formula` that are not on `PATH`.
pub fn missing_build_dependencies(formula: &Formula) -> Vec<String> {
    formula
        .dependencies_for(DependencyStage::Build)
        .filter(|dep| which::which(&dep.name).is_err())
        .map(|dep| dep.name.clone())
        .collect()
}

/// Build followed by verification, one record at a time or many in parallel.
pub struct InstallPipeline {
    orchestrator: BuildOrchestrator,
    verifier: InstallVerifier,
    keep_unverified: bool,
}

impl InstallPipeline {
    pub fn new(orchestrator: BuildOrchestrator, verifier: InstallVerifier) -> Self {
        Self { orchestrator, verifier, keep_unverified: false }
    }

    /// Keep binaries that fail verification, with `verified = false` in the
    /// receipt, instead of removing them.
    pub fn keep_unverified(mut self, keep: bool) -> Self {
        self.keep_unverified = keep;
        self
    }

    /// Builds, installs, and verifies `formula` under `prefix`.
    ///
    /// `aliases` is recorded in the receipt only.
    pub fn install(
        &self,
        formula: &Formula,
        aliases: &[String],
        prefix: &Path,
        cancel: &Cancellation,
    ) -> Result<InstallReceipt, InstallError> {
        let keg = keg_dir(prefix, formula);
        let artifact = self.orchestrator.build(formula, &keg.join("bin"), cancel)?;

        let verified = match self.verifier.verify_command(&artifact, &formula.test, cancel) {
            Ok(_) => true,
            Err(e) if self.keep_unverified => {
                warn!(name = %formula.name, error = %e, "keeping unverified binary");
                false
            }
            Err(source) => {
                let removed = std::fs::remove_file(&artifact).is_ok();
                // A receipt from an earlier install no longer describes this keg.
                let stale = keg.join(RECEIPT_FILE);
                if stale.exists() {
                    if let Err(e) = std::fs::remove_file(&stale) {
                        warn!(path = %stale.display(), error = %e, "could not remove stale receipt");
                    }
                }
                error!(name = %formula.name, error = %source, removed, "verification failed");
                return Err(InstallError::Verification {
                    name: formula.name.clone(),
                    removed,
                    source,
                });
            }
        };

        let receipt = InstallReceipt {
            name: formula.name.clone(),
            version: formula.version.to_string(),
            checksum: formula.checksum.clone(),
            source_url: formula.source_url.clone(),
            build_commit: formula.build_commit.clone(),
            build_date: formula.build_date.clone(),
            artifact,
            aliases: aliases.to_vec(),
            verified,
            installed_at: chrono::Utc::now().to_rfc3339(),
        };
        let path = keg.join(RECEIPT_FILE);
        let json = serde_json::to_string_pretty(&receipt).map_err(|e| InstallError::Receipt {
            path: path.clone(),
            reason: e.to_string(),
        })?;
        std::fs::write(&path, json).map_err(|e| InstallError::Receipt {
            path: path.clone(),
            reason: e.to_string(),
        })?;
        info!(name = %formula.name, version = %formula.version, verified, "install complete");
        Ok(receipt)
    }

    /// Installs every `(formula, aliases)` pair in parallel on a pool of
    /// `jobs` threads (0 for the pool's default).
    ///
    /// Results come back in input order; a failing record does not affect
    /// the others.
    pub fn install_all(
        &self,
        formulas: &[(Formula, Vec<String>)],
        prefix: &Path,
        jobs: usize,
        cancel: &Cancellation,
    ) -> anyhow::Result<Vec<Result<InstallReceipt, InstallError>>> {
        let pool = rayon::ThreadPoolBuilder::new().num_threads(jobs).build()?;
        Ok(pool.install(|| {
            formulas
                .par_iter()
                .map(|(formula, aliases)| self.install(formula, aliases, prefix, cancel))
                .collect()
        }))
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;
    use tempfile::tempdir;
    use crate::build::tests::{FakeFetcher, FakeToolchain, FlatUnpacker};
    use crate::error::{BuildError, VerificationError};
    use crate::formula::tests::sample;
    use crate::util::sha256_hex;

    const SOURCE: &[u8] = b"package main\n";

    fn pipeline(artifact: &str) -> InstallPipeline {
        let orchestrator = BuildOrchestrator::new(
            Arc::new(FakeFetcher::new(SOURCE)),
            Arc::new(FlatUnpacker),
            Arc::new(FakeToolchain::producing(format!("#!/bin/sh\n{artifact}\n").as_bytes())),
            Duration::from_secs(5),
        );
        InstallPipeline::new(orchestrator, InstallVerifier::new(Duration::from_secs(10)))
    }

    #[test]
    fn test_install_writes_verified_receipt() {
        let prefix = tempdir().unwrap();
        let formula = sample("zipcmt", "1.4.6", &sha256_hex(SOURCE));
        let receipt = pipeline(r#"echo "zipcmt version 1.4.6""#)
            .install(&formula, &["namzd".to_string()], prefix.path(), &Cancellation::new())
            .unwrap();
        assert!(receipt.verified);
        assert_eq!(receipt.artifact, prefix.path().join("zipcmt/1.4.6/bin/zipcmt"));
        let stored = InstallReceipt::load(prefix.path().join("zipcmt/1.4.6").join(RECEIPT_FILE)).unwrap();
        assert_eq!(stored, receipt);
        assert_eq!(stored.aliases, vec!["namzd".to_string()]);
    }

    #[test]
    fn test_failed_verification_removes_binary() {
        let prefix = tempdir().unwrap();
        let mut formula = sample("zipcmt", "1.4.6", &sha256_hex(SOURCE));
        formula.test.expected = "namzd".into();
        let err = pipeline(r#"echo "zipcmt version 1.4.6""#)
            .install(&formula, &[], prefix.path(), &Cancellation::new())
            .unwrap_err();
        match err {
            InstallError::Verification { removed, source, .. } => {
                assert!(removed);
                assert!(matches!(source, VerificationError::Mismatch { .. }));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(!prefix.path().join("zipcmt/1.4.6/bin/zipcmt").exists());
        assert!(!prefix.path().join("zipcmt/1.4.6").join(RECEIPT_FILE).exists());
    }

    #[test]
    fn test_failed_reinstall_drops_previous_receipt() {
        let prefix = tempdir().unwrap();
        let mut formula = sample("zipcmt", "1.4.6", &sha256_hex(SOURCE));
        let installer = pipeline(r#"echo "zipcmt version 1.4.6""#);
        installer
            .install(&formula, &[], prefix.path(), &Cancellation::new())
            .unwrap();
        let receipt = prefix.path().join("zipcmt/1.4.6").join(RECEIPT_FILE);
        assert!(receipt.exists());

        formula.test.expected = "namzd".into();
        let err = installer
            .install(&formula, &[], prefix.path(), &Cancellation::new())
            .unwrap_err();
        assert!(matches!(err, InstallError::Verification { removed: true, .. }));
        assert!(!prefix.path().join("zipcmt/1.4.6/bin/zipcmt").exists());
        assert!(!receipt.exists());
    }

    #[test]
    fn test_keep_unverified_marks_receipt() {
        let prefix = tempdir().unwrap();
        let mut formula = sample("zipcmt", "1.4.6", &sha256_hex(SOURCE));
        formula.test.expected = "namzd".into();
        let receipt = pipeline(r#"echo "zipcmt version 1.4.6""#)
            .keep_unverified(true)
            .install(&formula, &[], prefix.path(), &Cancellation::new())
            .unwrap();
        assert!(!receipt.verified);
        assert!(receipt.artifact.exists());
    }

    #[test]
    fn test_install_all_isolates_failures() {
        let prefix = tempdir().unwrap();
        let good = sample("zipcmt", "1.4.6", &sha256_hex(SOURCE));
        let bad = sample("namzd", "1.4.6", &sha256_hex(b"something else"));
        let results = pipeline(r#"echo "zipcmt namzd 1.4.6""#)
            .install_all(
                &[(good, vec![]), (bad, vec![])],
                prefix.path(),
                2,
                &Cancellation::new(),
            )
            .unwrap();
        assert!(results[0].is_ok());
        assert!(matches!(
            results[1],
            Err(InstallError::Build(BuildError::Integrity { .. }))
        ));
        assert!(!prefix.path().join("namzd").exists());
    }

    #[test]
    fn test_missing_build_dependencies() {
        let mut formula = sample("zipcmt", "1.4.6", &sha256_hex(SOURCE));
        formula.dependencies = vec![
            crate::formula::Dependency { name: "sh".into(), stage: DependencyStage::Build },
            crate::formula::Dependency { name: "formulary-no-such-tool".into(), stage: DependencyStage::Build },
            crate::formula::Dependency { name: "formulary-runtime-only".into(), stage: DependencyStage::Run },
        ];
        assert_eq!(missing_build_dependencies(&formula), vec!["formulary-no-such-tool".to_string()]);
    }
}
