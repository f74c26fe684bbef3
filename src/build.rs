use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Arc;
use std::time::Duration;
use anyhow::{bail, Context, Result};
use reqwest::blocking::Client;
use tracing::{debug, info, warn};
use crate::error::{BuildError, BuildStep, ProcessError};
use crate::formula::Formula;
use crate::global::cache::SourceCache;
use crate::util::{extract_archive, make_executable, run_with_deadline, sha256_hex, Cancellation, ProcessOutput};

/// Downloads release archives.
pub trait SourceFetcher: Send + Sync {
    fn fetch(&self, url: &str, cancel: &Cancellation) -> Result<Vec<u8>>;

    /// Forgets any locally kept copy of `url`, called after a checksum mismatch.
    fn evict(&self, _url: &str) {}
}

/// Turns a verified archive into a source tree.
pub trait SourceUnpacker: Send + Sync {
    /// Unpacks into `dest` and returns the source root.
    fn unpack(&self, bytes: &[u8], dest: &Path) -> Result<PathBuf>;
}

/// The compiler that turns a source tree into one binary.
pub trait Toolchain: Send + Sync {
    fn name(&self) -> &str;

    /// Runs the toolchain in `source_dir` with `args`.
    fn invoke(
        &self,
        source_dir: &Path,
        args: &[String],
        timeout: Duration,
        cancel: &Cancellation,
    ) -> std::result::Result<ProcessOutput, ProcessError>;
}

/// Toolchain arguments for `formula`, writing the binary to `output`.
///
/// Version, commit, and date become link-time string constants in the
/// formula's symbol package; `-s -w` drops the symbol table and DWARF data.
pub fn build_flags(formula: &Formula, output: &Path) -> Vec<String> {
    let mut args = vec![
        "build".to_string(),
        "-trimpath".to_string(),
        format!("-o={}", output.display()),
        format!("-ldflags={}", ldflags(formula)),
    ];
    args.extend(formula.build.extra_flags.iter().cloned());
    args
}

/// The linker flag string embedded in [`build_flags`].
pub fn ldflags(formula: &Formula) -> String {
    let pkg = &formula.build.symbol_package;
    format!(
        "-s -w -X {pkg}.version={} -X {pkg}.commit={} -X {pkg}.date={}",
        formula.version, formula.build_commit, formula.build_date
    )
}

/// Fetches archives over HTTP(S), optionally through the local source cache.
pub struct HttpFetcher {
    client: Client,
    cache: Option<SourceCache>,
}

impl HttpFetcher {
    pub fn new(timeout: Duration, cache: Option<SourceCache>) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .user_agent(concat!("formulary/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self { client, cache })
    }
}

impl SourceFetcher for HttpFetcher {
    fn fetch(&self, url: &str, cancel: &Cancellation) -> Result<Vec<u8>> {
        if let Some(cache) = &self.cache {
            if let Some(bytes) = cache.get(url)? {
                debug!(url, "using cached source archive");
                return Ok(bytes);
            }
        }
        info!(url, "downloading source archive");
        let response = self
            .client
            .get(url)
            .send()
            .with_context(|| format!("requesting {url}"))?
            .error_for_status()?;
        let bytes = read_cancellable(response, cancel).with_context(|| format!("downloading {url}"))?;
        if let Some(cache) = &self.cache {
            if let Err(e) = cache.put(url, &bytes) {
                warn!(url, error = %e, "could not cache source archive");
            }
        }
        Ok(bytes)
    }

    fn evict(&self, url: &str) {
        if let Some(cache) = &self.cache {
            if let Err(e) = cache.remove(url) {
                warn!(url, error = %e, "could not evict cached source archive");
            }
        }
    }
}

const DOWNLOAD_CHUNK: usize = 64 * 1024;

/// Reads `reader` to the end, checking `cancel` between chunks.
fn read_cancellable<R: Read>(mut reader: R, cancel: &Cancellation) -> Result<Vec<u8>> {
    let mut bytes = Vec::new();
    let mut chunk = vec![0; DOWNLOAD_CHUNK];
    loop {
        if cancel.is_cancelled() {
            bail!("download cancelled");
        }
        match reader.read(&mut chunk) {
            Ok(0) => return Ok(bytes),
            Ok(n) => bytes.extend_from_slice(&chunk[..n]),
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e.into()),
        }
    }
}

/// [`SourceUnpacker`] for gzip tarballs and zip archives.
#[derive(Debug, Default, Clone, Copy)]
pub struct ArchiveUnpacker;

impl SourceUnpacker for ArchiveUnpacker {
    fn unpack(&self, bytes: &[u8], dest: &Path) -> Result<PathBuf> {
        extract_archive(bytes, dest)
    }
}

/// The Go toolchain, located on `PATH`.
pub struct GoToolchain {
    program: PathBuf,
}

impl GoToolchain {
    pub fn locate() -> Result<Self> {
        let program = which::which("go").context("the `go` toolchain is not on PATH")?;
        Ok(Self { program })
    }
}

impl Toolchain for GoToolchain {
    fn name(&self) -> &str {
        "go"
    }

    fn invoke(
        &self,
        source_dir: &Path,
        args: &[String],
        timeout: Duration,
        cancel: &Cancellation,
    ) -> std::result::Result<ProcessOutput, ProcessError> {
        let mut command = Command::new(&self.program);
        command.args(args).current_dir(source_dir);
        run_with_deadline(command, timeout, cancel)
    }
}

/// Fetches, verifies, extracts, compiles, and installs one formula at a time.
#[derive(Clone)]
pub struct BuildOrchestrator {
    fetcher: Arc<dyn SourceFetcher>,
    unpacker: Arc<dyn SourceUnpacker>,
    toolchain: Arc<dyn Toolchain>,
    toolchain_timeout: Duration,
}

impl BuildOrchestrator {
    pub fn new(
        fetcher: Arc<dyn SourceFetcher>,
        unpacker: Arc<dyn SourceUnpacker>,
        toolchain: Arc<dyn Toolchain>,
        toolchain_timeout: Duration,
    ) -> Self {
        Self { fetcher, unpacker, toolchain, toolchain_timeout }
    }

    /// Builds `formula` and installs its binary as `destination/<name>`.
    ///
    /// The checksum is verified before anything is extracted or compiled.
    /// Work happens in a private temporary directory that is removed on
    /// every exit path, and the binary appears in `destination` through a
    /// rename, so a failed or cancelled build leaves nothing behind there.
    pub fn build(
        &self,
        formula: &Formula,
        destination: &Path,
        cancel: &Cancellation,
    ) -> std::result::Result<PathBuf, BuildError> {
        let name = formula.name.clone();
        let checkpoint = |step: BuildStep| {
            if cancel.is_cancelled() {
                Err(BuildError::Cancelled { name: name.clone(), step })
            } else {
                Ok(())
            }
        };

        checkpoint(BuildStep::Fetch)?;
        let bytes = self
            .fetcher
            .fetch(&formula.source_url, cancel)
            .map_err(|e| {
                if cancel.is_cancelled() {
                    BuildError::Cancelled { name: name.clone(), step: BuildStep::Fetch }
                } else {
                    BuildError::Fetch {
                        name: name.clone(),
                        url: formula.source_url.clone(),
                        reason: format!("{e:#}"),
                    }
                }
            })?;

        checkpoint(BuildStep::Checksum)?;
        let actual = sha256_hex(&bytes);
        if actual != formula.checksum {
            self.fetcher.evict(&formula.source_url);
            return Err(BuildError::Integrity {
                name,
                expected: formula.checksum.clone(),
                actual,
            });
        }
        debug!(name = %name, checksum = %actual, "checksum verified");

        checkpoint(BuildStep::Extract)?;
        let extract_error = |e: &dyn std::fmt::Display| BuildError::Extract {
            name: name.clone(),
            reason: e.to_string(),
        };
        let work = tempfile::Builder::new()
            .prefix(&format!("formulary-{}-{}-", formula.name, formula.version))
            .tempdir()
            .map_err(|e| extract_error(&e))?;
        std::fs::create_dir_all(work.path().join("out")).map_err(|e| extract_error(&e))?;
        let source_root = self
            .unpacker
            .unpack(&bytes, &work.path().join("src"))
            .map_err(|e| extract_error(&format!("{e:#}")))?;

        checkpoint(BuildStep::Compile)?;
        let output = work.path().join("out").join(&formula.name);
        let args = build_flags(formula, &output);
        info!(name = %name, toolchain = self.toolchain.name(), "compiling");
        debug!(name = %name, args = ?args, "toolchain arguments");
        match self.toolchain.invoke(&source_root, &args, self.toolchain_timeout, cancel) {
            Ok(out) if out.success() => {}
            Ok(out) => {
                return Err(BuildError::Toolchain { name, stderr: out.stderr.trim().to_string() });
            }
            Err(ProcessError::TimedOut { timeout, .. }) => {
                return Err(BuildError::ToolchainTimeout { name, timeout });
            }
            Err(ProcessError::Cancelled { .. }) => {
                return Err(BuildError::Cancelled { name, step: BuildStep::Compile });
            }
            Err(e) => {
                return Err(BuildError::Toolchain { name, stderr: e.to_string() });
            }
        }
        if !output.is_file() {
            return Err(BuildError::MissingArtifact { name, path: output });
        }

        checkpoint(BuildStep::Install)?;
        let installed = install_atomically(&output, destination, &formula.name)
            .map_err(|source| BuildError::Install {
                name: name.clone(),
                path: destination.to_path_buf(),
                source,
            })?;
        info!(name = %name, path = %installed.display(), "installed");
        Ok(installed)
    }
}

/// Copies `artifact` into a temporary file inside `destination` and renames
/// it to `destination/<file_name>`.
fn install_atomically(artifact: &Path, destination: &Path, file_name: &str) -> std::io::Result<PathBuf> {
    std::fs::create_dir_all(destination)?;
    let target = destination.join(file_name);
    let mut staged = tempfile::Builder::new()
        .prefix(&format!(".{file_name}-"))
        .tempfile_in(destination)?;
    let bytes = std::fs::read(artifact)?;
    staged.write_all(&bytes)?;
    staged.as_file().sync_all()?;
    make_executable(staged.path())?;
    staged.persist(&target).map_err(|e| e.error)?;
    Ok(target)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::tempdir;
    use crate::formula::tests::sample;

    pub(crate) struct FakeFetcher {
        pub bytes: Vec<u8>,
        pub evicted: AtomicUsize,
    }

    impl FakeFetcher {
        pub(crate) fn new(bytes: &[u8]) -> Self {
            Self { bytes: bytes.to_vec(), evicted: AtomicUsize::new(0) }
        }
    }

    impl SourceFetcher for FakeFetcher {
        fn fetch(&self, _url: &str, _cancel: &Cancellation) -> Result<Vec<u8>> {
            Ok(self.bytes.clone())
        }

        fn evict(&self, _url: &str) {
            self.evicted.fetch_add(1, Ordering::SeqCst);
        }
    }

    /// Writes the source bytes straight into a `main.go` file.
    pub(crate) struct FlatUnpacker;

    impl SourceUnpacker for FlatUnpacker {
        fn unpack(&self, bytes: &[u8], dest: &Path) -> Result<PathBuf> {
            std::fs::create_dir_all(dest)?;
            std::fs::write(dest.join("main.go"), bytes)?;
            Ok(dest.to_path_buf())
        }
    }

    /// Writes `artifact` to the `-o=` path, or fails with `stderr`.
    pub(crate) struct FakeToolchain {
        pub artifact: Vec<u8>,
        pub fail_with: Option<String>,
        pub calls: AtomicUsize,
        pub last_args: std::sync::Mutex<Vec<String>>,
    }

    impl FakeToolchain {
        pub(crate) fn producing(artifact: &[u8]) -> Self {
            Self {
                artifact: artifact.to_vec(),
                fail_with: None,
                calls: AtomicUsize::new(0),
                last_args: std::sync::Mutex::new(Vec::new()),
            }
        }
    }

    impl Toolchain for FakeToolchain {
        fn name(&self) -> &str {
            "fake"
        }

        fn invoke(
            &self,
            _source_dir: &Path,
            args: &[String],
            _timeout: Duration,
            _cancel: &Cancellation,
        ) -> std::result::Result<ProcessOutput, ProcessError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            *self.last_args.lock().unwrap() = args.to_vec();
            if let Some(stderr) = &self.fail_with {
                return Ok(ProcessOutput { code: Some(1), stdout: String::new(), stderr: stderr.clone() });
            }
            let output = args
                .iter()
                .find_map(|a| a.strip_prefix("-o="))
                .expect("output flag");
            let output = Path::new(output);
            std::fs::create_dir_all(output.parent().unwrap()).unwrap();
            std::fs::write(output, &self.artifact).unwrap();
            Ok(ProcessOutput { code: Some(0), ..Default::default() })
        }
    }

    const SOURCE: &[u8] = b"package main\nfunc main() {}\n";

    fn orchestrator(fetcher: Arc<FakeFetcher>, toolchain: Arc<FakeToolchain>) -> BuildOrchestrator {
        BuildOrchestrator::new(fetcher, Arc::new(FlatUnpacker), toolchain, Duration::from_secs(5))
    }

    #[test]
    fn test_build_flags_embed_metadata() {
        let formula = sample("zipcmt", "1.4.6", &sha256_hex(SOURCE));
        let args = build_flags(&formula, Path::new("/tmp/out/zipcmt"));
        assert_eq!(args[0], "build");
        assert_eq!(args[1], "-trimpath");
        assert_eq!(args[2], "-o=/tmp/out/zipcmt");
        assert_eq!(
            args[3],
            "-ldflags=-s -w -X main.version=1.4.6 -X main.commit=4bb4c718fb9825efb22539b9311165837faacddc -X main.date=2026-02-06T20:58:46+11:00"
        );
        assert_eq!(args.len(), 4);
        // Two -X pairs per constant plus -s and -w.
        assert_eq!(ldflags(&formula).split_whitespace().count(), 8);
    }

    #[test]
    fn test_build_flags_use_symbol_package_and_extra_flags() {
        let mut formula = sample("zipcmt", "1.4.6", &sha256_hex(SOURCE));
        formula.build.symbol_package = "github.com/bengarrett/zipcmt/internal/misc".into();
        formula.build.extra_flags = vec!["./cmd/zipcmt".into()];
        let args = build_flags(&formula, Path::new("out"));
        assert!(args[3].contains("-X github.com/bengarrett/zipcmt/internal/misc.commit="));
        assert_eq!(args.last().unwrap(), "./cmd/zipcmt");
    }

    /// Raises `cancel` once the first chunk has been handed out.
    struct CancellingReader {
        cancel: Cancellation,
        served: usize,
    }

    impl Read for CancellingReader {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            self.served += 1;
            self.cancel.cancel();
            buf[0] = b'x';
            Ok(1)
        }
    }

    #[test]
    fn test_download_reads_until_end() {
        let data = vec![7u8; DOWNLOAD_CHUNK * 2 + 3];
        let bytes = read_cancellable(std::io::Cursor::new(data.clone()), &Cancellation::new()).unwrap();
        assert_eq!(bytes, data);
    }

    #[test]
    fn test_download_stops_when_cancelled() {
        let cancel = Cancellation::new();
        let mut reader = CancellingReader { cancel: cancel.clone(), served: 0 };
        assert!(read_cancellable(&mut reader, &cancel).is_err());
        assert_eq!(reader.served, 1);
    }

    #[test]
    fn test_checksum_mismatch_never_invokes_toolchain() {
        let dest = tempdir().unwrap();
        let fetcher = Arc::new(FakeFetcher::new(b"tampered"));
        let toolchain = Arc::new(FakeToolchain::producing(b"binary"));
        let formula = sample("zipcmt", "1.4.6", &sha256_hex(SOURCE));

        let err = orchestrator(fetcher.clone(), toolchain.clone())
            .build(&formula, dest.path(), &Cancellation::new())
            .unwrap_err();
        assert!(matches!(err, BuildError::Integrity { .. }));
        assert_eq!(err.step(), BuildStep::Checksum);
        assert_eq!(toolchain.calls.load(Ordering::SeqCst), 0);
        assert_eq!(fetcher.evicted.load(Ordering::SeqCst), 1);
        assert_eq!(std::fs::read_dir(dest.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_successful_build_installs_binary() {
        let dest = tempdir().unwrap();
        let toolchain = Arc::new(FakeToolchain::producing(b"binary"));
        let formula = sample("zipcmt", "1.4.6", &sha256_hex(SOURCE));
        let path = orchestrator(Arc::new(FakeFetcher::new(SOURCE)), toolchain.clone())
            .build(&formula, &dest.path().join("bin"), &Cancellation::new())
            .unwrap();
        assert_eq!(path, dest.path().join("bin").join("zipcmt"));
        assert_eq!(std::fs::read(&path).unwrap(), b"binary");
        assert_eq!(toolchain.calls.load(Ordering::SeqCst), 1);
        assert!(toolchain.last_args.lock().unwrap()[3].contains("main.version=1.4.6"));
        // only the binary, no staging leftovers
        assert_eq!(std::fs::read_dir(dest.path().join("bin")).unwrap().count(), 1);
        #[cfg(unix)]
        assert!(crate::util::is_executable(&path));
    }

    #[test]
    fn test_toolchain_failure_installs_nothing() {
        let dest = tempdir().unwrap();
        let mut toolchain = FakeToolchain::producing(b"binary");
        toolchain.fail_with = Some("main.go:1: syntax error".into());
        let formula = sample("zipcmt", "1.4.6", &sha256_hex(SOURCE));
        let err = orchestrator(Arc::new(FakeFetcher::new(SOURCE)), Arc::new(toolchain))
            .build(&formula, dest.path(), &Cancellation::new())
            .unwrap_err();
        match &err {
            BuildError::Toolchain { stderr, .. } => assert_eq!(stderr, "main.go:1: syntax error"),
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(err.step(), BuildStep::Compile);
        assert_eq!(std::fs::read_dir(dest.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_missing_artifact_is_reported() {
        let dest = tempdir().unwrap();
        struct SilentToolchain;
        impl Toolchain for SilentToolchain {
            fn name(&self) -> &str {
                "silent"
            }
            fn invoke(
                &self,
                _: &Path,
                _: &[String],
                _: Duration,
                _: &Cancellation,
            ) -> std::result::Result<ProcessOutput, ProcessError> {
                Ok(ProcessOutput { code: Some(0), ..Default::default() })
            }
        }
        let formula = sample("zipcmt", "1.4.6", &sha256_hex(SOURCE));
        let orchestrator = BuildOrchestrator::new(
            Arc::new(FakeFetcher::new(SOURCE)),
            Arc::new(FlatUnpacker),
            Arc::new(SilentToolchain),
            Duration::from_secs(5),
        );
        let err = orchestrator.build(&formula, dest.path(), &Cancellation::new()).unwrap_err();
        assert!(matches!(err, BuildError::MissingArtifact { .. }));
    }

    #[test]
    fn test_cancelled_build_stops_before_fetch() {
        let dest = tempdir().unwrap();
        let toolchain = Arc::new(FakeToolchain::producing(b"binary"));
        let cancel = Cancellation::new();
        cancel.cancel();
        let formula = sample("zipcmt", "1.4.6", &sha256_hex(SOURCE));
        let err = orchestrator(Arc::new(FakeFetcher::new(SOURCE)), toolchain.clone())
            .build(&formula, dest.path(), &cancel)
            .unwrap_err();
        assert!(matches!(err, BuildError::Cancelled { step: BuildStep::Fetch, .. }));
        assert_eq!(toolchain.calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_rebuild_is_byte_identical() {
        let formula = sample("zipcmt", "1.4.6", &sha256_hex(SOURCE));
        let orchestrator = orchestrator(
            Arc::new(FakeFetcher::new(SOURCE)),
            Arc::new(FakeToolchain::producing(b"deterministic binary")),
        );
        let first = tempdir().unwrap();
        let second = tempdir().unwrap();
        let a = orchestrator.build(&formula, first.path(), &Cancellation::new()).unwrap();
        let b = orchestrator.build(&formula, second.path(), &Cancellation::new()).unwrap();
        assert_eq!(std::fs::read(a).unwrap(), std::fs::read(b).unwrap());
    }

    #[test]
    fn test_rebuild_replaces_existing_binary() {
        let dest = tempdir().unwrap();
        std::fs::write(dest.path().join("zipcmt"), b"old").unwrap();
        let formula = sample("zipcmt", "1.4.6", &sha256_hex(SOURCE));
        let path = orchestrator(
            Arc::new(FakeFetcher::new(SOURCE)),
            Arc::new(FakeToolchain::producing(b"new")),
        )
        .build(&formula, dest.path(), &Cancellation::new())
        .unwrap();
        assert_eq!(std::fs::read(path).unwrap(), b"new");
    }
}
