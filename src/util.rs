use std::io::{Cursor, Read};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::thread;
use std::time::{Duration, Instant};
use anyhow::{bail, Context, Result};
use flate2::read::GzDecoder;
use sha2::{Digest, Sha256};
use tracing::{debug, warn};
use crate::error::ProcessError;

const POLL_INTERVAL: Duration = Duration::from_millis(20);

/// A cancellation flag shared between a caller and the work it started.
///
/// Cloning yields a handle to the same flag.
#[derive(Debug, Clone, Default)]
pub struct Cancellation(Arc<AtomicBool>);

impl Cancellation {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Strips the `sha256:` prefix from a hash if present and lowercases it.
/// This is useful for formatting hashes uniformly.
pub fn format_hash(hash: &str) -> String {
    let hash = hash.trim();
    hash.strip_prefix("sha256:").unwrap_or(hash).to_ascii_lowercase()
}

/// Returns the lowercase hex SHA-256 digest of `bytes`.
pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Whether `value` is a full lowercase hex SHA-256 digest.
pub fn is_sha256_hex(value: &str) -> bool {
    value.len() == 64 && value.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
}

/// Unpacks a gzip tarball or zip archive into `dest`, picking the format from
/// the leading magic bytes.
///
/// Returns the source root: the single top-level directory when the archive
/// has one (as forge tag archives do), otherwise `dest` itself.
pub fn extract_archive(bytes: &[u8], dest: &Path) -> Result<PathBuf> {
    std::fs::create_dir_all(dest)
        .with_context(|| format!("creating extraction directory {}", dest.display()))?;
    if bytes.starts_with(&[0x1f, 0x8b]) {
        let mut archive = tar::Archive::new(GzDecoder::new(Cursor::new(bytes)));
        archive
            .unpack(dest)
            .with_context(|| format!("unpacking tarball into {}", dest.display()))?;
    } else if bytes.starts_with(b"PK\x03\x04") {
        let mut archive = zip::ZipArchive::new(Cursor::new(bytes))?;
        archive
            .extract(dest)
            .with_context(|| format!("unpacking zip archive into {}", dest.display()))?;
    } else {
        bail!("unrecognised archive format");
    }

    let mut entries = std::fs::read_dir(dest)?
        .collect::<std::io::Result<Vec<_>>>()?;
    if entries.len() == 1 && entries[0].file_type()?.is_dir() {
        return Ok(entries.remove(0).path());
    }
    Ok(dest.to_path_buf())
}

/// Captured result of a finished external process.
#[derive(Debug, Clone, Default)]
pub struct ProcessOutput {
    /// Exit code, `None` when the process was killed by a signal.
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl ProcessOutput {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }

    /// Standard output followed by standard error.
    pub fn combined(&self) -> String {
        let mut out = self.stdout.clone();
        if !self.stderr.is_empty() {
            if !out.is_empty() && !out.ends_with('\n') {
                out.push('\n');
            }
            out.push_str(&self.stderr);
        }
        out
    }
}

/// Runs `command` to completion, killing it when `timeout` elapses or
/// `cancel` is raised.
///
/// Both output streams are drained on their own threads so a chatty child
/// never blocks on a full pipe. The deadline also covers those streams: a
/// background process that inherited them and outlives the child counts as
/// a timeout.
pub fn run_with_deadline(
    mut command: Command,
    timeout: Duration,
    cancel: &Cancellation,
) -> std::result::Result<ProcessOutput, ProcessError> {
    let program = command.get_program().to_string_lossy().to_string();
    command
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    let mut child = spawn_retrying_busy(&mut command)
        .map_err(|source| ProcessError::Spawn { program: program.clone(), source })?;
    debug!(program = %program, pid = child.id(), "spawned process");

    let stdout = child.stdout.take().map(drain);
    let stderr = child.stderr.take().map(drain);

    let deadline = Instant::now() + timeout;
    let status = loop {
        match child.try_wait() {
            Ok(Some(status)) => break status,
            Ok(None) => {}
            Err(source) => {
                let _ = child.kill();
                return Err(ProcessError::Io { program, source });
            }
        }
        if cancel.is_cancelled() {
            let _ = child.kill();
            let _ = child.wait();
            return Err(ProcessError::Cancelled { program });
        }
        if Instant::now() >= deadline {
            let _ = child.kill();
            let _ = child.wait();
            return Err(ProcessError::TimedOut { program, timeout });
        }
        thread::sleep(POLL_INTERVAL);
    };

    let stdout = collect(stdout, deadline, cancel).map_err(|e| e.into_error(&program, timeout))?;
    let stderr = collect(stderr, deadline, cancel).map_err(|e| e.into_error(&program, timeout))?;
    Ok(ProcessOutput { code: status.code(), stdout, stderr })
}

enum PipeWait {
    TimedOut,
    Cancelled,
}

impl PipeWait {
    fn into_error(self, program: &str, timeout: Duration) -> ProcessError {
        match self {
            PipeWait::TimedOut => {
                warn!(program, "output pipes still open after the process exited");
                ProcessError::TimedOut { program: program.to_string(), timeout }
            }
            PipeWait::Cancelled => ProcessError::Cancelled { program: program.to_string() },
        }
    }
}

/// Waits for a drained stream until `deadline`.
fn collect(
    pipe: Option<Receiver<Vec<u8>>>,
    deadline: Instant,
    cancel: &Cancellation,
) -> std::result::Result<String, PipeWait> {
    let Some(pipe) = pipe else {
        return Ok(String::new());
    };
    loop {
        let left = deadline.saturating_duration_since(Instant::now());
        match pipe.recv_timeout(left.min(POLL_INTERVAL)) {
            Ok(bytes) => return Ok(String::from_utf8_lossy(&bytes).to_string()),
            Err(RecvTimeoutError::Disconnected) => return Ok(String::new()),
            Err(RecvTimeoutError::Timeout) if left.is_zero() => return Err(PipeWait::TimedOut),
            Err(RecvTimeoutError::Timeout) => {}
        }
        if cancel.is_cancelled() {
            return Err(PipeWait::Cancelled);
        }
    }
}

fn drain<R: Read + Send + 'static>(mut reader: R) -> Receiver<Vec<u8>> {
    let (tx, rx) = mpsc::channel();
    thread::spawn(move || {
        let mut buf = Vec::new();
        let _ = reader.read_to_end(&mut buf);
        let _ = tx.send(buf);
    });
    rx
}

// A binary that was written a moment ago can still be held open by a
// concurrently forked child, which makes exec fail with ETXTBSY.
fn spawn_retrying_busy(command: &mut Command) -> std::io::Result<std::process::Child> {
    let mut attempts = 0;
    loop {
        match command.spawn() {
            Err(e) if e.kind() == std::io::ErrorKind::ExecutableFileBusy && attempts < 10 => {
                attempts += 1;
                thread::sleep(POLL_INTERVAL);
            }
            result => return result,
        }
    }
}

/// Marks a file executable for everyone on Unix.
#[cfg(unix)]
pub fn make_executable(path: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    let mut permissions = std::fs::metadata(path)?.permissions();
    permissions.set_mode(0o755);
    std::fs::set_permissions(path, permissions)
}

#[cfg(not(unix))]
pub fn make_executable(_path: &Path) -> std::io::Result<()> {
    Ok(())
}

/// Checks if a given path is an executable file on Unix.
#[cfg(unix)]
pub fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    std::fs::metadata(path)
        .map(|meta| meta.is_file() && meta.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

/// Checks if a given path has a Windows executable extension (.exe, .bat, .cmd).
#[cfg(windows)]
pub fn is_executable(path: &Path) -> bool {
    if let Some(ext) = path.extension().and_then(|ext| ext.to_str()) {
        let ext = ext.to_ascii_lowercase();
        matches!(ext.as_str(), "exe" | "bat" | "cmd")
    } else {
        false
    }
}
