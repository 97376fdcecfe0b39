//! Chunk planning and run identifiers.
//!
//! The tracker processes its input in fixed-size chunks of time steps, and it writes
//! its working files into `outdat` under names built from a per-run extension. Two
//! runs sharing an installation must never use the same extension, so identifiers
//! are allocated from a counter guarded by a lock file rather than drawn at random.
use std::{
    fmt::Display,
    fs::OpenOptions,
    io::Write,
    path::{Path, PathBuf},
    time::{Duration, Instant},
};

use error_stack::ResultExt;

use crate::error::PipelineError;

const COUNTER_FILE: &str = ".track_rs_run_counter";
const LOCK_FILE: &str = ".track_rs_run_counter.lock";

/// Number of chunks needed to cover `time_step_count` steps, `ceil(count / size)`.
pub fn plan_chunks(time_step_count: usize, chunk_size: usize) -> error_stack::Result<usize, PipelineError> {
    if time_step_count == 0 {
        return Err(PipelineError::invalid_input("time step count must be positive").into());
    }
    if chunk_size == 0 {
        return Err(PipelineError::invalid_input("chunk size must be positive").into());
    }
    Ok(time_step_count.div_ceil(chunk_size))
}

/// The token that distinguishes one run's files in the tracker's shared working area.
///
/// It is passed to the tracker as the file extension (`-f`), so it must be a plain
/// token without path separators or dots.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RunIdentifier(String);

impl RunIdentifier {
    fn from_counter(n: u64) -> Self {
        Self(format!("r{n:06}"))
    }

    /// An identifier derived from the input file and a timestamp. Two runs only
    /// collide if they start on the same input at the same instant.
    pub fn derived(input: &Path, timestamp: chrono::DateTime<chrono::Utc>) -> Self {
        let mut ctx = ring::digest::Context::new(&ring::digest::SHA256);
        ctx.update(input.to_string_lossy().as_bytes());
        ctx.update(b"\0");
        ctx.update(timestamp.to_rfc3339().as_bytes());
        let digest = ctx.finish();
        Self(format!("h{}", &hex::encode(digest.as_ref())[..12]))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for RunIdentifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Hands out strictly increasing run identifiers from a counter file in `dir`.
pub struct RunIdAllocator {
    counter_file: PathBuf,
    lock_file: PathBuf,
    timeout: Duration,
}

impl RunIdAllocator {
    pub fn new(dir: &Path) -> Self {
        Self {
            counter_file: dir.join(COUNTER_FILE),
            lock_file: dir.join(LOCK_FILE),
            timeout: Duration::from_secs(30),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn next_id(&self) -> error_stack::Result<RunIdentifier, PipelineError> {
        let _lock = LockFile::acquire(&self.lock_file, self.timeout)?;

        let current = match std::fs::read_to_string(&self.counter_file) {
            Ok(s) => s.trim().parse::<u64>()
                .change_context_lazy(|| PipelineError::io(&self.counter_file))
                .attach_printable("run counter file does not contain an integer")?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => 0,
            Err(e) => return Err(e).change_context_lazy(|| PipelineError::io(&self.counter_file)),
        };

        let next = current + 1;
        std::fs::write(&self.counter_file, format!("{next}\n"))
            .change_context_lazy(|| PipelineError::io(&self.counter_file))?;
        log::debug!("Allocated run number {next}");
        Ok(RunIdentifier::from_counter(next))
    }
}

/// An exclusively created file that is removed when dropped.
struct LockFile(PathBuf);

impl LockFile {
    fn acquire(path: &Path, timeout: Duration) -> error_stack::Result<Self, PipelineError> {
        let start = Instant::now();
        loop {
            match OpenOptions::new().write(true).create_new(true).open(path) {
                Ok(mut f) => {
                    // Owner's PID helps when a crashed run leaves the lock behind.
                    let _ = writeln!(f, "{}", std::process::id());
                    return Ok(Self(path.to_path_buf()));
                },
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    if start.elapsed() > timeout {
                        return Err(error_stack::Report::new(PipelineError::io(path)))
                            .attach_printable(format!(
                                "timed out waiting for the lock; if no other run is active, delete {}",
                                path.display()
                            ));
                    }
                    std::thread::sleep(Duration::from_millis(100));
                },
                Err(e) => return Err(e).change_context_lazy(|| PipelineError::io(path)),
            }
        }
    }
}

impl Drop for LockFile {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.0) {
            log::warn!("Could not remove lock file {}: {e}", self.0.display());
        }
    }
}
