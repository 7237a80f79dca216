// Retention manager: what happens to artifacts around a job
//
// Every removal here is best-effort. Failures are logged and collected as
// RetentionWarning values; none of them fail the job.

use std::collections::HashMap;
use std::ffi::OsString;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use lazy_static::lazy_static;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::{debug, info, warn};

use super::errors::RetentionWarning;
use super::models::RetentionPolicy;

lazy_static! {
    static ref GATES: Mutex<HashMap<PathBuf, Arc<AsyncMutex<()>>>> = Mutex::new(HashMap::new());
}

/// Suffixes the engine uses for in-progress files
const PARTIAL_SUFFIXES: &[&str] = &[".part", ".ytdl"];

/// Handle to the shared output directory.
///
/// All handles for the same directory share one gate, so a purge never runs
/// while another job is writing or serving from it.
#[derive(Debug, Clone)]
pub struct OutputDirectory {
    root: PathBuf,
    gate: Arc<AsyncMutex<()>>,
}

impl OutputDirectory {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let key = std::fs::canonicalize(&root).unwrap_or_else(|_| root.clone());
        let gate = {
            let mut gates = GATES.lock().unwrap_or_else(|e| e.into_inner());
            gates.entry(key).or_default().clone()
        };
        Self { root, gate }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn ensure_exists(&self) -> io::Result<()> {
        std::fs::create_dir_all(&self.root)
    }

    /// Wait for exclusive use of the directory
    pub async fn lock(&self) -> OwnedMutexGuard<()> {
        self.gate.clone().lock_owned().await
    }

    /// Whether `path` exists and lies inside the directory
    pub fn contains(&self, path: &Path) -> bool {
        match (std::fs::canonicalize(&self.root), std::fs::canonicalize(path)) {
            (Ok(root), Ok(path)) => path.starts_with(root),
            _ => false,
        }
    }

    #[cfg(test)]
    fn shares_gate_with(&self, other: &OutputDirectory) -> bool {
        Arc::ptr_eq(&self.gate, &other.gate)
    }
}

/// Apply `policy` to `output_dir`.
///
/// `PurgeDirectoryBeforeNextJob` must be called before a job starts,
/// `DeleteAfterServe` only after the artifact has been handed off.
pub fn apply(
    policy: RetentionPolicy,
    final_path: Option<&Path>,
    output_dir: &Path,
    exceptions: &[String],
) -> Vec<RetentionWarning> {
    match policy {
        RetentionPolicy::Keep => Vec::new(),
        RetentionPolicy::PurgeDirectoryBeforeNextJob => purge(output_dir, exceptions),
        RetentionPolicy::DeleteAfterServe => match final_path {
            Some(path) => remove_quietly(path).into_iter().collect(),
            None => Vec::new(),
        },
    }
}

/// Remove every entry of `dir` whose name is not an exception (case-insensitive)
pub fn purge(dir: &Path, exceptions: &[String]) -> Vec<RetentionWarning> {
    purge_with(dir, exceptions, remove_entry)
}

fn purge_with<F>(dir: &Path, exceptions: &[String], mut remove: F) -> Vec<RetentionWarning>
where
    F: FnMut(&Path) -> io::Result<()>,
{
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Vec::new(),
        Err(e) => return vec![warning(dir, &e)],
    };

    let mut warnings = Vec::new();
    let mut removed = 0usize;
    for entry in entries {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                warnings.push(warning(dir, &e));
                continue;
            }
        };
        if is_exception(&entry.file_name(), exceptions) {
            continue;
        }

        let path = entry.path();
        match remove(&path) {
            Ok(()) => removed += 1,
            Err(e) => warnings.push(warning(&path, &e)),
        }
    }

    info!(dir = %dir.display(), removed, failed = warnings.len(), "purged output directory");
    warnings
}

fn is_exception(name: &OsString, exceptions: &[String]) -> bool {
    let name = name.to_string_lossy().to_lowercase();
    exceptions.iter().any(|e| e.to_lowercase() == name)
}

fn remove_entry(path: &Path) -> io::Result<()> {
    let meta = std::fs::symlink_metadata(path)?;
    if meta.is_dir() {
        std::fs::remove_dir_all(path)
    } else {
        std::fs::remove_file(path)
    }
}

/// Remove one file; a file that is already gone is not a failure
fn remove_quietly(path: &Path) -> Option<RetentionWarning> {
    match std::fs::remove_file(path) {
        Ok(()) => {
            debug!(path = %path.display(), "removed");
            None
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => None,
        Err(e) => Some(warning(path, &e)),
    }
}

fn warning(path: &Path, err: &io::Error) -> RetentionWarning {
    let warning = RetentionWarning {
        path: path.to_path_buf(),
        message: err.to_string(),
    };
    warn!("{}", warning);
    warning
}

/// Invokes the configured policy at the right points of a job's life
#[derive(Debug, Clone)]
pub struct RetentionManager {
    policy: RetentionPolicy,
    exceptions: Vec<String>,
}

impl RetentionManager {
    pub fn new(policy: RetentionPolicy, exceptions: Vec<String>) -> Self {
        Self { policy, exceptions }
    }

    pub fn exceptions(&self) -> &[String] {
        &self.exceptions
    }

    /// Whether jobs must hold the directory gate from purge through hand-off
    pub fn requires_gate(&self) -> bool {
        self.policy == RetentionPolicy::PurgeDirectoryBeforeNextJob
    }

    /// Call with the directory gate held, before the engine starts
    pub fn before_job(&self, dir: &OutputDirectory) -> Vec<RetentionWarning> {
        match self.policy {
            RetentionPolicy::PurgeDirectoryBeforeNextJob => apply(self.policy, None, dir.root(), &self.exceptions),
            _ => Vec::new(),
        }
    }

    /// Call once the artifact has been fully handed to the caller
    pub fn after_serve(&self, final_path: &Path, dir: &OutputDirectory) -> Vec<RetentionWarning> {
        match self.policy {
            RetentionPolicy::DeleteAfterServe => apply(self.policy, Some(final_path), dir.root(), &self.exceptions),
            _ => Vec::new(),
        }
    }

    /// Remove partially written artifacts of an interrupted or failed job,
    /// including the engine's `.part` / `.ytdl` companions
    pub fn cleanup_partial(&self, paths: &[PathBuf]) -> Vec<RetentionWarning> {
        let mut warnings = Vec::new();
        for path in paths {
            warnings.extend(remove_quietly(path));
            for suffix in PARTIAL_SUFFIXES {
                let mut sibling = path.clone().into_os_string();
                sibling.push(suffix);
                warnings.extend(remove_quietly(Path::new(&sibling)));
            }
        }
        warnings
    }
}
