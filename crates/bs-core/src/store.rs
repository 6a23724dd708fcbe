//! The aggregate snapshot: in-memory state plus its on-disk JSON document.
//!
//! Readers get an immutable `Arc<AggregateState>`; merges build a new state
//! and swap it in, so a reader never sees half of a merge. The document is
//! replaced by writing a temp file in the same directory and renaming it over
//! the target, so a crash leaves either the old or the new document.

use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use chrono::Local;

use crate::types::{AggregateState, JobResult};

const TEMP_SUFFIX: &str = ".tmp";

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("failed to persist {path}: {source}")]
    PersistFailure {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to load {path}: {reason}")]
    Load { path: PathBuf, reason: String },
}

#[derive(Debug)]
pub struct AggregateStore {
    path: PathBuf,
    state: RwLock<Arc<AggregateState>>,
    dirty: AtomicBool,
    persist_lock: Mutex<()>,
}

impl AggregateStore {
    /// Open the store at `path`, loading the existing document if any.
    ///
    /// An unparsable document is renamed to `<name>.corrupt-<timestamp>` and
    /// the store starts empty. Temp files left by an interrupted persist are
    /// removed.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        remove_stale_temps(&path);

        let state = match std::fs::read(&path) {
            Ok(bytes) => match serde_json::from_slice::<AggregateState>(&bytes) {
                Ok(state) => {
                    tracing::info!(
                        path = %path.display(),
                        jobs = state.banks.len(),
                        "loaded snapshot"
                    );
                    state
                }
                Err(e) => {
                    let quarantine = quarantine_path(&path);
                    std::fs::rename(&path, &quarantine).map_err(|io| StoreError::Load {
                        path: path.clone(),
                        reason: format!("unparsable ({e}) and could not be moved aside: {io}"),
                    })?;
                    tracing::warn!(
                        path = %path.display(),
                        moved_to = %quarantine.display(),
                        error = %e,
                        "snapshot unparsable, starting empty"
                    );
                    AggregateState::default()
                }
            },
            Err(e) if e.kind() == io::ErrorKind::NotFound => AggregateState::default(),
            Err(e) => {
                return Err(StoreError::Load {
                    path,
                    reason: e.to_string(),
                })
            }
        };

        Ok(Self {
            path,
            state: RwLock::new(Arc::new(state)),
            dirty: AtomicBool::new(false),
            persist_lock: Mutex::new(()),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Current state. Cheap; the returned value never changes.
    pub fn snapshot(&self) -> Arc<AggregateState> {
        self.state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Fold one job result into the state. Only that job's entry changes.
    pub fn merge(&self, result: &JobResult) {
        let mut guard = self.state.write().unwrap_or_else(PoisonError::into_inner);
        let mut next = AggregateState::clone(&guard);
        next.apply(result);
        *guard = Arc::new(next);
        self.dirty.store(true, Ordering::SeqCst);
        tracing::debug!(job = %result.job_key, outcome = ?result.outcome, "merged job result");
    }

    /// True when the in-memory state has changes not yet on disk.
    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::SeqCst)
    }

    /// Write the current state to disk. Retries once; on a second failure
    /// the state stays in memory, flagged dirty.
    pub fn persist(&self) -> Result<(), StoreError> {
        let _serial = self
            .persist_lock
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let snapshot = self.snapshot();
        let json = serde_json::to_vec_pretty(&*snapshot).map_err(|e| StoreError::PersistFailure {
            path: self.path.clone(),
            source: io::Error::other(e),
        })?;

        let result = write_atomic(&self.path, &json, None).or_else(|e| {
            tracing::warn!(path = %self.path.display(), error = %e, "persist failed, retrying");
            write_atomic(&self.path, &json, None)
        });

        match result {
            Ok(()) => {
                // A merge that landed while writing keeps the flag set. The
                // read guard keeps merges out between the check and the clear.
                let current = self.state.read().unwrap_or_else(PoisonError::into_inner);
                if Arc::ptr_eq(&snapshot, &*current) {
                    self.dirty.store(false, Ordering::SeqCst);
                }
                drop(current);
                tracing::info!(path = %self.path.display(), bytes = json.len(), "snapshot persisted");
                Ok(())
            }
            Err(source) => {
                self.dirty.store(true, Ordering::SeqCst);
                tracing::error!(
                    path = %self.path.display(),
                    error = %source,
                    "persist failed, keeping state in memory"
                );
                Err(StoreError::PersistFailure {
                    path: self.path.clone(),
                    source,
                })
            }
        }
    }
}

/// Replace `path` with `bytes` via a temp file and rename in the same
/// directory. `mode` sets unix permissions on the new file.
pub(crate) fn write_atomic(path: &Path, bytes: &[u8], mode: Option<u32>) -> io::Result<()> {
    let dir = parent_dir(path);
    std::fs::create_dir_all(dir)?;

    let mut tmp = tempfile::Builder::new()
        .prefix(&temp_prefix(path))
        .suffix(TEMP_SUFFIX)
        .tempfile_in(dir)?;
    tmp.write_all(bytes)?;
    tmp.as_file().sync_all()?;

    if let Some(mode) = mode {
        set_mode(tmp.as_file(), mode)?;
    }

    tmp.persist(path).map_err(|e| e.error)?;

    sync_dir(dir);
    Ok(())
}

#[cfg(unix)]
fn set_mode(file: &std::fs::File, mode: u32) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    file.set_permissions(std::fs::Permissions::from_mode(mode))
}

#[cfg(not(unix))]
fn set_mode(_file: &std::fs::File, _mode: u32) -> io::Result<()> {
    Ok(())
}

/// Make a rename in `dir` durable.
#[cfg(unix)]
fn sync_dir(dir: &Path) {
    if let Ok(d) = std::fs::File::open(dir) {
        let _ = d.sync_all();
    }
}

#[cfg(not(unix))]
fn sync_dir(_dir: &Path) {}

fn parent_dir(path: &Path) -> &Path {
    match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    }
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "snapshot".into())
}

fn temp_prefix(path: &Path) -> String {
    format!(".{}.", file_name(path))
}

fn quarantine_path(path: &Path) -> PathBuf {
    let stamp = Local::now().format("%Y%m%dT%H%M%S");
    parent_dir(path).join(format!("{}.corrupt-{stamp}", file_name(path)))
}

fn remove_stale_temps(path: &Path) {
    let prefix = temp_prefix(path);
    let Ok(entries) = std::fs::read_dir(parent_dir(path)) else {
        return;
    };
    for entry in entries.flatten() {
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        if name.starts_with(&prefix) && name.ends_with(TEMP_SUFFIX) {
            match std::fs::remove_file(entry.path()) {
                Ok(()) => tracing::info!(file = name, "removed leftover temp file"),
                Err(e) => tracing::warn!(file = name, error = %e, "could not remove temp file"),
            }
        }
    }
}
