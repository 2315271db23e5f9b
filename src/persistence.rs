//! Session state persisted across daemon restarts
//!
//! The memento (selected unit name and opaque view state) changes often while
//! the user works, so writes go through a [`DebouncedWriter`]: every update
//! restarts a short timer and only the latest value is written when it
//! expires. A pending value is always flushed on drop.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, error, warn};

use crate::constants::persistence::{DEBOUNCE_MS, MEMENTO_PREFIX};

/// Coalescing background writer for one JSON file
pub struct DebouncedWriter<T: Serialize + Send + 'static> {
    tx: Option<Sender<T>>,
    worker: Option<JoinHandle<()>>,
    path: PathBuf,
}

impl<T: Serialize + Send + 'static> DebouncedWriter<T> {
    pub fn new(path: PathBuf) -> Result<Self> {
        Self::with_delay(path, Duration::from_millis(DEBOUNCE_MS))
    }

    pub fn with_delay(path: PathBuf, delay: Duration) -> Result<Self> {
        let (tx, rx) = mpsc::channel::<T>();
        let target = path.clone();
        let worker = std::thread::Builder::new()
            .name("persist".to_string())
            .spawn(move || {
                // Wait for the first update of a burst, then let it settle
                while let Ok(mut latest) = rx.recv() {
                    loop {
                        match rx.recv_timeout(delay) {
                            Ok(value) => latest = value,
                            Err(RecvTimeoutError::Timeout) => break,
                            Err(RecvTimeoutError::Disconnected) => {
                                write_or_log(&target, &latest);
                                return;
                            }
                        }
                    }
                    write_or_log(&target, &latest);
                }
            })
            .context("Failed to spawn persistence thread")?;
        Ok(Self {
            tx: Some(tx),
            worker: Some(worker),
            path,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Schedule `value` to be written, replacing any pending value
    pub fn update(&self, value: T) {
        if let Some(tx) = &self.tx {
            if tx.send(value).is_err() {
                warn!(path = %self.path.display(), "Persistence thread is gone, dropping update");
            }
        }
    }

    /// Write any pending value now and stop the worker
    pub fn flush(&mut self) {
        drop(self.tx.take());
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                error!(path = %self.path.display(), "Persistence thread panicked");
            }
        }
    }
}

impl<T: Serialize + Send + 'static> Drop for DebouncedWriter<T> {
    fn drop(&mut self) {
        self.flush();
    }
}

fn write_or_log<T: Serialize>(path: &Path, value: &T) {
    match write_atomic(path, value) {
        Ok(()) => debug!(path = %path.display(), "Persisted state"),
        Err(e) => error!(path = %path.display(), error = ?e, "Failed to persist state"),
    }
}

/// Write JSON to a sibling temp file and rename it over `path`
pub fn write_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .context(format!("Failed to create directory: {}", parent.display()))?;
    }
    let contents = serde_json::to_vec_pretty(value).context("Failed to serialize state")?;
    let tmp = path.with_extension("tmp");
    fs::write(&tmp, contents).context(format!("Failed to write {}", tmp.display()))?;
    fs::rename(&tmp, path).context(format!("Failed to replace {}", path.display()))?;
    Ok(())
}

/// Per-workspace session state
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct Memento {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_unit: Option<String>,
    #[serde(default)]
    pub view_state: BTreeMap<String, Value>,
}

impl Memento {
    pub fn path(storage_dir: &Path, workspace_hash: &str) -> PathBuf {
        storage_dir.join(format!("{MEMENTO_PREFIX}{workspace_hash}.json"))
    }

    /// Read a memento; a missing or unreadable file starts fresh
    pub fn load(path: &Path) -> Self {
        let contents = match fs::read(path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == ErrorKind::NotFound => return Self::default(),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Failed to read saved state");
                return Self::default();
            }
        };
        serde_json::from_slice(&contents).unwrap_or_else(|e| {
            warn!(path = %path.display(), error = %e, "Discarding malformed saved state");
            Self::default()
        })
    }
}

/// The memento plus its writer; every mutation schedules a write
pub struct MementoStore {
    memento: Memento,
    writer: DebouncedWriter<Memento>,
}

impl MementoStore {
    pub fn open(path: PathBuf) -> Result<Self> {
        let memento = Memento::load(&path);
        debug!(path = %path.display(), unit = ?memento.current_unit, "Loaded saved state");
        Ok(Self {
            memento,
            writer: DebouncedWriter::new(path)?,
        })
    }

    pub fn memento(&self) -> &Memento {
        &self.memento
    }

    pub fn set_current_unit(&mut self, name: Option<&str>) {
        if self.memento.current_unit.as_deref() == name {
            return;
        }
        self.memento.current_unit = name.map(str::to_string);
        self.writer.update(self.memento.clone());
    }

    pub fn set_view_state(&mut self, key: String, value: Value) {
        if value.is_null() {
            self.memento.view_state.remove(&key);
        } else {
            self.memento.view_state.insert(key, value);
        }
        self.writer.update(self.memento.clone());
    }

    pub fn flush(&mut self) {
        self.writer.flush();
    }
}
