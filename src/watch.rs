//! File system watching and rebuild routing
//!
//! [`FileWatcher`] is a scoped handle around a `notify` watcher: dropping it
//! stops the events. [`FileChangeRouter`] compiles the project's watch
//! patterns and decides which workspace changes warrant a rebuild.

use std::path::{Path, PathBuf};

use globset::{GlobBuilder, GlobSet, GlobSetBuilder};
use notify::event::EventKind;
use notify::{Config, RecommendedWatcher, RecursiveMode, Watcher};
use tracing::{debug, warn};

/// A path that was created, modified or removed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileChange {
    pub path: PathBuf,
}

/// Live watch on a path, released on drop
pub struct FileWatcher {
    // Held for its Drop, which stops the OS watch
    _watcher: RecommendedWatcher,
    path: PathBuf,
}

impl std::fmt::Debug for FileWatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileWatcher").field("path", &self.path).finish()
    }
}

impl FileWatcher {
    pub fn new<F>(path: &Path, recursive: bool, on_change: F) -> Result<Self, notify::Error>
    where
        F: Fn(FileChange) + Send + 'static,
    {
        let mut watcher = RecommendedWatcher::new(
            move |res: notify::Result<notify::Event>| match res {
                Ok(event) => {
                    for change in map_event(event) {
                        on_change(change);
                    }
                }
                Err(e) => warn!(error = %e, "File watcher error"),
            },
            Config::default(),
        )?;
        let mode = if recursive {
            RecursiveMode::Recursive
        } else {
            RecursiveMode::NonRecursive
        };
        watcher.watch(path, mode)?;
        debug!(path = %path.display(), recursive, "Watching path");
        Ok(Self {
            _watcher: watcher,
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn map_event(event: notify::Event) -> Vec<FileChange> {
    match event.kind {
        EventKind::Create(_) | EventKind::Remove(_) | EventKind::Modify(_) => {}
        EventKind::Any | EventKind::Access(_) | EventKind::Other => return Vec::new(),
    }
    event
        .paths
        .into_iter()
        .map(|path| FileChange { path })
        .collect()
}

/// Every watcher owned by a workspace, torn down together
#[derive(Debug, Default)]
pub struct WatchHandles {
    pub config: Option<FileWatcher>,
    pub settings: Option<FileWatcher>,
    pub workspace: Option<FileWatcher>,
}

impl WatchHandles {
    /// Release every watch; safe to call more than once
    pub fn teardown(&mut self) {
        self.config = None;
        self.settings = None;
        self.workspace = None;
    }
}

/// Compiled watch patterns
///
/// Patterns without a `/` are matched against the file name only; patterns
/// with one are matched against the whole workspace-relative path. `*` never
/// crosses a directory boundary.
#[derive(Debug, Clone)]
pub struct PathMatcher {
    basename: GlobSet,
    full: GlobSet,
}

impl PathMatcher {
    /// `None` when no usable pattern remains; invalid patterns are skipped
    pub fn new(patterns: &[String]) -> Option<Self> {
        let mut basename = GlobSetBuilder::new();
        let mut full = GlobSetBuilder::new();
        let mut count = 0;
        for pattern in patterns {
            let glob = match GlobBuilder::new(pattern).literal_separator(true).build() {
                Ok(glob) => glob,
                Err(e) => {
                    warn!(pattern = %pattern, error = %e, "Ignoring invalid watch pattern");
                    continue;
                }
            };
            if pattern.contains('/') {
                full.add(glob);
            } else {
                basename.add(glob);
            }
            count += 1;
        }
        if count == 0 {
            return None;
        }
        Some(Self {
            basename: basename.build().ok()?,
            full: full.build().ok()?,
        })
    }

    pub fn is_match(&self, rel_path: &Path) -> bool {
        if self.full.is_match(rel_path) {
            return true;
        }
        rel_path
            .file_name()
            .is_some_and(|name| self.basename.is_match(Path::new(name)))
    }
}

/// Decides whether a workspace file event should trigger a rebuild
#[derive(Debug, Clone)]
pub struct FileChangeRouter {
    root: PathBuf,
    matcher: Option<PathMatcher>,
}

impl FileChangeRouter {
    pub fn new(root: &Path) -> Self {
        Self {
            root: root.to_path_buf(),
            matcher: None,
        }
    }

    /// Recompile for a new pattern list
    pub fn set_patterns(&mut self, patterns: &[String]) {
        self.matcher = PathMatcher::new(patterns);
        debug!(?patterns, active = self.matcher.is_some(), "Watch patterns updated");
    }

    /// False when there is nothing to match, so no watcher is needed
    pub fn is_active(&self) -> bool {
        self.matcher.is_some()
    }

    /// Workspace-relative path of `path`, if it lives under the root
    pub fn relative<'a>(&self, path: &'a Path) -> Option<&'a Path> {
        path.strip_prefix(&self.root).ok()
    }

    pub fn matches(&self, path: &Path) -> bool {
        let Some(matcher) = &self.matcher else {
            return false;
        };
        self.relative(path)
            .is_some_and(|rel| !rel.as_os_str().is_empty() && matcher.is_match(rel))
    }
}
