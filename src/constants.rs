//! Application-wide constants
//!
//! This module contains all magic numbers and string literals used throughout
//! the application, providing a single source of truth for constant values.

/// Project configuration file constants
pub mod config {
    /// Project configuration filename, looked up at the workspace root
    pub const FILENAME: &str = "objdiff.json";

    /// Build command used when `custom_make` is absent
    pub const DEFAULT_BUILD_COMMAND: &str = "make";

    /// Display name for units that have neither a name nor a path
    pub const UNNAMED_UNIT: &str = "<unnamed>";

    /// Watch patterns used when the project config does not list any
    pub const DEFAULT_WATCH_PATTERNS: &[&str] = &[
        "*.c", "*.cp", "*.cpp", "*.cxx", "*.h", "*.hp", "*.hpp", "*.hxx", "*.s", "*.S", "*.asm",
        "*.inc", "*.py", "*.yml", "*.txt", "*.json",
    ];
}

/// Host preference (settings file) constants
pub mod settings {
    /// Section of the settings file holding our properties
    pub const SECTION: &str = "objdiff";

    /// Directory (relative to the workspace root) for workspace settings
    pub const WORKSPACE_DIR: &str = ".objdiff";

    /// Settings filename, both for user and workspace level
    pub const FILENAME: &str = "settings.json";

    /// Property holding the diff engine binary path
    pub const BINARY_PATH: &str = "binaryPath";
}

/// Per-user application directories
pub mod app {
    /// Directory name under the platform config/cache/runtime dirs
    pub const APP_DIR: &str = "objdiff-sync";

    /// Hex characters of the workspace hash used to namespace files
    pub const WORKSPACE_HASH_LEN: usize = 16;
}

/// Build orchestration constants
pub mod build {
    /// Task kind reported for object builds
    pub const TASK_BUILD: &str = "build";

    /// Task kind reported for diff engine runs
    pub const TASK_DIFF: &str = "diff";

    /// Prefix of the diff engine output file inside the storage directory
    pub const DIFF_OUTPUT_PREFIX: &str = "diff_";

    /// Extension of the diff engine output file
    pub const DIFF_OUTPUT_EXT: &str = "binpb";
}

/// Local state persistence constants
pub mod persistence {
    /// Delay before a pending memento is written (reset on every update)
    pub const DEBOUNCE_MS: u64 = 500;

    /// Prefix of the memento file inside the storage directory
    pub const MEMENTO_PREFIX: &str = "state_";
}

/// IPC transport constants
pub mod ipc {
    /// Maximum frame size (64 MB); object files travel inside state frames
    pub const MAX_MESSAGE_SIZE: usize = 64 * 1024 * 1024;

    /// Largest object file sent to views; its base64 form must fit in one frame
    pub const MAX_OBJECT_SIZE: usize = 40 * 1024 * 1024;

    /// Frames queued for one view before it is considered stalled
    pub const VIEW_QUEUE_CAPACITY: usize = 64;

    /// How long a write to a view may block before the view is dropped
    pub const VIEW_WRITE_TIMEOUT_MS: u64 = 5000;

    /// Socket file extension
    pub const SOCKET_EXT: &str = "sock";
}
