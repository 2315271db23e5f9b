//! Configuration management
//!
//! This module provides the configuration of a workspace:
//! - **project**: `objdiff.json` model and its resolution step
//! - **store**: loading the project file and keeping the last good copy
//! - **properties**: host preferences (diff options) and their schema

pub mod project;
pub mod properties;
pub mod store;

// Re-export commonly used types
pub use project::{Metadata, ProgressCategory, ProjectConfig, Scratch, Unit, resolve};
pub use properties::{ConfigProperties, PreferenceStore, PropertyValue, get_modified};
pub use store::{ConfigStore, LoadOutcome};
